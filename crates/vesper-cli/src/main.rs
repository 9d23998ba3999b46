use std::{env, fs, path::Path, process::ExitCode};

use vesper::{FsResolver, Interpreter, StdEcho};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: vesper <script.vs>");
        return ExitCode::FAILURE;
    };
    let source = match read_file(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let root = Path::new(file_path).parent().map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
    let mut interpreter = Interpreter::with_parts(Box::new(StdEcho), Box::new(FsResolver::new(root)));
    let result = interpreter.interpret(&source, file_path);
    ExitCode::from(result.exit_code())
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => return Err(format!("cannot read {file_path}: {err}")),
    }
    fs::read_to_string(file_path).map_err(|err| format!("cannot read {file_path}: {err}"))
}
