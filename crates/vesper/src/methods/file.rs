//! Native methods on files.
//!
//! Reads go through the stored handle; line iteration re-reads the file
//! by path so it needs no cursor state on the object. Standard-stream
//! files (empty mode) refuse whole-file reads and iteration.

use std::fs;
use std::io::Write as _;

use crate::heap::HeapId;
use crate::object::{FileHandle, HeapData, NativeFn};
use crate::value::{display_string, Value};
use crate::vm::{Vm, VmError};

use super::{advance_index_key, iter_index, want_args};

pub(super) const ENTRIES: &[(&str, NativeFn)] = &[
    ("exists", exists),
    ("read", read),
    ("write", write),
    ("close", close),
    ("is_open", is_open),
    ("path", path),
    ("mode", mode),
    ("@iter", iter),
    ("@itern", itern),
];

fn recv_file(vm: &mut Vm, recv: Value) -> Result<HeapId, VmError> {
    if let Value::Obj(id) = recv {
        if matches!(vm.heap.get(id), HeapData::File(_)) {
            return Ok(id);
        }
    }
    Err(vm.raise("receiver is not a file"))
}

fn file_path(vm: &Vm, id: HeapId) -> String {
    match vm.heap.get(id) {
        HeapData::File(f) => display_string(f.path, &vm.heap),
        _ => String::new(),
    }
}

fn exists(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "exists")?;
    let id = recv_file(vm, recv)?;
    let path = file_path(vm, id);
    Ok(Value::Bool(fs::metadata(path).is_ok()))
}

/// Reads the whole file as a string.
fn read(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "read")?;
    let id = recv_file(vm, recv)?;
    let is_std = match vm.heap.get(id) {
        HeapData::File(f) => f.is_std(),
        _ => false,
    };
    if is_std {
        return Err(vm.raise("cannot read a standard stream as a whole file"));
    }
    let path = file_path(vm, id);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(vm.intern(&text)),
        Err(error) => Err(vm.raise(&format!("could not read '{path}': {error}"))),
    }
}

/// Writes a string through the stored handle; standard output streams
/// route to the echo sink.
fn write(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "write")?;
    let id = recv_file(vm, recv)?;
    let Value::Obj(text_id) = args[0] else {
        return Err(vm.raise("write() expects a string"));
    };
    let text = match vm.heap.get(text_id) {
        HeapData::Str(s) => s.as_str().to_owned(),
        _ => return Err(vm.raise("write() expects a string")),
    };

    let stream = match vm.heap.get(id) {
        HeapData::File(f) => match f.handle {
            FileHandle::Stdout => Some(true),
            FileHandle::Stderr => Some(false),
            _ => None,
        },
        _ => None,
    };
    if let Some(to_out) = stream {
        if to_out {
            vm.echo_out(&text);
        } else {
            vm.echo_err(&text);
        }
        return Ok(Value::Number(text.len() as f64));
    }

    let written = match vm.heap.get_mut(id) {
        HeapData::File(f) => {
            if !f.is_open {
                None
            } else {
                match &mut f.handle {
                    FileHandle::Disk(handle) => handle.write_all(text.as_bytes()).ok().map(|()| text.len()),
                    _ => None,
                }
            }
        }
        _ => None,
    };
    match written {
        Some(count) => Ok(Value::Number(count as f64)),
        None => Err(vm.raise("file is not open for writing")),
    }
}

/// Closes the handle. Standard streams are never closed.
fn close(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "close")?;
    let id = recv_file(vm, recv)?;
    if let HeapData::File(f) = vm.heap.get_mut(id) {
        if !f.is_std() {
            f.handle = FileHandle::None;
            f.is_open = false;
        }
    }
    Ok(Value::Nil)
}

fn is_open(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "is_open")?;
    let id = recv_file(vm, recv)?;
    let open = match vm.heap.get(id) {
        HeapData::File(f) => f.is_open,
        _ => false,
    };
    Ok(Value::Bool(open))
}

fn path(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "path")?;
    let id = recv_file(vm, recv)?;
    match vm.heap.get(id) {
        HeapData::File(f) => Ok(f.path),
        _ => Ok(Value::Nil),
    }
}

fn mode(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "mode")?;
    let id = recv_file(vm, recv)?;
    match vm.heap.get(id) {
        HeapData::File(f) => Ok(f.mode),
        _ => Ok(Value::Nil),
    }
}

fn read_lines(vm: &mut Vm, id: HeapId) -> Result<Vec<String>, VmError> {
    let is_std = match vm.heap.get(id) {
        HeapData::File(f) => f.is_std(),
        _ => false,
    };
    if is_std {
        return Err(vm.raise("cannot iterate a standard stream"));
    }
    let path = file_path(vm, id);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(text.lines().map(str::to_owned).collect()),
        Err(error) => Err(vm.raise(&format!("could not read '{path}': {error}"))),
    }
}

/// Line at the iteration key.
fn iter(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@iter")?;
    let id = recv_file(vm, recv)?;
    let lines = read_lines(vm, id)?;
    let at = iter_index(vm, args[0], lines.len(), "@iter")?;
    Ok(vm.intern(&lines[at]))
}

fn itern(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@itern")?;
    let id = recv_file(vm, recv)?;
    let lines = read_lines(vm, id)?;
    advance_index_key(vm, args[0], lines.len())
}
