//! End-to-end interpreter tests: source text in, captured output out.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use vesper::{
    CollectEcho, Interpreter, InterpretResult, MemoryResolver, NativeModuleDef, Value, Vm, VmError,
};

struct Run {
    result: InterpretResult,
    out: Rc<RefCell<String>>,
    err: Rc<RefCell<String>>,
}

impl Run {
    fn out(&self) -> String {
        self.out.borrow().clone()
    }

    fn err(&self) -> String {
        self.err.borrow().clone()
    }
}

fn run(source: &str) -> Run {
    run_with(source, MemoryResolver::new(), |_| {})
}

fn run_with(source: &str, resolver: MemoryResolver, setup: impl FnOnce(&mut Interpreter)) -> Run {
    let echo = CollectEcho::new();
    let out = echo.out_handle();
    let err = echo.err_handle();
    let mut interpreter = Interpreter::with_parts(Box::new(echo), Box::new(resolver));
    setup(&mut interpreter);
    let result = interpreter.interpret(source, "test.vs");
    Run { result, out, err }
}

fn run_ok(source: &str) -> String {
    let run = run(source);
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    run.out()
}

// ----------------------------------------------------------------------
// The concrete end-to-end scenarios.

#[test]
fn for_in_over_range_sums() {
    assert_eq!(run_ok("var x = 0; for i in 0..5 { x += i }; echo x"), "10\n");
}

#[test]
fn variadic_tail_collects_surplus() {
    let source = "def f(a, ...) { return __args__.length() }\necho f(1, 2, 3, 4)";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn inherited_property_defaults_seed_instances() {
    let source = "class A { var n = 1 }\nclass B < A {}\necho B().n";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn caught_exception_exposes_message_and_continues() {
    let source = "try { die Exception(\"x\") } catch Exception e { echo e.message }\necho \"after\"";
    assert_eq!(run_ok(source), "x\nafter\n");
}

#[test]
fn string_indexing_and_slicing() {
    assert_eq!(run_ok("echo \"abc\"[1]"), "b\n");
    assert_eq!(run_ok("echo \"abc\"[-1]"), "c\n");
    assert_eq!(run_ok("echo \"abc\"[1,]"), "bc\n");
}

#[test]
fn dict_index_assignment_grows_keys() {
    let source = "var d = {a: 1}\nd[\"b\"] = 2\necho d.keys().length()";
    assert_eq!(run_ok(source), "2\n");
}

// ----------------------------------------------------------------------
// Expressions and operators.

#[test]
fn arithmetic_operators() {
    assert_eq!(run_ok("echo 1 + 2 * 3"), "7\n");
    assert_eq!(run_ok("echo 7 // 2"), "3\n");
    assert_eq!(run_ok("echo 2 ** 10"), "1024\n");
    assert_eq!(run_ok("echo 7 % 4"), "3\n");
    assert_eq!(run_ok("echo -(2 + 3)"), "-5\n");
}

#[test]
fn bitwise_operators_truncate() {
    assert_eq!(run_ok("echo 6 & 3"), "2\n");
    assert_eq!(run_ok("echo 6 | 3"), "7\n");
    assert_eq!(run_ok("echo 6 ^ 3"), "5\n");
    assert_eq!(run_ok("echo 1 << 4"), "16\n");
    assert_eq!(run_ok("echo 32 >> 2"), "8\n");
    assert_eq!(run_ok("echo ~0"), "-1\n");
}

#[test]
fn comparison_chains_and_logic() {
    assert_eq!(run_ok("echo 1 < 2"), "true\n");
    assert_eq!(run_ok("echo \"a\" < \"b\""), "true\n");
    assert_eq!(run_ok("echo 2 <= 2"), "true\n");
    assert_eq!(run_ok("echo 1 != 2"), "true\n");
    assert_eq!(run_ok("echo 1 and 2"), "2\n");
    assert_eq!(run_ok("echo nil or \"fallback\""), "fallback\n");
}

#[test]
fn ternary_and_truthiness() {
    // Zero is truthy; negative numbers, empty strings and `empty` are not.
    assert_eq!(run_ok("echo 0 ? \"t\" : \"f\""), "t\n");
    assert_eq!(run_ok("echo -1 ? \"t\" : \"f\""), "f\n");
    assert_eq!(run_ok("echo \"\" ? \"t\" : \"f\""), "f\n");
    assert_eq!(run_ok("echo empty ? \"t\" : \"f\""), "f\n");
}

#[test]
fn numeric_literal_radixes() {
    assert_eq!(run_ok("echo 0b101 + 0c17 + 0xFF"), "275\n");
    assert_eq!(run_ok("echo 1.5e2"), "150\n");
}

#[test]
fn string_interpolation_stringifies() {
    let source = "var n = 3\necho \"n is ${n}, twice is ${n * 2}!\"";
    assert_eq!(run_ok(source), "n is 3, twice is 6!\n");
}

#[test]
fn list_repeat_and_concat_laws() {
    assert_eq!(run_ok("echo ([1, 2] * 3).length()"), "6\n");
    assert_eq!(run_ok("echo ([1] * 0).length()"), "0\n");
    assert_eq!(run_ok("echo [1, 2] + [3]"), "[1, 2, 3]\n");
    assert_eq!(run_ok("echo \"ab\" + \"\""), "ab\n");
}

#[test]
fn range_to_list_length_law() {
    assert_eq!(run_ok("echo (1..6).to_list().length()"), "5\n");
    assert_eq!(run_ok("echo (1..6).to_list()"), "[1, 2, 3, 4, 5]\n");
    assert_eq!(run_ok("echo (5..1).to_list()"), "[5, 4, 3, 2]\n");
}

// ----------------------------------------------------------------------
// Statements and control flow.

#[test]
fn while_with_break_and_continue() {
    let source = "var total = 0\nvar i = 0\nwhile true {\n  i += 1\n  if i > 10 break\n  if i % 2 == 0 continue\n  total += i\n}\necho total";
    assert_eq!(run_ok(source), "25\n");
}

#[test]
fn do_while_runs_at_least_once() {
    assert_eq!(run_ok("var i = 0\ndo {\n  i += 1\n} while i < 5\necho i"), "5\n");
    assert_eq!(run_ok("var i = 9\ndo {\n  i += 1\n} while false\necho i"), "10\n");
}

#[test]
fn c_style_for_loop() {
    let source = "var total = 0\nfor (var i = 0; i < 5; i += 1) {\n  total += i\n}\necho total";
    assert_eq!(run_ok(source), "10\n");
}

#[test]
fn break_inside_for_in_leaves_scope_clean() {
    let source = "var found = nil\nfor x in [1, 2, 3] {\n  if x == 2 {\n    found = x\n    break\n  }\n}\necho found\necho \"ok\"";
    assert_eq!(run_ok(source), "2\nok\n");
}

#[test]
fn for_in_over_dict_yields_keys_and_values() {
    let source = "var d = {a: 1, b: 2}\nvar out = \"\"\nfor k, v in d {\n  out += \"${k}=${v};\"\n}\necho out";
    assert_eq!(run_ok(source), "a=1;b=2;\n");
}

#[test]
fn for_in_over_string_and_bytes() {
    let source = "var out = \"\"\nfor c in \"abc\" {\n  out += c\n  out += \".\"\n}\necho out";
    assert_eq!(run_ok(source), "a.b.c.\n");
}

#[test]
fn using_when_dispatches_on_constants() {
    let source = "def pick(x) {\n  using x {\n    when 1, 2 { return \"low\" }\n    when \"hi\" { return \"greet\" }\n    default { return \"other\" }\n  }\n}\necho pick(1)\necho pick(2)\necho pick(\"hi\")\necho pick(9)";
    assert_eq!(run_ok(source), "low\nlow\ngreet\nother\n");
}

#[test]
fn using_without_default_falls_through() {
    let source = "using 42 {\n  when 1 { echo \"one\" }\n}\necho \"past\"";
    assert_eq!(run_ok(source), "past\n");
}

#[test]
fn duplicate_when_constant_is_a_compile_error() {
    let source = "using 1 {\n  when 2 { echo \"a\" }\n  when 2 { echo \"b\" }\n}";
    let run = run(source);
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.err().contains("duplicate 'when' value"), "err: {}", run.err());
}

// ----------------------------------------------------------------------
// Functions, closures, upvalues.

#[test]
fn closure_counter_shares_state() {
    let source = "def counter() {\n  var n = 0\n  return || {\n    n += 1\n    return n\n  }\n}\nvar c = counter()\nc()\nc()\necho c()";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn two_closures_see_the_same_variable() {
    let source = "def make() {\n  var n = 0\n  var inc = || {\n    n += 1\n    return nil\n  }\n  var get = || {\n    return n\n  }\n  inc()\n  inc()\n  echo get()\n}\nmake()";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn under_supplied_arguments_pad_with_nil() {
    let source = "def f(a, b) { return b }\necho f(1) == nil";
    assert_eq!(run_ok(source), "true\n");
}

#[test]
fn over_supplied_fixed_call_raises() {
    let run = run("def f(a) { return a }\nf(1, 2)");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("too many arguments"), "err: {}", run.err());
}

#[test]
fn lambda_parameters_work() {
    let source = "var add = |a, b| {\n  return a + b\n}\necho add(2, 3)";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn deep_recursion_overflows_cleanly() {
    let run = run("def f(n) { return f(n + 1) }\nf(0)");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("stack overflow"), "err: {}", run.err());
}

// ----------------------------------------------------------------------
// Classes.

#[test]
fn initializer_and_parent_dispatch() {
    let source = "class Animal {\n  var name = \"animal\"\n  Animal(name) {\n    self.name = name\n  }\n  speak() {\n    return \"${self.name} makes a sound\"\n  }\n}\nclass Dog < Animal {\n  speak() {\n    return parent.speak() + \" (woof)\"\n  }\n}\necho Dog(\"rex\").speak()";
    assert_eq!(run_ok(source), "rex makes a sound (woof)\n");
}

#[test]
fn parent_call_reinvokes_same_method() {
    let source = "class A {\n  tag() { return \"a\" }\n}\nclass B < A {\n  tag() { return parent() + \"b\" }\n}\necho B().tag()";
    assert_eq!(run_ok(source), "ab\n");
}

#[test]
fn static_members_live_on_the_class() {
    let source = "class Counter {\n  static var count = 7\n  static bump() { return 1 }\n}\necho Counter.count\necho Counter.bump()";
    assert_eq!(run_ok(source), "7\n1\n");
}

#[test]
fn private_methods_are_sealed_from_outside() {
    let ok = run_ok(
        "class A {\n  _secret() { return 41 }\n  reveal() { return self._secret() + 1 }\n}\necho A().reveal()",
    );
    assert_eq!(ok, "42\n");

    let run = run("class A {\n  _secret() { return 41 }\n}\nA()._secret()");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("private"), "err: {}", run.err());
}

#[test]
fn instance_fields_are_per_instance() {
    let source = "class Box { var v = 0 }\nvar a = Box()\nvar b = Box()\na.v = 5\necho a.v\necho b.v";
    assert_eq!(run_ok(source), "5\n0\n");
}

#[test]
fn calling_a_class_without_initializer_rejects_arguments() {
    let run = run("class A {}\nA(1)");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("takes no arguments"), "err: {}", run.err());
}

#[test]
fn user_classes_can_be_iterable() {
    let source = "class Pair {\n  @itern(k) {\n    if k == nil return 0\n    if k < 1 return k + 1\n    return false\n  }\n  @iter(k) {\n    return k == 0 ? \"first\" : \"second\"\n  }\n}\nvar out = \"\"\nfor v in Pair() {\n  out += v\n  out += \" \"\n}\necho out";
    assert_eq!(run_ok(source), "first second \n");
}

// ----------------------------------------------------------------------
// Exceptions.

#[test]
fn finally_runs_on_both_paths() {
    let source = "var log = \"\"\ntry {\n  log += \"try \"\n} finally {\n  log += \"finally\"\n}\necho log";
    assert_eq!(run_ok(source), "try finally\n");

    let source = "var log = \"\"\ntry {\n  die Exception(\"boom\")\n} catch Exception e {\n  log += \"caught ${e.message}\"\n} finally {\n  log += \" finally\"\n}\necho log";
    assert_eq!(run_ok(source), "caught boom finally\n");
}

#[test]
fn finally_reraises_unmatched_exceptions() {
    let source = "def risky() {\n  try {\n    die Exception(\"inner\")\n  } finally {\n    echo \"cleanup\"\n  }\n}\ntry { risky() } catch Exception e { echo e.message }";
    assert_eq!(run_ok(source), "cleanup\ninner\n");
}

#[test]
fn exception_subclasses_match_parent_handlers() {
    let source = "class IoError < Exception {}\ntry {\n  die IoError(\"disk\")\n} catch Exception e {\n  echo e.message\n}";
    assert_eq!(run_ok(source), "disk\n");
}

#[test]
fn handlers_unwind_through_call_frames() {
    let source = "def inner() { die Exception(\"deep\") }\ndef outer() { inner() }\ntry { outer() } catch Exception e { echo e.message }";
    assert_eq!(run_ok(source), "deep\n");
}

#[test]
fn stacktrace_lines_follow_the_format() {
    let source = "try { die Exception(\"x\") } catch Exception e { echo e.stacktrace }";
    let out = run_ok(source);
    assert!(out.contains("    test.vs:1 -> test()"), "out: {out}");
}

#[test]
fn unhandled_exception_reports_and_fails() {
    let run = run("die Exception(\"kaboom\")");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    let err = run.err();
    assert!(err.contains("Unhandled Exception: kaboom"), "err: {err}");
    assert!(err.contains("test.vs:1 -> test()"), "err: {err}");
}

#[test]
fn die_requires_an_exception_instance() {
    let run = run("die 42");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("instance of Exception"), "err: {}", run.err());
}

#[test]
fn assert_raises_with_message() {
    assert_eq!(run_ok("assert 1 == 1\necho \"fine\""), "fine\n");

    let run = run("assert 1 == 2, \"math is broken\"");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("assertion failed: math is broken"), "err: {}", run.err());
}

#[test]
fn runtime_faults_are_catchable() {
    let source = "try {\n  echo missing_name\n} catch Exception e {\n  echo \"caught: ${e.message}\"\n}";
    assert_eq!(run_ok(source), "caught: undefined variable 'missing_name'\n");
}

// ----------------------------------------------------------------------
// Built-in methods.

#[test]
fn string_methods_work() {
    assert_eq!(run_ok("echo \"Hello\".upper()"), "HELLO\n");
    assert_eq!(run_ok("echo \"a,b,c\".split(\",\")"), "['a', 'b', 'c']\n");
    assert_eq!(run_ok("echo \"-\".join([1, 2, 3])"), "1-2-3\n");
    assert_eq!(run_ok("echo \"  pad  \".trim()"), "pad\n");
    assert_eq!(run_ok("echo \"hello\".index_of(\"ll\")"), "2\n");
    assert_eq!(run_ok("echo \"hello\".starts_with(\"he\")"), "true\n");
    assert_eq!(run_ok("echo \"42\".to_number() + 1"), "43\n");
}

#[test]
fn case_predicates_require_an_alphabetic_character() {
    assert_eq!(run_ok("echo \"abc1\".is_lower()"), "true\n");
    assert_eq!(run_ok("echo \"Abc\".is_lower()"), "false\n");
    assert_eq!(run_ok("echo \"123\".is_lower()"), "false\n");
    assert_eq!(run_ok("echo \"\".is_upper()"), "false\n");
    assert_eq!(run_ok("echo \"AB2\".is_upper()"), "true\n");
}

#[test]
fn regex_literal_strings_drive_matching() {
    assert_eq!(run_ok("echo \"hello world\".replace(\"/o/\", \"0\")"), "hell0 w0rld\n");
    assert_eq!(run_ok("echo \"abc123\".matches(\"/[0-9]+/\")"), "true\n");
    assert_eq!(run_ok("echo \"abc123\".match(\"/[0-9]+/\")"), "123\n");
    assert_eq!(run_ok("echo \"ABC\".matches(\"/abc/i\")"), "true\n");
    // Plain strings fall back to substring semantics.
    assert_eq!(run_ok("echo \"a.b\".replace(\".\", \"-\")"), "a-b\n");
}

#[test]
fn list_methods_work() {
    assert_eq!(run_ok("var l = [3, 1, 2]\nl.sort()\necho l"), "[1, 2, 3]\n");
    assert_eq!(run_ok("var l = [1]\nl.append(2)\nl.extend([3, 4])\necho l.length()"), "4\n");
    assert_eq!(run_ok("echo [1, 2, 3].reverse()"), "[3, 2, 1]\n");
    assert_eq!(run_ok("echo [1, 2, 3].contains(2)"), "true\n");
    assert_eq!(run_ok("echo [1, 2, 3].index_of(9)"), "-1\n");
    assert_eq!(run_ok("var l = [1, 2, 3]\necho l.pop()\necho l.length()"), "3\n2\n");
}

#[test]
fn dict_methods_work() {
    assert_eq!(run_ok("echo {a: 1, b: 2}.values()"), "[1, 2]\n");
    assert_eq!(run_ok("echo {a: 1}.get(\"z\", 9)"), "9\n");
    assert_eq!(run_ok("echo {a: 1}.contains(\"a\")"), "true\n");
    assert_eq!(run_ok("var d = {a: 1}\nd.remove(\"a\")\necho d.length()"), "0\n");
}

#[test]
fn bytes_roundtrip_through_string() {
    let source = "var b = \"hi\".to_bytes()\necho b.length()\nb.append(33)\necho b.to_string()";
    assert_eq!(run_ok(source), "2\nhi!\n");
}

#[test]
fn dict_rejects_container_keys() {
    let run = run("var d = {}\nd[[1]] = 2");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("dictionary key"), "err: {}", run.err());
}

#[test]
fn missing_dict_key_raises() {
    let run = run("var d = {a: 1}\necho d[\"zzz\"]");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("has no key"), "err: {}", run.err());
}

#[test]
fn index_assignment_type_checks_bytes() {
    let run = run("var b = \"a\".to_bytes()\nb[0] = 900");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("0..255"), "err: {}", run.err());
}

#[test]
fn strings_are_not_index_assignable() {
    let run = run("var s = \"abc\"\ns[0] = \"z\"");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("immutable"), "err: {}", run.err());
}

// ----------------------------------------------------------------------
// Imports.

#[test]
fn imports_bind_the_module_namespace() {
    let mut resolver = MemoryResolver::new();
    resolver.add("mathx", "def double(x) { return x * 2 }\nvar pi = 3\n");
    let run = run_with("import mathx\necho mathx.double(21)\necho mathx.pi", resolver, |_| {});
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    assert_eq!(run.out(), "42\n3\n");
}

#[test]
fn selective_import_copies_and_ejects() {
    let mut resolver = MemoryResolver::new();
    resolver.add("mathx", "def double(x) { return x * 2 }\n");
    let source = "import mathx { double }\necho double(4)\ntry { echo mathx } catch Exception e { echo \"gone\" }";
    let run = run_with(source, resolver, |_| {});
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    assert_eq!(run.out(), "8\ngone\n");
}

#[test]
fn import_all_copies_everything() {
    let mut resolver = MemoryResolver::new();
    resolver.add("consts", "var one = 1\nvar two = 2\n");
    let run = run_with("import consts { * }\necho one + two", resolver, |_| {});
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    assert_eq!(run.out(), "3\n");
}

#[test]
fn module_top_level_runs_once() {
    let mut resolver = MemoryResolver::new();
    resolver.add("loud", "echo \"loaded\"\n");
    let run = run_with("import loud\nimport loud\necho \"end\"", resolver, |_| {});
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    assert_eq!(run.out(), "loaded\nend\n");
}

#[test]
fn import_alias_renames_the_binding() {
    let mut resolver = MemoryResolver::new();
    resolver.add("deep/util", "var marker = \"here\"\n");
    let run = run_with("import deep.util as u\necho u.marker", resolver, |_| {});
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    assert_eq!(run.out(), "here\n");
}

#[test]
fn missing_module_is_a_compile_error() {
    let run = run("import nowhere");
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.err().contains("not found"), "err: {}", run.err());
}

#[test]
fn module_values_are_private_behind_underscore() {
    let mut resolver = MemoryResolver::new();
    resolver.add("secretive", "var _hidden = 1\nvar open = 2\n");
    let source = "import secretive\necho secretive.open\nsecretive._hidden";
    let run = run_with(source, resolver, |_| {});
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert_eq!(run.out(), "2\n");
    assert!(run.err().contains("private"), "err: {}", run.err());
}

// ----------------------------------------------------------------------
// Native modules.

fn native_ticks(_vm: &mut Vm, _recv: Value, _args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Number(42.0))
}

fn native_greet(vm: &mut Vm, _recv: Value, args: &[Value]) -> Result<Value, VmError> {
    let who = args.first().map_or_else(|| "nobody".to_owned(), |value| vm.display(*value));
    Ok(vm.make_string(&format!("hello {who}")))
}

fn native_version(vm: &mut Vm) -> Value {
    vm.make_string("1.0")
}

fn clock_module() -> NativeModuleDef {
    NativeModuleDef {
        name: "_clock",
        fields: vec![("version", native_version)],
        functions: vec![("ticks", native_ticks), ("greet", native_greet)],
        classes: vec![],
        preloader: None,
        unloader: None,
    }
}

#[test]
fn native_modules_register_and_import() {
    let source = "import _clock\necho _clock.ticks()\necho _clock.version\necho _clock.greet(\"vm\")";
    let run = run_with(source, MemoryResolver::new(), |interpreter| {
        interpreter.register_native_module(clock_module());
    });
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    assert_eq!(run.out(), "42\n1.0\nhello vm\n");
}

#[test]
fn native_module_selective_import() {
    let source = "import _clock { ticks }\necho ticks()";
    let run = run_with(source, MemoryResolver::new(), |interpreter| {
        interpreter.register_native_module(clock_module());
    });
    assert_eq!(run.result, InterpretResult::Ok, "diagnostics: {}", run.err());
    assert_eq!(run.out(), "42\n");
}

#[test]
fn unregistered_native_module_fails_at_compile_time() {
    let run = run("import _nope");
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.err().contains("not registered"), "err: {}", run.err());
}

// ----------------------------------------------------------------------
// Errors and recovery.

#[test]
fn syntax_errors_report_location_and_fail_compile() {
    let run = run("var = 5");
    assert_eq!(run.result, InterpretResult::CompileError);
    let err = run.err();
    assert!(err.contains("SyntaxError"), "err: {err}");
    assert!(err.contains("test.vs:1"), "err: {err}");
}

#[test]
fn panic_mode_surfaces_multiple_diagnostics() {
    let run = run("var = 1\nvar = 2\n");
    assert_eq!(run.result, InterpretResult::CompileError);
    let err = run.err();
    assert!(err.matches("SyntaxError").count() >= 2, "err: {err}");
}

#[test]
fn local_in_own_initializer_is_rejected() {
    let run = run("def f() {\n  var a = a\n}");
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.err().contains("own initializer"), "err: {}", run.err());
}

#[test]
fn undefined_variable_raises_at_runtime() {
    let run = run("echo nope");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.err().contains("undefined variable 'nope'"), "err: {}", run.err());
}

// ----------------------------------------------------------------------
// Collector behavior under churn.

#[test]
fn allocation_churn_survives_collection_cycles() {
    // Each iteration makes a unique ~1KB string plus a list; the total
    // comfortably crosses the first GC threshold several times.
    let source = "var keep = []\nfor i in 0..2000 {\n  var chunk = \"abcdefgh${i}\" * 100\n  var l = [chunk, i]\n  if i % 500 == 0 {\n    keep.append(i)\n  }\n}\necho keep";
    assert_eq!(run_ok(source), "[0, 500, 1000, 1500]\n");
}

#[test]
fn closures_survive_collection_after_scope_exit() {
    let source = "def hold() {\n  var secret = \"kept-${1000}\"\n  return || {\n    return secret\n  }\n}\nvar f = hold()\nfor i in 0..3000 {\n  var junk = \"x${i}\" * 100\n}\necho f()";
    assert_eq!(run_ok(source), "kept-1000\n");
}
