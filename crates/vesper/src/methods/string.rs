//! Native methods on strings.
//!
//! `match`, `matches` and `replace` understand regex-literal strings: a
//! pattern whose first and last non-escaped character is `/`, with
//! trailing modifier letters for flags. Anything else is treated as a
//! plain substring pattern.

use crate::object::{BytesObj, HeapData, ListObj, NativeFn};
use crate::value::{display_string, Value};
use crate::vm::{Vm, VmError};

use super::{advance_index_key, iter_index, want_args};

pub(super) const ENTRIES: &[(&str, NativeFn)] = &[
    ("length", length),
    ("upper", upper),
    ("lower", lower),
    ("is_alpha", is_alpha),
    ("is_digit", is_digit),
    ("is_lower", is_lower),
    ("is_upper", is_upper),
    ("trim", trim),
    ("ltrim", ltrim),
    ("rtrim", rtrim),
    ("split", split),
    ("join", join),
    ("index_of", index_of),
    ("starts_with", starts_with),
    ("ends_with", ends_with),
    ("replace", replace),
    ("match", match_),
    ("matches", matches),
    ("to_number", to_number),
    ("to_list", to_list),
    ("to_bytes", to_bytes),
    ("ascii", ascii),
    ("@iter", iter),
    ("@itern", itern),
];

/// Clones the receiver's text and indexing mode out of the heap.
fn recv_str(vm: &mut Vm, recv: Value) -> Result<(String, bool), VmError> {
    if let Value::Obj(id) = recv {
        if let HeapData::Str(s) = vm.heap.get(id) {
            return Ok((s.as_str().to_owned(), s.ascii));
        }
    }
    Err(vm.raise("receiver is not a string"))
}

fn str_arg(vm: &mut Vm, value: Value, method: &str) -> Result<String, VmError> {
    if let Value::Obj(id) = value {
        if let HeapData::Str(s) = vm.heap.get(id) {
            return Ok(s.as_str().to_owned());
        }
    }
    Err(vm.raise(&format!("{method}() expects a string argument")))
}

fn length(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "length")?;
    let (text, ascii) = recv_str(vm, recv)?;
    let length = if ascii { text.len() } else { text.chars().count() };
    Ok(Value::Number(length as f64))
}

fn upper(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "upper")?;
    let (text, _) = recv_str(vm, recv)?;
    Ok(vm.intern(&text.to_uppercase()))
}

fn lower(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "lower")?;
    let (text, _) = recv_str(vm, recv)?;
    Ok(vm.intern(&text.to_lowercase()))
}

fn is_alpha(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "is_alpha")?;
    let (text, _) = recv_str(vm, recv)?;
    Ok(Value::Bool(!text.is_empty() && text.chars().all(char::is_alphabetic)))
}

fn is_digit(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "is_digit")?;
    let (text, _) = recv_str(vm, recv)?;
    Ok(Value::Bool(!text.is_empty() && text.chars().all(|c| c.is_ascii_digit())))
}

/// True iff the string is non-empty, contains at least one alphabetic
/// character, and every cased character is lowercase. The seen-alpha
/// flag starts false.
fn is_lower(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "is_lower")?;
    let (text, _) = recv_str(vm, recv)?;
    let mut has_alpha = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            has_alpha = true;
            if !c.is_lowercase() {
                return Ok(Value::Bool(false));
            }
        }
    }
    Ok(Value::Bool(has_alpha))
}

fn is_upper(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "is_upper")?;
    let (text, _) = recv_str(vm, recv)?;
    let mut has_alpha = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            has_alpha = true;
            if !c.is_uppercase() {
                return Ok(Value::Bool(false));
            }
        }
    }
    Ok(Value::Bool(has_alpha))
}

fn trim(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "trim")?;
    let (text, _) = recv_str(vm, recv)?;
    Ok(vm.intern(text.trim()))
}

fn ltrim(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "ltrim")?;
    let (text, _) = recv_str(vm, recv)?;
    Ok(vm.intern(text.trim_start()))
}

fn rtrim(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "rtrim")?;
    let (text, _) = recv_str(vm, recv)?;
    Ok(vm.intern(text.trim_end()))
}

/// Splits on a separator; the empty separator splits into characters.
fn split(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "split")?;
    let (text, _) = recv_str(vm, recv)?;
    let separator = str_arg(vm, args[0], "split")?;
    let parts: Vec<String> = if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(&separator).map(str::to_owned).collect()
    };
    let mut items = Vec::with_capacity(parts.len());
    let depth = vm.heap.guard_depth();
    for part in parts {
        let value = vm.intern(&part);
        vm.heap.guard(value);
        items.push(value);
    }
    let list = vm.alloc(HeapData::List(ListObj { items }));
    vm.heap.truncate_guards(depth);
    Ok(Value::Obj(list))
}

/// Joins a list with the receiver as separator; elements stringify.
fn join(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "join")?;
    let (separator, _) = recv_str(vm, recv)?;
    let Value::Obj(id) = args[0] else {
        return Err(vm.raise("join() expects a list argument"));
    };
    let items = match vm.heap.get(id) {
        HeapData::List(l) => l.items.clone(),
        _ => return Err(vm.raise("join() expects a list argument")),
    };
    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push_str(&separator);
        }
        out.push_str(&display_string(*item, &vm.heap));
    }
    Ok(vm.intern(&out))
}

fn index_of(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "index_of")?;
    let (text, _) = recv_str(vm, recv)?;
    let needle = str_arg(vm, args[0], "index_of")?;
    match text.find(&needle) {
        Some(byte_at) => {
            let index = text[..byte_at].chars().count();
            Ok(Value::Number(index as f64))
        }
        None => Ok(Value::Number(-1.0)),
    }
}

fn starts_with(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "starts_with")?;
    let (text, _) = recv_str(vm, recv)?;
    let prefix = str_arg(vm, args[0], "starts_with")?;
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn ends_with(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "ends_with")?;
    let (text, _) = recv_str(vm, recv)?;
    let suffix = str_arg(vm, args[0], "ends_with")?;
    Ok(Value::Bool(text.ends_with(&suffix)))
}

fn replace(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 2, "replace")?;
    let (text, _) = recv_str(vm, recv)?;
    let pattern = str_arg(vm, args[0], "replace")?;
    let replacement = str_arg(vm, args[1], "replace")?;
    let result = match compile_regex_literal(vm, &pattern)? {
        Some(regex) => regex.replace_all(&text, replacement.as_str()).into_owned(),
        None => text.replace(&pattern, &replacement),
    };
    Ok(vm.intern(&result))
}

/// Returns the first match as a string, or `nil` when nothing matches.
fn match_(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "match")?;
    let (text, _) = recv_str(vm, recv)?;
    let pattern = str_arg(vm, args[0], "match")?;
    let found = match compile_regex_literal(vm, &pattern)? {
        Some(regex) => regex.find(&text).map(|m| m.as_str().to_owned()),
        None => text.contains(&pattern).then(|| pattern.clone()),
    };
    match found {
        Some(text) => Ok(vm.intern(&text)),
        None => Ok(Value::Nil),
    }
}

fn matches(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "matches")?;
    let (text, _) = recv_str(vm, recv)?;
    let pattern = str_arg(vm, args[0], "matches")?;
    let matched = match compile_regex_literal(vm, &pattern)? {
        Some(regex) => regex.is_match(&text),
        None => text.contains(&pattern),
    };
    Ok(Value::Bool(matched))
}

fn to_number(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "to_number")?;
    let (text, _) = recv_str(vm, recv)?;
    match text.trim().parse::<f64>() {
        Ok(n) => Ok(Value::Number(n)),
        Err(_) => Ok(Value::Nil),
    }
}

fn to_list(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "to_list")?;
    let (text, _) = recv_str(vm, recv)?;
    let depth = vm.heap.guard_depth();
    let mut items = Vec::new();
    for c in text.chars() {
        let value = vm.intern(&c.to_string());
        vm.heap.guard(value);
        items.push(value);
    }
    let list = vm.alloc(HeapData::List(ListObj { items }));
    vm.heap.truncate_guards(depth);
    Ok(Value::Obj(list))
}

fn to_bytes(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "to_bytes")?;
    let (text, _) = recv_str(vm, recv)?;
    let id = vm.alloc(HeapData::Bytes(BytesObj {
        bytes: text.into_bytes(),
    }));
    Ok(Value::Obj(id))
}

/// Forces byte-wise indexing on the receiver and returns it. The flag
/// lives on the interned object, so every holder of these bytes sees it.
fn ascii(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "ascii")?;
    let Value::Obj(id) = recv else {
        return Err(vm.raise("receiver is not a string"));
    };
    match vm.heap.get_mut(id) {
        HeapData::Str(s) => s.ascii = true,
        _ => return Err(vm.raise("receiver is not a string")),
    }
    Ok(recv)
}

fn iter(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@iter")?;
    let (text, ascii) = recv_str(vm, recv)?;
    let length = if ascii { text.len() } else { text.chars().count() };
    let at = iter_index(vm, args[0], length, "@iter")?;
    let piece = if ascii {
        String::from_utf8_lossy(&[text.as_bytes()[at]]).into_owned()
    } else {
        text.chars().nth(at).expect("checked index").to_string()
    };
    Ok(vm.intern(&piece))
}

fn itern(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@itern")?;
    let (text, ascii) = recv_str(vm, recv)?;
    let length = if ascii { text.len() } else { text.chars().count() };
    advance_index_key(vm, args[0], length)
}

/// Recognizes a regex-literal string: delimited by `/` at both ends with
/// optional trailing modifier letters. Returns `None` for plain
/// substring patterns.
fn compile_regex_literal(vm: &mut Vm, pattern: &str) -> Result<Option<regex::Regex>, VmError> {
    let bytes = pattern.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'/' {
        return Ok(None);
    }
    // The closing delimiter may be followed by flags.
    let Some(close) = find_closing_delimiter(pattern) else {
        return Ok(None);
    };
    let body = &pattern[1..close];
    let flags = &pattern[close + 1..];
    if !flags.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'x')) {
        return Ok(None);
    }
    let source = if flags.is_empty() {
        body.to_owned()
    } else {
        format!("(?{flags}){body}")
    };
    match regex::Regex::new(&source) {
        Ok(regex) => Ok(Some(regex)),
        Err(error) => Err(vm.raise(&format!("invalid regular expression: {error}"))),
    }
}

/// Finds the last unescaped `/` past position 0.
fn find_closing_delimiter(pattern: &str) -> Option<usize> {
    let bytes = pattern.as_bytes();
    let mut close = None;
    let mut index = 1;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 1,
            b'/' => close = Some(index),
            _ => {}
        }
        index += 1;
    }
    close.filter(|at| *at > 0)
}
