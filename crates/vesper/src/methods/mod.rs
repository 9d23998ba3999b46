//! Built-in method tables for the primitive container types.
//!
//! Six tables map method-name strings to native descriptors: string,
//! list, dict, bytes, range, file. Every table carries the iteration pair
//! `@iter` / `@itern` so `for .. in` works over all of them. Lookup
//! misses surface as "has no method" errors in the VM's attr dispatch.

mod bytes;
mod dict;
mod file;
mod list;
mod range;
mod string;

use crate::object::{HeapData, NativeFn, NativeFnObj, NativeKind};
use crate::table::ValueTable;
use crate::value::Value;
use crate::vm::{Vm, VmError};

/// Installs all six tables. Runs inside the VM's bootstrap window, so
/// collection is off and ordering is free.
pub(crate) fn install(vm: &mut Vm) {
    vm.string_methods = build(vm, string::ENTRIES);
    vm.list_methods = build(vm, list::ENTRIES);
    vm.dict_methods = build(vm, dict::ENTRIES);
    vm.bytes_methods = build(vm, bytes::ENTRIES);
    vm.range_methods = build(vm, range::ENTRIES);
    vm.file_methods = build(vm, file::ENTRIES);
}

fn build(vm: &mut Vm, entries: &[(&str, NativeFn)]) -> ValueTable {
    let mut table = ValueTable::new();
    for (name, function) in entries {
        let key = vm.intern(name);
        let descriptor = vm.heap.allocate(HeapData::NativeFn(NativeFnObj {
            name: (*name).to_owned(),
            function: *function,
            kind: NativeKind::Method,
        }));
        table.set(&vm.heap, key, Value::Obj(descriptor));
    }
    table
}

/// Arity guard shared by the natives.
pub(crate) fn want_args(vm: &mut Vm, args: &[Value], count: usize, method: &str) -> Result<(), VmError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(vm.raise(&format!(
            "{method}() expects {count} argument(s), got {}",
            args.len()
        )))
    }
}

/// Standard `@itern` advance over an integer-keyed sequence: `nil` starts
/// at 0, a number advances by one, exhaustion yields `false`.
pub(crate) fn advance_index_key(vm: &mut Vm, key: Value, length: usize) -> Result<Value, VmError> {
    match key {
        Value::Nil => Ok(if length > 0 { Value::Number(0.0) } else { Value::Bool(false) }),
        Value::Number(n) => {
            let next = n.trunc() + 1.0;
            if (next as usize) < length {
                Ok(Value::Number(next))
            } else {
                Ok(Value::Bool(false))
            }
        }
        _ => Err(vm.raise("iteration key must be a number or nil")),
    }
}

/// Resolves an `@iter` key into a checked index.
pub(crate) fn iter_index(vm: &mut Vm, key: Value, length: usize, method: &str) -> Result<usize, VmError> {
    let Value::Number(n) = key else {
        return Err(vm.raise(&format!("{method}() key must be a number")));
    };
    let at = n.trunc() as i64;
    if at < 0 || at >= length as i64 {
        return Err(vm.raise(&format!("{method}() key {at} out of range")));
    }
    Ok(at as usize)
}
