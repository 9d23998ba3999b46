//! Native methods on dictionaries.
//!
//! Iteration follows insertion order: `@itern` advances through the keys
//! list, `@iter` reads the value at a key.

use crate::heap::HeapId;
use crate::object::{DictObj, HeapData, ListObj, NativeFn};
use crate::value::{hash_value, Value};
use crate::vm::{Vm, VmError};

use super::want_args;

pub(super) const ENTRIES: &[(&str, NativeFn)] = &[
    ("length", length),
    ("keys", keys),
    ("values", values),
    ("contains", contains),
    ("get", get),
    ("set", set),
    ("remove", remove),
    ("clear", clear),
    ("clone", clone),
    ("extend", extend),
    ("@iter", iter),
    ("@itern", itern),
];

fn recv_dict(vm: &mut Vm, recv: Value) -> Result<HeapId, VmError> {
    if let Value::Obj(id) = recv {
        if matches!(vm.heap.get(id), HeapData::Dict(_)) {
            return Ok(id);
        }
    }
    Err(vm.raise("receiver is not a dictionary"))
}

fn length(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "length")?;
    let id = recv_dict(vm, recv)?;
    let count = match vm.heap.get(id) {
        HeapData::Dict(d) => d.keys.len(),
        _ => 0,
    };
    Ok(Value::Number(count as f64))
}

fn keys(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "keys")?;
    let id = recv_dict(vm, recv)?;
    let items = match vm.heap.get(id) {
        HeapData::Dict(d) => d.keys.clone(),
        _ => Vec::new(),
    };
    let list = vm.alloc(HeapData::List(ListObj { items }));
    Ok(Value::Obj(list))
}

fn values(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "values")?;
    let id = recv_dict(vm, recv)?;
    let items = match vm.heap.get(id) {
        HeapData::Dict(d) => {
            let mut out = Vec::with_capacity(d.keys.len());
            for key in &d.keys {
                let hash = hash_value(*key, &vm.heap);
                out.push(d.table.get_with_hash(*key, hash).unwrap_or(Value::Nil));
            }
            out
        }
        _ => Vec::new(),
    };
    let list = vm.alloc(HeapData::List(ListObj { items }));
    Ok(Value::Obj(list))
}

fn contains(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "contains")?;
    let id = recv_dict(vm, recv)?;
    let hash = hash_value(args[0], &vm.heap);
    let found = match vm.heap.get(id) {
        HeapData::Dict(d) => d.table.get_with_hash(args[0], hash).is_some(),
        _ => false,
    };
    Ok(Value::Bool(found))
}

/// `get(key)` or `get(key, default)`: missing keys yield the default
/// (or `nil`) instead of raising.
fn get(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    if args.is_empty() || args.len() > 2 {
        return Err(vm.raise(&format!("get() expects 1 or 2 argument(s), got {}", args.len())));
    }
    let id = recv_dict(vm, recv)?;
    let hash = hash_value(args[0], &vm.heap);
    let value = match vm.heap.get(id) {
        HeapData::Dict(d) => d.table.get_with_hash(args[0], hash),
        _ => None,
    };
    Ok(value.unwrap_or_else(|| args.get(1).copied().unwrap_or(Value::Nil)))
}

fn set(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 2, "set")?;
    let id = recv_dict(vm, recv)?;
    vm.check_dict_key(args[0])?;
    let hash = hash_value(args[0], &vm.heap);
    if let HeapData::Dict(d) = vm.heap.get_mut(id) {
        d.insert_hashed(args[0], hash, args[1]);
    }
    Ok(args[1])
}

fn remove(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "remove")?;
    let id = recv_dict(vm, recv)?;
    let hash = hash_value(args[0], &vm.heap);
    let removed = match vm.heap.get_mut(id) {
        HeapData::Dict(d) => d.remove_hashed(args[0], hash),
        _ => false,
    };
    Ok(Value::Bool(removed))
}

fn clear(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "clear")?;
    let id = recv_dict(vm, recv)?;
    if let HeapData::Dict(d) = vm.heap.get_mut(id) {
        *d = DictObj::default();
    }
    Ok(Value::Nil)
}

fn clone(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "clone")?;
    let id = recv_dict(vm, recv)?;
    let pairs: Vec<(Value, Value)> = match vm.heap.get(id) {
        HeapData::Dict(d) => d
            .keys
            .iter()
            .map(|key| {
                let hash = hash_value(*key, &vm.heap);
                (*key, d.table.get_with_hash(*key, hash).unwrap_or(Value::Nil))
            })
            .collect(),
        _ => Vec::new(),
    };
    let mut dict = DictObj::default();
    for (key, value) in pairs {
        let hash = hash_value(key, &vm.heap);
        dict.insert_hashed(key, hash, value);
    }
    let copy = vm.alloc(HeapData::Dict(dict));
    Ok(Value::Obj(copy))
}

fn extend(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "extend")?;
    let id = recv_dict(vm, recv)?;
    let Value::Obj(other) = args[0] else {
        return Err(vm.raise("extend() expects a dictionary argument"));
    };
    let pairs: Vec<(Value, Value)> = match vm.heap.get(other) {
        HeapData::Dict(d) => d
            .keys
            .iter()
            .map(|key| {
                let hash = hash_value(*key, &vm.heap);
                (*key, d.table.get_with_hash(*key, hash).unwrap_or(Value::Nil))
            })
            .collect(),
        _ => return Err(vm.raise("extend() expects a dictionary argument")),
    };
    for (key, value) in pairs {
        let hash = hash_value(key, &vm.heap);
        if let HeapData::Dict(d) = vm.heap.get_mut(id) {
            d.insert_hashed(key, hash, value);
        }
    }
    Ok(Value::Nil)
}

fn iter(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@iter")?;
    let id = recv_dict(vm, recv)?;
    let hash = hash_value(args[0], &vm.heap);
    let value = match vm.heap.get(id) {
        HeapData::Dict(d) => d.table.get_with_hash(args[0], hash),
        _ => None,
    };
    match value {
        Some(value) => Ok(value),
        None => Err(vm.raise("@iter() key is not in the dictionary")),
    }
}

/// Advances through the insertion-ordered key list.
fn itern(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@itern")?;
    let id = recv_dict(vm, recv)?;
    let keys = match vm.heap.get(id) {
        HeapData::Dict(d) => d.keys.clone(),
        _ => Vec::new(),
    };
    match args[0] {
        Value::Nil => Ok(keys.first().copied().unwrap_or(Value::Bool(false))),
        previous => match keys.iter().position(|key| *key == previous) {
            Some(at) if at + 1 < keys.len() => Ok(keys[at + 1]),
            Some(_) => Ok(Value::Bool(false)),
            None => Err(vm.raise("@itern() key is not in the dictionary")),
        },
    }
}
