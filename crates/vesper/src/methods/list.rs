//! Native methods on lists.

use crate::heap::HeapId;
use crate::object::{DictObj, HeapData, ListObj, NativeFn};
use crate::value::{compare_values, display_string, hash_value, Value};
use crate::vm::{Vm, VmError};

use super::{advance_index_key, iter_index, want_args};

pub(super) const ENTRIES: &[(&str, NativeFn)] = &[
    ("length", length),
    ("append", append),
    ("extend", extend),
    ("pop", pop),
    ("insert", insert),
    ("remove_at", remove_at),
    ("index_of", index_of),
    ("contains", contains),
    ("reverse", reverse),
    ("sort", sort),
    ("clone", clone),
    ("clear", clear),
    ("first", first),
    ("last", last),
    ("join", join),
    ("to_dict", to_dict),
    ("@iter", iter),
    ("@itern", itern),
];

fn recv_list(vm: &mut Vm, recv: Value) -> Result<HeapId, VmError> {
    if let Value::Obj(id) = recv {
        if matches!(vm.heap.get(id), HeapData::List(_)) {
            return Ok(id);
        }
    }
    Err(vm.raise("receiver is not a list"))
}

fn items_len(vm: &Vm, id: HeapId) -> usize {
    match vm.heap.get(id) {
        HeapData::List(l) => l.items.len(),
        _ => 0,
    }
}

fn length(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "length")?;
    let id = recv_list(vm, recv)?;
    Ok(Value::Number(items_len(vm, id) as f64))
}

fn append(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "append")?;
    let id = recv_list(vm, recv)?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.push(args[0]);
    }
    Ok(Value::Nil)
}

fn extend(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "extend")?;
    let id = recv_list(vm, recv)?;
    let Value::Obj(other) = args[0] else {
        return Err(vm.raise("extend() expects a list argument"));
    };
    let tail = match vm.heap.get(other) {
        HeapData::List(l) => l.items.clone(),
        _ => return Err(vm.raise("extend() expects a list argument")),
    };
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.extend(tail);
    }
    Ok(Value::Nil)
}

fn pop(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "pop")?;
    let id = recv_list(vm, recv)?;
    let popped = match vm.heap.get_mut(id) {
        HeapData::List(l) => l.items.pop(),
        _ => None,
    };
    Ok(popped.unwrap_or(Value::Nil))
}

fn insert(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 2, "insert")?;
    let id = recv_list(vm, recv)?;
    let length = items_len(vm, id);
    let Value::Number(n) = args[0] else {
        return Err(vm.raise("insert() index must be a number"));
    };
    let at = n.trunc() as i64;
    if at < 0 || at > length as i64 {
        return Err(vm.raise(&format!("insert() index {at} out of range")));
    }
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.insert(at as usize, args[1]);
    }
    Ok(Value::Nil)
}

fn remove_at(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "remove_at")?;
    let id = recv_list(vm, recv)?;
    let length = items_len(vm, id);
    let at = iter_index(vm, args[0], length, "remove_at")?;
    let removed = match vm.heap.get_mut(id) {
        HeapData::List(l) => l.items.remove(at),
        _ => Value::Nil,
    };
    Ok(removed)
}

fn index_of(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "index_of")?;
    let id = recv_list(vm, recv)?;
    let found = match vm.heap.get(id) {
        HeapData::List(l) => l.items.iter().position(|item| *item == args[0]),
        _ => None,
    };
    Ok(Value::Number(found.map_or(-1.0, |at| at as f64)))
}

fn contains(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "contains")?;
    let id = recv_list(vm, recv)?;
    let found = match vm.heap.get(id) {
        HeapData::List(l) => l.items.contains(&args[0]),
        _ => false,
    };
    Ok(Value::Bool(found))
}

/// Reverses in place and returns the receiver.
fn reverse(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "reverse")?;
    let id = recv_list(vm, recv)?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.reverse();
    }
    Ok(recv)
}

/// Sorts numbers or strings in place and returns the receiver. Mixed or
/// unordered element types raise.
fn sort(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "sort")?;
    let id = recv_list(vm, recv)?;
    let mut items = match vm.heap.get(id) {
        HeapData::List(l) => l.items.clone(),
        _ => Vec::new(),
    };
    let mut comparable = true;
    items.sort_by(|a, b| match compare_values(*a, *b, &vm.heap) {
        Some(ordering) => ordering,
        None => {
            comparable = false;
            std::cmp::Ordering::Equal
        }
    });
    if !comparable {
        return Err(vm.raise("sort() requires comparable elements"));
    }
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items = items;
    }
    Ok(recv)
}

fn clone(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "clone")?;
    let id = recv_list(vm, recv)?;
    let items = match vm.heap.get(id) {
        HeapData::List(l) => l.items.clone(),
        _ => Vec::new(),
    };
    let copy = vm.alloc(HeapData::List(ListObj { items }));
    Ok(Value::Obj(copy))
}

fn clear(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "clear")?;
    let id = recv_list(vm, recv)?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.clear();
    }
    Ok(Value::Nil)
}

fn first(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "first")?;
    let id = recv_list(vm, recv)?;
    let value = match vm.heap.get(id) {
        HeapData::List(l) => l.items.first().copied(),
        _ => None,
    };
    Ok(value.unwrap_or(Value::Nil))
}

fn last(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "last")?;
    let id = recv_list(vm, recv)?;
    let value = match vm.heap.get(id) {
        HeapData::List(l) => l.items.last().copied(),
        _ => None,
    };
    Ok(value.unwrap_or(Value::Nil))
}

fn join(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "join")?;
    let id = recv_list(vm, recv)?;
    let separator = match args[0] {
        Value::Obj(sep) => match vm.heap.get(sep) {
            HeapData::Str(s) => s.as_str().to_owned(),
            _ => return Err(vm.raise("join() expects a string separator")),
        },
        _ => return Err(vm.raise("join() expects a string separator")),
    };
    let items = match vm.heap.get(id) {
        HeapData::List(l) => l.items.clone(),
        _ => Vec::new(),
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

/// Index → value dictionary of the list.
fn to_dict(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "to_dict")?;
    let id = recv_list(vm, recv)?;
    let items = match vm.heap.get(id) {
        HeapData::List(l) => l.items.clone(),
        _ => Vec::new(),
    };
    let mut dict = DictObj::default();
    for (index, item) in items.iter().enumerate() {
        let key = Value::Number(index as f64);
        let hash = hash_value(key, &vm.heap);
        dict.insert_hashed(key, hash, *item);
    }
    let id = vm.alloc(HeapData::Dict(dict));
    Ok(Value::Obj(id))
}

fn iter(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@iter")?;
    let id = recv_list(vm, recv)?;
    let length = items_len(vm, id);
    let at = iter_index(vm, args[0], length, "@iter")?;
    let value = match vm.heap.get(id) {
        HeapData::List(l) => l.items[at],
        _ => Value::Nil,
    };
    Ok(value)
}

fn itern(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@itern")?;
    let id = recv_list(vm, recv)?;
    let length = items_len(vm, id);
    advance_index_key(vm, args[0], length)
}
