//! Native methods on byte buffers.

use crate::heap::HeapId;
use crate::object::{BytesObj, HeapData, ListObj, NativeFn};
use crate::value::Value;
use crate::vm::{Vm, VmError};

use super::{advance_index_key, iter_index, want_args};

pub(super) const ENTRIES: &[(&str, NativeFn)] = &[
    ("length", length),
    ("append", append),
    ("extend", extend),
    ("pop", pop),
    ("clone", clone),
    ("to_string", to_string),
    ("to_list", to_list),
    ("@iter", iter),
    ("@itern", itern),
];

fn recv_bytes(vm: &mut Vm, recv: Value) -> Result<HeapId, VmError> {
    if let Value::Obj(id) = recv {
        if matches!(vm.heap.get(id), HeapData::Bytes(_)) {
            return Ok(id);
        }
    }
    Err(vm.raise("receiver is not a bytes buffer"))
}

fn buffer_len(vm: &Vm, id: HeapId) -> usize {
    match vm.heap.get(id) {
        HeapData::Bytes(b) => b.bytes.len(),
        _ => 0,
    }
}

fn length(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "length")?;
    let id = recv_bytes(vm, recv)?;
    Ok(Value::Number(buffer_len(vm, id) as f64))
}

fn append(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "append")?;
    let id = recv_bytes(vm, recv)?;
    let Value::Number(n) = args[0] else {
        return Err(vm.raise("append() expects a number"));
    };
    let byte = n as i64;
    if !(0..=255).contains(&byte) {
        return Err(vm.raise("bytes elements must be in the range 0..255"));
    }
    if let HeapData::Bytes(b) = vm.heap.get_mut(id) {
        b.bytes.push(byte as u8);
    }
    Ok(Value::Nil)
}

fn extend(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "extend")?;
    let id = recv_bytes(vm, recv)?;
    let Value::Obj(other) = args[0] else {
        return Err(vm.raise("extend() expects a bytes argument"));
    };
    let tail = match vm.heap.get(other) {
        HeapData::Bytes(b) => b.bytes.clone(),
        _ => return Err(vm.raise("extend() expects a bytes argument")),
    };
    if let HeapData::Bytes(b) = vm.heap.get_mut(id) {
        b.bytes.extend_from_slice(&tail);
    }
    Ok(Value::Nil)
}

fn pop(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "pop")?;
    let id = recv_bytes(vm, recv)?;
    let popped = match vm.heap.get_mut(id) {
        HeapData::Bytes(b) => b.bytes.pop(),
        _ => None,
    };
    Ok(popped.map_or(Value::Nil, |byte| Value::Number(f64::from(byte))))
}

fn clone(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "clone")?;
    let id = recv_bytes(vm, recv)?;
    let bytes = match vm.heap.get(id) {
        HeapData::Bytes(b) => b.bytes.clone(),
        _ => Vec::new(),
    };
    let copy = vm.alloc(HeapData::Bytes(BytesObj { bytes }));
    Ok(Value::Obj(copy))
}

fn to_string(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "to_string")?;
    let id = recv_bytes(vm, recv)?;
    let text = match vm.heap.get(id) {
        HeapData::Bytes(b) => String::from_utf8_lossy(&b.bytes).into_owned(),
        _ => String::new(),
    };
    Ok(vm.intern(&text))
}

fn to_list(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "to_list")?;
    let id = recv_bytes(vm, recv)?;
    let items: Vec<Value> = match vm.heap.get(id) {
        HeapData::Bytes(b) => b.bytes.iter().map(|byte| Value::Number(f64::from(*byte))).collect(),
        _ => Vec::new(),
    };
    let list = vm.alloc(HeapData::List(ListObj { items }));
    Ok(Value::Obj(list))
}

fn iter(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@iter")?;
    let id = recv_bytes(vm, recv)?;
    let length = buffer_len(vm, id);
    let at = iter_index(vm, args[0], length, "@iter")?;
    let byte = match vm.heap.get(id) {
        HeapData::Bytes(b) => b.bytes[at],
        _ => 0,
    };
    Ok(Value::Number(f64::from(byte)))
}

fn itern(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@itern")?;
    let id = recv_bytes(vm, recv)?;
    let length = buffer_len(vm, id);
    advance_index_key(vm, args[0], length)
}
