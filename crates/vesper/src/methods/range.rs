//! Native methods on ranges.
//!
//! A range iterates `extent` steps from `lower` toward `upper`, upper
//! bound exclusive; descending ranges step downward.

use crate::object::{HeapData, ListObj, NativeFn, RangeObj};
use crate::value::Value;
use crate::vm::{Vm, VmError};

use super::{advance_index_key, iter_index, want_args};

pub(super) const ENTRIES: &[(&str, NativeFn)] = &[
    ("lower", lower),
    ("upper", upper),
    ("length", length),
    ("within", within),
    ("to_list", to_list),
    ("@iter", iter),
    ("@itern", itern),
];

fn recv_range(vm: &mut Vm, recv: Value) -> Result<RangeObj, VmError> {
    if let Value::Obj(id) = recv {
        if let HeapData::Range(r) = vm.heap.get(id) {
            return Ok(*r);
        }
    }
    Err(vm.raise("receiver is not a range"))
}

fn step_value(range: RangeObj, step: usize) -> f64 {
    if range.upper >= range.lower {
        (range.lower + step as i64) as f64
    } else {
        (range.lower - step as i64) as f64
    }
}

fn lower(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "lower")?;
    let range = recv_range(vm, recv)?;
    Ok(Value::Number(range.lower as f64))
}

fn upper(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "upper")?;
    let range = recv_range(vm, recv)?;
    Ok(Value::Number(range.upper as f64))
}

fn length(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "length")?;
    let range = recv_range(vm, recv)?;
    Ok(Value::Number(range.extent as f64))
}

fn within(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "within")?;
    let range = recv_range(vm, recv)?;
    let Value::Number(n) = args[0] else {
        return Err(vm.raise("within() expects a number"));
    };
    let n = n.trunc() as i64;
    let inside = if range.upper >= range.lower {
        n >= range.lower && n < range.upper
    } else {
        n <= range.lower && n > range.upper
    };
    Ok(Value::Bool(inside))
}

fn to_list(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 0, "to_list")?;
    let range = recv_range(vm, recv)?;
    let items: Vec<Value> = (0..range.extent as usize)
        .map(|step| Value::Number(step_value(range, step)))
        .collect();
    let list = vm.alloc(HeapData::List(ListObj { items }));
    Ok(Value::Obj(list))
}

fn iter(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@iter")?;
    let range = recv_range(vm, recv)?;
    let at = iter_index(vm, args[0], range.extent as usize, "@iter")?;
    Ok(Value::Number(step_value(range, at)))
}

fn itern(vm: &mut Vm, recv: Value, args: &[Value]) -> Result<Value, VmError> {
    want_args(vm, args, 1, "@itern")?;
    let range = recv_range(vm, recv)?;
    advance_index_key(vm, args[0], range.extent as usize)
}
