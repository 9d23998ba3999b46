//! Indexing: `x[i]`, `x[a,b]` and index assignment.
//!
//! Dispatch is by receiver type. Integer indices truncate, negative
//! indices count from the end, and the ranged form defaults `nil` bounds
//! to the full extent. Strings index by codepoint unless ASCII-forced,
//! in which case they index byte-wise.

use crate::object::HeapData;
use crate::value::{hash_value, repr_string, Value};

use super::{OpResult, Vm, VmError};

impl Vm {
    /// `GetIndex`: `[receiver, index]` → the element. With `keep`, the
    /// receiver and index stay beneath the result for a following
    /// `SetIndex` (compound assignment).
    pub(crate) fn op_get_index(&mut self, keep: bool) -> OpResult {
        let receiver = self.peek(1);
        let index = self.peek(0);
        let result = self.index_value(receiver, index)?;
        if keep {
            self.push(result)
        } else {
            self.stack.truncate(self.stack.len() - 2);
            self.push(result)
        }
    }

    fn index_value(&mut self, receiver: Value, index: Value) -> Result<Value, VmError> {
        let Value::Obj(id) = receiver else {
            return Err(self.error(&format!("{} is not indexable", receiver.type_name(&self.heap))));
        };
        enum Out {
            Value(Value),
            NewStr(String),
            Fail(String),
        }
        let out = match self.heap.get(id) {
            HeapData::Str(s) => {
                let length = s.length();
                match checked_index(index, length) {
                    Ok(at) => {
                        if s.ascii {
                            let byte = s.bytes()[at];
                            Out::NewStr(String::from_utf8_lossy(&[byte]).into_owned())
                        } else {
                            let ch = s.as_str().chars().nth(at).expect("checked index");
                            Out::NewStr(ch.to_string())
                        }
                    }
                    Err(message) => Out::Fail(message),
                }
            }
            HeapData::Bytes(b) => match checked_index(index, b.bytes.len()) {
                Ok(at) => Out::Value(Value::Number(f64::from(b.bytes[at]))),
                Err(message) => Out::Fail(message),
            },
            HeapData::List(l) => match checked_index(index, l.items.len()) {
                Ok(at) => Out::Value(l.items[at]),
                Err(message) => Out::Fail(message),
            },
            HeapData::Dict(d) => {
                let hash = hash_value(index, &self.heap);
                match d.table.get_with_hash(index, hash) {
                    Some(value) => Out::Value(value),
                    None => Out::Fail(format!("dictionary has no key {}", repr_string(index, &self.heap))),
                }
            }
            HeapData::Module(m) => {
                let is_string = matches!(index, Value::Obj(k) if matches!(self.heap.get(k), HeapData::Str(_)));
                if is_string {
                    let hash = hash_value(index, &self.heap);
                    match m.values.get_with_hash(index, hash) {
                        Some(value) => Out::Value(value),
                        None => Out::Fail(format!(
                            "module has no member {}",
                            repr_string(index, &self.heap)
                        )),
                    }
                } else {
                    Out::Fail("module members are indexed by string".to_owned())
                }
            }
            _ => Out::Fail(format!("{} is not indexable", receiver.type_name(&self.heap))),
        };
        match out {
            Out::Value(value) => Ok(value),
            Out::NewStr(text) => Ok(self.intern(&text)),
            Out::Fail(message) => Err(self.error(&message)),
        }
    }

    /// `GetRangedIndex`: `[receiver, low, high]` → a slice. `nil` bounds
    /// default to the start and the length.
    pub(crate) fn op_get_ranged_index(&mut self, keep: bool) -> OpResult {
        let receiver = self.peek(2);
        let low = self.peek(1);
        let high = self.peek(0);
        let Value::Obj(id) = receiver else {
            return Err(self.error(&format!("{} is not indexable", receiver.type_name(&self.heap))));
        };

        enum Out {
            Str(String),
            Bytes(Vec<u8>),
            List(Vec<Value>),
            Fail(String),
        }
        let out = match self.heap.get(id) {
            HeapData::Str(s) => match range_bounds(low, high, s.length()) {
                Ok((from, to)) => {
                    if s.ascii {
                        let slice = &s.bytes()[from..to];
                        Out::Str(String::from_utf8_lossy(slice).into_owned())
                    } else {
                        Out::Str(s.as_str().chars().skip(from).take(to - from).collect())
                    }
                }
                Err(message) => Out::Fail(message),
            },
            HeapData::Bytes(b) => match range_bounds(low, high, b.bytes.len()) {
                Ok((from, to)) => Out::Bytes(b.bytes[from..to].to_vec()),
                Err(message) => Out::Fail(message),
            },
            HeapData::List(l) => match range_bounds(low, high, l.items.len()) {
                Ok((from, to)) => Out::List(l.items[from..to].to_vec()),
                Err(message) => Out::Fail(message),
            },
            _ => Out::Fail(format!("{} is not range-indexable", receiver.type_name(&self.heap))),
        };
        let result = match out {
            Out::Str(text) => self.intern(&text),
            Out::Bytes(bytes) => Value::Obj(self.alloc(HeapData::Bytes(crate::object::BytesObj { bytes }))),
            Out::List(items) => Value::Obj(self.alloc(HeapData::List(crate::object::ListObj { items }))),
            Out::Fail(message) => return Err(self.error(&message)),
        };
        if keep {
            self.push(result)
        } else {
            self.stack.truncate(self.stack.len() - 3);
            self.push(result)
        }
    }

    /// `SetIndex`: `[receiver, index, value]` → the assigned value.
    /// Lists, bytes, dicts and modules are assignable; strings are not.
    pub(crate) fn op_set_index(&mut self) -> OpResult {
        let value = self.peek(0);
        let index = self.peek(1);
        let receiver = self.peek(2);
        let Value::Obj(id) = receiver else {
            return Err(self.error(&format!(
                "cannot assign into {}",
                receiver.type_name(&self.heap)
            )));
        };

        // Validation that needs only immutable access happens before the
        // mutable borrow.
        let kind = match self.heap.get(id) {
            HeapData::List(l) => ("list", l.items.len()),
            HeapData::Bytes(b) => ("bytes", b.bytes.len()),
            HeapData::Dict(_) => ("dict", 0),
            HeapData::Module(_) => ("module", 0),
            HeapData::Str(_) => {
                return Err(self.error("strings are immutable and cannot be assigned into"));
            }
            _ => {
                return Err(self.error(&format!(
                    "cannot assign into {}",
                    receiver.type_name(&self.heap)
                )))
            }
        };

        match kind {
            ("list", length) => {
                let at = match checked_index(index, length) {
                    Ok(at) => at,
                    Err(message) => return Err(self.error(&message)),
                };
                if let HeapData::List(l) = self.heap.get_mut(id) {
                    l.items[at] = value;
                }
            }
            ("bytes", length) => {
                let at = match checked_index(index, length) {
                    Ok(at) => at,
                    Err(message) => return Err(self.error(&message)),
                };
                let Value::Number(n) = value else {
                    return Err(self.error("bytes elements must be numbers"));
                };
                let byte = n as i64;
                if !(0..=255).contains(&byte) {
                    return Err(self.error("bytes elements must be in the range 0..255"));
                }
                if let HeapData::Bytes(b) = self.heap.get_mut(id) {
                    b.bytes[at] = byte as u8;
                }
            }
            ("dict", _) => {
                self.check_dict_key(index)?;
                let hash = hash_value(index, &self.heap);
                if let HeapData::Dict(d) = self.heap.get_mut(id) {
                    d.insert_hashed(index, hash, value);
                }
            }
            ("module", _) => {
                let is_string = matches!(index, Value::Obj(k) if matches!(self.heap.get(k), HeapData::Str(_)));
                if !is_string {
                    return Err(self.error("module members are indexed by string"));
                }
                let hash = hash_value(index, &self.heap);
                if let HeapData::Module(m) = self.heap.get_mut(id) {
                    m.values.set_with_hash(index, hash, value);
                }
            }
            _ => unreachable!("kinds are covered above"),
        }

        self.stack.truncate(self.stack.len() - 3);
        self.push(value)
    }
}

/// Resolves an index value against a length: truncating, negative from
/// the end, bounds-checked.
fn checked_index(index: Value, length: usize) -> Result<usize, String> {
    let Value::Number(n) = index else {
        return Err("index must be a number".to_owned());
    };
    let mut at = n.trunc() as i64;
    if at < 0 {
        at += length as i64;
    }
    if at < 0 || at >= length as i64 {
        return Err(format!("index {} out of range for length {length}", display_index(n)));
    }
    Ok(at as usize)
}

/// Resolves ranged-index bounds: `nil` low defaults to 0, `nil` high to
/// the length; negatives count from the end; the result is clamped and
/// ordered.
fn range_bounds(low: Value, high: Value, length: usize) -> Result<(usize, usize), String> {
    let resolve = |bound: Value, default: i64| -> Result<i64, String> {
        match bound {
            Value::Nil => Ok(default),
            Value::Number(n) => {
                let mut at = n.trunc() as i64;
                if at < 0 {
                    at += length as i64;
                }
                Ok(at)
            }
            _ => Err("range bounds must be numbers or nil".to_owned()),
        }
    };
    let from = resolve(low, 0)?.clamp(0, length as i64) as usize;
    let to = resolve(high, length as i64)?.clamp(0, length as i64) as usize;
    Ok((from, to.max(from)))
}

fn display_index(n: f64) -> String {
    crate::value::number_to_string(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_count_from_the_end() {
        assert_eq!(checked_index(Value::Number(-1.0), 3).unwrap(), 2);
        assert_eq!(checked_index(Value::Number(1.0), 3).unwrap(), 1);
        assert!(checked_index(Value::Number(3.0), 3).is_err());
        assert!(checked_index(Value::Number(-4.0), 3).is_err());
    }

    #[test]
    fn range_bounds_default_and_clamp() {
        assert_eq!(range_bounds(Value::Nil, Value::Nil, 5).unwrap(), (0, 5));
        assert_eq!(range_bounds(Value::Number(1.0), Value::Nil, 3).unwrap(), (1, 3));
        assert_eq!(range_bounds(Value::Number(-2.0), Value::Number(99.0), 5).unwrap(), (3, 5));
        assert_eq!(range_bounds(Value::Number(4.0), Value::Number(2.0), 5).unwrap(), (4, 4));
    }
}
