//! Property access and method invocation.
//!
//! `x.name` dispatches on the receiver's type: instances search their
//! property table then bind a method; classes expose statics; modules
//! expose their values; the primitive types search their built-in method
//! tables; dicts fall back from items to the dict method table. Names
//! starting with `_` are private and reachable only through `self`.
//!
//! Each operation reads everything it needs from the heap first, then
//! acts; the action enums keep the heap borrow from overlapping stack
//! mutation.

use crate::heap::HeapId;
use crate::object::{BoundMethodObj, HeapData};
use crate::value::{display_string, hash_value, Value};

use super::{OpResult, Vm};

/// Outcome of a property lookup, decided under an immutable heap borrow.
enum PropAction {
    Push(Value),
    Bind(Value),
    Fail(String),
}

/// Outcome of a method-call lookup.
enum InvokeAction {
    /// A plain value found on the receiver; replaces the callee slot.
    CallField(Value),
    /// A class or built-in method; the receiver slot is already correct.
    CallMethod(Value),
    Fail(String),
}

impl Vm {
    /// `GetProperty` / `GetSelfProperty`: replaces the receiver on top of
    /// the stack with the property value or a bound method.
    pub(crate) fn op_get_property(&mut self, name: Value, allow_private: bool) -> OpResult {
        let receiver = self.peek(0);
        let hash = hash_value(name, &self.heap);
        let action = self.property_action(receiver, name, hash, allow_private);
        match action {
            PropAction::Push(value) => {
                self.set_top(value);
                Ok(())
            }
            PropAction::Bind(method) => self.bind_method(receiver, method),
            PropAction::Fail(message) => Err(self.error(&message)),
        }
    }

    fn property_action(&self, receiver: Value, name: Value, hash: u64, allow_private: bool) -> PropAction {
        let Value::Obj(id) = receiver else {
            return self.missing_property(receiver, name);
        };
        match self.heap.get(id) {
            HeapData::Instance(instance) => {
                if !allow_private && self.is_private_name(name) {
                    return PropAction::Fail(format!(
                        "cannot access private property '{}'",
                        display_string(name, &self.heap)
                    ));
                }
                if let Some(value) = instance.properties.get_with_hash(name, hash) {
                    return PropAction::Push(value);
                }
                let Some(method) = self.find_method(instance.class, name, hash) else {
                    return self.missing_property(receiver, name);
                };
                if !allow_private && self.method_is_private(method) {
                    return PropAction::Fail(format!(
                        "cannot access private method '{}'",
                        display_string(name, &self.heap)
                    ));
                }
                PropAction::Bind(method)
            }
            HeapData::Class(class) => {
                if let Some(value) = class.statics.get_with_hash(name, hash) {
                    return PropAction::Push(value);
                }
                let Some(method) = class.methods.get_with_hash(name, hash) else {
                    return self.missing_property(receiver, name);
                };
                if self.method_is_static(method) {
                    PropAction::Bind(method)
                } else {
                    PropAction::Fail(format!(
                        "non-static method '{}' cannot be accessed directly on a class",
                        display_string(name, &self.heap)
                    ))
                }
            }
            HeapData::Module(module) => {
                if self.is_private_name(name) {
                    return PropAction::Fail(format!(
                        "cannot access private module member '{}'",
                        display_string(name, &self.heap)
                    ));
                }
                match module.values.get_with_hash(name, hash) {
                    Some(value) => PropAction::Push(value),
                    None => self.missing_property(receiver, name),
                }
            }
            HeapData::Dict(dict) => {
                if let Some(value) = dict.table.get_with_hash(name, hash) {
                    return PropAction::Push(value);
                }
                match self.dict_methods.get_with_hash(name, hash) {
                    Some(method) => PropAction::Bind(method),
                    None => self.missing_property(receiver, name),
                }
            }
            HeapData::Str(_) | HeapData::List(_) | HeapData::Bytes(_) | HeapData::Range(_) | HeapData::File(_) => {
                match self.builtin_method(receiver, name, hash) {
                    Some(method) => PropAction::Bind(method),
                    None => self.missing_property(receiver, name),
                }
            }
            _ => self.missing_property(receiver, name),
        }
    }

    /// `SetProperty`: `[receiver, value]` become the assigned value.
    /// Only instances and dicts are settable.
    pub(crate) fn op_set_property(&mut self, name: Value) -> OpResult {
        let value = self.pop();
        let receiver = self.pop();
        let hash = hash_value(name, &self.heap);
        let Value::Obj(id) = receiver else {
            return Err(self.error(&format!(
                "cannot set property on {}",
                receiver.type_name(&self.heap)
            )));
        };
        let ok = match self.heap.get_mut(id) {
            HeapData::Instance(instance) => {
                instance.properties.set_with_hash(name, hash, value);
                true
            }
            HeapData::Dict(dict) => {
                dict.insert_hashed(name, hash, value);
                true
            }
            _ => false,
        };
        if !ok {
            return Err(self.error(&format!(
                "cannot set property on {}",
                receiver.type_name(&self.heap)
            )));
        }
        self.push(value)
    }

    /// `Invoke` / `InvokeSelf`: method call with the receiver already
    /// `argc` slots deep.
    pub(crate) fn op_invoke(&mut self, name: Value, argc: usize, allow_private: bool) -> OpResult {
        let receiver = self.peek(argc);
        let hash = hash_value(name, &self.heap);
        let action = self.invoke_action(receiver, name, hash, allow_private);
        let slot = self.stack.len() - argc - 1;
        match action {
            InvokeAction::CallField(value) => {
                self.stack[slot] = value;
                self.call_value(value, argc)
            }
            InvokeAction::CallMethod(method) => self.call_method_value(method, receiver, argc),
            InvokeAction::Fail(message) => Err(self.error(&message)),
        }
    }

    fn invoke_action(&self, receiver: Value, name: Value, hash: u64, allow_private: bool) -> InvokeAction {
        let Value::Obj(id) = receiver else {
            return self.missing_method(receiver, name);
        };
        match self.heap.get(id) {
            HeapData::Instance(instance) => {
                if !allow_private && self.is_private_name(name) {
                    return InvokeAction::Fail(format!(
                        "cannot call private method '{}'",
                        display_string(name, &self.heap)
                    ));
                }
                if let Some(field) = instance.properties.get_with_hash(name, hash) {
                    return InvokeAction::CallField(field);
                }
                let Some(method) = self.find_method(instance.class, name, hash) else {
                    return self.missing_method(receiver, name);
                };
                if !allow_private && self.method_is_private(method) {
                    return InvokeAction::Fail(format!(
                        "cannot call private method '{}'",
                        display_string(name, &self.heap)
                    ));
                }
                InvokeAction::CallMethod(method)
            }
            HeapData::Class(class) => {
                if let Some(value) = class.statics.get_with_hash(name, hash) {
                    return InvokeAction::CallField(value);
                }
                let Some(method) = class.methods.get_with_hash(name, hash) else {
                    return self.missing_method(receiver, name);
                };
                if self.method_is_static(method) {
                    InvokeAction::CallMethod(method)
                } else {
                    InvokeAction::Fail(format!(
                        "non-static method '{}' cannot be called directly on a class",
                        display_string(name, &self.heap)
                    ))
                }
            }
            HeapData::Module(module) => {
                if self.is_private_name(name) {
                    return InvokeAction::Fail(format!(
                        "cannot call private module member '{}'",
                        display_string(name, &self.heap)
                    ));
                }
                match module.values.get_with_hash(name, hash) {
                    Some(value) => InvokeAction::CallField(value),
                    None => self.missing_method(receiver, name),
                }
            }
            HeapData::Dict(dict) => {
                if let Some(field) = dict.table.get_with_hash(name, hash) {
                    return InvokeAction::CallField(field);
                }
                match self.dict_methods.get_with_hash(name, hash) {
                    Some(method) => InvokeAction::CallMethod(method),
                    None => self.missing_method(receiver, name),
                }
            }
            HeapData::Str(_) | HeapData::List(_) | HeapData::Bytes(_) | HeapData::Range(_) | HeapData::File(_) => {
                match self.builtin_method(receiver, name, hash) {
                    Some(method) => InvokeAction::CallMethod(method),
                    None => self.missing_method(receiver, name),
                }
            }
            _ => self.missing_method(receiver, name),
        }
    }

    /// `SuperInvoke` / `SuperInvokeSelf`: starts the method search above
    /// the running method's owning class.
    pub(crate) fn op_super_invoke(&mut self, name: Value, argc: usize) -> OpResult {
        let frame = self.frames.last().expect("no active frame");
        let owner = match self.heap.get(frame.function) {
            HeapData::Function(f) => f.owner_class,
            _ => Value::Nil,
        };
        let Some(owner) = owner.as_obj() else {
            return Err(self.error("'parent' used outside of a method"));
        };
        let superclass = match self.heap.get(owner) {
            HeapData::Class(c) => c.superclass,
            _ => Value::Nil,
        };
        let Some(superclass) = superclass.as_obj() else {
            return Err(self.error("class has no superclass"));
        };

        let hash = hash_value(name, &self.heap);
        let Some(method) = self.find_method(superclass, name, hash) else {
            return Err(self.error(&format!(
                "superclass has no method '{}'",
                display_string(name, &self.heap)
            )));
        };
        let receiver = self.peek(argc);
        self.call_method_value(method, receiver, argc)
    }

    // ------------------------------------------------------------------
    // Shared lookup helpers.

    /// Walks the class chain for a method.
    pub(crate) fn find_method(&self, class: HeapId, name: Value, hash: u64) -> Option<Value> {
        let mut current = Some(class);
        while let Some(id) = current {
            let HeapData::Class(c) = self.heap.get(id) else { return None };
            if let Some(method) = c.methods.get_with_hash(name, hash) {
                return Some(method);
            }
            current = c.superclass.as_obj();
        }
        None
    }

    /// The built-in method table entry for a primitive receiver.
    pub(crate) fn builtin_method(&self, receiver: Value, name: Value, hash: u64) -> Option<Value> {
        let Value::Obj(id) = receiver else { return None };
        let table = match self.heap.get(id) {
            HeapData::Str(_) => &self.string_methods,
            HeapData::List(_) => &self.list_methods,
            HeapData::Dict(_) => &self.dict_methods,
            HeapData::Bytes(_) => &self.bytes_methods,
            HeapData::Range(_) => &self.range_methods,
            HeapData::File(_) => &self.file_methods,
            _ => return None,
        };
        table.get_with_hash(name, hash)
    }

    fn call_method_value(&mut self, method: Value, receiver: Value, argc: usize) -> OpResult {
        let method_id = method.as_obj().expect("methods are objects");
        match self.heap.get(method_id) {
            HeapData::NativeFn(_) => self.call_native(method_id, receiver, argc),
            _ => self.call_closure(method_id, argc),
        }
    }

    fn bind_method(&mut self, receiver: Value, method: Value) -> OpResult {
        let method_id = method.as_obj().expect("methods are objects");
        let bound = self.alloc(HeapData::BoundMethod(BoundMethodObj {
            receiver,
            method: method_id,
        }));
        self.set_top(Value::Obj(bound));
        Ok(())
    }

    pub(crate) fn is_private_name(&self, name: Value) -> bool {
        match name {
            Value::Obj(id) => match self.heap.get(id) {
                HeapData::Str(s) => s.bytes().first() == Some(&b'_'),
                _ => false,
            },
            _ => false,
        }
    }

    fn method_is_private(&self, method: Value) -> bool {
        let Some(method_id) = method.as_obj() else { return false };
        let function = match self.heap.get(method_id) {
            HeapData::Closure(c) => c.function,
            _ => return false,
        };
        match self.heap.get(function) {
            HeapData::Function(f) => f.is_private,
            _ => false,
        }
    }

    fn method_is_static(&self, method: Value) -> bool {
        let Some(method_id) = method.as_obj() else { return false };
        let function = match self.heap.get(method_id) {
            HeapData::Closure(c) => c.function,
            // Free-function natives are callable on the class itself;
            // method-kind natives need a receiver instance.
            HeapData::NativeFn(native) => return native.kind == crate::object::NativeKind::Function,
            _ => return false,
        };
        match self.heap.get(function) {
            HeapData::Function(f) => f.is_static,
            _ => false,
        }
    }

    fn missing_property(&self, receiver: Value, name: Value) -> PropAction {
        PropAction::Fail(format!(
            "{} has no property '{}'",
            receiver.type_name(&self.heap),
            display_string(name, &self.heap)
        ))
    }

    fn missing_method(&self, receiver: Value, name: Value) -> InvokeAction {
        InvokeAction::Fail(format!(
            "{} has no method '{}'",
            receiver.type_name(&self.heap),
            display_string(name, &self.heap)
        ))
    }
}
