//! Call machinery: closures, classes, bound methods, natives.

use smallvec::SmallVec;

use crate::heap::HeapId;
use crate::object::{HeapData, InstanceObj, ListObj, NativeFn};
use crate::value::{display_string, hash_value, Value};

use super::{CallFrame, OpResult, Vm, VmError, FRAMES_MAX};

impl Vm {
    /// Calls whatever sits `argc` slots below the top of the stack.
    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> OpResult {
        let Value::Obj(id) = callee else {
            return Err(self.error(&format!("{} is not callable", callee.type_name(&self.heap))));
        };
        match self.heap.get(id) {
            HeapData::Closure(_) => self.call_closure(id, argc),
            HeapData::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                match self.heap.get(method) {
                    HeapData::NativeFn(_) => self.call_native(method, receiver, argc),
                    _ => self.call_closure(method, argc),
                }
            }
            HeapData::Class(_) => self.call_class(id, argc),
            HeapData::NativeFn(_) => self.call_native(id, Value::Nil, argc),
            _ => Err(self.error(&format!("{} is not callable", callee.type_name(&self.heap)))),
        }
    }

    /// Pushes a frame for a closure call.
    ///
    /// Fixed functions raise on over-supply and pad missing arguments
    /// with `nil`; variadic functions collect the surplus into the
    /// trailing `__args__` list, so they always enter with `arity + 1`
    /// argument slots.
    pub(crate) fn call_closure(&mut self, closure: HeapId, argc: usize) -> OpResult {
        let function = match self.heap.get(closure) {
            HeapData::Closure(c) => c.function,
            _ => unreachable!("call_closure requires a closure"),
        };
        let (arity, variadic, name) = match self.heap.get(function) {
            HeapData::Function(f) => (usize::from(f.arity), f.variadic, f.name),
            _ => unreachable!("closure function is always a function"),
        };

        let mut argc = argc;
        if variadic {
            while argc < arity {
                self.push(Value::Nil)?;
                argc += 1;
            }
            let surplus = argc - arity;
            let start = self.stack.len() - surplus;
            let items = self.stack[start..].to_vec();
            let list = self.alloc(HeapData::List(ListObj { items }));
            self.stack.truncate(start);
            self.push(Value::Obj(list))?;
            argc = arity + 1;
        } else if argc > arity {
            let shown = display_string(name, &self.heap);
            return Err(self.error(&format!("too many arguments to {shown}() (expected {arity}, got {argc})")));
        } else {
            while argc < arity {
                self.push(Value::Nil)?;
                argc += 1;
            }
        }

        if self.frames.len() >= FRAMES_MAX {
            return Err(self.error("stack overflow"));
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - argc - 1,
            handlers: SmallVec::new(),
        });
        Ok(())
    }

    /// Constructs an instance and runs the initializer chain's nearest
    /// initializer, if any.
    fn call_class(&mut self, class: HeapId, argc: usize) -> OpResult {
        // Property defaults were flattened into this class at
        // inheritance, so seeding is one copy.
        let mut properties = crate::table::ValueTable::new();
        if let HeapData::Class(c) = self.heap.get(class) {
            properties.extend_from(&c.properties);
        }
        let instance = self.alloc(HeapData::Instance(InstanceObj { class, properties }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance);

        let initializer = self.find_initializer(class);
        match initializer {
            Some(init) => match self.heap.get(init) {
                HeapData::NativeFn(_) => self.call_native(init, Value::Obj(instance), argc),
                _ => self.call_closure(init, argc),
            },
            None => {
                if argc != 0 {
                    let name = match self.heap.get(class) {
                        HeapData::Class(c) => display_string(c.name, &self.heap),
                        _ => String::new(),
                    };
                    return Err(self.error(&format!("{name}() takes no arguments (got {argc})")));
                }
                Ok(())
            }
        }
    }

    /// Walks the superclass chain for the nearest initializer.
    fn find_initializer(&self, class: HeapId) -> Option<HeapId> {
        let mut current = Some(class);
        while let Some(id) = current {
            let HeapData::Class(c) = self.heap.get(id) else { return None };
            if let Value::Obj(init) = c.initializer {
                return Some(init);
            }
            current = c.superclass.as_obj();
        }
        None
    }

    /// Invokes a native function: arguments are copied out, the stack is
    /// rewound past them, and the native's result takes the callee slot.
    /// GC guards the native registered are cleared on return.
    pub(crate) fn call_native(&mut self, native: HeapId, receiver: Value, argc: usize) -> OpResult {
        let function: NativeFn = match self.heap.get(native) {
            HeapData::NativeFn(f) => f.function,
            _ => unreachable!("call_native requires a native descriptor"),
        };
        let start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[start..].to_vec();
        let depth = self.heap.guard_depth();
        let result = function(self, receiver, &args);
        self.heap.truncate_guards(depth);
        let result = result?;
        self.stack.truncate(start - 1);
        self.push(result)
    }

    // ------------------------------------------------------------------
    // Class body opcodes.

    /// `Method`: pops a closure, installs it on the class below it.
    pub(crate) fn op_method(&mut self, name: Value) -> OpResult {
        let method = self.peek(0);
        let class_value = self.peek(1);
        let Value::Obj(method_id) = method else {
            unreachable!("method opcode always sees a closure")
        };
        let Value::Obj(class_id) = class_value else {
            return Err(self.error("methods can only be declared on classes"));
        };

        let class_name = match self.heap.get(class_id) {
            HeapData::Class(c) => c.name,
            _ => return Err(self.error("methods can only be declared on classes")),
        };

        // Stamp the owning class onto the function for parent dispatch,
        // and read the flags the compiler recorded.
        let function_id = match self.heap.get(method_id) {
            HeapData::Closure(c) => c.function,
            _ => unreachable!("methods are always closures"),
        };
        let is_initializer = {
            let HeapData::Function(f) = self.heap.get_mut(function_id) else {
                unreachable!("closure function is always a function")
            };
            f.owner_class = class_value;
            !f.is_static && f.name == class_name
        };

        let hash = hash_value(name, &self.heap);
        let HeapData::Class(class) = self.heap.get_mut(class_id) else {
            unreachable!("checked above")
        };
        class.methods.set_with_hash(name, hash, method);
        if is_initializer {
            // The initializer also lives in the method table under the
            // class name; both views stay in sync.
            class.initializer = method;
        }
        self.pop();
        Ok(())
    }

    /// `ClassProperty`: pops a default value into the class's property
    /// or static table.
    pub(crate) fn op_class_property(&mut self, name: Value, is_static: bool) -> OpResult {
        let value = self.peek(0);
        let class_value = self.peek(1);
        let Value::Obj(class_id) = class_value else {
            return Err(self.error("properties can only be declared on classes"));
        };
        let hash = hash_value(name, &self.heap);
        let HeapData::Class(class) = self.heap.get_mut(class_id) else {
            return Err(self.error("properties can only be declared on classes"));
        };
        if is_static {
            class.statics.set_with_hash(name, hash, value);
        } else {
            class.properties.set_with_hash(name, hash, value);
        }
        self.pop();
        Ok(())
    }

    /// `Inherit`: copies the parent's property defaults and methods into
    /// the child and records the superclass link.
    pub(crate) fn op_inherit(&mut self) -> OpResult {
        let child_value = self.pop();
        let parent_value = self.pop();
        let Value::Obj(child) = child_value else {
            unreachable!("inherit always sees the child class on top")
        };
        let Value::Obj(parent) = parent_value else {
            return Err(self.error("superclass must be a class"));
        };

        let (methods, properties) = match self.heap.get(parent) {
            HeapData::Class(p) => {
                let mut methods = crate::table::ValueTable::new();
                methods.extend_from(&p.methods);
                let mut properties = crate::table::ValueTable::new();
                properties.extend_from(&p.properties);
                (methods, properties)
            }
            _ => return Err(self.error("superclass must be a class")),
        };

        let HeapData::Class(c) = self.heap.get_mut(child) else {
            unreachable!("checked above")
        };
        c.methods = methods;
        c.properties = properties;
        c.superclass = parent_value;
        self.push(child_value)
    }

    /// The running method's name, for `parent(...)` re-dispatch.
    pub(crate) fn current_method_name(&mut self) -> Result<Value, VmError> {
        let frame = self.frames.last().expect("no active frame");
        let name = match self.heap.get(frame.function) {
            HeapData::Function(f) => f.name,
            _ => Value::Nil,
        };
        if matches!(name, Value::Nil) {
            return Err(self.error("'parent' call outside of a named method"));
        }
        Ok(name)
    }
}
