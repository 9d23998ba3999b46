//! Exceptions: the bootstrap `Exception` class, raising, handler
//! registration, and propagation through nested frames.
//!
//! Every runtime fault is a catchable `Exception` instance. Raising
//! captures a stack-trace string into the instance; propagation walks
//! frames from the top, scanning each frame's handlers latest-registered
//! first. A matching catch resumes at its catch address with the
//! exception pushed; a finally-only handler runs the finally block with a
//! resume marker that `PublishTry` turns back into propagation.

use std::fmt::Write as _;

use smallvec::SmallVec;

use crate::bytecode::{Chunk, Opcode};
use crate::object::{ClassObj, ClosureObj, FunctionObj, HeapData, InstanceObj};
use crate::table::ValueTable;
use crate::value::{display_string, hash_value, Value};

use super::{Handler, OpResult, Vm, VmError, MAX_HANDLERS, TRY_NONE};

impl Vm {
    /// Builds the built-in `Exception` class at VM init: a synthesized
    /// one-argument initializer that stores `message`, plus pre-declared
    /// `message` and `stacktrace` properties.
    pub(crate) fn bootstrap_exception_class(&mut self) {
        let class_name = self.intern("Exception");
        let message_key = self.intern("message");
        let stacktrace_key = self.intern("stacktrace");

        // Hand-assembled initializer:
        //   GetLocal 0; GetLocal 1; SetProperty "message"; Pop;
        //   GetLocal 0; Return
        let mut chunk = Chunk::new();
        let message_const = chunk.add_constant(message_key);
        chunk.write_op(Opcode::GetLocal, 1);
        chunk.write_u16(0, 1);
        chunk.write_op(Opcode::GetLocal, 1);
        chunk.write_u16(1, 1);
        chunk.write_op(Opcode::SetProperty, 1);
        chunk.write_u16(message_const, 1);
        chunk.write_op(Opcode::Pop, 1);
        chunk.write_op(Opcode::GetLocal, 1);
        chunk.write_u16(0, 1);
        chunk.write_op(Opcode::Return, 1);

        let function = self.heap.allocate(HeapData::Function(FunctionObj {
            chunk,
            arity: 1,
            variadic: false,
            upvalue_count: 0,
            name: class_name,
            module: Value::Nil,
            owner_class: Value::Nil,
            is_static: false,
            is_private: false,
        }));
        let initializer = self.heap.allocate(HeapData::Closure(ClosureObj {
            function,
            upvalues: SmallVec::new(),
        }));

        let mut class = ClassObj::new(class_name);
        class.initializer = Value::Obj(initializer);
        class.methods.set(&self.heap, class_name, Value::Obj(initializer));
        class.properties.set(&self.heap, message_key, Value::Nil);
        class.properties.set(&self.heap, stacktrace_key, Value::Nil);
        let class_id = self.heap.allocate(HeapData::Class(class));

        if let HeapData::Function(f) = self.heap.get_mut(function) {
            f.owner_class = Value::Obj(class_id);
        }

        self.exception_class = Value::Obj(class_id);
        self.globals.set(&self.heap, class_name, Value::Obj(class_id));
    }

    /// Builds an Exception instance for an internal runtime fault, with
    /// its message and stack trace already attached.
    pub(crate) fn make_exception(&mut self, message: &str) -> Value {
        let depth = self.heap.guard_depth();
        let message_value = self.intern(message);
        self.heap.guard(message_value);
        let trace = self.capture_stacktrace();
        let trace_value = self.intern(&trace);
        self.heap.guard(trace_value);
        let message_key = self.intern("message");
        self.heap.guard(message_key);
        let stacktrace_key = self.intern("stacktrace");
        self.heap.guard(stacktrace_key);

        let Some(class) = self.exception_class.as_obj() else {
            unreachable!("exception class is bootstrapped at init")
        };
        let mut properties = ValueTable::new();
        properties.set(&self.heap, message_key, message_value);
        properties.set(&self.heap, stacktrace_key, trace_value);
        let instance = self.alloc(HeapData::Instance(InstanceObj { class, properties }));
        self.heap.truncate_guards(depth);
        Value::Obj(instance)
    }

    /// `die`: validates the operand and starts propagation, stamping the
    /// stack trace into the instance.
    pub(crate) fn raise_value(&mut self, value: Value) -> Result<VmError, VmError> {
        if !self.is_exception_value(value) {
            return Err(self.error("can only die with an instance of Exception"));
        }
        let trace = self.capture_stacktrace();
        let trace_value = self.intern(&trace);
        let stacktrace_key = self.intern("stacktrace");
        let hash = hash_value(stacktrace_key, &self.heap);
        if let Value::Obj(id) = value {
            if let HeapData::Instance(instance) = self.heap.get_mut(id) {
                instance.properties.set_with_hash(stacktrace_key, hash, trace_value);
            }
        }
        Ok(VmError { exception: value })
    }

    /// True when the value is an instance of `Exception` or a subclass.
    pub(crate) fn is_exception_value(&self, value: Value) -> bool {
        let Value::Obj(id) = value else { return false };
        let HeapData::Instance(instance) = self.heap.get(id) else {
            return false;
        };
        self.class_is_a(Value::Obj(instance.class), self.exception_class)
    }

    /// Walks a class chain looking for `target`.
    fn class_is_a(&self, class: Value, target: Value) -> bool {
        let mut current = class;
        while let Some(id) = current.as_obj() {
            if current == target {
                return true;
            }
            current = match self.heap.get(id) {
                HeapData::Class(c) => c.superclass,
                _ => return false,
            };
        }
        false
    }

    /// One line per live frame:
    /// `    <file>:<line> -> <fnname>()`.
    pub(crate) fn capture_stacktrace(&self) -> String {
        let mut trace = String::new();
        for (index, frame) in self.frames.iter().enumerate() {
            let HeapData::Function(function) = self.heap.get(frame.function) else {
                continue;
            };
            let file = match function.module {
                Value::Obj(id) => match self.heap.get(id) {
                    HeapData::Module(m) => display_string(m.path, &self.heap),
                    _ => "<builtin>".to_owned(),
                },
                _ => "<builtin>".to_owned(),
            };
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            let name = match function.name {
                Value::Nil => "<anonymous>".to_owned(),
                other => display_string(other, &self.heap),
            };
            if index > 0 {
                trace.push('\n');
            }
            let _ = write!(trace, "    {file}:{line} -> {name}()");
        }
        trace
    }

    /// `Try`: resolves the catch class and registers a handler.
    pub(crate) fn op_try(&mut self) -> OpResult {
        let type_const = self.fetch_u16();
        let catch_addr = self.fetch_u16();
        let finally_addr = self.fetch_u16();

        let class = if catch_addr == TRY_NONE {
            Value::Nil
        } else {
            let frame = self.frames.last().expect("no active frame");
            let name = match self.heap.get(frame.function) {
                HeapData::Function(f) => f.chunk.constant(type_const),
                _ => unreachable!("frame function is always a function"),
            };
            let resolved = self.lookup_global(name)?;
            let is_class = matches!(resolved, Value::Obj(id) if matches!(self.heap.get(id), HeapData::Class(_)));
            if !is_class {
                return Err(self.error(&format!(
                    "'{}' is not an exception class",
                    display_string(name, &self.heap)
                )));
            }
            resolved
        };

        let stack_base = self.stack.len();
        let handler_count = self.frames.last().map_or(0, |frame| frame.handlers.len());
        if handler_count >= MAX_HANDLERS {
            return Err(self.error("too many nested exception handlers"));
        }
        let frame = self.frames.last_mut().expect("no active frame");
        frame.handlers.push(Handler {
            class,
            catch_addr,
            finally_addr,
            stack_base,
        });
        Ok(())
    }

    /// Propagates an exception: scans handlers top frame down, latest
    /// registration first. Returns `Ok` when a handler took control and
    /// `Err` (after printing the diagnostic) when the frame stack is
    /// exhausted.
    pub(crate) fn handle_exception(&mut self, err: VmError) -> Result<(), VmError> {
        let exception = err.exception;
        while !self.frames.is_empty() {
            let handler = self
                .frames
                .last_mut()
                .expect("frames checked non-empty")
                .handlers
                .pop();
            let Some(handler) = handler else {
                // No handler in this frame; unwind it and keep walking.
                let frame = self.frames.pop().expect("frames checked non-empty");
                self.close_upvalues(frame.base);
                self.stack.truncate(frame.base);
                continue;
            };

            if handler.catch_addr != TRY_NONE && self.exception_matches(exception, handler.class) {
                let frame = self.frames.last_mut().expect("frames checked non-empty");
                // Keep a finally-only remainder registered: a throw from
                // the catch body still runs the finally block.
                frame.handlers.push(Handler {
                    class: Value::Nil,
                    catch_addr: TRY_NONE,
                    finally_addr: handler.finally_addr,
                    stack_base: handler.stack_base,
                });
                frame.ip = usize::from(handler.catch_addr);
                self.close_upvalues(handler.stack_base);
                self.stack.truncate(handler.stack_base);
                self.stack.push(exception);
                return Ok(());
            }
            if handler.finally_addr != TRY_NONE {
                let frame = self.frames.last_mut().expect("frames checked non-empty");
                frame.ip = usize::from(handler.finally_addr);
                self.close_upvalues(handler.stack_base);
                self.stack.truncate(handler.stack_base);
                self.stack.push(exception);
                self.stack.push(Value::Bool(true));
                return Ok(());
            }
            // Neither arm applies; the registration is spent.
        }
        self.report_unhandled(&VmError { exception });
        Err(VmError { exception })
    }

    fn exception_matches(&self, exception: Value, handler_class: Value) -> bool {
        let Value::Obj(id) = exception else { return false };
        let HeapData::Instance(instance) = self.heap.get(id) else {
            return false;
        };
        self.class_is_a(Value::Obj(instance.class), handler_class)
    }

    /// Prints an unhandled exception with its class, message and stack
    /// trace to the diagnostic sink.
    pub(crate) fn report_unhandled(&mut self, err: &VmError) {
        let exception = err.exception;
        let mut class_name = "Exception".to_owned();
        let mut message = String::new();
        let mut stacktrace = String::new();
        if let Value::Obj(id) = exception {
            if let HeapData::Instance(instance) = self.heap.get(id) {
                if let HeapData::Class(class) = self.heap.get(instance.class) {
                    class_name = display_string(class.name, &self.heap);
                }
                let message_key = self.strings_lookup("message");
                let stacktrace_key = self.strings_lookup("stacktrace");
                if let Some(key) = message_key {
                    if let Some(value) = instance.properties.get(&self.heap, key) {
                        if !matches!(value, Value::Nil) {
                            message = display_string(value, &self.heap);
                        }
                    }
                }
                if let Some(key) = stacktrace_key {
                    if let Some(value) = instance.properties.get(&self.heap, key) {
                        if !matches!(value, Value::Nil) {
                            stacktrace = display_string(value, &self.heap);
                        }
                    }
                }
            }
        }
        let mut text = format!("Unhandled {class_name}");
        if !message.is_empty() {
            text.push_str(": ");
            text.push_str(&message);
        }
        text.push('\n');
        if !stacktrace.is_empty() {
            text.push_str(&stacktrace);
            text.push('\n');
        }
        self.echo_err(&text);
    }

    /// Looks up an already-interned string without allocating.
    fn strings_lookup(&self, text: &str) -> Option<Value> {
        let hash = crate::value::hash_bytes(text.as_bytes());
        self.strings.find_string(&self.heap, text.as_bytes(), hash)
    }
}
