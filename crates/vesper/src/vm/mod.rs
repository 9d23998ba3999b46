//! The virtual machine.
//!
//! A stack machine over the closed opcode set: a fixed-depth call-frame
//! stack, a bounded value stack, a linked list of open upvalues sorted by
//! descending stack slot, per-frame exception handlers, and the global
//! tables (globals, module registry, intern pool, built-in method
//! tables). The dispatch loop is one `match` per opcode; every operation
//! either completes or produces a [`VmError`] carrying an in-flight
//! exception instance, which the loop hands to the propagation machinery.
//!
//! Garbage collection runs on allocation through [`Vm::alloc`]: when the
//! heap's threshold trips, the VM gathers every root it owns and drives
//! the mark / remove-white / sweep cycle. Operands stay on the value
//! stack until their result has been allocated, so a collection in the
//! middle of an instruction never frees them.

mod attr;
mod call;
mod exceptions;
mod import;
mod index;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::bytecode::Opcode;
use crate::compiler;
use crate::heap::{Heap, HeapId};
use crate::io::EchoWriter;
use crate::methods;
use crate::modules::{ModuleResolver, NoResolver, ResolvedModule};
use crate::object::{BytesObj, ClosureObj, HeapData, ListObj, RangeObj, StrObj, UpvalueObj};
use crate::table::ValueTable;
use crate::value::{compare_values, display_string, hash_bytes, hash_value, Value};

/// Maximum depth of the call-frame stack.
pub(crate) const FRAMES_MAX: usize = 512;
/// Maximum depth of the value stack.
pub(crate) const STACK_MAX: usize = 8192;
/// Maximum registered exception handlers per frame.
pub(crate) const MAX_HANDLERS: usize = 16;
/// Sentinel for an absent try arm, shared with the compiler.
pub(crate) const TRY_NONE: u16 = 0xFFFF;

/// Outcome of one interpretation, mapped to process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    /// The process exit code contract: 0 success, 10 compile failure,
    /// 11 runtime failure. (12 is reserved for allocation failure, which
    /// aborts the process before a result exists.)
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::CompileError => 10,
            Self::RuntimeError => 11,
        }
    }
}

/// Exit code for out-of-memory aborts.
pub const EXIT_OUT_OF_MEMORY: u8 = 12;

/// An in-flight exception: the instance being propagated.
#[derive(Debug)]
pub struct VmError {
    pub(crate) exception: Value,
}

pub(crate) type OpResult = Result<(), VmError>;

/// One registered `try` handler.
#[derive(Debug)]
pub(crate) struct Handler {
    /// The resolved catch class, `Nil` when the arm is finally-only.
    pub(crate) class: Value,
    pub(crate) catch_addr: u16,
    pub(crate) finally_addr: u16,
    /// Value-stack height at registration; propagation rewinds to here.
    pub(crate) stack_base: usize,
}

/// One in-flight function call.
#[derive(Debug)]
pub(crate) struct CallFrame {
    pub(crate) closure: HeapId,
    /// The closure's function, cached to keep fetches to one heap hop.
    pub(crate) function: HeapId,
    pub(crate) ip: usize,
    /// Stack index of slot 0 (receiver / callee).
    pub(crate) base: usize,
    pub(crate) handlers: SmallVec<[Handler; 4]>,
}

/// What the dispatch loop should do after an instruction.
enum Flow {
    Continue,
    Done,
}

/// The machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    pub(crate) open_upvalues: Option<HeapId>,
    /// Built-ins and the bootstrap Exception class.
    pub(crate) globals: ValueTable,
    /// Module registry keyed by source path. Weak: `remove_white` runs on
    /// it during GC so the registry alone keeps no module alive.
    pub(crate) modules: ValueTable,
    /// String intern pool. Weak, like the registry.
    pub(crate) strings: ValueTable,
    pub(crate) string_methods: ValueTable,
    pub(crate) list_methods: ValueTable,
    pub(crate) dict_methods: ValueTable,
    pub(crate) bytes_methods: ValueTable,
    pub(crate) range_methods: ValueTable,
    pub(crate) file_methods: ValueTable,
    pub(crate) exception_class: Value,
    /// Pre-registered native modules by name (`_xxx`).
    pub(crate) native_modules: AHashMap<String, HeapId>,
    /// Paths currently being compiled; guards against cyclic imports.
    pub(crate) compiling_paths: Vec<String>,
    resolver: Box<dyn ModuleResolver>,
    echo: Box<dyn EchoWriter>,
}

impl Vm {
    #[must_use]
    pub fn new(echo: Box<dyn EchoWriter>, resolver: Box<dyn ModuleResolver>) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            open_upvalues: None,
            globals: ValueTable::new(),
            modules: ValueTable::new(),
            strings: ValueTable::new(),
            string_methods: ValueTable::new(),
            list_methods: ValueTable::new(),
            dict_methods: ValueTable::new(),
            bytes_methods: ValueTable::new(),
            range_methods: ValueTable::new(),
            file_methods: ValueTable::new(),
            exception_class: Value::Nil,
            native_modules: AHashMap::new(),
            compiling_paths: Vec::new(),
            resolver,
            echo,
        };
        // Bootstrap allocations are not yet reachable from any root.
        let allowed = vm.heap.set_allow_gc(false);
        methods::install(&mut vm);
        vm.bootstrap_exception_class();
        vm.heap.set_allow_gc(allowed);
        vm
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(Box::new(crate::io::StdEcho), Box::new(NoResolver))
    }

    // ------------------------------------------------------------------
    // Host surface.

    pub(crate) fn echo_out(&mut self, text: &str) {
        self.echo.out(text);
    }

    pub(crate) fn echo_err(&mut self, text: &str) {
        self.echo.err(text);
    }

    pub(crate) fn resolve_module(&self, spec: &str, importer: &str) -> Option<ResolvedModule> {
        self.resolver.resolve(spec, importer)
    }

    pub(crate) fn has_native_module(&self, name: &str) -> bool {
        self.native_modules.contains_key(name)
    }

    /// Compiles and runs one script.
    pub fn interpret(&mut self, source: &str, path: &str) -> InterpretResult {
        let module_name = module_name_from_path(path);
        let Some(function) = compiler::compile(self, source, path, &module_name) else {
            return InterpretResult::CompileError;
        };

        let depth = self.heap.guard(Value::Obj(function));
        let closure = self.alloc(HeapData::Closure(ClosureObj {
            function,
            upvalues: SmallVec::new(),
        }));
        self.heap.truncate_guards(depth);

        self.stack.push(Value::Obj(closure));
        if let Err(err) = self.call_closure(closure, 0) {
            self.report_unhandled(&err);
            self.reset();
            return InterpretResult::RuntimeError;
        }
        match self.run() {
            Ok(()) => {
                self.reset();
                InterpretResult::Ok
            }
            Err(_) => {
                // Diagnostics were printed when propagation exhausted the
                // frame stack.
                self.reset();
                InterpretResult::RuntimeError
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.heap.truncate_guards(0);
    }

    // ------------------------------------------------------------------
    // Allocation and collection.

    /// Allocates through the GC threshold check. Anything the caller
    /// needs to survive the collection must be reachable from the stack
    /// or registered with `heap.guard`.
    pub(crate) fn alloc(&mut self, data: HeapData) -> HeapId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(data)
    }

    /// Interns a string, returning the canonical object for its bytes.
    pub(crate) fn intern(&mut self, text: &str) -> Value {
        let hash = hash_bytes(text.as_bytes());
        if let Some(existing) = self.strings.find_string(&self.heap, text.as_bytes(), hash) {
            return existing;
        }
        let id = self.alloc(HeapData::Str(StrObj::new(text.to_owned(), hash)));
        let value = Value::Obj(id);
        self.strings.set_with_hash(value, hash, Value::Nil);
        value
    }

    /// Gathers every root and runs a full mark / remove-white / sweep
    /// cycle.
    pub(crate) fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = Vec::with_capacity(self.stack.len() + 64);
        roots.extend(self.stack.iter().copied());
        for frame in &self.frames {
            roots.push(Value::Obj(frame.closure));
            for handler in &frame.handlers {
                roots.push(handler.class);
            }
        }
        let mut open = self.open_upvalues;
        while let Some(id) = open {
            roots.push(Value::Obj(id));
            open = match self.heap.get(id) {
                HeapData::Upvalue(upvalue) => upvalue.next,
                _ => None,
            };
        }
        for (key, value) in self.globals.iter() {
            roots.push(key);
            roots.push(value);
        }
        for table in [
            &self.string_methods,
            &self.list_methods,
            &self.dict_methods,
            &self.bytes_methods,
            &self.range_methods,
            &self.file_methods,
        ] {
            for (key, value) in table.iter() {
                roots.push(key);
                roots.push(value);
            }
        }
        roots.push(self.exception_class);
        for id in self.native_modules.values() {
            roots.push(Value::Obj(*id));
        }

        self.heap.mark(&roots);
        // Weak tables: drop entries whose key or value did not survive.
        self.strings.remove_white(&self.heap);
        self.modules.remove_white(&self.heap);
        self.heap.sweep();
    }

    // ------------------------------------------------------------------
    // Stack helpers.

    pub(crate) fn push(&mut self, value: Value) -> OpResult {
        if self.stack.len() >= STACK_MAX {
            return Err(self.error("stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[must_use]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub(crate) fn set_top(&mut self, value: Value) {
        let top = self.stack.len() - 1;
        self.stack[top] = value;
    }

    // ------------------------------------------------------------------
    // Fetching.

    fn fetch_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let HeapData::Function(function) = self.heap.get(frame.function) else {
            unreachable!("frame function is always a function object")
        };
        let byte = function.chunk.byte(frame.ip);
        frame.ip += 1;
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let HeapData::Function(function) = self.heap.get(frame.function) else {
            unreachable!("frame function is always a function object")
        };
        let value = function.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    /// Reads a constant operand from the current chunk.
    fn fetch_constant(&mut self) -> Value {
        let index = self.fetch_u16();
        let frame = self.frames.last().expect("no active frame");
        let HeapData::Function(function) = self.heap.get(frame.function) else {
            unreachable!("frame function is always a function object")
        };
        function.chunk.constant(index)
    }

    // ------------------------------------------------------------------
    // The dispatch loop.

    fn run(&mut self) -> Result<(), VmError> {
        loop {
            let byte = self.fetch_byte();
            let op = Opcode::from_repr(byte).expect("invalid opcode in chunk");
            match self.execute(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(()),
                Err(err) => self.handle_exception(err)?,
            }
        }
    }

    fn execute(&mut self, op: Opcode) -> Result<Flow, VmError> {
        match op {
            Opcode::Nil => self.push(Value::Nil)?,
            Opcode::True => self.push(Value::Bool(true))?,
            Opcode::False => self.push(Value::Bool(false))?,
            Opcode::Empty => self.push(Value::Empty)?,
            Opcode::Constant => {
                let value = self.fetch_constant();
                self.push(value)?;
            }

            Opcode::Add => self.op_add()?,
            Opcode::Subtract => self.numeric_binary(op)?,
            Opcode::Multiply => self.op_multiply()?,
            Opcode::Divide => self.numeric_binary(op)?,
            Opcode::Modulo => self.numeric_binary(op)?,
            Opcode::Pow => self.numeric_binary(op)?,
            Opcode::FloorDivide => self.numeric_binary(op)?,
            Opcode::Negate => {
                let Value::Number(n) = self.peek(0) else {
                    return Err(self.error(&format!(
                        "unary '-' expects a number, not {}",
                        self.peek(0).type_name(&self.heap)
                    )));
                };
                self.set_top(Value::Number(-n));
            }

            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::LShift | Opcode::RShift => {
                self.bitwise_binary(op)?;
            }
            Opcode::BitNot => {
                let Value::Number(n) = self.peek(0) else {
                    return Err(self.error("unary '~' expects a number"));
                };
                self.set_top(Value::Number(!(n as i64) as f64));
            }

            Opcode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b))?;
            }
            Opcode::Greater | Opcode::Less => {
                let b = self.pop();
                let a = self.pop();
                let Some(ordering) = compare_values(a, b, &self.heap) else {
                    return Err(self.error(&format!(
                        "cannot compare {} with {}",
                        a.type_name(&self.heap),
                        b.type_name(&self.heap)
                    )));
                };
                let result = if op == Opcode::Greater {
                    ordering == std::cmp::Ordering::Greater
                } else {
                    ordering == std::cmp::Ordering::Less
                };
                self.push(Value::Bool(result))?;
            }
            Opcode::Not => {
                let value = self.pop();
                let truthy = value.is_truthy(&self.heap);
                self.push(Value::Bool(!truthy))?;
            }

            Opcode::Pop => {
                self.pop();
            }
            Opcode::PopN => {
                let count = usize::from(self.fetch_u16());
                let target = self.stack.len().saturating_sub(count);
                self.stack.truncate(target);
            }
            Opcode::Dup => {
                let value = self.peek(0);
                self.push(value)?;
            }

            Opcode::DefineGlobal => {
                let name = self.fetch_constant();
                let value = self.pop();
                self.define_module_value(name, value);
            }
            Opcode::GetGlobal => {
                let name = self.fetch_constant();
                let value = self.lookup_global(name)?;
                self.push(value)?;
            }
            Opcode::SetGlobal => {
                let name = self.fetch_constant();
                self.set_module_value(name)?;
            }
            Opcode::GetLocal => {
                let slot = usize::from(self.fetch_u16());
                let base = self.frames.last().expect("no active frame").base;
                let value = self.stack[base + slot];
                self.push(value)?;
            }
            Opcode::SetLocal => {
                let slot = usize::from(self.fetch_u16());
                let base = self.frames.last().expect("no active frame").base;
                self.stack[base + slot] = self.peek(0);
            }
            Opcode::GetUpvalue => {
                let index = usize::from(self.fetch_u16());
                let value = self.read_upvalue(index);
                self.push(value)?;
            }
            Opcode::SetUpvalue => {
                let index = usize::from(self.fetch_u16());
                let value = self.peek(0);
                self.write_upvalue(index, value);
            }

            Opcode::Jump => {
                let offset = usize::from(self.fetch_u16());
                self.frames.last_mut().expect("no active frame").ip += offset;
            }
            Opcode::JumpIfFalse => {
                let offset = usize::from(self.fetch_u16());
                if !self.peek(0).is_truthy(&self.heap) {
                    self.frames.last_mut().expect("no active frame").ip += offset;
                }
            }
            Opcode::Loop => {
                let offset = usize::from(self.fetch_u16());
                self.frames.last_mut().expect("no active frame").ip -= offset;
            }
            Opcode::BreakPlaceholder => {
                unreachable!("break placeholders are rewritten before execution")
            }

            Opcode::Call => {
                let argc = usize::from(self.fetch_byte());
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
            }
            Opcode::Closure => self.op_closure()?,
            Opcode::CloseUpvalue => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
            }
            Opcode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("no active frame");
                self.close_upvalues(frame.base);
                self.stack.truncate(frame.base);
                if self.frames.is_empty() {
                    return Ok(Flow::Done);
                }
                self.push(result)?;
            }

            Opcode::GetProperty => {
                let name = self.fetch_constant();
                self.op_get_property(name, false)?;
            }
            Opcode::GetSelfProperty => {
                let name = self.fetch_constant();
                self.op_get_property(name, true)?;
            }
            Opcode::SetProperty => {
                let name = self.fetch_constant();
                self.op_set_property(name)?;
            }
            Opcode::Invoke => {
                let name = self.fetch_constant();
                let argc = usize::from(self.fetch_byte());
                self.op_invoke(name, argc, false)?;
            }
            Opcode::InvokeSelf => {
                let name = self.fetch_constant();
                let argc = usize::from(self.fetch_byte());
                self.op_invoke(name, argc, true)?;
            }
            Opcode::SuperInvoke => {
                let name = self.fetch_constant();
                let argc = usize::from(self.fetch_byte());
                self.op_super_invoke(name, argc)?;
            }
            Opcode::SuperInvokeSelf => {
                let argc = usize::from(self.fetch_byte());
                let name = self.current_method_name()?;
                self.op_super_invoke(name, argc)?;
            }

            Opcode::Class => {
                let name = self.fetch_constant();
                let class = self.alloc(HeapData::Class(crate::object::ClassObj::new(name)));
                self.push(Value::Obj(class))?;
            }
            Opcode::Method => {
                let name = self.fetch_constant();
                self.op_method(name)?;
            }
            Opcode::ClassProperty => {
                let name = self.fetch_constant();
                let is_static = self.fetch_byte() != 0;
                self.op_class_property(name, is_static)?;
            }
            Opcode::Inherit => self.op_inherit()?,

            Opcode::List => {
                let count = usize::from(self.fetch_u16());
                let start = self.stack.len() - count;
                let items = self.stack[start..].to_vec();
                let list = self.alloc(HeapData::List(ListObj { items }));
                self.stack.truncate(start);
                self.push(Value::Obj(list))?;
            }
            Opcode::Dict => {
                let pairs = usize::from(self.fetch_u16());
                self.op_dict(pairs)?;
            }
            Opcode::Range => {
                let upper = self.peek(0);
                let lower = self.peek(1);
                let (Value::Number(lower), Value::Number(upper)) = (lower, upper) else {
                    return Err(self.error("range bounds must be numbers"));
                };
                let range = self.alloc(HeapData::Range(RangeObj::new(lower as i64, upper as i64)));
                self.stack.truncate(self.stack.len() - 2);
                self.push(Value::Obj(range))?;
            }
            Opcode::GetIndex => {
                let keep = self.fetch_byte() != 0;
                self.op_get_index(keep)?;
            }
            Opcode::GetRangedIndex => {
                let keep = self.fetch_byte() != 0;
                self.op_get_ranged_index(keep)?;
            }
            Opcode::SetIndex => self.op_set_index()?,

            Opcode::Try => self.op_try()?,
            Opcode::PopTry => {
                let frame = self.frames.last_mut().expect("no active frame");
                frame.handlers.pop();
            }
            Opcode::PublishTry => {
                let resume = self.pop();
                let exception = self.pop();
                if resume.is_truthy(&self.heap) {
                    return Err(VmError { exception });
                }
            }
            Opcode::Die => {
                let value = self.pop();
                return Err(self.raise_value(value)?);
            }
            Opcode::Assert => self.op_assert()?,

            Opcode::Switch => self.op_switch()?,

            Opcode::CallImport => {
                let function = self.fetch_constant();
                self.op_call_import(function)?;
            }
            Opcode::NativeModule => {
                let name = self.fetch_constant();
                self.op_native_module(name)?;
            }
            Opcode::SelectImport | Opcode::SelectNativeImport => {
                let name = self.fetch_constant();
                self.op_select_import(name)?;
            }
            Opcode::ImportAll | Opcode::ImportAllNative => self.op_import_all()?,
            Opcode::EjectImport | Opcode::EjectNativeImport => {
                let name = self.fetch_constant();
                self.op_eject_import(name);
            }

            Opcode::Echo => {
                let value = self.pop();
                let mut text = display_string(value, &self.heap);
                text.push('\n');
                self.echo_out(&text);
            }
            Opcode::Stringify => {
                let value = self.peek(0);
                let is_string = matches!(value, Value::Obj(id) if matches!(self.heap.get(id), HeapData::Str(_)));
                if !is_string {
                    let text = display_string(value, &self.heap);
                    let interned = self.intern(&text);
                    self.set_top(interned);
                }
            }
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Arithmetic helpers.

    fn op_add(&mut self) -> OpResult {
        let b = self.peek(0);
        let a = self.peek(1);
        let result = match (a, b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
            (Value::Obj(x), Value::Obj(y)) => match (self.heap.get(x), self.heap.get(y)) {
                (HeapData::Str(s1), HeapData::Str(s2)) => {
                    let mut text = String::with_capacity(s1.as_str().len() + s2.as_str().len());
                    text.push_str(s1.as_str());
                    text.push_str(s2.as_str());
                    self.intern(&text)
                }
                (HeapData::List(l1), HeapData::List(l2)) => {
                    let mut items = l1.items.clone();
                    items.extend_from_slice(&l2.items);
                    Value::Obj(self.alloc(HeapData::List(ListObj { items })))
                }
                (HeapData::Bytes(b1), HeapData::Bytes(b2)) => {
                    let mut bytes = b1.bytes.clone();
                    bytes.extend_from_slice(&b2.bytes);
                    Value::Obj(self.alloc(HeapData::Bytes(BytesObj { bytes })))
                }
                _ => {
                    return Err(self.error(&format!(
                        "unsupported operand types for '+': {} and {}",
                        a.type_name(&self.heap),
                        b.type_name(&self.heap)
                    )))
                }
            },
            _ => {
                return Err(self.error(&format!(
                    "unsupported operand types for '+': {} and {}",
                    a.type_name(&self.heap),
                    b.type_name(&self.heap)
                )))
            }
        };
        self.stack.truncate(self.stack.len() - 2);
        self.push(result)
    }

    fn op_multiply(&mut self) -> OpResult {
        let b = self.peek(0);
        let a = self.peek(1);
        let result = match (a, b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(x * y),
            (Value::Obj(x), Value::Number(n)) => {
                if n < 0.0 {
                    return Err(self.error("repeat count cannot be negative"));
                }
                let count = n as usize;
                match self.heap.get(x) {
                    HeapData::List(list) => {
                        let mut items = Vec::with_capacity(list.items.len() * count);
                        for _ in 0..count {
                            items.extend_from_slice(&list.items);
                        }
                        Value::Obj(self.alloc(HeapData::List(ListObj { items })))
                    }
                    HeapData::Str(s) => {
                        let text = s.as_str().repeat(count);
                        self.intern(&text)
                    }
                    _ => {
                        return Err(self.error(&format!(
                            "unsupported operand types for '*': {} and number",
                            a.type_name(&self.heap)
                        )))
                    }
                }
            }
            _ => {
                return Err(self.error(&format!(
                    "unsupported operand types for '*': {} and {}",
                    a.type_name(&self.heap),
                    b.type_name(&self.heap)
                )))
            }
        };
        self.stack.truncate(self.stack.len() - 2);
        self.push(result)
    }

    fn numeric_binary(&mut self, op: Opcode) -> OpResult {
        let b = self.peek(0);
        let a = self.peek(1);
        let (Value::Number(x), Value::Number(y)) = (a, b) else {
            return Err(self.error(&format!(
                "operands must be numbers, not {} and {}",
                a.type_name(&self.heap),
                b.type_name(&self.heap)
            )));
        };
        let result = match op {
            Opcode::Subtract => x - y,
            Opcode::Divide => x / y,
            Opcode::Modulo => x % y,
            Opcode::Pow => x.powf(y),
            Opcode::FloorDivide => (x / y).floor(),
            _ => unreachable!("not a numeric binary opcode"),
        };
        self.stack.truncate(self.stack.len() - 2);
        self.push(Value::Number(result))
    }

    /// Bitwise operators truncate their operands to 64-bit integers.
    fn bitwise_binary(&mut self, op: Opcode) -> OpResult {
        let b = self.peek(0);
        let a = self.peek(1);
        let (Value::Number(x), Value::Number(y)) = (a, b) else {
            return Err(self.error("bitwise operands must be numbers"));
        };
        let x = x as i64;
        let y = y as i64;
        let result = match op {
            Opcode::BitAnd => x & y,
            Opcode::BitOr => x | y,
            Opcode::BitXor => x ^ y,
            Opcode::LShift => x.wrapping_shl((y & 63) as u32),
            Opcode::RShift => x.wrapping_shr((y & 63) as u32),
            _ => unreachable!("not a bitwise opcode"),
        };
        self.stack.truncate(self.stack.len() - 2);
        self.push(Value::Number(result as f64))
    }

    fn op_dict(&mut self, pairs: usize) -> OpResult {
        let start = self.stack.len() - pairs * 2;
        let mut dict = crate::object::DictObj::default();
        for pair in 0..pairs {
            let key = self.stack[start + pair * 2];
            let value = self.stack[start + pair * 2 + 1];
            self.check_dict_key(key)?;
            let hash = hash_value(key, &self.heap);
            dict.insert_hashed(key, hash, value);
        }
        let id = self.alloc(HeapData::Dict(dict));
        self.stack.truncate(start);
        self.push(Value::Obj(id))
    }

    /// Dict keys must be primitive or string; containers and files are
    /// rejected on insert.
    pub(crate) fn check_dict_key(&mut self, key: Value) -> OpResult {
        match key {
            Value::Nil | Value::Bool(_) | Value::Number(_) => Ok(()),
            Value::Obj(id) if matches!(self.heap.get(id), HeapData::Str(_)) => Ok(()),
            _ => Err(self.error(&format!(
                "{} cannot be used as a dictionary key",
                key.type_name(&self.heap)
            ))),
        }
    }

    fn op_switch(&mut self) -> OpResult {
        let switch = self.fetch_constant();
        let subject = self.pop();
        let hash = hash_value(subject, &self.heap);
        let Value::Obj(id) = switch else {
            unreachable!("switch operand is always a switch constant")
        };
        let HeapData::Switch(s) = self.heap.get(id) else {
            unreachable!("switch operand is always a switch constant")
        };
        let offset = match s.table.get_with_hash(subject, hash) {
            Some(Value::Number(rel)) => rel as i64,
            Some(_) => unreachable!("switch table values are offsets"),
            None if s.default_jump >= 0 => i64::from(s.default_jump),
            None => i64::from(s.exit_jump),
        };
        let frame = self.frames.last_mut().expect("no active frame");
        frame.ip = (frame.ip as i64 + offset) as usize;
        Ok(())
    }

    fn op_assert(&mut self) -> OpResult {
        let message = self.pop();
        let condition = self.pop();
        if condition.is_truthy(&self.heap) {
            return Ok(());
        }
        let text = if matches!(message, Value::Nil) {
            "assertion failed".to_owned()
        } else {
            format!("assertion failed: {}", display_string(message, &self.heap))
        };
        Err(self.error(&text))
    }

    // ------------------------------------------------------------------
    // Globals and module values.

    /// The module owning the currently executing function.
    pub(crate) fn current_module(&self) -> Option<HeapId> {
        let frame = self.frames.last()?;
        let HeapData::Function(function) = self.heap.get(frame.function) else {
            return None;
        };
        function.module.as_obj()
    }

    pub(crate) fn define_module_value(&mut self, name: Value, value: Value) {
        let hash = hash_value(name, &self.heap);
        if let Some(module) = self.current_module() {
            if let HeapData::Module(m) = self.heap.get_mut(module) {
                m.values.set_with_hash(name, hash, value);
                return;
            }
        }
        self.globals.set_with_hash(name, hash, value);
    }

    /// Name lookup: current module's values first, then the VM globals.
    fn lookup_global(&mut self, name: Value) -> Result<Value, VmError> {
        let hash = hash_value(name, &self.heap);
        if let Some(module) = self.current_module() {
            if let HeapData::Module(m) = self.heap.get(module) {
                if let Some(value) = m.values.get_with_hash(name, hash) {
                    return Ok(value);
                }
            }
        }
        if let Some(value) = self.globals.get_with_hash(name, hash) {
            return Ok(value);
        }
        Err(self.error(&format!("undefined variable '{}'", display_string(name, &self.heap))))
    }

    /// Assignment to an existing module-level name.
    fn set_module_value(&mut self, name: Value) -> OpResult {
        let value = self.peek(0);
        let hash = hash_value(name, &self.heap);
        if let Some(module) = self.current_module() {
            if let HeapData::Module(m) = self.heap.get_mut(module) {
                if m.values.get_with_hash(name, hash).is_some() {
                    m.values.set_with_hash(name, hash, value);
                    return Ok(());
                }
            }
        }
        Err(self.error(&format!("undefined variable '{}'", display_string(name, &self.heap))))
    }

    // ------------------------------------------------------------------
    // Upvalues.

    fn read_upvalue(&self, index: usize) -> Value {
        let frame = self.frames.last().expect("no active frame");
        let HeapData::Closure(closure) = self.heap.get(frame.closure) else {
            unreachable!("frame closure is always a closure")
        };
        let upvalue = closure.upvalues[index];
        match self.heap.get(upvalue) {
            HeapData::Upvalue(cell) => match cell.location {
                Some(slot) => self.stack[slot],
                None => cell.closed,
            },
            _ => unreachable!("closure upvalues are always upvalue cells"),
        }
    }

    fn write_upvalue(&mut self, index: usize, value: Value) {
        let frame = self.frames.last().expect("no active frame");
        let HeapData::Closure(closure) = self.heap.get(frame.closure) else {
            unreachable!("frame closure is always a closure")
        };
        let upvalue = closure.upvalues[index];
        let slot = match self.heap.get(upvalue) {
            HeapData::Upvalue(cell) => cell.location,
            _ => unreachable!("closure upvalues are always upvalue cells"),
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => {
                if let HeapData::Upvalue(cell) = self.heap.get_mut(upvalue) {
                    cell.closed = value;
                }
            }
        }
    }

    /// Finds or creates the open upvalue for a stack slot, keeping the
    /// list sorted by descending slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut previous: Option<HeapId> = None;
        let mut current = self.open_upvalues;
        while let Some(id) = current {
            let HeapData::Upvalue(cell) = self.heap.get(id) else {
                unreachable!("open list holds only upvalues")
            };
            match cell.location {
                Some(location) if location > slot => {
                    previous = Some(id);
                    current = cell.next;
                }
                Some(location) if location == slot => return id,
                _ => break,
            }
        }

        let created = self.alloc(HeapData::Upvalue(UpvalueObj {
            location: Some(slot),
            closed: Value::Nil,
            next: current,
        }));
        match previous {
            None => self.open_upvalues = Some(created),
            Some(previous) => {
                if let HeapData::Upvalue(cell) = self.heap.get_mut(previous) {
                    cell.next = Some(created);
                }
            }
        }
        created
    }

    /// Closes every open upvalue at or above `from_slot`.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(id) = self.open_upvalues {
            let (location, next) = match self.heap.get(id) {
                HeapData::Upvalue(cell) => (cell.location, cell.next),
                _ => unreachable!("open list holds only upvalues"),
            };
            let Some(location) = location else { break };
            if location < from_slot {
                break;
            }
            let value = self.stack[location];
            if let HeapData::Upvalue(cell) = self.heap.get_mut(id) {
                cell.location = None;
                cell.closed = value;
                cell.next = None;
            }
            self.open_upvalues = next;
        }
    }

    fn op_closure(&mut self) -> OpResult {
        let function_value = self.fetch_constant();
        let Value::Obj(function) = function_value else {
            unreachable!("closure operand is always a function constant")
        };
        let upvalue_count = match self.heap.get(function) {
            HeapData::Function(f) => f.upvalue_count,
            _ => unreachable!("closure operand is always a function constant"),
        };

        let depth = self.heap.guard_depth();
        let mut upvalues: SmallVec<[HeapId; 4]> = SmallVec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.fetch_byte() != 0;
            let index = usize::from(self.fetch_u16());
            let upvalue = if is_local {
                let base = self.frames.last().expect("no active frame").base;
                self.capture_upvalue(base + index)
            } else {
                let frame = self.frames.last().expect("no active frame");
                let HeapData::Closure(enclosing) = self.heap.get(frame.closure) else {
                    unreachable!("frame closure is always a closure")
                };
                enclosing.upvalues[index]
            };
            // Guard each cell: the next capture may allocate and collect.
            self.heap.guard(Value::Obj(upvalue));
            upvalues.push(upvalue);
        }

        let closure = self.alloc(HeapData::Closure(ClosureObj { function, upvalues }));
        self.heap.truncate_guards(depth);
        self.push(Value::Obj(closure))
    }

    // ------------------------------------------------------------------
    // Error construction.

    /// Builds a runtime error as a catchable Exception instance.
    pub(crate) fn error(&mut self, message: &str) -> VmError {
        let exception = self.make_exception(message);
        VmError { exception }
    }
}

/// A standard stream wrapped as a File object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    In,
    Out,
    Err,
}

/// The embedding surface native modules build against.
impl Vm {
    /// Raises a runtime exception from a native function.
    pub fn raise(&mut self, message: &str) -> VmError {
        self.error(message)
    }

    /// Allocates (or finds) the interned string for `text`.
    pub fn make_string(&mut self, text: &str) -> Value {
        self.intern(text)
    }

    pub fn make_list(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(HeapData::List(ListObj { items })))
    }

    pub fn make_bytes(&mut self, bytes: Vec<u8>) -> Value {
        Value::Obj(self.alloc(HeapData::Bytes(BytesObj { bytes })))
    }

    pub fn make_range(&mut self, lower: i64, upper: i64) -> Value {
        Value::Obj(self.alloc(HeapData::Range(RangeObj::new(lower, upper))))
    }

    /// Defines a name in the VM-wide globals, visible from every module.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let depth = self.heap.guard(value);
        let key = self.intern(name);
        let hash = crate::value::hash_value(key, &self.heap);
        self.globals.set_with_hash(key, hash, value);
        self.heap.truncate_guards(depth);
    }

    /// Renders a value the way `echo` would.
    #[must_use]
    pub fn display(&self, value: Value) -> String {
        display_string(value, &self.heap)
    }

    /// Opens a disk file. Modes: `r`, `w`, `a` (plus `+` variants, which
    /// open read-write).
    pub fn open_file(&mut self, path: &str, mode: &str) -> Result<Value, VmError> {
        use std::fs::OpenOptions;
        let mut options = OpenOptions::new();
        match mode.trim_end_matches('+') {
            "r" => {
                options.read(true);
                if mode.ends_with('+') {
                    options.write(true);
                }
            }
            "w" => {
                options.write(true).create(true).truncate(true);
                if mode.ends_with('+') {
                    options.read(true);
                }
            }
            "a" => {
                options.append(true).create(true);
                if mode.ends_with('+') {
                    options.read(true);
                }
            }
            _ => return Err(self.raise(&format!("unknown file mode '{mode}'"))),
        }
        let handle = match options.open(path) {
            Ok(handle) => handle,
            Err(error) => return Err(self.raise(&format!("could not open '{path}': {error}"))),
        };

        let depth = self.heap.guard_depth();
        let path_value = self.intern(path);
        self.heap.guard(path_value);
        let mode_value = self.intern(mode);
        self.heap.guard(mode_value);
        let file = self.alloc(HeapData::File(crate::object::FileObj {
            path: path_value,
            mode: mode_value,
            is_open: true,
            handle: crate::object::FileHandle::Disk(handle),
        }));
        self.heap.truncate_guards(depth);
        Ok(Value::Obj(file))
    }

    /// Wraps a standard stream. Std files carry an empty mode and are
    /// never closed by the VM.
    pub fn make_std_file(&mut self, stream: StdStream) -> Value {
        let (name, handle) = match stream {
            StdStream::In => ("<stdin>", crate::object::FileHandle::Stdin),
            StdStream::Out => ("<stdout>", crate::object::FileHandle::Stdout),
            StdStream::Err => ("<stderr>", crate::object::FileHandle::Stderr),
        };
        let depth = self.heap.guard_depth();
        let path_value = self.intern(name);
        self.heap.guard(path_value);
        let mode_value = self.intern("");
        self.heap.guard(mode_value);
        let file = self.alloc(HeapData::File(crate::object::FileObj {
            path: path_value,
            mode: mode_value,
            is_open: true,
            handle,
        }));
        self.heap.truncate_guards(depth);
        Value::Obj(file)
    }
}

impl Drop for Vm {
    /// Runs the unloader of every imported native module.
    fn drop(&mut self) {
        let unloaders: Vec<(HeapId, crate::object::NativeFn)> = self
            .native_modules
            .values()
            .filter_map(|id| match self.heap.get(*id) {
                HeapData::Module(m) if m.imported => m.unloader.map(|f| (*id, f)),
                _ => None,
            })
            .collect();
        for (module, unloader) in unloaders {
            let _ = unloader(self, Value::Obj(module), &[]);
        }
    }
}

/// Derives a module name from a source path: the file stem.
fn module_name_from_path(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = file.strip_suffix(".vs").unwrap_or(file);
    if stem.is_empty() {
        "main".to_owned()
    } else {
        stem.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names_from_paths() {
        assert_eq!(module_name_from_path("src/app.vs"), "app");
        assert_eq!(module_name_from_path("tool"), "tool");
        assert_eq!(module_name_from_path(""), "main");
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(InterpretResult::Ok.exit_code(), 0);
        assert_eq!(InterpretResult::CompileError.exit_code(), 10);
        assert_eq!(InterpretResult::RuntimeError.exit_code(), 11);
        assert_eq!(EXIT_OUT_OF_MEMORY, 12);
    }

    #[test]
    fn interning_is_unique() {
        let mut vm = Vm::with_defaults();
        let a = vm.intern("hello");
        let b = vm.intern("hello");
        let c = vm.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn open_upvalue_list_stays_sorted() {
        let mut vm = Vm::with_defaults();
        vm.stack.extend([Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        let low = vm.capture_upvalue(0);
        let high = vm.capture_upvalue(2);
        let mid = vm.capture_upvalue(1);
        // Head of the list is the highest slot; addresses strictly
        // decrease along the chain.
        let mut slots = Vec::new();
        let mut current = vm.open_upvalues;
        while let Some(id) = current {
            let HeapData::Upvalue(cell) = vm.heap.get(id) else { panic!("not an upvalue") };
            slots.push(cell.location.expect("open"));
            current = cell.next;
        }
        assert_eq!(slots, vec![2, 1, 0]);
        // Capturing an already-captured slot reuses the cell.
        assert_eq!(vm.capture_upvalue(1), mid);
        assert_eq!(vm.capture_upvalue(0), low);
        assert_eq!(vm.capture_upvalue(2), high);
    }

    #[test]
    fn closing_upvalues_copies_values() {
        let mut vm = Vm::with_defaults();
        vm.stack.extend([Value::Number(7.0), Value::Number(9.0)]);
        let a = vm.capture_upvalue(0);
        let b = vm.capture_upvalue(1);
        vm.close_upvalues(1);
        let HeapData::Upvalue(cell_b) = vm.heap.get(b) else { panic!("not an upvalue") };
        assert_eq!(cell_b.location, None);
        assert_eq!(cell_b.closed, Value::Number(9.0));
        let HeapData::Upvalue(cell_a) = vm.heap.get(a) else { panic!("not an upvalue") };
        assert_eq!(cell_a.location, Some(0));
        assert_eq!(vm.open_upvalues, Some(a));
    }
}
