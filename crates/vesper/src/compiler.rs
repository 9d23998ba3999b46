//! The single-pass compiler.
//!
//! A Pratt parser drives expression compilation; statements are plain
//! recursive descent. Bytecode is emitted directly into the current
//! function's chunk - there is no AST. Forward jumps are emitted with a
//! placeholder offset and back-patched once the target is known; `break`
//! uses a placeholder opcode rewritten by a scan over the loop body that
//! walks instructions with the shared operand-width table.
//!
//! Each nested function gets its own [`FuncState`] with up to 256 local
//! slots (slot 0 reserved for the receiver), a scope-depth counter, and
//! the upvalue list threading captures through enclosing functions.
//!
//! The compiler holds collection off for its whole run: functions under
//! construction own constants the heap cannot yet reach from any root,
//! and deferring collection keeps them alive without registration.

use crate::bytecode::{Chunk, Opcode};
use crate::heap::HeapId;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::{FunctionObj, HeapData, ModuleObj, SwitchObj};
use crate::table::ValueTable;
use crate::value::{hash_value, Value};
use crate::vm::Vm;

/// Per-function cap on local slots.
const MAX_LOCALS: usize = 256;
/// Per-function cap on captured upvalues.
const MAX_UPVALUES: usize = 256;
/// Sentinel for an absent try arm in the `Try` payload.
const TRY_NONE: u16 = 0xFFFF;

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment, // = += -= ...
    Conditional, // ?:
    Or,
    And,
    Equality,   // == !=
    Comparison, // < > <= >=
    BitOr,
    BitXor,
    BitAnd,
    Shift, // << >>
    Range, // ..
    Term,  // + -
    Factor, // * / % //
    Exponent, // **
    Unary, // ! - ~
    Call,  // . () []
}

impl Prec {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Conditional,
            Self::Conditional => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::BitOr,
            Self::BitOr => Self::BitXor,
            Self::BitXor => Self::BitAnd,
            Self::BitAnd => Self::Shift,
            Self::Shift => Self::Range,
            Self::Range => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Exponent,
            Self::Exponent => Self::Unary,
            Self::Unary | Self::Call => Self::Call,
        }
    }
}

/// What kind of function a [`FuncState`] is building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
    Anonymous,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueSpec {
    index: u16,
    is_local: bool,
}

/// One loop being compiled: where `continue` goes, which scope it owns,
/// and where to start scanning for break placeholders.
#[derive(Debug)]
struct LoopCtx {
    continue_target: Option<usize>,
    continue_patches: Vec<usize>,
    scope_depth: i32,
    scan_start: usize,
}

/// One function under construction.
#[derive(Debug)]
struct FuncState<'src> {
    chunk: Chunk,
    kind: FunctionKind,
    name: String,
    arity: u8,
    variadic: bool,
    is_static: bool,
    is_private: bool,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSpec>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
}

impl<'src> FuncState<'src> {
    fn new(kind: FunctionKind, name: String) -> Self {
        // Slot 0 belongs to the receiver in methods and is otherwise
        // unreachable from user code.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) { "self" } else { "" },
            depth: 0,
            captured: false,
        };
        Self {
            chunk: Chunk::new(),
            kind,
            name,
            arity: 0,
            variadic: false,
            is_static: false,
            is_private: false,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct ClassCtx {
    name: String,
    has_superclass: bool,
}

/// The compiler: parser state plus the chain of functions and classes
/// being compiled.
pub struct Compiler<'src, 'vm> {
    vm: &'vm mut Vm,
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    funcs: Vec<FuncState<'src>>,
    classes: Vec<ClassCtx>,
    module: HeapId,
    path: String,
}

/// Compiles one module's source to its top-level function.
///
/// Returns `None` when any syntax error was reported; diagnostics have
/// already been written to the error sink.
pub fn compile(vm: &mut Vm, source: &str, path: &str, module_name: &str) -> Option<HeapId> {
    let was_allowed = vm.heap.set_allow_gc(false);

    let name_value = vm.intern(module_name);
    let path_value = vm.intern(path);
    let module = vm.heap.allocate(HeapData::Module(ModuleObj::new(name_value, path_value)));

    let mut compiler = Compiler {
        vm: &mut *vm,
        lexer: Lexer::new(source),
        current: Token::synthetic(TokenKind::Eof, ""),
        previous: Token::synthetic(TokenKind::Eof, ""),
        had_error: false,
        panic_mode: false,
        funcs: vec![FuncState::new(FunctionKind::Script, module_name.to_owned())],
        classes: Vec::new(),
        module,
        path: path.to_owned(),
    };

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let had_error = compiler.had_error;
    let function = compiler.finish_function();

    vm.heap.set_allow_gc(was_allowed);
    if had_error {
        None
    } else {
        Some(function)
    }
}

impl<'src> Compiler<'src, '_> {
    // ------------------------------------------------------------------
    // Token plumbing.

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Skips newline tokens where a line break does not end anything.
    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    /// Skips newlines and stray semicolons between statements; block-like
    /// statements consume no terminator of their own, so a `};` sequence
    /// leaves a separator behind.
    fn skip_terminators(&mut self) {
        while self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Statement terminator: `;`, newline, or an implicit end before a
    /// closing brace / `when` arm / end of input.
    fn consume_statement_end(&mut self) {
        if self.match_token(TokenKind::Semicolon) || self.match_token(TokenKind::Newline) {
            self.skip_terminators();
            return;
        }
        if matches!(
            self.current.kind,
            TokenKind::RBrace | TokenKind::Eof | TokenKind::When | TokenKind::Default | TokenKind::Catch | TokenKind::Finally | TokenKind::While
        ) {
            return;
        }
        self.error_at_current("expected newline or ';' after statement");
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(&token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_owned(),
            TokenKind::Error | TokenKind::Newline => String::new(),
            _ => format!(" near '{}'", token.lexeme),
        };
        let text = format!("SyntaxError: {message}\n    {}:{}{location}\n", self.path, token.line);
        self.vm.echo_err(&text);
    }

    /// Skips forward to a statement boundary after a parse error, so one
    /// mistake does not cascade.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Newline || self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Do
                | TokenKind::Using
                | TokenKind::Echo
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Try
                | TokenKind::Die
                | TokenKind::Assert
                | TokenKind::Break
                | TokenKind::Continue => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Emission helpers.

    fn func(&mut self) -> &mut FuncState<'src> {
        self.funcs.last_mut().expect("compiler function chain is never empty")
    }

    fn chunk_len(&mut self) -> usize {
        self.func().chunk.len()
    }

    fn emit_op(&mut self, op: Opcode) {
        let line = self.previous.line;
        self.func().chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.func().chunk.write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.func().chunk.write_u16(value, line);
    }

    fn emit_op_u16(&mut self, op: Opcode, value: u16) {
        self.emit_op(op);
        self.emit_u16(value);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        self.func().chunk.add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_u16(Opcode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let value = self.vm.intern(name);
        self.make_constant(value)
    }

    /// Emits a forward jump; returns the offset of its operand for
    /// patching.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        let at = self.chunk_len();
        self.emit_u16(TRY_NONE);
        at
    }

    fn patch_jump(&mut self, operand_at: usize) {
        let target = self.chunk_len();
        let jump = target - (operand_at + 2);
        if jump > usize::from(u16::MAX) {
            self.error("too much code to jump over");
            return;
        }
        self.func().chunk.patch_u16(operand_at, jump as u16);
    }

    /// Emits a backward `Loop` to `target`.
    fn emit_loop(&mut self, target: usize) {
        self.emit_op(Opcode::Loop);
        let jump = self.chunk_len() + 2 - target;
        if jump > usize::from(u16::MAX) {
            self.error("loop body too large");
        }
        self.emit_u16(jump as u16);
    }

    // ------------------------------------------------------------------
    // Scopes, locals and upvalues.

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func().scope_depth -= 1;
        let depth = self.func().scope_depth;
        loop {
            let captured = {
                let func = self.funcs.last().expect("function chain never empty");
                match func.locals.last() {
                    Some(local) if func.locals.len() > 1 && local.depth > depth => Some(local.captured),
                    _ => None,
                }
            };
            let Some(captured) = captured else { break };
            self.funcs.last_mut().expect("function chain never empty").locals.pop();
            self.emit_op(if captured { Opcode::CloseUpvalue } else { Opcode::Pop });
        }
    }

    /// Emits pops for locals above `depth` without forgetting them;
    /// `break` and `continue` leave the scope structure intact.
    fn discard_locals_above(&mut self, depth: i32) {
        let func = self.funcs.last().expect("function chain never empty");
        let flags: Vec<bool> = func
            .locals
            .iter()
            .skip(1)
            .filter(|l| l.depth > depth)
            .map(|l| l.captured)
            .collect();
        if flags.len() > 1 && flags.iter().all(|captured| !captured) {
            self.emit_op_u16(Opcode::PopN, flags.len() as u16);
            return;
        }
        // Top of stack first; captured slots close instead of popping.
        for &captured in flags.iter().rev() {
            self.emit_op(if captured { Opcode::CloseUpvalue } else { Opcode::Pop });
        }
    }

    fn add_local(&mut self, name: &'src str) -> Option<u16> {
        if self.func().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return None;
        }
        let depth = self.func().scope_depth;
        // Shadowing within the same scope is a redeclaration.
        let duplicate = self
            .funcs
            .last()
            .expect("function chain never empty")
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth || l.depth == -1)
            .any(|l| l.name == name && !name.is_empty());
        if duplicate {
            self.error("a variable with this name already exists in this scope");
        }
        let func = self.func();
        func.locals.push(Local { name, depth: -1, captured: false });
        Some((func.locals.len() - 1) as u16)
    }

    fn mark_initialized(&mut self) {
        let depth = self.func().scope_depth;
        if let Some(local) = self.func().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&mut self, func_index: usize, name: &str) -> Option<u16> {
        let mut uninitialized = false;
        let slot = {
            let func = &self.funcs[func_index];
            func.locals.iter().enumerate().rev().find_map(|(slot, local)| {
                if local.name == name {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    Some(slot as u16)
                } else {
                    None
                }
            })
        };
        if uninitialized {
            self.error("cannot read a local variable in its own initializer");
        }
        slot
    }

    fn add_upvalue(&mut self, func_index: usize, index: u16, is_local: bool) -> Option<u16> {
        let spec = UpvalueSpec { index, is_local };
        let func = &mut self.funcs[func_index];
        if let Some(existing) = func.upvalues.iter().position(|u| *u == spec) {
            return Some(existing as u16);
        }
        if func.upvalues.len() >= MAX_UPVALUES {
            self.error("too many captured variables in function");
            return None;
        }
        func.upvalues.push(spec);
        Some((func.upvalues.len() - 1) as u16)
    }

    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u16> {
        if func_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(func_index - 1, name) {
            self.funcs[func_index - 1].locals[usize::from(local)].captured = true;
            return self.add_upvalue(func_index, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(func_index - 1, name) {
            return self.add_upvalue(func_index, upvalue, false);
        }
        None
    }

    // ------------------------------------------------------------------
    // Function assembly.

    /// Pops the current `FuncState` and allocates its `FunctionObj`.
    fn finish_function(&mut self) -> HeapId {
        // Implicit return: initializers return the receiver.
        if self.funcs.last().is_some_and(|f| f.kind == FunctionKind::Initializer) {
            self.emit_op_u16(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);

        let func = self.funcs.pop().expect("function chain never empty");
        let name = if func.name.is_empty() { Value::Nil } else { self.vm.intern(&func.name) };
        self.vm.heap.allocate(HeapData::Function(FunctionObj {
            chunk: func.chunk,
            arity: func.arity,
            variadic: func.variadic,
            upvalue_count: func.upvalues.len(),
            name,
            module: Value::Obj(self.module),
            owner_class: Value::Nil,
            is_static: func.is_static,
            is_private: func.is_private,
        }))
    }

    /// Parses `(params) { body }` into a new function and emits the
    /// `Closure` instruction for it in the enclosing function.
    fn function_body(&mut self, kind: FunctionKind, name: String, is_static: bool) {
        let is_private = name.starts_with('_');
        let mut state = FuncState::new(kind, name);
        state.is_static = is_static;
        state.is_private = is_private;
        self.funcs.push(state);
        self.begin_scope();

        self.consume(TokenKind::LParen, "expected '(' after function name");
        self.skip_newlines();
        if !self.check(TokenKind::RParen) {
            loop {
                self.skip_newlines();
                if self.match_token(TokenKind::Ellipsis) {
                    self.func().variadic = true;
                    // The surplus arguments arrive as a list bound here.
                    if let Some(_slot) = self.add_local("__args__") {
                        self.mark_initialized();
                    }
                    break;
                }
                self.consume(TokenKind::Identifier, "expected parameter name");
                let param = self.previous.lexeme;
                if self.func().arity == u8::MAX {
                    self.error("too many parameters");
                }
                self.func().arity = self.func().arity.wrapping_add(1);
                if self.add_local(param).is_some() {
                    self.mark_initialized();
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RParen, "expected ')' after parameters");
        self.consume(TokenKind::LBrace, "expected '{' before function body");
        self.block();

        let upvalues: Vec<UpvalueSpec> = self.funcs.last().expect("function chain never empty").upvalues.clone();
        let function = self.finish_function();
        let index = self.make_constant(Value::Obj(function));
        self.emit_op_u16(Opcode::Closure, index);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_u16(upvalue.index);
        }
    }

    // ------------------------------------------------------------------
    // Declarations and statements.

    fn declaration(&mut self) {
        self.skip_terminators();
        if self.check(TokenKind::Eof) {
            return;
        }
        if self.match_token(TokenKind::Var) {
            self.var_declaration(true);
        } else if self.match_token(TokenKind::Def) {
            self.def_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, consume_end: bool) {
        loop {
            self.consume(TokenKind::Identifier, "expected variable name");
            let name = self.previous.lexeme;
            let slot = self.declare_variable(name);
            if self.match_token(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(Opcode::Nil);
            }
            self.define_variable(slot, name);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        if consume_end {
            self.consume_statement_end();
        }
    }

    /// Declares a name: a local in any enclosed scope, a global at the
    /// module's top level (returns `None` for globals).
    fn declare_variable(&mut self, name: &'src str) -> Option<u16> {
        if self.func().scope_depth > 0 {
            self.add_local(name)
        } else {
            None
        }
    }

    fn define_variable(&mut self, slot: Option<u16>, name: &str) {
        if slot.is_some() {
            self.mark_initialized();
        } else {
            let index = self.identifier_constant(name);
            self.emit_op_u16(Opcode::DefineGlobal, index);
        }
    }

    fn def_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected function name");
        let name = self.previous.lexeme;
        let slot = self.declare_variable(name);
        if slot.is_some() {
            // Allow recursion: the function may refer to itself.
            self.mark_initialized();
        }
        self.function_body(FunctionKind::Function, name.to_owned(), false);
        if slot.is_none() {
            let index = self.identifier_constant(name);
            self.emit_op_u16(Opcode::DefineGlobal, index);
        }
        self.consume_statement_end();
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        let slot = self.declare_variable(name);
        self.emit_op_u16(Opcode::Class, name_const);
        self.define_variable(slot, name);

        let has_superclass = self.match_token(TokenKind::Less);
        self.classes.push(ClassCtx { name: name.to_owned(), has_superclass });
        if has_superclass {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let parent = self.previous.lexeme;
            if parent == name {
                self.error("a class cannot inherit from itself");
            }
            self.named_variable(parent, false);
            self.named_variable(name, false);
            self.emit_op(Opcode::Inherit);
        } else {
            self.named_variable(name, false);
        }

        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{' before class body");
        loop {
            self.skip_newlines();
            if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
                break;
            }
            self.class_member();
        }
        self.consume(TokenKind::RBrace, "expected '}' after class body");
        self.emit_op(Opcode::Pop);
        self.classes.pop();
    }

    /// One class member: a (possibly static) field or method.
    fn class_member(&mut self) {
        let is_static = self.match_token(TokenKind::Static);

        if self.match_token(TokenKind::Var) {
            loop {
                self.consume(TokenKind::Identifier, "expected property name");
                let name = self.previous.lexeme;
                let index = self.identifier_constant(name);
                if self.match_token(TokenKind::Equal) {
                    self.expression();
                } else {
                    self.emit_op(Opcode::Nil);
                }
                self.emit_op_u16(Opcode::ClassProperty, index);
                self.emit_byte(u8::from(is_static));
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            self.consume_statement_end();
            return;
        }

        if !self.match_token(TokenKind::Identifier) && !self.match_token(TokenKind::Decorator) {
            self.error_at_current("expected method or property declaration");
            return;
        }
        let name = self.previous.lexeme;
        let index = self.identifier_constant(name);
        let kind = if !is_static && self.classes.last().is_some_and(|c| c.name == name) {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function_body(kind, name.to_owned(), is_static);
        self.emit_op_u16(Opcode::Method, index);
        self.skip_newlines();
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Echo) {
            self.expression();
            self.emit_op(Opcode::Echo);
            self.consume_statement_end();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::Do) {
            self.do_while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Using) {
            self.using_statement();
        } else if self.match_token(TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Die) {
            self.expression();
            self.emit_op(Opcode::Die);
            self.consume_statement_end();
        } else if self.match_token(TokenKind::Assert) {
            self.expression();
            if self.match_token(TokenKind::Comma) {
                self.expression();
            } else {
                self.emit_op(Opcode::Nil);
            }
            self.emit_op(Opcode::Assert);
            self.consume_statement_end();
        } else if self.match_token(TokenKind::Import) {
            self.import_statement();
        } else if self.match_token(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume_statement_end();
        }
    }

    fn block(&mut self) {
        loop {
            self.skip_terminators();
            if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
                break;
            }
            self.declaration();
        }
        self.consume(TokenKind::RBrace, "expected '}' after block");
    }

    fn if_statement(&mut self) {
        self.expression();
        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.skip_newlines();
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);
        // `if` needs no terminator of its own, so newlines before a
        // possible `else` can be consumed unconditionally.
        self.skip_newlines();
        if self.match_token(TokenKind::Else) {
            self.skip_newlines();
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        let depth = self.func().scope_depth;
        self.expression();
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        let scan_start = self.chunk_len();
        self.func().loops.push(LoopCtx {
            continue_target: Some(loop_start),
            continue_patches: Vec::new(),
            scope_depth: depth,
            scan_start,
        });
        self.skip_newlines();
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
        self.finish_loop();
    }

    fn do_while_statement(&mut self) {
        let body_start = self.chunk_len();
        let depth = self.func().scope_depth;
        self.func().loops.push(LoopCtx {
            continue_target: None,
            continue_patches: Vec::new(),
            scope_depth: depth,
            scan_start: body_start,
        });
        self.skip_newlines();
        self.statement();
        // `continue` inside a do..while jumps here, to the condition.
        let patches = std::mem::take(
            &mut self
                .func()
                .loops
                .last_mut()
                .expect("loop context pushed above")
                .continue_patches,
        );
        for patch in patches {
            self.patch_jump(patch);
        }
        self.consume(TokenKind::While, "expected 'while' after do body");
        self.expression();
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.emit_loop(body_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
        self.finish_loop();
        self.consume_statement_end();
    }

    fn for_statement(&mut self) {
        if self.check(TokenKind::LParen) {
            self.c_style_for();
        } else {
            self.for_in_statement();
        }
    }

    fn c_style_for(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LParen, "expected '(' after 'for'");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
        } else {
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
        }

        let mut loop_start = self.chunk_len();
        // Loop-control locals belong to the `for`'s own scope; `break`
        // leaves them for the end-of-scope pops at the jump target.
        let depth = self.func().scope_depth;
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }
        if !self.check(TokenKind::RParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let step_start = self.chunk_len();
            self.expression();
            self.emit_op(Opcode::Pop);
            self.emit_loop(loop_start);
            loop_start = step_start;
            self.patch_jump(body_jump);
        }
        self.consume(TokenKind::RParen, "expected ')' after loop clauses");

        let scan_start = self.chunk_len();
        self.func().loops.push(LoopCtx {
            continue_target: Some(loop_start),
            continue_patches: Vec::new(),
            scope_depth: depth,
            scan_start,
        });
        self.skip_newlines();
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Opcode::Pop);
        }
        self.finish_loop();
        self.end_scope();
    }

    /// `for k[, v] in expr { body }` - desugared to the iterator
    /// protocol: `@itern` advances the key, `@iter` reads the value.
    fn for_in_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::Identifier, "expected loop variable name");
        let first = self.previous.lexeme;
        let second = if self.match_token(TokenKind::Comma) {
            self.consume(TokenKind::Identifier, "expected loop value name");
            Some(self.previous.lexeme)
        } else {
            None
        };
        self.consume(TokenKind::In, "expected 'in' after loop variables");

        // Hidden iterator local, then key, then value. The iteration code
        // below indexes these relative slots, so they must be contiguous
        // and in this order.
        self.expression();
        let iter_slot = self.add_local(" iterator").unwrap_or(0);
        self.mark_initialized();
        self.emit_op(Opcode::Nil);
        let (key_name, value_name) = match second {
            Some(value) => (first, value),
            None => (" _ ", first),
        };
        let key_slot = self.add_local(key_name).unwrap_or(0);
        self.mark_initialized();
        self.emit_op(Opcode::Nil);
        let value_slot = self.add_local(value_name).unwrap_or(0);
        self.mark_initialized();
        debug_assert!(
            key_slot == iter_slot + 1 && value_slot == key_slot + 1,
            "for-in hidden locals must be contiguous"
        );

        let itern_const = self.identifier_constant("@itern");
        let iter_const = self.identifier_constant("@iter");
        // The hidden iterator/key/value slots live in the for's own
        // scope; break leaves them to the scope-exit pops.
        let depth = self.func().scope_depth;

        let loop_start = self.chunk_len();
        self.emit_op_u16(Opcode::GetLocal, iter_slot);
        self.emit_op_u16(Opcode::GetLocal, key_slot);
        self.emit_op_u16(Opcode::Invoke, itern_const);
        self.emit_byte(1);
        self.emit_op_u16(Opcode::SetLocal, key_slot);
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.emit_op_u16(Opcode::GetLocal, iter_slot);
        self.emit_op_u16(Opcode::GetLocal, key_slot);
        self.emit_op_u16(Opcode::Invoke, iter_const);
        self.emit_byte(1);
        self.emit_op_u16(Opcode::SetLocal, value_slot);
        self.emit_op(Opcode::Pop);

        let scan_start = self.chunk_len();
        self.func().loops.push(LoopCtx {
            continue_target: Some(loop_start),
            continue_patches: Vec::new(),
            scope_depth: depth,
            scan_start,
        });
        self.skip_newlines();
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
        self.finish_loop();
        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.func().loops.is_empty() {
            self.error("'break' outside of a loop");
            self.consume_statement_end();
            return;
        }
        let depth = self.func().loops.last().expect("checked non-empty").scope_depth;
        self.discard_locals_above(depth);
        self.emit_op(Opcode::BreakPlaceholder);
        self.emit_u16(TRY_NONE);
        self.consume_statement_end();
    }

    fn continue_statement(&mut self) {
        if self.func().loops.is_empty() {
            self.error("'continue' outside of a loop");
            self.consume_statement_end();
            return;
        }
        let (target, depth) = {
            let ctx = self.func().loops.last().expect("checked non-empty");
            (ctx.continue_target, ctx.scope_depth)
        };
        self.discard_locals_above(depth);
        match target {
            Some(target) => self.emit_loop(target),
            None => {
                let patch = self.emit_jump(Opcode::Jump);
                self.func()
                    .loops
                    .last_mut()
                    .expect("checked non-empty")
                    .continue_patches
                    .push(patch);
            }
        }
        self.consume_statement_end();
    }

    /// Pops the loop context and rewrites its `BreakPlaceholder`s into
    /// real jumps to the loop end. The scan walks instructions with the
    /// shared width table, so operand bytes are never misread as opcodes.
    fn finish_loop(&mut self) {
        let ctx = self.func().loops.pop().expect("finish_loop without a loop context");
        let end = self.chunk_len();
        let mut offset = ctx.scan_start;
        while offset < end {
            let op = {
                let func = self.funcs.last().expect("function chain never empty");
                Opcode::from_repr(func.chunk.byte(offset)).expect("compiler emitted an invalid opcode")
            };
            if op == Opcode::BreakPlaceholder {
                let jump = end - (offset + 3);
                let func = self.funcs.last_mut().expect("function chain never empty");
                func.chunk.patch_u16(offset + 1, jump as u16);
                // Rewrite the opcode itself to a plain jump.
                func.chunk.patch_byte(offset, Opcode::Jump as u8);
            }
            let len = {
                let heap = &self.vm.heap;
                let func = self.funcs.last().expect("function chain never empty");
                func.chunk.instruction_len(offset, heap)
            };
            offset += len;
        }
    }

    fn return_statement(&mut self) {
        let kind = self.funcs.last().expect("function chain never empty").kind;
        if self.check(TokenKind::Newline)
            || self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RBrace)
            || self.check(TokenKind::Eof)
        {
            if kind == FunctionKind::Initializer {
                self.emit_op_u16(Opcode::GetLocal, 0);
            } else {
                self.emit_op(Opcode::Nil);
            }
        } else {
            if kind == FunctionKind::Initializer {
                self.error("cannot return a value from an initializer");
            }
            self.expression();
        }
        self.emit_op(Opcode::Return);
        self.consume_statement_end();
    }

    // ------------------------------------------------------------------
    // using / when.

    fn using_statement(&mut self) {
        self.expression();

        let switch = self.vm.heap.allocate(HeapData::Switch(SwitchObj {
            table: ValueTable::new(),
            default_jump: -1,
            exit_jump: -1,
        }));
        let switch_const = self.make_constant(Value::Obj(switch));
        self.emit_op_u16(Opcode::Switch, switch_const);
        let base = self.chunk_len();

        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{' after 'using' expression");
        let mut exit_patches = Vec::new();
        let mut saw_default = false;
        loop {
            self.skip_newlines();
            if self.match_token(TokenKind::RBrace) {
                break;
            }
            if self.check(TokenKind::Eof) {
                self.error_at_current("unterminated 'using' block");
                break;
            }
            if self.match_token(TokenKind::When) {
                let arm_offset = (self.chunk_len() - base) as i32;
                loop {
                    self.when_constant(switch, arm_offset);
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
                self.skip_newlines();
                self.statement();
                exit_patches.push(self.emit_jump(Opcode::Jump));
            } else if self.match_token(TokenKind::Default) {
                if saw_default {
                    self.error("duplicate 'default' arm");
                }
                saw_default = true;
                let arm_offset = (self.chunk_len() - base) as i32;
                if let HeapData::Switch(s) = self.vm.heap.get_mut(switch) {
                    s.default_jump = arm_offset;
                }
                self.skip_newlines();
                self.statement();
                exit_patches.push(self.emit_jump(Opcode::Jump));
            } else {
                self.error_at_current("expected 'when' or 'default' in 'using' block");
                self.advance();
            }
        }

        let exit_offset = (self.chunk_len() - base) as i32;
        if let HeapData::Switch(s) = self.vm.heap.get_mut(switch) {
            s.exit_jump = exit_offset;
        }
        for patch in exit_patches {
            self.patch_jump(patch);
        }
    }

    /// One `when` constant: a bool, number, or string literal, mapped to
    /// the arm's relative offset in the switch table.
    fn when_constant(&mut self, switch: HeapId, arm_offset: i32) {
        let key = if self.match_token(TokenKind::True) {
            Some(Value::Bool(true))
        } else if self.match_token(TokenKind::False) {
            Some(Value::Bool(false))
        } else if self.match_token(TokenKind::Number) {
            Some(Value::Number(parse_number_literal(self.previous.lexeme)))
        } else if self.match_token(TokenKind::String) {
            match unescape(self.previous.lexeme) {
                Ok(text) => Some(self.vm.intern(&text)),
                Err(message) => {
                    self.error(message);
                    None
                }
            }
        } else {
            self.error_at_current("'when' values must be bool, number or string literals");
            self.advance();
            None
        };
        let Some(key) = key else { return };
        let hash = hash_value(key, &self.vm.heap);
        let duplicate = {
            let HeapData::Switch(s) = self.vm.heap.get(switch) else { unreachable!("switch constant") };
            s.table.get_with_hash(key, hash).is_some()
        };
        if duplicate {
            self.error("duplicate 'when' value");
            return;
        }
        if let HeapData::Switch(s) = self.vm.heap.get_mut(switch) {
            s.table.set_with_hash(key, hash, Value::Number(f64::from(arm_offset)));
        }
    }

    // ------------------------------------------------------------------
    // try / catch / finally.

    fn try_statement(&mut self) {
        self.emit_op(Opcode::Try);
        let payload = self.chunk_len();
        self.emit_u16(TRY_NONE); // catch type constant
        self.emit_u16(TRY_NONE); // catch address
        self.emit_u16(TRY_NONE); // finally address

        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{' after 'try'");
        self.block();
        self.emit_op(Opcode::PopTry);
        let after_body = self.emit_jump(Opcode::Jump);

        let mut catch_type = TRY_NONE;
        let mut catch_addr = TRY_NONE;
        let mut catch_end = None;
        self.skip_newlines();
        if self.match_token(TokenKind::Catch) {
            self.consume(TokenKind::Identifier, "expected exception class after 'catch'");
            let type_name = self.previous.lexeme;
            catch_type = self.identifier_constant(type_name);
            catch_addr = self.chunk_len() as u16;

            let named = if self.check(TokenKind::Identifier) {
                self.advance();
                let binding = self.previous.lexeme;
                self.begin_scope();
                // The propagation machinery leaves the exception on the
                // stack exactly where this local's slot lands.
                if self.add_local(binding).is_some() {
                    self.mark_initialized();
                }
                true
            } else {
                self.emit_op(Opcode::Pop);
                false
            };

            self.skip_newlines();
            self.consume(TokenKind::LBrace, "expected '{' after catch clause");
            self.block();
            if named {
                self.end_scope();
            }
            self.emit_op(Opcode::PopTry);
            catch_end = Some(self.emit_jump(Opcode::Jump));
        }

        self.patch_jump(after_body);
        if let Some(catch_end) = catch_end {
            self.patch_jump(catch_end);
        }

        let mut finally_addr = TRY_NONE;
        self.skip_newlines();
        if self.match_token(TokenKind::Finally) {
            // Normal entry: no exception, no resume.
            self.emit_op(Opcode::Nil);
            self.emit_op(Opcode::False);
            finally_addr = self.chunk_len() as u16;
            self.skip_newlines();
            self.consume(TokenKind::LBrace, "expected '{' after 'finally'");
            self.block();
            self.emit_op(Opcode::PublishTry);
        }

        if catch_addr == TRY_NONE && finally_addr == TRY_NONE {
            self.error("expected 'catch' or 'finally' after try block");
        }

        let func = self.func();
        func.chunk.patch_u16(payload, catch_type);
        func.chunk.patch_u16(payload + 2, catch_addr);
        func.chunk.patch_u16(payload + 4, finally_addr);
    }

    // ------------------------------------------------------------------
    // Imports.

    fn import_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expected module name after 'import'");
        let mut spec = self.previous.lexeme.to_owned();
        let mut last = self.previous.lexeme.to_owned();
        while self.match_token(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected name after '.' in import path");
            spec.push('/');
            spec.push_str(self.previous.lexeme);
            last = self.previous.lexeme.to_owned();
        }

        let alias = if self.match_token(TokenKind::As) {
            self.consume(TokenKind::Identifier, "expected alias after 'as'");
            self.previous.lexeme.to_owned()
        } else {
            last.clone()
        };

        // Selection list, if any.
        let mut selections: Vec<String> = Vec::new();
        let mut import_all = false;
        if self.match_token(TokenKind::LBrace) {
            loop {
                self.skip_newlines();
                if self.match_token(TokenKind::Star) {
                    import_all = true;
                } else {
                    self.consume(TokenKind::Identifier, "expected name to import");
                    selections.push(self.previous.lexeme.to_owned());
                }
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RBrace, "expected '}' after import list");
        }

        let native = spec.starts_with('_');
        if native {
            self.native_import(&spec, &alias, &selections, import_all);
        } else {
            self.source_import(&spec, &alias, &selections, import_all);
        }
        self.consume_statement_end();
    }

    fn native_import(&mut self, spec: &str, alias: &str, selections: &[String], import_all: bool) {
        if !self.vm.has_native_module(spec) {
            self.error(&format!("native module '{spec}' is not registered"));
            return;
        }
        let name_const = self.identifier_constant(spec);
        // Binds the module under its native name and leaves it on the
        // stack for selection opcodes.
        self.emit_op_u16(Opcode::NativeModule, name_const);
        if import_all {
            self.emit_op(Opcode::ImportAllNative);
        }
        for name in selections {
            let index = self.identifier_constant(name);
            self.emit_op_u16(Opcode::SelectNativeImport, index);
        }
        if alias != spec {
            self.emit_op_u16(Opcode::EjectNativeImport, name_const);
            let alias_const = self.identifier_constant(alias);
            self.emit_op_u16(Opcode::DefineGlobal, alias_const);
        } else if (!selections.is_empty() || import_all) && !selections.iter().any(|s| s == spec) {
            self.emit_op_u16(Opcode::EjectNativeImport, name_const);
            self.emit_op(Opcode::Pop);
        } else {
            self.emit_op(Opcode::Pop);
        }
    }

    fn source_import(&mut self, spec: &str, alias: &str, selections: &[String], import_all: bool) {
        let Some(resolved) = self.vm.resolve_module(spec, &self.path) else {
            self.error(&format!("module '{spec}' not found"));
            return;
        };
        if self.vm.compiling_paths.iter().any(|p| *p == resolved.path) {
            self.error(&format!("cyclic import of '{spec}'"));
            return;
        }

        self.vm.compiling_paths.push(resolved.path.clone());
        let function = compile(self.vm, &resolved.source, &resolved.path, alias);
        self.vm.compiling_paths.pop();
        let Some(function) = function else {
            self.error(&format!("errors in imported module '{spec}'"));
            return;
        };

        let fn_const = self.make_constant(Value::Obj(function));
        self.emit_op_u16(Opcode::CallImport, fn_const);
        // The call's result (or the skip marker) is discarded.
        self.emit_op(Opcode::Pop);

        if !selections.is_empty() || import_all {
            let alias_const = self.identifier_constant(alias);
            self.emit_op_u16(Opcode::GetGlobal, alias_const);
            if import_all {
                self.emit_op(Opcode::ImportAll);
            }
            for name in selections {
                let index = self.identifier_constant(name);
                self.emit_op_u16(Opcode::SelectImport, index);
            }
            self.emit_op(Opcode::Pop);
            if !selections.iter().any(|s| s == alias) {
                self.emit_op_u16(Opcode::EjectImport, alias_const);
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions.

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    fn parse_precedence(&mut self, min: Prec) {
        self.advance();
        let can_assign = min <= Prec::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("expected expression");
            return;
        }
        while min <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    /// Prefix dispatch. Returns false when the token cannot start an
    /// expression.
    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            TokenKind::True => self.emit_op(Opcode::True),
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Empty => self.emit_op(Opcode::Empty),
            TokenKind::Number => {
                let value = parse_number_literal(self.previous.lexeme);
                self.emit_constant(Value::Number(value));
            }
            TokenKind::String => {
                match unescape(self.previous.lexeme) {
                    Ok(text) => {
                        let value = self.vm.intern(&text);
                        self.emit_constant(value);
                    }
                    Err(message) => self.error(message),
                }
            }
            TokenKind::Interpolation => self.interpolation(),
            TokenKind::Identifier => {
                let name = self.previous.lexeme;
                self.named_variable(name, can_assign);
            }
            TokenKind::LParen => {
                self.skip_newlines();
                self.expression();
                self.skip_newlines();
                self.consume(TokenKind::RParen, "expected ')' after expression");
            }
            TokenKind::LBracket => self.list_literal(),
            TokenKind::LBrace => self.dict_literal(),
            TokenKind::Bar => self.lambda(),
            TokenKind::Minus => {
                self.parse_precedence(Prec::Unary);
                self.emit_op(Opcode::Negate);
            }
            TokenKind::Bang => {
                self.parse_precedence(Prec::Unary);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Tilde => {
                self.parse_precedence(Prec::Unary);
                self.emit_op(Opcode::BitNot);
            }
            TokenKind::SelfKw => self.self_expression(),
            TokenKind::Parent => self.parent_expression(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LParen => {
                let argc = self.argument_list();
                self.emit_op(Opcode::Call);
                self.emit_byte(argc);
            }
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::LBracket => self.index(can_assign),
            TokenKind::Question => self.ternary(),
            TokenKind::And => self.and_expression(),
            TokenKind::Or => self.or_expression(),
            _ => self.binary(kind),
        }
    }

    fn binary(&mut self, kind: TokenKind) {
        self.skip_newlines();
        let prec = infix_precedence(kind);
        // `**` is right-associative; everything else is left.
        let next = if kind == TokenKind::StarStar { prec } else { prec.next() };
        self.parse_precedence(next);
        match kind {
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            TokenKind::Percent => self.emit_op(Opcode::Modulo),
            TokenKind::StarStar => self.emit_op(Opcode::Pow),
            TokenKind::SlashSlash => self.emit_op(Opcode::FloorDivide),
            TokenKind::EqualEq => self.emit_op(Opcode::Equal),
            TokenKind::BangEq => {
                self.emit_op(Opcode::Equal);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEq => {
                self.emit_op(Opcode::Less);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEq => {
                self.emit_op(Opcode::Greater);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Amp => self.emit_op(Opcode::BitAnd),
            TokenKind::Bar => self.emit_op(Opcode::BitOr),
            TokenKind::Caret => self.emit_op(Opcode::BitXor),
            TokenKind::LShift => self.emit_op(Opcode::LShift),
            TokenKind::RShift => self.emit_op(Opcode::RShift),
            TokenKind::Range => self.emit_op(Opcode::Range),
            _ => self.error("unexpected operator"),
        }
    }

    fn ternary(&mut self) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Prec::Conditional);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.consume(TokenKind::Colon, "expected ':' in conditional expression");
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Prec::Conditional);
        self.patch_jump(end_jump);
    }

    fn and_expression(&mut self) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.skip_newlines();
        self.parse_precedence(Prec::And);
        self.patch_jump(end_jump);
    }

    fn or_expression(&mut self) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.skip_newlines();
        self.parse_precedence(Prec::Or);
        self.patch_jump(end_jump);
    }

    /// `"a ${x} b"` - fragments concatenated with stringified
    /// expressions. The lexer has already split the pieces.
    fn interpolation(&mut self) {
        let fragment = match unescape(self.previous.lexeme) {
            Ok(text) => text,
            Err(message) => {
                self.error(message);
                String::new()
            }
        };
        let value = self.vm.intern(&fragment);
        self.emit_constant(value);
        loop {
            self.expression();
            self.emit_op(Opcode::Stringify);
            self.emit_op(Opcode::Add);
            if self.match_token(TokenKind::String) {
                match unescape(self.previous.lexeme) {
                    Ok(text) => {
                        if !text.is_empty() {
                            let value = self.vm.intern(&text);
                            self.emit_constant(value);
                            self.emit_op(Opcode::Add);
                        }
                    }
                    Err(message) => self.error(message),
                }
                break;
            }
            if self.match_token(TokenKind::Interpolation) {
                match unescape(self.previous.lexeme) {
                    Ok(text) => {
                        if !text.is_empty() {
                            let value = self.vm.intern(&text);
                            self.emit_constant(value);
                            self.emit_op(Opcode::Add);
                        }
                    }
                    Err(message) => self.error(message),
                }
                continue;
            }
            self.error_at_current("unterminated string interpolation");
            break;
        }
    }

    fn list_literal(&mut self) {
        let mut count: u16 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RBracket) {
            loop {
                self.skip_newlines();
                self.expression();
                count = count.saturating_add(1);
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(TokenKind::RBracket) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RBracket, "expected ']' after list items");
        self.emit_op_u16(Opcode::List, count);
    }

    fn dict_literal(&mut self) {
        let mut count: u16 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RBrace) {
            loop {
                self.skip_newlines();
                // Shorthand identifier keys become string constants.
                if self.match_token(TokenKind::Identifier) {
                    let key = self.vm.intern(self.previous.lexeme);
                    self.emit_constant(key);
                } else {
                    self.expression();
                }
                self.skip_newlines();
                self.consume(TokenKind::Colon, "expected ':' after dictionary key");
                self.skip_newlines();
                self.expression();
                count = count.saturating_add(1);
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RBrace, "expected '}' after dictionary items");
        self.emit_op_u16(Opcode::Dict, count);
    }

    /// `|a, b| { ... }` - anonymous function.
    fn lambda(&mut self) {
        let mut state = FuncState::new(FunctionKind::Anonymous, String::new());
        state.is_private = false;
        self.funcs.push(state);
        self.begin_scope();

        if !self.check(TokenKind::Bar) {
            loop {
                if self.match_token(TokenKind::Ellipsis) {
                    self.func().variadic = true;
                    if self.add_local("__args__").is_some() {
                        self.mark_initialized();
                    }
                    break;
                }
                self.consume(TokenKind::Identifier, "expected parameter name");
                let param = self.previous.lexeme;
                self.func().arity = self.func().arity.wrapping_add(1);
                if self.add_local(param).is_some() {
                    self.mark_initialized();
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::Bar, "expected '|' after lambda parameters");
        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{' before lambda body");
        self.block();

        let upvalues: Vec<UpvalueSpec> = self.funcs.last().expect("function chain never empty").upvalues.clone();
        let function = self.finish_function();
        let index = self.make_constant(Value::Obj(function));
        self.emit_op_u16(Opcode::Closure, index);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_u16(upvalue.index);
        }
    }

    fn self_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("'self' outside of a class");
            return;
        }
        if self.check(TokenKind::Dot) {
            self.advance();
            if !self.match_token(TokenKind::Identifier) && !self.match_token(TokenKind::Decorator) {
                self.error_at_current("expected property name after 'self.'");
                return;
            }
            let name = self.previous.lexeme;
            let index = self.identifier_constant(name);
            self.emit_op_u16(Opcode::GetLocal, 0);
            if self.match_token(TokenKind::LParen) {
                let argc = self.argument_list();
                self.emit_op_u16(Opcode::InvokeSelf, index);
                self.emit_byte(argc);
            } else if self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op_u16(Opcode::SetProperty, index);
            } else if let Some(op) = compound_op(self.current.kind) {
                self.advance();
                self.emit_op(Opcode::Dup);
                self.emit_op_u16(Opcode::GetSelfProperty, index);
                self.skip_newlines();
                self.expression();
                self.emit_op(op);
                self.emit_op_u16(Opcode::SetProperty, index);
            } else {
                self.emit_op_u16(Opcode::GetSelfProperty, index);
            }
        } else {
            self.emit_op_u16(Opcode::GetLocal, 0);
        }
    }

    fn parent_expression(&mut self) {
        match self.classes.last() {
            None => {
                self.error("'parent' outside of a class");
                return;
            }
            Some(class) if !class.has_superclass => {
                self.error("'parent' in a class with no superclass");
                return;
            }
            Some(_) => {}
        }
        if self.match_token(TokenKind::LParen) {
            // parent(...) re-invokes the running method up the chain.
            self.emit_op_u16(Opcode::GetLocal, 0);
            let argc = self.argument_list_after_receiver();
            self.emit_op(Opcode::SuperInvokeSelf);
            self.emit_byte(argc);
        } else if self.match_token(TokenKind::Dot) {
            if !self.match_token(TokenKind::Identifier) && !self.match_token(TokenKind::Decorator) {
                self.error_at_current("expected method name after 'parent.'");
                return;
            }
            let name = self.previous.lexeme;
            let index = self.identifier_constant(name);
            self.consume(TokenKind::LParen, "expected '(' to call the parent method");
            self.emit_op_u16(Opcode::GetLocal, 0);
            let argc = self.argument_list_after_receiver();
            self.emit_op_u16(Opcode::SuperInvoke, index);
            self.emit_byte(argc);
        } else {
            self.error_at_current("expected '(' or '.' after 'parent'");
        }
    }

    fn dot(&mut self, can_assign: bool) {
        if !self.match_token(TokenKind::Identifier) && !self.match_token(TokenKind::Decorator) {
            self.error_at_current("expected property name after '.'");
            return;
        }
        let name = self.previous.lexeme;
        let index = self.identifier_constant(name);
        if self.match_token(TokenKind::LParen) {
            let argc = self.argument_list();
            self.emit_op_u16(Opcode::Invoke, index);
            self.emit_byte(argc);
        } else if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_u16(Opcode::SetProperty, index);
        } else if can_assign && compound_op(self.current.kind).is_some() {
            let op = compound_op(self.current.kind).expect("checked above");
            self.advance();
            self.emit_op(Opcode::Dup);
            self.emit_op_u16(Opcode::GetProperty, index);
            self.skip_newlines();
            self.expression();
            self.emit_op(op);
            self.emit_op_u16(Opcode::SetProperty, index);
        } else {
            self.emit_op_u16(Opcode::GetProperty, index);
        }
    }

    /// Indexing: `x[i]`, `x[a,b]`, `x[a,]`, `x[,b]`.
    fn index(&mut self, can_assign: bool) {
        let mut ranged = false;
        self.skip_newlines();
        if self.check(TokenKind::Comma) {
            self.emit_op(Opcode::Nil);
        } else {
            self.expression();
        }
        if self.match_token(TokenKind::Comma) {
            ranged = true;
            self.skip_newlines();
            if self.check(TokenKind::RBracket) {
                self.emit_op(Opcode::Nil);
            } else {
                self.expression();
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RBracket, "expected ']' after index");

        if ranged {
            if can_assign && self.check(TokenKind::Equal) {
                self.error_at_current("cannot assign to a ranged index");
            }
            self.emit_op(Opcode::GetRangedIndex);
            self.emit_byte(0);
        } else if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::SetIndex);
        } else if can_assign && compound_op(self.current.kind).is_some() {
            let op = compound_op(self.current.kind).expect("checked above");
            self.advance();
            self.emit_op(Opcode::GetIndex);
            self.emit_byte(1);
            self.skip_newlines();
            self.expression();
            self.emit_op(op);
            self.emit_op(Opcode::SetIndex);
        } else {
            self.emit_op(Opcode::GetIndex);
            self.emit_byte(0);
        }
    }

    fn argument_list(&mut self) -> u8 {
        self.argument_list_after_receiver()
    }

    fn argument_list_after_receiver(&mut self) -> u8 {
        let mut argc: u8 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RParen) {
            loop {
                self.skip_newlines();
                self.expression();
                if argc == u8::MAX {
                    self.error("too many arguments");
                }
                argc = argc.wrapping_add(1);
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RParen, "expected ')' after arguments");
        argc
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let func_index = self.funcs.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(func_index, name) {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(func_index, name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, upvalue)
        } else {
            let index = self.identifier_constant(name);
            (Opcode::GetGlobal, Opcode::SetGlobal, index)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_u16(set_op, arg);
        } else if can_assign && compound_op(self.current.kind).is_some() {
            let op = compound_op(self.current.kind).expect("checked above");
            self.advance();
            self.emit_op_u16(get_op, arg);
            self.skip_newlines();
            self.expression();
            self.emit_op(op);
            self.emit_op_u16(set_op, arg);
        } else {
            self.emit_op_u16(get_op, arg);
        }
    }
}

/// Maps a compound-assignment token to its binary opcode.
fn compound_op(kind: TokenKind) -> Option<Opcode> {
    Some(match kind {
        TokenKind::PlusEq => Opcode::Add,
        TokenKind::MinusEq => Opcode::Subtract,
        TokenKind::StarEq => Opcode::Multiply,
        TokenKind::SlashEq => Opcode::Divide,
        TokenKind::PercentEq => Opcode::Modulo,
        TokenKind::StarStarEq => Opcode::Pow,
        TokenKind::SlashSlashEq => Opcode::FloorDivide,
        TokenKind::AmpEq => Opcode::BitAnd,
        TokenKind::BarEq => Opcode::BitOr,
        TokenKind::CaretEq => Opcode::BitXor,
        TokenKind::LShiftEq => Opcode::LShift,
        TokenKind::RShiftEq => Opcode::RShift,
        _ => return None,
    })
}

fn infix_precedence(kind: TokenKind) -> Prec {
    match kind {
        TokenKind::Question => Prec::Conditional,
        TokenKind::Or => Prec::Or,
        TokenKind::And => Prec::And,
        TokenKind::EqualEq | TokenKind::BangEq => Prec::Equality,
        TokenKind::Less | TokenKind::LessEq | TokenKind::Greater | TokenKind::GreaterEq => Prec::Comparison,
        TokenKind::Bar => Prec::BitOr,
        TokenKind::Caret => Prec::BitXor,
        TokenKind::Amp => Prec::BitAnd,
        TokenKind::LShift | TokenKind::RShift => Prec::Shift,
        TokenKind::Range => Prec::Range,
        TokenKind::Plus | TokenKind::Minus => Prec::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent | TokenKind::SlashSlash => Prec::Factor,
        TokenKind::StarStar => Prec::Exponent,
        TokenKind::Dot | TokenKind::LParen | TokenKind::LBracket => Prec::Call,
        _ => Prec::None,
    }
}

/// Parses a numeric literal in any of the supported forms. The lexer has
/// already validated the shape.
#[must_use]
pub fn parse_number_literal(lexeme: &str) -> f64 {
    let bytes = lexeme.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'0' {
        let digits = &lexeme[2..];
        match bytes[1] {
            b'b' | b'B' => return i64::from_str_radix(digits, 2).map_or(0.0, |v| v as f64),
            b'c' | b'C' => return i64::from_str_radix(digits, 8).map_or(0.0, |v| v as f64),
            b'x' | b'X' => return i64::from_str_radix(digits, 16).map_or(0.0, |v| v as f64),
            _ => {}
        }
    }
    lexeme.parse().unwrap_or(0.0)
}

/// Decodes the escape sequences of a string literal body.
pub fn unescape(raw: &str) -> Result<String, &'static str> {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c != b'\\' {
            // Copy the full UTF-8 sequence through.
            let ch_len = utf8_len(c);
            out.push_str(&raw[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        i += 1;
        let Some(&escape) = bytes.get(i) else {
            return Err("dangling escape at end of string");
        };
        i += 1;
        match escape {
            b'0' => out.push('\0'),
            b'$' => out.push('$'),
            b'\'' => out.push('\''),
            b'"' => out.push('"'),
            b'a' => out.push('\x07'),
            b'b' => out.push('\x08'),
            b'f' => out.push('\x0C'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b't' => out.push('\t'),
            b'v' => out.push('\x0B'),
            b'\\' => out.push('\\'),
            b'x' => {
                let cp = hex_digits(raw, i, 2)?;
                i += 2;
                out.push(char::from_u32(cp).ok_or("invalid '\\x' escape")?);
            }
            b'u' => {
                let cp = hex_digits(raw, i, 4)?;
                i += 4;
                out.push(char::from_u32(cp).ok_or("invalid '\\u' escape")?);
            }
            b'U' => {
                let cp = hex_digits(raw, i, 8)?;
                i += 8;
                out.push(char::from_u32(cp).ok_or("invalid '\\U' escape")?);
            }
            _ => return Err("unknown escape sequence"),
        }
    }
    Ok(out)
}

fn hex_digits(raw: &str, at: usize, count: usize) -> Result<u32, &'static str> {
    let digits = raw.get(at..at + count).ok_or("truncated hex escape")?;
    u32::from_str_radix(digits, 16).map_err(|_| "invalid hex escape")
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_literal_forms() {
        assert_eq!(parse_number_literal("10"), 10.0);
        assert_eq!(parse_number_literal("1.5"), 1.5);
        assert_eq!(parse_number_literal("1e3"), 1000.0);
        assert_eq!(parse_number_literal("1.5E-2"), 0.015);
        assert_eq!(parse_number_literal("0b101"), 5.0);
        assert_eq!(parse_number_literal("0c17"), 15.0);
        assert_eq!(parse_number_literal("0xFF"), 255.0);
    }

    #[test]
    fn unescape_handles_all_sequences() {
        assert_eq!(unescape(r"a\nb").unwrap(), "a\nb");
        assert_eq!(unescape(r"\x41B\U00000043").unwrap(), "ABC");
        assert_eq!(unescape("\\$\\\\\\'\\\"").unwrap(), "$\\'\"");
        assert_eq!(unescape(r"\a\b\f\r\t\v\0").unwrap(), "\x07\x08\x0C\r\t\x0B\0");
        assert!(unescape(r"\q").is_err());
        assert!(unescape(r"\x4").is_err());
    }

    #[test]
    fn unicode_escape_produces_utf8() {
        assert_eq!(unescape(r"é").unwrap(), "é");
        assert_eq!(unescape(r"\U0001F600").unwrap(), "😀");
    }
}
