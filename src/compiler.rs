// File: src/compiler.rs
//
// Single-pass compiler for the Lox language.
// A Pratt parser that emits bytecode as it consumes tokens: no AST is built.
// One Compiler frame per function being compiled, linked through `enclosing`,
// tracks local slots, upvalue captures, and scope depth; a parallel
// ClassCompiler chain gates `this` and `super`.

use once_cell::sync::Lazy;

use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::memory::Heap;
use crate::object::{Function, Obj, ObjRef};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::table::Table;
use crate::value::Value;

/// Local slots per function, including the reserved slot zero.
const MAX_LOCALS: usize = 256;
/// Captured variables per function.
const MAX_UPVALUES: usize = 256;
/// Widest encodable jump or loop offset.
const MAX_JUMP: usize = u16::MAX as usize;

/// Compile a source string into the top-level script function.
///
/// The parser allocates interned strings and finished functions on the heap
/// as it goes; `globals` is marked alongside the compiler chain if a
/// collection triggers mid-compile.
pub fn compile(source: &str, heap: &mut Heap, globals: &Table) -> Result<ObjRef, Vec<CompileError>> {
    let mut parser = Parser::new(source, heap, globals);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let script = parser.pop_compiler();
    if parser.errors.is_empty() {
        Ok(parser.heap.alloc(Obj::Function(script.function)))
    } else {
        Err(parser.errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Expression precedence, lowest to highest. `next()` steps one level up for
/// left-associative infix parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = for<'r, 's, 'g> fn(&'r mut Parser<'s, 'g>, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// Dispatch table indexed by token kind: each entry is the token's optional
/// prefix rule, optional infix rule, and infix precedence.
static RULES: Lazy<[ParseRule; TokenKind::COUNT]> = Lazy::new(|| {
    let none = ParseRule { prefix: None, infix: None, precedence: Precedence::None };
    let mut rules = [none; TokenKind::COUNT];
    let mut set = |kind: TokenKind, prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence| {
        rules[kind as usize] = ParseRule { prefix, infix, precedence };
    };
    set(TokenKind::LeftParen, Some(grouping), Some(call), Precedence::Call);
    set(TokenKind::Dot, None, Some(dot), Precedence::Call);
    set(TokenKind::Minus, Some(unary), Some(binary), Precedence::Term);
    set(TokenKind::Plus, None, Some(binary), Precedence::Term);
    set(TokenKind::Slash, None, Some(binary), Precedence::Factor);
    set(TokenKind::Star, None, Some(binary), Precedence::Factor);
    set(TokenKind::Bang, Some(unary), None, Precedence::None);
    set(TokenKind::BangEqual, None, Some(binary), Precedence::Equality);
    set(TokenKind::EqualEqual, None, Some(binary), Precedence::Equality);
    set(TokenKind::Greater, None, Some(binary), Precedence::Comparison);
    set(TokenKind::GreaterEqual, None, Some(binary), Precedence::Comparison);
    set(TokenKind::Less, None, Some(binary), Precedence::Comparison);
    set(TokenKind::LessEqual, None, Some(binary), Precedence::Comparison);
    set(TokenKind::Identifier, Some(variable), None, Precedence::None);
    set(TokenKind::String, Some(string), None, Precedence::None);
    set(TokenKind::Number, Some(number), None, Precedence::None);
    set(TokenKind::And, None, Some(and_), Precedence::And);
    set(TokenKind::Or, None, Some(or_), Precedence::Or);
    set(TokenKind::False, Some(literal), None, Precedence::None);
    set(TokenKind::Nil, Some(literal), None, Precedence::None);
    set(TokenKind::True, Some(literal), None, Precedence::None);
    set(TokenKind::Super, Some(super_), None, Precedence::None);
    set(TokenKind::This, Some(this_), None, Precedence::None);
    rules
});

fn rule_for(kind: TokenKind) -> ParseRule {
    RULES[kind as usize]
}

/// A declared local variable. Depth −1 marks a variable whose initializer is
/// still being compiled; reading it in that window is an error.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The chain of `enclosing` frames mirrors
/// lexical function nesting and is what upvalue resolution walks.
struct Compiler<'src> {
    enclosing: Option<Box<Compiler<'src>>>,
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSlot>,
    scope_depth: i32,
}

impl<'src> Compiler<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Box<Self> {
        // Slot zero belongs to the callee: the receiver in methods, an
        // unnameable placeholder everywhere else.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Box::new(Compiler {
            enclosing: None,
            function: Function::new(name),
            kind,
            locals: vec![Local { name: slot_zero, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        })
    }

    /// Innermost-first search of this function's locals. Returns the slot
    /// and whether the variable has finished initializing.
    fn resolve_local(&self, name: &str) -> Option<(u8, bool)> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i as u8, local.depth != -1));
            }
        }
        None
    }

    /// Find or create the upvalue for `name`, recursing through enclosing
    /// functions. Each level that relays the capture records its own entry,
    /// and the level owning the variable flags the local as captured so its
    /// scope exit closes rather than pops it.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let found = {
            let enclosing = match self.enclosing.as_mut() {
                Some(enclosing) => enclosing,
                None => return Ok(None),
            };
            if let Some((slot, initialized)) = enclosing.resolve_local(name) {
                if !initialized {
                    return Err("Can't read local variable in its own initializer.");
                }
                enclosing.locals[slot as usize].is_captured = true;
                Some(UpvalueSlot { index: slot, is_local: true })
            } else {
                enclosing
                    .resolve_upvalue(name)?
                    .map(|index| UpvalueSlot { index, is_local: false })
            }
        };
        match found {
            Some(slot) => self.add_upvalue(slot.index, slot.is_local).map(Some),
            None => Ok(None),
        }
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() == MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(UpvalueSlot { index, is_local });
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Tracks the innermost class declaration being compiled, and whether it has
/// a superclass, for validating `this` and `super`.
struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

struct Parser<'src, 'gc> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    heap: &'gc mut Heap,
    globals: &'gc Table,
    compiler: Box<Compiler<'src>>,
    class_compiler: Option<Box<ClassCompiler>>,
    errors: Vec<CompileError>,
    panic_mode: bool,
}

impl<'src, 'gc> Parser<'src, 'gc> {
    fn new(source: &'src str, heap: &'gc mut Heap, globals: &'gc Table) -> Self {
        Parser {
            scanner: Scanner::new(source),
            current: Token::synthetic(),
            previous: Token::synthetic(),
            heap,
            globals,
            compiler: Compiler::new(FunctionKind::Script, None),
            class_compiler: None,
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    // --- Token plumbing --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
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
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // --- Error reporting -------------------------------------------------

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(CompileError {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    /// Leave panic mode by skipping to a statement boundary: just past a
    /// semicolon, or just before a declaration keyword.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- Emission --------------------------------------------------------

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.compiler.function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, first: u8, second: u8) {
        self.emit_byte(first);
        self.emit_byte(second);
    }

    fn emit_return(&mut self) {
        // An initializer always hands back the instance sitting in slot zero.
        if self.compiler.kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Emit a jump with a placeholder offset and return the offset's
    /// position for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // Account for the two offset bytes the VM has already read.
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.current_chunk().code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    // --- Heap interaction ------------------------------------------------

    /// Intern through the parser so a threshold crossing collects with the
    /// compiler chain as roots before the new string is allocated.
    fn intern(&mut self, text: &str) -> ObjRef {
        self.collect_if_needed();
        self.heap.intern(text)
    }

    /// Collect with the parser's roots: the globals table and every
    /// function still under construction, whose constants and names are
    /// reachable only from the compiler chain at this point.
    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        self.heap.mark_table(self.globals);
        let mut current = Some(&*self.compiler);
        while let Some(compiler) = current {
            if let Some(name) = compiler.function.name {
                self.heap.mark_object(name);
            }
            for &constant in &compiler.function.chunk.constants {
                self.heap.mark_value(constant);
            }
            current = compiler.enclosing.as_deref();
        }
        self.heap.collect();
    }

    // --- Compiler frames -------------------------------------------------

    fn push_compiler(&mut self, kind: FunctionKind) {
        let name = match kind {
            FunctionKind::Script => None,
            _ => {
                let lexeme = self.previous.lexeme;
                Some(self.intern(lexeme))
            }
        };
        let fresh = Compiler::new(kind, name);
        let enclosing = std::mem::replace(&mut self.compiler, fresh);
        self.compiler.enclosing = Some(enclosing);
    }

    /// Seal the current function: emit its implicit return and hand the
    /// frame back, restoring the enclosing compiler.
    fn pop_compiler(&mut self) -> Compiler<'src> {
        self.emit_return();
        #[cfg(feature = "print_code")]
        if self.errors.is_empty() {
            let name = match self.compiler.function.name {
                Some(name) => self.heap.str(name).to_string(),
                None => "<script>".to_string(),
            };
            crate::debug::disassemble_chunk(self.heap, &self.compiler.function.chunk, &name);
        }
        let enclosing = match self.compiler.enclosing.take() {
            Some(enclosing) => enclosing,
            // The script frame has no parent; leave a fresh shell behind.
            None => Compiler::new(FunctionKind::Script, None),
        };
        let mut finished = std::mem::replace(&mut self.compiler, enclosing);
        finished.function.upvalue_count = finished.upvalues.len();
        *finished
    }

    // --- Scopes and variables --------------------------------------------

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        loop {
            let captured = match self.compiler.locals.last() {
                Some(local) if local.depth > self.compiler.scope_depth => local.is_captured,
                _ => break,
            };
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.compiler.locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.compiler.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local { name, depth: -1, is_captured: false });
    }

    /// Reserve a local slot for the name just parsed; globals are late
    /// bound and need nothing here.
    fn declare_variable(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        for local in self.compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.compiler.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        let lexeme = self.previous.lexeme;
        self.identifier_constant(lexeme)
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let depth = self.compiler.scope_depth;
        if let Some(local) = self.compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    /// Emit the read or write of a named variable, resolving local, then
    /// upvalue, then falling back to a late-bound global.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (arg, get_op, set_op);
        if let Some((slot, initialized)) = self.compiler.resolve_local(name) {
            if !initialized {
                self.error("Can't read local variable in its own initializer.");
            }
            arg = slot;
            get_op = OpCode::GetLocal;
            set_op = OpCode::SetLocal;
        } else {
            match self.compiler.resolve_upvalue(name) {
                Ok(Some(slot)) => {
                    arg = slot;
                    get_op = OpCode::GetUpvalue;
                    set_op = OpCode::SetUpvalue;
                }
                Ok(None) => {
                    arg = self.identifier_constant(name);
                    get_op = OpCode::GetGlobal;
                    set_op = OpCode::SetGlobal;
                }
                Err(message) => {
                    self.error(message);
                    return;
                }
            }
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // --- Declarations ----------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_bytes(OpCode::Class as u8, name_constant);
        self.define_variable(name_constant);

        let enclosing_class = self.class_compiler.take();
        self.class_compiler =
            Some(Box::new(ClassCompiler { enclosing: enclosing_class, has_superclass: false }));

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme;
            self.named_variable(superclass_name, false);
            if class_name == superclass_name {
                self.error("A class can't inherit from itself.");
            }
            // The superclass lives in a scope of its own under the synthetic
            // name "super", where super-expressions in method bodies find it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = &mut self.class_compiler {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self.class_compiler.as_ref().is_some_and(|c| c.has_superclass);
        if has_superclass {
            self.end_scope();
        }
        self.class_compiler = self.class_compiler.take().and_then(|c| c.enclosing);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(lexeme);
        let kind =
            if lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_bytes(OpCode::Method as u8, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; its name is usable immediately.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body into a fresh compiler frame, then emit the
    /// CLOSURE instruction with one capture pair per upvalue.
    fn function(&mut self, kind: FunctionKind) {
        self.push_compiler(kind);
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.compiler.function.arity += 1;
                if self.compiler.function.arity > 254 {
                    self.error_at_current("Can't have more than 254 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // Collect while the finished function is still rooted through the
        // compiler chain; the allocation below must not trigger one.
        self.collect_if_needed();
        let finished = self.pop_compiler();
        let upvalues = finished.upvalues;
        let function_ref = self.heap.alloc(Obj::Function(finished.function));
        let constant = self.make_constant(Value::Obj(function_ref));
        self.emit_bytes(OpCode::Closure as u8, constant);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // --- Statements ------------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// `for` desugars to a while loop: the increment clause, when present,
    /// is compiled after the body but jumped to before looping back to the
    /// condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
            return;
        }
        if self.compiler.kind == FunctionKind::Initializer {
            self.error("Can't return a value from an initializer.");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        self.emit_op(OpCode::Return);
    }

    // --- Expressions -----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt core: run the prefix rule for the token just consumed,
    /// then fold infix rules while their precedence holds.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match rule_for(self.previous.kind).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule_for(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule_for(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        // A leftover '=' means the prefix produced something unassignable.
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 254 {
                    self.error("Can't have more than 254 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }
}

// --- Parse rules ---------------------------------------------------------
//
// Free functions so they coerce to the plain fn pointers in RULES.

fn grouping(p: &mut Parser, _can_assign: bool) {
    p.expression();
    p.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(p: &mut Parser, _can_assign: bool) {
    let value: f64 = p.previous.lexeme.parse().unwrap_or(0.0);
    p.emit_constant(Value::Number(value));
}

fn string(p: &mut Parser, _can_assign: bool) {
    let lexeme = p.previous.lexeme;
    let text = &lexeme[1..lexeme.len() - 1];
    let handle = p.intern(text);
    p.emit_constant(Value::Obj(handle));
}

fn literal(p: &mut Parser, _can_assign: bool) {
    match p.previous.kind {
        TokenKind::False => p.emit_op(OpCode::False),
        TokenKind::Nil => p.emit_op(OpCode::Nil),
        TokenKind::True => p.emit_op(OpCode::True),
        _ => {}
    }
}

fn variable(p: &mut Parser, can_assign: bool) {
    let name = p.previous.lexeme;
    p.named_variable(name, can_assign);
}

fn unary(p: &mut Parser, _can_assign: bool) {
    let op = p.previous.kind;
    p.parse_precedence(Precedence::Unary);
    match op {
        TokenKind::Minus => p.emit_op(OpCode::Negate),
        TokenKind::Bang => p.emit_op(OpCode::Not),
        _ => {}
    }
}

fn binary(p: &mut Parser, _can_assign: bool) {
    let op = p.previous.kind;
    p.parse_precedence(rule_for(op).precedence.next());
    match op {
        TokenKind::BangEqual => {
            p.emit_op(OpCode::Equal);
            p.emit_op(OpCode::Not);
        }
        TokenKind::EqualEqual => p.emit_op(OpCode::Equal),
        TokenKind::Greater => p.emit_op(OpCode::Greater),
        TokenKind::GreaterEqual => {
            p.emit_op(OpCode::Less);
            p.emit_op(OpCode::Not);
        }
        TokenKind::Less => p.emit_op(OpCode::Less),
        TokenKind::LessEqual => {
            p.emit_op(OpCode::Greater);
            p.emit_op(OpCode::Not);
        }
        TokenKind::Plus => p.emit_op(OpCode::Add),
        TokenKind::Minus => p.emit_op(OpCode::Subtract),
        TokenKind::Star => p.emit_op(OpCode::Multiply),
        TokenKind::Slash => p.emit_op(OpCode::Divide),
        _ => {}
    }
}

/// Short-circuit and: skip the right operand when the left is falsey.
fn and_(p: &mut Parser, _can_assign: bool) {
    let end_jump = p.emit_jump(OpCode::JumpIfFalse);
    p.emit_op(OpCode::Pop);
    p.parse_precedence(Precedence::And);
    p.patch_jump(end_jump);
}

/// Short-circuit or: keep the left operand when it is truthy.
fn or_(p: &mut Parser, _can_assign: bool) {
    let else_jump = p.emit_jump(OpCode::JumpIfFalse);
    let end_jump = p.emit_jump(OpCode::Jump);
    p.patch_jump(else_jump);
    p.emit_op(OpCode::Pop);
    p.parse_precedence(Precedence::Or);
    p.patch_jump(end_jump);
}

fn call(p: &mut Parser, _can_assign: bool) {
    let arg_count = p.argument_list();
    p.emit_bytes(OpCode::Call as u8, arg_count);
}

fn dot(p: &mut Parser, can_assign: bool) {
    p.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let lexeme = p.previous.lexeme;
    let name = p.identifier_constant(lexeme);
    if can_assign && p.match_token(TokenKind::Equal) {
        p.expression();
        p.emit_bytes(OpCode::SetProperty as u8, name);
    } else if p.match_token(TokenKind::LeftParen) {
        let arg_count = p.argument_list();
        p.emit_bytes(OpCode::Invoke as u8, name);
        p.emit_byte(arg_count);
    } else {
        p.emit_bytes(OpCode::GetProperty as u8, name);
    }
}

fn this_(p: &mut Parser, _can_assign: bool) {
    if p.class_compiler.is_none() {
        p.error("Can't use 'this' outside of a class.");
        return;
    }
    p.named_variable("this", false);
}

fn super_(p: &mut Parser, _can_assign: bool) {
    match &p.class_compiler {
        None => p.error("Can't use 'super' outside of a class."),
        Some(class) if !class.has_superclass => {
            p.error("Can't use 'super' in a class with no superclass.");
        }
        _ => {}
    }
    p.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    p.consume(TokenKind::Identifier, "Expect superclass method name.");
    let lexeme = p.previous.lexeme;
    let name = p.identifier_constant(lexeme);

    p.named_variable("this", false);
    if p.match_token(TokenKind::LeftParen) {
        let arg_count = p.argument_list();
        p.named_variable("super", false);
        p.emit_bytes(OpCode::SuperInvoke as u8, name);
        p.emit_byte(arg_count);
    } else {
        p.named_variable("super", false);
        p.emit_bytes(OpCode::GetSuper as u8, name);
    }
}
