//! Single-pass bytecode compiler.
//!
//! A Pratt parser that, in one left-to-right pass over the token stream,
//! resolves lexical scope, captures upvalues through enclosing functions,
//! emits bytecode into per-function chunks, and interns constants. There
//! is no AST: parsing *is* code generation, and forward jumps are patched
//! in place once their targets are known.
//!
//! The compiler owns a stack of per-function frames (`FnFrame`), one per
//! function currently being compiled; the innermost frame is always the
//! emission target. Compile-time allocations (interned strings, finished
//! function objects) go through the same heap as runtime values, so the
//! in-progress constant pools are GC roots for collections triggered
//! while compiling.

use crate::chunk::{Chunk, Op};
use crate::debug;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::object::{Function, ObjData};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{Handle, Value};

const MAX_LOCALS: usize = 64;
const MAX_UPVALUES: usize = 32;
const MAX_BREAKS: usize = 16;
const MAX_BRANCHES: usize = 127;
const MAX_LABELS: usize = 31;

/// Bit 7 of a `CLOSURE` upvalue byte: the index names an enclosing
/// local rather than an enclosing upvalue.
pub const UPVALUE_IS_LOCAL: u8 = 0x80;

/// Operator precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / \
    Unary,      // ! -
    Postfix,    // . () [] @ ^
}

impl Precedence {
    fn stronger(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary | Precedence::Postfix => Precedence::Postfix,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    /// Top-level script or REPL input.
    Script,
    /// `fun name(...)` declaration.
    Fun,
    /// Anonymous function, including synthetic thunks.
    Lambda,
    /// Method in a class body.
    Method,
    /// The `init` method; implicitly returns `this`.
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// Scope depth, or −1 while the initializer is still being compiled.
    depth: i32,
    captured: bool,
}

struct LoopInfo {
    /// Scope depth at loop entry; `break` discards deeper locals.
    scope_depth: i32,
    /// Offsets of pending `break` jumps, patched at loop end.
    breaks: Vec<usize>,
}

/// Per-function compiler state. The enclosing function is the previous
/// entry in the compiler's frame stack.
struct FnFrame<'src> {
    fn_type: FunctionType,
    name: Value,
    arity: u8,
    has_rest_param: bool,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    /// Encoded upvalue bytes: bit 7 = is-local, bits 0-6 = source index.
    upvalues: Vec<u8>,
    scope_depth: i32,
    loops: Vec<LoopInfo>,
}

struct ClassInfo {
    has_superclass: bool,
}

type ParseFn<'src, 'ctx> = fn(&mut Compiler<'src, 'ctx>, bool);

struct ParseRule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

pub struct Compiler<'src, 'ctx> {
    scanner: Scanner<'src>,
    heap: &'ctx mut Heap,
    /// Roots owned by the VM (globals, the `init` string); live across
    /// any collection the compiler triggers.
    persistent_roots: &'ctx [Value],
    lambda_count: &'ctx mut i64,
    print_code: bool,

    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<String>,

    frames: Vec<FnFrame<'src>>,
    classes: Vec<ClassInfo>,
    /// Upvalue bytes of the most recently finished frame, consumed by
    /// the `CLOSURE` emission in the enclosing frame.
    pending_upvalues: Vec<u8>,
}

/// Compile a source buffer into a top-level function object.
///
/// On failure the partial function is discarded and all diagnostics are
/// returned joined into one `Error::Compile`.
pub fn compile(
    heap: &mut Heap,
    source: &str,
    persistent_roots: &[Value],
    lambda_count: &mut i64,
    print_code: bool,
) -> Result<Handle> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        heap,
        persistent_roots,
        lambda_count,
        print_code,
        current: Token::synthetic(""),
        previous: Token::synthetic(""),
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        frames: Vec::new(),
        classes: Vec::new(),
        pending_upvalues: Vec::new(),
    };

    compiler.begin_frame(FunctionType::Script);
    compiler.advance();

    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration(true);
    }

    let function = compiler.finish_frame(false);
    if compiler.had_error {
        Err(Error::Compile(compiler.diagnostics.join("\n")))
    } else {
        Ok(function)
    }
}

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    // -----------------------------------------------------------------------
    // Error reporting
    // -----------------------------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            // The lexeme of an error token is its own message.
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.diagnostics
            .push(format!("[line {}] Error{}: {}", token.line, location, message));
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon
                || self.current.kind >= TokenKind::Break
            {
                return;
            }
            self.advance();
        }
    }

    // -----------------------------------------------------------------------
    // Token handling
    // -----------------------------------------------------------------------

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
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Heap access at compile time
    // -----------------------------------------------------------------------

    /// Collect if the heap asks for it, rooting the VM's persistent
    /// values plus everything the in-progress frames reference.
    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let mut roots = self.persistent_roots.to_vec();
            for frame in &self.frames {
                roots.push(frame.name);
                roots.extend_from_slice(&frame.chunk.constants);
            }
            self.heap.collect(&roots);
        }
    }

    fn intern(&mut self, chars: &str) -> Handle {
        self.maybe_collect();
        self.heap.intern_string(chars)
    }

    fn intern_real(&mut self, value: f64) -> Handle {
        self.maybe_collect();
        self.heap.intern_real(value)
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    fn frame(&mut self) -> &mut FnFrame<'src> {
        self.frames.last_mut().expect("no active compiler frame")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.frame().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_pair(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.frame().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Jump too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// Emit a forward jump with placeholder offset bytes; returns the
    /// offset of the placeholder for `patch_jump`.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.frame().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to account for the offset bytes themselves.
        let jump = self.frame().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Jump too large.");
        }
        let code = &mut self.frame().chunk.code;
        code[offset] = (jump >> 8) as u8;
        code[offset + 1] = jump as u8;
    }

    fn emit_return(&mut self) {
        if self.frame().fn_type == FunctionType::Initializer {
            self.emit_pair(Op::GetLocal, 0);
            self.emit_op(Op::Return);
        } else {
            self.emit_op(Op::ReturnNil);
        }
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.frame().chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in function.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        match value {
            Value::Int(0) => self.emit_op(Op::Zero),
            Value::Int(i) if (0..=255).contains(&i) => self.emit_pair(Op::Int, i as u8),
            _ => {
                let index = self.make_constant(value);
                self.emit_pair(Op::Constant, index);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Compiler frames and scoping
    // -----------------------------------------------------------------------

    fn begin_frame(&mut self, fn_type: FunctionType) {
        let name = match fn_type {
            FunctionType::Script => Value::Nil,
            FunctionType::Lambda => {
                let n = *self.lambda_count;
                *self.lambda_count += 1;
                Value::Int(n)
            }
            _ => {
                let lexeme = self.previous.lexeme;
                Value::Obj(self.intern(lexeme))
            }
        };

        // Slot 0 is the callee/receiver: nameable as `this` in methods,
        // inaccessible otherwise.
        let slot_zero = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };

        self.frames.push(FnFrame {
            fn_type,
            name,
            arity: 0,
            has_rest_param: false,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot_zero,
                depth: 0,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        });
    }

    /// Seal the innermost frame into a Function object. The caller emits
    /// the `CLOSURE` instruction (except for the top-level script).
    fn finish_frame(&mut self, return_expr: bool) -> Handle {
        if return_expr {
            self.emit_op(Op::Return);
        } else {
            self.emit_return();
        }

        // Safepoint while this frame's constants are still rooted.
        self.maybe_collect();

        let frame = self.frames.pop().expect("no active compiler frame");
        let mut chunk = frame.chunk;
        chunk.freeze();

        let function = Function {
            arity: frame.arity,
            has_rest_param: frame.has_rest_param,
            upvalue_count: frame.upvalues.len() as u8,
            name: frame.name,
            class: Value::Nil,
            chunk,
        };

        if self.print_code && !self.had_error {
            eprint!("{}", debug::disassemble_function(self.heap, &function));
        }

        let handle = self.heap.insert(ObjData::Function(function));
        self.pending_upvalues = frame.upvalues;
        handle
    }

    fn begin_scope(&mut self) {
        self.frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame().scope_depth -= 1;
        loop {
            let popped = {
                let frame = self.frames.last().expect("no active compiler frame");
                match frame.locals.last() {
                    Some(local) if local.depth > frame.scope_depth => Some(local.captured),
                    _ => None,
                }
            };
            match popped {
                Some(captured) => {
                    self.frame().locals.pop();
                    if captured {
                        self.emit_op(Op::CloseUpvalue);
                    } else {
                        self.emit_op(Op::Pop);
                    }
                }
                None => return,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    fn resolve_local(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        {
            let frame = &self.frames[frame_index];
            for (index, local) in frame.locals.iter().enumerate().rev() {
                if local.name == name {
                    uninitialized = local.depth == -1;
                    found = Some(index as u8);
                    break;
                }
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> u8 {
        let encoded = if is_local { index | UPVALUE_IS_LOCAL } else { index };
        let frame = &mut self.frames[frame_index];

        if let Some(existing) = frame.upvalues.iter().position(|u| *u == encoded) {
            return existing as u8;
        }
        if frame.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many upvalues in function.");
            return 0;
        }
        frame.upvalues.push(encoded);
        (frame.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }
        let enclosing = frame_index - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(frame_index, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_index, upvalue, false));
        }

        None
    }

    fn add_local(&mut self, name: &'src str) {
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;

        let mut duplicate = false;
        {
            let frame = self.frames.last().expect("no active compiler frame");
            for local in frame.locals.iter().rev() {
                if local.depth != -1 && local.depth < frame.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Duplicate variable name in scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let frame = self.frame();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_pair(Op::DefGlobal, global);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let frame_index = self.frames.len() - 1;

        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(frame_index, name) {
            (Op::GetLocal, Op::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(frame_index, name) {
            (Op::GetUpvalue, Op::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (Op::GetGlobal, Op::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
    }

    // -----------------------------------------------------------------------
    // Pratt dispatch
    // -----------------------------------------------------------------------

    fn rule(kind: TokenKind) -> ParseRule<'src, 'ctx> {
        use TokenKind::*;

        fn make<'s, 'c>(
            prefix: Option<ParseFn<'s, 'c>>,
            infix: Option<ParseFn<'s, 'c>>,
            precedence: Precedence,
        ) -> ParseRule<'s, 'c> {
            ParseRule {
                prefix,
                infix,
                precedence,
            }
        }

        match kind {
            LeftParen => make(Some(Self::grouping), Some(Self::call), Precedence::Postfix),
            LeftBracket => make(Some(Self::list), Some(Self::index), Precedence::Postfix),
            Dot => make(None, Some(Self::dot), Precedence::Postfix),
            At | Hat => make(None, Some(Self::iter_accessor), Precedence::Postfix),
            Plus => make(None, Some(Self::binary), Precedence::Term),
            Minus => make(Some(Self::negative), Some(Self::binary), Precedence::Term),
            Star | Slash | Backslash => make(None, Some(Self::binary), Precedence::Factor),
            Bang => make(Some(Self::not), None, Precedence::None),
            Greater | Less | GreaterEqual | LessEqual => {
                make(None, Some(Self::binary), Precedence::Comparison)
            }
            BangEqual | EqualEqual => make(None, Some(Self::binary), Precedence::Equality),
            Identifier => make(Some(Self::variable), None, Precedence::None),
            String => make(Some(Self::string), None, Precedence::None),
            Int => make(Some(Self::int_literal), None, Precedence::None),
            Real => make(Some(Self::real_literal), None, Precedence::None),
            And => make(None, Some(Self::op_and), Precedence::And),
            Or => make(None, Some(Self::op_or), Precedence::Or),
            Nil => make(Some(Self::literal_nil), None, Precedence::None),
            True => make(Some(Self::literal_true), None, Precedence::None),
            False => make(Some(Self::literal_false), None, Precedence::None),
            This => make(Some(Self::key_this), None, Precedence::None),
            Super => make(Some(Self::key_super), None, Precedence::None),
            Fun => make(Some(Self::lambda), None, Precedence::None),
            If => make(Some(Self::if_expr), None, Precedence::None),
            Handle => make(Some(Self::handler), None, Precedence::None),
            Dynvar => make(Some(Self::dynvar), None, Precedence::None),
            _ => make(None, None, Precedence::None),
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match Self::rule(self.previous.kind).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // -----------------------------------------------------------------------
    // Expression parselets
    // -----------------------------------------------------------------------

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn literal_nil(&mut self, _can_assign: bool) {
        self.emit_op(Op::Nil);
    }

    fn literal_true(&mut self, _can_assign: bool) {
        self.emit_op(Op::True);
    }

    fn literal_false(&mut self, _can_assign: bool) {
        self.emit_op(Op::False);
    }

    fn int_literal(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let parsed = if let Some(hex) = lexeme.strip_prefix('$') {
            i64::from_str_radix(hex, 16)
        } else if let Some(bin) = lexeme.strip_prefix('%') {
            i64::from_str_radix(bin, 2)
        } else {
            lexeme.parse::<i64>()
        };
        match parsed {
            Ok(value) => self.emit_constant(Value::Int(value)),
            Err(_) => self.error("Integer constant overflow."),
        }
    }

    fn real_literal(&mut self, _can_assign: bool) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => {
                let handle = self.intern_real(value);
                self.emit_constant(Value::Obj(handle));
            }
            Err(_) => self.error("Real constant overflow."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        // Strip the surrounding quotes.
        let lexeme = self.previous.lexeme;
        let chars = &lexeme[1..lexeme.len() - 1];
        let handle = self.intern(chars);
        self.emit_constant(Value::Obj(handle));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn key_this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Invalid outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn key_super(&mut self, _can_assign: bool) {
        match self.classes.last().map(|class| class.has_superclass) {
            None => self.error("Invalid outside of a class."),
            Some(false) => self.error("Invalid in a class with no superclass."),
            Some(true) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method = self.previous.lexeme;
        let name = self.identifier_constant(method);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let (arg_count, is_vararg) = self.argument_list(TokenKind::RightParen);
            self.named_variable("super", false);
            let op = if is_vararg {
                Op::VSuperInvoke
            } else {
                Op::SuperInvoke
            };
            self.emit_pair(op, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_pair(Op::GetSuper, name);
        }
    }

    fn op_and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpAnd);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn op_or(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpOr);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn not(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(Op::Not);
    }

    fn negative(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(Op::Neg);
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::rule(operator);
        self.parse_precedence(rule.precedence.stronger());

        match operator {
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            // Comparisons lower onto LESS with swap/not wrappers.
            TokenKind::Greater => {
                self.emit_op(Op::Swap);
                self.emit_op(Op::Less);
            }
            TokenKind::LessEqual => {
                self.emit_op(Op::Swap);
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Sub),
            TokenKind::Star => self.emit_op(Op::Mul),
            TokenKind::Slash => self.emit_op(Op::Div),
            TokenKind::Backslash => self.emit_op(Op::Mod),
            _ => unreachable!("not a binary operator"),
        }
    }

    /// Parse a comma-separated argument (or list element) sequence up to
    /// `terminator`. A `..` prefix unpacks a list inline and switches the
    /// call into its variadic form: a running element count is kept on
    /// the stack above the arguments, maintained by `UNPACK` and `SWAP`.
    fn argument_list(&mut self, terminator: TokenKind) -> (u8, bool) {
        let mut arg_count: u32 = 0;
        let mut is_vararg = false;

        if !self.check(terminator) {
            loop {
                if self.matches(TokenKind::DotDot) {
                    if !is_vararg {
                        // Introduce the runtime count of unpacked items.
                        self.emit_constant(Value::Int(0));
                        is_vararg = true;
                    }
                    self.expression();
                    self.emit_op(Op::Unpack);
                } else {
                    self.expression();
                    if is_vararg {
                        // Bubble the count back above the new argument.
                        self.emit_op(Op::Swap);
                    }
                    if arg_count == 255 {
                        self.error("Too many arguments.");
                    }
                    arg_count += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        let message = if terminator == TokenKind::RightParen {
            "Expect ')' after arguments."
        } else {
            "Expect ']' after list elements."
        };
        self.consume(terminator, message);
        (arg_count.min(255) as u8, is_vararg)
    }

    fn call(&mut self, _can_assign: bool) {
        let (arg_count, is_vararg) = self.argument_list(TokenKind::RightParen);
        if is_vararg {
            self.emit_pair(Op::VCall, arg_count);
        } else {
            match arg_count {
                0 => self.emit_op(Op::Call0),
                1 => self.emit_op(Op::Call1),
                2 => self.emit_op(Op::Call2),
                _ => self.emit_pair(Op::Call, arg_count),
            }
        }
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let property = self.previous.lexeme;
        let name = self.identifier_constant(property);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_pair(Op::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let (arg_count, is_vararg) = self.argument_list(TokenKind::RightParen);
            let op = if is_vararg { Op::VInvoke } else { Op::Invoke };
            self.emit_pair(op, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_pair(Op::GetProperty, name);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        let (count, is_vararg) = self.argument_list(TokenKind::RightBracket);
        let op = if is_vararg { Op::VList } else { Op::List };
        self.emit_pair(op, count);
    }

    fn index(&mut self, can_assign: bool) {
        if self.matches(TokenKind::Colon) {
            // `[:end]` — slice from the beginning.
            self.emit_constant(Value::Int(0));
            self.slice(can_assign);
        } else {
            self.expression();
            if self.matches(TokenKind::Colon) {
                self.slice(can_assign);
            } else {
                self.consume(TokenKind::RightBracket, "Expect ']' after index.");
                if can_assign && self.matches(TokenKind::Equal) {
                    self.expression();
                    self.emit_op(Op::SetIndex);
                } else {
                    self.emit_op(Op::GetIndex);
                }
            }
        }
    }

    fn slice(&mut self, can_assign: bool) {
        if self.matches(TokenKind::RightBracket) {
            // `[begin:]` — slice to the end.
            self.emit_constant(Value::Int(i64::MAX));
        } else {
            self.expression();
            self.consume(TokenKind::RightBracket, "Expect ']' after slice.");
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        } else {
            self.emit_op(Op::GetSlice);
        }
    }

    fn iter_accessor(&mut self, can_assign: bool) {
        let accessor = self.previous.kind;
        if can_assign && self.matches(TokenKind::Equal) {
            if accessor == TokenKind::Hat {
                self.expression();
                self.emit_op(Op::SetItVal);
            } else {
                self.error("Invalid assignment target.");
            }
        } else {
            self.emit_op(if accessor == TokenKind::Hat {
                Op::GetItVal
            } else {
                Op::GetItKey
            });
        }
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.function(FunctionType::Lambda);
    }

    /// `if (cond : then : else)` as an expression.
    fn if_expr(&mut self, _can_assign: bool) {
        self.consume(TokenKind::LeftParen, "Expect '(' before condition.");
        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after condition.");
        let then_jump = self.emit_jump(Op::JumpFalse);

        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after consequent.");
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);

        self.expression();
        self.patch_jump(else_jump);
        self.consume(TokenKind::RightParen, "Expect ')' after alternative.");
    }

    /// Wrap the next expression in a zero-argument closure.
    fn build_thunk(&mut self) {
        self.begin_frame(FunctionType::Lambda);
        self.begin_scope();
        self.expression();
        let function = self.finish_frame(true);
        self.emit_closure(function);
    }

    /// `handle(protected : handler)` — compile the protected expression
    /// as a thunk, evaluate the handler eagerly, and let the VM run the
    /// thunk with the handler installed.
    fn handler(&mut self, _can_assign: bool) {
        self.consume(TokenKind::LeftParen, "Expect '(' before expression.");
        self.build_thunk();
        self.consume(TokenKind::Colon, "Expect ':' after expression.");

        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after handler.");
        self.emit_op(Op::CallHand);
    }

    /// `dynvar(name = value : body)` — evaluate the new binding, wrap the
    /// body in a thunk, and let the VM shadow the global for the call.
    fn dynvar(&mut self, _can_assign: bool) {
        self.consume(TokenKind::LeftParen, "Expect '(' before variable.");
        self.consume(TokenKind::Identifier, "Expect variable.");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);
        self.consume(TokenKind::Equal, "Expect '=' after variable.");

        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after binding.");

        self.build_thunk();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
        self.emit_pair(Op::CallBind, name);
    }

    // -----------------------------------------------------------------------
    // Functions and classes
    // -----------------------------------------------------------------------

    fn emit_closure(&mut self, function: Handle) {
        let constant = self.make_constant(Value::Obj(function));
        self.emit_pair(Op::Closure, constant);
        let upvalues = std::mem::take(&mut self.pending_upvalues);
        for encoded in upvalues {
            self.emit_byte(encoded);
        }
    }

    fn function(&mut self, fn_type: FunctionType) {
        self.begin_frame(fn_type);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' before parameters.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.frame().has_rest_param {
                    self.error_at_current("Rest parameter must be last.");
                }
                if self.frame().arity as usize >= MAX_LOCALS - 1 {
                    self.error_at_current("Too many parameters.");
                }
                self.frame().arity = self.frame().arity.saturating_add(1);
                if self.matches(TokenKind::DotDot) {
                    self.frame().has_rest_param = true;
                }
                let parameter = self.parse_variable("Expect parameter name.");
                self.define_variable(parameter);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        let function = if self.matches(TokenKind::Arrow) {
            if fn_type == FunctionType::Initializer {
                self.error("Can't return value from initializer.");
            }
            self.expression();
            self.finish_frame(true)
        } else {
            self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
            self.block();
            self.finish_frame(false)
        };
        self.emit_closure(function);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);
        let fn_type = if lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_pair(Op::Method, name);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_pair(Op::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassInfo {
            has_superclass: false,
        });

        let mut scoped_super = false;
        if self.matches(TokenKind::Less) {
            // The superclass can be any expression.
            self.expression();

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            scoped_super = true;

            self.named_variable(class_name, false);
            self.emit_op(Op::Inherit);
            self.classes
                .last_mut()
                .expect("class info just pushed")
                .has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Op::Pop);

        if scoped_super {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn fun_declaration(&mut self) {
        let name = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Fun);
        self.define_variable(name);
    }

    fn var_declaration(&mut self) {
        loop {
            let name = self.parse_variable("Expect variable name.");
            if self.matches(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(Op::Nil);
            }
            self.define_variable(name);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declarations.");
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn declaration(&mut self, top_level: bool) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement(top_level);
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self, top_level: bool) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Case) {
            self.case_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement(top_level);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(false);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self, top_level: bool) {
        self.expression();
        if top_level {
            // A top-level expression without ';' prints its value.
            if self.matches(TokenKind::Semicolon) {
                self.emit_op(Op::Pop);
            } else {
                self.emit_op(Op::Printq);
            }
        } else {
            self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
            self.emit_op(Op::Pop);
        }
    }

    /// `print a, b;` — separated values; a doubled comma inserts the
    /// column separator, a trailing comma suppresses the final newline.
    fn print_statement(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            let empty = self.intern("");
            self.emit_constant(Value::Obj(empty));
            self.emit_op(Op::Println);
            return;
        }

        self.expression();
        while self.matches(TokenKind::Comma) {
            self.emit_op(Op::Print);
            if self.matches(TokenKind::Comma) {
                let separator = self.intern("   ");
                self.emit_constant(Value::Obj(separator));
                self.emit_op(Op::Print);
            }
            if self.matches(TokenKind::Semicolon) {
                return;
            }
            self.expression();
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Println);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' before condition.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpFalse);
        self.statement(false);

        if self.matches(TokenKind::Else) {
            let else_jump = self.emit_jump(Op::Jump);
            self.patch_jump(then_jump);
            self.statement(false);
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.frame().chunk.code.len();

        self.consume(TokenKind::LeftParen, "Expect '(' before condition.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        self.begin_loop();
        let exit_jump = self.emit_jump(Op::JumpFalse);
        self.statement(false);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.begin_loop();

        self.consume(TokenKind::LeftParen, "Expect '(' before 'for' clauses.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement(false);
        }

        let mut loop_start = self.frame().chunk.code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpFalse));
        }

        if !self.matches(TokenKind::RightParen) {
            // The increment runs after the body, so control first jumps
            // over it; the back-edge targets the increment instead.
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.frame().chunk.code.len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after 'for' clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement(false);
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
        }

        self.end_loop();
        self.end_scope();
    }

    /// `case (subject) { when a, b: ... else: ... }`
    ///
    /// The subject is evaluated once and parked in a hidden local; each
    /// `when` label is compared with DUP/EQUAL, a match jumping into the
    /// branch body and a failed final label skipping to the next branch.
    fn case_statement(&mut self) {
        // 0: before any branch, 1: inside `when` branches, 2: after else.
        let mut state = 0;
        let mut case_ends: Vec<usize> = Vec::new();
        let mut when_labels: Vec<usize> = Vec::new();
        let mut prev_case_skip: Option<usize> = None;
        let mut empty_branch = false;

        self.consume(TokenKind::LeftParen, "Expect '(' before 'case' expression.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after 'case' expression.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before branches.");

        self.begin_scope();
        // Reserve the stack slot holding the subject.
        self.add_local("");
        self.define_variable(0);

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::When) || self.matches(TokenKind::Else) {
                if empty_branch {
                    self.error("Can't have empty branch.");
                }
                empty_branch = true;
                let branch_kind = self.previous.kind;
                if state == 2 {
                    self.error("Can't have branch after 'else'.");
                }
                if state == 1 {
                    // Close the previous branch: jump over the rest, and
                    // point its failed condition here.
                    if case_ends.len() < MAX_BRANCHES {
                        case_ends.push(self.emit_jump(Op::Jump));
                    } else {
                        self.error("Too many case branches.");
                    }
                    if let Some(skip) = prev_case_skip.take() {
                        self.patch_jump(skip);
                    }
                }
                if branch_kind == TokenKind::When {
                    state = 1;
                    loop {
                        self.emit_op(Op::Dup);
                        self.expression();
                        self.emit_op(Op::Equal);
                        if self.check(TokenKind::Comma) {
                            // A hit on a non-final label jumps straight
                            // to the branch body.
                            if when_labels.len() < MAX_LABELS {
                                when_labels.push(self.emit_jump(Op::JumpTrue));
                            } else {
                                self.error_at_current("Too many 'when' labels.");
                            }
                        }
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.consume(TokenKind::Colon, "Expect ':' after expression.");
                    prev_case_skip = Some(self.emit_jump(Op::JumpFalse));
                } else {
                    state = 2;
                    prev_case_skip = None;
                }
            } else {
                if state == 0 {
                    self.error_at_current("Can't have statement before any branch.");
                }
                // Early labels land on the first statement of the branch.
                while let Some(label) = when_labels.pop() {
                    self.patch_jump(label);
                }
                self.statement(false);
                empty_branch = false;
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after branches.");
        if empty_branch {
            self.error("Can't have empty branch.");
        }

        // Without an else branch, the last failed condition falls out.
        if state == 1
            && let Some(skip) = prev_case_skip
        {
            self.patch_jump(skip);
        }

        while let Some(end) = case_ends.pop() {
            self.patch_jump(end);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frame().fn_type == FunctionType::Script {
            self.error("Can't return from top-level.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().fn_type == FunctionType::Initializer {
                self.error("Can't return value from initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }

    fn begin_loop(&mut self) {
        let scope_depth = self.frame().scope_depth;
        self.frame().loops.push(LoopInfo {
            scope_depth,
            breaks: Vec::new(),
        });
    }

    fn end_loop(&mut self) {
        let loop_info = self
            .frame()
            .loops
            .pop()
            .expect("end_loop without begin_loop");
        for offset in loop_info.breaks {
            self.patch_jump(offset);
        }
    }

    fn break_statement(&mut self) {
        if self.frame().loops.is_empty() {
            self.error("Not in a loop.");
            return;
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");

        // Discard locals declared inside the loop before jumping out.
        let loop_depth = self
            .frame()
            .loops
            .last()
            .expect("loop checked above")
            .scope_depth;
        let ops: Vec<Op> = self
            .frame()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_depth)
            .map(|local| {
                if local.captured {
                    Op::CloseUpvalue
                } else {
                    Op::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit_op(op);
        }

        let jump = self.emit_jump(Op::Jump);
        let too_many = {
            let breaks = &mut self
                .frame()
                .loops
                .last_mut()
                .expect("loop checked above")
                .breaks;
            if breaks.len() < MAX_BREAKS {
                breaks.push(jump);
                false
            } else {
                true
            }
        };
        if too_many {
            self.error("Too many 'break's in loop.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn compile_source(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::new();
        let mut lambda_count = 0;
        let handle =
            compile(&mut heap, source, &[], &mut lambda_count, false).expect("source compiles");
        (heap, handle)
    }

    fn compile_error(source: &str) -> String {
        let mut heap = Heap::new();
        let mut lambda_count = 0;
        match compile(&mut heap, source, &[], &mut lambda_count, false) {
            Ok(_) => panic!("expected a compile error:\n{source}"),
            Err(Error::Compile(message)) => message,
            Err(other) => panic!("unexpected error kind: {other:?}"),
        }
    }

    /// Walk a chunk instruction by instruction, checking that every
    /// jump offset lands inside the code vector; recurses into nested
    /// function constants.
    fn check_jumps(heap: &Heap, function: Handle) {
        let chunk = &heap.function(function).chunk;
        let code = &chunk.code;
        let mut offset = 0;

        while offset < code.len() {
            let op = Op::from_byte(code[offset]).expect("valid opcode");
            match op {
                Op::Jump | Op::JumpOr | Op::JumpAnd | Op::JumpTrue | Op::JumpFalse => {
                    let jump = u16::from_be_bytes([code[offset + 1], code[offset + 2]]) as usize;
                    let target = offset + 3 + jump;
                    assert!(target <= code.len(), "jump at {offset} overshoots to {target}");
                    offset += 3;
                }
                Op::Loop => {
                    let jump = u16::from_be_bytes([code[offset + 1], code[offset + 2]]) as usize;
                    assert!(jump <= offset + 3, "loop at {offset} undershoots");
                    offset += 3;
                }
                Op::Closure => {
                    let index = code[offset + 1] as usize;
                    let nested = match chunk.constants[index] {
                        Value::Obj(handle) => handle,
                        other => panic!("closure constant is {other:?}"),
                    };
                    check_jumps(heap, nested);
                    offset += 2 + heap.function(nested).upvalue_count as usize;
                }
                Op::Constant
                | Op::Int
                | Op::GetLocal
                | Op::SetLocal
                | Op::GetGlobal
                | Op::DefGlobal
                | Op::SetGlobal
                | Op::GetUpvalue
                | Op::SetUpvalue
                | Op::GetProperty
                | Op::SetProperty
                | Op::GetSuper
                | Op::Call
                | Op::VCall
                | Op::Class
                | Op::Method
                | Op::List
                | Op::VList
                | Op::CallBind => offset += 2,
                Op::Invoke | Op::VInvoke | Op::SuperInvoke | Op::VSuperInvoke => offset += 3,
                _ => offset += 1,
            }
        }
        assert_eq!(offset, code.len(), "instruction walk must end exactly at code end");
    }

    #[test]
    fn jump_offsets_stay_in_range() {
        let sources = [
            "if (1 < 2) print 1; else print 2;",
            "var i = 0; while (i < 10) { i = i + 1; if (i == 5) break; }",
            "for (var i = 0; i < 3; i = i + 1) print i;",
            "print true and false or true;",
            "case (2) { when 1, 2: print 1; when 3: print 3; else: print 0; }",
            "fun f(n) { if (n < 1) return 0; return f(n - 1); } f(3);",
            "var x = if (true : 1 : 2);",
        ];
        for source in sources {
            let (heap, function) = compile_source(source);
            check_jumps(&heap, function);
        }
    }

    #[test]
    fn small_integer_literals_are_specialized() {
        let (heap, function) = compile_source("var a = 0; var b = 200; var c = 70000;");
        let code = &heap.function(function).chunk.code;
        assert!(code.contains(&(Op::Zero as u8)));
        assert!(code.contains(&(Op::Int as u8)));
        assert!(code.contains(&(Op::Constant as u8)));
    }

    #[test]
    fn call_opcodes_are_specialized_by_arity() {
        let (heap, function) = compile_source("fun f(..a) {} f(); f(1); f(1, 2); f(1, 2, 3);");
        let code = &heap.function(function).chunk.code;
        for op in [Op::Call0, Op::Call1, Op::Call2, Op::Call] {
            assert!(code.contains(&(op as u8)), "missing {op:?}");
        }
    }

    #[test]
    fn variadic_calls_use_vcall() {
        let (heap, function) = compile_source("fun f(..a) {} f(..[1, 2]);");
        let code = &heap.function(function).chunk.code;
        assert!(code.contains(&(Op::VCall as u8)));
        assert!(code.contains(&(Op::Unpack as u8)));
    }

    #[test]
    fn captured_locals_are_encoded_with_the_local_bit() {
        let (heap, script) = compile_source(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        // The script's only function constant is `outer`.
        let outer = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(h) => matches!(heap.get(*h).data, crate::object::ObjData::Function(_))
                    .then_some(*h),
                _ => None,
            })
            .expect("outer function constant");

        let outer_fn = heap.function(outer);
        let inner = outer_fn
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(h) => matches!(heap.get(*h).data, crate::object::ObjData::Function(_))
                    .then_some(*h),
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(heap.function(inner).upvalue_count, 1);

        // The CLOSURE for `inner` carries one upvalue byte with bit 7
        // set: it captures an enclosing local.
        let code = &outer_fn.chunk.code;
        let closure_at = code
            .iter()
            .position(|b| *b == Op::Closure as u8)
            .expect("closure emission");
        assert_eq!(code[closure_at + 2] & UPVALUE_IS_LOCAL, UPVALUE_IS_LOCAL);
    }

    #[test]
    fn scalar_constants_are_deduplicated() {
        let (heap, function) = compile_source("var a = 70000; var b = 70000; var c = 1.5 + 1.5;");
        let constants = &heap.function(function).chunk.constants;
        let ints = constants
            .iter()
            .filter(|c| matches!(c, Value::Int(70000)))
            .count();
        assert_eq!(ints, 1);
        let reals = constants
            .iter()
            .filter(|c| matches!(c, Value::Obj(h) if heap.real_value(*h).is_some()))
            .count();
        assert_eq!(reals, 1, "1.5 should intern and dedup to one constant");
    }

    #[test]
    fn upvalue_limit_is_enforced() {
        // One function capturing 33 distinct enclosing locals.
        let mut source = String::from("fun outer() {\n");
        for i in 0..33 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push_str("fun inner() { return 0");
        for i in 0..33 {
            source.push_str(&format!(" + v{i}"));
        }
        source.push_str("; }\n}\n");
        let message = compile_error(&source);
        assert!(message.contains("Too many upvalues in function."), "got: {message}");
    }

    #[test]
    fn local_limit_is_enforced() {
        let mut source = String::from("{\n");
        for i in 0..70 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push_str("}\n");
        let message = compile_error(&source);
        assert!(message.contains("Too many local variables in function."), "got: {message}");
    }

    #[test]
    fn lambdas_get_numbered_names() {
        let (heap, function) = compile_source("var f = fun () -> 1; var g = fun () -> 2;");
        let names: Vec<Value> = heap
            .function(function)
            .chunk
            .constants
            .iter()
            .filter_map(|c| match c {
                Value::Obj(h) => match &heap.get(*h).data {
                    crate::object::ObjData::Function(f) => Some(f.name),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(names, vec![Value::Int(0), Value::Int(1)]);
    }
}
