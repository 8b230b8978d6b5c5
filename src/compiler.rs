// File: src/compiler.rs
//
// Single-pass bytecode compiler for Lumen: a Pratt-precedence expression
// parser fused with a code generator. One `FunctionScope` per
// function being compiled forms a stack (innermost last) that mirrors the
// lexical nesting of `fun`/method declarations; scope resolution walks that
// stack to turn names into local slots, upvalue captures, or late-bound
// globals.

use crate::chunk::{Chunk, OpCode};
use crate::errors::LumenError;
use crate::heap::{Heap, LFunction, Obj, ObjRef};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
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
    Call,       // . () []
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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> ParseRule {
    ParseRule { prefix, infix, precedence }
}

/// Flat rule table indexed by token kind, favored over dynamic dispatch
/// through a trait per token type.
fn get_rule(kind: TokenKind) -> ParseRule {
    use Precedence as P;
    use TokenKind::*;
    match kind {
        LeftParen => rule(Some(Compiler::grouping), Some(Compiler::call), P::Call),
        LeftBracket => rule(Some(Compiler::array_literal), Some(Compiler::subscript), P::Call),
        LeftBrace => rule(Some(Compiler::dict_literal), None, P::None),
        Dot => rule(None, Some(Compiler::dot), P::Call),
        Minus => rule(Some(Compiler::unary), Some(Compiler::binary), P::Term),
        Plus => rule(None, Some(Compiler::binary), P::Term),
        Slash => rule(None, Some(Compiler::binary), P::Factor),
        Star => rule(None, Some(Compiler::binary), P::Factor),
        Bang => rule(Some(Compiler::unary), None, P::None),
        BangEqual => rule(None, Some(Compiler::binary), P::Equality),
        EqualEqual => rule(None, Some(Compiler::binary), P::Equality),
        Greater => rule(None, Some(Compiler::binary), P::Comparison),
        GreaterEqual => rule(None, Some(Compiler::binary), P::Comparison),
        Less => rule(None, Some(Compiler::binary), P::Comparison),
        LessEqual => rule(None, Some(Compiler::binary), P::Comparison),
        Identifier => rule(Some(Compiler::variable), None, P::None),
        String => rule(Some(Compiler::string), None, P::None),
        Number => rule(Some(Compiler::number), None, P::None),
        And => rule(None, Some(Compiler::and_), P::And),
        Or => rule(None, Some(Compiler::or_), P::Or),
        False => rule(Some(Compiler::literal), None, P::None),
        Nil => rule(Some(Compiler::literal), None, P::None),
        True => rule(Some(Compiler::literal), None, P::None),
        Super => rule(Some(Compiler::super_), None, P::None),
        This => rule(Some(Compiler::this_), None, P::None),
        _ => rule(None, None, P::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueRecord {
    index: u8,
    is_local: bool,
}

struct FunctionScope<'src> {
    name: Option<&'src str>,
    arity: u8,
    upvalue_count: u8,
    chunk: Chunk,
    ftype: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRecord>,
    scope_depth: i32,
}

impl<'src> FunctionScope<'src> {
    fn new(name: Option<&'src str>, ftype: FunctionType) -> Self {
        // Slot 0 is reserved for the receiver in methods/initializers, and
        // for the closure itself (unnameable) in plain functions/script.
        let implicit_name = if matches!(ftype, FunctionType::Method | FunctionType::Initializer) {
            "this"
        } else {
            ""
        };
        FunctionScope {
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            ftype,
            locals: vec![Local { name: implicit_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

#[derive(Clone, Copy)]
enum LocalLookup {
    Slot(u8),
    Uninitialized,
}

struct ClassScope {
    has_superclass: bool,
}

/// Compiler state for one `compile()` invocation. Holds the token stream,
/// the stack of in-progress `FunctionScope`s (innermost last, forming the
/// chain of enclosing functions), and the stack of enclosing class
/// declarations (for `this`/`super` resolution).
pub struct Compiler<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<LumenError>,
    heap: &'src mut Heap,
    scopes: Vec<FunctionScope<'src>>,
    classes: Vec<ClassScope>,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, heap: &'src mut Heap) -> Self {
        let tokens = tokenize(source);
        let eof = *tokens.last().unwrap();
        Compiler {
            tokens,
            pos: 0,
            previous: eof,
            current: eof,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            scopes: vec![FunctionScope::new(None, FunctionType::Script)],
            classes: Vec::new(),
        }
    }

    fn current_scope(&mut self) -> &mut FunctionScope<'src> {
        self.scopes.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.scopes.last_mut().unwrap().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    // ---- token stream plumbing ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokens[self.pos];
            self.pos += 1;
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(LumenError::compile(message.to_string(), token.line));
    }

    /// Advances past tokens until a statement boundary, so one syntax
    /// error doesn't cascade into a pile of spurious follow-on errors.
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

    // ---- bytecode emission helpers ----

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.current_chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        if self.current_scope().ftype == FunctionType::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(message);
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.line();
        self.current_chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.current_chunk().patch_jump(offset) {
            self.error(message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.line();
        if let Err(message) = self.current_chunk().emit_loop(loop_start, line) {
            self.error(message);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.heap.intern(name);
        self.make_constant(Value::Obj(r))
    }

    // ---- scopes & locals ----

    fn begin_scope(&mut self) {
        self.current_scope().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let scope = self.current_scope();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        while let Some(local) = scope.locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = scope.locals.pop().unwrap().is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        let scope = self.current_scope();
        if scope.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_scope().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.current_scope().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.current_scope().scope_depth;
        let duplicate = self
            .current_scope()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == -1 || l.depth >= depth)
            .any(|l| l.depth == depth && l.name == name);
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let scope = self.current_scope();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        scope.locals.last_mut().unwrap().depth = depth;
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_scope().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_scope().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// A local lookup can find a name whose declaring `var` statement
    /// hasn't finished executing yet (its `depth` is still -1), distinct
    /// from the slot index itself, which may legitimately be 255.
    fn resolve_local(&self, scope_idx: usize, name: &str) -> Option<LocalLookup> {
        let scope = &self.scopes[scope_idx];
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some(if local.depth == -1 {
                    LocalLookup::Uninitialized
                } else {
                    LocalLookup::Slot(i as u8)
                });
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Option<u8> {
        if scope_idx == 0 {
            return None;
        }
        let enclosing = scope_idx - 1;
        if let Some(lookup) = self.resolve_local(enclosing, name) {
            let slot = match lookup {
                LocalLookup::Uninitialized => {
                    self.error("Can't read local variable in its own initializer.");
                    return None;
                }
                LocalLookup::Slot(slot) => slot,
            };
            self.scopes[enclosing].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue(scope_idx, slot, true));
        }
        if let Some(slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_idx, slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.scopes[scope_idx];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        scope.upvalues.push(UpvalueRecord { index, is_local });
        scope.upvalue_count = scope.upvalues.len() as u8;
        (scope.upvalues.len() - 1) as u8
    }

    // ---- expressions ----

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        if lexeme.contains('.') {
            self.error("Floating point literals are not supported; integers only.");
            return;
        }
        match lexeme.parse::<i64>() {
            Ok(n) => self.emit_constant(Value::Int(n)),
            Err(_) => self.error("Invalid integer literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let r = self.heap.intern(text);
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = get_rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mul),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        if count > 255 {
            self.error("Too many elements in array literal.");
        }
        self.emit_op_byte(OpCode::Array, count as u8);
    }

    fn dict_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after dict key.");
                self.expression();
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dict entries.");
        if count > 255 {
            self.error("Too many entries in dict literal.");
        }
        self.emit_op_byte(OpCode::Dict, count as u8);
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetElement);
        } else {
            self.emit_op(OpCode::GetElement);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let scope_idx = self.scopes.len() - 1;
        let (get_op, set_op, arg) = if let Some(lookup) = self.resolve_local(scope_idx, name) {
            let slot = match lookup {
                LocalLookup::Uninitialized => {
                    self.error("Can't read local variable in its own initializer.");
                    0
                }
                LocalLookup::Slot(slot) => slot,
            };
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(scope_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, name_const);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::GetSuper, name_const);
        }
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name_const);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name_const);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name_const);
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    // ---- statements ----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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

        if self.matches(TokenKind::Else) {
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

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
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
        if self.current_scope().ftype == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_scope().ftype == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    /// Compiles a function body: pushes a new `FunctionScope`, parses the
    /// parameter list and block body, then pops the scope and emits the
    /// enclosing `CLOSURE` instruction with its upvalue capture list.
    fn function(&mut self, ftype: FunctionType) {
        let name = self.previous.lexeme;
        self.scopes.push(FunctionScope::new(Some(name), ftype));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let scope = self.current_scope();
                if scope.arity == 255 {
                    self.error("Can't have more than 255 parameters.");
                }
                scope.arity += 1;
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function_ref, upvalues) = self.end_function();
        let const_idx = self.make_constant(Value::Obj(function_ref));
        self.emit_op_byte(OpCode::Closure, const_idx);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueRecord>) {
        self.emit_return();
        let scope = self.scopes.pop().unwrap();
        let name_ref = scope.name.map(|n| self.heap.intern(n));
        let function = LFunction {
            name: name_ref,
            arity: scope.arity,
            upvalue_count: scope.upvalue_count,
            chunk: scope.chunk,
        };
        let function_ref = self.heap.alloc(Obj::Function(function));
        (function_ref, scope.upvalues)
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassScope { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme;
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(super_name, false);

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        let ftype = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(ftype);
        self.emit_op_byte(OpCode::Method, name_const);
    }
}

/// Compiles `source` into a root script `Function`, allocating all
/// constants (including nested function bodies) into `heap`. Returns the
/// accumulated compile errors on failure instead of the finished function.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<LumenError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }

    if compiler.had_error {
        return Err(compiler.errors);
    }

    let (function_ref, upvalues) = compiler.end_function();
    debug_assert!(upvalues.is_empty(), "script function captures no upvalues");
    Ok(function_ref)
}
