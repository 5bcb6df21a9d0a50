//! Single-pass Pratt parser / code generator.
//!
//! Grounded in `original_source/src/compiler.c`: there is no intermediate
//! AST — each grammar rule emits bytecode directly into the function
//! currently being compiled, resolving locals/upvalues/globals as names are
//! seen. The precedence-climbing expression parser and the per-function
//! local/upvalue tables (capped at 256 slots, spec.md §4.2) are carried
//! over unchanged; only the opcode names and container types come from
//! `feline-core` instead of the original's C structs.

use crate::error::{CompileError, CompileErrors};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use feline_core::chunk::{Chunk, ConstValue, Op};
use feline_core::object::Function;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Prec {
    None,
    Assignment, // =
    Or,         // ||
    And,        // &&
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        use Prec::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Constructor,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

struct UpvalueRef {
    index: u8,
    is_local: bool,
}

struct FuncState {
    chunk: Chunk,
    arity: u8,
    name: Option<String>,
    kind: FnKind,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueRef>,
}

impl FuncState {
    fn new(kind: FnKind, name: Option<String>) -> Self {
        let reserved_name = if matches!(kind, FnKind::Method | FnKind::Constructor) {
            "this"
        } else {
            ""
        };
        Self {
            chunk: Chunk::new(),
            arity: 0,
            name,
            kind,
            locals: vec![Local { name: reserved_name.to_string(), depth: 0, is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct LoopState {
    loop_start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

/// Compiles one source file into a top-level [`Function`] whose `chunk` is
/// the module body (an implicit `fun script() { ... }`, matching the
/// original's treatment of the top level).
pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    funcs: Vec<FuncState>,
    classes: Vec<ClassState>,
    loops: Vec<LoopState>,
}

impl<'src> Compiler<'src> {
    pub fn compile(source: &'src str) -> Result<Function, CompileErrors> {
        tracing::debug!(bytes = source.len(), "compiling source");
        let mut c = Compiler {
            lexer: Lexer::new(source),
            previous: Token { kind: TokenKind::Eof, lexeme: "", line: 0 },
            current: Token { kind: TokenKind::Eof, lexeme: "", line: 0 },
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            funcs: vec![FuncState::new(FnKind::Script, None)],
            classes: Vec::new(),
            loops: Vec::new(),
        };
        c.advance();
        while !c.check(TokenKind::Eof) {
            c.declaration();
        }
        c.consume(TokenKind::Eof, "expected end of expression");
        c.emit_op(Op::Null);
        c.emit_op(Op::Return);

        if c.had_error {
            return Err(CompileErrors(c.errors));
        }
        let top = c.funcs.pop().unwrap();
        let mut function = Function::new(0, None);
        function.chunk = top.chunk;
        Ok(function)
    }

    // ---- token stream -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.lexer.take_error();
            self.error_at_current(&msg);
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
        let at = if token.kind == TokenKind::Eof { "<eof>".to_string() } else { token.lexeme.to_string() };
        self.errors.push(CompileError { line: token.line, at, message: message.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Fun | Native | Var | For | If | While | Print | Return | Try | Import
                | Export => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emission -------------------------------------------------

    fn func(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.funcs.last_mut().unwrap().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_op(&mut self, op: Op) -> usize {
        let line = self.line();
        self.chunk().push_op(op, line)
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().push_u8(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line();
        self.chunk().push_u16(value, line);
    }

    fn emit_const(&mut self, value: ConstValue) -> u16 {
        self.chunk().add_const(value)
    }

    fn emit_constant(&mut self, value: ConstValue) {
        let ix = self.emit_const(value);
        self.emit_op(Op::UseConstant);
        self.emit_u16(ix);
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let at = self.chunk().len();
        self.emit_u16(0xffff);
        at
    }

    fn patch_jump(&mut self, operand_at: usize) {
        if let Err(msg) = self.chunk().patch_jump(operand_at) {
            self.error(&msg);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.chunk().len() + 2 - loop_start;
        if offset > u16::MAX as usize {
            self.error("loop body too large");
        }
        self.emit_u16(offset as u16);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        self.emit_const(ConstValue::Str(name.to_string()))
    }

    // ---- scopes / locals -----------------------------------------

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func().scope_depth -= 1;
        let depth = self.func().scope_depth;
        while let Some(local) = self.func().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.func().locals.last().unwrap().is_captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
            self.func().locals.pop();
        }
    }

    fn declare_local(&mut self, name: &str) {
        if self.func().scope_depth == 0 {
            return;
        }
        let depth = self.func().scope_depth;
        for local in self.func().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("a variable with this name is already declared in this scope");
                return;
            }
        }
        if self.func().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in one function");
            return;
        }
        self.func().locals.push(Local { name: name.to_string(), depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.func().scope_depth == 0 {
            return;
        }
        let depth = self.func().scope_depth;
        self.func().locals.last_mut().unwrap().depth = depth;
    }

    fn resolve_local(&self, level: usize, name: &str) -> Option<u8> {
        self.funcs[level]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u8)
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let enclosing = level - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.funcs[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(level, local, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(level, up, false));
        }
        None
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let func = &mut self.funcs[level];
        for (i, uv) in func.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if func.upvalues.len() >= MAX_UPVALUES {
            self.error("too many closure variables captured in one function");
            return 0;
        }
        func.upvalues.push(UpvalueRef { index, is_local });
        (func.upvalues.len() - 1) as u8
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme.to_string();
        self.declare_local(&name);
        if self.func().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u16) {
        if self.func().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(Op::DefineGlobal);
        self.emit_u16(global);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let level = self.funcs.len() - 1;
        let (get_op, set_op, slot) = if let Some(local) = self.resolve_local(level, name) {
            (Op::AccessLocal, Op::AssignLocal, local as u16)
        } else if let Some(up) = self.resolve_upvalue(level, name) {
            (Op::AccessUpvalue, Op::AssignUpvalue, up as u16)
        } else {
            let global = self.identifier_constant(name);
            (Op::AccessGlobal, Op::AssignGlobal, global)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_u16(slot);
        } else {
            self.emit_op(get_op);
            self.emit_u16(slot);
        }
    }

    // ---- declarations / statements ---------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Native) {
            self.native_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("expected variable name");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Null);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected function name");
        let name = self.previous.lexeme.to_string();
        self.declare_local(&name);
        if self.func().scope_depth > 0 {
            self.mark_initialized();
        }
        let global = self.identifier_constant(&name);
        self.function(FnKind::Function, &name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FnKind, name: &str) {
        self.funcs.push(FuncState::new(kind, Some(name.to_string())));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.func().arity == u8::MAX {
                    self.error("a function may not have more than 255 parameters");
                }
                self.func().arity += 1;
                let param = self.parse_variable("expected parameter name");
                self.define_variable(param);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();

        self.emit_op(Op::Null);
        self.emit_op(Op::Return);

        let compiled = self.funcs.pop().unwrap();
        let upvalue_count = compiled.upvalues.len() as u8;
        let func_const = ConstValue::Function(Box::new(feline_core::chunk::FunctionConst {
            arity: compiled.arity,
            upvalue_count,
            name: compiled.name,
            chunk: compiled.chunk,
        }));
        let const_ix = self.emit_const(func_const);
        self.emit_op(Op::Closure);
        self.emit_u16(const_ix);
        // The VM reads `upvalue_count` `(is_local: u8, index: u16)` triples
        // directly out of this byte run when instantiating the closure.
        self.emit_u16(upvalue_count as u16);
        for uv in &compiled.upvalues {
            self.emit_u8(uv.is_local as u8);
            self.emit_u16(uv.index as u16);
        }
    }

    /// `nativeDecl := "native" IDENT "(" params? ")" ";"` at top level —
    /// resolves `feline_<name>` in the module's sibling dynamic library at
    /// runtime (`Op::Native`) and binds it like any other function.
    fn native_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected native function name");
        let name = self.previous.lexeme.to_string();
        self.declare_local(&name);
        if self.func().scope_depth > 0 {
            self.mark_initialized();
        }
        let global =
            if self.func().scope_depth == 0 { self.identifier_constant(&name) } else { 0 };
        let name_const = self.identifier_constant(&name);
        let arity = self.native_param_count();
        self.consume(TokenKind::Semicolon, "expected ';' after native declaration");
        self.emit_op(Op::Native);
        self.emit_u16(name_const);
        self.emit_u8(arity);
        self.define_variable(global);
    }

    /// Parses `"(" params? ")"` for a native declaration, counting arity
    /// only — the body lives in a dynamic library, not in bytecode, so
    /// parameter names don't become locals.
    fn native_param_count(&mut self) -> u8 {
        self.consume(TokenKind::LeftParen, "expected '(' after native name");
        let mut arity: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "expected parameter name");
                if arity == u8::MAX {
                    self.error("a native function may not have more than 255 parameters");
                }
                arity += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        arity
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        self.declare_local(&name);
        self.emit_op(Op::Class);
        self.emit_u16(name_const);
        self.define_variable(name_const);

        let mut has_superclass = false;
        if self.matches(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let super_name = self.previous.lexeme.to_string();
            if super_name == name {
                self.error("a class cannot inherit from itself");
            }
            self.named_variable(&super_name, false);

            self.begin_scope();
            self.declare_local("super");
            self.mark_initialized();

            self.named_variable(&name, false);
            self.emit_op(Op::Inherit);
            has_superclass = true;
        }

        self.classes.push(ClassState { has_superclass });
        self.named_variable(&name, false);

        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(Op::Pop); // discard the class value left by named_variable

        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        if self.matches(TokenKind::Native) {
            self.native_method();
            return;
        }
        self.consume(TokenKind::Identifier, "expected method name");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        let kind = if name == "new" { FnKind::Constructor } else { FnKind::Method };
        self.function(kind, &name);
        self.emit_op(Op::Method);
        self.emit_u16(name_const);
    }

    /// `("native" IDENT "(" params? ")" ";")` inside a class body —
    /// `Op::ClassNative` resolves the symbol exactly like `Op::Native` but
    /// leaves the callable on the stack for the following `Op::Method`.
    fn native_method(&mut self) {
        self.consume(TokenKind::Identifier, "expected native method name");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        let arity = self.native_param_count();
        self.consume(TokenKind::Semicolon, "expected ';' after native method declaration");
        self.emit_op(Op::ClassNative);
        self.emit_u16(name_const);
        self.emit_u8(arity);
        self.emit_op(Op::Method);
        self.emit_u16(name_const);
    }

    fn block(&mut self) {
        self.begin_scope();
        self.block_body();
        self.end_scope();
    }

    fn block_body(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.block();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Throw) {
            self.throw_statement();
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::Import) {
            self.import_statement();
        } else if self.matches(TokenKind::Export) {
            self.export_statement();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(Op::JumpFalse);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.loops.push(LoopState {
            loop_start,
            scope_depth: self.func().scope_depth,
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(Op::JumpFalse);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        let loop_state = self.loops.pop().unwrap();
        for jump in loop_state.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(Op::JumpFalse));
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.loops.push(LoopState {
            loop_start,
            scope_depth: self.func().scope_depth,
            break_jumps: Vec::new(),
        });
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
        }
        let loop_state = self.loops.pop().unwrap();
        for jump in loop_state.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.loops.is_empty() {
            self.error("'break' outside of a loop");
        } else {
            self.pop_locals_above(self.loops.last().unwrap().scope_depth);
            let jump = self.emit_jump(Op::Jump);
            self.loops.last_mut().unwrap().break_jumps.push(jump);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after 'break'");
    }

    fn continue_statement(&mut self) {
        if self.loops.is_empty() {
            self.error("'continue' outside of a loop");
        } else {
            let target = self.loops.last().unwrap().loop_start;
            let depth = self.loops.last().unwrap().scope_depth;
            self.pop_locals_above(depth);
            self.emit_loop(target);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after 'continue'");
    }

    fn pop_locals_above(&mut self, depth: i32) {
        let count = self.func().locals.iter().filter(|l| l.depth > depth).count();
        for _ in 0..count {
            self.emit_op(Op::Pop);
        }
    }

    fn return_statement(&mut self) {
        if self.func().kind == FnKind::Script {
            self.error("cannot return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_op(Op::Null);
            self.emit_op(Op::Return);
            return;
        }
        if self.func().kind == FnKind::Constructor {
            self.error("cannot return a value from a constructor");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after return value");
        self.emit_op(Op::Return);
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after thrown value");
        self.emit_op(Op::Throw);
    }

    /// `"try" block "catch" ("(" IDENT ")")? stmt ("finally" stmt)?` — catch
    /// is mandatory (only its binding name is optional); `finally`, if
    /// present, is ordinary code following the catch body and needs no jump
    /// target of its own (spec.md §4.4: "finally is syntactic sugar... does
    /// not run on exceptional exit").
    fn try_statement(&mut self) {
        let try_begin = self.emit_jump(Op::TryBegin);

        self.consume(TokenKind::LeftBrace, "expected '{' after 'try'");
        self.block();
        self.emit_op(Op::TryEnd);
        let jump_over_catch = self.emit_jump(Op::Jump);

        self.patch_jump(try_begin);
        self.consume(TokenKind::Catch, "expected 'catch' after 'try' block");
        self.begin_scope();
        if self.matches(TokenKind::LeftParen) {
            self.consume(TokenKind::Identifier, "expected exception binding name");
            let binding = self.previous.lexeme.to_string();
            self.consume(TokenKind::RightParen, "expected ')' after catch binding");
            self.emit_op(Op::BoundException);
            self.declare_local(&binding);
            self.mark_initialized();
        } else {
            self.emit_op(Op::BoundException);
            self.emit_op(Op::Pop);
        }
        self.statement();
        self.end_scope();
        self.patch_jump(jump_over_catch);

        if self.matches(TokenKind::Finally) {
            self.statement();
        }
    }

    /// `import` takes a dotted module path (`import a.b.c as name;`), not a
    /// string literal — matches spec.md's `importDecl` grammar. The path is
    /// joined with `/` and resolved against the importing module's own
    /// directory by the VM (`Op::Import`'s operand is that joined string).
    fn import_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expected a module path");
        let mut segments = vec![self.previous.lexeme.to_string()];
        while self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected a module path segment after '.'");
            segments.push(self.previous.lexeme.to_string());
        }
        let binding = if self.matches(TokenKind::As) {
            self.consume(TokenKind::Identifier, "expected a binding name after 'as'");
            self.previous.lexeme.to_string()
        } else {
            segments.last().cloned().unwrap()
        };
        let path = format!("{}.fn", segments.join("/"));
        let path_const = self.emit_const(ConstValue::Str(path));

        self.declare_local(&binding);
        let global =
            if self.func().scope_depth == 0 { self.identifier_constant(&binding) } else { 0 };

        self.emit_op(Op::Import);
        self.emit_u16(path_const);
        self.consume(TokenKind::Semicolon, "expected ';' after import");
        self.define_variable(global);
    }

    /// `export` takes an arbitrary expression, not just a bare name
    /// (`export expr as name;`), so the exported value need not already be
    /// a variable.
    fn export_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::As, "expected 'as' after export expression");
        self.consume(TokenKind::Identifier, "expected an export name after 'as'");
        let name_const = self.identifier_constant(self.previous.lexeme);
        self.consume(TokenKind::Semicolon, "expected ';' after export");
        self.emit_op(Op::Export);
        self.emit_u16(name_const);
    }

    // ---- expressions -------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    fn parse_precedence(&mut self, prec: Prec) {
        self.advance();
        let can_assign = prec <= Prec::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("expected expression");
            return;
        }

        while prec <= infix_prec(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(kind),
            Number => self.number(),
            String => self.string(),
            True => {
                self.emit_op(Op::True);
            }
            False => {
                self.emit_op(Op::False);
            }
            Null => {
                self.emit_op(Op::Null);
            }
            Identifier => self.variable(can_assign),
            This => self.this_expr(),
            Super => self.super_expr(),
            LeftBracket => self.list_literal(),
            LeftBrace => self.object_literal(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | EqualEqual | BangEqual | Less | LessEqual | Greater
            | GreaterEqual => self.binary(kind),
            AmpAmp => self.and_expr(),
            PipePipe => self.or_expr(),
            LeftParen => self.call_expr(),
            Dot => self.dot_expr(can_assign),
            LeftBracket => self.subscript_expr(can_assign),
            InstanceOf => self.instanceof_expr(),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, op_kind: TokenKind) {
        self.parse_precedence(Prec::Unary);
        match op_kind {
            TokenKind::Minus => {
                self.emit_op(Op::Negate);
            }
            TokenKind::Bang => {
                self.emit_op(Op::Not);
            }
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, op_kind: TokenKind) {
        let prec = infix_prec(op_kind);
        self.parse_precedence(prec.next());
        let op = match op_kind {
            TokenKind::Plus => Op::Add,
            TokenKind::Minus => Op::Subtract,
            TokenKind::Star => Op::Multiply,
            TokenKind::Slash => Op::Divide,
            TokenKind::EqualEqual => Op::Equal,
            TokenKind::BangEqual => Op::NotEqual,
            TokenKind::Less => Op::Less,
            TokenKind::LessEqual => Op::LessEqual,
            TokenKind::Greater => Op::Greater,
            TokenKind::GreaterEqual => Op::GreaterEqual,
            _ => unreachable!(),
        };
        self.emit_op(op);
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(Op::JumpFalseShortCircuit);
        self.emit_op(Op::Pop);
        self.parse_precedence(Prec::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let end_jump = self.emit_jump(Op::JumpTrueShortCircuit);
        self.emit_op(Op::Pop);
        self.parse_precedence(Prec::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(ConstValue::Number(value));
    }

    fn string(&mut self) {
        let value = unescape(self.previous.lexeme);
        self.emit_constant(ConstValue::Str(value));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("'this' may only be used inside a method");
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("'super' may only be used inside a method");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("cannot use 'super' in a class with no superclass");
        }
        self.consume(TokenKind::Dot, "expected '.' after 'super'");
        self.consume(TokenKind::Identifier, "expected superclass method name");
        let name_const = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(Op::SuperInvoke);
            self.emit_u16(name_const);
            self.emit_u8(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op(Op::AccessSuper);
            self.emit_u16(name_const);
        }
    }

    fn call_expr(&mut self) {
        let argc = self.argument_list();
        self.emit_op(Op::Call);
        self.emit_u8(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error("a call may not have more than 255 arguments");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        argc
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name_const = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(Op::AssignProperty);
            self.emit_u16(name_const);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(Op::Invoke);
            self.emit_u16(name_const);
            self.emit_u8(argc);
        } else {
            self.emit_op(Op::AccessProperty);
            self.emit_u16(name_const);
        }
    }

    fn subscript_expr(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after subscript index");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(Op::AssignSubscript);
        } else {
            self.emit_op(Op::AccessSubscript);
        }
    }

    fn instanceof_expr(&mut self) {
        self.parse_precedence(Prec::Comparison.next());
        self.emit_op(Op::InstanceOf);
    }

    fn list_literal(&mut self) {
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
        self.consume(TokenKind::RightBracket, "expected ']' after list elements");
        self.emit_op(Op::List);
        self.emit_u16(count);
    }

    fn object_literal(&mut self) {
        self.emit_op(Op::Object);
        if !self.check(TokenKind::RightBrace) {
            loop {
                if self.check(TokenKind::RightBrace) {
                    break;
                }
                let key = if self.matches(TokenKind::String) {
                    unescape(self.previous.lexeme)
                } else {
                    self.consume(TokenKind::Identifier, "expected object key");
                    self.previous.lexeme.to_string()
                };
                let key_const = self.identifier_constant(&key);
                self.consume(TokenKind::Colon, "expected ':' after object key");
                self.expression();
                self.emit_op(Op::AssignPropertyKv);
                self.emit_u16(key_const);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after object literal");
        self.emit_op(Op::CreateObject);
    }
}

fn infix_prec(kind: TokenKind) -> Prec {
    use TokenKind::*;
    match kind {
        PipePipe => Prec::Or,
        AmpAmp => Prec::And,
        EqualEqual | BangEqual => Prec::Equality,
        Less | LessEqual | Greater | GreaterEqual | InstanceOf => Prec::Comparison,
        Plus | Minus => Prec::Term,
        Star | Slash => Prec::Factor,
        LeftParen | Dot | LeftBracket => Prec::Call,
        _ => Prec::None,
    }
}

/// Expand the escape sequences validated (but not interpreted) by the
/// lexer. The input slice still has its surrounding quotes.
fn unescape(lexeme: &str) -> String {
    let inner = &lexeme[1..lexeme.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\u{b}'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
