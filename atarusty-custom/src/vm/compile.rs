/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Compiles script functions to VM instructions.
use core::fmt;
use std::collections::HashMap;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use super::ast::*;
use super::bytecode::*;
use super::thread::{ThreadId, FIRST_USER_THREAD};

/// The `sio_frame` segment, the transfer buffer of the current SIO command.
pub const SIO_FRAME: ObjectRef = ObjectRef::new(ClassId::Segment, u32::MAX);

const MAX_PARAMS: usize = 16;
const MAX_LOCALS: usize = 1024;

/// A compile error at a source location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileError {
    pub loc: Loc,
    pub message: String,
}

impl CompileError {
    pub fn new<S: Into<String>>(loc: Loc, message: S) -> Self {
        CompileError { loc, message: message.into() }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CompileError {}

type Result<T> = core::result::Result<T, CompileError>;

/// A named item in the global scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol {
    Global(u32),
    Object(ObjectRef),
    Function(FunctionId),
}

/// Objects that every configuration can reach without declaring them.
pub fn special_object(name: &str) -> Option<ObjectRef> {
    let class = match name {
        "network" => ClassId::Network,
        "sio" => ClassId::Sio,
        "sio_frame" => return Some(SIO_FRAME),
        "clock" => ClassId::Clock,
        "debug" => ClassId::Debug,
        "emulator" => ClassId::Emulator,
        _ => return None
    };
    Some(ObjectRef::new(class, 0))
}

fn is_reserved(name: &str) -> bool {
    name == "thread"
        || special_object(name).is_some()
        || SpecialVar::from_name(name).is_some()
        || ThreadVar::from_name(name).is_some()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Type {
    Void,
    Int,
    Str,
    Func(FunctionId),
    Object(ClassId),
}

/// Builds a [Program] from declarations, one at a time in source order.
#[derive(Debug, Default)]
pub struct Compiler {
    program: Program,
    symbols: HashMap<String, Symbol>,
    allow_unsafe: bool,
}

impl Compiler {
    pub fn new(allow_unsafe: bool) -> Self {
        Compiler { allow_unsafe, ..Default::default() }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.program.function(id)
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    fn define(&mut self, loc: Loc, name: &str, symbol: Symbol) -> Result<()> {
        if is_reserved(name) {
            return Err(CompileError::new(loc, format!("'{}' is a reserved name", name)))
        }
        if self.symbols.contains_key(name) {
            return Err(CompileError::new(loc, format!("'{}' is already defined", name)))
        }
        self.symbols.insert(name.to_string(), symbol);
        Ok(())
    }
    /// Makes an object reachable by name.
    pub fn declare_object(&mut self, loc: Loc, name: &str, object: ObjectRef) -> Result<()> {
        self.define(loc, name, Symbol::Object(object))
    }
    /// Declares a script thread and returns its object.
    pub fn declare_thread(&mut self, loc: Loc, name: &str) -> Result<ObjectRef> {
        let id: ThreadId = FIRST_USER_THREAD + self.program.threads.len() as ThreadId;
        let object = ObjectRef::new(ClassId::Thread, id);
        self.define(loc, name, Symbol::Object(object))?;
        self.program.threads.push(name.to_string());
        Ok(object)
    }
    /// Declares a global integer with a constant initializer.
    pub fn declare_int(&mut self, loc: Loc, name: &str, init: Option<&Expr>) -> Result<u32> {
        let value = match init {
            Some(expr) => self.eval_constant(expr)?,
            None => 0
        };
        let index = self.program.globals.len() as u32;
        self.define(loc, name, Symbol::Global(index))?;
        self.program.globals.push(value);
        Ok(index)
    }
    /// Evaluates a constant expression, which may refer to previously declared integers.
    pub fn eval_constant(&self, expr: &Expr) -> Result<i32> {
        Ok(match &expr.kind {
            ExprKind::Int(v) => *v,
            ExprKind::Unary(op, e) => {
                let v = self.eval_constant(e)?;
                match op {
                    UnaryOp::Neg => v.wrapping_neg(),
                    UnaryOp::Not => (v == 0) as i32,
                    UnaryOp::BitNot => !v,
                }
            }
            ExprKind::Binary(op, a, b) => op.apply(self.eval_constant(a)?, self.eval_constant(b)?),
            ExprKind::Logic(op, a, b) => {
                let a = self.eval_constant(a)? != 0;
                let b = self.eval_constant(b)? != 0;
                match op {
                    LogicOp::And => (a && b) as i32,
                    LogicOp::Or => (a || b) as i32,
                }
            }
            ExprKind::Ident(name) => match self.lookup(name) {
                Some(Symbol::Global(index)) => self.program.globals[index as usize],
                _ => return Err(CompileError::new(expr.loc,
                            format!("'{}' is not a constant", name)))
            }
            _ => return Err(CompileError::new(expr.loc, "Expected a constant expression"))
        })
    }
    /// Compiles a named function and makes it reachable by name.
    pub fn declare_function(&mut self, def: &FunctionDef) -> Result<FunctionId> {
        let name = def.name.clone().unwrap_or_default();
        let id = self.program.functions.len() as FunctionId;
        self.define(def.loc, &name, Symbol::Function(id))?;
        self.compile_function(def, name, def.returns_int.unwrap_or(false))
    }
    /// Compiles an anonymous function that must be able to run in `context`.
    ///
    /// Whether it returns a value is inferred from its return statements.
    pub fn compile_fragment(&mut self, def: &FunctionDef, name: &str, context: CallContext) -> Result<FunctionId> {
        let returns_int = def.returns_int.unwrap_or_else(|| def.body.iter().any(Stmt::returns_value));
        let id = self.compile_function(def, name.to_string(), returns_int)?;
        self.check_context(def.loc, id, context)?;
        Ok(id)
    }
    /// Fails if the function may suspend where it is not allowed to.
    pub fn check_context(&self, loc: Loc, id: FunctionId, context: CallContext) -> Result<()> {
        match self.function(id) {
            Some(f) if f.params != 0 => Err(CompileError::new(loc,
                format!("Function '{}' must not take parameters here", f.name))),
            Some(f) if !f.runs_in(context) => Err(CompileError::new(loc,
                format!("Function '{}' may suspend where suspending is not allowed", f.name))),
            Some(_) => Ok(()),
            None => Err(CompileError::new(loc, "Unknown function"))
        }
    }

    fn compile_function(&mut self, def: &FunctionDef, name: String, returns_int: bool) -> Result<FunctionId> {
        if def.params.len() > MAX_PARAMS {
            return Err(CompileError::new(def.loc, "Too many parameters"))
        }
        let id = self.program.functions.len() as FunctionId;
        // the placeholder makes recursive calls resolvable
        self.program.functions.push(Function {
            name,
            params: def.params.len() as u8,
            locals: def.params.len() as u16,
            returns_int,
            is_async: false,
            async_contexts: MethodFlags::ASYNC_ALL,
            code: Vec::new(),
        });
        let mut fc = FunctionCompiler {
            compiler: self,
            code: Vec::new(),
            scopes: vec![Vec::new()],
            locals: 0,
            max_locals: 0,
            returns_int,
            is_async: false,
            contexts: MethodFlags::ASYNC_ALL,
            loops: Vec::new(),
        };
        for param in def.params.iter() {
            fc.add_local(def.loc, param)?;
        }
        let result = fc.block(&def.body);
        let FunctionCompiler { code, max_locals, is_async, contexts, .. } = fc;
        if let Err(e) = result {
            self.program.functions.pop();
            return Err(e)
        }
        let mut code = code;
        if returns_int {
            code.push(Op::Int(0));
            code.push(Op::ReturnInt);
        }
        else {
            code.push(Op::Return);
        }
        let function = &mut self.program.functions[id as usize];
        function.locals = max_locals;
        function.is_async = is_async;
        function.async_contexts = contexts;
        function.code = code;
        debug!("compiled {}: {} ops, async: {}", function.name, function.code.len(), is_async);
        Ok(id)
    }

    pub fn finish(self) -> Program {
        self.program
    }
}

struct LoopLabels {
    continue_target: u32,
    breaks: Vec<usize>,
}

struct FunctionCompiler<'c> {
    compiler: &'c mut Compiler,
    code: Vec<Op>,
    scopes: Vec<Vec<(String, u16)>>,
    locals: u16,
    max_locals: u16,
    returns_int: bool,
    is_async: bool,
    contexts: MethodFlags,
    loops: Vec<LoopLabels>,
}

impl FunctionCompiler<'_> {
    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    fn patch(&mut self, at: usize) {
        let target = self.here();
        match &mut self.code[at] {
            Op::Jump(t)|Op::JumpIfFalse(t) => *t = target,
            _ => {}
        }
    }

    fn local(&self, name: &str) -> Option<u16> {
        self.scopes.iter().rev()
            .find_map(|scope| scope.iter().rev().find(|(n, _)| n == name).map(|&(_, slot)| slot))
    }

    fn add_local(&mut self, loc: Loc, name: &str) -> Result<u16> {
        if is_reserved(name) {
            return Err(CompileError::new(loc, format!("'{}' is a reserved name", name)))
        }
        if self.locals as usize >= MAX_LOCALS {
            return Err(CompileError::new(loc, "Too many local variables"))
        }
        let slot = self.locals;
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => return Err(CompileError::new(loc, "Variable declared outside of a function"))
        };
        if scope.iter().any(|(n, _)| n == name) {
            return Err(CompileError::new(loc, format!("'{}' is already defined", name)))
        }
        scope.push((name.to_string(), slot));
        self.locals += 1;
        self.max_locals = self.max_locals.max(self.locals);
        Ok(slot)
    }

    fn scoped_block(&mut self, stmts: &[Stmt]) -> Result<()> {
        self.scopes.push(Vec::new());
        let saved = self.locals;
        let result = self.block(stmts);
        self.scopes.pop();
        self.locals = saved;
        result
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<()> {
        stmts.iter().try_for_each(|stmt| self.statement(stmt))
    }

    fn note_async(&mut self, loc: Loc, flags: MethodFlags, what: &str) -> Result<()> {
        let flags = flags & MethodFlags::ASYNC_ALL;
        if flags.is_empty() {
            return Ok(())
        }
        let contexts = self.contexts & flags;
        if contexts.is_empty() {
            return Err(CompileError::new(loc,
                format!("'{}' suspends in a way that conflicts with other calls in this function", what)))
        }
        self.is_async = true;
        self.contexts = contexts;
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<()> {
        let loc = stmt.loc;
        match &stmt.kind {
            StmtKind::Local { name, init } => {
                match init {
                    Some(e) => self.int_expr(e)?,
                    None => { self.emit(Op::Int(0)); }
                }
                let slot = self.add_local(loc, name)?;
                self.emit(Op::StoreLocal(slot));
            }
            StmtKind::Assign { target, op, value } => {
                let (load, store) = self.assign_target(loc, target)?;
                if let AssignOp::Update(bop) = op {
                    self.emit(load);
                    self.int_expr(value)?;
                    self.emit(Op::Binary(*bop));
                }
                else {
                    self.int_expr(value)?;
                }
                self.emit(store);
            }
            StmtKind::If { cond, then, otherwise } => {
                self.int_expr(cond)?;
                let skip_then = self.emit(Op::JumpIfFalse(0));
                self.scoped_block(then)?;
                if otherwise.is_empty() {
                    self.patch(skip_then);
                }
                else {
                    let skip_else = self.emit(Op::Jump(0));
                    self.patch(skip_then);
                    self.scoped_block(otherwise)?;
                    self.patch(skip_else);
                }
            }
            StmtKind::While { cond, body } => {
                let start = self.here();
                self.int_expr(cond)?;
                let exit = self.emit(Op::JumpIfFalse(0));
                self.loop_body(start, body)?;
                self.patch(exit);
            }
            StmtKind::Loop(body) => {
                let start = self.here();
                self.loop_body(start, body)?;
            }
            StmtKind::Break => {
                if self.loops.is_empty() {
                    return Err(CompileError::new(loc, "'break' outside of a loop"))
                }
                let at = self.emit(Op::Jump(0));
                if let Some(labels) = self.loops.last_mut() {
                    labels.breaks.push(at);
                }
            }
            StmtKind::Continue => {
                let target = match self.loops.last() {
                    Some(labels) => labels.continue_target,
                    None => return Err(CompileError::new(loc, "'continue' outside of a loop"))
                };
                self.emit(Op::Jump(target));
            }
            StmtKind::Return(Some(e)) => {
                if !self.returns_int {
                    return Err(CompileError::new(loc, "Function does not return a value"))
                }
                self.int_expr(e)?;
                self.emit(Op::ReturnInt);
            }
            StmtKind::Return(None) => {
                if self.returns_int {
                    return Err(CompileError::new(loc, "Function must return a value"))
                }
                self.emit(Op::Return);
            }
            StmtKind::Block(stmts) => self.scoped_block(stmts)?,
            StmtKind::Expr(e) => {
                if self.expr(e)? != Type::Void {
                    self.emit(Op::Pop);
                }
            }
        }
        Ok(())
    }

    fn loop_body(&mut self, start: u32, body: &[Stmt]) -> Result<()> {
        self.loops.push(LoopLabels { continue_target: start, breaks: Vec::new() });
        let result = self.scoped_block(body);
        self.emit(Op::Jump(start));
        if let Some(labels) = self.loops.pop() {
            for at in labels.breaks {
                self.patch(at);
            }
        }
        result
    }

    fn assign_target(&self, loc: Loc, name: &str) -> Result<(Op, Op)> {
        if let Some(slot) = self.local(name) {
            return Ok((Op::LoadLocal(slot), Op::StoreLocal(slot)))
        }
        if let Some(var) = SpecialVar::from_name(name) {
            return Ok((Op::LoadSpecial(var), Op::StoreSpecial(var)))
        }
        if let Some(var) = ThreadVar::from_name(name) {
            return Ok((Op::LoadThreadVar(var), Op::StoreThreadVar(var)))
        }
        match self.compiler.lookup(name) {
            Some(Symbol::Global(index)) => Ok((Op::LoadGlobal(index), Op::StoreGlobal(index))),
            Some(_) => Err(CompileError::new(loc, format!("Cannot assign to '{}'", name))),
            None => Err(CompileError::new(loc, format!("Unknown variable '{}'", name)))
        }
    }

    fn int_expr(&mut self, e: &Expr) -> Result<()> {
        match self.expr(e)? {
            Type::Int => Ok(()),
            Type::Void => Err(CompileError::new(e.loc, "Expression does not produce a value")),
            _ => Err(CompileError::new(e.loc, "Expected an integer expression"))
        }
    }

    fn expr(&mut self, e: &Expr) -> Result<Type> {
        let loc = e.loc;
        Ok(match &e.kind {
            ExprKind::Int(v) => {
                self.emit(Op::Int(*v));
                Type::Int
            }
            ExprKind::Str(s) => {
                let id = self.compiler.program.add_string(s);
                self.emit(Op::Str(id));
                Type::Str
            }
            ExprKind::Ident(name) => self.ident(loc, name)?,
            ExprKind::Unary(op, operand) => {
                self.int_expr(operand)?;
                self.emit(match op {
                    UnaryOp::Neg => Op::Neg,
                    UnaryOp::Not => Op::Not,
                    UnaryOp::BitNot => Op::BitNot,
                });
                Type::Int
            }
            ExprKind::Binary(op, a, b) => {
                self.int_expr(a)?;
                self.int_expr(b)?;
                self.emit(Op::Binary(*op));
                Type::Int
            }
            ExprKind::Logic(op, a, b) => {
                // a && b: both must be true; a || b: one must be true
                self.int_expr(a)?;
                if *op == LogicOp::Or {
                    self.emit(Op::Not);
                }
                let first = self.emit(Op::JumpIfFalse(0));
                self.int_expr(b)?;
                if *op == LogicOp::Or {
                    self.emit(Op::Not);
                }
                let second = self.emit(Op::JumpIfFalse(0));
                self.emit(Op::Int((*op == LogicOp::And) as i32));
                let end = self.emit(Op::Jump(0));
                self.patch(first);
                self.patch(second);
                self.emit(Op::Int((*op == LogicOp::Or) as i32));
                self.patch(end);
                Type::Int
            }
            ExprKind::Call { name, args } => self.call(loc, name, args)?,
            ExprKind::MethodCall { object, method, args } => self.method_call(loc, object, method, args)?,
        })
    }

    fn ident(&mut self, loc: Loc, name: &str) -> Result<Type> {
        if let Some(slot) = self.local(name) {
            self.emit(Op::LoadLocal(slot));
            return Ok(Type::Int)
        }
        if let Some(var) = SpecialVar::from_name(name) {
            self.emit(Op::LoadSpecial(var));
            return Ok(Type::Int)
        }
        if let Some(var) = ThreadVar::from_name(name) {
            self.emit(Op::LoadThreadVar(var));
            return Ok(Type::Int)
        }
        if name == "thread" {
            self.emit(Op::CurrentThread);
            return Ok(Type::Object(ClassId::Thread))
        }
        if let Some(object) = special_object(name) {
            self.emit(Op::Object(object));
            return Ok(Type::Object(object.class))
        }
        match self.compiler.lookup(name) {
            Some(Symbol::Global(index)) => {
                self.emit(Op::LoadGlobal(index));
                Ok(Type::Int)
            }
            Some(Symbol::Object(object)) => {
                self.emit(Op::Object(object));
                Ok(Type::Object(object.class))
            }
            Some(Symbol::Function(id)) => {
                self.emit(Op::Function(id));
                Ok(Type::Func(id))
            }
            None => Err(CompileError::new(loc, format!("Unknown identifier '{}'", name)))
        }
    }

    fn call(&mut self, loc: Loc, name: &str, args: &[Expr]) -> Result<Type> {
        let id = match self.compiler.lookup(name) {
            Some(Symbol::Function(id)) => id,
            Some(_) => return Err(CompileError::new(loc, format!("'{}' is not a function", name))),
            None => return Err(CompileError::new(loc, format!("Unknown function '{}'", name)))
        };
        let (params, returns_int, is_async, contexts) = match self.compiler.function(id) {
            Some(f) => (f.params as usize, f.returns_int, f.is_async, f.async_contexts),
            None => return Err(CompileError::new(loc, format!("Unknown function '{}'", name)))
        };
        if args.len() != params {
            return Err(CompileError::new(loc,
                format!("'{}' expects {} argument(s), got {}", name, params, args.len())))
        }
        for arg in args {
            self.int_expr(arg)?;
        }
        if is_async {
            self.note_async(loc, contexts, name)?;
        }
        self.emit(Op::Call { function: id, argc: params as u8 });
        Ok(if returns_int { Type::Int } else { Type::Void })
    }

    fn method_call(&mut self, loc: Loc, object: &Expr, method: &str, args: &[Expr]) -> Result<Type> {
        let class = match self.expr(object)? {
            Type::Object(class) => class,
            _ => return Err(CompileError::new(object.loc, "Expected an object"))
        };
        let (index, desc) = class.find_method(method).ok_or_else(|| CompileError::new(loc,
                                format!("Class '{}' has no method '{}'", class, method)))?;
        if args.len() != desc.args.len() {
            return Err(CompileError::new(loc, format!("'{}.{}' expects {} argument(s), got {}",
                                            class, method, desc.args.len(), args.len())))
        }
        if desc.flags.contains(MethodFlags::UNSAFE) && !self.compiler.allow_unsafe {
            return Err(CompileError::new(loc,
                format!("'{}.{}' requires unsafe operations to be enabled", class, method)))
        }
        for (arg, ty) in args.iter().zip(desc.args.iter()) {
            match ty {
                ArgType::Int => self.int_expr(arg)?,
                ArgType::Str => match &arg.kind {
                    ExprKind::Str(s) => {
                        let id = self.compiler.program.add_string(s);
                        self.emit(Op::Str(id));
                    }
                    _ => return Err(CompileError::new(arg.loc, "Expected a string literal"))
                }
                ArgType::Func => match self.expr(arg)? {
                    Type::Func(id) => self.compiler.check_context(arg.loc, id, CallContext::Thread)?,
                    _ => return Err(CompileError::new(arg.loc, "Expected a function"))
                }
                ArgType::Object(expected) => match self.expr(arg)? {
                    Type::Object(class) if class == *expected => {}
                    _ => return Err(CompileError::new(arg.loc, format!("Expected a {} object", expected)))
                }
            }
        }
        let what = format!("{}.{}", class, method);
        self.note_async(loc, desc.flags, &what)?;
        self.emit(Op::CallMethod { class, method: index, argc: args.len() as u8 });
        Ok(if desc.returns_int { Type::Int } else { Type::Void })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::parse::parse;

    fn compile(src: &str, allow_unsafe: bool) -> Result<Compiler> {
        let mut compiler = Compiler::new(allow_unsafe);
        for decl in parse(src).unwrap() {
            match decl {
                Decl::Int { loc, name, init } => { compiler.declare_int(loc, &name, init.as_ref())?; }
                Decl::Function(def) => { compiler.declare_function(&def)?; }
                Decl::Object { loc, class, name, .. } if class == "Thread" => {
                    compiler.declare_thread(loc, &name)?;
                }
                Decl::Object { loc, class, name, .. } => {
                    let class = ClassId::from_name(&class).unwrap();
                    compiler.declare_object(loc, &name, ObjectRef::new(class, 0))?;
                }
                Decl::Event { loc, handler, .. } => match handler.kind {
                    DataKind::Function(def) => { compiler.compile_fragment(&def, "event", CallContext::Thread)?; }
                    _ => return Err(CompileError::new(loc, "bad handler"))
                }
                _ => {}
            }
        }
        Ok(compiler)
    }

    fn error_of(src: &str) -> String {
        compile(src, false).unwrap_err().message
    }

    #[test]
    fn constants_fold() {
        let c = compile("int a = 2 + 3 * 4; int b = a << 1; int c = -a || 0; int d;", false).unwrap();
        assert_eq!(c.program().globals, [14, 28, 1, 0]);
        assert_eq!(error_of("int a = f();"), "Expected a constant expression");
    }

    #[test]
    fn functions_compile() {
        let c = compile(r#"
            int total;
            function add(int a, int b): int { int s = a + b; return s; }
            function run() {
                int i = 0;
                while (i < 10) { i += 1; if (i == 5) continue; total = add(total, i); }
            }
        "#, false).unwrap();
        let add = c.function(0).unwrap();
        assert_eq!((add.params, add.locals, add.returns_int, add.is_async), (2, 3, true, false));
        let run = c.function(1).unwrap();
        assert!(!run.returns_int);
        assert!(run.code.contains(&Op::Call { function: 0, argc: 2 }));
        assert_eq!(run.code.last(), Some(&Op::Return));
    }

    #[test]
    fn async_contexts_are_tracked() {
        let c = compile(r#"
            function a() { thread.sleep(10); }
            function b() { a(); sio.send_frame(sio_frame, 0, 4); }
            function r(): int { return sio.recv_raw_byte(); }
        "#, false).unwrap();
        let a = c.function(0).unwrap();
        assert!(a.is_async);
        assert_eq!(a.async_contexts, MethodFlags::ASYNC_ALL);
        let b = c.function(1).unwrap();
        assert_eq!(b.async_contexts, MethodFlags::ASYNC_SIO);
        assert!(b.runs_in(CallContext::Sio));
        assert!(!b.runs_in(CallContext::Thread));
        assert!(c.function(2).unwrap().runs_in(CallContext::Thread));

        assert!(error_of("function f() { sio.delay(5); sio.wait_command(); }")
            .contains("conflicts"));
        assert!(error_of("function f() { sio.delay(5); } Thread t; function g() { t.run(f); }")
            .contains("suspending is not allowed"));
    }

    #[test]
    fn unsafe_methods_need_permission() {
        let src = r#"event "init": function { emulator.run_command("Cold reset"); };"#;
        assert!(error_of(src).contains("unsafe"));
        assert!(compile(src, true).is_ok());
    }

    #[test]
    fn errors_are_reported() {
        assert_eq!(error_of("function f() { x = 1; }"), "Unknown variable 'x'");
        assert_eq!(error_of("function f() { return 1; }"), "Function does not return a value");
        assert_eq!(error_of("function f(): int { return; }"), "Function must return a value");
        assert_eq!(error_of("function f() { break; }"), "'break' outside of a loop");
        assert_eq!(error_of("int a; int a;"), "'a' is already defined");
        assert_eq!(error_of("int sio;"), "'sio' is a reserved name");
        assert_eq!(error_of("function f() { debug.log(1); }"), "Expected a string literal");
        assert_eq!(error_of("function f() { sio.bogus(); }"), "Class 'SIO' has no method 'bogus'");
        assert_eq!(error_of("function f() { int a = sio.ack(); }"), "Expression does not produce a value");
        assert_eq!(error_of("Image img; function f() { img.blt(0, 0, sio_frame, 0, 0, 1, 1); }"),
                   "Expected a Image object");
    }
}
