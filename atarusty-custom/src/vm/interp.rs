/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The bytecode interpreter.
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::Ticks;

use super::bytecode::*;
use super::thread::{ThreadId, Wait};
use super::{Vm, VmError};

/// The maximum depth of script function calls.
pub const MAX_CALL_DEPTH: usize = 256;

/// A value on the VM stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    /// An index into [Program::strings].
    Str(u32),
    Obj(ObjectRef),
    Func(FunctionId),
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl Value {
    pub fn as_int(self) -> i32 {
        match self {
            Value::Int(v) => v,
            _ => 0
        }
    }

    pub fn as_object(self) -> Option<ObjectRef> {
        match self {
            Value::Obj(o) => Some(o),
            _ => None
        }
    }

    pub fn as_str_id(self) -> Option<u32> {
        match self {
            Value::Str(id) => Some(id),
            _ => None
        }
    }

    pub fn as_function(self) -> Option<FunctionId> {
        match self {
            Value::Func(f) => Some(f),
            _ => None
        }
    }
}

/// The host of a [Vm]: provides time and implements the methods of all classes but `Thread`.
pub trait Environment {
    fn now(&self) -> Ticks;
    /// Invokes a method of `object`.
    ///
    /// The method may suspend the active thread with [Vm::suspend_active] or one of its
    /// variants, in which case the returned value is ignored and the thread receives its
    /// resume value when it continues.
    fn call_method(&mut self, vm: &mut Vm, object: ObjectRef, method: u16, args: &[Value]) -> Result<i32, VmError>;
}

/// How a thread run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The thread function returned, with 0 from functions without a value.
    Returned(i32),
    Suspended,
    /// The thread was not started or got aborted.
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Frame {
    function: FunctionId,
    pc: u32,
    base: usize,
}

/// The execution state of a started thread.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exec {
    frames: Vec<Frame>,
    stack: Vec<Value>,
    /// Push the thread's resume value before continuing.
    push_resume: bool,
}

impl Exec {
    pub(crate) fn new(program: &Program, function: FunctionId, args: &[Value]) -> Result<Self, VmError> {
        let f = program.function(function).ok_or(VmError::InvalidFunction(function))?;
        if args.len() != f.params as usize {
            return Err(VmError::InvalidFunction(function))
        }
        let mut stack = Vec::with_capacity(16);
        stack.extend_from_slice(args);
        stack.resize(f.locals as usize, Value::Int(0));
        Ok(Exec {
            frames: vec![Frame { function, pc: 0, base: 0 }],
            stack,
            push_resume: false
        })
    }
}

enum Step {
    Returned(i32),
    Suspended,
    Aborted,
}

impl Vm {
    /// Runs a started thread until it returns or suspends.
    pub(super) fn execute(&mut self, tid: ThreadId, env: &mut dyn Environment) -> Result<Outcome, VmError> {
        if self.is_active(tid) {
            warn!("thread {} is already running", tid);
            return Ok(Outcome::Stopped)
        }
        let thread = self.thread_mut(tid)?;
        if thread.wait.is_some() {
            return Ok(Outcome::Suspended)
        }
        let mut exec = match thread.exec.take() {
            Some(exec) => exec,
            None => return Ok(Outcome::Stopped)
        };
        if exec.push_resume {
            exec.push_resume = false;
            exec.stack.push(Value::Int(thread.resume_int));
        }
        thread.aborted = false;
        let program = Rc::clone(&self.program);
        self.active.push(tid);
        let result = self.interpret(tid, &program, &mut exec, env);
        self.active.pop();

        let aborted = core::mem::replace(&mut self.thread_mut(tid)?.aborted, false);
        match result {
            Ok(_) if aborted => Ok(Outcome::Stopped),
            Ok(Step::Aborted) => Ok(Outcome::Stopped),
            Ok(Step::Suspended) => {
                self.thread_mut(tid)?.exec = Some(exec);
                Ok(Outcome::Suspended)
            }
            Ok(Step::Returned(value)) => {
                self.stop(tid);
                Ok(Outcome::Returned(value))
            }
            Err(e) => {
                error!("thread {} aborted: {}", tid, e);
                self.stop(tid);
                Err(e)
            }
        }
    }

    fn interpret(
            &mut self,
            tid: ThreadId,
            program: &Program,
            exec: &mut Exec,
            env: &mut dyn Environment
        ) -> Result<Step, VmError>
    {
        let mut budget = self.instruction_limit;
        loop {
            let (function, op, base) = {
                let frame = exec.frames.last_mut().ok_or(VmError::StackUnderflow)?;
                let function = program.function(frame.function)
                                      .ok_or(VmError::InvalidFunction(frame.function))?;
                let op = *function.code.get(frame.pc as usize).ok_or(VmError::InvalidJump)?;
                frame.pc += 1;
                (function, op, frame.base)
            };
            if budget == 0 {
                return Err(VmError::InstructionLimit(function.name.clone()))
            }
            budget -= 1;
            let stack = &mut exec.stack;
            match op {
                Op::Int(v) => stack.push(Value::Int(v)),
                Op::Str(id) => stack.push(Value::Str(id)),
                Op::Object(o) => stack.push(Value::Obj(o)),
                Op::Function(f) => stack.push(Value::Func(f)),
                Op::CurrentThread => stack.push(Value::Obj(ObjectRef::new(ClassId::Thread, tid))),
                Op::LoadLocal(slot) => {
                    let v = *stack.get(base + slot as usize).ok_or(VmError::InvalidVariable)?;
                    stack.push(v);
                }
                Op::StoreLocal(slot) => {
                    let v = pop(stack)?;
                    *stack.get_mut(base + slot as usize).ok_or(VmError::InvalidVariable)? = v;
                }
                Op::LoadGlobal(index) => {
                    let v = *self.globals.get(index as usize).ok_or(VmError::InvalidVariable)?;
                    stack.push(Value::Int(v));
                }
                Op::StoreGlobal(index) => {
                    let v = pop_int(stack)?;
                    *self.globals.get_mut(index as usize).ok_or(VmError::InvalidVariable)? = v;
                }
                Op::LoadSpecial(var) => stack.push(Value::Int(self.specials[var as usize])),
                Op::StoreSpecial(var) => self.specials[var as usize] = pop_int(stack)?,
                Op::LoadThreadVar(var) => {
                    let v = self.thread_mut(tid)?.vars[var as usize];
                    stack.push(Value::Int(v));
                }
                Op::StoreThreadVar(var) => {
                    let v = pop_int(stack)?;
                    self.thread_mut(tid)?.vars[var as usize] = v;
                }
                Op::Neg => {
                    let v = pop_int(stack)?;
                    stack.push(Value::Int(v.wrapping_neg()));
                }
                Op::Not => {
                    let v = pop_int(stack)?;
                    stack.push(Value::Int((v == 0) as i32));
                }
                Op::BitNot => {
                    let v = pop_int(stack)?;
                    stack.push(Value::Int(!v));
                }
                Op::Binary(bop) => {
                    let b = pop_int(stack)?;
                    let a = pop_int(stack)?;
                    stack.push(Value::Int(bop.apply(a, b)));
                }
                Op::Jump(target) => jump(exec, target)?,
                Op::JumpIfFalse(target) => {
                    if pop_int(stack)? == 0 {
                        jump(exec, target)?;
                    }
                }
                Op::Pop => { pop(stack)?; }
                Op::Call { function: callee, argc } => {
                    if exec.frames.len() >= MAX_CALL_DEPTH {
                        return Err(VmError::StackOverflow)
                    }
                    let f = program.function(callee).ok_or(VmError::InvalidFunction(callee))?;
                    let base = stack.len().checked_sub(argc as usize).ok_or(VmError::StackUnderflow)?;
                    stack.resize(base + (f.locals as usize).max(argc as usize), Value::Int(0));
                    exec.frames.push(Frame { function: callee, pc: 0, base });
                }
                Op::CallMethod { class, method, argc } => {
                    let desc = class.methods().get(method as usize)
                                    .ok_or(VmError::InvalidMethod(class, method))?;
                    let at = stack.len().checked_sub(argc as usize + 1).ok_or(VmError::StackUnderflow)?;
                    let args: Vec<Value> = stack.drain(at + 1..).collect();
                    let object = pop(stack)?.as_object().ok_or(VmError::InvalidMethod(class, method))?;
                    let result = if class == ClassId::Thread {
                        self.thread_method(object.index, desc.name, &args, env)?
                    }
                    else {
                        env.call_method(self, object, method, &args)?
                    };
                    if self.thread_mut(tid)?.aborted {
                        return Ok(Step::Aborted)
                    }
                    if self.suspend_request.take().is_some() {
                        exec.push_resume = desc.returns_int;
                        return Ok(Step::Suspended)
                    }
                    if desc.returns_int {
                        exec.stack.push(Value::Int(result));
                    }
                }
                Op::Return|Op::ReturnInt => {
                    let value = if op == Op::ReturnInt { Some(pop_int(stack)?) } else { None };
                    stack.truncate(base);
                    exec.frames.pop();
                    if exec.frames.is_empty() {
                        return Ok(Step::Returned(value.unwrap_or(0)))
                    }
                    if let Some(v) = value {
                        exec.stack.push(Value::Int(v));
                    }
                }
            }
        }
    }

    fn thread_method(
            &mut self,
            target: ThreadId,
            name: &str,
            args: &[Value],
            env: &mut dyn Environment
        ) -> Result<i32, VmError>
    {
        let arg = |i: usize| args.get(i).copied().unwrap_or_default();
        match name {
            "is_running" => return Ok(self.is_running(target) as i32),
            "run" => {
                if !self.is_active(target) {
                    let function = arg(0).as_function().ok_or(VmError::InvalidVariable)?;
                    self.start(target, function, &[])?;
                    self.schedule(target);
                }
            }
            "interrupt" => {
                if !self.is_active(target) {
                    self.abort(target);
                }
            }
            "sleep" => {
                let cycles = arg(0).as_int();
                if cycles > 0 {
                    let wake = env.now() + cycles as Ticks;
                    if let Some(tid) = self.suspend_active(Wait::Sleep) {
                        self.sleepers.push(tid, wake);
                    }
                }
            }
            "join" => {
                if self.is_started(target) && !self.is_active(target) {
                    let queue = self.thread_mut(target)?.join_queue;
                    self.wait_on(queue);
                }
            }
            _ => return Err(VmError::InvalidMethod(ClassId::Thread, 0))
        }
        Ok(0)
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, VmError> {
    stack.pop().ok_or(VmError::StackUnderflow)
}

fn pop_int(stack: &mut Vec<Value>) -> Result<i32, VmError> {
    pop(stack).map(Value::as_int)
}

fn jump(exec: &mut Exec, target: u32) -> Result<(), VmError> {
    let frame = exec.frames.last_mut().ok_or(VmError::StackUnderflow)?;
    frame.pc = target;
    Ok(())
}
