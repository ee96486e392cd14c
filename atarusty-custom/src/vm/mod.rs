/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The script virtual machine of custom devices.
//!
//! Scripts are compiled to a [Program] and run by a [Vm] on cooperative threads. Only one
//! thread executes at a time. A thread runs until its function returns or until a method
//! suspends it, e.g. `thread.sleep(cycles)` parks it in the sleep heap. Suspended threads are
//! made runnable again with [Vm::schedule] and its variants, and then executed in FIFO order
//! by [Vm::run_ready].
use core::fmt;
use std::collections::VecDeque;
use std::error::Error;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

pub mod ast;
pub mod bytecode;
pub mod compile;
pub mod interp;
pub mod parse;
pub mod thread;

pub use bytecode::{CallContext, ClassId, FunctionId, MethodFlags, ObjectRef, Program, SpecialVar, ThreadVar};
pub use compile::{CompileError, Compiler, SIO_FRAME};
pub use interp::{Environment, Outcome, Value};
pub use thread::*;

/// Limits the number of instructions a single thread run may execute.
pub const DEFAULT_INSTRUCTION_LIMIT: u32 = 10_000_000;

const BUILTIN_THREADS: [&str; 3] = ["main", "sio", "interrupt"];

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A thread run exceeded the instruction limit in the named function.
    InstructionLimit(String),
    StackOverflow,
    StackUnderflow,
    InvalidFunction(FunctionId),
    InvalidMethod(ClassId, u16),
    InvalidObject(ObjectRef),
    InvalidVariable,
    InvalidJump,
    InvalidThread(ThreadId),
}

impl Error for VmError {}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InstructionLimit(name) => write!(f, "script took too long to run in {}", name),
            VmError::StackOverflow => f.write_str("script call stack overflow"),
            VmError::StackUnderflow => f.write_str("script stack underflow"),
            VmError::InvalidFunction(id) => write!(f, "invalid script function: {}", id),
            VmError::InvalidMethod(class, m) => write!(f, "invalid method #{} of {}", m, class),
            VmError::InvalidObject(o) => write!(f, "invalid {} object: {}", o.class, o.index),
            VmError::InvalidVariable => f.write_str("invalid script variable"),
            VmError::InvalidJump => f.write_str("invalid script jump"),
            VmError::InvalidThread(tid) => write!(f, "invalid script thread: {}", tid),
        }
    }
}

/// Runs the threads of a compiled [Program].
#[derive(Debug)]
pub struct Vm {
    program: Rc<Program>,
    /// Global integer variables.
    pub globals: Vec<i32>,
    /// `address` and `value` of the current control-layer access.
    pub specials: [i32; bytecode::SPECIAL_VAR_COUNT],
    threads: Vec<VmThread>,
    queues: Vec<VecDeque<ThreadId>>,
    run_queue: VecDeque<ThreadId>,
    pub sleepers: SleepHeap,
    pub raw_send: RawSendQueue,
    active: Vec<ThreadId>,
    suspend_request: Option<Wait>,
    in_run: bool,
    pub instruction_limit: u32,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new(Program::default())
    }
}

impl Vm {
    /// Creates the built-in threads and one thread for each thread declared by `program`.
    pub fn new(program: Program) -> Self {
        let names: Vec<String> = BUILTIN_THREADS.iter().map(|s| s.to_string())
                                 .chain(program.threads.iter().cloned())
                                 .collect();
        let mut vm = Vm {
            globals: program.globals.clone(),
            program: Rc::new(program),
            specials: Default::default(),
            threads: Vec::with_capacity(names.len()),
            queues: Vec::new(),
            run_queue: VecDeque::new(),
            sleepers: SleepHeap::default(),
            raw_send: RawSendQueue::default(),
            active: Vec::new(),
            suspend_request: None,
            in_run: false,
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
        };
        for name in names {
            let join_queue = vm.new_queue();
            vm.threads.push(VmThread::new(name, join_queue));
        }
        vm
    }

    pub fn program(&self) -> &Program {
        &self.program
    }
    /// Creates a new wait queue.
    pub fn new_queue(&mut self) -> QueueId {
        self.queues.push(VecDeque::new());
        (self.queues.len() - 1) as QueueId
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut VmThread, VmError> {
        self.threads.get_mut(tid as usize).ok_or(VmError::InvalidThread(tid))
    }

    pub fn thread_name(&self, tid: ThreadId) -> Option<&str> {
        self.threads.get(tid as usize).map(|t| t.name.as_str())
    }

    pub fn thread_var(&self, tid: ThreadId, var: ThreadVar) -> i32 {
        self.threads.get(tid as usize).map(|t| t.vars[var as usize]).unwrap_or(0)
    }

    pub fn set_thread_var(&mut self, tid: ThreadId, var: ThreadVar, value: i32) {
        if let Some(t) = self.threads.get_mut(tid as usize) {
            t.vars[var as usize] = value;
        }
    }
    /// Sets the value a suspended thread receives from the method that suspended it.
    pub fn set_resume_int(&mut self, tid: ThreadId, value: i32) {
        if let Some(t) = self.threads.get_mut(tid as usize) {
            t.resume_int = value;
        }
    }

    pub fn active_thread(&self) -> Option<ThreadId> {
        self.active.last().copied()
    }
    /// Returns `true` if the thread is executing, including runs interrupted by a nested one.
    pub fn is_active(&self, tid: ThreadId) -> bool {
        self.active.contains(&tid)
    }
    /// Returns `true` if the thread has a function to run or is running one.
    pub fn is_started(&self, tid: ThreadId) -> bool {
        self.threads.get(tid as usize).map_or(false, |t| t.exec.is_some()) || self.is_active(tid)
    }

    pub fn is_running(&self, tid: ThreadId) -> bool {
        self.is_started(tid)
    }

    pub fn wait_of(&self, tid: ThreadId) -> Option<Wait> {
        self.threads.get(tid as usize).and_then(|t| t.wait)
    }
    /// Returns `true` while [Vm::run_ready] drains the run queue.
    pub fn is_in_run(&self) -> bool {
        self.in_run
    }

    pub fn has_runnable(&self) -> bool {
        !self.run_queue.is_empty()
    }
    /// Aborts the thread and prepares it to run `function` from the start.
    pub fn start(&mut self, tid: ThreadId, function: FunctionId, args: &[Value]) -> Result<(), VmError> {
        if self.is_active(tid) {
            return Err(VmError::InvalidThread(tid))
        }
        self.abort(tid);
        let exec = interp::Exec::new(&self.program, function, args)?;
        let thread = self.thread_mut(tid)?;
        thread.exec = Some(exec);
        thread.resume_int = 0;
        Ok(())
    }
    /// Continues a started thread that is not waiting.
    pub fn run(&mut self, tid: ThreadId, env: &mut dyn Environment) -> Result<Outcome, VmError> {
        self.execute(tid, env)
    }
    /// Starts `function` on the thread and runs it until it returns or suspends.
    pub fn run_void(&mut self, tid: ThreadId, function: FunctionId, env: &mut dyn Environment) -> Result<Outcome, VmError> {
        if self.is_active(tid) {
            warn!("thread {} is busy, skipping function {}", tid, function);
            return Ok(Outcome::Stopped)
        }
        self.start(tid, function, &[])?;
        self.execute(tid, env)
    }
    /// Runs a function that returns a value. Yields 0 if it did not return.
    pub fn run_int(&mut self, tid: ThreadId, function: FunctionId, env: &mut dyn Environment) -> Result<i32, VmError> {
        match self.run_void(tid, function, env)? {
            Outcome::Returned(v) => Ok(v),
            _ => Ok(0)
        }
    }
    /// Suspends the active thread once the current method returns.
    pub fn suspend_active(&mut self, wait: Wait) -> Option<ThreadId> {
        let tid = self.active_thread()?;
        self.threads[tid as usize].wait = Some(wait);
        self.suspend_request = Some(wait);
        Some(tid)
    }
    /// Suspends the active thread in a wait queue.
    pub fn wait_on(&mut self, queue: QueueId) -> Option<ThreadId> {
        if queue as usize >= self.queues.len() {
            return None
        }
        let tid = self.suspend_active(Wait::Queue(queue))?;
        self.queues[queue as usize].push_back(tid);
        Some(tid)
    }
    /// Releases a thread from whatever it waits on and appends it to the run queue.
    pub fn schedule(&mut self, tid: ThreadId) {
        if !self.release(tid) {
            return
        }
        let thread = &mut self.threads[tid as usize];
        if !thread.queued {
            thread.queued = true;
            self.run_queue.push_back(tid);
        }
    }
    /// Releases a thread from whatever it waits on and continues it at once.
    ///
    /// Used by callbacks that must know whether the thread finished, e.g. an SIO command
    /// script that ends the command when it returns.
    pub fn resume(&mut self, tid: ThreadId, env: &mut dyn Environment) -> Result<Outcome, VmError> {
        if !self.release(tid) {
            return Ok(Outcome::Stopped)
        }
        let thread = &mut self.threads[tid as usize];
        if core::mem::replace(&mut thread.queued, false) {
            self.run_queue.retain(|&t| t != tid);
        }
        self.execute(tid, env)
    }

    fn release(&mut self, tid: ThreadId) -> bool {
        let thread = match self.threads.get_mut(tid as usize) {
            Some(t) if t.exec.is_some() => t,
            _ => return false
        };
        match thread.wait.take() {
            Some(Wait::Queue(q)) => {
                if let Some(queue) = self.queues.get_mut(q as usize) {
                    queue.retain(|&t| t != tid);
                }
            }
            Some(Wait::Sleep) => self.sleepers.remove(tid),
            Some(Wait::RawSend) => self.raw_send.abort_thread(tid),
            _ => {}
        }
        true
    }
    /// Schedules the first thread waiting in the queue.
    pub fn schedule_next(&mut self, queue: QueueId) -> Option<ThreadId> {
        let tid = self.queues.get_mut(queue as usize)?.pop_front()?;
        self.schedule(tid);
        Some(tid)
    }
    /// Schedules every thread waiting in the queue, in their waiting order.
    pub fn schedule_all(&mut self, queue: QueueId) {
        let waiting: Vec<ThreadId> = match self.queues.get_mut(queue as usize) {
            Some(q) => q.drain(..).collect(),
            None => return
        };
        for tid in waiting {
            self.schedule(tid);
        }
    }
    /// Schedules all threads whose sleep ended at `now`.
    pub fn wake_sleepers(&mut self, now: atarusty_core::clock::Ticks) -> usize {
        let mut count = 0;
        while let Some(tid) = self.sleepers.pop_due(now) {
            if self.wait_of(tid) == Some(Wait::Sleep) {
                self.threads[tid as usize].wait = None;
                self.schedule(tid);
                count += 1;
            }
        }
        count
    }
    /// Runs queued threads in FIFO order until the run queue is empty.
    ///
    /// Returns the first error, after all threads had their turn.
    pub fn run_ready(&mut self, env: &mut dyn Environment) -> Result<(), VmError> {
        if self.in_run {
            return Ok(())
        }
        self.in_run = true;
        let mut result = Ok(());
        while let Some(tid) = self.run_queue.pop_front() {
            self.threads[tid as usize].queued = false;
            if let Err(e) = self.execute(tid, env) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.in_run = false;
        result
    }
    /// Aborts a started thread, detaching it from whatever it waits on, and releases
    /// its joiners. Returns what the thread waited on.
    pub fn abort(&mut self, tid: ThreadId) -> Option<Wait> {
        let active = self.is_active(tid);
        match self.threads.get_mut(tid as usize) {
            Some(t) if t.exec.is_some() || active => {
                if active {
                    t.aborted = true;
                }
            }
            _ => return None
        }
        self.stop(tid)
    }

    pub(crate) fn stop(&mut self, tid: ThreadId) -> Option<Wait> {
        let thread = self.threads.get_mut(tid as usize)?;
        thread.exec = None;
        let wait = thread.wait.take();
        let join_queue = thread.join_queue;
        if core::mem::replace(&mut thread.queued, false) {
            self.run_queue.retain(|&t| t != tid);
        }
        match wait {
            Some(Wait::Queue(q)) => {
                if let Some(queue) = self.queues.get_mut(q as usize) {
                    queue.retain(|&t| t != tid);
                }
            }
            Some(Wait::Sleep) => self.sleepers.remove(tid),
            Some(Wait::RawSend) => self.raw_send.abort_thread(tid),
            _ => {}
        }
        self.schedule_all(join_queue);
        wait
    }
    /// Aborts every thread and empties all queues, keeping global variables.
    pub fn reset(&mut self) {
        for tid in 0..self.threads.len() as ThreadId {
            self.abort(tid);
        }
        for thread in self.threads.iter_mut() {
            thread.vars = Default::default();
            thread.resume_int = 0;
        }
        for queue in self.queues.iter_mut() {
            queue.clear();
        }
        self.run_queue.clear();
        self.sleepers.clear();
        self.raw_send.clear();
        self.specials = Default::default();
        self.suspend_request = None;
    }
    /// Restores global variables to their initial values.
    pub fn reset_globals(&mut self) {
        self.globals.clear();
        self.globals.extend_from_slice(&self.program.globals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ast::Decl;
    use super::compile::Symbol;
    use atarusty_core::clock::Ticks;

    struct TestEnv {
        now: Ticks,
        logged: Vec<String>,
        queue: QueueId,
    }

    impl Environment for TestEnv {
        fn now(&self) -> Ticks {
            self.now
        }

        fn call_method(&mut self, vm: &mut Vm, object: ObjectRef, method: u16, args: &[Value]) -> Result<i32, VmError> {
            let desc = &object.class.methods()[method as usize];
            match (object.class, desc.name) {
                (ClassId::Debug, "log") => {
                    let s = vm.program().string(args[0].as_str_id().unwrap()).to_string();
                    self.logged.push(s);
                }
                (ClassId::Debug, "log_int") => {
                    let s = vm.program().string(args[0].as_str_id().unwrap()).to_string();
                    self.logged.push(format!("{}{}", s, args[1].as_int()));
                }
                (ClassId::Sio, "recv_raw_byte") => { vm.wait_on(self.queue); }
                _ => return Err(VmError::InvalidObject(object))
            }
            Ok(0)
        }
    }

    fn build(src: &str) -> (Vm, Compiler) {
        let mut compiler = Compiler::new(false);
        for decl in parse::parse(src).unwrap() {
            match decl {
                Decl::Int { loc, name, init } => { compiler.declare_int(loc, &name, init.as_ref()).unwrap(); }
                Decl::Function(def) => { compiler.declare_function(&def).unwrap(); }
                Decl::Object { loc, name, .. } => { compiler.declare_thread(loc, &name).unwrap(); }
                _ => {}
            }
        }
        let vm = Vm::new(compiler.program().clone());
        (vm, compiler)
    }

    fn function(c: &Compiler, name: &str) -> FunctionId {
        match c.lookup(name) {
            Some(Symbol::Function(id)) => id,
            _ => panic!("no function {}", name)
        }
    }

    fn env() -> TestEnv {
        TestEnv { now: 0, logged: Vec::new(), queue: 0 }
    }

    #[test]
    fn functions_compute() {
        let (mut vm, c) = build(r#"
            int calls;
            function fib(int n): int {
                calls += 1;
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            function logic(): int { return (0 && fib(5)) + (1 || fib(5)) * 10 + !(3 > 4) * 100; }
            function loops(): int {
                int i = 0; int sum = 0;
                while (1) { i += 1; if (i > 10) break; if (i % 2) continue; sum += i; }
                loop { sum = sum * 2; if (sum > 1000) break; }
                return sum;
            }
            function speak() { debug.log("hi"); debug.log_int("n=", -7); }
        "#);
        let mut env = env();
        assert!(vm.run_int(MAIN_THREAD, function(&c, "fib"), &mut env).is_err());
        let fib = function(&c, "fib");
        vm.start(MAIN_THREAD, fib, &[Value::Int(10)]).unwrap();
        assert_eq!(vm.run(MAIN_THREAD, &mut env), Ok(Outcome::Returned(55)));
        assert_eq!(vm.globals[0], 177);
        assert_eq!(vm.run_int(MAIN_THREAD, function(&c, "logic"), &mut env), Ok(110));
        assert_eq!(vm.globals[0], 177);
        assert_eq!(vm.run_int(MAIN_THREAD, function(&c, "loops"), &mut env), Ok(1920));
        vm.run_void(MAIN_THREAD, function(&c, "speak"), &mut env).unwrap();
        assert_eq!(env.logged, ["hi", "n=-7"]);
        assert!(!vm.is_started(MAIN_THREAD));
    }

    #[test]
    fn sleeping_thread_wakes_on_time() {
        let (mut vm, c) = build(r#"
            int woke;
            function nap() { thread.sleep(1000); woke = 1; }
        "#);
        let mut env = env();
        env.now = 5000;
        assert_eq!(vm.run_void(MAIN_THREAD, function(&c, "nap"), &mut env), Ok(Outcome::Suspended));
        assert_eq!(vm.sleepers.next_wake(), Some(6000));
        assert_eq!(vm.wait_of(MAIN_THREAD), Some(Wait::Sleep));
        assert_eq!(vm.wake_sleepers(5999), 0);
        assert!(!vm.has_runnable());
        assert_eq!(vm.globals[0], 0);
        env.now = 6000;
        assert_eq!(vm.wake_sleepers(6000), 1);
        vm.run_ready(&mut env).unwrap();
        assert_eq!(vm.globals[0], 1);
        assert!(!vm.is_started(MAIN_THREAD));
        assert!(vm.sleepers.is_empty());
    }

    #[test]
    fn threads_join_and_interrupt() {
        let (mut vm, c) = build(r#"
            Thread worker;
            Thread waiter;
            int stage;
            function work() { stage = 1; thread.sleep(100); stage = 2; }
            function wait_for_worker() { worker.join(); stage = stage + 10; }
            function kick() { worker.run(work); waiter.run(wait_for_worker); }
            function stop_worker() { worker.interrupt(); }
            function check(): int { return worker.is_running(); }
        "#);
        let worker = FIRST_USER_THREAD;
        let waiter = FIRST_USER_THREAD + 1;
        let mut env = env();
        vm.run_void(MAIN_THREAD, function(&c, "kick"), &mut env).unwrap();
        vm.run_ready(&mut env).unwrap();
        assert_eq!(vm.globals[0], 1);
        assert_eq!(vm.wait_of(worker), Some(Wait::Sleep));
        assert_eq!(vm.wait_of(waiter), Some(Wait::Queue(vm.threads[worker as usize].join_queue)));
        assert_eq!(vm.run_int(MAIN_THREAD, function(&c, "check"), &mut env), Ok(1));

        env.now = 100;
        vm.wake_sleepers(100);
        vm.run_ready(&mut env).unwrap();
        assert_eq!(vm.globals[0], 12);
        assert_eq!(vm.run_int(MAIN_THREAD, function(&c, "check"), &mut env), Ok(0));

        // interrupting releases the joiner, the worker never finishes its sleep
        vm.run_void(MAIN_THREAD, function(&c, "kick"), &mut env).unwrap();
        vm.run_ready(&mut env).unwrap();
        assert_eq!(vm.globals[0], 1);
        vm.run_void(MAIN_THREAD, function(&c, "stop_worker"), &mut env).unwrap();
        assert!(vm.sleepers.is_empty());
        vm.run_ready(&mut env).unwrap();
        assert_eq!(vm.globals[0], 11);
        assert!(!vm.is_started(worker));
        assert!(!vm.is_started(waiter));
    }

    #[test]
    fn suspended_methods_resume_with_value() {
        let (mut vm, c) = build(r#"
            int got;
            function reader() { got = sio.recv_raw_byte() + 1; }
        "#);
        let mut env = env();
        env.queue = vm.new_queue();
        assert_eq!(vm.run_void(MAIN_THREAD, function(&c, "reader"), &mut env), Ok(Outcome::Suspended));
        assert_eq!(vm.schedule_next(env.queue), Some(MAIN_THREAD));
        assert_eq!(vm.schedule_next(env.queue), None);
        vm.set_resume_int(MAIN_THREAD, 0x41);
        vm.run_ready(&mut env).unwrap();
        assert_eq!(vm.globals[0], 0x42);
    }

    #[test]
    fn runaway_scripts_are_stopped() {
        let (mut vm, c) = build("function spin() { loop { } }");
        vm.instruction_limit = 1000;
        let mut env = env();
        let err = vm.run_void(MAIN_THREAD, function(&c, "spin"), &mut env).unwrap_err();
        assert_eq!(err, VmError::InstructionLimit("spin".into()));
        assert!(!vm.is_started(MAIN_THREAD));
        let (mut vm, c) = build("function deep(int n): int { return deep(n + 1); }");
        vm.start(MAIN_THREAD, function(&c, "deep"), &[Value::Int(0)]).unwrap();
        assert_eq!(vm.run(MAIN_THREAD, &mut env), Err(VmError::StackOverflow));
    }
}
