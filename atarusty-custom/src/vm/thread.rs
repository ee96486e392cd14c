/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Script threads and the structures that hold them while they wait.
use core::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use atarusty_core::clock::Ticks;

use super::bytecode::THREAD_VAR_COUNT;
use super::interp::Exec;

/// An index into the thread pool of a [super::Vm].
pub type ThreadId = u32;
/// An index of a wait queue of a [super::Vm].
pub type QueueId = u32;

/// Runs control-layer scripts, event handlers and video hooks.
pub const MAIN_THREAD: ThreadId = 0;
/// Runs SIO command scripts.
pub const SIO_THREAD: ThreadId = 1;
/// Runs network interrupt handlers.
pub const INTERRUPT_THREAD: ThreadId = 2;
/// The first thread declared by a configuration.
pub const FIRST_USER_THREAD: ThreadId = 3;

/// The reason a thread is suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Parked in a wait queue.
    Queue(QueueId),
    /// Parked in the sleep heap.
    Sleep,
    /// Waits for its raw byte to leave the wire.
    RawSend,
    /// Waits for an SIO transfer step of the current command.
    Sio,
    /// Waits for the host to finish a command.
    External,
}

#[derive(Debug)]
pub(crate) struct VmThread {
    pub name: String,
    /// Present while the thread is started and not executing.
    pub exec: Option<Exec>,
    pub wait: Option<Wait>,
    /// Set while the thread is in the run queue.
    pub queued: bool,
    /// Set if the thread was aborted while executing.
    pub aborted: bool,
    pub join_queue: QueueId,
    pub vars: [i32; THREAD_VAR_COUNT],
    /// The result handed to a suspended method that returns a value.
    pub resume_int: i32,
}

impl VmThread {
    pub fn new(name: String, join_queue: QueueId) -> Self {
        VmThread {
            name,
            exec: None,
            wait: None,
            queued: false,
            aborted: false,
            join_queue,
            vars: [0; THREAD_VAR_COUNT],
            resume_int: 0,
        }
    }
}

/// A min-heap of sleeping threads ordered by `(wake tick, thread)`.
#[derive(Clone, Debug, Default)]
pub struct SleepHeap {
    heap: BinaryHeap<Reverse<(Ticks, ThreadId)>>,
}

impl SleepHeap {
    pub fn push(&mut self, thread: ThreadId, wake: Ticks) {
        self.heap.push(Reverse((wake, thread)));
    }
    /// Returns the earliest wake tick.
    pub fn next_wake(&self) -> Option<Ticks> {
        self.heap.peek().map(|Reverse((wake, _))| *wake)
    }
    /// Pops a thread whose wake tick is not later than `now`.
    pub fn pop_due(&mut self, now: Ticks) -> Option<ThreadId> {
        match self.heap.peek() {
            Some(Reverse((wake, _))) if *wake <= now => {
                self.heap.pop().map(|Reverse((_, thread))| thread)
            }
            _ => None
        }
    }
    /// Removes every entry of `thread` and restores the heap order.
    pub fn remove(&mut self, thread: ThreadId) {
        let entries = core::mem::take(&mut self.heap).into_vec();
        self.heap = entries.into_iter().filter(|Reverse((_, t))| *t != thread).collect();
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// A byte queued for the raw SIO wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSend {
    /// The thread to resume once the byte is sent, `None` if it was aborted.
    pub thread: Option<ThreadId>,
    pub byte: u8,
    pub cycles_per_bit: u32,
}

impl RawSend {
    /// The wire time of a byte with its start and stop bits.
    pub fn duration(&self) -> Ticks {
        10 * self.cycles_per_bit as Ticks
    }
}

/// Bytes queued for the raw SIO wire, sent one at a time in order.
#[derive(Clone, Debug, Default)]
pub struct RawSendQueue {
    queue: VecDeque<RawSend>,
    in_flight: bool,
}

impl RawSendQueue {
    pub fn push(&mut self, send: RawSend) {
        self.queue.push_back(send);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
    /// Marks the head byte as being sent and returns it, unless a byte is already in flight.
    pub fn begin(&mut self) -> Option<RawSend> {
        if self.in_flight {
            return None
        }
        let head = *self.queue.front()?;
        self.in_flight = true;
        Some(head)
    }
    /// Retires the byte in flight and returns the thread that should be resumed.
    pub fn complete(&mut self) -> Option<ThreadId> {
        if !self.in_flight {
            return None
        }
        self.in_flight = false;
        self.queue.pop_front().and_then(|send| send.thread)
    }
    /// Detaches `thread` from the queue.
    ///
    /// A byte already in flight keeps going but no longer resumes its thread.
    pub fn abort_thread(&mut self, thread: ThreadId) {
        let skip = if self.in_flight {
            if let Some(head) = self.queue.front_mut() {
                if head.thread == Some(thread) {
                    head.thread = None;
                }
            }
            1
        }
        else {
            0
        };
        let mut index = 0;
        self.queue.retain(|send| {
            index += 1;
            index <= skip || send.thread != Some(thread)
        });
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
