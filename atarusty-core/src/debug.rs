/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Catch-up and debugger control of a peripheral coprocessor.
//!
//! A peripheral with its own CPU runs on a private [Scheduler], owned by its [CoprocSystem],
//! whose time base differs from the host's. [TargetControl] converts elapsed host cycles into
//! a deadline on the peripheral's scheduler using a 32.32 fixed point clock ratio, and runs the
//! coprocessor up to it.
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use crate::clock::{EventHandle, OwnerId, ScheduledEvent, Scheduler, Ticks};
use crate::cpu::{Coproc6502, CoprocSystem, RunExit};

/// The number of host ticks the peripheral is kept in lockstep after an I/O access.
pub const FAST_SYNC_COUNT: u32 = 3;

/// The debugger state of a peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    Running,
    /// Stopped by a breakpoint or a break request.
    Stopped,
    /// A single instruction will be executed on the next run, then the target stops.
    Stepping,
}

#[derive(Debug)]
pub struct TargetControl {
    /// Peripheral cycles per host cycle as 32.32 fixed point.
    ratio: u64,
    sub_cycles: u64,
    last_host_tick: Ticks,
    deadline: Ticks,
    fast_sync: u32,
    state: TargetState,
    resume_event: Option<EventHandle>,
}

impl TargetControl {
    /// Creates a control for a peripheral clocked at `target_hz` attached to a host clocked
    /// at `host_hz`.
    pub fn new(host_hz: f64, target_hz: f64) -> Self {
        let mut tc = TargetControl {
            ratio: 1 << 32,
            sub_cycles: 0,
            last_host_tick: 0,
            deadline: 0,
            fast_sync: 0,
            state: TargetState::Running,
            resume_event: None,
        };
        tc.set_clock_ratio(host_hz, target_hz);
        tc
    }

    pub fn set_clock_ratio(&mut self, host_hz: f64, target_hz: f64) {
        let ratio = if host_hz > 0.0 { target_hz / host_hz } else { 1.0 };
        self.ratio = (ratio * 4294967296.0).round().max(1.0) as u64;
    }
    /// Returns the clock ratio as 32.32 fixed point.
    pub fn clock_ratio(&self) -> u64 {
        self.ratio
    }
    /// Re-bases the catch-up accounting at `host_now` and the peripheral's time `target_now`,
    /// discarding any sub-cycles owed.
    pub fn reset_target_control(&mut self, host_now: Ticks, target_now: Ticks) {
        self.last_host_tick = host_now;
        self.sub_cycles = 0;
        self.deadline = target_now;
        self.fast_sync = 0;
        if self.state == TargetState::Stepping {
            self.state = TargetState::Stopped;
        }
    }
    /// Converts the host cycles elapsed since the previous call into peripheral cycles and
    /// returns the new deadline on the peripheral's scheduler.
    pub fn accum_sub_cycles(&mut self, host_now: Ticks) -> Ticks {
        let delta = host_now.saturating_sub(self.last_host_tick);
        self.last_host_tick = self.last_host_tick.max(host_now);
        let acc = self.sub_cycles as u128 + delta as u128 * self.ratio as u128;
        self.deadline = self.deadline.saturating_add((acc >> 32) as Ticks);
        self.sub_cycles = (acc & 0xFFFF_FFFF) as u64;
        self.deadline
    }
    /// Returns the deadline computed by the last [TargetControl::accum_sub_cycles].
    pub fn deadline(&self) -> Ticks {
        self.deadline
    }
    /// Opens the fast sync window.
    pub fn reset_fast_sync_window(&mut self) {
        self.fast_sync = FAST_SYNC_COUNT;
    }
    /// Returns `true` and consumes one host tick of the fast sync window if it is open.
    pub fn tick_fast_sync(&mut self) -> bool {
        if self.fast_sync > 0 {
            self.fast_sync -= 1;
            true
        }
        else {
            false
        }
    }

    pub fn fast_sync_remaining(&self) -> u32 {
        self.fast_sync
    }
    /// Requests another catch-up slice on the next host tick.
    pub fn schedule_immediate_resume(&mut self, host: &mut Scheduler, owner: OwnerId, id: u32) {
        if self.resume_event.map_or(true, |h| !host.is_pending(h)) {
            self.resume_event = Some(host.add_event(1, owner, id));
        }
    }
    /// Must be called by the owner when the event created by
    /// [TargetControl::schedule_immediate_resume] fires.
    pub fn on_resume_event(&mut self) {
        self.resume_event = None;
    }

    pub fn cancel_immediate_resume(&mut self, host: &mut Scheduler) {
        host.unset_event(&mut self.resume_event);
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TargetState::Running
    }
    /// Stops the target before its next instruction.
    pub fn break_target(&mut self) {
        if self.state != TargetState::Stopped {
            debug!("target break, deadline: {}", self.deadline);
        }
        self.state = TargetState::Stopped;
    }
    /// Resumes a stopped target. The time spent stopped is not caught up.
    pub fn resume_target(&mut self, cpu: &mut Coproc6502, host_now: Ticks, target_now: Ticks) {
        if self.state != TargetState::Running {
            cpu.resume_from_breakpoint();
            self.state = TargetState::Running;
            self.reset_target_control(host_now, target_now);
        }
    }
    /// Arms a single instruction step of a stopped target.
    pub fn step_target(&mut self) {
        if self.state == TargetState::Stopped {
            self.state = TargetState::Stepping;
        }
    }
    /// Runs the coprocessor up to the current deadline, dispatching events due on the
    /// peripheral scheduler to `dispatch`.
    ///
    /// Returns `true` if the deadline was reached.
    pub fn run<S, F>(&mut self, cpu: &mut Coproc6502, sys: &mut S, mut dispatch: F) -> bool
        where S: CoprocSystem,
              F: FnMut(ScheduledEvent, &mut S)
    {
        match self.state {
            TargetState::Stopped => {
                self.deadline = sys.scheduler().now();
                return true
            }
            TargetState::Stepping => {
                let cycles = cpu.step(sys);
                sys.scheduler().advance(cycles as Ticks);
                Self::dispatch_due(sys, &mut dispatch);
                self.deadline = sys.scheduler().now();
                self.state = TargetState::Stopped;
                return true
            }
            TargetState::Running => {}
        }
        loop {
            match cpu.run(self.deadline, sys) {
                RunExit::Completed => return true,
                RunExit::EventDue => Self::dispatch_due(sys, &mut dispatch),
                RunExit::Breakpoint => {
                    self.break_target();
                    return false
                }
            }
        }
    }

    fn dispatch_due<S, F>(sys: &mut S, dispatch: &mut F)
        where S: CoprocSystem,
              F: FnMut(ScheduledEvent, &mut S)
    {
        while let Some(ev) = sys.scheduler().pop_due() {
            dispatch(ev, sys);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CoprocBus;

    struct System {
        ram: Vec<u8>,
        sched: Scheduler,
    }

    impl CoprocBus for System {
        fn read(&mut self, addr: u16) -> u8 { self.ram[addr as usize] }
        fn write(&mut self, addr: u16, value: u8) { self.ram[addr as usize] = value }
        fn debug_read(&mut self, addr: u16) -> u8 { self.ram[addr as usize] }
    }

    impl CoprocSystem for System {
        fn scheduler(&mut self) -> &mut Scheduler { &mut self.sched }
    }

    fn counter_machine() -> (Coproc6502, System) {
        let mut ram = vec![0u8; 0x10000];
        // INC $00; JMP $0200
        ram[0x200..0x205].copy_from_slice(&[0xE6, 0x00, 0x4C, 0x00, 0x02]);
        ram[0xFFFC] = 0x00;
        ram[0xFFFD] = 0x02;
        let mut sys = System { ram, sched: Scheduler::new() };
        let mut cpu = Coproc6502::new();
        cpu.cold_reset(&mut sys);
        (cpu, sys)
    }

    #[test]
    fn sub_cycles_accumulate() {
        let mut tc = TargetControl::new(1_000_000.0, 1_500_000.0);
        tc.reset_target_control(100, 0);
        assert_eq!(tc.accum_sub_cycles(101), 1);
        assert_eq!(tc.accum_sub_cycles(102), 3);
        assert_eq!(tc.accum_sub_cycles(102), 3);
        assert_eq!(tc.accum_sub_cycles(202), 153);
        // time never runs backwards
        assert_eq!(tc.accum_sub_cycles(150), 153);
    }

    #[test]
    fn fast_sync_window_works() {
        let mut tc = TargetControl::new(1.0, 1.0);
        assert!(!tc.tick_fast_sync());
        tc.reset_fast_sync_window();
        assert!(tc.tick_fast_sync());
        assert!(tc.tick_fast_sync());
        assert!(tc.tick_fast_sync());
        assert!(!tc.tick_fast_sync());
    }

    #[test]
    fn immediate_resume_is_scheduled_once() {
        let mut host = Scheduler::new();
        let mut tc = TargetControl::new(1.0, 1.0);
        tc.schedule_immediate_resume(&mut host, OwnerId(3), 7);
        tc.schedule_immediate_resume(&mut host, OwnerId(3), 7);
        assert_eq!(host.pending_count(), 1);
        let ev = host.run_next(10).unwrap();
        assert_eq!((ev.owner, ev.id, ev.tick), (OwnerId(3), 7, 1));
        tc.on_resume_event();
        tc.schedule_immediate_resume(&mut host, OwnerId(3), 7);
        assert_eq!(host.pending_count(), 1);
        tc.cancel_immediate_resume(&mut host);
        assert_eq!(host.pending_count(), 0);
    }

    #[test]
    fn run_break_step_resume() {
        let (mut cpu, mut sys) = counter_machine();
        let mut tc = TargetControl::new(1.0, 1.0);
        tc.reset_target_control(0, 0);
        tc.accum_sub_cycles(80);
        assert!(tc.run(&mut cpu, &mut sys, |_, _| {}));
        assert_eq!(sys.ram[0], 10);
        cpu.set_breakpoint(0x0202);
        tc.accum_sub_cycles(160);
        assert!(!tc.run(&mut cpu, &mut sys, |_, _| {}));
        assert_eq!(tc.state(), TargetState::Stopped);
        assert_eq!(cpu.pc(), 0x0202);
        tc.step_target();
        assert!(tc.run(&mut cpu, &mut sys, |_, _| {}));
        assert_eq!(cpu.pc(), 0x0200);
        assert_eq!(tc.state(), TargetState::Stopped);
        cpu.clear_all_breakpoints();
        let start = sys.sched.now();
        tc.resume_target(&mut cpu, 1000, start);
        let deadline = tc.accum_sub_cycles(1016);
        assert_eq!(deadline, start + 16);
        assert!(tc.run(&mut cpu, &mut sys, |_, _| {}));
        assert_eq!(sys.ram[0], 13);
    }

    #[test]
    fn run_dispatches_peripheral_events() {
        let (mut cpu, mut sys) = counter_machine();
        let mut tc = TargetControl::new(1.0, 1.0);
        sys.sched.add_event(20, OwnerId(1), 5);
        tc.accum_sub_cycles(40);
        let mut fired = Vec::new();
        assert!(tc.run(&mut cpu, &mut sys, |ev, sys| {
            fired.push((ev.id, sys.sched.now()));
            sys.ram[0x10] = 0xAA;
        }));
        assert_eq!(fired.len(), 1);
        assert!(fired[0].1 >= 20 && fired[0].1 < 26);
        assert_eq!(sys.ram[0x10], 0xAA);
    }
}
