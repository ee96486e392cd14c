/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! An NMOS 6502 coprocessor.
//!
//! The coprocessor is a pure state machine: it fetches and executes instructions from a
//! [CoprocBus] and accounts for the elapsed cycles in its own [Scheduler]. The host decides
//! when the coprocessor runs and for how long, see [crate::debug].
use std::collections::BTreeSet;

use bitflags::bitflags;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use crate::clock::{Scheduler, Ticks};

mod ops;
pub mod memmap;

pub use memmap::*;
pub use ops::{disassemble, instruction_length};

bitflags! {
    /// The processor status register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
    pub struct StatusFlags: u8 {
        const C = 0x01;
        const Z = 0x02;
        const I = 0x04;
        const D = 0x08;
        const B = 0x10;
        const U = 0x20;
        const V = 0x40;
        const N = 0x80;
    }
}

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

/// The bus seen by the coprocessor.
pub trait CoprocBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    /// Must never produce side effects.
    fn debug_read(&mut self, addr: u16) -> u8;
}

/// A [CoprocBus] that owns the scheduler in which the coprocessor's time is kept.
///
/// Devices behind the bus usually need the scheduler while being accessed, so it can't be
/// borrowed separately from the bus.
pub trait CoprocSystem: CoprocBus {
    fn scheduler(&mut self) -> &mut Scheduler;
}

/// Why [Coproc6502::run] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The stop time was reached.
    Completed,
    /// An event on the coprocessor's scheduler became due and must be dispatched.
    EventDue,
    /// The next instruction is at a breakpoint.
    Breakpoint,
}

impl RunExit {
    #[inline]
    pub fn is_completed(self) -> bool {
        self == RunExit::Completed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct CpuRegisters {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub s: u8,
    pub p: u8,
    pub pc: u16,
}

impl Default for CpuRegisters {
    fn default() -> Self {
        CpuRegisters { a: 0, x: 0, y: 0, s: 0xFF, p: 0x34, pc: 0 }
    }
}

/// An NMOS 6502 core with undocumented opcodes executed as NOPs of the matching length
/// and the `KIL` family halting the processor until the next reset.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct Coproc6502 {
    pub(crate) a: u8,
    pub(crate) x: u8,
    pub(crate) y: u8,
    pub(crate) s: u8,
    pub(crate) p: StatusFlags,
    pub(crate) pc: u16,
    irq_line: bool,
    nmi_pending: bool,
    jammed: bool,
    #[cfg_attr(feature = "snapshot", serde(skip))]
    breakpoints: BTreeSet<u16>,
    #[cfg_attr(feature = "snapshot", serde(skip))]
    skip_breakpoint: bool,
    instructions: u64,
}

impl Coproc6502 {
    pub fn new() -> Self {
        let mut cpu = Coproc6502::default();
        cpu.p = StatusFlags::U | StatusFlags::I;
        cpu.s = 0xFF;
        cpu
    }
    /// Resets the processor and loads the program counter from the reset vector.
    pub fn cold_reset<B: CoprocBus>(&mut self, bus: &mut B) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.s = 0xFF;
        self.p = StatusFlags::U | StatusFlags::I;
        self.irq_line = false;
        self.nmi_pending = false;
        self.jammed = false;
        self.skip_breakpoint = false;
        self.warm_reset(bus);
    }
    /// Reloads the program counter from the reset vector, keeping the other registers.
    pub fn warm_reset<B: CoprocBus>(&mut self, bus: &mut B) {
        self.s = self.s.wrapping_sub(3);
        self.p.insert(StatusFlags::I);
        self.jammed = false;
        self.nmi_pending = false;
        let lo = bus.read(RESET_VECTOR);
        let hi = bus.read(RESET_VECTOR + 1);
        self.pc = u16::from_le_bytes([lo, hi]);
        debug!("6502 reset: PC={:04X}", self.pc);
    }

    pub fn registers(&self) -> CpuRegisters {
        CpuRegisters {
            a: self.a, x: self.x, y: self.y, s: self.s,
            p: (self.p | StatusFlags::U).bits(),
            pc: self.pc
        }
    }

    pub fn set_registers(&mut self, regs: CpuRegisters) {
        self.a = regs.a;
        self.x = regs.x;
        self.y = regs.y;
        self.s = regs.s;
        self.p = (StatusFlags::from_bits_retain(regs.p) | StatusFlags::U) - StatusFlags::B;
        self.pc = regs.pc;
    }

    #[inline]
    pub fn pc(&self) -> u16 {
        self.pc
    }
    /// Returns `true` if a `KIL` opcode halted the processor.
    pub fn is_jammed(&self) -> bool {
        self.jammed
    }
    /// Returns the number of instructions executed since creation.
    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }
    /// Sets the level of the (level-triggered, active) IRQ input.
    pub fn set_irq(&mut self, asserted: bool) {
        self.irq_line = asserted;
    }

    pub fn is_irq_asserted(&self) -> bool {
        self.irq_line
    }
    /// Latches a non-maskable interrupt.
    pub fn nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn set_breakpoint(&mut self, pc: u16) {
        self.breakpoints.insert(pc);
    }

    pub fn clear_breakpoint(&mut self, pc: u16) -> bool {
        self.breakpoints.remove(&pc)
    }

    pub fn clear_all_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn breakpoints(&self) -> impl Iterator<Item=u16> + '_ {
        self.breakpoints.iter().copied()
    }

    pub fn has_breakpoint(&self, pc: u16) -> bool {
        self.breakpoints.contains(&pc)
    }
    /// Lets the next [Coproc6502::run] execute the instruction at the current breakpoint.
    pub fn resume_from_breakpoint(&mut self) {
        self.skip_breakpoint = true;
    }
    /// Executes instructions until the scheduler's time reaches `stop`, an event on the
    /// scheduler becomes due or a breakpoint is hit.
    ///
    /// An instruction is never split: the last one may overshoot `stop` by a few cycles.
    pub fn run<S: CoprocSystem>(&mut self, stop: Ticks, sys: &mut S) -> RunExit {
        loop {
            let sched = sys.scheduler();
            let now = sched.now();
            if now >= stop {
                return RunExit::Completed
            }
            match sched.next_event_tick() {
                Some(tick) if tick <= now => return RunExit::EventDue,
                _ => {}
            }
            if !self.skip_breakpoint && !self.jammed && self.breakpoints.contains(&self.pc) {
                debug!("6502 breakpoint at {:04X}", self.pc);
                return RunExit::Breakpoint
            }
            self.skip_breakpoint = false;
            let cycles = self.step(sys);
            sys.scheduler().advance(cycles as Ticks);
        }
    }
    /// Executes a single instruction or interrupt sequence and returns the number of cycles taken.
    pub fn step<B: CoprocBus>(&mut self, bus: &mut B) -> u32 {
        if self.jammed {
            return 1
        }
        if self.nmi_pending {
            self.nmi_pending = false;
            return self.interrupt(bus, NMI_VECTOR, false)
        }
        if self.irq_line && !self.p.contains(StatusFlags::I) {
            return self.interrupt(bus, IRQ_VECTOR, false)
        }
        self.instructions = self.instructions.wrapping_add(1);
        self.execute(bus)
    }

    pub(crate) fn interrupt<B: CoprocBus>(&mut self, bus: &mut B, vector: u16, brk: bool) -> u32 {
        let [lo, hi] = self.pc.to_le_bytes();
        self.push(bus, hi);
        self.push(bus, lo);
        let mut p = self.p | StatusFlags::U;
        p.set(StatusFlags::B, brk);
        self.push(bus, p.bits());
        self.p.insert(StatusFlags::I);
        let lo = bus.read(vector);
        let hi = bus.read(vector.wrapping_add(1));
        self.pc = u16::from_le_bytes([lo, hi]);
        7
    }

    #[inline]
    pub(crate) fn push<B: CoprocBus>(&mut self, bus: &mut B, value: u8) {
        bus.write(0x0100 | self.s as u16, value);
        self.s = self.s.wrapping_sub(1);
    }

    #[inline]
    pub(crate) fn pull<B: CoprocBus>(&mut self, bus: &mut B) -> u8 {
        self.s = self.s.wrapping_add(1);
        bus.read(0x0100 | self.s as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::OwnerId;

    struct Ram(Vec<u8>);

    impl Ram {
        fn with_program(origin: u16, code: &[u8]) -> Self {
            let mut mem = vec![0u8; 0x10000];
            mem[origin as usize..origin as usize + code.len()].copy_from_slice(code);
            mem[RESET_VECTOR as usize] = origin as u8;
            mem[RESET_VECTOR as usize + 1] = (origin >> 8) as u8;
            Ram(mem)
        }
    }

    impl CoprocBus for Ram {
        fn read(&mut self, addr: u16) -> u8 { self.0[addr as usize] }
        fn write(&mut self, addr: u16, value: u8) { self.0[addr as usize] = value }
        fn debug_read(&mut self, addr: u16) -> u8 { self.0[addr as usize] }
    }

    fn boot(code: &[u8]) -> (Coproc6502, Ram) {
        let mut bus = Ram::with_program(0x0200, code);
        let mut cpu = Coproc6502::new();
        cpu.cold_reset(&mut bus);
        (cpu, bus)
    }

    #[test]
    fn reset_loads_vector() {
        let (cpu, _) = boot(&[0xEA]);
        assert_eq!(cpu.pc(), 0x0200);
        assert!(cpu.registers().p & 0x04 != 0);
    }

    #[test]
    fn loop_counts_cycles() {
        // LDX #$05; DEX; BNE -3; STX $10; JAM
        let (mut cpu, mut bus) = boot(&[0xA2, 0x05, 0xCA, 0xD0, 0xFD, 0x86, 0x10, 0x02]);
        let mut cycles = 0;
        while !cpu.is_jammed() {
            cycles += cpu.step(&mut bus);
        }
        // LDX + 5 * DEX + 4 taken BNE + BNE + STX + JAM
        assert_eq!(cycles, 2 + 5*2 + 4*3 + 2 + 3 + 2);
        assert_eq!(bus.0[0x10], 0);
        assert_eq!(cpu.registers().x, 0);
    }

    #[test]
    fn branch_page_cross_penalty() {
        let mut bus = Ram::with_program(0x02F0, &[]);
        // at 02FD: BNE +0x10 crossing into page 03
        bus.0[0x02FD] = 0xD0;
        bus.0[0x02FE] = 0x10;
        let mut cpu = Coproc6502::new();
        cpu.cold_reset(&mut bus);
        cpu.pc = 0x02FD;
        cpu.p.remove(StatusFlags::Z);
        assert_eq!(cpu.step(&mut bus), 4);
        assert_eq!(cpu.pc(), 0x030F);
    }

    #[test]
    fn decimal_mode_adc_sbc() {
        // SED; CLC; LDA #$19; ADC #$28; STA $00; SEC; LDA #$50; SBC #$01; STA $01; JAM
        let (mut cpu, mut bus) = boot(&[
            0xF8, 0x18, 0xA9, 0x19, 0x69, 0x28, 0x85, 0x00,
            0x38, 0xA9, 0x50, 0xE9, 0x01, 0x85, 0x01, 0x02]);
        while !cpu.is_jammed() {
            cpu.step(&mut bus);
        }
        assert_eq!(bus.0[0x00], 0x47);
        assert_eq!(bus.0[0x01], 0x49);
    }

    #[test]
    fn binary_adc_sets_overflow() {
        // CLC; LDA #$7F; ADC #$01; PHP; JAM
        let (mut cpu, mut bus) = boot(&[0x18, 0xA9, 0x7F, 0x69, 0x01, 0x08, 0x02]);
        while !cpu.is_jammed() {
            cpu.step(&mut bus);
        }
        let p = StatusFlags::from_bits_retain(bus.0[0x01FC]);
        assert!(p.contains(StatusFlags::V | StatusFlags::N | StatusFlags::B));
        assert!(!p.contains(StatusFlags::C));
        assert_eq!(cpu.registers().a, 0x80);
    }

    #[test]
    fn jsr_rts_and_irq() {
        // 0200: JSR $0210; CLI; NOP; NOP ... 0210: LDA #$42; RTS
        // FFFE -> 0220: INX; RTI
        let mut code = vec![0xEA; 0x30];
        code[0..3].copy_from_slice(&[0x20, 0x10, 0x02]);
        code[3] = 0x58;
        code[0x10..0x13].copy_from_slice(&[0xA9, 0x42, 0x60]);
        code[0x20..0x22].copy_from_slice(&[0xE8, 0x40]);
        let mut bus = Ram::with_program(0x0200, &code);
        bus.0[0xFFFE] = 0x20;
        bus.0[0xFFFF] = 0x02;
        let mut cpu = Coproc6502::new();
        cpu.cold_reset(&mut bus);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc(), 0x0210);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc(), 0x0203);
        assert_eq!(cpu.registers().a, 0x42);
        cpu.set_irq(true);
        // I still set: CLI executes first
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.pc(), 0x0220);
        cpu.set_irq(false);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc(), 0x0204);
        assert_eq!(cpu.registers().x, 1);
    }

    struct System {
        ram: Ram,
        sched: Scheduler,
    }

    impl CoprocBus for System {
        fn read(&mut self, addr: u16) -> u8 { self.ram.read(addr) }
        fn write(&mut self, addr: u16, value: u8) { self.ram.write(addr, value) }
        fn debug_read(&mut self, addr: u16) -> u8 { self.ram.debug_read(addr) }
    }

    impl CoprocSystem for System {
        fn scheduler(&mut self) -> &mut Scheduler { &mut self.sched }
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn coproc_serde_keeps_status_flags() {
        // SEC; SED; LDA #$42; JAM
        let (mut cpu, mut bus) = boot(&[0x38, 0xF8, 0xA9, 0x42, 0x02]);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        let json = serde_json::to_string(&cpu).unwrap();
        let back: Coproc6502 = serde_json::from_str(&json).unwrap();
        assert_eq!(back.registers(), cpu.registers());
        assert_eq!(back.p, StatusFlags::U | StatusFlags::I | StatusFlags::D | StatusFlags::C);
        assert_eq!(back.instruction_count(), 3);
        let bin = bincode::serialize(&cpu).unwrap();
        let back: Coproc6502 = bincode::deserialize(&bin).unwrap();
        assert_eq!(back.registers(), cpu.registers());
    }

    #[test]
    fn run_stops_at_breakpoints_and_events() {
        // loop: INC $00; JMP loop
        let (mut cpu, ram) = boot(&[0xE6, 0x00, 0x4C, 0x00, 0x02]);
        let mut sys = System { ram, sched: Scheduler::new() };
        assert_eq!(cpu.run(80, &mut sys), RunExit::Completed);
        assert!(sys.sched.now() >= 80 && sys.sched.now() < 85);
        assert_eq!(sys.ram.0[0x00], 10);
        sys.sched.add_event(16, OwnerId(1), 0);
        let start = sys.sched.now();
        assert_eq!(cpu.run(1000, &mut sys), RunExit::EventDue);
        assert!(sys.sched.now() >= start + 16);
        assert!(sys.sched.pop_due().is_some());
        cpu.set_breakpoint(0x0202);
        let exit = cpu.run(1000, &mut sys);
        assert_eq!(exit, RunExit::Breakpoint);
        assert_eq!(cpu.pc(), 0x0202);
        assert_eq!(cpu.run(1000, &mut sys), RunExit::Breakpoint);
        cpu.resume_from_breakpoint();
        let n = cpu.instruction_count();
        assert_eq!(cpu.run(1000, &mut sys), RunExit::Breakpoint);
        assert_eq!(cpu.instruction_count(), n + 2);
    }
}
