/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use core::fmt::Write;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use super::{Coproc6502, CoprocBus, StatusFlags, IRQ_VECTOR};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Instr {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jam,
    Jmp, Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror,
    Rti, Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs,
    Tya
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Mode {
    Imp, Acc, Imm, Zp, Zpx, Zpy, Abs, Absx, Absy, Ind, Indx, Indy, Rel
}

impl Mode {
    fn operand_len(self) -> u16 {
        match self {
            Imp|Acc => 0,
            Imm|Zp|Zpx|Zpy|Indx|Indy|Rel => 1,
            Abs|Absx|Absy|Ind => 2
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(super) struct OpInfo {
    pub instr: Instr,
    pub mode: Mode,
    pub cycles: u8,
    /// An extra cycle is taken when indexing crosses a page boundary.
    pub page_penalty: bool,
}

const fn op(instr: Instr, mode: Mode, cycles: u8, page_penalty: bool) -> OpInfo {
    OpInfo { instr, mode, cycles, page_penalty }
}

use Instr::*;
use Mode::*;

pub(super) static OPCODES: [OpInfo; 256] = [
    op(Brk, Imp, 7, false), op(Ora, Indx, 6, false), op(Jam, Imp, 2, false), op(Nop, Indx, 6, false), // 00
    op(Nop, Zp, 3, false), op(Ora, Zp, 3, false), op(Asl, Zp, 5, false), op(Nop, Zp, 3, false), // 04
    op(Php, Imp, 3, false), op(Ora, Imm, 2, false), op(Asl, Acc, 2, false), op(Nop, Imm, 2, false), // 08
    op(Nop, Abs, 4, false), op(Ora, Abs, 4, false), op(Asl, Abs, 6, false), op(Nop, Abs, 4, false), // 0C
    op(Bpl, Rel, 2, false), op(Ora, Indy, 5, true), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // 10
    op(Nop, Zpx, 4, false), op(Ora, Zpx, 4, false), op(Asl, Zpx, 6, false), op(Nop, Zpx, 4, false), // 14
    op(Clc, Imp, 2, false), op(Ora, Absy, 4, true), op(Nop, Imp, 2, false), op(Nop, Absy, 4, true), // 18
    op(Nop, Absx, 4, true), op(Ora, Absx, 4, true), op(Asl, Absx, 7, false), op(Nop, Absx, 4, true), // 1C
    op(Jsr, Abs, 6, false), op(And, Indx, 6, false), op(Jam, Imp, 2, false), op(Nop, Indx, 6, false), // 20
    op(Bit, Zp, 3, false), op(And, Zp, 3, false), op(Rol, Zp, 5, false), op(Nop, Zp, 3, false), // 24
    op(Plp, Imp, 4, false), op(And, Imm, 2, false), op(Rol, Acc, 2, false), op(Nop, Imm, 2, false), // 28
    op(Bit, Abs, 4, false), op(And, Abs, 4, false), op(Rol, Abs, 6, false), op(Nop, Abs, 4, false), // 2C
    op(Bmi, Rel, 2, false), op(And, Indy, 5, true), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // 30
    op(Nop, Zpx, 4, false), op(And, Zpx, 4, false), op(Rol, Zpx, 6, false), op(Nop, Zpx, 4, false), // 34
    op(Sec, Imp, 2, false), op(And, Absy, 4, true), op(Nop, Imp, 2, false), op(Nop, Absy, 4, true), // 38
    op(Nop, Absx, 4, true), op(And, Absx, 4, true), op(Rol, Absx, 7, false), op(Nop, Absx, 4, true), // 3C
    op(Rti, Imp, 6, false), op(Eor, Indx, 6, false), op(Jam, Imp, 2, false), op(Nop, Indx, 6, false), // 40
    op(Nop, Zp, 3, false), op(Eor, Zp, 3, false), op(Lsr, Zp, 5, false), op(Nop, Zp, 3, false), // 44
    op(Pha, Imp, 3, false), op(Eor, Imm, 2, false), op(Lsr, Acc, 2, false), op(Nop, Imm, 2, false), // 48
    op(Jmp, Abs, 3, false), op(Eor, Abs, 4, false), op(Lsr, Abs, 6, false), op(Nop, Abs, 4, false), // 4C
    op(Bvc, Rel, 2, false), op(Eor, Indy, 5, true), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // 50
    op(Nop, Zpx, 4, false), op(Eor, Zpx, 4, false), op(Lsr, Zpx, 6, false), op(Nop, Zpx, 4, false), // 54
    op(Cli, Imp, 2, false), op(Eor, Absy, 4, true), op(Nop, Imp, 2, false), op(Nop, Absy, 4, true), // 58
    op(Nop, Absx, 4, true), op(Eor, Absx, 4, true), op(Lsr, Absx, 7, false), op(Nop, Absx, 4, true), // 5C
    op(Rts, Imp, 6, false), op(Adc, Indx, 6, false), op(Jam, Imp, 2, false), op(Nop, Indx, 6, false), // 60
    op(Nop, Zp, 3, false), op(Adc, Zp, 3, false), op(Ror, Zp, 5, false), op(Nop, Zp, 3, false), // 64
    op(Pla, Imp, 4, false), op(Adc, Imm, 2, false), op(Ror, Acc, 2, false), op(Nop, Imm, 2, false), // 68
    op(Jmp, Ind, 5, false), op(Adc, Abs, 4, false), op(Ror, Abs, 6, false), op(Nop, Abs, 4, false), // 6C
    op(Bvs, Rel, 2, false), op(Adc, Indy, 5, true), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // 70
    op(Nop, Zpx, 4, false), op(Adc, Zpx, 4, false), op(Ror, Zpx, 6, false), op(Nop, Zpx, 4, false), // 74
    op(Sei, Imp, 2, false), op(Adc, Absy, 4, true), op(Nop, Imp, 2, false), op(Nop, Absy, 4, true), // 78
    op(Nop, Absx, 4, true), op(Adc, Absx, 4, true), op(Ror, Absx, 7, false), op(Nop, Absx, 4, true), // 7C
    op(Nop, Imm, 2, false), op(Sta, Indx, 6, false), op(Nop, Imm, 2, false), op(Nop, Indx, 6, false), // 80
    op(Sty, Zp, 3, false), op(Sta, Zp, 3, false), op(Stx, Zp, 3, false), op(Nop, Zp, 3, false), // 84
    op(Dey, Imp, 2, false), op(Nop, Imm, 2, false), op(Txa, Imp, 2, false), op(Nop, Imm, 2, false), // 88
    op(Sty, Abs, 4, false), op(Sta, Abs, 4, false), op(Stx, Abs, 4, false), op(Nop, Abs, 4, false), // 8C
    op(Bcc, Rel, 2, false), op(Sta, Indy, 6, false), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // 90
    op(Sty, Zpx, 4, false), op(Sta, Zpx, 4, false), op(Stx, Zpy, 4, false), op(Nop, Zpx, 4, false), // 94
    op(Tya, Imp, 2, false), op(Sta, Absy, 5, false), op(Txs, Imp, 2, false), op(Nop, Absy, 4, true), // 98
    op(Nop, Absx, 4, true), op(Sta, Absx, 5, false), op(Nop, Absx, 4, true), op(Nop, Absx, 4, true), // 9C
    op(Ldy, Imm, 2, false), op(Lda, Indx, 6, false), op(Ldx, Imm, 2, false), op(Nop, Indx, 6, false), // A0
    op(Ldy, Zp, 3, false), op(Lda, Zp, 3, false), op(Ldx, Zp, 3, false), op(Nop, Zp, 3, false), // A4
    op(Tay, Imp, 2, false), op(Lda, Imm, 2, false), op(Tax, Imp, 2, false), op(Nop, Imm, 2, false), // A8
    op(Ldy, Abs, 4, false), op(Lda, Abs, 4, false), op(Ldx, Abs, 4, false), op(Nop, Abs, 4, false), // AC
    op(Bcs, Rel, 2, false), op(Lda, Indy, 5, true), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // B0
    op(Ldy, Zpx, 4, false), op(Lda, Zpx, 4, false), op(Ldx, Zpy, 4, false), op(Nop, Zpx, 4, false), // B4
    op(Clv, Imp, 2, false), op(Lda, Absy, 4, true), op(Tsx, Imp, 2, false), op(Nop, Absy, 4, true), // B8
    op(Ldy, Absx, 4, true), op(Lda, Absx, 4, true), op(Ldx, Absy, 4, true), op(Nop, Absx, 4, true), // BC
    op(Cpy, Imm, 2, false), op(Cmp, Indx, 6, false), op(Nop, Imm, 2, false), op(Nop, Indx, 6, false), // C0
    op(Cpy, Zp, 3, false), op(Cmp, Zp, 3, false), op(Dec, Zp, 5, false), op(Nop, Zp, 3, false), // C4
    op(Iny, Imp, 2, false), op(Cmp, Imm, 2, false), op(Dex, Imp, 2, false), op(Nop, Imm, 2, false), // C8
    op(Cpy, Abs, 4, false), op(Cmp, Abs, 4, false), op(Dec, Abs, 6, false), op(Nop, Abs, 4, false), // CC
    op(Bne, Rel, 2, false), op(Cmp, Indy, 5, true), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // D0
    op(Nop, Zpx, 4, false), op(Cmp, Zpx, 4, false), op(Dec, Zpx, 6, false), op(Nop, Zpx, 4, false), // D4
    op(Cld, Imp, 2, false), op(Cmp, Absy, 4, true), op(Nop, Imp, 2, false), op(Nop, Absy, 4, true), // D8
    op(Nop, Absx, 4, true), op(Cmp, Absx, 4, true), op(Dec, Absx, 7, false), op(Nop, Absx, 4, true), // DC
    op(Cpx, Imm, 2, false), op(Sbc, Indx, 6, false), op(Nop, Imm, 2, false), op(Nop, Indx, 6, false), // E0
    op(Cpx, Zp, 3, false), op(Sbc, Zp, 3, false), op(Inc, Zp, 5, false), op(Nop, Zp, 3, false), // E4
    op(Inx, Imp, 2, false), op(Sbc, Imm, 2, false), op(Nop, Imp, 2, false), op(Nop, Imm, 2, false), // E8
    op(Cpx, Abs, 4, false), op(Sbc, Abs, 4, false), op(Inc, Abs, 6, false), op(Nop, Abs, 4, false), // EC
    op(Beq, Rel, 2, false), op(Sbc, Indy, 5, true), op(Jam, Imp, 2, false), op(Nop, Indy, 5, true), // F0
    op(Nop, Zpx, 4, false), op(Sbc, Zpx, 4, false), op(Inc, Zpx, 6, false), op(Nop, Zpx, 4, false), // F4
    op(Sed, Imp, 2, false), op(Sbc, Absy, 4, true), op(Nop, Imp, 2, false), op(Nop, Absy, 4, true), // F8
    op(Nop, Absx, 4, true), op(Sbc, Absx, 4, true), op(Inc, Absx, 7, false), op(Nop, Absx, 4, true), // FC
];

/// Returns the length in bytes of the instruction starting with `opcode`.
pub fn instruction_length(opcode: u8) -> u16 {
    1 + OPCODES[opcode as usize].mode.operand_len()
}

/// Disassembles the instruction at `addr` without side effects.
///
/// Returns the instruction text and the address of the following instruction.
pub fn disassemble<B: CoprocBus + ?Sized>(bus: &mut B, addr: u16) -> (String, u16) {
    let opcode = bus.debug_read(addr);
    let info = OPCODES[opcode as usize];
    let lo = bus.debug_read(addr.wrapping_add(1));
    let hi = bus.debug_read(addr.wrapping_add(2));
    let word = u16::from_le_bytes([lo, hi]);
    let next = addr.wrapping_add(instruction_length(opcode));
    let mut text = format!("{:?}", info.instr).to_uppercase();
    let _ = match info.mode {
        Imp => Ok(()),
        Acc => write!(text, " A"),
        Imm => write!(text, " #${:02X}", lo),
        Zp => write!(text, " ${:02X}", lo),
        Zpx => write!(text, " ${:02X},X", lo),
        Zpy => write!(text, " ${:02X},Y", lo),
        Abs => write!(text, " ${:04X}", word),
        Absx => write!(text, " ${:04X},X", word),
        Absy => write!(text, " ${:04X},Y", word),
        Ind => write!(text, " (${:04X})", word),
        Indx => write!(text, " (${:02X},X)", lo),
        Indy => write!(text, " (${:02X}),Y", lo),
        Rel => write!(text, " ${:04X}", next.wrapping_add(lo as i8 as u16)),
    };
    (text, next)
}

impl Coproc6502 {
    #[inline]
    fn fetch<B: CoprocBus>(&mut self, bus: &mut B) -> u8 {
        let v = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        v
    }

    #[inline]
    fn fetch_word<B: CoprocBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch(bus);
        let hi = self.fetch(bus);
        u16::from_le_bytes([lo, hi])
    }

    #[inline]
    fn set_nz(&mut self, v: u8) {
        self.p.set(StatusFlags::Z, v == 0);
        self.p.set(StatusFlags::N, v & 0x80 != 0);
    }

    fn operand_addr<B: CoprocBus>(&mut self, bus: &mut B, info: OpInfo, cycles: &mut u32) -> u16 {
        let indexed = |base: u16, index: u8, cycles: &mut u32| {
            let addr = base.wrapping_add(index as u16);
            if info.page_penalty && (addr ^ base) & 0xFF00 != 0 {
                *cycles += 1;
            }
            addr
        };
        match info.mode {
            Imm => {
                let addr = self.pc;
                self.pc = self.pc.wrapping_add(1);
                addr
            }
            Zp => self.fetch(bus) as u16,
            Zpx => self.fetch(bus).wrapping_add(self.x) as u16,
            Zpy => self.fetch(bus).wrapping_add(self.y) as u16,
            Abs => self.fetch_word(bus),
            Absx => {
                let base = self.fetch_word(bus);
                indexed(base, self.x, cycles)
            }
            Absy => {
                let base = self.fetch_word(bus);
                indexed(base, self.y, cycles)
            }
            Ind => {
                let ptr = self.fetch_word(bus);
                // the high byte is fetched without carrying into the pointer's page
                let lo = bus.read(ptr);
                let hi = bus.read((ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF));
                u16::from_le_bytes([lo, hi])
            }
            Indx => {
                let zp = self.fetch(bus).wrapping_add(self.x);
                let lo = bus.read(zp as u16);
                let hi = bus.read(zp.wrapping_add(1) as u16);
                u16::from_le_bytes([lo, hi])
            }
            Indy => {
                let zp = self.fetch(bus);
                let lo = bus.read(zp as u16);
                let hi = bus.read(zp.wrapping_add(1) as u16);
                indexed(u16::from_le_bytes([lo, hi]), self.y, cycles)
            }
            Imp|Acc|Rel => 0
        }
    }

    fn branch<B: CoprocBus>(&mut self, bus: &mut B, taken: bool, cycles: &mut u32) {
        let offset = self.fetch(bus) as i8;
        if taken {
            let target = self.pc.wrapping_add(offset as u16);
            *cycles += if (target ^ self.pc) & 0xFF00 != 0 { 2 } else { 1 };
            self.pc = target;
        }
    }

    fn modify<B: CoprocBus, F: FnOnce(&mut Self, u8) -> u8>(&mut self, bus: &mut B, mode: Mode, addr: u16, f: F) {
        if mode == Acc {
            let a = self.a;
            self.a = f(self, a);
        }
        else {
            let v = bus.read(addr);
            // NMOS read-modify-write cycles write the unmodified value back first
            bus.write(addr, v);
            let res = f(self, v);
            bus.write(addr, res);
        }
    }

    fn adc(&mut self, v: u8) {
        let a = self.a as u16;
        let m = v as u16;
        let c = self.p.contains(StatusFlags::C) as u16;
        let bin = a + m + c;
        if self.p.contains(StatusFlags::D) {
            let mut lo = (a & 0x0F) + (m & 0x0F) + c;
            if lo > 9 {
                lo += 6;
            }
            let mut hi = (a >> 4) + (m >> 4) + (lo > 0x0F) as u16;
            self.p.set(StatusFlags::Z, bin & 0xFF == 0);
            self.p.set(StatusFlags::N, hi & 0x08 != 0);
            self.p.set(StatusFlags::V, ((a ^ (hi << 4)) & !(a ^ m) & 0x80) != 0);
            if hi > 9 {
                hi += 6;
            }
            self.p.set(StatusFlags::C, hi > 0x0F);
            self.a = ((hi << 4) | (lo & 0x0F)) as u8;
        }
        else {
            self.p.set(StatusFlags::C, bin > 0xFF);
            self.p.set(StatusFlags::V, ((a ^ bin) & (m ^ bin) & 0x80) != 0);
            self.a = bin as u8;
            self.set_nz(self.a);
        }
    }

    fn sbc(&mut self, v: u8) {
        let a = self.a as i16;
        let m = v as i16;
        let borrow = !self.p.contains(StatusFlags::C) as i16;
        let bin = a - m - borrow;
        let res = bin as u8;
        self.p.set(StatusFlags::C, bin >= 0);
        self.p.set(StatusFlags::V, ((a ^ m) & (a ^ bin) & 0x80) != 0);
        self.set_nz(res);
        if self.p.contains(StatusFlags::D) {
            let mut lo = (a & 0x0F) - (m & 0x0F) - borrow;
            let mut hi = (a >> 4) - (m >> 4);
            if lo < 0 {
                lo -= 6;
                hi -= 1;
            }
            if hi < 0 {
                hi -= 6;
            }
            self.a = (((hi << 4) & 0xF0) | (lo & 0x0F)) as u8;
        }
        else {
            self.a = res;
        }
    }

    fn compare(&mut self, reg: u8, v: u8) {
        self.p.set(StatusFlags::C, reg >= v);
        self.set_nz(reg.wrapping_sub(v));
    }

    pub(super) fn execute<B: CoprocBus>(&mut self, bus: &mut B) -> u32 {
        let opcode = self.fetch(bus);
        let info = OPCODES[opcode as usize];
        let mut cycles = info.cycles as u32;
        let addr = self.operand_addr(bus, info, &mut cycles);
        match info.instr {
            Adc => { let v = bus.read(addr); self.adc(v) }
            Sbc => { let v = bus.read(addr); self.sbc(v) }
            And => { self.a &= bus.read(addr); self.set_nz(self.a) }
            Ora => { self.a |= bus.read(addr); self.set_nz(self.a) }
            Eor => { self.a ^= bus.read(addr); self.set_nz(self.a) }
            Lda => { self.a = bus.read(addr); self.set_nz(self.a) }
            Ldx => { self.x = bus.read(addr); self.set_nz(self.x) }
            Ldy => { self.y = bus.read(addr); self.set_nz(self.y) }
            Sta => bus.write(addr, self.a),
            Stx => bus.write(addr, self.x),
            Sty => bus.write(addr, self.y),
            Cmp => { let v = bus.read(addr); self.compare(self.a, v) }
            Cpx => { let v = bus.read(addr); self.compare(self.x, v) }
            Cpy => { let v = bus.read(addr); self.compare(self.y, v) }
            Bit => {
                let v = bus.read(addr);
                self.p.set(StatusFlags::Z, self.a & v == 0);
                self.p.set(StatusFlags::N, v & 0x80 != 0);
                self.p.set(StatusFlags::V, v & 0x40 != 0);
            }
            Asl => self.modify(bus, info.mode, addr, |cpu, v| {
                cpu.p.set(StatusFlags::C, v & 0x80 != 0);
                let r = v << 1;
                cpu.set_nz(r);
                r
            }),
            Lsr => self.modify(bus, info.mode, addr, |cpu, v| {
                cpu.p.set(StatusFlags::C, v & 0x01 != 0);
                let r = v >> 1;
                cpu.set_nz(r);
                r
            }),
            Rol => self.modify(bus, info.mode, addr, |cpu, v| {
                let c = cpu.p.contains(StatusFlags::C) as u8;
                cpu.p.set(StatusFlags::C, v & 0x80 != 0);
                let r = (v << 1) | c;
                cpu.set_nz(r);
                r
            }),
            Ror => self.modify(bus, info.mode, addr, |cpu, v| {
                let c = (cpu.p.contains(StatusFlags::C) as u8) << 7;
                cpu.p.set(StatusFlags::C, v & 0x01 != 0);
                let r = (v >> 1) | c;
                cpu.set_nz(r);
                r
            }),
            Inc => self.modify(bus, info.mode, addr, |cpu, v| {
                let r = v.wrapping_add(1);
                cpu.set_nz(r);
                r
            }),
            Dec => self.modify(bus, info.mode, addr, |cpu, v| {
                let r = v.wrapping_sub(1);
                cpu.set_nz(r);
                r
            }),
            Inx => { self.x = self.x.wrapping_add(1); self.set_nz(self.x) }
            Iny => { self.y = self.y.wrapping_add(1); self.set_nz(self.y) }
            Dex => { self.x = self.x.wrapping_sub(1); self.set_nz(self.x) }
            Dey => { self.y = self.y.wrapping_sub(1); self.set_nz(self.y) }
            Tax => { self.x = self.a; self.set_nz(self.x) }
            Tay => { self.y = self.a; self.set_nz(self.y) }
            Txa => { self.a = self.x; self.set_nz(self.a) }
            Tya => { self.a = self.y; self.set_nz(self.a) }
            Tsx => { self.x = self.s; self.set_nz(self.x) }
            Txs => self.s = self.x,
            Clc => self.p.remove(StatusFlags::C),
            Cld => self.p.remove(StatusFlags::D),
            Cli => self.p.remove(StatusFlags::I),
            Clv => self.p.remove(StatusFlags::V),
            Sec => self.p.insert(StatusFlags::C),
            Sed => self.p.insert(StatusFlags::D),
            Sei => self.p.insert(StatusFlags::I),
            Bcc => self.branch(bus, !self.p.contains(StatusFlags::C), &mut cycles),
            Bcs => self.branch(bus, self.p.contains(StatusFlags::C), &mut cycles),
            Bne => self.branch(bus, !self.p.contains(StatusFlags::Z), &mut cycles),
            Beq => self.branch(bus, self.p.contains(StatusFlags::Z), &mut cycles),
            Bpl => self.branch(bus, !self.p.contains(StatusFlags::N), &mut cycles),
            Bmi => self.branch(bus, self.p.contains(StatusFlags::N), &mut cycles),
            Bvc => self.branch(bus, !self.p.contains(StatusFlags::V), &mut cycles),
            Bvs => self.branch(bus, self.p.contains(StatusFlags::V), &mut cycles),
            Pha => self.push(bus, self.a),
            Php => self.push(bus, (self.p | StatusFlags::B | StatusFlags::U).bits()),
            Pla => { self.a = self.pull(bus); self.set_nz(self.a) }
            Plp => {
                let p = self.pull(bus);
                self.p = (StatusFlags::from_bits_retain(p) | StatusFlags::U) - StatusFlags::B;
            }
            Jmp => self.pc = addr,
            Jsr => {
                let [lo, hi] = self.pc.wrapping_sub(1).to_le_bytes();
                self.push(bus, hi);
                self.push(bus, lo);
                self.pc = addr;
            }
            Rts => {
                let lo = self.pull(bus);
                let hi = self.pull(bus);
                self.pc = u16::from_le_bytes([lo, hi]).wrapping_add(1);
            }
            Rti => {
                let p = self.pull(bus);
                self.p = (StatusFlags::from_bits_retain(p) | StatusFlags::U) - StatusFlags::B;
                let lo = self.pull(bus);
                let hi = self.pull(bus);
                self.pc = u16::from_le_bytes([lo, hi]);
            }
            Brk => {
                self.pc = self.pc.wrapping_add(1);
                return self.interrupt(bus, IRQ_VECTOR, true)
            }
            Nop => {
                if !matches!(info.mode, Imp|Acc|Imm) {
                    bus.read(addr);
                }
            }
            Jam => {
                self.pc = self.pc.wrapping_sub(1);
                self.jammed = true;
                warn!("6502 halted by opcode {:02X} at {:04X}", opcode, self.pc);
            }
        }
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rom(Vec<u8>);

    impl CoprocBus for Rom {
        fn read(&mut self, addr: u16) -> u8 { self.0.get(addr as usize).copied().unwrap_or(0xFF) }
        fn write(&mut self, _addr: u16, _value: u8) {}
        fn debug_read(&mut self, addr: u16) -> u8 { self.read(addr) }
    }

    #[test]
    fn opcode_table_works() {
        let documented = OPCODES.iter().enumerate()
            .filter(|(code, info)| info.instr != Jam && !(info.instr == Nop && *code != 0xEA))
            .count();
        assert_eq!(documented, 151);
        assert_eq!(OPCODES.iter().filter(|info| info.instr == Jam).count(), 12);
        assert_eq!(instruction_length(0x20), 3);
        assert_eq!(instruction_length(0xA9), 2);
        assert_eq!(instruction_length(0x60), 1);
        assert_eq!(instruction_length(0x1C), 3);
    }

    #[test]
    fn disassemble_works() {
        let mut rom = Rom(vec![0xA9, 0x10, 0x9D, 0x00, 0x08, 0xD0, 0xF9, 0x6C, 0xFC, 0xFF, 0xB1, 0x80]);
        let mut addr = 0;
        let mut lines = Vec::new();
        while (addr as usize) < rom.0.len() {
            let (text, next) = disassemble(&mut rom, addr);
            lines.push(text);
            addr = next;
        }
        assert_eq!(lines, ["LDA #$10", "STA $0800,X", "BNE $0000", "JMP ($FFFC)", "LDA ($80),Y"]);
    }
}
