/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The **MOS 6522** Versatile Interface Adapter.
//!
//! The chip keeps its timers lazily: counters are brought up to date from the scheduler's time
//! only when observed or when a scheduled update fires.
//!
//! Changes of the packed output and of the IRQ line are queued as [ViaEvent]s in the order they
//! happen and must be drained by the owner with [Via6522::take_events] after each access.
use core::fmt::Write;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use atarusty_core::clock::{EventHandle, OwnerId, Scheduler, Ticks};

/// Packed output: port A in bits 0-7, port B in bits 8-15.
pub const OUTPUT_CA2: u32 = 0x10000;
pub const OUTPUT_CB2: u32 = 0x20000;

/// An enumeration of the 6522 registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ViaRegister {
    Orb     =  0,
    Ora     =  1,
    Ddrb    =  2,
    Ddra    =  3,
    T1CL    =  4,
    T1CH    =  5,
    T1LL    =  6,
    T1LH    =  7,
    T2CL    =  8,
    T2CH    =  9,
    Sr      = 10,
    Acr     = 11,
    Pcr     = 12,
    Ifr     = 13,
    Ier     = 14,
    OraNh   = 15,
}

pub const IF_CA2: u8 = 0x01;
pub const IF_CA1: u8 = 0x02;
pub const IF_SR:  u8 = 0x04;
pub const IF_CB2: u8 = 0x08;
pub const IF_CB1: u8 = 0x10;
pub const IF_T2:  u8 = 0x20;
pub const IF_T1:  u8 = 0x40;

/// Scheduler event ids relative to the base given to [Via6522::new].
const EV_CA2_ASSERT: u32 = 0;
const EV_CA2_DEASSERT: u32 = 1;
const EV_CB2_ASSERT: u32 = 2;
const EV_CB2_DEASSERT: u32 = 3;
const EV_T1_UPDATE: u32 = 4;
const EV_T2_UPDATE: u32 = 5;
/// The number of event ids reserved by a [Via6522].
pub const VIA_EVENT_COUNT: u32 = 6;

/// A notification produced by the VIA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViaEvent {
    /// The packed output changed to the given value.
    OutputChanged(u32),
    /// The IRQ line changed.
    Interrupt(bool),
}

/// The architectural state of the chip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct ViaState {
    pub ira: u8,
    pub irb: u8,
    pub ora: u8,
    pub orb: u8,
    pub ddra: u8,
    pub ddrb: u8,
    pub t1l: u16,
    pub t1c: u16,
    pub t2l: u16,
    pub t2c: u16,
    pub sr: u8,
    pub acr: u8,
    pub pcr: u8,
    pub ifr: u8,
    pub ier: u8,
}

#[derive(Debug)]
pub struct Via6522 {
    owner: OwnerId,
    event_base: u32,
    ira: u8,
    irb: u8,
    ora: u8,
    orb: u8,
    ddra: u8,
    ddrb: u8,
    port_a_input: u8,
    port_b_input: u8,
    t1c: u16,
    t1l: u16,
    t1_last_update: Ticks,
    t1_underflow: bool,
    t2c: u16,
    t2l: u16,
    t2_last_update: Ticks,
    t2_armed: bool,
    sr: u8,
    acr: u8,
    pcr: u8,
    ifr: u8,
    ier: u8,
    timer_pb7: u8,
    timer_pb7_mask: u8,
    ca1_input: bool,
    ca2_input: bool,
    cb1_input: bool,
    cb2_input: bool,
    ca2: bool,
    cb2: bool,
    irq_state: bool,
    current_output: u32,
    ev_ca2: Option<EventHandle>,
    ev_cb2: Option<EventHandle>,
    ev_t1: Option<EventHandle>,
    ev_t2: Option<EventHandle>,
    events: Vec<ViaEvent>,
}

impl Via6522 {
    /// Creates the chip. Its scheduler events are posted for `owner` using the ids
    /// `event_base..event_base + VIA_EVENT_COUNT`.
    pub fn new(owner: OwnerId, event_base: u32) -> Self {
        Via6522 {
            owner, event_base,
            ira: 0xFF, irb: 0xFF, ora: 0, orb: 0, ddra: 0, ddrb: 0,
            port_a_input: 0xFF, port_b_input: 0xFF,
            t1c: 0, t1l: 0, t1_last_update: 0, t1_underflow: false,
            t2c: 0, t2l: 0, t2_last_update: 0, t2_armed: false,
            sr: 0, acr: 0, pcr: 0, ifr: 0, ier: 0,
            timer_pb7: 0xFF, timer_pb7_mask: 0,
            ca1_input: true, ca2_input: true, cb1_input: true, cb2_input: true,
            ca2: true, cb2: true,
            irq_state: false,
            current_output: 0x3FFFF,
            ev_ca2: None, ev_cb2: None, ev_t1: None, ev_t2: None,
            events: Vec::new(),
        }
    }
    /// Returns `true` if the event id belongs to this chip.
    pub fn owns_event(&self, owner: OwnerId, id: u32) -> bool {
        owner == self.owner && id >= self.event_base && id < self.event_base + VIA_EVENT_COUNT
    }

    pub fn reset(&mut self, sched: &mut Scheduler) {
        self.ira = self.port_a_input;
        self.irb = self.port_b_input;
        self.orb = 0;
        self.ora = 0;
        self.ddrb = 0;
        self.ddra = 0;
        self.t1c = 0;
        self.t1l = 0;
        self.t2c = 0;
        self.t2l = 0;
        self.sr = 0;
        self.acr = 0;
        self.pcr = 0;
        self.ifr = 0;
        self.ier = 0;
        self.timer_pb7 = 0xFF;
        self.timer_pb7_mask = 0;
        self.ca2 = true;
        self.cb2 = true;
        self.t1_underflow = false;
        self.t2_armed = false;
        self.irq_state = false;
        self.events.push(ViaEvent::Interrupt(false));
        sched.unset_event(&mut self.ev_ca2);
        sched.unset_event(&mut self.ev_cb2);
        sched.unset_event(&mut self.ev_t1);
        sched.unset_event(&mut self.ev_t2);
        self.t1_last_update = sched.now();
        self.t2_last_update = sched.now();
        self.update_output();
    }
    /// Drains notifications produced since the previous call.
    pub fn take_events(&mut self) -> Vec<ViaEvent> {
        core::mem::take(&mut self.events)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }
    /// Returns the packed output.
    pub fn output(&self) -> u32 {
        self.current_output
    }

    pub fn is_irq_asserted(&self) -> bool {
        self.irq_state
    }

    pub fn set_port_a_input(&mut self, val: u8, mask: u8) {
        let val = self.port_a_input ^ ((self.port_a_input ^ val) & mask);
        if self.port_a_input == val {
            return
        }
        self.port_a_input = val;
        if self.acr & 0x01 == 0 {
            self.ira = val;
        }
    }

    pub fn set_port_b_input(&mut self, val: u8, mask: u8) {
        let val = self.port_b_input ^ ((self.port_b_input ^ val) & mask);
        if self.port_b_input == val {
            return
        }
        self.port_b_input = val;
        if self.acr & 0x02 == 0 {
            self.irb = val;
        }
    }

    pub fn set_ca1_input(&mut self, sched: &mut Scheduler, state: bool) {
        if self.ca1_input == state {
            return
        }
        self.ca1_input = state;
        // PCR bit 0 selects the active edge
        if (self.pcr & 0x01 != 0) == state {
            self.set_if(sched, IF_CA1);
        }
        if self.pcr & 0x0E == 0x08 {
            sched.set_event(1, self.owner, self.event_base + EV_CA2_DEASSERT, &mut self.ev_ca2);
        }
    }

    pub fn set_ca2_input(&mut self, sched: &mut Scheduler, state: bool) {
        if self.ca2_input == state {
            return
        }
        self.ca2_input = state;
        let mode = (self.pcr >> 1) & 7;
        if mode < 4 && (mode & 2 != 0) == state {
            self.set_if(sched, IF_CA2);
        }
    }

    pub fn set_cb1_input(&mut self, sched: &mut Scheduler, state: bool) {
        if self.cb1_input == state {
            return
        }
        self.cb1_input = state;
        if (self.pcr & 0x10 != 0) == state {
            self.set_if(sched, IF_CB1);
        }
        if self.pcr & 0xE0 == 0x80 {
            sched.set_event(1, self.owner, self.event_base + EV_CB2_DEASSERT, &mut self.ev_cb2);
        }
    }

    pub fn set_cb2_input(&mut self, sched: &mut Scheduler, state: bool) {
        if self.cb2_input == state {
            return
        }
        self.cb2_input = state;
        let mode = self.pcr >> 5;
        if mode < 4 && (mode & 2 != 0) == state {
            self.set_if(sched, IF_CB2);
        }
    }
    /// Reads a register without side effects.
    pub fn debug_read_byte(&self, now: Ticks, reg: u8) -> u8 {
        match reg & 15 {
            0 => (self.irb & !self.ddrb).wrapping_add(self.orb & self.ddrb),
            1|15 => self.ira,
            2 => self.ddrb,
            3 => self.ddra,
            4 => self.peek_t1(now) as u8,
            5 => (self.peek_t1(now) >> 8) as u8,
            6 => self.t1l as u8,
            7 => (self.t1l >> 8) as u8,
            8 => self.peek_t2(now) as u8,
            9 => (self.peek_t2(now) >> 8) as u8,
            10 => self.sr,
            11 => self.acr,
            12 => self.pcr,
            13 => {
                let v = self.ifr & 0x7F;
                if self.ier & self.ifr != 0 { v | 0x80 } else { v }
            }
            _ => self.ier | 0x80
        }
    }

    pub fn read_byte(&mut self, sched: &mut Scheduler, reg: u8) -> u8 {
        match reg & 15 {
            0 => {
                if self.pcr & 0xE0 == 0x80 {
                    sched.set_event(1, self.owner, self.event_base + EV_CB2_ASSERT, &mut self.ev_cb2);
                }
                self.clear_if(sched, IF_CB1 | self.cb2_clear_mask());
                (self.irb & !self.ddrb).wrapping_add(self.orb & self.ddrb)
            }
            1 => {
                self.ca2_on_port_access(sched);
                self.clear_if(sched, IF_CA1 | self.ca2_clear_mask());
                self.ira
            }
            4 => {
                self.update_t1_state(sched);
                self.clear_if(sched, IF_T1);
                self.t1c as u8
            }
            5 => {
                self.update_t1_state(sched);
                (self.t1c >> 8) as u8
            }
            8 => {
                self.update_t2_state(sched.now());
                self.clear_if(sched, IF_T2);
                self.t2c as u8
            }
            9 => {
                self.update_t2_state(sched.now());
                (self.t2c >> 8) as u8
            }
            reg => self.debug_read_byte(sched.now(), reg)
        }
    }

    pub fn write_byte(&mut self, sched: &mut Scheduler, reg: u8, value: u8) {
        match reg & 15 {
            0 => {
                if self.orb != value {
                    let delta = (self.orb ^ value) & self.ddrb;
                    self.orb = value;
                    if delta != 0 {
                        self.update_output();
                    }
                }
                if self.pcr & 0xE0 == 0x80 {
                    sched.set_event(1, self.owner, self.event_base + EV_CB2_ASSERT, &mut self.ev_cb2);
                }
                self.clear_if(sched, IF_CB1 | self.cb2_clear_mask());
            }
            1|15 => {
                if self.ora != value {
                    let delta = (self.ora ^ value) & self.ddra;
                    self.ora = value;
                    if delta != 0 {
                        self.update_output();
                    }
                }
                if reg & 15 == 1 {
                    self.ca2_on_port_access(sched);
                    self.clear_if(sched, IF_CA1 | self.ca2_clear_mask());
                }
            }
            2 => {
                if self.ddrb != value {
                    let delta = !self.orb & (self.ddrb ^ value);
                    self.ddrb = value;
                    if delta != 0 {
                        self.update_output();
                    }
                }
            }
            3 => {
                if self.ddra != value {
                    let delta = !self.ora & (self.ddra ^ value);
                    self.ddra = value;
                    if delta != 0 {
                        self.update_output();
                    }
                }
            }
            4|6 => self.t1l = (self.t1l & 0xFF00) | value as u16,
            5 => {
                self.update_t1_state(sched);
                self.t1l = (self.t1l & 0x00FF) | ((value as u16) << 8);
                self.t1c = self.t1l;
                self.t1_underflow = false;
                self.t1_last_update = sched.now();
                if self.acr & 0x80 != 0 {
                    self.timer_pb7 = 0;
                    self.update_output();
                }
                else {
                    self.timer_pb7 = 0;
                }
                self.clear_if(sched, IF_T1);
                self.update_t1_event(sched);
            }
            7 => {
                self.update_t1_state(sched);
                self.t1l = (self.t1l & 0x00FF) | ((value as u16) << 8);
                self.clear_if(sched, IF_T1);
            }
            8 => self.t2l = (self.t2l & 0xFF00) | value as u16,
            9 => {
                self.t2l = (self.t2l & 0x00FF) | ((value as u16) << 8);
                self.t2c = self.t2l;
                self.t2_last_update = sched.now();
                self.t2_armed = true;
                self.clear_if(sched, IF_T2);
                self.update_t2_event(sched);
            }
            10 => self.sr = value,
            11 => self.write_acr(sched, value),
            12 => self.write_pcr(sched, value),
            13 => self.clear_if(sched, value & 0x7F),
            _ => self.write_ier(value),
        }
    }
    /// Handles the scheduler events of this chip.
    pub fn on_scheduled_event(&mut self, sched: &mut Scheduler, id: u32) {
        match id.wrapping_sub(self.event_base) {
            EV_CA2_ASSERT => {
                self.ev_ca2 = None;
                if self.ca2 {
                    self.ca2 = false;
                    self.update_output();
                }
            }
            EV_CA2_DEASSERT => {
                self.ev_ca2 = None;
                if !self.ca2 {
                    self.ca2 = true;
                    self.update_output();
                }
            }
            EV_CB2_ASSERT => {
                self.ev_cb2 = None;
                if self.cb2 {
                    self.cb2 = false;
                    self.update_output();
                }
            }
            EV_CB2_DEASSERT => {
                self.ev_cb2 = None;
                if !self.cb2 {
                    self.cb2 = true;
                    self.update_output();
                }
            }
            EV_T1_UPDATE => {
                self.ev_t1 = None;
                self.update_t1_event(sched);
            }
            EV_T2_UPDATE => {
                self.ev_t2 = None;
                self.update_t2_state(sched.now());
                self.update_t2_event(sched);
            }
            _ => {}
        }
    }

    pub fn save_state(&self, now: Ticks) -> ViaState {
        ViaState {
            ira: self.ira,
            irb: self.irb,
            ora: self.ora,
            orb: self.orb,
            ddra: self.ddra,
            ddrb: self.ddrb,
            t1l: self.t1l,
            t1c: self.peek_t1(now),
            t2l: self.t2l,
            t2c: self.peek_t2(now),
            sr: self.sr,
            acr: self.acr,
            pcr: self.pcr,
            ifr: self.debug_read_byte(now, 13),
            ier: self.ier,
        }
    }
    /// Resets the chip, then restores the state if given.
    pub fn load_state(&mut self, sched: &mut Scheduler, state: Option<&ViaState>) {
        self.reset(sched);
        let state = match state {
            Some(state) => state,
            None => return
        };
        self.ora = state.ora;
        self.orb = state.orb;
        self.ddra = state.ddra;
        self.ddrb = state.ddrb;
        self.t1l = state.t1l;
        self.t1c = state.t1c;
        self.t2l = state.t2l;
        self.t2c = state.t2c;
        self.sr = state.sr;
        self.acr = state.acr;
        self.timer_pb7_mask = state.acr & 0x80;
        self.ira = if state.acr & 0x01 != 0 { state.ira } else { self.port_a_input };
        self.irb = if state.acr & 0x02 != 0 { state.irb } else { self.port_b_input };
        self.write_pcr(sched, state.pcr);
        self.ifr = state.ifr & 0x7F;
        self.write_ier(state.ier | 0x80);
        self.write_ier(!state.ier & 0x7F);
        self.update_t1_event(sched);
        self.update_output();
    }
    /// Returns a human readable register dump.
    pub fn dump_status(&self, now: Ticks) -> String {
        const C2_MODES: [&str; 8] = [
            "-in auto", "-in manual", "+in auto", "+in manual",
            "out handshake", "out pulse", "-manual", "+manual"
        ];
        let output = self.current_output;
        let mut out = String::new();
        let _ = writeln!(out, "Port A:  [ORA ${:02X}] & [DDRA ${:02X}] <+> input ${:02X} => read ${:02X}, output ${:02X}",
            self.ora, self.ddra, self.port_a_input, self.debug_read_byte(now, 1), output & 0xFF);
        let _ = writeln!(out, "Port B:  [ORB ${:02X}] & [DDRB ${:02X}] <+> input ${:02X} => read ${:02X}, output ${:02X}",
            self.orb, self.ddrb, self.port_b_input, self.debug_read_byte(now, 0), (output >> 8) & 0xFF);
        let _ = writeln!(out, "ACR:     ${:02X} | {} | {}", self.acr,
            if self.acr & 0x80 != 0 { "T1 -> PB7" } else { "No PB7" },
            if self.acr & 0x40 != 0 { "T1 free-run" } else { "T1 one-shot" });
        let _ = writeln!(out, "PCR:     ${:02X} | CB2 {} | CA2 {}", self.pcr,
            C2_MODES[(self.pcr >> 5) as usize & 7], C2_MODES[(self.pcr >> 1) as usize & 7]);
        let _ = writeln!(out, "IFR:     ${:02X}", self.ifr);
        let _ = writeln!(out, "IER:     ${:02X}", self.ier);
        let _ = write!(out, "T1:      ${:04X} / latch ${:04X}", self.peek_t1(now), self.t1l);
        out
    }

    fn ca2_on_port_access(&mut self, sched: &mut Scheduler) {
        match self.pcr & 0x0E {
            0x08 => sched.set_event(1, self.owner, self.event_base + EV_CA2_ASSERT, &mut self.ev_ca2),
            0x0A => {
                // pulse mode: low for one cycle
                if self.ca2 {
                    self.ca2 = false;
                    self.update_output();
                }
                sched.set_event(1, self.owner, self.event_base + EV_CA2_DEASSERT, &mut self.ev_ca2);
            }
            _ => {}
        }
    }
    /// Independent interrupt input modes keep the C*2 flag on port accesses.
    fn ca2_clear_mask(&self) -> u8 {
        if self.pcr & 0x0A == 0x02 { 0 } else { IF_CA2 }
    }

    fn cb2_clear_mask(&self) -> u8 {
        if self.pcr & 0xA0 == 0x20 { 0 } else { IF_CB2 }
    }

    fn write_acr(&mut self, sched: &mut Scheduler, value: u8) {
        let delta = self.acr ^ value;
        if delta == 0 {
            return
        }
        self.update_t1_state(sched);
        self.update_t2_state(sched.now());
        self.acr = value;
        if delta & value & 0x01 != 0 {
            self.ira = self.port_a_input;
        }
        if delta & value & 0x02 != 0 {
            self.irb = self.port_b_input;
        }
        if delta & 0x80 != 0 {
            self.timer_pb7_mask = value & 0x80;
            self.update_t1_event(sched);
            self.update_output();
        }
    }

    fn write_pcr(&mut self, sched: &mut Scheduler, value: u8) {
        let delta = self.pcr ^ value;
        if delta == 0 {
            return
        }
        self.pcr = value;
        if delta & 0xE0 != 0 {
            match value >> 5 {
                0..=3|7 => {
                    sched.unset_event(&mut self.ev_cb2);
                    self.cb2 = true;
                }
                6 => {
                    sched.unset_event(&mut self.ev_cb2);
                    self.cb2 = false;
                }
                _ => {}
            }
        }
        if delta & 0x0E != 0 {
            match (value >> 1) & 7 {
                0..=3|7 => {
                    sched.unset_event(&mut self.ev_ca2);
                    self.ca2 = true;
                }
                6 => {
                    sched.unset_event(&mut self.ev_ca2);
                    self.ca2 = false;
                }
                _ => {}
            }
        }
        self.update_output();
    }

    fn write_ier(&mut self, value: u8) {
        let mask = value & 0x7F;
        if value & 0x80 != 0 {
            self.ier |= mask;
        }
        else {
            self.ier &= !mask;
        }
        self.update_irq();
    }

    fn update_irq(&mut self) {
        let state = self.ier & self.ifr & 0x7F != 0;
        if state != self.irq_state {
            self.irq_state = state;
            self.events.push(ViaEvent::Interrupt(state));
        }
    }

    fn set_if(&mut self, sched: &mut Scheduler, mask: u8) {
        if !self.ifr & mask == 0 {
            return
        }
        self.ifr |= mask;
        if mask & IF_CA1 != 0 && self.acr & 0x01 != 0 {
            self.ira = self.port_a_input;
        }
        if mask & IF_CB1 != 0 && self.acr & 0x02 != 0 {
            self.irb = self.port_b_input;
        }
        self.update_irq();
        if mask & IF_T1 != 0 {
            // no more updates are needed when nothing observes the underflows
            if self.acr & 0x80 == 0 {
                sched.unset_event(&mut self.ev_t1);
            }
        }
    }

    fn clear_if(&mut self, sched: &mut Scheduler, mask: u8) {
        if self.ifr & mask == 0 {
            return
        }
        self.ifr &= !mask;
        self.update_irq();
        if mask & IF_T1 != 0 {
            self.update_t1_event(sched);
        }
    }

    fn compute_output(&self) -> u32 {
        let porta = self.ora | !self.ddra;
        let mut portb = self.orb | !self.ddrb;
        portb ^= (portb ^ self.timer_pb7) & self.timer_pb7_mask;
        let mut val = ((portb as u32) << 8) | porta as u32;
        if self.ca2 {
            val |= OUTPUT_CA2;
        }
        if self.cb2 {
            val |= OUTPUT_CB2;
        }
        val
    }

    fn update_output(&mut self) {
        let val = self.compute_output();
        if self.current_output != val {
            self.current_output = val;
            self.events.push(ViaEvent::OutputChanged(val));
        }
    }
    /// Timer 1 counts N, N-1, .. 0, $FFFF and then reloads from the latch, so a latch of N
    /// gives a period of N+2 cycles. The counter reloads from the latch in one-shot mode too.
    fn advance_t1(t1c: u16, t1l: u16, underflow: bool, dt: Ticks) -> (u16, bool, Ticks) {
        let mut dt = dt;
        let mut underflows = 0;
        if !underflow {
            if dt <= t1c as Ticks {
                return (t1c - dt as u16, false, 0)
            }
            dt -= t1c as Ticks + 1;
            underflows = 1;
        }
        let period = t1l as Ticks + 2;
        underflows += dt / period;
        let rem = dt % period;
        if rem == 0 {
            (0xFFFF, true, underflows)
        }
        else {
            (t1l - (rem - 1) as u16, false, underflows)
        }
    }

    fn peek_t1(&self, now: Ticks) -> u16 {
        let dt = now.saturating_sub(self.t1_last_update);
        Self::advance_t1(self.t1c, self.t1l, self.t1_underflow, dt).0
    }

    fn update_t1_state(&mut self, sched: &mut Scheduler) {
        let now = sched.now();
        let dt = now.saturating_sub(self.t1_last_update);
        if dt == 0 {
            return
        }
        self.t1_last_update = now;
        let (t1c, underflow, underflows) = Self::advance_t1(self.t1c, self.t1l, self.t1_underflow, dt);
        self.t1c = t1c;
        self.t1_underflow = underflow;
        if underflows == 0 {
            return
        }
        if self.acr & 0x40 != 0 {
            if underflows & 1 != 0 {
                self.timer_pb7 ^= 0x80;
                if self.timer_pb7_mask != 0 {
                    self.update_output();
                }
            }
            self.set_if(sched, IF_T1);
        }
        else if self.timer_pb7 & 0x80 == 0 {
            self.timer_pb7 |= 0x80;
            if self.timer_pb7_mask != 0 {
                self.update_output();
            }
            self.set_if(sched, IF_T1);
        }
    }

    fn update_t1_event(&mut self, sched: &mut Scheduler) {
        self.update_t1_state(sched);
        let one_shot_done = self.acr & 0x40 == 0 && self.timer_pb7 & 0x80 != 0;
        let unobserved = self.acr & 0x80 == 0 && self.ifr & IF_T1 != 0;
        if one_shot_done || unobserved {
            sched.unset_event(&mut self.ev_t1);
            return
        }
        let delta = if self.t1_underflow { self.t1l as Ticks + 2 } else { self.t1c as Ticks + 1 };
        sched.set_event(delta, self.owner, self.event_base + EV_T1_UPDATE, &mut self.ev_t1);
    }

    fn peek_t2(&self, now: Ticks) -> u16 {
        if self.acr & 0x20 != 0 {
            return self.t2c
        }
        let dt = now.saturating_sub(self.t2_last_update);
        self.t2c.wrapping_sub(dt as u16)
    }

    fn update_t2_state(&mut self, now: Ticks) {
        let dt = now.saturating_sub(self.t2_last_update);
        self.t2_last_update = now;
        // pulse counting mode: PB6 pulses are not modelled
        if self.acr & 0x20 != 0 || dt == 0 {
            return
        }
        if self.t2_armed && dt > self.t2c as Ticks {
            self.t2_armed = false;
            self.ifr |= IF_T2;
            self.update_irq();
        }
        self.t2c = self.t2c.wrapping_sub(dt as u16);
    }

    fn update_t2_event(&mut self, sched: &mut Scheduler) {
        if self.t2_armed && self.acr & 0x20 == 0 {
            let delta = self.t2c as Ticks + 1;
            sched.set_event(delta, self.owner, self.event_base + EV_T2_UPDATE, &mut self.ev_t2);
        }
        else {
            sched.unset_event(&mut self.ev_t2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: OwnerId = OwnerId(9);

    fn setup() -> (Via6522, Scheduler) {
        let mut sched = Scheduler::new();
        let mut via = Via6522::new(OWNER, 100);
        via.reset(&mut sched);
        via.take_events();
        (via, sched)
    }

    fn run(via: &mut Via6522, sched: &mut Scheduler, limit: Ticks) {
        while let Some(ev) = sched.run_next(limit) {
            assert!(via.owns_event(ev.owner, ev.id));
            via.on_scheduled_event(sched, ev.id);
        }
    }

    #[test]
    fn output_change_notifications_work() {
        let (mut via, mut sched) = setup();
        assert_eq!(via.output(), 0x3FFFF);
        via.write_byte(&mut sched, 0, 0x00);
        assert!(!via.has_events());
        via.write_byte(&mut sched, 2, 0x0F);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x3F0FF)]);
        via.write_byte(&mut sched, 0, 0x05);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x3F5FF)]);
        // PCR CB2 manual low
        via.write_byte(&mut sched, 12, 0xC0);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x1F5FF)]);
        assert_eq!(via.read_byte(&mut sched, 0), 0xF5);
        via.set_port_b_input(0x30, 0xF0);
        assert_eq!(via.read_byte(&mut sched, 0), 0x35);
    }

    #[test]
    fn ca1_edge_sets_flag_and_irq() {
        let (mut via, mut sched) = setup();
        via.write_byte(&mut sched, 14, 0x80 | IF_CA1);
        assert!(!via.has_events());
        // negative edge by default
        via.set_ca1_input(&mut sched, false);
        assert_eq!(via.take_events(), [ViaEvent::Interrupt(true)]);
        assert_eq!(via.read_byte(&mut sched, 13), 0x80 | IF_CA1);
        via.set_ca1_input(&mut sched, true);
        assert!(!via.has_events());
        via.read_byte(&mut sched, 1);
        assert_eq!(via.take_events(), [ViaEvent::Interrupt(false)]);
        assert_eq!(via.read_byte(&mut sched, 13), 0);
    }

    #[test]
    fn ca2_handshake_works() {
        let (mut via, mut sched) = setup();
        via.write_byte(&mut sched, 12, 0x08);
        via.take_events();
        via.read_byte(&mut sched, 1);
        assert!(!via.has_events());
        run(&mut via, &mut sched, 1);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x3FFFF & !OUTPUT_CA2)]);
        via.set_ca1_input(&mut sched, false);
        run(&mut via, &mut sched, 2);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x3FFFF)]);
    }

    #[test]
    fn timer1_one_shot_works() {
        let (mut via, mut sched) = setup();
        via.write_byte(&mut sched, 14, 0x80 | IF_T1);
        via.write_byte(&mut sched, 4, 10);
        via.write_byte(&mut sched, 5, 0);
        assert_eq!(via.read_byte(&mut sched, 4), 10);
        run(&mut via, &mut sched, 10);
        assert!(!via.is_irq_asserted());
        assert_eq!(via.read_byte(&mut sched, 5), 0);
        run(&mut via, &mut sched, 11);
        assert!(via.is_irq_asserted());
        assert_eq!(via.take_events(), [ViaEvent::Interrupt(true)]);
        // reading T1CL acknowledges, the one-shot does not fire again
        via.read_byte(&mut sched, 4);
        assert_eq!(via.take_events(), [ViaEvent::Interrupt(false)]);
        run(&mut via, &mut sched, 100);
        assert!(!via.is_irq_asserted());
        assert_eq!(sched.pending_count(), 0);
    }

    #[test]
    fn timer1_free_run_toggles_pb7() {
        let (mut via, mut sched) = setup();
        via.write_byte(&mut sched, 11, 0xC0);
        via.take_events();
        via.write_byte(&mut sched, 4, 4);
        via.write_byte(&mut sched, 5, 0);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x37FFF)]);
        // underflows at 5, 11, 17
        run(&mut via, &mut sched, 5);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x3FFFF)]);
        run(&mut via, &mut sched, 11);
        assert_eq!(via.take_events(), [ViaEvent::OutputChanged(0x37FFF)]);
        assert_eq!(via.debug_read_byte(sched.now(), 4), 0xFF);
        sched.advance_to(12);
        assert_eq!(via.debug_read_byte(sched.now(), 4), 4);
        assert!(via.debug_read_byte(sched.now(), 13) & IF_T1 != 0);
    }

    #[test]
    fn timer2_one_shot_works() {
        let (mut via, mut sched) = setup();
        via.write_byte(&mut sched, 14, 0x80 | IF_T2);
        via.write_byte(&mut sched, 8, 3);
        via.write_byte(&mut sched, 9, 0);
        run(&mut via, &mut sched, 3);
        assert!(!via.is_irq_asserted());
        run(&mut via, &mut sched, 4);
        assert!(via.is_irq_asserted());
        via.read_byte(&mut sched, 8);
        assert!(!via.is_irq_asserted());
        run(&mut via, &mut sched, 70000);
        assert!(!via.is_irq_asserted());
    }

    #[test]
    fn state_round_trip_restores_registers() {
        let (mut via, mut sched) = setup();
        via.write_byte(&mut sched, 3, 0xF0);
        via.write_byte(&mut sched, 1, 0xA0);
        via.write_byte(&mut sched, 14, 0x80 | IF_CB1);
        via.write_byte(&mut sched, 12, 0x10);
        let state = via.save_state(sched.now());
        let mut other = Via6522::new(OWNER, 100);
        other.load_state(&mut sched, Some(&state));
        assert_eq!(other.save_state(sched.now()), state);
        assert_eq!(other.output(), via.output());
        assert!(via.dump_status(sched.now()).contains("ORA $A0"));
    }
}
