/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The **WD1770** floppy disk controller.
//!
//! The controller runs on the scheduler of its owner. The disk rotates continuously from the
//! moment the controller is created; the angular position is derived from the scheduler's time,
//! so sector and index timing need no per-revolution bookkeeping.
//!
//! Changes of the DRQ and IRQ lines, step pulses and motor requests are queued as [FdcEvent]s
//! and must be drained by the owner with [Fdc::take_events] after each interaction.
use core::fmt::Write;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::{EventHandle, OwnerId, Scheduler, Ticks};

use crate::disk::{DiskGeometry, SharedDiskInterface};

pub const STATUS_BUSY:        u8 = 0x01;
/// Index in type I status, DRQ otherwise.
pub const STATUS_INDEX_DRQ:   u8 = 0x02;
/// Track 0 in type I status, lost data otherwise.
pub const STATUS_TRACK0_LOST: u8 = 0x04;
pub const STATUS_CRC_ERROR:   u8 = 0x08;
/// Seek error in type I status, record not found otherwise.
pub const STATUS_RNF:         u8 = 0x10;
/// Spin-up complete in type I status, record type otherwise.
pub const STATUS_SPIN_UP:     u8 = 0x20;
pub const STATUS_WRITE_PROT:  u8 = 0x40;
pub const STATUS_MOTOR_ON:    u8 = 0x80;

/// Scheduler event ids relative to the base given to [Fdc::new].
const EV_STATE: u32 = 0;
const EV_INDEX: u32 = 1;
/// The number of event ids used by the controller.
pub const FDC_EVENT_COUNT: u32 = 2;

const STEP_RATES_MS: [f64; 4] = [6.0, 12.0, 20.0, 30.0];
const SETTLE_MS: f64 = 30.0;
const SPIN_UP_INDEX_COUNT: u32 = 6;
const MOTOR_OFF_INDEX_COUNT: u32 = 9;
const SEARCH_REVOLUTIONS: Ticks = 5;
const RESTORE_STEP_LIMIT: u32 = 255;
/// The number of byte times between the end of an ID field and the first data byte.
const ID_TO_DATA_BYTES: Ticks = 30;
/// The number of byte times the host has to supply the first byte of a write.
const WRITE_DRQ_WINDOW_BYTES: Ticks = 9;

/// How the two sides of a double sided disk are laid out in a linear image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SideMapping {
    /// Side 2 tracks are stored in reverse order after side 1 (XF551).
    Side2Reversed,
    /// Side 2 tracks are stored in order after side 1 (ATR8000).
    Side2Forward,
    /// Like [SideMapping::Side2Reversed], but off by one track (Percom).
    Side2ReversedOffByOne,
}

impl Default for SideMapping {
    fn default() -> Self {
        SideMapping::Side2Reversed
    }
}

impl SideMapping {
    /// Maps a physical track on the second side to a linear image track.
    pub fn second_side_track(self, phys: u32, tracks: u32) -> u32 {
        match self {
            SideMapping::Side2Reversed => (2 * tracks).saturating_sub(1 + phys),
            SideMapping::Side2Forward => tracks + phys,
            SideMapping::Side2ReversedOffByOne => tracks + (tracks - phys % tracks) % tracks
        }
    }
}

/// A notification from the controller to its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdcEvent {
    /// A step pulse, towards the hub if `true`.
    Step(bool),
    /// The motor-on output changed.
    MotorChange(bool),
    DrqChange(bool),
    IrqChange(bool),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommandType {
    TypeI,
    TypeII,
    TypeIII,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    SpinUp,
    TypeIStep,
    TypeIVerify,
    TypeIIStart,
    SearchSector,
    ReadData,
    ReadCrc,
    WriteFirst,
    WriteData,
    WriteCrc,
    ReadAddress,
    ReadTrack,
    WriteTrackFirst,
    WriteTrack,
    Complete,
}

/// The WD1770 floppy disk controller.
pub struct Fdc {
    owner: OwnerId,
    event_base: u32,
    hz: f64,
    status: u8,
    track: u8,
    sector: u8,
    data: u8,
    command: u8,
    command_type: CommandType,
    drq: bool,
    irq: bool,
    phase: Phase,
    phase_after_spin_up: Phase,
    state_event: Option<EventHandle>,
    index_event: Option<EventHandle>,
    motor_on: bool,
    motor_running: bool,
    motor_idle_indexes: u32,
    spin_up_remaining: u32,
    head_half_track: u32,
    track0: bool,
    step_inward: bool,
    step_count: u32,
    side: bool,
    mfm: bool,
    rpm: f64,
    period_factor: f64,
    double_clock: bool,
    side_mapping: SideMapping,
    drive_tracks: u32,
    auto_index_enabled: bool,
    auto_index_connected: bool,
    manual_index: bool,
    index_line: bool,
    irq_on_index: bool,
    accurate_timing: bool,
    disk: Option<SharedDiskInterface>,
    disk_present: bool,
    buffer: Vec<u8>,
    xfer_pos: usize,
    xfer_lsn: Option<u32>,
    address_rotor: u32,
    events: Vec<FdcEvent>,
}

impl Fdc {
    /// Creates a controller whose scheduler runs at `hz` cycles per second.
    pub fn new(owner: OwnerId, event_base: u32, hz: f64) -> Self {
        Fdc {
            owner,
            event_base,
            hz,
            status: 0,
            track: 0,
            sector: 1,
            data: 0,
            command: 0,
            command_type: CommandType::TypeI,
            drq: false,
            irq: false,
            phase: Phase::Idle,
            phase_after_spin_up: Phase::Idle,
            state_event: None,
            index_event: None,
            motor_on: false,
            motor_running: false,
            motor_idle_indexes: 0,
            spin_up_remaining: 0,
            head_half_track: 0,
            track0: true,
            step_inward: true,
            step_count: 0,
            side: false,
            mfm: false,
            rpm: 300.0,
            period_factor: 1.0,
            double_clock: false,
            side_mapping: SideMapping::default(),
            drive_tracks: 40,
            auto_index_enabled: false,
            auto_index_connected: false,
            manual_index: false,
            index_line: false,
            irq_on_index: false,
            accurate_timing: false,
            disk: None,
            disk_present: false,
            buffer: Vec::new(),
            xfer_pos: 0,
            xfer_lsn: None,
            address_rotor: 0,
            events: Vec::new(),
        }
    }
    /// Returns `true` if the scheduler event belongs to this controller.
    pub fn owns_event(&self, owner: OwnerId, id: u32) -> bool {
        owner == self.owner && id.wrapping_sub(self.event_base) < FDC_EVENT_COUNT
    }
    /// Drains the queued notifications.
    pub fn take_events(&mut self) -> Vec<FdcEvent> {
        core::mem::take(&mut self.events)
    }

    pub fn drq(&self) -> bool {
        self.drq
    }

    pub fn irq(&self) -> bool {
        self.irq
    }

    pub fn is_busy(&self) -> bool {
        self.status & STATUS_BUSY != 0
    }

    pub fn is_motor_on(&self) -> bool {
        self.motor_on
    }
    /// Returns the head position in half tracks.
    pub fn current_track(&self) -> u32 {
        self.head_half_track
    }

    pub fn reset(&mut self, sched: &mut Scheduler) {
        sched.unset_event(&mut self.state_event);
        self.phase = Phase::Idle;
        self.status = 0;
        self.command = 0x03;
        self.command_type = CommandType::TypeI;
        self.sector = 1;
        self.irq_on_index = false;
        self.set_drq(false);
        self.set_irq(false);
        if self.motor_on {
            self.motor_on = false;
            self.events.push(FdcEvent::MotorChange(false));
        }
        self.update_auto_index(sched);
    }

    pub fn set_disk_interface(&mut self, disk: Option<SharedDiskInterface>) {
        self.disk = disk;
    }
    /// Sets whether a disk is present in the selected drive.
    pub fn set_disk_present(&mut self, sched: &mut Scheduler, present: bool) {
        self.disk_present = present;
        self.update_auto_index(sched);
    }
    /// Sets whether the spindle of the selected drive is turning.
    pub fn set_motor_running(&mut self, sched: &mut Scheduler, running: bool) {
        if self.motor_running != running {
            self.motor_running = running;
            self.update_auto_index(sched);
        }
    }

    pub fn set_accurate_timing(&mut self, enabled: bool) {
        self.accurate_timing = enabled;
    }

    pub fn set_side(&mut self, side2: bool) {
        self.side = side2;
    }
    /// Selects MFM (`true`) or FM (`false`) encoding.
    pub fn set_density(&mut self, mfm: bool) {
        self.mfm = mfm;
    }

    pub fn set_side_mapping(&mut self, mapping: SideMapping, tracks: u32) {
        self.side_mapping = mapping;
        self.drive_tracks = tracks.max(1);
    }
    /// Moves the head, for owners that track head positions per drive.
    pub fn set_current_track(&mut self, half_track: u32, track0: bool) {
        self.head_half_track = half_track;
        self.track0 = track0;
    }
    /// Sets the rotation speed and the clock: `period_factor` scales all controller timings,
    /// `double_clock` doubles the data rate.
    pub fn set_speeds(&mut self, sched: &mut Scheduler, rpm: f64, period_factor: f64, double_clock: bool) {
        self.rpm = if rpm > 0.0 { rpm } else { 300.0 };
        self.period_factor = if period_factor > 0.0 { period_factor } else { 1.0 };
        self.double_clock = double_clock;
        self.update_auto_index(sched);
    }
    /// Enables the generator of one index pulse per revolution and connects it to the index input.
    /// While disconnected the index input follows [Fdc::on_index_pulse].
    pub fn set_auto_index_pulse(&mut self, sched: &mut Scheduler, enabled: bool, connected: bool) {
        self.auto_index_enabled = enabled;
        self.auto_index_connected = connected;
        self.update_auto_index(sched);
    }
    /// Sets the level of the externally driven index input.
    pub fn on_index_pulse(&mut self, sched: &mut Scheduler, level: bool) {
        self.manual_index = level;
        if !self.auto_index_connected {
            self.set_index_line(sched, level);
        }
    }

    pub fn read_byte(&mut self, sched: &mut Scheduler, addr: u8) -> u8 {
        match addr & 3 {
            0 => {
                self.set_irq(false);
                self.status_value(sched.now())
            }
            3 => {
                self.set_drq(false);
                self.data
            }
            _ => self.debug_read_byte(sched.now(), addr)
        }
    }

    pub fn debug_read_byte(&self, now: Ticks, addr: u8) -> u8 {
        match addr & 3 {
            0 => self.status_value(now),
            1 => self.track,
            2 => self.sector,
            _ => self.data
        }
    }

    pub fn write_byte(&mut self, sched: &mut Scheduler, addr: u8, value: u8) {
        match addr & 3 {
            0 => self.write_command(sched, value),
            1 => if !self.is_busy() { self.track = value },
            2 => if !self.is_busy() { self.sector = value },
            _ => {
                self.data = value;
                self.set_drq(false);
            }
        }
    }

    pub fn on_scheduled_event(&mut self, sched: &mut Scheduler, id: u32) {
        match id.wrapping_sub(self.event_base) {
            EV_STATE => {
                self.state_event = None;
                self.run_state(sched);
            }
            EV_INDEX => {
                self.index_event = None;
                let level = !self.index_line;
                self.set_index_line(sched, level);
                self.schedule_auto_index(sched);
            }
            _ => {}
        }
    }

    pub fn dump_status(&self, now: Ticks) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Command:   {:02X} ({:?})", self.command, self.phase);
        let _ = writeln!(out, "Status:    {:02X}", self.status_value(now));
        let _ = writeln!(out, "Track:     {:02X}  Sector: {:02X}  Data: {:02X}", self.track, self.sector, self.data);
        let _ = writeln!(out, "Head:      {}{}  Side: {}  {}",
            self.head_half_track / 2,
            if self.head_half_track & 1 != 0 { ".5" } else { "" },
            if self.side { 2 } else { 1 },
            if self.mfm { "MFM" } else { "FM" });
        let _ = writeln!(out, "Motor:     {}  DRQ: {}  IRQ: {}",
            if self.motor_on { "on" } else { "off" }, self.drq, self.irq);
        out
    }

    fn status_value(&self, now: Ticks) -> u8 {
        let mut status = self.status;
        match self.command_type {
            CommandType::TypeI => {
                status &= !(STATUS_INDEX_DRQ|STATUS_TRACK0_LOST|STATUS_WRITE_PROT|STATUS_MOTOR_ON);
                if self.index_active(now) {
                    status |= STATUS_INDEX_DRQ;
                }
                if self.track0 {
                    status |= STATUS_TRACK0_LOST;
                }
                if self.is_write_protected() {
                    status |= STATUS_WRITE_PROT;
                }
            }
            _ => {
                status &= !(STATUS_INDEX_DRQ|STATUS_MOTOR_ON);
                if self.drq {
                    status |= STATUS_INDEX_DRQ;
                }
            }
        }
        if self.motor_on {
            status |= STATUS_MOTOR_ON;
        }
        status
    }

    fn index_active(&self, now: Ticks) -> bool {
        if self.auto_index_connected {
            self.is_spinning() && self.rotation_position(now) < self.index_width()
        }
        else {
            self.manual_index
        }
    }

    fn is_write_protected(&self) -> bool {
        self.disk.as_ref().map_or(false, |d| d.borrow().is_write_protected())
    }

    fn is_spinning(&self) -> bool {
        self.motor_running && self.disk_present
    }

    fn set_drq(&mut self, drq: bool) {
        if self.drq != drq {
            self.drq = drq;
            self.events.push(FdcEvent::DrqChange(drq));
        }
    }

    fn set_irq(&mut self, irq: bool) {
        if self.irq != irq {
            self.irq = irq;
            self.events.push(FdcEvent::IrqChange(irq));
        }
    }

    /* timing */

    fn scale(&self) -> f64 {
        self.period_factor / if self.double_clock { 2.0 } else { 1.0 }
    }

    fn ms_ticks(&self, ms: f64) -> Ticks {
        (ms * self.hz * self.scale() / 1000.0) as Ticks
    }

    fn rotation_ticks(&self) -> Ticks {
        ((self.hz * 60.0 / self.rpm) as Ticks).max(1)
    }

    fn index_width(&self) -> Ticks {
        (self.rotation_ticks() / 100).max(1)
    }

    fn byte_ticks(&self) -> Ticks {
        let us = if self.mfm { 32.0 } else { 64.0 };
        ((us * self.hz * self.scale() / 1_000_000.0) as Ticks).max(1)
    }

    fn track_length(&self) -> usize {
        (self.rotation_ticks() / self.byte_ticks()) as usize
    }

    fn rotation_position(&self, now: Ticks) -> Ticks {
        now % self.rotation_ticks()
    }

    fn ticks_to_angle(&self, now: Ticks, target: Ticks) -> Ticks {
        let rot = self.rotation_ticks();
        (target % rot + rot - self.rotation_position(now)) % rot
    }

    fn sector_slot(&self, spt: u32) -> Ticks {
        self.rotation_ticks() / spt.max(1) as Ticks
    }
    /// The angle of the ID field of the sector at rotational position `index`.
    fn sector_angle(&self, index: u32, spt: u32) -> Ticks {
        let slot = self.sector_slot(spt);
        index as Ticks * slot + slot / 8
    }

    fn schedule_state(&mut self, sched: &mut Scheduler, delta: Ticks, phase: Phase) {
        self.phase = phase;
        sched.set_event(delta, self.owner, self.event_base + EV_STATE, &mut self.state_event);
    }

    fn update_auto_index(&mut self, sched: &mut Scheduler) {
        if self.auto_index_enabled && self.auto_index_connected && self.is_spinning() {
            if self.index_event.is_none() {
                let now = sched.now();
                let active = self.index_active(now);
                self.set_index_line(sched, active);
                self.schedule_auto_index(sched);
            }
        }
        else {
            sched.unset_event(&mut self.index_event);
            if self.auto_index_connected {
                self.set_index_line(sched, false);
            }
            else {
                let level = self.manual_index;
                self.set_index_line(sched, level);
            }
        }
    }

    fn schedule_auto_index(&mut self, sched: &mut Scheduler) {
        let now = sched.now();
        let target = if self.index_line { self.index_width() } else { 0 };
        let mut delta = self.ticks_to_angle(now, target);
        if delta == 0 {
            delta = self.rotation_ticks();
        }
        sched.set_event(delta, self.owner, self.event_base + EV_INDEX, &mut self.index_event);
    }

    fn set_index_line(&mut self, sched: &mut Scheduler, level: bool) {
        if self.index_line == level {
            return
        }
        self.index_line = level;
        if level {
            self.on_index_edge(sched);
        }
    }

    fn on_index_edge(&mut self, sched: &mut Scheduler) {
        if self.irq_on_index {
            self.set_irq(true);
        }
        if self.phase == Phase::SpinUp {
            self.spin_up_remaining = self.spin_up_remaining.saturating_sub(1);
            if self.spin_up_remaining == 0 {
                self.status |= STATUS_SPIN_UP;
                let next = self.phase_after_spin_up;
                self.schedule_state(sched, 0, next);
            }
        }
        else if self.motor_on && !self.is_busy() {
            self.motor_idle_indexes += 1;
            if self.motor_idle_indexes >= MOTOR_OFF_INDEX_COUNT {
                debug!("FDC motor off");
                self.motor_on = false;
                self.events.push(FdcEvent::MotorChange(false));
            }
        }
    }

    /* commands */

    fn write_command(&mut self, sched: &mut Scheduler, value: u8) {
        if value & 0xF0 == 0xD0 {
            self.force_interrupt(sched, value);
            return
        }
        if self.is_busy() {
            debug!("FDC ignoring command {:02X} while busy", value);
            return
        }
        debug!("FDC command {:02X} track: {} sector: {} data: {}", value, self.track, self.sector, self.data);
        self.command = value;
        self.command_type = match value >> 4 {
            0x0..=0x7 => CommandType::TypeI,
            0x8..=0xB => CommandType::TypeII,
            _ => CommandType::TypeIII,
        };
        self.status = STATUS_BUSY;
        self.irq_on_index = false;
        self.set_drq(false);
        self.set_irq(false);
        self.motor_idle_indexes = 0;
        self.step_count = 0;
        let next = match self.command_type {
            CommandType::TypeI => Phase::TypeIStep,
            _ => Phase::TypeIIStart
        };
        if !self.motor_on {
            self.motor_on = true;
            self.events.push(FdcEvent::MotorChange(true));
            if value & 0x08 == 0 {
                self.spin_up_remaining = SPIN_UP_INDEX_COUNT;
                self.phase_after_spin_up = next;
                self.phase = Phase::SpinUp;
                return
            }
        }
        if self.command_type == CommandType::TypeI {
            self.status |= STATUS_SPIN_UP;
        }
        self.schedule_state(sched, 1, next);
    }

    fn force_interrupt(&mut self, sched: &mut Scheduler, value: u8) {
        debug!("FDC force interrupt {:02X}", value);
        if self.is_busy() {
            sched.unset_event(&mut self.state_event);
            self.phase = Phase::Idle;
            self.status &= !STATUS_BUSY;
            self.motor_idle_indexes = 0;
        }
        else {
            self.command_type = CommandType::TypeI;
        }
        self.command = value;
        self.irq_on_index = value & 0x04 != 0;
        if value & 0x08 != 0 {
            self.set_irq(true);
        }
        else {
            self.set_irq(false);
        }
    }

    fn complete(&mut self) {
        self.phase = Phase::Idle;
        self.status &= !STATUS_BUSY;
        self.motor_idle_indexes = 0;
        self.set_irq(true);
    }

    fn run_state(&mut self, sched: &mut Scheduler) {
        match self.phase {
            Phase::Idle|Phase::SpinUp => {}
            Phase::TypeIStep => self.type1_step(sched),
            Phase::TypeIVerify => self.type1_verify(sched),
            Phase::TypeIIStart => self.type23_start(sched),
            Phase::SearchSector => self.search_sector(sched),
            Phase::ReadData => self.read_data(sched),
            Phase::ReadCrc => self.read_crc(sched),
            Phase::WriteFirst => self.write_first(sched),
            Phase::WriteData => self.write_data(sched),
            Phase::WriteCrc => self.write_crc(sched),
            Phase::ReadAddress => self.read_data(sched),
            Phase::ReadTrack => self.read_data(sched),
            Phase::WriteTrackFirst => self.write_track_first(sched),
            Phase::WriteTrack => self.write_track(sched),
            Phase::Complete => self.complete(),
        }
    }

    fn step_head(&mut self, inward: bool) {
        self.step_inward = inward;
        self.events.push(FdcEvent::Step(inward));
        if inward {
            self.head_half_track += 2;
        }
        else {
            self.head_half_track = self.head_half_track.saturating_sub(2);
        }
        self.track0 = self.head_half_track == 0;
    }

    fn type1_step(&mut self, sched: &mut Scheduler) {
        let cmd = self.command;
        let step_time = self.ms_ticks(STEP_RATES_MS[(cmd & 3) as usize]);
        match cmd >> 5 {
            // restore and seek
            0 => {
                let restore = cmd & 0x10 == 0;
                if restore && self.step_count == 0 {
                    self.track = 0xFF;
                    self.data = 0;
                }
                if restore && self.track0 {
                    self.track = 0;
                }
                else if self.track != self.data {
                    if restore && self.step_count >= RESTORE_STEP_LIMIT {
                        self.status |= STATUS_RNF;
                        self.complete();
                        return
                    }
                    let inward = self.data > self.track;
                    self.track = if inward { self.track.wrapping_add(1) } else { self.track.wrapping_sub(1) };
                    self.step_count += 1;
                    self.step_head(inward);
                    self.schedule_state(sched, step_time, Phase::TypeIStep);
                    return
                }
            }
            // step, step-in, step-out
            n => {
                if self.step_count == 0 {
                    let inward = match n {
                        1 => self.step_inward,
                        2 => true,
                        _ => false
                    };
                    if cmd & 0x10 != 0 {
                        self.track = if inward { self.track.wrapping_add(1) } else { self.track.wrapping_sub(1) };
                    }
                    self.step_count = 1;
                    if !inward && self.track0 {
                        self.track = 0;
                    }
                    else {
                        self.step_head(inward);
                        self.schedule_state(sched, step_time, Phase::TypeIStep);
                        return
                    }
                }
            }
        }
        if cmd & 0x04 != 0 {
            let settle = self.ms_ticks(SETTLE_MS);
            self.schedule_state(sched, settle, Phase::TypeIVerify);
        }
        else {
            self.complete();
        }
    }

    fn type1_verify(&mut self, sched: &mut Scheduler) {
        let phys = self.head_half_track / 2;
        let found = self.head_half_track & 1 == 0 && self.track as u32 == phys && self.locate(1).is_some();
        if found {
            let delay = match self.locate_geometry() {
                Some(geo) if self.accurate_timing => {
                    let now = sched.now();
                    let index = self.next_sector_index(now, geo.sectors_per_track);
                    self.ticks_to_angle(now, self.sector_angle(index, geo.sectors_per_track))
                        + 6 * self.byte_ticks()
                }
                _ => 16 * self.byte_ticks()
            };
            self.schedule_state(sched, delay, Phase::Complete);
        }
        else {
            self.status |= STATUS_RNF;
            let timeout = SEARCH_REVOLUTIONS * self.rotation_ticks();
            self.schedule_state(sched, timeout, Phase::Complete);
        }
    }

    fn locate_geometry(&self) -> Option<DiskGeometry> {
        if !self.disk_present {
            return None
        }
        let geo = self.disk.as_ref()?.borrow().geometry()?;
        if geo.mfm == self.mfm { Some(geo) } else { None }
    }
    /// Finds the image sector under the head for a sector ID, checking the track register.
    fn locate(&self, sector: u8) -> Option<(u32, DiskGeometry)> {
        let geo = self.locate_geometry()?;
        if self.head_half_track & 1 != 0 {
            return None
        }
        let phys = self.head_half_track / 2;
        if phys >= geo.tracks || phys >= self.drive_tracks {
            return None
        }
        let vtrack = if self.side {
            if geo.sides < 2 {
                return None
            }
            self.side_mapping.second_side_track(phys, self.drive_tracks.min(geo.tracks))
        }
        else {
            phys
        };
        if sector == 0 || sector as u32 > geo.sectors_per_track {
            return None
        }
        let lsn = vtrack * geo.sectors_per_track + sector as u32 - 1;
        if lsn < geo.sector_count { Some((lsn, geo)) } else { None }
    }

    fn next_sector_index(&self, now: Ticks, spt: u32) -> u32 {
        let pos = self.rotation_position(now);
        let slot = self.sector_slot(spt);
        ((pos + slot - slot / 8) / slot) as u32 % spt.max(1)
    }

    fn type23_start(&mut self, sched: &mut Scheduler) {
        let cmd = self.command;
        if cmd & 0x04 != 0 {
            let settle = self.ms_ticks(SETTLE_MS);
            self.command &= !0x04;
            self.schedule_state(sched, settle, Phase::TypeIIStart);
            return
        }
        let writing = matches!(cmd >> 4, 0xA|0xB|0xF);
        if writing && self.is_write_protected() {
            self.status |= STATUS_WRITE_PROT;
            self.complete();
            return
        }
        match cmd >> 4 {
            0x8..=0xB => self.search_sector(sched),
            0xC => self.start_read_address(sched),
            0xE => self.start_read_track(sched),
            _ => self.start_write_track(sched)
        }
    }

    fn search_sector(&mut self, sched: &mut Scheduler) {
        let phys = self.head_half_track / 2;
        let found = if self.track as u32 == phys { self.locate(self.sector) } else { None };
        let (lsn, geo) = match found {
            Some(found) => found,
            None => {
                debug!("FDC record not found track: {} sector: {}", self.track, self.sector);
                self.status |= STATUS_RNF;
                let timeout = SEARCH_REVOLUTIONS * self.rotation_ticks();
                self.schedule_state(sched, timeout, Phase::Complete);
                return
            }
        };
        let latency = if self.accurate_timing {
            let now = sched.now();
            let angle = self.sector_angle(self.sector as u32 - 1, geo.sectors_per_track);
            self.ticks_to_angle(now, angle) + ID_TO_DATA_BYTES * self.byte_ticks()
        }
        else {
            8 * self.byte_ticks()
        };
        self.xfer_lsn = Some(lsn);
        self.xfer_pos = 0;
        self.buffer.clear();
        self.buffer.resize(geo.sector_size, 0);
        if self.command & 0x20 == 0 {
            if let Some(disk) = self.disk.as_ref() {
                if let Err(err) = disk.borrow().read_sector(lsn, &mut self.buffer) {
                    warn!("FDC read of sector {} failed: {}", lsn, err);
                }
            }
            self.schedule_state(sched, latency, Phase::ReadData);
        }
        else {
            self.set_drq(true);
            let window = WRITE_DRQ_WINDOW_BYTES * self.byte_ticks();
            self.schedule_state(sched, latency + window, Phase::WriteFirst);
        }
    }
    /// Delivers the next byte of the transfer buffer.
    fn read_data(&mut self, sched: &mut Scheduler) {
        if self.xfer_pos < self.buffer.len() {
            if self.drq {
                self.status |= STATUS_TRACK0_LOST;
            }
            self.data = self.buffer[self.xfer_pos];
            self.xfer_pos += 1;
            self.set_drq(true);
            let byte = self.byte_ticks();
            let phase = self.phase;
            self.schedule_state(sched, byte, phase);
            return
        }
        match self.phase {
            Phase::ReadData => {
                let crc = 2 * self.byte_ticks();
                self.schedule_state(sched, crc, Phase::ReadCrc);
            }
            Phase::ReadAddress => {
                self.sector = self.buffer[0];
                self.complete();
            }
            _ => self.complete()
        }
    }

    fn read_crc(&mut self, sched: &mut Scheduler) {
        self.next_or_complete(sched);
    }

    fn next_or_complete(&mut self, sched: &mut Scheduler) {
        if self.command & 0x10 != 0 {
            self.sector = self.sector.wrapping_add(1);
            self.schedule_state(sched, 1, Phase::SearchSector);
        }
        else {
            self.complete();
        }
    }

    fn write_first(&mut self, sched: &mut Scheduler) {
        if self.drq {
            self.status |= STATUS_TRACK0_LOST;
            self.set_drq(false);
            self.complete();
            return
        }
        self.buffer[0] = self.data;
        self.xfer_pos = 1;
        if self.buffer.len() > 1 {
            self.set_drq(true);
        }
        let byte = self.byte_ticks();
        self.schedule_state(sched, byte, Phase::WriteData);
    }

    fn write_data(&mut self, sched: &mut Scheduler) {
        if self.xfer_pos < self.buffer.len() {
            let value = if self.drq {
                self.status |= STATUS_TRACK0_LOST;
                0
            }
            else {
                self.data
            };
            self.buffer[self.xfer_pos] = value;
            self.xfer_pos += 1;
            if self.xfer_pos < self.buffer.len() {
                self.set_drq(true);
            }
            let byte = self.byte_ticks();
            self.schedule_state(sched, byte, Phase::WriteData);
            return
        }
        self.set_drq(false);
        if let (Some(lsn), Some(disk)) = (self.xfer_lsn, self.disk.as_ref()) {
            if let Err(err) = disk.borrow_mut().write_sector(lsn, &self.buffer) {
                warn!("FDC write of sector {} failed: {}", lsn, err);
                self.status |= STATUS_WRITE_PROT;
            }
        }
        let crc = 2 * self.byte_ticks();
        self.schedule_state(sched, crc, Phase::WriteCrc);
    }

    fn write_crc(&mut self, sched: &mut Scheduler) {
        if self.status & STATUS_WRITE_PROT != 0 {
            self.complete();
        }
        else {
            self.next_or_complete(sched);
        }
    }

    fn start_read_address(&mut self, sched: &mut Scheduler) {
        let phys = self.head_half_track / 2;
        let geo = match self.locate_geometry() {
            Some(geo) if self.head_half_track & 1 == 0 && phys < geo.tracks
                         && (!self.side || geo.sides > 1) => geo,
            _ => {
                self.status |= STATUS_RNF;
                let timeout = SEARCH_REVOLUTIONS * self.rotation_ticks();
                self.schedule_state(sched, timeout, Phase::Complete);
                return
            }
        };
        let spt = geo.sectors_per_track;
        let (index, latency) = if self.accurate_timing {
            let now = sched.now();
            let index = self.next_sector_index(now, spt);
            (index, self.ticks_to_angle(now, self.sector_angle(index, spt)) + 4 * self.byte_ticks())
        }
        else {
            self.address_rotor = (self.address_rotor + 1) % spt;
            (self.address_rotor, 8 * self.byte_ticks())
        };
        let id = [phys as u8, self.side as u8, index as u8 + 1, geo.size_code()];
        let crc = crc16_ccitt(&id_field_prefix(self.mfm), &id);
        self.buffer.clear();
        self.buffer.extend_from_slice(&id);
        self.buffer.extend_from_slice(&crc.to_be_bytes());
        self.xfer_pos = 0;
        self.schedule_state(sched, latency, Phase::ReadAddress);
    }

    fn start_read_track(&mut self, sched: &mut Scheduler) {
        self.buffer = self.render_track();
        self.xfer_pos = 0;
        let now = sched.now();
        let latency = self.ticks_to_angle(now, 0).max(1);
        self.schedule_state(sched, latency, Phase::ReadTrack);
    }

    fn start_write_track(&mut self, sched: &mut Scheduler) {
        self.set_drq(true);
        let window = 3 * self.byte_ticks();
        self.schedule_state(sched, window, Phase::WriteTrackFirst);
    }

    fn write_track_first(&mut self, sched: &mut Scheduler) {
        if self.drq {
            self.status |= STATUS_TRACK0_LOST;
            self.set_drq(false);
            self.complete();
            return
        }
        self.buffer.clear();
        self.buffer.push(self.data);
        self.xfer_pos = 1;
        self.set_drq(true);
        let now = sched.now();
        let latency = self.ticks_to_angle(now, 0).max(1);
        self.schedule_state(sched, latency, Phase::WriteTrack);
    }

    fn write_track(&mut self, sched: &mut Scheduler) {
        let length = self.track_length();
        if self.buffer.len() < length {
            let value = if self.drq {
                self.status |= STATUS_TRACK0_LOST;
                0
            }
            else {
                self.data
            };
            self.buffer.push(value);
            self.set_drq(true);
            let byte = self.byte_ticks();
            self.schedule_state(sched, byte, Phase::WriteTrack);
            return
        }
        self.set_drq(false);
        let track = core::mem::take(&mut self.buffer);
        self.commit_track(&track);
        self.complete();
    }
    /// Stores the sectors found in raw track data written by Write Track.
    fn commit_track(&mut self, track: &[u8]) {
        let disk = match self.disk.as_ref() {
            Some(disk) => disk,
            None => return
        };
        let mut pos = 0;
        let mut written = 0;
        while let Some(off) = track[pos..].iter().position(|&b| b == 0xFE) {
            let id_at = pos + off + 1;
            if id_at + 4 > track.len() {
                break
            }
            let id = &track[id_at..id_at + 4];
            let size = 128usize << (id[3] & 3);
            pos = id_at + 4;
            let mark = match track[pos..].iter().position(|&b| b == 0xFB || b == 0xF8) {
                Some(mark) if mark < 64 => pos + mark + 1,
                _ => continue
            };
            if mark + size > track.len() {
                break
            }
            if let Some((lsn, _)) = self.locate(id[2]) {
                if let Err(err) = disk.borrow_mut().write_sector(lsn, &track[mark..mark + size]) {
                    warn!("FDC format of sector {} failed: {}", lsn, err);
                }
                else {
                    written += 1;
                }
            }
            pos = mark + size;
        }
        debug!("FDC write track: {} sectors stored", written);
    }
    /// Produces the raw bytes of the track under the head.
    fn render_track(&self) -> Vec<u8> {
        let length = self.track_length();
        let gap = if self.mfm { 0x4E } else { 0xFF };
        let mut out = Vec::with_capacity(length);
        if let (Some(geo), Some(disk)) = (self.locate_geometry(), self.disk.as_ref()) {
            let phys = self.head_half_track / 2;
            let spt = geo.sectors_per_track;
            let disk = disk.borrow();
            for index in 0..spt {
                let angle_bytes = (self.sector_angle(index, spt) / self.byte_ticks()) as usize;
                while out.len() < angle_bytes {
                    out.push(gap);
                }
                let sector = index as u8 + 1;
                let id = [phys as u8, self.side as u8, sector, geo.size_code()];
                out.extend_from_slice(&id_field_prefix(self.mfm));
                out.extend_from_slice(&id);
                out.extend_from_slice(&crc16_ccitt(&id_field_prefix(self.mfm), &id).to_be_bytes());
                out.extend(core::iter::repeat(gap).take(if self.mfm { 22 } else { 11 }));
                out.extend(core::iter::repeat(0).take(if self.mfm { 12 } else { 6 }));
                let mut data = vec![0u8; geo.sector_size];
                if let Some((lsn, _)) = self.locate(sector) {
                    let _ = disk.read_sector(lsn, &mut data);
                }
                let prefix = data_field_prefix(self.mfm);
                out.extend_from_slice(&prefix);
                out.extend_from_slice(&data);
                out.extend_from_slice(&crc16_ccitt(&prefix, &data).to_be_bytes());
            }
        }
        out.resize(length, gap);
        out
    }
}

fn id_field_prefix(mfm: bool) -> Vec<u8> {
    if mfm { vec![0xA1, 0xA1, 0xA1, 0xFE] } else { vec![0xFE] }
}

fn data_field_prefix(mfm: bool) -> Vec<u8> {
    if mfm { vec![0xA1, 0xA1, 0xA1, 0xFB] } else { vec![0xFB] }
}

/// Computes the CRC-16-CCITT of an address mark prefix followed by the field data.
pub fn crc16_ccitt(prefix: &[u8], data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in prefix.iter().chain(data.iter()) {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskImage, DiskInterface, MemoryDisk};

    const HZ: f64 = 1_000_000.0;
    const OWNER: OwnerId = OwnerId(7);

    fn setup(geometry: DiskGeometry) -> (Scheduler, Fdc, SharedDiskInterface) {
        let mut sched = Scheduler::new();
        let mut fdc = Fdc::new(OWNER, 10, HZ);
        let di = DiskInterface::new_shared(0);
        let mut disk = MemoryDisk::new(geometry);
        for lsn in 0..geometry.sector_count {
            let fill = vec![(lsn & 0xFF) as u8; geometry.sector_size];
            disk.write_sector(lsn, &fill).unwrap();
        }
        disk.clear_dirty();
        di.borrow_mut().mount(Box::new(disk), "test.atr");
        fdc.set_disk_interface(Some(di.clone()));
        fdc.set_disk_present(&mut sched, true);
        fdc.set_motor_running(&mut sched, true);
        fdc.set_density(geometry.mfm);
        fdc.set_auto_index_pulse(&mut sched, true, true);
        fdc.reset(&mut sched);
        (sched, fdc, di)
    }

    fn run_for(sched: &mut Scheduler, fdc: &mut Fdc, ticks: Ticks) {
        let limit = sched.now() + ticks;
        sched.run_until(limit, |s, ev| fdc.on_scheduled_event(s, ev.id));
    }
    /// Runs until the command completes, reading bytes whenever DRQ is raised.
    fn read_all(sched: &mut Scheduler, fdc: &mut Fdc) -> Vec<u8> {
        let mut out = Vec::new();
        let limit = sched.now() + 2_000_000;
        while let Some(ev) = sched.run_next(limit) {
            fdc.on_scheduled_event(sched, ev.id);
            if fdc.drq() {
                out.push(fdc.read_byte(sched, 3));
            }
            if !fdc.is_busy() {
                break
            }
        }
        out
    }

    #[test]
    fn side_mapping_works() {
        assert_eq!(SideMapping::Side2Reversed.second_side_track(0, 40), 79);
        assert_eq!(SideMapping::Side2Reversed.second_side_track(39, 40), 40);
        assert_eq!(SideMapping::Side2Forward.second_side_track(0, 40), 40);
        assert_eq!(SideMapping::Side2Forward.second_side_track(39, 40), 79);
        assert_eq!(SideMapping::Side2ReversedOffByOne.second_side_track(0, 40), 40);
        assert_eq!(SideMapping::Side2ReversedOffByOne.second_side_track(1, 40), 79);
        assert_eq!(SideMapping::Side2ReversedOffByOne.second_side_track(39, 40), 41);
    }

    #[test]
    fn crc_works() {
        assert_eq!(crc16_ccitt(&[], b"123456789"), 0x29B1);
    }

    #[test]
    fn seek_and_restore_work() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.write_byte(&mut sched, 3, 5);
        // seek, no spin-up, 6 ms steps
        fdc.write_byte(&mut sched, 0, 0x18);
        assert!(fdc.is_busy());
        let events = fdc.take_events();
        assert_eq!(events, [FdcEvent::MotorChange(true)]);
        run_for(&mut sched, &mut fdc, 100_000);
        assert!(!fdc.is_busy());
        assert!(fdc.irq());
        assert_eq!(fdc.read_byte(&mut sched, 1), 5);
        assert_eq!(fdc.current_track(), 10);
        let steps = fdc.take_events().into_iter().filter(|e| *e == FdcEvent::Step(true)).count();
        assert_eq!(steps, 5);
        let status = fdc.read_byte(&mut sched, 0);
        assert!(!fdc.irq());
        assert_eq!(status & (STATUS_BUSY|STATUS_TRACK0_LOST|STATUS_MOTOR_ON), STATUS_MOTOR_ON);
        // restore with verify
        fdc.write_byte(&mut sched, 0, 0x0C);
        run_for(&mut sched, &mut fdc, 1_000_000);
        assert!(!fdc.is_busy());
        assert_eq!(fdc.read_byte(&mut sched, 1), 0);
        assert_eq!(fdc.current_track(), 0);
        let status = fdc.read_byte(&mut sched, 0);
        assert_eq!(status & (STATUS_TRACK0_LOST|STATUS_RNF), STATUS_TRACK0_LOST);
    }

    #[test]
    fn step_commands_work() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        // step in with update
        fdc.write_byte(&mut sched, 0, 0x58);
        run_for(&mut sched, &mut fdc, 50_000);
        assert_eq!((fdc.current_track(), fdc.read_byte(&mut sched, 1)), (2, 1));
        // step (same direction) without update
        fdc.write_byte(&mut sched, 0, 0x28);
        run_for(&mut sched, &mut fdc, 50_000);
        assert_eq!((fdc.current_track(), fdc.read_byte(&mut sched, 1)), (4, 1));
        // step out with verify fails: track register is 0, head is on 1
        fdc.write_byte(&mut sched, 0, 0x7C);
        run_for(&mut sched, &mut fdc, 50_000);
        assert!(fdc.is_busy());
        run_for(&mut sched, &mut fdc, 2_000_000);
        assert!(!fdc.is_busy());
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_RNF, STATUS_RNF);
    }

    #[test]
    fn spin_up_waits_for_index_pulses() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.write_byte(&mut sched, 0, 0x00);
        run_for(&mut sched, &mut fdc, 5 * 200_000 + 10_000);
        assert!(fdc.is_busy());
        run_for(&mut sched, &mut fdc, 200_000);
        assert!(!fdc.is_busy());
        assert_ne!(fdc.read_byte(&mut sched, 0) & STATUS_SPIN_UP, 0);
        // motor turns off after 9 idle revolutions
        run_for(&mut sched, &mut fdc, 10 * 200_000);
        assert!(!fdc.is_motor_on());
        assert!(fdc.take_events().contains(&FdcEvent::MotorChange(false)));
    }

    #[test]
    fn read_sector_works() {
        for &accurate in &[false, true] {
            let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
            fdc.set_accurate_timing(accurate);
            fdc.write_byte(&mut sched, 3, 2);
            fdc.write_byte(&mut sched, 0, 0x18);
            run_for(&mut sched, &mut fdc, 100_000);
            fdc.write_byte(&mut sched, 2, 5);
            fdc.write_byte(&mut sched, 0, 0x88);
            let data = read_all(&mut sched, &mut fdc);
            assert_eq!(data, vec![(2 * 18 + 4) as u8; 128]);
            assert_eq!(fdc.read_byte(&mut sched, 0) & 0x1F, 0);
        }
    }

    #[test]
    fn read_multiple_sectors_stops_at_end_of_track() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.write_byte(&mut sched, 2, 17);
        fdc.write_byte(&mut sched, 0, 0x98);
        let data = read_all(&mut sched, &mut fdc);
        assert_eq!(data.len(), 256);
        assert_eq!(&data[128..], &[17; 128][..]);
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_RNF, STATUS_RNF);
        assert_eq!(fdc.read_byte(&mut sched, 2), 19);
    }

    #[test]
    fn wrong_density_is_record_not_found() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.set_density(true);
        fdc.write_byte(&mut sched, 2, 1);
        fdc.write_byte(&mut sched, 0, 0x88);
        assert!(read_all(&mut sched, &mut fdc).is_empty());
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_RNF, STATUS_RNF);
    }

    #[test]
    fn lost_data_is_reported() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.write_byte(&mut sched, 2, 1);
        fdc.write_byte(&mut sched, 0, 0x88);
        run_for(&mut sched, &mut fdc, 100_000);
        assert!(!fdc.is_busy());
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_TRACK0_LOST, STATUS_TRACK0_LOST);
    }

    #[test]
    fn write_sector_works() {
        let (mut sched, mut fdc, di) = setup(DiskGeometry::double_density());
        fdc.write_byte(&mut sched, 2, 4);
        fdc.write_byte(&mut sched, 0, 0xA8);
        let limit = sched.now() + 1_000_000;
        let mut n = 0u8;
        while let Some(ev) = sched.run_next(limit) {
            fdc.on_scheduled_event(&mut sched, ev.id);
            if fdc.drq() {
                fdc.write_byte(&mut sched, 3, n);
                n = n.wrapping_add(1);
            }
            if !fdc.is_busy() {
                break
            }
        }
        assert_eq!(fdc.read_byte(&mut sched, 0) & 0x5F, 0);
        let mut buf = [0u8; 256];
        di.borrow().read_sector(3, &mut buf).unwrap();
        assert!(buf.iter().enumerate().all(|(i, &b)| b == i as u8));
        assert!(di.borrow().image().unwrap().is_dirty());
    }

    #[test]
    fn write_protect_fails_write() {
        let (mut sched, mut fdc, di) = setup(DiskGeometry::single_density());
        di.borrow_mut().set_write_protected(true);
        fdc.write_byte(&mut sched, 2, 1);
        fdc.write_byte(&mut sched, 0, 0xA8);
        run_for(&mut sched, &mut fdc, 1000);
        assert!(!fdc.is_busy());
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_WRITE_PROT, STATUS_WRITE_PROT);
    }

    #[test]
    fn read_address_works() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::double_density());
        fdc.write_byte(&mut sched, 3, 3);
        fdc.write_byte(&mut sched, 0, 0x18);
        run_for(&mut sched, &mut fdc, 100_000);
        fdc.write_byte(&mut sched, 0, 0xC8);
        let id = read_all(&mut sched, &mut fdc);
        assert_eq!(id.len(), 6);
        assert_eq!((id[0], id[1], id[3]), (3, 0, 1));
        assert!(id[2] >= 1 && id[2] <= 18);
        assert_eq!(fdc.read_byte(&mut sched, 2), 3);
        let crc = crc16_ccitt(&[0xA1, 0xA1, 0xA1, 0xFE], &id[..4]);
        assert_eq!(crc.to_be_bytes(), [id[4], id[5]]);
    }

    #[test]
    fn force_interrupt_works() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.write_byte(&mut sched, 2, 1);
        fdc.write_byte(&mut sched, 0, 0x88);
        // ignored while busy
        fdc.write_byte(&mut sched, 0, 0x18);
        fdc.write_byte(&mut sched, 0, 0xD8);
        assert!(!fdc.is_busy());
        assert!(fdc.irq());
        fdc.write_byte(&mut sched, 0, 0xD0);
        assert!(!fdc.irq());
        // interrupt on next index pulse
        fdc.write_byte(&mut sched, 0, 0xD4);
        assert!(!fdc.irq());
        run_for(&mut sched, &mut fdc, 200_000);
        assert!(fdc.irq());
    }

    #[test]
    fn manual_index_drives_status() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.set_auto_index_pulse(&mut sched, true, false);
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_INDEX_DRQ, 0);
        fdc.on_index_pulse(&mut sched, true);
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_INDEX_DRQ, STATUS_INDEX_DRQ);
        fdc.on_index_pulse(&mut sched, false);
        assert_eq!(fdc.read_byte(&mut sched, 0) & STATUS_INDEX_DRQ, 0);
    }

    #[test]
    fn write_track_formats_sectors() {
        let (mut sched, mut fdc, di) = setup(DiskGeometry::single_density());
        let mut raw = Vec::new();
        for sector in 1..=18u8 {
            raw.extend_from_slice(&[0xFF; 8]);
            raw.extend_from_slice(&[0x00; 6]);
            raw.extend_from_slice(&[0xFE, 0, 0, sector, 0, 0xF7]);
            raw.extend_from_slice(&[0xFF; 11]);
            raw.extend_from_slice(&[0x00; 6]);
            raw.push(0xFB);
            raw.extend_from_slice(&[0xE5; 128]);
            raw.push(0xF7);
        }
        fdc.write_byte(&mut sched, 0, 0xF8);
        let limit = sched.now() + 2_000_000;
        let mut pos = 0;
        while let Some(ev) = sched.run_next(limit) {
            fdc.on_scheduled_event(&mut sched, ev.id);
            if fdc.drq() {
                fdc.write_byte(&mut sched, 3, raw.get(pos).copied().unwrap_or(0xFF));
                pos += 1;
            }
            if !fdc.is_busy() {
                break
            }
        }
        assert_eq!(fdc.read_byte(&mut sched, 0) & 0x5F, 0);
        let mut buf = [0u8; 128];
        di.borrow().read_sector(17, &mut buf).unwrap();
        assert_eq!(buf, [0xE5; 128]);
        di.borrow().read_sector(18, &mut buf).unwrap();
        assert_eq!(buf, [18; 128]);
    }

    #[test]
    fn read_track_renders_sectors() {
        let (mut sched, mut fdc, _di) = setup(DiskGeometry::single_density());
        fdc.write_byte(&mut sched, 0, 0xE8);
        let raw = read_all(&mut sched, &mut fdc);
        assert_eq!(raw.len(), fdc.track_length());
        let id = raw.iter().position(|&b| b == 0xFE).unwrap();
        assert_eq!(&raw[id + 1..id + 5], &[0, 0, 1, 0]);
    }
}
