/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The BlackBox floppy board: a 6502 with 2 KiB of RAM, a 4 KiB firmware ROM, a VIA 6522 and
//! a WD1770 controller driving up to four drives.
//!
//! The host reaches the board through the VIA, mapped at `$D570-$D57F` of the cartridge
//! control area. The board has its own [Scheduler] which is brought up to the host's time
//! whenever the host touches the VIA and on a periodic host event.
use core::cell::RefCell;
use core::fmt;
use std::io;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::{ClockHandle, EventHandle, OwnerId, ScheduledEvent, Scheduler, Ticks};
use atarusty_core::cpu::{Coproc6502, CoprocBus, CoprocSystem};
use atarusty_core::cpu::memmap::{CoprocMemoryMap, Resolved};
use atarusty_core::debug::TargetControl;
use atarusty_core::irq::{IrqController, IrqHandle};
use atarusty_core::memory::{
    AccessMode, LayerId, MemoryError, MemoryHandler, MemoryManager, PRI_CARTRIDGE1
};
use atarusty_core::props::PropertySet;

use crate::disk::{DiskClientId, DiskEvent, SharedDiskInterface};
use crate::fdc::{Fdc, FdcEvent, SideMapping};
use crate::via::{Via6522, ViaEvent, OUTPUT_CA2, OUTPUT_CB2, VIA_EVENT_COUNT};

/// The size of the board's RAM.
pub const RAM_SIZE: usize = 0x800;
/// The size of the firmware ROM.
pub const ROM_SIZE: usize = 0x1000;
/// The number of drives the board can select.
pub const DRIVE_COUNT: usize = 4;
/// The number of disk interfaces a drive slot setting may refer to.
pub const MAX_DISK_SLOTS: u32 = 15;
/// Host cycles between periodic catch-up slices.
pub const RUN_SLICE: Ticks = 64;
/// The host address of the first VIA register.
pub const CCTL_BASE: u16 = 0xD570;
/// The priority of the VIA window in the cartridge control area, above cartridges.
pub const PRI_CCTL_DEVICE: u8 = PRI_CARTRIDGE1 + 2;

const REGION_RAM: u8 = 0;
const REGION_ROM: u8 = 1;

const TAG_TRANSFER: u8 = 0;
const TAG_STATUS: u8 = 1;
const TAG_FDC: u8 = 2;

const EV_VIA_BASE: u32 = 0;
const EV_FDC_BASE: u32 = VIA_EVENT_COUNT;

const EV_HOST_SLICE: u32 = 0;
const EV_HOST_RESUME: u32 = 1;

const PB_SIDE: u32 = 0x1000;
const PB_DENSITY: u32 = 0x2000;
const PB_CLOCK: u32 = 0x4000;
const PB_INDEX: u32 = 0x8000;
const PB_SELECT: u32 = 0x0F00;

const MAX_TRACK: u32 = 94;
/// Drive cycles between steps above which a step plays at full volume.
const STEP_SOUND_FULL_PERIOD: Ticks = 20000;

/// Maps PB0-PB3 (with PB3 inverted) to the selected drive.
const SELECT_TABLE: [i8; 16] = [-1, 0, 1, -1, 2, -1, -1, -1, 3, -1, -1, -1, -1, -1, -1, -1];

/// The kind of a drive attached to the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveType {
    FiveInch180K,
    FiveInch360K,
    FiveInch12M,
    ThreeInch360K,
    ThreeInch720K,
    ThreeInch144M,
    EightInch1M,
}

impl Default for DriveType {
    fn default() -> Self {
        DriveType::FiveInch180K
    }
}

impl DriveType {
    pub const ALL: [DriveType; 7] = [
        DriveType::FiveInch180K,
        DriveType::FiveInch360K,
        DriveType::FiveInch12M,
        DriveType::ThreeInch360K,
        DriveType::ThreeInch720K,
        DriveType::ThreeInch144M,
        DriveType::EightInch1M,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DriveType::FiveInch180K => "fiveinch180K",
            DriveType::FiveInch360K => "fiveinch360K",
            DriveType::FiveInch12M => "fiveinch12M",
            DriveType::ThreeInch360K => "threeinch360K",
            DriveType::ThreeInch720K => "threeinch720K",
            DriveType::ThreeInch144M => "threeinch144M",
            DriveType::EightInch1M => "eightinch1M",
        }
    }

    pub fn from_name(name: &str) -> Option<DriveType> {
        DriveType::ALL.iter().copied().find(|t| t.name() == name)
    }
    /// The number of tracks per side.
    pub fn track_count(self) -> u32 {
        match self {
            DriveType::FiveInch180K|DriveType::FiveInch360K => 40,
            DriveType::EightInch1M => 77,
            _ => 80
        }
    }

    pub fn rpm(self) -> f64 {
        match self {
            DriveType::FiveInch12M|DriveType::EightInch1M => 360.0,
            _ => 300.0
        }
    }

    pub fn is_double_sided(self) -> bool {
        !matches!(self, DriveType::FiveInch180K)
    }
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the tracks of the second side are numbered on an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveMapping {
    Xf551,
    Atr8000,
    Percom,
}

impl Default for DriveMapping {
    fn default() -> Self {
        DriveMapping::Xf551
    }
}

impl DriveMapping {
    pub fn name(self) -> &'static str {
        match self {
            DriveMapping::Xf551 => "xf551",
            DriveMapping::Atr8000 => "atr8000",
            DriveMapping::Percom => "percom",
        }
    }

    pub fn from_name(name: &str) -> Option<DriveMapping> {
        [DriveMapping::Xf551, DriveMapping::Atr8000, DriveMapping::Percom].iter().copied()
            .find(|m| m.name() == name)
    }

    pub fn side_mapping(self) -> SideMapping {
        match self {
            DriveMapping::Xf551 => SideMapping::Side2Reversed,
            DriveMapping::Atr8000 => SideMapping::Side2Forward,
            DriveMapping::Percom => SideMapping::Side2ReversedOffByOne,
        }
    }
}

/// A sound cue produced by the drives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DriveSound {
    /// The head of `drive` stepped; `volume` is in the range `0.0..=1.0`.
    Step { drive: usize, volume: f32 },
    /// The spindle of the selected drive started or stopped.
    Rotation(bool),
}

#[derive(Debug, Default)]
struct Drive {
    disk: Option<(SharedDiskInterface, DiskClientId)>,
    slot: u32,
    drive_type: DriveType,
    mapping: DriveMapping,
    track: u32,
    last_step: Ticks,
}

/// The coprocessor side of the board.
struct Board {
    sched: Scheduler,
    map: CoprocMemoryMap,
    ram: Box<[u8]>,
    rom: Box<[u8]>,
    via: Via6522,
    fdc: Fdc,
    via_output: u32,
    via_irq: bool,
    manual_index_phase: u8,
    motor_enabled: bool,
    sounds_enabled: bool,
    current_drive: Option<usize>,
    has_image: bool,
    drives: [Drive; DRIVE_COUNT],
    sounds: Vec<DriveSound>,
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("now", &self.sched.now())
            .field("via_output", &format_args!("{:05x}", self.via_output))
            .field("current_drive", &self.current_drive)
            .finish()
    }
}

impl Board {
    fn new(hz: f64) -> Self {
        let owner = OwnerId(0);
        let mut map = CoprocMemoryMap::new();
        map.set_memory(0x00, 8, REGION_RAM, 0);
        map.set_handlers(0x08, 2, TAG_TRANSFER);
        map.set_read_handler(0x0A, 2, TAG_STATUS);
        map.set_handlers(0x0C, 2, TAG_FDC);
        map.set_read_memory(0x10, 0x10, REGION_ROM, 0);
        map.mirror_forward(0x00, 0x20);
        Board {
            sched: Scheduler::new(),
            map,
            ram: vec![0u8; RAM_SIZE].into_boxed_slice(),
            rom: vec![0xFFu8; ROM_SIZE].into_boxed_slice(),
            via: Via6522::new(owner, EV_VIA_BASE),
            fdc: Fdc::new(owner, EV_FDC_BASE, hz),
            via_output: 0,
            via_irq: false,
            manual_index_phase: 0,
            motor_enabled: false,
            sounds_enabled: false,
            current_drive: None,
            has_image: false,
            drives: Default::default(),
            sounds: Vec::new(),
        }
    }

    fn on_event(&mut self, ev: ScheduledEvent) {
        if self.via.owns_event(ev.owner, ev.id) {
            self.via.on_scheduled_event(&mut self.sched, ev.id);
        }
        else if self.fdc.owns_event(ev.owner, ev.id) {
            self.fdc.on_scheduled_event(&mut self.sched, ev.id);
        }
        self.process();
    }
    /// Routes the notifications of the chips until none are left.
    fn process(&mut self) {
        loop {
            let via_events = self.via.take_events();
            let fdc_events = self.fdc.take_events();
            if via_events.is_empty() && fdc_events.is_empty() {
                break
            }
            for ev in via_events {
                match ev {
                    ViaEvent::OutputChanged(state) => self.on_via_output(state),
                    ViaEvent::Interrupt(asserted) => self.via_irq = asserted,
                }
            }
            for ev in fdc_events {
                match ev {
                    FdcEvent::Step(inward) => self.on_fdc_step(inward),
                    FdcEvent::MotorChange(on) => self.on_fdc_motor_change(on),
                    // sampled through the status latch
                    FdcEvent::DrqChange(_)|FdcEvent::IrqChange(_) => {}
                }
            }
        }
    }

    fn is_auto_index_enabled(&self) -> bool {
        self.via_output & OUTPUT_CB2 == 0
    }

    fn on_via_output(&mut self, state: u32) {
        let delta = self.via_output ^ state;
        self.via_output = state;
        let mut update_index = delta & OUTPUT_CB2 != 0;
        if delta & PB_SIDE != 0 {
            self.fdc.set_side(state & PB_SIDE == 0);
        }
        if delta & PB_SELECT != 0 {
            let sel = SELECT_TABLE[(((state >> 8) & 15) ^ 8) as usize];
            self.select_drive(if sel < 0 { None } else { Some(sel as usize) });
        }
        if delta & PB_DENSITY != 0 {
            self.fdc.set_density(state & PB_DENSITY == 0);
        }
        if delta & PB_CLOCK != 0 {
            self.update_fdc_speeds();
        }
        if delta & PB_INDEX != 0 && state & PB_INDEX == 0 {
            self.manual_index_phase = self.manual_index_phase.wrapping_add(1);
            if self.manual_index_phase & 1 == 0 && !self.is_auto_index_enabled() {
                update_index = true;
            }
        }
        if update_index {
            self.update_fdc_index();
        }
    }

    fn update_fdc_index(&mut self) {
        let auto = self.is_auto_index_enabled();
        if auto {
            self.fdc.set_auto_index_pulse(&mut self.sched, true, true);
        }
        let level = !auto && self.manual_index_phase & 2 != 0;
        self.fdc.on_index_pulse(&mut self.sched, level);
        if !auto {
            self.fdc.set_auto_index_pulse(&mut self.sched, true, false);
        }
    }

    fn update_fdc_speeds(&mut self) {
        let rpm = self.current_drive.map_or(300.0, |i| self.drives[i].drive_type.rpm());
        let fast_clock = self.via_output & PB_CLOCK == 0;
        let period_factor = if fast_clock { 1.0 } else { 8.0 / 8.333_333 };
        self.fdc.set_speeds(&mut self.sched, rpm, period_factor, fast_clock);
    }

    fn update_fdc_track(&mut self) {
        let track = self.current_drive.map_or(1, |i| self.drives[i].track);
        self.fdc.set_current_track(track * 2, track == 0);
    }

    fn on_fdc_step(&mut self, inward: bool) {
        let index = match self.current_drive {
            Some(index) => index,
            None => return
        };
        let now = self.sched.now();
        let sounds_enabled = self.sounds_enabled;
        let drive = &mut self.drives[index];
        let track = if inward {
            (drive.track + 1).min(MAX_TRACK)
        }
        else {
            drive.track.saturating_sub(1)
        };
        if track != drive.track {
            drive.track = track;
            if sounds_enabled {
                let dt = now.saturating_sub(drive.last_step);
                drive.last_step = now;
                let volume = if dt < STEP_SOUND_FULL_PERIOD {
                    dt as f32 / STEP_SOUND_FULL_PERIOD as f32
                }
                else {
                    1.0
                };
                self.sounds.push(DriveSound::Step { drive: index, volume });
            }
        }
        self.update_fdc_track();
    }

    fn on_fdc_motor_change(&mut self, enabled: bool) {
        if self.motor_enabled != enabled {
            self.motor_enabled = enabled;
            let running = enabled && self.has_image;
            self.fdc.set_motor_running(&mut self.sched, running);
            if self.sounds_enabled && self.current_drive.is_some() {
                self.sounds.push(DriveSound::Rotation(running));
            }
        }
    }

    fn select_drive(&mut self, index: Option<usize>) {
        if self.current_drive == index {
            return
        }
        self.current_drive = index;
        match index {
            Some(index) => {
                let drive = &self.drives[index];
                let iface = drive.disk.as_ref().map(|(iface, _)| iface.clone());
                self.has_image = iface.as_ref().map_or(false, |iface| iface.borrow().is_disk_loaded());
                self.sounds_enabled = iface.as_ref().map_or(false, |iface| iface.borrow().are_drive_sounds_enabled());
                let accurate = iface.as_ref().map_or(false, |iface| iface.borrow().is_accurate_sector_timing_enabled());
                let (mapping, tracks) = (drive.mapping.side_mapping(), drive.drive_type.track_count());
                self.fdc.set_disk_interface(iface);
                self.fdc.set_disk_present(&mut self.sched, self.has_image);
                self.fdc.set_motor_running(&mut self.sched, self.motor_enabled && self.has_image);
                self.fdc.set_side_mapping(mapping, tracks);
                self.fdc.set_accurate_timing(accurate);
            }
            None => {
                self.has_image = false;
                self.sounds_enabled = false;
                self.fdc.set_disk_interface(None);
                self.fdc.set_disk_present(&mut self.sched, false);
                self.fdc.set_motor_running(&mut self.sched, false);
            }
        }
        debug!("blackbox: drive selected: {:?}", index);
        self.update_fdc_track();
        self.update_fdc_speeds();
    }
    /// Drains the notifications of every attached disk interface.
    fn poll_disks(&mut self) {
        for index in 0..DRIVE_COUNT {
            let events = match &self.drives[index].disk {
                Some((iface, id)) => iface.borrow_mut().take_events(*id),
                None => continue
            };
            if self.current_drive != Some(index) {
                continue
            }
            for ev in events {
                self.on_disk_event(index, ev);
            }
        }
    }

    fn on_disk_event(&mut self, index: usize, ev: DiskEvent) {
        let iface = match &self.drives[index].disk {
            Some((iface, _)) => iface.clone(),
            None => return
        };
        match ev {
            DiskEvent::DiskChanged { .. } => {
                self.has_image = iface.borrow().is_disk_loaded();
                self.fdc.set_disk_present(&mut self.sched, self.has_image);
                self.fdc.set_motor_running(&mut self.sched, self.motor_enabled && self.has_image);
            }
            DiskEvent::TimingModeChanged => {
                self.fdc.set_accurate_timing(iface.borrow().is_accurate_sector_timing_enabled());
            }
            DiskEvent::AudioModeChanged => {
                self.sounds_enabled = iface.borrow().are_drive_sounds_enabled();
            }
            DiskEvent::WriteProtectChanged => {}
        }
    }

    fn read_transfer_latch(&mut self) -> u8 {
        let value = self.via_output as u8;
        self.via.set_ca1_input(&mut self.sched, false);
        self.via.set_ca1_input(&mut self.sched, true);
        value
    }

    fn write_transfer_latch(&mut self, value: u8) {
        self.via.set_port_a_input(value, 0xFF);
        self.via.set_ca1_input(&mut self.sched, false);
        self.via.set_ca1_input(&mut self.sched, true);
    }

    fn status_latch(&self) -> u8 {
        let mut v = 0x30;
        if self.fdc.drq() {
            v |= 0x80;
        }
        if self.fdc.irq() {
            v |= 0x40;
        }
        if self.via_output & PB_DENSITY != 0 {
            v |= 0x08;
        }
        if self.via_output & OUTPUT_CB2 != 0 {
            v |= 0x04;
        }
        if self.via_output & PB_CLOCK != 0 {
            v |= 0x02;
        }
        if self.via_output & OUTPUT_CA2 != 0 {
            v |= 0x01;
        }
        v
    }
}

impl CoprocBus for Board {
    fn read(&mut self, addr: u16) -> u8 {
        let value = match self.map.resolve_read(addr) {
            Resolved::Memory { region: REGION_RAM, index } => return self.ram[index % RAM_SIZE],
            Resolved::Memory { index, .. } => return self.rom[index % ROM_SIZE],
            Resolved::Open => return 0xFF,
            Resolved::Handler { tag: TAG_TRANSFER, .. } => self.read_transfer_latch(),
            Resolved::Handler { tag: TAG_STATUS, .. } => return self.status_latch(),
            Resolved::Handler { tag: TAG_FDC, addr } => self.fdc.read_byte(&mut self.sched, addr as u8),
            Resolved::Handler { .. } => return 0xFF,
        };
        self.process();
        value
    }

    fn write(&mut self, addr: u16, value: u8) {
        match self.map.resolve_write(addr) {
            Resolved::Memory { region: REGION_RAM, index } => {
                self.ram[index % RAM_SIZE] = value;
                return
            }
            Resolved::Memory { .. }|Resolved::Open => return,
            Resolved::Handler { tag: TAG_TRANSFER, .. } => self.write_transfer_latch(value),
            Resolved::Handler { tag: TAG_FDC, addr } => self.fdc.write_byte(&mut self.sched, addr as u8, value),
            Resolved::Handler { .. } => return,
        }
        self.process();
    }

    fn debug_read(&mut self, addr: u16) -> u8 {
        match self.map.resolve_read(addr) {
            Resolved::Memory { region: REGION_RAM, index } => self.ram[index % RAM_SIZE],
            Resolved::Memory { index, .. } => self.rom[index % ROM_SIZE],
            Resolved::Open => 0xFF,
            Resolved::Handler { tag: TAG_TRANSFER, .. } => self.via_output as u8,
            Resolved::Handler { tag: TAG_STATUS, .. } => self.status_latch(),
            Resolved::Handler { tag: TAG_FDC, addr } => self.fdc.debug_read_byte(self.sched.now(), addr as u8),
            Resolved::Handler { .. } => 0xFF,
        }
    }
}

impl CoprocSystem for Board {
    fn scheduler(&mut self) -> &mut Scheduler {
        &mut self.sched
    }
}

/// The BlackBox floppy board attached to a host machine.
#[derive(Debug)]
pub struct BlackBoxFloppy {
    owner: OwnerId,
    cpu: Coproc6502,
    control: TargetControl,
    board: Board,
    irq: Option<(IrqController, IrqHandle)>,
    firmware_loaded: bool,
    in_sync: bool,
    resume_wanted: bool,
    slice_event: Option<EventHandle>,
}

/// A shared [BlackBoxFloppy].
pub type SharedBlackBox = Rc<RefCell<BlackBoxFloppy>>;

impl BlackBoxFloppy {
    /// Creates a board attached to a host clocked at `host_hz`. Its host scheduler events are
    /// posted for `owner`.
    pub fn new(owner: OwnerId, host_hz: f64) -> Self {
        BlackBoxFloppy {
            owner,
            cpu: Coproc6502::new(),
            control: TargetControl::new(host_hz, host_hz),
            board: Board::new(host_hz),
            irq: None,
            firmware_loaded: false,
            in_sync: false,
            resume_wanted: false,
            slice_event: None,
        }
    }
    /// Connects the board to the host: allocates its interrupt line, starts the periodic
    /// catch-up and performs a cold reset.
    pub fn init(&mut self, host: &mut Scheduler, irq: &IrqController) {
        self.irq = irq.allocate().map(|handle| (irq.clone(), handle));
        if self.irq.is_none() {
            warn!("blackbox: no interrupt line available");
        }
        host.set_event(RUN_SLICE, self.owner, EV_HOST_SLICE, &mut self.slice_event);
        self.cold_reset(host.now());
    }
    /// Disconnects the board from the host.
    pub fn shutdown(&mut self, host: &mut Scheduler) {
        host.unset_event(&mut self.slice_event);
        self.control.cancel_immediate_resume(host);
        if let Some((irq, handle)) = self.irq.take() {
            irq.free(handle);
        }
        for drive in self.board.drives.iter_mut() {
            if let Some((iface, id)) = drive.disk.take() {
                iface.borrow_mut().remove_client(id);
            }
        }
    }

    pub fn is_inited(&self) -> bool {
        self.irq.is_some()
    }
    /// Loads the firmware. The image must be exactly [ROM_SIZE] bytes long.
    pub fn load_firmware(&mut self, rom: &[u8]) -> io::Result<()> {
        if rom.len() != ROM_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData,
                                      "BlackBox floppy firmware must be 4096 bytes long"))
        }
        self.board.rom.copy_from_slice(rom);
        self.firmware_loaded = true;
        Ok(())
    }

    pub fn is_firmware_loaded(&self) -> bool {
        self.firmware_loaded
    }
    /// Attaches the disk interfaces the drive slots refer to: slot `n` is `disks[n - 1]`.
    pub fn attach_disks(&mut self, disks: &[SharedDiskInterface]) {
        let current = self.board.current_drive.take();
        for drive in self.board.drives.iter_mut() {
            if let Some((iface, id)) = drive.disk.take() {
                iface.borrow_mut().remove_client(id);
            }
            if drive.slot > 0 {
                if let Some(iface) = disks.get(drive.slot as usize - 1) {
                    let id = iface.borrow_mut().add_client();
                    drive.disk = Some((iface.clone(), id));
                }
            }
        }
        self.board.select_drive(current);
        self.board.process();
    }
    /// Returns the disk slot (1-based, 0 = none) of each drive.
    pub fn drive_slots(&self) -> [u32; DRIVE_COUNT] {
        let mut slots = [0; DRIVE_COUNT];
        for (slot, drive) in slots.iter_mut().zip(self.board.drives.iter()) {
            *slot = drive.slot;
        }
        slots
    }

    pub fn drive_type(&self, drive: usize) -> Option<DriveType> {
        self.board.drives.get(drive).map(|d| d.drive_type)
    }

    pub fn drive_mapping(&self, drive: usize) -> Option<DriveMapping> {
        self.board.drives.get(drive).map(|d| d.mapping)
    }

    pub fn selected_drive(&self) -> Option<usize> {
        self.board.current_drive
    }
    /// Returns the head position of `drive` in whole tracks.
    pub fn drive_track(&self, drive: usize) -> Option<u32> {
        self.board.drives.get(drive).map(|d| d.track)
    }

    pub fn settings(&self) -> PropertySet {
        let mut ps = PropertySet::new();
        for (i, drive) in self.board.drives.iter().enumerate() {
            ps.set_u32(format!("driveslot{}", i), drive.slot);
            ps.set_string(format!("drivetype{}", i), drive.drive_type.name());
            ps.set_string(format!("drivemapping{}", i), drive.mapping.name());
        }
        ps
    }
    /// Applies settings. Returns `true` if the drive slots changed, in which case the caller
    /// must re-attach disks with [BlackBoxFloppy::attach_disks].
    pub fn apply_settings(&mut self, ps: &PropertySet) -> bool {
        let mut slots_changed = false;
        let mut geometry_changed = false;
        for (i, drive) in self.board.drives.iter_mut().enumerate() {
            let slot = ps.get_u32(&format!("driveslot{}", i), 0);
            let slot = if slot > MAX_DISK_SLOTS { 0 } else { slot };
            if drive.slot != slot {
                drive.slot = slot;
                slots_changed = true;
            }
            let drive_type = DriveType::from_name(ps.get_string(&format!("drivetype{}", i), ""))
                             .unwrap_or_default();
            let mapping = DriveMapping::from_name(ps.get_string(&format!("drivemapping{}", i), ""))
                          .unwrap_or_default();
            if drive.drive_type != drive_type || drive.mapping != mapping {
                drive.drive_type = drive_type;
                drive.mapping = mapping;
                geometry_changed = true;
            }
        }
        if geometry_changed {
            let current = self.board.current_drive.take();
            self.board.select_drive(current);
            self.board.process();
        }
        slots_changed
    }

    pub fn cold_reset(&mut self, host_now: Ticks) {
        self.board.manual_index_phase = 0;
        self.control.reset_target_control(host_now, self.board.sched.now());
        self.board.fdc.reset(&mut self.board.sched);
        self.warm_reset();
    }

    pub fn warm_reset(&mut self) {
        let board = &mut self.board;
        board.via.reset(&mut board.sched);
        let output = board.via.output();
        board.on_via_output(output);
        self.cpu.cold_reset(board);
        board.update_fdc_index();
        board.process();
        self.update_irq();
    }

    fn update_irq(&mut self) {
        if let Some((irq, handle)) = &self.irq {
            irq.set(*handle, self.board.via_irq);
        }
    }
    /// Brings the board up to `host_now`.
    pub fn sync(&mut self, host_now: Ticks) {
        if self.in_sync {
            return
        }
        self.in_sync = true;
        self.board.poll_disks();
        self.control.accum_sub_cycles(host_now);
        let cpu = &mut self.cpu;
        let completed = self.control.run(cpu, &mut self.board, |ev, board| board.on_event(ev));
        if !completed || self.control.fast_sync_remaining() > 0 {
            self.resume_wanted = true;
        }
        self.board.process();
        self.update_irq();
        self.in_sync = false;
    }

    pub fn read_byte_via(&mut self, host_now: Ticks, reg: u8) -> u8 {
        if !self.is_inited() {
            return 0xFF
        }
        self.control.reset_fast_sync_window();
        self.sync(host_now);
        let board = &mut self.board;
        let value = board.via.read_byte(&mut board.sched, reg & 15);
        board.process();
        self.update_irq();
        value
    }

    pub fn write_byte_via(&mut self, host_now: Ticks, reg: u8, value: u8) {
        if !self.is_inited() {
            return
        }
        self.control.reset_fast_sync_window();
        self.sync(host_now);
        let board = &mut self.board;
        board.via.write_byte(&mut board.sched, reg & 15, value);
        board.process();
        self.update_irq();
    }
    /// Reads a VIA register without side effects and without catching up.
    pub fn debug_read_byte_via(&self, reg: u8) -> u8 {
        if !self.is_inited() {
            return 0xFF
        }
        self.board.via.debug_read_byte(self.board.sched.now(), reg & 15)
    }
    /// Requests another catch-up on the next host cycle if the last sync asked for one.
    /// Call after host code touched the board through [BlackBoxCctl].
    pub fn service(&mut self, host: &mut Scheduler) {
        if core::mem::take(&mut self.resume_wanted) {
            self.control.schedule_immediate_resume(host, self.owner, EV_HOST_RESUME);
        }
    }
    /// Returns `true` if the host event belongs to the board.
    pub fn owns_event(&self, owner: OwnerId, id: u32) -> bool {
        owner == self.owner && (id == EV_HOST_SLICE || id == EV_HOST_RESUME)
    }

    pub fn on_host_event(&mut self, host: &mut Scheduler, id: u32) {
        match id {
            EV_HOST_SLICE => {
                self.slice_event = None;
                self.sync(host.now());
                self.control.tick_fast_sync();
                host.set_event(RUN_SLICE, self.owner, EV_HOST_SLICE, &mut self.slice_event);
            }
            EV_HOST_RESUME => {
                self.control.on_resume_event();
                self.sync(host.now());
            }
            _ => {}
        }
        self.service(host);
    }
    /// Drains the queued drive sounds.
    pub fn take_sounds(&mut self) -> Vec<DriveSound> {
        core::mem::take(&mut self.board.sounds)
    }

    pub fn cpu(&self) -> &Coproc6502 {
        &self.cpu
    }

    pub fn target_control(&mut self) -> &mut TargetControl {
        &mut self.control
    }
    /// Resumes the coprocessor after a break.
    pub fn resume(&mut self, host_now: Ticks) {
        let target_now = self.board.sched.now();
        self.control.resume_target(&mut self.cpu, host_now, target_now);
    }

    pub fn set_breakpoint(&mut self, pc: u16) {
        self.cpu.set_breakpoint(pc);
    }
    /// Reads the coprocessor's address space without side effects.
    pub fn debug_read_coproc(&mut self, addr: u16) -> u8 {
        self.board.debug_read(addr)
    }
    /// The time of the board's scheduler.
    pub fn drive_now(&self) -> Ticks {
        self.board.sched.now()
    }

    pub fn dump_status(&self) -> String {
        let now = self.board.sched.now();
        format!("{}{}drive: {:?} track: {:?} output: {:05x}\n",
                self.board.via.dump_status(now),
                self.board.fdc.dump_status(now),
                self.board.current_drive,
                self.board.current_drive.map(|i| self.board.drives[i].track),
                self.board.via_output)
    }
}

/// Exposes the board's VIA at `$D570-$D57F` of the host address space.
pub struct BlackBoxCctl {
    device: SharedBlackBox,
    clock: ClockHandle,
}

impl BlackBoxCctl {
    pub fn new(device: SharedBlackBox, clock: ClockHandle) -> Self {
        BlackBoxCctl { device, clock }
    }
    /// Installs a handler layer over the `$D5xx` page and enables it.
    pub fn install(self, mm: &mut MemoryManager) -> Result<LayerId, MemoryError> {
        let id = mm.create_handler_layer(PRI_CCTL_DEVICE, Rc::new(RefCell::new(self)), 0xD5, 1)?;
        mm.set_layer_name(id, "BlackBox floppy VIA")?;
        mm.enable_layer(id, AccessMode::READ|AccessMode::WRITE, true)?;
        Ok(id)
    }

    fn register(addr: u16) -> Option<u8> {
        if addr & 0xFFF0 == CCTL_BASE { Some((addr & 15) as u8) } else { None }
    }
}

impl MemoryHandler for BlackBoxCctl {
    fn debug_read(&mut self, addr: u16) -> Option<u8> {
        Self::register(addr).map(|reg| self.device.borrow().debug_read_byte_via(reg))
    }

    fn read(&mut self, addr: u16) -> Option<u8> {
        let reg = Self::register(addr)?;
        Some(self.device.borrow_mut().read_byte_via(self.clock.now(), reg))
    }

    fn write(&mut self, addr: u16, value: u8) -> bool {
        match Self::register(addr) {
            Some(reg) => {
                self.device.borrow_mut().write_byte_via(self.clock.now(), reg, value);
                true
            }
            None => false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskGeometry, DiskInterface, MemoryDisk};
    use crate::via::ViaRegister;

    const HZ: f64 = 1_789_772.5;
    const ORB: u8 = ViaRegister::Orb as u8;
    const DDRB: u8 = ViaRegister::Ddrb as u8;
    const PCR: u8 = ViaRegister::Pcr as u8;

    /// A firmware that spins in place.
    fn idle_rom() -> Vec<u8> {
        let mut rom = vec![0xEAu8; ROM_SIZE];
        // JMP $F000
        rom[0..3].copy_from_slice(&[0x4C, 0x00, 0xF0]);
        rom[0xFFC] = 0x00;
        rom[0xFFD] = 0xF0;
        rom
    }

    fn setup() -> (BlackBoxFloppy, Scheduler, IrqController) {
        let mut host = Scheduler::new();
        let irq = IrqController::new();
        let mut bb = BlackBoxFloppy::new(OwnerId(7), HZ);
        bb.load_firmware(&idle_rom()).unwrap();
        bb.init(&mut host, &irq);
        (bb, host, irq)
    }

    #[test]
    fn drive_types_work() {
        assert_eq!(DriveType::default(), DriveType::FiveInch180K);
        assert_eq!(DriveType::from_name("threeinch144M"), Some(DriveType::ThreeInch144M));
        assert_eq!(DriveType::from_name("floppy"), None);
        assert_eq!(DriveType::EightInch1M.track_count(), 77);
        assert_eq!(DriveType::FiveInch360K.track_count(), 40);
        assert_eq!(DriveType::FiveInch12M.rpm(), 360.0);
        assert_eq!(DriveType::ThreeInch720K.rpm(), 300.0);
        assert_eq!(DriveMapping::from_name("percom").unwrap().side_mapping(),
                   SideMapping::Side2ReversedOffByOne);
        assert_eq!(format!("{}", DriveType::ThreeInch360K), "threeinch360K");
    }

    #[test]
    fn settings_round_trip() {
        let mut bb = BlackBoxFloppy::new(OwnerId(1), HZ);
        let mut ps = PropertySet::new();
        ps.set_u32("driveslot0", 1);
        ps.set_u32("driveslot1", 16);
        ps.set_string("drivetype0", "threeinch720K");
        ps.set_string("drivemapping0", "atr8000");
        ps.set_string("drivetype2", "bogus");
        assert!(bb.apply_settings(&ps));
        assert_eq!(bb.drive_slots(), [1, 0, 0, 0]);
        assert_eq!(bb.drive_type(0), Some(DriveType::ThreeInch720K));
        assert_eq!(bb.drive_type(2), Some(DriveType::FiveInch180K));
        assert_eq!(bb.drive_mapping(0), Some(DriveMapping::Atr8000));
        let saved = bb.settings();
        assert_eq!(saved.get_string("drivetype0", ""), "threeinch720K");
        assert_eq!(saved.get_u32("driveslot0", 9), 1);
        assert!(!bb.apply_settings(&saved));
    }

    #[test]
    fn firmware_size_is_checked() {
        let mut bb = BlackBoxFloppy::new(OwnerId(1), HZ);
        assert!(bb.load_firmware(&[0u8; 100]).is_err());
        assert!(!bb.is_firmware_loaded());
    }

    #[test]
    fn access_before_init_is_inert() {
        let mut bb = BlackBoxFloppy::new(OwnerId(1), HZ);
        assert_eq!(bb.read_byte_via(0, 0), 0xFF);
        bb.write_byte_via(0, DDRB, 0xFF);
        assert_eq!(bb.debug_read_byte_via(DDRB), 0xFF);
    }

    #[test]
    fn host_access_syncs_coprocessor() {
        let (mut bb, mut host, _irq) = setup();
        assert_eq!(bb.cpu().pc(), 0xF000);
        host.advance(1000);
        bb.write_byte_via(host.now(), DDRB, 0x0F);
        assert!(bb.drive_now() >= 1000);
        assert!(bb.cpu().instruction_count() > 100);
        assert_eq!(bb.debug_read_byte_via(DDRB), 0x0F);
        assert_eq!(bb.read_byte_via(host.now(), DDRB), 0x0F);
        // the fast sync window asks for an immediate resume
        bb.service(&mut host);
        host.advance(1);
        let ev = host.pop_due().unwrap();
        assert!(bb.owns_event(ev.owner, ev.id));
        bb.on_host_event(&mut host, ev.id);
        assert!(bb.drive_now() >= 1001);
    }

    #[test]
    fn periodic_slice_runs_board() {
        let (mut bb, mut host, _irq) = setup();
        host.run_until(RUN_SLICE * 10, |s, ev| bb.on_host_event(s, ev.id));
        assert!(bb.drive_now() >= RUN_SLICE * 9);
    }

    #[test]
    fn drive_select_follows_port_b() {
        let (mut bb, mut host, _irq) = setup();
        let disk = DiskInterface::new_shared(0);
        disk.borrow_mut().mount(Box::new(MemoryDisk::new(DiskGeometry::single_density())), "a.atr");
        let mut ps = PropertySet::new();
        ps.set_u32("driveslot0", 1);
        assert!(bb.apply_settings(&ps));
        bb.attach_disks(&[disk]);
        bb.write_byte_via(host.now(), DDRB, 0xFF);
        // PB3 high, PB0-PB2 low: nothing selected
        bb.write_byte_via(host.now(), ORB, 0xF8);
        assert_eq!(bb.selected_drive(), None);
        bb.write_byte_via(host.now(), ORB, 0xF9);
        assert_eq!(bb.selected_drive(), Some(0));
        bb.write_byte_via(host.now(), ORB, 0xFA);
        assert_eq!(bb.selected_drive(), Some(1));
        bb.write_byte_via(host.now(), ORB, 0xFC);
        assert_eq!(bb.selected_drive(), Some(2));
        bb.write_byte_via(host.now(), ORB, 0xF0);
        assert_eq!(bb.selected_drive(), Some(3));
        // two drives at once select nothing
        bb.write_byte_via(host.now(), ORB, 0xFB);
        assert_eq!(bb.selected_drive(), None);
        host.advance(10);
        bb.write_byte_via(host.now(), ORB, 0xF9);
        assert_eq!(bb.selected_drive(), Some(0));
        assert!(bb.dump_status().contains("drive: Some(0)"));
    }

    #[test]
    fn manual_index_follows_pb7() {
        let (mut bb, host, _irq) = setup();
        bb.write_byte_via(host.now(), DDRB, 0xFF);
        // CB2 driven high: manual index
        bb.write_byte_via(host.now(), PCR, 0xE0);
        assert!(!bb.board.is_auto_index_enabled());
        let phase = bb.board.manual_index_phase;
        for _ in 0..2 {
            bb.write_byte_via(host.now(), ORB, 0xF8);
            bb.write_byte_via(host.now(), ORB, 0x78);
        }
        assert_eq!(bb.board.manual_index_phase, phase.wrapping_add(2));
        // CB2 low: back to the automatic index
        bb.write_byte_via(host.now(), PCR, 0xC0);
        assert!(bb.board.is_auto_index_enabled());
    }

    #[test]
    fn status_latch_reflects_outputs() {
        let (mut bb, host, _irq) = setup();
        bb.write_byte_via(host.now(), DDRB, 0xFF);
        bb.write_byte_via(host.now(), ORB, 0x00);
        // CA2 and CB2 high after reset
        assert_eq!(bb.debug_read_coproc(0x0A00), 0x30 | 0x04 | 0x01);
        bb.write_byte_via(host.now(), ORB, 0x60);
        assert_eq!(bb.debug_read_coproc(0x0A00), 0x30 | 0x08 | 0x04 | 0x02 | 0x01);
        // mirrored every 8 KiB
        assert_eq!(bb.debug_read_coproc(0x2A00), bb.debug_read_coproc(0x0A00));
        assert_eq!(bb.debug_read_coproc(0xFFFC), 0x00);
        assert_eq!(bb.debug_read_coproc(0x0E00), 0xFF);
    }

    #[test]
    fn via_irq_drives_host_line() {
        let (mut bb, mut host, irq) = setup();
        assert!(!irq.is_irq_asserted());
        // enable the CA1 interrupt, then let the board pulse CA1 through the transfer latch
        bb.write_byte_via(host.now(), ViaRegister::Ier as u8, 0x80 | 0x02);
        bb.board.write(0x0800, 0x55);
        bb.board.process();
        bb.update_irq();
        assert!(irq.is_irq_asserted());
        bb.shutdown(&mut host);
        assert!(!irq.is_irq_asserted());
        assert!(!bb.is_inited());
    }

    #[test]
    fn cctl_window_maps_via() {
        let (bb, mut host, _irq) = setup();
        let bb = Rc::new(RefCell::new(bb));
        let mut mm = MemoryManager::new();
        BlackBoxCctl::new(bb.clone(), host.clock()).install(&mut mm).unwrap();
        host.advance(200);
        mm.write_byte(CCTL_BASE + DDRB as u16, 0x3C);
        assert_eq!(mm.read_byte(CCTL_BASE + DDRB as u16), 0x3C);
        assert_eq!(mm.debug_read_byte(CCTL_BASE + DDRB as u16), 0x3C);
        assert!(bb.borrow().drive_now() >= 200);
        // outside the window
        assert_eq!(mm.read_byte(0xD500), 0xFF);
    }
}
