/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The SIO bus.
//!
//! [SioManager] decodes command frames sent by the computer over POKEY and dispatches them to
//! attached [SioDevice]s. Each device replies by queueing [Step]s on its [SioInterface], which
//! the manager executes against the scheduler, sending bytes back to the computer through
//! [SioHost].
//!
//! Requests made through the OS SIO vector can be accelerated: the step queue is then executed
//! synchronously, copying data directly between memory and the transfer buffer.
//!
//! Devices that need to see every byte on the bus (modems, multiplexers) attach as
//! [RawSioDevice]s instead.
use core::fmt;
use std::io;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use atarusty_core::clock::{OwnerId, ScheduledEvent, Scheduler, Ticks};
use atarusty_core::memory::MemoryManager;
use atarusty_core::props::PropertySet;
use atarusty_core::trace::SharedTrace;

pub mod accel;
pub mod drive;
mod interface;
mod raw;
mod state;
mod step;
mod trace;

pub use accel::{SioRequest, AccelReturn};
pub use drive::SioDiskDrive;
pub use interface::*;
pub use raw::{RawSioDevice, SharedRawSioDevice, RawDeviceId, SioBus};
pub use state::{SioManagerState, ActiveCommandState, StepState};
pub use step::{Step, StepRecord};
pub use trace::SioTrace;

use accel::AccelState;

/// The maximum size of an interface's transfer buffer.
pub const MAX_TRANSFER_SIZE: usize = 65536;
/// The number of type-3 polls answered while waiting for a device to show up during fast boot.
pub const FAST_BOOT_POLL_LIMIT: u32 = 26;

const EV_DELAY: u32 = 0;
const EV_SEND: u32 = 1;

/// Computes the SIO checksum: an 8-bit sum with end-around carry.
pub fn sio_checksum(data: &[u8]) -> u8 {
    let mut sum: u32 = 0;
    for &b in data {
        sum += b as u32;
        sum = (sum & 0xFF) + (sum >> 8);
    }
    sum as u8
}

/// Returns `true` for SIO device ids of disk drives.
pub fn is_disk_device(device: u8) -> bool {
    (0x31..=0x3F).contains(&device)
}

/// The computer's side of the bus: POKEY's serial port and the PIA's SIO lines.
pub trait SioHost {
    /// Delivers a byte from a device to POKEY's serial input.
    fn receive_sio_byte(&mut self, byte: u8, cycles_per_bit: u32, simulate_input: bool,
                        allow_burst: bool, synchronous: bool, framing_error: bool);
    /// Drives the serial data input line directly.
    fn set_data_line(&mut self, _level: bool) {}
    /// The PIA CB1 input.
    fn set_interrupt_line(&mut self, _asserted: bool) {}
    /// The PIA CA1 input.
    fn set_proceed_line(&mut self, _asserted: bool) {}
    /// Clocks POKEY's serial port externally. A zero `period` disables the external clock.
    fn set_external_clock(&mut self, _time_base: Ticks, _period: u32) {}
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SioError {
    UnknownStep(String),
    InvalidTransferRate,
    InvalidTransferIndex,
    InvalidTransferData,
    InvalidCommandFrame,
    UnknownInterface,
}

impl std::error::Error for SioError {}

impl fmt::Display for SioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SioError::UnknownStep(name) => write!(f, "unknown SIO step type: {}", name),
            SioError::InvalidTransferRate => f.write_str("invalid SIO transfer rate"),
            SioError::InvalidTransferIndex => f.write_str("SIO transfer index out of range"),
            SioError::InvalidTransferData => f.write_str("SIO step transfer data does not match its length"),
            SioError::InvalidCommandFrame => f.write_str("invalid SIO command frame state"),
            SioError::UnknownInterface => f.write_str("no such SIO interface"),
        }
    }
}

impl From<SioError> for io::Error {
    fn from(err: SioError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Bus options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct SioSettings {
    /// Intercepts the OS SIO vector.
    pub sio_patch: bool,
    pub disk_accel: bool,
    /// Accelerates requests for devices other than disk drives.
    pub other_accel: bool,
    /// Lets devices send bytes back to back when the computer is ready.
    pub burst: bool,
    pub disk_burst: bool,
    /// Answers type-3 polls at boot without waiting for the OS timeout.
    pub fast_boot: bool,
    /// New interfaces let a command frame cut short their active command.
    pub command_truncation: bool,
    /// New interfaces ignore command frames with an early raised command line.
    pub deassert_check: bool,
}

impl Default for SioSettings {
    fn default() -> Self {
        SioSettings {
            sio_patch: true,
            disk_accel: true,
            other_accel: true,
            burst: false,
            disk_burst: false,
            fast_boot: true,
            command_truncation: true,
            deassert_check: false,
        }
    }
}

impl SioSettings {
    pub fn from_props(ps: &PropertySet) -> Self {
        let d = SioSettings::default();
        SioSettings {
            sio_patch: ps.get_bool("accel", d.sio_patch),
            disk_accel: ps.get_bool("diskaccel", d.disk_accel),
            other_accel: ps.get_bool("otheraccel", d.other_accel),
            burst: ps.get_bool("burst", d.burst),
            disk_burst: ps.get_bool("diskburst", d.disk_burst),
            fast_boot: ps.get_bool("fastboot", d.fast_boot),
            command_truncation: ps.get_bool("truncation", d.command_truncation),
            deassert_check: ps.get_bool("deassertcheck", d.deassert_check),
        }
    }

    pub fn to_props(&self) -> PropertySet {
        let mut ps = PropertySet::new();
        ps.set_bool("accel", self.sio_patch);
        ps.set_bool("diskaccel", self.disk_accel);
        ps.set_bool("otheraccel", self.other_accel);
        ps.set_bool("burst", self.burst);
        ps.set_bool("diskburst", self.disk_burst);
        ps.set_bool("fastboot", self.fast_boot);
        ps.set_bool("truncation", self.command_truncation);
        ps.set_bool("deassertcheck", self.deassert_check);
        ps
    }
}

/// Identifies a device attached with [SioManager::add_device].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SioInterfaceId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AccelOutcome {
    NotHandled,
    Bypass,
    Handled,
}

/// The SIO bus.
pub struct SioManager {
    owner: OwnerId,
    settings: SioSettings,
    slots: Vec<Option<SioInterface>>,
    accel: Option<AccelState>,
    command_asserted: bool,
    motor_asserted: bool,
    ready: bool,
    break_state: bool,
    command_frame_start_time: Ticks,
    command_frame_end_time: Ticks,
    command_deassert_time: Ticks,
    command_cycles_per_bit: u32,
    command_buffer_index: usize,
    command_buffer: [u8; 5],
    poll_count: u32,
    pending_device_id: u8,
    loading_state: bool,
    raw: raw::RawDevices,
    trace: Option<SioTrace>,
}

impl SioManager {
    pub fn new(owner: OwnerId) -> Self {
        SioManager {
            owner,
            settings: SioSettings::default(),
            slots: Vec::new(),
            accel: None,
            command_asserted: false,
            motor_asserted: false,
            ready: true,
            break_state: false,
            command_frame_start_time: 0,
            command_frame_end_time: 0,
            command_deassert_time: 0,
            command_cycles_per_bit: 0,
            command_buffer_index: 0,
            command_buffer: [0; 5],
            poll_count: 0,
            pending_device_id: 0,
            loading_state: false,
            raw: raw::RawDevices::default(),
            trace: None,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn owns_event(&self, ev: &ScheduledEvent) -> bool {
        ev.owner == self.owner
    }

    pub fn settings(&self) -> SioSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: SioSettings) {
        self.settings = settings;
    }

    pub fn apply_settings(&mut self, ps: &PropertySet) {
        self.settings = SioSettings::from_props(ps);
        debug!("SIO: settings {:?}", self.settings);
    }
    /// Returns `true` if the OS SIO vector should be routed to [SioManager::on_hook_siov].
    pub fn is_siov_hook_enabled(&self) -> bool {
        let s = &self.settings;
        s.sio_patch && (s.disk_accel || s.other_accel || s.fast_boot)
    }
    /// Starts recording bus activity.
    pub fn attach_trace(&mut self, trace: SharedTrace) {
        self.trace = SioTrace::new(trace);
    }

    pub fn detach_trace(&mut self) {
        self.trace = None;
    }

    pub fn is_command_asserted(&self) -> bool {
        self.command_asserted
    }

    pub fn is_motor_asserted(&self) -> bool {
        self.motor_asserted
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count
    }
    /// Attaches a device. Devices are offered commands in attach order.
    pub fn add_device(&mut self, device: SharedSioDevice) -> SioInterfaceId {
        let mut iface = SioInterface::new(device);
        iface.truncation_enabled = self.settings.command_truncation;
        iface.deassert_check_enabled = self.settings.deassert_check;
        match self.slots.iter().position(Option::is_none) {
            Some(idx) => {
                self.slots[idx] = Some(iface);
                SioInterfaceId(idx)
            }
            None => {
                self.slots.push(Some(iface));
                SioInterfaceId(self.slots.len() - 1)
            }
        }
    }
    /// Detaches a device, cancelling its active command.
    pub fn remove_device(&mut self, sched: &mut Scheduler, id: SioInterfaceId) {
        if self.iface(id.0).is_some() {
            self.cancel_command(id.0, sched);
            self.slots[id.0] = None;
        }
    }

    pub fn interface(&self, id: SioInterfaceId) -> Option<&SioInterface> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }
    /// Lets a device queue steps outside of its callbacks, then runs them.
    pub fn with_interface<R, F>(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost,
                                id: SioInterfaceId, f: F) -> Result<R, SioError>
        where F: FnOnce(&mut SioInterface) -> R
    {
        self.prepare(id.0, sched.now());
        let res = match self.iface_mut(id.0) {
            Some(iface) => f(iface),
            None => return Err(SioError::UnknownInterface)
        };
        self.flush_dead_events(id.0, sched);
        self.execute_next_step(id.0, sched, host, None);
        Ok(res)
    }
    /// Cancels the active command of a device, notifying it.
    pub fn cancel_device_command(&mut self, sched: &mut Scheduler, id: SioInterfaceId) {
        self.cancel_command(id.0, sched);
    }

    pub fn cancel_all_commands(&mut self, sched: &mut Scheduler) {
        for idx in 0..self.slots.len() {
            self.cancel_command(idx, sched);
        }
    }

    pub fn is_any_command_active(&self) -> bool {
        self.slots.iter().flatten().any(|i| i.command_active)
    }

    pub fn reset(&mut self, sched: &mut Scheduler) {
        self.cancel_all_commands(sched);
        self.command_asserted = false;
        self.command_buffer_index = 0;
        self.poll_count = 0;
        self.break_state = false;
    }
    /// Handles a byte transmitted by POKEY. Returns `true` if the computer may receive the
    /// reply bytes in burst mode.
    pub fn pokey_write_sio(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost,
                           byte: u8, cycles_per_bit: u32, _framing_error: bool, truncated: bool) -> bool
    {
        if cycles_per_bit == 0 {
            return false
        }
        let now = sched.now();
        if let Some(trace) = self.trace.as_mut() {
            trace.send_byte(now, byte, cycles_per_bit);
        }
        if (self.command_asserted || self.command_buffer_index > 0) && self.command_buffer_index < 5 {
            if self.command_buffer_index == 0 {
                self.command_frame_start_time = now.saturating_sub(10 * cycles_per_bit as Ticks);
            }
            self.command_buffer[self.command_buffer_index] = byte;
            self.command_buffer_index += 1;
            self.command_cycles_per_bit = cycles_per_bit;
            if self.command_buffer_index >= 5 {
                self.command_frame_end_time = now;
                if !self.command_asserted {
                    self.process_command_frame(sched, host);
                }
            }
        }
        let mut burst = false;
        for idx in 0..self.slots.len() {
            if self.iface(idx).map_or(false, |i| i.receiving) {
                burst |= self.on_receive(idx, sched, host, byte, cycles_per_bit);
            }
        }
        let command = self.command_asserted;
        self.notify_raw(sched, host, |dev, bus| {
            dev.on_receive_byte(byte, command, cycles_per_bit, bus);
            if truncated {
                dev.on_truncate_byte(bus);
            }
        });
        burst
    }
    /// The computer lowered the command line.
    pub fn pokey_begin_command(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost) {
        if !self.loading_state {
            self.command_buffer_index = 0;
        }
        if !self.command_asserted {
            self.command_asserted = true;
            if let Some(trace) = self.trace.as_mut() {
                trace.command_asserted(sched.now());
            }
            self.notify_raw(sched, host, |dev, bus| dev.on_command_state_changed(true, bus));
        }
    }
    /// The computer raised the command line.
    pub fn pokey_end_command(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost) {
        if !self.command_asserted {
            return
        }
        self.command_asserted = false;
        self.command_deassert_time = sched.now();
        if let Some(trace) = self.trace.as_mut() {
            trace.command_deasserted(sched.now());
        }
        if self.command_buffer_index >= 5 {
            self.process_command_frame(sched, host);
        }
        self.notify_raw(sched, host, |dev, bus| dev.on_command_state_changed(false, bus));
    }
    /// POKEY's serial input is ready for the next byte.
    pub fn pokey_ser_in_ready(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost) {
        self.notify_raw(sched, host, |dev, bus| dev.on_send_ready(bus));
        for idx in 0..self.slots.len() {
            if self.iface(idx).map_or(false, |i| i.sending) && !self.on_send_ready(idx, sched) {
                if let Some(iface) = self.iface_mut(idx) {
                    iface.sending = false;
                }
            }
        }
    }

    pub fn pokey_set_break(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost, brk: bool) {
        if self.break_state != brk {
            self.break_state = brk;
            self.notify_raw(sched, host, |dev, bus| dev.on_break_state_changed(brk, bus));
        }
    }
    /// The motor control line, driven by PIA CA2. The motor runs while CA2 is low.
    pub fn set_motor_line(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost, ca2_output: bool) {
        let asserted = !ca2_output;
        if self.motor_asserted != asserted {
            self.motor_asserted = asserted;
            self.notify_raw(sched, host, |dev, bus| dev.on_motor_state_changed(asserted, bus));
        }
    }

    pub fn set_ready_state(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost, ready: bool) {
        if self.ready != ready {
            self.ready = ready;
            self.notify_raw(sched, host, |dev, bus| dev.on_ready_state_changed(ready, bus));
        }
    }

    pub fn on_scheduled_event(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost, ev: ScheduledEvent) {
        let idx = (ev.id >> 1) as usize;
        match ev.id & 1 {
            EV_DELAY => {
                if let Some(iface) = self.iface_mut(idx) {
                    iface.delay_event = None;
                    iface.current = None;
                }
                self.execute_next_step(idx, sched, host, None);
            }
            _ => self.on_send_event(idx, sched, host)
        }
    }
    /// Handles a call to the OS SIO vector.
    ///
    /// Returns the registers the vector should return with, or `None` if the request has to
    /// go through the OS.
    pub fn on_hook_siov(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost,
                        mem: &mut MemoryManager, cpu_flags: u8) -> Option<AccelReturn>
    {
        const FLAG_I: u8 = 0x04;
        if !self.is_siov_hook_enabled() || cpu_flags & FLAG_I != 0 {
            return None
        }
        let req = SioRequest::read_dcb(mem);
        self.try_accel_request(sched, host, mem, req, false)
    }
    /// Tries to complete a request without going through the wire.
    pub fn try_accel_request(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost,
                             mem: &mut MemoryManager, mut req: SioRequest, pbi: bool) -> Option<AccelReturn>
    {
        debug!("SIO: request device ${:02X} command ${:02X} mode ${:02X} address ${:04X} length ${:04X} aux ${:02X}{:02X}",
            req.device, req.command, req.mode, req.address, req.length, req.aux[1], req.aux[0]);
        if self.is_any_command_active() || self.command_asserted {
            return None
        }
        // a read that clobbers TIMFLG would end the OS wait loop early
        if req.buffer_overlaps(accel::kernel::TIMFLG) {
            return None
        }
        if mem.debug_read_byte(accel::kernel::BRKKEY) == 0 {
            return None
        }
        if req.mode & 0xC0 == 0xC0 {
            return None
        }
        let allowed = if req.is_disk() { self.settings.disk_accel } else { self.settings.other_accel };
        let skew_before = self.total_skew();
        let mut status = accel::STATUS_SUCCESS;
        let mut handled = false;
        if allowed {
            loop {
                req.poll_count = self.poll_count;
                self.pending_device_id = req.device;
                self.command_frame_end_time = sched.now();
                self.command_deassert_time = sched.now();
                self.accel = Some(AccelState { req, status });
                let mut outcome = AccelOutcome::NotHandled;
                for idx in 0..self.slots.len() {
                    outcome = self.try_accel_command(idx, sched, host, mem, &req);
                    if outcome != AccelOutcome::NotHandled {
                        break
                    }
                }
                if let Some(state) = self.accel.take() {
                    status = state.status;
                }
                match outcome {
                    AccelOutcome::Bypass => return None,
                    AccelOutcome::Handled => {
                        handled = true;
                        break
                    }
                    AccelOutcome::NotHandled => {}
                }
                if self.settings.fast_boot && req.is_type3_poll() {
                    self.poll_count += 1;
                    if self.poll_count <= FAST_BOOT_POLL_LIMIT {
                        continue
                    }
                }
                break
            }
        }
        if !handled {
            // hard-wired answers for devices nobody claimed
            match req.device {
                0x4F if self.settings.fast_boot => status = accel::STATUS_TIMEOUT,
                _ => return None
            }
        }
        self.update_poll_state(req.command, req.aux);
        let skew = self.total_skew() - skew_before;
        if let Some(trace) = self.trace.as_mut() {
            trace.accel_request(sched.now(), &req, status, skew);
        }
        debug!("SIO: accelerated request completed, status ${:02X}, skew {}", status, skew);
        Some(accel::finish_request(mem, status, pbi, skew))
    }

    fn total_skew(&self) -> u64 {
        self.slots.iter().flatten().map(|i| i.accel_time_skew).sum()
    }

    fn update_poll_state(&mut self, command: u8, aux: [u8; 2]) {
        if command == 0x40 && aux == [0, 0] {
            self.poll_count += 1;
        }
        else {
            self.poll_count = 0;
        }
    }

    fn process_command_frame(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost) {
        let frame = self.command_buffer;
        if sio_checksum(&frame[..4]) != frame[4] {
            debug!("SIO: command frame {:02X?} has a bad checksum", frame);
            return
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.command_frame(self.command_frame_start_time, self.command_frame_end_time, &frame);
        }
        let cpb = self.command_cycles_per_bit;
        let cmd = SioCommand {
            device: frame[0],
            command: frame[1],
            aux: [frame[2], frame[3]],
            cycles_per_bit: cpb,
            standard_rate: (91..=98).contains(&cpb),
            early_deassert: self.command_deassert_time < self.command_frame_end_time,
            poll_count: self.poll_count,
        };
        debug!("SIO: command frame {:02X?}", frame);
        self.update_poll_state(cmd.command, cmd.aux);
        self.pending_device_id = cmd.device;
        for idx in 0..self.slots.len() {
            if self.try_process_command(idx, sched, host, &cmd) {
                break
            }
        }
    }

    fn try_process_command(&mut self, idx: usize, sched: &mut Scheduler, host: &mut dyn SioHost,
                           cmd: &SioCommand) -> bool
    {
        match self.iface(idx) {
            Some(iface) => {
                if !iface.truncation_enabled && iface.command_active {
                    return false
                }
                if iface.deassert_check_enabled && cmd.early_deassert {
                    return false
                }
            }
            None => return false
        }
        self.prepare(idx, sched.now());
        let response = match self.iface_mut(idx) {
            Some(iface) => {
                let device = iface.device.clone();
                let response = device.borrow_mut().on_serial_begin_command(cmd, iface);
                response
            }
            None => return false
        };
        self.flush_dead_events(idx, sched);
        match response {
            CmdResponse::NotHandled | CmdResponse::BypassAccel => {
                self.cancel_command(idx, sched);
                return false
            }
            _ => self.apply_response(idx, response)
        }
        self.execute_next_step(idx, sched, host, None);
        true
    }

    fn try_accel_command(&mut self, idx: usize, sched: &mut Scheduler, host: &mut dyn SioHost,
                         mem: &mut MemoryManager, req: &SioRequest) -> AccelOutcome
    {
        self.prepare(idx, sched.now());
        let response = match self.iface_mut(idx) {
            Some(iface) => {
                let device = iface.device.clone();
                let response = device.borrow_mut().on_serial_accel_command(req, iface);
                response
            }
            None => return AccelOutcome::NotHandled
        };
        self.flush_dead_events(idx, sched);
        match response {
            CmdResponse::NotHandled => return AccelOutcome::NotHandled,
            CmdResponse::BypassAccel => return AccelOutcome::Bypass,
            _ => self.apply_response(idx, response)
        }
        self.execute_next_step(idx, sched, host, Some(mem));
        AccelOutcome::Handled
    }

    fn apply_response(&mut self, idx: usize, response: CmdResponse) {
        if let Some(iface) = self.iface_mut(idx) {
            match response {
                CmdResponse::SendAckComplete => {
                    iface.begin_command();
                    iface.send_ack();
                    iface.send_complete(true);
                    iface.end_command();
                }
                CmdResponse::FailNak => {
                    iface.begin_command();
                    iface.send_nak();
                    iface.end_command();
                }
                _ => {}
            }
        }
    }
    /// Supplies an interface with the bus context of the upcoming device call.
    fn prepare(&mut self, idx: usize, now: Ticks) {
        let accel = self.accel.is_some();
        let (frame_end, deassert, device_id) =
            (self.command_frame_end_time, self.command_deassert_time, self.pending_device_id);
        if let Some(iface) = self.iface_mut(idx) {
            iface.now = now;
            iface.accel = accel;
            iface.frame_end_time = frame_end;
            iface.deassert_time = deassert;
            iface.pending_device_id = device_id;
            iface.pending_is_disk = is_disk_device(device_id);
        }
    }

    fn flush_dead_events(&mut self, idx: usize, sched: &mut Scheduler) {
        if let Some(iface) = self.iface_mut(idx) {
            for ev in iface.dead_events.drain(..) {
                sched.cancel(ev);
            }
        }
    }

    fn cancel_command(&mut self, idx: usize, sched: &mut Scheduler) {
        let device = match self.iface_mut(idx) {
            Some(iface) if iface.command_active => {
                iface.drop_command();
                iface.device.clone()
            }
            _ => return
        };
        self.flush_dead_events(idx, sched);
        debug!("SIO: command cancelled on interface {}", idx);
        device.borrow_mut().on_serial_abort_command();
    }

    fn iface(&self, idx: usize) -> Option<&SioInterface> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn iface_mut(&mut self, idx: usize) -> Option<&mut SioInterface> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn event_id(idx: usize, kind: u32) -> u32 {
        ((idx as u32) << 1) | kind
    }

    fn burst_enabled(&self, disk: bool) -> bool {
        if disk { self.settings.disk_burst } else { self.settings.burst }
    }
    /// Runs queued steps until one has to wait for the scheduler or the queue is empty.
    fn execute_next_step(&mut self, idx: usize, sched: &mut Scheduler, host: &mut dyn SioHost,
                         mut mem: Option<&mut MemoryManager>)
    {
        loop {
            let owner = self.owner;
            let iface = match self.slots.get_mut(idx).and_then(Option::as_mut) {
                Some(iface) => iface,
                None => return
            };
            if iface.current.is_some() {
                return
            }
            let step = match iface.steps.pop_front() {
                Some(step) => step,
                None => return
            };
            trace!("SIO: interface {} step {}", idx, step);
            iface.current = Some(step);
            let accel = match (self.accel.as_mut(), mem.as_deref_mut()) {
                (Some(state), Some(mem)) => Some((state, mem)),
                _ => None
            };
            match step {
                Step::Send {..} | Step::SendAuto {..} => {
                    iface.transfer_send = true;
                    iface.transfer_start = iface.transfer_index;
                    iface.transfer_end = iface.transfer_start + step.transfer_len() as usize;
                    iface.burst_offset = 0;
                    iface.last_burst_offset = 0;
                    if let Some((state, mem)) = accel {
                        accel::send_to_memory(iface, step, state, mem);
                        iface.transfer_index = iface.transfer_end;
                        iface.transfer_start = iface.transfer_end;
                        iface.current = None;
                    }
                    else {
                        iface.sending = true;
                        self.on_send_event(idx, sched, host);
                        return
                    }
                }
                Step::Receive {..} | Step::ReceiveAuto {..} => {
                    iface.transfer_send = false;
                    iface.transfer_error = false;
                    iface.transfer_start = iface.transfer_index;
                    iface.transfer_end = iface.transfer_start + step.transfer_len() as usize;
                    iface.update_receive_window();
                    if let Some((state, mem)) = accel {
                        let ok = accel::receive_from_memory(iface, step, state, mem);
                        iface.transfer_index = iface.transfer_end;
                        self.complete_receive(idx, sched, ok);
                    }
                    else {
                        iface.receiving = true;
                        iface.transfer_start_time = sched.now();
                    }
                }
                Step::SetTransferRate { cycles_per_bit, cycles_per_byte } => {
                    iface.cycles_per_bit = cycles_per_bit;
                    iface.cycles_per_byte = cycles_per_byte;
                    iface.update_receive_window();
                    iface.current = None;
                }
                Step::SetSynchronousTransmit(sync) => {
                    iface.sync_transmit = sync;
                    iface.current = None;
                }
                Step::Delay(ticks) => {
                    if accel.is_some() {
                        iface.accel_time_skew += ticks as u64;
                        iface.current = None;
                    }
                    else {
                        sched.set_event(ticks as Ticks, owner, Self::event_id(idx, EV_DELAY), &mut iface.delay_event);
                    }
                }
                Step::Fence(id) => {
                    iface.current = None;
                    let device = iface.device.clone();
                    self.prepare(idx, sched.now());
                    if let Some(iface) = self.iface_mut(idx) {
                        device.borrow_mut().on_serial_fence(id, iface);
                    }
                    self.flush_dead_events(idx, sched);
                }
                Step::EndCommand => {
                    iface.command_active = false;
                    iface.active_device_id = 0;
                    iface.current = None;
                    iface.steps.clear();
                    iface.buffer.clear();
                    iface.transfer_start = 0;
                    iface.transfer_index = 0;
                    iface.transfer_end = 0;
                    return
                }
                Step::AccelSendAck | Step::AccelSendComplete |
                Step::AccelSendNak | Step::AccelSendError => {
                    iface.accel_time_skew += iface.cycles_per_byte as u64;
                    iface.current = None;
                    if let Some((state, _)) = accel {
                        match step {
                            Step::AccelSendNak => state.status = accel::STATUS_NAK,
                            Step::AccelSendError => state.status = accel::STATUS_DEVICE_ERROR,
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    /// Finishes a receive step whose transfer window is full.
    fn complete_receive(&mut self, idx: usize, sched: &mut Scheduler, checksum_ok: bool) {
        let now = sched.now();
        let (device, step, data) = match self.iface_mut(idx) {
            Some(iface) => {
                let step = match iface.current {
                    Some(step) => step,
                    None => return
                };
                let start = iface.transfer_start;
                let end = iface.transfer_end;
                iface.transfer_start = end;
                iface.receiving = false;
                if let Step::ReceiveAuto {..} = step {
                    if !checksum_ok {
                        debug!("SIO: received frame has a bad checksum");
                        iface.steps.clear();
                        iface.current = None;
                        // bytes of the dropped steps, starting with the queued ACK
                        iface.buffer.truncate(end);
                        iface.transfer_index = end;
                        iface.delay(interface::RECEIVE_REPLY_DELAY);
                        iface.send_nak();
                        iface.end_command();
                        return
                    }
                }
                let data_end = if let Step::ReceiveAuto {..} = step { end - 1 } else { end };
                (iface.device.clone(), step, iface.buffer[start..data_end].to_vec())
            }
            None => return
        };
        let id = match step {
            Step::Receive { id, .. } | Step::ReceiveAuto { id, .. } => id,
            _ => 0
        };
        let ok = match step {
            Step::ReceiveAuto {..} => true,
            _ => checksum_ok
        };
        self.prepare(idx, now);
        if let Some(iface) = self.iface_mut(idx) {
            device.borrow_mut().on_serial_receive_complete(id, &data, ok, iface);
            iface.current = None;
        }
        self.flush_dead_events(idx, sched);
    }
    /// Handles a byte sent by the computer to a receiving interface.
    fn on_receive(&mut self, idx: usize, sched: &mut Scheduler, host: &mut dyn SioHost,
                  byte: u8, cycles_per_bit: u32) -> bool
    {
        let now = sched.now();
        let (done, ok, disk) = match self.iface_mut(idx) {
            Some(iface) => {
                if iface.transfer_index >= iface.transfer_end || iface.transfer_send {
                    iface.receiving = false;
                    return false
                }
                if cycles_per_bit < iface.recv_cycles_per_bit_min || cycles_per_bit > iface.recv_cycles_per_bit_max {
                    iface.transfer_error = true;
                }
                // the byte is kept even if the rate is off, drives ignore the stop bit
                iface.buffer[iface.transfer_index] = byte;
                iface.transfer_index += 1;
                let done = iface.transfer_index >= iface.transfer_end;
                let mut ok = false;
                if done {
                    let data = &iface.buffer[iface.transfer_start..iface.transfer_end];
                    ok = !iface.transfer_error && match data.split_last() {
                        Some((sum, body)) => sio_checksum(body) == *sum,
                        None => true
                    };
                    iface.command_queue_time += now.saturating_sub(iface.transfer_start_time);
                }
                (done, ok, iface.active_device_disk)
            }
            None => return false
        };
        if done {
            self.complete_receive(idx, sched, ok);
            self.execute_next_step(idx, sched, host, None);
        }
        self.burst_enabled(disk)
    }
    /// Sends the next byte of the current send step, or finishes the step.
    fn on_send_event(&mut self, idx: usize, sched: &mut Scheduler, host: &mut dyn SioHost) {
        let owner = self.owner;
        let burst_settings = (self.settings.burst, self.settings.disk_burst);
        let iface = match self.slots.get_mut(idx).and_then(Option::as_mut) {
            Some(iface) => iface,
            None => return
        };
        iface.transfer_event = None;
        if iface.transfer_index < iface.transfer_end {
            let byte = iface.buffer[iface.transfer_index];
            iface.transfer_index += 1;
            let burst = if iface.active_device_disk { burst_settings.1 } else { burst_settings.0 };
            host.receive_sio_byte(byte, iface.cycles_per_bit, true, burst, iface.sync_transmit, false);
            if let Some(trace) = self.trace.as_mut() {
                if iface.transfer_end - iface.transfer_start == 1 {
                    trace.reply(sched.now(), byte, iface.cycles_per_bit);
                }
                trace.receive_byte(sched.now(), byte, iface.cycles_per_bit);
            }
            let delay = iface.cycles_per_byte as Ticks + iface.burst_offset as Ticks;
            sched.set_event(delay, owner, Self::event_id(idx, EV_SEND), &mut iface.transfer_event);
            iface.last_burst_offset = iface.burst_offset;
            iface.burst_offset = 0;
        }
        else {
            iface.transfer_start = iface.transfer_end;
            iface.current = None;
            iface.sending = false;
            self.execute_next_step(idx, sched, host, None);
        }
    }
    /// Shortens the gap before the next byte when the computer is ready early.
    fn on_send_ready(&mut self, idx: usize, sched: &mut Scheduler) -> bool {
        let owner = self.owner;
        let iface = match self.iface_mut(idx) {
            Some(iface) => iface,
            None => return false
        };
        let ev = match iface.transfer_event {
            Some(ev) if iface.transfer_send => ev,
            _ => return false
        };
        if iface.transfer_index - iface.transfer_start < 3 {
            return true
        }
        let existing = sched.ticks_to_event(ev).unwrap_or(0);
        if existing > 50 {
            // the shortened gap is paid back on the next byte, so last time's offset is not skew
            iface.accel_time_skew -= iface.last_burst_offset as u64;
            iface.burst_offset = (existing - 50) as u32;
            iface.accel_time_skew += iface.burst_offset as u64;
            sched.set_event(50, owner, Self::event_id(idx, EV_SEND), &mut iface.transfer_event);
        }
        true
    }

    pub fn dump_status(&self) -> String {
        let mut out = format!("Command line: {}  Motor: {}  Ready: {}  Frame: {:02X?} ({}/5)\n",
            if self.command_asserted { "asserted" } else { "idle" },
            if self.motor_asserted { "on" } else { "off" },
            self.ready, self.command_buffer, self.command_buffer_index);
        for (idx, iface) in self.slots.iter().enumerate() {
            if let Some(iface) = iface {
                out.push_str(&format!("Interface {}: {} device ${:02X} step {:?} queued {} skew {}\n",
                    idx, if iface.command_active { "active" } else { "idle" },
                    iface.active_device_id, iface.current, iface.steps.len(), iface.accel_time_skew));
            }
        }
        out
    }
}
