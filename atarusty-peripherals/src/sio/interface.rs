/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The device side of the SIO bus.
use core::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::{EventHandle, Ticks};

use super::accel::SioRequest;
use super::step::Step;
use super::{sio_checksum, MAX_TRANSFER_SIZE};

/// The reply byte of an acknowledged command frame.
pub const SIO_ACK: u8 = b'A';
/// The reply byte of a rejected command frame.
pub const SIO_NAK: u8 = b'N';
/// The reply byte of a successfully completed operation.
pub const SIO_COMPLETE: u8 = b'C';
/// The reply byte of a failed operation.
pub const SIO_ERROR: u8 = b'E';
/// Cycles inserted before a Complete or Error reply when an automatic delay was requested.
pub const AUTO_REPLY_DELAY: u32 = 450;
/// Cycles between the end of a received data frame and its ACK, and before a NAK.
pub const RECEIVE_REPLY_DELAY: u32 = 1530;
/// Cycles saved by skipping the command frame on an accelerated request.
pub const ACCEL_COMMAND_FRAME_SKEW: u64 = 2685 + 940 * 5 + 1040;

pub const DEFAULT_CYCLES_PER_BIT: u32 = 93;
pub const DEFAULT_CYCLES_PER_BYTE: u32 = 932;

/// A decoded command frame as seen by devices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SioCommand {
    pub device: u8,
    pub command: u8,
    pub aux: [u8; 2],
    /// Cycles per bit the frame was sent at.
    pub cycles_per_bit: u32,
    /// Set if the frame was sent close to the standard 19200 baud rate.
    pub standard_rate: bool,
    /// Set if the command line was raised before the frame was complete.
    pub early_deassert: bool,
    /// Number of consecutive type-3 polls preceding this frame.
    pub poll_count: u32,
}

impl SioCommand {
    pub fn aux_word(&self) -> u16 {
        u16::from_le_bytes(self.aux)
    }
}

/// A device's answer to a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdResponse {
    /// The command is not for this device.
    NotHandled,
    /// The device has queued steps of its own with [SioInterface::begin_command].
    Start,
    /// Replies with ACK and Complete.
    SendAckComplete,
    /// Replies with NAK.
    FailNak,
    /// The device claims the command but requests that it is not accelerated.
    BypassAccel,
}

/// Implemented by devices answering SIO command frames.
///
/// Every callback receives the device's own interface for queueing steps. Steps queued during
/// a callback start executing once the callback returns.
pub trait SioDevice {
    /// Called for each complete command frame with a valid checksum, in attach order, until a
    /// device handles it.
    fn on_serial_begin_command(&mut self, cmd: &SioCommand, iface: &mut SioInterface) -> CmdResponse;
    /// Called for a request issued through the OS SIO vector when acceleration is enabled.
    fn on_serial_accel_command(&mut self, _req: &SioRequest, _iface: &mut SioInterface) -> CmdResponse {
        CmdResponse::NotHandled
    }
    /// Called when a receive step completes. `data` excludes the checksum of an automatic receive.
    fn on_serial_receive_complete(&mut self, _id: u32, _data: &[u8], _checksum_ok: bool, _iface: &mut SioInterface) {}
    /// Called when a fence step is reached.
    fn on_serial_fence(&mut self, _id: u32, _iface: &mut SioInterface) {}
    /// Called when the bus cancels the device's active command.
    fn on_serial_abort_command(&mut self) {}
}

pub type SharedSioDevice = Rc<RefCell<dyn SioDevice>>;

/// A device attachment point on the SIO bus.
///
/// The interface owns the device's step queue and transfer buffer.
pub struct SioInterface {
    pub(super) device: SharedSioDevice,
    // supplied by the bus before each device callback
    pub(super) now: Ticks,
    pub(super) frame_end_time: Ticks,
    pub(super) deassert_time: Ticks,
    pub(super) pending_device_id: u8,
    pub(super) pending_is_disk: bool,
    pub(super) accel: bool,

    pub(super) command_active: bool,
    pub(super) active_device_id: u8,
    pub(super) active_device_disk: bool,
    pub(super) truncation_enabled: bool,
    pub(super) deassert_check_enabled: bool,
    pub(super) accel_time_skew: u64,
    pub(super) command_frame_end_time: Ticks,
    pub(super) command_deassert_time: Ticks,
    pub(super) command_queue_time: Ticks,
    pub(super) queue_cycles_per_byte: u32,

    pub(super) cycles_per_bit: u32,
    pub(super) recv_cycles_per_bit_min: u32,
    pub(super) recv_cycles_per_bit_max: u32,
    pub(super) cycles_per_byte: u32,
    pub(super) sync_transmit: bool,

    pub(super) steps: VecDeque<Step>,
    pub(super) current: Option<Step>,
    pub(super) buffer: Vec<u8>,
    pub(super) transfer_start: usize,
    pub(super) transfer_index: usize,
    pub(super) transfer_end: usize,
    pub(super) transfer_send: bool,
    pub(super) transfer_error: bool,
    pub(super) transfer_start_time: Ticks,
    pub(super) burst_offset: u32,
    pub(super) last_burst_offset: u32,
    pub(super) receiving: bool,
    pub(super) sending: bool,
    pub(super) delay_event: Option<EventHandle>,
    pub(super) transfer_event: Option<EventHandle>,
    pub(super) dead_events: Vec<EventHandle>,
}

impl SioInterface {
    pub(super) fn new(device: SharedSioDevice) -> Self {
        let mut iface = SioInterface {
            device,
            now: 0,
            frame_end_time: 0,
            deassert_time: 0,
            pending_device_id: 0,
            pending_is_disk: false,
            accel: false,
            command_active: false,
            active_device_id: 0,
            active_device_disk: false,
            truncation_enabled: true,
            deassert_check_enabled: false,
            accel_time_skew: 0,
            command_frame_end_time: 0,
            command_deassert_time: 0,
            command_queue_time: 0,
            queue_cycles_per_byte: DEFAULT_CYCLES_PER_BYTE,
            cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
            recv_cycles_per_bit_min: 0,
            recv_cycles_per_bit_max: 0,
            cycles_per_byte: DEFAULT_CYCLES_PER_BYTE,
            sync_transmit: false,
            steps: VecDeque::new(),
            current: None,
            buffer: Vec::new(),
            transfer_start: 0,
            transfer_index: 0,
            transfer_end: 0,
            transfer_send: false,
            transfer_error: false,
            transfer_start_time: 0,
            burst_offset: 0,
            last_burst_offset: 0,
            receiving: false,
            sending: false,
            delay_event: None,
            transfer_event: None,
            dead_events: Vec::new(),
        };
        iface.update_receive_window();
        iface
    }
    /// Returns the accumulated time saved by accelerated transfers, in cycles.
    ///
    /// The counter only grows. Devices modelling their own timing compare two readings.
    pub fn accel_time_skew(&self) -> u64 {
        self.accel_time_skew
    }
    /// Returns the estimated cycle at which all queued steps will have completed.
    pub fn command_queue_time(&self) -> Ticks {
        self.command_queue_time
    }

    pub fn command_frame_end_time(&self) -> Ticks {
        self.command_frame_end_time
    }

    pub fn command_deassert_time(&self) -> Ticks {
        self.command_deassert_time
    }

    pub fn is_command_active(&self) -> bool {
        self.command_active
    }
    /// Returns `true` while a command of this interface is being accelerated.
    pub fn is_active_command_accelerated(&self) -> bool {
        self.command_active && self.accel
    }

    pub fn active_device_id(&self) -> u8 {
        self.active_device_id
    }
    /// Returns the current cycle as last seen by the bus.
    pub fn now(&self) -> Ticks {
        self.now
    }
    /// Lets a new command frame for this interface cancel its active command.
    pub fn set_command_truncation_enabled(&mut self, enabled: bool) {
        self.truncation_enabled = enabled;
    }
    /// Ignores command frames whose command line was raised before the frame end.
    pub fn set_command_deassert_check_enabled(&mut self, enabled: bool) {
        self.deassert_check_enabled = enabled;
    }

    pub fn queue_len(&self) -> usize {
        self.steps.len()
    }

    pub fn current_step(&self) -> Option<Step> {
        self.current
    }
    /// Begins a new command, dropping the active one if there is any.
    pub fn begin_command(&mut self) {
        if self.command_active {
            debug!("SIO: command of device ${:02X} truncated", self.active_device_id);
            self.drop_command();
        }
        self.command_frame_end_time = self.frame_end_time;
        self.command_deassert_time = self.deassert_time;
        self.command_queue_time = self.now;
        self.active_device_id = self.pending_device_id;
        self.active_device_disk = self.pending_is_disk;
        if self.accel {
            self.accel_time_skew += ACCEL_COMMAND_FRAME_SKEW;
        }
        self.reset_transfer_params();
        self.command_active = true;
    }
    /// Queues `data`, optionally followed by its checksum.
    pub fn send_data(&mut self, data: &[u8], add_checksum: bool) {
        if !self.command_active || data.is_empty() {
            return
        }
        let len = data.len() + add_checksum as usize;
        if !self.reserve(len) {
            warn!("SIO: transfer buffer overflow, dropping {} bytes", len);
            return
        }
        self.command_queue_time += len as Ticks * self.queue_cycles_per_byte as Ticks;
        self.steps.push_back(if add_checksum {
            Step::SendAuto { len: len as u32 }
        }
        else {
            Step::Send { len: len as u32 }
        });
        self.buffer.extend_from_slice(data);
        if add_checksum {
            self.buffer.push(sio_checksum(data));
        }
    }

    pub fn send_ack(&mut self) {
        if self.accel {
            self.push_step(Step::AccelSendAck);
        }
        else {
            self.send_data(&[SIO_ACK], false);
        }
    }

    pub fn send_nak(&mut self) {
        if self.accel {
            self.push_step(Step::AccelSendNak);
        }
        else {
            self.send_data(&[SIO_NAK], false);
        }
    }

    pub fn send_complete(&mut self, auto_delay: bool) {
        if auto_delay {
            self.delay(AUTO_REPLY_DELAY);
        }
        if self.accel {
            self.push_step(Step::AccelSendComplete);
        }
        else {
            self.send_data(&[SIO_COMPLETE], false);
        }
    }

    pub fn send_error(&mut self, auto_delay: bool) {
        if auto_delay {
            self.delay(AUTO_REPLY_DELAY);
        }
        if self.accel {
            self.push_step(Step::AccelSendError);
        }
        else {
            self.send_data(&[SIO_ERROR], false);
        }
    }
    /// Queues a receive window of `len` bytes.
    ///
    /// With `auto_protocol` the window includes a checksum byte, and the interface replies with
    /// ACK on a valid checksum or NAK on a bad one.
    pub fn receive_data(&mut self, id: u32, len: usize, auto_protocol: bool) {
        if !self.command_active {
            return
        }
        let len = len + auto_protocol as usize;
        if !self.reserve(len) {
            warn!("SIO: transfer buffer overflow, dropping receive of {} bytes", len);
            return
        }
        let new_len = self.buffer.len() + len;
        self.buffer.resize(new_len, 0);
        let len = len as u32;
        if auto_protocol {
            self.steps.push_back(Step::ReceiveAuto { len, id });
            self.delay(RECEIVE_REPLY_DELAY);
            self.send_ack();
        }
        else {
            self.steps.push_back(Step::Receive { len, id });
        }
    }
    /// Changes the transfer rate of subsequent steps.
    pub fn set_transfer_rate(&mut self, cycles_per_bit: u32, cycles_per_byte: u32) {
        if cycles_per_bit == 0 || cycles_per_byte == 0 {
            return
        }
        self.steps.push_back(Step::SetTransferRate { cycles_per_bit, cycles_per_byte });
        self.queue_cycles_per_byte = cycles_per_byte;
    }

    pub fn set_synchronous_transmit(&mut self, enabled: bool) {
        if self.command_active {
            self.steps.push_back(Step::SetSynchronousTransmit(enabled));
        }
    }

    pub fn delay(&mut self, ticks: u32) {
        if !self.command_active || ticks == 0 {
            return
        }
        self.steps.push_back(Step::Delay(ticks));
        self.command_queue_time += ticks as Ticks;
    }
    /// Queues a fence. The device is notified with `id` when the fence is reached.
    pub fn insert_fence(&mut self, id: u32) {
        if self.command_active {
            self.steps.push_back(Step::Fence(id));
        }
    }
    /// Drops all queued steps that have not started yet.
    pub fn flush_queue(&mut self) {
        self.steps.clear();
    }

    pub fn end_command(&mut self) {
        if self.command_active {
            self.steps.push_back(Step::EndCommand);
        }
    }
    /// Runs a complete command: ACK, Complete or Error, optional data with checksum.
    pub fn handle_command(&mut self, data: &[u8], succeeded: bool) {
        self.begin_command();
        self.send_ack();
        if succeeded {
            self.send_complete(true);
        }
        else {
            self.send_error(true);
        }
        if !data.is_empty() {
            self.send_data(data, true);
        }
        self.end_command();
    }

    pub(super) fn push_step(&mut self, step: Step) {
        if self.command_active {
            self.steps.push_back(step);
        }
    }

    pub(super) fn reset_transfer_params(&mut self) {
        self.cycles_per_byte = DEFAULT_CYCLES_PER_BYTE;
        self.cycles_per_bit = DEFAULT_CYCLES_PER_BIT;
        self.sync_transmit = false;
        self.queue_cycles_per_byte = self.cycles_per_byte;
        self.update_receive_window();
    }

    pub(super) fn update_receive_window(&mut self) {
        let tolerance = (self.cycles_per_bit + 19) / 20;
        self.recv_cycles_per_bit_min = self.cycles_per_bit.saturating_sub(tolerance);
        self.recv_cycles_per_bit_max = self.cycles_per_bit + tolerance;
    }
    /// Clears the command state without notifying the device.
    pub(super) fn drop_command(&mut self) {
        self.kill_events();
        self.receiving = false;
        self.sending = false;
        self.steps.clear();
        self.current = None;
        self.buffer.clear();
        self.transfer_start = 0;
        self.transfer_index = 0;
        self.transfer_end = 0;
        self.active_device_id = 0;
        self.command_active = false;
    }

    pub(super) fn kill_events(&mut self) {
        if let Some(ev) = self.delay_event.take() {
            self.dead_events.push(ev);
        }
        if let Some(ev) = self.transfer_event.take() {
            self.dead_events.push(ev);
        }
    }
    /// Makes room for `len` more bytes in the transfer buffer.
    fn reserve(&mut self, len: usize) -> bool {
        if self.buffer.len() + len > MAX_TRANSFER_SIZE {
            self.shift_buffer();
            if self.buffer.len() + len > MAX_TRANSFER_SIZE {
                return false
            }
        }
        true
    }
    /// Discards bytes of already completed transfers.
    fn shift_buffer(&mut self) {
        let start = self.transfer_start;
        if start > 0 {
            self.buffer.drain(..start);
            self.transfer_index -= start;
            self.transfer_end -= start;
            self.transfer_start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    impl SioDevice for Null {
        fn on_serial_begin_command(&mut self, _cmd: &SioCommand, _iface: &mut SioInterface) -> CmdResponse {
            CmdResponse::NotHandled
        }
    }

    fn iface() -> SioInterface {
        SioInterface::new(Rc::new(RefCell::new(Null)))
    }

    #[test]
    fn steps_require_active_command() {
        let mut iface = iface();
        iface.send_data(b"xyz", true);
        iface.delay(100);
        iface.end_command();
        assert_eq!(iface.queue_len(), 0);
        iface.begin_command();
        assert!(iface.is_command_active());
        iface.send_data(&[], true);
        iface.delay(0);
        assert_eq!(iface.queue_len(), 0);
    }

    #[test]
    fn send_data_appends_checksum() {
        let mut iface = iface();
        iface.now = 1000;
        iface.begin_command();
        iface.send_ack();
        iface.send_complete(true);
        iface.send_data(&[0xDF, 0x00, 0xE0, 0x00], true);
        iface.end_command();
        assert_eq!(iface.steps, [
            Step::Send { len: 1 }, Step::Delay(AUTO_REPLY_DELAY), Step::Send { len: 1 },
            Step::SendAuto { len: 5 }, Step::EndCommand
        ]);
        assert_eq!(iface.buffer, [SIO_ACK, SIO_COMPLETE, 0xDF, 0x00, 0xE0, 0x00, sio_checksum(&[0xDF, 0x00, 0xE0, 0x00])]);
        assert_eq!(iface.command_queue_time(), 1000 + 7 * DEFAULT_CYCLES_PER_BYTE as Ticks + AUTO_REPLY_DELAY as Ticks);
    }

    #[test]
    fn accelerated_replies_are_synthesized() {
        let mut iface = iface();
        iface.accel = true;
        iface.begin_command();
        assert_eq!(iface.accel_time_skew(), ACCEL_COMMAND_FRAME_SKEW);
        iface.send_ack();
        iface.receive_data(5, 128, true);
        iface.send_error(false);
        assert_eq!(iface.steps, [
            Step::AccelSendAck, Step::ReceiveAuto { len: 129, id: 5 }, Step::Delay(RECEIVE_REPLY_DELAY),
            Step::AccelSendAck, Step::AccelSendError
        ]);
        assert_eq!(iface.buffer.len(), 129);
    }

    #[test]
    fn transfer_rate_sets_receive_window() {
        let mut iface = iface();
        assert_eq!((iface.recv_cycles_per_bit_min, iface.recv_cycles_per_bit_max), (88, 98));
        iface.cycles_per_bit = 40;
        iface.update_receive_window();
        assert_eq!((iface.recv_cycles_per_bit_min, iface.recv_cycles_per_bit_max), (38, 42));
        iface.begin_command();
        iface.set_transfer_rate(0, 100);
        assert_eq!(iface.queue_len(), 0);
        iface.set_transfer_rate(40, 400);
        assert_eq!(iface.queue_cycles_per_byte, 400);
    }

    #[test]
    fn buffer_overflow_is_refused() {
        let mut iface = iface();
        iface.begin_command();
        let big = vec![0u8; MAX_TRANSFER_SIZE - 1];
        iface.send_data(&big, false);
        assert_eq!(iface.queue_len(), 1);
        iface.send_data(&[1, 2], false);
        assert_eq!(iface.queue_len(), 1);
        // completed bytes are reclaimed
        iface.transfer_start = 100;
        iface.transfer_index = 100;
        iface.transfer_end = 100;
        iface.send_data(&[1, 2], false);
        assert_eq!(iface.queue_len(), 2);
        assert_eq!(iface.buffer.len(), MAX_TRANSFER_SIZE - 1 - 100 + 2);
        assert_eq!(iface.transfer_start, 0);
    }

    #[test]
    fn begin_command_truncates_active_command() {
        let mut iface = iface();
        iface.begin_command();
        iface.send_data(b"abc", false);
        iface.current = Some(Step::Send { len: 3 });
        iface.transfer_end = 3;
        iface.pending_device_id = 0x31;
        iface.begin_command();
        assert_eq!(iface.queue_len(), 0);
        assert_eq!(iface.current_step(), None);
        assert!(iface.buffer.is_empty());
        assert_eq!(iface.active_device_id(), 0x31);
    }
}
