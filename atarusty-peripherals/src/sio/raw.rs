/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Devices observing the SIO bus at the byte and line level.
use core::cell::RefCell;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::{Scheduler, Ticks};

use super::{SioHost, SioManager};

/// Implemented by devices that see every byte and line change on the bus.
///
/// Callbacks may add and remove raw devices through the given bus. A device added during a
/// notification does not receive it, a device removed during a notification does not receive
/// it either if it has not already.
pub trait RawSioDevice {
    fn on_command_state_changed(&mut self, _asserted: bool, _bus: &mut SioBus<'_>) {}
    fn on_motor_state_changed(&mut self, _asserted: bool, _bus: &mut SioBus<'_>) {}
    /// A byte sent by the computer.
    fn on_receive_byte(&mut self, _byte: u8, _command: bool, _cycles_per_bit: u32, _bus: &mut SioBus<'_>) {}
    /// The last received byte was cut short.
    fn on_truncate_byte(&mut self, _bus: &mut SioBus<'_>) {}
    /// The computer is ready to receive the next byte.
    fn on_send_ready(&mut self, _bus: &mut SioBus<'_>) {}
    fn on_break_state_changed(&mut self, _brk: bool, _bus: &mut SioBus<'_>) {}
    fn on_ready_state_changed(&mut self, _ready: bool, _bus: &mut SioBus<'_>) {}
}

pub type SharedRawSioDevice = Rc<RefCell<dyn RawSioDevice>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawDeviceId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ExternalClock {
    id: RawDeviceId,
    time_base: Ticks,
    period: u32,
}

#[derive(Default)]
pub(super) struct RawDevices {
    list: Vec<Option<(RawDeviceId, SharedRawSioDevice)>>,
    added: Vec<(RawDeviceId, SharedRawSioDevice)>,
    busy: u32,
    last_id: u32,
    interrupt: Vec<RawDeviceId>,
    proceed: Vec<RawDeviceId>,
    clocks: Vec<ExternalClock>,
}

impl RawDevices {
    fn add(&mut self, dev: SharedRawSioDevice) -> RawDeviceId {
        self.last_id += 1;
        let id = RawDeviceId(self.last_id);
        if self.busy > 0 {
            self.added.push((id, dev));
        }
        else {
            self.list.push(Some((id, dev)));
        }
        id
    }

    fn remove(&mut self, id: RawDeviceId) -> bool {
        if let Some(pos) = self.added.iter().position(|(i, _)| *i == id) {
            self.added.remove(pos);
            return true
        }
        match self.list.iter().position(|e| matches!(e, Some((i, _)) if *i == id)) {
            Some(pos) if self.busy > 0 => {
                self.list[pos] = None;
                true
            }
            Some(pos) => {
                self.list.remove(pos);
                true
            }
            None => false
        }
    }

    fn release(&mut self) {
        self.busy -= 1;
        if self.busy == 0 {
            self.list.retain(Option::is_some);
            self.list.extend(self.added.drain(..).map(Some));
        }
    }

    pub fn len(&self) -> usize {
        self.list.iter().filter(|e| e.is_some()).count() + self.added.len()
    }
}

/// Inserts or removes `id` from a device bag. Returns `true` if the bag's emptiness changed.
fn update_bag(bag: &mut Vec<RawDeviceId>, id: RawDeviceId, member: bool) -> bool {
    let was_empty = bag.is_empty();
    match bag.binary_search(&id) {
        Ok(pos) if !member => { bag.remove(pos); }
        Err(pos) if member => bag.insert(pos, id),
        _ => {}
    }
    was_empty != bag.is_empty()
}

/// The bus as seen by raw devices during a notification.
pub struct SioBus<'a> {
    pub(super) mgr: &'a mut SioManager,
    pub(super) sched: &'a mut Scheduler,
    pub(super) host: &'a mut dyn SioHost,
}

impl<'a> SioBus<'a> {
    pub fn new(mgr: &'a mut SioManager, sched: &'a mut Scheduler, host: &'a mut dyn SioHost) -> Self {
        SioBus { mgr, sched, host }
    }

    pub fn now(&self) -> Ticks {
        self.sched.now()
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        self.sched
    }

    pub fn is_command_asserted(&self) -> bool {
        self.mgr.is_command_asserted()
    }

    pub fn is_motor_asserted(&self) -> bool {
        self.mgr.is_motor_asserted()
    }
    /// Sends a byte to the computer outside of any command.
    pub fn send_raw_byte(&mut self, byte: u8, cycles_per_bit: u32, synchronous: bool, framing_error: bool) {
        self.mgr.send_raw_byte(self.sched, self.host, byte, cycles_per_bit, synchronous, framing_error)
    }
    /// Drives the data input line directly.
    pub fn set_raw_input(&mut self, level: bool) {
        self.host.set_data_line(level);
    }

    pub fn add_raw_device(&mut self, dev: SharedRawSioDevice) -> RawDeviceId {
        self.mgr.add_raw_device(dev)
    }

    pub fn remove_raw_device(&mut self, id: RawDeviceId) {
        self.mgr.remove_raw_device(self.host, id)
    }

    pub fn set_sio_interrupt(&mut self, id: RawDeviceId, asserted: bool) {
        self.mgr.set_sio_interrupt(self.host, id, asserted)
    }

    pub fn set_sio_proceed(&mut self, id: RawDeviceId, asserted: bool) {
        self.mgr.set_sio_proceed(self.host, id, asserted)
    }

    pub fn set_external_clock(&mut self, id: RawDeviceId, time_base: Ticks, period: u32) {
        self.mgr.set_external_clock(self.host, id, time_base, period)
    }
}

impl SioManager {
    /// Attaches a raw device. Safe to call during a raw device notification.
    pub fn add_raw_device(&mut self, dev: SharedRawSioDevice) -> RawDeviceId {
        let id = self.raw.add(dev);
        debug!("SIO: raw device {:?} added", id);
        id
    }
    /// Detaches a raw device and releases the lines and clock it holds.
    pub fn remove_raw_device(&mut self, host: &mut dyn SioHost, id: RawDeviceId) {
        if self.raw.remove(id) {
            debug!("SIO: raw device {:?} removed", id);
            self.set_sio_interrupt(host, id, false);
            self.set_sio_proceed(host, id, false);
            self.set_external_clock(host, id, 0, 0);
        }
    }

    pub fn raw_device_count(&self) -> usize {
        self.raw.len()
    }
    /// Sends a byte from a raw device to the computer.
    pub fn send_raw_byte(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost,
                         byte: u8, cycles_per_bit: u32, synchronous: bool, framing_error: bool)
    {
        host.receive_sio_byte(byte, cycles_per_bit, false, self.settings.burst, synchronous, framing_error);
        if let Some(trace) = self.trace.as_mut() {
            trace.receive_byte(sched.now(), byte, cycles_per_bit);
        }
    }
    /// Adds or removes a device from the set asserting the interrupt line (PIA CB1).
    pub fn set_sio_interrupt(&mut self, host: &mut dyn SioHost, id: RawDeviceId, asserted: bool) {
        if update_bag(&mut self.raw.interrupt, id, asserted) {
            host.set_interrupt_line(!self.raw.interrupt.is_empty());
        }
    }
    /// Adds or removes a device from the set asserting the proceed line (PIA CA1).
    pub fn set_sio_proceed(&mut self, host: &mut dyn SioHost, id: RawDeviceId, asserted: bool) {
        if update_bag(&mut self.raw.proceed, id, asserted) {
            host.set_proceed_line(!self.raw.proceed.is_empty());
        }
    }

    pub fn is_sio_interrupt_asserted(&self) -> bool {
        !self.raw.interrupt.is_empty()
    }

    pub fn is_sio_proceed_asserted(&self) -> bool {
        !self.raw.proceed.is_empty()
    }
    /// Registers an external serial clock of a device. A zero `period` unregisters it.
    ///
    /// The computer is clocked by the fastest registered clock.
    pub fn set_external_clock(&mut self, host: &mut dyn SioHost, id: RawDeviceId, time_base: Ticks, period: u32) {
        let clocks = &mut self.raw.clocks;
        let before = clocks.first().copied();
        clocks.retain(|c| c.id != id);
        if period != 0 {
            let pos = clocks.iter().position(|c| c.period > period).unwrap_or(clocks.len());
            clocks.insert(pos, ExternalClock { id, time_base, period });
        }
        let after = clocks.first().copied();
        if before != after {
            match after {
                Some(c) => host.set_external_clock(c.time_base, c.period),
                None => host.set_external_clock(0, 0)
            }
        }
    }

    pub(super) fn notify_raw<F>(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost, mut f: F)
        where F: FnMut(&mut dyn RawSioDevice, &mut SioBus<'_>)
    {
        self.raw.busy += 1;
        let count = self.raw.list.len();
        for i in 0..count {
            let dev = match self.raw.list.get(i) {
                Some(Some((_, dev))) => dev.clone(),
                _ => continue
            };
            let mut bus = SioBus { mgr: &mut *self, sched: &mut *sched, host: &mut *host };
            f(&mut *dev.borrow_mut(), &mut bus);
        }
        self.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atarusty_core::clock::OwnerId;
    use crate::sio::tests::RecordingHost;

    #[derive(Default)]
    struct Spy {
        bytes: Vec<(u8, bool)>,
        commands: Vec<bool>,
        remove: Option<RawDeviceId>,
        add: Option<SharedRawSioDevice>,
    }

    impl RawSioDevice for Spy {
        fn on_command_state_changed(&mut self, asserted: bool, bus: &mut SioBus<'_>) {
            self.commands.push(asserted);
            if let Some(id) = self.remove.take() {
                bus.remove_raw_device(id);
            }
            if let Some(dev) = self.add.take() {
                bus.add_raw_device(dev);
            }
        }

        fn on_receive_byte(&mut self, byte: u8, command: bool, _cpb: u32, bus: &mut SioBus<'_>) {
            self.bytes.push((byte, command));
            if byte == 0x55 {
                bus.send_raw_byte(0xAA, 94, false, false);
            }
        }
    }

    #[test]
    fn raw_devices_see_bytes_and_lines() {
        let mut sched = Scheduler::new();
        let mut host = RecordingHost::default();
        let mut sio = SioManager::new(OwnerId(9));
        let spy = Rc::new(RefCell::new(Spy::default()));
        sio.add_raw_device(spy.clone());
        sio.pokey_begin_command(&mut sched, &mut host);
        sio.pokey_write_sio(&mut sched, &mut host, 0x31, 93, false, false);
        sio.pokey_end_command(&mut sched, &mut host);
        sio.pokey_write_sio(&mut sched, &mut host, 0x55, 93, false, false);
        assert_eq!(spy.borrow().commands, [true, false]);
        assert_eq!(spy.borrow().bytes, [(0x31, true), (0x55, false)]);
        assert_eq!(host.bytes(), [0xAA]);
    }

    #[test]
    fn raw_list_changes_are_deferred() {
        let mut sched = Scheduler::new();
        let mut host = RecordingHost::default();
        let mut sio = SioManager::new(OwnerId(9));
        let first = Rc::new(RefCell::new(Spy::default()));
        let second = Rc::new(RefCell::new(Spy::default()));
        let late = Rc::new(RefCell::new(Spy::default()));
        sio.add_raw_device(first.clone());
        let second_id = sio.add_raw_device(second.clone());
        first.borrow_mut().remove = Some(second_id);
        first.borrow_mut().add = Some(late.clone());
        sio.pokey_begin_command(&mut sched, &mut host);
        assert_eq!(first.borrow().commands, [true]);
        assert!(second.borrow().commands.is_empty());
        assert!(late.borrow().commands.is_empty());
        assert_eq!(sio.raw_device_count(), 2);
        sio.pokey_end_command(&mut sched, &mut host);
        assert_eq!(first.borrow().commands, [true, false]);
        assert!(second.borrow().commands.is_empty());
        assert_eq!(late.borrow().commands, [false]);
    }

    #[test]
    fn line_bags_work() {
        let mut host = RecordingHost::default();
        let mut sio = SioManager::new(OwnerId(9));
        let a = sio.add_raw_device(Rc::new(RefCell::new(Spy::default())));
        let b = sio.add_raw_device(Rc::new(RefCell::new(Spy::default())));
        sio.set_sio_interrupt(&mut host, a, true);
        sio.set_sio_interrupt(&mut host, b, true);
        sio.set_sio_interrupt(&mut host, a, false);
        assert!(sio.is_sio_interrupt_asserted());
        assert_eq!(host.interrupt, vec![true]);
        sio.remove_raw_device(&mut host, b);
        assert!(!sio.is_sio_interrupt_asserted());
        assert_eq!(host.interrupt, vec![true, false]);
        sio.set_sio_proceed(&mut host, a, true);
        sio.set_sio_proceed(&mut host, a, true);
        assert_eq!(host.proceed, vec![true]);
    }

    #[test]
    fn fastest_external_clock_wins() {
        let mut host = RecordingHost::default();
        let mut sio = SioManager::new(OwnerId(9));
        let a = sio.add_raw_device(Rc::new(RefCell::new(Spy::default())));
        let b = sio.add_raw_device(Rc::new(RefCell::new(Spy::default())));
        sio.set_external_clock(&mut host, a, 10, 100);
        sio.set_external_clock(&mut host, b, 20, 40);
        sio.set_external_clock(&mut host, a, 30, 200);
        assert_eq!(host.clock, vec![(10, 100), (20, 40)]);
        sio.set_external_clock(&mut host, b, 0, 0);
        assert_eq!(host.clock.last(), Some(&(30, 200)));
        sio.remove_raw_device(&mut host, a);
        assert_eq!(host.clock.last(), Some(&(0, 0)));
    }
}
