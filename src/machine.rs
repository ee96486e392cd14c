/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! A host machine skeleton binding the ATARUSTY components together.
//!
//! [Machine] owns the cycle scheduler, the memory manager and the SIO manager. It stands in for
//! POKEY's serial port and the PIA lines the SIO bus is wired to, routes scheduled events to the
//! components that own them and carries out the requests custom devices make of the host.
//!
//! The CPU, ANTIC, GTIA and the rest of POKEY are not emulated here: a front end drives the
//! machine through [Machine::read_byte], [Machine::write_byte], [Machine::run_until] and the
//! POKEY serial port methods.
use std::cell::RefCell;
use std::{fmt, io};
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use atarusty_core::clock::{ClockHandle, OwnerId, ScheduledEvent, Scheduler, Ticks};
use atarusty_core::irq::IrqController;
use atarusty_core::props::PropertySet;
use atarusty_core::memory::{AccessMode, LayerId, MemoryError, MemoryManager, SharedMemory, PRI_BASE_MEMORY};
use atarusty_peripherals::blackbox::{BlackBoxCctl, BlackBoxFloppy, SharedBlackBox};
use atarusty_peripherals::multiplexer::{Multiplexer, MultiplexerCctl, SharedMultiplexer};
use atarusty_peripherals::multiplexer::net::MuxTransport;
use atarusty_peripherals::sio::{
    sio_checksum, AccelReturn, RawDeviceId, SharedRawSioDevice, SharedSioDevice, SioHost, SioInterfaceId, SioManager
};
use atarusty_custom::config::DeviceConfig;
use atarusty_custom::{CustomDevice, CustomDeviceSettings, HostRequest, SharedCustomDevice};

/// The PBI device select register on writes, the PBI interrupt status on reads.
pub const PBI_SELECT: u16 = 0xD1FF;
/// POKEY's serial rate at the standard 19200 baud.
pub const POKEY_CYCLES_PER_BIT: u32 = 93;
/// The spacing of command frame bytes sent by the OS.
pub const COMMAND_BYTE_CYCLES: Ticks = 930;
/// The delay between the last command frame byte and negating the command line.
pub const COMMAND_END_CYCLES: Ticks = 100;

const SIO_OWNER: OwnerId = OwnerId(1);
const FIRST_DEVICE_OWNER: u32 = 16;

bitflags::bitflags! {
    /// Console buttons, active high.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
    pub struct ConsoleButtons: u8 {
        const START  = 0b001;
        const SELECT = 0b010;
        const OPTION = 0b100;
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum MachineError {
    Memory(MemoryError),
    Firmware(io::Error),
}

impl std::error::Error for MachineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MachineError::Memory(err) => Some(err),
            MachineError::Firmware(err) => Some(err),
        }
    }
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::Memory(err) => write!(f, "memory layer error: {}", err),
            MachineError::Firmware(err) => write!(f, "firmware error: {}", err),
        }
    }
}

impl From<MemoryError> for MachineError {
    fn from(err: MemoryError) -> Self {
        MachineError::Memory(err)
    }
}

impl From<io::Error> for MachineError {
    fn from(err: io::Error) -> Self {
        MachineError::Firmware(err)
    }
}

/// A byte POKEY's serial input received from the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct SerialByte {
    pub byte: u8,
    pub cycles_per_bit: u32,
    pub tick: Ticks,
    pub framing_error: bool,
}

/// POKEY's serial port and the PIA lines of the SIO connector.
#[derive(Debug, Default)]
pub struct SerialPort {
    clock: ClockHandle,
    pub received: Vec<SerialByte>,
    pub data_line: bool,
    /// PIA CB1.
    pub interrupt: bool,
    /// PIA CA1.
    pub proceed: bool,
    pub external_clock: Option<(Ticks, u32)>,
}

impl SerialPort {
    pub fn new(clock: ClockHandle) -> Self {
        SerialPort { clock, data_line: true, ..SerialPort::default() }
    }
    /// Returns the values of the received bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.received.iter().map(|sb| sb.byte).collect()
    }

    pub fn take_received(&mut self) -> Vec<SerialByte> {
        std::mem::take(&mut self.received)
    }
}

impl SioHost for SerialPort {
    fn receive_sio_byte(&mut self, byte: u8, cycles_per_bit: u32, _simulate_input: bool,
                        _allow_burst: bool, _synchronous: bool, framing_error: bool)
    {
        trace!("POKEY: serial in {:02X} at {}", byte, self.clock.now());
        self.received.push(SerialByte { byte, cycles_per_bit, tick: self.clock.now(), framing_error });
    }

    fn set_data_line(&mut self, level: bool) {
        self.data_line = level;
    }

    fn set_interrupt_line(&mut self, asserted: bool) {
        self.interrupt = asserted;
    }

    fn set_proceed_line(&mut self, asserted: bool) {
        self.proceed = asserted;
    }

    fn set_external_clock(&mut self, time_base: Ticks, period: u32) {
        self.external_clock = if period == 0 { None } else { Some((time_base, period)) };
    }
}

/// Host input state driven by custom devices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct HostInputs {
    pub console: ConsoleButtons,
    /// Scan codes of the keys held down, in the order pressed.
    pub keys_down: Vec<u8>,
    pub breaks: u32,
    pub paddles: [[i32; 2]; 4],
    pub triggers: [bool; 4],
    /// Joystick directions per port, active high: up, down, left, right.
    pub dirs: [u8; 4],
    pub sounds_playing: Vec<u32>,
    pub commands: Vec<String>,
    pub log: Vec<String>,
}

enum Attached {
    Custom {
        device: SharedCustomDevice,
        sio: Option<(SioInterfaceId, RawDeviceId)>,
    },
    BlackBox(SharedBlackBox),
    Multiplexer(SharedMultiplexer),
}

impl Attached {
    fn owns_event(&self, owner: OwnerId, id: u32) -> bool {
        match self {
            Attached::Custom { device, .. } => device.borrow().owns_event(owner, id),
            Attached::BlackBox(device) => device.borrow().owns_event(owner, id),
            Attached::Multiplexer(device) => device.borrow().owns_event(owner, id),
        }
    }

    fn on_host_event(&self, host: &mut Scheduler, id: u32) {
        match self {
            Attached::Custom { device, .. } => device.borrow_mut().on_host_event(host, id),
            Attached::BlackBox(device) => device.borrow_mut().on_host_event(host, id),
            Attached::Multiplexer(device) => device.borrow_mut().on_host_event(host, id),
        }
    }

    fn service(&self, host: &mut Scheduler) {
        match self {
            Attached::Custom { device, .. } => device.borrow_mut().service(host),
            Attached::BlackBox(device) => device.borrow_mut().service(host),
            Attached::Multiplexer(device) => device.borrow_mut().service(host),
        }
    }

    fn cold_reset(&self, host: &mut Scheduler) {
        match self {
            Attached::Custom { device, .. } => device.borrow_mut().cold_reset(host),
            Attached::BlackBox(device) => device.borrow_mut().cold_reset(host.now()),
            Attached::Multiplexer(device) => device.borrow_mut().cold_reset(),
        }
    }

    fn warm_reset(&self, host: &mut Scheduler) {
        match self {
            Attached::Custom { device, .. } => device.borrow_mut().warm_reset(host),
            Attached::BlackBox(device) => device.borrow_mut().warm_reset(),
            Attached::Multiplexer(_) => {}
        }
    }

    fn custom(&self) -> Option<&SharedCustomDevice> {
        match self {
            Attached::Custom { device, .. } => Some(device),
            _ => None
        }
    }
}

/// The machine: the scheduler, the address space, the SIO bus and the attached devices.
pub struct Machine {
    pub scheduler: Scheduler,
    pub memory: MemoryManager,
    pub sio: SioManager,
    pub irq: IrqController,
    pub serial: SerialPort,
    pub inputs: HostInputs,
    /// The base RAM and its layer.
    pub ram: SharedMemory,
    pub ram_layer: LayerId,
    host_hz: f64,
    pbi_select: u8,
    next_owner: u32,
    devices: Vec<Attached>,
}

impl Machine {
    /// Creates a machine with 64K of RAM running at `host_hz`.
    pub fn new(host_hz: f64) -> Result<Self, MachineError> {
        let scheduler = Scheduler::new();
        let serial = SerialPort::new(scheduler.clock());
        let mut memory = MemoryManager::new();
        let ram = SharedMemory::new(0x10000, 0);
        let layer = memory.create_memory_layer(PRI_BASE_MEMORY, ram.clone(), 0, 0x00, 0x100, false)?;
        memory.set_layer_name(layer, "Base RAM")?;
        memory.enable_layer(layer, AccessMode::ARW, true)?;
        Ok(Machine {
            scheduler,
            memory,
            sio: SioManager::new(SIO_OWNER),
            irq: IrqController::new(),
            serial,
            inputs: HostInputs::default(),
            ram,
            ram_layer: layer,
            host_hz,
            pbi_select: 0,
            next_owner: FIRST_DEVICE_OWNER,
            devices: Vec::new(),
        })
    }

    #[inline]
    pub fn now(&self) -> Ticks {
        self.scheduler.now()
    }

    pub fn host_hz(&self) -> f64 {
        self.host_hz
    }
    /// Returns `true` while any device holds the shared interrupt line.
    pub fn is_irq_asserted(&self) -> bool {
        self.irq.is_irq_asserted()
    }

    fn allocate_owner(&mut self) -> OwnerId {
        let owner = OwnerId(self.next_owner);
        self.next_owner += 1;
        owner
    }
    /// Attaches a plain SIO device.
    pub fn add_sio_device(&mut self, device: SharedSioDevice) -> SioInterfaceId {
        self.sio.add_device(device)
    }
    /// Attaches a custom device loading its configuration from `settings`.
    pub fn add_custom_device(&mut self, settings: CustomDeviceSettings) -> SharedCustomDevice {
        let owner = self.allocate_owner();
        self.attach_custom(CustomDevice::with_settings(owner, settings), None)
    }
    /// Attaches a custom device running an already compiled configuration.
    pub fn add_custom_config(&mut self, config: DeviceConfig) -> SharedCustomDevice {
        let owner = self.allocate_owner();
        self.attach_custom(CustomDevice::new(owner), Some(config))
    }

    fn attach_custom(&mut self, mut device: CustomDevice, config: Option<DeviceConfig>) -> SharedCustomDevice {
        device.init(&mut self.scheduler, &self.irq);
        if let Some(config) = config {
            device.load_config(config);
            device.service(&mut self.scheduler);
        }
        let device = Rc::new(RefCell::new(device));
        self.devices.push(Attached::Custom { device: Rc::clone(&device), sio: None });
        self.process_requests();
        device
    }
    /// Creates a BlackBox board running `firmware`, mapping its VIA into the cartridge control area.
    pub fn add_blackbox(&mut self, firmware: &[u8]) -> Result<SharedBlackBox, MachineError> {
        let mut board = BlackBoxFloppy::new(self.allocate_owner(), self.host_hz);
        board.load_firmware(firmware)?;
        board.init(&mut self.scheduler, &self.irq);
        let device = Rc::new(RefCell::new(board));
        BlackBoxCctl::new(Rc::clone(&device), self.scheduler.clock()).install(&mut self.memory)?;
        self.devices.push(Attached::BlackBox(Rc::clone(&device)));
        Ok(device)
    }
    /// Creates a multiplexer, mapping its VIA into the cartridge control area.
    ///
    /// Without a `transport` the multiplexer opens its own TCP sockets.
    pub fn add_multiplexer(&mut self, settings: &PropertySet, transport: Option<Box<dyn MuxTransport>>)
        -> Result<SharedMultiplexer, MachineError>
    {
        let mut mux = Multiplexer::new(self.allocate_owner());
        mux.apply_settings(settings);
        if let Some(transport) = transport {
            mux.attach_transport(transport);
        }
        mux.init(&mut self.scheduler);
        let device = Rc::new(RefCell::new(mux));
        MultiplexerCctl::new(Rc::clone(&device), self.scheduler.clock()).install(&mut self.memory)?;
        self.devices.push(Attached::Multiplexer(Rc::clone(&device)));
        Ok(device)
    }
    /// Detaches a custom device, removing its layers and SIO registrations.
    pub fn remove_custom_device(&mut self, device: &SharedCustomDevice) {
        let index = match self.devices.iter().position(|a| a.custom().map_or(false, |d| Rc::ptr_eq(d, device))) {
            Some(index) => index,
            None => return
        };
        device.borrow_mut().shutdown(&mut self.scheduler);
        self.process_requests();
        if let Attached::Custom { sio: Some((iface, raw)), .. } = self.devices.remove(index) {
            self.sio.remove_device(&mut self.scheduler, iface);
            self.sio.remove_raw_device(&mut self.serial, raw);
        }
    }
    /// Resets the SIO bus and cold resets all devices.
    pub fn cold_reset(&mut self) {
        debug!("machine: cold reset at {}", self.now());
        self.sio.reset(&mut self.scheduler);
        self.pbi_select = 0;
        for device in self.devices.iter() {
            device.cold_reset(&mut self.scheduler);
        }
        self.process_requests();
    }

    pub fn warm_reset(&mut self) {
        debug!("machine: warm reset at {}", self.now());
        self.select_pbi(0);
        for device in self.devices.iter() {
            device.warm_reset(&mut self.scheduler);
        }
        self.process_requests();
    }
    /// Signals the start of the vertical blank to custom devices and polls their network links.
    pub fn vblank(&mut self) {
        for device in self.devices.iter().filter_map(Attached::custom) {
            let mut device = device.borrow_mut();
            device.vblank(&mut self.scheduler);
            device.poll_network(&mut self.scheduler);
        }
        self.process_requests();
    }
    /// Runs all events due no later than `limit`, then advances the clock to `limit`.
    pub fn run_until(&mut self, limit: Ticks) {
        while let Some(ev) = self.scheduler.run_next(limit) {
            self.dispatch(ev);
        }
    }
    /// Runs the machine for `delta` cycles.
    pub fn run_for(&mut self, delta: Ticks) {
        let limit = self.now() + delta;
        self.run_until(limit)
    }

    fn dispatch(&mut self, ev: ScheduledEvent) {
        if self.sio.owns_event(&ev) {
            self.sio.on_scheduled_event(&mut self.scheduler, &mut self.serial, ev);
        }
        else if let Some(device) = self.devices.iter().find(|d| d.owns_event(ev.owner, ev.id)) {
            device.on_host_event(&mut self.scheduler, ev.id);
        }
        else {
            warn!("machine: no owner for event {:?}", ev);
        }
        self.process_requests();
    }
    /// Reads from the CPU address space.
    pub fn read_byte(&mut self, addr: u16) -> u8 {
        let value = if addr == PBI_SELECT {
            self.read_pbi_status()
        }
        else {
            self.memory.read_byte(addr)
        };
        self.service_devices();
        value
    }
    /// Writes to the CPU address space.
    pub fn write_byte(&mut self, addr: u16, value: u8) {
        if addr == PBI_SELECT {
            self.select_pbi(value);
        }
        else {
            self.memory.write_byte(addr, value);
        }
        self.service_devices();
    }
    /// Reads without side effects.
    pub fn debug_read_byte(&mut self, addr: u16) -> u8 {
        self.memory.debug_read_byte(addr)
    }
    /// Selects PBI devices whose id bit is set in `value`.
    pub fn select_pbi(&mut self, value: u8) {
        self.pbi_select = value;
        for device in self.devices.iter().filter_map(Attached::custom) {
            let pbi = device.borrow().config().pbi;
            if let Some(pbi) = pbi {
                device.borrow_mut().select_pbi(&mut self.scheduler, value & pbi.device_id != 0);
            }
        }
        self.process_requests();
    }
    /// Returns the PBI interrupt status bits.
    pub fn read_pbi_status(&self) -> u8 {
        self.devices.iter().filter_map(Attached::custom)
                    .fold(0, |status, device| device.borrow().read_pbi_status(status))
    }
    /// Runs the OS serial I/O vector through the SIO acceleration.
    ///
    /// Returns `None` if the request must be carried out by the OS.
    pub fn hook_siov(&mut self, cpu_flags: u8) -> Option<AccelReturn> {
        let ret = self.sio.on_hook_siov(&mut self.scheduler, &mut self.serial, &mut self.memory, cpu_flags);
        self.process_requests();
        ret
    }
    /// Drives the command line: asserted while `asserted` is `true`.
    pub fn set_command_line(&mut self, asserted: bool) {
        if asserted {
            self.sio.pokey_begin_command(&mut self.scheduler, &mut self.serial);
        }
        else {
            self.sio.pokey_end_command(&mut self.scheduler, &mut self.serial);
        }
        self.process_requests();
    }
    /// Drives the cassette motor line.
    pub fn set_motor(&mut self, on: bool) {
        self.sio.set_motor_line(&mut self.scheduler, &mut self.serial, !on);
        self.process_requests();
    }
    /// Sends a byte out of POKEY's serial port. Returns `true` if a device accepted it.
    pub fn pokey_write(&mut self, byte: u8, cycles_per_bit: u32) -> bool {
        let accepted = self.sio.pokey_write_sio(&mut self.scheduler, &mut self.serial, byte, cycles_per_bit, false, false);
        self.process_requests();
        accepted
    }

    pub fn pokey_ser_in_ready(&mut self) {
        self.sio.pokey_ser_in_ready(&mut self.scheduler, &mut self.serial);
        self.process_requests();
    }

    pub fn pokey_set_break(&mut self, brk: bool) {
        self.sio.pokey_set_break(&mut self.scheduler, &mut self.serial, brk);
        self.process_requests();
    }
    /// Sends a command frame the way the OS does, running the machine in between bytes.
    pub fn send_command_frame(&mut self, frame: &[u8]) {
        self.set_command_line(true);
        for &byte in frame {
            self.run_for(COMMAND_BYTE_CYCLES);
            self.pokey_write(byte, POKEY_CYCLES_PER_BIT);
        }
        self.run_for(COMMAND_END_CYCLES);
        self.set_command_line(false);
    }
    /// Sends a data frame at the standard rate, appending its checksum.
    pub fn send_data_frame(&mut self, data: &[u8]) {
        let checksum = sio_checksum(data);
        for &byte in data.iter().chain(Some(&checksum)) {
            self.run_for(POKEY_CYCLES_PER_BIT as Ticks * 10);
            self.pokey_write(byte, POKEY_CYCLES_PER_BIT);
        }
    }

    fn service_devices(&mut self) {
        for device in self.devices.iter() {
            device.service(&mut self.scheduler);
        }
        self.process_requests();
    }
    /// Carries out the requests custom devices queued, until none is left.
    pub fn process_requests(&mut self) {
        for index in 0..self.devices.len() {
            let device = match self.devices[index].custom() {
                Some(device) => Rc::clone(device),
                None => continue
            };
            loop {
                let requests = device.borrow_mut().take_requests();
                if requests.is_empty() {
                    break
                }
                for req in requests {
                    if let Err(err) = self.apply_request(index, &device, req) {
                        error!("machine: custom device request failed: {}", err);
                    }
                }
                device.borrow_mut().service(&mut self.scheduler);
            }
        }
    }

    fn apply_request(&mut self, index: usize, device: &SharedCustomDevice, req: HostRequest) -> Result<(), MemoryError> {
        trace!("machine: {:?}", req);
        match req {
            HostRequest::InstallLayers => CustomDevice::install(device, &mut self.memory)?,
            HostRequest::AttachSio(attach) => self.attach_custom_sio(index, attach),
            HostRequest::SendRawByte { byte, cycles_per_bit } => {
                self.sio.send_raw_byte(&mut self.scheduler, &mut self.serial, byte, cycles_per_bit, false, false);
            }
            HostRequest::SetSioInterrupt(asserted) => {
                if let Some((_, raw)) = self.custom_sio(index) {
                    self.sio.set_sio_interrupt(&mut self.serial, raw, asserted);
                }
            }
            HostRequest::SetSioProceed(asserted) => {
                if let Some((_, raw)) = self.custom_sio(index) {
                    self.sio.set_sio_proceed(&mut self.serial, raw, asserted);
                }
            }
            HostRequest::ConsoleButton { button, pressed } => {
                self.inputs.console.set(ConsoleButtons::from_bits_truncate(button), pressed);
            }
            HostRequest::KeyState { key, pressed } => {
                let keys = &mut self.inputs.keys_down;
                keys.retain(|&k| k != key);
                if pressed {
                    keys.push(key);
                }
            }
            HostRequest::PushBreak => self.inputs.breaks += 1,
            HostRequest::Paddle { port, second, position } => {
                if let Some(paddles) = self.inputs.paddles.get_mut(port as usize) {
                    paddles[second as usize] = position;
                }
            }
            HostRequest::Trigger { port, pressed } => {
                if let Some(trigger) = self.inputs.triggers.get_mut(port as usize) {
                    *trigger = pressed;
                }
            }
            HostRequest::Dirs { port, dirs } => {
                if let Some(d) = self.inputs.dirs.get_mut(port as usize) {
                    *d = dirs;
                }
            }
            HostRequest::PlaySound { sound, .. } => {
                if !self.inputs.sounds_playing.contains(&sound) {
                    self.inputs.sounds_playing.push(sound);
                }
            }
            HostRequest::StopSounds { sound } => self.inputs.sounds_playing.retain(|&s| s != sound),
            HostRequest::RunCommand(command) => {
                info!("machine: command request: {}", command);
                self.inputs.commands.push(command);
            }
            HostRequest::Log(line) => {
                info!("custom device: {}", line);
                self.inputs.log.push(line);
            }
            req => {
                req.apply_to_memory(&mut self.memory)?;
            }
        }
        Ok(())
    }

    fn custom_sio(&self, index: usize) -> Option<(SioInterfaceId, RawDeviceId)> {
        match self.devices.get(index) {
            Some(Attached::Custom { sio, .. }) => *sio,
            _ => None
        }
    }

    fn attach_custom_sio(&mut self, index: usize, attach: bool) {
        let Machine { devices, sio, scheduler, serial, .. } = self;
        let (device, slot) = match devices.get_mut(index) {
            Some(Attached::Custom { device, sio: slot }) => (device, slot),
            _ => return
        };
        match (attach, slot.take()) {
            (true, None) => {
                let iface = sio.add_device(Rc::clone(device) as SharedSioDevice);
                let raw = sio.add_raw_device(Rc::clone(device) as SharedRawSioDevice);
                *slot = Some((iface, raw));
            }
            (true, ids) => *slot = ids,
            (false, Some((iface, raw))) => {
                sio.remove_device(scheduler, iface);
                sio.remove_raw_device(serial, raw);
            }
            (false, None) => {}
        }
    }
}

/// Builds a command frame with its checksum.
pub fn command_frame(device: u8, command: u8, aux1: u8, aux2: u8) -> [u8; 5] {
    let mut frame = [device, command, aux1, aux2, 0];
    frame[4] = sio_checksum(&frame[..4]);
    frame
}
