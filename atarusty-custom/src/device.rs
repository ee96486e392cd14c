/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The custom device: binds a compiled configuration to the machine.
//!
//! The device owns the script [Vm] and every runtime object the configuration declares. It
//! takes part in the machine through:
//!
//! * memory layers installed with [CustomDevice::install], dispatching control accesses to
//!   bindings,
//! * the SIO bus, as a [SioDevice] for command frames and as a [RawSioDevice] for the raw
//!   line level protocol,
//! * scheduler events for sleeping threads, queued threads and raw bytes on the wire,
//! * [HostRequest]s the device can't carry out itself, drained with [CustomDevice::take_requests].
//!
//! Scripts run synchronously inside the machine callbacks that trigger them.
use core::cell::RefCell;
use core::mem;
use std::path::Path;
use std::rc::Rc;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::{ClockHandle, EventHandle, OwnerId, Scheduler, Ticks};
use atarusty_core::irq::{IrqController, IrqHandle};
use atarusty_core::memory::{AccessMode, LayerId, MemoryError, MemoryHandler, MemoryManager, SharedMemory};
use atarusty_core::props::PropertySet;
use atarusty_peripherals::sio::{
    CmdResponse, RawSioDevice, SioBus, SioCommand, SioDevice, SioInterface, SioRequest,
    DEFAULT_CYCLES_PER_BIT
};

use crate::config::{self, AutoTransfer, DeviceConfig, DeviceEvent, SioCommandDef, TransferSource};
use crate::network::{encode_names, NetClient, NetCommand, NetError, NetFrame, NetReply, RECONNECT_RESET};
use crate::objects::{
    AddressBinding, AutoEnable, AutoConditions, CartWindow, Image, LocalClock, Segment,
    SioChecksums, SoundParams, VideoInfo, MAX_FRAME_LENGTH
};
use crate::vm::{
    ClassId, Environment, ObjectRef, Outcome, QueueId, RawSend, SpecialVar, ThreadId, ThreadVar,
    Value, Vm, VmError, Wait, INTERRUPT_THREAD, MAIN_THREAD, SIO_FRAME, SIO_THREAD
};

/// Wakes sleeping threads.
pub const EV_SLEEP: u32 = 0;
/// The raw byte in flight left the wire.
pub const EV_RAW_SEND: u32 = 1;
/// Runs threads made ready outside of a script run.
pub const EV_RUN: u32 = 2;

/// The longest a sleep event is scheduled ahead, longer sleeps are re-armed.
pub const MAX_SLEEP_DELAY: Ticks = 1_000_000;

pub const NO_CONNECTION_MESSAGE: &str =
    "No connection to device server. Custom device may not function properly.";

const FENCE_AUTO_RECEIVE: u32 = 0;
const FENCE_SCRIPT_RECEIVE: u32 = 1;
const FENCE_SCRIPT_DELAY: u32 = 2;

/// The minimum delay between a received data frame and its acknowledgement.
const DATA_FRAME_ACK_DELAY: u32 = 1530;
const MAX_SCRIPT_DELAY: i32 = 64 << 20;
const MIN_RAW_CYCLES_PER_BIT: i32 = 4;
const MAX_RAW_CYCLES_PER_BIT: i32 = 100_000;
const NET_RETRIES: u32 = 3;

/// User settings of a custom device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct CustomDeviceSettings {
    /// The path of the configuration file.
    pub path: String,
    /// Reload the configuration on cold reset when any of its files changed.
    pub hot_reload: bool,
    /// Allow scripts to call unsafe methods, e.g. `emu.run_command`.
    pub allow_unsafe: bool,
}

impl CustomDeviceSettings {
    pub fn from_props(props: &PropertySet) -> Self {
        CustomDeviceSettings {
            path: props.get_string("path", "").to_string(),
            hot_reload: props.get_bool("hotreload", false),
            allow_unsafe: props.get_bool("allowunsafe", false),
        }
    }

    pub fn to_props(&self) -> PropertySet {
        let mut props = PropertySet::new();
        props.set_string("path", self.path.as_str());
        if self.hot_reload {
            props.set_bool("hotreload", true);
        }
        if self.allow_unsafe {
            props.set_bool("allowunsafe", true);
        }
        props
    }
}

/// Something the device needs the machine to do.
///
/// Requests are queued while scripts run, which may happen inside a memory access or an SIO
/// callback, so the machine applies them once it is free to.
#[derive(Clone, Debug)]
pub enum HostRequest {
    /// (Re)create the device's memory layers with [CustomDevice::install].
    InstallLayers,
    SetLayerModes { layer: LayerId, modes: AccessMode },
    SetLayerMemory { layer: LayerId, memory: SharedMemory, offset: usize },
    SetLayerReadOnly { layer: LayerId, read_only: bool },
    SetLayerAddress { layer: LayerId, page_base: u8, page_count: u16 },
    /// Hides the layer while its cartridge window is disabled.
    SetLayerMasked { layer: LayerId, masked: bool },
    /// Attach the device to the SIO bus, or detach it.
    AttachSio(bool),
    SendRawByte { byte: u8, cycles_per_bit: u32 },
    SetSioInterrupt(bool),
    SetSioProceed(bool),
    /// `button` is a single bit: 1 START, 2 SELECT, 4 OPTION.
    ConsoleButton { button: u8, pressed: bool },
    KeyState { key: u8, pressed: bool },
    PushBreak,
    Paddle { port: u8, second: bool, position: i32 },
    Trigger { port: u8, pressed: bool },
    /// Joystick directions, active high: up, down, left, right.
    Dirs { port: u8, dirs: u8 },
    PlaySound { sound: u32, params: SoundParams },
    StopSounds { sound: u32 },
    RunCommand(String),
    Log(String),
}

impl HostRequest {
    /// Returns `true` if the request concerns the memory manager.
    pub fn is_memory_request(&self) -> bool {
        matches!(self,
            HostRequest::InstallLayers|
            HostRequest::SetLayerModes {..}|
            HostRequest::SetLayerMemory {..}|
            HostRequest::SetLayerReadOnly {..}|
            HostRequest::SetLayerAddress {..}|
            HostRequest::SetLayerMasked {..})
    }
    /// Applies a layer request. Returns `false` for requests of other kinds.
    ///
    /// [HostRequest::InstallLayers] needs the shared device and is not handled here.
    pub fn apply_to_memory(&self, mm: &mut MemoryManager) -> Result<bool, MemoryError> {
        match *self {
            HostRequest::SetLayerModes { layer, modes } => mm.set_layer_modes(layer, modes)?,
            HostRequest::SetLayerMemory { layer, ref memory, offset } => {
                mm.set_layer_memory(layer, memory.clone(), offset)?
            }
            HostRequest::SetLayerReadOnly { layer, read_only } => mm.set_layer_read_only(layer, read_only)?,
            HostRequest::SetLayerAddress { layer, page_base, page_count } => {
                mm.set_layer_address_range(layer, page_base, page_count)?
            }
            HostRequest::SetLayerMasked { layer, masked: true } => mm.set_layer_mask_range(layer, 0, 0)?,
            HostRequest::SetLayerMasked { layer, masked: false } => mm.clear_layer_mask_range(layer)?,
            _ => return Ok(false)
        }
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct WaitQueues {
    raw_recv: QueueId,
    command_assert: QueueId,
    command_off: QueueId,
    motor_changed: QueueId,
}

impl WaitQueues {
    fn new(vm: &mut Vm) -> Self {
        WaitQueues {
            raw_recv: vm.new_queue(),
            command_assert: vm.new_queue(),
            command_off: vm.new_queue(),
            motor_changed: vm.new_queue(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CartEnables {
    left: bool,
    right: bool,
    cctl: bool,
}

impl Default for CartEnables {
    fn default() -> Self {
        CartEnables { left: true, right: true, cctl: true }
    }
}

/// Everything scripts can reach, apart from the [Vm] itself.
#[derive(Debug, Default)]
struct DeviceState {
    clock: ClockHandle,
    config: DeviceConfig,
    sio_frame: Segment,
    local_clock: LocalClock,
    checksums: SioChecksums,
    net: Option<NetClient>,
    requests: Vec<HostRequest>,
    queues: WaitQueues,
    sio_attached: bool,
    raw_enabled: bool,
    command_asserted: bool,
    motor_asserted: bool,
    irq: Option<(IrqController, IrqHandle)>,
    irq_asserted: bool,
    conditions: AutoConditions,
    carts: CartEnables,
    data_frame_received: bool,
    last_error: Option<String>,
    last_connection_error: Option<Ticks>,
}

/// A device built from a configuration file.
#[derive(Debug)]
pub struct CustomDevice {
    owner: OwnerId,
    settings: CustomDeviceSettings,
    inited: bool,
    configured: bool,
    last_reload_tick: Option<Ticks>,
    irq_controller: Option<IrqController>,
    vm: Vm,
    state: DeviceState,
    sleep_event: Option<EventHandle>,
    raw_event: Option<EventHandle>,
    run_event: Option<EventHandle>,
    /// The auto-transfer of the SIO command receiving data.
    auto_receive: Option<AutoTransfer>,
    /// The init event waits until the layers are installed.
    init_pending: bool,
    installed: Vec<LayerId>,
}

/// A shared [CustomDevice].
pub type SharedCustomDevice = Rc<RefCell<CustomDevice>>;

impl CustomDevice {
    /// Creates an unconfigured device posting its scheduler events for `owner`.
    pub fn new(owner: OwnerId) -> Self {
        CustomDevice {
            owner,
            settings: CustomDeviceSettings::default(),
            inited: false,
            configured: false,
            last_reload_tick: None,
            irq_controller: None,
            vm: Vm::default(),
            state: DeviceState { sio_frame: Segment::sio_frame(), ..DeviceState::default() },
            sleep_event: None,
            raw_event: None,
            run_event: None,
            auto_receive: None,
            init_pending: false,
            installed: Vec::new(),
        }
    }

    pub fn with_settings(owner: OwnerId, settings: CustomDeviceSettings) -> Self {
        let mut device = CustomDevice::new(owner);
        device.settings = settings;
        device
    }

    pub fn settings(&self) -> PropertySet {
        self.settings.to_props()
    }
    /// Applies new settings, reloading the configuration of an initialized device.
    /// Returns `true` if the settings changed.
    pub fn apply_settings(&mut self, props: &PropertySet) -> bool {
        let settings = CustomDeviceSettings::from_props(props);
        if settings == self.settings {
            return false
        }
        self.settings = settings;
        if self.inited {
            self.reload();
        }
        true
    }
    /// Connects the device to the machine and loads the configuration from the settings.
    pub fn init(&mut self, host: &mut Scheduler, irq: &IrqController) {
        self.state.clock = host.clock();
        self.irq_controller = Some(irq.clone());
        self.inited = true;
        self.reload();
        if let Some(net) = self.state.net.as_ref() {
            if !net.is_connected() {
                self.state.try_restore_net(&mut self.vm);
            }
            self.state.execute_net_requests(&mut self.vm, false);
        }
        self.service(host);
    }
    /// Disconnects the device from the machine, queuing the removal of its layers.
    pub fn shutdown(&mut self, host: &mut Scheduler) {
        host.unset_event(&mut self.sleep_event);
        host.unset_event(&mut self.raw_event);
        host.unset_event(&mut self.run_event);
        self.unload();
        self.inited = false;
        self.irq_controller = None;
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }
    /// Replaces the configuration.
    pub fn load_config(&mut self, config: DeviceConfig) {
        self.unload();
        self.configure(config);
    }
    /// Reloads the configuration file named by the settings.
    pub fn reload(&mut self) {
        self.unload();
        if self.settings.path.is_empty() {
            return
        }
        let path = Path::new(&self.settings.path);
        match config::load_file(path, self.settings.allow_unsafe, self.settings.hot_reload) {
            Ok(config) => self.configure(config),
            Err(err) => {
                error!("custom device: {}", err);
                self.state.last_error = Some(err.to_string());
            }
        }
    }

    fn unload(&mut self) {
        self.vm = Vm::default();
        self.state.set_pbi_irq(false);
        if let Some((irq, handle)) = self.state.irq.take() {
            irq.free(handle);
        }
        if mem::replace(&mut self.state.sio_attached, false) {
            self.state.requests.push(HostRequest::AttachSio(false));
        }
        self.state.raw_enabled = false;
        if let Some(mut net) = self.state.net.take() {
            net.disconnect();
        }
        self.state.config = DeviceConfig::default();
        self.state.last_error = None;
        self.state.data_frame_received = false;
        self.auto_receive = None;
        self.init_pending = false;
        if !self.installed.is_empty() {
            self.state.request_install();
        }
        self.configured = false;
    }

    fn configure(&mut self, mut config: DeviceConfig) {
        self.vm = Vm::new(mem::take(&mut config.program));
        self.state.queues = WaitQueues::new(&mut self.vm);
        if config.sio.is_some() {
            self.state.sio_attached = true;
            self.state.requests.push(HostRequest::AttachSio(true));
        }
        if let Some(pbi) = config.pbi {
            if pbi.has_irq {
                match self.irq_controller.as_ref() {
                    Some(irq) => match irq.allocate() {
                        Some(handle) => self.state.irq = Some((irq.clone(), handle)),
                        None => warn!("custom device: no interrupt line available")
                    }
                    None => warn!("custom device: PBI interrupt requested before init")
                }
            }
        }
        if let Some(port) = config.network_port {
            self.state.net = Some(NetClient::new(port));
        }
        info!("custom device: configured {}", config.name.as_deref().unwrap_or("<unnamed>"));
        self.state.config = config;
        self.configured = true;
        self.reset_device();
        if self.state.config.layers.is_empty() {
            self.run_init();
        }
        else {
            self.state.request_install();
            self.init_pending = true;
        }
    }

    fn run_init(&mut self) {
        self.init_pending = false;
        self.run_event(DeviceEvent::Init);
        if self.state.net.is_some() {
            self.state.execute_net_requests(&mut self.vm, false);
        }
    }

    fn reset_device(&mut self) {
        self.vm.reset();
        self.state.local_clock.reset();
        self.state.checksums.reset();
        self.state.set_pbi_irq(false);
        self.state.data_frame_received = false;
        self.auto_receive = None;
    }
    /// Restores volatile segments, aborts all threads and runs the `cold_reset` event.
    ///
    /// An unconfigured device, or one with changed files when hot reloading, reloads first.
    pub fn cold_reset(&mut self, host: &mut Scheduler) {
        let now = host.now();
        let stale = self.configured && self.settings.hot_reload && self.state.config.is_stale();
        if (!self.configured || stale) && self.last_reload_tick != Some(now) {
            self.last_reload_tick = Some(now);
            if stale {
                info!("custom device: configuration changed, reloading");
            }
            self.reload();
        }
        for segment in self.state.config.segments.iter().filter(|s| !s.nonvolatile) {
            segment.reinit();
        }
        self.reset_device();
        host.unset_event(&mut self.sleep_event);
        host.unset_event(&mut self.raw_event);
        host.unset_event(&mut self.run_event);
        self.run_event(DeviceEvent::ColdReset);
        let connected = self.state.net.as_ref().map(NetClient::is_connected);
        match connected {
            Some(true) => {
                self.state.send_net_command(&mut self.vm, 0, 0, NetCommand::ColdReset);
            }
            Some(false) if self.state.last_connection_error != Some(now) => {
                self.state.last_connection_error = Some(now);
                warn!("custom device: {}", NO_CONNECTION_MESSAGE);
            }
            _ => {}
        }
        self.service(host);
    }

    pub fn warm_reset(&mut self, host: &mut Scheduler) {
        self.run_event(DeviceEvent::WarmReset);
        self.state.send_net_command(&mut self.vm, 0, 0, NetCommand::WarmReset);
        self.service(host);
    }
    /// Called at the start of each vertical blank.
    pub fn vblank(&mut self, host: &mut Scheduler) {
        self.run_event(DeviceEvent::VBlank);
        self.service(host);
    }
    /// Handles requests the server sent on its own.
    pub fn poll_network(&mut self, host: &mut Scheduler) {
        if self.state.net.is_some() {
            self.state.execute_net_requests(&mut self.vm, false);
            self.service(host);
        }
    }
    /// The current error, if any, for the host to show.
    pub fn error_status(&self) -> Option<String> {
        if let Some(err) = self.state.last_error.as_ref() {
            return Some(err.clone())
        }
        match self.state.net.as_ref() {
            Some(net) if !net.is_connected() => Some(NO_CONNECTION_MESSAGE.to_string()),
            _ => None
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.state.config
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn take_requests(&mut self) -> Vec<HostRequest> {
        mem::take(&mut self.state.requests)
    }

    fn set_timestamp(&mut self, tid: ThreadId) {
        let now = self.state.clock.now();
        self.vm.set_thread_var(tid, ThreadVar::Timestamp, now as i32);
    }

    fn run_event(&mut self, event: DeviceEvent) {
        if let Some(function) = self.state.config.event(event) {
            self.set_timestamp(MAIN_THREAD);
            let mut env = Env::new(&mut self.state);
            let _ = self.vm.run_void(MAIN_THREAD, function, &mut env);
        }
    }

    fn run_ready(&mut self) {
        let mut env = Env::new(&mut self.state);
        let _ = self.vm.run_ready(&mut env);
    }
    /// Arms the scheduler events the script threads need and starts the next raw byte.
    ///
    /// Call after anything that may have run scripts outside of [CustomDevice::on_host_event].
    pub fn service(&mut self, host: &mut Scheduler) {
        match self.vm.sleepers.next_wake() {
            Some(wake) => {
                let armed = self.sleep_event.and_then(|handle| host.event_tick(handle));
                if armed.map_or(true, |tick| tick > wake) {
                    let delta = wake.saturating_sub(host.now()).min(MAX_SLEEP_DELAY);
                    host.set_event(delta, self.owner, EV_SLEEP, &mut self.sleep_event);
                }
            }
            None => host.unset_event(&mut self.sleep_event)
        }
        if self.vm.has_runnable() && self.run_event.map_or(true, |handle| !host.is_pending(handle)) {
            host.set_event(1, self.owner, EV_RUN, &mut self.run_event);
        }
        if !self.vm.raw_send.is_in_flight() {
            match self.vm.raw_send.begin() {
                Some(send) => {
                    self.state.checksums.add_sent(send.byte);
                    self.state.requests.push(HostRequest::SendRawByte {
                        byte: send.byte,
                        cycles_per_bit: send.cycles_per_bit
                    });
                    host.set_event(send.duration(), self.owner, EV_RAW_SEND, &mut self.raw_event);
                }
                None => host.unset_event(&mut self.raw_event)
            }
        }
    }
    /// Returns `true` if the host event belongs to the device.
    pub fn owns_event(&self, owner: OwnerId, id: u32) -> bool {
        owner == self.owner && id <= EV_RUN
    }

    pub fn on_host_event(&mut self, host: &mut Scheduler, id: u32) {
        match id {
            EV_SLEEP => {
                self.sleep_event = None;
                self.vm.wake_sleepers(host.now());
                self.run_ready();
            }
            EV_RUN => {
                self.run_event = None;
                self.run_ready();
            }
            EV_RAW_SEND => {
                self.raw_event = None;
                if let Some(tid) = self.vm.raw_send.complete() {
                    let mut env = Env::new(&mut self.state);
                    let _ = self.vm.resume(tid, &mut env);
                }
                self.run_ready();
            }
            _ => {}
        }
        self.service(host);
    }
    /// Follows the PBI device selection in `$D1FF`.
    pub fn select_pbi(&mut self, host: &mut Scheduler, selected: bool) {
        if self.state.conditions.pbi_selected == selected {
            return
        }
        self.state.conditions.pbi_selected = selected;
        self.state.update_auto_layers(|auto| auto == AutoEnable::Pbi);
        self.run_event(if selected { DeviceEvent::PbiSelect } else { DeviceEvent::PbiDeselect });
        self.service(host);
    }
    /// Merges the device's interrupt bit into the PBI interrupt status read at `$D1FF`.
    pub fn read_pbi_status(&self, status: u8) -> u8 {
        match self.state.config.pbi {
            Some(pbi) if pbi.has_irq => {
                if self.state.irq_asserted { status | pbi.device_id } else { status & !pbi.device_id }
            }
            _ => status
        }
    }

    pub fn is_pbi_irq_asserted(&self) -> bool {
        self.state.irq_asserted
    }
    /// Follows the ROM banking that auto-enabled layers depend on.
    pub fn set_rom_conditions(&mut self, kernel_rom: bool, basic_rom: bool, self_test_rom: bool) {
        let conditions = &mut self.state.conditions;
        conditions.kernel_rom = kernel_rom;
        conditions.basic_rom = basic_rom;
        conditions.self_test_rom = self_test_rom;
        self.state.update_auto_layers(|auto| {
            matches!(auto, AutoEnable::OsRom|AutoEnable::BasicRom|AutoEnable::SelfTestRom)
        });
    }
    /// Follows the cartridge control lines of the cartridge window layers.
    pub fn set_cart_enables(&mut self, left: bool, right: bool, cctl: bool) {
        let carts = CartEnables { left, right, cctl };
        if self.state.carts != carts {
            self.state.carts = carts;
            self.state.apply_cart_enables();
        }
    }
    /// Returns `true` if a left cartridge window layer drives RD5.
    pub fn is_left_cart_active(&self) -> bool {
        self.state.config.layers.iter().any(|ml| ml.rd5_active)
    }
    /// Runs the output's `composite` script and returns its state.
    pub fn compose_video(&mut self, index: usize) -> Option<VideoInfo> {
        let composite = self.state.config.video_outputs.get(index)?.composite;
        if let Some(function) = composite {
            let mut env = Env::new(&mut self.state);
            let _ = self.vm.run_void(MAIN_THREAD, function, &mut env);
        }
        let config = &mut self.state.config;
        let images = &mut config.images;
        let output = config.video_outputs.get_mut(index)?;
        let image = output.image.and_then(|i| images.get_mut(i as usize));
        Some(output.video_info(image))
    }
    /// The image a video output shows.
    pub fn video_frame(&self, index: usize) -> Option<&Image> {
        let config = &self.state.config;
        config.video_outputs.get(index)?.image.and_then(|i| config.images.get(i as usize))
    }
    /// Runs the output's `pre_copy` script and copies text from row `y` at column `x`.
    pub fn copy_video_text(&mut self, index: usize, dst: &mut [u8], x: i32, y: i32) -> usize {
        let pre_copy = match self.state.config.video_outputs.get(index) {
            Some(output) => output.pre_copy,
            None => return 0
        };
        if let Some(function) = pre_copy {
            let mut env = Env::new(&mut self.state);
            let _ = self.vm.run_void(MAIN_THREAD, function, &mut env);
        }
        let config = &self.state.config;
        let output = match config.video_outputs.get(index) {
            Some(output) => output,
            None => return 0
        };
        match output.text_source.and_then(|ts| config.segments.get(ts.segment as usize)) {
            Some(segment) => output.copy_text(segment, dst, x, y),
            None => 0
        }
    }
    /// Creates the memory layers of the configuration, replacing previously installed ones.
    ///
    /// Runs the deferred `init` event once the layers are in place.
    pub fn install(device: &SharedCustomDevice, mm: &mut MemoryManager) -> Result<(), MemoryError> {
        let mut dev = device.borrow_mut();
        for id in mem::take(&mut dev.installed) {
            mm.delete_layer(id);
        }
        dev.state.requests.retain(|req| !req.is_memory_request());
        for index in 0..dev.state.config.layers.len() {
            let id = {
                let config = &dev.state.config;
                let ml = &config.layers[index];
                let (page_base, page_count) = (ml.page_base(), ml.page_count());
                let id = if ml.is_control() || ml.write_through {
                    let handler = LayerHandler { device: Rc::clone(device), index };
                    mm.create_handler_layer(ml.priority, Rc::new(RefCell::new(handler)), page_base, page_count)?
                }
                else {
                    let segment = match ml.segment.and_then(|s| config.segments.get(s as usize)) {
                        Some(segment) => segment,
                        None => {
                            warn!("custom device: layer {} has nothing to map", ml.name);
                            continue
                        }
                    };
                    mm.create_memory_layer(ml.priority, segment.memory().clone(), ml.segment_offset as usize,
                                           page_base, page_count, ml.read_only)?
                };
                mm.set_layer_name(id, ml.layer_name.as_str())?;
                id
            };
            dev.installed.push(id);
            dev.state.config.layers[index].layer = Some(id);
        }
        for index in 0..dev.state.config.layers.len() {
            dev.state.update_layer_modes(index);
        }
        dev.state.apply_cart_enables();
        for req in mem::take(&mut dev.state.requests) {
            if !req.apply_to_memory(mm)? {
                dev.state.requests.push(req);
            }
        }
        debug!("custom device: installed {} layers", dev.installed.len());
        if dev.init_pending {
            dev.run_init();
        }
        Ok(())
    }

    fn read_layer(&mut self, index: usize, addr: u16, debug: bool) -> Option<u8> {
        let ml = self.state.config.layers.get(index)?;
        if !ml.is_control() {
            let segment = self.state.config.segments.get(ml.segment? as usize)?;
            let value = segment.memory().borrow().get(ml.segment_index(addr)).copied();
            return value
        }
        match ml.read_binding(addr) {
            AddressBinding::None|AddressBinding::Block => None,
            AddressBinding::Const(value) => Some(value),
            AddressBinding::Network => {
                let command = if debug { NetCommand::DebugReadByte } else { NetCommand::ReadByte };
                Some(self.state.send_net_command(&mut self.vm, addr as u32, 0, command) as u8)
            }
            AddressBinding::Variable(var) => self.vm.globals.get(var as usize).map(|&v| v as u8),
            AddressBinding::Script { script, debug_script } => {
                let slot = if debug { debug_script } else { script };
                let function = *self.state.config.binding_scripts.get(slot as usize)?;
                self.vm.specials[SpecialVar::Address as usize] = addr as i32;
                self.set_timestamp(MAIN_THREAD);
                let mut env = Env::new(&mut self.state);
                Some(self.vm.run_int(MAIN_THREAD, function, &mut env).unwrap_or(0) as u8)
            }
        }
    }

    fn write_layer(&mut self, index: usize, addr: u16, value: u8) -> bool {
        let ml = match self.state.config.layers.get(index) {
            Some(ml) => ml,
            None => return false
        };
        if !ml.is_control() {
            if !ml.read_only {
                if let Some(segment) = ml.segment.and_then(|s| self.state.config.segments.get(s as usize)) {
                    segment.write_slice(ml.segment_index(addr) as u32, &[value]);
                }
            }
            return false
        }
        match ml.write_binding(addr) {
            AddressBinding::None|AddressBinding::Const(..) => false,
            AddressBinding::Block => true,
            AddressBinding::Network => {
                self.state.send_net_command(&mut self.vm, addr as u32, value as i32, NetCommand::WriteByte);
                true
            }
            AddressBinding::Variable(var) => {
                if let Some(v) = self.vm.globals.get_mut(var as usize) {
                    *v = value as i32;
                }
                true
            }
            AddressBinding::Script { script, .. } => {
                if let Some(&function) = self.state.config.binding_scripts.get(script as usize) {
                    self.vm.specials[SpecialVar::Address as usize] = addr as i32;
                    self.vm.specials[SpecialVar::Value as usize] = value as i32;
                    self.set_timestamp(MAIN_THREAD);
                    let mut env = Env::new(&mut self.state);
                    let _ = self.vm.run_void(MAIN_THREAD, function, &mut env);
                }
                true
            }
        }
    }

    fn begin_sio_command(&mut self, cmd: &SioCommand, def: SioCommandDef, iface: &mut SioInterface) -> CmdResponse {
        if let Some(transfer) = def.auto_transfer {
            iface.begin_command();
            iface.send_ack();
            if transfer.write {
                iface.receive_data(FENCE_AUTO_RECEIVE, transfer.length as usize, true);
                iface.send_complete(true);
                self.auto_receive = Some(transfer);
            }
            else {
                iface.send_complete(true);
                let data = match &transfer.source {
                    TransferSource::Blob(blob) => blob.clone(),
                    TransferSource::Segment(index) => {
                        self.state.config.segments.get(*index as usize)
                            .and_then(|seg| seg.read_slice(transfer.offset, transfer.length))
                            .unwrap_or_default()
                    }
                };
                iface.send_data(&data, true);
            }
            iface.end_command();
            return CmdResponse::Start
        }
        let script = match def.script {
            Some(script) => script,
            None => return CmdResponse::SendAckComplete
        };
        let now = self.state.clock.now();
        let vars = [
            (ThreadVar::Command, cmd.command as i32),
            (ThreadVar::Device, cmd.device as i32),
            (ThreadVar::Aux1, cmd.aux[0] as i32),
            (ThreadVar::Aux2, cmd.aux[1] as i32),
            (ThreadVar::Aux, cmd.aux_word() as i32),
            (ThreadVar::Timestamp, now as i32),
        ];
        for &(var, value) in vars.iter() {
            self.vm.set_thread_var(SIO_THREAD, var, value);
        }
        iface.begin_command();
        self.state.data_frame_received = false;
        let outcome = {
            let mut env = Env { state: &mut self.state, sio: Some(&mut *iface) };
            self.vm.run_void(SIO_THREAD, script, &mut env)
        };
        if outcome != Ok(Outcome::Suspended) {
            iface.end_command();
        }
        CmdResponse::Start
    }

    fn resume_sio_thread(&mut self, iface: &mut SioInterface) {
        let outcome = {
            let mut env = Env { state: &mut self.state, sio: Some(&mut *iface) };
            self.vm.resume(SIO_THREAD, &mut env)
        };
        if outcome != Ok(Outcome::Suspended) {
            iface.end_command();
        }
    }
}

impl SioDevice for CustomDevice {
    fn on_serial_begin_command(&mut self, cmd: &SioCommand, iface: &mut SioInterface) -> CmdResponse {
        if self.state.raw_enabled || !cmd.standard_rate {
            return CmdResponse::NotHandled
        }
        let table = match self.state.config.sio.as_ref() {
            Some(table) if table.device(cmd.device).is_some() => table,
            _ => return CmdResponse::NotHandled
        };
        let def = match table.lookup(cmd.device, cmd.command) {
            Some((_, def)) => def.clone(),
            None => return CmdResponse::FailNak
        };
        trace!("custom device: SIO command {:02X}:{:02X}", cmd.device, cmd.command);
        self.begin_sio_command(cmd, def, iface)
    }

    fn on_serial_accel_command(&mut self, req: &SioRequest, iface: &mut SioInterface) -> CmdResponse {
        if let Some(table) = self.state.config.sio.as_ref() {
            if let Some(device) = table.device(req.device) {
                if !device.allow_accel {
                    return CmdResponse::BypassAccel
                }
                if let Some((_, def)) = table.lookup(req.device, req.command) {
                    if !def.allow_accel {
                        return CmdResponse::BypassAccel
                    }
                }
            }
        }
        let cmd = SioCommand {
            device: req.device,
            command: req.command,
            aux: req.aux,
            cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
            standard_rate: true,
            ..SioCommand::default()
        };
        self.on_serial_begin_command(&cmd, iface)
    }

    fn on_serial_receive_complete(&mut self, id: u32, data: &[u8], _checksum_ok: bool, iface: &mut SioInterface) {
        match id {
            FENCE_AUTO_RECEIVE => {
                if let Some(transfer) = self.auto_receive.take() {
                    if let TransferSource::Segment(index) = transfer.source {
                        if let Some(segment) = self.state.config.segments.get(index as usize) {
                            segment.write_slice(transfer.offset, data);
                        }
                    }
                }
            }
            FENCE_SCRIPT_RECEIVE => {
                self.state.sio_frame.set_data(data);
                self.resume_sio_thread(iface);
                self.state.sio_frame.set_data(&[]);
            }
            _ => {}
        }
    }

    fn on_serial_fence(&mut self, id: u32, iface: &mut SioInterface) {
        if id == FENCE_SCRIPT_DELAY {
            self.resume_sio_thread(iface);
        }
    }

    fn on_serial_abort_command(&mut self) {
        self.vm.abort(SIO_THREAD);
        self.auto_receive = None;
        self.state.data_frame_received = false;
    }
}

impl RawSioDevice for CustomDevice {
    fn on_command_state_changed(&mut self, asserted: bool, bus: &mut SioBus<'_>) {
        self.state.command_asserted = asserted;
        if !self.state.raw_enabled {
            return
        }
        self.run_event(DeviceEvent::SioCommandChanged);
        let queues = self.state.queues;
        self.vm.schedule_next(if asserted { queues.command_assert } else { queues.command_off });
        self.service(bus.scheduler());
    }

    fn on_motor_state_changed(&mut self, asserted: bool, bus: &mut SioBus<'_>) {
        self.state.motor_asserted = asserted;
        if !self.state.raw_enabled {
            return
        }
        self.run_event(DeviceEvent::SioMotorChanged);
        self.vm.schedule_next(self.state.queues.motor_changed);
        self.service(bus.scheduler());
    }

    fn on_receive_byte(&mut self, byte: u8, command: bool, cycles_per_bit: u32, bus: &mut SioBus<'_>) {
        if !self.state.raw_enabled {
            return
        }
        if let Some(function) = self.state.config.event(DeviceEvent::SioReceivedByte) {
            self.vm.specials[SpecialVar::Value as usize] = byte as i32;
            self.vm.set_thread_var(MAIN_THREAD, ThreadVar::Command, command as i32);
            self.set_timestamp(MAIN_THREAD);
            let mut env = Env::new(&mut self.state);
            let _ = self.vm.run_void(MAIN_THREAD, function, &mut env);
        }
        else if let Some(tid) = self.vm.schedule_next(self.state.queues.raw_recv) {
            self.state.checksums.add_received(byte);
            self.vm.set_thread_var(tid, ThreadVar::Aux, cycles_per_bit as i32);
            self.vm.set_resume_int(tid, byte as i32);
            let mut env = Env::new(&mut self.state);
            let _ = self.vm.resume(tid, &mut env);
        }
        self.service(bus.scheduler());
    }
}

/// Dispatches accesses of a control or write-through layer to the device.
///
/// Accesses made while the device is busy, e.g. by its own scripts, pass through.
struct LayerHandler {
    device: SharedCustomDevice,
    index: usize,
}

impl MemoryHandler for LayerHandler {
    fn debug_read(&mut self, addr: u16) -> Option<u8> {
        self.device.try_borrow_mut().ok()?.read_layer(self.index, addr, true)
    }

    fn read(&mut self, addr: u16) -> Option<u8> {
        self.device.try_borrow_mut().ok()?.read_layer(self.index, addr, false)
    }

    fn write(&mut self, addr: u16, value: u8) -> bool {
        match self.device.try_borrow_mut() {
            Ok(mut device) => device.write_layer(self.index, addr, value),
            Err(_) => false
        }
    }
}

fn segment_in<'a>(segments: &'a [Segment], sio_frame: &'a Segment, object: ObjectRef) -> Result<&'a Segment, VmError> {
    if object == SIO_FRAME {
        return Ok(sio_frame)
    }
    segments.get(object.index as usize).ok_or(VmError::InvalidObject(object))
}

/// Returns a mutable and a shared reference to two different items.
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> Option<(&mut T, &T)> {
    if a == b || a >= items.len() || b >= items.len() {
        return None
    }
    if a < b {
        let (head, tail) = items.split_at_mut(b);
        Some((&mut head[a], &tail[0]))
    }
    else {
        let (head, tail) = items.split_at_mut(a);
        Some((&mut tail[0], &head[b]))
    }
}

impl DeviceState {
    fn segment(&self, object: ObjectRef) -> Result<&Segment, VmError> {
        segment_in(&self.config.segments, &self.sio_frame, object)
    }

    fn request_install(&mut self) {
        if !self.requests.iter().any(|req| matches!(req, HostRequest::InstallLayers)) {
            self.requests.push(HostRequest::InstallLayers);
        }
    }

    fn set_pbi_irq(&mut self, asserted: bool) {
        if self.irq_asserted == asserted {
            return
        }
        self.irq_asserted = asserted;
        if let Some((irq, handle)) = self.irq.as_ref() {
            irq.set(*handle, asserted);
        }
    }

    fn update_layer_modes(&mut self, index: usize) {
        let conditions = self.conditions;
        if let Some(ml) = self.config.layers.get_mut(index) {
            let modes = ml.effective_modes(&conditions);
            if ml.cart_window == Some(CartWindow::Left) {
                ml.rd5_active = !modes.is_empty();
            }
            if let Some(layer) = ml.layer {
                self.requests.push(HostRequest::SetLayerModes { layer, modes });
            }
        }
    }

    fn update_auto_layers<F: Fn(AutoEnable) -> bool>(&mut self, filter: F) {
        for index in 0..self.config.layers.len() {
            if filter(self.config.layers[index].auto_enable) {
                self.update_layer_modes(index);
            }
        }
    }

    fn apply_cart_enables(&mut self) {
        let carts = self.carts;
        for ml in self.config.layers.iter() {
            let enabled = match ml.cart_window {
                Some(CartWindow::Left) => carts.left,
                Some(CartWindow::Right) => carts.right,
                Some(CartWindow::Cctl) => carts.cctl,
                None => continue
            };
            if let Some(layer) = ml.layer {
                self.requests.push(HostRequest::SetLayerMasked { layer, masked: !enabled });
            }
        }
    }
    /// Points the memory manager at the layer's current segment window.
    fn remap_layer(&mut self, index: usize) {
        let ml = match self.config.layers.get(index) {
            Some(ml) => ml,
            None => return
        };
        if let (Some(layer), Some(segment)) = (ml.layer, ml.segment) {
            if let Some(segment) = self.config.segments.get(segment as usize) {
                let memory = segment.memory().clone();
                let offset = ml.segment_offset as usize;
                self.requests.push(HostRequest::SetLayerMemory { layer, memory, offset });
            }
        }
    }

    fn move_layer(&mut self, index: usize) {
        if let Some(ml) = self.config.layers.get(index) {
            if let Some(layer) = ml.layer {
                let (page_base, page_count) = (ml.page_base(), ml.page_count());
                self.requests.push(HostRequest::SetLayerAddress { layer, page_base, page_count });
            }
        }
    }

    /*** network ***/

    fn frame(&self, command: NetCommand, address: u32, value: i32) -> NetFrame {
        NetFrame { command, address, value, tick: self.clock.now() }
    }
    /// Posts a command, reconnecting if the connection dropped.
    fn post_net_command(&mut self, vm: &mut Vm, address: u32, value: i32, command: NetCommand) -> bool {
        let frame = self.frame(command, address, value);
        for _ in 0..NET_RETRIES {
            match self.net.as_mut() {
                Some(net) => if net.post(&frame) {
                    return true
                }
                None => return false
            }
            if !self.try_restore_net(vm) {
                return false
            }
        }
        false
    }
    /// Posts a command and serves the server's requests until it returns a value.
    ///
    /// Yields `value` if there is no server to ask.
    fn send_net_command(&mut self, vm: &mut Vm, address: u32, value: i32, command: NetCommand) -> i32 {
        if self.net.is_none() || !self.post_net_command(vm, address, value, command) {
            return value
        }
        self.execute_net_requests(vm, true)
    }
    /// Posts the reconnection variant of cold reset over a fresh connection.
    fn reconnect(&mut self) -> bool {
        let frame = self.frame(NetCommand::ColdReset, 0, RECONNECT_RESET);
        match self.net.as_mut() {
            Some(net) => net.restore() && net.post(&frame),
            None => false
        }
    }

    fn try_restore_net(&mut self, vm: &mut Vm) -> bool {
        if !self.reconnect() {
            return false
        }
        if let Some(net) = self.net.as_ref() {
            info!("custom device: reconnected to port {}", net.port());
        }
        self.execute_net_requests(vm, true);
        true
    }
    /// Reports an error to the server and to the host.
    fn post_net_error(&mut self, message: &str) {
        let frame = self.frame(NetCommand::Error, 0, message.len() as i32);
        if let Some(net) = self.net.as_mut() {
            if net.post(&frame) {
                net.send(message.as_bytes());
            }
        }
        let message = format!("Communication error with custom device server: {}", message);
        error!("custom device: {}", message);
        self.last_error = Some(message);
    }
    /// Serves requests from the server.
    ///
    /// While `waiting` the loop blocks until the server returns a value, otherwise it stops
    /// when nothing more is pending.
    fn execute_net_requests(&mut self, vm: &mut Vm, mut waiting: bool) -> i32 {
        let mut result = 0;
        let mut ignore_result = false;
        let mut reconnects = 0;
        loop {
            let reply = match self.net.as_mut() {
                Some(net) => {
                    if !waiting && !net.poll_readable() {
                        break
                    }
                    net.recv_reply()
                }
                None => break
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(err @ NetError::InvalidCommand(_)) => {
                    debug!("custom device: {:?}", err);
                    self.post_net_error(&err.to_string());
                    break
                }
                Err(err) => {
                    debug!("custom device: server connection lost: {}", err);
                    reconnects += 1;
                    if reconnects > NET_RETRIES || !self.reconnect() {
                        break
                    }
                    // the reply to the reconnection reset is not the value we wait for
                    waiting = true;
                    ignore_result = true;
                    continue
                }
            };
            trace!("custom device: server request {:?}", reply);
            match reply {
                NetReply::None => {}
                NetReply::ReturnValue(value) => {
                    result = if ignore_result { 0 } else { value };
                    waiting = false;
                }
                NetReply::EnableMemoryLayer { layer, flags } => {
                    let index = layer as usize;
                    match self.config.layers.get_mut(index) {
                        Some(ml) => if ml.layer.is_some() {
                            let mut modes = AccessMode::empty();
                            if flags & 1 != 0 {
                                modes |= AccessMode::W;
                            }
                            if flags & 2 != 0 {
                                modes |= AccessMode::AR;
                            }
                            if ml.enabled_modes != modes {
                                ml.enabled_modes = modes;
                                self.update_layer_modes(index);
                            }
                        }
                        None => self.post_net_error("EnableMemoryLayer: Invalid memory layer index")
                    }
                }
                NetReply::SetMemoryLayerOffset { layer, offset } => {
                    let index = layer as usize;
                    match self.config.layers.get_mut(index) {
                        Some(ml) if ml.layer.is_some() && ml.segment.is_some() => {
                            if offset <= i32::MAX as u32 && ml.set_offset(offset as i32) {
                                self.remap_layer(index);
                            }
                        }
                        Some(_) => self.post_net_error("SetMemoryLayerOffset: Invalid memory layer offset"),
                        None => self.post_net_error("SetMemoryLayerOffset: Invalid memory layer index")
                    }
                }
                NetReply::SetMemoryLayerSegmentOffset { layer, segment, offset } => {
                    let index = layer as usize;
                    let seg_len = self.config.segments.get(segment as usize).map(Segment::len);
                    match (self.config.layers.get_mut(index), seg_len) {
                        (Some(ml), Some(seg_len)) => {
                            let valid = ml.layer.is_some() && ml.segment.is_some() && offset & 0xFF == 0
                                        && offset < seg_len && seg_len - offset >= ml.size;
                            if !valid {
                                self.post_net_error("SetMemoryLayerSegmentOffset: Invalid memory layer range");
                            }
                            else if ml.set_segment_and_offset(segment as u32, seg_len, offset as i32) {
                                self.remap_layer(index);
                            }
                        }
                        _ => self.post_net_error("SetMemoryLayerSegmentOffset: Invalid memory layer index")
                    }
                }
                NetReply::SetMemoryLayerReadOnly { layer, read_only } => {
                    match self.config.layers.get(layer as usize) {
                        Some(ml) => if let Some(layer) = ml.layer {
                            self.requests.push(HostRequest::SetLayerReadOnly { layer, read_only });
                        }
                        None => self.post_net_error("SetMemoryLayerReadOnly: Invalid memory layer index")
                    }
                }
                NetReply::ReadSegmentMemory { segment, offset, len } => {
                    match self.config.segments.get(segment as usize) {
                        Some(seg) => match seg.read_slice(offset, len) {
                            Some(data) => {
                                if let Some(net) = self.net.as_mut() {
                                    net.send(&data);
                                }
                            }
                            None => self.post_net_error("ReadSegmentMemory: Invalid segment range")
                        }
                        None => self.post_net_error("ReadSegmentMemory: Invalid segment index")
                    }
                }
                NetReply::WriteSegmentMemory { segment, offset, len } => {
                    let fits = self.config.segments.get(segment as usize)
                                   .map(|seg| offset <= seg.len() && seg.len() - offset >= len);
                    match fits {
                        Some(true) => {
                            let mut data = vec![0u8; len as usize];
                            let received = match self.net.as_mut() {
                                Some(net) => net.recv_exact(&mut data),
                                None => false
                            };
                            if received {
                                self.config.segments[segment as usize].write_slice(offset, &data);
                            }
                        }
                        Some(false) => self.post_net_error("WriteSegmentMemory: Invalid segment range"),
                        None => self.post_net_error("WriteSegmentMemory: Invalid segment index")
                    }
                }
                NetReply::CopySegmentMemory { dst, dst_offset, src, src_offset, len } => {
                    let segments = &self.config.segments;
                    match (segments.get(dst as usize), segments.get(src as usize)) {
                        (Some(dst_seg), Some(src_seg)) => {
                            let fits = dst_offset <= dst_seg.len() && dst_seg.len() - dst_offset >= len;
                            match src_seg.read_slice(src_offset, len) {
                                Some(data) if fits => { dst_seg.write_slice(dst_offset, &data); }
                                _ => self.post_net_error("CopySegmentMemory: Invalid segment ranges")
                            }
                        }
                        _ => self.post_net_error("CopySegmentMemory: Invalid segment index")
                    }
                }
                NetReply::FillSegmentMemory { segment, offset, value, len } => {
                    match self.config.segments.get(segment as usize) {
                        Some(seg) => if offset <= seg.len() && seg.len() - offset >= len {
                            seg.write_slice(offset, &vec![value; len as usize]);
                        }
                        else {
                            self.post_net_error("FillSegmentMemory: Invalid segment range");
                        }
                        None => self.post_net_error("FillSegmentMemory: Invalid segment index")
                    }
                }
                NetReply::ScriptInterrupt { aux1, aux2 } => {
                    let function = self.config.event(DeviceEvent::NetworkInterrupt);
                    if let Some(function) = function {
                        if vm.active_thread() != Some(INTERRUPT_THREAD) {
                            vm.set_thread_var(INTERRUPT_THREAD, ThreadVar::Aux1, aux1 as i32);
                            vm.set_thread_var(INTERRUPT_THREAD, ThreadVar::Aux2, aux2 as i32);
                            vm.set_thread_var(INTERRUPT_THREAD, ThreadVar::Timestamp, self.clock.now() as i32);
                            let mut env = Env::new(self);
                            let _ = vm.run_void(INTERRUPT_THREAD, function, &mut env);
                        }
                    }
                }
                NetReply::GetSegmentNames => {
                    let names = encode_names(self.config.segments.iter().map(|s| s.name.as_str()));
                    if let Some(net) = self.net.as_mut() {
                        net.send(&names);
                    }
                }
                NetReply::GetMemoryLayerNames => {
                    let names = encode_names(self.config.layers.iter().map(|ml| ml.name.as_str()));
                    if let Some(net) = self.net.as_mut() {
                        net.send(&names);
                    }
                }
                NetReply::SetProtocolLevel(level) => {
                    if level < 2 {
                        self.post_net_error("SetProtocolLevel: Invalid protocol version");
                    }
                }
            }
        }
        result
    }

    /*** script methods ***/

    fn segment_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let segments = &self.config.segments;
        let sio_frame = &self.sio_frame;
        let seg = segment_in(segments, sio_frame, call.object)?;
        let other = |i: usize| segment_in(segments, sio_frame, call.object(i)?);
        let int = |i: usize| call.int(i);
        match call.name {
            "get_length" => return Ok(seg.get_length()),
            "clear" => seg.clear(int(0)),
            "fill" => seg.fill(int(0), int(1), int(2)),
            "xor_const" => seg.xor_const(int(0), int(1), int(2)),
            "reverse_bits" => seg.reverse_bits(int(0), int(1)),
            "translate" => seg.translate(int(0), other(1)?, int(2), int(3), other(4)?, int(5)),
            "copy" => seg.copy(int(0), other(1)?, int(2), int(3)),
            "copy_rect" => seg.copy_rect(int(0), int(1), other(2)?, int(3), int(4), int(5), int(6)),
            "read_byte" => return Ok(seg.read_byte(int(0))),
            "write_byte" => seg.write_byte(int(0), int(1)),
            "read_word" => return Ok(seg.read_word(int(0))),
            "write_word" => seg.write_word(int(0), int(1)),
            "read_rev_word" => return Ok(seg.read_rev_word(int(0))),
            "write_rev_word" => seg.write_rev_word(int(0), int(1)),
            _ => return Err(call.unknown())
        }
        Ok(0)
    }

    fn layer_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let index = call.index();
        if index >= self.config.layers.len() {
            return Err(VmError::InvalidObject(call.object))
        }
        match call.name {
            "set_offset" => {
                if self.config.layers[index].set_offset(call.int(0)) {
                    self.remap_layer(index);
                }
            }
            "set_segment_and_offset" => {
                let segment = call.object(0)?;
                if segment != SIO_FRAME {
                    let seg_len = self.segment(segment)?.len();
                    if self.config.layers[index].set_segment_and_offset(segment.index, seg_len, call.int(1)) {
                        self.remap_layer(index);
                    }
                }
            }
            "set_modes" => {
                if self.config.layers[index].set_modes(call.int(0), call.int(1)) {
                    self.update_layer_modes(index);
                }
            }
            "set_readonly" => {
                let ml = &mut self.config.layers[index];
                let read_only = call.int(0) != 0;
                if ml.read_only != read_only {
                    ml.read_only = read_only;
                    if let Some(layer) = ml.layer {
                        self.requests.push(HostRequest::SetLayerReadOnly { layer, read_only });
                    }
                }
            }
            "set_base_address" => {
                if self.config.layers[index].set_base_address(call.int(0)) {
                    self.move_layer(index);
                }
            }
            _ => return Err(call.unknown())
        }
        Ok(0)
    }

    fn network_method(&mut self, vm: &mut Vm, call: &Call<'_>) -> Result<i32, VmError> {
        let (address, value) = (call.int(0) as u32, call.int(1));
        match call.name {
            "send_message" => Ok(self.send_net_command(vm, address, value, NetCommand::ScriptEventSend)),
            "post_message" => Ok(self.post_net_command(vm, address, value, NetCommand::ScriptEventPost) as i32),
            _ => Err(call.unknown())
        }
    }
    /// Command methods act only inside an SIO callback. Raw methods need raw mode.
    fn sio_method(&mut self, vm: &mut Vm, sio: Option<&mut SioInterface>, call: &Call<'_>) -> Result<i32, VmError> {
        let raw = self.raw_enabled;
        match call.name {
            "ack" => if let Some(iface) = sio {
                self.delay_after_data_frame(iface);
                iface.send_ack();
            }
            "nak" => if let Some(iface) = sio {
                self.delay_after_data_frame(iface);
                iface.send_nak();
            }
            "error" => if let Some(iface) = sio {
                iface.send_error(true);
            }
            "complete" => if let Some(iface) = sio {
                iface.send_complete(true);
            }
            "send_frame" => if let Some(iface) = sio {
                let len = call.int(2);
                if len > 0 && len <= MAX_FRAME_LENGTH {
                    let seg = self.segment(call.object(0)?)?;
                    if let Some(span) = seg.span(call.int(1), len) {
                        let data = seg.memory().borrow()[span].to_vec();
                        iface.send_data(&data, true);
                        iface.insert_fence(FENCE_SCRIPT_DELAY);
                        vm.suspend_active(Wait::Sio);
                    }
                }
            }
            "recv_frame" => if let Some(iface) = sio {
                let len = call.int(0);
                if len > 0 && len <= MAX_FRAME_LENGTH {
                    self.data_frame_received = true;
                    iface.receive_data(FENCE_SCRIPT_RECEIVE, len as usize, true);
                    vm.suspend_active(Wait::Sio);
                }
            }
            "delay" => if let Some(iface) = sio {
                let ticks = call.int(0);
                if ticks > 0 && ticks <= MAX_SCRIPT_DELAY {
                    iface.delay(ticks as u32);
                    iface.insert_fence(FENCE_SCRIPT_DELAY);
                    vm.suspend_active(Wait::Sio);
                }
            }
            "enable_raw" => if self.sio_attached {
                self.raw_enabled = call.int(0) != 0;
            }
            "set_proceed" => if raw {
                self.requests.push(HostRequest::SetSioProceed(call.int(0) != 0));
            }
            "set_interrupt" => if raw {
                self.requests.push(HostRequest::SetSioInterrupt(call.int(0) != 0));
            }
            "command_asserted" => return Ok((self.sio_attached && self.command_asserted) as i32),
            "motor_asserted" => return Ok((self.sio_attached && self.motor_asserted) as i32),
            "send_raw_byte" => {
                let cycles_per_bit = call.int(1);
                if raw && cycles_per_bit >= MIN_RAW_CYCLES_PER_BIT && cycles_per_bit <= MAX_RAW_CYCLES_PER_BIT {
                    if let Some(tid) = vm.suspend_active(Wait::RawSend) {
                        vm.raw_send.push(RawSend {
                            thread: Some(tid),
                            byte: call.int(0) as u8,
                            cycles_per_bit: cycles_per_bit as u32
                        });
                    }
                }
            }
            "recv_raw_byte" => if raw {
                vm.wait_on(self.queues.raw_recv);
            }
            "wait_command" => if raw {
                vm.wait_on(self.queues.command_assert);
            }
            "wait_command_off" => if raw && self.command_asserted {
                vm.wait_on(self.queues.command_off);
            }
            "wait_motor_changed" => if raw {
                vm.wait_on(self.queues.motor_changed);
            }
            "reset_recv_checksum" => self.checksums.reset_recv(),
            "reset_send_checksum" => self.checksums.send = 0,
            "get_recv_checksum" => return Ok(self.checksums.recv_checksum()),
            "check_recv_checksum" => return Ok(self.checksums.check_recv() as i32),
            "get_send_checksum" => return Ok(self.checksums.send_checksum()),
            _ => return Err(call.unknown())
        }
        Ok(0)
    }

    fn delay_after_data_frame(&mut self, iface: &mut SioInterface) {
        if mem::take(&mut self.data_frame_received) {
            iface.delay(DATA_FRAME_ACK_DELAY);
        }
    }

    fn clock_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let clock = &mut self.local_clock;
        Ok(match call.name {
            "capture_local_time" => {
                clock.capture(self.clock.now());
                0
            }
            "local_year" => clock.year,
            "local_month" => clock.month,
            "local_day" => clock.day,
            "local_day_of_week" => clock.day_of_week,
            "local_hour" => clock.hour,
            "local_minute" => clock.minute,
            "local_second" => clock.second,
            _ => return Err(call.unknown())
        })
    }

    fn console_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let request = match call.name {
            "set_console_button_state" => {
                let button = call.int(0);
                if !matches!(button, 1|2|4) {
                    return Ok(0)
                }
                HostRequest::ConsoleButton { button: button as u8, pressed: call.int(1) != 0 }
            }
            "set_key_state" => {
                let key = call.int(0);
                if key < 0 || key > 0xFF {
                    return Ok(0)
                }
                HostRequest::KeyState { key: key as u8, pressed: call.int(1) != 0 }
            }
            "push_break" => HostRequest::PushBreak,
            _ => return Err(call.unknown())
        };
        self.requests.push(request);
        Ok(0)
    }

    fn controller_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let port = *self.config.controller_ports.get(call.index())
                                                .ok_or(VmError::InvalidObject(call.object))?;
        let value = call.int(0);
        let request = match call.name {
            "set_paddle_a" => HostRequest::Paddle { port, second: false, position: value },
            "set_paddle_b" => HostRequest::Paddle { port, second: true, position: value },
            "set_trigger" => HostRequest::Trigger { port, pressed: value != 0 },
            "set_dirs" => HostRequest::Dirs { port, dirs: (value & 15) as u8 },
            _ => return Err(call.unknown())
        };
        self.requests.push(request);
        Ok(0)
    }

    fn debug_method(&mut self, vm: &Vm, call: &Call<'_>) -> Result<i32, VmError> {
        let text = call.string(vm, 0)?;
        let line = match call.name {
            "log" => text.to_string(),
            "log_int" => format!("{}{}", text, call.int(1)),
            _ => return Err(call.unknown())
        };
        debug!("custom device: {}", line);
        self.requests.push(HostRequest::Log(line));
        Ok(0)
    }

    fn image_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let index = call.index();
        let config = &mut self.config;
        if index >= config.images.len() {
            return Err(VmError::InvalidObject(call.object))
        }
        let int = |i: usize| call.int(i);
        match call.name {
            "clear" => config.images[index].clear(int(0)),
            "get_pixel" => return Ok(config.images[index].get_pixel(int(0), int(1))),
            "put_pixel" => config.images[index].put_pixel(int(0), int(1), int(2)),
            "fill_rect" => config.images[index].fill_rect(int(0), int(1), int(2), int(3), int(4)),
            "invert_rect" => config.images[index].invert_rect(int(0), int(1), int(2), int(3)),
            "blt" => {
                let src = call.object(2)?.index as usize;
                if src == index {
                    config.images[index].blt_within(int(0), int(1), int(3), int(4), int(5), int(6));
                }
                else {
                    let (dst, src) = pair_mut(&mut config.images, index, src)
                                     .ok_or(VmError::InvalidObject(call.object))?;
                    dst.blt(int(0), int(1), src, int(3), int(4), int(5), int(6));
                }
            }
            "blt_expand1" => {
                let seg = segment_in(&config.segments, &self.sio_frame, call.object(2)?)?;
                let data = seg.memory().borrow();
                config.images[index].blt_expand1(int(0), int(1), &data, int(3), int(4), int(5), int(6),
                                                 int(7), int(8));
            }
            "blt_tile_map" => {
                let tiles = call.object(2)?.index as usize;
                let seg = segment_in(&config.segments, &self.sio_frame, call.object(5)?)?;
                let map = seg.memory().borrow();
                if tiles == index {
                    let tiles = config.images[index].clone();
                    config.images[index].blt_tile_map(int(0), int(1), &tiles, int(3), int(4), &map,
                                                      int(6), int(7), int(8), int(9));
                }
                else {
                    let (dst, tiles) = pair_mut(&mut config.images, index, tiles)
                                       .ok_or(VmError::InvalidObject(call.object))?;
                    dst.blt_tile_map(int(0), int(1), tiles, int(3), int(4), &map,
                                     int(6), int(7), int(8), int(9));
                }
            }
            _ => return Err(call.unknown())
        }
        Ok(0)
    }

    fn video_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let config = &mut self.config;
        let output = config.video_outputs.get_mut(call.index())
                                         .ok_or(VmError::InvalidObject(call.object))?;
        match call.name {
            "set_par" => output.set_par(call.int(0), call.int(1)),
            "set_image" => {
                let image = call.object(0)?;
                let img = config.images.get(image.index as usize).ok_or(VmError::InvalidObject(image))?;
                output.set_image(image.index, img);
            }
            "mark_active" => output.mark_active(),
            "set_pass_through" => output.set_pass_through(call.int(0)),
            "set_text_area" => output.set_text_area(call.int(0), call.int(1)),
            "set_copy_text_source" => {
                let segment = call.object(0)?;
                if segment != SIO_FRAME {
                    let seg = config.segments.get(segment.index as usize)
                                             .ok_or(VmError::InvalidObject(segment))?;
                    output.set_copy_text_source(segment.index, seg.len(), call.int(1), call.int(2));
                }
            }
            _ => return Err(call.unknown())
        }
        Ok(0)
    }

    fn sound_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let sound = call.object.index;
        if call.index() >= self.config.sounds.len() {
            return Err(VmError::InvalidObject(call.object))
        }
        let request = match call.name {
            "play" => {
                let params = call.object(0)?;
                let params = *self.config.sound_params.get(params.index as usize)
                                                      .ok_or(VmError::InvalidObject(params))?;
                HostRequest::PlaySound { sound, params }
            }
            "stop_all" => HostRequest::StopSounds { sound },
            _ => return Err(call.unknown())
        };
        self.requests.push(request);
        Ok(0)
    }

    fn sound_params_method(&mut self, call: &Call<'_>) -> Result<i32, VmError> {
        let params = self.config.sound_params.get_mut(call.index())
                                             .ok_or(VmError::InvalidObject(call.object))?;
        let (x, y) = (call.int(0), call.int(1));
        match call.name {
            "set_pan" => params.set_pan(x, y),
            "set_volume" => params.set_volume(x, y),
            "set_rate" => params.set_rate(x, y),
            "set_looping" => params.set_looping(x),
            _ => return Err(call.unknown())
        }
        Ok(0)
    }
}

/// A method call being dispatched.
struct Call<'a> {
    object: ObjectRef,
    method: u16,
    name: &'static str,
    args: &'a [Value],
}

impl Call<'_> {
    fn int(&self, i: usize) -> i32 {
        self.args.get(i).copied().unwrap_or_default().as_int()
    }

    fn object(&self, i: usize) -> Result<ObjectRef, VmError> {
        self.args.get(i).and_then(|v| v.as_object()).ok_or_else(|| self.unknown())
    }

    fn string<'v>(&self, vm: &'v Vm, i: usize) -> Result<&'v str, VmError> {
        let id = self.args.get(i).and_then(|v| v.as_str_id()).ok_or_else(|| self.unknown())?;
        Ok(vm.program().string(id))
    }

    fn index(&self) -> usize {
        self.object.index as usize
    }

    fn unknown(&self) -> VmError {
        VmError::InvalidMethod(self.object.class, self.method)
    }
}

/// The [Environment] scripts run in.
///
/// `sio` is present only while an SIO callback runs the command script.
struct Env<'a> {
    state: &'a mut DeviceState,
    sio: Option<&'a mut SioInterface>,
}

impl<'a> Env<'a> {
    fn new(state: &'a mut DeviceState) -> Self {
        Env { state, sio: None }
    }
}

impl Environment for Env<'_> {
    fn now(&self) -> Ticks {
        self.state.clock.now()
    }

    fn call_method(&mut self, vm: &mut Vm, object: ObjectRef, method: u16, args: &[Value]) -> Result<i32, VmError> {
        let desc = object.class.methods().get(method as usize)
                         .ok_or(VmError::InvalidMethod(object.class, method))?;
        let call = Call { object, method, name: desc.name, args };
        let state = &mut *self.state;
        match object.class {
            ClassId::Segment => state.segment_method(&call),
            ClassId::MemoryLayer => state.layer_method(&call),
            ClassId::Network => state.network_method(vm, &call),
            ClassId::Sio => state.sio_method(vm, self.sio.as_deref_mut(), &call),
            ClassId::PbiDevice => {
                match call.name {
                    "assert_irq" => state.set_pbi_irq(true),
                    "negate_irq" => state.set_pbi_irq(false),
                    _ => return Err(call.unknown())
                }
                Ok(0)
            }
            ClassId::Clock => state.clock_method(&call),
            ClassId::Console => state.console_method(&call),
            ClassId::ControllerPort => state.controller_method(&call),
            ClassId::Debug => state.debug_method(vm, &call),
            ClassId::Image => state.image_method(&call),
            ClassId::VideoOutput => state.video_method(&call),
            ClassId::Sound => state.sound_method(&call),
            ClassId::SoundParams => state.sound_params_method(&call),
            ClassId::Emulator => {
                let command = call.string(vm, 0)?.to_string();
                info!("custom device: emulator command: {}", command);
                state.requests.push(HostRequest::RunCommand(command));
                Ok(0)
            }
            ClassId::Thread|ClassId::SioDevice => Err(call.unknown())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atarusty_core::memory::OPEN_BUS;
    use crate::config::{compile_config, NoResources};

    fn device(src: &str) -> (CustomDevice, Scheduler) {
        let mut sched = Scheduler::new();
        let irq = IrqController::new();
        let mut dev = CustomDevice::new(OwnerId(7));
        dev.init(&mut sched, &irq);
        let config = compile_config(src, "test.atdevice", &mut NoResources, false).unwrap();
        dev.load_config(config);
        dev.service(&mut sched);
        (dev, sched)
    }

    fn run(dev: &mut CustomDevice, sched: &mut Scheduler, limit: Ticks) {
        while let Some(ev) = sched.run_next(limit) {
            assert!(dev.owns_event(ev.owner, ev.id));
            dev.on_host_event(sched, ev.id);
        }
    }

    #[test]
    fn settings_work() {
        let settings = CustomDeviceSettings {
            path: "dev/board.atdevice".into(),
            hot_reload: true,
            allow_unsafe: false
        };
        let props = settings.to_props();
        assert_eq!(props.get_string("path", ""), "dev/board.atdevice");
        assert!(props.get_bool("hotreload", false));
        assert!(!props.contains("allowunsafe"));
        assert_eq!(CustomDeviceSettings::from_props(&props), settings);
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"hotReload\":true"));
        let back: CustomDeviceSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);

        let mut dev = CustomDevice::new(OwnerId(1));
        assert!(dev.apply_settings(&props));
        assert!(!dev.apply_settings(&props));
        assert_eq!(dev.settings(), props);
    }

    #[test]
    fn sleeping_script_wakes_exactly_on_time() {
        let (mut dev, mut sched) = device(r#"
            int woke = 0;
            event "cold_reset": function { thread.sleep(1000); woke = 1; };
        "#);
        sched.advance_to(5000);
        dev.cold_reset(&mut sched);
        assert_eq!(dev.vm().globals[0], 0);
        run(&mut dev, &mut sched, 5999);
        assert_eq!(dev.vm().globals[0], 0);
        run(&mut dev, &mut sched, 10_000);
        assert_eq!(dev.vm().globals[0], 1);
        assert!(dev.vm().sleepers.is_empty());
        assert_eq!(sched.pending_count(), 0);
    }

    #[test]
    fn long_sleeps_are_rearmed() {
        let (mut dev, mut sched) = device(r#"
            int woke = 0;
            event "cold_reset": function { thread.sleep(2500000); woke = 1; };
        "#);
        dev.cold_reset(&mut sched);
        run(&mut dev, &mut sched, 2_499_999);
        assert_eq!(dev.vm().globals[0], 0);
        run(&mut dev, &mut sched, 2_500_000);
        assert_eq!(dev.vm().globals[0], 1);
    }

    #[test]
    fn raw_bytes_are_sent_in_order() {
        let (mut dev, mut sched) = device(r#"
            Thread a;
            Thread b;
            function send_a() { sio.send_raw_byte(65, 100); sio.send_raw_byte(66, 100); }
            function send_b() { sio.send_raw_byte(97, 100); }
            event "cold_reset": function { sio.enable_raw(1); a.run(send_a); b.run(send_b); };
        "#);
        assert!(dev.take_requests().iter().any(|req| matches!(req, HostRequest::AttachSio(true))));
        sched.advance_to(100);
        dev.cold_reset(&mut sched);
        let mut sent = Vec::new();
        while let Some(ev) = sched.run_next(20_000) {
            dev.on_host_event(&mut sched, ev.id);
            for req in dev.take_requests() {
                if let HostRequest::SendRawByte { byte, cycles_per_bit } = req {
                    assert_eq!(cycles_per_bit, 100);
                    sent.push((byte, sched.now()));
                }
            }
        }
        assert_eq!(sent, [(0x41, 101), (0x61, 1101), (0x42, 2101)]);
        assert_eq!(dev.state.checksums.send_checksum(), 0x41 + 0x61 + 0x42);
        assert!(dev.vm().raw_send.is_empty());
    }

    #[test]
    fn raw_receive_resumes_waiting_thread() {
        let (mut dev, mut sched) = device(r#"
            int got = 0;
            Thread reader;
            function read() { got = sio.recv_raw_byte(); }
            event "cold_reset": function { sio.enable_raw(1); reader.run(read); };
        "#);
        dev.cold_reset(&mut sched);
        run(&mut dev, &mut sched, 10);
        let reader = crate::vm::FIRST_USER_THREAD;
        assert_eq!(dev.vm().wait_of(reader), Some(Wait::Queue(dev.state.queues.raw_recv)));
        // a received byte without a bus: feed it the way the raw callback does
        let tid = dev.vm.schedule_next(dev.state.queues.raw_recv).unwrap();
        dev.state.checksums.add_received(0x5A);
        dev.vm.set_resume_int(tid, 0x5A);
        let mut env = Env::new(&mut dev.state);
        dev.vm.resume(tid, &mut env).unwrap();
        assert_eq!(dev.vm().globals[0], 0x5A);
        assert_eq!(dev.state.checksums.recv_checksum(), 0x5A);
    }

    #[test]
    fn nonvolatile_segments_survive_cold_reset() {
        let (mut dev, mut sched) = device(r#"
            Segment scratch: { size: 4, init_pattern: [1] };
            Segment keep: { size: 4, init_pattern: [2], persistence: "nonvolatile" };
        "#);
        dev.config().segments[0].write_slice(0, &[9, 9]);
        dev.config().segments[1].write_slice(0, &[9, 9]);
        dev.cold_reset(&mut sched);
        assert_eq!(dev.config().segments[0].to_vec(), [1, 1, 1, 1]);
        assert_eq!(dev.config().segments[1].to_vec(), [9, 9, 2, 2]);
    }

    #[test]
    fn control_layer_dispatches_bindings() {
        let (dev, _sched) = device(r#"
            int reg = 5;
            int inits = 0;
            MemoryLayer io: {
                name: "IO", address: $D500, size: $100,
                control: [
                    { address: $D500, mode: "r", data: $42 },
                    { address: $D503, mode: "rw", variable: "reg" },
                    { address: $D504, mode: "w", action: "block" },
                    { address: $D505, mode: "r", script: function { return reg + 1; } },
                    { address: $D506, mode: "w", script: function { reg = value * 2; } },
                ]
            };
            event "init": function { inits = inits + 1; };
        "#);
        let shared = Rc::new(RefCell::new(dev));
        assert!(shared.borrow().init_pending);
        assert_eq!(shared.borrow().vm().globals[1], 0);
        let mut mm = MemoryManager::new();
        CustomDevice::install(&shared, &mut mm).unwrap();
        assert_eq!(shared.borrow().vm().globals[1], 1);
        assert!(shared.borrow_mut().take_requests().iter().all(|req| !req.is_memory_request()));

        assert_eq!(mm.read_byte(0xD500), 0x42);
        assert_eq!(mm.read_byte(0xD503), 5);
        mm.write_byte(0xD503, 7);
        assert_eq!(shared.borrow().vm().globals[0], 7);
        assert_eq!(mm.read_byte(0xD505), 8);
        mm.write_byte(0xD506, 3);
        assert_eq!(shared.borrow().vm().globals[0], 6);
        assert_eq!(mm.read_byte(0xD510), OPEN_BUS);
        assert_eq!(mm.debug_read_byte(0xD500), 0x42);

        // reinstalling replaces the layers and doesn't run init again
        CustomDevice::install(&shared, &mut mm).unwrap();
        assert_eq!(shared.borrow().installed.len(), 1);
        assert_eq!(shared.borrow().vm().globals[1], 1);
        assert_eq!(mm.read_byte(0xD500), 0x42);
    }

    #[test]
    fn segment_layers_follow_scripts() {
        let (dev, mut sched) = device(r#"
            Segment rom: { size: $400, init_pattern: [1, 2, 3, 4] };
            MemoryLayer win: { name: "Window", address: $A000, size: $100,
                               segment: { source: rom, offset: 0, mode: "r" } };
            event "warm_reset": function { win.set_offset($100); win.set_base_address($B000); };
        "#);
        let shared = Rc::new(RefCell::new(dev));
        let mut mm = MemoryManager::new();
        CustomDevice::install(&shared, &mut mm).unwrap();
        assert_eq!(mm.read_byte(0xA000), 1);
        assert_eq!(mm.read_byte(0xA001), 2);
        shared.borrow_mut().warm_reset(&mut sched);
        for req in shared.borrow_mut().take_requests() {
            assert!(req.apply_to_memory(&mut mm).unwrap());
        }
        assert_eq!(mm.read_byte(0xA000), OPEN_BUS);
        assert_eq!(mm.read_byte(0xB001), 2);
        assert_eq!(shared.borrow().config().layers[0].segment_offset, 0x100);
    }

    #[test]
    fn pbi_interrupt_and_auto_layers() {
        let (mut dev, mut sched) = device(r#"
            int selects = 0;
            PBIDevice pbi: { device_id: 2, has_irq: true };
            MemoryLayer rom: { name: "PBI ROM", address: $D800, size: $800, auto_pbi: true,
                               control: [ { address: $D800, mode: "r", data: $A5 } ] };
            event "pbi_select": function { selects = selects + 1; pbi.assert_irq(); };
            event "pbi_deselect": function { pbi.negate_irq(); };
        "#);
        assert_eq!(dev.read_pbi_status(0x81), 0x81);
        dev.select_pbi(&mut sched, true);
        dev.select_pbi(&mut sched, true);
        assert_eq!(dev.vm().globals[0], 1);
        assert!(dev.is_pbi_irq_asserted());
        assert_eq!(dev.read_pbi_status(0x81), 0x83);
        dev.select_pbi(&mut sched, false);
        assert!(!dev.is_pbi_irq_asserted());
        assert_eq!(dev.read_pbi_status(0x83), 0x81);
    }

    #[test]
    fn scripts_drive_host_inputs() {
        let (mut dev, mut sched) = device(r#"
            Console console;
            ControllerPort port2: 1;
            event "vblank": function {
                console.set_console_button_state(1, 1);
                console.set_console_button_state(3, 1);
                console.set_key_state(300, 1);
                console.set_key_state($21, 1);
                port2.set_dirs($1F);
                port2.set_trigger(1);
                debug.log_int("frame ", 7);
            };
        "#);
        dev.take_requests();
        dev.vblank(&mut sched);
        let requests = dev.take_requests();
        assert!(matches!(requests[0], HostRequest::ConsoleButton { button: 1, pressed: true }));
        assert!(matches!(requests[1], HostRequest::KeyState { key: 0x21, pressed: true }));
        assert!(matches!(requests[2], HostRequest::Dirs { port: 1, dirs: 15 }));
        assert!(matches!(requests[3], HostRequest::Trigger { port: 1, pressed: true }));
        assert!(matches!(&requests[4], HostRequest::Log(line) if line == "frame 7"));
        assert_eq!(requests.len(), 5);
    }

    #[test]
    fn network_errors_are_reported() {
        let (mut dev, _sched) = device("");
        assert_eq!(dev.error_status(), None);
        let mut vm = Vm::default();
        dev.state.post_net_error("SetProtocolLevel: Invalid protocol version");
        assert_eq!(dev.error_status().unwrap(),
                   "Communication error with custom device server: SetProtocolLevel: Invalid protocol version");
        // without a server commands yield their argument
        assert_eq!(dev.state.send_net_command(&mut vm, 0xD500, 0x12, NetCommand::ReadByte), 0x12);
        assert!(!dev.state.post_net_command(&mut vm, 0, 0, NetCommand::ScriptEventPost));
    }
}
