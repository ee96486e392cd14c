/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! SIO multiplexer: shares the SIO bus of one computer (the host) with up to 8 other emulated
//! computers (the clients) over TCP.
//!
//! Each side talks to its computer through a VIA mapped into the cartridge control window.
//! Port A is the data bus, PB5 is the computer's active line, PB6 this device's active line,
//! CA2 the computer's strobe and CA1 with PB7 this device's acknowledge.
mod client;
mod host;
pub mod net;
pub mod protocol;

use core::cell::RefCell;
use std::net::{Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::{ClockHandle, EventHandle, OwnerId, Scheduler, Ticks};
use atarusty_core::memory::{AccessMode, LayerId, MemoryError, MemoryHandler, MemoryManager, PRI_CARTRIDGE2};
use atarusty_core::props::PropertySet;
use atarusty_core::trace::{ChannelId, SharedTrace};

use crate::via::{Via6522, ViaEvent, OUTPUT_CA2, VIA_EVENT_COUNT};

use client::ClientMachine;
use host::HostMachine;
use net::{ConnId, MuxTransport, NetEvent, TcpTransport};

/// The default TCP port.
pub const DEFAULT_PORT: u16 = 6522;
pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 49151;
/// The VIA is exposed at `$D570-$D57F`.
pub const CCTL_BASE: u16 = 0xD570;
/// The longest time the device waits between catch-ups with the host.
pub const RUN_SLICE: Ticks = 1024;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

const EV_COMM: u32 = VIA_EVENT_COUNT;
const EV_HOST_SLICE: u32 = 0;

const PA_MASK: u32 = 0x00FF;
/// PB3: the computer drives the data bus.
const PB_BUS_OUT: u32 = 0x0800;
/// PB5: the computer's active line.
const PB_ACTIVE_OUT: u32 = 0x2000;
/// The computer's strobe.
const OUTPUT_ACK: u32 = OUTPUT_CA2;

const PB_IN_SWITCHES: u8 = 0x07;
const PB_IN_ACTIVE: u8 = 0x40;
const PB_IN_ACK: u8 = 0x80;

const COLOR_DATA: u32 = 0x40A040;
const COLOR_STROBE: u32 = 0x808080;

#[inline]
fn is_one_hot(v: u8) -> bool {
    v.is_power_of_two()
}

/// Settings of a multiplexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiplexerSettings {
    /// `None` for the host, otherwise the client's device id 0-7.
    pub device_id: Option<u8>,
    pub port: u16,
    /// The host a client connects to. Empty means the local host.
    pub host_address: String,
    /// Lets the host accept connections from other machines.
    pub allow_external: bool,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        MultiplexerSettings {
            device_id: None,
            port: DEFAULT_PORT,
            host_address: String::new(),
            allow_external: false,
        }
    }
}

impl MultiplexerSettings {
    pub fn from_props(ps: &PropertySet) -> Self {
        let device_id = ps.get_i32("device_id", -1);
        let port = ps.get_u32("port", DEFAULT_PORT as u32).clamp(MIN_PORT as u32, MAX_PORT as u32);
        MultiplexerSettings {
            device_id: if device_id < 0 { None } else { Some(device_id as u8 & 7) },
            port: port as u16,
            host_address: ps.get_string("host_address", "").to_string(),
            allow_external: ps.get_bool("allow_external", false),
        }
    }

    pub fn to_props(&self) -> PropertySet {
        let mut ps = PropertySet::new();
        ps.set_i32("device_id", self.device_id.map_or(-1, i32::from));
        ps.set_u32("port", self.port as u32);
        if !self.host_address.is_empty() {
            ps.set_string("host_address", self.host_address.as_str());
        }
        if self.allow_external {
            ps.set_bool("allow_external", true);
        }
        ps
    }
    /// The address a client connects to.
    pub fn connect_host(&self) -> &str {
        if self.host_address.is_empty() { "localhost" } else { &self.host_address }
    }
    /// A one line description of the configuration.
    pub fn blurb(&self) -> String {
        match self.device_id {
            None => format!("host on port {}{}", self.port,
                            if self.allow_external { " (external)" } else { "" }),
            Some(id) => format!("client {} to {}:{}", id, self.connect_host(), self.port)
        }
    }
}

/// Bus activity recorded into a trace collection.
#[derive(Debug)]
struct MuxTrace {
    trace: SharedTrace,
    data_out: ChannelId,
    data_in: ChannelId,
    req: ChannelId,
    ack: ChannelId,
    out_open: Option<(Ticks, u8)>,
    in_open: Option<(Ticks, u8)>,
    req_start: Option<Ticks>,
    ack_start: Option<Ticks>,
}

impl MuxTrace {
    fn new(trace: SharedTrace) -> Option<Self> {
        let (data_out, data_in, req, ack) = {
            let mut coll = trace.borrow_mut();
            let group = coll.add_group("Multiplexer");
            (coll.add_channel(group, "Data Out")?,
             coll.add_channel(group, "Data In")?,
             coll.add_channel(group, "REQ")?,
             coll.add_channel(group, "ACK")?)
        };
        Some(MuxTrace {
            trace, data_out, data_in, req, ack,
            out_open: None, in_open: None, req_start: None, ack_start: None
        })
    }

    fn close_byte(&self, channel: ChannelId, open: Option<(Ticks, u8)>, now: Ticks) {
        if let Some((start, byte)) = open {
            self.trace.borrow_mut().add_event(channel, start, now, format!("{:02X}", byte), COLOR_DATA);
        }
    }

    fn output(&mut self, now: Ticks, output: u32) {
        let driven = if output & PB_BUS_OUT == 0 { Some(output as u8) } else { None };
        if self.out_open.map(|(_, b)| b) != driven {
            let open = self.out_open.take();
            self.close_byte(self.data_out, open, now);
            self.out_open = driven.map(|b| (now, b));
        }
        let req = output & OUTPUT_ACK == 0;
        match (req, self.req_start) {
            (true, None) => self.req_start = Some(now),
            (false, Some(start)) => {
                self.req_start = None;
                self.trace.borrow_mut().add_event(self.req, start, now, "REQ", COLOR_STROBE);
            }
            _ => {}
        }
    }

    fn input(&mut self, now: Ticks, byte: Option<u8>) {
        if self.in_open.map(|(_, b)| b) != byte {
            let open = self.in_open.take();
            self.close_byte(self.data_in, open, now);
            self.in_open = byte.map(|b| (now, b));
        }
    }

    fn ack(&mut self, now: Ticks, state: bool) {
        match (state, self.ack_start) {
            (true, None) => self.ack_start = Some(now),
            (false, Some(start)) => {
                self.ack_start = None;
                self.trace.borrow_mut().add_event(self.ack, start, now, "ACK", COLOR_STROBE);
            }
            _ => {}
        }
    }

    fn close(&mut self, now: Ticks) {
        self.output(now, u32::MAX);
        self.input(now, None);
        self.ack(now, false);
    }
}

#[derive(Debug)]
enum NetCommand {
    Send(ConnId, Vec<u8>),
    Close(ConnId),
}

/// The state machines' view of the VIA and the network.
struct Port<'a> {
    sched: &'a mut Scheduler,
    via: &'a mut Via6522,
    comm_event: &'a mut Option<EventHandle>,
    owner: OwnerId,
    trace: Option<&'a mut MuxTrace>,
    outbox: &'a mut Vec<NetCommand>,
}

impl Port<'_> {
    /// Fires the communication event `delay` cycles from now, replacing a pending one.
    fn schedule(&mut self, delay: Ticks) {
        self.sched.set_event(delay, self.owner, EV_COMM, self.comm_event);
    }

    fn output(&self) -> u32 {
        self.via.output()
    }

    fn set_input_byte(&mut self, byte: u8) {
        self.via.set_port_a_input(byte, 0xFF);
        let now = self.sched.now();
        if let Some(trace) = self.trace.as_deref_mut() {
            trace.input(now, Some(byte));
        }
    }

    fn clear_input_byte(&mut self) {
        self.via.set_port_a_input(0xFF, 0xFF);
        let now = self.sched.now();
        if let Some(trace) = self.trace.as_deref_mut() {
            trace.input(now, None);
        }
    }

    fn set_ack(&mut self, state: bool) {
        self.via.set_ca1_input(self.sched, state);
        self.via.set_port_b_input(if state { PB_IN_ACK } else { 0 }, PB_IN_ACK);
        let now = self.sched.now();
        if let Some(trace) = self.trace.as_deref_mut() {
            trace.ack(now, state);
        }
    }

    fn set_active(&mut self, state: bool) {
        self.via.set_port_b_input(if state { PB_IN_ACTIVE } else { 0 }, PB_IN_ACTIVE);
    }

    fn send(&mut self, conn: ConnId, data: Vec<u8>) {
        self.outbox.push(NetCommand::Send(conn, data));
    }

    fn close(&mut self, conn: ConnId) {
        self.outbox.push(NetCommand::Close(conn));
    }
}

#[derive(Debug)]
enum Role {
    Host(HostMachine),
    Client(ClientMachine),
}

impl Role {
    fn new(settings: &MultiplexerSettings) -> Self {
        match settings.device_id {
            None => Role::Host(HostMachine::default()),
            Some(_) => Role::Client(ClientMachine::default())
        }
    }

    fn cold_reset(&mut self, port: &mut Port<'_>) {
        match self {
            Role::Host(host) => host.cold_reset(port),
            Role::Client(client) => client.cold_reset(port),
        }
    }

    fn run(&mut self, port: &mut Port<'_>) {
        match self {
            Role::Host(host) => host.run(port),
            Role::Client(client) => client.run(port),
        }
    }

    fn on_port_output(&mut self, port: &mut Port<'_>, output: u32, prev: u32) {
        match self {
            Role::Host(host) => host.on_port_output(port, output, prev),
            Role::Client(client) => client.on_port_output(port, output, prev),
        }
    }
    /// Returns `false` if a client lost its connection to the host.
    fn on_net_event(&mut self, port: &mut Port<'_>, event: NetEvent) -> bool {
        match (self, event) {
            (Role::Host(host), NetEvent::Connected(id)) => host.on_connected(port, id),
            (Role::Host(host), NetEvent::Received(id, data)) => host.on_received(port, id, &data),
            (Role::Host(host), NetEvent::Closed(id)) => host.on_closed(port, id),
            (Role::Client(client), NetEvent::Connected(id)) => client.on_connected(port, id),
            (Role::Client(client), NetEvent::Received(_, data)) => {
                client.on_received(port, &data);
                return client.is_connected()
            }
            (Role::Client(client), NetEvent::Closed(_)) => {
                client.on_closed(port);
                return false
            }
            (Role::Client(_), NetEvent::ConnectFailed) => return false,
            (Role::Host(_), NetEvent::ConnectFailed) => {}
        }
        true
    }

    fn on_send_failed(&mut self, port: &mut Port<'_>, id: ConnId) {
        match self {
            Role::Host(host) => host.on_closed(port, id),
            Role::Client(client) => client.on_closed(port),
        }
    }
}

/// The SIO multiplexer device.
pub struct Multiplexer {
    owner: OwnerId,
    sched: Scheduler,
    via: Via6522,
    settings: MultiplexerSettings,
    role: Role,
    comm_event: Option<EventHandle>,
    slice_event: Option<EventHandle>,
    last_output: u32,
    transport: Option<Box<dyn MuxTransport>>,
    /// Whether the device opens its own sockets.
    managed: bool,
    reconnect_at: Option<Instant>,
    listen_error: Option<String>,
    outbox: Vec<NetCommand>,
    trace: Option<MuxTrace>,
    inited: bool,
}

/// A shared [Multiplexer].
pub type SharedMultiplexer = Rc<RefCell<Multiplexer>>;

impl Multiplexer {
    /// Creates a host. Its host scheduler events are posted for `owner`.
    pub fn new(owner: OwnerId) -> Self {
        let settings = MultiplexerSettings::default();
        let via = Via6522::new(owner, 0);
        Multiplexer {
            owner,
            sched: Scheduler::new(),
            last_output: via.output(),
            via,
            role: Role::new(&settings),
            settings,
            comm_event: None,
            slice_event: None,
            transport: None,
            managed: true,
            reconnect_at: None,
            listen_error: None,
            outbox: Vec::new(),
            trace: None,
            inited: false,
        }
    }

    pub fn settings(&self) -> PropertySet {
        self.settings.to_props()
    }

    pub fn multiplexer_settings(&self) -> &MultiplexerSettings {
        &self.settings
    }
    /// Applies settings. Returns `true` if anything changed, in which case an initialized
    /// device reopens its sockets and performs a cold reset.
    pub fn apply_settings(&mut self, ps: &PropertySet) -> bool {
        let settings = MultiplexerSettings::from_props(ps);
        if settings == self.settings {
            return false
        }
        let role_changed = settings.device_id.is_none() != self.settings.device_id.is_none();
        self.settings = settings;
        if role_changed {
            self.role = Role::new(&self.settings);
        }
        if self.inited {
            if self.managed {
                self.open_network();
            }
            self.cold_reset();
        }
        true
    }
    /// Uses the given transport instead of opening TCP sockets.
    pub fn attach_transport(&mut self, transport: Box<dyn MuxTransport>) {
        self.transport = Some(transport);
        self.managed = false;
        self.reconnect_at = None;
    }

    pub fn set_trace(&mut self, trace: Option<SharedTrace>) {
        let now = self.sched.now();
        if let Some(mut old) = self.trace.take() {
            old.close(now);
        }
        self.trace = trace.and_then(MuxTrace::new);
    }

    pub fn is_host(&self) -> bool {
        matches!(self.role, Role::Host(..))
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }
    /// Connects the device to the host machine: opens the network and performs a cold reset.
    pub fn init(&mut self, host: &mut Scheduler) {
        self.sched.advance_to(host.now());
        self.inited = true;
        if self.managed {
            self.open_network();
        }
        self.cold_reset();
        self.service(host);
    }

    pub fn shutdown(&mut self, host: &mut Scheduler) {
        host.unset_event(&mut self.slice_event);
        self.sched.unset_event(&mut self.comm_event);
        let now = self.sched.now();
        if let Some(trace) = self.trace.as_mut() {
            trace.close(now);
        }
        if self.managed {
            self.transport = None;
        }
        self.role = Role::new(&self.settings);
        self.inited = false;
    }

    fn open_network(&mut self) {
        self.transport = None;
        self.reconnect_at = None;
        self.listen_error = None;
        let port = self.settings.port;
        if let Role::Client(client) = &mut self.role {
            client.link = None;
        }
        let result = if self.is_host() {
            let ip = if self.settings.allow_external { Ipv6Addr::UNSPECIFIED } else { Ipv6Addr::LOCALHOST };
            TcpTransport::listen(SocketAddr::new(ip.into(), port))
        }
        else {
            TcpTransport::connect(self.settings.connect_host(), port)
        };
        match result {
            Ok(transport) => self.transport = Some(Box::new(transport)),
            Err(err) if self.is_host() => {
                error!("multiplexer: can't listen on port {}: {}", port, err);
                self.listen_error = Some(format!("Unable to listen on port {}: {}", port, err));
            }
            Err(err) => {
                error!("multiplexer: can't connect: {}", err);
                self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
            }
        }
    }

    fn parts(&mut self) -> (&mut Role, Port<'_>) {
        (&mut self.role, Port {
            sched: &mut self.sched,
            via: &mut self.via,
            comm_event: &mut self.comm_event,
            owner: self.owner,
            trace: self.trace.as_mut(),
            outbox: &mut self.outbox,
        })
    }

    pub fn cold_reset(&mut self) {
        self.via.reset(&mut self.sched);
        let switches = self.settings.device_id.unwrap_or(0);
        self.via.set_port_b_input(0xFF, !PB_IN_SWITCHES);
        self.via.set_port_b_input(switches, PB_IN_SWITCHES);
        self.via.set_ca2_input(&mut self.sched, true);
        let (role, mut port) = self.parts();
        port.clear_input_byte();
        port.set_ack(false);
        role.cold_reset(&mut port);
        self.process();
    }
    /// Drains the VIA notifications and the queued network traffic.
    fn process(&mut self) {
        loop {
            for event in self.via.take_events() {
                if let ViaEvent::OutputChanged(output) = event {
                    let prev = core::mem::replace(&mut self.last_output, output);
                    let now = self.sched.now();
                    let (role, mut port) = self.parts();
                    if let Some(trace) = port.trace.as_deref_mut() {
                        trace.output(now, output);
                    }
                    role.on_port_output(&mut port, output, prev);
                }
            }
            self.flush_outbox();
            if !self.via.has_events() && self.outbox.is_empty() {
                break
            }
        }
    }

    fn flush_outbox(&mut self) {
        for command in core::mem::take(&mut self.outbox) {
            let transport = match self.transport.as_mut() {
                Some(transport) => transport,
                None => continue
            };
            match command {
                NetCommand::Send(id, data) => {
                    if let Err(err) = transport.send(id, &data) {
                        warn!("multiplexer: send to {} failed: {}", id.0, err);
                        transport.close(id);
                        let (role, mut port) = self.parts();
                        role.on_send_failed(&mut port, id);
                    }
                }
                NetCommand::Close(id) => transport.close(id),
            }
        }
    }

    fn poll_network(&mut self) {
        if self.managed && self.transport.is_none() {
            match self.reconnect_at {
                Some(at) if Instant::now() >= at => self.open_network(),
                _ => return
            }
        }
        let events = match self.transport.as_mut() {
            Some(transport) => transport.poll_events(),
            None => return
        };
        let mut lost = false;
        for event in events {
            let (role, mut port) = self.parts();
            if !role.on_net_event(&mut port, event) {
                lost = true;
            }
        }
        if lost && self.managed {
            info!("multiplexer: reconnecting in {} s", RECONNECT_DELAY.as_secs());
            self.transport = None;
            self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
        }
        self.process();
    }
    /// Brings the device up to `host_now`.
    pub fn sync(&mut self, host_now: Ticks) {
        if !self.inited {
            return
        }
        self.poll_network();
        while let Some(ev) = self.sched.run_next(host_now) {
            if self.via.owns_event(ev.owner, ev.id) {
                self.via.on_scheduled_event(&mut self.sched, ev.id);
            }
            else if ev.id == EV_COMM {
                self.comm_event = None;
                let (role, mut port) = self.parts();
                role.run(&mut port);
            }
            self.process();
        }
    }

    pub fn read_byte_via(&mut self, host_now: Ticks, reg: u8) -> u8 {
        if !self.inited {
            return 0xFF
        }
        self.sync(host_now);
        let value = self.via.read_byte(&mut self.sched, reg & 15);
        self.process();
        value
    }

    pub fn write_byte_via(&mut self, host_now: Ticks, reg: u8, value: u8) {
        if !self.inited {
            return
        }
        self.sync(host_now);
        self.via.write_byte(&mut self.sched, reg & 15, value);
        self.process();
    }

    pub fn debug_read_byte_via(&self, reg: u8) -> u8 {
        if !self.inited {
            return 0xFF
        }
        self.via.debug_read_byte(self.sched.now(), reg & 15)
    }
    /// Schedules the next catch-up. Call after host code touched the device.
    pub fn service(&mut self, host: &mut Scheduler) {
        if !self.inited {
            return
        }
        let delta = match self.sched.next_event_tick() {
            Some(tick) => tick.saturating_sub(host.now()).clamp(1, RUN_SLICE),
            None => RUN_SLICE
        };
        host.set_event(delta, self.owner, EV_HOST_SLICE, &mut self.slice_event);
    }

    pub fn owns_event(&self, owner: OwnerId, id: u32) -> bool {
        owner == self.owner && id == EV_HOST_SLICE
    }

    pub fn on_host_event(&mut self, host: &mut Scheduler, id: u32) {
        if id == EV_HOST_SLICE {
            self.slice_event = None;
            self.sync(host.now());
            self.service(host);
        }
    }
    /// Describes a connection problem, if any.
    pub fn error_status(&self) -> Option<String> {
        match &self.role {
            Role::Host(_) => self.listen_error.clone(),
            Role::Client(client) if client.is_connected() => None,
            Role::Client(_) if self.transport.is_some() => {
                Some(format!("Connecting to {}:{}", self.settings.connect_host(), self.settings.port))
            }
            Role::Client(_) => Some("Not connected".to_string())
        }
    }

    pub fn dump_status(&self) -> String {
        let state = match &self.role {
            Role::Host(host) => format!("host: {:?} clients: {} active: {:?} busy: {}",
                                        host.state, host.connections.len(),
                                        host.active.map(|id| id.0), host.busy),
            Role::Client(client) => format!("client: {:?} host ready: {}",
                                            client.state, client.is_host_ready())
        };
        format!("{}\n{}\n", self.via.dump_status(self.sched.now()), state)
    }
}

/// Exposes the multiplexer's VIA at `$D570-$D57F` of the host address space.
pub struct MultiplexerCctl {
    device: SharedMultiplexer,
    clock: ClockHandle,
}

impl MultiplexerCctl {
    pub fn new(device: SharedMultiplexer, clock: ClockHandle) -> Self {
        MultiplexerCctl { device, clock }
    }
    /// Installs a handler layer over the `$D5xx` page and enables it.
    pub fn install(self, mm: &mut MemoryManager) -> Result<LayerId, MemoryError> {
        let id = mm.create_handler_layer(PRI_CARTRIDGE2, Rc::new(RefCell::new(self)), 0xD5, 1)?;
        mm.set_layer_name(id, "Multiplexer VIA")?;
        mm.enable_layer(id, AccessMode::READ|AccessMode::WRITE, true)?;
        Ok(id)
    }

    fn register(addr: u16) -> Option<u8> {
        if addr & 0xFFF0 == CCTL_BASE { Some((addr & 15) as u8) } else { None }
    }
}

impl MemoryHandler for MultiplexerCctl {
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
    use super::protocol::*;
    use crate::via::ViaRegister;
    use atarusty_core::trace::TraceCollection;
    use std::io;

    const ORB: u8 = ViaRegister::Orb as u8;
    const ORA: u8 = ViaRegister::Ora as u8;
    const DDRB: u8 = ViaRegister::Ddrb as u8;
    const DDRA: u8 = ViaRegister::Ddra as u8;
    const PCR: u8 = ViaRegister::Pcr as u8;

    #[derive(Default)]
    struct Wire {
        inbox: Vec<NetEvent>,
        sent: Vec<(ConnId, Vec<u8>)>,
        closed: Vec<ConnId>,
    }

    #[derive(Clone, Default)]
    struct FakeTransport(Rc<RefCell<Wire>>);

    impl MuxTransport for FakeTransport {
        fn poll_events(&mut self) -> Vec<NetEvent> {
            core::mem::take(&mut self.0.borrow_mut().inbox)
        }

        fn send(&mut self, conn: ConnId, data: &[u8]) -> io::Result<()> {
            self.0.borrow_mut().sent.push((conn, data.to_vec()));
            Ok(())
        }

        fn close(&mut self, conn: ConnId) {
            self.0.borrow_mut().closed.push(conn);
        }
    }

    struct Rig {
        mux: Multiplexer,
        host: Scheduler,
        wire: FakeTransport,
    }

    impl Rig {
        fn new(device_id: Option<u8>) -> Rig {
            let mut mux = Multiplexer::new(OwnerId(3));
            let mut ps = PropertySet::new();
            ps.set_i32("device_id", device_id.map_or(-1, i32::from));
            mux.apply_settings(&ps);
            let wire = FakeTransport::default();
            mux.attach_transport(Box::new(wire.clone()));
            let mut host = Scheduler::new();
            host.advance(500);
            mux.init(&mut host);
            let mut rig = Rig { mux, host, wire };
            // PB3-PB5 outputs with PB5 high, CA2 pulses on port A accesses
            rig.write(ORB, 0x20);
            rig.write(DDRB, 0x38);
            rig.write(PCR, 0x0A);
            rig.write(DDRA, 0xFF);
            rig.write(ORA, 0x00);
            rig
        }

        fn run(&mut self, cycles: Ticks) {
            let Rig { mux, host, .. } = self;
            let limit = host.now() + cycles;
            host.run_until(limit, |s, ev| {
                assert!(mux.owns_event(ev.owner, ev.id));
                mux.on_host_event(s, ev.id)
            });
            mux.sync(host.now());
            mux.service(host);
        }

        fn write(&mut self, reg: u8, value: u8) {
            self.mux.write_byte_via(self.host.now(), reg, value);
            self.mux.service(&mut self.host);
        }

        fn read(&mut self, reg: u8) -> u8 {
            let value = self.mux.read_byte_via(self.host.now(), reg);
            self.mux.service(&mut self.host);
            value
        }

        fn deliver(&mut self, event: NetEvent) {
            self.wire.0.borrow_mut().inbox.push(event);
            self.run(1);
        }

        fn take_sent(&mut self) -> Vec<(ConnId, Vec<u8>)> {
            core::mem::take(&mut self.wire.0.borrow_mut().sent)
        }

        fn pb_input(&self) -> u8 {
            self.mux.debug_read_byte_via(ORB)
        }

        fn wait_for(&mut self, mask: u8, state: bool) {
            for _ in 0..5000 {
                if (self.pb_input() & mask != 0) == state {
                    return
                }
                self.run(1);
            }
            panic!("PB {:02x} never became {}: {}", mask, state, self.mux.dump_status());
        }
        /// Reads a byte offered by the device.
        fn atari_read(&mut self) -> u8 {
            self.wait_for(PB_IN_ACK, true);
            let value = self.read(ORA);
            self.run(4);
            value
        }
        /// Hands a byte to the device.
        fn atari_write(&mut self, value: u8) {
            self.run(10);
            self.write(ORA, value);
            self.run(4);
        }

        fn host(&self) -> &HostMachine {
            match &self.mux.role {
                Role::Host(host) => host,
                _ => panic!("not a host")
            }
        }

        fn client(&self) -> &ClientMachine {
            match &self.mux.role {
                Role::Client(client) => client,
                _ => panic!("not a client")
            }
        }
    }

    fn status_dcb() -> [u8; DCB_SIZE] {
        [0x31, 0x01, 0x53, 0x00, 0x00, 0x05, 0x0F, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
    }

    fn command(request_id: u8, device_bit: u8, dcb: [u8; DCB_SIZE], data: Vec<u8>) -> Vec<u8> {
        ClientMessage::Command(MuxCommand { request_id, device_bit, dcb, data }).encode()
    }
    /// Plays the host computer's side of a selection followed by the DCB transfer.
    fn serve_selection(rig: &mut Rig, device_bit: u8) -> Vec<u8> {
        rig.write(ORA, device_bit);
        rig.run(2);
        rig.wait_for(PB_IN_ACTIVE, true);
        rig.write(ORB, 0x00);
        rig.write(DDRA, 0x00);
        let dcb: Vec<u8> = (0..DCB_SIZE + 1).map(|_| rig.atari_read()).collect();
        rig.write(DDRA, 0xFF);
        dcb
    }

    #[test]
    fn settings_work() {
        let mut ps = PropertySet::new();
        ps.set_i32("device_id", 11);
        ps.set_u32("port", 80);
        ps.set_string("host_address", "retro.example");
        let settings = MultiplexerSettings::from_props(&ps);
        assert_eq!(settings.device_id, Some(3));
        assert_eq!(settings.port, MIN_PORT);
        assert_eq!(settings.blurb(), "client 3 to retro.example:1024");
        assert_eq!(MultiplexerSettings::from_props(&settings.to_props()), settings);
        let host = MultiplexerSettings::from_props(&PropertySet::new());
        assert_eq!(host, MultiplexerSettings::default());
        assert_eq!(host.connect_host(), "localhost");
        assert_eq!(host.blurb(), "host on port 6522");
        let mut ps = PropertySet::new();
        ps.set_u32("port", 65000);
        assert_eq!(MultiplexerSettings::from_props(&ps).port, MAX_PORT);
    }

    #[test]
    fn client_reports_connection_state() {
        let mut rig = Rig::new(Some(1));
        assert!(!rig.mux.is_host());
        assert_eq!(rig.mux.error_status().as_deref(), Some("Connecting to localhost:6522"));
        rig.deliver(NetEvent::Connected(ConnId(0)));
        assert_eq!(rig.mux.error_status(), None);
        // device switches
        assert_eq!(rig.pb_input() & 0x07, 1);
        rig.deliver(NetEvent::Closed(ConnId(0)));
        assert_eq!(rig.mux.error_status().as_deref(), Some("Connecting to localhost:6522"));
        assert!(!rig.client().is_connected());
    }

    #[test]
    fn command_preemption_works() {
        let mut rig = Rig::new(None);
        assert!(rig.mux.is_host());
        let (c1, c2) = (ConnId(1), ConnId(2));
        rig.run(20000);
        assert_eq!(rig.host().state, host::HostState::WaitForSelection);
        rig.deliver(NetEvent::Connected(c1));
        rig.deliver(NetEvent::Connected(c2));
        // an idle poll makes the host ready
        rig.write(ORA, 0x01);
        rig.run(4);
        rig.write(ORA, 0x00);
        let sent = rig.take_sent();
        assert!(sent.contains(&(c1, vec![0xA3])));
        assert!(sent.contains(&(c2, vec![0xA3])));
        assert!(!rig.host().busy);

        rig.deliver(NetEvent::Received(c1, command(1, 0x01, status_dcb(), Vec::new())));
        rig.run(4);
        assert_eq!(serve_selection(&mut rig, 0x01)[..DCB_SIZE], status_dcb());
        assert_eq!(rig.host().active, Some(c1));
        // other clients are told to hold off
        assert_eq!(rig.take_sent(), [(c2, vec![0xA4])]);
        assert_eq!(rig.host().reported_ready(c2), Some(false));

        // client 2 queues a command while client 1 is being served
        rig.deliver(NetEvent::Received(c2, command(7, 0x01, status_dcb(), Vec::new())));
        assert_eq!(rig.host().active, Some(c1));
        for byte in [b'C', 0x00, reply_checksum(b'C', 0x00)] {
            rig.atari_write(byte);
        }
        assert_eq!(rig.take_sent(), [(c1, HostMessage::Reply { request_id: 1, status: [b'C', 0] }.encode())]);
        assert_eq!(rig.host().active, None);

        // the next poll serves client 2
        rig.write(ORB, 0x20);
        rig.write(ORA, 0x00);
        rig.run(12000);
        assert_eq!(rig.host().state, host::HostState::WaitForSelection);
        let dcb = serve_selection(&mut rig, 0x01);
        assert_eq!(dcb[DCB_SIZE], frame_checksum(&status_dcb()));
        assert_eq!(rig.host().active, Some(c2));
    }

    #[test]
    fn resent_command_abandons_the_active_one() {
        let mut rig = Rig::new(None);
        let c1 = ConnId(1);
        rig.run(20000);
        rig.deliver(NetEvent::Connected(c1));
        rig.deliver(NetEvent::Received(c1, command(1, 0x01, status_dcb(), Vec::new())));
        serve_selection(&mut rig, 0x01);
        assert_eq!(rig.host().active, Some(c1));

        // the client gives up on the first command mid-transfer
        let mut second = status_dcb();
        second[10] = 0x07;
        rig.deliver(NetEvent::Received(c1, command(2, 0x01, second, Vec::new())));
        assert_eq!(rig.host().active, None);
        rig.write(ORB, 0x20);
        rig.write(ORA, 0x00);
        rig.run(12000);
        assert_eq!(rig.host().state, host::HostState::WaitForSelection);
        // the abandoned command is never answered
        assert!(rig.take_sent().is_empty());

        let dcb = serve_selection(&mut rig, 0x01);
        assert_eq!(dcb[..DCB_SIZE], second);
        assert_eq!(rig.host().active, Some(c1));
        for byte in [b'C', 0x00, reply_checksum(b'C', 0x00)] {
            rig.atari_write(byte);
        }
        assert_eq!(rig.take_sent(), [(c1, HostMessage::Reply { request_id: 2, status: [b'C', 0] }.encode())]);
        assert_eq!(rig.host().active, None);
    }

    #[test]
    fn read_command_returns_data() {
        let mut rig = Rig::new(None);
        let c1 = ConnId(1);
        rig.run(20000);
        rig.deliver(NetEvent::Connected(c1));
        let mut dcb = status_dcb();
        dcb[DCB_STATS] = DSTATS_READ;
        rig.deliver(NetEvent::Received(c1, command(4, 0x01, dcb, Vec::new())));
        serve_selection(&mut rig, 0x01);
        for byte in [b'A', 0x00, reply_checksum(b'A', 0x00)] {
            rig.atari_write(byte);
        }
        let data = [0x10, 0xFF, 0xE0, 0x00];
        for &byte in data.iter().chain(Some(&frame_checksum(&data))) {
            rig.atari_write(byte);
        }
        for byte in [b'C', 0x00, reply_checksum(b'C', 0x00)] {
            rig.atari_write(byte);
        }
        let expected = HostMessage::ReplyWithData { request_id: 4, status: [b'C', 0], data: data.to_vec() };
        assert_eq!(rig.take_sent(), [(c1, expected.encode())]);
    }

    #[test]
    fn bad_reply_checksum_times_out_client() {
        let mut rig = Rig::new(None);
        let c1 = ConnId(1);
        rig.run(20000);
        rig.deliver(NetEvent::Connected(c1));
        rig.deliver(NetEvent::Received(c1, command(9, 0x02, status_dcb(), Vec::new())));
        serve_selection(&mut rig, 0x02);
        for byte in [b'C', 0x00, 0x00] {
            rig.atari_write(byte);
        }
        rig.run(2);
        assert_eq!(rig.take_sent(), [(c1, HostMessage::ReplyTimeout { request_id: 9 }.encode())]);
        assert_eq!(rig.host().reported_ready(c1), Some(true));
    }

    #[test]
    fn invalid_device_drops_client() {
        let mut rig = Rig::new(None);
        rig.deliver(NetEvent::Connected(ConnId(5)));
        rig.deliver(NetEvent::Received(ConnId(5), vec![0xA0, 1, 0x03]));
        assert_eq!(rig.wire.0.borrow().closed, [ConnId(5)]);
        assert!(rig.host().connections.is_empty());
    }

    #[test]
    fn client_forwards_commands() {
        let mut rig = Rig::new(Some(0));
        let trace = TraceCollection::new_shared();
        rig.mux.set_trace(Some(trace.clone()));
        rig.deliver(NetEvent::Connected(ConnId(0)));
        rig.run(20000);
        assert_eq!(rig.client().state, client::ClientState::Busy);
        rig.deliver(NetEvent::Received(ConnId(0), HostMessage::Resume.encode()));
        assert!(rig.client().is_host_ready());
        // wait for the poll of the first device
        rig.write(DDRA, 0x00);
        for _ in 0..5000 {
            if rig.client().state == client::ClientState::ClientPoll2
               && rig.mux.debug_read_byte_via(ORA) == 0x01 {
                break
            }
            rig.run(1);
        }
        assert_eq!(rig.mux.debug_read_byte_via(ORA), 0x01);
        rig.write(ORB, 0x00);
        rig.run(2);
        assert_eq!(rig.client().state, client::ClientState::ReceiveDcbByteWait);
        rig.write(DDRA, 0xFF);
        let dcb = status_dcb();
        for &byte in dcb.iter().chain(Some(&frame_checksum(&dcb))) {
            rig.atari_write(byte);
        }
        rig.write(DDRA, 0x00);
        let reply: Vec<u8> = (0..3).map(|_| rig.atari_read()).collect();
        assert_eq!(reply, [0x01, 0x00, 0x81]);
        rig.run(2);
        assert_eq!(rig.take_sent(), [(ConnId(0), command(1, 0x01, dcb, Vec::new()))]);
        // a stale reply is dropped
        rig.deliver(NetEvent::Received(ConnId(0),
                    HostMessage::Reply { request_id: 0, status: [b'C', 0] }.encode()));
        assert_eq!(rig.client().state, client::ClientState::ExecuteWait);
        rig.deliver(NetEvent::Received(ConnId(0),
                    HostMessage::Reply { request_id: 1, status: [b'C', 0] }.encode()));
        let result: Vec<u8> = (0..3).map(|_| rig.atari_read()).collect();
        assert_eq!(result, [b'C', 0x00, reply_checksum(b'C', 0x00)]);
        rig.run(2000);
        assert_eq!(rig.client().state, client::ClientState::ClientPoll);
        let coll = trace.borrow();
        let ack = coll.find_channel("Multiplexer", "ACK").unwrap();
        assert!(coll.channel(ack).unwrap().events.len() >= 3);
        let data_in = coll.find_channel("Multiplexer", "Data In").unwrap();
        assert!(coll.channel(data_in).unwrap().events.iter().any(|e| e.label == "81"));
    }

    #[test]
    fn pause_stops_client_polling() {
        let mut rig = Rig::new(Some(2));
        rig.deliver(NetEvent::Connected(ConnId(0)));
        rig.deliver(NetEvent::Received(ConnId(0), HostMessage::Resume.encode()));
        rig.run(20000);
        assert_ne!(rig.client().state, client::ClientState::Busy);
        rig.deliver(NetEvent::Received(ConnId(0), HostMessage::Pause.encode()));
        rig.run(1000);
        assert_eq!(rig.client().state, client::ClientState::Busy);
        assert!(!rig.client().is_host_ready());
    }

    #[test]
    fn cctl_window_maps_via() {
        let mut host = Scheduler::new();
        let mut mux = Multiplexer::new(OwnerId(2));
        mux.attach_transport(Box::new(FakeTransport::default()));
        mux.init(&mut host);
        let mux = Rc::new(RefCell::new(mux));
        let mut mm = MemoryManager::new();
        MultiplexerCctl::new(mux.clone(), host.clock()).install(&mut mm).unwrap();
        host.advance(100);
        mm.write_byte(CCTL_BASE + DDRB as u16, 0x38);
        assert_eq!(mm.read_byte(CCTL_BASE + DDRB as u16), 0x38);
        assert_eq!(mm.debug_read_byte(CCTL_BASE + DDRB as u16), 0x38);
        assert_eq!(mm.read_byte(0xD500), 0xFF);
        mux.borrow_mut().shutdown(&mut host);
        assert!(!mux.borrow().is_inited());
        assert_eq!(mux.borrow_mut().read_byte_via(host.now(), DDRB), 0xFF);
    }
}
