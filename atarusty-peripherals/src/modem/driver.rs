/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The TCP modem driver.
//!
//! Each driver owns one worker thread which dials or answers a single connection and runs the
//! Telnet codec on it. The emulation thread exchanges data with the worker through buffers
//! guarded by a mutex and is told about changes by [ModemEvent]s.
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use super::telnet::{TelnetConfig, TelnetSession};

/// Capacity of the outgoing buffer in wire bytes.
pub const WRITE_BUFFER_SIZE: usize = 4096;
const READ_BUFFER_SIZE: usize = 4096;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the worker was doing when something happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModemPhase {
    Init,
    Listen,
    Accept,
    NameLookup,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModemStatus {
    AllocFail,
    GenericError,
    LineInUse,
    NoDialTone,
    NameLookupFailed,
    ConnectFailed,
    Connected,
    /// The remote closed the connection; buffered data may still be read.
    ConnectionClosing,
    /// The connection is gone and everything received was read.
    ConnectionDropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModemEvent {
    Status(ModemPhase, ModemStatus),
    /// New data is available for [TcpModemDriver::read].
    ReadAvailable(usize),
    /// The outgoing buffer was flushed.
    WriteAvailable,
}

/// Settings that may be changed while the driver runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModemConfig {
    pub telnet_emulation: bool,
    pub telnet_lf_conversion: bool,
    /// Also answer on IPv6.
    pub listen_ipv6: bool,
    pub terminal_type: String,
}

impl ModemConfig {
    pub fn telnet(&self) -> TelnetConfig {
        TelnetConfig {
            emulation: self.telnet_emulation,
            lf_conversion: self.telnet_lf_conversion,
            terminal_type: self.terminal_type.clone(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    telnet: TelnetSession,
    listen_ipv6: bool,
    read_buf: Vec<u8>,
    read_index: usize,
    write_buf: Vec<u8>,
    log_messages: Option<String>,
    incoming: Option<SocketAddr>,
}

impl Shared {
    fn read_drained(&self) -> bool {
        self.read_index >= self.read_buf.len()
    }

    fn log(&mut self, message: String) {
        info!("modem: {}", message);
        if let Some(log) = self.log_messages.as_mut() {
            log.push_str(&message);
            log.push('\n');
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|err| err.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Wake,
    Exit,
}

enum Wakeup {
    Command(Command),
    Net(NetData),
}

enum NetData {
    Data(Vec<u8>),
    Eof,
    Error(io::Error),
}

#[derive(Debug)]
enum Target {
    Dial { address: String, port: u16 },
    Listen { port: u16 },
}

/// A modem line carried over TCP, with optional Telnet negotiation.
#[derive(Debug)]
pub struct TcpModemDriver {
    shared: Arc<Mutex<Shared>>,
    commands: Sender<Command>,
    events: Receiver<ModemEvent>,
    worker: Option<JoinHandle<()>>,
}

impl TcpModemDriver {
    /// Starts the driver. An empty `address` answers incoming calls on `port`, otherwise
    /// the driver dials `address:port`.
    pub fn start(address: &str, port: u16, config: &ModemConfig, logging: bool) -> io::Result<Self> {
        let listening = address.is_empty();
        let mut telnet = TelnetSession::new(&config.telnet(), listening);
        telnet.set_logging(logging);
        let shared = Arc::new(Mutex::new(Shared {
            telnet,
            listen_ipv6: config.listen_ipv6,
            read_buf: Vec::with_capacity(READ_BUFFER_SIZE),
            read_index: 0,
            write_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            log_messages: if logging { Some(String::new()) } else { None },
            incoming: None,
        }));
        let target = if listening {
            Target::Listen { port }
        }
        else {
            Target::Dial { address: address.to_string(), port }
        };
        let (commands, commands_rx) = unbounded();
        let (events_tx, events) = unbounded();
        let worker = Worker { shared: shared.clone(), commands: commands_rx, events: events_tx };
        let worker = thread::Builder::new().name("modem-tcp".into()).spawn(move || {
            worker.run(target)
        })?;
        Ok(TcpModemDriver { shared, commands, events, worker: Some(worker) })
    }

    pub fn set_config(&self, config: &ModemConfig) {
        let mut shared = lock(&self.shared);
        shared.telnet.set_config(&config.telnet());
        shared.listen_ipv6 = config.listen_ipv6;
    }
    /// Drains the events that arrived since the previous call.
    pub fn poll_events(&self) -> Vec<ModemEvent> {
        self.events.try_iter().collect()
    }
    /// Blocks until an event arrives or `timeout` passes.
    pub fn wait_event(&self, timeout: Duration) -> Option<ModemEvent> {
        self.events.recv_timeout(timeout).ok()
    }
    /// Copies received data into `buf` and returns the number of bytes copied.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut shared = lock(&self.shared);
        let start = shared.read_index;
        let len = buf.len().min(shared.read_buf.len() - start);
        buf[..len].copy_from_slice(&shared.read_buf[start..start + len]);
        shared.read_index += len;
        let drained = len != 0 && shared.read_drained();
        drop(shared);
        if drained {
            let _ = self.commands.send(Command::Wake);
        }
        len
    }
    /// Queues `data` for sending and returns how many bytes were accepted.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut shared = lock(&self.shared);
        let Shared { telnet, write_buf, .. } = &mut *shared;
        let accepted = telnet.encode(data, write_buf, WRITE_BUFFER_SIZE);
        drop(shared);
        if accepted != 0 {
            let _ = self.commands.send(Command::Wake);
        }
        accepted
    }
    /// Returns the log collected since the previous call if logging was enabled.
    pub fn take_log_messages(&self) -> Option<String> {
        let mut shared = lock(&self.shared);
        match shared.log_messages.as_mut() {
            Some(log) if !log.is_empty() => Some(core::mem::take(log)),
            _ => None
        }
    }
    /// The address of the last accepted caller.
    pub fn last_incoming_address(&self) -> Option<SocketAddr> {
        lock(&self.shared).incoming
    }
    /// Hangs up and waits for the worker to finish.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(Command::Exit);
            if worker.join().is_err() {
                error!("modem: worker thread panicked");
            }
        }
    }
}

impl Drop for TcpModemDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    shared: Arc<Mutex<Shared>>,
    commands: Receiver<Command>,
    events: Sender<ModemEvent>,
}

impl Worker {
    fn notify(&self, event: ModemEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self, phase: ModemPhase, status: ModemStatus) {
        debug!("modem: {:?} {:?}", phase, status);
        self.notify(ModemEvent::Status(phase, status));
    }

    fn log(&self, message: String) {
        lock(&self.shared).log(message);
    }

    fn run(self, target: Target) {
        let stream = match target {
            Target::Dial { address, port } => self.dial(&address, port),
            Target::Listen { port } => self.answer(port),
        };
        if let Some(stream) = stream {
            self.serve(stream);
        }
    }

    fn dial(&self, address: &str, port: u16) -> Option<TcpStream> {
        self.log(format!("Looking up {}:{}", address, port));
        let addrs: Vec<SocketAddr> = match (address, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                self.log(format!("Name lookup failed: {}", err));
                Vec::new()
            }
        };
        if addrs.is_empty() {
            self.status(ModemPhase::NameLookup, ModemStatus::NameLookupFailed);
            return None
        }
        for addr in addrs {
            if self.exit_requested() {
                return None
            }
            self.log(format!("Connecting to {}", addr));
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Some(stream),
                Err(err) => self.log(format!("Connection to {} failed: {}", addr, err))
            }
        }
        self.status(ModemPhase::Connecting, ModemStatus::ConnectFailed);
        None
    }

    fn answer(&self, port: u16) -> Option<TcpStream> {
        let v4 = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => listener,
            Err(err) => {
                self.log(format!("Unable to listen on port {}: {}", port, err));
                let status = match err.kind() {
                    io::ErrorKind::AddrInUse => ModemStatus::LineInUse,
                    io::ErrorKind::AddrNotAvailable => ModemStatus::NoDialTone,
                    _ => ModemStatus::GenericError
                };
                self.status(ModemPhase::Listen, status);
                return None
            }
        };
        let mut listeners = vec![v4];
        if lock(&self.shared).listen_ipv6 {
            match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)) {
                Ok(listener) => listeners.push(listener),
                Err(err) => debug!("modem: no IPv6 listener: {}", err)
            }
        }
        for listener in listeners.iter() {
            if let Err(err) = listener.set_nonblocking(true) {
                self.log(format!("Unable to listen: {}", err));
                self.status(ModemPhase::Listen, ModemStatus::GenericError);
                return None
            }
        }
        self.log(format!("Waiting for a connection on port {}", port));
        loop {
            for listener in listeners.iter() {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let mut shared = lock(&self.shared);
                        shared.incoming = Some(peer);
                        shared.log(format!("Accepted connection from {}", peer));
                        return Some(stream)
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        self.log(format!("Accept failed: {}", err));
                        self.status(ModemPhase::Accept, ModemStatus::GenericError);
                        return None
                    }
                }
            }
            match self.commands.recv_timeout(ACCEPT_POLL_INTERVAL) {
                Ok(Command::Exit) => return None,
                Err(err) if err.is_disconnected() => return None,
                _ => {}
            }
        }
    }

    fn exit_requested(&self) -> bool {
        self.commands.try_iter().any(|cmd| cmd == Command::Exit)
    }

    fn serve(&self, mut stream: TcpStream) {
        let reader = match stream.set_nonblocking(false)
                           .and_then(|_| stream.set_nodelay(true))
                           .and_then(|_| stream.try_clone())
        {
            Ok(reader) => reader,
            Err(err) => {
                self.log(format!("Unable to use the connection: {}", err));
                self.status(ModemPhase::Connected, ModemStatus::GenericError);
                return
            }
        };
        let net_rx = match spawn_reader(reader) {
            Ok(rx) => rx,
            Err(err) => {
                self.log(format!("Unable to start the reader: {}", err));
                self.status(ModemPhase::Init, ModemStatus::AllocFail);
                return
            }
        };
        {
            let mut shared = lock(&self.shared);
            let Shared { telnet, write_buf, .. } = &mut *shared;
            telnet.on_connected();
            write_buf.splice(0..0, telnet.take_replies());
        }
        self.status(ModemPhase::Connected, ModemStatus::Connected);
        let idle: Receiver<NetData> = never();
        let mut eof = false;
        let mut connected = self.flush(&mut stream);
        loop {
            let read_drained = lock(&self.shared).read_drained();
            if eof && read_drained {
                self.status(ModemPhase::Connected, ModemStatus::ConnectionDropped);
                break
            }
            let net = if eof || !read_drained { &idle } else { &net_rx };
            let wakeup = select! {
                recv(self.commands) -> cmd => Wakeup::Command(cmd.unwrap_or(Command::Exit)),
                recv(net) -> data => Wakeup::Net(data.unwrap_or(NetData::Eof)),
            };
            match wakeup {
                Wakeup::Command(Command::Exit) => break,
                Wakeup::Command(Command::Wake) => {
                    if connected {
                        connected = self.flush(&mut stream);
                    }
                }
                Wakeup::Net(NetData::Data(data)) => {
                    self.receive(&data);
                    if connected {
                        connected = self.flush(&mut stream);
                    }
                }
                Wakeup::Net(NetData::Eof) => {
                    self.log("Connection closed by the remote".to_string());
                    self.status(ModemPhase::Connected, ModemStatus::ConnectionClosing);
                    eof = true;
                }
                Wakeup::Net(NetData::Error(err)) => {
                    self.log(format!("Receive failed: {}", err));
                    match err.kind() {
                        io::ErrorKind::ConnectionAborted|io::ErrorKind::ConnectionReset => {}
                        _ => self.status(ModemPhase::Connected, ModemStatus::GenericError)
                    }
                    eof = true;
                }
            }
            if !connected && !eof {
                self.status(ModemPhase::Connected, ModemStatus::ConnectionClosing);
                eof = true;
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn receive(&self, data: &[u8]) {
        let (bytes, logs) = {
            let mut shared = lock(&self.shared);
            let Shared { telnet, read_buf, write_buf, log_messages, .. } = &mut *shared;
            read_buf.clear();
            telnet.decode(data, read_buf);
            write_buf.extend(telnet.take_replies());
            let logs = match (telnet.take_log(), log_messages.as_mut()) {
                (Some(messages), Some(log)) => {
                    log.push_str(&messages);
                    true
                }
                _ => false
            };
            shared.read_index = 0;
            (shared.read_buf.len(), logs)
        };
        if bytes != 0 || logs {
            self.notify(ModemEvent::ReadAvailable(bytes));
        }
    }
    /// Returns `false` when the connection failed.
    fn flush(&self, stream: &mut TcpStream) -> bool {
        let pending = core::mem::take(&mut lock(&self.shared).write_buf);
        if pending.is_empty() {
            return true
        }
        match stream.write_all(&pending) {
            Ok(()) => {
                self.notify(ModemEvent::WriteAvailable);
                true
            }
            Err(err) => {
                self.log(format!("Send failed: {}", err));
                false
            }
        }
    }
}

fn spawn_reader(mut reader: TcpStream) -> io::Result<Receiver<NetData>> {
    let (tx, rx) = bounded(1);
    thread::Builder::new().name("modem-tcp-reader".into()).spawn(move || {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let message = match reader.read(&mut buf) {
                Ok(0) => NetData::Eof,
                Ok(n) => NetData::Data(buf[..n].to_vec()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => NetData::Error(err)
            };
            let done = !matches!(message, NetData::Data(..));
            if tx.send(message).is_err() || done {
                break
            }
        }
    })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn telnet_config() -> ModemConfig {
        ModemConfig {
            telnet_emulation: true,
            telnet_lf_conversion: false,
            listen_ipv6: false,
            terminal_type: "vt100".into(),
        }
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn wait_for(driver: &TcpModemDriver, expected: ModemEvent) -> Vec<ModemEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Some(event) = driver.wait_event(Duration::from_millis(50)) {
                seen.push(event);
                if event == expected {
                    return seen
                }
            }
        }
        panic!("timed out waiting for {:?}, seen: {:?}", expected, seen);
    }

    fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = vec![0; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn connect_with_retry(port: u16) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return stream,
                Err(err) if Instant::now() > deadline => panic!("can't connect: {}", err),
                Err(_) => thread::sleep(Duration::from_millis(10))
            }
        }
    }

    #[test]
    fn answering_modem_negotiates_and_exchanges_data() {
        let port = free_port();
        let driver = TcpModemDriver::start("", port, &telnet_config(), true).unwrap();
        let mut remote = connect_with_retry(port);
        wait_for(&driver, ModemEvent::Status(ModemPhase::Connected, ModemStatus::Connected));
        assert_eq!(read_exact(&mut remote, 9), [0xFF, 0xFB, 1, 0xFF, 0xFD, 3, 0xFF, 0xFD, 34]);
        assert_eq!(driver.last_incoming_address().unwrap().ip(), remote.local_addr().unwrap().ip());

        assert_eq!(driver.write(b"HI\r"), 3);
        wait_for(&driver, ModemEvent::WriteAvailable);
        assert_eq!(read_exact(&mut remote, 4), b"HI\r\0");

        remote.write_all(&[0xFF, 0xFD, 1, 0xFF, 0xFB, 3, b'o', b'k', 0xFF, 0xFF]).unwrap();
        wait_for(&driver, ModemEvent::ReadAvailable(3));
        let mut buf = [0; 8];
        assert_eq!(driver.read(&mut buf[..2]), 2);
        assert_eq!(driver.read(&mut buf[2..]), 1);
        assert_eq!(&buf[..3], b"ok\xFF");
        assert_eq!(driver.read(&mut buf), 0);
        let log = driver.take_log_messages().unwrap();
        assert!(log.contains("Accepted connection"));
        assert!(log.contains("received DO ECHO"));

        drop(remote);
        wait_for(&driver, ModemEvent::Status(ModemPhase::Connected, ModemStatus::ConnectionDropped));
    }

    #[test]
    fn dialing_modem_holds_the_line_until_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = telnet_config();
        config.telnet_emulation = false;
        let driver = TcpModemDriver::start("127.0.0.1", port, &config, false).unwrap();
        let (mut remote, _) = listener.accept().unwrap();
        wait_for(&driver, ModemEvent::Status(ModemPhase::Connected, ModemStatus::Connected));
        remote.write_all(&[0xFF, 0x0D, 0x00]).unwrap();
        wait_for(&driver, ModemEvent::ReadAvailable(3));
        drop(remote);
        // the line stays up until everything was read
        thread::sleep(Duration::from_millis(100));
        assert!(driver.poll_events().is_empty());
        let mut buf = [0; 4];
        assert_eq!(driver.read(&mut buf), 3);
        assert_eq!(buf[..3], [0xFF, 0x0D, 0x00]);
        let events = wait_for(&driver,
                              ModemEvent::Status(ModemPhase::Connected, ModemStatus::ConnectionDropped));
        assert!(events.contains(&ModemEvent::Status(ModemPhase::Connected, ModemStatus::ConnectionClosing)));
        assert_eq!(driver.take_log_messages(), None);
    }

    #[test]
    fn failures_are_reported() {
        let port = free_port();
        let driver = TcpModemDriver::start("127.0.0.1", port, &telnet_config(), false).unwrap();
        wait_for(&driver, ModemEvent::Status(ModemPhase::Connecting, ModemStatus::ConnectFailed));

        let busy = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = busy.local_addr().unwrap().port();
        let driver = TcpModemDriver::start("", port, &telnet_config(), false).unwrap();
        wait_for(&driver, ModemEvent::Status(ModemPhase::Listen, ModemStatus::LineInUse));
    }

    #[test]
    fn shutdown_stops_listening() {
        let port = free_port();
        let mut driver = TcpModemDriver::start("", port, &telnet_config(), false).unwrap();
        thread::sleep(Duration::from_millis(50));
        driver.shutdown();
        assert!(driver.poll_events().is_empty());
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).unwrap();
    }
}
