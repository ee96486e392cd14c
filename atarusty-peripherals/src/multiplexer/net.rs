/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! TCP transport of the multiplexer.
//!
//! Sockets are serviced by worker threads which forward everything they receive through a
//! channel. The emulation thread picks the events up with [MuxTransport::poll_events].
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_BUFFER_SIZE: usize = 1024;

/// Identifies a single connection of a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetEvent {
    /// A connection was accepted or established.
    Connected(ConnId),
    Received(ConnId, Vec<u8>),
    Closed(ConnId),
    /// An outgoing connection attempt failed.
    ConnectFailed,
}

/// The network seam of the multiplexer.
pub trait MuxTransport {
    /// Drains the events that arrived since the previous call.
    fn poll_events(&mut self) -> Vec<NetEvent>;
    fn send(&mut self, conn: ConnId, data: &[u8]) -> io::Result<()>;
    fn close(&mut self, conn: ConnId);
}

enum Incoming {
    Opened(ConnId, TcpStream),
    Data(ConnId, Vec<u8>),
    Closed(ConnId),
    ConnectFailed,
}

/// A transport on top of `std::net`.
pub struct TcpTransport {
    rx: Receiver<Incoming>,
    streams: HashMap<ConnId, TcpStream>,
    stop: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Listens for clients on `addr`.
    pub fn listen(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        thread::Builder::new().name("mux-listener".into()).spawn(move || {
            let mut next_id = 1;
            while !stop_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("multiplexer: accepted connection from {}", peer);
                        let id = ConnId(next_id);
                        next_id += 1;
                        if let Err(err) = start_reader(id, stream, &tx) {
                            warn!("multiplexer: can't service connection: {}", err);
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(err) => {
                        error!("multiplexer: accept failed: {}", err);
                        break
                    }
                }
            }
        })?;
        Ok(TcpTransport { rx, streams: HashMap::new(), stop })
    }
    /// Starts connecting to `host:port` in the background. The outcome is reported as
    /// [NetEvent::Connected] or [NetEvent::ConnectFailed].
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let target = format!("{}:{}", host, port);
        thread::Builder::new().name("mux-connect".into()).spawn(move || {
            let addrs: Vec<SocketAddr> = match target.to_socket_addrs() {
                Ok(addrs) => addrs.collect(),
                Err(err) => {
                    warn!("multiplexer: can't resolve {}: {}", target, err);
                    Vec::new()
                }
            };
            let stream = addrs.iter().find_map(|addr| {
                TcpStream::connect_timeout(addr, CONNECT_TIMEOUT)
                .map_err(|err| debug!("multiplexer: connecting to {} failed: {}", addr, err))
                .ok()
            });
            match stream {
                Some(stream) => {
                    if let Err(err) = start_reader(ConnId(0), stream, &tx) {
                        warn!("multiplexer: can't service connection: {}", err);
                        let _ = tx.send(Incoming::ConnectFailed);
                    }
                }
                None => {
                    let _ = tx.send(Incoming::ConnectFailed);
                }
            }
        })?;
        Ok(TcpTransport { rx, streams: HashMap::new(), stop })
    }
}

fn start_reader(id: ConnId, stream: TcpStream, tx: &Sender<Incoming>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = stream.try_clone()?;
    // the stream must be registered before any of its data arrives
    let _ = tx.send(Incoming::Opened(id, stream));
    let tx_reader = tx.clone();
    thread::Builder::new().name(format!("mux-conn-{}", id.0)).spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx_reader.send(Incoming::Data(id, buf[..n].to_vec())).is_err() {
                        break
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("multiplexer: connection {} read error: {}", id.0, err);
                    break
                }
            }
        }
        let _ = tx_reader.send(Incoming::Closed(id));
    })?;
    Ok(())
}

impl MuxTransport for TcpTransport {
    fn poll_events(&mut self) -> Vec<NetEvent> {
        let mut events = Vec::new();
        for incoming in self.rx.try_iter() {
            events.push(match incoming {
                Incoming::Opened(id, stream) => {
                    self.streams.insert(id, stream);
                    NetEvent::Connected(id)
                }
                Incoming::Data(id, data) => {
                    if !self.streams.contains_key(&id) {
                        continue
                    }
                    NetEvent::Received(id, data)
                }
                Incoming::Closed(id) => {
                    if self.streams.remove(&id).is_none() {
                        continue
                    }
                    NetEvent::Closed(id)
                }
                Incoming::ConnectFailed => NetEvent::ConnectFailed
            });
        }
        events
    }

    fn send(&mut self, conn: ConnId, data: &[u8]) -> io::Result<()> {
        match self.streams.get_mut(&conn) {
            Some(stream) => stream.write_all(data),
            None => Err(io::ErrorKind::NotConnected.into())
        }
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(stream) = self.streams.remove(&conn) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for (_, stream) in self.streams.drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
