/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The TCP protocol between networked custom devices and their back-end server.
//!
//! The device posts fixed-size command frames. While it waits for a return value the server
//! may issue any number of requests, e.g. to remap memory layers or access segments. The server
//! may also push requests on its own, which the device picks up when [NetClient::poll_readable]
//! reports pending data.
use core::convert::TryFrom;
use core::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

/// The lowest port a configuration may use.
pub const MIN_PORT: u32 = 1024;
/// The highest port a configuration may use.
pub const MAX_PORT: u32 = 49150;
/// The size of a command frame.
pub const FRAME_SIZE: usize = 17;
/// The value of a cold reset command sent after reconnecting, telling servers that understand
/// it to reinitialize.
pub const RECONNECT_RESET: i32 = 0x7F00_0001;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetCommand {
    None = 0,
    DebugReadByte = 1,
    ReadByte = 2,
    WriteByte = 3,
    ColdReset = 4,
    WarmReset = 5,
    /// Followed by `value` bytes of a message.
    Error = 6,
    ScriptEventSend = 7,
    ScriptEventPost = 8,
    Init = 9,
}

/// A command frame: the command, two arguments and the current cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetFrame {
    pub command: NetCommand,
    pub address: u32,
    pub value: i32,
    pub tick: u64,
}

impl NetFrame {
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = self.command as u8;
        buf[1..5].copy_from_slice(&self.address.to_le_bytes());
        buf[5..9].copy_from_slice(&self.value.to_le_bytes());
        buf[9..17].copy_from_slice(&self.tick.to_le_bytes());
        buf
    }
}

/// Requests of the server, without their variable-length payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetReply {
    None,
    /// Ends the command the device waits on.
    ReturnValue(i32),
    /// Bit 0 enables writes, bit 1 reads.
    EnableMemoryLayer { layer: u8, flags: u8 },
    SetMemoryLayerOffset { layer: u8, offset: u32 },
    SetMemoryLayerSegmentOffset { layer: u8, segment: u8, offset: u32 },
    SetMemoryLayerReadOnly { layer: u8, read_only: bool },
    /// The device answers with `len` bytes.
    ReadSegmentMemory { segment: u8, offset: u32, len: u32 },
    /// Followed by `len` bytes, which the device reads only if the range is valid.
    WriteSegmentMemory { segment: u8, offset: u32, len: u32 },
    CopySegmentMemory { dst: u8, dst_offset: u32, src: u8, src_offset: u32, len: u32 },
    ScriptInterrupt { aux1: u32, aux2: u32 },
    GetSegmentNames,
    GetMemoryLayerNames,
    SetProtocolLevel(u8),
    FillSegmentMemory { segment: u8, offset: u32, value: u8, len: u32 },
}

#[non_exhaustive]
#[derive(Debug)]
pub enum NetError {
    /// There is no connection to the server.
    NotConnected,
    Io(io::Error),
    /// The server sent a request with an unknown tag.
    InvalidCommand(u8),
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::Io(err) => Some(err),
            _ => None
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::NotConnected => write!(f, "Not connected"),
            NetError::Io(err) => write!(f, "{}", err),
            NetError::InvalidCommand(_) => write!(f, "Invalid command received"),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        NetError::Io(err)
    }
}

impl From<NetError> for io::Error {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Io(err) => err,
            NetError::NotConnected => io::Error::new(io::ErrorKind::NotConnected, err),
            err => io::Error::new(io::ErrorKind::InvalidData, err)
        }
    }
}

impl NetReply {
    /// The size of the fixed part following the tag.
    pub fn header_len(tag: u8) -> usize {
        match tag {
            1 => 4,
            2 => 2,
            3 => 5,
            4 => 6,
            5 => 2,
            6|7|13 => 9,
            8 => 14,
            9 => 8,
            12 => 1,
            _ => 0
        }
    }
    /// Decodes a request from its tag and fixed part.
    pub fn decode(tag: u8, b: &[u8]) -> Result<Self, NetError> {
        let u32_at = |i: usize| b.get(i..i + 4)
                                 .and_then(|s| <[u8; 4]>::try_from(s).ok())
                                 .map_or(0, u32::from_le_bytes);
        let u8_at = |i: usize| b.get(i).copied().unwrap_or(0);
        Ok(match tag {
            0 => NetReply::None,
            1 => NetReply::ReturnValue(u32_at(0) as i32),
            2 => NetReply::EnableMemoryLayer { layer: u8_at(0), flags: u8_at(1) },
            3 => NetReply::SetMemoryLayerOffset { layer: u8_at(0), offset: u32_at(1) },
            4 => NetReply::SetMemoryLayerSegmentOffset { layer: u8_at(0), segment: u8_at(1), offset: u32_at(2) },
            5 => NetReply::SetMemoryLayerReadOnly { layer: u8_at(0), read_only: u8_at(1) != 0 },
            6 => NetReply::ReadSegmentMemory { segment: u8_at(0), offset: u32_at(1), len: u32_at(5) },
            7 => NetReply::WriteSegmentMemory { segment: u8_at(0), offset: u32_at(1), len: u32_at(5) },
            8 => NetReply::CopySegmentMemory {
                dst: u8_at(0), dst_offset: u32_at(1), src: u8_at(5), src_offset: u32_at(6), len: u32_at(10)
            },
            9 => NetReply::ScriptInterrupt { aux1: u32_at(0), aux2: u32_at(4) },
            10 => NetReply::GetSegmentNames,
            11 => NetReply::GetMemoryLayerNames,
            12 => NetReply::SetProtocolLevel(u8_at(0)),
            13 => NetReply::FillSegmentMemory { segment: u8_at(0), offset: u32_at(1), value: u8_at(5), len: u32_at(6) },
            tag => return Err(NetError::InvalidCommand(tag))
        })
    }
}

/// Encodes a list of names as a count followed by length-prefixed strings.
pub fn encode_names<'a, I: ExactSizeIterator<Item=&'a str>>(names: I) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(names.len() as u32).to_le_bytes());
    for name in names {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    out
}

/// A blocking connection to a device server on the local host.
pub struct NetClient {
    port: u16,
    stream: Option<TcpStream>,
}

impl fmt::Debug for NetClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetClient")
         .field("port", &self.port)
         .field("connected", &self.stream.is_some())
         .finish()
    }
}

impl NetClient {
    /// Creates a client and makes the first connection attempt.
    pub fn new(port: u16) -> Self {
        let mut client = NetClient { port, stream: None };
        if let Err(err) = client.connect() {
            warn!("custom device: can't connect to port {}: {}", port, err);
        }
        client
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&mut self) -> io::Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        debug!("custom device: connected to {}", addr);
        self.stream = Some(stream);
        Ok(())
    }
    /// Drops the connection and opens a new one.
    pub fn restore(&mut self) -> bool {
        self.stream = None;
        match self.connect() {
            Ok(()) => true,
            Err(err) => {
                debug!("custom device: reconnecting failed: {}", err);
                false
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }
    /// Sends everything or drops the connection.
    pub fn send(&mut self, data: &[u8]) -> bool {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return false
        };
        match stream.write_all(data) {
            Ok(()) => true,
            Err(err) => {
                debug!("custom device: send failed: {}", err);
                self.stream = None;
                false
            }
        }
    }
    fn try_recv_exact(&mut self, buf: &mut [u8]) -> Result<(), NetError> {
        let stream = self.stream.as_mut().ok_or(NetError::NotConnected)?;
        if let Err(err) = stream.read_exact(buf) {
            self.stream = None;
            return Err(err.into())
        }
        Ok(())
    }
    /// Fills `buf` or drops the connection.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> bool {
        match self.try_recv_exact(buf) {
            Ok(()) => true,
            Err(err) => {
                debug!("custom device: receive failed: {}", err);
                false
            }
        }
    }

    pub fn post(&mut self, frame: &NetFrame) -> bool {
        self.send(&frame.encode())
    }
    /// Reads the next server request.
    ///
    /// An unknown request leaves the stream unsynchronized, the caller should give up on it.
    pub fn recv_reply(&mut self) -> Result<NetReply, NetError> {
        let mut tag = [0u8];
        self.try_recv_exact(&mut tag)?;
        let mut header = [0u8; 16];
        let header = &mut header[..NetReply::header_len(tag[0])];
        self.try_recv_exact(header)?;
        NetReply::decode(tag[0], header)
    }
    /// Returns `true` if the server has sent something, or closed the connection.
    pub fn poll_readable(&mut self) -> bool {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return false
        };
        if stream.set_nonblocking(true).is_err() {
            return false
        }
        let mut peeked = [0u8];
        let ready = match stream.peek(&mut peeked) {
            Ok(_) => true,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true
        };
        if stream.set_nonblocking(false).is_err() {
            self.stream = None;
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn frames_encode() {
        let frame = NetFrame { command: NetCommand::WriteByte, address: 0xD5C0, value: -2, tick: 0x0102_0304_0506 };
        let buf = frame.encode();
        assert_eq!(buf[0], 3);
        assert_eq!(&buf[1..5], &[0xC0, 0xD5, 0, 0]);
        assert_eq!(&buf[5..9], &[0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&buf[9..17], &[6, 5, 4, 3, 2, 1, 0, 0]);
    }

    #[test]
    fn replies_decode() {
        assert_eq!(NetReply::decode(1, &[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(), NetReply::ReturnValue(i32::MAX));
        assert_eq!(NetReply::decode(4, &[1, 2, 0, 1, 0, 0]).unwrap(),
                   NetReply::SetMemoryLayerSegmentOffset { layer: 1, segment: 2, offset: 0x100 });
        assert_eq!(NetReply::decode(8, &[1, 0x10, 0, 0, 0, 2, 0x20, 0, 0, 0, 5, 0, 0, 0]).unwrap(),
                   NetReply::CopySegmentMemory { dst: 1, dst_offset: 0x10, src: 2, src_offset: 0x20, len: 5 });
        assert_eq!(NetReply::decode(13, &[0, 4, 0, 0, 0, 0xAA, 3, 0, 0, 0]).unwrap(),
                   NetReply::FillSegmentMemory { segment: 0, offset: 4, value: 0xAA, len: 3 });
        let err = NetReply::decode(42, &[]).unwrap_err();
        assert!(matches!(err, NetError::InvalidCommand(42)));
        assert_eq!(err.to_string(), "Invalid command received");
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::InvalidData);
        for tag in 0..=13 {
            assert!(NetReply::header_len(tag) <= 16);
        }
        assert_eq!(encode_names(["ab", ""].iter().copied()), [2, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0, 0, 0, 0]);
    }

    #[test]
    fn client_talks_to_server() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut frame = [0u8; FRAME_SIZE];
            conn.read_exact(&mut frame).unwrap();
            assert_eq!(frame[0], NetCommand::ReadByte as u8);
            conn.write_all(&[12, 2]).unwrap();
            conn.write_all(&[1, 0x42, 0, 0, 0]).unwrap();
        });
        let mut client = NetClient::new(port);
        assert!(client.is_connected());
        assert!(client.post(&NetFrame { command: NetCommand::ReadByte, address: 0xD500, value: 0, tick: 1 }));
        assert_eq!(client.recv_reply().unwrap(), NetReply::SetProtocolLevel(2));
        assert_eq!(client.recv_reply().unwrap(), NetReply::ReturnValue(0x42));
        server.join().unwrap();
        // the server closed its end
        assert!(client.poll_readable());
        assert!(matches!(client.recv_reply(), Err(NetError::Io(_))));
        assert!(!client.is_connected());
        assert!(matches!(client.recv_reply(), Err(NetError::NotConnected)));
    }
}
