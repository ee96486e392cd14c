/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Messages exchanged between multiplexer hosts and clients over TCP.
//!
//! Every message starts with a tag byte followed by a payload whose length is implied by the
//! tag and, for messages carrying a data frame, by a length byte or the DCB.
use core::fmt;
use std::io;

/// The size of a device control block.
pub const DCB_SIZE: usize = 13;
/// The longest data frame a single command may carry.
pub const MAX_FRAME: usize = 256;

const TAG_HOST_REPLY: u8 = 0xA0;
const TAG_HOST_REPLY_WITH_DATA: u8 = 0xA1;
const TAG_HOST_REPLY_TIMEOUT: u8 = 0xA2;
const TAG_HOST_RESUME: u8 = 0xA3;
const TAG_HOST_PAUSE: u8 = 0xA4;

const TAG_CLIENT_COMMAND: u8 = 0xA0;
const TAG_CLIENT_CANCEL: u8 = 0xA1;

/// DCB offset of the direction flags.
pub const DCB_STATS: usize = 3;
/// DCB offset of the low byte of the transfer length.
pub const DCB_BYTE_LO: usize = 8;
/// Direction flag: the computer sends a data frame.
pub const DSTATS_WRITE: u8 = 0x80;
/// Direction flag: the device returns a data frame.
pub const DSTATS_READ: u8 = 0x40;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message tag is not known.
    InvalidTag(u8),
    /// A command addresses anything else than exactly one device.
    InvalidDevice(u8),
}

impl std::error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidTag(tag) => write!(f, "invalid message tag: {:02x}", tag),
            ProtocolError::InvalidDevice(id) => write!(f, "invalid device selector: {:02x}", id),
        }
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// The checksum of a 2 byte status reply.
#[inline]
pub fn reply_checksum(s1: u8, s2: u8) -> u8 {
    s1.wrapping_add(s2).wrapping_add(0x80)
}

/// The checksum of a data frame or a DCB.
pub fn frame_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0x55u8, |acc, &b| acc.wrapping_add(b))
}

/// Decodes a transfer length byte, where 0 stands for a full frame.
#[inline]
pub fn frame_len(len: u8) -> usize {
    if len == 0 { MAX_FRAME } else { len as usize }
}

/// A command forwarded from a client to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxCommand {
    pub request_id: u8,
    /// The device selector bit, exactly one of bits 0-7.
    pub device_bit: u8,
    pub dcb: [u8; DCB_SIZE],
    /// The data frame of a write command.
    pub data: Vec<u8>,
}

impl MuxCommand {
    pub fn is_write(&self) -> bool {
        self.dcb[DCB_STATS] & DSTATS_WRITE != 0
    }

    pub fn is_read(&self) -> bool {
        self.dcb[DCB_STATS] & DSTATS_READ != 0
    }
    /// The length of the data frame, 1 to 256.
    pub fn frame_len(&self) -> usize {
        frame_len(self.dcb[DCB_BYTE_LO])
    }
}

/// Messages sent by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostMessage {
    Reply { request_id: u8, status: [u8; 2] },
    ReplyWithData { request_id: u8, status: [u8; 2], data: Vec<u8> },
    ReplyTimeout { request_id: u8 },
    Resume,
    Pause,
}

impl HostMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HostMessage::Reply { request_id, status } => {
                vec![TAG_HOST_REPLY, *request_id, status[0], status[1]]
            }
            HostMessage::ReplyWithData { request_id, status, data } => {
                let mut out = Vec::with_capacity(5 + data.len());
                out.extend_from_slice(&[TAG_HOST_REPLY_WITH_DATA, *request_id, status[0], status[1],
                                        data.len() as u8]);
                out.extend_from_slice(data);
                out
            }
            HostMessage::ReplyTimeout { request_id } => vec![TAG_HOST_REPLY_TIMEOUT, *request_id],
            HostMessage::Resume => vec![TAG_HOST_RESUME],
            HostMessage::Pause => vec![TAG_HOST_PAUSE],
        }
    }

    pub fn request_id(&self) -> Option<u8> {
        match self {
            HostMessage::Reply { request_id, .. }|
            HostMessage::ReplyWithData { request_id, .. }|
            HostMessage::ReplyTimeout { request_id } => Some(*request_id),
            _ => None
        }
    }

    fn expected_len(buf: &[u8]) -> Result<usize, ProtocolError> {
        Ok(match buf[0] {
            TAG_HOST_REPLY => 4,
            TAG_HOST_REPLY_WITH_DATA if buf.len() < 5 => 5,
            TAG_HOST_REPLY_WITH_DATA => 5 + frame_len(buf[4]),
            TAG_HOST_REPLY_TIMEOUT => 2,
            TAG_HOST_RESUME|TAG_HOST_PAUSE => 1,
            tag => return Err(ProtocolError::InvalidTag(tag))
        })
    }

    fn parse(buf: &[u8]) -> HostMessage {
        match buf[0] {
            TAG_HOST_REPLY => HostMessage::Reply { request_id: buf[1], status: [buf[2], buf[3]] },
            TAG_HOST_REPLY_WITH_DATA => HostMessage::ReplyWithData {
                request_id: buf[1], status: [buf[2], buf[3]], data: buf[5..].to_vec()
            },
            TAG_HOST_REPLY_TIMEOUT => HostMessage::ReplyTimeout { request_id: buf[1] },
            TAG_HOST_RESUME => HostMessage::Resume,
            _ => HostMessage::Pause
        }
    }
}

/// Messages sent by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    Command(MuxCommand),
    Cancel { request_id: u8 },
}

impl ClientMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::Command(cmd) => {
                let mut out = Vec::with_capacity(3 + DCB_SIZE + cmd.data.len());
                out.extend_from_slice(&[TAG_CLIENT_COMMAND, cmd.request_id, cmd.device_bit]);
                out.extend_from_slice(&cmd.dcb);
                if cmd.is_write() {
                    let len = cmd.frame_len();
                    out.extend_from_slice(&cmd.data[..len.min(cmd.data.len())]);
                    out.resize(3 + DCB_SIZE + len, 0);
                }
                out
            }
            ClientMessage::Cancel { request_id } => vec![TAG_CLIENT_CANCEL, *request_id],
        }
    }

    fn expected_len(buf: &[u8]) -> Result<usize, ProtocolError> {
        const HEAD: usize = 3 + DCB_SIZE;
        Ok(match buf[0] {
            TAG_CLIENT_COMMAND => {
                if let Some(&bit) = buf.get(2) {
                    if !bit.is_power_of_two() {
                        return Err(ProtocolError::InvalidDevice(bit))
                    }
                }
                if buf.len() < HEAD {
                    HEAD
                }
                else if buf[3 + DCB_STATS] & DSTATS_WRITE != 0 {
                    HEAD + frame_len(buf[3 + DCB_BYTE_LO])
                }
                else {
                    HEAD
                }
            }
            TAG_CLIENT_CANCEL => 2,
            tag => return Err(ProtocolError::InvalidTag(tag))
        })
    }

    fn parse(buf: &[u8]) -> ClientMessage {
        match buf[0] {
            TAG_CLIENT_COMMAND => {
                let mut dcb = [0u8; DCB_SIZE];
                dcb.copy_from_slice(&buf[3..3 + DCB_SIZE]);
                ClientMessage::Command(MuxCommand {
                    request_id: buf[1],
                    device_bit: buf[2],
                    dcb,
                    data: buf[3 + DCB_SIZE..].to_vec()
                })
            }
            _ => ClientMessage::Cancel { request_id: buf[1] }
        }
    }
}

/// Reassembles messages from a byte stream.
pub struct Decoder<M> {
    buf: Vec<u8>,
    expected: fn(&[u8]) -> Result<usize, ProtocolError>,
    parse: fn(&[u8]) -> M,
}

/// Decodes messages received by a client.
pub type HostMessageDecoder = Decoder<HostMessage>;
/// Decodes messages received by the host.
pub type ClientMessageDecoder = Decoder<ClientMessage>;

impl Default for Decoder<HostMessage> {
    fn default() -> Self {
        Decoder { buf: Vec::new(), expected: HostMessage::expected_len, parse: HostMessage::parse }
    }
}

impl Default for Decoder<ClientMessage> {
    fn default() -> Self {
        Decoder { buf: Vec::new(), expected: ClientMessage::expected_len, parse: ClientMessage::parse }
    }
}

impl<M> fmt::Debug for Decoder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder").field("buf", &self.buf).finish()
    }
}

impl<M> Decoder<M> {
    /// Feeds received bytes, returning every message completed by them.
    ///
    /// After an error the stream can not be resynchronized and the connection should be dropped.
    pub fn push(&mut self, mut data: &[u8]) -> Result<Vec<M>, ProtocolError> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let need = if self.buf.is_empty() { 1 } else { (self.expected)(&self.buf)? };
            let take = need.saturating_sub(self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if (self.expected)(&self.buf)? == self.buf.len() {
                out.push((self.parse)(&self.buf));
                self.buf.clear();
            }
        }
        Ok(out)
    }

    pub fn is_idle(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dcb(len: u8) -> [u8; DCB_SIZE] {
        let mut dcb = [0u8; DCB_SIZE];
        dcb[0] = 0x31;
        dcb[2] = 0x57;
        dcb[DCB_STATS] = DSTATS_WRITE;
        dcb[DCB_BYTE_LO] = len;
        dcb
    }

    #[test]
    fn checksums_work() {
        assert_eq!(reply_checksum(0x01, 0x00), 0x81);
        assert_eq!(reply_checksum(0x43, 0x00), 0xC3);
        assert_eq!(frame_checksum(&[]), 0x55);
        assert_eq!(frame_checksum(&[0xAB, 0x01]), 0x01);
    }

    #[test]
    fn host_messages_decode_across_chunks() {
        let mut wire = HostMessage::Reply { request_id: 1, status: [b'C', 0] }.encode();
        assert_eq!(wire, [0xA0, 1, 0x43, 0]);
        wire.extend(HostMessage::Pause.encode());
        wire.extend(HostMessage::ReplyWithData { request_id: 2, status: [b'C', 0], data: vec![7; 4] }
                    .encode());
        wire.extend(HostMessage::ReplyTimeout { request_id: 3 }.encode());
        let mut dec = HostMessageDecoder::default();
        let mut msgs = Vec::new();
        for chunk in wire.chunks(3) {
            msgs.extend(dec.push(chunk).unwrap());
        }
        assert!(dec.is_idle());
        assert_eq!(msgs, [
            HostMessage::Reply { request_id: 1, status: [b'C', 0] },
            HostMessage::Pause,
            HostMessage::ReplyWithData { request_id: 2, status: [b'C', 0], data: vec![7; 4] },
            HostMessage::ReplyTimeout { request_id: 3 },
        ]);
        assert_eq!(msgs[3].request_id(), Some(3));
        assert_eq!(msgs[1].request_id(), None);
    }

    #[test]
    fn full_frame_length_is_zero_on_wire() {
        let msg = HostMessage::ReplyWithData { request_id: 9, status: [b'C', 0], data: vec![1; 256] };
        let wire = msg.encode();
        assert_eq!(wire[4], 0);
        assert_eq!(wire.len(), 5 + 256);
        let mut dec = HostMessageDecoder::default();
        assert_eq!(dec.push(&wire).unwrap(), [msg]);
    }

    #[test]
    fn client_commands_carry_write_frames() {
        let cmd = MuxCommand { request_id: 5, device_bit: 0x04, dcb: write_dcb(4), data: vec![1, 2, 3, 4] };
        assert!(cmd.is_write());
        assert_eq!(cmd.frame_len(), 4);
        let mut wire = ClientMessage::Command(cmd.clone()).encode();
        assert_eq!(wire.len(), 3 + DCB_SIZE + 4);
        wire.extend(ClientMessage::Cancel { request_id: 5 }.encode());
        let mut dec = ClientMessageDecoder::default();
        let mut msgs = dec.push(&wire[..10]).unwrap();
        assert!(msgs.is_empty());
        msgs.extend(dec.push(&wire[10..]).unwrap());
        assert_eq!(msgs, [ClientMessage::Command(cmd), ClientMessage::Cancel { request_id: 5 }]);
    }

    #[test]
    fn invalid_streams_are_refused() {
        let mut dec = ClientMessageDecoder::default();
        assert_eq!(dec.push(&[0xA0, 1, 0x03]), Err(ProtocolError::InvalidDevice(0x03)));
        let mut dec = ClientMessageDecoder::default();
        assert_eq!(dec.push(&[0xA0, 1, 0x00]), Err(ProtocolError::InvalidDevice(0)));
        let mut dec = HostMessageDecoder::default();
        assert_eq!(dec.push(&[0x42]), Err(ProtocolError::InvalidTag(0x42)));
        let err: io::Error = ProtocolError::InvalidTag(0x42).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
