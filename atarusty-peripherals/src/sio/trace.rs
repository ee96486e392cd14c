/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use atarusty_core::clock::Ticks;
use atarusty_core::trace::{ChannelId, SharedTrace};

use super::accel::SioRequest;
use super::interface::{SIO_ACK, SIO_COMPLETE, SIO_ERROR, SIO_NAK};

const COLOR_COMMAND: u32 = 0x2060C0;
const COLOR_SEND: u32 = 0x40A040;
const COLOR_RECEIVE: u32 = 0xC08020;
const COLOR_REQ: u32 = 0x808080;
const COLOR_ACK: u32 = 0x20C0C0;
const COLOR_NAK: u32 = 0xC02020;

/// SIO bus activity recorded into a trace collection.
pub struct SioTrace {
    trace: SharedTrace,
    command: ChannelId,
    send: ChannelId,
    receive: ChannelId,
    req: ChannelId,
    ack: ChannelId,
    req_start: Option<Ticks>,
}

impl SioTrace {
    pub fn new(trace: SharedTrace) -> Option<Self> {
        let (command, send, receive, req, ack) = {
            let mut coll = trace.borrow_mut();
            let group = coll.add_group("SIO");
            (coll.add_channel(group, "Command")?,
             coll.add_channel(group, "Send")?,
             coll.add_channel(group, "Receive")?,
             coll.add_channel(group, "REQ")?,
             coll.add_channel(group, "ACK")?)
        };
        Some(SioTrace { trace, command, send, receive, req, ack, req_start: None })
    }

    pub fn command_asserted(&mut self, now: Ticks) {
        self.req_start = Some(now);
    }

    pub fn command_deasserted(&mut self, now: Ticks) {
        if let Some(start) = self.req_start.take() {
            self.trace.borrow_mut().add_event(self.req, start, now, "REQ", COLOR_REQ);
        }
    }
    /// Records a complete command frame.
    pub fn command_frame(&mut self, start: Ticks, end: Ticks, frame: &[u8; 5]) {
        let label = format!("{:02X} {:02X} {:02X} {:02X}", frame[0], frame[1], frame[2], frame[3]);
        self.trace.borrow_mut().add_event(self.command, start, end, label, COLOR_COMMAND);
    }
    /// Records a byte sent by the computer. `now` is the end of its stop bit.
    pub fn send_byte(&mut self, now: Ticks, byte: u8, cycles_per_bit: u32) {
        let start = now.saturating_sub(10 * cycles_per_bit as Ticks);
        self.trace.borrow_mut().add_event(self.send, start, now, format!("{:02X}", byte), COLOR_SEND);
    }
    /// Records a byte sent by a device, starting at `now`.
    pub fn receive_byte(&mut self, now: Ticks, byte: u8, cycles_per_bit: u32) {
        let end = now + 10 * cycles_per_bit as Ticks;
        self.trace.borrow_mut().add_event(self.receive, now, end, format!("{:02X}", byte), COLOR_RECEIVE);
    }
    /// Records a single byte reply of a device.
    pub fn reply(&mut self, now: Ticks, byte: u8, cycles_per_bit: u32) {
        let (label, color) = match byte {
            SIO_ACK => ("ACK", COLOR_ACK),
            SIO_COMPLETE => ("Complete", COLOR_ACK),
            SIO_NAK => ("NAK", COLOR_NAK),
            SIO_ERROR => ("Error", COLOR_NAK),
            _ => return
        };
        let end = now + 10 * cycles_per_bit as Ticks;
        self.trace.borrow_mut().add_event(self.ack, now, end, label, color);
    }
    /// Synthesizes the ranges of an accelerated request that took `skew` cycles of bus time.
    pub fn accel_request(&mut self, now: Ticks, req: &SioRequest, status: u8, skew: u64) {
        let frame_end = now + super::interface::ACCEL_COMMAND_FRAME_SKEW;
        let end = now + skew.max(super::interface::ACCEL_COMMAND_FRAME_SKEW);
        let mut coll = self.trace.borrow_mut();
        coll.add_event(self.req, now, frame_end, "REQ", COLOR_REQ);
        let label = format!("{:02X} {:02X} {:02X} {:02X} (accel)", req.device, req.command, req.aux[0], req.aux[1]);
        coll.add_event(self.command, now, frame_end, label, COLOR_COMMAND);
        let channel = if req.mode & super::accel::MODE_WRITE != 0 { self.send } else { self.receive };
        if req.mode & (super::accel::MODE_READ|super::accel::MODE_WRITE) != 0 {
            coll.add_event(channel, frame_end, end, format!("{} bytes", req.length), COLOR_RECEIVE);
        }
        let (label, color) = if status == super::accel::STATUS_SUCCESS {
            ("Complete", COLOR_ACK)
        }
        else {
            ("Error", COLOR_NAK)
        };
        coll.add_event(self.ack, end, end, label, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atarusty_core::trace::TraceCollection;

    #[test]
    fn sio_trace_works() {
        let coll = TraceCollection::new_shared();
        let mut trace = SioTrace::new(coll.clone()).unwrap();
        trace.command_asserted(100);
        trace.send_byte(1030, 0x31, 93);
        trace.command_frame(100, 5000, &[0x31, 0x53, 0, 0, 0x84]);
        trace.command_deasserted(5100);
        trace.reply(6000, SIO_ACK, 94);
        trace.reply(6000, 0x12, 94);
        let coll = coll.borrow();
        let req = coll.find_channel("SIO", "REQ").unwrap();
        assert_eq!(coll.channel(req).unwrap().events[0].end, 5100);
        let send = coll.find_channel("SIO", "Send").unwrap();
        assert_eq!(coll.channel(send).unwrap().events[0].start, 100);
        let cmd = coll.find_channel("SIO", "Command").unwrap();
        assert_eq!(coll.channel(cmd).unwrap().events[0].label, "31 53 00 00");
        let ack = coll.find_channel("SIO", "ACK").unwrap();
        assert_eq!(coll.channel(ack).unwrap().events.len(), 1);
        assert_eq!(coll.channel(ack).unwrap().events[0].label, "ACK");
    }
}
