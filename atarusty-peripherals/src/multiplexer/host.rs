/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The host side: serves the commands of remote clients to the local computer.
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use super::net::ConnId;
use super::protocol::*;
use super::{Port, PB_ACTIVE_OUT, PA_MASK, is_one_hot};

const DCB_FRAME: usize = DCB_SIZE + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum HostState {
    Reset,
    WaitForSelection,
    WaitSelectAck,
    SendDcb,
    SendDcbByte,
    SendDcbByteWait,
    SendDcbAckWait,
    ReceiveDcbReply,
    ReceiveDcbReplyByte,
    ReceiveDcbReplyByteWait,
    ReceiveDcbReplyAckWait,
    SendDataFrameByte,
    SendDataFrameByteWait,
    SendDataFrameAckWait,
    ReceiveDataFrameByte,
    ReceiveDataFrameByteWait,
    ReceiveDataFrameAckWait,
    ReceiveCommandReply,
    ReceiveCommandReplyByte,
    ReceiveCommandReplyByteWait,
    ReceiveCommandReplyAckWait,
    SendReplyToClient,
}

impl HostState {
    /// States in which the computer must not raise its active line.
    fn is_idle(self) -> bool {
        matches!(self, HostState::Reset|HostState::WaitForSelection|HostState::WaitSelectAck)
    }
    /// Returns the state waiting for the end of the acknowledge strobe.
    fn ack_wait(self) -> Option<HostState> {
        Some(match self {
            HostState::SendDcbByteWait => HostState::SendDcbAckWait,
            HostState::ReceiveDcbReplyByteWait => HostState::ReceiveDcbReplyAckWait,
            HostState::SendDataFrameByteWait => HostState::SendDataFrameAckWait,
            HostState::ReceiveDataFrameByteWait => HostState::ReceiveDataFrameAckWait,
            HostState::ReceiveCommandReplyByteWait => HostState::ReceiveCommandReplyAckWait,
            _ => return None
        })
    }
    /// Returns the state transferring the next byte.
    fn next_byte(self) -> Option<HostState> {
        Some(match self {
            HostState::SendDcbAckWait => HostState::SendDcbByte,
            HostState::ReceiveDcbReplyAckWait => HostState::ReceiveDcbReplyByte,
            HostState::SendDataFrameAckWait => HostState::SendDataFrameByte,
            HostState::ReceiveDataFrameAckWait => HostState::ReceiveDataFrameByte,
            HostState::ReceiveCommandReplyAckWait => HostState::ReceiveCommandReplyByte,
            _ => return None
        })
    }

    fn is_receiving(self) -> bool {
        matches!(self, HostState::ReceiveDcbReplyByteWait|
                       HostState::ReceiveDataFrameByteWait|
                       HostState::ReceiveCommandReplyByteWait)
    }
}

#[derive(Debug)]
pub(super) struct HostConnection {
    pub(super) id: ConnId,
    decoder: ClientMessageDecoder,
    pub(super) pending: Option<MuxCommand>,
    /// The readiness last reported to the client.
    pub(super) last_ready: bool,
    request_id: u8,
}

#[derive(Debug)]
pub(super) struct HostMachine {
    pub(super) state: HostState,
    pub(super) connections: Vec<HostConnection>,
    pub(super) active: Option<ConnId>,
    pub(super) busy: bool,
    dcb: [u8; DCB_SIZE],
    transfer: Vec<u8>,
    index: usize,
    limit: usize,
    reply_data: Vec<u8>,
}

impl Default for HostMachine {
    fn default() -> Self {
        HostMachine {
            state: HostState::Reset,
            connections: Vec::new(),
            active: None,
            busy: true,
            dcb: [0; DCB_SIZE],
            transfer: vec![0; MAX_FRAME + 1],
            index: 0,
            limit: 0,
            reply_data: Vec::new(),
        }
    }
}

impl HostMachine {
    fn schedule(&mut self, port: &mut Port<'_>, state: HostState, delay: u64) {
        self.state = state;
        port.schedule(delay);
    }

    pub(super) fn cold_reset(&mut self, port: &mut Port<'_>) {
        self.set_busy(port, true);
        self.schedule(port, HostState::Reset, 1);
    }

    fn connection_mut(&mut self, id: ConnId) -> Option<&mut HostConnection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    pub(super) fn on_connected(&mut self, port: &mut Port<'_>, id: ConnId) {
        debug!("multiplexer host: client {} connected", id.0);
        self.connections.push(HostConnection {
            id,
            decoder: ClientMessageDecoder::default(),
            pending: None,
            last_ready: false,
            request_id: 0,
        });
        self.flush_ready_states(port);
    }

    pub(super) fn on_closed(&mut self, port: &mut Port<'_>, id: ConnId) {
        debug!("multiplexer host: client {} disconnected", id.0);
        self.connections.retain(|c| c.id != id);
        if self.active == Some(id) {
            self.active = None;
            self.schedule(port, HostState::Reset, 1);
        }
    }

    pub(super) fn on_received(&mut self, port: &mut Port<'_>, id: ConnId, data: &[u8]) {
        let messages = match self.connection_mut(id).map(|c| c.decoder.push(data)) {
            Some(Ok(messages)) => messages,
            Some(Err(err)) => {
                warn!("multiplexer host: dropping client {}: {}", id.0, err);
                port.close(id);
                self.on_closed(port, id);
                return
            }
            None => return
        };
        for msg in messages {
            match msg {
                ClientMessage::Command(cmd) => self.on_command(port, id, cmd),
                ClientMessage::Cancel { request_id } => self.on_cancel(port, id, request_id),
            }
        }
    }

    fn on_command(&mut self, port: &mut Port<'_>, id: ConnId, cmd: MuxCommand) {
        trace!("multiplexer host: client {} command {:02x?}", id.0, cmd.dcb);
        if self.active == Some(id) {
            // the client gave up on its previous command
            self.active = None;
            self.schedule(port, HostState::Reset, 1);
        }
        if let Some(conn) = self.connection_mut(id) {
            conn.request_id = cmd.request_id;
            conn.pending = Some(cmd);
        }
        if self.state == HostState::WaitForSelection {
            self.schedule(port, HostState::WaitSelectAck, 1);
        }
    }

    fn on_cancel(&mut self, port: &mut Port<'_>, id: ConnId, request_id: u8) {
        if let Some(conn) = self.connection_mut(id) {
            if conn.request_id == request_id {
                conn.pending = None;
            }
        }
        if self.active == Some(id) {
            self.active = None;
            self.schedule(port, HostState::Reset, 1);
        }
    }
    /// Reports the readiness change to every client but the one being served.
    fn set_busy(&mut self, port: &mut Port<'_>, busy: bool) {
        if self.busy != busy {
            self.busy = busy;
            self.flush_ready_states(port);
        }
    }

    fn flush_ready_states(&mut self, port: &mut Port<'_>) {
        let ready = !self.busy;
        for conn in self.connections.iter_mut() {
            if Some(conn.id) != self.active && conn.last_ready != ready {
                conn.last_ready = ready;
                let msg = if ready { HostMessage::Resume } else { HostMessage::Pause };
                port.send(conn.id, msg.encode());
            }
        }
    }

    pub(super) fn on_port_output(&mut self, port: &mut Port<'_>, output: u32, prev: u32) {
        let delta = output ^ prev;
        if delta & output & PB_ACTIVE_OUT != 0 && !self.state.is_idle() {
            debug!("multiplexer host: transfer cancelled by the computer");
            self.schedule(port, HostState::Reset, 1);
            return
        }
        match self.state {
            HostState::WaitForSelection => {
                if delta & (PA_MASK|PB_ACTIVE_OUT) != 0 && output & PB_ACTIVE_OUT != 0
                   && is_one_hot(output as u8)
                {
                    self.schedule(port, HostState::WaitSelectAck, 1);
                }
            }
            HostState::WaitSelectAck => {
                if self.active.is_some() && delta & PB_ACTIVE_OUT != 0 && output & PB_ACTIVE_OUT == 0 {
                    self.schedule(port, HostState::SendDcb, 100);
                }
            }
            _ => {
                if delta & super::OUTPUT_ACK != 0 {
                    if output & super::OUTPUT_ACK == 0 {
                        if let Some(next) = self.state.ack_wait() {
                            if self.state.is_receiving() {
                                self.transfer[self.index] = output as u8;
                                self.index += 1;
                                port.set_ack(true);
                            }
                            else {
                                port.set_ack(false);
                            }
                            self.schedule(port, next, 1);
                        }
                    }
                    else if let Some(next) = self.state.next_byte() {
                        if self.state != HostState::SendDcbAckWait
                           && self.state != HostState::SendDataFrameAckWait
                        {
                            port.set_ack(false);
                        }
                        self.schedule(port, next, 1);
                    }
                }
            }
        }
    }
    /// Runs the state machine after the communication event fired.
    pub(super) fn run(&mut self, port: &mut Port<'_>) {
        loop {
            match self.state {
                HostState::Reset => {
                    if let Some(id) = self.active.take() {
                        if let Some(conn) = self.connection_mut(id) {
                            conn.pending = None;
                            conn.last_ready = true;
                            let msg = HostMessage::ReplyTimeout { request_id: conn.request_id };
                            port.send(id, msg.encode());
                        }
                    }
                    port.set_active(false);
                    port.clear_input_byte();
                    port.set_ack(false);
                    self.schedule(port, HostState::WaitForSelection, 10000);
                    return
                }
                HostState::WaitForSelection => return,
                HostState::WaitSelectAck => {
                    let output = port.output();
                    let selected = output as u8;
                    if output & PB_ACTIVE_OUT == 0 || !is_one_hot(selected) {
                        self.state = HostState::WaitForSelection;
                        continue
                    }
                    let any_pending = self.connections.iter().any(|c| c.pending.is_some());
                    let found = self.connections.iter()
                                .find(|c| matches!(&c.pending, Some(cmd) if cmd.device_bit == selected))
                                .map(|c| c.id);
                    match found {
                        Some(id) => {
                            self.active = Some(id);
                            if let Some(conn) = self.connection_mut(id) {
                                conn.last_ready = false;
                            }
                            self.set_busy(port, true);
                            port.set_active(true);
                            return
                        }
                        None => {
                            self.state = HostState::WaitForSelection;
                            if !any_pending {
                                self.set_busy(port, false);
                            }
                        }
                    }
                }
                HostState::SendDcb => {
                    port.set_active(false);
                    let dcb = self.active.and_then(|id| self.connections.iter().find(|c| c.id == id))
                              .and_then(|c| c.pending.as_ref()).map(|cmd| cmd.dcb);
                    match dcb {
                        Some(dcb) => {
                            self.dcb = dcb;
                            self.transfer[..DCB_SIZE].copy_from_slice(&dcb);
                            self.transfer[DCB_SIZE] = frame_checksum(&dcb);
                            self.index = 0;
                            self.limit = DCB_FRAME;
                            self.reply_data.clear();
                            self.schedule(port, HostState::SendDcbByte, 100);
                            return
                        }
                        None => self.state = HostState::Reset
                    }
                }
                HostState::SendDcbByte => {
                    if self.index >= self.limit {
                        port.clear_input_byte();
                        self.state = HostState::ReceiveDcbReply;
                        continue
                    }
                    self.send_byte(port, HostState::SendDcbByteWait, 1000);
                    return
                }
                HostState::ReceiveDcbReply => {
                    self.index = 0;
                    self.limit = 3;
                    port.clear_input_byte();
                    self.state = HostState::ReceiveDcbReplyByte;
                }
                HostState::ReceiveDcbReplyByte => {
                    if self.index < self.limit {
                        self.schedule(port, HostState::ReceiveDcbReplyByteWait, 1000);
                        return
                    }
                    if !self.reply_is_valid() {
                        debug!("multiplexer host: bad DCB reply checksum");
                        self.state = HostState::Reset;
                        continue
                    }
                    if self.transfer[1] & 0x40 != 0 {
                        self.state = HostState::SendReplyToClient;
                        continue
                    }
                    let len = frame_len(self.dcb[DCB_BYTE_LO]);
                    self.index = 0;
                    self.limit = len + 1;
                    if self.dcb[DCB_STATS] & DSTATS_WRITE != 0 {
                        let data = self.active.and_then(|id| self.connections.iter().find(|c| c.id == id))
                                   .and_then(|c| c.pending.as_ref()).map(|cmd| cmd.data.clone())
                                   .unwrap_or_default();
                        let frame = &mut self.transfer[..len];
                        frame.fill(0);
                        let n = data.len().min(len);
                        frame[..n].copy_from_slice(&data[..n]);
                        self.transfer[len] = frame_checksum(&self.transfer[..len]);
                        self.state = HostState::SendDataFrameByte;
                    }
                    else if self.dcb[DCB_STATS] & DSTATS_READ != 0 {
                        self.state = HostState::ReceiveDataFrameByte;
                    }
                    else {
                        self.state = HostState::SendReplyToClient;
                    }
                }
                HostState::SendDataFrameByte => {
                    if self.index >= self.limit {
                        port.clear_input_byte();
                        self.state = HostState::ReceiveCommandReply;
                        continue
                    }
                    self.send_byte(port, HostState::SendDataFrameByteWait, 1000);
                    return
                }
                HostState::ReceiveDataFrameByte => {
                    if self.index < self.limit {
                        let timeout = if self.index == 0 { 10_000_000 } else { 1000 };
                        self.schedule(port, HostState::ReceiveDataFrameByteWait, timeout);
                        return
                    }
                    let len = self.limit - 1;
                    if frame_checksum(&self.transfer[..len]) != self.transfer[len] {
                        debug!("multiplexer host: bad data frame checksum");
                        self.state = HostState::Reset;
                        continue
                    }
                    self.reply_data = self.transfer[..len].to_vec();
                    self.state = HostState::ReceiveCommandReply;
                }
                HostState::ReceiveCommandReply => {
                    self.index = 0;
                    self.limit = 3;
                    self.state = HostState::ReceiveCommandReplyByte;
                }
                HostState::ReceiveCommandReplyByte => {
                    if self.index < self.limit {
                        self.schedule(port, HostState::ReceiveCommandReplyByteWait, 100000);
                        return
                    }
                    self.state = if self.reply_is_valid() {
                        HostState::SendReplyToClient
                    }
                    else {
                        debug!("multiplexer host: bad command reply checksum");
                        HostState::Reset
                    };
                }
                HostState::SendReplyToClient => {
                    self.state = HostState::Reset;
                    let status = [self.transfer[0], self.transfer[1]];
                    let with_data = self.dcb[DCB_STATS] & DSTATS_READ != 0 && !self.reply_data.is_empty();
                    let data = core::mem::take(&mut self.reply_data);
                    if let Some(id) = self.active.take() {
                        if let Some(conn) = self.connection_mut(id) {
                            conn.pending = None;
                            conn.last_ready = false;
                            let request_id = conn.request_id;
                            let msg = if with_data {
                                HostMessage::ReplyWithData { request_id, status, data }
                            }
                            else {
                                HostMessage::Reply { request_id, status }
                            };
                            port.send(id, msg.encode());
                        }
                    }
                }
                // acknowledge handshake timed out
                _ => {
                    debug!("multiplexer host: timeout in state {:?}", self.state);
                    self.state = HostState::Reset;
                }
            }
        }
    }

    fn send_byte(&mut self, port: &mut Port<'_>, wait: HostState, timeout: u64) {
        port.set_input_byte(self.transfer[self.index]);
        self.index += 1;
        port.set_ack(true);
        self.schedule(port, wait, timeout);
    }

    fn reply_is_valid(&self) -> bool {
        reply_checksum(self.transfer[0], self.transfer[1]) == self.transfer[2]
    }
    /// Returns the readiness last reported to the connection.
    pub(super) fn reported_ready(&self, id: ConnId) -> Option<bool> {
        self.connections.iter().find(|c| c.id == id).map(|c| c.last_ready)
    }
}
