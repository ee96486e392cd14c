/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The client side: polls the local computer for commands and forwards them to the host.
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use super::net::ConnId;
use super::protocol::*;
use super::{Port, PB_ACTIVE_OUT};

const DCB_FRAME: usize = DCB_SIZE + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ClientState {
    Reset,
    /// Nothing to poll for until the host becomes ready.
    Busy,
    ClientPoll,
    ClientPoll2,
    ReceiveDcb,
    ReceiveDcbByte,
    ReceiveDcbByteWait,
    ReceiveDcbAckWait,
    ProcessDcb,
    SendDcbReplyByte,
    SendDcbReplyByteWait,
    SendDcbReplyAckWait,
    ReceiveDataFrame,
    ReceiveDataFrameByte,
    ReceiveDataFrameByteWait,
    ReceiveDataFrameAckWait,
    Execute,
    ExecuteWait,
    SendResultFromServer,
    SendResultByte,
    SendResultByteWait,
    SendResultAckWait,
    CommandEnd,
}

impl ClientState {
    fn ack_wait(self) -> Option<ClientState> {
        Some(match self {
            ClientState::ReceiveDcbByteWait => ClientState::ReceiveDcbAckWait,
            ClientState::SendDcbReplyByteWait => ClientState::SendDcbReplyAckWait,
            ClientState::ReceiveDataFrameByteWait => ClientState::ReceiveDataFrameAckWait,
            ClientState::SendResultByteWait => ClientState::SendResultAckWait,
            _ => return None
        })
    }

    fn next_byte(self) -> Option<ClientState> {
        Some(match self {
            ClientState::ReceiveDcbAckWait => ClientState::ReceiveDcbByte,
            ClientState::SendDcbReplyAckWait => ClientState::SendDcbReplyByte,
            ClientState::ReceiveDataFrameAckWait => ClientState::ReceiveDataFrameByte,
            ClientState::SendResultAckWait => ClientState::SendResultByte,
            _ => return None
        })
    }

    fn is_receiving(self) -> bool {
        matches!(self, ClientState::ReceiveDcbByteWait|ClientState::ReceiveDataFrameByteWait)
    }
}

/// The connection to the host.
#[derive(Debug)]
pub(super) struct HostLink {
    id: ConnId,
    decoder: HostMessageDecoder,
    pub(super) host_ready: bool,
    reply: Option<HostMessage>,
}

#[derive(Debug)]
pub(super) struct ClientMachine {
    pub(super) state: ClientState,
    pub(super) link: Option<HostLink>,
    /// The one-hot id of the device being polled.
    device_bit: u8,
    request_id: u8,
    dcb: [u8; DCB_SIZE],
    transfer: Vec<u8>,
    index: usize,
    limit: usize,
}

impl Default for ClientMachine {
    fn default() -> Self {
        ClientMachine {
            state: ClientState::Reset,
            link: None,
            device_bit: 0,
            request_id: 0,
            dcb: [0; DCB_SIZE],
            transfer: vec![0; MAX_FRAME + 4],
            index: 0,
            limit: 0,
        }
    }
}

impl ClientMachine {
    fn schedule(&mut self, port: &mut Port<'_>, state: ClientState, delay: u64) {
        self.state = state;
        port.schedule(delay);
    }

    pub(super) fn cold_reset(&mut self, port: &mut Port<'_>) {
        self.schedule(port, ClientState::Reset, 1);
    }

    pub(super) fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub(super) fn on_connected(&mut self, port: &mut Port<'_>, id: ConnId) {
        info!("multiplexer client: connected to host");
        self.link = Some(HostLink {
            id,
            decoder: HostMessageDecoder::default(),
            host_ready: false,
            reply: None,
        });
        if self.state == ClientState::Busy {
            self.schedule(port, ClientState::ClientPoll, 1);
        }
    }

    pub(super) fn on_closed(&mut self, port: &mut Port<'_>) {
        info!("multiplexer client: disconnected from host");
        self.link = None;
        if self.state == ClientState::ExecuteWait {
            self.schedule(port, ClientState::Reset, 1);
        }
    }

    pub(super) fn on_received(&mut self, port: &mut Port<'_>, data: &[u8]) {
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return
        };
        let messages = match link.decoder.push(data) {
            Ok(messages) => messages,
            Err(err) => {
                warn!("multiplexer client: dropping connection: {}", err);
                port.close(link.id);
                self.on_closed(port);
                return
            }
        };
        for msg in messages {
            self.on_message(port, msg);
        }
    }

    fn on_message(&mut self, port: &mut Port<'_>, msg: HostMessage) {
        let state = self.state;
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return
        };
        match msg.request_id() {
            None => {
                let ready = msg == HostMessage::Resume;
                if link.host_ready != ready {
                    link.host_ready = ready;
                    if ready && state == ClientState::Busy {
                        self.schedule(port, ClientState::ClientPoll, 1);
                    }
                }
            }
            Some(request_id) => {
                link.host_ready = true;
                if request_id != self.request_id || state != ClientState::ExecuteWait {
                    debug!("multiplexer client: dropping stale reply {}", request_id);
                    return
                }
                link.reply = Some(msg);
                self.schedule(port, ClientState::SendResultFromServer, 1);
            }
        }
    }

    pub(super) fn on_port_output(&mut self, port: &mut Port<'_>, output: u32, prev: u32) {
        let delta = output ^ prev;
        if self.state == ClientState::ClientPoll2 {
            if delta & PB_ACTIVE_OUT != 0 && output & PB_ACTIVE_OUT == 0 {
                self.schedule(port, ClientState::ReceiveDcb, 1);
            }
            return
        }
        if delta & super::OUTPUT_ACK == 0 {
            return
        }
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
            if self.state == ClientState::ReceiveDcbAckWait
               || self.state == ClientState::ReceiveDataFrameAckWait
            {
                port.set_ack(false);
            }
            self.schedule(port, next, 1);
        }
    }

    pub(super) fn run(&mut self, port: &mut Port<'_>) {
        loop {
            match self.state {
                ClientState::Reset => {
                    port.set_active(false);
                    port.clear_input_byte();
                    port.set_ack(false);
                    if let Some(link) = self.link.as_mut() {
                        link.reply = None;
                    }
                    self.schedule(port, ClientState::ClientPoll, 10000);
                    return
                }
                ClientState::Busy|ClientState::ExecuteWait => return,
                ClientState::ClientPoll => {
                    if !matches!(&self.link, Some(link) if link.host_ready) {
                        self.state = ClientState::Busy;
                        return
                    }
                    self.device_bit = match self.device_bit << 1 {
                        0 => 1,
                        bit => bit
                    };
                    port.set_input_byte(self.device_bit);
                    self.schedule(port, ClientState::ClientPoll2, 600);
                    return
                }
                ClientState::ClientPoll2 => {
                    port.clear_input_byte();
                    self.schedule(port, ClientState::ClientPoll, 100);
                    return
                }
                ClientState::ReceiveDcb => {
                    port.set_active(true);
                    port.set_ack(false);
                    self.index = 0;
                    self.limit = DCB_FRAME;
                    self.state = ClientState::ReceiveDcbByte;
                }
                ClientState::ReceiveDcbByte => {
                    if self.index < self.limit {
                        self.schedule(port, ClientState::ReceiveDcbByteWait, 1000);
                        return
                    }
                    self.state = ClientState::ProcessDcb;
                }
                ClientState::ProcessDcb => {
                    self.dcb.copy_from_slice(&self.transfer[..DCB_SIZE]);
                    if frame_checksum(&self.dcb) != self.transfer[DCB_SIZE] {
                        debug!("multiplexer client: bad DCB checksum");
                        self.state = ClientState::Reset;
                        continue
                    }
                    trace!("multiplexer client: DCB {:02x?}", self.dcb);
                    self.transfer[..3].copy_from_slice(&[0x01, 0x00, reply_checksum(0x01, 0x00)]);
                    self.index = 0;
                    self.limit = 3;
                    self.state = ClientState::SendDcbReplyByte;
                }
                ClientState::SendDcbReplyByte => {
                    if self.index < self.limit {
                        self.send_byte(port, ClientState::SendDcbReplyByteWait, 1000);
                        return
                    }
                    self.state = if self.transfer[1] & 0x40 != 0 {
                        ClientState::SendResultFromServer
                    }
                    else {
                        ClientState::ReceiveDataFrame
                    };
                }
                ClientState::ReceiveDataFrame => {
                    port.clear_input_byte();
                    if self.dcb[DCB_STATS] & DSTATS_WRITE != 0 {
                        port.set_ack(false);
                        self.index = 0;
                        self.limit = frame_len(self.dcb[DCB_BYTE_LO]) + 1;
                        self.state = ClientState::ReceiveDataFrameByte;
                    }
                    else {
                        self.state = ClientState::Execute;
                    }
                }
                ClientState::ReceiveDataFrameByte => {
                    if self.index < self.limit {
                        self.schedule(port, ClientState::ReceiveDataFrameByteWait, 10000);
                        return
                    }
                    let len = self.limit - 1;
                    self.state = if frame_checksum(&self.transfer[..len]) == self.transfer[len] {
                        ClientState::Execute
                    }
                    else {
                        debug!("multiplexer client: bad data frame checksum");
                        ClientState::Reset
                    };
                }
                ClientState::Execute => {
                    let link = match self.link.as_ref() {
                        Some(link) => link,
                        None => {
                            self.state = ClientState::Reset;
                            continue
                        }
                    };
                    self.request_id = self.request_id.wrapping_add(1);
                    let data = if self.dcb[DCB_STATS] & DSTATS_WRITE != 0 {
                        self.transfer[..frame_len(self.dcb[DCB_BYTE_LO])].to_vec()
                    }
                    else {
                        Vec::new()
                    };
                    let cmd = MuxCommand {
                        request_id: self.request_id,
                        device_bit: self.device_bit,
                        dcb: self.dcb,
                        data
                    };
                    port.send(link.id, ClientMessage::Command(cmd).encode());
                    self.state = ClientState::ExecuteWait;
                    return
                }
                ClientState::SendResultFromServer => {
                    let reply = self.link.as_mut().and_then(|link| link.reply.take());
                    let (status, data) = match reply {
                        Some(HostMessage::Reply { status, .. }) => (status, None),
                        Some(HostMessage::ReplyWithData { status, data, .. }) => (status, Some(data)),
                        _ => {
                            self.state = ClientState::Reset;
                            continue
                        }
                    };
                    self.index = 0;
                    self.limit = 0;
                    if let Some(data) = data {
                        let len = data.len().min(MAX_FRAME);
                        self.transfer[..len].copy_from_slice(&data[..len]);
                        self.transfer[len] = frame_checksum(&data[..len]);
                        self.limit = len + 1;
                    }
                    let tail = [status[0], status[1], reply_checksum(status[0], status[1])];
                    self.transfer[self.limit..self.limit + 3].copy_from_slice(&tail);
                    self.limit += 3;
                    port.set_ack(false);
                    self.schedule(port, ClientState::SendResultByte, 1000);
                    return
                }
                ClientState::SendResultByte => {
                    if self.index < self.limit {
                        self.send_byte(port, ClientState::SendResultByteWait, 1000);
                        return
                    }
                    self.state = ClientState::CommandEnd;
                }
                ClientState::CommandEnd => {
                    self.schedule(port, ClientState::Reset, 1000);
                    return
                }
                // acknowledge handshake timed out
                _ => {
                    debug!("multiplexer client: timeout in state {:?}", self.state);
                    self.state = ClientState::Reset;
                }
            }
        }
    }

    fn send_byte(&mut self, port: &mut Port<'_>, wait: ClientState, timeout: u64) {
        port.set_input_byte(self.transfer[self.index]);
        self.index += 1;
        port.set_ack(true);
        self.schedule(port, wait, timeout);
    }

    pub(super) fn is_host_ready(&self) -> bool {
        matches!(&self.link, Some(link) if link.host_ready)
    }
}
