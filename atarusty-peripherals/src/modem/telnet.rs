/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Telnet (RFC 854/855) byte stream codec used by the TCP modem.
//!
//! [TelnetSession] does no I/O. Outgoing bytes are escaped with [TelnetSession::encode],
//! incoming bytes are stripped of commands with [TelnetSession::decode] and any replies the
//! negotiation produced are collected for the caller with [TelnetSession::take_replies].
use core::fmt;

use bitvec::prelude::*;
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

pub const IAC: u8 = 0xFF;
pub const DONT: u8 = 0xFE;
pub const DO: u8 = 0xFD;
pub const WONT: u8 = 0xFC;
pub const WILL: u8 = 0xFB;
pub const SB: u8 = 0xFA;
pub const SE: u8 = 0xF0;

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;
const NUL: u8 = 0x00;
const ATASCII_EOL: u8 = 0x9B;

const TERMINAL_TYPE_IS: u8 = 0;
const TERMINAL_TYPE_SEND: u8 = 1;
const LINEMODE_MODE: u8 = 1;

/// Telnet option codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TelnetOption {
    TransmitBinary = 0,
    Echo = 1,
    SuppressGoAhead = 3,
    Status = 5,
    TimingMark = 6,
    TerminalType = 24,
    Naws = 31,
    TerminalSpeed = 32,
    ToggleFlowControl = 33,
    LineMode = 34,
    XDisplayLocation = 35,
    Environ = 36,
    Authentication = 37,
    Encrypt = 38,
    NewEnviron = 39,
}

impl TelnetOption {
    pub fn from_code(code: u8) -> Option<Self> {
        use TelnetOption::*;
        Some(match code {
            0 => TransmitBinary,
            1 => Echo,
            3 => SuppressGoAhead,
            5 => Status,
            6 => TimingMark,
            24 => TerminalType,
            31 => Naws,
            32 => TerminalSpeed,
            33 => ToggleFlowControl,
            34 => LineMode,
            35 => XDisplayLocation,
            36 => Environ,
            37 => Authentication,
            38 => Encrypt,
            39 => NewEnviron,
            _ => return None
        })
    }

    pub fn name(self) -> &'static str {
        use TelnetOption::*;
        match self {
            TransmitBinary => "TRANSMIT-BINARY",
            Echo => "ECHO",
            SuppressGoAhead => "SUPPRESS-GO-AHEAD",
            Status => "STATUS",
            TimingMark => "TIMING-MARK",
            TerminalType => "TERMINAL-TYPE",
            Naws => "NAWS",
            TerminalSpeed => "TERMINAL-SPEED",
            ToggleFlowControl => "TOGGLE-FLOW-CONTROL",
            LineMode => "LINEMODE",
            XDisplayLocation => "X-DISPLAY-LOCATION",
            Environ => "ENVIRON",
            Authentication => "AUTHENTICATION",
            Encrypt => "ENCRYPT",
            NewEnviron => "NEW-ENVIRON",
        }
    }
}

/// Displays a raw option code by name when it is known.
struct OptionName(u8);

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match TelnetOption::from_code(self.0) {
            Some(opt) => f.write_str(opt.name()),
            None => write!(f, "<{}>", self.0)
        }
    }
}

/// Settings of the codec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelnetConfig {
    /// Interpret and negotiate Telnet commands. When off the codec passes bytes unchanged.
    pub emulation: bool,
    /// Translate CR to CR LF on output and swallow LF after CR on input, until ATASCII EOL
    /// is seen in the incoming stream.
    pub lf_conversion: bool,
    /// Reported on TERMINAL-TYPE requests. Empty refuses the option.
    pub terminal_type: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    WaitingForIac,
    WaitingForCommandByte,
    WaitingForDoOption,
    WaitingForDontOption,
    WaitingForWillOption,
    WaitingForWontOption,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubState {
    None,
    SubOptionCode,
    SubDataDiscard,
    SubDataTerminalType,
}

/// The negotiation and line discipline state of a single Telnet connection.
#[derive(Clone, Debug)]
pub struct TelnetSession {
    emulation: bool,
    lf_conversion: bool,
    terminal_type: String,
    listening: bool,
    state: State,
    substate: SubState,
    waiting_for_echo: bool,
    waiting_for_sga: bool,
    saw_incoming_cr: bool,
    saw_outgoing_cr: bool,
    saw_incoming_atascii: bool,
    sent_terminal_type: bool,
    binary_incoming: bool,
    binary_outgoing: bool,
    binary_incoming_pending: u32,
    sent_do_dont: BitVec<Lsb0, u64>,
    replies: Vec<u8>,
    log: Option<String>,
}

impl TelnetSession {
    /// Creates a session of the answering (`listening == true`) or the calling side.
    pub fn new(config: &TelnetConfig, listening: bool) -> Self {
        let mut session = TelnetSession {
            emulation: false,
            lf_conversion: false,
            terminal_type: String::new(),
            listening,
            state: State::WaitingForIac,
            substate: SubState::None,
            waiting_for_echo: false,
            waiting_for_sga: false,
            saw_incoming_cr: false,
            saw_outgoing_cr: false,
            saw_incoming_atascii: false,
            sent_terminal_type: false,
            binary_incoming: false,
            binary_outgoing: false,
            binary_incoming_pending: 0,
            sent_do_dont: BitVec::repeat(false, 256),
            replies: Vec::new(),
            log: None,
        };
        session.set_config(config);
        session
    }

    pub fn set_config(&mut self, config: &TelnetConfig) {
        self.emulation = config.emulation;
        self.lf_conversion = config.emulation && config.lf_conversion;
        self.terminal_type = config.terminal_type.to_ascii_uppercase();
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_binary_outgoing(&self) -> bool {
        self.binary_outgoing
    }

    pub fn is_binary_incoming(&self) -> bool {
        self.binary_incoming
    }

    /// Enables collecting negotiation messages, see [TelnetSession::take_log].
    pub fn set_logging(&mut self, enabled: bool) {
        if enabled {
            self.log.get_or_insert_with(String::new);
        }
        else {
            self.log = None;
        }
    }

    /// Returns the negotiation messages collected since the previous call.
    pub fn take_log(&mut self) -> Option<String> {
        match self.log.as_mut() {
            Some(log) if !log.is_empty() => Some(core::mem::take(log)),
            _ => None
        }
    }

    /// Forgets everything negotiated on the previous connection.
    pub fn reset(&mut self) {
        self.state = State::WaitingForIac;
        self.substate = SubState::None;
        self.waiting_for_echo = false;
        self.waiting_for_sga = false;
        self.saw_incoming_cr = false;
        self.saw_outgoing_cr = false;
        self.saw_incoming_atascii = false;
        self.sent_terminal_type = false;
        self.binary_incoming = false;
        self.binary_outgoing = false;
        self.binary_incoming_pending = 0;
        self.sent_do_dont.set_all(false);
        self.replies.clear();
    }

    /// Starts a new connection. The answering side opens the negotiation.
    pub fn on_connected(&mut self) {
        self.reset();
        if self.emulation && self.listening {
            self.send_will(TelnetOption::Echo as u8);
            self.send_do(TelnetOption::SuppressGoAhead as u8);
            self.send_do(TelnetOption::LineMode as u8);
            self.waiting_for_echo = true;
            self.waiting_for_sga = true;
        }
    }

    /// Returns the negotiation replies produced since the previous call. They must be sent
    /// as is, without going through [TelnetSession::encode].
    pub fn take_replies(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.replies)
    }

    pub fn has_replies(&self) -> bool {
        !self.replies.is_empty()
    }

    /// Appends the wire form of `data` to `out`, never letting `out` grow beyond `limit`
    /// bytes. Returns how many bytes of `data` were consumed.
    pub fn encode(&mut self, data: &[u8], out: &mut Vec<u8>, limit: usize) -> usize {
        let mut consumed = 0;
        for &c in data {
            let mut prefix: Option<u8> = None;
            let mut suffix: Option<u8> = None;
            let mut skip = false;
            if self.emulation {
                if self.lf_conversion && !self.saw_incoming_atascii {
                    if c == CR {
                        self.saw_outgoing_cr = true;
                        suffix = Some(LF);
                    }
                    else if self.saw_outgoing_cr {
                        self.saw_outgoing_cr = false;
                        skip = c == LF;
                    }
                }
                else if !self.binary_outgoing && c == CR {
                    suffix = Some(NUL);
                }
                if c == IAC {
                    prefix = Some(IAC);
                }
            }
            if !skip {
                let needed = 1 + prefix.is_some() as usize + suffix.is_some() as usize;
                if out.len() + needed > limit {
                    break
                }
                out.extend(prefix);
                out.push(c);
                out.extend(suffix);
            }
            consumed += 1;
        }
        consumed
    }

    /// Strips Telnet commands from `data`, appending the payload to `out`.
    pub fn decode(&mut self, data: &[u8], out: &mut Vec<u8>) {
        if !self.emulation {
            out.extend_from_slice(data);
            return
        }
        for &c in data {
            self.decode_byte(c, out);
        }
    }

    fn decode_byte(&mut self, c: u8, out: &mut Vec<u8>) {
        match self.state {
            State::WaitingForIac => {
                if c == IAC {
                    self.state = State::WaitingForCommandByte;
                }
                else {
                    self.sub_data(c, out);
                }
            }
            State::WaitingForCommandByte => {
                self.state = State::WaitingForIac;
                match c {
                    SE => self.substate = SubState::None,
                    SB => self.substate = SubState::SubOptionCode,
                    WILL => self.state = State::WaitingForWillOption,
                    WONT => self.state = State::WaitingForWontOption,
                    DO => self.state = State::WaitingForDoOption,
                    DONT => self.state = State::WaitingForDontOption,
                    IAC => self.sub_data(c, out),
                    _ => self.log_message(format_args!("ignoring command {:#04x}", c))
                }
            }
            State::WaitingForDoOption => {
                self.state = State::WaitingForIac;
                self.log_message(format_args!("received DO {}", OptionName(c)));
                self.on_do(c);
            }
            State::WaitingForDontOption => {
                self.state = State::WaitingForIac;
                self.log_message(format_args!("received DONT {}", OptionName(c)));
                self.on_dont(c);
            }
            State::WaitingForWillOption => {
                self.state = State::WaitingForIac;
                self.log_message(format_args!("received WILL {}", OptionName(c)));
                self.on_will(c);
            }
            State::WaitingForWontOption => {
                self.state = State::WaitingForIac;
                self.log_message(format_args!("received WONT {}", OptionName(c)));
                self.on_wont(c);
            }
        }
    }

    fn sub_data(&mut self, c: u8, out: &mut Vec<u8>) {
        match self.substate {
            SubState::None => self.data_byte(c, out),
            SubState::SubOptionCode => {
                self.substate = if c == TelnetOption::TerminalType as u8 {
                    SubState::SubDataTerminalType
                }
                else {
                    SubState::SubDataDiscard
                };
            }
            SubState::SubDataTerminalType => {
                if !self.listening && c == TERMINAL_TYPE_SEND {
                    self.send_terminal_type();
                }
                self.substate = SubState::SubDataDiscard;
            }
            SubState::SubDataDiscard => {}
        }
    }

    fn data_byte(&mut self, c: u8, out: &mut Vec<u8>) {
        if self.lf_conversion && !self.saw_incoming_atascii {
            if c == ATASCII_EOL {
                self.saw_incoming_atascii = true;
            }
            else if c == CR {
                self.saw_incoming_cr = true;
            }
            else if self.saw_incoming_cr {
                self.saw_incoming_cr = false;
                if c == LF || (c == NUL && !self.binary_incoming) {
                    return
                }
            }
        }
        else if !self.binary_incoming {
            if c == CR {
                self.saw_incoming_cr = true;
            }
            else if self.saw_incoming_cr {
                self.saw_incoming_cr = false;
                if c == NUL {
                    return
                }
            }
        }
        out.push(c);
    }

    fn on_do(&mut self, c: u8) {
        match TelnetOption::from_code(c) {
            Some(TelnetOption::TransmitBinary) => {
                if self.lf_conversion {
                    self.send_wont(c);
                }
                else {
                    self.send_will(c);
                    if !self.binary_outgoing {
                        self.binary_outgoing = true;
                        self.saw_outgoing_cr = false;
                    }
                    if !self.binary_incoming && self.send_do(c) {
                        self.binary_incoming_pending += 1;
                    }
                }
            }
            Some(TelnetOption::Echo) => {
                if self.waiting_for_echo {
                    self.waiting_for_echo = false;
                }
                else if self.listening {
                    self.send_will(c);
                }
                else {
                    self.send_wont(c);
                }
            }
            Some(TelnetOption::SuppressGoAhead) => self.send_will(c),
            Some(TelnetOption::TerminalType) => {
                if self.listening || self.terminal_type.is_empty() {
                    self.send_wont(c);
                }
                else {
                    self.send_will(c);
                }
            }
            _ => self.send_wont(c)
        }
    }

    fn on_dont(&mut self, c: u8) {
        self.send_wont(c);
        if c == TelnetOption::TransmitBinary as u8 {
            self.binary_outgoing = false;
            if self.binary_incoming && self.send_dont(c) {
                self.binary_incoming_pending += 1;
            }
        }
    }

    fn on_will(&mut self, c: u8) {
        match TelnetOption::from_code(c) {
            Some(TelnetOption::TransmitBinary) => {
                if self.binary_incoming_pending > 0 {
                    self.binary_incoming_pending -= 1;
                    self.binary_incoming = true;
                    self.saw_incoming_cr = false;
                }
            }
            Some(TelnetOption::Echo) => {
                if self.listening {
                    self.send_dont(c);
                }
            }
            Some(TelnetOption::SuppressGoAhead) => {
                if self.waiting_for_sga {
                    self.waiting_for_sga = false;
                }
                else {
                    self.send_do(c);
                }
            }
            Some(TelnetOption::LineMode) => {
                if self.listening {
                    // turn off local editing
                    self.replies.extend_from_slice(&[IAC, SB, c, LINEMODE_MODE, 0, IAC, SE]);
                }
                self.send_dont(c);
            }
            _ => {
                self.send_dont(c);
            }
        }
    }

    fn on_wont(&mut self, c: u8) {
        if c == TelnetOption::TransmitBinary as u8 {
            if self.listening && self.binary_incoming_pending > 0 {
                self.binary_incoming_pending -= 1;
            }
            self.binary_incoming = false;
        }
    }

    fn send_terminal_type(&mut self) {
        let name = if self.sent_terminal_type || self.terminal_type.is_empty() {
            "UNKNOWN"
        }
        else {
            self.terminal_type.as_str()
        };
        self.sent_terminal_type = true;
        self.replies.extend_from_slice(&[IAC, SB, TelnetOption::TerminalType as u8, TERMINAL_TYPE_IS]);
        self.replies.extend_from_slice(name.as_bytes());
        self.replies.extend_from_slice(&[IAC, SE]);
    }

    fn send_will(&mut self, c: u8) {
        self.log_message(format_args!("sending WILL {}", OptionName(c)));
        self.replies.extend_from_slice(&[IAC, WILL, c]);
    }

    fn send_wont(&mut self, c: u8) {
        self.log_message(format_args!("sending WONT {}", OptionName(c)));
        self.replies.extend_from_slice(&[IAC, WONT, c]);
    }

    /// Returns `false` if a DO or DONT for this option was already sent.
    fn send_do(&mut self, c: u8) -> bool {
        if self.mark_sent(c) {
            self.log_message(format_args!("sending DO {}", OptionName(c)));
            self.replies.extend_from_slice(&[IAC, DO, c]);
            true
        }
        else {
            false
        }
    }

    fn send_dont(&mut self, c: u8) -> bool {
        if self.mark_sent(c) {
            self.log_message(format_args!("sending DONT {}", OptionName(c)));
            self.replies.extend_from_slice(&[IAC, DONT, c]);
            true
        }
        else {
            false
        }
    }

    fn mark_sent(&mut self, c: u8) -> bool {
        let index = c as usize;
        if self.sent_do_dont[index] {
            return false
        }
        self.sent_do_dont.set(index, true);
        true
    }

    fn log_message(&mut self, args: fmt::Arguments<'_>) {
        debug!("telnet: {}", args);
        if let Some(log) = self.log.as_mut() {
            use core::fmt::Write;
            let _ = writeln!(log, "{}", args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(emulation: bool, lf_conversion: bool) -> TelnetConfig {
        TelnetConfig { emulation, lf_conversion, terminal_type: "ansi".into() }
    }

    fn encode(session: &mut TelnetSession, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        assert_eq!(session.encode(data, &mut out, 4096), data.len());
        out
    }

    fn decode(session: &mut TelnetSession, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        session.decode(data, &mut out);
        out
    }

    #[test]
    fn cr_is_stuffed_with_nul_until_binary() {
        let mut session = TelnetSession::new(&config(true, false), false);
        session.on_connected();
        assert!(session.take_replies().is_empty());
        assert_eq!(encode(&mut session, &[0x0D, 0x41]), [0x0D, 0x00, 0x41]);
        // the remote asks us to transmit binary
        assert!(decode(&mut session, &[IAC, DO, 0]).is_empty());
        assert!(session.is_binary_outgoing());
        assert_eq!(session.take_replies(), [IAC, WILL, 0, IAC, DO, 0]);
        assert_eq!(encode(&mut session, &[0x0D, 0x41]), [0x0D, 0x41]);
        // and agrees to send binary
        assert!(!session.is_binary_incoming());
        decode(&mut session, &[IAC, WILL, 0]);
        assert!(session.is_binary_incoming());
        assert_eq!(decode(&mut session, &[0x0D, 0x00]), [0x0D, 0x00]);
    }

    #[test]
    fn pass_through_without_emulation() {
        let mut session = TelnetSession::new(&config(false, true), false);
        let data = [0x0D, 0xFF, 0x0A, 0x00];
        assert_eq!(encode(&mut session, &data), data);
        assert_eq!(decode(&mut session, &data), data);
        assert!(!session.has_replies());
    }

    #[test]
    fn iac_is_doubled_and_undoubled() {
        let mut session = TelnetSession::new(&config(true, false), false);
        assert_eq!(encode(&mut session, &[1, 0xFF, 2]), [1, 0xFF, 0xFF, 2]);
        assert_eq!(decode(&mut session, &[1, 0xFF, 0xFF, 2]), [1, 0xFF, 2]);
        // commands split across reads
        assert_eq!(decode(&mut session, &[3, IAC]), [3]);
        assert!(decode(&mut session, &[DO]).is_empty());
        assert_eq!(decode(&mut session, &[3, 4]), [4]);
        assert_eq!(session.take_replies(), [IAC, WILL, 3]);
    }

    #[test]
    fn incoming_nul_after_cr_is_dropped() {
        let mut session = TelnetSession::new(&config(true, false), false);
        assert_eq!(decode(&mut session, b"a\r\0b\r\nc"), b"a\rb\r\nc");
    }

    #[test]
    fn lf_conversion_works() {
        let mut session = TelnetSession::new(&config(true, true), false);
        assert_eq!(encode(&mut session, b"ab\r"), b"ab\r\n");
        // an LF following CR from the computer is not duplicated
        assert_eq!(encode(&mut session, b"\nc"), b"c");
        assert_eq!(decode(&mut session, b"x\r\ny\r\0z"), b"x\ry\rz");
        // binary is refused while converting line endings
        decode(&mut session, &[IAC, DO, 0]);
        assert_eq!(session.take_replies(), [IAC, WONT, 0]);
        assert!(!session.is_binary_outgoing());
        // ATASCII EOL switches the conversion off
        assert_eq!(decode(&mut session, &[0x9B, 0x0D, 0x0A]), [0x9B, 0x0D, 0x0A]);
        assert_eq!(encode(&mut session, b"\r"), b"\r\0");
    }

    #[test]
    fn do_and_dont_are_sent_once() {
        let mut session = TelnetSession::new(&config(true, false), false);
        decode(&mut session, &[IAC, WILL, 31]);
        decode(&mut session, &[IAC, WILL, 31]);
        assert_eq!(session.take_replies(), [IAC, DONT, 31]);
        decode(&mut session, &[IAC, WILL, 3, IAC, WILL, 3]);
        assert_eq!(session.take_replies(), [IAC, DO, 3]);
        // WILL and WONT replies are not deduplicated
        decode(&mut session, &[IAC, DO, 31, IAC, DO, 31]);
        assert_eq!(session.take_replies(), [IAC, WONT, 31, IAC, WONT, 31]);
        // a new connection starts afresh
        session.on_connected();
        decode(&mut session, &[IAC, WILL, 31]);
        assert_eq!(session.take_replies(), [IAC, DONT, 31]);
    }

    #[test]
    fn answering_side_opens_negotiation() {
        let mut session = TelnetSession::new(&config(true, false), true);
        session.on_connected();
        assert_eq!(session.take_replies(), [IAC, WILL, 1, IAC, DO, 3, IAC, DO, 34]);
        // expected acknowledgements are not answered
        decode(&mut session, &[IAC, DO, 1, IAC, WILL, 3]);
        assert!(session.take_replies().is_empty());
        // linemode is accepted only to switch local editing off
        decode(&mut session, &[IAC, WILL, 34]);
        assert_eq!(session.take_replies(), [IAC, SB, 34, 1, 0, IAC, SE]);
        // the remote must not echo
        decode(&mut session, &[IAC, WILL, 1]);
        assert_eq!(session.take_replies(), [IAC, DONT, 1]);
        decode(&mut session, &[IAC, DO, 24]);
        assert_eq!(session.take_replies(), [IAC, WONT, 24]);
    }

    #[test]
    fn terminal_type_is_reported() {
        let mut session = TelnetSession::new(&config(true, false), false);
        session.set_logging(true);
        decode(&mut session, &[IAC, DO, 24]);
        assert_eq!(session.take_replies(), [IAC, WILL, 24]);
        let request = [IAC, SB, 24, 1, IAC, SE];
        assert!(decode(&mut session, &request).is_empty());
        let mut expected = vec![IAC, SB, 24, 0];
        expected.extend_from_slice(b"ANSI");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(session.take_replies(), expected);
        decode(&mut session, &request);
        let mut expected = vec![IAC, SB, 24, 0];
        expected.extend_from_slice(b"UNKNOWN");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(session.take_replies(), expected);
        // other sub-options are discarded
        assert_eq!(decode(&mut session, &[IAC, SB, 31, 0, 80, 0, 24, IAC, SE, b'k']), b"k");
        let log = session.take_log().unwrap();
        assert!(log.contains("received DO TERMINAL-TYPE"));
        assert!(log.contains("sending WILL TERMINAL-TYPE"));
        assert_eq!(session.take_log(), None);
    }

    #[test]
    fn encoding_respects_limit() {
        let mut session = TelnetSession::new(&config(true, false), false);
        let mut out = vec![0; 6];
        assert_eq!(session.encode(&[1, 0x0D, 2], &mut out, 8), 1);
        assert_eq!(out.len(), 7);
        assert_eq!(session.encode(&[0x0D], &mut out, 8), 0);
    }
}
