/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! A modem line bridged to TCP, optionally speaking Telnet.
//!
//! The line either dials out or answers on a local port. See [TcpModemDriver].
mod driver;
pub mod telnet;

use std::io;

use atarusty_core::props::PropertySet;

pub use driver::*;

pub const DEFAULT_TERMINAL_TYPE: &str = "ansi";

/// Persistent settings of a TCP modem line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModemSettings {
    /// The host to dial. Empty answers incoming calls on `port`.
    pub address: String,
    pub port: u16,
    pub config: ModemConfig,
    /// Collects connection and negotiation messages for the user.
    pub logging: bool,
}

impl Default for ModemSettings {
    fn default() -> Self {
        ModemSettings {
            address: String::new(),
            port: 23,
            config: ModemConfig {
                telnet_emulation: true,
                telnet_lf_conversion: false,
                listen_ipv6: true,
                terminal_type: DEFAULT_TERMINAL_TYPE.to_string(),
            },
            logging: false,
        }
    }
}

impl ModemSettings {
    pub fn from_props(ps: &PropertySet) -> Self {
        let default = ModemSettings::default();
        let port = ps.get_u32("port", default.port as u32).clamp(1, u16::MAX as u32);
        ModemSettings {
            address: ps.get_string("address", "").to_string(),
            port: port as u16,
            config: ModemConfig {
                telnet_emulation: ps.get_bool("telnet", default.config.telnet_emulation),
                telnet_lf_conversion: ps.get_bool("telnetlf", default.config.telnet_lf_conversion),
                listen_ipv6: ps.get_bool("ipv6", default.config.listen_ipv6),
                terminal_type: ps.get_string("termtype", DEFAULT_TERMINAL_TYPE).to_string(),
            },
            logging: ps.get_bool("logging", false),
        }
    }

    pub fn to_props(&self) -> PropertySet {
        let mut ps = PropertySet::new();
        if !self.address.is_empty() {
            ps.set_string("address", self.address.as_str());
        }
        ps.set_u32("port", self.port as u32);
        ps.set_bool("telnet", self.config.telnet_emulation);
        ps.set_bool("telnetlf", self.config.telnet_lf_conversion);
        ps.set_bool("ipv6", self.config.listen_ipv6);
        ps.set_string("termtype", self.config.terminal_type.as_str());
        if self.logging {
            ps.set_bool("logging", true);
        }
        ps
    }

    pub fn is_answering(&self) -> bool {
        self.address.is_empty()
    }
    /// Starts a driver for this line.
    pub fn start(&self) -> io::Result<TcpModemDriver> {
        TcpModemDriver::start(&self.address, self.port, &self.config, self.logging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_work() {
        let settings = ModemSettings::from_props(&PropertySet::new());
        assert_eq!(settings, ModemSettings::default());
        assert!(settings.is_answering());
        let mut ps = PropertySet::new();
        ps.set_string("address", "bbs.example");
        ps.set_u32("port", 100000);
        ps.set_bool("telnet", false);
        ps.set_string("termtype", "vt52");
        let settings = ModemSettings::from_props(&ps);
        assert!(!settings.is_answering());
        assert_eq!(settings.port, 65535);
        assert!(!settings.config.telnet_emulation);
        assert_eq!(settings.config.terminal_type, "vt52");
        assert_eq!(ModemSettings::from_props(&settings.to_props()), settings);
    }
}
