/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    ATARUSTY is free software: you can redistribute it and/or modify it under
    the terms of the GNU Lesser General Public License (LGPL) as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    ATARUSTY is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Lesser General Public License for more details.

    You should have received a copy of the GNU Lesser General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
//! Peripheral devices of the ATARUSTY library.
//!
//! * [via] - the MOS 6522 Versatile Interface Adapter.
//! * [fdc] - the WD1770 floppy disk controller.
//! * [disk] - disk images and the disk interface.
//! * [blackbox] - the BlackBox floppy board running its own 6502.
//! * [sio] - the SIO bus manager, its command frame decoder and step engine.
//! * [multiplexer] - SIO bus sharing between emulated computers over TCP.
//! * [modem] - a Telnet capable TCP modem driver.
pub mod blackbox;
pub mod disk;
pub mod fdc;
pub mod modem;
pub mod multiplexer;
pub mod sio;
pub mod via;
