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
//! ATARUSTY is a library for building emulators of the Atari 8-bit computer series.
//!
//! The library is split into crates re-exported here:
//!
//! * [core] - the machine cycle scheduler, the layered address space, a 6502 core for peripheral
//!   coprocessors, their debug control and a few shared utilities.
//! * [peripherals] - the SIO bus, disk drives, the BlackBox floppy board, the SIO multiplexer and
//!   a TCP modem.
//! * [custom] - scripted custom devices.
//! * [display] - a backend-neutral display composition graph.
//!
//! [machine] binds them together the way an emulator front end would.
pub use atarusty_core as core;

#[cfg(feature = "peripherals")]
pub use atarusty_peripherals as peripherals;

#[cfg(feature = "custom")]
pub use atarusty_custom as custom;

#[cfg(feature = "display")]
pub use atarusty_display as display;

#[cfg(feature = "custom")]
pub mod machine;
