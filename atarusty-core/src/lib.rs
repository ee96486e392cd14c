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
//! The core components of the ATARUSTY library.
//!
//! * [clock] - the machine cycle scheduler.
//! * [memory] - the layered address space of the host machine.
//! * [cpu] - a 6502 coprocessor used by intelligent peripherals.
//! * [debug] - catch-up and breakpoint control of peripheral coprocessors.
//! * [irq] - a shared interrupt line controller.
//! * [trace] - time-ranged trace channels.
//! * [props] - a generic property bag used for device settings.
pub mod clock;
pub mod cpu;
pub mod debug;
pub mod irq;
pub mod memory;
pub mod props;
pub mod trace;
