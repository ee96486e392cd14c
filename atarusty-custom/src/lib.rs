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
//! Scripted custom devices of the ATARUSTY library.
//!
//! A custom device is described by a text configuration declaring memory layers, SIO and PBI
//! devices, controller ports, images, video outputs and sounds, together with scripts that run
//! on cooperative threads alongside the emulated machine.
//!
//! * [vm] - the configuration language, its compiler and the cooperative script runtime.
//! * [objects] - runtime objects scripts operate on.
//! * [config] - turns a parsed configuration into objects, bindings and compiled scripts.
//! * [network] - the TCP back-end protocol of networked devices.
//! * [device] - the custom device binding it all to the machine.
pub mod config;
pub mod device;
pub mod network;
pub mod objects;
pub mod vm;

pub use device::{CustomDevice, CustomDeviceSettings, HostRequest, SharedCustomDevice};
