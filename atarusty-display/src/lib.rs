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
//! Backend-neutral display composition for the ATARUSTY library.
//!
//! The emulated video frame reaches the screen through a graph of nodes: source nodes buffer
//! and process the frame in textures, display nodes draw into the render target the caller
//! selected. [DisplayTree] assembles the graph from [DisplayParams] and rebuilds it only when
//! they change. Rendering goes through the [RenderContext] trait implemented by the backend.
//!
//! * [command] - the backend interface and command lists replayed each frame.
//! * [node] - the source and display nodes.
//! * [tree] - graph assembly.
pub mod command;
pub mod node;
pub mod tree;

pub use command::{RenderContext, RenderView, Rect, TextureFormat, select_backbuffer_format};
pub use node::{Frame, FilterMode, ScreenFxParams, BloomParams, CustomEffect};
pub use tree::{DisplayError, DisplayParams, DisplayTree};
