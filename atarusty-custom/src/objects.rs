/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Runtime objects of custom devices.
//!
//! Every method reachable from scripts validates its arguments and silently ignores calls that
//! would reach outside of an object.
use core::ops::Range;

use chrono::prelude::*;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::clock::Ticks;
use atarusty_core::memory::{AccessMode, LayerId, SharedMemory};

use crate::vm::FunctionId;

/// The largest segment a configuration may declare.
pub const MAX_SEGMENT_SIZE: u32 = 256 << 20;
/// The largest SIO data frame scripts may send or receive.
pub const MAX_FRAME_LENGTH: i32 = 8192;
/// The largest image a configuration may declare, in pixels.
pub const MAX_IMAGE_PIXELS: u32 = 4 << 20;
/// The color new images are filled with.
pub const IMAGE_INIT_COLOR: u32 = 0xFFFF_00FF;

const ALPHA: u32 = 0xFF00_0000;

/// How a segment is filled on reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitPattern {
    Byte(u8),
    /// A little endian word repeated over the segment.
    Word(u16),
    /// A little endian double word repeated over the segment.
    Long(u32),
    /// A byte sequence repeated over the segment.
    Bytes(Vec<u8>),
}

impl Default for InitPattern {
    fn default() -> Self {
        InitPattern::Byte(0)
    }
}

impl InitPattern {
    /// Picks the fill mode by the length of `pattern`.
    pub fn from_bytes(pattern: Vec<u8>) -> Self {
        match *pattern.as_slice() {
            [] => InitPattern::Byte(0),
            [b] => InitPattern::Byte(b),
            [lo, hi] => InitPattern::Word(u16::from_le_bytes([lo, hi])),
            [a, b, c, d] => InitPattern::Long(u32::from_le_bytes([a, b, c, d])),
            _ => InitPattern::Bytes(pattern)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            InitPattern::Byte(..) => 1,
            InitPattern::Word(..) => 2,
            InitPattern::Long(..) => 4,
            InitPattern::Bytes(bytes) => bytes.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Fills `dst`, a trailing partial repetition gets the head of the pattern.
    pub fn fill(&self, dst: &mut [u8]) {
        match self {
            InitPattern::Byte(b) => dst.fill(*b),
            InitPattern::Word(w) => {
                let bytes = w.to_le_bytes();
                for (i, p) in dst.iter_mut().enumerate() {
                    *p = bytes[i & 1];
                }
            }
            InitPattern::Long(l) => {
                let bytes = l.to_le_bytes();
                for (i, p) in dst.iter_mut().enumerate() {
                    *p = bytes[i & 3];
                }
            }
            InitPattern::Bytes(bytes) if bytes.is_empty() => dst.fill(0),
            InitPattern::Bytes(bytes) => {
                for (p, b) in dst.iter_mut().zip(bytes.iter().cycle()) {
                    *p = *b;
                }
            }
        }
    }
}

/// A named block of device memory.
///
/// Segments back memory layers directly, so their buffers are shared with the memory manager.
#[derive(Clone, Debug, Default)]
pub struct Segment {
    pub name: String,
    mem: SharedMemory,
    /// Scripts can't modify read-only segments.
    pub read_only: bool,
    /// Survives cold resets, cleared only when the configuration is reloaded.
    pub nonvolatile: bool,
    pub init: InitPattern,
}

impl Segment {
    pub fn new<S: Into<String>>(name: S, size: u32, init: InitPattern, nonvolatile: bool) -> Self {
        let seg = Segment {
            name: name.into(),
            mem: SharedMemory::new(size as usize, 0),
            read_only: false,
            nonvolatile,
            init
        };
        seg.reinit();
        seg
    }
    /// Creates the read-only `sio_frame` segment, initially empty.
    pub fn sio_frame() -> Self {
        Segment {
            name: "sio_frame".into(),
            read_only: true,
            ..Default::default()
        }
    }
    /// Replaces the contents of the segment, used for received SIO frames.
    pub fn set_data(&mut self, data: &[u8]) {
        self.mem = SharedMemory::from(data.to_vec());
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.mem
    }

    pub fn len(&self) -> u32 {
        self.mem.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.mem.borrow().to_vec()
    }
    /// Restores the initial contents.
    pub fn reinit(&self) {
        self.init.fill(&mut self.mem.borrow_mut());
    }
    /// Returns the byte range of a checked, non-empty span.
    pub fn span(&self, offset: i32, size: i32) -> Option<Range<usize>> {
        if offset < 0 || size <= 0 {
            return None
        }
        let (offset, size, len) = (offset as u32, size as u32, self.len());
        if offset >= len || len - offset < size {
            return None
        }
        Some(offset as usize..(offset + size) as usize)
    }

    fn writable_span(&self, offset: i32, size: i32) -> Option<Range<usize>> {
        if self.read_only {
            return None
        }
        self.span(offset, size)
    }
    /// Copies bytes out of the segment.
    pub fn read_slice(&self, offset: u32, len: u32) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        self.mem.borrow().get(offset as usize..end as usize).map(<[u8]>::to_vec)
    }
    /// Copies bytes into the segment, bypassing the read-only flag.
    pub fn write_slice(&self, offset: u32, data: &[u8]) -> bool {
        let end = match offset.checked_add(data.len() as u32) {
            Some(end) => end,
            None => return false
        };
        match self.mem.borrow_mut().get_mut(offset as usize..end as usize) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false
        }
    }

    pub fn get_length(&self) -> i32 {
        self.len() as i32
    }

    pub fn clear(&self, value: i32) {
        if !self.read_only {
            self.mem.borrow_mut().fill(value as u8);
        }
    }

    pub fn fill(&self, offset: i32, value: i32, size: i32) {
        if let Some(span) = self.writable_span(offset, size) {
            self.mem.borrow_mut()[span].fill(value as u8);
        }
    }

    pub fn xor_const(&self, offset: i32, value: i32, size: i32) {
        if let Some(span) = self.writable_span(offset, size) {
            for p in self.mem.borrow_mut()[span].iter_mut() {
                *p ^= value as u8;
            }
        }
    }

    pub fn reverse_bits(&self, offset: i32, size: i32) {
        if let Some(span) = self.writable_span(offset, size) {
            for p in self.mem.borrow_mut()[span].iter_mut() {
                *p = p.reverse_bits();
            }
        }
    }
    /// Maps `size` bytes of `src` through a 256 byte table into this segment.
    ///
    /// The table must not overlap the destination. The source may only overlap it exactly.
    pub fn translate(&self, dst_offset: i32, src: &Segment, src_offset: i32, size: i32, table: &Segment, table_offset: i32) {
        if table_offset < 0 {
            return
        }
        let (dst_span, src_span) = match (self.writable_span(dst_offset, size), src.span(src_offset, size)) {
            (Some(d), Some(s)) => (d, s),
            _ => return
        };
        let table_span = match table.span(table_offset, 256) {
            Some(span) => span,
            None => return
        };
        let size = size as u32;
        if table.mem.ptr_eq(&self.mem) {
            let delta = (dst_offset as u32).wrapping_sub(table_offset as u32);
            let span = size + 256;
            if delta < span || delta > 0u32.wrapping_sub(span) {
                return
            }
        }
        if src.mem.ptr_eq(&self.mem) {
            let delta = (dst_offset as u32).wrapping_sub(src_offset as u32);
            if delta != 0 && (delta < size || delta > 0u32.wrapping_sub(size)) {
                return
            }
        }
        let mut lut = [0u8; 256];
        lut.copy_from_slice(&table.mem.borrow()[table_span]);
        let input = src.mem.borrow()[src_span].to_vec();
        for (d, s) in self.mem.borrow_mut()[dst_span].iter_mut().zip(input) {
            *d = lut[s as usize];
        }
    }
    /// Copies bytes between segments, overlapping ranges of the same segment included.
    pub fn copy(&self, dst_offset: i32, src: &Segment, src_offset: i32, size: i32) {
        let (dst_span, src_span) = match (self.writable_span(dst_offset, size), src.span(src_offset, size)) {
            (Some(d), Some(s)) => (d, s),
            _ => return
        };
        if src.mem.ptr_eq(&self.mem) {
            self.mem.borrow_mut().copy_within(src_span, dst_span.start);
        }
        else {
            self.mem.borrow_mut()[dst_span].copy_from_slice(&src.mem.borrow()[src_span]);
        }
    }
    /// Copies a rectangle of `width` x `height` bytes. Rows are `width + skip` bytes apart.
    pub fn copy_rect(&self, dst_offset: i32, dst_skip: i32, src: &Segment, src_offset: i32, src_skip: i32, width: i32, height: i32) {
        if self.read_only || dst_offset < 0 || dst_skip < 0 || src_offset < 0 || src_skip < 0 || width <= 0 || height <= 0 {
            return
        }
        let extent = |offset: i32, skip: i32| {
            offset as u64 + width as u64 + (skip as u64 + width as u64) * (height as u64 - 1)
        };
        let dst_end = extent(dst_offset, dst_skip);
        let src_end = extent(src_offset, src_skip);
        if dst_end > self.len() as u64 || src_end > src.len() as u64 {
            return
        }
        let (width, height) = (width as usize, height as usize);
        let dst_pitch = width + dst_skip as usize;
        let src_pitch = width + src_skip as usize;
        let (dst_offset, src_offset) = (dst_offset as usize, src_offset as usize);
        if src.mem.ptr_eq(&self.mem) {
            let mut buf = self.mem.borrow_mut();
            let mut copy_row = |row: usize| {
                let s = src_offset + row * src_pitch;
                buf.copy_within(s..s + width, dst_offset + row * dst_pitch);
            };
            if dst_offset > src_offset {
                (0..height).rev().for_each(&mut copy_row);
            }
            else {
                (0..height).for_each(&mut copy_row);
            }
        }
        else {
            let source = src.mem.borrow();
            let mut target = self.mem.borrow_mut();
            for row in 0..height {
                let s = src_offset + row * src_pitch;
                let d = dst_offset + row * dst_pitch;
                target[d..d + width].copy_from_slice(&source[s..s + width]);
            }
        }
    }

    pub fn read_byte(&self, offset: i32) -> i32 {
        match self.span(offset, 1) {
            Some(span) => self.mem.read(span.start) as i32,
            None => 0
        }
    }

    pub fn write_byte(&self, offset: i32, value: i32) {
        if let Some(span) = self.writable_span(offset, 1) {
            self.mem.write(span.start, value as u8);
        }
    }

    fn read_pair(&self, offset: i32) -> Option<[u8; 2]> {
        let span = self.span(offset, 2)?;
        Some([self.mem.read(span.start), self.mem.read(span.start + 1)])
    }

    fn write_pair(&self, offset: i32, bytes: [u8; 2]) {
        if let Some(span) = self.writable_span(offset, 2) {
            self.mem.borrow_mut()[span].copy_from_slice(&bytes);
        }
    }

    pub fn read_word(&self, offset: i32) -> i32 {
        self.read_pair(offset).map_or(0, |b| u16::from_le_bytes(b) as i32)
    }

    pub fn write_word(&self, offset: i32, value: i32) {
        self.write_pair(offset, (value as u16).to_le_bytes())
    }

    pub fn read_rev_word(&self, offset: i32) -> i32 {
        self.read_pair(offset).map_or(0, |b| u16::from_be_bytes(b) as i32)
    }

    pub fn write_rev_word(&self, offset: i32, value: i32) {
        self.write_pair(offset, (value as u16).to_be_bytes())
    }
}

/// What a byte of a control layer does when accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressBinding {
    /// Passes the access to lower layers.
    None,
    Const(u8),
    /// Swallows writes.
    Block,
    /// Forwards the access to the network back-end.
    Network,
    /// Reads or writes a global script variable.
    Variable(u32),
    /// Runs a script, with `address` and `value` set. Both are indices into the device's
    /// table of binding scripts.
    Script { script: u16, debug_script: u16 },
}

impl Default for AddressBinding {
    fn default() -> Self {
        AddressBinding::None
    }
}

/// A condition a layer's modes depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoEnable {
    Always,
    /// Enabled while the PBI device is selected.
    Pbi,
    /// Enabled while the OS ROM is mapped.
    OsRom,
    BasicRom,
    SelfTestRom,
}

impl Default for AutoEnable {
    fn default() -> Self {
        AutoEnable::Always
    }
}

/// The cartridge window a layer follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CartWindow {
    /// `$A000-$BFFF`, RD5.
    Left,
    /// `$8000-$9FFF`, RD4.
    Right,
    /// `$D500-$D5FF`.
    Cctl,
}

/// The machine state auto-enabled layers follow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoConditions {
    pub pbi_selected: bool,
    pub kernel_rom: bool,
    pub basic_rom: bool,
    pub self_test_rom: bool,
}

/// A window of the address space owned by the device.
///
/// A layer either maps a segment or dispatches every access through per-address bindings.
#[derive(Clone, Debug, Default)]
pub struct MemoryLayer {
    /// The name scripts refer to the layer by.
    pub name: String,
    /// The name the memory manager shows.
    pub layer_name: String,
    pub layer: Option<LayerId>,
    pub priority: u8,
    pub address: u32,
    pub size: u32,
    /// The index of the mapped segment.
    pub segment: Option<u32>,
    pub segment_offset: u32,
    pub max_offset: u32,
    pub read_only: bool,
    /// Writes go to the segment and pass through to lower layers.
    pub write_through: bool,
    /// The modes the layer has when its auto-enable condition holds.
    pub enabled_modes: AccessMode,
    pub auto_enable: AutoEnable,
    pub cart_window: Option<CartWindow>,
    pub rd5_active: bool,
    pub read_bindings: Vec<AddressBinding>,
    pub write_bindings: Vec<AddressBinding>,
}

impl MemoryLayer {
    pub fn is_control(&self) -> bool {
        !self.read_bindings.is_empty()
    }

    pub fn page_base(&self) -> u8 {
        (self.address >> 8) as u8
    }

    pub fn page_count(&self) -> u16 {
        (self.size >> 8) as u16
    }

    pub fn contains(&self, addr: u16) -> bool {
        (addr as u32).wrapping_sub(self.address) < self.size
    }
    /// The modes the layer should have under `conditions`.
    pub fn effective_modes(&self, conditions: &AutoConditions) -> AccessMode {
        let enabled = match self.auto_enable {
            AutoEnable::Always => true,
            AutoEnable::Pbi => conditions.pbi_selected,
            AutoEnable::OsRom => conditions.kernel_rom,
            AutoEnable::BasicRom => conditions.basic_rom,
            AutoEnable::SelfTestRom => conditions.self_test_rom,
        };
        if enabled { self.enabled_modes } else { AccessMode::empty() }
    }

    pub fn read_binding(&self, addr: u16) -> AddressBinding {
        let index = (addr as u32).wrapping_sub(self.address) as usize;
        self.read_bindings.get(index).copied().unwrap_or_default()
    }

    pub fn write_binding(&self, addr: u16) -> AddressBinding {
        let index = (addr as u32).wrapping_sub(self.address) as usize;
        self.write_bindings.get(index).copied().unwrap_or_default()
    }
    /// The segment byte a write-through access lands on.
    pub fn segment_index(&self, addr: u16) -> usize {
        (self.segment_offset + (addr as u32).wrapping_sub(self.address)) as usize
    }
    /// Moves the mapping within the segment. Returns `true` if the memory manager should follow.
    pub fn set_offset(&mut self, offset: i32) -> bool {
        if self.layer.is_none() || self.segment.is_none() {
            return false
        }
        if offset & 0xFF != 0 || offset < 0 || offset as u32 > self.max_offset {
            return false
        }
        self.segment_offset = offset as u32;
        !self.write_through
    }
    /// Maps another segment of `seg_len` bytes. Returns `true` if the memory manager should follow.
    pub fn set_segment_and_offset(&mut self, segment: u32, seg_len: u32, offset: i32) -> bool {
        if self.layer.is_none() || self.segment.is_none() {
            return false
        }
        if offset & 0xFF != 0 || offset < 0 || offset as u32 >= seg_len || seg_len - (offset as u32) < self.size {
            return false
        }
        self.segment = Some(segment);
        self.max_offset = seg_len - self.size;
        self.segment_offset = offset as u32;
        !self.write_through
    }
    /// Returns `true` if the modes changed.
    pub fn set_modes(&mut self, read: i32, write: i32) -> bool {
        if self.layer.is_none() {
            return false
        }
        let mut modes = AccessMode::empty();
        if write != 0 {
            modes |= AccessMode::W;
        }
        if read != 0 {
            modes |= AccessMode::AR;
        }
        if self.enabled_modes == modes {
            return false
        }
        self.enabled_modes = modes;
        true
    }
    /// Returns `true` if the layer moved.
    pub fn set_base_address(&mut self, base: i32) -> bool {
        if self.layer.is_none() || self.segment.is_none() {
            return false
        }
        if base < 0 || base >= 0x10000 || base & 0xFF != 0 || base as u32 > 0x10000 - self.size {
            return false
        }
        if self.address == base as u32 {
            return false
        }
        self.address = base as u32;
        true
    }
}

/// A rectangle given by its edges, right and bottom excluded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Rect { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

/// A 32-bit XRGB frame buffer scripts draw on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
    /// Odd while the image has changes not yet seen by a video output.
    pub change_counter: u32,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Image {
            width, height,
            pixels: vec![IMAGE_INIT_COLOR; width as usize * height as usize],
            change_counter: 0
        }
    }

    /// Creates an image from decoded `0xRRGGBB` pixels, `None` if their count doesn't match.
    pub fn from_pixels(width: u32, height: u32, mut pixels: Vec<u32>) -> Option<Self> {
        if pixels.len() != width as usize * height as usize {
            return None
        }
        for p in pixels.iter_mut() {
            *p |= ALPHA;
        }
        Some(Image { width, height, pixels, change_counter: 0 })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    fn touch(&mut self) {
        self.change_counter |= 1;
    }
    /// Clips a rectangle to the image, returning its pixel bounds.
    fn clip(&self, x: i32, y: i32, w: i32, h: i32) -> Option<(usize, usize, usize, usize)> {
        let x1 = (x as i64).max(0);
        let y1 = (y as i64).max(0);
        let x2 = (x as i64 + w as i64).min(self.width as i64);
        let y2 = (y as i64 + h as i64).min(self.height as i64);
        if x2 <= x1 || y2 <= y1 {
            return None
        }
        Some((x1 as usize, y1 as usize, x2 as usize, y2 as usize))
    }

    fn rows_mut(&mut self, x1: usize, y1: usize, x2: usize, y2: usize) -> impl Iterator<Item=&mut [u32]> {
        let pitch = self.width as usize;
        self.pixels.chunks_exact_mut(pitch).skip(y1).take(y2 - y1).map(move |row| &mut row[x1..x2])
    }

    pub fn clear(&mut self, color: i32) {
        self.pixels.fill(color as u32 | ALPHA);
        self.touch();
    }

    pub fn get_pixel(&self, x: i32, y: i32) -> i32 {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return 0
        }
        (self.pixels[y as usize * self.width as usize + x as usize] & 0xFF_FFFF) as i32
    }

    pub fn put_pixel(&mut self, x: i32, y: i32, color: i32) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return
        }
        self.pixels[y as usize * self.width as usize + x as usize] = color as u32 | ALPHA;
        self.touch();
    }

    pub fn fill_rect(&mut self, x: i32, y: i32, w: i32, h: i32, color: i32) {
        if let Some((x1, y1, x2, y2)) = self.clip(x, y, w, h) {
            for row in self.rows_mut(x1, y1, x2, y2) {
                row.fill(color as u32 | ALPHA);
            }
            self.touch();
        }
    }

    pub fn invert_rect(&mut self, x: i32, y: i32, w: i32, h: i32) {
        if let Some((x1, y1, x2, y2)) = self.clip(x, y, w, h) {
            for row in self.rows_mut(x1, y1, x2, y2) {
                for p in row.iter_mut() {
                    *p ^= 0xFF_FFFF;
                }
            }
            self.touch();
        }
    }
    /// Clips a copy of a `w` x `h` block between images of the given sizes.
    fn clip_blt(
            (dw, dh): (u32, u32), (sw, sh): (u32, u32),
            dx: i32, dy: i32, sx: i32, sy: i32, w: i32, h: i32
        ) -> Option<(usize, usize, usize, usize, usize, usize)>
    {
        let (mut dx, mut dy, mut sx, mut sy) = (dx as i64, dy as i64, sx as i64, sy as i64);
        let (mut w, mut h) = (w as i64, h as i64);
        if w <= 0 || h <= 0 {
            return None
        }
        let xoff = dx.min(sx).min(0);
        let yoff = dy.min(sy).min(0);
        dx -= xoff; sx -= xoff; w += xoff;
        dy -= yoff; sy -= yoff; h += yoff;
        w = w.min(dw as i64 - dx).min(sw as i64 - sx);
        h = h.min(dh as i64 - dy).min(sh as i64 - sy);
        if w <= 0 || h <= 0 {
            return None
        }
        Some((dx as usize, dy as usize, sx as usize, sy as usize, w as usize, h as usize))
    }
    /// Copies a block from another image, clipping both sides.
    pub fn blt(&mut self, dx: i32, dy: i32, src: &Image, sx: i32, sy: i32, w: i32, h: i32) {
        let (dx, dy, sx, sy, w, h) = match Self::clip_blt(
                (self.width, self.height), (src.width, src.height), dx, dy, sx, sy, w, h) {
            Some(clipped) => clipped,
            None => return
        };
        let (dpitch, spitch) = (self.width as usize, src.width as usize);
        for row in 0..h {
            let d = (dy + row) * dpitch + dx;
            let s = (sy + row) * spitch + sx;
            self.pixels[d..d + w].copy_from_slice(&src.pixels[s..s + w]);
        }
        self.touch();
    }
    /// Copies a block within the image, overlapping blocks included.
    pub fn blt_within(&mut self, dx: i32, dy: i32, sx: i32, sy: i32, w: i32, h: i32) {
        let size = (self.width, self.height);
        let (dx, dy, sx, sy, w, h) = match Self::clip_blt(size, size, dx, dy, sx, sy, w, h) {
            Some(clipped) => clipped,
            None => return
        };
        let pitch = self.width as usize;
        let pixels = &mut self.pixels;
        let mut copy_row = |row: usize| {
            let s = (sy + row) * pitch + sx;
            pixels.copy_within(s..s + w, (dy + row) * pitch + dx);
        };
        if dy > sy {
            (0..h).rev().for_each(&mut copy_row);
        }
        else {
            (0..h).for_each(&mut copy_row);
        }
        self.touch();
    }
    /// Expands a 1 bit per pixel bitmap, MSB first, into colors `c0` and `c1`.
    ///
    /// The destination must not be clipped. `pitch` may be negative for bottom-up bitmaps.
    pub fn blt_expand1(&mut self, dx: i32, dy: i32, src: &[u8], offset: i32, pitch: i32, w: i32, h: i32, c0: i32, c1: i32) {
        if w <= 0 || h <= 0 || dx < 0 || dy < 0 {
            return
        }
        if dx as u32 >= self.width || dy as u32 >= self.height
            || self.width - (dx as u32) < w as u32 || self.height - (dy as u32) < h as u32
        {
            return
        }
        let row_bytes = (w as i64 + 7) >> 3;
        let src_len = src.len() as i64;
        let offset = offset as i64;
        if offset < 0 || offset >= src_len || src_len - offset < row_bytes {
            return
        }
        let last_row = offset + pitch as i64 * (h as i64 - 1);
        if last_row < 0 || last_row > src_len - row_bytes {
            return
        }
        let (c0, c1) = (c0 as u32 | ALPHA, c1 as u32 | ALPHA);
        let dpitch = self.width as usize;
        let mut line = offset;
        for row in 0..h as usize {
            let d = (dy as usize + row) * dpitch + dx as usize;
            let bits = &src[line as usize..];
            for (x, p) in self.pixels[d..d + w as usize].iter_mut().enumerate() {
                let mask = 0x80u8 >> (x & 7);
                *p = if bits[x >> 3] & mask != 0 { c1 } else { c0 };
            }
            line += pitch as i64;
        }
        self.touch();
    }
    /// Draws a map of tiles. Tile `n` is the `n`th block of `tile_h` rows of `tiles`.
    pub fn blt_tile_map(
            &mut self,
            x: i32, y: i32,
            tiles: &Image,
            tile_w: i32, tile_h: i32,
            map: &[u8],
            map_offset: i32, map_skip: i32,
            map_w: i32, map_h: i32
        )
    {
        if tile_w <= 0 || tile_h <= 0 || map_w <= 0 || map_h <= 0 || x < 0 || y < 0 {
            return
        }
        if x as u32 >= self.width || y as u32 >= self.height {
            return
        }
        if x as u64 + tile_w as u64 * map_w as u64 > self.width as u64
            || y as u64 + tile_h as u64 * map_h as u64 > self.height as u64
        {
            return
        }
        if tiles.width < tile_w as u32 || (tiles.height as u64) < tile_h as u64 * 256 {
            return
        }
        if map_offset < 0 || map_skip < 0 || map_offset as usize >= map.len() {
            return
        }
        let map_pitch = map_w as u64 + map_skip as u64;
        let map_end = map_offset as u64 + map_w as u64 - 1 + map_pitch * (map_h as u64 - 1);
        if map_end >= map.len() as u64 {
            return
        }
        let (tile_w, tile_h) = (tile_w as usize, tile_h as usize);
        let (dpitch, spitch) = (self.width as usize, tiles.width as usize);
        for ty in 0..map_h as usize {
            let map_row = map_offset as usize + ty * map_pitch as usize;
            for tx in 0..map_w as usize {
                let tile = map[map_row + tx] as usize;
                for row in 0..tile_h {
                    let d = (y as usize + ty * tile_h + row) * dpitch + x as usize + tx * tile_w;
                    let s = (tile * tile_h + row) * spitch;
                    self.pixels[d..d + tile_w].copy_from_slice(&tiles.pixels[s..s + tile_w]);
                }
            }
        }
        self.touch();
    }
}

/// The state of a video output as seen by the display.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoInfo {
    pub signal_valid: bool,
    pub signal_pass_through: bool,
    pub horiz_scan_rate: f32,
    pub vert_scan_rate: f32,
    pub layout_change_count: u32,
    /// Changes whenever the frame buffer layout or contents change.
    pub change_count: u32,
    pub text_columns: i32,
    pub text_rows: i32,
    pub pixel_aspect_ratio: f64,
    pub display_area: Rect,
    pub border_color: u32,
}

impl Default for VideoInfo {
    fn default() -> Self {
        VideoInfo {
            signal_valid: false,
            signal_pass_through: false,
            horiz_scan_rate: 15735.0,
            vert_scan_rate: 60.0,
            layout_change_count: 0,
            change_count: 0,
            text_columns: 0,
            text_rows: 0,
            pixel_aspect_ratio: 1.0,
            display_area: Rect::new(0, 0, 1, 1),
            border_color: 0,
        }
    }
}

/// Where a video output copies its text from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextSource {
    pub segment: u32,
    pub offset: u32,
    pub skip: u32,
}

/// An extra display of the device, showing one of its images.
#[derive(Clone, Debug, Default)]
pub struct VideoOutput {
    pub name: String,
    pub display_name: String,
    /// Runs before the frame is presented.
    pub composite: Option<FunctionId>,
    /// Runs before text is copied from the output.
    pub pre_copy: Option<FunctionId>,
    pub image: Option<u32>,
    pub text_source: Option<TextSource>,
    info: VideoInfo,
    activity_counter: u32,
}

impl VideoOutput {
    pub fn new<S: Into<String>>(name: S, display_name: S) -> Self {
        VideoOutput { name: name.into(), display_name: display_name.into(), ..Default::default() }
    }

    pub fn set_par(&mut self, numerator: i32, denominator: i32) {
        if numerator > 0 && denominator > 0 {
            self.info.pixel_aspect_ratio = (numerator as f64 / denominator as f64).max(0.01).min(100.0);
        }
    }

    pub fn set_image(&mut self, index: u32, image: &Image) {
        self.image = Some(index);
        self.info.layout_change_count = self.info.layout_change_count.wrapping_add(1);
        self.info.signal_valid = true;
        self.info.display_area = Rect::new(0, 0, image.width() as i32, image.height() as i32);
    }

    pub fn mark_active(&mut self) {
        self.activity_counter |= 1;
    }

    pub fn set_pass_through(&mut self, enabled: i32) {
        self.info.signal_pass_through = enabled != 0;
    }

    pub fn set_text_area(&mut self, cols: i32, rows: i32) {
        if cols > 0 && rows > 0 {
            self.info.text_columns = cols.min(2048);
            self.info.text_rows = rows.min(2048);
        }
        else {
            self.info.text_columns = 0;
            self.info.text_rows = 0;
        }
    }

    pub fn set_copy_text_source(&mut self, segment: u32, seg_len: u32, offset: i32, skip: i32) {
        if offset >= 0 && (offset as u32) < seg_len && skip >= 0 {
            self.text_source = Some(TextSource { segment, offset: offset as u32, skip: skip as u32 });
        }
    }
    /// Returns the activity counter, acknowledging pending activity.
    pub fn activity_counter(&mut self) -> u32 {
        if self.activity_counter & 1 != 0 {
            self.activity_counter = self.activity_counter.wrapping_add(1);
        }
        self.activity_counter
    }
    /// Returns the current video info, acknowledging changes of the shown image.
    pub fn video_info(&mut self, image: Option<&mut Image>) -> VideoInfo {
        self.info.change_count = self.info.layout_change_count;
        if let Some(image) = image {
            self.info.change_count = self.info.change_count.wrapping_add(image.change_counter);
            if image.change_counter & 1 != 0 {
                image.change_counter = image.change_counter.wrapping_add(1);
            }
        }
        self.info.clone()
    }
    /// Maps a pixel to the text caret position it falls on.
    pub fn pixel_to_caret(&self, x: i32, y: i32) -> (i32, i32) {
        let area = &self.info.display_area;
        if area.is_empty() {
            return (0, 0)
        }
        let (cols, rows) = (self.info.text_columns, self.info.text_rows);
        let cx = ((x as f64 + 0.5 - area.left as f64) * cols as f64 / area.width() as f64).round() as i32;
        let cy = ((y as f64 + 0.5 - area.top as f64) * rows as f64 / area.height() as f64).floor() as i32;
        if cy < 0 {
            (0, 0)
        }
        else if cy >= rows {
            (cols, rows - 1)
        }
        else {
            (cx.max(0).min(cols), cy)
        }
    }
    /// Maps a rectangle of character cells to pixels.
    pub fn char_to_pixel_rect(&self, r: Rect) -> Rect {
        let area = &self.info.display_area;
        let (cols, rows) = (self.info.text_columns, self.info.text_rows);
        if area.is_empty() || cols <= 0 || rows <= 0 {
            return Rect::default()
        }
        let sx = area.width() as f64 / cols as f64;
        let sy = area.height() as f64 / rows as f64;
        Rect::new(
            area.left + (r.left as f64 * sx).round() as i32,
            area.top + (r.top as f64 * sy).round() as i32,
            area.left + (r.right as f64 * sx).round() as i32,
            area.top + (r.bottom as f64 * sy).round() as i32)
    }
    /// Copies up to `dst.len()` characters of row `y` starting at column `x` from the text source.
    pub fn copy_text(&self, source: &Segment, dst: &mut [u8], x: i32, y: i32) -> usize {
        let (cols, rows) = (self.info.text_columns, self.info.text_rows);
        let ts = match self.text_source {
            Some(ts) => ts,
            None => return 0
        };
        if x < 0 || y < 0 || x >= cols || y >= rows || ts.offset >= source.len() {
            return 0
        }
        let needed = rows as u64 * cols as u64 + ts.skip as u64 * (cols as u64 - 1);
        if ((source.len() - ts.offset) as u64) < needed {
            return 0
        }
        let n = dst.len().min((cols - x) as usize);
        let start = ts.offset + (cols as u32 + ts.skip) * y as u32 + x as u32;
        match source.read_slice(start, n as u32) {
            Some(text) => {
                dst[..n].copy_from_slice(&text);
                n
            }
            None => 0
        }
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }
}

/// Playback parameters of sounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SoundParams {
    /// From -1 (left) to 1 (right).
    pub pan: f32,
    pub volume: f32,
    pub rate: f32,
    pub looping: bool,
}

impl Default for SoundParams {
    fn default() -> Self {
        SoundParams { pan: 0.0, volume: 1.0, rate: 1.0, looping: false }
    }
}

impl SoundParams {
    pub fn set_pan(&mut self, x: i32, y: i32) {
        self.pan = if y == 0 { 0.0 } else { (x as f32 / y as f32).max(-1.0).min(1.0) };
    }

    pub fn set_volume(&mut self, x: i32, y: i32) {
        self.volume = if y <= 0 || x >= y {
            1.0
        }
        else if x < 0 {
            0.0
        }
        else {
            x as f32 / y as f32
        };
    }

    pub fn set_rate(&mut self, x: i32, y: i32) {
        self.rate = if x < 0 || y <= 0 { 1.0 } else { (x as f32 / y as f32).max(0.1).min(10.0) };
    }

    pub fn set_looping(&mut self, enabled: i32) {
        self.looping = enabled != 0;
    }
}

/// A mono sound sample the host plays on request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sound {
    pub name: String,
    /// The resolved path of the sample file.
    pub source_file: String,
    pub samples: Vec<i16>,
    pub sample_rate: f32,
}

/// Wall clock time captured for scripts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocalClock {
    captured_at: Option<Ticks>,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    /// Days since Sunday.
    pub day_of_week: i32,
    pub hour: i32,
    pub minute: i32,
    pub second: i32,
}

impl LocalClock {
    /// Captures the local time, at most once per emulated cycle.
    pub fn capture(&mut self, now: Ticks) {
        if self.captured_at != Some(now) {
            self.captured_at = Some(now);
            self.set_time(Local::now().naive_local());
        }
    }

    pub fn set_time(&mut self, time: NaiveDateTime) {
        self.year = time.year();
        self.month = time.month() as i32;
        self.day = time.day() as i32;
        self.day_of_week = time.weekday().num_days_from_sunday() as i32;
        self.hour = time.hour() as i32;
        self.minute = time.minute() as i32;
        self.second = time.second() as i32;
    }

    pub fn reset(&mut self) {
        *self = LocalClock::default();
    }
}

/// Running sums of raw SIO bytes sent and received by scripts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SioChecksums {
    pub send: u32,
    pub recv: u32,
    pub recv_last: u8,
}

/// Folds a plain byte sum into an SIO end-around-carry checksum.
fn fold_checksum(sum: u32) -> u32 {
    if sum == 0 { 0 } else { (sum - 1) % 255 + 1 }
}

impl SioChecksums {
    pub fn reset(&mut self) {
        *self = SioChecksums::default();
    }

    pub fn add_sent(&mut self, byte: u8) {
        self.send = self.send.wrapping_add(byte as u32);
    }

    pub fn add_received(&mut self, byte: u8) {
        self.recv = self.recv.wrapping_add(byte as u32);
        self.recv_last = byte;
    }

    pub fn reset_recv(&mut self) {
        self.recv = 0;
        self.recv_last = 0;
    }

    pub fn recv_checksum(&self) -> i32 {
        fold_checksum(self.recv) as i32
    }

    pub fn send_checksum(&self) -> i32 {
        fold_checksum(self.send) as i32
    }
    /// Returns `true` if the last byte received is the checksum of the ones before it.
    pub fn check_recv(&self) -> bool {
        let computed = fold_checksum(self.recv.wrapping_sub(self.recv_last as u32)) as u8;
        self.recv_last == computed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atarusty_peripherals::sio::sio_checksum;

    fn seg(bytes: &[u8]) -> Segment {
        Segment::new("s", bytes.len() as u32, InitPattern::Bytes(bytes.to_vec()), false)
    }

    #[test]
    fn init_patterns_fill_segments() {
        let s = Segment::new("a", 7, InitPattern::from_bytes(vec![0x34, 0x12]), false);
        assert_eq!(s.to_vec(), [0x34, 0x12, 0x34, 0x12, 0x34, 0x12, 0x34]);
        let s = Segment::new("b", 6, InitPattern::from_bytes(vec![1, 2, 3, 4]), false);
        assert_eq!(s.to_vec(), [1, 2, 3, 4, 1, 2]);
        let s = Segment::new("c", 8, InitPattern::from_bytes(vec![9, 8, 7]), false);
        assert_eq!(s.to_vec(), [9, 8, 7, 9, 8, 7, 9, 8]);
        let s = Segment::new("d", 3, InitPattern::default(), true);
        s.fill(0, 0x55, 3);
        assert_eq!(s.to_vec(), [0x55; 3]);
        s.reinit();
        assert_eq!(s.to_vec(), [0; 3]);
        assert_eq!(InitPattern::from_bytes(vec![5]), InitPattern::Byte(5));
    }

    #[test]
    fn segment_methods_check_bounds() {
        let s = seg(&[0x01, 0x80, 0xF0, 0x0F]);
        s.reverse_bits(1, 2);
        assert_eq!(s.to_vec(), [0x01, 0x01, 0x0F, 0x0F]);
        s.xor_const(0, 0xFF, 4);
        assert_eq!(s.to_vec(), [0xFE, 0xFE, 0xF0, 0xF0]);
        s.fill(2, 0, 3);
        s.fill(-1, 0, 1);
        s.fill(4, 0, 1);
        assert_eq!(s.to_vec(), [0xFE, 0xFE, 0xF0, 0xF0]);
        s.write_word(0, 0x1234);
        assert_eq!(s.read_word(0), 0x1234);
        assert_eq!(s.read_rev_word(0), 0x3412);
        s.write_rev_word(2, 0xABCD);
        assert_eq!(s.to_vec(), [0x34, 0x12, 0xAB, 0xCD]);
        assert_eq!(s.read_word(3), 0);
        assert_eq!(s.read_byte(4), 0);
        assert_eq!(s.read_byte(-1), 0);
        s.write_byte(4, 1);
        assert_eq!(s.get_length(), 4);

        let mut frame = Segment::sio_frame();
        frame.set_data(&[1, 2, 3]);
        frame.clear(0);
        frame.write_byte(0, 9);
        assert_eq!(frame.to_vec(), [1, 2, 3]);
    }

    #[test]
    fn segment_copies_handle_overlap() {
        let s = seg(&[1, 2, 3, 4, 5, 6, 7, 8]);
        s.copy(2, &s, 0, 4);
        assert_eq!(s.to_vec(), [1, 2, 1, 2, 3, 4, 7, 8]);
        let d = seg(&[0; 4]);
        d.copy(1, &s, 5, 3);
        assert_eq!(d.to_vec(), [0, 4, 7, 8]);
        d.copy(2, &s, 0, 3);
        assert_eq!(d.to_vec(), [0, 4, 7, 8]);

        // 2x2 block moved down one row in a 4 byte pitch
        let s = seg(&[1, 2, 0, 0, 3, 4, 0, 0, 0, 0, 0, 0]);
        s.copy_rect(4, 2, &s, 0, 2, 2, 2);
        assert_eq!(s.to_vec(), [1, 2, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0]);
        let d = seg(&[0; 6]);
        d.copy_rect(0, 1, &s, 4, 2, 2, 2);
        assert_eq!(d.to_vec(), [1, 2, 0, 3, 4, 0]);
        d.copy_rect(0, 1, &s, 4, 2, 2, 3);
        assert_eq!(d.to_vec(), [1, 2, 0, 3, 4, 0]);
    }

    #[test]
    fn segment_translates() {
        let table: Vec<u8> = (0..=255u8).map(|v| v.wrapping_add(1)).collect();
        let t = seg(&table);
        let s = seg(&[0, 1, 0xFF]);
        let d = seg(&[0; 3]);
        d.translate(0, &s, 0, 3, &t, 0);
        assert_eq!(d.to_vec(), [1, 2, 0]);
        s.translate(0, &s, 0, 3, &t, 0);
        assert_eq!(s.to_vec(), [1, 2, 0]);
        // a source shifted over the destination is rejected
        s.translate(1, &s, 0, 2, &t, 0);
        assert_eq!(s.to_vec(), [1, 2, 0]);
        // the table must fit
        d.translate(0, &s, 0, 3, &t, 1);
        assert_eq!(d.to_vec(), [1, 2, 0]);
    }

    #[test]
    fn layers_follow_conditions() {
        let mut ml = MemoryLayer {
            layer: None,
            address: 0xD600,
            size: 0x100,
            segment: Some(0),
            max_offset: 0x300,
            enabled_modes: AccessMode::ARW,
            auto_enable: AutoEnable::Pbi,
            ..Default::default()
        };
        let mut cond = AutoConditions::default();
        assert_eq!(ml.effective_modes(&cond), AccessMode::empty());
        cond.pbi_selected = true;
        assert_eq!(ml.effective_modes(&cond), AccessMode::ARW);
        assert!(!ml.set_offset(0x100));
        assert!(ml.contains(0xD6FF));
        assert!(!ml.contains(0xD700));
        assert!(!ml.contains(0xD5FF));
    }

    #[test]
    fn images_draw_with_clipping() {
        let mut img = Image::new(4, 3);
        assert_eq!(img.get_pixel(0, 0), 0xFF00FF);
        img.clear(0);
        img.fill_rect(-1, -1, 3, 3, 0x123456);
        assert_eq!(img.get_pixel(1, 1), 0x123456);
        assert_eq!(img.get_pixel(2, 1), 0);
        img.invert_rect(1, 1, 10, 10);
        assert_eq!(img.get_pixel(1, 1), 0xEDCBA9);
        assert_eq!(img.get_pixel(3, 2), 0xFFFFFF);
        assert_eq!(img.change_counter & 1, 1);

        let mut src = Image::new(2, 2);
        src.put_pixel(0, 0, 0x11);
        src.put_pixel(1, 1, 0x22);
        img.clear(0);
        img.blt(3, -1, &src, 0, 0, 2, 2);
        assert_eq!(img.get_pixel(3, 0), 0xFF00FF);
        assert_eq!(img.get_pixel(3, 1), 0);
        img.blt(-1, 0, &src, 0, 0, 2, 2);
        assert_eq!(img.get_pixel(0, 1), 0x22);
        assert_eq!(img.get_pixel(0, 0), 0xFF00FF);
        img.blt_within(1, 1, 0, 0, 4, 4);
        assert_eq!(img.get_pixel(1, 2), 0x22);
    }

    #[test]
    fn images_expand_bitmaps_and_tiles() {
        let mut img = Image::new(10, 2);
        img.blt_expand1(0, 0, &[0b1010_0000, 0b1000_0000, 0xFF, 0xFF], 0, 2, 10, 2, 0x000000, 0xFFFFFF);
        assert_eq!(img.get_pixel(0, 0), 0xFFFFFF);
        assert_eq!(img.get_pixel(1, 0), 0);
        assert_eq!(img.get_pixel(8, 0), 0xFFFFFF);
        assert_eq!(img.get_pixel(9, 0), 0);
        assert_eq!(img.get_pixel(9, 1), 0xFFFFFF);
        // destination clipping rejects
        let before = img.clone();
        img.blt_expand1(5, 0, &[0xFF, 0xFF], 0, 0, 10, 1, 0, 0);
        assert_eq!(img, before);

        let mut tiles = Image::new(1, 256);
        for t in 0..256 {
            tiles.put_pixel(0, t, t);
        }
        let mut screen = Image::new(3, 2);
        screen.blt_tile_map(0, 0, &tiles, 1, 1, &[7, 8, 9, 0xEE, 10, 11, 12], 0, 1, 3, 2);
        assert_eq!(screen.get_pixel(2, 0), 9);
        assert_eq!(screen.get_pixel(0, 1), 10);
        assert_eq!(screen.get_pixel(2, 1), 12);
    }

    #[test]
    fn video_output_tracks_changes() {
        let mut img = Image::new(8, 4);
        let mut vo = VideoOutput::new("vo", "Video");
        assert!(!vo.info().signal_valid);
        vo.set_image(0, &img);
        let info = vo.video_info(Some(&mut img));
        assert!(info.signal_valid);
        assert_eq!(info.display_area, Rect::new(0, 0, 8, 4));
        let first = info.change_count;
        img.put_pixel(0, 0, 1);
        let second = vo.video_info(Some(&mut img)).change_count;
        assert_ne!(first, second);
        assert_eq!(vo.video_info(Some(&mut img)).change_count, second + 1);
        assert_eq!(vo.video_info(Some(&mut img)).change_count, second + 1);

        vo.set_text_area(4, 2);
        assert_eq!(vo.pixel_to_caret(0, 0), (0, 0));
        assert_eq!(vo.pixel_to_caret(7, 3), (4, 1));
        assert_eq!(vo.char_to_pixel_rect(Rect::new(1, 1, 2, 2)), Rect::new(2, 2, 4, 4));
        let text = seg(b"ab..cd..");
        let mut buf = [0u8; 8];
        assert_eq!(vo.copy_text(&text, &mut buf, 0, 0), 0);
        vo.set_text_area(2, 2);
        vo.set_copy_text_source(0, text.len(), 0, 2);
        assert_eq!(vo.copy_text(&text, &mut buf, 0, 1), 2);
        assert_eq!(&buf[..2], b"cd");
        vo.mark_active();
        assert_eq!(vo.activity_counter(), 2);
        assert_eq!(vo.activity_counter(), 2);
    }

    #[test]
    fn sound_params_clamp() {
        let mut p = SoundParams::default();
        p.set_pan(-3, 2);
        assert_eq!(p.pan, -1.0);
        p.set_volume(1, 4);
        assert_eq!(p.volume, 0.25);
        p.set_volume(5, 4);
        assert_eq!(p.volume, 1.0);
        p.set_rate(1, 100);
        assert_eq!(p.rate, 0.1);
        p.set_rate(-1, 1);
        assert_eq!(p.rate, 1.0);
    }

    #[test]
    fn clock_captures_once_per_cycle() {
        let mut clock = LocalClock::default();
        clock.set_time(NaiveDate::from_ymd_opt(2021, 3, 14).unwrap().and_hms_opt(15, 9, 26).unwrap());
        assert_eq!((clock.year, clock.month, clock.day), (2021, 3, 14));
        assert_eq!(clock.day_of_week, 0);
        assert_eq!((clock.hour, clock.minute, clock.second), (15, 9, 26));
        clock.capture(5);
        let year = clock.year;
        clock.year = -1;
        clock.capture(5);
        assert_eq!(clock.year, -1);
        clock.capture(6);
        assert!(clock.year >= year);
    }

    #[test]
    fn checksums_match_sio_frames() {
        let frame = [0x31, 0x52, 0xFF, 0xFF, 0x80, 0x90];
        let mut sums = SioChecksums::default();
        for &b in frame.iter() {
            sums.add_sent(b);
            sums.add_received(b);
        }
        assert_eq!(sums.send_checksum(), sio_checksum(&frame) as i32);
        assert!(!sums.check_recv());
        sums.add_received(sio_checksum(&frame));
        assert!(sums.check_recv());
        sums.reset_recv();
        assert_eq!(sums.recv_checksum(), 0);
        assert!(sums.check_recv());
    }
}
