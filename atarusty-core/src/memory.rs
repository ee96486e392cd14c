/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Layered address space.
//!
//! The 64 KiB address space of the host machine is composed of *layers*. Each layer covers a
//! range of 256-byte pages and is either backed by a flat byte buffer ([SharedMemory]) or by a
//! [MemoryHandler]. Accesses resolve by walking the layers enabled for the requested mode in
//! priority order (highest first). Unmapped reads return `0xFF`.
use core::cell::{Ref, RefCell, RefMut};
use core::fmt;
use std::io;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

#[cfg(feature = "snapshot")] pub mod serde;

bitflags::bitflags! {
    /// Access modes a layer may be enabled for.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessMode: u8 {
        /// Video DMA reads.
        const ANTIC = 0b001;
        /// CPU reads.
        const READ  = 0b010;
        /// CPU writes.
        const WRITE = 0b100;
        const AR    = Self::ANTIC.bits() | Self::READ.bits();
        const ARW   = Self::AR.bits() | Self::WRITE.bits();
        const W     = Self::WRITE.bits();
    }
}

/// The number of 256-byte pages in the address space.
pub const PAGE_COUNT: usize = 256;
/// The value returned when no layer responds to a read.
pub const OPEN_BUS: u8 = 0xFF;

pub const PRI_BASE_MEMORY: u8 = 0;
pub const PRI_EXTENDED_RAM: u8 = 4;
pub const PRI_ROM: u8 = 8;
pub const PRI_SELF_TEST: u8 = 12;
pub const PRI_CARTRIDGE2: u8 = 16;
pub const PRI_CARTRIDGE1: u8 = 20;
pub const PRI_PBI_SELECT: u8 = 24;
pub const PRI_PBI: u8 = 28;
pub const PRI_EXTSEL: u8 = 32;
pub const PRI_HARDWARE: u8 = 40;
pub const PRI_HARDWARE_OVERLAY: u8 = 44;

#[non_exhaustive]
#[derive(Debug)]
pub enum MemoryError {
    InvalidLayer,
    InvalidAddressRange,
    InvalidMaskRange,
    MemoryTooSmall,
}

impl std::error::Error for MemoryError {}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            MemoryError::InvalidLayer => "Memory layer handle is not valid",
            MemoryError::InvalidAddressRange => "Memory layer page range is out of the address space",
            MemoryError::InvalidMaskRange => "Memory layer mask range is out of the address space",
            MemoryError::MemoryTooSmall => "Memory buffer is smaller than the layer's page range",
        })
    }
}

impl From<MemoryError> for io::Error {
    fn from(err: MemoryError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// An interface to memory-mapped registers.
///
/// Each method either produces a value or passes the access through to lower priority layers by
/// returning `None` (`false` for writes).
pub trait MemoryHandler {
    /// Must never produce side effects. Implementations that can't satisfy this should pass through.
    fn debug_read(&mut self, _addr: u16) -> Option<u8> {
        None
    }
    fn read(&mut self, _addr: u16) -> Option<u8> {
        None
    }
    /// Returns `true` if the write was consumed.
    fn write(&mut self, _addr: u16, _value: u8) -> bool {
        false
    }
}

/// A shared memory handler.
pub type SharedHandler = Rc<RefCell<dyn MemoryHandler>>;

/// A flat byte buffer shared between the memory manager and its owner.
#[derive(Clone, Default)]
pub struct SharedMemory(Rc<RefCell<Box<[u8]>>>);

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedMemory").field(&self.len()).finish()
    }
}

impl SharedMemory {
    /// Creates a buffer of `len` bytes filled with `fill`.
    pub fn new(len: usize, fill: u8) -> Self {
        SharedMemory::from(vec![fill; len])
    }
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    #[inline]
    pub fn read(&self, index: usize) -> u8 {
        self.0.borrow().get(index).copied().unwrap_or(OPEN_BUS)
    }
    #[inline]
    pub fn write(&self, index: usize, value: u8) {
        if let Some(p) = self.0.borrow_mut().get_mut(index) {
            *p = value;
        }
    }
    pub fn borrow(&self) -> Ref<'_, Box<[u8]>> {
        self.0.borrow()
    }
    pub fn borrow_mut(&self) -> RefMut<'_, Box<[u8]>> {
        self.0.borrow_mut()
    }
    /// Returns `true` if both handles point to the same buffer.
    pub fn ptr_eq(&self, other: &SharedMemory) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<u8>> for SharedMemory {
    fn from(vec: Vec<u8>) -> Self {
        SharedMemory(Rc::new(RefCell::new(vec.into_boxed_slice())))
    }
}

/// A handle to a memory layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayerId(u32);

#[derive(Clone)]
enum Backing {
    Memory { mem: SharedMemory, offset: usize },
    Handler(SharedHandler),
}

#[derive(Clone)]
struct Layer {
    priority: u8,
    serial: u32,
    page_base: u16,
    page_count: u16,
    mask: Option<(u16, u16)>,
    modes: AccessMode,
    read_only: bool,
    backing: Backing,
    name: String,
}

impl Layer {
    fn effective_pages(&self) -> (u16, u16) {
        let start = self.page_base;
        let end = self.page_base + self.page_count;
        match self.mask {
            Some((mstart, mcount)) => {
                let s = start.max(mstart);
                let e = end.min(mstart + mcount);
                if s < e { (s, e) } else { (0, 0) }
            }
            None => (start, end)
        }
    }
}

/// A snapshot of a layer's settings.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerInfo {
    pub priority: u8,
    pub page_base: u8,
    pub page_count: u16,
    pub modes: AccessMode,
    pub read_only: bool,
    pub mask: Option<(u16, u16)>,
    pub name: String,
    pub is_handler: bool,
}

/// The layered memory manager.
#[derive(Default)]
pub struct MemoryManager {
    layers: Vec<Option<Layer>>,
    serial: u32,
    read_map: Vec<Vec<u32>>,
    antic_map: Vec<Vec<u32>>,
    write_map: Vec<Vec<u32>>,
    dirty: bool,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
         .field("layers", &self.layers.iter().filter(|l| l.is_some()).count())
         .finish()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        MemoryManager {
            read_map: vec![Vec::new(); PAGE_COUNT],
            antic_map: vec![Vec::new(); PAGE_COUNT],
            write_map: vec![Vec::new(); PAGE_COUNT],
            ..Default::default()
        }
    }
    /// Creates a layer backed by a flat byte buffer starting at `offset`.
    ///
    /// The layer is created disabled.
    pub fn create_memory_layer(
            &mut self,
            priority: u8,
            mem: SharedMemory,
            offset: usize,
            page_base: u8,
            page_count: u16,
            read_only: bool
        ) -> Result<LayerId, MemoryError>
    {
        Self::check_range(page_base as u16, page_count)?;
        if offset + ((page_count as usize) << 8) > mem.len() {
            return Err(MemoryError::MemoryTooSmall)
        }
        Ok(self.insert(Layer {
            priority, serial: 0,
            page_base: page_base as u16, page_count,
            mask: None,
            modes: AccessMode::empty(),
            read_only,
            backing: Backing::Memory { mem, offset },
            name: String::new()
        }))
    }
    /// Creates a layer dispatching accesses to a handler.
    ///
    /// The layer is created disabled.
    pub fn create_handler_layer(
            &mut self,
            priority: u8,
            handler: SharedHandler,
            page_base: u8,
            page_count: u16
        ) -> Result<LayerId, MemoryError>
    {
        Self::check_range(page_base as u16, page_count)?;
        Ok(self.insert(Layer {
            priority, serial: 0,
            page_base: page_base as u16, page_count,
            mask: None,
            modes: AccessMode::empty(),
            read_only: false,
            backing: Backing::Handler(handler),
            name: String::new()
        }))
    }
    /// Removes a layer.
    pub fn delete_layer(&mut self, id: LayerId) {
        if let Some(slot) = self.layers.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.dirty = true;
            }
        }
    }
    /// Enables or disables the layer for the given access `modes`.
    pub fn enable_layer(&mut self, id: LayerId, modes: AccessMode, enable: bool) -> Result<(), MemoryError> {
        let layer = self.layer_mut(id)?;
        let new_modes = if enable { layer.modes | modes } else { layer.modes - modes };
        if new_modes != layer.modes {
            layer.modes = new_modes;
            self.dirty = true;
        }
        Ok(())
    }
    /// Sets the exact set of access modes the layer is enabled for.
    pub fn set_layer_modes(&mut self, id: LayerId, modes: AccessMode) -> Result<(), MemoryError> {
        let layer = self.layer_mut(id)?;
        if layer.modes != modes {
            layer.modes = modes;
            self.dirty = true;
        }
        Ok(())
    }
    /// Re-points a memory layer at a buffer and offset. Calling it twice with the same arguments
    /// is the same as calling it once.
    pub fn set_layer_memory(&mut self, id: LayerId, mem: SharedMemory, offset: usize) -> Result<(), MemoryError> {
        let layer = self.layer_mut(id)?;
        if offset + ((layer.page_count as usize) << 8) > mem.len() {
            return Err(MemoryError::MemoryTooSmall)
        }
        layer.backing = Backing::Memory { mem, offset };
        Ok(())
    }
    /// Changes the offset into the current backing buffer of a memory layer.
    pub fn set_layer_memory_offset(&mut self, id: LayerId, offset: usize) -> Result<(), MemoryError> {
        let layer = self.layer_mut(id)?;
        let page_bytes = (layer.page_count as usize) << 8;
        match &mut layer.backing {
            Backing::Memory { mem, offset: off } => {
                if offset + page_bytes > mem.len() {
                    return Err(MemoryError::MemoryTooSmall)
                }
                *off = offset;
                Ok(())
            }
            Backing::Handler(..) => Err(MemoryError::InvalidLayer)
        }
    }
    pub fn set_layer_read_only(&mut self, id: LayerId, read_only: bool) -> Result<(), MemoryError> {
        self.layer_mut(id)?.read_only = read_only;
        Ok(())
    }
    /// Moves the layer to a new page range.
    pub fn set_layer_address_range(&mut self, id: LayerId, page_base: u8, page_count: u16) -> Result<(), MemoryError> {
        Self::check_range(page_base as u16, page_count)?;
        let layer = self.layer_mut(id)?;
        if let Backing::Memory { mem, offset } = &layer.backing {
            if offset + ((page_count as usize) << 8) > mem.len() {
                return Err(MemoryError::MemoryTooSmall)
            }
        }
        layer.page_base = page_base as u16;
        layer.page_count = page_count;
        self.dirty = true;
        Ok(())
    }
    /// Restricts the layer to a sub-range of pages, e.g. to overlay only a part of a larger window.
    pub fn set_layer_mask_range(&mut self, id: LayerId, page_start: u8, page_count: u16) -> Result<(), MemoryError> {
        if page_start as usize + page_count as usize > PAGE_COUNT {
            return Err(MemoryError::InvalidMaskRange)
        }
        self.layer_mut(id)?.mask = Some((page_start as u16, page_count));
        self.dirty = true;
        Ok(())
    }
    pub fn clear_layer_mask_range(&mut self, id: LayerId) -> Result<(), MemoryError> {
        self.layer_mut(id)?.mask = None;
        self.dirty = true;
        Ok(())
    }
    pub fn set_layer_name<S: Into<String>>(&mut self, id: LayerId, name: S) -> Result<(), MemoryError> {
        self.layer_mut(id)?.name = name.into();
        Ok(())
    }
    pub fn layer_info(&self, id: LayerId) -> Option<LayerInfo> {
        let layer = self.layers.get(id.0 as usize)?.as_ref()?;
        Some(LayerInfo {
            priority: layer.priority,
            page_base: layer.page_base as u8,
            page_count: layer.page_count,
            modes: layer.modes,
            read_only: layer.read_only,
            mask: layer.mask,
            name: layer.name.clone(),
            is_handler: matches!(layer.backing, Backing::Handler(..)),
        })
    }
    /// A CPU read.
    pub fn read_byte(&mut self, addr: u16) -> u8 {
        self.read_with(addr, AccessKind::Read)
    }
    /// A side-effect free read for debuggers.
    pub fn debug_read_byte(&mut self, addr: u16) -> u8 {
        self.read_with(addr, AccessKind::Debug)
    }
    /// A video DMA read.
    pub fn antic_read_byte(&mut self, addr: u16) -> u8 {
        self.read_with(addr, AccessKind::Antic)
    }
    /// A CPU write.
    pub fn write_byte(&mut self, addr: u16, value: u8) {
        self.rebuild();
        let page = (addr >> 8) as usize;
        for &index in self.write_map[page].iter() {
            let layer = match &self.layers[index as usize] {
                Some(layer) => layer,
                None => continue
            };
            match &layer.backing {
                Backing::Memory { mem, offset } => {
                    if !layer.read_only {
                        mem.write(offset + (addr as usize - ((layer.page_base as usize) << 8)), value);
                    }
                    return
                }
                Backing::Handler(handler) => {
                    if handler.borrow_mut().write(addr, value) {
                        return
                    }
                }
            }
        }
    }

    fn read_with(&mut self, addr: u16, kind: AccessKind) -> u8 {
        self.rebuild();
        let page = (addr >> 8) as usize;
        let map = match kind {
            AccessKind::Antic => &self.antic_map[page],
            _ => &self.read_map[page],
        };
        for &index in map.iter() {
            let layer = match &self.layers[index as usize] {
                Some(layer) => layer,
                None => continue
            };
            match &layer.backing {
                Backing::Memory { mem, offset } => {
                    return mem.read(offset + (addr as usize - ((layer.page_base as usize) << 8)))
                }
                Backing::Handler(handler) => {
                    let res = match handler.try_borrow_mut() {
                        Ok(mut h) => match kind {
                            AccessKind::Debug => h.debug_read(addr),
                            _ => h.read(addr)
                        }
                        Err(_) => None
                    };
                    if let Some(value) = res {
                        return value
                    }
                }
            }
        }
        OPEN_BUS
    }

    fn check_range(page_base: u16, page_count: u16) -> Result<(), MemoryError> {
        if page_count == 0 || page_base as usize + page_count as usize > PAGE_COUNT {
            return Err(MemoryError::InvalidAddressRange)
        }
        Ok(())
    }

    fn insert(&mut self, mut layer: Layer) -> LayerId {
        self.serial += 1;
        layer.serial = self.serial;
        self.dirty = true;
        if let Some(index) = self.layers.iter().position(Option::is_none) {
            self.layers[index] = Some(layer);
            LayerId(index as u32)
        }
        else {
            self.layers.push(Some(layer));
            LayerId((self.layers.len() - 1) as u32)
        }
    }

    fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer, MemoryError> {
        self.layers.get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(MemoryError::InvalidLayer)
    }

    fn rebuild(&mut self) {
        if self.read_map.len() != PAGE_COUNT {
            self.read_map = vec![Vec::new(); PAGE_COUNT];
            self.antic_map = vec![Vec::new(); PAGE_COUNT];
            self.write_map = vec![Vec::new(); PAGE_COUNT];
            self.dirty = true;
        }
        if !self.dirty {
            return
        }
        self.dirty = false;
        for map in self.read_map.iter_mut().chain(self.antic_map.iter_mut()).chain(self.write_map.iter_mut()) {
            map.clear();
        }
        let mut order: Vec<u32> = self.layers.iter().enumerate()
                                  .filter_map(|(i, l)| l.as_ref().map(|_| i as u32))
                                  .collect();
        // highest priority first, later layers win ties
        order.sort_by_key(|&i| {
            let layer = self.layers[i as usize].as_ref().map(|l| (l.priority, l.serial)).unwrap_or_default();
            core::cmp::Reverse(layer)
        });
        for index in order {
            let layer = match &self.layers[index as usize] {
                Some(layer) => layer,
                None => continue
            };
            let (start, end) = layer.effective_pages();
            for page in start..end {
                let page = page as usize;
                if layer.modes.contains(AccessMode::READ) {
                    self.read_map[page].push(index);
                }
                if layer.modes.contains(AccessMode::ANTIC) {
                    self.antic_map[page].push(index);
                }
                if layer.modes.contains(AccessMode::WRITE) {
                    self.write_map[page].push(index);
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum AccessKind {
    Read,
    Debug,
    Antic,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};

    #[derive(Default)]
    struct Register {
        value: u8,
        reads: u32,
        writes: u32,
    }

    impl MemoryHandler for Register {
        fn debug_read(&mut self, addr: u16) -> Option<u8> {
            if addr == 0xD500 { Some(self.value) } else { None }
        }
        fn read(&mut self, addr: u16) -> Option<u8> {
            if addr == 0xD500 {
                self.reads += 1;
                Some(self.value)
            }
            else {
                None
            }
        }
        fn write(&mut self, addr: u16, value: u8) -> bool {
            if addr == 0xD500 {
                self.writes += 1;
                self.value = value;
                true
            }
            else {
                false
            }
        }
    }

    #[test]
    fn memory_unmapped_reads_open_bus() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut mm = MemoryManager::new();
        for _ in 0..256 {
            let addr: u16 = rng.gen();
            assert_eq!(mm.read_byte(addr), OPEN_BUS);
            assert_eq!(mm.debug_read_byte(addr), OPEN_BUS);
            mm.write_byte(addr, rng.gen());
        }
        assert!(mm.layers.is_empty());
    }

    #[test]
    fn memory_layers_resolve_by_priority() {
        let mut mm = MemoryManager::new();
        let ram = SharedMemory::new(0x10000, 0);
        let rom = SharedMemory::new(0x2000, 0xA5);
        let ram_id = mm.create_memory_layer(PRI_BASE_MEMORY, ram.clone(), 0, 0, 256, false).unwrap();
        mm.set_layer_modes(ram_id, AccessMode::ARW).unwrap();
        let rom_id = mm.create_memory_layer(PRI_CARTRIDGE1, rom, 0, 0xA0, 0x20, true).unwrap();
        mm.enable_layer(rom_id, AccessMode::ARW, true).unwrap();
        mm.write_byte(0x1234, 7);
        assert_eq!(mm.read_byte(0x1234), 7);
        assert_eq!(ram.read(0x1234), 7);
        assert_eq!(mm.read_byte(0xA000), 0xA5);
        // read-only layer swallows the write
        mm.write_byte(0xA000, 1);
        assert_eq!(mm.read_byte(0xA000), 0xA5);
        assert_eq!(ram.read(0xA000), 0);
        // write-only enable makes reads fall through to RAM
        mm.set_layer_modes(rom_id, AccessMode::W).unwrap();
        assert_eq!(mm.read_byte(0xA000), 0);
        mm.enable_layer(rom_id, AccessMode::ARW, false).unwrap();
        mm.write_byte(0xA000, 3);
        assert_eq!(ram.read(0xA000), 3);
    }

    #[test]
    fn memory_handler_pass_through_works() {
        let mut mm = MemoryManager::new();
        let ram = SharedMemory::new(0x100, 0x11);
        let ram_id = mm.create_memory_layer(PRI_BASE_MEMORY, ram.clone(), 0, 0xD5, 1, false).unwrap();
        mm.set_layer_modes(ram_id, AccessMode::ARW).unwrap();
        let reg = Rc::new(RefCell::new(Register::default()));
        let id = mm.create_handler_layer(PRI_HARDWARE, reg.clone(), 0xD5, 1).unwrap();
        mm.set_layer_modes(id, AccessMode::ARW).unwrap();
        mm.write_byte(0xD500, 0x42);
        mm.write_byte(0xD501, 0x43);
        assert_eq!(mm.read_byte(0xD500), 0x42);
        assert_eq!(mm.debug_read_byte(0xD500), 0x42);
        assert_eq!(mm.read_byte(0xD501), 0x43);
        assert_eq!(reg.borrow().reads, 1);
        assert_eq!(reg.borrow().writes, 1);
        assert_eq!(ram.read(0), 0x11);
        assert_eq!(ram.read(1), 0x43);
    }

    #[test]
    fn memory_mask_and_range_work() {
        let mut mm = MemoryManager::new();
        let mem = SharedMemory::from((0..0x4000).map(|i| (i >> 8) as u8).collect::<Vec<_>>());
        let id = mm.create_memory_layer(PRI_CARTRIDGE1, mem.clone(), 0, 0x80, 0x40, true).unwrap();
        mm.set_layer_modes(id, AccessMode::AR).unwrap();
        assert_eq!(mm.read_byte(0x8100), 1);
        mm.set_layer_mask_range(id, 0xA0, 0x20).unwrap();
        assert_eq!(mm.read_byte(0x8100), OPEN_BUS);
        assert_eq!(mm.read_byte(0xA100), 0x21);
        mm.clear_layer_mask_range(id).unwrap();
        mm.set_layer_address_range(id, 0x40, 0x20).unwrap();
        assert_eq!(mm.read_byte(0x8100), OPEN_BUS);
        assert_eq!(mm.read_byte(0x4100), 1);
        mm.set_layer_memory_offset(id, 0x2000).unwrap();
        assert_eq!(mm.read_byte(0x4100), 0x21);
        assert!(mm.set_layer_memory_offset(id, 0x2100).is_err());
        assert!(mm.set_layer_address_range(id, 0xF0, 0x20).is_err());
    }

    #[test]
    fn memory_set_layer_memory_is_idempotent() {
        let mut mm = MemoryManager::new();
        let a = SharedMemory::new(0x100, 1);
        let b = SharedMemory::new(0x200, 2);
        let id = mm.create_memory_layer(PRI_ROM, a, 0, 0x10, 1, false).unwrap();
        mm.set_layer_modes(id, AccessMode::ARW).unwrap();
        mm.set_layer_memory(id, b.clone(), 0x100).unwrap();
        let once = mm.layer_info(id);
        mm.set_layer_memory(id, b.clone(), 0x100).unwrap();
        assert_eq!(mm.layer_info(id), once);
        mm.write_byte(0x1000, 9);
        assert_eq!(b.read(0x100), 9);
        assert_eq!(mm.read_byte(0x1000), 9);
        mm.delete_layer(id);
        assert_eq!(mm.read_byte(0x1000), OPEN_BUS);
        assert!(mm.layer_info(id).is_none());
    }
}
