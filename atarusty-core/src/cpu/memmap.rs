/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Page-granular read/write maps for a coprocessor's private address space.
use core::fmt;

/// What a single 256-byte page of the coprocessor's address space is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageBinding {
    /// Reads return the open bus value, writes are dropped.
    Open,
    /// A page of the owner's memory region `region` starting at byte `offset`.
    Memory { region: u8, offset: u32 },
    /// A register block identified by `tag`, decoded by the owner.
    Handler(u8),
}

/// An access resolved through a [CoprocMemoryMap].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolved {
    Open,
    Memory { region: u8, index: usize },
    Handler { tag: u8, addr: u16 },
}

/// The read and write page tables of a coprocessor.
#[derive(Clone)]
pub struct CoprocMemoryMap {
    read: [PageBinding; 256],
    write: [PageBinding; 256],
}

impl Default for CoprocMemoryMap {
    fn default() -> Self {
        CoprocMemoryMap {
            read: [PageBinding::Open; 256],
            write: [PageBinding::Open; 256],
        }
    }
}

impl fmt::Debug for CoprocMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = self.read.iter().filter(|b| **b != PageBinding::Open).count();
        f.debug_struct("CoprocMemoryMap").field("read_pages", &bound).finish()
    }
}

fn page_range(page: u8, count: u16) -> core::ops::Range<usize> {
    let start = page as usize;
    start..(start + count as usize).min(256)
}

impl CoprocMemoryMap {
    pub fn new() -> Self {
        CoprocMemoryMap::default()
    }
    /// Unbinds every page.
    pub fn clear(&mut self) {
        self.read = [PageBinding::Open; 256];
        self.write = [PageBinding::Open; 256];
    }
    /// Binds `count` pages for reading and writing to consecutive pages of a memory region.
    pub fn set_memory(&mut self, page: u8, count: u16, region: u8, offset: u32) {
        self.set_read_memory(page, count, region, offset);
        for (i, p) in page_range(page, count).enumerate() {
            self.write[p] = PageBinding::Memory { region, offset: offset + ((i as u32) << 8) };
        }
    }
    /// Binds `count` pages for reading only. Writes to these pages are dropped.
    pub fn set_read_memory(&mut self, page: u8, count: u16, region: u8, offset: u32) {
        for (i, p) in page_range(page, count).enumerate() {
            self.read[p] = PageBinding::Memory { region, offset: offset + ((i as u32) << 8) };
            self.write[p] = PageBinding::Open;
        }
    }
    /// Binds `count` pages for writing only, leaving read bindings intact.
    pub fn set_write_memory(&mut self, page: u8, count: u16, region: u8, offset: u32) {
        for (i, p) in page_range(page, count).enumerate() {
            self.write[p] = PageBinding::Memory { region, offset: offset + ((i as u32) << 8) };
        }
    }
    /// Binds `count` pages for reading and writing to a register block.
    pub fn set_handlers(&mut self, page: u8, count: u16, tag: u8) {
        for p in page_range(page, count) {
            self.read[p] = PageBinding::Handler(tag);
            self.write[p] = PageBinding::Handler(tag);
        }
    }
    /// Binds `count` pages for reading only to a register block.
    pub fn set_read_handler(&mut self, page: u8, count: u16, tag: u8) {
        for p in page_range(page, count) {
            self.read[p] = PageBinding::Handler(tag);
            self.write[p] = PageBinding::Open;
        }
    }
    /// Binds `count` pages for writing only to a register block, leaving read bindings intact.
    pub fn set_write_handler(&mut self, page: u8, count: u16, tag: u8) {
        for p in page_range(page, count) {
            self.write[p] = PageBinding::Handler(tag);
        }
    }
    /// Replicates the bindings of `count` pages from `src` onward to every following block
    /// of `count` pages up to the end of the address space.
    pub fn mirror_forward(&mut self, src: u8, count: u16) {
        let src = src as usize;
        let count = count as usize;
        if count == 0 {
            return
        }
        for p in (src + count)..256 {
            let from = src + (p - src) % count;
            self.read[p] = self.read[from];
            self.write[p] = self.write[from];
        }
    }

    #[inline]
    pub fn read_binding(&self, addr: u16) -> PageBinding {
        self.read[(addr >> 8) as usize]
    }

    #[inline]
    pub fn write_binding(&self, addr: u16) -> PageBinding {
        self.write[(addr >> 8) as usize]
    }

    #[inline]
    pub fn resolve_read(&self, addr: u16) -> Resolved {
        Self::resolve(self.read_binding(addr), addr)
    }

    #[inline]
    pub fn resolve_write(&self, addr: u16) -> Resolved {
        Self::resolve(self.write_binding(addr), addr)
    }

    fn resolve(binding: PageBinding, addr: u16) -> Resolved {
        match binding {
            PageBinding::Open => Resolved::Open,
            PageBinding::Memory { region, offset } => Resolved::Memory {
                region, index: offset as usize + (addr & 0xFF) as usize
            },
            PageBinding::Handler(tag) => Resolved::Handler { tag, addr }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_map_works() {
        let mut map = CoprocMemoryMap::new();
        map.set_memory(0x00, 8, 0, 0);
        map.set_handlers(0x08, 2, 1);
        map.set_read_handler(0x0A, 2, 2);
        map.set_read_memory(0x10, 16, 1, 0);
        map.mirror_forward(0x00, 0x20);
        assert_eq!(map.resolve_read(0x0123), Resolved::Memory { region: 0, index: 0x123 });
        assert_eq!(map.resolve_write(0x2123), Resolved::Memory { region: 0, index: 0x123 });
        assert_eq!(map.resolve_read(0x0A05), Resolved::Handler { tag: 2, addr: 0x0A05 });
        assert_eq!(map.resolve_write(0x0A05), Resolved::Open);
        assert_eq!(map.resolve_read(0x0E00), Resolved::Open);
        assert_eq!(map.resolve_read(0xFFFC), Resolved::Memory { region: 1, index: 0xFFC });
        assert_eq!(map.resolve_write(0xF000), Resolved::Open);
        assert_eq!(map.write_binding(0xE900), PageBinding::Handler(1));
        map.set_write_handler(0x0A, 1, 3);
        assert_eq!(map.resolve_write(0x0A05), Resolved::Handler { tag: 3, addr: 0x0A05 });
        assert_eq!(map.resolve_read(0x0A05), Resolved::Handler { tag: 2, addr: 0x0A05 });
        map.set_write_memory(0x0E, 1, 0, 0x700);
        assert_eq!(map.resolve_write(0x0E10), Resolved::Memory { region: 0, index: 0x710 });
        assert_eq!(map.resolve_read(0x0E10), Resolved::Open);
        map.clear();
        assert_eq!(map.resolve_read(0x0123), Resolved::Open);
    }
}
