/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Disk images and the disk interface that presents them to drives.
use core::cell::RefCell;
use core::fmt;
use std::io;
use std::rc::Rc;

use bitvec::prelude::*;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

/// The ATR image signature.
pub const ATR_SIGNATURE: u16 = 0x0296;
/// The size of the ATR image header.
pub const ATR_HEADER_SIZE: usize = 16;
/// The number of short (128 byte) boot sectors at the start of a double density image.
pub const BOOT_SECTOR_COUNT: u32 = 3;

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum DiskError {
    SectorOutOfRange(u32),
    WriteProtected,
    BadGeometry,
    InvalidImage,
    NoDisk,
}

impl std::error::Error for DiskError {}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::SectorOutOfRange(lsn) => write!(f, "Sector {} is out of range", lsn),
            DiskError::WriteProtected => f.write_str("Disk is write protected"),
            DiskError::BadGeometry => f.write_str("Disk geometry is not valid"),
            DiskError::InvalidImage => f.write_str("Disk image format is not recognized"),
            DiskError::NoDisk => f.write_str("No disk is loaded"),
        }
    }
}

impl From<DiskError> for io::Error {
    fn from(err: DiskError) -> Self {
        let kind = match err {
            DiskError::WriteProtected => io::ErrorKind::PermissionDenied,
            DiskError::NoDisk => io::ErrorKind::NotFound,
            _ => io::ErrorKind::InvalidData
        };
        io::Error::new(kind, err)
    }
}

/// The logical layout of a disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    /// Tracks per side.
    pub tracks: u32,
    pub sides: u32,
    pub sectors_per_track: u32,
    /// The nominal sector size in bytes.
    pub sector_size: usize,
    /// The number of short 128 byte sectors at the start of the disk.
    pub boot_sectors: u32,
    pub mfm: bool,
    pub sector_count: u32,
}

impl DiskGeometry {
    /// 90K single density: 40 tracks of 18 FM sectors, 128 bytes each.
    pub fn single_density() -> Self {
        DiskGeometry {
            tracks: 40, sides: 1, sectors_per_track: 18, sector_size: 128,
            boot_sectors: 0, mfm: false, sector_count: 720
        }
    }
    /// 130K enhanced density: 40 tracks of 26 MFM sectors, 128 bytes each.
    pub fn enhanced_density() -> Self {
        DiskGeometry {
            tracks: 40, sides: 1, sectors_per_track: 26, sector_size: 128,
            boot_sectors: 0, mfm: true, sector_count: 1040
        }
    }
    /// 180K double density: 40 tracks of 18 MFM sectors, 256 bytes each.
    pub fn double_density() -> Self {
        DiskGeometry {
            tracks: 40, sides: 1, sectors_per_track: 18, sector_size: 256,
            boot_sectors: BOOT_SECTOR_COUNT, mfm: true, sector_count: 720
        }
    }
    /// 360K double sided double density.
    pub fn double_sided_double_density() -> Self {
        DiskGeometry {
            tracks: 40, sides: 2, sectors_per_track: 18, sector_size: 256,
            boot_sectors: BOOT_SECTOR_COUNT, mfm: true, sector_count: 1440
        }
    }
    /// Guesses a geometry from the sector count and size.
    pub fn from_sector_count(sector_count: u32, sector_size: usize) -> Result<Self, DiskError> {
        if sector_count == 0 || !matches!(sector_size, 128|256|512) {
            return Err(DiskError::BadGeometry)
        }
        if sector_size == 128 && sector_count == 1040 {
            return Ok(DiskGeometry::enhanced_density())
        }
        let spt = 18;
        let total_tracks = (sector_count + spt - 1) / spt;
        let sides = if total_tracks > 40 { 2 } else { 1 };
        let tracks = ((total_tracks + sides - 1) / sides).max(1);
        Ok(DiskGeometry {
            tracks, sides, sectors_per_track: spt, sector_size,
            boot_sectors: if sector_size == 256 { BOOT_SECTOR_COUNT.min(sector_count) } else { 0 },
            mfm: sector_size != 128,
            sector_count
        })
    }
    /// Returns the size of the sector as stored in an image.
    pub fn stored_sector_size(&self, lsn: u32) -> usize {
        if lsn < self.boot_sectors { 128 } else { self.sector_size }
    }
    /// Returns the byte offset of the sector in a flat image.
    pub fn sector_offset(&self, lsn: u32) -> usize {
        let boot = lsn.min(self.boot_sectors) as usize;
        let rest = lsn.saturating_sub(self.boot_sectors) as usize;
        boot * 128 + rest * self.sector_size
    }

    pub fn total_size(&self) -> usize {
        self.sector_offset(self.sector_count)
    }
    /// Returns the sector size code used in ID fields.
    pub fn size_code(&self) -> u8 {
        match self.sector_size {
            128 => 0,
            256 => 1,
            512 => 2,
            _ => 3
        }
    }
}

/// A disk image accessed by logical sector number (0-based).
pub trait DiskImage: fmt::Debug {
    fn geometry(&self) -> DiskGeometry;
    /// Reads the sector into `buf`, returning the number of bytes stored in the image.
    fn read_sector(&self, lsn: u32, buf: &mut [u8]) -> Result<usize, DiskError>;
    fn write_sector(&mut self, lsn: u32, data: &[u8]) -> Result<(), DiskError>;
    /// Returns `true` if any sector was written since the image was loaded or saved.
    fn is_dirty(&self) -> bool;
}

/// A disk image held in memory.
#[derive(Clone)]
pub struct MemoryDisk {
    geometry: DiskGeometry,
    data: Vec<u8>,
    written: BitVec<Lsb0, u32>,
}

impl fmt::Debug for MemoryDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryDisk {{ geometry: {:?}, written: {} }}",
            self.geometry, self.written.count_ones())
    }
}

impl MemoryDisk {
    /// Creates a blank formatted disk.
    pub fn new(geometry: DiskGeometry) -> Self {
        MemoryDisk {
            geometry,
            data: vec![0; geometry.total_size()],
            written: BitVec::repeat(false, geometry.sector_count as usize),
        }
    }
    /// Loads an image in the ATR format.
    pub fn from_atr(bytes: &[u8]) -> Result<Self, DiskError> {
        if bytes.len() < ATR_HEADER_SIZE || u16::from_le_bytes([bytes[0], bytes[1]]) != ATR_SIGNATURE {
            return Err(DiskError::InvalidImage)
        }
        let paragraphs = u16::from_le_bytes([bytes[2], bytes[3]]) as usize | (bytes[6] as usize) << 16;
        let sector_size = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let body = &bytes[ATR_HEADER_SIZE..];
        let len = (paragraphs * 16).min(body.len());
        let sector_count = match sector_size {
            128 => len / 128,
            256|512 if len >= 3 * 128 && (len - 3 * 128) % sector_size == 0 => {
                BOOT_SECTOR_COUNT as usize + (len - 3 * 128) / sector_size
            }
            256|512 => len / sector_size,
            _ => return Err(DiskError::InvalidImage)
        };
        let mut geometry = DiskGeometry::from_sector_count(sector_count as u32, sector_size)?;
        if sector_size != 128 && (len - 3 * 128.min(len)) % sector_size != 0 {
            geometry.boot_sectors = 0;
        }
        let mut disk = MemoryDisk::new(geometry);
        let size = geometry.total_size().min(len);
        disk.data[..size].copy_from_slice(&body[..size]);
        debug!("ATR image: {} sectors of {} bytes", sector_count, sector_size);
        Ok(disk)
    }
    /// Serializes the image in the ATR format.
    pub fn to_atr(&self) -> Vec<u8> {
        let paragraphs = self.data.len() / 16;
        let mut out = Vec::with_capacity(ATR_HEADER_SIZE + self.data.len());
        out.extend_from_slice(&ATR_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&(paragraphs as u16).to_le_bytes());
        out.extend_from_slice(&(self.geometry.sector_size as u16).to_le_bytes());
        out.push((paragraphs >> 16) as u8);
        out.extend_from_slice(&[0; 9]);
        out.extend_from_slice(&self.data);
        out
    }
    /// Marks the image as saved.
    pub fn clear_dirty(&mut self) {
        self.written = BitVec::repeat(false, self.geometry.sector_count as usize);
    }

    fn check_lsn(&self, lsn: u32) -> Result<(), DiskError> {
        if lsn < self.geometry.sector_count { Ok(()) } else { Err(DiskError::SectorOutOfRange(lsn)) }
    }
}

impl DiskImage for MemoryDisk {
    fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    fn read_sector(&self, lsn: u32, buf: &mut [u8]) -> Result<usize, DiskError> {
        self.check_lsn(lsn)?;
        let offset = self.geometry.sector_offset(lsn);
        let len = self.geometry.stored_sector_size(lsn).min(buf.len());
        buf[..len].copy_from_slice(&self.data[offset..offset + len]);
        for p in buf[len..].iter_mut() {
            *p = 0;
        }
        Ok(len)
    }

    fn write_sector(&mut self, lsn: u32, data: &[u8]) -> Result<(), DiskError> {
        self.check_lsn(lsn)?;
        let offset = self.geometry.sector_offset(lsn);
        let len = self.geometry.stored_sector_size(lsn).min(data.len());
        self.data[offset..offset + len].copy_from_slice(&data[..len]);
        self.written.set(lsn as usize, true);
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.written.any()
    }
}

/// A notification sent to disk interface clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskEvent {
    /// A disk was inserted (`false`) or removed (`true`).
    DiskChanged { removed: bool },
    WriteProtectChanged,
    TimingModeChanged,
    AudioModeChanged,
}

/// A handle of a registered disk interface client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DiskClientId(u32);

/// A disk drive slot shared between drive emulators.
pub type SharedDiskInterface = Rc<RefCell<DiskInterface>>;

/// Presents a mounted disk image to drive emulators.
#[derive(Debug)]
pub struct DiskInterface {
    index: u32,
    image: Option<Box<dyn DiskImage>>,
    path: String,
    write_protected: bool,
    accurate_timing: bool,
    drive_sounds: bool,
    clients: Vec<Option<Vec<DiskEvent>>>,
}

impl DiskInterface {
    pub fn new(index: u32) -> Self {
        DiskInterface {
            index,
            image: None,
            path: String::new(),
            write_protected: false,
            accurate_timing: false,
            drive_sounds: false,
            clients: Vec::new(),
        }
    }

    pub fn new_shared(index: u32) -> SharedDiskInterface {
        Rc::new(RefCell::new(DiskInterface::new(index)))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn add_client(&mut self) -> DiskClientId {
        if let Some(pos) = self.clients.iter().position(|c| c.is_none()) {
            self.clients[pos] = Some(Vec::new());
            return DiskClientId(pos as u32)
        }
        self.clients.push(Some(Vec::new()));
        DiskClientId((self.clients.len() - 1) as u32)
    }

    pub fn remove_client(&mut self, id: DiskClientId) {
        if let Some(slot) = self.clients.get_mut(id.0 as usize) {
            *slot = None;
        }
    }
    /// Drains notifications queued for the client.
    pub fn take_events(&mut self, id: DiskClientId) -> Vec<DiskEvent> {
        match self.clients.get_mut(id.0 as usize) {
            Some(Some(events)) => core::mem::take(events),
            _ => Vec::new()
        }
    }

    fn notify(&mut self, event: DiskEvent) {
        for events in self.clients.iter_mut().flatten() {
            events.push(event);
        }
    }

    pub fn mount<S: Into<String>>(&mut self, image: Box<dyn DiskImage>, path: S) {
        self.image = Some(image);
        self.path = path.into();
        info!("D{}: mounted {}", self.index + 1, self.path);
        self.notify(DiskEvent::DiskChanged { removed: false });
    }

    pub fn unmount(&mut self) -> Option<Box<dyn DiskImage>> {
        let image = self.image.take();
        if image.is_some() {
            self.path.clear();
            self.notify(DiskEvent::DiskChanged { removed: true });
        }
        image
    }

    pub fn is_disk_loaded(&self) -> bool {
        self.image.is_some()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn image(&self) -> Option<&dyn DiskImage> {
        self.image.as_deref()
    }

    pub fn image_mut(&mut self) -> Option<&mut (dyn DiskImage + 'static)> {
        self.image.as_deref_mut()
    }

    pub fn geometry(&self) -> Option<DiskGeometry> {
        self.image.as_ref().map(|image| image.geometry())
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, enabled: bool) {
        if self.write_protected != enabled {
            self.write_protected = enabled;
            self.notify(DiskEvent::WriteProtectChanged);
        }
    }

    pub fn is_accurate_sector_timing_enabled(&self) -> bool {
        self.accurate_timing
    }

    pub fn set_accurate_sector_timing(&mut self, enabled: bool) {
        if self.accurate_timing != enabled {
            self.accurate_timing = enabled;
            self.notify(DiskEvent::TimingModeChanged);
        }
    }

    pub fn are_drive_sounds_enabled(&self) -> bool {
        self.drive_sounds
    }

    pub fn set_drive_sounds(&mut self, enabled: bool) {
        if self.drive_sounds != enabled {
            self.drive_sounds = enabled;
            self.notify(DiskEvent::AudioModeChanged);
        }
    }

    pub fn read_sector(&self, lsn: u32, buf: &mut [u8]) -> Result<usize, DiskError> {
        self.image.as_ref().ok_or(DiskError::NoDisk)?.read_sector(lsn, buf)
    }

    pub fn write_sector(&mut self, lsn: u32, data: &[u8]) -> Result<(), DiskError> {
        if self.write_protected {
            return Err(DiskError::WriteProtected)
        }
        self.image.as_mut().ok_or(DiskError::NoDisk)?.write_sector(lsn, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_works() {
        let dd = DiskGeometry::double_density();
        assert_eq!(dd.sector_offset(3), 384);
        assert_eq!(dd.sector_offset(4), 640);
        assert_eq!(dd.total_size(), 384 + 717 * 256);
        assert_eq!(dd.stored_sector_size(2), 128);
        assert_eq!(dd.stored_sector_size(3), 256);
        assert_eq!(DiskGeometry::from_sector_count(1040, 128).unwrap(), DiskGeometry::enhanced_density());
        let ds = DiskGeometry::from_sector_count(1440, 256).unwrap();
        assert_eq!((ds.tracks, ds.sides), (40, 2));
        assert_eq!(DiskGeometry::from_sector_count(0, 128), Err(DiskError::BadGeometry));
    }

    #[test]
    fn atr_image_works() {
        let mut disk = MemoryDisk::new(DiskGeometry::single_density());
        assert!(!disk.is_dirty());
        disk.write_sector(0, &[0xAA; 128]).unwrap();
        disk.write_sector(719, &[0x55; 128]).unwrap();
        assert_eq!(disk.write_sector(720, &[0; 128]), Err(DiskError::SectorOutOfRange(720)));
        assert!(disk.is_dirty());
        let atr = disk.to_atr();
        assert_eq!(atr.len(), 16 + 92160);
        assert_eq!(&atr[..6], &[0x96, 0x02, 0x80, 0x16, 0x80, 0x00]);
        let loaded = MemoryDisk::from_atr(&atr).unwrap();
        assert_eq!(loaded.geometry(), DiskGeometry::single_density());
        let mut buf = [0u8; 128];
        assert_eq!(loaded.read_sector(719, &mut buf).unwrap(), 128);
        assert_eq!(buf, [0x55; 128]);
        assert!(!loaded.is_dirty());
        assert_eq!(MemoryDisk::from_atr(&[0; 16]).unwrap_err(), DiskError::InvalidImage);
    }

    #[test]
    fn double_density_boot_sectors_are_short() {
        let mut disk = MemoryDisk::new(DiskGeometry::double_density());
        let mut buf = [0xFFu8; 256];
        disk.write_sector(0, &[1; 256]).unwrap();
        assert_eq!(disk.read_sector(0, &mut buf).unwrap(), 128);
        assert_eq!(&buf[..128], &[1; 128][..]);
        assert_eq!(&buf[128..], &[0; 128][..]);
        let loaded = MemoryDisk::from_atr(&disk.to_atr()).unwrap();
        assert_eq!(loaded.geometry(), DiskGeometry::double_density());
    }

    #[test]
    fn disk_interface_notifies_clients() {
        let mut di = DiskInterface::new(0);
        let a = di.add_client();
        let b = di.add_client();
        assert_eq!(di.read_sector(0, &mut [0; 128]), Err(DiskError::NoDisk));
        di.mount(Box::new(MemoryDisk::new(DiskGeometry::single_density())), "blank.atr");
        di.set_write_protected(true);
        di.set_write_protected(true);
        assert_eq!(di.write_sector(0, &[0; 128]), Err(DiskError::WriteProtected));
        di.remove_client(b);
        di.set_accurate_sector_timing(true);
        assert_eq!(di.take_events(a), [
            DiskEvent::DiskChanged { removed: false },
            DiskEvent::WriteProtectChanged,
            DiskEvent::TimingModeChanged
        ]);
        assert!(di.take_events(b).is_empty());
        assert!(di.unmount().is_some());
        assert_eq!(di.take_events(a), [DiskEvent::DiskChanged { removed: true }]);
        assert_eq!(di.add_client(), b);
    }
}
