/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! A disk drive answering the standard SIO disk protocol.
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use crate::disk::{DiskGeometry, SharedDiskInterface};

use super::accel::SioRequest;
use super::interface::{CmdResponse, SioCommand, SioDevice, SioInterface};

/// Bit rate of the 810 at the standard 19200 baud.
pub const DRIVE_CYCLES_PER_BIT: u32 = 94;
pub const DRIVE_CYCLES_PER_BYTE: u32 = 940;
/// The time between ACK and Complete, about 850 us.
pub const OPERATION_DELAY: u32 = 1530;
/// The format timeout reported in the third status byte.
pub const FORMAT_TIMEOUT: u8 = 0xE0;

pub const CMD_STATUS: u8 = 0x53;
pub const CMD_READ: u8 = 0x52;
pub const CMD_WRITE: u8 = 0x57;
pub const CMD_PUT: u8 = 0x50;
pub const CMD_READ_PERCOM: u8 = 0x4E;
pub const CMD_FORMAT: u8 = 0x21;

const STATUS_BAD_FRAME: u8 = 0x01;
const STATUS_WRITE_ERROR: u8 = 0x04;
const STATUS_WRITE_PROTECTED: u8 = 0x08;
const STATUS_MOTOR_ON: u8 = 0x10;
const STATUS_DOUBLE_DENSITY: u8 = 0x20;
const STATUS_ENHANCED_DENSITY: u8 = 0x80;

const FDC_NOT_READY: u8 = 0x80;
const FDC_WRITE_PROTECTED: u8 = 0x40;
const FDC_RECORD_NOT_FOUND: u8 = 0x10;

/// Serves a [DiskInterface][crate::disk::DiskInterface] as device `$31 + index`.
pub struct SioDiskDrive {
    disk: SharedDiskInterface,
    device_id: u8,
    last_error: u8,
    last_fdc_error: u8,
}

impl SioDiskDrive {
    pub fn new(disk: SharedDiskInterface) -> Self {
        let device_id = 0x31 + disk.borrow().index() as u8;
        SioDiskDrive { disk, device_id, last_error: 0, last_fdc_error: 0 }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn disk(&self) -> &SharedDiskInterface {
        &self.disk
    }
    /// The four bytes returned by the status command.
    pub fn status_bytes(&self) -> [u8; 4] {
        let disk = self.disk.borrow();
        let mut status = self.last_error | STATUS_MOTOR_ON;
        let mut fdc = self.last_fdc_error;
        if disk.is_write_protected() {
            status |= STATUS_WRITE_PROTECTED;
            fdc |= FDC_WRITE_PROTECTED;
        }
        match disk.geometry() {
            Some(geo) if geo.sector_size != 128 => status |= STATUS_DOUBLE_DENSITY,
            Some(geo) if geo.mfm => status |= STATUS_ENHANCED_DENSITY,
            Some(_) => {}
            None => fdc |= FDC_NOT_READY
        }
        [status, !fdc, FORMAT_TIMEOUT, 0]
    }

    fn geometry(&self) -> Option<DiskGeometry> {
        self.disk.borrow().geometry()
    }
    /// Maps a 1-based sector number from AUX to a logical sector with its size.
    fn sector(&self, aux: u16) -> Option<(u32, usize)> {
        let geo = self.geometry()?;
        let lsn = (aux as u32).checked_sub(1)?;
        if lsn >= geo.sector_count {
            return None
        }
        Some((lsn, geo.stored_sector_size(lsn)))
    }
    /// Encodes the current geometry as a PERCOM block.
    pub fn percom_block(&self) -> [u8; 12] {
        let geo = self.geometry().unwrap_or_else(DiskGeometry::single_density);
        let spt = geo.sectors_per_track.to_be_bytes();
        let size = (geo.sector_size as u16).to_be_bytes();
        [
            geo.tracks as u8, 1, spt[2], spt[3],
            (geo.sides - 1) as u8, if geo.mfm { 0x04 } else { 0x00 },
            size[0], size[1], 0xFF, 0, 0, 0
        ]
    }

    fn reply(&mut self, iface: &mut SioInterface, data: &[u8], ok: bool) {
        iface.delay(OPERATION_DELAY);
        if ok {
            iface.send_complete(false);
        }
        else {
            iface.send_error(false);
        }
        if !data.is_empty() {
            iface.send_data(data, true);
        }
        iface.end_command();
    }

    fn read_sector(&mut self, aux: u16, iface: &mut SioInterface) {
        let (lsn, len) = match self.sector(aux) {
            Some(sector) => sector,
            None => {
                debug!("D{}: read of invalid sector {}", self.device_id - 0x30, aux);
                self.last_fdc_error = FDC_RECORD_NOT_FOUND;
                let len = self.geometry().map_or(128, |g| g.sector_size);
                return self.reply(iface, &vec![0; len], false)
            }
        };
        let mut buf = vec![0u8; len];
        let res = self.disk.borrow().read_sector(lsn, &mut buf);
        match res {
            Ok(_) => {
                self.last_fdc_error = 0;
                self.reply(iface, &buf, true)
            }
            Err(err) => {
                debug!("D{}: read of sector {} failed: {}", self.device_id - 0x30, aux, err);
                self.last_fdc_error = FDC_RECORD_NOT_FOUND;
                self.reply(iface, &buf, false)
            }
        }
    }

    fn format(&mut self, iface: &mut SioInterface) {
        let geo = match self.geometry() {
            Some(geo) => geo,
            None => return self.reply(iface, &[0xFF; 128], false)
        };
        let mut ok = true;
        {
            let mut disk = self.disk.borrow_mut();
            for lsn in 0..geo.sector_count {
                let zeros = vec![0u8; geo.stored_sector_size(lsn)];
                if let Err(err) = disk.write_sector(lsn, &zeros) {
                    debug!("D{}: format failed: {}", self.device_id - 0x30, err);
                    ok = false;
                    break
                }
            }
        }
        self.last_error = if ok { 0 } else { STATUS_WRITE_ERROR };
        let mut bad_sectors = vec![0u8; geo.sector_size];
        bad_sectors[..2].copy_from_slice(&[0xFF, 0xFF]);
        self.reply(iface, &bad_sectors, ok)
    }
}

impl SioDevice for SioDiskDrive {
    fn on_serial_begin_command(&mut self, cmd: &SioCommand, iface: &mut SioInterface) -> CmdResponse {
        if cmd.device != self.device_id {
            return CmdResponse::NotHandled
        }
        if !self.disk.borrow().is_disk_loaded() && cmd.command != CMD_STATUS {
            // an empty drive does not answer anything but status
            return CmdResponse::NotHandled
        }
        iface.begin_command();
        iface.set_transfer_rate(DRIVE_CYCLES_PER_BIT, DRIVE_CYCLES_PER_BYTE);
        let aux = cmd.aux_word();
        match cmd.command & 0x7F {
            CMD_STATUS => {
                iface.send_ack();
                let status = self.status_bytes();
                self.last_error = 0;
                self.reply(iface, &status, true);
            }
            CMD_READ => {
                iface.send_ack();
                self.read_sector(aux, iface);
            }
            CMD_WRITE | CMD_PUT => match self.sector(aux) {
                Some((_, len)) => {
                    iface.send_ack();
                    iface.receive_data(aux as u32, len, true);
                }
                None => {
                    self.last_error = STATUS_BAD_FRAME;
                    iface.send_nak();
                    iface.end_command();
                }
            }
            CMD_READ_PERCOM => {
                iface.send_ack();
                let block = self.percom_block();
                self.reply(iface, &block, true);
            }
            CMD_FORMAT => {
                iface.send_ack();
                self.format(iface);
            }
            _ => {
                trace!("D{}: unsupported command ${:02X}", self.device_id - 0x30, cmd.command);
                self.last_error = STATUS_BAD_FRAME;
                iface.send_nak();
                iface.end_command();
            }
        }
        CmdResponse::Start
    }

    fn on_serial_accel_command(&mut self, req: &SioRequest, iface: &mut SioInterface) -> CmdResponse {
        let cmd = SioCommand {
            device: req.device,
            command: req.command,
            aux: req.aux,
            poll_count: req.poll_count,
            ..SioCommand::default()
        };
        self.on_serial_begin_command(&cmd, iface)
    }

    fn on_serial_receive_complete(&mut self, id: u32, data: &[u8], _ok: bool, iface: &mut SioInterface) {
        let res = match self.sector(id as u16) {
            Some((lsn, _)) => self.disk.borrow_mut().write_sector(lsn, data),
            None => Ok(())
        };
        let ok = match res {
            Ok(()) => true,
            Err(err) => {
                debug!("D{}: write of sector {} failed: {}", self.device_id - 0x30, id, err);
                false
            }
        };
        self.last_error = if ok { 0 } else { STATUS_WRITE_ERROR };
        self.reply(iface, &[], ok);
    }
}
