/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Acceleration of OS SIO vector requests.
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::memory::MemoryManager;

use super::interface::SioInterface;
use super::sio_checksum;
use super::step::Step;

/// Addresses of the OS variables the SIO vector works with.
pub mod kernel {
    pub const BRKKEY: u16 = 0x0011;
    pub const STATUS: u16 = 0x0030;
    pub const CHKSUM: u16 = 0x0031;
    pub const BUFRLO: u16 = 0x0032;
    pub const BUFRHI: u16 = 0x0033;
    pub const CHKSNT: u16 = 0x003B;
    pub const CRITIC: u16 = 0x0042;
    pub const CDTMA1: u16 = 0x0226;
    pub const SSKCTL: u16 = 0x0232;
    pub const DDEVIC: u16 = 0x0300;
    pub const DSTATS: u16 = 0x0303;
    pub const TIMFLG: u16 = 0x0317;
    pub const AUDF3: u16 = 0xD204;
    pub const AUDF4: u16 = 0xD206;
    pub const SKCTL: u16 = 0xD20F;
    /// The OS timeout routine `CDTMA1` points to after SIO initialization.
    pub const CDTMA1_DEFAULT: u16 = 0xE4C0;
}

pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_TIMEOUT: u8 = 0x8A;
pub const STATUS_NAK: u8 = 0x8B;
pub const STATUS_CHECKSUM: u8 = 0x8F;
pub const STATUS_DEVICE_ERROR: u8 = 0x90;
/// Data flows from the device into memory.
pub const MODE_READ: u8 = 0x40;
/// Data flows from memory to the device.
pub const MODE_WRITE: u8 = 0x80;

/// A request to the OS SIO vector, as found in the device control block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SioRequest {
    pub device: u8,
    pub command: u8,
    pub mode: u8,
    pub timeout: u8,
    pub address: u16,
    pub length: u16,
    pub sector: u16,
    pub aux: [u8; 2],
    /// Number of consecutive type-3 polls preceding this request.
    pub poll_count: u32,
}

impl SioRequest {
    /// Decodes the 12 bytes of the device control block at `DDEVIC`.
    pub fn from_dcb(dcb: &[u8; 12]) -> Self {
        SioRequest {
            device: dcb[0].wrapping_add(dcb[1]).wrapping_sub(1),
            command: dcb[2],
            mode: dcb[3],
            address: u16::from_le_bytes([dcb[4], dcb[5]]),
            timeout: dcb[6],
            length: u16::from_le_bytes([dcb[8], dcb[9]]),
            sector: u16::from_le_bytes([dcb[10], dcb[11]]),
            aux: [dcb[10], dcb[11]],
            poll_count: 0,
        }
    }
    /// Reads the device control block from memory.
    pub fn read_dcb(mem: &mut MemoryManager) -> Self {
        let mut dcb = [0u8; 12];
        for (i, b) in dcb.iter_mut().enumerate() {
            *b = mem.debug_read_byte(kernel::DDEVIC + i as u16);
        }
        SioRequest::from_dcb(&dcb)
    }

    pub fn is_disk(&self) -> bool {
        (0x31..=0x3F).contains(&self.device)
    }
    /// Returns `true` for a type 3 poll.
    pub fn is_type3_poll(&self) -> bool {
        self.command == 0x40 && self.aux == [0, 0]
    }
    /// Returns `true` if the data buffer covers `addr`.
    pub fn buffer_overlaps(&self, addr: u16) -> bool {
        self.address <= addr && ((addr - self.address) as u32) < self.length as u32
    }
}

/// CPU register values the SIO vector returns with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelReturn {
    pub status: u8,
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub carry: bool,
    /// Cycles saved by the accelerated transfer.
    pub skew: u64,
}

#[derive(Clone, Copy, Debug)]
pub(super) struct AccelState {
    pub req: SioRequest,
    pub status: u8,
}

/// Copies the bytes of a send step into the request buffer.
pub(super) fn send_to_memory(iface: &mut SioInterface, step: Step, state: &mut AccelState, mem: &mut MemoryManager) {
    if state.req.mode & MODE_READ == 0 {
        return
    }
    let start = iface.transfer_start;
    let mut len = step.transfer_len() as usize;
    if let Step::SendAuto {..} = step {
        len -= 1;
    }
    let req_len = state.req.length as usize;
    let min_len = len.min(req_len);
    let src = &iface.buffer[start..iface.transfer_end];
    let addr = state.req.address;
    for (i, b) in src[..min_len].iter().enumerate() {
        mem.write_byte(addr.wrapping_add(i as u16), *b);
    }
    iface.accel_time_skew += (min_len as u64 + 1) * iface.cycles_per_byte as u64;
    if len < req_len {
        state.status = STATUS_TIMEOUT;
    }
    else if len > req_len && sio_checksum(&src[..req_len]) != src[req_len] {
        state.status = STATUS_CHECKSUM;
    }
    let end = addr.wrapping_add(min_len as u16);
    mem.write_byte(kernel::CHKSUM, sio_checksum(&src[..min_len]));
    mem.write_byte(kernel::BUFRLO, end as u8);
    mem.write_byte(kernel::BUFRHI, (end >> 8) as u8);
}

/// Fills the transfer window of a receive step from the request buffer.
///
/// Returns `true` if the host supplied a complete frame with a valid checksum.
pub(super) fn receive_from_memory(iface: &mut SioInterface, step: Step, state: &AccelState, mem: &mut MemoryManager) -> bool {
    let auto = matches!(step, Step::ReceiveAuto {..});
    let len = step.transfer_len() as usize - auto as usize;
    let req_len = if state.req.mode & MODE_WRITE != 0 { state.req.length as usize } else { 0 };
    let min_len = len.min(req_len);
    let addr = state.req.address;
    let start = iface.transfer_start;
    {
        let dst = &mut iface.buffer[start..start + len];
        for (i, b) in dst.iter_mut().enumerate() {
            *b = if i < min_len { mem.debug_read_byte(addr.wrapping_add(i as u16)) } else { 0 };
        }
    }
    iface.accel_time_skew += (min_len as u64 + 1) * iface.cycles_per_bit as u64 * 10;
    let ok = if req_len < len {
        false
    }
    else if req_len > len {
        let sum = mem.debug_read_byte(addr.wrapping_add(min_len as u16));
        sio_checksum(&iface.buffer[start..start + len]) == sum
    }
    else {
        true
    };
    if auto {
        let sum = sio_checksum(&iface.buffer[start..start + len]);
        iface.buffer[start + len] = if ok { sum } else { !sum };
    }
    ok
}

/// Updates OS variables after an accelerated request and computes the return registers.
pub(super) fn finish_request(mem: &mut MemoryManager, status: u8, pbi: bool, skew: u64) -> AccelReturn {
    mem.write_byte(kernel::AUDF3, 0x28);
    mem.write_byte(kernel::AUDF4, 0x00);
    mem.write_byte(kernel::SKCTL, 0x13);
    mem.write_byte(kernel::SSKCTL, 0x13);
    let cdtma1 = u16::from_le_bytes([
        mem.debug_read_byte(kernel::CDTMA1), mem.debug_read_byte(kernel::CDTMA1 + 1)
    ]);
    if cdtma1 == 0 {
        let [lo, hi] = kernel::CDTMA1_DEFAULT.to_le_bytes();
        mem.write_byte(kernel::CDTMA1, lo);
        mem.write_byte(kernel::CDTMA1 + 1, hi);
    }
    mem.write_byte(kernel::CHKSNT, 0xFF);
    if !pbi {
        mem.write_byte(kernel::CRITIC, 0);
    }
    mem.write_byte(kernel::STATUS, status);
    mem.write_byte(kernel::DSTATS, status);
    mem.write_byte(kernel::TIMFLG, if status == STATUS_TIMEOUT { 0 } else { 1 });
    AccelReturn {
        status,
        a: 0,
        x: 0xFE,
        y: status,
        carry: status == STATUS_SUCCESS || status >= STATUS_TIMEOUT,
        skew
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dcb_decoding_works() {
        let req = SioRequest::from_dcb(&[0x31, 0x01, 0x52, 0x40, 0x00, 0x05, 0x1F, 0x00, 0x80, 0x00, 0x01, 0x00]);
        assert_eq!(req.device, 0x31);
        assert_eq!(req.command, 0x52);
        assert_eq!(req.mode, MODE_READ);
        assert_eq!(req.address, 0x0500);
        assert_eq!(req.timeout, 0x1F);
        assert_eq!(req.length, 0x80);
        assert_eq!(req.sector, 1);
        assert_eq!(req.aux, [1, 0]);
        assert!(req.is_disk());
        assert!(!req.is_type3_poll());
        assert!(req.buffer_overlaps(0x057F));
        assert!(!req.buffer_overlaps(0x0580));
        assert!(!req.buffer_overlaps(kernel::TIMFLG));
        let poll = SioRequest::from_dcb(&[0x4F, 0x01, 0x40, 0x40, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(poll.device, 0x4F);
        assert!(poll.is_type3_poll());
        assert!(!poll.is_disk());
    }
}
