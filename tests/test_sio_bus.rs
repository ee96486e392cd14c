/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Tests the SIO bus with disk drives and custom devices attached to the machine.
use std::cell::RefCell;
use std::rc::Rc;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use atarusty::core::clock::NTSC_CPU_HZ;
use atarusty::peripherals::disk::{DiskGeometry, DiskImage, DiskInterface, MemoryDisk, SharedDiskInterface};
use atarusty::peripherals::sio::{sio_checksum, SioDiskDrive, SIO_ACK, SIO_COMPLETE, SIO_NAK};
use atarusty::peripherals::sio::accel::{kernel, STATUS_SUCCESS};
use atarusty::peripherals::sio::drive::{DRIVE_CYCLES_PER_BIT, FORMAT_TIMEOUT};
use atarusty::custom::config::{compile_config, NoResources};
use atarusty::machine::*;

fn machine_with_drive() -> (Machine, SharedDiskInterface) {
    let mut machine = Machine::new(NTSC_CPU_HZ).unwrap();
    let disk = DiskInterface::new_shared(0);
    let mut image = MemoryDisk::new(DiskGeometry::single_density());
    let sector: Vec<u8> = (0..128u32).map(|i| (i * 3) as u8).collect();
    image.write_sector(0, &sector).unwrap();
    disk.borrow_mut().mount(Box::new(image), "boot.atr");
    machine.add_sio_device(Rc::new(RefCell::new(SioDiskDrive::new(disk.clone()))));
    (machine, disk)
}

fn custom_machine(src: &str) -> (Machine, atarusty::custom::SharedCustomDevice) {
    let mut machine = Machine::new(NTSC_CPU_HZ).unwrap();
    let config = compile_config(src, "test.atdevice", &mut NoResources, false).unwrap();
    let device = machine.add_custom_config(config);
    (machine, device)
}

#[test]
fn disk_status_command_is_answered() {
    let (mut machine, _disk) = machine_with_drive();
    machine.send_command_frame(&[0x31, 0x53, 0x00, 0x00, 0x84]);
    machine.run_for(20_000);
    let bytes = machine.serial.bytes();
    assert_eq!(bytes.len(), 7);
    assert_eq!(&bytes[..2], &[SIO_ACK, SIO_COMPLETE]);
    assert_eq!(&bytes[2..6], &[0x10, 0xFF, FORMAT_TIMEOUT, 0x00]);
    assert_eq!(bytes[6], sio_checksum(&bytes[2..6]));
    let received = machine.serial.take_received();
    assert!(received.iter().all(|sb| sb.cycles_per_bit == DRIVE_CYCLES_PER_BIT && !sb.framing_error));
    assert!(received.windows(2).all(|w| w[0].tick < w[1].tick));
    assert!(!machine.sio.is_any_command_active());
}

#[test]
fn bad_command_frame_checksum_is_ignored() {
    let (mut machine, _disk) = machine_with_drive();
    machine.send_command_frame(&[0x31, 0x53, 0x00, 0x00, 0x85]);
    machine.run_for(20_000);
    assert!(machine.serial.received.is_empty());
    // a drive that is not there stays silent as well
    machine.send_command_frame(&command_frame(0x32, 0x53, 0, 0));
    machine.run_for(20_000);
    assert!(machine.serial.received.is_empty());
}

#[test]
fn accelerated_sector_read_fills_memory() {
    let (mut machine, _disk) = machine_with_drive();
    machine.write_byte(kernel::BRKKEY, 0x80);
    let dcb = [0x31, 0x01, 0x52, 0x40, 0x00, 0x05, 0x1F, 0x00, 0x80, 0x00, 0x01, 0x00];
    for (i, b) in dcb.iter().enumerate() {
        machine.write_byte(kernel::DDEVIC + i as u16, *b);
    }
    let ret = machine.hook_siov(0).unwrap();
    assert_eq!(ret.status, STATUS_SUCCESS);
    assert_eq!(ret.y, 1);
    assert!(ret.carry);
    assert_eq!(machine.read_byte(kernel::DSTATS), STATUS_SUCCESS);
    for i in 0..128u16 {
        assert_eq!(machine.read_byte(0x0500 + i), (i * 3) as u8);
    }
    assert_eq!(machine.read_byte(0x0580), 0);
    assert!(machine.serial.received.is_empty());
}

#[test]
fn accelerated_status_matches_wire_reply() {
    let (mut machine, _disk) = machine_with_drive();
    machine.write_byte(kernel::BRKKEY, 0x80);
    let dcb = [0x31, 0x01, 0x53, 0x40, 0x00, 0x05, 0x1F, 0x00, 0x04, 0x00, 0x00, 0x00];
    for (i, b) in dcb.iter().enumerate() {
        machine.write_byte(kernel::DDEVIC + i as u16, *b);
    }
    let ret = machine.hook_siov(0).unwrap();
    assert_eq!(ret.status, STATUS_SUCCESS);
    assert_eq!(ret.y, 1);
    assert!(ret.carry);
    assert_eq!(machine.read_byte(kernel::DSTATS), STATUS_SUCCESS);
    let status: Vec<u8> = (0..4u16).map(|i| machine.read_byte(0x0500 + i)).collect();
    assert_eq!(status, [0x10, 0xFF, FORMAT_TIMEOUT, 0x00]);
    assert!(machine.serial.received.is_empty());
}

#[test]
fn checksum_wraps_end_around_carry() {
    let mut rng = SmallRng::seed_from_u64(0x5107);
    for _ in 0..200 {
        let len = rng.gen_range(0..300);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let expected = data.iter().fold(0u32, |sum, &b| {
            let sum = sum + b as u32;
            (sum & 0xFF) + (sum >> 8)
        });
        assert_eq!(sio_checksum(&data) as u32, expected);
        // a frame followed by its checksum sums to a fixed point
        let mut framed = data.clone();
        framed.push(sio_checksum(&data));
        assert_eq!(sio_checksum(&framed), sio_checksum(&[sio_checksum(&data), sio_checksum(&data)]));
    }
}

#[test]
fn custom_device_auto_transfer_answers() {
    let (mut machine, device) = custom_machine(r#"
        SIODevice dev: {
            device_id: $50,
            commands: [ { id: $53, auto_transfer: [1, 2, 3, 4] } ]
        };
    "#);
    machine.cold_reset();
    machine.send_command_frame(&command_frame(0x50, 0x53, 0, 0));
    machine.run_for(50_000);
    assert_eq!(machine.serial.bytes(), [SIO_ACK, SIO_COMPLETE, 1, 2, 3, 4, 10]);
    machine.serial.received.clear();
    machine.send_command_frame(&command_frame(0x50, 0x21, 0, 0));
    machine.run_for(50_000);
    assert_eq!(machine.serial.bytes(), [SIO_NAK]);
    assert!(device.borrow().error_status().is_none());
}

#[test]
fn custom_device_script_sends_frame() {
    let (mut machine, device) = custom_machine(r#"
        int last_aux = 0;
        Segment buf: { size: 4, init_pattern: [9, 8, 7, 6] };
        SIODevice dev: {
            device_id: $50,
            commands: [
                { id: $52, script: function {
                    last_aux = aux;
                    sio.ack();
                    sio.complete();
                    sio.send_frame(buf, 0, 4);
                } }
            ]
        };
    "#);
    machine.cold_reset();
    machine.send_command_frame(&command_frame(0x50, 0x52, 0x34, 0x12));
    machine.run_for(50_000);
    assert_eq!(machine.serial.bytes(), [SIO_ACK, SIO_COMPLETE, 9, 8, 7, 6, sio_checksum(&[9, 8, 7, 6])]);
    assert_eq!(device.borrow().vm().globals[0], 0x1234);
    assert!(!machine.sio.is_any_command_active());
}

#[test]
fn raw_bytes_reach_pokey_in_order() {
    let (mut machine, _device) = custom_machine(r#"
        Thread a;
        Thread b;
        function send_a() { sio.send_raw_byte(65, 100); sio.send_raw_byte(66, 100); }
        function send_b() { sio.send_raw_byte(97, 100); }
        event "cold_reset": function { sio.enable_raw(1); a.run(send_a); b.run(send_b); };
    "#);
    machine.run_until(100);
    machine.cold_reset();
    machine.run_until(20_000);
    let sent: Vec<(u8, u32, u64)> = machine.serial.received.iter()
                                          .map(|sb| (sb.byte, sb.cycles_per_bit, sb.tick)).collect();
    assert_eq!(sent, [(0x41, 100, 101), (0x61, 100, 1101), (0x42, 100, 2101)]);
}

#[test]
fn raw_device_receives_and_drives_lines() {
    let (mut machine, device) = custom_machine(r#"
        int got = 0;
        Thread reader;
        function read() { got = sio.recv_raw_byte(); sio.set_interrupt(1); sio.set_proceed(1); }
        event "cold_reset": function { sio.enable_raw(1); reader.run(read); };
    "#);
    machine.cold_reset();
    machine.run_for(10);
    assert!(!machine.serial.interrupt);
    machine.pokey_write(0x5A, POKEY_CYCLES_PER_BIT);
    machine.run_for(10);
    assert_eq!(device.borrow().vm().globals[0], 0x5A);
    assert!(machine.serial.interrupt);
    assert!(machine.serial.proceed);
    // detaching the device releases its lines
    machine.remove_custom_device(&device);
    assert!(!machine.serial.interrupt);
    assert!(!machine.serial.proceed);
}
