/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Tests peripherals that are mapped into the cartridge control area or talk over TCP.
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::time::{Duration, Instant};
use atarusty::core::clock::NTSC_CPU_HZ;
use atarusty::core::props::PropertySet;
use atarusty::peripherals::blackbox::{CCTL_BASE, ROM_SIZE, RUN_SLICE};
use atarusty::peripherals::disk::{DiskGeometry, DiskInterface, MemoryDisk};
use atarusty::peripherals::modem::{ModemConfig, ModemEvent, ModemPhase, ModemStatus, TcpModemDriver};
use atarusty::peripherals::multiplexer::net::{ConnId, MuxTransport, NetEvent};
use atarusty::peripherals::via::ViaRegister;
use atarusty::machine::*;

/// A firmware that spins in place.
fn idle_rom() -> Vec<u8> {
    let mut rom = vec![0xEAu8; ROM_SIZE];
    // JMP $F000
    rom[0..3].copy_from_slice(&[0x4C, 0x00, 0xF0]);
    rom[0xFFC] = 0x00;
    rom[0xFFD] = 0xF0;
    rom
}

#[test]
fn blackbox_selects_drive_from_port_b() {
    let mut machine = Machine::new(NTSC_CPU_HZ).unwrap();
    let bb = machine.add_blackbox(&idle_rom()).unwrap();
    let disk = DiskInterface::new_shared(0);
    disk.borrow_mut().mount(Box::new(MemoryDisk::new(DiskGeometry::single_density())), "a.atr");
    let mut ps = PropertySet::new();
    ps.set_u32("driveslot0", 1);
    assert!(bb.borrow_mut().apply_settings(&ps));
    bb.borrow_mut().attach_disks(&[disk]);

    let ddrb = CCTL_BASE + ViaRegister::Ddrb as u16;
    let orb = CCTL_BASE + ViaRegister::Orb as u16;
    machine.write_byte(ddrb, 0xFF);
    assert_eq!(machine.read_byte(ddrb), 0xFF);
    machine.write_byte(orb, 0xF8);
    assert_eq!(bb.borrow().selected_drive(), None);
    machine.write_byte(orb, 0xF9);
    assert_eq!(bb.borrow().selected_drive(), Some(0));
    machine.write_byte(orb, 0xFA);
    assert_eq!(bb.borrow().selected_drive(), Some(1));
    // two drives at once select nothing
    machine.write_byte(orb, 0xFB);
    assert_eq!(bb.borrow().selected_drive(), None);

    // the board keeps running between host accesses
    machine.run_for(RUN_SLICE * 10);
    assert!(bb.borrow().drive_now() >= RUN_SLICE * 9);
    assert!(!machine.is_irq_asserted());
}

#[test]
fn blackbox_rejects_bad_firmware() {
    let mut machine = Machine::new(NTSC_CPU_HZ).unwrap();
    match machine.add_blackbox(&[0u8; 100]) {
        Err(MachineError::Firmware(_)) => {}
        Err(err) => panic!("unexpected error: {}", err),
        Ok(_) => panic!("firmware accepted")
    }
}

#[derive(Clone, Default)]
struct Wire(Rc<RefCell<(Vec<NetEvent>, Vec<(ConnId, Vec<u8>)>)>>);

impl MuxTransport for Wire {
    fn poll_events(&mut self) -> Vec<NetEvent> {
        std::mem::take(&mut self.0.borrow_mut().0)
    }

    fn send(&mut self, conn: ConnId, data: &[u8]) -> io::Result<()> {
        self.0.borrow_mut().1.push((conn, data.to_vec()));
        Ok(())
    }

    fn close(&mut self, _conn: ConnId) {}
}

#[test]
fn multiplexer_client_connects_through_machine() {
    let mut machine = Machine::new(NTSC_CPU_HZ).unwrap();
    let wire = Wire::default();
    let mut ps = PropertySet::new();
    ps.set_i32("device_id", 1);
    let mux = machine.add_multiplexer(&ps, Some(Box::new(wire.clone()))).unwrap();
    assert!(!mux.borrow().is_host());
    assert_eq!(mux.borrow().error_status().as_deref(), Some("Connecting to localhost:6522"));
    wire.0.borrow_mut().0.push(NetEvent::Connected(ConnId(0)));
    machine.run_for(20_000);
    assert_eq!(mux.borrow().error_status(), None);
    wire.0.borrow_mut().0.push(NetEvent::Closed(ConnId(0)));
    machine.run_for(20_000);
    assert!(mux.borrow().error_status().is_some());
}

fn wait_for(driver: &TcpModemDriver, expected: ModemEvent) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if driver.wait_event(Duration::from_millis(50)) == Some(expected) {
            return
        }
    }
    panic!("timed out waiting for {:?}", expected);
}

#[test]
fn telnet_modem_stuffs_cr_with_nul() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ModemConfig { telnet_emulation: true, ..ModemConfig::default() };
    let mut driver = TcpModemDriver::start("127.0.0.1", port, &config, false).unwrap();
    let (mut remote, _) = listener.accept().unwrap();
    wait_for(&driver, ModemEvent::Status(ModemPhase::Connected, ModemStatus::Connected));
    assert_eq!(driver.write(b"\rA"), 2);
    remote.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 3];
    remote.read_exact(&mut buf).unwrap();
    assert_eq!(buf, [0x0D, 0x00, 0x41]);
    // and the NUL after an incoming CR is dropped
    remote.write_all(b"x\r\0y").unwrap();
    wait_for(&driver, ModemEvent::ReadAvailable(3));
    let mut buf = [0u8; 8];
    assert_eq!(driver.read(&mut buf), 3);
    assert_eq!(&buf[..3], b"x\ry");
    driver.shutdown();
}
