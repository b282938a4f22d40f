//! End-to-end tests: a real server on a loopback port, driven by the mock
//! client over one long-lived TCP connection per case.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{dummy_device, probed_device, start_server, RecordingAttacher, TestClient};
use packed_struct::prelude::*;
use virtual_usbip::controller::pack_dev_id;
use virtual_usbip::usbip::{trim_string, OpRepDevlist, OpReqDevlist};
use virtual_usbip::{UsbIpServer, VirtualController};

#[test]
fn empty_devlist_answers_literal_bytes() {
    let (mut server, addr) = start_server(vec![]);
    {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
            .write_all(&[0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00])
            .unwrap();
        let mut reply = [0u8; 12];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(
            reply,
            [0x01, 0x11, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
    server.stop();
}

#[test]
fn single_device_devlist_is_328_bytes() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(&OpReqDevlist::new().pack().unwrap()).unwrap();

        // 12-byte header + 312-byte device record + one 4-byte interface
        let mut reply = vec![0u8; 328];
        stream.read_exact(&mut reply).unwrap();
        let parsed = OpRepDevlist::unpack_from_slice(&reply).unwrap();
        assert_eq!(parsed.header.device_count.to_primitive(), 1);

        let entry = &parsed.devices[0];
        assert_eq!(trim_string(&entry.device.bus_id), "1-1");
        assert_eq!(entry.device.vendor_id.to_primitive(), 0xdead);
        assert_eq!(entry.device.product_id.to_primitive(), 0xbeef);
        assert_eq!(entry.device.speed.to_primitive(), 2);
        assert_eq!(entry.device.config_value, 1);
        assert_eq!(entry.device.iface_count, 1);
        assert_eq!(entry.interfaces[0].iface_class, 0xff);
    }
    server.stop();
}

#[test]
fn devlist_covers_every_device() {
    let (mut server, addr) = start_server(vec![dummy_device(), dummy_device(), dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        let list = client.list();
        assert_eq!(list.devices.len(), 3);
        for (idx, entry) in list.devices.iter().enumerate() {
            assert_eq!(trim_string(&entry.device.bus_id), format!("1-{}", idx + 1));
            assert_eq!(entry.device.device_num.to_primitive() as usize, idx + 1);
        }
    }
    server.stop();
}

#[test]
fn import_starts_the_device() {
    let (device, started, _stopped) = probed_device(false);
    let (mut server, addr) = start_server(vec![device]);
    {
        let mut client = TestClient::connect(addr);
        let reply = client.import("1-1");
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(reply.bus_no.to_primitive(), 1);
        assert_eq!(reply.device_no.to_primitive(), 1);
        assert_eq!(reply.vendor_id.to_primitive(), 0xdead);
        assert_eq!(reply.product_id.to_primitive(), 0xbeef);
        assert_eq!(reply.config_value, 1);
        assert_eq!(reply.config_count, 1);
        assert_eq!(reply.iface_count, 1);
        assert_eq!(trim_string(&reply.bus_id), "1-1");
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
    server.stop();
}

#[test]
fn invalid_import_reports_status_and_skips_start() {
    let (device, started, _stopped) = probed_device(false);
    let (mut server, addr) = start_server(vec![device]);
    {
        let mut client = TestClient::connect(addr);
        let reply = client.import("9-9");
        assert_eq!(reply.status.to_primitive(), 1);
        assert_eq!(started.load(Ordering::SeqCst), 0);

        // the connection survives a failed import
        let reply = client.import("1-1");
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
    server.stop();
}

#[test]
fn malformed_bus_id_reports_status() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        assert_eq!(client.import("garbage").status.to_primitive(), 1);
        assert_eq!(client.import("1-0").status.to_primitive(), 1);
        assert_eq!(client.import("1-2").status.to_primitive(), 1);
    }
    server.stop();
}

#[test]
fn get_device_descriptor_over_the_wire() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        client.import("1-1");
        let (reply, data) = client.control_in(pack_dev_id(1, 1), 0x06, 0x0100, 18);
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(reply.actual_len.to_primitive(), 18);
        assert_eq!(reply.seq_num.to_primitive(), 1);
        assert_eq!(&data[..2], &[0x12, 0x01]);
    }
    server.stop();
}

#[test]
fn set_configuration_switches_the_served_descriptor() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        client.import("1-1");

        let reply = client.control_out(pack_dev_id(1, 1), 0x09, 0x0001);
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(reply.actual_len.to_primitive(), 0);

        // byte 5 of the configuration descriptor is bConfigurationValue
        let (reply, data) = client.control_in(pack_dev_id(1, 1), 0x06, 0x0200, 64);
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(data[5], 1);
        // full subtree: 9 + 9 + 7
        assert_eq!(data.len(), 25);
    }
    server.stop();
}

#[test]
fn invalid_set_configuration_keeps_connection_and_state() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        client.import("1-1");

        let reply = client.control_out(pack_dev_id(1, 1), 0x09, 0x0009);
        assert_eq!(reply.status.to_primitive(), 1);

        // the active configuration is untouched and the engine keeps going
        let (reply, data) = client.control_in(pack_dev_id(1, 1), 0x06, 0x0200, 64);
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(data[5], 1);
    }
    server.stop();
}

#[test]
fn out_transfer_payload_reaches_the_handler() {
    let (device, _started, _stopped) = probed_device(false);
    let (mut server, addr) = start_server(vec![device]);
    {
        let mut client = TestClient::connect(addr);
        client.import("1-1");

        // the echo handler hands the OUT payload back as the reply payload
        let (reply, data) = client.submit(
            pack_dev_id(1, 1),
            1,
            0,
            Default::default(),
            3,
            Some(b"abc"),
        );
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(reply.actual_len.to_primitive(), 3);
        assert_eq!(data, b"abc");
    }
    server.stop();
}

#[test]
fn handler_failure_answers_status_one_and_connection_survives() {
    let (device, _started, _stopped) = probed_device(true);
    let (mut server, addr) = start_server(vec![device]);
    {
        let mut client = TestClient::connect(addr);
        client.import("1-1");

        let (reply, data) =
            client.submit(pack_dev_id(1, 1), 1, 0, Default::default(), 0, None);
        assert_eq!(reply.status.to_primitive(), 1);
        assert!(data.is_empty());

        // standard requests are still served afterwards
        let (reply, _) = client.control_in(pack_dev_id(1, 1), 0x06, 0x0100, 18);
        assert_eq!(reply.status.to_primitive(), 0);
    }
    server.stop();
}

#[test]
fn unlink_stops_the_device() {
    let (device, _started, stopped) = probed_device(false);
    let (mut server, addr) = start_server(vec![device]);
    {
        let mut client = TestClient::connect(addr);
        client.import("1-1");

        let reply = client.unlink(pack_dev_id(1, 1), 1);
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        // an unlink for a device we never had answers with a bad status
        let reply = client.unlink(pack_dev_id(9, 9), 1);
        assert_eq!(reply.status.to_primitive(), 1);
    }
    server.stop();
}

#[test]
fn unknown_operation_command_closes_the_connection() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        client.send_raw(&[0x01, 0x11, 0x12, 0x34]);
        client.expect_close();
    }
    server.stop();
}

#[test]
fn unknown_phase_command_closes_the_connection() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        client.send_raw(&[0x00, 0x00, 0x00, 0x99]);
        client.expect_close();
    }
    server.stop();
}

#[test]
fn one_connection_carries_both_phases_in_order() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);

        let list = client.list();
        assert_eq!(list.devices.len(), 1);

        let import = client.import("1-1");
        assert_eq!(import.status.to_primitive(), 0);

        let (reply, data) = client.control_in(pack_dev_id(1, 1), 0x06, 0x0100, 18);
        assert_eq!(reply.status.to_primitive(), 0);
        assert_eq!(data.len(), 18);

        // operation-phase requests still parse after command-phase traffic
        let list = client.list();
        assert_eq!(list.devices.len(), 1);

        let reply = client.control_out(pack_dev_id(1, 1), 0x09, 0x0001);
        assert_eq!(reply.status.to_primitive(), 0);
    }
    server.stop();
}

#[test]
fn slow_clients_are_not_dropped_between_requests() {
    let (mut server, addr) = start_server(vec![dummy_device()]);
    {
        let mut client = TestClient::connect(addr);
        thread::sleep(Duration::from_millis(150));
        let list = client.list();
        assert_eq!(list.devices.len(), 1);
    }
    server.stop();
}

#[test]
fn concurrent_clients_see_identical_answers() {
    let devices = vec![dummy_device(), dummy_device(), dummy_device()];
    let (mut server, addr) = start_server(devices);

    let handles: Vec<_> = (1u32..=3)
        .map(|device_no| {
            thread::spawn(move || {
                let mut client = TestClient::connect(addr);
                let list = client.list();
                assert_eq!(list.devices.len(), 3);

                let import = client.import(&format!("1-{device_no}"));
                assert_eq!(import.status.to_primitive(), 0);
                assert_eq!(import.device_no.to_primitive(), device_no);

                let (reply, data) =
                    client.control_in(pack_dev_id(1, device_no), 0x06, 0x0100, 18);
                assert_eq!(reply.status.to_primitive(), 0);
                assert_eq!(data.len(), 18);
                assert_eq!(&data[..2], &[0x12, 0x01]);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    server.stop();
}

#[test]
fn attach_validates_and_records_ports() {
    let attacher = Arc::new(RecordingAttacher::default());
    let controller = VirtualController::new(vec![dummy_device(), dummy_device()]);
    let server = UsbIpServer::with_attacher(controller, attacher.clone());

    assert_eq!(server.attach("1-1").unwrap(), 0);
    assert_eq!(server.attach("1-2").unwrap(), 1);
    assert!(server.attach("1-3").is_err());
    assert!(server.attach("2-1").is_err());
    assert!(server.attach("bogus").is_err());
    assert_eq!(*attacher.attached.lock().unwrap(), vec!["1-1", "1-2"]);

    server.detach_all();
    let mut detached = attacher.detached.lock().unwrap().clone();
    detached.sort_unstable();
    assert_eq!(detached, vec![0, 1]);
}

#[test]
fn attach_all_uses_one_based_bus_ids() {
    let attacher = Arc::new(RecordingAttacher::default());
    let controller = VirtualController::new(vec![dummy_device(), dummy_device()]);
    let server = UsbIpServer::with_attacher(controller, attacher.clone());

    server.attach_all().unwrap();
    assert_eq!(*attacher.attached.lock().unwrap(), vec!["1-1", "1-2"]);
}
