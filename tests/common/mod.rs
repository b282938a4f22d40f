//! Shared test plumbing: a mock USB/IP client speaking the same staged
//! reads a kernel-side client performs, plus recording device handlers and
//! attachers.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use packed_struct::prelude::*;

use virtual_usbip::attach::Attacher;
use virtual_usbip::descriptors::{Configuration, Interface};
use virtual_usbip::usb::{EndpointDescriptor, SetupRequest};
use virtual_usbip::usbip::{
    DevlistDevice, DevlistEntry, DevlistInterface, OpRepDevlist, OpRepDevlistHeader,
    OpRepImport, OpReqDevlist, OpReqImport, UsbIpCmdSubmit, UsbIpCmdUnlink, UsbIpRetSubmit,
    UsbIpRetUnlink, DEVLIST_DEVICE_SIZE, DEVLIST_INTERFACE_SIZE, OP_REP_DEVLIST_HEADER_SIZE,
    OP_REP_IMPORT_SIZE, USBIP_CMD_SIZE, USBIP_DIR_IN, USBIP_DIR_OUT,
};
use virtual_usbip::{
    Error, Result, UsbDeviceHandler, UsbIpServer, VirtualController, VirtualDevice,
    VirtualDeviceBuilder,
};

/// Fake USB/IP client with the same command set as the platform `usbip`
/// tool, driven over one long-lived connection.
pub struct TestClient {
    stream: TcpStream,
    seq_num: u32,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream, seq_num: 0 }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq_num += 1;
        self.seq_num
    }

    pub fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).unwrap();
    }

    fn read_exact_vec(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Read until the peer closes the connection; panics on payload bytes.
    pub fn expect_close(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => panic!("expected the server to close the connection"),
            }
        }
    }

    /// List exported devices. The reply has no overall length, so this
    /// reads 12 header bytes, then 312 bytes per device, then 4 bytes per
    /// interface.
    pub fn list(&mut self) -> OpRepDevlist {
        self.send_raw(&OpReqDevlist::new().pack().unwrap());
        let head = self.read_exact_vec(OP_REP_DEVLIST_HEADER_SIZE);
        let header = OpRepDevlistHeader::unpack_from_slice(&head).unwrap();
        let mut devices = Vec::new();
        for _ in 0..header.device_count.to_primitive() {
            let raw = self.read_exact_vec(DEVLIST_DEVICE_SIZE);
            let device = DevlistDevice::unpack_from_slice(&raw).unwrap();
            let mut interfaces = Vec::new();
            for _ in 0..device.iface_count {
                let raw = self.read_exact_vec(DEVLIST_INTERFACE_SIZE);
                interfaces.push(DevlistInterface::unpack_from_slice(&raw).unwrap());
            }
            devices.push(DevlistEntry { device, interfaces });
        }
        OpRepDevlist { header, devices }
    }

    pub fn import(&mut self, bus_id: &str) -> OpRepImport {
        self.send_raw(&OpReqImport::new(bus_id).pack().unwrap());
        let raw = self.read_exact_vec(OP_REP_IMPORT_SIZE);
        OpRepImport::unpack_from_slice(&raw).unwrap()
    }

    pub fn submit(
        &mut self,
        dev_id: u32,
        endpoint: u32,
        direction: u32,
        setup: SetupRequest,
        buffer_len: u32,
        payload: Option<&[u8]>,
    ) -> (UsbIpRetSubmit, Vec<u8>) {
        let mut cmd = UsbIpCmdSubmit::new();
        cmd.seq_num = Integer::from_primitive(self.next_seq());
        cmd.dev_id = Integer::from_primitive(dev_id);
        cmd.direction = Integer::from_primitive(direction);
        cmd.endpoint = Integer::from_primitive(endpoint);
        cmd.buffer_len = Integer::from_primitive(buffer_len);
        cmd.setup = setup;

        let mut raw = cmd.pack().unwrap().to_vec();
        if let Some(payload) = payload {
            raw.extend_from_slice(payload);
        }
        self.send_raw(&raw);

        let head = self.read_exact_vec(USBIP_CMD_SIZE);
        let reply = UsbIpRetSubmit::unpack_from_slice(&head).unwrap();
        let data = match reply.actual_len.to_primitive() {
            0 => Vec::new(),
            len => self.read_exact_vec(len as usize),
        };
        (reply, data)
    }

    /// IN control transfer on endpoint zero.
    pub fn control_in(
        &mut self,
        dev_id: u32,
        request: u8,
        value: u16,
        length: u16,
    ) -> (UsbIpRetSubmit, Vec<u8>) {
        let setup = SetupRequest {
            bm_request_type: 0x80,
            b_request: request,
            w_value: Integer::from_primitive(value),
            w_index: Integer::from_primitive(0),
            w_length: Integer::from_primitive(length),
        };
        self.submit(dev_id, 0, USBIP_DIR_IN, setup, u32::from(length), None)
    }

    /// OUT control transfer on endpoint zero, no payload.
    pub fn control_out(&mut self, dev_id: u32, request: u8, value: u16) -> UsbIpRetSubmit {
        let setup = SetupRequest {
            bm_request_type: 0x00,
            b_request: request,
            w_value: Integer::from_primitive(value),
            w_index: Integer::from_primitive(0),
            w_length: Integer::from_primitive(0),
        };
        self.submit(dev_id, 0, USBIP_DIR_OUT, setup, 0, None).0
    }

    pub fn unlink(&mut self, dev_id: u32, victim_seq: u32) -> UsbIpRetUnlink {
        let cmd = UsbIpCmdUnlink::new(self.next_seq(), dev_id, victim_seq);
        self.send_raw(&cmd.pack().unwrap());
        let raw = self.read_exact_vec(USBIP_CMD_SIZE);
        UsbIpRetUnlink::unpack_from_slice(&raw).unwrap()
    }
}

/// Device hook that records lifecycle calls and echoes OUT payloads, or
/// fails every transfer when `fail` is set.
pub struct TestHandler {
    pub started: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
    pub fail: bool,
}

impl UsbDeviceHandler for TestHandler {
    fn handle(&mut self, _packet: &UsbIpCmdSubmit, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.fail {
            return Err(Error::DeviceHandler("simulated device fault".into()));
        }
        Ok(Some(data.to_vec()))
    }

    fn start(&mut self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// The stock test device: vendor 0xdead, product 0xbeef, one configuration
/// with one vendor-class interface and one bulk OUT endpoint.
pub fn dummy_device() -> VirtualDevice {
    VirtualDeviceBuilder::new(0xdead, 0xbeef)
        .class(0xff, 0xff, 0xff)
        .configuration(Configuration::new(
            1,
            vec![Interface::new(0, vec![EndpointDescriptor::new(0x01, 0x02)])],
        ))
        .build()
}

/// [`dummy_device`] with a [`TestHandler`] wired in; returns the
/// started/stopped counters alongside.
pub fn probed_device(fail: bool) -> (VirtualDevice, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let device = VirtualDeviceBuilder::new(0xdead, 0xbeef)
        .class(0xff, 0xff, 0xff)
        .configuration(Configuration::new(
            1,
            vec![Interface::new(0, vec![EndpointDescriptor::new(0x01, 0x02)])],
        ))
        .handler(Box::new(TestHandler {
            started: started.clone(),
            stopped: stopped.clone(),
            fail,
        }))
        .build();
    (device, started, stopped)
}

/// Start a server on an ephemeral loopback port.
pub fn start_server(devices: Vec<VirtualDevice>) -> (UsbIpServer, SocketAddr) {
    let mut server = UsbIpServer::new(VirtualController::new(devices));
    server.start("127.0.0.1", 0).unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Attacher that records calls instead of shelling out.
#[derive(Default)]
pub struct RecordingAttacher {
    pub attached: Mutex<Vec<String>>,
    pub detached: Mutex<Vec<u32>>,
}

impl Attacher for RecordingAttacher {
    fn attach(&self, bus_id: &str) -> Result<()> {
        self.attached.lock().unwrap().push(bus_id.to_string());
        Ok(())
    }

    fn detach(&self, port: u32) -> Result<()> {
        self.detached.lock().unwrap().push(port);
        Ok(())
    }
}
