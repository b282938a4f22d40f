//! USB/IP TCP server. One accept thread polls the listener; every accepted
//! connection gets its own worker thread running a [`Connection`] protocol
//! engine against the shared [`VirtualController`]. Shutdown is
//! cooperative: workers re-check `keep_alive` whenever their 5-second read
//! timeout fires, so a `stop()` call drains the whole server without
//! tearing sockets out from under in-flight requests.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use packed_struct::prelude::*;
use socket2::{Domain, Socket, Type};

use crate::attach::{Attacher, NullAttacher};
use crate::controller::{pack_dev_id, parse_bus_id, VirtualController};
use crate::error::{Error, Result};
use crate::usbip::{
    pad_string, trim_string, DevlistDevice, DevlistEntry, DevlistInterface, OpRepDevlist,
    OpRepImport, OpReqDevlist, OpReqImport, UsbIpCmdSubmit, UsbIpCmdUnlink, UsbIpRetSubmit,
    UsbIpRetUnlink, OP_REQ_DEVLIST, OP_REQ_DEVLIST_SIZE, OP_REQ_IMPORT, OP_REQ_IMPORT_SIZE,
    USBIP_CMD_SIZE, USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK, USBIP_DIR_OUT,
};

pub const DEFAULT_BIND_IP: &str = "0.0.0.0";
pub const DEFAULT_BIND_PORT: u16 = 3240;

/// Receive timeout on every connection socket. A fired timeout is not an
/// error; it hands control back so the worker can observe `keep_alive`.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install a SIGINT handler that flips a process-wide flag. Poll it with
/// [`interrupted`] and call [`UsbIpServer::stop`] when it trips.
pub fn install_interrupt_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_interrupt as libc::sighandler_t);
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// The USB/IP server: listener lifecycle plus attach/detach bookkeeping.
pub struct UsbIpServer {
    controller: Arc<VirtualController>,
    attacher: Arc<dyn Attacher>,
    keep_alive: Arc<AtomicBool>,
    listener_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    ports: Mutex<HashMap<u32, String>>,
}

impl UsbIpServer {
    pub fn new(controller: VirtualController) -> Self {
        Self::with_attacher(controller, Arc::new(NullAttacher))
    }

    pub fn with_attacher(controller: VirtualController, attacher: Arc<dyn Attacher>) -> Self {
        Self {
            controller: Arc::new(controller),
            attacher,
            keep_alive: Arc::new(AtomicBool::new(false)),
            listener_thread: None,
            local_addr: None,
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn controller(&self) -> &VirtualController {
        &self.controller
    }

    /// Address the listener actually bound, once started. Binding port 0
    /// picks an ephemeral port, which is what the tests do.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the accept thread.
    pub fn start(&mut self, bind_ip: &str, bind_port: u16) -> Result<()> {
        log::info!("starting USB/IP server on {bind_ip}:{bind_port}");

        let addr: SocketAddr = format!("{bind_ip}:{bind_port}").parse().map_err(|e| {
            Error::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("bad bind address: {e}"),
            ))
        })?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        self.local_addr = Some(listener.local_addr()?);

        self.keep_alive.store(true, Ordering::SeqCst);
        let controller = self.controller.clone();
        let keep_alive = self.keep_alive.clone();
        self.listener_thread = Some(thread::spawn(move || {
            accept_loop(listener, controller, keep_alive);
        }));
        Ok(())
    }

    /// Detach everything, then drain the accept thread and its workers.
    pub fn stop(&mut self) {
        log::info!("stopping the USB/IP server");
        self.detach_all();
        self.keep_alive.store(false, Ordering::SeqCst);
        if let Some(thread) = self.listener_thread.take() {
            let _ = thread.join();
        }
    }

    /// Ask the attacher to bind one listed device on the local host. The
    /// bus id is validated against the controller first.
    pub fn attach(&self, bus_id: &str) -> Result<u32> {
        log::debug!("attaching device {bus_id}");
        let (bus_no, device_no) =
            parse_bus_id(bus_id).ok_or_else(|| Error::UnknownDevice(bus_id.to_string()))?;
        if bus_no != self.controller.bus_no()
            || device_no == 0
            || device_no as usize > self.controller.devices().len()
        {
            return Err(Error::UnknownDevice(bus_id.to_string()));
        }

        self.attacher.attach(bus_id)?;
        let mut ports = self.ports.lock().unwrap();
        let port = ports.len() as u32;
        ports.insert(port, bus_id.to_string());
        Ok(port)
    }

    /// Release a previously attached port. Detach trouble is logged, not
    /// propagated.
    pub fn detach(&self, port: u32) {
        log::debug!("detaching port {port}");
        if let Err(e) = self.attacher.detach(port) {
            log::warn!("error while detaching port {port}: {e}");
        }
        self.ports.lock().unwrap().remove(&port);
    }

    pub fn attach_all(&self) -> Result<()> {
        for device_no in 1..=self.controller.devices().len() as u32 {
            self.attach(&self.controller.bus_id(device_no))?;
        }
        Ok(())
    }

    pub fn detach_all(&self) {
        let ports: Vec<u32> = self.ports.lock().unwrap().keys().copied().collect();
        for port in ports {
            self.detach(port);
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    controller: Arc<VirtualController>,
    keep_alive: Arc<AtomicBool>,
) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    while keep_alive.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("connection from {peer}");
                let controller = controller.clone();
                let keep_alive = keep_alive.clone();
                workers.push(thread::spawn(move || {
                    match Connection::new(stream, controller, keep_alive) {
                        Ok(mut connection) => {
                            if let Err(e) = connection.run() {
                                log::error!("connection from {peer} closed: {e}");
                            }
                        }
                        Err(e) => log::error!("failed to set up connection from {peer}: {e}"),
                    }
                }));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("accept failed: {e}");
                break;
            }
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
}

/// Per-connection protocol engine. One TCP connection carries first the
/// operation phase (list/import) and then, after a successful import, the
/// command phase (submit/unlink); the two are told apart structurally by
/// the first word of each packet.
struct Connection {
    stream: TcpStream,
    controller: Arc<VirtualController>,
    keep_alive: Arc<AtomicBool>,
}

impl Connection {
    fn new(
        stream: TcpStream,
        controller: Arc<VirtualController>,
        keep_alive: Arc<AtomicBool>,
    ) -> Result<Self> {
        // The listener is non-blocking; the workers must not be.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(Self {
            stream,
            controller,
            keep_alive,
        })
    }

    fn run(&mut self) -> Result<()> {
        loop {
            if !self.keep_alive.load(Ordering::SeqCst) {
                return Ok(());
            }

            let mut head = [0u8; 4];
            let n = match self.stream.read(&mut head) {
                // Zero bytes means the client hung up.
                Ok(0) => {
                    log::debug!("client disconnected");
                    return Ok(());
                }
                Ok(n) => n,
                // A timeout between packets just means nothing is pending;
                // loop so the keep_alive check runs again.
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            // Mid-packet shortfalls (including timeouts) abort the
            // connection; there is no resuming a half-read packet.
            self.stream.read_exact(&mut head[n..])?;

            // OP_REQ packets lead with the non-zero protocol version,
            // USBIP_CMD packets with the zero upper half of their command
            // word.
            let first = u16::from_be_bytes([head[0], head[1]]);
            let second = u16::from_be_bytes([head[2], head[3]]);
            let response = if first > 0 {
                match second {
                    OP_REQ_DEVLIST => {
                        let raw = self.read_packet::<OP_REQ_DEVLIST_SIZE>(head)?;
                        self.op_devlist(OpReqDevlist::unpack(&raw)?)?
                    }
                    OP_REQ_IMPORT => {
                        let raw = self.read_packet::<OP_REQ_IMPORT_SIZE>(head)?;
                        self.op_import(OpReqImport::unpack(&raw)?)?
                    }
                    other => {
                        log::error!("unknown packet received");
                        return Err(Error::UnknownCommand(other));
                    }
                }
            } else {
                match u32::from(second) {
                    USBIP_CMD_SUBMIT => {
                        let raw = self.read_packet::<USBIP_CMD_SIZE>(head)?;
                        self.cmd_submit(UsbIpCmdSubmit::unpack(&raw)?)?
                    }
                    USBIP_CMD_UNLINK => {
                        let raw = self.read_packet::<USBIP_CMD_SIZE>(head)?;
                        self.cmd_unlink(UsbIpCmdUnlink::unpack(&raw)?)?
                    }
                    _ => {
                        log::error!("unknown packet received");
                        return Err(Error::UnknownCommand(second));
                    }
                }
            };

            self.stream.write_all(&response)?;
            log::debug!("sent response ({}B)", response.len());
        }
    }

    /// Read the rest of a packet whose first four bytes are already in
    /// hand.
    fn read_packet<const N: usize>(&mut self, head: [u8; 4]) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf[..4].copy_from_slice(&head);
        self.stream.read_exact(&mut buf[4..])?;
        Ok(buf)
    }

    fn op_devlist(&mut self, packet: OpReqDevlist) -> Result<Vec<u8>> {
        log::debug!("received OP_REQ_DEVLIST");

        let mut entries = Vec::with_capacity(self.controller.devices().len());
        for (idx, device) in self.controller.devices().iter().enumerate() {
            let device_no = idx as u32 + 1;
            let bus_id = self.controller.bus_id(device_no);
            let desc = device.descriptor().descriptor();

            let interfaces: Vec<DevlistInterface> = device
                .active_config()
                .map(|config| {
                    config
                        .interfaces()
                        .iter()
                        .map(|iface| DevlistInterface {
                            iface_class: iface.descriptor().b_interface_class,
                            iface_subclass: iface.descriptor().b_interface_subclass,
                            iface_proto: iface.descriptor().b_interface_protocol,
                            padding: 0,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let record = DevlistDevice {
                path: pad_string(&format!("{}{}", self.controller.path(), bus_id)),
                bus_id: pad_string(&bus_id),
                bus_num: Integer::from_primitive(self.controller.bus_no()),
                device_num: Integer::from_primitive(device_no),
                speed: Integer::from_primitive(device.speed()),
                vendor_id: desc.id_vendor,
                product_id: desc.id_product,
                device_version: desc.bcd_device,
                device_class: desc.b_device_class,
                device_subclass: desc.b_device_sub_class,
                device_protocol: desc.b_device_protocol,
                config_value: device
                    .active_config()
                    .map(|c| c.descriptor().b_configuration_value)
                    .unwrap_or(0),
                config_count: desc.b_num_configurations,
                iface_count: 0,
            };
            entries.push(DevlistEntry::new(record, interfaces));
        }

        OpRepDevlist::new(packet.version.to_primitive(), entries).pack_to_vec()
    }

    fn op_import(&mut self, packet: OpReqImport) -> Result<Vec<u8>> {
        log::debug!("received OP_REQ_IMPORT");

        let bus_id = trim_string(&packet.bus_id);
        let version = packet.version.to_primitive();
        let resolved = parse_bus_id(&bus_id).and_then(|(bus_no, device_no)| {
            self.controller
                .get_device(pack_dev_id(bus_no, device_no))
                .ok()
                .map(|device| (bus_no, device_no, device))
        });

        // An invalid bus id is not fatal; the reply carries the bad status.
        let Some((bus_no, device_no, device)) = resolved else {
            log::error!("requested to import invalid bus_id ({bus_id})");
            return Ok(OpRepImport::new(version, 1).pack()?.to_vec());
        };

        device.start();

        let desc = device.descriptor().descriptor();
        let mut reply = OpRepImport::new(version, 0);
        reply.full_path = pad_string(&format!("{}{}", self.controller.path(), bus_id));
        reply.bus_id = pad_string(&bus_id);
        reply.bus_no = Integer::from_primitive(bus_no);
        reply.device_no = Integer::from_primitive(device_no);
        reply.device_speed = Integer::from_primitive(device.speed());
        reply.vendor_id = desc.id_vendor;
        reply.product_id = desc.id_product;
        reply.device_version = desc.bcd_device;
        reply.device_class = desc.b_device_class;
        reply.device_subclass = desc.b_device_sub_class;
        reply.device_protocol = desc.b_device_protocol;
        reply.config_value = device
            .active_config()
            .map(|c| c.descriptor().b_configuration_value)
            .unwrap_or(0);
        reply.config_count = desc.b_num_configurations;
        reply.iface_count = device
            .active_config()
            .map(|c| c.descriptor().b_num_interfaces)
            .unwrap_or(0);
        Ok(reply.pack()?.to_vec())
    }

    fn cmd_submit(&mut self, packet: UsbIpCmdSubmit) -> Result<Vec<u8>> {
        log::debug!("received USBIP_CMD_SUBMIT");

        let mut reply = UsbIpRetSubmit::new(
            packet.seq_num.to_primitive(),
            packet.dev_id.to_primitive(),
        );

        // An OUT transfer carries its payload right behind the header.
        let buffer_len = packet.buffer_len.to_primitive() as usize;
        let mut data = Vec::new();
        if packet.direction.to_primitive() == USBIP_DIR_OUT && buffer_len > 0 {
            data.resize(buffer_len, 0);
            self.stream.read_exact(&mut data)?;
        }

        match self.controller.handle(&packet, &data) {
            Ok(Some(payload)) => {
                reply.actual_len = Integer::from_primitive(payload.len() as u32);
                let mut response = reply.pack()?.to_vec();
                response.extend_from_slice(&payload);
                Ok(response)
            }
            Ok(None) => Ok(reply.pack()?.to_vec()),
            // Per-request failures answer with a bad status and leave the
            // connection up.
            Err(e) => {
                log::error!("error handling USBIP_CMD_SUBMIT: {e}");
                reply.status = Integer::from_primitive(1);
                Ok(reply.pack()?.to_vec())
            }
        }
    }

    fn cmd_unlink(&mut self, packet: UsbIpCmdUnlink) -> Result<Vec<u8>> {
        log::debug!("received USBIP_CMD_UNLINK");

        let dev_id = packet.dev_id.to_primitive();
        let mut reply = UsbIpRetUnlink::new(packet.seq_num.to_primitive(), dev_id);
        match self.controller.get_device(dev_id) {
            Ok(device) => device.stop(),
            Err(e) => {
                log::error!("error handling USBIP_CMD_UNLINK: {e}");
                reply.status = Integer::from_primitive(1);
            }
        }
        Ok(reply.pack()?.to_vec())
    }
}
