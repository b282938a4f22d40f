use std::thread;
use std::time::Duration;

use simple_logger::SimpleLogger;

use virtual_usbip::descriptors::{Configuration, Interface};
use virtual_usbip::server::{self, UsbIpServer};
use virtual_usbip::usb::EndpointDescriptor;
use virtual_usbip::{VirtualController, VirtualDevice, VirtualDeviceBuilder};

/// Number of identical demo devices to expose.
const DEVICE_COUNT: usize = 1;

/// A vendor-class device with one configuration, one interface and one
/// bulk OUT endpoint. Enough for a client to list, import and configure.
fn demo_device() -> VirtualDevice {
    VirtualDeviceBuilder::new(0xdead, 0xbeef)
        .class(0xff, 0xff, 0xff)
        .configuration(Configuration::new(
            1,
            vec![Interface::new(0, vec![EndpointDescriptor::new(0x01, 0x02)])],
        ))
        .build()
}

fn main() {
    SimpleLogger::new().init().unwrap();

    let devices = (0..DEVICE_COUNT).map(|_| demo_device()).collect();
    let controller = VirtualController::new(devices);
    let mut server = UsbIpServer::new(controller);

    server::install_interrupt_handler();
    if let Err(e) = server.start(server::DEFAULT_BIND_IP, server::DEFAULT_BIND_PORT) {
        log::error!("failed to start server: {e}");
        return;
    }

    while !server::interrupted() {
        thread::sleep(Duration::from_millis(200));
    }
    server.stop();
    log::info!("server stopped");
}
