//! Virtual controller and device runtime. The controller owns one bus of
//! devices and routes submitted URBs: endpoint-zero standard requests are
//! answered here, everything else lands in the device's
//! [`UsbDeviceHandler`].

use std::sync::Mutex;

use packed_struct::prelude::*;

use crate::descriptors::{Configuration, Device, Interface};
use crate::error::{Error, Result};
use crate::usb::{
    StandardRequest, DESCRIPTOR_CONFIGURATION, DESCRIPTOR_DEVICE, DEVICE_TO_HOST,
    HOST_TO_DEVICE,
};
use crate::usbip::UsbIpCmdSubmit;

/// Every device reports as high speed.
pub const SPEED_HIGH: u32 = 2;

pub const DEFAULT_BUS_NO: u32 = 1;
pub const DEFAULT_PATH: &str = "/sys/devices/pci0000:00/0000:00:14.0/usb1/";

/// Pack a bus number and one-based device number into a wire dev_id.
pub fn pack_dev_id(bus_no: u32, device_no: u32) -> u32 {
    (bus_no << 16) | (device_no & 0xffff)
}

/// Split a wire dev_id back into bus number and device number.
pub fn split_dev_id(dev_id: u32) -> (u32, u32) {
    (dev_id >> 16, dev_id & 0xffff)
}

/// Parse an ASCII bus id of the form `"{bus_no}-{device_no}"`.
pub fn parse_bus_id(bus_id: &str) -> Option<(u32, u32)> {
    let (bus, device) = bus_id.split_once('-')?;
    Some((bus.parse().ok()?, device.parse().ok()?))
}

/// Device-specific transfer logic, supplied by the user of the crate.
///
/// `handle` receives every URB the controller does not answer itself: all
/// transfers to a non-zero endpoint. For IN transfers the returned bytes
/// become the reply payload; for OUT transfers the hook consumes `data`.
/// `start`/`stop` bracket the device's life on the wire: a successful
/// import starts it, an unlink stops it.
pub trait UsbDeviceHandler: Send {
    fn handle(&mut self, _packet: &UsbIpCmdSubmit, _data: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn start(&mut self) {}

    fn stop(&mut self) {}
}

/// The do-nothing handler a device gets when none is supplied.
pub struct NullHandler;

impl UsbDeviceHandler for NullHandler {}

/// Which configuration/interface of the descriptor tree is live. Indices
/// into the (immutable) child lists; the only mutable state a device has.
struct ActiveState {
    config: Option<usize>,
    interface: Option<usize>,
}

/// One virtual USB device: an immutable descriptor tree plus the active
/// configuration/interface pair and the user transfer hook.
pub struct VirtualDevice {
    descriptor: Device,
    speed: u32,
    state: Mutex<ActiveState>,
    handler: Mutex<Box<dyn UsbDeviceHandler>>,
}

impl VirtualDevice {
    pub fn new(descriptor: Device) -> Self {
        Self::with_handler(descriptor, Box::new(NullHandler))
    }

    /// On construction the first configuration and its first interface
    /// become active.
    pub fn with_handler(descriptor: Device, handler: Box<dyn UsbDeviceHandler>) -> Self {
        let config = if descriptor.configurations().is_empty() {
            None
        } else {
            Some(0)
        };
        let interface = config.and_then(|idx| {
            if descriptor.configurations()[idx].interfaces().is_empty() {
                None
            } else {
                Some(0)
            }
        });
        Self {
            descriptor,
            speed: SPEED_HIGH,
            state: Mutex::new(ActiveState { config, interface }),
            handler: Mutex::new(handler),
        }
    }

    pub fn descriptor(&self) -> &Device {
        &self.descriptor
    }

    pub fn speed(&self) -> u32 {
        self.speed
    }

    pub fn active_config(&self) -> Option<&Configuration> {
        let idx = self.state.lock().unwrap().config?;
        self.descriptor.configurations().get(idx)
    }

    pub fn active_interface(&self) -> Option<&Interface> {
        let state = self.state.lock().unwrap();
        let config = self.descriptor.configurations().get(state.config?)?;
        config.interfaces().get(state.interface?)
    }

    /// Activate a configuration. No value, or zero, selects the first one;
    /// anything else must match a `bConfigurationValue`. Activating a
    /// configuration also activates its first interface.
    pub fn set_configuration(&self, value: Option<u16>) -> Result<()> {
        let configs = self.descriptor.configurations();
        let idx = match value {
            None | Some(0) => {
                if configs.is_empty() {
                    return Err(Error::InvalidConfiguration(0));
                }
                0
            }
            Some(value) => configs
                .iter()
                .position(|c| u16::from(c.descriptor().b_configuration_value) == value)
                .ok_or(Error::InvalidConfiguration(value))?,
        };
        let mut state = self.state.lock().unwrap();
        state.config = Some(idx);
        state.interface = if configs[idx].interfaces().is_empty() {
            None
        } else {
            Some(0)
        };
        Ok(())
    }

    /// Activate an interface of the active configuration, keyed by
    /// `bInterfaceNumber`. No value, or zero, selects the first one.
    pub fn set_interface(&self, value: Option<u16>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let config_idx = state.config.ok_or(Error::NoConfiguration)?;
        let interfaces = self.descriptor.configurations()[config_idx].interfaces();
        let idx = match value {
            None | Some(0) => {
                if interfaces.is_empty() {
                    return Err(Error::InvalidInterface(0));
                }
                0
            }
            Some(value) => interfaces
                .iter()
                .position(|i| u16::from(i.descriptor().b_interface_number) == value)
                .ok_or(Error::InvalidInterface(value))?,
        };
        state.interface = Some(idx);
        Ok(())
    }

    /// Forward a non-control URB to the user hook.
    pub fn handle(&self, packet: &UsbIpCmdSubmit, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.handler.lock().unwrap().handle(packet, data)
    }

    pub fn start(&self) {
        self.handler.lock().unwrap().start();
    }

    pub fn stop(&self) {
        self.handler.lock().unwrap().stop();
    }
}

/// A single-bus collection of virtual devices and the central URB router.
///
/// The device list is fixed at construction; connections share the
/// controller read-only, and each device serializes its own mutable state.
pub struct VirtualController {
    bus_no: u32,
    path: String,
    devices: Vec<VirtualDevice>,
}

impl VirtualController {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        Self {
            bus_no: DEFAULT_BUS_NO,
            path: DEFAULT_PATH.to_string(),
            devices,
        }
    }

    pub fn bus_no(&self) -> u32 {
        self.bus_no
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn devices(&self) -> &[VirtualDevice] {
        &self.devices
    }

    /// Bus id for the one-based device number, e.g. `"1-1"`.
    pub fn bus_id(&self, device_no: u32) -> String {
        format!("{}-{}", self.bus_no, device_no)
    }

    /// Resolve a wire dev_id. The device number is one-based; zero, a
    /// foreign bus, or an out-of-range index all fail.
    pub fn get_device(&self, dev_id: u32) -> Result<&VirtualDevice> {
        let (bus_no, device_no) = split_dev_id(dev_id);
        if bus_no != self.bus_no || device_no == 0 {
            return Err(Error::UnknownDevice(format!("{bus_no}-{device_no}")));
        }
        self.devices
            .get(device_no as usize - 1)
            .ok_or_else(|| Error::UnknownDevice(format!("{bus_no}-{device_no}")))
    }

    /// Central URB router. Non-control transfers go to the device hook;
    /// recognized endpoint-zero standard requests are answered here; any
    /// other control request is logged and answered with no payload.
    pub fn handle(&self, packet: &UsbIpCmdSubmit, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let device = self.get_device(packet.dev_id.to_primitive())?;
        if packet.endpoint.to_primitive() != 0 {
            return device.handle(packet, data);
        }

        let setup = &packet.setup;
        let value = setup.w_value.to_primitive();
        match (setup.direction(), StandardRequest::from_primitive(setup.b_request)) {
            (DEVICE_TO_HOST, Some(StandardRequest::GetDescriptor))
                if value == DESCRIPTOR_DEVICE =>
            {
                log::debug!("descriptor request: DEVICE");
                Ok(Some(device.descriptor().descriptor().pack()?.to_vec()))
            }
            (DEVICE_TO_HOST, Some(StandardRequest::GetDescriptor))
                if value == DESCRIPTOR_CONFIGURATION =>
            {
                log::debug!("descriptor request: CONFIGURATION");
                let config = device.active_config().ok_or(Error::NoConfiguration)?;
                Ok(Some(config.pack_to_vec()?))
            }
            (DEVICE_TO_HOST, Some(StandardRequest::GetStatus)) => {
                log::debug!("status request");
                Ok(Some(Vec::new()))
            }
            (HOST_TO_DEVICE, Some(StandardRequest::SetConfiguration)) => {
                log::debug!("set configuration request: {value}");
                device.set_configuration(Some(value))?;
                Ok(None)
            }
            (HOST_TO_DEVICE, Some(StandardRequest::SetInterface)) => {
                // wValue carries the interface number shifted up one bit.
                let interface = value >> 1;
                log::debug!("set interface request: {interface}");
                device.set_interface(Some(interface))?;
                Ok(None)
            }
            _ => {
                log::error!(
                    "unhandled control request bmRequestType={:#04x} bRequest={:#04x}",
                    setup.bm_request_type,
                    setup.b_request
                );
                Ok(None)
            }
        }
    }
}

/// Fluent assembly of a [`VirtualDevice`].
pub struct VirtualDeviceBuilder {
    device: Device,
    handler: Option<Box<dyn UsbDeviceHandler>>,
}

impl VirtualDeviceBuilder {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            device: Device::new(vendor_id, product_id),
            handler: None,
        }
    }

    /// Set the device class triple.
    pub fn class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.device.set_class(class, subclass, protocol);
        self
    }

    pub fn bcd_device(mut self, bcd_device: u16) -> Self {
        self.device.set_bcd_device(bcd_device);
        self
    }

    pub fn max_packet_size(mut self, size: u8) -> Self {
        self.device.set_max_packet_size(size);
        self
    }

    /// Append a configuration. Derived descriptor counts follow along.
    pub fn configuration(mut self, config: Configuration) -> Self {
        let mut configs = self.device.configurations().to_vec();
        configs.push(config);
        self.device.set_configurations(configs);
        self
    }

    /// Install the transfer hook for non-control URBs.
    pub fn handler(mut self, handler: Box<dyn UsbDeviceHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> VirtualDevice {
        match self.handler {
            Some(handler) => VirtualDevice::with_handler(self.device, handler),
            None => VirtualDevice::new(self.device),
        }
    }
}
