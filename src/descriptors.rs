//! In-memory descriptor tree: device → configuration → interface →
//! endpoint. The tree is built once, before the server starts, and is
//! immutable afterwards; the derived fields (`bNumConfigurations`,
//! `bNumInterfaces`, `bNumEndpoints`, `wTotalLength`) are owned by the tree
//! and recomputed on every child-list change, never set by callers.

use packed_struct::prelude::*;

use crate::error::{Error, Result};
use crate::usb::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};

/// A device descriptor together with its configuration subtrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    descriptor: DeviceDescriptor,
    configurations: Vec<Configuration>,
}

impl Device {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            descriptor: DeviceDescriptor::new(vendor_id, product_id),
            configurations: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    /// Replace the configuration list. `bNumConfigurations` follows the
    /// list length.
    pub fn set_configurations(&mut self, configurations: Vec<Configuration>) {
        self.descriptor.b_num_configurations = configurations.len() as u8;
        self.configurations = configurations;
    }

    pub fn set_class(&mut self, class: u8, subclass: u8, protocol: u8) {
        self.descriptor.b_device_class = class;
        self.descriptor.b_device_sub_class = subclass;
        self.descriptor.b_device_protocol = protocol;
    }

    pub fn set_bcd_device(&mut self, bcd_device: u16) {
        self.descriptor.bcd_device = bcd_device.into();
    }

    pub fn set_max_packet_size(&mut self, size: u8) {
        self.descriptor.b_max_packet_size = size;
    }
}

/// One configuration subtree: the 9-byte configuration descriptor plus its
/// interfaces. The packed descriptor doubles as the "head" decode of the
/// full encoding; its `wTotalLength`/`bNumInterfaces` fields tell a reader
/// how much variable data follows.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    descriptor: ConfigurationDescriptor,
    interfaces: Vec<Interface>,
}

impl Configuration {
    pub fn new(configuration_value: u8, interfaces: Vec<Interface>) -> Self {
        let mut config = Self {
            descriptor: ConfigurationDescriptor::new(configuration_value),
            interfaces: Vec::new(),
        };
        config.set_interfaces(interfaces);
        config
    }

    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.descriptor
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Replace the interface list and recompute `bNumInterfaces` and
    /// `wTotalLength` over the whole subtree.
    pub fn set_interfaces(&mut self, interfaces: Vec<Interface>) {
        self.interfaces = interfaces;
        self.descriptor.b_num_interfaces = self.interfaces.len() as u8;
        let mut total = self.descriptor.b_length as u16;
        for iface in &self.interfaces {
            total += iface.descriptor.b_length as u16;
            for endpoint in &iface.endpoints {
                total += endpoint.b_length as u16;
            }
        }
        self.descriptor.w_total_length = total.into();
    }

    pub fn set_attributes(&mut self, bm_attributes: u8, b_max_power: u8) {
        self.descriptor.bm_attributes = bm_attributes;
        self.descriptor.b_max_power = b_max_power;
    }

    /// Full encoding: configuration, then each interface with its
    /// endpoints inline. `wTotalLength` bytes.
    pub fn pack_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = self.descriptor.pack()?.to_vec();
        for iface in &self.interfaces {
            out.extend_from_slice(&iface.pack_to_vec()?);
        }
        Ok(out)
    }

    /// Decode a full configuration encoding. The interface count comes from
    /// the fixed header; a reader that only has the first 9 bytes can
    /// instead unpack a [`ConfigurationDescriptor`] to learn how much more
    /// to fetch.
    pub fn unpack_from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < 9 {
            return Err(Error::MalformedPacket(format!(
                "configuration descriptor needs 9 bytes, got {}",
                data.len()
            )));
        }
        let descriptor = ConfigurationDescriptor::unpack_from_slice(&data[..9])?;
        let mut interfaces = Vec::with_capacity(descriptor.b_num_interfaces as usize);
        let mut offset = 9;
        for _ in 0..descriptor.b_num_interfaces {
            let iface = Interface::unpack_from_slice(&data[offset..])?;
            offset += iface.encoded_len();
            interfaces.push(iface);
        }
        Ok(Self {
            descriptor,
            interfaces,
        })
    }
}

/// One interface and its endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    descriptor: InterfaceDescriptor,
    endpoints: Vec<EndpointDescriptor>,
}

impl Interface {
    pub fn new(interface_number: u8, endpoints: Vec<EndpointDescriptor>) -> Self {
        let mut iface = Self {
            descriptor: InterfaceDescriptor::new(interface_number),
            endpoints: Vec::new(),
        };
        iface.set_endpoints(endpoints);
        iface
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    /// Replace the endpoint list. `bNumEndpoints` follows the list length.
    pub fn set_endpoints(&mut self, endpoints: Vec<EndpointDescriptor>) {
        self.descriptor.b_num_endpoints = endpoints.len() as u8;
        self.endpoints = endpoints;
    }

    pub fn set_class(&mut self, class: u8, subclass: u8, protocol: u8) {
        self.descriptor.b_interface_class = class;
        self.descriptor.b_interface_subclass = subclass;
        self.descriptor.b_interface_protocol = protocol;
    }

    pub fn pack_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = self.descriptor.pack()?.to_vec();
        for endpoint in &self.endpoints {
            out.extend_from_slice(&endpoint.pack()?);
        }
        Ok(out)
    }

    /// Decode an interface and the `bNumEndpoints` endpoint records that
    /// follow it.
    pub fn unpack_from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < 9 {
            return Err(Error::MalformedPacket(format!(
                "interface descriptor needs 9 bytes, got {}",
                data.len()
            )));
        }
        let descriptor = InterfaceDescriptor::unpack_from_slice(&data[..9])?;
        let needed = 9 + descriptor.b_num_endpoints as usize * 7;
        if data.len() < needed {
            return Err(Error::MalformedPacket(format!(
                "interface with {} endpoints needs {} bytes, got {}",
                descriptor.b_num_endpoints,
                needed,
                data.len()
            )));
        }
        let mut endpoints = Vec::with_capacity(descriptor.b_num_endpoints as usize);
        let mut offset = 9;
        for _ in 0..descriptor.b_num_endpoints {
            endpoints.push(EndpointDescriptor::unpack_from_slice(
                &data[offset..offset + 7],
            )?);
            offset += 7;
        }
        Ok(Self {
            descriptor,
            endpoints,
        })
    }

    pub(crate) fn encoded_len(&self) -> usize {
        9 + self.endpoints.len() * 7
    }
}
