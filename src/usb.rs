//! USB wire structures. Everything in this module is little-endian, as
//! mandated for descriptors and the URB setup block; the big-endian USB/IP
//! framing lives in [`crate::usbip`].

use packed_struct::prelude::*;

/// Descriptor type (bDescriptorType, wValue high byte).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
}

/// Standard request codes (bRequest) the controller routes itself. Anything
/// outside this set is either forwarded to the device hook (endpoint != 0)
/// or answered as a no-op.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq)]
pub enum StandardRequest {
    GetStatus = 0x00,
    GetDescriptor = 0x06,
    SetConfiguration = 0x09,
    SetInterface = 0x0b,
}

/// Top bit of bmRequestType carries the transfer direction.
pub const DIRECTION_MASK: u8 = 0x80;
pub const DEVICE_TO_HOST: u8 = 0x80;
pub const HOST_TO_DEVICE: u8 = 0x00;

/// wValue selectors for GET_DESCRIPTOR.
pub const DESCRIPTOR_DEVICE: u16 = 0x0100;
pub const DESCRIPTOR_CONFIGURATION: u16 = 0x0200;

/// 8-byte control-transfer setup block, carried verbatim inside
/// USBIP_CMD_SUBMIT and USBIP_RET_SUBMIT.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct SetupRequest {
    #[packed_field(bytes = "0")]
    pub bm_request_type: u8,
    #[packed_field(bytes = "1")]
    pub b_request: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_value: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_index: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6..=7", endian = "lsb")]
    pub w_length: Integer<u16, packed_bits::Bits<16>>,
}

impl SetupRequest {
    /// Transfer direction, masked from bmRequestType.
    pub fn direction(&self) -> u8 {
        self.bm_request_type & DIRECTION_MASK
    }
}

impl Default for SetupRequest {
    fn default() -> Self {
        Self {
            bm_request_type: 0,
            b_request: 0,
            w_value: Integer::from_primitive(0),
            w_index: Integer::from_primitive(0),
            w_length: Integer::from_primitive(0),
        }
    }
}

/// The Device Descriptor is the root of the descriptor tree and identifies
/// the device by vendor/product. 18 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "18")]
pub struct DeviceDescriptor {
    /// Size of this descriptor in bytes, always 18.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Device Descriptor Type = 1.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// USB Specification Release Number in binary-coded decimal.
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    /// Class code (assigned by the USB-IF).
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    /// Maximum packet size for endpoint zero.
    #[packed_field(bytes = "7")]
    pub b_max_packet_size: u8,
    #[packed_field(bytes = "8..=9", endian = "lsb")]
    pub id_vendor: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "10..=11", endian = "lsb")]
    pub id_product: Integer<u16, packed_bits::Bits<16>>,
    /// Device release number in binary-coded decimal.
    #[packed_field(bytes = "12..=13", endian = "lsb")]
    pub bcd_device: Integer<u16, packed_bits::Bits<16>>,
    /// String descriptor indices. Always zero here; string descriptors are
    /// not served.
    #[packed_field(bytes = "14")]
    pub i_manufacturer: u8,
    #[packed_field(bytes = "15")]
    pub i_product: u8,
    #[packed_field(bytes = "16")]
    pub i_serial_number: u8,
    /// Number of configurations. Derived from the configuration list by the
    /// owning [`crate::descriptors::Device`].
    #[packed_field(bytes = "17")]
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            b_length: 18,
            b_descriptor_type: DescriptorType::Device as u8,
            bcd_usb: Integer::from_primitive(0x0200),
            b_device_class: 0xff,
            b_device_sub_class: 0xff,
            b_device_protocol: 0xff,
            b_max_packet_size: 64,
            id_vendor: Integer::from_primitive(vendor_id),
            id_product: Integer::from_primitive(product_id),
            bcd_device: Integer::from_primitive(0x0100),
            i_manufacturer: 0x00,
            i_product: 0x00,
            i_serial_number: 0x00,
            b_num_configurations: 0,
        }
    }
}

/// The Configuration Descriptor heads one configuration subtree. 9 bytes on
/// its own; GET_DESCRIPTOR(CONFIGURATION) returns it followed by every
/// interface and endpoint descriptor, wTotalLength bytes in all.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct ConfigurationDescriptor {
    /// Size of this descriptor in bytes, always 9.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Configuration Descriptor Type = 2.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// Combined length of this descriptor and all interface and endpoint
    /// descriptors below it. Derived, recomputed on every interface change.
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_total_length: Integer<u16, packed_bits::Bits<16>>,
    /// Derived from the interface list.
    #[packed_field(bytes = "4")]
    pub b_num_interfaces: u8,
    /// Value to select this configuration with SET_CONFIGURATION.
    #[packed_field(bytes = "5")]
    pub b_configuration_value: u8,
    #[packed_field(bytes = "6")]
    pub i_configuration: u8,
    /// D7 reserved-set, D6 self-powered, D5 remote wakeup.
    #[packed_field(bytes = "7")]
    pub bm_attributes: u8,
    /// Maximum bus power draw in 2 mA units.
    #[packed_field(bytes = "8")]
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    pub fn new(configuration_value: u8) -> Self {
        Self {
            b_length: 9,
            b_descriptor_type: DescriptorType::Configuration as u8,
            w_total_length: Integer::from_primitive(9),
            b_num_interfaces: 0,
            b_configuration_value: configuration_value,
            i_configuration: 0,
            bm_attributes: 0xe0,
            b_max_power: 250,
        }
    }
}

/// Interface descriptor, 9 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct InterfaceDescriptor {
    /// Size of this descriptor in bytes, always 9.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Interface Descriptor Type = 4.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// The number of this interface, the key SET_INTERFACE selects by.
    #[packed_field(bytes = "2")]
    pub b_interface_number: u8,
    #[packed_field(bytes = "3")]
    pub b_alternate_setting: u8,
    /// Derived from the endpoint list (endpoint zero excluded).
    #[packed_field(bytes = "4")]
    pub b_num_endpoints: u8,
    #[packed_field(bytes = "5")]
    pub b_interface_class: u8,
    #[packed_field(bytes = "6")]
    pub b_interface_subclass: u8,
    #[packed_field(bytes = "7")]
    pub b_interface_protocol: u8,
    #[packed_field(bytes = "8")]
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub fn new(interface_number: u8) -> Self {
        Self {
            b_length: 9,
            b_descriptor_type: DescriptorType::Interface as u8,
            b_interface_number: interface_number,
            b_alternate_setting: 0,
            b_num_endpoints: 0,
            b_interface_class: 0xff,
            b_interface_subclass: 0xff,
            b_interface_protocol: 0xff,
            i_interface: 0,
        }
    }
}

/// Endpoint descriptor, 7 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "7")]
pub struct EndpointDescriptor {
    /// Size of this descriptor in bytes, always 7.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Endpoint Descriptor Type = 5.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// Endpoint number in bits 3..0, direction in bit 7 (1 = IN).
    #[packed_field(bytes = "2")]
    pub b_endpoint_address: u8,
    /// Transfer type in bits 1..0 (00 control, 01 iso, 10 bulk, 11 int).
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_max_packet_size: Integer<u16, packed_bits::Bits<16>>,
    /// Polling interval in (micro)frames.
    #[packed_field(bytes = "6")]
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub fn new(endpoint_address: u8, attributes: u8) -> Self {
        Self {
            b_length: 7,
            b_descriptor_type: DescriptorType::Endpoint as u8,
            b_endpoint_address: endpoint_address,
            bm_attributes: attributes,
            w_max_packet_size: Integer::from_primitive(64),
            b_interval: 0,
        }
    }
}
