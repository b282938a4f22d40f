//! USB/IP wire packets. All multi-byte fields here are big-endian; the
//! embedded URB setup block keeps its little-endian USB layout.
//!
//! Fixed-size packets are plain `PackedStruct`s. `OP_REP_DEVLIST` carries a
//! nested variable-length device list and is modelled as a packed header
//! plus per-device records; its decode is staged exactly the way a client
//! must read the stream, 312 bytes per device followed by 4 bytes per
//! interface, because the reply carries no overall length.

use packed_struct::prelude::*;

use crate::error::{Error, Result};
use crate::usb::SetupRequest;

pub const USBIP_VERSION: u16 = 0x0111;

/// Operation-phase command codes (first word non-zero: protocol version).
pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Command-phase command codes (first word zero).
pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
pub const USBIP_RET_UNLINK: u32 = 0x0004;

pub const USBIP_DIR_OUT: u32 = 0;
pub const USBIP_DIR_IN: u32 = 1;

pub const OP_REQ_DEVLIST_SIZE: usize = 8;
pub const OP_REP_DEVLIST_HEADER_SIZE: usize = 12;
pub const DEVLIST_DEVICE_SIZE: usize = 312;
pub const DEVLIST_INTERFACE_SIZE: usize = 4;
pub const OP_REQ_IMPORT_SIZE: usize = 40;
pub const OP_REP_IMPORT_SIZE: usize = 320;
pub const USBIP_CMD_SIZE: usize = 48;

/// Copy `value` into a zero-padded fixed-size field, truncating if needed.
pub fn pad_string<const N: usize>(value: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Read a zero-padded fixed-size field back, trimming at the first NUL.
pub fn trim_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// OP_REQ_DEVLIST, 8 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct OpReqDevlist {
    #[packed_field(bytes = "0..=1", endian = "msb")]
    pub version: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "2..=3", endian = "msb")]
    pub command: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub status: Integer<u32, packed_bits::Bits<32>>,
}

impl OpReqDevlist {
    pub fn new() -> Self {
        Self {
            version: Integer::from_primitive(USBIP_VERSION),
            command: Integer::from_primitive(OP_REQ_DEVLIST),
            status: Integer::from_primitive(0),
        }
    }
}

impl Default for OpReqDevlist {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed head of OP_REP_DEVLIST, 12 bytes. `device_count` announces how
/// many [`DevlistDevice`] records follow.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct OpRepDevlistHeader {
    #[packed_field(bytes = "0..=1", endian = "msb")]
    pub version: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "2..=3", endian = "msb")]
    pub command: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub status: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub device_count: Integer<u32, packed_bits::Bits<32>>,
}

/// One exported device inside OP_REP_DEVLIST, 312 bytes. The interface
/// records follow separately; `iface_count` says how many.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "312")]
pub struct DevlistDevice {
    #[packed_field(bytes = "0..=255", element_size_bytes = "1", endian = "msb")]
    pub path: [u8; 256],
    #[packed_field(bytes = "256..=287", element_size_bytes = "1", endian = "msb")]
    pub bus_id: [u8; 32],
    #[packed_field(bytes = "288..=291", endian = "msb")]
    pub bus_num: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "292..=295", endian = "msb")]
    pub device_num: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "296..=299", endian = "msb")]
    pub speed: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "300..=301", endian = "msb")]
    pub vendor_id: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "302..=303", endian = "msb")]
    pub product_id: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "304..=305", endian = "msb")]
    pub device_version: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "306")]
    pub device_class: u8,
    #[packed_field(bytes = "307")]
    pub device_subclass: u8,
    #[packed_field(bytes = "308")]
    pub device_protocol: u8,
    #[packed_field(bytes = "309")]
    pub config_value: u8,
    #[packed_field(bytes = "310")]
    pub config_count: u8,
    #[packed_field(bytes = "311")]
    pub iface_count: u8,
}

/// One interface record inside OP_REP_DEVLIST, 4 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "4")]
pub struct DevlistInterface {
    #[packed_field(bytes = "0")]
    pub iface_class: u8,
    #[packed_field(bytes = "1")]
    pub iface_subclass: u8,
    #[packed_field(bytes = "2")]
    pub iface_proto: u8,
    #[packed_field(bytes = "3")]
    pub padding: u8,
}

/// A [`DevlistDevice`] paired with its interface records. `iface_count` in
/// the record is derived from the list length.
#[derive(Debug, Clone, PartialEq)]
pub struct DevlistEntry {
    pub device: DevlistDevice,
    pub interfaces: Vec<DevlistInterface>,
}

impl DevlistEntry {
    pub fn new(mut device: DevlistDevice, interfaces: Vec<DevlistInterface>) -> Self {
        device.iface_count = interfaces.len() as u8;
        Self { device, interfaces }
    }
}

/// Complete OP_REP_DEVLIST: fixed head plus the device list.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRepDevlist {
    pub header: OpRepDevlistHeader,
    pub devices: Vec<DevlistEntry>,
}

impl OpRepDevlist {
    pub fn new(version: u16, devices: Vec<DevlistEntry>) -> Self {
        Self {
            header: OpRepDevlistHeader {
                version: Integer::from_primitive(version),
                command: Integer::from_primitive(OP_REP_DEVLIST),
                status: Integer::from_primitive(0),
                device_count: Integer::from_primitive(devices.len() as u32),
            },
            devices,
        }
    }

    pub fn pack_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = self.header.pack()?.to_vec();
        for entry in &self.devices {
            out.extend_from_slice(&entry.device.pack()?);
            for iface in &entry.interfaces {
                out.extend_from_slice(&iface.pack()?);
            }
        }
        Ok(out)
    }

    /// Staged decode: 12-byte head, then per device a full 312-byte record
    /// followed by `iface_count` 4-byte interface records.
    pub fn unpack_from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < OP_REP_DEVLIST_HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "devlist reply needs {OP_REP_DEVLIST_HEADER_SIZE} header bytes, got {}",
                data.len()
            )));
        }
        let header =
            OpRepDevlistHeader::unpack_from_slice(&data[..OP_REP_DEVLIST_HEADER_SIZE])?;
        let mut offset = OP_REP_DEVLIST_HEADER_SIZE;
        let mut devices = Vec::with_capacity(header.device_count.to_primitive() as usize);
        for _ in 0..header.device_count.to_primitive() {
            if data.len() < offset + DEVLIST_DEVICE_SIZE {
                return Err(Error::MalformedPacket(
                    "devlist reply truncated inside a device record".to_string(),
                ));
            }
            let device = DevlistDevice::unpack_from_slice(
                &data[offset..offset + DEVLIST_DEVICE_SIZE],
            )?;
            offset += DEVLIST_DEVICE_SIZE;
            let mut interfaces = Vec::with_capacity(device.iface_count as usize);
            for _ in 0..device.iface_count {
                if data.len() < offset + DEVLIST_INTERFACE_SIZE {
                    return Err(Error::MalformedPacket(
                        "devlist reply truncated inside an interface record".to_string(),
                    ));
                }
                interfaces.push(DevlistInterface::unpack_from_slice(
                    &data[offset..offset + DEVLIST_INTERFACE_SIZE],
                )?);
                offset += DEVLIST_INTERFACE_SIZE;
            }
            devices.push(DevlistEntry { device, interfaces });
        }
        Ok(Self { header, devices })
    }
}

/// OP_REQ_IMPORT, 40 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "40")]
pub struct OpReqImport {
    #[packed_field(bytes = "0..=1", endian = "msb")]
    pub version: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "2..=3", endian = "msb")]
    pub command: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub status: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=39", element_size_bytes = "1", endian = "msb")]
    pub bus_id: [u8; 32],
}

impl OpReqImport {
    pub fn new(bus_id: &str) -> Self {
        Self {
            version: Integer::from_primitive(USBIP_VERSION),
            command: Integer::from_primitive(OP_REQ_IMPORT),
            status: Integer::from_primitive(0),
            bus_id: pad_string(bus_id),
        }
    }
}

/// OP_REP_IMPORT, 320 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "320")]
pub struct OpRepImport {
    #[packed_field(bytes = "0..=1", endian = "msb")]
    pub version: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "2..=3", endian = "msb")]
    pub command: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub status: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=263", element_size_bytes = "1", endian = "msb")]
    pub full_path: [u8; 256],
    #[packed_field(bytes = "264..=295", element_size_bytes = "1", endian = "msb")]
    pub bus_id: [u8; 32],
    #[packed_field(bytes = "296..=299", endian = "msb")]
    pub bus_no: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "300..=303", endian = "msb")]
    pub device_no: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "304..=307", endian = "msb")]
    pub device_speed: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "308..=309", endian = "msb")]
    pub vendor_id: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "310..=311", endian = "msb")]
    pub product_id: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "312..=313", endian = "msb")]
    pub device_version: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "314")]
    pub device_class: u8,
    #[packed_field(bytes = "315")]
    pub device_subclass: u8,
    #[packed_field(bytes = "316")]
    pub device_protocol: u8,
    #[packed_field(bytes = "317")]
    pub config_value: u8,
    #[packed_field(bytes = "318")]
    pub config_count: u8,
    #[packed_field(bytes = "319")]
    pub iface_count: u8,
}

impl OpRepImport {
    /// Response skeleton: version echoed, everything else zeroed for the
    /// handler to fill.
    pub fn new(version: u16, status: u32) -> Self {
        Self {
            version: Integer::from_primitive(version),
            command: Integer::from_primitive(OP_REP_IMPORT),
            status: Integer::from_primitive(status),
            full_path: [0; 256],
            bus_id: [0; 32],
            bus_no: Integer::from_primitive(0),
            device_no: Integer::from_primitive(0),
            device_speed: Integer::from_primitive(0),
            vendor_id: Integer::from_primitive(0),
            product_id: Integer::from_primitive(0),
            device_version: Integer::from_primitive(0),
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            config_value: 0,
            config_count: 0,
            iface_count: 0,
        }
    }
}

/// USBIP_CMD_SUBMIT, 48 bytes. The command word's upper half is always
/// zero, which is what lets the framing layer tell the command phase apart
/// from the operation phase.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct UsbIpCmdSubmit {
    #[packed_field(bytes = "0..=3", endian = "msb")]
    pub command: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub seq_num: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub dev_id: Integer<u32, packed_bits::Bits<32>>,
    /// 0 = OUT (host to device), 1 = IN (device to host).
    #[packed_field(bytes = "12..=15", endian = "msb")]
    pub direction: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "16..=19", endian = "msb")]
    pub endpoint: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "20..=23", endian = "msb")]
    pub transfer_flags: Integer<u32, packed_bits::Bits<32>>,
    /// For OUT transfers, how many payload bytes follow this header.
    #[packed_field(bytes = "24..=27", endian = "msb")]
    pub buffer_len: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "28..=31", endian = "msb")]
    pub start_frame: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "32..=35", endian = "msb")]
    pub packet_count: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "36..=39", endian = "msb")]
    pub interval: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "40..=47", element_size_bytes = "8")]
    pub setup: SetupRequest,
}

impl UsbIpCmdSubmit {
    pub fn new() -> Self {
        Self {
            command: Integer::from_primitive(USBIP_CMD_SUBMIT),
            seq_num: Integer::from_primitive(0),
            dev_id: Integer::from_primitive(0),
            direction: Integer::from_primitive(USBIP_DIR_OUT),
            endpoint: Integer::from_primitive(0),
            transfer_flags: Integer::from_primitive(0),
            buffer_len: Integer::from_primitive(0),
            start_frame: Integer::from_primitive(0),
            packet_count: Integer::from_primitive(0),
            interval: Integer::from_primitive(0),
            setup: SetupRequest::default(),
        }
    }
}

impl Default for UsbIpCmdSubmit {
    fn default() -> Self {
        Self::new()
    }
}

/// USBIP_RET_SUBMIT, 48 bytes, optionally followed by `actual_len` bytes
/// of IN payload.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct UsbIpRetSubmit {
    #[packed_field(bytes = "0..=3", endian = "msb")]
    pub command: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub seq_num: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub dev_id: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "12..=15", endian = "msb")]
    pub direction: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "16..=19", endian = "msb")]
    pub endpoint: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "20..=23", endian = "msb")]
    pub status: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "24..=27", endian = "msb")]
    pub actual_len: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "28..=31", endian = "msb")]
    pub start_frame: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "32..=35", endian = "msb")]
    pub packet_count: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "36..=39", endian = "msb")]
    pub error_count: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "40..=47", element_size_bytes = "8")]
    pub setup: SetupRequest,
}

impl UsbIpRetSubmit {
    /// Response skeleton: only the sequence number and device id are
    /// copied from the request; every other field starts zeroed.
    pub fn new(seq_num: u32, dev_id: u32) -> Self {
        Self {
            command: Integer::from_primitive(USBIP_RET_SUBMIT),
            seq_num: Integer::from_primitive(seq_num),
            dev_id: Integer::from_primitive(dev_id),
            direction: Integer::from_primitive(0),
            endpoint: Integer::from_primitive(0),
            status: Integer::from_primitive(0),
            actual_len: Integer::from_primitive(0),
            start_frame: Integer::from_primitive(0),
            packet_count: Integer::from_primitive(0),
            error_count: Integer::from_primitive(0),
            setup: SetupRequest::default(),
        }
    }
}

/// USBIP_CMD_UNLINK, 48 bytes. Carries the sequence number of the URB to
/// cancel; the trailing 24 bytes are padding.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct UsbIpCmdUnlink {
    #[packed_field(bytes = "0..=3", endian = "msb")]
    pub command: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub seq_num: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub dev_id: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "12..=15", endian = "msb")]
    pub direction: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "16..=19", endian = "msb")]
    pub endpoint: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "20..=23", endian = "msb")]
    pub unlink_seq_num: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "24..=47", element_size_bytes = "1", endian = "msb")]
    pub padding: [u8; 24],
}

impl UsbIpCmdUnlink {
    pub fn new(seq_num: u32, dev_id: u32, unlink_seq_num: u32) -> Self {
        Self {
            command: Integer::from_primitive(USBIP_CMD_UNLINK),
            seq_num: Integer::from_primitive(seq_num),
            dev_id: Integer::from_primitive(dev_id),
            direction: Integer::from_primitive(0),
            endpoint: Integer::from_primitive(0),
            unlink_seq_num: Integer::from_primitive(unlink_seq_num),
            padding: [0; 24],
        }
    }
}

/// USBIP_RET_UNLINK, 48 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct UsbIpRetUnlink {
    #[packed_field(bytes = "0..=3", endian = "msb")]
    pub command: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub seq_num: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub dev_id: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "12..=15", endian = "msb")]
    pub direction: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "16..=19", endian = "msb")]
    pub endpoint: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "20..=23", endian = "msb")]
    pub status: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "24..=47", element_size_bytes = "1", endian = "msb")]
    pub padding: [u8; 24],
}

impl UsbIpRetUnlink {
    pub fn new(seq_num: u32, dev_id: u32) -> Self {
        Self {
            command: Integer::from_primitive(USBIP_RET_UNLINK),
            seq_num: Integer::from_primitive(seq_num),
            dev_id: Integer::from_primitive(dev_id),
            direction: Integer::from_primitive(0),
            endpoint: Integer::from_primitive(0),
            status: Integer::from_primitive(0),
            padding: [0; 24],
        }
    }
}
