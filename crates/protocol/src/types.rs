//! USB and protocol type definitions
//!
//! Fixed capacities, the WinUSB setup packet, pipe policy kinds and the
//! standard descriptor types shared by the driver and the client facade.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Full-speed endpoint maximum packet size of the function device
pub const EP_SIZE: usize = 0x40;

/// Inline data capacity of a control-transfer packet
pub const CTRL_BUFF_LENGTH: usize = 128;

/// Inline data capacity of a descriptor-query packet
pub const DESC_BUFF_LENGTH: usize = 128;

/// Maximum bulk chunk carried by one read/write call on the channel
pub const BULK_BUFF_LENGTH: usize = 4096;

/// Inline data capacity of an interrupt-write packet
pub const INT_BUFF_LENGTH: usize = EP_SIZE;

/// pid.codes shared vendor id (http://pid.codes/1209/)
pub const VENDOR_ID: u16 = 0x1209;

/// Product id of the reference function device
pub const DEFAULT_PRODUCT_ID: u16 = 0x0001;

/// Device nodes are named `<prefix><index>`
pub const DEVICE_NODE_PREFIX: &str = "/dev/wixusb-dev";

/// Number of node indices tried by `connect`
pub const NODE_CANDIDATES: u32 = 10;

/// Standard GET_DESCRIPTOR request code (USB 2.0 ch. 9)
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// Standard device-to-host request type (standard, device recipient)
pub const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;

/// Transfer direction derived from bit 7 of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// WinUSB setup packet (`WINUSB_SETUP_PACKET`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Size of the setup header on the wire
    pub const SIZE: usize = 8;

    /// Direction selected by bit 7 of the request type
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Standard GET_DESCRIPTOR setup for the given type and index
    pub fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_STANDARD_IN,
            request: REQUEST_GET_DESCRIPTOR,
            value: (u16::from(descriptor_type) << 8) | u16::from(index),
            index: 0,
            length,
        }
    }
}

/// Pipe policy kinds understood by the driver
///
/// Numeric values follow the WinUSB policy constants.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipePolicyKind {
    /// Terminate writes that are a multiple of the packet size (no-op here)
    ShortPacketTerminate = 0x01,
    /// Transfer timeout in milliseconds, 0 = wait forever
    TransferTimeout = 0x03,
}

impl TryFrom<u32> for PipePolicyKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x01 => Ok(Self::ShortPacketTerminate),
            0x03 => Ok(Self::TransferTimeout),
            other => Err(ProtocolError::UnknownPolicy(other)),
        }
    }
}

/// Standard descriptor types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfiguration = 0x07,
    InterfacePower = 0x08,
    Otg = 0x09,
    Debug = 0x0A,
    InterfaceAssociation = 0x0B,
}

/// Standard device descriptor (18 bytes, little-endian on the bus)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Size of a device descriptor
    pub const SIZE: usize = 18;

    /// Parse a device descriptor returned by GET_DESCRIPTOR(Device)
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: Self::SIZE,
                available: raw.len(),
            });
        }
        if raw[1] != DescriptorType::Device as u8 {
            return Err(ProtocolError::UnexpectedDescriptor {
                expected: DescriptorType::Device as u8,
                actual: raw[1],
            });
        }

        let word = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);

        Ok(Self {
            length: raw[0],
            descriptor_type: raw[1],
            bcd_usb: word(2),
            device_class: raw[4],
            device_subclass: raw[5],
            device_protocol: raw[6],
            max_packet_size0: raw[7],
            vendor_id: word(8),
            product_id: word(10),
            bcd_device: word(12),
            manufacturer_index: raw[14],
            product_index: raw[15],
            serial_number_index: raw[16],
            num_configurations: raw[17],
        })
    }
}
