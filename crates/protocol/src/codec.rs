//! Fixed-layout packet encoding
//!
//! Every command packet has one C layout in native byte order, shared with the
//! kernel-side header. Layouts are append-only: a field never moves once
//! published.
//!
//! # Layouts
//!
//! ```text
//! ControlPacket    [type:u8][req:u8][value:u16][index:u16][length:u16][data:128]   136
//! DescriptorPacket [desc_type:u32][desc_idx:u8][data:128][pad:3]                   136
//! PipePolicyPacket [policy_type:u32][policy_value:u32]                               8
//! VidPidPacket     [vid:u16][pid:u16]                                                4
//! InterruptPacket  [length:u8][data:64]                                             65
//! ```

use byteorder::{ByteOrder, NativeEndian};

use crate::error::{ProtocolError, Result};
use crate::messages::Opcode;
use crate::types::{CTRL_BUFF_LENGTH, DESC_BUFF_LENGTH, INT_BUFF_LENGTH, SetupPacket};

/// A command packet with a fixed wire size
pub trait WirePacket: Sized {
    /// Opcode carrying this packet
    const OPCODE: Opcode;
    /// Exact size in bytes
    const SIZE: usize;

    /// Read fields from a buffer of exactly `SIZE` bytes
    fn read_fields(bytes: &[u8]) -> Self;

    /// Write fields into a buffer of exactly `SIZE` bytes
    fn write_fields(&self, out: &mut [u8]);

    /// Decode a packet, rejecting any length other than `SIZE`
    fn decode(bytes: &[u8]) -> Result<Self> {
        check_size(Self::SIZE, bytes.len())?;
        Ok(Self::read_fields(bytes))
    }

    /// Encode a packet into a caller buffer of exactly `SIZE` bytes
    fn encode(&self, out: &mut [u8]) -> Result<()> {
        check_size(Self::SIZE, out.len())?;
        self.write_fields(out);
        Ok(())
    }

    /// Encode into a freshly allocated buffer
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        self.write_fields(&mut out);
        out
    }
}

fn check_size(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ProtocolError::SizeMismatch { expected, actual });
    }
    Ok(())
}

/// Copy `data` into the inline buffer region of an encoded packet
///
/// Only the data region is touched so the caller's input fields are never
/// echoed back.
fn write_region(arg: &mut [u8], offset: usize, capacity: usize, data: &[u8]) -> Result<()> {
    if data.len() > capacity {
        return Err(ProtocolError::CapacityExceeded {
            declared: data.len(),
            capacity,
        });
    }
    let end = offset + data.len();
    if arg.len() < end {
        return Err(ProtocolError::BufferTooSmall {
            needed: end,
            available: arg.len(),
        });
    }
    arg[offset..end].copy_from_slice(data);
    Ok(())
}

fn read_region(arg: &[u8], offset: usize, capacity: usize, len: usize) -> Result<&[u8]> {
    if len > capacity {
        return Err(ProtocolError::CapacityExceeded {
            declared: len,
            capacity,
        });
    }
    let end = offset + len;
    arg.get(offset..end).ok_or(ProtocolError::BufferTooSmall {
        needed: end,
        available: arg.len(),
    })
}

/// Control transfer packet (`wixusb_ctrl_packet_t`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub setup: SetupPacket,
    pub data: [u8; CTRL_BUFF_LENGTH],
}

impl ControlPacket {
    /// Offset of the inline data buffer
    pub const DATA_OFFSET: usize = SetupPacket::SIZE;

    /// Packet with an empty data buffer
    pub fn new(setup: SetupPacket) -> Self {
        Self {
            setup,
            data: [0u8; CTRL_BUFF_LENGTH],
        }
    }

    /// Packet carrying outbound data
    pub fn with_data(setup: SetupPacket, data: &[u8]) -> Result<Self> {
        if data.len() > CTRL_BUFF_LENGTH {
            return Err(ProtocolError::CapacityExceeded {
                declared: data.len(),
                capacity: CTRL_BUFF_LENGTH,
            });
        }
        let mut packet = Self::new(setup);
        packet.data[..data.len()].copy_from_slice(data);
        Ok(packet)
    }

    /// Length declared in the setup header
    pub fn declared_len(&self) -> usize {
        usize::from(self.setup.length)
    }

    /// Reject a declared length larger than the inline buffer
    pub fn validate(&self) -> Result<()> {
        if self.declared_len() > CTRL_BUFF_LENGTH {
            return Err(ProtocolError::CapacityExceeded {
                declared: self.declared_len(),
                capacity: CTRL_BUFF_LENGTH,
            });
        }
        Ok(())
    }

    /// Write received bytes into the data region of an encoded packet
    pub fn write_reply_data(arg: &mut [u8], data: &[u8]) -> Result<()> {
        write_region(arg, Self::DATA_OFFSET, CTRL_BUFF_LENGTH, data)
    }

    /// Borrow `len` received bytes from the data region of an encoded packet
    pub fn reply_data(arg: &[u8], len: usize) -> Result<&[u8]> {
        read_region(arg, Self::DATA_OFFSET, CTRL_BUFF_LENGTH, len)
    }
}

impl WirePacket for ControlPacket {
    const OPCODE: Opcode = Opcode::SendControl;
    const SIZE: usize = SetupPacket::SIZE + CTRL_BUFF_LENGTH;

    fn read_fields(bytes: &[u8]) -> Self {
        let setup = SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: NativeEndian::read_u16(&bytes[2..4]),
            index: NativeEndian::read_u16(&bytes[4..6]),
            length: NativeEndian::read_u16(&bytes[6..8]),
        };
        let mut data = [0u8; CTRL_BUFF_LENGTH];
        data.copy_from_slice(&bytes[Self::DATA_OFFSET..Self::SIZE]);
        Self { setup, data }
    }

    fn write_fields(&self, out: &mut [u8]) {
        out[0] = self.setup.request_type;
        out[1] = self.setup.request;
        NativeEndian::write_u16(&mut out[2..4], self.setup.value);
        NativeEndian::write_u16(&mut out[4..6], self.setup.index);
        NativeEndian::write_u16(&mut out[6..8], self.setup.length);
        out[Self::DATA_OFFSET..Self::SIZE].copy_from_slice(&self.data);
    }
}

/// Descriptor query packet (`wixusb_get_desc_t`)
///
/// `descriptor_type` is a C enum on the wire, hence 32 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPacket {
    pub descriptor_type: u32,
    pub index: u8,
    pub data: [u8; DESC_BUFF_LENGTH],
}

impl DescriptorPacket {
    /// Offset of the inline data buffer
    pub const DATA_OFFSET: usize = 5;

    pub fn new(descriptor_type: u8, index: u8) -> Self {
        Self {
            descriptor_type: u32::from(descriptor_type),
            index,
            data: [0u8; DESC_BUFF_LENGTH],
        }
    }

    /// Write fetched descriptor bytes into the data region of an encoded packet
    pub fn write_reply_data(arg: &mut [u8], data: &[u8]) -> Result<()> {
        write_region(arg, Self::DATA_OFFSET, DESC_BUFF_LENGTH, data)
    }

    /// Borrow `len` descriptor bytes from an encoded packet
    pub fn reply_data(arg: &[u8], len: usize) -> Result<&[u8]> {
        read_region(arg, Self::DATA_OFFSET, DESC_BUFF_LENGTH, len)
    }
}

impl WirePacket for DescriptorPacket {
    const OPCODE: Opcode = Opcode::GetDescriptor;
    // 4 + 1 + 128, padded to the 4-byte alignment of the enum field
    const SIZE: usize = 136;

    fn read_fields(bytes: &[u8]) -> Self {
        let mut data = [0u8; DESC_BUFF_LENGTH];
        data.copy_from_slice(&bytes[Self::DATA_OFFSET..Self::DATA_OFFSET + DESC_BUFF_LENGTH]);
        Self {
            descriptor_type: NativeEndian::read_u32(&bytes[0..4]),
            index: bytes[4],
            data,
        }
    }

    fn write_fields(&self, out: &mut [u8]) {
        NativeEndian::write_u32(&mut out[0..4], self.descriptor_type);
        out[4] = self.index;
        out[Self::DATA_OFFSET..Self::DATA_OFFSET + DESC_BUFF_LENGTH].copy_from_slice(&self.data);
        out[Self::DATA_OFFSET + DESC_BUFF_LENGTH..Self::SIZE].fill(0);
    }
}

/// Pipe policy packet (`wixusb_set_pipe_policy_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipePolicyPacket {
    pub policy_type: u32,
    pub value: u32,
}

impl WirePacket for PipePolicyPacket {
    const OPCODE: Opcode = Opcode::SetPipePolicy;
    const SIZE: usize = 8;

    fn read_fields(bytes: &[u8]) -> Self {
        Self {
            policy_type: NativeEndian::read_u32(&bytes[0..4]),
            value: NativeEndian::read_u32(&bytes[4..8]),
        }
    }

    fn write_fields(&self, out: &mut [u8]) {
        NativeEndian::write_u32(&mut out[0..4], self.policy_type);
        NativeEndian::write_u32(&mut out[4..8], self.value);
    }
}

/// Vendor/product id reply (`wixusb_vid_pid_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VidPidPacket {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl WirePacket for VidPidPacket {
    const OPCODE: Opcode = Opcode::GetVendorProductId;
    const SIZE: usize = 4;

    fn read_fields(bytes: &[u8]) -> Self {
        Self {
            vendor_id: NativeEndian::read_u16(&bytes[0..2]),
            product_id: NativeEndian::read_u16(&bytes[2..4]),
        }
    }

    fn write_fields(&self, out: &mut [u8]) {
        NativeEndian::write_u16(&mut out[0..2], self.vendor_id);
        NativeEndian::write_u16(&mut out[2..4], self.product_id);
    }
}

/// Interrupt write packet (`wixusb_intrpt_packet`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptPacket {
    pub length: u8,
    pub data: [u8; INT_BUFF_LENGTH],
}

impl InterruptPacket {
    /// Offset of the inline data buffer
    pub const DATA_OFFSET: usize = 1;

    pub fn with_data(data: &[u8]) -> Result<Self> {
        if data.len() > INT_BUFF_LENGTH {
            return Err(ProtocolError::CapacityExceeded {
                declared: data.len(),
                capacity: INT_BUFF_LENGTH,
            });
        }
        let mut packet = Self {
            length: data.len() as u8,
            data: [0u8; INT_BUFF_LENGTH],
        };
        packet.data[..data.len()].copy_from_slice(data);
        Ok(packet)
    }

    pub fn declared_len(&self) -> usize {
        usize::from(self.length)
    }

    /// Reject a declared length larger than one endpoint packet
    pub fn validate(&self) -> Result<()> {
        if self.declared_len() > INT_BUFF_LENGTH {
            return Err(ProtocolError::CapacityExceeded {
                declared: self.declared_len(),
                capacity: INT_BUFF_LENGTH,
            });
        }
        Ok(())
    }

    /// Bytes actually carried by the packet
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.declared_len().min(INT_BUFF_LENGTH)]
    }
}

impl WirePacket for InterruptPacket {
    const OPCODE: Opcode = Opcode::WriteInterrupt;
    const SIZE: usize = 1 + INT_BUFF_LENGTH;

    fn read_fields(bytes: &[u8]) -> Self {
        let mut data = [0u8; INT_BUFF_LENGTH];
        data.copy_from_slice(&bytes[Self::DATA_OFFSET..Self::SIZE]);
        Self {
            length: bytes[0],
            data,
        }
    }

    fn write_fields(&self, out: &mut [u8]) {
        out[0] = self.length;
        out[Self::DATA_OFFSET..Self::SIZE].copy_from_slice(&self.data);
    }
}
