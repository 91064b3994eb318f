//! Command set carried over the ioctl channel
//!
//! Each opcode owns exactly one packet layout. Request codes are the Linux
//! `_IOC` encoding of (direction, magic, opcode number, packet size), so a
//! request whose size or direction disagrees with the table is rejected.

use crate::codec::{
    ControlPacket, DescriptorPacket, InterruptPacket, PipePolicyPacket, VidPidPacket, WirePacket,
};
use crate::error::{ProtocolError, Result};
use crate::types::Direction;

/// ioctl type byte of the command channel
pub const IOC_MAGIC: u8 = b'M';

/// Data direction of an ioctl, seen from user space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    None,
    Read,
    Write,
    ReadWrite,
}

/// Opcode numbers (stable, append-only)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    SendControl = 0,
    ReceiveControl = 1,
    GetDescriptor = 2,
    SetPipePolicy = 3,
    GetVendorProductId = 5,
    IsConnected = 6,
    WriteInterrupt = 7,
}

impl Opcode {
    /// Every opcode, in numeric order
    pub const ALL: [Opcode; 7] = [
        Opcode::SendControl,
        Opcode::ReceiveControl,
        Opcode::GetDescriptor,
        Opcode::SetPipePolicy,
        Opcode::GetVendorProductId,
        Opcode::IsConnected,
        Opcode::WriteInterrupt,
    ];

    /// Look up an opcode by its number
    pub fn from_nr(nr: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| *op as u8 == nr)
            .ok_or(ProtocolError::UnknownOpcode(nr))
    }

    /// Fixed packet size for this opcode
    pub fn packet_size(self) -> usize {
        match self {
            Opcode::SendControl | Opcode::ReceiveControl => ControlPacket::SIZE,
            Opcode::GetDescriptor => DescriptorPacket::SIZE,
            Opcode::SetPipePolicy => PipePolicyPacket::SIZE,
            Opcode::GetVendorProductId => VidPidPacket::SIZE,
            Opcode::IsConnected => 0,
            Opcode::WriteInterrupt => InterruptPacket::SIZE,
        }
    }

    pub fn access(self) -> Access {
        match self {
            Opcode::SendControl | Opcode::SetPipePolicy | Opcode::WriteInterrupt => Access::Write,
            Opcode::ReceiveControl | Opcode::GetDescriptor => Access::ReadWrite,
            Opcode::GetVendorProductId => Access::Read,
            Opcode::IsConnected => Access::None,
        }
    }

    /// `_IOC` request code for this opcode
    pub fn request_code(self) -> u32 {
        let nr = self as u8;
        let size = self.packet_size();
        let code = match self.access() {
            Access::None => nix::request_code_none!(IOC_MAGIC, nr),
            Access::Read => nix::request_code_read!(IOC_MAGIC, nr, size),
            Access::Write => nix::request_code_write!(IOC_MAGIC, nr, size),
            Access::ReadWrite => nix::request_code_readwrite!(IOC_MAGIC, nr, size),
        };
        code as u32
    }

    /// Resolve a raw request code against the command table
    pub fn from_request_code(code: u32) -> Result<Self> {
        let magic = ((code >> 8) & 0xff) as u8;
        if magic != IOC_MAGIC {
            return Err(ProtocolError::ForeignMagic(magic));
        }

        let opcode = Self::from_nr((code & 0xff) as u8)?;
        if opcode.request_code() != code {
            return Err(ProtocolError::RequestMismatch {
                opcode: opcode as u8,
                code,
            });
        }
        Ok(opcode)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}

/// A decoded command packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendControl(ControlPacket),
    ReceiveControl(ControlPacket),
    GetDescriptor(DescriptorPacket),
    SetPipePolicy(PipePolicyPacket),
    GetVendorProductId,
    IsConnected,
    WriteInterrupt(InterruptPacket),
}

impl Command {
    /// Decode the payload of `opcode`; the length must match exactly
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self> {
        Ok(match opcode {
            Opcode::SendControl => Command::SendControl(ControlPacket::decode(payload)?),
            Opcode::ReceiveControl => Command::ReceiveControl(ControlPacket::decode(payload)?),
            Opcode::GetDescriptor => Command::GetDescriptor(DescriptorPacket::decode(payload)?),
            Opcode::SetPipePolicy => Command::SetPipePolicy(PipePolicyPacket::decode(payload)?),
            Opcode::GetVendorProductId => {
                VidPidPacket::decode(payload)?;
                Command::GetVendorProductId
            }
            Opcode::IsConnected => {
                if !payload.is_empty() {
                    return Err(ProtocolError::SizeMismatch {
                        expected: 0,
                        actual: payload.len(),
                    });
                }
                Command::IsConnected
            }
            Opcode::WriteInterrupt => Command::WriteInterrupt(InterruptPacket::decode(payload)?),
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Command::SendControl(_) => Opcode::SendControl,
            Command::ReceiveControl(_) => Opcode::ReceiveControl,
            Command::GetDescriptor(_) => Opcode::GetDescriptor,
            Command::SetPipePolicy(_) => Opcode::SetPipePolicy,
            Command::GetVendorProductId => Opcode::GetVendorProductId,
            Command::IsConnected => Opcode::IsConnected,
            Command::WriteInterrupt(_) => Opcode::WriteInterrupt,
        }
    }

    /// Check declared lengths against inline capacities
    ///
    /// A control packet must also travel under the opcode matching its
    /// direction: only a receive has output fields to copy back.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::SendControl(packet) => {
                expect_direction(Opcode::SendControl, packet, Direction::Out)?;
                packet.validate()
            }
            Command::ReceiveControl(packet) => {
                expect_direction(Opcode::ReceiveControl, packet, Direction::In)?;
                packet.validate()
            }
            Command::WriteInterrupt(packet) => packet.validate(),
            _ => Ok(()),
        }
    }
}

fn expect_direction(opcode: Opcode, packet: &ControlPacket, expected: Direction) -> Result<()> {
    let direction = packet.setup.direction();
    if direction != expected {
        return Err(ProtocolError::DirectionMismatch {
            opcode: opcode as u8,
            direction: match direction {
                Direction::In => "IN",
                Direction::Out => "OUT",
            },
        });
    }
    Ok(())
}

/// Result of an executed command, before it is copied back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Control OUT: bytes sent
    Sent(usize),
    /// Control IN: bytes received
    Received(Vec<u8>),
    /// Descriptor bytes fetched (already clipped to the inline capacity)
    Descriptor(Vec<u8>),
    /// Pipe policy accepted
    PolicySet,
    /// Vendor and product id
    Ids(VidPidPacket),
    /// Interface still bound
    Connected,
    /// Interrupt OUT: bytes sent
    InterruptSent(usize),
}

impl Reply {
    /// Non-negative return value of the ioctl
    pub fn return_value(&self) -> i32 {
        let len = match self {
            Reply::Sent(len) | Reply::InterruptSent(len) => *len,
            Reply::Received(data) | Reply::Descriptor(data) => data.len(),
            Reply::PolicySet | Reply::Ids(_) | Reply::Connected => 0,
        };
        i32::try_from(len).unwrap_or(i32::MAX)
    }

    /// Copy the output fields of this reply into the caller's packet
    ///
    /// Input fields are left exactly as the caller wrote them.
    pub fn write_output(&self, arg: &mut [u8]) -> Result<()> {
        match self {
            Reply::Received(data) => ControlPacket::write_reply_data(arg, data),
            Reply::Descriptor(data) => DescriptorPacket::write_reply_data(arg, data),
            Reply::Ids(ids) => ids.encode(arg),
            Reply::Sent(_) | Reply::InterruptSent(_) | Reply::PolicySet | Reply::Connected => {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SetupPacket;

    #[test]
    fn test_request_codes_are_distinct() {
        let codes: std::collections::HashSet<u32> =
            Opcode::ALL.iter().map(|op| op.request_code()).collect();
        assert_eq!(codes.len(), Opcode::ALL.len());
    }

    #[test]
    fn test_request_code_roundtrip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_request_code(op.request_code()).unwrap(), op);
        }
    }

    #[test]
    fn test_request_code_fields() {
        let code = Opcode::GetDescriptor.request_code();
        assert_eq!(code & 0xff, 2);
        assert_eq!((code >> 8) & 0xff, u32::from(b'M'));
        assert_eq!((code >> 16) & 0x3fff, 136);

        let code = Opcode::IsConnected.request_code();
        assert_eq!((code >> 16) & 0x3fff, 0);
    }

    #[test]
    fn test_unknown_opcode_number() {
        // 4 was never assigned
        let code = nix::request_code_write!(IOC_MAGIC, 4, 8) as u32;
        assert_eq!(
            Opcode::from_request_code(code),
            Err(ProtocolError::UnknownOpcode(4))
        );
        assert!(Opcode::from_nr(8).is_err());
    }

    #[test]
    fn test_foreign_magic() {
        let code = nix::request_code_write!(b'U', 0, ControlPacket::SIZE) as u32;
        assert_eq!(
            Opcode::from_request_code(code),
            Err(ProtocolError::ForeignMagic(b'U'))
        );
    }

    #[test]
    fn test_size_mismatch_in_request_code() {
        let code = nix::request_code_write!(IOC_MAGIC, 3, 16) as u32;
        assert!(matches!(
            Opcode::from_request_code(code),
            Err(ProtocolError::RequestMismatch { opcode: 3, .. })
        ));
    }

    #[test]
    fn test_command_decode() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let bytes = ControlPacket::new(setup).to_bytes();
        let Command::ReceiveControl(packet) = Command::decode(Opcode::ReceiveControl, &bytes).unwrap()
        else {
            panic!("expected ReceiveControl");
        };
        assert_eq!(packet.setup, setup);

        assert_eq!(
            Command::decode(Opcode::IsConnected, &[]).unwrap(),
            Command::IsConnected
        );
        assert!(Command::decode(Opcode::IsConnected, &[0]).is_err());
        assert!(Command::decode(Opcode::SetPipePolicy, &bytes).is_err());
    }

    #[test]
    fn test_control_opcode_must_match_direction() {
        let inbound = ControlPacket::new(SetupPacket {
            request_type: 0xC0,
            length: 8,
            ..Default::default()
        });
        let outbound = ControlPacket::new(SetupPacket {
            request_type: 0x40,
            length: 8,
            ..Default::default()
        });

        assert!(Command::ReceiveControl(inbound.clone()).validate().is_ok());
        assert!(Command::SendControl(outbound.clone()).validate().is_ok());
        assert_eq!(
            Command::SendControl(inbound).validate(),
            Err(ProtocolError::DirectionMismatch {
                opcode: 0,
                direction: "IN"
            })
        );
        assert!(matches!(
            Command::ReceiveControl(outbound).validate(),
            Err(ProtocolError::DirectionMismatch { opcode: 1, .. })
        ));
    }

    #[test]
    fn test_reply_return_values() {
        assert_eq!(Reply::Sent(12).return_value(), 12);
        assert_eq!(Reply::Received(vec![0; 5]).return_value(), 5);
        assert_eq!(Reply::PolicySet.return_value(), 0);
        assert_eq!(Reply::Connected.return_value(), 0);
    }

    #[test]
    fn test_reply_ids_output() {
        let mut arg = [0xFFu8; 4];
        Reply::Ids(VidPidPacket {
            vendor_id: 0x1209,
            product_id: 0x0002,
        })
        .write_output(&mut arg)
        .unwrap();
        let ids = VidPidPacket::decode(&arg).unwrap();
        assert_eq!(ids.vendor_id, 0x1209);
        assert_eq!(ids.product_id, 0x0002);
    }
}
