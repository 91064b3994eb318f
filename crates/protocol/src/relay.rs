//! Socket relay framing
//!
//! A host that binds devices from user space publishes each minor as a Unix
//! socket instead of a character device. One connection is one open handle.
//! Right after accepting, the host answers with a [`RelayReply`] carrying the
//! result of the open; from then on every channel call is one
//! [`RelayRequest`] (plus payload) answered by one [`RelayReply`] (plus
//! data). All header fields are big-endian.
//!
//! | call  | request payload   | reply data                  |
//! |-------|-------------------|-----------------------------|
//! | read  | none              | the bytes received          |
//! | write | the bytes to send | none                        |
//! | ioctl | the whole packet  | the packet after the call   |
//!
//! A failed call carries the negated errno and no data.

use byteorder::{BigEndian, ByteOrder};
use nix::errno::Errno;

use crate::channel::from_raw_return;
use crate::error::{ProtocolError, Result};
use crate::types::BULK_BUFF_LENGTH;

/// Largest payload either side puts in one frame
pub const RELAY_MAX_PAYLOAD: usize = BULK_BUFF_LENGTH;

/// Channel call carried by a request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayOp {
    Read = 0,
    Write = 1,
    Ioctl = 2,
}

impl TryFrom<u8> for RelayOp {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RelayOp::Read),
            1 => Ok(RelayOp::Write),
            2 => Ok(RelayOp::Ioctl),
            other => Err(ProtocolError::UnknownRelayOp(other)),
        }
    }
}

/// Request frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRequest {
    pub op: RelayOp,
    /// ioctl request code, 0 otherwise
    pub request: u32,
    /// Bytes wanted (read) or payload length (write, ioctl)
    pub len: u32,
}

impl RelayRequest {
    pub const SIZE: usize = 9;

    pub fn read(len: usize) -> Result<Self> {
        Self::checked(RelayOp::Read, 0, len)
    }

    pub fn write(len: usize) -> Result<Self> {
        Self::checked(RelayOp::Write, 0, len)
    }

    pub fn ioctl(request: u32, len: usize) -> Result<Self> {
        Self::checked(RelayOp::Ioctl, request, len)
    }

    fn checked(op: RelayOp, request: u32, len: usize) -> Result<Self> {
        check_len(len)?;
        Ok(Self {
            op,
            request,
            len: len as u32,
        })
    }

    /// Bytes following the header
    pub fn payload_len(&self) -> usize {
        match self.op {
            RelayOp::Read => 0,
            RelayOp::Write | RelayOp::Ioctl => self.len as usize,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.op as u8;
        BigEndian::write_u32(&mut buf[1..5], self.request);
        BigEndian::write_u32(&mut buf[5..9], self.len);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let op = RelayOp::try_from(buf[0])?;
        let request = BigEndian::read_u32(&buf[1..5]);
        let len = BigEndian::read_u32(&buf[5..9]);
        check_len(len as usize)?;
        Ok(Self { op, request, len })
    }
}

/// Reply frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReply {
    /// Return value, or the negated errno
    pub rc: i32,
    /// Data bytes following the header
    pub len: u32,
}

impl RelayReply {
    pub const SIZE: usize = 8;

    pub fn success(rc: i32, len: usize) -> Result<Self> {
        check_len(len)?;
        Ok(Self {
            rc,
            len: len as u32,
        })
    }

    pub fn failed(errno: Errno) -> Self {
        Self {
            rc: -(errno as i32),
            len: 0,
        }
    }

    pub fn result(&self) -> nix::Result<i32> {
        from_raw_return(self.rc)
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        BigEndian::write_i32(&mut buf[0..4], self.rc);
        BigEndian::write_u32(&mut buf[4..8], self.len);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let rc = BigEndian::read_i32(&buf[0..4]);
        let len = BigEndian::read_u32(&buf[4..8]);
        check_len(len as usize)?;
        if rc < 0 && len != 0 {
            return Err(ProtocolError::SizeMismatch {
                expected: 0,
                actual: len as usize,
            });
        }
        Ok(Self { rc, len })
    }
}

fn check_len(len: usize) -> Result<()> {
    if len > RELAY_MAX_PAYLOAD {
        return Err(ProtocolError::CapacityExceeded {
            declared: len,
            capacity: RELAY_MAX_PAYLOAD,
        });
    }
    Ok(())
}
