//! Common error types
//!
//! [`BridgeError`] is the taxonomy shared by the driver and the facade. Each
//! kind maps to exactly one errno on the channel and the facade recovers the
//! kind from that errno.
//!
//! The channel carries a single errno, so the mapping is lossy for USB core
//! failures: a transport error whose errno is one of the reserved codes
//! (`ENODEV`, `EINVAL`, `ENOTTY`, `EMSGSIZE`, `ENOMEM`, `EINTR`, `EFAULT`)
//! reaches the facade as the kind owning that code, not as
//! [`BridgeError::Transport`]. The errno itself is always preserved.

use nix::errno::Errno;
use protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a bridge operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("no such device")]
    NoDevice,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("unsupported operation")]
    UnsupportedOperation,

    #[error("buffer exceeds transfer capacity")]
    BufferTooLarge,

    /// USB core failure, passed through unchanged
    #[error("transfer failed: {0}")]
    Transport(Errno),

    #[error("out of memory")]
    OutOfMemory,

    #[error("interrupted while waiting for the device")]
    Interrupted,

    #[error("caller buffer shorter than the packet")]
    BadAddress,
}

impl BridgeError {
    /// POSIX code reported on the channel
    pub fn errno(self) -> Errno {
        match self {
            BridgeError::NoDevice => Errno::ENODEV,
            BridgeError::InvalidArgument => Errno::EINVAL,
            BridgeError::UnsupportedOperation => Errno::ENOTTY,
            BridgeError::BufferTooLarge => Errno::EMSGSIZE,
            BridgeError::Transport(errno) => errno,
            BridgeError::OutOfMemory => Errno::ENOMEM,
            BridgeError::Interrupted => Errno::EINTR,
            BridgeError::BadAddress => Errno::EFAULT,
        }
    }

    /// Recover the kind from a channel errno
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::ENODEV => BridgeError::NoDevice,
            Errno::EINVAL => BridgeError::InvalidArgument,
            Errno::ENOTTY => BridgeError::UnsupportedOperation,
            Errno::EMSGSIZE => BridgeError::BufferTooLarge,
            Errno::ENOMEM => BridgeError::OutOfMemory,
            Errno::EINTR => BridgeError::Interrupted,
            Errno::EFAULT => BridgeError::BadAddress,
            other => BridgeError::Transport(other),
        }
    }

    /// Negative return value of the channel call
    pub fn raw(self) -> i32 {
        -(self.errno() as i32)
    }
}

impl From<BridgeError> for Errno {
    fn from(err: BridgeError) -> Self {
        err.errno()
    }
}

impl From<Errno> for BridgeError {
    fn from(errno: Errno) -> Self {
        BridgeError::from_errno(errno)
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ForeignMagic(_)
            | ProtocolError::UnknownOpcode(_)
            | ProtocolError::UnknownRelayOp(_) => BridgeError::UnsupportedOperation,
            ProtocolError::RequestMismatch { .. }
            | ProtocolError::DirectionMismatch { .. }
            | ProtocolError::SizeMismatch { .. }
            | ProtocolError::UnknownPolicy(_) => BridgeError::InvalidArgument,
            ProtocolError::CapacityExceeded { .. } => BridgeError::BufferTooLarge,
            ProtocolError::BufferTooSmall { .. } => BridgeError::BadAddress,
            ProtocolError::UnexpectedDescriptor { .. } => BridgeError::Transport(Errno::ENODATA),
        }
    }
}
