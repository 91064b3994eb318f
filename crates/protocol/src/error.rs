//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Request code carries a foreign ioctl magic
    #[error("Foreign ioctl type {0:#04x}")]
    ForeignMagic(u8),

    /// Opcode number not in the command table
    #[error("Unknown opcode {0}")]
    UnknownOpcode(u8),

    /// Request code size/direction does not match the opcode's packet
    #[error("Request code {code:#010x} does not match opcode {opcode}")]
    RequestMismatch { opcode: u8, code: u32 },

    /// Control opcode disagrees with bit 7 of the request type
    #[error("Opcode {opcode} does not carry a control {direction} transfer")]
    DirectionMismatch { opcode: u8, direction: &'static str },

    /// Payload length differs from the opcode's fixed packet size
    #[error("Packet size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Declared length exceeds the packet's inline buffer
    #[error("Declared length {declared} exceeds capacity {capacity}")]
    CapacityExceeded { declared: usize, capacity: usize },

    /// Relay frame names no known channel call
    #[error("Unknown relay call {0}")]
    UnknownRelayOp(u8),

    /// Pipe policy kind outside the closed set
    #[error("Unknown pipe policy {0:#x}")]
    UnknownPolicy(u32),

    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Descriptor of a different type than requested
    #[error("Unexpected descriptor type {actual:#04x} (expected {expected:#04x})")]
    UnexpectedDescriptor { expected: u8, actual: u8 },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::SizeMismatch {
            expected: 136,
            actual: 8,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("136"));
        assert!(msg.contains("8"));
    }

    #[test]
    fn test_capacity_error() {
        let err = ProtocolError::CapacityExceeded {
            declared: 200,
            capacity: 128,
        };
        assert!(format!("{}", err).contains("exceeds capacity 128"));
    }
}
