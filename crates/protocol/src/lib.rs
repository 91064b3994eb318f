//! Protocol library for the WixUSB bridge
//!
//! This crate defines the command channel between the user-space WinUSB facade
//! and the driver: the opcode table, the fixed-layout packets carried by each
//! opcode, the `_IOC` request codes, and the device-file [`Channel`] both sides
//! implement or consume.
//!
//! # Example
//!
//! ```
//! use protocol::{Command, ControlPacket, Opcode, SetupPacket, WirePacket};
//!
//! let setup = SetupPacket::get_descriptor(0x01, 0, 18);
//! let bytes = ControlPacket::new(setup).to_bytes();
//!
//! let code = Opcode::ReceiveControl.request_code();
//! let opcode = Opcode::from_request_code(code).unwrap();
//! let command = Command::decode(opcode, &bytes).unwrap();
//! assert_eq!(command.opcode(), Opcode::ReceiveControl);
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod messages;
pub mod relay;
pub mod types;
pub mod version;

pub use channel::{Channel, NodeOpener, from_raw_return, node_index, node_path, raw_return};
pub use codec::{
    ControlPacket, DescriptorPacket, InterruptPacket, PipePolicyPacket, VidPidPacket, WirePacket,
};
pub use error::{ProtocolError, Result};
pub use messages::{Access, Command, IOC_MAGIC, Opcode, Reply};
pub use relay::{RELAY_MAX_PAYLOAD, RelayOp, RelayReply, RelayRequest};
pub use nix::errno::Errno;
pub use types::{
    BULK_BUFF_LENGTH, CTRL_BUFF_LENGTH, DEFAULT_PRODUCT_ID, DESC_BUFF_LENGTH, DEVICE_NODE_PREFIX,
    DescriptorType, DeviceDescriptor, Direction, EP_SIZE, INT_BUFF_LENGTH, NODE_CANDIDATES,
    PipePolicyKind, REQUEST_GET_DESCRIPTOR, REQUEST_TYPE_STANDARD_IN, SetupPacket, VENDOR_ID,
};
pub use version::{PROTOCOL_VERSION, ProtocolVersion};
