//! WixUSB driver core
//!
//! Host side of the bridge. A [`DeviceRegistry`] maps minors to shared
//! [`Session`]s, the [`dispatcher`] executes decoded commands against a
//! session's transport, and [`OpenFile`] exposes a session through the
//! read/write/ioctl [`protocol::Channel`] the client facade consumes. The
//! [`NodeServer`] publishes each minor as a Unix socket so other processes can
//! open it.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod registry;
pub mod relay;
pub mod session;
pub mod usb;

pub use channel::{LoopbackOpener, OpenFile};
pub use config::HostConfig;
pub use dispatcher::{dispatch, fetch_descriptor};
pub use registry::{DEFAULT_MAX_MINORS, DeviceRegistry};
pub use relay::NodeServer;
pub use session::{Interrupt, IoGuard, Session, SessionRef};
