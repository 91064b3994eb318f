//! Common utilities for the WixUSB bridge
//!
//! This crate provides shared functionality between the driver and the client,
//! including the bridge error taxonomy and its errno mapping, the USB-core
//! transport abstraction, logging setup, and the async channel bridge between
//! the host daemon and its blocking USB watcher thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{WatcherBridge, WatcherCommand, WatcherEvent, WatcherWorker, create_watcher_bridge};
pub use error::{BridgeError, Error, Result};
pub use logging::{resolve_log_level, setup_logging};
pub use usb_types::{DeviceSummary, UsbTransport};
