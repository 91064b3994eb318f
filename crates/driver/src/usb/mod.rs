//! USB subsystem
//!
//! Real hardware side of the driver: the rusb-backed transport behind a
//! session, and the watcher thread that binds matching devices to registry
//! minors as they come and go.
//!
//! libusb calls block, so the watcher owns the USB context on a dedicated
//! thread and talks to the Tokio runtime only through the watcher bridge.

pub mod transport;
pub mod watcher;

pub use transport::{RusbTransport, map_rusb_error};
pub use watcher::{DeviceWatcher, IdTable, WatcherThread, spawn_watcher};
