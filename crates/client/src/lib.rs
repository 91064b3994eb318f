//! WixUSB client facade
//!
//! WinUSB-style calls over the device nodes exposed by the host driver.

pub mod config;
pub mod facade;
pub mod node;

pub use facade::WinUsbDevice;
pub use node::{DevNode, DevNodeOpener};
