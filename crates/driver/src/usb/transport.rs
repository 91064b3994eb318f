//! rusb-backed transfer primitives
//!
//! Wraps an opened device with its function interface claimed. Endpoint
//! addresses are fixed by the device firmware.

use std::time::Duration;

use common::{DeviceSummary, UsbTransport};
use nix::errno::Errno;
use protocol::{Direction, EP_SIZE, SetupPacket};
use rusb::{Context, Device, DeviceHandle};
use tracing::{debug, warn};

/// Interrupt OUT endpoint
pub const EP_INT_OUT: u8 = 0x01;
/// Bulk IN endpoint
pub const EP_BULK_IN: u8 = 0x82;
/// Bulk OUT endpoint
pub const EP_BULK_OUT: u8 = 0x03;

/// Bound function interface of one device
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    interface: u8,
    kernel_driver_detached: bool,
    summary: DeviceSummary,
    max_packet_size: usize,
}

impl RusbTransport {
    /// Open `device` and claim `interface`
    ///
    /// A kernel driver bound to the interface is detached first and
    /// reattached when the transport is dropped.
    pub fn open(device: &Device<Context>, interface: u8) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let summary = DeviceSummary {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        };

        let handle = device.open()?;

        let kernel_driver_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle.detach_kernel_driver(interface)?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        handle.claim_interface(interface)?;
        debug!("Claimed interface {} on {}", interface, summary);

        let max_packet_size = bulk_out_packet_size(device, interface).unwrap_or(EP_SIZE);

        Ok(Self {
            handle,
            interface,
            kernel_driver_detached,
            summary,
            max_packet_size,
        })
    }

    pub fn summary(&self) -> DeviceSummary {
        self.summary
    }
}

/// wMaxPacketSize of the bulk OUT endpoint in the active configuration
fn bulk_out_packet_size(device: &Device<Context>, interface: u8) -> Option<usize> {
    let config = device.active_config_descriptor().ok()?;
    for iface in config.interfaces() {
        if iface.number() != interface {
            continue;
        }
        for alt in iface.descriptors() {
            for ep in alt.endpoint_descriptors() {
                if ep.address() == EP_BULK_OUT {
                    return Some(usize::from(ep.max_packet_size()));
                }
            }
        }
    }
    None
}

impl UsbTransport for RusbTransport {
    fn control(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Errno> {
        let result = match setup.direction() {
            Direction::In => self.handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            ),
            Direction::Out => self.handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            ),
        };
        result.map_err(map_rusb_error)
    }

    fn bulk_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Errno> {
        self.handle
            .read_bulk(EP_BULK_IN, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn bulk_out(&self, buf: &[u8], timeout: Duration) -> Result<usize, Errno> {
        self.handle
            .write_bulk(EP_BULK_OUT, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn interrupt_out(&self, buf: &[u8], timeout: Duration) -> Result<usize, Errno> {
        self.handle
            .write_interrupt(EP_INT_OUT, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn vendor_id(&self) -> u16 {
        self.summary.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.summary.product_id
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            // expected once the device is unplugged
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
        if self.kernel_driver_detached
            && let Err(e) = self.handle.attach_kernel_driver(self.interface)
        {
            warn!(
                "Could not reattach kernel driver to interface {}: {}",
                self.interface, e
            );
        }
        debug!("Closed {}", self.summary);
    }
}

/// Map rusb::Error to the errno reported on the channel
pub fn map_rusb_error(err: rusb::Error) -> Errno {
    match err {
        rusb::Error::Timeout => Errno::ETIMEDOUT,
        rusb::Error::Pipe => Errno::EPIPE,
        rusb::Error::NoDevice => Errno::ENODEV,
        rusb::Error::NotFound => Errno::ENOENT,
        rusb::Error::Busy => Errno::EBUSY,
        rusb::Error::Overflow => Errno::EOVERFLOW,
        rusb::Error::Io => Errno::EIO,
        rusb::Error::InvalidParam => Errno::EINVAL,
        rusb::Error::Access => Errno::EACCES,
        rusb::Error::Interrupted => Errno::EINTR,
        rusb::Error::NoMem => Errno::ENOMEM,
        rusb::Error::NotSupported => Errno::EOPNOTSUPP,
        _ => Errno::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), Errno::ETIMEDOUT);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), Errno::EPIPE);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), Errno::ENODEV);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), Errno::ENOENT);
        assert_eq!(map_rusb_error(rusb::Error::Other), Errno::EIO);
    }

    #[test]
    fn test_endpoint_directions() {
        assert_ne!(EP_BULK_IN & 0x80, 0);
        assert_eq!(EP_BULK_OUT & 0x80, 0);
        assert_eq!(EP_INT_OUT & 0x80, 0);
    }
}
