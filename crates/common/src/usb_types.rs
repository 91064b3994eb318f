//! USB-core abstractions shared by the driver and its tests

use std::time::Duration;

use nix::errno::Errno;
use protocol::{EP_SIZE, SetupPacket};

/// Transfer primitives of one bound USB interface
///
/// A zero `timeout` means wait forever. Errors are the USB core's errno,
/// passed through to the caller unchanged. Implementations need not serialize
/// calls themselves; the session guarantees one transfer at a time.
pub trait UsbTransport: Send + Sync {
    /// Control transfer on endpoint 0; direction comes from the setup packet
    fn control(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Errno>;

    fn bulk_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Errno>;

    fn bulk_out(&self, buf: &[u8], timeout: Duration) -> Result<usize, Errno>;

    fn interrupt_out(&self, buf: &[u8], timeout: Duration) -> Result<usize, Errno>;

    /// wMaxPacketSize of the bulk OUT endpoint
    fn max_packet_size(&self) -> usize {
        EP_SIZE
    }

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}

/// Bus location and ids of a candidate device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl std::fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus, self.address, self.vendor_id, self.product_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_display() {
        let summary = DeviceSummary {
            bus: 1,
            address: 12,
            vendor_id: 0x1209,
            product_id: 0x0001,
        };
        assert_eq!(summary.to_string(), "Bus 001 Device 012: ID 1209:0001");
    }
}
