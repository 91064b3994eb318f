//! Test utilities for the WixUSB bridge
//!
//! Provides a recording mock of the USB core and descriptor fixtures for
//! testing across crates. Enabled for other crates with the `test-utils`
//! feature.
//!
//! # Example
//!
//! ```
//! use common::UsbTransport;
//! use common::test_utils::{MockResponse, MockTransport, TransferKind};
//! use std::time::Duration;
//!
//! let transport = MockTransport::new(0x1209, 0x0001);
//! let recorder = transport.recorder();
//! recorder.push_response(MockResponse::Data(vec![1, 2, 3]));
//!
//! let mut buf = [0u8; 8];
//! let n = transport.bulk_in(&mut buf, Duration::ZERO).unwrap();
//! assert_eq!(n, 3);
//! assert_eq!(recorder.count(TransferKind::BulkIn), 1);
//! ```

use crate::usb_types::UsbTransport;
use nix::errno::Errno;
use protocol::{EP_SIZE, SetupPacket, VENDOR_ID};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Transfer primitive invoked on the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    BulkIn,
    BulkOut,
    InterruptOut,
}

/// One recorded call into the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub kind: TransferKind,
    pub setup: Option<SetupPacket>,
    /// Length of the caller's buffer
    pub len: usize,
    /// Bytes handed to the device (OUT transfers only)
    pub data: Vec<u8>,
    pub timeout: Duration,
}

/// Scripted outcome for the next call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// IN: device returns these bytes (clipped to the buffer)
    Data(Vec<u8>),
    /// Transfer reports this count; IN buffers are filled with a ramp
    Count(usize),
    /// Transfer fails with this errno
    Error(Errno),
}

#[derive(Debug, Default)]
struct MockState {
    submissions: Mutex<Vec<Submission>>,
    responses: Mutex<VecDeque<MockResponse>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
    drops: AtomicUsize,
}

/// Recording stand-in for a bound USB interface
///
/// Unscripted IN transfers return no data; unscripted OUT transfers accept
/// the whole buffer.
#[derive(Debug)]
pub struct MockTransport {
    vendor_id: u16,
    product_id: u16,
    max_packet_size: usize,
    state: Arc<MockState>,
}

/// Inspection handle that outlives the transport
#[derive(Debug, Clone)]
pub struct MockRecorder {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            max_packet_size: EP_SIZE,
            state: Arc::new(MockState::default()),
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn recorder(&self) -> MockRecorder {
        MockRecorder {
            state: Arc::clone(&self.state),
        }
    }

    fn submit(
        &self,
        kind: TransferKind,
        setup: Option<SetupPacket>,
        buf: &mut [u8],
        outbound: bool,
        timeout: Duration,
    ) -> Result<usize, Errno> {
        let state = &self.state;
        if state.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            state.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        lock(&state.submissions).push(Submission {
            kind,
            setup,
            len: buf.len(),
            data: if outbound { buf.to_vec() } else { Vec::new() },
            timeout,
        });

        let delay = *lock(&state.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let response = lock(&state.responses).pop_front();
        let result = match response {
            Some(MockResponse::Error(errno)) => Err(errno),
            Some(MockResponse::Count(count)) if outbound => Ok(count.min(buf.len())),
            Some(MockResponse::Count(count)) => {
                let count = count.min(buf.len());
                for (i, byte) in buf[..count].iter_mut().enumerate() {
                    *byte = (i & 0xFF) as u8;
                }
                Ok(count)
            }
            Some(MockResponse::Data(_)) | None if outbound => Ok(buf.len()),
            Some(MockResponse::Data(data)) => {
                let count = data.len().min(buf.len());
                buf[..count].copy_from_slice(&data[..count]);
                Ok(count)
            }
            None => Ok(0),
        };

        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl UsbTransport for MockTransport {
    fn control(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Errno> {
        let outbound = setup.direction() == protocol::Direction::Out;
        self.submit(TransferKind::Control, Some(*setup), data, outbound, timeout)
    }

    fn bulk_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Errno> {
        self.submit(TransferKind::BulkIn, None, buf, false, timeout)
    }

    fn bulk_out(&self, buf: &[u8], timeout: Duration) -> Result<usize, Errno> {
        let mut copy = buf.to_vec();
        self.submit(TransferKind::BulkOut, None, &mut copy, true, timeout)
    }

    fn interrupt_out(&self, buf: &[u8], timeout: Duration) -> Result<usize, Errno> {
        let mut copy = buf.to_vec();
        self.submit(TransferKind::InterruptOut, None, &mut copy, true, timeout)
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.state.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockRecorder {
    /// Queue the outcome of a future call, in call order
    pub fn push_response(&self, response: MockResponse) {
        lock(&self.state.responses).push_back(response);
    }

    /// Make every call block for `delay` while marked in flight
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.state.delay) = delay;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.state.submissions).clone()
    }

    pub fn count(&self, kind: TransferKind) -> usize {
        lock(&self.state.submissions)
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    pub fn last(&self) -> Option<Submission> {
        lock(&self.state.submissions).last().cloned()
    }

    /// Calls that started while another was still running
    pub fn overlaps(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    /// Times the transport was torn down
    pub fn drops(&self) -> usize {
        self.state.drops.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a mock USB descriptor response (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor for `product_id` under the
/// bridge's vendor id.
pub fn create_mock_device_descriptor(product_id: u16) -> Vec<u8> {
    let vid = VENDOR_ID.to_le_bytes();
    let pid = product_id.to_le_bytes();
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0xFF, // bDeviceClass (Vendor-specific)
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        vid[0], vid[1], // idVendor
        pid[0], pid[1], // idProduct
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create a configuration descriptor longer than any inline buffer
///
/// One vendor interface with eight bulk endpoints: 9 + 9 + 8 * 7 + padding
/// class descriptors, 200 bytes in total.
pub fn create_oversized_config_descriptor() -> Vec<u8> {
    let total: u16 = 200;
    let mut desc = vec![
        0x09, // bLength
        0x02, // bDescriptorType (Configuration)
        (total & 0xFF) as u8,
        (total >> 8) as u8, // wTotalLength
        0x01, // bNumInterfaces
        0x01, // bConfigurationValue
        0x00, // iConfiguration
        0x80, // bmAttributes (Bus-powered)
        0x32, // bMaxPower (100mA)
        0x09, 0x04, 0x00, 0x00, 0x08, 0xFF, 0x00, 0x00, 0x00, // interface
    ];
    for ep in 0..8u8 {
        let address = if ep % 2 == 0 { 0x81 + ep / 2 } else { 0x01 + ep / 2 };
        desc.extend_from_slice(&[0x07, 0x05, address, 0x02, 0x40, 0x00, 0x00]);
    }
    desc.resize(usize::from(total), 0x00);
    desc
}
