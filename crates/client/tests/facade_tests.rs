//! End-to-end facade tests over the in-process driver

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use client::WinUsbDevice;
use common::BridgeError;
use common::test_utils::{
    MockRecorder, MockResponse, MockTransport, TransferKind, create_mock_device_descriptor,
    create_oversized_config_descriptor,
};
use driver::{DeviceRegistry, LoopbackOpener, OpenFile};
use proptest::prelude::*;
use protocol::{
    CTRL_BUFF_LENGTH, DEVICE_NODE_PREFIX, Errno, NODE_CANDIDATES, NodeOpener, SetupPacket,
};

/// Loopback opener that records every path it is asked for
struct RecordingOpener {
    inner: LoopbackOpener,
    tried: RefCell<Vec<PathBuf>>,
}

impl RecordingOpener {
    fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            inner: LoopbackOpener::new(registry, DEVICE_NODE_PREFIX),
            tried: RefCell::new(Vec::new()),
        }
    }
}

impl NodeOpener for RecordingOpener {
    type Node = OpenFile;

    fn open(&self, path: &Path) -> nix::Result<OpenFile> {
        self.tried.borrow_mut().push(path.to_path_buf());
        self.inner.open(path)
    }
}

fn attach(registry: &DeviceRegistry, product_id: u16) -> (u32, MockRecorder) {
    let transport = MockTransport::new(0x1209, product_id);
    let recorder = transport.recorder();
    let minor = registry.attach(Box::new(transport)).unwrap();
    (minor, recorder)
}

fn connect_single() -> (Arc<DeviceRegistry>, WinUsbDevice<OpenFile>, MockRecorder) {
    let registry = Arc::new(DeviceRegistry::new(4));
    let (_, recorder) = attach(&registry, 0x0001);
    let opener = LoopbackOpener::new(registry.clone(), DEVICE_NODE_PREFIX);
    let device = WinUsbDevice::connect(&opener, DEVICE_NODE_PREFIX, NODE_CANDIDATES).unwrap();
    (registry, device, recorder)
}

mod discovery {
    use super::*;

    #[test]
    fn test_connect_stops_at_first_node_that_opens() {
        let registry = Arc::new(DeviceRegistry::new(8));
        for pid in 0..4 {
            attach(&registry, pid);
        }
        for minor in 0..3 {
            registry.disconnect(minor).unwrap();
        }

        let opener = RecordingOpener::new(registry.clone());
        let mut device =
            WinUsbDevice::connect(&opener, DEVICE_NODE_PREFIX, NODE_CANDIDATES).unwrap();

        assert_eq!(device.path(), Path::new("/dev/wixusb-dev3"));
        let tried: Vec<_> = opener
            .tried
            .borrow()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        assert_eq!(
            tried,
            vec![
                "/dev/wixusb-dev0",
                "/dev/wixusb-dev1",
                "/dev/wixusb-dev2",
                "/dev/wixusb-dev3"
            ]
        );
        assert_eq!(device.vendor_product_id().unwrap().product_id, 3);
    }

    #[test]
    fn test_connect_reports_last_errno() {
        let registry = Arc::new(DeviceRegistry::new(2));
        let opener = RecordingOpener::new(registry);

        let result = WinUsbDevice::connect(&opener, DEVICE_NODE_PREFIX, NODE_CANDIDATES);
        assert_eq!(result.unwrap_err(), Errno::ENODEV);
        assert_eq!(opener.tried.borrow().len(), NODE_CANDIDATES as usize);
    }

    #[test]
    fn test_connect_with_no_candidates() {
        let registry = Arc::new(DeviceRegistry::new(1));
        attach(&registry, 1);
        let opener = RecordingOpener::new(registry);

        let result = WinUsbDevice::connect(&opener, DEVICE_NODE_PREFIX, 0);
        assert_eq!(result.unwrap_err(), Errno::ENOENT);
        assert!(opener.tried.borrow().is_empty());
    }
}

mod transfers {
    use super::*;

    #[test]
    fn test_timeout_policy_applies_until_changed() {
        let (_registry, mut device, recorder) = connect_single();

        assert!(device.set_pipe_policy(0x82, 0x03, &500u32.to_ne_bytes()));

        let setup = SetupPacket {
            request_type: 0xC0,
            request: 0x01,
            length: 4,
            ..Default::default()
        };
        assert!(device.control_transfer(setup, &mut [0u8; 4], None));
        assert_eq!(recorder.last().unwrap().timeout, Duration::from_millis(500));

        assert!(device.write_pipe(0x03, &[1, 2, 3], None));
        assert_eq!(recorder.last().unwrap().timeout, Duration::from_millis(500));

        assert!(device.set_timeout(0));
        assert!(device.write_pipe(0x03, &[1], None));
        assert_eq!(recorder.last().unwrap().timeout, Duration::ZERO);
    }

    #[test]
    fn test_bulk_round_trip() {
        let (_registry, mut device, recorder) = connect_single();
        recorder.push_response(MockResponse::Data(vec![5, 6, 7]));

        let mut buf = [0u8; 64];
        let mut read = 0;
        assert!(device.read_pipe(0x82, &mut buf, Some(&mut read)));
        assert_eq!(&buf[..read], &[5, 6, 7]);

        let mut written = 0;
        assert!(device.write_pipe(0x03, &[0xAA; 64], Some(&mut written)));
        assert_eq!(written, 64);
        // a full packet is followed by a zero-length one
        assert_eq!(recorder.count(TransferKind::BulkOut), 2);
    }

    #[test]
    fn test_oversized_calls_never_reach_the_driver() {
        let (_registry, mut device, recorder) = connect_single();

        assert!(!device.write_pipe(0x03, &vec![0u8; 4097], None));
        assert_eq!(device.last_error(), Some(BridgeError::BufferTooLarge));
        assert!(!device.write_interrupt(&[0u8; 65]));
        let setup = SetupPacket {
            request_type: 0x40,
            length: 200,
            ..Default::default()
        };
        assert!(!device.control_transfer(setup, &mut [0u8; 200], None));

        assert!(recorder.submissions().is_empty());
    }

    #[test]
    fn test_transport_errors_keep_their_errno() {
        let (_registry, mut device, recorder) = connect_single();
        recorder.push_response(MockResponse::Error(Errno::EPIPE));

        let setup = SetupPacket {
            request_type: 0xC0,
            length: 8,
            ..Default::default()
        };
        assert_eq!(
            device.try_control_transfer(setup, &mut [0u8; 8]),
            Err(BridgeError::Transport(Errno::EPIPE))
        );
    }

    #[test]
    fn test_interrupt_write() {
        let (_registry, mut device, recorder) = connect_single();
        assert!(device.write_interrupt(&[1, 2, 3, 4]));
        let last = recorder.last().unwrap();
        assert_eq!(last.kind, TransferKind::InterruptOut);
        assert_eq!(last.data, vec![1, 2, 3, 4]);
    }
}

mod descriptors {
    use super::*;

    #[test]
    fn test_device_descriptor() {
        let (_registry, mut device, recorder) = connect_single();
        recorder.push_response(MockResponse::Data(create_mock_device_descriptor(0x0001)));

        let descriptor = device.device_descriptor().unwrap();
        assert_eq!(descriptor.vendor_id, 0x1209);
        assert_eq!(descriptor.product_id, 0x0001);
    }

    #[test]
    fn test_oversized_descriptor_truncates_to_caller_buffer() {
        let (_registry, mut device, recorder) = connect_single();
        let config = create_oversized_config_descriptor();
        recorder.push_response(MockResponse::Data(config.clone()));

        let mut buf = [0u8; 32];
        assert_eq!(device.get_descriptor(0x02, 0, 0, &mut buf), Ok(32));
        assert_eq!(&buf[..], &config[..32]);
    }

    #[test]
    fn test_descriptor_after_disconnect() {
        let (registry, mut device, _recorder) = connect_single();
        registry.disconnect(0).unwrap();

        assert_eq!(
            device.get_descriptor(0x01, 0, 0, &mut [0u8; 18]),
            Err(Errno::ENODEV)
        );
        assert!(!device.check_connected());
        assert_eq!(device.last_error(), Some(BridgeError::NoDevice));
    }
}

proptest! {
    #[test]
    fn prop_control_in_never_overruns(
        declared in 0usize..=128,
        spare in 0usize..=64,
        returned in 0usize..=256,
    ) {
        let (_registry, mut device, recorder) = connect_single();
        recorder.push_response(MockResponse::Count(returned));

        let setup = SetupPacket {
            request_type: 0xC0,
            request: 0x01,
            length: declared as u16,
            ..Default::default()
        };
        let buffer_len = declared + spare;
        let mut buf = vec![0xEE; buffer_len + 8];
        let mut transferred = usize::MAX;
        prop_assert!(device.control_transfer(setup, &mut buf[..buffer_len], Some(&mut transferred)));

        prop_assert_eq!(transferred, returned.min(declared));
        prop_assert!(transferred <= buffer_len);
        prop_assert!(buf[transferred..buffer_len].iter().all(|b| *b == 0xEE));
        prop_assert!(buf[buffer_len..].iter().all(|b| *b == 0xEE));
    }

    #[test]
    fn prop_control_in_larger_than_buffer_rejected_locally(
        buffer_len in 0usize..128,
        excess in 1usize..=128,
    ) {
        let (_registry, mut device, recorder) = connect_single();
        let declared = (buffer_len + excess).min(CTRL_BUFF_LENGTH);

        let setup = SetupPacket {
            request_type: 0xC0,
            request: 0x01,
            length: declared as u16,
            ..Default::default()
        };
        let mut buf = vec![0u8; buffer_len];
        prop_assert_eq!(
            device.try_control_transfer(setup, &mut buf),
            Err(BridgeError::InvalidArgument)
        );
        prop_assert!(recorder.submissions().is_empty());
    }
}
