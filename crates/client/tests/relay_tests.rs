//! Facade calls against socket nodes published by the host daemon

use std::sync::Arc;

use client::{DevNode, DevNodeOpener, WinUsbDevice};
use common::BridgeError;
use common::test_utils::{
    MockRecorder, MockResponse, MockTransport, TransferKind, create_mock_device_descriptor,
};
use driver::{DeviceRegistry, NodeServer};
use protocol::{Errno, NODE_CANDIDATES, SetupPacket};
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Published nodes drop before the runtime that serves them
struct Host {
    nodes: NodeServer,
    registry: Arc<DeviceRegistry>,
    runtime: Runtime,
    prefix: String,
    _dir: TempDir,
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/wixusb-dev", dir.path().display());
        let registry = Arc::new(DeviceRegistry::new(4));
        Self {
            runtime: Runtime::new().unwrap(),
            nodes: NodeServer::new(registry.clone(), prefix.clone()),
            registry,
            prefix,
            _dir: dir,
        }
    }

    /// Attach a mock device and publish its node
    fn plug(&mut self, product_id: u16) -> (u32, MockRecorder) {
        let transport = MockTransport::new(0x1209, product_id);
        let recorder = transport.recorder();
        let minor = self.registry.attach(Box::new(transport)).unwrap();
        let _guard = self.runtime.enter();
        self.nodes.publish(minor).unwrap();
        (minor, recorder)
    }

    fn connect(&self) -> Result<WinUsbDevice<DevNode>, Errno> {
        WinUsbDevice::connect(&DevNodeOpener, &self.prefix, NODE_CANDIDATES)
    }
}

#[test]
fn test_facade_over_published_node() {
    let mut host = Host::new();
    let (_, recorder) = host.plug(0x0042);

    let mut device = host.connect().unwrap();
    assert!(device.path().ends_with("wixusb-dev0"));

    let ids = device.vendor_product_id().unwrap();
    assert_eq!((ids.vendor_id, ids.product_id), (0x1209, 0x0042));

    recorder.push_response(MockResponse::Data(create_mock_device_descriptor(0x0042)));
    let descriptor = device.device_descriptor().unwrap();
    assert_eq!(descriptor.product_id, 0x0042);

    recorder.push_response(MockResponse::Data(vec![0xC3; 6]));
    let setup = SetupPacket {
        request_type: 0xC0,
        request: 0x01,
        length: 8,
        ..Default::default()
    };
    let mut buf = [0u8; 8];
    let mut transferred = 0;
    assert!(device.control_transfer(setup, &mut buf, Some(&mut transferred)));
    assert_eq!(transferred, 6);
    assert_eq!(&buf[..6], &[0xC3; 6]);

    assert!(device.write_pipe(0x03, &[9; 100], Some(&mut transferred)));
    assert_eq!(transferred, 100);
    assert_eq!(recorder.count(TransferKind::BulkOut), 1);

    recorder.push_response(MockResponse::Data(vec![1, 2, 3]));
    let mut buf = [0u8; 64];
    assert!(device.read_pipe(0x82, &mut buf, Some(&mut transferred)));
    assert_eq!(transferred, 3);
    assert_eq!(&buf[..3], &[1, 2, 3]);

    assert!(device.check_connected());
}

#[test]
fn test_unplug_reaches_open_handle() {
    let mut host = Host::new();
    let (minor, _recorder) = host.plug(0x0001);
    let mut device = host.connect().unwrap();

    host.registry.disconnect(minor).unwrap();
    host.nodes.withdraw(minor);

    assert!(!device.check_connected());
    assert_eq!(device.last_error(), Some(BridgeError::NoDevice));
    assert_eq!(host.connect().err(), Some(Errno::ENOENT));
}

#[test]
fn test_connect_skips_to_next_published_node() {
    let mut host = Host::new();
    let (first, _) = host.plug(0x0001);
    let (_, second) = host.plug(0x0002);
    host.nodes.withdraw(first);

    let mut device = host.connect().unwrap();
    assert!(device.path().ends_with("wixusb-dev1"));
    assert_eq!(device.vendor_product_id().unwrap().product_id, 0x0002);
    assert!(second.submissions().is_empty());
}
