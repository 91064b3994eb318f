//! Attach/detach watcher
//!
//! Dedicated thread that owns the USB context. It enumerates matching devices
//! at start, then turns hot-plug notifications into registry attach and
//! disconnect calls, reporting each to the Tokio runtime over the watcher
//! bridge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{DeviceSummary, WatcherCommand, WatcherEvent, WatcherWorker};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, error, info, warn};

use crate::registry::DeviceRegistry;
use crate::usb::transport::RusbTransport;

/// Vendor and product ids the driver binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdTable {
    vendor_id: u16,
    product_ids: Vec<u16>,
}

impl IdTable {
    /// An empty product list matches every product of the vendor
    pub fn new(vendor_id: u16, product_ids: Vec<u16>) -> Self {
        Self {
            vendor_id,
            product_ids,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        vendor_id == self.vendor_id
            && (self.product_ids.is_empty() || self.product_ids.contains(&product_id))
    }
}

/// Hot-plug notification queued for the watcher loop
enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

/// Forwards libusb callbacks to the watcher loop
///
/// Callbacks run inside `handle_events`, where the registry must not be
/// touched, so they only enqueue.
struct HotplugCallback {
    tx: async_channel::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Err(e) = self.tx.try_send(HotplugEvent::Arrived(device)) {
            warn!("Dropped arrival notification: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let (bus, address) = (device.bus_number(), device.address());
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            bus, address
        );
        if let Err(e) = self.tx.try_send(HotplugEvent::Left { bus, address }) {
            warn!("Dropped removal notification: {}", e);
        }
    }
}

/// Binds matching devices to registry sessions
pub struct DeviceWatcher {
    context: Context,
    registry: Arc<DeviceRegistry>,
    ids: IdTable,
    interface: u8,
    /// (bus, address) -> (minor, summary)
    attached: HashMap<(u8, u8), (u32, DeviceSummary)>,
    hotplug_tx: async_channel::Sender<HotplugEvent>,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
    _registration: Option<Registration<Context>>,
}

impl DeviceWatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        ids: IdTable,
        interface: u8,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = async_channel::bounded(64);

        Ok(Self {
            context,
            registry,
            ids,
            interface,
            attached: HashMap::new(),
            hotplug_tx,
            hotplug_rx,
            _registration: None,
        })
    }

    /// Matching devices currently on the bus
    pub fn matching_devices(&self) -> Result<Vec<Device<Context>>, rusb::Error> {
        let devices = self.context.devices()?;
        Ok(devices
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|d| self.ids.matches(d.vendor_id(), d.product_id()))
                    .unwrap_or(false)
            })
            .collect())
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        match self.matching_devices() {
            Ok(devices) => devices.iter().filter_map(summarize).collect(),
            Err(e) => {
                warn!("Failed to enumerate devices: {}", e);
                Vec::new()
            }
        }
    }

    /// Attach every matching device already present
    pub fn enumerate(&mut self) -> Result<Vec<WatcherEvent>, rusb::Error> {
        let devices = self.matching_devices()?;
        let events: Vec<WatcherEvent> = devices
            .into_iter()
            .filter_map(|device| self.attach(device))
            .collect();
        debug!("Enumerated {} matching devices", events.len());
        Ok(events)
    }

    /// Register for hot-plug notifications
    pub fn watch(&mut self) -> Result<(), rusb::Error> {
        if !rusb::has_hotplug() {
            warn!("libusb has no hot-plug support; only devices present at start are bound");
            return Ok(());
        }

        let callback = HotplugCallback {
            tx: self.hotplug_tx.clone(),
        };
        let registration = HotplugBuilder::new()
            .vendor_id(self.ids.vendor_id)
            .enumerate(false) // already enumerated
            .register(&self.context, Box::new(callback))?;

        self._registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Run libusb event handling once, then apply queued notifications
    pub fn poll(&mut self, timeout: Duration) -> Vec<WatcherEvent> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(timeout);
            }
        }

        let mut events = Vec::new();
        while let Ok(notification) = self.hotplug_rx.try_recv() {
            let event = match notification {
                HotplugEvent::Arrived(device) => self.attach(device),
                HotplugEvent::Left { bus, address } => self.detach(bus, address),
            };
            events.extend(event);
        }
        events
    }

    /// Attached sessions by minor
    pub fn sessions(&self) -> Vec<(u32, DeviceSummary)> {
        let mut sessions: Vec<_> = self.attached.values().copied().collect();
        sessions.sort_by_key(|(minor, _)| *minor);
        sessions
    }

    /// Disconnect every session this watcher attached
    pub fn shutdown(&mut self) -> Vec<WatcherEvent> {
        let keys: Vec<_> = self.attached.keys().copied().collect();
        keys.into_iter()
            .filter_map(|(bus, address)| self.detach(bus, address))
            .collect()
    }

    fn attach(&mut self, device: Device<Context>) -> Option<WatcherEvent> {
        let summary = summarize(&device)?;
        if !self.ids.matches(summary.vendor_id, summary.product_id) {
            return None;
        }
        let key = (summary.bus, summary.address);
        if self.attached.contains_key(&key) {
            return None;
        }

        let transport = match RusbTransport::open(&device, self.interface) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to bind {}: {}", summary, e);
                return Some(WatcherEvent::AttachFailed {
                    device: summary,
                    reason: e.to_string(),
                });
            }
        };

        match self.registry.attach(Box::new(transport)) {
            Ok(minor) => {
                info!("Attached {} as minor {}", summary, minor);
                self.attached.insert(key, (minor, summary));
                Some(WatcherEvent::Attached {
                    minor,
                    device: summary,
                })
            }
            Err(e) => Some(WatcherEvent::AttachFailed {
                device: summary,
                reason: e.to_string(),
            }),
        }
    }

    fn detach(&mut self, bus: u8, address: u8) -> Option<WatcherEvent> {
        let (minor, summary) = self.attached.remove(&(bus, address))?;
        if let Err(e) = self.registry.disconnect(minor) {
            warn!("Minor {} was already gone: {}", minor, e);
        }
        info!("Detached {} (minor {})", summary, minor);
        Some(WatcherEvent::Detached {
            minor,
            device: summary,
        })
    }
}

fn summarize<T: UsbContext>(device: &Device<T>) -> Option<DeviceSummary> {
    let descriptor = device.device_descriptor().ok()?;
    Some(DeviceSummary {
        bus: device.bus_number(),
        address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
    })
}

/// Watcher thread
///
/// Processes commands from the Tokio runtime between rounds of USB event
/// handling, until `Shutdown` or until the runtime side goes away.
pub struct WatcherThread {
    watcher: DeviceWatcher,
    worker: WatcherWorker,
}

impl WatcherThread {
    pub fn new(watcher: DeviceWatcher, worker: WatcherWorker) -> Self {
        Self { watcher, worker }
    }

    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB watcher thread started");

        for event in self.watcher.enumerate()? {
            self.publish(event);
        }
        self.watcher.watch()?;

        loop {
            match self.worker.try_recv_command() {
                Some(WatcherCommand::Shutdown) => {
                    info!("USB watcher shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.worker.is_orphaned() => {
                    warn!("Runtime went away, stopping USB watcher");
                    break;
                }
                None => {}
            }

            for event in self.watcher.poll(Duration::from_millis(100)) {
                self.publish(event);
            }
        }

        for event in self.watcher.shutdown() {
            self.publish(event);
        }
        info!("USB watcher thread stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: WatcherCommand) {
        match cmd {
            WatcherCommand::ListDevices { response } => {
                let devices = self.watcher.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }
            WatcherCommand::ListSessions { response } => {
                let _ = response.send(self.watcher.sessions());
            }
            // handled by the run loop
            WatcherCommand::Shutdown => {}
        }
    }

    fn publish(&self, event: WatcherEvent) {
        if let Err(e) = self.worker.send_event(event) {
            error!("Failed to publish watcher event: {}", e);
        }
    }
}

/// Spawn the watcher thread
pub fn spawn_watcher(
    watcher: DeviceWatcher,
    worker: WatcherWorker,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-watcher".to_string())
        .spawn(move || WatcherThread::new(watcher, worker).run())
}
