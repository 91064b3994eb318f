//! Async channel bridge between the host daemon and the USB watcher thread

use async_channel::{Receiver, Sender, bounded};

use crate::usb_types::DeviceSummary;

/// Commands from the Tokio runtime to the watcher thread
#[derive(Debug)]
pub enum WatcherCommand {
    /// List matching devices currently on the bus
    ListDevices {
        response: tokio::sync::oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// List attached sessions by minor number
    ListSessions {
        response: tokio::sync::oneshot::Sender<Vec<(u32, DeviceSummary)>>,
    },

    /// Disconnect every session and stop the thread
    Shutdown,
}

/// Attach/detach notifications from the watcher thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// Session created under `minor`
    Attached { minor: u32, device: DeviceSummary },

    /// Session disconnected; open handles now see NoDevice
    Detached { minor: u32, device: DeviceSummary },

    /// A matching device could not be bound
    AttachFailed {
        device: DeviceSummary,
        reason: String,
    },
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct WatcherBridge {
    cmd_tx: Sender<WatcherCommand>,
    event_rx: Receiver<WatcherEvent>,
}

impl WatcherBridge {
    /// Send a command to the watcher thread
    pub async fn send_command(&self, cmd: WatcherCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next attach/detach event
    pub async fn recv_event(&self) -> crate::Result<WatcherEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the watcher thread (blocking)
pub struct WatcherWorker {
    cmd_rx: Receiver<WatcherCommand>,
    event_tx: Sender<WatcherEvent>,
}

impl WatcherWorker {
    /// Receive a command without blocking
    pub fn try_recv_command(&self) -> Option<WatcherCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether the runtime side has gone away
    pub fn is_orphaned(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: WatcherEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the watcher thread
///
/// Returns (WatcherBridge for Tokio, WatcherWorker for the watcher thread)
pub fn create_watcher_bridge() -> (WatcherBridge, WatcherWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(256);

    (
        WatcherBridge { cmd_tx, event_rx },
        WatcherWorker { cmd_rx, event_tx },
    )
}
