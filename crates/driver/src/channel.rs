//! Device-file entry points
//!
//! An [`OpenFile`] is one open handle on a device node: `read`/`write` move raw
//! bulk payloads, `ioctl` carries command packets to the dispatcher.

use std::path::Path;
use std::sync::Arc;

use common::BridgeError;
use nix::errno::Errno;
use protocol::{BULK_BUFF_LENGTH, Channel, NodeOpener, Opcode, node_index};
use tracing::{debug, warn};

use crate::dispatcher;
use crate::registry::DeviceRegistry;
use crate::session::{Interrupt, SessionRef};

/// An open device file
#[derive(Debug)]
pub struct OpenFile {
    session: SessionRef,
    interrupt: Interrupt,
}

impl OpenFile {
    /// Open the node for `minor`
    pub fn open(registry: &DeviceRegistry, minor: u32) -> Result<Self, BridgeError> {
        Ok(Self {
            session: registry.open(minor)?,
            interrupt: Interrupt::new(),
        })
    }

    /// Token that aborts this handle's next blocked wait for the device
    pub fn interrupter(&self) -> Interrupt {
        self.interrupt.clone()
    }

    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    /// Bulk IN of at most one scratch buffer
    pub fn read_bulk(&self, buf: &mut [u8]) -> Result<usize, BridgeError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let io = self.session.begin_io(&self.interrupt)?;
        let mut scratch = vec![0u8; buf.len().min(BULK_BUFF_LENGTH)];
        let received = io
            .transport()
            .bulk_in(&mut scratch, self.session.timeout())
            .map_err(BridgeError::Transport)?
            .min(scratch.len());
        buf[..received].copy_from_slice(&scratch[..received]);

        debug!("Minor {}: read {} bytes", self.session.minor(), received);
        Ok(received)
    }

    /// Bulk OUT, terminated by a zero-length packet on a packet boundary
    pub fn write_bulk(&self, buf: &[u8]) -> Result<usize, BridgeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() > BULK_BUFF_LENGTH {
            return Err(BridgeError::BufferTooLarge);
        }

        let io = self.session.begin_io(&self.interrupt)?;
        let timeout = self.session.timeout();
        let scratch = buf.to_vec();
        let sent = io
            .transport()
            .bulk_out(&scratch, timeout)
            .map_err(BridgeError::Transport)?;

        let packet_size = io.transport().max_packet_size();
        if sent != 0 && packet_size != 0 && sent % packet_size == 0 {
            io.transport()
                .bulk_out(&[], timeout)
                .map_err(BridgeError::Transport)?;
        }

        debug!("Minor {}: wrote {} bytes", self.session.minor(), sent);
        Ok(sent)
    }

    /// Run a command packet in place
    ///
    /// `arg` must hold at least the opcode's packet; only output fields are
    /// written back.
    pub fn command(&self, request: u32, arg: &mut [u8]) -> Result<i32, BridgeError> {
        let size = Opcode::from_request_code(request)?.packet_size();
        let Some(packet) = arg.get_mut(..size) else {
            return Err(BridgeError::BadAddress);
        };

        let payload = packet.to_vec();
        let reply = dispatcher::dispatch(&self.session, &self.interrupt, request, &payload)?;
        reply.write_output(packet)?;
        Ok(reply.return_value())
    }

    /// Close the handle
    pub fn release(self) {}
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        debug!(
            "Minor {}: handle closed ({} holds before release)",
            self.session.minor(),
            self.session.ref_count()
        );
    }
}

impl Channel for OpenFile {
    fn read(&mut self, buf: &mut [u8]) -> nix::Result<usize> {
        self.read_bulk(buf).map_err(Errno::from)
    }

    fn write(&mut self, buf: &[u8]) -> nix::Result<usize> {
        self.write_bulk(buf).map_err(Errno::from)
    }

    fn ioctl(&mut self, request: u32, arg: &mut [u8]) -> nix::Result<i32> {
        self.command(request, arg).map_err(Errno::from)
    }
}

/// In-process opener resolving node paths against a registry
///
/// Node `<prefix>N` is minor `N`.
#[derive(Debug, Clone)]
pub struct LoopbackOpener {
    registry: Arc<DeviceRegistry>,
    prefix: String,
}

impl LoopbackOpener {
    pub fn new(registry: Arc<DeviceRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}

impl NodeOpener for LoopbackOpener {
    type Node = OpenFile;

    fn open(&self, path: &Path) -> nix::Result<OpenFile> {
        let minor = node_index(&self.prefix, path).ok_or(Errno::ENOENT)?;
        OpenFile::open(&self.registry, minor).map_err(|e| {
            warn!("Open {} failed: {}", path.display(), e);
            Errno::from(e)
        })
    }
}
