//! Device nodes published as Unix sockets
//!
//! Without the kernel module, `wixusb-host` binds devices in its own process.
//! The [`NodeServer`] makes them reachable from other processes: each attached
//! minor gets a listening socket at `<prefix><minor>`, every accepted
//! connection is one [`OpenFile`], and channel calls travel as relay frames
//! (see [`protocol::relay`]).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::sync::Arc;

use common::BridgeError;
use protocol::{RelayOp, RelayReply, RelayRequest, node_path};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::OpenFile;
use crate::registry::DeviceRegistry;

/// Listening sockets for the attached minors
#[derive(Debug)]
pub struct NodeServer {
    registry: Arc<DeviceRegistry>,
    prefix: String,
    nodes: HashMap<u32, PublishedNode>,
}

#[derive(Debug)]
struct PublishedNode {
    path: PathBuf,
    accept: JoinHandle<()>,
}

impl NodeServer {
    pub fn new(registry: Arc<DeviceRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
            nodes: HashMap::new(),
        }
    }

    /// Start accepting connections for `minor`
    ///
    /// A socket left behind by an earlier run is replaced; any other file at
    /// the node path is an error. Must be called inside a Tokio runtime.
    pub fn publish(&mut self, minor: u32) -> io::Result<PathBuf> {
        self.withdraw(minor);

        let path = node_path(&self.prefix, minor);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => fs::remove_file(&path)?,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&path)?;
        let accept = tokio::spawn(accept_loop(listener, self.registry.clone(), minor));
        info!("Minor {} published at {}", minor, path.display());

        self.nodes.insert(
            minor,
            PublishedNode {
                path: path.clone(),
                accept,
            },
        );
        Ok(path)
    }

    /// Stop accepting connections for `minor` and remove its socket
    ///
    /// Connections already open keep their handle; once the device is gone
    /// their calls fail with `ENODEV`.
    pub fn withdraw(&mut self, minor: u32) {
        let Some(node) = self.nodes.remove(&minor) else {
            return;
        };
        node.accept.abort();
        if let Err(e) = fs::remove_file(&node.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", node.path.display(), e);
            }
        }
        debug!("Minor {} withdrawn", minor);
    }

    /// Minors currently published, ascending
    pub fn published(&self) -> Vec<u32> {
        let mut minors: Vec<u32> = self.nodes.keys().copied().collect();
        minors.sort_unstable();
        minors
    }

    pub fn shutdown(&mut self) {
        for minor in self.published() {
            self.withdraw(minor);
        }
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: UnixListener, registry: Arc<DeviceRegistry>, minor: u32) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, &registry, minor).await {
                        debug!("Minor {}: connection ended: {}", minor, e);
                    }
                });
            }
            Err(e) => {
                warn!("Minor {}: accept failed: {}", minor, e);
                break;
            }
        }
    }
}

/// Serve one connection as one open handle
async fn serve(mut stream: UnixStream, registry: &DeviceRegistry, minor: u32) -> io::Result<()> {
    let file = match OpenFile::open(registry, minor) {
        Ok(file) => Arc::new(file),
        Err(e) => {
            stream
                .write_all(&RelayReply::failed(e.errno()).encode())
                .await?;
            return Ok(());
        }
    };
    stream.write_all(&RelayReply { rc: 0, len: 0 }.encode()).await?;

    loop {
        let mut header = [0u8; RelayRequest::SIZE];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let request = RelayRequest::decode(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut payload = vec![0u8; request.payload_len()];
        stream.read_exact(&mut payload).await?;

        let mut call = tokio::task::spawn_blocking({
            let file = file.clone();
            move || execute(&file, request, payload)
        });

        // the peer is synchronous: anything it sends mid-call means it is gone
        let mut hangup = [0u8; 1];
        let (reply, data) = tokio::select! {
            joined = &mut call => joined.map_err(io::Error::other)?,
            read = stream.read(&mut hangup) => {
                debug!("Minor {}: peer left during a call", minor);
                file.interrupter().raise();
                let _ = call.await;
                return match read {
                    Ok(0) => Ok(()),
                    Ok(_) => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request sent while a call was pending",
                    )),
                    Err(e) => Err(e),
                };
            }
        };

        stream.write_all(&reply.encode()).await?;
        stream.write_all(&data).await?;
    }
}

/// Run one relayed call on the handle
fn execute(file: &OpenFile, request: RelayRequest, mut payload: Vec<u8>) -> (RelayReply, Vec<u8>) {
    let result = match request.op {
        RelayOp::Read => {
            let mut buf = vec![0u8; request.len as usize];
            file.read_bulk(&mut buf).map(|received| {
                buf.truncate(received);
                (received as i32, buf)
            })
        }
        RelayOp::Write => file
            .write_bulk(&payload)
            .map(|sent| (sent as i32, Vec::new())),
        RelayOp::Ioctl => file
            .command(request.request, &mut payload)
            .map(|rc| (rc, payload)),
    };

    match result {
        Ok((rc, data)) => match RelayReply::success(rc, data.len()) {
            Ok(reply) => (reply, data),
            Err(e) => (RelayReply::failed(BridgeError::from(e).errno()), Vec::new()),
        },
        Err(e) => (RelayReply::failed(e.errno()), Vec::new()),
    }
}
