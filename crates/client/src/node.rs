//! Device nodes created by the host driver
//!
//! A node path names either a character device created by the kernel driver
//! or a Unix socket published by `wixusb-host run`. Socket nodes carry each
//! channel call as one relay frame exchange.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use protocol::{Channel, Errno, NodeOpener, RELAY_MAX_PAYLOAD, RelayReply, RelayRequest};
use tracing::{debug, trace};

/// An open `/dev/wixusb-devN`
#[derive(Debug)]
pub struct DevNode {
    backing: Backing,
    path: PathBuf,
}

#[derive(Debug)]
enum Backing {
    Device(File),
    Relay(UnixStream),
}

impl DevNode {
    pub fn open(path: &Path) -> nix::Result<Self> {
        let meta = fs::metadata(path).map_err(errno_of)?;
        let backing = if meta.file_type().is_socket() {
            Backing::Relay(open_relay(path)?)
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(errno_of)?;
            Backing::Device(file)
        };
        Ok(Self {
            backing,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether calls go through a host socket rather than the kernel
    pub fn is_relayed(&self) -> bool {
        matches!(self.backing, Backing::Relay(_))
    }
}

impl Channel for DevNode {
    fn read(&mut self, buf: &mut [u8]) -> nix::Result<usize> {
        match &mut self.backing {
            Backing::Device(file) => file.read(buf).map_err(errno_of),
            Backing::Relay(stream) => {
                let len = buf.len().min(RELAY_MAX_PAYLOAD);
                let request = RelayRequest::read(len).map_err(|_| Errno::EMSGSIZE)?;
                let (rc, data) = exchange(stream, request, &[])?;
                let received = data.len().min(buf.len());
                buf[..received].copy_from_slice(&data[..received]);
                Ok(rc.min(received as i32) as usize)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> nix::Result<usize> {
        match &mut self.backing {
            Backing::Device(file) => file.write(buf).map_err(errno_of),
            Backing::Relay(stream) => {
                let request = RelayRequest::write(buf.len()).map_err(|_| Errno::EMSGSIZE)?;
                let (rc, _) = exchange(stream, request, buf)?;
                Ok(rc as usize)
            }
        }
    }

    fn ioctl(&mut self, request: u32, arg: &mut [u8]) -> nix::Result<i32> {
        // the kernel copies the size encoded in the request
        let size = ((request >> 16) & 0x3fff) as usize;
        if arg.len() < size {
            return Err(Errno::EFAULT);
        }

        trace!("ioctl {:#010x} on {}", request, self.path.display());
        match &mut self.backing {
            Backing::Device(file) => {
                // SAFETY: `arg` is live and at least as long as the request declares.
                let rc = unsafe {
                    nix::libc::ioctl(file.as_raw_fd(), request as _, arg.as_mut_ptr())
                };
                Errno::result(rc)
            }
            Backing::Relay(stream) => {
                let packet = &mut arg[..size];
                let frame = RelayRequest::ioctl(request, size).map_err(|_| Errno::EMSGSIZE)?;
                let (rc, data) = exchange(stream, frame, packet)?;
                if !data.is_empty() {
                    if data.len() != packet.len() {
                        return Err(Errno::EPROTO);
                    }
                    packet.copy_from_slice(&data);
                }
                Ok(rc)
            }
        }
    }
}

/// Connect to a host socket and collect the result of the open
fn open_relay(path: &Path) -> nix::Result<UnixStream> {
    let mut stream = UnixStream::connect(path).map_err(errno_of)?;
    let mut header = [0u8; RelayReply::SIZE];
    stream.read_exact(&mut header).map_err(relay_errno)?;
    let reply = RelayReply::decode(&header).map_err(|_| Errno::EPROTO)?;
    reply.result()?;
    debug!("Opened relayed node {}", path.display());
    Ok(stream)
}

/// One request/reply round trip; the reply data is returned on success
fn exchange(
    stream: &mut UnixStream,
    request: RelayRequest,
    payload: &[u8],
) -> nix::Result<(i32, Vec<u8>)> {
    stream.write_all(&request.encode()).map_err(relay_errno)?;
    stream.write_all(payload).map_err(relay_errno)?;

    let mut header = [0u8; RelayReply::SIZE];
    stream.read_exact(&mut header).map_err(relay_errno)?;
    let reply = RelayReply::decode(&header).map_err(|_| Errno::EPROTO)?;
    let mut data = vec![0u8; reply.len as usize];
    stream.read_exact(&mut data).map_err(relay_errno)?;
    Ok((reply.result()?, data))
}

/// Opens real device nodes
#[derive(Debug, Clone, Copy, Default)]
pub struct DevNodeOpener;

impl NodeOpener for DevNodeOpener {
    type Node = DevNode;

    fn open(&self, path: &Path) -> nix::Result<DevNode> {
        DevNode::open(path)
    }
}

fn errno_of(err: io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Socket failures all mean the host side is gone
fn relay_errno(err: io::Error) -> Errno {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => Errno::ENODEV,
        _ => errno_of(err),
    }
}
