//! Device-file channel abstraction
//!
//! The client facade only ever talks to the driver through these three calls.
//! Errors follow the POSIX convention: a call either succeeds with a
//! non-negative count or fails with an errno.

use nix::errno::Errno;
use std::path::{Path, PathBuf};

/// An open device file
pub trait Channel {
    /// Raw bulk IN; returns bytes received
    fn read(&mut self, buf: &mut [u8]) -> nix::Result<usize>;

    /// Raw bulk OUT; returns bytes sent
    fn write(&mut self, buf: &[u8]) -> nix::Result<usize>;

    /// Structured command; `arg` is the opcode's fixed-size packet
    fn ioctl(&mut self, request: u32, arg: &mut [u8]) -> nix::Result<i32>;
}

/// Opens device nodes by path
pub trait NodeOpener {
    type Node: Channel;

    fn open(&self, path: &Path) -> nix::Result<Self::Node>;
}

/// Path of device node `index`
pub fn node_path(prefix: &str, index: u32) -> PathBuf {
    PathBuf::from(format!("{}{}", prefix, index))
}

/// Inverse of [`node_path`]
pub fn node_index(prefix: &str, path: &Path) -> Option<u32> {
    path.to_str()?.strip_prefix(prefix)?.parse().ok()
}

/// Collapse a channel result into the numeric return convention
///
/// Success is the non-negative count, failure the negated errno.
pub fn raw_return(result: nix::Result<i32>) -> i32 {
    match result {
        Ok(value) => value,
        Err(errno) => -(errno as i32),
    }
}

/// Inverse of [`raw_return`]
pub fn from_raw_return(value: i32) -> nix::Result<i32> {
    if value < 0 {
        Err(Errno::from_raw(-value))
    } else {
        Ok(value)
    }
}
