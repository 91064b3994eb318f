//! Table of attached sessions, keyed by minor number

use std::sync::{Mutex, MutexGuard, PoisonError};

use common::{BridgeError, UsbTransport};
use tracing::{debug, info, warn};

use crate::session::{Session, SessionRef};

/// Default number of device nodes
pub const DEFAULT_MAX_MINORS: usize = 16;

/// Attached sessions, each held by the registry until disconnect
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: Mutex<Vec<Option<SessionRef>>>,
}

impl DeviceRegistry {
    pub fn new(max_minors: usize) -> Self {
        Self {
            slots: Mutex::new((0..max_minors).map(|_| None).collect()),
        }
    }

    /// Bind a transport to the lowest free minor
    ///
    /// Fails with `OutOfMemory` when every minor is taken.
    pub fn attach(&self, transport: Box<dyn UsbTransport>) -> Result<u32, BridgeError> {
        let mut slots = self.lock();
        let Some(index) = slots.iter().position(Option::is_none) else {
            warn!(
                "No free minor for {:04x}:{:04x}",
                transport.vendor_id(),
                transport.product_id()
            );
            return Err(BridgeError::OutOfMemory);
        };
        let minor = index as u32;
        slots[index] = Some(Session::attach(minor, transport));
        Ok(minor)
    }

    /// New hold on the session at `minor`, if attached
    pub fn lookup(&self, minor: u32) -> Option<SessionRef> {
        self.lock()
            .get(minor as usize)
            .and_then(Option::as_ref)
            .map(SessionRef::acquire)
    }

    /// Hold for a newly opened file
    ///
    /// Every open starts with an unbounded transfer timeout.
    pub fn open(&self, minor: u32) -> Result<SessionRef, BridgeError> {
        let session = self.lookup(minor).ok_or(BridgeError::NoDevice)?;
        session.set_timeout(0);
        debug!("Opened minor {} ({} holds)", minor, session.ref_count());
        Ok(session)
    }

    /// Detach the session at `minor`
    ///
    /// Waits for an in-flight transfer, unbinds the interface, then drops the
    /// attach-time hold. Open files keep the session alive but see `NoDevice`.
    pub fn disconnect(&self, minor: u32) -> Result<(), BridgeError> {
        let session = self
            .lock()
            .get_mut(minor as usize)
            .and_then(Option::take)
            .ok_or(BridgeError::NoDevice)?;
        session.mark_disconnected();
        session.release();
        Ok(())
    }

    /// Minors currently attached, ascending
    pub fn minors(&self) -> Vec<u32> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Disconnect every session
    pub fn shutdown(&self) {
        let minors = self.minors();
        for minor in &minors {
            let _ = self.disconnect(*minor);
        }
        info!("Registry shut down ({} sessions disconnected)", minors.len());
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<SessionRef>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MINORS)
    }
}
