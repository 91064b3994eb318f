//! Device session lifecycle
//!
//! A [`Session`] owns one bound USB interface. Every holder (the attach-time
//! hold kept by the registry and one per open file) is a [`SessionRef`]; the
//! transport is torn down when the last one is released.
//!
//! Transfers are serialized by an I/O gate rather than by holding a mutex for
//! the whole transfer, so a blocked waiter can still be interrupted.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::{BridgeError, UsbTransport};
use tracing::{debug, info};

#[derive(Debug)]
struct IoState {
    busy: bool,
    bound: bool,
}

/// The I/O gate: a busy flag and the condition variable its waiters sleep on
#[derive(Debug)]
struct Gate {
    state: Mutex<IoState>,
    idle: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, IoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, state: MutexGuard<'a, IoState>) -> MutexGuard<'a, IoState> {
        self.idle.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every waiter so it rechecks the gate and its token
    fn wake(&self) {
        // taking the lock orders the wakeup after a waiter's token check
        drop(self.lock());
        self.idle.notify_all();
    }
}

/// One attached USB function device
pub struct Session {
    minor: u32,
    vendor_id: u16,
    product_id: u16,
    transport: Box<dyn UsbTransport>,
    gate: Arc<Gate>,
    timeout_ms: AtomicU32,
}

impl Session {
    /// Create a session with its attach-time hold
    pub fn attach(minor: u32, transport: Box<dyn UsbTransport>) -> SessionRef {
        let session = Session {
            minor,
            vendor_id: transport.vendor_id(),
            product_id: transport.product_id(),
            transport,
            gate: Arc::new(Gate {
                state: Mutex::new(IoState {
                    busy: false,
                    bound: true,
                }),
                idle: Condvar::new(),
            }),
            timeout_ms: AtomicU32::new(0),
        };
        info!(
            "Session {} attached ({:04x}:{:04x})",
            minor, session.vendor_id, session.product_id
        );
        SessionRef(Arc::new(session))
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Transfer timeout; zero means unbounded
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms.load(Ordering::SeqCst)))
    }

    /// Applies to transfers started afterwards
    pub fn set_timeout(&self, ms: u32) {
        debug!("Session {} timeout set to {} ms", self.minor, ms);
        self.timeout_ms.store(ms, Ordering::SeqCst);
    }

    pub fn is_bound(&self) -> bool {
        self.gate.lock().bound
    }

    /// Wait for exclusive use of the device
    ///
    /// Fails with `Interrupted` if the gate is busy and `interrupt` is raised
    /// before or during the wait, and with `NoDevice` once the interface is
    /// gone. Acquiring the gate consumes a raised token, so it never aborts a
    /// later call.
    pub fn begin_io(&self, interrupt: &Interrupt) -> Result<IoGuard<'_>, BridgeError> {
        let mut state = self.gate.lock();
        interrupt.arm(&self.gate);
        let result = loop {
            if !state.busy {
                interrupt.take();
                if !state.bound {
                    break Err(BridgeError::NoDevice);
                }
                state.busy = true;
                break Ok(IoGuard { session: self });
            }
            if interrupt.take() {
                debug!("Session {}: wait for device interrupted", self.minor);
                break Err(BridgeError::Interrupted);
            }
            state = self.gate.wait(state);
        };
        interrupt.disarm();
        result
    }

    /// Unbind the interface once no transfer is in flight
    ///
    /// Not interruptible. Transfers already past the gate finish first; every
    /// later `begin_io` fails with `NoDevice`.
    pub fn mark_disconnected(&self) {
        let mut state = self.gate.lock();
        while state.busy {
            state = self.gate.wait(state);
        }
        state.bound = false;
        drop(state);
        self.gate.idle.notify_all();
        info!("Session {} disconnected", self.minor);
    }

    fn end_io(&self) {
        self.gate.lock().busy = false;
        self.gate.idle.notify_all();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("minor", &self.minor)
            .field("vendor_id", &self.vendor_id)
            .field("product_id", &self.product_id)
            .field("timeout", &self.timeout())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("Session {} destroyed, releasing transport", self.minor);
    }
}

/// Exclusive access to a session's transport
///
/// Dropping the guard reopens the gate, on every path.
#[derive(Debug)]
pub struct IoGuard<'a> {
    session: &'a Session,
}

impl IoGuard<'_> {
    pub fn transport(&self) -> &dyn UsbTransport {
        self.session.transport.as_ref()
    }

    pub fn session(&self) -> &Session {
        self.session
    }
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.session.end_io();
    }
}

/// Counted hold on a session
#[derive(Debug)]
pub struct SessionRef(Arc<Session>);

impl SessionRef {
    /// Take another hold
    pub fn acquire(&self) -> SessionRef {
        SessionRef(Arc::clone(&self.0))
    }

    /// Give this hold back; the last release destroys the session
    pub fn release(self) {
        debug!(
            "Session {} released ({} holds left)",
            self.0.minor,
            Arc::strong_count(&self.0) - 1
        );
    }

    /// Number of live holds
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for SessionRef {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.0
    }
}

/// Per-handle interruption token
///
/// Raising it aborts the handle's blocked wait in [`Session::begin_io`], or
/// the next one if none is in progress. The token is consumed by the wait it
/// aborts and cleared whenever the gate is acquired.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<InterruptState>);

#[derive(Debug, Default)]
struct InterruptState {
    raised: AtomicBool,
    /// Gate of the wait in progress, if any
    waiting_on: Mutex<Option<Arc<Gate>>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::SeqCst);
        let gate = self.waiter().clone();
        if let Some(gate) = gate {
            gate.wake();
        }
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.raised.swap(false, Ordering::SeqCst)
    }

    fn arm(&self, gate: &Arc<Gate>) {
        *self.waiter() = Some(Arc::clone(gate));
    }

    fn disarm(&self) {
        *self.waiter() = None;
    }

    fn waiter(&self) -> MutexGuard<'_, Option<Arc<Gate>>> {
        self.0
            .waiting_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
