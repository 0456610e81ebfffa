//! Per-connection shared state reached from the worker and both event loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{RdmaError, Result};
use crate::metrics::TransferMetrics;
use crate::rendezvous::{Rendezvous, Wake, WakeCause};
use crate::state::{ConnState, Role, StateCell};
use crate::verbs::{CmId, Handle};
use crate::wire::{BufferDescriptor, TransferMode, DESCRIPTOR_LEN};

/// Last buffer the peer advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteBuffer {
    /// Remote key.
    pub rkey: u32,
    /// Remote virtual address.
    pub addr: u64,
    /// Advertised length.
    pub len: u32,
}

/// State shared between a connection's worker, its CM loop and its CQ loop.
pub struct ConnContext {
    role: Role,
    state: StateCell,
    trans_mode: AtomicU8,
    remote: Mutex<RemoteBuffer>,
    rendezvous: Rendezvous,
    disconnected: AtomicBool,
    child: Mutex<Option<Arc<dyn CmId>>>,
    metrics: TransferMetrics,
}

impl std::fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnContext")
            .field("role", &self.role)
            .field("state", &self.state.load())
            .field("trans_mode", &self.trans_mode())
            .field("remote", &self.remote())
            .field("pending_wakes", &self.rendezvous.pending())
            .finish()
    }
}

impl ConnContext {
    /// New context in `initial` state running `mode`.
    pub fn new(role: Role, mode: TransferMode, initial: ConnState) -> Self {
        Self {
            role,
            state: StateCell::new(initial),
            trans_mode: AtomicU8::new(mode.as_u8()),
            remote: Mutex::new(RemoteBuffer::default()),
            rendezvous: Rendezvous::new(),
            disconnected: AtomicBool::new(false),
            child: Mutex::new(None),
            metrics: TransferMetrics::new(),
        }
    }

    /// Which side this context drives.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    /// The atomic state holder.
    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// Transfer mode handlers are dispatched on.
    pub fn trans_mode(&self) -> TransferMode {
        // only valid tags are ever stored
        TransferMode::from_u8(self.trans_mode.load(Ordering::SeqCst))
            .unwrap_or(TransferMode::PassiveWrite)
    }

    /// Override the transfer mode.
    pub fn set_trans_mode(&self, mode: TransferMode) {
        self.trans_mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    /// Last advertised remote buffer.
    pub fn remote(&self) -> RemoteBuffer {
        *self.remote.lock()
    }

    /// The rendezvous the worker blocks on.
    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    /// Counters for this connection.
    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    /// True once the peer disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Child identifier of the most recent connection request (server).
    pub fn child(&self) -> Option<Arc<dyn CmId>> {
        self.child.lock().clone()
    }

    pub(crate) fn set_child(&self, id: Arc<dyn CmId>) {
        *self.child.lock() = Some(id);
    }

    /// Move to `next` and wake the waiter for `cause`.
    pub fn transition(&self, next: ConnState, cause: WakeCause) {
        self.state.set(next);
        self.wake(cause);
    }

    /// Wake the waiter for `cause` without touching the state.
    pub fn wake(&self, cause: WakeCause) {
        let pending = self.rendezvous.pending();
        if pending > 0 {
            debug!(pending, ?cause, "rendezvous already holds unconsumed wakes");
        }
        self.rendezvous.post(Wake {
            cause,
            state: self.state.load(),
        });
    }

    /// Drive the connection to `ERROR` and wake any waiter.
    pub fn fail(&self) {
        self.state.fail();
        self.wake(WakeCause::Failed);
    }

    /// Record a peer disconnect and wake any waiter.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.wake(WakeCause::Disconnected);
    }

    /// Apply a received buffer descriptor of `byte_len` bytes.
    ///
    /// A payload of the wrong size leaves the remote fields untouched and is
    /// reported as an error. An unknown mode tag is logged and leaves the
    /// transfer mode as it was. Returns the state after the receive rule.
    pub fn handle_advert(&self, payload: &[u8], byte_len: u32) -> Result<ConnState> {
        if byte_len as usize != DESCRIPTOR_LEN {
            return Err(RdmaError::BadMessageSize {
                got: byte_len,
                expected: DESCRIPTOR_LEN as u32,
            });
        }
        let desc = BufferDescriptor::decode(&payload[..DESCRIPTOR_LEN.min(payload.len())])?;
        *self.remote.lock() = RemoteBuffer {
            rkey: desc.rkey,
            addr: desc.addr,
            len: desc.size,
        };
        match desc.wire_mode() {
            Some(tag) => self.set_trans_mode(tag.local_mode()),
            None => warn!(mode = desc.mode, "unrecognized transfer mode tag, ignoring"),
        }
        let next = self.state.on_receive(self.role);
        debug!(
            role = %self.role,
            rkey = format_args!("{:#x}", desc.rkey),
            addr = format_args!("{:#x}", desc.addr),
            len = desc.size,
            state = %next,
            "received rkey/addr/len from peer"
        );
        Ok(next)
    }

    /// Fail fast when the connection can no longer produce the wake a caller wants.
    pub fn ensure_live(&self, expected: ConnState) -> Result<()> {
        let found = self.state();
        if found == ConnState::Error {
            return Err(RdmaError::StateMismatch { expected, found });
        }
        if self.is_disconnected() {
            return Err(RdmaError::Disconnected { expected });
        }
        Ok(())
    }

    /// Block for the wake of `cause`. Fatal wakes are turned into errors.
    pub fn await_cause(&self, cause: WakeCause, expected: ConnState) -> Result<Wake> {
        self.ensure_live(expected)?;
        let wake = self.rendezvous.wait(cause);
        match wake.cause {
            WakeCause::Failed => Err(RdmaError::StateMismatch {
                expected,
                found: ConnState::Error,
            }),
            WakeCause::Disconnected => Err(RdmaError::Disconnected { expected }),
            _ => Ok(wake),
        }
    }

    /// Block for the wake of `cause` and require the connection to be in `expected`.
    pub fn await_state(&self, cause: WakeCause, expected: ConnState) -> Result<()> {
        self.await_cause(cause, expected)?;
        let found = self.state();
        if found != expected {
            return Err(RdmaError::StateMismatch { expected, found });
        }
        Ok(())
    }
}

/// Routes connection-manager events to the context owning the identifier.
///
/// A listener and every connection accepted from it share one map, since
/// the children's events arrive on the listener's channel.
#[derive(Debug, Clone, Default)]
pub struct ContextMap {
    inner: Arc<Mutex<HashMap<Handle, Weak<ConnContext>>>>,
}

impl ContextMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events for `handle` to `ctx`.
    pub fn register(&self, handle: Handle, ctx: &Arc<ConnContext>) {
        self.inner.lock().insert(handle, Arc::downgrade(ctx));
    }

    /// Stop routing events for `handle`.
    pub fn unregister(&self, handle: Handle) {
        self.inner.lock().remove(&handle);
    }

    /// Context registered for `handle`, if still alive.
    pub fn lookup(&self, handle: Handle) -> Option<Arc<ConnContext>> {
        self.inner.lock().get(&handle).and_then(Weak::upgrade)
    }

    /// Every live context.
    pub fn live(&self) -> Vec<Arc<ConnContext>> {
        self.inner
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of registered handles, live or not.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
