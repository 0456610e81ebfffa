//! Hand-off between the event loops and the worker blocked in a transfer.
//!
//! Every post is a [`Wake`] token tagged with the event that produced it.
//! A waiter names the cause it expects and consumes exactly one matching
//! token; tokens for other causes stay queued for the wait they belong to,
//! so a receive completion racing an `ESTABLISHED` event is never
//! attributed to the wrong waiter. Fatal tokens satisfy any wait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::state::ConnState;

/// Event that produced a wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeCause {
    /// Route resolution finished (client).
    RouteResolved,
    /// The connection manager reported `ESTABLISHED`.
    Established,
    /// A buffer descriptor was received.
    Advert,
    /// An RDMA read completed.
    ReadDone,
    /// An RDMA write completed.
    WriteDone,
    /// The peer disconnected.
    Disconnected,
    /// The connection entered `ERROR`.
    Failed,
}

impl WakeCause {
    /// Fatal causes end any wait regardless of what it expected.
    pub fn is_fatal(self) -> bool {
        matches!(self, WakeCause::Disconnected | WakeCause::Failed)
    }
}

/// One posted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    /// What produced the post.
    pub cause: WakeCause,
    /// Connection state right after the producer's transition.
    pub state: ConnState,
}

/// Rendezvous point of one connection.
#[derive(Debug, Default)]
pub struct Rendezvous {
    tokens: Mutex<VecDeque<Wake>>,
    cond: Condvar,
    posts: AtomicU64,
    consumed: AtomicU64,
}

impl Rendezvous {
    /// Create an empty rendezvous.
    pub fn new() -> Self {
        Self::default()
    }

    /// Post one wake-up.
    pub fn post(&self, wake: Wake) {
        let mut tokens = self.tokens.lock();
        tokens.push_back(wake);
        self.posts.fetch_add(1, Ordering::Relaxed);
        trace!(cause = ?wake.cause, state = %wake.state, pending = tokens.len(), "rendezvous post");
        drop(tokens);
        self.cond.notify_all();
    }

    /// Block until a token for `cause` (or a fatal token) is available and consume it.
    pub fn wait(&self, cause: WakeCause) -> Wake {
        let mut tokens = self.tokens.lock();
        loop {
            if let Some(wake) = Self::take(&mut tokens, cause) {
                self.consumed.fetch_add(1, Ordering::Relaxed);
                return wake;
            }
            self.cond.wait(&mut tokens);
        }
    }

    /// Like [`Rendezvous::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, cause: WakeCause, timeout: Duration) -> Option<Wake> {
        let deadline = Instant::now() + timeout;
        let mut tokens = self.tokens.lock();
        loop {
            if let Some(wake) = Self::take(&mut tokens, cause) {
                self.consumed.fetch_add(1, Ordering::Relaxed);
                return Some(wake);
            }
            if self.cond.wait_until(&mut tokens, deadline).timed_out() {
                let wake = Self::take(&mut tokens, cause);
                if wake.is_some() {
                    self.consumed.fetch_add(1, Ordering::Relaxed);
                }
                return wake;
            }
        }
    }

    /// Tokens posted but not yet consumed.
    pub fn pending(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Total tokens posted.
    pub fn posts(&self) -> u64 {
        self.posts.load(Ordering::Relaxed)
    }

    /// Total tokens consumed.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    fn take(tokens: &mut VecDeque<Wake>, cause: WakeCause) -> Option<Wake> {
        let pos = tokens
            .iter()
            .position(|w| w.cause == cause || w.cause.is_fatal())?;
        tokens.remove(pos)
    }
}
