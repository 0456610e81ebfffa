//! Hand-off of incoming connection requests to the accept path.
//!
//! The connection-manager loop of a listener pushes one entry per
//! `CONNECT_REQUEST`; an accept loop pops them in arrival order. One queue
//! may be shared by several listeners. There is no bound on its depth.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::context::ContextMap;
use crate::verbs::{CmId, Handle};

/// A connection request waiting to be accepted.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    /// Child identifier created for the request.
    pub id: Arc<dyn CmId>,
    /// Listening identifier the request arrived on.
    pub listen_id: Handle,
    /// Event routing of the listener's channel.
    pub contexts: ContextMap,
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<PendingConnection>,
    closed: bool,
}

/// FIFO of connection requests, shared by listeners and acceptors.
#[derive(Debug, Clone, Default)]
pub struct PendingConnections {
    inner: Arc<(Mutex<Queue>, Condvar)>,
}

impl PendingConnections {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request and wake one blocked acceptor.
    pub fn push(&self, conn: PendingConnection) {
        let (lock, cond) = &*self.inner;
        let mut queue = lock.lock();
        debug!(id = conn.id.handle(), listen_id = conn.listen_id, depth = queue.items.len() + 1, "queued connection request");
        queue.items.push_back(conn);
        cond.notify_one();
    }

    /// Block for the next request. `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<PendingConnection> {
        let (lock, cond) = &*self.inner;
        let mut queue = lock.lock();
        loop {
            if let Some(conn) = queue.items.pop_front() {
                return Some(conn);
            }
            if queue.closed {
                return None;
            }
            cond.wait(&mut queue);
        }
    }

    /// Like [`PendingConnections::pop`] but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<PendingConnection> {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.inner;
        let mut queue = lock.lock();
        loop {
            if let Some(conn) = queue.items.pop_front() {
                return Some(conn);
            }
            if queue.closed || cond.wait_until(&mut queue, deadline).timed_out() {
                return queue.items.pop_front();
            }
        }
    }

    /// Take the next request if one is queued.
    pub fn try_pop(&self) -> Option<PendingConnection> {
        self.inner.0.lock().items.pop_front()
    }

    /// Requests currently queued.
    pub fn len(&self) -> usize {
        self.inner.0.lock().items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every acceptor; once drained, `pop` returns `None`.
    pub fn close(&self) {
        let (lock, cond) = &*self.inner;
        lock.lock().closed = true;
        cond.notify_all();
    }

    /// True after [`PendingConnections::close`].
    pub fn is_closed(&self) -> bool {
        self.inner.0.lock().closed
    }
}
