//! Connection-manager event loop.
//!
//! One thread per event channel reads events, dispatches them to the
//! context registered for the event's identifier (or the listening
//! identifier it came from) and acknowledges them. Fatal events for the
//! channel's own identifier and device removal end the loop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::context::{ConnContext, ContextMap};
use crate::error::{RdmaError, Result};
use crate::pending::{PendingConnection, PendingConnections};
use crate::rendezvous::WakeCause;
use crate::state::{ConnState, Role};
use crate::verbs::{CmEvent, CmEventChannel, CmEventKind, Handle};

/// Connection-manager loop of one event channel.
pub struct CmLoop {
    channel: Arc<dyn CmEventChannel>,
    owner: Handle,
    contexts: ContextMap,
    pending: Option<PendingConnections>,
    route_timeout: Duration,
}

impl CmLoop {
    /// Loop for `channel`, whose primary identifier is `owner`.
    pub fn new(
        channel: Arc<dyn CmEventChannel>,
        owner: Handle,
        contexts: ContextMap,
        pending: Option<PendingConnections>,
        route_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            owner,
            contexts,
            pending,
            route_timeout,
        }
    }

    /// Start the loop on its own thread.
    pub fn spawn(self) -> Result<CmLoopHandle> {
        let channel = self.channel.clone();
        let thread = thread::Builder::new()
            .name("rdma-cm".to_string())
            .spawn(move || self.run())?;
        Ok(CmLoopHandle {
            channel,
            thread: Some(thread),
        })
    }

    /// Run until the channel is shut down or a fatal event arrives.
    pub fn run(self) -> Result<()> {
        while let Some(event) = self.channel.get_event()? {
            let res = self.dispatch(&event);
            self.channel.ack_event(&event);
            if let Err(e) = res {
                error!(error = %e, owner = self.owner, "cm loop terminating");
                return Err(e);
            }
        }
        debug!(owner = self.owner, "cm event channel closed");
        Ok(())
    }

    fn lookup(&self, event: &CmEvent) -> Option<Arc<ConnContext>> {
        self.contexts
            .lookup(event.id.handle())
            .or_else(|| event.listen_id.and_then(|h| self.contexts.lookup(h)))
    }

    /// Apply one event. An error means the loop must stop.
    pub fn dispatch(&self, event: &CmEvent) -> Result<()> {
        debug!(event = %event.kind, id = event.id.handle(), status = event.status, "cma event");

        if event.kind == CmEventKind::DeviceRemoval {
            error!(event = %event.kind, "cma detected device removal");
            for ctx in self.contexts.live() {
                ctx.fail();
            }
            return Err(RdmaError::DeviceRemoved);
        }

        let Some(ctx) = self.lookup(event) else {
            warn!(event = %event.kind, id = event.id.handle(), "event for unknown cm id");
            return Ok(());
        };
        ctx.metrics().inc_cm_events();

        match event.kind {
            CmEventKind::AddrResolved => {
                ctx.state_cell().set(ConnState::AddrResolved);
                if let Err(e) = event.id.resolve_route(self.route_timeout) {
                    error!(error = %e, "rdma_resolve_route");
                    ctx.fail();
                }
            }
            CmEventKind::RouteResolved => {
                ctx.transition(ConnState::RouteResolved, WakeCause::RouteResolved);
            }
            CmEventKind::ConnectRequest => {
                ctx.state_cell().set(ConnState::ConnectRequest);
                debug!(child = event.id.handle(), "child cma id");
                match &self.pending {
                    Some(pending) => pending.push(PendingConnection {
                        id: event.id.clone(),
                        listen_id: event.listen_id.unwrap_or(self.owner),
                        contexts: self.contexts.clone(),
                    }),
                    None => warn!(child = event.id.handle(), "connect request on a channel without an accept queue"),
                }
                ctx.set_child(event.id.clone());
            }
            CmEventKind::Established => {
                debug!(role = %ctx.role(), "established");
                if ctx.role() == Role::Client {
                    ctx.state_cell().set(ConnState::Connected);
                }
                ctx.wake(WakeCause::Established);
            }
            CmEventKind::AddrError
            | CmEventKind::RouteError
            | CmEventKind::ConnectError
            | CmEventKind::Unreachable
            | CmEventKind::Rejected => {
                error!(event = %event.kind, status = event.status, "cma event error");
                ctx.fail();
                if event.id.handle() == self.owner {
                    return Err(RdmaError::CmEvent {
                        event: event.kind,
                        status: event.status,
                    });
                }
            }
            CmEventKind::Disconnected => {
                warn!(id = event.id.handle(), "disconnect");
                ctx.mark_disconnected();
            }
            other => {
                warn!(event = %other, "unhandled event");
            }
        }
        Ok(())
    }
}

/// Running connection-manager loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct CmLoopHandle {
    channel: Arc<dyn CmEventChannel>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl CmLoopHandle {
    /// Shut the channel down, wait for the thread and return how the loop ended.
    pub fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.channel.shutdown();
        Self::join(thread)
    }

    /// Outcome of a loop that ended on its own, e.g. `DeviceRemoved`.
    ///
    /// `None` while the loop runs, after [`CmLoopHandle::stop`], or once
    /// the outcome was collected.
    pub fn try_exit(&mut self) -> Option<Result<()>> {
        if !self.thread.as_ref()?.is_finished() {
            return None;
        }
        self.thread.take().map(Self::join)
    }

    /// True while the loop thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn join(thread: JoinHandle<Result<()>>) -> Result<()> {
        match thread.join() {
            Ok(res) => {
                if res.is_ok() {
                    debug!("cm loop stopped");
                }
                res
            }
            Err(_) => {
                error!("cm loop panicked");
                Err(RdmaError::resource("rdma-cm", "event loop panicked"))
            }
        }
    }
}

impl Drop for CmLoopHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            info!(error = %e, "cm loop had terminated");
        }
    }
}
