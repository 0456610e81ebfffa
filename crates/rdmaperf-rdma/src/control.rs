//! Per-connection control block.
//!
//! [`ConnectionControl`] owns everything one connection acquires: the
//! connection-manager channel and identifier, the queue pair resources,
//! the registered buffers and both event loops. The application drives it
//! through setup, connect or accept, any number of transfers and teardown.
//!
//! A client runs its own connection-manager loop. A listening server runs
//! one loop for the listener; each accepted connection gets its own
//! control block bound to the child identifier, whose events keep arriving
//! on the listener's channel and are routed through the shared
//! [`ContextMap`].

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cm_loop::{CmLoop, CmLoopHandle};
use crate::config::RdmaConfig;
use crate::context::{ConnContext, ContextMap};
use crate::cq_loop::{CqLoop, CqLoopHandle};
use crate::echo::DataEcho;
use crate::error::{RdmaError, Result};
use crate::pending::{PendingConnection, PendingConnections};
use crate::rendezvous::WakeCause;
use crate::resources::{BufferSet, QpResources, WorkRequests};
use crate::state::{ConnState, Role};
use crate::verbs::{CmEventChannel, CmId, QueuePair, RdmaProvider};

/// Borrowed view of what the transfer handlers post on.
pub(crate) struct DataPath<'a> {
    pub qp: &'a Arc<dyn QueuePair>,
    pub bufs: &'a BufferSet,
    pub wrs: WorkRequests,
}

/// Control block of one RDMA connection.
pub struct ConnectionControl {
    config: RdmaConfig,
    provider: Arc<dyn RdmaProvider>,
    ctx: Arc<ConnContext>,
    contexts: ContextMap,
    pending: Option<PendingConnections>,
    pub(crate) echo: DataEcho,
    cq_loop: Option<CqLoopHandle>,
    wrs: Option<WorkRequests>,
    buffers: Option<BufferSet>,
    qp: Option<QpResources>,
    cm_loop: Option<CmLoopHandle>,
    child: Option<Arc<dyn CmId>>,
    id: Option<Arc<dyn CmId>>,
    channel: Option<Arc<dyn CmEventChannel>>,
}

impl std::fmt::Debug for ConnectionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionControl")
            .field("ctx", &self.ctx)
            .field("id", &self.id.as_ref().map(|id| id.handle()))
            .field("child", &self.child.as_ref().map(|id| id.handle()))
            .field("has_qp", &self.qp.is_some())
            .field("has_buffers", &self.buffers.is_some())
            .finish()
    }
}

impl ConnectionControl {
    fn new(
        role: Role,
        initial: ConnState,
        config: RdmaConfig,
        provider: Arc<dyn RdmaProvider>,
        pending: Option<PendingConnections>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(ConnContext::new(role, config.mode, initial));
        let echo = DataEcho::new(config.verbose, config.output_file.clone());
        Ok(Self {
            config,
            provider,
            ctx,
            contexts: ContextMap::new(),
            pending,
            echo,
            cq_loop: None,
            wrs: None,
            buffers: None,
            qp: None,
            cm_loop: None,
            child: None,
            id: None,
            channel: None,
        })
    }

    /// Control block for the active side.
    pub fn client(config: RdmaConfig, provider: Arc<dyn RdmaProvider>) -> Result<Self> {
        Self::new(Role::Client, ConnState::Init, config, provider, None)
    }

    /// Control block for a listener. Connection requests are queued on `pending`.
    pub fn server(
        config: RdmaConfig,
        provider: Arc<dyn RdmaProvider>,
        pending: PendingConnections,
    ) -> Result<Self> {
        Self::new(Role::Server, ConnState::Init, config, provider, Some(pending))
    }

    /// Control block for a connection request taken off the pending queue.
    pub fn accepted(
        conn: PendingConnection,
        config: RdmaConfig,
        provider: Arc<dyn RdmaProvider>,
    ) -> Result<Self> {
        let mut control = Self::new(
            Role::Server,
            ConnState::ConnectRequest,
            config,
            provider,
            None,
        )?;
        conn.contexts.register(conn.id.handle(), &control.ctx);
        control.ctx.set_child(conn.id.clone());
        debug!(child = conn.id.handle(), listen_id = conn.listen_id, "bound control block to child id");
        control.contexts = conn.contexts;
        control.child = Some(conn.id);
        Ok(control)
    }

    /// Create the event channel and identifier and start the connection-manager loop.
    ///
    /// Accepted connections share the listener's channel and loop, so this is a no-op for them.
    pub fn setup(&mut self) -> Result<()> {
        if self.child.is_some() && self.id.is_none() {
            debug!("accepted connection uses the listener's event channel");
            return Ok(());
        }
        if self.channel.is_some() {
            return Ok(());
        }
        let channel = self.provider.create_event_channel()?;
        let id = channel.create_id()?;
        debug!(channel = channel.handle(), id = id.handle(), role = %self.ctx.role(), "created cm id");
        self.contexts.register(id.handle(), &self.ctx);

        let cm = CmLoop::new(
            channel.clone(),
            id.handle(),
            self.contexts.clone(),
            self.pending.clone(),
            self.config.resolve_timeout(),
        );
        self.cm_loop = Some(cm.spawn()?);
        self.id = Some(id);
        self.channel = Some(channel);
        Ok(())
    }

    fn primary_id(&self) -> Result<&Arc<dyn CmId>> {
        self.id.as_ref().ok_or(RdmaError::NotReady("setup not called"))
    }

    /// Identifier the queue pair is bound to: the primary one for a client,
    /// the child for an accepted connection.
    fn conn_id(&self) -> Result<&Arc<dyn CmId>> {
        match self.ctx.role() {
            Role::Client => self.primary_id(),
            Role::Server => self
                .child
                .as_ref()
                .ok_or(RdmaError::NotReady("no accepted connection request")),
        }
    }

    /// Bind the listener to `addr` (server).
    pub fn listen(&self, addr: SocketAddr) -> Result<()> {
        let id = self.primary_id()?;
        id.listen(addr, self.config.listen_backlog)?;
        info!(%addr, backlog = self.config.listen_backlog, "listening");
        Ok(())
    }

    /// Resolve address and route to `dst` (client). Blocks until the route is resolved.
    pub fn resolve(&self, dst: SocketAddr) -> Result<()> {
        let id = self.primary_id()?;
        id.resolve_addr(dst, self.config.resolve_timeout())?;
        self.ctx
            .await_state(WakeCause::RouteResolved, ConnState::RouteResolved)?;
        debug!(%dst, "route resolved");
        Ok(())
    }

    /// Allocate protection domain, completion channel, completion queue and queue pair.
    pub fn setup_qp(&mut self) -> Result<()> {
        if self.qp.is_some() {
            return Ok(());
        }
        let res = QpResources::create(self.conn_id()?, &self.config)?;
        self.qp = Some(res);
        Ok(())
    }

    /// Register the buffers, prime the receive queue and start the completion loop.
    pub fn setup_buffers(&mut self) -> Result<()> {
        if self.buffers.is_some() {
            return Ok(());
        }
        let res = self
            .qp
            .as_ref()
            .ok_or(RdmaError::NotReady("queue pair not set up"))?;
        let bufs = BufferSet::register(&res.pd, self.ctx.role(), self.config.size)?;
        let wrs = WorkRequests::new(&bufs);
        res.qp.post_recv(&wrs.recv())?;

        let cq = CqLoop::new(
            self.ctx.clone(),
            res.channel.clone(),
            res.cq.clone(),
            res.qp.clone(),
            bufs.recv.clone(),
            wrs,
        );
        self.cq_loop = Some(cq.spawn()?);
        self.wrs = Some(wrs);
        self.buffers = Some(bufs);
        Ok(())
    }

    /// Connect to the resolved destination (client). Blocks until established or failed.
    pub fn connect(&self) -> Result<()> {
        let id = self.primary_id()?;
        id.connect(&self.config.conn_params())?;
        self.ctx
            .await_state(WakeCause::Established, ConnState::Connected)?;
        info!(id = id.handle(), "rdma connection established");
        Ok(())
    }

    /// Accept the bound connection request (server). Blocks until established or failed.
    ///
    /// The server's state is left to the first receive completion; only the
    /// established wake-up is awaited here.
    pub fn accept(&self) -> Result<()> {
        let child = self.conn_id()?;
        child.accept(&self.config.conn_params())?;
        self.ctx
            .await_cause(WakeCause::Established, ConnState::Connected)?;
        info!(child = child.handle(), "accepted rdma connection");
        Ok(())
    }

    /// Disconnect from the peer.
    pub fn disconnect(&self) -> Result<()> {
        match (&self.child, &self.id) {
            (Some(id), _) | (None, Some(id)) => id.disconnect(),
            (None, None) => Ok(()),
        }
    }

    /// Stop the completion loop and deregister every buffer, newest first.
    pub fn free_buffers(&mut self) {
        if let Some(mut cq) = self.cq_loop.take() {
            cq.stop();
        }
        self.wrs = None;
        if self.buffers.take().is_some() {
            debug!("freed buffers");
        }
    }

    /// Destroy queue pair, completion queue, completion channel and protection domain.
    pub fn free_qp(&mut self) {
        if self.cq_loop.is_some() {
            warn!("freeing queue pair with buffers still registered");
            self.free_buffers();
        }
        if self.qp.take().is_some() {
            debug!("destroyed qp");
        }
    }

    /// Tear everything down in reverse acquisition order. Safe to call repeatedly.
    ///
    /// The pending-connection queue is left alone; it belongs to the application.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.disconnect() {
            debug!(error = %e, "disconnect during shutdown");
        }
        self.free_buffers();
        self.free_qp();
        if let Some(mut cm) = self.cm_loop.take() {
            if let Err(e) = cm.stop() {
                warn!(error = %e, "connection manager loop had terminated");
            }
        }
        if let Some(child) = self.child.take() {
            self.contexts.unregister(child.handle());
        }
        if let Some(id) = self.id.take() {
            self.contexts.unregister(id.handle());
        }
        self.channel = None;
    }

    /// How this block's connection-manager loop ended, once it ended on
    /// its own (device removal, a fatal event for the primary identifier).
    ///
    /// `None` while it runs, for accepted connections (they share the
    /// listener's loop) and once the outcome was collected.
    pub fn cm_loop_exit(&mut self) -> Option<Result<()>> {
        self.cm_loop.as_mut()?.try_exit()
    }

    /// Shared per-connection state.
    pub fn ctx(&self) -> &Arc<ConnContext> {
        &self.ctx
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnState {
        self.ctx.state()
    }

    /// Which side this block drives.
    pub fn role(&self) -> Role {
        self.ctx.role()
    }

    /// Configuration the block was created with.
    pub fn config(&self) -> &RdmaConfig {
        &self.config
    }

    /// Registered buffers, once [`ConnectionControl::setup_buffers`] ran.
    pub fn buffers(&self) -> Option<&BufferSet> {
        self.buffers.as_ref()
    }

    /// Event routing shared with accepted connections.
    pub fn contexts(&self) -> &ContextMap {
        &self.contexts
    }

    pub(crate) fn data_path(&self) -> Result<DataPath<'_>> {
        let res = self
            .qp
            .as_ref()
            .ok_or(RdmaError::NotReady("queue pair not set up"))?;
        let bufs = self
            .buffers
            .as_ref()
            .ok_or(RdmaError::NotReady("buffers not registered"))?;
        let wrs = self
            .wrs
            .ok_or(RdmaError::NotReady("buffers not registered"))?;
        Ok(DataPath {
            qp: &res.qp,
            bufs,
            wrs,
        })
    }
}

impl Drop for ConnectionControl {
    fn drop(&mut self) {
        self.shutdown();
    }
}
