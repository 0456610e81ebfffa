//! Software RDMA fabric for running the transport without hardware.
//!
//! Every object of [`crate::verbs`] is implemented in-process: identifiers
//! rendezvous through address-keyed listeners, sends land in the peer's
//! posted receives, and RDMA reads and writes copy between registered
//! regions after checking the remote key, access rights and bounds. The
//! fabric keeps an ordered journal of resource acquisition and release,
//! a record of every RDMA operation, and a fault plan for exercising
//! setup failures.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{RdmaError, Result};
use crate::verbs::{
    AccessFlags, CmEvent, CmEventChannel, CmEventKind, CmId, CompChannel, CompletionQueue,
    ConnParams, Device, Handle, MemoryRegion, ProtectionDomain, QpCap, QpInitAttr, QueuePair,
    RdmaProvider, RecvWr, SendOp, SendWr, WcOpcode, WcStatus, WorkCompletion,
};

const DEVICE_NAME: &str = "sim0";
const BASE_ADDR: u64 = 0x7f00_0000_0000;
const PAGE: u64 = 4096;

/// Status carried by `REJECTED` when nothing listens on the destination.
pub const REJECT_NO_LISTENER: i32 = 8;

/// Kind of verbs object recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Protection domain.
    Pd,
    /// Completion channel.
    CompChannel,
    /// Completion queue.
    Cq,
    /// Queue pair.
    Qp,
    /// Memory region, keyed by its rkey.
    Mr,
}

/// One journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceEvent {
    /// Object created.
    Acquired(ResourceKind, Handle),
    /// Object destroyed.
    Released(ResourceKind, Handle),
}

/// Direction of a recorded RDMA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RdmaOpKind {
    /// RDMA read.
    Read,
    /// RDMA write.
    Write,
}

/// One RDMA read or write as posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaOpRecord {
    /// Posting queue pair.
    pub qp_num: u32,
    /// Direction.
    pub op: RdmaOpKind,
    /// Remote address targeted.
    pub remote_addr: u64,
    /// Remote key presented.
    pub rkey: u32,
    /// Bytes requested.
    pub length: u32,
    /// Completion status it produced.
    pub status: WcStatus,
}

/// Failures to inject into resource creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// `alloc_pd` fails.
    pub fail_alloc_pd: bool,
    /// `create_comp_channel` fails.
    pub fail_comp_channel: bool,
    /// `create_cq` fails.
    pub fail_create_cq: bool,
    /// `create_qp` fails.
    pub fail_create_qp: bool,
    /// The n-th `reg_mr` (zero based, counted from when the plan was set) fails.
    pub fail_reg_mr_at: Option<usize>,
}

/// Snapshot of fabric-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Connect calls that reached a listener.
    pub connects: u64,
    /// Connect calls rejected.
    pub rejects: u64,
    /// Two-sided sends posted.
    pub sends: u64,
    /// Receives completed with data.
    pub recvs: u64,
    /// RDMA reads posted.
    pub rdma_reads: u64,
    /// RDMA writes posted.
    pub rdma_writes: u64,
    /// Receives flushed by a disconnect.
    pub flushed: u64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    rejects: AtomicU64,
    sends: AtomicU64,
    recvs: AtomicU64,
    rdma_reads: AtomicU64,
    rdma_writes: AtomicU64,
    flushed: AtomicU64,
}

struct RegionBuf {
    addr: u64,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
    data: Mutex<Vec<u8>>,
}

impl RegionBuf {
    fn offset(&self, addr: u64, len: usize) -> Option<usize> {
        let offset = usize::try_from(addr.checked_sub(self.addr)?).ok()?;
        let end = offset.checked_add(len)?;
        (end <= self.data.lock().len()).then_some(offset)
    }

    fn read_at(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let offset = self.offset(addr, len)?;
        Some(self.data.lock()[offset..offset + len].to_vec())
    }

    fn write_at(&self, addr: u64, bytes: &[u8]) -> bool {
        match self.offset(addr, bytes.len()) {
            Some(offset) => {
                self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct RegionTable {
    by_lkey: HashMap<u32, Arc<RegionBuf>>,
    by_rkey: HashMap<u32, Arc<RegionBuf>>,
}

struct FabricInner {
    next_handle: AtomicU64,
    next_key: AtomicU32,
    next_addr: AtomicU64,
    listeners: Mutex<HashMap<SocketAddr, Weak<SimCmId>>>,
    ids: Mutex<HashMap<Handle, Weak<SimCmId>>>,
    pds: Mutex<HashMap<Handle, Weak<SimPd>>>,
    channels: Mutex<HashMap<Handle, Weak<SimCompChannel>>>,
    cqs: Mutex<HashMap<Handle, Weak<SimCq>>>,
    regions: Mutex<RegionTable>,
    journal: Mutex<Vec<ResourceEvent>>,
    rdma_ops: Mutex<Vec<RdmaOpRecord>>,
    faults: Mutex<FaultPlan>,
    mr_attempts: AtomicUsize,
    counters: Counters,
}

impl FabricInner {
    fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            next_key: AtomicU32::new(1),
            next_addr: AtomicU64::new(BASE_ADDR),
            listeners: Mutex::new(HashMap::new()),
            ids: Mutex::new(HashMap::new()),
            pds: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            cqs: Mutex::new(HashMap::new()),
            regions: Mutex::new(RegionTable::default()),
            journal: Mutex::new(Vec::new()),
            rdma_ops: Mutex::new(Vec::new()),
            faults: Mutex::new(FaultPlan::default()),
            mr_attempts: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    fn handle(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, event: ResourceEvent) {
        trace!(?event, "sim resource");
        self.journal.lock().push(event);
    }

    fn faults(&self) -> FaultPlan {
        self.faults.lock().clone()
    }

    fn region_by_lkey(&self, lkey: u32) -> Option<Arc<RegionBuf>> {
        self.regions.lock().by_lkey.get(&lkey).cloned()
    }

    fn region_by_rkey(&self, rkey: u32) -> Option<Arc<RegionBuf>> {
        self.regions.lock().by_rkey.get(&rkey).cloned()
    }

    fn find_listener(&self, dst: SocketAddr) -> Option<Arc<SimCmId>> {
        let listeners = self.listeners.lock();
        if let Some(id) = listeners.get(&dst).and_then(Weak::upgrade) {
            return Some(id);
        }
        listeners
            .iter()
            .filter(|(addr, _)| addr.ip().is_unspecified() && addr.port() == dst.port())
            .find_map(|(_, id)| id.upgrade())
    }

    fn pd(&self, handle: Handle) -> Option<Arc<SimPd>> {
        self.pds.lock().get(&handle).and_then(Weak::upgrade)
    }

    fn channel(&self, handle: Handle) -> Option<Arc<SimCompChannel>> {
        self.channels.lock().get(&handle).and_then(Weak::upgrade)
    }

    fn cq(&self, handle: Handle) -> Option<Arc<SimCq>> {
        self.cqs.lock().get(&handle).and_then(Weak::upgrade)
    }
}

/// In-process RDMA fabric. Cloning shares the fabric.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<FabricInner>,
}

impl SimFabric {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner::new()),
        }
    }

    /// Journal of resource acquisition and release, oldest first.
    pub fn journal(&self) -> Vec<ResourceEvent> {
        self.inner.journal.lock().clone()
    }

    /// Every RDMA read and write posted, oldest first.
    pub fn rdma_ops(&self) -> Vec<RdmaOpRecord> {
        self.inner.rdma_ops.lock().clone()
    }

    /// Install a fault plan and restart the registration count.
    pub fn set_faults(&self, plan: FaultPlan) {
        *self.inner.faults.lock() = plan;
        self.inner.mr_attempts.store(0, Ordering::SeqCst);
    }

    /// Contents of the live region with `rkey`.
    pub fn region_bytes(&self, rkey: u32) -> Option<Vec<u8>> {
        self.inner
            .region_by_rkey(rkey)
            .map(|r| r.data.lock().clone())
    }

    /// Number of memory regions currently registered.
    pub fn live_regions(&self) -> usize {
        self.inner.regions.lock().by_rkey.len()
    }

    /// Pull the device out from under every live identifier: each one
    /// gets `DEVICE_REMOVAL` on its channel.
    pub fn remove_device(&self) {
        let ids: Vec<Arc<SimCmId>> = self
            .inner
            .ids
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        debug!(ids = ids.len(), "removing device");
        for id in ids {
            id.emit(CmEventKind::DeviceRemoval, None, 0);
        }
    }

    /// Fabric-wide counters.
    pub fn stats(&self) -> FabricStats {
        let c = &self.inner.counters;
        FabricStats {
            connects: c.connects.load(Ordering::Relaxed),
            rejects: c.rejects.load(Ordering::Relaxed),
            sends: c.sends.load(Ordering::Relaxed),
            recvs: c.recvs.load(Ordering::Relaxed),
            rdma_reads: c.rdma_reads.load(Ordering::Relaxed),
            rdma_writes: c.rdma_writes.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
        }
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimFabric")
            .field("regions", &self.live_regions())
            .field("stats", &self.stats())
            .finish()
    }
}

impl RdmaProvider for SimFabric {
    fn create_event_channel(&self) -> Result<Arc<dyn CmEventChannel>> {
        let handle = self.inner.handle();
        let channel = Arc::new_cyclic(|me| SimEventChannel {
            handle,
            fabric: self.inner.clone(),
            me: me.clone(),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        debug!(channel = handle, "created cm event channel");
        Ok(channel)
    }
}

/// Connection-manager event channel of the simulated fabric.
pub struct SimEventChannel {
    handle: Handle,
    fabric: Arc<FabricInner>,
    me: Weak<SimEventChannel>,
    queue: Mutex<VecDeque<CmEvent>>,
    cond: Condvar,
    closed: AtomicBool,
}

impl SimEventChannel {
    fn push(&self, event: CmEvent) {
        let mut queue = self.queue.lock();
        if self.closed.load(Ordering::SeqCst) {
            trace!(channel = self.handle, kind = %event.kind, "dropping event for closed channel");
            return;
        }
        trace!(channel = self.handle, kind = %event.kind, id = event.id.handle(), "queued cm event");
        queue.push_back(event);
        self.cond.notify_all();
    }
}

impl fmt::Debug for SimEventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEventChannel")
            .field("handle", &self.handle)
            .finish()
    }
}

impl CmEventChannel for SimEventChannel {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn create_id(&self) -> Result<Arc<dyn CmId>> {
        Ok(SimCmId::new(self.fabric.clone(), self.me.clone()))
    }

    fn get_event(&self) -> Result<Option<CmEvent>> {
        let mut queue = self.queue.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(event) = queue.pop_front() {
                return Ok(Some(event));
            }
            self.cond.wait(&mut queue);
        }
    }

    fn ack_event(&self, event: &CmEvent) {
        trace!(channel = self.handle, kind = %event.kind, "acked cm event");
    }

    fn shutdown(&self) {
        let _queue = self.queue.lock();
        self.closed.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct IdState {
    dst: Option<SocketAddr>,
    route_resolved: bool,
    bound: Option<SocketAddr>,
    peer: Option<Weak<SimCmId>>,
    qp: Option<Weak<SimQp>>,
    connected: bool,
}

/// Connection-manager identifier of the simulated fabric.
pub struct SimCmId {
    handle: Handle,
    fabric: Arc<FabricInner>,
    channel: Weak<SimEventChannel>,
    me: Weak<SimCmId>,
    state: Mutex<IdState>,
}

impl SimCmId {
    fn new(fabric: Arc<FabricInner>, channel: Weak<SimEventChannel>) -> Arc<Self> {
        let handle = fabric.handle();
        let id = Arc::new_cyclic(|me| SimCmId {
            handle,
            fabric,
            channel,
            me: me.clone(),
            state: Mutex::new(IdState::default()),
        });
        id.fabric.ids.lock().insert(handle, Arc::downgrade(&id));
        id
    }

    fn emit(&self, kind: CmEventKind, listen_id: Option<Handle>, status: i32) {
        if let (Some(channel), Some(me)) = (self.channel.upgrade(), self.me.upgrade()) {
            channel.push(CmEvent {
                kind,
                id: me,
                listen_id,
                status,
            });
        }
    }

    fn qp(&self) -> Option<Arc<SimQp>> {
        self.state.lock().qp.as_ref().and_then(Weak::upgrade)
    }

    /// Mark this side down and flush its queue pair. Returns false if it already was.
    fn drop_connection(&self) -> bool {
        let was_connected = std::mem::replace(&mut self.state.lock().connected, false);
        if was_connected {
            if let Some(qp) = self.qp() {
                qp.unlink_and_flush();
            }
            self.emit(CmEventKind::Disconnected, None, 0);
        }
        was_connected
    }
}

impl fmt::Debug for SimCmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCmId").field("handle", &self.handle).finish()
    }
}

impl Drop for SimCmId {
    fn drop(&mut self) {
        self.fabric.ids.lock().remove(&self.handle);
        if let Some(addr) = self.state.get_mut().bound {
            let mut listeners = self.fabric.listeners.lock();
            if listeners.get(&addr).map_or(false, |w| w.upgrade().is_none()) {
                listeners.remove(&addr);
            }
        }
    }
}

impl CmId for SimCmId {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn resolve_addr(&self, dst: SocketAddr, _timeout: Duration) -> Result<()> {
        if dst.ip().is_unspecified() || dst.port() == 0 {
            self.emit(CmEventKind::AddrError, None, -libc::EADDRNOTAVAIL);
            return Ok(());
        }
        self.state.lock().dst = Some(dst);
        self.emit(CmEventKind::AddrResolved, None, 0);
        Ok(())
    }

    fn resolve_route(&self, _timeout: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.dst.is_none() {
                return Err(RdmaError::NotReady("address not resolved"));
            }
            state.route_resolved = true;
        }
        self.emit(CmEventKind::RouteResolved, None, 0);
        Ok(())
    }

    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<()> {
        let me = self.me.clone();
        {
            let mut listeners = self.fabric.listeners.lock();
            if listeners.get(&addr).and_then(Weak::upgrade).is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{addr} already has a listener"),
                )
                .into());
            }
            listeners.insert(addr, me);
        }
        self.state.lock().bound = Some(addr);
        debug!(id = self.handle, %addr, backlog, "sim listener bound");
        Ok(())
    }

    fn connect(&self, _params: &ConnParams) -> Result<()> {
        let dst = {
            let state = self.state.lock();
            if !state.route_resolved {
                return Err(RdmaError::NotReady("route not resolved"));
            }
            if state.qp.is_none() {
                return Err(RdmaError::NotReady("queue pair not created"));
            }
            state.dst.ok_or(RdmaError::NotReady("address not resolved"))?
        };

        let listener = self.fabric.find_listener(dst);
        let channel = listener.as_ref().and_then(|l| l.channel.upgrade());
        let (listener, channel) = match (listener, channel) {
            (Some(l), Some(c)) => (l, c),
            _ => {
                self.fabric.counters.rejects.fetch_add(1, Ordering::Relaxed);
                debug!(id = self.handle, %dst, "no listener, rejecting");
                self.emit(CmEventKind::Rejected, None, REJECT_NO_LISTENER);
                return Ok(());
            }
        };

        let child = SimCmId::new(self.fabric.clone(), Arc::downgrade(&channel));
        {
            let mut child_state = child.state.lock();
            child_state.peer = Some(self.me.clone());
            child_state.dst = Some(dst);
        }
        self.state.lock().peer = Some(Arc::downgrade(&child));
        self.fabric.counters.connects.fetch_add(1, Ordering::Relaxed);
        debug!(id = self.handle, child = child.handle, listener = listener.handle, "connect request");
        channel.push(CmEvent {
            kind: CmEventKind::ConnectRequest,
            id: child,
            listen_id: Some(listener.handle),
            status: 0,
        });
        Ok(())
    }

    fn accept(&self, _params: &ConnParams) -> Result<()> {
        let (peer, qp) = {
            let state = self.state.lock();
            (
                state.peer.as_ref().and_then(Weak::upgrade),
                state.qp.as_ref().and_then(Weak::upgrade),
            )
        };
        let peer = peer.ok_or(RdmaError::NotReady("no connection request to accept"))?;
        let qp = qp.ok_or(RdmaError::NotReady("queue pair not created"))?;
        let peer_qp = peer
            .qp()
            .ok_or(RdmaError::NotReady("peer queue pair is gone"))?;

        qp.link(&peer_qp);
        peer_qp.link(&qp);
        self.state.lock().connected = true;
        peer.state.lock().connected = true;

        debug!(id = self.handle, peer = peer.handle, "sim connection established");
        self.emit(CmEventKind::Established, None, 0);
        peer.emit(CmEventKind::Established, None, 0);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let peer = self.state.lock().peer.as_ref().and_then(Weak::upgrade);
        if self.drop_connection() {
            if let Some(peer) = peer {
                peer.drop_connection();
            }
        }
        Ok(())
    }

    fn verbs(&self) -> Result<Arc<dyn Device>> {
        Ok(Arc::new(SimDevice {
            fabric: self.fabric.clone(),
        }))
    }

    fn create_qp(
        &self,
        pd: &Arc<dyn ProtectionDomain>,
        attr: &QpInitAttr,
    ) -> Result<Arc<dyn QueuePair>> {
        if self.fabric.faults().fail_create_qp {
            return Err(RdmaError::resource("rdma_create_qp", "injected fault"));
        }
        let pd = self
            .fabric
            .pd(pd.handle())
            .ok_or_else(|| RdmaError::resource("rdma_create_qp", "unknown protection domain"))?;
        let send_cq = self
            .fabric
            .cq(attr.send_cq.handle())
            .ok_or_else(|| RdmaError::resource("rdma_create_qp", "unknown send cq"))?;
        let recv_cq = self
            .fabric
            .cq(attr.recv_cq.handle())
            .ok_or_else(|| RdmaError::resource("rdma_create_qp", "unknown recv cq"))?;

        let qp_num = (self.fabric.handle() & 0x00ff_ffff) as u32;
        let qp = Arc::new(SimQp {
            qp_num,
            fabric: self.fabric.clone(),
            _pd: pd,
            send_cq,
            recv_cq,
            cap: attr.cap,
            inner: Mutex::new(QpInner::default()),
        });
        self.state.lock().qp = Some(Arc::downgrade(&qp));
        self.fabric
            .record(ResourceEvent::Acquired(ResourceKind::Qp, qp_num as Handle));
        Ok(qp)
    }
}

/// Device context of the simulated fabric.
pub struct SimDevice {
    fabric: Arc<FabricInner>,
}

impl fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimDevice").field("name", &DEVICE_NAME).finish()
    }
}

impl Device for SimDevice {
    fn name(&self) -> &str {
        DEVICE_NAME
    }

    fn alloc_pd(&self) -> Result<Arc<dyn ProtectionDomain>> {
        if self.fabric.faults().fail_alloc_pd {
            return Err(RdmaError::resource("ibv_alloc_pd", "injected fault"));
        }
        let handle = self.fabric.handle();
        let pd = Arc::new_cyclic(|me| SimPd {
            handle,
            fabric: self.fabric.clone(),
            me: me.clone(),
        });
        self.fabric.pds.lock().insert(handle, Arc::downgrade(&pd));
        self.fabric
            .record(ResourceEvent::Acquired(ResourceKind::Pd, handle));
        Ok(pd)
    }

    fn create_comp_channel(&self) -> Result<Arc<dyn CompChannel>> {
        if self.fabric.faults().fail_comp_channel {
            return Err(RdmaError::resource("ibv_create_comp_channel", "injected fault"));
        }
        let handle = self.fabric.handle();
        let channel = Arc::new(SimCompChannel {
            handle,
            fabric: self.fabric.clone(),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        self.fabric
            .channels
            .lock()
            .insert(handle, Arc::downgrade(&channel));
        self.fabric
            .record(ResourceEvent::Acquired(ResourceKind::CompChannel, handle));
        Ok(channel)
    }

    fn create_cq(
        &self,
        cqe: u32,
        channel: &Arc<dyn CompChannel>,
    ) -> Result<Arc<dyn CompletionQueue>> {
        if self.fabric.faults().fail_create_cq {
            return Err(RdmaError::resource("ibv_create_cq", "injected fault"));
        }
        let channel = self
            .fabric
            .channel(channel.handle())
            .ok_or_else(|| RdmaError::resource("ibv_create_cq", "unknown completion channel"))?;
        let handle = self.fabric.handle();
        let cq = Arc::new(SimCq {
            handle,
            cqe,
            fabric: self.fabric.clone(),
            channel,
            inner: Mutex::new(CqInner::default()),
        });
        self.fabric.cqs.lock().insert(handle, Arc::downgrade(&cq));
        self.fabric
            .record(ResourceEvent::Acquired(ResourceKind::Cq, handle));
        Ok(cq)
    }
}

/// Protection domain of the simulated fabric.
pub struct SimPd {
    handle: Handle,
    fabric: Arc<FabricInner>,
    me: Weak<SimPd>,
}

impl fmt::Debug for SimPd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimPd").field("handle", &self.handle).finish()
    }
}

impl Drop for SimPd {
    fn drop(&mut self) {
        self.fabric.pds.lock().remove(&self.handle);
        self.fabric
            .record(ResourceEvent::Released(ResourceKind::Pd, self.handle));
    }
}

impl ProtectionDomain for SimPd {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn reg_mr(&self, len: usize, access: AccessFlags) -> Result<Arc<dyn MemoryRegion>> {
        let attempt = self.fabric.mr_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fabric.faults().fail_reg_mr_at == Some(attempt) {
            return Err(RdmaError::resource(
                "ibv_reg_mr",
                format!("injected fault at registration {attempt}"),
            ));
        }
        let pd = self
            .me
            .upgrade()
            .ok_or_else(|| RdmaError::resource("ibv_reg_mr", "protection domain is gone"))?;

        let key = self.fabric.next_key.fetch_add(1, Ordering::Relaxed);
        let span = (len as u64).div_ceil(PAGE).max(1) * PAGE + PAGE;
        let region = Arc::new(RegionBuf {
            addr: self.fabric.next_addr.fetch_add(span, Ordering::Relaxed),
            lkey: key | 0x4000_0000,
            rkey: key | 0x8000_0000,
            access,
            data: Mutex::new(vec![0u8; len]),
        });
        {
            let mut regions = self.fabric.regions.lock();
            regions.by_lkey.insert(region.lkey, region.clone());
            regions.by_rkey.insert(region.rkey, region.clone());
        }
        self.fabric
            .record(ResourceEvent::Acquired(ResourceKind::Mr, region.rkey as Handle));
        Ok(Arc::new(SimMr {
            region,
            len,
            fabric: self.fabric.clone(),
            _pd: pd,
        }))
    }
}

/// Memory region of the simulated fabric.
pub struct SimMr {
    region: Arc<RegionBuf>,
    len: usize,
    fabric: Arc<FabricInner>,
    _pd: Arc<SimPd>,
}

impl SimMr {
    fn bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {offset}+{len} outside region of {} bytes", self.len),
            )
            .into()),
        }
    }
}

impl fmt::Debug for SimMr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimMr")
            .field("addr", &format_args!("{:#x}", self.region.addr))
            .field("len", &self.len)
            .field("rkey", &format_args!("{:#x}", self.region.rkey))
            .finish()
    }
}

impl Drop for SimMr {
    fn drop(&mut self) {
        {
            let mut regions = self.fabric.regions.lock();
            regions.by_lkey.remove(&self.region.lkey);
            regions.by_rkey.remove(&self.region.rkey);
        }
        self.fabric.record(ResourceEvent::Released(
            ResourceKind::Mr,
            self.region.rkey as Handle,
        ));
    }
}

impl MemoryRegion for SimMr {
    fn addr(&self) -> u64 {
        self.region.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> u32 {
        self.region.lkey
    }

    fn rkey(&self) -> u32 {
        self.region.rkey
    }

    fn access(&self) -> AccessFlags {
        self.region.access
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.bounds(offset, len)?;
        Ok(self.region.data.lock()[offset..offset + len].to_vec())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.bounds(offset, data.len())?;
        self.region.data.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Completion channel of the simulated fabric.
pub struct SimCompChannel {
    handle: Handle,
    fabric: Arc<FabricInner>,
    queue: Mutex<VecDeque<Handle>>,
    cond: Condvar,
    closed: AtomicBool,
}

impl SimCompChannel {
    fn notify(&self, cq: Handle) {
        let mut queue = self.queue.lock();
        queue.push_back(cq);
        self.cond.notify_all();
    }
}

impl fmt::Debug for SimCompChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCompChannel")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for SimCompChannel {
    fn drop(&mut self) {
        self.fabric.channels.lock().remove(&self.handle);
        self.fabric
            .record(ResourceEvent::Released(ResourceKind::CompChannel, self.handle));
    }
}

impl CompChannel for SimCompChannel {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn get_cq_event(&self) -> Result<Option<Handle>> {
        let mut queue = self.queue.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(cq) = queue.pop_front() {
                return Ok(Some(cq));
            }
            self.cond.wait(&mut queue);
        }
    }

    fn shutdown(&self) {
        let _queue = self.queue.lock();
        self.closed.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct CqInner {
    entries: VecDeque<WorkCompletion>,
    armed: bool,
    acked: u64,
}

/// Completion queue of the simulated fabric.
pub struct SimCq {
    handle: Handle,
    cqe: u32,
    fabric: Arc<FabricInner>,
    channel: Arc<SimCompChannel>,
    inner: Mutex<CqInner>,
}

impl SimCq {
    fn push(&self, wc: WorkCompletion) {
        let notify = {
            let mut inner = self.inner.lock();
            if inner.entries.len() >= self.cqe as usize {
                debug!(cq = self.handle, cqe = self.cqe, "completion queue over capacity");
            }
            inner.entries.push_back(wc);
            std::mem::replace(&mut inner.armed, false)
        };
        if notify {
            self.channel.notify(self.handle);
        }
    }
}

impl fmt::Debug for SimCq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCq")
            .field("handle", &self.handle)
            .field("cqe", &self.cqe)
            .finish()
    }
}

impl Drop for SimCq {
    fn drop(&mut self) {
        let acked = self.inner.get_mut().acked;
        trace!(cq = self.handle, acked, "destroying cq");
        self.fabric.cqs.lock().remove(&self.handle);
        self.fabric
            .record(ResourceEvent::Released(ResourceKind::Cq, self.handle));
    }
}

impl CompletionQueue for SimCq {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn req_notify(&self) -> Result<()> {
        self.inner.lock().armed = true;
        Ok(())
    }

    fn poll(&self) -> Result<Option<WorkCompletion>> {
        Ok(self.inner.lock().entries.pop_front())
    }

    fn ack_events(&self, count: u32) {
        self.inner.lock().acked += u64::from(count);
    }
}

#[derive(Default)]
struct QpInner {
    peer: Option<Weak<SimQp>>,
    recvs: VecDeque<RecvWr>,
    inbound: VecDeque<Vec<u8>>,
}

/// Reliable-connected queue pair of the simulated fabric.
pub struct SimQp {
    qp_num: u32,
    fabric: Arc<FabricInner>,
    _pd: Arc<SimPd>,
    send_cq: Arc<SimCq>,
    recv_cq: Arc<SimCq>,
    cap: QpCap,
    inner: Mutex<QpInner>,
}

impl SimQp {
    fn link(&self, peer: &Arc<SimQp>) {
        self.inner.lock().peer = Some(Arc::downgrade(peer));
    }

    fn peer(&self) -> Option<Arc<SimQp>> {
        self.inner.lock().peer.as_ref().and_then(Weak::upgrade)
    }

    fn unlink_and_flush(&self) {
        let flushed: Vec<RecvWr> = {
            let mut inner = self.inner.lock();
            inner.peer = None;
            inner.inbound.clear();
            inner.recvs.drain(..).collect()
        };
        for wr in flushed {
            self.fabric.counters.flushed.fetch_add(1, Ordering::Relaxed);
            self.recv_cq.push(WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::WrFlushError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                qp_num: self.qp_num,
            });
        }
    }

    fn deliver(&self, data: Vec<u8>) {
        let wr = {
            let mut inner = self.inner.lock();
            match inner.recvs.pop_front() {
                Some(wr) => wr,
                None => {
                    inner.inbound.push_back(data);
                    return;
                }
            }
        };
        self.complete_recv(&wr, data);
    }

    fn complete_recv(&self, wr: &RecvWr, data: Vec<u8>) {
        let status = if data.len() > wr.sge.length as usize {
            WcStatus::LocalLengthError
        } else {
            match self.fabric.region_by_lkey(wr.sge.lkey) {
                Some(region) if region.write_at(wr.sge.addr, &data) => WcStatus::Success,
                _ => WcStatus::LocalProtectionError,
            }
        };
        self.fabric.counters.recvs.fetch_add(1, Ordering::Relaxed);
        self.recv_cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode: WcOpcode::Recv,
            byte_len: if status == WcStatus::Success {
                data.len() as u32
            } else {
                0
            },
            qp_num: self.qp_num,
        });
    }

    fn complete_send(&self, wr: &SendWr, opcode: WcOpcode, status: WcStatus) {
        if wr.signaled || status != WcStatus::Success {
            self.send_cq.push(WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode,
                byte_len: wr.sge.length,
                qp_num: self.qp_num,
            });
        }
    }

    fn record_op(&self, op: RdmaOpKind, remote_addr: u64, rkey: u32, length: u32, status: WcStatus) {
        self.fabric.rdma_ops.lock().push(RdmaOpRecord {
            qp_num: self.qp_num,
            op,
            remote_addr,
            rkey,
            length,
            status,
        });
    }
}

impl fmt::Debug for SimQp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimQp").field("qp_num", &self.qp_num).finish()
    }
}

impl Drop for SimQp {
    fn drop(&mut self) {
        self.fabric
            .record(ResourceEvent::Released(ResourceKind::Qp, self.qp_num as Handle));
    }
}

impl QueuePair for SimQp {
    fn qp_num(&self) -> u32 {
        self.qp_num
    }

    fn post_send(&self, wr: &SendWr) -> Result<()> {
        let post_err = |reason: &str| RdmaError::Post {
            op: "send",
            reason: reason.to_string(),
        };
        let peer = self
            .peer()
            .ok_or_else(|| post_err("queue pair is not connected"))?;
        let len = wr.sge.length as usize;
        let local = self
            .fabric
            .region_by_lkey(wr.sge.lkey)
            .filter(|r| r.offset(wr.sge.addr, len).is_some())
            .ok_or_else(|| post_err("local buffer outside its registered region"))?;

        match wr.op {
            SendOp::Send => {
                let data = local
                    .read_at(wr.sge.addr, len)
                    .ok_or_else(|| post_err("local buffer outside its registered region"))?;
                self.fabric.counters.sends.fetch_add(1, Ordering::Relaxed);
                peer.deliver(data);
                self.complete_send(wr, WcOpcode::Send, WcStatus::Success);
            }
            SendOp::RdmaRead { remote_addr, rkey } => {
                self.fabric.counters.rdma_reads.fetch_add(1, Ordering::Relaxed);
                let data = self
                    .fabric
                    .region_by_rkey(rkey)
                    .filter(|r| r.access.contains(AccessFlags::REMOTE_READ))
                    .and_then(|r| r.read_at(remote_addr, len));
                let status = match data {
                    Some(data) if local.write_at(wr.sge.addr, &data) => WcStatus::Success,
                    Some(_) => WcStatus::LocalProtectionError,
                    None => WcStatus::RemoteAccessError,
                };
                self.record_op(RdmaOpKind::Read, remote_addr, rkey, wr.sge.length, status);
                self.complete_send(wr, WcOpcode::RdmaRead, status);
            }
            SendOp::RdmaWrite { remote_addr, rkey } => {
                self.fabric.counters.rdma_writes.fetch_add(1, Ordering::Relaxed);
                let data = local
                    .read_at(wr.sge.addr, len)
                    .ok_or_else(|| post_err("local buffer outside its registered region"))?;
                let written = self
                    .fabric
                    .region_by_rkey(rkey)
                    .filter(|r| r.access.contains(AccessFlags::REMOTE_WRITE))
                    .map_or(false, |r| r.write_at(remote_addr, &data));
                let status = if written {
                    WcStatus::Success
                } else {
                    WcStatus::RemoteAccessError
                };
                self.record_op(RdmaOpKind::Write, remote_addr, rkey, wr.sge.length, status);
                self.complete_send(wr, WcOpcode::RdmaWrite, status);
            }
        }
        Ok(())
    }

    fn post_recv(&self, wr: &RecvWr) -> Result<()> {
        let covered = self
            .fabric
            .region_by_lkey(wr.sge.lkey)
            .map_or(false, |r| r.offset(wr.sge.addr, wr.sge.length as usize).is_some());
        if !covered {
            return Err(RdmaError::Post {
                op: "recv",
                reason: "buffer outside its registered region".to_string(),
            });
        }
        let held = {
            let mut inner = self.inner.lock();
            if inner.recvs.len() >= self.cap.max_recv_wr as usize {
                return Err(RdmaError::Post {
                    op: "recv",
                    reason: format!("receive queue full ({} entries)", self.cap.max_recv_wr),
                });
            }
            match inner.inbound.pop_front() {
                Some(data) => Some(data),
                None => {
                    inner.recvs.push_back(*wr);
                    None
                }
            }
        };
        if let Some(data) = held {
            self.complete_recv(wr, data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::Sge;

    const TIMEOUT: Duration = Duration::from_millis(100);

    struct Endpoint {
        id: Arc<dyn CmId>,
        channel: Arc<dyn CmEventChannel>,
        qp: Arc<dyn QueuePair>,
        cq: Arc<dyn CompletionQueue>,
        comp: Arc<dyn CompChannel>,
        pd: Arc<dyn ProtectionDomain>,
        mr: Arc<dyn MemoryRegion>,
    }

    fn build(id: Arc<dyn CmId>, channel: Arc<dyn CmEventChannel>, access: AccessFlags) -> Endpoint {
        let dev = id.verbs().unwrap();
        let pd = dev.alloc_pd().unwrap();
        let comp = dev.create_comp_channel().unwrap();
        let cq = dev.create_cq(8, &comp).unwrap();
        let attr = QpInitAttr {
            send_cq: cq.clone(),
            recv_cq: cq.clone(),
            cap: QpCap {
                max_send_wr: 4,
                max_recv_wr: 2,
                max_send_sge: 1,
                max_recv_sge: 1,
            },
        };
        let qp = id.create_qp(&pd, &attr).unwrap();
        let mr = pd.reg_mr(64, access).unwrap();
        Endpoint {
            id,
            channel,
            qp,
            cq,
            comp,
            pd,
            mr,
        }
    }

    fn next(channel: &Arc<dyn CmEventChannel>) -> CmEvent {
        channel.get_event().unwrap().unwrap()
    }

    fn connected_pair(fabric: &SimFabric, access: AccessFlags) -> (Endpoint, Endpoint) {
        let addr: SocketAddr = "10.0.0.1:7471".parse().unwrap();
        let srv_channel = fabric.create_event_channel().unwrap();
        let listener = srv_channel.create_id().unwrap();
        listener.listen(addr, 3).unwrap();

        let cli_channel = fabric.create_event_channel().unwrap();
        let cli_id = cli_channel.create_id().unwrap();
        cli_id.resolve_addr(addr, TIMEOUT).unwrap();
        assert_eq!(next(&cli_channel).kind, CmEventKind::AddrResolved);
        cli_id.resolve_route(TIMEOUT).unwrap();
        assert_eq!(next(&cli_channel).kind, CmEventKind::RouteResolved);
        let client = build(cli_id, cli_channel, access);
        client.id.connect(&ConnParams::default()).unwrap();

        let req = next(&srv_channel);
        assert_eq!(req.kind, CmEventKind::ConnectRequest);
        assert_eq!(req.listen_id, Some(listener.handle()));
        let server = build(req.id.clone(), srv_channel, access);
        server.id.accept(&ConnParams::default()).unwrap();
        assert_eq!(next(&server.channel).kind, CmEventKind::Established);
        assert_eq!(next(&client.channel).kind, CmEventKind::Established);
        (client, server)
    }

    fn sge(mr: &Arc<dyn MemoryRegion>, len: u32) -> Sge {
        Sge {
            addr: mr.addr(),
            length: len,
            lkey: mr.lkey(),
        }
    }

    #[test]
    fn test_connect_without_listener_is_rejected() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id().unwrap();
        id.resolve_addr("10.9.9.9:1".parse().unwrap(), TIMEOUT).unwrap();
        next(&channel);
        id.resolve_route(TIMEOUT).unwrap();
        next(&channel);
        let ep = build(id, channel, AccessFlags::LOCAL_WRITE);
        ep.id.connect(&ConnParams::default()).unwrap();
        let ev = next(&ep.channel);
        assert_eq!(ev.kind, CmEventKind::Rejected);
        assert_eq!(ev.status, REJECT_NO_LISTENER);
        assert_eq!(fabric.stats().rejects, 1);
    }

    #[test]
    fn test_device_removal_reaches_every_live_id() {
        let fabric = SimFabric::new();
        let a = fabric.create_event_channel().unwrap();
        let b = fabric.create_event_channel().unwrap();
        let id_a = a.create_id().unwrap();
        let id_b = b.create_id().unwrap();
        drop(b.create_id().unwrap());

        fabric.remove_device();
        let ev = next(&a);
        assert_eq!(ev.kind, CmEventKind::DeviceRemoval);
        assert_eq!(ev.id.handle(), id_a.handle());
        assert_eq!(next(&b).id.handle(), id_b.handle());

        b.shutdown();
        assert!(b.get_event().unwrap().is_none());
    }

    #[test]
    fn test_unspecified_destination_is_addr_error() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id().unwrap();
        id.resolve_addr("0.0.0.0:7471".parse().unwrap(), TIMEOUT).unwrap();
        assert_eq!(next(&channel).kind, CmEventKind::AddrError);
        assert!(id.resolve_route(TIMEOUT).is_err());
    }

    #[test]
    fn test_wildcard_listener_matches_any_ip() {
        let fabric = SimFabric::new();
        let srv = fabric.create_event_channel().unwrap();
        let listener = srv.create_id().unwrap();
        listener.listen("0.0.0.0:9000".parse().unwrap(), 3).unwrap();
        assert!(listener.listen("0.0.0.0:9000".parse().unwrap(), 3).is_err());
        assert!(fabric
            .inner
            .find_listener("192.168.1.5:9000".parse().unwrap())
            .is_some());
        assert!(fabric
            .inner
            .find_listener("192.168.1.5:9001".parse().unwrap())
            .is_none());
        drop(listener);
        assert!(fabric
            .inner
            .find_listener("192.168.1.5:9000".parse().unwrap())
            .is_none());
    }

    #[test]
    fn test_send_lands_in_posted_recv() {
        let fabric = SimFabric::new();
        let (client, server) = connected_pair(&fabric, AccessFlags::LOCAL_WRITE);
        server.cq.req_notify().unwrap();
        server
            .qp
            .post_recv(&RecvWr {
                wr_id: 1,
                sge: sge(&server.mr, 64),
            })
            .unwrap();
        client.mr.write_bytes(0, b"hello").unwrap();
        client
            .qp
            .post_send(&SendWr {
                wr_id: 2,
                sge: sge(&client.mr, 5),
                op: SendOp::Send,
                signaled: true,
            })
            .unwrap();

        assert_eq!(server.comp.get_cq_event().unwrap(), Some(server.cq.handle()));
        let wc = server.cq.poll().unwrap().unwrap();
        assert_eq!(wc.opcode, WcOpcode::Recv);
        assert_eq!(wc.status, WcStatus::Success);
        assert_eq!(wc.byte_len, 5);
        assert_eq!(server.mr.read_bytes(0, 5).unwrap(), b"hello");

        let sent = client.cq.poll().unwrap().unwrap();
        assert_eq!(sent.opcode, WcOpcode::Send);
    }

    #[test]
    fn test_send_before_recv_is_held() {
        let fabric = SimFabric::new();
        let (client, server) = connected_pair(&fabric, AccessFlags::LOCAL_WRITE);
        client
            .qp
            .post_send(&SendWr {
                wr_id: 2,
                sge: sge(&client.mr, 8),
                op: SendOp::Send,
                signaled: false,
            })
            .unwrap();
        assert!(server.cq.poll().unwrap().is_none());
        server
            .qp
            .post_recv(&RecvWr {
                wr_id: 9,
                sge: sge(&server.mr, 64),
            })
            .unwrap();
        let wc = server.cq.poll().unwrap().unwrap();
        assert_eq!((wc.wr_id, wc.byte_len), (9, 8));
        assert!(client.cq.poll().unwrap().is_none());
    }

    #[test]
    fn test_rdma_write_and_access_checks() {
        let fabric = SimFabric::new();
        let bulk = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        let (client, server) = connected_pair(&fabric, bulk);
        server.mr.write_bytes(0, &[7u8; 16]).unwrap();
        server
            .qp
            .post_send(&SendWr {
                wr_id: 3,
                sge: sge(&server.mr, 16),
                op: SendOp::RdmaWrite {
                    remote_addr: client.mr.addr(),
                    rkey: client.mr.rkey(),
                },
                signaled: true,
            })
            .unwrap();
        let wc = server.cq.poll().unwrap().unwrap();
        assert_eq!(wc.status, WcStatus::Success);
        assert_eq!(client.mr.read_bytes(0, 16).unwrap(), vec![7u8; 16]);

        // read without REMOTE_READ
        server
            .qp
            .post_send(&SendWr {
                wr_id: 4,
                sge: sge(&server.mr, 16),
                op: SendOp::RdmaRead {
                    remote_addr: client.mr.addr(),
                    rkey: client.mr.rkey(),
                },
                signaled: true,
            })
            .unwrap();
        assert_eq!(
            server.cq.poll().unwrap().unwrap().status,
            WcStatus::RemoteAccessError
        );

        // out of bounds
        server
            .qp
            .post_send(&SendWr {
                wr_id: 5,
                sge: sge(&server.mr, 16),
                op: SendOp::RdmaWrite {
                    remote_addr: client.mr.addr() + 60,
                    rkey: client.mr.rkey(),
                },
                signaled: true,
            })
            .unwrap();
        assert_eq!(
            server.cq.poll().unwrap().unwrap().status,
            WcStatus::RemoteAccessError
        );

        let ops = fabric.rdma_ops();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].op, RdmaOpKind::Write);
        assert_eq!(ops[0].rkey, client.mr.rkey());
    }

    #[test]
    fn test_notify_needs_arming() {
        let fabric = SimFabric::new();
        let (client, server) = connected_pair(&fabric, AccessFlags::LOCAL_WRITE);
        let send = SendWr {
            wr_id: 1,
            sge: sge(&client.mr, 4),
            op: SendOp::Send,
            signaled: true,
        };
        let comp = fabric.inner.channel(client.comp.handle()).unwrap();
        client.qp.post_send(&send).unwrap();
        assert!(comp.queue.lock().is_empty());

        client.cq.req_notify().unwrap();
        client.qp.post_send(&send).unwrap();
        client.qp.post_send(&send).unwrap();
        assert_eq!(comp.queue.lock().len(), 1);
        drop(server);
    }

    #[test]
    fn test_disconnect_flushes_and_notifies_both() {
        let fabric = SimFabric::new();
        let (client, server) = connected_pair(&fabric, AccessFlags::LOCAL_WRITE);
        client
            .qp
            .post_recv(&RecvWr {
                wr_id: 11,
                sge: sge(&client.mr, 64),
            })
            .unwrap();
        server.id.disconnect().unwrap();
        assert_eq!(next(&server.channel).kind, CmEventKind::Disconnected);
        assert_eq!(next(&client.channel).kind, CmEventKind::Disconnected);

        let wc = client.cq.poll().unwrap().unwrap();
        assert_eq!((wc.wr_id, wc.status), (11, WcStatus::WrFlushError));
        assert_eq!(fabric.stats().flushed, 1);

        client.id.disconnect().unwrap();
        assert!(client
            .qp
            .post_send(&SendWr {
                wr_id: 1,
                sge: sge(&client.mr, 4),
                op: SendOp::Send,
                signaled: true,
            })
            .is_err());
    }

    #[test]
    fn test_recv_queue_depth() {
        let fabric = SimFabric::new();
        let (client, _server) = connected_pair(&fabric, AccessFlags::LOCAL_WRITE);
        let wr = RecvWr {
            wr_id: 1,
            sge: sge(&client.mr, 64),
        };
        client.qp.post_recv(&wr).unwrap();
        client.qp.post_recv(&wr).unwrap();
        assert!(matches!(
            client.qp.post_recv(&wr),
            Err(RdmaError::Post { op: "recv", .. })
        ));
    }

    #[test]
    fn test_release_mirrors_acquisition() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id().unwrap();
        let ep = build(id, channel, AccessFlags::LOCAL_WRITE);
        let Endpoint {
            qp, cq, comp, pd, mr, ..
        } = ep;
        let rkey = mr.rkey() as Handle;
        let qp_num = qp.qp_num() as Handle;
        drop(mr);
        drop(qp);
        drop(cq);
        drop(comp);
        drop(pd);

        let journal = fabric.journal();
        let released: Vec<_> = journal
            .iter()
            .filter_map(|e| match e {
                ResourceEvent::Released(kind, h) => Some((*kind, *h)),
                _ => None,
            })
            .collect();
        let kinds: Vec<_> = released.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Mr,
                ResourceKind::Qp,
                ResourceKind::Cq,
                ResourceKind::CompChannel,
                ResourceKind::Pd
            ]
        );
        assert_eq!(released[0].1, rkey);
        assert_eq!(released[1].1, qp_num);
        assert_eq!(fabric.live_regions(), 0);
    }

    #[test]
    fn test_fault_plan() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id().unwrap();
        let dev = id.verbs().unwrap();
        fabric.set_faults(FaultPlan {
            fail_alloc_pd: true,
            ..Default::default()
        });
        assert!(dev.alloc_pd().is_err());

        fabric.set_faults(FaultPlan {
            fail_reg_mr_at: Some(1),
            ..Default::default()
        });
        let pd = dev.alloc_pd().unwrap();
        let first = pd.reg_mr(16, AccessFlags::empty()).unwrap();
        assert!(pd.reg_mr(16, AccessFlags::empty()).is_err());
        assert!(pd.reg_mr(16, AccessFlags::empty()).is_ok());
        assert_ne!(first.rkey(), first.lkey());
        assert_eq!(first.rkey() & 0x8000_0000, 0x8000_0000);
    }

    #[test]
    fn test_region_bounds() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let pd = channel.create_id().unwrap().verbs().unwrap().alloc_pd().unwrap();
        let a = pd.reg_mr(100, AccessFlags::LOCAL_WRITE).unwrap();
        let b = pd.reg_mr(100, AccessFlags::LOCAL_WRITE).unwrap();
        assert!(b.addr() >= a.addr() + 100);
        assert_eq!(a.addr() % PAGE, 0);
        assert!(a.write_bytes(96, &[1, 2, 3, 4]).is_ok());
        assert!(a.write_bytes(97, &[1, 2, 3, 4]).is_err());
        assert!(a.read_bytes(usize::MAX, 2).is_err());
        assert_eq!(&fabric.region_bytes(a.rkey()).unwrap()[96..], &[1u8, 2, 3, 4]);
    }
}
