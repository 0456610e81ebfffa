//! Verbs provider over librdmacm and libibverbs, through `rdma-sys`.
//!
//! Every object wraps the raw pointer it owns and releases it when its
//! last handle drops, keeping the objects it was created from alive the
//! same way the simulated fabric does. Handles are the objects' addresses;
//! the provider keeps a registry from handle to object so trait-level
//! arguments (a protection domain, a completion queue) can be turned back
//! into the pointers the C calls need.
//!
//! Both event channels are switched to non-blocking mode and polled with a
//! short timeout, so `shutdown` wakes a blocked reader within one interval.
//! Connection-manager events are copied out and acknowledged immediately;
//! `rdma_destroy_id` waits for unacknowledged events, and the core never
//! reads private data.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rdma_sys::*;
use tracing::{debug, trace, warn};

use crate::error::{RdmaError, Result};
use crate::verbs::{
    AccessFlags, CmEvent, CmEventChannel, CmEventKind, CmId, CompChannel, CompletionQueue,
    ConnParams, Device, Handle, MemoryRegion, ProtectionDomain, QpInitAttr, QueuePair,
    RdmaProvider, RecvWr, SendOp, SendWr, WcOpcode, WcStatus, WorkCompletion,
};

/// Upper bound on how long a blocked channel read takes to notice shutdown.
const POLL_INTERVAL_MS: c_int = 100;
const PAGE: usize = 4096;

fn os_error(op: &'static str) -> RdmaError {
    RdmaError::resource(op, io::Error::last_os_error().to_string())
}

fn handle_of<T>(ptr: *const T) -> Handle {
    ptr as usize as Handle
}

fn set_nonblocking(fd: c_int) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by a live channel.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait up to one poll interval for `fd` to become readable.
fn readable(fd: c_int) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one valid pollfd.
    match unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) } {
        n if n > 0 => Ok(true),
        0 => Ok(false),
        _ => {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// `SocketAddr` laid out as the `sockaddr` rdma_cm expects.
fn sockaddr_storage(addr: SocketAddr) -> libc::sockaddr_storage {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_storage is large and aligned enough for any sockaddr.
            unsafe { ptr::write(ptr::addr_of_mut!(storage).cast(), sin) };
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: as above.
            unsafe { ptr::write(ptr::addr_of_mut!(storage).cast(), sin6) };
        }
    }
    storage
}

fn event_kind(raw: rdma_cm_event_type::Type) -> Option<CmEventKind> {
    use rdma_cm_event_type::*;
    let kind = match raw {
        RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventKind::ConnectResponse,
        RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        RDMA_CM_EVENT_MULTICAST_JOIN => CmEventKind::MulticastJoin,
        RDMA_CM_EVENT_MULTICAST_ERROR => CmEventKind::MulticastError,
        RDMA_CM_EVENT_ADDR_CHANGE => CmEventKind::AddrChange,
        RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        _ => return None,
    };
    Some(kind)
}

fn wc_status(raw: ibv_wc_status::Type) -> WcStatus {
    use ibv_wc_status::*;
    match raw {
        IBV_WC_SUCCESS => WcStatus::Success,
        IBV_WC_LOC_LEN_ERR => WcStatus::LocalLengthError,
        IBV_WC_LOC_PROT_ERR => WcStatus::LocalProtectionError,
        IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushError,
        IBV_WC_REM_ACCESS_ERR => WcStatus::RemoteAccessError,
        IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExceeded,
        _ => WcStatus::General,
    }
}

fn wc_opcode(raw: ibv_wc_opcode::Type) -> WcOpcode {
    use ibv_wc_opcode::*;
    match raw {
        IBV_WC_SEND => WcOpcode::Send,
        IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        IBV_WC_COMP_SWAP => WcOpcode::CompSwap,
        IBV_WC_FETCH_ADD => WcOpcode::FetchAdd,
        IBV_WC_BIND_MW => WcOpcode::BindMw,
        IBV_WC_RECV => WcOpcode::Recv,
        IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        other => WcOpcode::Other(other),
    }
}

fn ibv_access(access: AccessFlags) -> c_int {
    let mut flags = ibv_access_flags(0);
    if access.contains(AccessFlags::LOCAL_WRITE) {
        flags = flags | ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    flags.0 as c_int
}

#[derive(Default)]
struct Registry {
    pds: Mutex<HashMap<Handle, Weak<HwPd>>>,
    channels: Mutex<HashMap<Handle, Weak<HwCompChannel>>>,
    cqs: Mutex<HashMap<Handle, Weak<HwCq>>>,
}

impl Registry {
    fn find<T>(
        map: &Mutex<HashMap<Handle, Weak<T>>>,
        handle: Handle,
        op: &'static str,
    ) -> Result<Arc<T>> {
        map.lock()
            .get(&handle)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RdmaError::resource(op, format!("object {handle:#x} is not from this device")))
    }
}

/// Provider backed by the host's RDMA devices.
#[derive(Clone, Default)]
pub struct HwProvider {
    reg: Arc<Registry>,
}

impl HwProvider {
    /// Provider using whatever device rdma_cm binds each identifier to.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for HwProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwProvider")
            .field("pds", &self.reg.pds.lock().len())
            .field("cqs", &self.reg.cqs.lock().len())
            .finish()
    }
}

impl RdmaProvider for HwProvider {
    fn create_event_channel(&self) -> Result<Arc<dyn CmEventChannel>> {
        // SAFETY: FFI call without arguments.
        let raw = unsafe { rdma_create_event_channel() };
        let raw = NonNull::new(raw).ok_or_else(|| os_error("rdma_create_event_channel"))?;
        let channel = Arc::new_cyclic(|me| HwEventChannel {
            raw,
            reg: self.reg.clone(),
            me: me.clone(),
            ids: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        // SAFETY: the channel is live for as long as `channel`.
        set_nonblocking(unsafe { (*raw.as_ptr()).fd })?;
        debug!(channel = channel.handle(), "created cm event channel");
        Ok(channel)
    }
}

/// `rdma_event_channel`.
pub struct HwEventChannel {
    raw: NonNull<rdma_event_channel>,
    reg: Arc<Registry>,
    me: Weak<HwEventChannel>,
    ids: Mutex<HashMap<Handle, Weak<HwCmId>>>,
    closed: AtomicBool,
}

// The channel pointer is only handed to librdmacm calls, which are thread safe.
unsafe impl Send for HwEventChannel {}
unsafe impl Sync for HwEventChannel {}

impl HwEventChannel {
    fn this(&self) -> Result<Arc<HwEventChannel>> {
        self.me
            .upgrade()
            .ok_or(RdmaError::NotReady("event channel is being destroyed"))
    }

    fn adopt(&self, raw: NonNull<rdma_cm_id>) -> Result<Arc<HwCmId>> {
        let id = HwCmId::new(raw, self.this()?, self.reg.clone());
        self.ids.lock().insert(id.handle(), Arc::downgrade(&id));
        Ok(id)
    }

    /// Copy one raw event into a [`CmEvent`]. `None` for events the core cannot route.
    ///
    /// # Safety
    /// `raw` must be an event returned by `rdma_get_cm_event` and not yet acknowledged.
    unsafe fn translate(&self, raw: *mut rdma_cm_event) -> Result<Option<CmEvent>> {
        let ev = &*raw;
        let Some(kind) = event_kind(ev.event) else {
            warn!(event = ev.event, "unknown rdma_cm event type");
            return Ok(None);
        };
        let id: Arc<dyn CmId> = if kind == CmEventKind::ConnectRequest {
            match NonNull::new(ev.id) {
                Some(child) => self.adopt(child)?,
                None => return Ok(None),
            }
        } else {
            let handle = handle_of(ev.id);
            match self.ids.lock().get(&handle).and_then(Weak::upgrade) {
                Some(id) => id,
                None => {
                    warn!(event = %kind, id = handle, "event for released cm id");
                    return Ok(None);
                }
            }
        };
        let listen_id = (!ev.listen_id.is_null()).then(|| handle_of(ev.listen_id));
        Ok(Some(CmEvent {
            kind,
            id,
            listen_id,
            status: ev.status,
        }))
    }
}

impl fmt::Debug for HwEventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwEventChannel")
            .field("handle", &self.handle())
            .field("ids", &self.ids.lock().len())
            .finish()
    }
}

impl Drop for HwEventChannel {
    fn drop(&mut self) {
        // SAFETY: every id created on the channel holds a strong reference to
        // it, so none is left.
        unsafe { rdma_destroy_event_channel(self.raw.as_ptr()) };
    }
}

impl CmEventChannel for HwEventChannel {
    fn handle(&self) -> Handle {
        handle_of(self.raw.as_ptr())
    }

    fn create_id(&self) -> Result<Arc<dyn CmId>> {
        let mut raw = ptr::null_mut();
        // SAFETY: live channel, out-pointer to a local.
        let ret = unsafe {
            rdma_create_id(
                self.raw.as_ptr(),
                &mut raw,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if ret != 0 {
            return Err(os_error("rdma_create_id"));
        }
        let raw = NonNull::new(raw).ok_or_else(|| os_error("rdma_create_id"))?;
        Ok(self.adopt(raw)?)
    }

    fn get_event(&self) -> Result<Option<CmEvent>> {
        // SAFETY: live channel.
        let fd = unsafe { (*self.raw.as_ptr()).fd };
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if !readable(fd)? {
                continue;
            }
            let mut raw = ptr::null_mut();
            // SAFETY: live channel, out-pointer to a local.
            if unsafe { rdma_get_cm_event(self.raw.as_ptr(), &mut raw) } != 0 {
                let e = io::Error::last_os_error();
                if retryable(&e) {
                    continue;
                }
                return Err(e.into());
            }
            // SAFETY: `raw` was just returned by rdma_get_cm_event.
            let event = unsafe { self.translate(raw) };
            // SAFETY: acknowledged exactly once, after it was copied.
            unsafe { rdma_ack_cm_event(raw) };
            if let Some(event) = event? {
                return Ok(Some(event));
            }
        }
    }

    fn ack_event(&self, event: &CmEvent) {
        trace!(channel = self.handle(), kind = %event.kind, "cm event was acked on receipt");
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// `rdma_cm_id`.
pub struct HwCmId {
    raw: NonNull<rdma_cm_id>,
    me: Weak<HwCmId>,
    reg: Arc<Registry>,
    channel: Arc<HwEventChannel>,
}

unsafe impl Send for HwCmId {}
unsafe impl Sync for HwCmId {}

impl HwCmId {
    fn new(raw: NonNull<rdma_cm_id>, channel: Arc<HwEventChannel>, reg: Arc<Registry>) -> Arc<Self> {
        Arc::new_cyclic(|me| HwCmId {
            raw,
            me: me.clone(),
            reg,
            channel,
        })
    }

    fn this(&self) -> Result<Arc<HwCmId>> {
        self.me
            .upgrade()
            .ok_or(RdmaError::NotReady("cm id is being destroyed"))
    }

    fn check(ret: c_int, op: &'static str) -> Result<()> {
        if ret != 0 {
            return Err(os_error(op));
        }
        Ok(())
    }

    fn conn_param(params: &ConnParams) -> rdma_conn_param {
        // SAFETY: all-zero is a valid rdma_conn_param.
        let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
        param.responder_resources = params.responder_resources;
        param.initiator_depth = params.initiator_depth;
        param.retry_count = params.retry_count;
        param
    }
}

impl fmt::Debug for HwCmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwCmId").field("handle", &self.handle()).finish()
    }
}

impl Drop for HwCmId {
    fn drop(&mut self) {
        self.channel.ids.lock().remove(&self.handle());
        // SAFETY: the queue pair, if any, held a strong reference and is gone.
        if unsafe { rdma_destroy_id(self.raw.as_ptr()) } != 0 {
            warn!(error = %io::Error::last_os_error(), "rdma_destroy_id");
        }
    }
}

impl CmId for HwCmId {
    fn handle(&self) -> Handle {
        handle_of(self.raw.as_ptr())
    }

    fn resolve_addr(&self, dst: SocketAddr, timeout: Duration) -> Result<()> {
        let mut dst = sockaddr_storage(dst);
        // SAFETY: live id, `dst` outlives the call.
        let ret = unsafe {
            rdma_resolve_addr(
                self.raw.as_ptr(),
                ptr::null_mut(),
                ptr::addr_of_mut!(dst).cast(),
                timeout.as_millis() as c_int,
            )
        };
        Self::check(ret, "rdma_resolve_addr")
    }

    fn resolve_route(&self, timeout: Duration) -> Result<()> {
        // SAFETY: live id.
        let ret = unsafe { rdma_resolve_route(self.raw.as_ptr(), timeout.as_millis() as c_int) };
        Self::check(ret, "rdma_resolve_route")
    }

    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<()> {
        let mut sa = sockaddr_storage(addr);
        // SAFETY: live id, `sa` outlives the call.
        let ret = unsafe { rdma_bind_addr(self.raw.as_ptr(), ptr::addr_of_mut!(sa).cast()) };
        Self::check(ret, "rdma_bind_addr")?;
        // SAFETY: live, bound id.
        let ret = unsafe { rdma_listen(self.raw.as_ptr(), backlog as c_int) };
        Self::check(ret, "rdma_listen")
    }

    fn connect(&self, params: &ConnParams) -> Result<()> {
        let mut param = Self::conn_param(params);
        // SAFETY: live id, `param` outlives the call.
        let ret = unsafe { rdma_connect(self.raw.as_ptr(), &mut param) };
        Self::check(ret, "rdma_connect")
    }

    fn accept(&self, params: &ConnParams) -> Result<()> {
        let mut param = Self::conn_param(params);
        // SAFETY: live id, `param` outlives the call.
        let ret = unsafe { rdma_accept(self.raw.as_ptr(), &mut param) };
        Self::check(ret, "rdma_accept")
    }

    fn disconnect(&self) -> Result<()> {
        // SAFETY: live id.
        let ret = unsafe { rdma_disconnect(self.raw.as_ptr()) };
        Self::check(ret, "rdma_disconnect")
    }

    fn verbs(&self) -> Result<Arc<dyn Device>> {
        // SAFETY: live id; `verbs` is set once address resolution or a
        // connect request bound it to a device.
        let ctx = unsafe { (*self.raw.as_ptr()).verbs };
        let ctx = NonNull::new(ctx).ok_or(RdmaError::NotReady("cm id is not bound to a device"))?;
        // SAFETY: a bound context always has a device.
        let name = unsafe {
            CStr::from_ptr(ibv_get_device_name((*ctx.as_ptr()).device))
                .to_string_lossy()
                .into_owned()
        };
        Ok(Arc::new(HwDevice {
            ctx,
            name,
            reg: self.reg.clone(),
            id: self.this()?,
        }))
    }

    fn create_qp(
        &self,
        pd: &Arc<dyn ProtectionDomain>,
        attr: &QpInitAttr,
    ) -> Result<Arc<dyn QueuePair>> {
        let pd = Registry::find(&self.reg.pds, pd.handle(), "rdma_create_qp")?;
        let send_cq = Registry::find(&self.reg.cqs, attr.send_cq.handle(), "rdma_create_qp")?;
        let recv_cq = Registry::find(&self.reg.cqs, attr.recv_cq.handle(), "rdma_create_qp")?;

        // SAFETY: all-zero is a valid ibv_qp_init_attr.
        let mut init: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        init.send_cq = send_cq.raw.as_ptr();
        init.recv_cq = recv_cq.raw.as_ptr();
        init.cap.max_send_wr = attr.cap.max_send_wr;
        init.cap.max_recv_wr = attr.cap.max_recv_wr;
        init.cap.max_send_sge = attr.cap.max_send_sge;
        init.cap.max_recv_sge = attr.cap.max_recv_sge;
        init.qp_type = ibv_qp_type::IBV_QPT_RC;

        // SAFETY: live id, PD and CQs; `init` outlives the call.
        let ret = unsafe { rdma_create_qp(self.raw.as_ptr(), pd.raw.as_ptr(), &mut init) };
        Self::check(ret, "rdma_create_qp")?;
        // SAFETY: rdma_create_qp succeeded, so the id carries the queue pair.
        let raw = unsafe { (*self.raw.as_ptr()).qp };
        let raw = NonNull::new(raw).ok_or_else(|| RdmaError::resource("rdma_create_qp", "no qp on id"))?;
        Ok(Arc::new(HwQp {
            raw,
            id: self.this()?,
            _send_cq: send_cq,
            _recv_cq: recv_cq,
            _pd: pd,
        }))
    }
}

/// `ibv_context` of the device an identifier is bound to. Owned by rdma_cm.
pub struct HwDevice {
    ctx: NonNull<ibv_context>,
    name: String,
    reg: Arc<Registry>,
    id: Arc<HwCmId>,
}

unsafe impl Send for HwDevice {}
unsafe impl Sync for HwDevice {}

impl fmt::Debug for HwDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwDevice").field("name", &self.name).finish()
    }
}

impl Device for HwDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc_pd(&self) -> Result<Arc<dyn ProtectionDomain>> {
        // SAFETY: live device context.
        let raw = unsafe { ibv_alloc_pd(self.ctx.as_ptr()) };
        let raw = NonNull::new(raw).ok_or_else(|| os_error("ibv_alloc_pd"))?;
        let pd = Arc::new(HwPd {
            raw,
            reg: self.reg.clone(),
            _id: self.id.clone(),
        });
        self.reg.pds.lock().insert(pd.handle(), Arc::downgrade(&pd));
        Ok(pd)
    }

    fn create_comp_channel(&self) -> Result<Arc<dyn CompChannel>> {
        // SAFETY: live device context.
        let raw = unsafe { ibv_create_comp_channel(self.ctx.as_ptr()) };
        let raw = NonNull::new(raw).ok_or_else(|| os_error("ibv_create_comp_channel"))?;
        let channel = Arc::new(HwCompChannel {
            raw,
            closed: AtomicBool::new(false),
            reg: self.reg.clone(),
            _id: self.id.clone(),
        });
        // SAFETY: live channel.
        set_nonblocking(unsafe { (*raw.as_ptr()).fd })?;
        self.reg
            .channels
            .lock()
            .insert(channel.handle(), Arc::downgrade(&channel));
        Ok(channel)
    }

    fn create_cq(
        &self,
        cqe: u32,
        channel: &Arc<dyn CompChannel>,
    ) -> Result<Arc<dyn CompletionQueue>> {
        let channel = Registry::find(&self.reg.channels, channel.handle(), "ibv_create_cq")?;
        // SAFETY: live context and channel.
        let raw = unsafe {
            ibv_create_cq(
                self.ctx.as_ptr(),
                cqe as c_int,
                ptr::null_mut(),
                channel.raw.as_ptr(),
                0,
            )
        };
        let raw = NonNull::new(raw).ok_or_else(|| os_error("ibv_create_cq"))?;
        let cq = Arc::new(HwCq {
            raw,
            reg: self.reg.clone(),
            _channel: channel,
        });
        self.reg.cqs.lock().insert(cq.handle(), Arc::downgrade(&cq));
        Ok(cq)
    }
}

/// `ibv_pd`.
pub struct HwPd {
    raw: NonNull<ibv_pd>,
    reg: Arc<Registry>,
    _id: Arc<HwCmId>,
}

unsafe impl Send for HwPd {}
unsafe impl Sync for HwPd {}

impl fmt::Debug for HwPd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwPd").field("handle", &self.handle()).finish()
    }
}

impl Drop for HwPd {
    fn drop(&mut self) {
        self.reg.pds.lock().remove(&self.handle());
        // SAFETY: every region and queue pair in the domain held a strong reference.
        if unsafe { ibv_dealloc_pd(self.raw.as_ptr()) } != 0 {
            warn!(error = %io::Error::last_os_error(), "ibv_dealloc_pd");
        }
    }
}

impl ProtectionDomain for HwPd {
    fn handle(&self) -> Handle {
        handle_of(self.raw.as_ptr())
    }

    fn reg_mr(&self, len: usize, access: AccessFlags) -> Result<Arc<dyn MemoryRegion>> {
        let pd = Registry::find(&self.reg.pds, self.handle(), "ibv_reg_mr")?;
        let layout = Layout::from_size_align(len.max(1), PAGE)
            .map_err(|e| RdmaError::resource("ibv_reg_mr", e.to_string()))?;
        // SAFETY: non-zero size.
        let buf = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| RdmaError::resource("ibv_reg_mr", format!("cannot allocate {len} bytes")))?;
        // SAFETY: live PD; `buf` spans `len` bytes and outlives the region.
        let mr = unsafe {
            ibv_reg_mr(
                self.raw.as_ptr(),
                buf.as_ptr().cast(),
                len as _,
                ibv_access(access),
            )
        };
        let Some(mr) = NonNull::new(mr) else {
            let e = os_error("ibv_reg_mr");
            // SAFETY: allocated above with `layout`, never registered.
            unsafe { alloc::dealloc(buf.as_ptr(), layout) };
            return Err(e);
        };
        Ok(Arc::new(HwMr {
            mr,
            buf,
            layout,
            len,
            access,
            _pd: pd,
        }))
    }
}

/// Registered buffer (`ibv_mr` plus the allocation it covers).
pub struct HwMr {
    mr: NonNull<ibv_mr>,
    buf: NonNull<u8>,
    layout: Layout,
    len: usize,
    access: AccessFlags,
    _pd: Arc<HwPd>,
}

unsafe impl Send for HwMr {}
unsafe impl Sync for HwMr {}

impl HwMr {
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

impl fmt::Debug for HwMr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwMr")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("rkey", &self.rkey())
            .finish()
    }
}

impl Drop for HwMr {
    fn drop(&mut self) {
        // SAFETY: registered in `reg_mr` and deregistered only here.
        if unsafe { ibv_dereg_mr(self.mr.as_ptr()) } != 0 {
            warn!(error = %io::Error::last_os_error(), "ibv_dereg_mr");
        }
        // SAFETY: allocated in `reg_mr` with `layout`; the adapter no longer maps it.
        unsafe { alloc::dealloc(self.buf.as_ptr(), self.layout) };
    }
}

impl MemoryRegion for HwMr {
    fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> u32 {
        // SAFETY: live region.
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    fn rkey(&self) -> u32 {
        // SAFETY: live region.
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    fn access(&self) -> AccessFlags {
        self.access
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.bounds(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked against the allocation.
        unsafe { ptr::copy_nonoverlapping(self.buf.as_ptr().add(offset), out.as_mut_ptr(), len) };
        Ok(out)
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.bounds(offset, data.len())?;
        // SAFETY: range checked against the allocation.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.buf.as_ptr().add(offset), data.len())
        };
        Ok(())
    }
}

/// `ibv_comp_channel`.
pub struct HwCompChannel {
    raw: NonNull<ibv_comp_channel>,
    closed: AtomicBool,
    reg: Arc<Registry>,
    _id: Arc<HwCmId>,
}

unsafe impl Send for HwCompChannel {}
unsafe impl Sync for HwCompChannel {}

impl fmt::Debug for HwCompChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwCompChannel")
            .field("handle", &self.handle())
            .finish()
    }
}

impl Drop for HwCompChannel {
    fn drop(&mut self) {
        self.reg.channels.lock().remove(&self.handle());
        // SAFETY: every CQ on the channel held a strong reference.
        if unsafe { ibv_destroy_comp_channel(self.raw.as_ptr()) } != 0 {
            warn!(error = %io::Error::last_os_error(), "ibv_destroy_comp_channel");
        }
    }
}

impl CompChannel for HwCompChannel {
    fn handle(&self) -> Handle {
        handle_of(self.raw.as_ptr())
    }

    fn get_cq_event(&self) -> Result<Option<Handle>> {
        // SAFETY: live channel.
        let fd = unsafe { (*self.raw.as_ptr()).fd };
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if !readable(fd)? {
                continue;
            }
            let mut cq = ptr::null_mut();
            let mut cq_ctx = ptr::null_mut();
            // SAFETY: live channel, out-pointers to locals.
            if unsafe { ibv_get_cq_event(self.raw.as_ptr(), &mut cq, &mut cq_ctx) } != 0 {
                let e = io::Error::last_os_error();
                if retryable(&e) {
                    continue;
                }
                return Err(e.into());
            }
            return Ok(Some(handle_of(cq)));
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// `ibv_cq`.
pub struct HwCq {
    raw: NonNull<ibv_cq>,
    reg: Arc<Registry>,
    _channel: Arc<HwCompChannel>,
}

unsafe impl Send for HwCq {}
unsafe impl Sync for HwCq {}

impl fmt::Debug for HwCq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwCq").field("handle", &self.handle()).finish()
    }
}

impl Drop for HwCq {
    fn drop(&mut self) {
        self.reg.cqs.lock().remove(&self.handle());
        // SAFETY: queue pairs using the CQ held strong references; the
        // completion loop acknowledged every event it took.
        if unsafe { ibv_destroy_cq(self.raw.as_ptr()) } != 0 {
            warn!(error = %io::Error::last_os_error(), "ibv_destroy_cq");
        }
    }
}

impl CompletionQueue for HwCq {
    fn handle(&self) -> Handle {
        handle_of(self.raw.as_ptr())
    }

    fn req_notify(&self) -> Result<()> {
        // SAFETY: live CQ.
        let ret = unsafe { ibv_req_notify_cq(self.raw.as_ptr(), 0) };
        if ret != 0 {
            return Err(RdmaError::resource(
                "ibv_req_notify_cq",
                io::Error::from_raw_os_error(ret).to_string(),
            ));
        }
        Ok(())
    }

    fn poll(&self) -> Result<Option<WorkCompletion>> {
        // SAFETY: all-zero is a valid ibv_wc.
        let mut wc: ibv_wc = unsafe { std::mem::zeroed() };
        // SAFETY: live CQ, room for one entry.
        let n = unsafe { ibv_poll_cq(self.raw.as_ptr(), 1, &mut wc) };
        if n < 0 {
            return Err(RdmaError::resource("ibv_poll_cq", format!("returned {n}")));
        }
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(WorkCompletion {
            wr_id: wc.wr_id,
            status: wc_status(wc.status),
            opcode: wc_opcode(wc.opcode),
            byte_len: wc.byte_len,
            qp_num: wc.qp_num,
        }))
    }

    fn ack_events(&self, count: u32) {
        // SAFETY: live CQ; `count` events were taken from its channel.
        unsafe { ibv_ack_cq_events(self.raw.as_ptr(), count) };
    }
}

/// Reliable-connected `ibv_qp` owned by its identifier.
pub struct HwQp {
    raw: NonNull<ibv_qp>,
    id: Arc<HwCmId>,
    _send_cq: Arc<HwCq>,
    _recv_cq: Arc<HwCq>,
    _pd: Arc<HwPd>,
}

unsafe impl Send for HwQp {}
unsafe impl Sync for HwQp {}

impl fmt::Debug for HwQp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwQp").field("qp_num", &self.qp_num()).finish()
    }
}

impl Drop for HwQp {
    fn drop(&mut self) {
        // SAFETY: the id still owns the queue pair; nothing posts on it any more.
        unsafe { rdma_destroy_qp(self.id.raw.as_ptr()) };
    }
}

impl QueuePair for HwQp {
    fn qp_num(&self) -> u32 {
        // SAFETY: live queue pair.
        unsafe { (*self.raw.as_ptr()).qp_num }
    }

    fn post_send(&self, wr: &SendWr) -> Result<()> {
        let mut sge = ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        // SAFETY: all-zero is a valid ibv_send_wr.
        let mut sr: ibv_send_wr = unsafe { std::mem::zeroed() };
        sr.wr_id = wr.wr_id;
        sr.sg_list = &mut sge;
        sr.num_sge = 1;
        if wr.signaled {
            sr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        match wr.op {
            SendOp::Send => sr.opcode = ibv_wr_opcode::IBV_WR_SEND,
            SendOp::RdmaRead { remote_addr, rkey } => {
                sr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
                sr.wr.rdma.remote_addr = remote_addr;
                sr.wr.rdma.rkey = rkey;
            }
            SendOp::RdmaWrite { remote_addr, rkey } => {
                sr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
                sr.wr.rdma.remote_addr = remote_addr;
                sr.wr.rdma.rkey = rkey;
            }
        }
        let mut bad = ptr::null_mut();
        // SAFETY: live queue pair; `sr` and `sge` outlive the call.
        let ret = unsafe { ibv_post_send(self.raw.as_ptr(), &mut sr, &mut bad) };
        if ret != 0 {
            return Err(RdmaError::Post {
                op: "send",
                reason: io::Error::from_raw_os_error(ret).to_string(),
            });
        }
        Ok(())
    }

    fn post_recv(&self, wr: &RecvWr) -> Result<()> {
        let mut sge = ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        // SAFETY: all-zero is a valid ibv_recv_wr.
        let mut rr: ibv_recv_wr = unsafe { std::mem::zeroed() };
        rr.wr_id = wr.wr_id;
        rr.sg_list = &mut sge;
        rr.num_sge = 1;
        let mut bad = ptr::null_mut();
        // SAFETY: live queue pair; `rr` and `sge` outlive the call.
        let ret = unsafe { ibv_post_recv(self.raw.as_ptr(), &mut rr, &mut bad) };
        if ret != 0 {
            return Err(RdmaError::Post {
                op: "recv",
                reason: io::Error::from_raw_os_error(ret).to_string(),
            });
        }
        Ok(())
    }
}
