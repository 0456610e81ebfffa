//! Connection-manager and verbs object model.
//!
//! One trait per rdma_cm / ibverbs object the transport touches. Objects are
//! shared as `Arc<dyn ...>`; releasing an object is dropping its last
//! handle, and every object keeps the objects it was created from alive
//! (queue pair → completion queue and protection domain, completion queue →
//! completion channel, memory region → protection domain).
//!
//! Two providers implement these traits: [`crate::sim::SimFabric`] in
//! process, and `hw::HwProvider` over librdmacm/libibverbs when the
//! `hardware` feature is enabled.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque identifier of a verbs or connection-manager object.
pub type Handle = u64;

/// Connection-manager event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmEventKind {
    /// Address resolution finished.
    AddrResolved,
    /// Address resolution failed.
    AddrError,
    /// Route resolution finished.
    RouteResolved,
    /// Route resolution failed.
    RouteError,
    /// A peer asked to connect to a listening identifier.
    ConnectRequest,
    /// Reply to a connect on unreliable-datagram identifiers.
    ConnectResponse,
    /// Connection could not be set up.
    ConnectError,
    /// The remote side is unreachable.
    Unreachable,
    /// The remote side rejected the request.
    Rejected,
    /// The connection is up.
    Established,
    /// The connection was torn down.
    Disconnected,
    /// The underlying device went away.
    DeviceRemoval,
    /// Multicast join finished.
    MulticastJoin,
    /// Multicast join failed.
    MulticastError,
    /// The local address changed.
    AddrChange,
    /// Queue pair left timewait.
    TimewaitExit,
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmEventKind::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventKind::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventKind::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventKind::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventKind::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventKind::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventKind::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventKind::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventKind::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventKind::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventKind::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventKind::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventKind::MulticastJoin => "RDMA_CM_EVENT_MULTICAST_JOIN",
            CmEventKind::MulticastError => "RDMA_CM_EVENT_MULTICAST_ERROR",
            CmEventKind::AddrChange => "RDMA_CM_EVENT_ADDR_CHANGE",
            CmEventKind::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
        };
        f.write_str(name)
    }
}

/// One event read from a [`CmEventChannel`].
#[derive(Debug, Clone)]
pub struct CmEvent {
    /// Event kind.
    pub kind: CmEventKind,
    /// Identifier the event is about. For `ConnectRequest` this is the new child.
    pub id: Arc<dyn CmId>,
    /// Listening identifier the child was created from, for `ConnectRequest`.
    pub listen_id: Option<Handle>,
    /// Provider status; zero on success.
    pub status: i32,
}

/// Parameters carried by connect and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    /// Outstanding RDMA reads the peer may issue against us.
    pub responder_resources: u8,
    /// Outstanding RDMA reads we may issue.
    pub initiator_depth: u8,
    /// Transport retries before reporting an error.
    pub retry_count: u8,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 10,
        }
    }
}

/// Memory region access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// The local adapter may write the region.
    pub const LOCAL_WRITE: Self = Self(1);
    /// A remote peer may write the region.
    pub const REMOTE_WRITE: Self = Self(2);
    /// A remote peer may read the region.
    pub const REMOTE_READ: Self = Self(4);

    /// No access beyond local reads by the adapter.
    pub fn empty() -> Self {
        Self(0)
    }

    /// True when every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Raw bit pattern.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Queue pair capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCap {
    /// Send queue depth.
    pub max_send_wr: u32,
    /// Receive queue depth.
    pub max_recv_wr: u32,
    /// Scatter-gather entries per send.
    pub max_send_sge: u32,
    /// Scatter-gather entries per receive.
    pub max_recv_sge: u32,
}

/// Queue pair creation attributes. The transport only creates reliable-connected pairs.
#[derive(Debug, Clone)]
pub struct QpInitAttr {
    /// Completion queue for sends and RDMA operations.
    pub send_cq: Arc<dyn CompletionQueue>,
    /// Completion queue for receives.
    pub recv_cq: Arc<dyn CompletionQueue>,
    /// Capacities.
    pub cap: QpCap,
}

/// Scatter-gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Local virtual address.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the region containing the range.
    pub lkey: u32,
}

/// Operation of a send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    /// Two-sided send.
    Send,
    /// Read from the remote range into the local one.
    RdmaRead {
        /// Remote virtual address.
        remote_addr: u64,
        /// Remote key.
        rkey: u32,
    },
    /// Write the local range to the remote one.
    RdmaWrite {
        /// Remote virtual address.
        remote_addr: u64,
        /// Remote key.
        rkey: u32,
    },
}

/// Send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    /// Caller cookie returned in the completion.
    pub wr_id: u64,
    /// Local buffer.
    pub sge: Sge,
    /// Operation.
    pub op: SendOp,
    /// Generate a completion on success.
    pub signaled: bool,
}

/// Receive-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    /// Caller cookie returned in the completion.
    pub wr_id: u64,
    /// Buffer the incoming message lands in.
    pub sge: Sge,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcStatus {
    /// Completed successfully.
    Success,
    /// Message longer than the receive buffer.
    LocalLengthError,
    /// Local buffer not covered by the given key.
    LocalProtectionError,
    /// Work request flushed because the queue pair left the connected state.
    WrFlushError,
    /// Remote key, access rights or bounds rejected by the responder.
    RemoteAccessError,
    /// Transport retries exhausted.
    RetryExceeded,
    /// Any other failure.
    General,
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcOpcode {
    /// Two-sided send.
    Send,
    /// RDMA write.
    RdmaWrite,
    /// RDMA read.
    RdmaRead,
    /// Atomic compare and swap.
    CompSwap,
    /// Atomic fetch and add.
    FetchAdd,
    /// Memory window bind.
    BindMw,
    /// Two-sided receive.
    Recv,
    /// Receive of an RDMA write with immediate data.
    RecvRdmaWithImm,
    /// Any other provider opcode, by raw value.
    Other(u32),
}

/// One entry polled from a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Cookie of the finished work request.
    pub wr_id: u64,
    /// Outcome.
    pub status: WcStatus,
    /// Which operation finished.
    pub opcode: WcOpcode,
    /// Bytes transferred (receives and RDMA reads).
    pub byte_len: u32,
    /// Local queue pair number.
    pub qp_num: u32,
}

/// Entry point into an RDMA stack.
pub trait RdmaProvider: Send + Sync + fmt::Debug {
    /// Create a connection-manager event channel.
    fn create_event_channel(&self) -> Result<Arc<dyn CmEventChannel>>;
}

/// Connection-manager event channel (`rdma_event_channel`).
pub trait CmEventChannel: Send + Sync + fmt::Debug {
    /// Handle of the channel.
    fn handle(&self) -> Handle;
    /// Create a reliable-connected identifier whose events arrive on this channel.
    fn create_id(&self) -> Result<Arc<dyn CmId>>;
    /// Block for the next event. `Ok(None)` once the channel was shut down.
    fn get_event(&self) -> Result<Option<CmEvent>>;
    /// Release an event returned by [`CmEventChannel::get_event`].
    fn ack_event(&self, event: &CmEvent);
    /// Wake every blocked reader and make further reads return `None`.
    fn shutdown(&self);
}

/// Connection-manager identifier (`rdma_cm_id`).
pub trait CmId: Send + Sync + fmt::Debug {
    /// Handle used to route events to their connection.
    fn handle(&self) -> Handle;
    /// Start resolving `dst`; completes with `AddrResolved` or `AddrError`.
    fn resolve_addr(&self, dst: SocketAddr, timeout: Duration) -> Result<()>;
    /// Start resolving the route; completes with `RouteResolved` or `RouteError`.
    fn resolve_route(&self, timeout: Duration) -> Result<()>;
    /// Bind to `addr` and listen for connection requests.
    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<()>;
    /// Active open; completes with `Established` or an error event.
    fn connect(&self, params: &ConnParams) -> Result<()>;
    /// Accept a child identifier delivered by `ConnectRequest`.
    fn accept(&self, params: &ConnParams) -> Result<()>;
    /// Tear the connection down; both sides see `Disconnected`.
    fn disconnect(&self) -> Result<()>;
    /// Device context the identifier is bound to.
    fn verbs(&self) -> Result<Arc<dyn Device>>;
    /// Create the identifier's reliable-connected queue pair.
    fn create_qp(
        &self,
        pd: &Arc<dyn ProtectionDomain>,
        attr: &QpInitAttr,
    ) -> Result<Arc<dyn QueuePair>>;
}

/// Device context (`ibv_context`).
pub trait Device: Send + Sync + fmt::Debug {
    /// Device name.
    fn name(&self) -> &str;
    /// Allocate a protection domain.
    fn alloc_pd(&self) -> Result<Arc<dyn ProtectionDomain>>;
    /// Create a completion event channel.
    fn create_comp_channel(&self) -> Result<Arc<dyn CompChannel>>;
    /// Create a completion queue of `cqe` entries reporting to `channel`.
    fn create_cq(&self, cqe: u32, channel: &Arc<dyn CompChannel>)
        -> Result<Arc<dyn CompletionQueue>>;
}

/// Protection domain (`ibv_pd`).
pub trait ProtectionDomain: Send + Sync + fmt::Debug {
    /// Handle of the domain.
    fn handle(&self) -> Handle;
    /// Allocate and register a zeroed buffer of `len` bytes.
    fn reg_mr(&self, len: usize, access: AccessFlags) -> Result<Arc<dyn MemoryRegion>>;
}

/// Registered memory region owning its buffer (`ibv_mr`).
pub trait MemoryRegion: Send + Sync + fmt::Debug {
    /// Virtual address of the first byte.
    fn addr(&self) -> u64;
    /// Length in bytes.
    fn len(&self) -> usize;
    /// True for a zero-length region.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Local key.
    fn lkey(&self) -> u32;
    /// Remote key.
    fn rkey(&self) -> u32;
    /// Access rights it was registered with.
    fn access(&self) -> AccessFlags;
    /// Copy `len` bytes starting at `offset` out of the region.
    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>>;
    /// Copy `data` into the region at `offset`.
    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Completion event channel (`ibv_comp_channel`).
pub trait CompChannel: Send + Sync + fmt::Debug {
    /// Handle of the channel.
    fn handle(&self) -> Handle;
    /// Block until an armed queue signals; returns that queue's handle.
    /// `Ok(None)` once the channel was shut down.
    fn get_cq_event(&self) -> Result<Option<Handle>>;
    /// Wake every blocked reader and make further reads return `None`.
    fn shutdown(&self);
}

/// Completion queue (`ibv_cq`).
pub trait CompletionQueue: Send + Sync + fmt::Debug {
    /// Handle of the queue.
    fn handle(&self) -> Handle;
    /// Arm one notification for the next completion.
    fn req_notify(&self) -> Result<()>;
    /// Take the oldest completion, if any.
    fn poll(&self) -> Result<Option<WorkCompletion>>;
    /// Acknowledge `count` channel events.
    fn ack_events(&self, count: u32);
}

/// Queue pair (`ibv_qp`).
pub trait QueuePair: Send + Sync + fmt::Debug {
    /// Queue pair number.
    fn qp_num(&self) -> u32;
    /// Post to the send queue.
    fn post_send(&self, wr: &SendWr) -> Result<()>;
    /// Post to the receive queue.
    fn post_recv(&self, wr: &RecvWr) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_flags() {
        let bulk = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        assert!(bulk.contains(AccessFlags::REMOTE_WRITE));
        assert!(!AccessFlags::LOCAL_WRITE.contains(AccessFlags::REMOTE_READ));
        assert!(bulk.contains(AccessFlags::empty()));
        assert_eq!(AccessFlags::default().bits(), 0);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            CmEventKind::ConnectRequest.to_string(),
            "RDMA_CM_EVENT_CONNECT_REQUEST"
        );
        assert_eq!(
            CmEventKind::DeviceRemoval.to_string(),
            "RDMA_CM_EVENT_DEVICE_REMOVAL"
        );
    }

    #[test]
    fn test_default_conn_params() {
        let p = ConnParams::default();
        assert_eq!(p.responder_resources, 1);
        assert_eq!(p.initiator_depth, 1);
        assert_eq!(p.retry_count, 10);
    }
}
