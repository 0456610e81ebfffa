//! Error types for the RDMA transport core.

use thiserror::Error;

use crate::state::ConnState;
use crate::verbs::{CmEventKind, WcOpcode, WcStatus};

/// Result type alias for RDMA transport operations.
pub type Result<T> = std::result::Result<T, RdmaError>;

/// Error variants for the RDMA transport core.
#[derive(Debug, Error)]
pub enum RdmaError {
    /// A verbs or connection-manager object could not be created.
    #[error("{op} failed: {reason}")]
    Resource {
        /// The verbs call that failed (e.g. "ibv_alloc_pd").
        op: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// Posting a work request was refused by the queue pair.
    #[error("post {op} error: {reason}")]
    Post {
        /// Which post failed ("send" or "recv").
        op: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// A receive completed with a payload that is not a buffer descriptor.
    #[error("received bogus data, size {got} (expected {expected})")]
    BadMessageSize {
        /// Bytes actually received.
        got: u32,
        /// Size of the buffer descriptor.
        expected: u32,
    },

    /// The completion queue reported an opcode the core does not handle.
    #[error("unknown completion opcode {0:?}")]
    UnknownOpcode(WcOpcode),

    /// A work completion finished with an error status.
    #[error("cq completion failed status {status:?} (wr_id {wr_id})")]
    CompletionFailed {
        /// The completion status.
        status: WcStatus,
        /// Work request that failed.
        wr_id: u64,
    },

    /// The completion channel signalled a queue that does not belong to this connection.
    #[error("unknown completion queue {0}")]
    UnknownCq(u64),

    /// A fatal connection-manager event was delivered.
    #[error("cma event {event}, error {status}")]
    CmEvent {
        /// The event kind.
        event: CmEventKind,
        /// Status reported with the event.
        status: i32,
    },

    /// The RDMA device backing the connection was removed.
    #[error("cma detected device removal")]
    DeviceRemoved,

    /// A rendezvous woke up in a state other than the one it waited for.
    #[error("wait for {expected} state, found {found}")]
    StateMismatch {
        /// State the waiter required.
        expected: ConnState,
        /// State observed after waking.
        found: ConnState,
    },

    /// The peer disconnected while a transfer was waiting on it.
    #[error("peer disconnected while waiting for {expected} state")]
    Disconnected {
        /// State the waiter required.
        expected: ConnState,
    },

    /// The peer advertised more bytes than the local bulk buffer holds.
    #[error("remote length {remote_len} exceeds local buffer of {capacity} bytes")]
    RemoteTooLarge {
        /// Advertised remote length.
        remote_len: u32,
        /// Local registered capacity.
        capacity: usize,
    },

    /// An operation was invoked before the resources it needs were set up.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// Wraps standard I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RdmaError {
    /// Shorthand for a resource-acquisition failure.
    pub fn resource(op: &'static str, reason: impl Into<String>) -> Self {
        RdmaError::Resource {
            op,
            reason: reason.into(),
        }
    }

    /// Negative errno-style code handed back to the application in place of a byte count.
    pub fn code(&self) -> i32 {
        let errno = match self {
            RdmaError::Resource { .. } => libc::ENOMEM,
            RdmaError::Post { .. } => libc::EINVAL,
            RdmaError::BadMessageSize { .. } | RdmaError::UnknownOpcode(_) => libc::EPROTO,
            RdmaError::CompletionFailed { .. } | RdmaError::UnknownCq(_) => libc::EIO,
            RdmaError::CmEvent { .. } => libc::ECONNREFUSED,
            RdmaError::DeviceRemoved => libc::ENODEV,
            RdmaError::StateMismatch { .. } => libc::EPROTO,
            RdmaError::Disconnected { .. } => libc::ENOTCONN,
            RdmaError::RemoteTooLarge { .. } => libc::EMSGSIZE,
            RdmaError::NotReady(_) => libc::ENOTCONN,
            RdmaError::Config(_) => libc::EINVAL,
            RdmaError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        -errno
    }
}
