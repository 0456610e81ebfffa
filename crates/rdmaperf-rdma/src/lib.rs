#![warn(missing_docs)]

//! rdmaperf RDMA subsystem: connection state machine, buffer rendezvous, verbs resource lifecycle
//!
//! This crate is the transport core of a bandwidth tester. Two peers swap a
//! 20-byte buffer descriptor over a two-sided send, then one of them moves
//! the bulk data with a one-sided RDMA read or write. Each connection runs
//! a connection-manager loop and a completion loop that hand transitions to
//! the worker through a per-connection rendezvous. The verbs layer is a set
//! of traits; [`sim::SimFabric`] implements them in process, and with the
//! `hardware` feature `hw::HwProvider` implements them over rdma-core.

pub mod cm_loop;
pub mod config;
pub mod context;
pub mod control;
pub mod cq_loop;
pub mod echo;
pub mod error;
#[cfg(feature = "hardware")]
pub mod hw;
pub mod metrics;
pub mod pending;
pub mod rendezvous;
pub mod resources;
pub mod sim;
pub mod state;
pub mod transfer;
pub mod verbs;
pub mod wire;

pub use config::RdmaConfig;
pub use context::{ConnContext, ContextMap, RemoteBuffer};
pub use control::ConnectionControl;
pub use error::{RdmaError, Result};
#[cfg(feature = "hardware")]
pub use hw::HwProvider;
pub use metrics::{MetricsSnapshot, TransferMetrics};
pub use pending::{PendingConnection, PendingConnections};
pub use rendezvous::{Rendezvous, Wake, WakeCause};
pub use sim::{FaultPlan, SimFabric};
pub use state::{ConnState, Role};
pub use verbs::{CmEventKind, RdmaProvider};
pub use wire::{BufferDescriptor, TransferMode, WireMode, DESCRIPTOR_LEN};
