//! Connection roles, protocol states and the atomic state holder.
//!
//! A connection's state is written from three contexts (the worker, the
//! connection-manager loop and the completion loop). [`StateCell`] keeps it in
//! a single atomic so every transition is a load, store or compare-and-set;
//! `Error` is terminal and no transition leaves it.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Which side of the connection this control block drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Passive side: listens, accepts and performs the RDMA operations.
    Server,
    /// Active side: resolves, connects and advertises buffers.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Protocol state of one connection.
///
/// The discriminants define the forward-progress order; the receive rules
/// compare against it (`state <= Connected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnState {
    /// Freshly created, nothing resolved yet.
    Init = 0,
    /// Server side: a connection request arrived.
    ConnectRequest = 1,
    /// Client side: destination address resolved.
    AddrResolved = 2,
    /// Client side: route to the destination resolved.
    RouteResolved = 3,
    /// Connection established.
    Connected = 4,
    /// A buffer was advertised for the peer to read.
    ReadAdv = 5,
    /// The RDMA read finished.
    ReadComplete = 6,
    /// A buffer was advertised for the peer to write.
    WriteAdv = 7,
    /// The RDMA write finished.
    WriteComplete = 8,
    /// Unrecoverable failure.
    Error = 9,
}

impl ConnState {
    /// Decode from the raw atomic representation.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Init,
            1 => ConnState::ConnectRequest,
            2 => ConnState::AddrResolved,
            3 => ConnState::RouteResolved,
            4 => ConnState::Connected,
            5 => ConnState::ReadAdv,
            6 => ConnState::ReadComplete,
            7 => ConnState::WriteAdv,
            8 => ConnState::WriteComplete,
            _ => ConnState::Error,
        }
    }

    /// True once the connection can carry transfers.
    pub fn is_data_phase(self) -> bool {
        self >= ConnState::Connected && self != ConnState::Error
    }

    /// Next state after a buffer descriptor arrives.
    pub fn after_receive(self, role: Role) -> ConnState {
        match role {
            Role::Server => {
                if self <= ConnState::Connected || self == ConnState::WriteComplete {
                    ConnState::ReadAdv
                } else {
                    ConnState::WriteAdv
                }
            }
            Role::Client => {
                if self == ConnState::ReadAdv {
                    ConnState::WriteAdv
                } else {
                    ConnState::WriteComplete
                }
            }
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Init => "INIT",
            ConnState::ConnectRequest => "CONNECT_REQUEST",
            ConnState::AddrResolved => "ADDR_RESOLVED",
            ConnState::RouteResolved => "ROUTE_RESOLVED",
            ConnState::Connected => "CONNECTED",
            ConnState::ReadAdv => "RDMA_READ_ADV",
            ConnState::ReadComplete => "RDMA_READ_COMPLETE",
            ConnState::WriteAdv => "RDMA_WRITE_ADV",
            ConnState::WriteComplete => "RDMA_WRITE_COMPLETE",
            ConnState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a [`ConnState`].
#[derive(Debug)]
pub struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    /// Create a cell holding `initial`.
    pub fn new(initial: ConnState) -> Self {
        Self {
            raw: AtomicU8::new(initial as u8),
        }
    }

    /// Current state.
    pub fn load(&self) -> ConnState {
        ConnState::from_u8(self.raw.load(Ordering::SeqCst))
    }

    /// Move to `next` unless the connection already failed.
    /// Returns the state that was replaced.
    pub fn set(&self, next: ConnState) -> ConnState {
        self.update(|_| Some(next))
    }

    /// Move from exactly `current` to `next`.
    pub fn compare_exchange(&self, current: ConnState, next: ConnState) -> Result<(), ConnState> {
        self.raw
            .compare_exchange(current as u8, next as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConnState::from_u8)
    }

    /// Force the terminal error state. Returns the previous state.
    pub fn fail(&self) -> ConnState {
        ConnState::from_u8(self.raw.swap(ConnState::Error as u8, Ordering::SeqCst))
    }

    /// Apply the role's receive rule atomically. Returns the new state.
    pub fn on_receive(&self, role: Role) -> ConnState {
        let prev = self.update(|s| Some(s.after_receive(role)));
        if prev == ConnState::Error {
            ConnState::Error
        } else {
            prev.after_receive(role)
        }
    }

    /// Server active-write entry: a descriptor that already arrived (`ReadAdv`)
    /// is consumed directly into `WriteAdv`; otherwise the state is parked at
    /// `ReadComplete` so the coming receive advances it to `WriteAdv`.
    /// Returns true when the descriptor was already there.
    pub fn begin_write_wait(&self) -> bool {
        loop {
            let current = self.load();
            if current == ConnState::Error {
                return false;
            }
            let next = if current == ConnState::ReadAdv {
                ConnState::WriteAdv
            } else {
                ConnState::ReadComplete
            };
            if self.compare_exchange(current, next).is_ok() {
                return current == ConnState::ReadAdv;
            }
        }
    }

    fn update(&self, mut f: impl FnMut(ConnState) -> Option<ConnState>) -> ConnState {
        let prev = self
            .raw
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                let current = ConnState::from_u8(raw);
                if current == ConnState::Error {
                    return None;
                }
                f(current).map(|s| s as u8)
            })
            .unwrap_or_else(|raw| raw);
        ConnState::from_u8(prev)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnState::Init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_receive_rule() {
        for s in [
            ConnState::Init,
            ConnState::ConnectRequest,
            ConnState::Connected,
            ConnState::WriteComplete,
        ] {
            assert_eq!(s.after_receive(Role::Server), ConnState::ReadAdv, "from {s}");
        }
        for s in [ConnState::ReadAdv, ConnState::ReadComplete, ConnState::WriteAdv] {
            assert_eq!(s.after_receive(Role::Server), ConnState::WriteAdv, "from {s}");
        }
    }

    #[test]
    fn test_client_receive_rule() {
        assert_eq!(ConnState::ReadAdv.after_receive(Role::Client), ConnState::WriteAdv);
        assert_eq!(ConnState::WriteAdv.after_receive(Role::Client), ConnState::WriteComplete);
        assert_eq!(ConnState::Connected.after_receive(Role::Client), ConnState::WriteComplete);
    }

    #[test]
    fn test_error_is_terminal() {
        let cell = StateCell::new(ConnState::Connected);
        assert_eq!(cell.fail(), ConnState::Connected);
        cell.set(ConnState::WriteAdv);
        assert_eq!(cell.load(), ConnState::Error);
        assert_eq!(cell.on_receive(Role::Server), ConnState::Error);
        assert!(!cell.begin_write_wait());
        assert_eq!(cell.load(), ConnState::Error);
    }

    #[test]
    fn test_begin_write_wait_direct() {
        let cell = StateCell::new(ConnState::ReadAdv);
        assert!(cell.begin_write_wait());
        assert_eq!(cell.load(), ConnState::WriteAdv);
    }

    #[test]
    fn test_begin_write_wait_parks_until_receive() {
        let cell = StateCell::new(ConnState::WriteComplete);
        assert!(!cell.begin_write_wait());
        assert_eq!(cell.load(), ConnState::ReadComplete);
        assert_eq!(cell.on_receive(Role::Server), ConnState::WriteAdv);
    }

    #[test]
    fn test_compare_exchange_reports_current() {
        let cell = StateCell::new(ConnState::Connected);
        assert_eq!(
            cell.compare_exchange(ConnState::Init, ConnState::ReadAdv),
            Err(ConnState::Connected)
        );
        assert!(cell.compare_exchange(ConnState::Connected, ConnState::ReadAdv).is_ok());
    }

    #[test]
    fn test_raw_round_trip() {
        for raw in 0u8..=9 {
            assert_eq!(ConnState::from_u8(raw) as u8, raw);
        }
        assert_eq!(ConnState::from_u8(200), ConnState::Error);
    }
}
