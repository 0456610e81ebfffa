//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rdmaperf_rdma::{
    ConnectionControl, PendingConnections, RdmaConfig, RdmaProvider, SimFabric, TransferMode,
};
use tracing_subscriber::EnvFilter;

/// Port every fixture listens on; each fixture has its own fabric.
pub const PORT: u16 = 7471;

/// Install a test-friendly subscriber once. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration with a given size and mode, defaults otherwise.
pub fn config(size: usize, mode: TransferMode) -> RdmaConfig {
    RdmaConfig {
        size,
        mode,
        ..Default::default()
    }
}

/// Accept the next queued connection request on a background thread.
pub fn spawn_acceptor(
    pending: &PendingConnections,
    server_cfg: RdmaConfig,
    provider: &Arc<dyn RdmaProvider>,
) -> JoinHandle<ConnectionControl> {
    let pending = pending.clone();
    let provider = provider.clone();
    thread::spawn(move || {
        let conn = pending
            .pop_timeout(Duration::from_secs(10))
            .expect("no connection request");
        let mut server = ConnectionControl::accepted(conn, server_cfg, provider).unwrap();
        server.setup().unwrap();
        server.setup_qp().unwrap();
        server.setup_buffers().unwrap();
        server.accept().unwrap();
        server
    })
}

/// A connected client and accepted server on one simulated fabric.
pub struct Pair {
    pub client: ConnectionControl,
    pub server: ConnectionControl,
    pub listener: ConnectionControl,
    pub pending: PendingConnections,
    pub fabric: SimFabric,
}

impl Pair {
    /// Listen, connect and accept with the given per-side configuration.
    pub fn connect(client_cfg: RdmaConfig, server_cfg: RdmaConfig) -> Pair {
        init_tracing();
        let fabric = SimFabric::new();
        let provider: Arc<dyn RdmaProvider> = Arc::new(fabric.clone());
        let pending = PendingConnections::new();

        let mut listener =
            ConnectionControl::server(server_cfg.clone(), provider.clone(), pending.clone())
                .unwrap();
        listener.setup().unwrap();
        listener
            .listen(SocketAddr::from(([0, 0, 0, 0], PORT)))
            .unwrap();

        let acceptor = spawn_acceptor(&pending, server_cfg, &provider);

        let mut client = ConnectionControl::client(client_cfg, provider).unwrap();
        client.setup().unwrap();
        client
            .resolve(SocketAddr::from(([127, 0, 0, 1], PORT)))
            .unwrap();
        client.setup_qp().unwrap();
        client.setup_buffers().unwrap();
        client.connect().unwrap();

        let server = acceptor.join().unwrap();
        Pair {
            client,
            server,
            listener,
            pending,
            fabric,
        }
    }

    /// Run one transfer on both sides concurrently. Returns (client, server) results.
    pub fn round(&self) -> (i64, i64) {
        thread::scope(|s| {
            let server = s.spawn(|| self.server.run_transfer());
            let client = self.client.run_transfer();
            (client, server.join().unwrap())
        })
    }
}
