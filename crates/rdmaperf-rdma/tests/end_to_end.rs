//! End-to-end transfers between a client and an accepted server.
//!
//! Both sides run their full stack (connection-manager loop, completion
//! loop, rendezvous, handlers) over one simulated fabric.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{config, spawn_acceptor, Pair};
use rdmaperf_rdma::resources::QpResources;
use rdmaperf_rdma::sim::{RdmaOpKind, ResourceEvent, ResourceKind};
use rdmaperf_rdma::verbs::{AccessFlags, ConnParams, SendOp, SendWr, Sge, WcStatus};
use rdmaperf_rdma::{
    CmEventKind, ConnState, ConnectionControl, PendingConnections, RdmaConfig, RdmaError,
    RdmaProvider, RemoteBuffer, SimFabric, TransferMode,
};

#[test]
fn test_passive_write_against_active_write() {
    let pair = Pair::connect(
        config(4096, TransferMode::PassiveWrite),
        config(4096, TransferMode::ActiveWrite),
    );
    let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    pair.server
        .buffers()
        .unwrap()
        .rdma
        .write_bytes(0, &pattern)
        .unwrap();

    let (client, server) = pair.round();
    assert_eq!(client, 4096);
    assert_eq!(server, 4096);

    let client_rdma = &pair.client.buffers().unwrap().rdma;
    let ops = pair.fabric.rdma_ops();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op, RdmaOpKind::Write);
    assert_eq!(ops[0].remote_addr, client_rdma.addr());
    assert_eq!(ops[0].rkey, client_rdma.rkey());
    assert_eq!(ops[0].length, 4096);
    assert_eq!(ops[0].status, WcStatus::Success);
    assert_eq!(client_rdma.read_bytes(0, 4096).unwrap(), pattern);

    assert_eq!(pair.client.state(), ConnState::WriteComplete);
    assert_eq!(pair.server.state(), ConnState::WriteComplete);
}

#[test]
fn test_active_read_returns_client_length() {
    let pair = Pair::connect(
        config(1024, TransferMode::PassiveRead),
        config(8192, TransferMode::ActiveRead),
    );
    let start = pair.client.buffers().unwrap().start.clone().unwrap();
    start.write_bytes(0, b"hello rdma").unwrap();

    let (client, server) = pair.round();
    assert_eq!(client, 1024);
    assert_eq!(server, 1024);

    let ops = pair.fabric.rdma_ops();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op, RdmaOpKind::Read);
    assert_eq!(ops[0].remote_addr, start.addr());
    assert_eq!(ops[0].rkey, start.rkey());
    assert_eq!(ops[0].length, 1024);

    let landed = pair.server.buffers().unwrap().rdma.read_bytes(0, 10).unwrap();
    assert_eq!(&landed, b"hello rdma");
    assert_eq!(pair.client.state(), ConnState::WriteAdv);
    assert_eq!(pair.server.state(), ConnState::ReadComplete);
}

#[test]
fn test_modes_are_translated_from_the_peer() {
    let pair = Pair::connect(
        config(2048, TransferMode::PassiveWrite),
        config(2048, TransferMode::ActiveWrite),
    );
    pair.round();
    assert_eq!(pair.server.ctx().trans_mode(), TransferMode::ActiveWrite);
    assert_eq!(pair.client.ctx().trans_mode(), TransferMode::PassiveWrite);
    let remote = pair.client.ctx().remote();
    assert_eq!(remote.rkey, pair.server.buffers().unwrap().rdma.rkey());
    assert_eq!(remote.len, 2048);
}

#[test]
fn test_repeated_rounds() {
    let pair = Pair::connect(
        config(4096, TransferMode::PassiveWrite),
        config(4096, TransferMode::ActiveWrite),
    );
    for _ in 0..5 {
        assert_eq!(pair.round(), (4096, 4096));
    }
    assert_eq!(pair.fabric.rdma_ops().len(), 5);

    let client = pair.client.ctx().metrics().snapshot();
    assert_eq!(client.transfers_completed, 5);
    assert_eq!(client.bytes_transferred, 5 * 4096);
    assert_eq!(client.sends_posted, 5);
    assert_eq!(client.recvs_completed, 5);

    let server = pair.server.ctx().metrics().snapshot();
    assert_eq!(server.rdma_writes_posted, 5);
    assert_eq!(server.sends_posted, 5);
    assert_eq!(pair.server.ctx().rendezvous().pending(), 0);
    assert_eq!(pair.client.ctx().rendezvous().pending(), 0);
}

#[test]
fn test_repeated_read_rounds() {
    let pair = Pair::connect(
        config(512, TransferMode::PassiveRead),
        config(512, TransferMode::ActiveRead),
    );
    for _ in 0..3 {
        assert_eq!(pair.round(), (512, 512));
    }
    let reads = pair
        .fabric
        .rdma_ops()
        .iter()
        .filter(|op| op.op == RdmaOpKind::Read)
        .count();
    assert_eq!(reads, 3);
}

#[test]
fn test_received_data_is_echoed_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("received.bin");
    let server_cfg = RdmaConfig {
        output_file: Some(out.clone()),
        ..config(64, TransferMode::ActiveRead)
    };
    let pair = Pair::connect(config(64, TransferMode::PassiveRead), server_cfg);
    pair.client
        .buffers()
        .unwrap()
        .start
        .as_ref()
        .unwrap()
        .write_bytes(0, b"ping")
        .unwrap();

    assert_eq!(pair.round(), (64, 64));
    let written = std::fs::read(&out).unwrap();
    assert_eq!(written.len(), 64);
    assert!(written.starts_with(b"ping"));
}

#[test]
fn test_oversized_advertisement_is_refused() {
    let pair = Pair::connect(
        config(8192, TransferMode::PassiveWrite),
        config(1024, TransferMode::ActiveWrite),
    );
    let (client, server) = thread::scope(|s| {
        let client = s.spawn(|| pair.client.transfer());
        let server = pair.server.transfer();
        pair.server.disconnect().unwrap();
        (client.join().unwrap(), server)
    });
    assert!(matches!(
        server,
        Err(RdmaError::RemoteTooLarge {
            remote_len: 8192,
            capacity: 1024
        })
    ));
    assert!(matches!(client, Err(RdmaError::Disconnected { .. })));
    assert!(pair.fabric.rdma_ops().is_empty());
}

/// A peer without the transport stack sends 7 bytes where a 20-byte
/// descriptor belongs. The server's completion loop must fail the
/// connection without touching the remote buffer.
#[test]
fn test_wrong_size_receive_fails_the_server() {
    common::init_tracing();
    let fabric = SimFabric::new();
    let provider: Arc<dyn RdmaProvider> = Arc::new(fabric.clone());
    let pending = PendingConnections::new();
    let port = 7480;
    let server_cfg = config(4096, TransferMode::ActiveWrite);

    let mut listener =
        ConnectionControl::server(server_cfg.clone(), provider.clone(), pending.clone()).unwrap();
    listener.setup().unwrap();
    listener.listen(SocketAddr::from(([0, 0, 0, 0], port))).unwrap();
    let acceptor = spawn_acceptor(&pending, server_cfg, &provider);

    let timeout = Duration::from_secs(1);
    let channel = provider.create_event_channel().unwrap();
    let id = channel.create_id().unwrap();
    id.resolve_addr(SocketAddr::from(([127, 0, 0, 1], port)), timeout)
        .unwrap();
    assert_eq!(channel.get_event().unwrap().unwrap().kind, CmEventKind::AddrResolved);
    id.resolve_route(timeout).unwrap();
    assert_eq!(channel.get_event().unwrap().unwrap().kind, CmEventKind::RouteResolved);
    let res = QpResources::create(&id, &config(4096, TransferMode::PassiveWrite)).unwrap();
    let mr = res.pd.reg_mr(64, AccessFlags::LOCAL_WRITE).unwrap();
    mr.write_bytes(0, b"garbage").unwrap();
    id.connect(&ConnParams::default()).unwrap();
    assert_eq!(channel.get_event().unwrap().unwrap().kind, CmEventKind::Established);
    let server = acceptor.join().unwrap();
    assert_eq!(server.state(), ConnState::ConnectRequest);

    res.qp
        .post_send(&SendWr {
            wr_id: 9,
            sge: Sge {
                addr: mr.addr(),
                length: 7,
                lkey: mr.lkey(),
            },
            op: SendOp::Send,
            signaled: true,
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.state() != ConnState::Error {
        assert!(Instant::now() < deadline, "server stayed in {}", server.state());
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.ctx().remote(), RemoteBuffer::default());
    assert_eq!(server.ctx().trans_mode(), TransferMode::ActiveWrite);
    assert_eq!(server.ctx().metrics().snapshot().recvs_completed, 0);
    assert!(server.run_transfer() < 0);
    assert!(fabric.rdma_ops().is_empty());
}

#[test]
fn test_peer_disconnect_unblocks_waiting_client() {
    let pair = Pair::connect(
        config(1024, TransferMode::PassiveWrite),
        config(1024, TransferMode::PassiveWrite),
    );
    let res = thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            pair.server.disconnect().unwrap();
        });
        pair.client.transfer()
    });
    assert!(matches!(res, Err(RdmaError::Disconnected { .. })));
    assert!(pair.client.ctx().is_disconnected());
    assert!(pair.fabric.stats().flushed >= 1);
    assert!(pair.client.run_transfer() < 0);
}

#[test]
fn test_connect_to_missing_listener_fails() {
    common::init_tracing();
    let fabric = SimFabric::new();
    let provider: Arc<dyn RdmaProvider> = Arc::new(fabric.clone());
    let mut client =
        ConnectionControl::client(config(4096, TransferMode::PassiveWrite), provider).unwrap();
    client.setup().unwrap();
    client
        .resolve(SocketAddr::from(([127, 0, 0, 1], 9999)))
        .unwrap();
    client.setup_qp().unwrap();
    client.setup_buffers().unwrap();
    assert!(client.connect().is_err());
    assert_eq!(client.state(), ConnState::Error);
    assert!(client.run_transfer() < 0);
}

#[test]
fn test_server_teardown_mirrors_setup() {
    let pair = Pair::connect(
        config(4096, TransferMode::PassiveWrite),
        config(4096, TransferMode::ActiveWrite),
    );
    pair.round();
    let mark = pair.fabric.journal().len();
    let Pair {
        client,
        server,
        listener,
        pending: _pending,
        fabric,
    } = pair;

    drop(server);
    let released: Vec<ResourceKind> = fabric.journal()[mark..]
        .iter()
        .filter_map(|e| match e {
            ResourceEvent::Released(kind, _) => Some(*kind),
            ResourceEvent::Acquired(..) => None,
        })
        .collect();
    assert_eq!(
        released,
        vec![
            ResourceKind::Mr,
            ResourceKind::Mr,
            ResourceKind::Mr,
            ResourceKind::Qp,
            ResourceKind::Cq,
            ResourceKind::CompChannel,
            ResourceKind::Pd,
        ]
    );
    assert_eq!(fabric.live_regions(), 4);

    drop(client);
    drop(listener);
    assert_eq!(fabric.live_regions(), 0);
}

#[test]
fn test_one_queue_feeds_two_listeners() {
    common::init_tracing();
    let fabric = SimFabric::new();
    let provider: Arc<dyn RdmaProvider> = Arc::new(fabric.clone());
    let pending = PendingConnections::new();
    let ports = [7001u16, 7002];

    let listeners: Vec<ConnectionControl> = ports
        .iter()
        .map(|port| {
            let mut l = ConnectionControl::server(
                config(256, TransferMode::ActiveWrite),
                provider.clone(),
                pending.clone(),
            )
            .unwrap();
            l.setup().unwrap();
            l.listen(SocketAddr::from(([0, 0, 0, 0], *port))).unwrap();
            l
        })
        .collect();

    let acceptor = {
        let pending = pending.clone();
        let provider = provider.clone();
        thread::spawn(move || {
            (0..2)
                .map(|_| {
                    let conn = pending.pop_timeout(Duration::from_secs(10)).unwrap();
                    let mut server = ConnectionControl::accepted(
                        conn,
                        config(256, TransferMode::ActiveWrite),
                        provider.clone(),
                    )
                    .unwrap();
                    server.setup_qp().unwrap();
                    server.setup_buffers().unwrap();
                    server.accept().unwrap();
                    server
                })
                .collect::<Vec<_>>()
        })
    };

    let clients: Vec<ConnectionControl> = ports
        .iter()
        .map(|port| {
            let mut c =
                ConnectionControl::client(config(256, TransferMode::PassiveWrite), provider.clone())
                    .unwrap();
            c.setup().unwrap();
            c.resolve(SocketAddr::from(([10, 0, 0, 9], *port))).unwrap();
            c.setup_qp().unwrap();
            c.setup_buffers().unwrap();
            c.connect().unwrap();
            c
        })
        .collect();
    let servers = acceptor.join().unwrap();

    for (listener, server) in listeners.iter().zip(&servers) {
        assert_eq!(listener.state(), ConnState::ConnectRequest);
        let seen = listener.ctx().child().unwrap().handle();
        let bound = server.ctx().child().unwrap().handle();
        assert_eq!(seen, bound);
    }
    assert!(pending.is_empty());
    assert_eq!(fabric.stats().connects, 2);
    assert!(clients.iter().all(|c| c.state() == ConnState::Connected));
}
