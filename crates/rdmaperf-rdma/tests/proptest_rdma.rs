//! Property-based tests for rdmaperf-rdma using proptest.
//!
//! These cover the wire descriptor, the rendezvous hand-off, the pending
//! connection queue and the state machine's receive rules.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use rdmaperf_rdma::context::ContextMap;
use rdmaperf_rdma::state::StateCell;
use rdmaperf_rdma::verbs::{CmEventChannel, RdmaProvider};
use rdmaperf_rdma::{
    BufferDescriptor, ConnState, PendingConnection, PendingConnections, Rendezvous, Role,
    SimFabric, TransferMode, Wake, WakeCause, WireMode, DESCRIPTOR_LEN,
};

fn any_mode() -> impl Strategy<Value = TransferMode> {
    prop_oneof![
        Just(TransferMode::ActiveRead),
        Just(TransferMode::ActiveWrite),
        Just(TransferMode::PassiveRead),
        Just(TransferMode::PassiveWrite),
    ]
}

fn any_cause() -> impl Strategy<Value = WakeCause> {
    prop_oneof![
        Just(WakeCause::RouteResolved),
        Just(WakeCause::Established),
        Just(WakeCause::Advert),
        Just(WakeCause::ReadDone),
        Just(WakeCause::WriteDone),
    ]
}

fn any_live_state() -> impl Strategy<Value = ConnState> {
    (0u8..9).prop_map(ConnState::from_u8)
}

proptest! {
    #[test]
    fn test_descriptor_round_trip(
        addr in any::<u64>(),
        rkey in any::<u32>(),
        size in any::<u32>(),
        mode in any_mode(),
    ) {
        let desc = BufferDescriptor::new(addr, rkey, size, mode);
        let bytes = desc.encode();
        prop_assert_eq!(bytes.len(), DESCRIPTOR_LEN);
        let back = BufferDescriptor::decode(&bytes).unwrap();
        prop_assert_eq!(back, desc);
        prop_assert_eq!(back.wire_mode(), Some(mode.wire()));
    }

    #[test]
    fn test_descriptor_rejects_other_lengths(len in 0usize..64) {
        prop_assume!(len != DESCRIPTOR_LEN);
        let bytes = vec![0u8; len];
        prop_assert!(BufferDescriptor::decode(&bytes).is_err());
    }

    #[test]
    fn test_mode_translation_is_a_bijection(tag in 0u32..4) {
        let wire = WireMode::from_tag(tag).unwrap();
        let local = wire.local_mode();
        prop_assert_ne!(local.is_active(), matches!(wire, WireMode::ActRead | WireMode::ActWrite));
        let others: Vec<_> = (0u32..4)
            .filter(|t| *t != tag)
            .map(|t| WireMode::from_tag(t).unwrap().local_mode())
            .collect();
        prop_assert!(!others.contains(&local));
    }

    /// Every post is consumed exactly once by a wait for its cause, however
    /// the producers interleave and in whatever order the waiter asks.
    #[test]
    fn test_rendezvous_no_lost_or_doubled_wakes(
        causes in proptest::collection::vec(any_cause(), 1..40),
        split in any::<prop::sample::Index>(),
        seed in any::<u64>(),
    ) {
        let rv = Arc::new(Rendezvous::new());
        let at = split.index(causes.len() + 1);
        let (first, second) = causes.split_at(at);

        let mut order = causes.clone();
        // deterministic shuffle of the waiting order
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let producers: Vec<_> = [first.to_vec(), second.to_vec()]
            .into_iter()
            .map(|batch| {
                let rv = rv.clone();
                thread::spawn(move || {
                    for cause in batch {
                        rv.post(Wake { cause, state: ConnState::Connected });
                    }
                })
            })
            .collect();

        for cause in &order {
            let wake = rv.wait(*cause);
            prop_assert_eq!(wake.cause, *cause);
        }
        for p in producers {
            p.join().unwrap();
        }
        prop_assert_eq!(rv.pending(), 0);
        prop_assert_eq!(rv.posts(), causes.len() as u64);
        prop_assert_eq!(rv.consumed(), causes.len() as u64);
    }

    /// N concurrent producers; one consumer sees every request exactly once,
    /// each producer's requests in the order it queued them.
    #[test]
    fn test_pending_queue_delivers_each_request_once(
        producers in 1usize..6,
        per_producer in 1usize..12,
    ) {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let queue = PendingConnections::new();
        let contexts = ContextMap::new();

        let mut pushed: HashMap<u64, Vec<u64>> = HashMap::new();
        let mut batches = Vec::new();
        for p in 0..producers {
            let ids: Vec<_> = (0..per_producer).map(|_| channel.create_id().unwrap()).collect();
            pushed.insert(p as u64, ids.iter().map(|id| id.handle()).collect());
            batches.push(ids);
        }

        let handles: Vec<_> = batches
            .into_iter()
            .enumerate()
            .map(|(p, ids)| {
                let queue = queue.clone();
                let contexts = contexts.clone();
                thread::spawn(move || {
                    for id in ids {
                        queue.push(PendingConnection { id, listen_id: p as u64, contexts: contexts.clone() });
                    }
                })
            })
            .collect();

        let mut seen: HashMap<u64, Vec<u64>> = HashMap::new();
        for _ in 0..producers * per_producer {
            let conn = queue.pop().unwrap();
            seen.entry(conn.listen_id).or_default().push(conn.id.handle());
        }
        for h in handles {
            h.join().unwrap();
        }
        prop_assert!(queue.is_empty());
        prop_assert_eq!(seen, pushed);
    }

    /// The server's active-write entry and the descriptor's arrival may
    /// race; either order ends in RDMA_WRITE_ADV.
    #[test]
    fn test_write_wait_and_receive_commute(
        start in prop_oneof![
            Just(ConnState::ConnectRequest),
            Just(ConnState::Connected),
            Just(ConnState::WriteComplete),
        ],
        descriptor_first in any::<bool>(),
    ) {
        let cell = StateCell::new(start);
        if descriptor_first {
            cell.on_receive(Role::Server);
            prop_assert!(cell.begin_write_wait());
        } else {
            prop_assert!(!cell.begin_write_wait());
            cell.on_receive(Role::Server);
        }
        prop_assert_eq!(cell.load(), ConnState::WriteAdv);
    }

    /// Within a client round the observed states never go backwards.
    #[test]
    fn test_client_round_is_monotonic(read in any::<bool>()) {
        let cell = StateCell::new(ConnState::Connected);
        let mut seen = vec![cell.load()];
        cell.set(if read { ConnState::ReadAdv } else { ConnState::WriteAdv });
        seen.push(cell.load());
        seen.push(cell.on_receive(Role::Client));
        prop_assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_ne!(cell.load(), ConnState::Error);
    }

    #[test]
    fn test_error_absorbs_every_transition(
        start in any_live_state(),
        steps in proptest::collection::vec(any_live_state(), 0..10),
    ) {
        let cell = StateCell::new(start);
        cell.fail();
        for s in steps {
            cell.set(s);
            cell.on_receive(Role::Server);
            cell.on_receive(Role::Client);
            prop_assert!(!cell.begin_write_wait());
        }
        prop_assert_eq!(cell.load(), ConnState::Error);
    }
}
