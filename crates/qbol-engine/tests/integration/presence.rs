//! Peer presence: discovery, silence timeout, graceful departure.

use std::time::Duration;

use qbol_engine::link::memory::MemoryHub;
use qbol_engine::{Event, PeerState};

use crate::*;

/// A starting engine is discovered by running peers, with its name.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_peer_comes_online_with_its_name() {
    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", fast_config());
    let mut events_1 = engine_1.events();

    let engine_2 = start_engine(&hub, 2, "bea", fast_config());

    let event = wait_for(
        &mut events_1,
        Duration::from_secs(2),
        |e| matches!(e, Event::PeerOnline { .. }),
        "peer online",
    )
    .await;
    assert!(matches!(
        event,
        Event::PeerOnline { mac: m, ref name } if m == mac(2) && name == "bea"
    ));

    let peers = engine_1.list_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].mac, mac(2));
    assert_eq!(peers[0].name, "bea");
    assert_eq!(peers[0].state, PeerState::Online);

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// A peer that dies without a goodbye is marked offline within the
/// presence timeout (plus one cleanup tick of slack).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_peer_goes_offline_within_the_timeout() {
    let cfg = fast_config();
    let timeout = cfg.presence_timeout();
    let tick = cfg.ack_tick();

    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", cfg.clone());
    let mut events_1 = engine_1.events();
    let engine_2 = start_engine(&hub, 2, "bea", cfg);

    wait_for(
        &mut events_1,
        Duration::from_secs(2),
        |e| matches!(e, Event::PeerOnline { mac: m, .. } if *m == mac(2)),
        "peer online",
    )
    .await;

    // Kill engine 2's traffic without any goodbye.
    hub.set_drop_filter(|src, _, _| src == mac(2));
    let silenced_at = tokio::time::Instant::now();

    wait_for(
        &mut events_1,
        timeout + tick + Duration::from_millis(500),
        |e| matches!(e, Event::PeerOffline { mac: m } if *m == mac(2)),
        "peer offline",
    )
    .await;
    // Lower bound is loose by one hello interval: the last beacon may have
    // landed just before the silence began.
    assert!(tokio::time::Instant::now() - silenced_at >= timeout - Duration::from_millis(200));

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// A graceful shutdown announces the departure immediately; no timeout
/// has to elapse.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_announces_offline_immediately() {
    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", fast_config());
    let mut events_1 = engine_1.events();
    let engine_2 = start_engine(&hub, 2, "bea", fast_config());

    wait_for(
        &mut events_1,
        Duration::from_secs(2),
        |e| matches!(e, Event::PeerOnline { mac: m, .. } if *m == mac(2)),
        "peer online",
    )
    .await;

    engine_2.shutdown().await;

    // Far sooner than the 600ms presence timeout.
    wait_for(
        &mut events_1,
        Duration::from_millis(400),
        |e| matches!(e, Event::PeerOffline { mac: m } if *m == mac(2)),
        "announced departure",
    )
    .await;

    engine_1.shutdown().await;
}

/// An offline peer flips back online as soon as it is heard again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn returning_peer_comes_back_online() {
    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", fast_config());
    let mut events_1 = engine_1.events();
    let engine_2 = start_engine(&hub, 2, "bea", fast_config());

    wait_for(
        &mut events_1,
        Duration::from_secs(2),
        |e| matches!(e, Event::PeerOnline { mac: m, .. } if *m == mac(2)),
        "peer online",
    )
    .await;

    hub.set_drop_filter(|src, _, _| src == mac(2));
    wait_for(
        &mut events_1,
        Duration::from_secs(2),
        |e| matches!(e, Event::PeerOffline { mac: m } if *m == mac(2)),
        "peer offline",
    )
    .await;

    hub.clear_drop_filter();
    wait_for(
        &mut events_1,
        Duration::from_secs(2),
        |e| matches!(e, Event::PeerOnline { mac: m, .. } if *m == mac(2)),
        "peer back online",
    )
    .await;

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}
