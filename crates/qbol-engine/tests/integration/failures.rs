//! Loss and failure handling: retransmit bounds, delivery failure,
//! black-holed paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qbol_core::wire::FrameKind;
use qbol_engine::link::memory::MemoryHub;
use qbol_engine::Event;

use crate::*;

/// Black-hole every frame from engine 2 back to engine 1: after
/// max_attempts sends the frame is given up with a delivery failure, and
/// the wire saw no more than max_attempts copies.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delivery_failure_after_max_attempts() {
    let mut cfg = fast_config();
    cfg.max_attempts = 3;

    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", cfg.clone());
    let engine_2 = start_engine(&hub, 2, "bea", cfg);
    let mut events_1 = engine_1.events();

    let msg_copies = Arc::new(AtomicUsize::new(0));
    let counter = msg_copies.clone();
    hub.set_drop_filter(move |src, dst, raw| {
        if src == mac(1) && decode(raw).kind == FrameKind::Msg {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        // Nothing gets back from engine 2 to engine 1.
        src == mac(2) && dst == mac(1)
    });

    let seq = engine_1.send_message(mac(2), "void", true).await.unwrap();

    let event = wait_for(
        &mut events_1,
        Duration::from_secs(3),
        |e| matches!(e, Event::DeliveryFailed { .. }),
        "delivery failure",
    )
    .await;
    assert!(matches!(
        event,
        Event::DeliveryFailed { dest, seq: failed } if dest == mac(2) && failed == seq
    ));

    assert_eq!(engine_1.unacked_frames(), 0);

    // Give a straggling retransmit time to show up, then check the bound.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let copies = msg_copies.load(Ordering::SeqCst);
    assert!(
        copies <= 3,
        "frame was sent {copies} times, max_attempts is 3"
    );
    assert!(copies >= 2, "frame was never retransmitted");

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// With every FileAck dropped, a reliable transfer keeps no more than
/// one window of fragments in flight and eventually fails.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reliable_transfer_respects_the_window_and_fails_without_acks() {
    let mut cfg = fast_config();
    cfg.max_attempts = 3;
    cfg.payload_mtu = 256;
    cfg.send_window = 4;

    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", cfg.clone());
    let engine_2 = start_engine(&hub, 2, "bea", cfg);
    let mut events_1 = engine_1.events();

    hub.set_drop_filter(|_, _, raw| decode(raw).kind == FrameKind::FileAck);

    let blob = bytes::Bytes::from(vec![0x42u8; 256 * 16]);
    let transfer_id = engine_1.send_file(mac(2), blob, true).unwrap();

    // The stop-and-wait window bounds what can ever be unacked at once.
    for _ in 0..20 {
        assert!(
            engine_1.unacked_frames() <= 4,
            "window exceeded: {} unacked",
            engine_1.unacked_frames()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let event = wait_for(
        &mut events_1,
        Duration::from_secs(3),
        |e| matches!(e, Event::TransferFailed { .. }),
        "transfer failure",
    )
    .await;
    assert!(matches!(
        event,
        Event::TransferFailed { transfer_id: failed, .. } if failed == transfer_id
    ));

    poll_until(
        Duration::from_secs(1),
        || engine_1.unacked_frames() == 0,
        "abandoned fragments to be cleared",
    )
    .await;

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// Sends are refused once shutdown has begun, and the engine survives
/// shutting down with a transfer still in flight.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_fails_outstanding_transfers() {
    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", fast_config());
    let mut events_1 = engine_1.events();

    // No engine on mac(5): FileAcks never come, the transfer hangs in
    // its first window until shutdown kills it.
    let blob = bytes::Bytes::from(vec![1u8; 1400 * 8]);
    let transfer_id = engine_1.send_file(mac(5), blob, true).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine_1.shutdown().await;

    let event = wait_for(
        &mut events_1,
        Duration::from_secs(2),
        |e| matches!(e, Event::TransferFailed { .. }),
        "transfer failed by shutdown",
    )
    .await;
    assert!(matches!(
        event,
        Event::TransferFailed { transfer_id: failed, .. } if failed == transfer_id
    ));
}
