//! File transfer: windowed reliable transfers, unreliable blasts,
//! reassembly, and inbound timeouts.

use std::time::Duration;

use bytes::Bytes;
use qbol_core::wire::FrameKind;
use qbol_engine::link::memory::MemoryHub;
use qbol_engine::{Event, TransferDirection};

use crate::*;

/// Build a blob whose contents make reordering mistakes visible.
fn patterned_blob(len: usize) -> Bytes {
    let mut blob = Vec::with_capacity(len);
    for i in 0..len {
        blob.push((i % 251) as u8);
    }
    Bytes::from(blob)
}

/// Reliable transfer end to end: the receiver rebuilds the exact blob,
/// both sides report completion with the same transfer id.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reliable_transfer_round_trips_the_blob() {
    let mut cfg = fast_config();
    cfg.payload_mtu = 512;

    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", cfg.clone());
    let engine_2 = start_engine(&hub, 2, "bea", cfg);
    let mut events_1 = engine_1.events();
    let mut events_2 = engine_2.events();

    // 40 fragments at mtu 512, driven through a window of 4.
    let blob = patterned_blob(20_000);
    let transfer_id = engine_1.send_file(mac(2), blob.clone(), true).unwrap();

    let event = wait_for(
        &mut events_2,
        Duration::from_secs(5),
        |e| matches!(e, Event::TransferCompleted { .. }),
        "inbound completion",
    )
    .await;
    match event {
        Event::TransferCompleted {
            direction,
            peer,
            transfer_id: got,
            bytes,
        } => {
            assert_eq!(direction, TransferDirection::Inbound);
            assert_eq!(peer, mac(1));
            assert_eq!(got, transfer_id);
            assert_eq!(bytes, blob);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let event = wait_for(
        &mut events_1,
        Duration::from_secs(5),
        |e| matches!(e, Event::TransferCompleted { .. }),
        "outbound completion",
    )
    .await;
    assert!(matches!(
        event,
        Event::TransferCompleted {
            direction: TransferDirection::Outbound,
            transfer_id: got,
            ..
        } if got == transfer_id
    ));

    assert_eq!(engine_1.unacked_frames(), 0);
    assert_eq!(engine_2.transfers_in_progress(), 0);

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// Unreliable transfer: every fragment is enqueued in order and the
/// receiver still rebuilds the blob on a lossless segment.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreliable_transfer_round_trips_on_a_clean_segment() {
    let mut cfg = fast_config();
    cfg.payload_mtu = 512;

    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", cfg.clone());
    let engine_2 = start_engine(&hub, 2, "bea", cfg);
    let mut events_2 = engine_2.events();

    let blob = patterned_blob(8_192);
    engine_1.send_file(mac(2), blob.clone(), false).unwrap();

    let event = wait_for(
        &mut events_2,
        Duration::from_secs(5),
        |e| matches!(e, Event::TransferCompleted { .. }),
        "inbound completion",
    )
    .await;
    assert!(matches!(event, Event::TransferCompleted { bytes, .. } if bytes == blob));

    // No reliability machinery was engaged.
    assert_eq!(engine_1.unacked_frames(), 0);

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// A transfer losing one fragment forever (unreliable mode) never
/// completes; the assembler times it out and reports failure.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_inbound_transfer_times_out() {
    let mut cfg = fast_config();
    cfg.payload_mtu = 512;

    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", cfg.clone());
    let engine_2 = start_engine(&hub, 2, "bea", cfg);
    let mut events_2 = engine_2.events();

    hub.set_drop_filter(|_, _, raw| {
        let frame = decode(raw);
        frame.kind == FrameKind::File && frame.frag_index == 1
    });

    let blob = patterned_blob(2_000);
    let transfer_id = engine_1.send_file(mac(2), blob, false).unwrap();

    let event = wait_for(
        &mut events_2,
        Duration::from_secs(3),
        |e| matches!(e, Event::TransferFailed { .. }),
        "inbound timeout",
    )
    .await;
    assert!(matches!(
        event,
        Event::TransferFailed {
            direction: TransferDirection::Inbound,
            transfer_id: got,
            ..
        } if got == transfer_id
    ));
    assert_eq!(engine_2.transfers_in_progress(), 0);

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// Fragments arriving out of order still reassemble correctly: hold the
/// first fragment back until the rest of the window has passed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_order_fragments_reassemble() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let mut cfg = fast_config();
    cfg.payload_mtu = 512;

    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", cfg.clone());
    let engine_2 = start_engine(&hub, 2, "bea", cfg);
    let mut events_2 = engine_2.events();

    // Drop the first copy of fragment 0; the retransmit delivers it after
    // its window peers.
    let held = Arc::new(AtomicBool::new(false));
    let flag = held.clone();
    hub.set_drop_filter(move |_, _, raw| {
        let frame = decode(raw);
        frame.kind == FrameKind::File
            && frame.frag_index == 0
            && !flag.swap(true, Ordering::SeqCst)
    });

    let blob = patterned_blob(4 * 512);
    let transfer_id = engine_1.send_file(mac(2), blob.clone(), true).unwrap();

    let event = wait_for(
        &mut events_2,
        Duration::from_secs(5),
        |e| matches!(e, Event::TransferCompleted { .. }),
        "inbound completion",
    )
    .await;
    match event {
        Event::TransferCompleted {
            transfer_id: got,
            bytes,
            ..
        } => {
            assert_eq!(got, transfer_id);
            assert_eq!(bytes, blob);
        }
        other => panic!("unexpected event {other:?}"),
    }

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}

/// An empty blob is a legal transfer: one empty fragment, delivered.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_blob_transfers_cleanly() {
    let hub = MemoryHub::new();
    let engine_1 = start_engine(&hub, 1, "ana", fast_config());
    let engine_2 = start_engine(&hub, 2, "bea", fast_config());
    let mut events_2 = engine_2.events();

    engine_1.send_file(mac(2), Bytes::new(), true).unwrap();

    let event = wait_for(
        &mut events_2,
        Duration::from_secs(2),
        |e| matches!(e, Event::TransferCompleted { .. }),
        "inbound completion",
    )
    .await;
    assert!(matches!(event, Event::TransferCompleted { bytes, .. } if bytes.is_empty()));

    engine_1.shutdown().await;
    engine_2.shutdown().await;
}
