//! Engine integration harness.
//!
//! These tests run several complete engines over an in-process MemoryHub
//! segment, with timers shortened far below the production defaults and
//! drop filters standing in for a lossy network. They exercise the real
//! task graph: raw frames, CRC, obfuscation, retransmission, presence,
//! and file transfer all run exactly as they do over a physical link.

mod failures;
mod files;
mod presence;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use qbol_core::config::EngineConfig;
use qbol_core::mac::MacAddr;
use qbol_core::wire::Frame;
use qbol_engine::link::memory::MemoryHub;
use qbol_engine::{Engine, Event};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Obfuscation key shared by every engine in the tests, used by drop
/// filters to decode frames in flight.
pub const KEY: &[u8] = qbol_core::wire::DEFAULT_OBFUSCATION_KEY;

/// Production timers squeezed down so a full retransmit cycle fits in a
/// test. Ratios between the timers match the defaults.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retransmit_interval_ms: 150,
        ack_tick_ms: 25,
        hello_interval_ms: 100,
        presence_timeout_ms: 600,
        presence_grace_ms: 500,
        transfer_timeout_ms: 900,
        shutdown_drain_ms: 200,
        ..EngineConfig::default()
    }
}

/// Test MACs: aa:aa:aa:aa:aa:XX.
pub fn mac(last: u8) -> MacAddr {
    MacAddr::new([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, last])
}

pub fn start_engine(hub: &Arc<MemoryHub>, last: u8, name: &str, cfg: EngineConfig) -> Engine {
    // Set RUST_LOG to watch a failing test from the inside.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Engine::start(Arc::new(hub.attach(mac(last))), name, cfg)
}

/// Decode a raw frame seen by a drop filter. Filters run on hub frames
/// that the engines themselves produced, so decoding never fails.
pub fn decode(raw: &[u8]) -> Frame {
    Frame::decode(raw, KEY).expect("hub carried an undecodable frame")
}

/// Wait until an event matching `pred` arrives, or panic after `deadline`.
pub async fn wait_for(
    events: &mut broadcast::Receiver<Event>,
    deadline: Duration,
    mut pred: impl FnMut(&Event) -> bool,
    what: &str,
) -> Event {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = end
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for {what}"));
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("event stream ended while waiting for {what}: {e}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

/// Assert that no event matching `pred` arrives within `window`.
pub async fn assert_quiet(
    events: &mut broadcast::Receiver<Event>,
    window: Duration,
    mut pred: impl FnMut(&Event) -> bool,
    what: &str,
) {
    let end = tokio::time::Instant::now() + window;
    loop {
        let Some(remaining) = end.checked_duration_since(tokio::time::Instant::now()) else {
            return;
        };
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => panic!("unexpected {what}: {event:?}"),
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => return,
        }
    }
}

/// Poll a condition until it holds, or panic after `deadline`.
pub async fn poll_until(deadline: Duration, mut cond: impl FnMut() -> bool, what: &str) {
    let end = tokio::time::Instant::now() + deadline;
    while !cond() {
        if tokio::time::Instant::now() >= end {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Smoke tests ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_starts_and_shuts_down_cleanly() {
    let hub = MemoryHub::new();
    let engine = start_engine(&hub, 1, "ana", fast_config());
    assert_eq!(engine.local_mac(), mac(1));
    assert_eq!(engine.frames_dropped(), 0);

    engine.shutdown().await;
    // Idempotent: a second shutdown returns immediately.
    engine.shutdown().await;

    assert!(engine.send_message(mac(2), "late", true).await.is_err());
    assert!(engine.send_hello().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn foreign_and_corrupt_frames_are_counted_not_fatal() {
    let hub = MemoryHub::new();
    let engine = start_engine(&hub, 1, "ana", fast_config());
    let mut events = engine.events();

    // A raw port on the hub, not running an engine.
    let outsider = hub.attach(mac(9));

    // Valid frame, corrupted in flight: decode fails, frame dropped.
    let mut corrupt = hand_built_msg();
    let last = corrupt.len() - 10;
    corrupt[last] ^= 0xff;
    use qbol_engine::RawLink;
    outsider.send(&corrupt).unwrap();

    poll_until(
        Duration::from_secs(1),
        || engine.frames_dropped() == 1,
        "drop counter to increment",
    )
    .await;

    // The engine is still alive and delivering.
    let fine = hand_built_msg();
    outsider.send(&fine).unwrap();
    wait_for(
        &mut events,
        Duration::from_secs(1),
        |e| matches!(e, Event::MessageReceived { text, .. } if text == "ping"),
        "message after a corrupt frame",
    )
    .await;

    engine.shutdown().await;
}

/// A hand-built reliable MSG from mac(9) to mac(1).
fn hand_built_msg() -> Vec<u8> {
    use bytes::Bytes;
    use qbol_core::wire::{FrameFlags, FrameKind};
    Frame {
        dst: mac(1),
        src: mac(9),
        kind: FrameKind::Msg,
        flags: FrameFlags::empty().with_reliable(true),
        seq: 1,
        transfer_id: 0,
        frag_index: 0,
        frag_total: 0,
        payload: Bytes::from_static(b"ping"),
    }
    .encode(KEY)
    .unwrap()
    .to_vec()
}
