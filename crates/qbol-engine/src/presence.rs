//! Presence manager — who is on the segment right now.
//!
//! Peers are learned from Hello and BroadcastOnline beacons, refreshed by
//! any frame they send, marked offline after a silence window, and
//! forgotten after a further grace period. State transitions raise
//! `peer_online`/`peer_offline` exactly once each.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use qbol_core::builder::FrameBuilder;
use qbol_core::mac::MacAddr;
use qbol_core::wire::FrameKind;

use crate::event::{Event, EventSink};
use crate::sender::TxQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    name: String,
    last_seen: Instant,
    state: PeerState,
}

/// A snapshot row for `list_peers`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub mac: MacAddr,
    pub name: String,
    pub state: PeerState,
    pub last_seen: Duration,
}

/// The shared peer table.
#[derive(Clone)]
pub(crate) struct PeerRegistry {
    peers: Arc<DashMap<MacAddr, PeerEntry>>,
    events: EventSink,
}

impl PeerRegistry {
    pub fn new(events: EventSink) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Feed one inbound frame into the presence state machine.
    ///
    /// Hello and BroadcastOnline create or revive the peer and record its
    /// display name; BroadcastOffline retires it; anything else refreshes
    /// `last_seen` for peers we already know.
    pub fn observe(&self, src: MacAddr, kind: FrameKind, payload: &[u8]) {
        match kind {
            FrameKind::Hello | FrameKind::BroadcastOnline => {
                let name = String::from_utf8_lossy(payload).into_owned();
                self.mark_online(src, Some(name));
            }
            FrameKind::BroadcastOffline => {
                self.mark_offline(src);
            }
            _ => {
                self.touch(src);
            }
        }
    }

    fn mark_online(&self, mac: MacAddr, name: Option<String>) {
        let mut came_online: Option<String> = None;

        let mut entry = self.peers.entry(mac).or_insert_with(|| PeerEntry {
            name: String::new(),
            last_seen: Instant::now(),
            state: PeerState::Offline,
        });
        if let Some(name) = name {
            entry.name = name;
        }
        entry.last_seen = Instant::now();
        if entry.state == PeerState::Offline {
            entry.state = PeerState::Online;
            came_online = Some(entry.name.clone());
        }
        drop(entry);

        if let Some(name) = came_online {
            tracing::info!(peer = %mac, name = %name, "peer online");
            self.events.emit(Event::PeerOnline { mac, name });
        }
    }

    fn mark_offline(&self, mac: MacAddr) {
        let mut went_offline = false;
        if let Some(mut entry) = self.peers.get_mut(&mac) {
            entry.last_seen = Instant::now();
            if entry.state == PeerState::Online {
                entry.state = PeerState::Offline;
                went_offline = true;
            }
        }
        if went_offline {
            tracing::info!(peer = %mac, "peer offline");
            self.events.emit(Event::PeerOffline { mac });
        }
    }

    fn touch(&self, mac: MacAddr) {
        let mut came_online: Option<String> = None;
        if let Some(mut entry) = self.peers.get_mut(&mac) {
            entry.last_seen = Instant::now();
            if entry.state == PeerState::Offline {
                entry.state = PeerState::Online;
                came_online = Some(entry.name.clone());
            }
        }
        if let Some(name) = came_online {
            tracing::info!(peer = %mac, name = %name, "peer online");
            self.events.emit(Event::PeerOnline { mac, name });
        }
    }

    /// One cleanup pass: silence past `timeout` takes a peer offline,
    /// silence past `timeout + grace` removes it entirely.
    pub fn sweep(&self, now: Instant, timeout: Duration, grace: Duration) {
        let mut offline: Vec<MacAddr> = Vec::new();
        let mut forget: Vec<MacAddr> = Vec::new();

        for mut entry in self.peers.iter_mut() {
            let silence = now.duration_since(entry.last_seen);
            match entry.state {
                PeerState::Online if silence > timeout => {
                    entry.state = PeerState::Offline;
                    offline.push(*entry.key());
                }
                PeerState::Offline if silence > timeout + grace => {
                    forget.push(*entry.key());
                }
                _ => {}
            }
        }

        for mac in offline {
            tracing::info!(peer = %mac, "peer offline (silent)");
            self.events.emit(Event::PeerOffline { mac });
        }
        for mac in forget {
            tracing::debug!(peer = %mac, "peer forgotten");
            self.peers.remove(&mac);
        }
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let now = Instant::now();
        let mut list: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|entry| PeerInfo {
                mac: *entry.key(),
                name: entry.name.clone(),
                state: entry.state,
                last_seen: now.duration_since(entry.last_seen),
            })
            .collect();
        list.sort_by_key(|info| info.mac);
        list
    }
}

/// Broadcast a Hello beacon on a fixed interval until shutdown.
pub(crate) async fn hello_loop(
    builder: Arc<FrameBuilder>,
    tx: TxQueue,
    key: Vec<u8>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; start announces separately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("hello beacon shutting down");
                return;
            }
            _ = ticker.tick() => {
                match builder.hello().encode(&key) {
                    Ok(bytes) => tx.push_unreliable(FrameKind::Hello, bytes),
                    Err(e) => tracing::warn!(error = %e, "failed to encode hello"),
                }
            }
        }
    }
}

/// Run the presence cleanup on the shared tick cadence until shutdown.
pub(crate) async fn sweep_loop(
    registry: PeerRegistry,
    tick: Duration,
    timeout: Duration,
    grace: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => registry.sweep(Instant::now(), timeout, grace),
        }
    }
}
