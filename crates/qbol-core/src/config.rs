//! Engine configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $QBOL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/qbol/config.toml
//!   3. ~/.config/qbol/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::{DEFAULT_OBFUSCATION_KEY, DEFAULT_PAYLOAD_MTU};

/// All tunables of the messaging engine. Timers are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max cleartext payload bytes per frame.
    pub payload_mtu: usize,
    /// How long an unacked reliable frame waits before retransmission.
    pub retransmit_interval_ms: u64,
    /// Sends of a reliable frame before delivery is declared failed.
    pub max_attempts: u32,
    /// Cadence of the retransmit/cleanup scan.
    pub ack_tick_ms: u64,
    /// Cadence of the presence beacon.
    pub hello_interval_ms: u64,
    /// Silence from a peer before it is marked offline.
    pub presence_timeout_ms: u64,
    /// Additional silence before an offline peer is forgotten.
    pub presence_grace_ms: u64,
    /// Idle time before an inbound file transfer is discarded.
    pub transfer_timeout_ms: u64,
    /// Max unacked fragments outstanding per reliable file transfer.
    pub send_window: usize,
    /// Transmit queue capacity in frames.
    pub tx_queue_capacity: usize,
    /// How long shutdown waits for the transmit queue to drain.
    pub shutdown_drain_ms: u64,
    /// Payload obfuscation key. Must match on every peer.
    pub obfuscation_key: String,
    /// Where completed inbound files are written.
    pub download_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payload_mtu: DEFAULT_PAYLOAD_MTU,
            retransmit_interval_ms: 1000,
            max_attempts: 5,
            ack_tick_ms: 200,
            hello_interval_ms: 5000,
            presence_timeout_ms: 20_000,
            presence_grace_ms: 60_000,
            transfer_timeout_ms: 60_000,
            send_window: 4,
            tx_queue_capacity: 1024,
            shutdown_drain_ms: 500,
            obfuscation_key: String::from_utf8_lossy(DEFAULT_OBFUSCATION_KEY).into_owned(),
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl EngineConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn ack_tick(&self) -> Duration {
        Duration::from_millis(self.ack_tick_ms)
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }

    pub fn key(&self) -> &[u8] {
        self.obfuscation_key.as_bytes()
    }

    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EngineConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("QBOL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply QBOL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        fn parse_into<T: std::str::FromStr>(name: &str, slot: &mut T) {
            if let Ok(v) = std::env::var(name) {
                if let Ok(parsed) = v.parse() {
                    *slot = parsed;
                }
            }
        }

        parse_into("QBOL_PAYLOAD_MTU", &mut self.payload_mtu);
        parse_into("QBOL_RETRANSMIT_INTERVAL_MS", &mut self.retransmit_interval_ms);
        parse_into("QBOL_MAX_ATTEMPTS", &mut self.max_attempts);
        parse_into("QBOL_ACK_TICK_MS", &mut self.ack_tick_ms);
        parse_into("QBOL_HELLO_INTERVAL_MS", &mut self.hello_interval_ms);
        parse_into("QBOL_PRESENCE_TIMEOUT_MS", &mut self.presence_timeout_ms);
        parse_into("QBOL_PRESENCE_GRACE_MS", &mut self.presence_grace_ms);
        parse_into("QBOL_TRANSFER_TIMEOUT_MS", &mut self.transfer_timeout_ms);
        parse_into("QBOL_SEND_WINDOW", &mut self.send_window);
        parse_into("QBOL_TX_QUEUE_CAPACITY", &mut self.tx_queue_capacity);
        parse_into("QBOL_SHUTDOWN_DRAIN_MS", &mut self.shutdown_drain_ms);
        if let Ok(v) = std::env::var("QBOL_OBFUSCATION_KEY") {
            self.obfuscation_key = v;
        }
        if let Ok(v) = std::env::var("QBOL_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("qbol")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local").join("share"))
        .join("qbol")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}
