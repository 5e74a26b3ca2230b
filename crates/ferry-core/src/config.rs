//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_RECV_BLOCK_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub receiver: ReceiverConfig,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Socket workers the daemon starts at boot.
    pub workers: usize,
    /// Address every worker binds. The port is always OS-assigned.
    pub bind_addr: String,
    /// Wrap accepted connections in TLS with a self-signed certificate.
    pub use_tls: bool,
    /// Upper bound on a single socket read.
    pub recv_block_size: usize,
    /// Free space required before a chunk is persisted, in multiples of its size.
    pub max_pending_chunks: u64,
    /// Largest `data_len` a header may declare. Larger headers are malformed.
    pub max_chunk_bytes: u64,
    /// Per-read timeout while a payload is in flight. 0 = wait forever.
    pub read_timeout_secs: u64,
    /// Grace period for a stopping worker before it is aborted.
    pub stop_timeout_secs: u64,
    /// SO_RCVBUF for listening sockets. 0 = kernel default.
    pub socket_recv_buffer: usize,
    /// Profiling samples buffered before new ones are dropped.
    pub profile_queue_capacity: usize,
    /// Region this gateway runs in, e.g. "aws:us-east-1".
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory chunk files are written into.
    pub root: PathBuf,
    /// Space budget for the store. 0 = unlimited.
    pub capacity_bytes: u64,
    /// Sleep between capacity checks while a chunk waits for space.
    pub capacity_poll_ms: u64,
    /// How long a chunk may wait for space before the receiver gives up.
    pub capacity_wait_secs: u64,
    /// Extra attempts after a failed chunk write.
    pub write_retries: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Append profiling samples as JSON lines to this file.
    pub profile_log: Option<PathBuf>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            bind_addr: "0.0.0.0".to_string(),
            use_tls: true,
            recv_block_size: DEFAULT_RECV_BLOCK_SIZE,
            max_pending_chunks: 1,
            max_chunk_bytes: 1 << 30, // 1 GiB
            read_timeout_secs: 120,
            stop_timeout_secs: 30,
            socket_recv_buffer: 0,
            profile_queue_capacity: 65_536,
            region: String::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("chunks"),
            capacity_bytes: 0,
            capacity_poll_ms: 100,
            capacity_wait_secs: 300,
            write_retries: 3,
        }
    }
}

impl ReceiverConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl StoreConfig {
    pub fn capacity_poll_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_poll_ms.max(1))
    }

    pub fn capacity_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.capacity_wait_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

/// Base directory for Ferry's on-disk state.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
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
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FERRY_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("FERRY_RECEIVER__WORKERS").and_then(|v| v.parse().ok()) {
            self.receiver.workers = n;
        }
        if let Some(v) = lookup("FERRY_RECEIVER__BIND_ADDR") {
            self.receiver.bind_addr = v;
        }
        if let Some(v) = lookup("FERRY_RECEIVER__USE_TLS") {
            self.receiver.use_tls = v == "true" || v == "1";
        }
        if let Some(v) = lookup("FERRY_RECEIVER__REGION") {
            self.receiver.region = v;
        }
        if let Some(v) = lookup("FERRY_STORE__ROOT") {
            self.store.root = PathBuf::from(v);
        }
        if let Some(n) = lookup("FERRY_STORE__CAPACITY_BYTES").and_then(|v| v.parse().ok()) {
            self.store.capacity_bytes = n;
        }
    }
}
