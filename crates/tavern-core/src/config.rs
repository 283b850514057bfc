//! Configuration system for Tavern.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TAVERN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tavern/config.toml
//!   3. ~/.config/tavern/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::handshake::Role;
use crate::policy::ServerPolicy;
use crate::wire::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, HANDSHAKE_TIMEOUT_SECS, MAX_CHUNK_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TavernConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub server: ServerConfig,
    pub transfer: TransferConfig,
    pub coalescer: CoalescerConfig,
}

/// Who this client claims to be when joining a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub name: String,
    pub role: Role,
    pub password: Option<String>,
}

/// Where to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub handshake_timeout_secs: u64,
}

/// Host-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub listen_port: u16,
    /// Password required for the GM role. Unset = empty password.
    pub gm_password: Option<String>,
    pub player_password: Option<String>,
    pub policy: ServerPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per asset chunk. Clamped to `MAX_CHUNK_SIZE`.
    pub chunk_size: usize,
    /// Sustained Bulk channel rate per connection. 0 = unlimited.
    pub bulk_rate_bytes_per_sec: u64,
    pub bulk_burst_bytes: u64,
    /// Reassemble incoming assets in part files under `temp_dir`.
    /// If false, partial assets are held in memory.
    pub spool_to_disk: bool,
    pub temp_dir: PathBuf,
    /// Keep completed assets on disk under `cache_dir` so they survive
    /// restarts and are not fetched again.
    pub persistent_cache: bool,
    pub cache_dir: PathBuf,
    pub fetch_timeout_secs: u64,
    /// Evict an in-flight transfer after this long without a chunk.
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    pub interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: std::env::var("USER").unwrap_or_else(|_| "player".to_string()),
            role: Role::Player,
            password: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tavern".to_string(),
            listen_port: DEFAULT_PORT,
            gm_password: None,
            player_password: None,
            policy: ServerPolicy::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            bulk_rate_bytes_per_sec: 4 * 1024 * 1024,
            bulk_burst_bytes: 256 * 1024,
            spool_to_disk: true,
            temp_dir: data_dir().join("transfers"),
            persistent_cache: true,
            cache_dir: data_dir().join("assets"),
            fetch_timeout_secs: 30,
            stale_after_secs: 300,
        }
    }
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl TransferConfig {
    /// Chunk size actually used on the wire.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl CoalescerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tavern")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tavern")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn env_flag(v: &str) -> bool {
    v == "true" || v == "1"
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

impl TavernConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a specific file without env overrides. A missing file yields
    /// the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(TavernConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TAVERN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&TavernConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply TAVERN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TAVERN_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Ok(v) = std::env::var("TAVERN_IDENTITY__ROLE") {
            if let Ok(r) = v.parse() {
                self.identity.role = r;
            }
        }
        if let Ok(v) = std::env::var("TAVERN_IDENTITY__PASSWORD") {
            self.identity.password = Some(v);
        }
        if let Ok(v) = std::env::var("TAVERN_NETWORK__HOST") {
            self.network.host = v;
        }
        if let Ok(v) = std::env::var("TAVERN_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("TAVERN_SERVER__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.server.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("TAVERN_SERVER__GM_PASSWORD") {
            self.server.gm_password = Some(v);
        }
        if let Ok(v) = std::env::var("TAVERN_SERVER__PLAYER_PASSWORD") {
            self.server.player_password = Some(v);
        }
        if let Ok(v) = std::env::var("TAVERN_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("TAVERN_TRANSFER__BULK_RATE") {
            if let Ok(n) = v.parse() {
                self.transfer.bulk_rate_bytes_per_sec = n;
            }
        }
        if let Ok(v) = std::env::var("TAVERN_TRANSFER__SPOOL_TO_DISK") {
            self.transfer.spool_to_disk = env_flag(&v);
        }
        if let Ok(v) = std::env::var("TAVERN_TRANSFER__TEMP_DIR") {
            self.transfer.temp_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TAVERN_TRANSFER__PERSISTENT_CACHE") {
            self.transfer.persistent_cache = env_flag(&v);
        }
        if let Ok(v) = std::env::var("TAVERN_TRANSFER__CACHE_DIR") {
            self.transfer.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TAVERN_COALESCER__INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.coalescer.interval_ms = n;
            }
        }
    }
}
