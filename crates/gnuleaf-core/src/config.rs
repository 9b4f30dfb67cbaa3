//! Configuration system for GnuLeaf.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GNULEAF_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gnuleaf/config.toml
//!   3. ~/.config/gnuleaf/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GnuLeafConfig {
    pub network: NetworkConfig,
    pub peers: PeersConfig,
    pub sharing: SharingConfig,
    pub timers: TimersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listen port, also advertised in PONGs.
    pub listen_port: u16,
    /// Public IPv4 address override. Empty = learn from Remote-IP headers.
    pub public_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// How many ESTABLISHED sessions the pool maintains.
    pub target_connections: usize,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Handshake completion timeout in seconds.
    pub handshake_timeout_secs: u64,
    /// Exponential backoff base in seconds.
    pub retry_base_secs: u64,
    /// Attempts before an address is benched for an hour.
    pub max_attempts: u32,
    /// Path of the peer settings JSON file.
    pub settings_path: PathBuf,
    /// Manual bootstrap addresses, "ip:port".
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Filenames seeded into the shared library at startup.
    /// (name, size-in-bytes) pairs as "name:size" or bare names.
    pub files: Vec<String>,
    /// User-Agent string sent in handshakes.
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Keepalive PING (TTL=1) interval in seconds.
    pub keepalive_ping_secs: u64,
    /// Discovery PING (TTL=7) interval in seconds.
    pub discovery_ping_secs: u64,
    /// Peer directory persistence interval in seconds.
    pub directory_save_secs: u64,
    /// Directory entries unseen for this many days are pruned.
    pub directory_prune_days: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for GnuLeafConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            peers: PeersConfig::default(),
            sharing: SharingConfig::default(),
            timers: TimersConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6346,
            public_ip: String::new(),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            target_connections: 4,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 5,
            retry_base_secs: 5,
            max_attempts: 3,
            settings_path: data_dir().join("peers.json"),
            bootstrap: Vec::new(),
        }
    }
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            user_agent: format!("GnuLeaf/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            keepalive_ping_secs: 30,
            discovery_ping_secs: 3,
            directory_save_secs: 60,
            directory_prune_days: 7,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gnuleaf")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("gnuleaf")
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

impl GnuLeafConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GnuLeafConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GNULEAF_CONFIG")
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
            let text = toml::to_string_pretty(&GnuLeafConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GNULEAF_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GNULEAF_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("GNULEAF_NETWORK__PUBLIC_IP") {
            self.network.public_ip = v;
        }
        if let Ok(v) = std::env::var("GNULEAF_PEERS__TARGET_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.peers.target_connections = n;
            }
        }
        if let Ok(v) = std::env::var("GNULEAF_PEERS__SETTINGS_PATH") {
            self.peers.settings_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GNULEAF_PEERS__BOOTSTRAP") {
            self.peers.bootstrap = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("GNULEAF_SHARING__FILES") {
            self.sharing.files = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("GNULEAF_TIMERS__DISCOVERY_PING_SECS") {
            if let Ok(n) = v.parse() {
                self.timers.discovery_ping_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GNULEAF_TIMERS__KEEPALIVE_PING_SECS") {
            if let Ok(n) = v.parse() {
                self.timers.keepalive_ping_secs = n;
            }
        }
    }
}
