//! Peer settings file — the on-disk JSON format shared with other tools.
//!
//! Top-level shape: `{peers: [...], caches: {url: {lastPush, lastPull}}}`.
//! Timestamps are Unix milliseconds. Unknown keys anywhere in the document
//! are preserved across a load/save round-trip via flattened maps.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSource {
    Manual,
    Cache,
    Pong,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    pub peers: Vec<PeerRecord>,
    pub caches: BTreeMap<String, CacheRecord>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub ip: String,
    pub port: u16,
    /// Unix ms.
    pub first_seen: u64,
    /// Unix ms.
    pub last_seen: u64,
    pub source: PeerSource,
    #[serde(default)]
    pub failure_count: u32,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheRecord {
    /// Unix ms of the last host submission to this cache.
    pub last_push: u64,
    /// Unix ms of the last peer fetch from this cache.
    pub last_pull: u64,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(std::path::PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    Write(std::path::PathBuf, std::io::Error),
    #[error("failed to serialize peer settings: {0}")]
    Serialize(serde_json::Error),
}

impl PeerSettings {
    /// Load from disk. A missing file yields the empty default.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(SettingsError::Read(path.to_path_buf(), e)),
        };
        serde_json::from_str(&text).map_err(|e| SettingsError::Parse(path.to_path_buf(), e))
    }

    /// Write to disk, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettingsError::Write(path.to_path_buf(), e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(SettingsError::Serialize)?;
        std::fs::write(path, json).map_err(|e| SettingsError::Write(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_default_for_missing_file() {
        let settings =
            PeerSettings::load(Path::new("/nonexistent/gnuleaf/peers.json")).unwrap();
        assert!(settings.peers.is_empty());
        assert!(settings.caches.is_empty());
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let raw = r#"{
            "peers": [{
                "ip": "1.2.3.4",
                "port": 6346,
                "firstSeen": 1700000000000,
                "lastSeen": 1700000300000,
                "source": "pong",
                "failureCount": 1,
                "nickname": "old-friend"
            }],
            "caches": {
                "http://cache.example/gwc": {"lastPush": 0, "lastPull": 12, "etag": "abc"}
            },
            "schemaVersion": 3
        }"#;
        let parsed: PeerSettings = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].source, PeerSource::Pong);
        assert_eq!(parsed.peers[0].extra["nickname"], "old-friend");
        assert_eq!(parsed.extra["schemaVersion"], 3);

        let rendered = serde_json::to_string(&parsed).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["schemaVersion"], 3);
        assert_eq!(value["peers"][0]["nickname"], "old-friend");
        assert_eq!(value["peers"][0]["firstSeen"], 1_700_000_000_000u64);
        assert_eq!(
            value["caches"]["http://cache.example/gwc"]["etag"],
            "abc"
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("gnuleaf-settings-{}", std::process::id()));
        let path = dir.join("peers.json");

        let mut settings = PeerSettings::default();
        settings.peers.push(PeerRecord {
            ip: "5.6.7.8".into(),
            port: 6347,
            first_seen: 1,
            last_seen: 2,
            source: PeerSource::Cache,
            failure_count: 0,
            extra: serde_json::Map::new(),
        });
        settings
            .caches
            .insert("http://gwc.example/".into(), CacheRecord::default());
        settings.save(&path).unwrap();

        let back = PeerSettings::load(&path).unwrap();
        assert_eq!(back.peers.len(), 1);
        assert_eq!(back.peers[0].ip, "5.6.7.8");
        assert!(back.caches.contains_key("http://gwc.example/"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
