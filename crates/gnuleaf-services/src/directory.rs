//! Peer directory — every address we have heard of, scored for dialing.
//!
//! Shared between the router (pong/X-Try ingestion), the peer pool
//! (candidate selection) and the persistence timer. Mutation goes through
//! the directory's operations; persistence is best-effort JSON.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::settings::{CacheRecord, PeerRecord, PeerSettings, PeerSource};

/// One known peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Unix ms.
    pub first_seen: u64,
    /// Unix ms.
    pub last_seen: u64,
    pub source: PeerSource,
    pub failure_count: u32,
}

impl DirectoryEntry {
    /// Ranking score; higher is better.
    ///
    /// recency bonus (100/80/60/40/20 over 1h/6h/24h/72h/older) + source
    /// bonus (cache 30, pong 20, manual 10) + stability bonus
    /// (min(days known * 5, 50)) - 20 per recorded failure, floored at 0.
    pub fn score(&self, now_ms: u64) -> i64 {
        const HOUR: u64 = 3_600_000;
        const DAY: u64 = 24 * HOUR;

        let idle = now_ms.saturating_sub(self.last_seen);
        let recency = if idle < HOUR {
            100
        } else if idle < 6 * HOUR {
            80
        } else if idle < 24 * HOUR {
            60
        } else if idle < 72 * HOUR {
            40
        } else {
            20
        };

        let source = match self.source {
            PeerSource::Cache => 30,
            PeerSource::Pong => 20,
            PeerSource::Manual => 10,
        };

        let days_known = now_ms.saturating_sub(self.first_seen) / DAY;
        let stability = (days_known as i64 * 5).min(50);

        (recency + source + stability - 20 * i64::from(self.failure_count)).max(0)
    }
}

/// Upper bound on directory size. Past this, the lowest-scored entry is
/// evicted to make room.
pub const MAX_ENTRIES: usize = 2048;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The directory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PeerDirectory {
    entries: Arc<DashMap<(Ipv4Addr, u16), DirectoryEntry>>,
    caches: Arc<DashMap<String, CacheRecord>>,
    persist_path: Arc<Option<PathBuf>>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            caches: Arc::new(DashMap::new()),
            persist_path: Arc::new(None),
        }
    }

    /// Create a directory that persists to the given settings file.
    /// Loads existing entries from disk if the file exists.
    pub fn with_persistence(path: PathBuf) -> Self {
        let directory = Self {
            entries: Arc::new(DashMap::new()),
            caches: Arc::new(DashMap::new()),
            persist_path: Arc::new(Some(path.clone())),
        };
        directory.load_from(&path);
        directory
    }

    /// Upsert an address. Refreshes last_seen; first_seen and the original
    /// source are kept for entries we already know.
    pub fn add(&self, ip: Ipv4Addr, port: u16, source: PeerSource) {
        self.add_at(ip, port, source, now_ms());
    }

    pub fn add_at(&self, ip: Ipv4Addr, port: u16, source: PeerSource, when_ms: u64) {
        if !self.entries.contains_key(&(ip, port)) && self.entries.len() >= MAX_ENTRIES {
            self.evict_worst(when_ms);
        }
        self.entries
            .entry((ip, port))
            .and_modify(|e| e.last_seen = when_ms.max(e.last_seen))
            .or_insert_with(|| {
                tracing::debug!(%ip, port, ?source, "new directory entry");
                DirectoryEntry {
                    ip,
                    port,
                    first_seen: when_ms,
                    last_seen: when_ms,
                    source,
                    failure_count: 0,
                }
            });
    }

    fn evict_worst(&self, now_ms: u64) {
        let worst = self
            .entries
            .iter()
            .min_by_key(|e| e.score(now_ms))
            .map(|e| *e.key());
        if let Some(key) = worst {
            self.entries.remove(&key);
            tracing::debug!(ip = %key.0, port = key.1, "directory full, evicted lowest-scored entry");
        }
    }

    pub fn record_failure(&self, ip: Ipv4Addr, port: u16) {
        if let Some(mut entry) = self.entries.get_mut(&(ip, port)) {
            entry.failure_count += 1;
        }
    }

    pub fn get(&self, ip: Ipv4Addr, port: u16) -> Option<DirectoryEntry> {
        self.entries.get(&(ip, port)).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `n` entries by score.
    pub fn best_n(&self, n: usize) -> Vec<DirectoryEntry> {
        let now = now_ms();
        let mut all: Vec<DirectoryEntry> = self.entries.iter().map(|e| e.clone()).collect();
        all.sort_by_key(|e| std::cmp::Reverse(e.score(now)));
        all.truncate(n);
        all
    }

    /// Drop entries unseen for longer than `age`.
    pub fn prune(&self, age: Duration) {
        let cutoff = now_ms().saturating_sub(age.as_millis() as u64);
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_seen >= cutoff);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::info!(dropped, remaining = self.entries.len(), "pruned peer directory");
        }
    }

    /// Record a known GWebCache URL.
    pub fn add_cache_url(&self, url: &str) {
        self.caches.entry(url.to_string()).or_default();
    }

    pub fn cache_urls(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    pub fn mark_cache_pulled(&self, url: &str) {
        self.caches.entry(url.to_string()).or_default().last_pull = now_ms();
    }

    pub fn mark_cache_pushed(&self, url: &str) {
        self.caches.entry(url.to_string()).or_default().last_push = now_ms();
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Serialize to the settings file. Best-effort — logs on failure.
    pub fn save(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p.clone(),
            None => return,
        };
        // Re-read the file so unknown keys written by other tools survive.
        let mut settings = PeerSettings::load(&path).unwrap_or_default();
        settings.peers = self
            .entries
            .iter()
            .map(|e| PeerRecord {
                ip: e.ip.to_string(),
                port: e.port,
                first_seen: e.first_seen,
                last_seen: e.last_seen,
                source: e.source,
                failure_count: e.failure_count,
                extra: serde_json::Map::new(),
            })
            .collect();
        settings.caches = self
            .caches
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if let Err(e) = settings.save(&path) {
            tracing::warn!(error = %e, "failed to persist peer directory");
        }
    }

    fn load_from(&self, path: &Path) {
        let settings = match PeerSettings::load(path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load peer settings");
                return;
            }
        };
        let mut loaded = 0usize;
        for record in settings.peers {
            let Ok(ip) = record.ip.parse::<Ipv4Addr>() else {
                continue;
            };
            self.entries.insert(
                (ip, record.port),
                DirectoryEntry {
                    ip,
                    port: record.port,
                    first_seen: record.first_seen,
                    last_seen: record.last_seen,
                    source: record.source,
                    failure_count: record.failure_count,
                },
            );
            loaded += 1;
        }
        for (url, cache) in settings.caches {
            self.caches.insert(url, cache);
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded peer directory");
        }
    }
}
