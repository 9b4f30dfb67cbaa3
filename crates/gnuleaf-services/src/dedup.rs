//! Descriptor-id dedup cache — drops the second sighting of any routable
//! descriptor inside a five-minute window.
//!
//! Owned by the router task; no internal locking. Stale entries are purged
//! lazily on each insert attempt.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<[u8; 16], Instant>,
    window: Duration,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_window(DEDUP_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
        }
    }

    /// Returns true if this id has not been seen inside the window, and
    /// records it. Returns false for a duplicate.
    pub fn check_and_insert(&mut self, descriptor_id: [u8; 16]) -> bool {
        self.check_and_insert_at(descriptor_id, Instant::now())
    }

    fn check_and_insert_at(&mut self, descriptor_id: [u8; 16], now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < window);

        match self.seen.get(&descriptor_id) {
            Some(_) => false,
            None => {
                self.seen.insert(descriptor_id, now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
