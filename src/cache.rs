// =============================================================================
// TTL'd key-value cache — in-process stand-in for a cache/pubsub store
// =============================================================================
//
// Entries carry a produced_at timestamp and TTL; expired reads return None so
// consumers never act on old spread lists or snapshots. Writers are the owning
// component loops; readers are API handlers and the detector.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Well-known keys.
pub const KEY_FUNDING_SPREADS: &str = "funding_spreads";
pub const KEY_UNIFIED_SNAPSHOT: &str = "unified_snapshot";
pub const KEY_RECONCILIATION_REPORT: &str = "reconciliation_report";

struct Entry {
    value: serde_json::Value,
    produced_at: Instant,
    ttl: Option<Duration>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.produced_at) > ttl,
            None => false,
        }
    }
}

/// Cheap to clone; the map is shared.
#[derive(Clone)]
pub struct TtlCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return,
        };
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value,
                produced_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    pub fn get_raw(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Drop expired entries; called opportunistically by housekeeping loops.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let cache = TtlCache::new();
        cache.set_json(KEY_FUNDING_SPREADS, &vec![1, 2, 3], None);
        let back: Vec<i32> = cache.get_json(KEY_FUNDING_SPREADS).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let cache = TtlCache::new();
        cache.set_json("k", &"v", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_json::<String>("k").is_none());
        assert_eq!(cache.evict_expired(), 1);
    }

    #[test]
    fn missing_key_is_none() {
        let cache = TtlCache::new();
        assert!(cache.get_json::<String>("nope").is_none());
        assert!(cache.get_raw("nope").is_none());
    }
}
