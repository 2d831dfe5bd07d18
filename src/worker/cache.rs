use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighWatermarkEntry {
    pub high_watermark: DateTime<Utc>,
    pub is_deleted: bool,
}

/// key: worker-hwm-cache -> process-local idempotency filter
///
/// Entries live for the lifetime of the process and leave only through LRU eviction.
/// Replicas do not share this state, so a duplicate seen by two replicas is processed twice.
pub struct HighWatermarkCache {
    entries: Mutex<LruCache<String, HighWatermarkEntry>>,
    clock_drift: Duration,
}

impl HighWatermarkCache {
    pub fn new(capacity: usize, clock_drift: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            clock_drift,
        }
    }

    /// True when a trigger for `entitlement_id` as of `now` has been superseded,
    /// or when the entitlement is already known to be deleted.
    pub fn is_stale(&self, entitlement_id: &str, now: DateTime<Utc>) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            warn!(
                entitlement = %entitlement_id,
                "high-watermark cache poisoned, trigger treated as fresh"
            );
            return false;
        };
        match entries.get(entitlement_id) {
            Some(entry) => entry.high_watermark > now || entry.is_deleted,
            None => false,
        }
    }

    pub fn record(&self, entitlement_id: &str, now: DateTime<Utc>, is_deleted: bool) {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.put(
                    entitlement_id.to_string(),
                    HighWatermarkEntry {
                        high_watermark: now - self.clock_drift,
                        is_deleted,
                    },
                );
            }
            Err(_) => {
                warn!(
                    entitlement = %entitlement_id,
                    is_deleted,
                    "high-watermark cache poisoned, watermark not recorded"
                );
            }
        }
    }

    pub fn entry(&self, entitlement_id: &str) -> Option<HighWatermarkEntry> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.get(entitlement_id).copied())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
