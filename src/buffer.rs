//! In-memory windowed aggregation buffer.
//!
//! Grounded on the donor's `route_quality::baseline` buffer: a
//! `RwLock<HashMap<K, V>>` where writers take the lock just long enough to
//! find-or-create a bucket and mutate it, and a periodic flusher drains the
//! whole map under one write lock.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{PatternKey, PatternStats, UsageEvent};

/// Width of one aggregation window, in seconds.
pub const WINDOW_SIZE_SECS: i64 = 3600;

/// Floor `unix_ts` to the start of its containing window.
pub fn window_start(unix_ts: i64) -> i64 {
    unix_ts - unix_ts.rem_euclid(WINDOW_SIZE_SECS)
}

#[derive(Default)]
pub struct Buffer {
    buckets: RwLock<HashMap<PatternKey, PatternStats>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `event` into its window bucket, creating one if absent.
    pub fn record(&self, event: &UsageEvent, now: i64) {
        let key = PatternKey {
            pattern_name: event.pattern_name.clone(),
            variant: event.normalized_variant().to_string(),
            agent_id: event.agent_id.clone(),
            window_start: window_start(now),
        };
        let mut buckets = self.buckets.write();
        buckets.entry(key).or_default().record(event);
    }

    /// Snapshot every bucket and replace the map with an empty one. The
    /// write lock is held only for the swap, never for serialization.
    pub fn drain(&self) -> HashMap<PatternKey, PatternStats> {
        std::mem::take(&mut *self.buckets.write())
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }
}
