//! `UsageTracker`: rolling 10-minute per-operation counters (spec.md §2),
//! consulted by `Table::optimize()` to decide which records are "hot". No
//! tenant or billing dimension: just "how many times was this record
//! touched recently".

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use jstorage_core::Clock;

const WINDOW_MILLIS: i64 = 10 * 60 * 1000;

/// Per-identifier rolling-window access counter.
pub struct UsageTracker {
    clock: Arc<dyn Clock>,
    hits: DashMap<String, VecDeque<i64>>,
}

impl UsageTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            hits: DashMap::new(),
        }
    }

    /// Records one access against `key` at the current clock time.
    pub fn record(&self, key: &str) {
        let now = self.clock.now_millis();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        entry.push_back(now);
        prune(&mut entry, now);
    }

    /// Number of accesses recorded against `key` within the last 10 minutes.
    pub fn count_for(&self, key: &str) -> u64 {
        let now = self.clock.now_millis();
        match self.hits.get_mut(key) {
            Some(mut entry) => {
                prune(&mut entry, now);
                entry.len() as u64
            }
            None => 0,
        }
    }

    /// Drops tracked keys with no accesses left in the window, keeping the
    /// map from growing unboundedly across the lifetime of a long-running
    /// process. Intended to be called periodically by the maintenance
    /// scheduler alongside the other sweeps.
    pub fn prune_stale(&self) {
        let now = self.clock.now_millis();
        self.hits.retain(|_, entry| {
            prune(entry, now);
            !entry.is_empty()
        });
    }
}

fn prune(entry: &mut VecDeque<i64>, now: i64) {
    while let Some(&oldest) = entry.front() {
        if now - oldest > WINDOW_MILLIS {
            entry.pop_front();
        } else {
            break;
        }
    }
}
