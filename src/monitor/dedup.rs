//! Per-`(address, activity)` rate limiter.
//!
//! Entries live in a `DashMap`, so the check-and-refresh for one key holds a
//! single shard lock and concurrent callers on other keys are not blocked.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

type WindowKey = (String, String);

#[derive(Debug, Default)]
pub struct Deduplicator {
    last_seen: DashMap<WindowKey, Instant>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the pair has not been accepted within `cooldown`.
    ///
    /// The timestamp is only refreshed on acceptance, so a steady stream of
    /// repeats lets one signal through per cooldown period.
    pub fn should_accept(&self, address: &str, activity: &str, cooldown: Duration, now: Instant) -> bool {
        match self.last_seen.entry((address.to_string(), activity.to_string())) {
            Entry::Occupied(mut e) => {
                if now.saturating_duration_since(*e.get()) < cooldown {
                    return false;
                }
                e.insert(now);
                true
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }

    /// Drops entries older than `max_age`. Returns how many were removed.
    pub fn evict_older_than(&self, max_age: Duration, now: Instant) -> usize {
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < max_age);
        before.saturating_sub(self.last_seen.len())
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn clear(&self) {
        self.last_seen.clear();
    }
}
