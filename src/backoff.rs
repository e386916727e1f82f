//! TTL backoff cache
//!
//! Process-wide negative signal shared by the scheduler loops: the
//! presence of a live `project:queue` key means "skip this queue until the
//! entry expires". Absence never implies readiness. Reads always compare
//! against the clock, so correctness does not depend on the background
//! sweeper; the sweeper only keeps the map from accumulating dead entries.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Backoff key for a queue within a project.
pub fn backoff_key(project: &str, queue: &str) -> String {
    format!("{project}:{queue}")
}

/// Thread-safe TTL map with a background sweeper.
///
/// Clones share the same map. The sweeper task holds only a weak
/// reference and exits once the last cache handle drops.
#[derive(Debug, Clone)]
pub struct BackoffCache {
    entries: Arc<DashMap<String, Instant>>,
}

impl BackoffCache {
    /// Create a cache whose sweeper runs every `sweep_interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sweep_interval: Duration) -> Self {
        let entries = Arc::new(DashMap::new());
        let weak = Arc::downgrade(&entries);

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(entries) = weak.upgrade() else {
                    break;
                };
                let now = Instant::now();
                entries.retain(|_, expiry: &mut Instant| *expiry > now);
            }
        });

        Self { entries }
    }

    /// Insert or replace `key` with an expiry of now + `ttl`.
    ///
    /// Replacement semantics matter: re-setting a live key moves its
    /// expiry, which is how the liveness watcher keeps a queue cooling
    /// until five minutes after the last probe that saw work running.
    pub fn set(&self, key: impl Into<String>, ttl: Duration) {
        self.entries.insert(key.into(), Instant::now() + ttl);
    }

    /// True while `key` holds a live entry.
    pub fn contains(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => *entry.value() > Instant::now(),
            None => false,
        }
    }

    /// Remove `key` regardless of expiry.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of entries still resident, expired or not. Sweeper
    /// diagnostics only.
    pub fn resident(&self) -> usize {
        self.entries.len()
    }
}
