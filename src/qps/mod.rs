use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::limit::window::{now_ms, SlidingWindow};

/// Entries idle for this long are removed during `snapshot()` / `cleanup()`.
const CLEANUP_THRESHOLD_MS: u64 = 60_000;

/// Per-second request counters across five independent dimensions.
///
/// `record` is the per-request hot path: one atomic increment per
/// dimension, no allocation once a key's window exists. Eviction is
/// amortised into reads: every `snapshot()` drops entries idle beyond
/// `CLEANUP_THRESHOLD_MS`, so each map stays bounded by the distinct keys
/// seen in the last minute without a dedicated sweeper task.
pub struct QpsEngine {
    window_ms: u64,
    global: DashMap<String, Arc<SlidingWindow>>,
    api: DashMap<String, Arc<SlidingWindow>>,
    ip: DashMap<String, Arc<SlidingWindow>>,
    user: DashMap<String, Arc<SlidingWindow>>,
    priority: DashMap<String, Arc<SlidingWindow>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QpsSnapshot {
    pub window_ms: u64,
    pub global: u64,
    pub api: HashMap<String, u64>,
    pub ip: HashMap<String, u64>,
    pub user: HashMap<String, u64>,
    pub priority: HashMap<String, u64>,
}

impl QpsEngine {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            global: DashMap::new(),
            api: DashMap::new(),
            ip: DashMap::new(),
            user: DashMap::new(),
            priority: DashMap::new(),
        }
    }

    /// Count one request in every dimension it belongs to.
    pub fn record(&self, path: &str, ip: &str, user: Option<&str>, priority: u8) {
        let now = now_ms();
        self.bump(&self.global, "*", now);
        self.bump(&self.api, path, now);
        self.bump(&self.ip, ip, now);
        if let Some(user) = user {
            self.bump(&self.user, user, now);
        }
        let mut buf = itoa::Buffer::new();
        self.bump(&self.priority, buf.format(priority), now);
    }

    fn bump(&self, map: &DashMap<String, Arc<SlidingWindow>>, key: &str, now: u64) {
        // Fast path: key already exists — no allocation.
        let window = if let Some(entry) = map.get(key) {
            entry.value().clone()
        } else {
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(SlidingWindow::new(self.window_ms)))
                .clone()
        };
        window.increment(now);
    }

    /// Current counts across all dimensions. Evicts idle entries inline.
    pub fn snapshot(&self) -> QpsSnapshot {
        let now = now_ms();
        self.global
            .retain(|_, w| w.idle_ms(now) < CLEANUP_THRESHOLD_MS);
        QpsSnapshot {
            window_ms: self.window_ms,
            global: self
                .global
                .get("*")
                .map(|w| w.current(now))
                .unwrap_or(0),
            api: Self::collect(&self.api, now),
            ip: Self::collect(&self.ip, now),
            user: Self::collect(&self.user, now),
            priority: Self::collect(&self.priority, now),
        }
    }

    fn collect(map: &DashMap<String, Arc<SlidingWindow>>, now: u64) -> HashMap<String, u64> {
        map.retain(|_, w| w.idle_ms(now) < CLEANUP_THRESHOLD_MS);
        map.iter()
            .map(|entry| (entry.key().clone(), entry.value().current(now)))
            .collect()
    }

    /// Eviction alone, exposed for operators and tests.
    pub fn cleanup(&self) {
        let now = now_ms();
        for map in [&self.global, &self.api, &self.ip, &self.user, &self.priority] {
            map.retain(|_, w| w.idle_ms(now) < CLEANUP_THRESHOLD_MS);
        }
    }

    /// Total tracked keys across all dimensions, for stats endpoints.
    pub fn tracked_keys(&self) -> usize {
        self.global.len() + self.api.len() + self.ip.len() + self.user.len() + self.priority.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_all_dimensions() {
        let engine = QpsEngine::new(60_000);
        engine.record("/v1/users", "10.0.0.1", Some("alice"), 0);
        engine.record("/v1/users", "10.0.0.1", Some("alice"), 0);
        engine.record("/v1/orders", "10.0.0.2", None, 9);

        let snap = engine.snapshot();
        assert_eq!(snap.global, 3);
        assert_eq!(snap.api["/v1/users"], 2);
        assert_eq!(snap.api["/v1/orders"], 1);
        assert_eq!(snap.ip["10.0.0.1"], 2);
        assert_eq!(snap.user["alice"], 2);
        assert!(!snap.user.contains_key(""));
        assert_eq!(snap.priority["0"], 2);
        assert_eq!(snap.priority["9"], 1);
    }

    #[test]
    fn test_anonymous_requests_skip_user_dimension() {
        let engine = QpsEngine::new(60_000);
        engine.record("/v1", "10.0.0.1", None, 5);
        assert!(engine.snapshot().user.is_empty());
    }

    #[test]
    fn test_snapshot_evicts_only_idle_keys() {
        let engine = QpsEngine::new(1_000);
        engine.record("/hot", "10.0.0.1", None, 5);
        // Both keys are fresh: nothing evicted.
        let snap = engine.snapshot();
        assert_eq!(snap.api.len(), 1);
        assert_eq!(snap.ip.len(), 1);

        engine.cleanup();
        assert_eq!(engine.snapshot().api.len(), 1);
    }

    #[test]
    fn test_tracked_keys_bounded_by_distinct_keys() {
        let engine = QpsEngine::new(1_000);
        for i in 0..10 {
            engine.record(&format!("/api/{i}"), "10.0.0.1", None, 5);
        }
        // global(1) + api(10) + ip(1) + priority(1)
        assert_eq!(engine.tracked_keys(), 13);
    }
}
