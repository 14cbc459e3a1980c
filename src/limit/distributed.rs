use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::limit::window::now_ms;

/// Errors from the shared counter store backing the distributed tier.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Atomic counter store with TTL semantics.
///
/// Any backend that can atomically increment a keyed counter and expire it
/// (redis, etcd, a database) can implement this. The limiter never holds
/// state in the store beyond the TTL of a sub-window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` by one and return the new value.
    /// Creates the counter at 0 with the given TTL when absent.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Read a counter; 0 when absent or expired.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;
}

/// In-process store for tests and single-node deployments.
pub struct MemoryCounterStore {
    entries: DashMap<String, (i64, u64)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = now_ms();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert((0, now + ttl.as_millis() as u64));
        let (value, expires_at) = *entry;
        if now >= expires_at {
            *entry = (1, now + ttl.as_millis() as u64);
            return Ok(1);
        }
        entry.0 = value + 1;
        Ok(value + 1)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let now = now_ms();
        match self.entries.get(key) {
            Some(entry) if now < entry.1 => Ok(entry.0),
            _ => Ok(0),
        }
    }
}

/// Cluster-wide sliding-window check over an abstract counter store.
///
/// The window is bucketed: one counter per one-second sub-window, keyed
/// `"{key}:{epoch_sec}"`, and the check sums the last `window_secs`
/// sub-windows. The whole check (all round-trips) runs under a hard
/// deadline; a slow or dead store surfaces `StoreError` to the tiered
/// limiter instead of stalling the request.
pub struct DistributedRateLimiter {
    store: Arc<dyn CounterStore>,
    check_timeout: Duration,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, check_timeout: Duration) -> Self {
        Self {
            store,
            // The deadline is a hard upper bound of 50ms regardless of config.
            check_timeout: check_timeout.min(Duration::from_millis(50)),
        }
    }

    /// Returns `Ok(true)` when the cluster-wide count (including this
    /// request) fits within `max_requests + burst_size`.
    pub async fn sliding_window_check(
        &self,
        key: &str,
        window_secs: u64,
        max_requests: u64,
        burst_size: u64,
    ) -> Result<bool, StoreError> {
        tokio::time::timeout(
            self.check_timeout,
            self.check_inner(key, window_secs.max(1), max_requests, burst_size),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.check_timeout))?
    }

    async fn check_inner(
        &self,
        key: &str,
        window_secs: u64,
        max_requests: u64,
        burst_size: u64,
    ) -> Result<bool, StoreError> {
        let epoch = now_ms() / 1_000;
        let ttl = Duration::from_secs(window_secs + 1);

        let mut total = self.store.incr(&format!("{key}:{epoch}"), ttl).await?;
        for i in 1..window_secs {
            total += self
                .store
                .get(&format!("{key}:{}", epoch.saturating_sub(i)))
                .await?;
        }

        Ok(total as u64 <= max_requests + burst_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Store whose every call fails, for degraded-mode tests.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn incr(&self, _key: &str, _ttl: Duration) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("injected".into()))
        }

        async fn get(&self, _key: &str) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("injected".into()))
        }
    }

    #[tokio::test]
    async fn test_memory_store_incr_and_get() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.incr("k", Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(store.incr("k", Duration::from_secs(5)).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), 2);
        assert_eq!(store.get("absent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_check_admits_within_limit() {
        let limiter =
            DistributedRateLimiter::new(Arc::new(MemoryCounterStore::new()), Duration::from_millis(50));
        for _ in 0..5 {
            assert!(limiter
                .sliding_window_check("api:/v1", 2, 5, 0)
                .await
                .unwrap());
        }
        assert!(!limiter
            .sliding_window_check("api:/v1", 2, 5, 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_burst_extends_cluster_limit() {
        let limiter =
            DistributedRateLimiter::new(Arc::new(MemoryCounterStore::new()), Duration::from_millis(50));
        for _ in 0..7 {
            assert!(limiter
                .sliding_window_check("user:42", 2, 5, 2)
                .await
                .unwrap());
        }
        assert!(!limiter
            .sliding_window_check("user:42", 2, 5, 2)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_error() {
        let limiter =
            DistributedRateLimiter::new(Arc::new(FailingStore), Duration::from_millis(50));
        let err = limiter
            .sliding_window_check("ip:10.0.0.1", 1, 100, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_slow_store_hits_deadline() {
        struct SlowStore;

        #[async_trait]
        impl CounterStore for SlowStore {
            async fn incr(&self, _key: &str, _ttl: Duration) -> Result<i64, StoreError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1)
            }

            async fn get(&self, _key: &str) -> Result<i64, StoreError> {
                Ok(0)
            }
        }

        let limiter = DistributedRateLimiter::new(Arc::new(SlowStore), Duration::from_millis(20));
        let err = limiter
            .sliding_window_check("k", 1, 100, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_deadline_clamped_to_50ms() {
        let limiter = DistributedRateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            Duration::from_secs(10),
        );
        assert_eq!(limiter.check_timeout, Duration::from_millis(50));
    }
}
