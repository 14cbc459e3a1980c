use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RateLimitTiersConfig, TierLimitConfig};
use crate::limit::distributed::{CounterStore, DistributedRateLimiter};
use crate::limit::local::{Acquire, LocalRateLimiter};
use crate::limit::window::now_ms;

/// Keys with no increment for this long are evicted from the per-key maps.
const IDLE_EVICT_MS: u64 = 60_000;

/// Outcome of one tier's admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierCheck {
    Admitted { burst: bool, degraded: bool },
    Denied,
}

/// Two-tier limiter for one dimension (global, api, ip, user).
///
/// The local tier is checked first: a local deny returns immediately with
/// no store round-trip. On local admit the distributed tier is consulted as
/// the authoritative cluster-wide bound. A store error or timeout fails
/// open to the local decision and bumps the degraded counter.
pub struct TieredLimiter {
    dimension: &'static str,
    config: TierLimitConfig,
    keys: DashMap<String, Arc<LocalRateLimiter>>,
    distributed: Option<Arc<DistributedRateLimiter>>,
    allowed: AtomicU64,
    burst_allowed: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStatsSnapshot {
    pub dimension: &'static str,
    pub enabled: bool,
    pub max_requests: u64,
    pub burst_size: u64,
    pub window_size_secs: u64,
    pub allowed: u64,
    pub burst_allowed: u64,
    pub denied: u64,
    pub degraded: u64,
    pub active_keys: usize,
}

impl TieredLimiter {
    pub fn new(
        dimension: &'static str,
        config: TierLimitConfig,
        distributed: Option<Arc<DistributedRateLimiter>>,
    ) -> Self {
        Self {
            dimension,
            config,
            keys: DashMap::new(),
            distributed,
            allowed: AtomicU64::new(0),
            burst_allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    pub fn dimension(&self) -> &'static str {
        self.dimension
    }

    /// Canonical limiter key for a value in this dimension.
    pub fn key_for(&self, value: &str) -> String {
        format!("{}:{}", self.dimension, value)
    }

    pub async fn check(&self, value: &str) -> TierCheck {
        if !self.config.enabled {
            return TierCheck::Admitted {
                burst: false,
                degraded: false,
            };
        }

        let key = self.key_for(value);
        let local = self.local_for(&key);
        let acquire = local.try_acquire();
        if !acquire.is_admitted() {
            self.denied.fetch_add(1, Ordering::Relaxed);
            return TierCheck::Denied;
        }

        let mut degraded = false;
        if let Some(ref dist) = self.distributed {
            match dist
                .sliding_window_check(
                    &key,
                    self.config.window_size_secs,
                    self.config.max_requests,
                    self.config.burst_size,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    self.denied.fetch_add(1, Ordering::Relaxed);
                    return TierCheck::Denied;
                }
                Err(e) => {
                    // Fail open: the local tier carries this request alone.
                    degraded = true;
                    self.degraded.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "limit: distributed tier degraded, dimension={}, key={}, error={}",
                        self.dimension,
                        key,
                        e
                    );
                }
            }
        }

        let burst = matches!(acquire, Acquire::Burst);
        if burst {
            self.burst_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        }
        TierCheck::Admitted { burst, degraded }
    }

    fn local_for(&self, key: &str) -> Arc<LocalRateLimiter> {
        // Fast path: key already exists — no allocation.
        if let Some(entry) = self.keys.get(key) {
            return entry.value().clone();
        }
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(LocalRateLimiter::new(
                    key,
                    self.config.max_requests,
                    self.config.burst_size,
                    self.config.window_size_secs * 1_000,
                ))
            })
            .clone()
    }

    /// Drop keys idle for `IDLE_EVICT_MS`.
    pub fn evict_idle(&self) {
        let now = now_ms();
        self.keys.retain(|_, l| l.idle_ms(now) < IDLE_EVICT_MS);
    }

    pub fn degraded_total(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TierStatsSnapshot {
        TierStatsSnapshot {
            dimension: self.dimension,
            enabled: self.config.enabled,
            max_requests: self.config.max_requests,
            burst_size: self.config.burst_size,
            window_size_secs: self.config.window_size_secs,
            allowed: self.allowed.load(Ordering::Relaxed),
            burst_allowed: self.burst_allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            active_keys: self.keys.len(),
        }
    }
}

/// Decision returned to the pipeline after all dimensions are consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    Admitted { burst: bool, degraded: bool },
    /// Denied by the named dimension; `key` is the canonical limiter key.
    Denied { key: String },
}

impl LimitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, LimitDecision::Admitted { .. })
    }

    pub fn denied_key(&self) -> Option<&str> {
        match self {
            LimitDecision::Denied { key } => Some(key),
            _ => None,
        }
    }
}

/// The four admission dimensions checked in order:
/// global → per-API → per-IP → per-user. The first deny wins.
pub struct MultiTierLimiter {
    global: TieredLimiter,
    per_api: TieredLimiter,
    per_ip: TieredLimiter,
    per_user: TieredLimiter,
}

impl MultiTierLimiter {
    pub fn new(config: &RateLimitTiersConfig, store: Option<Arc<dyn CounterStore>>) -> Self {
        let distributed = match (config.distributed.enabled, store) {
            (true, Some(store)) => Some(Arc::new(DistributedRateLimiter::new(
                store,
                Duration::from_millis(config.distributed.check_timeout_ms),
            ))),
            _ => None,
        };

        Self {
            global: TieredLimiter::new("global", config.global.clone(), distributed.clone()),
            per_api: TieredLimiter::new("api", config.per_api.clone(), distributed.clone()),
            per_ip: TieredLimiter::new("ip", config.per_ip.clone(), distributed.clone()),
            per_user: TieredLimiter::new("user", config.per_user.clone(), distributed),
        }
    }

    pub async fn check(&self, path: &str, ip: &str, user: Option<&str>) -> LimitDecision {
        let mut burst = false;
        let mut degraded = false;

        let checks = [
            (&self.global, "*"),
            (&self.per_api, path),
            (&self.per_ip, ip),
            (&self.per_user, user.unwrap_or("")),
        ];

        for (tier, value) in checks {
            // Anonymous requests skip the per-user dimension.
            if tier.dimension() == "user" && value.is_empty() {
                continue;
            }
            match tier.check(value).await {
                TierCheck::Admitted {
                    burst: b,
                    degraded: d,
                } => {
                    burst |= b;
                    degraded |= d;
                }
                TierCheck::Denied => {
                    return LimitDecision::Denied {
                        key: tier.key_for(value),
                    };
                }
            }
        }

        LimitDecision::Admitted { burst, degraded }
    }

    pub fn evict_idle(&self) {
        self.global.evict_idle();
        self.per_api.evict_idle();
        self.per_ip.evict_idle();
        self.per_user.evict_idle();
    }

    pub fn degraded_total(&self) -> u64 {
        self.global.degraded_total()
            + self.per_api.degraded_total()
            + self.per_ip.degraded_total()
            + self.per_user.degraded_total()
    }

    pub fn stats(&self) -> Vec<TierStatsSnapshot> {
        vec![
            self.global.stats(),
            self.per_api.stats(),
            self.per_ip.stats(),
            self.per_user.stats(),
        ]
    }
}
