use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::audit::{AuditPipeline, AuditSink, FileSink};
use crate::config::{AuditStorageConfig, CoreConfig};
use crate::limit::{CounterStore, MemoryCounterStore, MultiTierLimiter, QueuedLimiter};
use crate::metrics::Metrics;
use crate::proxy::filter::{build_filters, Filter};
use crate::qps::QpsEngine;
use crate::trace::{TraceManager, TraceReporter};
use crate::upstream::{Backend, CircuitBreaker, HttpBackend};

/// Injection points for collaborators whose drivers live outside the core:
/// the backend fleet, non-file audit sinks, and the shared counter store.
#[derive(Default)]
pub struct StateOverrides {
    pub backend: Option<Arc<dyn Backend>>,
    pub audit_sink: Option<Arc<dyn AuditSink>>,
    pub counter_store: Option<Arc<dyn CounterStore>>,
}

/// Shared gateway state, cheaply cloneable.
///
/// Every subsystem is a value constructed here with explicit dependencies:
/// no singletons, no back references. The dependency flow is one-way: the
/// request pipeline calls into limiters, QPS, audit, and tracing; none of
/// them call back.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<CoreConfig>>,
    pub metrics: Metrics,
    pub filters: Arc<Vec<Filter>>,
    pub limits: Arc<MultiTierLimiter>,
    pub queue: Arc<QueuedLimiter>,
    pub qps: Arc<QpsEngine>,
    pub traces: Arc<TraceManager>,
    pub reporter: Option<Arc<TraceReporter>>,
    pub audit: Arc<AuditPipeline>,
    pub backend: Arc<dyn Backend>,
    pub breaker: Arc<CircuitBreaker>,
    pub shutting_down: Arc<AtomicBool>,
}

impl GatewayState {
    /// Build all subsystems. Must run inside the tokio runtime; the audit
    /// and reporter workers are spawned here.
    pub fn new(config: CoreConfig) -> Result<Self> {
        Self::with_overrides(config, StateOverrides::default())
    }

    pub fn with_overrides(config: CoreConfig, overrides: StateOverrides) -> Result<Self> {
        let metrics = Metrics::install();

        let counter_store: Option<Arc<dyn CounterStore>> = if config.rate_limit.distributed.enabled
        {
            Some(match overrides.counter_store {
                Some(store) => store,
                None => {
                    info!("limit: no counter store injected, using in-process store");
                    Arc::new(MemoryCounterStore::new())
                }
            })
        } else {
            None
        };
        let limits = Arc::new(MultiTierLimiter::new(&config.rate_limit, counter_store));

        let queue = Arc::new(QueuedLimiter::new(config.queued_rate_limit.clone()));
        let qps = Arc::new(QpsEngine::new(
            config.rate_limit.global.window_size_secs * 1_000,
        ));

        let reporter = if config.tracing_pipeline.reporter.enabled {
            Some(TraceReporter::spawn(config.tracing_pipeline.reporter.clone()))
        } else {
            None
        };
        let traces = Arc::new(TraceManager::new(
            config.service_name.clone(),
            config.tracing_pipeline.sampling.clone(),
            reporter.clone(),
        ));

        let sink = build_sink(&config.audit.storage, overrides.audit_sink)?;
        let audit = AuditPipeline::new(config.audit.pipeline.clone(), sink);

        let backend: Arc<dyn Backend> = match overrides.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new(
                config.backend_url.clone(),
                Duration::from_millis(config.upstream.request_timeout_ms),
            )?),
        };
        let breaker = Arc::new(CircuitBreaker::new(config.upstream.circuit_breaker.clone()));

        let filters = Arc::new(build_filters(
            traces.clone(),
            limits.clone(),
            config.queued_rate_limit.enabled,
        ));

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            filters,
            limits,
            queue,
            qps,
            traces,
            reporter,
            audit,
            backend,
            breaker,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flip into shutdown mode: new requests get 503 immediately.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.queue.close();
    }

    /// Drain the audit and trace queues within the configured deadline.
    pub async fn drain(&self) {
        let deadline =
            Duration::from_secs(self.config.load().shutdown.drain_timeout_secs.max(1));
        self.audit.shutdown(deadline).await;
        if let Some(ref reporter) = self.reporter {
            reporter.shutdown(deadline).await;
        }
        info!("server: queues drained");
    }
}

fn build_sink(
    storage: &AuditStorageConfig,
    injected: Option<Arc<dyn AuditSink>>,
) -> Result<Arc<dyn AuditSink>> {
    // An injected sink always wins; it is how the externally-drived
    // backends (and tests) plug in.
    if let Some(sink) = injected {
        return Ok(sink);
    }
    match storage.storage_type.as_str() {
        "file" => Ok(Arc::new(FileSink::new(
            storage.path.clone(),
            storage.max_file_bytes,
        ))),
        other => anyhow::bail!(
            "audit.storage.type={other} requires an injected AuditSink driver"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;

    #[tokio::test]
    async fn test_state_builds_with_defaults() {
        let state = GatewayState::new(CoreConfig::default()).unwrap();
        assert!(!state.shutting_down.load(Ordering::Acquire));
        assert!(state.reporter.is_none());
        assert_eq!(state.filters.len(), 2);
    }

    #[tokio::test]
    async fn test_non_file_storage_requires_injected_sink() {
        let mut config = CoreConfig::default();
        config.audit.storage.storage_type = "kafka".to_string();
        assert!(GatewayState::new(config.clone()).is_err());

        let overrides = StateOverrides {
            audit_sink: Some(Arc::new(MemorySink::new())),
            ..Default::default()
        };
        assert!(GatewayState::with_overrides(config, overrides).is_ok());
    }

    #[tokio::test]
    async fn test_begin_shutdown_flips_flag() {
        let state = GatewayState::new(CoreConfig::default()).unwrap();
        state.begin_shutdown();
        assert!(state.shutting_down.load(Ordering::Acquire));
    }
}
