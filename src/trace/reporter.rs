use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ReporterConfig;
use crate::trace::context::TraceContext;

#[derive(Debug, Clone, Serialize)]
pub struct ReporterStatsSnapshot {
    pub enabled: bool,
    pub endpoint: String,
    pub submitted: u64,
    pub failed_reports: u64,
    pub exported: u64,
    pub batches: u64,
    pub export_errors: u64,
}

#[derive(Default)]
struct ReporterCounters {
    submitted: AtomicU64,
    failed_reports: AtomicU64,
    exported: AtomicU64,
    batches: AtomicU64,
    export_errors: AtomicU64,
}

/// Ships completed spans to the collector in batches.
///
/// `submit` never blocks: the queue is bounded and a full queue drops the
/// new span (`failed_reports`). A single worker flushes when `batch_size`
/// accumulates or `flush_interval` elapses, whichever first. The collector
/// is best effort: transport errors discard the batch without retry.
pub struct TraceReporter {
    config: ReporterConfig,
    tx: mpsc::Sender<TraceContext>,
    counters: Arc<ReporterCounters>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TraceReporter {
    pub fn spawn(config: ReporterConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let counters = Arc::new(ReporterCounters::default());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(worker_loop(
            rx,
            config.clone(),
            counters.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            config,
            tx,
            counters,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Non-blocking submit; full queue drops the new span.
    pub fn submit(&self, ctx: TraceContext) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if self.tx.try_send(ctx).is_err() {
            self.counters.failed_reports.fetch_add(1, Ordering::Relaxed);
            debug!("trace: reporter queue full, span dropped");
        }
    }

    /// Drain the queue and stop the worker, bounded by `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        self.cancel.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("trace: reporter drain exceeded {:?}, abandoning", deadline);
            }
        }
    }

    pub fn stats(&self) -> ReporterStatsSnapshot {
        ReporterStatsSnapshot {
            enabled: self.config.enabled,
            endpoint: self.config.endpoint.clone(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            failed_reports: self.counters.failed_reports.load(Ordering::Relaxed),
            exported: self.counters.exported.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            export_errors: self.counters.export_errors.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<TraceContext>,
    config: ReporterConfig,
    counters: Arc<ReporterCounters>,
    cancel: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("trace: reporter disabled, client build failed: {}", e);
            // Keep draining so producers never observe a closed channel.
            while rx.recv().await.is_some() {}
            return;
        }
    };

    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<TraceContext> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                flush(&client, &config, &counters, &mut batch).await;
            }
            item = rx.recv() => match item {
                Some(ctx) => {
                    batch.push(ctx);
                    if batch.len() >= batch_size {
                        flush(&client, &config, &counters, &mut batch).await;
                    }
                }
                None => break,
            }
        }
    }

    // Shutdown drain: whatever is already queued goes out in final batches.
    while let Ok(ctx) = rx.try_recv() {
        batch.push(ctx);
        if batch.len() >= batch_size {
            flush(&client, &config, &counters, &mut batch).await;
        }
    }
    flush(&client, &config, &counters, &mut batch).await;
}

async fn flush(
    client: &reqwest::Client,
    config: &ReporterConfig,
    counters: &ReporterCounters,
    batch: &mut Vec<TraceContext>,
) {
    if batch.is_empty() {
        return;
    }
    let spans = std::mem::take(batch);

    match client.post(&config.endpoint).json(&spans).send().await {
        Ok(resp) if resp.status().is_success() => {
            counters
                .exported
                .fetch_add(spans.len() as u64, Ordering::Relaxed);
            counters.batches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(resp) => {
            counters.export_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "trace: collector rejected batch, status={}, size={}",
                resp.status(),
                spans.len()
            );
        }
        Err(e) => {
            counters.export_errors.fetch_add(1, Ordering::Relaxed);
            warn!("trace: export failed, size={}, error={}", spans.len(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::context::generate_id;

    fn reporter_config(queue_size: usize) -> ReporterConfig {
        ReporterConfig {
            enabled: true,
            // Nothing listens here; exports fail and are discarded, which is
            // exactly the best-effort contract.
            endpoint: "http://127.0.0.1:1/spans".into(),
            batch_size: 10,
            flush_interval_ms: 50,
            timeout_ms: 100,
            queue_size,
        }
    }

    fn span() -> TraceContext {
        let mut ctx = TraceContext::new(
            generate_id(),
            generate_id(),
            None,
            "r".into(),
            "c".into(),
            None,
            None,
            "tollgate".into(),
            "GET /".into(),
            true,
            100,
        );
        ctx.activate();
        ctx.complete(200);
        ctx
    }

    #[tokio::test]
    async fn test_submit_is_nonblocking_and_drops_on_full() {
        let reporter = TraceReporter::spawn(reporter_config(1));
        // Saturate the tiny queue synchronously; overflow must drop, not block.
        for _ in 0..50 {
            reporter.submit(span());
        }
        let stats = reporter.stats();
        assert_eq!(stats.submitted, 50);
        assert!(stats.failed_reports > 0);
        reporter.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_export_errors_are_swallowed() {
        let reporter = TraceReporter::spawn(reporter_config(100));
        for _ in 0..5 {
            reporter.submit(span());
        }
        reporter.shutdown(Duration::from_secs(2)).await;
        let stats = reporter.stats();
        // The unreachable collector means errors, never a panic or a retry loop.
        assert_eq!(stats.exported, 0);
        assert!(stats.export_errors >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded() {
        let reporter = TraceReporter::spawn(reporter_config(100));
        reporter.submit(span());
        let start = std::time::Instant::now();
        reporter.shutdown(Duration::from_secs(2)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
