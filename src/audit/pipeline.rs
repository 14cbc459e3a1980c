use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::audit::event::AuditEvent;
use crate::audit::sink::AuditSink;
use crate::config::AuditPipelineConfig;
use crate::error::GatewayError;

enum PipelineMsg {
    Event(AuditEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct AuditCounters {
    total_logs: AtomicU64,
    async_logs: AtomicU64,
    sync_logs: AtomicU64,
    batch_writes: AtomicU64,
    failed_writes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditStatsSnapshot {
    pub enabled: bool,
    pub sink: String,
    pub total_logs: u64,
    pub async_logs: u64,
    pub sync_logs: u64,
    pub batch_writes: u64,
    pub failed_writes: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

/// Asynchronous, batched audit recorder with a synchronous escape hatch.
///
/// The default path enqueues onto a bounded channel drained by a single
/// worker that writes batches of `batch_size` or every `flush_interval`.
/// When the queue is full, or the worker is gone, the producer writes
/// directly to the sink, so a `log()` that returns `Ok` has its event
/// durably handed to the sink exactly once, always.
pub struct AuditPipeline {
    config: AuditPipelineConfig,
    sink: Arc<dyn AuditSink>,
    tx: mpsc::Sender<PipelineMsg>,
    counters: Arc<AuditCounters>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditPipeline {
    pub fn new(config: AuditPipelineConfig, sink: Arc<dyn AuditSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let counters = Arc::new(AuditCounters::default());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(worker_loop(
            rx,
            config.clone(),
            sink.clone(),
            counters.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            config,
            sink,
            tx,
            counters,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Record one event. `Ok` means the event reached the queue or the sink;
    /// it will not be silently discarded afterwards.
    pub async fn log(&self, event: AuditEvent) -> Result<(), GatewayError> {
        if !self.config.enabled {
            return self.sync_write(event).await;
        }
        match self.tx.try_send(PipelineMsg::Event(event)) {
            Ok(()) => {
                self.counters.async_logs.fetch_add(1, Ordering::Relaxed);
                self.counters.total_logs.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(PipelineMsg::Event(event)))
            | Err(mpsc::error::TrySendError::Closed(PipelineMsg::Event(event))) => {
                // Queue saturated or worker faulted: degrade to a direct write.
                self.sync_write(event).await
            }
            Err(_) => unreachable!("only events are submitted through log()"),
        }
    }

    async fn sync_write(&self, event: AuditEvent) -> Result<(), GatewayError> {
        match self.sink.write_batch(std::slice::from_ref(&event)).await {
            Ok(()) => {
                self.counters.sync_logs.fetch_add(1, Ordering::Relaxed);
                self.counters.total_logs.fetch_add(1, Ordering::Relaxed);
                self.counters.batch_writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                error!("audit: sync write failed, action={}: {}", event.action, e);
                Err(e)
            }
        }
    }

    /// Force the worker to write everything queued so far.
    pub async fn flush(&self) -> Result<(), GatewayError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let timeout = Duration::from_millis(self.config.queue_timeout_ms.max(1_000));
        tokio::time::timeout(timeout, self.tx.send(PipelineMsg::Flush(ack_tx)))
            .await
            .map_err(|_| GatewayError::AuditSink("flush enqueue timed out".into()))?
            .map_err(|_| GatewayError::AuditSink("audit worker is gone".into()))?;
        tokio::time::timeout(timeout, ack_rx)
            .await
            .map_err(|_| GatewayError::AuditSink("flush ack timed out".into()))?
            .map_err(|_| GatewayError::AuditSink("audit worker is gone".into()))?;
        Ok(())
    }

    /// Drain the queue and stop the worker, bounded by `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        self.cancel.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("audit: drain exceeded {:?}, abandoning worker", deadline);
            }
        }
    }

    pub fn worker_alive(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> AuditStatsSnapshot {
        let capacity = self.config.queue_size.max(1);
        AuditStatsSnapshot {
            enabled: self.config.enabled,
            sink: self.sink.describe(),
            total_logs: self.counters.total_logs.load(Ordering::Relaxed),
            async_logs: self.counters.async_logs.load(Ordering::Relaxed),
            sync_logs: self.counters.sync_logs.load(Ordering::Relaxed),
            batch_writes: self.counters.batch_writes.load(Ordering::Relaxed),
            failed_writes: self.counters.failed_writes.load(Ordering::Relaxed),
            queue_depth: capacity.saturating_sub(self.tx.capacity()),
            queue_capacity: capacity,
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<PipelineMsg>,
    config: AuditPipelineConfig,
    sink: Arc<dyn AuditSink>,
    counters: Arc<AuditCounters>,
    cancel: CancellationToken,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<AuditEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                write_batch(&sink, &counters, &mut batch).await;
            }
            msg = rx.recv() => match msg {
                Some(PipelineMsg::Event(event)) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        write_batch(&sink, &counters, &mut batch).await;
                    }
                }
                Some(PipelineMsg::Flush(ack)) => {
                    write_batch(&sink, &counters, &mut batch).await;
                    let _ = ack.send(());
                }
                None => break,
            }
        }
    }

    // Shutdown drain.
    while let Ok(msg) = rx.try_recv() {
        match msg {
            PipelineMsg::Event(event) => {
                batch.push(event);
                if batch.len() >= batch_size {
                    write_batch(&sink, &counters, &mut batch).await;
                }
            }
            PipelineMsg::Flush(ack) => {
                write_batch(&sink, &counters, &mut batch).await;
                let _ = ack.send(());
            }
        }
    }
    write_batch(&sink, &counters, &mut batch).await;
}

async fn write_batch(
    sink: &Arc<dyn AuditSink>,
    counters: &AuditCounters,
    batch: &mut Vec<AuditEvent>,
) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);

    match sink.write_batch(&events).await {
        Ok(()) => {
            counters.batch_writes.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed_writes.fetch_add(1, Ordering::Relaxed);
            warn!(
                "audit: batch write failed, size={}, retrying events individually: {}",
                events.len(),
                e
            );
            // The no-loss contract: each event of a failed batch gets one
            // individual retry before being abandoned loudly.
            for event in &events {
                match sink.write_batch(std::slice::from_ref(event)).await {
                    Ok(()) => {
                        counters.batch_writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                        error!("audit: event lost after retry, action={}: {}", event.action, e);
                    }
                }
            }
        }
    }
}
