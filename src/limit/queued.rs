use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::QueuedLimitConfig;
use crate::error::GatewayError;
use crate::limit::window::now_ms;

/// A request parked behind the limiter, waiting for an execution slot.
///
/// The heap pops the entry with the lowest `(priority, deadline, seq)`.
/// Deadlines within one priority preserve arrival order, so the queue is
/// FIFO within a priority class. Low-priority starvation under sustained
/// high-priority load is accepted.
struct ParkedEntry {
    priority: u8,
    deadline_ms: u64,
    seq: u64,
    wake: oneshot::Sender<OwnedSemaphorePermit>,
}

impl PartialEq for ParkedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ParkedEntry {}

impl PartialOrd for ParkedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParkedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest tuple pops first.
        (other.priority, other.deadline_ms, other.seq).cmp(&(
            self.priority,
            self.deadline_ms,
            self.seq,
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsSnapshot {
    pub enabled: bool,
    pub max_queue_size: usize,
    pub max_concurrency: usize,
    pub depth: usize,
    pub running: usize,
    pub queued_total: u64,
    pub dequeued_total: u64,
    pub timed_out_total: u64,
    pub rejected_full_total: u64,
    pub fallback_total: u64,
    pub cancelled_total: u64,
}

/// Parks over-limit requests instead of dropping them.
///
/// A semaphore caps concurrent execution at `max_concurrency` for all work
/// that flows through the limiter; requests admitted outright hold a
/// permit just like dequeued ones, so the cap is global. Denied requests
/// park in a priority heap bounded by `max_queue_size` and are handed the
/// released permit directly on wakeup.
///
/// Cancellation (the caller's future dropped) or wait timeout simply drops
/// the entry's receiver; the dead entry is skipped when popped, so removal
/// costs O(1) at cancel time.
pub struct QueuedLimiter {
    config: QueuedLimitConfig,
    semaphore: Arc<Semaphore>,
    parked: Mutex<BinaryHeap<ParkedEntry>>,
    seq: AtomicU64,
    closed: AtomicBool,
    queued_total: AtomicU64,
    dequeued_total: AtomicU64,
    timed_out_total: AtomicU64,
    rejected_full_total: AtomicU64,
    fallback_total: AtomicU64,
    cancelled_total: AtomicU64,
}

enum ParkResult {
    /// A slot was free; no parking needed.
    Direct(OwnedSemaphorePermit),
    Parked(oneshot::Receiver<OwnedSemaphorePermit>),
}

impl QueuedLimiter {
    pub fn new(config: QueuedLimitConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            parked: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            queued_total: AtomicU64::new(0),
            dequeued_total: AtomicU64::new(0),
            timed_out_total: AtomicU64::new(0),
            rejected_full_total: AtomicU64::new(0),
            fallback_total: AtomicU64::new(0),
            cancelled_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueuedLimitConfig {
        &self.config
    }

    /// Admit one request through the queueing policy.
    ///
    /// * limiter admitted → run `work` under the concurrency cap
    /// * denied, queue has room → park by `(priority, deadline)`, run on wakeup
    /// * denied, queue full, fallback given and enabled → run `fallback`
    ///   under `fallback_timeout`
    /// * denied, queue full otherwise → `QueueFull`
    /// * parked past `max_wait_time` → `QueueTimeout`
    pub async fn admit<T, W, F>(
        &self,
        key: &str,
        priority: u8,
        admitted: bool,
        work: W,
        fallback: Option<F>,
    ) -> Result<T, GatewayError>
    where
        W: Future<Output = T>,
        F: Future<Output = T>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::ShuttingDown);
        }
        let max_wait = Duration::from_millis(self.config.max_wait_time_ms);

        let permit = if admitted {
            self.acquire_direct(max_wait).await?
        } else {
            match self.try_park(key, priority) {
                Ok(ParkResult::Direct(p)) => p,
                Ok(ParkResult::Parked(rx)) => {
                    // Cover the race where a permit was freed between the
                    // park and the first release.
                    self.kick();
                    match tokio::time::timeout(max_wait, rx).await {
                        Ok(Ok(p)) => {
                            self.dequeued_total.fetch_add(1, Ordering::Relaxed);
                            p
                        }
                        Ok(Err(_)) => return Err(GatewayError::ShuttingDown),
                        Err(_) => {
                            self.timed_out_total.fetch_add(1, Ordering::Relaxed);
                            // A permit handed over concurrently with this
                            // timeout lands back in the semaphore; pass it
                            // on so remaining waiters are not stranded.
                            self.kick();
                            return Err(GatewayError::QueueTimeout(max_wait));
                        }
                    }
                }
                Err(e) => {
                    if self.config.enable_fallback {
                        if let Some(fb) = fallback {
                            self.fallback_total.fetch_add(1, Ordering::Relaxed);
                            let fb_timeout =
                                Duration::from_millis(self.config.fallback_timeout_ms);
                            return tokio::time::timeout(fb_timeout, fb)
                                .await
                                .map_err(|_| GatewayError::QueueTimeout(fb_timeout));
                        }
                    }
                    return Err(e);
                }
            }
        };

        // The guard re-dispatches the permit even if `work` panics or the
        // caller is cancelled mid-flight.
        let guard = SlotGuard {
            limiter: self,
            permit: Some(permit),
        };
        let result = work.await;
        drop(guard);
        Ok(result)
    }

    async fn acquire_direct(
        &self,
        max_wait: Duration,
    ) -> Result<OwnedSemaphorePermit, GatewayError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(p) => Ok(p),
            Err(TryAcquireError::Closed) => Err(GatewayError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {
                match tokio::time::timeout(max_wait, self.semaphore.clone().acquire_owned()).await
                {
                    Ok(Ok(p)) => Ok(p),
                    Ok(Err(_)) => Err(GatewayError::ShuttingDown),
                    Err(_) => {
                        self.timed_out_total.fetch_add(1, Ordering::Relaxed);
                        Err(GatewayError::QueueTimeout(max_wait))
                    }
                }
            }
        }
    }

    fn try_park(&self, key: &str, priority: u8) -> Result<ParkResult, GatewayError> {
        let effective_priority = if self.config.enable_priority {
            priority
        } else {
            0
        };
        let now = now_ms();
        let deadline_ms = now + self.config.max_wait_time_ms;

        let mut heap = self.parked.lock().unwrap();

        // A free slot with nobody ahead of us means no parking at all.
        if heap.is_empty() {
            if let Ok(p) = self.semaphore.clone().try_acquire_owned() {
                return Ok(ParkResult::Direct(p));
            }
        }

        if heap.len() >= self.config.max_queue_size {
            // Dead entries (cancelled or expired waiters) still occupy
            // heap slots until popped; purge before rejecting.
            heap.retain(|e| !e.wake.is_closed() && e.deadline_ms > now);
            if heap.len() >= self.config.max_queue_size {
                self.rejected_full_total.fetch_add(1, Ordering::Relaxed);
                return Err(GatewayError::QueueFull {
                    key: key.to_string(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        heap.push(ParkedEntry {
            priority: effective_priority,
            deadline_ms,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            wake: tx,
        });
        self.queued_total.fetch_add(1, Ordering::Relaxed);
        Ok(ParkResult::Parked(rx))
    }

    /// Hand a freed permit to the best parked entry, or return it to the
    /// semaphore when nobody waits.
    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut permit = permit;
        loop {
            let entry = self.parked.lock().unwrap().pop();
            match entry {
                Some(e) => match e.wake.send(permit) {
                    Ok(()) => return,
                    Err(p) => {
                        // Waiter timed out or was cancelled; skip it.
                        self.cancelled_total.fetch_add(1, Ordering::Relaxed);
                        permit = p;
                    }
                },
                None => {
                    drop(permit);
                    return;
                }
            }
        }
    }

    /// Dispatch a free permit to the queue head, if both exist.
    fn kick(&self) {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            self.release(permit);
        }
    }

    /// Stop admitting work and wake every parked waiter with an error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
        // Dropping the senders delivers RecvError to every parked waiter.
        self.parked.lock().unwrap().clear();
    }

    pub fn depth(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        let max_concurrency = self.config.max_concurrency.max(1);
        QueueStatsSnapshot {
            enabled: self.config.enabled,
            max_queue_size: self.config.max_queue_size,
            max_concurrency,
            depth: self.depth(),
            running: max_concurrency.saturating_sub(self.semaphore.available_permits()),
            queued_total: self.queued_total.load(Ordering::Relaxed),
            dequeued_total: self.dequeued_total.load(Ordering::Relaxed),
            timed_out_total: self.timed_out_total.load(Ordering::Relaxed),
            rejected_full_total: self.rejected_full_total.load(Ordering::Relaxed),
            fallback_total: self.fallback_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
        }
    }
}

struct SlotGuard<'a> {
    limiter: &'a QueuedLimiter,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.limiter.release(permit);
        }
    }
}
