use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Milliseconds on a monotonic clock anchored at first use. Wall-clock jumps
/// (NTP, suspend) never move window boundaries backwards.
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// One rotation of the window: a start timestamp and an atomic counter.
struct WindowSlot {
    start_ms: u64,
    counter: AtomicU64,
}

/// Counter scoped to the last `window_ms` milliseconds, approximated by a
/// rotating fixed-duration window.
///
/// The fast path is a single atomic increment. Rotation replaces the slot
/// through a compare-and-swap on the slot reference: two threads may both
/// attempt the swap, exactly one wins, and the loser adopts the winner's
/// slot. Stale slots may exist transiently behind `Arc`s held by concurrent
/// callers; only the installed slot is authoritative.
pub struct SlidingWindow {
    window_ms: u64,
    slot: ArcSwap<WindowSlot>,
    /// Last increment timestamp, used by owners of keyed maps to evict
    /// idle entries.
    last_access_ms: AtomicU64,
}

impl SlidingWindow {
    pub fn new(window_ms: u64) -> Self {
        let now = now_ms();
        Self {
            window_ms: window_ms.max(1),
            slot: ArcSwap::new(Arc::new(WindowSlot {
                start_ms: now,
                counter: AtomicU64::new(0),
            })),
            last_access_ms: AtomicU64::new(now),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Increment the current window and return the new count.
    pub fn increment(&self, now: u64) -> u64 {
        self.last_access_ms.store(now, Ordering::Relaxed);
        let slot = self.rotate(now);
        slot.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Count in the current window; 0 once the window has expired.
    pub fn current(&self, now: u64) -> u64 {
        let slot = self.slot.load();
        if now.saturating_sub(slot.start_ms) >= self.window_ms {
            0
        } else {
            slot.counter.load(Ordering::Acquire)
        }
    }

    /// Milliseconds since the last increment.
    pub fn idle_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access_ms.load(Ordering::Relaxed))
    }

    fn rotate(&self, now: u64) -> Arc<WindowSlot> {
        let mut current = self.slot.load_full();
        while now.saturating_sub(current.start_ms) >= self.window_ms {
            let fresh = Arc::new(WindowSlot {
                start_ms: now,
                counter: AtomicU64::new(0),
            });
            let prev = self.slot.compare_and_swap(&current, fresh.clone());
            if Arc::ptr_eq(&prev, &current) {
                // We installed the fresh slot.
                current = fresh;
            } else {
                // Another thread rotated first; use its slot.
                current = Arc::clone(&prev);
            }
        }
        current
    }
}
