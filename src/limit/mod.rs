pub mod distributed;
pub mod local;
pub mod queued;
pub mod tiered;
pub mod window;

pub use distributed::{CounterStore, DistributedRateLimiter, MemoryCounterStore, StoreError};
pub use local::{Acquire, LocalRateLimiter};
pub use queued::{QueuedLimiter, QueueStatsSnapshot};
pub use tiered::{LimitDecision, MultiTierLimiter, TieredLimiter};
pub use window::{now_ms, SlidingWindow};
