use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the request pipeline.
///
/// Business errors (rate limit, queue) become structured HTTP responses;
/// infrastructure errors (reporter, audit sink, distributed store) stay
/// internal and must not change the outcome of the request that hit them.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded, key={key}")]
    RateLimitExceeded { key: String },

    #[error("queue full, key={key}")]
    QueueFull { key: String },

    #[error("queue wait timed out after {0:?}")]
    QueueTimeout(Duration),

    #[error("distributed store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("upstream circuit open")]
    CircuitOpen,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("trace reporter error: {0}")]
    Reporter(String),

    #[error("audit sink error: {0}")]
    AuditSink(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("gateway is shutting down")]
    ShuttingDown,
}
