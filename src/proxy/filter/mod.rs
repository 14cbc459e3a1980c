use http::HeaderMap;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::limit::{LimitDecision, MultiTierLimiter};
use crate::proxy::context::{BoxBody, RequestContext};
use crate::trace::TraceManager;

/// Result of a filter's on_request phase.
pub enum FilterResult {
    /// Continue to the next filter / phase.
    Continue,
    /// Short-circuit: return this response immediately.
    Reject(hyper::Response<BoxBody>),
}

/// Enum-based filter — static dispatch, exhaustive match, zero heap
/// allocation per request.
///
/// Filters are plain values built once at startup, in the fixed pipeline
/// order: Trace → RateLimit. Each carries the three capabilities
/// `on_request` / `on_response` / `on_error`; ingress runs them first to
/// last, egress last to first.
pub enum Filter {
    Trace {
        manager: Arc<TraceManager>,
    },
    RateLimit {
        limiter: Arc<MultiTierLimiter>,
        /// With queueing enabled a deny parks instead of rejecting, so the
        /// filter lets the request continue to the queue phase.
        queue_enabled: bool,
    },
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Trace { .. } => f.write_str("Trace"),
            Filter::RateLimit { queue_enabled, .. } => f
                .debug_struct("RateLimit")
                .field("queue_enabled", queue_enabled)
                .finish(),
        }
    }
}

impl Filter {
    /// Request phase — runs before the backend call.
    /// Return `FilterResult::Reject` to short-circuit.
    pub async fn on_request(
        &self,
        ctx: &mut RequestContext,
        req_headers: &HeaderMap,
    ) -> FilterResult {
        match self {
            Filter::Trace { manager } => {
                let operation = format!("{} {}", ctx.identity.method, ctx.identity.path);
                let trace = manager.begin(
                    req_headers,
                    &operation,
                    ctx.identity.user_id.clone(),
                    ctx.identity.tenant_id.clone(),
                );
                ctx.trace = Some(trace);
                FilterResult::Continue
            }
            Filter::RateLimit {
                limiter,
                queue_enabled,
            } => {
                let decision = limiter
                    .check(
                        &ctx.identity.path,
                        &ctx.identity.ip_string(),
                        ctx.identity.user_id.as_deref(),
                    )
                    .await;

                match decision {
                    LimitDecision::Admitted { burst, degraded } => {
                        metrics::counter!("gateway_rate_limit_allowed_total").increment(1);
                        if burst {
                            metrics::counter!("gateway_rate_limit_burst_total").increment(1);
                        }
                        if degraded {
                            metrics::counter!("gateway_rate_limit_degraded_total").increment(1);
                        }
                        ctx.decision = Some(LimitDecision::Admitted { burst, degraded });
                        FilterResult::Continue
                    }
                    LimitDecision::Denied { key } => {
                        tracing::debug!(
                            "filter: rate_limit: denied, key={}, method={}, path={}",
                            key,
                            ctx.identity.method,
                            ctx.identity.path
                        );
                        metrics::counter!("gateway_rate_limit_rejected_total").increment(1);
                        if let Some(ref trace) = ctx.trace {
                            trace
                                .lock()
                                .unwrap()
                                .add_event("rate_limit.denied", key.clone());
                        }

                        ctx.decision = Some(LimitDecision::Denied { key });
                        if *queue_enabled {
                            FilterResult::Continue
                        } else {
                            FilterResult::Reject(ctx.rate_limited_response())
                        }
                    }
                }
            }
        }
    }

    /// Response phase: runs on every outcome, rejections included, in
    /// reverse filter order.
    pub fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        match self {
            Filter::Trace { .. } => {
                // Correlation headers on the downstream response.
                if let Some(ref trace) = ctx.trace {
                    let guard = trace.lock().unwrap();
                    for (name, value) in [
                        (crate::trace::manager::HEADER_TRACE_ID, &guard.trace_id),
                        (crate::trace::manager::HEADER_REQUEST_ID, &guard.request_id),
                        (
                            crate::trace::manager::HEADER_CORRELATION_ID,
                            &guard.correlation_id,
                        ),
                    ] {
                        if let Ok(v) = http::HeaderValue::from_str(value) {
                            resp.headers_mut().insert(name, v);
                        }
                    }
                }
            }
            Filter::RateLimit { .. } => {}
        }
    }

    /// Error phase: annotate, never swallow.
    pub fn on_error(&self, ctx: &RequestContext, error: &GatewayError) {
        match self {
            Filter::Trace { .. } => {
                if let Some(ref trace) = ctx.trace {
                    let mut guard = trace.lock().unwrap();
                    let kind = match error {
                        GatewayError::Backend(_) => "backend",
                        GatewayError::CircuitOpen => "circuit_open",
                        GatewayError::RateLimitExceeded { .. } => "rate_limit",
                        GatewayError::QueueFull { .. } => "queue_full",
                        GatewayError::QueueTimeout(_) => "queue_timeout",
                        _ => "internal",
                    };
                    guard.set_tag("error.type", kind);
                    guard.add_event("error", error.to_string());
                }
            }
            Filter::RateLimit { .. } => {}
        }
    }
}

/// Build the filter chain once at startup. Order matters: the trace filter
/// must see every request, including ones the limiter rejects.
pub fn build_filters(
    manager: Arc<TraceManager>,
    limiter: Arc<MultiTierLimiter>,
    queue_enabled: bool,
) -> Vec<Filter> {
    vec![
        Filter::Trace { manager },
        Filter::RateLimit {
            limiter,
            queue_enabled,
        },
    ]
}
