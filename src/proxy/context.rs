use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::limit::LimitDecision;
use crate::proxy::identity::RequestIdentity;
use crate::trace::TraceContext;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request state accumulated across the filter chain. The identity is
/// immutable for the life of the request; the rest fills in as phases run.
pub struct RequestContext {
    pub identity: RequestIdentity,
    pub start: Instant,
    pub trace: Option<Arc<Mutex<TraceContext>>>,
    pub decision: Option<LimitDecision>,
    /// Set once the request reaches the backend-execution phase. A
    /// limiter-denied request that was queued and later ran is audited as
    /// executed, not as denied.
    executed: AtomicBool,
}

impl RequestContext {
    pub fn new(identity: RequestIdentity) -> Self {
        Self {
            identity,
            start: Instant::now(),
            trace: None,
            decision: None,
            executed: AtomicBool::new(false),
        }
    }

    pub fn mark_executed(&self) {
        self.executed.store(true, Ordering::Release);
    }

    pub fn was_executed(&self) -> bool {
        self.executed.load(Ordering::Acquire)
    }

    pub fn trace_id(&self) -> Option<String> {
        self.trace
            .as_ref()
            .map(|t| t.lock().unwrap().trace_id.clone())
    }

    /// The limiter key this request was denied on, when it was.
    pub fn denied_key(&self) -> Option<&str> {
        self.decision.as_ref().and_then(|d| d.denied_key())
    }

    /// 429 with the structured rate-limit body and a retry hint.
    pub fn rate_limited_response(&self) -> hyper::Response<BoxBody> {
        let body = serde_json::json!({
            "error": "rate limit exceeded",
            "code": 429,
            "queueStatus": "rejected",
            "retryAfter": 60,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        hyper::Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("retry-after", "60")
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    /// 503 served in place of the backend when the queue overflows.
    pub fn fallback_response(&self, queue_key: &str) -> hyper::Response<BoxBody> {
        let body = serde_json::json!({
            "code": 503,
            "message": "Service temporarily unavailable, please try again later",
            "data": null,
            "timestamp": Utc::now().timestamp_millis(),
            "queueKey": queue_key,
        });
        hyper::Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    /// Generic structured error body; the single exit point for the
    /// remaining error paths.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        let body = serde_json::json!({
            "error": msg,
            "code": status.as_u16(),
            "correlationId": self.identity.correlation_id,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    /// Record the final request metrics, exactly once per request.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "method" => self.identity.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!("gateway_http_request_duration_seconds")
            .record(self.start.elapsed().as_secs_f64());

        metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use std::net::IpAddr;

    fn ctx() -> RequestContext {
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        RequestContext::new(crate::proxy::identity::extract(
            &HeaderMap::new(),
            peer,
            "/v1/users",
            "GET",
        ))
    }

    #[test]
    fn test_rate_limited_response_shape() {
        let resp = ctx().rate_limited_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_fallback_response_shape() {
        let resp = ctx().fallback_response("ip:10.0.0.9");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_identity_is_retained() {
        let c = ctx();
        assert_eq!(c.identity.path, "/v1/users");
        assert_eq!(c.identity.method, "GET");
        assert!(c.trace.is_none());
        assert!(c.decision.is_none());
    }
}
