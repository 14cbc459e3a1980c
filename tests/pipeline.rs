//! End-to-end scenarios driving the full request pipeline with a stub
//! backend: admission across tiers, burst handling, queued execution with
//! priorities, degraded distributed mode, and the audit/trace egress
//! guarantees.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tollgate::audit::MemorySink;
use tollgate::config::{CoreConfig, TierLimitConfig};
use tollgate::error::GatewayError;
use tollgate::limit::{CounterStore, StoreError};
use tollgate::proxy::context::BoxBody;
use tollgate::proxy::handle_request;
use tollgate::server::{GatewayState, StateOverrides};
use tollgate::upstream::{Backend, BackendRequest, BackendResponse};

/// Backend double: records every call, honors an `x-test-delay-ms` header,
/// and can be switched into failure mode.
struct StubBackend {
    calls: Mutex<Vec<String>>,
    seen_headers: Mutex<Vec<HeaderMap>>,
    failures: AtomicU64,
}

impl StubBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            seen_headers: Mutex::new(Vec::new()),
            failures: AtomicU64::new(0),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn fail_next(&self, n: u64) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn call(&self, req: BackendRequest) -> Result<BackendResponse, GatewayError> {
        let delay = req
            .headers
            .get("x-test-delay-ms")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        self.calls.lock().unwrap().push(req.path_and_query.clone());
        self.seen_headers.lock().unwrap().push(req.headers.clone());

        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Backend("stub backend down".into()));
        }

        Ok(BackendResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"ok\":true}"),
        })
    }

    fn describe(&self) -> String {
        "stub".to_string()
    }
}

struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn incr(&self, _key: &str, _ttl: Duration) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("store down".into()))
    }

    async fn get(&self, _key: &str) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("store down".into()))
    }
}

fn tier(max_requests: u64, burst_size: u64) -> TierLimitConfig {
    TierLimitConfig {
        enabled: true,
        max_requests,
        burst_size,
        window_size_secs: 1,
    }
}

/// A config with only the global tier active, tracing on, audit fast.
fn base_config(global: TierLimitConfig) -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.rate_limit.global = global;
    cfg.rate_limit.per_api.enabled = false;
    cfg.rate_limit.per_ip.enabled = false;
    cfg.rate_limit.per_user.enabled = false;
    cfg.tracing_pipeline.sampling.rate = 1.0;
    cfg.audit.pipeline.flush_interval_ms = 50;
    cfg.audit.pipeline.batch_size = 10;
    cfg
}

struct Harness {
    state: GatewayState,
    backend: Arc<StubBackend>,
    audit_sink: Arc<MemorySink>,
}

fn harness(config: CoreConfig) -> Harness {
    harness_with_store(config, None)
}

fn harness_with_store(config: CoreConfig, store: Option<Arc<dyn CounterStore>>) -> Harness {
    let backend = StubBackend::new();
    let audit_sink = Arc::new(MemorySink::new());
    let state = GatewayState::with_overrides(
        config,
        StateOverrides {
            backend: Some(backend.clone()),
            audit_sink: Some(audit_sink.clone()),
            counter_store: store,
        },
    )
    .expect("state builds");
    Harness {
        state,
        backend,
        audit_sink,
    }
}

fn peer() -> SocketAddr {
    "10.0.0.99:52000".parse().unwrap()
}

async fn send(
    state: &GatewayState,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> hyper::Response<BoxBody> {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Full::new(Bytes::new())).unwrap();
    handle_request(req, state.clone(), peer()).await.unwrap()
}

async fn body_json(resp: hyper::Response<BoxBody>) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn steady_admits_up_to_limit_then_429() {
    let h = harness(base_config(tier(10, 0)));

    for i in 0..9 {
        let resp = send(&h.state, "GET", "/v1/orders", &[]).await;
        assert_eq!(resp.status(), StatusCode::OK, "request {i}");
    }
    // Boundary: the 10th within the same window still passes.
    let resp = send(&h.state, "GET", "/v1/orders", &[]).await;
    assert_eq!(resp.status(), StatusCode::OK);

    // The 11th is over the limit.
    let resp = send(&h.state, "GET", "/v1/orders", &[]).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "60");
    let body = body_json(resp).await;
    assert_eq!(body["code"], 429);
    assert_eq!(body["queueStatus"], "rejected");
    assert_eq!(body["retryAfter"], 60);
    assert!(body["timestamp"].is_string());

    assert_eq!(h.backend.calls().len(), 10);
}

#[tokio::test]
async fn burst_allowance_then_drains_after_window() {
    let h = harness(base_config(tier(5, 5)));

    for i in 0..10 {
        let resp = send(&h.state, "GET", "/v1/pay", &[]).await;
        assert_eq!(resp.status(), StatusCode::OK, "request {i} (5 normal + 5 burst)");
    }
    let resp = send(&h.state, "GET", "/v1/pay", &[]).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // A fresh window restores the allowance.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let resp = send(&h.state, "GET", "/v1/pay", &[]).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn queued_requests_execute_in_priority_order() {
    let mut cfg = base_config(tier(1, 0));
    cfg.rate_limit.global.window_size_secs = 60; // only A is admitted outright
    cfg.queued_rate_limit.enabled = true;
    cfg.queued_rate_limit.max_queue_size = 3;
    cfg.queued_rate_limit.max_concurrency = 1;
    cfg.queued_rate_limit.enable_priority = true;
    cfg.queued_rate_limit.max_wait_time_ms = 5_000;
    let h = harness(cfg);

    // A holds the single execution slot for 300ms.
    let a = {
        let state = h.state.clone();
        tokio::spawn(async move {
            send(&state, "GET", "/a", &[("x-test-delay-ms", "300")]).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B(9), C(0), D(5) arrive in that order and park.
    let mut parked = Vec::new();
    for (path, priority) in [("/b", "9"), ("/c", "0"), ("/d", "5")] {
        let state = h.state.clone();
        let priority = priority.to_string();
        let path = path.to_string();
        parked.push(tokio::spawn(async move {
            send(&state, "GET", &path, &[("x-request-priority", &priority)]).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Queue is at capacity: a fifth submission is rejected outright.
    let resp = send(&h.state, "GET", "/e", &[]).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    assert_eq!(a.await.unwrap().status(), StatusCode::OK);
    for handle in parked {
        assert_eq!(handle.await.unwrap().status(), StatusCode::OK);
    }

    // Strict priority: C(0) before D(5) before B(9), FIFO within a class.
    assert_eq!(h.backend.calls(), vec!["/a", "/c", "/d", "/b"]);
}

#[tokio::test]
async fn queue_full_serves_fallback_body() {
    let mut cfg = base_config(tier(1, 0));
    cfg.rate_limit.global.window_size_secs = 60;
    cfg.queued_rate_limit.enabled = true;
    cfg.queued_rate_limit.max_queue_size = 0;
    cfg.queued_rate_limit.max_concurrency = 1;
    cfg.queued_rate_limit.enable_fallback = true;
    let h = harness(cfg);

    let a = {
        let state = h.state.clone();
        tokio::spawn(
            async move { send(&state, "GET", "/slow", &[("x-test-delay-ms", "200")]).await },
        )
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resp = send(&h.state, "GET", "/overflow", &[]).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(resp).await;
    assert_eq!(body["code"], 503);
    assert_eq!(body["data"], serde_json::Value::Null);
    assert_eq!(body["queueKey"], "global:*");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Service temporarily unavailable"));
    assert!(body["timestamp"].is_number());

    assert_eq!(a.await.unwrap().status(), StatusCode::OK);
    // The fallback never reached the backend.
    assert_eq!(h.backend.calls(), vec!["/slow"]);
}

#[tokio::test]
async fn distributed_store_failure_fails_open_to_local() {
    let mut cfg = base_config(tier(100, 0));
    cfg.rate_limit.distributed.enabled = true;
    let h = harness_with_store(cfg, Some(Arc::new(FailingStore)));

    let resp = send(&h.state, "GET", "/v1/users", &[]).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert!(body.get("error").is_none());

    assert!(h.state.limits.degraded_total() >= 1);
}

#[tokio::test]
async fn trace_headers_roundtrip_to_backend() {
    let h = harness(base_config(tier(100, 0)));

    let resp = send(
        &h.state,
        "GET",
        "/v1/traced",
        &[
            ("x-trace-id", "00000000000000aa"),
            ("x-span-id", "00000000000000bb"),
        ],
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // Outbound hop: same trace, fresh span, caller's span as parent.
    let seen = h.backend.seen_headers.lock().unwrap();
    let outbound = seen.last().unwrap();
    assert_eq!(outbound.get("x-trace-id").unwrap(), "00000000000000aa");
    assert_eq!(
        outbound.get("x-parent-span-id").unwrap(),
        "00000000000000bb"
    );
    let fresh = outbound.get("x-span-id").unwrap().to_str().unwrap();
    assert_ne!(fresh, "00000000000000bb");
    assert_eq!(fresh.len(), 16);
    assert!(outbound.get("x-request-id").is_some());
    assert!(outbound.get("x-correlation-id").is_some());
    assert_eq!(outbound.get("x-sampled").unwrap(), "1");
}

#[tokio::test]
async fn response_carries_correlation_headers() {
    let h = harness(base_config(tier(100, 0)));

    let resp = send(&h.state, "GET", "/v1/x", &[("x-correlation-id", "corr-42")]).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("x-trace-id").is_some());
    assert!(resp.headers().get("x-request-id").is_some());
    assert_eq!(resp.headers().get("x-correlation-id").unwrap(), "corr-42");
}

#[tokio::test]
async fn audit_records_admits_and_denials() {
    let h = harness(base_config(tier(1, 0)));

    assert_eq!(
        send(&h.state, "GET", "/v1/a", &[]).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        send(&h.state, "GET", "/v1/a", &[]).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    h.state.audit.flush().await.unwrap();
    let actions: Vec<String> = h
        .audit_sink
        .events()
        .iter()
        .map(|e| e.action.clone())
        .collect();
    assert!(actions.contains(&"request.begin".to_string()));
    assert!(actions.contains(&"request.end".to_string()));
    assert!(actions.contains(&"request.denied".to_string()));
}

#[tokio::test]
async fn every_request_completes_exactly_one_trace() {
    let h = harness(base_config(tier(2, 0)));

    assert_eq!(
        send(&h.state, "GET", "/v1/t", &[]).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        send(&h.state, "GET", "/v1/t", &[]).await.status(),
        StatusCode::OK
    );
    // The denied request also completes its trace.
    assert_eq!(
        send(&h.state, "GET", "/v1/t", &[]).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let stats = h.state.traces.stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn qps_engine_counts_every_request() {
    let h = harness(base_config(tier(100, 0)));

    for _ in 0..3 {
        send(&h.state, "GET", "/v1/q", &[("x-user-id", "alice")]).await;
    }
    send(&h.state, "GET", "/important/q", &[]).await;

    let snap = h.state.qps.snapshot();
    assert_eq!(snap.global, 4);
    assert_eq!(snap.api["/v1/q"], 3);
    assert_eq!(snap.api["/important/q"], 1);
    assert_eq!(snap.user["alice"], 3);
    assert_eq!(snap.priority["9"], 3);
    assert_eq!(snap.priority["0"], 1);
}

#[tokio::test]
async fn backend_errors_propagate_then_trip_breaker() {
    let mut cfg = base_config(tier(100, 0));
    cfg.upstream.circuit_breaker.failure_threshold = 2;
    cfg.upstream.circuit_breaker.open_duration_secs = 60;
    let h = harness(cfg);

    h.backend.fail_next(2);
    for _ in 0..2 {
        let resp = send(&h.state, "GET", "/v1/b", &[]).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    // Breaker is now open: the backend is not called again.
    let calls_before = h.backend.calls().len();
    let resp = send(&h.state, "GET", "/v1/b", &[]).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(h.backend.calls().len(), calls_before);
    assert_eq!(h.state.breaker.state_name(), "open");
}

#[tokio::test]
async fn shutdown_rejects_new_requests() {
    let h = harness(base_config(tier(100, 0)));
    h.state.begin_shutdown();

    let resp = send(&h.state, "GET", "/v1/late", &[]).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn per_ip_tier_isolates_clients() {
    let mut cfg = base_config(tier(1_000, 0));
    cfg.rate_limit.per_ip = tier(2, 0);
    let h = harness(cfg);

    for _ in 0..2 {
        let resp = send(&h.state, "GET", "/v1/i", &[("x-forwarded-for", "203.0.113.5")]).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = send(&h.state, "GET", "/v1/i", &[("x-forwarded-for", "203.0.113.5")]).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different client IP is unaffected.
    let resp = send(&h.state, "GET", "/v1/i", &[("x-forwarded-for", "203.0.113.6")]).await;
    assert_eq!(resp.status(), StatusCode::OK);
}
