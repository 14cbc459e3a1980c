use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::audit::AuditEvent;
use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::proxy::filter::FilterResult;
use crate::proxy::identity;
use crate::server::GatewayState;
use crate::upstream::{BackendRequest, BreakerCheck};

/// Handle one request through the phased pipeline:
///
/// 1. IDENTITY      — derive the immutable request identity
/// 2. ON_REQUEST    — filter chain (trace, rate limit)
/// 3. QUEUE/EXECUTE — queued admission wrapping audit-begin + backend call
/// 4. ON_RESPONSE   — filter chain in reverse
/// 5. FINISH        — QPS record, audit outcome, trace completion, metrics
///
/// A short-circuiting filter skips phases 3 and earlier egress filters,
/// but phase 5 runs for every request.
pub async fn handle_request<B>(
    req: Request<B>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error>
where
    B: hyper::body::Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    if state.shutting_down.load(Ordering::Acquire) {
        return Ok(Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("content-type", "application/json")
            .body(full_body(r#"{"error":"gateway is shutting down","code":503}"#))
            .unwrap());
    }

    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let method = parts.method.as_str().to_string();
    let mut req_headers = parts.headers;

    let identity = identity::extract(&req_headers, peer_addr.ip(), &path, &method);
    // The trace layer reads the correlation id from the headers; make a
    // generated one visible there too.
    if !req_headers.contains_key(identity::HEADER_CORRELATION_ID) {
        if let Ok(v) = HeaderValue::from_str(&identity.correlation_id) {
            req_headers.insert(identity::HEADER_CORRELATION_ID, v);
        }
    }

    let mut ctx = RequestContext::new(identity);
    metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);

    // Ingress filters.
    for filter in state.filters.iter() {
        if let FilterResult::Reject(mut resp) = filter.on_request(&mut ctx, &req_headers).await {
            finish(&state, &ctx, &mut resp).await;
            return Ok(resp);
        }
    }

    // The backend call needs the whole body; bail out early on a broken
    // client stream.
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("proxy: request body read failed: {}", e);
            let mut resp = ctx.error_response(StatusCode::BAD_REQUEST, "request body read failed");
            finish(&state, &ctx, &mut resp).await;
            return Ok(resp);
        }
    };

    let admitted = ctx
        .decision
        .as_ref()
        .map(|d| d.is_admitted())
        .unwrap_or(true);

    let mut response = if state.queue.config().enabled {
        let queue_key = ctx.denied_key().unwrap_or("global:*").to_string();
        let fallback_key = queue_key.clone();
        let work = execute(&state, &ctx, req_headers, path_and_query, body);
        let fallback = async {
            metrics::counter!("gateway_fallback_served_total").increment(1);
            ctx.fallback_response(&fallback_key)
        };

        match state
            .queue
            .admit(
                &queue_key,
                ctx.identity.priority,
                admitted,
                work,
                Some(fallback),
            )
            .await
        {
            Ok(resp) => resp,
            Err(err) => queue_error_response(&state, &ctx, err),
        }
    } else if admitted {
        execute(&state, &ctx, req_headers, path_and_query, body).await
    } else {
        // The rate-limit filter already rejects denials when queueing is
        // off; this is the fail-closed belt for a misordered chain.
        ctx.rate_limited_response()
    };

    finish(&state, &ctx, &mut response).await;
    Ok(response)
}

/// Audit-begin plus the guarded backend call. Runs only once admission
/// (limiter and, when enabled, queue slot) has succeeded.
async fn execute(
    state: &GatewayState,
    ctx: &RequestContext,
    mut headers: HeaderMap,
    path_and_query: String,
    body: Bytes,
) -> Response<BoxBody> {
    ctx.mark_executed();
    let begin = AuditEvent::new(
        "request.begin",
        format!("{} {}", ctx.identity.method, ctx.identity.path),
    )
    .with_subject(audit_subject(ctx))
    .with_tenant(ctx.identity.tenant_id.clone());
    if let Err(e) = state.audit.log(begin).await {
        debug!("proxy: audit begin dropped: {}", e);
    }

    if matches!(state.breaker.check(), BreakerCheck::Rejected) {
        metrics::counter!("gateway_circuit_breaker_rejected_total").increment(1);
        run_error_filters(state, ctx, &GatewayError::CircuitOpen);
        return ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "upstream circuit open");
    }

    if let Some(ref trace) = ctx.trace {
        state.traces.inject_headers(trace, &mut headers);
        trace
            .lock()
            .unwrap()
            .add_event("backend.call", path_and_query.clone());
    }

    let backend_req = BackendRequest {
        method: ctx.identity.method.clone(),
        path_and_query,
        headers,
        body,
    };

    match state.backend.call(backend_req).await {
        Ok(backend_resp) => {
            state.breaker.record_success();
            let mut resp = Response::builder()
                .status(backend_resp.status)
                .body(full_body(backend_resp.body))
                .unwrap();
            *resp.headers_mut() = backend_resp.headers;
            for name in [CONNECTION, TRANSFER_ENCODING, CONTENT_LENGTH] {
                resp.headers_mut().remove(name);
            }
            resp
        }
        Err(err) => {
            state.breaker.record_failure();
            metrics::counter!("gateway_backend_errors_total").increment(1);
            warn!(
                "proxy: backend call failed, method={}, path={}: {}",
                ctx.identity.method, ctx.identity.path, err
            );
            run_error_filters(state, ctx, &err);
            ctx.error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

/// Map a queued-limiter error onto the wire per the rejection contract:
/// queue full → 429 with retry hint, timeout → 503.
fn queue_error_response(
    state: &GatewayState,
    ctx: &RequestContext,
    err: GatewayError,
) -> Response<BoxBody> {
    run_error_filters(state, ctx, &err);
    match err {
        GatewayError::QueueFull { .. } => {
            metrics::counter!("gateway_queue_rejected_total").increment(1);
            ctx.rate_limited_response()
        }
        GatewayError::QueueTimeout(_) => {
            metrics::counter!("gateway_queue_timeout_total").increment(1);
            ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "queue wait timed out")
        }
        GatewayError::ShuttingDown => {
            ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "gateway is shutting down")
        }
        other => {
            warn!("proxy: unexpected queue error: {}", other);
            ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn run_error_filters(state: &GatewayState, ctx: &RequestContext, err: &GatewayError) {
    for filter in state.filters.iter().rev() {
        filter.on_error(ctx, err);
    }
}

/// Egress-only phase: runs for every request, short-circuited or not.
async fn finish(state: &GatewayState, ctx: &RequestContext, resp: &mut Response<BoxBody>) {
    for filter in state.filters.iter().rev() {
        filter.on_response(ctx, resp);
    }

    let status = resp.status().as_u16();

    state.qps.record(
        &ctx.identity.path,
        &ctx.identity.ip_string(),
        ctx.identity.user_id.as_deref(),
        ctx.identity.priority,
    );

    let denied = ctx
        .decision
        .as_ref()
        .map(|d| !d.is_admitted())
        .unwrap_or(false);
    let mut buf = itoa::Buffer::new();
    let status_str = buf.format(status);
    let event = if denied && !ctx.was_executed() {
        AuditEvent::new(
            "request.denied",
            format!(
                "{} {} key={}",
                ctx.identity.method,
                ctx.identity.path,
                ctx.denied_key().unwrap_or("")
            ),
        )
        .with_outcome("rate_limited")
    } else {
        AuditEvent::new(
            "request.end",
            format!(
                "{} {} status={}",
                ctx.identity.method, ctx.identity.path, status_str
            ),
        )
        .with_outcome(status_str.to_owned())
    }
    .with_subject(audit_subject(ctx))
    .with_tenant(ctx.identity.tenant_id.clone());

    // Infrastructure failure must not change the request outcome.
    if let Err(e) = state.audit.log(event).await {
        debug!("proxy: audit outcome dropped: {}", e);
    }

    if let Some(trace_id) = ctx.trace_id() {
        state.traces.complete(&trace_id, status);
    }

    ctx.finalize_metrics(status);
}

fn audit_subject(ctx: &RequestContext) -> String {
    ctx.identity
        .user_id
        .clone()
        .unwrap_or_else(|| ctx.identity.ip_string())
}
