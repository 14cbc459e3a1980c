use http::StatusCode;
use hyper::{Request, Response};
use serde::Serialize;

use super::GatewayState;
use crate::proxy::context::{full_body, BoxBody};

/// Management surface: read-only stats per subsystem, plus the few
/// explicitly-allowed mutations (audit flush, sampling rate, force-sample).
pub async fn handle_admin<B>(
    req: Request<B>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_owned);

    let resp = match (method.as_str(), path.as_str()) {
        ("GET", "/health" | "/healthz") => json_response(
            StatusCode::OK,
            &serde_json::json!({"status": "ok"}),
        ),

        ("GET", "/ready" | "/readyz") => {
            let shutting_down = state
                .shutting_down
                .load(std::sync::atomic::Ordering::Acquire);
            let status = if shutting_down {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            json_response(
                status,
                &serde_json::json!({
                    "status": if shutting_down { "shutting_down" } else { "ready" },
                }),
            )
        }

        ("GET", "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap(),

        ("GET", "/audit/stats") => json_body(&state.audit.stats()),

        ("POST", "/audit/flush") => match state.audit.flush().await {
            Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"flushed": true})),
            Err(e) => json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &serde_json::json!({"error": e.to_string()}),
            ),
        },

        ("GET", "/audit/config") => json_body(&state.config.load().audit),

        ("GET", "/audit/health") => {
            let stats = state.audit.stats();
            let alive = state.audit.worker_alive();
            let status = if alive || !stats.enabled {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(
                status,
                &serde_json::json!({
                    "status": if alive { "ok" } else { "sync_fallback" },
                    "queue_depth": stats.queue_depth,
                    "queue_capacity": stats.queue_capacity,
                    "failed_writes": stats.failed_writes,
                }),
            )
        }

        ("GET", "/trace/stats") => {
            let reporter = state.reporter.as_ref().map(|r| r.stats());
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "manager": state.traces.stats(),
                    "reporter": reporter,
                }),
            )
        }

        ("POST", "/trace/sampling/rate") => match parse_rate(query.as_deref()) {
            Some(rate) => match state.traces.set_sampling_rate(rate) {
                Ok(()) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({"sampling_rate": rate}),
                ),
                Err(e) => json_response(
                    StatusCode::BAD_REQUEST,
                    &serde_json::json!({"error": e.to_string()}),
                ),
            },
            None => json_response(
                StatusCode::BAD_REQUEST,
                &serde_json::json!({"error": "missing or invalid rate parameter"}),
            ),
        },

        ("POST", p) if p.starts_with("/trace/") && p.ends_with("/force-sample") => {
            let trace_id = &p["/trace/".len()..p.len() - "/force-sample".len()];
            if state.traces.force_sample(trace_id) {
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({"trace_id": trace_id, "sampled": true}),
                )
            } else {
                // The override is stored for future spans even when no
                // context is currently active.
                json_response(
                    StatusCode::ACCEPTED,
                    &serde_json::json!({"trace_id": trace_id, "sampled": true, "active": false}),
                )
            }
        }

        ("GET", p) if p.starts_with("/trace/") => {
            let trace_id = &p["/trace/".len()..];
            match state.traces.get(trace_id) {
                Some(ctx) => json_body(&ctx),
                None => json_response(
                    StatusCode::NOT_FOUND,
                    &serde_json::json!({"error": "trace not found", "trace_id": trace_id}),
                ),
            }
        }

        ("GET", "/qps/stats") => json_body(&state.qps.snapshot()),

        ("GET", "/ratelimit/stats") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "tiers": state.limits.stats(),
                "degraded_total": state.limits.degraded_total(),
                "queue": state.queue.stats(),
                "circuit_breaker": state.breaker.snapshot(),
            }),
        ),

        _ => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({"error": "not found"}),
        ),
    };

    Ok(resp)
}

fn parse_rate(query: Option<&str>) -> Option<f64> {
    query?
        .split('&')
        .find_map(|kv| kv.strip_prefix("rate="))
        .and_then(|v| v.parse::<f64>().ok())
}

fn json_body<T: Serialize>(value: &T) -> Response<BoxBody> {
    match serde_json::to_string_pretty(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap(),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &serde_json::json!({"error": e.to_string()}),
        ),
    }
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(value.to_string()))
        .unwrap()
}
