use arc_swap::ArcSwap;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::config::SamplingConfig;
use crate::error::GatewayError;
use crate::trace::context::{generate_id, TraceContext};
use crate::trace::reporter::TraceReporter;

pub const HEADER_TRACE_ID: &str = "x-trace-id";
pub const HEADER_SPAN_ID: &str = "x-span-id";
pub const HEADER_PARENT_SPAN_ID: &str = "x-parent-span-id";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
pub const HEADER_SAMPLED: &str = "x-sampled";

/// Scale a trace id into one of 10 000 sampling buckets, preserving order
/// over the full u64 range. The id's leading 16 hex chars are its numeric
/// value; non-hex ids hash through FNV-1a first.
pub fn trace_bucket(trace_id: &str) -> u64 {
    ((id_value(trace_id) as u128 * 10_000) >> 64) as u64
}

fn id_value(trace_id: &str) -> u64 {
    let hex = trace_id.strip_prefix("0x").unwrap_or(trace_id);
    let head = &hex[..hex.len().min(16)];
    if !head.is_empty() && head.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(v) = u64::from_str_radix(head, 16) {
            return v;
        }
    }
    fnv1a64(trace_id.as_bytes())
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceStatsSnapshot {
    pub sampling_enabled: bool,
    pub sampling_rate: f64,
    pub active: usize,
    pub created: u64,
    pub completed: u64,
    pub expired: u64,
    pub sampled: u64,
}

/// Owns every in-flight trace context.
///
/// Derives or creates contexts from inbound headers, decides sampling
/// deterministically per trace id, injects propagation headers outbound,
/// and hands completed sampled contexts to the reporter. A runtime sampling
/// rate change swaps the config pointer and affects only traces created
/// afterwards.
pub struct TraceManager {
    service_name: String,
    sampling: ArcSwap<SamplingConfig>,
    forced: DashMap<String, ()>,
    active: DashMap<String, Arc<Mutex<TraceContext>>>,
    reporter: Option<Arc<TraceReporter>>,
    created: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
    sampled_total: AtomicU64,
}

impl TraceManager {
    pub fn new(
        service_name: impl Into<String>,
        sampling: SamplingConfig,
        reporter: Option<Arc<TraceReporter>>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            sampling: ArcSwap::new(Arc::new(sampling)),
            forced: DashMap::new(),
            active: DashMap::new(),
            reporter,
            created: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sampled_total: AtomicU64::new(0),
        }
    }

    /// Continue the inbound trace or start a fresh one.
    ///
    /// The caller's span id becomes our parent; the trace id is preserved so
    /// every span of the trace shares one sampling decision.
    pub fn begin(
        &self,
        headers: &HeaderMap,
        operation_name: &str,
        user_id: Option<String>,
        tenant_id: Option<String>,
    ) -> Arc<Mutex<TraceContext>> {
        let trace_id = header_str(headers, HEADER_TRACE_ID)
            .map(str::to_owned)
            .unwrap_or_else(generate_id);
        let parent_span_id = header_str(headers, HEADER_SPAN_ID).map(str::to_owned);
        let request_id = header_str(headers, HEADER_REQUEST_ID)
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let correlation_id = header_str(headers, HEADER_CORRELATION_ID)
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let sampled = self.decide_sampled(&trace_id, headers);
        let cfg = self.sampling.load();

        let mut ctx = TraceContext::new(
            trace_id.clone(),
            generate_id(),
            parent_span_id,
            request_id,
            correlation_id,
            user_id,
            tenant_id,
            self.service_name.clone(),
            operation_name.to_string(),
            sampled,
            cfg.max_spans_per_trace,
        );
        ctx.activate();

        self.created.fetch_add(1, Ordering::Relaxed);
        if sampled {
            self.sampled_total.fetch_add(1, Ordering::Relaxed);
        }

        let ctx = Arc::new(Mutex::new(ctx));
        self.active.insert(trace_id, ctx.clone());
        ctx
    }

    fn decide_sampled(&self, trace_id: &str, headers: &HeaderMap) -> bool {
        let cfg = self.sampling.load();
        if !cfg.enabled {
            return false;
        }
        if self.forced.contains_key(trace_id) {
            return true;
        }
        // An upstream hop that already decided wins, keeping the whole
        // trace consistent.
        if let Some(v) = header_str(headers, HEADER_SAMPLED) {
            return v == "1" || v.eq_ignore_ascii_case("true");
        }
        (trace_bucket(trace_id) as f64) < cfg.rate * 10_000.0
    }

    /// Write propagation headers for the outbound hop.
    pub fn inject_headers(&self, ctx: &Arc<Mutex<TraceContext>>, headers: &mut HeaderMap) {
        let ctx = ctx.lock().unwrap();
        set_header(headers, HEADER_TRACE_ID, &ctx.trace_id);
        set_header(headers, HEADER_SPAN_ID, &ctx.span_id);
        if let Some(ref parent) = ctx.parent_span_id {
            set_header(headers, HEADER_PARENT_SPAN_ID, parent);
        } else {
            headers.remove(HEADER_PARENT_SPAN_ID);
        }
        set_header(headers, HEADER_REQUEST_ID, &ctx.request_id);
        set_header(headers, HEADER_CORRELATION_ID, &ctx.correlation_id);
        set_header(headers, HEADER_SAMPLED, if ctx.sampled { "1" } else { "0" });
    }

    /// Complete and evict a context; sampled contexts go to the reporter.
    pub fn complete(&self, trace_id: &str, status_code: u16) {
        let Some((_, ctx)) = self.active.remove(trace_id) else {
            return;
        };
        let snapshot = {
            let mut guard = ctx.lock().unwrap();
            guard.complete(status_code);
            guard.clone()
        };
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.forced.remove(trace_id);

        if snapshot.sampled {
            if let Some(ref reporter) = self.reporter {
                reporter.submit(snapshot);
            }
        }
    }

    pub fn get(&self, trace_id: &str) -> Option<TraceContext> {
        self.active
            .get(trace_id)
            .map(|entry| entry.value().lock().unwrap().clone())
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling.load().rate
    }

    /// Swap the sampling rate at runtime. Traces already created keep
    /// their decision.
    pub fn set_sampling_rate(&self, rate: f64) -> Result<(), GatewayError> {
        if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
            return Err(GatewayError::Config(format!(
                "sampling rate must be within [0, 1], got {rate}"
            )));
        }
        let current = self.sampling.load();
        self.sampling.store(Arc::new(SamplingConfig {
            rate,
            ..(**current).clone()
        }));
        Ok(())
    }

    /// Force-sample a trace id; applies to its future spans and, when the
    /// context is still active, retroactively to the current one.
    pub fn force_sample(&self, trace_id: &str) -> bool {
        self.forced.insert(trace_id.to_string(), ());
        match self.active.get(trace_id) {
            Some(entry) => {
                let mut ctx = entry.value().lock().unwrap();
                if !ctx.sampled {
                    ctx.sampled = true;
                    self.sampled_total.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Drop contexts retained past `max_age_ms` without completing.
    /// Returns how many were expired.
    pub fn cleanup_expired(&self, max_age_ms: u64) -> usize {
        let max_age_ns = max_age_ms.saturating_mul(1_000_000);
        let mut dropped = 0usize;
        self.active.retain(|trace_id, ctx| {
            let mut guard = ctx.lock().unwrap();
            if guard.age_ns() < max_age_ns {
                return true;
            }
            guard.expire();
            dropped += 1;
            warn!(
                "trace: context expired without completion, trace_id={}, operation={}",
                trace_id, guard.operation_name
            );
            false
        });
        self.expired.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn stats(&self) -> TraceStatsSnapshot {
        let cfg = self.sampling.load();
        TraceStatsSnapshot {
            sampling_enabled: cfg.enabled,
            sampling_rate: cfg.rate,
            active: self.active.len(),
            created: self.created.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            sampled: self.sampled_total.load(Ordering::Relaxed),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}
