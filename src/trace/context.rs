use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;
use std::time::Instant;

/// Nanoseconds on a monotonic clock anchored at first use.
pub fn now_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// 64 bits of generator-quality randomness as 16 lowercase hex chars.
/// Zero is reserved as "no id" by most trace wire formats.
pub fn generate_id() -> String {
    loop {
        let v: u64 = rand::random();
        if v != 0 {
            return format!("{v:016x}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceState {
    Created,
    Active,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub message: String,
    pub timestamp_ns: u64,
}

/// One span of a distributed trace, accumulated over a request's lifetime.
///
/// State machine: Created → Active → (Completed | Expired). Terminal states
/// are final. Tag and event counts are bounded; events drop oldest-first on
/// overflow.
#[derive(Debug, Clone, Serialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub request_id: String,
    pub correlation_id: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub service_name: String,
    pub operation_name: String,
    pub start_time_ns: u64,
    pub end_time_ns: Option<u64>,
    pub status_code: Option<u16>,
    pub tags: HashMap<String, String>,
    pub events: VecDeque<TraceEvent>,
    pub sampled: bool,
    pub state: TraceState,
    #[serde(skip)]
    max_records: usize,
}

impl TraceContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trace_id: String,
        span_id: String,
        parent_span_id: Option<String>,
        request_id: String,
        correlation_id: String,
        user_id: Option<String>,
        tenant_id: Option<String>,
        service_name: String,
        operation_name: String,
        sampled: bool,
        max_records: usize,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            request_id,
            correlation_id,
            user_id,
            tenant_id,
            service_name,
            operation_name,
            start_time_ns: now_ns(),
            end_time_ns: None,
            status_code: None,
            tags: HashMap::new(),
            events: VecDeque::new(),
            sampled,
            state: TraceState::Created,
            max_records: max_records.max(1),
        }
    }

    pub fn activate(&mut self) {
        if self.state == TraceState::Created {
            self.state = TraceState::Active;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TraceState::Completed | TraceState::Expired)
    }

    /// Record a named event. Oldest events are dropped once the bound is hit.
    pub fn add_event(&mut self, name: impl Into<String>, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        if self.events.len() >= self.max_records {
            self.events.pop_front();
        }
        self.events.push_back(TraceEvent {
            name: name.into(),
            message: message.into(),
            timestamp_ns: now_ns(),
        });
    }

    /// Set a tag. New keys are ignored once the bound is hit.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let key = key.into();
        if self.tags.len() >= self.max_records && !self.tags.contains_key(&key) {
            return;
        }
        self.tags.insert(key, value.into());
    }

    /// Transition to Completed. Idempotent; `end_time_ns` never precedes
    /// `start_time_ns`.
    pub fn complete(&mut self, status_code: u16) {
        if self.is_terminal() {
            return;
        }
        self.status_code = Some(status_code);
        self.end_time_ns = Some(now_ns().max(self.start_time_ns));
        self.state = TraceState::Completed;
    }

    /// Transition to Expired (retention limit hit before completion).
    pub fn expire(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.end_time_ns = Some(now_ns().max(self.start_time_ns));
        self.state = TraceState::Expired;
    }

    pub fn duration_ns(&self) -> Option<u64> {
        self.end_time_ns.map(|end| end - self.start_time_ns)
    }

    pub fn age_ns(&self) -> u64 {
        now_ns().saturating_sub(self.start_time_ns)
    }
}
