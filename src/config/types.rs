use serde::{Deserialize, Serialize};

/// Top-level gateway core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Base URL of the backend fleet entry point.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub rate_limit: RateLimitTiersConfig,

    #[serde(default)]
    pub queued_rate_limit: QueuedLimitConfig,

    #[serde(default)]
    pub tracing_pipeline: TracingConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            backend_url: default_backend_url(),
            service_name: default_service_name(),
            rate_limit: RateLimitTiersConfig::default(),
            queued_rate_limit: QueuedLimitConfig::default(),
            tracing_pipeline: TracingConfig::default(),
            audit: AuditConfig::default(),
            upstream: UpstreamConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_backend_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_service_name() -> String {
    "tollgate".to_string()
}

/// One admission tier: a window-scoped request budget with burst headroom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub max_requests: u64,

    #[serde(default)]
    pub burst_size: u64,

    #[serde(default = "default_window_secs")]
    pub window_size_secs: u64,
}

fn default_window_secs() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

impl TierLimitConfig {
    fn preset(max_requests: u64, burst_size: u64) -> Self {
        Self {
            enabled: true,
            max_requests,
            burst_size,
            window_size_secs: default_window_secs(),
        }
    }
}

/// The four limiter dimensions plus the optional cluster-wide tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTiersConfig {
    #[serde(default = "default_global_tier")]
    pub global: TierLimitConfig,

    #[serde(default = "default_api_tier")]
    pub per_api: TierLimitConfig,

    #[serde(default = "default_ip_tier")]
    pub per_ip: TierLimitConfig,

    #[serde(default = "default_user_tier")]
    pub per_user: TierLimitConfig,

    #[serde(default)]
    pub distributed: DistributedLimitConfig,
}

impl Default for RateLimitTiersConfig {
    fn default() -> Self {
        Self {
            global: default_global_tier(),
            per_api: default_api_tier(),
            per_ip: default_ip_tier(),
            per_user: default_user_tier(),
            distributed: DistributedLimitConfig::default(),
        }
    }
}

fn default_global_tier() -> TierLimitConfig {
    TierLimitConfig::preset(1_000, 100)
}

fn default_api_tier() -> TierLimitConfig {
    TierLimitConfig::preset(200, 20)
}

fn default_ip_tier() -> TierLimitConfig {
    TierLimitConfig::preset(100, 10)
}

fn default_user_tier() -> TierLimitConfig {
    TierLimitConfig::preset(100, 10)
}

/// Cluster-wide tier consulted through the shared counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Hard deadline for the whole store check; capped at 50ms.
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

impl Default for DistributedLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

fn default_check_timeout_ms() -> u64 {
    50
}

/// Parking policy for over-limit requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_max_wait_time_ms")]
    pub max_wait_time_ms: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_true")]
    pub enable_priority: bool,

    #[serde(default)]
    pub enable_fallback: bool,

    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
}

impl Default for QueuedLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_queue_size: default_max_queue_size(),
            max_wait_time_ms: default_max_wait_time_ms(),
            max_concurrency: default_max_concurrency(),
            enable_priority: true,
            enable_fallback: false,
            fallback_timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_wait_time_ms() -> u64 {
    5_000
}

fn default_max_concurrency() -> usize {
    8
}

fn default_fallback_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub reporter: ReporterConfig,

    #[serde(default)]
    pub cleanup: TraceCleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fraction of traces recorded, within [0, 1].
    #[serde(default = "default_sampling_rate")]
    pub rate: f64,

    #[serde(default = "default_max_spans")]
    pub max_spans_per_trace: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: default_sampling_rate(),
            max_spans_per_trace: default_max_spans(),
        }
    }
}

fn default_sampling_rate() -> f64 {
    0.1
}

fn default_max_spans() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_reporter_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_reporter_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_reporter_flush_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_reporter_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_reporter_queue_size")]
    pub queue_size: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_reporter_endpoint(),
            batch_size: default_reporter_batch_size(),
            flush_interval_ms: default_reporter_flush_ms(),
            timeout_ms: default_reporter_timeout_ms(),
            queue_size: default_reporter_queue_size(),
        }
    }
}

fn default_reporter_endpoint() -> String {
    "http://127.0.0.1:9411/api/v2/spans".to_string()
}

fn default_reporter_batch_size() -> usize {
    100
}

fn default_reporter_flush_ms() -> u64 {
    1_000
}

fn default_reporter_timeout_ms() -> u64 {
    3_000
}

fn default_reporter_queue_size() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceCleanupConfig {
    #[serde(default = "default_cleanup_interval_ms")]
    pub interval_ms: u64,

    /// Contexts older than this without completing are dropped.
    #[serde(default = "default_trace_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for TraceCleanupConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_cleanup_interval_ms(),
            max_age_ms: default_trace_max_age_ms(),
        }
    }
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_trace_max_age_ms() -> u64 {
    600_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub pipeline: AuditPipelineConfig,

    #[serde(default)]
    pub storage: AuditStorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPipelineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_audit_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_audit_flush_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_audit_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_audit_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Batch ordering requires a single worker; values above 1 are clamped.
    #[serde(default = "default_audit_workers")]
    pub worker_threads: usize,
}

impl Default for AuditPipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_audit_batch_size(),
            flush_interval_ms: default_audit_flush_ms(),
            queue_size: default_audit_queue_size(),
            queue_timeout_ms: default_audit_queue_timeout_ms(),
            worker_threads: default_audit_workers(),
        }
    }
}

fn default_audit_batch_size() -> usize {
    100
}

fn default_audit_flush_ms() -> u64 {
    5_000
}

fn default_audit_queue_size() -> usize {
    1_000
}

fn default_audit_queue_timeout_ms() -> u64 {
    100
}

fn default_audit_workers() -> usize {
    1
}

/// Sink selection. `file` is served in-crate; the other types name
/// externally provided drivers and require one to be injected at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStorageConfig {
    /// "file", "database", "elasticsearch", "kafka".
    #[serde(rename = "type", default = "default_storage_type")]
    pub storage_type: String,

    // -- file --
    #[serde(default = "default_audit_path")]
    pub path: String,

    #[serde(default = "default_audit_max_file_bytes")]
    pub max_file_bytes: u64,

    // -- database --
    #[serde(default)]
    pub datasource: Option<String>,

    #[serde(default)]
    pub table: Option<String>,

    // -- elasticsearch --
    #[serde(default)]
    pub index: Option<String>,

    #[serde(default)]
    pub shards: Option<u32>,

    // -- kafka --
    #[serde(default)]
    pub topic: Option<String>,

    #[serde(default)]
    pub partitions: Option<u32>,
}

impl Default for AuditStorageConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            path: default_audit_path(),
            max_file_bytes: default_audit_max_file_bytes(),
            datasource: None,
            table: None,
            index: None,
            shards: None,
            topic: None,
            partitions: None,
        }
    }
}

fn default_storage_type() -> String {
    "file".to_string()
}

fn default_audit_path() -> String {
    "audit.log".to_string()
}

fn default_audit_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

/// The backend call itself plus its circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Per-call deadline for the backend request.
    #[serde(default = "default_upstream_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_upstream_timeout_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_upstream_timeout_ms() -> u64 {
    6_000
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cb_open_duration")]
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_cb_failure_threshold(),
            success_threshold: default_cb_success_threshold(),
            open_duration_secs: default_cb_open_duration(),
        }
    }
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_open_duration() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_drain_timeout_secs() -> u64 {
    10
}
