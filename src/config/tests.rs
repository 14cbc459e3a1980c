use super::*;

#[test]
fn test_defaults() {
    let cfg = CoreConfig::default();
    assert_eq!(cfg.listen, "0.0.0.0:8080");
    assert_eq!(cfg.admin_listen, "0.0.0.0:9091");
    assert_eq!(cfg.backend_url, "http://127.0.0.1:9000");
    assert_eq!(cfg.service_name, "tollgate");

    assert!(cfg.rate_limit.global.enabled);
    assert_eq!(cfg.rate_limit.global.max_requests, 1_000);
    assert_eq!(cfg.rate_limit.global.burst_size, 100);
    assert_eq!(cfg.rate_limit.global.window_size_secs, 1);
    assert_eq!(cfg.rate_limit.per_api.max_requests, 200);
    assert_eq!(cfg.rate_limit.per_ip.max_requests, 100);
    assert_eq!(cfg.rate_limit.per_user.max_requests, 100);
    assert!(!cfg.rate_limit.distributed.enabled);
    assert_eq!(cfg.rate_limit.distributed.check_timeout_ms, 50);

    assert!(!cfg.queued_rate_limit.enabled);
    assert_eq!(cfg.queued_rate_limit.max_queue_size, 100);
    assert_eq!(cfg.queued_rate_limit.max_wait_time_ms, 5_000);
    assert_eq!(cfg.queued_rate_limit.max_concurrency, 8);
    assert!(cfg.queued_rate_limit.enable_priority);
    assert!(!cfg.queued_rate_limit.enable_fallback);
    assert_eq!(cfg.queued_rate_limit.fallback_timeout_ms, 1_000);

    assert!(cfg.tracing_pipeline.sampling.enabled);
    assert_eq!(cfg.tracing_pipeline.sampling.rate, 0.1);
    assert_eq!(cfg.tracing_pipeline.sampling.max_spans_per_trace, 100);
    assert!(!cfg.tracing_pipeline.reporter.enabled);
    assert_eq!(cfg.tracing_pipeline.reporter.batch_size, 100);
    assert_eq!(cfg.tracing_pipeline.reporter.flush_interval_ms, 1_000);
    assert_eq!(cfg.tracing_pipeline.reporter.timeout_ms, 3_000);
    assert_eq!(cfg.tracing_pipeline.reporter.queue_size, 10_000);
    assert_eq!(cfg.tracing_pipeline.cleanup.interval_ms, 60_000);
    assert_eq!(cfg.tracing_pipeline.cleanup.max_age_ms, 600_000);

    assert!(cfg.audit.pipeline.enabled);
    assert_eq!(cfg.audit.pipeline.batch_size, 100);
    assert_eq!(cfg.audit.pipeline.flush_interval_ms, 5_000);
    assert_eq!(cfg.audit.pipeline.queue_size, 1_000);
    assert_eq!(cfg.audit.pipeline.queue_timeout_ms, 100);
    assert_eq!(cfg.audit.pipeline.worker_threads, 1);
    assert_eq!(cfg.audit.storage.storage_type, "file");
    assert_eq!(cfg.audit.storage.path, "audit.log");

    assert_eq!(cfg.upstream.request_timeout_ms, 6_000);
    assert!(cfg.upstream.circuit_breaker.enabled);
    assert_eq!(cfg.upstream.circuit_breaker.failure_threshold, 5);
    assert_eq!(cfg.upstream.circuit_breaker.success_threshold, 2);
    assert_eq!(cfg.upstream.circuit_breaker.open_duration_secs, 30);

    assert_eq!(cfg.shutdown.drain_timeout_secs, 10);
}

#[test]
fn test_empty_json_uses_defaults() {
    let cfg: CoreConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(cfg.listen, "0.0.0.0:8080");
    assert_eq!(cfg.rate_limit.global.max_requests, 1_000);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_full_toml_roundtrip() {
    let toml_src = r#"
        listen = "0.0.0.0:8888"
        backend_url = "http://backend:9000"

        [rate_limit.global]
        max_requests = 500
        burst_size = 50
        window_size_secs = 2

        [rate_limit.per_ip]
        enabled = false
        max_requests = 0

        [rate_limit.distributed]
        enabled = true
        check_timeout_ms = 25

        [queued_rate_limit]
        enabled = true
        max_queue_size = 10
        max_wait_time_ms = 2000
        max_concurrency = 4
        enable_priority = false
        enable_fallback = true
        fallback_timeout_ms = 500

        [tracing_pipeline.sampling]
        rate = 0.5
        max_spans_per_trace = 20

        [tracing_pipeline.reporter]
        enabled = true
        endpoint = "http://collector:9411/spans"
        batch_size = 10

        [audit.pipeline]
        batch_size = 5
        queue_size = 50

        [audit.storage]
        type = "file"
        path = "/var/log/tollgate/audit.log"

        [upstream]
        request_timeout_ms = 3000

        [upstream.circuit_breaker]
        failure_threshold = 3

        [shutdown]
        drain_timeout_secs = 5
    "#;

    let cfg: CoreConfig = toml::from_str(toml_src).unwrap();
    assert_eq!(cfg.listen, "0.0.0.0:8888");
    assert_eq!(cfg.backend_url, "http://backend:9000");
    assert_eq!(cfg.rate_limit.global.max_requests, 500);
    assert_eq!(cfg.rate_limit.global.burst_size, 50);
    assert_eq!(cfg.rate_limit.global.window_size_secs, 2);
    assert!(!cfg.rate_limit.per_ip.enabled);
    assert!(cfg.rate_limit.distributed.enabled);
    assert_eq!(cfg.rate_limit.distributed.check_timeout_ms, 25);
    // Untouched tiers keep their defaults.
    assert_eq!(cfg.rate_limit.per_api.max_requests, 200);

    assert!(cfg.queued_rate_limit.enabled);
    assert_eq!(cfg.queued_rate_limit.max_queue_size, 10);
    assert!(!cfg.queued_rate_limit.enable_priority);
    assert!(cfg.queued_rate_limit.enable_fallback);

    assert_eq!(cfg.tracing_pipeline.sampling.rate, 0.5);
    assert_eq!(cfg.tracing_pipeline.sampling.max_spans_per_trace, 20);
    assert!(cfg.tracing_pipeline.reporter.enabled);
    assert_eq!(cfg.tracing_pipeline.reporter.endpoint, "http://collector:9411/spans");
    assert_eq!(cfg.tracing_pipeline.reporter.batch_size, 10);

    assert_eq!(cfg.audit.pipeline.batch_size, 5);
    assert_eq!(cfg.audit.storage.path, "/var/log/tollgate/audit.log");
    assert_eq!(cfg.upstream.request_timeout_ms, 3_000);
    assert_eq!(cfg.upstream.circuit_breaker.failure_threshold, 3);
    assert_eq!(cfg.shutdown.drain_timeout_secs, 5);

    assert!(cfg.validate().is_ok());

    // Serialize → deserialize lands on the same values.
    let json = serde_json::to_string(&cfg).unwrap();
    let back: CoreConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.listen, cfg.listen);
    assert_eq!(back.rate_limit.global.max_requests, 500);
    assert_eq!(back.audit.storage.storage_type, "file");
}

#[test]
fn test_storage_type_field_rename() {
    let json = r#"{"audit": {"storage": {"type": "elasticsearch", "index": "audit", "shards": 3}}}"#;
    let cfg: CoreConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.audit.storage.storage_type, "elasticsearch");
    assert_eq!(cfg.audit.storage.index.as_deref(), Some("audit"));
    assert_eq!(cfg.audit.storage.shards, Some(3));
}

#[test]
fn test_kafka_storage_keys() {
    let json = r#"{"audit": {"storage": {"type": "kafka", "topic": "audit-events", "partitions": 12}}}"#;
    let cfg: CoreConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.audit.storage.storage_type, "kafka");
    assert_eq!(cfg.audit.storage.topic.as_deref(), Some("audit-events"));
    assert_eq!(cfg.audit.storage.partitions, Some(12));
}

#[test]
fn test_validate_rejects_bad_sampling_rate() {
    let mut cfg = CoreConfig::default();
    cfg.tracing_pipeline.sampling.rate = 1.5;
    assert!(cfg.validate().is_err());
    cfg.tracing_pipeline.sampling.rate = -0.1;
    assert!(cfg.validate().is_err());
    cfg.tracing_pipeline.sampling.rate = 1.0;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_concurrency_queue() {
    let mut cfg = CoreConfig::default();
    cfg.queued_rate_limit.enabled = true;
    cfg.queued_rate_limit.max_concurrency = 0;
    assert!(cfg.validate().is_err());
    // Disabled queueing tolerates the zero.
    cfg.queued_rate_limit.enabled = false;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_rejects_unknown_storage_type() {
    let mut cfg = CoreConfig::default();
    cfg.audit.storage.storage_type = "tape".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_empty_backend() {
    let mut cfg = CoreConfig::default();
    cfg.backend_url = String::new();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_zero_max_requests_is_valid_config() {
    // max_requests = 0 is "deny all", not a config error.
    let json = r#"{"rate_limit": {"global": {"max_requests": 0}}}"#;
    let cfg: CoreConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.rate_limit.global.max_requests, 0);
    assert!(cfg.validate().is_ok());
}
