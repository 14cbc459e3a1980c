pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl CoreConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used, so the gateway starts with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: CoreConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            CoreConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded gateway core configuration");
        Ok(config)
    }

    /// Apply environment variable overrides for deployment-level settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TOLLGATE_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("TOLLGATE_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
        if let Ok(v) = std::env::var("TOLLGATE_BACKEND_URL") {
            self.backend_url = v;
        }
        if let Ok(v) = std::env::var("TOLLGATE_SERVICE_NAME") {
            self.service_name = v;
        }
        if let Ok(v) = std::env::var("TOLLGATE_SAMPLING_RATE") {
            if let Ok(rate) = v.parse::<f64>() {
                self.tracing_pipeline.sampling.rate = rate;
            }
        }
        if let Ok(v) = std::env::var("TOLLGATE_REPORTER_ENDPOINT") {
            self.tracing_pipeline.reporter.endpoint = v;
        }
        if let Ok(v) = std::env::var("TOLLGATE_AUDIT_PATH") {
            self.audit.storage.path = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_url.is_empty() {
            anyhow::bail!("backend_url cannot be empty");
        }

        let rate = self.tracing_pipeline.sampling.rate;
        if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
            anyhow::bail!("tracing_pipeline.sampling.rate must be within [0, 1], got {rate}");
        }
        if self.tracing_pipeline.sampling.max_spans_per_trace == 0 {
            anyhow::bail!("tracing_pipeline.sampling.max_spans_per_trace must be at least 1");
        }

        if self.queued_rate_limit.enabled && self.queued_rate_limit.max_concurrency == 0 {
            anyhow::bail!("queued_rate_limit.max_concurrency must be at least 1 when enabled");
        }

        match self.audit.storage.storage_type.as_str() {
            "file" | "database" | "elasticsearch" | "kafka" => {}
            other => anyhow::bail!(
                "audit.storage.type must be one of file/database/elasticsearch/kafka, got {other}"
            ),
        }

        if self.audit.pipeline.worker_threads > 1 {
            tracing::warn!(
                "audit.pipeline.worker_threads={} ignored, batch ordering requires 1",
                self.audit.pipeline.worker_threads
            );
        }

        Ok(())
    }
}
