use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::audit::event::AuditEvent;
use crate::error::GatewayError;

/// Storage backend for audit batches.
///
/// A batch is written as one unit. The pipeline calls this from its worker
/// (batched) and from producers (sync fallback), concurrently; sinks
/// serialize internally.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, batch: &[AuditEvent]) -> Result<(), GatewayError>;

    /// Human-readable target description for stats endpoints.
    fn describe(&self) -> String;
}

/// Render a batch in the on-disk audit format.
pub fn format_batch(batch: &[AuditEvent]) -> String {
    let mut out = String::new();
    out.push_str("=== Batch Audit Log ===\n");
    out.push_str(&format!(
        "Timestamp: {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    ));
    out.push_str(&format!("Batch Size: {}\n", batch.len()));
    out.push_str("Entries:\n");
    for event in batch {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            event.action,
            event.message
        ));
    }
    out.push_str("=== End Batch ===\n");
    out
}

/// Parse concatenated batch logs back into `(action, message)` entries.
pub fn parse_batches(content: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut in_entries = false;
    for line in content.lines() {
        match line {
            "Entries:" => in_entries = true,
            "=== End Batch ===" => in_entries = false,
            _ if in_entries && line.starts_with('[') => {
                let Some(close) = line.find("] ") else {
                    continue;
                };
                let rest = &line[close + 2..];
                let Some((action, message)) = rest.split_once(": ") else {
                    continue;
                };
                entries.push((action.to_string(), message.to_string()));
            }
            _ => {}
        }
    }
    entries
}

/// Appends batches to a log file, rotating by size.
pub struct FileSink {
    path: PathBuf,
    max_file_bytes: u64,
    write_mu: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_file_bytes: max_file_bytes.max(1),
            write_mu: Mutex::new(()),
        }
    }

    async fn rotate_if_needed(&self, incoming: u64) -> std::io::Result<()> {
        let current = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if current > 0 && current + incoming > self.max_file_bytes {
            let rotated = self
                .path
                .with_extension(format!("{}.log", Utc::now().format("%Y%m%dT%H%M%S%3f")));
            tokio::fs::rename(&self.path, &rotated).await?;
            info!("audit: rotated log file, to={}", rotated.display());
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileSink {
    async fn write_batch(&self, batch: &[AuditEvent]) -> Result<(), GatewayError> {
        if batch.is_empty() {
            return Ok(());
        }
        let content = format_batch(batch);

        let _guard = self.write_mu.lock().await;
        self.rotate_if_needed(content.len() as u64)
            .await
            .map_err(|e| GatewayError::AuditSink(format!("rotate failed: {e}")))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| GatewayError::AuditSink(format!("open failed: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| GatewayError::AuditSink(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| GatewayError::AuditSink(format!("flush failed: {e}")))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Collects batches in memory; the test double for every sink-facing test.
#[derive(Default)]
pub struct MemorySink {
    batches: StdMutex<Vec<Vec<AuditEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<AuditEvent>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write_batch(&self, batch: &[AuditEvent]) -> Result<(), GatewayError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(n: usize) -> Vec<AuditEvent> {
        (0..n)
            .map(|i| AuditEvent::new(format!("action.{i}"), format!("message {i}")))
            .collect()
    }

    #[test]
    fn test_format_contains_header_and_entries() {
        let batch = events(2);
        let text = format_batch(&batch);
        assert!(text.starts_with("=== Batch Audit Log ===\n"));
        assert!(text.contains("Batch Size: 2\n"));
        assert!(text.contains("] action.0: message 0\n"));
        assert!(text.contains("] action.1: message 1\n"));
        assert!(text.ends_with("=== End Batch ===\n"));
    }

    #[test]
    fn test_format_parse_roundtrip_multiset() {
        let first = events(3);
        let second = events(2);
        let concatenated = format!("{}{}", format_batch(&first), format_batch(&second));

        let parsed = parse_batches(&concatenated);
        let mut expected: Vec<(String, String)> = first
            .iter()
            .chain(second.iter())
            .map(|e| (e.action.clone(), e.message.clone()))
            .collect();
        let mut got = parsed;
        expected.sort();
        got.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_parse_handles_colons_in_message() {
        let batch = vec![AuditEvent::new("request.end", "GET /v1: status=200: ok")];
        let parsed = parse_batches(&format_batch(&batch));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "request.end");
        assert_eq!(parsed[0].1, "GET /v1: status=200: ok");
    }

    #[tokio::test]
    async fn test_file_sink_appends_batches() {
        let dir = std::env::temp_dir().join(format!("tollgate-audit-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("audit.log");

        let sink = FileSink::new(&path, u64::MAX);
        sink.write_batch(&events(2)).await.unwrap();
        sink.write_batch(&events(1)).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(parse_batches(&content).len(), 3);
        assert_eq!(content.matches("=== Batch Audit Log ===").count(), 2);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_sink_rotates_by_size() {
        let dir = std::env::temp_dir().join(format!("tollgate-audit-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("audit.log");

        let sink = FileSink::new(&path, 64);
        sink.write_batch(&events(3)).await.unwrap();
        sink.write_batch(&events(3)).await.unwrap();

        let mut names = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = reader.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert!(names.len() >= 2, "expected rotation, found {names:?}");
        assert!(names.iter().any(|n| n == "audit.log"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_batch_boundaries() {
        let sink = MemorySink::new();
        sink.write_batch(&events(2)).await.unwrap();
        sink.write_batch(&events(1)).await.unwrap();
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(sink.events().len(), 3);
    }
}
