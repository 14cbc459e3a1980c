pub mod event;
pub mod pipeline;
pub mod sink;

pub use event::AuditEvent;
pub use pipeline::{AuditPipeline, AuditStatsSnapshot};
pub use sink::{parse_batches, AuditSink, FileSink, MemorySink};
