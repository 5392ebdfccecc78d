mod memory;
mod postgres;

pub use memory::MemoryRelationalStore;
pub use postgres::PostgresRelationalStore;

use crate::config::StorageConfig;
use crate::span::{Log, Process, Span, SpanId, SpanRef, TraceId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A span in the relational store's serialized form: scalar columns plus
/// JSON-encoded tags, process tags, logs and references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub service_name: String,
    pub operation_name: String,
    pub kind: String,
    pub flags: u32,
    pub start_time: DateTime<Utc>,
    pub duration_ns: u64,
    pub tags: serde_json::Value,
    pub process_id: String,
    pub process_tags: serde_json::Value,
    pub warnings: Vec<String>,
    pub logs: serde_json::Value,
    pub refs: serde_json::Value,
}

impl EncodedSpan {
    pub fn encode(span: &Span) -> Result<Self> {
        Ok(Self {
            trace_id: span.trace_id,
            span_id: span.span_id,
            service_name: span.service_name().to_string(),
            operation_name: span.operation_name.clone(),
            kind: span.span_kind().to_string(),
            flags: span.flags,
            start_time: span.start_time,
            duration_ns: span.duration_ns,
            tags: serde_json::to_value(&span.tags).context("failed to encode tags")?,
            process_id: span.process_id.clone(),
            process_tags: serde_json::to_value(&span.process.tags)
                .context("failed to encode process tags")?,
            warnings: span.warnings.clone(),
            logs: serde_json::to_value(&span.logs).context("failed to encode logs")?,
            refs: serde_json::to_value(&span.references)
                .context("failed to encode references")?,
        })
    }

    pub fn decode(&self) -> Result<Span> {
        let logs: Vec<Log> =
            serde_json::from_value(self.logs.clone()).context("failed to decode logs")?;
        let references: Vec<SpanRef> =
            serde_json::from_value(self.refs.clone()).context("failed to decode references")?;
        Ok(Span {
            trace_id: self.trace_id,
            span_id: self.span_id,
            operation_name: self.operation_name.clone(),
            references,
            flags: self.flags,
            start_time: self.start_time,
            duration_ns: self.duration_ns,
            tags: serde_json::from_value(self.tags.clone()).context("failed to decode tags")?,
            logs,
            process: Process {
                service_name: self.service_name.clone(),
                tags: serde_json::from_value(self.process_tags.clone())
                    .context("failed to decode process tags")?,
            },
            process_id: self.process_id.clone(),
            warnings: self.warnings.clone(),
        })
    }
}

/// All stored spans of one trace, ordered by start time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub spans: Vec<Span>,
}

impl TraceRecord {
    fn from_encoded(trace_id: TraceId, encoded: &[EncodedSpan]) -> Result<Self> {
        let mut spans = encoded
            .iter()
            .map(EncodedSpan::decode)
            .collect::<Result<Vec<_>>>()?;
        spans.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then(a.span_id.cmp(&b.span_id))
        });
        Ok(Self { trace_id, spans })
    }
}

/// An operation recorded for a service, with the span kind it was seen under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub span_kind: String,
}

/// Durable record of every span exactly as it was received
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert the span, replacing an earlier write of the same (trace, span) pair
    async fn write_span_record(&self, record: EncodedSpan) -> Result<()>;

    /// Fetch the requested traces in the order given. Unknown ids are skipped.
    async fn fetch_traces_by_ids(&self, ids: &[TraceId]) -> Result<Vec<TraceRecord>>;

    async fn count_spans(&self) -> Result<usize>;

    /// Names of every service that has written a span, sorted
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Operations of one service, optionally restricted to a span kind.
    /// An unknown service has no operations.
    async fn list_operations(
        &self,
        service: &str,
        span_kind: Option<&str>,
    ) -> Result<Vec<Operation>>;

    /// Clear all data (useful for testing)
    async fn clear(&self) -> Result<()>;
}

/// Create a relational store based on the configuration
pub async fn create_relational_store(config: &StorageConfig) -> Result<Arc<dyn RelationalStore>> {
    match config.relational_backend.as_str() {
        "memory" => {
            tracing::info!("Relational Store: In-Memory (data will not persist across restarts)");
            Ok(Arc::new(MemoryRelationalStore::new()))
        }
        "postgres" => {
            tracing::info!("Relational Store: PostgreSQL (persistent)");
            let store = PostgresRelationalStore::new(config).await?;
            tracing::info!("Database connection established");
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("Unknown relational backend: {}", other),
    }
}
