use crate::llm::LanguageModel;
use crate::span::{KeyValue, Log, Process, RefType, Span, SpanId, SpanRef, TraceId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

pub fn span(trace: u64, id: u64, service: &str, operation: &str, parents: &[u64]) -> Span {
    let start = Utc.with_ymd_and_hms(2024, 11, 18, 9, 0, 0).unwrap();
    Span {
        trace_id: TraceId::new(0, trace),
        span_id: SpanId(id),
        operation_name: operation.to_string(),
        references: parents
            .iter()
            .map(|parent| SpanRef {
                trace_id: TraceId::new(0, trace),
                span_id: SpanId(*parent),
                ref_type: RefType::ChildOf,
            })
            .collect(),
        flags: 1,
        start_time: start + Duration::milliseconds(id as i64),
        duration_ns: 1_000 * id,
        tags: Vec::new(),
        logs: Vec::new(),
        process: Process {
            service_name: service.to_string(),
            tags: Vec::new(),
        },
        process_id: "p1".to_string(),
        warnings: Vec::new(),
    }
}

pub fn follows_from(mut span: Span, parent: u64) -> Span {
    span.references.push(SpanRef {
        trace_id: span.trace_id,
        span_id: SpanId(parent),
        ref_type: RefType::FollowsFrom,
    });
    span
}

pub fn log(fields: &[(&str, &str)]) -> Log {
    Log {
        timestamp: Utc.with_ymd_and_hms(2024, 11, 18, 9, 0, 1).unwrap(),
        fields: fields
            .iter()
            .map(|(key, value)| KeyValue::new(*key, *value))
            .collect(),
    }
}

/// Model whose every call fails
pub struct FailingModel;

#[async_trait]
impl LanguageModel for FailingModel {
    async fn summarize_span(&self, _rendered: &str) -> Result<String> {
        anyhow::bail!("summarizer unavailable")
    }

    async fn summarize_logs(&self, _rendered: &str) -> Result<String> {
        anyhow::bail!("summarizer unavailable")
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedder unavailable")
    }

    async fn generate_answer(&self, _question: &str, _passage: &str) -> Result<String> {
        anyhow::bail!("generator unavailable")
    }
}

/// Relational store whose writes always fail
pub struct FailingRelationalStore;

#[async_trait]
impl crate::relational::RelationalStore for FailingRelationalStore {
    async fn write_span_record(&self, _record: crate::relational::EncodedSpan) -> Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn fetch_traces_by_ids(
        &self,
        _ids: &[TraceId],
    ) -> Result<Vec<crate::relational::TraceRecord>> {
        anyhow::bail!("connection refused")
    }

    async fn count_spans(&self) -> Result<usize> {
        Ok(0)
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        anyhow::bail!("connection refused")
    }

    async fn list_operations(
        &self,
        _service: &str,
        _span_kind: Option<&str>,
    ) -> Result<Vec<crate::relational::Operation>> {
        anyhow::bail!("connection refused")
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}
