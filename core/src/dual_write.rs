use crate::error::{Result, SpanGraphError};
use crate::ingest::GraphIngestionEngine;
use crate::relational::{EncodedSpan, RelationalStore};
use crate::span::Span;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Written,
    /// The span came from the collector itself and was not stored
    Skipped,
}

/// Fans each span out to the relational store and the graph, concurrently.
///
/// Both writes always run to completion. There is no compensation: when one
/// side fails the other side's write stays.
pub struct DualWriteCoordinator {
    relational: Arc<dyn RelationalStore>,
    ingestion: Arc<GraphIngestionEngine>,
    self_service_name: String,
}

fn describe_join<E: std::fmt::Display>(
    result: std::result::Result<std::result::Result<(), E>, tokio::task::JoinError>,
) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(format!("write task aborted: {}", e)),
    }
}

impl DualWriteCoordinator {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        ingestion: Arc<GraphIngestionEngine>,
        self_service_name: impl Into<String>,
    ) -> Self {
        Self {
            relational,
            ingestion,
            self_service_name: self_service_name.into(),
        }
    }

    pub async fn write_span(&self, span: Span) -> Result<WriteOutcome> {
        if span.service_name() == self.self_service_name {
            tracing::debug!(span_id = %span.span_id, "skipping collector self-report span");
            return Ok(WriteOutcome::Skipped);
        }

        let record = EncodedSpan::encode(&span).map_err(|e| {
            SpanGraphError::validation(format!("span {} cannot be encoded: {:#}", span.span_id, e))
        })?;
        let span_id = span.span_id;

        let relational = Arc::clone(&self.relational);
        let relational_write = tokio::spawn(async move {
            relational
                .write_span_record(record)
                .await
                .map_err(|e| format!("{:#}", e))
        });

        let ingestion = Arc::clone(&self.ingestion);
        let graph_write = tokio::spawn(async move { ingestion.ingest(&span).await });

        let (relational_result, graph_result) = tokio::join!(relational_write, graph_write);
        let relational = describe_join(relational_result);
        let graph = describe_join(graph_result);

        if relational.is_none() && graph.is_none() {
            return Ok(WriteOutcome::Written);
        }

        tracing::error!(
            span_id = %span_id,
            relational = relational.as_deref().unwrap_or("ok"),
            graph = graph.as_deref().unwrap_or("ok"),
            "dual write failed"
        );
        Err(SpanGraphError::DualWrite { relational, graph })
    }
}
