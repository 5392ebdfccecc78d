mod memory;

pub use memory::MemoryGraphStore;

use crate::config::StorageConfig;
use crate::span::{ActionKind, RefType, Span, SpanId, SpanKind, TraceId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Type of a causal edge between two spans.
///
/// The set is closed: store backends keep one fixed query shape per
/// variant and never splice caller text into a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relation {
    InvokesChild,
    InvokesFollows,
}

impl Relation {
    pub const ALL: [Relation; 2] = [Relation::InvokesChild, Relation::InvokesFollows];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::InvokesChild => "INVOKES_CHILD",
            Relation::InvokesFollows => "INVOKES_FOLLOWS",
        }
    }
}

impl From<RefType> for Relation {
    fn from(ref_type: RefType) -> Self {
        match ref_type {
            RefType::ChildOf => Relation::InvokesChild,
            RefType::FollowsFrom => Relation::InvokesFollows,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed causal edge parent -> child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CausalEdge {
    pub parent: SpanId,
    pub relation: Relation,
    pub child: SpanId,
}

impl fmt::Display for CausalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.parent, self.relation, self.child)
    }
}

/// Descriptive attributes of a span node; overwritten on every merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanAttributes {
    pub trace_id: TraceId,
    pub service_name: String,
    pub operation_name: String,
    pub duration_ns: u64,
    pub start_time: DateTime<Utc>,
    pub span_kind: SpanKind,
    pub action_kind: ActionKind,
    pub action_status: String,
}

impl SpanAttributes {
    pub fn from_span(span: &Span) -> Self {
        Self {
            trace_id: span.trace_id,
            service_name: span.service_name().to_string(),
            operation_name: span.operation_name.clone(),
            duration_ns: span.duration_ns,
            start_time: span.start_time,
            span_kind: span.span_kind(),
            action_kind: span.action_kind(),
            action_status: span.action_status(),
        }
    }
}

/// Summaries and embedding produced for a span after ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub span_summary: String,
    pub log_summary: String,
    pub tag_summary: String,
    pub summary: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanNode {
    pub span_id: SpanId,
    #[serde(flatten)]
    pub attributes: SpanAttributes,
    pub enrichment: Option<Enrichment>,
}

impl SpanNode {
    pub fn summary(&self) -> &str {
        self.enrichment
            .as_ref()
            .map(|e| e.summary.as_str())
            .unwrap_or("")
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.enrichment.as_ref().map(|e| e.embedding.as_slice())
    }
}

/// Log node attached to a span through PRODUCES
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Outcome of an attempt to merge a causal edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeMerge {
    Created,
    Existing,
    MissingParent,
    MissingChild,
}

/// A walk over causal edges. `edges[i]` joins `nodes[i]` and `nodes[i + 1]`
/// and keeps its stored direction, which may point either way along the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub nodes: Vec<SpanId>,
    pub edges: Vec<CausalEdge>,
}

impl Path {
    pub fn trivial(anchor: SpanId) -> Self {
        Self {
            nodes: vec![anchor],
            edges: Vec::new(),
        }
    }

    pub fn hops(&self) -> usize {
        self.edges.len()
    }
}

/// A search hit on a span node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredSpan {
    pub span_id: SpanId,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub services: usize,
    pub traces: usize,
    pub spans: usize,
    pub logs: usize,
    pub causal_edges: usize,
}

/// Cosine similarity of two equal-length vectors; `None` when either is zero
/// or the lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Property graph of services, traces, spans, logs and causal edges.
///
/// Every merge is idempotent; `append_log` is the one append-only write.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ========================================================================
    // Structural writes
    // ========================================================================

    async fn merge_service(&self, name: &str) -> Result<()>;

    async fn merge_trace(&self, trace_id: TraceId) -> Result<()>;

    /// Merge the span node, overwrite its descriptive attributes, and merge
    /// the CONTAINS relations from its service and trace
    async fn merge_span(&self, span_id: SpanId, attributes: SpanAttributes) -> Result<()>;

    async fn append_log(&self, span_id: SpanId, log: LogRecord) -> Result<()>;

    /// Merge `parent -> child`; reports a missing endpoint instead of failing
    async fn merge_causal_edge(&self, edge: CausalEdge) -> Result<EdgeMerge>;

    async fn set_enrichment(&self, span_id: SpanId, enrichment: Enrichment) -> Result<()>;

    // ========================================================================
    // Retrieval
    // ========================================================================

    /// Full-text search over span summaries, best `limit` hits first
    async fn full_text_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredSpan>>;

    /// Nearest spans by embedding similarity, best `limit` hits first
    async fn vector_search(&self, embedding: &[f32], limit: usize) -> Result<Vec<ScoredSpan>>;

    /// Trace containing the span
    async fn owning_trace(&self, span_id: SpanId) -> Result<Option<TraceId>>;

    async fn trace_spans(&self, trace_id: TraceId) -> Result<Vec<SpanNode>>;

    /// Every walk of exactly `hops` causal edges from `anchor`, traversing
    /// edges of the given relations in either direction, never reusing an edge
    async fn paths_of_length(
        &self,
        anchor: SpanId,
        relations: &[Relation],
        hops: usize,
    ) -> Result<Vec<Path>>;

    // ========================================================================
    // Inspection
    // ========================================================================

    async fn get_span(&self, span_id: SpanId) -> Result<Option<SpanNode>>;

    async fn causal_edges(&self) -> Result<Vec<CausalEdge>>;

    async fn span_logs(&self, span_id: SpanId) -> Result<Vec<LogRecord>>;

    async fn stats(&self) -> Result<GraphStats>;

    /// Clear all data (useful for testing)
    async fn clear(&self) -> Result<()>;
}

/// Create a graph store based on the configuration
pub fn create_graph_store(config: &StorageConfig) -> Result<Arc<dyn GraphStore>> {
    match config.graph_backend.as_str() {
        "memory" => {
            tracing::info!("Graph Store: In-Memory (graph will not persist across restarts)");
            Ok(Arc::new(MemoryGraphStore::new()))
        }
        other => anyhow::bail!("Unknown graph backend: {}", other),
    }
}
