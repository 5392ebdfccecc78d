use crate::error::{Result, SpanGraphError, StoreContext};
use crate::graph::{cosine_similarity, CausalEdge, GraphStore, Path, Relation, SpanNode};
use crate::llm::CachedEmbedder;
use crate::span::{SpanId, TraceId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageNode {
    pub span_id: SpanId,
    pub summary: String,
}

/// Evidence handed to the answer generator: the causal edges walked from the
/// anchor span followed by the summaries of the spans they reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub anchor: SpanId,
    pub edges: Vec<CausalEdge>,
    pub nodes: Vec<PassageNode>,
}

impl Passage {
    /// Render the passage handed to the answer model: the edge block, a blank
    /// line, then the node block
    pub fn text(&self) -> String {
        let mut text = String::from("Edges\n");
        for edge in &self.edges {
            let _ = writeln!(text, "{}", edge);
        }
        text.push_str("\nNodes\n");
        for node in &self.nodes {
            let _ = writeln!(text, "Span ID: {}", node.span_id);
            let _ = writeln!(text, "Summary: {}", node.summary);
        }
        text
    }
}

/// Pick the span of a trace most similar to the question.
///
/// Spans without a usable embedding rank below every embedded span; among
/// equals the earliest span wins.
pub fn select_anchor<'a>(spans: &'a [SpanNode], question: &[f32]) -> Option<&'a SpanNode> {
    let similarity =
        |span: &SpanNode| span.embedding().and_then(|e| cosine_similarity(e, question));
    spans.iter().min_by(|a, b| {
        match (similarity(a), similarity(b)) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.attributes.start_time.cmp(&b.attributes.start_time))
        .then_with(|| a.span_id.cmp(&b.span_id))
    })
}

/// Builds question-specific passages by walking the causal graph around the
/// span that best matches the question
pub struct ContextAssemblyEngine {
    store: Arc<dyn GraphStore>,
    embedder: Arc<CachedEmbedder>,
    dedupe_edges: bool,
}

impl ContextAssemblyEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<CachedEmbedder>,
        dedupe_edges: bool,
    ) -> Self {
        Self {
            store,
            embedder,
            dedupe_edges,
        }
    }

    pub async fn build_passage(
        &self,
        trace_id: TraceId,
        question: &str,
        hops: usize,
    ) -> Result<Passage> {
        let embedding = self
            .embedder
            .embed(question)
            .await
            .map_err(SpanGraphError::Embedding)?;

        let spans = self
            .store
            .trace_spans(trace_id)
            .await
            .store_context(|| format!("failed to load spans of trace {}", trace_id))?;
        let anchor = select_anchor(&spans, &embedding)
            .ok_or_else(|| SpanGraphError::NotFound(format!("trace {} has no spans", trace_id)))?
            .span_id;
        tracing::debug!(trace_id = %trace_id, anchor = %anchor, hops, "selected anchor span");

        let paths = if hops == 0 {
            vec![Path::trivial(anchor)]
        } else {
            self.store
                .paths_of_length(anchor, &Relation::ALL, hops)
                .await
                .map_err(SpanGraphError::Traversal)?
        };

        self.assemble_passage(anchor, &paths).await
    }

    async fn assemble_passage(&self, anchor: SpanId, paths: &[Path]) -> Result<Passage> {
        let mut passage = Passage {
            anchor,
            edges: Vec::new(),
            nodes: Vec::new(),
        };
        let mut seen_edges = HashSet::new();
        let mut seen_nodes = HashSet::new();

        for path in paths {
            for edge in &path.edges {
                if !self.dedupe_edges || seen_edges.insert(*edge) {
                    passage.edges.push(*edge);
                }
            }
            for span_id in &path.nodes {
                if !seen_nodes.insert(*span_id) {
                    continue;
                }
                let summary = self
                    .store
                    .get_span(*span_id)
                    .await
                    .store_context(|| format!("failed to load span {}", span_id))?
                    .map(|node| node.summary().to_string())
                    .unwrap_or_default();
                passage.nodes.push(PassageNode {
                    span_id: *span_id,
                    summary,
                });
            }
        }

        if paths.is_empty() {
            tracing::debug!(anchor = %anchor, "no causal paths of the requested length");
        }
        Ok(passage)
    }
}
