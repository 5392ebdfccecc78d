use super::{
    cosine_similarity, CausalEdge, EdgeMerge, Enrichment, GraphStats, GraphStore, LogRecord, Path,
    Relation, ScoredSpan, SpanAttributes, SpanNode,
};
use crate::span::{SpanId, TraceId};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// BM25 parameters, Lucene defaults
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

// Service nodes are keyed by name through `GraphInner::services`
#[derive(Debug, Clone)]
enum GraphNode {
    Service,
    Trace(TraceId),
    Span(SpanNode),
    Log(LogRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraphRel {
    Contains,
    Produces,
    Causal(Relation),
}

#[derive(Default)]
struct GraphInner {
    graph: DiGraph<GraphNode, GraphRel>,
    services: HashMap<String, NodeIndex>,
    traces: HashMap<TraceId, NodeIndex>,
    spans: HashMap<SpanId, NodeIndex>,
}

impl GraphInner {
    fn service_index(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.services.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(GraphNode::Service);
        self.services.insert(name.to_string(), idx);
        idx
    }

    fn trace_index(&mut self, trace_id: TraceId) -> NodeIndex {
        if let Some(idx) = self.traces.get(&trace_id) {
            return *idx;
        }
        let idx = self.graph.add_node(GraphNode::Trace(trace_id));
        self.traces.insert(trace_id, idx);
        idx
    }

    fn ensure_edge(&mut self, from: NodeIndex, to: NodeIndex, rel: GraphRel) -> bool {
        let exists = self
            .graph
            .edges_connecting(from, to)
            .any(|edge| *edge.weight() == rel);
        if !exists {
            self.graph.add_edge(from, to, rel);
        }
        !exists
    }

    fn span_node(&self, idx: NodeIndex) -> Option<&SpanNode> {
        match self.graph.node_weight(idx) {
            Some(GraphNode::Span(node)) => Some(node),
            _ => None,
        }
    }

    fn span_id_of(&self, idx: NodeIndex) -> Result<SpanId> {
        self.span_node(idx)
            .map(|node| node.span_id)
            .ok_or_else(|| anyhow!("causal edge endpoint {:?} is not a span", idx))
    }

    fn causal_edge(&self, edge: EdgeIndex) -> Result<CausalEdge> {
        let (source, target) = self
            .graph
            .edge_endpoints(edge)
            .ok_or_else(|| anyhow!("edge {:?} vanished during traversal", edge))?;
        let relation = match self.graph.edge_weight(edge) {
            Some(GraphRel::Causal(relation)) => *relation,
            _ => anyhow::bail!("edge {:?} is not causal", edge),
        };
        Ok(CausalEdge {
            parent: self.span_id_of(source)?,
            relation,
            child: self.span_id_of(target)?,
        })
    }

    /// Extend `nodes`/`used` by every unused causal edge incident to the
    /// current end of the walk until `remaining` reaches zero.
    fn walk(
        &self,
        relations: &[Relation],
        remaining: usize,
        nodes: &mut Vec<NodeIndex>,
        used: &mut Vec<EdgeIndex>,
        out: &mut Vec<Path>,
    ) -> Result<()> {
        if remaining == 0 {
            out.push(Path {
                nodes: nodes
                    .iter()
                    .map(|idx| self.span_id_of(*idx))
                    .collect::<Result<_>>()?,
                edges: used
                    .iter()
                    .map(|edge| self.causal_edge(*edge))
                    .collect::<Result<_>>()?,
            });
            return Ok(());
        }

        let Some(&at) = nodes.last() else {
            return Ok(());
        };

        let mut steps = Vec::new();
        for edge in self.graph.edges_directed(at, Direction::Outgoing) {
            steps.push((edge.id(), edge.target(), *edge.weight()));
        }
        for edge in self.graph.edges_directed(at, Direction::Incoming) {
            // self loops were already seen as outgoing
            if edge.source() != edge.target() {
                steps.push((edge.id(), edge.source(), *edge.weight()));
            }
        }
        steps.sort_by_key(|(id, _, _)| *id);

        for (edge, next, rel) in steps {
            let GraphRel::Causal(relation) = rel else {
                continue;
            };
            if !relations.contains(&relation) || used.contains(&edge) {
                continue;
            }
            nodes.push(next);
            used.push(edge);
            self.walk(relations, remaining - 1, nodes, used, out)?;
            used.pop();
            nodes.pop();
        }
        Ok(())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

fn rank(mut hits: Vec<ScoredSpan>, limit: usize) -> Vec<ScoredSpan> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.span_id.cmp(&b.span_id))
    });
    hits.truncate(limit);
    hits
}

/// In-memory causal graph backed by a petgraph `DiGraph`
pub struct MemoryGraphStore {
    inner: RwLock<GraphInner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GraphInner>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("graph store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GraphInner>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("graph store lock poisoned"))
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn merge_service(&self, name: &str) -> Result<()> {
        self.write()?.service_index(name);
        Ok(())
    }

    async fn merge_trace(&self, trace_id: TraceId) -> Result<()> {
        self.write()?.trace_index(trace_id);
        Ok(())
    }

    async fn merge_span(&self, span_id: SpanId, attributes: SpanAttributes) -> Result<()> {
        let mut inner = self.write()?;
        let service = inner.service_index(&attributes.service_name);
        let trace = inner.trace_index(attributes.trace_id);

        let span = match inner.spans.get(&span_id).copied() {
            Some(idx) => {
                if let Some(GraphNode::Span(node)) = inner.graph.node_weight_mut(idx) {
                    node.attributes = attributes;
                }
                idx
            }
            None => {
                let idx = inner.graph.add_node(GraphNode::Span(SpanNode {
                    span_id,
                    attributes,
                    enrichment: None,
                }));
                inner.spans.insert(span_id, idx);
                idx
            }
        };

        inner.ensure_edge(service, span, GraphRel::Contains);
        inner.ensure_edge(trace, span, GraphRel::Contains);
        Ok(())
    }

    async fn append_log(&self, span_id: SpanId, log: LogRecord) -> Result<()> {
        let mut inner = self.write()?;
        let span = *inner
            .spans
            .get(&span_id)
            .ok_or_else(|| anyhow!("cannot attach log: span {} not found", span_id))?;
        let log = inner.graph.add_node(GraphNode::Log(log));
        inner.graph.add_edge(span, log, GraphRel::Produces);
        Ok(())
    }

    async fn merge_causal_edge(&self, edge: CausalEdge) -> Result<EdgeMerge> {
        let mut inner = self.write()?;
        let Some(parent) = inner.spans.get(&edge.parent).copied() else {
            return Ok(EdgeMerge::MissingParent);
        };
        let Some(child) = inner.spans.get(&edge.child).copied() else {
            return Ok(EdgeMerge::MissingChild);
        };
        if inner.ensure_edge(parent, child, GraphRel::Causal(edge.relation)) {
            Ok(EdgeMerge::Created)
        } else {
            Ok(EdgeMerge::Existing)
        }
    }

    async fn set_enrichment(&self, span_id: SpanId, enrichment: Enrichment) -> Result<()> {
        let mut inner = self.write()?;
        let idx = *inner
            .spans
            .get(&span_id)
            .ok_or_else(|| anyhow!("cannot enrich: span {} not found", span_id))?;
        match inner.graph.node_weight_mut(idx) {
            Some(GraphNode::Span(node)) => {
                node.enrichment = Some(enrichment);
                Ok(())
            }
            _ => anyhow::bail!("node for span {} is not a span", span_id),
        }
    }

    async fn full_text_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredSpan>> {
        let inner = self.read()?;
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let docs: Vec<(SpanId, Vec<String>)> = inner
            .spans
            .values()
            .filter_map(|idx| inner.span_node(*idx))
            .map(|node| (node.span_id, tokenize(node.summary())))
            .filter(|(_, tokens)| !tokens.is_empty())
            .collect();
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let total = docs.len() as f64;
        let avg_len = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / total;
        let idf: HashMap<&str, f64> = terms
            .iter()
            .map(|term| {
                let df = docs
                    .iter()
                    .filter(|(_, tokens)| tokens.iter().any(|t| t == term))
                    .count() as f64;
                let idf = (1.0 + (total - df + 0.5) / (df + 0.5)).ln();
                (term.as_str(), idf)
            })
            .collect();

        let hits = docs
            .iter()
            .filter_map(|(span_id, tokens)| {
                let len = tokens.len() as f64;
                let score: f64 = terms
                    .iter()
                    .map(|term| {
                        let tf = tokens.iter().filter(|t| *t == term).count() as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len);
                        idf[term.as_str()] * tf * (BM25_K1 + 1.0) / (tf + norm)
                    })
                    .sum();
                (score > 0.0).then_some(ScoredSpan {
                    span_id: *span_id,
                    score,
                })
            })
            .collect();

        Ok(rank(hits, limit))
    }

    async fn vector_search(&self, embedding: &[f32], limit: usize) -> Result<Vec<ScoredSpan>> {
        let inner = self.read()?;
        let hits = inner
            .spans
            .values()
            .filter_map(|idx| inner.span_node(*idx))
            .filter_map(|node| {
                let cosine = cosine_similarity(embedding, node.embedding()?)?;
                Some(ScoredSpan {
                    span_id: node.span_id,
                    score: (1.0 + cosine) / 2.0,
                })
            })
            .collect();
        Ok(rank(hits, limit))
    }

    async fn owning_trace(&self, span_id: SpanId) -> Result<Option<TraceId>> {
        let inner = self.read()?;
        let Some(idx) = inner.spans.get(&span_id) else {
            return Ok(None);
        };
        let trace = inner
            .graph
            .edges_directed(*idx, Direction::Incoming)
            .filter(|edge| *edge.weight() == GraphRel::Contains)
            .find_map(|edge| match inner.graph.node_weight(edge.source()) {
                Some(GraphNode::Trace(trace_id)) => Some(*trace_id),
                _ => None,
            });
        Ok(trace)
    }

    async fn trace_spans(&self, trace_id: TraceId) -> Result<Vec<SpanNode>> {
        let inner = self.read()?;
        let Some(trace) = inner.traces.get(&trace_id) else {
            return Ok(Vec::new());
        };
        let mut spans: Vec<SpanNode> = inner
            .graph
            .edges_directed(*trace, Direction::Outgoing)
            .filter(|edge| *edge.weight() == GraphRel::Contains)
            .filter_map(|edge| inner.span_node(edge.target()).cloned())
            .collect();
        spans.sort_by(|a, b| {
            a.attributes
                .start_time
                .cmp(&b.attributes.start_time)
                .then(a.span_id.cmp(&b.span_id))
        });
        Ok(spans)
    }

    async fn paths_of_length(
        &self,
        anchor: SpanId,
        relations: &[Relation],
        hops: usize,
    ) -> Result<Vec<Path>> {
        let inner = self.read()?;
        let start = *inner
            .spans
            .get(&anchor)
            .ok_or_else(|| anyhow!("anchor span {} not found", anchor))?;

        let mut out = Vec::new();
        let mut nodes = vec![start];
        let mut used = Vec::with_capacity(hops);
        inner.walk(relations, hops, &mut nodes, &mut used, &mut out)?;
        Ok(out)
    }

    async fn get_span(&self, span_id: SpanId) -> Result<Option<SpanNode>> {
        let inner = self.read()?;
        Ok(inner
            .spans
            .get(&span_id)
            .and_then(|idx| inner.span_node(*idx))
            .cloned())
    }

    async fn causal_edges(&self) -> Result<Vec<CausalEdge>> {
        let inner = self.read()?;
        let mut edges = inner
            .graph
            .edge_indices()
            .filter(|edge| matches!(inner.graph.edge_weight(*edge), Some(GraphRel::Causal(_))))
            .map(|edge| inner.causal_edge(edge))
            .collect::<Result<Vec<_>>>()?;
        edges.sort();
        Ok(edges)
    }

    async fn span_logs(&self, span_id: SpanId) -> Result<Vec<LogRecord>> {
        let inner = self.read()?;
        let Some(idx) = inner.spans.get(&span_id) else {
            return Ok(Vec::new());
        };
        let mut produced: Vec<(EdgeIndex, LogRecord)> = inner
            .graph
            .edges_directed(*idx, Direction::Outgoing)
            .filter(|edge| *edge.weight() == GraphRel::Produces)
            .filter_map(|edge| match inner.graph.node_weight(edge.target()) {
                Some(GraphNode::Log(log)) => Some((edge.id(), log.clone())),
                _ => None,
            })
            .collect();
        produced.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then(a.0.cmp(&b.0)));
        Ok(produced.into_iter().map(|(_, log)| log).collect())
    }

    async fn stats(&self) -> Result<GraphStats> {
        let inner = self.read()?;
        let logs = inner
            .graph
            .raw_nodes()
            .iter()
            .filter(|node| matches!(node.weight, GraphNode::Log(_)))
            .count();
        let causal_edges = inner
            .graph
            .raw_edges()
            .iter()
            .filter(|edge| matches!(edge.weight, GraphRel::Causal(_)))
            .count();
        Ok(GraphStats {
            services: inner.services.len(),
            traces: inner.traces.len(),
            spans: inner.spans.len(),
            logs,
            causal_edges,
        })
    }

    async fn clear(&self) -> Result<()> {
        *self.write()? = GraphInner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{ActionKind, SpanKind};
    use chrono::{Duration, TimeZone, Utc};

    fn attrs(trace: u64, service: &str, operation: &str, offset_ms: i64) -> SpanAttributes {
        SpanAttributes {
            trace_id: TraceId::new(0, trace),
            service_name: service.to_string(),
            operation_name: operation.to_string(),
            duration_ns: 1_000,
            start_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
                + Duration::milliseconds(offset_ms),
            span_kind: SpanKind::Server,
            action_kind: ActionKind::Http,
            action_status: "200".to_string(),
        }
    }

    fn enrichment(summary: &str, embedding: Vec<f32>) -> Enrichment {
        Enrichment {
            span_summary: summary.to_string(),
            log_summary: String::new(),
            tag_summary: String::new(),
            summary: summary.to_string(),
            embedding,
        }
    }

    fn edge(parent: u64, relation: Relation, child: u64) -> CausalEdge {
        CausalEdge {
            parent: SpanId(parent),
            relation,
            child: SpanId(child),
        }
    }

    async fn chain(store: &MemoryGraphStore) -> Result<()> {
        // 1 -> 2 -> 3, plus 1 ~> 4 (follows)
        for (id, op) in [(1, "root"), (2, "mid"), (3, "leaf"), (4, "async")] {
            store
                .merge_span(SpanId(id), attrs(7, "svc", op, id as i64))
                .await?;
        }
        store.merge_causal_edge(edge(1, Relation::InvokesChild, 2)).await?;
        store.merge_causal_edge(edge(2, Relation::InvokesChild, 3)).await?;
        store.merge_causal_edge(edge(1, Relation::InvokesFollows, 4)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn merge_span_is_idempotent_and_latest_attributes_win() -> Result<()> {
        let store = MemoryGraphStore::new();
        store.merge_span(SpanId(1), attrs(9, "frontend", "GET /", 0)).await?;
        store
            .set_enrichment(SpanId(1), enrichment("first", vec![1.0, 0.0]))
            .await?;
        store.merge_span(SpanId(1), attrs(9, "frontend", "POST /", 0)).await?;

        let stats = store.stats().await?;
        assert_eq!(stats.spans, 1);
        assert_eq!(stats.services, 1);
        assert_eq!(stats.traces, 1);

        let node = store.get_span(SpanId(1)).await?.unwrap();
        assert_eq!(node.attributes.operation_name, "POST /");
        assert_eq!(node.summary(), "first");
        assert_eq!(
            store.owning_trace(SpanId(1)).await?,
            Some(TraceId::new(0, 9))
        );
        Ok(())
    }

    #[tokio::test]
    async fn services_and_traces_are_merged_once() -> Result<()> {
        let store = MemoryGraphStore::new();
        for name in ["payment", "ledger", "payment"] {
            store.merge_service(name).await?;
        }
        store.merge_trace(TraceId::new(0, 1)).await?;
        store.merge_trace(TraceId::new(0, 1)).await?;

        let stats = store.stats().await?;
        assert_eq!(stats.services, 2);
        assert_eq!(stats.traces, 1);
        let inner = store.read()?;
        let service_nodes = inner
            .graph
            .raw_nodes()
            .iter()
            .filter(|node| matches!(node.weight, GraphNode::Service))
            .count();
        assert_eq!(service_nodes, 2);
        assert_eq!(inner.graph.node_count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn causal_edges_are_merged_once() -> Result<()> {
        let store = MemoryGraphStore::new();
        store.merge_span(SpanId(1), attrs(1, "a", "x", 0)).await?;
        store.merge_span(SpanId(2), attrs(1, "b", "y", 1)).await?;

        let e = edge(1, Relation::InvokesChild, 2);
        assert_eq!(store.merge_causal_edge(e).await?, EdgeMerge::Created);
        assert_eq!(store.merge_causal_edge(e).await?, EdgeMerge::Existing);
        assert_eq!(
            store
                .merge_causal_edge(edge(1, Relation::InvokesFollows, 2))
                .await?,
            EdgeMerge::Created
        );
        assert_eq!(
            store
                .merge_causal_edge(edge(5, Relation::InvokesChild, 2))
                .await?,
            EdgeMerge::MissingParent
        );
        assert_eq!(
            store
                .merge_causal_edge(edge(1, Relation::InvokesChild, 6))
                .await?,
            EdgeMerge::MissingChild
        );
        assert_eq!(store.causal_edges().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn logs_append_and_require_span() -> Result<()> {
        let store = MemoryGraphStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(store
            .append_log(SpanId(3), LogRecord { timestamp: ts, text: "orphan".into() })
            .await
            .is_err());

        store.merge_span(SpanId(3), attrs(1, "a", "x", 0)).await?;
        for text in ["second", "first"] {
            let offset = if text == "first" { 0 } else { 5 };
            store
                .append_log(
                    SpanId(3),
                    LogRecord {
                        timestamp: ts + Duration::milliseconds(offset),
                        text: text.into(),
                    },
                )
                .await?;
        }
        let logs = store.span_logs(SpanId(3)).await?;
        assert_eq!(
            logs.iter().map(|l| l.text.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert_eq!(store.stats().await?.logs, 2);
        Ok(())
    }

    #[tokio::test]
    async fn full_text_ranks_matching_summaries() -> Result<()> {
        let store = MemoryGraphStore::new();
        for (id, summary) in [
            (1, "payment service failure while charging card, payment declined"),
            (2, "inventory lookup succeeded"),
            (3, "payment accepted"),
            (4, ""),
        ] {
            store.merge_span(SpanId(id), attrs(id, "svc", "op", 0)).await?;
            store
                .set_enrichment(SpanId(id), enrichment(summary, vec![1.0]))
                .await?;
        }

        let hits = store.full_text_search("Payment failure", 10).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].span_id, SpanId(1));
        assert_eq!(hits[1].span_id, SpanId(3));
        assert!(hits[0].score > hits[1].score);

        let limited = store.full_text_search("payment", 1).await?;
        assert_eq!(limited.len(), 1);
        assert!(store.full_text_search("  ", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn vector_search_uses_cosine_similarity() -> Result<()> {
        let store = MemoryGraphStore::new();
        store.merge_span(SpanId(1), attrs(1, "a", "x", 0)).await?;
        store.merge_span(SpanId(2), attrs(2, "a", "y", 0)).await?;
        store.merge_span(SpanId(3), attrs(3, "a", "z", 0)).await?;
        store
            .set_enrichment(SpanId(1), enrichment("one", vec![1.0, 0.0]))
            .await?;
        store
            .set_enrichment(SpanId(2), enrichment("two", vec![0.0, 1.0]))
            .await?;

        let hits = store.vector_search(&[1.0, 0.0], 5).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].span_id, SpanId(1));
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!((hits[1].score - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn zero_hops_yields_the_anchor_alone() -> Result<()> {
        let store = MemoryGraphStore::new();
        chain(&store).await?;
        let paths = store.paths_of_length(SpanId(2), &Relation::ALL, 0).await?;
        assert_eq!(paths, vec![Path::trivial(SpanId(2))]);
        Ok(())
    }

    #[tokio::test]
    async fn paths_follow_edges_in_both_directions() -> Result<()> {
        let store = MemoryGraphStore::new();
        chain(&store).await?;

        let one_hop = store.paths_of_length(SpanId(2), &Relation::ALL, 1).await?;
        let mut ends: Vec<SpanId> = one_hop.iter().map(|p| p.nodes[1]).collect();
        ends.sort();
        assert_eq!(ends, vec![SpanId(1), SpanId(3)]);
        let upward = one_hop.iter().find(|p| p.nodes[1] == SpanId(1)).unwrap();
        assert_eq!(upward.edges[0], edge(1, Relation::InvokesChild, 2));

        let two_hops = store.paths_of_length(SpanId(3), &Relation::ALL, 2).await?;
        let mut ends: Vec<SpanId> = two_hops.iter().map(|p| p.nodes[2]).collect();
        ends.sort();
        assert_eq!(ends, vec![SpanId(1)]);

        let from_leaf = store.paths_of_length(SpanId(4), &Relation::ALL, 2).await?;
        assert_eq!(from_leaf.len(), 1);
        assert_eq!(from_leaf[0].nodes, vec![SpanId(4), SpanId(1), SpanId(2)]);
        assert!(from_leaf.iter().all(|p| p.hops() == 2));
        Ok(())
    }

    #[tokio::test]
    async fn paths_respect_relation_filter_and_edge_reuse() -> Result<()> {
        let store = MemoryGraphStore::new();
        chain(&store).await?;

        let child_only = store
            .paths_of_length(SpanId(1), &[Relation::InvokesChild], 1)
            .await?;
        assert_eq!(child_only.len(), 1);
        assert_eq!(child_only[0].nodes[1], SpanId(2));

        // only three edges exist, so no walk of four distinct edges
        assert!(store
            .paths_of_length(SpanId(1), &Relation::ALL, 4)
            .await?
            .is_empty());
        assert!(store
            .paths_of_length(SpanId(99), &Relation::ALL, 1)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn trace_spans_are_ordered_and_clear_resets() -> Result<()> {
        let store = MemoryGraphStore::new();
        store.merge_span(SpanId(2), attrs(4, "a", "late", 10)).await?;
        store.merge_span(SpanId(1), attrs(4, "b", "early", 0)).await?;
        store.merge_span(SpanId(3), attrs(5, "b", "other", 0)).await?;

        let spans = store.trace_spans(TraceId::new(0, 4)).await?;
        assert_eq!(
            spans.iter().map(|s| s.span_id).collect::<Vec<_>>(),
            vec![SpanId(1), SpanId(2)]
        );
        assert!(store.trace_spans(TraceId::new(0, 77)).await?.is_empty());

        store.clear().await?;
        assert_eq!(store.stats().await?, GraphStats::default());
        Ok(())
    }
}
