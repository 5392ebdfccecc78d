use crate::enrichment::{Enricher, EnrichmentJob, EnrichmentQueue};
use crate::error::{Result, SpanGraphError, StoreContext};
use crate::graph::{CausalEdge, EdgeMerge, GraphStore, LogRecord, Relation, SpanAttributes};
use crate::pending::{PendingEdge, PendingEntry, PendingEdgeTable, PendingGuard};
use crate::span::Span;
use std::sync::Arc;

/// Where step five of ingestion sends a span
pub enum EnrichmentStage {
    /// Enrich before `ingest` returns; a failure fails the ingest
    Inline(Arc<Enricher>),
    /// Hand the span to the background worker
    Background(Arc<EnrichmentQueue>),
}

/// Builds the causal graph one span at a time.
///
/// Spans may arrive in any order, concurrently, and more than once. An edge
/// whose parent has not arrived yet is parked in the pending-edge table and
/// created when that parent is ingested.
pub struct GraphIngestionEngine {
    store: Arc<dyn GraphStore>,
    pending: PendingEdgeTable,
    stage: EnrichmentStage,
}

impl GraphIngestionEngine {
    pub fn new(store: Arc<dyn GraphStore>, stage: EnrichmentStage) -> Self {
        Self {
            store,
            pending: PendingEdgeTable::new(),
            stage,
        }
    }

    pub async fn ingest(&self, span: &Span) -> Result<()> {
        self.merge_nodes(span).await?;
        self.append_logs(span).await?;
        self.link_parents(span).await?;
        self.resolve_pending(span).await?;
        self.enrich(span).await
    }

    /// Edges still waiting on a parent that has not been ingested
    pub async fn pending_edges(&self) -> Vec<PendingEntry> {
        self.pending.snapshot().await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    pub async fn reset(&self) -> Result<()> {
        self.pending.clear().await;
        self.store
            .clear()
            .await
            .store_context(|| "failed to clear graph store".to_string())
    }

    async fn merge_nodes(&self, span: &Span) -> Result<()> {
        let service = span.service_name();
        self.store
            .merge_service(service)
            .await
            .store_context(|| format!("failed to merge service {}", service))?;
        self.store
            .merge_trace(span.trace_id)
            .await
            .store_context(|| format!("failed to merge trace {}", span.trace_id))?;
        self.store
            .merge_span(span.span_id, SpanAttributes::from_span(span))
            .await
            .store_context(|| format!("failed to merge span {}", span.span_id))?;

        tracing::info!(
            span_id = %span.span_id,
            trace_id = %span.trace_id,
            service = service,
            operation = %span.operation_name,
            "span merged"
        );
        Ok(())
    }

    // Logs are appended, so re-ingesting a span duplicates them.
    async fn append_logs(&self, span: &Span) -> Result<()> {
        for log in &span.logs {
            let record = LogRecord {
                timestamp: log.timestamp,
                text: log.render(),
            };
            self.store
                .append_log(span.span_id, record)
                .await
                .store_context(|| format!("failed to attach log to span {}", span.span_id))?;
        }
        Ok(())
    }

    /// Merge an edge from every referenced parent. The pending lock is held
    /// across each attempt and the append that follows a missing parent.
    async fn link_parents(&self, span: &Span) -> Result<()> {
        if span.references.is_empty() {
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        for reference in &span.references {
            let edge = CausalEdge {
                parent: reference.span_id,
                relation: Relation::from(reference.ref_type),
                child: span.span_id,
            };
            self.merge_edge(&mut pending, edge).await?;
        }
        Ok(())
    }

    async fn merge_edge(&self, pending: &mut PendingGuard<'_>, edge: CausalEdge) -> Result<()> {
        let outcome = self
            .store
            .merge_causal_edge(edge)
            .await
            .store_context(|| format!("failed to merge edge {}", edge))?;

        match outcome {
            EdgeMerge::Created => tracing::info!(edge = %edge, "causal edge created"),
            EdgeMerge::Existing => tracing::debug!(edge = %edge, "causal edge already present"),
            EdgeMerge::MissingParent => {
                tracing::warn!(
                    child = %edge.child,
                    parent = %edge.parent,
                    "parent span not ingested yet, deferring edge"
                );
                pending.append(
                    edge.parent,
                    PendingEdge {
                        relation: edge.relation,
                        child: edge.child,
                    },
                );
            }
            EdgeMerge::MissingChild => {
                return Err(SpanGraphError::store(
                    format!("failed to merge edge {}", edge),
                    anyhow::anyhow!("child span {} is not in the graph", edge.child),
                ));
            }
        }
        Ok(())
    }

    /// Create every edge that was waiting on this span. Edges that could not
    /// be created go back into the table before the lock is released.
    async fn resolve_pending(&self, span: &Span) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let waiting = pending.drain(span.span_id);

        for (i, deferred) in waiting.iter().enumerate() {
            let edge = deferred.into_edge(span.span_id);
            let outcome = self
                .store
                .merge_causal_edge(edge)
                .await
                .store_context(|| format!("failed to resolve deferred edge {}", edge));

            match outcome {
                Ok(EdgeMerge::MissingChild) => {
                    tracing::warn!(edge = %edge, "deferred edge dropped, child span is gone");
                }
                Ok(_) => {
                    tracing::info!(edge = %edge, "deferred edge resolved");
                }
                Err(e) => {
                    for remaining in &waiting[i..] {
                        pending.append(span.span_id, *remaining);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn enrich(&self, span: &Span) -> Result<()> {
        match &self.stage {
            EnrichmentStage::Inline(enricher) => enricher.enrich(span).await.map(|_| ()),
            EnrichmentStage::Background(queue) => queue.submit(EnrichmentJob::new(span.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraphStore;
    use crate::llm::OfflineModel;
    use crate::span::SpanId;
    use crate::test_support::{follows_from, log, span, FailingModel};
    use std::collections::BTreeSet;

    fn engine(store: Arc<MemoryGraphStore>) -> GraphIngestionEngine {
        let enricher = Enricher::new(store.clone(), Arc::new(OfflineModel::new(16)));
        GraphIngestionEngine::new(store, EnrichmentStage::Inline(Arc::new(enricher)))
    }

    fn edge(parent: u64, relation: Relation, child: u64) -> CausalEdge {
        CausalEdge {
            parent: SpanId(parent),
            relation,
            child: SpanId(child),
        }
    }

    /// root(1) -> 2 -> 4, root(1) -> 3 -> 4, 3 ~> 5
    fn diamond() -> Vec<Span> {
        vec![
            span(9, 1, "gateway", "GET /checkout", &[]),
            span(9, 2, "cart", "load cart", &[1]),
            span(9, 3, "payment", "charge", &[1]),
            span(9, 4, "ledger", "record", &[2, 3]),
            follows_from(span(9, 5, "mailer", "send receipt", &[]), 3),
        ]
    }

    fn permutations(items: &[Span]) -> Vec<Vec<Span>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[tokio::test]
    async fn child_before_parent_defers_then_links() -> anyhow::Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let engine = engine(store.clone());

        engine.ingest(&span(1, 0xb, "svc-b", "child", &[0xa])).await?;
        assert!(store.causal_edges().await?.is_empty());
        let waiting = engine.pending_edges().await;
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].parent, SpanId(0xa));

        engine.ingest(&span(1, 0xa, "svc-a", "parent", &[])).await?;
        assert_eq!(
            store.causal_edges().await?,
            vec![edge(0xa, Relation::InvokesChild, 0xb)]
        );
        assert_eq!(engine.pending_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn every_arrival_order_yields_the_same_edges() -> anyhow::Result<()> {
        let expected: BTreeSet<CausalEdge> = [
            edge(1, Relation::InvokesChild, 2),
            edge(1, Relation::InvokesChild, 3),
            edge(2, Relation::InvokesChild, 4),
            edge(3, Relation::InvokesChild, 4),
            edge(3, Relation::InvokesFollows, 5),
        ]
        .into_iter()
        .collect();

        for order in permutations(&diamond()) {
            let store = Arc::new(MemoryGraphStore::new());
            let engine = engine(store.clone());
            for s in &order {
                engine.ingest(s).await?;
            }
            let edges: BTreeSet<CausalEdge> = store.causal_edges().await?.into_iter().collect();
            assert_eq!(edges, expected);
            assert_eq!(engine.pending_count().await, 0);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingestion_loses_no_edges() -> anyhow::Result<()> {
        for _ in 0..20 {
            let store = Arc::new(MemoryGraphStore::new());
            let engine = Arc::new(engine(store.clone()));
            let handles: Vec<_> = diamond()
                .into_iter()
                .rev()
                .map(|s| {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move { engine.ingest(&s).await })
                })
                .collect();
            for handle in handles {
                handle.await??;
            }
            assert_eq!(store.causal_edges().await?.len(), 5);
            assert_eq!(engine.pending_count().await, 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_merges_nodes_and_edges() -> anyhow::Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let engine = engine(store.clone());
        let parent = span(2, 1, "api", "GET /", &[]);
        let mut child = span(2, 2, "db", "SELECT", &[1]);
        child.logs.push(log(&[("rows", "3")]));

        for s in [&parent, &child, &child, &parent] {
            engine.ingest(s).await?;
        }
        child.operation_name = "SELECT users".into();
        engine.ingest(&child).await?;

        let stats = store.stats().await?;
        assert_eq!(stats.spans, 2);
        assert_eq!(stats.causal_edges, 1);
        // logs are append-only
        assert_eq!(stats.logs, 3);
        let node = store.get_span(SpanId(2)).await?.unwrap();
        assert_eq!(node.attributes.operation_name, "SELECT users");
        Ok(())
    }

    #[tokio::test]
    async fn missing_parent_leaves_a_residual_entry() -> anyhow::Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let engine = engine(store.clone());
        engine.ingest(&span(3, 1, "api", "root", &[])).await?;
        engine.ingest(&span(3, 2, "api", "orphan", &[77])).await?;
        engine.ingest(&span(3, 3, "api", "sibling", &[77])).await?;

        let residual = engine.pending_edges().await;
        assert_eq!(residual.len(), 1);
        assert_eq!(residual[0].parent, SpanId(77));
        assert_eq!(residual[0].edges.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn inline_enrichment_failure_fails_ingest_after_structure() -> anyhow::Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let enricher = Enricher::new(store.clone(), Arc::new(FailingModel));
        let engine = GraphIngestionEngine::new(
            store.clone(),
            EnrichmentStage::Inline(Arc::new(enricher)),
        );

        let err = engine
            .ingest(&span(4, 1, "api", "root", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, SpanGraphError::Enrichment { .. }));
        assert!(store.get_span(SpanId(1)).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn background_stage_enqueues_jobs() -> anyhow::Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let queue = Arc::new(EnrichmentQueue::new(8));
        let engine = GraphIngestionEngine::new(
            store.clone(),
            EnrichmentStage::Background(queue.clone()),
        );

        engine.ingest(&span(5, 1, "api", "root", &[])).await?;
        assert_eq!(queue.len(), 1);
        let node = store.get_span(SpanId(1)).await?.unwrap();
        assert!(node.enrichment.is_none());
        Ok(())
    }
}
