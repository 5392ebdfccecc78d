use crate::config::VectorNormalization;
use crate::error::{Result, SpanGraphError, StoreContext};
use crate::graph::{GraphStore, ScoredSpan};
use crate::llm::CachedEmbedder;
use crate::span::TraceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievedTrace {
    pub trace_id: TraceId,
    pub score: f64,
}

/// Rescale scores into [0, 1]. When every score is equal the result is 0.5
/// for all of them.
pub fn normalize_min_max(scores: &[f64]) -> Vec<f64> {
    let Some(min) = scores.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = scores.iter().copied().fold(min, f64::max);
    if max == min {
        return vec![0.5; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

fn normalized(hits: Vec<RetrievedTrace>) -> Vec<RetrievedTrace> {
    let scores: Vec<f64> = hits.iter().map(|h| h.score).collect();
    hits.into_iter()
        .zip(normalize_min_max(&scores))
        .map(|(hit, score)| RetrievedTrace { score, ..hit })
        .collect()
}

/// Merge both channels into one list: one entry per trace holding its best
/// score, sorted by score descending, at most `limit` long
pub fn fuse(
    full_text: Vec<RetrievedTrace>,
    vector: Vec<RetrievedTrace>,
    normalization: VectorNormalization,
    limit: usize,
) -> Vec<RetrievedTrace> {
    let vector = match normalization {
        VectorNormalization::MinMax => normalized(vector),
        VectorNormalization::None => vector,
    };

    let mut best: HashMap<TraceId, f64> = HashMap::new();
    for hit in normalized(full_text).into_iter().chain(vector) {
        best.entry(hit.trace_id)
            .and_modify(|score| *score = score.max(hit.score))
            .or_insert(hit.score);
    }

    let mut fused: Vec<RetrievedTrace> = best
        .into_iter()
        .map(|(trace_id, score)| RetrievedTrace { trace_id, score })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    });
    fused.truncate(limit);
    fused
}

/// Hybrid full-text and vector search returning ranked traces
pub struct RetrievalFusionEngine {
    store: Arc<dyn GraphStore>,
    embedder: Arc<CachedEmbedder>,
    normalization: VectorNormalization,
}

impl RetrievalFusionEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<CachedEmbedder>,
        normalization: VectorNormalization,
    ) -> Self {
        Self {
            store,
            embedder,
            normalization,
        }
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<RetrievedTrace>> {
        if query.trim().is_empty() {
            return Err(SpanGraphError::validation("query must not be empty"));
        }
        if limit == 0 {
            return Err(SpanGraphError::validation("limit must be greater than 0"));
        }

        let full_text_hits = self
            .store
            .full_text_search(query, limit)
            .await
            .store_context(|| "full-text search failed".to_string())?;
        let full_text = self.resolve_traces(full_text_hits).await?;
        tracing::debug!(
            hits = full_text.len(),
            scores = ?full_text.iter().map(|h| h.score).collect::<Vec<_>>(),
            "full-text channel"
        );

        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(SpanGraphError::Embedding)?;
        let vector_hits = self
            .store
            .vector_search(&embedding, limit)
            .await
            .store_context(|| "vector search failed".to_string())?;
        let vector = self.resolve_traces(vector_hits).await?;
        tracing::debug!(
            hits = vector.len(),
            scores = ?vector.iter().map(|h| h.score).collect::<Vec<_>>(),
            "vector channel"
        );

        Ok(fuse(full_text, vector, self.normalization, limit))
    }

    async fn resolve_traces(&self, hits: Vec<ScoredSpan>) -> Result<Vec<RetrievedTrace>> {
        let mut traces = Vec::with_capacity(hits.len());
        for hit in hits {
            let owner = self
                .store
                .owning_trace(hit.span_id)
                .await
                .store_context(|| format!("failed to resolve trace of span {}", hit.span_id))?;
            if let Some(trace_id) = owner {
                traces.push(RetrievedTrace {
                    trace_id,
                    score: hit.score,
                });
            }
        }
        Ok(traces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::Enricher;
    use crate::graph::MemoryGraphStore;
    use crate::ingest::{EnrichmentStage, GraphIngestionEngine};
    use crate::llm::{LanguageModel, OfflineModel};
    use crate::test_support::{log, span, FailingModel};

    fn trace(n: u64) -> TraceId {
        TraceId::new(0, n)
    }

    fn hit(n: u64, score: f64) -> RetrievedTrace {
        RetrievedTrace {
            trace_id: trace(n),
            score,
        }
    }

    #[test]
    fn min_max_maps_into_unit_interval() {
        assert_eq!(normalize_min_max(&[10.0, 5.0, 0.0]), vec![1.0, 0.5, 0.0]);
        assert_eq!(normalize_min_max(&[3.0, 3.0]), vec![0.5, 0.5]);
        assert_eq!(normalize_min_max(&[7.0]), vec![0.5]);
        assert!(normalize_min_max(&[]).is_empty());
    }

    #[test]
    fn fusion_keeps_best_score_per_trace() {
        // full-text [10, 5, 0] over three traces, vector [0.9, 0.2] over two of them
        let full_text = vec![hit(1, 10.0), hit(2, 5.0), hit(3, 0.0)];
        let vector = vec![hit(1, 0.9), hit(3, 0.2)];

        let raw = fuse(full_text.clone(), vector.clone(), VectorNormalization::None, 5);
        assert_eq!(raw, vec![hit(1, 1.0), hit(2, 0.5), hit(3, 0.2)]);

        let scaled = fuse(full_text, vector, VectorNormalization::MinMax, 5);
        assert_eq!(scaled, vec![hit(1, 1.0), hit(2, 0.5), hit(3, 0.0)]);
    }

    #[test]
    fn fusion_truncates_and_orders() {
        let full_text = (1..=6).map(|n| hit(n, n as f64)).collect();
        let fused = fuse(full_text, Vec::new(), VectorNormalization::MinMax, 3);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].trace_id, trace(6));
        assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));

        assert!(fuse(Vec::new(), Vec::new(), VectorNormalization::None, 3).is_empty());
    }

    async fn seeded(llm: Arc<dyn LanguageModel>) -> anyhow::Result<RetrievalFusionEngine> {
        let store = Arc::new(MemoryGraphStore::new());
        let offline: Arc<dyn LanguageModel> = Arc::new(OfflineModel::new(64));
        let ingestion = GraphIngestionEngine::new(
            store.clone(),
            EnrichmentStage::Inline(Arc::new(Enricher::new(store.clone(), offline))),
        );

        let mut charge = span(1, 10, "payment", "charge card", &[]);
        charge
            .logs
            .push(log(&[("error", "payment failure: card declined")]));
        ingestion.ingest(&charge).await?;
        ingestion.ingest(&span(1, 11, "payment", "refund", &[10])).await?;
        ingestion.ingest(&span(2, 20, "inventory", "reserve stock", &[])).await?;
        ingestion.ingest(&span(3, 30, "frontend", "render page", &[])).await?;

        Ok(RetrievalFusionEngine::new(
            store,
            Arc::new(CachedEmbedder::new(llm, 16)),
            VectorNormalization::MinMax,
        ))
    }

    #[tokio::test]
    async fn search_ranks_matching_trace_first() -> anyhow::Result<()> {
        let engine = seeded(Arc::new(OfflineModel::new(64))).await?;
        let results = engine.search("payment failure", 5).await?;

        assert!(!results.is_empty());
        assert!(results.len() <= 5);
        assert_eq!(results[0].trace_id, trace(1));
        let mut ids: Vec<TraceId> = results.iter().map(|r| r.trace_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), results.len());
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
        Ok(())
    }

    #[tokio::test]
    async fn search_validates_input() -> anyhow::Result<()> {
        let engine = seeded(Arc::new(OfflineModel::new(64))).await?;
        assert!(matches!(
            engine.search("   ", 5).await,
            Err(SpanGraphError::Validation(_))
        ));
        assert!(matches!(
            engine.search("payment", 0).await,
            Err(SpanGraphError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn embedding_failure_is_distinct() -> anyhow::Result<()> {
        let engine = seeded(Arc::new(FailingModel)).await?;
        assert!(matches!(
            engine.search("payment", 5).await,
            Err(SpanGraphError::Embedding(_))
        ));
        Ok(())
    }
}
