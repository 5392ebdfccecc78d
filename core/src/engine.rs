use crate::config::{Config, EnrichmentMode};
use crate::context::{ContextAssemblyEngine, Passage};
use crate::dual_write::{DualWriteCoordinator, WriteOutcome};
use crate::enrichment::{Enricher, EnrichmentQueue};
use crate::error::{ErrorKind, Result, SpanGraphError, StoreContext};
use crate::graph::{create_graph_store, GraphStats, GraphStore};
use crate::ingest::{EnrichmentStage, GraphIngestionEngine};
use crate::llm::{create_language_model, CachedEmbedder, LanguageModel};
use crate::pending::PendingEntry;
use crate::relational::{create_relational_store, Operation, RelationalStore, TraceRecord};
use crate::retrieval::{RetrievalFusionEngine, RetrievedTrace};
use crate::span::{Span, SpanId, TraceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task;

/// Outcome of a batch write. Every span is attempted; failures are reported
/// per span instead of aborting the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub written: usize,
    pub skipped: usize,
    pub failures: Vec<SpanFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanFailure {
    pub span_id: SpanId,
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub traces: Vec<RetrievedTrace>,
    /// Stored spans of every ranked trace, in rank order
    pub records: Vec<TraceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub trace_id: TraceId,
    pub hop: usize,
    pub passage: Passage,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub graph: GraphStats,
    pub relational_spans: usize,
    pub pending_edges: usize,
    pub enrichment_mode: EnrichmentMode,
    pub enrichment_queue: usize,
    pub running: bool,
}

/// Owns the stores and the model and wires ingestion, retrieval and question
/// answering together
pub struct SpanGraphEngine {
    config: Config,
    graph: Arc<dyn GraphStore>,
    relational: Arc<dyn RelationalStore>,
    llm: Arc<dyn LanguageModel>,
    ingestion: Arc<GraphIngestionEngine>,
    coordinator: DualWriteCoordinator,
    retrieval: RetrievalFusionEngine,
    context: ContextAssemblyEngine,
    enricher: Arc<Enricher>,
    queue: Option<Arc<EnrichmentQueue>>,
    running: Arc<RwLock<bool>>,
}

impl SpanGraphEngine {
    /// Validate the configuration and open the configured backends
    pub async fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SpanGraphError::Config(format!("{:#}", e)))?;

        let graph = create_graph_store(&config.storage)
            .map_err(|e| SpanGraphError::Config(format!("{:#}", e)))?;
        let relational = create_relational_store(&config.storage)
            .await
            .store_context(|| "failed to open relational store".to_string())?;
        let llm = create_language_model(&config.llm)
            .map_err(|e| SpanGraphError::Config(format!("{:#}", e)))?;

        Ok(Self::with_components(config, graph, relational, llm))
    }

    /// Assemble an engine around already constructed backends
    pub fn with_components(
        config: Config,
        graph: Arc<dyn GraphStore>,
        relational: Arc<dyn RelationalStore>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        let enricher = Arc::new(Enricher::new(Arc::clone(&graph), Arc::clone(&llm)));

        let (stage, queue) = match config.ingestion.enrichment {
            EnrichmentMode::Inline => (EnrichmentStage::Inline(Arc::clone(&enricher)), None),
            EnrichmentMode::Background => {
                let queue = Arc::new(EnrichmentQueue::new(config.ingestion.enrichment_buffer));
                (EnrichmentStage::Background(Arc::clone(&queue)), Some(queue))
            }
        };

        let ingestion = Arc::new(GraphIngestionEngine::new(Arc::clone(&graph), stage));
        let coordinator = DualWriteCoordinator::new(
            Arc::clone(&relational),
            Arc::clone(&ingestion),
            config.ingestion.self_service_name.clone(),
        );

        let embedder = Arc::new(CachedEmbedder::new(
            Arc::clone(&llm),
            config.retrieval.query_cache_size,
        ));
        let retrieval = RetrievalFusionEngine::new(
            Arc::clone(&graph),
            Arc::clone(&embedder),
            config.retrieval.vector_normalization,
        );
        let context = ContextAssemblyEngine::new(
            Arc::clone(&graph),
            embedder,
            config.retrieval.dedupe_edges,
        );

        Self {
            config,
            graph,
            relational,
            llm,
            ingestion,
            coordinator,
            retrieval,
            context,
            enricher,
            queue,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the background enrichment worker. A no-op in inline mode or
    /// when already running.
    pub async fn start(&self) -> Result<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };

        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        let queue = Arc::clone(queue);
        let enricher = Arc::clone(&self.enricher);
        let running = Arc::clone(&self.running);
        let batch_size = self.config.ingestion.batch_size;
        let max_attempts = self.config.ingestion.max_enrichment_attempts;
        let flush_interval =
            tokio::time::Duration::from_millis(self.config.ingestion.flush_interval_ms);

        task::spawn(async move {
            tracing::info!("Enrichment worker started");
            loop {
                {
                    let is_running = running.read().await;
                    if !*is_running {
                        break;
                    }
                }

                Self::enrich_batch(&queue, &enricher, batch_size, max_attempts).await;

                tokio::time::sleep(flush_interval).await;
            }
            tracing::info!("Enrichment worker stopped");
        });

        Ok(())
    }

    /// Stop the enrichment worker after its current batch
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Enrich every queued span now instead of waiting for the worker.
    /// Returns the number of jobs processed, retries included.
    pub async fn flush_enrichment(&self) -> usize {
        let Some(queue) = &self.queue else {
            return 0;
        };
        let batch_size = self.config.ingestion.batch_size;
        let max_attempts = self.config.ingestion.max_enrichment_attempts;

        let mut processed = 0;
        loop {
            let taken = Self::enrich_batch(queue, &self.enricher, batch_size, max_attempts).await;
            if taken == 0 {
                return processed;
            }
            processed += taken;
        }
    }

    async fn enrich_batch(
        queue: &EnrichmentQueue,
        enricher: &Enricher,
        batch_size: usize,
        max_attempts: u32,
    ) -> usize {
        let batch = queue.take_batch(batch_size);
        let taken = batch.len();

        for mut job in batch {
            let Err(e) = enricher.enrich(&job.span).await else {
                continue;
            };
            job.attempts += 1;
            if job.attempts >= max_attempts {
                tracing::error!(
                    span_id = %job.span.span_id,
                    attempts = job.attempts,
                    error = %e,
                    "dropping enrichment job"
                );
                continue;
            }
            tracing::warn!(
                span_id = %job.span.span_id,
                attempts = job.attempts,
                error = %e,
                "enrichment failed, requeueing"
            );
            if let Err(e) = queue.submit(job) {
                tracing::error!(error = %e, "failed to requeue enrichment job");
            }
        }

        taken
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    pub async fn write_span(&self, span: Span) -> Result<WriteOutcome> {
        self.coordinator.write_span(span).await
    }

    /// Write a batch of spans concurrently
    pub async fn write_spans(&self, spans: Vec<Span>) -> BatchReport {
        let writes = spans.into_iter().map(|span| async move {
            let span_id = span.span_id;
            (span_id, self.coordinator.write_span(span).await)
        });

        let mut report = BatchReport::default();
        for (span_id, result) in futures::future::join_all(writes).await {
            match result {
                Ok(WriteOutcome::Written) => report.written += 1,
                Ok(WriteOutcome::Skipped) => report.skipped += 1,
                Err(e) => report.failures.push(SpanFailure {
                    span_id,
                    kind: e.kind(),
                    error: e.to_string(),
                }),
            }
        }

        tracing::info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failures.len(),
            "span batch written"
        );
        report
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    /// Hybrid search. A missing limit falls back to the configured default.
    pub async fn search(&self, query: &str, limit: Option<i64>) -> Result<SearchResults> {
        let limit = match limit {
            None => self.config.retrieval.default_limit,
            Some(limit) if limit <= 0 => {
                return Err(SpanGraphError::validation("limit must be greater than 0"))
            }
            Some(limit) => limit as usize,
        };

        let traces = self.retrieval.search(query, limit).await?;
        let ids: Vec<TraceId> = traces.iter().map(|t| t.trace_id).collect();
        let records = self
            .relational
            .fetch_traces_by_ids(&ids)
            .await
            .store_context(|| "failed to fetch ranked traces".to_string())?;

        Ok(SearchResults { traces, records })
    }

    /// Answer a question about one trace from the causal neighbourhood of its
    /// best matching span
    pub async fn ask(&self, trace_id: TraceId, question: &str, hop: Option<i64>) -> Result<Answer> {
        if question.trim().is_empty() {
            return Err(SpanGraphError::validation("question must not be empty"));
        }
        let hop = match hop {
            None => self.config.retrieval.default_hops,
            Some(hop) if hop < 0 => {
                return Err(SpanGraphError::validation("hop must not be negative"))
            }
            Some(hop) => hop as usize,
        };
        if hop > self.config.retrieval.max_hops {
            return Err(SpanGraphError::validation(format!(
                "hop {} exceeds the maximum of {}",
                hop, self.config.retrieval.max_hops
            )));
        }

        let passage = self.context.build_passage(trace_id, question, hop).await?;
        let answer = self
            .llm
            .generate_answer(question, &passage.text())
            .await
            .map_err(SpanGraphError::Generation)?;

        Ok(Answer {
            trace_id,
            hop,
            passage,
            answer,
        })
    }

    pub async fn get_trace(&self, trace_id: TraceId) -> Result<TraceRecord> {
        self.relational
            .fetch_traces_by_ids(&[trace_id])
            .await
            .store_context(|| format!("failed to fetch trace {}", trace_id))?
            .into_iter()
            .next()
            .ok_or_else(|| SpanGraphError::NotFound(format!("trace {}", trace_id)))
    }

    pub async fn services(&self) -> Result<Vec<String>> {
        self.relational
            .list_services()
            .await
            .store_context(|| "failed to list services".to_string())
    }

    /// Operations recorded for a service. An empty kind filter means any kind.
    pub async fn operations(
        &self,
        service: &str,
        span_kind: Option<&str>,
    ) -> Result<Vec<Operation>> {
        if service.trim().is_empty() {
            return Err(SpanGraphError::validation("service name must not be empty"));
        }
        let span_kind = span_kind.filter(|kind| !kind.is_empty());
        self.relational
            .list_operations(service, span_kind)
            .await
            .store_context(|| format!("failed to list operations of {}", service))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub async fn pending_edges(&self) -> Vec<PendingEntry> {
        self.ingestion.pending_edges().await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let graph = self
            .graph
            .stats()
            .await
            .store_context(|| "failed to read graph stats".to_string())?;
        let relational_spans = self
            .relational
            .count_spans()
            .await
            .store_context(|| "failed to count stored spans".to_string())?;

        Ok(EngineStats {
            graph,
            relational_spans,
            pending_edges: self.ingestion.pending_count().await,
            enrichment_mode: self.config.ingestion.enrichment,
            enrichment_queue: self.queue.as_ref().map_or(0, |q| q.len()),
            running: *self.running.read().await,
        })
    }

    pub fn graph(&self) -> Arc<dyn GraphStore> {
        Arc::clone(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CausalEdge, MemoryGraphStore, Relation};
    use crate::llm::OfflineModel;
    use crate::relational::MemoryRelationalStore;
    use crate::test_support::{log, span, FailingModel, FailingRelationalStore};

    fn config(mode: EnrichmentMode) -> Config {
        let mut config = Config::default();
        config.ingestion.enrichment = mode;
        config.llm.embedding_dimensions = 64;
        config
    }

    fn engine(mode: EnrichmentMode) -> SpanGraphEngine {
        SpanGraphEngine::with_components(
            config(mode),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryRelationalStore::new()),
            Arc::new(OfflineModel::new(64)),
        )
    }

    fn checkout_trace() -> Vec<Span> {
        let mut charge = span(7, 2, "payment", "charge card", &[1]);
        charge
            .logs
            .push(log(&[("error", "payment failure: card declined")]));
        vec![
            span(7, 3, "ledger", "write entry", &[2]),
            charge,
            span(7, 1, "frontend", "checkout", &[]),
        ]
    }

    #[tokio::test]
    async fn test_engine_start_stop() -> anyhow::Result<()> {
        let engine = engine(EnrichmentMode::Background);
        engine.start().await?;
        assert!(engine.stats().await?.running);
        engine.start().await?;
        engine.stop().await;
        assert!(!engine.stats().await?.running);
        Ok(())
    }

    #[tokio::test]
    async fn batch_out_of_order_links_every_edge() -> anyhow::Result<()> {
        let engine = engine(EnrichmentMode::Inline);
        let report = engine.write_spans(checkout_trace()).await;
        assert_eq!(report.written, 3);
        assert!(report.failures.is_empty());

        assert!(engine.pending_edges().await.is_empty());
        let edges = engine.graph().causal_edges().await?;
        assert_eq!(
            edges,
            vec![
                CausalEdge {
                    parent: SpanId(1),
                    relation: Relation::InvokesChild,
                    child: SpanId(2),
                },
                CausalEdge {
                    parent: SpanId(2),
                    relation: Relation::InvokesChild,
                    child: SpanId(3),
                },
            ]
        );

        let stats = engine.stats().await?;
        assert_eq!(stats.relational_spans, 3);
        assert_eq!(stats.graph.spans, 3);
        Ok(())
    }

    #[tokio::test]
    async fn background_enrichment_feeds_search_and_ask() -> anyhow::Result<()> {
        let engine = engine(EnrichmentMode::Background);
        engine.write_spans(checkout_trace()).await;
        assert_eq!(engine.stats().await?.enrichment_queue, 3);

        assert_eq!(engine.flush_enrichment().await, 3);
        assert_eq!(engine.stats().await?.enrichment_queue, 0);

        let results = engine.search("payment failure", Some(5)).await?;
        assert_eq!(results.traces[0].trace_id, TraceId::new(0, 7));
        assert_eq!(results.records[0].spans.len(), 3);

        let answer = engine
            .ask(TraceId::new(0, 7), "why did the payment fail with a card declined", Some(1))
            .await?;
        assert_eq!(answer.passage.anchor, SpanId(2));
        assert_eq!(answer.hop, 1);
        assert!(answer.answer.contains("Span 0000000000000002"));
        Ok(())
    }

    #[tokio::test]
    async fn failing_jobs_are_dropped_after_max_attempts() -> anyhow::Result<()> {
        let engine = SpanGraphEngine::with_components(
            config(EnrichmentMode::Background),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryRelationalStore::new()),
            Arc::new(FailingModel),
        );
        engine.write_span(span(1, 1, "api", "GET /", &[])).await?;

        let attempts = engine.config().ingestion.max_enrichment_attempts as usize;
        assert_eq!(engine.flush_enrichment().await, attempts);
        assert_eq!(engine.stats().await?.enrichment_queue, 0);
        let node = engine.graph().get_span(SpanId(1)).await?;
        assert!(node.is_some_and(|n| n.enrichment.is_none()));
        Ok(())
    }

    #[tokio::test]
    async fn batch_reports_dual_write_failures() -> anyhow::Result<()> {
        let engine = SpanGraphEngine::with_components(
            config(EnrichmentMode::Inline),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(FailingRelationalStore),
            Arc::new(OfflineModel::new(64)),
        );
        let report = engine
            .write_spans(vec![
                span(1, 1, "api", "GET /", &[]),
                span(1, 2, "jaeger-all-in-one", "/api/traces", &[]),
            ])
            .await;
        assert_eq!(report.written, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::DualWrite);
        assert_eq!(engine.graph().stats().await?.spans, 1);
        Ok(())
    }

    #[tokio::test]
    async fn requests_are_validated_before_any_work() -> anyhow::Result<()> {
        let engine = engine(EnrichmentMode::Inline);
        let trace = TraceId::new(0, 7);

        for limit in [0, -3] {
            let err = engine.search("payment", Some(limit)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        let err = engine.ask(trace, "why?", Some(-1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = engine.ask(trace, "why?", Some(99)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = engine.ask(trace, "  ", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    #[tokio::test]
    async fn missing_traces_are_not_found() -> anyhow::Result<()> {
        let engine = engine(EnrichmentMode::Inline);
        let trace = TraceId::new(0, 404);
        assert_eq!(
            engine.get_trace(trace).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            engine.ask(trace, "what happened?", Some(0)).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        Ok(())
    }

    #[tokio::test]
    async fn services_and_operations_come_from_written_spans() -> anyhow::Result<()> {
        let engine = engine(EnrichmentMode::Inline);
        engine.write_spans(checkout_trace()).await;

        assert_eq!(engine.services().await?, vec!["frontend", "ledger", "payment"]);
        let operations = engine.operations("payment", None).await?;
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].name, "charge card");
        // an empty kind filter is no filter
        assert_eq!(engine.operations("payment", Some("")).await?, operations);
        assert!(engine.operations("payment", Some("server")).await?.is_empty());
        assert!(engine.operations("unknown", None).await?.is_empty());

        let err = engine.operations(" ", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let mut config = Config::default();
        config.storage.relational_backend = "cassandra".into();
        let err = SpanGraphEngine::new(config).await.err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::Config));
    }
}
