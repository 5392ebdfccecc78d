use crate::error::{Result, SpanGraphError, StoreContext};
use crate::graph::{Enrichment, GraphStore};
use crate::llm::LanguageModel;
use crate::span::Span;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Arc;

const SUMMARY_MARKUP: [&str; 3] = ["<summary>", "</summary>", "#EMPTY#"];

/// Strip the delimiter markup and empty sentinel a summarizer may echo back
pub fn clean_summary(raw: &str) -> String {
    let mut cleaned = raw.to_string();
    for markup in SUMMARY_MARKUP {
        cleaned = cleaned.replace(markup, "");
    }
    cleaned.trim().to_string()
}

/// Produces summaries and an embedding for a span and stores them on its node
pub struct Enricher {
    store: Arc<dyn GraphStore>,
    llm: Arc<dyn LanguageModel>,
}

impl Enricher {
    pub fn new(store: Arc<dyn GraphStore>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { store, llm }
    }

    pub async fn enrich(&self, span: &Span) -> Result<Enrichment> {
        let failed = |source: anyhow::Error| SpanGraphError::Enrichment {
            span_id: span.span_id,
            source,
        };

        let span_summary = clean_summary(
            &self
                .llm
                .summarize_span(&span.render())
                .await
                .map_err(failed)?,
        );

        let log_summary = if span.logs.is_empty() {
            String::new()
        } else {
            clean_summary(
                &self
                    .llm
                    .summarize_logs(&span.render_logs())
                    .await
                    .map_err(failed)?,
            )
        };

        let summary = if log_summary.is_empty() {
            span_summary.clone()
        } else {
            format!("{} {}", span_summary, log_summary)
        };
        let embedding = self.llm.embed(&summary).await.map_err(failed)?;

        let enrichment = Enrichment {
            span_summary,
            log_summary,
            tag_summary: span.render_tags(),
            summary,
            embedding,
        };

        self.store
            .set_enrichment(span.span_id, enrichment.clone())
            .await
            .store_context(|| format!("failed to store enrichment for span {}", span.span_id))?;

        tracing::debug!(span_id = %span.span_id, "span enriched");
        Ok(enrichment)
    }
}

/// A span waiting for enrichment, with the number of failed attempts so far
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub span: Span,
    pub attempts: u32,
}

impl EnrichmentJob {
    pub fn new(span: Span) -> Self {
        Self { span, attempts: 0 }
    }
}

/// Bounded lock-free queue feeding the background enrichment worker
pub struct EnrichmentQueue {
    sender: Sender<EnrichmentJob>,
    receiver: Receiver<EnrichmentJob>,
}

impl EnrichmentQueue {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, receiver) = bounded(buffer_size);
        Self { sender, receiver }
    }

    /// Enqueue a job without blocking. A full queue is an enrichment error
    /// so that a dropped job is never silent.
    pub fn submit(&self, job: EnrichmentJob) -> Result<()> {
        let span_id = job.span.span_id;
        self.sender.try_send(job).map_err(|e| {
            let reason = match e {
                TrySendError::Full(_) => "enrichment queue is full",
                TrySendError::Disconnected(_) => "enrichment queue is closed",
            };
            SpanGraphError::Enrichment {
                span_id,
                source: anyhow::anyhow!(reason),
            }
        })
    }

    /// Take up to `max` queued jobs
    pub fn take_batch(&self, max: usize) -> Vec<EnrichmentJob> {
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
