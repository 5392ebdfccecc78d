mod offline;
mod openai;

pub use offline::OfflineModel;
pub use openai::OpenAiModel;

use crate::config::LlmConfig;
use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Text model used for span summaries, embeddings and answers
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Summarize the canonical rendering of one span
    async fn summarize_span(&self, rendered: &str) -> Result<String>;

    /// Summarize the rendered log records of one span
    async fn summarize_logs(&self, rendered: &str) -> Result<String>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Answer `question` using only the evidence in `passage`
    async fn generate_answer(&self, question: &str, passage: &str) -> Result<String>;
}

/// Create a language model client based on the configuration
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "offline" => {
            tracing::info!(
                "LLM: offline model ({} dimensional embeddings)",
                config.embedding_dimensions
            );
            Ok(Arc::new(OfflineModel::new(config.embedding_dimensions)))
        }
        "openai" => {
            tracing::info!(
                "LLM: OpenAI-compatible API at {} (summaries: {}, answers: {}, embeddings: {})",
                config.base_url,
                config.summary_model,
                config.answer_model,
                config.embedding_model
            );
            Ok(Arc::new(OpenAiModel::new(config)?))
        }
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

/// Embeds query text through a bounded LRU cache.
///
/// Questions and search strings repeat far more than span text does, so
/// only the read paths go through this.
pub struct CachedEmbedder {
    model: Arc<dyn LanguageModel>,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl CachedEmbedder {
    /// A zero capacity disables caching
    pub fn new(model: Arc<dyn LanguageModel>, capacity: usize) -> Self {
        Self {
            model,
            cache: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.lookup(text) {
            tracing::debug!("query embedding cache hit");
            return Ok(hit);
        }
        let embedding = self.model.embed(text).await?;
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                cache.put(text.to_string(), embedding.clone());
            }
        }
        Ok(embedding)
    }

    fn lookup(&self, text: &str) -> Option<Vec<f32>> {
        let mut cache = self.cache.as_ref()?.lock().ok()?;
        cache.get(text).cloned()
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }
}
