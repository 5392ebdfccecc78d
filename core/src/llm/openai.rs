use super::LanguageModel;
use crate::config::LlmConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SPAN_SYSTEM_PROMPT: &str = "\
You help a software engineer troubleshoot a distributed system. Summarize the distributed \
tracing span delimited by <raw-span></raw-span>. Explain what the span did; for an HTTP request \
describe the flow briefly. Mention every key that is present. Do not include the delimiters in \
your response.";

const LOG_SYSTEM_PROMPT: &str = "\
You help a software engineer troubleshoot a distributed system. Summarize the span logs delimited \
by <raw-log></raw-log>. If there are no logs, return #EMPTY#. Mention every key that is present. \
Do not include the delimiters in your response.";

const ANSWER_SYSTEM_PROMPT: &str = "\
Give a factual answer to the question using only the passage. If the passage cannot answer it, \
return the phrase \"Insufficient Information\". Keep the answer concise and specific.

The passage describes part of a distributed trace as a graph. Edges have the form \
(span_id, relationship, span_id) and are directed from the first span to the second. \
INVOKES_CHILD means the first span called the second; INVOKES_FOLLOWS means the second span was \
started after and because of the first. Nodes list each span ID with its summary. Use the edges \
to reason about causality, but do not repeat the edge format unless asked to.";

/// Client for an OpenAI-compatible chat and embeddings API
pub struct OpenAiModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    summary_model: String,
    answer_model: String,
    embedding_model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).with_context(|| {
            format!(
                "LLM provider 'openai' requires the {} environment variable",
                config.api_key_env
            )
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            summary_model: config.summary_model.clone(),
            answer_model: config.answer_model.clone(),
            embedding_model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
        })
    }

    async fn chat(&self, model: &str, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        let response: ChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("chat completion request failed")?
            .error_for_status()
            .context("chat completion rejected")?
            .json()
            .await
            .context("malformed chat completion response")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("chat completion returned no content")
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn summarize_span(&self, rendered: &str) -> Result<String> {
        let user = format!(
            "Here is the raw span you need to summarize.\n<raw-span>\n{}\n</raw-span>",
            rendered
        );
        self.chat(&self.summary_model, SPAN_SYSTEM_PROMPT, &user)
            .await
    }

    async fn summarize_logs(&self, rendered: &str) -> Result<String> {
        let user = format!(
            "Here are the logs you need to summarize.\n<raw-log>\n{}\n</raw-log>",
            rendered
        );
        self.chat(&self.summary_model, LOG_SYSTEM_PROMPT, &user).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
            dimensions: self.dimensions,
        };

        let response: EmbeddingResponse = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("embedding request failed")?
            .error_for_status()
            .context("embedding request rejected")?
            .json()
            .await
            .context("malformed embedding response")?;

        response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .context("embedding response was empty")
    }

    async fn generate_answer(&self, question: &str, passage: &str) -> Result<String> {
        let user = format!(
            "Keep the answer short and specific. If asked for a count, return the number.\n\n<question>\n{}\n</question>\n<passage>\n{}\n</passage>",
            question, passage
        );
        self.chat(&self.answer_model, ANSWER_SYSTEM_PROMPT, &user)
            .await
    }
}
