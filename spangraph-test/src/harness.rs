use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use spangraph::server::{build_router, init_engine};
use spangraph_core::{
    create_language_model, Config, MemoryGraphStore, RelationalStore, SpanGraphEngine,
};
use std::sync::Arc;
use tower::ServiceExt;

/// Decoded response of one in-process request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl TestResponse {
    pub fn data(&self) -> &serde_json::Value {
        &self.body["data"]
    }

    pub fn error(&self) -> &str {
        self.body["error"].as_str().unwrap_or_default()
    }
}

pub struct TestApp {
    router: Router,
    engine: Arc<SpanGraphEngine>,
}

fn test_config(mut config: Config) -> Config {
    config.server.cors_enabled = false;
    config.server.verbose = false;
    config.server.rate_limit_enabled = false;
    config.storage.graph_backend = "memory".into();
    config.storage.relational_backend = "memory".into();
    config.llm.provider = "offline".into();
    config.llm.embedding_dimensions = 128;
    config.ingestion.flush_interval_ms = 10;
    config
}

impl TestApp {
    pub async fn new(config: Config) -> Result<Self> {
        let config = test_config(config);
        let engine = init_engine(&config).await?;
        let router = build_router(&config, Arc::clone(&engine));
        Ok(Self { router, engine })
    }

    /// App whose spans go to the given relational store instead of the
    /// in-memory one
    pub async fn with_relational_store(
        config: Config,
        relational: Arc<dyn RelationalStore>,
    ) -> Result<Self> {
        let config = test_config(config);
        let llm = create_language_model(&config.llm)?;
        let engine = Arc::new(SpanGraphEngine::with_components(
            config.clone(),
            Arc::new(MemoryGraphStore::new()),
            relational,
            llm,
        ));
        engine.start().await?;
        let router = build_router(&config, Arc::clone(&engine));
        Ok(Self { router, engine })
    }

    pub fn engine(&self) -> &Arc<SpanGraphEngine> {
        &self.engine
    }

    /// Enrich everything the background worker has not reached yet
    pub async fn settle(&self) -> usize {
        self.engine.flush_enrichment().await
    }

    pub async fn post_json(&self, path: &str, payload: serde_json::Value) -> Result<TestResponse> {
        let body = Body::from(serde_json::to_vec(&payload)?);
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(body)?;

        self.execute(request).await
    }

    pub async fn get_json(&self, path: &str) -> Result<TestResponse> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())?;

        self.execute(request).await
    }

    async fn execute(&self, request: Request<Body>) -> Result<TestResponse> {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("router execution failed")?;

        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .with_context(|| format!("non-JSON response with status {}", status))?
        };
        Ok(TestResponse { status, body })
    }
}
