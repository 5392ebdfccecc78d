use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Main configuration structure for spangraph.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file is missing.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load config from {:?}: {}. Using defaults.",
                    path.as_ref(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Get the default configuration as a TOML string.
    pub fn default_toml() -> Result<String> {
        let config = Self::default();
        toml::to_string_pretty(&config).context("Failed to serialize default config")
    }

    /// Validate the configuration for obvious misconfiguration.
    pub fn validate(&self) -> Result<()> {
        match self.storage.graph_backend.as_str() {
            "memory" => {}
            other => anyhow::bail!("Invalid graph backend: {}", other),
        }

        match self.storage.relational_backend.as_str() {
            "memory" | "postgres" => {}
            other => anyhow::bail!("Invalid relational backend: {}", other),
        }

        if self.storage.relational_backend == "postgres"
            && self.storage.postgres.connection_string.is_none()
        {
            anyhow::bail!("PostgreSQL relational backend requires connection_string");
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.server.rate_limit_enabled && self.server.rate_limit_rpm == 0 {
            anyhow::bail!("rate_limit_rpm must be greater than 0 when rate limiting is enabled");
        }

        if self.ingestion.enrichment_buffer == 0 {
            anyhow::bail!("enrichment_buffer must be greater than 0");
        }

        if self.ingestion.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.retrieval.default_limit == 0 {
            anyhow::bail!("default_limit must be greater than 0");
        }

        if self.retrieval.max_hops < self.retrieval.default_hops {
            anyhow::bail!(
                "max_hops ({}) cannot be lower than default_hops ({})",
                self.retrieval.max_hops,
                self.retrieval.default_hops
            );
        }

        match self.llm.provider.as_str() {
            "offline" | "openai" => {}
            other => anyhow::bail!("Invalid llm provider: {}", other),
        }

        if self.llm.embedding_dimensions == 0 {
            anyhow::bail!("embedding_dimensions must be greater than 0");
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Invalid log level: {}", other),
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse config")?;
        Ok(config)
    }
}

/// Runtime server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verbose: false,
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            rate_limit_enabled: false,
            rate_limit_rpm: default_rate_limit_rpm(),
        }
    }
}

/// Storage configuration for both halves of the dual write.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub graph_backend: String,

    #[serde(default = "default_backend")]
    pub relational_backend: String,

    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            graph_backend: default_backend(),
            relational_backend: default_backend(),
            postgres: PostgresConfig::default(),
        }
    }
}

/// PostgreSQL settings for the relational span store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub connection_string: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u32,

    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_seconds: default_connection_timeout(),
            auto_migrate: true,
        }
    }
}

/// When enrichment runs relative to structural ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentMode {
    /// Summaries and embeddings are produced inside the ingest call; a
    /// summarizer failure fails the ingest.
    Inline,
    /// Ingest enqueues a job and a worker enriches it later, with retries.
    #[default]
    Background,
}

/// Ingestion and enrichment tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    /// Spans reported by this service are the collector's own and are not stored.
    #[serde(default = "default_self_service_name")]
    pub self_service_name: String,

    #[serde(default)]
    pub enrichment: EnrichmentMode,

    #[serde(default = "default_enrichment_buffer")]
    pub enrichment_buffer: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_max_enrichment_attempts")]
    pub max_enrichment_attempts: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            self_service_name: default_self_service_name(),
            enrichment: EnrichmentMode::default(),
            enrichment_buffer: default_enrichment_buffer(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            max_enrichment_attempts: default_max_enrichment_attempts(),
        }
    }
}

/// How vector similarity scores enter the fusion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VectorNormalization {
    /// Raw similarity scores are fused as-is.
    None,
    #[default]
    MinMax,
}

/// Retrieval and passage assembly tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_hops")]
    pub default_hops: usize,

    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    #[serde(default)]
    pub vector_normalization: VectorNormalization,

    #[serde(default = "default_true")]
    pub dedupe_edges: bool,

    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_hops: default_hops(),
            max_hops: default_max_hops(),
            vector_normalization: VectorNormalization::default(),
            dedupe_edges: true,
            query_cache_size: default_query_cache_size(),
        }
    }
}

/// Language model client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_chat_model")]
    pub summary_model: String,

    #[serde(default = "default_chat_model")]
    pub answer_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            api_key_env: default_api_key_env(),
            summary_model: default_chat_model(),
            answer_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub include_modules: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            include_modules: false,
        }
    }
}

// Default providers ---------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_rate_limit_rpm() -> u32 {
    1000
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connection_timeout() -> u32 {
    30
}

fn default_self_service_name() -> String {
    "jaeger-all-in-one".to_string()
}

fn default_enrichment_buffer() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    32
}

fn default_flush_interval() -> u64 {
    100
}

fn default_max_enrichment_attempts() -> u32 {
    3
}

fn default_limit() -> usize {
    10
}

fn default_hops() -> usize {
    1
}

fn default_max_hops() -> usize {
    4
}

fn default_query_cache_size() -> usize {
    256
}

fn default_llm_provider() -> String {
    "offline".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    256
}

fn default_request_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

// Tests ---------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.relational_backend, "memory");
        assert_eq!(config.ingestion.self_service_name, "jaeger-all-in-one");
        assert_eq!(config.ingestion.enrichment, EnrichmentMode::Background);
        assert_eq!(
            config.retrieval.vector_normalization,
            VectorNormalization::MinMax
        );
        assert!(config.retrieval.dedupe_edges);
        assert_eq!(config.llm.provider, "offline");
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_backends() {
        let mut config = Config::default();
        config.storage.relational_backend = "cassandra".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.graph_backend = "neo4j".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.llm.provider = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_postgres_requires_connection_string() {
        let mut config = Config::default();
        config.storage.relational_backend = "postgres".to_string();
        config.storage.postgres.connection_string = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_hop_bounds_and_buffers() {
        let mut config = Config::default();
        config.retrieval.default_hops = 5;
        config.retrieval.max_hops = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingestion.enrichment_buffer = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingestion.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 3000

            [storage]
            relational_backend = "postgres"

            [storage.postgres]
            connection_string = "postgres://localhost/spans"

            [ingestion]
            enrichment = "inline"

            [retrieval]
            vector_normalization = "none"
            dedupe_edges = false

            [logging]
            level = "debug"
        "#;

        let config = Config::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.relational_backend, "postgres");
        assert_eq!(
            config.storage.postgres.connection_string,
            Some("postgres://localhost/spans".to_string())
        );
        assert_eq!(config.ingestion.enrichment, EnrichmentMode::Inline);
        assert_eq!(
            config.retrieval.vector_normalization,
            VectorNormalization::None
        );
        assert!(!config.retrieval.dedupe_edges);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = Config::default_toml().unwrap();
        let parsed = Config::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 8080);
        assert_eq!(parsed.retrieval.default_limit, 10);
    }
}
