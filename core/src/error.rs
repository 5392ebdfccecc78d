use crate::span::SpanId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = SpanGraphError> = std::result::Result<T, E>;

/// Error taxonomy shared by ingestion, retrieval and the HTTP surface
#[derive(Debug, Error)]
pub enum SpanGraphError {
    /// Input rejected before any store was touched
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{context}: {source:#}")]
    Store {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("enrichment of span {span_id} failed: {source:#}")]
    Enrichment {
        span_id: SpanId,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to embed query: {0:#}")]
    Embedding(#[source] anyhow::Error),

    #[error("graph traversal failed: {0:#}")]
    Traversal(#[source] anyhow::Error),

    #[error("answer generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),

    /// One or both halves of a dual write failed. Each field carries the
    /// failure message of that store, if it failed.
    #[error("{}", dual_write_message(.relational, .graph))]
    DualWrite {
        relational: Option<String>,
        graph: Option<String>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

fn dual_write_message(relational: &Option<String>, graph: &Option<String>) -> String {
    let mut failures = Vec::new();
    if let Some(e) = relational {
        failures.push(format!("relational store: {}", e));
    }
    if let Some(e) = graph {
        failures.push(format!("graph store: {}", e));
    }
    format!("dual write failed ({})", failures.join("; "))
}

/// Coarse class of a [`SpanGraphError`], used to pick a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Store,
    Enrichment,
    Embedding,
    Traversal,
    Generation,
    DualWrite,
    Config,
}

impl SpanGraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Store { .. } => ErrorKind::Store,
            Self::Enrichment { .. } => ErrorKind::Enrichment,
            Self::Embedding(_) => ErrorKind::Embedding,
            Self::Traversal(_) => ErrorKind::Traversal,
            Self::Generation(_) => ErrorKind::Generation,
            Self::DualWrite { .. } => ErrorKind::DualWrite,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn store(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Attach store call context to an `anyhow` result
pub trait StoreContext<T> {
    fn store_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> StoreContext<T> for anyhow::Result<T> {
    fn store_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| SpanGraphError::store(context(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_write_names_every_failure() {
        let both = SpanGraphError::DualWrite {
            relational: Some("connection refused".into()),
            graph: Some("lock poisoned".into()),
        };
        let message = both.to_string();
        assert!(message.contains("relational store: connection refused"));
        assert!(message.contains("graph store: lock poisoned"));

        let one = SpanGraphError::DualWrite {
            relational: None,
            graph: Some("boom".into()),
        };
        assert_eq!(one.to_string(), "dual write failed (graph store: boom)");
    }

    #[test]
    fn store_context_wraps_source() {
        let result: anyhow::Result<()> = Err(anyhow::anyhow!("disk full"));
        let err = result
            .store_context(|| "merge span 01".to_string())
            .unwrap_err();
        assert_eq!(err.to_string(), "merge span 01: disk full");
        assert!(matches!(err, SpanGraphError::Store { .. }));
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let kind = SpanGraphError::NotFound("trace 01".into()).kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"not_found\"");
    }
}
