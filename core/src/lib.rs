pub mod config;
pub mod context;
pub mod dual_write;
pub mod engine;
pub mod enrichment;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod llm;
pub mod pending;
pub mod relational;
pub mod retrieval;
pub mod span;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use context::{ContextAssemblyEngine, Passage};
pub use dual_write::{DualWriteCoordinator, WriteOutcome};
pub use engine::{Answer, BatchReport, EngineStats, SearchResults, SpanGraphEngine};
pub use error::{ErrorKind, Result, SpanGraphError};
pub use graph::{create_graph_store, GraphStore, MemoryGraphStore};
pub use ingest::GraphIngestionEngine;
pub use llm::{create_language_model, LanguageModel, OfflineModel};
pub use relational::{create_relational_store, MemoryRelationalStore, RelationalStore};
pub use retrieval::{RetrievalFusionEngine, RetrievedTrace};
pub use span::{Span, SpanId, TraceId};
