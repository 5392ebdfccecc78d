use crate::graph::{CausalEdge, Relation};
use crate::span::SpanId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};

/// An edge waiting for its parent span to arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingEdge {
    pub relation: Relation,
    pub child: SpanId,
}

impl PendingEdge {
    pub fn into_edge(self, parent: SpanId) -> CausalEdge {
        CausalEdge {
            parent,
            relation: self.relation,
            child: self.child,
        }
    }
}

/// Residual entry, as reported by `snapshot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub parent: SpanId,
    pub edges: Vec<PendingEdge>,
}

/// Edges keyed by the parent span id that has not been ingested yet.
///
/// All mutation goes through a [`PendingGuard`]. Callers hold the guard
/// across the graph write that decides whether an edge is pending, so an
/// arriving parent can never drain the table between a failed edge attempt
/// and the append that follows it.
#[derive(Default)]
pub struct PendingEdgeTable {
    entries: Mutex<HashMap<SpanId, Vec<PendingEdge>>>,
}

pub struct PendingGuard<'a> {
    entries: MutexGuard<'a, HashMap<SpanId, Vec<PendingEdge>>>,
}

impl PendingEdgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> PendingGuard<'_> {
        PendingGuard {
            entries: self.entries.lock().await,
        }
    }

    /// Number of parents with at least one waiting edge
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<PendingEntry> {
        let entries = self.entries.lock().await;
        let mut snapshot: Vec<PendingEntry> = entries
            .iter()
            .map(|(parent, edges)| PendingEntry {
                parent: *parent,
                edges: edges.clone(),
            })
            .collect();
        snapshot.sort_by_key(|entry| entry.parent);
        snapshot
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

impl PendingGuard<'_> {
    /// Record `edge` as waiting on `parent`. Returns false when the same
    /// edge is already waiting.
    pub fn append(&mut self, parent: SpanId, edge: PendingEdge) -> bool {
        let waiting = self.entries.entry(parent).or_default();
        if waiting.contains(&edge) {
            return false;
        }
        waiting.push(edge);
        true
    }

    /// Remove and return every edge waiting on `parent`
    pub fn drain(&mut self, parent: SpanId) -> Vec<PendingEdge> {
        self.entries.remove(&parent).unwrap_or_default()
    }

    pub fn waiting_on(&self, parent: SpanId) -> usize {
        self.entries.get(&parent).map(Vec::len).unwrap_or(0)
    }
}
