use super::{EncodedSpan, Operation, RelationalStore, TraceRecord};
use crate::span::TraceId;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;

/// In-memory relational store using a DashMap keyed by trace id.
///
/// Services and their operations are kept apart from the spans and are never
/// removed by a later upsert, like the services and operations tables.
pub struct MemoryRelationalStore {
    traces: DashMap<TraceId, Vec<EncodedSpan>>,
    operations: DashMap<String, BTreeSet<Operation>>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self {
            traces: DashMap::new(),
            operations: DashMap::new(),
        }
    }
}

impl Default for MemoryRelationalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn write_span_record(&self, record: EncodedSpan) -> Result<()> {
        self.operations
            .entry(record.service_name.clone())
            .or_default()
            .insert(Operation {
                name: record.operation_name.clone(),
                span_kind: record.kind.clone(),
            });

        let mut spans = self.traces.entry(record.trace_id).or_default();
        match spans.iter_mut().find(|s| s.span_id == record.span_id) {
            Some(existing) => *existing = record,
            None => spans.push(record),
        }
        Ok(())
    }

    async fn fetch_traces_by_ids(&self, ids: &[TraceId]) -> Result<Vec<TraceRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for trace_id in ids {
            if let Some(spans) = self.traces.get(trace_id) {
                records.push(TraceRecord::from_encoded(*trace_id, spans.value())?);
            }
        }
        Ok(records)
    }

    async fn count_spans(&self) -> Result<usize> {
        Ok(self.traces.iter().map(|entry| entry.value().len()).sum())
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let mut services: Vec<String> =
            self.operations.iter().map(|entry| entry.key().clone()).collect();
        services.sort();
        Ok(services)
    }

    async fn list_operations(
        &self,
        service: &str,
        span_kind: Option<&str>,
    ) -> Result<Vec<Operation>> {
        let Some(operations) = self.operations.get(service) else {
            return Ok(Vec::new());
        };
        Ok(operations
            .iter()
            .filter(|op| span_kind.map_or(true, |kind| op.span_kind == kind))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.traces.clear();
        self.operations.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::KeyValue;
    use crate::test_support::span;

    #[tokio::test]
    async fn writes_upsert_and_fetch_keeps_request_order() -> Result<()> {
        let store = MemoryRelationalStore::new();
        store
            .write_span_record(EncodedSpan::encode(&span(1, 2, "a", "late", &[]))?)
            .await?;
        store
            .write_span_record(EncodedSpan::encode(&span(1, 1, "a", "early", &[]))?)
            .await?;
        store
            .write_span_record(EncodedSpan::encode(&span(2, 3, "b", "other", &[]))?)
            .await?;
        // retry of the same span replaces the earlier row
        store
            .write_span_record(EncodedSpan::encode(&span(1, 1, "a", "early v2", &[]))?)
            .await?;

        assert_eq!(store.count_spans().await?, 3);

        let records = store
            .fetch_traces_by_ids(&[TraceId::new(0, 2), TraceId::new(0, 99), TraceId::new(0, 1)])
            .await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].trace_id, TraceId::new(0, 2));
        let ops: Vec<&str> = records[1]
            .spans
            .iter()
            .map(|s| s.operation_name.as_str())
            .collect();
        assert_eq!(ops, vec!["early v2", "late"]);

        store.clear().await?;
        assert_eq!(store.count_spans().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn services_and_operations_are_listed() -> Result<()> {
        let store = MemoryRelationalStore::new();
        let mut lookup = span(1, 1, "driver", "FindNearest", &[]);
        lookup.tags.push(KeyValue::new("span.kind", "server"));
        let mut fetch = span(1, 2, "driver", "GetLocation", &[1]);
        fetch.tags.push(KeyValue::new("span.kind", "client"));
        for s in [&lookup, &fetch, &span(2, 3, "customer", "HTTP GET", &[])] {
            store.write_span_record(EncodedSpan::encode(s)?).await?;
        }
        // renaming a span keeps the operation it was first written under
        let mut renamed = lookup.clone();
        renamed.operation_name = "FindNearestV2".into();
        store.write_span_record(EncodedSpan::encode(&renamed)?).await?;

        assert_eq!(store.list_services().await?, vec!["customer", "driver"]);

        let names: Vec<String> = store
            .list_operations("driver", None)
            .await?
            .into_iter()
            .map(|op| op.name)
            .collect();
        assert_eq!(
            names,
            vec!["FindNearest", "FindNearestV2", "GetLocation"]
        );
        let clients = store.list_operations("driver", Some("client")).await?;
        assert_eq!(
            clients,
            vec![Operation {
                name: "GetLocation".into(),
                span_kind: "client".into(),
            }]
        );
        assert!(store.list_operations("driver", Some("producer")).await?.is_empty());
        assert!(store.list_operations("billing", None).await?.is_empty());

        store.clear().await?;
        assert!(store.list_services().await?.is_empty());
        Ok(())
    }
}
