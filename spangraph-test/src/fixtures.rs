use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use spangraph_core::relational::{EncodedSpan, Operation, RelationalStore, TraceRecord};
use spangraph_core::TraceId;

pub struct TraceFixture {
    pub trace_id: String,
    pub spans: Vec<Value>,
    /// (parent, relation, child) edges the graph must end up with
    pub expected_edges: Vec<(String, String, String)>,
}

pub struct SpanDef<'a> {
    pub id: u64,
    pub parent: Option<(u64, &'a str)>,
    pub service: &'a str,
    pub operation: &'a str,
    pub offset_ms: i64,
    pub duration_ms: u64,
    pub tags: Value,
    pub logs: Vec<(&'a str, &'a str)>,
}

pub fn span_id(id: u64) -> String {
    format!("{:016x}", id)
}

pub fn span_json(trace_id: &str, def: &SpanDef<'_>) -> Value {
    let start = Utc.with_ymd_and_hms(2024, 11, 18, 9, 30, 0).unwrap()
        + Duration::milliseconds(def.offset_ms);
    let references: Vec<Value> = def
        .parent
        .iter()
        .map(|(parent, ref_type)| {
            json!({
                "trace_id": trace_id,
                "span_id": span_id(*parent),
                "ref_type": ref_type,
            })
        })
        .collect();
    let logs: Vec<Value> = def
        .logs
        .iter()
        .map(|(key, value)| {
            json!({
                "timestamp": (start + Duration::milliseconds(1)).to_rfc3339(),
                "fields": [{ "key": key, "value": value }],
            })
        })
        .collect();

    json!({
        "trace_id": trace_id,
        "span_id": span_id(def.id),
        "operation_name": def.operation,
        "references": references,
        "flags": 1,
        "start_time": start.to_rfc3339(),
        "duration_ns": def.duration_ms * 1_000_000,
        "tags": def.tags,
        "logs": logs,
        "process": { "service_name": def.service, "tags": [] },
        "process_id": "p1",
    })
}

fn build(trace_id: &str, defs: &[SpanDef<'_>]) -> TraceFixture {
    let expected_edges = defs
        .iter()
        .filter_map(|def| {
            def.parent.map(|(parent, ref_type)| {
                let relation = match ref_type {
                    "follows_from" => "INVOKES_FOLLOWS",
                    _ => "INVOKES_CHILD",
                };
                (span_id(parent), relation.to_string(), span_id(def.id))
            })
        })
        .collect();
    TraceFixture {
        trace_id: trace_id.to_string(),
        spans: defs.iter().map(|def| span_json(trace_id, def)).collect(),
        expected_edges,
    }
}

/// Ride dispatch trace whose driver lookup fails on a redis timeout.
///
/// Spans are listed children first so that ingesting them in order
/// exercises the pending-edge path.
pub fn dispatch_trace_fixture() -> TraceFixture {
    build(
        "00000000000d15a7",
        &[
            SpanDef {
                id: 6,
                parent: Some((5, "child_of")),
                service: "redis",
                operation: "GetDriver",
                offset_ms: 40,
                duration_ms: 120,
                tags: json!([{ "key": "error", "value": true }]),
                logs: vec![("error", "redis timeout while fetching driver location")],
            },
            SpanDef {
                id: 5,
                parent: Some((1, "child_of")),
                service: "driver",
                operation: "FindNearest",
                offset_ms: 30,
                duration_ms: 200,
                tags: json!([{ "key": "rpc.grpc.status_code", "value": 0 }]),
                logs: vec![],
            },
            SpanDef {
                id: 3,
                parent: Some((2, "child_of")),
                service: "mysql",
                operation: "SQL SELECT",
                offset_ms: 5,
                duration_ms: 300,
                tags: json!([{ "key": "db.statement", "value": "SELECT * FROM customer WHERE id = 123" }]),
                logs: vec![("event", "acquired connection from pool")],
            },
            SpanDef {
                id: 7,
                parent: Some((5, "follows_from")),
                service: "route",
                operation: "HTTP GET /route",
                offset_ms: 250,
                duration_ms: 50,
                tags: json!([{ "key": "http.status_code", "value": 200 }]),
                logs: vec![],
            },
            SpanDef {
                id: 2,
                parent: Some((1, "child_of")),
                service: "customer",
                operation: "HTTP GET /customer",
                offset_ms: 1,
                duration_ms: 310,
                tags: json!([
                    { "key": "http.status_code", "value": 200 },
                    { "key": "span.kind", "value": "server" }
                ]),
                logs: vec![],
            },
            SpanDef {
                id: 1,
                parent: None,
                service: "frontend",
                operation: "HTTP GET /dispatch",
                offset_ms: 0,
                duration_ms: 700,
                tags: json!([
                    { "key": "http.status_code", "value": 200 },
                    { "key": "span.kind", "value": "server" }
                ]),
                logs: vec![],
            },
        ],
    )
}

/// Small unrelated trace used to check ranking
pub fn inventory_trace_fixture() -> TraceFixture {
    build(
        "0000000000001e55",
        &[
            SpanDef {
                id: 101,
                parent: None,
                service: "inventory",
                operation: "ReserveStock",
                offset_ms: 0,
                duration_ms: 15,
                tags: json!([]),
                logs: vec![("event", "stock reserved for order 88")],
            },
            SpanDef {
                id: 102,
                parent: Some((101, "child_of")),
                service: "postgres",
                operation: "UPDATE stock",
                offset_ms: 2,
                duration_ms: 8,
                tags: json!([{ "key": "db.statement", "value": "UPDATE stock SET reserved = reserved + 1" }]),
                logs: vec![],
            },
        ],
    )
}

/// Relational store that refuses every write
pub struct FailingRelationalStore;

#[async_trait]
impl RelationalStore for FailingRelationalStore {
    async fn write_span_record(&self, _record: EncodedSpan) -> Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn fetch_traces_by_ids(&self, _ids: &[TraceId]) -> Result<Vec<TraceRecord>> {
        anyhow::bail!("connection refused")
    }

    async fn count_spans(&self) -> Result<usize> {
        Ok(0)
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        anyhow::bail!("connection refused")
    }

    async fn list_operations(
        &self,
        _service: &str,
        _span_kind: Option<&str>,
    ) -> Result<Vec<Operation>> {
        anyhow::bail!("connection refused")
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}
