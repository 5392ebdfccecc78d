use super::{EncodedSpan, Operation, RelationalStore, TraceRecord};
use crate::config::StorageConfig;
use crate::span::TraceId;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;

/// PostgreSQL relational store with services, operations and spans tables
pub struct PostgresRelationalStore {
    pool: PgPool,
}

impl PostgresRelationalStore {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let pg_config = &config.postgres;

        let connection_string = pg_config
            .connection_string
            .as_ref()
            .ok_or_else(|| anyhow!("PostgreSQL connection string is required"))?;

        let pool = PgPoolOptions::new()
            .max_connections(pg_config.max_connections)
            .min_connections(pg_config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                pg_config.connection_timeout_seconds as u64,
            ))
            .connect(connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        if pg_config.auto_migrate {
            tracing::info!("Running PostgreSQL migrations...");
            let migration_001 =
                include_str!("../../../migrations/postgres/001_initial_schema.sql");
            sqlx::raw_sql(migration_001).execute(&pool).await?;
            tracing::info!("Migration 001 (initial schema) completed");
        }

        Ok(Self { pool })
    }

    fn decode_row(row: &PgRow) -> Result<EncodedSpan> {
        let trace_id: String = row.try_get("trace_id")?;
        let span_id: String = row.try_get("span_id")?;
        let flags: i64 = row.try_get("flags")?;
        let duration_ns: i64 = row.try_get("duration_ns")?;
        Ok(EncodedSpan {
            trace_id: trace_id.parse()?,
            span_id: span_id.parse()?,
            service_name: row.try_get("service_name")?,
            operation_name: row.try_get("operation_name")?,
            kind: row.try_get("kind")?,
            flags: u32::try_from(flags).context("flags out of range")?,
            start_time: row.try_get("start_time")?,
            duration_ns: u64::try_from(duration_ns).context("negative duration")?,
            tags: row.try_get("tags")?,
            process_id: row.try_get("process_id")?,
            process_tags: row.try_get("process_tags")?,
            warnings: row.try_get("warnings")?,
            logs: row.try_get("logs")?,
            refs: row.try_get("refs")?,
        })
    }
}

#[async_trait]
impl RelationalStore for PostgresRelationalStore {
    async fn write_span_record(&self, record: EncodedSpan) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let service_id: i64 = sqlx::query(
            r#"
            WITH new_service AS (
                INSERT INTO services (name) VALUES ($1)
                ON CONFLICT (name) DO NOTHING
                RETURNING id
            )
            SELECT COALESCE(
                (SELECT id FROM new_service),
                (SELECT id FROM services WHERE name = $1)
            ) AS id
            "#,
        )
        .bind(&record.service_name)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert service")?
        .try_get("id")?;

        let operation_id: i64 = sqlx::query(
            r#"
            WITH new_operation AS (
                INSERT INTO operations (name, service_id, kind) VALUES ($1, $2, $3)
                ON CONFLICT (name, kind, service_id) DO NOTHING
                RETURNING id
            )
            SELECT COALESCE(
                (SELECT id FROM new_operation),
                (SELECT id FROM operations WHERE name = $1 AND kind = $3 AND service_id = $2)
            ) AS id
            "#,
        )
        .bind(&record.operation_name)
        .bind(service_id)
        .bind(&record.kind)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert operation")?
        .try_get("id")?;

        sqlx::query(
            r#"
            INSERT INTO spans (span_id, trace_id, operation_id, service_id, flags, start_time,
                               duration_ns, tags, process_id, process_tags, warnings, logs, kind, refs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (trace_id, span_id) DO UPDATE SET
                operation_id = EXCLUDED.operation_id,
                service_id = EXCLUDED.service_id,
                flags = EXCLUDED.flags,
                start_time = EXCLUDED.start_time,
                duration_ns = EXCLUDED.duration_ns,
                tags = EXCLUDED.tags,
                process_id = EXCLUDED.process_id,
                process_tags = EXCLUDED.process_tags,
                warnings = EXCLUDED.warnings,
                logs = EXCLUDED.logs,
                kind = EXCLUDED.kind,
                refs = EXCLUDED.refs
            "#,
        )
        .bind(record.span_id.to_string())
        .bind(record.trace_id.to_string())
        .bind(operation_id)
        .bind(service_id)
        .bind(record.flags as i64)
        .bind(record.start_time)
        .bind(i64::try_from(record.duration_ns).context("duration out of range")?)
        .bind(&record.tags)
        .bind(&record.process_id)
        .bind(&record.process_tags)
        .bind(&record.warnings)
        .bind(&record.logs)
        .bind(&record.kind)
        .bind(&record.refs)
        .execute(&mut *tx)
        .await
        .context("failed to insert span")?;

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_traces_by_ids(&self, ids: &[TraceId]) -> Result<Vec<TraceRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(TraceId::to_string).collect();

        let rows = sqlx::query(
            r#"
            SELECT s.trace_id, s.span_id, sv.name AS service_name, o.name AS operation_name,
                   s.kind, s.flags, s.start_time, s.duration_ns, s.tags, s.process_id,
                   s.process_tags, s.warnings, s.logs, s.refs
            FROM spans s
            JOIN services sv ON sv.id = s.service_id
            JOIN operations o ON o.id = s.operation_id
            WHERE s.trace_id = ANY($1) AND s.deleted_at IS NULL
            "#,
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch traces")?;

        let mut grouped: HashMap<TraceId, Vec<EncodedSpan>> = HashMap::new();
        for row in &rows {
            let encoded = Self::decode_row(row)?;
            grouped.entry(encoded.trace_id).or_default().push(encoded);
        }

        ids.iter()
            .filter_map(|id| grouped.get(id).map(|spans| (id, spans)))
            .map(|(id, spans)| TraceRecord::from_encoded(*id, spans))
            .collect()
    }

    async fn count_spans(&self) -> Result<usize> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM spans WHERE deleted_at IS NULL")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count as usize)
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM services WHERE deleted_at IS NULL ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("failed to list services")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(anyhow::Error::from))
            .collect()
    }

    async fn list_operations(
        &self,
        service: &str,
        span_kind: Option<&str>,
    ) -> Result<Vec<Operation>> {
        let rows = sqlx::query(
            r#"
            SELECT o.name, o.kind
            FROM operations o
            JOIN services s ON s.id = o.service_id
            WHERE s.name = $1
              AND ($2::TEXT IS NULL OR o.kind = $2)
              AND o.deleted_at IS NULL
            ORDER BY o.name, o.kind
            "#,
        )
        .bind(service)
        .bind(span_kind)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list operations of {}", service))?;

        rows.iter()
            .map(|row| {
                Ok(Operation {
                    name: row.try_get("name")?,
                    span_kind: row.try_get("kind")?,
                })
            })
            .collect()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE spans, operations, services RESTART IDENTITY CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
