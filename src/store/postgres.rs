use super::{Capabilities, RetentionPolicy, StorageBackend, StoreError};
use crate::config::PostgresConfig;
use crate::models::{AggregateRecord, PeriodType, ProbeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

/// Relational backend over tokio-postgres. Queryable columns are broken out
/// for SQL-side filtering; the `metadata` JSONB column holds the full result
/// record so reads reconstruct it losslessly.
pub struct PostgresStore {
    client: Client,
}

fn backend_err(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

const MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS monitor_results (
        id BIGSERIAL PRIMARY KEY,
        monitor TEXT NOT NULL,
        type TEXT NOT NULL,
        status TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        response_time_ms BIGINT NOT NULL,
        status_code INT,
        error TEXT,
        metadata JSONB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_results_monitor_ts
        ON monitor_results (monitor, timestamp DESC);

    CREATE TABLE IF NOT EXISTS monitor_aggregates (
        id BIGSERIAL PRIMARY KEY,
        monitor TEXT NOT NULL,
        period_type TEXT NOT NULL,
        period_start TIMESTAMPTZ NOT NULL,
        period_end TIMESTAMPTZ NOT NULL,
        total_checks BIGINT NOT NULL,
        up_checks BIGINT NOT NULL,
        down_checks BIGINT NOT NULL,
        uptime_percent DOUBLE PRECISION NOT NULL,
        avg_response_ms DOUBLE PRECISION NOT NULL,
        min_response_ms BIGINT NOT NULL,
        max_response_ms BIGINT NOT NULL,
        UNIQUE (monitor, period_type, period_start)
    );

    CREATE TABLE IF NOT EXISTS storage_metadata (
        key TEXT PRIMARY KEY,
        value BYTEA NOT NULL
    );
";

impl PostgresStore {
    pub async fn connect(config: &PostgresConfig) -> Result<PostgresStore, StoreError> {
        let (client, connection) =
            tokio_postgres::connect(&config.connection_string(), NoTls)
                .await
                .map_err(backend_err)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection terminated");
            }
        });
        client.batch_execute(MIGRATIONS).await.map_err(backend_err)?;
        Ok(PostgresStore { client })
    }
}

fn row_to_aggregate(row: &Row) -> AggregateRecord {
    let period_type: String = row.get("period_type");
    AggregateRecord {
        monitor: row.get("monitor"),
        period_type: if period_type == "day" {
            PeriodType::Day
        } else {
            PeriodType::Hour
        },
        period_start: row.get("period_start"),
        period_end: row.get("period_end"),
        total_checks: row.get::<_, i64>("total_checks") as u64,
        up_checks: row.get::<_, i64>("up_checks") as u64,
        down_checks: row.get::<_, i64>("down_checks") as u64,
        uptime_percent: row.get("uptime_percent"),
        avg_response_ms: row.get("avg_response_ms"),
        min_response_ms: row.get::<_, i64>("min_response_ms") as u64,
        max_response_ms: row.get::<_, i64>("max_response_ms") as u64,
    }
}

fn row_to_result(row: &Row) -> Result<ProbeResult, StoreError> {
    let raw: serde_json::Value = row.get("metadata");
    Ok(serde_json::from_value(raw)?)
}

#[async_trait]
impl StorageBackend for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_aggregation: true,
            supports_retention: true,
            supports_raw_results: true,
            read_only: false,
        }
    }

    async fn store_result(&self, result: &ProbeResult) -> Result<(), StoreError> {
        let status_code = result
            .http_result
            .as_ref()
            .and_then(|h| h.status_code)
            .map(i32::from);
        let metadata = serde_json::to_value(result)?;
        self.client
            .execute(
                "INSERT INTO monitor_results
                 (monitor, type, status, timestamp, response_time_ms, status_code, error, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &result.monitor,
                    &result.kind.as_str(),
                    &result.status.as_str(),
                    &result.timestamp,
                    &(result.response_time_ms as i64),
                    &status_code,
                    &result.error,
                    &metadata,
                ],
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn latest_result(&self, monitor: &str) -> Result<Option<ProbeResult>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT metadata FROM monitor_results
                 WHERE monitor = $1 ORDER BY timestamp DESC LIMIT 1",
                &[&monitor],
            )
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_result).transpose()
    }

    async fn results_in_range(
        &self,
        monitor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        let rows = if limit > 0 {
            self.client
                .query(
                    "SELECT metadata FROM monitor_results
                     WHERE monitor = $1 AND timestamp > $2 AND timestamp <= $3
                     ORDER BY timestamp DESC LIMIT $4",
                    &[&monitor, &start, &end, &(limit as i64)],
                )
                .await
        } else {
            self.client
                .query(
                    "SELECT metadata FROM monitor_results
                     WHERE monitor = $1 AND timestamp > $2 AND timestamp <= $3
                     ORDER BY timestamp DESC",
                    &[&monitor, &start, &end],
                )
                .await
        }
        .map_err(backend_err)?;
        rows.iter().map(row_to_result).collect()
    }

    async fn store_aggregate(&self, aggregate: &AggregateRecord) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO monitor_aggregates
                 (monitor, period_type, period_start, period_end, total_checks, up_checks,
                  down_checks, uptime_percent, avg_response_ms, min_response_ms, max_response_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (monitor, period_type, period_start) DO UPDATE SET
                    period_end = EXCLUDED.period_end,
                    total_checks = EXCLUDED.total_checks,
                    up_checks = EXCLUDED.up_checks,
                    down_checks = EXCLUDED.down_checks,
                    uptime_percent = EXCLUDED.uptime_percent,
                    avg_response_ms = EXCLUDED.avg_response_ms,
                    min_response_ms = EXCLUDED.min_response_ms,
                    max_response_ms = EXCLUDED.max_response_ms",
                &[
                    &aggregate.monitor,
                    &aggregate.period_type.as_str(),
                    &aggregate.period_start,
                    &aggregate.period_end,
                    &(aggregate.total_checks as i64),
                    &(aggregate.up_checks as i64),
                    &(aggregate.down_checks as i64),
                    &aggregate.uptime_percent,
                    &aggregate.avg_response_ms,
                    &(aggregate.min_response_ms as i64),
                    &(aggregate.max_response_ms as i64),
                ],
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn aggregates_in_range(
        &self,
        monitor: &str,
        period_type: PeriodType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRecord>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM monitor_aggregates
                 WHERE monitor = $1 AND period_type = $2
                   AND period_start >= $3 AND period_start < $4
                 ORDER BY period_start",
                &[&monitor, &period_type.as_str(), &start, &end],
            )
            .await
            .map_err(backend_err)?;
        Ok(rows.iter().map(row_to_aggregate).collect())
    }

    async fn monitor_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT monitor FROM monitor_results ORDER BY monitor",
                &[],
            )
            .await
            .map_err(backend_err)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO storage_metadata (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                &[&key, &value],
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT value FROM storage_metadata WHERE key = $1", &[&key])
            .await
            .map_err(backend_err)?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = self
            .client
            .execute(
                "DELETE FROM monitor_results WHERE timestamp < $1",
                &[&policy.raw_cutoff(now)],
            )
            .await
            .map_err(backend_err)?;
        removed += self
            .client
            .execute(
                "DELETE FROM monitor_aggregates WHERE period_type = 'hour' AND period_start < $1",
                &[&policy.hourly_cutoff(now)],
            )
            .await
            .map_err(backend_err)?;
        removed += self
            .client
            .execute(
                "DELETE FROM monitor_aggregates WHERE period_type = 'day' AND period_start < $1",
                &[&policy.daily_cutoff(now)],
            )
            .await
            .map_err(backend_err)?;
        if removed > 0 {
            debug!(removed, "pruned expired rows");
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
