use super::{Capabilities, RetentionPolicy, StorageBackend, StoreError};
use crate::models::{AggregateRecord, PeriodType, ProbeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::debug;

/// Embedded key-value backend. Flat keyspace with namespace prefixes:
///
/// ```text
/// result:{monitor}:{20-digit nanos}   → result JSON
/// latest:{monitor}                    → latest result JSON
/// agg:{hour|day}:{monitor}:{20-digit unix secs} → aggregate JSON
/// meta:{key}                         → raw bytes
/// ```
///
/// There is no native TTL; retention is a daily prune sweep over the
/// timestamp embedded in each key.
pub struct SledStore {
    db: ::sled::Db,
}

fn backend_err(err: ::sled::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn result_key(monitor: &str, ts: DateTime<Utc>) -> Vec<u8> {
    format!(
        "result:{}:{:020}",
        monitor,
        ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
    )
    .into_bytes()
}

fn latest_key(monitor: &str) -> Vec<u8> {
    format!("latest:{}", monitor).into_bytes()
}

fn aggregate_key(aggregate: &AggregateRecord) -> Vec<u8> {
    format!(
        "agg:{}:{}:{:020}",
        aggregate.period_type, aggregate.monitor, aggregate.period_start.timestamp()
    )
    .into_bytes()
}

fn meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}

/// Parse the trailing 20-digit timestamp a data key carries.
fn key_stamp(key: &[u8]) -> Option<i64> {
    let key = std::str::from_utf8(key).ok()?;
    key.rsplit(':').next()?.parse().ok()
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<SledStore, StoreError> {
        let db = ::sled::open(path).map_err(backend_err)?;
        Ok(SledStore { db })
    }
}

#[async_trait]
impl StorageBackend for SledStore {
    fn name(&self) -> &'static str {
        "sled"
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
        let value = serde_json::to_vec(result)?;
        self.db
            .insert(result_key(&result.monitor, result.timestamp), value.clone())
            .map_err(backend_err)?;
        self.db
            .insert(latest_key(&result.monitor), value)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn latest_result(&self, monitor: &str) -> Result<Option<ProbeResult>, StoreError> {
        match self.db.get(latest_key(monitor)).map_err(backend_err)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn results_in_range(
        &self,
        monitor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        let lo = result_key(monitor, start);
        let hi = result_key(monitor, end);
        let mut out = Vec::new();
        // key order is chronological; iterate backwards for newest-first
        for item in self.db.range(lo..=hi).rev() {
            let (_, raw) = item.map_err(backend_err)?;
            let result: ProbeResult = serde_json::from_slice(&raw)?;
            if result.timestamp > start && result.timestamp <= end {
                out.push(result);
                if limit > 0 && out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn store_aggregate(&self, aggregate: &AggregateRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(aggregate)?;
        self.db
            .insert(aggregate_key(aggregate), value)
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
        let lo = format!(
            "agg:{}:{}:{:020}",
            period_type,
            monitor,
            start.timestamp()
        );
        let hi = format!("agg:{}:{}:{:020}", period_type, monitor, end.timestamp());
        let mut out = Vec::new();
        for item in self.db.range(lo.into_bytes()..hi.into_bytes()) {
            let (_, raw) = item.map_err(backend_err)?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    async fn monitor_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for item in self.db.scan_prefix(b"latest:") {
            let (key, _) = item.map_err(backend_err)?;
            if let Ok(key) = std::str::from_utf8(&key) {
                if let Some(name) = key.strip_prefix("latest:") {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(meta_key(key), value)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .db
            .get(meta_key(key))
            .map_err(backend_err)?
            .map(|v| v.to_vec()))
    }

    async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let raw_cutoff = policy
            .raw_cutoff(now)
            .timestamp_nanos_opt()
            .unwrap_or(i64::MIN);
        let hourly_cutoff = policy.hourly_cutoff(now).timestamp();
        let daily_cutoff = policy.daily_cutoff(now).timestamp();

        let mut removed = 0u64;
        let mut doomed = Vec::new();
        for item in self.db.scan_prefix(b"result:") {
            let (key, _) = item.map_err(backend_err)?;
            if key_stamp(&key).map(|ts| ts < raw_cutoff).unwrap_or(false) {
                doomed.push(key);
            }
        }
        for (prefix, cutoff) in [(&b"agg:hour:"[..], hourly_cutoff), (&b"agg:day:"[..], daily_cutoff)] {
            for item in self.db.scan_prefix(prefix) {
                let (key, _) = item.map_err(backend_err)?;
                if key_stamp(&key).map(|ts| ts < cutoff).unwrap_or(false) {
                    doomed.push(key);
                }
            }
        }
        for key in doomed {
            self.db.remove(key).map_err(backend_err)?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "pruned expired entries");
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.db.flush_async().await.map_err(backend_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{result_at, ts};
    use super::*;
    use crate::models::ProbeStatus;
    use chrono::Duration as ChronoDuration;

    fn open_temp() -> (SledStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn result_round_trip_preserves_fields() {
        let (store, _dir) = open_temp();
        let mut r = result_at("web", ts(100), ProbeStatus::Down);
        r.error = Some("connection refused".into());
        store.store_result(&r).await.unwrap();

        let back = store.latest_result("web").await.unwrap().unwrap();
        assert_eq!(back.status, ProbeStatus::Down);
        assert_eq!(back.timestamp, ts(100));
        assert_eq!(back.response_time_ms, r.response_time_ms);
        assert_eq!(back.error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn range_is_start_exclusive_end_inclusive_newest_first() {
        let (store, _dir) = open_temp();
        for i in 0..5 {
            store
                .store_result(&result_at("web", ts(i * 10), ProbeStatus::Up))
                .await
                .unwrap();
        }
        let results = store
            .results_in_range("web", ts(10), ts(30), 0)
            .await
            .unwrap();
        let stamps: Vec<_> = results.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![ts(30), ts(20)]);

        let limited = store
            .results_in_range("web", ts(-1), ts(100), 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].timestamp, ts(40));
    }

    #[tokio::test]
    async fn aggregate_upsert_and_point_query() {
        let (store, _dir) = open_temp();
        let mut agg = AggregateRecord {
            monitor: "web".into(),
            period_type: PeriodType::Hour,
            period_start: ts(0),
            period_end: ts(3600),
            total_checks: 10,
            up_checks: 8,
            down_checks: 2,
            uptime_percent: 80.0,
            avg_response_ms: 12.0,
            min_response_ms: 5,
            max_response_ms: 40,
        };
        store.store_aggregate(&agg).await.unwrap();
        // idempotent: same window overwrites
        agg.total_checks = 11;
        store.store_aggregate(&agg).await.unwrap();

        let found = store
            .aggregates_in_range("web", PeriodType::Hour, ts(0), ts(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].total_checks, 11);

        let other_period = store
            .aggregates_in_range("web", PeriodType::Day, ts(0), ts(1))
            .await
            .unwrap();
        assert!(other_period.is_empty());
    }

    #[tokio::test]
    async fn metadata_and_monitor_names() {
        let (store, _dir) = open_temp();
        store
            .store_result(&result_at("a", ts(0), ProbeStatus::Up))
            .await
            .unwrap();
        store
            .store_result(&result_at("b", ts(0), ProbeStatus::Up))
            .await
            .unwrap();
        let mut names = store.monitor_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.get_metadata("k").await.unwrap().is_none());
        store.set_metadata("k", b"v").await.unwrap();
        assert_eq!(store.get_metadata("k").await.unwrap().unwrap(), b"v");
    }

    #[tokio::test]
    async fn prune_removes_only_expired_entries() {
        let (store, _dir) = open_temp();
        let now = Utc::now();
        let policy = RetentionPolicy { retention_days: 30 };

        let fresh = result_at("web", now - ChronoDuration::days(1), ProbeStatus::Up);
        let stale = result_at("web", now - ChronoDuration::days(31), ProbeStatus::Up);
        store.store_result(&fresh).await.unwrap();
        store.store_result(&stale).await.unwrap();

        let removed = store.prune(&policy, now).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store
            .results_in_range("web", now - ChronoDuration::days(40), now, 0)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, fresh.timestamp);
    }
}
