use crate::models::{AggregateRecord, PeriodType};
use crate::store::{RetentionPolicy, StorageBackend, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

const RUN_EVERY: Duration = Duration::from_secs(3600);
const PRUNE_EVERY: Duration = Duration::from_secs(86_400);

const LAST_RUN_KEY: &str = "aggregator:last_run";

/// Rolls raw results into hourly and daily aggregates: once at startup to
/// catch up, then every hour. Also hosts the daily retention sweep for
/// backends without native TTL. Skips entirely when the backend cannot
/// aggregate.
pub struct Aggregator {
    backend: Arc<dyn StorageBackend>,
    policy: RetentionPolicy,
}

impl Aggregator {
    pub fn new(backend: Arc<dyn StorageBackend>, policy: RetentionPolicy) -> Aggregator {
        Aggregator { backend, policy }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let caps = self.backend.capabilities();
        if caps.read_only {
            info!("storage backend is read-only, aggregator not running");
            return;
        }

        let mut ticker = interval(RUN_EVERY);
        // start in the past so the first tick also prunes
        let mut last_prune = Instant::now() - PRUNE_EVERY;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            if caps.supports_aggregation {
                if let Err(err) = self.aggregate_once(Utc::now()).await {
                    warn!(error = %err, "aggregation pass failed");
                }
            }
            if caps.supports_retention && last_prune.elapsed() >= PRUNE_EVERY {
                match self.backend.prune(&self.policy, Utc::now()).await {
                    Ok(removed) => {
                        last_prune = Instant::now();
                        if removed > 0 {
                            info!(removed, "retention sweep removed expired entries");
                        }
                    }
                    Err(err) if err.is_unsupported() => {}
                    Err(err) => warn!(error = %err, "retention sweep failed"),
                }
            }
        }
    }

    /// One aggregation pass over every whole hour and day between the last
    /// recorded run and `now`. Idempotent: re-aggregating a window upserts
    /// the same `(monitor, period, start)` record.
    pub async fn aggregate_once(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let last_run = self.last_run().await?;
        let hourly_from = last_run.unwrap_or(now - ChronoDuration::hours(24));
        let daily_from = last_run.unwrap_or(now - ChronoDuration::days(7));

        let monitors = self.backend.monitor_names().await?;
        for monitor in &monitors {
            if let Err(err) = self
                .rollup(monitor, PeriodType::Hour, hourly_from, now)
                .await
            {
                warn!(monitor = %monitor, error = %err, "hourly roll-up failed");
            }
            if let Err(err) = self.rollup(monitor, PeriodType::Day, daily_from, now).await {
                warn!(monitor = %monitor, error = %err, "daily roll-up failed");
            }
        }

        self.backend
            .set_metadata(LAST_RUN_KEY, now.to_rfc3339().as_bytes())
            .await?;
        Ok(())
    }

    async fn rollup(
        &self,
        monitor: &str,
        period_type: PeriodType,
        from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let step = match period_type {
            PeriodType::Hour => ChronoDuration::hours(1),
            PeriodType::Day => ChronoDuration::days(1),
        };
        let mut window_start = truncate(from, step);
        // the running period is excluded; only whole windows aggregate
        let current_period = truncate(now, step);

        let mut stored = 0u32;
        while window_start < current_period {
            let window_end = window_start + step;
            // [start, end) at nanosecond resolution over the backend's
            // (exclusive, inclusive] range contract
            let results = self
                .backend
                .results_in_range(
                    monitor,
                    window_start - ChronoDuration::nanoseconds(1),
                    window_end - ChronoDuration::nanoseconds(1),
                    0,
                )
                .await?;
            if let Some(aggregate) = AggregateRecord::from_results(
                monitor,
                period_type,
                window_start,
                window_end,
                &results,
            ) {
                self.backend.store_aggregate(&aggregate).await?;
                stored += 1;
            }
            window_start = window_end;
        }
        if stored > 0 {
            debug!(monitor = %monitor, period = %period_type, stored, "stored aggregates");
        }
        Ok(())
    }

    async fn last_run(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = match self.backend.get_metadata(LAST_RUN_KEY).await {
            Ok(raw) => raw,
            Err(err) if err.is_unsupported() => None,
            Err(err) => return Err(err),
        };
        Ok(raw
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|ts| ts.with_timezone(&Utc)))
    }
}

fn truncate(ts: DateTime<Utc>, step: ChronoDuration) -> DateTime<Utc> {
    ts.duration_trunc(step).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProbeStatus;
    use crate::store::test_support::result_at;
    use crate::store::SledStore;

    fn temp_backend() -> (Arc<dyn StorageBackend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn rolls_one_hour_of_raw_results_into_one_aggregate() {
        let (backend, _dir) = temp_backend();
        let now = Utc::now();
        let hour = truncate(now - ChronoDuration::hours(2), ChronoDuration::hours(1));

        for i in 0..10u32 {
            let status = if i < 8 {
                ProbeStatus::Up
            } else {
                ProbeStatus::Down
            };
            let ts = hour + ChronoDuration::minutes(i as i64 * 5);
            backend
                .store_result(&result_at("web", ts, status))
                .await
                .unwrap();
        }

        let aggregator = Aggregator::new(backend.clone(), RetentionPolicy { retention_days: 30 });
        aggregator.aggregate_once(now).await.unwrap();

        let aggregates = backend
            .aggregates_in_range("web", PeriodType::Hour, hour, hour + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(aggregates.len(), 1);
        let agg = &aggregates[0];
        assert_eq!(agg.total_checks, 10);
        assert_eq!(agg.up_checks, 8);
        assert_eq!(agg.down_checks, 2);
        assert!((agg.uptime_percent - 80.0).abs() < f64::EPSILON);
        assert_eq!(agg.period_start, hour);
    }

    #[tokio::test]
    async fn repeated_runs_are_idempotent_and_track_last_run() {
        let (backend, _dir) = temp_backend();
        let now = Utc::now();
        let hour = truncate(now - ChronoDuration::hours(3), ChronoDuration::hours(1));
        backend
            .store_result(&result_at("web", hour, ProbeStatus::Up))
            .await
            .unwrap();

        let aggregator = Aggregator::new(backend.clone(), RetentionPolicy { retention_days: 30 });
        aggregator.aggregate_once(now).await.unwrap();
        assert!(backend
            .get_metadata(LAST_RUN_KEY)
            .await
            .unwrap()
            .is_some());

        // second pass resumes from last_run and must not duplicate
        aggregator
            .aggregate_once(now + ChronoDuration::minutes(1))
            .await
            .unwrap();
        let aggregates = backend
            .aggregates_in_range(
                "web",
                PeriodType::Hour,
                hour - ChronoDuration::hours(1),
                hour + ChronoDuration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(aggregates.len(), 1);
    }

    #[tokio::test]
    async fn empty_windows_store_nothing() {
        let (backend, _dir) = temp_backend();
        let aggregator = Aggregator::new(backend.clone(), RetentionPolicy { retention_days: 30 });
        aggregator.aggregate_once(Utc::now()).await.unwrap();
        let aggregates = backend
            .aggregates_in_range(
                "web",
                PeriodType::Hour,
                Utc::now() - ChronoDuration::days(2),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(aggregates.is_empty());
    }

    #[test]
    fn truncation_aligns_to_whole_periods() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:42:31Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            truncate(ts, ChronoDuration::hours(1)),
            DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap()
        );
        assert_eq!(
            truncate(ts, ChronoDuration::days(1)),
            DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z").unwrap()
        );
    }
}
