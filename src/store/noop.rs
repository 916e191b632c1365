use super::{Capabilities, RetentionPolicy, StorageBackend, StoreError};
use crate::models::{AggregateRecord, PeriodType, ProbeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The `none` backend: memory-only operation. Every persistent operation
/// reports the unsupported sentinel; the hybrid store serves what its rings
/// hold and the API maps the rest to HTTP 501.
#[derive(Debug, Default)]
pub struct NoopStore;

impl NoopStore {
    pub fn new() -> NoopStore {
        NoopStore
    }
}

#[async_trait]
impl StorageBackend for NoopStore {
    fn name(&self) -> &'static str {
        "none"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_aggregation: false,
            supports_retention: false,
            supports_raw_results: false,
            read_only: false,
        }
    }

    async fn store_result(&self, _result: &ProbeResult) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn latest_result(&self, _monitor: &str) -> Result<Option<ProbeResult>, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn results_in_range(
        &self,
        _monitor: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn store_aggregate(&self, _aggregate: &AggregateRecord) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn aggregates_in_range(
        &self,
        _monitor: &str,
        _period_type: PeriodType,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRecord>, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn monitor_names(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn set_metadata(&self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn get_metadata(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn prune(&self, _policy: &RetentionPolicy, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
