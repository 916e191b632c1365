mod influx;
mod memory;
mod noop;
mod postgres;
mod sled;

pub use self::influx::InfluxStore;
pub use self::memory::Ring;
pub use self::noop::NoopStore;
pub use self::postgres::PostgresStore;
pub use self::sled::SledStore;

use crate::models::{AggregateRecord, PeriodType, ProbeResult, ProbeStatus, UptimeStats};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prometheus::IntCounter;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Pending persistent writes beyond this are dropped oldest-first so the
/// probe path stays live when the backend stalls.
const WRITE_QUEUE_CAPACITY: usize = 1024;

// ─── Errors & capabilities ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// The single well-known sentinel for operations a backend does not
    /// implement; the API layer maps it to HTTP 501.
    #[error("operation not supported by the active storage backend")]
    Unsupported,
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, StoreError::Unsupported)
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Capabilities {
    pub supports_aggregation: bool,
    pub supports_retention: bool,
    pub supports_raw_results: bool,
    pub read_only: bool,
}

/// Retention cutoffs derived from the configured raw retention:
/// hourly aggregates live twice as long as raw results, daily a year.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub retention_days: u32,
}

impl RetentionPolicy {
    pub fn raw_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(i64::from(self.retention_days))
    }

    pub fn hourly_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(i64::from(self.retention_days) * 2)
    }

    pub fn daily_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(365)
    }
}

// ─── Backend contract ───────────────────────────────────────────────────────

/// A persistent result store. Range queries return newest-first; a `limit`
/// of 0 means unlimited. Operations a backend cannot perform return
/// [`StoreError::Unsupported`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> Capabilities;

    async fn store_result(&self, result: &ProbeResult) -> Result<(), StoreError>;
    async fn latest_result(&self, monitor: &str) -> Result<Option<ProbeResult>, StoreError>;
    /// Raw results with `start < timestamp <= end`, newest first.
    async fn results_in_range(
        &self,
        monitor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError>;

    async fn store_aggregate(&self, aggregate: &AggregateRecord) -> Result<(), StoreError>;
    /// Aggregates with `start <= period_start < end`, oldest first.
    async fn aggregates_in_range(
        &self,
        monitor: &str,
        period_type: PeriodType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRecord>, StoreError>;

    async fn monitor_names(&self) -> Result<Vec<String>, StoreError>;
    async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete entries past their retention cutoff. Backends with native TTL
    /// may no-op. Returns the number of entries removed.
    async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

// ─── Hybrid store ───────────────────────────────────────────────────────────

/// Memory-first result store. Appends land synchronously in a per-monitor
/// ring; persistent writes drain through a background writer so probe
/// latency is independent of backend latency. Reads prefer memory and fall
/// back to the backend for history the rings no longer cover.
pub struct ResultStore {
    rings: RwLock<HashMap<String, Ring>>,
    capacity: usize,
    backend: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl ResultStore {
    pub fn new(backend: Arc<dyn StorageBackend>, dropped_writes: IntCounter) -> Arc<ResultStore> {
        ResultStore::with_capacity(backend, DEFAULT_RING_CAPACITY, dropped_writes)
    }

    pub fn with_capacity(
        backend: Arc<dyn StorageBackend>,
        capacity: usize,
        dropped_writes: IntCounter,
    ) -> Arc<ResultStore> {
        let queue = Arc::new(WriteQueue::new(WRITE_QUEUE_CAPACITY, dropped_writes));
        let writer = tokio::spawn(write_loop(queue.clone(), backend.clone()));
        Arc::new(ResultStore {
            rings: RwLock::new(HashMap::new()),
            capacity,
            backend,
            queue,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// Append a result: synchronous ring insert, asynchronous persistent
    /// write (fire-and-forget).
    pub fn append(&self, result: ProbeResult) {
        {
            let mut rings = self.rings.write().unwrap();
            rings
                .entry(result.monitor.clone())
                .or_insert_with(|| Ring::new(self.capacity))
                .push(result.clone());
        }
        let caps = self.backend.capabilities();
        if caps.supports_raw_results && !caps.read_only {
            self.queue.push(result);
        }
    }

    /// Latest result from memory only.
    pub fn latest_in_memory(&self, monitor: &str) -> Option<ProbeResult> {
        let rings = self.rings.read().unwrap();
        rings.get(monitor).and_then(|r| r.latest().cloned())
    }

    /// Latest result, falling back to the backend on a memory miss.
    pub async fn latest_result(&self, monitor: &str) -> Result<Option<ProbeResult>, StoreError> {
        if let Some(result) = self.latest_in_memory(monitor) {
            return Ok(Some(result));
        }
        match self.backend.latest_result(monitor).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_unsupported() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Raw results with `start < timestamp <= end`, newest first. Served
    /// from memory when the ring still covers the window start, otherwise
    /// from the backend; a backend without raw history degrades to whatever
    /// memory holds.
    pub async fn results_in_range(
        &self,
        monitor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        if self.memory_covers(monitor, start) {
            return Ok(self.range_from_memory(monitor, start, end, limit));
        }
        match self.backend.results_in_range(monitor, start, end, limit).await {
            Ok(results) => Ok(results),
            Err(err) if err.is_unsupported() => {
                Ok(self.range_from_memory(monitor, start, end, limit))
            }
            Err(err) => Err(err),
        }
    }

    /// Uptime ratio over `(now - window, now]`; zero when the window holds
    /// no samples.
    pub async fn uptime(
        &self,
        monitor: &str,
        window: ChronoDuration,
        period_label: &str,
    ) -> Result<UptimeStats, StoreError> {
        let now = Utc::now();
        let results = self.results_in_range(monitor, now - window, now, 0).await?;
        let total = results.len() as u64;
        let up = results.iter().filter(|r| r.status.is_up()).count() as u64;
        let down = results
            .iter()
            .filter(|r| r.status == ProbeStatus::Down)
            .count() as u64;
        let percent = if total > 0 {
            up as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(UptimeStats {
            monitor: monitor.to_string(),
            period: period_label.to_string(),
            uptime_percent: percent,
            total_checks: total,
            up_checks: up,
            down_checks: down,
        })
    }

    /// Names of monitors with any stored data, memory and backend merged.
    pub async fn monitor_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = {
            let rings = self.rings.read().unwrap();
            rings.keys().cloned().collect()
        };
        match self.backend.monitor_names().await {
            Ok(more) => names.extend(more),
            Err(err) if err.is_unsupported() => {}
            Err(err) => return Err(err),
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Flush queued writes and close the backend.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.queue.close();
        let writer = self.writer.lock().unwrap().take();
        if let Some(handle) = writer {
            if let Err(err) = handle.await {
                error!(error = %err, "store writer task failed");
            }
        }
        self.backend.close().await
    }

    fn memory_covers(&self, monitor: &str, start: DateTime<Utc>) -> bool {
        let rings = self.rings.read().unwrap();
        rings
            .get(monitor)
            .and_then(|r| r.oldest())
            .map(|oldest| oldest.timestamp <= start)
            .unwrap_or(false)
    }

    fn range_from_memory(
        &self,
        monitor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<ProbeResult> {
        let rings = self.rings.read().unwrap();
        let Some(ring) = rings.get(monitor) else {
            return Vec::new();
        };
        let iter = ring
            .iter_newest_first()
            .filter(|r| r.timestamp > start && r.timestamp <= end)
            .cloned();
        if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        }
    }
}

// ─── Async writer ───────────────────────────────────────────────────────────

struct WriteQueue {
    inner: Mutex<VecDeque<ProbeResult>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: IntCounter,
}

impl WriteQueue {
    fn new(capacity: usize, dropped: IntCounter) -> WriteQueue {
        WriteQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped,
        }
    }

    fn push(&self, result: ProbeResult) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.inc();
                warn!("persistent write queue full, dropping oldest result");
            }
            queue.push_back(result);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ProbeResult> {
        self.inner.lock().unwrap().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn write_loop(queue: Arc<WriteQueue>, backend: Arc<dyn StorageBackend>) {
    loop {
        match queue.pop() {
            Some(result) => {
                // write-path errors are logged and dropped; probes never fail
                // because storage did
                if let Err(err) = backend.store_result(&result).await {
                    if !err.is_unsupported() {
                        error!(monitor = %result.monitor, error = %err, "persistent write failed");
                    }
                }
            }
            None if queue.is_closed() => {
                debug!("store writer drained, exiting");
                return;
            }
            None => queue.notify.notified().await,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::MonitorKind;
    use chrono::TimeZone;

    pub fn result_at(monitor: &str, ts: DateTime<Utc>, status: ProbeStatus) -> ProbeResult {
        ProbeResult {
            monitor: monitor.to_string(),
            kind: MonitorKind::Tcp,
            group: "test".into(),
            status,
            response_time_ms: 5,
            timestamp: ts,
            error: None,
            http_result: None,
            tcp_result: None,
            dns_result: None,
            ping_result: None,
            metadata: HashMap::new(),
        }
    }

    pub fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn dropped_counter() -> IntCounter {
        IntCounter::new("test_dropped", "test").unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn latest_prefers_memory_and_falls_back_to_backend() {
        let backend = Arc::new(NoopStore::new());
        let store = ResultStore::new(backend, dropped_counter());

        assert!(store.latest_result("web").await.unwrap().is_none());

        store.append(result_at("web", ts(0), ProbeStatus::Up));
        store.append(result_at("web", ts(10), ProbeStatus::Down));
        let latest = store.latest_result("web").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, ts(10));
        assert_eq!(latest.status, ProbeStatus::Down);
    }

    #[tokio::test]
    async fn range_queries_serve_covered_windows_from_memory() {
        let backend = Arc::new(NoopStore::new());
        let store = ResultStore::new(backend, dropped_counter());
        for i in 0..10 {
            store.append(result_at("web", ts(i * 10), ProbeStatus::Up));
        }

        // window start before the oldest sample: not covered, but the noop
        // backend has nothing either, so memory still serves it
        let all = store
            .results_in_range("web", ts(-100), ts(1000), 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 10);
        // newest first
        assert_eq!(all[0].timestamp, ts(90));

        let limited = store
            .results_in_range("web", ts(0), ts(1000), 3)
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[2].timestamp, ts(70));

        // start is exclusive, end inclusive
        let window = store
            .results_in_range("web", ts(10), ts(30), 0)
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].timestamp, ts(30));
        assert_eq!(window[1].timestamp, ts(20));
    }

    #[tokio::test]
    async fn uptime_identity_holds_and_empty_window_is_zero() {
        let backend = Arc::new(NoopStore::new());
        let store = ResultStore::new(backend, dropped_counter());
        let now = Utc::now();
        for i in 0..8 {
            store.append(result_at(
                "web",
                now - ChronoDuration::seconds(60 - i),
                ProbeStatus::Up,
            ));
        }
        store.append(result_at(
            "web",
            now - ChronoDuration::seconds(5),
            ProbeStatus::Down,
        ));
        store.append(result_at(
            "web",
            now - ChronoDuration::seconds(4),
            ProbeStatus::Down,
        ));

        let stats = store
            .uptime("web", ChronoDuration::hours(1), "1h")
            .await
            .unwrap();
        assert_eq!(stats.total_checks, 10);
        assert_eq!(stats.up_checks, 8);
        assert_eq!(stats.down_checks, 2);
        let expected = stats.up_checks as f64 / stats.total_checks as f64 * 100.0;
        assert!((stats.uptime_percent - expected).abs() < f64::EPSILON);

        let empty = store
            .uptime("ghost", ChronoDuration::hours(1), "1h")
            .await
            .unwrap();
        assert_eq!(empty.total_checks, 0);
        assert_eq!(empty.uptime_percent, 0.0);
    }

    #[tokio::test]
    async fn close_drains_the_writer() {
        let backend = Arc::new(NoopStore::new());
        let store = ResultStore::new(backend, dropped_counter());
        for i in 0..50 {
            store.append(result_at("web", ts(i), ProbeStatus::Up));
        }
        store.close().await.unwrap();
    }

    #[test]
    fn write_queue_overflow_drops_oldest() {
        let queue = WriteQueue::new(3, dropped_counter());
        for i in 0..5 {
            queue.push(result_at("web", ts(i), ProbeStatus::Up));
        }
        assert_eq!(queue.dropped.get(), 2);
        // oldest two were dropped
        assert_eq!(queue.pop().unwrap().timestamp, ts(2));
        assert_eq!(queue.pop().unwrap().timestamp, ts(3));
        assert_eq!(queue.pop().unwrap().timestamp, ts(4));
        assert!(queue.pop().is_none());
    }
}
