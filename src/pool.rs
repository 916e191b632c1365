use crate::backoff::BackoffTracker;
use crate::executors::{self, CheckError, ErrorKind, Executor};
use crate::metrics::Metrics;
use crate::models::ProbeStatus;
use crate::store::ResultStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const DEFAULT_POOL_SIZE: usize = 10;

/// Fallback probe timeout for monitors that somehow carry none.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(300);

/// One scheduled probe.
pub struct Job {
    pub executor: Executor,
    pub scheduled_at: DateTime<Utc>,
}

/// Fixed pool of probe workers behind a bounded queue (capacity twice the
/// pool size). `submit` never blocks: a full queue rejects the job and the
/// scheduler retries the monitor on its next tick.
pub struct WorkerPool {
    job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    active: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct WorkerShared {
    store: Arc<ResultStore>,
    backoff: Arc<BackoffTracker>,
    metrics: Arc<Metrics>,
    active: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        store: Arc<ResultStore>,
        backoff: Arc<BackoffTracker>,
        metrics: Arc<Metrics>,
    ) -> Arc<WorkerPool> {
        let size = size.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>(size * 2);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let active = Arc::new(AtomicUsize::new(0));
        let pending = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let shared = WorkerShared {
                store: store.clone(),
                backoff: backoff.clone(),
                metrics: metrics.clone(),
                active: active.clone(),
                pending: pending.clone(),
                processed: processed.clone(),
            };
            let job_rx = job_rx.clone();
            workers.push(tokio::spawn(worker_loop(id, job_rx, shared)));
        }
        info!(size, "worker pool started");

        Arc::new(WorkerPool {
            job_tx: Mutex::new(Some(job_tx)),
            active,
            pending,
            processed,
            workers: Mutex::new(workers),
        })
    }

    /// Non-blocking submission. `false` when the queue is full or the pool
    /// is stopping.
    pub fn submit(&self, job: Job) -> bool {
        let tx = self.job_tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Close the queue and wait for workers to drain in-flight and queued
    /// probes (each bounded by its own timeout).
    pub async fn stop(&self) {
        drop(self.job_tx.lock().unwrap().take());
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker task failed to join");
            }
        }
        info!(processed = self.processed_jobs(), "worker pool drained");
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn processed_jobs(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }
}

async fn worker_loop(
    id: usize,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    shared: WorkerShared,
) {
    loop {
        // hold the lock only while waiting for the next job
        let job = { job_rx.lock().await.recv().await };
        match job {
            Some(job) => process_job(job, &shared).await,
            None => {
                debug!(worker = id, "job queue closed, worker exiting");
                return;
            }
        }
    }
}

async fn process_job(job: Job, shared: &WorkerShared) {
    shared.pending.fetch_sub(1, Ordering::SeqCst);
    shared.active.fetch_add(1, Ordering::SeqCst);
    shared.metrics.running_checks.inc();

    let monitor = job.executor.monitor().clone();
    let started = Instant::now();
    let timeout = probe_timeout(monitor.timeout);

    // the probe runs in its own task so a panicking executor cannot take
    // the worker down with it
    let metrics = shared.metrics.clone();
    let probe = tokio::spawn(async move { job.executor.check(&metrics).await });
    let abort = probe.abort_handle();

    let result = match tokio::time::timeout(timeout, probe).await {
        Err(_) => {
            abort.abort();
            let err = CheckError::new(
                ErrorKind::Timeout,
                format!("probe timed out after {:?}", timeout),
            );
            executors::synthesize_failure(&shared.metrics, &monitor, started, &err)
        }
        Ok(Err(join_err)) if join_err.is_panic() => {
            error!(monitor = %monitor.name, "probe panicked, recovering worker");
            let err = CheckError::new(ErrorKind::Unknown, "probe panicked");
            executors::synthesize_failure(&shared.metrics, &monitor, started, &err)
        }
        Ok(Err(_)) => {
            // aborted during shutdown; still record the attempt as down
            let err = CheckError::new(ErrorKind::Unknown, "probe cancelled");
            executors::synthesize_failure(&shared.metrics, &monitor, started, &err)
        }
        Ok(Ok(Err(check_err))) => {
            executors::synthesize_failure(&shared.metrics, &monitor, started, &check_err)
        }
        Ok(Ok(Ok(result))) => result,
    };

    let failed = result.status == ProbeStatus::Down;
    shared.store.append(result);
    if failed {
        shared.backoff.record_failure(&monitor.name);
    } else {
        shared.backoff.record_success(&monitor.name);
    }

    shared.processed.fetch_add(1, Ordering::SeqCst);
    shared.active.fetch_sub(1, Ordering::SeqCst);
    shared.metrics.running_checks.dec();
}

fn probe_timeout(configured: Duration) -> Duration {
    if configured.is_zero() {
        DEFAULT_PROBE_TIMEOUT
    } else {
        configured.min(MAX_PROBE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::monitor;
    use crate::executors::ProbeContext;
    use crate::models::MonitorKind;
    use crate::store::NoopStore;
    use prometheus::{IntCounter, Registry};
    use tokio::net::TcpListener;

    fn fixture() -> (Arc<ResultStore>, Arc<BackoffTracker>, Arc<Metrics>) {
        let store = ResultStore::new(
            Arc::new(NoopStore::new()),
            IntCounter::new("dropped", "dropped").unwrap(),
        );
        let backoff = Arc::new(BackoffTracker::new());
        let metrics = Arc::new(Metrics::new(Registry::new()).unwrap());
        (store, backoff, metrics)
    }

    fn tcp_job(ctx: &ProbeContext, name: &str, target: String) -> Job {
        let mut m = monitor(MonitorKind::Tcp, name);
        m.target = Some(target);
        let executor = Executor::build(Arc::new(m), ctx).unwrap();
        Job {
            executor,
            scheduled_at: Utc::now(),
        }
    }

    async fn wait_for_result(
        store: &ResultStore,
        name: &str,
    ) -> crate::models::ProbeResult {
        for _ in 0..100 {
            if let Some(result) = store.latest_in_memory(name) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no result stored for {}", name);
    }

    #[tokio::test]
    async fn successful_probe_is_stored_and_clears_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (store, backoff, metrics) = fixture();
        let ctx = ProbeContext::new().unwrap();
        let pool = WorkerPool::start(2, store.clone(), backoff.clone(), metrics);

        backoff.record_failure("ok");
        assert!(pool.submit(tcp_job(&ctx, "ok", format!("127.0.0.1:{}", port))));

        let result = wait_for_result(&store, "ok").await;
        assert_eq!(result.status, ProbeStatus::Up);
        assert!(result.tcp_result.unwrap().connected);
        assert_eq!(backoff.consecutive_failures("ok"), 0);
        assert_eq!(pool.processed_jobs(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn failing_probe_records_backoff_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (store, backoff, metrics) = fixture();
        let ctx = ProbeContext::new().unwrap();
        let pool = WorkerPool::start(2, store.clone(), backoff.clone(), metrics);

        assert!(pool.submit(tcp_job(&ctx, "dead", format!("127.0.0.1:{}", port))));
        let result = wait_for_result(&store, "dead").await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert_eq!(backoff.consecutive_failures("dead"), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn panicking_executor_does_not_kill_the_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (store, backoff, metrics) = fixture();
        let ctx = ProbeContext::new().unwrap();
        let pool = WorkerPool::start(1, store.clone(), backoff.clone(), metrics);

        let chaotic = Executor::panicking(Arc::new(monitor(MonitorKind::Tcp, "chaos")));
        assert!(pool.submit(Job {
            executor: chaotic,
            scheduled_at: Utc::now(),
        }));

        let crashed = wait_for_result(&store, "chaos").await;
        assert_eq!(crashed.status, ProbeStatus::Down);
        assert_eq!(crashed.error.as_deref(), Some("probe panicked"));
        assert_eq!(backoff.consecutive_failures("chaos"), 1);

        // the single worker survived and keeps processing
        assert!(pool.submit(tcp_job(&ctx, "after", format!("127.0.0.1:{}", port))));
        let next = wait_for_result(&store, "after").await;
        assert_eq!(next.status, ProbeStatus::Up);
        assert_eq!(backoff.consecutive_failures("after"), 0);
        assert_eq!(pool.processed_jobs(), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_submissions() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/slow");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let (store, backoff, metrics) = fixture();
        let ctx = ProbeContext::new().unwrap();
        let pool = WorkerPool::start(1, store, backoff, metrics);

        let mut rejected = 0;
        for i in 0..6 {
            let mut m = monitor(MonitorKind::Http, &format!("slow-{}", i));
            m.url = Some(server.url("/slow"));
            m.expected_status = Some(200);
            let executor = Executor::build(Arc::new(m), &ctx).unwrap();
            if !pool.submit(Job {
                executor,
                scheduled_at: Utc::now(),
            }) {
                rejected += 1;
            }
        }
        // one in flight + queue capacity 2: at least three rejections
        assert!(rejected >= 3, "expected rejections, got {}", rejected);
        pool.stop().await;
    }

    #[tokio::test]
    async fn timed_out_probe_is_synthesized_as_down() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/hang");
                then.status(200).delay(Duration::from_secs(5));
            })
            .await;

        let (store, backoff, metrics) = fixture();
        let ctx = ProbeContext::new().unwrap();
        let pool = WorkerPool::start(1, store.clone(), backoff.clone(), metrics);

        let mut m = monitor(MonitorKind::Http, "hang");
        m.url = Some(server.url("/hang"));
        m.timeout = Duration::from_millis(300);
        let executor = Executor::build(Arc::new(m), &ctx).unwrap();
        assert!(pool.submit(Job {
            executor,
            scheduled_at: Utc::now(),
        }));

        let result = wait_for_result(&store, "hang").await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(backoff.consecutive_failures("hang"), 1);
        pool.stop().await;
    }
}
