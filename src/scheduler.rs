use crate::backoff::BackoffTracker;
use crate::executors::{Executor, ProbeContext};
use crate::manager::MonitorManager;
use crate::pool::{Job, WorkerPool};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_secs(1);

/// Spread initial executions over this window so a restarted fleet does not
/// fire every monitor at once.
const STARTUP_JITTER: Duration = Duration::from_secs(5);

/// Clock-driven probe dispatcher. A one-second ticker walks the monitor
/// set; each enabled monitor whose due time has passed (and whose back-off
/// gate allows) is submitted to the worker pool. The timetable advances
/// only on successful submission, which both guarantees forward progress
/// when the queue is full and keeps probes single-flight per monitor.
pub struct Scheduler {
    manager: Arc<MonitorManager>,
    pool: Arc<WorkerPool>,
    backoff: Arc<BackoffTracker>,
    ctx: Arc<ProbeContext>,
}

impl Scheduler {
    pub fn new(
        manager: Arc<MonitorManager>,
        pool: Arc<WorkerPool>,
        backoff: Arc<BackoffTracker>,
        ctx: Arc<ProbeContext>,
    ) -> Scheduler {
        Scheduler {
            manager,
            pool,
            backoff,
            ctx,
        }
    }

    /// Tick until the shutdown signal flips, then drain the worker pool.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TICK);
        let mut next_execution: HashMap<String, Instant> = HashMap::new();
        let mut last_submitted: HashMap<String, Instant> = HashMap::new();
        info!("scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.tick(&mut next_execution, &mut last_submitted);
        }

        info!("scheduler stopping, draining worker pool");
        self.pool.stop().await;
    }

    fn tick(
        &self,
        next_execution: &mut HashMap<String, Instant>,
        last_submitted: &mut HashMap<String, Instant>,
    ) {
        let set = self.manager.current();
        // drop timetable entries for monitors removed by a reload; new ones
        // are seeded with jitter below
        next_execution.retain(|name, _| set.contains(name));
        last_submitted.retain(|name, _| set.contains(name));

        let now = Instant::now();
        let mut rng = rand::thread_rng();

        for monitor in set.iter().filter(|m| m.enabled) {
            let due = *next_execution
                .entry(monitor.name.clone())
                .or_insert_with(|| now + rng.gen_range(Duration::ZERO..STARTUP_JITTER));
            if now < due {
                continue;
            }

            if let Some(last) = last_submitted.get(&monitor.name) {
                if !self.backoff.should_check(&monitor.name, *last) {
                    debug!(monitor = %monitor.name, "back-off gate holding");
                    continue;
                }
            }

            let executor = match Executor::build(monitor.clone(), &self.ctx) {
                Ok(executor) => executor,
                Err(err) => {
                    warn!(monitor = %monitor.name, error = %err, "cannot build executor, skipping interval");
                    next_execution.insert(monitor.name.clone(), now + monitor.interval);
                    continue;
                }
            };

            let job = Job {
                executor,
                scheduled_at: Utc::now(),
            };
            if self.pool.submit(job) {
                // advancing only on submission keeps at most one probe per
                // monitor in flight
                next_execution.insert(
                    monitor.name.clone(),
                    now + jittered_interval(monitor.interval, &mut rng),
                );
                last_submitted.insert(monitor.name.clone(), now);
            } else {
                debug!(monitor = %monitor.name, "worker queue full, retrying next tick");
            }
        }
    }
}

/// The configured interval ±10%, so a fleet with identical intervals
/// desynchronizes over time.
fn jittered_interval(interval: Duration, rng: &mut impl Rng) -> Duration {
    let jitter_span = interval.as_secs_f64() * 0.1;
    let offset = rng.gen_range(-jitter_span..=jitter_span);
    Duration::from_secs_f64((interval.as_secs_f64() + offset).max(0.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::monitor;
    use crate::manager::MonitorSet;
    use crate::metrics::Metrics;
    use crate::models::{MonitorKind, ProbeStatus};
    use crate::store::{NoopStore, ResultStore};
    use prometheus::{IntCounter, Registry};
    use tokio::net::TcpListener;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut rng = rand::thread_rng();
        let interval = Duration::from_secs(30);
        for _ in 0..1000 {
            let jittered = jittered_interval(interval, &mut rng);
            assert!(jittered >= Duration::from_secs(27));
            assert!(jittered <= Duration::from_secs(33));
        }
    }

    #[tokio::test]
    async fn scheduler_probes_and_keeps_single_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut m = monitor(MonitorKind::Tcp, "local");
        m.target = Some(format!("127.0.0.1:{}", port));
        m.interval = Duration::from_secs(1);

        let manager = Arc::new(MonitorManager::new(MonitorSet::new(vec![m])));
        let store = ResultStore::new(
            Arc::new(NoopStore::new()),
            IntCounter::new("dropped", "dropped").unwrap(),
        );
        let backoff = Arc::new(BackoffTracker::new());
        let metrics = Arc::new(Metrics::new(Registry::new()).unwrap());
        let pool = WorkerPool::start(2, store.clone(), backoff.clone(), metrics);
        let ctx = Arc::new(ProbeContext::new().unwrap());

        let scheduler = Scheduler::new(manager.clone(), pool.clone(), backoff, ctx);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(stop_rx));

        // startup jitter is up to 5s, then one probe per ~1s interval
        tokio::time::sleep(Duration::from_millis(6500)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let processed = pool.processed_jobs();
        assert!(processed >= 1, "expected at least one probe");
        // interval 1s over ~6.5s: overlapping probes would exceed this
        assert!(processed <= 7, "probes overlapped: {}", processed);
        let latest = store.latest_in_memory("local").unwrap();
        assert_eq!(latest.status, ProbeStatus::Up);
    }

    #[tokio::test]
    async fn disabled_and_removed_monitors_are_not_scheduled() {
        let mut disabled = monitor(MonitorKind::Tcp, "off");
        disabled.target = Some("127.0.0.1:1".into());
        disabled.enabled = false;

        let manager = Arc::new(MonitorManager::new(MonitorSet::new(vec![disabled])));
        let store = ResultStore::new(
            Arc::new(NoopStore::new()),
            IntCounter::new("dropped", "dropped").unwrap(),
        );
        let backoff = Arc::new(BackoffTracker::new());
        let metrics = Arc::new(Metrics::new(Registry::new()).unwrap());
        let pool = WorkerPool::start(1, store.clone(), backoff.clone(), metrics);
        let ctx = Arc::new(ProbeContext::new().unwrap());

        let scheduler = Scheduler::new(manager.clone(), pool.clone(), backoff, ctx);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // reload to an empty set while running
        manager.replace(MonitorSet::empty());
        tokio::time::sleep(Duration::from_millis(500)).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(pool.processed_jobs(), 0);
    }
}
