use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(300);
pub const MAX_DOUBLINGS: u32 = 5;
pub const RESET_THRESHOLD: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
struct Entry {
    consecutive_failures: u32,
    last_failure_at: Instant,
}

/// Per-monitor exponential back-off. Prevents hot loops against failing
/// endpoints: each consecutive failure doubles the gate delay up to a cap,
/// a success clears it, and entries untouched past the reset threshold are
/// cleaned lazily. State is process-local and never persisted.
pub struct BackoffTracker {
    entries: Mutex<HashMap<String, Entry>>,
    base_delay: Duration,
    max_delay: Duration,
    reset_threshold: Duration,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        BackoffTracker::new()
    }
}

impl BackoffTracker {
    pub fn new() -> BackoffTracker {
        BackoffTracker::with_params(BASE_DELAY, MAX_DELAY, RESET_THRESHOLD)
    }

    pub fn with_params(
        base_delay: Duration,
        max_delay: Duration,
        reset_threshold: Duration,
    ) -> BackoffTracker {
        BackoffTracker {
            entries: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
            reset_threshold,
        }
    }

    /// Clear all back-off state for a monitor.
    pub fn record_success(&self, monitor: &str) {
        self.entries.lock().unwrap().remove(monitor);
    }

    pub fn record_failure(&self, monitor: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(monitor.to_string()).or_insert(Entry {
            consecutive_failures: 0,
            last_failure_at: Instant::now(),
        });
        entry.consecutive_failures += 1;
        entry.last_failure_at = Instant::now();
    }

    /// `base × 2^(failures−1)` capped at the max delay and at
    /// `MAX_DOUBLINGS` doublings. Zero without failures, or once the last
    /// failure is older than the reset threshold (the stale entry is
    /// dropped on the way out).
    pub fn current_delay(&self, monitor: &str) -> Duration {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(monitor).copied() {
                None => return Duration::ZERO,
                Some(entry) if entry.last_failure_at.elapsed() > self.reset_threshold => {
                    entries.remove(monitor);
                    return Duration::ZERO;
                }
                Some(entry) => entry,
            }
        };
        let exponent = snapshot
            .consecutive_failures
            .saturating_sub(1)
            .min(MAX_DOUBLINGS);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Whether enough time has passed since `last_check_at` for another
    /// attempt.
    pub fn should_check(&self, monitor: &str, last_check_at: Instant) -> bool {
        last_check_at.elapsed() >= self.current_delay(monitor)
    }

    pub fn consecutive_failures(&self, monitor: &str) -> u32 {
        self.entries
            .lock()
            .unwrap()
            .get(monitor)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}
