pub mod ring;
pub mod snapshot;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::ring::Ring;

/// Capacity of the workflow duration window.
pub const DURATION_WINDOW: usize = 500;

/// Capacity of the CPU and memory sample windows.
pub const USAGE_WINDOW: usize = 120;

/// How often the system usage sampler ticks.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// A sliding sample window plus running totals for an exact mean.
#[derive(Debug)]
struct Window {
    ring: Ring,
    sum: f64,
    count: u64,
    last: f64,
}

impl Window {
    fn new(cap: usize) -> Self {
        Self {
            ring: Ring::new(cap),
            sum: 0.0,
            count: 0,
            last: 0.0,
        }
    }

    fn record(&mut self, value: f64) {
        self.ring.push(value);
        self.sum += value;
        self.count += 1;
        self.last = value;
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time view of the run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub started: i64,
    pub completed: i64,
    pub failed: i64,
    pub active: i64,
    pub connect_failures: i64,
    pub shutdown_aborted: i64,
}

/// Shared run metrics: hot counters on atomics, sample windows behind a
/// mutex. One store per run, owned by the run context and shared with the
/// sampler, dashboard writer, and telemetry tasks.
#[derive(Debug)]
pub struct MetricsStore {
    started: AtomicI64,
    completed: AtomicI64,
    failed: AtomicI64,
    active: AtomicI64,
    connect_failures: AtomicI64,
    shutdown_aborted: AtomicI64,

    durations: parking_lot::Mutex<Window>,
    cpu: parking_lot::Mutex<Window>,
    memory: parking_lot::Mutex<Window>,

    errors: parking_lot::Mutex<Vec<String>>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            started: AtomicI64::new(0),
            completed: AtomicI64::new(0),
            failed: AtomicI64::new(0),
            active: AtomicI64::new(0),
            connect_failures: AtomicI64::new(0),
            shutdown_aborted: AtomicI64::new(0),
            durations: parking_lot::Mutex::new(Window::new(DURATION_WINDOW)),
            cpu: parking_lot::Mutex::new(Window::new(USAGE_WINDOW)),
            memory: parking_lot::Mutex::new(Window::new(USAGE_WINDOW)),
            errors: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn workflow_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_aborted_by_shutdown(&self) {
        self.shutdown_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_finished(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_workflows(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> Counters {
        Counters {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            shutdown_aborted: self.shutdown_aborted.load(Ordering::Relaxed),
        }
    }

    pub fn record_duration(&self, seconds: f64) {
        self.durations.lock().record(seconds);
    }

    pub fn record_cpu(&self, percent: f64) {
        self.cpu.lock().record(percent);
    }

    pub fn record_memory(&self, percent: f64) {
        self.memory.lock().record(percent);
    }

    pub fn average_duration(&self) -> f64 {
        self.durations.lock().average()
    }

    pub fn average_cpu(&self) -> f64 {
        self.cpu.lock().average()
    }

    pub fn average_memory(&self) -> f64 {
        self.memory.lock().average()
    }

    pub fn last_cpu(&self) -> f64 {
        self.cpu.lock().last
    }

    pub fn last_memory(&self) -> f64 {
        self.memory.lock().last
    }

    pub fn duration_samples(&self) -> Vec<f64> {
        self.durations.lock().ring.snapshot()
    }

    pub fn cpu_samples(&self) -> Vec<f64> {
        self.cpu.lock().ring.snapshot()
    }

    pub fn memory_samples(&self) -> Vec<f64> {
        self.memory.lock().ring.snapshot()
    }

    pub fn record_error(&self, message: String) {
        self.errors.lock().push(message);
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    /// Errors grouped by message with occurrence counts, most frequent
    /// first.
    pub fn error_histogram(&self) -> Vec<(String, usize)> {
        let errors = self.errors.lock();
        let mut grouped: Vec<(String, usize)> = Vec::new();
        for message in errors.iter() {
            match grouped.iter_mut().find(|(m, _)| m == message) {
                Some((_, count)) => *count += 1,
                None => grouped.push((message.clone(), 1)),
            }
        }
        grouped.sort_by(|a, b| b.1.cmp(&a.1));
        grouped
    }
}

/// Spawn the background system usage sampler: every two seconds read the
/// aggregate CPU percent and used-memory percent and append them to the
/// store's windows. Runs until the token is cancelled.
pub fn spawn_sampler(
    store: std::sync::Arc<MetricsStore>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sys = System::new();
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("usage sampler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    sys.refresh_cpu_usage();
                    sys.refresh_memory();

                    let cpu = f64::from(sys.global_cpu_usage());
                    store.record_cpu(cpu);

                    let total = sys.total_memory();
                    if total > 0 {
                        let mem = sys.used_memory() as f64 / total as f64 * 100.0;
                        store.record_memory(mem);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accounting() {
        let store = MetricsStore::new();

        // Two completions, one failure, one still active.
        for _ in 0..4 {
            store.workflow_started();
        }
        store.workflow_completed();
        store.workflow_finished();
        store.workflow_completed();
        store.workflow_finished();
        store.workflow_failed();
        store.workflow_finished();

        let c = store.counters();
        assert_eq!(c.started, 4);
        assert_eq!(c.completed, 2);
        assert_eq!(c.failed, 1);
        assert_eq!(c.active, 1);
        assert_eq!(
            c.started,
            c.completed + c.failed + c.active + c.connect_failures + c.shutdown_aborted,
        );
    }

    #[test]
    fn test_connect_failure_accounting() {
        let store = MetricsStore::new();
        store.workflow_started();
        store.workflow_connect_failed();
        store.workflow_finished();

        let c = store.counters();
        assert_eq!(c.completed, 0);
        assert_eq!(c.failed, 0);
        assert_eq!(c.connect_failures, 1);
        assert_eq!(
            c.started,
            c.completed + c.failed + c.active + c.connect_failures + c.shutdown_aborted,
        );
    }

    #[test]
    fn test_duration_window_cap_and_mean() {
        let store = MetricsStore::new();
        for _ in 0..600 {
            store.record_duration(2.0);
        }
        assert_eq!(store.duration_samples().len(), DURATION_WINDOW);
        // The mean uses the running totals, not just the window.
        assert!((store.average_duration() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_usage_window_cap() {
        let store = MetricsStore::new();
        for i in 0..150 {
            store.record_cpu(f64::from(i));
            store.record_memory(f64::from(i));
        }
        assert_eq!(store.cpu_samples().len(), USAGE_WINDOW);
        assert_eq!(store.memory_samples().len(), USAGE_WINDOW);
        assert_eq!(store.last_cpu(), 149.0);
        assert_eq!(store.last_memory(), 149.0);
    }

    #[test]
    fn test_error_histogram_groups_and_sorts() {
        let store = MetricsStore::new();
        store.record_error("timeout".to_string());
        store.record_error("bad field".to_string());
        store.record_error("timeout".to_string());

        let histogram = store.error_histogram();
        assert_eq!(histogram.len(), 2);
        assert_eq!(histogram[0], ("timeout".to_string(), 2));
        assert_eq!(histogram[1], ("bad field".to_string(), 1));
    }
}
