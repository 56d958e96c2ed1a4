use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::{Counters, MetricsStore};

/// Tick cadence for the progress-bar renderer.
const BAR_INTERVAL: Duration = Duration::from_secs(1);

/// Tick cadence for the text-row renderer.
const TEXT_INTERVAL: Duration = Duration::from_secs(5);

/// Display settings for the live run telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// In-place progress bars instead of periodic text rows.
    pub progress_bars: bool,
    pub worker_count: usize,
    pub runtime_secs: u64,
}

/// Spawn the live telemetry ticker. It stops when the run token is
/// cancelled, which is the moment the scheduler enters its drain phase.
pub fn spawn(
    store: Arc<MetricsStore>,
    opts: TelemetryOptions,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if opts.progress_bars {
            run_bars(store, opts, cancel).await;
        } else {
            info!("live stats update every 5s (enable progress bars for gauges)");
            run_text(store, opts, cancel).await;
        }
    })
}

async fn run_bars(store: Arc<MetricsStore>, opts: TelemetryOptions, cancel: CancellationToken) {
    let start = Instant::now();
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:<30} [{bar:40.cyan}] {percent:>3}%")
        .expect("static template")
        .progress_chars("=>-");

    let duration_bar = multi.add(ProgressBar::new(opts.runtime_secs.max(1)));
    let active_bar = multi.add(ProgressBar::new(opts.worker_count.max(1) as u64));
    let cpu_bar = multi.add(ProgressBar::new(100));
    let mem_bar = multi.add(ProgressBar::new(100));

    for bar in [&duration_bar, &active_bar, &cpu_bar, &mem_bar] {
        bar.set_style(style.clone());
    }
    duration_bar.set_prefix("Run Duration");
    active_bar.set_prefix("Active vUsers");
    cpu_bar.set_prefix("CPU Usage");
    mem_bar.set_prefix("Memory Usage");

    let mut ticker = tokio::time::interval(BAR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let elapsed = start.elapsed().as_secs();
                duration_bar.set_prefix(format!("Run Duration ({elapsed}s elapsed)"));
                for bar in [&duration_bar, &active_bar, &cpu_bar, &mem_bar] {
                    bar.finish();
                }
                return;
            }
            _ = ticker.tick() => {
                let elapsed = start.elapsed().as_secs();
                let remaining = opts.runtime_secs.saturating_sub(elapsed);
                let active = store.active_workflows().max(0) as u64;

                duration_bar.set_position(elapsed.min(opts.runtime_secs));
                if remaining > 0 {
                    duration_bar.set_prefix(format!("Run Duration ({remaining}s left)"));
                } else {
                    duration_bar.set_prefix("Run Duration (completed)");
                }

                active_bar.set_position(active.min(opts.worker_count as u64));
                active_bar.set_prefix(format!(
                    "Active vUsers ({active}/{})",
                    opts.worker_count,
                ));

                cpu_bar.set_position(store.last_cpu().clamp(0.0, 100.0) as u64);
                mem_bar.set_position(store.last_memory().clamp(0.0, 100.0) as u64);
            }
        }
    }
}

async fn run_text(store: Arc<MetricsStore>, opts: TelemetryOptions, cancel: CancellationToken) {
    let start = Instant::now();
    let mut ticker = tokio::time::interval(TEXT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_failed = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let counters = store.counters();
                let row = format_stats_row(
                    &Local::now().format("%H:%M:%S").to_string(),
                    start.elapsed().as_secs(),
                    opts.runtime_secs,
                    opts.worker_count,
                    counters,
                    store.last_cpu(),
                    store.last_memory(),
                );

                if counters.failed > last_failed {
                    warn!("{row}");
                    last_failed = counters.failed;
                } else {
                    info!("{row}");
                }
            }
        }
    }
}

/// One live-stats row: active/started/done/failed counts plus elapsed,
/// remaining, and system usage.
fn format_stats_row(
    clock: &str,
    elapsed: u64,
    runtime_secs: u64,
    worker_count: usize,
    counters: Counters,
    cpu: f64,
    memory: f64,
) -> String {
    let remaining = runtime_secs.saturating_sub(elapsed);
    format!(
        "{clock} | A:{}/{worker_count} | S:{} | D:{} | F:{} | E:{elapsed}s | R:{remaining}s | C:{cpu:.1}% | M:{memory:.1}%",
        counters.active, counters.started, counters.completed, counters.failed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_stats_row() {
        let counters = Counters {
            started: 12,
            completed: 9,
            failed: 1,
            active: 2,
            connect_failures: 0,
            shutdown_aborted: 0,
        };
        let row = format_stats_row("10:20:30", 25, 60, 4, counters, 37.25, 61.5);
        assert_eq!(
            row,
            "10:20:30 | A:2/4 | S:12 | D:9 | F:1 | E:25s | R:35s | C:37.2% | M:61.5%",
        );
    }

    #[test]
    fn test_format_stats_row_remaining_never_negative() {
        let row = format_stats_row("00:00:00", 90, 60, 1, Counters::default(), 0.0, 0.0);
        assert!(row.contains("R:0s"), "row: {row}");
    }

    #[tokio::test]
    async fn test_spawn_stops_on_cancel() {
        let store = Arc::new(MetricsStore::new());
        let cancel = CancellationToken::new();
        let handle = spawn(
            store,
            TelemetryOptions {
                progress_bars: false,
                worker_count: 1,
                runtime_secs: 60,
            },
            cancel.clone(),
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("telemetry task exits promptly")
            .expect("task joins");
    }
}
