pub mod ports;
pub mod worker;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Configuration, InjectionTable};
use crate::journal::Journal;
use crate::metrics::{Counters, MetricsStore};
use crate::session::{EmulatorSession, LaunchOptions};
use crate::telemetry::{self, TelemetryOptions};
use crate::workflow::{run_workflow, RunnerPolicy};

use self::ports::PortAllocator;

/// How long workers may finish in-flight workflows after the deadline.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Everything a run shares across its tasks. Constructed fresh per run so
/// two runs can coexist in one process (tests do this); there is no
/// global state.
pub struct RunContext {
    pub cancel: CancellationToken,
    pub metrics: Arc<MetricsStore>,
    pub ports: PortAllocator,
    pub policy: RunnerPolicy,
    pub journal: Journal,
}

impl RunContext {
    pub fn new(policy: RunnerPolicy, start_port: u16, log_dir: impl AsRef<Path>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            metrics: Arc::new(MetricsStore::new()),
            ports: PortAllocator::new(start_port),
            policy,
            journal: Journal::new(log_dir.as_ref()),
        }
    }
}

/// Settings for one load-generation run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker (virtual user) count.
    pub concurrency: usize,
    /// Wall-clock run duration.
    pub runtime: Duration,
    /// How emulator subprocesses are launched.
    pub launch: LaunchOptions,
    /// Render live progress bars instead of text rows.
    pub progress_bars: bool,
}

/// End-of-run figures for the summary report.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub counters: Counters,
    pub average_cpu: f64,
    pub average_memory: f64,
    pub average_duration: f64,
    pub elapsed_secs: u64,
    pub worker_count: usize,
}

impl RunSummary {
    fn capture(metrics: &MetricsStore, elapsed: Duration, worker_count: usize) -> Self {
        Self {
            counters: metrics.counters(),
            average_cpu: metrics.average_cpu(),
            average_memory: metrics.average_memory(),
            average_duration: metrics.average_duration(),
            elapsed_secs: elapsed.as_secs(),
            worker_count,
        }
    }

    /// The summary as written to `logs/summary_<PID>.txt`.
    pub fn render(&self) -> String {
        format!(
            concat!(
                "Run Summary - Performance Report\n",
                "Total Workflows Started: {}\n",
                "Total Workflows Completed: {}\n",
                "Total Workflows Failed: {}\n",
                "Final Active vUsers: {}/{}\n",
                "Average CPU Usage: {:.1}%\n",
                "Average Memory Usage: {:.1}%\n",
                "Average Workflow Time: {:.2}s\n",
                "Run Duration: {}s\n",
            ),
            self.counters.started,
            self.counters.completed,
            self.counters.failed,
            self.counters.active,
            self.worker_count,
            self.average_cpu,
            self.average_memory,
            self.average_duration,
            self.elapsed_secs,
        )
    }
}

/// Builds the per-worker emulator session. The default launches managed
/// subprocesses; tests attach to already-running emulators instead.
pub type SessionFactory = dyn Fn(usize) -> EmulatorSession + Send + Sync;

/// Run workflows concurrently until the deadline: start the worker pool,
/// release jobs in ramp batches, then drain and summarize.
pub async fn run_concurrent(
    template: &Configuration,
    injection: &InjectionTable,
    ctx: Arc<RunContext>,
    opts: &RunOptions,
) -> Result<RunSummary> {
    let launch = opts.launch.clone();
    let cancel = ctx.cancel.clone();
    let factory = move |_id: usize| EmulatorSession::new(launch.clone(), cancel.clone());
    run_concurrent_with(template, injection, ctx, opts, &factory).await
}

/// `run_concurrent` with an explicit session factory.
pub async fn run_concurrent_with(
    template: &Configuration,
    injection: &InjectionTable,
    ctx: Arc<RunContext>,
    opts: &RunOptions,
    factory: &SessionFactory,
) -> Result<RunSummary> {
    let worker_count = opts.concurrency.max(1);
    let start = Instant::now();
    let deadline = start + opts.runtime;
    let ramp_delay = template.ramp_delay();

    let (jobs_tx, jobs_rx) = flume::unbounded::<Arc<Configuration>>();

    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        workers.push(tokio::spawn(worker::worker_loop(
            id,
            jobs_rx.clone(),
            Arc::clone(&ctx),
            factory(id),
            Some(deadline),
        )));
    }
    drop(jobs_rx);

    if !injection.is_empty() {
        info!(entries = injection.len(), "loaded injection table");
    }

    let telemetry_task = telemetry::spawn(
        Arc::clone(&ctx.metrics),
        TelemetryOptions {
            progress_bars: opts.progress_bars,
            worker_count,
            runtime_secs: opts.runtime.as_secs(),
        },
        ctx.cancel.clone(),
    );

    // Ramp: release batches of jobs whenever workers are idle, pacing by
    // the configured delay. The target is slots released per ramp delay,
    // not an absolute rate.
    let mut cycle = injection.cycle();
    let mut first_batch = true;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if deadline - now <= ramp_delay {
            let msg = format!(
                "Stopped scheduling new workflows to honor deadline ({:.1}s remaining). \
                 Increase runtime or lower ramp-up to reach target concurrency.",
                (deadline - now).as_secs_f64(),
            );
            info!("{msg}");
            ctx.journal.log(&msg);
            break;
        }

        let available = worker_count as i64 - ctx.metrics.active_workflows();
        if available <= 0 {
            tokio::time::sleep(ramp_delay).await;
            continue;
        }

        let to_start = (template.ramp_up_batch_size as i64).min(available);
        let mut released = 0;
        for _ in 0..to_start {
            if Instant::now() >= deadline {
                break;
            }
            let concrete = template.inject(cycle.next_entry());
            if jobs_tx.send(Arc::new(concrete)).is_err() {
                break;
            }
            released += 1;
        }

        ctx.journal.log(&format!(
            "Scheduled {released} workflows, active: {}, CPU: {:.2}%, MEM: {:.2}%",
            ctx.metrics.active_workflows(),
            ctx.metrics.last_cpu(),
            ctx.metrics.last_memory(),
        ));

        if first_batch {
            first_batch = false;
        } else {
            tokio::time::sleep(ramp_delay).await;
        }
    }

    // Drain: stop producing, signal shutdown, and give in-flight work a
    // bounded grace to finish.
    info!("run duration complete, waiting for in-flight workflows");
    ctx.cancel.cancel();
    drop(jobs_tx);

    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        for handle in workers {
            let _ = handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            grace_secs = DRAIN_GRACE.as_secs(),
            "grace period elapsed while waiting for workers, abandoning them",
        );
        ctx.journal
            .log("Grace period elapsed while waiting for workers; forcing shutdown.");
    }
    let _ = telemetry_task.await;

    ctx.journal
        .log("All workflows completed after run duration ended.");

    let summary = RunSummary::capture(&ctx.metrics, start.elapsed(), worker_count);
    ctx.journal.write_summary(&summary.render());
    report_errors(&ctx.metrics);

    Ok(summary)
}

/// Run the workflow once on a single session and summarize.
pub async fn run_single(
    config: &Configuration,
    ctx: Arc<RunContext>,
    opts: &RunOptions,
) -> Result<RunSummary> {
    let start = Instant::now();

    let script_port = ctx.ports.next()?;
    let mut session = EmulatorSession::new(opts.launch.clone(), ctx.cancel.clone());
    session.rebind_script_port(script_port);
    session.rebind_host(&config.host, config.port);

    run_workflow(
        &mut session,
        config,
        &ctx.metrics,
        &ctx.journal,
        &ctx.policy,
        &ctx.cancel,
        None,
    )
    .await;

    let summary = RunSummary::capture(&ctx.metrics, start.elapsed(), 1);
    ctx.journal.write_summary(&summary.render());
    report_errors(&ctx.metrics);

    Ok(summary)
}

/// Log the error histogram for the run, grouped by message.
pub fn report_errors(metrics: &MetricsStore) {
    let histogram = metrics.error_histogram();
    if histogram.is_empty() {
        info!("no errors encountered during the workflows");
        return;
    }

    for (message, count) in histogram {
        warn!(count, "workflow error: {message}");
    }
}
