use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

use drive3270::config::{self, Configuration, InjectionTable};
use drive3270::dashboard::{self, SnapshotSink};
use drive3270::engine::{self, RunContext, RunOptions, RunSummary};
use drive3270::metrics::{self, snapshot::RunInfo};
use drive3270::session::LaunchOptions;
use drive3270::workflow::RunnerPolicy;

/// Directory for per-PID journals and run summaries.
const LOG_DIR: &str = "logs";

/// Drives scripted workflows against IBM 3270 terminal applications,
/// from a single run to ramped multi-user load generation.
#[derive(Parser)]
#[command(name = "drive3270", about, version)]
struct Cli {
    /// Path to the workflow configuration file.
    #[arg(short, long, default_value = "workflow.json")]
    config: PathBuf,

    /// Path to the injection configuration file.
    #[arg(long)]
    injection_config: Option<PathBuf>,

    /// Value substituted for {{token}} placeholders in step text.
    #[arg(long)]
    token: Option<String>,

    /// Number of concurrent workflows (virtual users).
    #[arg(long, default_value_t = 1)]
    concurrent: usize,

    /// Duration to run workflows in seconds; 0 runs the workflow once.
    #[arg(long, default_value_t = 0)]
    runtime: u64,

    /// Run the emulator headless (s3270).
    #[arg(long)]
    headless: bool,

    /// Explicit path to the emulator binary instead of searching PATH.
    #[arg(long)]
    emulator_path: Option<PathBuf>,

    /// Starting port for emulator script connections.
    #[arg(long, default_value_t = 5000)]
    start_port: u16,

    /// Hard timeout per workflow in seconds (0 disables).
    #[arg(long, default_value_t = 0)]
    workflow_timeout: u64,

    /// Treat connection failures as errors and report them.
    #[arg(long)]
    show_connection_errors: bool,

    /// Log workflow failures as they happen, even at low verbosity.
    #[arg(long)]
    verbose_failures: bool,

    /// Render in-place progress bars instead of periodic text rows.
    #[arg(long)]
    progress_bars: bool,

    /// Port for the loopback dashboard data endpoint.
    #[arg(long, default_value_t = 9200)]
    dashboard_port: u16,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("drive3270 {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(false).init();

    let mut cfg = Configuration::load(&cli.config)
        .with_context(|| format!("loading workflow from {}", cli.config.display()))?;

    if let Some(token) = &cli.token {
        cfg.token = Some(token.clone());
    }
    if let Some(input) = cfg.input_file_path.clone() {
        cfg.steps = config::load_input_steps(PathBuf::from(&input).as_path())
            .with_context(|| format!("deriving steps from input script {input}"))?;
        cfg.validate().context("validating derived steps")?;
    }

    let injection = match &cli.injection_config {
        Some(path) if path.exists() => InjectionTable::load(path)
            .with_context(|| format!("loading injection table from {}", path.display()))?,
        Some(path) => {
            warn!(
                path = %path.display(),
                "injection file not found, proceeding without injection",
            );
            InjectionTable::default()
        }
        None => InjectionTable::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli, cfg, injection))
}

async fn run(cli: Cli, cfg: Configuration, injection: InjectionTable) -> Result<()> {
    let concurrent_mode = cli.concurrent > 1 || cli.runtime > 0;
    if concurrent_mode && cli.runtime == 0 {
        bail!("runtime must be greater than zero for concurrent execution");
    }

    let policy = RunnerPolicy {
        show_connection_errors: cli.show_connection_errors,
        verbose_failures: cli.verbose_failures,
        workflow_timeout: (cli.workflow_timeout > 0)
            .then(|| Duration::from_secs(cli.workflow_timeout)),
        api_mode: false,
    };

    let opts = RunOptions {
        concurrency: cli.concurrent,
        runtime: Duration::from_secs(cli.runtime),
        launch: LaunchOptions {
            headless: cli.headless,
            emulator_path: cli.emulator_path.clone(),
        },
        progress_bars: cli.progress_bars,
    };

    let ctx = Arc::new(RunContext::new(policy, cli.start_port, LOG_DIR));

    let config_path = std::fs::canonicalize(&cli.config)
        .unwrap_or_else(|_| cli.config.clone())
        .display()
        .to_string();
    let info = RunInfo::current(
        cli.runtime as i64,
        Some(config_path),
        cfg.output_file_path.clone(),
    );

    // Background plumbing outlives the run itself: the usage sampler, the
    // snapshot writer, and (when the port is free) the data endpoint.
    let background = CancellationToken::new();
    let sampler = metrics::spawn_sampler(Arc::clone(&ctx.metrics), background.clone());

    let sink = Arc::new(SnapshotSink::new(dashboard::default_metrics_dir(), LOG_DIR));
    let writer = dashboard::spawn_writer(
        Arc::clone(&sink),
        Arc::clone(&ctx.metrics),
        info,
        background.clone(),
    );

    if concurrent_mode {
        match dashboard::bind(cli.dashboard_port).await {
            Ok(listener) => {
                sink.clear();
                let serve_sink = Arc::clone(&sink);
                let serve_cancel = background.clone();
                tokio::spawn(async move {
                    if let Err(e) = dashboard::serve_on(listener, serve_sink, serve_cancel).await {
                        warn!(error = %e, "dashboard endpoint stopped");
                    }
                });
            }
            Err(e) => {
                warn!(
                    port = cli.dashboard_port,
                    error = %e,
                    "dashboard endpoint unavailable, another instance may own it",
                );
            }
        }
    }

    let summary = if concurrent_mode {
        engine::run_concurrent(&cfg, &injection, Arc::clone(&ctx), &opts).await?
    } else {
        engine::run_single(&cfg, Arc::clone(&ctx), &opts).await?
    };

    print_summary(&summary);

    // Stop background tasks; the writer flushes one final snapshot on
    // cancellation.
    background.cancel();
    let _ = sampler.await;
    let _ = writer.await;

    ctx.journal.log("run complete");

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    print!("{}", summary.render());
}
