pub mod steps;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{Configuration, StepKind};
use crate::journal::Journal;
use crate::metrics::MetricsStore;
use crate::session::{EmulatorSession, SessionError};

use self::steps::{execute_step, StepContext};

/// A step failure inside one workflow.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("CheckValue failed. Expected: {expected}, Found: {found}")]
    CheckMismatch { expected: String, found: String },

    #[error("HumanDelay requires a positive Delay value")]
    HumanDelayWithoutDelay,

    #[error("workflow timed out after {0}s")]
    WorkflowTimeout(u64),
}

impl StepError {
    /// Whether this is the distinguished shutdown outcome.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Session(e) if e.is_shutdown())
    }
}

/// Failure-handling policy for the runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerPolicy {
    /// Count connect failures as reportable errors.
    pub show_connection_errors: bool,
    /// Log every step failure immediately, even outside verbose mode.
    pub verbose_failures: bool,
    /// Hard per-workflow deadline; `None` disables it.
    pub workflow_timeout: Option<Duration>,
    /// Plain-text captures instead of HTML.
    pub api_mode: bool,
}

/// How one workflow ended. Counters are already updated when the runner
/// returns; the outcome is informational for the worker and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    /// The `Connect` step failed; not a workflow failure unless the
    /// connection-errors policy says so.
    ConnectFailed,
    /// Shutdown or the run deadline stopped the workflow; counters for
    /// completion and failure stay untouched.
    Shutdown,
    /// Shutdown was already requested before the workflow started;
    /// nothing was counted.
    NotStarted,
}

/// Run one workflow against one session, recording counters and timings.
///
/// Errors never propagate out of the runner: they are folded into the
/// metrics store and the returned outcome.
pub async fn run_workflow(
    session: &mut EmulatorSession,
    config: &Configuration,
    metrics: &MetricsStore,
    journal: &Journal,
    policy: &RunnerPolicy,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> RunOutcome {
    // Both checks happen before anything is counted.
    if cancel.is_cancelled() {
        return RunOutcome::NotStarted;
    }
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return RunOutcome::NotStarted;
    }

    let script_port = session.script_port().to_string();
    let start = Instant::now();
    let workflow_deadline = policy.workflow_timeout.map(|t| start + t);

    metrics.workflow_started();
    debug!(%script_port, "starting workflow");
    journal.log(&format!("Starting workflow for scriptPort {script_port}"));

    // Start from a clean session so pooled reruns cannot see stale state.
    session.disconnect().await;

    // Captured screens go to the configured path, or to a throwaway file
    // that lives for the duration of the workflow.
    let mut temp_output = None;
    let output_path: PathBuf = match &config.output_file_path {
        Some(path) => PathBuf::from(path),
        None => match tempfile::NamedTempFile::new() {
            Ok(file) => {
                let path = file.path().to_path_buf();
                temp_output = Some(file);
                path
            }
            Err(e) => {
                warn!(error = %e, "could not create workflow output file");
                PathBuf::from("workflow-output.tmp")
            }
        },
    };

    let ctx = StepContext {
        output_path: &output_path,
        token: config.token.as_deref(),
        api_mode: policy.api_mode,
    };

    if let Err(e) = session.initialize_output(&output_path, policy.api_mode).await {
        warn!(error = %e, path = %output_path.display(), "output initialization failed");
    }

    let mut failed = false;
    let mut connect_failed = false;
    let mut aborted = false;

    let step_delay = config.step_delay();
    for (idx, step) in config.steps.iter().enumerate() {
        if cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
            aborted = true;
            break;
        }
        if workflow_deadline.is_some_and(|d| Instant::now() >= d) {
            failed = true;
            metrics.record_error(
                StepError::WorkflowTimeout(start.elapsed().as_secs()).to_string(),
            );
            break;
        }
        if idx > 0 {
            if let Some(delay) = step_delay {
                tokio::time::sleep(delay).await;
            }
        }

        let mut result = execute_step(session, step, &ctx).await;

        // A fresh connection is only useful once the screen takes input.
        if result.is_ok() && step.kind == StepKind::Connect && config.wait_for_field {
            result = session
                .wait_for_field(Duration::from_secs(1))
                .await
                .map_err(StepError::from);
        }

        let Err(err) = result else {
            continue;
        };

        if err.is_shutdown() {
            aborted = true;
            break;
        }

        if step.kind == StepKind::Connect {
            connect_failed = true;
            if policy.show_connection_errors {
                metrics.record_error(err.to_string());
            }
            break;
        }

        failed = true;
        metrics.record_error(err.to_string());
        if policy.verbose_failures {
            let msg = format!(
                "Workflow failure on scriptPort {script_port} at step {} ({}): {err}",
                idx + 1,
                step.kind,
            );
            error!("{msg}");
            journal.log(&msg);
        }
        break;
    }

    metrics.record_duration(start.elapsed().as_secs_f64());

    let outcome = if failed {
        metrics.workflow_failed();
        RunOutcome::Failed
    } else if connect_failed {
        metrics.workflow_connect_failed();
        if policy.show_connection_errors {
            journal.log(&format!(
                "Workflow for scriptPort {script_port} failed to connect; not counted as workflow failure",
            ));
        }
        RunOutcome::ConnectFailed
    } else if aborted {
        metrics.workflow_aborted_by_shutdown();
        RunOutcome::Shutdown
    } else {
        debug!(%script_port, "workflow completed");
        metrics.workflow_completed();
        RunOutcome::Completed
    };

    metrics.workflow_finished();
    session.disconnect().await;
    drop(temp_output);

    outcome
}
