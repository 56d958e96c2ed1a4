use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Configuration;
use crate::session::EmulatorSession;
use crate::workflow::{run_workflow, RunOutcome};

use super::RunContext;

/// Backoff when the port allocator reports a full sweep.
const PORT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One pool worker: receives configurations until the job channel closes,
/// running each on its own emulator session. Workers never spawn tasks of
/// their own; pool parallelism is exactly the worker count.
pub async fn worker_loop(
    id: usize,
    jobs: flume::Receiver<Arc<Configuration>>,
    ctx: Arc<RunContext>,
    mut session: EmulatorSession,
    deadline: Option<Instant>,
) {
    while let Ok(cfg) = jobs.recv_async().await {
        if ctx.cancel.is_cancelled() {
            debug!(worker = id, "skipping queued workflow, shutdown requested");
            continue;
        }

        let Some(script_port) = allocate_port(id, &ctx).await else {
            continue;
        };
        session.rebind_script_port(script_port);
        session.rebind_host(&cfg.host, cfg.port);
        debug!(worker = id, script_port, "worker picked up workflow");

        let outcome = run_workflow(
            &mut session,
            &cfg,
            &ctx.metrics,
            &ctx.journal,
            &ctx.policy,
            &ctx.cancel,
            deadline,
        )
        .await;

        if outcome == RunOutcome::Failed {
            debug!(worker = id, script_port, "workflow failed");
        }
    }

    session.disconnect().await;
    debug!(worker = id, "worker exiting");
}

/// Ask the allocator for a script port, backing off while the range is
/// exhausted. Gives up when shutdown arrives first.
async fn allocate_port(id: usize, ctx: &RunContext) -> Option<u16> {
    loop {
        match ctx.ports.next() {
            Ok(port) => return Some(port),
            Err(e) => {
                warn!(worker = id, error = %e, "script port allocation failed, backing off");
                tokio::time::sleep(PORT_RETRY_DELAY).await;
                if ctx.cancel.is_cancelled() {
                    return None;
                }
            }
        }
    }
}
