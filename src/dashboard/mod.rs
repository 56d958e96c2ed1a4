use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::journal::Journal;
use crate::metrics::snapshot::{
    aggregate, process_is_running, ExtendedSnapshot, LivenessProbe, RunInfo, RunStatus, Snapshot,
};
use crate::metrics::MetricsStore;

/// How often the snapshot file is rewritten.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

/// Killed entries older than this are garbage-collected by readers.
const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// The shared snapshot directory: one `metrics_<PID>.json` per process.
/// The directory name predates this implementation and is kept so
/// existing dashboard consumers keep working.
pub fn default_metrics_dir() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join("3270Connect").join("dashboard"),
        None => PathBuf::from(".").join("dashboard"),
    }
}

/// Reads and writes per-PID snapshots in a shared directory. The
/// liveness probe is injected so readers can be tested without real
/// processes.
pub struct SnapshotSink {
    dir: PathBuf,
    log_dir: PathBuf,
    probe: LivenessProbe,
}

impl SnapshotSink {
    pub fn new(dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            log_dir: log_dir.into(),
            probe: process_is_running,
        }
    }

    pub fn with_probe(mut self, probe: LivenessProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("metrics_{pid}.json"))
    }

    /// Overwrite this process's snapshot file with the current state.
    pub fn write(&self, store: &MetricsStore, info: &RunInfo) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating snapshot directory {}", self.dir.display()))?;

        let extended = Snapshot::capture(store, info).extend(self.probe, SystemTime::now());
        let data = serde_json::to_vec(&extended).context("encoding metrics snapshot")?;

        let path = self.snapshot_path(info.pid);
        std::fs::write(&path, data)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        Ok(())
    }

    /// Read every parseable snapshot in the directory, deriving status on
    /// the fly and garbage-collecting long-dead entries. Unparseable
    /// files are skipped: another process may be mid-write.
    pub fn read_all(&self) -> Vec<ExtendedSnapshot> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let now = SystemTime::now();
        let mut snapshots = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("metrics_") || !name.ends_with(".json") {
                continue;
            }

            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Ok(snapshot) = serde_json::from_slice::<Snapshot>(&data) else {
                debug!(path = %path.display(), "skipping unparseable snapshot");
                continue;
            };

            let extended = snapshot.extend(self.probe, now);
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            if should_collect(&extended, modified, now) {
                self.collect(&extended, &path);
                continue;
            }

            snapshots.push(extended);
        }

        snapshots
    }

    fn collect(&self, ext: &ExtendedSnapshot, path: &Path) {
        debug!(pid = ext.snapshot.pid, "collecting stale snapshot");
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "could not remove stale snapshot");
            }
        }
        let journal_path = Journal::log_path_for(&self.log_dir, ext.snapshot.pid);
        if let Err(e) = std::fs::remove_file(&journal_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %journal_path.display(), error = %e, "could not remove stale journal");
            }
        }
    }

    /// Delete leftover snapshots and journals from previous runs.
    pub fn clear(&self) {
        for (dir, prefix) in [(&self.dir, "metrics_"), (&self.log_dir, "logs_")] {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_target = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".json"));
                if is_target {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
}

/// Only long-dead killed entries are collected, so live aggregates never
/// disappear from under a running dashboard.
fn should_collect(
    ext: &ExtendedSnapshot,
    modified: Option<SystemTime>,
    now: SystemTime,
) -> bool {
    if ext.is_running || ext.status != RunStatus::Killed {
        return false;
    }
    let Some(modified) = modified else {
        return false;
    };
    now.duration_since(modified)
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false)
}

/// Spawn the background task that rewrites this process's snapshot every
/// two seconds until cancelled, then writes one final snapshot.
pub fn spawn_writer(
    sink: Arc<SnapshotSink>,
    store: Arc<MetricsStore>,
    info: RunInfo,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = sink.write(&store, &info) {
                        warn!(error = %e, "final snapshot write failed");
                    }
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = sink.write(&store, &info) {
                        warn!(error = %e, "snapshot write failed");
                    }
                }
            }
        }
    })
}

#[derive(Serialize)]
struct DashboardData {
    aggregated: Snapshot,
    processes: Vec<ExtendedSnapshot>,
    timestamp: i64,
}

async fn data_handler(State(sink): State<Arc<SnapshotSink>>) -> Json<DashboardData> {
    let all = sink.read_all();

    // Prefer live processes; fall back to the latest snapshots when
    // nothing is running.
    let running: Vec<ExtendedSnapshot> = all.iter().filter(|m| m.is_running).cloned().collect();
    let processes = if running.is_empty() { all } else { running };

    Json(DashboardData {
        aggregated: aggregate(&processes),
        processes,
        timestamp: chrono::Utc::now().timestamp(),
    })
}

/// Bind the loopback dashboard endpoint. A bind failure means another
/// instance already serves this port; callers log and continue without
/// it.
pub async fn bind(port: u16) -> Result<tokio::net::TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding dashboard endpoint on {addr}"))
}

/// Serve the dashboard data endpoint on a bound listener until cancelled.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    sink: Arc<SnapshotSink>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/dashboard/data", get(data_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(sink);

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "dashboard data endpoint listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serving dashboard endpoint")?;

    Ok(())
}

/// Bind and serve in one step.
pub async fn serve(port: u16, sink: Arc<SnapshotSink>, cancel: CancellationToken) -> Result<()> {
    let listener = bind(port).await?;
    serve_on(listener, sink, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alive(_pid: u32) -> bool {
        true
    }

    fn dead(_pid: u32) -> bool {
        false
    }

    fn test_info(pid: u32) -> RunInfo {
        RunInfo {
            pid,
            params: "-concurrent 2".to_string(),
            runtime_duration: 60,
            start_timestamp: chrono::Utc::now().timestamp(),
            config_file_path: None,
            output_file_path: None,
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = SnapshotSink::new(dir.path().join("dash"), dir.path().join("logs"))
            .with_probe(alive);

        let store = MetricsStore::new();
        store.workflow_started();
        store.workflow_completed();
        store.workflow_finished();
        store.record_duration(1.25);

        sink.write(&store, &test_info(1234)).expect("write");

        let all = sink.read_all();
        assert_eq!(all.len(), 1);
        let m = &all[0].snapshot;
        assert_eq!(m.pid, 1234);
        assert_eq!(m.total_workflows_started, 1);
        assert_eq!(m.total_workflows_completed, 1);
        assert_eq!(m.durations, [1.25]);
        assert_eq!(all[0].status, RunStatus::Running);
    }

    #[test]
    fn test_read_skips_unparseable_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dash = dir.path().join("dash");
        std::fs::create_dir_all(&dash).expect("mkdir");
        std::fs::write(dash.join("metrics_99.json"), b"{not json").expect("write junk");
        std::fs::write(dash.join("unrelated.txt"), b"ignored").expect("write other");

        let sink = SnapshotSink::new(&dash, dir.path().join("logs")).with_probe(alive);
        assert!(sink.read_all().is_empty());
        // The junk file is left alone for its writer to finish.
        assert!(dash.join("metrics_99.json").exists());
    }

    #[test]
    fn test_should_collect_only_stale_killed() {
        let now = SystemTime::now();
        let old = now - Duration::from_secs(11 * 60);
        let fresh = now - Duration::from_secs(60);

        let killed = Snapshot {
            pid: 1,
            total_workflows_started: 3,
            active_workflows: 1,
            runtime_duration: 0,
            start_timestamp: 0,
            ..Default::default()
        }
        .extend(dead, now);
        assert_eq!(killed.status, RunStatus::Killed);

        assert!(should_collect(&killed, Some(old), now));
        assert!(!should_collect(&killed, Some(fresh), now), "too fresh");
        assert!(!should_collect(&killed, None, now), "no mtime");

        let running = Snapshot {
            pid: 2,
            runtime_duration: 600,
            start_timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
        .extend(alive, now);
        assert!(!should_collect(&running, Some(old), now));
    }

    #[test]
    fn test_clear_removes_previous_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dash = dir.path().join("dash");
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&dash).expect("mkdir dash");
        std::fs::create_dir_all(&logs).expect("mkdir logs");
        std::fs::write(dash.join("metrics_1.json"), b"{}").expect("write");
        std::fs::write(logs.join("logs_1.json"), b"{}").expect("write");
        std::fs::write(logs.join("summary_1.txt"), b"keep").expect("write");

        let sink = SnapshotSink::new(&dash, &logs);
        sink.clear();

        assert!(!dash.join("metrics_1.json").exists());
        assert!(!logs.join("logs_1.json").exists());
        assert!(logs.join("summary_1.txt").exists(), "summaries survive");
    }

    #[tokio::test]
    async fn test_data_endpoint_serves_aggregate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = Arc::new(
            SnapshotSink::new(dir.path().join("dash"), dir.path().join("logs"))
                .with_probe(alive),
        );

        let store = MetricsStore::new();
        store.workflow_started();
        store.workflow_completed();
        store.workflow_finished();
        sink.write(&store, &test_info(7)).expect("write");

        // Bind an ephemeral port by asking for port 0 through the server.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(port, Arc::clone(&sink), cancel.clone()));

        // Poll until the endpoint answers.
        let url = format!("127.0.0.1:{port}");
        let mut body = String::new();
        for _ in 0..50 {
            match tokio::net::TcpStream::connect(&url).await {
                Ok(mut stream) => {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    stream
                        .write_all(
                            b"GET /dashboard/data HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
                        )
                        .await
                        .expect("request");
                    stream.read_to_string(&mut body).await.expect("response");
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }

        assert!(body.contains("\"totalWorkflowsStarted\":1"), "body: {body}");
        assert!(body.contains("\"processes\""));

        cancel.cancel();
        let _ = server.await;
    }
}
