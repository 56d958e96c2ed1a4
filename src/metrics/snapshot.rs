use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::MetricsStore;

/// Derived run state of a snapshot's owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Ended,
    Killed,
}

/// Probe deciding whether a PID is alive. Injected so readers can be
/// tested without real processes.
pub type LivenessProbe = fn(u32) -> bool;

/// Identity of the current run, serialized alongside the counters.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    pub pid: u32,
    pub params: String,
    pub runtime_duration: i64,
    pub start_timestamp: i64,
    pub config_file_path: Option<String>,
    pub output_file_path: Option<String>,
}

impl RunInfo {
    /// Build run info for this process from the command line and run
    /// settings.
    pub fn current(
        runtime_duration: i64,
        config_file_path: Option<String>,
        output_file_path: Option<String>,
    ) -> Self {
        let params = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
        Self {
            pid: std::process::id(),
            params,
            runtime_duration,
            start_timestamp: epoch_seconds(SystemTime::now()),
            config_file_path,
            output_file_path,
        }
    }
}

/// One per-PID metrics snapshot as persisted to the dashboard directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub pid: u32,
    pub active_workflows: i64,
    pub total_workflows_started: i64,
    pub total_workflows_completed: i64,
    pub total_workflows_failed: i64,
    pub durations: Vec<f64>,
    pub cpu_usage: Vec<f64>,
    pub memory_usage: Vec<f64>,
    pub params: String,
    pub runtime_duration: i64,
    pub start_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
}

impl Snapshot {
    /// Capture the current snapshot from the store and run info.
    pub fn capture(store: &MetricsStore, info: &RunInfo) -> Self {
        let counters = store.counters();
        Self {
            pid: info.pid,
            active_workflows: counters.active,
            total_workflows_started: counters.started,
            total_workflows_completed: counters.completed,
            total_workflows_failed: counters.failed,
            durations: store.duration_samples(),
            cpu_usage: store.cpu_samples(),
            memory_usage: store.memory_samples(),
            params: info.params.clone(),
            runtime_duration: info.runtime_duration,
            start_timestamp: info.start_timestamp,
            config_file_path: info.config_file_path.clone(),
            output_file_path: info.output_file_path.clone(),
        }
    }

    /// Derive status, remaining time, and liveness for this snapshot.
    pub fn extend(self, probe: LivenessProbe, now: SystemTime) -> ExtendedSnapshot {
        let elapsed = epoch_seconds(now) - self.start_timestamp;
        let time_left = (self.runtime_duration - elapsed).max(0);

        let is_running = probe(self.pid);
        let completed_or_failed = self.total_workflows_completed + self.total_workflows_failed;
        let all_accounted = self.total_workflows_started > 0
            && completed_or_failed >= self.total_workflows_started
            && self.active_workflows == 0;

        let mut status = RunStatus::Running;
        if self.runtime_duration > 0 && time_left == 0 {
            status = RunStatus::Ended;
        }
        if !is_running {
            if all_accounted {
                status = RunStatus::Ended;
            } else if status != RunStatus::Ended {
                status = RunStatus::Killed;
            }
        }

        ExtendedSnapshot {
            snapshot: self,
            status,
            time_left,
            is_running,
        }
    }
}

/// A snapshot with the read-side derived fields attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedSnapshot {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub status: RunStatus,
    pub time_left: i64,
    pub is_running: bool,
}

/// Sum counters and concatenate sample windows across processes.
pub fn aggregate(snapshots: &[ExtendedSnapshot]) -> Snapshot {
    let mut agg = Snapshot::default();
    for ext in snapshots {
        let m = &ext.snapshot;
        agg.active_workflows += m.active_workflows;
        agg.total_workflows_started += m.total_workflows_started;
        agg.total_workflows_completed += m.total_workflows_completed;
        agg.total_workflows_failed += m.total_workflows_failed;
        agg.durations.extend_from_slice(&m.durations);
        agg.cpu_usage.extend_from_slice(&m.cpu_usage);
        agg.memory_usage.extend_from_slice(&m.memory_usage);
    }
    agg
}

/// Whether the process with the given PID is alive. Sends a null signal
/// on unix; queries the task list on windows.
pub fn process_is_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 performs only an existence/permission
        // check and delivers nothing.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(windows)]
    {
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}")])
            .output();
        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()),
            Err(_) => true,
        }
    }
}

fn epoch_seconds(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
