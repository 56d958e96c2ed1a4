use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One journal line as persisted to the per-PID log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub pid: String,
    pub parameters: String,
    pub log: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only, line-delimited JSON journal keyed by PID, plus the
/// end-of-run summary file next to it. Write failures are logged and
/// swallowed; journaling never fails a run.
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    pid: u32,
    parameters: String,
    file: parking_lot::Mutex<Option<std::fs::File>>,
}

impl Journal {
    /// Journal writing into `dir` for the current process.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "could not create log directory");
        }
        Self {
            dir,
            pid: std::process::id(),
            parameters: std::env::args().skip(1).collect::<Vec<_>>().join(" "),
            file: parking_lot::Mutex::new(None),
        }
    }

    /// Path of the journal file for a given PID.
    pub fn log_path_for(dir: &Path, pid: u32) -> PathBuf {
        dir.join(format!("logs_{pid}.json"))
    }

    /// Path of the summary file for this process.
    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(format!("summary_{}.txt", self.pid))
    }

    /// Append one entry to the journal.
    pub fn log(&self, message: &str) {
        let entry = LogEntry {
            pid: self.pid.to_string(),
            parameters: self.parameters.clone(),
            log: message.to_string(),
            timestamp: Utc::now(),
        };

        let mut guard = self.file.lock();
        if guard.is_none() {
            let path = Self::log_path_for(&self.dir, self.pid);
            match std::fs::OpenOptions::new().append(true).create(true).open(&path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not open journal file");
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            let line = match serde_json::to_string(&entry) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "could not encode journal entry");
                    return;
                }
            };
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "could not append journal entry");
            }
        }
    }

    /// Write the end-of-run summary file, replacing any previous one.
    pub fn write_summary(&self, text: &str) {
        let path = self.summary_path();
        if let Err(e) = std::fs::write(&path, text) {
            warn!(path = %path.display(), error = %e, "could not write run summary");
        }
    }
}
