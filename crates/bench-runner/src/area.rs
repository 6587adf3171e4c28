use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::stage::{JobId, Stage};

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| PipelineError::io(path, e))
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| PipelineError::io(path, e))
}

/// Root of one orchestration run. Never reused.
#[derive(Debug, Clone)]
pub struct WorkingArea {
    root: PathBuf,
    log_dir: PathBuf,
}

impl WorkingArea {
    /// Creates `root` and `root/log`; an existing root is rejected.
    pub fn create(root: &Path) -> Result<Self> {
        if root.exists() {
            return Err(PipelineError::WorkingAreaExists(root.to_path_buf()));
        }
        if let Some(parent) = root.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        match fs::create_dir(root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(PipelineError::WorkingAreaExists(root.to_path_buf()));
            }
            Err(e) => return Err(PipelineError::io(root, e)),
        }
        let log_dir = root.join("log");
        ensure_dir(&log_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            log_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Scratch directory removed when dropped, whatever the exit path.
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
}

impl StagingArea {
    pub fn acquire(prefix: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// One accepted submission as recorded in the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub stage: Stage,
    pub name: String,
    pub job_id: JobId,
    pub log_path: PathBuf,
    pub cpu_count: u32,
    pub dependency: String,
}

/// Records submissions and persists them to `log/submissions.json`. If the
/// run is abandoned before [`RunLedger::finish`], the drop guard writes the
/// partial list with status `aborted`.
pub struct RunLedger {
    path: PathBuf,
    run_id: String,
    config_digest: String,
    started_at: DateTime<Utc>,
    jobs: Vec<SubmittedJob>,
    done: bool,
}

impl RunLedger {
    pub fn new(path: PathBuf, run_id: &str, config_digest: &str) -> Self {
        Self {
            path,
            run_id: run_id.to_string(),
            config_digest: config_digest.to_string(),
            started_at: Utc::now(),
            jobs: Vec::new(),
            done: false,
        }
    }

    pub fn record(&mut self, job: SubmittedJob) {
        self.jobs.push(job);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<Vec<SubmittedJob>> {
        self.write("submitted")?;
        self.done = true;
        Ok(std::mem::take(&mut self.jobs))
    }

    fn write(&self, status: &str) -> Result<()> {
        let payload = json!({
            "schema_version": "submissions_v1",
            "run_id": self.run_id,
            "status": status,
            "config_digest": self.config_digest,
            "started_at": self.started_at.to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
            "jobs": self.jobs,
        });
        let bytes = serde_json::to_vec_pretty(&payload)?;
        atomic_write_bytes(&self.path, &bytes)
    }
}

impl Drop for RunLedger {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if !self.jobs.is_empty() {
            let ids = self
                .jobs
                .iter()
                .map(|j| j.job_id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            warn!(
                run_id = %self.run_id,
                submitted = self.jobs.len(),
                job_ids = %ids,
                "run aborted with jobs already submitted; cancel them manually if needed"
            );
        }
        let _ = self.write("aborted");
    }
}
