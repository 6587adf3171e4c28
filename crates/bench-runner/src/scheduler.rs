use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::area::{atomic_write_bytes, StagingArea};
use crate::error::{PipelineError, Result};
use crate::stage::{JobId, StageDescriptor};

/// Hands a descriptor to a cluster scheduler and returns the issued id.
/// Failures are never retried here.
pub trait SchedulerClient {
    fn submit(&mut self, descriptor: &StageDescriptor) -> Result<JobId>;

    /// True when a job has already finished by the time `submit` returns.
    fn completes_on_submit(&self) -> bool {
        false
    }
}

impl<C: SchedulerClient + ?Sized> SchedulerClient for &mut C {
    fn submit(&mut self, descriptor: &StageDescriptor) -> Result<JobId> {
        (**self).submit(descriptor)
    }

    fn completes_on_submit(&self) -> bool {
        (**self).completes_on_submit()
    }
}

impl<C: SchedulerClient + ?Sized> SchedulerClient for Box<C> {
    fn submit(&mut self, descriptor: &StageDescriptor) -> Result<JobId> {
        (**self).submit(descriptor)
    }

    fn completes_on_submit(&self) -> bool {
        (**self).completes_on_submit()
    }
}

fn submission_error(descriptor: &StageDescriptor, reason: impl Into<String>) -> PipelineError {
    PipelineError::Submission {
        job: descriptor.name().to_string(),
        reason: reason.into(),
    }
}

/// Submits batch scripts through `sbatch --parsable`.
pub struct SlurmClient {
    sbatch: String,
    partition: Option<String>,
    staging: StagingArea,
    submitted: usize,
}

impl SlurmClient {
    pub fn new(partition: Option<String>) -> Result<Self> {
        Ok(Self {
            sbatch: "sbatch".to_string(),
            partition,
            staging: StagingArea::acquire("bench_sbatch")?,
            submitted: 0,
        })
    }

    /// Overrides the submission executable (a wrapper or a test double).
    pub fn with_program(mut self, sbatch: impl Into<String>) -> Self {
        self.sbatch = sbatch.into();
        self
    }

    fn script_path(&self, descriptor: &StageDescriptor) -> PathBuf {
        self.staging
            .path()
            .join(format!("{:04}_{}.sh", self.submitted, descriptor.name()))
    }
}

impl SchedulerClient for SlurmClient {
    fn submit(&mut self, descriptor: &StageDescriptor) -> Result<JobId> {
        let script = batch_script(descriptor, self.partition.as_deref())?;
        let script_path = self.script_path(descriptor);
        atomic_write_bytes(&script_path, script.as_bytes())?;
        self.submitted += 1;

        let output = Command::new(&self.sbatch)
            .arg("--parsable")
            .arg(&script_path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| submission_error(descriptor, format!("cannot run {}: {}", self.sbatch, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output");
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(submission_error(
                descriptor,
                format!("{} exited with {}: {}", self.sbatch, code, tail.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_job_id(&stdout).ok_or_else(|| {
            submission_error(
                descriptor,
                format!("malformed {} response: {:?}", self.sbatch, stdout.trim()),
            )
        })?;
        debug!(job = descriptor.name(), %job_id, script = %script_path.display(), "sbatch accepted");
        Ok(job_id)
    }
}

/// Extracts the id from `sbatch --parsable` output (`<id>` or `<id>;<cluster>`).
pub fn parse_job_id(stdout: &str) -> Option<JobId> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let id = line.trim().split(';').next()?.trim();
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return None;
    }
    Some(JobId::new(id))
}

/// Renders the batch script handed to `sbatch`.
pub fn batch_script(descriptor: &StageDescriptor, partition: Option<&str>) -> Result<String> {
    let output = descriptor.log_path().to_string_lossy();
    for (what, value) in [("job name", descriptor.name()), ("log path", output.as_ref())] {
        if value.chars().any(char::is_whitespace) {
            return Err(PipelineError::InvalidStage(format!(
                "{}: {} '{}' contains whitespace, which #SBATCH directives cannot carry",
                descriptor.name(),
                what,
                value
            )));
        }
    }
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH --job-name={}", descriptor.name()),
        format!("#SBATCH --output={}", descriptor.log_path().display()),
        format!("#SBATCH --cpus-per-task={}", descriptor.cpu_count()),
    ];
    if let Some(partition) = partition.filter(|p| !p.trim().is_empty()) {
        lines.push(format!("#SBATCH --partition={}", partition));
    }
    let dependency = descriptor.predecessors().render();
    if !dependency.is_empty() {
        lines.push(format!("#SBATCH --dependency={}", dependency));
    }
    for (key, value) in &descriptor.command().env {
        if !is_env_key(key) {
            return Err(PipelineError::InvalidStage(format!(
                "{}: invalid environment variable name '{}'",
                descriptor.name(),
                key
            )));
        }
        lines.push(format!("export {}={}", key, shell_quote(value)));
    }
    lines.push(format!("exec {}", shell_join(&descriptor.command().argv())));
    lines.push(String::new());
    Ok(lines.join("\n"))
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Runs each job to completion on this host before returning, so every
/// dependency is already satisfied when the next job is submitted.
#[derive(Debug, Default)]
pub struct LocalClient {
    issued: u64,
}

impl LocalClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerClient for LocalClient {
    fn submit(&mut self, descriptor: &StageDescriptor) -> Result<JobId> {
        let log_path = descriptor.log_path();
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| PipelineError::io(log_path, e))?;
        let log_err = log.try_clone().map_err(|e| PipelineError::io(log_path, e))?;

        let command = descriptor.command();
        let status = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .map_err(|e| {
                submission_error(descriptor, format!("cannot run {}: {}", command.program, e))
            })?;
        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(submission_error(
                descriptor,
                format!("exited with {} (see {})", code, log_path.display()),
            ));
        }
        self.issued += 1;
        Ok(JobId::new(format!("local-{}", self.issued)))
    }

    fn completes_on_submit(&self) -> bool {
        true
    }
}
