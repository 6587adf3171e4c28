use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::deps::DependencySet;
use crate::error::{PipelineError, Result};

/// Opaque identifier issued by the scheduler. Never parsed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical pipeline step. Each one may fan out into several jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    TaskGeneration,
    FeatureExtraction,
    Scoring,
    Aggregation,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Setup,
        Stage::TaskGeneration,
        Stage::FeatureExtraction,
        Stage::Scoring,
        Stage::Aggregation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::TaskGeneration => "task_generation",
            Stage::FeatureExtraction => "feature_extraction",
            Stage::Scoring => "scoring",
            Stage::Aggregation => "aggregation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executable invocation: program, ordered arguments and the environment
/// variables handed through to the job untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl JobCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.program.trim().is_empty()
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// One unit of work, built right before submission and dropped right after.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    stage: Stage,
    name: String,
    log_path: PathBuf,
    cpu_count: u32,
    predecessors: DependencySet,
    command: JobCommand,
}

impl StageDescriptor {
    pub fn new(
        stage: Stage,
        name: impl Into<String>,
        log_path: impl Into<PathBuf>,
        cpu_count: u32,
        predecessors: DependencySet,
        command: JobCommand,
    ) -> Result<Self> {
        let name = name.into();
        let log_path = log_path.into();
        if name.trim().is_empty() {
            return Err(PipelineError::InvalidStage(format!(
                "{} job has an empty name",
                stage
            )));
        }
        if cpu_count < 1 {
            return Err(PipelineError::InvalidStage(format!(
                "{}: cpu_count must be >= 1 (got {})",
                name, cpu_count
            )));
        }
        let parent_exists = log_path
            .parent()
            .map(|p| p.as_os_str().is_empty() || p.is_dir())
            .unwrap_or(false);
        if !parent_exists {
            return Err(PipelineError::InvalidStage(format!(
                "{}: log directory does not exist for {}",
                name,
                log_path.display()
            )));
        }
        if command.is_empty() {
            return Err(PipelineError::InvalidStage(format!(
                "{}: command is empty",
                name
            )));
        }
        Ok(Self {
            stage,
            name,
            log_path,
            cpu_count,
            predecessors,
            command,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn predecessors(&self) -> &DependencySet {
        &self.predecessors
    }

    pub fn command(&self) -> &JobCommand {
        &self.command
    }
}
