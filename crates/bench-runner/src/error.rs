use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed descriptor; never reaches the scheduler.
    #[error("invalid_stage: {0}")]
    InvalidStage(String),

    #[error("submission_failed: {job}: {reason}")]
    Submission { job: String, reason: String },

    #[error("invalid_dependency_mode: cannot combine {left} with {right}")]
    InvalidDependencyMode {
        left: &'static str,
        right: &'static str,
    },

    #[error("discovery_failed: no '{extension}' files under {}", .dir.display())]
    Discovery { dir: PathBuf, extension: String },

    #[error("working_area_exists: {} (use a fresh root)", .0.display())]
    WorkingAreaExists(PathBuf),

    #[error("invalid_corpus: {0}")]
    InvalidCorpus(String),

    #[error("invalid_config: {0}")]
    Config(String),

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code, used by the CLI's JSON error documents.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidStage(_) => "invalid_stage",
            Self::Submission { .. } => "submission_failed",
            Self::InvalidDependencyMode { .. } => "invalid_dependency_mode",
            Self::Discovery { .. } => "discovery_failed",
            Self::WorkingAreaExists(_) => "working_area_exists",
            Self::InvalidCorpus(_) => "invalid_corpus",
            Self::Config(_) => "invalid_config",
            Self::Io { .. } => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
