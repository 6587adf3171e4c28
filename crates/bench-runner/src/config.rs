use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Command template for one logical stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    /// Scheduler job name, suffixed with the axis labels of each fanned job.
    pub name: String,
    /// File stem of the job log under `<root>/log`.
    pub log_stem: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Absent means the run's parallelism width.
    #[serde(default)]
    pub cpus: Option<u32>,
}

impl StageTemplate {
    fn new(name: &str, log_stem: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            log_stem: log_stem.to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            cpus: Some(1),
        }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn with_width_cpus(mut self) -> Self {
        self.cpus = None;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTemplates {
    pub setup: StageTemplate,
    pub task: StageTemplate,
    pub features: StageTemplate,
    pub score: StageTemplate,
    pub aggregate: StageTemplate,
}

impl Default for StageTemplates {
    fn default() -> Self {
        Self {
            setup: StageTemplate::new(
                "abx-setup",
                "setup",
                "abx-setup",
                &["{root}", "{corpus_sources}"],
            ),
            task: StageTemplate::new(
                "abx-task",
                "task",
                "abx-task",
                &[
                    "{root}/data/{corpus}.item",
                    "{root}/task/{corpus}_{task}.abx",
                    "{task_options}",
                ],
            ),
            features: StageTemplate::new(
                "abx-features",
                "features",
                "abx-features",
                &[
                    "--njobs",
                    "{jobs}",
                    "{config}",
                    "{root}/data/{corpus}",
                    "{root}/features/{config_name}_{corpus}.h5f",
                ],
            )
            .with_env("OMP_NUM_THREADS", "1")
            .with_env("OPENBLAS_NUM_THREADS", "1")
            .with_width_cpus(),
            score: StageTemplate::new(
                "abx-score",
                "score",
                "abx-score",
                &[
                    "--njobs",
                    "{jobs}",
                    "{root}",
                    "{corpus}",
                    "{task}",
                    "{score_options}",
                ],
            )
            .with_width_cpus(),
            aggregate: StageTemplate::new(
                "abx-collect",
                "collect",
                "abx-collect",
                &["{root}", "{root}/results.csv"],
            ),
        }
    }
}

/// Evaluation mode, each with its own task-construction and scoring options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKind {
    pub name: String,
    #[serde(default)]
    pub task_options: Vec<String>,
    #[serde(default)]
    pub score_options: Vec<String>,
}

fn default_task_kinds() -> Vec<TaskKind> {
    let strings = |raw: &[&str]| raw.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        TaskKind {
            name: "within".to_string(),
            task_options: strings(&["--on", "phone", "--by", "speaker", "context"]),
            score_options: strings(&["--by", "speaker"]),
        },
        TaskKind {
            name: "across".to_string(),
            task_options: strings(&["--on", "phone", "--across", "speaker", "--by", "context"]),
            score_options: strings(&["--across", "speaker"]),
        },
    ]
}

/// Where feature-extraction configuration files are looked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryRule {
    /// Absent means `<root>/config`.
    pub dir: Option<PathBuf>,
    pub extension: String,
    pub recursive: bool,
}

impl Default for DiscoveryRule {
    fn default() -> Self {
        Self {
            dir: None,
            extension: ".yaml".to_string(),
            recursive: false,
        }
    }
}

impl DiscoveryRule {
    pub fn resolve_dir(&self, root: &Path) -> PathBuf {
        match &self.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join("config"),
        }
    }
}

/// How the final aggregation job is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationGate {
    /// Wait for every scoring job of this run to succeed.
    #[default]
    Strict,
    /// Only exclude concurrent jobs sharing the aggregation job name.
    Singleton,
}

impl AggregationGate {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationGate::Strict => "strict",
            AggregationGate::Singleton => "singleton",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stages: StageTemplates,
    pub task_kinds: Vec<TaskKind>,
    pub discovery: DiscoveryRule,
    pub aggregation_gate: AggregationGate,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StageTemplates::default(),
            task_kinds: default_task_kinds(),
            discovery: DiscoveryRule::default(),
            aggregation_gate: AggregationGate::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_kinds.is_empty() {
            return Err(PipelineError::Config(
                "task_kinds must list at least one evaluation mode".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for kind in &self.task_kinds {
            if kind.name.trim().is_empty() {
                return Err(PipelineError::Config("task kind with empty name".to_string()));
            }
            if !seen.insert(kind.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate task kind: {}",
                    kind.name
                )));
            }
        }
        if self.discovery.extension.trim().is_empty() {
            return Err(PipelineError::Config(
                "discovery.extension cannot be empty".to_string(),
            ));
        }
        for (label, template) in [
            ("setup", &self.stages.setup),
            ("task", &self.stages.task),
            ("features", &self.stages.features),
            ("score", &self.stages.score),
            ("aggregate", &self.stages.aggregate),
        ] {
            if template.name.trim().is_empty() || template.log_stem.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "stages.{}: name and log_stem are required",
                    label
                )));
            }
            if template.cpus == Some(0) {
                return Err(PipelineError::Config(format!(
                    "stages.{}: cpus must be >= 1",
                    label
                )));
            }
        }
        Ok(())
    }

    /// sha256 over the canonical JSON form of the configuration.
    pub fn digest(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        let bytes = serde_json::to_vec(&value)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }
}

/// Loads a YAML configuration; fields left out keep their built-in defaults.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let config: PipelineConfig = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Named input corpus. The name is the basename of its source directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corpus {
    pub name: String,
    pub source: PathBuf,
}

impl Corpus {
    /// Checks that `source` is a readable directory and derives the name.
    pub fn from_source(source: &Path) -> Result<Self> {
        let meta = fs::metadata(source).map_err(|e| {
            PipelineError::InvalidCorpus(format!("{}: {}", source.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(PipelineError::InvalidCorpus(format!(
                "{} is not a directory",
                source.display()
            )));
        }
        fs::read_dir(source).map_err(|e| {
            PipelineError::InvalidCorpus(format!("{} is not readable: {}", source.display(), e))
        })?;
        let canonical = source
            .canonicalize()
            .map_err(|e| PipelineError::io(source, e))?;
        let name = canonical
            .file_name()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                PipelineError::InvalidCorpus(format!(
                    "cannot derive a corpus name from {}",
                    source.display()
                ))
            })?;
        Ok(Self {
            name,
            source: canonical,
        })
    }
}

/// Resolves every source, rejecting duplicate corpus names.
pub fn resolve_corpora(sources: &[PathBuf]) -> Result<Vec<Corpus>> {
    if sources.is_empty() {
        return Err(PipelineError::InvalidCorpus(
            "at least one corpus is required".to_string(),
        ));
    }
    let mut corpora = Vec::with_capacity(sources.len());
    let mut names = BTreeSet::new();
    for source in sources {
        let corpus = Corpus::from_source(source)?;
        if !names.insert(corpus.name.clone()) {
            return Err(PipelineError::InvalidCorpus(format!(
                "duplicate corpus name: {}",
                corpus.name
            )));
        }
        corpora.push(corpus);
    }
    Ok(corpora)
}
