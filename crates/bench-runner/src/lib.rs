//! Dependency-ordered submission of the ABX benchmark pipeline to a cluster
//! scheduler: setup, task generation, feature extraction, scoring and
//! aggregation, with fan-out over corpora, task kinds and discovered
//! feature configurations.

mod area;
mod config;
mod deps;
mod error;
mod orchestrator;
mod planner;
mod scheduler;
mod stage;

pub use area::{RunLedger, StagingArea, SubmittedJob, WorkingArea};
pub use config::{
    load_config, resolve_corpora, AggregationGate, Corpus, DiscoveryRule, PipelineConfig,
    StageTemplate, StageTemplates, TaskKind,
};
pub use deps::{DependencyMode, DependencySet};
pub use error::{PipelineError, Result};
pub use orchestrator::{PipelineOrchestrator, RunOptions, RunSummary};
pub use planner::{
    Axis, AxisSource, AxisValue, Bindings, ConfigScan, DirectoryLister, FanOutPlanner, FsLister,
    JobTemplate,
};
pub use scheduler::{batch_script, parse_job_id, LocalClient, SchedulerClient, SlurmClient};
pub use stage::{JobCommand, JobId, Stage, StageDescriptor};
