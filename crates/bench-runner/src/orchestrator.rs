use std::path::PathBuf;

use chrono::Utc;
use tracing::info;

use crate::area::{RunLedger, SubmittedJob, WorkingArea};
use crate::config::{AggregationGate, Corpus, PipelineConfig, StageTemplate};
use crate::deps::DependencySet;
use crate::error::{PipelineError, Result};
use crate::planner::{
    Axis, AxisValue, Bindings, ConfigScan, DirectoryLister, FanOutPlanner, JobTemplate,
};
use crate::scheduler::SchedulerClient;
use crate::stage::Stage;

/// Per-invocation inputs, as supplied on the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: PathBuf,
    pub corpora: Vec<Corpus>,
    /// Parallelism width: default cpu request and `{jobs}`.
    pub jobs: u32,
    pub partition: Option<String>,
    /// Overrides the configured discovery directory.
    pub config_dir: Option<PathBuf>,
    /// Overrides the configured aggregation gate.
    pub aggregation_gate: Option<AggregationGate>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub root: PathBuf,
    pub ledger_path: PathBuf,
    pub aggregation_gate: AggregationGate,
    pub jobs: Vec<SubmittedJob>,
}

impl RunSummary {
    pub fn stage_jobs(&self, stage: Stage) -> impl Iterator<Item = &SubmittedJob> {
        self.jobs.iter().filter(move |j| j.stage == stage)
    }
}

/// Compiles the five-stage graph into scheduler submissions. Nothing here
/// waits for a job to finish; ordering is expressed only through each
/// submission's dependency set.
pub struct PipelineOrchestrator<C, L> {
    config: PipelineConfig,
    client: C,
    planner: FanOutPlanner<L>,
}

impl<C: SchedulerClient, L: DirectoryLister> PipelineOrchestrator<C, L> {
    pub fn new(config: PipelineConfig, client: C, lister: L) -> Self {
        Self {
            config,
            client,
            planner: FanOutPlanner::new(lister),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn run(&mut self, options: &RunOptions) -> Result<RunSummary> {
        self.config.validate()?;
        if options.jobs < 1 {
            return Err(PipelineError::Config("parallelism width must be >= 1".to_string()));
        }
        if options.corpora.is_empty() {
            return Err(PipelineError::InvalidCorpus(
                "at least one corpus is required".to_string(),
            ));
        }

        let discovery_dir = options
            .config_dir
            .clone()
            .unwrap_or_else(|| self.config.discovery.resolve_dir(&options.root));
        if !self.client.completes_on_submit() && discovery_dir.starts_with(&options.root) {
            return Err(PipelineError::Config(format!(
                "configuration directory {} is inside the new working area and stays empty until \
                 setup has run; point discovery at an existing directory or use an executor \
                 that runs jobs before returning",
                discovery_dir.display()
            )));
        }

        let area = WorkingArea::create(&options.root)?;
        let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut ledger = RunLedger::new(
            area.log_dir().join("submissions.json"),
            &run_id,
            &self.config.digest()?,
        );
        let gate = options.aggregation_gate.unwrap_or(self.config.aggregation_gate);
        info!(
            run_id = %run_id,
            root = %area.root().display(),
            corpora = options.corpora.len(),
            task_kinds = self.config.task_kinds.len(),
            gate = gate.as_str(),
            "starting orchestration"
        );

        let bindings = Bindings::default()
            .scalar("root", area.root().to_string_lossy())
            .scalar("jobs", options.jobs.to_string())
            .scalar("partition", options.partition.clone().unwrap_or_default())
            .list(
                "corpus_sources",
                options
                    .corpora
                    .iter()
                    .map(|c| c.source.to_string_lossy().to_string())
                    .collect(),
            );
        let stages = self.config.stages.clone();
        let ctx = StageContext {
            log_dir: area.log_dir().to_path_buf(),
            jobs: options.jobs,
            bindings,
        };

        let corpus_axis = Axis::fixed(
            "corpus",
            options
                .corpora
                .iter()
                .map(|c| AxisValue::named(c.name.clone()))
                .collect(),
        );
        let task_axis = Axis::fixed(
            "task",
            self.config
                .task_kinds
                .iter()
                .map(|k| {
                    AxisValue::named(k.name.clone())
                        .with_list("task_options", k.task_options.clone())
                        .with_list("score_options", k.score_options.clone())
                })
                .collect(),
        );
        let config_axis = Axis::discovered(
            "config",
            ConfigScan {
                dir: discovery_dir,
                extension: self.config.discovery.extension.clone(),
                recursive: self.config.discovery.recursive,
            },
        );

        let setup = self.submit_stage(
            &ctx,
            Stage::Setup,
            &stages.setup,
            &[],
            DependencySet::none(),
            &mut ledger,
        )?;
        let tasks = self.submit_stage(
            &ctx,
            Stage::TaskGeneration,
            &stages.task,
            &[corpus_axis.clone(), task_axis.clone()],
            setup.clone(),
            &mut ledger,
        )?;
        let features = self.submit_stage(
            &ctx,
            Stage::FeatureExtraction,
            &stages.features,
            &[config_axis, corpus_axis.clone()],
            setup,
            &mut ledger,
        )?;
        let scores = self.submit_stage(
            &ctx,
            Stage::Scoring,
            &stages.score,
            &[corpus_axis, task_axis],
            tasks.union(&features)?,
            &mut ledger,
        )?;
        let aggregation_deps = match gate {
            AggregationGate::Strict => scores,
            AggregationGate::Singleton => DependencySet::singleton(),
        };
        self.submit_stage(
            &ctx,
            Stage::Aggregation,
            &stages.aggregate,
            &[],
            aggregation_deps,
            &mut ledger,
        )?;

        let ledger_path = ledger.path().to_path_buf();
        let jobs = ledger.finish()?;
        info!(run_id = %run_id, submitted = jobs.len(), "orchestration complete");
        Ok(RunSummary {
            run_id,
            root: area.root().to_path_buf(),
            ledger_path,
            aggregation_gate: gate,
            jobs,
        })
    }

    /// Plans one stage, submits every job and returns the union of their ids.
    fn submit_stage(
        &mut self,
        ctx: &StageContext,
        stage: Stage,
        template: &StageTemplate,
        axes: &[Axis],
        predecessors: DependencySet,
        ledger: &mut RunLedger,
    ) -> Result<DependencySet> {
        let job = JobTemplate {
            stage,
            template: template.clone(),
            log_dir: ctx.log_dir.clone(),
            cpu_count: template.cpus.unwrap_or(ctx.jobs),
            bindings: ctx.bindings.clone(),
            predecessors,
        };
        let descriptors = self.planner.plan(&job, axes)?;
        let mut issued = DependencySet::none();
        for descriptor in descriptors {
            let job_id = self.client.submit(&descriptor)?;
            let dependency = descriptor.predecessors().render();
            info!(
                stage = %stage,
                job = descriptor.name(),
                job_id = %job_id,
                dependency = %descriptor.predecessors(),
                "submitted"
            );
            ledger.record(SubmittedJob {
                stage,
                name: descriptor.name().to_string(),
                job_id: job_id.clone(),
                log_path: descriptor.log_path().to_path_buf(),
                cpu_count: descriptor.cpu_count(),
                dependency,
            });
            issued.add(job_id);
        }
        Ok(issued)
    }
}

struct StageContext {
    log_dir: PathBuf,
    jobs: u32,
    bindings: Bindings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::FsLister;
    use crate::stage::{JobId, StageDescriptor};
    use serde_json::Value;
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::path::Path;

    #[derive(Debug, Clone)]
    struct Recorded {
        stage: Stage,
        name: String,
        predecessors: BTreeSet<String>,
        dependency: String,
        cpus: u32,
        args: Vec<String>,
    }

    /// Issues 100 for setup, then 201.., 301.., 401.., 501.. per stage.
    #[derive(Default)]
    struct RecordingClient {
        submitted: Vec<Recorded>,
        per_stage: BTreeMap<Stage, u64>,
        fail_at: Option<usize>,
        synchronous: bool,
    }

    impl SchedulerClient for RecordingClient {
        fn submit(&mut self, descriptor: &StageDescriptor) -> Result<JobId> {
            if self.fail_at == Some(self.submitted.len()) {
                return Err(PipelineError::Submission {
                    job: descriptor.name().to_string(),
                    reason: "queue rejected job".to_string(),
                });
            }
            let base = match descriptor.stage() {
                Stage::Setup => 100,
                Stage::TaskGeneration => 200,
                Stage::FeatureExtraction => 300,
                Stage::Scoring => 400,
                Stage::Aggregation => 500,
            };
            let count = self.per_stage.entry(descriptor.stage()).or_insert(0);
            let id = if descriptor.stage() == Stage::Setup {
                base
            } else {
                *count += 1;
                base + *count
            };
            self.submitted.push(Recorded {
                stage: descriptor.stage(),
                name: descriptor.name().to_string(),
                predecessors: descriptor
                    .predecessors()
                    .iter()
                    .map(|j| j.to_string())
                    .collect(),
                dependency: descriptor.predecessors().render(),
                cpus: descriptor.cpu_count(),
                args: descriptor.command().args.clone(),
            });
            Ok(JobId::from(id))
        }

        fn completes_on_submit(&self) -> bool {
            self.synchronous
        }
    }

    struct StubLister(Vec<PathBuf>);

    impl DirectoryLister for StubLister {
        fn list_files(&self, _dir: &Path, _recursive: bool) -> Result<Vec<PathBuf>> {
            Ok(self.0.clone())
        }
    }

    fn one_config() -> StubLister {
        StubLister(vec![PathBuf::from("/cfg/mfcc.yaml")])
    }

    fn options(tag: &str) -> RunOptions {
        RunOptions {
            root: std::env::temp_dir().join(format!(
                "bench_orch_{}_{}_{}",
                tag,
                std::process::id(),
                Utc::now().timestamp_micros()
            )),
            corpora: vec![
                Corpus {
                    name: "english".to_string(),
                    source: PathBuf::from("/data/english"),
                },
                Corpus {
                    name: "xitsonga".to_string(),
                    source: PathBuf::from("/data/xitsonga"),
                },
            ],
            jobs: 8,
            partition: Some("cpu".to_string()),
            config_dir: Some(PathBuf::from("/cfg")),
            aggregation_gate: None,
        }
    }

    fn of_stage(client: &RecordingClient, stage: Stage) -> Vec<Recorded> {
        client
            .submitted
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn end_to_end_submits_twelve_jobs_in_stage_order() {
        let opts = options("e2e");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        let summary = orch.run(&opts).expect("run");
        let client = orch.client();

        assert_eq!(client.submitted.len(), 12);
        assert_eq!(summary.jobs.len(), 12);
        let order: Vec<Stage> = client.submitted.iter().map(|r| r.stage).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted, "stage groups are submitted strictly in order");

        assert_eq!(of_stage(client, Stage::Setup).len(), 1);
        assert_eq!(of_stage(client, Stage::TaskGeneration).len(), 4);
        assert_eq!(of_stage(client, Stage::FeatureExtraction).len(), 2);
        assert_eq!(of_stage(client, Stage::Scoring).len(), 4);
        assert_eq!(of_stage(client, Stage::Aggregation).len(), 1);
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn task_generation_and_features_wait_only_on_setup() {
        let opts = options("fanout");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        orch.run(&opts).expect("run");
        let client = orch.client();

        assert!(of_stage(client, Stage::Setup)[0].predecessors.is_empty());
        assert_eq!(of_stage(client, Stage::Setup)[0].dependency, "");
        for stage in [Stage::TaskGeneration, Stage::FeatureExtraction] {
            for job in of_stage(client, stage) {
                assert_eq!(job.predecessors, set(&["100"]), "{}", job.name);
                assert_eq!(job.dependency, "afterok:100");
            }
        }
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn scoring_waits_on_every_task_and_feature_job() {
        let opts = options("fanin");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        orch.run(&opts).expect("run");
        let client = orch.client();

        let expected = set(&["201", "202", "203", "204", "301", "302"]);
        for job in of_stage(client, Stage::Scoring) {
            assert_eq!(job.predecessors, expected, "{}", job.name);
            assert_eq!(job.dependency, "afterok:201:202:203:204:301:302");
            assert_eq!(job.cpus, 8);
        }
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn strict_aggregation_waits_on_scoring() {
        let opts = options("strict");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        let summary = orch.run(&opts).expect("run");
        assert_eq!(summary.aggregation_gate, AggregationGate::Strict);
        let agg = &of_stage(orch.client(), Stage::Aggregation)[0];
        assert_eq!(agg.predecessors, set(&["401", "402", "403", "404"]));
        assert_eq!(agg.name, "abx-collect");
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn singleton_aggregation_is_gated_by_name_only() {
        let mut opts = options("singleton");
        opts.aggregation_gate = Some(AggregationGate::Singleton);
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        orch.run(&opts).expect("run");
        let agg = &of_stage(orch.client(), Stage::Aggregation)[0];
        assert_eq!(agg.dependency, "singleton");
        assert!(agg.predecessors.is_empty());
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn commands_are_parameterised_per_combination() {
        let opts = options("commands");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        orch.run(&opts).expect("run");
        let client = orch.client();
        let root = opts.root.to_string_lossy().to_string();

        let setup = &of_stage(client, Stage::Setup)[0];
        assert_eq!(setup.args, vec![root.clone(), "/data/english".into(), "/data/xitsonga".into()]);

        let features = of_stage(client, Stage::FeatureExtraction);
        assert_eq!(features[0].name, "abx-features-mfcc-english");
        assert_eq!(
            features[0].args,
            vec![
                "--njobs".to_string(),
                "8".to_string(),
                "/cfg/mfcc.yaml".to_string(),
                format!("{}/data/english", root),
                format!("{}/features/mfcc_english.h5f", root),
            ]
        );

        let scoring = of_stage(client, Stage::Scoring);
        assert_eq!(scoring[0].name, "abx-score-english-across");
        assert_eq!(scoring[0].args[scoring[0].args.len() - 2..], ["--across", "speaker"]);
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn existing_working_area_is_rejected_before_any_submission() {
        let opts = options("exists");
        fs::create_dir_all(&opts.root).expect("pre-existing root");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        let err = orch.run(&opts).expect_err("existing root");
        assert!(matches!(err, PipelineError::WorkingAreaExists(_)));
        assert!(orch.client().submitted.is_empty());
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn empty_configuration_scan_stops_before_feature_extraction() {
        let opts = options("discovery");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            StubLister(Vec::new()),
        );
        let err = orch.run(&opts).expect_err("empty scan");
        assert!(matches!(err, PipelineError::Discovery { .. }));
        let client = orch.client();
        assert!(of_stage(client, Stage::FeatureExtraction).is_empty());
        assert!(of_stage(client, Stage::Scoring).is_empty());
        assert_eq!(client.submitted.len(), 5);

        let ledger: Value = serde_json::from_slice(
            &fs::read(opts.root.join("log").join("submissions.json")).expect("ledger"),
        )
        .expect("json");
        assert_eq!(ledger["status"], "aborted");
        assert_eq!(ledger["jobs"].as_array().map(|a| a.len()), Some(5));
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn queued_setup_cannot_feed_discovery_inside_working_area() {
        let mut opts = options("queued");
        opts.config_dir = None;
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            FsLister,
        );
        let err = orch.run(&opts).expect_err("discovery dir is not populated yet");
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("config"));
        assert!(orch.client().submitted.is_empty());
        assert!(!opts.root.exists());
    }

    #[test]
    fn synchronous_executor_may_discover_inside_working_area() {
        let mut opts = options("synchronous");
        opts.config_dir = None;
        let client = RecordingClient {
            synchronous: true,
            ..RecordingClient::default()
        };
        let mut orch = PipelineOrchestrator::new(PipelineConfig::default(), client, one_config());
        let summary = orch.run(&opts).expect("run");
        assert_eq!(summary.jobs.len(), 12);
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn submission_failure_aborts_the_run() {
        let opts = options("failfast");
        let client = RecordingClient {
            fail_at: Some(2),
            ..RecordingClient::default()
        };
        let mut orch = PipelineOrchestrator::new(PipelineConfig::default(), client, one_config());
        let err = orch.run(&opts).expect_err("rejected submission");
        assert!(matches!(err, PipelineError::Submission { .. }));
        assert_eq!(orch.client().submitted.len(), 2);
        let _ = fs::remove_dir_all(&opts.root);
    }

    #[test]
    fn completed_run_writes_ledger() {
        let opts = options("ledger");
        let mut orch = PipelineOrchestrator::new(
            PipelineConfig::default(),
            RecordingClient::default(),
            one_config(),
        );
        let summary = orch.run(&opts).expect("run");
        let ledger: Value =
            serde_json::from_slice(&fs::read(&summary.ledger_path).expect("ledger")).expect("json");
        assert_eq!(ledger["status"], "submitted");
        assert_eq!(ledger["jobs"].as_array().map(|a| a.len()), Some(12));
        assert_eq!(summary.stage_jobs(Stage::Scoring).count(), 4);
        let _ = fs::remove_dir_all(&opts.root);
    }
}
