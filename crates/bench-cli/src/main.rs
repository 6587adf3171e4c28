use anyhow::Result;
use bench_runner::{
    AggregationGate, FsLister, LocalClient, PipelineConfig, PipelineError, PipelineOrchestrator,
    RunOptions, RunSummary, SchedulerClient, SlurmClient, Stage, StageTemplate,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench", version = "0.3.0", about = "ABX benchmark pipeline orchestrator")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExecutorArg {
    #[value(name = "slurm")]
    Slurm,
    #[value(name = "local")]
    Local,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GateArg {
    #[value(name = "strict")]
    Strict,
    #[value(name = "singleton")]
    Singleton,
}

impl From<GateArg> for AggregationGate {
    fn from(value: GateArg) -> Self {
        match value {
            GateArg::Strict => AggregationGate::Strict,
            GateArg::Singleton => AggregationGate::Singleton,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Submit every stage of the pipeline into a fresh working area.
    Run {
        /// Working-area root; must not exist yet.
        #[arg(long)]
        root: PathBuf,
        /// Corpus source directory (repeatable); its basename names the corpus.
        #[arg(long = "corpus", required = true)]
        corpora: Vec<PathBuf>,
        /// Parallelism width of feature extraction and scoring jobs.
        #[arg(long, default_value_t = 1)]
        jobs: u32,
        #[arg(long)]
        partition: Option<String>,
        /// Pipeline configuration (YAML); built-in defaults otherwise.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory scanned for feature configurations. With the slurm
        /// executor it must already exist outside the working area.
        #[arg(long)]
        config_dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "slurm")]
        executor: ExecutorArg,
        #[arg(long, value_enum)]
        aggregation_gate: Option<GateArg>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved pipeline configuration.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<PipelineError>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            root,
            corpora,
            jobs,
            partition,
            config,
            config_dir,
            executor,
            aggregation_gate,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let root = absolute(&root)?;
            if root.exists() {
                return Err(PipelineError::WorkingAreaExists(root).into());
            }
            let corpora = bench_runner::resolve_corpora(&corpora)?;
            let options = RunOptions {
                root,
                corpora,
                jobs,
                partition: partition.clone(),
                config_dir: config_dir.map(|d| absolute(&d)).transpose()?,
                aggregation_gate: aggregation_gate.map(Into::into),
            };
            let client: Box<dyn SchedulerClient> = match executor {
                ExecutorArg::Slurm => Box::new(SlurmClient::new(partition)?),
                ExecutorArg::Local => Box::new(LocalClient::new()),
            };
            let mut orchestrator = PipelineOrchestrator::new(config, client, FsLister);
            let summary = orchestrator.run(&options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Describe { config, json } => {
            let config = load_config(config.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config_digest": config.digest()?,
                    "config": serde_json::to_value(&config)?,
                })));
            }
            print_config(&config)?;
        }
    }
    Ok(None)
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => bench_runner::load_config(path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
    }
}

fn summary_to_json(summary: &RunSummary) -> Value {
    let stages: Vec<Value> = Stage::ALL
        .iter()
        .map(|stage| {
            let jobs: Vec<Value> = summary
                .stage_jobs(*stage)
                .map(|job| {
                    json!({
                        "name": job.name,
                        "job_id": job.job_id.as_str(),
                        "log_path": job.log_path.display().to_string(),
                        "cpu_count": job.cpu_count,
                        "dependency": job.dependency,
                    })
                })
                .collect();
            json!({ "stage": stage.as_str(), "jobs": jobs })
        })
        .collect();
    json!({
        "run_id": summary.run_id,
        "root": summary.root.display().to_string(),
        "ledger": summary.ledger_path.display().to_string(),
        "aggregation_gate": summary.aggregation_gate.as_str(),
        "submitted": summary.jobs.len(),
        "stages": stages,
    })
}

fn print_summary(summary: &RunSummary) {
    println!("run_id: {}", summary.run_id);
    println!("root: {}", summary.root.display());
    println!("aggregation_gate: {}", summary.aggregation_gate.as_str());
    for stage in Stage::ALL {
        let jobs: Vec<_> = summary.stage_jobs(stage).collect();
        println!("{} ({} jobs)", stage, jobs.len());
        for job in jobs {
            let dependency = if job.dependency.is_empty() {
                "none"
            } else {
                job.dependency.as_str()
            };
            println!("  {}  {}  after={}", job.job_id, job.name, dependency);
        }
    }
    println!("submitted: {}", summary.jobs.len());
    println!("ledger: {}", summary.ledger_path.display());
}

fn print_config(config: &PipelineConfig) -> Result<()> {
    println!("config_digest: {}", config.digest()?);
    println!("aggregation_gate: {}", config.aggregation_gate.as_str());
    println!(
        "discovery: {} '{}'{}",
        config
            .discovery
            .dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "<root>/config".to_string()),
        config.discovery.extension,
        if config.discovery.recursive {
            " (recursive)"
        } else {
            ""
        }
    );
    println!("task_kinds:");
    for kind in &config.task_kinds {
        println!(
            "  {}  task=[{}]  score=[{}]",
            kind.name,
            kind.task_options.join(" "),
            kind.score_options.join(" ")
        );
    }
    println!("stages:");
    for (stage, template) in [
        (Stage::Setup, &config.stages.setup),
        (Stage::TaskGeneration, &config.stages.task),
        (Stage::FeatureExtraction, &config.stages.features),
        (Stage::Scoring, &config.stages.score),
        (Stage::Aggregation, &config.stages.aggregate),
    ] {
        print_template(stage, template);
    }
    Ok(())
}

fn print_template(stage: Stage, template: &StageTemplate) {
    let cpus = template
        .cpus
        .map(|c| c.to_string())
        .unwrap_or_else(|| "{jobs}".to_string());
    println!(
        "  {:<18} {}  cpus={}  {} {}",
        stage.as_str(),
        template.name,
        cpus,
        template.program,
        template.args.join(" ")
    );
    for (key, value) in &template.env {
        println!("  {:<18}   env {}={}", "", key, value);
    }
}
