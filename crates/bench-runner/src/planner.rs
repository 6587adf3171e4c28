use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::config::StageTemplate;
use crate::deps::DependencySet;
use crate::error::{PipelineError, Result};
use crate::stage::{JobCommand, Stage, StageDescriptor};

/// Lists regular files under a directory. Injected so discovery can be tested
/// without touching the real filesystem.
pub trait DirectoryLister {
    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>>;
}

/// [`DirectoryLister`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsLister;

impl DirectoryLister for FsLister {
    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut walker = WalkDir::new(dir).min_depth(1).follow_links(true);
        if !recursive {
            walker = walker.max_depth(1);
        }
        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                PipelineError::io(path, e.into())
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// One value along a fan-out axis. `label` names logs and jobs, `value` is
/// substituted into commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisValue {
    pub label: String,
    pub value: String,
    pub lists: BTreeMap<String, Vec<String>>,
}

impl AxisValue {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            lists: BTreeMap::new(),
        }
    }

    /// Uses `name` as the value and its sanitized form as the label.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(sanitize_label(&name), name)
    }

    /// Binds an extra whole-argument list placeholder while this value is active.
    pub fn with_list(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.lists.insert(key.into(), values);
        self
    }
}

/// Files with a given extension found under `dir` at planning time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigScan {
    pub dir: PathBuf,
    pub extension: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisSource {
    Fixed(Vec<AxisValue>),
    Discovered(ConfigScan),
}

/// Named fan-out dimension. Its name is also the placeholder it binds:
/// `{name}` to the value and `{name_name}` to the label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Axis {
    name: String,
    source: AxisSource,
}

impl Axis {
    pub fn fixed(name: impl Into<String>, values: Vec<AxisValue>) -> Self {
        Self {
            name: name.into(),
            source: AxisSource::Fixed(values),
        }
    }

    pub fn discovered(name: impl Into<String>, scan: ConfigScan) -> Self {
        Self {
            name: name.into(),
            source: AxisSource::Discovered(scan),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve<L: DirectoryLister>(&self, lister: &L) -> Result<Vec<AxisValue>> {
        let mut values = match &self.source {
            AxisSource::Fixed(values) => values.clone(),
            AxisSource::Discovered(scan) => discover(lister, scan)?,
        };
        values.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.value.cmp(&b.value)));
        Ok(values)
    }
}

fn discover<L: DirectoryLister>(lister: &L, scan: &ConfigScan) -> Result<Vec<AxisValue>> {
    let files = lister.list_files(&scan.dir, scan.recursive)?;
    let mut values = Vec::new();
    for file in files {
        let relative = file.strip_prefix(&scan.dir).unwrap_or(&file);
        let relative = relative.to_string_lossy().replace('\\', "/");
        let Some(stem) = relative.strip_suffix(scan.extension.as_str()) else {
            continue;
        };
        let label = sanitize_label(stem);
        if label.is_empty() {
            continue;
        }
        values.push(AxisValue::new(label, file.to_string_lossy().to_string()));
    }
    debug!(
        dir = %scan.dir.display(),
        extension = %scan.extension,
        found = values.len(),
        "configuration scan"
    );
    if values.is_empty() {
        return Err(PipelineError::Discovery {
            dir: scan.dir.clone(),
            extension: scan.extension.clone(),
        });
    }
    Ok(values)
}

fn sanitize_label(raw: &str) -> String {
    raw.trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Placeholder values available to a template: scalars substitute anywhere,
/// lists expand an argument that consists of the placeholder alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    scalars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
}

impl Bindings {
    pub fn scalar(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_scalar(key, value);
        self
    }

    pub fn list(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.lists.insert(key.into(), values);
        self
    }

    pub fn set_scalar(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.scalars.insert(key.into(), value.into());
    }

    fn expand_arg(&self, template: &str) -> Result<Vec<String>> {
        if let Some(key) = whole_placeholder(template) {
            if let Some(values) = self.lists.get(key) {
                return Ok(values.clone());
            }
        }
        Ok(vec![self.render(template)?])
    }

    /// Single pass over `template`; substituted text is never rescanned and
    /// shell-style `${VAR}` is left alone.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut pos = 0;
        while let Some(offset) = template[pos..].find('{') {
            let open = pos + offset;
            out.push_str(&template[pos..open]);
            let tail = &template[open..];
            let shell_var = template[..open].ends_with('$');
            let close = tail.find('}');
            let key = close
                .map(|c| &tail[1..c])
                .filter(|k| is_placeholder_key(k) && !shell_var);
            match (key, close) {
                (Some(key), Some(close)) => {
                    let value = self.scalars.get(key).ok_or_else(|| {
                        PipelineError::InvalidStage(format!(
                            "unresolved placeholder {{{}}} in '{}'",
                            key, template
                        ))
                    })?;
                    out.push_str(value);
                    pos = open + close + 1;
                }
                _ => {
                    out.push('{');
                    pos = open + 1;
                }
            }
        }
        out.push_str(&template[pos..]);
        Ok(out)
    }
}

fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn whole_placeholder(template: &str) -> Option<&str> {
    template
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .filter(|k| is_placeholder_key(k))
}

/// A stage template with everything but the axis values resolved.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub stage: Stage,
    pub template: StageTemplate,
    pub log_dir: PathBuf,
    pub cpu_count: u32,
    pub bindings: Bindings,
    pub predecessors: DependencySet,
}

/// Expands a stage over the Cartesian product of its axes.
#[derive(Debug, Clone, Default)]
pub struct FanOutPlanner<L> {
    lister: L,
}

impl<L: DirectoryLister> FanOutPlanner<L> {
    pub fn new(lister: L) -> Self {
        Self { lister }
    }

    /// Discovered axes are scanned here, when the stage is planned.
    pub fn plan(&self, job: &JobTemplate, axes: &[Axis]) -> Result<Vec<StageDescriptor>> {
        let mut resolved = Vec::with_capacity(axes.len());
        for axis in axes {
            resolved.push((axis.name(), axis.resolve(&self.lister)?));
        }

        let mut combos: Vec<Vec<(&str, &AxisValue)>> = vec![Vec::new()];
        for (name, values) in &resolved {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut extended = combo.clone();
                    extended.push((*name, value));
                    next.push(extended);
                }
            }
            combos = next;
        }

        let mut descriptors = Vec::with_capacity(combos.len());
        let mut log_paths = BTreeSet::new();
        for combo in combos {
            let descriptor = self.instantiate(job, &combo)?;
            if !log_paths.insert(descriptor.log_path().to_path_buf()) {
                return Err(PipelineError::InvalidStage(format!(
                    "{}: two jobs would share log {}",
                    job.stage,
                    descriptor.log_path().display()
                )));
            }
            descriptors.push(descriptor);
        }
        debug!(stage = %job.stage, jobs = descriptors.len(), "planned stage");
        Ok(descriptors)
    }

    fn instantiate(&self, job: &JobTemplate, combo: &[(&str, &AxisValue)]) -> Result<StageDescriptor> {
        let mut bindings = job.bindings.clone();
        let mut labels = Vec::with_capacity(combo.len());
        for (name, value) in combo {
            bindings.set_scalar(*name, value.value.clone());
            bindings.set_scalar(format!("{}_name", name), value.label.clone());
            for (key, list) in &value.lists {
                bindings = bindings.list(key.clone(), list.clone());
            }
            labels.push(value.label.as_str());
        }

        let (name, log_file) = if labels.is_empty() {
            (
                job.template.name.clone(),
                format!("{}.log", job.template.log_stem),
            )
        } else {
            (
                format!("{}-{}", job.template.name, labels.join("-")),
                format!("{}_{}.log", job.template.log_stem, labels.join("_")),
            )
        };

        let mut command = JobCommand::new(bindings.render(&job.template.program)?);
        for arg in &job.template.args {
            command.args.extend(bindings.expand_arg(arg)?);
        }
        command.env = job.template.env.clone();

        StageDescriptor::new(
            job.stage,
            name,
            job.log_dir.join(log_file),
            job.cpu_count,
            job.predecessors.clone(),
            command,
        )
    }
}
