use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use serde::{Deserialize, de::DeserializeOwned};
use serde_yaml_ng::Value;

pub use filter::{BranchCondition, RefPattern};
pub use vars::{PREDEFINED_VARIABLES, variable_references};

mod filter;
mod vars;

/// The stages a pipeline has when the descriptor doesn't declare any.
pub const DEFAULT_STAGES: &[&str] = &["build", "test", "deploy"];

/// The stage a job is in when it doesn't name one.
pub const DEFAULT_JOB_STAGE: &str = "test";

/// Top-level keys that a CI controller understands but that have no effect
/// on local runs.
const IGNORED_KEYS: &[&str] = &["image", "services", "cache", "default", "include", "workflow"];

/// Errors loading a pipeline descriptor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read pipeline descriptor '{}'", .0.display())]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse pipeline descriptor")]
    Yaml(#[source] serde_yaml_ng::Error),
    #[error("pipeline descriptor must be a mapping at the top level")]
    NotAMapping,
    #[error("pipeline descriptor has {} problem(s)", .0.len())]
    Invalid(Vec<Problem>),
}

/// A structural problem with an otherwise well-formed YAML document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Problem {
    #[error("'{location}' is malformed: {message}")]
    Malformed { location: String, message: String },
    #[error("top-level keys must be strings")]
    NonStringKey,
    #[error("the pipeline declares no stages")]
    NoStages,
    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(String),
    #[error("the pipeline defines no jobs")]
    NoJobs,
    #[error("job '{job}' is in undeclared stage '{stage}'")]
    UnknownStage { job: String, stage: String },
    #[error("job '{0}' has both 'only' and 'except' branch filters")]
    ConflictingFilters(String),
    #[error("job '{0}' has no script commands")]
    EmptyScript(String),
    #[error("job '{job}' has invalid branch pattern '{pattern}': {message}")]
    InvalidPattern {
        job: String,
        pattern: String,
        message: String,
    },
    #[error("variable '{name}' in '{scope}' must be a scalar")]
    NonScalarVariable { scope: String, name: String },
    #[error("job '{job}' needs unknown job '{need}'")]
    UnknownNeed { job: String, need: String },
    #[error("job '{job}' needs '{need}', which is not in an earlier stage")]
    NeedsLaterStage { job: String, need: String },
}

/// A job as it is written in the descriptor.
#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    only: Option<RawRefs>,
    #[serde(default)]
    except: Option<RawRefs>,
    #[serde(default)]
    script: Option<Lines>,
    #[serde(default)]
    before_script: Option<Lines>,
    #[serde(default)]
    after_script: Option<Lines>,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
    #[serde(default)]
    allow_failure: bool,
    #[serde(default)]
    needs: Option<Vec<String>>,
}

/// A list of commands, which may be written as a single string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Lines {
    One(String),
    Many(Vec<String>),
}

impl From<Lines> for Vec<String> {
    fn from(lines: Lines) -> Self {
        match lines {
            Lines::One(line) => vec![line],
            Lines::Many(lines) => lines,
        }
    }
}

/// The value of an `only` or `except` key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRefs {
    One(String),
    Many(Vec<String>),
    Refs { refs: Vec<String> },
}

impl From<RawRefs> for Vec<String> {
    fn from(refs: RawRefs) -> Self {
        match refs {
            RawRefs::One(r) => vec![r],
            RawRefs::Many(refs) | RawRefs::Refs { refs } => refs,
        }
    }
}

/// A named unit of work in the pipeline.
#[derive(Debug, Clone)]
pub struct Job {
    /// The unique name of the job.
    pub name: String,
    /// The stage the job belongs to.
    pub stage: String,
    /// The tags a runner must offer to pick this job up.
    pub tags: BTreeSet<String>,
    /// The branches on which the job is triggered.
    pub condition: BranchCondition,
    /// Commands run before `commands`, in the same shell.
    pub before_commands: Vec<String>,
    /// The job's own command sequence. Never empty.
    pub commands: Vec<String>,
    /// Commands run afterwards in a fresh shell, whatever the outcome.
    pub after_commands: Vec<String>,
    /// Pipeline variables overlaid with the job's own.
    pub variables: BTreeMap<String, String>,
    /// Whether a failure of this job is tolerated.
    pub allow_failure: bool,
    /// Explicit dependencies, replacing the default stage ordering.
    pub needs: Option<Vec<String>>,
}

impl Job {
    /// Iterates over every command the job runs, including before and after
    /// scripts.
    pub fn all_commands(&self) -> impl Iterator<Item = &String> {
        self.before_commands
            .iter()
            .chain(self.commands.iter())
            .chain(self.after_commands.iter())
    }
}

/// A parsed and validated pipeline descriptor.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<String>,
    variables: BTreeMap<String, String>,
    jobs: Vec<Job>,
}

impl Pipeline {
    /// The declared stages, in order.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// The jobs, in the order they appear in the descriptor.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// The pipeline-wide variables.
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Returns the position of a stage in the stage list.
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Collects the variables that commands reference but that neither the
    /// descriptor nor the runner define, along with the names of the jobs
    /// that reference them.
    ///
    /// These have to come from the environment of whoever runs the pipeline.
    pub fn referenced_variables(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut referenced: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for job in self.jobs.iter() {
            for command in job.all_commands() {
                for name in variable_references(command) {
                    if job.variables.contains_key(name) || PREDEFINED_VARIABLES.contains(&name) {
                        continue;
                    }
                    referenced
                        .entry(name.to_string())
                        .or_default()
                        .insert(job.name.clone());
                }
            }
        }
        referenced
    }
}

/// Read and validate a pipeline descriptor from disk.
pub fn load(path: impl AsRef<Path>) -> Result<Pipeline, Error> {
    let path = path.as_ref();
    let contents =
        std::fs::read_to_string(path).map_err(|err| Error::Read(path.to_path_buf(), err))?;
    parse(&contents)
}

/// Parse and validate a pipeline descriptor.
///
/// Every structural problem is collected before failing, so that a single
/// pass reports all of them.
pub fn parse(contents: &str) -> Result<Pipeline, Error> {
    let mut doc: Value = serde_yaml_ng::from_str(contents).map_err(Error::Yaml)?;
    doc.apply_merge().map_err(Error::Yaml)?;
    let map = match doc {
        Value::Mapping(map) => map,
        Value::Null => Default::default(),
        _ => return Err(Error::NotAMapping),
    };

    let mut problems = Vec::new();
    let mut stages = None;
    let mut variables = BTreeMap::new();
    let mut before_script = Vec::new();
    let mut after_script = Vec::new();
    let mut raw_jobs = Vec::new();
    for (key, value) in map {
        let Some(key) = key.as_str() else {
            problems.push(Problem::NonStringKey);
            continue;
        };
        match key {
            "stages" => stages = read::<Vec<String>>(key, value, &mut problems),
            "variables" => {
                if let Some(raw) = read::<BTreeMap<String, Value>>(key, value, &mut problems) {
                    variables = scalar_variables(key, raw, &mut problems);
                }
            }
            "before_script" => {
                if let Some(lines) = read::<Lines>(key, value, &mut problems) {
                    before_script = lines.into();
                }
            }
            "after_script" => {
                if let Some(lines) = read::<Lines>(key, value, &mut problems) {
                    after_script = lines.into();
                }
            }
            ignored if IGNORED_KEYS.contains(&ignored) => {
                log::warn!(key = ignored; "ignoring top-level key with no local effect");
            }
            hidden if hidden.starts_with('.') => {
                log::debug!(key = hidden; "skipping hidden job template");
            }
            name => {
                if let Some(raw) = read::<RawJob>(name, value, &mut problems) {
                    raw_jobs.push((name.to_string(), raw));
                }
            }
        }
    }

    let stages = stages.unwrap_or_else(|| DEFAULT_STAGES.iter().map(|s| s.to_string()).collect());
    if stages.is_empty() {
        problems.push(Problem::NoStages);
    }
    let mut seen = BTreeSet::new();
    for stage in stages.iter() {
        if !seen.insert(stage.as_str()) {
            problems.push(Problem::DuplicateStage(stage.clone()));
        }
    }
    if raw_jobs.is_empty() {
        problems.push(Problem::NoJobs);
    }

    let defaults = JobDefaults {
        stages: &stages,
        variables: &variables,
        before_script: &before_script,
        after_script: &after_script,
    };
    let jobs = raw_jobs
        .into_iter()
        .map(|(name, raw)| defaults.build_job(name, raw, &mut problems))
        .collect::<Vec<_>>();
    check_needs(&stages, &jobs, &mut problems);

    if !problems.is_empty() {
        return Err(Error::Invalid(problems));
    }
    Ok(Pipeline {
        stages,
        variables,
        jobs,
    })
}

/// Deserialize one entry of the document, recording a problem on failure.
fn read<T: DeserializeOwned>(location: &str, value: Value, problems: &mut Vec<Problem>) -> Option<T> {
    serde_yaml_ng::from_value(value)
        .map_err(|err| {
            problems.push(Problem::Malformed {
                location: location.to_string(),
                message: err.to_string(),
            })
        })
        .ok()
}

/// Renders a scalar YAML value the way a shell would see it.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        // The expanded form, `NAME: { value: ..., description: ... }`.
        Value::Mapping(map) => map.get("value").and_then(scalar),
        _ => None,
    }
}

fn scalar_variables(
    scope: &str,
    raw: BTreeMap<String, Value>,
    problems: &mut Vec<Problem>,
) -> BTreeMap<String, String> {
    let mut variables = BTreeMap::new();
    for (name, value) in raw {
        match scalar(&value) {
            Some(value) => {
                variables.insert(name, value);
            }
            None => problems.push(Problem::NonScalarVariable {
                scope: scope.to_string(),
                name,
            }),
        }
    }
    variables
}

fn patterns(job: &str, refs: RawRefs, problems: &mut Vec<Problem>) -> Vec<RefPattern> {
    Vec::<String>::from(refs)
        .into_iter()
        .filter_map(|text| {
            RefPattern::parse(&text)
                .map_err(|err| {
                    problems.push(Problem::InvalidPattern {
                        job: job.to_string(),
                        pattern: text.clone(),
                        message: err.to_string(),
                    })
                })
                .ok()
        })
        .collect()
}

/// The pipeline-level settings that jobs inherit.
struct JobDefaults<'a> {
    stages: &'a [String],
    variables: &'a BTreeMap<String, String>,
    before_script: &'a [String],
    after_script: &'a [String],
}

impl JobDefaults<'_> {
    fn build_job(&self, name: String, raw: RawJob, problems: &mut Vec<Problem>) -> Job {
        let stage = raw
            .stage
            .unwrap_or_else(|| DEFAULT_JOB_STAGE.to_string());
        if !self.stages.contains(&stage) {
            problems.push(Problem::UnknownStage {
                job: name.clone(),
                stage: stage.clone(),
            });
        }

        let condition = match (raw.only, raw.except) {
            (Some(_), Some(_)) => {
                problems.push(Problem::ConflictingFilters(name.clone()));
                BranchCondition::Always
            }
            (Some(only), None) => BranchCondition::Only(patterns(&name, only, problems)),
            (None, Some(except)) => BranchCondition::Except(patterns(&name, except, problems)),
            (None, None) => BranchCondition::Always,
        };

        let commands: Vec<String> = raw.script.map(Into::into).unwrap_or_default();
        if commands.is_empty() {
            problems.push(Problem::EmptyScript(name.clone()));
        }

        let mut variables = self.variables.clone();
        variables.extend(scalar_variables(&name, raw.variables, problems));

        Job {
            stage,
            tags: raw.tags.into_iter().collect(),
            condition,
            before_commands: raw
                .before_script
                .map(Into::into)
                .unwrap_or_else(|| self.before_script.to_vec()),
            commands,
            after_commands: raw
                .after_script
                .map(Into::into)
                .unwrap_or_else(|| self.after_script.to_vec()),
            variables,
            allow_failure: raw.allow_failure,
            needs: raw.needs,
            name,
        }
    }
}

/// Every `needs` entry must name a job in a strictly earlier stage.
fn check_needs(stages: &[String], jobs: &[Job], problems: &mut Vec<Problem>) {
    let stage_of = |stage: &str| stages.iter().position(|s| s == stage);
    for job in jobs.iter() {
        let Some(ref needs) = job.needs else {
            continue;
        };
        for need in needs.iter() {
            let Some(needed) = jobs.iter().find(|j| &j.name == need) else {
                problems.push(Problem::UnknownNeed {
                    job: job.name.clone(),
                    need: need.clone(),
                });
                continue;
            };
            match (stage_of(&needed.stage), stage_of(&job.stage)) {
                (Some(before), Some(after)) if before < after => {}
                // An undeclared stage has already been reported.
                (None, _) | (_, None) => {}
                _ => problems.push(Problem::NeedsLaterStage {
                    job: job.name.clone(),
                    need: need.clone(),
                }),
            }
        }
    }
}
