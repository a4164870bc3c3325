use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for one run of the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job within one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Declared properties of one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Script body executed by the shell interpreter
    #[serde(default)]
    pub run: String,
    /// Jobs that must reach a terminal state before this one starts
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun: Option<RerunPolicy>,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Re-execution policy for a failing job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_backoff_secs() -> u64 {
    1
}

/// One named pipeline: a root job plus named sub-jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub job: JobConfig,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
    #[serde(default)]
    pub flags: Vec<PipelineFlag>,
}

impl PipelineDefinition {
    /// Single-job pipeline running the given script
    pub fn script(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job: JobConfig {
                run: run.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Flag values with defaults applied, then overridden by `name=value` pairs
    pub fn resolve_flags(&self, overrides: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
        let mut flags = BTreeMap::new();
        for flag in &self.flags {
            let value = flag
                .default
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
            flags.insert(flag.name.clone(), value);
        }

        for raw in overrides {
            let (name, value) = raw.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("error parsing flag {}: expected format flag=value", raw)
            })?;
            flags.insert(name.to_string(), value.to_string());
        }

        Ok(flags)
    }
}

/// A pipeline flag with an optional default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFlag {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FlagValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl std::fmt::Display for FlagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{}", b),
            FlagValue::Integer(i) => write!(f, "{}", i),
            FlagValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Everything one project declares
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineDefinition>,
    /// Named script snippets callable as commands
    #[serde(default)]
    pub functions: BTreeMap<String, String>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageConfig>,
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploymentConfig>,
    #[serde(default)]
    pub dev: BTreeMap<String, DevConfig>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySpec>,
}

impl ProjectConfig {
    /// Pipeline definition by name, with the name filled in
    pub fn pipeline(&self, name: &str) -> Option<PipelineDefinition> {
        self.pipelines.get(name).map(|p| {
            let mut definition = p.clone();
            if definition.name.is_empty() {
                definition.name = name.to_string();
            }
            definition
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub build: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub deploy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purge: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevConfig {
    #[serde(default)]
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
}

/// A sub-project this project depends on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Working directory, relative to the parent's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Pipeline to run for this dependency (defaults to `deploy`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub project: ProjectConfig,
}
