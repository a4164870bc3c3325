// Builtin verbs and the closed table they are registered in

mod basic;
mod command;
mod pipeline;

pub use basic::{Cat, IsEmpty, IsEqual, IsIn, IsOs, IsTrue, Sleep};
pub use command::{RunWatch, XArgs};
pub use pipeline::{
    BuildImages, CreateDeployments, GetFlag, IsDependency, PurgeDeployments, RunDefaultPipeline,
    RunDependencies, RunPipelines, StartDev, StopDev,
};

use crate::context::ExecContext;
use crate::error::DispatchError;
use crate::pipeline::Pipeline;
use crate::shell::ExecHandler;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Parser;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Verb that needs the enclosing pipeline
#[async_trait]
pub trait PipelineVerb: Send + Sync {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()>;
}

/// Verb usable from any script
#[async_trait]
pub trait BasicVerb: Send + Sync {
    async fn run(&self, ctx: &ExecContext, args: &[String]) -> Result<()>;
}

/// Verb that runs other commands through the dispatcher
#[async_trait]
pub trait CommandVerb: Send + Sync {
    async fn run(&self, ctx: &ExecContext, handler: &dyn ExecHandler, args: &[String]) -> Result<()>;
}

#[derive(Clone)]
pub enum VerbHandler {
    Pipeline(Arc<dyn PipelineVerb>),
    Basic(Arc<dyn BasicVerb>),
    Command(Arc<dyn CommandVerb>),
}

/// Name-to-handler table, validated when built
#[derive(Clone, Default)]
pub struct VerbTable {
    verbs: BTreeMap<String, VerbHandler>,
}

impl VerbTable {
    pub fn builder() -> VerbTableBuilder {
        VerbTableBuilder::default()
    }

    /// Table with every builtin verb
    pub fn standard() -> Result<Self, DispatchError> {
        Self::builder()
            .pipeline("build_images", BuildImages)
            .pipeline("create_deployments", CreateDeployments)
            .pipeline("purge_deployments", PurgeDeployments)
            .pipeline("start_dev", StartDev)
            .pipeline("stop_dev", StopDev)
            .pipeline("run_dependencies", RunDependencies)
            .pipeline("run_dependency_pipelines", RunDependencies)
            .pipeline("run_pipelines", RunPipelines)
            .pipeline("run_default_pipeline", RunDefaultPipeline)
            .pipeline("is_dependency", IsDependency)
            .pipeline("get_flag", GetFlag)
            .basic("is_equal", IsEqual)
            .basic("is_empty", IsEmpty)
            .basic("is_true", IsTrue)
            .basic("is_in", IsIn)
            .basic("is_os", IsOs)
            .basic("sleep", Sleep)
            .basic("cat", Cat)
            .command("xargs", XArgs)
            .command("run_watch", RunWatch::new())
            .build()
    }

    pub fn get(&self, name: &str) -> Option<&VerbHandler> {
        self.verbs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.verbs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }
}

#[derive(Default)]
pub struct VerbTableBuilder {
    entries: Vec<(String, VerbHandler)>,
}

impl VerbTableBuilder {
    pub fn pipeline<V: PipelineVerb + 'static>(mut self, name: &str, verb: V) -> Self {
        self.entries
            .push((name.to_string(), VerbHandler::Pipeline(Arc::new(verb))));
        self
    }

    pub fn basic<V: BasicVerb + 'static>(mut self, name: &str, verb: V) -> Self {
        self.entries
            .push((name.to_string(), VerbHandler::Basic(Arc::new(verb))));
        self
    }

    pub fn command<V: CommandVerb + 'static>(mut self, name: &str, verb: V) -> Self {
        self.entries
            .push((name.to_string(), VerbHandler::Command(Arc::new(verb))));
        self
    }

    pub fn build(self) -> Result<VerbTable, DispatchError> {
        let mut verbs = BTreeMap::new();
        for (name, handler) in self.entries {
            if !is_verb_name(&name) {
                return Err(DispatchError::InvalidVerbName(name));
            }
            if verbs.contains_key(&name) {
                return Err(DispatchError::DuplicateVerb(name));
            }
            verbs.insert(name, handler);
        }
        Ok(VerbTable { verbs })
    }
}

/// Lowercase identifier that cannot collide with the `__` escape prefix
fn is_verb_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Parse verb arguments with clap, using the verb name as the binary name
pub(crate) fn parse_args<T: Parser>(verb: &str, args: &[String]) -> Result<T> {
    let argv = std::iter::once(verb.to_string()).chain(args.iter().cloned());
    T::try_parse_from(argv).map_err(|err| anyhow!("{}", err.to_string().trim_end()))
}

/// Resolve the names a verb acts on from `--all`, `--except` and positionals
pub(crate) fn select_names<'a>(
    verb: &str,
    kind: &str,
    all: bool,
    except: &[String],
    names: &[String],
    available: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<String>> {
    let available: Vec<&String> = available.into_iter().collect();

    if all {
        return Ok(available
            .into_iter()
            .filter(|name| !except.contains(name))
            .cloned()
            .collect());
    }

    if names.is_empty() {
        return Err(anyhow!(
            "either specify '{} --all' or '{} {}1 {}2'",
            verb,
            verb,
            kind,
            kind
        ));
    }

    for name in names {
        if !available.contains(&name) {
            return Err(anyhow!("couldn't find {} {}", kind, name));
        }
    }
    Ok(names.to_vec())
}
