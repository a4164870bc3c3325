// Command resolution for job scripts: functions, verbs, executables, fallback tools

mod process;
pub mod verbs;

pub use verbs::{BasicVerb, CommandVerb, PipelineVerb, VerbHandler, VerbTable, VerbTableBuilder};

use crate::context::ExecContext;
use crate::error::{DispatchError, ExitStatus};
use crate::pipeline::Pipeline;
use crate::shell::{ExecHandler, ScriptInterpreter, NOT_FOUND_STATUS, CANCELLED_STATUS};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Command name that refers back to this binary
pub const SELF_COMMAND: &str = "devflow";

/// Fetches well-known tools that are missing from `PATH`
#[async_trait]
pub trait ToolInstaller: Send + Sync {
    fn provides(&self, name: &str) -> bool;

    /// Make the tool available locally and return its path
    async fn install(&self, name: &str) -> Result<PathBuf>;
}

/// Everything needed to execute scripts, shared by all pipelines of a run
#[derive(Clone)]
pub struct ScriptRuntime {
    pub interpreter: Arc<dyn ScriptInterpreter>,
    pub verbs: Arc<VerbTable>,
    pub installer: Option<Arc<dyn ToolInstaller>>,
}

/// Resolves each command a script runs.
///
/// Lookup order: project functions, pipeline verbs and verbs that run
/// other commands, the `devflow` self reference, executables on `PATH`,
/// basic verbs, fallback tools. A `__` prefix forces verb lookup for
/// names shadowed by executables.
pub struct ExecDispatcher {
    runtime: ScriptRuntime,
    functions: Arc<BTreeMap<String, String>>,
    pipeline: Option<Arc<Pipeline>>,
    /// Status and message of the verb that failed most recently
    last_failure: Mutex<Option<(i32, String)>>,
}

impl ExecDispatcher {
    pub fn new(
        runtime: ScriptRuntime,
        functions: Arc<BTreeMap<String, String>>,
        pipeline: Option<Arc<Pipeline>>,
    ) -> Self {
        Self {
            runtime,
            functions,
            pipeline,
            last_failure: Mutex::new(None),
        }
    }

    /// Run a script body with this dispatcher as the command hook
    pub async fn run_script(&self, script: &str, args: &[String], ctx: &ExecContext) -> Result<i32> {
        self.clear_failure();
        self.runtime.interpreter.run(script, args, ctx, self).await
    }

    /// Error describing a non-zero script status.
    ///
    /// The failed verb is named only when it was the last command and
    /// its status is the one the script ended with.
    pub fn failure(&self, status: i32) -> anyhow::Error {
        let err = anyhow::Error::new(ExitStatus(status));
        match self.last_failure.lock().unwrap().take() {
            Some((failed, message)) if failed == status => err.context(message),
            _ => err,
        }
    }

    fn clear_failure(&self) {
        self.last_failure.lock().unwrap().take();
    }

    fn finish_verb(&self, name: &str, ctx: &ExecContext, result: Result<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(err) => {
                if let Some(status) = ExitStatus::of(&err) {
                    return status;
                }
                let message = format!("{}: {:#}", name, err);
                tracing::debug!(verb = %name, "Verb failed: {:#}", err);
                ctx.stderr.write_line(message.clone());
                *self.last_failure.lock().unwrap() = Some((1, message));
                1
            }
        }
    }
}

#[async_trait]
impl ExecHandler for ExecDispatcher {
    async fn exec(&self, ctx: &ExecContext, argv: &[String]) -> Result<i32> {
        let Some((name, args)) = argv.split_first() else {
            return Ok(0);
        };
        // A later command supersedes any earlier verb failure
        self.clear_failure();
        if ctx.is_cancelled() {
            return Ok(CANCELLED_STATUS);
        }

        if let Some(body) = self.functions.get(name) {
            tracing::debug!(function = %name, "Running function");
            return self.run_script(body, args, ctx).await;
        }

        let (verb_name, forced) = match name.strip_prefix("__") {
            Some(stripped) => (stripped, true),
            None => (name.as_str(), false),
        };

        match self.runtime.verbs.get(verb_name) {
            Some(VerbHandler::Pipeline(verb)) => {
                let Some(pipeline) = &self.pipeline else {
                    return Err(DispatchError::NotInPipeline(verb_name.to_string()).into());
                };
                tracing::debug!(verb = %verb_name, pipeline = %pipeline.name(), "Running verb");
                let result = verb.run(ctx, pipeline, args).await;
                return Ok(self.finish_verb(verb_name, ctx, result));
            }
            Some(VerbHandler::Command(verb)) => {
                tracing::debug!(verb = %verb_name, "Running verb");
                let result = verb.run(ctx, self, args).await;
                return Ok(self.finish_verb(verb_name, ctx, result));
            }
            Some(VerbHandler::Basic(verb)) if forced => {
                let result = verb.run(ctx, args).await;
                return Ok(self.finish_verb(verb_name, ctx, result));
            }
            _ => {}
        }

        let program = if name == SELF_COMMAND {
            std::env::current_exe().ok()
        } else {
            process::resolve_executable(name, ctx)
        };
        if let Some(program) = program {
            return process::run(&program, args, ctx).await;
        }

        if let Some(VerbHandler::Basic(verb)) = self.runtime.verbs.get(verb_name) {
            let result = verb.run(ctx, args).await;
            return Ok(self.finish_verb(verb_name, ctx, result));
        }

        if let Some(installer) = self.runtime.installer.as_ref().filter(|i| i.provides(name)) {
            return match installer.install(name).await {
                Ok(path) => process::run(&path, args, ctx).await,
                Err(err) => {
                    ctx.stderr
                        .write_line(format!("{}: unable to install: {:#}", name, err));
                    Ok(NOT_FOUND_STATUS)
                }
            };
        }

        ctx.stderr.write_line(format!("{}: command not found", name));
        Ok(NOT_FOUND_STATUS)
    }
}
