// Shared fakes for unit tests

use crate::collaborators::{
    BuildOptions, CollaboratorFactory, Collaborators, DeployOptions, Deployer, DevManager,
    ImageBuilder, PurgeOptions,
};
use crate::context::{ExecContext, OutputSink};
use crate::dispatch::{BasicVerb, PipelineVerb, ScriptRuntime, VerbTable};
use crate::pipeline::{Engine, Pipeline};
use crate::registry::{DependencyRegistry, ExcludePayload, PeerClient, PingPayload};
use crate::shell::ShellInterpreter;
use crate::supervisor::Supervisor;
use crate::types::{ProjectConfig, RunId};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Context with captured stdout and stderr
pub fn create_test_context() -> (ExecContext, UnboundedReceiver<String>, UnboundedReceiver<String>) {
    let (stdout, stdout_lines) = OutputSink::channel();
    let (stderr, stderr_lines) = OutputSink::channel();
    let ctx = ExecContext::from_process(RunId::new(), std::env::temp_dir(), Supervisor::new())
        .with_output(stdout, stderr);
    (ctx, stdout_lines, stderr_lines)
}

pub fn create_test_engine(
    verbs: VerbTable,
    registry: Arc<DependencyRegistry>,
    collaborators: RecordingCollaborators,
) -> Arc<Engine> {
    Arc::new(Engine {
        runtime: ScriptRuntime {
            interpreter: Arc::new(ShellInterpreter::new()),
            verbs: Arc::new(verbs),
            installer: None,
        },
        registry,
        collaborators: Arc::new(collaborators),
    })
}

/// Offline root pipeline for project `app`
pub fn create_test_pipeline(verbs: VerbTable) -> (Arc<Pipeline>, Arc<DependencyRegistry>) {
    let registry = Arc::new(DependencyRegistry::offline(RunId::new(), "app"));
    let engine = create_test_engine(verbs, registry.clone(), RecordingCollaborators::default());
    let project = ProjectConfig {
        name: "app".to_string(),
        ..Default::default()
    };
    (Pipeline::new(project, engine, Supervisor::new()), registry)
}

/// Offline root pipeline with the standard verbs and recorded collaborators
pub fn create_test_pipeline_with(project: ProjectConfig, collaborators: RecordingCollaborators) -> Arc<Pipeline> {
    let registry = Arc::new(DependencyRegistry::offline(RunId::new(), project.name.clone()));
    let verbs = VerbTable::standard().unwrap();
    let engine = create_test_engine(verbs, registry, collaborators);
    Pipeline::new(project, engine, Supervisor::new())
}

/// Verb recording its arguments and the flags it saw, optionally failing
#[derive(Clone, Default)]
pub struct RecordingVerb {
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    flags: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
    failures: Arc<Mutex<usize>>,
    message: Option<String>,
}

impl RecordingVerb {
    pub fn failing(message: &str) -> Self {
        Self::failing_times(usize::MAX, message)
    }

    pub fn failing_times(times: usize, message: &str) -> Self {
        Self {
            failures: Arc::new(Mutex::new(times)),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn flags(&self) -> Vec<BTreeMap<String, String>> {
        self.flags.lock().unwrap().clone()
    }

    fn record(&self, ctx: &ExecContext, args: &[String]) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(args.to_vec());
        self.flags.lock().unwrap().push(ctx.flags.as_ref().clone());

        let mut failures = self.failures.lock().unwrap();
        match &self.message {
            Some(message) if *failures > 0 => {
                *failures -= 1;
                Err(anyhow!("{}", message))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PipelineVerb for RecordingVerb {
    async fn run(&self, ctx: &ExecContext, _pipeline: &Arc<Pipeline>, args: &[String]) -> anyhow::Result<()> {
        self.record(ctx, args)
    }
}

#[async_trait]
impl BasicVerb for RecordingVerb {
    async fn run(&self, ctx: &ExecContext, args: &[String]) -> anyhow::Result<()> {
        self.record(ctx, args)
    }
}

/// Collaborators that only log what they were asked to do
#[derive(Clone, Default)]
pub struct RecordingCollaborators {
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingCollaborators {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CollaboratorFactory for RecordingCollaborators {
    fn create(&self, _project: &ProjectConfig, _runtime: &ScriptRuntime, _scope: &Supervisor) -> Collaborators {
        let shared = Arc::new(self.clone());
        Collaborators {
            images: shared.clone(),
            deployer: shared.clone(),
            dev: shared,
        }
    }
}

#[async_trait]
impl ImageBuilder for RecordingCollaborators {
    async fn build(&self, _ctx: &ExecContext, names: &[String], options: &BuildOptions) -> anyhow::Result<()> {
        self.push(format!("build {} skip_push={}", names.join(","), options.skip_push));
        Ok(())
    }
}

#[async_trait]
impl Deployer for RecordingCollaborators {
    async fn deploy(&self, _ctx: &ExecContext, names: &[String], _options: &DeployOptions) -> anyhow::Result<()> {
        self.push(format!("deploy {}", names.join(",")));
        Ok(())
    }

    async fn purge(&self, _ctx: &ExecContext, names: &[String], _options: &PurgeOptions) -> anyhow::Result<()> {
        self.push(format!("purge {}", names.join(",")));
        Ok(())
    }
}

#[async_trait]
impl DevManager for RecordingCollaborators {
    async fn start_multiple(&self, _ctx: &ExecContext, names: &[String]) -> anyhow::Result<()> {
        self.push(format!("start {}", names.join(",")));
        Ok(())
    }

    async fn reset(&self, _ctx: &ExecContext, names: &[String]) -> anyhow::Result<()> {
        self.push(format!("reset {}", names.join(",")));
        Ok(())
    }

    fn stop(&self, names: &[String]) {
        self.push(format!("stop {}", names.join(",")));
    }

    fn list(&self) -> Vec<String> {
        Vec::new()
    }

    async fn wait(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Peer client answering from a fixed set of live servers
#[derive(Default)]
pub struct RecordingPeers {
    alive: HashSet<String>,
    release: bool,
    exclude_fails: bool,
    ping_delay: Option<Duration>,
    exclude_delay: Option<Duration>,
    pings: Mutex<Vec<PingPayload>>,
    excludes: Mutex<Vec<ExcludePayload>>,
}

impl RecordingPeers {
    pub fn alive(mut self, server: &str) -> Self {
        self.alive.insert(server.to_string());
        self
    }

    pub fn releasing(mut self, release: bool) -> Self {
        self.release = release;
        self
    }

    pub fn failing_exclude(mut self) -> Self {
        self.exclude_fails = true;
        self
    }

    /// Every ping answers only after `delay`
    pub fn slow_ping(mut self, delay: Duration) -> Self {
        self.ping_delay = Some(delay);
        self
    }

    /// Every exclude request answers only after `delay`
    pub fn slow_exclude(mut self, delay: Duration) -> Self {
        self.exclude_delay = Some(delay);
        self
    }

    pub fn ping_count(&self) -> usize {
        self.pings.lock().unwrap().len()
    }

    pub fn exclude_count(&self) -> usize {
        self.excludes.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerClient for RecordingPeers {
    async fn ping(&self, server: &str, payload: &PingPayload) -> anyhow::Result<bool> {
        self.pings.lock().unwrap().push(payload.clone());
        if let Some(delay) = self.ping_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.alive.contains(server))
    }

    async fn exclude_dependency(
        &self,
        server: &str,
        payload: &ExcludePayload,
    ) -> anyhow::Result<bool> {
        self.excludes.lock().unwrap().push(payload.clone());
        if let Some(delay) = self.exclude_delay {
            tokio::time::sleep(delay).await;
        }
        if self.exclude_fails {
            return Err(anyhow!("connection reset by {}", server));
        }
        Ok(self.release)
    }
}
