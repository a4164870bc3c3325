use crate::collaborators::{CollaboratorFactory, Collaborators};
use crate::context::{ExecContext, OutputSink, Stream};
use crate::dispatch::ScriptRuntime;
use crate::pipeline::{defaults, GraphBuilder, PipelineRunner};
use crate::registry::{Claim, DependencyRegistry};
use crate::supervisor::Supervisor;
use crate::types::{PipelineDefinition, ProjectConfig};
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};

/// How long to look for a dependency pipeline another pipeline of this run is starting
const DEPENDENCY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);
const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Services shared by every pipeline of a run
pub struct Engine {
    pub runtime: ScriptRuntime,
    pub registry: Arc<DependencyRegistry>,
    pub collaborators: Arc<dyn CollaboratorFactory>,
}

/// Options of `run_dependencies`
#[derive(Debug, Clone, Default)]
pub struct DependencyOptions {
    pub names: Vec<String>,
    pub all: bool,
    /// Pipeline to run instead of each dependency's configured one
    pub pipeline: Option<String>,
    pub sequential: bool,
    pub exclude: Vec<String>,
    pub set_flags: Vec<String>,
}

/// Options of `run_pipelines`
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub background: bool,
    pub sequential: bool,
    pub set_flags: Vec<String>,
}

/// One project's pipelines within a run: the root project or a dependency.
///
/// Verbs reach the rest of the engine through this handle. Dependency
/// pipelines form a tree below the root, each owning a scope nested in
/// its parent's.
pub struct Pipeline {
    name: String,
    project: ProjectConfig,
    functions: Arc<BTreeMap<String, String>>,
    engine: Arc<Engine>,
    parent: Option<Weak<Pipeline>>,
    collaborators: Collaborators,
    supervisor: Supervisor,
    dependencies: Mutex<BTreeMap<String, Arc<Pipeline>>>,
    running: Mutex<HashSet<String>>,
    done: watch::Sender<bool>,
    excluded: OnceCell<Result<(), String>>,
}

/// Marks a pipeline definition as running until dropped
struct RunningGuard {
    pipeline: Arc<Pipeline>,
    name: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.pipeline.running.lock().unwrap().remove(&self.name);
    }
}

impl Pipeline {
    /// Root pipeline of a run; `supervisor` bounds everything it starts
    pub fn new(project: ProjectConfig, engine: Arc<Engine>, supervisor: Supervisor) -> Arc<Self> {
        let name = project.name.clone();
        Self::build(name, project, engine, None, supervisor)
    }

    fn build(
        name: String,
        project: ProjectConfig,
        engine: Arc<Engine>,
        parent: Option<Weak<Pipeline>>,
        supervisor: Supervisor,
    ) -> Arc<Self> {
        let collaborators = engine
            .collaborators
            .create(&project, &engine.runtime, &supervisor);
        let (done, _) = watch::channel(false);

        Arc::new(Self {
            name,
            functions: Arc::new(project.functions.clone()),
            project,
            engine,
            parent,
            collaborators,
            supervisor,
            dependencies: Mutex::new(BTreeMap::new()),
            running: Mutex::new(HashSet::new()),
            done,
            excluded: OnceCell::new(),
        })
    }

    /// Project name for the root, dependency name otherwise
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    pub fn functions(&self) -> Arc<BTreeMap<String, String>> {
        self.functions.clone()
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.engine.runtime
    }

    pub fn registry(&self) -> &Arc<DependencyRegistry> {
        &self.engine.registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn is_dependency(&self) -> bool {
        self.parent.is_some()
    }

    pub fn parent(&self) -> Option<Arc<Pipeline>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Top of the pipeline tree
    pub fn root(self: &Arc<Self>) -> Arc<Pipeline> {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Dependency pipelines started directly by this one
    pub fn dependencies(&self) -> Vec<Arc<Pipeline>> {
        self.dependencies.lock().unwrap().values().cloned().collect()
    }

    /// Search the tree below this pipeline for a dependency pipeline
    pub fn find_dependency(&self, name: &str) -> Option<Arc<Pipeline>> {
        let children = self.dependencies();
        if let Some(found) = children.iter().find(|child| child.name == name) {
            return Some(found.clone());
        }
        children.iter().find_map(|child| child.find_dependency(name))
    }

    /// Whether the main run of this pipeline has finished
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Definition by name: the project's own pipelines win over the defaults
    pub fn definition(&self, name: &str) -> Result<PipelineDefinition> {
        self.project
            .pipeline(name)
            .or_else(|| defaults::pipeline(name))
            .ok_or_else(|| anyhow!("couldn't find pipeline {}", name))
    }

    /// Main run of this pipeline; waiting dependents are released when it ends
    pub async fn run(self: &Arc<Self>, ctx: &ExecContext, pipeline: &str, set_flags: &[String]) -> Result<()> {
        let result: Result<()> = async {
            let definition = self.definition(pipeline)?;
            let guard = self.claim_run(&definition.name)?;
            self.run_claimed(ctx, &definition, set_flags, guard).await
        }
        .await;

        self.done.send_replace(true);
        result
    }

    fn claim_run(self: &Arc<Self>, name: &str) -> Result<RunningGuard> {
        if !self.running.lock().unwrap().insert(name.to_string()) {
            return Err(anyhow!("pipeline {} is already running", name));
        }
        Ok(RunningGuard {
            pipeline: self.clone(),
            name: name.to_string(),
        })
    }

    async fn run_claimed(
        self: &Arc<Self>,
        ctx: &ExecContext,
        definition: &PipelineDefinition,
        set_flags: &[String],
        _guard: RunningGuard,
    ) -> Result<()> {
        let flags = definition
            .resolve_flags(set_flags)
            .with_context(|| format!("pipeline {}", definition.name))?;
        let graph = GraphBuilder::build(definition)
            .with_context(|| format!("pipeline {}", definition.name))?;

        tracing::info!(
            pipeline = %self.name,
            "Run pipeline {} ({} jobs)",
            definition.name,
            graph.len()
        );
        let runner = PipelineRunner::new(self.clone(), Arc::new(graph));
        runner
            .run(&ctx.with_flags(flags), &[])
            .await
            .with_context(|| format!("run pipeline {}", definition.name))
    }

    /// `run_pipelines`: run other pipelines of this project
    pub async fn start_new_pipelines(
        self: &Arc<Self>,
        ctx: &ExecContext,
        names: &[String],
        options: PipelineOptions,
    ) -> Result<()> {
        let mut runs = Vec::with_capacity(names.len());
        for name in names {
            let definition = self.definition(name)?;
            let guard = self.claim_run(&definition.name)?;
            runs.push((definition, guard));
        }

        if options.background {
            for (definition, guard) in runs {
                let label: Arc<str> = Arc::from(format!("{}:{}", self.name, definition.name));
                let bg_ctx = ctx.with_supervisor(self.supervisor.clone()).with_output(
                    OutputSink::log(label.clone(), Stream::Stdout),
                    OutputSink::log(label, Stream::Stderr),
                );
                let pipeline = self.clone();
                let set_flags = options.set_flags.clone();

                tracing::info!(pipeline = %self.name, "Start pipeline {} in background", definition.name);
                self.supervisor
                    .spawn(format!("pipeline:{}", definition.name), async move {
                        if let Err(err) = pipeline
                            .run_claimed(&bg_ctx, &definition, &set_flags, guard)
                            .await
                        {
                            tracing::error!(pipeline = %pipeline.name, "{:#}", err);
                        }
                        Ok(())
                    });
            }
            return Ok(());
        }

        if options.sequential {
            for (definition, guard) in runs {
                self.run_claimed(ctx, &definition, &options.set_flags, guard)
                    .await?;
            }
            return Ok(());
        }

        let scope = ctx.supervisor.child();
        for (definition, guard) in runs {
            let pipeline = self.clone();
            let run_ctx = ctx.with_supervisor(scope.clone());
            let set_flags = options.set_flags.clone();
            scope.spawn(format!("pipeline:{}", definition.name), async move {
                pipeline
                    .run_claimed(&run_ctx, &definition, &set_flags, guard)
                    .await
            });
        }
        scope.wait().await
    }

    /// `run_default_pipeline`: run the built-in definition even if the project overrides it
    pub async fn run_default_pipeline(self: &Arc<Self>, ctx: &ExecContext, name: &str) -> Result<()> {
        let definition =
            defaults::pipeline(name).ok_or_else(|| anyhow!("couldn't find default pipeline {}", name))?;
        let guard = self.claim_run(&format!("{}(default)", name))?;
        self.run_claimed(ctx, &definition, &[], guard).await
    }

    /// `run_dependencies`: claim dependencies and run the ones this run now owns
    pub async fn start_new_dependencies(
        self: &Arc<Self>,
        ctx: &ExecContext,
        options: DependencyOptions,
    ) -> Result<()> {
        let selected = self.select_dependencies(&options)?;
        if selected.is_empty() {
            tracing::debug!(pipeline = %self.name, "No dependencies to run");
            return Ok(());
        }

        let claims = self
            .registry()
            .claim_dependencies(&self.name, &selected, false)
            .await
            .context("check if dependencies can be deployed")?;

        let mut start = Vec::new();
        let mut wait = Vec::new();
        for (name, claim) in claims {
            match claim {
                Claim::Owned => start.push(name),
                Claim::AlreadyOwned => wait.push(name),
                Claim::OwnedByOtherInstance => {
                    tracing::info!(
                        dependency = %name,
                        "Skipping dependency {} because it was already deployed by another session",
                        name
                    );
                }
                Claim::Cyclic => {
                    tracing::info!(
                        dependency = %name,
                        "Skipping dependency {} because it would create a dependency cycle",
                        name
                    );
                }
            }
        }

        if options.sequential {
            for name in &start {
                self.start_new_dependency(ctx, name, &options).await?;
            }
            for name in &wait {
                self.wait_for_dependency(ctx, name).await?;
            }
            return Ok(());
        }

        let scope = ctx.supervisor.child();
        let scoped_ctx = ctx.with_supervisor(scope.clone());
        for name in start {
            let pipeline = self.clone();
            let ctx = scoped_ctx.clone();
            let options = options.clone();
            scope.spawn(format!("dependency:{}", name), async move {
                pipeline.start_new_dependency(&ctx, &name, &options).await
            });
        }
        for name in wait {
            let pipeline = self.clone();
            let ctx = scoped_ctx.clone();
            scope.spawn(format!("wait:{}", name), async move {
                pipeline.wait_for_dependency(&ctx, &name).await
            });
        }
        scope.wait().await
    }

    fn select_dependencies(&self, options: &DependencyOptions) -> Result<Vec<String>> {
        let dependencies = &self.project.dependencies;

        if options.all {
            return Ok(dependencies
                .iter()
                .filter(|(name, spec)| !spec.disabled && !options.exclude.contains(name))
                .map(|(name, _)| name.clone())
                .collect());
        }

        let mut selected = Vec::with_capacity(options.names.len());
        for name in &options.names {
            let spec = dependencies
                .get(name)
                .ok_or_else(|| anyhow!("couldn't find dependency {}", name))?;
            if spec.disabled {
                return Err(anyhow!("dependency {} is disabled", name));
            }
            if !options.exclude.contains(name) {
                selected.push(name.clone());
            }
        }
        Ok(selected)
    }

    async fn start_new_dependency(
        self: &Arc<Self>,
        ctx: &ExecContext,
        name: &str,
        options: &DependencyOptions,
    ) -> Result<()> {
        let spec = self
            .project
            .dependencies
            .get(name)
            .ok_or_else(|| anyhow!("couldn't find dependency {}", name))?;

        let mut project = spec.project.clone();
        if project.name.is_empty() {
            project.name = name.to_string();
        }
        let pipeline_name = options
            .pipeline
            .clone()
            .or_else(|| spec.pipeline.clone())
            .unwrap_or_else(|| "deploy".to_string());

        let dependency = Pipeline::build(
            name.to_string(),
            project,
            self.engine.clone(),
            Some(Arc::downgrade(self)),
            self.supervisor.child(),
        );
        self.dependencies
            .lock()
            .unwrap()
            .insert(name.to_string(), dependency.clone());

        tracing::info!(dependency = %name, "Run pipeline {} of dependency {}", pipeline_name, name);
        let dependency_ctx = ctx.as_dependency(spec.path.as_deref());
        dependency
            .run(&dependency_ctx, &pipeline_name, &options.set_flags)
            .await
            .with_context(|| format!("dependency {}", name))
    }

    /// Wait for a dependency pipeline started elsewhere in this run
    async fn wait_for_dependency(self: &Arc<Self>, ctx: &ExecContext, name: &str) -> Result<()> {
        let root = self.root();
        let deadline = tokio::time::Instant::now() + DEPENDENCY_LOOKUP_TIMEOUT;

        let dependency = loop {
            if let Some(dependency) = root.find_dependency(name) {
                break dependency;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(dependency = %name, "Dependency pipeline not found, not waiting for it");
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(DEPENDENCY_POLL_INTERVAL) => {}
                _ = ctx.supervisor.cancelled() => {
                    return Err(anyhow!("cancelled while waiting for dependency {}", name));
                }
            }
        };

        tracing::debug!(dependency = %name, "Waiting for dependency {}", name);
        let mut done = dependency.done.subscribe();
        tokio::select! {
            _ = done.wait_for(|done| *done) => Ok(()),
            _ = ctx.supervisor.cancelled() => {
                Err(anyhow!("cancelled while waiting for dependency {}", name))
            }
        }
    }

    /// Claim the root project name with forced takeover, once per run
    pub async fn exclude(self: &Arc<Self>) -> Result<()> {
        let root = self.root();
        let outcome = root
            .excluded
            .get_or_init(|| async {
                let registry = root.registry();
                let name = root.name.clone();
                match registry
                    .claim_dependencies(&name, std::slice::from_ref(&name), true)
                    .await
                {
                    Ok(claims) if claims.get(&name).is_some_and(Claim::is_owned) => Ok(()),
                    Ok(_) => Err(format!(
                        "another session for project {} is already running in this namespace",
                        name
                    )),
                    Err(err) => Err(format!("exclude project {}: {:#}", name, err)),
                }
            })
            .await;

        outcome.clone().map_err(|message| anyhow!(message))
    }

    /// Wait for the dev sessions of the dependencies, then for this pipeline's own
    pub fn wait_dev(self: &Arc<Self>) -> BoxFuture<'_, Result<()>> {
        async move {
            for dependency in self.dependencies() {
                dependency.wait_dev().await?;
            }
            self.collaborators.dev.wait().await
        }
        .boxed()
    }

    /// Stop everything this pipeline started in the background
    pub fn close(&self) {
        self.supervisor.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::VerbTable;
    use crate::registry::{ClaimPolicy, MemoryOwnershipStore, OwnershipRecord, OwnershipStore, PeerClient};
    use crate::testing::{
        create_test_context, create_test_engine, RecordingCollaborators, RecordingPeers, RecordingVerb,
    };
    use crate::types::{DependencySpec, FlagValue, PipelineFlag, RunId};

    fn dependency(run: &str) -> DependencySpec {
        DependencySpec {
            project: ProjectConfig {
                pipelines: BTreeMap::from([(
                    "deploy".to_string(),
                    PipelineDefinition::script("deploy", run),
                )]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn create_test_project(run: &str, dependencies: Vec<(&str, DependencySpec)>) -> ProjectConfig {
        ProjectConfig {
            name: "app".to_string(),
            pipelines: BTreeMap::from([(
                "deploy".to_string(),
                PipelineDefinition::script("deploy", run),
            )]),
            dependencies: dependencies
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
            ..Default::default()
        }
    }

    fn create_offline_pipeline(project: ProjectConfig, verbs: VerbTable) -> Arc<Pipeline> {
        let registry = Arc::new(DependencyRegistry::offline(RunId::new(), project.name.clone()));
        let engine = create_test_engine(verbs, registry, RecordingCollaborators::default());
        Pipeline::new(project, engine, Supervisor::new())
    }

    fn record_verbs(recording: &RecordingVerb) -> VerbTable {
        use crate::dispatch::verbs::{GetFlag, IsDependency, RunDependencies, RunPipelines};

        VerbTable::builder()
            .pipeline("record", recording.clone())
            .pipeline("run_dependencies", RunDependencies)
            .pipeline("run_pipelines", RunPipelines)
            .pipeline("get_flag", GetFlag)
            .pipeline("is_dependency", IsDependency)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dependencies_run_before_the_rest_of_the_job() {
        let recording = RecordingVerb::default();
        let project = create_test_project(
            "run_dependencies --all && record app",
            vec![
                ("api", dependency("is_dependency && record api")),
                ("db", dependency("record db")),
                (
                    "off",
                    DependencySpec {
                        disabled: true,
                        ..dependency("record off")
                    },
                ),
            ],
        );
        let pipeline = create_offline_pipeline(project, record_verbs(&recording));
        let (ctx, _out, _err) = create_test_context();

        pipeline.run(&ctx, "deploy", &[]).await.unwrap();

        let calls = recording.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.last(), Some(&vec!["app".to_string()]));
        assert!(calls.contains(&vec!["api".to_string()]));
        assert!(calls.contains(&vec!["db".to_string()]));

        let api = pipeline.find_dependency("api").unwrap();
        assert!(api.is_dependency());
        assert!(api.is_done());
        assert!(Arc::ptr_eq(&api.root(), &pipeline));
        assert!(pipeline.is_done());
    }

    #[tokio::test]
    async fn test_disabled_or_unknown_dependency_is_an_error() {
        let project = create_test_project(
            "true",
            vec![(
                "off",
                DependencySpec {
                    disabled: true,
                    ..dependency("true")
                },
            )],
        );
        let pipeline = create_offline_pipeline(project, VerbTable::standard().unwrap());
        let (ctx, _out, _err) = create_test_context();

        let err = pipeline
            .start_new_dependencies(
                &ctx,
                DependencyOptions {
                    names: vec!["off".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "dependency off is disabled");

        let err = pipeline
            .start_new_dependencies(
                &ctx,
                DependencyOptions {
                    names: vec!["nope".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "couldn't find dependency nope");
    }

    #[tokio::test]
    async fn test_shared_dependency_runs_once() {
        let recording = RecordingVerb::default();
        let mut api = dependency("run_dependencies db && record api");
        api.project.dependencies.insert("db".to_string(), dependency("record db"));
        let mut web = dependency("run_dependencies db && record web");
        web.project.dependencies.insert("db".to_string(), dependency("record db"));

        let project = create_test_project(
            "run_dependencies --sequential api web",
            vec![("api", api), ("web", web)],
        );
        let pipeline = create_offline_pipeline(project, record_verbs(&recording));
        let (ctx, _out, _err) = create_test_context();

        pipeline.run(&ctx, "deploy", &[]).await.unwrap();

        let calls: Vec<String> = recording.calls().into_iter().map(|c| c.join(" ")).collect();
        assert_eq!(calls, vec!["db", "api", "web"]);
    }

    #[tokio::test]
    async fn test_cyclic_dependency_is_skipped() {
        let recording = RecordingVerb::default();
        let mut api = dependency("run_dependencies app && record api");
        api.project.dependencies.insert("app".to_string(), dependency("record cycle"));

        let project = create_test_project("run_dependencies api", vec![("api", api)]);
        let pipeline = create_offline_pipeline(project, record_verbs(&recording));
        pipeline.exclude().await.unwrap();
        let (ctx, _out, _err) = create_test_context();

        pipeline.run(&ctx, "deploy", &[]).await.unwrap();

        assert_eq!(recording.calls(), vec![vec!["api".to_string()]]);
    }

    #[tokio::test]
    async fn test_dependency_pipeline_selection() {
        let recording = RecordingVerb::default();
        let mut api = dependency("record deploy");
        api.project.pipelines.insert(
            "build".to_string(),
            PipelineDefinition::script("build", "record build"),
        );
        api.pipeline = Some("build".to_string());
        let project = create_test_project(
            "run_dependencies api && run_dependencies --pipeline deploy --all",
            vec![("api", api)],
        );
        let pipeline = create_offline_pipeline(project, record_verbs(&recording));
        let (ctx, _out, _err) = create_test_context();

        pipeline.run(&ctx, "deploy", &[]).await.unwrap();

        // The second call finds api already owned by this run and only waits
        assert_eq!(recording.calls(), vec![vec!["build".to_string()]]);
    }

    #[tokio::test]
    async fn test_flags_reach_nested_pipelines() {
        let recording = RecordingVerb::default();
        let mut project = create_test_project("run_pipelines --set-flag tier=gold report", vec![]);
        project.pipelines.insert(
            "report".to_string(),
            PipelineDefinition {
                flags: vec![
                    PipelineFlag {
                        name: "tier".to_string(),
                        default: Some(FlagValue::Text("free".to_string())),
                    },
                    PipelineFlag {
                        name: "verbose".to_string(),
                        default: Some(FlagValue::Bool(false)),
                    },
                ],
                ..PipelineDefinition::script("report", "get_flag tier && record report")
            },
        );
        let pipeline = create_offline_pipeline(project, record_verbs(&recording));
        let (ctx, _out, _err) = create_test_context();

        pipeline.run(&ctx, "deploy", &[]).await.unwrap();

        let flags = recording.flags();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0]["tier"], "gold");
        assert_eq!(flags[0]["verbose"], "false");
    }

    #[tokio::test]
    async fn test_malformed_flag_override_is_an_error() {
        let pipeline = create_offline_pipeline(
            create_test_project("true", vec![]),
            VerbTable::standard().unwrap(),
        );
        let (ctx, _out, _err) = create_test_context();

        let err = pipeline
            .run(&ctx, "deploy", &["tier".to_string()])
            .await
            .unwrap_err();
        assert_eq!(
            format!("{:#}", err),
            "pipeline deploy: error parsing flag tier: expected format flag=value"
        );
    }

    #[tokio::test]
    async fn test_running_pipeline_cannot_start_itself() {
        let project = create_test_project("run_pipelines deploy", vec![]);
        let pipeline = create_offline_pipeline(project, record_verbs(&RecordingVerb::default()));
        let (ctx, _out, _err) = create_test_context();

        let err = pipeline.run(&ctx, "deploy", &[]).await.unwrap_err();

        assert!(format!("{:#}", err).contains("run_pipelines: pipeline deploy is already running"));

        // The guard is released once the run ends
        let err = pipeline.run(&ctx, "deploy", &[]).await.unwrap_err();
        assert!(!format!("{:#}", err).starts_with("pipeline deploy is already running"));
    }

    #[tokio::test]
    async fn test_background_pipeline_runs_in_pipeline_scope() {
        let recording = RecordingVerb::default();
        let mut project = create_test_project("run_pipelines --background sidecar", vec![]);
        project.pipelines.insert(
            "sidecar".to_string(),
            PipelineDefinition::script("sidecar", "record sidecar"),
        );
        let pipeline = create_offline_pipeline(project, record_verbs(&recording));
        let (ctx, _out, _err) = create_test_context();

        pipeline.run(&ctx, "deploy", &[]).await.unwrap();
        pipeline.supervisor().wait().await.unwrap();

        assert_eq!(recording.calls(), vec![vec!["sidecar".to_string()]]);
    }

    #[tokio::test]
    async fn test_default_pipeline_fallback() {
        let project = ProjectConfig {
            name: "app".to_string(),
            ..Default::default()
        };
        let pipeline = create_offline_pipeline(project, VerbTable::standard().unwrap());
        let (ctx, _out, _err) = create_test_context();

        // Nothing is configured, so the default deploy pipeline has nothing to do
        pipeline.run(&ctx, "deploy", &[]).await.unwrap();

        let err = pipeline.definition("missing").unwrap_err();
        assert_eq!(err.to_string(), "couldn't find pipeline missing");
    }

    #[tokio::test]
    async fn test_exclude_fails_when_project_owned_elsewhere() {
        let store = Arc::new(MemoryOwnershipStore::new());
        store
            .put_raw(
                "app",
                &OwnershipRecord {
                    server: "10.0.0.9:8090".to_string(),
                    run_id: "other-run".to_string(),
                }
                .encode()
                .unwrap(),
            )
            .await;
        let peers = Arc::new(RecordingPeers::default().alive("10.0.0.9:8090").releasing(false));
        let registry = Arc::new(DependencyRegistry::new(
            RunId::new(),
            "app",
            Some(store as Arc<dyn OwnershipStore>),
            peers.clone() as Arc<dyn PeerClient>,
            ClaimPolicy::default(),
        ));
        let engine = create_test_engine(
            VerbTable::standard().unwrap(),
            registry,
            RecordingCollaborators::default(),
        );
        let pipeline = Pipeline::new(create_test_project("true", vec![]), engine, Supervisor::new());

        let err = pipeline.exclude().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "another session for project app is already running in this namespace"
        );

        // Memoised: no second round of pings
        let pings = peers.ping_count();
        assert!(pipeline.exclude().await.is_err());
        assert_eq!(peers.ping_count(), pings);
    }
}
