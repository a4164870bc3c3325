use crate::api::{self, AppState};
use crate::config::ServerConfig;
use crate::Args;
use anyhow::{anyhow, Context, Result};
use devflow_core::collaborators::ScriptedCollaboratorFactory;
use devflow_core::dispatch::{ScriptRuntime, VerbTable};
use devflow_core::pipeline::{Engine, Pipeline};
use devflow_core::registry::{DependencyRegistry, OwnershipStore, PeerClient};
use devflow_core::shell::ShellInterpreter;
use devflow_core::{ExecContext, OutputSink, RunId, Stream, Supervisor};
use devflow_sdk::{BinaryDownloader, ConfigMapStore, HttpPeerClient};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

/// One invocation: serve the inter-process API, run the pipeline, then
/// keep dev sessions alive until they end or the user interrupts.
pub async fn run(args: &Args, mut config: ServerConfig) -> Result<()> {
    if let Some(ref host) = args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let run_id = RunId::new();
    let project = config.project.clone();
    tracing::info!(run_id = %run_id, "Starting devflow for project {}", project.name);

    let registry = Arc::new(create_registry(args, &config, run_id, &project.name)?);

    let root = Supervisor::new();
    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?;
    let address = match config.server.advertise {
        Some(ref address) => address.clone(),
        None => listener.local_addr()?.to_string(),
    };
    registry.set_server(address).await;
    root.spawn(
        "api",
        api::serve(
            listener,
            AppState {
                registry: registry.clone(),
            },
            root.clone(),
        ),
    );

    let installer = BinaryDownloader::new(BinaryDownloader::default_cache_dir(), config.tool_sources())
        .context("Invalid tool download source")?;
    let engine = Arc::new(Engine {
        runtime: ScriptRuntime {
            interpreter: Arc::new(ShellInterpreter::new()),
            verbs: Arc::new(VerbTable::standard()?),
            installer: Some(Arc::new(installer)),
        },
        registry: registry.clone(),
        collaborators: Arc::new(ScriptedCollaboratorFactory),
    });

    let pipelines = root.child();
    let pipeline = Pipeline::new(project, engine, pipelines.clone());
    let ctx = ExecContext::from_process(run_id, config.base_dir.clone(), pipelines.clone()).with_output(
        OutputSink::log("devflow", Stream::Stdout),
        OutputSink::log("devflow", Stream::Stderr),
    );

    root.spawn(
        "takeover-watch",
        watch_takeover(registry.clone(), pipelines.clone(), root.clone()),
    );

    let outcome = drive(args, &pipeline, &ctx).await;

    pipeline.close();
    let background = pipelines.wait().await;
    root.cancel();
    if let Err(err) = root.wait().await {
        tracing::warn!("API server stopped with error: {:#}", err);
    }

    // A failed background task cancelled the foreground run
    background.and(outcome)
}

fn create_registry(
    args: &Args,
    config: &ServerConfig,
    run_id: RunId,
    project: &str,
) -> Result<DependencyRegistry> {
    let mut policy = config.registry.policy();
    if args.no_takeover {
        policy.allow_takeover = false;
    }

    let store: Option<Arc<dyn OwnershipStore>> = if args.offline {
        None
    } else {
        match config.kube_config(args.namespace.as_deref())? {
            Some(kube) => {
                tracing::info!(namespace = %kube.namespace, "Using cluster {}", kube.api_server);
                Some(Arc::new(ConfigMapStore::new(&kube)?))
            }
            None => None,
        }
    };
    if store.is_none() {
        tracing::info!("No cluster configured, dependencies are owned locally");
    }

    let peers: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(
        policy.ping_timeout,
        policy.exclude_timeout,
    )?);
    Ok(DependencyRegistry::new(run_id, project, store, peers, policy))
}

async fn drive(args: &Args, pipeline: &Arc<Pipeline>, ctx: &ExecContext) -> Result<()> {
    pipeline.exclude().await?;

    tokio::select! {
        result = pipeline.run(ctx, &args.pipeline, &args.set_flag) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping pipeline {}", args.pipeline);
            return Ok(());
        }
    }

    tokio::select! {
        result = pipeline.wait_dev() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping dev sessions");
            Ok(())
        }
    }
}

/// Cancel the run once another session took over the project itself
async fn watch_takeover(
    registry: Arc<DependencyRegistry>,
    pipelines: Supervisor,
    root: Supervisor,
) -> Result<()> {
    let mut released = registry.subscribe_released();
    let project = registry.root().to_string();

    loop {
        let name = tokio::select! {
            received = released.recv() => match received {
                Ok(name) => name,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Missed {} release notifications", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = root.cancelled() => return Ok(()),
        };

        if name == project {
            tracing::warn!("Project {} was taken over by another session", project);
            pipelines.kill(anyhow!("project {} was taken over by another session", project));
            return Ok(());
        }
    }
}
