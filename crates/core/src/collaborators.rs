// Image, deployment and dev-session collaborators driven by the builtin verbs

use crate::context::{ExecContext, OutputSink, Stream};
use crate::dispatch::{ExecDispatcher, ScriptRuntime};
use crate::supervisor::Supervisor;
use crate::types::ProjectConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub skip_push: bool,
    pub force_rebuild: bool,
    pub sequential: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub force_redeploy: bool,
    pub sequential: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    pub sequential: bool,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, ctx: &ExecContext, names: &[String], options: &BuildOptions) -> Result<()>;
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, ctx: &ExecContext, names: &[String], options: &DeployOptions) -> Result<()>;

    async fn purge(&self, ctx: &ExecContext, names: &[String], options: &PurgeOptions) -> Result<()>;
}

/// Long-running development sessions (sync, port forwarding, logs)
#[async_trait]
pub trait DevManager: Send + Sync {
    /// Start sessions in the background; returns once they are launched
    async fn start_multiple(&self, ctx: &ExecContext, names: &[String]) -> Result<()>;

    /// Stop sessions and run their teardown
    async fn reset(&self, ctx: &ExecContext, names: &[String]) -> Result<()>;

    fn stop(&self, names: &[String]);

    fn list(&self) -> Vec<String>;

    /// Block until every running session has ended
    async fn wait(&self) -> Result<()>;
}

/// The collaborators of one pipeline
#[derive(Clone)]
pub struct Collaborators {
    pub images: Arc<dyn ImageBuilder>,
    pub deployer: Arc<dyn Deployer>,
    pub dev: Arc<dyn DevManager>,
}

/// Creates collaborators for each pipeline of a run
pub trait CollaboratorFactory: Send + Sync {
    /// `scope` is the pipeline's supervisor; long-lived work belongs under it
    fn create(&self, project: &ProjectConfig, runtime: &ScriptRuntime, scope: &Supervisor) -> Collaborators;
}

/// Collaborators that run the per-name scripts declared in the project
#[derive(Debug, Default, Clone)]
pub struct ScriptedCollaboratorFactory;

impl CollaboratorFactory for ScriptedCollaboratorFactory {
    fn create(&self, project: &ProjectConfig, runtime: &ScriptRuntime, scope: &Supervisor) -> Collaborators {
        let scripts = Arc::new(ProjectScripts {
            project: project.clone(),
            runtime: runtime.clone(),
        });

        Collaborators {
            images: scripts.clone(),
            deployer: scripts.clone(),
            dev: Arc::new(ScriptedDevManager {
                scripts,
                scope: scope.clone(),
                sessions: Arc::default(),
            }),
        }
    }
}

struct ProjectScripts {
    project: ProjectConfig,
    runtime: ScriptRuntime,
}

impl ProjectScripts {
    /// Run one script; pipeline verbs are not available inside it
    async fn run(&self, ctx: &ExecContext, what: &str, script: &str) -> Result<()> {
        if script.trim().is_empty() {
            tracing::debug!("Nothing to run for {}", what);
            return Ok(());
        }

        let dispatcher = ExecDispatcher::new(
            self.runtime.clone(),
            Arc::new(self.project.functions.clone()),
            None,
        );
        let status = dispatcher
            .run_script(script, &[], ctx)
            .await
            .with_context(|| what.to_string())?;
        if status != 0 {
            return Err(dispatcher.failure(status)).with_context(|| what.to_string());
        }
        Ok(())
    }

    /// Run a script for every name, one after another or all at once
    async fn run_each<F>(&self, ctx: &ExecContext, names: &[String], sequential: bool, script: F) -> Result<()>
    where
        F: Fn(&str) -> Result<(String, String)>,
    {
        let mut jobs = Vec::with_capacity(names.len());
        for name in names {
            jobs.push(script(name.as_str())?);
        }

        if sequential {
            for (what, body) in &jobs {
                self.run(ctx, what, body).await?;
            }
            return Ok(());
        }

        let results =
            futures::future::join_all(jobs.iter().map(|(what, body)| self.run(ctx, what, body))).await;
        results.into_iter().collect()
    }
}

#[async_trait]
impl ImageBuilder for ProjectScripts {
    async fn build(&self, ctx: &ExecContext, names: &[String], options: &BuildOptions) -> Result<()> {
        let mut ctx = ctx.clone();
        ctx.env
            .insert("DEVFLOW_SKIP_PUSH".to_string(), options.skip_push.to_string());
        ctx.env.insert(
            "DEVFLOW_FORCE_REBUILD".to_string(),
            options.force_rebuild.to_string(),
        );

        self.run_each(&ctx, names, options.sequential, |name| {
            let image = self
                .project
                .images
                .get(name)
                .ok_or_else(|| anyhow!("couldn't find image {}", name))?;
            Ok((format!("build image {}", name), image.build.clone()))
        })
        .await
    }
}

#[async_trait]
impl Deployer for ProjectScripts {
    async fn deploy(&self, ctx: &ExecContext, names: &[String], options: &DeployOptions) -> Result<()> {
        let mut ctx = ctx.clone();
        ctx.env.insert(
            "DEVFLOW_FORCE_REDEPLOY".to_string(),
            options.force_redeploy.to_string(),
        );

        self.run_each(&ctx, names, options.sequential, |name| {
            let deployment = self
                .project
                .deployments
                .get(name)
                .ok_or_else(|| anyhow!("couldn't find deployment {}", name))?;
            Ok((format!("deploy {}", name), deployment.deploy.clone()))
        })
        .await
    }

    async fn purge(&self, ctx: &ExecContext, names: &[String], options: &PurgeOptions) -> Result<()> {
        self.run_each(ctx, names, options.sequential, |name| {
            let deployment = self
                .project
                .deployments
                .get(name)
                .ok_or_else(|| anyhow!("couldn't find deployment {}", name))?;
            Ok((
                format!("purge {}", name),
                deployment.purge.clone().unwrap_or_default(),
            ))
        })
        .await
    }
}

type Sessions = Arc<Mutex<HashMap<String, Supervisor>>>;

/// Dev sessions as background scripts, each in its own scope.
///
/// A session that ends cleanly or is stopped leaves the table; a failed
/// session stays so that `wait` reports its error.
struct ScriptedDevManager {
    scripts: Arc<ProjectScripts>,
    scope: Supervisor,
    sessions: Sessions,
}

fn forget_session(sessions: &Sessions, name: &str, session: &Supervisor) {
    let mut sessions = sessions.lock().unwrap();
    if sessions
        .get(name)
        .is_some_and(|current| current.same_scope(session))
    {
        sessions.remove(name);
    }
}

#[async_trait]
impl DevManager for ScriptedDevManager {
    async fn start_multiple(&self, ctx: &ExecContext, names: &[String]) -> Result<()> {
        let mut configs = Vec::with_capacity(names.len());
        for name in names {
            let config = self
                .scripts
                .project
                .dev
                .get(name)
                .ok_or_else(|| anyhow!("couldn't find dev config {}", name))?;
            configs.push((name.clone(), config.start.clone()));
        }

        for (name, start) in configs {
            let session = {
                let mut sessions = self.sessions.lock().unwrap();
                if sessions
                    .get(&name)
                    .is_some_and(|running| running.active_tasks() > 0)
                {
                    tracing::info!(dev = %name, "Dev session is already running");
                    continue;
                }
                let session = self.scope.child();
                sessions.insert(name.clone(), session.clone());
                session
            };

            let label: Arc<str> = Arc::from(format!("dev:{}", name));
            let session_ctx = ctx.with_supervisor(session.clone()).with_output(
                OutputSink::log(label.clone(), Stream::Stdout),
                OutputSink::log(label, Stream::Stderr),
            );
            let scripts = self.scripts.clone();
            let sessions = self.sessions.clone();
            let task_session = session.clone();

            tracing::info!(dev = %name, "Starting dev session");
            session.spawn(format!("dev:{}", name), async move {
                let result = scripts
                    .run(&session_ctx, &format!("dev session {}", name), &start)
                    .await;

                match result {
                    Ok(()) => {
                        forget_session(&sessions, &name, &task_session);
                        Ok(())
                    }
                    Err(_) if task_session.is_cancelled() => {
                        tracing::debug!(dev = %name, "Dev session stopped");
                        forget_session(&sessions, &name, &task_session);
                        Ok(())
                    }
                    Err(err) => {
                        tracing::error!(dev = %name, "Dev session failed: {:#}", err);
                        Err(err)
                    }
                }
            });
        }

        Ok(())
    }

    async fn reset(&self, ctx: &ExecContext, names: &[String]) -> Result<()> {
        self.stop(names);

        for name in names {
            let Some(config) = self.scripts.project.dev.get(name) else {
                return Err(anyhow!("couldn't find dev config {}", name));
            };
            if let Some(stop) = &config.stop {
                self.scripts
                    .run(ctx, &format!("stop dev session {}", name), stop)
                    .await?;
            }
        }
        Ok(())
    }

    fn stop(&self, names: &[String]) {
        let mut sessions = self.sessions.lock().unwrap();
        for name in names {
            if let Some(session) = sessions.remove(name) {
                tracing::info!(dev = %name, "Stopping dev session");
                session.cancel();
            }
        }
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    async fn wait(&self) -> Result<()> {
        let sessions: Vec<(String, Supervisor)> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(name, session)| (name.clone(), session.clone()))
            .collect();

        let mut first_error = None;
        for (name, session) in sessions {
            if let Err(err) = session.wait().await {
                tracing::debug!(dev = %name, "Dev session ended with error");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::VerbTable;
    use crate::shell::ShellInterpreter;
    use crate::testing::create_test_context;
    use crate::types::{DeploymentConfig, DevConfig, ImageConfig};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn create_test_collaborators(project: ProjectConfig, scope: &Supervisor) -> Collaborators {
        let runtime = ScriptRuntime {
            interpreter: Arc::new(ShellInterpreter::new()),
            verbs: Arc::new(VerbTable::standard().unwrap()),
            installer: None,
        };
        ScriptedCollaboratorFactory.create(&project, &runtime, scope)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_build_runs_image_scripts() {
        let project = ProjectConfig {
            images: BTreeMap::from([
                (
                    "api".to_string(),
                    ImageConfig {
                        build: "echo building api push=$DEVFLOW_SKIP_PUSH".to_string(),
                    },
                ),
                (
                    "broken".to_string(),
                    ImageConfig {
                        build: "false".to_string(),
                    },
                ),
            ]),
            ..Default::default()
        };
        let collaborators = create_test_collaborators(project, &Supervisor::new());
        let (ctx, mut out, _err) = create_test_context();

        let options = BuildOptions {
            skip_push: true,
            ..Default::default()
        };
        collaborators
            .images
            .build(&ctx, &names(&["api"]), &options)
            .await
            .unwrap();
        assert_eq!(out.recv().await.as_deref(), Some("building api push=true"));

        let err = collaborators
            .images
            .build(&ctx, &names(&["broken"]), &options)
            .await
            .unwrap_err();
        assert_eq!(format!("{:#}", err), "build image broken: exit status 1");

        let err = collaborators
            .images
            .build(&ctx, &names(&["missing"]), &options)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "couldn't find image missing");
    }

    #[tokio::test]
    async fn test_scripts_cannot_use_pipeline_verbs() {
        let project = ProjectConfig {
            deployments: BTreeMap::from([(
                "api".to_string(),
                DeploymentConfig {
                    deploy: "run_pipelines other".to_string(),
                    purge: None,
                },
            )]),
            ..Default::default()
        };
        let collaborators = create_test_collaborators(project, &Supervisor::new());
        let (ctx, _out, _err) = create_test_context();

        let err = collaborators
            .deployer
            .deploy(&ctx, &names(&["api"]), &DeployOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            format!("{:#}", err),
            "deploy api: run_pipelines: not running inside a pipeline step"
        );

        // No purge script means nothing to do
        collaborators
            .deployer
            .purge(&ctx, &names(&["api"]), &PurgeOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dev_sessions_start_stop_and_reset() {
        let project = ProjectConfig {
            dev: BTreeMap::from([(
                "api".to_string(),
                DevConfig {
                    start: "sleep 30".to_string(),
                    stop: Some("echo stopped api".to_string()),
                },
            )]),
            ..Default::default()
        };
        let scope = Supervisor::new();
        let collaborators = create_test_collaborators(project, &scope);
        let (ctx, mut out, _err) = create_test_context();

        collaborators
            .dev
            .start_multiple(&ctx, &names(&["api"]))
            .await
            .unwrap();
        assert_eq!(collaborators.dev.list(), names(&["api"]));

        // Starting a running session again is a no-op
        collaborators
            .dev
            .start_multiple(&ctx, &names(&["api"]))
            .await
            .unwrap();
        assert_eq!(collaborators.dev.list(), names(&["api"]));

        collaborators.dev.reset(&ctx, &names(&["api"])).await.unwrap();
        assert!(collaborators.dev.list().is_empty());
        assert_eq!(out.recv().await.as_deref(), Some("stopped api"));

        tokio::time::timeout(Duration::from_secs(5), collaborators.dev.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dev_wait_reports_failed_session() {
        let project = ProjectConfig {
            dev: BTreeMap::from([(
                "api".to_string(),
                DevConfig {
                    start: "exit 4".to_string(),
                    stop: None,
                },
            )]),
            ..Default::default()
        };
        let collaborators = create_test_collaborators(project, &Supervisor::new());
        let (ctx, _out, _err) = create_test_context();

        collaborators
            .dev
            .start_multiple(&ctx, &names(&["api"]))
            .await
            .unwrap();

        let err = collaborators.dev.wait().await.unwrap_err();
        assert_eq!(format!("{:#}", err), "dev session api: exit status 4");
    }
}
