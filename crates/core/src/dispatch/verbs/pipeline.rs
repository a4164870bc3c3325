use super::{parse_args, select_names, PipelineVerb};
use crate::collaborators::{BuildOptions, DeployOptions, PurgeOptions};
use crate::context::ExecContext;
use crate::error::ExitStatus;
use crate::pipeline::{DependencyOptions, Pipeline, PipelineOptions};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;

#[derive(Debug, Parser)]
struct BuildImagesArgs {
    /// Build every image of the project
    #[arg(long)]
    all: bool,
    /// Skip this image when building all
    #[arg(long)]
    except: Vec<String>,
    #[arg(long)]
    sequential: bool,
    #[arg(long)]
    skip_push: bool,
    #[arg(long)]
    force_rebuild: bool,
    names: Vec<String>,
}

pub struct BuildImages;

#[async_trait]
impl PipelineVerb for BuildImages {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: BuildImagesArgs = parse_args("build_images", args)?;
        let names = select_names(
            "build_images",
            "image",
            args.all,
            &args.except,
            &args.names,
            pipeline.project().images.keys(),
        )?;
        if names.is_empty() {
            tracing::debug!(pipeline = %pipeline.name(), "No images to build");
            return Ok(());
        }

        let options = BuildOptions {
            skip_push: args.skip_push,
            force_rebuild: args.force_rebuild,
            sequential: args.sequential,
        };
        pipeline
            .collaborators()
            .images
            .build(ctx, &names, &options)
            .await
    }
}

#[derive(Debug, Parser)]
struct CreateDeploymentsArgs {
    #[arg(long)]
    all: bool,
    #[arg(long)]
    except: Vec<String>,
    #[arg(long)]
    sequential: bool,
    /// Redeploy even if nothing changed
    #[arg(long)]
    force_redeploy: bool,
    names: Vec<String>,
}

pub struct CreateDeployments;

#[async_trait]
impl PipelineVerb for CreateDeployments {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: CreateDeploymentsArgs = parse_args("create_deployments", args)?;
        pipeline.exclude().await?;

        let names = select_names(
            "create_deployments",
            "deployment",
            args.all,
            &args.except,
            &args.names,
            pipeline.project().deployments.keys(),
        )?;
        if names.is_empty() {
            tracing::debug!(pipeline = %pipeline.name(), "No deployments to create");
            return Ok(());
        }

        let options = DeployOptions {
            force_redeploy: args.force_redeploy,
            sequential: args.sequential,
        };
        pipeline
            .collaborators()
            .deployer
            .deploy(ctx, &names, &options)
            .await
    }
}

#[derive(Debug, Parser)]
struct PurgeDeploymentsArgs {
    #[arg(long)]
    all: bool,
    #[arg(long)]
    except: Vec<String>,
    #[arg(long)]
    sequential: bool,
    names: Vec<String>,
}

pub struct PurgeDeployments;

#[async_trait]
impl PipelineVerb for PurgeDeployments {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: PurgeDeploymentsArgs = parse_args("purge_deployments", args)?;
        let names = select_names(
            "purge_deployments",
            "deployment",
            args.all,
            &args.except,
            &args.names,
            pipeline.project().deployments.keys(),
        )?;
        if names.is_empty() {
            return Ok(());
        }

        let options = PurgeOptions {
            sequential: args.sequential,
        };
        pipeline
            .collaborators()
            .deployer
            .purge(ctx, &names, &options)
            .await
    }
}

#[derive(Debug, Parser)]
struct DevArgs {
    #[arg(long)]
    all: bool,
    #[arg(long)]
    except: Vec<String>,
    names: Vec<String>,
}

pub struct StartDev;

#[async_trait]
impl PipelineVerb for StartDev {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: DevArgs = parse_args("start_dev", args)?;
        pipeline.exclude().await?;

        let names = select_names(
            "start_dev",
            "dev",
            args.all,
            &args.except,
            &args.names,
            pipeline.project().dev.keys(),
        )?;
        if names.is_empty() {
            return Ok(());
        }
        pipeline.collaborators().dev.start_multiple(ctx, &names).await
    }
}

pub struct StopDev;

#[async_trait]
impl PipelineVerb for StopDev {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: DevArgs = parse_args("stop_dev", args)?;
        let names = select_names(
            "stop_dev",
            "dev",
            args.all,
            &args.except,
            &args.names,
            pipeline.project().dev.keys(),
        )?;
        if names.is_empty() {
            return Ok(());
        }
        pipeline.collaborators().dev.reset(ctx, &names).await
    }
}

#[derive(Debug, Parser)]
struct RunDependenciesArgs {
    /// Run every enabled dependency
    #[arg(long)]
    all: bool,
    /// Pipeline to run in each dependency
    #[arg(long)]
    pipeline: Option<String>,
    #[arg(long)]
    sequential: bool,
    /// Skip this dependency when running all
    #[arg(long)]
    exclude: Vec<String>,
    /// Flag override passed to the dependency pipelines, as name=value
    #[arg(long = "set-flag")]
    set_flag: Vec<String>,
    names: Vec<String>,
}

pub struct RunDependencies;

#[async_trait]
impl PipelineVerb for RunDependencies {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: RunDependenciesArgs = parse_args("run_dependencies", args)?;
        if !args.all && args.names.is_empty() {
            return Err(anyhow!(
                "either specify 'run_dependencies --all' or 'run_dependencies dependency1 dependency2'"
            ));
        }

        pipeline
            .start_new_dependencies(
                ctx,
                DependencyOptions {
                    names: args.names,
                    all: args.all,
                    pipeline: args.pipeline,
                    sequential: args.sequential,
                    exclude: args.exclude,
                    set_flags: args.set_flag,
                },
            )
            .await
    }
}

#[derive(Debug, Parser)]
struct RunPipelinesArgs {
    /// Run the pipelines without waiting for them
    #[arg(long)]
    background: bool,
    #[arg(long)]
    sequential: bool,
    #[arg(long = "set-flag")]
    set_flag: Vec<String>,
    #[arg(required = true)]
    names: Vec<String>,
}

pub struct RunPipelines;

#[async_trait]
impl PipelineVerb for RunPipelines {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: RunPipelinesArgs = parse_args("run_pipelines", args)?;
        pipeline
            .start_new_pipelines(
                ctx,
                &args.names,
                PipelineOptions {
                    background: args.background,
                    sequential: args.sequential,
                    set_flags: args.set_flag,
                },
            )
            .await
    }
}

#[derive(Debug, Parser)]
struct RunDefaultPipelineArgs {
    name: String,
}

pub struct RunDefaultPipeline;

#[async_trait]
impl PipelineVerb for RunDefaultPipeline {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: RunDefaultPipelineArgs = parse_args("run_default_pipeline", args)?;
        pipeline.run_default_pipeline(ctx, &args.name).await
    }
}

/// Succeeds only inside a dependency pipeline
pub struct IsDependency;

#[async_trait]
impl PipelineVerb for IsDependency {
    async fn run(&self, ctx: &ExecContext, pipeline: &Arc<Pipeline>, _args: &[String]) -> Result<()> {
        if ctx.is_dependency || pipeline.is_dependency() {
            Ok(())
        } else {
            Err(ExitStatus(1).into())
        }
    }
}

#[derive(Debug, Parser)]
struct GetFlagArgs {
    name: String,
}

pub struct GetFlag;

#[async_trait]
impl PipelineVerb for GetFlag {
    async fn run(&self, ctx: &ExecContext, _pipeline: &Arc<Pipeline>, args: &[String]) -> Result<()> {
        let args: GetFlagArgs = parse_args("get_flag", args)?;
        let value = ctx
            .flag(&args.name)
            .ok_or_else(|| anyhow!("flag {} is not defined", args.name))?;
        ctx.stdout.write_line(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{create_test_context, create_test_pipeline_with, RecordingCollaborators};
    use crate::types::{ImageConfig, ProjectConfig};
    use std::collections::BTreeMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn create_test_project() -> ProjectConfig {
        ProjectConfig {
            name: "shop".to_string(),
            images: BTreeMap::from([
                ("api".to_string(), ImageConfig::default()),
                ("web".to_string(), ImageConfig::default()),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_images_all_except() {
        let recorder = RecordingCollaborators::default();
        let pipeline = create_test_pipeline_with(create_test_project(), recorder.clone());
        let (ctx, _out, _err) = create_test_context();

        BuildImages
            .run(&ctx, &pipeline, &args(&["--all", "--except", "web", "--skip-push"]))
            .await
            .unwrap();

        assert_eq!(recorder.calls(), vec!["build api skip_push=true".to_string()]);
    }

    #[tokio::test]
    async fn test_build_images_requires_names_or_all() {
        let recorder = RecordingCollaborators::default();
        let pipeline = create_test_pipeline_with(create_test_project(), recorder.clone());
        let (ctx, _out, _err) = create_test_context();

        let err = BuildImages.run(&ctx, &pipeline, &[]).await.unwrap_err();
        assert!(err.to_string().contains("build_images --all"));
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_flag_prints_value() {
        let pipeline = create_test_pipeline_with(create_test_project(), RecordingCollaborators::default());
        let (ctx, mut out, _err) = create_test_context();
        let ctx = ctx.with_flags(BTreeMap::from([("tier".to_string(), "gold".to_string())]));

        GetFlag.run(&ctx, &pipeline, &args(&["tier"])).await.unwrap();
        assert_eq!(out.recv().await.as_deref(), Some("gold"));

        let err = GetFlag.run(&ctx, &pipeline, &args(&["missing"])).await.unwrap_err();
        assert_eq!(err.to_string(), "flag missing is not defined");
    }

    #[tokio::test]
    async fn test_is_dependency_status() {
        let pipeline = create_test_pipeline_with(create_test_project(), RecordingCollaborators::default());
        let (ctx, _out, _err) = create_test_context();

        let err = IsDependency.run(&ctx, &pipeline, &[]).await.unwrap_err();
        assert_eq!(ExitStatus::of(&err), Some(1));

        let dependency = ctx.as_dependency(None);
        IsDependency.run(&dependency, &pipeline, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_pipelines_requires_a_name() {
        let pipeline = create_test_pipeline_with(create_test_project(), RecordingCollaborators::default());
        let (ctx, _out, _err) = create_test_context();

        assert!(RunPipelines.run(&ctx, &pipeline, &[]).await.is_err());
    }
}
