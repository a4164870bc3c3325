// Built-in pipelines used when a project does not define its own

use crate::types::PipelineDefinition;

const DEPLOY: &str = "run_dependencies --all
build_images --all
create_deployments --all";

const DEV: &str = "run_dependencies --all
build_images --all
create_deployments --all
start_dev --all";

const BUILD: &str = "run_dependencies --all --pipeline build
build_images --all";

const PURGE: &str = "stop_dev --all
purge_deployments --all
run_dependencies --all --pipeline purge";

/// Names of the built-in pipelines
pub const NAMES: [&str; 4] = ["build", "deploy", "dev", "purge"];

/// Built-in definition by name
pub fn pipeline(name: &str) -> Option<PipelineDefinition> {
    let run = match name {
        "deploy" => DEPLOY,
        "dev" => DEV,
        "build" => BUILD,
        "purge" => PURGE,
        _ => return None,
    };
    Some(PipelineDefinition::script(name, run))
}
