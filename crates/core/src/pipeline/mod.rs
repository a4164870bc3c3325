// Pipeline orchestration: job graph, jobs, runner and the per-project handle

pub mod defaults;
mod graph;
mod handle;
mod job;
mod runner;

pub use graph::{EdgeKind, GraphBuilder, JobGraph, JobNode, MAIN_JOB};
pub use handle::{DependencyOptions, Engine, Pipeline, PipelineOptions};
pub use job::Job;
pub use runner::PipelineRunner;
