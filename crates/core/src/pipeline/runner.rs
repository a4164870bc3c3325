use crate::context::ExecContext;
use crate::pipeline::{JobGraph, Pipeline};
use crate::types::JobStatus;
use anyhow::{anyhow, Result};
use petgraph::graph::NodeIndex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Walks a [`JobGraph`] layer by layer.
///
/// Each layer runs concurrently in its own scope. The next layer is the
/// union of the children of every job that ran; a job is only started
/// once all of its predecessors are terminal and is never started twice,
/// so a shared descendant runs exactly once after its last predecessor.
pub struct PipelineRunner {
    pipeline: Arc<Pipeline>,
    graph: Arc<JobGraph>,
}

impl PipelineRunner {
    pub fn new(pipeline: Arc<Pipeline>, graph: Arc<JobGraph>) -> Self {
        Self { pipeline, graph }
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Run every job reachable from the graph's roots. Returns the first
    /// error of a job that does not continue on error.
    pub async fn run(&self, ctx: &ExecContext, args: &[String]) -> Result<()> {
        let mut layer: Vec<NodeIndex> = self.graph.roots().to_vec();

        while !layer.is_empty() {
            if ctx.is_cancelled() {
                return Err(anyhow!("pipeline {} was cancelled", self.pipeline.name()));
            }

            let ran = self.run_layer(ctx, &layer, args).await?;
            let next: BTreeSet<NodeIndex> = ran
                .iter()
                .flat_map(|index| self.graph.children(*index))
                .collect();
            layer = next.into_iter().collect();
        }

        Ok(())
    }

    fn is_ready(&self, index: NodeIndex) -> bool {
        let node = self.graph.node(index);
        if node.job.status() != JobStatus::Idle {
            return false;
        }

        self.graph
            .parents(index)
            .into_iter()
            .all(|parent| self.graph.node(parent).job.terminated())
    }

    async fn run_layer(
        &self,
        ctx: &ExecContext,
        layer: &[NodeIndex],
        args: &[String],
    ) -> Result<Vec<NodeIndex>> {
        let scope = ctx.supervisor.child();
        let layer_ctx = ctx.with_supervisor(scope.clone());
        let mut started = Vec::with_capacity(layer.len());

        for &index in layer {
            let node = self.graph.node(index);
            if !self.is_ready(index) {
                tracing::debug!(
                    pipeline = %self.pipeline.name(),
                    job = %node.name,
                    "Job not ready or already started, skipping"
                );
                continue;
            }
            started.push(index);

            let job = node.job.clone();
            let name = node.name.clone();
            let continue_on_error = node.config.continue_on_error;
            let pipeline = self.pipeline.clone();
            let ctx = layer_ctx.clone();
            let args = args.to_vec();

            scope.spawn(format!("job:{}", name), async move {
                match job.run(&pipeline, &ctx, &args).await {
                    Ok(()) => Ok(()),
                    Err(err) if continue_on_error => {
                        tracing::warn!(
                            pipeline = %pipeline.name(),
                            job = %name,
                            "Job failed, continuing: {:#}",
                            err
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            });
        }

        scope.wait().await?;
        Ok(started)
    }
}
