use crate::error::GraphError;
use crate::pipeline::job::Job;
use crate::types::{JobConfig, PipelineDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Name of the implicit main job of every pipeline
pub const MAIN_JOB: &str = "default";

/// How a job hangs below one of its predecessors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// First `after` entry; the link the tree walk follows
    Primary,
    /// Any further `after` entry
    Auxiliary,
}

/// A DAG node wrapping one job
pub struct JobNode {
    pub name: String,
    pub config: JobConfig,
    pub job: Arc<Job>,
}

/// Execution DAG of one pipeline run
pub struct JobGraph {
    graph: DiGraph<JobNode, EdgeKind>,
    roots: Vec<NodeIndex>,
    index: HashMap<String, NodeIndex>,
}

impl JobGraph {
    /// Jobs hanging directly below the implicit root
    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    pub fn node(&self, index: NodeIndex) -> &JobNode {
        &self.graph[index]
    }

    pub fn find(&self, name: &str) -> Option<&JobNode> {
        self.index.get(name).map(|idx| &self.graph[*idx])
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All declared predecessors of a node
    pub fn parents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .collect()
    }

    /// Every node that lists this one in its `after`
    pub fn children(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect()
    }

    /// Predecessor a node is attached to in the tree walk
    pub fn primary_parent(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .find(|edge| *edge.weight() == EdgeKind::Primary)
            .map(|edge| edge.source())
    }

    /// Job names grouped by depth: a job lands one layer below its deepest predecessor
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut topo = petgraph::visit::Topo::new(&self.graph);

        while let Some(node) = topo.next(&self.graph) {
            let level = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|parent| depth.get(&parent))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, level);
        }

        let mut layers: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (node, level) in depth {
            layers
                .entry(level)
                .or_default()
                .push(self.graph[node].name.clone());
        }

        layers
            .into_values()
            .map(|mut names| {
                names.sort();
                names
            })
            .collect()
    }
}

/// Turns a pipeline definition into a [`JobGraph`]
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn build(definition: &PipelineDefinition) -> Result<JobGraph, GraphError> {
        // A job named after the main job replaces the pipeline's own body
        let mut unresolved: BTreeMap<String, JobConfig> = BTreeMap::new();
        unresolved.insert(MAIN_JOB.to_string(), definition.job.clone());
        unresolved.extend(definition.jobs.clone());

        // Reject dangling and self references before placing anything
        for (name, config) in &unresolved {
            for after in &config.after {
                if after == name {
                    return Err(GraphError::SelfReference(name.clone()));
                }
                if !unresolved.contains_key(after) {
                    return Err(GraphError::UnknownAfter {
                        job: name.clone(),
                        after: after.clone(),
                    });
                }
            }
        }

        let mut graph: DiGraph<JobNode, EdgeKind> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        let mut roots = Vec::new();

        while !unresolved.is_empty() {
            let ready: Vec<String> = unresolved
                .iter()
                .filter(|(_, config)| config.after.iter().all(|after| index.contains_key(after)))
                .map(|(name, _)| name.clone())
                .collect();

            if ready.is_empty() {
                return Err(GraphError::Cycle(unresolved.into_keys().collect()));
            }

            for name in ready {
                let Some(config) = unresolved.remove(&name) else {
                    continue;
                };

                let node = graph.add_node(JobNode {
                    name: name.clone(),
                    job: Arc::new(Job::new(name.clone(), config.clone())),
                    config: config.clone(),
                });
                index.insert(name.clone(), node);

                match config.after.split_first() {
                    None => roots.push(node),
                    Some((primary, rest)) => {
                        graph.add_edge(index[primary], node, EdgeKind::Primary);
                        for after in rest {
                            let parent = index[after];
                            if graph.find_edge(parent, node).is_none() {
                                graph.add_edge(parent, node, EdgeKind::Auxiliary);
                            }
                        }
                    }
                }
            }
        }

        for node in graph.node_indices() {
            let job = &graph[node];
            let has_dependents = graph
                .neighbors_directed(node, Direction::Outgoing)
                .next()
                .is_some();
            if job.config.rerun.is_some() && has_dependents {
                return Err(GraphError::RerunWithDependents(job.name.clone()));
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            let mut names: Vec<String> = index.into_keys().collect();
            names.sort();
            return Err(GraphError::Cycle(names));
        }

        tracing::debug!(
            pipeline = %definition.name,
            "Built job graph with {} jobs",
            graph.node_count()
        );

        Ok(JobGraph {
            graph,
            roots,
            index,
        })
    }
}
