//! Execution of placed inference graphs
//!
//! An [`Executor`] takes a [`Graph`] plus the parameters its weights refer
//! to, checks that the placement is executable and returns a
//! [`PreparedGraph`] that can be run for any number of token batches.

pub mod local;
pub mod value;

use crate::errors::Result;
use crate::graph::{Graph, NodeId};
use crate::inference::batch::TokenBatch;
use crate::inference::params::ModelParameters;
use crate::inference::topk::Prediction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub use local::LocalExecutor;
pub use value::Value;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Validate the graph and its parameters and compute the schedule
    async fn prepare(&self, graph: Graph, params: Arc<ModelParameters>) -> Result<PreparedGraph>;

    /// Run one inference call
    async fn run(&self, prepared: &PreparedGraph, tokens: TokenBatch) -> Result<Prediction>;
}

/// A validated graph bound to its parameters
#[derive(Debug, Clone)]
pub struct PreparedGraph {
    graph: Arc<Graph>,
    params: Arc<ModelParameters>,
    waves: Vec<Vec<NodeId>>,
}

impl PreparedGraph {
    /// Check placement and parameters, then schedule
    pub fn new(graph: Graph, params: Arc<ModelParameters>) -> Result<Self> {
        graph.validate()?;
        params.validate(graph.plan())?;
        let waves = graph.waves()?;

        debug!(
            nodes = graph.node_count(),
            copies = graph.copy_count(),
            waves = waves.len(),
            "Prepared graph"
        );

        Ok(Self {
            graph: Arc::new(graph),
            params,
            waves,
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn params(&self) -> &Arc<ModelParameters> {
        &self.params
    }

    pub fn waves(&self) -> &[Vec<NodeId>] {
        &self.waves
    }

    /// Top-k width baked into the merge node
    pub fn top_k(&self) -> Option<usize> {
        self.graph.nodes().find_map(|n| match n.op {
            crate::graph::Op::Merge { k } => Some(k),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ShardError;
    use crate::graph::{build, GraphOptions};
    use crate::model::shard::plan;

    #[test]
    fn test_prepare_rejects_params_for_other_plan() {
        let graph = build(&plan(8, 2).unwrap(), &GraphOptions::default()).unwrap();
        let params = ModelParameters::seeded(1, &plan(8, 4).unwrap(), 2, 1).unwrap();
        assert!(matches!(
            PreparedGraph::new(graph, Arc::new(params)),
            Err(ShardError::IncompleteShardSet(_))
        ));
    }

    #[test]
    fn test_prepare_rejects_broken_placement() {
        let plan = plan(8, 2).unwrap();
        let mut graph = build(&plan, &GraphOptions::default()).unwrap();
        graph.place_weight(crate::graph::WeightRef::StageA, 0);
        let params = ModelParameters::seeded(1, &plan, 2, 1).unwrap();
        assert!(matches!(
            PreparedGraph::new(graph, Arc::new(params)),
            Err(ShardError::Placement(_))
        ));
    }

    #[test]
    fn test_prepared_graph_reports_k() {
        let plan = plan(8, 2).unwrap();
        let options = GraphOptions {
            top_k: 3,
            coalesce_copies: true,
        };
        let graph = build(&plan, &options).unwrap();
        let params = ModelParameters::seeded(1, &plan, 2, 1).unwrap();
        let prepared = PreparedGraph::new(graph, Arc::new(params)).unwrap();
        assert_eq!(prepared.top_k(), Some(3));
        assert!(!prepared.waves().is_empty());
    }
}
