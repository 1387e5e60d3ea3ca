//! Default graph construction and placement
//!
//! With N shards the graph spans N + 2 partitions:
//!
//! ```text
//! partition 0 .. N-1   gather_i, logits_i, topk_i, embedding slice i
//! partition N-1        + accumulate, merge
//! partition N          stage A
//! partition N+1        stage B
//! ```
//!
//! The token input lives on partition 0.

use crate::errors::{Result, ShardError};
use crate::model::shard::ShardPlan;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::copies::{coalesce_copies, insert_copies};
use super::{Graph, Op, ValueRef, WeightRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphOptions {
    pub top_k: usize,
    /// Merge copies of one value into a single multi-destination copy
    pub coalesce_copies: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            top_k: 4,
            coalesce_copies: true,
        }
    }
}

/// Build, place and validate the inference graph for a plan
pub fn build(plan: &ShardPlan, options: &GraphOptions) -> Result<Graph> {
    let k = options.top_k;
    if k == 0 {
        return Err(ShardError::Config("top-k requires k >= 1".to_string()));
    }
    if let Some(narrowest) = plan.shards().iter().min_by_key(|s| s.width()) {
        if narrowest.width() < k {
            return Err(ShardError::EmptyShardResult {
                shard_id: narrowest.shard_id,
                available: narrowest.width(),
                required: k,
            });
        }
    }

    let n = plan.shard_count();
    let reducer = n - 1;
    let stage_a_partition = n;
    let stage_b_partition = n + 1;

    let mut graph = Graph::new(plan.clone(), n + 2);

    for shard in 0..n {
        graph.place_weight(WeightRef::EmbeddingSlice(shard), shard);
    }
    graph.place_weight(WeightRef::StageA, stage_a_partition);
    graph.place_weight(WeightRef::StageB, stage_b_partition);

    let input = graph.add_node(Op::Input, vec![], 0);

    let gathers: Vec<ValueRef> = (0..n)
        .map(|shard| {
            ValueRef::of(graph.add_node(Op::Gather { shard }, vec![ValueRef::of(input)], shard))
        })
        .collect();
    let combined = graph.add_node(Op::Accumulate, gathers, reducer);

    let scores = graph.add_node(Op::StageA, vec![ValueRef::of(combined)], stage_a_partition);
    let hidden = graph.add_node(Op::StageB, vec![ValueRef::of(scores)], stage_b_partition);

    let locals: Vec<ValueRef> = (0..n)
        .map(|shard| {
            let logits =
                graph.add_node(Op::ShardLogits { shard }, vec![ValueRef::of(hidden)], shard);
            ValueRef::of(graph.add_node(
                Op::LocalTopK { shard, k },
                vec![ValueRef::of(logits)],
                shard,
            ))
        })
        .collect();
    let merged = graph.add_node(Op::Merge { k }, locals, reducer);
    graph.set_output(ValueRef::of(merged));

    let inserted = insert_copies(&mut graph)?;
    let removed = if options.coalesce_copies {
        coalesce_copies(&mut graph)?
    } else {
        0
    };

    graph.validate()?;

    debug!(
        shards = n,
        partitions = graph.partitions(),
        nodes = graph.node_count(),
        copies_inserted = inserted,
        copies_coalesced = removed,
        "Built inference graph"
    );

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PartitionId;
    use crate::model::shard::plan;

    fn options(top_k: usize, coalesce_copies: bool) -> GraphOptions {
        GraphOptions {
            top_k,
            coalesce_copies,
        }
    }

    fn placed(graph: &Graph, op: &Op) -> PartitionId {
        let node = graph.nodes().find(|n| &n.op == op).unwrap();
        graph.partition_of(node.id).unwrap()
    }

    #[test]
    fn test_default_placement() {
        let graph = build(&plan(12, 3).unwrap(), &options(2, true)).unwrap();
        assert_eq!(graph.partitions(), 5);

        assert_eq!(placed(&graph, &Op::Input), 0);
        for shard in 0..3 {
            assert_eq!(placed(&graph, &Op::Gather { shard }), shard);
            assert_eq!(placed(&graph, &Op::ShardLogits { shard }), shard);
            assert_eq!(placed(&graph, &Op::LocalTopK { shard, k: 2 }), shard);
            assert_eq!(
                graph.weight_placement[&WeightRef::EmbeddingSlice(shard)],
                shard
            );
        }
        assert_eq!(placed(&graph, &Op::Accumulate), 2);
        assert_eq!(placed(&graph, &Op::Merge { k: 2 }), 2);
        assert_eq!(placed(&graph, &Op::StageA), 3);
        assert_eq!(placed(&graph, &Op::StageB), 4);
    }

    #[test]
    fn test_one_copy_per_cross_partition_edge() {
        // N = 3: tokens 2, gathers 2, accumulate 1, stage A 1, hidden 3, top-k 2
        let graph = build(&plan(12, 3).unwrap(), &options(1, false)).unwrap();
        assert_eq!(graph.copy_count(), 11);
        assert!(graph
            .nodes()
            .filter(|n| n.op.is_copy())
            .all(|n| n.op.output_slots() == 1));
    }

    #[test]
    fn test_coalesced_copies_fan_out() {
        let graph = build(&plan(12, 3).unwrap(), &options(1, true)).unwrap();
        // Token and hidden copies collapse into one each
        assert_eq!(graph.copy_count(), 8);

        let hidden_copy = graph
            .nodes()
            .find(|n| match &n.op {
                Op::Copy { destinations } => destinations == &vec![0, 1, 2],
                _ => false,
            })
            .unwrap();
        assert_eq!(graph.partition_of(hidden_copy.id).unwrap(), 4);

        let token_copy = graph
            .nodes()
            .find(|n| match &n.op {
                Op::Copy { destinations } => destinations == &vec![1, 2],
                _ => false,
            })
            .unwrap();
        assert_eq!(graph.partition_of(token_copy.id).unwrap(), 0);
    }

    #[test]
    fn test_single_shard_graph() {
        let graph = build(&plan(5, 1).unwrap(), &options(3, true)).unwrap();
        assert_eq!(graph.partitions(), 3);
        // accumulate -> stage A -> stage B -> logits
        assert_eq!(graph.copy_count(), 3);
    }

    #[test]
    fn test_schedule_runs_gathers_together() {
        let graph = build(&plan(8, 2).unwrap(), &options(1, true)).unwrap();
        let waves = graph.waves().unwrap();
        let total: usize = waves.iter().map(Vec::len).sum();
        assert_eq!(total, graph.node_count());

        let gather_wave = |shard: usize| {
            waves
                .iter()
                .position(|w| {
                    w.iter()
                        .any(|id| graph.node(*id).unwrap().op == Op::Gather { shard })
                })
                .unwrap()
        };
        // gather_1 waits for the token copy
        assert_eq!(gather_wave(0) + 1, gather_wave(1));
    }

    #[test]
    fn test_k_zero_rejected() {
        assert!(matches!(
            build(&plan(8, 2).unwrap(), &options(0, true)),
            Err(ShardError::Config(_))
        ));
    }

    #[test]
    fn test_k_wider_than_shard_rejected() {
        assert!(matches!(
            build(&plan(9, 2).unwrap(), &options(5, true)),
            Err(ShardError::EmptyShardResult {
                shard_id: 0,
                available: 4,
                required: 5
            })
        ));
    }
}
