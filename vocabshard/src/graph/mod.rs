//! Placed dataflow graph for one sharded inference call
//!
//! Placement is data: every node is mapped to a partition in
//! [`Graph::placement`] and every weight to a partition in
//! [`Graph::weight_placement`]. A node may only read values that live on its
//! own partition, so values crossing partitions go through explicit
//! [`Op::Copy`] nodes. A copy runs on its source's partition and delivers one
//! output slot per destination partition.

pub mod builder;
pub mod copies;

use crate::errors::{Result, ShardError};
use crate::model::shard::ShardPlan;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use builder::{build, GraphOptions};

pub type NodeId = usize;
pub type PartitionId = usize;

/// One output of a node. Only copies have more than one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRef {
    pub node: NodeId,
    pub slot: usize,
}

impl ValueRef {
    pub fn of(node: NodeId) -> Self {
        Self { node, slot: 0 }
    }
}

/// Parameters that live on a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WeightRef {
    EmbeddingSlice(usize),
    StageA,
    StageB,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Token batch fed by the caller
    Input,
    Gather { shard: usize },
    Accumulate,
    StageA,
    StageB,
    ShardLogits { shard: usize },
    LocalTopK { shard: usize, k: usize },
    Merge { k: usize },
    /// Cross-partition transfer of one value to every destination
    Copy { destinations: Vec<PartitionId> },
}

impl Op {
    /// Weight this op reads, if any
    pub fn weight(&self) -> Option<WeightRef> {
        match self {
            Op::Gather { shard } | Op::ShardLogits { shard } => {
                Some(WeightRef::EmbeddingSlice(*shard))
            }
            Op::StageA => Some(WeightRef::StageA),
            Op::StageB => Some(WeightRef::StageB),
            _ => None,
        }
    }

    /// Shard this op runs for, if it is per-shard work
    pub fn shard(&self) -> Option<usize> {
        match self {
            Op::Gather { shard } | Op::ShardLogits { shard } | Op::LocalTopK { shard, .. } => {
                Some(*shard)
            }
            _ => None,
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, Op::Copy { .. })
    }

    pub fn output_slots(&self) -> usize {
        match self {
            Op::Copy { destinations } => destinations.len(),
            _ => 1,
        }
    }

    fn expected_inputs(&self, shard_count: usize) -> usize {
        match self {
            Op::Input => 0,
            Op::Accumulate | Op::Merge { .. } => shard_count,
            _ => 1,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Op::Input => "input".to_string(),
            Op::Gather { shard } => format!("gather_{}", shard),
            Op::Accumulate => "accumulate".to_string(),
            Op::StageA => "stage_a".to_string(),
            Op::StageB => "stage_b".to_string(),
            Op::ShardLogits { shard } => format!("logits_{}", shard),
            Op::LocalTopK { shard, k } => format!("topk_{}(k={})", shard, k),
            Op::Merge { k } => format!("merge(k={})", k),
            Op::Copy { destinations } => format!("copy->{:?}", destinations),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub inputs: Vec<ValueRef>,
}

#[derive(Debug, Clone)]
pub struct Graph {
    plan: ShardPlan,
    partitions: usize,
    nodes: BTreeMap<NodeId, Node>,
    next_id: NodeId,
    /// Operation -> partition
    pub placement: BTreeMap<NodeId, PartitionId>,
    /// Weight -> partition
    pub weight_placement: BTreeMap<WeightRef, PartitionId>,
    output: Option<ValueRef>,
}

/// Flat view of a placed graph, one record per node and weight
#[derive(Debug, Clone, Serialize)]
pub struct GraphDump {
    pub vocab_size: usize,
    pub shards: usize,
    pub partitions: usize,
    pub copies: usize,
    pub nodes: Vec<PlacedNode>,
    pub weights: Vec<PlacedWeight>,
    pub output: Option<ValueRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedNode {
    pub id: NodeId,
    pub label: String,
    pub op: Op,
    pub inputs: Vec<ValueRef>,
    pub partition: Option<PartitionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedWeight {
    pub weight: WeightRef,
    pub partition: PartitionId,
}

impl Graph {
    pub fn new(plan: ShardPlan, partitions: usize) -> Self {
        Self {
            plan,
            partitions,
            nodes: BTreeMap::new(),
            next_id: 0,
            placement: BTreeMap::new(),
            weight_placement: BTreeMap::new(),
            output: None,
        }
    }

    /// Append a node and place it
    pub fn add_node(&mut self, op: Op, inputs: Vec<ValueRef>, partition: PartitionId) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, Node { id, op, inputs });
        self.placement.insert(id, partition);
        id
    }

    pub fn place_weight(&mut self, weight: WeightRef, partition: PartitionId) {
        self.weight_placement.insert(weight, partition);
    }

    pub fn set_output(&mut self, value: ValueRef) {
        self.output = Some(value);
    }

    pub fn output(&self) -> Result<ValueRef> {
        self.output
            .ok_or_else(|| ShardError::Placement("graph has no output".to_string()))
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| ShardError::Placement(format!("unknown node {}", id)))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| ShardError::Placement(format!("unknown node {}", id)))
    }

    pub(crate) fn remove_node(&mut self, id: NodeId) {
        self.nodes.remove(&id);
        self.placement.remove(&id);
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn copy_count(&self) -> usize {
        self.nodes.values().filter(|n| n.op.is_copy()).count()
    }

    /// Nodes bound to a single shard: gather, logits and local top-k
    pub fn shard_task_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.op.shard().is_some())
            .count()
    }

    pub fn partition_of(&self, id: NodeId) -> Result<PartitionId> {
        self.placement
            .get(&id)
            .copied()
            .ok_or_else(|| ShardError::Placement(format!("node {} is not placed", id)))
    }

    /// Partition on which a value is available
    pub fn value_partition(&self, value: ValueRef) -> Result<PartitionId> {
        let node = self.node(value.node)?;
        match &node.op {
            Op::Copy { destinations } => destinations.get(value.slot).copied().ok_or_else(|| {
                ShardError::Placement(format!(
                    "copy {} has no output slot {}",
                    value.node, value.slot
                ))
            }),
            _ if value.slot == 0 => self.partition_of(value.node),
            _ => Err(ShardError::Placement(format!(
                "node {} has a single output, slot {} requested",
                value.node, value.slot
            ))),
        }
    }

    /// Check that the graph can be executed as placed
    pub fn validate(&self) -> Result<()> {
        let inputs = self.nodes.values().filter(|n| n.op == Op::Input).count();
        if inputs != 1 {
            return Err(ShardError::Placement(format!(
                "graph needs exactly one input node, found {}",
                inputs
            )));
        }

        for node in self.nodes.values() {
            let partition = self.partition_of(node.id)?;
            if partition >= self.partitions {
                return Err(ShardError::Placement(format!(
                    "{} placed on partition {} but only {} exist",
                    node.op.label(),
                    partition,
                    self.partitions
                )));
            }

            let expected = node.op.expected_inputs(self.plan.shard_count());
            if node.inputs.len() != expected {
                return Err(ShardError::Placement(format!(
                    "{} takes {} inputs, has {}",
                    node.op.label(),
                    expected,
                    node.inputs.len()
                )));
            }

            if let Some(weight) = node.op.weight() {
                let home = self.weight_placement.get(&weight).ok_or_else(|| {
                    ShardError::Placement(format!("weight {:?} is not placed", weight))
                })?;
                if *home != partition {
                    return Err(ShardError::Placement(format!(
                        "{} on partition {} reads {:?} held on partition {}",
                        node.op.label(),
                        partition,
                        weight,
                        home
                    )));
                }
            }

            if let Op::Copy { destinations } = &node.op {
                if destinations.is_empty() {
                    return Err(ShardError::Placement(format!(
                        "copy {} has no destinations",
                        node.id
                    )));
                }
            }

            for input in &node.inputs {
                let source = self.value_partition(*input)?;
                if source != partition {
                    return Err(ShardError::Placement(format!(
                        "{} on partition {} reads node {} from partition {} without a copy",
                        node.op.label(),
                        partition,
                        input.node,
                        source
                    )));
                }
            }
        }

        self.value_partition(self.output()?)?;
        self.waves()?;
        Ok(())
    }

    /// Topological schedule: every node of a wave depends only on earlier waves
    pub fn waves(&self) -> Result<Vec<Vec<NodeId>>> {
        let mut pending: BTreeMap<NodeId, BTreeSet<NodeId>> = self
            .nodes
            .values()
            .map(|n| (n.id, n.inputs.iter().map(|v| v.node).collect()))
            .collect();

        let mut waves = Vec::new();
        while !pending.is_empty() {
            let ready: Vec<NodeId> = pending
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                return Err(ShardError::Placement(format!(
                    "graph has a cycle or a dangling input among nodes {:?}",
                    pending.keys().collect::<Vec<_>>()
                )));
            }
            for id in &ready {
                pending.remove(id);
            }
            for deps in pending.values_mut() {
                for id in &ready {
                    deps.remove(id);
                }
            }
            waves.push(ready);
        }
        Ok(waves)
    }

    pub fn dump(&self) -> GraphDump {
        GraphDump {
            vocab_size: self.plan.vocab_size(),
            shards: self.plan.shard_count(),
            partitions: self.partitions,
            copies: self.copy_count(),
            nodes: self
                .nodes
                .values()
                .map(|n| PlacedNode {
                    id: n.id,
                    label: n.op.label(),
                    op: n.op.clone(),
                    inputs: n.inputs.clone(),
                    partition: self.placement.get(&n.id).copied(),
                })
                .collect(),
            weights: self
                .weight_placement
                .iter()
                .map(|(weight, partition)| PlacedWeight {
                    weight: *weight,
                    partition: *partition,
                })
                .collect(),
            output: self.output,
        }
    }

    /// Pretty-printed JSON of [`Graph::dump`]
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.dump())?)
    }

    /// Node labels hosted by each partition
    pub fn partition_summary(&self) -> Vec<(PartitionId, Vec<String>)> {
        let mut by_partition: BTreeMap<PartitionId, Vec<String>> =
            (0..self.partitions).map(|p| (p, Vec::new())).collect();
        for node in self.nodes.values() {
            if let Some(p) = self.placement.get(&node.id) {
                by_partition.entry(*p).or_default().push(node.op.label());
            }
        }
        by_partition.into_iter().collect()
    }
}
