//! Copy insertion and coalescing passes

use crate::errors::Result;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use super::{Graph, NodeId, Op, PartitionId, ValueRef};

/// Insert one copy per edge whose value lives on another partition.
///
/// Each copy is placed on the source partition. Returns the number inserted.
pub fn insert_copies(graph: &mut Graph) -> Result<usize> {
    let mut crossings: Vec<(NodeId, usize, ValueRef, PartitionId, PartitionId)> = Vec::new();
    for node in graph.nodes().filter(|n| !n.op.is_copy()) {
        let consumer = graph.partition_of(node.id)?;
        for (idx, input) in node.inputs.iter().enumerate() {
            let source = graph.value_partition(*input)?;
            if source != consumer {
                crossings.push((node.id, idx, *input, source, consumer));
            }
        }
    }

    for (consumer_id, idx, value, source, destination) in &crossings {
        let copy = graph.add_node(
            Op::Copy {
                destinations: vec![*destination],
            },
            vec![*value],
            *source,
        );
        graph.node_mut(*consumer_id)?.inputs[*idx] = ValueRef::of(copy);
        trace!(
            from = source,
            to = destination,
            value = value.node,
            copy = copy,
            "Inserted copy"
        );
    }

    Ok(crossings.len())
}

/// Merge copies of the same source value into one copy with every
/// destination. Consumers are redirected to the matching output slot.
///
/// Returns the number of copies removed.
pub fn coalesce_copies(graph: &mut Graph) -> Result<usize> {
    let mut by_source: BTreeMap<ValueRef, Vec<(NodeId, Vec<PartitionId>)>> = BTreeMap::new();
    for node in graph.nodes() {
        if let (Op::Copy { destinations }, Some(source)) = (&node.op, node.inputs.first()) {
            by_source
                .entry(*source)
                .or_default()
                .push((node.id, destinations.clone()));
        }
    }

    let mut redirect: HashMap<ValueRef, ValueRef> = HashMap::new();
    let mut removed = 0;

    for group in by_source.into_values().filter(|g| g.len() > 1) {
        let keep = group[0].0;
        let mut destinations: Vec<PartitionId> = group
            .iter()
            .flat_map(|(_, dests)| dests.iter().copied())
            .collect();
        destinations.sort_unstable();
        destinations.dedup();

        for (id, dests) in &group {
            for (slot, dest) in dests.iter().enumerate() {
                // dest came from this list, so the search always succeeds
                let new_slot = destinations.binary_search(dest).unwrap_or_default();
                redirect.insert(
                    ValueRef { node: *id, slot },
                    ValueRef {
                        node: keep,
                        slot: new_slot,
                    },
                );
            }
        }

        graph.node_mut(keep)?.op = Op::Copy { destinations };
        for (id, _) in group.iter().skip(1) {
            graph.remove_node(*id);
            removed += 1;
        }
    }

    if !redirect.is_empty() {
        for node in graph.nodes_mut() {
            for input in node.inputs.iter_mut() {
                if let Some(target) = redirect.get(input) {
                    *input = *target;
                }
            }
        }
        if let Ok(output) = graph.output() {
            if let Some(target) = redirect.get(&output) {
                graph.set_output(*target);
            }
        }
    }

    Ok(removed)
}
