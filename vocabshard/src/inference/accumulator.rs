//! Cross-shard accumulation of gather results
//!
//! This is a barrier: it needs exactly one result from every shard in the
//! plan before it sums anything. A missing or duplicated shard fails the call.

use crate::errors::{Result, ShardError};
use crate::model::shard::ShardPlan;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::gather::LocalGatherResult;
use super::tensor_ops::Tensor3D;

/// Dense [batch, seq_len, embedding_dim] embedding after summing all shards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedEmbedding {
    pub embeddings: Tensor3D,
}

/// Order results by shard id, failing unless each shard appears exactly once
pub(crate) fn order_by_shard<'a, T>(
    items: &'a [T],
    plan: &ShardPlan,
    shard_of: impl Fn(&T) -> usize,
    what: &str,
) -> Result<Vec<&'a T>> {
    let mut slots: Vec<Option<&T>> = vec![None; plan.shard_count()];
    for item in items {
        let shard_id = shard_of(item);
        let slot = slots.get_mut(shard_id).ok_or_else(|| {
            ShardError::IncompleteShardSet(format!(
                "{} from unknown shard {} (plan has {} shards)",
                what,
                shard_id,
                plan.shard_count()
            ))
        })?;
        if slot.replace(item).is_some() {
            return Err(ShardError::IncompleteShardSet(format!(
                "duplicate {} from shard {}",
                what, shard_id
            )));
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(shard_id, slot)| {
            slot.ok_or_else(|| {
                ShardError::IncompleteShardSet(format!("missing {} from shard {}", what, shard_id))
            })
        })
        .collect()
}

/// Sum every shard's gather result into one dense embedding
pub fn combine(results: &[LocalGatherResult], plan: &ShardPlan) -> Result<CombinedEmbedding> {
    let ordered = order_by_shard(results, plan, |r| r.shard_id, "gather result")?;

    let mut iter = ordered.into_iter();
    // order_by_shard guarantees one entry per shard and plans are never empty
    let first = iter.next().ok_or_else(|| {
        ShardError::IncompleteShardSet("no gather results to combine".to_string())
    })?;

    let mut sum = first.embeddings.clone();
    for result in iter {
        sum = sum.add(&result.embeddings)?;
        trace!(shard_id = result.shard_id, "Accumulated gather result");
    }

    Ok(CombinedEmbedding { embeddings: sum })
}
