//! Distributed top-k: local selection per shard, then a global merge
//!
//! ```text
//! shard 0 logits ─▶ local top-k (score, local) ─▶ rebase +lo₀ ─┐
//! shard 1 logits ─▶ local top-k (score, local) ─▶ rebase +lo₁ ─┼─▶ concat (N×k) ─▶ global top-k
//!   ...                                                        │
//! shard N logits ─▶ local top-k (score, local) ─▶ rebase +loₙ ─┘
//! ```
//!
//! Ranking everywhere is score descending, ties to the lower index. Within a
//! shard that is the lower local index; across shards rebasing preserves
//! order, so the merge breaks ties by the lower global id. Since every member
//! of the global top-k is in its own shard's local top-k, the merge is exact.

use crate::errors::{Result, ShardError};
use crate::model::shard::{ShardPlan, ShardSpec};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::accumulator::order_by_shard;
use super::logits::LocalLogits;
use super::tensor_ops::{rank_order, top_k};

/// A shard-local candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub score: f32,
    pub local_index: usize,
}

/// A candidate rebased into the global vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalCandidate {
    pub score: f32,
    pub token_id: usize,
}

/// One shard's ranked candidates for every batch element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTopK {
    pub shard_id: usize,
    /// `candidates[b]` holds up to k candidates for batch element `b`
    pub candidates: Vec<Vec<Candidate>>,
}

impl LocalTopK {
    /// Rebase local indices to global ids
    pub fn rebase(&self, shard: &ShardSpec) -> Vec<Vec<GlobalCandidate>> {
        self.candidates
            .iter()
            .map(|row| {
                row.iter()
                    .map(|c| GlobalCandidate {
                        score: c.score,
                        token_id: shard.to_global(c.local_index),
                    })
                    .collect()
            })
            .collect()
    }
}

/// Global top-k for each batch element, best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub top_k: Vec<Vec<GlobalCandidate>>,
}

impl Prediction {
    /// Best candidate for one batch element
    pub fn top1(&self, b: usize) -> Option<GlobalCandidate> {
        self.top_k.get(b).and_then(|row| row.first().copied())
    }

    /// Best token id for every batch element
    pub fn next_tokens(&self) -> Vec<usize> {
        self.top_k
            .iter()
            .filter_map(|row| row.first().map(|c| c.token_id))
            .collect()
    }

    pub fn batch(&self) -> usize {
        self.top_k.len()
    }
}

fn check_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(ShardError::Config("top-k requires k >= 1".to_string()));
    }
    Ok(())
}

/// Rank this shard's logits and keep the best k per batch element
pub fn local_topk(shard: &ShardSpec, logits: &LocalLogits, k: usize) -> Result<LocalTopK> {
    check_k(k)?;
    if logits.shard_id != shard.shard_id {
        return Err(ShardError::Shape(format!(
            "logits of shard {} passed to shard {}",
            logits.shard_id, shard.shard_id
        )));
    }
    if logits.scores.cols != shard.width() {
        return Err(ShardError::Shape(format!(
            "shard {} owns {} ids but has {} logits",
            shard.shard_id,
            shard.width(),
            logits.scores.cols
        )));
    }
    if shard.width() < k {
        return Err(ShardError::EmptyShardResult {
            shard_id: shard.shard_id,
            available: shard.width(),
            required: k,
        });
    }

    let candidates = (0..logits.scores.rows)
        .map(|b| {
            top_k(logits.row(b), k)
                .into_iter()
                .map(|(score, local_index)| Candidate { score, local_index })
                .collect()
        })
        .collect();

    Ok(LocalTopK {
        shard_id: shard.shard_id,
        candidates,
    })
}

/// Merge every shard's local top-k into the global top-k
pub fn merge(locals: &[LocalTopK], plan: &ShardPlan, k: usize) -> Result<Prediction> {
    check_k(k)?;
    let ordered = order_by_shard(locals, plan, |l| l.shard_id, "top-k result")?;

    let batch = ordered[0].candidates.len();
    for local in &ordered {
        if local.candidates.len() != batch {
            return Err(ShardError::Shape(format!(
                "shard {} returned {} batch rows, expected {}",
                local.shard_id,
                local.candidates.len(),
                batch
            )));
        }
        if let Some(short) = local.candidates.iter().find(|row| row.len() < k) {
            return Err(ShardError::EmptyShardResult {
                shard_id: local.shard_id,
                available: short.len(),
                required: k,
            });
        }
        let width = plan.shard(local.shard_id)?.width();
        if let Some(c) = local
            .candidates
            .iter()
            .flatten()
            .find(|c| c.local_index >= width)
        {
            return Err(ShardError::Shape(format!(
                "shard {} returned local index {} but owns {} ids",
                local.shard_id, c.local_index, width
            )));
        }
    }

    let rebased: Vec<Vec<Vec<GlobalCandidate>>> = ordered
        .iter()
        .map(|local| Ok(local.rebase(plan.shard(local.shard_id)?)))
        .collect::<Result<_>>()?;

    let top_k = (0..batch)
        .map(|b| {
            // Concatenate in shard order: N * k candidates
            let mut pool: Vec<GlobalCandidate> = rebased
                .iter()
                .flat_map(|shard_rows| shard_rows[b].iter().copied())
                .collect();
            pool.sort_by(|x, y| rank_order((x.score, x.token_id), (y.score, y.token_id)));
            pool.truncate(k);
            trace!(batch_idx = b, top_token = ?pool.first(), "Merged candidates");
            pool
        })
        .collect();

    Ok(Prediction { top_k })
}
