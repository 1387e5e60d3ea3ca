//! Vocabulary shard ranges and the planner that computes them
//!
//! Each shard owns a contiguous range of global token ids and the matching
//! rows of the embedding table. The same ranges drive the embedding gather
//! and the weight-tied output projection.

use crate::errors::{Result, ShardError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single shard's contiguous slice of the vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardSpec {
    /// Shard position in the plan (0-indexed)
    pub shard_id: usize,

    /// First global id owned by this shard (inclusive)
    pub global_lo: usize,

    /// One past the last global id owned by this shard (exclusive)
    pub global_hi: usize,

    /// Total shards in the plan this spec belongs to
    pub shard_count: usize,

    /// Vocabulary size the plan was computed for
    pub vocab_size: usize,
}

impl ShardSpec {
    /// Number of vocabulary ids (and table rows) owned by this shard
    pub fn width(&self) -> usize {
        self.global_hi - self.global_lo
    }

    /// Check if a global id falls in this shard's range
    pub fn contains(&self, global_id: usize) -> bool {
        global_id >= self.global_lo && global_id < self.global_hi
    }

    /// Rebase a shard-local index to a global vocabulary id
    pub fn to_global(&self, local_index: usize) -> usize {
        local_index + self.global_lo
    }

    /// Get the id range as a tuple
    pub fn range(&self) -> (usize, usize) {
        (self.global_lo, self.global_hi)
    }

    /// Whether this is the last shard (the one that absorbs the remainder)
    pub fn is_last(&self) -> bool {
        self.shard_id + 1 == self.shard_count
    }
}

/// Ordered, gap-free partition of `[0, vocab_size)` into shards
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardPlan {
    vocab_size: usize,
    shards: Vec<ShardSpec>,
}

impl ShardPlan {
    /// Split `vocab_size` ids into `shard_count` contiguous ranges.
    ///
    /// Every shard gets `vocab_size / shard_count` ids and the last shard
    /// absorbs the remainder, so no shard is ever empty.
    pub fn new(vocab_size: usize, shard_count: usize) -> Result<Self> {
        if shard_count == 0 {
            return Err(ShardError::Config(
                "shard count must be at least 1".to_string(),
            ));
        }
        if vocab_size < shard_count {
            return Err(ShardError::Config(format!(
                "vocab size {} cannot give each of {} shards at least one id",
                vocab_size, shard_count
            )));
        }

        let ids_per_shard = vocab_size / shard_count;
        let shards = (0..shard_count)
            .map(|shard_id| {
                let global_lo = shard_id * ids_per_shard;
                let global_hi = if shard_id == shard_count - 1 {
                    vocab_size // Last shard gets any remainder
                } else {
                    (shard_id + 1) * ids_per_shard
                };
                ShardSpec {
                    shard_id,
                    global_lo,
                    global_hi,
                    shard_count,
                    vocab_size,
                }
            })
            .collect::<Vec<_>>();

        debug!(
            vocab_size,
            shard_count,
            ids_per_shard,
            last_width = shards[shard_count - 1].width(),
            "Computed shard plan"
        );

        Ok(Self { vocab_size, shards })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[ShardSpec] {
        &self.shards
    }

    /// Get a shard by id
    pub fn shard(&self, shard_id: usize) -> Result<&ShardSpec> {
        self.shards.get(shard_id).ok_or_else(|| {
            ShardError::Config(format!(
                "shard {} does not exist in a plan of {} shards",
                shard_id,
                self.shards.len()
            ))
        })
    }

    /// Shard owning a global id, if the id lies inside the vocabulary
    pub fn owner_of(&self, global_id: usize) -> Option<&ShardSpec> {
        if global_id >= self.vocab_size {
            return None;
        }
        // Ranges are sorted and contiguous
        let idx = self
            .shards
            .partition_point(|spec| spec.global_hi <= global_id);
        self.shards.get(idx)
    }
}

/// Compute the shard ranges for a vocabulary
pub fn plan(vocab_size: usize, shard_count: usize) -> Result<ShardPlan> {
    ShardPlan::new(vocab_size, shard_count)
}
