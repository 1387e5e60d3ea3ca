//! Per-shard masked embedding gather
//!
//! For each token position a shard:
//!
//! 1. clamps the raw id into the vocabulary (`-1` -> 0, `V` -> `V - 1`),
//! 2. clamps it again into its own range `[global_lo, global_hi - 1]`,
//! 3. rebases to a local row `clamped - global_lo`,
//! 4. looks the row up in its table slice,
//! 5. replaces the row with zeros when it does not own the id.
//!
//! Step 5 makes every non-owning shard contribute the additive identity, so
//! summing all shards' results reproduces the unsharded lookup exactly.

use crate::errors::Result;
use crate::model::shard::ShardSpec;
use serde::{Deserialize, Serialize};

use super::batch::{clamp_to_vocab, TokenBatch};
use super::params::EmbeddingTableSlice;
use super::tensor_ops::{gather_rows, Tensor3D};

/// One shard's contribution to the combined embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalGatherResult {
    pub shard_id: usize,
    /// [batch, seq_len, embedding_dim]
    pub embeddings: Tensor3D,
}

/// Shard-local row for a raw id, and whether this shard owns the id
pub fn local_row(shard: &ShardSpec, id: i64) -> (usize, bool) {
    let global = clamp_to_vocab(id, shard.vocab_size);
    let clamped = global.clamp(shard.global_lo, shard.global_hi - 1);
    (clamped - shard.global_lo, shard.contains(global))
}

/// Gather this shard's embedding rows for every position of the batch
pub fn gather(
    shard: &ShardSpec,
    table_slice: &EmbeddingTableSlice,
    ids: &TokenBatch,
) -> Result<LocalGatherResult> {
    table_slice.check_against(shard)?;

    let (rows, owned): (Vec<usize>, Vec<bool>) =
        ids.ids.iter().map(|&id| local_row(shard, id)).unzip();

    let mut gathered = gather_rows(&table_slice.table, &rows)?;
    let dim = gathered.cols;
    for (pos, owns) in owned.into_iter().enumerate() {
        if !owns {
            gathered.data[pos * dim..(pos + 1) * dim].fill(0.0);
        }
    }

    Ok(LocalGatherResult {
        shard_id: shard.shard_id,
        embeddings: Tensor3D::new(gathered.data, ids.batch, ids.seq_len, dim)?,
    })
}
