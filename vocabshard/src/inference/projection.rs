//! Shared two-stage projection from embeddings to one hidden vector per sequence
//!
//! ```text
//! combined  [batch, seq_len, dim]
//!    │  @ stage_a [dim, 1]
//!    ▼
//! scores    [batch, seq_len, 1]  ──transpose──▶ [batch, 1, seq_len]
//!    │  @ stage_b [seq_len, dim]
//!    ▼
//! hidden    [batch, 1, dim]      ──squeeze───▶ [batch, dim]
//! ```
//!
//! The rank-1 bottleneck collapses the whole sequence into a single vector.
//! This stage is not sharded.

use crate::errors::{Result, ShardError};
use serde::{Deserialize, Serialize};

use super::accumulator::CombinedEmbedding;
use super::params::ProjectionWeights;
use super::tensor_ops::{batched_matmul, Tensor2D, Tensor3D};

/// Stage A output, already transposed to [batch, 1, seq_len]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSequence {
    pub scores: Tensor3D,
}

/// One hidden vector per batch element: [batch, embedding_dim]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenState {
    pub hidden: Tensor2D,
}

impl HiddenState {
    pub fn new(hidden: Tensor2D) -> Self {
        Self { hidden }
    }

    pub fn batch(&self) -> usize {
        self.hidden.rows
    }

    pub fn embedding_dim(&self) -> usize {
        self.hidden.cols
    }
}

/// Stage A: per-position scalar score, transposed for stage B
pub fn stage_a(combined: &CombinedEmbedding, weights: &ProjectionWeights) -> Result<ScoreSequence> {
    let embeddings = &combined.embeddings;
    if embeddings.cols != weights.embedding_dim() {
        return Err(ShardError::Shape(format!(
            "stage A expects embedding dim {}, got {}",
            weights.embedding_dim(),
            embeddings.cols
        )));
    }
    if embeddings.rows != weights.seq_len() {
        return Err(ShardError::Shape(format!(
            "projection was built for seq_len {}, got {}",
            weights.seq_len(),
            embeddings.rows
        )));
    }

    // [batch, seq_len, dim] @ [dim, 1] -> [batch, seq_len, 1] -> [batch, 1, seq_len]
    let scores = batched_matmul(embeddings, &weights.stage_a)?.transpose_inner();
    Ok(ScoreSequence { scores })
}

/// Stage B: collapse the score sequence into one hidden vector
pub fn stage_b(scores: &ScoreSequence, weights: &ProjectionWeights) -> Result<HiddenState> {
    // [batch, 1, seq_len] @ [seq_len, dim] -> [batch, 1, dim] -> [batch, dim]
    let projected = batched_matmul(&scores.scores, &weights.stage_b)?;
    Ok(HiddenState::new(projected.squeeze_middle()?))
}

/// Run both stages
pub fn project(combined: &CombinedEmbedding, weights: &ProjectionWeights) -> Result<HiddenState> {
    stage_b(&stage_a(combined, weights)?, weights)
}
