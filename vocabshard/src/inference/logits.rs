//! Weight-tied per-shard logits
//!
//! Each shard scores only its own vocabulary range by multiplying its
//! embedding table slice with the shared hidden state:
//! `[shard_width, dim] @ [dim, batch] = [shard_width, batch]`.

use crate::errors::{Result, ShardError};
use crate::model::shard::ShardSpec;
use serde::{Deserialize, Serialize};

use super::params::EmbeddingTableSlice;
use super::projection::HiddenState;
use super::tensor_ops::{matmul, Tensor2D};

/// Scores over one shard's vocabulary range, stored as [batch, shard_width]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalLogits {
    pub shard_id: usize,
    pub scores: Tensor2D,
}

impl LocalLogits {
    /// Scores for one batch element, indexed by shard-local id
    pub fn row(&self, b: usize) -> &[f32] {
        self.scores.row(b)
    }
}

/// Project the hidden state against this shard's table slice
pub fn project(
    shard: &ShardSpec,
    table_slice: &EmbeddingTableSlice,
    hidden: &HiddenState,
) -> Result<LocalLogits> {
    table_slice.check_against(shard)?;
    if table_slice.embedding_dim() != hidden.embedding_dim() {
        return Err(ShardError::Shape(format!(
            "shard {} table dim {} doesn't match hidden dim {}",
            shard.shard_id,
            table_slice.embedding_dim(),
            hidden.embedding_dim()
        )));
    }

    let hidden_t = hidden.hidden.transpose();
    let logits = matmul(&table_slice.table, &hidden_t)?;

    Ok(LocalLogits {
        shard_id: shard.shard_id,
        scores: logits.transpose(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::params::split_table;
    use crate::model::shard::plan;

    #[test]
    fn test_one_hot_hidden_selects_table_column() {
        let plan = plan(6, 2).unwrap();
        // dim 2: row i = [i, 10 * i]
        let table = Tensor2D::new(
            (0..6).flat_map(|i| [i as f32, 10.0 * i as f32]).collect(),
            6,
            2,
        )
        .unwrap();
        let slices = split_table(&table, &plan).unwrap();
        let hidden = HiddenState::new(Tensor2D::new(vec![0.0, 1.0, 1.0, 0.0], 2, 2).unwrap());

        let logits = project(&plan.shards()[1], &slices[1], &hidden).unwrap();
        assert_eq!(logits.scores.shape(), (2, 3));
        // Batch 0 picks the second feature of ids 3, 4, 5
        assert_eq!(logits.row(0), &[30.0, 40.0, 50.0]);
        // Batch 1 picks the first feature
        assert_eq!(logits.row(1), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_dim_mismatch_is_shape_error() {
        let plan = plan(4, 2).unwrap();
        let table = Tensor2D::zeros(4, 3);
        let slices = split_table(&table, &plan).unwrap();
        let hidden = HiddenState::new(Tensor2D::zeros(1, 2));

        assert!(matches!(
            project(&plan.shards()[0], &slices[0], &hidden),
            Err(ShardError::Shape(_))
        ));
    }

    #[test]
    fn test_wrong_slice_is_shape_error() {
        let plan = plan(5, 2).unwrap();
        let table = Tensor2D::zeros(5, 1);
        let slices = split_table(&table, &plan).unwrap();
        let hidden = HiddenState::new(Tensor2D::zeros(1, 1));

        assert!(matches!(
            project(&plan.shards()[1], &slices[0], &hidden),
            Err(ShardError::Shape(_))
        ));
    }
}
