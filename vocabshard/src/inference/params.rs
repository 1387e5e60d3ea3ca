//! Model parameters, injected explicitly into the pipeline
//!
//! Every shard owns one [`EmbeddingTableSlice`], which serves both the
//! embedding gather and the weight-tied logits projection. The projection
//! stages are shared and unsharded.

use crate::errors::{Result, ShardError};
use crate::model::shard::{ShardPlan, ShardSpec};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::tensor_ops::Tensor2D;

/// Rows of the embedding table owned by a single shard
///
/// Shape [global_hi - global_lo, embedding_dim]; row 0 is global id `global_lo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTableSlice {
    pub shard_id: usize,
    pub table: Tensor2D,
}

impl EmbeddingTableSlice {
    pub fn new(shard_id: usize, table: Tensor2D) -> Self {
        Self { shard_id, table }
    }

    pub fn embedding_dim(&self) -> usize {
        self.table.cols
    }

    /// Check that this slice belongs to `shard` and has one row per owned id
    pub fn check_against(&self, shard: &ShardSpec) -> Result<()> {
        if self.shard_id != shard.shard_id {
            return Err(ShardError::Shape(format!(
                "table slice for shard {} passed to shard {}",
                self.shard_id, shard.shard_id
            )));
        }
        if self.table.rows != shard.width() {
            return Err(ShardError::Shape(format!(
                "shard {} owns {} ids but its table slice has {} rows",
                shard.shard_id,
                shard.width(),
                self.table.rows
            )));
        }
        Ok(())
    }
}

/// The two stages of the factored projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionWeights {
    /// [embedding_dim, 1]: per-position scalar score
    pub stage_a: Tensor2D,
    /// [seq_len, embedding_dim]: collapses the score sequence to one vector
    pub stage_b: Tensor2D,
}

impl ProjectionWeights {
    pub fn new(stage_a: Tensor2D, stage_b: Tensor2D) -> Result<Self> {
        if stage_a.cols != 1 {
            return Err(ShardError::Shape(format!(
                "stage A must be [embedding_dim, 1], got {}x{}",
                stage_a.rows, stage_a.cols
            )));
        }
        if stage_b.cols != stage_a.rows {
            return Err(ShardError::Shape(format!(
                "stage B must be [seq_len, {}], got {}x{}",
                stage_a.rows, stage_b.rows, stage_b.cols
            )));
        }
        Ok(Self { stage_a, stage_b })
    }

    /// Pass-through projection for embedding_dim = 1 and seq_len = 1:
    /// the hidden state equals the embedding.
    pub fn scalar_identity() -> Self {
        Self {
            stage_a: Tensor2D {
                data: vec![1.0],
                rows: 1,
                cols: 1,
            },
            stage_b: Tensor2D {
                data: vec![1.0],
                rows: 1,
                cols: 1,
            },
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.stage_a.rows
    }

    pub fn seq_len(&self) -> usize {
        self.stage_b.rows
    }
}

/// Complete parameter set for one sharded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// One slice per shard, ordered by shard id
    pub shards: Vec<EmbeddingTableSlice>,
    pub projection: ProjectionWeights,
}

impl ModelParameters {
    pub fn new(shards: Vec<EmbeddingTableSlice>, projection: ProjectionWeights) -> Self {
        Self { shards, projection }
    }

    /// Split a full `[vocab_size, embedding_dim]` table along the plan's ranges
    pub fn from_full_table(
        table: &Tensor2D,
        plan: &ShardPlan,
        projection: ProjectionWeights,
    ) -> Result<Self> {
        Ok(Self {
            shards: split_table(table, plan)?,
            projection,
        })
    }

    /// Random-normal parameters from a fixed seed
    pub fn seeded(
        seed: u64,
        plan: &ShardPlan,
        embedding_dim: usize,
        seq_len: usize,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let table = normal_tensor(&mut rng, plan.vocab_size(), embedding_dim);
        let projection = ProjectionWeights::new(
            normal_tensor(&mut rng, embedding_dim, 1),
            normal_tensor(&mut rng, seq_len, embedding_dim),
        )?;
        Self::from_full_table(&table, plan, projection)
    }

    /// Slice owned by a shard
    pub fn slice(&self, shard_id: usize) -> Result<&EmbeddingTableSlice> {
        self.shards
            .get(shard_id)
            .filter(|s| s.shard_id == shard_id)
            .ok_or_else(|| {
                ShardError::IncompleteShardSet(format!("no table slice for shard {}", shard_id))
            })
    }

    /// Check every slice and the projection against a plan
    pub fn validate(&self, plan: &ShardPlan) -> Result<()> {
        if self.shards.len() != plan.shard_count() {
            return Err(ShardError::IncompleteShardSet(format!(
                "plan has {} shards but {} table slices were supplied",
                plan.shard_count(),
                self.shards.len()
            )));
        }
        let dim = self.projection.embedding_dim();
        for spec in plan.shards() {
            let slice = self.slice(spec.shard_id)?;
            slice.check_against(spec)?;
            if slice.embedding_dim() != dim {
                return Err(ShardError::Shape(format!(
                    "shard {} embedding dim {} doesn't match projection dim {}",
                    spec.shard_id,
                    slice.embedding_dim(),
                    dim
                )));
            }
        }
        Ok(())
    }

    /// Parameter bytes held by each shard's partition
    pub fn shard_memory_bytes(&self) -> Vec<usize> {
        self.shards
            .iter()
            .map(|s| s.table.len() * std::mem::size_of::<f32>())
            .collect()
    }

    /// Serialize to CBOR bytes
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ShardError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| ShardError::Serialization(e.to_string()))
    }
}

/// Cut a full embedding table into one slice per shard
pub fn split_table(table: &Tensor2D, plan: &ShardPlan) -> Result<Vec<EmbeddingTableSlice>> {
    if table.rows != plan.vocab_size() {
        return Err(ShardError::Shape(format!(
            "table has {} rows but the vocabulary has {} ids",
            table.rows,
            plan.vocab_size()
        )));
    }
    plan.shards()
        .iter()
        .map(|spec| {
            let rows = table.row_slice(spec.global_lo, spec.global_hi)?;
            Ok(EmbeddingTableSlice::new(spec.shard_id, rows))
        })
        .collect()
}

fn normal_tensor(rng: &mut StdRng, rows: usize, cols: usize) -> Tensor2D {
    let data = (0..rows * cols)
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Tensor2D { data, rows, cols }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::shard::plan;

    fn table(vocab: usize, dim: usize) -> Tensor2D {
        Tensor2D::new((0..vocab * dim).map(|i| i as f32).collect(), vocab, dim).unwrap()
    }

    #[test]
    fn test_split_table_follows_plan() {
        let plan = plan(10, 3).unwrap();
        let slices = split_table(&table(10, 2), &plan).unwrap();

        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].table.rows, 3);
        assert_eq!(slices[2].table.rows, 4);
        // Row 0 of shard 1 is global id 3
        assert_eq!(slices[1].table.row(0), &[6.0, 7.0]);
        // Last row of the last shard is global id 9
        assert_eq!(slices[2].table.row(3), &[18.0, 19.0]);
    }

    #[test]
    fn test_split_table_rejects_wrong_vocab() {
        let plan = plan(10, 2).unwrap();
        assert!(matches!(
            split_table(&table(9, 2), &plan),
            Err(ShardError::Shape(_))
        ));
    }

    #[test]
    fn test_projection_weights_shapes() {
        assert!(ProjectionWeights::new(Tensor2D::zeros(4, 1), Tensor2D::zeros(3, 4)).is_ok());
        assert!(ProjectionWeights::new(Tensor2D::zeros(4, 2), Tensor2D::zeros(3, 4)).is_err());
        assert!(ProjectionWeights::new(Tensor2D::zeros(4, 1), Tensor2D::zeros(3, 5)).is_err());
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let plan = plan(16, 4).unwrap();
        let a = ModelParameters::seeded(7, &plan, 3, 2).unwrap();
        let b = ModelParameters::seeded(7, &plan, 3, 2).unwrap();
        let c = ModelParameters::seeded(8, &plan, 3, 2).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.validate(&plan).is_ok());
        assert_eq!(a.projection.seq_len(), 2);
    }

    #[test]
    fn test_validate_detects_missing_shard() {
        let plan = plan(8, 2).unwrap();
        let mut params = ModelParameters::seeded(1, &plan, 2, 1).unwrap();
        params.shards.pop();
        assert!(matches!(
            params.validate(&plan),
            Err(ShardError::IncompleteShardSet(_))
        ));
    }

    #[test]
    fn test_validate_detects_wrong_width() {
        let plan = plan(8, 2).unwrap();
        let mut params = ModelParameters::seeded(1, &plan, 2, 1).unwrap();
        params.shards[1].table = Tensor2D::zeros(3, 2);
        assert!(matches!(params.validate(&plan), Err(ShardError::Shape(_))));
    }

    #[test]
    fn test_cbor_roundtrip() {
        let plan = plan(8, 2).unwrap();
        let params = ModelParameters::seeded(3, &plan, 2, 2).unwrap();
        let bytes = params.to_cbor().unwrap();
        let decoded = ModelParameters::from_cbor(&bytes).unwrap();
        assert_eq!(params, decoded);
    }

    #[test]
    fn test_shard_memory_bytes() {
        let plan = plan(10, 3).unwrap();
        let params = ModelParameters::seeded(3, &plan, 2, 1).unwrap();
        assert_eq!(params.shard_memory_bytes(), vec![24, 24, 32]);
    }
}
