//! Token batches fed into the sharded pipeline

use crate::errors::{Result, ShardError};
use serde::{Deserialize, Serialize};

/// A [batch, seq_len] block of global token ids
///
/// Ids are signed so that out-of-vocabulary inputs such as `-1` can be
/// represented; they are clamped during the embedding gather, never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBatch {
    /// Row-major ids
    pub ids: Vec<i64>,
    /// Number of sequences
    pub batch: usize,
    /// Tokens per sequence
    pub seq_len: usize,
}

impl TokenBatch {
    pub fn new(ids: Vec<i64>, batch: usize, seq_len: usize) -> Result<Self> {
        if ids.len() != batch * seq_len {
            return Err(ShardError::Shape(format!(
                "Token count {} doesn't match shape {}x{}",
                ids.len(),
                batch,
                seq_len
            )));
        }
        if batch == 0 || seq_len == 0 {
            return Err(ShardError::Shape(format!(
                "Token batch must be non-empty, got {}x{}",
                batch, seq_len
            )));
        }
        Ok(Self {
            ids,
            batch,
            seq_len,
        })
    }

    /// Build a batch from one id per sequence (seq_len = 1)
    pub fn from_single_tokens(ids: Vec<i64>) -> Result<Self> {
        let batch = ids.len();
        Self::new(ids, batch, 1)
    }

    /// Build a batch from equally long sequences
    pub fn from_sequences(sequences: &[Vec<i64>]) -> Result<Self> {
        let seq_len = sequences.first().map(Vec::len).unwrap_or(0);
        if sequences.iter().any(|s| s.len() != seq_len) {
            return Err(ShardError::Shape(
                "All sequences in a batch must have the same length".to_string(),
            ));
        }
        let ids = sequences.iter().flatten().copied().collect();
        Self::new(ids, sequences.len(), seq_len)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Id at (batch element, position)
    pub fn get(&self, b: usize, pos: usize) -> i64 {
        self.ids[b * self.seq_len + pos]
    }
}

/// Clamp a raw id into `[0, vocab_size - 1]`
///
/// `-1` (and anything below) maps to id 0; `vocab_size` (and anything above)
/// maps to the last id.
pub fn clamp_to_vocab(id: i64, vocab_size: usize) -> usize {
    let max_id = vocab_size.saturating_sub(1) as i64;
    id.clamp(0, max_id) as usize
}
