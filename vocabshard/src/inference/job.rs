//! Inference request and result types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::TokenBatch;
use super::topk::Prediction;

/// One call into the sharded pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Unique job identifier
    pub job_id: Uuid,

    /// Token ids, [batch, seq_len]
    pub tokens: TokenBatch,

    /// Number of candidates to return per batch element
    pub k: usize,
}

impl InferenceRequest {
    pub fn new(tokens: TokenBatch, k: usize) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            tokens,
            k,
        }
    }
}

/// Result of a completed inference call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub job_id: Uuid,
    pub prediction: Prediction,
    /// Tokens fed in (batch * seq_len)
    pub tokens_processed: usize,
    pub execution_time_ms: u64,
}

impl InferenceResult {
    /// Best token id for each batch element
    pub fn next_tokens(&self) -> Vec<usize> {
        self.prediction.next_tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_get_distinct_ids() {
        let tokens = TokenBatch::from_single_tokens(vec![1, 2]).unwrap();
        let a = InferenceRequest::new(tokens.clone(), 1);
        let b = InferenceRequest::new(tokens, 1);
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.k, 1);
    }
}
