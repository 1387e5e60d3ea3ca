//! Runtime values flowing along graph edges

use crate::errors::{Result, ShardError};
use crate::inference::accumulator::CombinedEmbedding;
use crate::inference::batch::TokenBatch;
use crate::inference::gather::LocalGatherResult;
use crate::inference::logits::LocalLogits;
use crate::inference::projection::{HiddenState, ScoreSequence};
use crate::inference::topk::{LocalTopK, Prediction};

#[derive(Debug, Clone)]
pub enum Value {
    Tokens(TokenBatch),
    Gathered(LocalGatherResult),
    Combined(CombinedEmbedding),
    Scores(ScoreSequence),
    Hidden(HiddenState),
    Logits(LocalLogits),
    TopK(LocalTopK),
    Prediction(Prediction),
}

macro_rules! accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Result<&$ty> {
            match self {
                Value::$variant(v) => Ok(v),
                other => Err(ShardError::Execution(format!(
                    "expected {} value, got {}",
                    stringify!($variant),
                    other.kind()
                ))),
            }
        }
    };
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tokens(_) => "Tokens",
            Value::Gathered(_) => "Gathered",
            Value::Combined(_) => "Combined",
            Value::Scores(_) => "Scores",
            Value::Hidden(_) => "Hidden",
            Value::Logits(_) => "Logits",
            Value::TopK(_) => "TopK",
            Value::Prediction(_) => "Prediction",
        }
    }

    accessor!(as_tokens, Tokens, TokenBatch);
    accessor!(as_gathered, Gathered, LocalGatherResult);
    accessor!(as_combined, Combined, CombinedEmbedding);
    accessor!(as_scores, Scores, ScoreSequence);
    accessor!(as_hidden, Hidden, HiddenState);
    accessor!(as_logits, Logits, LocalLogits);
    accessor!(as_topk, TopK, LocalTopK);
    accessor!(as_prediction, Prediction, Prediction);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessor_rejects_wrong_kind() {
        let value = Value::Tokens(TokenBatch::from_single_tokens(vec![1]).unwrap());
        assert!(value.as_tokens().is_ok());
        let err = value.as_hidden().unwrap_err();
        assert!(err.to_string().contains("expected Hidden value, got Tokens"));
    }
}
