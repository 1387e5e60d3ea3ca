//! Vocabulary-sharded inference
//!
//! The embedding table is split by vocabulary id across N shards. The same
//! slices serve twice: for the input embedding gather and, weight-tied, for
//! the output logits.
//!
//! ## Architecture
//!
//! ```text
//!                     token ids [batch, seq_len]
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!    gather (shard 0)     gather (shard 1)  ...  gather (shard N-1)
//!    clamp, rebase,       clamp, rebase,         clamp, rebase,
//!    lookup, mask         lookup, mask           lookup, mask
//!          └────────────────────┼────────────────────┘
//!                               ▼
//!                      accumulate (barrier)
//!                               ▼
//!               stage A [dim,1] ─▶ stage B [seq_len,dim]
//!                               ▼
//!                      hidden [batch, dim]
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!    logits + top-k       logits + top-k   ...   logits + top-k
//!          └────────────────────┼────────────────────┘
//!                               ▼
//!                 rebase to global ids, merge (barrier)
//!                               ▼
//!                           Prediction
//! ```
//!
//! ## Key Components
//!
//! - [`gather`], [`accumulator`], [`projection`], [`logits`], [`topk`]: the
//!   pure per-stage computations
//! - [`InferenceCoordinator`]: runs the stages as a placed graph
//! - [`ParameterLoader`]: seeded or CBOR-file parameters
//! - [`tensor_ops`]: CPU reference kernels

pub mod accumulator;
pub mod batch;
pub mod coordinator;
pub mod gather;
pub mod job;
pub mod loader;
pub mod logits;
pub mod params;
pub mod projection;
pub mod stats;
pub mod tensor_ops;
pub mod topk;

pub use accumulator::{combine, CombinedEmbedding};
pub use batch::TokenBatch;
pub use coordinator::{infer, InferenceConfig, InferenceCoordinator};
pub use gather::{gather, LocalGatherResult};
pub use job::{InferenceRequest, InferenceResult};
pub use loader::{save_parameters, FileLoader, ParameterLoader, SeededLoader};
pub use logits::LocalLogits;
pub use params::{split_table, EmbeddingTableSlice, ModelParameters, ProjectionWeights};
pub use projection::{HiddenState, ScoreSequence};
pub use stats::InferenceStats;
pub use tensor_ops::{Tensor2D, Tensor3D};
pub use topk::{local_topk, merge, Candidate, GlobalCandidate, LocalTopK, Prediction};
