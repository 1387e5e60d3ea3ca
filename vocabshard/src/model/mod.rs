//! Vocabulary shard planning
//!
//! The vocabulary `[0, V)` is cut into N contiguous ranges, one per shard:
//!
//! ```text
//! Vocabulary (V = 10, N = 3)
//! ┌─────────┬─────────┬─────────────┐
//! │ shard 0 │ shard 1 │   shard 2   │
//! │  0 - 2  │  3 - 5  │    6 - 9    │
//! └─────────┴─────────┴─────────────┘
//! ```
//!
//! The last shard absorbs the remainder.

pub mod shard;

pub use shard::{plan, ShardPlan, ShardSpec};
