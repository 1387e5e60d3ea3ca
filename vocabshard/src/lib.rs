pub mod config;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod inference;
pub mod model;
pub mod observability;

pub use config::Config;
pub use errors::{Result, ShardError};
pub use executor::{Executor, LocalExecutor, PreparedGraph};
pub use graph::{build, Graph, GraphOptions, Op};
pub use inference::{
    infer, EmbeddingTableSlice, InferenceCoordinator, InferenceRequest, InferenceResult,
    ModelParameters, Prediction, ProjectionWeights, TokenBatch,
};
pub use model::{plan, ShardPlan, ShardSpec};
