use thiserror::Error;

/// Errors that can occur while planning, building or running a sharded inference.
#[derive(Error, Debug)]
pub enum ShardError {
    /// Bad shard count, vocabulary size or other planning-time parameter
    #[error("Configuration error: {0}")]
    Config(String),

    /// A component received a tensor whose shape does not match its contract
    #[error("Shape error: {0}")]
    Shape(String),

    /// The accumulator or merge step did not receive exactly one result per shard
    #[error("Incomplete shard set: {0}")]
    IncompleteShardSet(String),

    /// A shard produced fewer top-k candidates than required
    #[error("Empty shard result: shard {shard_id} produced {available} candidates, {required} required")]
    EmptyShardResult {
        shard_id: usize,
        available: usize,
        required: usize,
    },

    /// The dataflow graph or its placement is inconsistent
    #[error("Placement error: {0}")]
    Placement(String),

    /// A scheduled task failed to complete
    #[error("Execution error: {0}")]
    Execution(String),

    /// The executor did not finish the call in time
    #[error("Inference timed out after {0}ms")]
    Timeout(u64),

    /// IO error occurred (config files, parameter files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for vocabshard operations.
pub type Result<T> = std::result::Result<T, ShardError>;

impl From<toml::ser::Error> for ShardError {
    fn from(e: toml::ser::Error) -> Self {
        ShardError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(e: serde_json::Error) -> Self {
        ShardError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ShardError {
    fn from(e: toml::de::Error) -> Self {
        ShardError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ShardError {
    fn from(e: tokio::task::JoinError) -> Self {
        ShardError::Execution(e.to_string())
    }
}
