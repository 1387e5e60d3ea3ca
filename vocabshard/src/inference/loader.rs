//! Parameter loading
//!
//! Parameters are always injected explicitly. A [`ParameterLoader`] produces
//! a validated [`ModelParameters`] for a plan, either generated from a seed
//! or read from a CBOR parameter file.

use crate::errors::{Result, ShardError};
use crate::model::shard::ShardPlan;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use super::params::ModelParameters;

#[async_trait]
pub trait ParameterLoader: Send + Sync {
    /// Load parameters matching `plan`
    async fn load(&self, plan: &ShardPlan) -> Result<ModelParameters>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Random-normal parameters from a fixed seed
#[derive(Debug, Clone)]
pub struct SeededLoader {
    pub seed: u64,
    pub embedding_dim: usize,
    pub seq_len: usize,
}

impl SeededLoader {
    pub fn new(seed: u64, embedding_dim: usize, seq_len: usize) -> Self {
        Self {
            seed,
            embedding_dim,
            seq_len,
        }
    }
}

#[async_trait]
impl ParameterLoader for SeededLoader {
    async fn load(&self, plan: &ShardPlan) -> Result<ModelParameters> {
        let start = Instant::now();
        let plan = plan.clone();
        let (seed, dim, seq_len) = (self.seed, self.embedding_dim, self.seq_len);

        // Large vocabularies take a while to fill
        let params = tokio::task::spawn_blocking(move || {
            ModelParameters::seeded(seed, &plan, dim, seq_len)
        })
        .await??;

        info!(
            seed = seed,
            embedding_dim = dim,
            seq_len = seq_len,
            shard_bytes = ?params.shard_memory_bytes(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Generated seeded parameters"
        );
        Ok(params)
    }

    fn describe(&self) -> String {
        format!("seeded(seed={})", self.seed)
    }
}

/// Parameters stored as a CBOR file
#[derive(Debug, Clone)]
pub struct FileLoader {
    path: PathBuf,
}

impl FileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ParameterLoader for FileLoader {
    async fn load(&self, plan: &ShardPlan) -> Result<ModelParameters> {
        debug!(path = %self.path.display(), "Reading parameter file");
        let bytes = tokio::fs::read(&self.path).await?;
        let params = ModelParameters::from_cbor(&bytes)?;
        params.validate(plan)?;

        info!(
            path = %self.path.display(),
            bytes = bytes.len(),
            shards = params.shards.len(),
            "Loaded parameter file"
        );
        Ok(params)
    }

    fn describe(&self) -> String {
        format!("file({})", self.path.display())
    }
}

/// Write parameters as CBOR (atomic: temp file, then rename)
pub async fn save_parameters(params: &ModelParameters, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = params.to_cbor()?;
    let temp_path = path.with_extension("cbor.tmp");
    tokio::fs::write(&temp_path, &bytes).await?;
    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        tracing::error!(
            from = %temp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp parameter file"
        );
        ShardError::Io(e)
    })?;

    info!(path = %path.display(), bytes = bytes.len(), "Saved parameters");
    Ok(())
}
