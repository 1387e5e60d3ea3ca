//! Inference coordinator for vocabulary-sharded inference
//!
//! The InferenceCoordinator owns everything one deployment needs:
//!
//! - the shard plan and the injected parameters
//! - an executor and the graphs prepared on it (one per requested k)
//! - call statistics

use crate::config::Config;
use crate::errors::Result;
use crate::executor::{Executor, LocalExecutor, PreparedGraph};
use crate::graph::{build, GraphOptions};
use crate::model::shard::{plan, ShardPlan};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};

use super::batch::TokenBatch;
use super::job::{InferenceRequest, InferenceResult};
use super::loader::ParameterLoader;
use super::params::{EmbeddingTableSlice, ModelParameters, ProjectionWeights};
use super::stats::InferenceStats;
use super::topk::Prediction;

/// Configuration for the inference coordinator
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Timeout for a whole inference call
    pub timeout: Duration,

    /// Coalesce copies of one value into a multi-destination copy
    pub coalesce_copies: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            coalesce_copies: true,
        }
    }
}

impl From<&Config> for InferenceConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeout: Duration::from_millis(config.executor.timeout_ms),
            coalesce_copies: config.executor.coalesce_copies,
        }
    }
}

pub struct InferenceCoordinator {
    plan: ShardPlan,
    params: Arc<ModelParameters>,
    executor: Arc<dyn Executor>,
    config: InferenceConfig,
    stats: Arc<InferenceStats>,

    /// Prepared graphs by top-k width
    prepared: RwLock<HashMap<usize, Arc<PreparedGraph>>>,
}

impl InferenceCoordinator {
    /// Create a coordinator running on a [`LocalExecutor`]
    pub fn new(plan: ShardPlan, params: ModelParameters, config: InferenceConfig) -> Result<Self> {
        params.validate(&plan)?;
        let executor: Arc<dyn Executor> = Arc::new(LocalExecutor::new(config.timeout));

        info!(
            vocab_size = plan.vocab_size(),
            shards = plan.shard_count(),
            embedding_dim = params.projection.embedding_dim(),
            seq_len = params.projection.seq_len(),
            "Inference coordinator ready"
        );

        Ok(Self {
            plan,
            params: Arc::new(params),
            executor,
            config,
            stats: Arc::new(InferenceStats::new()),
            prepared: RwLock::new(HashMap::new()),
        })
    }

    /// Load parameters through `loader`, then create the coordinator
    pub async fn from_loader(
        plan: ShardPlan,
        loader: &dyn ParameterLoader,
        config: InferenceConfig,
    ) -> Result<Self> {
        debug!(loader = %loader.describe(), "Loading parameters");
        let params = loader.load(&plan).await?;
        Self::new(plan, params, config)
    }

    /// Swap the executor. Graphs prepared on the old one are dropped.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self.prepared = RwLock::new(HashMap::new());
        self
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn params(&self) -> &Arc<ModelParameters> {
        &self.params
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<InferenceStats> {
        &self.stats
    }

    /// Get or prepare the graph for a top-k width
    pub async fn prepared_graph(&self, k: usize) -> Result<Arc<PreparedGraph>> {
        {
            let cache = self.prepared.read().await;
            if let Some(prepared) = cache.get(&k) {
                return Ok(Arc::clone(prepared));
            }
        }

        let options = GraphOptions {
            top_k: k,
            coalesce_copies: self.config.coalesce_copies,
        };
        let graph = build(&self.plan, &options)?;
        let prepared = Arc::new(
            self.executor
                .prepare(graph, Arc::clone(&self.params))
                .await?,
        );
        self.stats.record_prepare();

        let mut cache = self.prepared.write().await;
        let entry = cache.entry(k).or_insert_with(|| Arc::clone(&prepared));
        debug!(k = k, waves = entry.waves().len(), "Graph prepared");
        Ok(Arc::clone(entry))
    }

    /// Run one inference call. Any error fails the whole call.
    #[instrument(skip(self, request), fields(job_id = %request.job_id, k = request.k))]
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResult> {
        let start = Instant::now();
        let tokens_processed = request.tokens.len();

        info!(
            job_id = %request.job_id,
            batch = request.tokens.batch,
            seq_len = request.tokens.seq_len,
            k = request.k,
            "Starting inference"
        );

        let outcome = match self.prepared_graph(request.k).await {
            Ok(prepared) => self
                .executor
                .run(&prepared, request.tokens)
                .await
                .map(|prediction| (prediction, prepared)),
            Err(e) => Err(e),
        };
        let execution_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok((prediction, prepared)) => {
                self.stats.record_success(
                    tokens_processed as u64,
                    prepared.graph().shard_task_count() as u64,
                    prepared.graph().copy_count() as u64,
                    execution_time_ms,
                );
                info!(
                    job_id = %request.job_id,
                    next_tokens = ?prediction.next_tokens(),
                    execution_time_ms = execution_time_ms,
                    "Inference completed"
                );
                Ok(InferenceResult {
                    job_id: request.job_id,
                    prediction,
                    tokens_processed,
                    execution_time_ms,
                })
            }
            Err(e) => {
                self.stats.record_failure();
                error!(job_id = %request.job_id, error = %e, "Inference failed");
                Err(e)
            }
        }
    }
}

/// One-shot inference over explicitly supplied shard weights.
///
/// The plan is recovered from the slices: N is their count and V the sum of
/// their widths, which must follow the remainder policy.
pub async fn infer(
    tokens: TokenBatch,
    shard_weights: Vec<EmbeddingTableSlice>,
    projection_weights: ProjectionWeights,
    k: usize,
) -> Result<Prediction> {
    let vocab_size: usize = shard_weights.iter().map(|s| s.table.rows).sum();
    let plan = plan(vocab_size, shard_weights.len())?;
    let params = ModelParameters::new(shard_weights, projection_weights);
    let coordinator = InferenceCoordinator::new(plan, params, InferenceConfig::default())?;

    let result = coordinator
        .infer(InferenceRequest::new(tokens, k))
        .await?;
    Ok(result.prediction)
}

impl std::fmt::Debug for InferenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceCoordinator")
            .field("plan", &self.plan)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
