//! In-process executor
//!
//! Runs a prepared graph wave by wave. Every compute node of a wave gets its
//! own blocking task and the wave finishes when all of them do, which makes
//! the accumulator and the merge natural barriers. Copies and the input are
//! resolved inline by sharing the produced value.

use crate::errors::{Result, ShardError};
use crate::graph::{NodeId, Op};
use crate::inference::accumulator::combine;
use crate::inference::batch::TokenBatch;
use crate::inference::gather::{gather, LocalGatherResult};
use crate::inference::logits;
use crate::inference::params::ModelParameters;
use crate::inference::projection::{stage_a, stage_b};
use crate::inference::topk::{local_topk, merge, LocalTopK, Prediction};
use crate::model::shard::ShardPlan;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use super::value::Value;
use super::{Executor, PreparedGraph};

pub struct LocalExecutor {
    timeout: Duration,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn execute(&self, prepared: &PreparedGraph, tokens: TokenBatch) -> Result<Prediction> {
        let graph = Arc::clone(prepared.graph());
        let tokens = Arc::new(Value::Tokens(tokens));
        let mut values: HashMap<NodeId, Arc<Value>> = HashMap::with_capacity(graph.node_count());

        for (wave_idx, wave) in prepared.waves().iter().enumerate() {
            let mut handles = Vec::with_capacity(wave.len());

            for &id in wave {
                let node = graph.node(id)?;
                let inputs: Vec<Arc<Value>> = node
                    .inputs
                    .iter()
                    .map(|v| {
                        values.get(&v.node).cloned().ok_or_else(|| {
                            ShardError::Execution(format!(
                                "node {} scheduled before its input {}",
                                id, v.node
                            ))
                        })
                    })
                    .collect::<Result<_>>()?;

                match &node.op {
                    Op::Input => {
                        values.insert(id, Arc::clone(&tokens));
                    }
                    Op::Copy { .. } => {
                        let source = inputs.into_iter().next().ok_or_else(|| {
                            ShardError::Execution(format!("copy {} has no source", id))
                        })?;
                        values.insert(id, source);
                    }
                    op => {
                        let op = op.clone();
                        let graph = Arc::clone(&graph);
                        let params = Arc::clone(prepared.params());
                        handles.push(tokio::task::spawn_blocking(move || {
                            evaluate(&op, &inputs, graph.plan(), &params).map(|v| (id, Arc::new(v)))
                        }));
                    }
                }
            }

            let tasks = handles.len();
            for outcome in try_join_all(handles).await? {
                let (id, value) = outcome?;
                values.insert(id, value);
            }
            trace!(wave = wave_idx, tasks = tasks, "Wave complete");
        }

        let output = graph.output()?;
        let prediction = values
            .get(&output.node)
            .ok_or_else(|| ShardError::Execution("graph output was never produced".to_string()))?
            .as_prediction()?
            .clone();
        Ok(prediction)
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn prepare(
        &self,
        graph: crate::graph::Graph,
        params: Arc<ModelParameters>,
    ) -> Result<PreparedGraph> {
        PreparedGraph::new(graph, params)
    }

    #[instrument(skip(self, prepared, tokens), fields(batch = tokens.batch, seq_len = tokens.seq_len))]
    async fn run(&self, prepared: &PreparedGraph, tokens: TokenBatch) -> Result<Prediction> {
        let prediction = with_deadline(self.timeout, self.execute(prepared, tokens)).await?;
        debug!(
            batch = prediction.batch(),
            waves = prepared.waves().len(),
            "Graph run complete"
        );
        Ok(prediction)
    }
}

/// Fail with [`ShardError::Timeout`] when `fut` outlives `timeout`
async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(timeout_ms = timeout_ms, "Inference timed out");
            Err(ShardError::Timeout(timeout_ms))
        }
    }
}

fn single(inputs: &[Arc<Value>]) -> Result<&Value> {
    match inputs {
        [value] => Ok(value),
        _ => Err(ShardError::Execution(format!(
            "expected one input, got {}",
            inputs.len()
        ))),
    }
}

/// Compute one node
fn evaluate(
    op: &Op,
    inputs: &[Arc<Value>],
    plan: &ShardPlan,
    params: &ModelParameters,
) -> Result<Value> {
    let value = match op {
        Op::Gather { shard } => Value::Gathered(gather(
            plan.shard(*shard)?,
            params.slice(*shard)?,
            single(inputs)?.as_tokens()?,
        )?),
        Op::Accumulate => {
            let results: Vec<LocalGatherResult> = inputs
                .iter()
                .map(|v| v.as_gathered().cloned())
                .collect::<Result<_>>()?;
            Value::Combined(combine(&results, plan)?)
        }
        Op::StageA => Value::Scores(stage_a(single(inputs)?.as_combined()?, &params.projection)?),
        Op::StageB => Value::Hidden(stage_b(single(inputs)?.as_scores()?, &params.projection)?),
        Op::ShardLogits { shard } => Value::Logits(logits::project(
            plan.shard(*shard)?,
            params.slice(*shard)?,
            single(inputs)?.as_hidden()?,
        )?),
        Op::LocalTopK { shard, k } => Value::TopK(local_topk(
            plan.shard(*shard)?,
            single(inputs)?.as_logits()?,
            *k,
        )?),
        Op::Merge { k } => {
            let locals: Vec<LocalTopK> = inputs
                .iter()
                .map(|v| v.as_topk().cloned())
                .collect::<Result<_>>()?;
            Value::Prediction(merge(&locals, plan, *k)?)
        }
        Op::Input | Op::Copy { .. } => {
            return Err(ShardError::Execution(format!(
                "{} is resolved by the scheduler",
                op.label()
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build, GraphOptions};
    use crate::inference::params::ProjectionWeights;
    use crate::inference::tensor_ops::Tensor2D;
    use crate::model::shard::plan;

    async fn scenario(coalesce_copies: bool) -> (LocalExecutor, PreparedGraph) {
        let plan = plan(8, 2).unwrap();
        let table = Tensor2D::new(
            vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0],
            8,
            1,
        )
        .unwrap();
        let params = ModelParameters::from_full_table(
            &table,
            &plan,
            ProjectionWeights::scalar_identity(),
        )
        .unwrap();
        let options = GraphOptions {
            top_k: 2,
            coalesce_copies,
        };
        let graph = build(&plan, &options).unwrap();
        let executor = LocalExecutor::default();
        let prepared = executor.prepare(graph, Arc::new(params)).await.unwrap();
        (executor, prepared)
    }

    #[tokio::test]
    async fn test_scenario_prediction() {
        let (executor, prepared) = scenario(true).await;
        let tokens = TokenBatch::from_single_tokens(vec![0, 5, 7]).unwrap();
        let prediction = executor.run(&prepared, tokens).await.unwrap();

        // Positive hidden scalars rank ids by table value: 7 first, then 6
        assert_eq!(prediction.next_tokens(), vec![7, 7, 7]);
        let first = &prediction.top_k[0];
        assert_eq!(first[0].score, 80.0 * 10.0);
        assert_eq!(first[1].token_id, 6);
        assert_eq!(prediction.top_k[2][0].score, 80.0 * 80.0);
    }

    #[tokio::test]
    async fn test_copy_coalescing_does_not_change_result() {
        let tokens = TokenBatch::from_single_tokens(vec![-1, 3, 4, 8]).unwrap();
        let (executor, coalesced) = scenario(true).await;
        let (_, per_edge) = scenario(false).await;

        let a = executor.run(&coalesced, tokens.clone()).await.unwrap();
        let b = executor.run(&per_edge, tokens).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_wrong_seq_len_fails_call() {
        let (executor, prepared) = scenario(true).await;
        let tokens = TokenBatch::from_sequences(&[vec![0, 1]]).unwrap();
        assert!(matches!(
            executor.run(&prepared, tokens).await,
            Err(ShardError::Shape(_))
        ));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let result: Result<()> =
            with_deadline(Duration::from_millis(10), std::future::pending()).await;
        assert!(matches!(result, Err(ShardError::Timeout(10))));
    }

    #[tokio::test]
    async fn test_deadline_passes_result_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }

    #[test]
    fn test_copy_is_not_evaluated() {
        let plan = plan(4, 1).unwrap();
        let params = ModelParameters::seeded(0, &plan, 1, 1).unwrap();
        let op = Op::Copy {
            destinations: vec![1],
        };
        assert!(matches!(
            evaluate(&op, &[], &plan, &params),
            Err(ShardError::Execution(_))
        ));
    }
}
