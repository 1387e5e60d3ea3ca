//! Integration tests for vocabulary-sharded inference
//!
//! Every sharded result is checked against the same model evaluated on the
//! unsplit embedding table.

use std::sync::Arc;
use vocabshard::executor::{Executor, LocalExecutor};
use vocabshard::graph::{build, GraphOptions};
use vocabshard::inference::accumulator::{combine, CombinedEmbedding};
use vocabshard::inference::batch::clamp_to_vocab;
use vocabshard::inference::gather::gather;
use vocabshard::inference::logits;
use vocabshard::inference::loader::{save_parameters, FileLoader, ParameterLoader, SeededLoader};
use vocabshard::inference::projection::{self, HiddenState};
use vocabshard::inference::tensor_ops::{gather_rows, matmul, top_k, Tensor2D, Tensor3D};
use vocabshard::inference::topk::{local_topk, merge};
use vocabshard::inference::{InferenceConfig, InferenceCoordinator};
use vocabshard::{
    plan, InferenceRequest, ModelParameters, Prediction, ProjectionWeights, ShardPlan, TokenBatch,
};

/// Reassemble the full table from the shard slices
fn full_table(params: &ModelParameters) -> Tensor2D {
    let dim = params.projection.embedding_dim();
    let data: Vec<f32> = params
        .shards
        .iter()
        .flat_map(|s| s.table.data.iter().copied())
        .collect();
    let rows = data.len() / dim;
    Tensor2D::new(data, rows, dim).unwrap()
}

/// Unsharded evaluation: plain lookup, projection, full logits, top-k
fn reference(params: &ModelParameters, tokens: &TokenBatch, k: usize) -> Vec<Vec<(f32, usize)>> {
    let table = full_table(params);
    let rows: Vec<usize> = tokens
        .ids
        .iter()
        .map(|&id| clamp_to_vocab(id, table.rows))
        .collect();
    let gathered = gather_rows(&table, &rows).unwrap();
    let combined = CombinedEmbedding {
        embeddings: Tensor3D::new(gathered.data, tokens.batch, tokens.seq_len, table.cols)
            .unwrap(),
    };
    let hidden = projection::project(&combined, &params.projection).unwrap();
    let logits = matmul(&hidden.hidden, &table.transpose()).unwrap();
    (0..tokens.batch).map(|b| top_k(logits.row(b), k)).collect()
}

/// Sharded evaluation calling every component directly
fn direct_chain(
    plan: &ShardPlan,
    params: &ModelParameters,
    tokens: &TokenBatch,
    k: usize,
) -> Prediction {
    let gathered: Vec<_> = plan
        .shards()
        .iter()
        .map(|s| gather(s, params.slice(s.shard_id).unwrap(), tokens).unwrap())
        .collect();
    let combined = combine(&gathered, plan).unwrap();
    let hidden = projection::project(&combined, &params.projection).unwrap();
    let locals: Vec<_> = plan
        .shards()
        .iter()
        .map(|s| {
            let l = logits::project(s, params.slice(s.shard_id).unwrap(), &hidden).unwrap();
            local_topk(s, &l, k).unwrap()
        })
        .collect();
    merge(&locals, plan, k).unwrap()
}

fn as_pairs(prediction: &Prediction) -> Vec<Vec<(f32, usize)>> {
    prediction
        .top_k
        .iter()
        .map(|row| row.iter().map(|c| (c.score, c.token_id)).collect())
        .collect()
}

async fn run_coordinator(
    plan: ShardPlan,
    params: ModelParameters,
    tokens: TokenBatch,
    k: usize,
) -> Prediction {
    let coordinator = InferenceCoordinator::new(plan, params, InferenceConfig::default()).unwrap();
    coordinator
        .infer(InferenceRequest::new(tokens, k))
        .await
        .unwrap()
        .prediction
}

#[tokio::test]
async fn test_executor_matches_direct_chain_and_reference() {
    let tokens =
        TokenBatch::from_sequences(&[vec![0, 22, 5], vec![-1, 11, 23], vec![7, 7, 12]]).unwrap();

    for shards in 1..=6 {
        let plan = plan(23, shards).unwrap();
        let params = ModelParameters::seeded(99, &plan, 4, 3).unwrap();

        let direct = direct_chain(&plan, &params, &tokens, 3);
        let expected = reference(&params, &tokens, 3);
        let executed = run_coordinator(plan, params, tokens.clone(), 3).await;

        assert_eq!(executed, direct, "executor differs from direct chain, N={}", shards);
        assert_eq!(as_pairs(&executed), expected, "sharded differs from unsharded, N={}", shards);
    }
}

#[tokio::test]
async fn test_uncoalesced_copies_give_same_prediction() {
    let plan = plan(17, 4).unwrap();
    let params = Arc::new(ModelParameters::seeded(5, &plan, 3, 2).unwrap());
    let tokens = TokenBatch::from_sequences(&[vec![3, 16], vec![4, 8]]).unwrap();
    let executor = LocalExecutor::default();

    let mut predictions = Vec::new();
    for coalesce_copies in [true, false] {
        let options = GraphOptions {
            top_k: 2,
            coalesce_copies,
        };
        let graph = build(&plan, &options).unwrap();
        let prepared = executor.prepare(graph, Arc::clone(&params)).await.unwrap();
        predictions.push(executor.run(&prepared, tokens.clone()).await.unwrap());
    }
    assert_eq!(predictions[0], predictions[1]);
}

#[test]
fn test_scenario_combined_embedding_and_one_hot_recovery() {
    // V = 8, N = 2, dim = 1, rows 10..80
    let plan = plan(8, 2).unwrap();
    let table = Tensor2D::new(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0], 8, 1).unwrap();
    let params =
        ModelParameters::from_full_table(&table, &plan, ProjectionWeights::scalar_identity())
            .unwrap();
    let tokens = TokenBatch::from_single_tokens(vec![0, 5, 7]).unwrap();

    let gathered: Vec<_> = plan
        .shards()
        .iter()
        .map(|s| gather(s, params.slice(s.shard_id).unwrap(), &tokens).unwrap())
        .collect();
    let combined = combine(&gathered, &plan).unwrap();
    assert_eq!(combined.embeddings.data, vec![10.0, 60.0, 80.0]);

    // dim = 8 with row i = (i + 1) * 10 * e_i, so hidden e_j scores only id j
    let mut diag = Tensor2D::zeros(8, 8);
    for i in 0..8 {
        diag.set(i, i, (i as f32 + 1.0) * 10.0);
    }
    let slices = vocabshard::inference::split_table(&diag, &plan).unwrap();
    let mut one_hot = Tensor2D::zeros(8, 8);
    for j in 0..8 {
        one_hot.set(j, j, 1.0);
    }
    let hidden = HiddenState::new(one_hot);

    let locals: Vec<_> = plan
        .shards()
        .iter()
        .map(|s| {
            let l = logits::project(s, &slices[s.shard_id], &hidden).unwrap();
            local_topk(s, &l, 1).unwrap()
        })
        .collect();
    let prediction = merge(&locals, &plan, 1).unwrap();

    for j in 0..8 {
        let best = prediction.top1(j).unwrap();
        assert_eq!(best.token_id, j);
        assert_eq!(best.score, (j as f32 + 1.0) * 10.0);
    }
}

#[tokio::test]
async fn test_out_of_range_ids_use_edge_rows() {
    let plan = plan(8, 3).unwrap();
    let table = Tensor2D::new((1..=8).map(|v| v as f32).collect(), 8, 1).unwrap();
    let params =
        ModelParameters::from_full_table(&table, &plan, ProjectionWeights::scalar_identity())
            .unwrap();

    let gathered: Vec<_> = plan
        .shards()
        .iter()
        .map(|s| {
            let ids = TokenBatch::from_single_tokens(vec![-1, 8, 1000]).unwrap();
            gather(s, params.slice(s.shard_id).unwrap(), &ids).unwrap()
        })
        .collect();
    let combined = combine(&gathered, &plan).unwrap();
    assert_eq!(combined.embeddings.data, vec![1.0, 8.0, 8.0]);

    // Hidden scalar is then 1 or 8; id 7 has the largest row either way
    let tokens = TokenBatch::from_single_tokens(vec![-1, 8]).unwrap();
    let prediction = run_coordinator(plan, params, tokens, 1).await;
    assert_eq!(prediction.top1(0).unwrap().score, 8.0);
    assert_eq!(prediction.top1(1).unwrap().score, 64.0);
}

#[tokio::test]
async fn test_ties_resolve_to_lowest_global_id_every_run() {
    // Ids 1, 3 and 6 share the largest row; they span all three shards
    let plan = plan(9, 3).unwrap();
    let table = Tensor2D::new(
        vec![1.0, 5.0, 2.0, 5.0, 0.0, 3.0, 5.0, 4.0, 0.0],
        9,
        1,
    )
    .unwrap();
    let params =
        ModelParameters::from_full_table(&table, &plan, ProjectionWeights::scalar_identity())
            .unwrap();
    let tokens = TokenBatch::from_single_tokens(vec![1]).unwrap();

    let first = run_coordinator(plan.clone(), params.clone(), tokens.clone(), 3).await;
    for _ in 0..5 {
        let again = run_coordinator(plan.clone(), params.clone(), tokens.clone(), 3).await;
        assert_eq!(again, first);
    }
    let ids: Vec<usize> = first.top_k[0].iter().map(|c| c.token_id).collect();
    assert_eq!(ids, vec![1, 3, 6]);
}

#[tokio::test]
async fn test_file_parameters_match_seeded() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("model.cbor");
    let plan = plan(30, 4).unwrap();
    let seeded = SeededLoader::new(21, 3, 2);

    let params = seeded.load(&plan).await.unwrap();
    save_parameters(&params, &path).await.unwrap();

    let tokens = TokenBatch::from_sequences(&[vec![29, 0]]).unwrap();
    let from_seed = InferenceCoordinator::from_loader(plan.clone(), &seeded, InferenceConfig::default())
        .await
        .unwrap();
    let from_file =
        InferenceCoordinator::from_loader(plan, &FileLoader::new(&path), InferenceConfig::default())
            .await
            .unwrap();

    let a = from_seed
        .infer(InferenceRequest::new(tokens.clone(), 2))
        .await
        .unwrap();
    let b = from_file
        .infer(InferenceRequest::new(tokens, 2))
        .await
        .unwrap();
    assert_eq!(a.prediction, b.prediction);
}

#[tokio::test]
async fn test_free_infer_matches_reference() {
    let plan = plan(12, 5).unwrap();
    let params = ModelParameters::seeded(3, &plan, 2, 2).unwrap();
    let tokens = TokenBatch::from_sequences(&[vec![11, 4]]).unwrap();
    let expected = reference(&params, &tokens, 2);

    let prediction = vocabshard::infer(
        tokens,
        params.shards.clone(),
        params.projection.clone(),
        2,
    )
    .await
    .unwrap();
    assert_eq!(as_pairs(&prediction), expected);
}
