//! vocabshard - Command Line Interface
//!
//! ## Commands
//!
//! - `generate-config` - Write a default config to `~/.vocabshard/config.toml`
//! - `plan` - Show the vocabulary shard ranges
//! - `graph` - Show the placed inference graph (`--json` for the full dump)
//! - `infer` - Run one sharded inference call

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vocabshard::inference::{
    FileLoader, InferenceConfig, InferenceCoordinator, ParameterLoader, SeededLoader,
};
use vocabshard::observability::{init_logging, init_simple_logging};
use vocabshard::{build, plan, Config, GraphOptions, InferenceRequest, TokenBatch};

/// Vocabulary-sharded embedding and top-k inference
#[derive(Parser, Debug)]
#[command(name = "vocabshard")]
#[command(about = "Vocabulary-sharded inference", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.vocabshard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for values normally read from the config file
#[derive(Args, Debug, Default)]
struct ModelOverrides {
    /// Vocabulary size
    #[arg(long)]
    vocab_size: Option<usize>,

    /// Number of vocabulary shards
    #[arg(short, long)]
    shards: Option<usize>,

    /// Embedding dimension
    #[arg(long)]
    dim: Option<usize>,

    /// Sequence length
    #[arg(long)]
    seq_len: Option<usize>,

    /// Candidates per batch element
    #[arg(short, long)]
    k: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    GenerateConfig {
        /// Output path (defaults to ~/.vocabshard/config.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the vocabulary shard ranges
    Plan {
        #[command(flatten)]
        overrides: ModelOverrides,
    },

    /// Show the placed inference graph
    Graph {
        #[command(flatten)]
        overrides: ModelOverrides,

        /// One copy per cross-partition edge instead of coalesced copies
        #[arg(long)]
        no_coalesce: bool,

        /// Print the placed graph as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one sharded inference call
    Infer {
        /// Token ids: comma-separated, sequences separated by ';' (e.g. "0,5;7,1")
        #[arg(short, long)]
        tokens: String,

        #[command(flatten)]
        overrides: ModelOverrides,

        /// CBOR parameter file (overrides the config)
        #[arg(short, long)]
        params: Option<PathBuf>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateConfig { output, force } => {
            init_simple_logging("warn")?;
            cmd_generate_config(output, force)?;
        }

        Commands::Plan { overrides } => {
            init_simple_logging("warn")?;
            let config = load_config(cli.config.as_ref(), &overrides)?;
            cmd_plan(&config)?;
        }

        Commands::Graph {
            overrides,
            no_coalesce,
            json,
        } => {
            init_simple_logging("warn")?;
            let mut config = load_config(cli.config.as_ref(), &overrides)?;
            if no_coalesce {
                config.executor.coalesce_copies = false;
            }
            cmd_graph(&config, json)?;
        }

        Commands::Infer {
            tokens,
            overrides,
            params,
            log_level,
        } => {
            let mut config = load_config(cli.config.as_ref(), &overrides)?;
            if let Some(level) = log_level {
                config.logging.level = level;
            }
            if let Some(path) = params {
                config.model.params_path = Some(path.to_string_lossy().into_owned());
            }
            config.validate()?;
            init_logging(&config.logging)?;
            cmd_infer(&config, &tokens).await?;
        }
    }

    Ok(())
}

/// Read the config file if present, otherwise defaults, then apply overrides
fn load_config(path: Option<&PathBuf>, overrides: &ModelOverrides) -> Result<Config> {
    let path = match path {
        Some(p) => p.clone(),
        None => Config::default_path()?,
    };

    let mut config = if path.exists() {
        Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        Config::default()
    };

    if let Some(v) = overrides.vocab_size {
        config.model.vocab_size = v;
    }
    if let Some(n) = overrides.shards {
        config.sharding.shard_count = n;
    }
    if let Some(d) = overrides.dim {
        config.model.embedding_dim = d;
    }
    if let Some(s) = overrides.seq_len {
        config.model.seq_len = s;
    }
    if let Some(k) = overrides.k {
        config.sharding.top_k = k;
    }

    config.validate()?;
    Ok(config)
}

fn parse_tokens(raw: &str) -> Result<TokenBatch> {
    let sequences = raw
        .split(';')
        .map(|seq| {
            seq.split(',')
                .map(|id| {
                    id.trim()
                        .parse::<i64>()
                        .with_context(|| format!("Invalid token id '{}'", id.trim()))
                })
                .collect::<Result<Vec<i64>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TokenBatch::from_sequences(&sequences)?)
}

/// Token sequences must match the configured seq_len
fn check_token_shape(config: &Config, tokens: &TokenBatch) -> Result<()> {
    if tokens.seq_len != config.model.seq_len {
        anyhow::bail!(
            "token sequences have length {} but the model expects seq_len {} (use --seq-len)",
            tokens.seq_len,
            config.model.seq_len
        );
    }
    Ok(())
}

fn cmd_generate_config(output: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match output {
        Some(p) => p,
        None => Config::default_path()?,
    };

    if path.exists() && !force {
        println!(
            "{}",
            format!("{} already exists (use --force to overwrite)", path.display()).yellow()
        );
        return Ok(());
    }

    Config::default().save(&path)?;
    println!("{} {}", "✓ Config written to".green(), path.display());
    Ok(())
}

fn cmd_plan(config: &Config) -> Result<()> {
    let plan = plan(config.model.vocab_size, config.sharding.shard_count)?;
    let bytes_per_row = config.model.embedding_dim * std::mem::size_of::<f32>();

    println!("\n{}", "Shard Plan".bold().cyan());
    println!("{}", "==========".cyan());
    println!("  Vocabulary:      {}", plan.vocab_size());
    println!("  Shards:          {}", plan.shard_count());
    println!("  Embedding Dim:   {}", config.model.embedding_dim);

    println!("\n{}", "Ranges:".bold());
    for spec in plan.shards() {
        println!(
            "  Shard {:<3} [{:>8}, {:>8})  width {:>8}  {:>10.1} MB",
            spec.shard_id,
            spec.global_lo,
            spec.global_hi,
            spec.width(),
            (spec.width() * bytes_per_row) as f64 / 1_000_000.0
        );
    }
    println!();
    Ok(())
}

fn cmd_graph(config: &Config, json: bool) -> Result<()> {
    let plan = plan(config.model.vocab_size, config.sharding.shard_count)?;
    let options = GraphOptions {
        top_k: config.sharding.top_k,
        coalesce_copies: config.executor.coalesce_copies,
    };
    let graph = build(&plan, &options)?;

    if json {
        println!("{}", graph.to_json()?);
        return Ok(());
    }

    println!("\n{}", "Inference Graph".bold().cyan());
    println!("{}", "===============".cyan());
    println!("  Partitions:      {}", graph.partitions());
    println!("  Nodes:           {}", graph.node_count());
    println!("  Copies:          {}", graph.copy_count());
    println!("  Waves:           {}", graph.waves()?.len());

    println!("\n{}", "Placement:".bold());
    for (partition, labels) in graph.partition_summary() {
        println!("  Partition {:<3} {}", partition, labels.join(", ").dimmed());
    }
    println!();
    Ok(())
}

async fn cmd_infer(config: &Config, raw_tokens: &str) -> Result<()> {
    let tokens = parse_tokens(raw_tokens)?;
    check_token_shape(config, &tokens)?;
    let plan = plan(config.model.vocab_size, config.sharding.shard_count)?;

    let loader: Arc<dyn ParameterLoader> = match config.params_path() {
        Some(path) => Arc::new(FileLoader::new(path)),
        None => Arc::new(SeededLoader::new(
            config.model.seed,
            config.model.embedding_dim,
            config.model.seq_len,
        )),
    };
    info!(loader = %loader.describe(), "Using parameter loader");

    let coordinator =
        InferenceCoordinator::from_loader(plan, loader.as_ref(), InferenceConfig::from(config))
            .await
            .context("Failed to set up inference")?;

    let result = coordinator
        .infer(InferenceRequest::new(tokens, config.sharding.top_k))
        .await?;

    println!("\n{}", "✓ Inference completed!".green().bold());
    println!("  Job ID:          {}", result.job_id);
    println!("  Tokens:          {}", result.tokens_processed);
    println!("  Execution Time:  {}ms", result.execution_time_ms);

    for (b, candidates) in result.prediction.top_k.iter().enumerate() {
        println!("\n{}", format!("Sequence {}:", b).bold());
        for (rank, c) in candidates.iter().enumerate() {
            let line = format!("  #{:<2} token {:>8}  score {:>12.4}", rank + 1, c.token_id, c.score);
            if rank == 0 {
                println!("{}", line.green());
            } else {
                println!("{}", line);
            }
        }
    }
    println!();

    coordinator.stats().print_summary();
    coordinator.stats().display();
    Ok(())
}
