//! Inference statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for sharded inference calls
#[derive(Debug)]
pub struct InferenceStats {
    /// Calls that returned a prediction
    pub calls_completed: AtomicU64,

    /// Calls that failed
    pub calls_failed: AtomicU64,

    /// Token ids fed through the pipeline
    pub tokens_processed: AtomicU64,

    /// Total wall time of completed calls in milliseconds
    pub total_inference_time_ms: AtomicU64,

    /// Per-shard compute tasks run (gather, logits, local top-k)
    pub shard_tasks: AtomicU64,

    /// Cross-partition copies performed
    pub copies: AtomicU64,

    /// Graphs prepared (one per distinct k)
    pub graphs_prepared: AtomicU64,

    pub start_time: Instant,
}

impl Default for InferenceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceStats {
    pub fn new() -> Self {
        Self {
            calls_completed: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            tokens_processed: AtomicU64::new(0),
            total_inference_time_ms: AtomicU64::new(0),
            shard_tasks: AtomicU64::new(0),
            copies: AtomicU64::new(0),
            graphs_prepared: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a successful call
    pub fn record_success(
        &self,
        tokens: u64,
        shard_tasks: u64,
        copies: u64,
        inference_time_ms: u64,
    ) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
        self.tokens_processed.fetch_add(tokens, Ordering::Relaxed);
        self.shard_tasks.fetch_add(shard_tasks, Ordering::Relaxed);
        self.copies.fetch_add(copies, Ordering::Relaxed);
        self.total_inference_time_ms
            .fetch_add(inference_time_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prepare(&self) {
        self.graphs_prepared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_calls(&self) -> u64 {
        self.calls_completed.load(Ordering::Relaxed) + self.calls_failed.load(Ordering::Relaxed)
    }

    /// Success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            return 0.0;
        }
        self.calls_completed.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let calls = self.calls_completed.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        self.total_inference_time_ms.load(Ordering::Relaxed) as f64 / calls as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        let seconds = self.uptime_seconds();
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn print_summary(&self) {
        info!(
            calls_completed = self.calls_completed.load(Ordering::Relaxed),
            calls_failed = self.calls_failed.load(Ordering::Relaxed),
            tokens_processed = self.tokens_processed.load(Ordering::Relaxed),
            shard_tasks = self.shard_tasks.load(Ordering::Relaxed),
            copies = self.copies.load(Ordering::Relaxed),
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            avg_latency_ms = format!("{:.2}", self.avg_latency_ms()),
            uptime = %self.uptime_string(),
            "Inference statistics"
        );
    }

    /// Display formatted metrics (for CLI)
    pub fn display(&self) {
        use colored::Colorize;

        println!("\n{}", "Inference Metrics".bold().cyan());
        println!("{}", "=================".cyan());

        println!(
            "  Completed:           {}",
            self.calls_completed
                .load(Ordering::Relaxed)
                .to_string()
                .green()
        );
        println!(
            "  Failed:              {}",
            self.calls_failed.load(Ordering::Relaxed).to_string().red()
        );
        println!("  Success Rate:        {:.1}%", self.success_rate() * 100.0);
        println!(
            "  Tokens Processed:    {}",
            self.tokens_processed.load(Ordering::Relaxed)
        );
        println!("  Avg Latency:         {:.2}ms", self.avg_latency_ms());
        println!(
            "  Shard Tasks:         {}",
            self.shard_tasks.load(Ordering::Relaxed)
        );
        println!(
            "  Copies:              {}",
            self.copies.load(Ordering::Relaxed)
        );
        println!("  Uptime:              {}", self.uptime_string());
        println!();
    }
}
