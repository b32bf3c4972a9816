//! Inference statistics tracking
//!
//! Sessions complete concurrently, so every counter is atomic. Moving
//! averages are stored as `f64` bits and updated with a compare-exchange
//! loop: the first sample seeds the average, later samples are blended in
//! with weight one half.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

const AVERAGE_WEIGHT: f64 = 0.5;

/// Point-in-time copy of the engine's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceMetrics {
    pub total_inferences: u64,
    pub successful_inferences: u64,
    pub failed_inferences: u64,
    pub average_latency: Duration,
    pub average_nodes_used: f64,
    pub tokens_processed: u64,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// Statistics for distributed inference sessions
#[derive(Debug)]
pub struct InferenceStats {
    /// Sessions finished, successful or not
    pub total_inferences: AtomicU64,

    pub successful_inferences: AtomicU64,

    pub failed_inferences: AtomicU64,

    /// Moving average latency in milliseconds, as `f64` bits
    avg_latency_ms: AtomicU64,

    /// Moving average nodes per session, as `f64` bits
    avg_nodes_used: AtomicU64,

    /// Tokens across all successful results
    pub tokens_processed: AtomicU64,

    /// Unix millis of the last update, 0 if never
    last_updated_ms: AtomicI64,

    /// Start time for uptime tracking
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
            total_inferences: AtomicU64::new(0),
            successful_inferences: AtomicU64::new(0),
            failed_inferences: AtomicU64::new(0),
            avg_latency_ms: AtomicU64::new(0f64.to_bits()),
            avg_nodes_used: AtomicU64::new(0f64.to_bits()),
            tokens_processed: AtomicU64::new(0),
            last_updated_ms: AtomicI64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a completed session
    pub fn record_success(&self, latency: Duration, nodes_used: usize, tokens: usize) {
        let seq = self.total_inferences.fetch_add(1, Ordering::Relaxed);
        self.successful_inferences.fetch_add(1, Ordering::Relaxed);
        self.tokens_processed
            .fetch_add(tokens as u64, Ordering::Relaxed);
        blend(&self.avg_latency_ms, latency.as_secs_f64() * 1000.0, seq == 0);
        blend(&self.avg_nodes_used, nodes_used as f64, seq == 0);
        self.touch();
    }

    /// Record a failed session
    pub fn record_failure(&self, latency: Duration) {
        let seq = self.total_inferences.fetch_add(1, Ordering::Relaxed);
        self.failed_inferences.fetch_add(1, Ordering::Relaxed);
        blend(&self.avg_latency_ms, latency.as_secs_f64() * 1000.0, seq == 0);
        self.touch();
    }

    fn touch(&self) {
        self.last_updated_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_inferences.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.successful_inferences.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        f64::from_bits(self.avg_latency_ms.load(Ordering::Relaxed))
    }

    pub fn avg_nodes_used(&self) -> f64 {
        f64::from_bits(self.avg_nodes_used.load(Ordering::Relaxed))
    }

    pub fn last_updated(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self.last_updated_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => chrono::DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn snapshot(&self) -> InferenceMetrics {
        InferenceMetrics {
            total_inferences: self.total_inferences.load(Ordering::Relaxed),
            successful_inferences: self.successful_inferences.load(Ordering::Relaxed),
            failed_inferences: self.failed_inferences.load(Ordering::Relaxed),
            average_latency: Duration::from_secs_f64(self.avg_latency_ms().max(0.0) / 1000.0),
            average_nodes_used: self.avg_nodes_used(),
            tokens_processed: self.tokens_processed.load(Ordering::Relaxed),
            last_updated: self.last_updated(),
        }
    }

    /// Get uptime in seconds
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

    /// Print statistics summary
    pub fn print_summary(&self) {
        info!(
            total_inferences = self.total_inferences.load(Ordering::Relaxed),
            successful = self.successful_inferences.load(Ordering::Relaxed),
            failed = self.failed_inferences.load(Ordering::Relaxed),
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            avg_latency_ms = format!("{:.2}", self.avg_latency_ms()),
            avg_nodes_used = format!("{:.2}", self.avg_nodes_used()),
            tokens_processed = self.tokens_processed.load(Ordering::Relaxed),
            uptime = %self.uptime_string(),
            "Inference statistics"
        );
    }

    /// Display formatted metrics (for CLI)
    pub fn display(&self) {
        use colored::Colorize;

        println!("\n{}", "Inference Metrics".bold().cyan());
        println!("{}", "=================".cyan());

        println!("\n{}", "Sessions:".bold());
        println!(
            "  Total:               {}",
            self.total_inferences.load(Ordering::Relaxed)
        );
        println!(
            "  Successful:          {}",
            self.successful_inferences
                .load(Ordering::Relaxed)
                .to_string()
                .green()
        );
        println!(
            "  Failed:              {}",
            self.failed_inferences
                .load(Ordering::Relaxed)
                .to_string()
                .red()
        );
        println!("  Success Rate:        {:.1}%", self.success_rate() * 100.0);

        println!("\n{}", "Performance:".bold());
        println!("  Avg Latency:         {:.2}ms", self.avg_latency_ms());
        println!("  Avg Nodes Used:      {:.2}", self.avg_nodes_used());
        println!(
            "  Tokens Processed:    {}",
            self.tokens_processed.load(Ordering::Relaxed)
        );

        println!("\n{}", "System:".bold());
        println!("  Uptime:              {}", self.uptime_string());
        println!();
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_inferences": self.total_inferences.load(Ordering::Relaxed),
            "successful_inferences": self.successful_inferences.load(Ordering::Relaxed),
            "failed_inferences": self.failed_inferences.load(Ordering::Relaxed),
            "success_rate": self.success_rate(),
            "avg_latency_ms": self.avg_latency_ms(),
            "avg_nodes_used": self.avg_nodes_used(),
            "tokens_processed": self.tokens_processed.load(Ordering::Relaxed),
            "uptime": self.uptime_string(),
            "last_updated": chrono::Local::now().to_rfc3339(),
        })
    }
}

fn blend(cell: &AtomicU64, sample: f64, seed: bool) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let old = f64::from_bits(current);
        let new = if seed {
            sample
        } else {
            old * (1.0 - AVERAGE_WEIGHT) + sample * AVERAGE_WEIGHT
        };
        match cell.compare_exchange_weak(current, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
