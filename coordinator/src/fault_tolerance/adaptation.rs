//! Configuration adaptation from observed performance
//!
//! The adapter only proposes. A proposal is a complete candidate
//! configuration that must pass the same validation as a loaded document;
//! a candidate that fails is dropped whole and the live config is untouched.
//! Proposed intervals are kept inside the range the cross-field rules allow.

use crate::errors::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use super::config::FaultToleranceConfig;
use super::performance::PerformanceSummary;

const HIGH_ERROR_RATE: f64 = 0.2;
const LOW_ERROR_RATE: f64 = 0.02;
const MIN_SAMPLES: usize = 10;
const MIN_FAILURE_THRESHOLD: u32 = 2;
const MAX_RELAXED_FAILURE_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdaptationOutcome {
    /// Nothing to change
    Unchanged,
    Applied { changes: Vec<String> },
    Rejected { reason: String },
}

#[derive(Debug, Default)]
pub struct ConfigAdapter {
    applied: AtomicU64,
    rejected: AtomicU64,
}

impl ConfigAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Build a candidate from `current` and `performance`
    ///
    /// Returns the candidate only if it passed validation, together with the
    /// outcome to report.
    pub fn adapt(
        &self,
        current: &FaultToleranceConfig,
        performance: &PerformanceSummary,
    ) -> (Option<FaultToleranceConfig>, AdaptationOutcome) {
        let Some((candidate, changes)) = propose(current, performance) else {
            return (None, AdaptationOutcome::Unchanged);
        };

        match candidate.validate() {
            Ok(()) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                info!(changes = ?changes, error_rate = performance.error_rate, "Config adapted");
                (Some(candidate), AdaptationOutcome::Applied { changes })
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                let reason = match &e {
                    CoordinatorError::Validation(errs) => errs.to_string(),
                    other => other.to_string(),
                };
                warn!(changes = ?changes, reason = %reason, "Adapted config rejected");
                (None, AdaptationOutcome::Rejected { reason })
            }
        }
    }
}

fn propose(
    current: &FaultToleranceConfig,
    performance: &PerformanceSummary,
) -> Option<(FaultToleranceConfig, Vec<String>)> {
    if performance.samples < MIN_SAMPLES {
        return None;
    }

    let mut candidate = current.clone();
    let mut changes = Vec::new();

    if performance.error_rate >= HIGH_ERROR_RATE {
        let target = current.self_healing.healing_interval * 2 / 3;
        retune_healing_interval(&mut candidate, target, &mut changes);

        let redundancy = &mut candidate.redundancy;
        if redundancy.default_factor < redundancy.max_factor {
            redundancy.default_factor += 1;
            changes.push("redundancy.default_factor".to_string());
        }

        let breaker = &mut candidate.circuit_breaker;
        if breaker.failure_threshold > MIN_FAILURE_THRESHOLD {
            breaker.failure_threshold -= 1;
            changes.push("circuit_breaker.failure_threshold".to_string());
        }
    } else if performance.error_rate <= LOW_ERROR_RATE {
        let target = current.self_healing.healing_interval * 4 / 3;
        retune_healing_interval(&mut candidate, target, &mut changes);

        let breaker = &mut candidate.circuit_breaker;
        if breaker.failure_threshold < MAX_RELAXED_FAILURE_THRESHOLD {
            breaker.failure_threshold += 1;
            changes.push("circuit_breaker.failure_threshold".to_string());
        }
    }

    if changes.is_empty() {
        None
    } else {
        Some((candidate, changes))
    }
}

/// Move the healing interval toward `target`, clamped to the allowed range
fn retune_healing_interval(
    candidate: &mut FaultToleranceConfig,
    target: Duration,
    changes: &mut Vec<String>,
) {
    let (lower, upper) = candidate.healing_interval_range();
    if lower > upper {
        return;
    }
    let next = target.clamp(lower, upper);
    if next != candidate.self_healing.healing_interval {
        candidate.self_healing.healing_interval = next;
        changes.push("self_healing.healing_interval".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(samples: usize, error_rate: f64) -> PerformanceSummary {
        PerformanceSummary {
            key: "overall".to_string(),
            samples,
            success_rate: 1.0 - error_rate,
            error_rate,
            avg_latency: Duration::from_millis(50),
            p95_latency: Duration::from_millis(90),
            throughput: 1.0,
        }
    }

    #[test]
    fn test_high_error_rate_tightens() {
        let adapter = ConfigAdapter::new();
        let current = FaultToleranceConfig::default();
        let (next, outcome) = adapter.adapt(&current, &summary(50, 0.5));
        let next = next.unwrap();

        assert_eq!(next.self_healing.healing_interval, Duration::from_secs(40));
        assert_eq!(next.redundancy.default_factor, 3);
        assert_eq!(next.circuit_breaker.failure_threshold, 4);
        assert!(matches!(outcome, AdaptationOutcome::Applied { ref changes } if changes.len() == 3));
        assert_eq!(adapter.applied(), 1);
    }

    #[test]
    fn test_invalid_candidate_is_rejected_whole() {
        let adapter = ConfigAdapter::new();
        let mut current = FaultToleranceConfig::default();
        current.replication_factor = 1;

        // One more replica would exceed 2x the replication factor
        let (next, outcome) = adapter.adapt(&current, &summary(50, 0.5));
        assert!(next.is_none());
        match outcome {
            AdaptationOutcome::Rejected { reason } => {
                assert!(reason.contains("redundancy.default_factor"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(adapter.rejected(), 1);
    }

    #[test]
    fn test_tightening_stops_at_monitoring_bound() {
        let adapter = ConfigAdapter::new();
        let mut current = FaultToleranceConfig::default();
        current.self_healing.healing_interval = Duration::from_secs(40);

        // 40s * 2/3 would drop below 3x the 10s monitoring interval
        let (next, _) = adapter.adapt(&current, &summary(50, 0.5));
        let next = next.unwrap();
        assert_eq!(next.self_healing.healing_interval, Duration::from_secs(30));
        assert!(next.validate().is_ok());

        let (again, outcome) = adapter.adapt(&next, &summary(50, 0.5));
        match outcome {
            AdaptationOutcome::Applied { changes } => {
                assert!(!changes.contains(&"self_healing.healing_interval".to_string()));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(again.unwrap().self_healing.healing_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_low_error_rate_relaxes() {
        let adapter = ConfigAdapter::new();
        let mut current = FaultToleranceConfig::default();

        // Defaults sit at the 10x adaptation bound; only the breaker relaxes
        let (next, outcome) = adapter.adapt(&current, &summary(50, 0.0));
        let next = next.unwrap();
        assert_eq!(next.self_healing.healing_interval, Duration::from_secs(60));
        assert_eq!(next.circuit_breaker.failure_threshold, 6);
        assert_eq!(
            outcome,
            AdaptationOutcome::Applied {
                changes: vec!["circuit_breaker.failure_threshold".to_string()]
            }
        );
        assert_eq!(adapter.rejected(), 0);

        current.config_adaptation.interval = Duration::from_secs(1800);
        let (next, _) = adapter.adapt(&current, &summary(50, 0.0));
        let next = next.unwrap();
        assert_eq!(next.self_healing.healing_interval, Duration::from_secs(80));
        assert_eq!(next.circuit_breaker.failure_threshold, 6);
    }

    #[test]
    fn test_needs_enough_samples_and_a_signal() {
        let adapter = ConfigAdapter::new();
        let current = FaultToleranceConfig::default();
        assert_eq!(
            adapter.adapt(&current, &summary(3, 0.9)).1,
            AdaptationOutcome::Unchanged
        );
        assert_eq!(
            adapter.adapt(&current, &summary(50, 0.1)).1,
            AdaptationOutcome::Unchanged
        );
    }
}
