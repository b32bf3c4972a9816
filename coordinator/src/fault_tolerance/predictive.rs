//! Predictive failure detection
//!
//! Each detector scores a key's trailing samples in `[0, 1]` and reports
//! how much it trusts that score. A prediction is emitted when some enabled
//! detector clears both `anomaly_threshold` and `confidence_threshold`.
//!
//! ```text
//! PerformanceTracker ──samples──▶ statistical (latency z-score)
//!                                 pattern     (error rate and trend)
//!                                 ml          (latency regression)
//!                                        │
//!                                        ▼ best score over thresholds
//!                                 broadcast<PredictedFailure>
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use super::config::PredictiveDetectionConfig;
use super::performance::{PerformanceSample, PerformanceTracker};

const MIN_SAMPLES: usize = 5;
/// Sample count at which a detector fully trusts its window
const FULL_CONFIDENCE_SAMPLES: f64 = 20.0;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyScore {
    pub score: f64,
    pub confidence: f64,
}

pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when there is too little data to judge
    fn score(&self, samples: &[PerformanceSample]) -> Option<AnomalyScore>;
}

/// Latest latency against the mean and deviation of the rest of the window
#[derive(Debug, Default)]
pub struct StatisticalDetector;

impl AnomalyDetector for StatisticalDetector {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn score(&self, samples: &[PerformanceSample]) -> Option<AnomalyScore> {
        if samples.len() < MIN_SAMPLES {
            return None;
        }
        let (latest, baseline) = samples.split_last()?;
        let values: Vec<f64> = baseline.iter().map(latency_ms).collect();
        let (mean, std_dev) = mean_and_std_dev(&values);
        let latest = latency_ms(latest);

        let score = if std_dev > f64::EPSILON {
            ((latest - mean) / std_dev / 3.0).clamp(0.0, 1.0)
        } else if latest > mean {
            1.0
        } else {
            0.0
        };

        Some(AnomalyScore {
            score,
            confidence: sample_confidence(samples.len()),
        })
    }
}

/// Error rate over the window, raised when errors cluster in its second half
#[derive(Debug, Default)]
pub struct PatternDetector;

impl AnomalyDetector for PatternDetector {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn score(&self, samples: &[PerformanceSample]) -> Option<AnomalyScore> {
        if samples.len() < MIN_SAMPLES {
            return None;
        }
        let (early, late) = samples.split_at(samples.len() / 2);
        let trend = (error_rate(late) - error_rate(early)).max(0.0);

        Some(AnomalyScore {
            score: (error_rate(samples) + trend / 2.0).clamp(0.0, 1.0),
            confidence: sample_confidence(samples.len()),
        })
    }
}

/// Least-squares latency trend projected one window ahead
///
/// Confidence is the fit's coefficient of determination scaled by sample
/// count, so noisy windows do not trigger predictions.
#[derive(Debug, Default)]
pub struct RegressionDetector;

impl AnomalyDetector for RegressionDetector {
    fn name(&self) -> &'static str {
        "ml"
    }

    fn score(&self, samples: &[PerformanceSample]) -> Option<AnomalyScore> {
        if samples.len() < MIN_SAMPLES {
            return None;
        }
        let ys: Vec<f64> = samples.iter().map(latency_ms).collect();
        let n = ys.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let (mean_y, _) = mean_and_std_dev(&ys);

        let mut sxy = 0.0;
        let mut sxx = 0.0;
        let mut syy = 0.0;
        for (i, y) in ys.iter().enumerate() {
            let dx = i as f64 - mean_x;
            let dy = y - mean_y;
            sxy += dx * dy;
            sxx += dx * dx;
            syy += dy * dy;
        }
        if sxx <= f64::EPSILON || mean_y <= f64::EPSILON {
            return Some(AnomalyScore {
                score: 0.0,
                confidence: 0.0,
            });
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        let projected = intercept + slope * (2.0 * n - 1.0);
        let r_squared = if syy > f64::EPSILON {
            (sxy * sxy) / (sxx * syy)
        } else {
            0.0
        };

        Some(AnomalyScore {
            score: ((projected - mean_y) / mean_y).clamp(0.0, 1.0),
            confidence: r_squared * sample_confidence(samples.len()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedFailure {
    /// Performance key, e.g. `node:<peer id>`
    pub key: String,
    pub method: String,
    pub score: f64,
    pub confidence: f64,
    pub predicted_at: DateTime<Utc>,
}

pub struct FailurePredictor {
    config: RwLock<PredictiveDetectionConfig>,
    detectors: RwLock<Vec<Arc<dyn AnomalyDetector>>>,
    events: broadcast::Sender<PredictedFailure>,
    emitted: AtomicU64,
}

impl FailurePredictor {
    pub fn new(config: PredictiveDetectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            detectors: RwLock::new(detectors_for(&config)),
            config: RwLock::new(config),
            events,
            emitted: AtomicU64::new(0),
        }
    }

    pub async fn update_config(&self, config: PredictiveDetectionConfig) {
        *self.detectors.write().await = detectors_for(&config);
        *self.config.write().await = config;
    }

    pub async fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.read().await.iter().map(|d| d.name()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PredictedFailure> {
        self.events.subscribe()
    }

    pub fn predictions_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Score one key's samples without emitting anything
    pub async fn evaluate(&self, key: &str, samples: &[PerformanceSample]) -> Option<PredictedFailure> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return None;
        }

        let detectors = self.detectors.read().await;
        let mut best: Option<PredictedFailure> = None;
        for detector in detectors.iter() {
            let Some(result) = detector.score(samples) else {
                continue;
            };
            debug!(
                key = %key,
                method = detector.name(),
                score = result.score,
                confidence = result.confidence,
                "Anomaly score"
            );
            if result.score < config.anomaly_threshold
                || result.confidence < config.confidence_threshold
            {
                continue;
            }
            if best.as_ref().map_or(true, |b| result.score > b.score) {
                best = Some(PredictedFailure {
                    key: key.to_string(),
                    method: detector.name().to_string(),
                    score: result.score,
                    confidence: result.confidence,
                    predicted_at: Utc::now(),
                });
            }
        }
        best
    }

    /// Score every tracked key and broadcast the predictions
    pub async fn run(&self, tracker: &PerformanceTracker) -> Vec<PredictedFailure> {
        let window = self.config.read().await.window_size;
        let mut predictions = Vec::new();

        for key in tracker.keys().await {
            let samples = tracker.recent(&key, window).await;
            if let Some(prediction) = self.evaluate(&key, &samples).await {
                warn!(
                    key = %prediction.key,
                    method = %prediction.method,
                    score = prediction.score,
                    confidence = prediction.confidence,
                    "Failure predicted"
                );
                self.emitted.fetch_add(1, Ordering::Relaxed);
                // No subscribers is fine
                let _ = self.events.send(prediction.clone());
                predictions.push(prediction);
            }
        }
        predictions
    }
}

fn detectors_for(config: &PredictiveDetectionConfig) -> Vec<Arc<dyn AnomalyDetector>> {
    let mut detectors: Vec<Arc<dyn AnomalyDetector>> = Vec::new();
    if config.enable_statistical {
        detectors.push(Arc::new(StatisticalDetector));
    }
    if config.enable_pattern_recognition {
        detectors.push(Arc::new(PatternDetector));
    }
    if config.enable_ml_detection {
        detectors.push(Arc::new(RegressionDetector));
    }
    detectors
}

fn latency_ms(sample: &PerformanceSample) -> f64 {
    sample.latency.as_secs_f64() * 1000.0
}

fn error_rate(samples: &[PerformanceSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().filter(|s| !s.success).count() as f64 / samples.len() as f64
}

fn sample_confidence(count: usize) -> f64 {
    (count as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0)
}

fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn samples(latencies_ms: &[u64], failures: &[usize]) -> Vec<PerformanceSample> {
        let now = Instant::now();
        latencies_ms
            .iter()
            .enumerate()
            .map(|(i, ms)| PerformanceSample {
                at: now,
                latency: Duration::from_millis(*ms),
                success: !failures.contains(&i),
            })
            .collect()
    }

    fn config() -> PredictiveDetectionConfig {
        PredictiveDetectionConfig {
            enable_ml_detection: true,
            ..PredictiveDetectionConfig::default()
        }
    }

    #[test]
    fn test_statistical_flags_latency_spike() {
        let mut latencies = vec![10, 11, 9, 10, 11, 9, 10, 11, 9, 10];
        latencies.push(100);
        let score = StatisticalDetector.score(&samples(&latencies, &[])).unwrap();
        assert_eq!(score.score, 1.0);

        let steady = StatisticalDetector
            .score(&samples(&[10, 10, 10, 10, 10], &[]))
            .unwrap();
        assert_eq!(steady.score, 0.0);
    }

    #[test]
    fn test_pattern_weights_recent_errors() {
        let late = PatternDetector
            .score(&samples(&[10; 10], &[7, 8, 9]))
            .unwrap();
        let early = PatternDetector
            .score(&samples(&[10; 10], &[0, 1, 2]))
            .unwrap();
        assert!(late.score > early.score);
        assert!((early.score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_regression_sees_rising_latency() {
        let rising: Vec<u64> = (1..=20).map(|i| i * 10).collect();
        let score = RegressionDetector.score(&samples(&rising, &[])).unwrap();
        assert_eq!(score.score, 1.0);
        assert!(score.confidence > 0.99);
    }

    #[test]
    fn test_too_few_samples() {
        assert!(StatisticalDetector.score(&samples(&[10, 500], &[])).is_none());
    }

    #[tokio::test]
    async fn test_predictor_respects_enabled_methods_and_thresholds() {
        let predictor = FailurePredictor::new(PredictiveDetectionConfig::default());
        assert_eq!(predictor.detector_names().await, vec!["statistical", "pattern"]);

        // Rising latency only trips the regression detector
        let rising: Vec<u64> = (1..=20).map(|i| i * 10).collect();
        assert!(predictor.evaluate("node:a", &samples(&rising, &[])).await.is_none());

        predictor.update_config(config()).await;
        let prediction = predictor
            .evaluate("node:a", &samples(&rising, &[]))
            .await
            .unwrap();
        assert_eq!(prediction.method, "ml");
    }

    #[tokio::test]
    async fn test_run_broadcasts_predictions() {
        let predictor = FailurePredictor::new(config());
        let mut events = predictor.subscribe();
        let tracker = PerformanceTracker::default();
        // node:a fails everything after its first two calls
        for i in 0..20 {
            tracker
                .record("node:a", Duration::from_millis(10), i < 2)
                .await;
            tracker.record("node:b", Duration::from_millis(10), true).await;
        }

        let predictions = predictor.run(&tracker).await;
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].key, "node:a");
        assert_eq!(events.recv().await.unwrap().method, "pattern");
        assert_eq!(predictor.predictions_emitted(), 1);
    }
}
