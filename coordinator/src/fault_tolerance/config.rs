//! Fault-tolerance configuration and its validation rules.
//!
//! A document is only ever accepted whole: [`FaultToleranceConfig::validate`]
//! reports every violated rule at once and callers must not apply any part of
//! a document that fails it.

use crate::config::duration_format::{self, format_duration};
use crate::errors::{Result, ValidationError, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIN_REPLICATION_FACTOR: u32 = 1;
const MAX_REPLICATION_FACTOR: u32 = 10;
const MAX_RETRIES: u32 = 10;
const MAX_FAILURE_THRESHOLD: u32 = 100;
const MIN_REDUNDANCY_FACTOR: u32 = 1;
const MAX_REDUNDANCY_FACTOR: u32 = 20;

const HEALTH_CHECK_INTERVAL_BOUNDS: (Duration, Duration) =
    (Duration::from_secs(5), Duration::from_secs(600));
const RECOVERY_TIMEOUT_BOUNDS: (Duration, Duration) =
    (Duration::from_secs(30), Duration::from_secs(1800));
const BREAKER_RECOVERY_BOUNDS: (Duration, Duration) =
    (Duration::from_secs(1), Duration::from_secs(1800));
const HEALING_INTERVAL_BOUNDS: (Duration, Duration) =
    (Duration::from_secs(10), Duration::from_secs(1800));
const PERFORMANCE_WINDOW_BOUNDS: (Duration, Duration) =
    (Duration::from_secs(10), Duration::from_secs(86_400));
const ADAPTATION_INTERVAL_BOUNDS: (Duration, Duration) =
    (Duration::from_secs(60), Duration::from_secs(86_400));

/// Retry policy for node-facing calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retrying)
    pub max_retries: u32,
    #[serde(with = "duration_format")]
    pub initial_delay: Duration,
    #[serde(with = "duration_format")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomly added or removed
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects work before allowing a probe
    #[serde(with = "duration_format")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveDetectionConfig {
    pub enabled: bool,
    pub confidence_threshold: f64,
    #[serde(with = "duration_format")]
    pub prediction_interval: Duration,
    /// Trailing window of samples scored on each run
    #[serde(with = "duration_format")]
    pub window_size: Duration,
    pub anomaly_threshold: f64,
    pub enable_ml_detection: bool,
    pub enable_statistical: bool,
    pub enable_pattern_recognition: bool,
}

impl Default for PredictiveDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.8,
            prediction_interval: Duration::from_secs(30),
            window_size: Duration::from_secs(300),
            anomaly_threshold: 0.8,
            enable_ml_detection: false,
            enable_statistical: true,
            enable_pattern_recognition: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfHealingConfig {
    pub enabled: bool,
    /// Targets whose health score drops below this are healed
    pub healing_threshold: f64,
    #[serde(with = "duration_format")]
    pub healing_interval: Duration,
    #[serde(with = "duration_format")]
    pub monitoring_interval: Duration,
    #[serde(with = "duration_format")]
    pub learning_interval: Duration,
    pub service_restart: bool,
    pub resource_reallocation: bool,
    pub load_redistribution: bool,
    pub enable_learning: bool,
    pub enable_predictive: bool,
    pub enable_proactive: bool,
    pub enable_failover: bool,
    pub enable_scaling: bool,
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            healing_threshold: 0.7,
            healing_interval: Duration::from_secs(60),
            monitoring_interval: Duration::from_secs(10),
            learning_interval: Duration::from_secs(300),
            service_restart: true,
            resource_reallocation: true,
            load_redistribution: true,
            enable_learning: true,
            enable_predictive: true,
            enable_proactive: false,
            enable_failover: true,
            enable_scaling: true,
        }
    }
}

impl SelfHealingConfig {
    fn any_strategy_enabled(&self) -> bool {
        self.service_restart
            || self.resource_reallocation
            || self.load_redistribution
            || self.enable_failover
            || self.enable_scaling
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedundancyConfig {
    pub enabled: bool,
    pub default_factor: u32,
    pub max_factor: u32,
    #[serde(with = "duration_format")]
    pub update_interval: Duration,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_factor: 2,
            max_factor: 5,
            update_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceTrackingConfig {
    pub enabled: bool,
    #[serde(with = "duration_format")]
    pub window_size: Duration,
}

impl Default for PerformanceTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigAdaptationConfig {
    pub enabled: bool,
    #[serde(with = "duration_format")]
    pub interval: Duration,
}

impl Default for ConfigAdaptationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(600),
        }
    }
}

/// Complete fault-tolerance configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceConfig {
    pub enabled: bool,
    pub replication_factor: u32,
    #[serde(with = "duration_format")]
    pub health_check_interval: Duration,
    /// Time budget for a single healing action
    #[serde(with = "duration_format")]
    pub recovery_timeout: Duration,
    /// Nodes silent for longer than this are marked unavailable
    #[serde(with = "duration_format")]
    pub stale_node_timeout: Duration,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub predictive_detection: PredictiveDetectionConfig,
    pub self_healing: SelfHealingConfig,
    pub redundancy: RedundancyConfig,
    pub performance_tracking: PerformanceTrackingConfig,
    pub config_adaptation: ConfigAdaptationConfig,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            replication_factor: 2,
            health_check_interval: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(300),
            stale_node_timeout: Duration::from_secs(90),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            predictive_detection: PredictiveDetectionConfig::default(),
            self_healing: SelfHealingConfig::default(),
            redundancy: RedundancyConfig::default(),
            performance_tracking: PerformanceTrackingConfig::default(),
            config_adaptation: ConfigAdaptationConfig::default(),
        }
    }
}

impl FaultToleranceConfig {
    /// Parse a YAML document and validate it.
    pub fn from_yaml_str(doc: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(doc: &str) -> Result<Self> {
        let config: Self = toml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every range and cross-field rule.
    pub fn validate(&self) -> Result<()> {
        self.violations().into_result()
    }

    /// Collect every violated rule without failing fast.
    pub fn violations(&self) -> ValidationErrors {
        let mut errs = ValidationErrors::default();

        check_u32(
            &mut errs,
            "replication_factor",
            self.replication_factor,
            MIN_REPLICATION_FACTOR,
            MAX_REPLICATION_FACTOR,
        );
        check_duration(
            &mut errs,
            "health_check_interval",
            self.health_check_interval,
            HEALTH_CHECK_INTERVAL_BOUNDS,
        );
        check_duration(
            &mut errs,
            "recovery_timeout",
            self.recovery_timeout,
            RECOVERY_TIMEOUT_BOUNDS,
        );
        check_nonzero(&mut errs, "stale_node_timeout", self.stale_node_timeout);

        self.validate_retry(&mut errs);
        self.validate_circuit_breaker(&mut errs);
        self.validate_predictive(&mut errs);
        self.validate_self_healing(&mut errs);
        self.validate_redundancy(&mut errs);

        check_duration(
            &mut errs,
            "performance_tracking.window_size",
            self.performance_tracking.window_size,
            PERFORMANCE_WINDOW_BOUNDS,
        );
        check_duration(
            &mut errs,
            "config_adaptation.interval",
            self.config_adaptation.interval,
            ADAPTATION_INTERVAL_BOUNDS,
        );

        self.validate_cross_settings(&mut errs);
        errs
    }

    /// Healing intervals that satisfy every rule tying other settings to it
    ///
    /// Empty (lower above upper) when the surrounding settings already
    /// conflict.
    pub(crate) fn healing_interval_range(&self) -> (Duration, Duration) {
        let (min, max) = HEALING_INTERVAL_BOUNDS;
        let lower = min
            .max(self.self_healing.monitoring_interval * 3)
            .max(self.predictive_detection.prediction_interval);
        let upper = max
            .min(self.performance_tracking.window_size / 3)
            .min(self.config_adaptation.interval / 10);
        (lower, upper)
    }

    fn validate_retry(&self, errs: &mut ValidationErrors) {
        let retry = &self.retry;
        check_u32(errs, "retry.max_retries", retry.max_retries, 0, MAX_RETRIES);
        check_nonzero(errs, "retry.initial_delay", retry.initial_delay);
        if retry.max_delay < retry.initial_delay {
            errs.push(ValidationError::new(
                "retry.max_delay",
                format!(
                    "must be at least retry.initial_delay ({})",
                    format_duration(retry.initial_delay)
                ),
                format_duration(retry.max_delay),
            ));
        }
        if !(retry.backoff_multiplier >= 1.0) {
            errs.push(ValidationError::new(
                "retry.backoff_multiplier",
                "must be >= 1.0",
                retry.backoff_multiplier,
            ));
        }
        check_unit(errs, "retry.jitter_factor", retry.jitter_factor);
    }

    fn validate_circuit_breaker(&self, errs: &mut ValidationErrors) {
        check_u32(
            errs,
            "circuit_breaker.failure_threshold",
            self.circuit_breaker.failure_threshold,
            1,
            MAX_FAILURE_THRESHOLD,
        );
        check_duration(
            errs,
            "circuit_breaker.recovery_timeout",
            self.circuit_breaker.recovery_timeout,
            BREAKER_RECOVERY_BOUNDS,
        );
    }

    fn validate_predictive(&self, errs: &mut ValidationErrors) {
        let pd = &self.predictive_detection;
        check_unit(
            errs,
            "predictive_detection.confidence_threshold",
            pd.confidence_threshold,
        );
        check_unit(
            errs,
            "predictive_detection.anomaly_threshold",
            pd.anomaly_threshold,
        );
        check_nonzero(
            errs,
            "predictive_detection.prediction_interval",
            pd.prediction_interval,
        );
        check_nonzero(errs, "predictive_detection.window_size", pd.window_size);

        if pd.enabled
            && !pd.enable_ml_detection
            && !pd.enable_statistical
            && !pd.enable_pattern_recognition
        {
            errs.push(ValidationError::new(
                "predictive_detection",
                "at least one detection method must be enabled (ml_detection, statistical, or pattern_recognition)",
                "none",
            ));
        }
    }

    fn validate_self_healing(&self, errs: &mut ValidationErrors) {
        let sh = &self.self_healing;
        check_unit(errs, "self_healing.healing_threshold", sh.healing_threshold);
        check_duration(
            errs,
            "self_healing.healing_interval",
            sh.healing_interval,
            HEALING_INTERVAL_BOUNDS,
        );
        check_nonzero(errs, "self_healing.monitoring_interval", sh.monitoring_interval);
        check_nonzero(errs, "self_healing.learning_interval", sh.learning_interval);

        if sh.enabled && !sh.any_strategy_enabled() {
            errs.push(ValidationError::new(
                "self_healing",
                "at least one healing strategy must be enabled (service_restart, resource_reallocation, load_redistribution, failover, or scaling)",
                "none",
            ));
        }
    }

    fn validate_redundancy(&self, errs: &mut ValidationErrors) {
        let r = &self.redundancy;
        check_u32(
            errs,
            "redundancy.default_factor",
            r.default_factor,
            MIN_REDUNDANCY_FACTOR,
            MAX_REDUNDANCY_FACTOR,
        );
        check_u32(
            errs,
            "redundancy.max_factor",
            r.max_factor,
            MIN_REDUNDANCY_FACTOR,
            MAX_REDUNDANCY_FACTOR,
        );
        if r.default_factor > r.max_factor {
            errs.push(ValidationError::new(
                "redundancy.default_factor",
                format!("cannot be greater than redundancy.max_factor ({})", r.max_factor),
                r.default_factor,
            ));
        }
        check_nonzero(errs, "redundancy.update_interval", r.update_interval);
    }

    fn validate_cross_settings(&self, errs: &mut ValidationErrors) {
        let sh = &self.self_healing;
        let healing = sh.healing_interval;

        if healing < sh.monitoring_interval * 3 {
            errs.push(ValidationError::new(
                "self_healing.healing_interval",
                format!(
                    "must be at least 3x self_healing.monitoring_interval ({})",
                    format_duration(sh.monitoring_interval)
                ),
                format_duration(healing),
            ));
        }

        if self.performance_tracking.window_size < healing * 3 {
            errs.push(ValidationError::new(
                "performance_tracking.window_size",
                format!(
                    "must be at least 3x self_healing.healing_interval ({})",
                    format_duration(healing)
                ),
                format_duration(self.performance_tracking.window_size),
            ));
        }

        if self.predictive_detection.prediction_interval > healing {
            errs.push(ValidationError::new(
                "predictive_detection.prediction_interval",
                format!(
                    "must not exceed self_healing.healing_interval ({})",
                    format_duration(healing)
                ),
                format_duration(self.predictive_detection.prediction_interval),
            ));
        }

        if self.config_adaptation.interval < healing * 10 {
            errs.push(ValidationError::new(
                "config_adaptation.interval",
                format!(
                    "must be at least 10x self_healing.healing_interval ({})",
                    format_duration(healing)
                ),
                format_duration(self.config_adaptation.interval),
            ));
        }

        if sh.enable_predictive && !self.predictive_detection.enabled {
            errs.push(ValidationError::new(
                "self_healing.enable_predictive",
                "requires predictive_detection.enabled",
                true,
            ));
        }

        if self.redundancy.default_factor > self.replication_factor * 2 {
            errs.push(ValidationError::new(
                "redundancy.default_factor",
                format!(
                    "must not exceed 2x replication_factor ({})",
                    self.replication_factor
                ),
                self.redundancy.default_factor,
            ));
        }
    }
}

fn check_u32(errs: &mut ValidationErrors, field: &str, value: u32, min: u32, max: u32) {
    if value < min || value > max {
        errs.push(ValidationError::new(
            field,
            format!("must be between {} and {}", min, max),
            value,
        ));
    }
}

fn check_unit(errs: &mut ValidationErrors, field: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errs.push(ValidationError::new(field, "must be between 0 and 1", value));
    }
}

fn check_nonzero(errs: &mut ValidationErrors, field: &str, value: Duration) {
    if value.is_zero() {
        errs.push(ValidationError::new(field, "must be > 0", format_duration(value)));
    }
}

fn check_duration(
    errs: &mut ValidationErrors,
    field: &str,
    value: Duration,
    (min, max): (Duration, Duration),
) {
    if value < min || value > max {
        errs.push(ValidationError::new(
            field,
            format!(
                "must be between {} and {}",
                format_duration(min),
                format_duration(max)
            ),
            format_duration(value),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CoordinatorError;

    fn violations_of(config: &FaultToleranceConfig) -> ValidationErrors {
        match config.validate() {
            Err(CoordinatorError::Validation(errs)) => errs,
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        FaultToleranceConfig::default().validate().unwrap();
    }

    #[test]
    fn test_healing_must_be_three_monitoring_intervals() {
        let mut config = FaultToleranceConfig::default();
        config.self_healing.monitoring_interval = Duration::from_secs(30);
        let errs = violations_of(&config);
        assert!(errs.has_field("self_healing.healing_interval"));
    }

    #[test]
    fn test_prediction_interval_cannot_exceed_healing() {
        let mut config = FaultToleranceConfig::default();
        config.predictive_detection.prediction_interval = Duration::from_secs(120);
        let errs = violations_of(&config);
        assert_eq!(errs.fields(), vec!["predictive_detection.prediction_interval"]);
    }

    #[test]
    fn test_performance_window_relative_to_healing() {
        let mut config = FaultToleranceConfig::default();
        config.performance_tracking.window_size = Duration::from_secs(120);
        let errs = violations_of(&config);
        assert!(errs.has_field("performance_tracking.window_size"));
    }

    #[test]
    fn test_adaptation_interval_relative_to_healing() {
        let mut config = FaultToleranceConfig::default();
        config.config_adaptation.interval = Duration::from_secs(300);
        let errs = violations_of(&config);
        assert!(errs.has_field("config_adaptation.interval"));
    }

    #[test]
    fn test_predictive_healing_requires_detection() {
        let mut config = FaultToleranceConfig::default();
        config.predictive_detection.enabled = false;
        let errs = violations_of(&config);
        assert_eq!(errs.fields(), vec!["self_healing.enable_predictive"]);

        config.self_healing.enable_predictive = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_threshold_ranges() {
        let mut config = FaultToleranceConfig::default();
        config.predictive_detection.confidence_threshold = 1.5;
        config.self_healing.healing_threshold = -0.1;
        let errs = violations_of(&config);
        assert!(errs.has_field("predictive_detection.confidence_threshold"));
        assert!(errs.has_field("self_healing.healing_threshold"));
    }

    #[test]
    fn test_redundancy_factors() {
        let mut config = FaultToleranceConfig::default();
        config.redundancy.default_factor = 6;
        config.redundancy.max_factor = 5;
        let errs = violations_of(&config);
        assert!(errs.has_field("redundancy.default_factor"));

        let mut config = FaultToleranceConfig::default();
        config.redundancy.max_factor = 21;
        assert!(violations_of(&config).has_field("redundancy.max_factor"));
    }

    #[test]
    fn test_no_detection_method_enabled() {
        let mut config = FaultToleranceConfig::default();
        config.predictive_detection.enable_statistical = false;
        config.predictive_detection.enable_pattern_recognition = false;
        let errs = violations_of(&config);
        assert!(errs.has_field("predictive_detection"));
    }

    #[test]
    fn test_no_healing_strategy_enabled() {
        let mut config = FaultToleranceConfig::default();
        config.self_healing.service_restart = false;
        config.self_healing.resource_reallocation = false;
        config.self_healing.load_redistribution = false;
        config.self_healing.enable_failover = false;
        config.self_healing.enable_scaling = false;
        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("at least one healing strategy must be enabled"));
    }

    #[test]
    fn test_yaml_document_parses_human_durations() {
        let doc = r#"
replication_factor: 3
self_healing:
  healing_interval: 2m
  monitoring_interval: 20s
predictive_detection:
  prediction_interval: 45s
performance_tracking:
  window_size: 10m
config_adaptation:
  interval: 30m
"#;
        let config = FaultToleranceConfig::from_yaml_str(doc).unwrap();
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.self_healing.healing_interval, Duration::from_secs(120));
        assert_eq!(
            config.predictive_detection.prediction_interval,
            Duration::from_secs(45)
        );
        // untouched sections keep defaults
        assert_eq!(config.redundancy, RedundancyConfig::default());
    }

    #[test]
    fn test_toml_document_rejected_whole() {
        let doc = r#"
[self_healing]
healing_interval = "5s"
monitoring_interval = "10s"
"#;
        let err = FaultToleranceConfig::from_toml_str(doc).unwrap_err();
        match err {
            CoordinatorError::Validation(errs) => {
                assert!(errs.has_field("self_healing.healing_interval"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
