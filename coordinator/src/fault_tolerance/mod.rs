//! Fault tolerance for the inference mesh
//!
//! Detects failing nodes, predicts the ones about to fail, heals them with a
//! ranked set of strategies that learn from outcomes, keeps models replicated
//! and tunes its own configuration from what it observes.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────────────┐
//!  reload ──────▶│         FaultToleranceManager        │──▶ watch<FaultToleranceConfig>
//!  (yaml/toml)   │  validate, then apply to components  │        │ periods re-read live
//!                └──────────────────────────────────────┘        ▼
//!                         │ TaskSupervisor: one loop per concern
//!   ┌──────────┬──────────┼───────────┬──────────┬────────────┬────────────┐
//!   ▼          ▼          ▼           ▼          ▼            ▼            ▼
//! health    monitoring  prediction  healing   learning   redundancy   adaptation
//! sweep      │           │           │          │            │            │
//!   │        ▼           ▼           ▼          ▼            ▼            ▼
//!   │     FaultLog   FailurePredictor SelfHealer ◀─┘   RedundancyManager ConfigAdapter
//!   │        ▲           ▲           │ HealingActuator       │
//!   ▼        │           │           ▼                       ▼
//! NodeRegistry ◀─────────┴─── PerformanceTracker        ModelManager
//!                                    ▲
//!          ResilientTransport ───────┘ retry + CircuitBreakerRegistry
//! ```
//!
//! Every loop body is also available as a single `run_*` cycle on the
//! manager, which keeps the loops themselves trivial and the behavior
//! testable without timers.

pub mod adaptation;
pub mod circuit_breaker;
pub mod config;
pub mod faults;
pub mod healing;
pub mod manager;
pub mod performance;
pub mod predictive;
pub mod redundancy;
pub mod resilient;
pub mod retry;
pub mod supervisor;

pub use adaptation::{AdaptationOutcome, ConfigAdapter};
pub use circuit_breaker::{node_key, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use config::{
    CircuitBreakerConfig, ConfigAdaptationConfig, FaultToleranceConfig, PerformanceTrackingConfig,
    PredictiveDetectionConfig, RedundancyConfig, RetryConfig, SelfHealingConfig,
};
pub use faults::{FaultDetection, FaultLog, FaultSeverity, FaultStatus, FaultType};
pub use healing::{
    health_score, HealingActuator, HealingAttempt, HealingStrategyKind, RegistryActuator,
    SelfHealer, StrategyStats,
};
pub use manager::{
    BackgroundLoop, CleanupReport, FaultToleranceManager, FaultToleranceMetrics, HealingReport,
};
pub use performance::{PerformanceSample, PerformanceSummary, PerformanceTracker};
pub use predictive::{
    AnomalyDetector, AnomalyScore, FailurePredictor, PatternDetector, PredictedFailure,
    RegressionDetector, StatisticalDetector,
};
pub use redundancy::{RedundancyManager, ReplicationAction};
pub use resilient::ResilientTransport;
pub use retry::RetryPolicy;
pub use supervisor::{run_every, ShutdownSignal, TaskSupervisor};
