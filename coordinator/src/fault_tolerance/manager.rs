//! Fault-tolerance manager
//!
//! Owns the shared breakers and performance tracker, the fault log and the
//! background loops. Every loop is also exposed as a `run_*` method that
//! performs exactly one cycle, which is what the loops call on each tick.

use crate::errors::{CoordinatorError, Result};
use crate::model::ModelManager;
use crate::network::PeerTransport;
use crate::node::{NodeId, NodeInfo, NodeRegistry, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::adaptation::{AdaptationOutcome, ConfigAdapter};
use super::circuit_breaker::{node_key, CircuitBreakerRegistry};
use super::config::FaultToleranceConfig;
use super::faults::{FaultDetection, FaultLog, FaultStatus, FaultType};
use super::healing::{health_score, HealingActuator, HealingStrategyKind, RegistryActuator, SelfHealer};
use super::performance::PerformanceTracker;
use super::predictive::{FailurePredictor, PredictedFailure};
use super::redundancy::{RedundancyManager, ReplicationAction};
use super::resilient::ResilientTransport;
use super::retry::RetryPolicy;
use super::supervisor::{run_every, TaskSupervisor};

/// Resolved faults and healing history kept by the health sweep
const STATE_RETENTION: Duration = Duration::from_secs(3600);
/// Error rate at which a node is reported unavailable as a service
const SERVICE_ERROR_RATE: f64 = 0.5;
/// Average latency multiple over the cluster that counts as an anomaly
const LATENCY_ANOMALY_FACTOR: u32 = 3;
const ANOMALY_MIN_SAMPLES: usize = 5;
/// Load at which a node is exhausted
const EXHAUSTED_LOAD: f64 = 0.95;
/// Load at which proactive healing steps in
const PROACTIVE_LOAD: f64 = 0.9;

/// The independently schedulable background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundLoop {
    HealthSweep,
    Monitoring,
    Prediction,
    Healing,
    Learning,
    Redundancy,
    Adaptation,
}

impl BackgroundLoop {
    pub const ALL: [BackgroundLoop; 7] = [
        BackgroundLoop::HealthSweep,
        BackgroundLoop::Monitoring,
        BackgroundLoop::Prediction,
        BackgroundLoop::Healing,
        BackgroundLoop::Learning,
        BackgroundLoop::Redundancy,
        BackgroundLoop::Adaptation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackgroundLoop::HealthSweep => "health_sweep",
            BackgroundLoop::Monitoring => "monitoring",
            BackgroundLoop::Prediction => "prediction",
            BackgroundLoop::Healing => "healing",
            BackgroundLoop::Learning => "learning",
            BackgroundLoop::Redundancy => "redundancy",
            BackgroundLoop::Adaptation => "adaptation",
        }
    }

    pub fn period(&self, config: &FaultToleranceConfig) -> Duration {
        match self {
            BackgroundLoop::HealthSweep => config.health_check_interval,
            BackgroundLoop::Monitoring => config.self_healing.monitoring_interval,
            BackgroundLoop::Prediction => config.predictive_detection.prediction_interval,
            BackgroundLoop::Healing => config.self_healing.healing_interval,
            BackgroundLoop::Learning => config.self_healing.learning_interval,
            BackgroundLoop::Redundancy => config.redundancy.update_interval,
            BackgroundLoop::Adaptation => config.config_adaptation.interval,
        }
    }

    pub fn is_enabled(&self, config: &FaultToleranceConfig) -> bool {
        if !config.enabled {
            return false;
        }
        match self {
            BackgroundLoop::HealthSweep => true,
            BackgroundLoop::Monitoring | BackgroundLoop::Healing => config.self_healing.enabled,
            BackgroundLoop::Learning => {
                config.self_healing.enabled && config.self_healing.enable_learning
            }
            BackgroundLoop::Prediction => config.predictive_detection.enabled,
            BackgroundLoop::Redundancy => config.redundancy.enabled,
            BackgroundLoop::Adaptation => config.config_adaptation.enabled,
        }
    }
}

/// Outcome of healing one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingReport {
    pub node_id: String,
    pub reason: String,
    pub strategy: Option<HealingStrategyKind>,
    pub error: Option<String>,
}

/// What one housekeeping pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub faults: usize,
    pub healing_attempts: usize,
    pub breakers: usize,
    pub samples: usize,
    pub predictions: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.faults + self.healing_attempts + self.breakers + self.samples + self.predictions
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultToleranceMetrics {
    pub faults_detected: u64,
    pub open_faults: usize,
    pub healing_attempts: u64,
    pub successful_healings: u64,
    pub average_healing_time: Duration,
    pub predictions_emitted: u64,
    pub replication_requests: u64,
    pub adaptations_applied: u64,
    pub adaptations_rejected: u64,
    pub open_circuits: usize,
    pub config_reloads: u64,
}

struct ManagerInner {
    config: watch::Sender<FaultToleranceConfig>,
    reload_lock: Mutex<()>,
    nodes: Arc<NodeRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    performance: Arc<PerformanceTracker>,
    faults: FaultLog,
    predictor: FailurePredictor,
    healer: SelfHealer,
    redundancy: RedundancyManager,
    adapter: ConfigAdapter,
    /// Predictions not yet acted on, by performance key
    predicted: RwLock<HashMap<String, PredictedFailure>>,
    guarded: RwLock<Vec<Weak<ResilientTransport>>>,
    faults_detected: AtomicU64,
    reloads: AtomicU64,
}

pub struct FaultToleranceManager {
    inner: Arc<ManagerInner>,
    supervisor: TaskSupervisor,
}

impl FaultToleranceManager {
    /// Manager that heals through the node registry and model manager
    pub fn new(
        config: FaultToleranceConfig,
        nodes: Arc<NodeRegistry>,
        models: Arc<dyn ModelManager>,
    ) -> Result<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let actuator = Arc::new(RegistryActuator::new(
            nodes.clone(),
            breakers.clone(),
            models.clone(),
        ));
        Self::assemble(config, nodes, models, breakers, actuator)
    }

    /// Manager with a custom healing actuator
    pub fn with_actuator(
        config: FaultToleranceConfig,
        nodes: Arc<NodeRegistry>,
        models: Arc<dyn ModelManager>,
        actuator: Arc<dyn HealingActuator>,
    ) -> Result<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        Self::assemble(config, nodes, models, breakers, actuator)
    }

    fn assemble(
        config: FaultToleranceConfig,
        nodes: Arc<NodeRegistry>,
        models: Arc<dyn ModelManager>,
        breakers: Arc<CircuitBreakerRegistry>,
        actuator: Arc<dyn HealingActuator>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = ManagerInner {
            performance: Arc::new(PerformanceTracker::new(config.performance_tracking.clone())),
            predictor: FailurePredictor::new(config.predictive_detection.clone()),
            healer: SelfHealer::new(
                config.self_healing.clone(),
                config.recovery_timeout,
                actuator,
            ),
            redundancy: RedundancyManager::new(config.redundancy.clone(), models, nodes.clone()),
            adapter: ConfigAdapter::new(),
            faults: FaultLog::new(),
            predicted: RwLock::new(HashMap::new()),
            guarded: RwLock::new(Vec::new()),
            faults_detected: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
            config: watch::channel(config).0,
            nodes,
            breakers,
        };

        Ok(Self {
            inner: Arc::new(inner),
            supervisor: TaskSupervisor::new(),
        })
    }

    pub fn config(&self) -> FaultToleranceConfig {
        self.inner.config.borrow().clone()
    }

    /// Receives every applied configuration
    pub fn subscribe_config(&self) -> watch::Receiver<FaultToleranceConfig> {
        self.inner.config.subscribe()
    }

    pub fn subscribe_predictions(&self) -> broadcast::Receiver<PredictedFailure> {
        self.inner.predictor.subscribe()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    pub fn performance(&self) -> &Arc<PerformanceTracker> {
        &self.inner.performance
    }

    pub fn healer(&self) -> &SelfHealer {
        &self.inner.healer
    }

    /// Wrap a transport with this manager's breakers, retry policy and
    /// performance sampling. The retry policy follows config reloads.
    pub async fn guard_transport(&self, transport: Arc<dyn PeerTransport>) -> Arc<ResilientTransport> {
        let retry = RetryPolicy::new(self.config().retry);
        let guarded = Arc::new(
            ResilientTransport::new(transport, self.inner.breakers.clone())
                .with_retry(retry)
                .with_performance_tracker(self.inner.performance.clone()),
        );
        self.inner
            .guarded
            .write()
            .await
            .push(Arc::downgrade(&guarded));
        guarded
    }

    // ---- lifecycle ----

    /// Start every loop the configuration enables
    pub async fn start(&self) -> Result<()> {
        let config = self.config();
        if !config.enabled {
            info!("Fault tolerance disabled, no background loops started");
            return Ok(());
        }
        for kind in BackgroundLoop::ALL {
            if kind.is_enabled(&config) {
                self.start_loop(kind).await;
            }
        }
        info!(loops = ?self.running_loops().await, "Fault tolerance manager started");
        Ok(())
    }

    /// Stop every loop and wait for in-flight cycles to finish
    pub async fn stop(&self) {
        self.supervisor.stop_all().await;
        info!("Fault tolerance manager stopped");
    }

    /// Start one loop; returns false if it was already running
    pub async fn start_loop(&self, kind: BackgroundLoop) -> bool {
        let inner = self.inner.clone();
        let config = inner.config.subscribe();
        self.supervisor
            .spawn(kind.name(), move |shutdown| async move {
                run_every(
                    kind.name(),
                    config,
                    move |c: &FaultToleranceConfig| kind.period(c),
                    shutdown,
                    move || {
                        let inner = inner.clone();
                        async move { inner.run_cycle(kind).await }
                    },
                )
                .await
            })
            .await
    }

    pub async fn stop_loop(&self, kind: BackgroundLoop) -> bool {
        self.supervisor.stop(kind.name()).await
    }

    pub async fn running_loops(&self) -> Vec<String> {
        self.supervisor.running().await
    }

    // ---- configuration ----

    /// Validate and apply a new configuration
    ///
    /// A document that fails validation is rejected whole; nothing about the
    /// running configuration changes. Loops pick up new intervals at once.
    #[instrument(skip(self, config))]
    pub async fn reload_config(&self, config: FaultToleranceConfig) -> Result<()> {
        self.inner.apply_config(config).await
    }

    /// Reload from a `.yaml`/`.yml` or `.toml` file
    pub async fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let doc = tokio::fs::read_to_string(path).await?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => FaultToleranceConfig::from_yaml_str(&doc)?,
            Some("toml") => FaultToleranceConfig::from_toml_str(&doc)?,
            _ => {
                return Err(CoordinatorError::Config(format!(
                    "unsupported config format: {}",
                    path.display()
                )))
            }
        };
        self.reload_config(config).await
    }

    // ---- faults ----

    pub async fn detect_fault(
        &self,
        fault_type: FaultType,
        target: &str,
        description: &str,
    ) -> FaultDetection {
        self.inner.detect_fault(fault_type, target, description).await
    }

    pub async fn get_fault_detections(&self) -> Vec<FaultDetection> {
        self.inner.faults.all().await
    }

    // ---- single cycles ----

    pub async fn run_health_sweep(&self) -> usize {
        self.inner.run_health_sweep().await
    }

    pub async fn run_monitoring_cycle(&self) -> Vec<FaultDetection> {
        self.inner.run_monitoring_cycle().await
    }

    pub async fn run_prediction_cycle(&self) -> Vec<PredictedFailure> {
        self.inner.run_prediction_cycle().await
    }

    pub async fn run_healing_cycle(&self) -> Vec<HealingReport> {
        self.inner.run_healing_cycle().await
    }

    pub async fn run_learning_cycle(&self) -> usize {
        self.inner.healer.learn().await
    }

    pub async fn run_redundancy_cycle(&self) -> Result<Vec<ReplicationAction>> {
        self.inner.redundancy.run().await
    }

    pub async fn run_adaptation_cycle(&self) -> AdaptationOutcome {
        self.inner.run_adaptation_cycle().await
    }

    /// Drop expired state; repeating it with nothing new expiring is a no-op
    pub async fn cleanup_expired_states(&self, retention: Duration) -> CleanupReport {
        self.inner.cleanup_expired_states(retention).await
    }

    pub async fn get_metrics(&self) -> FaultToleranceMetrics {
        let inner = &self.inner;
        FaultToleranceMetrics {
            faults_detected: inner.faults_detected.load(Ordering::Relaxed),
            open_faults: inner.faults.open().await.len(),
            healing_attempts: inner.healer.attempts(),
            successful_healings: inner.healer.successful(),
            average_healing_time: inner.healer.average_healing_time(),
            predictions_emitted: inner.predictor.predictions_emitted(),
            replication_requests: inner.redundancy.replication_requests(),
            adaptations_applied: inner.adapter.applied(),
            adaptations_rejected: inner.adapter.rejected(),
            open_circuits: inner.breakers.open_keys().await.len(),
            config_reloads: inner.reloads.load(Ordering::Relaxed),
        }
    }
}

impl ManagerInner {
    fn current(&self) -> FaultToleranceConfig {
        self.config.borrow().clone()
    }

    async fn run_cycle(&self, kind: BackgroundLoop) {
        match kind {
            BackgroundLoop::HealthSweep => {
                self.run_health_sweep().await;
            }
            BackgroundLoop::Monitoring => {
                self.run_monitoring_cycle().await;
            }
            BackgroundLoop::Prediction => {
                self.run_prediction_cycle().await;
            }
            BackgroundLoop::Healing => {
                self.run_healing_cycle().await;
            }
            BackgroundLoop::Learning => {
                self.healer.learn().await;
            }
            BackgroundLoop::Redundancy => {
                if let Err(e) = self.redundancy.run().await {
                    warn!(error = %e, "Redundancy cycle failed");
                }
            }
            BackgroundLoop::Adaptation => {
                self.run_adaptation_cycle().await;
            }
        }
    }

    async fn apply_config(&self, config: FaultToleranceConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Configuration rejected");
            return Err(e);
        }

        let _guard = self.reload_lock.lock().await;
        self.breakers.update_config(config.circuit_breaker.clone()).await;
        self.performance
            .update_config(config.performance_tracking.clone())
            .await;
        self.predictor
            .update_config(config.predictive_detection.clone())
            .await;
        self.healer
            .update_config(config.self_healing.clone(), config.recovery_timeout)
            .await;
        self.redundancy.update_config(config.redundancy.clone()).await;

        let retry = RetryPolicy::new(config.retry.clone());
        let mut guarded = self.guarded.write().await;
        guarded.retain(|weak| weak.strong_count() > 0);
        for transport in guarded.iter().filter_map(Weak::upgrade) {
            transport.set_retry(retry.clone()).await;
        }
        drop(guarded);

        self.config.send_replace(config);
        self.reloads.fetch_add(1, Ordering::Relaxed);
        info!("Configuration applied");
        Ok(())
    }

    async fn detect_fault(
        &self,
        fault_type: FaultType,
        target: &str,
        description: &str,
    ) -> FaultDetection {
        let (fault, is_new) = self.faults.record(fault_type, target, description).await;
        if is_new {
            self.faults_detected.fetch_add(1, Ordering::Relaxed);
        }
        fault
    }

    async fn run_health_sweep(&self) -> usize {
        let stale_after = self.current().stale_node_timeout;
        let reachable: HashSet<NodeId> = self
            .nodes
            .snapshot()
            .await
            .into_iter()
            .filter(|n| n.status != NodeStatus::Unavailable)
            .map(|n| n.id)
            .collect();

        let changed = self.nodes.cleanup_stale_entries(stale_after).await;
        if changed > 0 {
            for node in self.nodes.snapshot().await {
                if node.status == NodeStatus::Unavailable && reachable.contains(&node.id) {
                    self.detect_fault(
                        FaultType::NodeFailure,
                        &node_key(&node.id),
                        "node missed heartbeats",
                    )
                    .await;
                }
            }
        }

        self.cleanup_expired_states(STATE_RETENTION).await;
        changed
    }

    async fn run_monitoring_cycle(&self) -> Vec<FaultDetection> {
        let threshold = self.healer.threshold().await;
        let overall = self.performance.overall().await;
        let mut detected = Vec::new();

        for node in self.nodes.snapshot().await {
            if node.status == NodeStatus::Unavailable {
                continue;
            }
            let key = node_key(&node.id);
            let summary = self.performance.summary(&key).await;
            let mut found = Vec::new();

            if self.breakers.is_open(&key).await {
                found.push((FaultType::NetworkPartition, "circuit open".to_string()));
            }
            if node.load >= EXHAUSTED_LOAD {
                found.push((
                    FaultType::ResourceExhaustion,
                    format!("load {:.2}", node.load),
                ));
            }
            if let Some(s) = &summary {
                if s.samples >= ANOMALY_MIN_SAMPLES && s.error_rate >= SERVICE_ERROR_RATE {
                    found.push((
                        FaultType::ServiceUnavailable,
                        format!("error rate {:.2}", s.error_rate),
                    ));
                }
                if let Some(o) = &overall {
                    if s.samples >= ANOMALY_MIN_SAMPLES
                        && s.avg_latency > o.avg_latency * LATENCY_ANOMALY_FACTOR
                    {
                        found.push((
                            FaultType::PerformanceAnomaly,
                            format!(
                                "avg latency {:?} vs cluster {:?}",
                                s.avg_latency, o.avg_latency
                            ),
                        ));
                    }
                }
            }

            if found.is_empty() {
                let healthy = node.is_available()
                    && health_score(&node, summary.as_ref()) >= threshold;
                if healthy && self.faults.resolve_target(&key).await > 0 {
                    debug!(node_id = %node.id, "Node recovered");
                }
                continue;
            }

            for (fault_type, description) in found {
                detected.push(self.detect_fault(fault_type, &key, &description).await);
            }
        }
        detected
    }

    async fn run_prediction_cycle(&self) -> Vec<PredictedFailure> {
        let predictions = self.predictor.run(&self.performance).await;
        if !predictions.is_empty() {
            let mut pending = self.predicted.write().await;
            for prediction in &predictions {
                pending.insert(prediction.key.clone(), prediction.clone());
            }
        }
        predictions
    }

    async fn run_healing_cycle(&self) -> Vec<HealingReport> {
        let config = self.current();
        if !config.enabled || !config.self_healing.enabled {
            return Vec::new();
        }
        let threshold = config.self_healing.healing_threshold;

        let open = self.faults.open().await;
        let predicted = std::mem::take(&mut *self.predicted.write().await);
        let mut reports = Vec::new();

        for node in self.nodes.snapshot().await {
            let key = node_key(&node.id);
            let node_faults: Vec<&FaultDetection> =
                open.iter().filter(|f| f.target == key).collect();

            let Some(reason) = self
                .healing_reason(&config, &node, &key, &node_faults, predicted.get(&key), threshold)
                .await
            else {
                continue;
            };

            for fault in &node_faults {
                let _ = self.faults.set_status(&fault.id, FaultStatus::Recovering).await;
            }

            let report = match self.healer.heal(&node.id, &reason).await {
                Ok(strategy) => {
                    for fault in &node_faults {
                        self.faults
                            .annotate(&fault.id, "healed_by", strategy.as_str())
                            .await;
                        let _ = self.faults.set_status(&fault.id, FaultStatus::Resolved).await;
                    }
                    HealingReport {
                        node_id: node.id.to_string(),
                        reason,
                        strategy: Some(strategy),
                        error: None,
                    }
                }
                Err(e) => {
                    for fault in &node_faults {
                        let _ = self.faults.set_status(&fault.id, FaultStatus::Persistent).await;
                    }
                    HealingReport {
                        node_id: node.id.to_string(),
                        reason,
                        strategy: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    async fn healing_reason(
        &self,
        config: &FaultToleranceConfig,
        node: &NodeInfo,
        key: &str,
        faults: &[&FaultDetection],
        prediction: Option<&PredictedFailure>,
        threshold: f64,
    ) -> Option<String> {
        if let Some(fault) = faults.iter().find(|f| f.severity.forces_healing()) {
            return Some(format!("{} fault", fault.fault_type));
        }
        // Nodes already taken out of rotation stay out until a fault or heartbeat
        if node.status == NodeStatus::Unavailable {
            return None;
        }

        let summary = self.performance.summary(key).await;
        let score = health_score(node, summary.as_ref());
        if score < threshold {
            return Some(format!("health score {:.2} below {:.2}", score, threshold));
        }
        if let Some(p) = prediction {
            if config.self_healing.enable_predictive {
                return Some(format!("{} predicted failure ({:.2})", p.method, p.score));
            }
        }
        if config.self_healing.enable_proactive && node.is_available() && node.load >= PROACTIVE_LOAD {
            return Some(format!("proactive: load {:.2}", node.load));
        }
        None
    }

    async fn run_adaptation_cycle(&self) -> AdaptationOutcome {
        let current = self.current();
        if !current.enabled || !current.config_adaptation.enabled {
            return AdaptationOutcome::Unchanged;
        }
        let Some(summary) = self.performance.overall().await else {
            return AdaptationOutcome::Unchanged;
        };

        match self.adapter.adapt(&current, &summary) {
            (Some(candidate), outcome) => match self.apply_config(candidate).await {
                Ok(()) => outcome,
                Err(e) => AdaptationOutcome::Rejected {
                    reason: e.to_string(),
                },
            },
            (None, outcome) => outcome,
        }
    }

    async fn cleanup_expired_states(&self, retention: Duration) -> CleanupReport {
        let predictions = {
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(retention)
                    .unwrap_or_else(|_| chrono::Duration::days(36_500));
            let mut predicted = self.predicted.write().await;
            let before = predicted.len();
            predicted.retain(|_, p| p.predicted_at > cutoff);
            before - predicted.len()
        };

        let report = CleanupReport {
            faults: self.faults.cleanup_resolved(retention).await,
            healing_attempts: self.healer.cleanup_history(retention).await,
            breakers: self.breakers.cleanup(retention).await,
            samples: self.performance.prune().await,
            predictions,
        };
        if report.total() > 0 {
            debug!(?report, "Expired state cleaned up");
        }
        report
    }
}
