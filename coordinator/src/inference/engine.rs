//! Distributed inference engine
//!
//! Owns the active-session registry and sequences each request through
//! model distribution, node selection, planning, execution and
//! aggregation. Every session is bounded by `inference_timeout`, measured
//! from submission, including time spent waiting for a concurrency slot.

use crate::config::EngineConfig;
use crate::errors::{CoordinatorError, Result, Stage};
use crate::fault_tolerance::circuit_breaker::CircuitBreakerRegistry;
use crate::fault_tolerance::performance::PerformanceTracker;
use crate::model::{ModelInfo, ModelManager};
use crate::network::PeerTransport;
use crate::node::NodeRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::aggregator::ResultAggregator;
use super::orchestration::{ExecutionContext, Orchestrator, RequestTemplate};
use super::planner::{PartitionPlanner, StrategyMetrics};
use super::selector::NodeSelector;
use super::session::{InferenceSession, SessionHandle, SessionSnapshot, SessionStatus};
use super::stats::{InferenceMetrics, InferenceStats};
use super::types::{InferenceParams, InferenceResult, TaskDescriptor};

/// Request parameter that overrides the model's layer count
pub const LAYER_COUNT_PARAM: &str = "layer_count";

/// Key under which session outcomes are sampled
pub const SESSION_PERFORMANCE_KEY: &str = "inference";

/// Sessions currently running, keyed by session id
///
/// Guarded by a std lock so a session can always be evicted from `Drop`.
#[derive(Debug, Default)]
struct ActiveSessions {
    sessions: StdRwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl ActiveSessions {
    /// Insert under a fresh `inf_<unix nanos>` id
    fn register(&self, model: &str, prompt: &str, parameters: InferenceParams) -> Arc<SessionHandle> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        while sessions.contains_key(&format!("inf_{}", nanos)) {
            nanos += 1;
        }
        let id = format!("inf_{}", nanos);

        let handle = Arc::new(SessionHandle::new(InferenceSession::new(
            id.clone(),
            model,
            prompt,
            parameters,
        )));
        sessions.insert(id, handle.clone());
        handle
    }

    fn remove(&self, id: &str) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.remove(id);
    }

    fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(id).cloned()
    }

    fn all(&self) -> Vec<Arc<SessionHandle>> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Evicts a session when its request future finishes or is dropped
struct Eviction<'a> {
    active: &'a ActiveSessions,
    id: String,
}

impl Drop for Eviction<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

/// Coordinates distributed inference across the cluster
pub struct DistributedEngine {
    config: EngineConfig,
    models: Arc<dyn ModelManager>,
    selector: NodeSelector,
    planner: PartitionPlanner,
    orchestrator: Orchestrator,
    aggregator: ResultAggregator,
    active: ActiveSessions,
    stats: Arc<InferenceStats>,
    permits: Semaphore,
    performance: Option<Arc<PerformanceTracker>>,
}

impl DistributedEngine {
    /// Create an engine over injected registries and transport
    pub fn new(
        config: EngineConfig,
        nodes: Arc<NodeRegistry>,
        models: Arc<dyn ModelManager>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let aggregator = ResultAggregator::new();
        if !aggregator.has_strategy(&config.aggregation_strategy) {
            return Err(CoordinatorError::InvalidStrategy(
                config.aggregation_strategy.clone(),
            ));
        }
        let planner = PartitionPlanner::new(&config);
        if !planner.strategy_names().contains(&config.partition_strategy) {
            return Err(CoordinatorError::InvalidStrategy(
                config.partition_strategy.clone(),
            ));
        }

        let selector = NodeSelector::new(nodes, models.clone())
            .with_load_balancing(config.load_balancing);

        info!(
            strategy = %config.partition_strategy,
            aggregation = %config.aggregation_strategy,
            min_nodes = config.min_nodes_required,
            max_concurrent = config.max_concurrent_inferences,
            "Distributed engine initialized"
        );

        Ok(Self {
            permits: Semaphore::new(config.max_concurrent_inferences),
            models,
            selector,
            planner,
            orchestrator: Orchestrator::new(transport),
            aggregator,
            active: ActiveSessions::default(),
            stats: Arc::new(InferenceStats::new()),
            performance: None,
            config,
        })
    }

    /// Skip nodes whose circuit is open during selection
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.selector = self.selector.with_circuit_breakers(breakers);
        self
    }

    /// Sample every session's latency and outcome into `tracker`
    pub fn with_performance_tracker(mut self, tracker: Arc<PerformanceTracker>) -> Self {
        self.performance = Some(tracker);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<InferenceStats> {
        &self.stats
    }

    pub fn planner(&self) -> &PartitionPlanner {
        &self.planner
    }

    /// Run one inference end to end
    #[instrument(skip(self, prompt, parameters), fields(session_id))]
    pub async fn execute_distributed_inference(
        &self,
        model: &str,
        prompt: &str,
        parameters: InferenceParams,
    ) -> Result<InferenceResult> {
        let started = Instant::now();
        let deadline = started + self.config.inference_timeout;

        let handle = self.active.register(model, prompt, parameters.clone());
        let _eviction = Eviction {
            active: &self.active,
            id: handle.id().to_string(),
        };
        tracing::Span::current().record("session_id", handle.id());
        info!(session_id = %handle.id(), model = %model, "Starting distributed inference");

        let outcome = self
            .run_session(&handle, model, prompt, parameters, deadline)
            .await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(result) => {
                self.stats
                    .record_success(elapsed, result.nodes_used.len(), result.token_count());
                info!(
                    session_id = %handle.id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    nodes = result.nodes_used.len(),
                    tokens = result.token_count(),
                    "Distributed inference completed"
                );
            }
            Err(e) => {
                handle.fail(e).await;
                self.stats.record_failure(elapsed);
                error!(session_id = %handle.id(), error = %e, "Distributed inference failed");
            }
        }

        if let Some(tracker) = &self.performance {
            tracker
                .record(SESSION_PERFORMANCE_KEY, elapsed, outcome.is_ok())
                .await;
        }
        outcome
    }

    async fn run_session(
        &self,
        handle: &SessionHandle,
        model: &str,
        prompt: &str,
        parameters: InferenceParams,
        deadline: Instant,
    ) -> Result<InferenceResult> {
        let mut cancel = handle.cancel_receiver();

        let _permit = tokio::select! {
            permit = tokio::time::timeout_at(deadline, self.permits.acquire()) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(CoordinatorError::Canceled),
                Err(_) => return Err(CoordinatorError::Timeout(self.config.inference_timeout)),
            },
            _ = cancel.wait_for(|canceled| *canceled) => return Err(CoordinatorError::Canceled),
        };

        // Pending: make sure the model is known to the cluster
        let model_info = match tokio::time::timeout_at(deadline, self.ensure_model_distribution(model)).await {
            Ok(info) => info.map_err(|e| e.at(Stage::DistributeModel))?,
            Err(_) => {
                return Err(CoordinatorError::Timeout(self.config.inference_timeout)
                    .at(Stage::DistributeModel))
            }
        };
        handle.transition(SessionStatus::Partitioning).await?;

        // Partitioning
        let nodes = self
            .selector
            .select(model, self.config.min_nodes_required)
            .await
            .map_err(|e| e.at(Stage::SelectNodes))?;

        let layer_count = parameters
            .get(LAYER_COUNT_PARAM)
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .or(model_info.layer_count)
            .unwrap_or(self.config.default_layer_count);
        let task = TaskDescriptor::new(model, prompt, layer_count).with_parameters(parameters.clone());

        let strategy = self.config.partition_strategy.clone();
        let mut plan = self
            .planner
            .plan(&task, &nodes, &strategy)
            .map_err(|e| e.at(Stage::CreatePlan))?;

        {
            let nodes = nodes.clone();
            let plan = plan.clone();
            handle
                .update(move |s| {
                    s.nodes = nodes;
                    s.plan = Some(plan);
                })
                .await;
        }
        handle.transition(SessionStatus::Executing).await?;

        // Executing
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ctx = ExecutionContext {
            inference_id: handle.id().to_string(),
            deadline,
            timeout: self.config.inference_timeout,
            cancel: handle.cancel_receiver(),
        };
        debug!(
            session_id = %handle.id(),
            partitions = plan.len(),
            remaining_ms = remaining.as_millis() as u64,
            "Executing partition plan"
        );
        let template = RequestTemplate {
            model: model.to_string(),
            prompt: prompt.to_string(),
            parameters,
        };
        let exec_started = Instant::now();
        let report = self
            .orchestrator
            .execute(&mut plan, &template, &ctx)
            .await
            .map_err(|e| e.at(Stage::ExecutePartitions))?;

        {
            let plan = plan.clone();
            let results = report.results.clone();
            handle
                .update(move |s| {
                    for result in results {
                        s.partial_results.insert(result.partition_id.clone(), result);
                    }
                    s.plan = Some(plan);
                })
                .await;
        }

        let execution_ok = report.is_success();
        self.planner
            .record_outcome(&strategy, execution_ok, exec_started.elapsed())
            .await;

        if !execution_ok && ctx.is_canceled() {
            return Err(CoordinatorError::Canceled.at(Stage::ExecutePartitions));
        }
        let results = report
            .into_result()
            .map_err(|e| e.at(Stage::ExecutePartitions))?;
        handle.transition(SessionStatus::Aggregating).await?;

        // Aggregating
        let mut result = self
            .aggregator
            .aggregate(&self.config.aggregation_strategy, results)
            .map_err(|e| e.at(Stage::Aggregate))?;
        result.processing_time = handle_elapsed(deadline, self.config.inference_timeout);
        result
            .metadata
            .insert("session_id".to_string(), serde_json::json!(handle.id()));
        result
            .metadata
            .insert("partition_strategy".to_string(), serde_json::json!(strategy));

        {
            let result = result.clone();
            handle.update(move |s| s.result = Some(result)).await;
        }
        handle.transition(SessionStatus::Completed).await?;
        Ok(result)
    }

    /// Look the model up, registering it if unknown
    ///
    /// Too few replicas is not fatal: a replication request is sent in the
    /// background and the session continues with what exists.
    async fn ensure_model_distribution(&self, model: &str) -> Result<ModelInfo> {
        let info = match self.models.get_model(model).await {
            Ok(info) => info,
            Err(CoordinatorError::NotFound(_)) => {
                let source = format!(
                    "{}/{}",
                    self.config.model_source_dir.trim_end_matches('/'),
                    model
                );
                info!(model = %model, source = %source, "Model unknown, adding for distribution");
                self.models
                    .add_model(model, &source)
                    .await
                    .map_err(|e| CoordinatorError::ModelDistribution(e.to_string()))?
            }
            Err(e) => return Err(CoordinatorError::ModelDistribution(e.to_string())),
        };

        let required = self.config.min_nodes_required;
        if info.replicas.len() < required {
            let missing = required - info.replicas.len();
            warn!(
                model = %model,
                replicas = info.replicas.len(),
                required = required,
                "Insufficient replicas, requesting replication"
            );
            let models = self.models.clone();
            let name = model.to_string();
            tokio::spawn(async move {
                if let Err(e) = models.request_replication(&name, missing).await {
                    warn!(model = %name, error = %e, "Replication request failed");
                }
            });
        }
        Ok(info)
    }

    /// Snapshots of every running session
    pub async fn get_active_inferences(&self) -> HashMap<String, SessionSnapshot> {
        let mut snapshots = HashMap::new();
        for handle in self.active.all() {
            snapshots.insert(handle.id().to_string(), handle.snapshot().await);
        }
        snapshots
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Live handle to a running session
    pub fn session(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.active.get(session_id)
    }

    /// Cancel a running session; false if it is not active
    pub fn cancel_inference(&self, session_id: &str) -> bool {
        match self.active.get(session_id) {
            Some(handle) => {
                info!(session_id = %session_id, "Canceling inference");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_metrics(&self) -> InferenceMetrics {
        self.stats.snapshot()
    }

    pub async fn strategy_metrics(&self) -> HashMap<String, StrategyMetrics> {
        self.planner.strategy_metrics().await
    }
}

fn handle_elapsed(deadline: Instant, timeout: Duration) -> Duration {
    let remaining = deadline.saturating_duration_since(Instant::now());
    timeout.saturating_sub(remaining)
}
