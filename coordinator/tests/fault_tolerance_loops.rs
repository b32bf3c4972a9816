//! Fault-tolerance cycles and background loops driven through the manager

use chrono::Utc;
use mesh_coordinator::fault_tolerance::{
    node_key, AdaptationOutcome, BackgroundLoop, FaultStatus, HealingStrategyKind, StrategyStats,
};
use mesh_coordinator::{
    FaultToleranceConfig, FaultToleranceManager, FaultType, ModelInfo, ModelRegistry, NodeId,
    NodeInfo, NodeRegistry, NodeStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn rate(stats: &[StrategyStats], kind: HealingStrategyKind) -> f64 {
    stats
        .iter()
        .find(|s| s.strategy == kind)
        .map(|s| s.success_rate)
        .unwrap()
}

struct Fixture {
    manager: FaultToleranceManager,
    nodes: Arc<NodeRegistry>,
    models: Arc<ModelRegistry>,
    ids: Vec<NodeId>,
}

async fn fixture(config: FaultToleranceConfig, count: usize) -> Fixture {
    let nodes = Arc::new(NodeRegistry::new());
    let ids: Vec<NodeId> = (0..count).map(|_| NodeId::random()).collect();
    for id in &ids {
        nodes.upsert(NodeInfo::new(*id)).await;
    }
    let models = Arc::new(ModelRegistry::in_memory());
    models
        .register(ModelInfo::new("llama", "/models/llama").with_replicas(ids.clone()))
        .await
        .unwrap();
    let manager = FaultToleranceManager::new(config, nodes.clone(), models.clone()).unwrap();
    Fixture {
        manager,
        nodes,
        models,
        ids,
    }
}

#[tokio::test]
async fn health_sweep_is_idempotent() {
    let f = fixture(FaultToleranceConfig::default(), 2).await;
    f.nodes
        .upsert(
            NodeInfo::new(f.ids[0]).with_last_seen(Utc::now() - chrono::Duration::minutes(10)),
        )
        .await;

    assert_eq!(f.manager.run_health_sweep().await, 1);
    let faults = f.manager.get_fault_detections().await;
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].fault_type, FaultType::NodeFailure);
    assert_eq!(faults[0].target, node_key(&f.ids[0]));
    assert_eq!(
        f.nodes.get(&f.ids[0]).await.unwrap().status,
        NodeStatus::Unavailable
    );

    // Nothing new went stale
    assert_eq!(f.manager.run_health_sweep().await, 0);
    assert_eq!(f.manager.get_fault_detections().await.len(), 1);
    assert_eq!(f.manager.get_metrics().await.faults_detected, 1);

    let cleaned = f.manager.cleanup_expired_states(Duration::from_secs(3600)).await;
    assert_eq!(cleaned.total(), 0);
}

#[tokio::test]
async fn learning_applies_healing_outcomes() {
    // A lone node cannot fail over, so healing falls through to a restart
    let f = fixture(FaultToleranceConfig::default(), 1).await;
    let fault = f
        .manager
        .detect_fault(FaultType::NodeFailure, &node_key(&f.ids[0]), "process exited")
        .await;

    let reports = f.manager.run_healing_cycle().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].strategy, Some(HealingStrategyKind::ServiceRestart));

    let healed = f
        .manager
        .get_fault_detections()
        .await
        .into_iter()
        .find(|d| d.id == fault.id)
        .unwrap();
    assert_eq!(healed.status, FaultStatus::Resolved);
    assert_eq!(healed.metadata["healed_by"], "service_restart");

    // Outcomes only move success rates on the learning tick
    let before = f.manager.healer().strategy_stats().await;
    assert_eq!(rate(&before, HealingStrategyKind::Failover), 0.9);

    assert_eq!(f.manager.run_learning_cycle().await, 2);
    let after = f.manager.healer().strategy_stats().await;
    assert!((rate(&after, HealingStrategyKind::Failover) - 0.81).abs() < 1e-9);
    assert!((rate(&after, HealingStrategyKind::ServiceRestart) - 0.82).abs() < 1e-9);
    assert_eq!(f.manager.run_learning_cycle().await, 0);

    let metrics = f.manager.get_metrics().await;
    assert_eq!(metrics.healing_attempts, 2);
    assert_eq!(metrics.successful_healings, 1);
}

#[tokio::test]
async fn predicted_failure_triggers_healing() {
    let f = fixture(FaultToleranceConfig::default(), 2).await;
    let mut predictions = f.manager.subscribe_predictions();
    let key = node_key(&f.ids[0]);
    for _ in 0..19 {
        f.manager
            .performance()
            .record(&key, Duration::from_millis(10), true)
            .await;
    }
    f.manager
        .performance()
        .record(&key, Duration::from_millis(500), true)
        .await;

    let predicted = f.manager.run_prediction_cycle().await;
    assert_eq!(predicted.len(), 1);
    assert_eq!(predicted[0].method, "statistical");
    assert_eq!(predictions.recv().await.unwrap().key, key);

    let reports = f.manager.run_healing_cycle().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].reason.contains("predicted"));
    assert_eq!(reports[0].strategy, Some(HealingStrategyKind::Failover));
    assert_eq!(f.models.pending_replication("llama").await, 1);

    // Predictions are consumed by the cycle that acts on them
    assert!(f.manager.run_healing_cycle().await.is_empty());
}

#[tokio::test]
async fn redundancy_cycle_requests_missing_replicas() {
    let f = fixture(FaultToleranceConfig::default(), 2).await;
    f.nodes
        .set_status(&f.ids[1], NodeStatus::Unavailable)
        .await
        .unwrap();

    let actions = f.manager.run_redundancy_cycle().await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].live_replicas, 1);
    assert_eq!(actions[0].requested, 1);
    assert_eq!(f.models.pending_replication("llama").await, 1);
    assert_eq!(f.manager.get_metrics().await.replication_requests, 1);
}

#[tokio::test]
async fn adaptation_tightens_config_under_errors() {
    let f = fixture(FaultToleranceConfig::default(), 1).await;
    let key = node_key(&f.ids[0]);
    for i in 0..20 {
        f.manager
            .performance()
            .record(&key, Duration::from_millis(20), i % 2 == 0)
            .await;
    }

    match f.manager.run_adaptation_cycle().await {
        AdaptationOutcome::Applied { changes } => {
            assert!(changes.contains(&"circuit_breaker.failure_threshold".to_string()));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let config = f.manager.config();
    assert_eq!(config.self_healing.healing_interval, Duration::from_secs(40));
    assert_eq!(f.manager.breakers().config().await.failure_threshold, 4);

    let metrics = f.manager.get_metrics().await;
    assert_eq!(metrics.adaptations_applied, 1);
    assert_eq!(metrics.config_reloads, 1);
}

#[tokio::test(start_paused = true)]
async fn loops_tick_on_their_intervals_and_stop_cleanly() {
    let mut config = FaultToleranceConfig::default();
    config.predictive_detection.enabled = false;
    config.self_healing.enable_predictive = false;
    config.redundancy.enabled = false;
    config.config_adaptation.enabled = false;
    let f = fixture(config, 2).await;

    let key = node_key(&f.ids[0]);
    for _ in 0..6 {
        f.manager
            .performance()
            .record(&key, Duration::from_millis(10), false)
            .await;
    }

    f.manager.start().await.unwrap();
    assert_eq!(
        f.manager.running_loops().await,
        vec!["healing", "health_sweep", "learning", "monitoring"]
    );
    assert!(!f.manager.start_loop(BackgroundLoop::Monitoring).await);

    // First monitoring tick at 10s
    tokio::time::sleep(Duration::from_secs(11)).await;
    let faults = f.manager.get_fault_detections().await;
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].fault_type, FaultType::ServiceUnavailable);

    // First healing tick at 60s
    tokio::time::sleep(Duration::from_secs(55)).await;
    let metrics = f.manager.get_metrics().await;
    assert!(metrics.successful_healings >= 1);
    assert_eq!(
        f.nodes.get(&f.ids[0]).await.unwrap().status,
        NodeStatus::Unavailable
    );

    f.manager.stop().await;
    assert!(f.manager.running_loops().await.is_empty());

    let other = node_key(&f.ids[1]);
    for _ in 0..6 {
        f.manager
            .performance()
            .record(&other, Duration::from_millis(10), false)
            .await;
    }
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(f.manager.get_metrics().await.faults_detected, 1);
}
