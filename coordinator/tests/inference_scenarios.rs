//! End-to-end inference scenarios
//!
//! Each test builds an in-process cluster: a node registry, a model registry
//! and a scripted mock transport, driven through the public engine API.

use mesh_coordinator::errors::Stage;
use mesh_coordinator::fault_tolerance::{node_key, CircuitState};
use mesh_coordinator::{
    CoordinatorError, DistributedEngine, EngineConfig, FaultToleranceConfig,
    FaultToleranceManager, InferenceParams, MockBehavior, MockPeerTransport, ModelInfo,
    ModelRegistry, NodeId, NodeInfo, NodeRegistry, PartitionPlanner, PipelineConfig,
    TaskDescriptor,
};
use std::sync::Arc;
use std::time::Duration;

const MODEL: &str = "llama-X";

struct Cluster {
    nodes: Arc<NodeRegistry>,
    models: Arc<ModelRegistry>,
    transport: Arc<MockPeerTransport>,
    ids: Vec<NodeId>,
}

/// One node per entry in `loads`; the first `hosted` nodes carry the model
async fn cluster(loads: &[f64], hosted: usize, layers: u32) -> Cluster {
    let nodes = Arc::new(NodeRegistry::new());
    let ids: Vec<NodeId> = loads.iter().map(|_| NodeId::random()).collect();
    for (id, load) in ids.iter().zip(loads) {
        nodes.upsert(NodeInfo::new(*id).with_load(*load)).await;
    }

    let models = Arc::new(ModelRegistry::in_memory());
    models
        .register(
            ModelInfo::new(MODEL, "/models/llama-X")
                .with_layers(layers)
                .with_replicas(ids[..hosted].to_vec()),
        )
        .await
        .unwrap();

    Cluster {
        nodes,
        models,
        transport: Arc::new(MockPeerTransport::new()),
        ids,
    }
}

impl Cluster {
    fn engine(&self, config: EngineConfig) -> DistributedEngine {
        DistributedEngine::new(
            config,
            self.nodes.clone(),
            self.models.clone(),
            self.transport.clone(),
        )
        .unwrap()
    }
}

#[tokio::test]
async fn layerwise_plan_uses_two_lowest_load_nodes() {
    let c = cluster(&[0.3, 0.1, 0.2], 3, 10).await;
    let engine = c.engine(EngineConfig::default().with_min_nodes(2));

    let result = engine
        .execute_distributed_inference(MODEL, "hello world", InferenceParams::new())
        .await
        .unwrap();
    assert_eq!(result.nodes_used, vec![c.ids[1], c.ids[2]]);

    let calls = c.transport.calls().await;
    let dispatched: Vec<(NodeId, String)> = calls
        .iter()
        .map(|(node, req)| (*node, req.partition_id.clone()))
        .collect();
    assert_eq!(
        dispatched,
        vec![
            (c.ids[1], "partition_0_layers_0_4".to_string()),
            (c.ids[2], "partition_1_layers_5_9".to_string()),
        ]
    );
    assert!(calls[0].1.request_id.ends_with("_partition_0_layers_0_4"));
    assert_eq!(calls[0].1.metadata["partition_id"], "partition_0_layers_0_4");

    let plan = PartitionPlanner::new(&EngineConfig::default().with_min_nodes(2))
        .plan(
            &TaskDescriptor::new(MODEL, "hello world", 10),
            &[c.ids[1], c.ids[2]],
            "layerwise",
        )
        .unwrap();
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.edge_count(), 1);
    assert_eq!(plan.partitions[1].dependencies, vec!["partition_0_layers_0_4"]);
}

#[tokio::test]
async fn too_few_hosting_nodes_fails_before_dispatch() {
    let c = cluster(&[0.1, 0.2, 0.3], 1, 10).await;
    let engine = c.engine(EngineConfig::default().with_min_nodes(2));

    let err = engine
        .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::SelectNodes));
    assert!(matches!(
        err.root_cause(),
        CoordinatorError::InsufficientAvailableNodes {
            required: 2,
            available: 1
        }
    ));
    assert_eq!(
        err.root_cause().to_string(),
        "insufficient available nodes: need 2, have 1"
    );
    assert_eq!(c.transport.total_calls().await, 0);
    assert_eq!(engine.get_metrics().failed_inferences, 1);
}

#[tokio::test]
async fn timed_out_partition_keeps_sibling_result() {
    let c = cluster(&[0.1, 0.2], 2, 10).await;
    c.transport.set_behavior(c.ids[1], MockBehavior::Hang).await;

    let config = EngineConfig::default()
        .with_min_nodes(2)
        .with_timeout(Duration::from_millis(200))
        .with_partition_strategy("pipeline_parallel")
        .with_pipeline(PipelineConfig {
            chunk_size: 2,
            overlap: 0,
            layer_stages: 1,
        });
    let engine = Arc::new(c.engine(config));

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute_distributed_inference(MODEL, "a b c d", InferenceParams::new())
                .await
        })
    };

    let handle = loop {
        let active = engine.get_active_inferences().await;
        if let Some(id) = active.keys().next() {
            if let Some(handle) = engine.session(id) {
                break handle;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };

    let err = runner.await.unwrap().unwrap_err();
    assert_eq!(err.stage(), Some(Stage::ExecutePartitions));
    match err.root_cause() {
        CoordinatorError::PartitionExecution {
            partition_id,
            node_id,
            source,
        } => {
            assert_eq!(partition_id, "partition_1_chunk_1_stage_0");
            assert_eq!(node_id, &c.ids[1].to_string());
            assert!(matches!(**source, CoordinatorError::Timeout(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let session = handle.session().await;
    assert!(session
        .partial_results
        .contains_key("partition_0_chunk_0_stage_0"));
    assert_eq!(session.partial_results.len(), 1);

    // Nothing left running once the call has returned
    assert_eq!(c.transport.in_flight(), 0);
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test]
async fn open_circuit_keeps_node_out_of_plans_until_recovery() {
    let c = cluster(&[0.0, 0.5, 0.6], 3, 8).await;
    c.transport
        .set_behavior(
            c.ids[0],
            MockBehavior::Fail {
                message: "connection refused".to_string(),
            },
        )
        .await;

    let mut ft = FaultToleranceConfig::default();
    ft.circuit_breaker.failure_threshold = 3;
    ft.circuit_breaker.recovery_timeout = Duration::from_secs(1);
    ft.retry.max_retries = 0;
    let manager = FaultToleranceManager::new(ft, c.nodes.clone(), c.models.clone()).unwrap();
    let guarded = manager.guard_transport(c.transport.clone()).await;
    let engine = DistributedEngine::new(
        EngineConfig::default().with_min_nodes(2),
        c.nodes.clone(),
        c.models.clone(),
        guarded,
    )
    .unwrap()
    .with_circuit_breakers(manager.breakers().clone());

    for _ in 0..3 {
        let err = engine
            .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::ExecutePartitions));
    }
    let key = node_key(&c.ids[0]);
    assert_eq!(manager.breakers().state(&key).await, CircuitState::Open);
    assert_eq!(c.transport.call_count(&c.ids[0]).await, 3);

    // Fourth plan routes around the open circuit
    let result = engine
        .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
        .await
        .unwrap();
    assert_eq!(result.nodes_used, vec![c.ids[1], c.ids[2]]);
    assert_eq!(c.transport.call_count(&c.ids[0]).await, 3);

    // After recovery the node is eligible again and gets a single probe
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let err = engine
        .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains(&c.ids[0].to_string()));
    assert_eq!(c.transport.call_count(&c.ids[0]).await, 4);
    assert_eq!(manager.breakers().state(&key).await, CircuitState::Open);
}

#[tokio::test]
async fn unchanged_registry_yields_identical_results() {
    let c = cluster(&[0.4, 0.2, 0.2, 0.9], 4, 12).await;
    let engine = c.engine(
        EngineConfig::default()
            .with_min_nodes(3)
            .with_aggregation_strategy("concat_text"),
    );

    let first = engine
        .execute_distributed_inference(MODEL, "same prompt", InferenceParams::new())
        .await
        .unwrap();
    let second = engine
        .execute_distributed_inference(MODEL, "same prompt", InferenceParams::new())
        .await
        .unwrap();

    assert_eq!(first.nodes_used, second.nodes_used);
    assert_eq!(first.text, second.text);
    assert_eq!(first.tokens, second.tokens);
    assert_eq!(first.tokens, (0..12).collect::<Vec<u32>>());
    assert_ne!(first.metadata["session_id"], second.metadata["session_id"]);
}

#[tokio::test]
async fn failed_sessions_leave_no_tasks_behind() {
    let c = cluster(&[0.1, 0.2, 0.3], 3, 9).await;
    for id in &c.ids[1..] {
        c.transport.set_behavior(*id, MockBehavior::Hang).await;
    }
    let engine = Arc::new(c.engine(
        EngineConfig::default()
            .with_min_nodes(3)
            .with_timeout(Duration::from_millis(50)),
    ));

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
                    .await
            })
        })
        .collect();
    for run in futures::future::join_all(runs).await {
        assert!(run.unwrap().is_err());
    }

    assert_eq!(c.transport.in_flight(), 0);
    assert_eq!(engine.active_count(), 0);
    assert!(engine.get_active_inferences().await.is_empty());
    assert_eq!(engine.get_metrics().failed_inferences, 4);
}

fn breaker_config(threshold: u32) -> FaultToleranceConfig {
    let mut ft = FaultToleranceConfig::default();
    ft.circuit_breaker.failure_threshold = threshold;
    ft.circuit_breaker.recovery_timeout = Duration::from_secs(1);
    ft.retry.max_retries = 0;
    ft
}

async fn guarded_engine(
    c: &Cluster,
    manager: &FaultToleranceManager,
    timeout: Duration,
) -> DistributedEngine {
    let guarded = manager.guard_transport(c.transport.clone()).await;
    DistributedEngine::new(
        EngineConfig::default().with_min_nodes(2).with_timeout(timeout),
        c.nodes.clone(),
        c.models.clone(),
        guarded,
    )
    .unwrap()
    .with_circuit_breakers(manager.breakers().clone())
}

#[tokio::test]
async fn timed_out_dispatches_open_the_circuit() {
    let c = cluster(&[0.0, 0.5, 0.6], 3, 8).await;
    c.transport.set_behavior(c.ids[0], MockBehavior::Hang).await;

    let manager =
        FaultToleranceManager::new(breaker_config(3), c.nodes.clone(), c.models.clone()).unwrap();
    let engine = guarded_engine(&c, &manager, Duration::from_millis(50)).await;

    for _ in 0..3 {
        let err = engine
            .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            CoordinatorError::PartitionExecution { .. }
        ));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let key = node_key(&c.ids[0]);
    assert_eq!(manager.breakers().state(&key).await, CircuitState::Open);
    assert_eq!(c.transport.call_count(&c.ids[0]).await, 3);

    let result = engine
        .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
        .await
        .unwrap();
    assert_eq!(result.nodes_used, vec![c.ids[1], c.ids[2]]);
    assert_eq!(c.transport.call_count(&c.ids[0]).await, 3);
}

#[tokio::test]
async fn half_open_call_cut_off_by_deadline_does_not_strand_node() {
    let c = cluster(&[0.0, 0.5, 0.6], 3, 8).await;
    c.transport
        .set_behavior(
            c.ids[0],
            MockBehavior::Fail {
                message: "connection refused".to_string(),
            },
        )
        .await;

    let manager =
        FaultToleranceManager::new(breaker_config(1), c.nodes.clone(), c.models.clone()).unwrap();
    let engine = guarded_engine(&c, &manager, Duration::from_millis(200)).await;
    let key = node_key(&c.ids[0]);

    assert!(engine
        .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
        .await
        .is_err());
    assert_eq!(manager.breakers().state(&key).await, CircuitState::Open);

    // The half-open trial call hangs past the session deadline
    c.transport.set_behavior(c.ids[0], MockBehavior::Hang).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(engine
        .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
        .await
        .is_err());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.breakers().state(&key).await, CircuitState::Open);

    // Once healthy the node is tried again after the next recovery window
    c.transport
        .set_behavior(
            c.ids[0],
            MockBehavior::Respond {
                latency: Duration::from_millis(1),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let result = engine
        .execute_distributed_inference(MODEL, "hi", InferenceParams::new())
        .await
        .unwrap();
    assert!(result.nodes_used.contains(&c.ids[0]));
    assert_eq!(manager.breakers().state(&key).await, CircuitState::Closed);
    assert_eq!(c.transport.call_count(&c.ids[0]).await, 3);
}
