//! Configuration validation and hot reload through the public API

use mesh_coordinator::{
    CoordinatorConfig, CoordinatorError, FaultToleranceConfig, FaultToleranceManager,
    ModelRegistry, NodeRegistry, ValidationErrors,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn violations(err: CoordinatorError) -> ValidationErrors {
    match err {
        CoordinatorError::Validation(errs) => errs,
        other => panic!("expected a validation error, got {:?}", other),
    }
}

fn manager(config: FaultToleranceConfig) -> FaultToleranceManager {
    FaultToleranceManager::new(
        config,
        Arc::new(NodeRegistry::new()),
        Arc::new(ModelRegistry::in_memory()),
    )
    .unwrap()
}

#[test]
fn prediction_slower_than_healing_is_rejected() {
    let doc = r#"
predictive_detection:
  prediction_interval: 2m
self_healing:
  healing_interval: 1m
"#;
    let errs = violations(FaultToleranceConfig::from_yaml_str(doc).unwrap_err());
    assert_eq!(errs.fields(), vec!["predictive_detection.prediction_interval"]);
    assert!(errs
        .to_string()
        .contains("must not exceed self_healing.healing_interval (1m)"));
}

#[test]
fn cross_field_rules_apply_to_disabled_sections() {
    let doc = r#"
[predictive_detection]
enabled = false
prediction_interval = "2m"

[self_healing]
enabled = false
enable_predictive = false
"#;
    let errs = violations(FaultToleranceConfig::from_toml_str(doc).unwrap_err());
    assert!(errs.has_field("predictive_detection.prediction_interval"));
}

#[test]
fn every_violation_is_reported() {
    let mut config = FaultToleranceConfig::default();
    config.replication_factor = 0;
    config.retry.backoff_multiplier = 0.5;
    config.self_healing.healing_threshold = 1.5;
    config.redundancy.default_factor = 9;
    config.redundancy.max_factor = 4;

    let errs = config.violations();
    for field in [
        "replication_factor",
        "retry.backoff_multiplier",
        "self_healing.healing_threshold",
        "redundancy.default_factor",
    ] {
        assert!(errs.has_field(field), "missing {} in {}", field, errs);
    }
}

#[test]
fn coordinator_document_prefixes_fault_tolerance_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("coordinator.toml");
    std::fs::write(
        &path,
        r#"
[engine]
min_nodes_required = 3

[fault_tolerance.self_healing]
healing_interval = "20s"
"#,
    )
    .unwrap();

    let errs = violations(CoordinatorConfig::load(&path).unwrap_err());
    assert!(errs.has_field("fault_tolerance.self_healing.healing_interval"));
    assert!(errs.has_field("fault_tolerance.predictive_detection.prediction_interval"));
}

#[test]
fn saved_defaults_load_back() {
    let dir = TempDir::new().unwrap();
    for name in ["coordinator.toml", "coordinator.yaml"] {
        let path = dir.path().join(name);
        CoordinatorConfig::default().save(&path).unwrap();
        assert_eq!(CoordinatorConfig::load(&path).unwrap(), CoordinatorConfig::default());
    }
}

#[tokio::test]
async fn reload_from_file_applies_or_rejects_whole() {
    let dir = TempDir::new().unwrap();
    let manager = manager(FaultToleranceConfig::default());
    let mut rx = manager.subscribe_config();

    let good = dir.path().join("ft.yaml");
    std::fs::write(
        &good,
        r#"
circuit_breaker:
  failure_threshold: 8
self_healing:
  healing_interval: 90s
config_adaptation:
  interval: 15m
performance_tracking:
  window_size: 5m
"#,
    )
    .unwrap();
    manager.reload_from_file(&good).await.unwrap();
    assert!(rx.has_changed().unwrap());
    let applied = rx.borrow_and_update().clone();
    assert_eq!(applied.self_healing.healing_interval, Duration::from_secs(90));
    assert_eq!(manager.breakers().config().await.failure_threshold, 8);

    let bad = dir.path().join("ft.toml");
    std::fs::write(
        &bad,
        r#"
[circuit_breaker]
failure_threshold = 2

[predictive_detection]
prediction_interval = "5m"
"#,
    )
    .unwrap();
    let err = manager.reload_from_file(&bad).await.unwrap_err();
    assert!(violations(err).has_field("predictive_detection.prediction_interval"));
    assert!(!rx.has_changed().unwrap());
    assert_eq!(manager.config(), applied);
    assert_eq!(manager.breakers().config().await.failure_threshold, 8);

    let unknown = dir.path().join("ft.ini");
    std::fs::write(&unknown, "").unwrap();
    assert!(matches!(
        manager.reload_from_file(&unknown).await,
        Err(CoordinatorError::Config(_))
    ));
    assert_eq!(manager.get_metrics().await.config_reloads, 1);
}

#[test]
fn invalid_initial_config_is_refused() {
    let mut config = FaultToleranceConfig::default();
    config.self_healing.monitoring_interval = Duration::from_secs(30);
    let result = FaultToleranceManager::new(
        config,
        Arc::new(NodeRegistry::new()),
        Arc::new(ModelRegistry::in_memory()),
    );
    assert!(matches!(result, Err(CoordinatorError::Validation(_))));
}
