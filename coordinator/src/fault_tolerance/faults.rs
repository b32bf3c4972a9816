//! Fault records
//!
//! A fault is keyed by (type, target) while it is open: repeated detections
//! of the same problem bump `occurrences` on the open record instead of
//! creating new ones.

use crate::errors::{CoordinatorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    NodeFailure,
    NetworkPartition,
    ResourceExhaustion,
    PerformanceAnomaly,
    ServiceUnavailable,
}

impl FaultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultType::NodeFailure => "node_failure",
            FaultType::NetworkPartition => "network_partition",
            FaultType::ResourceExhaustion => "resource_exhaustion",
            FaultType::PerformanceAnomaly => "performance_anomaly",
            FaultType::ServiceUnavailable => "service_unavailable",
        }
    }

    pub fn severity(&self) -> FaultSeverity {
        match self {
            FaultType::NodeFailure => FaultSeverity::Critical,
            FaultType::NetworkPartition => FaultSeverity::High,
            FaultType::ResourceExhaustion
            | FaultType::PerformanceAnomaly
            | FaultType::ServiceUnavailable => FaultSeverity::Medium,
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FaultSeverity {
    /// High and critical faults are healed even when the node's score looks fine
    pub fn forces_healing(&self) -> bool {
        *self >= FaultSeverity::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultStatus {
    Detected,
    Recovering,
    Resolved,
    /// Every healing strategy was tried and failed
    Persistent,
}

impl FaultStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, FaultStatus::Detected | FaultStatus::Recovering)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultDetection {
    pub id: String,
    pub fault_type: FaultType,
    pub severity: FaultSeverity,
    pub target: String,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub status: FaultStatus,
    pub occurrences: u32,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

/// Shared log of detected faults
#[derive(Debug, Default)]
pub struct FaultLog {
    entries: RwLock<Vec<FaultDetection>>,
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a detection, folding it into an open fault of the same kind
    ///
    /// Returns the record and whether it is new.
    pub async fn record(
        &self,
        fault_type: FaultType,
        target: &str,
        description: &str,
    ) -> (FaultDetection, bool) {
        let mut entries = self.entries.write().await;

        if let Some(open) = entries
            .iter_mut()
            .find(|f| f.fault_type == fault_type && f.target == target && f.status.is_open())
        {
            open.occurrences += 1;
            open.description = description.to_string();
            debug!(fault_id = %open.id, occurrences = open.occurrences, "Fault seen again");
            return (open.clone(), false);
        }

        let fault = FaultDetection {
            id: format!("fault_{}", Uuid::new_v4().simple()),
            fault_type,
            severity: fault_type.severity(),
            target: target.to_string(),
            description: description.to_string(),
            detected_at: Utc::now(),
            status: FaultStatus::Detected,
            occurrences: 1,
            resolved_at: None,
            metadata: BTreeMap::new(),
        };
        error!(
            fault_id = %fault.id,
            fault_type = %fault_type,
            severity = ?fault.severity,
            fault_target = %target,
            description = %description,
            "Fault detected"
        );
        entries.push(fault.clone());
        (fault, true)
    }

    pub async fn set_status(&self, id: &str, status: FaultStatus) -> Result<()> {
        let mut entries = self.entries.write().await;
        let fault = entries
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("fault {}", id)))?;

        if fault.status != status {
            info!(fault_id = %id, from = ?fault.status, to = ?status, "Fault status changed");
            fault.status = status;
            fault.resolved_at = match status {
                FaultStatus::Resolved => Some(Utc::now()),
                _ => None,
            };
        }
        Ok(())
    }

    pub async fn annotate(&self, id: &str, key: &str, value: impl Into<String>) {
        let mut entries = self.entries.write().await;
        if let Some(fault) = entries.iter_mut().find(|f| f.id == id) {
            fault.metadata.insert(key.to_string(), value.into());
        }
    }

    /// Resolve every open fault on `target`
    pub async fn resolve_target(&self, target: &str) -> usize {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        let mut resolved = 0;
        for fault in entries.iter_mut().filter(|f| f.target == target && f.status.is_open()) {
            fault.status = FaultStatus::Resolved;
            fault.resolved_at = Some(now);
            resolved += 1;
        }
        if resolved > 0 {
            info!(fault_target = %target, resolved = resolved, "Faults resolved");
        }
        resolved
    }

    pub async fn get(&self, id: &str) -> Option<FaultDetection> {
        let entries = self.entries.read().await;
        entries.iter().find(|f| f.id == id).cloned()
    }

    /// Every fault, oldest first
    pub async fn all(&self) -> Vec<FaultDetection> {
        self.entries.read().await.clone()
    }

    pub async fn open(&self) -> Vec<FaultDetection> {
        let entries = self.entries.read().await;
        entries.iter().filter(|f| f.status.is_open()).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Forget resolved faults older than `retention`
    pub async fn cleanup_resolved(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|f| match (f.status, f.resolved_at) {
            (FaultStatus::Resolved, Some(at)) => at > cutoff,
            _ => true,
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_type() {
        assert_eq!(FaultType::NodeFailure.severity(), FaultSeverity::Critical);
        assert_eq!(FaultType::NetworkPartition.severity(), FaultSeverity::High);
        assert_eq!(FaultType::PerformanceAnomaly.severity(), FaultSeverity::Medium);
        assert!(FaultType::NetworkPartition.severity().forces_healing());
        assert!(!FaultType::ResourceExhaustion.severity().forces_healing());
    }

    #[tokio::test]
    async fn test_repeated_detection_folds_into_open_fault() {
        let log = FaultLog::new();
        let (first, new) = log.record(FaultType::NodeFailure, "node:a", "timeout").await;
        assert!(new);
        let (again, new) = log.record(FaultType::NodeFailure, "node:a", "timeout again").await;
        assert!(!new);
        assert_eq!(again.id, first.id);
        assert_eq!(again.occurrences, 2);

        log.set_status(&first.id, FaultStatus::Resolved).await.unwrap();
        let (third, new) = log.record(FaultType::NodeFailure, "node:a", "back").await;
        assert!(new);
        assert_ne!(third.id, first.id);
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn test_cleanup_only_drops_resolved() {
        let log = FaultLog::new();
        log.record(FaultType::NodeFailure, "node:a", "down").await;
        log.record(FaultType::ServiceUnavailable, "node:b", "503").await;
        assert_eq!(log.resolve_target("node:b").await, 1);

        assert_eq!(log.cleanup_resolved(Duration::ZERO).await, 1);
        assert_eq!(log.cleanup_resolved(Duration::ZERO).await, 0);
        assert_eq!(log.open().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_fault_status() {
        let log = FaultLog::new();
        assert!(log.set_status("fault_x", FaultStatus::Resolved).await.is_err());
    }
}
