//! Inference sessions
//!
//! One session owns one request end to end. The engine mutates it through a
//! [`SessionHandle`]; external callers only ever see [`SessionSnapshot`]s and
//! can request cancellation.
//!
//! ```text
//! Pending ─▶ Partitioning ─▶ Executing ─▶ Aggregating ─▶ Completed
//!    │            │              │             │
//!    └────────────┴──────────────┴─────────────┴──────▶ Failed
//! ```

use crate::errors::{CoordinatorError, Result};
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use super::plan::{PartitionPlan, PartitionStatus};
use super::types::{InferenceParams, InferenceResult, PartialResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Partitioning,
    Executing,
    Aggregating,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Whether `self -> next` is a legal step
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Partitioning)
            | (Partitioning, Executing)
            | (Executing, Aggregating)
            | (Aggregating, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Full state of one inference request
#[derive(Debug, Clone)]
pub struct InferenceSession {
    pub id: String,
    pub model: String,
    pub prompt: String,
    pub parameters: InferenceParams,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeId>,
    pub plan: Option<PartitionPlan>,
    /// Partial results by partition id
    pub partial_results: BTreeMap<String, PartialResult>,
    pub result: Option<InferenceResult>,
    pub error: Option<String>,
}

impl InferenceSession {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        parameters: InferenceParams,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            prompt: prompt.into(),
            parameters,
            status: SessionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            nodes: Vec::new(),
            plan: None,
            partial_results: BTreeMap::new(),
            result: None,
            error: None,
        }
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoordinatorError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        debug!(session_id = %self.id, from = ?self.status, to = ?next, "Session transition");
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Partial results grouped by the node that produced them
    pub fn results_by_node(&self) -> BTreeMap<String, Vec<&PartialResult>> {
        let mut grouped: BTreeMap<String, Vec<&PartialResult>> = BTreeMap::new();
        for result in self.partial_results.values() {
            grouped
                .entry(result.node_id.to_string())
                .or_default()
                .push(result);
        }
        grouped
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (partitions, completed) = match &self.plan {
            Some(plan) => (
                plan.len(),
                plan.partitions
                    .iter()
                    .filter(|p| p.status == PartitionStatus::Completed)
                    .count(),
            ),
            None => (0, 0),
        };
        let end = self.ended_at.unwrap_or_else(Utc::now);

        SessionSnapshot {
            id: self.id.clone(),
            model: self.model.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            elapsed_ms: (end - self.started_at).num_milliseconds().max(0) as u64,
            nodes: self.nodes.clone(),
            partitions,
            completed_partitions: completed,
            error: self.error.clone(),
        }
    }
}

/// Read-only view of a session for external callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub model: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub nodes: Vec<NodeId>,
    pub partitions: usize,
    pub completed_partitions: usize,
    pub error: Option<String>,
}

/// Shared handle to a live session
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    session: RwLock<InferenceSession>,
    cancel: watch::Sender<bool>,
    status: watch::Sender<SessionStatus>,
}

impl SessionHandle {
    pub fn new(session: InferenceSession) -> Self {
        let (cancel, _) = watch::channel(false);
        let (status, _) = watch::channel(session.status);
        Self {
            id: session.id.clone(),
            session: RwLock::new(session),
            cancel,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn transition(&self, next: SessionStatus) -> Result<()> {
        let mut session = self.session.write().await;
        session.transition(next)?;
        self.status.send_replace(next);
        Ok(())
    }

    /// Move to `Failed` unless already terminal
    pub async fn fail(&self, error: &CoordinatorError) {
        let mut session = self.session.write().await;
        if session.status.is_terminal() {
            return;
        }
        session.error = Some(error.to_string());
        if session.transition(SessionStatus::Failed).is_ok() {
            self.status.send_replace(SessionStatus::Failed);
        }
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut InferenceSession),
    {
        let mut session = self.session.write().await;
        f(&mut session);
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.read().await.status
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.read().await.snapshot()
    }

    pub async fn session(&self) -> InferenceSession {
        self.session.read().await.clone()
    }

    /// Ask the session to stop; in-flight partition waits are abandoned
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Status updates, ending in `Completed` or `Failed`
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Wait until the session reaches a terminal state
    pub async fn wait(&self) -> SessionStatus {
        let mut rx = self.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status().await;
            }
        }
    }
}
