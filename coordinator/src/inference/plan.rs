//! Partitions and partition plans
//!
//! A plan is an ordered list of partitions whose dependency edges must form
//! a DAG. Plan order is also the order results are aggregated in.

use crate::errors::{CoordinatorError, Result};
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{LayerRange, PartialResult, TokenRange};

/// Axis a partition splits the work along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionType {
    Layer,
    Data,
    Task,
    Sequence,
    Attention,
    Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl PartitionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionStatus::Completed | PartitionStatus::Failed)
    }
}

/// One unit of work assigned to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub node_id: NodeId,
    pub partition_type: PartitionType,
    pub layer_range: Option<LayerRange>,
    pub token_range: Option<TokenRange>,

    /// Partitions that must complete before this one starts
    pub dependencies: Vec<String>,

    pub status: PartitionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<PartialResult>,
}

impl Partition {
    pub fn new(id: impl Into<String>, node_id: NodeId, partition_type: PartitionType) -> Self {
        Self {
            id: id.into(),
            node_id,
            partition_type,
            layer_range: None,
            token_range: None,
            dependencies: Vec::new(),
            status: PartitionStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn with_layers(mut self, range: LayerRange) -> Self {
        self.layer_range = Some(range);
        self
    }

    pub fn with_tokens(mut self, range: TokenRange) -> Self {
        self.token_range = Some(range);
        self
    }

    pub fn depends_on(mut self, partition_id: impl Into<String>) -> Self {
        self.dependencies.push(partition_id.into());
        self
    }

    /// Move to `next`, enforcing `Pending → Executing → {Completed | Failed}`
    ///
    /// A pending partition may also fail directly when it can never run.
    pub fn transition(&mut self, next: PartitionStatus) -> Result<()> {
        use PartitionStatus::*;

        let allowed = matches!(
            (self.status, next),
            (Pending, Executing) | (Pending, Failed) | (Executing, Completed) | (Executing, Failed)
        );
        if !allowed {
            return Err(CoordinatorError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }

        match next {
            Executing => self.started_at = Some(Utc::now()),
            Completed | Failed => self.completed_at = Some(Utc::now()),
            Pending => {}
        }
        self.status = next;
        Ok(())
    }
}

/// Ordered, dependency-annotated set of partitions for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    /// Strategy that produced the plan
    pub strategy: String,
    pub partitions: Vec<Partition>,
}

impl PartitionPlan {
    pub fn new(strategy: impl Into<String>, partitions: Vec<Partition>) -> Self {
        Self {
            strategy: strategy.into(),
            partitions,
        }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, partition_id: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id == partition_id)
    }

    /// Total number of dependency edges
    pub fn edge_count(&self) -> usize {
        self.partitions.iter().map(|p| p.dependencies.len()).sum()
    }

    /// Distinct nodes in plan order
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.partitions
            .iter()
            .filter(|p| seen.insert(p.node_id))
            .map(|p| p.node_id)
            .collect()
    }

    /// Indices of the partitions that list `index` as a dependency
    pub fn dependents_of(&self, index: usize) -> Vec<usize> {
        let id = &self.partitions[index].id;
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.dependencies.iter().any(|d| d == id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Kahn topological order of partition indices
    ///
    /// Fails on duplicate ids, dangling dependencies and cycles.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.partitions.len());
        for (i, p) in self.partitions.iter().enumerate() {
            if index.insert(p.id.as_str(), i).is_some() {
                return Err(CoordinatorError::InvalidPlan(format!(
                    "duplicate partition id {}",
                    p.id
                )));
            }
        }

        let mut in_degree = vec![0usize; self.partitions.len()];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.partitions.len()];
        for (i, p) in self.partitions.iter().enumerate() {
            for dep in &p.dependencies {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    CoordinatorError::InvalidPlan(format!(
                        "partition {} depends on unknown partition {}",
                        p.id, dep
                    ))
                })?;
                edges[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..self.partitions.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.partitions.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &edges[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.partitions.len() {
            return Err(CoordinatorError::InvalidPlan(
                "dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// Check the plan is a DAG over nodes drawn from `selected`
    pub fn validate(&self, selected: &[NodeId]) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(CoordinatorError::InvalidPlan("plan has no partitions".to_string()));
        }
        for p in &self.partitions {
            if !selected.contains(&p.node_id) {
                return Err(CoordinatorError::InvalidPlan(format!(
                    "partition {} assigned to node {} outside the selected set",
                    p.id, p.node_id
                )));
            }
        }
        self.topological_order().map(|_| ())
    }
}
