//! Status and conditions management for StarRocksCluster resources
//!
//! This module provides utilities for managing Kubernetes-style conditions
//! and updating the status subresource.

use chrono::Utc;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::client::KubeClient;
use crate::controller::error::Result;
use crate::crd::{ClusterPhase, Condition, StarRocksCluster, StarRocksClusterStatus};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Every component is running
    pub const READY: &str = "Ready";
    /// Components are converging towards the declared state
    pub const PROGRESSING: &str = "Progressing";
    /// Volume changes were refused or could not be carried out
    pub const STORAGE_EXPANSION: &str = "StorageExpansion";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    ///
    /// The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Drop a condition
    pub fn remove_condition(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    /// Set the Progressing condition
    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    /// Report refused or failed volume changes; an empty list clears an
    /// earlier report
    pub fn storage_expansion(self, errors: &[String]) -> Self {
        if errors.is_empty() {
            if self
                .conditions
                .iter()
                .any(|c| c.type_ == condition_types::STORAGE_EXPANSION)
            {
                return self.set_condition(
                    condition_types::STORAGE_EXPANSION,
                    condition_status::TRUE,
                    "VolumesReconciled",
                    "Volumes match the declared sizes",
                );
            }
            return self;
        }
        self.set_condition(
            condition_types::STORAGE_EXPANSION,
            condition_status::FALSE,
            "ExpansionRejected",
            &errors.join("; "),
        )
    }

    /// Ready and Progressing conditions matching a cluster phase
    pub fn phase(self, phase: ClusterPhase, reason: Option<&str>) -> Self {
        match phase {
            ClusterPhase::Running => self
                .ready(true, "AllComponentsRunning", "All components are running")
                .progressing(false, "Stable", "Cluster is stable"),
            ClusterPhase::Pending => {
                let message = reason.unwrap_or("Components are converging");
                self.ready(false, "ComponentsReconciling", message)
                    .progressing(true, "Reconciling", message)
            }
            ClusterPhase::Failed => {
                let message = reason.unwrap_or("A component failed");
                self.ready(false, "ComponentFailed", message)
                    .progressing(false, "Failed", message)
            }
            ClusterPhase::Deleting => self
                .ready(false, "Deleting", "Cluster is being deleted")
                .progressing(true, "Terminating", "Cluster resources are being cleaned up"),
        }
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Status manager for StarRocksCluster resources
pub struct StatusManager<'a, C: KubeClient> {
    cluster: &'a StarRocksCluster,
    client: &'a C,
}

impl<'a, C: KubeClient> StatusManager<'a, C> {
    /// Create a new status manager
    pub fn new(cluster: &'a StarRocksCluster, client: &'a C) -> Self {
        Self { cluster, client }
    }

    /// Status as last written, or an empty one
    pub fn current(&self) -> StarRocksClusterStatus {
        self.cluster.status.clone().unwrap_or_default()
    }

    fn conditions(&self, status: &StarRocksClusterStatus) -> ConditionBuilder {
        ConditionBuilder::from_existing(status.conditions.clone(), self.cluster.metadata.generation)
    }

    /// Write `status` unless it equals the stored one. Returns whether a
    /// write happened.
    pub async fn update(&self, status: StarRocksClusterStatus) -> Result<bool> {
        if self.cluster.status.as_ref() == Some(&status) {
            debug!(cluster = %self.cluster.name_any(), "Status unchanged");
            return Ok(false);
        }
        let namespace = self.cluster.namespace().unwrap_or_default();
        self.client
            .patch_cluster_status(&namespace, &self.cluster.name_any(), &status)
            .await?;
        Ok(true)
    }

    /// Record the aggregated phase together with its conditions
    pub async fn set_phase(
        &self,
        mut status: StarRocksClusterStatus,
        phase: ClusterPhase,
        reason: Option<String>,
        storage_errors: &[String],
    ) -> Result<bool> {
        status.conditions = self
            .conditions(&status)
            .phase(phase, reason.as_deref())
            .storage_expansion(storage_errors)
            .build();
        status.phase = phase;
        status.reason = reason;
        status.observed_generation = self.cluster.metadata.generation;
        self.update(status).await
    }

    /// Update status for a failed pass, keeping component statuses
    pub async fn set_failed(&self, message: &str) -> Result<bool> {
        let mut status = self.current();
        status.conditions = self
            .conditions(&status)
            .phase(ClusterPhase::Failed, Some(message))
            .build();
        status.phase = ClusterPhase::Failed;
        status.reason = Some(message.to_string());
        status.observed_generation = self.cluster.metadata.generation;
        self.update(status).await
    }

    /// Update status for a deleting cluster
    pub async fn set_deleting(&self) -> Result<bool> {
        let mut status = self.current();
        status.conditions = self
            .conditions(&status)
            .phase(ClusterPhase::Deleting, None)
            .build();
        status.phase = ClusterPhase::Deleting;
        status.reason = Some("cluster is being deleted".to_string());
        self.update(status).await
    }
}

/// Check if the cluster spec has changed by comparing observed generation
pub fn spec_changed(cluster: &StarRocksCluster) -> bool {
    let current_generation = cluster.metadata.generation;
    let observed_generation = cluster.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    }
}
