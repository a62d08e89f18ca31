//! Resource model: phases, conditions, status, and the resource record.

use std::fmt;

use chrono::{DateTime, Utc};
use playop_core::{ParamSet, ResourceId};
use serde::{Deserialize, Serialize};

/// Normalized phase of a resource, as reported on its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Queued, not yet started.
    #[default]
    Pending,
    /// A workflow invocation is running.
    Progressing,
    /// The last invocation for the observed generation succeeded.
    Succeeded,
    /// The last invocation failed. A later event or retry may re-run it.
    Failed,
    /// Deletion requested; the finalization workflow is running.
    Terminating,
}

impl Phase {
    /// Whether the phase ends an invocation (until the next spec change).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether a workflow is in flight for this phase.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Progressing | Self::Terminating)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

/// A named, timestamped fact attached to a resource's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

impl Condition {
    /// Create a condition observed now.
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            last_transition_time: Utc::now(),
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Status subresource of a managed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub phase: Phase,
    pub message: String,
    pub reason: String,
    pub observed_generation: Option<u64>,
    pub conditions: Vec<Condition>,
}

impl ResourceStatus {
    /// Look up a condition by type.
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Insert or update a condition, keyed by type.
    ///
    /// Other condition types are left untouched and keep their position.
    /// `lastTransitionTime` only moves when the status value changes.
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                let last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time
                } else {
                    condition.last_transition_time
                };
                *existing = Condition {
                    last_transition_time,
                    ..condition
                };
            }
            None => self.conditions.push(condition),
        }
    }
}

/// A declared desired-state object tracked by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub id: ResourceId,
    pub spec: ParamSet,
    /// Bumped by every spec change.
    pub generation: u64,
    pub status: ResourceStatus,
    /// Set once a delete event has been accepted; finalization is pending.
    pub deletion_requested: bool,
}

impl ManagedResource {
    /// Create a freshly declared resource.
    #[must_use]
    pub fn new(id: ResourceId, spec: ParamSet, generation: u64) -> Self {
        Self {
            id,
            spec,
            generation,
            status: ResourceStatus::default(),
            deletion_requested: false,
        }
    }

    /// Whether the status reflects a successful run of the current generation.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.status.phase == Phase::Succeeded
            && self.status.observed_generation == Some(self.generation)
    }
}
