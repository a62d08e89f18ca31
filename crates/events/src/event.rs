//! Resource lifecycle events.

use std::fmt;

use chrono::{DateTime, Utc};
use playop_core::{ParamSet, ResourceId};
use serde::{Deserialize, Serialize};

/// Kind of lifecycle change reported by an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A lifecycle event for one resource.
///
/// Event sources (the manifest watcher, an operator console) submit these;
/// the controller never trusts them beyond their generation ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub event_type: EventType,
    pub resource: ResourceId,
    pub spec: ParamSet,
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    fn new(event_type: EventType, resource: ResourceId, spec: ParamSet, generation: u64) -> Self {
        Self {
            event_type,
            resource,
            spec,
            generation,
            timestamp: Utc::now(),
        }
    }

    /// A new declared object.
    #[must_use]
    pub fn created(resource: ResourceId, spec: ParamSet, generation: u64) -> Self {
        Self::new(EventType::Create, resource, spec, generation)
    }

    /// A changed declared object.
    #[must_use]
    pub fn updated(resource: ResourceId, spec: ParamSet, generation: u64) -> Self {
        Self::new(EventType::Update, resource, spec, generation)
    }

    /// A removed declared object. The spec is the last one observed, so the
    /// finalization workflow can still address the provisioned target.
    #[must_use]
    pub fn deleted(resource: ResourceId, spec: ParamSet, generation: u64) -> Self {
        Self::new(EventType::Delete, resource, spec, generation)
    }

    /// Whether this is a deletion.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.event_type == EventType::Delete
    }
}
