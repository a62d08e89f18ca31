//! Managed resources and the signals that flow around them.
//!
//! This crate provides the data model the reconciler works on:
//!
//! - **Resources**: declared desired-state objects with a status subresource
//! - **Conditions**: typed, timestamped facts keyed by condition type
//! - **Lifecycle events**: create/update/delete notifications from an event source
//! - **Resource store**: the record of every resource, including its status
//! - **Log channel**: a bounded, multi-subscriber stream of workflow output
//!
//! # Example
//!
//! ```ignore
//! use playop_events::{InMemoryResourceStore, LifecycleEvent, LogChannel, ResourceStore};
//! use playop_core::{ParamSet, ResourceId};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = InMemoryResourceStore::new();
//!     let id = ResourceId::new("WindowsVM", "default", "win-01");
//!     let event = LifecycleEvent::created(id.clone(), ParamSet::new(), 1);
//!     store.apply(&event.resource, event.spec.clone(), event.generation).await.ok();
//!
//!     let log = LogChannel::new(1024);
//!     let mut tail = log.subscribe();
//!     log.operator(Some(&id), "reconciling");
//!     let line = tail.recv().await;
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod event;
pub mod log;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use event::{EventType, LifecycleEvent};
pub use log::{LogChannel, LogLine, LogSource, LogSubscription};
pub use store::{InMemoryResourceStore, ResourceStore, TracingResourceStore};
pub use types::{Condition, ConditionStatus, ManagedResource, Phase, ResourceStatus};
