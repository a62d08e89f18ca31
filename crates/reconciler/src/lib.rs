//! Playbook reconciliation controller.
//!
//! Drives declared resources to their desired state by running external,
//! idempotent workflows (ansible playbooks) and reporting the outcome onto
//! each resource's status.
//!
//! # Components
//!
//! - [`VariableResolver`] merges environment, startup overrides, spec and
//!   defaults into one parameter set
//! - [`ExecutionGate`] allows one workflow per resource at a time
//! - [`WorkflowInvoker`] runs a workflow under a timeout and streams its output
//! - [`StatusReporter`] maps outcomes to phases and conditions
//! - [`Controller`] ties them together behind a queue and a worker pool
//!
//! # Example
//!
//! ```ignore
//! use playop_core::{ParamSet, ResourceId};
//! use playop_events::LifecycleEvent;
//! use playop_reconciler::{Controller, ReconcilerConfig, WorkflowDefinition};
//!
//! #[tokio::main]
//! async fn main() -> playop_reconciler::Result<()> {
//!     let config = ReconcilerConfig::builder()
//!         .workflow(
//!             "WindowsVM",
//!             WorkflowDefinition::playbook("playbooks/windows_vm.yml")
//!                 .secret("password")
//!                 .bind_env("password", "WINDOWS_PASSWORD"),
//!         )
//!         .build()?;
//!
//!     let controller = Controller::builder(config).build()?;
//!     let handle = controller.start();
//!
//!     let id = ResourceId::new("WindowsVM", "default", "win-01");
//!     let spec = ParamSet::new().with("vm_name", "win-01");
//!     controller.submit(LifecycleEvent::created(id, spec, 1)).await?;
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod invoker;
pub mod retry;
pub mod secrets;
pub mod status;
pub mod variables;

pub use config::{ReconcilerConfig, ReconcilerConfigBuilder, VaultConfig, WorkflowDefinition};
pub use controller::{Activity, Controller, ControllerBuilder, ControllerHandle, LoopStopper};
pub use error::{Error, Result};
pub use gate::{ExecutionGate, GateToken};
pub use invoker::{
    InvocationRequest, ProcessRunner, Purpose, WorkflowInvoker, WorkflowOutput, WorkflowRunner,
};
pub use retry::RetryPolicy;
pub use secrets::{InMemorySecretStore, SecretRef, SecretStore, VaultSecretStore};
pub use status::{Outcome, Report, StatusReporter};
pub use variables::{Environment, VariableResolver};
