//! Status reporting.
//!
//! Turns invocation outcomes into a phase, a reason and two conditions, and
//! persists them onto the resource record. Every write carries the
//! generation that produced it; writes for a generation older than the
//! resource's current one are dropped.

use std::sync::Arc;

use playop_core::ResourceId;
use playop_events::{Condition, ConditionStatus, Phase, ResourceStatus, ResourceStore};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Condition type that is `True` once the resource has converged.
pub const READY: &str = "Ready";

/// Condition type that is `True` while a workflow runs.
pub const RECONCILING: &str = "Reconciling";

/// What happened to a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Queued, not yet started.
    Queued,
    /// A reconciliation workflow started.
    Started { message: String },
    /// The workflow finished successfully, or was not needed.
    Succeeded { reason: String, message: String },
    /// The reconciliation failed.
    Failed { reason: String, message: String },
    /// Deletion accepted; finalization pending or running.
    Terminating { message: String },
    /// The finalization workflow failed. The record is removed regardless.
    FinalizeFailed { reason: String, message: String },
}

impl Outcome {
    /// Success after a completed workflow run.
    #[must_use]
    pub fn completed() -> Self {
        Self::Succeeded {
            reason: "Completed".to_string(),
            message: "Playbook completed successfully".to_string(),
        }
    }

    /// Success without running anything because the resource is disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self::Succeeded {
            reason: "Disabled".to_string(),
            message: "Resource is disabled; no workflow was run".to_string(),
        }
    }

    /// Failure described by an error.
    #[must_use]
    pub fn failed(error: &Error) -> Self {
        Self::Failed {
            reason: error.status_reason().to_string(),
            message: error.to_string(),
        }
    }

    /// Finalization failure described by an error.
    #[must_use]
    pub fn finalize_failed(error: &Error) -> Self {
        Self::FinalizeFailed {
            reason: error.status_reason().to_string(),
            message: format!("finalization failed: {error}"),
        }
    }

    /// Phase this outcome maps to.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Queued => Phase::Pending,
            Self::Started { .. } => Phase::Progressing,
            Self::Succeeded { .. } => Phase::Succeeded,
            Self::Failed { .. } | Self::FinalizeFailed { .. } => Phase::Failed,
            Self::Terminating { .. } => Phase::Terminating,
        }
    }

    /// Whether the outcome belongs to the deletion path.
    #[must_use]
    pub const fn is_finalizing(&self) -> bool {
        matches!(self, Self::Terminating { .. } | Self::FinalizeFailed { .. })
    }

    fn reason(&self) -> &str {
        match self {
            Self::Queued => "Queued",
            Self::Started { .. } => "Processing",
            Self::Terminating { .. } => "DeleteRequested",
            Self::Succeeded { reason, .. }
            | Self::Failed { reason, .. }
            | Self::FinalizeFailed { reason, .. } => reason,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Queued => "Waiting for a reconciliation worker",
            Self::Started { message }
            | Self::Terminating { message }
            | Self::Succeeded { message, .. }
            | Self::Failed { message, .. }
            | Self::FinalizeFailed { message, .. } => message,
        }
    }

    /// Apply this outcome onto a status, keeping existing conditions'
    /// transition times where their status does not change.
    #[must_use]
    pub fn apply_to(&self, mut status: ResourceStatus, observed_generation: u64) -> ResourceStatus {
        let phase = self.phase();
        let reason = self.reason().to_string();
        let message = self.message().to_string();

        let ready = match phase {
            Phase::Succeeded => ConditionStatus::True,
            Phase::Pending => ConditionStatus::Unknown,
            Phase::Progressing | Phase::Failed | Phase::Terminating => ConditionStatus::False,
        };
        status.set_condition(Condition::new(READY, ready, reason.clone(), message.clone()));
        status.set_condition(Condition::new(
            RECONCILING,
            ConditionStatus::from(phase.is_active()),
            reason.clone(),
            message.clone(),
        ));

        status.phase = phase;
        status.reason = reason;
        status.message = message;
        status.observed_generation = Some(observed_generation);
        status
    }
}

/// Result of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// The status was persisted.
    Written,
    /// A newer generation or a deletion superseded this write.
    Stale,
    /// The resource no longer exists.
    Gone,
    /// Persistence kept failing; the retry budget is spent.
    Abandoned,
}

/// Only writer of resource status.
pub struct StatusReporter {
    store: Arc<dyn ResourceStore>,
    policy: RetryPolicy,
}

impl StatusReporter {
    /// Create a reporter writing through `store`.
    pub fn new(store: Arc<dyn ResourceStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Persist `outcome` as produced by `observed_generation`.
    ///
    /// Best effort: transient store failures are retried with backoff, and
    /// the report gives up once the budget is spent instead of returning an
    /// error.
    pub async fn report(&self, id: &ResourceId, observed_generation: u64, outcome: Outcome) -> Report {
        let mut attempt = 0u32;
        loop {
            let delay = self.policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.try_report(id, observed_generation, &outcome).await {
                Ok(report) => {
                    debug!(resource = %id, observed_generation, phase = %outcome.phase(), ?report, "Status reported");
                    return report;
                }
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    warn!(resource = %id, attempt, error = %e, "Status write failed, retrying");
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    warn!(resource = %id, error = %e, phase = %outcome.phase(), "Giving up on status write");
                    return Report::Abandoned;
                }
            }
        }
    }

    async fn try_report(&self, id: &ResourceId, observed_generation: u64, outcome: &Outcome) -> Result<Report> {
        let Some(resource) = self.store.get(id).await? else {
            return Ok(Report::Gone);
        };

        if observed_generation < resource.generation && !outcome.is_finalizing() {
            debug!(
                resource = %id,
                observed_generation,
                generation = resource.generation,
                "Discarding stale status"
            );
            return Ok(Report::Stale);
        }
        if resource.deletion_requested && !outcome.is_finalizing() {
            debug!(resource = %id, "Discarding status for resource being deleted");
            return Ok(Report::Stale);
        }

        let status = outcome.apply_to(resource.status, observed_generation);
        match self.store.patch_status(id, status).await {
            Ok(true) => Ok(Report::Written),
            Ok(false) => Ok(Report::Stale),
            Err(playop_events::Error::ResourceNotFound { .. }) => Ok(Report::Gone),
            Err(e) => Err(e.into()),
        }
    }
}
