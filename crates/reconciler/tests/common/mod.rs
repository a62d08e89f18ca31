//! Shared fixtures for controller tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use playop_core::{ParamSet, ResourceId};
use playop_events::{
    InMemoryResourceStore, LogChannel, ManagedResource, ResourceStatus, ResourceStore,
};
use playop_reconciler::{
    Controller, InvocationRequest, Purpose, RetryPolicy, WorkflowOutput, WorkflowRunner,
};

/// One recorded workflow run.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub resource: ResourceId,
    pub generation: u64,
    pub purpose: Purpose,
    pub params: ParamSet,
}

#[derive(Default)]
struct RunnerState {
    runs: Vec<RecordedRun>,
    active: HashMap<ResourceId, usize>,
    max_active: HashMap<ResourceId, usize>,
}

/// In-process stand-in for a playbook: sleeps, records, exits with a code.
pub struct ScriptedRunner {
    delay: Duration,
    exit_code: i32,
    state: Mutex<RunnerState>,
}

impl ScriptedRunner {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::exiting(delay, 0)
    }

    pub fn exiting(delay: Duration, exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            delay,
            exit_code,
            state: Mutex::new(RunnerState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.state().runs.clone()
    }

    pub fn runs_for(&self, id: &ResourceId) -> Vec<RecordedRun> {
        self.runs().into_iter().filter(|r| &r.resource == id).collect()
    }

    pub fn max_concurrent(&self, id: &ResourceId) -> usize {
        self.state().max_active.get(id).copied().unwrap_or(0)
    }

    pub fn is_active(&self, id: &ResourceId) -> bool {
        self.state().active.get(id).copied().unwrap_or(0) > 0
    }
}

#[async_trait]
impl WorkflowRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &InvocationRequest,
        log: &LogChannel,
    ) -> playop_reconciler::Result<WorkflowOutput> {
        {
            let mut state = self.state();
            state.runs.push(RecordedRun {
                resource: request.resource.clone(),
                generation: request.generation,
                purpose: request.purpose,
                params: request.params.clone(),
            });
            let active = state.active.entry(request.resource.clone()).or_insert(0);
            *active += 1;
            let now = *active;
            let max = state.max_active.entry(request.resource.clone()).or_insert(0);
            *max = (*max).max(now);
        }
        log.workflow(&request.resource, format!("TASK [{}]", request.action()));

        // Decrement even if the timeout drops this future.
        struct Done<'a>(&'a ScriptedRunner, ResourceId);
        impl Drop for Done<'_> {
            fn drop(&mut self) {
                if let Some(active) = self.0.state().active.get_mut(&self.1) {
                    *active = active.saturating_sub(1);
                }
            }
        }
        let _done = Done(self, request.resource.clone());

        tokio::time::sleep(self.delay).await;
        log.workflow(&request.resource, "PLAY RECAP");
        Ok(WorkflowOutput::exited(self.exit_code))
    }
}

/// Resource store whose status writes always fail as unavailable.
#[derive(Default)]
pub struct StatusOutageStore {
    inner: InMemoryResourceStore,
}

impl StatusOutageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceStore for StatusOutageStore {
    async fn apply(
        &self,
        id: &ResourceId,
        spec: ParamSet,
        generation: u64,
    ) -> playop_events::Result<ManagedResource> {
        self.inner.apply(id, spec, generation).await
    }

    async fn get(&self, id: &ResourceId) -> playop_events::Result<Option<ManagedResource>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> playop_events::Result<Vec<ManagedResource>> {
        self.inner.list().await
    }

    async fn patch_status(
        &self,
        _id: &ResourceId,
        _status: ResourceStatus,
    ) -> playop_events::Result<bool> {
        Err(playop_events::Error::store_unavailable("patch status", "connection refused"))
    }

    async fn mark_deleting(&self, id: &ResourceId) -> playop_events::Result<()> {
        self.inner.mark_deleting(id).await
    }

    async fn remove(&self, id: &ResourceId) -> playop_events::Result<Option<ManagedResource>> {
        self.inner.remove(id).await
    }
}

pub fn vm(name: &str) -> ResourceId {
    ResourceId::new("WindowsVM", "default", name)
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_initial_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .with_jitter(false)
}

/// Poll `check` until it holds or ten seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub async fn resource(controller: &Controller, id: &ResourceId) -> Option<ManagedResource> {
    controller.store().get(id).await.ok().flatten()
}

pub async fn status(controller: &Controller, id: &ResourceId) -> Option<ResourceStatus> {
    resource(controller, id).await.map(|r| r.status)
}
