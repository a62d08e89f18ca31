//! Reconciliation controller.
//!
//! Lifecycle events go through [`Controller::submit`]. Each resource has a
//! tracker moving through `Idle -> Queued -> Running -> Idle`, or into
//! `Deleting` once a delete arrives. Events that land while a resource is
//! queued or running collapse into one pending re-evaluation of the latest
//! generation. Resource ids travel over a channel to a fixed pool of
//! workers; a worker that finds the resource's gate held puts the work back
//! and re-queues the id after a backoff.
//!
//! `submit` never waits on status persistence. The `Queued` and
//! `Terminating` writes ride on the tracker as an announcement that the
//! worker picking up the id persists before it claims the work.
//!
//! A create or update that arrives while a deletion is finalizing is held on
//! the tracker and applied once the old record is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use playop_core::{ParamSet, ParamValue, ResourceId};
use playop_events::{
    EventType, InMemoryResourceStore, LifecycleEvent, LogChannel, ManagedResource, ResourceStore,
    TracingResourceStore,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ReconcilerConfig, WorkflowDefinition};
use crate::error::{Error, Result};
use crate::gate::{ExecutionGate, GateToken};
use crate::invoker::{InvocationRequest, ProcessRunner, Purpose, WorkflowInvoker, WorkflowRunner};
use crate::retry::retry_transient;
use crate::secrets::{SecretStore, resolve_secrets};
use crate::status::{Outcome, StatusReporter};
use crate::variables::{Environment, VariableResolver};

/// Parameter that switches a resource off without deleting it.
pub const ENABLED_PARAM: &str = "enabled";

/// Where a resource is in the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Nothing queued or running.
    Idle,
    /// Waiting for a worker or for its gate.
    Queued,
    /// A reconciliation workflow is running.
    Running,
    /// A delete was accepted; finalization is queued or running.
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Reconcile { generation: u64, forced: bool },
    Finalize,
}

impl Work {
    /// Combine two pending units. Finalization wins; otherwise the latest
    /// generation is kept.
    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Finalize, _) | (_, Self::Finalize) => Self::Finalize,
            (
                Self::Reconcile { generation: a, forced: fa },
                Self::Reconcile { generation: b, forced: fb },
            ) => Self::Reconcile {
                generation: a.max(b),
                forced: fa || fb,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    Queued,
    Running { generation: u64 },
    Deleting { running: bool },
}

/// Status write owed before the tracker's work may be claimed.
#[derive(Debug, Clone)]
struct Announcement {
    generation: u64,
    outcome: Outcome,
}

#[derive(Debug)]
struct Tracker {
    state: TrackerState,
    next: Option<Work>,
    busy_attempts: u32,
    announce: Option<Announcement>,
    /// Set while a worker persists `announce`; claims wait for it.
    announcing: bool,
    /// Spec declared again while finalizing, applied after removal.
    recreate: Option<(ParamSet, u64)>,
}

impl Tracker {
    fn new(work: Work) -> Self {
        let state = match work {
            Work::Reconcile { .. } => TrackerState::Queued,
            Work::Finalize => TrackerState::Deleting { running: false },
        };
        Self {
            state,
            next: Some(work),
            busy_attempts: 0,
            announce: None,
            announcing: false,
            recreate: None,
        }
    }

    fn push(&mut self, work: Work) {
        self.next = Some(match self.next {
            Some(pending) => pending.merge(work),
            None => work,
        });
    }

    /// Fold an incoming unit into this tracker. Returns `true` if the id
    /// must be put on the queue.
    fn coalesce(&mut self, work: Work) -> bool {
        match (self.state, work) {
            (TrackerState::Deleting { .. }, _) => false,
            (TrackerState::Queued, Work::Reconcile { .. }) => {
                self.push(work);
                false
            }
            (TrackerState::Queued, Work::Finalize) => {
                self.next = Some(Work::Finalize);
                self.state = TrackerState::Deleting { running: false };
                false
            }
            (
                TrackerState::Running { generation: running },
                Work::Reconcile { generation, forced },
            ) => {
                if forced || generation > running {
                    self.push(work);
                }
                false
            }
            (TrackerState::Running { .. }, Work::Finalize) => {
                self.next = Some(Work::Finalize);
                self.state = TrackerState::Deleting { running: false };
                true
            }
        }
    }

    const fn activity(&self) -> Activity {
        match self.state {
            TrackerState::Queued => Activity::Queued,
            TrackerState::Running { .. } => Activity::Running,
            TrackerState::Deleting { .. } => Activity::Deleting,
        }
    }
}

enum Claim {
    Nothing,
    Busy(Duration),
    Acquired(GateToken, Work),
}

struct Inner {
    config: ReconcilerConfig,
    store: Arc<dyn ResourceStore>,
    gate: ExecutionGate,
    invoker: WorkflowInvoker,
    reporter: StatusReporter,
    secrets: Option<Arc<dyn SecretStore>>,
    overrides: ParamSet,
    environment: Option<Environment>,
    log: Arc<LogChannel>,
    trackers: Mutex<HashMap<ResourceId, Tracker>>,
    queue_tx: mpsc::UnboundedSender<ResourceId>,
    queue_rx: AsyncMutex<mpsc::UnboundedReceiver<ResourceId>>,
    stop_tx: watch::Sender<bool>,
}

/// The reconciliation controller. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Create a builder.
    pub fn builder(config: ReconcilerConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    /// The controller configuration.
    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.inner.config
    }

    /// The resource store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.inner.store
    }

    /// The execution gate.
    #[must_use]
    pub fn gate(&self) -> &ExecutionGate {
        &self.inner.gate
    }

    /// The shared workflow log channel.
    #[must_use]
    pub fn log(&self) -> &Arc<LogChannel> {
        &self.inner.log
    }

    /// Where `id` currently is.
    #[must_use]
    pub fn activity(&self, id: &ResourceId) -> Activity {
        self.trackers()
            .get(id)
            .map_or(Activity::Idle, Tracker::activity)
    }

    /// Handle to stop the workers.
    #[must_use]
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.inner.stop_tx.clone(),
        }
    }

    /// Accept a lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource store rejects the event.
    /// Also returns [`Error::LoopStopped`] once the controller has been stopped.
    pub async fn submit(&self, event: LifecycleEvent) -> Result<()> {
        self.ensure_running()?;
        debug!(
            resource = %event.resource,
            event_type = %event.event_type,
            generation = event.generation,
            "Lifecycle event received"
        );
        match event.event_type {
            EventType::Create | EventType::Update => {
                self.accept_spec(&event.resource, event.spec, event.generation)
                    .await
            }
            EventType::Delete => self.request_delete(&event.resource).await,
        }
    }

    /// Re-run the workflow for `id` even if it has converged.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource does not exist or the controller
    /// has been stopped.
    pub async fn retry(&self, id: &ResourceId) -> Result<()> {
        self.ensure_running()?;
        let resource = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::from(playop_events::Error::resource_not_found(id)))?;
        if resource.deletion_requested {
            return Ok(());
        }
        info!(resource = %id, generation = resource.generation, "Retry requested");
        self.schedule(
            id,
            Work::Reconcile {
                generation: resource.generation,
                forced: true,
            },
            resource.generation,
        );
        Ok(())
    }

    /// Re-evaluate every stored resource. Returns how many were queued.
    ///
    /// Resources that reached a terminal phase for their current generation
    /// are left alone; everything else, including resources whose deletion
    /// never finished, is queued again.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub async fn resync(&self) -> Result<usize> {
        let resources = self.inner.store.list().await?;
        let mut queued = 0usize;
        for resource in resources {
            if self.is_tracked(&resource.id) {
                continue;
            }
            let work = if resource.deletion_requested {
                Work::Finalize
            } else if needs_reconcile(&resource) {
                Work::Reconcile {
                    generation: resource.generation,
                    forced: false,
                }
            } else {
                continue;
            };
            self.schedule(&resource.id, work, resource.generation);
            queued = queued.saturating_add(1);
        }
        debug!(queued, "Resync complete");
        Ok(queued)
    }

    /// Spawn the worker pool and background timers.
    pub fn start(&self) -> ControllerHandle {
        let config = &self.inner.config;
        info!(workers = config.workers, "Starting reconciliation controller");

        let mut tasks = Vec::with_capacity(config.workers.saturating_add(2));
        for worker in 0..config.workers {
            let controller = self.clone();
            let stop_rx = self.inner.stop_tx.subscribe();
            tasks.push(tokio::spawn(controller.worker_loop(worker, stop_rx)));
        }

        if !config.resync_interval.is_zero() {
            let controller = self.clone();
            let stop_rx = self.inner.stop_tx.subscribe();
            tasks.push(tokio::spawn(controller.resync_loop(config.resync_interval, stop_rx)));
        }

        if !config.idle_lock_ttl.is_zero() {
            let controller = self.clone();
            let stop_rx = self.inner.stop_tx.subscribe();
            tasks.push(tokio::spawn(controller.gc_loop(config.idle_lock_ttl, stop_rx)));
        }

        ControllerHandle {
            stopper: self.stopper(),
            tasks,
        }
    }

    fn trackers(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceId, Tracker>> {
        self.inner
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_tracked(&self, id: &ResourceId) -> bool {
        self.trackers().contains_key(id)
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.inner.stop_tx.borrow() {
            return Err(Error::LoopStopped);
        }
        Ok(())
    }

    async fn accept_spec(&self, id: &ResourceId, spec: ParamSet, generation: u64) -> Result<()> {
        if self.defer_recreate(id, &spec, generation, false) {
            return Ok(());
        }

        let resource = self
            .inner
            .store
            .apply(id, spec.clone(), generation)
            .await?;
        if resource.deletion_requested {
            self.defer_recreate(id, &spec, generation, true);
            return Ok(());
        }
        if resource.is_converged() && !self.is_tracked(id) {
            debug!(
                resource = %id,
                generation = resource.generation,
                "Already converged, skipping"
            );
            return Ok(());
        }
        self.schedule(
            id,
            Work::Reconcile {
                generation: resource.generation,
                forced: false,
            },
            resource.generation,
        );
        Ok(())
    }

    /// Hold a declared spec until the pending deletion of `id` completes.
    ///
    /// Returns `false` if no deletion is in progress. With `track`, a
    /// finalization is scheduled when the tracker is missing or not yet
    /// deleting, so the held spec is always picked up.
    fn defer_recreate(&self, id: &ResourceId, spec: &ParamSet, generation: u64, track: bool) -> bool {
        let enqueue = {
            let mut trackers = self.trackers();
            match trackers.get_mut(id) {
                Some(tracker) if matches!(tracker.state, TrackerState::Deleting { .. }) => {
                    tracker.recreate = Some((spec.clone(), generation));
                    false
                }
                Some(tracker) if track => {
                    let enqueue = tracker.coalesce(Work::Finalize);
                    tracker.recreate = Some((spec.clone(), generation));
                    enqueue
                }
                None if track => {
                    let mut tracker = Tracker::new(Work::Finalize);
                    tracker.recreate = Some((spec.clone(), generation));
                    trackers.insert(id.clone(), tracker);
                    true
                }
                Some(_) | None => return false,
            }
        };
        info!(resource = %id, generation, "Deletion in progress, re-create deferred");
        if enqueue {
            self.enqueue(id);
        }
        true
    }

    async fn request_delete(&self, id: &ResourceId) -> Result<()> {
        // The latest declaration wins over a re-create held earlier.
        if let Some(tracker) = self.trackers().get_mut(id) {
            tracker.recreate = None;
        }

        match self.inner.store.mark_deleting(id).await {
            Ok(()) => {}
            Err(playop_events::Error::ResourceNotFound { .. }) => {
                debug!(resource = %id, "Delete for unknown resource ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        info!(resource = %id, "Deletion requested");
        let generation = self
            .inner
            .store
            .get(id)
            .await?
            .map_or(0, |r| r.generation);
        self.inner.log.operator(Some(id), "Deletion requested");
        self.schedule(id, Work::Finalize, generation);
        Ok(())
    }

    /// Track `work` for `id`. A new tracker owes a `Queued` status; a
    /// deletion always owes `Terminating`.
    fn schedule(&self, id: &ResourceId, work: Work, generation: u64) {
        let announcement = Announcement {
            generation,
            outcome: match work {
                Work::Reconcile { .. } => Outcome::Queued,
                Work::Finalize => Outcome::Terminating {
                    message: "Deletion requested; finalizer pending".to_string(),
                },
            },
        };

        let enqueue = {
            let mut trackers = self.trackers();
            match trackers.get_mut(id) {
                Some(tracker) => {
                    if work == Work::Finalize {
                        tracker.announce = Some(announcement);
                    }
                    tracker.coalesce(work)
                }
                None => {
                    let mut tracker = Tracker::new(work);
                    tracker.announce = Some(announcement);
                    trackers.insert(id.clone(), tracker);
                    true
                }
            }
        };

        if enqueue {
            self.enqueue(id);
        } else {
            debug!(resource = %id, ?work, "Coalesced into pending work");
        }
    }

    fn enqueue(&self, id: &ResourceId) {
        if self.inner.queue_tx.send(id.clone()).is_err() {
            error!(resource = %id, "Work queue closed");
        }
    }

    fn requeue_after(&self, id: &ResourceId, delay: Duration) {
        let tx = self.inner.queue_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Fails only once the controller is gone.
            let _ = tx.send(id);
        });
    }

    async fn worker_loop(self, worker: usize, mut stop_rx: watch::Receiver<bool>) {
        debug!(worker, "Worker started");
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let next = {
                let mut queue = self.inner.queue_rx.lock().await;
                tokio::select! {
                    id = queue.recv() => id,
                    _ = stop_rx.changed() => None,
                }
            };
            let Some(id) = next else {
                break;
            };
            self.process(&id).await;
        }
        debug!(worker, "Worker stopped");
    }

    async fn resync_loop(self, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Resync failed");
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
    }

    async fn gc_loop(self, ttl: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(ttl.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.inner.gate.prune_idle(ttl);
                }
                _ = stop_rx.changed() => break,
            }
        }
    }

    async fn process(&self, id: &ResourceId) {
        while let Some(announcement) = self.take_announcement(id) {
            self.inner
                .reporter
                .report(id, announcement.generation, announcement.outcome)
                .await;
            if let Some(tracker) = self.trackers().get_mut(id) {
                tracker.announcing = false;
            }
        }

        match self.claim(id) {
            Claim::Nothing => {}
            Claim::Busy(delay) => {
                debug!(resource = %id, delay_ms = delay.as_millis(), "Resource busy, re-queueing");
                self.requeue_after(id, delay);
            }
            Claim::Acquired(token, Work::Reconcile { forced, .. }) => {
                self.reconcile(id, token, forced).await;
            }
            Claim::Acquired(token, Work::Finalize) => self.finalize(id, token).await,
        }
    }

    /// Take the owed status write, unless another worker is persisting one.
    fn take_announcement(&self, id: &ResourceId) -> Option<Announcement> {
        let mut trackers = self.trackers();
        let tracker = trackers.get_mut(id)?;
        if tracker.announcing {
            return None;
        }
        let announcement = tracker.announce.take()?;
        tracker.announcing = true;
        Some(announcement)
    }

    /// Take the pending work for `id` if its gate is free.
    fn claim(&self, id: &ResourceId) -> Claim {
        let mut trackers = self.trackers();
        let Some(tracker) = trackers.get_mut(id) else {
            return Claim::Nothing;
        };
        // The worker persisting the announcement claims once it is written.
        if tracker.announcing {
            return Claim::Nothing;
        }
        let claimable = matches!(
            tracker.state,
            TrackerState::Queued | TrackerState::Deleting { running: false }
        );
        if !claimable || tracker.next.is_none() {
            return Claim::Nothing;
        }

        let token = match self.inner.gate.acquire(id) {
            Ok(token) => token,
            Err(_) => {
                tracker.busy_attempts = tracker.busy_attempts.saturating_add(1);
                return Claim::Busy(self.inner.config.busy_backoff.delay_for(tracker.busy_attempts));
            }
        };

        tracker.busy_attempts = 0;
        let Some(work) = tracker.next.take() else {
            return Claim::Nothing;
        };
        tracker.state = match work {
            Work::Reconcile { generation, .. } => TrackerState::Running { generation },
            Work::Finalize => TrackerState::Deleting { running: true },
        };
        Claim::Acquired(token, work)
    }

    async fn reconcile(&self, id: &ResourceId, token: GateToken, forced: bool) {
        let resource = match self.inner.store.get(id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                debug!(resource = %id, "Resource vanished before reconciliation");
                self.inner.gate.release(token);
                self.finish_run(id, None);
                return;
            }
            Err(e) => {
                warn!(resource = %id, error = %e, "Cannot load resource");
                self.inner.gate.release(token);
                self.finish_run(id, None);
                return;
            }
        };

        if resource.deletion_requested || (!forced && resource.is_converged()) {
            debug!(resource = %id, generation = resource.generation, "Nothing to do");
            self.inner.gate.release(token);
            self.finish_run(id, None);
            return;
        }

        let generation = resource.generation;
        self.set_running_generation(id, generation);
        self.inner
            .reporter
            .report(
                id,
                generation,
                Outcome::Started {
                    message: format!("Running {} workflow (generation {generation})", id.kind),
                },
            )
            .await;

        let outcome = match self.run_reconcile(&resource).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(resource = %id, generation, reason = e.status_reason(), error = %e, "Reconciliation failed");
                self.inner
                    .log
                    .operator(Some(id), format!("Reconciliation failed: {e}"));
                Outcome::failed(&e)
            }
        };

        // Status persistence must never hold the gate.
        self.inner.gate.release(token);
        self.inner.reporter.report(id, generation, outcome).await;
        self.finish_run(id, Some(generation));
    }

    async fn run_reconcile(&self, resource: &ManagedResource) -> Result<Outcome> {
        let workflow = self.workflow_for(&resource.id)?;
        let resolver = VariableResolver::for_workflow(workflow, &self.inner.overrides);
        let params = resolver.resolve(&resource.spec, &self.environment())?;

        if is_disabled(&params) {
            info!(resource = %resource.id, "Resource disabled, skipping workflow");
            self.inner
                .log
                .operator(Some(&resource.id), "Resource disabled; skipping playbook");
            return Ok(Outcome::disabled());
        }

        let params = resolve_secrets(
            params,
            self.inner.secrets.as_deref(),
            &self.inner.config.secret_retry,
        )
        .await?;
        let request = InvocationRequest::new(
            resource.id.clone(),
            resource.generation,
            Purpose::Reconcile,
            workflow.clone(),
            params,
        );
        self.inner.invoker.invoke(&request).await?;
        Ok(Outcome::completed())
    }

    async fn finalize(&self, id: &ResourceId, token: GateToken) {
        if let Ok(Some(resource)) = self.inner.store.get(id).await {
            self.inner.log.operator(Some(id), "Running finalizer");
            if let Err(e) = self.run_finalize(&resource).await {
                warn!(resource = %id, error = %e, "Finalizer failed; removing resource anyway");
                self.inner
                    .log
                    .operator(Some(id), format!("Finalizer failed: {e}"));
                self.inner
                    .reporter
                    .report(id, resource.generation, Outcome::finalize_failed(&e))
                    .await;
            }
        }

        let store = Arc::clone(&self.inner.store);
        let removed = retry_transient(&self.inner.config.status_retry, "remove resource", || {
            let store = Arc::clone(&store);
            let id = id.clone();
            async move { store.remove(&id).await.map_err(Error::from) }
        })
        .await;
        if let Err(e) = removed {
            error!(resource = %id, error = %e, "Failed to remove resource record");
        }

        self.inner.gate.release(token);
        self.inner.gate.forget(id);
        let recreate = self.trackers().remove(id).and_then(|tracker| tracker.recreate);
        info!(resource = %id, "Resource finalized");
        self.inner.log.operator(Some(id), "Resource removed");

        if let Some((spec, generation)) = recreate {
            info!(resource = %id, generation, "Re-creating resource declared during deletion");
            if let Err(e) = self.accept_spec(id, spec, generation).await {
                error!(resource = %id, error = %e, "Failed to re-create resource");
            }
        }
    }

    async fn run_finalize(&self, resource: &ManagedResource) -> Result<()> {
        let Some(workflow) = self.inner.config.workflow_for(&resource.id.kind) else {
            debug!(resource = %resource.id, "No workflow registered, nothing to finalize");
            return Ok(());
        };
        let resolver = VariableResolver::for_workflow(workflow, &self.inner.overrides);
        let params = resolver.resolve_action(
            &resource.spec,
            &self.environment(),
            &workflow.finalize_action,
        )?;
        if is_disabled(&params) {
            return Ok(());
        }

        let params = resolve_secrets(
            params,
            self.inner.secrets.as_deref(),
            &self.inner.config.secret_retry,
        )
        .await?;
        let request = InvocationRequest::new(
            resource.id.clone(),
            resource.generation,
            Purpose::Finalize,
            workflow.clone(),
            params,
        );
        self.inner.invoker.invoke(&request).await.map(|_| ())
    }

    fn set_running_generation(&self, id: &ResourceId, generation: u64) {
        if let Some(tracker) = self.trackers().get_mut(id) {
            if matches!(tracker.state, TrackerState::Running { .. }) {
                tracker.state = TrackerState::Running { generation };
            }
        }
    }

    /// Leave `Running`: back to `Queued` if work piled up, else idle.
    fn finish_run(&self, id: &ResourceId, generation: Option<u64>) {
        let requeue = {
            let mut trackers = self.trackers();
            match trackers.get_mut(id) {
                Some(tracker) if matches!(tracker.state, TrackerState::Running { .. }) => {
                    let pending = tracker.next.filter(|work| match (work, generation) {
                        (Work::Reconcile { generation: next, forced }, Some(ran)) => {
                            *forced || *next > ran
                        }
                        _ => true,
                    });
                    if pending.is_some() {
                        tracker.state = TrackerState::Queued;
                        tracker.next = pending;
                        true
                    } else {
                        trackers.remove(id);
                        false
                    }
                }
                _ => false,
            }
        };
        if requeue {
            self.enqueue(id);
        }
    }

    fn workflow_for(&self, id: &ResourceId) -> Result<&WorkflowDefinition> {
        self.inner
            .config
            .workflow_for(&id.kind)
            .ok_or_else(|| Error::configuration(format!("no workflow registered for kind '{}'", id.kind)))
    }

    fn environment(&self) -> Environment {
        self.inner
            .environment
            .clone()
            .unwrap_or_else(Environment::from_process)
    }
}

fn is_disabled(params: &ParamSet) -> bool {
    params.get(ENABLED_PARAM).and_then(ParamValue::as_bool) == Some(false)
}

/// Terminal for the current generation means settled until the spec changes.
fn needs_reconcile(resource: &ManagedResource) -> bool {
    !(resource.status.phase.is_terminal()
        && resource.status.observed_generation == Some(resource.generation))
}

/// Builder for [`Controller`].
pub struct ControllerBuilder {
    config: ReconcilerConfig,
    store: Option<Arc<dyn ResourceStore>>,
    runner: Option<Arc<dyn WorkflowRunner>>,
    secrets: Option<Arc<dyn SecretStore>>,
    overrides: ParamSet,
    environment: Option<Environment>,
    log: Option<Arc<LogChannel>>,
}

impl ControllerBuilder {
    /// Create a builder from configuration.
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            store: None,
            runner: None,
            secrets: None,
            overrides: ParamSet::new(),
            environment: None,
            log: None,
        }
    }

    /// Use a specific resource store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific workflow runner.
    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn WorkflowRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Resolve secret references through `secrets`.
    #[must_use]
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Startup overrides, above spec values and below bound environment
    /// variables.
    #[must_use]
    pub fn overrides(mut self, overrides: ParamSet) -> Self {
        self.overrides = overrides;
        self
    }

    /// Resolve against a fixed environment instead of the process's.
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Publish workflow output on an existing channel.
    #[must_use]
    pub fn log(mut self, log: Arc<LogChannel>) -> Self {
        self.log = Some(log);
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<Controller> {
        self.config.validate()?;

        let store = self.store.unwrap_or_else(|| {
            Arc::new(TracingResourceStore::new(InMemoryResourceStore::new())) as Arc<dyn ResourceStore>
        });
        let runner = self
            .runner
            .unwrap_or_else(|| {
                Arc::new(ProcessRunner::new(self.config.excerpt_lines)) as Arc<dyn WorkflowRunner>
            });
        let log = self
            .log
            .unwrap_or_else(|| Arc::new(LogChannel::new(self.config.log_capacity)));

        let invoker = WorkflowInvoker::new(runner, Arc::clone(&log), self.config.workflow_timeout);
        let reporter = StatusReporter::new(Arc::clone(&store), self.config.status_retry.clone());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        Ok(Controller {
            inner: Arc::new(Inner {
                config: self.config,
                store,
                gate: ExecutionGate::new(),
                invoker,
                reporter,
                secrets: self.secrets,
                overrides: self.overrides,
                environment: self.environment,
                log,
                trackers: Mutex::new(HashMap::new()),
                queue_tx,
                queue_rx: AsyncMutex::new(queue_rx),
                stop_tx,
            }),
        })
    }
}

/// Handle to stop a running controller.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the workers and timers.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Background tasks of a started controller.
pub struct ControllerHandle {
    stopper: LoopStopper,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Signal every task to stop.
    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Stop and wait for every task to exit.
    ///
    /// Workers finish the item they are on first, so this waits for running
    /// workflows to end or time out.
    pub async fn shutdown(self) {
        self.stopper.stop();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        info!("Reconciliation controller stopped");
    }
}
