//! Behavioral tests for the reconciliation controller.
//!
//! The controller is responsible for:
//! - Running at most one workflow per resource at a time
//! - Collapsing bursts of updates into one re-evaluation of the latest spec
//! - Never letting an older generation's status overwrite a newer one
//! - Always driving a deleted resource to removal
//! - Reporting timeouts and failures onto status without wedging the gate

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedRunner, StatusOutageStore, eventually, fast_retry, resource, status, vm};
use playop_core::ParamSet;
use playop_events::{LifecycleEvent, Phase};
use playop_reconciler::{
    Activity, Controller, Environment, Error, Purpose, ReconcilerConfig, WorkflowDefinition,
};

fn config() -> ReconcilerConfig {
    ReconcilerConfig::builder()
        .workers(4)
        .busy_backoff(fast_retry().with_max_attempts(u32::MAX))
        .status_retry(fast_retry())
        .resync_interval(Duration::ZERO)
        .workflow(
            "WindowsVM",
            WorkflowDefinition::playbook("playbooks/windows_vm.yml")
                .secret("password")
                .bind_env("password", "WINDOWS_PASSWORD")
                .default_param("region", "us-west"),
        )
        .build()
        .expect("valid config")
}

fn controller_with(config: ReconcilerConfig, runner: Arc<ScriptedRunner>) -> Controller {
    Controller::builder(config)
        .runner(runner)
        .environment(Environment::new())
        .build()
        .expect("controller builds")
}

async fn succeeded_at(controller: &Controller, id: &playop_core::ResourceId, generation: u64) -> bool {
    status(controller, id)
        .await
        .is_some_and(|s| s.phase == Phase::Succeeded && s.observed_generation == Some(generation))
}

// ============================================================================
// BEHAVIOR: Mutual exclusion
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_never_run_two_workflows_for_one_resource() {
    // Given: a pool of workers and a slow workflow
    let runner = ScriptedRunner::new(Duration::from_millis(50));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");

    // When: updates and retries race in
    for generation in 1..=10 {
        controller
            .submit(LifecycleEvent::updated(id.clone(), ParamSet::new(), generation))
            .await
            .expect("submit");
        controller.retry(&id).await.expect("retry");
        tokio::time::sleep(Duration::from_millis(7)).await;
    }

    // Then: the latest generation converges with no overlap along the way
    assert!(eventually(|| succeeded_at(&controller, &id, 10)).await);
    assert!(eventually(|| async { controller.activity(&id) == Activity::Idle }).await);
    assert_eq!(runner.max_concurrent(&id), 1);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_run_distinct_resources_concurrently() {
    // Given: two resources and a workflow that takes a while
    let runner = ScriptedRunner::new(Duration::from_millis(300));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();

    // When: both are created
    controller.submit(LifecycleEvent::created(vm("a"), ParamSet::new(), 1)).await.unwrap();
    controller.submit(LifecycleEvent::created(vm("b"), ParamSet::new(), 1)).await.unwrap();

    // Then: both run at the same time
    assert!(eventually(|| async { runner.is_active(&vm("a")) && runner.is_active(&vm("b")) }).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_requeue_while_gate_is_held_elsewhere() {
    // Given: a resource whose gate is already held
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    let token = controller.gate().acquire(&id).expect("gate free");

    // When: an event arrives
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Then: it waits, queued, without failing the resource
    assert!(runner.runs_for(&id).is_empty());
    assert_eq!(controller.activity(&id), Activity::Queued);
    assert_eq!(status(&controller, &id).await.map(|s| s.phase), Some(Phase::Pending));

    // And: runs once the gate is released
    controller.gate().release(token);
    assert!(eventually(|| succeeded_at(&controller, &id, 1)).await);
    handle.shutdown().await;
}

// ============================================================================
// BEHAVIOR: Coalescing and generation ordering
// ============================================================================

#[tokio::test]
async fn should_collapse_updates_during_a_run_into_latest_generation() {
    // Given: generation 1 is running
    let runner = ScriptedRunner::new(Duration::from_millis(300));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| async { runner.is_active(&id) }).await);

    // When: two more updates arrive while it runs
    controller
        .submit(LifecycleEvent::updated(id.clone(), ParamSet::new().with("size", "m"), 2))
        .await
        .unwrap();
    controller
        .submit(LifecycleEvent::updated(id.clone(), ParamSet::new().with("size", "l"), 3))
        .await
        .unwrap();

    // Then: exactly one more run happens, for generation 3
    assert!(eventually(|| succeeded_at(&controller, &id, 3)).await);
    assert!(eventually(|| async { controller.activity(&id) == Activity::Idle }).await);
    let generations: Vec<u64> = runner.runs_for(&id).iter().map(|r| r.generation).collect();
    assert_eq!(generations, vec![1, 3]);
    assert_eq!(
        runner.runs_for(&id).last().and_then(|r| r.params.get_str("size").map(str::to_string)),
        Some("l".to_string())
    );
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_keep_observed_generation_monotonic() {
    // Given: a stream of spec updates
    let runner = ScriptedRunner::new(Duration::from_millis(15));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");

    let watcher = {
        let controller = controller.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..300 {
                if let Some(observed) = status(&controller, &id).await.and_then(|s| s.observed_generation) {
                    seen.push(observed);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            seen
        })
    };

    // When: generations 1..=20 are submitted quickly
    for generation in 1..=20 {
        controller
            .submit(LifecycleEvent::updated(id.clone(), ParamSet::new(), generation))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Then: no observer ever saw observedGeneration go backwards
    let seen = watcher.await.unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "observed generations regressed: {seen:?}");
    assert!(eventually(|| succeeded_at(&controller, &id, 20)).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_skip_events_for_converged_generation_until_retried() {
    // Given: generation 1 has succeeded
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| succeeded_at(&controller, &id, 1)).await);
    assert!(eventually(|| async { controller.activity(&id) == Activity::Idle }).await);

    // When: the same generation is reported again
    controller.submit(LifecycleEvent::updated(id.clone(), ParamSet::new(), 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Then: nothing re-runs
    assert_eq!(runner.runs_for(&id).len(), 1);

    // When: an explicit retry is requested
    controller.retry(&id).await.unwrap();

    // Then: it runs again
    assert!(eventually(|| async { runner.runs_for(&id).len() == 2 }).await);
    handle.shutdown().await;
}

// ============================================================================
// BEHAVIOR: Deletion
// ============================================================================

#[tokio::test]
async fn should_finalize_after_in_flight_workflow_and_remove_record() {
    // Given: a reconciliation in flight
    let runner = ScriptedRunner::new(Duration::from_millis(200));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| async { runner.is_active(&id) }).await);

    // When: the resource is deleted
    controller
        .submit(LifecycleEvent::deleted(id.clone(), ParamSet::new(), 1))
        .await
        .unwrap();
    assert!(eventually(|| async {
        status(&controller, &id).await.is_some_and(|s| s.phase == Phase::Terminating)
    })
    .await);

    // Then: the record is eventually removed
    assert!(eventually(|| async { resource(&controller, &id).await.is_none() }).await);
    assert_eq!(controller.activity(&id), Activity::Idle);

    // And: the finalizer ran after the reconcile, never alongside it
    let runs = runner.runs_for(&id);
    let purposes: Vec<Purpose> = runs.iter().map(|r| r.purpose).collect();
    assert_eq!(purposes, vec![Purpose::Reconcile, Purpose::Finalize]);
    assert_eq!(runs[1].params.get_str("action"), Some("uninstall"));
    assert_eq!(runner.max_concurrent(&id), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_cancel_queued_work_on_delete() {
    // Given: one worker busy with another resource, so ours stays queued
    let runner = ScriptedRunner::new(Duration::from_millis(200));
    let config = ReconcilerConfig { workers: 1, ..config() };
    let controller = controller_with(config, runner.clone());
    let handle = controller.start();
    controller.submit(LifecycleEvent::created(vm("busy"), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| async { runner.is_active(&vm("busy")) }).await);

    let id = vm("win-01");
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert_eq!(controller.activity(&id), Activity::Queued);

    // When: it is deleted before a worker picks it up
    controller.submit(LifecycleEvent::deleted(id.clone(), ParamSet::new(), 1)).await.unwrap();

    // Then: only the finalizer runs
    assert!(eventually(|| async { resource(&controller, &id).await.is_none() }).await);
    let purposes: Vec<Purpose> = runner.runs_for(&id).iter().map(|r| r.purpose).collect();
    assert_eq!(purposes, vec![Purpose::Finalize]);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_remove_record_even_when_finalizer_fails() {
    // Given: a workflow that always fails
    let runner = ScriptedRunner::exiting(Duration::from_millis(1), 2);
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| async {
        status(&controller, &id).await.is_some_and(|s| s.phase == Phase::Failed)
    })
    .await);

    // When: it is deleted
    controller.submit(LifecycleEvent::deleted(id.clone(), ParamSet::new(), 1)).await.unwrap();

    // Then: the record still goes away
    assert!(eventually(|| async { resource(&controller, &id).await.is_none() }).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_ignore_delete_for_unknown_resource() {
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());

    let result = controller
        .submit(LifecycleEvent::deleted(vm("ghost"), ParamSet::new(), 1))
        .await;

    assert!(result.is_ok());
    assert!(runner.runs().is_empty());
}

#[tokio::test]
async fn should_recreate_resource_declared_while_finalizing() {
    // Given: a converged resource whose finalizer is slow
    let runner = ScriptedRunner::new(Duration::from_millis(300));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| succeeded_at(&controller, &id, 1)).await);
    assert!(eventually(|| async { controller.activity(&id) == Activity::Idle }).await);

    // When: it is deleted and declared again while the finalizer runs
    controller.submit(LifecycleEvent::deleted(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| async {
        runner.is_active(&id) && runner.runs_for(&id).last().is_some_and(|r| r.purpose == Purpose::Finalize)
    })
    .await);
    let recreated = controller
        .submit(LifecycleEvent::created(id.clone(), ParamSet::new().with("size", "l"), 1))
        .await;
    assert!(recreated.is_ok());

    // Then: the finalizer ran against the old spec
    let finalize = runner.runs_for(&id).into_iter().find(|r| r.purpose == Purpose::Finalize);
    assert!(finalize.is_some_and(|r| r.params.get_str("size").is_none()));

    // And: the new declaration is reconciled once the old record is gone
    assert!(eventually(|| async { runner.runs_for(&id).len() == 3 }).await);
    assert!(eventually(|| succeeded_at(&controller, &id, 1)).await);
    let purposes: Vec<Purpose> = runner.runs_for(&id).iter().map(|r| r.purpose).collect();
    assert_eq!(purposes, vec![Purpose::Reconcile, Purpose::Finalize, Purpose::Reconcile]);
    let stored = resource(&controller, &id).await;
    assert!(stored.as_ref().is_some_and(|r| !r.deletion_requested));
    assert_eq!(
        stored.as_ref().and_then(|r| r.spec.get_str("size").map(str::to_string)),
        Some("l".to_string())
    );
    assert_eq!(runner.max_concurrent(&id), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_drop_held_recreate_when_deleted_again() {
    // Given: a deletion finalizing with a re-create held behind it
    let runner = ScriptedRunner::new(Duration::from_millis(200));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| succeeded_at(&controller, &id, 1)).await);
    controller.submit(LifecycleEvent::deleted(id.clone(), ParamSet::new(), 1)).await.unwrap();
    controller
        .submit(LifecycleEvent::created(id.clone(), ParamSet::new().with("size", "l"), 1))
        .await
        .unwrap();

    // When: the resource is deleted again before finalization ends
    controller.submit(LifecycleEvent::deleted(id.clone(), ParamSet::new(), 1)).await.unwrap();

    // Then: it stays gone
    assert!(eventually(|| async {
        resource(&controller, &id).await.is_none() && controller.activity(&id) == Activity::Idle
    })
    .await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(resource(&controller, &id).await.is_none());
    let purposes: Vec<Purpose> = runner.runs_for(&id).iter().map(|r| r.purpose).collect();
    assert_eq!(purposes, vec![Purpose::Reconcile, Purpose::Finalize]);
    handle.shutdown().await;
}

// ============================================================================
// BEHAVIOR: Failure reporting
// ============================================================================

#[tokio::test]
async fn should_report_timeout_and_release_gate() {
    // Given: a workflow that outlives the ceiling
    let runner = ScriptedRunner::new(Duration::from_secs(30));
    let config = ReconcilerConfig {
        workflow_timeout: Duration::from_millis(100),
        ..config()
    };
    let controller = controller_with(config, runner.clone());
    let handle = controller.start();
    let id = vm("win-01");

    // When: it runs
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();

    // Then: status is Failed/Timeout and the gate is free
    assert!(eventually(|| async {
        status(&controller, &id)
            .await
            .is_some_and(|s| s.phase == Phase::Failed && s.reason == "Timeout")
    })
    .await);
    assert!(!controller.gate().is_held(&id));
    assert!(controller.gate().acquire(&id).is_ok());
    handle.shutdown().await;
}

#[tokio::test]
async fn should_report_workflow_failure() {
    let runner = ScriptedRunner::exiting(Duration::from_millis(1), 4);
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");

    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();

    assert!(eventually(|| async {
        status(&controller, &id)
            .await
            .is_some_and(|s| s.phase == Phase::Failed && s.reason == "WorkflowFailure")
    })
    .await);
    let ready = status(&controller, &id).await.and_then(|s| s.condition("Ready").cloned());
    assert!(ready.is_some_and(|c| c.status == playop_events::ConditionStatus::False));
    handle.shutdown().await;
}

#[tokio::test]
async fn should_fail_fast_on_configuration_error_without_running() {
    // Given: a workflow that requires vm_name
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let config = ReconcilerConfig::builder()
        .status_retry(fast_retry())
        .resync_interval(Duration::ZERO)
        .workflow("WindowsVM", WorkflowDefinition::playbook("vm.yml").require("vm_name"))
        .build()
        .unwrap();
    let controller = controller_with(config, runner.clone());
    let handle = controller.start();
    let id = vm("win-01");

    // When: the spec omits it
    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();

    // Then: Failed with ConfigurationError, and no workflow ran
    assert!(eventually(|| async {
        status(&controller, &id)
            .await
            .is_some_and(|s| s.phase == Phase::Failed && s.reason == "ConfigurationError")
    })
    .await);
    assert!(runner.runs().is_empty());
    handle.shutdown().await;
}

#[tokio::test]
async fn should_fail_unknown_kind_as_configuration_error() {
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = playop_core::ResourceId::new("PostgresCluster", "default", "pg");

    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();

    assert!(eventually(|| async {
        status(&controller, &id)
            .await
            .is_some_and(|s| s.reason == "ConfigurationError")
    })
    .await);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_skip_workflow_for_disabled_resource() {
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");

    controller
        .submit(LifecycleEvent::created(id.clone(), ParamSet::new().with("enabled", false), 1))
        .await
        .unwrap();

    assert!(eventually(|| async {
        status(&controller, &id)
            .await
            .is_some_and(|s| s.phase == Phase::Succeeded && s.reason == "Disabled")
    })
    .await);
    assert!(runner.runs().is_empty());
    handle.shutdown().await;
}

// ============================================================================
// BEHAVIOR: Variable resolution in the controller
// ============================================================================

#[tokio::test]
async fn should_take_blank_secret_from_bound_environment() {
    // Given: spec {password: ""} and WINDOWS_PASSWORD=secret
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = Controller::builder(config())
        .runner(runner.clone())
        .environment(Environment::new().with("WINDOWS_PASSWORD", "secret"))
        .build()
        .unwrap();
    let handle = controller.start();
    let id = vm("win-01");

    // When: it reconciles
    controller
        .submit(LifecycleEvent::created(id.clone(), ParamSet::new().with("password", ""), 1))
        .await
        .unwrap();

    // Then: the workflow received password=secret
    assert!(eventually(|| async { !runner.runs_for(&id).is_empty() }).await);
    assert_eq!(runner.runs_for(&id)[0].params.get_str("password"), Some("secret"));
    handle.shutdown().await;
}

#[tokio::test]
async fn should_prefer_spec_over_default() {
    // Given: spec {region: us-east} and default region=us-west
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");

    controller
        .submit(LifecycleEvent::created(id.clone(), ParamSet::new().with("region", "us-east"), 1))
        .await
        .unwrap();

    assert!(eventually(|| async { !runner.runs_for(&id).is_empty() }).await);
    assert_eq!(runner.runs_for(&id)[0].params.get_str("region"), Some("us-east"));
    handle.shutdown().await;
}

#[tokio::test]
async fn should_apply_startup_overrides_above_spec() {
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = Controller::builder(config())
        .runner(runner.clone())
        .environment(Environment::new())
        .overrides(ParamSet::new().with("region", "eu-central"))
        .build()
        .unwrap();
    let handle = controller.start();
    let id = vm("win-01");

    controller
        .submit(LifecycleEvent::created(id.clone(), ParamSet::new().with("region", "us-east"), 1))
        .await
        .unwrap();

    assert!(eventually(|| async { !runner.runs_for(&id).is_empty() }).await);
    assert_eq!(runner.runs_for(&id)[0].params.get_str("region"), Some("eu-central"));
    handle.shutdown().await;
}

// ============================================================================
// BEHAVIOR: Resync
// ============================================================================

#[tokio::test]
async fn should_resync_resources_that_were_never_reconciled() {
    // Given: a resource recorded in the store but never queued
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    let id = vm("win-01");
    controller.store().apply(&id, ParamSet::new(), 1).await.unwrap();

    // When: a resync runs
    let queued = controller.resync().await.unwrap();

    // Then: it is reconciled
    assert_eq!(queued, 1);
    assert!(eventually(|| succeeded_at(&controller, &id, 1)).await);
    assert!(eventually(|| async { controller.activity(&id) == Activity::Idle }).await);

    // And: a second resync leaves the converged resource alone
    assert_eq!(controller.resync().await.unwrap(), 0);
    handle.shutdown().await;
}

// ============================================================================
// BEHAVIOR: Log channel
// ============================================================================

#[tokio::test]
async fn should_tag_workflow_output_with_resource() {
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let mut subscription = controller.log().subscribe();
    let handle = controller.start();
    let id = vm("win-01");

    controller.submit(LifecycleEvent::created(id.clone(), ParamSet::new(), 1)).await.unwrap();
    assert!(eventually(|| succeeded_at(&controller, &id, 1)).await);

    let mut lines = Vec::new();
    while let Some(line) = subscription.try_recv() {
        lines.push(line);
    }
    assert!(lines.iter().any(|l| {
        l.source == playop_events::LogSource::Workflow
            && l.resource.as_ref() == Some(&id)
            && l.text == "PLAY RECAP"
    }));
    handle.shutdown().await;
}

// ============================================================================
// BEHAVIOR: Event intake
// ============================================================================

#[tokio::test]
async fn should_accept_events_while_status_store_is_down() {
    // Given: a store whose status writes fail, and a slow status retry budget
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let config = ReconcilerConfig {
        status_retry: fast_retry()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_millis(200)),
        ..config()
    };
    let controller = Controller::builder(config)
        .store(Arc::new(StatusOutageStore::new()))
        .runner(runner.clone())
        .environment(Environment::new())
        .build()
        .unwrap();
    let handle = controller.start();

    // When: several resources are declared and one is deleted
    for name in ["a", "b", "c"] {
        let submitted = tokio::time::timeout(
            Duration::from_millis(100),
            controller.submit(LifecycleEvent::created(vm(name), ParamSet::new(), 1)),
        )
        .await;
        // Then: intake never waits on status persistence
        assert!(submitted.is_ok_and(|r| r.is_ok()), "submit for {name} stalled");
    }
    let deleted = tokio::time::timeout(
        Duration::from_millis(100),
        controller.submit(LifecycleEvent::deleted(vm("c"), ParamSet::new(), 1)),
    )
    .await;
    assert!(deleted.is_ok_and(|r| r.is_ok()));

    // And: workflows still run
    assert!(eventually(|| async {
        !runner.runs_for(&vm("a")).is_empty() && !runner.runs_for(&vm("b")).is_empty()
    })
    .await);
    handle.shutdown().await;
}

#[tokio::test]
async fn should_reject_events_after_shutdown() {
    let runner = ScriptedRunner::new(Duration::from_millis(1));
    let controller = controller_with(config(), runner.clone());
    let handle = controller.start();
    handle.shutdown().await;

    let submitted = controller
        .submit(LifecycleEvent::created(vm("late"), ParamSet::new(), 1))
        .await;
    let retried = controller.retry(&vm("late")).await;

    assert!(matches!(submitted, Err(Error::LoopStopped)));
    assert!(matches!(retried, Err(Error::LoopStopped)));
    assert!(runner.runs().is_empty());
}
