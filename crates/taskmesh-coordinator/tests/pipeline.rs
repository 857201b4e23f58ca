//! Submit, route, spawn, monitor and remediate through the daemon cycle.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{coordinator, Behavior, RecordingBackend, ScriptedTarget};
use taskmesh_coordinator::health::ComponentStatus;
use taskmesh_coordinator::{request_stop, Coordinator, CoordinatorError, FnHandler};
use taskmesh_core::{
    AlertStatus, Event, EventType, RoutingStrategy, TaskStatus, TaskSubmission, Worker,
    WorkerStatus,
};

#[tokio::test]
async fn test_sql_injection_task_routed_to_security_and_completed() {
    let dir = TempDir::new().unwrap();
    let backend = RecordingBackend::new(Behavior::Complete(3_000));
    let c = coordinator(common::config(dir.path(), "coord-a"), backend.clone()).await;

    let task = c
        .submit(TaskSubmission::new("fix SQL injection vulnerability", "critical"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let report = c.tick().await.unwrap();
    assert_eq!(report.routed, 1);
    assert_eq!(report.spawned, 1);

    let decision = c.router().decision(&task.id).await.unwrap().unwrap();
    assert_eq!(decision.strategy, RoutingStrategy::Single);
    assert_eq!(decision.primary_agent_class.as_deref(), Some("security"));
    assert!(decision.primary_confidence() >= 0.8);

    let done = c.task(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.assigned_agent_class.as_deref(), Some("security"));

    let budget = c.ledger().snapshot().await.unwrap();
    assert_eq!(budget.per_agent_class["security"].used, 3_000);
    budget.check_invariants().unwrap();
}

#[tokio::test]
async fn test_submission_errors() {
    let dir = TempDir::new().unwrap();
    let c = coordinator(
        common::config(dir.path(), "coord-a"),
        RecordingBackend::new(Behavior::Silent),
    )
    .await;

    c.submit(TaskSubmission::new("write the readme guide", "low").with_id("docs-1"))
        .await
        .unwrap();
    let dup = c
        .submit(TaskSubmission::new("something else", "low").with_id("docs-1"))
        .await;
    assert!(matches!(dup, Err(CoordinatorError::DuplicateId(id)) if id == "docs-1"));

    let bad = c.submit(TaskSubmission::new("anything", "urgent")).await;
    assert!(matches!(bad, Err(CoordinatorError::InvalidPriority(_))));
}

#[tokio::test]
async fn test_insufficient_budget_leaves_task_pending() {
    let dir = TempDir::new().unwrap();
    let mut config = common::config(dir.path(), "coord-a");
    config.budget.allocations.insert("development".to_string(), 5_000);
    let backend = RecordingBackend::new(Behavior::Silent);
    let c = coordinator(config, backend.clone()).await;

    let mut submission = TaskSubmission::new("fix the bug in the api code", "medium");
    submission
        .metadata
        .insert("token_budget".to_string(), json!(8_000));
    let task = c.submit(submission).await.unwrap();

    let report = c.tick().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.spawned, 0);
    assert!(backend.launches().is_empty());

    let t = c.task(&task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert!(t.not_before.is_some());
    assert_eq!(t.retry_count, 0);

    let events = c.bus().events_between(None, None).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::BudgetInsufficient));
}

#[tokio::test]
async fn test_silent_worker_past_deadline_becomes_zombie() {
    let dir = TempDir::new().unwrap();
    let backend = RecordingBackend::new(Behavior::Silent);
    let c = coordinator(common::config(dir.path(), "coord-a"), backend.clone()).await;

    let mut submission = TaskSubmission::new("implement the api endpoint", "medium");
    submission
        .metadata
        .insert("deadline_secs".to_string(), json!(5));
    let task = c.submit(submission).await.unwrap();
    c.tick().await.unwrap();

    let (_, worker_id) = backend.launches()[0].clone();
    let active = format!("pool/active/{worker_id}");
    // Five seconds pass without a single heartbeat.
    c.store()
        .update(&active, |mut w: Worker| {
            let past = Utc::now() - chrono::Duration::seconds(6);
            w.started_at = Some(past);
            w.last_heartbeat = Some(past);
            w.deadline = past + chrono::Duration::seconds(5);
            Ok(w)
        })
        .await
        .unwrap();

    let monitor = c.pool().monitor_cycle().await.unwrap();
    assert_eq!(monitor.zombies, vec![worker_id.clone()]);

    let zombie = c.pool().worker(&worker_id).await.unwrap().unwrap();
    assert_eq!(zombie.status, WorkerStatus::Zombie);
    let t = c.task(&task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 1);

    let again = c.pool().monitor_cycle().await.unwrap();
    assert!(again.zombies.is_empty());
    assert_eq!(c.task(&task.id).await.unwrap().unwrap().retry_count, 1);
}

async fn with_target(dir: &TempDir, target: Arc<ScriptedTarget>) -> Coordinator {
    let mut config = common::config(dir.path(), "coord-a");
    config.health.components = vec!["api".to_string()];
    let c = Coordinator::new(config, RecordingBackend::new(Behavior::Silent), target)
        .await
        .unwrap();
    c.start().await.unwrap();
    c
}

fn no_replicas() -> ComponentStatus {
    ComponentStatus {
        replicas_ready: 0,
        recent_restarts: 0,
        recent_logs: Vec::new(),
    }
}

#[tokio::test]
async fn test_zero_replicas_scaled_and_alert_resolved() {
    let dir = TempDir::new().unwrap();
    let target = ScriptedTarget::new(no_replicas(), true);
    let c = with_target(&dir, target.clone()).await;

    let report = c.tick().await.unwrap();
    assert_eq!(report.health.len(), 1);
    assert!(report.health[0].success);
    assert!(target.calls().contains(&"scale api 1".to_string()));

    let alerts = c.alerts().list(true).await.unwrap();
    let alert = alerts.iter().find(|a| a.component == "api").unwrap();
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert!(c.alerts().open_for("api").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_remediation_keeps_alert_open() {
    let dir = TempDir::new().unwrap();
    let target = ScriptedTarget::new(no_replicas(), false);
    let c = with_target(&dir, target.clone()).await;

    let report = c.tick().await.unwrap();
    assert!(!report.health[0].success);

    let alert = c.alerts().open_for("api").await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Open);
    assert!(!alert.diagnosis.is_empty());

    // The next cycle is not due yet; the alert is not raised twice.
    let report = c.tick().await.unwrap();
    assert!(report.health.is_empty());
    assert_eq!(c.alerts().list(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replayed_event_applied_once() {
    let dir = TempDir::new().unwrap();
    let c = coordinator(
        common::config(dir.path(), "coord-a"),
        RecordingBackend::new(Behavior::Silent),
    )
    .await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    c.bus()
        .subscribe(
            "task.submitted",
            Arc::new(FnHandler::new("counter", move |_event: Event| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })),
        )
        .await;

    c.submit(TaskSubmission::new("update readme docs", "low"))
        .await
        .unwrap();
    c.bus().dispatch_once().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let submitted = c
        .bus()
        .events_between(None, None)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == EventType::TaskSubmitted)
        .unwrap();
    for _ in 0..2 {
        let report = c.bus().replay_ids(&[submitted.id]).await.unwrap();
        assert_eq!(report.replayed, 1);
    }
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_request_ends_run_and_hands_back_work() {
    let dir = TempDir::new().unwrap();
    let backend = RecordingBackend::new(Behavior::Silent);
    let c = Coordinator::new(
        common::config(dir.path(), "coord-a"),
        backend.clone(),
        Arc::new(taskmesh_coordinator::NoopTarget),
    )
    .await
    .unwrap();

    let task = c
        .submit(TaskSubmission::new("refactor the api code", "high"))
        .await
        .unwrap();
    c.start().await.unwrap();
    c.tick().await.unwrap();
    assert_eq!(backend.launches().len(), 1);

    request_stop(c.store(), c.instance_id(), "test").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), c.run(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    let t = c.task(&task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 0);
    assert!(c.registry().get(c.instance_id()).await.unwrap().is_none());
    assert!(!c
        .store()
        .exists(&taskmesh_coordinator::coordinator::stop_path(c.instance_id()))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_failed_passes_are_published_as_events() {
    let dir = TempDir::new().unwrap();
    let c = coordinator(
        common::config(dir.path(), "coord-a"),
        RecordingBackend::new(Behavior::Silent),
    )
    .await;

    let tasks = c.store().root().join("tasks");
    tokio::fs::create_dir_all(&tasks).await.unwrap();
    tokio::fs::write(tasks.join("broken.json"), b"{ not json")
        .await
        .unwrap();

    let report = c.tick().await.unwrap();
    assert_eq!(report.routed, 0);

    let errors: Vec<Event> = c
        .bus()
        .events_between(None, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::CoordinatorError)
        .collect();
    let passes: Vec<&str> = errors
        .iter()
        .filter_map(|e| e.payload["pass"].as_str())
        .collect();
    assert!(passes.contains(&"route"));
    assert!(passes.contains(&"spawn"));
    for e in &errors {
        assert_eq!(e.payload["instance_id"], "coord-a");
        assert!(!e.payload["error"].as_str().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_heartbeat_runs_between_slow_cycles() {
    let dir = TempDir::new().unwrap();
    let mut config = common::config(dir.path(), "coord-a");
    config.poll_interval_ms = 60_000;
    config.registry.heartbeat_interval_secs = 1;
    let c = coordinator(config, RecordingBackend::new(Behavior::Silent)).await;
    let started = c.registry().get(c.instance_id()).await.unwrap().unwrap();

    let shutdown = CancellationToken::new();
    let watcher = async {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let record = c.registry().get(c.instance_id()).await.unwrap().unwrap();
        shutdown.cancel();
        record
    };
    let (result, record) = tokio::join!(c.run(shutdown.clone()), watcher);
    result.unwrap();

    // Only the first cycle ran; the later heartbeat came from the loop.
    assert!(record.heartbeat_at >= started.heartbeat_at + chrono::Duration::milliseconds(900));
    assert!(c.registry().get(c.instance_id()).await.unwrap().is_none());
}
