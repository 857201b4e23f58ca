//! Several coordinator instances racing over one shared state directory.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use tempfile::TempDir;

use common::{coordinator, roomy_budget, Behavior, RecordingBackend, ScriptedTarget};
use taskmesh_coordinator::health::ComponentStatus;
use taskmesh_coordinator::Coordinator;
use taskmesh_core::{EventType, TaskStatus, TaskSubmission};

const TASKS: usize = 50;
const TOKENS: u64 = 500;

async fn instances(dir: &TempDir, backends: &[Arc<RecordingBackend>]) -> Vec<Coordinator> {
    let mut out = Vec::new();
    for (i, backend) in backends.iter().enumerate() {
        let mut config = common::config(dir.path(), &format!("coord-{i}"));
        config.budget = roomy_budget();
        out.push(coordinator(config, backend.clone()).await);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_tasks_three_instances_claimed_exactly_once() {
    let dir = TempDir::new().unwrap();
    let backends: Vec<_> = (0..3)
        .map(|_| RecordingBackend::new(Behavior::Complete(TOKENS)))
        .collect();
    let coordinators = instances(&dir, &backends).await;

    let submissions = (0..TASKS).map(|i| {
        let c = &coordinators[i % coordinators.len()];
        async move {
            c.submit(
                TaskSubmission::new(format!("fix bug {i} and add a unit test for the api"), "medium")
                    .with_id(format!("task-{i:02}")),
            )
            .await
        }
    });
    for result in join_all(submissions).await {
        result.unwrap();
    }

    for _ in 0..60 {
        let ticks = coordinators.iter().map(|c| c.tick());
        for result in join_all(ticks).await {
            result.unwrap();
        }
        let tasks = coordinators[0].pool().tasks().await.unwrap();
        if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            break;
        }
    }

    let tasks = coordinators[0].pool().tasks().await.unwrap();
    assert_eq!(tasks.len(), TASKS);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

    let launches: Vec<_> = backends.iter().flat_map(|b| b.launches()).collect();
    let distinct: HashSet<_> = launches.iter().map(|(task, _)| task.clone()).collect();
    assert_eq!(launches.len(), TASKS, "a task was launched twice");
    assert_eq!(distinct.len(), TASKS);

    let claims = coordinators[0]
        .bus()
        .events_between(None, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::TaskClaimed)
        .count();
    assert_eq!(claims, TASKS);

    let budget = coordinators[1].ledger().snapshot().await.unwrap();
    budget.check_invariants().unwrap();
    assert!(budget.reservations.is_empty());
    let used: u64 = budget.per_agent_class.values().map(|c| c.used).sum();
    assert_eq!(used, TASKS as u64 * TOKENS);
    assert_eq!(budget.global_used, TASKS as u64 * TOKENS);
    assert!(coordinators[2].pool().active_workers().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_spawns_launch_one_worker() {
    let dir = TempDir::new().unwrap();
    let backends: Vec<_> = (0..3)
        .map(|_| RecordingBackend::new(Behavior::Silent))
        .collect();
    let coordinators = instances(&dir, &backends).await;

    let task = coordinators[0]
        .submit(TaskSubmission::new("implement the api endpoint", "high").with_id("contested"))
        .await
        .unwrap();
    coordinators[0]
        .router()
        .route(&task)
        .await
        .unwrap();

    let spawns = coordinators.iter().map(|c| c.pool().spawn(&task.id));
    let spawned = join_all(spawns)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(taskmesh_coordinator::SpawnOutcome::Spawned(_))))
        .count();

    assert_eq!(spawned, 1);
    let launches: usize = backends.iter().map(|b| b.launches().len()).sum();
    assert_eq!(launches, 1);
    let running = coordinators[0]
        .pool()
        .active_workers()
        .await
        .unwrap()
        .into_iter()
        .filter(|w| w.parent_task_id == task.id)
        .count();
    assert_eq!(running, 1);
}

#[tokio::test]
async fn test_dead_instance_claims_are_taken_over() {
    let dir = TempDir::new().unwrap();
    let silent = RecordingBackend::new(Behavior::Silent);
    let mut dying_config = common::config(dir.path(), "coord-dying");
    dying_config.registry.stale_after_secs = 0;
    let dying = coordinator(dying_config, silent.clone()).await;

    let task = dying
        .submit(TaskSubmission::new("refactor the api code", "medium").with_id("orphan"))
        .await
        .unwrap();
    dying.tick().await.unwrap();
    assert_eq!(silent.launches().len(), 1);
    assert_eq!(
        dying.task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Running
    );

    // The survivor considers every instance stale immediately.
    let mut survivor_config = common::config(dir.path(), "coord-survivor");
    survivor_config.registry.stale_after_secs = 0;
    let survivor = coordinator(survivor_config, RecordingBackend::new(Behavior::Silent)).await;
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let reaped = survivor.registry().reap_stale().await.unwrap();
    let orphaned: Vec<_> = reaped
        .iter()
        .filter(|r| r.instance_id.as_str() == "coord-dying")
        .flat_map(|r| r.orphaned_tasks.clone())
        .collect();
    assert_eq!(orphaned, vec![task.id.clone()]);

    for task_id in &orphaned {
        assert!(survivor
            .pool()
            .reclaim_orphan(task_id, &taskmesh_core::InstanceId::new("coord-dying"))
            .await
            .unwrap());
    }
    let requeued = survivor.task(&task.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert!(requeued.claimed_by.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_component_remediated_once_across_instances() {
    let dir = TempDir::new().unwrap();
    let target = ScriptedTarget::new(
        ComponentStatus {
            replicas_ready: 0,
            ..ComponentStatus::default()
        },
        true,
    );
    let mut coordinators = Vec::new();
    for i in 0..3 {
        let mut config = common::config(dir.path(), &format!("coord-{i}"));
        config.health.components = vec!["api".to_string()];
        let c = Coordinator::new(config, RecordingBackend::new(Behavior::Silent), target.clone())
            .await
            .unwrap();
        c.start().await.unwrap();
        coordinators.push(c);
    }

    for _ in 0..3 {
        let ticks = coordinators.iter().map(|c| c.tick());
        for result in join_all(ticks).await {
            result.unwrap();
        }
    }

    assert_eq!(target.calls(), vec!["restart api", "scale api 1"]);
    let alerts = coordinators[0].alerts().list(true).await.unwrap();
    assert_eq!(alerts.iter().filter(|a| a.component == "api").count(), 1);
}
