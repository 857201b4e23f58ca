//! Worker pool manager.
//!
//! Spawns ephemeral workers for claimed tasks, tracks heartbeats and reclaims
//! workers that go silent or outlive their deadline. A task routed to a
//! single class gets one worker; a multi-class routing activates one worker
//! per class in parallel, and the task completes once all of them have.
//!
//! The primary worker holds the task lock `task-{id}`; each collaborator holds
//! `task-{id}-{class}`. Locks are taken at spawn and held until the worker
//! reaches a terminal state, so at most one attempt is ever active for a task
//! across all coordinator instances.
//!
//! Worker records live under `pool/active/{id}` while active and are archived
//! to `pool/completed` or `pool/failed` once terminal. Every status change is
//! a compare-and-set on the record, which is what makes reclamation happen
//! exactly once when several instances race.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use taskmesh_core::{
    Assignment, CoreError, Directive, EventType, ExecutionOutcome, InstanceId, NewEvent,
    OutcomeStatus, Priority, ReserveRequest, RoutingDecision, RoutingStrategy, Task, TaskId,
    TaskStatus, Worker, WorkerId, WorkerSpec, WorkerStatus,
};

use crate::bus::EventBus;
use crate::config::PoolConfig;
use crate::error::{CoordinatorError, Result};
use crate::executor::{ExecutionBackend, WorkerContext, WorkerReporter};
use crate::ledger::TokenLedger;
use crate::lock::{Lock, LockManager};
use crate::registry::InstanceRegistry;
use crate::router::decision_path;
use crate::store::{task_path, StateStore};

const ACTIVE_DIR: &str = "pool/active";
const COMPLETED_DIR: &str = "pool/completed";
const FAILED_DIR: &str = "pool/failed";
const STATS_PATH: &str = "pool/stats";
const TASK_DIR: &str = "tasks";

/// Name of the lock guarding a task's claim.
pub fn task_lock_name(task_id: &TaskId) -> String {
    format!("task-{task_id}")
}

/// Name of the lock held by a task's collaborating `class` worker.
pub fn collaborator_lock_name(task_id: &TaskId, class: &str) -> String {
    format!("task-{task_id}-{class}")
}

/// Duration history backing the heartbeat timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Recent completed worker durations, oldest first.
    pub durations_secs: Vec<f64>,
    /// Derived timeout; `None` until enough history exists.
    pub heartbeat_timeout_secs: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of a spawn attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    /// Workers launched and running, primary class first.
    Spawned(Vec<Worker>),
    /// Another instance holds the task lock or a collaborator lock.
    Busy,
    /// Task is not pending, is backing off, or has no agent class yet.
    NotClaimable,
    /// The task needs more workers than the caller has room for.
    AtCapacity { needed: usize },
    /// Ledger refused a reservation; the task stays pending with backoff.
    BudgetDeferred { requested: u64, available: u64 },
    /// Backend refused a launch; the task went through the retry path.
    LaunchFailed(String),
}

/// What one monitor cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    pub zombies: Vec<WorkerId>,
    pub finalized: usize,
    pub expired_reservations: usize,
    pub orphans_requeued: Vec<TaskId>,
}

/// Spawns, supervises and reclaims workers for this instance.
#[derive(Clone)]
pub struct PoolManager {
    store: StateStore,
    locks: LockManager,
    ledger: TokenLedger,
    bus: EventBus,
    registry: InstanceRegistry,
    backend: Arc<dyn ExecutionBackend>,
    config: PoolConfig,
    instance: InstanceId,
}

impl PoolManager {
    pub fn new(
        store: StateStore,
        locks: LockManager,
        ledger: TokenLedger,
        bus: EventBus,
        registry: InstanceRegistry,
        backend: Arc<dyn ExecutionBackend>,
        config: PoolConfig,
    ) -> Self {
        let instance = registry.instance_id().clone();
        Self {
            store,
            locks,
            ledger,
            bus,
            registry,
            backend,
            config,
            instance,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Claim `task_id` and launch its workers.
    pub async fn spawn(&self, task_id: &TaskId) -> Result<SpawnOutcome> {
        self.spawn_within(task_id, usize::MAX).await
    }

    /// Like [`spawn`](Self::spawn), but only if the task needs at most
    /// `capacity` workers.
    pub async fn spawn_within(&self, task_id: &TaskId, capacity: usize) -> Result<SpawnOutcome> {
        let lock = match self.locks.try_acquire(&task_lock_name(task_id)).await {
            Ok(lock) => lock,
            Err(CoordinatorError::Busy { .. }) => {
                debug!(%task_id, "Task lock busy, skipping");
                return Ok(SpawnOutcome::Busy);
            }
            Err(e) => return Err(e),
        };

        let result = self.spawn_locked(task_id, &lock, capacity).await;
        // Spawned workers own their locks until they are finalized.
        let keep = matches!(
            result,
            Ok(SpawnOutcome::Spawned(_)) | Ok(SpawnOutcome::LaunchFailed(_))
        );
        if !keep {
            if let Err(e) = self.locks.release(&lock).await {
                warn!(%task_id, error = %e, "Failed to release task lock");
            }
        }
        result
    }

    async fn spawn_locked(&self, task_id: &TaskId, lock: &Lock, capacity: usize) -> Result<SpawnOutcome> {
        let now = Utc::now();
        let task: Task = self.store.require(&task_path(task_id)).await?;
        let Some(class) = task.assigned_agent_class.clone() else {
            return Ok(SpawnOutcome::NotClaimable);
        };
        if !task.is_claimable(now) {
            return Ok(SpawnOutcome::NotClaimable);
        }
        let classes = self.activated_classes(&task, &class).await?;
        if classes.len() > capacity {
            debug!(%task_id, needed = classes.len(), capacity, "Not enough pool capacity for task");
            return Ok(SpawnOutcome::AtCapacity {
                needed: classes.len(),
            });
        }

        let mut claims = vec![lock.clone()];
        for collaborator in &classes[1..] {
            match self
                .locks
                .try_acquire(&collaborator_lock_name(task_id, collaborator))
                .await
            {
                Ok(l) => claims.push(l),
                Err(e) => {
                    self.release_locks(&claims[1..]).await;
                    return match e {
                        CoordinatorError::Busy { .. } => Ok(SpawnOutcome::Busy),
                        e => Err(e),
                    };
                }
            }
        }

        let token_budget = task
            .metadata
            .get("token_budget")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| self.config.token_budget_for(&task.task_type));
        let deadline_secs = task
            .metadata
            .get("deadline_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.config.default_deadline_secs);
        let deadline = now + Duration::seconds(deadline_secs as i64);

        let mut workers = Vec::with_capacity(classes.len());
        for (class, claim) in classes.iter().zip(&claims) {
            match self
                .stage_worker(&task, class, claim, token_budget, deadline)
                .await
            {
                Ok(w) => workers.push(w),
                Err(e) => {
                    self.discard(&workers).await?;
                    self.release_locks(&claims[1..]).await;
                    return match e {
                        CoordinatorError::InsufficientBudget {
                            class,
                            requested,
                            available,
                        } => {
                            self.defer_for_budget(&task, &class, requested, available)
                                .await?;
                            Ok(SpawnOutcome::BudgetDeferred {
                                requested,
                                available,
                            })
                        }
                        CoordinatorError::Core(CoreError::UnknownAgentClass(_)) => {
                            self.block(task_id, &format!("no budget allocation for agent class '{class}'"))
                                .await?;
                            Ok(SpawnOutcome::NotClaimable)
                        }
                        e => Err(e),
                    };
                }
            }
        }

        match self.claim_and_launch(&task, workers.clone(), &classes).await {
            Ok(SpawnOutcome::NotClaimable) => {
                self.release_locks(&claims[1..]).await;
                Ok(SpawnOutcome::NotClaimable)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(%task_id, error = %e, "Spawn aborted");
                for worker in &workers {
                    self.abort(&worker.id, WorkerStatus::Failed, &format!("spawn aborted: {e}"), false)
                        .await?;
                }
                Err(e)
            }
        }
    }

    /// Classes that get a worker for `task`, primary first. Collaborators
    /// come from a multi-class routing decision for the same primary.
    async fn activated_classes(&self, task: &Task, primary: &str) -> Result<Vec<String>> {
        let decision: Option<RoutingDecision> = self.store.get(&decision_path(&task.id)).await?;
        let mut classes = vec![primary.to_string()];
        if let Some(d) = decision.filter(|d| {
            d.strategy == RoutingStrategy::Multi && d.primary_agent_class.as_deref() == Some(primary)
        }) {
            for class in d.secondary_agent_classes {
                if !classes.contains(&class) {
                    classes.push(class);
                }
            }
        }
        Ok(classes)
    }

    /// Reserve budget and write the pending record for one worker.
    async fn stage_worker(
        &self,
        task: &Task,
        class: &str,
        claim: &Lock,
        token_budget: u64,
        deadline: DateTime<Utc>,
    ) -> Result<Worker> {
        let worker_id = WorkerId::generate();
        let reservation = self
            .ledger
            .reserve(ReserveRequest {
                class: class.to_string(),
                amount: token_budget,
                critical: task.priority == Priority::Critical,
                worker_id: Some(worker_id.clone()),
                expires_at: deadline,
            })
            .await?;

        let mut worker = Worker::new(
            class,
            task.id.clone(),
            token_budget,
            deadline,
            reservation.id.clone(),
            self.instance.clone(),
        );
        worker.id = worker_id.clone();
        worker.claim_lock = Some(claim.name.clone());
        worker.claim_token = Some(claim.token.clone());
        if let Err(e) = self.store.create(&active_path(&worker_id), &worker).await {
            self.ledger.release(&reservation.id).await?;
            return Err(e);
        }
        Ok(worker)
    }

    /// Undo staged workers that never got attached to the task.
    async fn discard(&self, workers: &[Worker]) -> Result<()> {
        for worker in workers {
            match self.store.remove(&active_path(&worker.id)).await {
                Ok(_) | Err(CoordinatorError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            self.ledger.release(&worker.reservation_id).await?;
        }
        Ok(())
    }

    async fn release_locks(&self, locks: &[Lock]) {
        for lock in locks {
            if let Err(e) = self.locks.release(lock).await {
                warn!(lock = %lock.name, error = %e, "Failed to release lock");
            }
        }
    }

    async fn claim_and_launch(
        &self,
        task: &Task,
        workers: Vec<Worker>,
        classes: &[String],
    ) -> Result<SpawnOutcome> {
        let task_id = &task.id;
        let assignments: Vec<Assignment> = workers
            .iter()
            .map(|w| Assignment::new(w.worker_type.clone(), w.id.clone()))
            .collect();
        let worker_ids: Vec<&WorkerId> = workers.iter().map(|w| &w.id).collect();
        let claimed = self
            .update_task(task_id, |t| {
                if !t.is_claimable(Utc::now()) {
                    return Ok(false);
                }
                t.transition(TaskStatus::Claimed)?;
                t.claimed_by = Some(self.instance.clone());
                t.workers = assignments.clone();
                Ok(true)
            })
            .await?;
        if claimed.is_none() {
            // Cancelled or reassigned between the read and the claim.
            self.discard(&workers).await?;
            return Ok(SpawnOutcome::NotClaimable);
        }
        self.registry.add_claim(task_id).await?;
        self.bus
            .emit(
                NewEvent::new(EventType::TaskClaimed, self.instance.to_string())
                    .correlated(task_id.as_str())
                    .with_priority(task.priority)
                    .with_payload(json!({
                        "task_id": task_id,
                        "worker_ids": worker_ids,
                        "classes": classes,
                        "instance_id": self.instance,
                    })),
            )
            .await;

        let now = Utc::now();
        let mut started = Vec::with_capacity(workers.len());
        for worker in &workers {
            let worker_id = &worker.id;
            let worker = self
                .update_worker(worker_id, &[WorkerStatus::Pending], |w| w.start(now))
                .await?
                .ok_or_else(|| CoordinatorError::Conflict(format!("worker {worker_id} changed during spawn")))?;
            started.push(worker);
        }
        let primary = &workers[0].id;
        self.update_task(task_id, |t| {
            if t.status != TaskStatus::Claimed || t.primary_worker() != Some(primary) {
                return Ok(false);
            }
            t.transition(TaskStatus::Running)?;
            Ok(true)
        })
        .await?;

        for worker in &started {
            info!(
                %task_id,
                worker_id = %worker.id,
                worker_type = %worker.worker_type,
                token_budget = worker.token_budget,
                deadline = %worker.deadline,
                "Worker spawned"
            );
            self.bus
                .emit(
                    NewEvent::new(EventType::WorkerSpawned, self.instance.to_string())
                        .correlated(task_id.as_str())
                        .with_payload(json!({
                            "task_id": task_id,
                            "worker_id": worker.id,
                            "type": worker.worker_type,
                            "token_budget": worker.token_budget,
                        })),
                )
                .await;
        }

        let backoff = self.config.launch_retry.backoff();
        for worker in &started {
            let spec = self.worker_spec(task, worker, classes);
            let ctx = WorkerContext::new(worker.id.clone(), Arc::new(self.clone()));
            let launched = backoff
                .retry("worker launch", || self.backend.launch(spec.clone(), ctx.clone()))
                .await;
            if let Err(e) = launched {
                let reason = format!("launch failed: {e}");
                warn!(%task_id, worker_id = %worker.id, error = %e, "Backend refused worker launch");
                self.complete(&worker.id, ExecutionOutcome::failed(0, reason.clone()))
                    .await?;
                return Ok(SpawnOutcome::LaunchFailed(reason));
            }
        }
        Ok(SpawnOutcome::Spawned(started))
    }

    fn worker_spec(&self, task: &Task, worker: &Worker, classes: &[String]) -> WorkerSpec {
        let deliverables = task
            .metadata
            .get("deliverables")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        WorkerSpec {
            worker_id: worker.id.clone(),
            worker_type: worker.worker_type.clone(),
            task_id: task.id.clone(),
            token_budget: worker.token_budget,
            deadline: worker.deadline,
            deliverables,
            description: task.description.clone(),
            collaborating_classes: classes
                .iter()
                .filter(|c| *c != &worker.worker_type)
                .cloned()
                .collect(),
        }
    }

    async fn defer_for_budget(
        &self,
        task: &Task,
        class: &str,
        requested: u64,
        available: u64,
    ) -> Result<()> {
        let not_before = Utc::now() + Duration::seconds(self.config.budget_backoff_secs as i64);
        self.update_task(&task.id, |t| {
            if t.status != TaskStatus::Pending {
                return Ok(false);
            }
            t.not_before = Some(not_before);
            Ok(true)
        })
        .await?;
        info!(
            task_id = %task.id,
            class,
            requested,
            available,
            retry_at = %not_before,
            "Insufficient budget, task stays pending"
        );
        self.bus
            .emit(
                NewEvent::new(EventType::BudgetInsufficient, self.instance.to_string())
                    .correlated(task.id.as_str())
                    .with_priority(task.priority)
                    .with_payload(json!({
                        "task_id": task.id,
                        "class": class,
                        "requested": requested,
                        "available": available,
                        "not_before": not_before,
                    })),
            )
            .await;
        Ok(())
    }

    async fn block(&self, task_id: &TaskId, reason: &str) -> Result<()> {
        let blocked = self
            .update_task(task_id, |t| {
                if t.status != TaskStatus::Pending {
                    return Ok(false);
                }
                t.transition(TaskStatus::Blocked)?;
                t.reason = Some(reason.to_string());
                Ok(true)
            })
            .await?;
        if blocked.is_some() {
            warn!(%task_id, reason, "Task blocked");
        }
        Ok(())
    }

    /// Record a heartbeat. Answers `Cancel` when the worker should stop.
    pub async fn heartbeat(&self, worker_id: &WorkerId, tokens_used: u64) -> Result<Directive> {
        let now = Utc::now();
        let Some(worker) = self
            .update_worker(worker_id, &[WorkerStatus::Running], |w| {
                w.last_heartbeat = Some(now);
                w.tokens_used = w.tokens_used.max(tokens_used);
            })
            .await?
        else {
            debug!(%worker_id, "Heartbeat from inactive worker");
            return Ok(Directive::Cancel);
        };
        if worker.cancel_requested || now >= worker.deadline {
            return Ok(Directive::Cancel);
        }
        let task: Option<Task> = self.store.get(&task_path(&worker.parent_task_id)).await?;
        let attached = task.is_some_and(|t| !t.cancel_requested && t.is_working(worker_id));
        Ok(if attached {
            Directive::Continue
        } else {
            Directive::Cancel
        })
    }

    /// Apply a worker's terminal outcome.
    ///
    /// Completion commits actual usage; failure goes through the retry path.
    /// Outcomes for workers that were already reclaimed are ignored.
    pub async fn complete(&self, worker_id: &WorkerId, outcome: ExecutionOutcome) -> Result<()> {
        let now = Utc::now();
        let to = match outcome.status {
            OutcomeStatus::Completed => WorkerStatus::Completed,
            OutcomeStatus::Failed => WorkerStatus::Failed,
        };
        let Some(worker) = self
            .update_worker(
                worker_id,
                &[WorkerStatus::Pending, WorkerStatus::Running],
                |w| {
                    w.status = to;
                    w.finished_at = Some(now);
                    w.tokens_used = w.tokens_used.max(outcome.tokens_used);
                    w.error = outcome.error.clone();
                },
            )
            .await?
        else {
            debug!(%worker_id, "Outcome for inactive worker ignored");
            return Ok(());
        };
        self.settle(&worker).await?;

        match outcome.status {
            OutcomeStatus::Completed => {
                let result = outcome.result.clone().unwrap_or(Value::Null);
                let task = self
                    .update_task(&worker.parent_task_id, |t| {
                        if !t.is_working(&worker.id) {
                            return Ok(false);
                        }
                        if t.status == TaskStatus::Claimed {
                            t.transition(TaskStatus::Running)?;
                        }
                        if t.primary_worker() == Some(&worker.id) {
                            t.metadata.insert("result".to_string(), result.clone());
                        }
                        if t.workers.len() > 1 {
                            let results = t
                                .metadata
                                .entry("results".to_string())
                                .or_insert_with(|| json!({}));
                            if let Some(results) = results.as_object_mut() {
                                results.insert(worker.worker_type.clone(), result.clone());
                            }
                        }
                        if !t.mark_completed(&worker.id) {
                            return Ok(true);
                        }
                        if t.cancel_requested {
                            t.transition(TaskStatus::Cancelled)?;
                            t.reason = Some("cancelled by operator".to_string());
                        } else {
                            t.transition(TaskStatus::Completed)?;
                            t.reason = None;
                        }
                        Ok(true)
                    })
                    .await?;
                self.record_duration(&worker).await?;
                self.finalize(&worker).await?;

                match task {
                    Some(task) if task.is_terminal() => {
                        let event_type = if task.status == TaskStatus::Cancelled {
                            EventType::TaskCancelled
                        } else {
                            EventType::TaskCompleted
                        };
                        info!(
                            task_id = %task.id,
                            %worker_id,
                            tokens_used = worker.tokens_used,
                            status = %task.status,
                            "Worker finished"
                        );
                        self.bus
                            .emit(
                                NewEvent::new(event_type, self.instance.to_string())
                                    .correlated(task.id.as_str())
                                    .with_priority(task.priority)
                                    .with_payload(json!({
                                        "task_id": task.id,
                                        "worker_id": worker_id,
                                        "tokens_used": worker.tokens_used,
                                    })),
                            )
                            .await;
                    }
                    Some(task) => {
                        info!(
                            task_id = %task.id,
                            %worker_id,
                            class = %worker.worker_type,
                            tokens_used = worker.tokens_used,
                            "Collaborator finished, waiting on the rest"
                        );
                    }
                    None => {}
                }
            }
            OutcomeStatus::Failed => {
                let reason = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker failed".to_string());
                warn!(task_id = %worker.parent_task_id, %worker_id, error = %reason, "Worker failed");
                self.retry_or_fail(&worker.parent_task_id, Some(worker_id), &reason, true)
                    .await?;
                self.finalize(&worker).await?;
            }
        }
        Ok(())
    }

    /// Mark an active worker zombie and reclaim its task.
    ///
    /// Returns false if the worker was already terminal, which makes racing
    /// reclaims from several instances apply exactly once.
    pub async fn reclaim(&self, worker_id: &WorkerId, reason: &str, count_retry: bool) -> Result<bool> {
        self.abort(worker_id, WorkerStatus::Zombie, reason, count_retry)
            .await
    }

    async fn abort(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
        reason: &str,
        count_retry: bool,
    ) -> Result<bool> {
        let now = Utc::now();
        let Some(worker) = self
            .update_worker(
                worker_id,
                &[WorkerStatus::Pending, WorkerStatus::Running],
                |w| {
                    w.status = status;
                    w.finished_at = Some(now);
                    w.error = Some(reason.to_string());
                },
            )
            .await?
        else {
            return Ok(false);
        };
        self.settle(&worker).await?;

        if status == WorkerStatus::Zombie {
            warn!(
                task_id = %worker.parent_task_id,
                %worker_id,
                silence_secs = worker.silence(now).num_seconds(),
                reason,
                "Worker reclaimed as zombie"
            );
            self.bus
                .emit(
                    NewEvent::new(EventType::WorkerZombie, self.instance.to_string())
                        .correlated(worker.parent_task_id.as_str())
                        .with_priority(Priority::High)
                        .with_payload(json!({
                            "task_id": worker.parent_task_id,
                            "worker_id": worker_id,
                            "instance_id": worker.instance_id,
                            "reason": reason,
                            "tokens_used": worker.tokens_used,
                        })),
                )
                .await;
        }
        self.retry_or_fail(&worker.parent_task_id, Some(worker_id), reason, count_retry)
            .await?;
        self.finalize(&worker).await?;
        Ok(true)
    }

    /// Commit what the worker reported using.
    async fn settle(&self, worker: &Worker) -> Result<()> {
        match self
            .ledger
            .commit(&worker.reservation_id, worker.tokens_used)
            .await
        {
            Ok(receipt) => {
                debug!(
                    worker_id = %worker.id,
                    charged = receipt.charged,
                    released = receipt.released,
                    "Reservation committed"
                );
                Ok(())
            }
            Err(CoordinatorError::Core(CoreError::ReservationNotFound(_))) => {
                warn!(
                    worker_id = %worker.id,
                    reservation_id = %worker.reservation_id,
                    tokens_used = worker.tokens_used,
                    "Reservation already settled or expired"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release everything a terminal worker still holds. Safe to repeat.
    async fn finalize(&self, worker: &Worker) -> Result<()> {
        self.ledger.release(&worker.reservation_id).await?;

        if worker.status.is_terminal() {
            let dir = if worker.status == WorkerStatus::Completed {
                COMPLETED_DIR
            } else {
                FAILED_DIR
            };
            match self
                .store
                .rename(&active_path(&worker.id), &format!("{dir}/{}", worker.id))
                .await
            {
                Ok(()) | Err(CoordinatorError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let task_id = &worker.parent_task_id;
        if let Some(token) = &worker.claim_token {
            let name = worker
                .claim_lock
                .clone()
                .unwrap_or_else(|| task_lock_name(task_id));
            self.locks.release_token(&name, token).await?;
        }
        // The instance keeps its claim while another worker of an attempt it
        // owns is still going.
        let task: Option<Task> = self.store.get(&task_path(task_id)).await?;
        let still_claimed = task.is_some_and(|t| {
            matches!(t.status, TaskStatus::Claimed | TaskStatus::Running)
                && t.claimed_by.as_ref() == Some(&worker.instance_id)
                && t.workers
                    .iter()
                    .any(|a| a.worker_id != worker.id && !a.completed)
        });
        if !still_claimed {
            self.registry.remove_claim(&worker.instance_id, task_id).await?;
        }
        Ok(())
    }

    /// Return a task to pending or fail it permanently, stopping every other
    /// worker of the abandoned attempt.
    ///
    /// With `worker` set, only applies while that worker is still attached to
    /// the task. A pending cancellation wins over any retry.
    async fn retry_or_fail(
        &self,
        task_id: &TaskId,
        worker: Option<&WorkerId>,
        reason: &str,
        count_retry: bool,
    ) -> Result<Option<Task>> {
        let max_retries = self.config.max_retries;
        let not_before = Utc::now() + Duration::seconds(self.config.retry_backoff_secs as i64);
        let mut siblings = Vec::new();
        let task = self
            .update_task(task_id, |t| {
                if !matches!(t.status, TaskStatus::Claimed | TaskStatus::Running) {
                    return Ok(false);
                }
                if let Some(w) = worker {
                    if !t.is_attached(w) {
                        return Ok(false);
                    }
                }
                siblings = t
                    .workers
                    .iter()
                    .filter(|a| !a.completed && Some(&a.worker_id) != worker)
                    .map(|a| a.worker_id.clone())
                    .collect();
                if t.cancel_requested {
                    t.transition(TaskStatus::Cancelled)?;
                    t.reason = Some("cancelled by operator".to_string());
                    return Ok(true);
                }
                if count_retry {
                    t.retry_count += 1;
                }
                if t.retry_count > max_retries {
                    t.transition(TaskStatus::Failed)?;
                    t.reason = Some(format!("retries exhausted: {reason}"));
                } else {
                    t.requeue(count_retry.then_some(not_before))?;
                    t.reason = Some(reason.to_string());
                }
                Ok(true)
            })
            .await?;
        let Some(task) = task else {
            return Ok(None);
        };

        let event_type = match task.status {
            TaskStatus::Cancelled => EventType::TaskCancelled,
            TaskStatus::Failed => {
                warn!(%task_id, retry_count = task.retry_count, reason, "Task failed permanently");
                EventType::TaskFailed
            }
            _ => {
                info!(%task_id, retry_count = task.retry_count, reason, "Task returned to pending");
                EventType::TaskRequeued
            }
        };
        self.bus
            .emit(
                NewEvent::new(event_type, self.instance.to_string())
                    .correlated(task_id.as_str())
                    .with_priority(task.priority)
                    .with_payload(json!({
                        "task_id": task_id,
                        "worker_id": worker,
                        "retry_count": task.retry_count,
                        "reason": reason,
                    })),
            )
            .await;
        self.release_siblings(&siblings, reason).await?;
        Ok(Some(task))
    }

    /// Fail the remaining workers of an attempt that was abandoned. Their
    /// next heartbeat answers `Cancel`.
    async fn release_siblings(&self, siblings: &[WorkerId], reason: &str) -> Result<()> {
        let now = Utc::now();
        for sibling in siblings {
            let Some(worker) = self
                .update_worker(
                    sibling,
                    &[WorkerStatus::Pending, WorkerStatus::Running],
                    |w| {
                        w.status = WorkerStatus::Failed;
                        w.finished_at = Some(now);
                        w.cancel_requested = true;
                        w.error = Some(format!("attempt abandoned: {reason}"));
                    },
                )
                .await?
            else {
                continue;
            };
            info!(task_id = %worker.parent_task_id, worker_id = %sibling, "Sibling worker stopped");
            self.settle(&worker).await?;
            self.finalize(&worker).await?;
        }
        Ok(())
    }

    /// Detect zombies, expire reservations and requeue orphaned claims.
    pub async fn monitor_cycle(&self) -> Result<MonitorReport> {
        let now = Utc::now();
        let timeout = self.heartbeat_timeout().await?;
        let mut report = MonitorReport::default();

        for worker in self.active_workers().await? {
            if worker.status.is_terminal() {
                self.finalize(&worker).await?;
                report.finalized += 1;
                continue;
            }
            let reason = if now >= worker.deadline {
                Some("deadline exceeded".to_string())
            } else if worker.silence(now) > timeout {
                Some(format!(
                    "no heartbeat for {}s (timeout {}s)",
                    worker.silence(now).num_seconds(),
                    timeout.num_seconds()
                ))
            } else {
                None
            };
            if let Some(reason) = reason {
                if self.reclaim(&worker.id, &reason, true).await? {
                    report.zombies.push(worker.id.clone());
                }
            }
        }

        report.expired_reservations = self.ledger.expire_reservations(now).await?.len();

        for task in self.tasks().await? {
            if !matches!(task.status, TaskStatus::Claimed | TaskStatus::Running)
                || now - task.updated_at <= timeout
            {
                continue;
            }
            if self
                .recover_orphan(&task.id, "claim orphaned without an active worker")
                .await?
            {
                report.orphans_requeued.push(task.id.clone());
            }
        }

        if !report.zombies.is_empty() || !report.orphans_requeued.is_empty() {
            info!(
                zombies = report.zombies.len(),
                orphans = report.orphans_requeued.len(),
                expired_reservations = report.expired_reservations,
                "Monitor cycle reclaimed work"
            );
        }
        Ok(report)
    }

    /// Take over a claim left behind by a reaped instance.
    pub async fn reclaim_orphan(&self, task_id: &TaskId, dead_instance: &InstanceId) -> Result<bool> {
        let Some(task) = self.store.get::<Task>(&task_path(task_id)).await? else {
            return Ok(false);
        };
        let mut live_elsewhere = false;
        for assignment in &task.workers {
            let Some(worker) = self.store.get::<Worker>(&active_path(&assignment.worker_id)).await? else {
                continue;
            };
            if !worker.status.is_active() {
                continue;
            }
            if &worker.instance_id != dead_instance {
                live_elsewhere = true;
                continue;
            }
            if self
                .reclaim(&worker.id, &format!("owning instance {dead_instance} reaped"), true)
                .await?
            {
                return Ok(true);
            }
        }
        if live_elsewhere {
            return Ok(false);
        }
        self.recover_orphan(task_id, &format!("claim orphaned by reaped instance {dead_instance}"))
            .await
    }

    /// Requeue a claimed/running task that has no active worker, under its
    /// task lock.
    async fn recover_orphan(&self, task_id: &TaskId, reason: &str) -> Result<bool> {
        let lock = match self.locks.try_acquire(&task_lock_name(task_id)).await {
            Ok(lock) => lock,
            Err(CoordinatorError::Busy { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let result = async {
            let Some(task) = self.store.get::<Task>(&task_path(task_id)).await? else {
                return Ok(false);
            };
            if !matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
                return Ok(false);
            }
            for assignment in &task.workers {
                let active: Option<Worker> = self.store.get(&active_path(&assignment.worker_id)).await?;
                if active.is_some_and(|w| w.status.is_active()) {
                    return Ok(false);
                }
            }
            let requeued = self.retry_or_fail(task_id, None, reason, true).await?;
            if let Some(owner) = &task.claimed_by {
                self.registry.remove_claim(owner, task_id).await?;
            }
            Ok(requeued.is_some())
        }
        .await;
        self.locks.release(&lock).await?;
        result
    }

    /// Current heartbeat timeout: P95 of recent durations with margin, or the
    /// configured default until enough history exists.
    pub async fn heartbeat_timeout(&self) -> Result<Duration> {
        let stats: PoolStats = self.store.get(STATS_PATH).await?.unwrap_or_default();
        let secs = stats
            .heartbeat_timeout_secs
            .unwrap_or(self.config.default_heartbeat_timeout_secs);
        Ok(Duration::seconds(secs as i64))
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        Ok(self.store.get(STATS_PATH).await?.unwrap_or_default())
    }

    async fn record_duration(&self, worker: &Worker) -> Result<()> {
        let Some(duration) = worker.duration() else {
            return Ok(());
        };
        let secs = duration.num_milliseconds().max(0) as f64 / 1000.0;
        let window = self.config.history_window.max(1);
        let min_history = self.config.min_history;
        let margin = self.config.heartbeat_margin;
        let floor = 2 * self.config.heartbeat_interval_secs;
        let stats = self
            .store
            .write_atomic(STATS_PATH, |current: Option<PoolStats>| {
                let mut stats = current.unwrap_or_default();
                stats.durations_secs.push(secs);
                let excess = stats.durations_secs.len().saturating_sub(window);
                stats.durations_secs.drain(..excess);
                stats.heartbeat_timeout_secs = (stats.durations_secs.len() >= min_history)
                    .then(|| p95(&stats.durations_secs))
                    .flatten()
                    .map(|p| ((p * margin).ceil() as u64).max(floor));
                stats.updated_at = Some(Utc::now());
                Ok(stats)
            })
            .await?;
        debug!(
            samples = stats.durations_secs.len(),
            heartbeat_timeout_secs = ?stats.heartbeat_timeout_secs,
            "Pool stats updated"
        );
        Ok(())
    }

    /// Cancel a task. Pending and blocked tasks cancel immediately; a running
    /// worker sees the flag at its next heartbeat.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task> {
        let mut running = Vec::new();
        let task = self
            .store
            .update(&task_path(task_id), |mut t: Task| {
                running.clear();
                match t.status {
                    TaskStatus::Pending | TaskStatus::Blocked => {
                        t.transition(TaskStatus::Cancelled)?;
                        t.reason = Some("cancelled by operator".to_string());
                    }
                    TaskStatus::Claimed | TaskStatus::Running => {
                        t.cancel_requested = true;
                        running = t
                            .workers
                            .iter()
                            .filter(|a| !a.completed)
                            .map(|a| a.worker_id.clone())
                            .collect();
                    }
                    status => {
                        return Err(CoreError::InvalidStateTransition {
                            from: status.to_string(),
                            to: TaskStatus::Cancelled.to_string(),
                        }
                        .into())
                    }
                }
                Ok(t)
            })
            .await?;

        if task.status == TaskStatus::Claimed || task.status == TaskStatus::Running {
            for worker_id in &running {
                self.update_worker(
                    worker_id,
                    &[WorkerStatus::Pending, WorkerStatus::Running],
                    |w| w.cancel_requested = true,
                )
                .await?;
            }
            info!(%task_id, workers = running.len(), "Cancellation requested");
        } else {
            info!(%task_id, "Task cancelled");
            self.bus
                .emit(
                    NewEvent::new(EventType::TaskCancelled, self.instance.to_string())
                        .correlated(task_id.as_str())
                        .with_payload(json!({ "task_id": task_id })),
                )
                .await;
        }
        Ok(task)
    }

    /// Operator force-reclaim of a stuck task. Does not count as a retry.
    pub async fn reassign(&self, task_id: &TaskId) -> Result<Task> {
        let task: Task = self.store.require(&task_path(task_id)).await?;
        match task.status {
            TaskStatus::Claimed | TaskStatus::Running => {
                for assignment in task.workers.iter().filter(|a| !a.completed) {
                    if self
                        .reclaim(&assignment.worker_id, "reassigned by operator", false)
                        .await?
                    {
                        return self.store.require(&task_path(task_id)).await;
                    }
                }
                // No active worker to reclaim: drop the claim directly.
                self.locks.force_release(&task_lock_name(task_id)).await?;
                for assignment in task.workers.iter().skip(1) {
                    self.locks
                        .force_release(&collaborator_lock_name(task_id, &assignment.class))
                        .await?;
                }
                self.retry_or_fail(task_id, None, "reassigned by operator", false)
                    .await?;
                if let Some(owner) = &task.claimed_by {
                    self.registry.remove_claim(owner, task_id).await?;
                }
            }
            TaskStatus::Blocked => {
                self.store
                    .update(&task_path(task_id), |mut t: Task| {
                        t.transition(TaskStatus::Pending)?;
                        t.reason = None;
                        Ok(t)
                    })
                    .await?;
            }
            TaskStatus::Pending => {
                self.store
                    .update(&task_path(task_id), |mut t: Task| {
                        t.not_before = None;
                        Ok(t)
                    })
                    .await?;
            }
            status => {
                return Err(CoreError::InvalidStateTransition {
                    from: status.to_string(),
                    to: TaskStatus::Pending.to_string(),
                }
                .into())
            }
        }
        info!(%task_id, "Task reassigned");
        self.store.require(&task_path(task_id)).await
    }

    /// Finalize a terminal worker that is still listed as active.
    pub async fn reconcile_worker(&self, worker_id: &WorkerId) -> Result<bool> {
        match self.store.get::<Worker>(&active_path(worker_id)).await? {
            Some(worker) if worker.status.is_terminal() => {
                self.finalize(&worker).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Look a worker up wherever it currently lives.
    pub async fn worker(&self, worker_id: &WorkerId) -> Result<Option<Worker>> {
        for dir in [ACTIVE_DIR, COMPLETED_DIR, FAILED_DIR] {
            if let Some(w) = self.store.get(&format!("{dir}/{worker_id}")).await? {
                return Ok(Some(w));
            }
        }
        Ok(None)
    }

    pub async fn active_workers(&self) -> Result<Vec<Worker>> {
        self.store.list_values(ACTIVE_DIR).await
    }

    pub async fn finished_workers(&self) -> Result<Vec<Worker>> {
        let mut workers: Vec<Worker> = self.store.list_values(COMPLETED_DIR).await?;
        workers.extend(self.store.list_values::<Worker>(FAILED_DIR).await?);
        workers.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        Ok(workers)
    }

    /// Active workers spawned by this instance.
    pub async fn local_active_count(&self) -> Result<usize> {
        Ok(self
            .active_workers()
            .await?
            .iter()
            .filter(|w| w.instance_id == self.instance && w.status.is_active())
            .count())
    }

    pub async fn tasks(&self) -> Result<Vec<Task>> {
        self.store.list_values(TASK_DIR).await
    }

    /// Routed tasks ready to claim, highest priority and oldest first.
    pub async fn claimable_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks()
            .await?
            .into_iter()
            .filter(|t| t.is_claimable(now) && t.assigned_agent_class.is_some())
            .collect();
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// Update an active worker if its status is one of `from`.
    async fn update_worker<F>(
        &self,
        worker_id: &WorkerId,
        from: &[WorkerStatus],
        mut f: F,
    ) -> Result<Option<Worker>>
    where
        F: FnMut(&mut Worker),
    {
        let result = self
            .store
            .update(&active_path(worker_id), |mut w: Worker| {
                if !from.contains(&w.status) {
                    return Err(CoreError::InvalidStateTransition {
                        from: w.status.to_string(),
                        to: "update".to_string(),
                    }
                    .into());
                }
                f(&mut w);
                Ok(w)
            })
            .await;
        match result {
            Ok(w) => Ok(Some(w)),
            Err(CoordinatorError::NotFound(_))
            | Err(CoordinatorError::Core(CoreError::InvalidStateTransition { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Update a task when `f` returns true; `None` when it declined.
    async fn update_task<F>(&self, task_id: &TaskId, mut f: F) -> Result<Option<Task>>
    where
        F: FnMut(&mut Task) -> Result<bool>,
    {
        const DECLINED: &str = "update declined";
        let result = self
            .store
            .update(&task_path(task_id), |mut t: Task| {
                if f(&mut t)? {
                    Ok(t)
                } else {
                    Err(CoordinatorError::Permanent(DECLINED.to_string()))
                }
            })
            .await;
        match result {
            Ok(t) => Ok(Some(t)),
            Err(CoordinatorError::Permanent(msg)) if msg == DECLINED => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl WorkerReporter for PoolManager {
    async fn heartbeat(&self, worker_id: &WorkerId, tokens_used: u64) -> Result<Directive> {
        PoolManager::heartbeat(self, worker_id, tokens_used).await
    }

    async fn complete(&self, worker_id: &WorkerId, outcome: ExecutionOutcome) -> Result<()> {
        PoolManager::complete(self, worker_id, outcome).await
    }
}

fn active_path(worker_id: &WorkerId) -> String {
    format!("{ACTIVE_DIR}/{worker_id}")
}

/// Nearest-rank 95th percentile.
fn p95(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted.get(rank.saturating_sub(1)).copied()
}
