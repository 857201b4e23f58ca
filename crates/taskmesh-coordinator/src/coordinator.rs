//! Coordinator daemon.
//!
//! Wires the store-backed components together and runs the cooperative
//! cycle. The event bus reacts to what the cycle produces; the periodic scan
//! of tasks and workers remains as the reconciliation fallback.
//!
//! A failed pass never aborts the cycle. It is logged and published as a
//! `coordinator.error` event so the audit trail carries it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    Event, EventType, InstanceId, InstanceRecord, NewEvent, Task, TaskId, TaskStatus,
    TaskSubmission, TokenBudget, WorkerId,
};

use crate::alerts::AlertBook;
use crate::bus::{DispatchReport, EventBus, EventHandler, FnHandler};
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::executor::{CommandBackend, ExecutionBackend};
use crate::health::{HealthEngine, NoopTarget, RemediationReport, RemediationTarget};
use crate::ledger::TokenLedger;
use crate::lock::LockManager;
use crate::pool::{MonitorReport, PoolManager, SpawnOutcome};
use crate::registry::InstanceRegistry;
use crate::router::Router;
use crate::store::{task_path, StateStore};

/// Operator request for an instance to shut down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
}

/// Store path of the stop request for `instance`.
pub fn stop_path(instance: &InstanceId) -> String {
    format!("control/stop/{instance}")
}

/// Ask `instance` to stop at its next cycle.
pub async fn request_stop(store: &StateStore, instance: &InstanceId, requested_by: &str) -> Result<()> {
    let request = StopRequest {
        requested_at: Utc::now(),
        requested_by: requested_by.to_string(),
    };
    store
        .write_atomic(&stop_path(instance), |_: Option<StopRequest>| Ok(request.clone()))
        .await?;
    info!(instance_id = %instance, "Stop requested");
    Ok(())
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub reaped: usize,
    pub routed: usize,
    pub spawned: usize,
    pub deferred: usize,
    pub monitor: MonitorReport,
    pub dispatch: DispatchReport,
    pub health: Vec<RemediationReport>,
}

/// Point-in-time summary for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub instance_id: InstanceId,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub active_workers: usize,
    pub live_instances: Vec<InstanceRecord>,
    pub open_alerts: usize,
    pub dead_letters: usize,
    pub queue_depth: usize,
    pub heartbeat_timeout_secs: i64,
    pub budget: TokenBudget,
}

/// One coordinator instance.
pub struct Coordinator {
    config: Config,
    instance: InstanceId,
    store: StateStore,
    locks: LockManager,
    alerts: AlertBook,
    bus: EventBus,
    ledger: TokenLedger,
    router: Router,
    registry: InstanceRegistry,
    pool: PoolManager,
    health: HealthEngine,
}

impl Coordinator {
    /// Open the shared store and build every component.
    pub async fn new(
        config: Config,
        backend: Arc<dyn ExecutionBackend>,
        target: Arc<dyn RemediationTarget>,
    ) -> Result<Self> {
        let store = StateStore::open(&config.state_dir, &config.store).await?;
        let instance = config.instance_id();
        let locks = LockManager::new(
            store.clone(),
            instance.clone(),
            Duration::from_secs(config.registry.stale_after_secs),
            Duration::from_millis(config.store.lock_acquire_timeout_ms),
        );
        let alerts = AlertBook::new(store.clone());
        let bus = EventBus::new(
            store.clone(),
            locks.clone(),
            alerts.clone(),
            instance.to_string(),
            config.bus.clone(),
        );
        let ledger = TokenLedger::new(store.clone(), alerts.clone(), bus.clone());
        ledger.ensure_initialized(&config.budget).await?;
        let router = Router::new(store.clone(), bus.clone(), config.router.clone());
        let registry = InstanceRegistry::new(
            store.clone(),
            locks.clone(),
            bus.clone(),
            instance.clone(),
            &config.registry,
        );
        let pool = PoolManager::new(
            store.clone(),
            locks.clone(),
            ledger.clone(),
            bus.clone(),
            registry.clone(),
            backend,
            config.pool.clone(),
        );
        let health = HealthEngine::new(
            store.clone(),
            locks.clone(),
            alerts.clone(),
            bus.clone(),
            target,
            config.health.clone(),
        );

        let coordinator = Self {
            config,
            instance,
            store,
            locks,
            alerts,
            bus,
            ledger,
            router,
            registry,
            pool,
            health,
        };
        coordinator.subscribe_builtin().await;
        Ok(coordinator)
    }

    async fn subscribe_builtin(&self) {
        let reconcile: Arc<dyn EventHandler> = Arc::new(ReconcileHandler {
            pool: self.pool.clone(),
        });
        for pattern in ["task.completed", "task.failed", "task.requeued", "task.cancelled"] {
            self.bus.subscribe(pattern, reconcile.clone()).await;
        }
        self.bus
            .subscribe(
                "alert.*",
                Arc::new(FnHandler::new("alert-log", |event: Event| {
                    Box::pin(async move {
                        let component = event
                            .payload
                            .get("component")
                            .and_then(Value::as_str)
                            .unwrap_or("-")
                            .to_string();
                        info!(event_id = %event.id, event_type = %event.event_type, component = %component, "Alert event");
                        Ok(())
                    })
                })),
            )
            .await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn alerts(&self) -> &AlertBook {
        &self.alerts
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    pub fn health(&self) -> &HealthEngine {
        &self.health
    }

    /// Accept a new task. Fails with `DuplicateId` or `InvalidPriority`.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<Task> {
        let mut task = submission.into_task()?;
        if task.lineage.submitted_by.is_empty() {
            task.lineage.submitted_by = self.instance.to_string();
        }
        match self.store.create(&task_path(&task.id), &task).await {
            Ok(()) => {}
            Err(CoordinatorError::DuplicateId(_)) => {
                return Err(CoordinatorError::DuplicateId(task.id.to_string()))
            }
            Err(e) => return Err(e),
        }
        info!(task_id = %task.id, priority = %task.priority, task_type = %task.task_type, "Task submitted");
        self.bus
            .emit(
                NewEvent::new(EventType::TaskSubmitted, self.instance.to_string())
                    .correlated(task.id.as_str())
                    .with_priority(task.priority)
                    .with_payload(json!({
                        "task_id": task.id,
                        "type": task.task_type,
                        "priority": task.priority,
                    })),
            )
            .await;
        Ok(task)
    }

    pub async fn task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.store.get(&task_path(task_id)).await
    }

    /// Announce this instance and requeue claims a previous run under the
    /// same id left behind.
    pub async fn start(&self) -> Result<()> {
        let leftover = self.registry.register().await?;
        for task_id in &leftover {
            if let Err(e) = self.pool.reclaim_orphan(task_id, &self.instance).await {
                warn!(%task_id, error = %e, "Failed to recover leftover claim");
                self.record_failure("reclaim", Some(task_id.as_str()), &e).await;
            }
        }
        info!(
            instance_id = %self.instance,
            state_dir = %self.config.state_dir.display(),
            leftover_claims = leftover.len(),
            "Coordinator started"
        );
        Ok(())
    }

    /// Run one full cycle.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        if let Err(e) = self.registry.heartbeat().await {
            self.record_failure("heartbeat", None, &e).await;
            return Err(e);
        }

        match self.registry.reap_stale().await {
            Ok(reaped) => {
                report.reaped = reaped.len();
                for dead in reaped {
                    for task_id in &dead.orphaned_tasks {
                        if let Err(e) = self.pool.reclaim_orphan(task_id, &dead.instance_id).await {
                            warn!(%task_id, dead_instance = %dead.instance_id, error = %e, "Failed to reclaim orphaned task");
                            self.record_failure("reclaim", Some(task_id.as_str()), &e).await;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Instance reaping failed");
                self.record_failure("reap", None, &e).await;
            }
        }

        if let Err(e) = self.ledger.daily_reset(Utc::now().date_naive()).await {
            warn!(error = %e, "Daily budget reset failed");
            self.record_failure("budget_reset", None, &e).await;
        }

        match self.route_pending().await {
            Ok(n) => report.routed = n,
            Err(e) => {
                warn!(error = %e, "Routing pass failed");
                self.record_failure("route", None, &e).await;
            }
        }
        if let Err(e) = self.spawn_ready(&mut report).await {
            warn!(error = %e, "Spawn pass failed");
            self.record_failure("spawn", None, &e).await;
        }

        match self.pool.monitor_cycle().await {
            Ok(m) => report.monitor = m,
            Err(e) => {
                warn!(error = %e, "Monitor cycle failed");
                self.record_failure("monitor", None, &e).await;
            }
        }
        match self.bus.dispatch_once().await {
            Ok(d) => report.dispatch = d,
            Err(e) => {
                warn!(error = %e, "Event dispatch failed");
                self.record_failure("dispatch", None, &e).await;
            }
        }

        if !self.config.health.components.is_empty() {
            let (checked, failures) = self.health.check_due().await;
            report.health = checked;
            for (component, e) in &failures {
                self.record_failure("health", Some(component.as_str()), e).await;
            }
        }

        debug!(
            routed = report.routed,
            spawned = report.spawned,
            deferred = report.deferred,
            zombies = report.monitor.zombies.len(),
            delivered = report.dispatch.delivered,
            "Cycle complete"
        );
        Ok(report)
    }

    async fn route_pending(&self) -> Result<usize> {
        let mut routed = 0;
        for task in self.pool.tasks().await? {
            if task.status != TaskStatus::Pending || task.assigned_agent_class.is_some() {
                continue;
            }
            match self.router.route(&task).await {
                Ok(_) => routed += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Routing failed");
                    self.record_failure("route", Some(task.id.as_str()), &e).await;
                }
            }
        }
        Ok(routed)
    }

    async fn spawn_ready(&self, report: &mut TickReport) -> Result<()> {
        let active = self.pool.local_active_count().await?;
        let mut capacity = self
            .config
            .pool
            .max_concurrent_workers
            .saturating_sub(active);
        if capacity == 0 {
            debug!(active, "Worker pool at capacity");
            return Ok(());
        }
        for task in self.pool.claimable_tasks(Utc::now()).await? {
            if capacity == 0 {
                break;
            }
            match self.pool.spawn_within(&task.id, capacity).await {
                Ok(SpawnOutcome::Spawned(workers)) => {
                    capacity = capacity.saturating_sub(workers.len());
                    report.spawned += 1;
                }
                Ok(SpawnOutcome::BudgetDeferred { .. }) => report.deferred += 1,
                Ok(SpawnOutcome::AtCapacity { needed }) => {
                    debug!(task_id = %task.id, needed, capacity, "Not enough room for every class");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Spawn failed");
                    self.record_failure("spawn", Some(task.id.as_str()), &e).await;
                }
            }
        }
        Ok(())
    }

    /// Publish a failed pass for audit.
    async fn record_failure(&self, pass: &str, subject: Option<&str>, err: &CoordinatorError) {
        let mut event = NewEvent::new(EventType::CoordinatorError, self.instance.to_string())
            .with_payload(json!({
                "pass": pass,
                "subject": subject,
                "error": err.to_string(),
                "instance_id": self.instance,
            }));
        if let Some(subject) = subject {
            event = event.correlated(subject);
        }
        self.bus.emit(event).await;
    }

    async fn stop_requested(&self) -> Result<bool> {
        self.store.exists(&stop_path(&self.instance)).await
    }

    /// Cycle until `shutdown` fires or a stop request appears. Call
    /// [`start`](Self::start) first.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let beat = shutdown.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.registry.clone(),
            Duration::from_secs(self.config.registry.heartbeat_interval_secs.max(1)),
            beat.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(instance_id = %self.instance, "Shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    match self.stop_requested().await {
                        Ok(true) => {
                            info!(instance_id = %self.instance, "Stop request found");
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "Failed to check stop request"),
                    }
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Coordinator cycle failed");
                    }
                }
            }
        }
        beat.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        self.shutdown().await
    }

    /// Hand back this instance's work and leave the registry.
    pub async fn shutdown(&self) -> Result<()> {
        for worker in self.pool.active_workers().await? {
            if worker.instance_id != self.instance || worker.status.is_terminal() {
                continue;
            }
            if let Err(e) = self
                .pool
                .reclaim(&worker.id, "coordinator shutting down", false)
                .await
            {
                warn!(worker_id = %worker.id, error = %e, "Failed to hand back worker");
            }
        }
        self.registry.deregister().await?;
        self.store.remove(&stop_path(&self.instance)).await?;
        info!(instance_id = %self.instance, "Coordinator stopped");
        Ok(())
    }

    /// Summary across every instance sharing the store.
    pub async fn status(&self) -> Result<StatusReport> {
        let mut tasks_by_status = BTreeMap::new();
        for task in self.pool.tasks().await? {
            *tasks_by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }
        Ok(StatusReport {
            instance_id: self.instance.clone(),
            tasks_by_status,
            active_workers: self.pool.active_workers().await?.len(),
            live_instances: self.registry.live_instances().await?,
            open_alerts: self.alerts.list(false).await?.len(),
            dead_letters: self.bus.dead_letters().await?.len(),
            queue_depth: self.bus.queue_depth().await?,
            heartbeat_timeout_secs: self.pool.heartbeat_timeout().await?.num_seconds(),
            budget: self.ledger.snapshot().await?,
        })
    }
}

/// Keep this instance's registry record fresh while a long cycle runs.
async fn heartbeat_loop(registry: InstanceRegistry, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = registry.heartbeat().await {
                    warn!(error = %e, "Instance heartbeat failed");
                }
            }
        }
    }
}

/// Finalizes workers named by task lifecycle events. Idempotent.
struct ReconcileHandler {
    pool: PoolManager,
}

#[async_trait]
impl EventHandler for ReconcileHandler {
    fn name(&self) -> &str {
        "reconcile"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Some(worker_id) = event.payload.get("worker_id").and_then(Value::as_str) else {
            return Ok(());
        };
        if self.pool.reconcile_worker(&WorkerId::new(worker_id)).await? {
            info!(event_id = %event.id, %worker_id, "Worker reconciled");
        }
        Ok(())
    }
}

/// Run a coordinator with the command backend until `shutdown` fires,
/// serving the HTTP status surface when `http_addr` is set.
pub async fn run_daemon(config: Config, shutdown: CancellationToken) -> Result<()> {
    let backend = Arc::new(CommandBackend::new(
        &config.executor,
        Duration::from_secs(config.pool.heartbeat_interval_secs),
    )?);
    let coordinator = Arc::new(Coordinator::new(config, backend, Arc::new(NoopTarget)).await?);
    coordinator.start().await?;

    if let Some(addr) = coordinator.config().http_addr.clone() {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let router = crate::http::create_router(coordinator.clone());
        let http_shutdown = shutdown.clone();
        info!(http_addr = %addr, "HTTP status server listening");
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        });
    }

    let result = coordinator.run(shutdown.clone()).await;
    shutdown.cancel();
    result
}
