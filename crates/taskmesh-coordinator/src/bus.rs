//! Event bus: durable log, durable queue, idempotent dispatch.
//!
//! Layout under `events/{stream}/`:
//! - `seq`: last allocated event id
//! - `watermark`: highest id up to which every allocated id finished appending
//! - `log/{id}`: the immutable event, written last by `append`
//! - `queue/{id}`: pointer awaiting dispatch, with attempt bookkeeping
//! - `applied/{id}-{handler}`: marker written after a handler succeeded
//! - `dead/{id}`: events whose handlers kept failing
//!
//! Delivery is at-least-once. Markers make re-delivery and replay skip
//! handlers that already applied an event. Events sharing a correlation id
//! are delivered in id order, and a failing event holds back the rest of
//! its group; separate groups are dispatched concurrently.
//!
//! Several processes append concurrently, so a higher id can land before a
//! lower one. Correlated events are only dispatched up to the watermark; an
//! id that never finishes appending is skipped after `gap_timeout_ms`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use taskmesh_core::{Event, EventId, EventType, NewEvent, Priority, Severity};

use crate::alerts::{AlertBook, AlertDraft};
use crate::config::BusConfig;
use crate::error::{CoordinatorError, Result};
use crate::lock::LockManager;
use crate::store::StateStore;

/// Reacts to dispatched events. Must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name; part of the applied-marker key.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

type HandlerFn = dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler {
    name: String,
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

#[derive(Clone)]
struct Subscription {
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

/// Queue pointer for an undelivered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub event_id: EventId,
    pub correlation_id: Option<String>,
    pub attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Watermark {
    appended_through: u64,
    /// When the id right above the watermark was first found missing.
    gap_since: Option<DateTime<Utc>>,
}

/// An event whose handlers failed past the attempt bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: EventId,
    pub event_type: EventType,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Held back behind a failing or backing-off event of the same group.
    pub deferred: usize,
    /// Another dispatcher held the stream lock.
    pub lock_busy: bool,
}

/// Outcome of a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: Vec<(EventId, String)>,
}

#[derive(Default)]
struct GroupOutcome {
    delivered: usize,
    retried: usize,
    dead_lettered: usize,
    deferred: usize,
}

/// Event bus over one stream of the shared store.
#[derive(Clone)]
pub struct EventBus {
    store: StateStore,
    locks: LockManager,
    alerts: AlertBook,
    source: String,
    config: BusConfig,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl EventBus {
    pub fn new(
        store: StateStore,
        locks: LockManager,
        alerts: AlertBook,
        source: impl Into<String>,
        config: BusConfig,
    ) -> Self {
        Self {
            store,
            locks,
            alerts,
            source: source.into(),
            config,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Producer name stamped on events this bus emits for itself.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    /// Append to the log and enqueue for dispatch.
    pub async fn append(&self, event: NewEvent) -> Result<Event> {
        let seq = self
            .store
            .write_atomic(&self.path("seq"), |current: Option<u64>| {
                Ok(current.unwrap_or(0) + 1)
            })
            .await?;
        let event = event.into_event(EventId::new(seq), Utc::now());
        let key = event.id.storage_key();

        // The log entry marks the append complete, so it goes last.
        self.store
            .create(
                &self.path(&format!("queue/{key}")),
                &QueueEntry {
                    event_id: event.id,
                    correlation_id: event.correlation_id.clone(),
                    attempts: 0,
                    not_before: None,
                    last_error: None,
                },
            )
            .await?;
        self.store.create(&self.path(&format!("log/{key}")), &event).await?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Event appended");
        Ok(event)
    }

    /// Append, logging instead of failing. For audit events emitted on paths
    /// whose own outcome must not depend on the bus.
    pub async fn emit(&self, event: NewEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.append(event).await {
            warn!(event_type = %event_type, error = %e, "Failed to append event");
        }
    }

    /// Register `handler` for event types matching `pattern`.
    pub async fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let pattern = pattern.into();
        info!(pattern = %pattern, handler = handler.name(), "Handler subscribed");
        self.subscriptions.write().await.push(Subscription { pattern, handler });
    }

    /// Pop ready queue pointers and deliver them.
    ///
    /// Only one dispatcher per stream runs at a time; a busy stream lock
    /// returns an empty report with `lock_busy` set.
    pub async fn dispatch_once(&self) -> Result<DispatchReport> {
        let lock = match self.locks.try_acquire(&self.lock_name()).await {
            Ok(lock) => lock,
            Err(CoordinatorError::Busy { .. }) => {
                return Ok(DispatchReport {
                    lock_busy: true,
                    ..Default::default()
                })
            }
            Err(e) => return Err(e),
        };

        let result = self.dispatch_locked().await;
        self.locks.release(&lock).await?;
        result
    }

    async fn dispatch_locked(&self) -> Result<DispatchReport> {
        let through = self.advance_watermark().await?;
        let keys = self.store.list(&self.path("queue")).await?;
        let mut groups: BTreeMap<String, Vec<QueueEntry>> = BTreeMap::new();
        let mut held = 0;
        for key in keys.into_iter().take(self.config.batch_size) {
            let Some(entry) = self
                .store
                .get::<QueueEntry>(&self.path(&format!("queue/{key}")))
                .await?
            else {
                continue;
            };
            if entry.correlation_id.is_some() && entry.event_id.value() > through {
                held += 1;
                continue;
            }
            let group = entry
                .correlation_id
                .clone()
                .unwrap_or_else(|| format!("#{}", entry.event_id.storage_key()));
            groups.entry(group).or_default().push(entry);
        }
        if groups.is_empty() {
            return Ok(DispatchReport {
                deferred: held,
                ..Default::default()
            });
        }

        let subs = self.subscriptions.read().await.clone();
        let outcomes = join_all(
            groups
                .into_values()
                .map(|entries| self.dispatch_group(entries, &subs, through)),
        )
        .await;

        let mut report = DispatchReport {
            deferred: held,
            ..Default::default()
        };
        for outcome in outcomes {
            let outcome = outcome?;
            report.delivered += outcome.delivered;
            report.retried += outcome.retried;
            report.dead_lettered += outcome.dead_lettered;
            report.deferred += outcome.deferred;
        }
        if report.delivered + report.retried + report.dead_lettered > 0 {
            debug!(
                delivered = report.delivered,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                "Dispatch cycle finished"
            );
        }
        Ok(report)
    }

    /// Highest id below which every allocated id has finished appending,
    /// skipping ids left unwritten for longer than the gap timeout.
    async fn advance_watermark(&self) -> Result<u64> {
        let allocated: u64 = self.store.get(&self.path("seq")).await?.unwrap_or(0);
        let current: Watermark = self.store.get(&self.path("watermark")).await?.unwrap_or_default();
        let gap_timeout = chrono::Duration::milliseconds(self.config.gap_timeout_ms as i64);
        let mut next = current.clone();
        while next.appended_through < allocated {
            let id = EventId::new(next.appended_through + 1);
            if !self
                .store
                .exists(&self.path(&format!("log/{}", id.storage_key())))
                .await?
            {
                let now = Utc::now();
                let since = *next.gap_since.get_or_insert(now);
                if now - since < gap_timeout {
                    break;
                }
                warn!(event_id = %id, "Event id never finished appending, skipping it");
            }
            next.appended_through = id.value();
            next.gap_since = None;
        }
        if next != current {
            self.store
                .write_atomic(&self.path("watermark"), |_: Option<Watermark>| Ok(next.clone()))
                .await?;
        }
        Ok(next.appended_through)
    }

    async fn dispatch_group(
        &self,
        mut entries: Vec<QueueEntry>,
        subs: &[Subscription],
        through: u64,
    ) -> Result<GroupOutcome> {
        entries.sort_by_key(|e| e.event_id);
        let now = Utc::now();
        let total = entries.len();
        let mut outcome = GroupOutcome::default();

        for (i, mut entry) in entries.into_iter().enumerate() {
            let key = entry.event_id.storage_key();
            let queue_path = self.path(&format!("queue/{key}"));

            if entry.not_before.is_some_and(|t| t > now) {
                outcome.deferred += total - i;
                break;
            }

            let Some(event) = self.read_event(entry.event_id).await? else {
                if entry.event_id.value() > through {
                    // Still being appended.
                    outcome.deferred += 1;
                    continue;
                }
                warn!(event_id = %entry.event_id, "Queued event missing from log, dropping pointer");
                self.store.remove(&queue_path).await?;
                continue;
            };

            match self.deliver(&event, subs).await {
                Ok(_) => {
                    self.store.remove(&queue_path).await?;
                    outcome.delivered += 1;
                }
                Err(err) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.config.max_attempts {
                        self.dead_letter(&event, &entry, &err).await?;
                        self.store.remove(&queue_path).await?;
                        outcome.dead_lettered += 1;
                        continue;
                    }
                    let backoff = self
                        .config
                        .retry_backoff_ms
                        .saturating_mul(1u64 << (entry.attempts - 1).min(10));
                    entry.not_before = Some(now + chrono::Duration::milliseconds(backoff as i64));
                    entry.last_error = Some(err.clone());
                    warn!(event_id = %event.id, event_type = %event.event_type, attempts = entry.attempts, error = %err, "Handler failed, will retry");
                    self.store
                        .write_atomic(&queue_path, |_: Option<QueueEntry>| Ok(entry.clone()))
                        .await?;
                    outcome.retried += 1;
                    outcome.deferred += total - i - 1;
                    break;
                }
            }
        }
        Ok(outcome)
    }

    /// Run every matching handler that has not yet applied `event`.
    ///
    /// Returns how many handlers ran. Stops at the first failure; handlers
    /// that succeeded before it keep their markers.
    async fn deliver(&self, event: &Event, subs: &[Subscription]) -> std::result::Result<usize, String> {
        let key = event.id.storage_key();
        let timeout = Duration::from_millis(self.config.handler_timeout_ms);
        let mut ran = 0;

        for sub in subs.iter().filter(|s| event.event_type.matches(&s.pattern)) {
            let marker = self.path(&format!("applied/{key}-{}", marker_key(sub.handler.name())));
            if self.store.exists(&marker).await.map_err(|e| e.to_string())? {
                continue;
            }

            match tokio::time::timeout(timeout, sub.handler.handle(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(format!("{}: {e}", sub.handler.name())),
                Err(_) => {
                    return Err(format!(
                        "{}: timed out after {}ms",
                        sub.handler.name(),
                        self.config.handler_timeout_ms
                    ))
                }
            }

            let applied = AppliedMarker {
                handler: sub.handler.name().to_string(),
                applied_at: Utc::now(),
            };
            match self.store.create(&marker, &applied).await {
                Ok(()) | Err(CoordinatorError::DuplicateId(_)) => {}
                Err(e) => return Err(e.to_string()),
            }
            ran += 1;
        }
        Ok(ran)
    }

    async fn dead_letter(&self, event: &Event, entry: &QueueEntry, err: &str) -> Result<()> {
        let letter = DeadLetter {
            event_id: event.id,
            event_type: event.event_type.clone(),
            attempts: entry.attempts,
            error: err.to_string(),
            failed_at: Utc::now(),
        };
        self.store
            .write_atomic(
                &self.path(&format!("dead/{}", event.id.storage_key())),
                |_: Option<DeadLetter>| Ok(letter.clone()),
            )
            .await?;
        error!(event_id = %event.id, event_type = %event.event_type, attempts = entry.attempts, error = err, "Event dead-lettered");

        self.alerts
            .raise(
                AlertDraft::new(
                    format!("bus.{}", self.stream()),
                    Severity::Critical,
                    format!("event {} ({}) dead-lettered", event.id, event.event_type),
                )
                .with_diagnosis(err)
                .with_recommendation(format!("fix the handler, then replay event {}", event.id)),
            )
            .await?;

        self.emit(
            NewEvent::new(EventType::HandlerDeadLettered, self.source.clone())
                .with_priority(Priority::High)
                .with_payload(serde_json::json!({
                    "event_id": event.id,
                    "event_type": event.event_type,
                    "error": err,
                })),
        )
        .await;
        Ok(())
    }

    /// Re-deliver specific events. Handlers that already applied an event
    /// are skipped; a successful replay clears the event's dead letter.
    ///
    /// Runs under the stream lock, waiting out an in-flight dispatch cycle
    /// for at most the lock manager's acquire timeout.
    pub async fn replay_ids(&self, ids: &[EventId]) -> Result<ReplayReport> {
        let lock = self
            .locks
            .acquire(&self.lock_name(), self.locks.acquire_timeout())
            .await?;
        let result = self.replay_locked(ids).await;
        self.locks.release(&lock).await?;
        result
    }

    async fn replay_locked(&self, ids: &[EventId]) -> Result<ReplayReport> {
        let subs = self.subscriptions.read().await.clone();
        let mut report = ReplayReport::default();
        for id in ids {
            let Some(event) = self.read_event(*id).await? else {
                report.failed.push((*id, "not found".to_string()));
                continue;
            };
            match self.deliver(&event, &subs).await {
                Ok(ran) => {
                    report.replayed += 1;
                    self.store
                        .remove(&self.path(&format!("dead/{}", id.storage_key())))
                        .await?;
                    info!(event_id = %id, handlers_run = ran, "Event replayed");
                }
                Err(e) => report.failed.push((*id, e)),
            }
        }
        Ok(report)
    }

    /// Replay every event with id in `[from, to]`.
    pub async fn replay_range(&self, from: EventId, to: EventId) -> Result<ReplayReport> {
        let ids: Vec<EventId> = self
            .log_ids()
            .await?
            .into_iter()
            .filter(|id| *id >= from && *id <= to)
            .collect();
        self.replay_ids(&ids).await
    }

    /// Replay every event stamped at or after `since`.
    pub async fn replay_since(&self, since: DateTime<Utc>) -> Result<ReplayReport> {
        let ids: Vec<EventId> = self
            .events_between(Some(since), None)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        self.replay_ids(&ids).await
    }

    pub async fn read_event(&self, id: EventId) -> Result<Option<Event>> {
        self.store
            .get(&self.path(&format!("log/{}", id.storage_key())))
            .await
    }

    /// Logged events within an optional time window, in id order.
    pub async fn events_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let events: Vec<Event> = self.store.list_values(&self.path("log")).await?;
        Ok(events
            .into_iter()
            .filter(|e| from.map_or(true, |f| e.timestamp >= f))
            .filter(|e| to.map_or(true, |t| e.timestamp <= t))
            .collect())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.store.list_values(&self.path("dead")).await
    }

    /// Pointers still waiting for dispatch.
    pub async fn queue_depth(&self) -> Result<usize> {
        Ok(self.store.list(&self.path("queue")).await?.len())
    }

    async fn log_ids(&self) -> Result<Vec<EventId>> {
        Ok(self
            .store
            .list(&self.path("log"))
            .await?
            .iter()
            .filter_map(|k| EventId::from_storage_key(k))
            .collect())
    }

    fn lock_name(&self) -> String {
        format!("bus-{}", self.stream())
    }

    fn path(&self, rest: &str) -> String {
        format!("events/{}/{rest}", self.config.stream)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AppliedMarker {
    handler: String,
    applied_at: DateTime<Utc>,
}

fn marker_key(handler: &str) -> String {
    handler
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
