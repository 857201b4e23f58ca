//! Ephemeral worker records and the execution-backend contract types.

use crate::{InstanceId, ReservationId, TaskId, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ephemeral, budget- and deadline-bounded execution unit.
///
/// Owned by the pool manager; references its task without owning it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,

    /// Agent class the worker executes as.
    #[serde(rename = "type")]
    pub worker_type: String,

    pub parent_task_id: TaskId,

    /// Tokens reserved for this worker.
    pub token_budget: u64,

    /// Tokens reported so far.
    pub tokens_used: u64,

    /// Hard deadline; the reservation expires with it.
    pub deadline: DateTime<Utc>,

    pub status: WorkerStatus,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Ledger reservation backing `token_budget`.
    pub reservation_id: ReservationId,

    /// Coordinator instance that spawned the worker.
    pub instance_id: InstanceId,

    /// Cancellation flag observed at the next heartbeat.
    #[serde(default)]
    pub cancel_requested: bool,

    /// Lock taken when the worker was spawned and held until it is finalized.
    #[serde(default)]
    pub claim_lock: Option<String>,

    /// Token of that acquisition.
    #[serde(default)]
    pub claim_token: Option<String>,

    pub error: Option<String>,
}

impl Worker {
    /// Create a pending worker record for `task_id`.
    pub fn new(
        worker_type: impl Into<String>,
        parent_task_id: TaskId,
        token_budget: u64,
        deadline: DateTime<Utc>,
        reservation_id: ReservationId,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            id: WorkerId::generate(),
            worker_type: worker_type.into(),
            parent_task_id,
            token_budget,
            tokens_used: 0,
            deadline,
            status: WorkerStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_heartbeat: None,
            reservation_id,
            instance_id,
            cancel_requested: false,
            claim_lock: None,
            claim_token: None,
            error: None,
        }
    }

    /// Mark the worker as started.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = WorkerStatus::Running;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
    }

    /// Age of the most recent sign of life, falling back to creation time.
    pub fn silence(&self, now: DateTime<Utc>) -> chrono::Duration {
        let last = self
            .last_heartbeat
            .or(self.started_at)
            .unwrap_or(self.created_at);
        now - last
    }

    /// Wall-clock runtime, when finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Scoped context handed to the execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub worker_id: WorkerId,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub task_id: TaskId,
    pub token_budget: u64,
    pub deadline: DateTime<Utc>,
    pub deliverables: Vec<String>,
    pub description: String,
    /// Classes collaborating on a multi-routed task.
    #[serde(default)]
    pub collaborating_classes: Vec<String>,
}

/// Terminal status reported by the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// What the execution backend returns when a worker finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub tokens_used: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn completed(tokens_used: u64, result: serde_json::Value) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            tokens_used,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(tokens_used: u64, error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            tokens_used,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Answer to a worker heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// Keep working.
    Continue,
    /// Stop at this checkpoint.
    Cancel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn worker() -> Worker {
        Worker::new(
            "security",
            TaskId::new("t-1"),
            1000,
            Utc::now() + Duration::seconds(60),
            ReservationId::new("r-1"),
            InstanceId::new("i-1"),
        )
    }

    #[test]
    fn test_silence_uses_last_heartbeat() {
        let mut w = worker();
        let now = Utc::now();
        w.start(now - Duration::seconds(20));
        w.last_heartbeat = Some(now - Duration::seconds(5));
        assert_eq!(w.silence(now).num_seconds(), 5);
    }

    #[test]
    fn test_duration_requires_both_ends() {
        let mut w = worker();
        assert!(w.duration().is_none());
        let now = Utc::now();
        w.start(now - Duration::seconds(3));
        w.finished_at = Some(now);
        assert_eq!(w.duration().unwrap().num_seconds(), 3);
    }
}
