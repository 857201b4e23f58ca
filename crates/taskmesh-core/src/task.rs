//! Task and submission types.

use crate::{CoreError, InstanceId, Priority, TaskId, TaskStatus, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a task came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    /// Task that spawned this one, if any.
    pub parent_task_id: Option<TaskId>,

    /// Worker that submitted this task, if any.
    pub spawned_by_worker: Option<WorkerId>,

    /// Who submitted the task (operator, instance, integration).
    pub submitted_by: String,

    /// Nesting depth below the root task.
    pub depth: u32,
}

/// A worker attached to the current attempt for one agent class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub class: String,
    pub worker_id: WorkerId,
    /// The worker finished its share successfully.
    #[serde(default)]
    pub completed: bool,
}

impl Assignment {
    pub fn new(class: impl Into<String>, worker_id: WorkerId) -> Self {
        Self {
            class: class.into(),
            worker_id,
            completed: false,
        }
    }
}

/// A Task represents a logical unit of work in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Free-form description used for routing.
    pub description: String,

    /// Caller-supplied task type (e.g. "bugfix", "scan").
    #[serde(rename = "type")]
    pub task_type: String,

    /// Scheduling priority.
    pub priority: Priority,

    /// Current task status.
    pub status: TaskStatus,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// Last status change.
    pub updated_at: DateTime<Utc>,

    /// Primary agent class chosen by the router.
    pub assigned_agent_class: Option<String>,

    /// Provenance.
    pub lineage: Lineage,

    /// Opaque caller metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Number of times the task has been returned to pending after a failed attempt.
    #[serde(default)]
    pub retry_count: u32,

    /// Task must not be claimed before this instant (spawn backoff).
    pub not_before: Option<DateTime<Utc>>,

    /// Coordinator instance holding the claim.
    pub claimed_by: Option<InstanceId>,

    /// Workers attached to the current attempt, primary class first. A
    /// multi-routed task has one per activated class.
    #[serde(default)]
    pub workers: Vec<Assignment>,

    /// Operator asked for cancellation; observed at the worker's next checkpoint.
    #[serde(default)]
    pub cancel_requested: bool,

    /// Why the task is blocked or failed.
    pub reason: Option<String>,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(
        description: impl Into<String>,
        task_type: impl Into<String>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            description: description.into(),
            task_type: task_type.into(),
            priority,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            assigned_agent_class: None,
            lineage: Lineage::default(),
            metadata: BTreeMap::new(),
            retry_count: 0,
            not_before: None,
            claimed_by: None,
            workers: Vec::new(),
            cancel_requested: false,
            reason: None,
        }
    }

    /// Builder method to set a specific ID.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to set lineage.
    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = lineage;
        self
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Drop claim bookkeeping and return the task to pending.
    pub fn requeue(&mut self, not_before: Option<DateTime<Utc>>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Pending)?;
        self.claimed_by = None;
        self.workers.clear();
        self.not_before = not_before;
        Ok(())
    }

    /// Worker of the primary class in the current attempt.
    pub fn primary_worker(&self) -> Option<&WorkerId> {
        self.workers.first().map(|a| &a.worker_id)
    }

    /// Whether `worker_id` belongs to the current attempt.
    pub fn is_attached(&self, worker_id: &WorkerId) -> bool {
        self.workers.iter().any(|a| &a.worker_id == worker_id)
    }

    /// Whether `worker_id` belongs to the current attempt and has not
    /// finished its share yet.
    pub fn is_working(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .iter()
            .any(|a| &a.worker_id == worker_id && !a.completed)
    }

    /// Record that `worker_id` finished. Returns true once every attached
    /// worker has.
    pub fn mark_completed(&mut self, worker_id: &WorkerId) -> bool {
        for a in &mut self.workers {
            if &a.worker_id == worker_id {
                a.completed = true;
            }
        }
        !self.workers.is_empty() && self.workers.iter().all(|a| a.completed)
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a pool manager may try to claim the task at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && !self.cancel_requested
            && self.not_before.map_or(true, |t| t <= now)
    }
}

/// Submission payload accepted from callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Optional caller-chosen id; generated when absent.
    pub id: Option<String>,
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    /// Priority as text; validated into [`Priority`].
    pub priority: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub lineage: Lineage,
}

impl TaskSubmission {
    pub fn new(description: impl Into<String>, priority: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            task_type: "general".to_string(),
            priority: priority.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Validate and build the pending Task.
    pub fn into_task(self) -> Result<Task, CoreError> {
        let priority: Priority = self.priority.parse()?;
        if self.description.trim().is_empty() {
            return Err(CoreError::InvalidInput("description is empty".to_string()));
        }
        let mut task = Task::new(self.description, self.task_type, priority)
            .with_lineage(self.lineage);
        if let Some(id) = self.id {
            if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
                return Err(CoreError::InvalidInput(format!("invalid task id '{id}'")));
            }
            task = task.with_id(TaskId::new(id));
        }
        task.metadata = self.metadata;
        Ok(task)
    }
}
