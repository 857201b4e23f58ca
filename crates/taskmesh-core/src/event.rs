//! Coordination events carried by the event bus.

use crate::ids::EventId;
use crate::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An appended, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic id within the stream.
    pub id: EventId,
    /// Type of event.
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Producer (instance id or component).
    pub source: String,
    /// Events sharing a correlation id are delivered in creation order.
    pub correlation_id: Option<String>,
    pub priority: Priority,
    pub payload: serde_json::Value,
}

/// An event before the bus assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub source: String,
    pub correlation_id: Option<String>,
    pub priority: Priority,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Self {
            event_type,
            source: source.into(),
            correlation_id: None,
            priority: Priority::Medium,
            payload: serde_json::Value::Null,
        }
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Stamp with an id and timestamp.
    pub fn into_event(self, id: EventId, timestamp: DateTime<Utc>) -> Event {
        Event {
            id,
            event_type: self.event_type,
            timestamp,
            source: self.source,
            correlation_id: self.correlation_id,
            priority: self.priority,
            payload: self.payload,
        }
    }
}

/// Type of coordination event.
///
/// Serialized as a dotted name (`task.completed`) so handlers can subscribe
/// by pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    TaskSubmitted,
    TaskRouted,
    TaskRejected,
    TaskClaimed,
    TaskCompleted,
    TaskFailed,
    TaskRequeued,
    TaskCancelled,
    WorkerSpawned,
    WorkerZombie,
    BudgetInsufficient,
    BudgetOverspend,
    BudgetEmergencyDrained,
    BudgetDailyReset,
    AlertRaised,
    AlertResolved,
    InstanceReaped,
    HandlerDeadLettered,
    /// A coordinator cycle pass failed.
    CoordinatorError,
    /// Any other dotted name.
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskSubmitted => "task.submitted",
            Self::TaskRouted => "task.routed",
            Self::TaskRejected => "task.rejected",
            Self::TaskClaimed => "task.claimed",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskRequeued => "task.requeued",
            Self::TaskCancelled => "task.cancelled",
            Self::WorkerSpawned => "worker.spawned",
            Self::WorkerZombie => "worker.zombie",
            Self::BudgetInsufficient => "budget.insufficient",
            Self::BudgetOverspend => "budget.overspend",
            Self::BudgetEmergencyDrained => "budget.emergency_drained",
            Self::BudgetDailyReset => "budget.daily_reset",
            Self::AlertRaised => "alert.raised",
            Self::AlertResolved => "alert.resolved",
            Self::InstanceReaped => "instance.reaped",
            Self::HandlerDeadLettered => "handler.dead_lettered",
            Self::CoordinatorError => "coordinator.error",
            Self::Custom(s) => s,
        }
    }

    /// Match against a subscription pattern: `*`, `prefix.*`, or an exact name.
    pub fn matches(&self, pattern: &str) -> bool {
        let name = self.as_str();
        if pattern == "*" {
            return true;
        }
        match pattern.strip_suffix(".*") {
            Some(prefix) => name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => name == pattern,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "task.submitted" => Self::TaskSubmitted,
            "task.routed" => Self::TaskRouted,
            "task.rejected" => Self::TaskRejected,
            "task.claimed" => Self::TaskClaimed,
            "task.completed" => Self::TaskCompleted,
            "task.failed" => Self::TaskFailed,
            "task.requeued" => Self::TaskRequeued,
            "task.cancelled" => Self::TaskCancelled,
            "worker.spawned" => Self::WorkerSpawned,
            "worker.zombie" => Self::WorkerZombie,
            "budget.insufficient" => Self::BudgetInsufficient,
            "budget.overspend" => Self::BudgetOverspend,
            "budget.emergency_drained" => Self::BudgetEmergencyDrained,
            "budget.daily_reset" => Self::BudgetDailyReset,
            "alert.raised" => Self::AlertRaised,
            "alert.resolved" => Self::AlertResolved,
            "instance.reaped" => Self::InstanceReaped,
            "handler.dead_lettered" => Self::HandlerDeadLettered,
            "coordinator.error" => Self::CoordinatorError,
            _ => Self::Custom(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(EventType::TaskCompleted.matches("*"));
        assert!(EventType::TaskCompleted.matches("task.*"));
        assert!(EventType::TaskCompleted.matches("task.completed"));
        assert!(!EventType::TaskCompleted.matches("task.failed"));
        assert!(!EventType::Custom("taskforce.x".into()).matches("task.*"));
    }

    #[test]
    fn test_type_serializes_as_dotted_name() {
        let json = serde_json::to_string(&EventType::WorkerZombie).unwrap();
        assert_eq!(json, "\"worker.zombie\"");
        let custom: EventType = serde_json::from_str("\"deploy.finished\"").unwrap();
        assert_eq!(custom, EventType::Custom("deploy.finished".into()));
    }

    #[test]
    fn test_new_event_stamp() {
        let e = NewEvent::new(EventType::TaskSubmitted, "i-1")
            .correlated("t-1")
            .into_event(EventId::new(7), Utc::now());
        assert_eq!(e.id.value(), 7);
        assert_eq!(e.correlation_id.as_deref(), Some("t-1"));
    }
}
