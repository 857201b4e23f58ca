//! Coordinator instance records.

use crate::{InstanceId, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Liveness record of one coordinator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Tasks this instance currently holds claims on.
    #[serde(default)]
    pub claimed_tasks: Vec<TaskId>,
}

impl InstanceRecord {
    pub fn new(instance_id: InstanceId, hostname: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            hostname: hostname.into(),
            started_at: now,
            heartbeat_at: now,
            claimed_tasks: Vec::new(),
        }
    }

    /// Heartbeat older than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.heartbeat_at > stale_after
    }

    pub fn add_claim(&mut self, task_id: &TaskId) {
        if !self.claimed_tasks.contains(task_id) {
            self.claimed_tasks.push(task_id.clone());
        }
    }

    pub fn remove_claim(&mut self, task_id: &TaskId) {
        self.claimed_tasks.retain(|t| t != task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_are_a_set() {
        let mut rec = InstanceRecord::new(InstanceId::new("a"), "host", Utc::now());
        let t = TaskId::new("t");
        rec.add_claim(&t);
        rec.add_claim(&t);
        assert_eq!(rec.claimed_tasks.len(), 1);
        rec.remove_claim(&t);
        assert!(rec.claimed_tasks.is_empty());
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let mut rec = InstanceRecord::new(InstanceId::new("a"), "host", now);
        rec.heartbeat_at = now - Duration::seconds(61);
        assert!(rec.is_stale(now, Duration::seconds(60)));
        assert!(!rec.is_stale(now, Duration::seconds(120)));
    }
}
