//! Health alerts raised by the remediation engine and the ledger.

use crate::{AlertId, AlertStatus, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An alert about a failing component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub id: AlertId,
    pub component: String,
    pub status: AlertStatus,
    pub severity: Severity,
    pub message: String,
    /// Findings accumulated by the diagnostic tree.
    #[serde(default)]
    pub diagnosis: String,
    /// Manual step suggested when automatic remediation gave up.
    pub recommended_action: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    /// Number of times the same condition was reported while open.
    #[serde(default)]
    pub occurrences: u32,
}

impl HealthAlert {
    pub fn new(component: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: AlertId::generate(),
            component: component.into(),
            status: AlertStatus::Open,
            severity,
            message: message.into(),
            diagnosis: String::new(),
            recommended_action: None,
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
            occurrences: 1,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::Open
    }

    /// Close the alert. Resolving twice keeps the first resolution.
    pub fn resolve(&mut self, resolution: impl Into<String>, now: DateTime<Utc>) {
        if self.is_open() {
            self.status = AlertStatus::Resolved;
            self.resolved_at = Some(now);
            self.resolution = Some(resolution.into());
        }
    }
}
