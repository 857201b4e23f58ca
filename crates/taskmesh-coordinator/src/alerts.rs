//! Health alert book.
//!
//! Alerts live at `alerts/{id}`. At most one alert per component is open at
//! a time: `alerts/open/{component}` points at it, and raising the same
//! condition again bumps its occurrence count instead of opening a new one.

use chrono::Utc;
use tracing::{info, warn};

use taskmesh_core::{AlertId, HealthAlert, Severity};

use crate::error::{CoordinatorError, Result};
use crate::store::StateStore;

const ALERT_DIR: &str = "alerts";
const OPEN_INDEX_DIR: &str = "alerts/open";

/// Details for [`AlertBook::raise`].
#[derive(Debug, Clone)]
pub struct AlertDraft {
    pub component: String,
    pub severity: Severity,
    pub message: String,
    pub diagnosis: String,
    pub recommended_action: Option<String>,
}

impl AlertDraft {
    pub fn new(component: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            severity,
            message: message.into(),
            diagnosis: String::new(),
            recommended_action: None,
        }
    }

    pub fn with_diagnosis(mut self, diagnosis: impl Into<String>) -> Self {
        self.diagnosis = diagnosis.into();
        self
    }

    pub fn with_recommendation(mut self, action: impl Into<String>) -> Self {
        self.recommended_action = Some(action.into());
        self
    }
}

/// Store-backed alert collection.
#[derive(Debug, Clone)]
pub struct AlertBook {
    store: StateStore,
}

impl AlertBook {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Open an alert for the component, or refresh the one already open.
    pub async fn raise(&self, draft: AlertDraft) -> Result<HealthAlert> {
        let index = open_index_path(&draft.component);
        for _ in 0..3 {
            let fresh = HealthAlert::new(&draft.component, draft.severity, &draft.message);
            let open_id = self
                .store
                .write_atomic(&index, |current: Option<AlertId>| {
                    Ok(current.unwrap_or_else(|| fresh.id.clone()))
                })
                .await?;

            let alert = self
                .store
                .write_atomic(&alert_path(&open_id), |current: Option<HealthAlert>| {
                    let mut alert = match current {
                        Some(existing) => existing,
                        None => {
                            let mut a = fresh.clone();
                            a.id = open_id.clone();
                            a.occurrences = 0;
                            a
                        }
                    };
                    if alert.is_open() {
                        alert.occurrences += 1;
                        alert.message = draft.message.clone();
                        alert.severity = alert.severity.max(draft.severity);
                        if !draft.diagnosis.is_empty() {
                            alert.diagnosis = draft.diagnosis.clone();
                        }
                        if draft.recommended_action.is_some() {
                            alert.recommended_action = draft.recommended_action.clone();
                        }
                    }
                    Ok(alert)
                })
                .await?;

            if alert.is_open() {
                if alert.occurrences == 1 {
                    warn!(alert_id = %alert.id, component = %alert.component, severity = ?alert.severity, message = %alert.message, "Alert raised");
                }
                return Ok(alert);
            }

            // The indexed alert was resolved concurrently; point the index
            // at a new alert unless someone already did.
            self.store
                .write_atomic(&index, |current: Option<AlertId>| {
                    Ok(match current {
                        Some(id) if id != open_id => id,
                        _ => fresh.id.clone(),
                    })
                })
                .await?;
        }
        Err(CoordinatorError::Conflict(format!(
            "could not open alert for {}",
            draft.component
        )))
    }

    /// Resolve an alert by id. Resolving a resolved alert is a no-op.
    pub async fn resolve(&self, id: &AlertId, resolution: &str) -> Result<HealthAlert> {
        let now = Utc::now();
        let alert = self
            .store
            .update(&alert_path(id), |mut alert: HealthAlert| {
                alert.resolve(resolution, now);
                Ok(alert)
            })
            .await?;
        self.clear_index(&alert).await?;
        info!(alert_id = %id, component = %alert.component, resolution, "Alert resolved");
        Ok(alert)
    }

    /// Resolve the open alert for `component`, if any.
    pub async fn auto_resolve(&self, component: &str, resolution: &str) -> Result<Option<HealthAlert>> {
        match self.open_for(component).await? {
            Some(alert) => Ok(Some(self.resolve(&alert.id, resolution).await?)),
            None => Ok(None),
        }
    }

    /// The open alert for `component`.
    pub async fn open_for(&self, component: &str) -> Result<Option<HealthAlert>> {
        let Some(id) = self
            .store
            .get::<AlertId>(&open_index_path(component))
            .await?
        else {
            return Ok(None);
        };
        Ok(self.get(&id).await?.filter(HealthAlert::is_open))
    }

    pub async fn get(&self, id: &AlertId) -> Result<Option<HealthAlert>> {
        self.store.get(&alert_path(id)).await
    }

    /// Alerts newest first; resolved ones only when asked for.
    pub async fn list(&self, include_resolved: bool) -> Result<Vec<HealthAlert>> {
        let mut alerts: Vec<HealthAlert> = self
            .store
            .list_values::<HealthAlert>(ALERT_DIR)
            .await?
            .into_iter()
            .filter(|a| include_resolved || a.is_open())
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn clear_index(&self, alert: &HealthAlert) -> Result<()> {
        let index = open_index_path(&alert.component);
        if self.store.get::<AlertId>(&index).await?.as_ref() == Some(&alert.id) {
            self.store.remove(&index).await?;
        }
        Ok(())
    }
}

fn alert_path(id: &AlertId) -> String {
    format!("{ALERT_DIR}/{id}")
}

fn open_index_path(component: &str) -> String {
    let key: String = component
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{OPEN_INDEX_DIR}/{}", key.trim_start_matches('.'))
}
