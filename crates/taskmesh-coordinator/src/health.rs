//! Health checks and bounded remediation for external components.
//!
//! Each check walks a fixed diagnostic tree (liveness, recent restarts,
//! resource exhaustion, configuration drift), then tries the applicable
//! automatic actions in fixed order, each at most once and each followed by
//! a verification check. Reconfiguration is never automatic; it is only ever
//! recommended to an operator.
//!
//! Checks are cluster-wide: a component is checked under the `health-{name}`
//! lock and at most once per check interval across all instances, tracked in
//! the shared `health/last/{name}` record.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskmesh_core::{AlertId, EventType, InstanceId, NewEvent, Priority, Severity};

use crate::alerts::{AlertBook, AlertDraft};
use crate::bus::EventBus;
use crate::config::HealthConfig;
use crate::error::{CoordinatorError, Result};
use crate::lock::LockManager;
use crate::store::StateStore;

const EXHAUSTION_MARKERS: &[&str] = &[
    "out of memory",
    "oomkilled",
    "no space left",
    "disk full",
    "resource exhausted",
    "too many open files",
];

const DRIFT_MARKERS: &[&str] = &[
    "invalid configuration",
    "config error",
    "configuration error",
    "missing environment",
    "unknown flag",
    "schema mismatch",
];

/// What the compute platform reports about a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub replicas_ready: u32,
    pub recent_restarts: u32,
    #[serde(default)]
    pub recent_logs: Vec<String>,
}

/// The four operations remediation relies on.
#[async_trait]
pub trait RemediationTarget: Send + Sync {
    async fn get_status(&self, component: &str) -> Result<ComponentStatus>;

    async fn restart(&self, component: &str) -> Result<()>;

    async fn scale(&self, component: &str, replicas: u32) -> Result<()>;

    async fn test_connectivity(&self, component: &str) -> Result<bool>;
}

/// Target for deployments without a remediation platform. Reports every
/// component healthy and refuses to act.
#[derive(Debug, Clone, Default)]
pub struct NoopTarget;

#[async_trait]
impl RemediationTarget for NoopTarget {
    async fn get_status(&self, _component: &str) -> Result<ComponentStatus> {
        Ok(ComponentStatus {
            replicas_ready: 1,
            ..ComponentStatus::default()
        })
    }

    async fn restart(&self, component: &str) -> Result<()> {
        Err(CoordinatorError::Backend(format!(
            "no remediation target configured for {component}"
        )))
    }

    async fn scale(&self, component: &str, _replicas: u32) -> Result<()> {
        Err(CoordinatorError::Backend(format!(
            "no remediation target configured for {component}"
        )))
    }

    async fn test_connectivity(&self, _component: &str) -> Result<bool> {
        Ok(true)
    }
}

/// One node of the diagnostic tree that fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    NotLive { detail: String },
    NoReadyReplicas,
    RestartLoop { restarts: u32 },
    ResourceExhausted { evidence: String },
    ConfigDrift { evidence: String },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLive { detail } => write!(f, "not live ({detail})"),
            Self::NoReadyReplicas => f.write_str("zero ready replicas"),
            Self::RestartLoop { restarts } => write!(f, "{restarts} recent restarts"),
            Self::ResourceExhausted { evidence } => write!(f, "resource exhaustion: {evidence}"),
            Self::ConfigDrift { evidence } => write!(f, "configuration drift: {evidence}"),
        }
    }
}

/// Remediation actions, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    Restart,
    Rescale { replicas: u32 },
    Reconfigure,
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restart => f.write_str("restart"),
            Self::Rescale { replicas } => write!(f, "scale to {replicas}"),
            Self::Reconfigure => f.write_str("reconfigure"),
        }
    }
}

/// An automatic action that was tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAttempt {
    pub action: RemediationAction,
    /// The action ran and the verification check passed.
    pub verified: bool,
    pub detail: String,
}

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationReport {
    pub component: String,
    /// Component is healthy, either already or after remediation.
    pub success: bool,
    pub diagnosis: String,
    pub findings: Vec<Finding>,
    pub actions: Vec<ActionAttempt>,
    pub recommended_action: Option<String>,
    pub alert_id: Option<AlertId>,
}

impl RemediationReport {
    fn healthy(component: &str) -> Self {
        Self {
            component: component.to_string(),
            success: true,
            diagnosis: "healthy".to_string(),
            findings: Vec::new(),
            actions: Vec::new(),
            recommended_action: None,
            alert_id: None,
        }
    }
}

/// Last completed check of a component, shared by every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub checked_at: DateTime<Utc>,
    pub checked_by: InstanceId,
    pub success: bool,
}

/// Runs the diagnostic tree and remediation plan against a target.
#[derive(Clone)]
pub struct HealthEngine {
    store: StateStore,
    locks: LockManager,
    alerts: AlertBook,
    bus: EventBus,
    target: Arc<dyn RemediationTarget>,
    config: HealthConfig,
}

impl HealthEngine {
    pub fn new(
        store: StateStore,
        locks: LockManager,
        alerts: AlertBook,
        bus: EventBus,
        target: Arc<dyn RemediationTarget>,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            locks,
            alerts,
            bus,
            target,
            config,
        }
    }

    /// Check every configured component that is due. Failures are returned
    /// next to the reports so the caller can record them.
    pub async fn check_due(&self) -> (Vec<RemediationReport>, Vec<(String, CoordinatorError)>) {
        let mut reports = Vec::with_capacity(self.config.components.len());
        let mut failures = Vec::new();
        for component in &self.config.components {
            match self.check_if_due(component).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => {
                    warn!(component = %component, error = %e, "Health check failed");
                    failures.push((component.clone(), e));
                }
            }
        }
        (reports, failures)
    }

    /// Check `component` unless another instance is checking it right now
    /// or checked it within the check interval.
    pub async fn check_if_due(&self, component: &str) -> Result<Option<RemediationReport>> {
        let lock = match self.locks.try_acquire(&format!("health-{component}")).await {
            Ok(lock) => lock,
            Err(CoordinatorError::Busy { holder, .. }) => {
                debug!(component, %holder, "Component is being checked elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let result = async {
            let path = check_path(component);
            let interval = chrono::Duration::seconds(self.config.check_interval_secs as i64);
            if let Some(last) = self.last_check(component).await? {
                if Utc::now() - last.checked_at < interval {
                    return Ok(None);
                }
            }
            let report = self.check(component).await?;
            let record = CheckRecord {
                checked_at: Utc::now(),
                checked_by: self.locks.owner().clone(),
                success: report.success,
            };
            self.store
                .write_atomic(&path, |_: Option<CheckRecord>| Ok(record.clone()))
                .await?;
            Ok::<_, CoordinatorError>(Some(report))
        }
        .await;
        self.locks.release(&lock).await?;
        result
    }

    pub async fn last_check(&self, component: &str) -> Result<Option<CheckRecord>> {
        self.store.get(&check_path(component)).await
    }

    /// Diagnose `component` and remediate what can be remediated.
    pub async fn check(&self, component: &str) -> Result<RemediationReport> {
        let findings = self.diagnose(component).await;
        if findings.is_empty() {
            if let Some(alert) = self
                .alerts
                .auto_resolve(component, "condition cleared")
                .await?
            {
                self.emit_resolved(&alert.id, component, "condition cleared")
                    .await;
            }
            debug!(component, "Component healthy");
            return Ok(RemediationReport::healthy(component));
        }

        let mut diagnosis = findings
            .iter()
            .map(Finding::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        info!(component, diagnosis = %diagnosis, "Component unhealthy, attempting remediation");

        let mut actions = Vec::new();
        let mut success = false;
        for action in plan(&findings) {
            let attempt = self.attempt(component, action).await;
            let verified = attempt.verified;
            actions.push(attempt);
            if verified {
                success = true;
                break;
            }
        }
        for a in &actions {
            diagnosis.push_str(&format!("; {}: {}", a.action, a.detail));
        }

        let recommended_action = (!success).then(|| recommendation(&findings));
        let severity = if findings
            .iter()
            .any(|f| matches!(f, Finding::NotLive { .. } | Finding::NoReadyReplicas))
        {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let mut draft = AlertDraft::new(component, severity, format!("{component} unhealthy"))
            .with_diagnosis(diagnosis.clone());
        if let Some(rec) = &recommended_action {
            draft = draft.with_recommendation(rec.clone());
        }
        let alert = self.alerts.raise(draft).await?;
        if alert.occurrences == 1 {
            self.bus
                .emit(
                    NewEvent::new(EventType::AlertRaised, self.bus.source().to_string())
                        .correlated(format!("alert:{component}"))
                        .with_priority(if severity == Severity::Critical {
                            Priority::Critical
                        } else {
                            Priority::High
                        })
                        .with_payload(json!({
                            "alert_id": alert.id,
                            "component": component,
                            "severity": severity,
                            "diagnosis": diagnosis,
                        })),
                )
                .await;
        }

        let alert_id = alert.id.clone();
        if success {
            let resolution = actions
                .last()
                .map(|a| format!("remediated by {}", a.action))
                .unwrap_or_else(|| "remediated".to_string());
            self.alerts.resolve(&alert_id, &resolution).await?;
            self.emit_resolved(&alert_id, component, &resolution).await;
            info!(component, resolution = %resolution, "Component remediated");
        } else {
            warn!(
                component,
                diagnosis = %diagnosis,
                recommended = recommended_action.as_deref().unwrap_or("-"),
                "Automatic remediation exhausted, operator action needed"
            );
        }

        Ok(RemediationReport {
            component: component.to_string(),
            success,
            diagnosis,
            findings,
            actions,
            recommended_action,
            alert_id: Some(alert_id),
        })
    }

    /// Walk the diagnostic tree.
    async fn diagnose(&self, component: &str) -> Vec<Finding> {
        let mut findings = Vec::new();
        let status = match self.call("status", || self.target.get_status(component)).await {
            Ok(status) => status,
            Err(e) => {
                findings.push(Finding::NotLive {
                    detail: format!("status unavailable: {e}"),
                });
                return findings;
            }
        };

        match self
            .call("connectivity test", || self.target.test_connectivity(component))
            .await
        {
            Ok(true) => {}
            Ok(false) => findings.push(Finding::NotLive {
                detail: "connectivity test failed".to_string(),
            }),
            Err(e) => findings.push(Finding::NotLive {
                detail: format!("connectivity test error: {e}"),
            }),
        }
        if status.replicas_ready == 0 {
            findings.push(Finding::NoReadyReplicas);
        }
        if status.recent_restarts >= self.config.restart_threshold {
            findings.push(Finding::RestartLoop {
                restarts: status.recent_restarts,
            });
        }
        if let Some(line) = find_marker(&status.recent_logs, EXHAUSTION_MARKERS) {
            findings.push(Finding::ResourceExhausted { evidence: line });
        }
        if let Some(line) = find_marker(&status.recent_logs, DRIFT_MARKERS) {
            findings.push(Finding::ConfigDrift { evidence: line });
        }
        findings
    }

    async fn attempt(&self, component: &str, action: RemediationAction) -> ActionAttempt {
        let result = match action {
            RemediationAction::Restart => {
                self.call("restart", || self.target.restart(component)).await
            }
            RemediationAction::Rescale { replicas } => {
                self.call("scale", || self.target.scale(component, replicas)).await
            }
            RemediationAction::Reconfigure => Err(CoordinatorError::Permanent(
                "reconfiguration requires an operator".to_string(),
            )),
        };
        if let Err(e) = result {
            warn!(component, action = %action, error = %e, "Remediation action failed");
            return ActionAttempt {
                action,
                verified: false,
                detail: format!("failed: {e}"),
            };
        }
        let verified = self.verify(component).await;
        debug!(component, action = %action, verified, "Remediation action applied");
        ActionAttempt {
            action,
            verified,
            detail: if verified {
                "verified".to_string()
            } else {
                "applied, verification failed".to_string()
            },
        }
    }

    /// Poll until the component is ready and reachable, or the verification budget
    /// runs out.
    async fn verify(&self, component: &str) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.config.verify_timeout_ms);
        let poll = Duration::from_millis(self.config.verify_poll_ms.max(1));
        loop {
            let ready = matches!(
                self.bounded(self.target.get_status(component)).await,
                Ok(s) if s.replicas_ready > 0
            );
            if ready
                && matches!(
                    self.bounded(self.target.test_connectivity(component)).await,
                    Ok(true)
                )
            {
                return true;
            }
            if Instant::now() + poll > deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Run a target call under the verification timeout, retrying transient
    /// failures with the target backoff.
    async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.config
            .target_retry
            .backoff()
            .retry(what, || self.bounded(op()))
            .await
    }

    /// Run a target call under the verification timeout.
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = Duration::from_millis(self.config.verify_timeout_ms);
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CoordinatorError::Timeout(format!("remediation target call exceeded {limit:?}")))?
    }

    async fn emit_resolved(&self, alert_id: &AlertId, component: &str, resolution: &str) {
        self.bus
            .emit(
                NewEvent::new(EventType::AlertResolved, self.bus.source().to_string())
                    .correlated(format!("alert:{component}"))
                    .with_payload(json!({
                        "alert_id": alert_id,
                        "component": component,
                        "resolution": resolution,
                    })),
            )
            .await;
    }
}

fn check_path(component: &str) -> String {
    let name: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("health/last/{name}")
}

/// Automatic actions worth trying for `findings`, in fixed order.
fn plan(findings: &[Finding]) -> Vec<RemediationAction> {
    let mut actions = Vec::new();
    let wants_restart = findings.iter().any(|f| {
        matches!(
            f,
            Finding::NotLive { .. } | Finding::ResourceExhausted { .. }
        )
    });
    if wants_restart {
        actions.push(RemediationAction::Restart);
    }
    if findings.contains(&Finding::NoReadyReplicas) {
        actions.push(RemediationAction::Rescale { replicas: 1 });
    }
    actions
}

/// Manual step for an operator once automatic actions are exhausted.
fn recommendation(findings: &[Finding]) -> String {
    let drift = findings
        .iter()
        .any(|f| matches!(f, Finding::ConfigDrift { .. } | Finding::RestartLoop { .. }));
    if drift {
        format!(
            "{}: review recent configuration changes and roll back if needed",
            RemediationAction::Reconfigure
        )
    } else if findings
        .iter()
        .any(|f| matches!(f, Finding::ResourceExhausted { .. }))
    {
        "raise resource limits or free capacity, then restart".to_string()
    } else {
        "inspect the component manually; automatic restart and rescale did not recover it"
            .to_string()
    }
}

fn find_marker(logs: &[String], markers: &[&str]) -> Option<String> {
    logs.iter()
        .find(|line| {
            let lower = line.to_lowercase();
            markers.iter().any(|m| lower.contains(m))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, RetryConfig, StoreConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use taskmesh_core::{AlertStatus, InstanceId};
    use tempfile::TempDir;

    /// Scripted component: scaling brings replicas up if `scale_fixes`.
    struct FakeTarget {
        state: Mutex<ComponentStatus>,
        scale_fixes: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTarget {
        fn new(status: ComponentStatus, scale_fixes: bool) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(status),
                scale_fixes,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemediationTarget for FakeTarget {
        async fn get_status(&self, _component: &str) -> Result<ComponentStatus> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn restart(&self, component: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("restart {component}"));
            Ok(())
        }

        async fn scale(&self, component: &str, replicas: u32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("scale {component} {replicas}"));
            if self.scale_fixes {
                self.state.lock().unwrap().replicas_ready = replicas;
            }
            Ok(())
        }

        async fn test_connectivity(&self, _component: &str) -> Result<bool> {
            Ok(self.state.lock().unwrap().replicas_ready > 0)
        }
    }

    /// Down until restarted; the first `blips` restart calls drop the
    /// connection.
    struct FlakyTarget {
        ready: Mutex<bool>,
        blips: u32,
        restarts: AtomicU32,
    }

    #[async_trait]
    impl RemediationTarget for FlakyTarget {
        async fn get_status(&self, _component: &str) -> Result<ComponentStatus> {
            Ok(ComponentStatus {
                replicas_ready: u32::from(*self.ready.lock().unwrap()),
                ..ComponentStatus::default()
            })
        }

        async fn restart(&self, _component: &str) -> Result<()> {
            if self.restarts.fetch_add(1, Ordering::SeqCst) < self.blips {
                return Err(CoordinatorError::Transient("connection reset".into()));
            }
            *self.ready.lock().unwrap() = true;
            Ok(())
        }

        async fn scale(&self, _component: &str, _replicas: u32) -> Result<()> {
            Ok(())
        }

        async fn test_connectivity(&self, _component: &str) -> Result<bool> {
            Ok(*self.ready.lock().unwrap())
        }
    }

    fn engine_for(
        store: &StateStore,
        instance: &str,
        target: Arc<dyn RemediationTarget>,
    ) -> HealthEngine {
        let locks = LockManager::new(
            store.clone(),
            InstanceId::new(instance),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );
        let alerts = AlertBook::new(store.clone());
        let bus = EventBus::new(
            store.clone(),
            locks.clone(),
            alerts.clone(),
            instance,
            BusConfig::default(),
        );
        let config = HealthConfig {
            components: vec!["api".to_string()],
            verify_timeout_ms: 200,
            verify_poll_ms: 20,
            target_retry: RetryConfig {
                attempts: 3,
                base_ms: 1,
                max_ms: 5,
            },
            ..HealthConfig::default()
        };
        HealthEngine::new(store.clone(), locks, alerts, bus, target, config)
    }

    async fn engine(target: Arc<dyn RemediationTarget>) -> (TempDir, HealthEngine, AlertBook) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), &StoreConfig::default())
            .await
            .unwrap();
        let engine = engine_for(&store, "i-1", target);
        (dir, engine, AlertBook::new(store))
    }

    fn down() -> ComponentStatus {
        ComponentStatus {
            replicas_ready: 0,
            recent_restarts: 0,
            recent_logs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_zero_replicas_rescaled_and_alert_resolved() {
        let target = FakeTarget::new(down(), true);
        let (_dir, engine, alerts) = engine(target.clone()).await;

        let report = engine.check("api").await.unwrap();
        assert!(report.success);
        assert!(report.findings.contains(&Finding::NoReadyReplicas));
        assert_eq!(target.calls(), vec!["restart api", "scale api 1"]);
        assert_eq!(
            report.actions.last().unwrap().action,
            RemediationAction::Rescale { replicas: 1 }
        );

        let alert = alerts.get(&report.alert_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Resolved);
        assert!(alerts.open_for("api").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_remediation_leaves_alert_open_with_diagnosis() {
        let target = FakeTarget::new(down(), false);
        let (_dir, engine, alerts) = engine(target.clone()).await;

        let report = engine.check("api").await.unwrap();
        assert!(!report.success);
        assert_eq!(report.actions.len(), 2);
        assert!(report.recommended_action.is_some());

        let alert = alerts.open_for("api").await.unwrap().unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.diagnosis.contains("zero ready replicas"));
        assert!(alert.recommended_action.is_some());

        // A second failing check refreshes the same alert.
        engine.check("api").await.unwrap();
        assert_eq!(alerts.open_for("api").await.unwrap().unwrap().id, alert.id);
        assert_eq!(target.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_config_drift_is_never_automatic() {
        let target = FakeTarget::new(
            ComponentStatus {
                replicas_ready: 2,
                recent_restarts: 5,
                recent_logs: vec!["FATAL: invalid configuration key 'db.url'".to_string()],
            },
            true,
        );
        let (_dir, engine, _alerts) = engine(target.clone()).await;

        let report = engine.check("api").await.unwrap();
        assert!(!report.success);
        assert!(report.actions.is_empty());
        assert!(target.calls().is_empty());
        assert!(report.findings.iter().any(|f| matches!(f, Finding::ConfigDrift { .. })));
        assert!(report
            .recommended_action
            .unwrap()
            .starts_with("reconfigure"));
    }

    #[tokio::test]
    async fn test_healthy_check_auto_resolves() {
        let target = FakeTarget::new(down(), false);
        let (_dir, engine, alerts) = engine(target.clone()).await;
        engine.check("api").await.unwrap();
        assert!(alerts.open_for("api").await.unwrap().is_some());

        target.state.lock().unwrap().replicas_ready = 3;
        let report = engine.check("api").await.unwrap();
        assert!(report.success);
        assert_eq!(report.diagnosis, "healthy");
        assert!(alerts.open_for("api").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_restart_failures_are_retried() {
        let target = Arc::new(FlakyTarget {
            ready: Mutex::new(false),
            blips: 2,
            restarts: AtomicU32::new(0),
        });
        let (_dir, engine, alerts) = engine(target.clone()).await;

        let report = engine.check("api").await.unwrap();
        assert!(report.success);
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action, RemediationAction::Restart);
        assert_eq!(target.restarts.load(Ordering::SeqCst), 3);
        assert!(alerts.open_for("api").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_component_checked_once_per_interval_across_instances() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), &StoreConfig::default())
            .await
            .unwrap();
        let target = FakeTarget::new(down(), false);
        let a = engine_for(&store, "i-1", target.clone());
        let b = engine_for(&store, "i-2", target.clone());

        let (reports, failures) = a.check_due().await;
        assert_eq!(reports.len(), 1);
        assert!(failures.is_empty());
        assert!(b.check_if_due("api").await.unwrap().is_none());
        assert_eq!(target.calls(), vec!["restart api", "scale api 1"]);

        let last = b.last_check("api").await.unwrap().unwrap();
        assert_eq!(last.checked_by.as_str(), "i-1");
        assert!(!last.success);
    }

    #[tokio::test]
    async fn test_check_skipped_while_another_instance_holds_it() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), &StoreConfig::default())
            .await
            .unwrap();
        let target = FakeTarget::new(down(), true);
        let a = engine_for(&store, "i-1", target.clone());
        let b = engine_for(&store, "i-2", target.clone());

        let held = a.locks.try_acquire("health-api").await.unwrap();
        assert!(b.check_if_due("api").await.unwrap().is_none());
        assert!(target.calls().is_empty());

        a.locks.release(&held).await.unwrap();
        assert!(b.check_if_due("api").await.unwrap().is_some());
    }

    #[test]
    fn test_plan_order() {
        let findings = vec![
            Finding::NoReadyReplicas,
            Finding::NotLive {
                detail: "x".into(),
            },
        ];
        assert_eq!(
            plan(&findings),
            vec![
                RemediationAction::Restart,
                RemediationAction::Rescale { replicas: 1 }
            ]
        );
    }
}
