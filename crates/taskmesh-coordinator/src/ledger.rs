//! Token budget ledger.
//!
//! The ledger is a single document at `budget/ledger`. Every spend mutation
//! is a reserve, commit or release applied inside one optimistic write, so
//! concurrent coordinators never lose an update.

use chrono::{NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use taskmesh_core::{
    CommitReceipt, CoreError, DailySnapshot, EventType, NewEvent, Priority, Reservation,
    ReservationId, ReserveRequest, Severity, TokenBudget,
};

use crate::alerts::{AlertBook, AlertDraft};
use crate::bus::EventBus;
use crate::config::BudgetConfig;
use crate::error::{CoordinatorError, Result};
use crate::store::StateStore;

const LEDGER_PATH: &str = "budget/ledger";
const HISTORY_DIR: &str = "budget/history";
pub const EMERGENCY_COMPONENT: &str = "budget.emergency";

/// Store-backed token ledger.
#[derive(Clone)]
pub struct TokenLedger {
    store: StateStore,
    alerts: AlertBook,
    bus: EventBus,
}

impl TokenLedger {
    pub fn new(store: StateStore, alerts: AlertBook, bus: EventBus) -> Self {
        Self { store, alerts, bus }
    }

    /// Create the ledger from config if absent. Classes added to the config
    /// later are merged in; existing counters are never touched.
    pub async fn ensure_initialized(&self, config: &BudgetConfig) -> Result<TokenBudget> {
        let today = Utc::now().date_naive();
        self.store
            .write_atomic(LEDGER_PATH, |current: Option<TokenBudget>| {
                Ok(match current {
                    Some(mut budget) => {
                        for (class, allocated) in &config.allocations {
                            budget
                                .per_agent_class
                                .entry(class.clone())
                                .or_insert_with(|| taskmesh_core::ClassBudget::new(*allocated));
                        }
                        budget
                    }
                    None => TokenBudget::new(
                        config.global_total,
                        config.emergency_reserve,
                        config.allocations.clone(),
                        today,
                    ),
                })
            })
            .await
    }

    /// Hold tokens for a worker. Fails with `InsufficientBudget`.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Reservation> {
        let now = Utc::now();
        let mut reserved = None;
        let budget = self
            .store
            .update(LEDGER_PATH, |mut budget: TokenBudget| {
                reserved = Some(budget.reserve(req.clone(), now)?);
                Ok(budget)
            })
            .await?;
        let reservation = reserved
            .ok_or_else(|| CoordinatorError::Permanent("reservation lost in ledger write".into()))?;

        debug!(
            reservation_id = %reservation.id,
            class = %reservation.class,
            amount = reservation.amount,
            emergency = reservation.emergency,
            "Tokens reserved"
        );
        if reservation.emergency {
            warn!(reservation_id = %reservation.id, amount = reservation.amount, "Critical task drew on emergency reserve");
            self.check_emergency(&budget).await?;
        }
        Ok(reservation)
    }

    /// Charge actual usage and release the remainder.
    pub async fn commit(&self, id: &ReservationId, actual: u64) -> Result<CommitReceipt> {
        let mut receipt = None;
        let mut class = String::new();
        let budget = self
            .store
            .update(LEDGER_PATH, |mut budget: TokenBudget| {
                class = budget
                    .reservations
                    .get(id)
                    .map(|r| r.class.clone())
                    .unwrap_or_default();
                receipt = Some(budget.commit(id, actual)?);
                Ok(budget)
            })
            .await?;
        let receipt = receipt
            .ok_or_else(|| CoordinatorError::Permanent("commit lost in ledger write".into()))?;

        if receipt.overspend > 0 {
            warn!(reservation_id = %id, class = %class, overspend = receipt.overspend, "Worker used more than its reservation");
            self.bus
                .emit(
                    NewEvent::new(EventType::BudgetOverspend, self.bus.source().to_string())
                        .with_priority(Priority::High)
                        .with_payload(json!({
                            "reservation_id": id,
                            "class": class,
                            "actual": actual,
                            "charged": receipt.charged,
                            "overspend": receipt.overspend,
                        })),
                )
                .await;
        }
        if receipt.emergency {
            self.check_emergency(&budget).await?;
        }
        Ok(receipt)
    }

    /// Return a reservation unused. Releasing an unknown or already settled
    /// reservation returns `None`.
    pub async fn release(&self, id: &ReservationId) -> Result<Option<Reservation>> {
        let mut released = None;
        self.store
            .update(LEDGER_PATH, |mut budget: TokenBudget| {
                released = match budget.release(id) {
                    Ok(r) => Some(r),
                    Err(CoreError::ReservationNotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                };
                Ok(budget)
            })
            .await?;
        if let Some(r) = &released {
            debug!(reservation_id = %id, class = %r.class, amount = r.amount, "Reservation released");
        }
        Ok(released)
    }

    /// Drop reservations whose worker deadline has passed.
    pub async fn expire_reservations(&self, now: chrono::DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut expired = Vec::new();
        self.store
            .update(LEDGER_PATH, |mut budget: TokenBudget| {
                expired = budget.expire(now);
                Ok(budget)
            })
            .await?;
        for r in &expired {
            info!(reservation_id = %r.id, class = %r.class, amount = r.amount, "Reservation expired");
        }
        Ok(expired)
    }

    /// Roll the ledger over to `today` if its day is older. The closing
    /// day's totals are written to `budget/history/{day}` before `used` is
    /// zeroed, and rewritten with the exact figures afterwards.
    pub async fn daily_reset(&self, today: NaiveDate) -> Result<Option<DailySnapshot>> {
        let before = self.snapshot().await?;
        if before.day >= today {
            return Ok(None);
        }
        let provisional = before.clone().reset_daily(today, Utc::now());
        self.write_history(&provisional).await?;

        let mut archived = None;
        self.store
            .update(LEDGER_PATH, |mut budget: TokenBudget| {
                archived = if budget.day < today {
                    Some(budget.reset_daily(today, Utc::now()))
                } else {
                    None
                };
                Ok(budget)
            })
            .await?;

        let Some(snapshot) = archived else {
            // Another instance rolled over first.
            return Ok(None);
        };
        self.write_history(&snapshot).await?;
        info!(day = %snapshot.day, global_used = snapshot.global_used, "Daily budget reset");
        self.bus
            .emit(
                NewEvent::new(EventType::BudgetDailyReset, self.bus.source().to_string())
                    .with_payload(serde_json::to_value(&snapshot)?),
            )
            .await;
        Ok(Some(snapshot))
    }

    pub async fn snapshot(&self) -> Result<TokenBudget> {
        self.store.require(LEDGER_PATH).await
    }

    /// Archived daily totals, oldest first.
    pub async fn history(&self) -> Result<Vec<DailySnapshot>> {
        self.store.list_values(HISTORY_DIR).await
    }

    async fn write_history(&self, snapshot: &DailySnapshot) -> Result<()> {
        self.store
            .write_atomic(&format!("{HISTORY_DIR}/{}", snapshot.day), |_: Option<DailySnapshot>| {
                Ok(snapshot.clone())
            })
            .await?;
        Ok(())
    }

    async fn check_emergency(&self, budget: &TokenBudget) -> Result<()> {
        let reserve = &budget.emergency_reserve;
        if reserve.total == 0 || reserve.available() > 0 {
            return Ok(());
        }
        let alert = self
            .alerts
            .raise(
                AlertDraft::new(
                    EMERGENCY_COMPONENT,
                    Severity::Critical,
                    format!("emergency token reserve drained ({} of {} used)", reserve.used, reserve.total),
                )
                .with_diagnosis(format!(
                    "emergency used {} reserved {} total {}",
                    reserve.used, reserve.reserved, reserve.total
                ))
                .with_recommendation("raise the emergency reserve or wait for the daily reset"),
            )
            .await?;
        if alert.occurrences == 1 {
            self.bus
                .emit(
                    NewEvent::new(EventType::BudgetEmergencyDrained, self.bus.source().to_string())
                        .with_priority(Priority::Critical)
                        .with_payload(json!({ "alert_id": alert.id })),
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, StoreConfig};
    use crate::lock::LockManager;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use taskmesh_core::InstanceId;
    use tempfile::TempDir;

    async fn ledger(config: &BudgetConfig) -> (TempDir, TokenLedger) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), &StoreConfig::default())
            .await
            .unwrap();
        let alerts = AlertBook::new(store.clone());
        let locks = LockManager::new(
            store.clone(),
            InstanceId::new("i-1"),
            std::time::Duration::from_secs(60),
            std::time::Duration::from_millis(100),
        );
        let bus = EventBus::new(store.clone(), locks, alerts.clone(), "i-1", BusConfig::default());
        let ledger = TokenLedger::new(store, alerts, bus);
        ledger.ensure_initialized(config).await.unwrap();
        (dir, ledger)
    }

    fn request(class: &str, amount: u64, critical: bool) -> ReserveRequest {
        ReserveRequest {
            class: class.to_string(),
            amount,
            critical,
            worker_id: None,
            expires_at: Utc::now() + Duration::minutes(30),
        }
    }

    fn small_budget() -> BudgetConfig {
        BudgetConfig {
            global_total: 20_000,
            emergency_reserve: 4_000,
            allocations: BTreeMap::from([("security".to_string(), 5_000)]),
        }
    }

    #[tokio::test]
    async fn test_reserve_beyond_allocation_fails() {
        let (_dir, ledger) = ledger(&small_budget()).await;
        let err = ledger.reserve(request("security", 8_000, false)).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::InsufficientBudget { requested: 8_000, available: 5_000, .. }
        ));
        let budget = ledger.snapshot().await.unwrap();
        assert!(budget.reservations.is_empty());
    }

    #[tokio::test]
    async fn test_commit_releases_remainder() {
        let (_dir, ledger) = ledger(&small_budget()).await;
        let r = ledger.reserve(request("security", 3_000, false)).await.unwrap();
        let receipt = ledger.commit(&r.id, 1_200).await.unwrap();
        assert_eq!(receipt.charged, 1_200);
        assert_eq!(receipt.released, 1_800);

        let budget = ledger.snapshot().await.unwrap();
        assert_eq!(budget.per_agent_class["security"].used, 1_200);
        assert_eq!(budget.per_agent_class["security"].reserved, 0);
        assert!(budget.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_dir, ledger) = ledger(&small_budget()).await;
        let r = ledger.reserve(request("security", 1_000, false)).await.unwrap();
        assert!(ledger.release(&r.id).await.unwrap().is_some());
        assert!(ledger.release(&r.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_draining_emergency_raises_alert() {
        let (_dir, ledger) = ledger(&small_budget()).await;
        ledger.reserve(request("security", 5_000, false)).await.unwrap();
        assert!(ledger.reserve(request("security", 4_000, false)).await.is_err());

        ledger.reserve(request("security", 4_000, true)).await.unwrap();
        let alert = ledger.alerts.open_for(EMERGENCY_COMPONENT).await.unwrap();
        assert!(alert.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overcommit() {
        let (_dir, ledger) = ledger(&small_budget()).await;
        let mut handles = Vec::new();
        for _ in 0..12 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let mut attempts = 0;
                loop {
                    match ledger.reserve(request("security", 1_000, false)).await {
                        Err(CoordinatorError::Conflict(_)) if attempts < 20 => attempts += 1,
                        other => return other.is_ok(),
                    }
                }
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        let budget = ledger.snapshot().await.unwrap();
        assert!(budget.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_daily_reset_archives_history() {
        let (_dir, ledger) = ledger(&small_budget()).await;
        let r = ledger.reserve(request("security", 2_000, false)).await.unwrap();
        ledger.commit(&r.id, 2_000).await.unwrap();

        let today = ledger.snapshot().await.unwrap().day;
        assert!(ledger.daily_reset(today).await.unwrap().is_none());

        let tomorrow = today.succ_opt().unwrap();
        let snapshot = ledger.daily_reset(tomorrow).await.unwrap().unwrap();
        assert_eq!(snapshot.per_agent_class["security"], 2_000);
        assert_eq!(ledger.snapshot().await.unwrap().per_agent_class["security"].used, 0);
        assert_eq!(ledger.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_reservations_are_released() {
        let (_dir, ledger) = ledger(&small_budget()).await;
        let mut req = request("security", 1_000, false);
        req.expires_at = Utc::now() - Duration::seconds(1);
        ledger.reserve(req).await.unwrap();
        let expired = ledger.expire_reservations(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(ledger.snapshot().await.unwrap().total_reserved(), 0);
    }
}
