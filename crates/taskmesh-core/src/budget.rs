//! Token budget accounting.
//!
//! All spend flows through reserve -> commit/release. The functions here
//! operate on an in-memory [`TokenBudget`]; the coordinator applies them
//! inside a single atomic write of the ledger document so concurrent
//! instances never lose an update.

use crate::{CoreError, ReservationId, WorkerId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Allocation for one agent class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassBudget {
    pub allocated: u64,
    pub used: u64,
    pub reserved: u64,
}

impl ClassBudget {
    pub fn new(allocated: u64) -> Self {
        Self {
            allocated,
            ..Default::default()
        }
    }

    /// Tokens still free to reserve.
    pub fn available(&self) -> u64 {
        self.allocated
            .saturating_sub(self.used)
            .saturating_sub(self.reserved)
    }
}

/// Protected pool drawable only by critical tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyReserve {
    pub total: u64,
    pub used: u64,
    pub reserved: u64,
}

impl EmergencyReserve {
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used).saturating_sub(self.reserved)
    }
}

/// A provisional hold on tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub class: String,
    pub amount: u64,
    /// Drawn from the emergency reserve instead of the class allocation.
    pub emergency: bool,
    pub worker_id: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    /// Auto-expiry, normally the owning worker's deadline.
    pub expires_at: DateTime<Utc>,
}

/// Parameters of a reservation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveRequest {
    pub class: String,
    pub amount: u64,
    /// Only critical tasks may fall back to the emergency reserve.
    pub critical: bool,
    pub worker_id: Option<WorkerId>,
    pub expires_at: DateTime<Utc>,
}

/// Result of committing a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Tokens moved into `used`.
    pub charged: u64,
    /// Tokens returned to the pool.
    pub released: u64,
    /// Reported usage above the reservation that could not be charged.
    pub overspend: u64,
    pub emergency: bool,
}

/// Used totals captured before a daily reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub day: NaiveDate,
    pub global_used: u64,
    pub per_agent_class: BTreeMap<String, u64>,
    pub emergency_used: u64,
    pub recorded_at: DateTime<Utc>,
}

/// The single authoritative ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub global_total: u64,
    pub global_used: u64,
    pub per_agent_class: BTreeMap<String, ClassBudget>,
    pub emergency_reserve: EmergencyReserve,
    #[serde(default)]
    pub reservations: BTreeMap<ReservationId, Reservation>,
    /// Accounting day that `used` belongs to.
    pub day: NaiveDate,
}

impl TokenBudget {
    /// Create a ledger with per-class allocations.
    pub fn new(
        global_total: u64,
        emergency_total: u64,
        allocations: impl IntoIterator<Item = (String, u64)>,
        day: NaiveDate,
    ) -> Self {
        Self {
            global_total,
            global_used: 0,
            per_agent_class: allocations
                .into_iter()
                .map(|(class, allocated)| (class, ClassBudget::new(allocated)))
                .collect(),
            emergency_reserve: EmergencyReserve {
                total: emergency_total,
                ..Default::default()
            },
            reservations: BTreeMap::new(),
            day,
        }
    }

    /// Tokens outside the emergency reserve that are neither used nor reserved.
    pub fn general_headroom(&self) -> u64 {
        let committed: u64 = self
            .per_agent_class
            .values()
            .map(|c| c.used + c.reserved)
            .sum();
        self.global_total
            .saturating_sub(self.emergency_reserve.total)
            .saturating_sub(committed)
    }

    /// What a non-critical reservation for `class` could get right now.
    pub fn available_for(&self, class: &str) -> u64 {
        self.per_agent_class
            .get(class)
            .map(|c| c.available().min(self.general_headroom()))
            .unwrap_or(0)
    }

    /// Total tokens currently held by reservations.
    pub fn total_reserved(&self) -> u64 {
        self.reservations.values().map(|r| r.amount).sum()
    }

    /// Hold `req.amount` tokens.
    pub fn reserve(&mut self, req: ReserveRequest, now: DateTime<Utc>) -> Result<Reservation, CoreError> {
        if req.amount == 0 {
            return Err(CoreError::InvalidInput("reservation amount must be positive".into()));
        }
        if !self.per_agent_class.contains_key(&req.class) {
            return Err(CoreError::UnknownAgentClass(req.class));
        }

        let available = self.available_for(&req.class);
        let emergency = if req.amount <= available {
            false
        } else if req.critical && req.amount <= self.emergency_reserve.available() {
            true
        } else {
            return Err(CoreError::InsufficientBudget {
                class: req.class,
                requested: req.amount,
                available,
            });
        };

        if emergency {
            self.emergency_reserve.reserved += req.amount;
        } else if let Some(class) = self.per_agent_class.get_mut(&req.class) {
            class.reserved += req.amount;
        }

        let reservation = Reservation {
            id: ReservationId::generate(),
            class: req.class,
            amount: req.amount,
            emergency,
            worker_id: req.worker_id,
            created_at: now,
            expires_at: req.expires_at,
        };
        self.reservations
            .insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    /// Charge actual usage against a reservation and release the remainder.
    pub fn commit(&mut self, id: &ReservationId, actual: u64) -> Result<CommitReceipt, CoreError> {
        let reservation = self.take(id)?;
        let charged = actual.min(reservation.amount);

        if reservation.emergency {
            self.emergency_reserve.used += charged;
        } else if let Some(class) = self.per_agent_class.get_mut(&reservation.class) {
            class.used += charged;
        }
        self.recompute_used();

        Ok(CommitReceipt {
            charged,
            released: reservation.amount - charged,
            overspend: actual.saturating_sub(reservation.amount),
            emergency: reservation.emergency,
        })
    }

    /// Return a reservation to the pool without charging anything.
    pub fn release(&mut self, id: &ReservationId) -> Result<Reservation, CoreError> {
        self.take(id)
    }

    /// Release every reservation whose expiry has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Reservation> {
        let expired: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.id.clone())
            .collect();
        expired.iter().filter_map(|id| self.take(id).ok()).collect()
    }

    /// Zero `used` for a new day, returning the totals being archived.
    pub fn reset_daily(&mut self, day: NaiveDate, now: DateTime<Utc>) -> DailySnapshot {
        let snapshot = DailySnapshot {
            day: self.day,
            global_used: self.global_used,
            per_agent_class: self
                .per_agent_class
                .iter()
                .map(|(k, v)| (k.clone(), v.used))
                .collect(),
            emergency_used: self.emergency_reserve.used,
            recorded_at: now,
        };
        for class in self.per_agent_class.values_mut() {
            class.used = 0;
        }
        self.emergency_reserve.used = 0;
        self.global_used = 0;
        self.day = day;
        snapshot
    }

    /// Verify the accounting invariants, describing the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (name, class) in &self.per_agent_class {
            if class.used + class.reserved > class.allocated {
                return Err(format!(
                    "class {name}: used {} + reserved {} exceeds allocated {}",
                    class.used, class.reserved, class.allocated
                ));
            }
        }
        let e = &self.emergency_reserve;
        if e.used + e.reserved > e.total {
            return Err(format!("emergency reserve overdrawn: {} + {} > {}", e.used, e.reserved, e.total));
        }
        let total: u64 = self
            .per_agent_class
            .values()
            .map(|c| c.used + c.reserved)
            .sum::<u64>()
            + e.used
            + e.reserved;
        if total > self.global_total {
            return Err(format!("used + reserved {total} exceeds global total {}", self.global_total));
        }
        let reserved: u64 = self.per_agent_class.values().map(|c| c.reserved).sum::<u64>() + e.reserved;
        if reserved != self.total_reserved() {
            return Err(format!(
                "reserved counters {reserved} disagree with reservations {}",
                self.total_reserved()
            ));
        }
        Ok(())
    }

    fn take(&mut self, id: &ReservationId) -> Result<Reservation, CoreError> {
        let reservation = self
            .reservations
            .remove(id)
            .ok_or_else(|| CoreError::ReservationNotFound(id.to_string()))?;
        if reservation.emergency {
            self.emergency_reserve.reserved =
                self.emergency_reserve.reserved.saturating_sub(reservation.amount);
        } else if let Some(class) = self.per_agent_class.get_mut(&reservation.class) {
            class.reserved = class.reserved.saturating_sub(reservation.amount);
        }
        Ok(reservation)
    }

    fn recompute_used(&mut self) {
        self.global_used = self.per_agent_class.values().map(|c| c.used).sum::<u64>()
            + self.emergency_reserve.used;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn budget() -> TokenBudget {
        TokenBudget::new(
            100_000,
            10_000,
            [
                ("security".to_string(), 20_000),
                ("development".to_string(), 40_000),
            ],
            Utc::now().date_naive(),
        )
    }

    fn req(class: &str, amount: u64, critical: bool) -> ReserveRequest {
        ReserveRequest {
            class: class.to_string(),
            amount,
            critical,
            worker_id: None,
            expires_at: Utc::now() + Duration::minutes(5),
        }
    }

    #[test]
    fn test_reserve_beyond_remaining_fails() {
        let mut b = budget();
        b.per_agent_class.get_mut("security").unwrap().used = 15_000;
        let err = b.reserve(req("security", 8_000, false), Utc::now()).unwrap_err();
        assert_eq!(
            err,
            CoreError::InsufficientBudget {
                class: "security".to_string(),
                requested: 8_000,
                available: 5_000,
            }
        );
        assert!(b.reservations.is_empty());
    }

    #[test]
    fn test_commit_charges_actual_and_releases_rest() {
        let mut b = budget();
        let r = b.reserve(req("development", 8_000, false), Utc::now()).unwrap();
        assert_eq!(b.per_agent_class["development"].reserved, 8_000);

        let receipt = b.commit(&r.id, 3_000).unwrap();
        assert_eq!(receipt.charged, 3_000);
        assert_eq!(receipt.released, 5_000);
        assert_eq!(b.per_agent_class["development"].used, 3_000);
        assert_eq!(b.per_agent_class["development"].reserved, 0);
        assert_eq!(b.global_used, 3_000);
        b.check_invariants().unwrap();
    }

    #[test]
    fn test_overspend_is_clamped() {
        let mut b = budget();
        let r = b.reserve(req("security", 1_000, false), Utc::now()).unwrap();
        let receipt = b.commit(&r.id, 1_500).unwrap();
        assert_eq!(receipt.charged, 1_000);
        assert_eq!(receipt.overspend, 500);
        b.check_invariants().unwrap();
    }

    #[test]
    fn test_emergency_only_for_critical() {
        let mut b = budget();
        b.per_agent_class.get_mut("security").unwrap().used = 20_000;
        assert!(b.reserve(req("security", 5_000, false), Utc::now()).is_err());

        let r = b.reserve(req("security", 5_000, true), Utc::now()).unwrap();
        assert!(r.emergency);
        assert_eq!(b.emergency_reserve.reserved, 5_000);
        b.commit(&r.id, 5_000).unwrap();
        assert_eq!(b.emergency_reserve.available(), 5_000);
        b.check_invariants().unwrap();
    }

    #[test]
    fn test_double_commit_rejected() {
        let mut b = budget();
        let r = b.reserve(req("security", 100, false), Utc::now()).unwrap();
        b.commit(&r.id, 10).unwrap();
        assert!(matches!(
            b.commit(&r.id, 10),
            Err(CoreError::ReservationNotFound(_))
        ));
        assert_eq!(b.global_used, 10);
    }

    #[test]
    fn test_expire_releases_hold() {
        let mut b = budget();
        let mut r = req("security", 500, false);
        r.expires_at = Utc::now() - Duration::seconds(1);
        b.reserve(r, Utc::now()).unwrap();
        let expired = b.expire(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(b.per_agent_class["security"].reserved, 0);
    }

    #[test]
    fn test_global_headroom_limits_classes() {
        let mut b = TokenBudget::new(
            10_000,
            2_000,
            [("a".to_string(), 8_000), ("b".to_string(), 8_000)],
            Utc::now().date_naive(),
        );
        b.reserve(req("a", 6_000, false), Utc::now()).unwrap();
        // 8000 general tokens exist; only 2000 remain for class b.
        assert_eq!(b.available_for("b"), 2_000);
        assert!(b.reserve(req("b", 3_000, false), Utc::now()).is_err());
        b.check_invariants().unwrap();
    }

    #[test]
    fn test_daily_reset_zeroes_used_keeps_reservations() {
        let mut b = budget();
        let held = b.reserve(req("security", 100, false), Utc::now()).unwrap();
        let r = b.reserve(req("development", 400, false), Utc::now()).unwrap();
        b.commit(&r.id, 400).unwrap();

        let yesterday = b.day;
        let snap = b.reset_daily(yesterday.succ_opt().unwrap(), Utc::now());
        assert_eq!(snap.day, yesterday);
        assert_eq!(snap.global_used, 400);
        assert_eq!(b.global_used, 0);
        assert!(b.reservations.contains_key(&held.id));
    }

    #[test]
    fn test_unknown_class() {
        let mut b = budget();
        assert!(matches!(
            b.reserve(req("docs", 1, false), Utc::now()),
            Err(CoreError::UnknownAgentClass(_))
        ));
    }
}
