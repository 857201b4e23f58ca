//! Cross-process lock manager on top of the state store.
//!
//! A lock is a record at `locks/{name}` created with exclusive-create
//! semantics. It names its owning coordinator instance; when that instance's
//! registry heartbeat goes stale the lock may be force-released by anyone,
//! so a crashed owner cannot hold a lock forever.
//!
//! Removal is a guarded compare-and-delete on the lock record: a lock is only
//! removed if it is still the acquisition the caller inspected, so a lock
//! re-acquired in the meantime is never released by mistake.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskmesh_core::{InstanceId, InstanceRecord};

use crate::error::{CoordinatorError, Result};
use crate::retry::Backoff;
use crate::store::StateStore;

const LOCK_DIR: &str = "locks";

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub name: String,
    pub owner: InstanceId,
    pub acquired_at: DateTime<Utc>,
    /// Distinguishes this acquisition from later ones by the same owner.
    pub token: String,
}

/// Manages named locks for one coordinator instance.
#[derive(Debug, Clone)]
pub struct LockManager {
    store: StateStore,
    owner: InstanceId,
    stale_after: chrono::Duration,
    acquire_timeout: Duration,
    backoff: Backoff,
}

impl LockManager {
    pub fn new(
        store: StateStore,
        owner: InstanceId,
        stale_after: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            store,
            owner,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            acquire_timeout,
            backoff: Backoff::new(u32::MAX, Duration::from_millis(10), Duration::from_millis(200)),
        }
    }

    pub fn owner(&self) -> &InstanceId {
        &self.owner
    }

    /// Try once to take `name`. Returns `Busy` if someone live holds it.
    pub async fn try_acquire(&self, name: &str) -> Result<Lock> {
        let path = lock_path(name);
        for _ in 0..2 {
            let lock = Lock {
                name: name.to_string(),
                owner: self.owner.clone(),
                acquired_at: Utc::now(),
                token: uuid::Uuid::new_v4().to_string(),
            };
            match self.store.create(&path, &lock).await {
                Ok(()) => {
                    debug!(lock = name, owner = %self.owner, "Lock acquired");
                    return Ok(lock);
                }
                Err(CoordinatorError::DuplicateId(_)) => {}
                Err(e) => return Err(e),
            }

            let Some(holder) = self.store.get::<Lock>(&path).await? else {
                // Released between our create and read.
                continue;
            };
            if !self.owner_is_stale(&holder).await? {
                return Err(CoordinatorError::Busy {
                    name: name.to_string(),
                    holder: holder.owner.to_string(),
                });
            }
            warn!(lock = name, stale_owner = %holder.owner, "Force-releasing lock held by stale owner");
            self.take_if(name, |current| current.token == holder.token)
                .await?;
        }
        Err(CoordinatorError::Busy {
            name: name.to_string(),
            holder: "unknown".to_string(),
        })
    }

    /// Configured default for [`LockManager::acquire`].
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Take `name`, retrying with backoff for at most `timeout`.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<Lock> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            match self.try_acquire(name).await {
                Err(e @ CoordinatorError::Busy { .. }) => {
                    let delay = self.backoff.delay(attempt);
                    if Instant::now() + delay > deadline {
                        return Err(e);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Release a lock we hold. Releasing a lock that was already
    /// force-released is not an error.
    pub async fn release(&self, lock: &Lock) -> Result<()> {
        let released = self
            .take_if(&lock.name, |current| current.token == lock.token)
            .await?;
        if released {
            debug!(lock = %lock.name, owner = %self.owner, "Lock released");
        } else {
            warn!(lock = %lock.name, owner = %self.owner, "Lock was no longer held at release");
        }
        Ok(())
    }

    /// Release `name` if it is still the acquisition identified by `token`,
    /// whichever instance does the releasing.
    pub async fn release_token(&self, name: &str, token: &str) -> Result<bool> {
        self.take_if(name, |current| current.token == token).await
    }

    /// Release `name` if `owner` holds it.
    pub async fn release_owned_by(&self, name: &str, owner: &InstanceId) -> Result<bool> {
        self.take_if(name, |current| &current.owner == owner).await
    }

    /// Operator or reaper release regardless of owner.
    pub async fn force_release(&self, name: &str) -> Result<bool> {
        let released = self.take_if(name, |_| true).await?;
        if released {
            info!(lock = name, "Lock force-released");
        }
        Ok(released)
    }

    /// Current holder of `name`.
    pub async fn holder(&self, name: &str) -> Result<Option<Lock>> {
        self.store.get(&lock_path(name)).await
    }

    /// Every currently held lock.
    pub async fn list(&self) -> Result<Vec<Lock>> {
        self.store.list_values(LOCK_DIR).await
    }

    /// Remove the lock file if `pred` holds for its current content.
    async fn take_if<P>(&self, name: &str, pred: P) -> Result<bool>
    where
        P: Fn(&Lock) -> bool,
    {
        self.store.remove_if(&lock_path(name), pred).await
    }

    async fn owner_is_stale(&self, lock: &Lock) -> Result<bool> {
        let now = Utc::now();
        let record: Option<InstanceRecord> = self
            .store
            .get(&format!("instances/{}", lock.owner))
            .await?;
        Ok(match record {
            Some(rec) => rec.is_stale(now, self.stale_after),
            // Unregistered owners get one staleness window from acquisition.
            None => now - lock.acquired_at > self.stale_after,
        })
    }
}

fn lock_path(name: &str) -> String {
    format!("{LOCK_DIR}/{}", sanitize(name))
}

/// Lock names become file names; keep them flat.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
