//! Instance registry.
//!
//! Each coordinator keeps `instances/{id}` fresh. A survivor that finds a
//! stale record takes over its claims so a dead instance cannot starve its
//! tasks.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use taskmesh_core::{EventType, InstanceId, InstanceRecord, NewEvent, TaskId};

use crate::bus::EventBus;
use crate::config::RegistryConfig;
use crate::error::{CoordinatorError, Result};
use crate::lock::LockManager;
use crate::store::StateStore;

const INSTANCE_DIR: &str = "instances";

/// Claims left behind by a reaped instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedInstance {
    pub instance_id: InstanceId,
    pub orphaned_tasks: Vec<TaskId>,
}

#[derive(Clone)]
pub struct InstanceRegistry {
    store: StateStore,
    locks: LockManager,
    bus: EventBus,
    instance: InstanceId,
    hostname: String,
    stale_after: chrono::Duration,
}

impl InstanceRegistry {
    pub fn new(
        store: StateStore,
        locks: LockManager,
        bus: EventBus,
        instance: InstanceId,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            store,
            locks,
            bus,
            instance,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            stale_after: chrono::Duration::from_std(Duration::from_secs(config.stale_after_secs))
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    /// Announce this instance. Returns claims left over from a previous run
    /// under the same id; nothing is running for them any more.
    pub async fn register(&self) -> Result<Vec<TaskId>> {
        let now = Utc::now();
        let mut leftover = Vec::new();
        self.store
            .write_atomic(&self.path(&self.instance), |current: Option<InstanceRecord>| {
                let mut record = InstanceRecord::new(self.instance.clone(), &self.hostname, now);
                leftover = current.map(|c| c.claimed_tasks).unwrap_or_default();
                record.claimed_tasks = leftover.clone();
                Ok(record)
            })
            .await?;
        info!(instance_id = %self.instance, hostname = %self.hostname, leftover_claims = leftover.len(), "Instance registered");
        Ok(leftover)
    }

    /// Refresh this instance's heartbeat, re-creating the record if a peer
    /// reaped it.
    pub async fn heartbeat(&self) -> Result<InstanceRecord> {
        let now = Utc::now();
        self.store
            .write_atomic(&self.path(&self.instance), |current: Option<InstanceRecord>| {
                let mut record = current.unwrap_or_else(|| {
                    warn!(instance_id = %self.instance, "Instance record missing, re-registering");
                    InstanceRecord::new(self.instance.clone(), &self.hostname, now)
                });
                record.heartbeat_at = now;
                Ok(record)
            })
            .await
    }

    /// Remove this instance's record on clean shutdown.
    pub async fn deregister(&self) -> Result<()> {
        self.store.remove(&self.path(&self.instance)).await?;
        info!(instance_id = %self.instance, "Instance deregistered");
        Ok(())
    }

    pub async fn add_claim(&self, task_id: &TaskId) -> Result<()> {
        self.update_claims(&self.instance, |r| r.add_claim(task_id)).await
    }

    /// Drop a claim from `owner`'s record, which may be another instance.
    pub async fn remove_claim(&self, owner: &InstanceId, task_id: &TaskId) -> Result<()> {
        self.update_claims(owner, |r| r.remove_claim(task_id)).await
    }

    pub async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>> {
        self.store.get(&self.path(id)).await
    }

    pub async fn instances(&self) -> Result<Vec<InstanceRecord>> {
        self.store.list_values(INSTANCE_DIR).await
    }

    pub async fn live_instances(&self) -> Result<Vec<InstanceRecord>> {
        let now = Utc::now();
        Ok(self
            .instances()
            .await?
            .into_iter()
            .filter(|r| !r.is_stale(now, self.stale_after))
            .collect())
    }

    pub async fn stale_instances(&self) -> Result<Vec<InstanceRecord>> {
        let now = Utc::now();
        Ok(self
            .instances()
            .await?
            .into_iter()
            .filter(|r| r.is_stale(now, self.stale_after))
            .collect())
    }

    /// Remove stale peers and hand back their claims.
    ///
    /// Each peer is reaped under `reap-{instance}` so only one survivor
    /// takes over a given instance's claims.
    pub async fn reap_stale(&self) -> Result<Vec<ReapedInstance>> {
        let mut reaped = Vec::new();
        for record in self.stale_instances().await? {
            if record.instance_id == self.instance {
                continue;
            }
            let lock = match self.locks.try_acquire(&format!("reap-{}", record.instance_id)).await {
                Ok(lock) => lock,
                Err(CoordinatorError::Busy { .. }) => continue,
                Err(e) => return Err(e),
            };
            let result = self.reap_one(&record.instance_id).await;
            self.locks.release(&lock).await?;
            if let Some(r) = result? {
                reaped.push(r);
            }
        }
        Ok(reaped)
    }

    async fn reap_one(&self, id: &InstanceId) -> Result<Option<ReapedInstance>> {
        // Re-read under the lock; the peer may have come back.
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        if !record.is_stale(Utc::now(), self.stale_after) {
            debug!(instance_id = %id, "Instance recovered before reaping");
            return Ok(None);
        }
        self.store.remove(&self.path(id)).await?;

        warn!(
            instance_id = %id,
            last_heartbeat = %record.heartbeat_at,
            orphaned = record.claimed_tasks.len(),
            "Reaped stale instance"
        );
        self.bus
            .emit(
                NewEvent::new(EventType::InstanceReaped, self.instance.to_string())
                    .with_payload(json!({
                        "instance_id": id,
                        "last_heartbeat": record.heartbeat_at,
                        "orphaned_tasks": record.claimed_tasks,
                    })),
            )
            .await;
        Ok(Some(ReapedInstance {
            instance_id: id.clone(),
            orphaned_tasks: record.claimed_tasks,
        }))
    }

    async fn update_claims<F>(&self, owner: &InstanceId, mut f: F) -> Result<()>
    where
        F: FnMut(&mut InstanceRecord),
    {
        let path = self.path(owner);
        match self
            .store
            .update(&path, |mut record: InstanceRecord| {
                f(&mut record);
                Ok(record)
            })
            .await
        {
            Ok(_) | Err(CoordinatorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn path(&self, id: &InstanceId) -> String {
        format!("{INSTANCE_DIR}/{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertBook;
    use crate::config::{BusConfig, StoreConfig};
    use tempfile::TempDir;

    fn registry(store: &StateStore, id: &str, stale_after_secs: u64) -> InstanceRegistry {
        let instance = InstanceId::new(id);
        let locks = LockManager::new(
            store.clone(),
            instance.clone(),
            Duration::from_secs(stale_after_secs),
            Duration::from_millis(100),
        );
        let bus = EventBus::new(
            store.clone(),
            locks.clone(),
            AlertBook::new(store.clone()),
            id,
            BusConfig::default(),
        );
        InstanceRegistry::new(
            store.clone(),
            locks,
            bus,
            instance,
            &RegistryConfig {
                heartbeat_interval_secs: 1,
                stale_after_secs,
            },
        )
    }

    async fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), &StoreConfig::default())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_register_and_claims() {
        let (_dir, store) = store().await;
        let a = registry(&store, "a", 60);
        assert!(a.register().await.unwrap().is_empty());
        let t = TaskId::new("t-1");
        a.add_claim(&t).await.unwrap();
        a.add_claim(&t).await.unwrap();
        assert_eq!(a.get(&InstanceId::new("a")).await.unwrap().unwrap().claimed_tasks, vec![t.clone()]);

        // A restart under the same id reports what it used to hold.
        assert_eq!(a.register().await.unwrap(), vec![t.clone()]);
        a.remove_claim(&InstanceId::new("a"), &t).await.unwrap();
        assert!(a.register().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reap_stale_returns_orphans_once() {
        let (_dir, store) = store().await;
        let dead = registry(&store, "dead", 60);
        dead.register().await.unwrap();
        dead.add_claim(&TaskId::new("t-9")).await.unwrap();
        store
            .update("instances/dead", |mut r: InstanceRecord| {
                r.heartbeat_at = Utc::now() - chrono::Duration::seconds(600);
                Ok(r)
            })
            .await
            .unwrap();

        let survivor = registry(&store, "alive", 60);
        survivor.register().await.unwrap();
        assert_eq!(survivor.live_instances().await.unwrap().len(), 1);

        let reaped = survivor.reap_stale().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].orphaned_tasks, vec![TaskId::new("t-9")]);
        assert!(survivor.reap_stale().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_recreates_reaped_record() {
        let (_dir, store) = store().await;
        let a = registry(&store, "a", 60);
        a.register().await.unwrap();
        store.remove("instances/a").await.unwrap();
        a.heartbeat().await.unwrap();
        assert!(a.get(&InstanceId::new("a")).await.unwrap().is_some());
    }
}
