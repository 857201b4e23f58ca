//! Shared fixtures for coordinator integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use taskmesh_coordinator::config::{BudgetConfig, Config, HealthConfig, PoolConfig, StoreConfig};
use taskmesh_coordinator::health::{ComponentStatus, NoopTarget, RemediationTarget};
use taskmesh_coordinator::{Coordinator, ExecutionBackend, Result, WorkerContext};
use taskmesh_core::{ExecutionOutcome, TaskId, WorkerId, WorkerSpec};

#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Start and never report back.
    Silent,
    /// Report success with this many tokens.
    Complete(u64),
}

/// In-process execution backend that records every launch.
pub struct RecordingBackend {
    behavior: Behavior,
    launches: Mutex<Vec<(TaskId, WorkerId)>>,
}

impl RecordingBackend {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            launches: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> Vec<(TaskId, WorkerId)> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    async fn launch(&self, spec: WorkerSpec, ctx: WorkerContext) -> Result<()> {
        self.launches
            .lock()
            .unwrap()
            .push((spec.task_id.clone(), spec.worker_id.clone()));
        match self.behavior {
            Behavior::Silent => Ok(()),
            Behavior::Complete(tokens) => {
                ctx.heartbeat(tokens / 2).await?;
                ctx.complete(ExecutionOutcome::completed(
                    tokens,
                    json!({ "task": spec.task_id }),
                ))
                .await
            }
        }
    }
}

/// Component whose replicas come back when scaled, if `scale_fixes`.
pub struct ScriptedTarget {
    status: Mutex<ComponentStatus>,
    scale_fixes: bool,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedTarget {
    pub fn new(status: ComponentStatus, scale_fixes: bool) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            scale_fixes,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemediationTarget for ScriptedTarget {
    async fn get_status(&self, _component: &str) -> Result<ComponentStatus> {
        Ok(self.status.lock().unwrap().clone())
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
            self.status.lock().unwrap().replicas_ready = replicas;
        }
        Ok(())
    }

    async fn test_connectivity(&self, _component: &str) -> Result<bool> {
        Ok(self.status.lock().unwrap().replicas_ready > 0)
    }
}

/// Config for an instance sharing `state_dir`.
pub fn config(state_dir: &Path, instance: &str) -> Config {
    Config {
        instance_id: instance.to_string(),
        state_dir: state_dir.to_path_buf(),
        poll_interval_ms: 20,
        store: StoreConfig {
            conflict_retries: 40,
            ..StoreConfig::default()
        },
        pool: PoolConfig {
            max_concurrent_workers: 64,
            ..PoolConfig::default()
        },
        health: HealthConfig {
            components: Vec::new(),
            verify_timeout_ms: 200,
            verify_poll_ms: 20,
            ..HealthConfig::default()
        },
        ..Config::default()
    }
}

/// Budget large enough that only claim races limit spawning.
pub fn roomy_budget() -> BudgetConfig {
    let mut budget = BudgetConfig {
        global_total: 10_000_000,
        ..BudgetConfig::default()
    };
    for allocation in budget.allocations.values_mut() {
        *allocation = 2_000_000;
    }
    budget
}

pub async fn coordinator(config: Config, backend: Arc<dyn ExecutionBackend>) -> Coordinator {
    let coordinator = Coordinator::new(config, backend, Arc::new(NoopTarget))
        .await
        .unwrap();
    coordinator.start().await.unwrap();
    coordinator
}
