//! Coordinator configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config.
//! Routing thresholds and zombie timeouts are tuning knobs, not contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use taskmesh_core::{AgentClassProfile, InstanceId};

use crate::error::Result;
use crate::retry::Backoff;

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this coordinator instance.
    pub instance_id: String,

    /// Root directory of the shared state store.
    pub state_dir: PathBuf,

    /// HTTP status/metrics bind address; disabled when unset.
    pub http_addr: Option<String>,

    /// Daemon cycle interval (milliseconds).
    pub poll_interval_ms: u64,

    pub store: StoreConfig,
    pub router: RouterConfig,
    pub pool: PoolConfig,
    pub budget: BudgetConfig,
    pub bus: BusConfig,
    pub health: HealthConfig,
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: format!("coord-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            state_dir: PathBuf::from("state"),
            http_addr: None,
            poll_interval_ms: 2_000,
            store: StoreConfig::default(),
            router: RouterConfig::default(),
            pool: PoolConfig::default(),
            budget: BudgetConfig::default(),
            bus: BusConfig::default(),
            health: HealthConfig::default(),
            registry: RegistryConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file (or defaults), then apply `TASKMESH_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => toml::from_str(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("TASKMESH_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(id) = lookup("TASKMESH_INSTANCE_ID") {
            self.instance_id = id;
        }
        if let Some(addr) = lookup("TASKMESH_HTTP_ADDR") {
            self.http_addr = Some(addr);
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId::new(self.instance_id.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Shared state store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts for an optimistic write before surfacing a conflict.
    pub conflict_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Age after which a leftover write guard is considered abandoned.
    pub guard_ttl_ms: u64,
    /// How long `LockManager::acquire` keeps retrying.
    pub lock_acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 8,
            backoff_base_ms: 5,
            backoff_max_ms: 250,
            guard_ttl_ms: 5_000,
            lock_acquire_timeout_ms: 2_000,
        }
    }
}

impl StoreConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.conflict_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

/// Retry policy for calls to external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_ms: 200,
            max_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.attempts,
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms),
        )
    }
}

/// Router thresholds and agent class profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub single_threshold: f64,
    pub multi_threshold: f64,
    pub minimum_activation: f64,
    /// Maximum gap between the top two scores for a multi activation.
    pub multi_margin: f64,
    /// Keyword hits needed for a full keyword score.
    pub keyword_saturation: u32,
    /// Booster hits needed for a full booster score.
    pub booster_saturation: u32,
    /// Decision cache lifetime; 0 disables the cache.
    pub cache_ttl_secs: u64,
    pub classes: Vec<AgentClassProfile>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            single_threshold: 0.8,
            multi_threshold: 0.6,
            minimum_activation: 0.3,
            multi_margin: 0.1,
            keyword_saturation: 2,
            booster_saturation: 1,
            cache_ttl_secs: 3_600,
            classes: default_profiles(),
        }
    }
}

/// Built-in agent classes.
pub fn default_profiles() -> Vec<AgentClassProfile> {
    vec![
        AgentClassProfile::new("security", 0)
            .with_keywords(&[
                "security", "vulnerability", "injection", "xss", "csrf", "cve", "exploit",
                "auth", "authentication", "secret", "credential", "audit", "scan",
            ])
            .with_boosters(&["sql injection", "security vulnerability", "privilege escalation"])
            .with_negatives(&["documentation", "readme"]),
        AgentClassProfile::new("infrastructure", 1)
            .with_keywords(&[
                "deploy", "deployment", "kubernetes", "k8s", "helm", "cluster", "node",
                "database", "postgres", "redis", "monitoring", "scale", "restart",
            ])
            .with_boosters(&["pod crash", "out of memory", "disk full"])
            .with_negatives(&["typo"]),
        AgentClassProfile::new("development", 2)
            .with_keywords(&[
                "fix", "bug", "implement", "feature", "refactor", "code", "test", "api",
                "function", "endpoint", "coverage", "review",
            ])
            .with_boosters(&["unit test", "pull request", "code review"])
            .with_negatives(&["vulnerability", "exploit"]),
        AgentClassProfile::new("documentation", 3)
            .with_keywords(&["docs", "documentation", "readme", "guide", "tutorial", "catalog"])
            .with_boosters(&["write documentation", "update readme"])
            .with_negatives(&["exploit", "crash"]),
    ]
}

/// Worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum active workers spawned by this instance.
    pub max_concurrent_workers: usize,
    /// Interval at which workers are expected to heartbeat (seconds).
    pub heartbeat_interval_secs: u64,
    /// Heartbeat timeout used until enough history exists (seconds).
    pub default_heartbeat_timeout_secs: u64,
    /// Multiplier applied to the P95 duration.
    pub heartbeat_margin: f64,
    /// Completed durations kept for the P95 estimate.
    pub history_window: usize,
    /// Samples needed before the P95 estimate replaces the default.
    pub min_history: usize,
    pub max_retries: u32,
    /// Delay before a failed task may be claimed again (seconds).
    pub retry_backoff_secs: u64,
    /// Delay after a rejected reservation (seconds).
    pub budget_backoff_secs: u64,
    /// Worker deadline from spawn (seconds).
    pub default_deadline_secs: u64,
    pub default_token_budget: u64,
    /// Token budget per task type, overriding the default.
    pub token_budget_by_type: BTreeMap<String, u64>,
    /// Backoff for transient launch failures.
    pub launch_retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 8,
            heartbeat_interval_secs: 15,
            default_heartbeat_timeout_secs: 45,
            heartbeat_margin: 1.5,
            history_window: 50,
            min_history: 5,
            max_retries: 3,
            retry_backoff_secs: 30,
            budget_backoff_secs: 60,
            default_deadline_secs: 1_800,
            default_token_budget: 8_000,
            token_budget_by_type: BTreeMap::new(),
            launch_retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn token_budget_for(&self, task_type: &str) -> u64 {
        self.token_budget_by_type
            .get(task_type)
            .copied()
            .unwrap_or(self.default_token_budget)
    }
}

/// Initial ledger allocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub global_total: u64,
    pub emergency_reserve: u64,
    pub allocations: BTreeMap<String, u64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            global_total: 200_000,
            emergency_reserve: 20_000,
            allocations: [
                ("security", 40_000),
                ("infrastructure", 40_000),
                ("development", 60_000),
                ("documentation", 20_000),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        }
    }
}

/// Event bus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub stream: String,
    /// Handler attempts before dead-lettering.
    pub max_attempts: u32,
    /// Hard ceiling per handler invocation (milliseconds).
    pub handler_timeout_ms: u64,
    /// Delay before a failed event is retried (milliseconds).
    pub retry_backoff_ms: u64,
    /// Maximum pointers popped per dispatch cycle.
    pub batch_size: usize,
    /// How long an allocated event id may stay unwritten before correlated
    /// dispatch stops waiting for it (milliseconds).
    pub gap_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream: "coordination".to_string(),
            max_attempts: 5,
            handler_timeout_ms: 30_000,
            retry_backoff_ms: 500,
            batch_size: 200,
            gap_timeout_ms: 10_000,
        }
    }
}

/// Health and remediation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Components checked every health cycle.
    pub components: Vec<String>,
    /// Recent restarts that count as a restart loop.
    pub restart_threshold: u32,
    /// Budget for each verification check (milliseconds).
    pub verify_timeout_ms: u64,
    /// Poll interval inside a verification check (milliseconds).
    pub verify_poll_ms: u64,
    /// How often each component is checked, across all instances (seconds).
    pub check_interval_secs: u64,
    /// Backoff for transient remediation target failures.
    pub target_retry: RetryConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            restart_threshold: 3,
            verify_timeout_ms: 30_000,
            verify_poll_ms: 1_000,
            check_interval_secs: 60,
            target_retry: RetryConfig::default(),
        }
    }
}

/// Instance registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval of the background liveness heartbeat (seconds).
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which an instance's claims are released.
    pub stale_after_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            stale_after_secs: 60,
        }
    }
}

/// Command execution backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell used to run `command`.
    pub shell: String,
    /// Worker command line; the daemon refuses to start without one.
    pub command: Option<String>,
    /// Working directory for worker processes.
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            command: None,
            working_dir: None,
        }
    }
}
