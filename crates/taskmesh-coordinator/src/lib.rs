//! TaskMesh Coordinator Library
//!
//! Decentralized task coordination for autonomous agent workers. Any number
//! of coordinator instances share one state directory; every mutation goes
//! through the versioned, lock-guarded [`StateStore`] so instances never need
//! to talk to each other directly.

pub mod alerts;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod health;
pub mod http;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod router;
pub mod store;

pub use alerts::{AlertBook, AlertDraft};
pub use bus::{EventBus, EventHandler, FnHandler};
pub use config::Config;
pub use coordinator::{request_stop, run_daemon, Coordinator, StatusReport, TickReport};
pub use error::{CoordinatorError, Result};
pub use executor::{CommandBackend, ExecutionBackend, NullBackend, WorkerContext, WorkerReporter};
pub use health::{HealthEngine, NoopTarget, RemediationTarget};
pub use ledger::TokenLedger;
pub use lock::LockManager;
pub use pool::{PoolManager, SpawnOutcome};
pub use registry::InstanceRegistry;
pub use router::Router;
pub use store::StateStore;
