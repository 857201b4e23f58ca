//! TaskMesh Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - The shared state store
//! - Network or process management
//! - Runtime specifics
//!
//! Budget accounting and task state transitions live here as plain functions
//! over the domain types so every coordinator instance applies them the same
//! way inside its atomic store writes.

pub mod alert;
pub mod budget;
pub mod error;
pub mod event;
pub mod ids;
pub mod instance;
pub mod routing;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use alert::HealthAlert;
pub use budget::{
    ClassBudget, CommitReceipt, DailySnapshot, EmergencyReserve, Reservation, ReserveRequest,
    TokenBudget,
};
pub use error::CoreError;
pub use event::{Event, EventType, NewEvent};
pub use ids::{AlertId, EventId, InstanceId, ReservationId, TaskId, WorkerId};
pub use instance::InstanceRecord;
pub use routing::{AgentClassProfile, RoutingDecision};
pub use status::{AlertStatus, Priority, RoutingStrategy, Severity, TaskStatus, WorkerStatus};
pub use task::{Assignment, Lineage, Task, TaskSubmission};
pub use worker::{Directive, ExecutionOutcome, OutcomeStatus, Worker, WorkerSpec};
