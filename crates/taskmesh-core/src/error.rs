//! Core domain errors.

use thiserror::Error;

/// Core domain errors for TaskMesh.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Priority string did not name a known priority.
    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Not enough budget left to satisfy a reservation.
    #[error("Insufficient budget for '{class}': requested {requested}, available {available}")]
    InsufficientBudget {
        class: String,
        requested: u64,
        available: u64,
    },

    /// Reservation id is unknown (already committed, released or expired).
    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    /// Agent class has no budget allocation.
    #[error("Unknown agent class: {0}")]
    UnknownAgentClass(String),
}
