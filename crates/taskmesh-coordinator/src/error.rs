//! Coordinator errors.
//!
//! Variants follow the recovery policy callers apply: transient errors are
//! retried with backoff, budget exhaustion returns the task to pending,
//! timeouts reclaim resources, permanent errors surface for an operator and
//! conflicts mean another instance won a race.

use thiserror::Error;

use taskmesh_core::CoreError;

/// Coordinator error type.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Short-lived failure worth retrying (network blip, guard contention).
    #[error("transient error: {0}")]
    Transient(String),

    /// Optimistic write lost after bounded retries, or a claim race was lost.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lock is held by another owner.
    #[error("lock '{name}' is held by {holder}")]
    Busy { name: String, holder: String },

    /// Not enough budget for a reservation.
    #[error("insufficient budget for '{class}': requested {requested}, available {available}")]
    InsufficientBudget {
        class: String,
        requested: u64,
        available: u64,
    },

    /// Worker or remediation deadline exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Retries exhausted or unrecoverable; needs an operator.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Submission used an id that already exists.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Submission named an unknown priority.
    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    /// Record not found in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// Domain rule violated.
    #[error(transparent)]
    Core(CoreError),

    /// Execution or remediation backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Whether a bounded backoff retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Busy { .. })
    }

    /// Classify an IO failure talking to a backend. Connectivity blips
    /// become `Transient`; everything else is a `Backend` error.
    pub fn backend_io(context: &str, e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            WouldBlock | Interrupted | TimedOut | ConnectionRefused | ConnectionReset
            | ConnectionAborted | NotConnected | BrokenPipe => {
                Self::Transient(format!("{context}: {e}"))
            }
            _ => Self::Backend(format!("{context}: {e}")),
        }
    }
}

impl From<CoreError> for CoordinatorError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InsufficientBudget {
                class,
                requested,
                available,
            } => Self::InsufficientBudget {
                class,
                requested,
                available,
            },
            CoreError::InvalidPriority(p) => Self::InvalidPriority(p),
            other => Self::Core(other),
        }
    }
}

impl From<toml::de::Error> for CoordinatorError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
