//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new id from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a Task.
    TaskId
);

string_id!(
    /// Unique identifier for an ephemeral Worker.
    WorkerId
);

string_id!(
    /// Unique identifier for a HealthAlert.
    AlertId
);

string_id!(
    /// Identifier of a coordinator instance.
    InstanceId
);

string_id!(
    /// Identifier of a budget reservation held in the ledger.
    ReservationId
);

/// Monotonic identifier of an Event within its stream.
///
/// Ids start at 1 and are allocated through the stream's sequence document,
/// so ordering by id is creation order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    /// Create an EventId from its sequence number.
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Sequence number.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Zero-padded key used for store paths so lexical order matches id order.
    pub fn storage_key(&self) -> String {
        format!("{:020}", self.0)
    }

    /// Parse a storage key back into an id.
    pub fn from_storage_key(key: &str) -> Option<Self> {
        key.parse::<u64>().ok().map(Self)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_generate() {
        let id1 = TaskId::generate();
        let id2 = TaskId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_display() {
        let id = TaskId::new("test-123");
        assert_eq!(format!("{}", id), "test-123");
    }

    #[test]
    fn test_event_id_storage_key_sorts_numerically() {
        let a = EventId::new(9).storage_key();
        let b = EventId::new(10).storage_key();
        assert!(a < b);
        assert_eq!(EventId::from_storage_key(&b), Some(EventId::new(10)));
    }

    #[test]
    fn test_id_serializes_transparently() {
        let json = serde_json::to_string(&WorkerId::new("w-1")).unwrap();
        assert_eq!(json, "\"w-1\"");
    }
}
