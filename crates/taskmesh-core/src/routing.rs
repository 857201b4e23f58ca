//! Agent class profiles and routing decisions.

use crate::{RoutingStrategy, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared capability profile of an agent class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentClassProfile {
    /// Class name (e.g. "security", "development").
    pub name: String,

    /// Static tie-break rank; lower wins.
    pub priority: u32,

    /// Single-word capability terms.
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Strong-signal phrases.
    #[serde(default)]
    pub boosters: Vec<String>,

    /// Terms that argue against this class.
    #[serde(default)]
    pub negatives: Vec<String>,
}

impl AgentClassProfile {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            keywords: Vec::new(),
            boosters: Vec::new(),
            negatives: Vec::new(),
        }
    }

    pub fn with_keywords(mut self, words: &[&str]) -> Self {
        self.keywords = words.iter().map(|w| w.to_string()).collect();
        self
    }

    pub fn with_boosters(mut self, phrases: &[&str]) -> Self {
        self.boosters = phrases.iter().map(|w| w.to_string()).collect();
        self
    }

    pub fn with_negatives(mut self, words: &[&str]) -> Self {
        self.negatives = words.iter().map(|w| w.to_string()).collect();
        self
    }
}

/// Immutable audit record of how a task was routed.
///
/// Written once, before any worker is dispatched for the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: TaskId,

    /// Confidence per agent class, each in `[0, 1]`.
    pub confidence: BTreeMap<String, f64>,

    /// Chosen primary class; `None` when rejected.
    pub primary_agent_class: Option<String>,

    /// Classes activated alongside the primary.
    pub secondary_agent_classes: Vec<String>,

    pub strategy: RoutingStrategy,

    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Confidence of the primary class, or 0.0 when rejected.
    pub fn primary_confidence(&self) -> f64 {
        self.primary_agent_class
            .as_ref()
            .and_then(|c| self.confidence.get(c))
            .copied()
            .unwrap_or(0.0)
    }

    /// All classes that should receive a worker, primary first.
    pub fn activated_classes(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(primary) = &self.primary_agent_class {
            out.push(primary.clone());
        }
        out.extend(self.secondary_agent_classes.iter().cloned());
        out
    }
}
