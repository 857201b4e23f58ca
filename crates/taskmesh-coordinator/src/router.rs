//! Capability-confidence router.
//!
//! Scores a task description against every agent class profile and picks a
//! strategy. Identical inputs always yield the identical decision: ties break
//! on the profile's static priority, then its name.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use taskmesh_core::{
    AgentClassProfile, EventType, NewEvent, RoutingDecision, RoutingStrategy, Task, TaskId,
    TaskStatus,
};

use crate::bus::EventBus;
use crate::config::RouterConfig;
use crate::error::{CoordinatorError, Result};
use crate::store::{task_path, StateStore};

const KEYWORD_WEIGHT: f64 = 0.5;
const BOOSTER_WEIGHT: f64 = 0.5;
const NEGATIVE_WEIGHT: f64 = 0.3;

/// Reason recorded on tasks the router could not classify.
pub const MANUAL_CLASSIFICATION: &str = "manual classification";

/// Cached outcome for a description, independent of the task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedDecision {
    confidence: BTreeMap<String, f64>,
    primary_agent_class: Option<String>,
    secondary_agent_classes: Vec<String>,
    strategy: RoutingStrategy,
    cached_at: DateTime<Utc>,
}

/// Lowercased description, as tokens and as a single-spaced string.
struct Normalized {
    tokens: BTreeSet<String>,
    text: String,
}

impl Normalized {
    fn new(input: &str) -> Self {
        let words: Vec<String> = input
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        Self {
            text: format!(" {} ", words.join(" ")),
            tokens: words.into_iter().collect(),
        }
    }

    /// Single words match tokens; multi-word terms match whole-word phrases.
    fn contains(&self, term: &str) -> bool {
        let term = Normalized::new(term);
        match term.tokens.len() {
            0 => false,
            1 => term.tokens.iter().all(|t| self.tokens.contains(t)),
            _ => self.text.contains(&term.text),
        }
    }
}

#[derive(Clone)]
pub struct Router {
    store: StateStore,
    bus: EventBus,
    config: RouterConfig,
    fingerprint: String,
}

impl Router {
    pub fn new(store: StateStore, bus: EventBus, config: RouterConfig) -> Self {
        let fingerprint = fingerprint(&config);
        Self {
            store,
            bus,
            config,
            fingerprint,
        }
    }

    pub fn profiles(&self) -> &[AgentClassProfile] {
        &self.config.classes
    }

    /// Score one profile against a description.
    pub fn score(&self, profile: &AgentClassProfile, description: &str) -> f64 {
        self.score_normalized(profile, &Normalized::new(description))
    }

    fn score_normalized(&self, profile: &AgentClassProfile, text: &Normalized) -> f64 {
        let hits = |terms: &[String]| terms.iter().filter(|t| text.contains(t)).count() as f64;
        let saturate = |n: f64, at: u32| (n / f64::from(at.max(1))).min(1.0);

        let keyword = saturate(hits(&profile.keywords), self.config.keyword_saturation);
        let booster = saturate(hits(&profile.boosters), self.config.booster_saturation);
        let negative = hits(&profile.negatives).min(1.0);

        let raw = KEYWORD_WEIGHT * keyword + BOOSTER_WEIGHT * booster - NEGATIVE_WEIGHT * negative;
        // Rounded so that float noise can never reorder equal scores.
        (raw.clamp(0.0, 1.0) * 1e9).round() / 1e9
    }

    /// Confidence per class.
    pub fn score_all(&self, description: &str) -> BTreeMap<String, f64> {
        let text = Normalized::new(description);
        self.config
            .classes
            .iter()
            .map(|p| (p.name.clone(), self.score_normalized(p, &text)))
            .collect()
    }

    /// Pure routing decision for a task. Does not touch the store.
    pub fn decide(&self, task: &Task) -> RoutingDecision {
        self.select(task.id.clone(), self.score_all(&task.description))
    }

    /// Pick a strategy from per-class confidence.
    ///
    /// Two close scores both above the multi threshold activate both
    /// classes. Otherwise a top score above the single threshold, or in the
    /// band between the minimum activation and the single threshold, routes
    /// to that class alone. Below the minimum activation the task is
    /// rejected for manual classification.
    pub fn select(&self, task_id: TaskId, confidence: BTreeMap<String, f64>) -> RoutingDecision {
        let mut ranked: Vec<(&AgentClassProfile, f64)> = self
            .config
            .classes
            .iter()
            .map(|p| (p, confidence.get(&p.name).copied().unwrap_or(0.0)))
            .collect();
        ranked.sort_by(|(pa, a), (pb, b)| {
            b.partial_cmp(a)
                .unwrap_or(Ordering::Equal)
                .then(pa.priority.cmp(&pb.priority))
                .then(pa.name.cmp(&pb.name))
        });

        let top = ranked.first().map(|(p, s)| (p.name.clone(), *s));
        let second = ranked.get(1).map(|(p, s)| (p.name.clone(), *s));
        let c = &self.config;

        let (strategy, primary, secondary) = match (top, second) {
            (Some((name, s1)), Some((second_name, s2)))
                if s1 >= c.multi_threshold && s2 >= c.multi_threshold && s1 - s2 <= c.multi_margin + 1e-9 =>
            {
                (RoutingStrategy::Multi, Some(name), vec![second_name])
            }
            (Some((name, s1)), _) if s1 >= c.minimum_activation => {
                if s1 < c.single_threshold {
                    debug!(%task_id, class = %name, confidence = s1, "Low-confidence single routing");
                }
                (RoutingStrategy::Single, Some(name), Vec::new())
            }
            _ => (RoutingStrategy::Reject, None, Vec::new()),
        };

        RoutingDecision {
            task_id,
            confidence,
            primary_agent_class: primary,
            secondary_agent_classes: secondary,
            strategy,
            decided_at: Utc::now(),
        }
    }

    /// Decide and persist, write-once, then apply the decision to the task.
    ///
    /// A task that already has a decision gets it back unchanged; applying it
    /// again is a no-op once the task reflects it.
    pub async fn route(&self, task: &Task) -> Result<RoutingDecision> {
        let path = decision_path(&task.id);
        if let Some(existing) = self.store.get::<RoutingDecision>(&path).await? {
            self.apply(&existing).await?;
            return Ok(existing);
        }

        let decision = match self.cached(&task.description).await? {
            Some(cached) => RoutingDecision {
                task_id: task.id.clone(),
                confidence: cached.confidence,
                primary_agent_class: cached.primary_agent_class,
                secondary_agent_classes: cached.secondary_agent_classes,
                strategy: cached.strategy,
                decided_at: Utc::now(),
            },
            None => {
                let decision = self.decide(task);
                self.remember(&task.description, &decision).await?;
                decision
            }
        };

        let decision = match self.store.create(&path, &decision).await {
            Ok(()) => decision,
            Err(CoordinatorError::DuplicateId(_)) => self.store.require(&path).await?,
            Err(e) => return Err(e),
        };

        self.apply(&decision).await?;
        Ok(decision)
    }

    /// Existing decision for a task.
    pub async fn decision(&self, task_id: &TaskId) -> Result<Option<RoutingDecision>> {
        self.store.get(&decision_path(task_id)).await
    }

    /// Operator classification of a task the router rejected.
    pub async fn classify_manually(&self, task_id: &TaskId, class: &str) -> Result<Task> {
        if !self.config.classes.iter().any(|p| p.name == class) {
            return Err(taskmesh_core::CoreError::UnknownAgentClass(class.to_string()).into());
        }
        let task = self
            .store
            .update(&task_path(task_id), |mut task: Task| {
                task.transition(TaskStatus::Pending)?;
                task.assigned_agent_class = Some(class.to_string());
                task.reason = None;
                Ok(task)
            })
            .await?;
        info!(%task_id, class, "Task classified manually");
        Ok(task)
    }

    async fn apply(&self, decision: &RoutingDecision) -> Result<()> {
        let task_id = &decision.task_id;
        let rejected = decision.strategy == RoutingStrategy::Reject;
        let mut changed = false;
        self.store
            .update(&task_path(task_id), |mut task: Task| {
                changed = false;
                // A class already on the task (manual or earlier) wins.
                if task.assigned_agent_class.is_some() {
                    return Ok(task);
                }
                if rejected {
                    if task.status == TaskStatus::Pending {
                        task.transition(TaskStatus::Blocked)?;
                        task.reason = Some(MANUAL_CLASSIFICATION.to_string());
                        changed = true;
                    }
                } else {
                    task.assigned_agent_class = decision.primary_agent_class.clone();
                    changed = true;
                }
                Ok(task)
            })
            .await?;
        if !changed {
            return Ok(());
        }

        let payload = json!({
            "task_id": task_id,
            "strategy": decision.strategy,
            "primary_agent_class": decision.primary_agent_class,
            "secondary_agent_classes": decision.secondary_agent_classes,
            "confidence": decision.confidence,
        });
        if rejected {
            info!(%task_id, "No agent class confident enough, task blocked for manual classification");
            self.bus
                .emit(
                    NewEvent::new(EventType::TaskRejected, self.bus.source().to_string())
                        .correlated(task_id.as_str())
                        .with_payload(payload),
                )
                .await;
        } else {
            info!(
                %task_id,
                strategy = ?decision.strategy,
                primary = decision.primary_agent_class.as_deref().unwrap_or("-"),
                confidence = decision.primary_confidence(),
                "Task routed"
            );
            self.bus
                .emit(
                    NewEvent::new(EventType::TaskRouted, self.bus.source().to_string())
                        .correlated(task_id.as_str())
                        .with_payload(payload),
                )
                .await;
        }
        Ok(())
    }

    async fn cached(&self, description: &str) -> Result<Option<CachedDecision>> {
        if self.config.cache_ttl_secs == 0 {
            return Ok(None);
        }
        let Some(entry) = self
            .store
            .get::<CachedDecision>(&self.cache_path(description))
            .await?
        else {
            return Ok(None);
        };
        let age = Utc::now() - entry.cached_at;
        Ok((age.num_seconds() < self.config.cache_ttl_secs as i64).then_some(entry))
    }

    async fn remember(&self, description: &str, decision: &RoutingDecision) -> Result<()> {
        if self.config.cache_ttl_secs == 0 {
            return Ok(());
        }
        let entry = CachedDecision {
            confidence: decision.confidence.clone(),
            primary_agent_class: decision.primary_agent_class.clone(),
            secondary_agent_classes: decision.secondary_agent_classes.clone(),
            strategy: decision.strategy,
            cached_at: Utc::now(),
        };
        self.store
            .write_atomic(&self.cache_path(description), |_: Option<CachedDecision>| Ok(entry.clone()))
            .await?;
        Ok(())
    }

    fn cache_path(&self, description: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.fingerprint.as_bytes());
        hasher.update(b"\n");
        hasher.update(Normalized::new(description).text.trim().as_bytes());
        format!("routing/cache/{}", hex::encode(hasher.finalize()))
    }
}

/// Store path of a task's routing decision.
pub fn decision_path(task_id: &TaskId) -> String {
    format!("routing/{task_id}")
}

/// Hash of everything that influences a decision besides the description.
fn fingerprint(config: &RouterConfig) -> String {
    let material = json!({
        "single": config.single_threshold,
        "multi": config.multi_threshold,
        "minimum": config.minimum_activation,
        "margin": config.multi_margin,
        "keyword_saturation": config.keyword_saturation,
        "booster_saturation": config.booster_saturation,
        "classes": config.classes,
    });
    hex::encode(Sha256::digest(material.to_string().as_bytes()))
}
