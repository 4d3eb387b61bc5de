//! InterventionGate - decides when the agent may speak up unprompted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::embedding::EmbedPurpose;
use crate::note::{Note, NoteStore};

/// Per-conversation gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Free to evaluate messages.
    Idle,
    /// Fired recently; cooling down.
    Triggered,
}

/// A fired intervention.
#[derive(Debug, Clone, Serialize)]
pub struct Intervention {
    pub partition_id: String,
    /// The stored fact that matched.
    pub note: Note,
    pub similarity: f32,
    pub triggered_at: DateTime<Utc>,
    /// Recent dialogue lines, attached by the orchestrator.
    pub context: Vec<String>,
}

/// Outcome of [`InterventionGate::evaluate`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum InterventionDecision {
    TooShort,
    CoolingDown { remaining_secs: u64 },
    EmbeddingFailed,
    NoMatch { best_similarity: Option<f32> },
    Triggered(Intervention),
}

impl InterventionDecision {
    pub fn intervention(&self) -> Option<&Intervention> {
        match self {
            InterventionDecision::Triggered(intervention) => Some(intervention),
            _ => None,
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self, InterventionDecision::Triggered(_))
    }
}

#[derive(Debug, Default)]
struct PartitionGate {
    last_triggered_at: Option<DateTime<Utc>>,
}

/// Cooldown and similarity gate, one state per conversation.
pub struct InterventionGate {
    states: DashMap<String, PartitionGate>,
    threshold: f32,
    cooldown: Duration,
    min_length: usize,
}

impl InterventionGate {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            states: DashMap::new(),
            threshold: config.intervention_threshold,
            cooldown: config.intervention_cooldown(),
            min_length: config.intervention_min_length,
        }
    }

    /// Evaluate one message against the whole note corpus.
    ///
    /// Length and cooldown are checked before any embedding work. The gate
    /// fires only when the best note's similarity is strictly above the
    /// threshold, and the cooldown is re-checked when committing so
    /// concurrent evaluations cannot both fire.
    pub async fn evaluate(
        &self,
        notes: &NoteStore,
        partition_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> InterventionDecision {
        let text = text.trim();
        if text.chars().count() < self.min_length {
            return InterventionDecision::TooShort;
        }
        if let Some(remaining) = self.remaining_cooldown(partition_id, now) {
            return InterventionDecision::CoolingDown {
                remaining_secs: remaining.as_secs(),
            };
        }

        let embedding = match notes.embedder().embed(text, EmbedPurpose::Query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(partition_id, error = %e, "Intervention embedding failed");
                return InterventionDecision::EmbeddingFailed;
            }
        };

        let best = match notes.best_match(&embedding) {
            Ok(best) => best,
            Err(e) => {
                warn!(partition_id, error = %e, "Note corpus unavailable for intervention");
                return InterventionDecision::NoMatch {
                    best_similarity: None,
                };
            }
        };

        let best_similarity = best.as_ref().map(|scored| scored.similarity);
        let Some(best) = best.filter(|scored| scored.similarity > self.threshold) else {
            return InterventionDecision::NoMatch { best_similarity };
        };

        if !self.try_trigger(partition_id, now) {
            debug!(partition_id, "Lost intervention race, already triggered");
            let remaining = self.remaining_cooldown(partition_id, now).unwrap_or_default();
            return InterventionDecision::CoolingDown {
                remaining_secs: remaining.as_secs(),
            };
        }

        info!(
            partition_id,
            similarity = best.similarity,
            subject_id = %best.note.subject_id,
            "Intervention triggered"
        );
        InterventionDecision::Triggered(Intervention {
            partition_id: partition_id.to_string(),
            note: best.note,
            similarity: best.similarity,
            triggered_at: now,
            context: Vec::new(),
        })
    }

    /// Current state of a conversation's gate.
    pub fn state(&self, partition_id: &str, now: DateTime<Utc>) -> GateState {
        if self.remaining_cooldown(partition_id, now).is_some() {
            GateState::Triggered
        } else {
            GateState::Idle
        }
    }

    pub fn last_triggered_at(&self, partition_id: &str) -> Option<DateTime<Utc>> {
        self.states
            .get(partition_id)
            .and_then(|gate| gate.last_triggered_at)
    }

    /// Time left in the cooldown, `None` when the gate is open.
    fn remaining_cooldown(&self, partition_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_triggered_at(partition_id)?;
        cooldown_left(last, now, self.cooldown)
    }

    /// Atomically re-check the cooldown and record a trigger.
    fn try_trigger(&self, partition_id: &str, now: DateTime<Utc>) -> bool {
        let mut gate = self.states.entry(partition_id.to_string()).or_default();
        if let Some(last) = gate.last_triggered_at {
            if cooldown_left(last, now, self.cooldown).is_some() {
                return false;
            }
        }
        gate.last_triggered_at = Some(now);
        true
    }
}

fn cooldown_left(last: DateTime<Utc>, now: DateTime<Utc>, cooldown: Duration) -> Option<Duration> {
    // A clock that went backwards counts as still cooling down.
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= cooldown {
        None
    } else {
        Some(cooldown - elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::note::Scope;
    use crate::testing::{FailingEmbedder, MapEmbedder};
    use chrono::TimeZone;
    use std::sync::Arc;

    const MESSAGE: &str = "Has anyone tried green tea?";

    async fn setup(embedder: Arc<MapEmbedder>) -> (NoteStore, InterventionGate) {
        let notes = NoteStore::new(Db::open_in_memory().unwrap(), embedder);
        notes
            .add_note(Scope::User, "u1", "alice loves green tea")
            .await
            .unwrap();
        (notes, InterventionGate::new(&EngineConfig::default()))
    }

    fn matching_embedder() -> Arc<MapEmbedder> {
        Arc::new(
            MapEmbedder::new()
                .with("alice loves green tea", vec![1.0, 0.0])
                .with(MESSAGE, vec![0.95, 0.05])
                .with("What is the weather like?", vec![0.0, 1.0]),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_fires_then_cools_down() {
        let embedder = matching_embedder();
        let (notes, gate) = setup(embedder.clone()).await;

        let decision = gate.evaluate(&notes, "c1", MESSAGE, t0()).await;
        let intervention = decision.intervention().unwrap();
        assert_eq!(intervention.note.text, "alice loves green tea");
        assert_eq!(gate.state("c1", t0()), GateState::Triggered);

        // Within the cooldown nothing is embedded.
        let calls = embedder.calls();
        let decision = gate
            .evaluate(&notes, "c1", MESSAGE, t0() + chrono::Duration::seconds(10))
            .await;
        assert!(matches!(
            decision,
            InterventionDecision::CoolingDown { remaining_secs: 290 }
        ));
        assert_eq!(embedder.calls(), calls);

        // Other conversations are unaffected.
        assert!(gate.evaluate(&notes, "c2", MESSAGE, t0()).await.is_triggered());

        // At exactly the cooldown boundary the gate is open again.
        let later = t0() + chrono::Duration::seconds(300);
        assert_eq!(gate.state("c1", later), GateState::Idle);
        assert!(gate.evaluate(&notes, "c1", MESSAGE, later).await.is_triggered());
        assert_eq!(gate.last_triggered_at("c1"), Some(later));
    }

    #[tokio::test]
    async fn test_short_message_skips_embedding() {
        let embedder = matching_embedder();
        let (notes, gate) = setup(embedder.clone()).await;
        let calls = embedder.calls();

        let decision = gate.evaluate(&notes, "c1", "  tea?  ", t0()).await;
        assert!(matches!(decision, InterventionDecision::TooShort));
        assert_eq!(embedder.calls(), calls);
    }

    #[tokio::test]
    async fn test_below_threshold_stays_idle() {
        let (notes, gate) = setup(matching_embedder()).await;

        let decision = gate
            .evaluate(&notes, "c1", "What is the weather like?", t0())
            .await;
        match decision {
            InterventionDecision::NoMatch { best_similarity } => {
                assert!(best_similarity.unwrap() < 0.78);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert_eq!(gate.state("c1", t0()), GateState::Idle);
        assert!(gate.last_triggered_at("c1").is_none());
    }

    #[tokio::test]
    async fn test_embedding_failure_changes_nothing() {
        let notes = NoteStore::new(Db::open_in_memory().unwrap(), Arc::new(FailingEmbedder));
        let gate = InterventionGate::new(&EngineConfig::default());

        let decision = gate.evaluate(&notes, "c1", MESSAGE, t0()).await;
        assert!(matches!(decision, InterventionDecision::EmbeddingFailed));
        assert_eq!(gate.state("c1", t0()), GateState::Idle);
    }

    #[test]
    fn test_commit_is_exclusive() {
        let gate = InterventionGate::new(&EngineConfig::default());
        assert!(gate.try_trigger("c1", t0()));
        assert!(!gate.try_trigger("c1", t0()));
        assert!(!gate.try_trigger("c1", t0() + chrono::Duration::seconds(299)));
        assert!(gate.try_trigger("c1", t0() + chrono::Duration::seconds(300)));
    }
}
