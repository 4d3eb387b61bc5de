//! Runtime configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::{
    ARCHIVE_MIN_LENGTH, DEFAULT_ARCHIVE_LIMIT, DEFAULT_CROSS_PARTITION_FACTOR,
    DEFAULT_HISTORY_LINES, DEFAULT_INTERVENTION_COOLDOWN_SECS, DEFAULT_INTERVENTION_MIN_LENGTH,
    DEFAULT_INTERVENTION_THRESHOLD, DEFAULT_MOOD_WINDOW, DEFAULT_NOTE_LIMIT,
    DEFAULT_RELEVANCE_THRESHOLD,
};

/// Engine parameters.
///
/// Every threshold was tuned empirically, so all of them are configurable
/// instead of being baked in. Missing TOML keys fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max cosine distance for single-partition archive hits.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
    /// Cross-partition hits must satisfy `distance <= threshold * factor`.
    #[serde(default = "default_cross_partition_factor")]
    pub cross_partition_factor: f32,
    /// Min similarity (exclusive) for an intervention.
    #[serde(default = "default_intervention_threshold")]
    pub intervention_threshold: f32,
    /// Seconds between two interventions in one conversation.
    #[serde(default = "default_intervention_cooldown_secs")]
    pub intervention_cooldown_secs: u64,
    /// Shortest message (chars) considered for an intervention.
    #[serde(default = "default_intervention_min_length")]
    pub intervention_min_length: usize,
    /// Shortest message (chars) that gets archived.
    #[serde(default = "default_archive_min_length")]
    pub archive_min_length: usize,
    /// Samples kept per mood window.
    #[serde(default = "default_mood_window")]
    pub mood_window: usize,
    /// Dialogue lines kept per conversation.
    #[serde(default = "default_history_lines")]
    pub history_lines: usize,
    /// Conversations with in-memory history; the least recently used is evicted.
    #[serde(default = "default_max_histories")]
    pub max_histories: usize,
    /// Notes returned per scope when building reply context.
    #[serde(default = "default_note_limit")]
    pub note_limit: usize,
    /// Archive hits returned per query when building reply context.
    #[serde(default = "default_archive_limit")]
    pub archive_limit: usize,
    /// Background worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pending background jobs before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_relevance_threshold() -> f32 {
    DEFAULT_RELEVANCE_THRESHOLD
}

fn default_cross_partition_factor() -> f32 {
    DEFAULT_CROSS_PARTITION_FACTOR
}

fn default_intervention_threshold() -> f32 {
    DEFAULT_INTERVENTION_THRESHOLD
}

fn default_intervention_cooldown_secs() -> u64 {
    DEFAULT_INTERVENTION_COOLDOWN_SECS
}

fn default_intervention_min_length() -> usize {
    DEFAULT_INTERVENTION_MIN_LENGTH
}

fn default_archive_min_length() -> usize {
    ARCHIVE_MIN_LENGTH
}

fn default_mood_window() -> usize {
    DEFAULT_MOOD_WINDOW
}

fn default_history_lines() -> usize {
    DEFAULT_HISTORY_LINES
}

fn default_max_histories() -> usize {
    1024
}

fn default_note_limit() -> usize {
    DEFAULT_NOTE_LIMIT
}

fn default_archive_limit() -> usize {
    DEFAULT_ARCHIVE_LIMIT
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: default_relevance_threshold(),
            cross_partition_factor: default_cross_partition_factor(),
            intervention_threshold: default_intervention_threshold(),
            intervention_cooldown_secs: default_intervention_cooldown_secs(),
            intervention_min_length: default_intervention_min_length(),
            archive_min_length: default_archive_min_length(),
            mood_window: default_mood_window(),
            history_lines: default_history_lines(),
            max_histories: default_max_histories(),
            note_limit: default_note_limit(),
            archive_limit: default_archive_limit(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    pub fn from_toml(content: &str) -> Result<Self, MemoryError> {
        let config: Self = toml::from_str(content).map_err(|e| MemoryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if !(0.0..=2.0).contains(&self.relevance_threshold) {
            return Err(MemoryError::Config(format!(
                "relevance_threshold must be within [0, 2] (got {})",
                self.relevance_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.cross_partition_factor) {
            return Err(MemoryError::Config(format!(
                "cross_partition_factor must be within [0, 1] (got {})",
                self.cross_partition_factor
            )));
        }
        if !(-1.0..=1.0).contains(&self.intervention_threshold) {
            return Err(MemoryError::Config(format!(
                "intervention_threshold must be within [-1, 1] (got {})",
                self.intervention_threshold
            )));
        }
        if self.mood_window == 0 {
            return Err(MemoryError::Config("mood_window must be at least 1".into()));
        }
        if self.max_histories == 0 {
            return Err(MemoryError::Config("max_histories must be at least 1".into()));
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(MemoryError::Config(
                "workers and queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Threshold used by cross-partition search.
    pub fn cross_partition_threshold(&self) -> f32 {
        self.relevance_threshold * self.cross_partition_factor
    }

    /// Intervention cooldown as a duration.
    pub fn intervention_cooldown(&self) -> Duration {
        Duration::from_secs(self.intervention_cooldown_secs)
    }
}
