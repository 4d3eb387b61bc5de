//! Contextual Memory Engine
//!
//! Layered memory for a conversational agent: curated per-subject notes, a
//! vector archive partitioned by conversation, pairwise topic counters between
//! participants, a rolling mood window per conversation and a cooldown-gated
//! intervention trigger.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use contextual_memory::{
//!     EngineConfig, HashingEmbedder, MemoryOrchestrator, ObservedMessage, MemoryError,
//! };
//!
//! # async fn run() -> Result<(), MemoryError> {
//! let engine = MemoryOrchestrator::open_in_memory(
//!     EngineConfig::default(),
//!     Arc::new(HashingEmbedder::default()),
//!     None,
//! )?;
//!
//! engine
//!     .observe(ObservedMessage::new("general", "m1", "u1", "alice", "I brewed green tea today"))
//!     .await;
//!
//! let hits = engine.archive().query("general", "tea", 3, None).await?;
//! for line in hits.lines() {
//!     println!("{}", line);
//! }
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod archive;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod history;
pub mod intervention;
pub mod mood;
pub mod note;
pub mod orchestrator;
pub mod relationship;
pub mod search;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Configuration Constants
// ============================================================================
//
// ## Retrieval thresholds
//
// ### DEFAULT_RELEVANCE_THRESHOLD (0.9)
// Maximum cosine distance (1 - similarity) an archive hit may have to be
// returned from a single-partition query. Tuned by hand; anything between
// 0.8 and 1.0 behaves reasonably with sentence embeddings.
//
// ### DEFAULT_CROSS_PARTITION_FACTOR (0.95)
// Cross-partition hits must beat `threshold * factor`. They are supplementary
// context, so the bar is a little higher.
//
// ### DEFAULT_INTERVENTION_THRESHOLD (0.78)
// Minimum cosine similarity between a message and a stored note for the bot
// to speak up unprompted. Strictly greater-than.
//
// ### DEFAULT_INTERVENTION_COOLDOWN_SECS (300)
// After an intervention fires, the same conversation is not evaluated again
// for this many seconds.
//
// ## Windows
//
// ### DEFAULT_MOOD_WINDOW (10)
// Rolling sentiment samples kept per conversation. There is no time decay;
// recency comes purely from the window size.
//
// ### DEFAULT_HISTORY_LINES (10)
// Dialogue lines kept per conversation for immediate context.

/// Maximum cosine distance for single-partition archive hits.
pub const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.9;

/// Multiplier applied to the relevance threshold for cross-partition hits.
pub const DEFAULT_CROSS_PARTITION_FACTOR: f32 = 0.95;

/// Minimum similarity (exclusive) for the intervention gate to fire.
pub const DEFAULT_INTERVENTION_THRESHOLD: f32 = 0.78;

/// Seconds a conversation stays in cooldown after an intervention.
pub const DEFAULT_INTERVENTION_COOLDOWN_SECS: u64 = 300;

/// Messages shorter than this (in characters) never trigger an intervention.
pub const DEFAULT_INTERVENTION_MIN_LENGTH: usize = 10;

/// Messages shorter than this (in characters) are not archived.
pub const ARCHIVE_MIN_LENGTH: usize = 5;

/// Number of samples kept in a mood window.
pub const DEFAULT_MOOD_WINDOW: usize = 10;

/// Averages above `+MOOD_BAND` are positive, below `-MOOD_BAND` negative.
pub const MOOD_BAND: f64 = 0.2;

/// Dialogue lines kept per conversation.
pub const DEFAULT_HISTORY_LINES: usize = 10;

/// Default number of notes returned per scope when building context.
pub const DEFAULT_NOTE_LIMIT: usize = 3;

/// Default number of archive hits returned per query.
pub const DEFAULT_ARCHIVE_LIMIT: usize = 5;

// ============================================================================
// Re-exports
// ============================================================================

pub use analysis::{
    ConsolidationInput, GenerationProvider, GenerationRequest, MessageAnalysis, NoteCommand,
};
pub use archive::{
    ArchiveEntry, ArchiveHit, ArchiveMessage, ArchiveQuery, ArchiveStatus, ArchiveStore,
    BackfillReport, PartitionStatus,
};
pub use config::EngineConfig;
pub use db::{default_db_path, partition_name, Db};
pub use embedding::{
    cosine_distance, cosine_similarity, EmbedPurpose, EmbeddingProvider, HashingEmbedder,
};
pub use error::{MemoryError, ProviderError};
pub use history::ConversationHistory;
pub use intervention::{GateState, Intervention, InterventionDecision, InterventionGate};
pub use mood::{Mood, MoodTracker, MoodWindow};
pub use note::{AddNoteOutcome, Note, NoteStore, Scope, ScoredNote};
pub use orchestrator::{
    ContextRequest, ConversationTurn, EngineStatus, MemoryOrchestrator, ObserveOutcome,
    ObservedMessage, ReplyContext,
};
pub use relationship::{RelationshipEdge, RelationshipSummary, SocialGraph, TopicCount};
pub use search::{CrossPartitionHit, CrossPartitionSearch};
pub use worker::{BackgroundJob, BackgroundPool, JobContext, JobFailure, PoolMetrics};
