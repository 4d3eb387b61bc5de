//! MemoryOrchestrator - one interface over every memory layer.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::analysis::GenerationProvider;
use crate::archive::{ArchiveMessage, ArchiveQuery, ArchiveStatus, ArchiveStore, BackfillReport};
use crate::config::EngineConfig;
use crate::db::Db;
use crate::embedding::{EmbedPurpose, EmbeddingProvider};
use crate::error::MemoryError;
use crate::history::ConversationHistory;
use crate::intervention::{InterventionDecision, InterventionGate};
use crate::mood::{Mood, MoodTracker, MoodWindow};
use crate::note::{NoteStore, Scope};
use crate::relationship::SocialGraph;
use crate::search::CrossPartitionSearch;
use crate::worker::{BackgroundJob, BackgroundPool, JobContext, JobFailure, PoolMetrics};

/// A message seen in a conversation.
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    pub partition_id: String,
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Sentiment in [-1, 1] if the caller already knows it.
    pub sentiment: Option<f64>,
    /// Other people present, for the social graph. The author is added
    /// automatically.
    pub participants: Vec<String>,
}

impl ObservedMessage {
    pub fn new(
        partition_id: impl Into<String>,
        id: impl Into<String>,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            id: id.into(),
            author_id: author_id.into(),
            author_name: author_name.into(),
            text: text.into(),
            timestamp: Utc::now(),
            sentiment: None,
            participants: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_sentiment(mut self, score: f64) -> Self {
        self.sentiment = Some(score);
        self
    }

    pub fn with_participants(mut self, participants: Vec<String>) -> Self {
        self.participants = participants;
        self
    }
}

/// What happened to an observed message.
#[derive(Debug, Clone, Serialize)]
pub struct ObserveOutcome {
    pub archived: bool,
    pub mood: Option<MoodWindow>,
    pub analysis_queued: bool,
}

/// Inputs for assembling reply context.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub partition_id: String,
    pub server_id: String,
    pub author_id: String,
    pub author_name: String,
    pub query_text: String,
    /// Other conversations the author may see, searched for supplementary hits.
    pub cross_partition_ids: Vec<String>,
}

/// Everything the reply generator is grounded in. Sections that failed to
/// load are empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplyContext {
    pub display_name: String,
    pub history: Vec<String>,
    pub user_notes: Vec<String>,
    pub server_notes: Vec<String>,
    /// `None` when the archive could not be read at all.
    pub archive: Option<ArchiveQuery>,
    pub cross_partition: Vec<String>,
    pub relationships: Vec<String>,
    pub mood: Option<Mood>,
}

impl ReplyContext {
    pub fn archive_lines(&self) -> Vec<String> {
        self.archive.as_ref().map(ArchiveQuery::lines).unwrap_or_default()
    }

    /// Plain-text rendering, one heading per non-empty section.
    pub fn render(&self) -> String {
        let mut out = format!("Speaking with: {}\n", self.display_name);
        let archive = self.archive_lines();
        let sections: [(&str, &[String]); 6] = [
            ("Recent conversation", self.history.as_slice()),
            ("About this user", self.user_notes.as_slice()),
            ("About this server", self.server_notes.as_slice()),
            ("From the archive", archive.as_slice()),
            ("From other channels", self.cross_partition.as_slice()),
            ("Relationships", self.relationships.as_slice()),
        ];
        for (title, lines) in sections {
            if lines.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {}\n", title));
            for line in lines {
                out.push_str(&format!("- {}\n", line));
            }
        }
        if let Some(mood) = self.mood {
            out.push_str(&format!("\nChannel mood: {}\n", mood));
        }
        out
    }
}

/// One completed exchange between a user and the agent.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub partition_id: String,
    pub server_id: String,
    pub author_id: String,
    pub author_name: String,
    pub user_text: String,
    pub agent_name: String,
    pub reply_text: String,
}

/// Engine-wide status.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub archive: ArchiveStatus,
    pub note_count: usize,
    pub background: Option<PoolMetrics>,
}

/// Composes the stores behind one interface.
///
/// Per-conversation state (dialogue history, intervention cooldowns) lives in
/// concurrent maps owned here; everything else is in SQLite. At most
/// `max_histories` conversations keep a history; the least recently used one
/// is dropped to make room.
pub struct MemoryOrchestrator {
    config: EngineConfig,
    notes: NoteStore,
    archive: ArchiveStore,
    search: CrossPartitionSearch,
    social: SocialGraph,
    mood: MoodTracker,
    gate: InterventionGate,
    histories: DashMap<String, ConversationHistory>,
    history_clock: AtomicU64,
    pool: Option<BackgroundPool>,
}

impl MemoryOrchestrator {
    /// Build the engine on an open database.
    ///
    /// With a generator, a background pool is started for consolidation and
    /// analysis; this requires a tokio runtime.
    pub fn new(
        db: Db,
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Option<Arc<dyn GenerationProvider>>,
    ) -> Result<Self, MemoryError> {
        config.validate()?;

        let notes = NoteStore::new(db.clone(), Arc::clone(&embedder));
        let archive = ArchiveStore::new(db.clone(), embedder, &config);
        let search = CrossPartitionSearch::new(archive.clone(), &config);
        let social = SocialGraph::new(db.clone());
        let mood = MoodTracker::new(db, config.mood_window);
        let gate = InterventionGate::new(&config);

        let pool = generator.map(|generator| {
            BackgroundPool::start(
                JobContext {
                    notes: notes.clone(),
                    social: social.clone(),
                    mood: mood.clone(),
                    generator,
                },
                config.workers,
                config.queue_capacity,
            )
        });

        Ok(Self {
            config,
            notes,
            archive,
            search,
            social,
            mood,
            gate,
            histories: DashMap::new(),
            history_clock: AtomicU64::new(0),
            pool,
        })
    }

    pub fn open(
        path: impl AsRef<Path>,
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Option<Arc<dyn GenerationProvider>>,
    ) -> Result<Self, MemoryError> {
        Self::new(Db::open(path)?, config, embedder, generator)
    }

    pub fn open_in_memory(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Option<Arc<dyn GenerationProvider>>,
    ) -> Result<Self, MemoryError> {
        Self::new(Db::open_in_memory()?, config, embedder, generator)
    }

    /// Open the database at `path`, or run on an in-memory store if it cannot
    /// be opened. Nothing is persisted in the fallback case.
    pub fn open_or_fallback(
        path: impl AsRef<Path>,
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Option<Arc<dyn GenerationProvider>>,
    ) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        let db = match Db::open(path) {
            Ok(db) => db,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Database unavailable, using in-memory store");
                Db::open_in_memory()?
            }
        };
        Self::new(db, config, embedder, generator)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn notes(&self) -> &NoteStore {
        &self.notes
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn search(&self) -> &CrossPartitionSearch {
        &self.search
    }

    pub fn social(&self) -> &SocialGraph {
        &self.social
    }

    pub fn mood(&self) -> &MoodTracker {
        &self.mood
    }

    pub fn gate(&self) -> &InterventionGate {
        &self.gate
    }

    /// Record an observed message in every layer that wants it.
    ///
    /// Never fails: each layer logs its own trouble and the rest carry on.
    pub async fn observe(&self, message: ObservedMessage) -> ObserveOutcome {
        let archived = match self
            .archive
            .add(
                &message.partition_id,
                &message.id,
                &message.text,
                &message.author_id,
                &message.author_name,
                message.timestamp,
            )
            .await
        {
            Ok(archived) => archived,
            Err(e) => {
                warn!(partition_id = %message.partition_id, id = %message.id, error = %e, "Archive write failed");
                false
            }
        };

        let mood = message.sentiment.and_then(|score| {
            match self.mood.record_sample(&message.partition_id, score) {
                Ok(window) => Some(window),
                Err(e) if e.is_validation() => {
                    debug!(partition_id = %message.partition_id, error = %e, "Ignoring sentiment");
                    None
                }
                Err(e) => {
                    warn!(partition_id = %message.partition_id, error = %e, "Mood update failed");
                    None
                }
            }
        });

        let analysis_queued = match &self.pool {
            Some(pool) => {
                let mut participants = message.participants.clone();
                participants.push(message.author_id.clone());
                pool.submit(BackgroundJob::Analyze {
                    partition_id: message.partition_id.clone(),
                    text: message.text.clone(),
                    participants,
                    record_sentiment: message.sentiment.is_none(),
                })
            }
            None => false,
        };

        ObserveOutcome {
            archived,
            mood,
            analysis_queued,
        }
    }

    /// Assemble reply context. Every section degrades to empty on failure.
    pub async fn build_context<F>(&self, request: &ContextRequest, resolver: F) -> ReplyContext
    where
        F: Fn(&str) -> Option<String>,
    {
        let display_name = match self.notes.nickname(&request.author_id) {
            Ok(Some(nickname)) => nickname,
            Ok(None) => request.author_name.clone(),
            Err(e) => {
                warn!(author_id = %request.author_id, error = %e, "Nickname lookup failed");
                request.author_name.clone()
            }
        };

        let (user_notes, server_notes) = self.relevant_notes(request).await;

        let archive = match self
            .archive
            .query(
                &request.partition_id,
                &request.query_text,
                self.config.archive_limit,
                None,
            )
            .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(partition_id = %request.partition_id, error = %e, "Archive query failed");
                None
            }
        };

        let others: Vec<String> = request
            .cross_partition_ids
            .iter()
            .filter(|id| **id != request.partition_id)
            .cloned()
            .collect();
        let cross_partition = match self
            .search
            .query(&request.query_text, &others, self.config.archive_limit, resolver)
            .await
        {
            Ok(hits) => hits.iter().map(|hit| hit.line()).collect(),
            Err(e) => {
                warn!(error = %e, "Cross-partition search failed");
                Vec::new()
            }
        };

        let relationships = match self.social.summarize(&request.author_id) {
            Ok(summaries) => summaries.into_iter().map(|s| s.description).collect(),
            Err(e) => {
                warn!(author_id = %request.author_id, error = %e, "Relationship lookup failed");
                Vec::new()
            }
        };

        let mood = match self.mood.window(&request.partition_id) {
            Ok(window) => window.map(|w| w.mood),
            Err(e) => {
                warn!(partition_id = %request.partition_id, error = %e, "Mood lookup failed");
                None
            }
        };

        ReplyContext {
            display_name,
            history: self.history(&request.partition_id),
            user_notes,
            server_notes,
            archive,
            cross_partition,
            relationships,
            mood,
        }
    }

    async fn relevant_notes(&self, request: &ContextRequest) -> (Vec<String>, Vec<String>) {
        let embedding = match self
            .notes
            .embedder()
            .embed(&request.query_text, EmbedPurpose::Query)
            .await
        {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Note query embedding failed");
                return (Vec::new(), Vec::new());
            }
        };

        let k = self.config.note_limit;
        let lookup = |scope: Scope, subject: &str| {
            self.notes
                .find_relevant(scope, subject, &embedding, k)
                .unwrap_or_else(|e| {
                    warn!(scope = %scope, subject, error = %e, "Note lookup failed");
                    Vec::new()
                })
        };
        (
            lookup(Scope::User, &request.author_id),
            lookup(Scope::Server, &request.server_id),
        )
    }

    /// Append a finished exchange to history and queue consolidation.
    ///
    /// Returns whether consolidation was queued.
    pub fn record_turn(&self, turn: ConversationTurn) -> bool {
        if !self.histories.contains_key(&turn.partition_id) {
            self.evict_stale_history();
        }
        {
            let stamp = self.history_clock.fetch_add(1, Ordering::Relaxed);
            let mut history = self
                .histories
                .entry(turn.partition_id.clone())
                .or_insert_with(|| ConversationHistory::new(self.config.history_lines));
            history.touch(stamp);
            history.push(format!("{}: {}", turn.author_name, turn.user_text));
            history.push(format!("{}: {}", turn.agent_name, turn.reply_text));
        }

        match &self.pool {
            Some(pool) => pool.submit(BackgroundJob::Consolidate {
                server_id: turn.server_id,
                author_id: turn.author_id,
                author_name: turn.author_name,
                user_text: turn.user_text,
                reply_text: turn.reply_text,
            }),
            None => false,
        }
    }

    /// Drop the least recently used history once the map is full.
    fn evict_stale_history(&self) {
        if self.histories.len() < self.config.max_histories {
            return;
        }
        let oldest = self
            .histories
            .iter()
            .min_by_key(|entry| entry.value().last_used())
            .map(|entry| entry.key().clone());
        if let Some(partition_id) = oldest {
            self.histories.remove(&partition_id);
            debug!(partition_id = %partition_id, "Evicted conversation history");
        }
    }

    /// Dialogue lines kept for a conversation, oldest first.
    pub fn history(&self, partition_id: &str) -> Vec<String> {
        self.histories
            .get(partition_id)
            .map(|history| history.lines())
            .unwrap_or_default()
    }

    /// Check whether the agent should chime in on `text`.
    pub async fn evaluate_intervention(&self, partition_id: &str, text: &str) -> InterventionDecision {
        self.evaluate_intervention_at(partition_id, text, Utc::now())
            .await
    }

    /// [`Self::evaluate_intervention`] with an explicit clock.
    pub async fn evaluate_intervention_at(
        &self,
        partition_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> InterventionDecision {
        let mut decision = self.gate.evaluate(&self.notes, partition_id, text, now).await;
        if let InterventionDecision::Triggered(intervention) = &mut decision {
            intervention.context = self.history(partition_id);
        }
        decision
    }

    /// Delete the whole archive. Returns the number of partitions removed.
    pub fn reset_archive(&self) -> Result<usize, MemoryError> {
        self.archive.reset_all()
    }

    pub async fn backfill<I>(&self, messages: I) -> BackfillReport
    where
        I: IntoIterator<Item = ArchiveMessage>,
    {
        self.archive.backfill(messages).await
    }

    pub fn status(&self) -> Result<EngineStatus, MemoryError> {
        Ok(EngineStatus {
            archive: self.archive.status()?,
            note_count: self.notes.all_notes()?.len(),
            background: self.pool.as_ref().map(BackgroundPool::metrics),
        })
    }

    pub fn set_nickname(&self, subject_id: &str, nickname: &str) -> Result<(), MemoryError> {
        self.notes.set_nickname(subject_id, nickname)
    }

    /// Failure channel of the background pool, if any. Only the first caller
    /// gets it.
    pub fn take_job_failures(&self) -> Option<tokio::sync::mpsc::Receiver<JobFailure>> {
        self.pool.as_ref().and_then(BackgroundPool::take_failures)
    }

    /// Drain queued background work and stop the workers.
    pub async fn shutdown(self) -> Option<PoolMetrics> {
        match self.pool {
            Some(pool) => Some(pool.shutdown().await),
            None => None,
        }
    }
}
