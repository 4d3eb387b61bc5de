//! Bounded background pool for consolidation and message analysis.
//!
//! - Bounded queue (`queue_capacity`); a full queue drops the job with a warning
//! - `workers` tasks share one receiver
//! - Failures are logged and published on a bounded error channel
//! - `shutdown` closes the queue and waits for in-flight jobs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::{
    request_analysis, request_consolidation, ConsolidationInput, GenerationProvider,
};
use crate::error::MemoryError;
use crate::mood::MoodTracker;
use crate::note::{AddNoteOutcome, NoteStore, Scope};
use crate::relationship::SocialGraph;

/// Work that runs off the reply path.
#[derive(Debug, Clone)]
pub enum BackgroundJob {
    /// Extract durable facts from one exchange into the note store.
    Consolidate {
        server_id: String,
        author_id: String,
        author_name: String,
        user_text: String,
        reply_text: String,
    },
    /// Classify a message; feeds the social graph and the mood window.
    Analyze {
        partition_id: String,
        text: String,
        participants: Vec<String>,
        /// False when the caller already supplied a sentiment score.
        record_sentiment: bool,
    },
}

impl BackgroundJob {
    pub fn kind(&self) -> &'static str {
        match self {
            BackgroundJob::Consolidate { .. } => "consolidate",
            BackgroundJob::Analyze { .. } => "analyze",
        }
    }

    fn target(&self) -> &str {
        match self {
            BackgroundJob::Consolidate { author_id, .. } => author_id,
            BackgroundJob::Analyze { partition_id, .. } => partition_id,
        }
    }
}

/// A job that failed, as published on the error channel.
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub kind: String,
    pub target: String,
    pub error: String,
}

/// Counters since the pool started.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Stores a job may touch.
pub struct JobContext {
    pub notes: NoteStore,
    pub social: SocialGraph,
    pub mood: MoodTracker,
    pub generator: Arc<dyn GenerationProvider>,
}

impl JobContext {
    async fn run(&self, job: &BackgroundJob) -> Result<(), MemoryError> {
        match job {
            BackgroundJob::Consolidate {
                server_id,
                author_id,
                author_name,
                user_text,
                reply_text,
            } => {
                let user_notes = note_texts(&self.notes, Scope::User, author_id)?;
                let server_notes = note_texts(&self.notes, Scope::Server, server_id)?;
                let input = ConsolidationInput {
                    author_id,
                    author_name,
                    user_text,
                    reply_text,
                    user_notes: &user_notes,
                    server_notes: &server_notes,
                };
                let commands = request_consolidation(self.generator.as_ref(), &input).await?;

                let mut added = 0;
                for command in &commands {
                    let (scope, subject) = command.target(server_id);
                    if self.notes.add_note(scope, &subject, &command.text).await?
                        == AddNoteOutcome::Added
                    {
                        added += 1;
                    }
                }
                debug!(author_id = %author_id, proposed = commands.len(), added, "Consolidation done");
                Ok(())
            }
            BackgroundJob::Analyze {
                partition_id,
                text,
                participants,
                record_sentiment,
            } => {
                let analysis = request_analysis(self.generator.as_ref(), text).await?;
                self.social
                    .record_interaction(participants, analysis.topic.as_deref())?;
                if let (true, Some(score)) = (*record_sentiment, analysis.sentiment) {
                    self.mood.record_sample(partition_id, score)?;
                }
                debug!(partition_id = %partition_id, topic = ?analysis.topic, "Analysis done");
                Ok(())
            }
        }
    }
}

fn note_texts(notes: &NoteStore, scope: Scope, subject: &str) -> Result<Vec<String>, MemoryError> {
    Ok(notes
        .list_notes(scope, subject)?
        .into_iter()
        .map(|note| note.text)
        .collect())
}

/// Fixed set of worker tasks fed by a bounded queue.
pub struct BackgroundPool {
    tx: mpsc::Sender<BackgroundJob>,
    failures: StdMutex<Option<mpsc::Receiver<JobFailure>>>,
    counters: Arc<PoolCounters>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundPool {
    /// Spawn `workers` tasks. Must be called inside a tokio runtime.
    pub fn start(context: JobContext, workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (failure_tx, failure_rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let context = Arc::new(context);
        let counters = Arc::new(PoolCounters::default());

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&context),
                    failure_tx.clone(),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!(workers, queue_capacity, "Background pool started");
        Self {
            tx,
            failures: StdMutex::new(Some(failure_rx)),
            counters,
            handles,
        }
    }

    /// Queue a job without waiting. Returns false if it was dropped.
    pub fn submit(&self, job: BackgroundJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = job.kind(), subject = job.target(), "Background queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = job.kind(), "Background pool closed, dropping job");
                false
            }
        }
    }

    /// Take the failure channel. Only the first caller gets it.
    pub fn take_failures(&self) -> Option<mpsc::Receiver<JobFailure>> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.counters.snapshot()
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) -> PoolMetrics {
        let BackgroundPool {
            tx,
            counters,
            handles,
            ..
        } = self;
        drop(tx);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background worker ended abnormally");
            }
        }
        let metrics = counters.snapshot();
        info!(
            completed = metrics.completed,
            failed = metrics.failed,
            dropped = metrics.dropped,
            "Background pool stopped"
        );
        metrics
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<BackgroundJob>>>,
    context: Arc<JobContext>,
    failures: mpsc::Sender<JobFailure>,
    counters: Arc<PoolCounters>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        match context.run(&job).await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = id, kind = job.kind(), subject = job.target(), error = %e, "Background job failed");
                let failure = JobFailure {
                    kind: job.kind().to_string(),
                    target: job.target().to_string(),
                    error: e.to_string(),
                };
                if failures.try_send(failure).is_err() {
                    debug!(worker = id, "Failure channel full or closed");
                }
            }
        }
    }
    debug!(worker = id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::error::ProviderError;
    use crate::testing::{MapEmbedder, ScriptedGenerator};

    fn context(db: &Db, responses: Vec<Result<String, ProviderError>>) -> JobContext {
        let embedder = Arc::new(MapEmbedder::new().with("Has a cat named Miso", vec![1.0, 0.0]));
        JobContext {
            notes: NoteStore::new(db.clone(), embedder),
            social: SocialGraph::new(db.clone()),
            mood: MoodTracker::new(db.clone(), 10),
            generator: Arc::new(ScriptedGenerator::new(responses)),
        }
    }

    fn consolidate() -> BackgroundJob {
        BackgroundJob::Consolidate {
            server_id: "s1".into(),
            author_id: "u1".into(),
            author_name: "alice".into(),
            user_text: "My cat Miso is asleep".into(),
            reply_text: "Cute!".into(),
        }
    }

    #[tokio::test]
    async fn test_consolidation_adds_notes() {
        let db = Db::open_in_memory().unwrap();
        let reply = r#"{"notes": [{"scope": "user", "subject_id": "u1", "text": "Has a cat named Miso"}]}"#;
        let pool = BackgroundPool::start(context(&db, vec![Ok(reply.into())]), 1, 4);

        assert!(pool.submit(consolidate()));
        let metrics = pool.shutdown().await;
        assert_eq!(metrics.completed, 1);

        let notes = NoteStore::new(db, Arc::new(MapEmbedder::new()));
        let listed = notes.list_notes(Scope::User, "u1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].text, "Has a cat named Miso");
    }

    #[tokio::test]
    async fn test_analysis_feeds_graph_and_mood() {
        let db = Db::open_in_memory().unwrap();
        let reply = r#"{"topic": "games", "sentiment": 0.6}"#;
        let pool = BackgroundPool::start(context(&db, vec![Ok(reply.into())]), 2, 4);

        pool.submit(BackgroundJob::Analyze {
            partition_id: "c1".into(),
            text: "That boss fight was amazing".into(),
            participants: vec!["u1".into(), "u2".into()],
            record_sentiment: true,
        });
        pool.shutdown().await;

        let edge = SocialGraph::new(db.clone()).edge("u1", "u2").unwrap().unwrap();
        assert_eq!(edge.topic_count("games"), 1);
        let window = MoodTracker::new(db, 10).window("c1").unwrap().unwrap();
        assert!((window.average - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failures_reach_error_channel() {
        let db = Db::open_in_memory().unwrap();
        let pool = BackgroundPool::start(
            context(&db, vec![Ok("ADD_USER_MEMORY|u1|likes tea".into())]),
            1,
            4,
        );
        let mut failures = pool.take_failures().unwrap();
        assert!(pool.take_failures().is_none());

        pool.submit(consolidate());
        let metrics = pool.shutdown().await;
        assert_eq!(metrics.failed, 1);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.kind, "consolidate");
        assert_eq!(failure.target, "u1");
        assert!(failure.error.contains("malformed"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops() {
        let db = Db::open_in_memory().unwrap();
        let pool = BackgroundPool::start(context(&db, Vec::new()), 1, 1);

        // On a current-thread runtime the worker cannot run until we yield,
        // so the second submission finds the queue full.
        assert!(pool.submit(consolidate()));
        assert!(!pool.submit(consolidate()));
        assert_eq!(pool.metrics().dropped, 1);

        let metrics = pool.shutdown().await;
        assert_eq!(metrics.submitted, 1);
    }
}
