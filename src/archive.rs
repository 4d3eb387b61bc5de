//! ArchiveStore - every qualifying observed message, one partition per conversation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::{partition_name, Db};
use crate::embedding::{
    cosine_distance, decode_embedding, encode_embedding, EmbedPurpose, EmbeddingProvider,
};
use crate::error::MemoryError;

/// An archived message.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub id: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub author_id: String,
    pub author_name: String,
    pub timestamp: DateTime<Utc>,
}

/// An archive entry with its cosine distance to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveHit {
    #[serde(flatten)]
    pub entry: ArchiveEntry,
    pub distance: f32,
}

impl ArchiveHit {
    /// Attributed, dated line: `[2024-01-15 10:30] alice: text`.
    pub fn line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.entry.timestamp.format("%Y-%m-%d %H:%M"),
            self.entry.author_name,
            self.entry.text
        )
    }
}

/// Outcome of a single-partition query.
///
/// Each way of coming back empty-handed is its own variant so callers can
/// pick the right fallback.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "hits", rename_all = "snake_case")]
pub enum ArchiveQuery {
    /// Nothing archived for this conversation yet.
    EmptyPartition,
    /// The query could not be embedded.
    EmbeddingFailed,
    /// The nearest-neighbour pass (plus author filter) produced nothing.
    NoCandidates,
    /// Candidates existed but none were within the relevance threshold.
    AllOverThreshold,
    /// Hits sorted by ascending distance.
    Hits(Vec<ArchiveHit>),
}

impl ArchiveQuery {
    pub fn hits(&self) -> &[ArchiveHit] {
        match self {
            ArchiveQuery::Hits(hits) => hits,
            _ => &[],
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.hits().iter().map(ArchiveHit::line).collect()
    }
}

/// A message to archive (used by backfill and the orchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMessage {
    pub conversation_id: String,
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Result of a historical backfill.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub added: usize,
}

/// Item count for one partition.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub name: String,
    pub conversation_id: String,
    pub item_count: usize,
}

/// Archive-wide status.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStatus {
    pub partition_count: usize,
    pub total_items: usize,
    pub partitions: Vec<PartitionStatus>,
}

/// Partitioned vector archive.
///
/// Partitions are created lazily on first write and are only removed by an
/// explicit [`ArchiveStore::reset_all`].
#[derive(Clone)]
pub struct ArchiveStore {
    db: Db,
    embedder: Arc<dyn EmbeddingProvider>,
    relevance_threshold: f32,
    min_length: usize,
}

impl ArchiveStore {
    pub fn new(db: Db, embedder: Arc<dyn EmbeddingProvider>, config: &EngineConfig) -> Self {
        Self {
            db,
            embedder,
            relevance_threshold: config.relevance_threshold,
            min_length: config.archive_min_length,
        }
    }

    /// Archive a message.
    ///
    /// The length check applies to the trimmed text; the text is stored as
    /// given. Returns `Ok(false)` without touching the store when the text is too
    /// short, the id is already present in the partition, or the text cannot
    /// be embedded. Re-inserting an id is always a no-op.
    pub async fn add(
        &self,
        conversation_id: &str,
        id: &str,
        text: &str,
        author_id: &str,
        author_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, MemoryError> {
        let trimmed = text.trim();
        if trimmed.chars().count() < self.min_length {
            return Ok(false);
        }

        let partition = partition_name(conversation_id);
        if self.contains(&partition, id)? {
            return Ok(false);
        }

        let embedding = match self.embedder.embed(trimmed, EmbedPurpose::Document).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(partition = %partition, id, error = %e, "Archive embedding failed");
                return Ok(false);
            }
        };

        let inserted = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO archive_partitions (name, conversation_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![partition, conversation_id, Utc::now().to_rfc3339()],
            )?;
            // The (partition, entry_id) unique key makes concurrent duplicates harmless.
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO archive_entries
                 (partition, entry_id, text, embedding, author_id, author_name, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    partition,
                    id,
                    text,
                    encode_embedding(&embedding),
                    author_id,
                    author_name,
                    timestamp.to_rfc3339()
                ],
            )?;
            tx.commit()?;
            Ok(inserted > 0)
        })?;

        if inserted {
            debug!(partition = %partition, id, "Archived message");
        }
        Ok(inserted)
    }

    /// Archive a prepared message.
    pub async fn add_message(&self, message: &ArchiveMessage) -> Result<bool, MemoryError> {
        self.add(
            &message.conversation_id,
            &message.id,
            &message.text,
            &message.author_id,
            &message.author_name,
            message.timestamp,
        )
        .await
    }

    /// Search one conversation's archive.
    ///
    /// Embeds the query once, pulls up to `2k` nearest neighbours, applies the
    /// optional author filter, drops hits further than the relevance threshold
    /// and returns the first `k`.
    pub async fn query(
        &self,
        conversation_id: &str,
        query_text: &str,
        k: usize,
        author_filter: Option<&str>,
    ) -> Result<ArchiveQuery, MemoryError> {
        if k == 0 {
            return Err(MemoryError::InvalidInput("k must be at least 1".to_string()));
        }

        let partition = partition_name(conversation_id);
        if self.item_count(&partition)? == 0 {
            return Ok(ArchiveQuery::EmptyPartition);
        }

        let query_embedding = match self.embedder.embed(query_text, EmbedPurpose::Query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(partition = %partition, error = %e, "Query embedding failed");
                return Ok(ArchiveQuery::EmbeddingFailed);
            }
        };

        let candidates = self.nearest(&partition, &query_embedding, k.saturating_mul(2))?;
        Ok(select_hits(
            candidates,
            author_filter,
            self.relevance_threshold,
            k,
        ))
    }

    /// Up to `limit` entries of a partition closest to `query_embedding`.
    ///
    /// Exact scan; ties keep insertion order.
    pub(crate) fn nearest(
        &self,
        partition: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ArchiveHit>, MemoryError> {
        let entries = self.db.with_conn(|conn| load_entries(conn, partition))?;

        let mut hits: Vec<ArchiveHit> = entries
            .into_iter()
            .map(|entry| {
                let distance = cosine_distance(query_embedding, &entry.embedding);
                ArchiveHit { entry, distance }
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Delete every partition. Returns how many partitions were removed.
    ///
    /// Destructive; confirmation is the caller's job.
    pub fn reset_all(&self) -> Result<usize, MemoryError> {
        let removed = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let count: i64 =
                tx.query_row("SELECT COUNT(*) FROM archive_partitions", [], |row| row.get(0))?;
            tx.execute("DELETE FROM archive_entries", [])?;
            tx.execute("DELETE FROM archive_partitions", [])?;
            tx.commit()?;
            Ok(count as usize)
        })?;
        info!(partitions = removed, "Archive reset");
        Ok(removed)
    }

    /// Archive historical messages, reusing `add`'s idempotency.
    ///
    /// Failures on individual messages are logged and skipped.
    pub async fn backfill<I>(&self, messages: I) -> BackfillReport
    where
        I: IntoIterator<Item = ArchiveMessage>,
    {
        let mut report = BackfillReport::default();
        for message in messages {
            report.processed += 1;
            match self.add_message(&message).await {
                Ok(true) => report.added += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    conversation_id = %message.conversation_id,
                    id = %message.id,
                    error = %e,
                    "Backfill insert failed"
                ),
            }
        }
        info!(processed = report.processed, added = report.added, "Backfill finished");
        report
    }

    /// Partition count and per-partition item counts.
    pub fn status(&self) -> Result<ArchiveStatus, MemoryError> {
        let partitions = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.name, p.conversation_id, COUNT(e.seq)
                 FROM archive_partitions p
                 LEFT JOIN archive_entries e ON e.partition = p.name
                 GROUP BY p.name, p.conversation_id
                 ORDER BY p.name",
            )?;
            let rows = stmt.query_map([], |row| {
                let count: i64 = row.get(2)?;
                Ok(PartitionStatus {
                    name: row.get(0)?,
                    conversation_id: row.get(1)?,
                    item_count: count as usize,
                })
            })?;
            let partitions: Result<Vec<_>, _> = rows.collect();
            Ok(partitions?)
        })?;

        Ok(ArchiveStatus {
            partition_count: partitions.len(),
            total_items: partitions.iter().map(|p| p.item_count).sum(),
            partitions,
        })
    }

    /// Whether a conversation has a partition.
    pub fn has_partition(&self, conversation_id: &str) -> Result<bool, MemoryError> {
        let partition = partition_name(conversation_id);
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM archive_partitions WHERE name = ?1",
                params![partition],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub(crate) fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    fn contains(&self, partition: &str, id: &str) -> Result<bool, MemoryError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM archive_entries WHERE partition = ?1 AND entry_id = ?2",
                params![partition, id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn item_count(&self, partition: &str) -> Result<usize, MemoryError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM archive_entries WHERE partition = ?1",
                params![partition],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

/// Apply author filter and threshold to nearest-neighbour candidates.
fn select_hits(
    candidates: Vec<ArchiveHit>,
    author_filter: Option<&str>,
    threshold: f32,
    k: usize,
) -> ArchiveQuery {
    let candidates: Vec<ArchiveHit> = candidates
        .into_iter()
        .filter(|hit| author_filter.map_or(true, |author| hit.entry.author_id == author))
        .collect();
    if candidates.is_empty() {
        return ArchiveQuery::NoCandidates;
    }

    let mut hits: Vec<ArchiveHit> = candidates
        .into_iter()
        .filter(|hit| hit.distance <= threshold)
        .collect();
    if hits.is_empty() {
        return ArchiveQuery::AllOverThreshold;
    }

    hits.truncate(k);
    ArchiveQuery::Hits(hits)
}

/// Load every entry of a partition in insertion order. Rows with a corrupt
/// embedding or timestamp are skipped.
fn load_entries(conn: &Connection, partition: &str) -> Result<Vec<ArchiveEntry>, MemoryError> {
    let mut stmt = conn.prepare_cached(
        "SELECT entry_id, text, embedding, author_id, author_name, timestamp
         FROM archive_entries WHERE partition = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![partition], |row| {
        let blob: Vec<u8> = row.get(2)?;
        let timestamp: String = row.get(5)?;
        Ok((
            blob,
            timestamp,
            ArchiveEntry {
                id: row.get(0)?,
                text: row.get(1)?,
                embedding: Vec::new(),
                author_id: row.get(3)?,
                author_name: row.get(4)?,
                timestamp: DateTime::<Utc>::MIN_UTC,
            },
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (blob, timestamp, mut entry) = row?;
        let Ok(timestamp) = DateTime::parse_from_rfc3339(&timestamp) else {
            warn!(partition, id = %entry.id, "Skipping archive entry with corrupt timestamp");
            continue;
        };
        let Some(embedding) = decode_embedding(&blob) else {
            warn!(partition, id = %entry.id, "Skipping archive entry with corrupt embedding");
            continue;
        };
        entry.timestamp = timestamp.with_timezone(&Utc);
        entry.embedding = embedding;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEmbedder, MapEmbedder};
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, minute, 0).unwrap()
    }

    fn store_with(embedder: MapEmbedder) -> ArchiveStore {
        ArchiveStore::new(
            Db::open_in_memory().unwrap(),
            Arc::new(embedder),
            &EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = store_with(MapEmbedder::new().with("hello there", vec![1.0, 0.0]));

        assert!(store.add("c1", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap());
        assert!(!store.add("c1", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap());

        let status = store.status().unwrap();
        assert_eq!(status.partition_count, 1);
        assert_eq!(status.partitions[0].item_count, 1);
    }

    #[tokio::test]
    async fn test_same_id_in_other_partition_is_distinct() {
        let store = store_with(MapEmbedder::new().with("hello there", vec![1.0, 0.0]));

        assert!(store.add("c1", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap());
        assert!(store.add("c2", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap());
        assert_eq!(store.status().unwrap().total_items, 2);
    }

    #[tokio::test]
    async fn test_short_text_rejected_without_embedding() {
        let embedder = Arc::new(MapEmbedder::new());
        let store = ArchiveStore::new(
            Db::open_in_memory().unwrap(),
            embedder.clone(),
            &EngineConfig::default(),
        );

        assert!(!store.add("c1", "m1", "hey", "u1", "alice", ts(0)).await.unwrap());
        assert!(!store.add("c1", "m2", "  abcd  ", "u1", "alice", ts(0)).await.unwrap());
        assert_eq!(embedder.calls(), 0);
        assert!(!store.has_partition("c1").unwrap());
    }

    #[tokio::test]
    async fn test_embedding_failure_rejects_insert() {
        let store = ArchiveStore::new(
            Db::open_in_memory().unwrap(),
            Arc::new(FailingEmbedder),
            &EngineConfig::default(),
        );
        assert!(!store.add("c1", "m1", "long enough", "u1", "alice", ts(0)).await.unwrap());
        assert_eq!(store.status().unwrap().partition_count, 0);
    }

    #[tokio::test]
    async fn test_query_empty_partition_sentinel() {
        let embedder = Arc::new(MapEmbedder::new().with("tea", vec![1.0, 0.0]));
        let store = ArchiveStore::new(
            Db::open_in_memory().unwrap(),
            embedder.clone(),
            &EngineConfig::default(),
        );

        let result = store.query("nowhere", "tea", 3, None).await.unwrap();
        assert!(matches!(result, ArchiveQuery::EmptyPartition));
        // No embedding call was wasted on an empty partition.
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_query_embedding_failure_sentinel() {
        let store = store_with(MapEmbedder::new().with("green tea time", vec![1.0, 0.0]));
        store.add("c1", "m1", "green tea time", "u1", "alice", ts(0)).await.unwrap();

        // "unknown" has no vector in the map, so the query embedding fails.
        let result = store.query("c1", "unknown", 3, None).await.unwrap();
        assert!(matches!(result, ArchiveQuery::EmbeddingFailed));
    }

    #[tokio::test]
    async fn test_query_threshold_and_order() {
        // Distances to the query [1, 0]: a=0.0, b=0.2, c=0.4, d=1.0, e=2.0
        let store = store_with(
            MapEmbedder::new()
                .with("query", vec![1.0, 0.0])
                .with("entry a", vec![1.0, 0.0])
                .with("entry b", vec![0.8, 0.6])
                .with("entry c", vec![0.6, 0.8])
                .with("entry d", vec![0.0, 1.0])
                .with("entry e", vec![-1.0, 0.0]),
        );
        for (i, text) in ["entry d", "entry b", "entry e", "entry a", "entry c"].iter().enumerate() {
            store
                .add("c1", &format!("m{}", i), text, "u1", "alice", ts(i as u32))
                .await
                .unwrap();
        }

        let result = store.query("c1", "query", 5, None).await.unwrap();
        let hits = result.hits();
        let texts: Vec<&str> = hits.iter().map(|h| h.entry.text.as_str()).collect();
        assert_eq!(texts, vec!["entry a", "entry b", "entry c"]);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        assert!(hits.iter().all(|h| h.distance <= DEFAULT_THRESHOLD));
    }

    const DEFAULT_THRESHOLD: f32 = crate::DEFAULT_RELEVANCE_THRESHOLD;

    #[tokio::test]
    async fn test_query_all_over_threshold_sentinel() {
        let store = store_with(
            MapEmbedder::new()
                .with("query", vec![1.0, 0.0])
                .with("far away text", vec![-1.0, 0.0]),
        );
        store.add("c1", "m1", "far away text", "u1", "alice", ts(0)).await.unwrap();

        let result = store.query("c1", "query", 3, None).await.unwrap();
        assert!(matches!(result, ArchiveQuery::AllOverThreshold));
    }

    #[tokio::test]
    async fn test_query_author_filter() {
        let store = store_with(
            MapEmbedder::new()
                .with("query", vec![1.0, 0.0])
                .with("alice says tea", vec![1.0, 0.1])
                .with("bob says tea", vec![1.0, 0.0]),
        );
        store.add("c1", "m1", "alice says tea", "u1", "alice", ts(0)).await.unwrap();
        store.add("c1", "m2", "bob says tea", "u2", "bob", ts(1)).await.unwrap();

        let result = store.query("c1", "query", 2, Some("u1")).await.unwrap();
        assert_eq!(result.hits().len(), 1);
        assert_eq!(result.hits()[0].entry.author_name, "alice");

        let result = store.query("c1", "query", 2, Some("u3")).await.unwrap();
        assert!(matches!(result, ArchiveQuery::NoCandidates));
    }

    #[tokio::test]
    async fn test_query_returns_only_closer_of_near_duplicates() {
        let store = store_with(
            MapEmbedder::new()
                .with("tea", vec![1.0, 0.0])
                .with("I like tea a lot", vec![0.9, 0.1])
                .with("I like tea a little", vec![0.8, 0.3]),
        );
        store.add("c1", "m1", "I like tea a lot", "u1", "alice", ts(0)).await.unwrap();
        store.add("c1", "m2", "I like tea a little", "u1", "alice", ts(1)).await.unwrap();

        let result = store.query("c1", "tea", 1, None).await.unwrap();
        assert_eq!(result.hits().len(), 1);
        assert_eq!(result.hits()[0].entry.id, "m1");
        assert_eq!(result.lines(), vec!["[2024-01-15 10:00] alice: I like tea a lot"]);
    }

    #[tokio::test]
    async fn test_query_with_huge_k_returns_hits() {
        let store = store_with(MapEmbedder::new().with("hello there", vec![1.0, 0.0]));
        store.add("c1", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap();

        let result = store.query("c1", "hello there", usize::MAX, None).await.unwrap();
        assert!(matches!(result, ArchiveQuery::Hits(_)));
        assert_eq!(result.hits().len(), 1);
    }

    #[tokio::test]
    async fn test_nan_embedding_does_not_disturb_ranking() {
        let store = store_with(
            MapEmbedder::new()
                .with("query", vec![1.0, 0.0])
                .with("broken vector", vec![f32::NAN, 0.0])
                .with("good vector", vec![0.9, 0.1])
                .with("other vector", vec![0.8, 0.3]),
        );
        store.add("c1", "m1", "broken vector", "u1", "alice", ts(0)).await.unwrap();
        store.add("c1", "m2", "other vector", "u1", "alice", ts(1)).await.unwrap();
        store.add("c1", "m3", "good vector", "u1", "alice", ts(2)).await.unwrap();

        let result = store.query("c1", "query", 3, None).await.unwrap();
        let ids: Vec<&str> = result.hits().iter().map(|h| h.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2"]);
    }

    #[tokio::test]
    async fn test_stored_text_keeps_surrounding_whitespace() {
        let store = store_with(MapEmbedder::new().with("hello there", vec![1.0, 0.0]));
        assert!(store.add("c1", "m1", "  hello there\n", "u1", "alice", ts(0)).await.unwrap());

        let result = store.query("c1", "hello there", 1, None).await.unwrap();
        assert_eq!(result.hits()[0].entry.text, "  hello there\n");
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_row_is_skipped() {
        let store = store_with(
            MapEmbedder::new()
                .with("hello there", vec![1.0, 0.0])
                .with("hello again", vec![1.0, 0.1]),
        );
        store.add("c1", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap();
        store.add("c1", "m2", "hello again", "u1", "alice", ts(1)).await.unwrap();
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE archive_entries SET timestamp = 'not a date' WHERE entry_id = 'm1'",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        for _ in 0..2 {
            let result = store.query("c1", "hello there", 5, None).await.unwrap();
            let ids: Vec<&str> = result.hits().iter().map(|h| h.entry.id.as_str()).collect();
            assert_eq!(ids, vec!["m2"]);
            assert_eq!(result.hits()[0].entry.timestamp, ts(1));
        }
    }

    #[tokio::test]
    async fn test_reset_all_counts_partitions() {
        let store = store_with(MapEmbedder::new().with("hello there", vec![1.0, 0.0]));
        store.add("c1", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap();
        store.add("c2", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap();
        store.add("c3", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap();

        assert_eq!(store.reset_all().unwrap(), 3);
        assert_eq!(store.status().unwrap().partition_count, 0);
        assert_eq!(store.reset_all().unwrap(), 0);

        // Ids can be reused after a reset.
        assert!(store.add("c1", "m1", "hello there", "u1", "alice", ts(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_backfill_reuses_idempotency() {
        let store = store_with(
            MapEmbedder::new()
                .with("first message", vec![1.0, 0.0])
                .with("second message", vec![0.0, 1.0]),
        );
        let message = |id: &str, text: &str| ArchiveMessage {
            conversation_id: "c1".into(),
            id: id.into(),
            text: text.into(),
            author_id: "u1".into(),
            author_name: "alice".into(),
            timestamp: ts(0),
        };

        let report = store
            .backfill(vec![
                message("m1", "first message"),
                message("m1", "first message"),
                message("m2", "second message"),
                message("m3", "ok"),
            ])
            .await;
        assert_eq!(report.processed, 4);
        assert_eq!(report.added, 2);

        let report = store.backfill(vec![message("m2", "second message")]).await;
        assert_eq!(report.added, 0);
    }
}
