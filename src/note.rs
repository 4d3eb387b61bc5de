//! NoteStore - curated long-term facts per user or server.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::Db;
use crate::embedding::{
    cosine_similarity, decode_embedding, encode_embedding, EmbedPurpose, EmbeddingProvider,
};
use crate::error::MemoryError;

/// Who a note is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    User,
    Server,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Server => "server",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Scope::User),
            "server" => Ok(Scope::Server),
            other => Err(MemoryError::InvalidInput(format!(
                "unknown note scope '{}' (expected 'user' or 'server')",
                other
            ))),
        }
    }
}

/// A stored note.
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub scope: Scope,
    pub subject_id: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// Result of [`NoteStore::add_note`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddNoteOutcome {
    Added,
    /// Identical text already stored for this subject/scope.
    Duplicate,
    /// The embedding provider failed; nothing was stored.
    EmbeddingUnavailable,
}

/// A note ranked against a query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredNote {
    pub note: Note,
    pub similarity: f32,
}

/// Curated per-subject notes.
///
/// Notes are append/remove-only; text is never edited in place.
#[derive(Clone)]
pub struct NoteStore {
    db: Db,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl NoteStore {
    pub fn new(db: Db, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { db, embedder }
    }

    /// Add a note unless the exact text already exists for (scope, subject).
    pub async fn add_note(
        &self,
        scope: Scope,
        subject_id: &str,
        text: &str,
    ) -> Result<AddNoteOutcome, MemoryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MemoryError::InvalidInput("Note text cannot be empty".to_string()));
        }

        // Cheap check first so duplicates never cost an embedding call.
        if self.exists(scope, subject_id, text)? {
            return Ok(AddNoteOutcome::Duplicate);
        }

        let embedding = match self.embedder.embed(text, EmbedPurpose::Document).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(scope = %scope, subject_id, error = %e, "Note embedding failed");
                return Ok(AddNoteOutcome::EmbeddingUnavailable);
            }
        };

        // INSERT OR IGNORE keeps concurrent writers from duplicating the note.
        let inserted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO notes (scope, subject_id, text, embedding)
                 VALUES (?1, ?2, ?3, ?4)",
                params![scope.as_str(), subject_id, text, encode_embedding(&embedding)],
            )?)
        })?;

        if inserted == 0 {
            return Ok(AddNoteOutcome::Duplicate);
        }
        debug!(scope = %scope, subject_id, "Note added");
        Ok(AddNoteOutcome::Added)
    }

    /// Remove the note at `index` (0-based, insertion order).
    pub fn remove_note(
        &self,
        scope: Scope,
        subject_id: &str,
        index: usize,
    ) -> Result<Note, MemoryError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM notes WHERE scope = ?1 AND subject_id = ?2 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![scope.as_str(), subject_id], |row| row.get(0))?;
                let ids = rows.collect::<Result<Vec<_>, _>>()?;
                ids
            };

            let id = *ids.get(index).ok_or(MemoryError::IndexOutOfRange {
                index,
                len: ids.len(),
            })?;

            let (text, blob): (String, Vec<u8>) = tx.query_row(
                "SELECT text, embedding FROM notes WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.execute("DELETE FROM notes WHERE id = ?1", params![id])?;
            tx.commit()?;

            Ok(Note {
                scope,
                subject_id: subject_id.to_string(),
                text,
                embedding: decode_embedding(&blob).unwrap_or_default(),
            })
        })
    }

    /// List notes for a subject in insertion order.
    pub fn list_notes(&self, scope: Scope, subject_id: &str) -> Result<Vec<Note>, MemoryError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT text, embedding FROM notes
                 WHERE scope = ?1 AND subject_id = ?2
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![scope.as_str(), subject_id], |row| {
                let text: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((text, blob))
            })?;

            let mut notes = Vec::new();
            for row in rows {
                let (text, blob) = row?;
                notes.push(Note {
                    scope,
                    subject_id: subject_id.to_string(),
                    text,
                    embedding: decode_or_warn(&blob),
                });
            }
            Ok(notes)
        })
    }

    /// Top-k notes for a subject by cosine similarity.
    ///
    /// No threshold: callers always get some context, even a weak one.
    /// Ties keep insertion order.
    pub fn find_relevant(
        &self,
        scope: Scope,
        subject_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<String>, MemoryError> {
        let notes = self.list_notes(scope, subject_id)?;
        Ok(rank_notes(notes, query_embedding, k)
            .into_iter()
            .map(|scored| scored.note.text)
            .collect())
    }

    /// [`Self::find_relevant`] for raw query text.
    ///
    /// Unlike the reply path, an embedding failure is returned to the caller.
    pub async fn recall(
        &self,
        scope: Scope,
        subject_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, MemoryError> {
        let embedding = self.embedder.embed(query, EmbedPurpose::Query).await?;
        self.find_relevant(scope, subject_id, &embedding, k)
    }

    /// Every note across all scopes and subjects, in insertion order.
    pub fn all_notes(&self) -> Result<Vec<Note>, MemoryError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT scope, subject_id, text, embedding FROM notes ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                let scope: String = row.get(0)?;
                let subject_id: String = row.get(1)?;
                let text: String = row.get(2)?;
                let blob: Vec<u8> = row.get(3)?;
                Ok((scope, subject_id, text, blob))
            })?;

            let mut notes = Vec::new();
            for row in rows {
                let (scope, subject_id, text, blob) = row?;
                let Ok(scope) = scope.parse::<Scope>() else {
                    warn!(scope = %scope, "Skipping note with unknown scope");
                    continue;
                };
                notes.push(Note {
                    scope,
                    subject_id,
                    text,
                    embedding: decode_or_warn(&blob),
                });
            }
            Ok(notes)
        })
    }

    /// Best single note in the whole corpus for a query embedding.
    pub fn best_match(&self, query_embedding: &[f32]) -> Result<Option<ScoredNote>, MemoryError> {
        let notes = self.all_notes()?;
        Ok(rank_notes(notes, query_embedding, 1).into_iter().next())
    }

    /// Fix the name the agent uses for a subject.
    pub fn set_nickname(&self, subject_id: &str, nickname: &str) -> Result<(), MemoryError> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(MemoryError::InvalidInput("Nickname cannot be empty".to_string()));
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (subject_id, nickname) VALUES (?1, ?2)
                 ON CONFLICT(subject_id) DO UPDATE SET nickname = excluded.nickname",
                params![subject_id, nickname],
            )?;
            Ok(())
        })
    }

    pub fn nickname(&self, subject_id: &str) -> Result<Option<String>, MemoryError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT nickname FROM profiles WHERE subject_id = ?1",
                    params![subject_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub(crate) fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    fn exists(&self, scope: Scope, subject_id: &str, text: &str) -> Result<bool, MemoryError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM notes WHERE scope = ?1 AND subject_id = ?2 AND text = ?3",
                params![scope.as_str(), subject_id, text],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }
}

/// Rank notes by similarity, highest first. Stable, so ties keep input order.
fn rank_notes(notes: Vec<Note>, query_embedding: &[f32], k: usize) -> Vec<ScoredNote> {
    let mut scored: Vec<ScoredNote> = notes
        .into_iter()
        .map(|note| {
            let similarity = cosine_similarity(query_embedding, &note.embedding);
            ScoredNote { note, similarity }
        })
        .collect();
    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(k);
    scored
}

fn decode_or_warn(blob: &[u8]) -> Vec<f32> {
    decode_embedding(blob).unwrap_or_else(|| {
        warn!(bytes = blob.len(), "Corrupt note embedding, treating as empty");
        Vec::new()
    })
}
