//! MoodTracker - rolling sentiment window per conversation.

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::Db;
use crate::error::MemoryError;
use crate::MOOD_BAND;

/// Coarse mood of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Positive,
    Negative,
    Neutral,
}

impl Mood {
    /// `> +0.2` positive, `< -0.2` negative, neutral otherwise.
    pub fn classify(average: f64) -> Self {
        if average > MOOD_BAND {
            Mood::Positive
        } else if average < -MOOD_BAND {
            Mood::Negative
        } else {
            Mood::Neutral
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mood::Positive => "positive",
            Mood::Negative => "negative",
            Mood::Neutral => "neutral",
        })
    }
}

/// Current window for one conversation. Samples are oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct MoodWindow {
    pub partition_id: String,
    pub samples: Vec<f64>,
    pub average: f64,
    pub mood: Mood,
}

/// Bounded FIFO of sentiment scores per conversation.
///
/// No time decay: only the last `window_size` samples count.
#[derive(Clone)]
pub struct MoodTracker {
    db: Db,
    window_size: usize,
}

impl MoodTracker {
    pub fn new(db: Db, window_size: usize) -> Self {
        Self {
            db,
            window_size: window_size.max(1),
        }
    }

    /// Push a score in [-1, 1], evicting the oldest beyond the window size.
    pub fn record_sample(&self, partition_id: &str, score: f64) -> Result<MoodWindow, MemoryError> {
        if !score.is_finite() || !(-1.0..=1.0).contains(&score) {
            return Err(MemoryError::InvalidInput(format!(
                "sentiment score must be within [-1, 1] (got {})",
                score
            )));
        }

        let window_size = self.window_size as i64;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO mood_samples (partition_id, score) VALUES (?1, ?2)",
                params![partition_id, score],
            )?;
            tx.execute(
                "DELETE FROM mood_samples
                 WHERE partition_id = ?1 AND seq NOT IN (
                     SELECT seq FROM mood_samples WHERE partition_id = ?1
                     ORDER BY seq DESC LIMIT ?2
                 )",
                params![partition_id, window_size],
            )?;

            let samples = load_samples(&tx, partition_id)?;
            let average = samples.iter().sum::<f64>() / samples.len() as f64;
            tx.execute(
                "INSERT INTO mood_windows (partition_id, average) VALUES (?1, ?2)
                 ON CONFLICT(partition_id) DO UPDATE SET average = excluded.average",
                params![partition_id, average],
            )?;
            tx.commit()?;

            Ok(MoodWindow {
                partition_id: partition_id.to_string(),
                samples,
                average,
                mood: Mood::classify(average),
            })
        })
    }

    pub fn window(&self, partition_id: &str) -> Result<Option<MoodWindow>, MemoryError> {
        self.db.with_conn(|conn| {
            let average: Option<f64> = conn
                .query_row(
                    "SELECT average FROM mood_windows WHERE partition_id = ?1",
                    params![partition_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(average) = average else {
                return Ok(None);
            };
            Ok(Some(MoodWindow {
                partition_id: partition_id.to_string(),
                samples: load_samples(conn, partition_id)?,
                average,
                mood: Mood::classify(average),
            }))
        })
    }
}

fn load_samples(conn: &Connection, partition_id: &str) -> Result<Vec<f64>, MemoryError> {
    let mut stmt = conn.prepare_cached(
        "SELECT score FROM mood_samples WHERE partition_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![partition_id], |row| row.get(0))?;
    let samples = rows.collect::<Result<Vec<f64>, _>>()?;
    Ok(samples)
}
