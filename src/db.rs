//! Database initialization and the shared connection handle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, Result};

use crate::error::MemoryError;

/// Get the default database path (~/.contextual_memory.db).
///
/// Falls back to the working directory when no home directory is known.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".contextual_memory.db")
}

/// Deterministic partition name for a conversation id.
///
/// ASCII alphanumerics and `-` are kept; every other byte becomes `_xx` (hex),
/// so distinct conversation ids never share a partition.
pub fn partition_name(conversation_id: &str) -> String {
    let mut name = String::with_capacity(conversation_id.len() + 5);
    name.push_str("conv_");
    for byte in conversation_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }
    name
}

/// Shared SQLite handle.
///
/// The lock is only ever held for synchronous statement work; no caller keeps
/// it across an `.await`.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        // A panic in another holder leaves the connection itself usable.
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Initialize the database schema.
pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Curated notes. Exact-text uniqueness per subject/scope is enforced here
    // so concurrent consolidations cannot create duplicates.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY,
            scope TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            UNIQUE (scope, subject_id, text)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notes_subject ON notes(scope, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles (
            subject_id TEXT PRIMARY KEY,
            nickname TEXT NOT NULL
        )",
        [],
    )?;

    // One row per archive partition; entries reference it by name.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS archive_partitions (
            name TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS archive_entries (
            seq INTEGER PRIMARY KEY,
            partition TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            author_id TEXT NOT NULL,
            author_name TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            UNIQUE (partition, entry_id),
            FOREIGN KEY (partition) REFERENCES archive_partitions(name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_archive_partition ON archive_entries(partition)",
        [],
    )?;

    // Directed edges; both directions are written for every interaction.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS relationships (
            subject_a TEXT NOT NULL,
            subject_b TEXT NOT NULL,
            interaction_count INTEGER NOT NULL,
            PRIMARY KEY (subject_a, subject_b),
            CHECK (subject_a <> subject_b)
        )",
        [],
    )?;
    // `seq` records first-seen order, used to break dominant-topic ties.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS relationship_topics (
            seq INTEGER PRIMARY KEY,
            subject_a TEXT NOT NULL,
            subject_b TEXT NOT NULL,
            topic TEXT NOT NULL,
            count INTEGER NOT NULL,
            UNIQUE (subject_a, subject_b, topic)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mood_samples (
            seq INTEGER PRIMARY KEY,
            partition_id TEXT NOT NULL,
            score REAL NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mood_partition ON mood_samples(partition_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS mood_windows (
            partition_id TEXT PRIMARY KEY,
            average REAL NOT NULL
        )",
        [],
    )?;

    Ok(())
}
