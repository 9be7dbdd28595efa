//! # SQLite Schema for RevStore
//!
//! The durable backend keeps every entity (change records, ledger hints,
//! model/object/field entities and out-of-line values) as one row of a single
//! key/value table. The engine never needs more than single-row atomicity,
//! which keeps the schema trivially portable to any entity store.
//!
//! ## Table Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      Schema Overview                      │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │  entities                     revstore_metadata           │
//! │  ┌──────────────────┐         ┌─────────────────┐         │
//! │  │ key (PK)   TEXT  │         │ key (PK)   TEXT │         │
//! │  │ body       BLOB  │         │ value      TEXT │         │
//! │  │ updated_ms INT   │         └─────────────────┘         │
//! │  └──────────────────┘                                     │
//! │                                                           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Each worker opens its own [`Database`] on the same file. WAL mode lets
//! readers proceed while one writer holds the lock, and a busy timeout makes
//! competing writers queue instead of failing with `SQLITE_BUSY`.
//! Read-modify-write updates run inside `BEGIN IMMEDIATE`, which takes the
//! write lock up front so two workers can never interleave the read and the
//! write of the same key.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::backend::{Backend, UpdateFn};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. No migrations: a mismatch is an error.
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per entity.
///
/// # Columns
///
/// - `key`: entity key, see [`storage`](crate::storage) and
///   [`ledger`](crate::ledger) for the key layout
/// - `body`: JSON-encoded record or compressed value payload
/// - `updated_ms`: wall-clock time of the last write, for operators only
const CREATE_ENTITIES: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    key        TEXT PRIMARY KEY,
    body       BLOB NOT NULL,
    updated_ms INTEGER NOT NULL
) WITHOUT ROWID
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS revstore_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the RevStore schema in place.
///
/// # Ownership
///
/// `Database` owns its `Connection`; dropping it closes the connection.
/// Convert it into a [`SqliteBackend`] to hand it to an engine.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Corrupted` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use revstore::schema::Database;
    ///
    /// let backend = Database::open("revstore.db")?.into_backend();
    /// # Ok::<(), revstore::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates a private in-memory database. Not shareable between workers.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // Must come first: other workers may be initializing the same file.
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL: readers don't block the single writer.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_ENTITIES)?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        // OR IGNORE: two workers may create the same file at once.
        self.conn.execute(
            "INSERT OR IGNORE INTO revstore_metadata (key, value) VALUES ('schema_version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )?;

        let stored: String = self.conn.query_row(
            "SELECT value FROM revstore_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;

        match stored.parse::<i32>() {
            Ok(v) if v == SCHEMA_VERSION => Ok(()),
            _ => Err(Error::Corrupted(format!(
                "schema version mismatch: database has version {stored}, this build requires {SCHEMA_VERSION}"
            ))),
        }
    }

    /// Wraps this connection as a [`Backend`].
    pub fn into_backend(self) -> SqliteBackend {
        SqliteBackend {
            conn: Mutex::new(self.conn),
            clock: Box::new(SystemClock),
        }
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Backend Implementation
// =============================================================================

/// [`Backend`] over one SQLite connection.
///
/// # Rust Pattern: Mutex for Sync
///
/// `rusqlite::Connection` is `Send` but not `Sync`. The mutex makes the
/// backend shareable behind an `Arc`; in practice each worker owns its own
/// backend and the lock is uncontended.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    clock: Box<dyn Clock>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens `path` as a backend. Shorthand for `Database::open(path)?.into_backend()`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Database::open(path)?.into_backend())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Corrupted("sqlite connection mutex poisoned".into()))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms() as i64
    }
}

impl Backend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let body = conn
            .query_row("SELECT body FROM entities WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(body)
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entities (key, body, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_ms = excluded.updated_ms",
            params![key, body, self.now_ms()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM entities WHERE key = ?1", [key])?;
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, body: &[u8]) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO entities (key, body, updated_ms) VALUES (?1, ?2, ?3)",
            params![key, body, self.now_ms()],
        )?;
        Ok(inserted == 1)
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> Result<bool> {
        let mut conn = self.lock()?;
        let now = self.now_ms();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<Vec<u8>> = tx
            .query_row("SELECT body FROM entities WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        // Dropping `tx` on an early return rolls back.
        let Some(next) = f(current.as_deref())? else {
            return Ok(false);
        };

        tx.execute(
            "INSERT INTO entities (key, body, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_ms = excluded.updated_ms",
            params![key, next, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, body FROM entities WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(String, Vec<u8>)>, _>>()?;
        Ok(rows)
    }
}

// =============================================================================
// Tests
// =============================================================================
