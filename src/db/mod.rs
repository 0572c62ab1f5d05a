pub mod models;
pub mod queries;

use crate::compression::{CompressionError, CompressionScheme};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// The backing store: `files` → `waveforms` plus the `jobs` recovery table.
pub struct Database {
    pub conn: Connection,
    compression: CompressionScheme,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn,
            compression: CompressionScheme::PREFERRED,
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            compression: CompressionScheme::PREFERRED,
        };
        db.init()?;
        Ok(db)
    }

    /// Use `scheme` for every subsequent write. Rows stored with another
    /// scheme are re-encoded the next time they are read.
    pub fn with_compression(mut self, scheme: CompressionScheme) -> Self {
        self.compression = scheme;
        self
    }

    pub fn compression(&self) -> CompressionScheme {
        self.compression
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "store was written by a newer version (schema {version}, supported {SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: files + waveforms
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS files (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                location    TEXT NOT NULL,
                subsong     INTEGER NOT NULL,
                UNIQUE(location, subsong)
            );

            CREATE TABLE IF NOT EXISTS waveforms (
                file_id     INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
                channels    INTEGER NOT NULL,
                compression INTEGER NOT NULL,
                min         BLOB NOT NULL,
                max         BLOB NOT NULL,
                rms         BLOB NOT NULL,
                stored_at   TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    /// V2: pending analysis jobs, replayed at startup
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                location        TEXT NOT NULL,
                subsong         INTEGER NOT NULL,
                user_submitted  INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 2;
