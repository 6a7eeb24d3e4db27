//! rollcall-store: SQLite persistence for identities, signatures and the
//! attendance ledger.
//!
//! One connection guarded by a mutex. Signatures are little-endian f32 blobs
//! keyed by identity; ledger rows are unique per (identity, date).

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rollcall_core::RepositoryError;
use rusqlite::Connection;
use thiserror::Error;

mod codec;
mod ledger;
mod migrations;
mod registry;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i32, supported: i32 },
    #[error("no migration for schema version {0}")]
    UnknownMigration(i32),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidValue(msg) => RepositoryError::Corrupt(msg),
            StoreError::Sqlite(e) if codec::is_integrity_violation(&e) => {
                RepositoryError::InvalidInput(e.to_string())
            }
            other => RepositoryError::Unavailable(other.to_string()),
        }
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!(error = %err, "failed to enable WAL mode");
        }
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self::init(conn, Some(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}
