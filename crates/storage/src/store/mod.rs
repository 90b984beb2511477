#![forbid(unsafe_code)]

mod error;
mod history;
mod registry;
mod schema;
mod selection;

pub use error::StoreError;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILENAME: &str = "peerlink.db";
pub const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle on the shared registry database.
///
/// Every peer process opens its own handle on the same file. SQLite in WAL mode is the only
/// cross-process serialization: one writer at a time, readers never blocked.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        preflight_gate(&conn)?;
        schema::install(&conn)?;

        Ok(Self { conn, db_path })
    }

    pub fn open_in_dir(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(storage_dir.as_ref().join(DB_FILENAME))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Takes the database write lock up front so a read-then-write sequence cannot fail
    /// halfway with SQLITE_BUSY when another process is writing.
    fn write_tx(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let has_meta = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_meta {
        return Ok(());
    }

    let version = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match version.as_deref().map(str::parse::<i64>) {
        None => Ok(()),
        Some(Ok(v)) if v == SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
    }
}

fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}

fn record_schema_version(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}
