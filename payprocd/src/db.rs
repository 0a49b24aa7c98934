//! Shared SQLite plumbing for the preorder and account databases.
//!
//! Each database keeps a single connection behind its own mutex; we use
//! our own lock rather than SQLite's internal serialization because the
//! reset/bind/step sequence of a reused statement is not reentrant.
//! Statements are obtained with `prepare_cached` inside the lock guard, so
//! a statement handle never outlives exclusive access to the connection.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("invalid length")]
    InvalidLength,
    #[error("too many collision retries")]
    TooManyRetries,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("encryption failed: {0}")]
    Encrypt(String),
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    /// Take the connection lock.  All statement use happens through this
    /// guard.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("db lock")
    }
}

/// Current UTC time in the `"1970-01-01 12:00:00"` format used by the
/// database columns.
pub fn datetime_now() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
