// SPDX-License-Identifier: MIT OR Apache-2.0
//! A single pooled SQLite connection shared by the snapshot and metering
//! stores, matching the "one writer per process" durability requirement.
//!
//! `rusqlite::Connection` is blocking; every query runs inside
//! `tokio::task::spawn_blocking` while holding a `std::sync::Mutex`, so
//! writes are serialized without stalling the async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};

use asap_error::{AsapError, ErrorCode};
use rusqlite::Connection;

/// Schema for the tables this crate owns, created idempotently once per
/// connection.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    task_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    data_json TEXT NOT NULL,
    checkpoint TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, version)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_task_id ON snapshots (task_id);

CREATE TABLE IF NOT EXISTS issued_delegations (
    id TEXT PRIMARY KEY,
    delegator_urn TEXT NOT NULL,
    delegate_urn TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_issued_delegator ON issued_delegations (delegator_urn);

CREATE TABLE IF NOT EXISTS revocations (
    id TEXT PRIMARY KEY,
    revoked_at TEXT NOT NULL,
    reason TEXT
);

CREATE TABLE IF NOT EXISTS usage_events (
    id TEXT PRIMARY KEY,
    task_id TEXT,
    agent_id TEXT NOT NULL,
    consumer_id TEXT NOT NULL,
    metrics_json TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_agent_timestamp ON usage_events (agent_id, timestamp);
"#;

/// A connection handle cheaply cloned across the snapshot/metering/
/// delegation stores that share one database file.
#[derive(Clone)]
pub struct SharedConnection(Arc<Mutex<Connection>>);

impl SharedConnection {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AsapError> {
        let conn = Connection::open(path).map_err(io_err)?;
        conn.execute_batch(SCHEMA).map_err(io_err)?;
        Ok(Self(Arc::new(Mutex::new(conn))))
    }

    /// Open an in-memory SQLite database (useful for exercising the SQLite
    /// code path in tests without touching the filesystem).
    pub fn open_in_memory() -> Result<Self, AsapError> {
        let conn = Connection::open_in_memory().map_err(io_err)?;
        conn.execute_batch(SCHEMA).map_err(io_err)?;
        Ok(Self(Arc::new(Mutex::new(conn))))
    }

    /// Run `f` with exclusive access to the connection on a blocking-pool
    /// thread, serializing all callers behind the inner mutex.
    pub async fn with<F, T>(&self, f: F) -> Result<T, AsapError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| AsapError::new(ErrorCode::IoError, format!("blocking task panicked: {e}")))?
        .map_err(io_err)
    }
}

pub(crate) fn io_err(err: rusqlite::Error) -> AsapError {
    AsapError::new(ErrorCode::IoError, err.to_string())
}
