// SPDX-License-Identifier: MIT OR Apache-2.0
//! Snapshot store: versioned task-state checkpoints.

use std::collections::BTreeMap;
use std::sync::Mutex;

use asap_core::StateSnapshot;
use asap_error::{AsapError, ErrorCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::sqlite::{io_err, SharedConnection};

/// Persists [`StateSnapshot`]s keyed by `(task_id, version)`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert a snapshot, keyed by `(task_id, version)`. Overwrites an
    /// existing snapshot at the same key.
    async fn save(&self, snapshot: StateSnapshot) -> Result<(), AsapError>;

    /// Fetch a snapshot. `version = None` returns the highest version
    /// recorded for `task_id`.
    async fn get(&self, task_id: &str, version: Option<u64>) -> Result<Option<StateSnapshot>, AsapError>;

    /// List every version recorded for `task_id`, ascending.
    async fn list_versions(&self, task_id: &str) -> Result<Vec<u64>, AsapError>;

    /// Delete one version, or every version when `version` is `None`.
    /// Returns the number of snapshots removed.
    async fn delete(&self, task_id: &str, version: Option<u64>) -> Result<usize, AsapError>;
}

/// In-memory [`SnapshotStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    tasks: Mutex<BTreeMap<String, BTreeMap<u64, StateSnapshot>>>,
}

impl InMemorySnapshotStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: StateSnapshot) -> Result<(), AsapError> {
        snapshot.validate().map_err(Into::into)?;
        let mut tasks = self.tasks.lock().unwrap();
        tasks
            .entry(snapshot.task_id.clone())
            .or_default()
            .insert(snapshot.version, snapshot);
        Ok(())
    }

    async fn get(&self, task_id: &str, version: Option<u64>) -> Result<Option<StateSnapshot>, AsapError> {
        let tasks = self.tasks.lock().unwrap();
        let Some(versions) = tasks.get(task_id) else {
            return Ok(None);
        };
        let found = match version {
            Some(v) => versions.get(&v).cloned(),
            None => versions.values().next_back().cloned(),
        };
        Ok(found)
    }

    async fn list_versions(&self, task_id: &str) -> Result<Vec<u64>, AsapError> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .get(task_id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, task_id: &str, version: Option<u64>) -> Result<usize, AsapError> {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(versions) = tasks.get_mut(task_id) else {
            return Ok(0);
        };
        let removed = match version {
            Some(v) => usize::from(versions.remove(&v).is_some()),
            None => {
                let n = versions.len();
                versions.clear();
                n
            }
        };
        if versions.is_empty() {
            tasks.remove(task_id);
        }
        Ok(removed)
    }
}

/// SQLite-backed [`SnapshotStore`]; durable across restarts, sharing its
/// connection with the metering and delegation stores.
pub struct SqliteSnapshotStore {
    conn: SharedConnection,
}

impl SqliteSnapshotStore {
    /// Wrap a [`SharedConnection`] as a snapshot store.
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: StateSnapshot) -> Result<(), AsapError> {
        snapshot.validate().map_err(Into::into)?;
        let data_json = serde_json::to_string(&snapshot.data)
            .map_err(|e| AsapError::new(ErrorCode::IoError, e.to_string()))?;
        self.conn
            .with(move |c| {
                c.execute(
                    "INSERT INTO snapshots (task_id, version, data_json, checkpoint, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(task_id, version) DO UPDATE SET
                        data_json = excluded.data_json,
                        checkpoint = excluded.checkpoint,
                        created_at = excluded.created_at",
                    rusqlite::params![
                        snapshot.task_id,
                        snapshot.version as i64,
                        data_json,
                        snapshot.checkpoint,
                        snapshot.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, task_id: &str, version: Option<u64>) -> Result<Option<StateSnapshot>, AsapError> {
        let task_id = task_id.to_string();
        self.conn
            .with(move |c| {
                let row = match version {
                    Some(v) => c.query_row(
                        "SELECT task_id, version, data_json, checkpoint, created_at
                         FROM snapshots WHERE task_id = ?1 AND version = ?2",
                        rusqlite::params![task_id, v as i64],
                        row_to_snapshot,
                    ),
                    None => c.query_row(
                        "SELECT task_id, version, data_json, checkpoint, created_at
                         FROM snapshots WHERE task_id = ?1 ORDER BY version DESC LIMIT 1",
                        rusqlite::params![task_id],
                        row_to_snapshot,
                    ),
                };
                match row {
                    Ok(snap) => Ok(Some(snap)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    async fn list_versions(&self, task_id: &str) -> Result<Vec<u64>, AsapError> {
        let task_id = task_id.to_string();
        self.conn
            .with(move |c| {
                let mut stmt = c.prepare(
                    "SELECT version FROM snapshots WHERE task_id = ?1 ORDER BY version ASC",
                )?;
                let rows = stmt.query_map(rusqlite::params![task_id], |row| {
                    let v: i64 = row.get(0)?;
                    Ok(v as u64)
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
    }

    async fn delete(&self, task_id: &str, version: Option<u64>) -> Result<usize, AsapError> {
        let task_id = task_id.to_string();
        self.conn
            .with(move |c| {
                let n = match version {
                    Some(v) => c.execute(
                        "DELETE FROM snapshots WHERE task_id = ?1 AND version = ?2",
                        rusqlite::params![task_id, v as i64],
                    )?,
                    None => c.execute("DELETE FROM snapshots WHERE task_id = ?1", rusqlite::params![task_id])?,
                };
                Ok(n)
            })
            .await
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateSnapshot> {
    let task_id: String = row.get(0)?;
    let version: i64 = row.get(1)?;
    let data_json: String = row.get(2)?;
    let checkpoint: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    let data = serde_json::from_str(&data_json).unwrap_or(serde_json::Value::Null);
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(StateSnapshot {
        id: format!("{task_id}@{version}"),
        task_id,
        version: version as u64,
        data,
        checkpoint,
        created_at,
    })
}

impl From<rusqlite::Error> for AsapError {
    fn from(err: rusqlite::Error) -> Self {
        io_err(err)
    }
}
