// SPDX-License-Identifier: MIT OR Apache-2.0
//! Snapshot and metering persistence for ASAP servers.
//!
//! Two store traits, each with an in-memory backend (tests, single-process
//! dev) and a shared SQLite backend (`sqlite` module) selected at runtime via
//! `ASAP_STORAGE_BACKEND`. Grounded in the distilled system's economics
//! storage layer: query/aggregate/purge semantics match
//! `asap.economics.storage` and `asap.economics.delegation_storage`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory and SQLite snapshot stores.
pub mod snapshot;
/// In-memory and SQLite metering stores.
pub mod metering;
/// Shared SQLite connection plumbing used by both store kinds.
pub mod sqlite;

pub use metering::{InMemoryMeteringStore, MeteringStore, SqliteMeteringStore};
pub use snapshot::{InMemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
pub use sqlite::SharedConnection;

use std::time::Duration;

/// Default retention window applied to `purge_expired` when a caller does
/// not override it: 30 days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Which storage backend to construct, selected by `ASAP_STORAGE_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Volatile, per-process in-memory store.
    Memory,
    /// Durable SQLite-backed store at a configured path.
    Sqlite,
}

impl StorageBackend {
    /// Parse the `ASAP_STORAGE_BACKEND` environment value (`"memory"` or
    /// `"sqlite"`, case-insensitive). Unset or unrecognized values default
    /// to [`StorageBackend::Memory`].
    pub fn from_env_str(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("sqlite") => Self::Sqlite,
            _ => Self::Memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_sqlite() {
        assert_eq!(StorageBackend::from_env_str(Some("sqlite")), StorageBackend::Sqlite);
        assert_eq!(StorageBackend::from_env_str(Some("SQLite")), StorageBackend::Sqlite);
    }

    #[test]
    fn backend_defaults_to_memory() {
        assert_eq!(StorageBackend::from_env_str(None), StorageBackend::Memory);
        assert_eq!(StorageBackend::from_env_str(Some("bogus")), StorageBackend::Memory);
    }
}
