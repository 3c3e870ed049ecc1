// SPDX-License-Identifier: MIT OR Apache-2.0
//! Metering store: record/query/aggregate/purge usage events.

use std::sync::Mutex;
use std::time::Duration;

use asap_core::{aggregate, AggregateBy, MeteringQuery, UsageAggregate, UsageEvent};
use asap_error::AsapError;
use async_trait::async_trait;
use chrono::Utc;

use crate::sqlite::SharedConnection;

/// Records and queries [`UsageEvent`]s.
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Append a usage event.
    async fn record(&self, event: UsageEvent) -> Result<(), AsapError>;

    /// Return events matching `query`, ordered by timestamp ascending,
    /// with `offset`/`limit` applied after filtering.
    async fn query(&self, query: &MeteringQuery) -> Result<Vec<UsageEvent>, AsapError>;

    /// Aggregate every event matching `query` (ignoring its
    /// `limit`/`offset`) along `by`.
    async fn aggregate(&self, by: AggregateBy, query: &MeteringQuery) -> Result<Vec<UsageAggregate>, AsapError>;

    /// Remove events older than `ttl` relative to now, returning the count
    /// removed.
    async fn purge_expired(&self, ttl: Duration) -> Result<usize, AsapError>;
}

fn without_pagination(query: &MeteringQuery) -> MeteringQuery {
    MeteringQuery {
        agent_id: query.agent_id.clone(),
        consumer_id: query.consumer_id.clone(),
        task_id: query.task_id.clone(),
        start: query.start,
        end: query.end,
        limit: None,
        offset: 0,
    }
}

/// In-memory [`MeteringStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMeteringStore {
    events: Mutex<Vec<UsageEvent>>,
}

impl InMemoryMeteringStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeteringStore for InMemoryMeteringStore {
    async fn record(&self, event: UsageEvent) -> Result<(), AsapError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn query(&self, query: &MeteringQuery) -> Result<Vec<UsageEvent>, AsapError> {
        let events = self.events.lock().unwrap();
        let mut matched: Vec<UsageEvent> = events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.timestamp);
        let skipped = matched.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => skipped.take(limit).collect(),
            None => skipped.collect(),
        })
    }

    async fn aggregate(&self, by: AggregateBy, query: &MeteringQuery) -> Result<Vec<UsageAggregate>, AsapError> {
        let filtered = self.query(&without_pagination(query)).await?;
        Ok(aggregate(&filtered, by))
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<usize, AsapError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok(before - events.len())
    }
}

/// SQLite-backed [`MeteringStore`]; durable across restarts, sharing its
/// connection with the snapshot and delegation stores.
pub struct SqliteMeteringStore {
    conn: SharedConnection,
}

impl SqliteMeteringStore {
    /// Wrap a [`SharedConnection`] as a metering store.
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    async fn load_matching(&self, query: MeteringQuery) -> Result<Vec<UsageEvent>, AsapError> {
        self.conn
            .with(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, task_id, agent_id, consumer_id, metrics_json, timestamp
                     FROM usage_events ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map([], row_to_event)?;
                let events: rusqlite::Result<Vec<UsageEvent>> = rows.collect();
                events
            })
            .await
            .map(|events| events.into_iter().filter(|e| query.matches(e)).collect())
    }
}

#[async_trait]
impl MeteringStore for SqliteMeteringStore {
    async fn record(&self, event: UsageEvent) -> Result<(), AsapError> {
        let metrics_json = serde_json::to_string(&event.metrics)
            .map_err(|e| AsapError::new(asap_error::ErrorCode::IoError, e.to_string()))?;
        self.conn
            .with(move |c| {
                c.execute(
                    "INSERT INTO usage_events (id, task_id, agent_id, consumer_id, metrics_json, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        event.id,
                        event.task_id,
                        event.agent_id,
                        event.consumer_id,
                        metrics_json,
                        event.timestamp.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn query(&self, query: &MeteringQuery) -> Result<Vec<UsageEvent>, AsapError> {
        let matched = self.load_matching(query.clone()).await?;
        let skipped = matched.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => skipped.take(limit).collect(),
            None => skipped.collect(),
        })
    }

    async fn aggregate(&self, by: AggregateBy, query: &MeteringQuery) -> Result<Vec<UsageAggregate>, AsapError> {
        let matched = self.load_matching(without_pagination(query)).await?;
        Ok(aggregate(&matched, by))
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<usize, AsapError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let cutoff = cutoff.to_rfc3339();
        self.conn
            .with(move |c| c.execute("DELETE FROM usage_events WHERE timestamp < ?1", rusqlite::params![cutoff]))
            .await
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageEvent> {
    let id: String = row.get(0)?;
    let task_id: Option<String> = row.get(1)?;
    let agent_id: String = row.get(2)?;
    let consumer_id: String = row.get(3)?;
    let metrics_json: String = row.get(4)?;
    let timestamp: String = row.get(5)?;
    let metrics = serde_json::from_str(&metrics_json).unwrap_or_default();
    let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(UsageEvent {
        id,
        agent_id,
        consumer_id,
        task_id,
        metrics,
        timestamp,
    })
}
