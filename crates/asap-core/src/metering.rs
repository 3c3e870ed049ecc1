//! Usage metering data model: events, query windows and aggregates.
//!
//! Grounded in the distilled system's economics storage layer; the store
//! implementations that record/query/aggregate these types live in
//! `asap-storage`.

use chrono::{DateTime, Datelike, IsoWeek, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single recorded unit of agent usage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UsageEvent {
    /// Unique event id.
    pub id: String,
    /// Serving agent's id.
    pub agent_id: String,
    /// Consuming caller's id.
    pub consumer_id: String,
    /// Associated task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Arbitrary typed metrics (e.g. `tokens_in`, `tokens_out`,
    /// `duration_ms`, `api_calls`).
    pub metrics: BTreeMap<String, Value>,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    fn metric_i64(&self, key: &str) -> i64 {
        self.metrics
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Sum of `tokens_in` and `tokens_out`.
    pub fn total_tokens(&self) -> i64 {
        self.metric_i64("tokens_in") + self.metric_i64("tokens_out")
    }

    /// The `duration_ms` metric, or 0 if absent.
    pub fn duration_ms(&self) -> i64 {
        self.metric_i64("duration_ms")
    }

    /// The `api_calls` metric, or 0 if absent.
    pub fn api_calls(&self) -> i64 {
        self.metric_i64("api_calls")
    }
}

/// Filters and pagination for querying usage events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeteringQuery {
    /// Restrict to a single agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Restrict to a single consumer.
    #[serde(default)]
    pub consumer_id: Option<String>,
    /// Restrict to a single task.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Inclusive lower timestamp bound.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper timestamp bound.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Maximum events to return.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Events to skip before applying `limit`.
    #[serde(default)]
    pub offset: usize,
}

impl MeteringQuery {
    /// True if `event` satisfies every set filter.
    pub fn matches(&self, event: &UsageEvent) -> bool {
        self.agent_id.as_deref().is_none_or(|v| v == event.agent_id)
            && self.consumer_id.as_deref().is_none_or(|v| v == event.consumer_id)
            && self
                .task_id
                .as_deref()
                .is_none_or(|v| event.task_id.as_deref() == Some(v))
            && self.start.is_none_or(|s| event.timestamp >= s)
            && self.end.is_none_or(|e| event.timestamp <= e)
    }
}

/// The dimension usage events are aggregated along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateBy {
    /// Group by serving agent.
    Agent,
    /// Group by consuming caller.
    Consumer,
    /// Group by UTC calendar day.
    Day,
    /// Group by ISO calendar week.
    Week,
}

/// One bucket of an aggregation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UsageAggregate {
    /// The grouping key (agent id, consumer id, ISO date, or ISO week).
    pub key: String,
    /// Sum of `tokens_in + tokens_out` across the bucket.
    pub total_tokens: i64,
    /// Sum of `duration_ms` across the bucket.
    pub total_duration_ms: i64,
    /// Count of distinct `task_id`s in the bucket.
    pub total_tasks: u64,
    /// Count of events (API calls) in the bucket.
    pub total_api_calls: i64,
    /// `total_tokens / total_tasks`, or 0.0 if there are no tasks.
    pub avg_tokens_per_task: f64,
    /// `total_duration_ms / total_tasks`, or 0.0 if there are no tasks.
    pub avg_duration_ms_per_task: f64,
}

fn bucket_key(event: &UsageEvent, by: AggregateBy) -> String {
    match by {
        AggregateBy::Agent => event.agent_id.clone(),
        AggregateBy::Consumer => event.consumer_id.clone(),
        AggregateBy::Day => event.timestamp.date_naive().to_string(),
        AggregateBy::Week => {
            let iso: IsoWeek = event.timestamp.iso_week();
            format!("{}-W{:02}", iso.year(), iso.week())
        }
    }
}

/// Aggregate `events` by the requested dimension.
///
/// Buckets are returned sorted by key for deterministic output.
pub fn aggregate(events: &[UsageEvent], by: AggregateBy) -> Vec<UsageAggregate> {
    let mut buckets: BTreeMap<String, Vec<&UsageEvent>> = BTreeMap::new();
    for event in events {
        buckets.entry(bucket_key(event, by)).or_default().push(event);
    }

    buckets
        .into_iter()
        .map(|(key, bucket)| {
            let total_tokens: i64 = bucket.iter().map(|e| e.total_tokens()).sum();
            let total_duration_ms: i64 = bucket.iter().map(|e| e.duration_ms()).sum();
            let total_api_calls: i64 = bucket.iter().map(|e| e.api_calls()).sum();
            let total_tasks = bucket
                .iter()
                .filter_map(|e| e.task_id.as_deref())
                .collect::<std::collections::BTreeSet<_>>()
                .len() as u64;
            let (avg_tokens_per_task, avg_duration_ms_per_task) = if total_tasks > 0 {
                (
                    total_tokens as f64 / total_tasks as f64,
                    total_duration_ms as f64 / total_tasks as f64,
                )
            } else {
                (0.0, 0.0)
            };
            UsageAggregate {
                key,
                total_tokens,
                total_duration_ms,
                total_tasks,
                total_api_calls,
                avg_tokens_per_task,
                avg_duration_ms_per_task,
            }
        })
        .collect()
}
