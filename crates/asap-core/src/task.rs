//! Task, Message, Artifact, Part, StateSnapshot and Conversation: the
//! lifecycle entities owned by server-side storage.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Maximum allowed task nesting depth; prevents unbounded subtask
/// recursion.
pub const MAX_TASK_DEPTH: u32 = 10;

/// Closed set of task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started.
    Submitted,
    /// A handler is actively processing this task.
    Working,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Waiting on additional caller input.
    InputRequired,
}

impl TaskStatus {
    /// True if this status is one of the terminal states
    /// (`completed`, `failed`, `cancelled`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// True if a task in this status may still be cancelled
    /// (`submitted` or `working`).
    pub fn can_be_cancelled(&self) -> bool {
        matches!(self, Self::Submitted | Self::Working)
    }
}

/// A unit of work tracked by the server.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    /// Unique task id.
    pub id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Parent task, if this is a subtask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Nesting depth; root tasks are depth 0.
    pub depth: u32,
    /// Optional progress fraction in `[0.0, 1.0]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last-modified time.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Start a new root task (depth 0, status `submitted`).
    pub fn new_root(id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            parent_task_id: None,
            status: TaskStatus::Submitted,
            depth: 0,
            progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Start a subtask of `parent`. Returns an error if `parent.depth + 1`
    /// would exceed [`MAX_TASK_DEPTH`].
    pub fn new_subtask(
        id: impl Into<String>,
        parent: &Task,
    ) -> Result<Self, crate::CoreError> {
        let depth = parent.depth + 1;
        if depth > MAX_TASK_DEPTH {
            return Err(crate::CoreError::Validation(asap_error::AsapError::new(
                asap_error::ErrorCode::InvalidSchema,
                format!("task depth {depth} exceeds MAX_TASK_DEPTH ({MAX_TASK_DEPTH})"),
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: id.into(),
            conversation_id: parent.conversation_id.clone(),
            parent_task_id: Some(parent.id.clone()),
            status: TaskStatus::Submitted,
            depth,
            progress: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Shorthand for `self.status.is_terminal()`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Shorthand for `self.status.can_be_cancelled()`.
    pub fn can_be_cancelled(&self) -> bool {
        self.status.can_be_cancelled()
    }
}

/// A discriminated content unit carried by messages and artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "part_type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text content.
    Text {
        /// The text body.
        text: String,
    },
    /// Structured JSON content.
    Data {
        /// The structured payload.
        data: Value,
    },
    /// A reference to out-of-band file content.
    File {
        /// Location of the file.
        uri: String,
        /// MIME type of the file.
        mime_type: String,
    },
}

/// A role attributed to a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The requesting agent.
    User,
    /// The serving agent.
    Agent,
    /// A system-level annotation.
    System,
}

/// A message exchanged within a task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    /// Unique message id.
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Sending agent's URN.
    pub sender: String,
    /// Role of the sender.
    pub role: Role,
    /// Ordered content parts.
    pub parts: Vec<Part>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// A named, persisted output of a task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    /// Unique artifact id.
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Human-readable name.
    pub name: String,
    /// Ordered content parts.
    pub parts: Vec<Part>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A versioned checkpoint of task state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StateSnapshot {
    /// Unique snapshot id.
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Caller-chosen version; strictly increasing per task, not
    /// auto-assigned by the store.
    pub version: u64,
    /// Snapshotted state.
    pub data: Value,
    /// Optional named checkpoint label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Validate that `version >= 1`, per the data model invariant.
    pub fn validate(&self) -> Result<(), crate::CoreError> {
        if self.version < 1 {
            return Err(crate::CoreError::Validation(asap_error::AsapError::new(
                asap_error::ErrorCode::InvalidSchema,
                "snapshot version must be >= 1",
            )));
        }
        Ok(())
    }
}

/// Groups related tasks and messages.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Conversation {
    /// Unique conversation id.
    pub id: String,
    /// Participant URNs.
    pub participants: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Arbitrary caller metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_match_spec() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Submitted.is_terminal());
        assert!(!TaskStatus::Working.is_terminal());
        assert!(!TaskStatus::InputRequired.is_terminal());
    }

    #[test]
    fn cancellable_states_match_spec() {
        assert!(TaskStatus::Submitted.can_be_cancelled());
        assert!(TaskStatus::Working.can_be_cancelled());
        assert!(!TaskStatus::Completed.can_be_cancelled());
        assert!(!TaskStatus::InputRequired.can_be_cancelled());
    }

    #[test]
    fn subtask_depth_increments() {
        let root = Task::new_root("t1", "c1");
        let child = Task::new_subtask("t2", &root).unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_task_id, Some("t1".to_string()));
        assert_eq!(child.conversation_id, "c1");
    }

    #[test]
    fn subtask_rejects_depth_beyond_max() {
        let mut parent = Task::new_root("root", "c1");
        parent.depth = MAX_TASK_DEPTH;
        assert!(Task::new_subtask("child", &parent).is_err());
    }

    #[test]
    fn snapshot_rejects_zero_version() {
        let snap = StateSnapshot {
            id: "s1".into(),
            task_id: "t1".into(),
            version: 0,
            data: serde_json::json!({}),
            checkpoint: None,
            created_at: Utc::now(),
        };
        assert!(snap.validate().is_err());
    }

    #[test]
    fn part_tagging_round_trips() {
        let part = Part::Text { text: "hi".into() };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"part_type\":\"text\""));
        let back: Part = serde_json::from_str(&json).unwrap();
        matches!(back, Part::Text { .. });
    }
}
