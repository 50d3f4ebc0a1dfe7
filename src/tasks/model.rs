//! Task data model — the eight-state lifecycle and its four-bucket projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authoritative lifecycle state.
///
/// `submitted → working → {input_required ⇄ working}` and from any
/// non-terminal state into one of the five terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
    Rejected,
    Timeout,
}

impl TaskState {
    /// Whether this state is terminal. Terminal tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Failed
                | TaskState::Canceled
                | TaskState::Rejected
                | TaskState::Timeout
        )
    }

    /// Whether `to` is reachable from `self` in one transition.
    pub fn reachable(self, to: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self {
            TaskState::Submitted => to == TaskState::Working || to.is_terminal(),
            TaskState::Working => to == TaskState::InputRequired || to.is_terminal(),
            TaskState::InputRequired => to == TaskState::Working || to.is_terminal(),
            _ => false,
        }
    }

    /// Simplified projection used by aggregate/export views.
    ///
    /// This mapping is a compatibility contract consumed by the legacy
    /// import and any downstream store: do not change it without
    /// migrating both sides.
    pub fn bucket(self) -> StatusBucket {
        match self {
            TaskState::Submitted => StatusBucket::Pending,
            TaskState::Working | TaskState::InputRequired => StatusBucket::InProgress,
            TaskState::Completed | TaskState::Failed | TaskState::Timeout => {
                StatusBucket::Completed
            }
            TaskState::Canceled | TaskState::Rejected => StatusBucket::Deleted,
        }
    }

    /// Canonical DB string for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input_required",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
            TaskState::Rejected => "rejected",
            TaskState::Timeout => "timeout",
        }
    }

    /// Parse a DB string. Unknown strings fall back to `Submitted` so a
    /// corrupted row surfaces as pending work instead of vanishing.
    pub fn parse(s: &str) -> Self {
        match s {
            "working" => TaskState::Working,
            "input_required" => TaskState::InputRequired,
            "completed" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "canceled" => TaskState::Canceled,
            "rejected" => TaskState::Rejected,
            "timeout" => TaskState::Timeout,
            _ => TaskState::Submitted,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-bucket projection of [`TaskState`] for aggregate views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusBucket {
    Pending,
    InProgress,
    Completed,
    Deleted,
}

impl StatusBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusBucket::Pending => "pending",
            StatusBucket::InProgress => "in_progress",
            StatusBucket::Completed => "completed",
            StatusBucket::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StatusBucket::Pending),
            "in_progress" => Some(StatusBucket::InProgress),
            "completed" => Some(StatusBucket::Completed),
            "deleted" => Some(StatusBucket::Deleted),
            _ => None,
        }
    }
}

/// A delegated unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: Uuid,
    /// Short subject line.
    pub subject: String,
    /// Longer description of the work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Present-tense display text ("Reviewing PR #42").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    /// Lifecycle state.
    pub state: TaskState,
    /// Agent that holds this task, once claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Platform that submitted the task.
    pub creator_platform: String,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Create a new task in `submitted` state.
    pub fn new(subject: impl Into<String>, creator_platform: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            description: None,
            active_form: None,
            state: TaskState::Submitted,
            owner: None,
            creator_platform: creator_platform.into(),
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Builder: set active form.
    pub fn with_active_form(mut self, text: impl Into<String>) -> Self {
        self.active_form = Some(text.into());
        self
    }

    /// Builder: set owner.
    pub fn with_owner(mut self, agent_id: impl Into<String>) -> Self {
        self.owner = Some(agent_id.into());
        self
    }

    /// The bucket this task projects into.
    pub fn bucket(&self) -> StatusBucket {
        self.state.bucket()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_defaults() {
        let task = Task::new("Review PR", "telegram");
        assert_eq!(task.state, TaskState::Submitted);
        assert!(task.owner.is_none());
        assert!(task.metadata.is_empty());
        assert_eq!(task.creator_platform, "telegram");
    }

    #[test]
    fn terminal_states() {
        for s in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
            TaskState::Rejected,
            TaskState::Timeout,
        ] {
            assert!(s.is_terminal());
        }
        for s in [TaskState::Submitted, TaskState::Working, TaskState::InputRequired] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn submitted_reaches_working_and_terminals() {
        assert!(TaskState::Submitted.reachable(TaskState::Working));
        assert!(TaskState::Submitted.reachable(TaskState::Rejected));
        assert!(TaskState::Submitted.reachable(TaskState::Timeout));
        assert!(!TaskState::Submitted.reachable(TaskState::Submitted));
        assert!(!TaskState::Submitted.reachable(TaskState::InputRequired));
    }

    #[test]
    fn input_required_oscillates_with_working() {
        assert!(TaskState::Working.reachable(TaskState::InputRequired));
        assert!(TaskState::InputRequired.reachable(TaskState::Working));
        assert!(TaskState::InputRequired.reachable(TaskState::Failed));
        assert!(!TaskState::InputRequired.reachable(TaskState::Submitted));
    }

    #[test]
    fn terminal_states_reach_nothing() {
        for s in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
            TaskState::Rejected,
            TaskState::Timeout,
        ] {
            for t in [TaskState::Submitted, TaskState::Working, TaskState::Completed] {
                assert!(!s.reachable(t), "{s} should not reach {t}");
            }
        }
    }

    #[test]
    fn bucket_mapping_is_the_compatibility_contract() {
        assert_eq!(TaskState::Submitted.bucket(), StatusBucket::Pending);
        assert_eq!(TaskState::Working.bucket(), StatusBucket::InProgress);
        assert_eq!(TaskState::InputRequired.bucket(), StatusBucket::InProgress);
        assert_eq!(TaskState::Completed.bucket(), StatusBucket::Completed);
        assert_eq!(TaskState::Failed.bucket(), StatusBucket::Completed);
        assert_eq!(TaskState::Timeout.bucket(), StatusBucket::Completed);
        assert_eq!(TaskState::Canceled.bucket(), StatusBucket::Deleted);
        assert_eq!(TaskState::Rejected.bucket(), StatusBucket::Deleted);
    }

    #[test]
    fn state_serde_snake_case() {
        let json = serde_json::to_string(&TaskState::InputRequired).unwrap();
        assert_eq!(json, "\"input_required\"");
        let parsed: TaskState = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(parsed, TaskState::Timeout);
    }

    #[test]
    fn state_db_string_roundtrip() {
        for s in [
            TaskState::Submitted,
            TaskState::Working,
            TaskState::InputRequired,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
            TaskState::Rejected,
            TaskState::Timeout,
        ] {
            assert_eq!(TaskState::parse(s.as_str()), s);
        }
        assert_eq!(TaskState::parse("garbage"), TaskState::Submitted);
    }

    #[test]
    fn task_serde_optional_fields_omitted() {
        let task = Task::new("T", "cli");
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("\"description\""));
        assert!(!json.contains("\"owner\""));
        assert!(!json.contains("\"metadata\""));
    }
}
