//! Event data model — kinds, payloads, and subscription filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::{StatusBucket, Task};

/// Namespaced event kinds mirrored onto the SSE `event:` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskClaimed,
    TaskCompleted,
    TaskFailed,
    TaskCanceled,
    TaskTimeout,
    AgentRegistered,
    AgentOffline,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskClaimed => "task_claimed",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskCanceled => "task_canceled",
            EventKind::TaskTimeout => "task_timeout",
            EventKind::AgentRegistered => "agent_registered",
            EventKind::AgentOffline => "agent_offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_created" => Some(EventKind::TaskCreated),
            "task_claimed" => Some(EventKind::TaskClaimed),
            "task_completed" => Some(EventKind::TaskCompleted),
            "task_failed" => Some(EventKind::TaskFailed),
            "task_canceled" => Some(EventKind::TaskCanceled),
            "task_timeout" => Some(EventKind::TaskTimeout),
            "agent_registered" => Some(EventKind::AgentRegistered),
            "agent_offline" => Some(EventKind::AgentOffline),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an agent's directory entry carried by agent-shaped events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
}

/// The typed payload of an event: a task snapshot or an agent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload_type", rename_all = "snake_case")]
pub enum EventPayload {
    Task { task: Task },
    Agent { agent: AgentSnapshot },
}

/// A lifecycle event. IDs are strictly increasing and never reused, so
/// "replay everything after X" is well defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Subscription filter. All provided dimensions are ANDed.
///
/// `kinds` applies to every event. `status`, `platform`, and `skills` are
/// task dimensions: an agent-shaped event passes them unconditionally, even
/// though it carries no status — that asymmetry is deliberate so an
/// observer watching pending tasks still sees agents come and go.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Option<Vec<EventKind>>,
    pub status: Option<StatusBucket>,
    pub platform: Option<String>,
    pub skills: Option<Vec<String>>,
}

impl EventFilter {
    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        match &event.payload {
            EventPayload::Task { task } => {
                if let Some(status) = self.status {
                    if task.state.bucket() != status {
                        return false;
                    }
                }
                if let Some(ref platform) = self.platform {
                    if &task.creator_platform != platform {
                        return false;
                    }
                }
                if let Some(ref skills) = self.skills {
                    // Tasks advertise required skills in metadata.
                    let task_skills: Vec<String> = task
                        .metadata
                        .get("skills")
                        .and_then(|v| v.as_array())
                        .map(|a| {
                            a.iter()
                                .filter_map(|s| s.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    if !skills.iter().any(|s| task_skills.contains(s)) {
                        return false;
                    }
                }
                true
            }
            // Task dimensions never constrain agent events, even though
            // agents carry a skills list of their own.
            EventPayload::Agent { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Task, TaskState};

    fn task_event(id: u64, state: TaskState, platform: &str) -> Event {
        let mut task = Task::new("T", platform);
        task.state = state;
        Event {
            id,
            kind: EventKind::TaskCreated,
            at: Utc::now(),
            payload: EventPayload::Task { task },
        }
    }

    fn agent_event(id: u64) -> Event {
        Event {
            id,
            kind: EventKind::AgentRegistered,
            at: Utc::now(),
            payload: EventPayload::Agent {
                agent: AgentSnapshot {
                    agent_id: "agent-1".into(),
                    base_url: None,
                    skills: vec!["code-review".into()],
                },
            },
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&task_event(1, TaskState::Submitted, "cli")));
        assert!(filter.matches(&agent_event(2)));
    }

    #[test]
    fn status_filter_applies_to_tasks() {
        let filter = EventFilter {
            status: Some(StatusBucket::Pending),
            ..Default::default()
        };
        assert!(filter.matches(&task_event(1, TaskState::Submitted, "cli")));
        assert!(!filter.matches(&task_event(2, TaskState::Working, "cli")));
    }

    #[test]
    fn status_filter_passes_agent_events_through() {
        // Agent events carry no status; the task dimension must not drop them.
        let filter = EventFilter {
            status: Some(StatusBucket::Pending),
            ..Default::default()
        };
        assert!(filter.matches(&agent_event(1)));
    }

    #[test]
    fn kind_filter_applies_to_all_events() {
        let filter = EventFilter {
            kinds: Some(vec![EventKind::TaskCreated]),
            ..Default::default()
        };
        assert!(filter.matches(&task_event(1, TaskState::Submitted, "cli")));
        assert!(!filter.matches(&agent_event(2)));
    }

    #[test]
    fn platform_filter() {
        let filter = EventFilter {
            platform: Some("telegram".into()),
            ..Default::default()
        };
        assert!(filter.matches(&task_event(1, TaskState::Submitted, "telegram")));
        assert!(!filter.matches(&task_event(2, TaskState::Submitted, "email")));
        assert!(filter.matches(&agent_event(3)));
    }

    #[test]
    fn skills_filter_applies_to_tasks_only() {
        let filter = EventFilter {
            skills: Some(vec!["code-review".into()]),
            ..Default::default()
        };

        let mut task = Task::new("T", "cli");
        task.metadata
            .insert("skills".into(), serde_json::json!(["code-review"]));
        let event = Event {
            id: 2,
            kind: EventKind::TaskCreated,
            at: Utc::now(),
            payload: EventPayload::Task { task },
        };
        assert!(filter.matches(&event));
        assert!(!filter.matches(&task_event(3, TaskState::Submitted, "cli")));

        // Agent events carry skills too, but the task dimension must not
        // touch them.
        assert!(filter.matches(&agent_event(1)));
    }

    #[test]
    fn event_serializes_with_flattened_payload() {
        let event = task_event(7, TaskState::Submitted, "cli");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["kind"], "task_created");
        assert_eq!(json["payload_type"], "task");
        assert_eq!(json["task"]["state"], "submitted");
    }

    #[test]
    fn kind_parse_roundtrip() {
        for k in [
            EventKind::TaskCreated,
            EventKind::TaskClaimed,
            EventKind::TaskCompleted,
            EventKind::TaskFailed,
            EventKind::TaskCanceled,
            EventKind::TaskTimeout,
            EventKind::AgentRegistered,
            EventKind::AgentOffline,
        ] {
            assert_eq!(EventKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(EventKind::parse("nope"), None);
    }
}
