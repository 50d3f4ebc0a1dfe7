//! Delegator — admission control and the pending-task set.
//!
//! At most one task may be in flight per agent. The slot is taken at
//! admission and held until the result report, a cancellation, or a
//! timeout frees it; excess work is rejected outright, never queued.

pub mod sweeper;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DelegateError, Error};
use crate::events::{EventBus, EventKind, EventPayload};
use crate::store::{StoreError, TaskStore};
use crate::tasks::{Task, TaskState};

/// A task admitted for an agent but not yet picked up.
#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    pub task_id: Uuid,
    pub text: String,
    pub priority: i32,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
}

/// One agent's occupied slot, held from admission to terminal resolution.
#[derive(Debug, Clone)]
struct Slot {
    task_id: Uuid,
    admitted_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    /// Entries awaiting pickup, keyed by task ID.
    pending: HashMap<Uuid, PendingEntry>,
    /// Occupied slots, keyed by agent ID. One slot per agent.
    slots: HashMap<String, Slot>,
}

/// Capacity-limited task delegator.
pub struct Delegator {
    store: Arc<dyn TaskStore>,
    bus: Arc<EventBus>,
    // The admission check and the slot insert must be one atomic unit; a
    // suspension point between them would let two concurrent admissions
    // for the same agent both succeed. std::sync::Mutex, never held
    // across an await.
    inner: Mutex<Inner>,
}

impl Delegator {
    pub fn new(store: Arc<dyn TaskStore>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Admit a task for `agent_id`.
    ///
    /// Fails with [`DelegateError::AgentBusy`] when the agent already holds
    /// a pending or in-flight entry. This is a hard admission decision —
    /// the caller gets the rejection, nothing is queued.
    pub fn admit(
        &self,
        task_id: Uuid,
        text: impl Into<String>,
        priority: i32,
        agent_id: impl Into<String>,
    ) -> Result<PendingEntry, DelegateError> {
        let agent_id = agent_id.into();
        let mut inner = self.inner.lock().expect("delegator lock poisoned");

        if inner.slots.contains_key(&agent_id) {
            debug!(agent_id = %agent_id, task_id = %task_id, "Admission rejected, agent busy");
            return Err(DelegateError::AgentBusy { agent_id });
        }

        let now = Utc::now();
        let entry = PendingEntry {
            task_id,
            text: text.into(),
            priority,
            agent_id: agent_id.clone(),
            created_at: now,
        };
        inner.slots.insert(
            agent_id.clone(),
            Slot {
                task_id,
                admitted_at: now,
            },
        );
        inner.pending.insert(task_id, entry.clone());
        drop(inner);

        info!(task_id = %task_id, agent_id = %agent_id, priority, "Task admitted");
        Ok(entry)
    }

    /// Pending entries for an agent, highest priority first. Polled by the
    /// receiving side.
    pub fn list_pending(&self, agent_id: &str) -> Vec<PendingEntry> {
        let inner = self.inner.lock().expect("delegator lock poisoned");
        let mut entries: Vec<PendingEntry> = inner
            .pending
            .values()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        entries
    }

    /// Acknowledge pickup: the entry leaves the pending set (the slot stays
    /// occupied), the task moves to `working`, and `task_claimed` goes out.
    pub async fn claim(&self, task_id: Uuid, agent_id: &str) -> Result<Task, Error> {
        {
            let mut inner = self.inner.lock().expect("delegator lock poisoned");
            let claimable = inner
                .pending
                .get(&task_id)
                .is_some_and(|e| e.agent_id == agent_id);
            if !claimable {
                return Err(DelegateError::NotPending { task_id }.into());
            }
            inner.pending.remove(&task_id);
        }

        self.store
            .set_owner(task_id, agent_id)
            .await
            .map_err(crate::error::Error::Database)?;
        let task = self.transition(task_id, TaskState::Working, None).await?;
        if task.state == TaskState::Working {
            self.bus
                .publish(EventKind::TaskClaimed, EventPayload::Task { task: task.clone() });
        }
        Ok(task)
    }

    /// Report the outcome for a task: the pending entry and slot are
    /// released and the store moves to `completed` or `failed`.
    ///
    /// Idempotent — a second report (or a report after cancellation or
    /// timeout) finds the task already terminal and returns the stored
    /// record without error or event. The receiving side must never see a
    /// late report fail.
    pub async fn report_result(
        &self,
        task_id: Uuid,
        result: std::result::Result<serde_json::Value, String>,
    ) -> Result<Task, Error> {
        self.release(task_id);

        let (state, mut patch) = match result {
            Ok(value) => {
                let mut m = serde_json::Map::new();
                m.insert("result".into(), value);
                (TaskState::Completed, m)
            }
            Err(message) => {
                let mut m = serde_json::Map::new();
                m.insert("error".into(), serde_json::Value::String(message));
                (TaskState::Failed, m)
            }
        };
        patch.insert(
            "reported_at".into(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );

        let task = self.transition(task_id, state, Some(patch)).await?;

        // A no-op on an already-terminal task publishes nothing.
        if task.state == state {
            let kind = match state {
                TaskState::Completed => EventKind::TaskCompleted,
                _ => EventKind::TaskFailed,
            };
            self.bus
                .publish(kind, EventPayload::Task { task: task.clone() });
        } else {
            debug!(task_id = %task_id, state = %task.state, "Late result report discarded");
        }
        Ok(task)
    }

    /// Best-effort cancellation. Removes the pending entry when present and
    /// moves the task to `canceled`; a task that already reached a terminal
    /// state is left as-is and returned.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, Error> {
        let was_pending = self.release(task_id);

        let task = self
            .transition(task_id, TaskState::Canceled, None)
            .await?;
        if task.state == TaskState::Canceled {
            self.bus
                .publish(EventKind::TaskCanceled, EventPayload::Task { task: task.clone() });
            info!(task_id = %task_id, was_pending, "Task canceled");
        } else {
            debug!(task_id = %task_id, state = %task.state, "Cancel on settled task, no-op");
        }
        Ok(task)
    }

    /// Internal removal path for the sweeper: free the slot and force the
    /// task to `timeout`, recording the reason.
    pub(crate) async fn force_timeout(&self, task_id: Uuid, reason: String) -> Result<Task, Error> {
        self.release(task_id);

        let mut patch = serde_json::Map::new();
        patch.insert("timeout_reason".into(), serde_json::Value::String(reason));

        let task = self.transition(task_id, TaskState::Timeout, Some(patch)).await?;
        if task.state == TaskState::Timeout {
            warn!(task_id = %task_id, "Task timed out");
            self.bus
                .publish(EventKind::TaskTimeout, EventPayload::Task { task: task.clone() });
        }
        Ok(task)
    }

    /// Slots older than `max_age`, for the sweeper. `(task_id, agent_id,
    /// admitted_at)` triples, snapshot taken under the lock.
    pub(crate) fn stalled(&self, max_age: std::time::Duration) -> Vec<(Uuid, String, DateTime<Utc>)> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let inner = self.inner.lock().expect("delegator lock poisoned");
        inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.admitted_at < cutoff)
            .map(|(agent, slot)| (slot.task_id, agent.clone(), slot.admitted_at))
            .collect()
    }

    /// Remove the pending entry and slot for a task. Returns whether a
    /// pending entry was present.
    fn release(&self, task_id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("delegator lock poisoned");
        let was_pending = inner.pending.remove(&task_id).is_some();
        inner
            .slots
            .retain(|_, slot| slot.task_id != task_id);
        was_pending
    }

    /// Transition helper that maps store errors onto the crate error type.
    async fn transition(
        &self,
        task_id: Uuid,
        state: TaskState,
        patch: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Task, Error> {
        self.store
            .transition(task_id, state, patch)
            .await
            .map_err(|e| match e {
                StoreError::Task(t) => Error::Task(t),
                StoreError::Database(d) => Error::Database(d),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::events::EventFilter;
    use crate::store::LibSqlBackend;

    async fn fixture() -> (Arc<dyn TaskStore>, Arc<EventBus>, Arc<Delegator>) {
        let store: Arc<dyn TaskStore> =
            Arc::new(LibSqlBackend::new_memory().await.expect("in-memory db"));
        let bus = EventBus::new(64);
        let delegator = Delegator::new(Arc::clone(&store), Arc::clone(&bus));
        (store, bus, delegator)
    }

    async fn submitted_task(store: &Arc<dyn TaskStore>) -> Task {
        let task = Task::new("T", "cli");
        store.create(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn admit_then_busy_then_free() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        let b = submitted_task(&store).await;

        delegator.admit(a.id, "do A", 0, "agent-1").unwrap();

        // Second admission for the same agent is a hard rejection.
        let err = delegator.admit(b.id, "do B", 0, "agent-1").unwrap_err();
        assert!(matches!(err, DelegateError::AgentBusy { .. }));

        // Reporting frees the slot; the next admit succeeds.
        delegator
            .report_result(a.id, Ok(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        delegator.admit(b.id, "do B", 0, "agent-1").unwrap();
    }

    #[tokio::test]
    async fn different_agents_do_not_contend() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        let b = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();
        delegator.admit(b.id, "B", 0, "agent-2").unwrap();
    }

    #[tokio::test]
    async fn list_pending_orders_by_priority() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        let b = submitted_task(&store).await;
        delegator.admit(a.id, "low", 1, "agent-1").unwrap();
        delegator.admit(b.id, "high", 5, "agent-2").unwrap();

        assert_eq!(delegator.list_pending("agent-1").len(), 1);
        let pending = delegator.list_pending("agent-2");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, b.id);
    }

    #[tokio::test]
    async fn report_result_completes_and_is_idempotent() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();

        let task = delegator
            .report_result(a.id, Ok(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert!(delegator.list_pending("agent-1").is_empty());

        // Second report is a no-op returning the same terminal record.
        let again = delegator
            .report_result(a.id, Err("too late".into()))
            .await
            .unwrap();
        assert_eq!(again.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn report_error_fails_task() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();

        let task = delegator
            .report_result(a.id, Err("agent crashed".into()))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.metadata["error"], "agent crashed");
    }

    #[tokio::test]
    async fn claim_moves_to_working_and_keeps_slot() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        let b = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();

        let task = delegator.claim(a.id, "agent-1").await.unwrap();
        assert_eq!(task.state, TaskState::Working);
        assert!(delegator.list_pending("agent-1").is_empty());

        // The slot stays occupied until the result arrives.
        let err = delegator.admit(b.id, "B", 0, "agent-1").unwrap_err();
        assert!(matches!(err, DelegateError::AgentBusy { .. }));
    }

    #[tokio::test]
    async fn claim_by_wrong_agent_rejected() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();

        let err = delegator.claim(a.id, "agent-2").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Delegate(DelegateError::NotPending { .. })
        ));
        // Entry is untouched; the right agent can still claim.
        assert_eq!(delegator.list_pending("agent-1").len(), 1);
    }

    #[tokio::test]
    async fn cancel_removes_pending_and_late_report_is_noop() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();

        let task = delegator.cancel(a.id).await.unwrap();
        assert_eq!(task.state, TaskState::Canceled);
        assert!(delegator.list_pending("agent-1").is_empty());

        // The receiving side may still report; it must not see an error.
        let late = delegator
            .report_result(a.id, Ok(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(late.state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let (_store, _bus, delegator) = fixture().await;
        let err = delegator.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::NotFound { .. })));
    }

    #[tokio::test]
    async fn events_published_for_lifecycle() {
        let (store, bus, delegator) = fixture().await;
        let mut sub = bus.subscribe(EventFilter::default(), None);

        let a = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();
        bus.publish(
            EventKind::TaskCreated,
            EventPayload::Task { task: a.clone() },
        );
        delegator.claim(a.id, "agent-1").await.unwrap();
        delegator
            .report_result(a.id, Ok(serde_json::json!(null)))
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::TaskCreated);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::TaskClaimed);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::TaskCompleted);
    }

    #[tokio::test]
    async fn force_timeout_frees_slot_and_records_reason() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        let b = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();

        let task = delegator
            .force_timeout(a.id, "no pickup within 300s".into())
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Timeout);
        assert_eq!(task.metadata["timeout_reason"], "no pickup within 300s");

        delegator.admit(b.id, "B", 0, "agent-1").unwrap();
    }

    #[tokio::test]
    async fn stalled_reports_only_old_slots() {
        let (store, _bus, delegator) = fixture().await;
        let a = submitted_task(&store).await;
        delegator.admit(a.id, "A", 0, "agent-1").unwrap();

        assert!(delegator.stalled(std::time::Duration::from_secs(60)).is_empty());
        let stalled = delegator.stalled(std::time::Duration::ZERO);
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].0, a.id);
    }
}
