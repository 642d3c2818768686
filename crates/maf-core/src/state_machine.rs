//! Task state machine (component C): legal transitions, tie-breaking for
//! `list`, and the event every transition emits. Grounded on the teacher's
//! `IssueStore::transition_state` shape (`storage/mod.rs`) generalized from
//! a single issue-tracker status enum to the task lifecycle of §3.

use crate::errors::{MafError, MafResult};
use crate::model::{Event, EventKind, Task, TaskState};
use crate::store::Store;
use serde_json::Value;

/// Filter for `Store::list_tasks`. All fields optional; `None` matches all.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub states: Option<Vec<TaskState>>,
    pub min_priority: Option<i64>,
    pub max_priority: Option<i64>,
    pub policy_label: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&task.state) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        if let Some(max) = self.max_priority {
            if task.priority > max {
                return false;
            }
        }
        if let Some(label) = &self.policy_label {
            if task.policy_label.as_deref() != Some(label.as_str()) {
                return false;
            }
        }
        true
    }
}

fn is_legal_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Ready, Leased)
            | (Leased, Ready)
            | (Leased, Running)
            | (Running, Verifying)
            | (Verifying, Committed)
            | (Verifying, Rollback)
            | (Committed, Done)
            | (Rollback, Ready)
            | (Rollback, Dead)
    )
}

fn event_kind_for(to: TaskState) -> EventKind {
    match to {
        TaskState::Ready => EventKind::Created,
        TaskState::Leased => EventKind::Claimed,
        TaskState::Running => EventKind::Running,
        TaskState::Verifying => EventKind::Verifying,
        TaskState::Committed => EventKind::Committed,
        TaskState::Rollback => EventKind::Rollback,
        TaskState::Done => EventKind::Done,
        TaskState::Dead => EventKind::Dead,
    }
}

impl Store {
    /// Creates a new task in `READY`, emitting `CREATED`.
    pub fn create_task(&self, id: String, priority: i64, payload: Value) -> MafResult<String> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            if tx.get_task(&id)?.is_some() {
                return Err(MafError::InvalidArgument(format!(
                    "task {id} already exists"
                )));
            }
            let task = Task::new(id.clone(), priority, payload.clone(), now);
            tx.put_task(&task)?;
            let event_id = tx.next_event_id()?;
            tx.append_event(&Event {
                id: event_id,
                task_id: Some(id.clone()),
                ts: now,
                kind: EventKind::Created,
                data: Value::Null,
            })?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Declares the file paths a task intends to touch, prior to claiming.
    pub fn set_declared_files(&self, task_id: &str, files: Vec<String>) -> MafResult<()> {
        self.with_tx(|tx| {
            let mut task = tx
                .get_task(task_id)?
                .ok_or_else(|| MafError::not_found("task", task_id))?;
            task.declared_files = files.clone();
            tx.put_task(&task)
        })
    }

    /// Sets the verifiers commit-completeness is checked against (§4.G).
    pub fn set_required_verifiers(
        &self,
        task_id: &str,
        verifiers: std::collections::BTreeSet<String>,
    ) -> MafResult<()> {
        self.with_tx(|tx| {
            let mut task = tx
                .get_task(task_id)?
                .ok_or_else(|| MafError::not_found("task", task_id))?;
            task.required_verifiers = verifiers.clone();
            tx.put_task(&task)
        })
    }

    pub fn get_task(&self, task_id: &str) -> MafResult<Task> {
        self.with_tx(|tx| tx.get_task(task_id))?
            .ok_or_else(|| MafError::not_found("task", task_id))
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> MafResult<Vec<Task>> {
        let mut tasks = self.with_tx(|tx| tx.list_tasks())?;
        tasks.retain(|t| filter.matches(t));
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// Moves a task from `from` to `to`, failing with `IllegalTransition`
    /// unless the pair is legal and the observed state matches `from`.
    /// `patch` lets callers set fields alongside the transition (attempts
    /// increments, and so on) within the same transaction that writes the
    /// transition's event.
    pub fn transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        patch: impl Fn(&mut Task) + Send + Sync,
    ) -> MafResult<Task> {
        if !is_legal_transition(from, to) {
            return Err(MafError::IllegalTransition {
                task_id: task_id.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let now = self.now_ms();
        self.with_tx(|tx| {
            let mut task = tx
                .get_task(task_id)?
                .ok_or_else(|| MafError::not_found("task", task_id))?;
            if task.state != from {
                return Err(MafError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from: task.state.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }
            task.state = to;
            task.updated_at = now;
            patch(&mut task);
            tx.put_task(&task)?;
            let event_id = tx.next_event_id()?;
            tx.append_event(&Event {
                id: event_id,
                task_id: Some(task_id.to_string()),
                ts: now,
                kind: event_kind_for(to),
                data: Value::Null,
            })?;
            Ok(task.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::store::{Backend, Store};
    use std::sync::Arc;

    fn test_store() -> Store {
        let backend = Backend::Memory(crate::store::memory::MemoryStore::new());
        Store::new(backend, Arc::new(FakeClock::new(0))).unwrap()
    }

    #[test]
    fn create_then_transition_through_happy_path() {
        let store = test_store();
        store
            .create_task("t1".into(), 10, serde_json::json!({}))
            .unwrap();

        let task = store
            .transition(
                "t1",
                TaskState::Ready,
                TaskState::Leased,
                |_t| {},
            )
            .unwrap();
        assert_eq!(task.state, TaskState::Leased);

        let task = store
            .transition("t1", TaskState::Leased, TaskState::Running, |_t| {})
            .unwrap();
        assert_eq!(task.state, TaskState::Running);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let store = test_store();
        store
            .create_task("t1".into(), 10, serde_json::json!({}))
            .unwrap();

        let err = store
            .transition("t1", TaskState::Ready, TaskState::Running, |_t| {})
            .unwrap_err();
        assert!(matches!(err, MafError::IllegalTransition { .. }));
    }

    #[test]
    fn transition_fails_when_observed_state_differs_from_from() {
        let store = test_store();
        store
            .create_task("t1".into(), 10, serde_json::json!({}))
            .unwrap();
        store
            .transition("t1", TaskState::Ready, TaskState::Leased, |_t| {})
            .unwrap();

        let err = store
            .transition("t1", TaskState::Ready, TaskState::Leased, |_t| {})
            .unwrap_err();
        assert!(matches!(err, MafError::IllegalTransition { .. }));
    }

    #[test]
    fn list_ties_break_on_created_at_then_id() {
        let store = test_store();
        store
            .create_task("b".into(), 5, serde_json::json!({}))
            .unwrap();
        store
            .create_task("a".into(), 5, serde_json::json!({}))
            .unwrap();

        let tasks = store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks[0].id, "b");
        assert_eq!(tasks[1].id, "a");
    }

    #[test]
    fn rollback_to_ready_increments_attempts() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store
            .transition("t1", TaskState::Ready, TaskState::Leased, |_| {})
            .unwrap();
        store
            .transition("t1", TaskState::Leased, TaskState::Running, |_| {})
            .unwrap();
        store
            .transition("t1", TaskState::Running, TaskState::Verifying, |_| {})
            .unwrap();
        let task = store
            .transition("t1", TaskState::Verifying, TaskState::Rollback, |_| {})
            .unwrap();
        assert_eq!(task.state, TaskState::Rollback);

        let task = store
            .transition("t1", TaskState::Rollback, TaskState::Ready, |t| {
                t.attempts += 1;
            })
            .unwrap();
        assert_eq!(task.attempts, 1);
    }
}
