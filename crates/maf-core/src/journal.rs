//! Event & Evidence Journal (component G). Grounded on the teacher's
//! append-only audit log pattern (`storage/claim_coordinator.rs`'s
//! `ClaimLogEntry` sequence), generalized from claim-only entries to the
//! full event-kind vocabulary of §4.G plus per-attempt verifier evidence
//! and the commit-completeness rule.

use crate::errors::{MafError, MafResult};
use crate::model::{Event, EventKind, Evidence, TaskState, VerifierResult};
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub recent: Option<usize>,
    pub kind: Option<Vec<EventKind>>,
    pub task_id: Option<String>,
}

const EVENT_QUERY_CAP: usize = 1000;

impl Store {
    /// Appends a verifier's result for `(task_id, attempt, verifier)`.
    /// Fails if that key already has an evidence row — evidence is
    /// append-only and never overwritten.
    pub fn record_evidence(
        &self,
        task_id: &str,
        attempt: u32,
        verifier: &str,
        result: VerifierResult,
        details: serde_json::Value,
    ) -> MafResult<()> {
        self.with_tx(|tx| {
            let task = tx
                .get_task(task_id)?
                .ok_or_else(|| MafError::not_found("task", task_id))?;
            if attempt > task.attempts {
                return Err(MafError::InvalidArgument(format!(
                    "attempt {attempt} exceeds task {task_id}'s current attempts {}",
                    task.attempts
                )));
            }
            tx.put_evidence(&Evidence {
                task_id: task_id.to_string(),
                attempt,
                verifier: verifier.to_string(),
                result,
                details,
            })
        })
    }

    /// Queries events, most recent first, capped at 1000 (§4.G).
    pub fn query_events(&self, query: &EventQuery) -> MafResult<Vec<Event>> {
        let mut events = self.with_tx(|tx| tx.list_events())?;
        events.sort_by(|a, b| b.ts.cmp(&a.ts).then(b.id.cmp(&a.id)));
        if let Some(task_id) = &query.task_id {
            events.retain(|e| e.task_id.as_deref() == Some(task_id.as_str()));
        }
        if let Some(kinds) = &query.kind {
            events.retain(|e| kinds.contains(&e.kind));
        }
        let cap = query.recent.unwrap_or(EVENT_QUERY_CAP).min(EVENT_QUERY_CAP);
        events.truncate(cap);
        Ok(events)
    }

    /// Determines commit completeness (P6): `VERIFYING → COMMITTED` iff
    /// every required verifier has a `PASS` evidence row at the task's
    /// current `attempt`; otherwise `→ ROLLBACK`. Either way, the task's
    /// next legal transition is driven here so the same transaction
    /// writes both the evidence check's outcome and its event.
    pub fn resolve_verification(&self, task_id: &str) -> MafResult<TaskState> {
        let task = self.get_task(task_id)?;
        let evidence = self.with_tx(|tx| tx.list_evidence(task_id, task.attempts))?;

        let all_required_pass = task.required_verifiers.iter().all(|verifier| {
            evidence
                .iter()
                .any(|e| &e.verifier == verifier && e.result == VerifierResult::Pass)
        });

        let to = if all_required_pass {
            TaskState::Committed
        } else {
            TaskState::Rollback
        };
        let task = self.transition(task_id, TaskState::Verifying, to, |_| {})?;
        Ok(task.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::store::{Backend, Store};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn test_store() -> Store {
        let backend = Backend::Memory(crate::store::memory::MemoryStore::new());
        Store::new(backend, Arc::new(FakeClock::new(0))).unwrap()
    }

    fn advance_to_verifying(store: &Store, task_id: &str) {
        store
            .transition(task_id, TaskState::Ready, TaskState::Leased, |_| {})
            .unwrap();
        store
            .transition(task_id, TaskState::Leased, TaskState::Running, |_| {})
            .unwrap();
        store
            .transition(task_id, TaskState::Running, TaskState::Verifying, |_| {})
            .unwrap();
    }

    #[test]
    fn commit_requires_all_required_verifiers_to_pass() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store
            .set_required_verifiers("t1", BTreeSet::from(["lint".to_string(), "tests".to_string()]))
            .unwrap();
        advance_to_verifying(&store, "t1");

        store
            .record_evidence("t1", 0, "lint", VerifierResult::Pass, serde_json::json!({}))
            .unwrap();
        store
            .record_evidence("t1", 0, "tests", VerifierResult::Pass, serde_json::json!({}))
            .unwrap();

        let state = store.resolve_verification("t1").unwrap();
        assert_eq!(state, TaskState::Committed);
    }

    #[test]
    fn any_failing_required_verifier_rolls_back() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store
            .set_required_verifiers("t1", BTreeSet::from(["tests".to_string()]))
            .unwrap();
        advance_to_verifying(&store, "t1");

        store
            .record_evidence("t1", 0, "tests", VerifierResult::Fail, serde_json::json!({}))
            .unwrap();

        let state = store.resolve_verification("t1").unwrap();
        assert_eq!(state, TaskState::Rollback);
    }

    #[test]
    fn evidence_cannot_be_overwritten() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store
            .record_evidence("t1", 0, "lint", VerifierResult::Pass, serde_json::json!({}))
            .unwrap();
        let err = store
            .record_evidence("t1", 0, "lint", VerifierResult::Fail, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, MafError::InvalidArgument(_)));
    }

    #[test]
    fn query_events_orders_recent_first_and_respects_cap() {
        let store = test_store();
        for i in 0..5 {
            store
                .create_task(format!("t{i}"), 0, serde_json::json!({}))
                .unwrap();
        }
        let events = store
            .query_events(&EventQuery {
                recent: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].id > events[1].id);
    }
}
