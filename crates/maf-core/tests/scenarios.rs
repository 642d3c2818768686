//! Concrete scenarios seeded by spec.md §8, run against the durable
//! (SQLite, in-memory) backend per its own guidance to exercise that
//! backend for invariants and treat `file`/`memory` as best-effort.

use maf_core::clock::test_support::FakeClock;
use maf_core::model::{EventKind, TaskState, VerifierResult};
use maf_core::precommit::Decision;
use maf_core::scheduler::{ClaimFilters, ClaimOutcome};
use maf_core::state_machine::TaskFilter;
use maf_core::store::sqlite::SqliteStore;
use maf_core::store::Backend;
use maf_core::{EventQuery, Store};
use std::sync::Arc;

fn durable_store(clock: Arc<FakeClock>) -> Store {
    let backend = Backend::Durable(SqliteStore::open_in_memory().unwrap());
    Store::new(backend, clock).unwrap()
}

/// Scenario 1: happy path claim acquires both declared files with no
/// conflicts.
#[test]
fn scenario_1_happy_path() {
    let store = durable_store(Arc::new(FakeClock::new(0)));
    store
        .create_task("t1".into(), 100, serde_json::json!({"files": ["a", "b"]}))
        .unwrap();
    store.set_declared_files("t1", vec!["a".into(), "b".into()]).unwrap();

    let outcome = store
        .claim_next("agent-x", &ClaimFilters::default(), 600_000, false)
        .unwrap();
    match outcome {
        ClaimOutcome::Claimed {
            task,
            acquired_files,
            conflicted_files,
        } => {
            assert_eq!(task.id, "t1");
            assert_eq!(acquired_files, vec!["a".to_string(), "b".to_string()]);
            assert!(conflicted_files.is_empty());
        }
        ClaimOutcome::NoneAvailable { .. } => panic!("expected a claim"),
    }

    let events = store.query_events(&EventQuery::default()).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::Claimed));
}

/// Scenario 2: a file conflict on one declared path still lets the task be
/// claimed, reporting the conflicted path rather than failing the claim.
#[test]
fn scenario_2_file_conflict_partial_claim() {
    let store = durable_store(Arc::new(FakeClock::new(0)));
    store.acquire_file_reservation("a", "agent-y", 600_000, None).unwrap();

    store
        .create_task("t1".into(), 100, serde_json::json!({}))
        .unwrap();
    store.set_declared_files("t1", vec!["a".into(), "b".into()]).unwrap();

    let outcome = store
        .claim_next("agent-x", &ClaimFilters::default(), 600_000, false)
        .unwrap();
    match outcome {
        ClaimOutcome::Claimed {
            acquired_files,
            conflicted_files,
            ..
        } => {
            assert_eq!(acquired_files, vec!["b".to_string()]);
            assert_eq!(conflicted_files.len(), 1);
            assert_eq!(conflicted_files[0].path, "a");
            assert_eq!(conflicted_files[0].holder, "agent-y");
        }
        ClaimOutcome::NoneAvailable { .. } => panic!("expected a claim"),
    }
}

/// Scenario 3: pre-commit blocks on a held path, records the conflict
/// event, and leaves the free path out of the block.
#[test]
fn scenario_3_precommit_block_records_conflict_event() {
    let store = durable_store(Arc::new(FakeClock::new(0)));
    store.acquire_file_reservation("a", "agent-y", 600_000, None).unwrap();

    let decision = store
        .precommit_check(&["a".into(), "c".into()], "agent-z", false)
        .unwrap();
    match decision {
        Decision::Block { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].path, "a");
            assert_eq!(conflicts[0].held_by, "agent-y");
        }
        Decision::Allow { .. } => panic!("expected a block"),
    }

    let events = store.query_events(&EventQuery::default()).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::ReservationConflict));
}

/// Scenario 4: an unrefreshed lease expires and one sweep returns the task
/// to READY with attempts incremented and a LEASE_EXPIRED event.
#[test]
fn scenario_4_lease_expiry_reclamation() {
    let clock = Arc::new(FakeClock::new(0));
    let store = durable_store(clock.clone());
    store.create_task("t1".into(), 100, serde_json::json!({})).unwrap();

    store.claim_next("agent-x", &ClaimFilters::default(), 1_000, false).unwrap();
    clock.advance_ms(1_500);

    let reclaimed = store.reclaim_expired_task_leases(store.now_ms()).unwrap();
    assert_eq!(reclaimed, vec!["t1".to_string()]);

    let task = store.get_task("t1").unwrap();
    assert_eq!(task.state, TaskState::Ready);
    assert_eq!(task.attempts, 1);

    let events = store.query_events(&EventQuery::default()).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::LeaseExpired));
}

/// Scenario 5: after max_attempts failed verifications, the task is DEAD
/// and no longer claimable. Uses the default `max_attempts` of 3 (there is
/// no public setter for it — tasks are created with the store's default,
/// matching spec.md §3's `Task.new` shape).
#[test]
fn scenario_5_retry_then_dead() {
    let store = durable_store(Arc::new(FakeClock::new(0)));
    store.create_task("t2".into(), 100, serde_json::json!({})).unwrap();
    store
        .set_required_verifiers("t2", std::collections::BTreeSet::from(["tests".to_string()]))
        .unwrap();

    let max_attempts = store.get_task("t2").unwrap().max_attempts;
    for _ in 0..max_attempts {
        store.claim_next("agent-x", &ClaimFilters::default(), 600_000, false).unwrap();
        store
            .transition("t2", TaskState::Leased, TaskState::Running, |_| {})
            .unwrap();
        store
            .transition("t2", TaskState::Running, TaskState::Verifying, |_| {})
            .unwrap();
        let task = store.get_task("t2").unwrap();
        store
            .record_evidence("t2", task.attempts, "tests", VerifierResult::Fail, serde_json::json!({}))
            .unwrap();
        let state = store.resolve_verification("t2").unwrap();
        assert_eq!(state, TaskState::Rollback);

        let task = store.get_task("t2").unwrap();
        if task.attempts >= task.max_attempts {
            store
                .transition("t2", TaskState::Rollback, TaskState::Dead, |_| {})
                .unwrap();
        } else {
            store
                .transition("t2", TaskState::Rollback, TaskState::Ready, |t| t.attempts += 1)
                .unwrap();
        }
    }

    let task = store.get_task("t2").unwrap();
    assert_eq!(task.state, TaskState::Dead);

    let outcome = store.claim_next("agent-y", &ClaimFilters::default(), 600_000, false).unwrap();
    assert!(matches!(outcome, ClaimOutcome::NoneAvailable { .. }));
}

/// Scenario 6: with the override active, a conflicting pre-commit still
/// allows, and both the conflict and the override are recorded as events.
#[test]
fn scenario_6_override_allows_and_records_both_events() {
    let store = durable_store(Arc::new(FakeClock::new(0)));
    store.acquire_file_reservation("a", "agent-y", 600_000, None).unwrap();

    let decision = store.precommit_check(&["a".into()], "agent-z", true).unwrap();
    assert!(matches!(decision, Decision::Allow { overridden: true }));

    let events = store.query_events(&EventQuery::default()).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::Override));
    assert!(events.iter().any(|e| e.kind == EventKind::ReservationConflict));
}

#[test]
fn list_tasks_respects_state_filter() {
    let store = durable_store(Arc::new(FakeClock::new(0)));
    store.create_task("t1".into(), 1, serde_json::json!({})).unwrap();
    store.create_task("t2".into(), 2, serde_json::json!({})).unwrap();
    store.claim_next("agent-x", &ClaimFilters::default(), 600_000, false).unwrap();

    let ready = store
        .list_tasks(&TaskFilter {
            states: Some(vec![TaskState::Ready]),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "t2");
}
