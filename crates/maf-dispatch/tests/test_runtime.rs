//! In-process integration tests for the runtime façade, replacing the
//! teacher's subprocess-based dispatch tests: these drive `Runtime`
//! directly against a `memory` backend instead of shelling out to a binary.

use maf_core::model::{AgentStatus, AgentType, EnvelopeKind, VerifierResult};
use maf_core::scheduler::{ClaimFilters, ClaimOutcome};
use maf_core::state_machine::TaskFilter;
use maf_core::RuntimeConfig;
use maf_dispatch::Runtime;

fn memory_runtime() -> Runtime {
    let config = RuntimeConfig {
        backend_fallback: vec!["memory".to_string()],
        ..RuntimeConfig::default()
    };
    Runtime::bootstrap(config).unwrap()
}

#[test]
fn claims_highest_priority_ready_task_first() {
    let runtime = memory_runtime();
    runtime.create_task("low".into(), 50, serde_json::json!({}), None).unwrap();
    runtime.create_task("high".into(), 1, serde_json::json!({}), None).unwrap();

    let outcome = runtime
        .claim_next("agent-1", &ClaimFilters::default(), false, None)
        .unwrap();
    match outcome {
        ClaimOutcome::Claimed { task, .. } => assert_eq!(task.id, "high"),
        ClaimOutcome::NoneAvailable { .. } => panic!("expected a claim"),
    }
}

#[test]
fn dry_run_claim_leaves_task_ready() {
    let runtime = memory_runtime();
    runtime.create_task("t-1".into(), 10, serde_json::json!({}), None).unwrap();

    runtime
        .claim_next("agent-1", &ClaimFilters::default(), true, None)
        .unwrap();

    let tasks = runtime
        .list_tasks(
            &TaskFilter {
                states: Some(vec![maf_core::model::TaskState::Ready]),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[test]
fn no_ready_tasks_returns_empty_preview() {
    let runtime = memory_runtime();
    let outcome = runtime
        .claim_next("agent-1", &ClaimFilters::default(), false, None)
        .unwrap();
    match outcome {
        ClaimOutcome::NoneAvailable { ready_preview } => assert!(ready_preview.is_empty()),
        ClaimOutcome::Claimed { .. } => panic!("expected no claim"),
    }
}

#[test]
fn release_then_reclaim_returns_task_to_ready() {
    let runtime = memory_runtime();
    runtime.create_task("t-1".into(), 10, serde_json::json!({}), None).unwrap();
    runtime
        .claim_next("agent-1", &ClaimFilters::default(), false, None)
        .unwrap();

    runtime.release_task("t-1", "agent-1", None).unwrap();

    let task = runtime.get_task("t-1", None).unwrap();
    assert_eq!(task.state, maf_core::model::TaskState::Ready);
}

#[test]
fn heartbeat_then_escalation_round_trip() {
    let runtime = memory_runtime();
    runtime
        .heartbeat("agent-1", AgentType::Worker, AgentStatus::Active, None)
        .unwrap();

    let id = runtime
        .send_escalation(
            maf_core::CHANNEL_AGENT_MAIL,
            EnvelopeKind::EscalationRequest,
            "agent-1",
            serde_json::json!({"note": "blocked"}),
            None,
        )
        .unwrap();

    let fetched = runtime
        .fetch_escalations(maf_core::CHANNEL_AGENT_MAIL, None, None, None)
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, id);

    runtime
        .mark_escalation_read(maf_core::CHANNEL_AGENT_MAIL, id, None)
        .unwrap();
    let fetched = runtime
        .fetch_escalations(maf_core::CHANNEL_AGENT_MAIL, None, None, None)
        .unwrap();
    assert!(fetched.is_empty());
}

#[test]
fn failing_verification_rolls_back_instead_of_committing() {
    let runtime = memory_runtime();
    runtime.create_task("t-1".into(), 10, serde_json::json!({}), None).unwrap();
    runtime
        .store()
        .set_required_verifiers("t-1", std::collections::BTreeSet::from(["tests".to_string()]))
        .unwrap();

    runtime
        .claim_next("agent-1", &ClaimFilters::default(), false, None)
        .unwrap();
    runtime
        .store()
        .transition("t-1", maf_core::model::TaskState::Leased, maf_core::model::TaskState::Running, |_| {})
        .unwrap();
    runtime
        .store()
        .transition("t-1", maf_core::model::TaskState::Running, maf_core::model::TaskState::Verifying, |_| {})
        .unwrap();

    runtime
        .record_evidence("t-1", 0, "tests", VerifierResult::Fail, serde_json::json!({}), None)
        .unwrap();

    let state = runtime.resolve_verification("t-1", None).unwrap();
    assert_eq!(state, maf_core::model::TaskState::Rollback);
}
