//! Pre-Commit Enforcer (component I). Grounded on the teacher's
//! `gate_execution.rs` check-then-report shape, generalized from gate
//! checks over issue state to file-reservation collision checks over
//! staged paths (§4.I).
//!
//! Resolves the open question from §9: override is evaluated only after
//! the conflict set is computed, so conflicts are still recorded as events
//! even when the override ultimately allows the commit.

use crate::errors::MafResult;
use crate::model::{ConflictSeverity, ConflictStatus, Event, EventKind, ReservationConflict};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct PathConflict {
    pub path: String,
    pub held_by: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Allow { overridden: bool },
    Block { conflicts: Vec<PathConflict> },
}

impl Store {
    /// Checks `staged_paths` against active file-reservations held by
    /// agents other than `caller_agent`. `override_active` models the
    /// configured environment signal from §6.3/§4.I step 6: when set, the
    /// conflict set is still computed and recorded, but the decision is
    /// always `Allow{overridden: true}`.
    pub fn precommit_check(
        &self,
        staged_paths: &[String],
        caller_agent: &str,
        override_active: bool,
    ) -> MafResult<Decision> {
        let now = self.now_ms();
        let mut conflicts = Vec::new();

        for path in staged_paths {
            let Some(reservation) = self.with_tx(|tx| tx.get_reservation(path))? else {
                continue;
            };
            if reservation.status != crate::model::ReservationStatus::Active {
                continue;
            }
            if reservation.agent_id == caller_agent {
                continue;
            }
            if reservation.lease_expires_at <= now {
                // Held but expired: treat as free. Reclamation is §4.F's job.
                continue;
            }
            conflicts.push(PathConflict {
                path: path.clone(),
                held_by: reservation.agent_id.clone(),
                expires_at: reservation.lease_expires_at,
            });
        }

        if !conflicts.is_empty() {
            self.with_tx(|tx| {
                for conflict in &conflicts {
                    let id = self.new_id();
                    tx.put_conflict(&ReservationConflict {
                        id,
                        file_path: conflict.path.clone(),
                        conflicting_agent: caller_agent.to_string(),
                        existing_agent: conflict.held_by.clone(),
                        conflict_type: "precommit_stage".to_string(),
                        severity: ConflictSeverity::Blocking,
                        status: ConflictStatus::Open,
                        detected_at: now,
                        resolved_at: None,
                        resolution_strategy: None,
                        evidence_ref: None,
                    })?;
                    let event_id = tx.next_event_id()?;
                    tx.append_event(&Event {
                        id: event_id,
                        task_id: None,
                        ts: now,
                        kind: EventKind::ReservationConflict,
                        data: serde_json::json!({
                            "file_path": conflict.path,
                            "caller_agent": caller_agent,
                            "held_by": conflict.held_by,
                        }),
                    })?;
                }
                Ok(())
            })?;
        }

        if override_active {
            self.with_tx(|tx| {
                let event_id = tx.next_event_id()?;
                tx.append_event(&Event {
                    id: event_id,
                    task_id: None,
                    ts: now,
                    kind: EventKind::Override,
                    data: serde_json::json!({
                        "caller_agent": caller_agent,
                        "paths": staged_paths,
                    }),
                })
            })?;
            return Ok(Decision::Allow { overridden: true });
        }

        if conflicts.is_empty() {
            Ok(Decision::Allow { overridden: false })
        } else {
            Ok(Decision::Block { conflicts })
        }
    }

    /// Renders a human-readable block summary naming each path, the
    /// holding agent, and the override signal's name (§4.I).
    pub fn describe_block(conflicts: &[PathConflict], override_signal_name: &str) -> String {
        let mut lines = vec![format!(
            "blocked by {} reservation conflict(s); set {} to override",
            conflicts.len(),
            override_signal_name
        )];
        for c in conflicts {
            lines.push(format!(
                "  {} held by {} until {}",
                c.path, c.held_by, c.expires_at
            ));
        }
        lines.join("\n")
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
    fn free_and_self_held_paths_allow() {
        let store = test_store();
        store
            .acquire_file_reservation("b", "agent-z", 600_000, None)
            .unwrap();
        let decision = store
            .precommit_check(&["a".into(), "b".into()], "agent-z", false)
            .unwrap();
        assert!(matches!(decision, Decision::Allow { overridden: false }));
    }

    #[test]
    fn conflicting_path_blocks_and_records_event() {
        let store = test_store();
        store
            .acquire_file_reservation("a", "agent-y", 600_000, None)
            .unwrap();

        let decision = store
            .precommit_check(&["a".into(), "c".into()], "agent-z", false)
            .unwrap();
        match decision {
            Decision::Block { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].path, "a");
                assert_eq!(conflicts[0].held_by, "agent-y");
            }
            other => panic!("expected Block, got {other:?}"),
        }

        let events = store
            .query_events(&crate::journal::EventQuery::default())
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == crate::model::EventKind::ReservationConflict));
    }

    #[test]
    fn expired_reservation_is_treated_as_free() {
        let clock = Arc::new(FakeClock::new(0));
        let backend = Backend::Memory(crate::store::memory::MemoryStore::new());
        let store = Store::new(backend, clock.clone()).unwrap();

        store
            .acquire_file_reservation("a", "agent-y", 1_000, None)
            .unwrap();
        clock.advance_ms(5_000);

        let decision = store
            .precommit_check(&["a".into()], "agent-z", false)
            .unwrap();
        assert!(matches!(decision, Decision::Allow { overridden: false }));
    }

    #[test]
    fn override_allows_despite_conflict_and_records_override_event() {
        let store = test_store();
        store
            .acquire_file_reservation("a", "agent-y", 600_000, None)
            .unwrap();

        let decision = store
            .precommit_check(&["a".into()], "agent-z", true)
            .unwrap();
        assert!(matches!(decision, Decision::Allow { overridden: true }));

        let events = store
            .query_events(&crate::journal::EventQuery::default())
            .unwrap();
        assert!(events.iter().any(|e| e.kind == crate::model::EventKind::Override));
        assert!(events
            .iter()
            .any(|e| e.kind == crate::model::EventKind::ReservationConflict));
    }
}
