//! Scheduler / Claim Engine: the hot path a worker uses to obtain a task
//! and its file leases in one call. Candidate scan, then first-success
//! lease acquire, matching an "optimistic eager leasing" strategy: grab
//! whatever declared files are free rather than failing the whole claim
//! over one contended path.

use crate::errors::MafResult;
use crate::model::{Task, TaskState};
use crate::state_machine::TaskFilter;
use crate::store::Store;

/// Label/constraint matching against a task's opaque payload: every key in
/// `filters` must be present in `payload` with an equal value. An empty
/// filter set matches every task.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilters {
    pub required_fields: Vec<(String, serde_json::Value)>,
}

impl ClaimFilters {
    fn matches(&self, task: &Task) -> bool {
        self.required_fields.iter().all(|(key, value)| {
            task.payload.get(key).map(|v| v == value).unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConflictedFile {
    pub path: String,
    pub holder: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed {
        task: Task,
        acquired_files: Vec<String>,
        conflicted_files: Vec<ConflictedFile>,
    },
    NoneAvailable {
        ready_preview: Vec<Task>,
    },
}

const READY_PREVIEW_LIMIT: usize = 20;

impl Store {
    /// Scans, filters, and sorts candidates, then leases the first one it
    /// can. `dry_run` stops after scanning and returns
    /// `NoneAvailable{ready_preview}` without acquiring anything.
    pub fn claim_next(
        &self,
        agent_id: &str,
        filters: &ClaimFilters,
        lease_duration_ms: i64,
        dry_run: bool,
    ) -> MafResult<ClaimOutcome> {
        let candidates = self.list_tasks(&TaskFilter {
            states: Some(vec![TaskState::Ready]),
            ..Default::default()
        })?;
        let mut candidates: Vec<Task> = candidates
            .into_iter()
            .filter(|t| filters.matches(t))
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        if dry_run {
            candidates.truncate(READY_PREVIEW_LIMIT);
            return Ok(ClaimOutcome::NoneAvailable {
                ready_preview: candidates,
            });
        }

        for candidate in &candidates {
            match self.acquire_task_lease(&candidate.id, agent_id, lease_duration_ms) {
                Ok(_lease) => {
                    let task = self.get_task(&candidate.id)?;

                    let mut acquired = Vec::new();
                    let mut conflicted = Vec::new();
                    for path in &candidate.declared_files {
                        match self.acquire_file_reservation(path, agent_id, lease_duration_ms, None)
                        {
                            Ok(_) => acquired.push(path.clone()),
                            Err(crate::errors::MafError::FileLeased { holder, expires_at, .. }) => {
                                conflicted.push(ConflictedFile {
                                    path: path.clone(),
                                    holder,
                                    expires_at,
                                });
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    return Ok(ClaimOutcome::Claimed {
                        task,
                        acquired_files: acquired,
                        conflicted_files: conflicted,
                    });
                }
                Err(crate::errors::MafError::LeaseConflict { .. })
                | Err(crate::errors::MafError::IllegalTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        let mut preview = candidates;
        preview.truncate(READY_PREVIEW_LIMIT);
        Ok(ClaimOutcome::NoneAvailable {
            ready_preview: preview,
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
    fn happy_path_claims_and_acquires_all_declared_files() {
        let store = test_store();
        store
            .create_task("t1".into(), 100, serde_json::json!({"files": ["a", "b"]}))
            .unwrap();
        store
            .set_declared_files("t1", vec!["a".into(), "b".into()])
            .unwrap();

        let outcome = store
            .claim_next("agent-x", &ClaimFilters::default(), 60_000, false)
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
            other => panic!("expected Claimed, got {other:?}"),
        }
    }

    #[test]
    fn file_conflict_still_claims_task_with_partial_files() {
        let store = test_store();
        store
            .acquire_file_reservation("a", "agent-y", 600_000, None)
            .unwrap();
        store
            .create_task("t1".into(), 100, serde_json::json!({}))
            .unwrap();
        store
            .set_declared_files("t1", vec!["a".into(), "b".into()])
            .unwrap();

        let outcome = store
            .claim_next("agent-x", &ClaimFilters::default(), 60_000, false)
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
            other => panic!("expected Claimed, got {other:?}"),
        }
    }

    #[test]
    fn no_ready_tasks_returns_none_available() {
        let store = test_store();
        let outcome = store
            .claim_next("agent-x", &ClaimFilters::default(), 60_000, false)
            .unwrap();
        assert!(matches!(outcome, ClaimOutcome::NoneAvailable { .. }));
    }

    #[test]
    fn dry_run_does_not_acquire_anything() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();

        let outcome = store
            .claim_next("agent-x", &ClaimFilters::default(), 60_000, true)
            .unwrap();
        match outcome {
            ClaimOutcome::NoneAvailable { ready_preview } => assert_eq!(ready_preview.len(), 1),
            other => panic!("expected NoneAvailable preview, got {other:?}"),
        }
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Ready);
    }

    #[test]
    fn filters_skip_non_matching_tasks() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({"lang": "rust"}))
            .unwrap();
        store
            .create_task("t2".into(), 1, serde_json::json!({"lang": "go"}))
            .unwrap();

        let filters = ClaimFilters {
            required_fields: vec![("lang".into(), serde_json::json!("go"))],
        };
        let outcome = store
            .claim_next("agent-x", &filters, 60_000, false)
            .unwrap();
        match outcome {
            ClaimOutcome::Claimed { task, .. } => assert_eq!(task.id, "t2"),
            other => panic!("expected Claimed t2, got {other:?}"),
        }
    }
}
