//! Lease Manager (component D): task-leases and file-reservations share the
//! same acquire/refresh/release/reclaim_expired shape, keyed respectively by
//! `task_id` and `file_path`. Grounded on the teacher's
//! `storage/claim_coordinator.rs` acquire/renew/release/force_evict API,
//! generalized to cover both key spaces instead of only claims.

use crate::errors::{MafError, MafResult};
use crate::model::{Event, EventKind, FileReservation, Lease, ReservationStatus, TaskState};
use crate::store::Store;

impl Store {
    /// Acquires a task-lease and transitions `READY → LEASED`, atomically.
    /// Fails with `LeaseConflict` if an active lease already exists.
    pub fn acquire_task_lease(
        &self,
        task_id: &str,
        agent_id: &str,
        duration_ms: i64,
    ) -> MafResult<Lease> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            let mut task = tx
                .get_task(task_id)?
                .ok_or_else(|| MafError::not_found("task", task_id))?;
            if let Some(existing) = tx.get_lease(task_id)? {
                if existing.lease_expires_at > now {
                    return Err(MafError::LeaseConflict {
                        task_id: task_id.to_string(),
                        holder: existing.agent_id,
                    });
                }
            }
            if task.state != TaskState::Ready {
                return Err(MafError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from: task.state.as_str().to_string(),
                    to: TaskState::Leased.as_str().to_string(),
                });
            }
            let lease = Lease {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                lease_expires_at: now + duration_ms,
                attempt: task.attempts,
            };
            tx.put_lease(&lease)?;
            task.state = TaskState::Leased;
            task.updated_at = now;
            tx.put_task(&task)?;
            let event_id = tx.next_event_id()?;
            tx.append_event(&Event {
                id: event_id,
                task_id: Some(task_id.to_string()),
                ts: now,
                kind: EventKind::Claimed,
                data: serde_json::json!({ "agent_id": agent_id }),
            })?;
            Ok(lease.clone())
        })
    }

    /// Refreshes a held task-lease's expiry. `NotHeldByAgent` if another
    /// agent holds it; `Expired` if it already lapsed.
    pub fn refresh_task_lease(
        &self,
        task_id: &str,
        agent_id: &str,
        new_expiry: i64,
    ) -> MafResult<()> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            let mut lease = tx
                .get_lease(task_id)?
                .ok_or_else(|| MafError::not_found("lease", task_id))?;
            if lease.agent_id != agent_id {
                return Err(MafError::InvalidArgument(format!(
                    "lease on {task_id} not held by {agent_id}"
                )));
            }
            if lease.lease_expires_at < now {
                return Err(MafError::Expired);
            }
            lease.lease_expires_at = new_expiry;
            tx.put_lease(&lease)
        })
    }

    /// Releases a task-lease. Idempotent (P4): a second call by the same
    /// holder, or a call when no lease exists, is a no-op success.
    pub fn release_task_lease(&self, task_id: &str, agent_id: &str) -> MafResult<()> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            let Some(lease) = tx.get_lease(task_id)? else {
                return Ok(());
            };
            if lease.agent_id != agent_id {
                return Err(MafError::InvalidArgument(format!(
                    "lease on {task_id} not held by {agent_id}"
                )));
            }
            tx.delete_lease(task_id)?;
            let mut task = tx
                .get_task(task_id)?
                .ok_or_else(|| MafError::not_found("task", task_id))?;
            if task.state == TaskState::Leased {
                task.state = TaskState::Ready;
                task.attempts += 1;
                task.updated_at = now;
                tx.put_task(&task)?;
                let event_id = tx.next_event_id()?;
                tx.append_event(&Event {
                    id: event_id,
                    task_id: Some(task_id.to_string()),
                    ts: now,
                    kind: EventKind::Released,
                    data: serde_json::json!({ "reason": "released_without_progress" }),
                })?;
            }
            Ok(())
        })
    }

    /// For every task-lease past expiry, reverts the task to `READY`,
    /// increments `attempts`, deletes the lease, and emits `LEASE_EXPIRED`.
    /// Returns the ids of reclaimed tasks (P3).
    pub fn reclaim_expired_task_leases(&self, now: i64) -> MafResult<Vec<String>> {
        self.with_tx(|tx| {
            let mut reclaimed = Vec::new();
            for lease in tx.list_leases()? {
                if lease.lease_expires_at >= now {
                    continue;
                }
                let Some(mut task) = tx.get_task(&lease.task_id)? else {
                    continue;
                };
                if !task.state.holds_lease() {
                    continue;
                }
                tx.delete_lease(&lease.task_id)?;
                task.state = TaskState::Ready;
                task.attempts += 1;
                task.updated_at = now;
                tx.put_task(&task)?;
                let event_id = tx.next_event_id()?;
                tx.append_event(&Event {
                    id: event_id,
                    task_id: Some(lease.task_id.clone()),
                    ts: now,
                    kind: EventKind::LeaseExpired,
                    data: serde_json::json!({ "agent_id": lease.agent_id }),
                })?;
                reclaimed.push(lease.task_id.clone());
            }
            Ok(reclaimed)
        })
    }

    /// Same shape as reclaim_expired_task_leases but scoped to one agent's
    /// leases, for use by the liveness sweep (§4.F).
    pub fn reclaim_expired_task_leases_for_agent(
        &self,
        agent_id: &str,
        now: i64,
    ) -> MafResult<Vec<String>> {
        self.with_tx(|tx| {
            let mut reclaimed = Vec::new();
            for lease in tx.list_leases()? {
                if lease.agent_id != agent_id {
                    continue;
                }
                if lease.lease_expires_at >= now {
                    continue;
                }
                let Some(mut task) = tx.get_task(&lease.task_id)? else {
                    continue;
                };
                if !task.state.holds_lease() {
                    continue;
                }
                tx.delete_lease(&lease.task_id)?;
                task.state = TaskState::Ready;
                task.attempts += 1;
                task.updated_at = now;
                tx.put_task(&task)?;
                let event_id = tx.next_event_id()?;
                tx.append_event(&Event {
                    id: event_id,
                    task_id: Some(lease.task_id.clone()),
                    ts: now,
                    kind: EventKind::LeaseExpired,
                    data: serde_json::json!({ "agent_id": agent_id, "reason": "agent_inactive" }),
                })?;
                reclaimed.push(lease.task_id.clone());
            }
            Ok(reclaimed)
        })
    }

    /// Acquires a file-reservation. Fails with `FileLeased{holder, expires_at}`
    /// if another agent holds an unexpired active reservation on the path.
    pub fn acquire_file_reservation(
        &self,
        file_path: &str,
        agent_id: &str,
        duration_ms: i64,
        lease_reason: Option<String>,
    ) -> MafResult<FileReservation> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            if let Some(existing) = tx.get_reservation(file_path)? {
                let still_active =
                    existing.status == ReservationStatus::Active && existing.lease_expires_at > now;
                if still_active && existing.agent_id != agent_id {
                    return Err(MafError::FileLeased {
                        path: file_path.to_string(),
                        holder: existing.agent_id,
                        expires_at: existing.lease_expires_at,
                    });
                }
            }
            let reservation = FileReservation {
                id: self.new_id(),
                file_path: file_path.to_string(),
                agent_id: agent_id.to_string(),
                lease_expires_at: now + duration_ms,
                status: ReservationStatus::Active,
                lease_reason: lease_reason.clone(),
                metadata: serde_json::Value::Null,
            };
            tx.put_reservation(&reservation)?;
            let event_id = tx.next_event_id()?;
            tx.append_event(&Event {
                id: event_id,
                task_id: None,
                ts: now,
                kind: EventKind::ReservationCreated,
                data: serde_json::json!({ "file_path": file_path, "agent_id": agent_id }),
            })?;
            Ok(reservation.clone())
        })
    }

    pub fn refresh_file_reservation(
        &self,
        file_path: &str,
        agent_id: &str,
        new_expiry: i64,
    ) -> MafResult<()> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            let mut reservation = tx
                .get_reservation(file_path)?
                .ok_or_else(|| MafError::not_found("file_reservation", file_path))?;
            if reservation.agent_id != agent_id {
                return Err(MafError::InvalidArgument(format!(
                    "reservation on {file_path} not held by {agent_id}"
                )));
            }
            if reservation.lease_expires_at < now {
                return Err(MafError::Expired);
            }
            reservation.lease_expires_at = new_expiry;
            tx.put_reservation(&reservation)
        })
    }

    /// Releases a file-reservation. Only the holder may release (§4.D);
    /// the override path in `precommit.rs` does not call this — it records
    /// an audit event and proceeds, it never force-releases another agent's
    /// reservation.
    pub fn release_file_reservation(&self, file_path: &str, agent_id: &str) -> MafResult<()> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            let Some(mut reservation) = tx.get_reservation(file_path)? else {
                return Ok(());
            };
            if reservation.status != ReservationStatus::Active {
                return Ok(());
            }
            if reservation.agent_id != agent_id {
                return Err(MafError::InvalidArgument(format!(
                    "reservation on {file_path} not held by {agent_id}"
                )));
            }
            reservation.status = ReservationStatus::Released;
            tx.put_reservation(&reservation)?;
            let event_id = tx.next_event_id()?;
            tx.append_event(&Event {
                id: event_id,
                task_id: None,
                ts: now,
                kind: EventKind::ReservationReleased,
                data: serde_json::json!({ "file_path": file_path, "agent_id": agent_id }),
            })?;
            Ok(())
        })
    }

    pub fn reclaim_expired_file_reservations(&self, now: i64) -> MafResult<Vec<String>> {
        self.with_tx(|tx| {
            let mut reclaimed = Vec::new();
            for mut reservation in tx.list_reservations()? {
                if reservation.status != ReservationStatus::Active {
                    continue;
                }
                if reservation.lease_expires_at >= now {
                    continue;
                }
                reservation.status = ReservationStatus::Expired;
                let path = reservation.file_path.clone();
                tx.put_reservation(&reservation)?;
                reclaimed.push(path);
            }
            Ok(reclaimed)
        })
    }

    pub fn reclaim_expired_file_reservations_for_agent(
        &self,
        agent_id: &str,
        now: i64,
    ) -> MafResult<Vec<String>> {
        self.with_tx(|tx| {
            let mut reclaimed = Vec::new();
            for mut reservation in tx.list_reservations()? {
                if reservation.agent_id != agent_id || reservation.status != ReservationStatus::Active
                {
                    continue;
                }
                if reservation.lease_expires_at >= now {
                    continue;
                }
                reservation.status = ReservationStatus::Expired;
                let path = reservation.file_path.clone();
                tx.put_reservation(&reservation)?;
                reclaimed.push(path);
            }
            Ok(reclaimed)
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
        Store::new(backend, Arc::new(FakeClock::new(1_000))).unwrap()
    }

    #[test]
    fn acquire_lease_transitions_task_to_leased() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        let lease = store.acquire_task_lease("t1", "agent-x", 5_000).unwrap();
        assert_eq!(lease.agent_id, "agent-x");
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Leased);
    }

    #[test]
    fn second_acquire_conflicts_while_first_is_active() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store.acquire_task_lease("t1", "agent-x", 5_000).unwrap();
        let err = store.acquire_task_lease("t1", "agent-y", 5_000).unwrap_err();
        assert!(matches!(err, MafError::LeaseConflict { .. }));
    }

    #[test]
    fn release_is_idempotent() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store.acquire_task_lease("t1", "agent-x", 5_000).unwrap();
        store.release_task_lease("t1", "agent-x").unwrap();
        store.release_task_lease("t1", "agent-x").unwrap();
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Ready);
        assert_eq!(store.get_task("t1").unwrap().attempts, 1);
    }

    #[test]
    fn expired_lease_is_reclaimed_to_ready_with_incremented_attempts() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store.acquire_task_lease("t1", "agent-x", 1_000).unwrap();

        let reclaimed = store.reclaim_expired_task_leases(3_000).unwrap();
        assert_eq!(reclaimed, vec!["t1".to_string()]);
        let task = store.get_task("t1").unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn second_file_reservation_conflicts_with_holder_and_expiry() {
        let store = test_store();
        store
            .acquire_file_reservation("a", "agent-y", 600_000, None)
            .unwrap();
        let err = store
            .acquire_file_reservation("a", "agent-x", 600_000, None)
            .unwrap_err();
        match err {
            MafError::FileLeased { holder, .. } => assert_eq!(holder, "agent-y"),
            other => panic!("expected FileLeased, got {other:?}"),
        }
    }

    #[test]
    fn reacquiring_own_reservation_succeeds() {
        let store = test_store();
        store
            .acquire_file_reservation("a", "agent-x", 600_000, None)
            .unwrap();
        store
            .acquire_file_reservation("a", "agent-x", 600_000, None)
            .unwrap();
    }
}
