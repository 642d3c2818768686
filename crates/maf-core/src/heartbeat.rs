//! Heartbeat & Liveness: an upsert-and-refresh shape over a Store-resident
//! `Agent` row rather than per-agent heartbeat files and PID liveness
//! checks — liveness here is "did we hear from this agent recently," not
//! "is this process still running."

use crate::errors::MafResult;
use crate::model::{Agent, AgentStatus, AgentType, Event, EventKind};
use crate::store::Store;
use std::collections::BTreeSet;

impl Store {
    /// Upserts `(agent_id, last_seen=now, status)` and refreshes any
    /// task-lease or file-reservation the agent holds whose expiry falls
    /// inside `heartbeat_window_ms` of now.
    pub fn heartbeat(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        status: AgentStatus,
        heartbeat_window_ms: i64,
    ) -> MafResult<Agent> {
        let now = self.now_ms();
        let agent = self.with_tx(|tx| {
            let mut agent = tx.get_agent(agent_id)?.unwrap_or(Agent {
                id: agent_id.to_string(),
                name: agent_id.to_string(),
                agent_type,
                status,
                last_seen: now,
                capabilities: BTreeSet::new(),
                metadata: serde_json::Value::Null,
            });
            agent.last_seen = agent.last_seen.max(now);
            agent.status = status;
            tx.put_agent(&agent)?;

            for lease in tx.list_leases()? {
                if lease.agent_id != agent_id {
                    continue;
                }
                if lease.lease_expires_at < now + heartbeat_window_ms {
                    let mut refreshed = lease.clone();
                    refreshed.lease_expires_at = now + heartbeat_window_ms;
                    tx.put_lease(&refreshed)?;
                }
            }
            for reservation in tx.list_reservations()? {
                if reservation.agent_id != agent_id
                    || reservation.status != crate::model::ReservationStatus::Active
                {
                    continue;
                }
                if reservation.lease_expires_at < now + heartbeat_window_ms {
                    let mut refreshed = reservation.clone();
                    refreshed.lease_expires_at = now + heartbeat_window_ms;
                    tx.put_reservation(&refreshed)?;
                }
            }
            Ok(agent.clone())
        })?;
        Ok(agent)
    }

    /// Marks agents whose `last_seen` predates `now - liveness_timeout_ms`
    /// inactive, then reclaims their task-leases and file-reservations.
    /// Returns the ids of agents newly marked inactive.
    pub fn liveness_sweep(&self, liveness_timeout_ms: i64) -> MafResult<Vec<String>> {
        let now = self.now_ms();
        let stale_cutoff = now - liveness_timeout_ms;
        let agents = self.with_tx(|tx| tx.list_agents())?;
        let mut newly_inactive = Vec::new();

        for mut agent in agents {
            if agent.status != AgentStatus::Active || agent.last_seen >= stale_cutoff {
                continue;
            }
            agent.status = AgentStatus::Inactive;
            self.with_tx(|tx| {
                tx.put_agent(&agent)?;
                let event_id = tx.next_event_id()?;
                tx.append_event(&Event {
                    id: event_id,
                    task_id: None,
                    ts: now,
                    kind: EventKind::HeartbeatMissed,
                    data: serde_json::json!({ "agent_id": agent.id }),
                })
            })?;
            self.reclaim_expired_task_leases_for_agent(&agent.id, now)?;
            self.reclaim_expired_file_reservations_for_agent(&agent.id, now)?;
            newly_inactive.push(agent.id.clone());
        }
        Ok(newly_inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::clock::Clock;
    use crate::model::TaskState;
    use crate::store::{Backend, Store};
    use std::sync::Arc;

    fn test_store() -> Store {
        let backend = Backend::Memory(crate::store::memory::MemoryStore::new());
        Store::new(backend, Arc::new(FakeClock::new(0))).unwrap()
    }

    #[test]
    fn heartbeat_creates_agent_on_first_call() {
        let store = test_store();
        let agent = store
            .heartbeat("agent-x", AgentType::Worker, AgentStatus::Active, 30_000)
            .unwrap();
        assert_eq!(agent.id, "agent-x");
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[test]
    fn timely_heartbeat_refreshes_held_lease_inside_window() {
        let store = test_store();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store.acquire_task_lease("t1", "agent-x", 1_000).unwrap();

        store
            .heartbeat("agent-x", AgentType::Worker, AgentStatus::Active, 30_000)
            .unwrap();

        let reclaimed = store.reclaim_expired_task_leases(2_000).unwrap();
        assert!(
            reclaimed.is_empty(),
            "heartbeat should have pushed expiry past now"
        );
    }

    #[test]
    fn liveness_sweep_marks_stale_agent_inactive_and_reclaims_its_leases() {
        let clock = Arc::new(FakeClock::new(0));
        let backend = Backend::Memory(crate::store::memory::MemoryStore::new());
        let store = Store::new(backend, clock.clone()).unwrap();

        store
            .heartbeat("agent-x", AgentType::Worker, AgentStatus::Active, 30_000)
            .unwrap();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store.acquire_task_lease("t1", "agent-x", 50_000).unwrap();

        clock.advance_ms(100_000);
        let inactive = store.liveness_sweep(30_000).unwrap();
        assert_eq!(inactive, vec!["agent-x".to_string()]);

        let reclaimed = store.reclaim_expired_task_leases(clock.now_ms()).unwrap();
        assert!(
            reclaimed.is_empty(),
            "liveness_sweep already reclaimed agent-x's expired lease"
        );
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Ready);
    }

    #[test]
    fn liveness_sweep_leaves_unexpired_lease_of_stale_agent_in_place() {
        let clock = Arc::new(FakeClock::new(0));
        let backend = Backend::Memory(crate::store::memory::MemoryStore::new());
        let store = Store::new(backend, clock.clone()).unwrap();

        store
            .heartbeat("agent-x", AgentType::Worker, AgentStatus::Active, 30_000)
            .unwrap();
        store
            .create_task("t1".into(), 0, serde_json::json!({}))
            .unwrap();
        store.acquire_task_lease("t1", "agent-x", 600_000).unwrap();

        clock.advance_ms(100_000);
        let inactive = store.liveness_sweep(30_000).unwrap();
        assert_eq!(inactive, vec!["agent-x".to_string()]);

        assert_eq!(
            store.get_task("t1").unwrap().state,
            TaskState::Leased,
            "a lease with remaining TTL must survive the liveness sweep of its stale agent"
        );
    }
}
