//! In-memory backend, adapted from the teacher's `storage/memory.rs`
//! (`InMemoryStorage`). Tests only — see spec §9's Open Questions: "Legacy
//! file-based and memory backends have different durability guarantees
//! than the durable backend; tests should exercise the durable backend for
//! all invariants and treat the others as best-effort."

use super::{RawStore, RawTx};
use crate::errors::{MafError, MafResult};
use crate::model::{
    Agent, EscalationEnvelope, Event, Evidence, FileReservation, Lease, ReservationConflict, Task,
};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default, Clone)]
struct State {
    tasks: HashMap<String, Task>,
    leases: HashMap<String, Lease>,
    reservations: HashMap<String, FileReservation>,
    agents: HashMap<String, Agent>,
    events: Vec<Event>,
    next_event_id: i64,
    evidence: HashMap<(String, u32, String), Evidence>,
    conflicts: Vec<ReservationConflict>,
    channels: HashMap<String, Vec<EscalationEnvelope>>,
    next_envelope_id: i64,
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Mutex::new(State::default()),
        }
    }
}

impl RawStore for MemoryStore {
    fn init(&self) -> MafResult<()> {
        Ok(())
    }

    fn with_tx<T>(&self, f: impl FnOnce(&mut dyn RawTx) -> MafResult<T>) -> MafResult<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| MafError::Fatal("memory store mutex poisoned".into()))?;
        let before = guard.clone();
        let mut tx = MemoryTx { state: &mut guard };
        match f(&mut tx) {
            Ok(v) => Ok(v),
            Err(e) => {
                *guard = before;
                Err(e)
            }
        }
    }
}

struct MemoryTx<'a> {
    state: &'a mut State,
}

impl RawTx for MemoryTx<'_> {
    fn get_task(&mut self, id: &str) -> MafResult<Option<Task>> {
        Ok(self.state.tasks.get(id).cloned())
    }

    fn put_task(&mut self, task: &Task) -> MafResult<()> {
        self.state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn list_tasks(&mut self) -> MafResult<Vec<Task>> {
        Ok(self.state.tasks.values().cloned().collect())
    }

    fn get_lease(&mut self, task_id: &str) -> MafResult<Option<Lease>> {
        Ok(self.state.leases.get(task_id).cloned())
    }

    fn put_lease(&mut self, lease: &Lease) -> MafResult<()> {
        self.state
            .leases
            .insert(lease.task_id.clone(), lease.clone());
        Ok(())
    }

    fn delete_lease(&mut self, task_id: &str) -> MafResult<()> {
        self.state.leases.remove(task_id);
        Ok(())
    }

    fn list_leases(&mut self) -> MafResult<Vec<Lease>> {
        Ok(self.state.leases.values().cloned().collect())
    }

    fn get_reservation(&mut self, file_path: &str) -> MafResult<Option<FileReservation>> {
        Ok(self.state.reservations.get(file_path).cloned())
    }

    fn put_reservation(&mut self, reservation: &FileReservation) -> MafResult<()> {
        self.state
            .reservations
            .insert(reservation.file_path.clone(), reservation.clone());
        Ok(())
    }

    fn list_reservations(&mut self) -> MafResult<Vec<FileReservation>> {
        Ok(self.state.reservations.values().cloned().collect())
    }

    fn get_agent(&mut self, id: &str) -> MafResult<Option<Agent>> {
        Ok(self.state.agents.get(id).cloned())
    }

    fn put_agent(&mut self, agent: &Agent) -> MafResult<()> {
        self.state.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    fn list_agents(&mut self) -> MafResult<Vec<Agent>> {
        Ok(self.state.agents.values().cloned().collect())
    }

    fn next_event_id(&mut self) -> MafResult<i64> {
        self.state.next_event_id += 1;
        Ok(self.state.next_event_id)
    }

    fn append_event(&mut self, event: &Event) -> MafResult<()> {
        self.state.events.push(event.clone());
        Ok(())
    }

    fn list_events(&mut self) -> MafResult<Vec<Event>> {
        Ok(self.state.events.clone())
    }

    fn put_evidence(&mut self, evidence: &Evidence) -> MafResult<()> {
        let key = (
            evidence.task_id.clone(),
            evidence.attempt,
            evidence.verifier.clone(),
        );
        if self.state.evidence.contains_key(&key) {
            return Err(MafError::InvalidArgument(format!(
                "evidence already recorded for {} attempt {} verifier {}",
                evidence.task_id, evidence.attempt, evidence.verifier
            )));
        }
        self.state.evidence.insert(key, evidence.clone());
        Ok(())
    }

    fn list_evidence(&mut self, task_id: &str, attempt: u32) -> MafResult<Vec<Evidence>> {
        Ok(self
            .state
            .evidence
            .values()
            .filter(|e| e.task_id == task_id && e.attempt == attempt)
            .cloned()
            .collect())
    }

    fn put_conflict(&mut self, conflict: &ReservationConflict) -> MafResult<()> {
        self.state.conflicts.push(conflict.clone());
        Ok(())
    }

    fn list_conflicts(&mut self) -> MafResult<Vec<ReservationConflict>> {
        Ok(self.state.conflicts.clone())
    }

    fn ensure_channel(&mut self, name: &str) -> MafResult<()> {
        self.state.channels.entry(name.to_string()).or_default();
        Ok(())
    }

    fn channel_exists(&mut self, name: &str) -> MafResult<bool> {
        Ok(self.state.channels.contains_key(name))
    }

    fn next_envelope_id(&mut self) -> MafResult<i64> {
        self.state.next_envelope_id += 1;
        Ok(self.state.next_envelope_id)
    }

    fn append_envelope(&mut self, envelope: &EscalationEnvelope) -> MafResult<()> {
        self.state
            .channels
            .entry(envelope.to_channel.clone())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    fn list_envelopes(&mut self, channel: &str) -> MafResult<Vec<EscalationEnvelope>> {
        Ok(self
            .state
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }

    fn mark_envelope_read(&mut self, channel: &str, message_id: i64) -> MafResult<()> {
        if let Some(envelopes) = self.state.channels.get_mut(channel) {
            if let Some(e) = envelopes.iter_mut().find(|e| e.id == message_id) {
                e.read = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_back_on_error() {
        let store = MemoryStore::new();
        let task = Task::new("t1".into(), 0, serde_json::json!({}), 0);
        store
            .with_tx(|tx| {
                tx.put_task(&task)?;
                Err(MafError::InvalidArgument("boom".into()))
            })
            .unwrap_err();

        let found = store.with_tx(|tx| tx.get_task("t1")).unwrap();
        assert!(found.is_none(), "rolled-back write must not be visible");
    }

    #[test]
    fn commits_on_success() {
        let store = MemoryStore::new();
        let task = Task::new("t1".into(), 0, serde_json::json!({}), 0);
        store.with_tx(|tx| tx.put_task(&task)).unwrap();

        let found = store.with_tx(|tx| tx.get_task("t1")).unwrap();
        assert!(found.is_some());
    }
}
