//! File-based backend: one JSON document per table plus an append-only
//! JSONL event log, single-writer via an `fs4` advisory lock. Durability
//! comes from a sequence-numbered append-only log and atomic
//! temp-file+fsync+rename snapshot writes, over the task/lease/
//! reservation/agent/event/evidence/conflict entity model.

use super::{RawStore, RawTx};
use crate::errors::{MafError, MafResult};
use crate::model::{
    Agent, EscalationEnvelope, Event, Evidence, FileReservation, Lease, ReservationConflict, Task,
};
use crate::storage::lock::FileLocker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Default, Serialize, Deserialize, Clone)]
struct Snapshot {
    tasks: HashMap<String, Task>,
    leases: HashMap<String, Lease>,
    reservations: HashMap<String, FileReservation>,
    agents: HashMap<String, Agent>,
    next_event_id: i64,
    evidence: Vec<Evidence>,
    conflicts: Vec<ReservationConflict>,
    channels: HashMap<String, Vec<EscalationEnvelope>>,
    next_envelope_id: i64,
}

pub struct FileStore {
    root: PathBuf,
    locker: FileLocker,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore {
            root: root.into(),
            locker: FileLocker::new(Duration::from_secs(10)),
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot.json")
    }

    fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(".store.lock")
    }

    fn load_snapshot(&self) -> MafResult<Snapshot> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(Snapshot::default());
        }
        let data = fs::read_to_string(&path)
            .map_err(|e| MafError::Fatal(format!("read snapshot: {e}")))?;
        serde_json::from_str(&data).map_err(|e| MafError::Fatal(format!("parse snapshot: {e}")))
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> MafResult<()> {
        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| MafError::Fatal(format!("serialize snapshot: {e}")))?;
        fs::write(&tmp, json).map_err(|e| MafError::Fatal(format!("write snapshot tmp: {e}")))?;
        let f = File::open(&tmp).map_err(|e| MafError::Fatal(format!("open tmp: {e}")))?;
        f.sync_all()
            .map_err(|e| MafError::Fatal(format!("fsync tmp: {e}")))?;
        drop(f);
        fs::rename(&tmp, &path).map_err(|e| MafError::Fatal(format!("rename snapshot: {e}")))?;
        Ok(())
    }

    fn load_events(&self) -> MafResult<Vec<Event>> {
        let path = self.events_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data =
            fs::read_to_string(&path).map_err(|e| MafError::Fatal(format!("read events: {e}")))?;
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| MafError::Fatal(format!("parse event: {e}")))
            })
            .collect()
    }

    fn append_events(&self, new_events: &[Event]) -> MafResult<()> {
        use std::io::Write;
        let path = self.events_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MafError::Fatal(format!("open events log: {e}")))?;
        for event in new_events {
            let line = serde_json::to_string(event)
                .map_err(|e| MafError::Fatal(format!("serialize event: {e}")))?;
            writeln!(file, "{line}").map_err(|e| MafError::Fatal(format!("append event: {e}")))?;
        }
        file.sync_all()
            .map_err(|e| MafError::Fatal(format!("fsync events log: {e}")))?;
        Ok(())
    }
}

impl RawStore for FileStore {
    fn init(&self) -> MafResult<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| MafError::Fatal(format!("create store root: {e}")))?;
        crate::storage::lock_cleanup::cleanup_stale_locks(&self.root)
            .map_err(|e| MafError::Fatal(format!("stale lock cleanup: {e}")))?;
        crate::storage::temp_cleanup::cleanup_orphaned_temp_files(&self.root, 3600)
            .map_err(|e| MafError::Fatal(format!("temp cleanup: {e}")))?;
        Ok(())
    }

    fn with_tx<T>(&self, f: impl FnOnce(&mut dyn RawTx) -> MafResult<T>) -> MafResult<T> {
        let _guard = self
            .locker
            .lock_exclusive_with_metadata(&self.lock_path(), "maf-dispatchd")
            .map_err(|e| MafError::Transient(format!("acquire store lock: {e}")))?;

        let snapshot = self.load_snapshot()?;
        let events = self.load_events()?;
        let mut tx = FileTx {
            snapshot: snapshot.clone(),
            events,
            new_events: Vec::new(),
        };
        let result = f(&mut tx);
        match result {
            Ok(v) => {
                self.write_snapshot(&tx.snapshot)?;
                self.append_events(&tx.new_events)?;
                Ok(v)
            }
            Err(e) => Err(e),
        }
    }
}

struct FileTx {
    snapshot: Snapshot,
    events: Vec<Event>,
    new_events: Vec<Event>,
}

impl RawTx for FileTx {
    fn get_task(&mut self, id: &str) -> MafResult<Option<Task>> {
        Ok(self.snapshot.tasks.get(id).cloned())
    }

    fn put_task(&mut self, task: &Task) -> MafResult<()> {
        self.snapshot.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn list_tasks(&mut self) -> MafResult<Vec<Task>> {
        Ok(self.snapshot.tasks.values().cloned().collect())
    }

    fn get_lease(&mut self, task_id: &str) -> MafResult<Option<Lease>> {
        Ok(self.snapshot.leases.get(task_id).cloned())
    }

    fn put_lease(&mut self, lease: &Lease) -> MafResult<()> {
        self.snapshot
            .leases
            .insert(lease.task_id.clone(), lease.clone());
        Ok(())
    }

    fn delete_lease(&mut self, task_id: &str) -> MafResult<()> {
        self.snapshot.leases.remove(task_id);
        Ok(())
    }

    fn list_leases(&mut self) -> MafResult<Vec<Lease>> {
        Ok(self.snapshot.leases.values().cloned().collect())
    }

    fn get_reservation(&mut self, file_path: &str) -> MafResult<Option<FileReservation>> {
        Ok(self.snapshot.reservations.get(file_path).cloned())
    }

    fn put_reservation(&mut self, reservation: &FileReservation) -> MafResult<()> {
        self.snapshot
            .reservations
            .insert(reservation.file_path.clone(), reservation.clone());
        Ok(())
    }

    fn list_reservations(&mut self) -> MafResult<Vec<FileReservation>> {
        Ok(self.snapshot.reservations.values().cloned().collect())
    }

    fn get_agent(&mut self, id: &str) -> MafResult<Option<Agent>> {
        Ok(self.snapshot.agents.get(id).cloned())
    }

    fn put_agent(&mut self, agent: &Agent) -> MafResult<()> {
        self.snapshot.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    fn list_agents(&mut self) -> MafResult<Vec<Agent>> {
        Ok(self.snapshot.agents.values().cloned().collect())
    }

    fn next_event_id(&mut self) -> MafResult<i64> {
        self.snapshot.next_event_id += 1;
        Ok(self.snapshot.next_event_id)
    }

    fn append_event(&mut self, event: &Event) -> MafResult<()> {
        self.events.push(event.clone());
        self.new_events.push(event.clone());
        Ok(())
    }

    fn list_events(&mut self) -> MafResult<Vec<Event>> {
        Ok(self.events.clone())
    }

    fn put_evidence(&mut self, evidence: &Evidence) -> MafResult<()> {
        let exists = self.snapshot.evidence.iter().any(|e| {
            e.task_id == evidence.task_id
                && e.attempt == evidence.attempt
                && e.verifier == evidence.verifier
        });
        if exists {
            return Err(MafError::InvalidArgument(format!(
                "evidence already recorded for {} attempt {} verifier {}",
                evidence.task_id, evidence.attempt, evidence.verifier
            )));
        }
        self.snapshot.evidence.push(evidence.clone());
        Ok(())
    }

    fn list_evidence(&mut self, task_id: &str, attempt: u32) -> MafResult<Vec<Evidence>> {
        Ok(self
            .snapshot
            .evidence
            .iter()
            .filter(|e| e.task_id == task_id && e.attempt == attempt)
            .cloned()
            .collect())
    }

    fn put_conflict(&mut self, conflict: &ReservationConflict) -> MafResult<()> {
        self.snapshot.conflicts.push(conflict.clone());
        Ok(())
    }

    fn list_conflicts(&mut self) -> MafResult<Vec<ReservationConflict>> {
        Ok(self.snapshot.conflicts.clone())
    }

    fn ensure_channel(&mut self, name: &str) -> MafResult<()> {
        self.snapshot.channels.entry(name.to_string()).or_default();
        Ok(())
    }

    fn channel_exists(&mut self, name: &str) -> MafResult<bool> {
        Ok(self.snapshot.channels.contains_key(name))
    }

    fn next_envelope_id(&mut self) -> MafResult<i64> {
        self.snapshot.next_envelope_id += 1;
        Ok(self.snapshot.next_envelope_id)
    }

    fn append_envelope(&mut self, envelope: &EscalationEnvelope) -> MafResult<()> {
        self.snapshot
            .channels
            .entry(envelope.to_channel.clone())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    fn list_envelopes(&mut self, channel: &str) -> MafResult<Vec<EscalationEnvelope>> {
        Ok(self
            .snapshot
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }

    fn mark_envelope_read(&mut self, channel: &str, message_id: i64) -> MafResult<()> {
        if let Some(envelopes) = self.snapshot.channels.get_mut(channel) {
            if let Some(e) = envelopes.iter_mut().find(|e| e.id == message_id) {
                e.read = true;
            }
        }
        Ok(())
    }
}

#[allow(dead_code)]
fn ensure_dir(path: &Path) -> MafResult<()> {
    fs::create_dir_all(path).map_err(|e| MafError::Fatal(format!("create dir: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_across_with_tx_calls() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init().unwrap();

        let task = Task::new("t1".into(), 0, serde_json::json!({}), 0);
        store.with_tx(|tx| tx.put_task(&task)).unwrap();

        let found = store.with_tx(|tx| tx.get_task("t1")).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn rolls_back_on_error_without_touching_snapshot() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init().unwrap();

        let result: MafResult<()> = store.with_tx(|tx| {
            let task = Task::new("t1".into(), 0, serde_json::json!({}), 0);
            tx.put_task(&task)?;
            Err(MafError::InvalidArgument("boom".into()))
        });
        assert!(result.is_err());

        let found = store.with_tx(|tx| tx.get_task("t1")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn events_are_append_only_across_transactions() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init().unwrap();

        store
            .with_tx(|tx| {
                let id = tx.next_event_id()?;
                tx.append_event(&Event {
                    id,
                    task_id: None,
                    ts: 0,
                    kind: crate::model::EventKind::Created,
                    data: serde_json::json!({}),
                })
            })
            .unwrap();
        store
            .with_tx(|tx| {
                let id = tx.next_event_id()?;
                tx.append_event(&Event {
                    id,
                    task_id: None,
                    ts: 1,
                    kind: crate::model::EventKind::Done,
                    data: serde_json::json!({}),
                })
            })
            .unwrap();

        let events = store.with_tx(|tx| tx.list_events()).unwrap();
        assert_eq!(events.len(), 2);
    }
}
