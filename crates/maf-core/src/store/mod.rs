//! Storage abstraction layer.
//!
//! One storage trait, three backends named in the runtime's configuration
//! surface: `durable` (rusqlite), `file` (JSON + advisory locks), and
//! `memory` (tests only).
//!
//! Backend selection is a plain tagged enum (`Backend`), not a
//! trait-object class hierarchy — picking a backend is pure data, and the
//! one place that dispatches on it is `Backend`'s own match arms.

pub mod file;
pub mod memory;
pub mod sqlite;

use crate::errors::{MafError, MafResult};
use crate::model::{
    Agent, EscalationEnvelope, Event, Evidence, FileReservation, Lease, ReservationConflict, Task,
};
use std::time::Duration;

/// Low-level per-entity operations available inside a transaction.
///
/// Every method here is a single read or write against one table; the
/// business rules (legality of a transition, uniqueness of an active
/// reservation, commit completeness) live one layer up in `Store`'s
/// component modules (`state_machine`, `lease_manager`, ...), which call
/// several of these in sequence inside one `with_tx` closure.
pub trait RawTx {
    fn get_task(&mut self, id: &str) -> MafResult<Option<Task>>;
    fn put_task(&mut self, task: &Task) -> MafResult<()>;
    fn list_tasks(&mut self) -> MafResult<Vec<Task>>;

    fn get_lease(&mut self, task_id: &str) -> MafResult<Option<Lease>>;
    fn put_lease(&mut self, lease: &Lease) -> MafResult<()>;
    fn delete_lease(&mut self, task_id: &str) -> MafResult<()>;
    fn list_leases(&mut self) -> MafResult<Vec<Lease>>;

    fn get_reservation(&mut self, file_path: &str) -> MafResult<Option<FileReservation>>;
    fn put_reservation(&mut self, reservation: &FileReservation) -> MafResult<()>;
    fn list_reservations(&mut self) -> MafResult<Vec<FileReservation>>;

    fn get_agent(&mut self, id: &str) -> MafResult<Option<Agent>>;
    fn put_agent(&mut self, agent: &Agent) -> MafResult<()>;
    fn list_agents(&mut self) -> MafResult<Vec<Agent>>;

    fn next_event_id(&mut self) -> MafResult<i64>;
    fn append_event(&mut self, event: &Event) -> MafResult<()>;
    fn list_events(&mut self) -> MafResult<Vec<Event>>;

    fn put_evidence(&mut self, evidence: &Evidence) -> MafResult<()>;
    fn list_evidence(&mut self, task_id: &str, attempt: u32) -> MafResult<Vec<Evidence>>;

    fn put_conflict(&mut self, conflict: &ReservationConflict) -> MafResult<()>;
    fn list_conflicts(&mut self) -> MafResult<Vec<ReservationConflict>>;

    fn ensure_channel(&mut self, name: &str) -> MafResult<()>;
    fn channel_exists(&mut self, name: &str) -> MafResult<bool>;
    fn next_envelope_id(&mut self) -> MafResult<i64>;
    fn append_envelope(&mut self, envelope: &EscalationEnvelope) -> MafResult<()>;
    fn list_envelopes(&mut self, channel: &str) -> MafResult<Vec<EscalationEnvelope>>;
    fn mark_envelope_read(&mut self, channel: &str, message_id: i64) -> MafResult<()>;
}

/// A concrete storage backend. Each implementor owns its own durability and
/// concurrency story; `with_tx` is the only way callers touch rows.
pub trait RawStore {
    fn init(&self) -> MafResult<()>;

    /// Run `f` against a fresh transaction handle. On `Ok`, the backend
    /// commits; on `Err`, it rolls back. `Transient` errors are retried with
    /// bounded exponential backoff before being surfaced as `Timeout`.
    fn with_tx<T>(&self, f: impl FnOnce(&mut dyn RawTx) -> MafResult<T>) -> MafResult<T>;
}

/// Retry loop shared by backends whose `with_tx` can hit contention
/// (`SQLITE_BUSY`, a held advisory lock). Bounded exponential backoff;
/// a `Transient` error that outlives every attempt surfaces as `Timeout`.
pub(crate) fn retry_on_transient<T>(
    max_attempts: u32,
    mut attempt: impl FnMut() -> MafResult<T>,
) -> MafResult<T> {
    let mut delay = Duration::from_millis(5);
    let mut last_err = None;
    for _ in 0..max_attempts {
        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() => {
                last_err = Some(e);
                std::thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_millis(200));
            }
            Err(e) => return Err(e),
        }
    }
    match last_err {
        Some(_) => Err(MafError::Timeout),
        None => unreachable!("max_attempts must be >= 1"),
    }
}

/// Selects one of the three backends by configuration. `memory` is for
/// tests only; invariant and property tests exercise the durable backend
/// and treat the other two as best-effort.
pub enum Backend {
    Memory(memory::MemoryStore),
    File(file::FileStore),
    Durable(sqlite::SqliteStore),
}

impl Backend {
    pub fn init(&self) -> MafResult<()> {
        match self {
            Backend::Memory(s) => s.init(),
            Backend::File(s) => s.init(),
            Backend::Durable(s) => s.init(),
        }
    }

    pub fn with_tx<T>(&self, f: impl FnOnce(&mut dyn RawTx) -> MafResult<T>) -> MafResult<T> {
        match self {
            Backend::Memory(s) => s.with_tx(f),
            Backend::File(s) => s.with_tx(f),
            Backend::Durable(s) => s.with_tx(f),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Memory(_) => "memory",
            Backend::File(_) => "file",
            Backend::Durable(_) => "durable",
        }
    }
}

/// The coordination store. Component operations (state machine, lease
/// manager, scheduler, heartbeat, journal, escalation, pre-commit enforcer)
/// are implemented as inherent methods on this type across
/// `state_machine.rs`, `lease_manager.rs`, `scheduler.rs`, `heartbeat.rs`,
/// `journal.rs`, `escalation.rs`, and `precommit.rs`.
pub struct Store {
    pub(crate) backend: Backend,
    pub(crate) clock: std::sync::Arc<dyn crate::clock::Clock>,
}

impl Store {
    pub fn new(backend: Backend, clock: std::sync::Arc<dyn crate::clock::Clock>) -> MafResult<Self> {
        backend.init()?;
        Ok(Store { backend, clock })
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Runs `f` inside a transaction, retrying on `Transient` failures.
    ///
    /// `f` must be re-invocable (`Fn`, not `FnOnce`): a retry gets a fresh
    /// transaction handle and re-derives its result from scratch, so it
    /// must not carry state between attempts. Every component operation in
    /// this crate satisfies that — each one reads what it needs from the
    /// transaction it's handed rather than from closure-captured state.
    pub(crate) fn with_tx<T>(&self, f: impl Fn(&mut dyn RawTx) -> MafResult<T>) -> MafResult<T> {
        retry_on_transient(8, || self.backend.with_tx(&f))
    }

    /// The clock's current time. Public so façade callers (sweepers,
    /// deadline bookkeeping) can read "now" without owning a `Clock`
    /// themselves.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn new_id(&self) -> String {
        self.clock.new_id()
    }
}
