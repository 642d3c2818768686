//! Runtime Façade (component J): the in-process wrapper around
//! `maf_core::Store` that `maf-dispatchd` and `maf-cli` both embed.
//!
//! Grounded on the teacher's `jit-dispatch::Orchestrator`, which polled an
//! external `jit` binary via `Command::new` for ready issues and shelled out
//! again to assign them. That subprocess-per-call shape is flagged for
//! re-architecture: `maf-core` is a library, not a CLI, so `Runtime` holds
//! a `Store` directly and every façade method is a plain function call.
//! What survives from the teacher is the *loop* shape — `AgentTracker`'s
//! periodic re-poll becomes the two background sweepers spawned by
//! `Runtime::spawn_sweepers`, and `Config::from_file` becomes
//! `RuntimeConfig::from_file` plus env overrides, loaded once at startup.

use maf_core::clock::SystemClock;
use maf_core::errors::{MafError, MafResult};
use maf_core::model::{Agent, AgentStatus, AgentType, EnvelopeKind, EscalationEnvelope, Event, Task, VerifierResult};
use maf_core::precommit::Decision;
use maf_core::scheduler::{ClaimFilters, ClaimOutcome};
use maf_core::state_machine::TaskFilter;
use maf_core::store::{file::FileStore, memory::MemoryStore, sqlite::SqliteStore, Backend};
use maf_core::{EventQuery, RuntimeConfig, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A per-call deadline. Operations that loop internally (sweeps, retries)
/// check `remaining()` rather than looping unbounded.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Deadline {
            at: Instant::now() + duration,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Builds a `Backend` by trying `config.backend_fallback` in order, logging
/// each failure before moving to the next. The first that opens wins;
/// exhausting the list is fatal, since the façade has nothing left to run
/// against.
fn open_backend(config: &RuntimeConfig) -> anyhow::Result<Backend> {
    let mut last_err = None;
    for name in &config.backend_fallback {
        let attempt = match name.as_str() {
            "durable" => SqliteStore::open(config.store_path.join("maf.sqlite3"))
                .map(Backend::Durable)
                .map_err(anyhow::Error::from),
            "file" => Ok(Backend::File(FileStore::new(config.store_path.clone()))),
            "memory" => Ok(Backend::Memory(MemoryStore::new())),
            other => Err(anyhow::anyhow!("unknown backend {other:?}")),
        };
        match attempt {
            Ok(backend) => {
                info!(backend = name.as_str(), "opened storage backend");
                return Ok(backend);
            }
            Err(e) => {
                warn!(backend = name.as_str(), error = %e, "backend unavailable, falling back");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("backend_fallback is empty")))
}

/// The runtime façade. Wraps a `Store` behind an `Arc` so the background
/// sweepers and request-handling callers share one instance without each
/// needing their own lifetime.
pub struct Runtime {
    store: Arc<Store>,
    config: RuntimeConfig,
    /// Set once a `Fatal` store error is observed (§7: "the façade becomes
    /// read-only, and sweepers halt. Restart is required."). Every
    /// mutating façade method checks this before touching the store.
    poisoned: Arc<AtomicBool>,
}

impl Runtime {
    /// Opens the configured backend (with fallback) and bootstraps the
    /// channels that must exist at startup (§6.2).
    pub fn bootstrap(config: RuntimeConfig) -> anyhow::Result<Self> {
        let backend = open_backend(&config)?;
        let store = Store::new(backend, Arc::new(SystemClock))?;
        store.bootstrap_channels(&config.debug_channel, &config.review_channel)?;
        Ok(Runtime {
            store: Arc::new(store),
            config,
            poisoned: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// `true` once a `Fatal` error has poisoned the façade; callers should
    /// stop issuing writes and the process should be restarted.
    pub fn is_read_only(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Checks `deadline`, if any, before an operation touches the store
    /// (§5: "If the deadline passes while awaiting a store lock, the
    /// operation fails with `Timeout`").
    fn check_deadline(deadline: Option<Deadline>) -> MafResult<()> {
        if let Some(d) = deadline {
            if d.is_expired() {
                return Err(MafError::Timeout);
            }
        }
        Ok(())
    }

    fn guard(&self, deadline: Option<Deadline>) -> MafResult<()> {
        Self::check_deadline(deadline)?;
        if self.is_read_only() {
            return Err(MafError::Fatal(
                "runtime is read-only after a prior fatal store error".to_string(),
            ));
        }
        Ok(())
    }

    /// Runs `op`, and if it surfaces `Fatal`, latches the façade read-only
    /// and logs a critical event before propagating the error unchanged.
    /// Checks `deadline` up front so a caller whose deadline has already
    /// passed never starts a store transaction (§5 / §4.J).
    fn guarded<T>(&self, deadline: Option<Deadline>, op: impl FnOnce() -> MafResult<T>) -> MafResult<T> {
        self.guard(deadline)?;
        let result = op();
        if let Err(MafError::Fatal(msg)) = &result {
            if !self.poisoned.swap(true, Ordering::SeqCst) {
                error!(error = %msg, "fatal store error; runtime is now read-only, restart required");
            }
        }
        result
    }

    // ---- Task lifecycle ----

    pub fn create_task(
        &self,
        id: String,
        priority: i64,
        payload: serde_json::Value,
        deadline: Option<Deadline>,
    ) -> MafResult<String> {
        self.guarded(deadline, || self.store.create_task(id, priority, payload))
    }

    pub fn get_task(&self, task_id: &str, deadline: Option<Deadline>) -> MafResult<Task> {
        Self::check_deadline(deadline)?;
        self.store.get_task(task_id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter, deadline: Option<Deadline>) -> MafResult<Vec<Task>> {
        Self::check_deadline(deadline)?;
        self.store.list_tasks(filter)
    }

    // ---- Claim scheduler ----

    pub fn claim_next(
        &self,
        agent_id: &str,
        filters: &ClaimFilters,
        dry_run: bool,
        deadline: Option<Deadline>,
    ) -> MafResult<ClaimOutcome> {
        let lease_ms = (self.config.default_lease_secs * 1000) as i64;
        self.guarded(deadline, || self.store.claim_next(agent_id, filters, lease_ms, dry_run))
    }

    pub fn release_task(&self, task_id: &str, agent_id: &str, deadline: Option<Deadline>) -> MafResult<()> {
        self.guarded(deadline, || self.store.release_task_lease(task_id, agent_id))
    }

    pub fn refresh_task_lease(
        &self,
        task_id: &str,
        agent_id: &str,
        extra_ms: i64,
        deadline: Option<Deadline>,
    ) -> MafResult<()> {
        self.guarded(deadline, || {
            let new_expiry = self.store.now_ms() + extra_ms;
            self.store.refresh_task_lease(task_id, agent_id, new_expiry)
        })
    }

    // ---- Verification and evidence ----

    pub fn record_evidence(
        &self,
        task_id: &str,
        attempt: u32,
        verifier: &str,
        result: VerifierResult,
        details: serde_json::Value,
        deadline: Option<Deadline>,
    ) -> MafResult<()> {
        self.guarded(deadline, || {
            self.store
                .record_evidence(task_id, attempt, verifier, result, details)
        })
    }

    pub fn resolve_verification(
        &self,
        task_id: &str,
        deadline: Option<Deadline>,
    ) -> MafResult<maf_core::model::TaskState> {
        self.guarded(deadline, || self.store.resolve_verification(task_id))
    }

    pub fn query_events(&self, query: &EventQuery, deadline: Option<Deadline>) -> MafResult<Vec<Event>> {
        Self::check_deadline(deadline)?;
        self.store.query_events(query)
    }

    // ---- Heartbeat & liveness ----

    pub fn heartbeat(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        status: AgentStatus,
        deadline: Option<Deadline>,
    ) -> MafResult<Agent> {
        let window_ms = (self.config.heartbeat_interval_secs * 1000 * 2) as i64;
        self.guarded(deadline, || self.store.heartbeat(agent_id, agent_type, status, window_ms))
    }

    // ---- Pre-commit enforcer ----

    pub fn precommit_check(
        &self,
        staged_paths: &[String],
        caller_agent: &str,
        deadline: Option<Deadline>,
    ) -> MafResult<Decision> {
        self.guarded(deadline, || {
            self.store
                .precommit_check(staged_paths, caller_agent, self.config.override_active())
        })
    }

    // ---- Escalation channel ----

    pub fn send_escalation(
        &self,
        channel: &str,
        kind: EnvelopeKind,
        from_agent: &str,
        payload: serde_json::Value,
        deadline: Option<Deadline>,
    ) -> MafResult<i64> {
        self.guarded(deadline, || self.store.send_escalation(channel, kind, from_agent, payload))
    }

    pub fn fetch_escalations(
        &self,
        channel: &str,
        since_id: Option<i64>,
        limit: Option<usize>,
        deadline: Option<Deadline>,
    ) -> MafResult<Vec<EscalationEnvelope>> {
        Self::check_deadline(deadline)?;
        self.store.fetch_escalations(channel, since_id, limit)
    }

    pub fn mark_escalation_read(
        &self,
        channel: &str,
        message_id: i64,
        deadline: Option<Deadline>,
    ) -> MafResult<()> {
        self.guarded(deadline, || self.store.mark_escalation_read(channel, message_id))
    }

    /// Spawns the two background sweepers: `lease_sweep` reclaims expired
    /// task-leases and file-reservations; `liveness_sweep` marks stale
    /// agents inactive and reclaims their holdings. A failed tick logs and
    /// waits for the next one, matching the teacher's dispatch loop, which
    /// kept polling across individual `jit` invocation errors rather than
    /// exiting — *unless* the tick surfaced `Fatal`, in which case the
    /// façade is already latched read-only (§7) and the sweeper halts for
    /// good rather than keep ticking against a store that won't recover.
    pub fn spawn_sweepers(self: &Arc<Self>) {
        let lease_sweep_interval = Duration::from_secs(self.config.lease_sweep_interval_secs);
        let liveness_sweep_interval = Duration::from_secs(self.config.liveness_sweep_interval_secs);
        let liveness_timeout_ms = (self.config.liveness_timeout_secs * 1000) as i64;

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease_sweep_interval);
            loop {
                interval.tick().await;
                if runtime.is_read_only() {
                    warn!("lease_sweep halting: runtime is read-only after a fatal store error");
                    break;
                }
                let now = runtime.store.now_ms();
                let mut fatal = false;
                match runtime.guarded(None, || runtime.store.reclaim_expired_task_leases(now)) {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(count = reclaimed.len(), "lease_sweep reclaimed expired task leases")
                    }
                    Ok(_) => {}
                    Err(MafError::Fatal(_)) => fatal = true,
                    Err(e) => warn!(error = %e, "lease_sweep tick failed"),
                }
                match runtime.guarded(None, || runtime.store.reclaim_expired_file_reservations(now)) {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(count = reclaimed.len(), "lease_sweep reclaimed expired file reservations")
                    }
                    Ok(_) => {}
                    Err(MafError::Fatal(_)) => fatal = true,
                    Err(e) => warn!(error = %e, "lease_sweep tick failed"),
                }
                if fatal {
                    warn!("lease_sweep halting after fatal store error");
                    break;
                }
            }
        });

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(liveness_sweep_interval);
            loop {
                interval.tick().await;
                if runtime.is_read_only() {
                    warn!("liveness_sweep halting: runtime is read-only after a fatal store error");
                    break;
                }
                match runtime.guarded(None, || runtime.store.liveness_sweep(liveness_timeout_ms)) {
                    Ok(inactive) if !inactive.is_empty() => {
                        info!(count = inactive.len(), "liveness_sweep marked agents inactive")
                    }
                    Ok(_) => {}
                    Err(MafError::Fatal(_)) => {
                        warn!("liveness_sweep halting after fatal store error");
                        break;
                    }
                    Err(e) => warn!(error = %e, "liveness_sweep tick failed"),
                }
            }
        });
    }
}

/// `true` when a failed façade call is worth retrying: `Store::with_tx`
/// already retried `Transient` internally and gave up, so only a caller
/// loop that waits and re-issues the whole call should try again.
pub fn should_retry(err: &MafError) -> bool {
    err.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maf_core::model::TaskState;

    fn test_runtime() -> Arc<Runtime> {
        let config = RuntimeConfig {
            backend_fallback: vec!["memory".to_string()],
            ..RuntimeConfig::default()
        };
        Arc::new(Runtime::bootstrap(config).unwrap())
    }

    #[test]
    fn bootstrap_registers_default_channels() {
        let runtime = test_runtime();
        runtime
            .send_escalation(
                maf_core::CHANNEL_AGENT_MAIL,
                EnvelopeKind::EscalationRequest,
                "agent-1",
                serde_json::json!({}),
                None,
            )
            .unwrap();
        let debug_channel = runtime.config().debug_channel.clone();
        runtime
            .send_escalation(
                &debug_channel,
                EnvelopeKind::EscalationRequest,
                "agent-1",
                serde_json::json!({}),
                None,
            )
            .unwrap();
    }

    #[test]
    fn create_claim_and_resolve_round_trip() {
        let runtime = test_runtime();
        runtime
            .create_task("t-1".to_string(), 10, serde_json::json!({}), None)
            .unwrap();

        let outcome = runtime
            .claim_next("agent-1", &ClaimFilters::default(), false, None)
            .unwrap();
        let task = match outcome {
            ClaimOutcome::Claimed { task, .. } => task,
            ClaimOutcome::NoneAvailable { .. } => panic!("expected a claim"),
        };
        assert_eq!(task.id, "t-1");

        let task = runtime
            .store()
            .transition(&task.id, TaskState::Leased, TaskState::Running, |_| {})
            .unwrap();
        let task = runtime
            .store()
            .transition(&task.id, TaskState::Running, TaskState::Verifying, |_| {})
            .unwrap();
        assert_eq!(task.state, TaskState::Verifying);

        let resolved = runtime.resolve_verification(&task.id, None).unwrap();
        assert_eq!(resolved, TaskState::Committed);
    }

    #[test]
    fn deadline_tracks_expiry() {
        let deadline = Deadline::after(Duration::from_millis(0));
        assert!(deadline.is_expired());
    }

    #[test]
    fn expired_deadline_fails_fast_with_timeout() {
        let runtime = test_runtime();
        runtime
            .create_task("t-1".to_string(), 10, serde_json::json!({}), None)
            .unwrap();

        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let err = runtime
            .claim_next("agent-1", &ClaimFilters::default(), false, Some(deadline))
            .unwrap_err();
        assert!(matches!(err, MafError::Timeout));

        // the task is untouched: still READY, no lease acquired.
        let task = runtime.get_task("t-1", None).unwrap();
        assert_eq!(task.state, TaskState::Ready);
    }

    #[test]
    fn fatal_store_error_latches_runtime_read_only() {
        let runtime = test_runtime();
        assert!(!runtime.is_read_only());

        let err = runtime.guarded(None, || -> MafResult<()> {
            Err(MafError::Fatal("simulated corruption".to_string()))
        });
        assert!(matches!(err, Err(MafError::Fatal(_))));
        assert!(runtime.is_read_only());

        let err = runtime
            .create_task("t-1".to_string(), 0, serde_json::json!({}), None)
            .unwrap_err();
        assert!(matches!(err, MafError::Fatal(_)));
    }
}
