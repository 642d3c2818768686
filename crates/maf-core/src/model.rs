//! The entities of §3: agents, tasks, leases, file reservations, events,
//! evidence, reservation conflicts, and escalation envelopes.
//!
//! Field names and derive stacks follow the teacher's domain conventions
//! (`#[serde(rename_all = "snake_case")]`, `JsonSchema` alongside `Serialize`/
//! `Deserialize`) even though the entities themselves are new.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coordinator,
    Worker,
    Verifier,
    EscalationManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Maintenance,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub status: AgentStatus,
    /// Wall-clock milliseconds; monotonically non-decreasing per agent.
    pub last_seen: i64,
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Ready,
    Leased,
    Running,
    Verifying,
    Committed,
    Rollback,
    Done,
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Leased => "LEASED",
            TaskState::Running => "RUNNING",
            TaskState::Verifying => "VERIFYING",
            TaskState::Committed => "COMMITTED",
            TaskState::Rollback => "ROLLBACK",
            TaskState::Done => "DONE",
            TaskState::Dead => "DEAD",
        }
    }

    /// `true` while a task-lease row must exist for this state (I3).
    pub fn holds_lease(&self) -> bool {
        matches!(self, TaskState::Leased | TaskState::Running | TaskState::Verifying)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Task {
    pub id: String,
    pub state: TaskState,
    /// Lower sorts sooner.
    pub priority: i64,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub token_budget: Option<i64>,
    pub cost_budget_cents: Option<i64>,
    pub policy_label: Option<String>,
    /// Required verifier names; commit completeness (§4.G) checks against
    /// this set at the task's current `attempts`.
    pub required_verifiers: BTreeSet<String>,
    /// File paths this task declares it will touch; the claim engine (§4.E)
    /// reserves these alongside the task-lease.
    pub declared_files: Vec<String>,
}

impl Task {
    pub fn new(id: String, priority: i64, payload: serde_json::Value, now_ms: i64) -> Self {
        Task {
            id,
            state: TaskState::Ready,
            priority,
            payload,
            created_at: now_ms,
            updated_at: now_ms,
            attempts: 0,
            max_attempts: 3,
            token_budget: None,
            cost_budget_cents: None,
            policy_label: None,
            required_verifiers: BTreeSet::new(),
            declared_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Lease {
    pub task_id: String,
    pub agent_id: String,
    pub lease_expires_at: i64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Expired,
    Released,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct FileReservation {
    pub id: String,
    pub file_path: String,
    pub agent_id: String,
    pub lease_expires_at: i64,
    pub status: ReservationStatus,
    pub lease_reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Created,
    Claimed,
    Running,
    Verifying,
    Committed,
    Rollback,
    Done,
    Dead,
    /// A `LEASED -> READY` release-without-progress, distinct from
    /// `Created` (genuine task creation) so the journal stays queryable
    /// by kind (§4.G).
    Released,
    HeartbeatRenewFailure,
    HeartbeatMissed,
    LeaseExpired,
    Error,
    ReservationCreated,
    ReservationReleased,
    ReservationConflict,
    EscalationSent,
    EscalationRead,
    Override,
    /// A row folded forward from a pre-canonical `runtime_*` table during
    /// the one-time legacy migration (§6.1) — heartbeats and queue
    /// messages have no first-class event kind of their own, so they land
    /// here with the originating table named in `data`.
    LegacyImport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Event {
    pub id: i64,
    pub task_id: Option<String>,
    pub ts: i64,
    pub kind: EventKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerifierResult {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Evidence {
    pub task_id: String,
    pub attempt: u32,
    pub verifier: String,
    pub result: VerifierResult,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Info,
    Warning,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub enum ConflictStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ReservationConflict {
    pub id: String,
    pub file_path: String,
    pub conflicting_agent: String,
    pub existing_agent: String,
    pub conflict_type: String,
    pub severity: ConflictSeverity,
    pub status: ConflictStatus,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
    pub resolution_strategy: Option<String>,
    pub evidence_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    PreflightCheck,
    PreflightResult,
    ReservationConflict,
    EscalationRequest,
    EscalationResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct EscalationEnvelope {
    pub id: i64,
    pub kind: EnvelopeKind,
    pub from_agent: String,
    pub to_channel: String,
    pub created_at: i64,
    pub payload: serde_json::Value,
    pub read: bool,
}
