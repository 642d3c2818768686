//! Structured error taxonomy for the coordination runtime.
//!
//! The teacher's CLI layer (`ActionableError`) carries human prose plus a list
//! of causes/remediations and expects callers to regex-scrape fields like the
//! holding agent id back out of a formatted message. That pattern is flagged
//! for re-architecture: every variant a caller needs to branch on here carries
//! its fields directly, and no formatter ever parses another formatter's text.

use thiserror::Error;

/// The complete error taxonomy for task, lease, reservation, and channel
/// operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MafError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("illegal transition: {task_id} {from} -> {to}")]
    IllegalTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("lease conflict on task {task_id}: held by {holder}")]
    LeaseConflict { task_id: String, holder: String },

    #[error("file {path} leased by {holder} until {expires_at}")]
    FileLeased {
        path: String,
        holder: String,
        expires_at: i64,
    },

    #[error("lease/reservation expired")]
    Expired,

    #[error("deadline exceeded")]
    Timeout,

    #[error("transient store contention: {0}")]
    Transient(String),

    #[error("fatal store error: {0}")]
    Fatal(String),

    #[error("unknown escalation channel: {0}")]
    UnknownChannel(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("override applied for {caller_agent} on {path_count} path(s)")]
    Override { caller_agent: String, path_count: usize },
}

impl MafError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        MafError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// `true` for errors `with_tx` should retry with backoff rather than
    /// propagate immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MafError::Transient(_))
    }
}

pub type MafResult<T> = Result<T, MafError>;
