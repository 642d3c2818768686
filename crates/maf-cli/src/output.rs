//! Structured output formatting. Grounded on the teacher's
//! `jit::output` module: `OutputContext` for quiet/json-gated prose,
//! `JsonOutput<T>`/`JsonError` envelopes with a `Metadata` stamp, and an
//! `ExitCode` enum driving `std::process::exit`.
//!
//! The exit code *values* are not the teacher's own numbering — they are
//! fixed by the CLI adapter contract this tool honors: `0 success`,
//! `1 generic error`, `2 no work available`, `3 invalid arguments`,
//! `4 lease conflicts`, `6 quota exceeded`. Only the enum-plus-wrapper
//! *shape* is carried over.

use chrono::Utc;
use maf_core::errors::MafError;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt::Display;
use std::io::{self, Write};

const OUTPUT_VERSION: &str = "0.1.0";

/// Controls whether human prose is emitted alongside the JSON document.
pub struct OutputContext {
    json: bool,
}

impl OutputContext {
    pub fn new(json: bool) -> Self {
        OutputContext { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Prose shown only in human mode.
    pub fn print_info(&self, msg: impl Display) -> io::Result<()> {
        if self.json {
            return Ok(());
        }
        writeln_safe(&format!("{msg}"))
    }

    pub fn print_error(&self, msg: impl Display) -> io::Result<()> {
        writeln_safe_stderr(&format!("error: {msg}"))
    }

    /// Emits `doc` as pretty JSON on stdout, in json mode; no-op otherwise
    /// (callers print their own prose summary for the human path).
    pub fn print_json<T: Serialize>(&self, doc: &JsonOutput<T>) -> io::Result<()> {
        if !self.json {
            return Ok(());
        }
        writeln_safe(&doc.to_json_string().expect("JsonOutput always serializes"))
    }
}

fn writeln_safe(msg: &str) -> io::Result<()> {
    match writeln!(io::stdout(), "{msg}") {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => std::process::exit(0),
        Err(e) => Err(e),
    }
}

fn writeln_safe_stderr(msg: &str) -> io::Result<()> {
    match writeln!(io::stderr(), "{msg}") {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => std::process::exit(0),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub metadata: Metadata,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn success(data: T, command: impl Into<String>) -> Self {
        JsonOutput {
            success: true,
            data,
            metadata: Metadata::new(command),
        }
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Serialize)]
pub struct JsonError {
    pub success: bool,
    pub error: ErrorDetail,
    pub metadata: Metadata,
}

impl JsonError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, command: impl Into<String>) -> Self {
        JsonError {
            success: false,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
            metadata: Metadata::new(command),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: chrono::DateTime<Utc>,
    pub version: String,
    pub command: String,
}

impl Metadata {
    fn new(command: impl Into<String>) -> Self {
        Metadata {
            timestamp: Utc::now(),
            version: OUTPUT_VERSION.to_string(),
            command: command.into(),
        }
    }
}

fn serialize_timestamp<S>(dt: &chrono::DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}

/// Fixed exit codes of the CLI adapter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GenericError = 1,
    NoWorkAvailable = 2,
    InvalidArguments = 3,
    LeaseConflict = 4,
    QuotaExceeded = 6,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Maps a `MafError` to its exit code by matching the typed variant
/// directly — never by scraping the formatted message, which is the
/// pattern the teacher's `ActionableError` leaned on and this adapter
/// deliberately does not repeat.
pub fn exit_code_for(err: &MafError) -> ExitCode {
    match err {
        MafError::InvalidArgument(_) | MafError::NotFound { .. } | MafError::UnknownChannel(_) => {
            ExitCode::InvalidArguments
        }
        MafError::LeaseConflict { .. } | MafError::FileLeased { .. } => ExitCode::LeaseConflict,
        MafError::QuotaExceeded(_) => ExitCode::QuotaExceeded,
        MafError::IllegalTransition { .. }
        | MafError::Expired
        | MafError::Timeout
        | MafError::Transient(_)
        | MafError::Fatal(_)
        | MafError::Override { .. } => ExitCode::GenericError,
    }
}

/// Error code string carried in `ErrorDetail.code` for a `MafError`.
pub fn error_code_for(err: &MafError) -> &'static str {
    match err {
        MafError::InvalidArgument(_) => "INVALID_ARGUMENT",
        MafError::NotFound { .. } => "NOT_FOUND",
        MafError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
        MafError::LeaseConflict { .. } => "LEASE_CONFLICT",
        MafError::FileLeased { .. } => "FILE_LEASED",
        MafError::Expired => "EXPIRED",
        MafError::Timeout => "TIMEOUT",
        MafError::Transient(_) => "TRANSIENT",
        MafError::Fatal(_) => "FATAL",
        MafError::UnknownChannel(_) => "UNKNOWN_CHANNEL",
        MafError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
        MafError::Override { .. } => "OVERRIDE",
    }
}
