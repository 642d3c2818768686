//! Command-line interface definitions using clap. Grounded on the teacher's
//! `jit::cli` `Cli`/`Commands` split between a top-level `Parser` and
//! `Subcommand` enums for the command vocabulary of §6.4.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "maf")]
#[command(about = "Command-line adapter for the MAF coordination runtime", long_about = None)]
pub struct Cli {
    /// Path to a TOML config file. Omit to run on defaults plus env
    /// overrides only.
    #[arg(long, global = true, env = "MAF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit one JSON document on stdout instead of human-readable prose.
    #[arg(long, global = true)]
    pub json: bool,

    /// Calling agent's identity. Falls back to `MAF_AGENT_ID`; failing to
    /// resolve either exits with code 3 (§4.K).
    #[arg(long, global = true, env = "MAF_AGENT_ID")]
    pub agent_id: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a task in READY state
    CreateTask {
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// JSON payload, defaults to `{}`
        #[arg(long)]
        payload: Option<String>,
        /// Comma-separated file paths this task will touch
        #[arg(long, value_delimiter = ',')]
        declared_files: Vec<String>,
    },

    /// Claim the next eligible ready task
    Claim {
        /// Only consider tasks whose payload has these `key=value` fields
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        /// Compute the claim without acquiring anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Release a held task-lease
    Release {
        #[arg(long)]
        task_id: String,
    },

    /// Read-only summary of task counts by state and active leases
    Status,

    /// Send a message to an escalation channel
    Escalate {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        context: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },

    /// Check staged paths for file-reservation conflicts before committing
    PreflightCommit {
        /// Comma-separated staged paths
        #[arg(long, value_delimiter = ',')]
        paths: Vec<String>,
    },
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((key.to_string(), value.to_string()))
}
