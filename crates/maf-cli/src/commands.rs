//! Command handlers: glue between parsed CLI arguments and the
//! `maf_dispatch::Runtime` façade. Grounded on the teacher's
//! `commands::CommandExecutor` dispatch shape — one function per
//! subcommand, each returning a `Result` the caller turns into an exit
//! code, rather than calling `std::process::exit` itself.

use crate::cli::Commands;
use crate::output::{exit_code_for, error_code_for, ExitCode, JsonError, JsonOutput, OutputContext};
use maf_core::model::EnvelopeKind;
use maf_core::precommit::Decision;
use maf_core::scheduler::{ClaimFilters, ClaimOutcome};
use maf_dispatch::Runtime;
use serde_json::json;

/// Resolves the calling agent's identity: explicit flag, then
/// `MAF_AGENT_ID` (already folded into `--agent-id` by clap's `env`
/// attribute), then failure with exit code 3 (§4.K).
pub fn resolve_agent_id(agent_id: Option<String>) -> Result<String, ExitCode> {
    agent_id.filter(|s| !s.is_empty()).ok_or(ExitCode::InvalidArguments)
}

/// Runs `command` against `runtime`, prints via `out`, and returns the
/// exit code the process should use.
pub fn run(command: Commands, runtime: &Runtime, agent_id: Option<String>, out: &OutputContext) -> ExitCode {
    match command {
        Commands::CreateTask {
            id,
            priority,
            payload,
            declared_files,
        } => create_task(runtime, out, id, priority, payload, declared_files),
        Commands::Claim { filters, dry_run } => claim(runtime, out, agent_id, filters, dry_run),
        Commands::Release { task_id } => release(runtime, out, agent_id, task_id),
        Commands::Status => status(runtime, out),
        Commands::Escalate {
            channel,
            context,
            priority,
        } => escalate(runtime, out, agent_id, channel, context, priority),
        Commands::PreflightCommit { paths } => preflight_commit(runtime, out, agent_id, paths),
    }
}

fn create_task(
    runtime: &Runtime,
    out: &OutputContext,
    id: String,
    priority: i64,
    payload: Option<String>,
    declared_files: Vec<String>,
) -> ExitCode {
    let payload = match payload {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => return emit_error(out, "create-task", "INVALID_ARGUMENT", &e.to_string(), ExitCode::InvalidArguments),
        },
        None => json!({}),
    };
    match runtime.create_task(id.clone(), priority, payload, None) {
        Ok(task_id) => {
            if !declared_files.is_empty() {
                if let Err(e) = runtime.store().set_declared_files(&task_id, declared_files) {
                    return emit_maf_error(out, "create-task", &e);
                }
            }
            out.print_info(format!("created task {task_id}")).ok();
            out.print_json(&JsonOutput::success(json!({"id": task_id}), "create-task")).ok();
            ExitCode::Success
        }
        Err(e) => emit_maf_error(out, "create-task", &e),
    }
}

fn claim(
    runtime: &Runtime,
    out: &OutputContext,
    agent_id: Option<String>,
    filters: Vec<(String, String)>,
    dry_run: bool,
) -> ExitCode {
    let agent_id = match resolve_agent_id(agent_id) {
        Ok(a) => a,
        Err(code) => return emit_error(out, "claim", "INVALID_ARGUMENT", "agent id not resolved", code),
    };
    let claim_filters = ClaimFilters {
        required_fields: filters
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect(),
    };
    match runtime.claim_next(&agent_id, &claim_filters, dry_run, None) {
        Ok(ClaimOutcome::Claimed {
            task,
            acquired_files,
            conflicted_files,
        }) => {
            out.print_info(format!("claimed {}", task.id)).ok();
            out.print_json(&JsonOutput::success(
                json!({
                    "task": task,
                    "acquired_files": acquired_files,
                    "conflicted_files": conflicted_files.iter().map(|c| json!({
                        "path": c.path,
                        "holder": c.holder,
                        "expires_at": c.expires_at,
                    })).collect::<Vec<_>>(),
                }),
                "claim",
            ))
            .ok();
            ExitCode::Success
        }
        Ok(ClaimOutcome::NoneAvailable { ready_preview }) => {
            out.print_info("no work available").ok();
            out.print_json(&JsonOutput::success(
                json!({ "ready_preview": ready_preview }),
                "claim",
            ))
            .ok();
            ExitCode::NoWorkAvailable
        }
        Err(e) => emit_maf_error(out, "claim", &e),
    }
}

fn release(runtime: &Runtime, out: &OutputContext, agent_id: Option<String>, task_id: String) -> ExitCode {
    let agent_id = match resolve_agent_id(agent_id) {
        Ok(a) => a,
        Err(code) => return emit_error(out, "release", "INVALID_ARGUMENT", "agent id not resolved", code),
    };
    match runtime.release_task(&task_id, &agent_id, None) {
        Ok(()) => {
            out.print_info(format!("released {task_id}")).ok();
            out.print_json(&JsonOutput::success(json!({"task_id": task_id}), "release")).ok();
            ExitCode::Success
        }
        Err(e) => emit_maf_error(out, "release", &e),
    }
}

fn status(runtime: &Runtime, out: &OutputContext) -> ExitCode {
    let tasks = match runtime.list_tasks(&Default::default(), None) {
        Ok(t) => t,
        Err(e) => return emit_maf_error(out, "status", &e),
    };
    let mut by_state: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for task in &tasks {
        *by_state.entry(task.state.as_str()).or_insert(0) += 1;
    }
    let recent_errors = runtime
        .query_events(&maf_core::EventQuery {
            recent: Some(20),
            kind: Some(vec![maf_core::model::EventKind::Error]),
            task_id: None,
        }, None)
        .unwrap_or_default();

    out.print_info(format!("{} tasks total", tasks.len())).ok();
    out.print_json(&JsonOutput::success(
        json!({
            "by_state": by_state,
            "total": tasks.len(),
            "recent_errors": recent_errors,
        }),
        "status",
    ))
    .ok();
    ExitCode::Success
}

fn escalate(
    runtime: &Runtime,
    out: &OutputContext,
    agent_id: Option<String>,
    channel: String,
    context: String,
    priority: i64,
) -> ExitCode {
    let agent_id = match resolve_agent_id(agent_id) {
        Ok(a) => a,
        Err(code) => return emit_error(out, "escalate", "INVALID_ARGUMENT", "agent id not resolved", code),
    };
    match runtime.send_escalation(
        &channel,
        EnvelopeKind::EscalationRequest,
        &agent_id,
        json!({ "context": context, "priority": priority }),
        None,
    ) {
        Ok(message_id) => {
            out.print_info(format!("sent message {message_id} on {channel}")).ok();
            out.print_json(&JsonOutput::success(json!({"message_id": message_id}), "escalate")).ok();
            ExitCode::Success
        }
        Err(e) => emit_maf_error(out, "escalate", &e),
    }
}

fn preflight_commit(
    runtime: &Runtime,
    out: &OutputContext,
    agent_id: Option<String>,
    paths: Vec<String>,
) -> ExitCode {
    let agent_id = match resolve_agent_id(agent_id) {
        Ok(a) => a,
        Err(code) => return emit_error(out, "preflight-commit", "INVALID_ARGUMENT", "agent id not resolved", code),
    };
    match runtime.precommit_check(&paths, &agent_id, None) {
        Ok(Decision::Allow { overridden }) => {
            out.print_info(if overridden { "allowed (override)" } else { "allowed" }).ok();
            out.print_json(&JsonOutput::success(json!({"allow": true, "overridden": overridden}), "preflight-commit"))
                .ok();
            ExitCode::Success
        }
        Ok(Decision::Block { conflicts }) => {
            let conflicts_json: Vec<_> = conflicts
                .iter()
                .map(|c| json!({"path": c.path, "held_by": c.held_by, "expires_at": c.expires_at}))
                .collect();
            out.print_error(format!("blocked by {} reservation conflict(s)", conflicts.len())).ok();
            out.print_json(&JsonOutput::success(json!({"allow": false, "conflicts": conflicts_json}), "preflight-commit"))
                .ok();
            ExitCode::LeaseConflict
        }
        Err(e) => emit_maf_error(out, "preflight-commit", &e),
    }
}

fn emit_maf_error(out: &OutputContext, command: &str, err: &maf_core::errors::MafError) -> ExitCode {
    let code = exit_code_for(err);
    emit_error(out, command, error_code_for(err), &err.to_string(), code)
}

fn emit_error(out: &OutputContext, command: &str, error_code: &str, message: &str, exit_code: ExitCode) -> ExitCode {
    out.print_error(message).ok();
    let doc = JsonError::new(error_code, message, command);
    if out.is_json() {
        eprintln!("{}", doc.to_json_string().expect("JsonError always serializes"));
    }
    exit_code
}
