//! Durable backend: rusqlite with WAL journaling and a versioned migration
//! table (`schema_migrations`, one transaction per migration), SQL-backed
//! lease rows keyed by a composite primary key. This is the backend the
//! property and invariant tests are written against; `memory` and `file`
//! are best-effort.
//!
//! Every table name that mirrors a legacy `runtime_*` table is created
//! under its canonical name directly; an existing `runtime_*` table, if
//! present from an older deployment, is copied forward once at `init()`
//! and then left alone.

use super::{RawStore, RawTx};
use crate::errors::{MafError, MafResult};
use crate::model::{
    Agent, AgentStatus, AgentType, ConflictSeverity, ConflictStatus, EnvelopeKind,
    EscalationEnvelope, Event, EventKind, Evidence, FileReservation, Lease, ReservationConflict,
    ReservationStatus, Task, TaskState, VerifierResult,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE tasks (
    id                  TEXT PRIMARY KEY,
    state               TEXT NOT NULL,
    priority            INTEGER NOT NULL,
    payload             TEXT NOT NULL,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    attempts            INTEGER NOT NULL,
    max_attempts        INTEGER NOT NULL,
    token_budget        INTEGER NULL,
    cost_budget_cents   INTEGER NULL,
    policy_label        TEXT NULL,
    required_verifiers  TEXT NOT NULL,
    declared_files      TEXT NOT NULL
);

CREATE TABLE leases (
    task_id         TEXT PRIMARY KEY,
    agent_id        TEXT NOT NULL,
    lease_expires_at INTEGER NOT NULL,
    attempt         INTEGER NOT NULL
);

CREATE TABLE events (
    id          INTEGER PRIMARY KEY,
    task_id     TEXT NULL,
    ts          INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX events_ts_idx ON events (ts DESC, id DESC);
CREATE INDEX events_task_idx ON events (task_id);

CREATE TABLE evidence (
    task_id     TEXT NOT NULL,
    attempt     INTEGER NOT NULL,
    verifier    TEXT NOT NULL,
    result      TEXT NOT NULL,
    details     TEXT NOT NULL,
    PRIMARY KEY (task_id, attempt, verifier)
);
"#;

const MIGRATION_V2_SQL: &str = r#"
CREATE TABLE file_reservations (
    id              TEXT PRIMARY KEY,
    file_path       TEXT NOT NULL UNIQUE,
    agent_id        TEXT NOT NULL,
    lease_expires_at INTEGER NOT NULL,
    status          TEXT NOT NULL,
    lease_reason    TEXT NULL,
    metadata        TEXT NOT NULL
);
CREATE INDEX file_reservations_path_idx ON file_reservations (file_path);

CREATE TABLE agents (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    type        TEXT NOT NULL,
    status      TEXT NOT NULL,
    last_seen   INTEGER NOT NULL,
    capabilities TEXT NOT NULL,
    metadata    TEXT NOT NULL
);

CREATE TABLE reservation_conflicts (
    id                  TEXT PRIMARY KEY,
    file_path           TEXT NOT NULL,
    conflicting_agent   TEXT NOT NULL,
    existing_agent      TEXT NOT NULL,
    conflict_type       TEXT NOT NULL,
    severity            TEXT NOT NULL,
    status              TEXT NOT NULL,
    detected_at         INTEGER NOT NULL,
    resolved_at         INTEGER NULL,
    resolution_strategy TEXT NULL,
    evidence_ref        TEXT NULL
);

CREATE TABLE escalation_channels (
    name    TEXT PRIMARY KEY
);

CREATE TABLE escalation_envelopes (
    id          INTEGER PRIMARY KEY,
    kind        TEXT NOT NULL,
    from_agent  TEXT NOT NULL,
    to_channel  TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    payload     TEXT NOT NULL,
    read        INTEGER NOT NULL
);
CREATE INDEX escalation_envelopes_channel_idx ON escalation_envelopes (to_channel, created_at);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> MafResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MafError::Fatal(format!("create store dir: {e}")))?;
        }
        let mut conn = Connection::open(path)
            .map_err(|e| MafError::Fatal(format!("open sqlite store: {e}")))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON; \
             PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA secure_delete = ON; \
             PRAGMA mmap_size = 268435456;",
        )
        .map_err(|e| MafError::Fatal(format!("configure pragmas: {e}")))?;
        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;
        migrate_legacy_runtime_tables(&mut conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> MafResult<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| MafError::Fatal(format!("open in-memory sqlite: {e}")))?;
        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

fn ensure_migration_table(conn: &Connection) -> MafResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .map_err(|e| MafError::Fatal(format!("ensure schema_migrations: {e}")))
}

fn current_schema_version(conn: &Connection) -> MafResult<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| MafError::Fatal(format!("read schema version: {e}")))
}

fn apply_pending_migrations(conn: &mut Connection) -> MafResult<()> {
    let mut current = current_schema_version(conn)?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn
            .transaction()
            .map_err(|e| MafError::Fatal(format!("start migration tx: {e}")))?;
        tx.execute_batch(sql)
            .map_err(|e| MafError::Fatal(format!("apply migration v{version}: {e}")))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .map_err(|e| MafError::Fatal(format!("record migration v{version}: {e}")))?;
        tx.commit()
            .map_err(|e| MafError::Fatal(format!("commit migration v{version}: {e}")))?;
        current = *version;
    }
    Ok(())
}

/// Folds forward every recognized `runtime_*` table present from an older
/// deployment, once, on first open (§6.1). No-op for any table that isn't
/// present — a fresh store touches none of this.
fn migrate_legacy_runtime_tables(conn: &mut Connection) -> MafResult<()> {
    migrate_legacy_tasks(conn)?;
    migrate_legacy_leases(conn)?;
    migrate_legacy_heartbeats(conn)?;
    migrate_legacy_queue_messages(conn)?;
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> MafResult<bool> {
    conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(|e| MafError::Fatal(format!("check legacy table {name}: {e}")))
}

/// Copies rows from a pre-existing `runtime_tasks` table into `tasks`,
/// once, if present.
fn migrate_legacy_tasks(conn: &Connection) -> MafResult<()> {
    if !table_exists(conn, "runtime_tasks")? {
        return Ok(());
    }
    conn.execute_batch(
        "INSERT OR IGNORE INTO tasks
            SELECT id, state, priority, payload, created_at, updated_at, attempts,
                   max_attempts, token_budget, cost_budget_cents, policy_label,
                   required_verifiers, declared_files
            FROM runtime_tasks;",
    )
    .map_err(|e| MafError::Fatal(format!("migrate legacy runtime_tasks: {e}")))?;
    Ok(())
}

/// A legacy claim row did not always reference a row in `runtime_tasks`
/// under a matching id — some were bare file-path claims with no backing
/// task. Any lease whose `task_id` has no counterpart in `tasks` gets a
/// synthetic `LEASED` task row created for it first, per spec.md §6.1
/// ("legacy leases fold into tasks + leases with synthetic task ids").
fn migrate_legacy_leases(conn: &mut Connection) -> MafResult<()> {
    if !table_exists(conn, "runtime_leases")? {
        return Ok(());
    }
    let tx = conn
        .transaction()
        .map_err(|e| MafError::Fatal(format!("start legacy lease migration: {e}")))?;
    {
        let rows: Vec<(String, String, i64, i64)> = {
            let mut stmt = tx
                .prepare("SELECT task_id, agent_id, expires_at, attempt FROM runtime_leases")
                .map_err(|e| MafError::Fatal(format!("prepare legacy leases scan: {e}")))?;
            stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(|e| MafError::Fatal(format!("query legacy leases: {e}")))?
            .collect::<Result<_, _>>()
            .map_err(|e| MafError::Fatal(format!("read legacy lease row: {e}")))?
        };

        for (task_id, agent_id, expires_at, attempt) in rows {
            let has_task: i64 = tx
                .query_row("SELECT COUNT(1) FROM tasks WHERE id = ?1", params![task_id], |r| {
                    r.get(0)
                })
                .map_err(|e| MafError::Fatal(format!("check task for legacy lease: {e}")))?;
            let synthetic_id = if has_task > 0 {
                task_id
            } else {
                let synthetic_id = format!("legacy-{task_id}");
                tx.execute(
                    "INSERT OR IGNORE INTO tasks
                        (id, state, priority, payload, created_at, updated_at, attempts,
                         max_attempts, token_budget, cost_budget_cents, policy_label,
                         required_verifiers, declared_files)
                     VALUES (?1, 'LEASED', 0, '{}', ?2, ?2, ?3, 3, NULL, NULL, NULL, '[]', '[]')",
                    params![synthetic_id, expires_at, attempt],
                )
                .map_err(|e| MafError::Fatal(format!("create synthetic task for legacy lease: {e}")))?;
                synthetic_id
            };
            tx.execute(
                "INSERT OR IGNORE INTO leases (task_id, agent_id, lease_expires_at, attempt)
                 VALUES (?1, ?2, ?3, ?4)",
                params![synthetic_id, agent_id, expires_at, attempt],
            )
            .map_err(|e| MafError::Fatal(format!("insert migrated lease: {e}")))?;
        }
    }
    tx.commit()
        .map_err(|e| MafError::Fatal(format!("commit legacy lease migration: {e}")))
}

/// Legacy per-agent heartbeat rows have no first-class row of their own in
/// the canonical schema; each folds into an `events` row tagged
/// `LEGACY_IMPORT` so the history survives the migration without resurrecting
/// a bespoke heartbeats table (§6.1).
fn migrate_legacy_heartbeats(conn: &Connection) -> MafResult<()> {
    if !table_exists(conn, "runtime_heartbeats")? {
        return Ok(());
    }
    let rows: Vec<(String, i64, Option<String>)> = {
        let mut stmt = conn
            .prepare("SELECT agent_id, last_seen, status FROM runtime_heartbeats")
            .map_err(|e| MafError::Fatal(format!("prepare legacy heartbeats scan: {e}")))?;
        stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })
        .map_err(|e| MafError::Fatal(format!("query legacy heartbeats: {e}")))?
        .collect::<Result<_, _>>()
        .map_err(|e| MafError::Fatal(format!("read legacy heartbeat row: {e}")))?
    };
    for (agent_id, last_seen, status) in rows {
        let data = serde_json::json!({
            "legacy_table": "runtime_heartbeats",
            "agent_id": agent_id,
            "status": status,
        });
        conn.execute(
            "INSERT INTO events (task_id, ts, kind, data) VALUES (NULL, ?1, ?2, ?3)",
            params![last_seen, event_kind_str(EventKind::LegacyImport), data.to_string()],
        )
        .map_err(|e| MafError::Fatal(format!("insert migrated heartbeat event: {e}")))?;
    }
    Ok(())
}

/// Legacy queue messages (the precursor to §4.H's escalation channels)
/// fold into `events` the same way heartbeats do — the channel and
/// payload survive in `data`, but the message itself is not replayed onto
/// a live escalation channel (§6.1 only promises the audit trail folds
/// forward, not that old messages become newly-unread mail).
fn migrate_legacy_queue_messages(conn: &Connection) -> MafResult<()> {
    if !table_exists(conn, "runtime_queue_messages")? {
        return Ok(());
    }
    let rows: Vec<(String, String, i64)> = {
        let mut stmt = conn
            .prepare("SELECT channel, payload, created_at FROM runtime_queue_messages")
            .map_err(|e| MafError::Fatal(format!("prepare legacy queue scan: {e}")))?;
        stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(|e| MafError::Fatal(format!("query legacy queue messages: {e}")))?
        .collect::<Result<_, _>>()
        .map_err(|e| MafError::Fatal(format!("read legacy queue message row: {e}")))?
    };
    for (channel, payload, created_at) in rows {
        let data = serde_json::json!({
            "legacy_table": "runtime_queue_messages",
            "channel": channel,
            "payload": serde_json::from_str::<serde_json::Value>(&payload).unwrap_or(serde_json::Value::Null),
        });
        conn.execute(
            "INSERT INTO events (task_id, ts, kind, data) VALUES (NULL, ?1, ?2, ?3)",
            params![created_at, event_kind_str(EventKind::LegacyImport), data.to_string()],
        )
        .map_err(|e| MafError::Fatal(format!("insert migrated queue message event: {e}")))?;
    }
    Ok(())
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi_err, _)
            if ffi_err.code == rusqlite::ErrorCode::DatabaseBusy
                || ffi_err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn sql_err(e: rusqlite::Error) -> MafError {
    if is_busy(&e) {
        MafError::Transient(e.to_string())
    } else {
        MafError::Fatal(e.to_string())
    }
}

impl RawStore for SqliteStore {
    fn init(&self) -> MafResult<()> {
        Ok(())
    }

    fn with_tx<T>(&self, f: impl FnOnce(&mut dyn RawTx) -> MafResult<T>) -> MafResult<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| MafError::Fatal("sqlite connection mutex poisoned".into()))?;
        let tx = guard
            .transaction()
            .map_err(|e| MafError::Transient(e.to_string()))?;
        let mut wrapper = SqliteTx { tx: &tx };
        let result = f(&mut wrapper);
        match result {
            Ok(v) => {
                tx.commit().map_err(sql_err)?;
                Ok(v)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }
}

struct SqliteTx<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

fn str_set_to_json(set: &std::collections::BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".into())
}

fn json_to_str_set(s: &str) -> std::collections::BTreeSet<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn vec_to_json(v: &[String]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".into())
}

fn json_to_vec(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

impl RawTx for SqliteTx<'_> {
    fn get_task(&mut self, id: &str) -> MafResult<Option<Task>> {
        self.tx
            .query_row("SELECT id, state, priority, payload, created_at, updated_at, attempts, max_attempts, token_budget, cost_budget_cents, policy_label, required_verifiers, declared_files FROM tasks WHERE id = ?1", params![id], |row| {
                Ok(Task {
                    id: row.get(0)?,
                    state: parse_task_state(&row.get::<_, String>(1)?)?,
                    priority: row.get(2)?,
                    payload: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or(serde_json::Value::Null),
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                    attempts: row.get(6)?,
                    max_attempts: row.get(7)?,
                    token_budget: row.get(8)?,
                    cost_budget_cents: row.get(9)?,
                    policy_label: row.get(10)?,
                    required_verifiers: json_to_str_set(&row.get::<_, String>(11)?),
                    declared_files: json_to_vec(&row.get::<_, String>(12)?),
                })
            })
            .optional()
            .map_err(sql_err)
    }

    fn put_task(&mut self, task: &Task) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT INTO tasks (id, state, priority, payload, created_at, updated_at, attempts, max_attempts, token_budget, cost_budget_cents, policy_label, required_verifiers, declared_files)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET state=excluded.state, priority=excluded.priority, payload=excluded.payload,
                    updated_at=excluded.updated_at, attempts=excluded.attempts, max_attempts=excluded.max_attempts,
                    token_budget=excluded.token_budget, cost_budget_cents=excluded.cost_budget_cents,
                    policy_label=excluded.policy_label, required_verifiers=excluded.required_verifiers,
                    declared_files=excluded.declared_files",
                params![
                    task.id,
                    task.state.as_str(),
                    task.priority,
                    task.payload.to_string(),
                    task.created_at,
                    task.updated_at,
                    task.attempts,
                    task.max_attempts,
                    task.token_budget,
                    task.cost_budget_cents,
                    task.policy_label,
                    str_set_to_json(&task.required_verifiers),
                    vec_to_json(&task.declared_files),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_tasks(&mut self) -> MafResult<Vec<Task>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id FROM tasks")
            .map_err(sql_err)?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<Result<_, _>>()
            .map_err(sql_err)?;
        drop(stmt);
        ids.into_iter()
            .map(|id| self.get_task(&id).map(|t| t.expect("listed id must exist")))
            .collect()
    }

    fn get_lease(&mut self, task_id: &str) -> MafResult<Option<Lease>> {
        self.tx
            .query_row(
                "SELECT task_id, agent_id, lease_expires_at, attempt FROM leases WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok(Lease {
                        task_id: row.get(0)?,
                        agent_id: row.get(1)?,
                        lease_expires_at: row.get(2)?,
                        attempt: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    fn put_lease(&mut self, lease: &Lease) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT INTO leases (task_id, agent_id, lease_expires_at, attempt) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id) DO UPDATE SET agent_id=excluded.agent_id, lease_expires_at=excluded.lease_expires_at, attempt=excluded.attempt",
                params![lease.task_id, lease.agent_id, lease.lease_expires_at, lease.attempt],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn delete_lease(&mut self, task_id: &str) -> MafResult<()> {
        self.tx
            .execute("DELETE FROM leases WHERE task_id = ?1", params![task_id])
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_leases(&mut self) -> MafResult<Vec<Lease>> {
        let mut stmt = self
            .tx
            .prepare("SELECT task_id, agent_id, lease_expires_at, attempt FROM leases")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Lease {
                    task_id: row.get(0)?,
                    agent_id: row.get(1)?,
                    lease_expires_at: row.get(2)?,
                    attempt: row.get(3)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<_, _>>().map_err(sql_err)
    }

    fn get_reservation(&mut self, file_path: &str) -> MafResult<Option<FileReservation>> {
        self.tx
            .query_row(
                "SELECT id, file_path, agent_id, lease_expires_at, status, lease_reason, metadata FROM file_reservations WHERE file_path = ?1",
                params![file_path],
                |row| {
                    Ok(FileReservation {
                        id: row.get(0)?,
                        file_path: row.get(1)?,
                        agent_id: row.get(2)?,
                        lease_expires_at: row.get(3)?,
                        status: parse_reservation_status(&row.get::<_, String>(4)?)?,
                        lease_reason: row.get(5)?,
                        metadata: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or(serde_json::Value::Null),
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    fn put_reservation(&mut self, reservation: &FileReservation) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT INTO file_reservations (id, file_path, agent_id, lease_expires_at, status, lease_reason, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(file_path) DO UPDATE SET agent_id=excluded.agent_id, lease_expires_at=excluded.lease_expires_at,
                    status=excluded.status, lease_reason=excluded.lease_reason, metadata=excluded.metadata",
                params![
                    reservation.id,
                    reservation.file_path,
                    reservation.agent_id,
                    reservation.lease_expires_at,
                    reservation_status_str(reservation.status),
                    reservation.lease_reason,
                    reservation.metadata.to_string(),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_reservations(&mut self) -> MafResult<Vec<FileReservation>> {
        let mut stmt = self
            .tx
            .prepare("SELECT file_path FROM file_reservations")
            .map_err(sql_err)?;
        let paths: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<Result<_, _>>()
            .map_err(sql_err)?;
        drop(stmt);
        paths
            .into_iter()
            .map(|p| self.get_reservation(&p).map(|r| r.expect("listed path must exist")))
            .collect()
    }

    fn get_agent(&mut self, id: &str) -> MafResult<Option<Agent>> {
        self.tx
            .query_row(
                "SELECT id, name, type, status, last_seen, capabilities, metadata FROM agents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        agent_type: parse_agent_type(&row.get::<_, String>(2)?)?,
                        status: parse_agent_status(&row.get::<_, String>(3)?)?,
                        last_seen: row.get(4)?,
                        capabilities: json_to_str_set(&row.get::<_, String>(5)?),
                        metadata: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or(serde_json::Value::Null),
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    fn put_agent(&mut self, agent: &Agent) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT INTO agents (id, name, type, status, last_seen, capabilities, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name, type=excluded.type, status=excluded.status,
                    last_seen=excluded.last_seen, capabilities=excluded.capabilities, metadata=excluded.metadata",
                params![
                    agent.id,
                    agent.name,
                    agent_type_str(agent.agent_type),
                    agent_status_str(agent.status),
                    agent.last_seen,
                    str_set_to_json(&agent.capabilities),
                    agent.metadata.to_string(),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_agents(&mut self) -> MafResult<Vec<Agent>> {
        let mut stmt = self.tx.prepare("SELECT id FROM agents").map_err(sql_err)?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<Result<_, _>>()
            .map_err(sql_err)?;
        drop(stmt);
        ids.into_iter()
            .map(|id| self.get_agent(&id).map(|a| a.expect("listed id must exist")))
            .collect()
    }

    fn next_event_id(&mut self) -> MafResult<i64> {
        self.tx
            .query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM events", [], |row| {
                row.get(0)
            })
            .map_err(sql_err)
    }

    fn append_event(&mut self, event: &Event) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT INTO events (id, task_id, ts, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id,
                    event.task_id,
                    event.ts,
                    event_kind_str(event.kind),
                    event.data.to_string(),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_events(&mut self) -> MafResult<Vec<Event>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id, task_id, ts, kind, data FROM events ORDER BY ts DESC, id DESC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                let kind_str: String = row.get(3)?;
                Ok(Event {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    ts: row.get(2)?,
                    kind: parse_event_kind(&kind_str)?,
                    data: serde_json::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<_, _>>().map_err(sql_err)
    }

    fn put_evidence(&mut self, evidence: &Evidence) -> MafResult<()> {
        let exists: i64 = self
            .tx
            .query_row(
                "SELECT COUNT(1) FROM evidence WHERE task_id = ?1 AND attempt = ?2 AND verifier = ?3",
                params![evidence.task_id, evidence.attempt, evidence.verifier],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if exists > 0 {
            return Err(MafError::InvalidArgument(format!(
                "evidence already recorded for {} attempt {} verifier {}",
                evidence.task_id, evidence.attempt, evidence.verifier
            )));
        }
        self.tx
            .execute(
                "INSERT INTO evidence (task_id, attempt, verifier, result, details) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    evidence.task_id,
                    evidence.attempt,
                    evidence.verifier,
                    verifier_result_str(evidence.result),
                    evidence.details.to_string(),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_evidence(&mut self, task_id: &str, attempt: u32) -> MafResult<Vec<Evidence>> {
        let mut stmt = self
            .tx
            .prepare("SELECT task_id, attempt, verifier, result, details FROM evidence WHERE task_id = ?1 AND attempt = ?2")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![task_id, attempt], |row| {
                let result_str: String = row.get(3)?;
                Ok(Evidence {
                    task_id: row.get(0)?,
                    attempt: row.get(1)?,
                    verifier: row.get(2)?,
                    result: parse_verifier_result(&result_str),
                    details: serde_json::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<_, _>>().map_err(sql_err)
    }

    fn put_conflict(&mut self, conflict: &ReservationConflict) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT INTO reservation_conflicts (id, file_path, conflicting_agent, existing_agent, conflict_type, severity, status, detected_at, resolved_at, resolution_strategy, evidence_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    conflict.id,
                    conflict.file_path,
                    conflict.conflicting_agent,
                    conflict.existing_agent,
                    conflict.conflict_type,
                    conflict_severity_str(conflict.severity),
                    conflict_status_str(conflict.status),
                    conflict.detected_at,
                    conflict.resolved_at,
                    conflict.resolution_strategy,
                    conflict.evidence_ref,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_conflicts(&mut self) -> MafResult<Vec<ReservationConflict>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id, file_path, conflicting_agent, existing_agent, conflict_type, severity, status, detected_at, resolved_at, resolution_strategy, evidence_ref FROM reservation_conflicts")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                let severity_str: String = row.get(5)?;
                let status_str: String = row.get(6)?;
                Ok(ReservationConflict {
                    id: row.get(0)?,
                    file_path: row.get(1)?,
                    conflicting_agent: row.get(2)?,
                    existing_agent: row.get(3)?,
                    conflict_type: row.get(4)?,
                    severity: parse_conflict_severity(&severity_str),
                    status: parse_conflict_status(&status_str),
                    detected_at: row.get(7)?,
                    resolved_at: row.get(8)?,
                    resolution_strategy: row.get(9)?,
                    evidence_ref: row.get(10)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<_, _>>().map_err(sql_err)
    }

    fn ensure_channel(&mut self, name: &str) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO escalation_channels (name) VALUES (?1)",
                params![name],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn channel_exists(&mut self, name: &str) -> MafResult<bool> {
        let count: i64 = self
            .tx
            .query_row(
                "SELECT COUNT(1) FROM escalation_channels WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count > 0)
    }

    fn next_envelope_id(&mut self) -> MafResult<i64> {
        self.tx
            .query_row(
                "SELECT COALESCE(MAX(id), 0) + 1 FROM escalation_envelopes",
                [],
                |row| row.get(0),
            )
            .map_err(sql_err)
    }

    fn append_envelope(&mut self, envelope: &EscalationEnvelope) -> MafResult<()> {
        self.tx
            .execute(
                "INSERT INTO escalation_envelopes (id, kind, from_agent, to_channel, created_at, payload, read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    envelope.id,
                    envelope_kind_str(envelope.kind),
                    envelope.from_agent,
                    envelope.to_channel,
                    envelope.created_at,
                    envelope.payload.to_string(),
                    envelope.read as i64,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn list_envelopes(&mut self, channel: &str) -> MafResult<Vec<EscalationEnvelope>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id, kind, from_agent, to_channel, created_at, payload, read FROM escalation_envelopes WHERE to_channel = ?1 ORDER BY created_at ASC, id ASC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![channel], |row| {
                let kind_str: String = row.get(1)?;
                let read_int: i64 = row.get(6)?;
                Ok(EscalationEnvelope {
                    id: row.get(0)?,
                    kind: parse_envelope_kind(&kind_str),
                    from_agent: row.get(2)?,
                    to_channel: row.get(3)?,
                    created_at: row.get(4)?,
                    payload: serde_json::from_str(&row.get::<_, String>(5)?)
                        .unwrap_or(serde_json::Value::Null),
                    read: read_int != 0,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<_, _>>().map_err(sql_err)
    }

    fn mark_envelope_read(&mut self, channel: &str, message_id: i64) -> MafResult<()> {
        self.tx
            .execute(
                "UPDATE escalation_envelopes SET read = 1 WHERE to_channel = ?1 AND id = ?2",
                params![channel, message_id],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}

/// A column held a string that matches none of an enum's known variants.
/// Wrapped so the row-mapping closure can propagate it with `?` and
/// `sql_err` then surfaces it as `MafError::Fatal` rather than silently
/// aliasing the value to a valid-looking variant.
fn unknown_enum_value(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(
        0,
        format!("unknown {column}: {value}"),
        rusqlite::types::Type::Text,
    )
}

fn parse_task_state(s: &str) -> rusqlite::Result<TaskState> {
    Ok(match s {
        "READY" => TaskState::Ready,
        "LEASED" => TaskState::Leased,
        "RUNNING" => TaskState::Running,
        "VERIFYING" => TaskState::Verifying,
        "COMMITTED" => TaskState::Committed,
        "ROLLBACK" => TaskState::Rollback,
        "DONE" => TaskState::Done,
        "DEAD" => TaskState::Dead,
        other => return Err(unknown_enum_value("task state", other)),
    })
}

fn parse_reservation_status(s: &str) -> rusqlite::Result<ReservationStatus> {
    Ok(match s {
        "active" => ReservationStatus::Active,
        "expired" => ReservationStatus::Expired,
        "released" => ReservationStatus::Released,
        other => return Err(unknown_enum_value("reservation status", other)),
    })
}

fn reservation_status_str(s: ReservationStatus) -> &'static str {
    match s {
        ReservationStatus::Active => "active",
        ReservationStatus::Expired => "expired",
        ReservationStatus::Released => "released",
    }
}

fn parse_agent_type(s: &str) -> rusqlite::Result<AgentType> {
    Ok(match s {
        "coordinator" => AgentType::Coordinator,
        "worker" => AgentType::Worker,
        "verifier" => AgentType::Verifier,
        "escalation_manager" => AgentType::EscalationManager,
        other => return Err(unknown_enum_value("agent type", other)),
    })
}

fn agent_type_str(t: AgentType) -> &'static str {
    match t {
        AgentType::Coordinator => "coordinator",
        AgentType::Worker => "worker",
        AgentType::Verifier => "verifier",
        AgentType::EscalationManager => "escalation_manager",
    }
}

fn parse_agent_status(s: &str) -> rusqlite::Result<AgentStatus> {
    Ok(match s {
        "active" => AgentStatus::Active,
        "inactive" => AgentStatus::Inactive,
        "maintenance" => AgentStatus::Maintenance,
        "error" => AgentStatus::Error,
        other => return Err(unknown_enum_value("agent status", other)),
    })
}

fn agent_status_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Active => "active",
        AgentStatus::Inactive => "inactive",
        AgentStatus::Maintenance => "maintenance",
        AgentStatus::Error => "error",
    }
}

fn event_kind_str(k: EventKind) -> &'static str {
    match k {
        EventKind::Created => "CREATED",
        EventKind::Claimed => "CLAIMED",
        EventKind::Running => "RUNNING",
        EventKind::Verifying => "VERIFYING",
        EventKind::Committed => "COMMITTED",
        EventKind::Rollback => "ROLLBACK",
        EventKind::Done => "DONE",
        EventKind::Dead => "DEAD",
        EventKind::Released => "RELEASED",
        EventKind::HeartbeatRenewFailure => "HEARTBEAT_RENEW_FAILURE",
        EventKind::HeartbeatMissed => "HEARTBEAT_MISSED",
        EventKind::LeaseExpired => "LEASE_EXPIRED",
        EventKind::Error => "ERROR",
        EventKind::ReservationCreated => "RESERVATION_CREATED",
        EventKind::ReservationReleased => "RESERVATION_RELEASED",
        EventKind::ReservationConflict => "RESERVATION_CONFLICT",
        EventKind::EscalationSent => "ESCALATION_SENT",
        EventKind::EscalationRead => "ESCALATION_READ",
        EventKind::Override => "OVERRIDE",
        EventKind::LegacyImport => "LEGACY_IMPORT",
    }
}

fn parse_event_kind(s: &str) -> rusqlite::Result<EventKind> {
    Ok(match s {
        "CREATED" => EventKind::Created,
        "CLAIMED" => EventKind::Claimed,
        "RUNNING" => EventKind::Running,
        "VERIFYING" => EventKind::Verifying,
        "COMMITTED" => EventKind::Committed,
        "ROLLBACK" => EventKind::Rollback,
        "DONE" => EventKind::Done,
        "DEAD" => EventKind::Dead,
        "RELEASED" => EventKind::Released,
        "HEARTBEAT_RENEW_FAILURE" => EventKind::HeartbeatRenewFailure,
        "HEARTBEAT_MISSED" => EventKind::HeartbeatMissed,
        "LEASE_EXPIRED" => EventKind::LeaseExpired,
        "RESERVATION_CREATED" => EventKind::ReservationCreated,
        "RESERVATION_RELEASED" => EventKind::ReservationReleased,
        "RESERVATION_CONFLICT" => EventKind::ReservationConflict,
        "ESCALATION_SENT" => EventKind::EscalationSent,
        "ESCALATION_READ" => EventKind::EscalationRead,
        "OVERRIDE" => EventKind::Override,
        "ERROR" => EventKind::Error,
        "LEGACY_IMPORT" => EventKind::LegacyImport,
        other => return Err(unknown_enum_value("event kind", other)),
    })
}

fn verifier_result_str(r: VerifierResult) -> &'static str {
    match r {
        VerifierResult::Pass => "PASS",
        VerifierResult::Fail => "FAIL",
    }
}

fn parse_verifier_result(s: &str) -> VerifierResult {
    match s {
        "PASS" => VerifierResult::Pass,
        _ => VerifierResult::Fail,
    }
}

fn conflict_severity_str(s: ConflictSeverity) -> &'static str {
    match s {
        ConflictSeverity::Info => "info",
        ConflictSeverity::Warning => "warning",
        ConflictSeverity::Blocking => "blocking",
    }
}

fn parse_conflict_severity(s: &str) -> ConflictSeverity {
    match s {
        "info" => ConflictSeverity::Info,
        "warning" => ConflictSeverity::Warning,
        _ => ConflictSeverity::Blocking,
    }
}

fn conflict_status_str(s: ConflictStatus) -> &'static str {
    match s {
        ConflictStatus::Open => "Open",
        ConflictStatus::Resolved => "Resolved",
    }
}

fn parse_conflict_status(s: &str) -> ConflictStatus {
    match s {
        "Resolved" => ConflictStatus::Resolved,
        _ => ConflictStatus::Open,
    }
}

fn envelope_kind_str(k: EnvelopeKind) -> &'static str {
    match k {
        EnvelopeKind::PreflightCheck => "PREFLIGHT_CHECK",
        EnvelopeKind::PreflightResult => "PREFLIGHT_RESULT",
        EnvelopeKind::ReservationConflict => "RESERVATION_CONFLICT",
        EnvelopeKind::EscalationRequest => "ESCALATION_REQUEST",
        EnvelopeKind::EscalationResponse => "ESCALATION_RESPONSE",
    }
}

fn parse_envelope_kind(s: &str) -> EnvelopeKind {
    match s {
        "PREFLIGHT_CHECK" => EnvelopeKind::PreflightCheck,
        "PREFLIGHT_RESULT" => EnvelopeKind::PreflightResult,
        "RESERVATION_CONFLICT" => EnvelopeKind::ReservationConflict,
        "ESCALATION_RESPONSE" => EnvelopeKind::EscalationResponse,
        _ => EnvelopeKind::EscalationRequest,
    }
}
