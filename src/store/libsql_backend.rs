//! libSQL backend: async `Database` implementation.
//!
//! The backend keeps one shared connection for auto-committing statements.
//! Every transaction opens its own connection with `BEGIN IMMEDIATE`, so two
//! transactions never share a connection and SQLite serializes writers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::model::{Agent, AgentHealth, AgentSession, AgentStatus, SessionStatus};
use crate::attempts::model::{Attempt, AttemptOutcome, OutcomeRecord};
use crate::error::DatabaseError;
use crate::events::{CompletionEntry, Event, EventType};
use crate::ops::model::{OutcomeListing, OutcomeSummary};
use crate::store::migrations;
use crate::store::traits::{Database, Store, StoreTransaction};
use crate::tasks::model::{Task, TaskStatus};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = open_connection(&db)?;
        if let Err(e) = conn.query("PRAGMA journal_mode=WAL", ()).await {
            warn!(error = %e, "Could not enable WAL journal mode");
        }

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }
}

/// Open a connection with the busy timeout applied.
fn open_connection(db: &LibSqlDatabase) -> Result<Connection, DatabaseError> {
    let conn = db
        .connect()
        .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
    Ok(conn)
}

/// An open `BEGIN IMMEDIATE` transaction on a dedicated connection.
pub struct LibSqlTransaction {
    tx: libsql::Transaction,
}

/// Anything that can hand out a libSQL connection to run statements on.
pub trait LibSqlConn: Send + Sync {
    fn conn(&self) -> &Connection;
}

impl LibSqlConn for LibSqlBackend {
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl LibSqlConn for LibSqlTransaction {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError> {
        let conn = open_connection(&self.db)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("begin transaction: {e}")))?;
        Ok(Box::new(LibSqlTransaction { tx }))
    }
}

#[async_trait]
impl StoreTransaction for LibSqlTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx
            .commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DatabaseError::Query(format!("rollback: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed microsecond precision so that lexical
/// order of the stored strings matches chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Option<Uuid> {
    s.filter(|s| !s.is_empty())
        .and_then(|s| Uuid::parse_str(&s).ok())
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn get_text(row: &libsql::Row, idx: i32, field: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn get_int(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

// ── Row mapping ─────────────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, title, description, priority, status, assigned_agent_id, due_date, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id = parse_uuid(&get_text(row, 0, "task.id")?, "task.id")?;
    let priority: String = row.get(3).unwrap_or_else(|_| "normal".to_string());
    let status: String = row.get(4).unwrap_or_else(|_| "inbox".to_string());

    Ok(Task {
        id,
        title: get_text(row, 1, "task.title")?,
        description: row.get::<String>(2).ok().filter(|s| !s.is_empty()),
        priority: priority.parse().unwrap_or_default(),
        status: status.parse().unwrap_or_default(),
        assigned_agent_id: parse_optional_uuid(row.get(5).ok()),
        due_date: parse_optional_datetime(row.get(6).ok()),
        created_at: parse_datetime(&get_text(row, 7, "task.created_at")?),
        updated_at: parse_datetime(&get_text(row, 8, "task.updated_at")?),
    })
}

const AGENT_COLUMNS: &str =
    "id, name, status, runtime_name, soul_md, user_md, agents_md, created_at, updated_at";

fn row_to_agent(row: &libsql::Row) -> Result<Agent, DatabaseError> {
    let id = parse_uuid(&get_text(row, 0, "agent.id")?, "agent.id")?;
    let status: String = row.get(2).unwrap_or_else(|_| "standby".to_string());

    Ok(Agent {
        id,
        name: get_text(row, 1, "agent.name")?,
        status: status.parse().unwrap_or_default(),
        runtime_name: row.get(3).ok(),
        soul_md: row.get(4).ok(),
        user_md: row.get(5).ok(),
        agents_md: row.get(6).ok(),
        created_at: parse_datetime(&get_text(row, 7, "agent.created_at")?),
        updated_at: parse_datetime(&get_text(row, 8, "agent.updated_at")?),
    })
}

const SESSION_COLUMNS: &str = "id, agent_id, session_id, channel, status, created_at, updated_at";

fn row_to_session(row: &libsql::Row) -> Result<AgentSession, DatabaseError> {
    let status: String = row.get(4).unwrap_or_else(|_| "active".to_string());
    Ok(AgentSession {
        id: parse_uuid(&get_text(row, 0, "session.id")?, "session.id")?,
        agent_id: parse_uuid(&get_text(row, 1, "session.agent_id")?, "session.agent_id")?,
        session_id: get_text(row, 2, "session.session_id")?,
        channel: get_text(row, 3, "session.channel")?,
        status: status.parse().unwrap_or(SessionStatus::Ended),
        created_at: parse_datetime(&get_text(row, 5, "session.created_at")?),
        updated_at: parse_datetime(&get_text(row, 6, "session.updated_at")?),
    })
}

const ATTEMPT_COLUMNS: &str = "id, task_id, attempt_number, agent_id, auto_retry, selection_score, dispatched_at, completed_at, outcome, error";

fn row_to_attempt(row: &libsql::Row) -> Result<Attempt, DatabaseError> {
    let outcome = row
        .get::<String>(8)
        .ok()
        .map(|s| s.parse::<AttemptOutcome>())
        .transpose()
        .map_err(DatabaseError::Serialization)?;

    Ok(Attempt {
        id: parse_uuid(&get_text(row, 0, "attempt.id")?, "attempt.id")?,
        task_id: parse_uuid(&get_text(row, 1, "attempt.task_id")?, "attempt.task_id")?,
        attempt_number: get_int(row, 2) as u32,
        agent_id: parse_uuid(&get_text(row, 3, "attempt.agent_id")?, "attempt.agent_id")?,
        auto_retry: get_int(row, 4) != 0,
        selection_score: row.get::<f64>(5).ok(),
        dispatched_at: parse_datetime(&get_text(row, 6, "attempt.dispatched_at")?),
        completed_at: parse_optional_datetime(row.get(7).ok()),
        outcome,
        error: row.get(9).ok(),
    })
}

const OUTCOME_COLUMNS: &str = "id, task_id, final_status, attempts, last_agent_id, created_at";

fn row_to_outcome(row: &libsql::Row) -> Result<OutcomeRecord, DatabaseError> {
    let final_status = get_text(row, 2, "outcome.final_status")?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    Ok(OutcomeRecord {
        id: parse_uuid(&get_text(row, 0, "outcome.id")?, "outcome.id")?,
        task_id: parse_uuid(&get_text(row, 1, "outcome.task_id")?, "outcome.task_id")?,
        final_status,
        attempts: get_int(row, 3) as u32,
        last_agent_id: parse_uuid(
            &get_text(row, 4, "outcome.last_agent_id")?,
            "outcome.last_agent_id",
        )?,
        created_at: parse_datetime(&get_text(row, 5, "outcome.created_at")?),
    })
}

// ── Store implementation ────────────────────────────────────────────

#[async_trait]
impl<T: LibSqlConn> Store for T {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    task.id.to_string(),
                    task.title.as_str(),
                    opt_text(task.description.clone()),
                    task.priority.to_string(),
                    task.status.to_string(),
                    opt_text(task.assigned_agent_id.map(|id| id.to_string())),
                    opt_text(task.due_date.map(|d| ts(&d))),
                    ts(&task.created_at),
                    ts(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(task_id = %task.id, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn assign_task(
        &self,
        id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET assigned_agent_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![agent_id.to_string(), ts(&now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("assign_task: {e}")))?;
        Ok(())
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), ts(&now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_status: {e}")))?;
        Ok(())
    }

    async fn find_live_task_for_agent(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE assigned_agent_id = ?1 AND status IN ('assigned', 'in_progress') \
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![agent_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_live_task_for_agent: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_live_task_for_agent row: {e}"))),
        }
    }

    // ── Agents ──────────────────────────────────────────────────────

    async fn insert_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO agents ({AGENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    agent.id.to_string(),
                    agent.name.as_str(),
                    agent.status.to_string(),
                    opt_text(agent.runtime_name.clone()),
                    opt_text(agent.soul_md.clone()),
                    opt_text(agent.user_md.clone()),
                    opt_text(agent.agents_md.clone()),
                    ts(&agent.created_at),
                    ts(&agent.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_agent: {e}")))?;
        debug!(agent_id = %agent.id, name = %agent.name, "Agent inserted");
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_agent(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_agent row: {e}"))),
        }
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at ASC, id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_agents: {e}")))?;

        let mut agents = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_agents row: {e}")))?
        {
            agents.push(row_to_agent(&row)?);
        }
        Ok(agents)
    }

    async fn list_dispatchable_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE status != ?1 \
                     ORDER BY created_at ASC, id ASC"
                ),
                params![AgentStatus::Offline.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatchable_agents: {e}")))?;

        let mut agents = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatchable_agents row: {e}")))?
        {
            agents.push(row_to_agent(&row)?);
        }
        Ok(agents)
    }

    async fn update_agent_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), ts(&now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_agent_status: {e}")))?;
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &AgentSession) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO agent_sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    session.id.to_string(),
                    session.agent_id.to_string(),
                    session.session_id.as_str(),
                    session.channel.as_str(),
                    session.status.to_string(),
                    ts(&session.created_at),
                    ts(&session.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_session: {e}")))?;
        Ok(())
    }

    async fn find_active_session_for_agent(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<AgentSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM agent_sessions \
                     WHERE agent_id = ?1 AND status = 'active' \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![agent_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_active_session_for_agent: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_active_session_for_agent row: {e}"
            ))),
        }
    }

    async fn find_active_session(
        &self,
        session_id: &str,
    ) -> Result<Option<AgentSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM agent_sessions \
                     WHERE session_id = ?1 AND status = 'active' \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_active_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_active_session row: {e}"))),
        }
    }

    // ── Attempts ────────────────────────────────────────────────────

    async fn insert_attempt_if_absent(&self, attempt: &Attempt) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO task_attempts \
                 (id, task_id, attempt_number, agent_id, auto_retry, selection_score, dispatched_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attempt.id.to_string(),
                    attempt.task_id.to_string(),
                    attempt.attempt_number as i64,
                    attempt.agent_id.to_string(),
                    attempt.auto_retry as i64,
                    opt_real(attempt.selection_score),
                    ts(&attempt.dispatched_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_attempt_if_absent: {e}")))?;
        Ok(changed > 0)
    }

    async fn close_attempt(
        &self,
        id: Uuid,
        outcome: AttemptOutcome,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE task_attempts SET completed_at = ?1, outcome = ?2, error = ?3 \
                 WHERE id = ?4 AND completed_at IS NULL",
                params![
                    ts(&completed_at),
                    outcome.to_string(),
                    opt_text(error.map(str::to_string)),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("close_attempt: {e}")))?;
        Ok(changed > 0)
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM task_attempts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_attempt(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_attempt row: {e}"))),
        }
    }

    async fn find_open_attempt(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM task_attempts \
                     WHERE task_id = ?1 AND agent_id = ?2 AND completed_at IS NULL \
                     ORDER BY attempt_number DESC LIMIT 1"
                ),
                params![task_id.to_string(), agent_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_open_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_attempt(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_open_attempt row: {e}"))),
        }
    }

    async fn find_open_attempt_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM task_attempts \
                     WHERE task_id = ?1 AND completed_at IS NULL \
                     ORDER BY attempt_number DESC LIMIT 1"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_open_attempt_for_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_attempt(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_open_attempt_for_task row: {e}"
            ))),
        }
    }

    async fn find_latest_closed_attempt(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM task_attempts \
                     WHERE task_id = ?1 AND agent_id = ?2 AND completed_at IS NOT NULL \
                     ORDER BY completed_at DESC, attempt_number DESC LIMIT 1"
                ),
                params![task_id.to_string(), agent_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_latest_closed_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_attempt(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_latest_closed_attempt row: {e}"
            ))),
        }
    }

    async fn count_attempts(&self, task_id: Uuid) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM task_attempts WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_attempts: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(get_int(&row, 0) as u32),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_attempts row: {e}"))),
        }
    }

    async fn list_attempts(&self, task_id: Uuid) -> Result<Vec<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM task_attempts \
                     WHERE task_id = ?1 ORDER BY attempt_number ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts: {e}")))?;

        let mut attempts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts row: {e}")))?
        {
            attempts.push(row_to_attempt(&row)?);
        }
        Ok(attempts)
    }

    async fn list_task_agent_ids(&self, task_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT agent_id FROM task_attempts WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_agent_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_agent_ids row: {e}")))?
        {
            ids.push(parse_uuid(&get_text(&row, 0, "attempt.agent_id")?, "attempt.agent_id")?);
        }
        Ok(ids)
    }

    async fn recent_closed_outcomes(
        &self,
        agent_id: Uuid,
        limit: u32,
    ) -> Result<Vec<AttemptOutcome>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT outcome FROM task_attempts \
                 WHERE agent_id = ?1 AND completed_at IS NOT NULL \
                 ORDER BY completed_at DESC LIMIT ?2",
                params![agent_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_closed_outcomes: {e}")))?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_closed_outcomes row: {e}")))?
        {
            // A closed row with an unreadable outcome counts against the agent.
            let outcome = row
                .get::<String>(0)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(AttemptOutcome::Failed);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    // ── Agent health ────────────────────────────────────────────────

    async fn get_agent_health(&self, agent_id: Uuid) -> Result<Option<AgentHealth>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT total_success, total_failure, is_degraded, updated_at \
                 FROM agent_stats WHERE agent_id = ?1",
                params![agent_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent_health: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(AgentHealth {
                agent_id,
                total_success: get_int(&row, 0).max(0) as u64,
                total_failure: get_int(&row, 1).max(0) as u64,
                is_degraded: get_int(&row, 2) != 0,
                updated_at: parse_optional_datetime(row.get(3).ok()),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_agent_health row: {e}"))),
        }
    }

    async fn increment_agent_health(
        &self,
        agent_id: Uuid,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let (success, failure) = match outcome {
            AttemptOutcome::Success => (1_i64, 0_i64),
            AttemptOutcome::Failed => (0, 1),
        };
        self.conn()
            .execute(
                "INSERT INTO agent_stats (agent_id, total_success, total_failure, is_degraded, updated_at) \
                 VALUES (?1, ?2, ?3, 0, ?4) \
                 ON CONFLICT(agent_id) DO UPDATE SET \
                   total_success = total_success + excluded.total_success, \
                   total_failure = total_failure + excluded.total_failure, \
                   updated_at = excluded.updated_at",
                params![agent_id.to_string(), success, failure, ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_agent_health: {e}")))?;
        Ok(())
    }

    async fn set_agent_degraded(
        &self,
        agent_id: Uuid,
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE agent_stats SET is_degraded = ?1, updated_at = ?2 WHERE agent_id = ?3",
                params![degraded as i64, ts(&now), agent_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_agent_degraded: {e}")))?;
        Ok(())
    }

    // ── Outcomes ────────────────────────────────────────────────────

    async fn insert_outcome_if_absent(
        &self,
        outcome: &OutcomeRecord,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!("INSERT OR IGNORE INTO task_outcomes ({OUTCOME_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    outcome.id.to_string(),
                    outcome.task_id.to_string(),
                    outcome.final_status.to_string(),
                    outcome.attempts as i64,
                    outcome.last_agent_id.to_string(),
                    ts(&outcome.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_outcome_if_absent: {e}")))?;
        Ok(changed > 0)
    }

    async fn get_outcome(&self, task_id: Uuid) -> Result<Option<OutcomeRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {OUTCOME_COLUMNS} FROM task_outcomes WHERE task_id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_outcome: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outcome(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_outcome row: {e}"))),
        }
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(&self, event: &Event) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO events (id, type, agent_id, task_id, message, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.to_string(),
                    event.event_type.to_string(),
                    opt_text(event.agent_id.map(|id| id.to_string())),
                    opt_text(event.task_id.map(|id| id.to_string())),
                    event.message.as_str(),
                    ts(&event.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;
        debug!(event_type = %event.event_type, "Event appended");
        Ok(())
    }

    async fn recent_events(
        &self,
        event_type: EventType,
        limit: u32,
    ) -> Result<Vec<CompletionEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT e.id, e.type, e.agent_id, e.task_id, e.message, e.created_at, a.name, t.title \
                 FROM events e \
                 LEFT JOIN agents a ON e.agent_id = a.id \
                 LEFT JOIN tasks t ON e.task_id = t.id \
                 WHERE e.type = ?1 \
                 ORDER BY e.created_at DESC LIMIT ?2",
                params![event_type.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_events: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_events row: {e}")))?
        {
            let event = Event {
                id: parse_uuid(&get_text(&row, 0, "event.id")?, "event.id")?,
                event_type: get_text(&row, 1, "event.type")?
                    .parse()
                    .map_err(DatabaseError::Serialization)?,
                agent_id: parse_optional_uuid(row.get(2).ok()),
                task_id: parse_optional_uuid(row.get(3).ok()),
                message: get_text(&row, 4, "event.message")?,
                created_at: parse_datetime(&get_text(&row, 5, "event.created_at")?),
            };
            entries.push(CompletionEntry {
                event,
                agent_name: row.get(6).ok(),
                task_title: row.get(7).ok(),
            });
        }
        Ok(entries)
    }

    // ── Ops reporting ───────────────────────────────────────────────

    async fn outcome_summary(&self) -> Result<OutcomeSummary, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(DISTINCT task_id), COUNT(*), \
                   COUNT(CASE WHEN final_status = 'success' THEN 1 END), \
                   COUNT(CASE WHEN attempts > 1 THEN 1 END), \
                   AVG(attempts) \
                 FROM task_outcomes",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("outcome_summary: {e}")))?;

        let mut summary = match rows.next().await {
            Ok(Some(row)) => OutcomeSummary {
                total_tasks: get_int(&row, 0) as u64,
                total_outcomes: get_int(&row, 1) as u64,
                successes: get_int(&row, 2) as u64,
                retried: get_int(&row, 3) as u64,
                // AVG() is NULL on an empty table.
                avg_attempts: row.get::<f64>(4).unwrap_or(0.0),
                degraded_agents: 0,
            },
            Ok(None) => OutcomeSummary::default(),
            Err(e) => return Err(DatabaseError::Query(format!("outcome_summary row: {e}"))),
        };

        let mut rows = conn
            .query("SELECT COUNT(*) FROM agent_stats WHERE is_degraded = 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("outcome_summary degraded: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            summary.degraded_agents = get_int(&row, 0) as u64;
        }
        Ok(summary)
    }

    async fn list_outcomes(&self, limit: u32) -> Result<Vec<OutcomeListing>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT o.task_id, o.final_status, o.attempts, o.last_agent_id, o.created_at, a.name, t.title \
                 FROM task_outcomes o \
                 LEFT JOIN agents a ON o.last_agent_id = a.id \
                 LEFT JOIN tasks t ON o.task_id = t.id \
                 ORDER BY o.created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_outcomes: {e}")))?;

        let mut listings = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_outcomes row: {e}")))?
        {
            listings.push(OutcomeListing {
                task_id: parse_uuid(&get_text(&row, 0, "outcome.task_id")?, "outcome.task_id")?,
                final_status: get_text(&row, 1, "outcome.final_status")?
                    .parse()
                    .map_err(DatabaseError::Serialization)?,
                attempts: get_int(&row, 2) as u32,
                last_agent_id: parse_uuid(
                    &get_text(&row, 3, "outcome.last_agent_id")?,
                    "outcome.last_agent_id",
                )?,
                created_at: parse_datetime(&get_text(&row, 4, "outcome.created_at")?),
                agent_name: row.get(5).ok(),
                task_title: row.get(6).ok(),
            });
        }
        Ok(listings)
    }

    async fn retry_distribution(&self) -> Result<Vec<(u32, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT attempts, COUNT(*) FROM task_outcomes GROUP BY attempts ORDER BY attempts",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_distribution: {e}")))?;

        let mut buckets = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_distribution row: {e}")))?
        {
            buckets.push((get_int(&row, 0) as u32, get_int(&row, 1) as u64));
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::test_db;

    #[tokio::test]
    async fn task_roundtrip() {
        let (_dir, db) = test_db().await;
        let agent = Agent::new("Builder");
        db.insert_agent(&agent).await.unwrap();

        let task = Task::new("Ship it")
            .with_description("all of it")
            .assigned_to(agent.id);
        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Ship it");
        assert_eq!(fetched.description.as_deref(), Some("all of it"));
        assert_eq!(fetched.status, TaskStatus::Assigned);
        assert_eq!(fetched.assigned_agent_id, Some(agent.id));
        assert!(fetched.due_date.is_none());
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let (_dir, db) = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dispatchable_agents_skip_offline() {
        let (_dir, db) = test_db().await;
        let a = Agent::new("A");
        let b = Agent::new("B").with_status(AgentStatus::Offline);
        let c = Agent::new("C").with_status(AgentStatus::Working);
        for agent in [&a, &b, &c] {
            db.insert_agent(agent).await.unwrap();
        }

        let ids: Vec<Uuid> = db
            .list_dispatchable_agents()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&c.id));
        assert!(!ids.contains(&b.id));
        assert_eq!(db.list_agents().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn live_task_prefers_most_recently_updated() {
        let (_dir, db) = test_db().await;
        let agent = Agent::new("A");
        db.insert_agent(&agent).await.unwrap();

        let older = Task::new("older").assigned_to(agent.id);
        let newer = Task::new("newer").assigned_to(agent.id);
        let mut finished = Task::new("finished").assigned_to(agent.id);
        finished.status = TaskStatus::Done;
        for task in [&older, &newer, &finished] {
            db.insert_task(task).await.unwrap();
        }
        db.update_task_status(newer.id, TaskStatus::InProgress, Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let live = db.find_live_task_for_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(live.id, newer.id);
        assert!(db.find_live_task_for_agent(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn health_increments_create_row_lazily() {
        let (_dir, db) = test_db().await;
        let agent_id = Uuid::new_v4();
        assert!(db.get_agent_health(agent_id).await.unwrap().is_none());

        db.increment_agent_health(agent_id, AttemptOutcome::Success, Utc::now())
            .await
            .unwrap();
        db.increment_agent_health(agent_id, AttemptOutcome::Failed, Utc::now())
            .await
            .unwrap();
        db.increment_agent_health(agent_id, AttemptOutcome::Success, Utc::now())
            .await
            .unwrap();

        let health = db.get_agent_health(agent_id).await.unwrap().unwrap();
        assert_eq!(health.total_success, 2);
        assert_eq!(health.total_failure, 1);
        assert!(!health.is_degraded);

        db.set_agent_degraded(agent_id, true, Utc::now()).await.unwrap();
        assert!(db.get_agent_health(agent_id).await.unwrap().unwrap().is_degraded);
    }

    #[tokio::test]
    async fn session_lookup_by_agent_and_id() {
        let (_dir, db) = test_db().await;
        let agent = Agent::new("Research Team");
        db.insert_agent(&agent).await.unwrap();
        let session = AgentSession::for_agent(&agent);
        db.insert_session(&session).await.unwrap();

        let by_agent = db.find_active_session_for_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(by_agent.session_id, "console-research-team");
        let by_id = db.find_active_session("console-research-team").await.unwrap().unwrap();
        assert_eq!(by_id.agent_id, agent.id);
        assert!(db.find_active_session("console-nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_no_trace() {
        let (_dir, db) = test_db().await;
        let task = Task::new("t");

        let tx = db.begin().await.unwrap();
        tx.insert_task(&task).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(db.get_task(task.id).await.unwrap().is_none());

        let tx = db.begin().await.unwrap();
        tx.insert_task(&task).await.unwrap();
        tx.commit().await.unwrap();
        assert!(db.get_task(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn completion_events_join_names() {
        let (_dir, db) = test_db().await;
        let agent = Agent::new("Writer");
        db.insert_agent(&agent).await.unwrap();
        let task = Task::new("Essay").assigned_to(agent.id);
        db.insert_task(&task).await.unwrap();

        db.append_event(
            &Event::new(EventType::TaskCompleted, "Writer completed: essay")
                .with_agent(agent.id)
                .with_task(task.id),
        )
        .await
        .unwrap();
        db.append_event(&Event::new(EventType::TaskDispatched, "ignored"))
            .await
            .unwrap();

        let entries = db.recent_events(EventType::TaskCompleted, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].agent_name.as_deref(), Some("Writer"));
        assert_eq!(entries[0].task_title.as_deref(), Some("Essay"));
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::microseconds(1);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_datetime(&ts(&a)).timestamp_micros(), a.timestamp_micros());
    }
}
