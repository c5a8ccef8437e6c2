//! libSQL backend: durable `Store` implementation.
//!
//! Supports local file and in-memory databases. All operations go through a
//! single connection guarded by an async gate, so a commit's transaction
//! never interleaves with another statement.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CommitError, DatabaseError};
use crate::model::{LogDetails, LogEntry, Task, TaskStatus, Worker};
use crate::store::memory::plan_capacity;
use crate::store::migrations;
use crate::store::traits::{CapacityChange, Commit, Store, TaskQuery};

/// libSQL store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: Mutex<()>,
}

impl LibSqlStore {
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

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: Mutex::new(()),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width so that string comparison in SQL
/// matches chronological order.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("invalid datetime: {s:?}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Parse a text column into one of the model enums.
fn parse_column<T>(column: &str, raw: &str) -> Result<T, DatabaseError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

/// Read a non-null text column.
fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

/// Read a non-null integer column.
fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn skills_to_json(skills: &BTreeMap<String, u32>) -> Result<String, DatabaseError> {
    serde_json::to_string(skills).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn skills_from_json(s: &str) -> Result<BTreeMap<String, u32>, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("skills: {e}")))
}

const WORKER_COLUMNS: &str =
    "id, name, skills, max_concurrent, current_ongoing, availability, experience, updated_at";

const TASK_COLUMNS: &str = "id, name, task_type, required_skills, status, assigned_worker, priority, due_at, created_at, started_at, completed_at, reassigned_count, version";

fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    let skills: String = text(row, 2)?;
    let availability: String = text(row, 5)?;
    let experience: String = text(row, 6)?;
    let updated: String = text(row, 7)?;

    Ok(Worker {
        id: text(row, 0)?,
        name: text(row, 1)?,
        skills: skills_from_json(&skills)?,
        max_concurrent: int(row, 3)?.max(1) as u32,
        current_ongoing: int(row, 4)?.max(0) as u32,
        availability: parse_column("availability", &availability)?,
        experience: parse_column("experience", &experience)?,
        updated_at: parse_datetime(&updated)?,
    })
}

/// Map a task row. The log is loaded separately.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let skills: String = text(row, 3)?;
    let status: String = text(row, 4)?;
    let priority: String = text(row, 6)?;
    let due: String = text(row, 7)?;
    let created: String = text(row, 8)?;
    let started: Option<String> = row.get(9).ok();
    let completed: Option<String> = row.get(10).ok();

    Ok(Task {
        id: text(row, 0)?,
        name: text(row, 1)?,
        task_type: row.get(2).ok(),
        required_skills: skills_from_json(&skills)?,
        status: parse_column("status", &status)?,
        assigned_worker: row.get(5).ok(),
        priority: parse_column("priority", &priority)?,
        due_at: parse_datetime(&due)?,
        created_at: parse_datetime(&created)?,
        started_at: parse_optional_datetime(started)?,
        completed_at: parse_optional_datetime(completed)?,
        reassigned_count: int(row, 11)?.max(0) as u32,
        version: int(row, 12)?.max(0) as u64,
        log: Vec::new(),
    })
}

fn row_to_log_entry(row: &libsql::Row) -> Result<LogEntry, DatabaseError> {
    let id: String = text(row, 0)?;
    let timestamp: String = text(row, 1)?;
    let action: String = text(row, 2)?;
    let details: String = text(row, 3)?;

    Ok(LogEntry {
        id: parse_column("log id", &id)?,
        timestamp: parse_datetime(&timestamp)?,
        action: parse_column("action", &action)?,
        details: serde_json::from_str::<LogDetails>(&details)
            .map_err(|e| DatabaseError::Serialization(format!("details: {e}")))?,
    })
}

async fn load_log(conn: &Connection, task_id: &str) -> Result<Vec<LogEntry>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT id, timestamp, action, details FROM task_log WHERE task_id = ?1 ORDER BY rowid",
            params![task_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("load_log: {e}")))?;

    let mut log = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("load_log: {e}")))?
    {
        log.push(row_to_log_entry(&row)?);
    }
    Ok(log)
}

async fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut task = row_to_task(&row)?;
    task.log = load_log(conn, id).await?;
    Ok(Some(task))
}

async fn load_worker(conn: &Connection, id: &str) -> Result<Option<Worker>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_worker: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_worker(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_worker: {e}"))),
    }
}

/// Body of a commit. Runs inside the caller's transaction.
async fn apply_commit(conn: &Connection, commit: &Commit) -> Result<Task, CommitError> {
    let task_id = commit.task.id.as_str();

    let mut rows = conn
        .query(
            "SELECT status, version FROM tasks WHERE id = ?1",
            params![task_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("commit read: {e}")))?;
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("commit read: {e}")))?
        .ok_or_else(|| CommitError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;

    let status: TaskStatus = parse_column("status", &text(&row, 0)?)?;
    let version = int(&row, 1)?.max(0) as u64;

    if status != commit.expected_status || version != commit.expected_version {
        return Err(CommitError::Conflict {
            task_id: task_id.to_string(),
            expected: commit.expected_status,
            expected_version: commit.expected_version,
            found: status,
            found_version: version,
        });
    }

    commit.check_transition()?;

    // Capacity guards are evaluated on a snapshot of the affected workers.
    let mut workers: HashMap<String, Worker> = HashMap::new();
    for change in &commit.capacity {
        let id = match change {
            CapacityChange::Grant(id) | CapacityChange::Release(id) => id,
        };
        if workers.contains_key(id) {
            continue;
        }
        if let Some(worker) = load_worker(conn, id).await? {
            workers.insert(id.clone(), worker);
        }
    }
    let touched = plan_capacity(&workers, &commit.capacity)?;

    let now = fmt_datetime(&commit.entry.timestamp);
    for worker in touched.values() {
        conn.execute(
            "UPDATE workers SET current_ongoing = ?1, updated_at = ?2 WHERE id = ?3",
            params![worker.current_ongoing as i64, now.clone(), worker.id.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("commit worker update: {e}")))?;
    }

    let task = &commit.task;
    conn.execute(
        "UPDATE tasks SET status = ?1, assigned_worker = ?2, started_at = ?3, completed_at = ?4,
             reassigned_count = ?5, due_at = ?6, version = version + 1
         WHERE id = ?7 AND version = ?8",
        params![
            task.status.as_str(),
            opt_text(task.assigned_worker.clone()),
            opt_text(task.started_at.as_ref().map(fmt_datetime)),
            opt_text(task.completed_at.as_ref().map(fmt_datetime)),
            task.reassigned_count as i64,
            fmt_datetime(&task.due_at),
            task_id,
            commit.expected_version as i64,
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("commit task update: {e}")))?;

    let details = serde_json::to_string(&commit.entry.details)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO task_log (id, task_id, timestamp, action, details) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            commit.entry.id.to_string(),
            task_id,
            now,
            commit.entry.action.to_string(),
            details,
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("commit log insert: {e}")))?;

    load_task(conn, task_id).await?.ok_or_else(|| CommitError::TaskNotFound {
        task_id: task_id.to_string(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        let _gate = self.gate.lock().await;
        load_task(&self.conn, id).await
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DatabaseError> {
        let _gate = self.gate.lock().await;
        load_worker(&self.conn, id).await
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?
        {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR due_at < ?2)
                     ORDER BY due_at, id"
                ),
                params![
                    opt_text(query.status.map(|s| s.as_str().to_string())),
                    opt_text(query.due_before.as_ref().map(fmt_datetime)),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query_tasks: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        drop(rows);

        for task in &mut tasks {
            task.log = load_log(&self.conn, &task.id).await?;
        }
        Ok(tasks)
    }

    async fn save_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        task_type = excluded.task_type,
                        required_skills = excluded.required_skills,
                        priority = excluded.priority,
                        due_at = excluded.due_at"
                ),
                params![
                    task.id.clone(),
                    task.name.clone(),
                    opt_text(task.task_type.clone()),
                    skills_to_json(&task.required_skills)?,
                    task.status.as_str(),
                    opt_text(task.assigned_worker.clone()),
                    task.priority.to_string(),
                    fmt_datetime(&task.due_at),
                    fmt_datetime(&task.created_at),
                    opt_text(task.started_at.as_ref().map(fmt_datetime)),
                    opt_text(task.completed_at.as_ref().map(fmt_datetime)),
                    task.reassigned_count as i64,
                    task.version as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_task: {e}")))?;

        debug!(task_id = %task.id, "Task saved");
        Ok(())
    }

    async fn save_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;

        let load = match load_worker(&self.conn, &worker.id).await? {
            Some(existing) => existing.current_ongoing,
            None => worker.current_ongoing,
        };
        if worker.max_concurrent < load {
            return Err(DatabaseError::Constraint(format!(
                "worker {}: max_concurrent {} below current load {}",
                worker.id, worker.max_concurrent, load
            )));
        }

        self.conn
            .execute(
                &format!(
                    "INSERT INTO workers ({WORKER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        skills = excluded.skills,
                        max_concurrent = excluded.max_concurrent,
                        availability = excluded.availability,
                        experience = excluded.experience,
                        updated_at = excluded.updated_at"
                ),
                params![
                    worker.id.clone(),
                    worker.name.clone(),
                    skills_to_json(&worker.skills)?,
                    worker.max_concurrent as i64,
                    worker.current_ongoing as i64,
                    worker.availability.to_string(),
                    worker.experience.to_string(),
                    fmt_datetime(&worker.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_worker: {e}")))?;

        debug!(worker_id = %worker.id, "Worker saved");
        Ok(())
    }

    async fn commit(&self, commit: &Commit) -> Result<Task, CommitError> {
        let _gate = self.gate.lock().await;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit begin: {e}")))?;

        match apply_commit(&tx, commit).await {
            Ok(task) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
                debug!(
                    task_id = %task.id,
                    version = task.version,
                    action = %commit.entry.action,
                    "Commit applied"
                );
                Ok(task)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(task_id = %commit.task.id, error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}
