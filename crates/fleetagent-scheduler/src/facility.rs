//! Persistent task-scheduling facility.
//!
//! Callers open a [`FacilitySession`] per operation; the session holds the
//! facility's connection and releases it when dropped, on every exit path.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{ScheduledTask, TaskAction, TaskError, Trigger};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Run history rows kept per task; older rows are trimmed on each new result.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "skipped")]
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskState {
    pub next_run_at: Option<NaiveDateTime>,
    pub last_run_at: Option<NaiveDateTime>,
    pub last_status: Option<RunStatus>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTask {
    pub task: ScheduledTask,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub task_name: String,
    pub started_at: NaiveDateTime,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Blocking facility handle. Async callers go through [`crate::TaskStore`].
pub trait TaskFacility: Send + Sync {
    fn connect(&self) -> Result<Box<dyn FacilitySession + '_>, TaskError>;
}

pub trait FacilitySession {
    /// Register a new task. Fails with `AlreadyExists` on a name collision.
    fn insert(
        &mut self,
        task: &ScheduledTask,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<(), TaskError>;

    fn get(&mut self, name: &str) -> Result<Option<RegisteredTask>, TaskError>;

    fn all(&mut self) -> Result<Vec<RegisteredTask>, TaskError>;

    fn set_enabled(
        &mut self,
        name: &str,
        enabled: bool,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<(), TaskError>;

    /// Record that the task fired (or was passed over) and when it fires next.
    fn set_schedule(
        &mut self,
        name: &str,
        last_run_at: Option<NaiveDateTime>,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<(), TaskError>;

    /// Store the outcome of a run on the task and in its history.
    fn record_result(&mut self, record: &RunRecord) -> Result<(), TaskError>;

    fn history(&mut self, name: &str, limit: usize) -> Result<Vec<RunRecord>, TaskError>;

    fn remove(&mut self, name: &str) -> Result<(), TaskError>;
}

/// SQLite-backed facility: task definitions and run state survive restarts.
pub struct SqliteFacility {
    conn: Mutex<Connection>,
}

impl SqliteFacility {
    pub fn open(db_path: &Path) -> Result<Self, TaskError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TaskError::Facility(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, TaskError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, TaskError> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TaskFacility for SqliteFacility {
    fn connect(&self) -> Result<Box<dyn FacilitySession + '_>, TaskError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| TaskError::Facility("facility connection poisoned".into()))?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession<'a> {
    conn: MutexGuard<'a, Connection>,
}

const TASK_COLUMNS: &str = "name, action, trigger_def, enabled, delete_after, parallel, run_asap, \
     next_run_at, last_run_at, last_status, last_duration_ms, last_error";

impl FacilitySession for SqliteSession<'_> {
    fn insert(
        &mut self,
        task: &ScheduledTask,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<(), TaskError> {
        let action = to_json(&task.action)?;
        let trigger = to_json(&task.trigger)?;
        let result = self.conn.execute(
            r#"INSERT INTO tasks
               (name, action, trigger_def, enabled, delete_after, parallel, run_asap, next_run_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                task.name,
                action,
                trigger,
                task.enabled,
                task.delete_after,
                task.parallel,
                task.run_asap_after_missed,
                next_run_at.map(format_time),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(TaskError::AlreadyExists(task.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&mut self, name: &str) -> Result<Option<RegisteredTask>, TaskError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = ?1");
        let task = self
            .conn
            .query_row(&sql, [name], row_to_task)
            .optional()?;
        Ok(task)
    }

    fn all(&mut self) -> Result<Vec<RegisteredTask>, TaskError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY name");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    fn set_enabled(
        &mut self,
        name: &str,
        enabled: bool,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<(), TaskError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET enabled = ?2, next_run_at = ?3 WHERE name = ?1",
            params![name, enabled, next_run_at.map(format_time)],
        )?;
        found(changed, name)
    }

    fn set_schedule(
        &mut self,
        name: &str,
        last_run_at: Option<NaiveDateTime>,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<(), TaskError> {
        let changed = self.conn.execute(
            r#"UPDATE tasks
               SET last_run_at = COALESCE(?2, last_run_at), next_run_at = ?3
               WHERE name = ?1"#,
            params![
                name,
                last_run_at.map(format_time),
                next_run_at.map(format_time)
            ],
        )?;
        found(changed, name)
    }

    fn record_result(&mut self, record: &RunRecord) -> Result<(), TaskError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"UPDATE tasks
               SET last_status = ?2, last_duration_ms = ?3, last_error = ?4
               WHERE name = ?1"#,
            params![
                record.task_name,
                format_run_status(record.status),
                record.duration_ms as i64,
                record.error,
            ],
        )?;
        tx.execute(
            r#"INSERT INTO run_history
               (task_name, started_at, duration_ms, status, exit_code, error)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                record.task_name,
                format_time(record.started_at),
                record.duration_ms as i64,
                format_run_status(record.status),
                record.exit_code,
                record.error,
            ],
        )?;
        tx.execute(
            r#"DELETE FROM run_history
               WHERE task_name = ?1 AND id NOT IN (
                   SELECT id FROM run_history WHERE task_name = ?1
                   ORDER BY id DESC LIMIT ?2
               )"#,
            params![record.task_name, HISTORY_LIMIT as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn history(&mut self, name: &str, limit: usize) -> Result<Vec<RunRecord>, TaskError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT task_name, started_at, duration_ms, status, exit_code, error
               FROM run_history
               WHERE task_name = ?1
               ORDER BY id DESC
               LIMIT ?2"#,
        )?;
        let rows = stmt.query_map(params![name, limit as i64], |row| {
            Ok(RunRecord {
                task_name: row.get(0)?,
                started_at: parse_time(1, row.get(1)?)?,
                duration_ms: row.get::<_, i64>(2)?.max(0) as u64,
                status: parse_run_status(&row.get::<_, String>(3)?),
                exit_code: row.get(4)?,
                error: row.get(5)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn remove(&mut self, name: &str) -> Result<(), TaskError> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute("DELETE FROM tasks WHERE name = ?1", [name])?;
        tx.execute("DELETE FROM run_history WHERE task_name = ?1", [name])?;
        tx.commit()?;
        found(changed, name)
    }
}

fn found(changed: usize, name: &str) -> Result<(), TaskError> {
    if changed == 0 {
        Err(TaskError::NotFound(name.to_string()))
    } else {
        Ok(())
    }
}

fn row_to_task(row: &Row) -> rusqlite::Result<RegisteredTask> {
    let action: TaskAction = from_json(1, &row.get::<_, String>(1)?)?;
    let trigger: Trigger = from_json(2, &row.get::<_, String>(2)?)?;
    Ok(RegisteredTask {
        task: ScheduledTask {
            name: row.get(0)?,
            action,
            trigger,
            enabled: row.get(3)?,
            delete_after: row.get(4)?,
            parallel: row.get(5)?,
            run_asap_after_missed: row.get(6)?,
        },
        state: TaskState {
            next_run_at: parse_opt_time(7, row.get(7)?)?,
            last_run_at: parse_opt_time(8, row.get(8)?)?,
            last_status: row
                .get::<_, Option<String>>(9)?
                .map(|s| parse_run_status(&s)),
            last_duration_ms: row.get::<_, Option<i64>>(10)?.map(|ms| ms.max(0) as u64),
            last_error: row.get(11)?,
        },
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Migrations
// ─────────────────────────────────────────────────────────────────────────────

fn run_migrations(conn: &Connection) -> Result<(), TaskError> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __facility_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )?;

    let applied: HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM __facility_schema_version")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                name TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                trigger_def TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                delete_after INTEGER NOT NULL DEFAULT 0,
                parallel INTEGER NOT NULL DEFAULT 0,
                run_asap INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT,
                last_run_at TEXT,
                last_status TEXT,
                last_duration_ms INTEGER,
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS run_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                exit_code INTEGER,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_run_history_task ON run_history(task_name, id DESC);
            "#,
        ),
    ];

    for (version, sql) in migrations {
        if applied.contains(&version) {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO __facility_schema_version(version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn format_time(t: NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn parse_time(idx: usize, s: String) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&s, TIME_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_time(idx: usize, s: Option<String>) -> rusqlite::Result<Option<NaiveDateTime>> {
    s.map(|s| parse_time(idx, s)).transpose()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, TaskError> {
    serde_json::to_string(value).map_err(|e| TaskError::Facility(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn format_run_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Ok => "ok",
        RunStatus::Error => "error",
        RunStatus::Skipped => "skipped",
    }
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "ok" => RunStatus::Ok,
        "error" => RunStatus::Error,
        _ => RunStatus::Skipped,
    }
}
