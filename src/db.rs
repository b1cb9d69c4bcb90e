use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};

use crate::models::{AnalysisTask, ApplicationSlot, ServiceType, TaskStatus};

/// Async-safe handle to the orchestration database.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; never call from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS application_slots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    model TEXT NOT NULL,
                    app_number INTEGER NOT NULL,
                    version INTEGER NOT NULL DEFAULT 1,
                    parent_slot_id INTEGER REFERENCES application_slots(id),
                    created_at TEXT NOT NULL,
                    UNIQUE(model, app_number, version)
                );

                CREATE TABLE IF NOT EXISTS analysis_tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    parent_id INTEGER REFERENCES analysis_tasks(id),
                    target_model TEXT NOT NULL,
                    target_app_number INTEGER NOT NULL,
                    service_name TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress REAL NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    tools TEXT NOT NULL DEFAULT '[]',
                    result_summary TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_slots_identity
                    ON application_slots(model, app_number);
                CREATE INDEX IF NOT EXISTS idx_tasks_parent ON analysis_tasks(parent_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON analysis_tasks(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Application slots ─────────────────────────────────────────────

    /// Insert a slot row, returning `None` if (model, app_number, version)
    /// is already taken. The unique constraint is the allocation primitive;
    /// callers race freely and retry with the next candidate on conflict.
    pub fn try_insert_slot(
        &self,
        model: &str,
        app_number: u32,
        version: u32,
        parent_slot_id: Option<i64>,
    ) -> Result<Option<ApplicationSlot>> {
        let created_at = now_str();
        let inserted = self.conn.execute(
            "INSERT INTO application_slots (model, app_number, version, parent_slot_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![model, app_number, version, parent_slot_id, created_at],
        );
        match inserted {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                Ok(Some(
                    self.get_slot(id)?.context("Slot not found after insert")?,
                ))
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to insert application slot"),
        }
    }

    pub fn get_slot(&self, id: i64) -> Result<Option<ApplicationSlot>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, model, app_number, version, parent_slot_id, created_at
                 FROM application_slots WHERE id = ?1",
            )
            .context("Failed to prepare get_slot")?;
        let mut rows = stmt
            .query_map(params![id], slot_from_row)
            .context("Failed to query slot")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read slot row")?)),
            None => Ok(None),
        }
    }

    /// Highest app number currently allocated for a model, if any.
    pub fn max_app_number(&self, model: &str) -> Result<Option<u32>> {
        let max: Option<u32> = self
            .conn
            .query_row(
                "SELECT MAX(app_number) FROM application_slots WHERE model = ?1",
                params![model],
                |row| row.get(0),
            )
            .context("Failed to get max app number")?;
        Ok(max)
    }

    /// Latest version row for one (model, app_number) identity.
    pub fn latest_version(&self, model: &str, app_number: u32) -> Result<Option<ApplicationSlot>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, model, app_number, version, parent_slot_id, created_at
                 FROM application_slots
                 WHERE model = ?1 AND app_number = ?2
                 ORDER BY version DESC LIMIT 1",
            )
            .context("Failed to prepare latest_version")?;
        let mut rows = stmt
            .query_map(params![model, app_number], slot_from_row)
            .context("Failed to query latest version")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read slot row")?)),
            None => Ok(None),
        }
    }

    // ── Analysis tasks ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        parent_id: Option<i64>,
        target_model: &str,
        target_app_number: u32,
        service: Option<ServiceType>,
        tools: &[String],
        max_retries: u32,
    ) -> Result<AnalysisTask> {
        let created_at = now_str();
        let tools_json = serde_json::to_string(tools).context("Failed to serialize tools")?;
        self.conn
            .execute(
                "INSERT INTO analysis_tasks
                    (parent_id, target_model, target_app_number, service_name, tools,
                     max_retries, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    parent_id,
                    target_model,
                    target_app_number,
                    service.map(|s| s.as_str()),
                    tools_json,
                    max_retries,
                    created_at
                ],
            )
            .context("Failed to insert analysis task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<AnalysisTask>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM analysis_tasks WHERE id = ?1",
                TASK_COLUMNS
            ))
            .context("Failed to prepare get_task")?;
        let mut rows = stmt
            .query_map(params![id], task_from_row)
            .context("Failed to query task")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read task row")?)),
            None => Ok(None),
        }
    }

    pub fn list_subtasks(&self, parent_id: i64) -> Result<Vec<AnalysisTask>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM analysis_tasks WHERE parent_id = ?1 ORDER BY id",
                TASK_COLUMNS
            ))
            .context("Failed to prepare list_subtasks")?;
        let rows = stmt
            .query_map(params![parent_id], task_from_row)
            .context("Failed to query subtasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?);
        }
        Ok(tasks)
    }

    pub fn mark_task_running(&self, id: i64) -> Result<AnalysisTask> {
        let now = now_str();
        self.conn
            .execute(
                "UPDATE analysis_tasks SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to mark task running")?;
        self.get_task(id)?.context("Task not found after update")
    }

    /// Set a terminal status with an optional summary or error.
    pub fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        result_summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<AnalysisTask> {
        let now = now_str();
        self.conn
            .execute(
                "UPDATE analysis_tasks
                 SET status = ?1, result_summary = ?2, error = ?3, completed_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), result_summary, error, now, id],
            )
            .context("Failed to finish task")?;
        self.get_task(id)?.context("Task not found after update")
    }

    /// Update only the status, stamping completion when terminal. Any
    /// summary or error already on the row is preserved.
    pub fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<AnalysisTask> {
        let completed_at = if status.is_terminal() {
            Some(now_str())
        } else {
            None
        };
        self.conn
            .execute(
                "UPDATE analysis_tasks
                 SET status = ?1, completed_at = COALESCE(?2, completed_at)
                 WHERE id = ?3",
                params![status.as_str(), completed_at, id],
            )
            .context("Failed to set task status")?;
        self.get_task(id)?.context("Task not found after update")
    }

    pub fn update_task_progress(&self, id: i64, progress: f64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE analysis_tasks SET progress = ?1 WHERE id = ?2",
                params![progress, id],
            )
            .context("Failed to update task progress")?;
        Ok(())
    }

    /// Bump the retry counter and put the task back in flight.
    pub fn restart_task_for_retry(&self, id: i64) -> Result<AnalysisTask> {
        let now = now_str();
        self.conn
            .execute(
                "UPDATE analysis_tasks
                 SET retry_count = retry_count + 1, status = 'running',
                     error = NULL, completed_at = NULL, started_at = ?1
                 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to restart task")?;
        self.get_task(id)?.context("Task not found after update")
    }

    // ── Maintenance sweep ─────────────────────────────────────────────

    /// Cancel RUNNING tasks whose start predates BOTH cutoffs. One UPDATE,
    /// idempotent: a second concurrent sweep matches zero rows.
    pub fn reclaim_running_tasks(
        &self,
        timeout_cutoff: &str,
        grace_cutoff: &str,
        error: &str,
    ) -> Result<usize> {
        let now = now_str();
        let reclaimed = self
            .conn
            .execute(
                "UPDATE analysis_tasks
                 SET status = 'cancelled', error = ?1, completed_at = ?2
                 WHERE status = 'running'
                   AND started_at IS NOT NULL
                   AND started_at < ?3 AND started_at < ?4",
                params![error, now, timeout_cutoff, grace_cutoff],
            )
            .context("Failed to reclaim running tasks")?;
        Ok(reclaimed)
    }

    /// Cancel PENDING tasks whose creation predates BOTH cutoffs.
    pub fn reclaim_pending_tasks(
        &self,
        timeout_cutoff: &str,
        grace_cutoff: &str,
        error: &str,
    ) -> Result<usize> {
        let now = now_str();
        let reclaimed = self
            .conn
            .execute(
                "UPDATE analysis_tasks
                 SET status = 'cancelled', error = ?1, completed_at = ?2
                 WHERE status = 'pending'
                   AND created_at < ?3 AND created_at < ?4",
                params![error, now, timeout_cutoff, grace_cutoff],
            )
            .context("Failed to reclaim pending tasks")?;
        Ok(reclaimed)
    }
}

/// Fixed-width RFC 3339 (UTC, microseconds). Rows and sweep cutoffs share
/// this format so SQL string comparison orders timestamps correctly.
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

const TASK_COLUMNS: &str = "id, parent_id, target_model, target_app_number, service_name, \
                            status, progress, retry_count, max_retries, tools, \
                            result_summary, error, created_at, started_at, completed_at";

fn slot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApplicationSlot> {
    Ok(ApplicationSlot {
        id: row.get(0)?,
        model: row.get(1)?,
        app_number: row.get(2)?,
        version: row.get(3)?,
        parent_slot_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisTask> {
    let service: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    let tools: String = row.get(9)?;
    Ok(AnalysisTask {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        target_model: row.get(2)?,
        target_app_number: row.get(3)?,
        service: service.and_then(|s| ServiceType::from_str(&s).ok()),
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        progress: row.get(6)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        tools: serde_json::from_str(&tools).unwrap_or_default(),
        result_summary: row.get(10)?,
        error: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}
