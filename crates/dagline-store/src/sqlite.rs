use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use dagline_core::error::{DaglineError, Result};
use dagline_core::status::RunStatus;
use dagline_core::traits::RunStore;
use dagline_core::types::{DagRun, DagStep, RunId, RunSummary};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    dag_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);";

/// SQLite-backed run store. Runs created with `persist: true` are mirrored
/// here so they survive a process restart.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DaglineError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| DaglineError::Database(e.to_string()))?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| DaglineError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| DaglineError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DaglineError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| DaglineError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a run row. Used by the launcher to mirror a
    /// completed run into the persistent store.
    pub fn upsert_run(&self, run: &DagRun) -> Result<()> {
        let payload = serde_json::to_string(run)?;
        let created_at = run
            .execution_date
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO runs (run_id, dag_id, status, created_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id.to_string(),
                run.dag_id,
                run.status.as_str(),
                created_at,
                payload
            ],
        )
        .map_err(|e| DaglineError::Database(e.to_string()))?;
        Ok(())
    }

    fn load_run(conn: &Connection, id: &RunId) -> Result<Option<DagRun>> {
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM runs WHERE run_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| DaglineError::Database(e.to_string()))?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    fn save_run(conn: &Connection, run: &DagRun) -> Result<()> {
        let payload = serde_json::to_string(run)?;
        conn.execute(
            "UPDATE runs SET status = ?2, payload = ?3 WHERE run_id = ?1",
            params![run.id.to_string(), run.status.as_str(), payload],
        )
        .map_err(|e| DaglineError::Database(e.to_string()))?;
        Ok(())
    }
}

impl RunStore for SqliteRunStore {
    fn insert_run(&self, run: &DagRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let payload = serde_json::to_string(&run)?;
            let created_at = run
                .execution_date
                .map(|d| d.to_rfc3339())
                .unwrap_or_default();
            let conn = self.conn.lock().expect("sqlite lock poisoned");
            conn.execute(
                "INSERT INTO runs (run_id, dag_id, status, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id.to_string(),
                    run.dag_id,
                    run.status.as_str(),
                    created_at,
                    payload
                ],
            )
            .map_err(|e| DaglineError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<DagRun>>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.conn.lock().expect("sqlite lock poisoned");
            Self::load_run(&conn, &id)
        })
    }

    fn list_runs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<RunStatus>,
    ) -> BoxFuture<'_, Result<(Vec<RunSummary>, usize)>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("sqlite lock poisoned");

            let (total, payloads): (usize, Vec<String>) = match status {
                Some(s) => {
                    let total: usize = conn
                        .query_row(
                            "SELECT COUNT(*) FROM runs WHERE status = ?1",
                            params![s.as_str()],
                            |row| row.get(0),
                        )
                        .map_err(|e| DaglineError::Database(e.to_string()))?;
                    let mut stmt = conn
                        .prepare(
                            "SELECT payload FROM runs WHERE status = ?1
                             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                        )
                        .map_err(|e| DaglineError::Database(e.to_string()))?;
                    let rows = stmt
                        .query_map(params![s.as_str(), limit, offset], |row| row.get(0))
                        .map_err(|e| DaglineError::Database(e.to_string()))?
                        .collect::<std::result::Result<Vec<String>, _>>()
                        .map_err(|e| DaglineError::Database(e.to_string()))?;
                    (total, rows)
                }
                None => {
                    let total: usize = conn
                        .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
                        .map_err(|e| DaglineError::Database(e.to_string()))?;
                    let mut stmt = conn
                        .prepare(
                            "SELECT payload FROM runs
                             ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                        )
                        .map_err(|e| DaglineError::Database(e.to_string()))?;
                    let rows = stmt
                        .query_map(params![limit, offset], |row| row.get(0))
                        .map_err(|e| DaglineError::Database(e.to_string()))?
                        .collect::<std::result::Result<Vec<String>, _>>()
                        .map_err(|e| DaglineError::Database(e.to_string()))?;
                    (total, rows)
                }
            };

            let mut items = Vec::with_capacity(payloads.len());
            for p in payloads {
                let run: DagRun = serde_json::from_str(&p)?;
                items.push(run.summary());
            }
            Ok((items, total))
        })
    }

    fn update_run_status(
        &self,
        id: &RunId,
        status: RunStatus,
    ) -> BoxFuture<'_, Result<DagRun>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.conn.lock().expect("sqlite lock poisoned");
            let mut run = Self::load_run(&conn, &id)?
                .ok_or_else(|| DaglineError::RunNotFound(id.to_string()))?;

            if run.status.is_terminal() {
                if run.status == status {
                    return Ok(run);
                }
                return Err(DaglineError::InvalidTransition {
                    from: run.status.to_string(),
                    to: status.to_string(),
                });
            }

            run.apply_status(status);
            Self::save_run(&conn, &run)?;
            Ok(run)
        })
    }

    fn update_step(&self, id: &RunId, step: &DagStep) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        let step = step.clone();
        Box::pin(async move {
            let conn = self.conn.lock().expect("sqlite lock poisoned");
            let mut run = Self::load_run(&conn, &id)?
                .ok_or_else(|| DaglineError::RunNotFound(id.to_string()))?;
            match run.step_mut(&step.id) {
                Some(existing) => *existing = step,
                None => run.steps.push(step),
            }
            Self::save_run(&conn, &run)
        })
    }

    fn count_by_status(&self) -> BoxFuture<'_, Result<HashMap<RunStatus, usize>>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("sqlite lock poisoned");
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM runs GROUP BY status")
                .map_err(|e| DaglineError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?))
                })
                .map_err(|e| DaglineError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DaglineError::Database(e.to_string()))?;

            let mut counts = HashMap::new();
            for (status, count) in rows {
                counts.insert(RunStatus::parse_lenient(&status)?, count);
            }
            Ok(counts)
        })
    }
}
