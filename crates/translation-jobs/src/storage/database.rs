//! SQLite database for durable job state
//!
//! Each job is one row holding the serialized record and its write version.
//! Swaps are conditional updates on that version.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::{CasResult, JobStore, Versioned};
use crate::error::{Error, Result};
use crate::types::{Job, JobKey, JobStatus};

/// SQLite-based job store
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#).map_err(|e| Error::storage(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                job_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        "#).map_err(|e| Error::storage(format!("Failed to run migrations: {}", e)))?;

        Ok(())
    }

    fn current_version(conn: &Connection, key: &JobKey) -> Result<Option<u64>> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM jobs WHERE job_key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn load(&self, key: &JobKey) -> Result<Option<Versioned<Job>>> {
        let conn = self.conn.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, job_json FROM jobs WHERE job_key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((version, json)) => Ok(Some(Versioned {
                version: version as u64,
                value: serde_json::from_str(&json)?,
            })),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &JobKey,
        expected: Option<u64>,
        job: &Job,
    ) -> Result<CasResult> {
        let json = serde_json::to_string(job)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();

        let (changed, new_version) = match expected {
            None => {
                let changed = conn.execute(
                    r#"
                    INSERT INTO jobs (job_key, version, status, job_json, created_at, updated_at)
                    VALUES (?1, 1, ?2, ?3, ?4, ?4)
                    ON CONFLICT(job_key) DO NOTHING
                    "#,
                    params![key.as_str(), job_status_to_string(job.status), json, now],
                )?;
                (changed, 1)
            }
            Some(version) => {
                let changed = conn.execute(
                    r#"
                    UPDATE jobs
                    SET version = ?1, status = ?2, job_json = ?3, updated_at = ?4
                    WHERE job_key = ?5 AND version = ?6
                    "#,
                    params![
                        (version + 1) as i64,
                        job_status_to_string(job.status),
                        json,
                        now,
                        key.as_str(),
                        version as i64,
                    ],
                )?;
                (changed, version + 1)
            }
        };

        if changed == 1 {
            Ok(CasResult::Success {
                version: new_version,
            })
        } else {
            Ok(CasResult::Conflict {
                actual: Self::current_version(&conn, key)?,
            })
        }
    }

    async fn list_keys(&self) -> Result<Vec<JobKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT job_key FROM jobs ORDER BY job_key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys.into_iter().map(JobKey::from).collect())
    }

    async fn list_unfinished(&self) -> Result<Vec<JobKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT job_key FROM jobs WHERE status IN ('pending', 'processing') ORDER BY created_at",
        )?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys.into_iter().map(JobKey::from).collect())
    }

    async fn delete(&self, key: &JobKey) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM jobs WHERE job_key = ?1", params![key.as_str()])?;
        Ok(changed > 0)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

fn job_status_to_string(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}
