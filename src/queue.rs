//! Durable job queue.
//!
//! Jobs are rows in a dedicated SQLite file shared by the web process (which
//! enqueues) and one or more `microblog worker` processes (which claim and
//! run). A job id is an opaque UUID string; it is the only key linking a
//! queued job to its [`Task`](crate::models::Task) row.
//!
//! Finished and failed jobs stay visible for `result_ttl_secs` and are then
//! evicted by [`JobQueue::purge_expired`]. Fetching an evicted job yields
//! [`QueueError::NoSuchJob`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

use crate::db;
use crate::models::now_millis;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no such job: {0}")]
    NoSuchJob(String),
    #[error("queue storage error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("malformed job payload: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("failed to open queue: {0}")]
    Open(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "started" => JobStatus::Started,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub func_name: String,
    pub user_id: i64,
    pub args: Value,
    pub meta: Map<String, Value>,
    pub status: JobStatus,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub exc_info: Option<String>,
}

impl JobRecord {
    /// The `progress` metadata value, if the job has reported any.
    pub fn progress(&self) -> Option<i64> {
        self.meta.get("progress").and_then(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        })
    }

    fn from_row(row: &SqliteRow) -> Result<Self, QueueError> {
        let args_json: String = row.try_get("args_json")?;
        let meta_json: String = row.try_get("meta_json")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            func_name: row.try_get("func_name")?,
            user_id: row.try_get("user_id")?,
            args: serde_json::from_str(&args_json)?,
            meta: serde_json::from_str(&meta_json)?,
            status: JobStatus::parse(&status),
            enqueued_at: row.try_get("enqueued_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            exc_info: row.try_get("exc_info")?,
        })
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue a job and return its id.
    async fn enqueue(&self, func_name: &str, user_id: i64, args: Value)
        -> Result<String, QueueError>;

    async fn fetch(&self, id: &str) -> Result<JobRecord, QueueError>;

    /// Set one metadata key on a job, keeping the others.
    async fn set_meta(&self, id: &str, key: &str, value: Value) -> Result<(), QueueError>;

    /// Atomically move the oldest queued job to `started` and return it.
    async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError>;

    async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        exc_info: Option<String>,
    ) -> Result<(), QueueError>;

    /// Evict finished and failed jobs that ended more than `ttl_secs` ago.
    async fn purge_expired(&self, ttl_secs: i64) -> Result<usize, QueueError>;
}

const JOB_COLUMNS: &str = "id, func_name, user_id, args_json, meta_json, status, enqueued_at, started_at, ended_at, exc_info";

pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    /// Open (creating if needed) the queue database.
    pub async fn open(path: &Path) -> Result<Self, QueueError> {
        let pool = db::connect_path(path).await.map_err(QueueError::Open)?;
        create_queue_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn create_queue_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            func_name TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            args_json TEXT NOT NULL,
            meta_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'queued',
            enqueued_at INTEGER NOT NULL,
            started_at INTEGER,
            ended_at INTEGER,
            exc_info TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, enqueued_at)")
        .execute(pool)
        .await?;

    Ok(())
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(
        &self,
        func_name: &str,
        user_id: i64,
        args: Value,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO jobs (id, func_name, user_id, args_json, status, enqueued_at) VALUES (?, ?, ?, ?, 'queued', ?)",
        )
        .bind(&id)
        .bind(func_name)
        .bind(user_id)
        .bind(serde_json::to_string(&args)?)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %id, func_name, "job enqueued");
        Ok(id)
    }

    async fn fetch(&self, id: &str) -> Result<JobRecord, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => JobRecord::from_row(&row),
            None => Err(QueueError::NoSuchJob(id.to_string())),
        }
    }

    async fn set_meta(&self, id: &str, key: &str, value: Value) -> Result<(), QueueError> {
        let path = format!("$.\"{}\"", key.replace('"', ""));
        let result = sqlx::query(
            "UPDATE jobs SET meta_json = json_set(meta_json, ?, json(?)) WHERE id = ?",
        )
        .bind(path)
        .bind(serde_json::to_string(&value)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NoSuchJob(id.to_string()));
        }
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs SET status = 'started', started_at = ?
            WHERE id = (
                SELECT id FROM jobs WHERE status = 'queued'
                ORDER BY enqueued_at, rowid LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(JobRecord::from_row).transpose()
    }

    async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        exc_info: Option<String>,
    ) -> Result<(), QueueError> {
        let result =
            sqlx::query("UPDATE jobs SET status = ?, ended_at = ?, exc_info = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(now_millis())
                .bind(exc_info)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NoSuchJob(id.to_string()));
        }
        Ok(())
    }

    async fn purge_expired(&self, ttl_secs: i64) -> Result<usize, QueueError> {
        let cutoff = now_millis() - ttl_secs.max(0) * 1000;
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('finished', 'failed') AND ended_at IS NOT NULL AND ended_at <= ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
