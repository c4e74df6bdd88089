//! Durable job queue.
//!
//! At-least-once delivery backed by the same SQLite file as the canonical
//! store, so an enqueue and the canonical write that caused it share crash
//! semantics. Workers lease jobs by flipping `pending → active`; leases that
//! outlive `expire_in_secs` are reclaimed through the retry path. There is no
//! in-memory fan-out that can lose work across a restart.

pub mod worker;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::SyncError;
use crate::store::{dt, ts, Database};

/// The queue set is fixed; handlers are registered per name at startup.
pub const ORDER_SYNC_TO_FFN: &str = "order-sync-to-ffn";
pub const ORDER_SYNC_TO_COMMERCE: &str = "order-sync-to-commerce";
pub const PRODUCT_SYNC_TO_FFN: &str = "product-sync-to-ffn";
pub const RETURN_SYNC_TO_FFN: &str = "return-sync-to-ffn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Expired => "expired",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "expired" => Some(JobState::Expired),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Active)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i8,
    pub state: JobState,
    pub retry_count: u32,
    pub retry_limit: u32,
    pub retry_delay_secs: u64,
    pub retry_backoff: bool,
    pub expire_in_secs: u64,
    pub singleton_key: Option<String>,
    pub start_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub priority: i8,
    pub retry_limit: u32,
    pub retry_delay_secs: u64,
    pub retry_backoff: bool,
    pub expire_in_secs: u64,
    pub singleton_key: Option<String>,
    pub start_after: Option<DateTime<Utc>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            retry_limit: 2,
            retry_delay_secs: 60,
            retry_backoff: false,
            expire_in_secs: 900,
            singleton_key: None,
            start_after: None,
        }
    }
}

impl JobOptions {
    pub fn singleton(key: impl Into<String>) -> Self {
        Self {
            singleton_key: Some(key.into()),
            ..Default::default()
        }
    }
}

/// The seam the lifecycle engine consumes; breaks the engine → queue cycle
/// and lets tests capture enqueues.
pub trait Enqueuer: Send + Sync {
    fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Option<String>, SyncError>;
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Result<Self> {
        db.conn()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS job (
                    id TEXT PRIMARY KEY,
                    queue TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    state TEXT NOT NULL DEFAULT 'pending',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    retry_limit INTEGER NOT NULL DEFAULT 2,
                    retry_delay INTEGER NOT NULL DEFAULT 60,
                    retry_backoff INTEGER NOT NULL DEFAULT 0,
                    expire_in_secs INTEGER NOT NULL DEFAULT 900,
                    singleton_key TEXT,
                    start_after INTEGER NOT NULL,
                    started_at INTEGER,
                    finished_at INTEGER,
                    last_error TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_job_fetch
                    ON job(queue, state, start_after, priority);
                CREATE INDEX IF NOT EXISTS idx_job_singleton ON job(singleton_key);
                ",
            )
            .context("init job table")?;
        Ok(Self { db })
    }

    /// Enqueue a job. With a `singleton_key`, a second enqueue while a
    /// non-terminal job holds the same key is a no-op returning `None`.
    pub fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Option<String>> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        if let Some(key) = &opts.singleton_key {
            let live: i64 = tx.query_row(
                "SELECT COUNT(*) FROM job
                 WHERE singleton_key = ?1 AND state IN ('pending', 'active')",
                params![key],
                |row| row.get(0),
            )?;
            if live > 0 {
                return Ok(None);
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO job (id, queue, payload, priority, state, retry_count, retry_limit,
                               retry_delay, retry_backoff, expire_in_secs, singleton_key,
                               start_after, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                queue,
                payload.to_string(),
                opts.priority,
                opts.retry_limit,
                opts.retry_delay_secs as i64,
                opts.retry_backoff,
                opts.expire_in_secs as i64,
                opts.singleton_key,
                ts(opts.start_after.unwrap_or(now)),
                ts(now),
            ],
        )?;
        tx.commit()?;
        Ok(Some(id))
    }

    /// Lease the next due job: highest priority first, then FIFO by
    /// `start_after`.
    pub fn fetch_next(&self, queue: &str) -> Result<Option<Job>> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let job = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM job
                 WHERE queue = ?1 AND state = 'pending' AND start_after <= ?2
                 ORDER BY priority DESC, start_after ASC, created_at ASC
                 LIMIT 1"
            ))?;
            stmt.query_row(params![queue, ts(now)], job_from_row).optional()?
        };

        let Some(mut job) = job else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE job SET state = 'active', started_at = ?2 WHERE id = ?1",
            params![job.id, ts(now)],
        )?;
        tx.commit()?;

        job.state = JobState::Active;
        job.started_at = Some(now);
        Ok(Some(job))
    }

    pub fn complete(&self, job_id: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE job SET state = 'completed', finished_at = ?2 WHERE id = ?1",
            params![job_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Failure on the retry path: schedule another attempt with (optionally
    /// exponential) backoff, or dead-letter once the budget is spent.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<JobState> {
        self.fail_inner(job_id, error, JobState::Failed)
    }

    /// Non-retryable failure: dead-letter immediately, whatever the budget.
    pub fn fail_terminal(&self, job_id: &str, error: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE job SET state = 'failed', finished_at = ?2, last_error = ?3 WHERE id = ?1",
            params![job_id, ts(Utc::now()), error],
        )?;
        Ok(())
    }

    pub fn cancel(&self, job_id: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE job SET state = 'cancelled', finished_at = ?2
             WHERE id = ?1 AND state IN ('pending', 'active')",
            params![job_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Return expired leases to the queue. An expired lease burns a retry; a
    /// job that expires beyond its budget parks in `expired`.
    pub fn reclaim_expired(&self) -> Result<usize> {
        let expired: Vec<String> = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(
                "SELECT id FROM job
                 WHERE state = 'active' AND started_at + expire_in_secs <= ?1",
            )?;
            let rows = stmt
                .query_map(params![ts(Utc::now())], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for id in &expired {
            self.fail_inner(id, "lease expired", JobState::Expired)?;
        }
        Ok(expired.len())
    }

    fn fail_inner(&self, job_id: &str, error: &str, exhausted_state: JobState) -> Result<JobState> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let (retry_count, retry_limit, retry_delay, retry_backoff): (u32, u32, i64, bool) = tx
            .query_row(
                "SELECT retry_count, retry_limit, retry_delay, retry_backoff FROM job WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let now = Utc::now();
        let attempt = retry_count + 1;
        let state = if attempt > retry_limit {
            tx.execute(
                "UPDATE job SET state = ?2, finished_at = ?3, last_error = ?4 WHERE id = ?1",
                params![job_id, exhausted_state.as_str(), ts(now), error],
            )?;
            exhausted_state
        } else {
            let factor = if retry_backoff {
                2i64.saturating_pow(attempt)
            } else {
                1
            };
            let next = now + Duration::seconds(retry_delay.saturating_mul(factor));
            tx.execute(
                "UPDATE job SET state = 'pending', retry_count = ?2, start_after = ?3,
                                 started_at = NULL, last_error = ?4
                 WHERE id = ?1",
                params![job_id, attempt, ts(next), error],
            )?;
            JobState::Pending
        };

        tx.commit()?;
        Ok(state)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?1"))?;
        Ok(stmt.query_row(params![job_id], job_from_row).optional()?)
    }

    /// Pending + active jobs per queue, for the health surface.
    pub fn depth(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT queue, COUNT(*) FROM job
             WHERE state IN ('pending', 'active') GROUP BY queue ORDER BY queue",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn live_count(&self, singleton_key: &str) -> Result<i64> {
        let count = self.db.conn().query_row(
            "SELECT COUNT(*) FROM job WHERE singleton_key = ?1 AND state IN ('pending', 'active')",
            params![singleton_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl Enqueuer for JobQueue {
    fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Option<String>, SyncError> {
        JobQueue::enqueue(self, queue, payload, opts)
            .map_err(|e| SyncError::Storage(e.to_string()))
    }
}

const JOB_COLUMNS: &str = "id, queue, payload, priority, state, retry_count, retry_limit, \
     retry_delay, retry_backoff, expire_in_secs, singleton_key, start_after, started_at, \
     finished_at, last_error, created_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(2)?;
    let state: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        priority: row.get::<_, i64>(3)? as i8,
        state: JobState::parse(&state).unwrap_or(JobState::Pending),
        retry_count: row.get(5)?,
        retry_limit: row.get(6)?,
        retry_delay_secs: row.get::<_, i64>(7)? as u64,
        retry_backoff: row.get(8)?,
        expire_in_secs: row.get::<_, i64>(9)? as u64,
        singleton_key: row.get(10)?,
        start_after: dt(row.get(11)?),
        started_at: row.get::<_, Option<i64>>(12)?.map(dt),
        finished_at: row.get::<_, Option<i64>>(13)?.map(dt),
        last_error: row.get(14)?,
        created_at: dt(row.get(15)?),
    })
}
