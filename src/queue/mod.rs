pub mod dispatcher;
pub mod monitor;
pub mod poller;
pub mod reconciler;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

pub const QUEUE_SMS_SEND: &str = "sms_send";
pub const QUEUE_SMS_STATUS: &str = "sms_status";

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Base delay of the exponential retry schedule: 15s, 30s, 60s, ...
const RETRY_BASE_DELAY_SECS: i64 = 15;

/// Snooze delay applied when the circuit breaker is open. Does not consume
/// an attempt.
pub const SNOOZE_DELAY_SECS: i64 = 60;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub job_id: i64,
    pub queue: String,
    pub message_id: String,
    pub state: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub scheduled_at: i64,
    pub last_error: Option<String>
}
impl Job {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Durable work queue over the jobs table. Claims are single-statement and
/// atomic, so any number of workers can share one queue. The pause flag is
/// in-process and shared across clones; in-flight jobs are unaffected.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    paused: Arc<AtomicBool>
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            paused: Arc::new(AtomicBool::new(false))
        }
    }

    /// Reset jobs stranded in `executing` by a previous process. Run once
    /// at startup, before any worker claims.
    pub async fn recover_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'available', attempt = MAX(attempt - 1, 0), updated_at = unixepoch() WHERE state = 'executing'"
        )
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!("Recovered {} jobs left executing by a previous run", recovered);
        }
        Ok(recovered)
    }

    pub async fn enqueue(&self, queue: &str, message_id: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO jobs (queue, message_id, state, max_attempts) VALUES (?, ?, 'available', ?)"
        )
            .bind(queue)
            .bind(message_id)
            .bind(DEFAULT_MAX_ATTEMPTS)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        Ok(result.last_insert_rowid())
    }

    /// Claim the next due job, marking it executing and consuming an
    /// attempt. Returns None when nothing is due.
    pub async fn claim(&self, queue: &str) -> Result<Option<Job>> {
        sqlx::query_as(
            "UPDATE jobs SET state = 'executing', attempt = attempt + 1, updated_at = unixepoch() \
             WHERE job_id = ( \
                SELECT job_id FROM jobs \
                WHERE queue = ? AND state IN ('available', 'scheduled') AND scheduled_at <= unixepoch() \
                ORDER BY scheduled_at ASC, job_id ASC LIMIT 1 \
             ) \
             RETURNING job_id, queue, message_id, state, attempt, max_attempts, scheduled_at, last_error"
        )
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }

    pub async fn has_ready(&self, queue: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND state IN ('available', 'scheduled') AND scheduled_at <= unixepoch()"
        )
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(count > 0)
    }

    pub async fn complete(&self, job_id: i64) -> Result<()> {
        self.finish(job_id, "completed", None).await
    }

    pub async fn cancel(&self, job_id: i64, reason: &str) -> Result<()> {
        self.finish(job_id, "cancelled", Some(reason)).await
    }

    pub async fn discard(&self, job_id: i64, reason: &str) -> Result<()> {
        self.finish(job_id, "discarded", Some(reason)).await
    }

    /// Put a failed job back on the schedule with exponential backoff, or
    /// discard it when its attempt budget is spent. Returns true when the
    /// job was discarded.
    pub async fn retry_or_discard(&self, job: &Job, reason: &str) -> Result<bool> {
        if job.attempts_exhausted() {
            self.discard(job.job_id, reason).await?;
            return Ok(true);
        }

        let delay = RETRY_BASE_DELAY_SECS << (job.attempt.clamp(1, 16) - 1);
        sqlx::query(
            "UPDATE jobs SET state = 'scheduled', scheduled_at = unixepoch() + ?, last_error = ?, updated_at = unixepoch() WHERE job_id = ?"
        )
            .bind(delay)
            .bind(reason)
            .bind(job.job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(false)
    }

    /// Defer a job without consuming the attempt that claimed it.
    pub async fn snooze(&self, job_id: i64, delay_secs: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'scheduled', scheduled_at = unixepoch() + ?, attempt = MAX(attempt - 1, 0), updated_at = unixepoch() WHERE job_id = ?"
        )
            .bind(delay_secs)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn finish(&self, job_id: i64, state: &str, reason: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = ?, last_error = COALESCE(?, last_error), updated_at = unixepoch() WHERE job_id = ?"
        )
            .bind(state)
            .bind(reason)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn pending_count(&self, queue: &str) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND state IN ('available', 'scheduled', 'executing')"
        )
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Job queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Job queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
