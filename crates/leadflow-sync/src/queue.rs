//! Durable job queue: at-least-once delivery with per-job retry and retention.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use uuid::Uuid;

pub type JobId = Uuid;

/// Per-job delivery options, fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub backoff_ms: u64,
    /// Completed jobs kept per queue. `None` keeps all of them.
    pub remove_on_complete: Option<usize>,
    /// Failed jobs kept per queue. `None` keeps all of them.
    pub remove_on_fail: Option<usize>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 5_000,
            remove_on_complete: Some(100),
            remove_on_fail: Some(500),
        }
    }
}

impl JobOptions {
    /// Delay before the next attempt once `attempts_made` attempts have failed.
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exponent))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A job handed to a worker. `attempts_made` counts the current attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub queue: String,
    pub payload: Value,
    pub attempts_made: u32,
    pub options: JobOptions,
}

impl QueuedJob {
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    RetryScheduled { delay: Duration },
    Exhausted,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: Value, options: JobOptions) -> Result<JobId>;

    /// Claims the oldest due job of `queue`, if any.
    async fn dequeue(&self, queue: &str) -> Result<Option<QueuedJob>>;

    async fn complete(&self, job: &QueuedJob) -> Result<()>;

    /// Schedules a retry while attempts remain, otherwise marks the job failed.
    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome>;

    /// Renews the lease of an active job.
    async fn heartbeat(&self, _job: &QueuedJob) -> Result<()> {
        Ok(())
    }

    /// Active jobs of `queue` whose lease is older than `stalled_after` go
    /// through the same accounting as [`JobQueue::fail`]. Returns how many
    /// were reclaimed.
    async fn reclaim_stalled(&self, _queue: &str, _stalled_after: Duration) -> Result<usize> {
        Ok(0)
    }
}

pub fn stalled_error(stalled_after: Duration) -> String {
    format!("stalled: no heartbeat for {}ms", stalled_after.as_millis())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct MemoryEntry {
    job: QueuedJob,
    status: JobStatus,
    run_at: Instant,
    heartbeat_at: Instant,
    finished_seq: u64,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    entries: Vec<MemoryEntry>,
    finished: u64,
}

impl MemoryQueueState {
    fn entry_mut(&mut self, id: JobId) -> Result<&mut MemoryEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.job.id == id)
            .with_context(|| format!("unknown job {id}"))
    }

    fn fail_entry(&mut self, id: JobId, error: &str) -> Result<FailOutcome> {
        let entry = self.entry_mut(id)?;
        if entry.job.attempts_made < entry.job.options.attempts {
            let delay = entry.job.options.retry_delay(entry.job.attempts_made);
            entry.status = JobStatus::Waiting;
            entry.run_at = Instant::now() + delay;
            entry.last_error = Some(error.to_string());
            return Ok(FailOutcome::RetryScheduled { delay });
        }
        self.finish(id, JobStatus::Failed, Some(error))?;
        Ok(FailOutcome::Exhausted)
    }

    fn finish(&mut self, id: JobId, status: JobStatus, error: Option<&str>) -> Result<()> {
        self.finished += 1;
        let seq = self.finished;
        let entry = self.entry_mut(id)?;
        entry.status = status;
        entry.finished_seq = seq;
        entry.last_error = error.map(str::to_string);
        let queue = entry.job.queue.clone();
        let keep = match status {
            JobStatus::Completed => entry.job.options.remove_on_complete,
            _ => entry.job.options.remove_on_fail,
        };
        if let Some(keep) = keep {
            self.trim(&queue, status, keep);
        }
        Ok(())
    }

    /// Keeps the `keep` most recently finished jobs of `queue` in `status`.
    fn trim(&mut self, queue: &str, status: JobStatus, keep: usize) {
        let mut finished: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.job.queue == queue && e.status == status)
            .map(|e| e.finished_seq)
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort_unstable_by(|a, b| b.cmp(a));
        let oldest_kept = if keep == 0 { u64::MAX } else { finished[keep - 1] };
        self.entries.retain(|e| {
            e.job.queue != queue || e.status != status || e.finished_seq >= oldest_kept
        });
    }
}

/// In-process queue with the same retry and retention rules as [`PgJobQueue`].
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn counts(&self, queue: &str) -> JobCounts {
        let state = self.lock();
        let mut counts = JobCounts::default();
        for entry in state.entries.iter().filter(|e| e.job.queue == queue) {
            match entry.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// `None` once the job has been removed by retention.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.job.id == id)
            .map(|e| e.status)
    }

    pub fn last_error(&self, id: JobId) -> Option<String> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.job.id == id)
            .and_then(|e| e.last_error.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, queue: &str, payload: Value, options: JobOptions) -> Result<JobId> {
        let id = Uuid::new_v4();
        self.lock().entries.push(MemoryEntry {
            job: QueuedJob {
                id,
                queue: queue.to_string(),
                payload,
                attempts_made: 0,
                options,
            },
            status: JobStatus::Waiting,
            run_at: Instant::now(),
            heartbeat_at: Instant::now(),
            finished_seq: 0,
            last_error: None,
        });
        Ok(id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let now = Instant::now();
        let mut state = self.lock();
        let next = state
            .entries
            .iter_mut()
            .filter(|e| e.job.queue == queue && e.status == JobStatus::Waiting && e.run_at <= now)
            .min_by_key(|e| e.run_at);
        Ok(next.map(|entry| {
            entry.status = JobStatus::Active;
            entry.heartbeat_at = now;
            entry.job.attempts_made += 1;
            entry.job.clone()
        }))
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        self.lock().finish(job.id, JobStatus::Completed, None)
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome> {
        self.lock().fail_entry(job.id, error)
    }

    async fn heartbeat(&self, job: &QueuedJob) -> Result<()> {
        let mut state = self.lock();
        let entry = state.entry_mut(job.id)?;
        if entry.status == JobStatus::Active {
            entry.heartbeat_at = Instant::now();
        }
        Ok(())
    }

    async fn reclaim_stalled(&self, queue: &str, stalled_after: Duration) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.lock();
        let stalled: Vec<JobId> = state
            .entries
            .iter()
            .filter(|e| {
                e.job.queue == queue
                    && e.status == JobStatus::Active
                    && now.duration_since(e.heartbeat_at) > stalled_after
            })
            .map(|e| e.job.id)
            .collect();
        let error = stalled_error(stalled_after);
        for id in &stalled {
            state.fail_entry(*id, &error)?;
        }
        Ok(stalled.len())
    }
}

/// Postgres queue on `leadflow_jobs`; concurrent workers claim rows with
/// `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn trim(&self, queue: &str, status: JobStatus, keep: Option<usize>) -> Result<()> {
        let Some(keep) = keep else {
            return Ok(());
        };
        sqlx::query(
            r#"
            DELETE FROM leadflow_jobs
             WHERE id IN (
                SELECT id FROM leadflow_jobs
                 WHERE queue = $1 AND status = $2
                 ORDER BY finished_at DESC
                OFFSET $3
             )
            "#,
        )
        .bind(queue)
        .bind(status.as_str())
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .with_context(|| format!("trimming {} jobs on {queue}", status.as_str()))?;
        Ok(())
    }
}

fn to_i32(value: Option<usize>) -> Option<i32> {
    value.map(|v| i32::try_from(v).unwrap_or(i32::MAX))
}

fn from_i32(value: Option<i32>) -> Option<usize> {
    value.map(|v| usize::try_from(v).unwrap_or(0))
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, queue: &str, payload: Value, options: JobOptions) -> Result<JobId> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO leadflow_jobs
                (id, queue, payload, status, attempts_made, max_attempts, backoff_ms,
                 remove_on_complete, remove_on_fail, run_at, created_at)
            VALUES ($1, $2, $3, 'waiting', 0, $4, $5, $6, $7, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(&payload)
        .bind(i32::try_from(options.attempts).unwrap_or(i32::MAX))
        .bind(i64::try_from(options.backoff_ms).unwrap_or(i64::MAX))
        .bind(to_i32(options.remove_on_complete))
        .bind(to_i32(options.remove_on_fail))
        .execute(&self.pool)
        .await
        .with_context(|| format!("enqueueing job on {queue}"))?;
        Ok(id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let row = sqlx::query(
            r#"
            UPDATE leadflow_jobs
               SET status = 'active', attempts_made = attempts_made + 1,
                   started_at = NOW(), heartbeat_at = NOW()
             WHERE id = (
                SELECT id FROM leadflow_jobs
                 WHERE queue = $1 AND status = 'waiting' AND run_at <= NOW()
                 ORDER BY run_at, created_at
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
            RETURNING id, queue, payload, attempts_made, max_attempts, backoff_ms,
                      remove_on_complete, remove_on_fail
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("claiming job on {queue}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let attempts_made: i32 = row.try_get("attempts_made")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let backoff_ms: i64 = row.try_get("backoff_ms")?;
        Ok(Some(QueuedJob {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            attempts_made: u32::try_from(attempts_made).unwrap_or(0),
            options: JobOptions {
                attempts: u32::try_from(max_attempts).unwrap_or(1),
                backoff_ms: u64::try_from(backoff_ms).unwrap_or(0),
                remove_on_complete: from_i32(row.try_get("remove_on_complete")?),
                remove_on_fail: from_i32(row.try_get("remove_on_fail")?),
            },
        }))
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        sqlx::query(
            "UPDATE leadflow_jobs SET status = 'completed', finished_at = NOW(), last_error = NULL WHERE id = $1",
        )
        .bind(job.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("completing job {}", job.id))?;
        self.trim(&job.queue, JobStatus::Completed, job.options.remove_on_complete)
            .await
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome> {
        if job.attempts_made < job.options.attempts {
            let delay = job.options.retry_delay(job.attempts_made);
            sqlx::query(
                r#"
                UPDATE leadflow_jobs
                   SET status = 'waiting', last_error = $2,
                       run_at = NOW() + ($3 * INTERVAL '1 millisecond')
                 WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(error)
            .bind(delay.as_secs_f64() * 1_000.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("rescheduling job {}", job.id))?;
            return Ok(FailOutcome::RetryScheduled { delay });
        }

        sqlx::query(
            "UPDATE leadflow_jobs SET status = 'failed', finished_at = NOW(), last_error = $2 WHERE id = $1",
        )
        .bind(job.id)
        .bind(error)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failing job {}", job.id))?;
        self.trim(&job.queue, JobStatus::Failed, job.options.remove_on_fail)
            .await?;
        Ok(FailOutcome::Exhausted)
    }

    async fn heartbeat(&self, job: &QueuedJob) -> Result<()> {
        sqlx::query(
            "UPDATE leadflow_jobs SET heartbeat_at = NOW() WHERE id = $1 AND status = 'active'",
        )
        .bind(job.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("renewing lease of job {}", job.id))?;
        Ok(())
    }

    async fn reclaim_stalled(&self, queue: &str, stalled_after: Duration) -> Result<usize> {
        let rows = sqlx::query(
            r#"
            UPDATE leadflow_jobs
               SET status = CASE WHEN attempts_made < max_attempts THEN 'waiting' ELSE 'failed' END,
                   run_at = CASE WHEN attempts_made < max_attempts
                                 THEN NOW() + (backoff_ms * POWER(2, LEAST(GREATEST(attempts_made - 1, 0), 16))
                                               * INTERVAL '1 millisecond')
                                 ELSE run_at END,
                   finished_at = CASE WHEN attempts_made < max_attempts THEN NULL ELSE NOW() END,
                   last_error = $3
             WHERE id IN (
                SELECT id FROM leadflow_jobs
                 WHERE queue = $1 AND status = 'active'
                   AND heartbeat_at < NOW() - ($2 * INTERVAL '1 millisecond')
                 FOR UPDATE SKIP LOCKED
             )
            RETURNING status, remove_on_fail
            "#,
        )
        .bind(queue)
        .bind(stalled_after.as_secs_f64() * 1_000.0)
        .bind(stalled_error(stalled_after))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reclaiming stalled jobs on {queue}"))?;

        let mut keep_failed = None;
        for row in &rows {
            let status: String = row.try_get("status")?;
            if status == JobStatus::Failed.as_str() {
                keep_failed = Some(from_i32(row.try_get("remove_on_fail")?));
            }
        }
        if let Some(keep) = keep_failed {
            self.trim(queue, JobStatus::Failed, keep).await?;
        }
        Ok(rows.len())
    }
}
