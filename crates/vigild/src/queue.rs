//! Durable job queue for scan and triage tasks.
//!
//! At-least-once delivery over a sqlite-backed table: messages are persisted
//! on enqueue, claimed oldest-first under a claim lock, and acknowledged
//! manually after the handler finishes. A failed handler negatively
//! acknowledges without re-queue — a failed scan is not silently retried,
//! which would risk duplicate pull requests. Jobs left in the delivered
//! state by a crashed worker are re-queued at startup with a bumped retry
//! count.

use chrono::Utc;
use sqlx::{Pool, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use vigil_core::{JobId, JobKind, JobPayload};

/// Default simultaneous jobs per worker process. Kept low because a single
/// scan fans out into several heavy analyzer containers.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("queue shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A claimed job handed to a handler, with observability context.
#[derive(Debug, Clone)]
pub struct DeliveredJob {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// How many times this job was re-delivered after a worker crash.
    pub retry_count: u32,
}

/// Durable work queue with bounded worker concurrency.
pub struct JobQueue {
    pool: Pool<Sqlite>,
    /// Semaphore for concurrency limiting (backpressure).
    concurrency_semaphore: Arc<Semaphore>,
    /// Lock for atomic claim operations.
    claim_lock: Mutex<()>,
    /// Shutdown flag.
    shutdown: AtomicBool,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Create a queue over an existing pool with the given concurrency cap.
    pub fn new(pool: Pool<Sqlite>, concurrency: usize) -> Self {
        Self {
            pool,
            concurrency_semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            claim_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Create a queue with the default single-task concurrency.
    pub fn with_defaults(pool: Pool<Sqlite>) -> Self {
        Self::new(pool, DEFAULT_WORKER_CONCURRENCY)
    }

    /// Signal the queue to stop handing out jobs.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Persist a job message. Survives broker restart.
    pub async fn enqueue(&self, payload: &JobPayload) -> Result<JobId> {
        let id = JobId::new();
        let now = Utc::now().timestamp_millis();
        let payload_json = serde_json::to_string(payload)?;

        sqlx::query(
            "INSERT INTO jobs (id, kind, payload_json, status, retry_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5)",
        )
        .bind(id.as_ref())
        .bind(payload.kind().as_str())
        .bind(&payload_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(job_id = %id, kind = payload.kind().as_str(), "job enqueued");
        Ok(id)
    }

    /// Claim the oldest queued job for execution.
    ///
    /// Returns `None` when the queue is empty or the worker is already at
    /// its concurrency cap; the caller polls again after a short sleep. The
    /// concurrency permit is held until `ack` or `nack` releases it.
    pub async fn claim_next(&self) -> Result<Option<DeliveredJob>> {
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }

        let Ok(permit) = self.concurrency_semaphore.clone().try_acquire_owned() else {
            return Ok(None);
        };

        // Lock to prevent double-claims from concurrent pollers.
        let _lock = self.claim_lock.lock().await;

        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT id, payload_json, retry_count FROM jobs \
             WHERE status = 'queued' ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, payload_json, retry_count)) = row else {
            drop(permit);
            return Ok(None);
        };

        let now = Utc::now().timestamp_millis();
        sqlx::query("UPDATE jobs SET status = 'delivered', updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(&id)
            .execute(&self.pool)
            .await?;

        let payload: JobPayload = serde_json::from_str(&payload_json)?;

        // Permit is intentionally leaked; ack/nack add it back.
        std::mem::forget(permit);

        Ok(Some(DeliveredJob {
            id: JobId::from_string(id),
            kind: payload.kind(),
            payload,
            retry_count: retry_count as u32,
        }))
    }

    /// Acknowledge successful handling; the message is marked done.
    pub async fn ack(&self, id: &JobId) -> Result<()> {
        self.finish(id, "done", None).await
    }

    /// Negatively acknowledge; the message is marked failed and NOT
    /// re-queued.
    pub async fn nack(&self, id: &JobId, error: &str) -> Result<()> {
        self.finish(id, "failed", Some(error)).await
    }

    async fn finish(&self, id: &JobId, status: &str, error: Option<&str>) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = 'delivered'",
        )
        .bind(status)
        .bind(error)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        self.concurrency_semaphore.add_permits(1);

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Re-queue jobs that were delivered but never acknowledged.
    ///
    /// Called at worker startup; this is the at-least-once half of the
    /// delivery contract. Each recovered job gets its retry count bumped so
    /// handlers can observe re-delivery.
    pub async fn recover(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', retry_count = retry_count + 1, updated_at = ?1 \
             WHERE status = 'delivered'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::info!(count = recovered, "recovered unacknowledged jobs");
        }
        Ok(recovered)
    }

    /// Number of jobs waiting to be claimed.
    pub async fn pending_count(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }
}
