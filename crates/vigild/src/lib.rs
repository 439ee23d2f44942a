//! vigild - Scan Orchestration and Triage Daemon
//!
//! Library components for the worker process: durable storage, the job
//! queue, the analyzer driver, the per-finding triage workflow, and the
//! coordinator that ties them together. The daemon is driven entirely
//! through the job queue; callers enqueue jobs and poll the scan row plus
//! the progress side-channel.

pub mod coordinator;
pub mod epss;
pub mod llm;
pub mod progress;
pub mod publisher;
pub mod queue;
pub mod sandbox;
pub mod scanner;
pub mod secrets;
pub mod storage;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_core::{Config, JobPayload};

use coordinator::Coordinator;
use llm::{HttpModelClient, LlmConfig};
use publisher::GitHubPublisher;
use queue::{DeliveredJob, JobQueue, QueueError};
use sandbox::HttpSandboxClient;
use storage::Storage;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Grace period for in-flight jobs to observe cancellation during shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Backoff after queue errors before retrying.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

type HttpCoordinator = Coordinator<HttpModelClient, HttpSandboxClient, GitHubPublisher>;

/// The worker daemon: claims jobs from the durable queue and runs the scan
/// pipeline.
pub struct Daemon {
    queue: Arc<JobQueue>,
    coordinator: Arc<HttpCoordinator>,
    config: Config,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Construct process-lifetime resources: storage, queue, HTTP clients.
    pub async fn new(config: Config) -> AppResult<Self> {
        let storage = Arc::new(Storage::new(&config.db_path()).await?);
        storage.migrate_embedded().await?;

        let queue = Arc::new(JobQueue::new(storage.pool(), config.worker_concurrency));
        let recovered = queue.recover().await?;
        if recovered > 0 {
            warn!(count = recovered, "re-queued jobs from a previous worker run");
        }

        let model = HttpModelClient::new(LlmConfig::from_config(&config))?;
        let sandbox = HttpSandboxClient::new(&config.sandbox_service_url)?;
        let publisher = GitHubPublisher::new(&config)?;
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&storage),
            config.clone(),
            model,
            sandbox,
            publisher,
        ));

        Ok(Self {
            queue,
            coordinator,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Signal graceful shutdown: no new claims, in-flight jobs observe the
    /// cancellation token at their next boundary.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.cancel.cancel();
        self.queue.shutdown();
    }

    /// Main worker loop: claim, dispatch, acknowledge.
    pub async fn run(&self) -> AppResult<()> {
        let poll_interval = Duration::from_millis(self.config.queue_poll_interval_ms);
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(
            concurrency = self.config.worker_concurrency,
            "worker loop started"
        );

        loop {
            // Reap finished job tasks without blocking.
            while tasks.try_join_next().is_some() {}

            if self.cancel.is_cancelled() {
                break;
            }

            match self.queue.claim_next().await {
                Ok(Some(job)) => {
                    let queue = Arc::clone(&self.queue);
                    let coordinator = Arc::clone(&self.coordinator);
                    let cancel = self.cancel.child_token();
                    tasks.spawn(async move {
                        handle_job(&coordinator, &queue, job, &cancel).await;
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(poll_interval) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
                Err(QueueError::Shutdown) => break,
                Err(e) => {
                    error!(error = %e, "queue claim failed");
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                }
            }
        }

        // Give in-flight jobs a moment to settle before the process exits.
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, drain).await.is_err() {
            warn!("in-flight jobs did not settle within the grace period");
        }

        info!("worker loop stopped");
        Ok(())
    }
}

/// Run one claimed job to completion and settle it with the queue.
async fn handle_job(
    coordinator: &HttpCoordinator,
    queue: &JobQueue,
    job: DeliveredJob,
    cancel: &CancellationToken,
) {
    let started = std::time::Instant::now();
    info!(
        event = "job_started",
        job_id = %job.id,
        task_name = job.kind.as_str(),
        retry_count = job.retry_count,
        "job started"
    );

    let result = match job.payload {
        JobPayload::ExecuteScanJob(scan) => coordinator.handle_scan_job(scan, cancel).await,
        JobPayload::ExecuteTriageJob(triage) => coordinator.handle_triage_job(triage, cancel).await,
    };

    let duration_s = started.elapsed().as_secs_f64();
    match result {
        Ok(()) => {
            info!(
                event = "job_completed",
                job_id = %job.id,
                task_name = job.kind.as_str(),
                duration_s,
                "job completed"
            );
            if let Err(e) = queue.ack(&job.id).await {
                error!(job_id = %job.id, error = %e, "ack failed");
            }
        }
        Err(e) => {
            error!(
                event = "job_failed",
                job_id = %job.id,
                task_name = job.kind.as_str(),
                error = %e,
                duration_s,
                "job failed"
            );
            if let Err(nack_err) = queue.nack(&job.id, &e.to_string()).await {
                error!(job_id = %job.id, error = %nack_err, "nack failed");
            }
        }
    }
}
