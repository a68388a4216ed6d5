//! Asynchronous sync job queue and its worker.

use crate::application::calendar_sync::{ProgressReporter, SyncExecutor};
use crate::application::idempotency::validate_request_key;
use crate::application::queue_monitor::{assess_health, compute_insights, QueueHealth, QueueInsights, STALLED_JOB_ERROR};
use crate::domain::job::{Job, JobId, JobRetryPolicy, JobState};
use crate::domain::models::SyncRequest;
use crate::infrastructure::config::QueueSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::job_store::{JobStats, JobStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    #[serde(flatten)]
    pub jobs: JobStats,
    pub paused: bool,
}

/// Facade over the job store: submission, lookups and operator controls.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
    paused: AtomicBool,
    wakeup: Notify,
    now_provider: NowProvider,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, settings: QueueSettings) -> Self {
        Self {
            store,
            settings,
            paused: AtomicBool::new(false),
            wakeup: Notify::new(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    /// Enqueues a sync pass. A request whose key is still claimed by a job returns that job.
    pub fn submit(&self, user_id: &str, request: SyncRequest) -> Result<Job, InfraError> {
        if user_id.trim().is_empty() {
            return Err(InfraError::Validation("user id must not be empty".to_string()));
        }
        validate_request_key(&request.idempotency_key)?;

        if let Some(existing) = self
            .store
            .find_by_idempotency_key(user_id, &request.idempotency_key)?
        {
            info!(
                user_id,
                job_id = %existing.id,
                idempotency_key = %request.idempotency_key,
                state = ?existing.state,
                "duplicate sync submission"
            );
            return Ok(existing);
        }

        let stats = self.store.stats()?;
        if stats.pending() >= self.settings.max_waiting_jobs {
            return Err(InfraError::InvalidJobState(format!(
                "queue is full: {} jobs waiting (limit {})",
                stats.pending(),
                self.settings.max_waiting_jobs
            )));
        }

        let job = Job::new(user_id, request, self.now()).with_retry_policy(JobRetryPolicy {
            max_attempts: self.settings.max_attempts.max(1),
            base_delay: Duration::from_millis(self.settings.retry_base_delay_ms),
            max_delay: MAX_RETRY_DELAY,
        });
        self.store.insert(job.clone())?;
        info!(user_id, job_id = %job.id, dry_run = job.request.dry_run, "sync job submitted");
        self.wakeup.notify_one();
        Ok(job)
    }

    pub fn status(&self, job_id: JobId) -> Result<Job, InfraError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| InfraError::JobNotFound(job_id.to_string()))
    }

    /// Only jobs that are not running and not finished can be cancelled.
    pub fn cancel(&self, job_id: JobId) -> Result<Job, InfraError> {
        let mut job = self.status(job_id)?;
        if !job.state.is_cancellable() {
            return Err(InfraError::InvalidJobState(format!(
                "job {job_id} is {:?} and cannot be cancelled",
                job.state
            )));
        }
        job.mark_cancelled(self.now());
        self.store.update(&job)?;
        info!(job_id = %job_id, user_id = %job.user_id, "sync job cancelled");
        Ok(job)
    }

    /// Moves a failed job back to waiting with a fresh attempt budget.
    pub fn retry(&self, job_id: JobId) -> Result<Job, InfraError> {
        let mut job = self.status(job_id)?;
        if job.state != JobState::Failed {
            return Err(InfraError::InvalidJobState(format!(
                "job {job_id} is {:?}; only failed jobs can be retried",
                job.state
            )));
        }
        if let Some(other) = self
            .store
            .find_by_idempotency_key(&job.user_id, &job.idempotency_key)?
        {
            return Err(InfraError::InvalidJobState(format!(
                "idempotency key of job {job_id} is already claimed by job {}",
                other.id
            )));
        }

        job.requeue(self.now());
        self.store.update(&job)?;
        info!(job_id = %job_id, user_id = %job.user_id, "sync job requeued");
        self.wakeup.notify_one();
        Ok(job)
    }

    pub fn stats(&self) -> Result<QueueStats, InfraError> {
        Ok(QueueStats {
            jobs: self.store.stats()?,
            paused: self.is_paused(),
        })
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("sync queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("sync queue resumed");
            self.wakeup.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Polls until the job reaches a terminal state.
    pub async fn wait_for_result(&self, job_id: JobId, timeout: Duration) -> Result<Job, InfraError> {
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        let wait = async {
            loop {
                let job = self.status(job_id)?;
                if job.state.is_terminal() {
                    break Ok::<Job, InfraError>(job);
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| InfraError::JobTimedOut(job_id.to_string()))?
    }

    pub fn health(&self) -> Result<QueueHealth, InfraError> {
        Ok(assess_health(self.store.stats()?, self.is_paused(), &self.settings))
    }

    pub fn insights(&self) -> Result<QueueInsights, InfraError> {
        let jobs = self.store.list_by_state(None, usize::MAX)?;
        Ok(compute_insights(&jobs, self.now()))
    }

    /// Fails active jobs whose attempt started before the staleness threshold.
    pub fn cleanup_stuck(&self) -> Result<Vec<JobId>, InfraError> {
        let now = self.now();
        let cutoff = now - chrono::Duration::seconds(self.settings.stuck_job_threshold_seconds);
        let mut reclaimed = Vec::new();

        for mut job in self.store.list_by_state(Some(JobState::Active), usize::MAX)? {
            if job.started_at.is_none_or(|started| started >= cutoff) {
                continue;
            }
            job.mark_failed(STALLED_JOB_ERROR.to_string(), false, now);
            self.store.update(&job)?;
            warn!(
                job_id = %job.id,
                user_id = %job.user_id,
                attempt = job.attempt,
                "reclaimed stuck sync job"
            );
            reclaimed.push(job.id);
        }
        Ok(reclaimed)
    }

    /// Drops finished jobs older than the retention window.
    pub fn purge_finished(&self) -> Result<usize, InfraError> {
        let cutoff = self.now() - chrono::Duration::seconds(self.settings.finished_retention_seconds);
        let purged = self.store.purge_finished(cutoff)?;
        if purged > 0 {
            debug!(purged, "purged finished sync jobs");
        }
        Ok(purged)
    }
}

pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops after the job in progress, if any, has finished.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.join.await {
            error!(error = %error, "queue worker task ended abnormally");
        }
    }
}

/// Claims ready jobs one at a time and runs them through the sync executor.
pub struct QueueWorker {
    queue: Arc<JobQueue>,
    executor: Arc<dyn SyncExecutor>,
    job_timeout: Duration,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(queue: Arc<JobQueue>, executor: Arc<dyn SyncExecutor>) -> Self {
        let job_timeout = Duration::from_secs(queue.settings.job_timeout_seconds);
        let poll_interval = Duration::from_millis(queue.settings.poll_interval_ms.max(1));
        Self {
            queue,
            executor,
            job_timeout,
            poll_interval,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Runs at most one job. Returns it in its post-attempt state.
    pub async fn run_once(&self) -> Result<Option<Job>, InfraError> {
        if self.queue.is_paused() {
            return Ok(None);
        }
        let Some(job) = self.queue.store.claim_next(self.queue.now())? else {
            return Ok(None);
        };
        info!(
            job_id = %job.id,
            user_id = %job.user_id,
            attempt = job.attempt,
            "sync job started"
        );

        let outcome = tokio::time::timeout(
            self.job_timeout,
            self.executor
                .execute(&job.user_id, &job.request, Some(self.progress_reporter(&job))),
        )
        .await
        .unwrap_or_else(|_| Err(InfraError::JobTimedOut(job.id.to_string())));

        self.finish(job, outcome).map(Some)
    }

    fn progress_reporter(&self, job: &Job) -> ProgressReporter {
        let store = Arc::clone(&self.queue.store);
        let job_id = job.id;
        let attempt = job.attempt;
        Arc::new(move |processed, total| {
            let percent = if total == 0 {
                100
            } else {
                (processed.min(total) * 100 / total) as u8
            };
            let update = store.get(job_id).and_then(|stored| match stored {
                Some(mut stored) if stored.state == JobState::Active && stored.attempt == attempt => {
                    stored.progress = percent;
                    store.update(&stored)
                }
                _ => Ok(()),
            });
            if let Err(error) = update {
                debug!(job_id = %job_id, error = %error, "could not record job progress");
            }
        })
    }

    fn finish(
        &self,
        claimed: Job,
        outcome: Result<crate::domain::models::SyncResult, InfraError>,
    ) -> Result<Job, InfraError> {
        let now = self.queue.now();
        let mut job = self.queue.status(claimed.id)?;
        if job.state != JobState::Active || job.attempt != claimed.attempt {
            warn!(
                job_id = %job.id,
                state = ?job.state,
                "sync job was reclaimed while running; discarding its outcome"
            );
            return Ok(job);
        }

        match outcome {
            Ok(result) => {
                info!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    created = result.summary.created,
                    updated = result.summary.updated,
                    failed = result.summary.failed,
                    conflicts = result.conflicts.len(),
                    "sync job completed"
                );
                job.mark_completed(result, now);
            }
            Err(error) => {
                job.mark_failed(error.to_string(), error.is_retryable(), now);
                if job.state == JobState::Delayed {
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempt,
                        retry_at = ?job.scheduled_at,
                        error = %error,
                        "sync job failed; retry scheduled"
                    );
                } else {
                    error!(
                        job_id = %job.id,
                        user_id = %job.user_id,
                        attempt = job.attempt,
                        error = %error,
                        "sync job failed"
                    );
                }
            }
        }
        self.queue.store.update(&job)?;
        Ok(job)
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!("queue worker started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match self.run_once().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(error) => error!(error = %error, "queue worker could not process a job"),
                }

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.queue.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            info!("queue worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
