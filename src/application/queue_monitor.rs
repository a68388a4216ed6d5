//! Health, insights and the periodic stuck-job sweep for the sync queue.

use crate::application::job_queue::JobQueue;
use crate::domain::job::{Job, JobState};
use crate::infrastructure::config::QueueSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::job_store::JobStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Error recorded on jobs reclaimed by the stuck-job sweep.
pub const STALLED_JOB_ERROR: &str = "job stalled: exceeded processing threshold";

const TOP_FAILURE_REASONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub stats: JobStats,
    pub paused: bool,
}

pub fn assess_health(stats: JobStats, paused: bool, settings: &QueueSettings) -> QueueHealth {
    let mut issues = Vec::new();
    if stats.active > settings.max_active_jobs {
        issues.push(format!(
            "too many active jobs: {} (threshold {})",
            stats.active, settings.max_active_jobs
        ));
    }
    if stats.waiting > settings.max_waiting_jobs {
        issues.push(format!(
            "too many waiting jobs: {} (threshold {})",
            stats.waiting, settings.max_waiting_jobs
        ));
    }
    if stats.failed > settings.max_failed_jobs {
        issues.push(format!(
            "too many failed jobs: {} (threshold {})",
            stats.failed, settings.max_failed_jobs
        ));
    }
    if paused {
        issues.push("queue is paused".to_string());
    }

    QueueHealth {
        healthy: issues.is_empty(),
        issues,
        stats,
        paused,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInsights {
    pub average_processing_ms: Option<u64>,
    pub max_processing_ms: Option<u64>,
    /// Completed share of finished jobs; cancelled jobs are not counted.
    pub success_rate: Option<f64>,
    pub top_failure_reasons: Vec<FailureReason>,
    pub oldest_waiting_age_seconds: Option<i64>,
}

pub fn compute_insights(jobs: &[Job], now: DateTime<Utc>) -> QueueInsights {
    let processing: Vec<u64> = jobs
        .iter()
        .filter(|job| job.state == JobState::Completed)
        .filter_map(|job| match (job.started_at, job.finished_at) {
            (Some(started), Some(finished)) => Some((finished - started).num_milliseconds().max(0) as u64),
            _ => None,
        })
        .collect();
    let average_processing_ms = if processing.is_empty() {
        None
    } else {
        Some(processing.iter().sum::<u64>() / processing.len() as u64)
    };

    let completed = jobs.iter().filter(|job| job.state == JobState::Completed).count();
    let failed: Vec<&Job> = jobs.iter().filter(|job| job.state == JobState::Failed).collect();
    let finished = completed + failed.len();
    let success_rate = (finished > 0).then(|| completed as f64 / finished as f64);

    let mut reasons: HashMap<&str, usize> = HashMap::new();
    for job in &failed {
        let reason = job.error.as_deref().unwrap_or("unknown error");
        *reasons.entry(reason).or_default() += 1;
    }
    let mut top_failure_reasons: Vec<FailureReason> = reasons
        .into_iter()
        .map(|(reason, count)| FailureReason {
            reason: reason.to_string(),
            count,
        })
        .collect();
    top_failure_reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    top_failure_reasons.truncate(TOP_FAILURE_REASONS);

    let oldest_waiting_age_seconds = jobs
        .iter()
        .filter(|job| job.state == JobState::Waiting)
        .map(|job| job.created_at)
        .min()
        .map(|created_at| (now - created_at).num_seconds().max(0));

    QueueInsights {
        average_processing_ms,
        max_processing_ms: processing.iter().copied().max(),
        success_rate,
        top_failure_reasons,
        oldest_waiting_age_seconds,
    }
}

#[derive(Debug, Default)]
struct MonitorCounters {
    ticks: AtomicU64,
    errors: AtomicU64,
    reclaimed: AtomicU64,
    purged: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    pub ticks: u64,
    pub errors: u64,
    pub reclaimed: u64,
    pub purged: u64,
}

pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    counters: Arc<MonitorCounters>,
}

impl MonitorHandle {
    pub fn stats(&self) -> MonitorStats {
        snapshot(&self.counters)
    }

    pub async fn shutdown(self) -> MonitorStats {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.join.await {
            error!(error = %error, "queue monitor task ended abnormally");
        }
        snapshot(&self.counters)
    }
}

fn snapshot(counters: &MonitorCounters) -> MonitorStats {
    MonitorStats {
        ticks: counters.ticks.load(Ordering::Relaxed),
        errors: counters.errors.load(Ordering::Relaxed),
        reclaimed: counters.reclaimed.load(Ordering::Relaxed),
        purged: counters.purged.load(Ordering::Relaxed),
    }
}

/// Periodically reclaims stuck jobs and reports queue health.
pub struct QueueMonitor {
    queue: Arc<JobQueue>,
    interval: Duration,
    counters: Arc<MonitorCounters>,
}

impl QueueMonitor {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let interval = Duration::from_secs(queue.settings().monitor_interval_seconds.max(1));
        Self {
            queue,
            interval,
            counters: Arc::new(MonitorCounters::default()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sweep: stuck cleanup first, then health.
    pub fn tick(&self) -> Result<QueueHealth, InfraError> {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let reclaimed = self.queue.cleanup_stuck()?;
        if !reclaimed.is_empty() {
            self.counters
                .reclaimed
                .fetch_add(reclaimed.len() as u64, Ordering::Relaxed);
        }
        let purged = self.queue.purge_finished()?;
        self.counters.purged.fetch_add(purged as u64, Ordering::Relaxed);

        let health = self.queue.health()?;
        if health.healthy {
            info!(
                waiting = health.stats.waiting,
                active = health.stats.active,
                failed = health.stats.failed,
                "sync queue healthy"
            );
        } else {
            warn!(issues = ?health.issues, "sync queue unhealthy");
        }
        Ok(health)
    }

    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let counters = Arc::clone(&self.counters);

        let join = tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "queue monitor started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(error) = self.tick() {
                            let errors = self.counters.errors.fetch_add(1, Ordering::Relaxed) + 1;
                            error!(error = %error, errors, "queue monitor sweep failed");
                        }
                    }
                }
            }

            info!("queue monitor stopped");
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            join,
            counters,
        }
    }
}
