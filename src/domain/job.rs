//! Queue-level job records wrapping a sync request.

use crate::domain::models::{SyncRequest, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be picked up
    Waiting,
    /// Automatic retry held until `scheduled_at`
    Delayed,
    /// Currently being executed
    Active,
    Completed,
    Failed,
    /// Withdrawn by the caller before it ever ran again
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    /// States whose idempotency key still claims the request.
    pub fn holds_idempotency_key(self) -> bool {
        matches!(
            self,
            Self::Waiting | Self::Delayed | Self::Active | Self::Completed
        )
    }
}

/// Exponential backoff for automatic job retries: base * 2^(attempt - 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl JobRetryPolicy {
    /// Delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: String,
    pub request: SyncRequest,
    pub idempotency_key: String,
    pub state: JobState,
    pub retry_policy: JobRetryPolicy,
    /// Current attempt number (starts at 0)
    pub attempt: u32,
    /// Percentage of candidate events processed in the current attempt
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub result: Option<SyncResult>,
    pub error: Option<String>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    pub fn new(user_id: impl Into<String>, request: SyncRequest, now: DateTime<Utc>) -> Self {
        let idempotency_key = request.idempotency_key.clone();
        Self {
            id: JobId::new(),
            user_id: user_id.into(),
            request,
            idempotency_key,
            state: JobState::Waiting,
            retry_policy: JobRetryPolicy::default(),
            attempt: 0,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            scheduled_at: None,
            result: None,
            error: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: JobRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.scheduled_at.is_none_or(|at| now >= at),
            _ => false,
        }
    }

    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempt += 1;
        self.progress = 0;
        self.started_at = Some(now);
        self.scheduled_at = None;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: SyncResult, now: DateTime<Utc>) {
        self.push_history(true, None, now);
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Fails the attempt; retryable errors are rescheduled while attempts remain.
    pub fn mark_failed(&mut self, error: String, retryable: bool, now: DateTime<Utc>) {
        self.push_history(false, Some(error.clone()), now);
        self.error = Some(error);
        self.updated_at = now;

        if retryable && self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.state = JobState::Delayed;
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
        }
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Cancelled;
        self.scheduled_at = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Manual retry of a failed job; attempts start over.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.attempt = 0;
        self.progress = 0;
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
        self.scheduled_at = None;
        self.updated_at = now;
    }

    fn push_history(&mut self, success: bool, error: Option<String>, now: DateTime<Utc>) {
        let started_at = self.started_at.unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DateRange, SyncDirection};
    use chrono::NaiveDate;

    fn sample_request() -> SyncRequest {
        SyncRequest {
            direction: SyncDirection::UpsertToGoogle,
            range: DateRange::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
                NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date"),
            ),
            event_ids: None,
            dry_run: false,
            idempotency_key: "job-key-0000000001".to_string(),
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = JobRetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn job_carries_request_idempotency_key() {
        let job = Job::new("user-1", sample_request(), Utc::now());
        assert_eq!(job.idempotency_key, job.request.idempotency_key);
        assert_eq!(job.state, JobState::Waiting);
    }

    #[test]
    fn retryable_failure_is_delayed_until_attempts_run_out() {
        let now = Utc::now();
        let mut job = Job::new("user-1", sample_request(), now).with_retry_policy(JobRetryPolicy {
            max_attempts: 2,
            ..Default::default()
        });

        job.mark_active(now);
        job.mark_failed("network timeout".to_string(), true, now);
        assert_eq!(job.state, JobState::Delayed);
        assert!(!job.is_ready(now));

        job.mark_active(now);
        job.mark_failed("network timeout".to_string(), true, now);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn non_retryable_failure_fails_immediately() {
        let now = Utc::now();
        let mut job = Job::new("user-1", sample_request(), now);
        job.mark_active(now);
        job.mark_failed("unauthorized".to_string(), false, now);
        assert_eq!(job.state, JobState::Failed);

        job.requeue(now);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempt, 0);
    }
}
