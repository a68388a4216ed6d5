//! Job storage for the sync queue.

use crate::domain::job::{Job, JobId, JobState};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

pub trait JobStore: Send + Sync {
    fn insert(&self, job: Job) -> Result<JobId, InfraError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, InfraError>;

    /// Replaces a stored job; `JobNotFound` when it was never inserted.
    fn update(&self, job: &Job) -> Result<(), InfraError>;

    /// Claims the oldest job that is ready at `now` and marks it active.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, InfraError>;

    /// Jobs ordered by creation time, optionally filtered by state.
    fn list_by_state(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, InfraError>;

    /// Job of `user_id` whose state still claims `idempotency_key`.
    fn find_by_idempotency_key(&self, user_id: &str, idempotency_key: &str) -> Result<Option<Job>, InfraError>;

    fn stats(&self) -> Result<JobStats, InfraError>;

    /// Removes terminal jobs that finished before `before`. Returns how many were removed.
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, InfraError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    /// Jobs that have not started their current attempt yet.
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<JobId, InfraError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;
        if jobs.contains_key(&job.id) {
            return Err(InfraError::InvalidJobState(format!("job {} already exists", job.id)));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, InfraError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), InfraError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(InfraError::JobNotFound(job.id.to_string())),
        }
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, InfraError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;

        // FIFO by creation time; the uuid v7 id breaks ties in insertion order.
        let next = jobs
            .values()
            .filter(|job| job.is_ready(now))
            .min_by_key(|job| (job.created_at, job.id.0))
            .map(|job| job.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_active(now);
                job.clone()
            })
        }))
    }

    fn list_by_state(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, InfraError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|job| state.map_or(true, |wanted| job.state == wanted))
            .cloned()
            .collect();
        result.sort_by_key(|job| (job.created_at, job.id.0));
        result.truncate(limit);
        Ok(result)
    }

    fn find_by_idempotency_key(&self, user_id: &str, idempotency_key: &str) -> Result<Option<Job>, InfraError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;
        Ok(jobs
            .values()
            .filter(|job| {
                job.user_id == user_id
                    && job.idempotency_key == idempotency_key
                    && job.state.holds_idempotency_key()
            })
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    fn stats(&self) -> Result<JobStats, InfraError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Delayed => stats.delayed += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, InfraError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| InfraError::lock_poisoned("job store", e))?;
        let initial = jobs.len();
        jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.finished_at.unwrap_or(job.updated_at) < before)
        });
        Ok(initial - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DateRange, SyncDirection, SyncRequest};
    use chrono::{Duration, NaiveDate};

    fn request(key: &str) -> SyncRequest {
        SyncRequest {
            direction: SyncDirection::UpsertToGoogle,
            range: DateRange::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
                NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date"),
            ),
            event_ids: None,
            dry_run: false,
            idempotency_key: key.to_string(),
        }
    }

    #[test]
    fn claims_oldest_ready_job_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let older = Job::new("user-1", request("key-aaaaaaaaaaaaaaaa"), now - Duration::seconds(10));
        let newer = Job::new("user-1", request("key-bbbbbbbbbbbbbbbb"), now);
        let newer_id = store.insert(newer).expect("insert");
        let older_id = store.insert(older).expect("insert");

        let claimed = store.claim_next(now).expect("claim").expect("job");
        assert_eq!(claimed.id, older_id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempt, 1);

        let claimed = store.claim_next(now).expect("claim").expect("job");
        assert_eq!(claimed.id, newer_id);
        assert!(store.claim_next(now).expect("claim").is_none());
    }

    #[test]
    fn delayed_jobs_wait_for_their_schedule() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut job = Job::new("user-1", request("key-aaaaaaaaaaaaaaaa"), now);
        job.mark_active(now);
        job.mark_failed("network timeout".to_string(), true, now);
        let scheduled = job.scheduled_at.expect("scheduled");
        store.insert(job).expect("insert");

        assert!(store.claim_next(now).expect("claim").is_none());
        assert!(store.claim_next(scheduled).expect("claim").is_some());
    }

    #[test]
    fn idempotency_lookup_ignores_failed_jobs_and_other_users() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let key = "key-aaaaaaaaaaaaaaaa";

        let mut failed = Job::new("user-1", request(key), now);
        failed.mark_active(now);
        failed.mark_failed("unauthorized".to_string(), false, now);
        store.insert(failed).expect("insert");
        store.insert(Job::new("user-2", request(key), now)).expect("insert");

        assert!(store.find_by_idempotency_key("user-1", key).expect("lookup").is_none());

        let waiting_id = store.insert(Job::new("user-1", request(key), now)).expect("insert");
        let found = store.find_by_idempotency_key("user-1", key).expect("lookup").expect("job");
        assert_eq!(found.id, waiting_id);
    }

    #[test]
    fn update_requires_existing_job_and_stats_follow_state() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = Job::new("user-1", request("key-aaaaaaaaaaaaaaaa"), now);
        assert!(matches!(store.update(&job), Err(InfraError::JobNotFound(_))));

        store.insert(job.clone()).expect("insert");
        store.insert(Job::new("user-1", request("key-bbbbbbbbbbbbbbbb"), now)).expect("insert");
        store.claim_next(now).expect("claim");

        let stats = store.stats().expect("stats");
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending(), 1);
        assert_eq!(
            store.list_by_state(Some(JobState::Active), 10).expect("list").len(),
            1
        );
        assert_eq!(store.list_by_state(None, 1).expect("list").len(), 1);
    }

    #[test]
    fn purge_drops_only_old_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let long_ago = now - Duration::days(2);

        let mut old_done = Job::new("user-1", request("key-aaaaaaaaaaaaaaaa"), long_ago);
        old_done.mark_active(long_ago);
        old_done.mark_completed(crate::domain::models::SyncResult::empty(false), long_ago);
        let mut old_cancelled = Job::new("user-1", request("key-bbbbbbbbbbbbbbbb"), long_ago);
        old_cancelled.mark_cancelled(long_ago);
        let mut recent_failed = Job::new("user-1", request("key-cccccccccccccccc"), now);
        recent_failed.mark_active(now);
        recent_failed.mark_failed("unauthorized".to_string(), false, now);
        let old_waiting = Job::new("user-1", request("key-dddddddddddddddd"), long_ago);
        let waiting_id = old_waiting.id;
        for job in [old_done, old_cancelled, recent_failed, old_waiting] {
            store.insert(job).expect("insert");
        }

        let removed = store.purge_finished(now - Duration::days(1)).expect("purge");

        assert_eq!(removed, 2);
        let stats = store.stats().expect("stats");
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.failed, 1);
        assert!(store.get(waiting_id).expect("get").is_some());
    }
}
