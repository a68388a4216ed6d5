use crate::application::oauth::AccessTokenProvider;
use crate::domain::models::QuotaStatus;
use crate::infrastructure::config::{EngineConfig, RetrySettings};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::GoogleCalendarEvent;
use crate::infrastructure::google_calendar_client::GoogleCalendarApi;
use crate::infrastructure::quota_tracker::QuotaTracker;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following the zero-based `attempt`: base, 2x base, 4x base...
    pub fn delay_after(&self, attempt: u8) -> TokioDuration {
        TokioDuration::from_millis(
            self.base_delay_ms
                .saturating_mul(2u64.saturating_pow(u32::from(attempt))),
        )
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay_ms: settings.base_delay_ms,
        }
    }
}

/// Quota units spent by remote calls issued on behalf of one caller.
#[derive(Debug, Default)]
pub struct QuotaMeter {
    used: AtomicU64,
}

impl QuotaMeter {
    pub fn add(&self, cost: u64) {
        self.used.fetch_add(cost, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWrite {
    pub remote_id: String,
    pub etag: Option<String>,
}

impl TryFrom<GoogleCalendarEvent> for RemoteWrite {
    type Error = InfraError;

    fn try_from(event: GoogleCalendarEvent) -> Result<Self, Self::Error> {
        let remote_id = event
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Remote {
                status: 200,
                message: "event response did not include id".to_string(),
            })?;
        Ok(Self {
            remote_id,
            etag: event.etag,
        })
    }
}

/// Google Calendar operations for one user, with token refresh, retries and quota accounting.
pub struct RemoteCalendarClient {
    api: Arc<dyn GoogleCalendarApi>,
    tokens: Arc<dyn AccessTokenProvider>,
    quota: Arc<dyn QuotaTracker>,
    calendar_id: String,
    cost_per_call: u64,
    retry_policy: RetryPolicy,
}

impl RemoteCalendarClient {
    pub fn new(
        api: Arc<dyn GoogleCalendarApi>,
        tokens: Arc<dyn AccessTokenProvider>,
        quota: Arc<dyn QuotaTracker>,
        calendar_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            tokens,
            quota,
            calendar_id: calendar_id.into(),
            cost_per_call: 1,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn from_config(
        api: Arc<dyn GoogleCalendarApi>,
        tokens: Arc<dyn AccessTokenProvider>,
        quota: Arc<dyn QuotaTracker>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(api, tokens, quota, config.calendar_id.clone())
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_cost_per_call(config.quota.cost_per_call)
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_cost_per_call(mut self, cost: u64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn tokens(&self) -> &Arc<dyn AccessTokenProvider> {
        &self.tokens
    }

    pub async fn create(
        &self,
        user_id: &str,
        event: &GoogleCalendarEvent,
        meter: &QuotaMeter,
    ) -> Result<RemoteWrite, InfraError> {
        let calendar_id = self.calendar_id.as_str();
        let created = self
            .with_retry(user_id, meter, "create", move |token| async move {
                self.api.insert_event(&token, calendar_id, event).await
            })
            .await?;
        RemoteWrite::try_from(created)
    }

    /// Replaces the remote event. With `etag` the write only succeeds if the remote copy is unchanged.
    pub async fn update(
        &self,
        user_id: &str,
        remote_id: &str,
        event: &GoogleCalendarEvent,
        etag: Option<&str>,
        meter: &QuotaMeter,
    ) -> Result<RemoteWrite, InfraError> {
        let calendar_id = self.calendar_id.as_str();
        let updated = self
            .with_retry(user_id, meter, "update", move |token| async move {
                self.api
                    .update_event(&token, calendar_id, remote_id, event, etag)
                    .await
            })
            .await?;
        RemoteWrite::try_from(updated)
    }

    /// Deleting an event that is already gone succeeds.
    pub async fn delete(&self, user_id: &str, remote_id: &str, meter: &QuotaMeter) -> Result<(), InfraError> {
        let calendar_id = self.calendar_id.as_str();
        let deleted = self
            .with_retry(user_id, meter, "delete", move |token| async move {
                self.api.delete_event(&token, calendar_id, remote_id).await
            })
            .await;
        match deleted {
            Ok(()) => Ok(()),
            Err(InfraError::NotFound(_)) => {
                debug!(user_id, remote_id, "remote event already absent");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    pub async fn get(
        &self,
        user_id: &str,
        remote_id: &str,
        meter: &QuotaMeter,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        let calendar_id = self.calendar_id.as_str();
        self.with_retry(user_id, meter, "get", move |token| async move {
            self.api.get_event(&token, calendar_id, remote_id).await
        })
        .await
    }

    /// Creates events in input order; one failure never affects the others.
    pub async fn create_batch(
        &self,
        user_id: &str,
        events: &[GoogleCalendarEvent],
        meter: &QuotaMeter,
    ) -> Vec<Result<RemoteWrite, InfraError>> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.create(user_id, event, meter).await);
        }
        results
    }

    pub fn remaining_quota(&self, user_id: &str) -> Result<QuotaStatus, InfraError> {
        self.quota.remaining(user_id)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        user_id: &str,
        meter: &QuotaMeter,
        operation: &str,
        mut call: F,
    ) -> Result<T, InfraError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            let token = self.tokens.ensure_valid_token(user_id).await?;
            self.charge(user_id, meter)?;

            match call(token.access_token).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.retry_policy.delay_after(attempt);
                    warn!(
                        user_id,
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying google calendar call"
                    );
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn charge(&self, user_id: &str, meter: &QuotaMeter) -> Result<(), InfraError> {
        let status = self.quota.remaining(user_id)?;
        if status.remaining < self.cost_per_call {
            return Err(InfraError::QuotaExceeded(format!(
                "daily google calendar quota exhausted for user {user_id}; resets at {}",
                status.reset_time.to_rfc3339()
            )));
        }
        self.quota.record_usage(user_id, self.cost_per_call)?;
        meter.add(self.cost_per_call);
        Ok(())
    }
}
