//! Fakes shared by application-layer tests.

use crate::application::oauth::AccessTokenProvider;
use crate::domain::models::{EventKind, EventStatus, LocalEvent, OAuthToken};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{encode_local_event, local_event_id, GoogleCalendarEvent};
use crate::infrastructure::google_calendar_client::{GoogleCalendarApi, NETWORK_TIMEOUT_MESSAGE};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Transient,
    Timeout,
    Auth,
    NotFound,
    BadRequest,
}

impl FakeFailure {
    fn into_error(self, remote_id: Option<&str>) -> InfraError {
        match self {
            Self::Transient => InfraError::Transient("google calendar api error: http 503".to_string()),
            Self::Timeout => InfraError::Transient(NETWORK_TIMEOUT_MESSAGE.to_string()),
            Self::Auth => InfraError::Auth("invalid credentials".to_string()),
            Self::NotFound => InfraError::NotFound(remote_id.unwrap_or("event").to_string()),
            Self::BadRequest => InfraError::Remote {
                status: 400,
                message: "invalid event payload".to_string(),
            },
        }
    }
}

/// In-memory Google calendar with real ETag semantics and scripted failures.
#[derive(Debug, Default)]
pub struct FakeGoogleCalendarApi {
    events: Mutex<HashMap<String, GoogleCalendarEvent>>,
    next_version: AtomicUsize,
    insert_script: Mutex<VecDeque<FakeFailure>>,
    insert_failures: Mutex<HashMap<String, FakeFailure>>,
    update_failures: Mutex<HashMap<String, FakeFailure>>,
    get_failures: Mutex<HashMap<String, FakeFailure>>,
    insert_times: Mutex<Vec<Instant>>,
    pub insert_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl FakeGoogleCalendarApi {
    /// Failures returned by the next insert calls, in order.
    pub fn script_inserts(&self, failures: Vec<FakeFailure>) {
        self.insert_script.lock().expect("script lock").extend(failures);
    }

    /// Every insert of the given local event fails.
    pub fn fail_inserts_for(&self, local_id: &str, failure: FakeFailure) {
        self.insert_failures
            .lock()
            .expect("failures lock")
            .insert(local_id.to_string(), failure);
    }

    pub fn fail_updates_for(&self, remote_id: &str, failure: FakeFailure) {
        self.update_failures
            .lock()
            .expect("failures lock")
            .insert(remote_id.to_string(), failure);
    }

    pub fn fail_gets_for(&self, remote_id: &str, failure: FakeFailure) {
        self.get_failures
            .lock()
            .expect("failures lock")
            .insert(remote_id.to_string(), failure);
    }

    /// Stores `event` as if it already existed remotely and returns its etag.
    pub fn seed_remote(&self, remote_id: &str, mut event: GoogleCalendarEvent) -> String {
        let etag = self.next_etag();
        event.id = Some(remote_id.to_string());
        event.etag = Some(etag.clone());
        self.events
            .lock()
            .expect("events lock")
            .insert(remote_id.to_string(), event);
        etag
    }

    /// Simulates an edit made directly in Google Calendar.
    pub fn touch_remote(&self, remote_id: &str) -> Option<String> {
        let etag = self.next_etag();
        let mut events = self.events.lock().expect("events lock");
        let event = events.get_mut(remote_id)?;
        event.etag = Some(etag.clone());
        Some(etag)
    }

    pub fn remote(&self, remote_id: &str) -> Option<GoogleCalendarEvent> {
        self.events.lock().expect("events lock").get(remote_id).cloned()
    }

    /// When each insert call arrived, in order.
    pub fn insert_times(&self) -> Vec<Instant> {
        self.insert_times.lock().expect("times lock").clone()
    }

    pub fn remote_count(&self) -> usize {
        self.events.lock().expect("events lock").len()
    }

    pub fn total_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
            + self.update_calls.load(Ordering::SeqCst)
            + self.get_calls.load(Ordering::SeqCst)
            + self.delete_calls.load(Ordering::SeqCst)
    }

    fn next_etag(&self) -> String {
        format!("\"v{}\"", self.next_version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn scripted_failure(map: &Mutex<HashMap<String, FakeFailure>>, key: &str) -> Option<FakeFailure> {
        map.lock().expect("failures lock").get(key).copied()
    }
}

#[async_trait]
impl GoogleCalendarApi for FakeGoogleCalendarApi {
    async fn insert_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.insert_times.lock().expect("times lock").push(Instant::now());
        if let Some(failure) = self.insert_script.lock().expect("script lock").pop_front() {
            return Err(failure.into_error(None));
        }
        if let Some(failure) = local_event_id(event)
            .and_then(|local_id| Self::scripted_failure(&self.insert_failures, local_id))
        {
            return Err(failure.into_error(None));
        }

        let remote_id = format!("remote-{}", self.next_version.load(Ordering::SeqCst) + 1);
        self.seed_remote(&remote_id, event.clone());
        Ok(self.remote(&remote_id).expect("just inserted"))
    }

    async fn update_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
        if_match: Option<&str>,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = Self::scripted_failure(&self.update_failures, event_id) {
            return Err(failure.into_error(Some(event_id)));
        }
        let current = self
            .remote(event_id)
            .ok_or_else(|| InfraError::NotFound(event_id.to_string()))?;
        if let Some(expected) = if_match {
            if current.etag.as_deref() != Some(expected) {
                return Err(InfraError::PreconditionFailed {
                    remote_event_id: event_id.to_string(),
                });
            }
        }
        self.seed_remote(event_id, event.clone());
        Ok(self.remote(event_id).expect("just updated"))
    }

    async fn get_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event_id: &str,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = Self::scripted_failure(&self.get_failures, event_id) {
            return Err(failure.into_error(Some(event_id)));
        }
        self.remote(event_id)
            .ok_or_else(|| InfraError::NotFound(event_id.to_string()))
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .expect("events lock")
            .remove(event_id)
            .map(|_| ())
            .ok_or_else(|| InfraError::NotFound(event_id.to_string()))
    }
}

/// Token provider with a fixed connected/disconnected account.
#[derive(Debug)]
pub struct StaticTokenProvider {
    connected: bool,
    pub token_calls: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn connected() -> Self {
        Self {
            connected: true,
            token_calls: AtomicUsize::new(0),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            token_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn ensure_valid_token(&self, user_id: &str) -> Result<OAuthToken, InfraError> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        if !self.connected {
            return Err(InfraError::Auth(format!("no google account connected for user {user_id}")));
        }
        Ok(OAuthToken {
            access_token: "test-access-token".to_string(),
            refresh_token: Some("test-refresh-token".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
            token_type: "Bearer".to_string(),
            scope: None,
        })
    }

    fn has_account(&self, _user_id: &str) -> Result<bool, InfraError> {
        Ok(self.connected)
    }
}

pub fn fixed_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .expect("valid datetime")
        .with_timezone(&Utc)
}

/// Planned lecture for `user-1` on 2024-01-(day).
pub fn planned_event(id: &str, day: u32) -> LocalEvent {
    LocalEvent {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        subject: "Calculus".to_string(),
        section: Some("A".to_string()),
        kind: EventKind::Lecture,
        notes: None,
        date: NaiveDate::from_ymd_opt(2024, 1, day).expect("valid date"),
        start_time: NaiveTime::from_hms_opt(8, 0, 0).expect("valid time"),
        end_time: NaiveTime::from_hms_opt(9, 30, 0).expect("valid time"),
        room: Some("H-1".to_string()),
        skip_window: false,
        status: EventStatus::Planned,
        remote_event_id: None,
        remote_etag: None,
        updated_at: fixed_time(),
    }
}

/// Remote payload for a planned event with the given local id.
pub fn remote_event(local_id: &str) -> GoogleCalendarEvent {
    encode_local_event(&planned_event(local_id, 10), &EngineConfig::default(), Tz::UTC)
        .expect("encode sample event")
}
