use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::GoogleCalendarEvent;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use url::Url;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const NETWORK_TIMEOUT_MESSAGE: &str = "network timeout";

/// Raw Google Calendar v3 event operations. Retry and token handling live above this seam.
#[async_trait]
pub trait GoogleCalendarApi: Send + Sync {
    async fn insert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<GoogleCalendarEvent, InfraError>;

    /// Full replace of the event. `if_match` is sent as `If-Match`.
    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
        if_match: Option<&str>,
    ) -> Result<GoogleCalendarEvent, InfraError>;

    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<GoogleCalendarEvent, InfraError>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestGoogleCalendarClient {
    client: Client,
}

impl ReqwestGoogleCalendarClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Validation(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn events_endpoint(calendar_id: &str) -> Result<Url, InfraError> {
        let mut url = Url::parse(CALENDAR_API_BASE)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid calendar api base url: {error}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("calendar api base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("calendars");
            segments.push(calendar_id);
            segments.push("events");
        }
        Ok(url)
    }

    fn event_endpoint(calendar_id: &str, event_id: &str) -> Result<Url, InfraError> {
        let mut url = Self::events_endpoint(calendar_id)?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("calendar events URL cannot be a base".to_string())
            })?;
            segments.push(event_id);
        }
        Ok(url)
    }

    /// Sends the request and returns the body of a successful response.
    async fn execute(
        request: RequestBuilder,
        action: &str,
        event_id: Option<&str>,
    ) -> Result<String, InfraError> {
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|error| transport_error(error, action))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| transport_error(error, action))?;

        if !status.is_success() {
            return Err(classify_status(status, &body, event_id));
        }
        Ok(body)
    }

    fn parse_event(body: &str, action: &str) -> Result<GoogleCalendarEvent, InfraError> {
        let parsed: GoogleCalendarEvent = serde_json::from_str(body).map_err(|error| {
            InfraError::Remote {
                status: 200,
                message: format!("invalid {action} payload: {error}; body={body}"),
            }
        })?;
        if parsed.id.as_deref().map(str::trim).is_none_or(str::is_empty) {
            return Err(InfraError::Remote {
                status: 200,
                message: format!("{action} response did not include id"),
            });
        }
        Ok(parsed)
    }
}

fn transport_error(error: reqwest::Error, action: &str) -> InfraError {
    if error.is_timeout() {
        InfraError::Transient(NETWORK_TIMEOUT_MESSAGE.to_string())
    } else {
        InfraError::Transient(format!("network error while {action}: {error}"))
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct GoogleErrorEnvelope {
    error: Option<GoogleErrorBody>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct GoogleErrorBody {
    message: Option<String>,
    #[serde(default)]
    errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, serde::Deserialize)]
struct GoogleErrorItem {
    reason: Option<String>,
}

/// Maps a non-success Google response onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str, event_id: Option<&str>) -> InfraError {
    let envelope: GoogleErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let error_body = envelope.error.unwrap_or_default();
    let reasons: Vec<&str> = error_body
        .errors
        .iter()
        .filter_map(|item| item.reason.as_deref())
        .collect();
    let message = error_body
        .message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("google calendar api error: http {}", status.as_u16()));
    let has_reason = |candidates: &[&str]| reasons.iter().any(|reason| candidates.contains(reason));

    match status.as_u16() {
        403 | 429 if has_reason(&["quotaExceeded", "dailyLimitExceeded"]) => {
            InfraError::QuotaExceeded(message)
        }
        403 if has_reason(&["rateLimitExceeded", "userRateLimitExceeded"]) => {
            InfraError::RateLimited(message)
        }
        429 => InfraError::RateLimited(message),
        401 | 403 => InfraError::Auth(message),
        404 | 410 => InfraError::NotFound(event_id.map(ToOwned::to_owned).unwrap_or(message)),
        412 => InfraError::PreconditionFailed {
            remote_event_id: event_id.unwrap_or_default().to_string(),
        },
        code if status.is_server_error() => {
            InfraError::Transient(format!("google calendar api error: http {code}; {message}"))
        }
        code => InfraError::Remote {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl GoogleCalendarApi for ReqwestGoogleCalendarClient {
    async fn insert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = Self::events_endpoint(calendar_id)?;
        let request = self.client.post(endpoint).bearer_auth(access_token).json(event);
        let body = Self::execute(request, "creating event", None).await?;
        Self::parse_event(&body, "event create")
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
        if_match: Option<&str>,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        let mut request = self.client.put(endpoint).bearer_auth(access_token).json(event);
        if let Some(etag) = if_match.map(str::trim).filter(|etag| !etag.is_empty()) {
            request = request.header(reqwest::header::IF_MATCH, etag);
        }
        let body = Self::execute(request, "updating event", Some(event_id)).await?;
        Self::parse_event(&body, "event update")
    }

    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        let request = self.client.get(endpoint).bearer_auth(access_token);
        let body = Self::execute(request, "fetching event", Some(event_id)).await?;
        Self::parse_event(&body, "event get")
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        let request = self.client.delete(endpoint).bearer_auth(access_token);
        Self::execute(request, "deleting event", Some(event_id)).await?;
        Ok(())
    }
}
