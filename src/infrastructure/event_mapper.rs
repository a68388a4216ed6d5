use crate::domain::models::{LocalEvent, RemoteSnapshot};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

const KEY_EVENT_ID: &str = "calsync_event_id";
const KEY_KIND: &str = "calsync_kind";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventDateTime {
    #[serde(rename = "dateTime", default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    /// All-day events carry a plain date instead of `dateTime`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventExtendedProperties {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct GoogleCalendarEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(rename = "colorId", skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub start: CalendarEventDateTime,
    pub end: CalendarEventDateTime,
    #[serde(rename = "extendedProperties", skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<CalendarEventExtendedProperties>,
}

/// Renders a local event as a Google Calendar payload in the configured timezone.
pub fn encode_local_event(
    event: &LocalEvent,
    config: &EngineConfig,
    tz: Tz,
) -> Result<GoogleCalendarEvent, InfraError> {
    let start = localize(&event.id, event.date.and_time(event.start_time), tz)?;
    let end = localize(&event.id, event.date.and_time(event.end_time), tz)?;

    let mut private = HashMap::new();
    private.insert(KEY_EVENT_ID.to_string(), event.id.clone());
    private.insert(KEY_KIND.to_string(), event.kind.as_str().to_string());

    let description = match event.notes.as_deref().map(str::trim).filter(|notes| !notes.is_empty()) {
        Some(notes) => format!("{}\n\n{notes}", event.kind.as_str()),
        None => event.kind.as_str().to_string(),
    };

    Ok(GoogleCalendarEvent {
        id: None,
        summary: Some(render_title(event, config)),
        description: Some(description),
        location: non_empty(event.room.as_deref()),
        color_id: config.color_map.get(event.kind.as_str()).cloned(),
        status: Some("confirmed".to_string()),
        updated: None,
        etag: None,
        start: CalendarEventDateTime {
            date_time: Some(start.to_rfc3339()),
            date: None,
            time_zone: Some(tz.name().to_string()),
        },
        end: CalendarEventDateTime {
            date_time: Some(end.to_rfc3339()),
            date: None,
            time_zone: Some(tz.name().to_string()),
        },
        extended_properties: Some(CalendarEventExtendedProperties { private }),
    })
}

/// `[prefix] subject (section)`, omitting the parts that are not set.
pub fn render_title(event: &LocalEvent, config: &EngineConfig) -> String {
    let mut title = String::new();
    if let Some(prefix) = non_empty(config.title_prefix.as_deref()) {
        title.push_str(&format!("[{prefix}] "));
    }
    title.push_str(event.subject.trim());
    if let Some(section) = non_empty(event.section.as_deref()) {
        title.push_str(&format!(" ({section})"));
    }
    title
}

/// Inverse of `render_title` for titles edited on the remote side.
pub fn subject_from_title(title: &str, section: Option<&str>, config: &EngineConfig) -> String {
    let mut subject = title.trim();
    if let Some(prefix) = non_empty(config.title_prefix.as_deref()) {
        subject = subject
            .strip_prefix(&format!("[{prefix}] "))
            .unwrap_or(subject);
    }
    if let Some(section) = non_empty(section) {
        subject = subject
            .strip_suffix(&format!(" ({section})"))
            .unwrap_or(subject);
    }
    subject.trim().to_string()
}

pub fn snapshot_from_remote(event: &GoogleCalendarEvent) -> Result<RemoteSnapshot, InfraError> {
    let start = parse_event_time(&event.start, "start")?;
    let end = parse_event_time(&event.end, "end")?;
    if end <= start {
        return Err(InfraError::Validation(
            "invalid remote event: end is not after start".to_string(),
        ));
    }
    Ok(RemoteSnapshot {
        summary: non_empty(event.summary.as_deref()),
        location: non_empty(event.location.as_deref()),
        start,
        end,
        etag: event.etag.clone(),
    })
}

/// Local id stamped into the remote event's private properties, if any.
pub fn local_event_id(event: &GoogleCalendarEvent) -> Option<&str> {
    event
        .extended_properties
        .as_ref()
        .and_then(|properties| properties.private.get(KEY_EVENT_ID))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Overwrites scheduling fields of `event` with the remote copy, read in `tz`.
pub fn apply_remote_snapshot(
    event: &mut LocalEvent,
    snapshot: &RemoteSnapshot,
    config: &EngineConfig,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<(), InfraError> {
    let start = snapshot.start.with_timezone(&tz).naive_local();
    let end = snapshot.end.with_timezone(&tz).naive_local();
    if start.date() != end.date() {
        return Err(InfraError::Validation(format!(
            "remote copy of {} spans multiple days ({} to {})",
            event.id,
            start.date(),
            end.date()
        )));
    }

    event.date = start.date();
    event.start_time = start.time();
    event.end_time = end.time();
    event.room = snapshot.location.clone();
    if let Some(summary) = snapshot.summary.as_deref() {
        let subject = subject_from_title(summary, event.section.as_deref(), config);
        if !subject.is_empty() {
            event.subject = subject;
        }
    }
    event.refresh_etag(snapshot.etag.clone(), now);
    Ok(())
}

fn localize(event_id: &str, naive: NaiveDateTime, tz: Tz) -> Result<DateTime<Tz>, InfraError> {
    tz.from_local_datetime(&naive).earliest().ok_or_else(|| {
        InfraError::Validation(format!(
            "event {event_id}: local time {naive} does not exist in {}",
            tz.name()
        ))
    })
}

fn parse_event_time(value: &CalendarEventDateTime, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    if let Some(raw) = value.date_time.as_deref() {
        return DateTime::parse_from_rfc3339(raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|error| {
                InfraError::Validation(format!(
                    "invalid calendar event {field_name}.dateTime '{raw}': {error}"
                ))
            });
    }
    let raw = value.date.as_deref().ok_or_else(|| {
        InfraError::Validation(format!("calendar event {field_name} has neither dateTime nor date"))
    })?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
        .map_err(|error| {
            InfraError::Validation(format!("invalid calendar event {field_name}.date '{raw}': {error}"))
        })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}
