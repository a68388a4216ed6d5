use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Planned,
    Synced,
    Deleted,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Synced => "synced",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "planned" => Ok(Self::Planned),
            "synced" => Ok(Self::Synced),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("invalid event status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lecture,
    Lab,
    Seminar,
    Exam,
    Other,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lecture => "lecture",
            Self::Lab => "lab",
            Self::Seminar => "seminar",
            Self::Exam => "exam",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "lecture" => Self::Lecture,
            "lab" => Self::Lab,
            "seminar" => Self::Seminar,
            "exam" => Self::Exam,
            _ => Self::Other,
        }
    }
}

/// One concrete occurrence of a class or meeting.
///
/// `remote_event_id` is set iff `status == Synced`; use the `mark_*` helpers
/// to move between states.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalEvent {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub section: Option<String>,
    pub kind: EventKind,
    pub notes: Option<String>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub room: Option<String>,
    /// Set by schedule generation for dates inside a skip window.
    #[serde(default)]
    pub skip_window: bool,
    pub status: EventStatus,
    pub remote_event_id: Option<String>,
    pub remote_etag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LocalEvent {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "event.id")?;
        validate_non_empty(&self.user_id, "event.user_id")?;
        validate_non_empty(&self.subject, "event.subject")?;
        if self.end_time <= self.start_time {
            return Err("event.end_time must be after event.start_time".to_string());
        }
        let has_remote = self
            .remote_event_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        if has_remote != (self.status == EventStatus::Synced) {
            return Err(format!(
                "event.remote_event_id must be set iff status is synced (status={})",
                self.status.as_str()
            ));
        }
        Ok(())
    }

    pub fn is_new(&self) -> bool {
        self.status == EventStatus::Planned && self.remote_event_id.is_none()
    }

    pub fn mark_synced(&mut self, remote_event_id: String, etag: Option<String>, now: DateTime<Utc>) {
        self.status = EventStatus::Synced;
        self.remote_event_id = Some(remote_event_id);
        self.remote_etag = etag;
        self.updated_at = now;
    }

    pub fn refresh_etag(&mut self, etag: Option<String>, now: DateTime<Utc>) {
        self.remote_etag = etag;
        self.updated_at = now;
    }

    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Deleted;
        self.remote_event_id = None;
        self.remote_etag = None;
        self.updated_at = now;
    }
}

/// Direction of a reconciliation pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SyncDirection {
    #[default]
    #[serde(rename = "upsert-to-google")]
    UpsertToGoogle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }

    /// Inclusive number of days covered by the range.
    pub fn span_days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub direction: SyncDirection,
    pub range: DateRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ids: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Skipped,
    Failed,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncDetail {
    pub event_id: String,
    pub action: SyncAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    EtagMismatch,
}

/// Remote copy of an event at conflict detection time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub summary: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub local_event_id: String,
    pub remote_event_id: String,
    pub conflict_type: ConflictType,
    pub local_data: LocalEvent,
    pub remote_data: RemoteSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub summary: SyncSummary,
    pub details: Vec<SyncDetail>,
    pub conflicts: Vec<Conflict>,
    pub quota_used: u64,
    pub is_dry_run: bool,
}

impl SyncResult {
    pub fn empty(is_dry_run: bool) -> Self {
        Self {
            is_dry_run,
            ..Self::default()
        }
    }

    pub fn record(&mut self, event_id: impl Into<String>, action: SyncAction, error: Option<String>) {
        match action {
            SyncAction::Created => self.summary.created += 1,
            SyncAction::Updated => self.summary.updated += 1,
            SyncAction::Skipped => self.summary.skipped += 1,
            SyncAction::Failed => self.summary.failed += 1,
            SyncAction::Conflict => {}
        }
        self.details.push(SyncDetail {
            event_id: event_id.into(),
            action,
            error,
        });
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    UseLocal,
    UseGoogle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub local_event_id: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved,
    Failed,
    AlreadyResolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionDetail {
    pub local_event_id: String,
    pub outcome: ResolutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResolveReport {
    pub resolved: usize,
    pub failed: usize,
    pub details: Vec<ResolutionDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    pub daily_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    pub scope: Option<String>,
}

impl OAuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>, leeway_seconds: i64) -> bool {
        self.expires_at > now + chrono::Duration::seconds(leeway_seconds)
            && !self.access_token.trim().is_empty()
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> LocalEvent {
        LocalEvent {
            id: "evt-1".to_string(),
            user_id: "user-1".to_string(),
            subject: "Linear Algebra".to_string(),
            section: Some("A1".to_string()),
            kind: EventKind::Lecture,
            notes: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 10).expect("valid date"),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
            end_time: NaiveTime::from_hms_opt(10, 30, 0).expect("valid time"),
            room: Some("B-204".to_string()),
            skip_window: false,
            status: EventStatus::Planned,
            remote_event_id: None,
            remote_etag: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn planned_event_without_remote_id_is_valid() {
        assert!(sample_event().validate().is_ok());
        assert!(sample_event().is_new());
    }

    #[test]
    fn planned_event_with_remote_id_violates_invariant() {
        let mut event = sample_event();
        event.remote_event_id = Some("remote-1".to_string());
        assert!(event.validate().is_err());
    }

    #[test]
    fn mark_synced_then_deleted_keeps_invariant() {
        let mut event = sample_event();
        event.mark_synced("remote-1".to_string(), Some("\"e1\"".to_string()), Utc::now());
        assert!(event.validate().is_ok());
        assert_eq!(event.status, EventStatus::Synced);

        event.mark_deleted(Utc::now());
        assert!(event.validate().is_ok());
        assert!(event.remote_event_id.is_none());
        assert!(event.remote_etag.is_none());
    }

    #[test]
    fn conflict_action_is_not_counted_in_summary() {
        let mut result = SyncResult::empty(false);
        result.record("a", SyncAction::Created, None);
        result.record("b", SyncAction::Conflict, None);
        result.record("c", SyncAction::Failed, Some("boom".to_string()));

        assert_eq!(result.summary.created, 1);
        assert_eq!(result.summary.updated, 0);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.details.len(), 3);
    }

    #[test]
    fn sync_direction_uses_tagged_wire_value() {
        let raw = serde_json::to_string(&SyncDirection::UpsertToGoogle).expect("serialize");
        assert_eq!(raw, "\"upsert-to-google\"");
    }

    #[test]
    fn date_range_span_is_inclusive() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
            NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date"),
        );
        assert_eq!(range.span_days(), 31);
        assert!(range.contains(NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date")));
    }
}
