use crate::domain::models::{DateRange, EventKind, EventStatus, LocalEvent};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

pub trait LocalEventStore: Send + Sync {
    /// Events of `user_id` whose date falls inside `range`, ordered by date and start time.
    fn find_by_user_and_date_range(
        &self,
        user_id: &str,
        range: &DateRange,
    ) -> Result<Vec<LocalEvent>, InfraError>;
    fn find_by_id(&self, event_id: &str) -> Result<Option<LocalEvent>, InfraError>;
    fn save(&self, event: &LocalEvent) -> Result<(), InfraError>;
    fn save_many(&self, events: &[LocalEvent]) -> Result<(), InfraError>;
    /// Replaces an existing event; missing rows are an error.
    fn update(&self, event: &LocalEvent) -> Result<(), InfraError>;
}

fn ensure_valid(event: &LocalEvent) -> Result<(), InfraError> {
    event.validate().map_err(InfraError::Validation)
}

#[derive(Debug, Clone)]
pub struct SqliteLocalEventStore {
    db_path: PathBuf,
}

const SELECT_COLUMNS: &str = "id, user_id, subject, section, kind, notes, date, start_time, end_time, room,
     skip_window, status, remote_event_id, remote_etag, updated_at";

const UPSERT_SQL: &str = "INSERT INTO local_events (
       id, user_id, subject, section, kind, notes, date, start_time, end_time, room,
       skip_window, status, remote_event_id, remote_etag, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
     ON CONFLICT(id) DO UPDATE SET
       user_id = excluded.user_id,
       subject = excluded.subject,
       section = excluded.section,
       kind = excluded.kind,
       notes = excluded.notes,
       date = excluded.date,
       start_time = excluded.start_time,
       end_time = excluded.end_time,
       room = excluded.room,
       skip_window = excluded.skip_window,
       status = excluded.status,
       remote_event_id = excluded.remote_event_id,
       remote_etag = excluded.remote_etag,
       updated_at = excluded.updated_at";

impl SqliteLocalEventStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    fn upsert(connection: &Connection, event: &LocalEvent) -> Result<(), InfraError> {
        connection.execute(
            UPSERT_SQL,
            params![
                event.id,
                event.user_id,
                event.subject,
                event.section,
                event.kind.as_str(),
                event.notes,
                event.date.format(DATE_FORMAT).to_string(),
                event.start_time.format(TIME_FORMAT).to_string(),
                event.end_time.format(TIME_FORMAT).to_string(),
                event.room,
                event.skip_window,
                event.status.as_str(),
                event.remote_event_id,
                event.remote_etag,
                event.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

struct RawEventRow {
    id: String,
    user_id: String,
    subject: String,
    section: Option<String>,
    kind: String,
    notes: Option<String>,
    date: String,
    start_time: String,
    end_time: String,
    room: Option<String>,
    skip_window: bool,
    status: String,
    remote_event_id: Option<String>,
    remote_etag: Option<String>,
    updated_at: String,
}

impl RawEventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            subject: row.get(2)?,
            section: row.get(3)?,
            kind: row.get(4)?,
            notes: row.get(5)?,
            date: row.get(6)?,
            start_time: row.get(7)?,
            end_time: row.get(8)?,
            room: row.get(9)?,
            skip_window: row.get(10)?,
            status: row.get(11)?,
            remote_event_id: row.get(12)?,
            remote_etag: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_event(self) -> Result<LocalEvent, InfraError> {
        let invalid = |field: &str, value: &str, error: String| {
            InfraError::Storage(format!("invalid local_events.{field} '{value}' for {}: {error}", self.id))
        };
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|error| invalid("date", &self.date, error.to_string()))?;
        let start_time = NaiveTime::parse_from_str(&self.start_time, TIME_FORMAT)
            .map_err(|error| invalid("start_time", &self.start_time, error.to_string()))?;
        let end_time = NaiveTime::parse_from_str(&self.end_time, TIME_FORMAT)
            .map_err(|error| invalid("end_time", &self.end_time, error.to_string()))?;
        let status = EventStatus::parse(&self.status).map_err(|error| invalid("status", &self.status, error))?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|error| invalid("updated_at", &self.updated_at, error.to_string()))?
            .with_timezone(&Utc);

        Ok(LocalEvent {
            kind: EventKind::parse(&self.kind),
            id: self.id,
            user_id: self.user_id,
            subject: self.subject,
            section: self.section,
            notes: self.notes,
            date,
            start_time,
            end_time,
            room: self.room,
            skip_window: self.skip_window,
            status,
            remote_event_id: self.remote_event_id,
            remote_etag: self.remote_etag,
            updated_at,
        })
    }
}

impl LocalEventStore for SqliteLocalEventStore {
    fn find_by_user_and_date_range(
        &self,
        user_id: &str,
        range: &DateRange,
    ) -> Result<Vec<LocalEvent>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM local_events
             WHERE user_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date, start_time, id"
        ))?;
        let rows = statement
            .query_map(
                params![
                    user_id,
                    range.from.format(DATE_FORMAT).to_string(),
                    range.to.format(DATE_FORMAT).to_string()
                ],
                RawEventRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEventRow::into_event).collect()
    }

    fn find_by_id(&self, event_id: &str) -> Result<Option<LocalEvent>, InfraError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM local_events WHERE id = ?1"),
                params![event_id],
                RawEventRow::from_row,
            )
            .optional()?;
        row.map(RawEventRow::into_event).transpose()
    }

    fn save(&self, event: &LocalEvent) -> Result<(), InfraError> {
        ensure_valid(event)?;
        let connection = self.connect()?;
        Self::upsert(&connection, event)
    }

    fn save_many(&self, events: &[LocalEvent]) -> Result<(), InfraError> {
        for event in events {
            ensure_valid(event)?;
        }
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        for event in events {
            Self::upsert(&transaction, event)?;
        }
        transaction.commit()?;
        Ok(())
    }

    fn update(&self, event: &LocalEvent) -> Result<(), InfraError> {
        ensure_valid(event)?;
        let connection = self.connect()?;
        let exists: Option<i64> = connection
            .query_row("SELECT 1 FROM local_events WHERE id = ?1", params![event.id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(InfraError::NotFound(format!("local event {}", event.id)));
        }
        Self::upsert(&connection, event)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLocalEventStore {
    events: Mutex<HashMap<String, LocalEvent>>,
}

impl InMemoryLocalEventStore {
    pub fn with_events(events: Vec<LocalEvent>) -> Self {
        Self {
            events: Mutex::new(events.into_iter().map(|event| (event.id.clone(), event)).collect()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LocalEvent>>, InfraError> {
        self.events
            .lock()
            .map_err(|error| InfraError::lock_poisoned("local event store", error))
    }
}

impl LocalEventStore for InMemoryLocalEventStore {
    fn find_by_user_and_date_range(
        &self,
        user_id: &str,
        range: &DateRange,
    ) -> Result<Vec<LocalEvent>, InfraError> {
        let events = self.lock()?;
        let mut matched: Vec<LocalEvent> = events
            .values()
            .filter(|event| event.user_id == user_id && range.contains(event.date))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            (a.date, a.start_time, &a.id).cmp(&(b.date, b.start_time, &b.id))
        });
        Ok(matched)
    }

    fn find_by_id(&self, event_id: &str) -> Result<Option<LocalEvent>, InfraError> {
        Ok(self.lock()?.get(event_id).cloned())
    }

    fn save(&self, event: &LocalEvent) -> Result<(), InfraError> {
        ensure_valid(event)?;
        self.lock()?.insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn save_many(&self, events: &[LocalEvent]) -> Result<(), InfraError> {
        for event in events {
            ensure_valid(event)?;
        }
        let mut stored = self.lock()?;
        for event in events {
            stored.insert(event.id.clone(), event.clone());
        }
        Ok(())
    }

    fn update(&self, event: &LocalEvent) -> Result<(), InfraError> {
        ensure_valid(event)?;
        let mut stored = self.lock()?;
        match stored.get_mut(&event.id) {
            Some(existing) => {
                *existing = event.clone();
                Ok(())
            }
            None => Err(InfraError::NotFound(format!("local event {}", event.id))),
        }
    }
}
