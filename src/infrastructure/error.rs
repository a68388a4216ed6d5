use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed for remote event {remote_event_id}")]
    PreconditionFailed { remote_event_id: String },
    #[error("{0}")]
    Transient(String),
    #[error("google calendar api error: http {status}; {message}")]
    Remote { status: u16, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("sync size limit exceeded: {requested} events requested, limit is {limit}")]
    SizeLimit { requested: usize, limit: usize },
    #[error("operation with idempotency key {0} is already in progress")]
    IdempotencyInProgress(String),
    #[error("job {0} timed out")]
    JobTimedOut(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("invalid job state: {0}")]
    InvalidJobState(String),
}

impl InfraError {
    /// Failures a later attempt may fix: transport errors, job timeouts and a pass still
    /// holding its idempotency lock elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::JobTimedOut(_) | Self::IdempotencyInProgress(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    pub fn lock_poisoned(what: &str, error: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{what} lock poisoned: {error}"))
    }
}
