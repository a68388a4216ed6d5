//! Keeps a locally owned class schedule in step with Google Calendar.
//!
//! [`SyncEngine::open`] wires the production backends; [`SyncEngine::assemble`]
//! accepts any set of [`EngineComponents`].

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{bootstrap_workspace, EngineComponents, SyncEngine, WorkspacePaths};
pub use application::calendar_sync::{ProgressReporter, SyncExecutor, SyncOrchestrator};
pub use application::conflict_resolver::ConflictResolver;
pub use application::idempotency::{IdempotencyGuard, IdempotentOutcome};
pub use application::job_queue::{JobQueue, QueueStats, QueueWorker, WorkerHandle};
pub use application::queue_monitor::{MonitorHandle, QueueHealth, QueueInsights, QueueMonitor};
pub use application::remote_calendar::RemoteCalendarClient;
pub use domain::job::{Job, JobId, JobState};
pub use domain::models::{
    Conflict, ConflictResolution, DateRange, LocalEvent, Resolution, ResolveReport, SyncDirection,
    SyncRequest, SyncResult,
};
pub use infrastructure::config::EngineConfig;
pub use infrastructure::error::InfraError;
