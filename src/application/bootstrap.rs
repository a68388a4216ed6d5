use crate::application::calendar_sync::SyncOrchestrator;
use crate::application::conflict_resolver::ConflictResolver;
use crate::application::idempotency::IdempotencyGuard;
use crate::application::job_queue::{JobQueue, QueueWorker, WorkerHandle};
use crate::application::oauth::{AccessTokenProvider, TokenManager};
use crate::application::queue_monitor::{MonitorHandle, QueueMonitor};
use crate::application::remote_calendar::RemoteCalendarClient;
use crate::infrastructure::config::{ensure_default_config, load_config, load_oauth_config_from_env, EngineConfig};
use crate::infrastructure::credential_store::KeyringTokenStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_store::{LocalEventStore, SqliteLocalEventStore};
use crate::infrastructure::google_calendar_client::{GoogleCalendarApi, ReqwestGoogleCalendarClient};
use crate::infrastructure::job_store::{InMemoryJobStore, JobStore};
use crate::infrastructure::kv_store::{KeyValueStore, SqliteKeyValueStore};
use crate::infrastructure::logging;
use crate::infrastructure::oauth_client::ReqwestOAuthClient;
use crate::infrastructure::quota_tracker::{InMemoryQuotaTracker, QuotaTracker};
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub database_path: PathBuf,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<WorkspacePaths, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let database_path = state_dir.join("calsync.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;

    ensure_default_config(&config_dir)?;
    let _ = load_config(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(WorkspacePaths {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        database_path,
    })
}

/// Backends the engine is assembled from.
pub struct EngineComponents {
    pub events: Arc<dyn LocalEventStore>,
    pub api: Arc<dyn GoogleCalendarApi>,
    pub tokens: Arc<dyn AccessTokenProvider>,
    pub quota: Arc<dyn QuotaTracker>,
    pub cache: Arc<dyn KeyValueStore>,
    pub jobs: Arc<dyn JobStore>,
}

pub struct SyncEngine {
    pub config: EngineConfig,
    pub events: Arc<dyn LocalEventStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub resolver: Arc<ConflictResolver>,
    pub queue: Arc<JobQueue>,
}

impl SyncEngine {
    pub fn assemble(config: EngineConfig, components: EngineComponents) -> Result<Self, InfraError> {
        config.validate()?;
        let remote = Arc::new(RemoteCalendarClient::from_config(
            components.api,
            components.tokens,
            components.quota,
            &config,
        ));
        let guard = Arc::new(IdempotencyGuard::new(components.cache, &config.idempotency));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&components.events),
            Arc::clone(&remote),
            guard,
            config.clone(),
        )?);
        let resolver = Arc::new(ConflictResolver::new(
            Arc::clone(&components.events),
            remote,
            config.clone(),
        )?);
        let queue = Arc::new(JobQueue::new(components.jobs, config.queue.clone()));

        Ok(Self {
            config,
            events: components.events,
            orchestrator,
            resolver,
            queue,
        })
    }

    /// Production wiring: SQLite state under `workspace_root`, OS keyring tokens, live Google APIs.
    pub fn open(workspace_root: &Path) -> Result<Self, InfraError> {
        logging::init();
        let paths = bootstrap_workspace(workspace_root)?;
        let config = load_config(&paths.config_dir)?;
        let oauth = load_oauth_config_from_env(&config.token.token_endpoint)?;

        let tokens = TokenManager::new(
            oauth,
            Arc::new(KeyringTokenStore::default()),
            Arc::new(ReqwestOAuthClient::new()),
        )
        .with_refresh_horizon(config.token.refresh_horizon_seconds);

        let components = EngineComponents {
            events: Arc::new(SqliteLocalEventStore::new(&paths.database_path)),
            api: Arc::new(ReqwestGoogleCalendarClient::new()),
            tokens: Arc::new(tokens),
            quota: Arc::new(InMemoryQuotaTracker::new(config.quota.daily_limit)),
            cache: Arc::new(SqliteKeyValueStore::new(&paths.database_path)),
            jobs: Arc::new(InMemoryJobStore::new()),
        };

        info!(
            workspace = %paths.workspace_root.display(),
            database = %paths.database_path.display(),
            timezone = %config.timezone,
            "sync engine opened"
        );
        Self::assemble(config, components)
    }

    pub fn spawn_worker(&self) -> WorkerHandle {
        QueueWorker::new(Arc::clone(&self.queue), Arc::clone(&self.orchestrator) as _).spawn()
    }

    pub fn spawn_monitor(&self) -> MonitorHandle {
        QueueMonitor::new(Arc::clone(&self.queue)).spawn()
    }
}
