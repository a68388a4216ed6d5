use crate::application::remote_calendar::{QuotaMeter, RemoteCalendarClient};
use crate::domain::models::{
    Conflict, ConflictResolution, EventStatus, LocalEvent, Resolution, ResolutionDetail,
    ResolutionOutcome, ResolveReport,
};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{apply_remote_snapshot, encode_local_event};
use crate::infrastructure::event_store::LocalEventStore;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Applies caller-chosen winners to conflicts reported by a sync pass.
pub struct ConflictResolver {
    events: Arc<dyn LocalEventStore>,
    remote: Arc<RemoteCalendarClient>,
    config: EngineConfig,
    tz: Tz,
    now_provider: NowProvider,
}

impl ConflictResolver {
    pub fn new(
        events: Arc<dyn LocalEventStore>,
        remote: Arc<RemoteCalendarClient>,
        config: EngineConfig,
    ) -> Result<Self, InfraError> {
        let tz = config.time_zone()?;
        Ok(Self {
            events,
            remote,
            config,
            tz,
            now_provider: Arc::new(Utc::now),
        })
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Resolutions naming an unknown conflict are ignored. Each conflict is applied at most once.
    pub async fn resolve_conflicts(
        &self,
        user_id: &str,
        conflicts: &[Conflict],
        resolutions: &[ConflictResolution],
    ) -> Result<ResolveReport, InfraError> {
        if user_id.trim().is_empty() {
            return Err(InfraError::Validation("user id must not be empty".to_string()));
        }

        let by_local_id: HashMap<&str, &Conflict> = conflicts
            .iter()
            .map(|conflict| (conflict.local_event_id.as_str(), conflict))
            .collect();
        let mut handled = HashSet::new();
        let mut report = ResolveReport::default();

        for resolution in resolutions {
            let Some(conflict) = by_local_id.get(resolution.local_event_id.as_str()) else {
                continue;
            };
            let outcome = if handled.insert(conflict.local_event_id.as_str()) {
                self.resolve_one(user_id, conflict, resolution.resolution).await
            } else {
                Ok(ResolutionOutcome::AlreadyResolved)
            };

            let detail = match outcome {
                Ok(outcome) => {
                    if outcome == ResolutionOutcome::Resolved {
                        report.resolved += 1;
                    }
                    ResolutionDetail {
                        local_event_id: conflict.local_event_id.clone(),
                        outcome,
                        error: None,
                    }
                }
                Err(error) => {
                    warn!(
                        user_id,
                        event_id = %conflict.local_event_id,
                        error = %error,
                        "conflict resolution failed"
                    );
                    report.failed += 1;
                    ResolutionDetail {
                        local_event_id: conflict.local_event_id.clone(),
                        outcome: ResolutionOutcome::Failed,
                        error: Some(error.to_string()),
                    }
                }
            };
            report.details.push(detail);
        }

        info!(
            user_id,
            resolved = report.resolved,
            failed = report.failed,
            "conflict resolution finished"
        );
        Ok(report)
    }

    async fn resolve_one(
        &self,
        user_id: &str,
        conflict: &Conflict,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome, InfraError> {
        let mut current = self
            .events
            .find_by_id(&conflict.local_event_id)?
            .filter(|event| event.user_id == user_id)
            .ok_or_else(|| InfraError::NotFound(format!("local event {}", conflict.local_event_id)))?;

        if current.status != EventStatus::Synced {
            return Err(InfraError::Validation(format!(
                "local event {} is no longer synced",
                current.id
            )));
        }
        if Self::moved_past(&current, conflict) {
            return Ok(ResolutionOutcome::AlreadyResolved);
        }

        match resolution {
            Resolution::UseLocal => self.push_local(user_id, &mut current, &conflict.remote_event_id).await?,
            Resolution::UseGoogle => {
                apply_remote_snapshot(
                    &mut current,
                    &conflict.remote_data,
                    &self.config,
                    self.tz,
                    (self.now_provider)(),
                )?;
            }
        }
        self.events.update(&current)?;
        Ok(ResolutionOutcome::Resolved)
    }

    /// The local row no longer matches the state the conflict was detected against.
    fn moved_past(current: &LocalEvent, conflict: &Conflict) -> bool {
        current.remote_etag != conflict.local_data.remote_etag
            || current.remote_event_id.as_deref() != Some(conflict.remote_event_id.as_str())
    }

    async fn push_local(
        &self,
        user_id: &str,
        current: &mut LocalEvent,
        remote_id: &str,
    ) -> Result<(), InfraError> {
        let payload = encode_local_event(current, &self.config, self.tz)?;
        let write = self
            .remote
            .update(user_id, remote_id, &payload, None, &QuotaMeter::default())
            .await?;
        current.refresh_etag(write.etag, (self.now_provider)());
        Ok(())
    }
}
