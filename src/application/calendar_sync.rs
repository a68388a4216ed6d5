use crate::application::idempotency::{fingerprint, validate_request_key, IdempotencyGuard};
use crate::application::remote_calendar::{QuotaMeter, RemoteCalendarClient};
use crate::domain::models::{
    Conflict, ConflictType, EventStatus, LocalEvent, SyncAction, SyncDirection, SyncRequest,
    SyncResult,
};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{encode_local_event, snapshot_from_remote, GoogleCalendarEvent};
use crate::infrastructure::event_store::LocalEventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Receives `(processed, total)` after every candidate.
pub type ProgressReporter = Arc<dyn Fn(usize, usize) + Send + Sync>;

const EVENT_NOT_FOUND: &str = "event not found";

/// A sync pass as seen by the job queue.
#[async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn execute(
        &self,
        user_id: &str,
        request: &SyncRequest,
        progress: Option<ProgressReporter>,
    ) -> Result<SyncResult, InfraError>;
}

pub struct SyncOrchestrator {
    events: Arc<dyn LocalEventStore>,
    remote: Arc<RemoteCalendarClient>,
    guard: Arc<IdempotencyGuard>,
    config: EngineConfig,
    tz: Tz,
    now_provider: NowProvider,
}

struct Candidates {
    new: Vec<LocalEvent>,
    existing: Vec<LocalEvent>,
    skipped: Vec<(String, String)>,
}

impl Candidates {
    fn total(&self) -> usize {
        self.new.len() + self.existing.len() + self.skipped.len()
    }
}

struct Progress {
    reporter: Option<ProgressReporter>,
    processed: usize,
    total: usize,
}

impl Progress {
    fn advance(&mut self) {
        self.processed += 1;
        if let Some(reporter) = &self.reporter {
            reporter(self.processed, self.total);
        }
    }
}

impl SyncOrchestrator {
    pub fn new(
        events: Arc<dyn LocalEventStore>,
        remote: Arc<RemoteCalendarClient>,
        guard: Arc<IdempotencyGuard>,
        config: EngineConfig,
    ) -> Result<Self, InfraError> {
        let tz = config.time_zone()?;
        Ok(Self {
            events,
            remote,
            guard,
            config,
            tz,
            now_provider: Arc::new(Utc::now),
        })
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub async fn sync_to_google(&self, user_id: &str, request: &SyncRequest) -> Result<SyncResult, InfraError> {
        self.sync_with_progress(user_id, request, None).await
    }

    pub async fn sync_with_progress(
        &self,
        user_id: &str,
        request: &SyncRequest,
        progress: Option<ProgressReporter>,
    ) -> Result<SyncResult, InfraError> {
        self.validate_request(user_id, request)?;

        // Keys are caller-chosen; scope them to the user so two users never share a result.
        let direction = match request.direction {
            SyncDirection::UpsertToGoogle => "upsert-to-google",
        };
        let scoped_key = fingerprint(
            user_id,
            "SYNC",
            direction,
            Some(&serde_json::Value::String(request.idempotency_key.clone())),
        );

        let outcome = self
            .guard
            .ensure_idempotent(&scoped_key, None, || self.run_pass(user_id, request, progress))
            .await?;
        if outcome.is_from_cache {
            info!(
                user_id,
                idempotency_key = %request.idempotency_key,
                "sync request replayed from cache"
            );
        }
        Ok(outcome.data)
    }

    /// Soft-deletes a local event after removing its Google copy.
    pub async fn delete_from_google(&self, user_id: &str, event_id: &str) -> Result<LocalEvent, InfraError> {
        let mut event = self
            .events
            .find_by_id(event_id)?
            .filter(|event| event.user_id == user_id)
            .ok_or_else(|| InfraError::NotFound(format!("local event {event_id}")))?;

        if event.status == EventStatus::Deleted {
            return Ok(event);
        }
        if let Some(remote_id) = event.remote_event_id.clone() {
            self.remote
                .delete(user_id, &remote_id, &QuotaMeter::default())
                .await?;
        }

        event.mark_deleted((self.now_provider)());
        self.events.update(&event)?;
        info!(user_id, event_id, "local event soft-deleted");
        Ok(event)
    }

    fn validate_request(&self, user_id: &str, request: &SyncRequest) -> Result<(), InfraError> {
        if user_id.trim().is_empty() {
            return Err(InfraError::Validation("user id must not be empty".to_string()));
        }
        validate_request_key(&request.idempotency_key)?;
        if request.range.from > request.range.to {
            return Err(InfraError::Validation(format!(
                "range.from {} is after range.to {}",
                request.range.from, request.range.to
            )));
        }
        let span = request.range.span_days();
        if span > self.config.sync.max_range_days {
            return Err(InfraError::Validation(format!(
                "range covers {span} days, maximum is {}",
                self.config.sync.max_range_days
            )));
        }
        if let Some(ids) = &request.event_ids {
            if ids.len() > self.config.sync.max_events_per_sync {
                return Err(InfraError::SizeLimit {
                    requested: ids.len(),
                    limit: self.config.sync.max_events_per_sync,
                });
            }
        }
        Ok(())
    }

    async fn run_pass(
        &self,
        user_id: &str,
        request: &SyncRequest,
        reporter: Option<ProgressReporter>,
    ) -> Result<SyncResult, InfraError> {
        self.ensure_account(user_id, request.dry_run).await?;

        let candidates = self.load_candidates(user_id, request)?;
        let mut result = SyncResult::empty(request.dry_run);
        let mut progress = Progress {
            reporter,
            processed: 0,
            total: candidates.total(),
        };
        info!(
            user_id,
            new = candidates.new.len(),
            existing = candidates.existing.len(),
            skipped = candidates.skipped.len(),
            dry_run = request.dry_run,
            "starting google sync pass"
        );

        for (event_id, reason) in &candidates.skipped {
            result.record(event_id.clone(), SyncAction::Skipped, Some(reason.clone()));
            progress.advance();
        }

        if request.dry_run {
            self.simulate(&candidates, &mut result, &mut progress);
            return Ok(result);
        }

        let meter = QuotaMeter::default();
        let batch_size = self.config.sync.batch_size.max(1);
        for batch in candidates.new.chunks(batch_size) {
            self.create_batch(user_id, batch, &meter, &mut result, &mut progress)
                .await?;
        }
        for batch in candidates.existing.chunks(batch_size) {
            self.update_batch(user_id, batch, &meter, &mut result, &mut progress)
                .await?;
        }
        result.quota_used = meter.total();

        info!(
            user_id,
            created = result.summary.created,
            updated = result.summary.updated,
            skipped = result.summary.skipped,
            failed = result.summary.failed,
            conflicts = result.conflicts.len(),
            quota_used = result.quota_used,
            "google sync pass finished"
        );
        Ok(result)
    }

    async fn ensure_account(&self, user_id: &str, dry_run: bool) -> Result<(), InfraError> {
        let tokens = self.remote.tokens();
        if dry_run {
            if !tokens.has_account(user_id)? {
                return Err(InfraError::Auth(format!("no google account connected for user {user_id}")));
            }
            return Ok(());
        }
        tokens.ensure_valid_token(user_id).await.map(|_| ())
    }

    fn load_candidates(&self, user_id: &str, request: &SyncRequest) -> Result<Candidates, InfraError> {
        let mut loaded = self
            .events
            .find_by_user_and_date_range(user_id, &request.range)?;

        let mut missing = Vec::new();
        if let Some(ids) = &request.event_ids {
            let mut seen = HashSet::new();
            let wanted: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
            let wanted_set: HashSet<&str> = wanted.iter().map(|id| id.as_str()).collect();
            loaded.retain(|event| wanted_set.contains(event.id.as_str()));
            let found: HashSet<&str> = loaded.iter().map(|event| event.id.as_str()).collect();
            missing = wanted
                .into_iter()
                .filter(|id| !found.contains(id.as_str()))
                .cloned()
                .collect();
        }

        let limit = self.config.sync.max_events_per_sync;
        if loaded.len() > limit {
            return Err(InfraError::SizeLimit {
                requested: loaded.len(),
                limit,
            });
        }

        let mut candidates = Candidates {
            new: Vec::new(),
            existing: Vec::new(),
            skipped: Vec::new(),
        };
        for event in loaded {
            if let Err(reason) = event.validate() {
                warn!(user_id, event_id = %event.id, reason = %reason, "skipping inconsistent event");
                candidates.skipped.push((event.id, reason));
                continue;
            }
            match event.status {
                EventStatus::Planned => candidates.new.push(event),
                EventStatus::Synced => candidates.existing.push(event),
                EventStatus::Deleted => candidates
                    .skipped
                    .push((event.id, "event is deleted".to_string())),
            }
        }
        candidates.skipped.extend(
            missing
                .into_iter()
                .map(|id| (id, EVENT_NOT_FOUND.to_string())),
        );
        Ok(candidates)
    }

    fn simulate(&self, candidates: &Candidates, result: &mut SyncResult, progress: &mut Progress) {
        let planned = candidates
            .new
            .iter()
            .map(|event| (event, SyncAction::Created))
            .chain(candidates.existing.iter().map(|event| (event, SyncAction::Updated)));
        for (event, action) in planned {
            match encode_local_event(event, &self.config, self.tz) {
                Ok(_) => result.record(event.id.clone(), action, None),
                Err(error) => result.record(event.id.clone(), SyncAction::Failed, Some(error.to_string())),
            }
            progress.advance();
        }
    }

    async fn create_batch(
        &self,
        user_id: &str,
        batch: &[LocalEvent],
        meter: &QuotaMeter,
        result: &mut SyncResult,
        progress: &mut Progress,
    ) -> Result<(), InfraError> {
        let mut payloads: Vec<GoogleCalendarEvent> = Vec::with_capacity(batch.len());
        let mut sendable: Vec<&LocalEvent> = Vec::with_capacity(batch.len());
        for event in batch {
            match encode_local_event(event, &self.config, self.tz) {
                Ok(payload) => {
                    payloads.push(payload);
                    sendable.push(event);
                }
                Err(error) => {
                    result.record(event.id.clone(), SyncAction::Failed, Some(error.to_string()));
                    progress.advance();
                }
            }
        }

        let outcomes = self.remote.create_batch(user_id, &payloads, meter).await;
        let now = (self.now_provider)();
        let mut rows: Vec<Result<LocalEvent, (String, String)>> = Vec::with_capacity(sendable.len());
        for (event, outcome) in sendable.into_iter().zip(outcomes) {
            match outcome {
                Ok(write) => {
                    let mut event = event.clone();
                    event.mark_synced(write.remote_id, write.etag, now);
                    rows.push(Ok(event));
                }
                Err(error) => {
                    warn!(user_id, event_id = %event.id, error = %error, "google create failed");
                    rows.push(Err((event.id.clone(), error.to_string())));
                }
            }
        }

        let synced: Vec<LocalEvent> = rows.iter().filter_map(|row| row.as_ref().ok().cloned()).collect();
        let unsaved = self.persist(user_id, &synced);
        for event in synced.iter().filter(|event| unsaved.contains_key(&event.id)) {
            self.undo_create(user_id, event, meter).await;
        }

        for row in rows {
            match row {
                Ok(event) => match unsaved.get(&event.id) {
                    Some(message) => result.record(event.id, SyncAction::Failed, Some(message.clone())),
                    None => result.record(event.id, SyncAction::Created, None),
                },
                Err((event_id, message)) => result.record(event_id, SyncAction::Failed, Some(message)),
            }
            progress.advance();
        }
        Ok(())
    }

    /// Writes pushed events back, one at a time when the batch write fails.
    /// Returns the ids that could not be stored, with the error text.
    fn persist(&self, user_id: &str, events: &[LocalEvent]) -> HashMap<String, String> {
        let mut unsaved = HashMap::new();
        if events.is_empty() {
            return unsaved;
        }
        let Err(batch_error) = self.events.save_many(events) else {
            return unsaved;
        };
        warn!(user_id, error = %batch_error, count = events.len(), "batch save failed; saving events one by one");
        for event in events {
            if let Err(error) = self.events.save(event) {
                warn!(user_id, event_id = %event.id, error = %error, "local save failed");
                unsaved.insert(event.id.clone(), format!("local save failed: {error}"));
            }
        }
        unsaved
    }

    /// Removes a freshly created remote copy whose local row still says `planned`,
    /// so a later pass creates it exactly once.
    async fn undo_create(&self, user_id: &str, event: &LocalEvent, meter: &QuotaMeter) {
        let Some(remote_id) = event.remote_event_id.as_deref() else {
            return;
        };
        match self.remote.delete(user_id, remote_id, meter).await {
            Ok(()) => info!(user_id, event_id = %event.id, remote_id, "rolled back unsaved google create"),
            Err(delete_error) => error!(
                user_id,
                event_id = %event.id,
                remote_id,
                error = %delete_error,
                "could not roll back google create; remote copy is orphaned"
            ),
        }
    }

    async fn update_batch(
        &self,
        user_id: &str,
        batch: &[LocalEvent],
        meter: &QuotaMeter,
        result: &mut SyncResult,
        progress: &mut Progress,
    ) -> Result<(), InfraError> {
        let mut scratch = SyncResult::empty(false);
        let mut refreshed = Vec::with_capacity(batch.len());
        for event in batch {
            if let Some(updated) = self.update_one(user_id, event, meter, &mut scratch).await {
                refreshed.push(updated);
            }
        }

        // The remote write already happened; an unsaved etag surfaces as a conflict next pass.
        let unsaved = self.persist(user_id, &refreshed);
        result.conflicts.append(&mut scratch.conflicts);
        for detail in scratch.details {
            match unsaved.get(&detail.event_id) {
                Some(message) => result.record(detail.event_id, SyncAction::Failed, Some(message.clone())),
                None => result.record(detail.event_id, detail.action, detail.error),
            }
            progress.advance();
        }
        Ok(())
    }

    /// Pushes one synced event; returns the event to persist on success.
    async fn update_one(
        &self,
        user_id: &str,
        event: &LocalEvent,
        meter: &QuotaMeter,
        result: &mut SyncResult,
    ) -> Option<LocalEvent> {
        let Some(remote_id) = event.remote_event_id.as_deref() else {
            result.record(
                event.id.clone(),
                SyncAction::Skipped,
                Some("synced event has no remote id".to_string()),
            );
            return None;
        };
        let payload = match encode_local_event(event, &self.config, self.tz) {
            Ok(payload) => payload,
            Err(error) => {
                result.record(event.id.clone(), SyncAction::Failed, Some(error.to_string()));
                return None;
            }
        };

        match self
            .remote
            .update(user_id, remote_id, &payload, event.remote_etag.as_deref(), meter)
            .await
        {
            Ok(write) => {
                let mut event = event.clone();
                event.refresh_etag(write.etag, (self.now_provider)());
                result.record(event.id.clone(), SyncAction::Updated, None);
                Some(event)
            }
            Err(InfraError::PreconditionFailed { .. }) => {
                self.record_conflict(user_id, event, remote_id, meter, result).await;
                None
            }
            Err(error) => {
                warn!(user_id, event_id = %event.id, error = %error, "google update failed");
                result.record(event.id.clone(), SyncAction::Failed, Some(error.to_string()));
                None
            }
        }
    }

    async fn record_conflict(
        &self,
        user_id: &str,
        event: &LocalEvent,
        remote_id: &str,
        meter: &QuotaMeter,
        result: &mut SyncResult,
    ) {
        let snapshot = match self.remote.get(user_id, remote_id, meter).await {
            Ok(remote) => snapshot_from_remote(&remote),
            Err(error) => Err(error),
        };
        match snapshot {
            Ok(remote_data) => {
                debug!(user_id, event_id = %event.id, remote_id, "etag mismatch detected");
                result.conflicts.push(Conflict {
                    local_event_id: event.id.clone(),
                    remote_event_id: remote_id.to_string(),
                    conflict_type: ConflictType::EtagMismatch,
                    local_data: event.clone(),
                    remote_data,
                });
                result.record(event.id.clone(), SyncAction::Conflict, None);
            }
            Err(error) => {
                warn!(user_id, event_id = %event.id, error = %error, "failed to fetch conflicting remote event");
                result.record(event.id.clone(), SyncAction::Failed, Some(error.to_string()));
            }
        }
    }
}

#[async_trait]
impl SyncExecutor for SyncOrchestrator {
    async fn execute(
        &self,
        user_id: &str,
        request: &SyncRequest,
        progress: Option<ProgressReporter>,
    ) -> Result<SyncResult, InfraError> {
        self.sync_with_progress(user_id, request, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::oauth::AccessTokenProvider;
    use crate::application::remote_calendar::RetryPolicy;
    use crate::application::test_support::{
        fixed_time, planned_event, remote_event, FakeFailure, FakeGoogleCalendarApi, StaticTokenProvider,
    };
    use crate::domain::models::DateRange;
    use crate::infrastructure::event_store::InMemoryLocalEventStore;
    use crate::infrastructure::kv_store::InMemoryKeyValueStore;
    use crate::infrastructure::quota_tracker::InMemoryQuotaTracker;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Harness {
        store: Arc<InMemoryLocalEventStore>,
        api: Arc<FakeGoogleCalendarApi>,
        orchestrator: SyncOrchestrator,
    }

    fn harness(config: EngineConfig, tokens: StaticTokenProvider, events: Vec<LocalEvent>) -> Harness {
        let store = Arc::new(InMemoryLocalEventStore::with_events(events));
        let api = Arc::new(FakeGoogleCalendarApi::default());
        let orchestrator = orchestrator_over(config, tokens, Arc::clone(&store) as _, Arc::clone(&api));
        Harness {
            store,
            api,
            orchestrator,
        }
    }

    fn orchestrator_over(
        config: EngineConfig,
        tokens: StaticTokenProvider,
        store: Arc<dyn LocalEventStore>,
        api: Arc<FakeGoogleCalendarApi>,
    ) -> SyncOrchestrator {
        let tokens: Arc<dyn AccessTokenProvider> = Arc::new(tokens);
        let remote = RemoteCalendarClient::new(
            Arc::clone(&api) as _,
            tokens,
            Arc::new(InMemoryQuotaTracker::new(config.quota.daily_limit)),
            config.calendar_id.clone(),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
        });
        let guard = IdempotencyGuard::new(
            Arc::new(InMemoryKeyValueStore::default()),
            &config.idempotency,
        );
        SyncOrchestrator::new(store, Arc::new(remote), Arc::new(guard), config)
            .expect("orchestrator")
            .with_now_provider(Arc::new(fixed_time))
    }

    /// Event store whose batch writes always fail and whose single writes fail for chosen ids.
    struct FlakyEventStore {
        inner: InMemoryLocalEventStore,
        broken_ids: Vec<String>,
    }

    impl LocalEventStore for FlakyEventStore {
        fn find_by_user_and_date_range(
            &self,
            user_id: &str,
            range: &DateRange,
        ) -> Result<Vec<LocalEvent>, InfraError> {
            self.inner.find_by_user_and_date_range(user_id, range)
        }

        fn find_by_id(&self, event_id: &str) -> Result<Option<LocalEvent>, InfraError> {
            self.inner.find_by_id(event_id)
        }

        fn save(&self, event: &LocalEvent) -> Result<(), InfraError> {
            if self.broken_ids.contains(&event.id) {
                return Err(InfraError::Storage("disk full".to_string()));
            }
            self.inner.save(event)
        }

        fn save_many(&self, _events: &[LocalEvent]) -> Result<(), InfraError> {
            Err(InfraError::Storage("disk full".to_string()))
        }

        fn update(&self, event: &LocalEvent) -> Result<(), InfraError> {
            self.inner.update(event)
        }
    }

    fn january_request(key: &str) -> SyncRequest {
        SyncRequest {
            direction: SyncDirection::UpsertToGoogle,
            range: DateRange::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
                NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date"),
            ),
            event_ids: None,
            dry_run: false,
            idempotency_key: key.to_string(),
        }
    }

    /// Synced event whose remote copy exists in `api` with a matching etag.
    fn synced_event(api: &FakeGoogleCalendarApi, id: &str, day: u32) -> LocalEvent {
        let remote_id = format!("seeded-{id}");
        let etag = api.seed_remote(&remote_id, remote_event(id));
        let mut event = planned_event(id, day);
        event.mark_synced(remote_id, Some(etag), fixed_time());
        event
    }

    #[tokio::test]
    async fn one_failure_in_second_batch_does_not_abort_the_pass() {
        let events: Vec<LocalEvent> = (0..150)
            .map(|index| planned_event(&format!("evt-{index:03}"), 1 + (index % 28) as u32))
            .collect();
        let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), events);
        h.api.fail_inserts_for("evt-075", FakeFailure::BadRequest);

        let result = h
            .orchestrator
            .sync_to_google("user-1", &january_request("batch-isolation-0001"))
            .await
            .expect("sync");

        assert_eq!(result.summary.created, 149);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.details.len(), 150);
        assert_eq!(result.quota_used, 150);
        let failed = result
            .details
            .iter()
            .find(|detail| detail.action == SyncAction::Failed)
            .expect("failed detail");
        assert_eq!(failed.event_id, "evt-075");
        assert!(failed.error.as_deref().is_some_and(|message| message.contains("http 400")));

        let untouched = h.store.find_by_id("evt-075").expect("find").expect("exists");
        assert_eq!(untouched.status, EventStatus::Planned);
        let pushed = h.store.find_by_id("evt-149").expect("find").expect("exists");
        assert_eq!(pushed.status, EventStatus::Synced);
        assert!(pushed.remote_event_id.is_some());
        assert_eq!(h.api.remote_count(), 149);
    }

    proptest! {
        #[test]
        fn dry_run_predicts_the_real_run(planned in 0usize..6, synced in 0usize..6, deleted in 0usize..3) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let api_for_seed = FakeGoogleCalendarApi::default();
                let mut events = Vec::new();
                for index in 0..planned {
                    events.push(planned_event(&format!("new-{index}"), 2));
                }
                for index in 0..synced {
                    events.push(synced_event(&api_for_seed, &format!("old-{index}"), 3));
                }
                for index in 0..deleted {
                    let mut event = planned_event(&format!("gone-{index}"), 4);
                    event.mark_deleted(fixed_time());
                    events.push(event);
                }

                let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), events.clone());
                for event in events.iter().filter(|event| event.status == EventStatus::Synced) {
                    let remote_id = event.remote_event_id.clone().expect("remote id");
                    let seeded = api_for_seed.remote(&remote_id).expect("seeded remote");
                    let etag = h.api.seed_remote(&remote_id, seeded);
                    let mut aligned = event.clone();
                    aligned.refresh_etag(Some(etag), fixed_time());
                    h.store.update(&aligned).expect("align etag");
                }

                let mut dry = january_request("dry-run-parity-0001");
                dry.dry_run = true;
                let predicted = h.orchestrator.sync_to_google("user-1", &dry).await.expect("dry run");
                assert!(predicted.is_dry_run);
                assert_eq!(predicted.quota_used, 0);
                assert_eq!(h.api.total_calls(), 0);
                assert_eq!(
                    h.store.find_by_user_and_date_range("user-1", &dry.range).expect("load")
                        .iter().filter(|event| event.status == EventStatus::Synced).count(),
                    synced
                );

                let actual = h
                    .orchestrator
                    .sync_to_google("user-1", &january_request("dry-run-parity-0002"))
                    .await
                    .expect("real run");
                assert!(!actual.is_dry_run);
                assert_eq!(predicted.summary, actual.summary);
                assert_eq!(actual.summary.created, planned);
                assert_eq!(actual.summary.updated, synced);
                assert_eq!(actual.summary.skipped, deleted);
            });
        }
    }

    #[tokio::test]
    async fn stale_etag_yields_conflict_instead_of_update() {
        let api_seed = FakeGoogleCalendarApi::default();
        let event = synced_event(&api_seed, "evt-1", 5);
        let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), vec![event.clone()]);
        let remote_id = event.remote_event_id.clone().expect("remote id");
        h.api.seed_remote(&remote_id, remote_event("evt-1"));
        let current_etag = h.api.touch_remote(&remote_id).expect("touch");

        let result = h
            .orchestrator
            .sync_to_google("user-1", &january_request("conflict-detect-0001"))
            .await
            .expect("sync");

        assert_eq!(result.summary.updated, 0);
        assert_eq!(result.summary.failed, 0);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.details[0].action, SyncAction::Conflict);
        let conflict = &result.conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictType::EtagMismatch);
        assert_eq!(conflict.remote_event_id, remote_id);
        assert_eq!(conflict.remote_data.etag.as_deref(), Some(current_etag.as_str()));
        assert_eq!(conflict.local_data, event);

        let stored = h.store.find_by_id("evt-1").expect("find").expect("exists");
        assert_eq!(stored.remote_etag, event.remote_etag);
    }

    #[tokio::test]
    async fn conflict_fetch_failure_marks_item_failed() {
        let api_seed = FakeGoogleCalendarApi::default();
        let event = synced_event(&api_seed, "evt-1", 5);
        let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), vec![event.clone()]);
        let remote_id = event.remote_event_id.clone().expect("remote id");
        h.api.seed_remote(&remote_id, remote_event("evt-1"));
        h.api.touch_remote(&remote_id);
        h.api.fail_gets_for(&remote_id, FakeFailure::Auth);

        let result = h
            .orchestrator
            .sync_to_google("user-1", &january_request("conflict-fetch-0001"))
            .await
            .expect("sync");
        assert_eq!(result.summary.failed, 1);
        assert!(result.conflicts.is_empty());
    }

    #[tokio::test]
    async fn missing_account_fails_before_processing_any_event() {
        for dry_run in [false, true] {
            let h = harness(
                EngineConfig::default(),
                StaticTokenProvider::disconnected(),
                vec![planned_event("evt-1", 3)],
            );
            let mut request = january_request("no-account-key-0001");
            request.dry_run = dry_run;

            let result = h.orchestrator.sync_to_google("user-1", &request).await;
            assert!(matches!(result, Err(InfraError::Auth(_))), "dry_run={dry_run}");
            assert_eq!(h.api.total_calls(), 0);
            let stored = h.store.find_by_id("evt-1").expect("find").expect("exists");
            assert_eq!(stored.status, EventStatus::Planned);
        }
    }

    #[tokio::test]
    async fn empty_range_yields_zero_summary() {
        let h = harness(
            EngineConfig::default(),
            StaticTokenProvider::connected(),
            vec![planned_event("evt-1", 3)],
        );
        let mut request = january_request("zero-candidates-001");
        request.range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 2, 1).expect("valid date"),
            NaiveDate::from_ymd_opt(2024, 2, 29).expect("valid date"),
        );

        let result = h.orchestrator.sync_to_google("user-1", &request).await.expect("sync");
        assert_eq!(result.summary, Default::default());
        assert!(result.details.is_empty());
        assert_eq!(result.quota_used, 0);
    }

    #[tokio::test]
    async fn skip_window_does_not_exclude_synced_events() {
        let api_seed = FakeGoogleCalendarApi::default();
        let mut event = synced_event(&api_seed, "holiday-1", 6);
        event.skip_window = true;
        let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), vec![event.clone()]);
        let remote_id = event.remote_event_id.clone().expect("remote id");
        let etag = h.api.seed_remote(&remote_id, remote_event("holiday-1"));
        event.refresh_etag(Some(etag), fixed_time());
        h.store.update(&event).expect("align etag");

        let result = h
            .orchestrator
            .sync_to_google("user-1", &january_request("skip-window-key-01"))
            .await
            .expect("sync");
        assert_eq!(result.summary.updated, 1);
        assert_eq!(result.details[0].action, SyncAction::Updated);
        let stored = h.store.find_by_id("holiday-1").expect("find").expect("exists");
        assert_ne!(stored.remote_etag, event.remote_etag);
    }

    #[tokio::test]
    async fn repeated_key_replays_cached_result() {
        let h = harness(
            EngineConfig::default(),
            StaticTokenProvider::connected(),
            vec![planned_event("evt-1", 3), planned_event("evt-2", 4)],
        );
        let request = january_request("replay-me-000000001");

        let first = h.orchestrator.sync_to_google("user-1", &request).await.expect("first");
        let calls_after_first = h.api.total_calls();
        let second = h.orchestrator.sync_to_google("user-1", &request).await.expect("second");

        assert_eq!(first, second);
        assert_eq!(h.api.total_calls(), calls_after_first);
        assert_eq!(h.api.remote_count(), 2);
    }

    #[tokio::test]
    async fn explicit_ids_restrict_candidates_and_report_missing() {
        let h = harness(
            EngineConfig::default(),
            StaticTokenProvider::connected(),
            vec![planned_event("evt-1", 3), planned_event("evt-2", 4)],
        );
        let mut request = january_request("explicit-ids-00001");
        request.event_ids = Some(vec!["evt-2".to_string(), "ghost".to_string()]);

        let result = h.orchestrator.sync_to_google("user-1", &request).await.expect("sync");
        assert_eq!(result.summary.created, 1);
        assert_eq!(result.summary.skipped, 1);
        let skipped = result
            .details
            .iter()
            .find(|detail| detail.event_id == "ghost")
            .expect("ghost detail");
        assert_eq!(skipped.error.as_deref(), Some(EVENT_NOT_FOUND));
        let untouched = h.store.find_by_id("evt-1").expect("find").expect("exists");
        assert_eq!(untouched.status, EventStatus::Planned);
    }

    #[tokio::test]
    async fn too_many_candidates_is_rejected_before_any_call() {
        let mut config = EngineConfig::default();
        config.sync.max_events_per_sync = 2;
        let h = harness(
            config,
            StaticTokenProvider::connected(),
            vec![planned_event("a", 1), planned_event("b", 2), planned_event("c", 3)],
        );

        let result = h
            .orchestrator
            .sync_to_google("user-1", &january_request("size-limit-key-001"))
            .await;
        match result {
            Err(InfraError::SizeLimit { requested, limit }) => {
                assert_eq!(requested, 3);
                assert_eq!(limit, 2);
            }
            other => panic!("expected size limit, got {other:?}"),
        }
        assert_eq!(h.api.total_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), Vec::new());

        let mut reversed = january_request("reversed-range-001");
        reversed.range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 2, 1).expect("valid date"),
            NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
        );
        assert!(matches!(
            h.orchestrator.sync_to_google("user-1", &reversed).await,
            Err(InfraError::Validation(_))
        ));

        let mut too_long = january_request("too-long-range-001");
        too_long.range.to = NaiveDate::from_ymd_opt(2025, 6, 1).expect("valid date");
        assert!(matches!(
            h.orchestrator.sync_to_google("user-1", &too_long).await,
            Err(InfraError::Validation(_))
        ));

        assert!(matches!(
            h.orchestrator.sync_to_google("user-1", &january_request("  ")).await,
            Err(InfraError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn short_caller_key_without_account_is_an_auth_error() {
        let h = harness(
            EngineConfig::default(),
            StaticTokenProvider::disconnected(),
            vec![planned_event("evt-1", 3)],
        );

        let result = h.orchestrator.sync_to_google("user-1", &january_request("k")).await;

        assert!(matches!(result, Err(InfraError::Auth(_))), "{result:?}");
        assert_eq!(h.api.total_calls(), 0);
    }

    #[tokio::test]
    async fn unsaved_creates_are_rolled_back_and_not_duplicated() {
        let api = Arc::new(FakeGoogleCalendarApi::default());
        let store = Arc::new(FlakyEventStore {
            inner: InMemoryLocalEventStore::with_events(vec![planned_event("evt-1", 3), planned_event("evt-2", 4)]),
            broken_ids: vec!["evt-2".to_string()],
        });
        let orchestrator = orchestrator_over(
            EngineConfig::default(),
            StaticTokenProvider::connected(),
            Arc::clone(&store) as _,
            Arc::clone(&api),
        );
        let request = january_request("unsaved-create-0001");

        let first = orchestrator.sync_to_google("user-1", &request).await.expect("sync");
        assert_eq!(first.summary.created, 1);
        assert_eq!(first.summary.failed, 1);
        let failed = first
            .details
            .iter()
            .find(|detail| detail.event_id == "evt-2")
            .expect("evt-2 detail");
        assert_eq!(failed.action, SyncAction::Failed);
        assert!(failed.error.as_deref().is_some_and(|message| message.contains("local save failed")));
        assert_eq!(api.remote_count(), 1);
        assert_eq!(api.delete_calls.load(Ordering::SeqCst), 1);
        let saved = store.find_by_id("evt-1").expect("find").expect("exists");
        assert_eq!(saved.status, EventStatus::Synced);

        let replayed = orchestrator.sync_to_google("user-1", &request).await.expect("replay");
        assert_eq!(replayed, first);
        assert_eq!(api.remote_count(), 1);

        let next_pass = orchestrator
            .sync_to_google("user-1", &january_request("unsaved-create-0002"))
            .await
            .expect("next pass");
        assert_eq!(next_pass.summary.updated, 1);
        assert_eq!(next_pass.summary.failed, 1);
        assert_eq!(api.remote_count(), 1);
    }

    #[tokio::test]
    async fn transient_update_failure_is_retried_then_reported() {
        let api_seed = FakeGoogleCalendarApi::default();
        let event = synced_event(&api_seed, "evt-1", 5);
        let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), vec![event.clone()]);
        let remote_id = event.remote_event_id.clone().expect("remote id");
        h.api.fail_updates_for(&remote_id, FakeFailure::Timeout);

        let result = h
            .orchestrator
            .sync_to_google("user-1", &january_request("transient-update-01"))
            .await
            .expect("sync");
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.details[0].error.as_deref(), Some("network timeout"));
        assert_eq!(h.api.update_calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.quota_used, 3);
    }

    #[tokio::test]
    async fn progress_reaches_total() {
        let h = harness(
            EngineConfig::default(),
            StaticTokenProvider::connected(),
            vec![planned_event("evt-1", 3), planned_event("evt-2", 4), planned_event("evt-3", 5)],
        );
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let reporter: ProgressReporter = Arc::new(move |processed, total| {
            counter.fetch_add(1, Ordering::SeqCst);
            sink.lock().expect("reports").push((processed, total));
        });

        h.orchestrator
            .execute("user-1", &january_request("progress-key-00001"), Some(reporter))
            .await
            .expect("sync");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reports.lock().expect("reports").last().copied(), Some((3, 3)));
    }

    #[tokio::test]
    async fn delete_removes_remote_copy_and_tombstones_local_event() {
        let api_seed = FakeGoogleCalendarApi::default();
        let event = synced_event(&api_seed, "evt-1", 5);
        let h = harness(EngineConfig::default(), StaticTokenProvider::connected(), vec![event.clone()]);
        let remote_id = event.remote_event_id.clone().expect("remote id");
        h.api.seed_remote(&remote_id, remote_event("evt-1"));

        let deleted = h.orchestrator.delete_from_google("user-1", "evt-1").await.expect("delete");
        assert_eq!(deleted.status, EventStatus::Deleted);
        assert!(deleted.remote_event_id.is_none());
        assert!(h.api.remote(&remote_id).is_none());

        let again = h.orchestrator.delete_from_google("user-1", "evt-1").await.expect("delete again");
        assert_eq!(again.status, EventStatus::Deleted);
        assert_eq!(h.api.delete_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            h.orchestrator.delete_from_google("user-2", "evt-1").await,
            Err(InfraError::NotFound(_))
        ));
    }
}
