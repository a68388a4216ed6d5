use crate::domain::models::QuotaStatus;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::America::Los_Angeles;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub trait QuotaTracker: Send + Sync {
    fn record_usage(&self, user_id: &str, cost: u64) -> Result<(), InfraError>;
    fn remaining(&self, user_id: &str) -> Result<QuotaStatus, InfraError>;
}

/// Daily budget per user; Google's quota day rolls over at midnight Pacific time.
pub struct InMemoryQuotaTracker {
    daily_limit: u64,
    usage: Mutex<HashMap<String, (NaiveDate, u64)>>,
    now_provider: NowProvider,
}

impl InMemoryQuotaTracker {
    pub fn new(daily_limit: u64) -> Self {
        Self {
            daily_limit,
            usage: Mutex::new(HashMap::new()),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn quota_day(now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&Los_Angeles).date_naive()
    }

    fn reset_time(day: NaiveDate) -> DateTime<Utc> {
        let next = day + Duration::days(1);
        let midnight = next.and_hms_opt(0, 0, 0).unwrap_or_default();
        Los_Angeles
            .from_local_datetime(&midnight)
            .earliest()
            .map(|value| value.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }
}

impl QuotaTracker for InMemoryQuotaTracker {
    fn record_usage(&self, user_id: &str, cost: u64) -> Result<(), InfraError> {
        let today = Self::quota_day((self.now_provider)());
        let mut usage = self
            .usage
            .lock()
            .map_err(|error| InfraError::lock_poisoned("quota", error))?;
        let entry = usage.entry(user_id.to_string()).or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        entry.1 = entry.1.saturating_add(cost);
        Ok(())
    }

    fn remaining(&self, user_id: &str) -> Result<QuotaStatus, InfraError> {
        let today = Self::quota_day((self.now_provider)());
        let usage = self
            .usage
            .lock()
            .map_err(|error| InfraError::lock_poisoned("quota", error))?;
        let used = usage
            .get(user_id)
            .filter(|(day, _)| *day == today)
            .map(|(_, used)| *used)
            .unwrap_or(0);
        Ok(QuotaStatus {
            remaining: self.daily_limit.saturating_sub(used),
            reset_time: Self::reset_time(today),
            daily_limit: self.daily_limit,
        })
    }
}
