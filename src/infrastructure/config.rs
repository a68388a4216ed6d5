use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const ENGINE_JSON: &str = "engine.json";
const CONFIG_SCHEMA: u64 = 1;
const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub schema: u8,
    pub timezone: String,
    pub calendar_id: String,
    pub title_prefix: Option<String>,
    /// Event kind (`lecture`, `lab`, ...) to Google `colorId`.
    pub color_map: HashMap<String, String>,
    pub sync: SyncSettings,
    pub retry: RetrySettings,
    pub idempotency: IdempotencySettings,
    pub token: TokenSettings,
    pub quota: QuotaSettings,
    pub queue: QueueSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            timezone: "UTC".to_string(),
            calendar_id: "primary".to_string(),
            title_prefix: None,
            color_map: HashMap::from([
                ("lecture".to_string(), "9".to_string()),
                ("lab".to_string(), "10".to_string()),
                ("seminar".to_string(), "5".to_string()),
                ("exam".to_string(), "11".to_string()),
            ]),
            sync: SyncSettings::default(),
            retry: RetrySettings::default(),
            idempotency: IdempotencySettings::default(),
            token: TokenSettings::default(),
            quota: QuotaSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn time_zone(&self) -> Result<Tz, InfraError> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{}': {error}", self.timezone)))
    }

    pub fn validate(&self) -> Result<(), InfraError> {
        self.time_zone()?;
        if self.calendar_id.trim().is_empty() {
            return Err(InfraError::InvalidConfig("calendarId must not be empty".to_string()));
        }
        if self.sync.batch_size == 0 {
            return Err(InfraError::InvalidConfig("sync.batchSize must be > 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(InfraError::InvalidConfig("retry.maxAttempts must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub max_events_per_sync: usize,
    pub max_range_days: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_events_per_sync: 1000,
            max_range_days: 366,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct IdempotencySettings {
    pub prefix: String,
    pub ttl_seconds: u64,
    pub lock_ttl_seconds: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            prefix: "idempotency".to_string(),
            ttl_seconds: 24 * 60 * 60,
            lock_ttl_seconds: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenSettings {
    pub refresh_horizon_seconds: i64,
    pub token_endpoint: String,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            refresh_horizon_seconds: 300,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaSettings {
    pub daily_limit: u64,
    pub cost_per_call: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            daily_limit: 1_000_000,
            cost_per_call: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    pub max_active_jobs: usize,
    pub max_waiting_jobs: usize,
    pub max_failed_jobs: usize,
    pub stuck_job_threshold_seconds: i64,
    /// Finished jobs older than this are dropped from the store.
    pub finished_retention_seconds: i64,
    pub job_timeout_seconds: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub monitor_interval_seconds: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_active_jobs: 10,
            max_waiting_jobs: 100,
            max_failed_jobs: 50,
            stuck_job_threshold_seconds: 30 * 60,
            finished_retention_seconds: 24 * 60 * 60,
            job_timeout_seconds: 10 * 60,
            max_attempts: 3,
            retry_base_delay_ms: 5_000,
            poll_interval_ms: 500,
            monitor_interval_seconds: 60,
        }
    }
}

pub fn ensure_default_config(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(ENGINE_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&EngineConfig::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != CONFIG_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_config(config_dir: &Path) -> Result<EngineConfig, InfraError> {
    let value = read_config(&config_dir.join(ENGINE_JSON))?;
    let config: EngineConfig = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}

/// Client credentials used to refresh Google access tokens.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
}

pub fn load_oauth_config_from_env(token_endpoint: &str) -> Result<OAuthConfig, InfraError> {
    load_oauth_config_from_lookup(token_endpoint, |key| std::env::var(key).ok())
}

pub fn load_oauth_config_from_lookup<F>(token_endpoint: &str, lookup: F) -> Result<OAuthConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let client_id = required_lookup_value(
        &lookup,
        &["CALSYNC_GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_ID"],
        "google client id",
    )?;
    let client_secret = required_lookup_value(
        &lookup,
        &["CALSYNC_GOOGLE_CLIENT_SECRET", "GOOGLE_CLIENT_SECRET"],
        "google client secret",
    )?;
    Ok(OAuthConfig {
        client_id,
        client_secret,
        token_endpoint: token_endpoint.to_string(),
    })
}

fn required_lookup_value<F>(lookup: &F, keys: &[&str], field_name: &str) -> Result<String, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .ok_or_else(|| {
            InfraError::InvalidConfig(format!(
                "missing {} (set one of: {})",
                field_name,
                keys.join(", ")
            ))
        })
}
