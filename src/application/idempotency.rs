use crate::infrastructure::config::IdempotencySettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::kv_store::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const MIN_KEY_LEN: usize = 16;
const MAX_KEY_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentOutcome<T> {
    pub data: T,
    pub is_from_cache: bool,
}

/// Runs side-effecting operations at most once per key within the TTL window.
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    default_ttl: Duration,
    lock_ttl: Duration,
    owner_id: String,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: &IdempotencySettings) -> Self {
        Self {
            store,
            prefix: settings.prefix.clone(),
            default_ttl: Duration::from_secs(settings.ttl_seconds),
            lock_ttl: Duration::from_secs(settings.lock_ttl_seconds),
            owner_id: Uuid::now_v7().to_string(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ensure_idempotent<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        operation: F,
    ) -> Result<IdempotentOutcome<T>, InfraError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        validate_key(key)?;
        let cache_key = format!("{}:{key}", self.prefix);

        // Declared before the mutex guard so it is dropped after it, even when the caller
        // abandons this future mid-operation.
        let slot = LocalSlot {
            guard: self,
            lock: self.local_lock(&cache_key)?,
            cache_key: cache_key.clone(),
        };
        let _held = slot.lock.lock().await;
        self.run_once(key, &cache_key, ttl.unwrap_or(self.default_ttl), operation)
            .await
    }

    async fn run_once<T, F, Fut>(
        &self,
        key: &str,
        cache_key: &str,
        ttl: Duration,
        operation: F,
    ) -> Result<IdempotentOutcome<T>, InfraError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        if let Some(raw) = self.store.get(cache_key)? {
            debug!(idempotency_key = key, "replaying cached result");
            return Ok(IdempotentOutcome {
                data: serde_json::from_str(&raw)?,
                is_from_cache: true,
            });
        }

        let lock_key = format!("{cache_key}:lock");
        if !self.store.set_if_absent(&lock_key, &self.owner_id, self.lock_ttl)? {
            warn!(idempotency_key = key, "operation already running on another instance");
            return Err(InfraError::IdempotencyInProgress(key.to_string()));
        }
        let _release = LockRelease {
            store: &*self.store,
            lock_key,
            idempotency_key: key,
        };

        let result = operation().await;
        let stored = match &result {
            Ok(data) => serde_json::to_string(data)
                .map_err(InfraError::from)
                .and_then(|raw| self.store.set(cache_key, &raw, ttl)),
            Err(_) => Ok(()),
        };
        if let Err(store_error) = stored {
            error!(idempotency_key = key, error = %store_error, "failed to cache idempotent result");
        }

        result.map(|data| IdempotentOutcome {
            data,
            is_from_cache: false,
        })
    }

    fn local_lock(&self, cache_key: &str) -> Result<Arc<tokio::sync::Mutex<()>>, InfraError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|error| InfraError::lock_poisoned("idempotency", error))?;
        Ok(Arc::clone(in_flight.entry(cache_key.to_string()).or_default()))
    }

    fn release_local(&self, cache_key: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let Ok(mut in_flight) = self.in_flight.lock() else {
            return;
        };
        // Map entry plus ours: nobody else is waiting on this key.
        if Arc::strong_count(lock) <= 2 {
            in_flight.remove(cache_key);
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().map(|map| map.len()).unwrap_or_default()
    }
}

/// Per-key slot in the in-process lock map, removed once its last user is gone.
struct LocalSlot<'a> {
    guard: &'a IdempotencyGuard,
    lock: Arc<tokio::sync::Mutex<()>>,
    cache_key: String,
}

impl Drop for LocalSlot<'_> {
    fn drop(&mut self) {
        self.guard.release_local(&self.cache_key, &self.lock);
    }
}

/// Shared-store lock entry owned by the running operation.
struct LockRelease<'a> {
    store: &'a dyn KeyValueStore,
    lock_key: String,
    idempotency_key: &'a str,
}

impl Drop for LockRelease<'_> {
    fn drop(&mut self) {
        if let Err(store_error) = self.store.delete(&self.lock_key) {
            warn!(
                idempotency_key = self.idempotency_key,
                error = %store_error,
                "failed to release idempotency lock"
            );
        }
    }
}

pub fn validate_key(key: &str) -> Result<(), InfraError> {
    let length_ok = (MIN_KEY_LEN..=MAX_KEY_LEN).contains(&key.len());
    let charset_ok = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !length_ok || !charset_ok {
        return Err(InfraError::Validation(format!(
            "idempotency key must be {MIN_KEY_LEN}-{MAX_KEY_LEN} characters of [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Caller-supplied request keys may be any non-blank text; they are hashed into a guard key.
pub fn validate_request_key(key: &str) -> Result<(), InfraError> {
    if key.trim().is_empty() {
        return Err(InfraError::Validation("idempotency key is required".to_string()));
    }
    Ok(())
}

/// SHA-256 over the canonical form of a request; a missing payload hashes like `null`.
pub fn fingerprint(user_id: &str, method: &str, path: &str, payload: Option<&Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::String(user_id.to_string()), &mut canonical);
    canonical.push('|');
    write_canonical(&Value::String(method.to_ascii_uppercase()), &mut canonical);
    canonical.push('|');
    write_canonical(&Value::String(path.to_string()), &mut canonical);
    canonical.push('|');
    write_canonical(payload.unwrap_or(&Value::Null), &mut canonical);

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Idempotency key for callers that do not supply one.
pub fn derive_key<P: Serialize>(user_id: &str, method: &str, path: &str, payload: &P) -> Result<String, InfraError> {
    let value = serde_json::to_value(payload)?;
    Ok(fingerprint(user_id, method, path, Some(&value)))
}

/// JSON with object keys sorted and array elements sorted by their canonical text.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            let mut rendered: Vec<String> = items.iter().map(canonicalize).collect();
            rendered.sort();
            out.push('[');
            out.push_str(&rendered.join(","));
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
