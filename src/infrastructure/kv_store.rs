use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// String key/value cache with per-entry TTL, shared between engine instances.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), InfraError>;
    /// Stores `value` only when no live entry exists. Returns whether it was stored.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, InfraError>;
    fn delete(&self, key: &str) -> Result<(), InfraError>;
    fn purge_expired(&self) -> Result<usize, InfraError>;
}

fn expiry_millis(now: DateTime<Utc>, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(ttl_ms)
}

#[derive(Clone)]
pub struct SqliteKeyValueStore {
    db_path: PathBuf,
    now_provider: NowProvider,
}

impl SqliteKeyValueStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        Ok(connection)
    }

    fn now_millis(&self) -> i64 {
        (self.now_provider)().timestamp_millis()
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let connection = self.connect()?;
        let value = connection
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, self.now_millis()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO kv_entries (key, value, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               expires_at = excluded.expires_at",
            params![key, value, expiry_millis((self.now_provider)(), ttl)],
        )?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        transaction.execute(
            "DELETE FROM kv_entries WHERE key = ?1 AND expires_at <= ?2",
            params![key, self.now_millis()],
        )?;
        let inserted = transaction.execute(
            "INSERT OR IGNORE INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expiry_millis((self.now_provider)(), ttl)],
        )?;
        transaction.commit()?;
        Ok(inserted == 1)
    }

    fn delete(&self, key: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, InfraError> {
        let connection = self.connect()?;
        let removed = connection.execute(
            "DELETE FROM kv_entries WHERE expires_at <= ?1",
            params![self.now_millis()],
        )?;
        Ok(removed)
    }
}

pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, (String, i64)>>,
    now_provider: NowProvider,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            now_provider: Arc::new(Utc::now),
        }
    }
}

impl InMemoryKeyValueStore {
    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, i64)>>, InfraError> {
        self.entries
            .lock()
            .map_err(|error| InfraError::lock_poisoned("key/value store", error))
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let now = (self.now_provider)().timestamp_millis();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), InfraError> {
        let expires_at = expiry_millis((self.now_provider)(), ttl);
        self.lock()?
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, InfraError> {
        let now = (self.now_provider)();
        let mut entries = self.lock()?;
        if entries
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now.timestamp_millis())
        {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), expiry_millis(now, ttl)));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), InfraError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, InfraError> {
        let now = (self.now_provider)().timestamp_millis();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use std::sync::Mutex as StdMutex;

    fn movable_clock() -> (Arc<StdMutex<DateTime<Utc>>>, NowProvider) {
        let clock = Arc::new(StdMutex::new(Utc::now()));
        let provider_clock = Arc::clone(&clock);
        (clock, Arc::new(move || *provider_clock.lock().expect("clock")))
    }

    fn exercise_store(store: &dyn KeyValueStore, clock: &StdMutex<DateTime<Utc>>) {
        store.set("a", "1", Duration::from_secs(60)).expect("set");
        assert_eq!(store.get("a").expect("get"), Some("1".to_string()));

        assert!(!store.set_if_absent("a", "2", Duration::from_secs(60)).expect("set nx"));
        assert!(store.set_if_absent("b", "2", Duration::from_secs(10)).expect("set nx"));

        *clock.lock().expect("clock") += chrono::Duration::seconds(30);
        assert_eq!(store.get("b").expect("get expired"), None);
        assert!(store.set_if_absent("b", "3", Duration::from_secs(10)).expect("set nx after expiry"));
        assert_eq!(store.get("b").expect("get"), Some("3".to_string()));

        *clock.lock().expect("clock") += chrono::Duration::seconds(120);
        assert_eq!(store.purge_expired().expect("purge"), 2);

        store.set("c", "x", Duration::from_secs(60)).expect("set");
        store.delete("c").expect("delete");
        assert_eq!(store.get("c").expect("get"), None);
    }

    #[test]
    fn in_memory_store_honours_ttl_and_set_if_absent() {
        let (clock, provider) = movable_clock();
        let store = InMemoryKeyValueStore::default().with_now_provider(provider);
        exercise_store(&store, &clock);
    }

    #[test]
    fn sqlite_store_honours_ttl_and_set_if_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("engine.sqlite");
        initialize_database(&db_path).expect("init db");

        let (clock, provider) = movable_clock();
        let store = SqliteKeyValueStore::new(&db_path).with_now_provider(provider);
        exercise_store(&store, &clock);
    }
}
