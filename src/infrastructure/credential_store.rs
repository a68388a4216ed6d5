use crate::domain::models::OAuthToken;
use crate::infrastructure::error::InfraError;
use std::collections::HashMap;
use std::sync::Mutex;

pub const GOOGLE_PROVIDER: &str = "google";

/// Access/refresh tokens keyed by user and provider.
pub trait TokenStore: Send + Sync {
    fn save_token(&self, user_id: &str, provider: &str, token: &OAuthToken) -> Result<(), InfraError>;
    fn load_token(&self, user_id: &str, provider: &str) -> Result<Option<OAuthToken>, InfraError>;
    fn delete_token(&self, user_id: &str, provider: &str) -> Result<(), InfraError>;
}

/// OS keyring backed store; the platform credential manager encrypts at rest.
#[derive(Debug, Clone)]
pub struct KeyringTokenStore {
    service_prefix: String,
}

impl KeyringTokenStore {
    pub fn new(service_prefix: impl Into<String>) -> Self {
        Self {
            service_prefix: service_prefix.into(),
        }
    }

    fn entry(&self, user_id: &str, provider: &str) -> Result<keyring::Entry, InfraError> {
        let service = format!("{}.oauth.{provider}", self.service_prefix);
        keyring::Entry::new(&service, user_id).map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new("calsync")
    }
}

impl TokenStore for KeyringTokenStore {
    fn save_token(&self, user_id: &str, provider: &str, token: &OAuthToken) -> Result<(), InfraError> {
        let payload =
            serde_json::to_string(token).map_err(|error| InfraError::Credential(error.to_string()))?;
        self.entry(user_id, provider)?
            .set_password(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_token(&self, user_id: &str, provider: &str) -> Result<Option<OAuthToken>, InfraError> {
        let payload = match self.entry(user_id, provider)?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(InfraError::Credential(error.to_string())),
        };

        let token = serde_json::from_str::<OAuthToken>(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        Ok(Some(token))
    }

    fn delete_token(&self, user_id: &str, provider: &str) -> Result<(), InfraError> {
        match self.entry(user_id, provider)?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<HashMap<(String, String), OAuthToken>>,
}

impl TokenStore for InMemoryTokenStore {
    fn save_token(&self, user_id: &str, provider: &str, token: &OAuthToken) -> Result<(), InfraError> {
        let mut guard = self
            .tokens
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        guard.insert((user_id.to_string(), provider.to_string()), token.clone());
        Ok(())
    }

    fn load_token(&self, user_id: &str, provider: &str) -> Result<Option<OAuthToken>, InfraError> {
        let guard = self
            .tokens
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        Ok(guard.get(&(user_id.to_string(), provider.to_string())).cloned())
    }

    fn delete_token(&self, user_id: &str, provider: &str) -> Result<(), InfraError> {
        let mut guard = self
            .tokens
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        guard.remove(&(user_id.to_string(), provider.to_string()));
        Ok(())
    }
}
