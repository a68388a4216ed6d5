use crate::domain::models::OAuthToken;
use crate::infrastructure::config::OAuthConfig;
use crate::infrastructure::credential_store::{TokenStore, GOOGLE_PROVIDER};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::oauth_client::{OAuthHttpClient, OAuthRefreshRequest, OAuthTokenResponse};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_REFRESH_HORIZON_SECONDS: i64 = 300;

/// Hands out access tokens for a user's connected Google account.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// A token valid for at least the refresh horizon, refreshing if needed.
    async fn ensure_valid_token(&self, user_id: &str) -> Result<OAuthToken, InfraError>;
    /// Whether a Google account is connected; never refreshes.
    fn has_account(&self, user_id: &str) -> Result<bool, InfraError>;
}

pub struct TokenManager<S, C>
where
    S: TokenStore,
    C: OAuthHttpClient,
{
    config: OAuthConfig,
    token_store: Arc<S>,
    oauth_client: Arc<C>,
    refresh_horizon_seconds: i64,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    now_provider: NowProvider,
}

impl<S, C> TokenManager<S, C>
where
    S: TokenStore,
    C: OAuthHttpClient,
{
    pub fn new(config: OAuthConfig, token_store: Arc<S>, oauth_client: Arc<C>) -> Self {
        Self {
            config,
            token_store,
            oauth_client,
            refresh_horizon_seconds: DEFAULT_REFRESH_HORIZON_SECONDS,
            refresh_locks: Mutex::new(HashMap::new()),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_refresh_horizon(mut self, seconds: i64) -> Self {
        self.refresh_horizon_seconds = seconds.max(0);
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn is_token_valid(&self, token: &OAuthToken) -> bool {
        token.is_valid_at((self.now_provider)(), self.refresh_horizon_seconds)
    }

    pub fn clear_stored_token(&self, user_id: &str) -> Result<(), InfraError> {
        self.token_store.delete_token(user_id, GOOGLE_PROVIDER)
    }

    fn load_required(&self, user_id: &str) -> Result<OAuthToken, InfraError> {
        self.token_store
            .load_token(user_id, GOOGLE_PROVIDER)?
            .ok_or_else(|| InfraError::Auth(format!("no google account connected for user {user_id}")))
    }

    fn refresh_lock(&self, user_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, InfraError> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|error| InfraError::lock_poisoned("token refresh", error))?;
        Ok(Arc::clone(locks.entry(user_id.to_string()).or_default()))
    }

    async fn refresh(&self, user_id: &str, stored: OAuthToken) -> Result<OAuthToken, InfraError> {
        let Some(refresh_token) = stored.refresh_token.clone() else {
            return Err(InfraError::Auth(format!(
                "access token for user {user_id} expired and no refresh token is stored"
            )));
        };

        let response = self
            .oauth_client
            .refresh_access_token(OAuthRefreshRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                refresh_token,
            })
            .await
            .map_err(|error| match error {
                InfraError::Auth(_) => error,
                other => InfraError::Auth(format!("token refresh failed: {other}")),
            })?;

        let token = self.token_from_response(response, stored.refresh_token);
        self.token_store.save_token(user_id, GOOGLE_PROVIDER, &token)?;
        Ok(token)
    }

    fn token_from_response(
        &self,
        response: OAuthTokenResponse,
        fallback_refresh_token: Option<String>,
    ) -> OAuthToken {
        let expires_at = (self.now_provider)() + Duration::seconds(response.expires_in.max(0));
        OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(fallback_refresh_token),
            expires_at,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: response.scope,
        }
    }
}

#[async_trait]
impl<S, C> AccessTokenProvider for TokenManager<S, C>
where
    S: TokenStore,
    C: OAuthHttpClient,
{
    async fn ensure_valid_token(&self, user_id: &str) -> Result<OAuthToken, InfraError> {
        let stored = self.load_required(user_id)?;
        if self.is_token_valid(&stored) {
            return Ok(stored);
        }

        // Single flight per user: whoever waits here re-reads the store first.
        let lock = self.refresh_lock(user_id)?;
        let _guard = lock.lock().await;

        let stored = self.load_required(user_id)?;
        if self.is_token_valid(&stored) {
            debug!(user_id, "access token refreshed by concurrent caller");
            return Ok(stored);
        }

        match self.refresh(user_id, stored).await {
            Ok(token) => {
                info!(user_id, expires_at = %token.expires_at, "refreshed google access token");
                Ok(token)
            }
            Err(error) => {
                warn!(user_id, error = %error, "google access token refresh failed");
                Err(error)
            }
        }
    }

    fn has_account(&self, user_id: &str) -> Result<bool, InfraError> {
        Ok(self.token_store.load_token(user_id, GOOGLE_PROVIDER)?.is_some())
    }
}
