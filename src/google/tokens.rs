use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio_rusqlite::Connection;

use super::oauth::refresh_access_token;
use crate::calendar::db::get_refresh_token;
use crate::core::AppConfig;
use crate::provider::{ProviderError, ProviderResult, TokenSource};

// Refresh a little before the provider says the token expires
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Access tokens per account, refreshed from the refresh token stored with
/// the account. Refreshes for one account are serialized so a burst of
/// callers triggers a single refresh.
pub struct GoogleTokenManager {
    db: Connection,
    client: Client,
    oauth_url: String,
    client_id: String,
    client_secret: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GoogleTokenManager {
    pub fn new(db: Connection, client: Client, config: &AppConfig) -> Self {
        Self {
            db,
            client,
            oauth_url: config.google_oauth_url.clone(),
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
            tokens: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, account_id: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .get(account_id)
            .filter(|t| t.expires_at > Instant::now())
            .map(|t| t.access_token.clone())
    }

    fn refresh_lock(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl TokenSource for GoogleTokenManager {
    async fn access_token(&self, account_id: &str) -> ProviderResult<String> {
        if let Some(token) = self.cached(account_id) {
            return Ok(token);
        }

        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(token) = self.cached(account_id) {
            return Ok(token);
        }

        let refresh_token = get_refresh_token(&self.db, account_id)
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?
            .ok_or_else(|| {
                ProviderError::Permanent(format!("No refresh token stored for {}", account_id))
            })?;

        tracing::debug!("Refreshing access token for {}", account_id);
        let token = refresh_access_token(
            &self.client,
            &self.oauth_url,
            &self.client_id,
            &self.client_secret,
            &refresh_token,
        )
        .await?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let expires_at = Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN);
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                account_id.to_string(),
                CachedToken {
                    access_token: token.access_token.clone(),
                    expires_at,
                },
            );
        Ok(token.access_token)
    }

    async fn invalidate(&self, account_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(account_id);
    }
}
