//! Keeps CRM credentials valid around external calls.
//!
//! Two paths refresh a token:
//! - proactively, in [`CredentialManager::ensure_valid`], when the access token
//!   expires inside [`REFRESH_WINDOW_SECONDS`];
//! - reactively, in [`CredentialManager::with_retry`], when a provider rejects
//!   the token. The operation is retried exactly once with the fresh credential.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{Credential, CredentialError, CredentialStore, Provider, TokenSet};
use crate::integrations::{GatewayError, ProviderError};

/// Tokens expiring within this many seconds are refreshed before use.
pub const REFRESH_WINDOW_SECONDS: i64 = 5 * 60;

/// Exchanges a refresh token for a new token set at the provider.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    fn provider(&self) -> Provider;

    async fn refresh(&self, credential: &Credential) -> Result<TokenSet, ProviderError>;
}

pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    refreshers: HashMap<Provider, Arc<dyn TokenRefresher>>,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            refreshers: HashMap::new(),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refreshers.insert(refresher.provider(), refresher);
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Load the stored credential for a user and provider.
    pub async fn load(&self, user_id: &str, provider: Provider) -> Result<Credential, CredentialError> {
        self.store
            .get(user_id, provider)
            .await
            .map_err(CredentialError::store)?
            .ok_or_else(|| CredentialError::NotFound {
                user_id: user_id.to_string(),
                provider,
            })
    }

    /// Return a credential that is good for at least the refresh window,
    /// refreshing and persisting it first if needed.
    pub async fn ensure_valid(&self, credential: Credential) -> Result<Credential, CredentialError> {
        self.ensure_valid_at(credential, Utc::now()).await
    }

    pub async fn ensure_valid_at(
        &self,
        credential: Credential,
        now: DateTime<Utc>,
    ) -> Result<Credential, CredentialError> {
        if !credential.expires_within(Duration::seconds(REFRESH_WINDOW_SECONDS), now) {
            return Ok(credential);
        }

        debug!(
            "{} credential {} expires at {}, refreshing",
            credential.provider, credential.id, credential.expires_at
        );
        self.refresh(&credential).await
    }

    /// Refresh unconditionally and persist the new token set.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
        if credential.refresh_token.is_none() {
            warn!(
                "{} credential {} cannot be refreshed: no refresh token",
                credential.provider, credential.id
            );
            return Err(CredentialError::MissingRefreshToken {
                provider: credential.provider,
                id: credential.id,
            });
        }

        let refresher = self
            .refreshers
            .get(&credential.provider)
            .ok_or(CredentialError::NoRefresher(credential.provider))?;

        let tokens = refresher.refresh(credential).await.map_err(|source| {
            error!(
                "Token refresh failed for {} credential {} (status {:?}): {}",
                credential.provider, credential.id, source.status, source.body
            );
            CredentialError::RefreshFailed {
                provider: credential.provider,
                source,
            }
        })?;

        let refreshed = credential.with_tokens(tokens);
        self.store
            .update(&refreshed)
            .await
            .map_err(CredentialError::store)?;

        info!(
            "Refreshed {} credential {} (expires {})",
            refreshed.provider, refreshed.id, refreshed.expires_at
        );
        Ok(refreshed)
    }

    /// Run `operation` once; on an authentication failure refresh the
    /// credential and run it exactly once more. A second failure is returned
    /// as-is.
    pub async fn with_retry<T, F, Fut>(
        &self,
        credential: Credential,
        operation: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match operation(credential.clone()).await {
            Err(err) if err.is_auth_failure() => {
                warn!(
                    "{} rejected credential {} (status {:?}), refreshing and retrying once",
                    credential.provider, credential.id, err.status
                );
                let fresh = self.refresh(&credential).await?;
                operation(fresh).await.map_err(GatewayError::from)
            }
            other => other.map_err(GatewayError::from),
        }
    }
}
