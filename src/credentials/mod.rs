//! CRM credentials and their lifecycle.
//!
//! A credential is one user's OAuth token set for one CRM provider. The
//! [`CredentialManager`] keeps it valid: proactively before a call, and
//! reactively when a provider rejects the access token.

pub mod lifecycle;
pub mod store;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::integrations::ProviderError;

pub use lifecycle::{CredentialManager, TokenRefresher, REFRESH_WINDOW_SECONDS};
pub use store::{CredentialStore, SqliteCredentialStore};

/// The CRM systems a credential can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    HubSpot,
    Salesforce,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::HubSpot, Provider::Salesforce];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::HubSpot => "hubspot",
            Provider::Salesforce => "salesforce",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::HubSpot => "HubSpot",
            Provider::Salesforce => "Salesforce",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}' (expected hubspot or salesforce)")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hubspot" => Ok(Provider::HubSpot),
            "salesforce" => Ok(Provider::Salesforce),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// A stored OAuth token set for one (user, provider) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Provider-side account reference (HubSpot portal id, Salesforce org id).
    pub external_account: String,
    /// Salesforce API host for this org; unused by HubSpot.
    pub instance_url: Option<String>,
}

impl Credential {
    /// True when the access token expires within `window` of `now` (or already has).
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + window
    }

    /// Fold a freshly issued token set into this credential.
    ///
    /// `expires_at` never moves backwards, and a provider that does not rotate
    /// refresh tokens keeps the one already stored.
    pub fn with_tokens(&self, tokens: TokenSet) -> Credential {
        Credential {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at: self.expires_at.max(tokens.expires_at),
            instance_url: tokens.instance_url.or_else(|| self.instance_url.clone()),
            ..self.clone()
        }
    }
}

/// Tokens returned by a provider's refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub instance_url: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("no {provider} credential stored for user {user_id}")]
    NotFound { user_id: String, provider: Provider },
    #[error("{provider} credential {id} has no refresh token; reconnect the account")]
    MissingRefreshToken { provider: Provider, id: i64 },
    #[error("no token refresher registered for {0}")]
    NoRefresher(Provider),
    #[error("token refresh failed for {provider}: {source}")]
    RefreshFailed {
        provider: Provider,
        #[source]
        source: ProviderError,
    },
    #[error("credential store error: {0}")]
    Store(String),
}

impl CredentialError {
    pub fn store(err: anyhow::Error) -> Self {
        CredentialError::Store(format!("{err:#}"))
    }
}
