//! Uniform contact operations against the supported CRMs.
//!
//! Each provider gets one [`CrmAdapter`]. The [`Gateway`] picks the adapter
//! for a credential, makes sure the credential is valid, and routes every call
//! through [`CredentialManager::with_retry`] so an expired token is refreshed
//! and the call retried once.

pub mod error;
pub mod fields;
pub mod hubspot;
pub mod salesforce;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProviderSettings};
use crate::credentials::{Credential, CredentialManager, Provider, TokenRefresher, TokenSet};

pub use error::{ErrorKind, GatewayError, ProviderError};
pub use fields::{CanonicalField, Contact, WireDiff};
pub use hubspot::HubSpotAdapter;
pub use salesforce::SalesforceAdapter;

/// Upper bound on contacts returned by a search.
pub const MAX_SEARCH_RESULTS: usize = 10;

/// Provider-specific contact API. Implementations speak wire field names only
/// at their own boundary and hand back canonical [`Contact`]s.
#[async_trait]
pub trait CrmAdapter: TokenRefresher {
    async fn search(&self, credential: &Credential, query: &str) -> Result<Vec<Contact>, ProviderError>;

    async fn get(&self, credential: &Credential, id: &str) -> Result<Contact, ProviderError>;

    /// Apply already-translated wire properties and return the refreshed contact.
    async fn update(
        &self,
        credential: &Credential,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Contact, ProviderError>;
}

/// An adapter plus its view as a token refresher for the credential manager.
pub struct AdapterHandle {
    pub adapter: Arc<dyn CrmAdapter>,
    pub refresher: Arc<dyn TokenRefresher>,
}

/// Build the adapter for `provider` from its configuration section.
pub fn build_adapter(provider: Provider, config: &Config) -> Result<AdapterHandle> {
    match provider {
        Provider::HubSpot => {
            let adapter = Arc::new(HubSpotAdapter::new(config.hubspot.clone())?);
            Ok(AdapterHandle {
                adapter: adapter.clone(),
                refresher: adapter,
            })
        }
        Provider::Salesforce => {
            let adapter = Arc::new(SalesforceAdapter::new(config.salesforce.clone())?);
            Ok(AdapterHandle {
                adapter: adapter.clone(),
                refresher: adapter,
            })
        }
    }
}

/// Result of pushing a field diff to a CRM.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub contact: Contact,
    /// Canonical fields that were sent.
    pub changed: Vec<CanonicalField>,
    /// Canonical fields left out of the request (see [`fields::translate_diff`]).
    pub dropped: Vec<CanonicalField>,
}

pub struct Gateway {
    credentials: Arc<CredentialManager>,
    adapters: HashMap<Provider, Arc<dyn CrmAdapter>>,
}

impl Gateway {
    pub fn new(credentials: Arc<CredentialManager>) -> Self {
        Self {
            credentials,
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn CrmAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn supports(&self, provider: Provider) -> bool {
        self.adapters.contains_key(&provider)
    }

    pub async fn load_credential(&self, user_id: &str, provider: Provider) -> Result<Credential, GatewayError> {
        Ok(self.credentials.load(user_id, provider).await?)
    }

    /// Search contacts; results keep the provider's ranking, capped at
    /// [`MAX_SEARCH_RESULTS`].
    pub async fn search(&self, credential: Credential, query: &str) -> Result<Vec<Contact>, GatewayError> {
        let (adapter, credential) = self.prepare(credential).await?;
        let context = CallContext::new("search", &credential);

        let query = query.to_string();
        let result = self
            .credentials
            .with_retry(credential, |c| {
                let adapter = adapter.clone();
                let query = query.clone();
                async move { adapter.search(&c, &query).await }
            })
            .await;

        let mut contacts = context.finish(result)?;
        contacts.truncate(MAX_SEARCH_RESULTS);
        debug!("{} search returned {} contacts", context.provider, contacts.len());
        Ok(contacts)
    }

    pub async fn get(&self, credential: Credential, id: &str) -> Result<Contact, GatewayError> {
        let (adapter, credential) = self.prepare(credential).await?;
        let context = CallContext::new("get", &credential);

        let id = id.to_string();
        let result = self
            .credentials
            .with_retry(credential, |c| {
                let adapter = adapter.clone();
                let id = id.clone();
                async move { adapter.get(&c, &id).await }
            })
            .await;

        context.finish(result)
    }

    /// Push a canonical diff. Fields the provider cannot take are dropped
    /// before the request; if nothing is left the contact is just re-read.
    pub async fn update(
        &self,
        credential: Credential,
        id: &str,
        diff: &BTreeMap<CanonicalField, String>,
    ) -> Result<UpdateOutcome, GatewayError> {
        let wire = fields::translate_diff(credential.provider, diff);
        if !wire.dropped.is_empty() {
            warn!(
                "{} update for contact {} dropped fields: {:?}",
                credential.provider, id, wire.dropped
            );
        }

        if wire.is_empty() {
            let contact = self.get(credential, id).await?;
            return Ok(UpdateOutcome {
                contact,
                changed: Vec::new(),
                dropped: wire.dropped,
            });
        }

        let (adapter, credential) = self.prepare(credential).await?;
        let context = CallContext::new("update", &credential);

        let id = id.to_string();
        let properties = wire.properties;
        let result = self
            .credentials
            .with_retry(credential, |c| {
                let adapter = adapter.clone();
                let id = id.clone();
                let properties = properties.clone();
                async move { adapter.update(&c, &id, &properties).await }
            })
            .await;

        let contact = context.finish(result)?;
        let changed: Vec<CanonicalField> = diff
            .keys()
            .filter(|field| !wire.dropped.contains(field))
            .copied()
            .collect();
        info!(
            "Updated {} contact {} ({} fields)",
            context.provider,
            contact.id,
            changed.len()
        );

        Ok(UpdateOutcome {
            contact,
            changed,
            dropped: wire.dropped,
        })
    }

    async fn prepare(&self, credential: Credential) -> Result<(Arc<dyn CrmAdapter>, Credential), GatewayError> {
        let adapter = self
            .adapters
            .get(&credential.provider)
            .cloned()
            .ok_or(GatewayError::Unsupported(credential.provider))?;
        let credential = self.credentials.ensure_valid(credential).await?;
        Ok((adapter, credential))
    }
}

/// Identifies one gateway call in failure logs.
struct CallContext {
    operation: &'static str,
    provider: Provider,
    credential_id: i64,
}

impl CallContext {
    fn new(operation: &'static str, credential: &Credential) -> Self {
        Self {
            operation,
            provider: credential.provider,
            credential_id: credential.id,
        }
    }

    fn finish<T>(&self, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        if let Err(err) = &result {
            match err {
                GatewayError::Provider(e) => error!(
                    "{} {} failed for credential {}: {} status={:?} body={}",
                    self.provider, self.operation, self.credential_id, e.kind, e.status, e.body
                ),
                other => error!(
                    "{} {} failed for credential {}: {}",
                    self.provider, self.operation, self.credential_id, other
                ),
            }
        }
        result
    }
}

/// Send a request and return the body of a 2xx response. Anything else is
/// classified by `classify`, which sees the status and raw body.
pub(crate) async fn send_request(
    provider: Provider,
    request: reqwest::RequestBuilder,
    classify: fn(u16, &str) -> ErrorKind,
) -> Result<String, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::transport(provider, &e))?;
    let status = response.status().as_u16();
    let retry_after = error::retry_after_seconds(response.headers());
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::transport(provider, &e))?;

    if (200..300).contains(&status) {
        return Ok(body);
    }

    Err(ProviderError::new(provider, classify(status, &body), Some(status), body).with_retry_after(retry_after))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(provider: Provider, body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::decode(provider, 200, e))
}

/// Record ids are interpolated into URL paths, so only plain ids are allowed.
pub(crate) fn check_record_id(provider: Provider, id: &str) -> Result<(), ProviderError> {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ProviderError::new(
            provider,
            ErrorKind::Validation,
            None,
            format!("invalid record id {id:?}"),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    instance_url: Option<String>,
}

/// OAuth refresh-token grant shared by both providers.
pub(crate) async fn refresh_grant(
    provider: Provider,
    client: &reqwest::Client,
    settings: &ProviderSettings,
    credential: &Credential,
) -> Result<TokenSet, ProviderError> {
    let refresh_token = credential.refresh_token.as_deref().ok_or_else(|| {
        ProviderError::new(provider, ErrorKind::Auth, None, "credential has no refresh token")
    })?;

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("client_id", settings.client_id.as_str()),
        ("refresh_token", refresh_token),
    ];
    if let Some(secret) = settings.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let body = send_request(
        provider,
        client.post(&settings.token_url).form(&form),
        classify_refresh_error,
    )
    .await?;
    let tokens: TokenResponse = decode(provider, &body)?;

    let lifetime = tokens
        .expires_in
        .unwrap_or(settings.session_lifetime_seconds as i64);
    Ok(TokenSet {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_at: Utc::now() + Duration::seconds(lifetime),
        instance_url: tokens.instance_url,
    })
}

/// A revoked or expired refresh token comes back as 400 `invalid_grant`.
fn classify_refresh_error(status: u16, body: &str) -> ErrorKind {
    if (status == 400 || status == 401) && body.to_lowercase().contains("invalid_grant") {
        return ErrorKind::Auth;
    }
    ErrorKind::from_status(status)
}

pub(crate) fn http_client(settings: &ProviderSettings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(settings.timeout()).build()?)
}
