use std::fmt;

use crate::credentials::{CredentialError, Provider};

/// How a failed CRM call is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Auth,
    RateLimited,
    Server,
    Transport,
    /// Any other 4xx the provider sent back.
    Rejected,
    /// An outgoing value the provider would not accept.
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Auth => "auth_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server_error",
            ErrorKind::Transport => "transport_error",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Validation => "validation_error",
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Auth,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Rejected,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to a CRM API. Status and raw body are kept for logging and
/// for retry-delay extraction by callers.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider} {kind} (status {status:?}): {body}")]
pub struct ProviderError {
    pub provider: Provider,
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub body: String,
    /// Seconds from a `Retry-After` header, when the provider sent one.
    pub retry_after: Option<u64>,
}

impl ProviderError {
    pub fn new(provider: Provider, kind: ErrorKind, status: Option<u16>, body: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// Classify a non-success HTTP response by status code alone.
    pub fn from_status(provider: Provider, status: u16, body: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::from_status(status), Some(status), body)
    }

    pub fn transport(provider: Provider, err: &reqwest::Error) -> Self {
        Self::new(provider, ErrorKind::Transport, err.status().map(|s| s.as_u16()), err.to_string())
    }

    /// A response that arrived but could not be decoded.
    pub fn decode(provider: Provider, status: u16, err: impl fmt::Display) -> Self {
        Self::new(
            provider,
            ErrorKind::Server,
            Some(status),
            format!("unexpected response body: {err}"),
        )
    }

    pub fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind == ErrorKind::Auth
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Errors surfaced by [`super::Gateway`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("no adapter configured for {0}")]
    Unsupported(Provider),
}

impl GatewayError {
    /// Short message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Provider(err) => {
                let name = err.provider.display_name();
                match err.kind {
                    ErrorKind::NotFound => format!("That contact no longer exists in {name}."),
                    ErrorKind::Auth => {
                        format!("{name} rejected the connection. Please reconnect your account.")
                    }
                    ErrorKind::RateLimited => {
                        format!("{name} is rate limiting requests. Please try again shortly.")
                    }
                    ErrorKind::Server => format!("{name} is having trouble right now. Please try again."),
                    ErrorKind::Transport => format!("Could not reach {name}. Check your connection."),
                    ErrorKind::Rejected | ErrorKind::Validation => {
                        format!("{name} rejected the request.")
                    }
                }
            }
            GatewayError::Credential(CredentialError::NotFound { provider, .. })
            | GatewayError::Credential(CredentialError::MissingRefreshToken { provider, .. })
            | GatewayError::Credential(CredentialError::RefreshFailed { provider, .. }) => format!(
                "Your {} connection has expired. Please reconnect your account.",
                provider.display_name()
            ),
            GatewayError::Credential(_) => "Could not load your CRM connection.".to_string(),
            GatewayError::Unsupported(provider) => {
                format!("{} is not configured.", provider.display_name())
            }
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::Provider(err) if err.kind == ErrorKind::RateLimited => err.retry_after,
            _ => None,
        }
    }
}
