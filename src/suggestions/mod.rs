//! Contact update suggestions and contact questions answered from meeting
//! transcripts by a generative text service.

pub mod gemini;
pub mod parser;
pub mod prompts;
pub mod transcript;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AiConfig;
use crate::credentials::{Credential, Provider};
use crate::integrations::{CanonicalField, Contact, Gateway, GatewayError, UpdateOutcome};

pub use gemini::GeminiClient;
pub use parser::ResponseParser;
pub use transcript::{Transcript, TranscriptSegment};

/// A proposed single-field contact update with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub field: CanonicalField,
    pub proposed_value: String,
    /// The contact's value when the suggestion was merged, if any.
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(default)]
    pub source_quote: Option<String>,
    #[serde(default)]
    pub source_timestamp: Option<String>,
    #[serde(default)]
    pub apply: bool,
}

/// Where an assistant answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    Meeting,
    HubSpot,
    Salesforce,
}

impl AnswerSource {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "meeting" => Some(AnswerSource::Meeting),
            "hubspot" => Some(AnswerSource::HubSpot),
            "salesforce" => Some(AnswerSource::Salesforce),
            _ => None,
        }
    }
}

impl From<Provider> for AnswerSource {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::HubSpot => AnswerSource::HubSpot,
            Provider::Salesforce => AnswerSource::Salesforce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactAnswer {
    pub answer: String,
    pub sources: Vec<AnswerSource>,
}

/// A CRM contact handed to the assistant as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub provider: Provider,
    pub contact: Contact,
}

/// Failure reported by a [`GenerativeClient`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited {
        retry_after_secs: Option<u64>,
        body: String,
    },
    #[error("generative service error (status {status:?}): {body}")]
    Service { status: Option<u16>, body: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SuggestionError {
    #[error("the meeting has no transcript or participants yet")]
    MissingTranscript,
    #[error("the AI service is busy, try again in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },
    #[error("the AI service failed: {0}")]
    Service(String),
}

impl SuggestionError {
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SuggestionError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// One free-text prompt in, unstructured text out.
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// How long to wait before the single automatic retry after a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_wait: Duration,
    pub default_delay: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            default_delay: Duration::from_secs(30),
        }
    }
}

impl RateLimitPolicy {
    pub fn from_config(config: &AiConfig) -> Self {
        Self {
            max_wait: Duration::from_secs(config.max_retry_wait_seconds),
            default_delay: Duration::from_secs(config.default_retry_seconds),
        }
    }

    pub fn delay_for(&self, hint_secs: Option<u64>) -> Duration {
        hint_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_delay)
            .min(self.max_wait)
    }
}

pub struct SuggestionController {
    client: Arc<dyn GenerativeClient>,
    policy: RateLimitPolicy,
    parser: ResponseParser,
}

impl SuggestionController {
    pub fn new(client: Arc<dyn GenerativeClient>, policy: RateLimitPolicy) -> Result<Self> {
        Ok(Self {
            client,
            policy,
            parser: ResponseParser::new()?,
        })
    }

    /// Extract field suggestions for `provider` from a transcript. Output that
    /// cannot be decoded yields an empty list.
    pub async fn generate(&self, transcript: &Transcript, provider: Provider) -> Result<Vec<Suggestion>, SuggestionError> {
        let rendered = transcript.render()?;
        let prompt = prompts::suggestion_prompt(provider, &rendered);

        let raw = self.complete_with_retry(&prompt).await?;
        let suggestions: Vec<Suggestion> = self
            .parser
            .parse_suggestions(&raw)
            .into_iter()
            .filter(|s| s.field.wire_name(provider).is_some())
            .collect();

        info!("Generated {} suggestions for {}", suggestions.len(), provider);
        Ok(suggestions)
    }

    /// Attach the contact's current values and select every suggestion for
    /// display. Suggestions equal to the current value are kept.
    pub fn merge_with_contact(suggestions: Vec<Suggestion>, contact: &Contact) -> Vec<Suggestion> {
        suggestions
            .into_iter()
            .map(|s| Suggestion {
                current_value: contact.field(s.field).map(str::to_string),
                apply: true,
                ..s
            })
            .collect()
    }

    pub async fn answer_contact_question(
        &self,
        question: &str,
        transcript: &Transcript,
        snapshots: &[ContactSnapshot],
    ) -> Result<ContactAnswer, SuggestionError> {
        let rendered = transcript.render()?;
        let prompt = prompts::question_prompt(question, &rendered, snapshots);

        let raw = self.complete_with_retry(&prompt).await?;
        Ok(self.parser.parse_answer(&raw))
    }

    /// Push the suggestions marked `apply` to the CRM. Returns `Ok(None)`
    /// without any request when none are marked.
    pub async fn apply_updates(
        &self,
        gateway: &Gateway,
        credential: Credential,
        contact_id: &str,
        suggestions: &[Suggestion],
    ) -> Result<Option<UpdateOutcome>, GatewayError> {
        let diff: BTreeMap<CanonicalField, String> = suggestions
            .iter()
            .filter(|s| s.apply)
            .map(|s| (s.field, s.proposed_value.clone()))
            .collect();
        if diff.is_empty() {
            debug!("No suggestions selected for contact {}, nothing to apply", contact_id);
            return Ok(None);
        }

        gateway.update(credential, contact_id, &diff).await.map(Some)
    }

    /// One call, plus exactly one retry after a rate limit.
    async fn complete_with_retry(&self, prompt: &str) -> Result<String, SuggestionError> {
        match self.client.complete(prompt).await {
            Ok(text) => Ok(text),
            Err(GenerationError::RateLimited { retry_after_secs, .. }) => {
                let delay = self.policy.delay_for(retry_after_secs);
                warn!("Generation rate limited, retrying once in {:?}", delay);
                tokio::time::sleep(delay).await;

                match self.client.complete(prompt).await {
                    Ok(text) => Ok(text),
                    Err(GenerationError::RateLimited { retry_after_secs, .. }) => {
                        Err(SuggestionError::RateLimited {
                            retry_after_secs: retry_after_secs
                                .unwrap_or(self.policy.default_delay.as_secs()),
                        })
                    }
                    Err(GenerationError::Service { status, body }) => {
                        Err(service_error(status, body))
                    }
                }
            }
            Err(GenerationError::Service { status, body }) => Err(service_error(status, body)),
        }
    }
}

fn service_error(status: Option<u16>, body: String) -> SuggestionError {
    warn!("Generation failed (status {:?}): {}", status, body);
    match status {
        Some(status) => SuggestionError::Service(format!("status {status}")),
        None => SuggestionError::Service(body),
    }
}
