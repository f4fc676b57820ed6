//! Conversational assistant routes.
//!
//! - `POST /assistant/segment` splits draft text into literal and mention
//!   spans and reports a pending `@` search
//! - `POST /assistant/ask` answers a question about the meeting, pulling in
//!   the CRM records of any contacts the question mentions

use axum::{extract::State, response::Json, routing::post, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::credentials::Provider;
use crate::mention::{self, MatchMode, MentionCandidate, Span};
use crate::suggestions::{AnswerSource, ContactSnapshot, Transcript};
use crate::workflow::SessionRegistry;

#[derive(Debug, Deserialize)]
pub struct SegmentRequest {
    pub text: String,
    #[serde(default)]
    pub candidates: Vec<MentionCandidate>,
    #[serde(default = "default_mode")]
    pub mode: MatchMode,
}

fn default_mode() -> MatchMode {
    MatchMode::Tagged
}

#[derive(Debug, Serialize)]
pub struct SegmentResponse {
    pub spans: Vec<Span>,
    /// Query to search with when the text ends in an `@` mention being typed.
    pub trigger: Option<String>,
}

/// A contact the user can mention, and where it lives.
#[derive(Debug, Clone, Deserialize)]
pub struct AskCandidate {
    pub provider: Provider,
    pub id: String,
    pub name: String,
}

impl AskCandidate {
    /// Span ids are `provider:id` so equal ids in two CRMs stay distinct.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }

    fn mention(&self) -> MentionCandidate {
        MentionCandidate {
            id: self.key(),
            name: self.name.clone(),
        }
    }
}

/// Candidates referenced by entity spans, in first-mention order.
fn mentioned_candidates<'a>(spans: &[Span], candidates: &'a [AskCandidate]) -> Vec<&'a AskCandidate> {
    let mut mentioned: Vec<&AskCandidate> = Vec::new();
    for span in spans {
        let Span::Entity { id, .. } = span else {
            continue;
        };
        if let Some(candidate) = candidates.iter().find(|c| &c.key() == id) {
            if !mentioned.iter().any(|m| m.key() == candidate.key()) {
                mentioned.push(candidate);
            }
        }
    }
    mentioned
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub user_id: String,
    pub question: String,
    pub transcript: Transcript,
    #[serde(default)]
    pub candidates: Vec<AskCandidate>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub sources: Vec<AnswerSource>,
    /// The answer split so mentioned contacts can be rendered as links.
    pub spans: Vec<Span>,
    pub question_spans: Vec<Span>,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/segment", post(segment))
        .route("/ask", post(ask))
        .with_state(registry)
}

async fn segment(Json(req): Json<SegmentRequest>) -> Json<SegmentResponse> {
    Json(SegmentResponse {
        spans: mention::segment(&req.text, &req.candidates, req.mode),
        trigger: mention::detect_trigger(&req.text),
    })
}

async fn ask(
    State(registry): State<Arc<SessionRegistry>>,
    Json(req): Json<AskRequest>,
) -> ApiResult<Json<AskResponse>> {
    if req.question.trim().is_empty() {
        return Err(ApiError::bad_request("question is required"));
    }

    let candidates: Vec<MentionCandidate> = req.candidates.iter().map(AskCandidate::mention).collect();
    let question_spans = mention::segment(&req.question, &candidates, MatchMode::Tagged);
    let mentioned = mentioned_candidates(&question_spans, &req.candidates);

    let services = registry.services();
    let mut snapshots = Vec::with_capacity(mentioned.len());
    for candidate in &mentioned {
        let fetched = async {
            let credential = services
                .gateway
                .load_credential(&req.user_id, candidate.provider)
                .await?;
            services.gateway.get(credential, &candidate.id).await
        }
        .await;
        match fetched {
            Ok(contact) => snapshots.push(ContactSnapshot {
                provider: candidate.provider,
                contact,
            }),
            Err(e) => warn!(
                "Could not load mentioned {} contact {}: {}",
                candidate.provider, candidate.id, e
            ),
        }
    }

    info!(
        "Answering question with {} of {} mentioned contacts",
        snapshots.len(),
        mentioned.len()
    );
    let answer = services
        .suggestions
        .answer_contact_question(&req.question, &req.transcript, &snapshots)
        .await?;

    let named: Vec<MentionCandidate> = mentioned.iter().map(|c| c.mention()).collect();
    let spans = mention::segment(&answer.answer, &named, MatchMode::Plain);

    Ok(Json(AskResponse {
        answer: answer.answer,
        sources: answer.sources,
        spans,
        question_spans,
    }))
}
