//! Per-session contact workflow as a pure state machine.
//!
//! [`WorkflowSession`] never performs I/O. Commands and job results go in;
//! events for the client and [`Job`]s for the actor to run come out. Every job
//! carries a tag and a result is applied only if its tag is still the one the
//! session is waiting for, so late results from an abandoned search,
//! selection or generation are dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::integrations::{CanonicalField, Contact, GatewayError, UpdateOutcome};
use crate::suggestions::{Suggestion, SuggestionController, SuggestionError};

/// Minimum query length before a search is issued.
pub const MIN_QUERY_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Search,
    Searching,
    Selected,
    Generating,
    SuggestionsReady,
    Error,
    Applying,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::Search => "search",
            WorkflowStep::Searching => "searching",
            WorkflowStep::Selected => "selected",
            WorkflowStep::Generating => "generating",
            WorkflowStep::SuggestionsReady => "suggestions_ready",
            WorkflowStep::Error => "error",
            WorkflowStep::Applying => "applying",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SessionCommand {
    Search {
        query: String,
    },
    Select {
        contact_id: String,
    },
    Generate,
    Retry,
    Toggle {
        field: CanonicalField,
        checked: bool,
        #[serde(default)]
        edited_value: Option<String>,
    },
    Submit {
        /// Overrides the per-suggestion `apply` flags when present.
        #[serde(default)]
        selected: Option<BTreeMap<CanonicalField, bool>>,
    },
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ResultsReady {
        query: String,
        contacts: Vec<Contact>,
    },
    SuggestionsReady {
        contact: Contact,
        suggestions: Vec<Suggestion>,
    },
    Error {
        message: String,
        retry_after: Option<u64>,
    },
    Applied {
        count: usize,
        contact: Contact,
    },
    Closed,
}

/// Short, user-facing failure with an optional wait hint in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct SessionError {
    pub message: String,
    pub retry_after: Option<u64>,
}

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<GatewayError> for SessionError {
    fn from(err: GatewayError) -> Self {
        Self {
            message: err.user_message(),
            retry_after: err.retry_after(),
        }
    }
}

impl From<SuggestionError> for SessionError {
    fn from(err: SuggestionError) -> Self {
        Self {
            message: err.to_string(),
            retry_after: err.retry_after(),
        }
    }
}

/// Work for the actor to run off the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Search {
        tag: u64,
        query: String,
    },
    LoadContact {
        tag: u64,
        contact_id: String,
    },
    Generate {
        tag: u64,
    },
    Apply {
        tag: u64,
        contact_id: String,
        suggestions: Vec<Suggestion>,
    },
}

#[derive(Debug, Clone)]
pub enum JobResult {
    Searched {
        tag: u64,
        result: Result<Vec<Contact>, SessionError>,
    },
    ContactLoaded {
        tag: u64,
        result: Result<Contact, SessionError>,
    },
    Generated {
        tag: u64,
        result: Result<Vec<Suggestion>, SessionError>,
    },
    Applied {
        tag: u64,
        result: Result<Option<UpdateOutcome>, SessionError>,
    },
}

/// What a command or result produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    pub events: Vec<SessionEvent>,
    pub jobs: Vec<Job>,
}

impl Transition {
    fn event(event: SessionEvent) -> Self {
        Self {
            events: vec![event],
            jobs: Vec::new(),
        }
    }

    fn job(job: Job) -> Self {
        Self {
            events: Vec::new(),
            jobs: vec![job],
        }
    }
}

/// Client-visible view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub step: WorkflowStep,
    pub query: String,
    pub results: Vec<Contact>,
    pub contact: Option<Contact>,
    pub suggestions: Vec<Suggestion>,
    pub error: Option<SessionError>,
    pub closed: bool,
}

#[derive(Debug)]
pub struct WorkflowSession {
    step: WorkflowStep,
    query: String,
    results: Vec<Contact>,
    selected_id: Option<String>,
    contact: Option<Contact>,
    suggestions: Vec<Suggestion>,
    error: Option<SessionError>,
    next_tag: u64,
    pending_search: Option<u64>,
    /// The one outstanding load, generate or apply request.
    pending_work: Option<u64>,
    closed: bool,
}

impl Default for WorkflowSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowSession {
    pub fn new() -> Self {
        Self {
            step: WorkflowStep::Search,
            query: String::new(),
            results: Vec::new(),
            selected_id: None,
            contact: None,
            suggestions: Vec::new(),
            error: None,
            next_tag: 0,
            pending_search: None,
            pending_work: None,
            closed: false,
        }
    }

    pub fn step(&self) -> WorkflowStep {
        self.step
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn contact(&self) -> Option<&Contact> {
        self.contact.as_ref()
    }

    pub fn suggestions(&self) -> &[Suggestion] {
        &self.suggestions
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            step: self.step,
            query: self.query.clone(),
            results: self.results.clone(),
            contact: self.contact.clone(),
            suggestions: self.suggestions.clone(),
            error: self.error.clone(),
            closed: self.closed,
        }
    }

    fn bump_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    pub fn handle(&mut self, command: SessionCommand) -> Transition {
        if self.closed {
            debug!("Ignoring {:?} on closed session", command);
            return Transition::default();
        }

        match command {
            SessionCommand::Search { query } => self.search(query),
            SessionCommand::Select { contact_id } => self.select(contact_id),
            SessionCommand::Generate => self.generate(),
            SessionCommand::Retry => self.retry(),
            SessionCommand::Toggle {
                field,
                checked,
                edited_value,
            } => self.toggle(field, checked, edited_value),
            SessionCommand::Submit { selected } => self.submit(selected),
            SessionCommand::Clear => self.clear(),
        }
    }

    fn search(&mut self, query: String) -> Transition {
        if !matches!(self.step, WorkflowStep::Search | WorkflowStep::Searching) {
            debug!("Ignoring search while {}", self.step.as_str());
            return Transition::default();
        }

        self.query = query.trim().to_string();
        if self.query.chars().count() < MIN_QUERY_CHARS {
            self.pending_search = None;
            self.results.clear();
            self.step = WorkflowStep::Search;
            return Transition::default();
        }

        let tag = self.bump_tag();
        self.pending_search = Some(tag);
        self.step = WorkflowStep::Searching;
        Transition::job(Job::Search {
            tag,
            query: self.query.clone(),
        })
    }

    /// Start over on a contact: drop old suggestions and re-fetch it.
    fn select(&mut self, contact_id: String) -> Transition {
        if self.step == WorkflowStep::Applying {
            debug!("Ignoring select while an update is being applied");
            return Transition::default();
        }

        let tag = self.bump_tag();
        self.pending_search = None;
        self.pending_work = Some(tag);
        self.selected_id = Some(contact_id.clone());
        self.contact = None;
        self.suggestions.clear();
        self.error = None;
        self.step = WorkflowStep::Selected;
        Transition::job(Job::LoadContact { tag, contact_id })
    }

    fn generate(&mut self) -> Transition {
        if self.pending_work.is_some() {
            debug!("Ignoring generate: a request is already in flight");
            return Transition::default();
        }
        if !matches!(
            self.step,
            WorkflowStep::Selected | WorkflowStep::SuggestionsReady | WorkflowStep::Error
        ) {
            return Transition::default();
        }

        // The contact never loaded: fetch it again first.
        if self.contact.is_none() {
            return match self.selected_id.clone() {
                Some(id) => self.select(id),
                None => Transition::default(),
            };
        }

        let tag = self.bump_tag();
        self.pending_work = Some(tag);
        self.suggestions.clear();
        self.error = None;
        self.step = WorkflowStep::Generating;
        Transition::job(Job::Generate { tag })
    }

    fn retry(&mut self) -> Transition {
        if self.step != WorkflowStep::Error {
            return Transition::default();
        }
        self.generate()
    }

    fn toggle(&mut self, field: CanonicalField, checked: bool, edited_value: Option<String>) -> Transition {
        if !self.can_review() {
            return Transition::default();
        }
        if let Some(suggestion) = self.suggestions.iter_mut().find(|s| s.field == field) {
            suggestion.apply = checked;
            if let Some(value) = edited_value {
                suggestion.proposed_value = value;
            }
        }
        Transition::default()
    }

    fn submit(&mut self, selected: Option<BTreeMap<CanonicalField, bool>>) -> Transition {
        if !self.can_review() || self.pending_work.is_some() {
            return Transition::default();
        }
        let Some(contact_id) = self.contact.as_ref().map(|c| c.id.clone()) else {
            return Transition::default();
        };

        if let Some(selected) = selected {
            for suggestion in &mut self.suggestions {
                suggestion.apply = selected.get(&suggestion.field).copied().unwrap_or(false);
            }
        }

        let chosen: Vec<Suggestion> = self.suggestions.iter().filter(|s| s.apply).cloned().collect();
        if chosen.is_empty() {
            return Transition::event(SessionEvent::Error {
                message: "Select at least one field to update.".to_string(),
                retry_after: None,
            });
        }

        let tag = self.bump_tag();
        self.pending_work = Some(tag);
        self.error = None;
        self.step = WorkflowStep::Applying;
        Transition::job(Job::Apply {
            tag,
            contact_id,
            suggestions: chosen,
        })
    }

    /// Suggestions are on screen and editable: ready, or back from a failed apply.
    fn can_review(&self) -> bool {
        match self.step {
            WorkflowStep::SuggestionsReady => true,
            WorkflowStep::Error => self.contact.is_some() && !self.suggestions.is_empty(),
            _ => false,
        }
    }

    fn clear(&mut self) -> Transition {
        let next_tag = self.next_tag;
        *self = Self::new();
        self.next_tag = next_tag;
        Transition::default()
    }

    /// Close the session; results still in flight will be dropped.
    pub fn close(&mut self) -> Transition {
        if self.closed {
            return Transition::default();
        }
        self.closed = true;
        self.pending_search = None;
        self.pending_work = None;
        Transition::event(SessionEvent::Closed)
    }

    pub fn on_result(&mut self, result: JobResult) -> Transition {
        if self.closed {
            return Transition::default();
        }

        match result {
            JobResult::Searched { tag, result } => {
                if self.pending_search != Some(tag) {
                    debug!("Discarding stale search result (tag {})", tag);
                    return Transition::default();
                }
                self.pending_search = None;
                self.step = WorkflowStep::Search;
                match result {
                    Ok(contacts) => {
                        self.results = contacts.clone();
                        Transition::event(SessionEvent::ResultsReady {
                            query: self.query.clone(),
                            contacts,
                        })
                    }
                    Err(err) => {
                        self.results.clear();
                        self.error_event(err)
                    }
                }
            }
            JobResult::ContactLoaded { tag, result } => {
                if !self.take_pending(tag) {
                    return Transition::default();
                }
                match result {
                    Ok(contact) => {
                        self.contact = Some(contact);
                        self.pending_work = Some(tag);
                        self.step = WorkflowStep::Generating;
                        Transition::job(Job::Generate { tag })
                    }
                    Err(err) => self.fail(err),
                }
            }
            JobResult::Generated { tag, result } => {
                if !self.take_pending(tag) {
                    return Transition::default();
                }
                let Some(contact) = self.contact.clone() else {
                    return self.fail(SessionError::new("The selected contact is no longer loaded."));
                };
                match result {
                    Ok(suggestions) => {
                        self.suggestions = SuggestionController::merge_with_contact(suggestions, &contact);
                        self.step = WorkflowStep::SuggestionsReady;
                        Transition::event(SessionEvent::SuggestionsReady {
                            contact,
                            suggestions: self.suggestions.clone(),
                        })
                    }
                    Err(err) => self.fail(err),
                }
            }
            JobResult::Applied { tag, result } => {
                if !self.take_pending(tag) {
                    return Transition::default();
                }
                match result {
                    Ok(outcome) => {
                        let (count, contact) = match outcome {
                            Some(outcome) => (outcome.changed.len(), outcome.contact),
                            None => match self.contact.clone() {
                                Some(contact) => (0, contact),
                                None => return self.close(),
                            },
                        };
                        let mut transition = Transition::event(SessionEvent::Applied { count, contact });
                        transition.events.extend(self.close().events);
                        transition
                    }
                    Err(err) => self.fail(err),
                }
            }
        }
    }

    fn take_pending(&mut self, tag: u64) -> bool {
        if self.pending_work != Some(tag) {
            debug!("Discarding stale result (tag {})", tag);
            return false;
        }
        self.pending_work = None;
        true
    }

    /// Enter the error step, keeping contact and suggestions for a retry.
    fn fail(&mut self, err: SessionError) -> Transition {
        self.step = WorkflowStep::Error;
        self.error_event(err)
    }

    fn error_event(&mut self, err: SessionError) -> Transition {
        self.error = Some(err.clone());
        Transition::event(SessionEvent::Error {
            message: err.message,
            retry_after: err.retry_after,
        })
    }
}
