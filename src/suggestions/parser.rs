//! Lenient decoding of generative output.
//!
//! Model output is advisory: anything that does not decode becomes an empty
//! suggestion list or a plain-text answer, never an error.

use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{AnswerSource, ContactAnswer, Suggestion};
use crate::integrations::CanonicalField;

pub struct ResponseParser {
    fence: Regex,
}

impl ResponseParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fence: Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)\s*```")?,
        })
    }

    /// Body of the first fenced block, or the whole text when there is none.
    pub fn strip_fences<'a>(&self, raw: &'a str) -> &'a str {
        match self.fence.captures(raw).and_then(|c| c.get(1)) {
            Some(body) => body.as_str(),
            None => raw.trim(),
        }
    }

    pub fn parse_suggestions(&self, raw: &str) -> Vec<Suggestion> {
        let body = self.strip_fences(raw);
        let entries = match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(entries)) => entries,
            Ok(other) => {
                warn!("Suggestion response was JSON but not an array: {}", type_name(&other));
                return Vec::new();
            }
            Err(e) => {
                warn!("Suggestion response was not valid JSON: {}", e);
                debug!("Raw suggestion response: {}", raw);
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut suggestions = Vec::new();
        for entry in &entries {
            let Some(suggestion) = Self::entry_to_suggestion(entry) else {
                continue;
            };
            if seen.insert(suggestion.field) {
                suggestions.push(suggestion);
            }
        }

        if suggestions.len() < entries.len() {
            debug!(
                "Kept {} of {} suggestion entries",
                suggestions.len(),
                entries.len()
            );
        }
        suggestions
    }

    fn entry_to_suggestion(entry: &Value) -> Option<Suggestion> {
        let field = CanonicalField::parse(entry.get("field")?.as_str()?)?;
        let value = scalar_text(entry.get("value")?)?;
        Some(Suggestion {
            field,
            proposed_value: value,
            current_value: None,
            source_quote: entry.get("context").and_then(scalar_text),
            source_timestamp: entry.get("timestamp").and_then(scalar_text),
            apply: false,
        })
    }

    /// Decode `{answer, sources}`. Unknown sources are dropped and an empty
    /// list becomes `[meeting]`; undecodable output is used as the answer text.
    pub fn parse_answer(&self, raw: &str) -> ContactAnswer {
        let body = self.strip_fences(raw);
        let decoded = serde_json::from_str::<Value>(body).ok();
        let answer = decoded
            .as_ref()
            .and_then(|v| v.get("answer"))
            .and_then(Value::as_str)
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        let Some(answer) = answer else {
            return ContactAnswer {
                answer: raw.trim().to_string(),
                sources: vec![AnswerSource::Meeting],
            };
        };

        let mut sources: Vec<AnswerSource> = Vec::new();
        if let Some(listed) = decoded
            .as_ref()
            .and_then(|v| v.get("sources"))
            .and_then(Value::as_array)
        {
            for source in listed.iter().filter_map(Value::as_str).filter_map(AnswerSource::parse) {
                if !sources.contains(&source) {
                    sources.push(source);
                }
            }
        }
        if sources.is_empty() {
            sources.push(AnswerSource::Meeting);
        }

        ContactAnswer { answer, sources }
    }
}

/// Non-empty text for a string, number or boolean; `None` for null and containers.
fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
