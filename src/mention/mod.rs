//! Splits assistant text into literal runs and references to known contacts.
//!
//! A candidate matches by its full name or, when different, by its first
//! name alone. Longer variants are tried first so "John Doe" wins over a
//! "John" belonging to someone else. Matching ignores case but literal text
//! keeps the original casing.

use serde::{Deserialize, Serialize};

/// Character that starts a mention while typing.
pub const SIGIL: char = '@';

/// Minimum characters after the sigil before a search is worth running.
pub const MIN_TRIGGER_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Only `@Name` counts; the sigil is consumed.
    Tagged,
    /// Bare names count, for model output that names contacts without a sigil.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionCandidate {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Span {
    Literal { text: String },
    Entity {
        id: String,
        /// Candidate's full name.
        name: String,
        /// Text as written, without the sigil.
        matched: String,
    },
}

impl Span {
    pub fn literal(text: impl Into<String>) -> Self {
        Span::Literal { text: text.into() }
    }
}

struct Variant<'a> {
    chars: Vec<char>,
    candidate: &'a MentionCandidate,
}

fn variants(candidates: &[MentionCandidate]) -> Vec<Variant<'_>> {
    let mut out = Vec::new();
    for candidate in candidates {
        let full = candidate.name.trim();
        if full.is_empty() {
            continue;
        }
        out.push(Variant {
            chars: full.chars().collect(),
            candidate,
        });
        if let Some(first) = full.split_whitespace().next() {
            if first.to_lowercase() != full.to_lowercase() {
                out.push(Variant {
                    chars: first.chars().collect(),
                    candidate,
                });
            }
        }
    }
    // Stable: equal lengths keep candidate order.
    out.sort_by(|a, b| b.chars.len().cmp(&a.chars.len()));
    out
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn chars_eq(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Length of the longest variant matching at `start` and ending on a word boundary.
fn match_at<'a>(text: &[char], start: usize, variants: &'a [Variant<'a>]) -> Option<(usize, &'a MentionCandidate)> {
    variants.iter().find_map(|variant| {
        let end = start + variant.chars.len();
        if end > text.len() {
            return None;
        }
        let same = text[start..end]
            .iter()
            .zip(&variant.chars)
            .all(|(a, b)| chars_eq(*a, *b));
        let bounded = end == text.len() || !is_word_char(text[end]);
        (same && bounded).then_some((variant.chars.len(), variant.candidate))
    })
}

/// Segment `text` into literal and entity spans. Adjacent literal text is
/// always merged into one span.
pub fn segment(text: &str, candidates: &[MentionCandidate], mode: MatchMode) -> Vec<Span> {
    let chars: Vec<char> = text.chars().collect();
    let variants = variants(candidates);
    let mut spans = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let found = match mode {
            MatchMode::Tagged if chars[i] == SIGIL => {
                match_at(&chars, i + 1, &variants).map(|(len, c)| (i + 1, len, c))
            }
            MatchMode::Plain if i == 0 || !is_word_char(chars[i - 1]) => {
                match_at(&chars, i, &variants).map(|(len, c)| (i, len, c))
            }
            _ => None,
        };

        match found {
            Some((name_start, len, candidate)) => {
                if !literal.is_empty() {
                    spans.push(Span::literal(std::mem::take(&mut literal)));
                }
                spans.push(Span::Entity {
                    id: candidate.id.clone(),
                    name: candidate.name.trim().to_string(),
                    matched: chars[name_start..name_start + len].iter().collect(),
                });
                i = name_start + len;
            }
            None => {
                literal.push(chars[i]);
                i += 1;
            }
        }
    }

    if !literal.is_empty() {
        spans.push(Span::literal(literal));
    }
    spans
}

/// The pending query when `text` ends in `@` plus at least two word
/// characters, with the sigil at the start or after whitespace.
pub fn detect_trigger(text: &str) -> Option<String> {
    let sigil_at = text.rfind(SIGIL)?;
    let before = text[..sigil_at].chars().next_back();
    if before.is_some_and(|c| !c.is_whitespace()) {
        return None;
    }

    let query = &text[sigil_at + SIGIL.len_utf8()..];
    let count = query.chars().count();
    if count >= MIN_TRIGGER_CHARS && query.chars().all(is_word_char) {
        Some(query.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, name: &str) -> MentionCandidate {
        MentionCandidate {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn entity(id: &str, name: &str, matched: &str) -> Span {
        Span::Entity {
            id: id.to_string(),
            name: name.to_string(),
            matched: matched.to_string(),
        }
    }

    #[test]
    fn test_tagged_full_name() {
        let spans = segment("Hello @John Doe", &[candidate("1", "John Doe")], MatchMode::Tagged);
        assert_eq!(
            spans,
            vec![Span::literal("Hello "), entity("1", "John Doe", "John Doe")]
        );
    }

    #[test]
    fn test_plain_first_name_alias() {
        let spans = segment(
            "John mentioned the cost",
            &[candidate("1", "John Doe")],
            MatchMode::Plain,
        );
        assert_eq!(
            spans,
            vec![entity("1", "John Doe", "John"), Span::literal(" mentioned the cost")]
        );
    }

    #[test]
    fn test_tagged_requires_sigil() {
        let spans = segment("John and @john", &[candidate("1", "John Doe")], MatchMode::Tagged);
        assert_eq!(
            spans,
            vec![Span::literal("John and "), entity("1", "John Doe", "john")]
        );
    }

    #[test]
    fn test_full_name_beats_other_first_name() {
        let candidates = [candidate("1", "John"), candidate("2", "John Smith")];
        let spans = segment("ask @John Smith and @John", &candidates, MatchMode::Tagged);
        assert_eq!(
            spans,
            vec![
                Span::literal("ask "),
                entity("2", "John Smith", "John Smith"),
                Span::literal(" and "),
                entity("1", "John", "John"),
            ]
        );
    }

    #[test]
    fn test_case_insensitive_keeps_original_casing() {
        let spans = segment("ping @JANE doe today", &[candidate("7", "Jane Doe")], MatchMode::Tagged);
        assert_eq!(
            spans,
            vec![
                Span::literal("ping "),
                entity("7", "Jane Doe", "JANE doe"),
                Span::literal(" today"),
            ]
        );
    }

    #[test]
    fn test_plain_respects_word_boundaries() {
        let spans = segment("Johnson met Ann.", &[candidate("1", "John Doe"), candidate("2", "Ann")], MatchMode::Plain);
        assert_eq!(
            spans,
            vec![Span::literal("Johnson met "), entity("2", "Ann", "Ann"), Span::literal(".")]
        );
    }

    #[test]
    fn test_unmatched_sigil_stays_literal() {
        let spans = segment("email me @ noon @Bob", &[candidate("1", "Ann")], MatchMode::Tagged);
        assert_eq!(spans, vec![Span::literal("email me @ noon @Bob")]);
        assert!(segment("", &[], MatchMode::Plain).is_empty());
    }

    #[test]
    fn test_detect_trigger() {
        assert_eq!(detect_trigger("talk to @jo"), Some("jo".to_string()));
        assert_eq!(detect_trigger("@Ann"), Some("Ann".to_string()));
        assert_eq!(detect_trigger("talk to @j"), None);
        assert_eq!(detect_trigger("talk to @"), None);
        assert_eq!(detect_trigger("mail ann@example"), None);
        assert_eq!(detect_trigger("@jo and more"), None);
        assert_eq!(detect_trigger("no sigil"), None);
    }

    #[test]
    fn test_span_serializes_with_kind() {
        let json = serde_json::to_value(Span::literal("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "literal", "text": "hi"}));
    }
}
