use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::SuggestionError;

/// One speaker turn from a meeting transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub speaker: String,
    /// Offset from the start of the meeting.
    pub start_seconds: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Render as prompt text: a participants line followed by one
    /// `[MM:SS] Speaker: text` line per non-empty segment.
    pub fn render(&self) -> Result<String, SuggestionError> {
        let lines: Vec<String> = self
            .segments
            .iter()
            .filter(|segment| !segment.text.trim().is_empty())
            .map(|segment| {
                format!(
                    "[{}] {}: {}",
                    format_timestamp(segment.start_seconds),
                    speaker_name(&segment.speaker),
                    segment.text.trim()
                )
            })
            .collect();
        if lines.is_empty() {
            return Err(SuggestionError::MissingTranscript);
        }

        let participants = self.participant_names();
        if participants.is_empty() {
            return Err(SuggestionError::MissingTranscript);
        }

        let mut out = String::new();
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            out.push_str(&format!("Meeting: {}\n", title.trim()));
        }
        out.push_str(&format!("Participants: {}\n\n", participants.join(", ")));
        out.push_str(&lines.join("\n"));
        Ok(out)
    }

    /// Declared participants, or the distinct named speakers when none were declared.
    fn participant_names(&self) -> Vec<String> {
        let declared: Vec<String> = self
            .participants
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if !declared.is_empty() {
            return declared;
        }

        let speakers: BTreeSet<&str> = self
            .segments
            .iter()
            .map(|s| s.speaker.trim())
            .filter(|s| !s.is_empty())
            .collect();
        speakers.into_iter().map(str::to_string).collect()
    }
}

fn speaker_name(speaker: &str) -> &str {
    let speaker = speaker.trim();
    if speaker.is_empty() {
        "Unknown"
    } else {
        speaker
    }
}

/// `MM:SS`, with minutes running past 59 for long meetings.
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{:02}:{:02}", total / 60, total % 60)
}
