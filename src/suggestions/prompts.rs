//! Prompt text sent to the generative service.

use crate::credentials::Provider;
use crate::integrations::CanonicalField;

use super::ContactSnapshot;

/// Prompt asking for contact field updates mentioned in a meeting.
pub fn suggestion_prompt(provider: Provider, transcript: &str) -> String {
    let fields = CanonicalField::supported_by(provider)
        .into_iter()
        .map(|field| format!("- {} ({})", field.as_str(), field.label()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You help keep {crm} contact records up to date.

Read the meeting transcript below and find statements where a participant gives new or
changed contact details about themselves or the contact being discussed.

Only use these field names:
{fields}

Respond with a JSON array and nothing else. Each element must look like:
{{"field": "<field name>", "value": "<new value>", "context": "<exact quote from the transcript>", "timestamp": "<MM:SS of the quote>"}}

Rules:
- Only include values that are explicitly stated in the transcript.
- Use at most one entry per field.
- If nothing applies, respond with [].

Transcript:
{transcript}
"#,
        crm = provider.display_name(),
    )
}

/// Prompt answering a free-text question about a meeting and the contacts it mentions.
pub fn question_prompt(question: &str, transcript: &str, snapshots: &[ContactSnapshot]) -> String {
    let mut contacts = String::new();
    if snapshots.is_empty() {
        contacts.push_str("(no CRM contacts referenced)\n");
    }
    for snapshot in snapshots {
        contacts.push_str(&format!(
            "### {} contact: {}\n",
            snapshot.provider.display_name(),
            snapshot.contact.display_name
        ));
        for (field, value) in &snapshot.contact.fields {
            contacts.push_str(&format!("- {}: {}\n", field.label(), value));
        }
        contacts.push('\n');
    }

    format!(
        r#"Answer the user's question using the meeting transcript and CRM contact records below.

Respond with a JSON object and nothing else:
{{"answer": "<concise answer>", "sources": ["meeting" | "hubspot" | "salesforce", ...]}}

List in "sources" only where the answer came from. If the information is not available, say so
in "answer".

Question: {question}

CRM contacts:
{contacts}
Transcript:
{transcript}
"#
    )
}
