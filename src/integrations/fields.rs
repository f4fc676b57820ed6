//! Canonical contact field vocabulary and its per-provider wire names.
//!
//! Everything above the gateway speaks [`CanonicalField`]; wire names only
//! appear in the adapters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::credentials::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    #[serde(rename = "firstname")]
    FirstName,
    #[serde(rename = "lastname")]
    LastName,
    Email,
    Phone,
    #[serde(rename = "mobilephone")]
    MobilePhone,
    Company,
    #[serde(rename = "jobtitle")]
    JobTitle,
    Address,
    City,
    State,
    Zip,
    Country,
    Website,
    LinkedinUrl,
    TwitterHandle,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 15] = [
        CanonicalField::FirstName,
        CanonicalField::LastName,
        CanonicalField::Email,
        CanonicalField::Phone,
        CanonicalField::MobilePhone,
        CanonicalField::Company,
        CanonicalField::JobTitle,
        CanonicalField::Address,
        CanonicalField::City,
        CanonicalField::State,
        CanonicalField::Zip,
        CanonicalField::Country,
        CanonicalField::Website,
        CanonicalField::LinkedinUrl,
        CanonicalField::TwitterHandle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::FirstName => "firstname",
            CanonicalField::LastName => "lastname",
            CanonicalField::Email => "email",
            CanonicalField::Phone => "phone",
            CanonicalField::MobilePhone => "mobilephone",
            CanonicalField::Company => "company",
            CanonicalField::JobTitle => "jobtitle",
            CanonicalField::Address => "address",
            CanonicalField::City => "city",
            CanonicalField::State => "state",
            CanonicalField::Zip => "zip",
            CanonicalField::Country => "country",
            CanonicalField::Website => "website",
            CanonicalField::LinkedinUrl => "linkedin_url",
            CanonicalField::TwitterHandle => "twitter_handle",
        }
    }

    /// Human label used in prompts and UI.
    pub fn label(&self) -> &'static str {
        match self {
            CanonicalField::FirstName => "First name",
            CanonicalField::LastName => "Last name",
            CanonicalField::Email => "Email",
            CanonicalField::Phone => "Phone",
            CanonicalField::MobilePhone => "Mobile phone",
            CanonicalField::Company => "Company",
            CanonicalField::JobTitle => "Job title",
            CanonicalField::Address => "Street address",
            CanonicalField::City => "City",
            CanonicalField::State => "State",
            CanonicalField::Zip => "Postal code",
            CanonicalField::Country => "Country",
            CanonicalField::Website => "Website",
            CanonicalField::LinkedinUrl => "LinkedIn URL",
            CanonicalField::TwitterHandle => "Twitter handle",
        }
    }

    /// Lenient parse for model output: trims and lower-cases first.
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.trim().to_lowercase();
        CanonicalField::ALL
            .into_iter()
            .find(|field| field.as_str() == name)
    }

    /// Fields a provider can read and write.
    pub fn supported_by(provider: Provider) -> Vec<CanonicalField> {
        CanonicalField::ALL
            .into_iter()
            .filter(|field| field.wire_name(provider).is_some())
            .collect()
    }

    /// Outgoing property name for `provider`, if the provider has one.
    pub fn wire_name(&self, provider: Provider) -> Option<&'static str> {
        match provider {
            Provider::HubSpot => Some(match self {
                CanonicalField::FirstName => "firstname",
                CanonicalField::LastName => "lastname",
                CanonicalField::Email => "email",
                CanonicalField::Phone => "phone",
                CanonicalField::MobilePhone => "mobilephone",
                CanonicalField::Company => "company",
                CanonicalField::JobTitle => "jobtitle",
                CanonicalField::Address => "address",
                CanonicalField::City => "city",
                CanonicalField::State => "state",
                CanonicalField::Zip => "zip",
                CanonicalField::Country => "country",
                CanonicalField::Website => "website",
                CanonicalField::LinkedinUrl => "hs_linkedin_url",
                CanonicalField::TwitterHandle => "twitterhandle",
            }),
            Provider::Salesforce => match self {
                CanonicalField::FirstName => Some("FirstName"),
                CanonicalField::LastName => Some("LastName"),
                CanonicalField::Email => Some("Email"),
                CanonicalField::Phone => Some("Phone"),
                CanonicalField::MobilePhone => Some("MobilePhone"),
                CanonicalField::Company => Some("AccountId"),
                CanonicalField::JobTitle => Some("Title"),
                CanonicalField::Address => Some("MailingStreet"),
                CanonicalField::City => Some("MailingCity"),
                CanonicalField::State => Some("MailingState"),
                CanonicalField::Zip => Some("MailingPostalCode"),
                CanonicalField::Country => Some("MailingCountry"),
                CanonicalField::Website | CanonicalField::LinkedinUrl | CanonicalField::TwitterHandle => None,
            },
        }
    }

    /// Inverse of [`wire_name`](Self::wire_name) for reading records back.
    pub fn from_wire(provider: Provider, wire: &str) -> Option<Self> {
        if provider == Provider::Salesforce && wire == "Account.Name" {
            return Some(CanonicalField::Company);
        }
        CanonicalField::ALL
            .into_iter()
            .find(|field| field.wire_name(provider) == Some(wire))
    }

    /// Whether the wire target only accepts a record identifier.
    pub fn requires_identifier(&self, provider: Provider) -> bool {
        matches!((provider, self), (Provider::Salesforce, CanonicalField::Company))
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Salesforce record ids are 15 (case-sensitive) or 18 (case-insensitive)
/// alphanumeric characters.
pub fn is_identifier_shaped(value: &str) -> bool {
    let value = value.trim();
    matches!(value.len(), 15 | 18) && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// An outgoing field diff after translation to wire names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireDiff {
    pub properties: BTreeMap<String, String>,
    /// Canonical fields left out because the provider could not take them.
    pub dropped: Vec<CanonicalField>,
}

impl WireDiff {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Translate a canonical diff for `provider`. Unsupported fields and values
/// that fail identifier validation are dropped rather than failing the update.
pub fn translate_diff(provider: Provider, diff: &BTreeMap<CanonicalField, String>) -> WireDiff {
    let mut out = WireDiff::default();
    for (field, value) in diff {
        let Some(wire) = field.wire_name(provider) else {
            warn!("{} has no property for field '{}', dropping it", provider, field);
            out.dropped.push(*field);
            continue;
        };
        if field.requires_identifier(provider) && !is_identifier_shaped(value) {
            warn!(
                "Dropping {} field '{}': value {:?} is not a record id",
                provider, field, value
            );
            out.dropped.push(*field);
            continue;
        }
        out.properties.insert(wire.to_string(), value.trim().to_string());
    }
    out
}

/// A CRM contact with provider fields already mapped to canonical names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub provider: Provider,
    pub fields: BTreeMap<CanonicalField, String>,
    pub display_name: String,
}

impl Contact {
    pub fn new(id: impl Into<String>, provider: Provider, fields: BTreeMap<CanonicalField, String>) -> Self {
        let id = id.into();
        let display_name = derive_display_name(&id, &fields);
        Self {
            id,
            provider,
            fields,
            display_name,
        }
    }

    pub fn field(&self, field: CanonicalField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }
}

fn derive_display_name(id: &str, fields: &BTreeMap<CanonicalField, String>) -> String {
    let part = |field: CanonicalField| fields.get(&field).map(|v| v.trim()).unwrap_or_default();
    let name = format!("{} {}", part(CanonicalField::FirstName), part(CanonicalField::LastName));
    let name = name.trim();
    if !name.is_empty() {
        return name.to_string();
    }
    let email = part(CanonicalField::Email);
    if !email.is_empty() {
        return email.to_string();
    }
    id.to_string()
}
