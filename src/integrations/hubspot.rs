//! HubSpot CRM v3 contacts adapter.
//!
//! Errors come back as a single object `{status, message, category}`; an
//! expired or revoked token is reported through `category` as well as 401.
//! HubSpot rotates the refresh token on every refresh.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    check_record_id, decode, http_client, refresh_grant, send_request, CanonicalField, Contact, CrmAdapter,
    ErrorKind, ProviderError, MAX_SEARCH_RESULTS,
};
use crate::config::ProviderSettings;
use crate::credentials::{Credential, Provider, TokenRefresher, TokenSet};

const CONTACTS_PATH: &str = "/crm/v3/objects/contacts";

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: usize,
    properties: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<HubSpotObject>,
}

#[derive(Debug, Deserialize)]
struct HubSpotObject {
    id: String,
    #[serde(default)]
    properties: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    properties: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    category: Option<String>,
}

pub struct HubSpotAdapter {
    client: reqwest::Client,
    settings: ProviderSettings,
}

impl HubSpotAdapter {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: http_client(&settings)?,
            settings,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_base.trim_end_matches('/'), path)
    }

    fn properties() -> Vec<&'static str> {
        CanonicalField::supported_by(Provider::HubSpot)
            .into_iter()
            .filter_map(|field| field.wire_name(Provider::HubSpot))
            .collect()
    }

    fn to_contact(object: HubSpotObject) -> Contact {
        let fields = object
            .properties
            .into_iter()
            .filter_map(|(wire, value)| {
                let field = CanonicalField::from_wire(Provider::HubSpot, &wire)?;
                let value = value?.trim().to_string();
                (!value.is_empty()).then_some((field, value))
            })
            .collect();
        Contact::new(object.id, Provider::HubSpot, fields)
    }
}

/// Keep only characters that are meaningful in a name or email search.
pub fn sanitize_query(query: &str) -> String {
    let kept: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '@' | '.' | '-' | '_' | '+'))
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn classify(status: u16, body: &str) -> ErrorKind {
    if status == 401 {
        return ErrorKind::Auth;
    }
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        if matches!(
            envelope.category.as_deref(),
            Some("EXPIRED_AUTHENTICATION") | Some("INVALID_AUTHENTICATION")
        ) {
            return ErrorKind::Auth;
        }
    }
    ErrorKind::from_status(status)
}

#[async_trait]
impl TokenRefresher for HubSpotAdapter {
    fn provider(&self) -> Provider {
        Provider::HubSpot
    }

    async fn refresh(&self, credential: &Credential) -> Result<TokenSet, ProviderError> {
        refresh_grant(Provider::HubSpot, &self.client, &self.settings, credential).await
    }
}

#[async_trait]
impl CrmAdapter for HubSpotAdapter {
    async fn search(&self, credential: &Credential, query: &str) -> Result<Vec<Contact>, ProviderError> {
        let query = sanitize_query(query);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let request = SearchRequest {
            query: &query,
            limit: MAX_SEARCH_RESULTS,
            properties: Self::properties(),
        };
        let body = send_request(
            Provider::HubSpot,
            self.client
                .post(self.url(&format!("{CONTACTS_PATH}/search")))
                .bearer_auth(&credential.access_token)
                .json(&request),
            classify,
        )
        .await?;

        let response: SearchResponse = decode(Provider::HubSpot, &body)?;
        Ok(response.results.into_iter().map(Self::to_contact).collect())
    }

    async fn get(&self, credential: &Credential, id: &str) -> Result<Contact, ProviderError> {
        check_record_id(Provider::HubSpot, id)?;
        let body = send_request(
            Provider::HubSpot,
            self.client
                .get(self.url(&format!("{CONTACTS_PATH}/{id}")))
                .bearer_auth(&credential.access_token)
                .query(&[("properties", Self::properties().join(","))]),
            classify,
        )
        .await?;

        let object: HubSpotObject = decode(Provider::HubSpot, &body)?;
        Ok(Self::to_contact(object))
    }

    async fn update(
        &self,
        credential: &Credential,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Contact, ProviderError> {
        check_record_id(Provider::HubSpot, id)?;
        send_request(
            Provider::HubSpot,
            self.client
                .patch(self.url(&format!("{CONTACTS_PATH}/{id}")))
                .bearer_auth(&credential.access_token)
                .json(&UpdateRequest { properties }),
            classify,
        )
        .await?;

        // The PATCH response only echoes default properties.
        self.get(credential, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> HubSpotAdapter {
        let mut settings = ProviderSettings::hubspot();
        settings.api_base = server.uri();
        settings.token_url = format!("{}/oauth/v1/token", server.uri());
        settings.client_id = "client".to_string();
        settings.client_secret = Some("secret".to_string());
        HubSpotAdapter::new(settings).unwrap()
    }

    fn credential() -> Credential {
        Credential {
            id: 1,
            user_id: "u".to_string(),
            provider: Provider::HubSpot,
            access_token: "token-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
            external_account: "portal".to_string(),
            instance_url: None,
        }
    }

    #[test]
    fn test_sanitize_query_strips_syntax_characters() {
        assert_eq!(sanitize_query("  jane*  (doe) "), "jane doe");
        assert_eq!(sanitize_query("j.doe+crm@example.com"), "j.doe+crm@example.com");
        assert_eq!(sanitize_query("\"\"**"), "");
    }

    #[test]
    fn test_category_marks_auth_failures() {
        let body = r#"{"status":"error","message":"expired","category":"EXPIRED_AUTHENTICATION"}"#;
        assert_eq!(classify(403, body), ErrorKind::Auth);
        assert_eq!(
            classify(400, r#"{"status":"error","category":"VALIDATION_ERROR"}"#),
            ErrorKind::Rejected
        );
        assert_eq!(classify(401, "not json"), ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_search_maps_properties_to_canonical_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crm/v3/objects/contacts/search"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_string_contains("\"query\":\"jane\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "id": "101",
                    "properties": {
                        "firstname": "Jane",
                        "lastname": "Doe",
                        "email": "jane@example.com",
                        "hs_linkedin_url": "https://linkedin.com/in/jane",
                        "phone": null,
                        "hs_object_id": "101"
                    }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let contacts = adapter(&server).search(&credential(), "jane;").await.unwrap();

        assert_eq!(contacts.len(), 1);
        let jane = &contacts[0];
        assert_eq!(jane.display_name, "Jane Doe");
        assert_eq!(jane.field(CanonicalField::LinkedinUrl), Some("https://linkedin.com/in/jane"));
        assert_eq!(jane.field(CanonicalField::Phone), None);
    }

    #[tokio::test]
    async fn test_empty_query_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let contacts = adapter(&server).search(&credential(), "**").await.unwrap();
        assert!(contacts.is_empty());
    }

    #[tokio::test]
    async fn test_expired_category_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/contacts/101"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "status": "error",
                "message": "The OAuth token used to make this call expired",
                "category": "EXPIRED_AUTHENTICATION"
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).get(&credential(), "101").await.unwrap_err();

        assert!(err.is_auth_failure());
        assert_eq!(err.status, Some(401));
        assert!(err.body.contains("EXPIRED_AUTHENTICATION"));
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/contacts/101"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "4")
                    .set_body_json(json!({"status": "error", "category": "RATE_LIMITS"})),
            )
            .mount(&server)
            .await;

        let err = adapter(&server).get(&credential(), "101").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(4));
    }

    #[tokio::test]
    async fn test_update_patches_then_reads_back() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/crm/v3/objects/contacts/101"))
            .and(body_string_contains("\"jobtitle\":\"CTO\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "101", "properties": {}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/contacts/101"))
            .and(query_param("properties", HubSpotAdapter::properties().join(",")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "101",
                "properties": {"firstname": "Jane", "jobtitle": "CTO"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut properties = BTreeMap::new();
        properties.insert("jobtitle".to_string(), "CTO".to_string());
        let contact = adapter(&server)
            .update(&credential(), "101", &properties)
            .await
            .unwrap();

        assert_eq!(contact.field(CanonicalField::JobTitle), Some("CTO"));
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v1/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "token-2",
                "refresh_token": "refresh-2",
                "expires_in": 1800
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = adapter(&server).refresh(&credential()).await.unwrap();

        assert_eq!(tokens.access_token, "token-2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-2"));
        assert!(tokens.expires_at > Utc::now() + Duration::minutes(29));
    }
}
