//! Salesforce REST adapter for `Contact` records.
//!
//! Requests go to the org's `instance_url` captured at connect time (and
//! possibly updated on refresh). Errors are a list of `{message, errorCode}`.
//! Salesforce keeps the same refresh token across refreshes.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{
    check_record_id, decode, http_client, refresh_grant, send_request, CanonicalField, Contact, CrmAdapter,
    ErrorKind, ProviderError, MAX_SEARCH_RESULTS,
};
use crate::config::ProviderSettings;
use crate::credentials::{Credential, Provider, TokenRefresher, TokenSet};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    records: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(rename = "errorCode", default)]
    error_code: String,
}

pub struct SalesforceAdapter {
    client: reqwest::Client,
    settings: ProviderSettings,
}

impl SalesforceAdapter {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: http_client(&settings)?,
            settings,
        })
    }

    fn data_url(&self, credential: &Credential, path: &str) -> String {
        let base = credential
            .instance_url
            .as_deref()
            .unwrap_or(&self.settings.api_base)
            .trim_end_matches('/');
        format!("{}/services/data/{}{}", base, self.settings.api_version, path)
    }

    /// Fields selected on every read. `Account.Name` gives a readable company.
    fn select_fields() -> Vec<&'static str> {
        let mut fields = vec!["Id"];
        fields.extend(
            CanonicalField::supported_by(Provider::Salesforce)
                .into_iter()
                .filter_map(|field| field.wire_name(Provider::Salesforce)),
        );
        fields.push("Account.Name");
        fields
    }

    fn search_soql(term: &str) -> String {
        format!(
            "SELECT {} FROM Contact WHERE Name LIKE '%{term}%' OR Email LIKE '%{term}%' \
             ORDER BY LastModifiedDate DESC LIMIT {}",
            Self::select_fields().join(", "),
            MAX_SEARCH_RESULTS
        )
    }

    fn to_contact(record: serde_json::Map<String, Value>) -> Option<Contact> {
        let id = record.get("Id")?.as_str()?.to_string();
        let mut fields = BTreeMap::new();
        for (wire, value) in &record {
            let Some(field) = CanonicalField::from_wire(Provider::Salesforce, wire) else {
                continue;
            };
            // AccountId is a record id, not a company name.
            if field.requires_identifier(Provider::Salesforce) {
                continue;
            }
            if let Some(text) = value.as_str().map(str::trim).filter(|v| !v.is_empty()) {
                fields.insert(field, text.to_string());
            }
        }
        if let Some(name) = record
            .get("Account")
            .and_then(|account| account.get("Name"))
            .and_then(Value::as_str)
        {
            fields.insert(CanonicalField::Company, name.to_string());
        }
        Some(Contact::new(id, Provider::Salesforce, fields))
    }
}

/// Drop everything that could break out of a quoted SOQL `LIKE` term.
pub fn sanitize_query(query: &str) -> String {
    let kept: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '@' | '.' | '-' | '+'))
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn classify(status: u16, body: &str) -> ErrorKind {
    if let Ok(items) = serde_json::from_str::<Vec<ErrorItem>>(body) {
        if items.iter().any(|item| item.error_code == "INVALID_SESSION_ID") {
            return ErrorKind::Auth;
        }
        if items.iter().any(|item| item.error_code == "NOT_FOUND") {
            return ErrorKind::NotFound;
        }
    }
    ErrorKind::from_status(status)
}

#[async_trait]
impl TokenRefresher for SalesforceAdapter {
    fn provider(&self) -> Provider {
        Provider::Salesforce
    }

    async fn refresh(&self, credential: &Credential) -> Result<TokenSet, ProviderError> {
        refresh_grant(Provider::Salesforce, &self.client, &self.settings, credential).await
    }
}

#[async_trait]
impl CrmAdapter for SalesforceAdapter {
    async fn search(&self, credential: &Credential, query: &str) -> Result<Vec<Contact>, ProviderError> {
        let term = sanitize_query(query);
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let body = send_request(
            Provider::Salesforce,
            self.client
                .get(self.data_url(credential, "/query"))
                .bearer_auth(&credential.access_token)
                .query(&[("q", Self::search_soql(&term))]),
            classify,
        )
        .await?;

        let response: QueryResponse = decode(Provider::Salesforce, &body)?;
        Ok(response.records.into_iter().filter_map(Self::to_contact).collect())
    }

    async fn get(&self, credential: &Credential, id: &str) -> Result<Contact, ProviderError> {
        check_record_id(Provider::Salesforce, id)?;
        let body = send_request(
            Provider::Salesforce,
            self.client
                .get(self.data_url(credential, &format!("/sobjects/Contact/{id}")))
                .bearer_auth(&credential.access_token)
                .query(&[("fields", Self::select_fields().join(","))]),
            classify,
        )
        .await?;

        let record: serde_json::Map<String, Value> = decode(Provider::Salesforce, &body)?;
        Self::to_contact(record)
            .ok_or_else(|| ProviderError::decode(Provider::Salesforce, 200, "record without Id"))
    }

    async fn update(
        &self,
        credential: &Credential,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Contact, ProviderError> {
        check_record_id(Provider::Salesforce, id)?;
        // 204 No Content on success.
        send_request(
            Provider::Salesforce,
            self.client
                .patch(self.data_url(credential, &format!("/sobjects/Contact/{id}")))
                .bearer_auth(&credential.access_token)
                .json(properties),
            classify,
        )
        .await?;

        self.get(credential, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> SalesforceAdapter {
        let mut settings = ProviderSettings::salesforce();
        settings.api_base = server.uri();
        settings.token_url = format!("{}/services/oauth2/token", server.uri());
        settings.client_id = "client".to_string();
        SalesforceAdapter::new(settings).unwrap()
    }

    fn credential(server: &MockServer) -> Credential {
        Credential {
            id: 9,
            user_id: "u".to_string(),
            provider: Provider::Salesforce,
            access_token: "session-1".to_string(),
            refresh_token: Some("refresh-sf".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
            external_account: "00Dxx0000001gEH".to_string(),
            instance_url: Some(server.uri()),
        }
    }

    #[test]
    fn test_sanitize_query_strips_soql_syntax() {
        assert_eq!(sanitize_query("O'Brien"), "OBrien");
        assert_eq!(sanitize_query("100%_match\\"), "100match");
        assert_eq!(sanitize_query("ann@example.com"), "ann@example.com");
    }

    #[test]
    fn test_soql_is_bounded_and_ordered() {
        let soql = SalesforceAdapter::search_soql("ann");
        assert!(soql.contains("Name LIKE '%ann%'"));
        assert!(soql.contains("ORDER BY LastModifiedDate DESC LIMIT 10"));
        assert!(soql.contains("Account.Name"));
    }

    #[test]
    fn test_error_codes_classify() {
        let expired = r#"[{"message":"Session expired or invalid","errorCode":"INVALID_SESSION_ID"}]"#;
        assert_eq!(classify(401, expired), ErrorKind::Auth);
        assert_eq!(classify(403, expired), ErrorKind::Auth);
        let missing = r#"[{"message":"The requested resource does not exist","errorCode":"NOT_FOUND"}]"#;
        assert_eq!(classify(404, missing), ErrorKind::NotFound);
        assert_eq!(classify(500, "oops"), ErrorKind::Server);
    }

    #[test]
    fn test_contact_without_account_has_no_company() {
        let record = json!({
            "Id": "0035g00000AbCdEAAZ",
            "LastName": "Lee",
            "AccountId": "0015g00000XyZaBAAV",
            "Account": null
        });
        let serde_json::Value::Object(record) = record else {
            unreachable!()
        };

        let contact = SalesforceAdapter::to_contact(record).unwrap();

        assert_eq!(contact.field(CanonicalField::Company), None);
        assert_eq!(contact.field(CanonicalField::LastName), Some("Lee"));
    }

    #[tokio::test]
    async fn test_search_reads_records_with_account_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/data/v59.0/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 1,
                "done": true,
                "records": [{
                    "attributes": {"type": "Contact"},
                    "Id": "0035g00000AbCdEAAZ",
                    "FirstName": "Ann",
                    "LastName": "Lee",
                    "Email": "ann@example.com",
                    "Title": null,
                    "AccountId": "0015g00000XyZaBAAV",
                    "Account": {"attributes": {"type": "Account"}, "Name": "Acme"}
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let contacts = adapter(&server)
            .search(&credential(&server), "Ann'; DROP")
            .await
            .unwrap();

        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].display_name, "Ann Lee");
        assert_eq!(contacts[0].field(CanonicalField::Company), Some("Acme"));
        assert_eq!(contacts[0].field(CanonicalField::JobTitle), None);
    }

    #[tokio::test]
    async fn test_invalid_session_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/data/v59.0/sobjects/Contact/0035g00000AbCdE"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!([
                {"message": "Session expired or invalid", "errorCode": "INVALID_SESSION_ID"}
            ])))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .get(&credential(&server), "0035g00000AbCdE")
            .await
            .unwrap_err();

        assert!(err.is_auth_failure());
        assert!(err.body.contains("INVALID_SESSION_ID"));
    }

    #[tokio::test]
    async fn test_update_sends_wire_names_and_reads_back() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/services/data/v59.0/sobjects/Contact/0035g00000AbCdE"))
            .and(body_string_contains("\"MobilePhone\":\"555-0199\""))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v59.0/sobjects/Contact/0035g00000AbCdE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Id": "0035g00000AbCdE",
                "LastName": "Lee",
                "MobilePhone": "555-0199"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut properties = BTreeMap::new();
        properties.insert("MobilePhone".to_string(), "555-0199".to_string());
        let contact = adapter(&server)
            .update(&credential(&server), "0035g00000AbCdE", &properties)
            .await
            .unwrap();

        assert_eq!(contact.field(CanonicalField::MobilePhone), Some("555-0199"));
        assert_eq!(contact.display_name, "Lee");
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_and_uses_session_lifetime() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("refresh_token=refresh-sf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "session-2",
                "instance_url": "https://na99.salesforce.com",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = adapter(&server).refresh(&credential(&server)).await.unwrap();

        assert_eq!(tokens.access_token, "session-2");
        assert_eq!(tokens.refresh_token, None);
        assert_eq!(tokens.instance_url.as_deref(), Some("https://na99.salesforce.com"));
        assert!(tokens.expires_at > Utc::now() + Duration::minutes(119));
    }

    #[tokio::test]
    async fn test_search_query_param_contains_sanitized_term() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/data/v59.0/query"))
            .and(query_param("q", SalesforceAdapter::search_soql("Ann DROP")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
            .expect(1)
            .mount(&server)
            .await;

        let contacts = adapter(&server)
            .search(&credential(&server), "Ann'; DROP")
            .await
            .unwrap();
        assert!(contacts.is_empty());
    }
}
