//! Google Gemini `generateContent` client.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{GenerationError, GenerativeClient};
use crate::config::AiConfig;

const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

pub struct GeminiClient {
    client: reqwest::Client,
    config: AiConfig,
}

impl GeminiClient {
    pub fn new(config: AiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        let model = if self.config.model.starts_with("models/") {
            self.config.model.clone()
        } else {
            format!("models/{}", self.config.model)
        };
        format!(
            "{}/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }
}

#[async_trait]
impl GenerativeClient for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(GenerationError::Service {
                status: None,
                body: "no API key configured for the generative service".to_string(),
            });
        };

        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
        };

        debug!("Calling generateContent with model {}", self.config.model);
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Service {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let header_delay = crate::integrations::error::retry_after_seconds(response.headers());
        let body = response.text().await.map_err(|e| GenerationError::Service {
            status: Some(status),
            body: e.to_string(),
        })?;

        if status == 429 {
            let retry_after_secs = extract_retry_delay(&body).or(header_delay);
            warn!(
                "Generative service rate limited the request (retry after {:?}s)",
                retry_after_secs
            );
            return Err(GenerationError::RateLimited {
                retry_after_secs,
                body,
            });
        }
        if !(200..300).contains(&status) {
            warn!("Generative service returned {}: {}", status, body);
            return Err(GenerationError::Service {
                status: Some(status),
                body,
            });
        }

        let parsed: GenerateContentResponse =
            serde_json::from_str(&body).map_err(|e| GenerationError::Service {
                status: Some(status),
                body: format!("unexpected response body: {e}"),
            })?;

        Ok(parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default())
    }
}

/// Seconds from a `google.rpc.RetryInfo` detail, e.g. `"retryDelay": "5s"`.
/// Fractional delays round up.
pub fn extract_retry_delay(body: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(body).ok()?;
    let details = value.get("error")?.get("details")?.as_array()?;
    details
        .iter()
        .filter(|d| d.get("@type").and_then(Value::as_str) == Some(RETRY_INFO_TYPE))
        .find_map(|d| d.get("retryDelay").and_then(Value::as_str))
        .and_then(parse_duration_seconds)
}

fn parse_duration_seconds(raw: &str) -> Option<u64> {
    let secs: f64 = raw.trim().strip_suffix('s')?.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(secs.ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GeminiClient {
        GeminiClient::new(AiConfig {
            api_key: Some("key-1".to_string()),
            base_url: server.uri(),
            ..AiConfig::default()
        })
        .unwrap()
    }

    fn rate_limit_body(delay: &str) -> Value {
        json!({
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "status": "RESOURCE_EXHAUSTED",
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.QuotaFailure", "violations": []},
                    {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": delay}
                ]
            }
        })
    }

    #[test]
    fn test_extract_retry_delay() {
        assert_eq!(extract_retry_delay(&rate_limit_body("5s").to_string()), Some(5));
        assert_eq!(extract_retry_delay(&rate_limit_body("1.2s").to_string()), Some(2));
        assert_eq!(extract_retry_delay(&rate_limit_body("soon").to_string()), None);
        assert_eq!(extract_retry_delay(r#"{"error":{"code":429}}"#), None);
        assert_eq!(extract_retry_delay("not json"), None);
    }

    #[tokio::test]
    async fn test_complete_joins_candidate_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "key-1"))
            .and(body_string_contains("\"text\":\"hello\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "[{\"field\":"}, {"text": "\"email\"}]"}]},
                    "finishReason": "STOP"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = client(&server).complete("hello").await.unwrap();
        assert_eq!(text, "[{\"field\":\"email\"}]");
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(rate_limit_body("7s")))
            .mount(&server)
            .await;

        let err = client(&server).complete("hello").await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::RateLimited {
                retry_after_secs: Some(7),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = GeminiClient::new(AiConfig {
            api_key: None,
            base_url: server.uri(),
            ..AiConfig::default()
        })
        .unwrap();

        assert!(matches!(
            client.complete("hello").await,
            Err(GenerationError::Service { status: None, .. })
        ));
    }
}
