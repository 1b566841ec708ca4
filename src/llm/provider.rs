use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The single active row of `ai_providers`.
#[derive(Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct ProviderConfig {
    pub provider_name: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl ProviderConfig {
    pub fn is_usable(&self) -> bool {
        !self.api_key.trim().is_empty()
            && !self.model.trim().is_empty()
            && !self.base_url.trim().is_empty()
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim().trim_end_matches('/'),
            self.model.trim()
        )
    }
}

// The key never reaches logs.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider credentials incomplete")]
    MissingCredentials,
    #[error("http error: {0}")]
    Http(String),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Transport failures, throttling and server errors may succeed later;
    /// other client errors and bad payloads will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(_) => true,
            LlmError::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            LlmError::MissingCredentials | LlmError::InvalidResponse(_) => false,
        }
    }
}

pub struct LlmClient {
    http: Client,
}

impl LlmClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// One `generateContent` call; returns the concatenated text parts of the
    /// first candidate.
    pub async fn generate_text(
        &self,
        provider: &ProviderConfig,
        prompt: &str,
    ) -> Result<String, LlmError> {
        if !provider.is_usable() {
            return Err(LlmError::MissingCredentials);
        }

        let body = GenerateRequest {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationSettings { temperature: 0.4 },
        };

        let response = self
            .http
            .post(provider.endpoint())
            .header("x-goog-api-key", provider.api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: preview(&body),
            });
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        let text = payload
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))?;

        Ok(text)
    }
}

/// First 300 characters, for log lines.
pub(crate) fn preview(text: &str) -> String {
    const LIMIT: usize = 300;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(LIMIT).collect();
    cut.push('…');
    cut
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationSettings,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationSettings {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::http::build_client;

    fn provider(base_url: &str) -> ProviderConfig {
        ProviderConfig {
            provider_name: "gemini".into(),
            api_key: "test-key".into(),
            model: "gemini-test".into(),
            base_url: base_url.into(),
        }
    }

    #[test]
    fn endpoint_joins_base_and_model() {
        assert_eq!(
            provider("https://example.test/v1beta/").endpoint(),
            "https://example.test/v1beta/models/gemini-test:generateContent"
        );
    }

    #[test]
    fn debug_output_hides_the_key() {
        let rendered = format!("{:?}", provider("https://example.test"));
        assert!(!rendered.contains("test-key"));
        assert!(rendered.contains("gemini-test"));
    }

    #[test]
    fn preview_truncates_long_payloads() {
        let long = "x".repeat(1000);
        assert_eq!(preview(&long).chars().count(), 301);
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        let status = |status| LlmError::Status {
            status,
            body: String::new(),
        };
        assert!(LlmError::Http("connection reset".into()).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!LlmError::MissingCredentials.is_retryable());
        assert!(!LlmError::InvalidResponse("no candidates".into()).is_retryable());
    }

    #[tokio::test]
    async fn incomplete_credentials_skip_the_network() {
        let client = LlmClient::new(build_client(&HttpConfig::default()));
        let mut config = provider("http://127.0.0.1:9");
        config.api_key = "  ".into();
        let err = client
            .generate_text(&config, "hello")
            .await
            .expect_err("must fail");
        assert!(matches!(err, LlmError::MissingCredentials));
    }
}
