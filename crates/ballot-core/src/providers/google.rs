//! Google Gemini provider

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::openai::http_client;
use super::{FragmentStream, LlmProvider, error_for_status, sse};
use crate::error::ProviderError;
use crate::types::GenerationRequest;

/// Google Gemini provider
pub struct GoogleProvider {
    client: Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl GoogleProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn new(api_key: String, base_url: String, max_tokens: u32) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tokens,
        })
    }

    fn url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model)
        } else {
            format!("{}/models/{}:generateContent", self.base_url, model)
        }
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut generation_config = serde_json::json!({
            "maxOutputTokens": self.max_tokens,
        });
        if request.model.is_deterministic() {
            generation_config["temperature"] = serde_json::Value::from(0);
        }

        serde_json::json!({
            "contents": [GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart { text: Some(request.prompt.user.clone()) }],
            }],
            "systemInstruction": {
                "parts": [{"text": request.prompt.system}]
            },
            "generationConfig": generation_config,
        })
    }

    async fn post(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<Response, ProviderError> {
        let url = self.url(&request.model.model, stream);

        debug!(
            "Gemini request: model={}, stream={}",
            request.model.model, stream
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(request))
            .send()
            .await?;
        error_for_status(response).await
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn provider_name(&self) -> &str {
        "google"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let response = self.post(request, false).await?;
        let api_response: GeminiApiResponse = response.json().await?;

        debug!(
            "Gemini response: candidates={}",
            api_response.candidates.len()
        );

        if api_response.candidates.is_empty() {
            return Err(ProviderError::MalformedOutput(
                "Gemini response had no candidates".to_string(),
            ));
        }
        Ok(candidate_text(&api_response))
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError> {
        let response = self.post(request, true).await?;
        let mut events = sse::data_stream(response);
        let fragments = stream! {
            while let Some(event) = events.next().await {
                let parsed = event.and_then(|data| {
                    serde_json::from_str::<GeminiApiResponse>(&data).map_err(ProviderError::from)
                });
                match parsed {
                    Ok(chunk) => {
                        let text = candidate_text(&chunk);
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Ok(fragments.boxed())
    }
}

/// Concatenated text parts of the first candidate
fn candidate_text(response: &GeminiApiResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

// ── Gemini wire types ──

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiApiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Determinism, ModelDescriptor, Prompt, SizeClass};

    fn provider() -> GoogleProvider {
        GoogleProvider::new(
            "goog-secret".to_string(),
            GoogleProvider::DEFAULT_BASE_URL.to_string(),
            800,
        )
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let p = provider();
        assert_eq!(
            p.url("gemini-1.5-flash", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert!(p.url("gemini-1.5-flash", true).ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn test_request_body() {
        let request = GenerationRequest::new(
            ModelDescriptor::new("google", "gemini-1.5-flash", SizeClass::Small, Determinism::Deterministic, 0),
            Prompt::new("sys", "question"),
        );
        let body = provider().request_body(&request);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "question");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 800);
        assert_eq!(body["generationConfig"]["temperature"], 0);
    }

    #[test]
    fn test_candidate_text() {
        let resp: GeminiApiResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello "}, {"text": "world"}]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        assert_eq!(candidate_text(&resp), "Hello world");

        let empty: GeminiApiResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(candidate_text(&empty), "");
    }

    #[test]
    fn test_google_provider_debug_hides_key() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("goog-secret"));
    }
}
