//! OpenAI chat completions provider
//!
//! The wire helpers here are shared with the compatible and Azure adapters.

use anyhow::{Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{FragmentStream, LlmProvider, error_for_status, sse};
use crate::error::ProviderError;
use crate::types::GenerationRequest;

/// OpenAI provider
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// `base_url` is the versioned API root, e.g. `https://api.openai.com/v1`
    pub fn new(api_key: String, base_url: String, max_tokens: u32) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tokens,
        })
    }

    async fn post(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = chat_body(request, Some(&request.model.model), self.max_tokens, stream);

        debug!(
            "OpenAI request: url={}, model={}, stream={}",
            url, request.model.model, stream
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        error_for_status(response).await
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let response = self.post(request, false).await?;
        let completion: ChatCompletion = response.json().await?;
        parse_completion(completion)
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError> {
        let response = self.post(request, true).await?;
        Ok(chat_fragments(sse::data_stream(response)))
    }
}

/// Client shared by every HTTP adapter. No overall timeout: the router bounds
/// each call and long streams are expected.
pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")
}

/// Chat completions request body. Deterministic models run at temperature 0.
pub(super) fn chat_body(
    request: &GenerationRequest,
    model: Option<&str>,
    max_tokens: u32,
    stream: bool,
) -> Value {
    let mut body = serde_json::json!({
        "messages": [
            {"role": "system", "content": request.prompt.system},
            {"role": "user", "content": request.prompt.user},
        ],
        "max_tokens": max_tokens,
        "stream": stream,
    });
    if let Some(model) = model {
        body["model"] = Value::from(model);
    }
    if request.model.is_deterministic() {
        body["temperature"] = Value::from(0);
    }
    body
}

pub(super) fn parse_completion(completion: ChatCompletion) -> Result<String, ProviderError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedOutput("response had no choices".to_string()))?;

    debug!(
        "OpenAI response: finish_reason={:?}",
        choice.finish_reason
    );

    choice
        .message
        .content
        .ok_or_else(|| ProviderError::MalformedOutput("choice had no content".to_string()))
}

/// Text delta of one streamed chunk, `None` for role-only or empty chunks
pub(super) fn parse_stream_delta(data: &str) -> Result<Option<String>, ProviderError> {
    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        return Err(ProviderError::Transient(format!("stream error: {}", error)));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

/// Map SSE payloads to text fragments, ending at `[DONE]`
pub(super) fn chat_fragments(mut events: FragmentStream) -> FragmentStream {
    let fragments = stream! {
        while let Some(event) = events.next().await {
            let data = match event {
                Ok(data) => data,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            };
            if data.trim() == "[DONE]" {
                break;
            }
            match parse_stream_delta(&data) {
                Ok(Some(text)) => {
                    yield Ok(text);
                }
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };
    fragments.boxed()
}

// ── OpenAI wire types ──

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
