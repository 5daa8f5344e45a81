//! Azure OpenAI provider
//!
//! Same wire format as OpenAI. The descriptor's model is the deployment name.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;

use super::openai::{ChatCompletion, chat_body, chat_fragments, http_client, parse_completion};
use super::{FragmentStream, LlmProvider, error_for_status, sse};
use crate::error::ProviderError;
use crate::types::GenerationRequest;

pub struct AzureOpenAiProvider {
    client: Client,
    api_key: String,
    endpoint: String,
    api_version: String,
    max_tokens: u32,
}

impl std::fmt::Debug for AzureOpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureOpenAiProvider")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AzureOpenAiProvider {
    pub const DEFAULT_API_VERSION: &'static str = "2024-06-01";

    /// `endpoint` is the resource root, e.g. `https://myres.openai.azure.com`
    pub fn new(
        api_key: String,
        endpoint: String,
        api_version: String,
        max_tokens: u32,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_version,
            max_tokens,
        })
    }

    fn deployment_url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, deployment, self.api_version
        )
    }

    async fn post(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<Response, ProviderError> {
        let url = self.deployment_url(&request.model.model);
        let body = chat_body(request, None, self.max_tokens, stream);

        debug!(
            "Azure OpenAI request: deployment={}, stream={}",
            request.model.model, stream
        );

        let response = self
            .client
            .post(&url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        error_for_status(response).await
    }
}

#[async_trait]
impl LlmProvider for AzureOpenAiProvider {
    fn provider_name(&self) -> &str {
        "azure"
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
