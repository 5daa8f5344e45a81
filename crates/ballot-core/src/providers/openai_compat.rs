//! OpenAI-compatible provider for Perplexity, Groq, local servers, etc.
//!
//! Reuses the OpenAI wire format with a configurable base URL.

use anyhow::Result;
use async_trait::async_trait;

use super::openai::OpenAiProvider;
use super::{FragmentStream, LlmProvider};
use crate::error::ProviderError;
use crate::types::GenerationRequest;

/// OpenAI-compatible provider, wraps [`OpenAiProvider`] with a custom name
pub struct OpenAiCompatProvider {
    inner: OpenAiProvider,
    name: String,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .finish()
    }
}

impl OpenAiCompatProvider {
    pub const PERPLEXITY_BASE_URL: &'static str = "https://api.perplexity.ai";

    /// Create a new OpenAI-compatible provider.
    ///
    /// - `name`: registry name (e.g. "perplexity", "groq")
    /// - `base_url`: the endpoint root (e.g. `http://localhost:11434/v1`)
    pub fn new(name: String, api_key: String, base_url: String, max_tokens: u32) -> Result<Self> {
        Ok(Self {
            inner: OpenAiProvider::new(api_key, base_url, max_tokens)?,
            name,
        })
    }

    pub fn perplexity(api_key: String, max_tokens: u32) -> Result<Self> {
        Self::new(
            "perplexity".to_string(),
            api_key,
            Self::PERPLEXITY_BASE_URL.to_string(),
            max_tokens,
        )
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.inner.complete(request).await
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError> {
        self.inner.stream(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compat_provider_name() {
        let p = OpenAiCompatProvider::perplexity("pplx-key".to_string(), 1024).unwrap();
        assert_eq!(p.provider_name(), "perplexity");
    }

    #[test]
    fn test_compat_provider_debug_hides_key() {
        let p = OpenAiCompatProvider::new(
            "groq".to_string(),
            "gsk_secret".to_string(),
            "https://api.groq.com/openai/v1".to_string(),
            1024,
        )
        .unwrap();
        let debug = format!("{:?}", p);
        assert!(!debug.contains("gsk_secret"));
        assert!(debug.contains("groq"));
    }
}
