//! LLM provider adapters
//!
//! One adapter per provider family: OpenAI, any OpenAI-compatible endpoint
//! (Perplexity, Groq, local servers), Azure OpenAI and Google Gemini.
//! Adapters implement [`LlmProvider`] and are composed by
//! [`crate::router::ModelRouter`] for fallback.

pub mod azure;
pub mod google;
pub mod openai;
pub mod openai_compat;
pub mod sse;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Response;

use crate::error::ProviderError;
use crate::types::GenerationRequest;

pub use azure::AzureOpenAiProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;
pub use openai_compat::OpenAiCompatProvider;

/// Lazily pulled answer fragments. Dropping the stream abandons the call.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// A provider family. The model to call comes with each request.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Name matched against [`crate::types::ModelDescriptor::provider`]
    fn provider_name(&self) -> &str;

    /// Full completion in one response
    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    /// Streamed completion. Errors before the first fragment are returned
    /// here; later ones arrive inside the stream.
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError>;
}

/// Turn a non-2xx response into a classified error
pub(crate) async fn error_for_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(ProviderError::from_status(status, &body))
}
