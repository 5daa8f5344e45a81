//! ballot-core - The answer pipeline of the ballot assistant
//!
//! This crate provides:
//! - Provider registry and health tracking with cool-downs
//! - A router that walks a fallback chain of LLM providers one at a time
//! - Concurrent retrieval across party partitions of a vector index
//! - Deterministic model reranking that degrades to similarity order
//! - A dispatcher that streams numbered chunks with a single terminal event
//! - Adapters for OpenAI, OpenAI-compatible, Azure OpenAI, Gemini and Pinecone

pub mod dispatch;
pub mod error;
pub mod health;
pub mod index;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod registry;
pub mod rerank;
pub mod retrieval;
pub mod router;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use dispatch::{ChannelClosed, DispatchReport, OutputChannel, StreamDispatcher};
pub use error::{Outcome, PipelineError, ProviderError};
pub use health::{HealthStatus, HealthTracker, HealthTransition, ProviderHealth};
pub use index::{Embedder, IndexMatch, MetadataKeys, OpenAiEmbedder, PineconeIndex, VectorIndex};
pub use pipeline::{AnswerPipeline, AnswerRequest, AnswerSummary, PipelineConfig};
pub use providers::{
    AzureOpenAiProvider, FragmentStream, GoogleProvider, LlmProvider, OpenAiCompatProvider,
    OpenAiProvider,
};
pub use registry::ProviderRegistry;
pub use rerank::Reranker;
pub use retrieval::{PartitionFailure, RetrievalResult, Retriever};
pub use router::{Generation, ModelRouter, RouteSpec};
pub use types::{
    ChunkEvent, Determinism, GenerationRequest, ModelDescriptor, Partition, PipelineEvent, Prompt,
    RetrievalQuery, RetrievedDocument, SizeClass,
};
