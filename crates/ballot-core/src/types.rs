//! Shared types for ballot-core

use serde::{Deserialize, Serialize};

/// Coarse cost/capability tier of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Large,
}

/// Whether a model's output is treated as reproducible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Used for reranking and other structured calls
    Deterministic,
    /// Used for free-form answers
    NonDeterministic,
}

/// One entry of the provider registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Provider family name, matches [`crate::LlmProvider::provider_name`]
    pub provider: String,
    /// Model (or deployment) identifier sent to the provider
    pub model: String,
    pub size: SizeClass,
    pub determinism: Determinism,
    /// Lower is preferred
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub premium_only: bool,
}

impl ModelDescriptor {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        size: SizeClass,
        determinism: Determinism,
        priority: u32,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            size,
            determinism,
            priority,
            premium_only: false,
        }
    }

    /// Mark this descriptor as reserved for premium requests
    pub fn premium(mut self) -> Self {
        self.premium_only = true;
        self
    }

    pub fn is_deterministic(&self) -> bool {
        self.determinism == Determinism::Deterministic
    }

    /// `provider/model`, used in logs and terminal events
    pub fn label(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// A retrieval partition: one namespace inside one vector collection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub collection: String,
    pub namespace: String,
}

impl Partition {
    pub fn new(collection: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            namespace: namespace.into(),
        }
    }

    /// Parse `collection:namespace`
    pub fn parse(s: &str) -> Option<Self> {
        let (collection, namespace) = s.split_once(':')?;
        let (collection, namespace) = (collection.trim(), namespace.trim());
        if collection.is_empty() || namespace.is_empty() {
            return None;
        }
        Some(Self::new(collection, namespace))
    }
}

/// A single similarity query against one partition
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub partition: Partition,
    pub text: String,
    pub k: usize,
}

/// A document returned by the retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub collection: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// System and user turns sent to a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// One provider attempt
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: ModelDescriptor,
    pub prompt: Prompt,
}

impl GenerationRequest {
    pub fn new(model: ModelDescriptor, prompt: Prompt) -> Self {
        Self { model, prompt }
    }
}

/// One numbered unit of a streamed answer.
///
/// Sequence numbers start at 0 and are contiguous per response. The last
/// event of a response has `is_final` set and carries the full text or an
/// error marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEvent {
    pub request_id: String,
    pub seq: u64,
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChunkEvent {
    pub fn partial(request_id: &str, seq: u64, text: String) -> Self {
        Self {
            request_id: request_id.to_string(),
            seq,
            text,
            is_final: false,
            error: None,
            model: None,
        }
    }

    pub fn terminal(
        request_id: &str,
        seq: u64,
        text: String,
        error: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            seq,
            text,
            is_final: true,
            error,
            model,
        }
    }
}

/// Event emitted by the pipeline to an output channel
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    SourcesReady {
        request_id: String,
        documents: Vec<RetrievedDocument>,
    },
    Chunk(ChunkEvent),
}

impl PipelineEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourcesReady { .. } => "sources.ready",
            Self::Chunk(chunk) if chunk.is_final => "answer.complete",
            Self::Chunk(_) => "answer.chunk",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::SourcesReady { request_id, .. } => request_id,
            Self::Chunk(chunk) => &chunk.request_id,
        }
    }
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Large => write!(f, "large"),
        }
    }
}

impl std::fmt::Display for Determinism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deterministic => write!(f, "deterministic"),
            Self::NonDeterministic => write!(f, "non_deterministic"),
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.collection, self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_parse() {
        let p = Partition::parse("programs:greens").unwrap();
        assert_eq!(p.collection, "programs");
        assert_eq!(p.namespace, "greens");
        assert_eq!(p.to_string(), "programs:greens");

        assert!(Partition::parse("programs").is_none());
        assert!(Partition::parse(":greens").is_none());
        assert!(Partition::parse("programs: ").is_none());
    }

    #[test]
    fn test_descriptor_deserialize_defaults() {
        let toml_like = serde_json::json!({
            "provider": "openai",
            "model": "gpt-4o-mini",
            "size": "small",
            "determinism": "non_deterministic",
        });
        let d: ModelDescriptor = serde_json::from_value(toml_like).unwrap();
        assert_eq!(d.priority, 0);
        assert!(!d.premium_only);
        assert_eq!(d.label(), "openai/gpt-4o-mini");
    }

    #[test]
    fn test_event_names() {
        let chunk = PipelineEvent::Chunk(ChunkEvent::partial("r1", 0, "hi".to_string()));
        assert_eq!(chunk.name(), "answer.chunk");

        let done = PipelineEvent::Chunk(ChunkEvent::terminal("r1", 1, "hi".to_string(), None, None));
        assert_eq!(done.name(), "answer.complete");

        let sources = PipelineEvent::SourcesReady {
            request_id: "r1".to_string(),
            documents: vec![],
        };
        assert_eq!(sources.name(), "sources.ready");
        assert_eq!(sources.request_id(), "r1");
    }

    #[test]
    fn test_terminal_chunk_skips_empty_fields() {
        let done = ChunkEvent::terminal("r1", 3, "full".to_string(), None, None);
        let json = serde_json::to_string(&done).unwrap();
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"is_final\":true"));
    }
}
