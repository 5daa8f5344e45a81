//! Vector index access
//!
//! The retriever only needs [`VectorIndex`]. [`PineconeIndex`] is the
//! production implementation; it embeds query text with an [`Embedder`].

pub mod embed;
pub mod pinecone;

use async_trait::async_trait;

use crate::types::{Partition, RetrievalQuery, RetrievedDocument};

pub use embed::{Embedder, OpenAiEmbedder};
pub use pinecone::{MetadataKeys, PineconeIndex};

/// One similarity hit inside a partition
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub url: Option<String>,
    pub title: Option<String>,
}

impl IndexMatch {
    pub fn into_document(self, partition: &Partition) -> RetrievedDocument {
        RetrievedDocument {
            id: self.id,
            text: self.text,
            score: self.score,
            collection: partition.collection.clone(),
            namespace: partition.namespace.clone(),
            url: self.url,
            title: self.title,
        }
    }
}

/// A similarity-search backend
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `query.k` matches from one partition
    async fn query(&self, query: &RetrievalQuery) -> anyhow::Result<Vec<IndexMatch>>;
}
