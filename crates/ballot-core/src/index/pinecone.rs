//! Pinecone vector index
//!
//! Each collection is a separate Pinecone index with its own host; parties
//! are namespaces inside it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use super::{Embedder, IndexMatch, VectorIndex};
use crate::providers::openai::http_client;
use crate::types::RetrievalQuery;

const EMBEDDING_CACHE_SIZE: usize = 256;

/// Metadata field names holding document text, source URL and title
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataKeys {
    pub text: String,
    pub url: String,
    pub title: String,
}

impl Default for MetadataKeys {
    fn default() -> Self {
        Self {
            text: "text".to_string(),
            url: "source_url".to_string(),
            title: "title".to_string(),
        }
    }
}

pub struct PineconeIndex {
    client: Client,
    api_key: String,
    hosts: HashMap<String, String>,
    keys: MetadataKeys,
    embedder: Arc<dyn Embedder>,
    /// One cell per text so concurrent lookups share a single embed call
    embeddings: Mutex<LruCache<String, Arc<OnceCell<Arc<Vec<f32>>>>>>,
}

impl std::fmt::Debug for PineconeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PineconeIndex")
            .field("hosts", &self.hosts)
            .field("keys", &self.keys)
            .finish()
    }
}

impl PineconeIndex {
    /// `hosts` maps collection names to index hosts
    pub fn new(
        api_key: String,
        hosts: HashMap<String, String>,
        keys: MetadataKeys,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let hosts = hosts
            .into_iter()
            .map(|(collection, host)| (collection, normalize_host(&host)))
            .collect();
        Ok(Self {
            client: http_client()?,
            api_key,
            hosts,
            keys,
            embedder,
            embeddings: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBEDDING_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    /// Collections this index can serve
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosts.keys().cloned().collect();
        names.sort();
        names
    }

    async fn embedding(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        let cell = {
            let mut cache = self.embeddings.lock().await;
            match cache.get(text) {
                Some(cell) => cell.clone(),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    cache.put(text.to_string(), cell.clone());
                    cell
                }
            }
        };
        // A failed embed leaves the cell empty, so the next lookup retries
        let vector = cell
            .get_or_try_init(|| async { self.embedder.embed(text).await.map(Arc::new) })
            .await?;
        Ok(vector.clone())
    }

    fn to_matches(&self, response: QueryResponse) -> Vec<IndexMatch> {
        response
            .matches
            .into_iter()
            .filter_map(|m| {
                let metadata = m.metadata.unwrap_or_default();
                let field = |key: &str| {
                    metadata
                        .get(key)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                let Some(text) = field(&self.keys.text) else {
                    debug!("Skipping match {} without '{}' metadata", m.id, self.keys.text);
                    return None;
                };
                Some(IndexMatch {
                    url: field(&self.keys.url),
                    title: field(&self.keys.title),
                    id: m.id,
                    text,
                    score: m.score,
                })
            })
            .collect()
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<IndexMatch>> {
        let host = self
            .hosts
            .get(&query.partition.collection)
            .ok_or_else(|| anyhow!("No index host for collection '{}'", query.partition.collection))?;

        let vector = self.embedding(&query.text).await?;
        let body = serde_json::json!({
            "namespace": query.partition.namespace,
            "vector": vector.as_slice(),
            "topK": query.k,
            "includeMetadata": true,
        });

        debug!("Pinecone query: partition={}, k={}", query.partition, query.k);

        let response = self
            .client
            .post(format!("{}/query", host))
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send Pinecone query")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Pinecone query failed with status {}: {}",
                status,
                error_text
            ));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .context("Failed to parse Pinecone response")?;
        Ok(self.to_matches(parsed))
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

// ── Pinecone wire types ──

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    score: f32,
    metadata: Option<serde_json::Map<String, Value>>,
}
