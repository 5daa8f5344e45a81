//! Concurrent retrieval across party partitions

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::index::VectorIndex;
use crate::types::{Partition, RetrievalQuery, RetrievedDocument};

/// A sub-query that produced no documents because it failed
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFailure {
    pub partition: Partition,
    pub error: String,
}

/// Per-partition retrieval output
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Every requested partition has an entry; failed ones are empty
    pub documents: BTreeMap<Partition, Vec<RetrievedDocument>>,
    pub failures: Vec<PartitionFailure>,
}

impl RetrievalResult {
    /// All partitions flattened, best score first. Ties keep partition order.
    pub fn merged(&self) -> Vec<RetrievedDocument> {
        let mut all: Vec<RetrievedDocument> = self.documents.values().flatten().cloned().collect();
        all.sort_by(|a, b| b.score.total_cmp(&a.score));
        all
    }

    pub fn total(&self) -> usize {
        self.documents.values().map(Vec::len).sum()
    }
}

pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    timeout: Duration,
}

impl Retriever {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self {
            index,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query every partition concurrently, keeping up to `k` documents each.
    ///
    /// A failed or timed-out partition yields an empty entry and is recorded.
    /// Fails only when there is nothing to query or every query failed.
    pub async fn retrieve(
        &self,
        query_text: &str,
        partitions: &[Partition],
        k: usize,
    ) -> Result<RetrievalResult, PipelineError> {
        let unique: BTreeSet<&Partition> = partitions.iter().collect();
        if unique.is_empty() {
            return Err(PipelineError::Retrieval(
                "no partitions to query".to_string(),
            ));
        }

        debug!("Retrieving k={} from {} partitions", k, unique.len());

        let queries = unique.into_iter().map(|partition| {
            let query = RetrievalQuery {
                partition: partition.clone(),
                text: query_text.to_string(),
                k,
            };
            async move {
                let result = match tokio::time::timeout(self.timeout, self.index.query(&query)).await {
                    Ok(Ok(matches)) => Ok(matches),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(_) => Err(format!("timed out after {:?}", self.timeout)),
                };
                (query.partition, result)
            }
        });

        let mut result = RetrievalResult::default();
        for (partition, outcome) in join_all(queries).await {
            let documents = match outcome {
                Ok(matches) => {
                    let mut documents: Vec<RetrievedDocument> = matches
                        .into_iter()
                        .map(|m| m.into_document(&partition))
                        .collect();
                    // stable: equal scores keep index order
                    documents.sort_by(|a, b| b.score.total_cmp(&a.score));
                    documents.truncate(k);
                    documents
                }
                Err(error) => {
                    warn!("Retrieval from {} failed: {}", partition, error);
                    result.failures.push(PartitionFailure {
                        partition: partition.clone(),
                        error,
                    });
                    Vec::new()
                }
            };
            result.documents.insert(partition, documents);
        }

        if result.failures.len() == result.documents.len() {
            let detail = result
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.partition, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::Retrieval(format!(
                "all {} partitions failed ({})",
                result.failures.len(),
                detail
            )));
        }

        Ok(result)
    }
}
