//! Model-based reranking of retrieved documents

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::prompt::rerank_prompt;
use crate::router::{ModelRouter, RouteSpec};
use crate::types::{RetrievedDocument, SizeClass};

/// Picks the most relevant subset of candidates with a deterministic model.
/// Degrades to similarity order instead of failing.
pub struct Reranker {
    router: Arc<ModelRouter>,
    size: SizeClass,
}

impl Reranker {
    pub fn new(router: Arc<ModelRouter>, size: SizeClass) -> Self {
        Self { router, size }
    }

    pub fn route(&self) -> RouteSpec {
        RouteSpec::rerank(self.size)
    }

    /// At most `max_selected` of `candidates`, most relevant first
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<RetrievedDocument>,
        max_selected: usize,
    ) -> Vec<RetrievedDocument> {
        if max_selected == 0 || candidates.is_empty() {
            return Vec::new();
        }
        if candidates.len() == 1 {
            return candidates;
        }

        let prompt = rerank_prompt(query, &candidates, max_selected);
        let selection = match self.router.complete(self.route(), &prompt).await {
            Ok(completion) => {
                let parsed = parse_selection(&completion.text, candidates.len(), max_selected);
                if parsed.is_none() {
                    warn!(
                        "Unusable rerank output from {}, keeping similarity order",
                        completion.model.label()
                    );
                }
                parsed
            }
            Err(e) => {
                warn!("Rerank call failed, keeping similarity order: {}", e);
                None
            }
        };

        match selection {
            Some(indices) => {
                debug!("Reranker selected {:?} of {}", indices, candidates.len());
                let mut slots: Vec<Option<RetrievedDocument>> =
                    candidates.into_iter().map(Some).collect();
                indices
                    .into_iter()
                    .filter_map(|i| slots.get_mut(i).and_then(Option::take))
                    .collect()
            }
            None => {
                candidates.truncate(max_selected);
                candidates
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Selection {
    selected: Vec<Value>,
}

/// Valid, distinct candidate indices from a `{"selected": [...]}` reply.
/// Surrounding prose and code fences are ignored. `None` when nothing usable.
pub(crate) fn parse_selection(text: &str, count: usize, max_selected: usize) -> Option<Vec<usize>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let selection: Selection = serde_json::from_str(&text[start..=end]).ok()?;

    let mut seen = HashSet::new();
    let indices: Vec<usize> = selection
        .selected
        .iter()
        .filter_map(Value::as_u64)
        .filter_map(|i| usize::try_from(i).ok())
        .filter(|&i| i < count && seen.insert(i))
        .take(max_selected)
        .collect();

    if indices.is_empty() { None } else { Some(indices) }
}
