//! The answer pipeline: retrieve, rerank, route, stream

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::{OutputChannel, StreamDispatcher};
use crate::error::PipelineError;
use crate::prompt::answer_prompt;
use crate::rerank::Reranker;
use crate::retrieval::Retriever;
use crate::router::{ModelRouter, RouteSpec};
use crate::types::{Determinism, Partition, RetrievedDocument, SizeClass};

fn default_top_k() -> usize {
    5
}

fn default_max_sources() -> usize {
    6
}

fn default_rerank_size() -> SizeClass {
    SizeClass::Small
}

/// Request-independent pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Documents kept per partition
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Documents kept after reranking
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_rerank_size")]
    pub rerank_size: SizeClass,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_sources: default_max_sources(),
            rerank_size: default_rerank_size(),
        }
    }
}

/// One question to answer
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub id: String,
    pub question: String,
    pub partitions: Vec<Partition>,
    pub size: SizeClass,
    pub premium: bool,
    pub top_k: Option<usize>,
    pub max_sources: Option<usize>,
}

impl AnswerRequest {
    pub fn new(question: impl Into<String>, partitions: Vec<Partition>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            question: question.into(),
            partitions,
            size: SizeClass::Small,
            premium: false,
            top_k: None,
            max_sources: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_size(mut self, size: SizeClass) -> Self {
        self.size = size;
        self
    }

    pub fn with_premium(mut self, premium: bool) -> Self {
        self.premium = premium;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_max_sources(mut self, max_sources: usize) -> Self {
        self.max_sources = Some(max_sources);
        self
    }
}

/// What the caller saw, for logging and the CLI
#[derive(Debug, Clone, Serialize)]
pub struct AnswerSummary {
    pub request_id: String,
    pub model: String,
    pub text: String,
    pub chunks: u64,
    pub sources: usize,
    pub failed_attempts: usize,
    /// Mid-stream failure; the partial text was still delivered
    pub error: Option<String>,
}

pub struct AnswerPipeline {
    retriever: Retriever,
    reranker: Reranker,
    router: Arc<ModelRouter>,
    config: PipelineConfig,
}

impl AnswerPipeline {
    /// Fails if the registry cannot serve reranking or standard answers
    pub fn new(
        retriever: Retriever,
        router: Arc<ModelRouter>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let registry = router.registry();
        registry.list_candidates(config.rerank_size, false, Determinism::Deterministic)?;
        registry.list_candidates(SizeClass::Small, false, Determinism::NonDeterministic)?;

        Ok(Self {
            reranker: Reranker::new(router.clone(), config.rerank_size),
            retriever,
            router,
            config,
        })
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer one question, streaming events to `channel`.
    ///
    /// Every failure is also delivered to the channel as a terminal error
    /// event. A failure after streaming began is not an `Err`; it is recorded
    /// in the summary.
    pub async fn answer(
        &self,
        request: &AnswerRequest,
        channel: &dyn OutputChannel,
        cancel: CancellationToken,
    ) -> Result<AnswerSummary, PipelineError> {
        info!(
            "Answering {} ({} partitions, size={}, premium={})",
            request.id,
            request.partitions.len(),
            request.size,
            request.premium
        );
        let dispatcher = StreamDispatcher::new(request.id.clone(), channel, cancel.clone());

        // A tier with no models fails before any index or model call
        let route = RouteSpec::answer(request.size, request.premium);
        if let Err(e) = self.router.registry().list_candidates(
            route.size,
            route.premium_allowed,
            route.determinism,
        ) {
            return Err(fail(dispatcher, e).await);
        }

        let sources = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            sources = self.sources(request) => sources,
        };
        let sources = match sources {
            Ok(sources) => sources,
            Err(e) => return Err(fail(dispatcher, e).await),
        };
        let source_count = sources.len();

        let prompt = answer_prompt(&request.question, &sources);
        if dispatcher.sources_ready(sources).await.is_err() {
            if cancel.is_cancelled() {
                return Err(fail(dispatcher, PipelineError::Cancelled).await);
            }
            return Err(PipelineError::Cancelled);
        }

        let generation = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            generation = self.router.select_and_generate(route, &prompt) => generation,
        };
        let generation = match generation {
            Ok(generation) => generation,
            Err(e) => return Err(fail(dispatcher, e).await),
        };

        let model = generation.model;
        let failed_attempts = generation.failed_attempts.len();
        let report = dispatcher.relay(generation.fragments, &model).await;
        if report.cancelled {
            info!("Request {} cancelled after {} chunks", request.id, report.chunks);
            return Err(PipelineError::Cancelled);
        }

        if let Some(error) = &report.error {
            warn!("Request {} ended early on {}: {}", request.id, model.label(), error);
        } else {
            info!(
                "Request {} answered by {} in {} chunks",
                request.id,
                model.label(),
                report.chunks
            );
        }

        Ok(AnswerSummary {
            request_id: request.id.clone(),
            model: model.label(),
            text: report.text,
            chunks: report.chunks,
            sources: source_count,
            failed_attempts,
            error: report.error,
        })
    }

    /// Retrieve across the requested partitions, then rerank
    async fn sources(&self, request: &AnswerRequest) -> Result<Vec<RetrievedDocument>, PipelineError> {
        let top_k = request.top_k.unwrap_or(self.config.top_k);
        let max_sources = request.max_sources.unwrap_or(self.config.max_sources);

        let retrieved = self
            .retriever
            .retrieve(&request.question, &request.partitions, top_k)
            .await?;
        let candidates = retrieved.merged();
        Ok(self
            .reranker
            .rerank(&request.question, candidates, max_sources)
            .await)
    }
}

/// Deliver a terminal error event, then hand the error back
async fn fail(dispatcher: StreamDispatcher<'_>, error: PipelineError) -> PipelineError {
    warn!("Request failed: {}", error);
    if dispatcher.fail(&error.to_string()).await.is_err() {
        warn!("Could not deliver failure, channel closed");
    }
    error
}
