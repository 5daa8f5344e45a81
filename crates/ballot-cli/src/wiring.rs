//! Assemble the answer pipeline from configuration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ballot_core::{
    AnswerPipeline, AzureOpenAiProvider, GoogleProvider, HealthTracker, LlmProvider, MetadataKeys,
    ModelRouter, OpenAiCompatProvider, OpenAiEmbedder, OpenAiProvider, PineconeIndex,
    ProviderRegistry, Retriever,
};
use tracing::{debug, info};

use crate::config::BallotConfig;

/// One adapter per configured provider section
pub fn build_providers(cfg: &BallotConfig) -> Result<Vec<Arc<dyn LlmProvider>>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();

    if let Some(p) = &cfg.providers.openai {
        let provider = OpenAiProvider::new(p.api_key.clone(), p.base_url.clone(), p.max_tokens)
            .context("Failed to create OpenAI provider")?;
        providers.push(Arc::new(provider));
    }
    if let Some(p) = &cfg.providers.azure {
        let provider = AzureOpenAiProvider::new(
            p.api_key.clone(),
            p.endpoint.clone(),
            p.api_version.clone(),
            p.max_tokens,
        )
        .context("Failed to create Azure OpenAI provider")?;
        providers.push(Arc::new(provider));
    }
    if let Some(p) = &cfg.providers.google {
        let provider = GoogleProvider::new(p.api_key.clone(), p.base_url.clone(), p.max_tokens)
            .context("Failed to create Google provider")?;
        providers.push(Arc::new(provider));
    }
    if let Some(p) = &cfg.providers.perplexity {
        let provider = OpenAiCompatProvider::new(
            "perplexity".to_string(),
            p.api_key.clone(),
            p.base_url.clone(),
            p.max_tokens,
        )
        .context("Failed to create Perplexity provider")?;
        providers.push(Arc::new(provider));
    }

    for provider in &providers {
        debug!("Configured provider {}", provider.provider_name());
    }
    Ok(providers)
}

pub fn build_router(cfg: &BallotConfig) -> Result<ModelRouter> {
    let registry = Arc::new(ProviderRegistry::new(cfg.models.clone()));
    let health = Arc::new(
        HealthTracker::new(registry.providers())
            .with_cooldown(Duration::from_secs(cfg.health.cooldown_secs)),
    );
    let router = ModelRouter::new(registry, build_providers(cfg)?, health)?
        .with_call_timeout(Duration::from_secs(cfg.pipeline.call_timeout_secs));
    Ok(router)
}

pub fn build_index(cfg: &BallotConfig) -> Result<PineconeIndex> {
    let embedding = &cfg.index.embedding;
    let embed_key = if embedding.api_key.is_empty() {
        cfg.providers
            .openai
            .as_ref()
            .map(|p| p.api_key.clone())
            .unwrap_or_default()
    } else {
        embedding.api_key.clone()
    };
    let embedder = OpenAiEmbedder::new(embed_key, embedding.base_url.clone(), embedding.model.clone())
        .context("Failed to create embedder")?;

    let keys = MetadataKeys {
        text: cfg.index.text_key.clone(),
        url: cfg.index.url_key.clone(),
        title: cfg.index.title_key.clone(),
    };
    PineconeIndex::new(
        cfg.index.api_key.clone(),
        cfg.index.hosts.clone(),
        keys,
        Arc::new(embedder),
    )
    .context("Failed to create Pinecone index")
}

pub fn build_pipeline(cfg: &BallotConfig) -> Result<Arc<AnswerPipeline>> {
    let router = Arc::new(build_router(cfg)?);
    let retriever = Retriever::new(Arc::new(build_index(cfg)?))
        .with_timeout(Duration::from_secs(cfg.pipeline.retrieval_timeout_secs));
    let pipeline = AnswerPipeline::new(retriever, router, cfg.pipeline.core.clone())?;
    info!(
        "Pipeline ready: {} models across {} providers",
        cfg.models.len(),
        pipeline.router().registry().providers().len()
    );
    Ok(Arc::new(pipeline))
}
