//! Scripted providers, indexes and channels for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::index::{IndexMatch, VectorIndex};
use crate::providers::{FragmentStream, LlmProvider};
use crate::types::{
    Determinism, GenerationRequest, ModelDescriptor, PipelineEvent, RetrievalQuery, SizeClass,
};

/// What a scripted model does when called
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Stream these fragments, then end
    Fragments(Vec<String>),
    /// Fail before producing anything
    Fail(ProviderError),
    /// Stream these fragments, then fail
    FailAfter(Vec<String>, ProviderError),
    /// Stream these fragments, then go silent
    Stall(Vec<String>),
    /// Stream numbered fragments forever
    Endless,
    /// Never answer
    Hang,
}

pub fn fragments(parts: &[&str]) -> Behavior {
    Behavior::Fragments(parts.iter().map(|s| s.to_string()).collect())
}

/// Provider whose per-model behavior is scripted by the test
pub struct ScriptedProvider {
    name: String,
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with(self, model: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(model.to_string(), behavior);
        self
    }

    /// Models called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of streams that have been dropped or finished
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn behavior(&self, request: &GenerationRequest) -> Behavior {
        self.calls.lock().unwrap().push(request.model.model.clone());
        self.behaviors
            .lock()
            .unwrap()
            .get(&request.model.model)
            .cloned()
            .unwrap_or_else(|| fragments(&["ok"]))
    }
}

struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        match self.behavior(request) {
            Behavior::Fragments(parts) | Behavior::Stall(parts) => Ok(parts.concat()),
            Behavior::Fail(e) | Behavior::FailAfter(_, e) => Err(e),
            Behavior::Endless | Behavior::Hang => futures::future::pending().await,
        }
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError> {
        let behavior = self.behavior(request);
        let released = self.released.clone();
        let fragments = match behavior {
            Behavior::Fail(e) => return Err(e),
            Behavior::Hang => futures::future::pending().await,
            Behavior::Fragments(parts) => {
                let s = stream! {
                    let _guard = ReleaseGuard(released);
                    for part in parts {
                        yield Ok(part);
                    }
                };
                s.boxed()
            }
            Behavior::FailAfter(parts, e) => {
                let s = stream! {
                    let _guard = ReleaseGuard(released);
                    for part in parts {
                        yield Ok(part);
                    }
                    yield Err(e);
                };
                s.boxed()
            }
            Behavior::Stall(parts) => {
                let s = stream! {
                    let _guard = ReleaseGuard(released);
                    for part in parts {
                        yield Ok(part);
                    }
                    futures::future::pending::<()>().await;
                };
                s.boxed()
            }
            Behavior::Endless => {
                let s = stream! {
                    let _guard = ReleaseGuard(released);
                    let mut n = 0u64;
                    loop {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        yield Ok(format!("t{} ", n));
                        n += 1;
                    }
                };
                s.boxed()
            }
        };
        Ok(fragments)
    }
}

pub fn small(provider: &str, model: &str, priority: u32) -> ModelDescriptor {
    ModelDescriptor::new(provider, model, SizeClass::Small, Determinism::NonDeterministic, priority)
}

pub fn small_deterministic(provider: &str, model: &str, priority: u32) -> ModelDescriptor {
    ModelDescriptor::new(provider, model, SizeClass::Small, Determinism::Deterministic, priority)
}

/// Index with canned results per `collection:namespace`
#[derive(Default)]
pub struct ScriptedIndex {
    results: HashMap<String, Result<Vec<IndexMatch>, String>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, partition: &str, matches: Vec<IndexMatch>) -> Self {
        self.results.insert(partition.to_string(), Ok(matches));
        self
    }

    pub fn failing(mut self, partition: &str, message: &str) -> Self {
        self.results
            .insert(partition.to_string(), Err(message.to_string()));
        self
    }

    pub fn delayed(mut self, partition: &str, delay: Duration) -> Self {
        self.delays.insert(partition.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorIndex for ScriptedIndex {
    async fn query(&self, query: &RetrievalQuery) -> anyhow::Result<Vec<IndexMatch>> {
        let key = query.partition.to_string();
        self.calls.lock().unwrap().push(key.clone());
        if let Some(delay) = self.delays.get(&key) {
            tokio::time::sleep(*delay).await;
        }
        match self.results.get(&key) {
            Some(Ok(matches)) => Ok(matches.clone()),
            Some(Err(message)) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(Vec::new()),
        }
    }
}

pub fn doc(id: &str, score: f32) -> IndexMatch {
    IndexMatch {
        id: id.to_string(),
        text: format!("text of {}", id),
        score,
        url: None,
        title: None,
    }
}

/// Drain every event already sent to a closed channel
pub async fn drain(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
