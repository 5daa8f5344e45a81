//! Model router with sequential fallback across providers
//!
//! Candidates come from the registry, filtered by the health tracker. They
//! are tried strictly one at a time; the first success wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::{Outcome, PipelineError, ProviderError};
use crate::health::HealthTracker;
use crate::providers::{FragmentStream, LlmProvider};
use crate::registry::ProviderRegistry;
use crate::types::{Determinism, GenerationRequest, ModelDescriptor, Prompt, SizeClass};

/// Which tier of the registry to draw candidates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub size: SizeClass,
    pub premium_allowed: bool,
    pub determinism: Determinism,
}

impl RouteSpec {
    /// Free-form answer generation
    pub fn answer(size: SizeClass, premium_allowed: bool) -> Self {
        Self {
            size,
            premium_allowed,
            determinism: Determinism::NonDeterministic,
        }
    }

    /// Structured calls such as reranking. Never premium.
    pub fn rerank(size: SizeClass) -> Self {
        Self {
            size,
            premium_allowed: false,
            determinism: Determinism::Deterministic,
        }
    }
}

/// One candidate that failed before the chain found a winner
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub model: ModelDescriptor,
    pub outcome: Outcome,
    pub error: ProviderError,
}

/// A streaming call that has produced its first fragment
pub struct Generation {
    pub model: ModelDescriptor,
    pub failed_attempts: Vec<AttemptFailure>,
    pub fragments: FragmentStream,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("model", &self.model.label())
            .field("failed_attempts", &self.failed_attempts.len())
            .finish()
    }
}

/// A finished non-streaming call
#[derive(Debug, Clone)]
pub struct Completion {
    pub model: ModelDescriptor,
    pub failed_attempts: Vec<AttemptFailure>,
    pub text: String,
}

enum ChainState<T> {
    Attempting(usize),
    Succeeded(usize, T),
    Exhausted,
}

/// Routes generation requests along a fallback chain
pub struct ModelRouter {
    registry: Arc<ProviderRegistry>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    health: Arc<HealthTracker>,
    call_timeout: Duration,
}

impl ModelRouter {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Every registry descriptor must name a provider with an adapter
    pub fn new(
        registry: Arc<ProviderRegistry>,
        providers: Vec<Arc<dyn LlmProvider>>,
        health: Arc<HealthTracker>,
    ) -> Result<Self, PipelineError> {
        let providers: HashMap<String, Arc<dyn LlmProvider>> = providers
            .into_iter()
            .map(|p| (p.provider_name().to_string(), p))
            .collect();

        if let Some(orphan) = registry
            .models()
            .iter()
            .find(|m| !providers.contains_key(&m.provider))
        {
            return Err(PipelineError::Configuration(format!(
                "model {} names provider '{}' which is not configured",
                orphan.label(),
                orphan.provider
            )));
        }

        Ok(Self {
            registry,
            providers,
            health,
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Bound on each attempt and on each later fragment read
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// The chain that would be tried right now. Unavailable providers are
    /// skipped unless that leaves nothing, in which case all are tried.
    pub fn candidates(&self, route: RouteSpec) -> Result<Vec<ModelDescriptor>, PipelineError> {
        let all = self
            .registry
            .list_candidates(route.size, route.premium_allowed, route.determinism)?;
        let available: Vec<ModelDescriptor> = all
            .iter()
            .filter(|m| self.health.is_available(&m.provider))
            .cloned()
            .collect();

        if available.is_empty() {
            warn!(
                "All {} {} {} candidates are unavailable, trying the full chain",
                all.len(),
                route.size,
                route.determinism
            );
            Ok(all)
        } else {
            Ok(available)
        }
    }

    /// Stream an answer from the first candidate that produces output
    pub async fn select_and_generate(
        &self,
        route: RouteSpec,
        prompt: &Prompt,
    ) -> Result<Generation, PipelineError> {
        let (model, failed_attempts, (first, rest)) = self
            .run_chain(route, prompt, |provider, request| async move {
                let mut fragments = match provider.stream(&request).await {
                    Ok(fragments) => fragments,
                    Err(e) => return Err(e),
                };
                match fragments.next().await {
                    Some(Ok(first)) => Ok((Some(first), fragments)),
                    Some(Err(e)) => Err(e),
                    None => Ok((None, fragments)),
                }
            })
            .await?;

        let fragments = self.supervise(model.clone(), first, rest);
        Ok(Generation {
            model,
            failed_attempts,
            fragments,
        })
    }

    /// Full completion from the first candidate that answers
    pub async fn complete(
        &self,
        route: RouteSpec,
        prompt: &Prompt,
    ) -> Result<Completion, PipelineError> {
        let (model, failed_attempts, text) = self
            .run_chain(route, prompt, |provider, request| async move {
                provider.complete(&request).await
            })
            .await?;
        Ok(Completion {
            model,
            failed_attempts,
            text,
        })
    }

    async fn run_chain<T, F, Fut>(
        &self,
        route: RouteSpec,
        prompt: &Prompt,
        attempt: F,
    ) -> Result<(ModelDescriptor, Vec<AttemptFailure>, T), PipelineError>
    where
        F: Fn(Arc<dyn LlmProvider>, GenerationRequest) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let candidates = self.candidates(route)?;
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut state = ChainState::Attempting(0);

        loop {
            state = match state {
                ChainState::Attempting(idx) if idx >= candidates.len() => ChainState::Exhausted,
                ChainState::Attempting(idx) => {
                    let model = &candidates[idx];
                    debug!(
                        "Trying {} ({}/{})",
                        model.label(),
                        idx + 1,
                        candidates.len()
                    );

                    let result = match self.providers.get(&model.provider) {
                        Some(provider) => {
                            let request = GenerationRequest::new(model.clone(), prompt.clone());
                            tokio::time::timeout(
                                self.call_timeout,
                                attempt(provider.clone(), request),
                            )
                            .await
                            .unwrap_or_else(|_| Err(ProviderError::Timeout(self.call_timeout)))
                        }
                        None => Err(ProviderError::Fatal(format!(
                            "no adapter for provider '{}'",
                            model.provider
                        ))),
                    };

                    match result {
                        Ok(value) => {
                            self.health.report_outcome(&model.provider, Outcome::Success);
                            if idx > 0 {
                                info!("Request succeeded on fallback {}", model.label());
                            }
                            ChainState::Succeeded(idx, value)
                        }
                        Err(e) => {
                            let outcome = e.outcome();
                            warn!("{} failed ({:?}): {}", model.label(), outcome, e);
                            self.health.report_outcome(&model.provider, outcome);
                            failures.push(AttemptFailure {
                                model: model.clone(),
                                outcome,
                                error: e,
                            });
                            if let Some(next) = candidates.get(idx + 1) {
                                info!("Failing over from {} to {}", model.label(), next.label());
                            }
                            ChainState::Attempting(idx + 1)
                        }
                    }
                }
                ChainState::Succeeded(idx, value) => {
                    return Ok((candidates[idx].clone(), failures, value));
                }
                ChainState::Exhausted => {
                    let last_error = failures
                        .last()
                        .map(|f| f.error.to_string())
                        .unwrap_or_else(|| "no candidate was tried".to_string());
                    error!(
                        "All {} candidates failed, last error: {}",
                        failures.len(),
                        last_error
                    );
                    return Err(PipelineError::AllProvidersExhausted {
                        attempts: failures.len(),
                        last_error,
                    });
                }
            };
        }
    }

    /// Re-yield the first fragment, then bound each later read by the call
    /// timeout and report mid-stream failures to the health tracker.
    fn supervise(
        &self,
        model: ModelDescriptor,
        first: Option<String>,
        mut rest: FragmentStream,
    ) -> FragmentStream {
        let health = self.health.clone();
        let idle = self.call_timeout;
        let supervised = stream! {
            let ended = first.is_none();
            if let Some(first) = first {
                yield Ok(first);
            }
            if !ended {
                loop {
                    let failure = match tokio::time::timeout(idle, rest.next()).await {
                        Ok(Some(Ok(fragment))) => {
                            yield Ok(fragment);
                            continue;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(e))) => e,
                        Err(_) => ProviderError::Timeout(idle),
                    };
                    warn!("{} failed mid-stream: {}", model.label(), failure);
                    health.report_outcome(&model.provider, failure.outcome());
                    yield Err(failure);
                    break;
                }
            }
        };
        supervised.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::testing::{Behavior, ScriptedProvider, fragments, small, small_deterministic};

    fn prompt() -> Prompt {
        Prompt::new("system", "question")
    }

    fn router(
        models: Vec<ModelDescriptor>,
        providers: Vec<Arc<ScriptedProvider>>,
    ) -> (ModelRouter, Arc<HealthTracker>) {
        let registry = Arc::new(ProviderRegistry::new(models));
        let health = Arc::new(HealthTracker::new(registry.providers()));
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn LlmProvider>)
            .collect();
        let router = ModelRouter::new(registry, providers, health.clone()).unwrap();
        (router, health)
    }

    async fn collect(generation: Generation) -> Vec<Result<String, ProviderError>> {
        generation.fragments.collect().await
    }

    #[tokio::test]
    async fn test_first_candidate_wins() {
        let a = Arc::new(ScriptedProvider::new("a").with("m1", fragments(&["Hello", " there"])));
        let b = Arc::new(ScriptedProvider::new("b"));
        let (router, _) = router(vec![small("a", "m1", 0), small("b", "m2", 1)], vec![a.clone(), b.clone()]);

        let generation = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap();
        assert_eq!(generation.model.label(), "a/m1");
        assert!(generation.failed_attempts.is_empty());

        let parts: Vec<String> = collect(generation).await.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(parts, vec!["Hello", " there"]);
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn test_n_minus_one_failures_then_success() {
        let p1 = Arc::new(
            ScriptedProvider::new("p1")
                .with("m1", Behavior::Fail(ProviderError::Transient("503".into()))),
        );
        let p2 = Arc::new(
            ScriptedProvider::new("p2").with("m2", Behavior::Fail(ProviderError::Fatal("401".into()))),
        );
        let p3 = Arc::new(ScriptedProvider::new("p3").with("m3", fragments(&["third"])));
        let (router, health) = router(
            vec![small("p1", "m1", 0), small("p2", "m2", 1), small("p3", "m3", 2)],
            vec![p1.clone(), p2.clone(), p3.clone()],
        );

        let generation = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap();
        assert_eq!(generation.model.label(), "p3/m3");
        assert_eq!(generation.failed_attempts.len(), 2);
        assert_eq!(generation.failed_attempts[0].outcome, Outcome::TransientFailure);
        assert_eq!(generation.failed_attempts[1].outcome, Outcome::FatalFailure);
        assert_eq!(p1.calls(), vec!["m1"]);
        assert_eq!(p2.calls(), vec!["m2"]);
        assert_eq!(p3.calls(), vec!["m3"]);

        let parts: Vec<String> = collect(generation).await.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(parts, vec!["third"]);

        // every failed attempt lands on its own provider
        let snap = health.snapshot();
        let by_name = |name: &str| snap.iter().find(|h| h.provider == name).unwrap().clone();
        let first = by_name("p1");
        assert_eq!(first.last_outcome, Some(Outcome::TransientFailure));
        assert_eq!(first.status, HealthStatus::Failing);
        assert_eq!(health.status("p1"), HealthStatus::Failing);

        let second = by_name("p2");
        assert_eq!(second.last_outcome, Some(Outcome::FatalFailure));
        assert_eq!(second.status, HealthStatus::Available);
        assert!(health.is_available("p2"));

        let third = by_name("p3");
        assert_eq!(third.last_outcome, Some(Outcome::Success));
        assert_eq!(third.status, HealthStatus::Available);
    }

    #[tokio::test]
    async fn test_rate_limited_provider_skipped_next_time() {
        let p1 = Arc::new(
            ScriptedProvider::new("p1")
                .with("fast", Behavior::Fail(ProviderError::RateLimited("429".into()))),
        );
        let p2 = Arc::new(ScriptedProvider::new("p2").with("backup", fragments(&["from p2"])));
        let (router, health) = router(
            vec![small("p1", "fast", 0), small("p2", "backup", 1)],
            vec![p1.clone(), p2.clone()],
        );
        let route = RouteSpec::answer(SizeClass::Small, false);

        let first = router.select_and_generate(route, &prompt()).await.unwrap();
        assert_eq!(first.model.provider, "p2");
        assert_eq!(health.status("p1"), HealthStatus::RateLimited);
        assert_eq!(health.status("p2"), HealthStatus::Available);

        // within the cool-down p1 is not attempted at all
        let second = router.select_and_generate(route, &prompt()).await.unwrap();
        assert_eq!(second.model.provider, "p2");
        assert!(second.failed_attempts.is_empty());
        assert_eq!(p1.calls().len(), 1);
        assert_eq!(p2.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_all_unavailable_tries_full_chain() {
        let p1 = Arc::new(ScriptedProvider::new("p1").with("a", fragments(&["recovered"])));
        let p2 = Arc::new(ScriptedProvider::new("p2"));
        let (router, health) = router(
            vec![small("p1", "a", 0), small("p2", "b", 1)],
            vec![p1.clone(), p2],
        );
        health.report_outcome("p1", Outcome::RateLimited);
        health.report_outcome("p2", Outcome::TransientFailure);

        let generation = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap();
        assert_eq!(generation.model.provider, "p1");
        assert!(health.is_available("p1"));
        assert_eq!(p1.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_all_candidates_exhausted() {
        let p = Arc::new(
            ScriptedProvider::new("p")
                .with("m1", Behavior::Fail(ProviderError::Fatal("bad key".into())))
                .with("m2", Behavior::Fail(ProviderError::RateLimited("slow down".into()))),
        );
        let (router, _) = router(vec![small("p", "m1", 0), small("p", "m2", 1)], vec![p]);

        let err = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap_err();
        match err {
            PipelineError::AllProvidersExhausted { attempts, last_error } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("slow down"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_tier_fails_before_any_call() {
        let p = Arc::new(ScriptedProvider::new("p"));
        let (router, _) = router(vec![small("p", "m1", 0)], vec![p.clone()]);

        let err = router
            .select_and_generate(RouteSpec::answer(SizeClass::Large, false), &prompt())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(p.calls().is_empty());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let registry = Arc::new(ProviderRegistry::new(vec![small("ghost", "m", 0)]));
        let health = Arc::new(HealthTracker::new(registry.providers()));
        let result = ModelRouter::new(registry, vec![], health);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_hanging_attempt_times_out_as_transient() {
        let slow = Arc::new(ScriptedProvider::new("slow").with("m1", Behavior::Hang));
        let fast = Arc::new(ScriptedProvider::new("fast").with("m2", fragments(&["quick"])));
        let (router, health) = router(
            vec![small("slow", "m1", 0), small("fast", "m2", 1)],
            vec![slow, fast],
        );
        let router = router.with_call_timeout(Duration::from_millis(30));

        let generation = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap();
        assert_eq!(generation.model.provider, "fast");
        assert!(matches!(
            generation.failed_attempts[0].error,
            ProviderError::Timeout(_)
        ));
        assert_eq!(health.status("slow"), HealthStatus::Failing);
    }

    #[tokio::test]
    async fn test_failure_before_first_fragment_falls_back() {
        let flaky = Arc::new(ScriptedProvider::new("flaky").with(
            "m1",
            Behavior::FailAfter(vec![], ProviderError::Transient("reset".into())),
        ));
        let steady = Arc::new(ScriptedProvider::new("steady").with("m2", fragments(&["fine"])));
        let (router, _) = router(
            vec![small("flaky", "m1", 0), small("steady", "m2", 1)],
            vec![flaky, steady],
        );

        let generation = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap();
        assert_eq!(generation.model.provider, "steady");
        assert_eq!(generation.failed_attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_reported() {
        let p = Arc::new(ScriptedProvider::new("p").with(
            "m1",
            Behavior::FailAfter(vec!["partial".into()], ProviderError::Transient("reset".into())),
        ));
        let (router, health) = router(vec![small("p", "m1", 0)], vec![p]);

        let generation = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap();
        // success is recorded once the first fragment arrives
        assert!(health.is_available("p"));

        let items = collect(generation).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "partial");
        assert!(items[1].is_err());
        assert_eq!(health.status("p"), HealthStatus::Failing);
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let p = Arc::new(ScriptedProvider::new("p").with("m1", Behavior::Stall(vec!["a".into()])));
        let (router, _) = router(vec![small("p", "m1", 0)], vec![p]);
        let router = router.with_call_timeout(Duration::from_millis(30));

        let generation = router
            .select_and_generate(RouteSpec::answer(SizeClass::Small, false), &prompt())
            .await
            .unwrap();
        let items = collect(generation).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ProviderError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_complete_uses_deterministic_tier() {
        let p = Arc::new(
            ScriptedProvider::new("p")
                .with("creative", fragments(&["wrong tier"]))
                .with("exact", fragments(&["{\"selected\":[0]}"])),
        );
        let (router, _) = router(
            vec![small("p", "creative", 0), small_deterministic("p", "exact", 0)],
            vec![p.clone()],
        );

        let completion = router
            .complete(RouteSpec::rerank(SizeClass::Small), &prompt())
            .await
            .unwrap();
        assert_eq!(completion.model.model, "exact");
        assert_eq!(completion.text, "{\"selected\":[0]}");
        assert_eq!(p.calls(), vec!["exact"]);
    }
}
