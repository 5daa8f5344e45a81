//! Provider health tracking
//!
//! Records which providers are currently rate-limited or failing so the router
//! can skip them. Shared by every in-flight request; all mutation happens
//! behind per-provider map entries, so callers never hold a lock.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::Outcome;

/// Routing-relevant state of one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Available,
    RateLimited,
    /// Unavailable after a transient failure (5xx, timeout, broken stream)
    Failing,
}

/// Current health of one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    /// Time of the last status transition
    pub since: DateTime<Utc>,
    pub last_outcome: Option<Outcome>,
    #[serde(skip)]
    cooldown_until: Option<Instant>,
}

/// A status change, published to telemetry subscribers
#[derive(Debug, Clone, Serialize)]
pub struct HealthTransition {
    pub provider: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
    /// `None` when the cool-down elapsed or the provider was reset
    pub outcome: Option<Outcome>,
    pub at: DateTime<Utc>,
}

impl ProviderHealth {
    fn available(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            status: HealthStatus::Available,
            since: Utc::now(),
            last_outcome: None,
            cooldown_until: None,
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.cooldown_until
            .is_none_or(|until| Instant::now() >= until)
    }

    /// Move to `status`, returning the transition if it changed anything
    fn set_status(
        &mut self,
        status: HealthStatus,
        outcome: Option<Outcome>,
    ) -> Option<HealthTransition> {
        if self.status == status {
            return None;
        }
        let at = Utc::now();
        let transition = HealthTransition {
            provider: self.provider.clone(),
            from: self.status,
            to: status,
            outcome,
            at,
        };
        self.status = status;
        self.since = at;
        Some(transition)
    }
}

/// Process-wide provider health, injected into the router
pub struct HealthTracker {
    states: DashMap<String, ProviderHealth>,
    cooldown: Duration,
    transitions: broadcast::Sender<HealthTransition>,
}

impl HealthTracker {
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

    /// Seed every known provider as available
    pub fn new<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let states = DashMap::new();
        for provider in providers {
            let provider = provider.as_ref();
            states.insert(provider.to_string(), ProviderHealth::available(provider));
        }
        let (transitions, _) = broadcast::channel(64);
        Self {
            states,
            cooldown: Self::DEFAULT_COOLDOWN,
            transitions,
        }
    }

    /// Set how long a rate-limited or failing provider is skipped
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Whether the router should try this provider. Unknown providers are
    /// available. An elapsed cool-down recovers the provider here.
    pub fn is_available(&self, provider: &str) -> bool {
        let transition = {
            let Some(mut state) = self.states.get_mut(provider) else {
                return true;
            };
            if state.status == HealthStatus::Available {
                return true;
            }
            if !state.cooldown_elapsed() {
                return false;
            }
            state.cooldown_until = None;
            state.set_status(HealthStatus::Available, None)
        };
        self.publish(transition);
        true
    }

    /// Record the outcome of a completed call
    pub fn report_outcome(&self, provider: &str, outcome: Outcome) {
        let transition = {
            let mut state = self
                .states
                .entry(provider.to_string())
                .or_insert_with(|| ProviderHealth::available(provider));
            state.last_outcome = Some(outcome);

            match outcome {
                Outcome::Success => {
                    state.cooldown_until = None;
                    state.set_status(HealthStatus::Available, Some(outcome))
                }
                Outcome::RateLimited => {
                    state.cooldown_until = Some(Instant::now() + self.cooldown);
                    state.set_status(HealthStatus::RateLimited, Some(outcome))
                }
                Outcome::TransientFailure => {
                    state.cooldown_until = Some(Instant::now() + self.cooldown);
                    state.set_status(HealthStatus::Failing, Some(outcome))
                }
                // Bad request or credentials: nothing a cool-down would fix
                Outcome::FatalFailure => None,
            }
        };
        self.publish(transition);
    }

    /// Clear any unavailable mark
    pub fn reset(&self, provider: &str) {
        let transition = self.states.get_mut(provider).and_then(|mut state| {
            state.cooldown_until = None;
            state.set_status(HealthStatus::Available, None)
        });
        self.publish(transition);
    }

    /// Effective status of one provider
    pub fn status(&self, provider: &str) -> HealthStatus {
        if self.is_available(provider) {
            HealthStatus::Available
        } else {
            self.states
                .get(provider)
                .map(|s| s.status)
                .unwrap_or(HealthStatus::Available)
        }
    }

    /// Every provider's state, sorted by name
    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let names: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            // applies elapsed cool-downs
            self.is_available(name);
        }
        let mut states: Vec<ProviderHealth> =
            self.states.iter().map(|e| e.value().clone()).collect();
        states.sort_by(|a, b| a.provider.cmp(&b.provider));
        states
    }

    /// Subscribe to status transitions
    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.transitions.subscribe()
    }

    fn publish(&self, transition: Option<HealthTransition>) {
        let Some(transition) = transition else {
            return;
        };
        match transition.to {
            HealthStatus::Available => info!(
                "Provider {} recovered ({:?} -> available)",
                transition.provider, transition.from
            ),
            status => warn!(
                "Provider {} marked {:?} for {:?} after {:?}",
                transition.provider, status, self.cooldown, transition.outcome
            ),
        }
        // No subscribers is fine
        let _ = self.transitions.send(transition);
    }
}
