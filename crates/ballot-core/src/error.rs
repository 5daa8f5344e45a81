//! Error taxonomy for the answer pipeline

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of one provider call, as seen by the health tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RateLimited,
    TransientFailure,
    FatalFailure,
}

/// A classified provider-call failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("status {}: {}", status, truncate(body, 300));
        match status.as_u16() {
            429 => Self::RateLimited(message),
            408 | 409 => Self::Transient(message),
            s if s >= 500 => Self::Transient(message),
            _ => Self::Fatal(message),
        }
    }

    /// How this failure should be reported to the health tracker
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::RateLimited(_) => Outcome::RateLimited,
            Self::Transient(_) | Self::Timeout(_) | Self::MalformedOutput(_) => {
                Outcome::TransientFailure
            }
            Self::Fatal(_) => Outcome::FatalFailure,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::from_status(status, &err.to_string())
        } else if err.is_decode() {
            Self::MalformedOutput(err.to_string())
        } else if err.is_builder() {
            Self::Fatal(err.to_string())
        } else {
            // connect, timeout, body and redirect errors
            Self::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedOutput(err.to_string())
    }
}

/// Request-level pipeline failures
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No model matches a requested tier, or a model names an unknown provider.
    /// Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every retrieval sub-query failed
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// Every fallback candidate failed
    #[error("all {attempts} provider candidates exhausted (last error: {last_error})")]
    AllProvidersExhausted { attempts: usize, last_error: String },

    /// The caller went away before the answer finished
    #[error("request cancelled")]
    Cancelled,
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
