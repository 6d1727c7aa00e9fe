//! Shared error types for the export pipeline.

use std::time::Duration;
use thiserror::Error;

/// Path normalization failures. Entries with bad paths are skipped by the
/// transformers rather than failing the whole export.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("invalid char in path")]
    InvalidChar,
    #[error("path escapes root")]
    EscapesRoot,
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {value} ({hint})")]
    InvalidValue {
        key: &'static str,
        value: String,
        hint: &'static str,
    },
}

/// Classified upstream fetch errors. The runner maps these onto the retry
/// policy: `RateLimited` and `Upstream` are retryable, `NotFound` is
/// terminal, everything else retries as a generic network failure.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate_limited (reset={reset})")]
    RateLimited {
        /// Unix seconds when the upstream rate limit resets.
        reset: i64,
    },
    #[error("not_found")]
    NotFound,
    #[error("upstream_error")]
    Upstream,
    #[error("unexpected status: {0}")]
    UnexpectedStatus(u16),
    #[error("network error: {0}")]
    Network(String),
}

impl FetchError {
    /// Delay until the advertised rate-limit reset, clamped to at least 1s.
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { reset } => {
                let now = chrono::Utc::now().timestamp();
                let secs = (*reset - now).max(1);
                Some(Duration::from_secs(secs as u64))
            }
            Self::Upstream | Self::Network(_) | Self::UnexpectedStatus(_) => {
                Some(Duration::from_secs(2))
            }
            Self::NotFound => None,
        }
    }
}
