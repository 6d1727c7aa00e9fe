//! Upstream git-forge client: the one operation the core invokes is
//! fetching a repository tarball stream, with errors classified for the
//! runner's retry policy.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::error::FetchError;

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming tarball body.
#[async_trait]
pub trait TarballStream: Send {
    /// Next chunk of bytes; `Ok(None)` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError>;
}

/// The upstream operations the export pipeline depends on.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch_tarball(
        &self,
        owner: &str,
        repo: &str,
        reference: &str,
    ) -> Result<Box<dyn TarballStream>, FetchError>;
}

/// GitHub REST client. Redirects to `codeload` are followed by the HTTP
/// client; time limits are owned by the caller's deadline, not a global
/// client timeout, so large archive downloads are not cut short.
pub struct GithubClient {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Result<Self, FetchError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: Option<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .use_rustls_tls()
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[async_trait]
impl RepoFetcher for GithubClient {
    async fn fetch_tarball(
        &self,
        owner: &str,
        repo: &str,
        reference: &str,
    ) -> Result<Box<dyn TarballStream>, FetchError> {
        let reference = if reference.is_empty() {
            "HEAD"
        } else {
            reference
        };
        let url = format!(
            "{}/repos/{owner}/{repo}/tarball/{reference}",
            self.base_url
        );

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = response.status();

        // GitHub signals rate limiting with 403/429 and a zeroed
        // X-RateLimit-Remaining header.
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            let remaining = response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .map(str::trim);
            if remaining == Some("0") {
                let reset = response
                    .headers()
                    .get("x-ratelimit-reset")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .unwrap_or(0);
                return Err(FetchError::RateLimited { reset });
            }
        }

        if status.is_success() {
            debug!(%owner, %repo, %reference, "tarball stream opened");
            return Ok(Box::new(HttpTarballStream { response }));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if status.is_server_error() {
            return Err(FetchError::Upstream);
        }
        Err(FetchError::UnexpectedStatus(status.as_u16()))
    }
}

struct HttpTarballStream {
    response: reqwest::Response,
}

#[async_trait]
impl TarballStream for HttpTarballStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        self.response
            .chunk()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

/// In-memory fetcher used by tests: yields a fixed body, or a scripted
/// sequence of failures before succeeding.
pub struct StaticFetcher {
    responses: std::sync::Mutex<Vec<Result<Vec<u8>, FetchError>>>,
}

impl StaticFetcher {
    /// Always serves `body`.
    #[must_use]
    pub fn serving(body: Vec<u8>) -> Self {
        Self {
            responses: std::sync::Mutex::new(vec![Ok(body)]),
        }
    }

    /// Serves the scripted outcomes in order, repeating the last one.
    #[must_use]
    pub fn scripted(outcomes: Vec<Result<Vec<u8>, FetchError>>) -> Self {
        assert!(!outcomes.is_empty());
        Self {
            responses: std::sync::Mutex::new(outcomes),
        }
    }
}

#[async_trait]
impl RepoFetcher for StaticFetcher {
    async fn fetch_tarball(
        &self,
        _owner: &str,
        _repo: &str,
        _reference: &str,
    ) -> Result<Box<dyn TarballStream>, FetchError> {
        let mut responses = self.responses.lock().expect("responses lock");
        let outcome = if responses.len() > 1 {
            responses.remove(0)
        } else {
            clone_outcome(&responses[0])
        };
        match outcome {
            Ok(body) => Ok(Box::new(StaticTarballStream {
                chunks: body.chunks(64 * 1024).map(Bytes::copy_from_slice).collect(),
            })),
            Err(e) => Err(e),
        }
    }
}

fn clone_outcome(outcome: &Result<Vec<u8>, FetchError>) -> Result<Vec<u8>, FetchError> {
    match outcome {
        Ok(body) => Ok(body.clone()),
        Err(FetchError::RateLimited { reset }) => Err(FetchError::RateLimited { reset: *reset }),
        Err(FetchError::NotFound) => Err(FetchError::NotFound),
        Err(FetchError::Upstream) => Err(FetchError::Upstream),
        Err(FetchError::UnexpectedStatus(code)) => Err(FetchError::UnexpectedStatus(*code)),
        Err(FetchError::Network(msg)) => Err(FetchError::Network(msg.clone())),
    }
}

struct StaticTarballStream {
    chunks: std::collections::VecDeque<Bytes>,
}

#[async_trait]
impl TarballStream for StaticTarballStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        Ok(self.chunks.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_fetcher_streams_the_body() {
        let fetcher = StaticFetcher::serving(vec![7u8; 100_000]);
        let mut stream = fetcher.fetch_tarball("o", "r", "HEAD").await.unwrap();
        let mut total = 0usize;
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 100_000);
    }

    #[tokio::test]
    async fn scripted_fetcher_replays_failures_then_succeeds() {
        let fetcher = StaticFetcher::scripted(vec![
            Err(FetchError::Upstream),
            Ok(b"tar-bytes".to_vec()),
        ]);
        assert!(matches!(
            fetcher.fetch_tarball("o", "r", "HEAD").await,
            Err(FetchError::Upstream)
        ));
        let mut stream = fetcher.fetch_tarball("o", "r", "HEAD").await.unwrap();
        assert_eq!(
            stream.next_chunk().await.unwrap().as_deref(),
            Some(b"tar-bytes".as_ref())
        );
    }
}
