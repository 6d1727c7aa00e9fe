//! HTTP API edge: a thin shell over the exports store, the task broker
//! and the artifact store.

pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactStore;
use crate::exports::ExportsStore;
use crate::queue::TaskBroker;

/// Request bodies over this size are rejected.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub exports: Arc<ExportsStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub broker: Arc<dyn TaskBroker>,
    pub request_timeout: Duration,
    /// Permissive CORS outside production.
    pub cors_allow_all: bool,
}

/// Error envelope `{error: {code, message, details?}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", "request timed out")
    }

    #[must_use]
    pub fn unsupported_media_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            "expected application/json",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

/// Build the service router with the middleware stack.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/export", post(handlers::create_export))
        .route("/jobs/:id", get(handlers::job_status))
        .route("/jobs/:id/events", get(handlers::job_events))
        .route("/jobs/:id/cancel", post(handlers::job_cancel))
        .route("/artifacts/:export_id", get(handlers::artifacts_list))
        .route("/download/:artifact_id", get(handlers::download));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .nest("/api", api)
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_timeout,
        ))
        .layer(axum::middleware::from_fn(middleware::access_log))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::cors,
        ))
        .with_state(state)
}

/// Serve until the shutdown token fires.
pub async fn serve(
    state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Derive an idempotency key from the request fingerprint: exporter
/// version, lowercased owner/repo, ref, format, profile, sorted globs,
/// secret-scan flags and token model.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn derive_idempotency_key(
    owner: &str,
    repo: &str,
    reference: &str,
    format: &str,
    profile: &str,
    include_globs: &[String],
    exclude_globs: &[String],
    secret_scan: bool,
    secret_strategy: &str,
    token_model: &str,
) -> String {
    let mut includes: Vec<&str> = include_globs.iter().map(String::as_str).collect();
    includes.sort_unstable();
    let mut excludes: Vec<&str> = exclude_globs.iter().map(String::as_str).collect();
    excludes.sort_unstable();

    let mut hasher = Sha256::new();
    for part in [
        format!("v={}", crate::EXPORTER_VERSION),
        format!("o={}", owner.to_lowercase()),
        format!("r={}", repo.to_lowercase()),
        format!("ref={reference}"),
        format!("f={format}"),
        format!("p={profile}"),
        format!("scan={secret_scan}"),
        format!("strat={}", secret_strategy.to_uppercase()),
        format!("model={token_model}"),
        format!("inc={}", includes.join(",")),
        format!("exc={}", excludes.join(",")),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_and_case_insensitive() {
        let a = derive_idempotency_key(
            "Acme", "Widgets", "HEAD", "zip", "", &[], &[], false, "redacted", "",
        );
        let b = derive_idempotency_key(
            "acme", "widgets", "HEAD", "zip", "", &[], &[], false, "REDACTED", "",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn idempotency_key_sorts_globs() {
        let a = derive_idempotency_key(
            "o", "r", "HEAD", "zip", "",
            &["b/**".into(), "a/**".into()],
            &[],
            false, "redacted", "",
        );
        let b = derive_idempotency_key(
            "o", "r", "HEAD", "zip", "",
            &["a/**".into(), "b/**".into()],
            &[],
            false, "redacted", "",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn idempotency_key_varies_by_format() {
        let a = derive_idempotency_key("o", "r", "HEAD", "zip", "", &[], &[], false, "redacted", "");
        let b = derive_idempotency_key("o", "r", "HEAD", "txt", "", &[], &[], false, "redacted", "");
        assert_ne!(a, b);
    }
}
