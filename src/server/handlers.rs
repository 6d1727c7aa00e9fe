//! Request handlers for the export API.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use super::{derive_idempotency_key, ApiError, AppState};
use crate::artifacts::{is_safe_id, ArtifactError};
use crate::exports::{Export, ExportSnapshot};
use crate::queue::{EnqueueOptions, Priority, TaskEnvelope, TASK_TYPE_EXPORT};
use crate::types::{
    normalize_ref, ArtifactRef, ExportFormat, ExportOptions, ExportStatus, ExportTaskPayload,
    PromptProfile, SecretStrategy,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ExportRequestBody {
    owner: String,
    repo: String,
    #[serde(default, rename = "ref")]
    reference: String,
    #[serde(default)]
    format: String,
    #[serde(default)]
    profile: String,
    #[serde(default)]
    include_globs: Vec<String>,
    #[serde(default)]
    exclude_globs: Vec<String>,
    #[serde(default)]
    secret_scan: bool,
    #[serde(default)]
    secret_strategy: String,
    #[serde(default)]
    token_model: String,
    #[serde(default)]
    max_binary_size_mb: u32,
    #[serde(default)]
    ttl_hours: u32,
    #[serde(default)]
    idempotency_key: String,
    #[serde(default)]
    priority: String,
}

/// POST /api/export: validate, create-or-reuse, enqueue.
pub async fn create_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        if !content_type.starts_with("application/json") {
            return Err(ApiError::unsupported_media_type());
        }
    }

    let req: ExportRequestBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?;

    let owner = req.owner.trim();
    let repo = req.repo.trim();
    if owner.is_empty() || repo.is_empty() {
        return Err(ApiError::bad_request("owner and repo are required"));
    }

    let format_raw = if req.format.trim().is_empty() {
        "zip"
    } else {
        req.format.trim()
    };
    let format = ExportFormat::parse(format_raw)
        .ok_or_else(|| ApiError::bad_request(format!("unknown format: {format_raw}")))?;
    let profile = PromptProfile::parse(&req.profile);
    let secret_strategy = SecretStrategy::parse(&req.secret_strategy);
    let reference = normalize_ref(&req.reference);

    let idempotency_key = if req.idempotency_key.trim().is_empty() {
        derive_idempotency_key(
            owner,
            repo,
            &reference,
            format.as_str(),
            profile.as_str(),
            &req.include_globs,
            &req.exclude_globs,
            req.secret_scan,
            &req.secret_strategy,
            &req.token_model,
        )
    } else {
        req.idempotency_key.trim().to_string()
    };

    let options = ExportOptions {
        format,
        profile,
        include_globs: req.include_globs.clone(),
        exclude_globs: req.exclude_globs.clone(),
        secret_scan: req.secret_scan,
        secret_strategy,
        token_model: req.token_model.clone(),
        max_binary_size_mb: req.max_binary_size_mb,
        ttl_hours: req.ttl_hours,
        idempotency_key,
    };

    let (export, reused) = state
        .exports
        .create_or_reuse(owner, repo, &reference, options)
        .await;

    if !reused {
        let payload = ExportTaskPayload {
            export_id: export.id.clone(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            reference,
            format,
            profile,
            include_globs: req.include_globs,
            exclude_globs: req.exclude_globs,
            secret_scan: req.secret_scan,
            secret_strategy,
            token_model: req.token_model,
            max_binary_size_mb: req.max_binary_size_mb,
            ttl_hours: req.ttl_hours,
            idempotency_key: export.options.idempotency_key.clone(),
        };
        let envelope = TaskEnvelope::export(&payload)
            .and_then(|env| serde_json::to_vec(&env))
            .map_err(|e| {
                error!(export_id = %export.id, error = %e, "payload encode failed");
                ApiError::internal("failed to prepare export payload")
            })?;

        let priority = Priority::parse(&req.priority);
        if let Err(e) = state
            .broker
            .enqueue(priority, TASK_TYPE_EXPORT, envelope, EnqueueOptions::default())
            .await
        {
            error!(export_id = %export.id, queue = priority.as_str(), error = %e, "enqueue failed");
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "enqueue_failed",
                "failed to enqueue task",
            ));
        }
        info!(export_id = %export.id, queue = priority.as_str(), "export enqueued");
    }

    Ok(Json(json!({
        "jobId": export.id,
        "exportId": export.id,
        "status": export.status,
    })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusBody {
    state: ExportStatus,
    progress: u8,
    failure_reason: Option<String>,
    cancel_requested: bool,
    export_id: String,
    artifacts: Vec<ArtifactRef>,
}

impl JobStatusBody {
    fn from_export(export: &Export) -> Self {
        Self {
            state: export.status,
            progress: export.progress,
            failure_reason: export.failure_reason.clone(),
            cancel_requested: export.cancel_requested,
            export_id: export.id.clone(),
            artifacts: export.artifacts.clone(),
        }
    }

    fn from_snapshot(snapshot: &ExportSnapshot) -> Self {
        Self {
            state: snapshot.status,
            progress: snapshot.progress,
            failure_reason: snapshot.failure_reason.clone(),
            cancel_requested: snapshot.cancel_requested,
            export_id: snapshot.export_id.clone(),
            artifacts: snapshot.artifacts.clone(),
        }
    }
}

/// GET /api/jobs/:id: current snapshot.
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusBody>, ApiError> {
    match state.exports.get(&id).await {
        Some(export) => Ok(Json(JobStatusBody::from_export(&export))),
        None => Err(ApiError::not_found("job not found")),
    }
}

/// GET /api/jobs/:id/events: SSE stream of snapshots, closed after the
/// terminal one.
pub async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<ReceiverStream<Result<Event, Infallible>>>, ApiError> {
    let Some(export) = state.exports.get(&id).await else {
        return Err(ApiError::not_found("job not found"));
    };
    let Some(mut subscription) = state.exports.subscribe(&id) else {
        return Err(ApiError::not_found("job not found"));
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    tokio::spawn(async move {
        let initial = JobStatusBody::from_export(&export);
        let terminal = export.status.is_terminal();
        let Ok(data) = serde_json::to_string(&initial) else {
            return;
        };
        if tx.send(Ok(Event::default().data(data))).await.is_err() || terminal {
            return;
        }

        while let Some(snapshot) = subscription.recv().await {
            let terminal = snapshot.status.is_terminal();
            let Ok(data) = serde_json::to_string(&JobStatusBody::from_snapshot(&snapshot)) else {
                break;
            };
            if tx.send(Ok(Event::default().data(data))).await.is_err() {
                break;
            }
            if terminal {
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// POST /api/jobs/:id/cancel.
pub async fn job_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.exports.request_cancel(&id).await {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::conflict("job already finished or not found"))
    }
}

/// GET /api/artifacts/:exportId: manifest listing.
pub async fn artifacts_list(
    State(state): State<AppState>,
    Path(export_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !is_safe_id(&export_id) {
        return Err(ApiError::bad_request("invalid export id"));
    }
    let artifacts = Arc::clone(&state.artifacts);
    let listed =
        tokio::task::spawn_blocking(move || artifacts.list_by_export_id(&export_id)).await;
    match listed {
        Ok(Ok((files, expires_at))) => Ok(Json(json!({
            "files": files,
            "expiresAt": expires_at,
        }))),
        Ok(Err(ArtifactError::NotFound)) => Err(ApiError::not_found("export not found")),
        Ok(Err(e)) => {
            error!(error = %e, "artifact listing failed");
            Err(ApiError::internal("artifact listing failed"))
        }
        Err(e) => {
            error!(error = %e, "artifact listing panicked");
            Err(ApiError::internal("artifact listing failed"))
        }
    }
}

/// GET /api/download/:artifactId: stream artifact bytes.
pub async fn download(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_id(&artifact_id) {
        return Err(ApiError::bad_request("invalid artifact id"));
    }
    let artifacts = Arc::clone(&state.artifacts);
    let opened =
        tokio::task::spawn_blocking(move || artifacts.open_by_artifact_id(&artifact_id)).await;
    let (file, meta, _export_id) = match opened {
        Ok(Ok(found)) => found,
        Ok(Err(ArtifactError::Expired)) => return Err(ApiError::not_found("artifact expired")),
        Ok(Err(ArtifactError::NotFound)) => return Err(ApiError::not_found("artifact not found")),
        Ok(Err(e)) => {
            error!(error = %e, "artifact open failed");
            return Err(ApiError::internal("artifact open failed"));
        }
        Err(e) => {
            error!(error = %e, "artifact open panicked");
            return Err(ApiError::internal("artifact open failed"));
        }
    };

    let stream = ReaderStream::new(tokio::fs::File::from_std(file));
    let body = Body::from_stream(stream);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, crate::artifacts::detect_content_type(&meta.name))
        .header(header::CONTENT_LENGTH, meta.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", meta.name),
        )
        .header(header::CACHE_CONTROL, "private, max-age=0")
        .body(body)
        .map_err(|e| ApiError::internal(format!("response build failed: {e}")))?;
    Ok(response)
}

/// GET /healthz: liveness.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "ts": Utc::now().to_rfc3339() }))
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found("no such endpoint")
}
