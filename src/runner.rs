//! Export runner: drives one job from task payload to terminal state.
//!
//! The runner classifies every failure at its I/O boundary, updates the
//! export record and either signals the broker to retry or ends the
//! delivery. Cancellation is polled before each major step and on every
//! loop iteration while the tarball spools.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::{detect_content_type, ArtifactStore, ArtifactWriter};
use crate::error::FetchError;
use crate::exporter::{
    build_txt_from_targz, build_zip_from_targz, scan_tar_gz, ExporterError, PromptPackOptions,
    TxtOptions, ZipOptions,
};
use crate::exports::ExportsStore;
use crate::github::RepoFetcher;
use crate::queue::{Task, TaskEnvelope, TaskError, TaskHandler};
use crate::types::{normalize_ref, ArtifactRef, ExportFormat, ExportStatus, ExportTaskPayload};

const MIB: u64 = 1024 * 1024;
/// Progress ticks while spooling: one every this many bytes.
const SPOOL_TICK_BYTES: u64 = 10 * MIB;
/// Spool write granularity. Fetched chunks are consumed in slices of this
/// size with a cancellation check per slice, so a cancel lands within at
/// most one buffer of download no matter how large the stream's chunks are.
const SPOOL_BUF_BYTES: usize = 1024 * 1024;

/// Hard limits applied to every job.
#[derive(Debug, Clone, Copy)]
pub struct RunnerLimits {
    /// Cap on the spooled tarball size.
    pub max_download_mb: u64,
    /// Cap on the produced artifact payload.
    pub max_export_mb: u32,
    /// Per-fetch deadline (also bounds the spool loop).
    pub fetch_timeout: Duration,
}

impl Default for RunnerLimits {
    fn default() -> Self {
        Self {
            max_download_mb: 512,
            max_export_mb: 200,
            fetch_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Dependencies of the runner.
pub struct RunnerDeps {
    pub fetcher: Arc<dyn RepoFetcher>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub exports: Arc<ExportsStore>,
    pub max_attempts: u32,
    pub limits: RunnerLimits,
}

/// Build the broker handler for `export:run` tasks.
pub fn export_task_handler(deps: Arc<RunnerDeps>) -> TaskHandler {
    Arc::new(move |token, task| {
        let deps = Arc::clone(&deps);
        Box::pin(async move { run_export(&deps, &token, &task).await })
    })
}

/// Execute one export delivery end to end.
pub async fn run_export(
    deps: &RunnerDeps,
    cancel: &CancellationToken,
    task: &Task,
) -> Result<(), TaskError> {
    let envelope: TaskEnvelope = match serde_json::from_slice(&task.payload) {
        Ok(env) => env,
        Err(e) => return Err(TaskError::Fatal(format!("undecodable envelope: {e}"))),
    };
    let payload = match envelope.decode_export() {
        Ok(p) => p,
        Err(e) => {
            // Salvage the export id if present so the record ends in error
            // instead of hanging in queued forever.
            if let Some(id) = envelope.payload.get("exportId").and_then(|v| v.as_str()) {
                deps.exports
                    .update_status(id, ExportStatus::Error, Some(0), Some("invalid_payload".into()))
                    .await;
            }
            return Err(e);
        }
    };

    let id = payload.export_id.clone();
    let max_attempts = if task.max_retries > 0 {
        task.max_retries
    } else {
        deps.max_attempts.max(1)
    };

    info!(
        export_id = %id,
        attempt = task.attempt + 1,
        owner = %payload.owner,
        repo = %payload.repo,
        reference = %payload.reference,
        format = payload.format.as_str(),
        "export started"
    );

    deps.exports
        .update_status(&id, ExportStatus::Running, Some(10), None)
        .await;

    // Create the artifact write-stream before any network I/O.
    let file_name = payload.format.artifact_name();
    let kind = payload.format.artifact_kind();
    let created = {
        let artifacts = Arc::clone(&deps.artifacts);
        let export_id = id.clone();
        tokio::task::spawn_blocking(move || artifacts.create_artifact(&export_id, kind, file_name))
            .await
    };
    let (writer, _) = match created {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(export_id = %id, error = %e, "artifact create failed");
            return terminal(deps, &id, "artifact_create_failed").await;
        }
        Err(e) => {
            warn!(export_id = %id, error = %e, "artifact create panicked");
            return terminal(deps, &id, "internal_error").await;
        }
    };

    // Cancellation check before touching the network.
    if let Some(reason) = cancelled_reason(deps, &id, cancel).await {
        writer.abort();
        return cancelled(deps, &id, reason).await;
    }

    let reference = normalize_ref(&payload.reference);
    let fetched = tokio::time::timeout(
        deps.limits.fetch_timeout,
        deps.fetcher
            .fetch_tarball(&payload.owner, &payload.repo, &reference),
    )
    .await;

    let mut stream = match fetched {
        Err(_) => {
            writer.abort();
            return retry_or_terminal(
                deps,
                &id,
                task.attempt,
                max_attempts,
                "network_error",
                "tarball fetch timed out".into(),
                Duration::from_secs(2),
            )
            .await;
        }
        Ok(Err(FetchError::NotFound)) => {
            writer.abort();
            warn!(export_id = %id, owner = %payload.owner, repo = %payload.repo, %reference,
                "repository or ref not found");
            return terminal(deps, &id, "github_not_found").await;
        }
        Ok(Err(e)) => {
            writer.abort();
            let (code, delay) = match &e {
                FetchError::RateLimited { .. } => (
                    "rate_limited",
                    e.retry_delay().unwrap_or(Duration::from_secs(1)),
                ),
                FetchError::Upstream => ("upstream_error", Duration::from_secs(2)),
                _ => ("network_error", Duration::from_secs(2)),
            };
            return retry_or_terminal(
                deps,
                &id,
                task.attempt,
                max_attempts,
                code,
                format!("tarball fetch failed: {e}"),
                delay,
            )
            .await;
        }
        Ok(Ok(stream)) => stream,
    };

    // Spool the tarball to a temp file with a hard cap, publishing
    // progress 12..30 in 10-MiB ticks.
    let mut tmp = match tempfile::NamedTempFile::new() {
        Ok(tmp) => tmp,
        Err(e) => {
            writer.abort();
            warn!(export_id = %id, error = %e, "temp file creation failed");
            return terminal(deps, &id, "temp_file_error").await;
        }
    };

    deps.exports.set_progress(&id, 12).await;
    let cap_bytes = deps.limits.max_download_mb * MIB;
    let deadline = Instant::now() + deps.limits.fetch_timeout;
    let mut written: u64 = 0;
    let mut next_tick = SPOOL_TICK_BYTES;

    loop {
        if cancel.is_cancelled() {
            writer.abort();
            return cancelled(deps, &id, "context_cancelled").await;
        }
        if deps.exports.is_cancel_requested_local(&id) {
            writer.abort();
            return cancelled(deps, &id, "user_cancelled").await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            writer.abort();
            return retry_or_terminal(
                deps,
                &id,
                task.attempt,
                max_attempts,
                "network_error",
                "tarball download deadline exceeded".into(),
                Duration::from_secs(2),
            )
            .await;
        }

        let chunk = match tokio::time::timeout(remaining, stream.next_chunk()).await {
            Err(_) | Ok(Err(_)) => {
                writer.abort();
                return retry_or_terminal(
                    deps,
                    &id,
                    task.attempt,
                    max_attempts,
                    "network_error",
                    "tarball read failed".into(),
                    Duration::from_secs(2),
                )
                .await;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(bytes))) => bytes,
        };

        let mut offset = 0usize;
        while offset < chunk.len() {
            if cancel.is_cancelled() {
                writer.abort();
                return cancelled(deps, &id, "context_cancelled").await;
            }
            if deps.exports.is_cancel_requested_local(&id) {
                writer.abort();
                return cancelled(deps, &id, "user_cancelled").await;
            }
            let end = (offset + SPOOL_BUF_BYTES).min(chunk.len());
            let slice = &chunk[offset..end];

            if written + slice.len() as u64 > cap_bytes {
                writer.abort();
                warn!(export_id = %id, cap_mb = deps.limits.max_download_mb, "tarball exceeds download cap");
                return terminal(deps, &id, "too_large").await;
            }
            if let Err(e) = tmp.as_file_mut().write_all(slice) {
                writer.abort();
                warn!(export_id = %id, error = %e, "tarball spool write failed");
                return terminal(deps, &id, "write_error").await;
            }
            written += slice.len() as u64;
            offset = end;

            if written >= next_tick {
                let progress = (12 + (written * 18 / cap_bytes).min(18)) as u8;
                deps.exports.set_progress(&id, progress.min(30)).await;
                next_tick += SPOOL_TICK_BYTES;
                // Full check (with durable fallback) once per tick.
                if deps.exports.is_cancel_requested(&id).await {
                    writer.abort();
                    return cancelled(deps, &id, "user_cancelled").await;
                }
            }
        }
    }

    deps.exports.set_progress(&id, 32).await;

    if let Some(reason) = cancelled_reason(deps, &id, cancel).await {
        writer.abort();
        return cancelled(deps, &id, reason).await;
    }

    // Run the selected transformer against the spooled file. Prompt packs
    // rewind the same temp file for their second pass instead of fetching
    // the tarball again.
    let format = payload.format;
    let tmp_path = tmp.path().to_path_buf();
    let transform_opts = TransformOptions::from_payload(&payload, deps.limits.max_export_mb);
    let transformed = tokio::task::spawn_blocking(move || -> Result<ArtifactWriter, ExporterError> {
        let mut writer = writer;
        match format {
            ExportFormat::Zip => {
                let file = File::open(&tmp_path)?;
                build_zip_from_targz(file, &mut writer, &transform_opts.zip)?;
            }
            ExportFormat::Txt => {
                let file = File::open(&tmp_path)?;
                build_txt_from_targz(file, &mut writer, &transform_opts.txt)?;
            }
            ExportFormat::PromptPack => {
                let first = File::open(&tmp_path)?;
                let scan = scan_tar_gz(first, &transform_opts.promptpack)?;
                let second = File::open(&tmp_path)?;
                scan.write_zip(second, &mut writer)?;
            }
        }
        Ok(writer)
    })
    .await;

    let writer = match transformed {
        Ok(Ok(writer)) => writer,
        Ok(Err(ExporterError::TooLarge)) => {
            warn!(export_id = %id, format = format.as_str(), "export exceeds output cap");
            return terminal(deps, &id, "too_large").await;
        }
        Ok(Err(e)) => {
            return retry_or_terminal(
                deps,
                &id,
                task.attempt,
                max_attempts,
                "transform_failed",
                format!("{} build failed: {e}", format.as_str()),
                Duration::from_secs(2),
            )
            .await;
        }
        Err(e) => {
            warn!(export_id = %id, error = %e, "transformer panicked");
            return terminal(deps, &id, "internal_error").await;
        }
    };
    drop(tmp);

    // Close the write-stream; this uploads and links the manifest.
    let finalized = tokio::task::spawn_blocking(move || writer.finalize()).await;
    let meta = match finalized {
        Ok(Ok(meta)) => meta,
        Ok(Err(e)) => {
            warn!(export_id = %id, error = %e, "artifact finalize failed");
            return terminal(deps, &id, "finalize_failed").await;
        }
        Err(e) => {
            warn!(export_id = %id, error = %e, "artifact finalize panicked");
            return terminal(deps, &id, "internal_error").await;
        }
    };

    let artifact = ArtifactRef {
        id: meta.id.clone(),
        kind: meta.kind.clone(),
        name: meta.name.clone(),
        size: meta.size,
        path: format!("{id}/{}", meta.name),
        content_type: detect_content_type(&meta.name).to_string(),
    };
    deps.exports.add_artifact(&id, artifact).await;
    deps.exports
        .update_status(&id, ExportStatus::Done, Some(100), None)
        .await;

    info!(
        export_id = %id,
        artifact_id = %meta.id,
        kind = %meta.kind,
        size = meta.size,
        "export finished"
    );
    Ok(())
}

struct TransformOptions {
    zip: ZipOptions,
    txt: TxtOptions,
    promptpack: PromptPackOptions,
}

impl TransformOptions {
    fn from_payload(payload: &ExportTaskPayload, max_export_mb: u32) -> Self {
        Self {
            zip: ZipOptions {
                include_globs: payload.include_globs.clone(),
                exclude_globs: payload.exclude_globs.clone(),
                max_binary_size_mb: payload.max_binary_size_mb,
                max_export_mb,
                max_filename_len: 255,
                strip_first_dir: true,
            },
            txt: TxtOptions {
                include_globs: payload.include_globs.clone(),
                exclude_globs: payload.exclude_globs.clone(),
                strip_first_dir: true,
                line_numbers: true,
                max_lines_per_file: 10_000,
                max_export_mb,
                skip_binaries: true,
                secret_scan: payload.secret_scan,
                secret_strategy: payload.secret_strategy,
                ..TxtOptions::default()
            },
            promptpack: PromptPackOptions {
                owner: payload.owner.clone(),
                repo: payload.repo.clone(),
                reference: normalize_ref(&payload.reference),
                profile: payload.profile,
                model_id: payload.token_model.clone(),
                include_globs: payload.include_globs.clone(),
                exclude_globs: payload.exclude_globs.clone(),
                mask_secrets: payload.secret_scan,
                ..PromptPackOptions::default()
            },
        }
    }
}

async fn cancelled_reason(
    deps: &RunnerDeps,
    id: &str,
    cancel: &CancellationToken,
) -> Option<&'static str> {
    if cancel.is_cancelled() {
        return Some("context_cancelled");
    }
    if deps.exports.is_cancel_requested(id).await {
        return Some("user_cancelled");
    }
    None
}

async fn cancelled(deps: &RunnerDeps, id: &str, reason: &str) -> Result<(), TaskError> {
    info!(export_id = %id, %reason, "export cancelled");
    deps.exports
        .update_status(id, ExportStatus::Cancelled, None, Some(reason.into()))
        .await;
    Ok(())
}

async fn terminal(deps: &RunnerDeps, id: &str, code: &str) -> Result<(), TaskError> {
    deps.exports
        .update_status(id, ExportStatus::Error, Some(0), Some(code.into()))
        .await;
    Ok(())
}

/// Retry while attempts remain; otherwise convert the intended retry into
/// a terminal error carrying the classification code.
async fn retry_or_terminal(
    deps: &RunnerDeps,
    id: &str,
    attempt: u32,
    max_attempts: u32,
    code: &str,
    reason: String,
    delay: Duration,
) -> Result<(), TaskError> {
    if attempt + 1 >= max_attempts {
        warn!(export_id = %id, attempt = attempt + 1, %code, "attempts exhausted");
        return terminal(deps, id, code).await;
    }
    info!(export_id = %id, attempt = attempt + 1, %code, delay_ms = delay.as_millis() as u64,
        "retrying export");
    Err(TaskError::Retry {
        after: delay,
        reason,
    })
}
