//! Export runner lifecycle: fetch, spool, transform, finalize, terminal
//! states, retry classification and cancellation.

mod test_support;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use repoexport::artifacts::{ArtifactStore, FsArtifactStore};
use repoexport::error::FetchError;
use repoexport::exports::ExportsStore;
use repoexport::github::{RepoFetcher, StaticFetcher, TarballStream};
use repoexport::queue::{Task, TaskEnvelope, TaskError, TASK_TYPE_EXPORT};
use repoexport::runner::{run_export, RunnerDeps, RunnerLimits};
use repoexport::types::{
    ExportFormat, ExportOptions, ExportStatus, ExportTaskPayload, PromptProfile, SecretStrategy,
};
use test_support::{make_tar_gz, zip_entry_names};

struct Harness {
    deps: RunnerDeps,
    _dir: tempfile::TempDir,
}

fn harness(fetcher: StaticFetcher, limits: RunnerLimits) -> Harness {
    harness_with(Arc::new(fetcher), limits)
}

fn harness_with(fetcher: Arc<dyn RepoFetcher>, limits: RunnerLimits) -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FsArtifactStore::new(dir.path(), 72).unwrap());
    Harness {
        deps: RunnerDeps {
            fetcher,
            artifacts,
            exports: Arc::new(ExportsStore::new("exp")),
            max_attempts: 3,
            limits,
        },
        _dir: dir,
    }
}

async fn queued_export(deps: &RunnerDeps, format: ExportFormat) -> String {
    let (export, _) = deps
        .exports
        .create_or_reuse(
            "acme",
            "widgets",
            "HEAD",
            ExportOptions {
                format,
                ..ExportOptions::default()
            },
        )
        .await;
    export.id
}

fn task_for(export_id: &str, format: ExportFormat, attempt: u32) -> Task {
    let payload = ExportTaskPayload {
        export_id: export_id.to_string(),
        owner: "acme".into(),
        repo: "widgets".into(),
        reference: "HEAD".into(),
        format,
        profile: PromptProfile::Short,
        include_globs: Vec::new(),
        exclude_globs: Vec::new(),
        secret_scan: false,
        secret_strategy: SecretStrategy::Redacted,
        token_model: String::new(),
        max_binary_size_mb: 0,
        ttl_hours: 0,
        idempotency_key: String::new(),
    };
    let envelope = TaskEnvelope::export(&payload).unwrap();
    Task {
        task_type: TASK_TYPE_EXPORT.to_string(),
        payload: serde_json::to_vec(&envelope).unwrap(),
        attempt,
        max_retries: 3,
        timeout: Duration::from_secs(600),
    }
}

#[tokio::test]
async fn zip_export_reaches_done_with_a_downloadable_artifact() {
    let src = make_tar_gz(&[("src/keep.txt", b"hello"), ("docs/readme.md", b"doc")]);
    let h = harness(StaticFetcher::serving(src), RunnerLimits::default());
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    let cancel = CancellationToken::new();
    run_export(&h.deps, &cancel, &task_for(&id, ExportFormat::Zip, 0))
        .await
        .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Done);
    assert_eq!(export.progress, 100);
    assert!(export.started_at.is_some());
    assert!(export.finished_at.is_some());
    assert_eq!(export.artifacts.len(), 1);

    let artifact = &export.artifacts[0];
    assert_eq!(artifact.name, "bundle.zip");
    assert_eq!(artifact.kind, "zip");
    assert!(artifact.size > 0);
    assert_eq!(artifact.content_type, "application/zip");
    assert_eq!(artifact.path, format!("{id}/bundle.zip"));

    let (mut file, meta, export_id) = h
        .deps
        .artifacts
        .open_by_artifact_id(&artifact.id)
        .unwrap();
    assert_eq!(export_id, id);
    assert_eq!(meta.size, artifact.size);
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).unwrap();
    assert_eq!(
        zip_entry_names(&bytes),
        vec!["docs/readme.md", "src/keep.txt"]
    );
}

#[tokio::test]
async fn txt_export_produces_concat_artifact() {
    let src = make_tar_gz(&[("notes.txt", b"alpha\nbeta\n")]);
    let h = harness(StaticFetcher::serving(src), RunnerLimits::default());
    let id = queued_export(&h.deps, ExportFormat::Txt).await;

    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Txt, 0),
    )
    .await
    .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Done);
    assert_eq!(export.artifacts[0].name, "concat.txt");
    assert_eq!(export.artifacts[0].content_type, "text/plain; charset=utf-8");

    let (mut file, _, _) = h
        .deps
        .artifacts
        .open_by_artifact_id(&export.artifacts[0].id)
        .unwrap();
    let mut text = String::new();
    file.read_to_string(&mut text).unwrap();
    assert!(text.contains("=== FILE: notes.txt (first 2 lines) ==="));
    assert!(text.contains("1\talpha"));
}

#[tokio::test]
async fn promptpack_export_rewinds_for_the_second_pass() {
    let src = make_tar_gz(&[
        ("README.md", b"# Pack\n\nDemo.\n".as_slice()),
        ("src/lib.rs", b"pub fn x() {}\n".as_slice()),
    ]);
    let h = harness(StaticFetcher::serving(src), RunnerLimits::default());
    let id = queued_export(&h.deps, ExportFormat::PromptPack).await;

    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::PromptPack, 0),
    )
    .await
    .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Done);
    assert_eq!(export.artifacts[0].name, "promptpack.zip");

    let (mut file, _, _) = h
        .deps
        .artifacts
        .open_by_artifact_id(&export.artifacts[0].id)
        .unwrap();
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).unwrap();
    assert!(zip_entry_names(&bytes).contains(&"PromptPack-Short.md".to_string()));
}

#[tokio::test]
async fn missing_repository_is_terminal() {
    let h = harness(
        StaticFetcher::scripted(vec![Err(FetchError::NotFound)]),
        RunnerLimits::default(),
    );
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Zip, 0),
    )
    .await
    .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Error);
    assert_eq!(export.failure_reason.as_deref(), Some("github_not_found"));
    assert!(export.artifacts.is_empty());
}

#[tokio::test]
async fn rate_limited_fetch_retries_then_succeeds() {
    let src = make_tar_gz(&[("a.txt", b"a")]);
    let reset = chrono::Utc::now().timestamp() + 2;
    let h = harness(
        StaticFetcher::scripted(vec![Err(FetchError::RateLimited { reset }), Ok(src)]),
        RunnerLimits::default(),
    );
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    // First delivery signals a retry with the reset-derived delay.
    let outcome = run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Zip, 0),
    )
    .await;
    match outcome {
        Err(TaskError::Retry { after, .. }) => assert!(after >= Duration::from_secs(1)),
        other => panic!("expected retry, got {other:?}"),
    }
    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Running);

    // Second delivery succeeds.
    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Zip, 1),
    )
    .await
    .unwrap();
    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Done);
}

#[tokio::test]
async fn exhausted_attempts_convert_retry_into_terminal_error() {
    let h = harness(
        StaticFetcher::scripted(vec![Err(FetchError::Upstream)]),
        RunnerLimits::default(),
    );
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    // attempt = 2 of max 3: the runner must not ask for another retry.
    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Zip, 2),
    )
    .await
    .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Error);
    assert_eq!(export.failure_reason.as_deref(), Some("upstream_error"));
}

#[tokio::test]
async fn oversized_download_is_terminal_too_large() {
    let body = vec![0u8; 2 * 1024 * 1024];
    let h = harness(
        StaticFetcher::serving(body),
        RunnerLimits {
            max_download_mb: 1,
            ..RunnerLimits::default()
        },
    );
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Zip, 0),
    )
    .await
    .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Error);
    assert_eq!(export.failure_reason.as_deref(), Some("too_large"));
}

/// Hands the whole body back as a single oversized chunk, so the spool
/// loop's 1-MiB slice handling is what enforces the limits.
struct JumboChunkFetcher {
    body: Vec<u8>,
}

#[async_trait]
impl RepoFetcher for JumboChunkFetcher {
    async fn fetch_tarball(
        &self,
        _owner: &str,
        _repo: &str,
        _reference: &str,
    ) -> Result<Box<dyn TarballStream>, FetchError> {
        Ok(Box::new(JumboStream {
            chunk: Some(Bytes::from(self.body.clone())),
        }))
    }
}

struct JumboStream {
    chunk: Option<Bytes>,
}

#[async_trait]
impl TarballStream for JumboStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        Ok(self.chunk.take())
    }
}

#[tokio::test]
async fn oversized_single_chunk_is_capped_mid_chunk() {
    // 4 MiB arrives as one chunk against a 1 MiB cap: the per-slice cap
    // check must fire partway through the chunk.
    let h = harness_with(
        Arc::new(JumboChunkFetcher {
            body: vec![0u8; 4 * 1024 * 1024],
        }),
        RunnerLimits {
            max_download_mb: 1,
            ..RunnerLimits::default()
        },
    );
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Zip, 0),
    )
    .await
    .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Error);
    assert_eq!(export.failure_reason.as_deref(), Some("too_large"));
    assert!(export.artifacts.is_empty());
}

#[tokio::test]
async fn user_cancel_during_spool_leaves_no_artifact() {
    let src = make_tar_gz(&[("a.txt", b"data")]);
    let h = harness(StaticFetcher::serving(src), RunnerLimits::default());
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    // Flag raised before the spool loop starts: the runner must observe it
    // at its first cancellation checkpoint in the loop.
    assert!(h.deps.exports.request_cancel(&id).await);

    run_export(
        &h.deps,
        &CancellationToken::new(),
        &task_for(&id, ExportFormat::Zip, 0),
    )
    .await
    .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Cancelled);
    assert_eq!(export.failure_reason.as_deref(), Some("user_cancelled"));
    assert!(export.artifacts.is_empty());

    let (files, _) = h.deps.artifacts.list_by_export_id(&id).unwrap();
    assert!(files.is_empty(), "aborted writer must not be linked");
}

#[tokio::test]
async fn shutdown_token_cancels_with_context_reason() {
    let src = make_tar_gz(&[("a.txt", b"data")]);
    let h = harness(StaticFetcher::serving(src), RunnerLimits::default());
    let id = queued_export(&h.deps, ExportFormat::Zip).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    run_export(&h.deps, &cancel, &task_for(&id, ExportFormat::Zip, 0))
        .await
        .unwrap();

    let export = h.deps.exports.get(&id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Cancelled);
    assert_eq!(export.failure_reason.as_deref(), Some("context_cancelled"));
}

#[tokio::test]
async fn undecodable_payload_is_fatal_for_the_delivery() {
    let h = harness(
        StaticFetcher::serving(Vec::new()),
        RunnerLimits::default(),
    );
    let task = Task {
        task_type: TASK_TYPE_EXPORT.to_string(),
        payload: b"not json".to_vec(),
        attempt: 0,
        max_retries: 3,
        timeout: Duration::from_secs(10),
    };
    let outcome = run_export(&h.deps, &CancellationToken::new(), &task).await;
    assert!(matches!(outcome, Err(TaskError::Fatal(_))));
}
