//! Exports state store: the authoritative in-memory export map with
//! optional write-through to a durable repository, snapshot subscriptions
//! for SSE observers and a background reconciliation loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{ArtifactRef, ExportOptions, ExportStatus};

/// Buffer size of one subscriber channel. Intermediate snapshots are
/// dropped for slow subscribers; the terminal snapshot always arrives
/// because the runner emits it last and the channel drains until close.
const SUBSCRIBER_BUFFER: usize = 8;

/// Write-through / reconciliation timeout against the durable repository.
const REPO_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const REPO_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// One user-visible export request and its lifecycle state.
#[derive(Debug, Clone)]
pub struct Export {
    pub id: String,
    pub owner: String,
    pub repo: String,
    pub reference: String,
    pub options: ExportOptions,
    pub status: ExportStatus,
    pub progress: u8,
    pub failure_reason: Option<String>,
    pub cancel_requested: bool,
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Immutable copy dispatched to subscribers and returned by queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSnapshot {
    pub export_id: String,
    pub status: ExportStatus,
    pub progress: u8,
    pub failure_reason: Option<String>,
    pub cancel_requested: bool,
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Export {
    fn snapshot(&self) -> ExportSnapshot {
        ExportSnapshot {
            export_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            failure_reason: self.failure_reason.clone(),
            cancel_requested: self.cancel_requested,
            artifacts: self.artifacts.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Contract of the durable exports repository (external collaborator).
#[async_trait]
pub trait ExportsRepo: Send + Sync {
    async fn create_or_reuse(&self, export: &Export) -> anyhow::Result<()>;
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Export>>;
    async fn update_status(
        &self,
        id: &str,
        status: ExportStatus,
        progress: Option<u8>,
        failure_reason: Option<String>,
    ) -> anyhow::Result<()>;
    async fn add_artifact(&self, id: &str, artifact: ArtifactRef) -> anyhow::Result<()>;
    async fn request_cancel(&self, id: &str) -> anyhow::Result<bool>;
    async fn is_cancel_requested(&self, id: &str) -> anyhow::Result<bool>;
}

struct Inner {
    by_id: HashMap<String, Export>,
    by_idem: HashMap<String, String>,
    listeners: HashMap<String, HashMap<u64, mpsc::Sender<ExportSnapshot>>>,
    next_sub_id: u64,
    gen_seq: u64,
    id_prefix: String,
}

/// Authoritative per-process export store.
pub struct ExportsStore {
    inner: Mutex<Inner>,
    repo: Option<Arc<dyn ExportsRepo>>,
    sync_started: AtomicBool,
}

impl ExportsStore {
    #[must_use]
    pub fn new(id_prefix: &str) -> Self {
        Self::with_repo(id_prefix, None)
    }

    #[must_use]
    pub fn with_repo(id_prefix: &str, repo: Option<Arc<dyn ExportsRepo>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                by_idem: HashMap::new(),
                listeners: HashMap::new(),
                next_sub_id: 0,
                gen_seq: 0,
                id_prefix: id_prefix.to_string(),
            }),
            repo,
            sync_started: AtomicBool::new(false),
        }
    }

    /// Create a new export or return the existing one mapped to the same
    /// idempotency key. The second value reports reuse.
    pub async fn create_or_reuse(
        &self,
        owner: &str,
        repo: &str,
        reference: &str,
        mut options: ExportOptions,
    ) -> (Export, bool) {
        let key = options.idempotency_key.trim().to_string();

        let export = {
            let mut inner = self.inner.lock().expect("exports lock");
            if !key.is_empty() {
                if let Some(id) = inner.by_idem.get(&key) {
                    if let Some(existing) = inner.by_id.get(id) {
                        return (existing.clone(), true);
                    }
                }
            }

            inner.gen_seq += 1;
            let id = format!(
                "{}_{}_{}",
                inner.id_prefix,
                Utc::now().format("%Y%m%dT%H%M%S"),
                inner.gen_seq
            );
            let key = if key.is_empty() { id.clone() } else { key };
            options.idempotency_key = key.clone();

            let export = Export {
                id: id.clone(),
                owner: owner.to_string(),
                repo: repo.to_string(),
                reference: reference.to_string(),
                options,
                status: ExportStatus::Queued,
                progress: 0,
                failure_reason: None,
                cancel_requested: false,
                artifacts: Vec::new(),
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            };
            inner.by_id.insert(id.clone(), export.clone());
            inner.by_idem.insert(key, id);
            export
        };

        if let Some(repo) = &self.repo {
            let write = tokio::time::timeout(REPO_WRITE_TIMEOUT, repo.create_or_reuse(&export));
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(export_id = %export.id, error = %e, "repo create_or_reuse failed"),
                Err(_) => warn!(export_id = %export.id, "repo create_or_reuse timed out"),
            }
        }
        (export, false)
    }

    /// Current export state, reconciled from the durable repository when
    /// one is configured.
    pub async fn get(&self, id: &str) -> Option<Export> {
        if self.repo.is_some() {
            if let Some(export) = self.sync_from_repo(id).await {
                return Some(export);
            }
        }
        self.inner
            .lock()
            .expect("exports lock")
            .by_id
            .get(id)
            .cloned()
    }

    /// Apply a status transition under the lock and fan the snapshot out.
    ///
    /// Progress only moves forward on entry to `error`/`cancelled`;
    /// `started_at` is assigned on first entry to `running` and
    /// `finished_at` on entry to any terminal state. Transitions out of a
    /// terminal state are ignored.
    pub async fn update_status(
        &self,
        id: &str,
        status: ExportStatus,
        progress: Option<u8>,
        failure_reason: Option<String>,
    ) {
        let dispatch = {
            let mut inner = self.inner.lock().expect("exports lock");
            let Some(export) = inner.by_id.get_mut(id) else {
                return;
            };
            if export.status.is_terminal() && status != export.status {
                debug!(export_id = %id, from = export.status.as_str(), to = status.as_str(),
                    "ignoring status transition out of terminal state");
                return;
            }
            export.status = status;
            if let Some(p) = progress {
                let p = p.min(100);
                match status {
                    ExportStatus::Error | ExportStatus::Cancelled => {
                        if p >= export.progress {
                            export.progress = p;
                        }
                    }
                    _ => export.progress = p,
                }
            }
            export.failure_reason = failure_reason.clone();
            let now = Utc::now();
            match status {
                ExportStatus::Running => {
                    if export.started_at.is_none() {
                        export.started_at = Some(now);
                    }
                }
                ExportStatus::Done | ExportStatus::Error | ExportStatus::Cancelled => {
                    if export.finished_at.is_none() {
                        export.finished_at = Some(now);
                    }
                }
                ExportStatus::Queued => {}
            }
            let snapshot = export.snapshot();
            let listeners = inner.collect_listeners(id);
            Some((snapshot, listeners))
        };

        if let Some(repo) = &self.repo {
            let write = tokio::time::timeout(
                REPO_WRITE_TIMEOUT,
                repo.update_status(id, status, progress, failure_reason),
            );
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(export_id = %id, error = %e, "repo update_status failed"),
                Err(_) => warn!(export_id = %id, "repo update_status timed out"),
            }
        }

        if let Some((snapshot, listeners)) = dispatch {
            Self::dispatch(&listeners, snapshot);
        }
    }

    /// Shorthand for a running-progress update.
    pub async fn set_progress(&self, id: &str, progress: u8) {
        self.update_status(id, ExportStatus::Running, Some(progress), None)
            .await;
    }

    /// Append a finalized artifact to the export record.
    pub async fn add_artifact(&self, id: &str, artifact: ArtifactRef) {
        let dispatch = {
            let mut inner = self.inner.lock().expect("exports lock");
            let Some(export) = inner.by_id.get_mut(id) else {
                return;
            };
            export.artifacts.push(artifact.clone());
            let snapshot = export.snapshot();
            let listeners = inner.collect_listeners(id);
            Some((snapshot, listeners))
        };

        if let Some(repo) = &self.repo {
            let write = tokio::time::timeout(REPO_WRITE_TIMEOUT, repo.add_artifact(id, artifact));
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(export_id = %id, error = %e, "repo add_artifact failed"),
                Err(_) => warn!(export_id = %id, "repo add_artifact timed out"),
            }
        }

        if let Some((snapshot, listeners)) = dispatch {
            Self::dispatch(&listeners, snapshot);
        }
    }

    /// Raise the cooperative cancel flag. Returns false when the export is
    /// unknown or already terminal.
    pub async fn request_cancel(&self, id: &str) -> bool {
        let dispatch = {
            let mut inner = self.inner.lock().expect("exports lock");
            let Some(export) = inner.by_id.get_mut(id) else {
                return false;
            };
            if export.status.is_terminal() {
                return false;
            }
            export.cancel_requested = true;
            let snapshot = export.snapshot();
            let listeners = inner.collect_listeners(id);
            Some((snapshot, listeners))
        };

        if let Some(repo) = &self.repo {
            let write = tokio::time::timeout(REPO_WRITE_TIMEOUT, repo.request_cancel(id));
            match write.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(export_id = %id, error = %e, "repo request_cancel failed"),
                Err(_) => warn!(export_id = %id, "repo request_cancel timed out"),
            }
        }

        if let Some((snapshot, listeners)) = dispatch {
            Self::dispatch(&listeners, snapshot);
        }
        true
    }

    /// Local-only cancel check; cheap enough for tight loops.
    #[must_use]
    pub fn is_cancel_requested_local(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("exports lock")
            .by_id
            .get(id)
            .is_some_and(|e| e.cancel_requested)
    }

    /// Cancel check with a durable-repository fallback for flags raised by
    /// other processes.
    pub async fn is_cancel_requested(&self, id: &str) -> bool {
        if self.is_cancel_requested_local(id) {
            return true;
        }
        if let Some(repo) = &self.repo {
            let read = tokio::time::timeout(REPO_READ_TIMEOUT, repo.is_cancel_requested(id));
            if let Ok(Ok(true)) = read.await {
                return true;
            }
        }
        false
    }

    /// Subscribe to snapshots of one export. Returns `None` for unknown
    /// ids. Dropping the subscription deregisters and closes the channel.
    pub fn subscribe(self: &Arc<Self>, id: &str) -> Option<Subscription> {
        let mut inner = self.inner.lock().expect("exports lock");
        if !inner.by_id.contains_key(id) {
            return None;
        }
        inner.next_sub_id += 1;
        let sub_id = inner.next_sub_id;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        inner
            .listeners
            .entry(id.to_string())
            .or_default()
            .insert(sub_id, tx);
        Some(Subscription {
            store: Arc::clone(self),
            export_id: id.to_string(),
            sub_id,
            rx,
        })
    }

    /// Background loop reconciling non-terminal exports from the durable
    /// repository. No-op without a repository; starts at most once.
    pub fn start_sync(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.repo.is_none() || interval.is_zero() {
            return None;
        }
        if self.sync_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let store = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for id in store.active_export_ids() {
                            store.sync_from_repo(&id).await;
                        }
                    }
                }
            }
        }))
    }

    fn active_export_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("exports lock");
        inner
            .by_id
            .values()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.id.clone())
            .collect()
    }

    async fn sync_from_repo(&self, id: &str) -> Option<Export> {
        let repo = self.repo.as_ref()?;
        let fetched = tokio::time::timeout(REPO_READ_TIMEOUT, repo.get_by_id(id))
            .await
            .ok()?
            .ok()??;

        let (result, dispatch) = {
            let mut inner = self.inner.lock().expect("exports lock");
            match inner.by_id.get_mut(id) {
                Some(local) => {
                    let changed = merge_export(local, &fetched);
                    let snapshot = local.snapshot();
                    let result = local.clone();
                    let listeners = inner.collect_listeners(id);
                    (result, changed.then_some((snapshot, listeners)))
                }
                None => {
                    let key = fetched.options.idempotency_key.clone();
                    inner.by_id.insert(id.to_string(), fetched.clone());
                    if !key.is_empty() {
                        inner.by_idem.insert(key, id.to_string());
                    }
                    let listeners = inner.collect_listeners(id);
                    let dispatch = Some((fetched.snapshot(), listeners));
                    (fetched, dispatch)
                }
            }
        };

        if let Some((snapshot, listeners)) = dispatch {
            Self::dispatch(&listeners, snapshot);
        }
        Some(result)
    }

    fn dispatch(listeners: &[mpsc::Sender<ExportSnapshot>], snapshot: ExportSnapshot) {
        for tx in listeners {
            // Non-blocking send: slow subscribers lose intermediate
            // snapshots rather than stalling the runner.
            let _ = tx.try_send(snapshot.clone());
        }
    }
}

impl Inner {
    fn collect_listeners(&self, id: &str) -> Vec<mpsc::Sender<ExportSnapshot>> {
        self.listeners
            .get(id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Merge repository state into the local record; true when anything
/// observable changed.
fn merge_export(dst: &mut Export, src: &Export) -> bool {
    let mut changed = false;
    if dst.status != src.status {
        dst.status = src.status;
        changed = true;
    }
    if dst.progress != src.progress {
        dst.progress = src.progress;
        changed = true;
    }
    if dst.failure_reason != src.failure_reason {
        dst.failure_reason = src.failure_reason.clone();
        changed = true;
    }
    if dst.cancel_requested != src.cancel_requested {
        dst.cancel_requested = src.cancel_requested;
        changed = true;
    }
    if dst.started_at != src.started_at {
        dst.started_at = src.started_at;
        changed = true;
    }
    if dst.finished_at != src.finished_at {
        dst.finished_at = src.finished_at;
        changed = true;
    }
    if !src.artifacts.is_empty() && dst.artifacts.len() != src.artifacts.len() {
        dst.artifacts = src.artifacts.clone();
        changed = true;
    }
    changed
}

/// Live subscription handle; deregisters on drop.
pub struct Subscription {
    store: Arc<ExportsStore>,
    export_id: String,
    sub_id: u64,
    rx: mpsc::Receiver<ExportSnapshot>,
}

impl Subscription {
    /// Next snapshot, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<ExportSnapshot> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = self.store.inner.lock().expect("exports lock");
        if let Some(subs) = inner.listeners.get_mut(&self.export_id) {
            subs.remove(&self.sub_id);
            if subs.is_empty() {
                inner.listeners.remove(&self.export_id);
            }
        }
    }
}
