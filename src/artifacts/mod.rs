//! Artifact store: per-export manifests with TTL, a reverse index for O(1)
//! download lookup, and interchangeable filesystem / object-store backends.

pub mod fs;
pub mod object;

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

pub use fs::FsArtifactStore;
pub use object::{MemoryObjectClient, ObjectArtifactStore, ObjectClient};

/// Errors surfaced by the artifact store contract.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found")]
    NotFound,
    #[error("artifact expired")]
    Expired,
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("empty artifact name")]
    EmptyName,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("manifest decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

static SAFE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("safe-id regex"));

/// Whether an export/artifact id uses only the safe charset.
#[must_use]
pub fn is_safe_id(id: &str) -> bool {
    SAFE_ID_RE.is_match(id)
}

/// New artifact id: `art_` plus 128 bits of randomness in hex.
#[must_use]
pub fn new_artifact_id() -> String {
    format!("art_{}", Uuid::new_v4().simple())
}

/// Metadata of one stored artifact, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: String,
    /// `zip` or `txt`.
    pub kind: String,
    pub name: String,
    pub size: u64,
}

/// Per-export manifest persisted next to the artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub export_id: String,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ArtifactMeta>,
    pub ttl_hours: u32,
    pub expires_at: DateTime<Utc>,
}

impl Manifest {
    #[must_use]
    pub fn new(export_id: &str, ttl_hours: u32) -> Self {
        let now = Utc::now();
        Self {
            export_id: export_id.to_string(),
            generated_at: now,
            files: Vec::new(),
            ttl_hours,
            expires_at: now + chrono::Duration::hours(i64::from(ttl_hours)),
        }
    }

    /// Replace-by-id or append, then advance `generatedAt`/`expiresAt`.
    pub fn upsert(&mut self, meta: ArtifactMeta, default_ttl_hours: u32) {
        match self.files.iter_mut().find(|f| f.id == meta.id) {
            Some(slot) => *slot = meta,
            None => self.files.push(meta),
        }
        let now = Utc::now();
        self.generated_at = now;
        if self.ttl_hours == 0 {
            self.ttl_hours = default_ttl_hours;
        }
        self.expires_at = now + chrono::Duration::hours(i64::from(self.ttl_hours));
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Reverse index entry mapping an artifact id back to its export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactIndexEntry {
    pub export_id: String,
    pub name: String,
}

/// Storage contract shared by the filesystem and object-store backends.
///
/// Reads hand back a real `File` in both backends (the object backend spools
/// to a temp file first), which keeps downloads uniformly streamable.
pub trait ArtifactStore: Send + Sync {
    /// Open a write-stream for a new artifact under `export_id`. The
    /// manifest is created with the default TTL if absent. Nothing is
    /// linked into the manifest until the writer is finalized.
    fn create_artifact(
        &self,
        export_id: &str,
        kind: &str,
        name: &str,
    ) -> Result<(ArtifactWriter, ArtifactMeta), ArtifactError>;

    /// Resolve an artifact id through the reverse index and stream it.
    /// Returns `Expired` when the owning manifest is past its TTL.
    fn open_by_artifact_id(
        &self,
        artifact_id: &str,
    ) -> Result<(File, ArtifactMeta, String), ArtifactError>;

    /// List the manifest of one export.
    fn list_by_export_id(
        &self,
        export_id: &str,
    ) -> Result<(Vec<ArtifactMeta>, DateTime<Utc>), ArtifactError>;

    /// Delete every export whose manifest is past its TTL.
    fn gc_once(&self);
}

type FinalizeFn = Box<dyn FnOnce(ArtifactMeta, u64) -> Result<ArtifactMeta, ArtifactError> + Send>;

/// Write-stream for one artifact. Bytes accumulate in temporary storage;
/// `finalize` fixes the size, moves/uploads the payload to its canonical
/// location and links it into the manifest atomically.
pub struct ArtifactWriter {
    file: Option<File>,
    tmp_path: PathBuf,
    meta: ArtifactMeta,
    finalize: Option<FinalizeFn>,
}

impl ArtifactWriter {
    pub(crate) fn new(file: File, tmp_path: PathBuf, meta: ArtifactMeta, finalize: FinalizeFn) -> Self {
        Self {
            file: Some(file),
            tmp_path,
            meta,
            finalize: Some(finalize),
        }
    }

    /// Metadata as known before finalize (size still zero).
    #[must_use]
    pub fn meta(&self) -> &ArtifactMeta {
        &self.meta
    }

    /// Close the stream: determine the final size, publish the payload and
    /// update manifest plus reverse index. Consumes the writer.
    pub fn finalize(mut self) -> Result<ArtifactMeta, ArtifactError> {
        let mut file = self.file.take().ok_or(ArtifactError::NotFound)?;
        file.flush()?;
        let size = file.metadata()?.len();
        file.sync_all().ok();
        drop(file);
        let finalize = self
            .finalize
            .take()
            .expect("artifact writer finalized twice");
        finalize(self.meta.clone(), size)
    }

    /// Drop the stream and its temporary bytes without linking anything.
    pub fn abort(mut self) {
        self.file.take();
        let _ = std::fs::remove_file(&self.tmp_path);
        self.finalize.take();
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "writer closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Seek for ArtifactWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self.file.as_mut() {
            Some(f) => f.seek(pos),
            None => Err(io::Error::new(io::ErrorKind::Other, "writer closed")),
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        // Unfinalized writers leave no temp debris behind. After finalize
        // the temp path no longer exists and the remove is a no-op.
        self.file.take();
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

/// Content type by file extension, with an explicit charset for text.
#[must_use]
pub fn detect_content_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "zip" => "application/zip",
        "json" => "application/json",
        "md" | "txt" | "text" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Spawn the periodic expired-manifest sweep.
pub fn start_gc(
    store: Arc<dyn ArtifactStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quick.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let store = Arc::clone(&store);
                    if let Err(e) = tokio::task::spawn_blocking(move || store.gc_once()).await {
                        warn!(error = %e, "artifact gc sweep panicked");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_id_charset() {
        assert!(is_safe_id("exp_20240101T000000_1"));
        assert!(is_safe_id("art_0123abcd"));
        assert!(is_safe_id("a.b-c_d"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id("a b"));
        assert!(!is_safe_id("../x"));
    }

    #[test]
    fn artifact_ids_are_unique_and_safe() {
        let a = new_artifact_id();
        let b = new_artifact_id();
        assert_ne!(a, b);
        assert!(a.starts_with("art_"));
        assert_eq!(a.len(), 4 + 32);
        assert!(is_safe_id(&a));
    }

    #[test]
    fn manifest_upsert_replaces_by_id_and_advances_expiry() {
        let mut m = Manifest::new("exp1", 48);
        let before = m.expires_at;
        m.upsert(
            ArtifactMeta {
                id: "art_1".into(),
                kind: "zip".into(),
                name: "bundle.zip".into(),
                size: 10,
            },
            72,
        );
        assert_eq!(m.files.len(), 1);
        assert!(m.expires_at >= before);

        m.upsert(
            ArtifactMeta {
                id: "art_1".into(),
                kind: "zip".into(),
                name: "bundle.zip".into(),
                size: 99,
            },
            72,
        );
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.files[0].size, 99);
    }

    #[test]
    fn content_types() {
        assert_eq!(detect_content_type("bundle.zip"), "application/zip");
        assert_eq!(detect_content_type("concat.txt"), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type("doc.md"), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type("blob"), "application/octet-stream");
    }
}
