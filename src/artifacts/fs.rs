//! Filesystem-backed artifact store rooted at a directory.
//!
//! Layout: `<root>/<exportId>/manifest.json`, `<root>/<exportId>/<name>`,
//! `<root>/index/<artifactId>.json`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{
    is_safe_id, new_artifact_id, ArtifactError, ArtifactIndexEntry, ArtifactMeta, ArtifactStore,
    ArtifactWriter, Manifest,
};

struct FsInner {
    root: PathBuf,
    ttl_hours: u32,
    /// Serializes manifest read-modify-write cycles.
    manifest_lock: Mutex<()>,
}

/// Filesystem artifact store. Clone-cheap (shared inner).
#[derive(Clone)]
pub struct FsArtifactStore {
    inner: Arc<FsInner>,
}

impl FsArtifactStore {
    /// Create the store, ensuring the root and index directories exist.
    pub fn new(root: impl AsRef<Path>, ttl_hours: u32) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("index"))?;
        Ok(Self {
            inner: Arc::new(FsInner {
                root,
                ttl_hours,
                manifest_lock: Mutex::new(()),
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

impl FsInner {
    fn manifest_path(&self, export_id: &str) -> PathBuf {
        self.root.join(export_id).join("manifest.json")
    }

    fn index_path(&self, artifact_id: &str) -> PathBuf {
        self.root.join("index").join(format!("{artifact_id}.json"))
    }

    fn read_manifest(&self, export_id: &str) -> Result<Manifest, ArtifactError> {
        let bytes = fs::read(self.manifest_path(export_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound
            } else {
                ArtifactError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_manifest(&self, export_id: &str, manifest: &Manifest) -> Result<(), ArtifactError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        fs::write(self.manifest_path(export_id), bytes)?;
        Ok(())
    }

    fn ensure_manifest(&self, export_id: &str) -> Result<(), ArtifactError> {
        let _guard = self.manifest_lock.lock().expect("manifest lock");
        if self.manifest_path(export_id).exists() {
            return Ok(());
        }
        self.write_manifest(export_id, &Manifest::new(export_id, self.ttl_hours))
    }

    fn update_manifest(&self, export_id: &str, meta: ArtifactMeta) -> Result<(), ArtifactError> {
        let _guard = self.manifest_lock.lock().expect("manifest lock");
        let mut manifest = self.read_manifest(export_id)?;
        manifest.upsert(meta, self.ttl_hours);
        self.write_manifest(export_id, &manifest)
    }

    fn write_index(&self, artifact_id: &str, entry: &ArtifactIndexEntry) -> Result<(), ArtifactError> {
        let bytes = serde_json::to_vec(entry)?;
        fs::write(self.index_path(artifact_id), bytes)?;
        Ok(())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn create_artifact(
        &self,
        export_id: &str,
        kind: &str,
        name: &str,
    ) -> Result<(ArtifactWriter, ArtifactMeta), ArtifactError> {
        if export_id.is_empty() || !is_safe_id(export_id) {
            return Err(ArtifactError::InvalidId(export_id.to_string()));
        }
        let base = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or(ArtifactError::EmptyName)?;
        if base.is_empty() {
            return Err(ArtifactError::EmptyName);
        }

        let dir = self.inner.root.join(export_id);
        fs::create_dir_all(&dir)?;
        self.inner.ensure_manifest(export_id)?;

        let artifact_id = new_artifact_id();
        let meta = ArtifactMeta {
            id: artifact_id.clone(),
            kind: kind.to_ascii_lowercase(),
            name: base.clone(),
            size: 0,
        };

        let tmp_path = dir.join(format!(".{artifact_id}.tmp"));
        let file = File::create(&tmp_path)?;

        let inner = Arc::clone(&self.inner);
        let export_owned = export_id.to_string();
        let final_path = dir.join(&base);
        let tmp_for_finalize = tmp_path.clone();
        let finalize = Box::new(move |mut meta: ArtifactMeta, size: u64| {
            meta.size = size;
            fs::rename(&tmp_for_finalize, &final_path)?;
            inner.update_manifest(&export_owned, meta.clone())?;
            inner.write_index(
                &meta.id,
                &ArtifactIndexEntry {
                    export_id: export_owned.clone(),
                    name: meta.name.clone(),
                },
            )?;
            debug!(artifact_id = %meta.id, export_id = %export_owned, size, "artifact finalized");
            Ok(meta)
        });

        Ok((ArtifactWriter::new(file, tmp_path, meta.clone(), finalize), meta))
    }

    fn open_by_artifact_id(
        &self,
        artifact_id: &str,
    ) -> Result<(File, ArtifactMeta, String), ArtifactError> {
        if !is_safe_id(artifact_id) {
            return Err(ArtifactError::NotFound);
        }
        let bytes = fs::read(self.inner.index_path(artifact_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound
            } else {
                ArtifactError::Io(e)
            }
        })?;
        let entry: ArtifactIndexEntry = serde_json::from_slice(&bytes)?;

        let manifest = self.inner.read_manifest(&entry.export_id)?;
        if manifest.is_expired(Utc::now()) {
            return Err(ArtifactError::Expired);
        }
        let meta = manifest
            .files
            .iter()
            .find(|f| f.id == artifact_id)
            .cloned()
            .ok_or(ArtifactError::NotFound)?;

        let file = File::open(self.inner.root.join(&entry.export_id).join(&meta.name))?;
        Ok((file, meta, entry.export_id))
    }

    fn list_by_export_id(
        &self,
        export_id: &str,
    ) -> Result<(Vec<ArtifactMeta>, DateTime<Utc>), ArtifactError> {
        if !is_safe_id(export_id) {
            return Err(ArtifactError::NotFound);
        }
        let manifest = self.inner.read_manifest(export_id)?;
        Ok((manifest.files, manifest.expires_at))
    }

    fn gc_once(&self) {
        let Ok(entries) = fs::read_dir(&self.inner.root) else {
            return;
        };
        let now = Utc::now();
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let export_id = name.to_string_lossy();
            if export_id == "index" {
                continue;
            }
            let Ok(manifest) = self.inner.read_manifest(&export_id) else {
                continue;
            };
            if !manifest.is_expired(now) {
                continue;
            }
            for file in &manifest.files {
                let _ = fs::remove_file(self.inner.index_path(&file.id));
            }
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(export_id = %export_id, error = %e, "gc failed to remove expired export");
            } else {
                debug!(export_id = %export_id, "gc removed expired export");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn store(ttl_hours: u32) -> (FsArtifactStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path(), ttl_hours).unwrap();
        (store, dir)
    }

    #[test]
    fn create_finalize_and_open() {
        let (store, _dir) = store(72);
        let (mut writer, meta) = store.create_artifact("exp1", "zip", "bundle.zip").unwrap();
        assert_eq!(meta.size, 0);
        writer.write_all(b"payload-bytes").unwrap();
        let finalized = writer.finalize().unwrap();
        assert_eq!(finalized.size, 13);

        let (mut file, opened, export_id) = store.open_by_artifact_id(&finalized.id).unwrap();
        assert_eq!(export_id, "exp1");
        assert_eq!(opened, finalized);
        let mut body = String::new();
        file.read_to_string(&mut body).unwrap();
        assert_eq!(body, "payload-bytes");
    }

    #[test]
    fn unfinalized_writer_links_nothing() {
        let (store, _dir) = store(72);
        let (mut writer, meta) = store.create_artifact("exp1", "txt", "concat.txt").unwrap();
        writer.write_all(b"partial").unwrap();
        writer.abort();

        let (files, _) = store.list_by_export_id("exp1").unwrap();
        assert!(files.is_empty());
        assert!(matches!(
            store.open_by_artifact_id(&meta.id),
            Err(ArtifactError::NotFound)
        ));
    }

    #[test]
    fn rejects_unsafe_ids_and_traversal_names() {
        let (store, _dir) = store(72);
        assert!(matches!(
            store.create_artifact("a/b", "zip", "x.zip"),
            Err(ArtifactError::InvalidId(_))
        ));
        // Path components are stripped down to the base name.
        let (writer, meta) = store
            .create_artifact("exp1", "zip", "../../evil.zip")
            .unwrap();
        assert_eq!(meta.name, "evil.zip");
        writer.abort();
    }

    #[test]
    fn list_returns_manifest_contents() {
        let (store, _dir) = store(48);
        let (mut writer, _) = store.create_artifact("exp2", "zip", "bundle.zip").unwrap();
        writer.write_all(b"z").unwrap();
        let meta = writer.finalize().unwrap();

        let (files, expires_at) = store.list_by_export_id("exp2").unwrap();
        assert_eq!(files, vec![meta]);
        assert!(expires_at > Utc::now());
    }

    #[test]
    fn expired_manifest_yields_expired_and_gc_removes() {
        let (store, dir) = store(1);
        let (mut writer, _) = store.create_artifact("exp3", "zip", "bundle.zip").unwrap();
        writer.write_all(b"z").unwrap();
        let meta = writer.finalize().unwrap();

        // Rewrite the manifest with an expiry in the past.
        let manifest_path = dir.path().join("exp3").join("manifest.json");
        let mut manifest: Manifest =
            serde_json::from_slice(&fs::read(&manifest_path).unwrap()).unwrap();
        manifest.expires_at = Utc::now() - chrono::Duration::hours(2);
        fs::write(&manifest_path, serde_json::to_vec(&manifest).unwrap()).unwrap();

        assert!(matches!(
            store.open_by_artifact_id(&meta.id),
            Err(ArtifactError::Expired)
        ));

        store.gc_once();
        assert!(!dir.path().join("exp3").exists());
        assert!(matches!(
            store.open_by_artifact_id(&meta.id),
            Err(ArtifactError::NotFound)
        ));
    }

    #[test]
    fn replacing_an_artifact_keeps_one_manifest_row() {
        let (store, _dir) = store(72);
        for _ in 0..2 {
            let (mut writer, _) = store.create_artifact("exp4", "zip", "bundle.zip").unwrap();
            writer.write_all(b"data").unwrap();
            writer.finalize().unwrap();
        }
        // Distinct artifact ids, so both rows remain; same name on disk.
        let (files, _) = store.list_by_export_id("exp4").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.name == "bundle.zip"));
    }
}
