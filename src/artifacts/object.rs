//! Object-store adapter speaking S3-compatible semantics through the
//! `ObjectClient` contract. The wire client itself is an external
//! collaborator; `MemoryObjectClient` is the reference implementation used
//! by the test suite.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{
    detect_content_type, is_safe_id, new_artifact_id, ArtifactError, ArtifactIndexEntry,
    ArtifactMeta, ArtifactStore, ArtifactWriter, Manifest,
};

/// Upload/download contract of the backing object store.
///
/// Keys are flat `/`-separated strings. Implementations must be safe for
/// concurrent use.
pub trait ObjectClient: Send + Sync {
    fn put_object(
        &self,
        key: &str,
        data: &mut dyn Read,
        len: u64,
        content_type: &str,
    ) -> io::Result<()>;

    /// `Ok(None)` when the key does not exist.
    fn get_object(&self, key: &str) -> io::Result<Option<Box<dyn Read + Send>>>;

    fn remove_object(&self, key: &str) -> io::Result<()>;

    /// Immediate child "directories" under a prefix (export ids for the
    /// store layout).
    fn list_dirs(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Recursively delete everything under a prefix.
    fn remove_prefix(&self, prefix: &str) -> io::Result<()>;
}

struct ObjInner {
    client: Arc<dyn ObjectClient>,
    prefix: String,
    ttl_hours: u32,
    manifest_lock: Mutex<()>,
}

/// Artifact store persisting into an object store under an optional key
/// prefix. Writers spool to a local temp file and upload on finalize, as
/// object stores have no append semantics.
#[derive(Clone)]
pub struct ObjectArtifactStore {
    inner: Arc<ObjInner>,
}

impl ObjectArtifactStore {
    #[must_use]
    pub fn new(client: Arc<dyn ObjectClient>, prefix: &str, ttl_hours: u32) -> Self {
        let mut prefix = prefix.trim_matches('/').to_string();
        if !prefix.is_empty() {
            prefix.push('/');
        }
        Self {
            inner: Arc::new(ObjInner {
                client,
                prefix,
                ttl_hours,
                manifest_lock: Mutex::new(()),
            }),
        }
    }
}

impl ObjInner {
    fn object_key(&self, export_id: &str, name: &str) -> String {
        format!("{}{}/{}", self.prefix, export_id, name)
    }

    fn manifest_key(&self, export_id: &str) -> String {
        format!("{}{}/manifest.json", self.prefix, export_id)
    }

    fn index_key(&self, artifact_id: &str) -> String {
        format!("{}index/{}.json", self.prefix, artifact_id)
    }

    fn read_manifest(&self, export_id: &str) -> Result<Manifest, ArtifactError> {
        let Some(mut reader) = self.client.get_object(&self.manifest_key(export_id))? else {
            return Err(ArtifactError::NotFound);
        };
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_manifest(&self, export_id: &str, manifest: &Manifest) -> Result<(), ArtifactError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        let len = bytes.len() as u64;
        self.client.put_object(
            &self.manifest_key(export_id),
            &mut bytes.as_slice(),
            len,
            "application/json",
        )?;
        Ok(())
    }

    fn ensure_manifest(&self, export_id: &str) -> Result<(), ArtifactError> {
        let _guard = self.manifest_lock.lock().expect("manifest lock");
        match self.read_manifest(export_id) {
            Ok(_) => Ok(()),
            Err(ArtifactError::NotFound) => {
                self.write_manifest(export_id, &Manifest::new(export_id, self.ttl_hours))
            }
            Err(e) => Err(e),
        }
    }

    fn update_manifest(&self, export_id: &str, meta: ArtifactMeta) -> Result<(), ArtifactError> {
        let _guard = self.manifest_lock.lock().expect("manifest lock");
        let mut manifest = self.read_manifest(export_id)?;
        manifest.upsert(meta, self.ttl_hours);
        self.write_manifest(export_id, &manifest)
    }

    fn write_index(&self, artifact_id: &str, entry: &ArtifactIndexEntry) -> Result<(), ArtifactError> {
        let bytes = serde_json::to_vec(entry)?;
        let len = bytes.len() as u64;
        self.client.put_object(
            &self.index_key(artifact_id),
            &mut bytes.as_slice(),
            len,
            "application/json",
        )?;
        Ok(())
    }

    fn read_index(&self, artifact_id: &str) -> Result<ArtifactIndexEntry, ArtifactError> {
        let Some(mut reader) = self.client.get_object(&self.index_key(artifact_id))? else {
            return Err(ArtifactError::NotFound);
        };
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let entry: ArtifactIndexEntry = serde_json::from_slice(&bytes)?;
        if entry.export_id.is_empty() || entry.name.is_empty() {
            return Err(ArtifactError::NotFound);
        }
        Ok(entry)
    }
}

impl ArtifactStore for ObjectArtifactStore {
    fn create_artifact(
        &self,
        export_id: &str,
        kind: &str,
        name: &str,
    ) -> Result<(ArtifactWriter, ArtifactMeta), ArtifactError> {
        if export_id.is_empty() || !is_safe_id(export_id) {
            return Err(ArtifactError::InvalidId(export_id.to_string()));
        }
        let base = std::path::Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or(ArtifactError::EmptyName)?;
        if base.is_empty() {
            return Err(ArtifactError::EmptyName);
        }

        self.inner.ensure_manifest(export_id)?;

        let artifact_id = new_artifact_id();
        let meta = ArtifactMeta {
            id: artifact_id.clone(),
            kind: kind.to_ascii_lowercase(),
            name: base,
            size: 0,
        };

        let tmp_path: PathBuf =
            std::env::temp_dir().join(format!("repoexport-{artifact_id}.tmp"));
        let file = File::create(&tmp_path)?;

        let inner = Arc::clone(&self.inner);
        let export_owned = export_id.to_string();
        let tmp_for_finalize = tmp_path.clone();
        let finalize = Box::new(move |mut meta: ArtifactMeta, size: u64| {
            meta.size = size;
            let mut src = File::open(&tmp_for_finalize)?;
            inner.client.put_object(
                &inner.object_key(&export_owned, &meta.name),
                &mut src,
                size,
                detect_content_type(&meta.name),
            )?;
            inner.update_manifest(&export_owned, meta.clone())?;
            inner.write_index(
                &meta.id,
                &ArtifactIndexEntry {
                    export_id: export_owned.clone(),
                    name: meta.name.clone(),
                },
            )?;
            let _ = std::fs::remove_file(&tmp_for_finalize);
            debug!(artifact_id = %meta.id, export_id = %export_owned, size, "artifact uploaded");
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
        let entry = self.inner.read_index(artifact_id)?;
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

        let key = self.inner.object_key(&entry.export_id, &entry.name);
        let Some(mut reader) = self.inner.client.get_object(&key)? else {
            return Err(ArtifactError::NotFound);
        };
        // Spool into an anonymous temp file so callers get a seekable File
        // that vanishes on close.
        let mut file = tempfile::tempfile()?;
        io::copy(&mut reader, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
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
        let Ok(export_ids) = self.inner.client.list_dirs(&self.inner.prefix) else {
            return;
        };
        let now = Utc::now();
        for export_id in export_ids {
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
                let _ = self.inner.client.remove_object(&self.inner.index_key(&file.id));
            }
            let prefix = format!("{}{}/", self.inner.prefix, export_id);
            if let Err(e) = self.inner.client.remove_prefix(&prefix) {
                warn!(export_id = %export_id, error = %e, "gc failed to remove expired prefix");
            }
        }
    }
}

/// In-memory implementation of the object-store contract.
#[derive(Default)]
pub struct MemoryObjectClient {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, for test assertions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().expect("objects lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectClient for MemoryObjectClient {
    fn put_object(
        &self,
        key: &str,
        data: &mut dyn Read,
        _len: u64,
        _content_type: &str,
    ) -> io::Result<()> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.objects
            .lock()
            .expect("objects lock")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    fn get_object(&self, key: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        let objects = self.objects.lock().expect("objects lock");
        Ok(objects
            .get(key)
            .cloned()
            .map(|bytes| Box::new(io::Cursor::new(bytes)) as Box<dyn Read + Send>))
    }

    fn remove_object(&self, key: &str) -> io::Result<()> {
        self.objects.lock().expect("objects lock").remove(key);
        Ok(())
    }

    fn list_dirs(&self, prefix: &str) -> io::Result<Vec<String>> {
        let objects = self.objects.lock().expect("objects lock");
        let mut dirs: Vec<String> = Vec::new();
        for key in objects.keys() {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            if let Some((dir, _)) = rest.split_once('/') {
                if !dirs.iter().any(|d| d == dir) {
                    dirs.push(dir.to_string());
                }
            }
        }
        Ok(dirs)
    }

    fn remove_prefix(&self, prefix: &str) -> io::Result<()> {
        let mut objects = self.objects.lock().expect("objects lock");
        objects.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
