use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::metadata::{FileMetadata, PatchKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionKind {
    Baseline,
    Patch,
}

impl From<PatchKind> for VersionKind {
    fn from(kind: PatchKind) -> Self {
        match kind {
            PatchKind::Baseline => VersionKind::Baseline,
            PatchKind::Patch => VersionKind::Patch,
        }
    }
}

/// One version of a tracked file as recorded by the index service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Hex content hash; also the object-store key material.
    pub object_id: String,
    #[serde(rename = "type")]
    pub kind: VersionKind,
    pub file_size: u64,
    pub patch_size: u64,
    pub backup_time: i64,
    pub mtime: i64,
}

/// Version ordering service: remembers every published capture of a file
/// and returns the chain newest first.
pub trait VersionIndex: Send + Sync {
    /// Record a capture. Patches carry their range manifest.
    fn publish(&self, path: &Path, metadata: &FileMetadata, manifest: Option<&str>)
        -> Result<()>;

    /// The version chain for a file, newest first. Empty when the file
    /// was never published.
    fn versions(&self, path: &Path) -> Result<Vec<VersionEntry>>;
}

fn entry_for(metadata: &FileMetadata) -> VersionEntry {
    VersionEntry {
        object_id: metadata.patch_hash.to_hex(),
        kind: metadata.patch_type.into(),
        file_size: metadata.file_size,
        patch_size: metadata.patch_size,
        backup_time: metadata.backuptime,
        mtime: metadata.mtime,
    }
}

fn escape_path(path: &Path) -> String {
    url::form_urlencoded::byte_serialize(path.to_string_lossy().as_bytes()).collect()
}

/// Index kept in local JSON files, one per tracked path. Versions are
/// appended oldest first and reversed on read.
pub struct LocalVersionIndex {
    root: PathBuf,
}

impl LocalVersionIndex {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn record_path(&self, path: &Path) -> PathBuf {
        self.root.join(format!("{}.json", escape_path(path)))
    }

    fn read_all(&self, path: &Path) -> Result<Vec<VersionEntry>> {
        let record_path = self.record_path(path);
        let data = match fs::read(&record_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| {
            VaultError::Corrupt(format!("version index for '{}': {e}", path.display()))
        })
    }
}

impl VersionIndex for LocalVersionIndex {
    fn publish(
        &self,
        path: &Path,
        metadata: &FileMetadata,
        _manifest: Option<&str>,
    ) -> Result<()> {
        let mut entries = self.read_all(path)?;
        entries.push(entry_for(metadata));
        let data = serde_json::to_vec(&entries)
            .map_err(|e| VaultError::Corrupt(format!("encoding version index: {e}")))?;
        fs::write(self.record_path(path), data)?;
        Ok(())
    }

    fn versions(&self, path: &Path) -> Result<Vec<VersionEntry>> {
        let mut entries = self.read_all(path)?;
        entries.reverse();
        Ok(entries)
    }
}

/// Client for the HTTP index service.
///
/// Publishes captures as named objects and lists the version chain in
/// reverse chronological order. All calls are blocking with fixed
/// timeouts; basic auth on every request.
pub struct HttpVersionIndex {
    base_url: String,
    container: String,
    agent: ureq::Agent,
    auth_header: String,
}

impl HttpVersionIndex {
    pub fn new(host: &str, container: &str, username: &str, password: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let base_url = if host.contains("://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };

        let auth_header = format!("Basic {}", STANDARD.encode(format!("{username}:{password}")));

        Self {
            base_url,
            container: container.to_string(),
            agent,
            auth_header,
        }
    }

    fn object_url(&self, path: &Path) -> String {
        format!(
            "{}/namedObjects/{}/{}",
            self.base_url,
            self.container,
            escape_path(path)
        )
    }
}

impl VersionIndex for HttpVersionIndex {
    fn publish(
        &self,
        path: &Path,
        metadata: &FileMetadata,
        manifest: Option<&str>,
    ) -> Result<()> {
        let mut request = self
            .agent
            .post(&self.object_url(path))
            .set("Authorization", &self.auth_header)
            .set("X-Objectid", &metadata.patch_hash.to_hex());

        let response = if metadata.is_baseline() {
            request = request.set("X-Eventual-Content-Length", &metadata.file_size.to_string());
            request.send_string("")
        } else {
            request = request.set("X-Eventual-Patch-Length", &metadata.patch_size.to_string());
            if let Some(prev) = &metadata.prev_patch_hash {
                request = request.set("X-Previous-Objectid", &prev.to_hex());
            }
            request.send_string(manifest.unwrap_or(""))
        };

        response.map_err(|e| VaultError::Index(e.to_string()))?;
        Ok(())
    }

    fn versions(&self, path: &Path) -> Result<Vec<VersionEntry>> {
        let url = format!(
            "{}/namedObjects/{}/?FullPath={}&includeObjectId=1&ReverseVersionOrder=1",
            self.base_url,
            self.container,
            escape_path(path)
        );
        let response = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth_header)
            .call()
            .map_err(|e| VaultError::Index(e.to_string()))?;
        response
            .into_json::<Vec<VersionEntry>>()
            .map_err(|e| VaultError::Index(format!("decoding version list: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn metadata_with(kind: PatchKind, tag: &[u8]) -> FileMetadata {
        FileMetadata {
            backuptime: 1_700_000_000,
            atime: 0,
            mtime: 0,
            ctime: 0,
            file_size: 100,
            patch_size: 40,
            patch_type: kind,
            prev_patch_hash: None,
            patch_hash: hash_bytes(tag),
            patch_state: Vec::new(),
        }
    }

    #[test]
    fn local_index_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVersionIndex::new(dir.path()).unwrap();
        let tracked = Path::new("/data/a.txt");

        index
            .publish(tracked, &metadata_with(PatchKind::Baseline, b"v1"), None)
            .unwrap();
        index
            .publish(
                tracked,
                &metadata_with(PatchKind::Patch, b"v2"),
                Some("bytes 0-9/100"),
            )
            .unwrap();

        let versions = index.versions(tracked).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].object_id, hash_bytes(b"v2").to_hex());
        assert_eq!(versions[0].kind, VersionKind::Patch);
        assert_eq!(versions[1].kind, VersionKind::Baseline);
    }

    #[test]
    fn unknown_path_has_no_versions() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVersionIndex::new(dir.path()).unwrap();
        assert!(index.versions(Path::new("/never/seen")).unwrap().is_empty());
    }

    #[test]
    fn distinct_paths_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVersionIndex::new(dir.path()).unwrap();
        index
            .publish(
                Path::new("/data/a.txt"),
                &metadata_with(PatchKind::Baseline, b"a"),
                None,
            )
            .unwrap();
        assert!(index
            .versions(Path::new("/data/b.txt"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn version_entry_kind_uses_lowercase_names() {
        let entry = entry_for(&metadata_with(PatchKind::Baseline, b"x"));
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();
        assert_eq!(value["type"], "baseline");
    }
}
