use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::apply;
use crate::config::Config;
use crate::diff::{self, CaptureOutcome};
use crate::error::{Result, VaultError};
use crate::hash::Sha1Digest;
use crate::index::{HttpVersionIndex, LocalVersionIndex, VersionEntry, VersionIndex, VersionKind};
use crate::metadata::{mirror, MetadataStore};
use crate::store::{object_key, BlobStore, LocalBlobStore, S3BlobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Baseline,
    Patch,
    Unchanged,
}

/// Summary of one capture, for callers that report progress.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub path: PathBuf,
    pub kind: CaptureKind,
    pub object_id: String,
    pub file_size: u64,
    pub patch_size: u64,
}

/// Drives captures and restores: signer and builder on the way up,
/// download and patch composition on the way down. One engine serves many
/// tracked files; captures of the same file must not run concurrently.
pub struct Engine {
    meta: MetadataStore,
    blobs: Box<dyn BlobStore>,
    index: Box<dyn VersionIndex>,
    container: String,
    download_base: PathBuf,
}

impl Engine {
    pub fn new(
        meta: MetadataStore,
        blobs: Box<dyn BlobStore>,
        index: Box<dyn VersionIndex>,
        container: impl Into<String>,
        download_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            meta,
            blobs,
            index,
            container: container.into(),
            download_base: download_base.into(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let blobs: Box<dyn BlobStore> = match config.store.backend.as_str() {
            "local" => {
                let root = config
                    .store
                    .root
                    .clone()
                    .unwrap_or_else(|| config.sidecar_root.join("objects"));
                Box::new(LocalBlobStore::new(root)?)
            }
            "s3" => {
                let bucket = config.store.s3_bucket.as_deref().ok_or_else(|| {
                    VaultError::Config("s3 store requires s3_bucket".to_string())
                })?;
                let region = config.store.s3_region.as_deref().ok_or_else(|| {
                    VaultError::Config("s3 store requires s3_region".to_string())
                })?;
                Box::new(S3BlobStore::new(
                    bucket,
                    region,
                    config.store.s3_endpoint.as_deref(),
                )?)
            }
            other => {
                return Err(VaultError::Config(format!(
                    "unsupported store backend '{other}'"
                )))
            }
        };

        let index: Box<dyn VersionIndex> = match config.index.backend.as_str() {
            "local" => {
                let root = config
                    .index
                    .root
                    .clone()
                    .unwrap_or_else(|| config.sidecar_root.join("index"));
                Box::new(LocalVersionIndex::new(root)?)
            }
            "http" => {
                let host = config.index.host.as_deref().ok_or_else(|| {
                    VaultError::Config("http index requires host".to_string())
                })?;
                Box::new(HttpVersionIndex::new(
                    host,
                    &config.container,
                    config.index.username.as_deref().unwrap_or(""),
                    config.index.password.as_deref().unwrap_or(""),
                ))
            }
            other => {
                return Err(VaultError::Config(format!(
                    "unsupported index backend '{other}'"
                )))
            }
        };

        Ok(Self::new(
            MetadataStore::new(&config.sidecar_root),
            blobs,
            index,
            config.container.clone(),
            config.download_base.clone(),
        ))
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.meta
    }

    /// Capture the current content of `path`: baseline on first sight,
    /// patch when blocks changed, metadata refresh when nothing did. The
    /// payload is uploaded and published before the metadata record is
    /// rewritten, so a failed capture leaves the previous chain intact.
    pub fn capture(&self, path: &Path) -> Result<CaptureReport> {
        let outcome = diff::build_capture(&self.meta, path)?;

        let report = match outcome {
            CaptureOutcome::Baseline { metadata } => {
                let key = object_key(&self.container, &metadata.patch_hash);
                self.blobs.upload(&key, path)?;
                self.index.publish(path, &metadata, None)?;
                self.meta.store(path, &metadata)?;
                info!(
                    path = %path.display(),
                    object = %metadata.patch_hash,
                    size = metadata.file_size,
                    "captured baseline"
                );
                CaptureReport {
                    path: path.to_path_buf(),
                    kind: CaptureKind::Baseline,
                    object_id: metadata.patch_hash.to_hex(),
                    file_size: metadata.file_size,
                    patch_size: metadata.patch_size,
                }
            }
            CaptureOutcome::Patch { metadata, manifest } => {
                let key = object_key(&self.container, &metadata.patch_hash);
                self.blobs.upload(&key, &self.meta.patch_path(path))?;
                self.index.publish(path, &metadata, Some(manifest.as_str()))?;
                self.meta.store(path, &metadata)?;
                info!(
                    path = %path.display(),
                    object = %metadata.patch_hash,
                    patch_size = metadata.patch_size,
                    "captured patch"
                );
                CaptureReport {
                    path: path.to_path_buf(),
                    kind: CaptureKind::Patch,
                    object_id: metadata.patch_hash.to_hex(),
                    file_size: metadata.file_size,
                    patch_size: metadata.patch_size,
                }
            }
            CaptureOutcome::Unchanged { metadata } => {
                // No payload and no new version; just refresh the record.
                self.meta.store(path, &metadata)?;
                info!(path = %path.display(), "no changes since last capture");
                CaptureReport {
                    path: path.to_path_buf(),
                    kind: CaptureKind::Unchanged,
                    object_id: metadata.patch_hash.to_hex(),
                    file_size: metadata.file_size,
                    patch_size: metadata.patch_size,
                }
            }
        };

        Ok(report)
    }

    /// The published version chain for `path`, newest first.
    pub fn versions(&self, path: &Path) -> Result<Vec<VersionEntry>> {
        self.index.versions(path)
    }

    /// Restore the version at `version_index` (0 = newest) into the
    /// download base, returning the restored file's location.
    ///
    /// Walks the chain from the requested version back to its baseline,
    /// downloads each object, then replays the patches baseline-first.
    pub fn restore(&self, path: &Path, version_index: usize) -> Result<PathBuf> {
        let versions = self.index.versions(path)?;
        if versions.is_empty() {
            return Err(VaultError::NotFound(path.to_path_buf()));
        }
        if version_index >= versions.len() {
            return Err(VaultError::Index(format!(
                "version {} of '{}' does not exist ({} available)",
                version_index + 1,
                path.display(),
                versions.len()
            )));
        }

        let download_dir = self.meta.download_dir(path);
        fs::create_dir_all(&download_dir)?;

        let mut chain: Vec<PathBuf> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut found_baseline = false;

        for version in &versions[version_index..] {
            if !seen.insert(version.object_id.clone()) {
                continue;
            }
            let digest = Sha1Digest::from_hex(&version.object_id)?;
            let dest = download_dir.join(format!("{}.dat", version.object_id));
            self.blobs
                .download(&object_key(&self.container, &digest), &dest)?;
            chain.push(dest);
            if version.kind == VersionKind::Baseline {
                found_baseline = true;
                break;
            }
        }

        if !found_baseline {
            return Err(VaultError::Corrupt(format!(
                "version chain for '{}' has no baseline",
                path.display()
            )));
        }

        // Downloaded newest-to-oldest; patches compose baseline-first.
        chain.reverse();
        apply::compose_chain(&chain[0], &chain[1..])?;

        let dest = mirror(&self.download_base, path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(&chain[0], &dest).is_err() {
            fs::copy(&chain[0], &dest)?;
            fs::remove_file(&chain[0])?;
        }

        info!(
            path = %path.display(),
            version = version_index + 1,
            dest = %dest.display(),
            "restored"
        );
        Ok(dest)
    }
}
