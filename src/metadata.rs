use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VaultError};
use crate::hash::{hex_opt, Sha1Digest};
use crate::signature::BlockSignature;

/// Whether a capture uploaded the whole file or a byte-range patch.
/// Serializes as `0` (baseline) or `1` (patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Baseline,
    Patch,
}

impl PatchKind {
    pub fn code(self) -> u8 {
        match self {
            PatchKind::Baseline => 0,
            PatchKind::Patch => 1,
        }
    }
}

impl Serialize for PatchKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for PatchKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(PatchKind::Baseline),
            1 => Ok(PatchKind::Patch),
            other => Err(serde::de::Error::custom(format!(
                "unknown patch type {other}"
            ))),
        }
    }
}

/// Per-file capture record. Rewritten whole on every capture; the block
/// list always describes the current full file, never the patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub backuptime: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub file_size: u64,
    pub patch_size: u64,
    pub patch_type: PatchKind,
    #[serde(with = "hex_opt")]
    pub prev_patch_hash: Option<Sha1Digest>,
    pub patch_hash: Sha1Digest,
    pub patch_state: Vec<BlockSignature>,
}

impl FileMetadata {
    pub fn is_baseline(&self) -> bool {
        self.patch_type == PatchKind::Baseline
    }
}

/// Map a logical file path into a mirror tree under `root`, dropping any
/// root or prefix components.
pub(crate) fn mirror(root: &Path, path: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// Access/modify/change times of a file, in whole seconds.
pub fn stat_times(path: &Path) -> Result<(i64, i64, i64)> {
    let meta = fs::metadata(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok((meta.atime(), meta.mtime(), meta.ctime()))
    }

    #[cfg(not(unix))]
    {
        fn secs(t: std::io::Result<std::time::SystemTime>) -> i64 {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        }
        let atime = secs(meta.accessed());
        let mtime = secs(meta.modified());
        Ok((atime, mtime, mtime))
    }
}

/// Sidecar store for per-file metadata, patch payloads, and range
/// manifests, all mirrored under a single root directory.
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sidecar(&self, path: &Path, suffix: &str) -> PathBuf {
        let mut os = mirror(&self.root, path).into_os_string();
        os.push(suffix);
        PathBuf::from(os)
    }

    pub fn meta_path(&self, path: &Path) -> PathBuf {
        self.sidecar(path, ".meta")
    }

    pub fn patch_path(&self, path: &Path) -> PathBuf {
        self.sidecar(path, ".patch")
    }

    pub fn range_path(&self, path: &Path) -> PathBuf {
        self.sidecar(path, ".range")
    }

    /// Scratch directory for restore downloads, beside the file's sidecars.
    pub fn download_dir(&self, path: &Path) -> PathBuf {
        let mirrored = mirror(&self.root, path);
        mirrored
            .parent()
            .unwrap_or(&self.root)
            .join("tmp_download")
    }

    /// True iff a metadata record exists and its containing directory
    /// exists. Anything less means the next capture is a baseline.
    pub fn has_state(&self, path: &Path) -> bool {
        let meta_path = self.meta_path(path);
        match meta_path.parent() {
            Some(dir) => dir.is_dir() && meta_path.is_file(),
            None => false,
        }
    }

    pub fn load(&self, path: &Path) -> Result<FileMetadata> {
        let meta_path = self.meta_path(path);
        let data = match fs::read(&meta_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| {
            VaultError::Corrupt(format!("metadata for '{}': {e}", path.display()))
        })
    }

    /// Serialize and atomically replace the record: write a temp file in
    /// the same directory, then rename over the target.
    pub fn store(&self, path: &Path, metadata: &FileMetadata) -> Result<()> {
        let meta_path = self.meta_path(path);
        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(metadata)
            .map_err(|e| VaultError::Corrupt(format!("encoding metadata: {e}")))?;
        let tmp_path = self.sidecar(path, ".meta.tmp");
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &meta_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn sample_metadata() -> FileMetadata {
        FileMetadata {
            backuptime: 1_700_000_000,
            atime: 1_699_999_000,
            mtime: 1_699_999_100,
            ctime: 1_699_999_200,
            file_size: 1200,
            patch_size: 512,
            patch_type: PatchKind::Patch,
            prev_patch_hash: Some(hash_bytes(b"previous")),
            patch_hash: hash_bytes(b"current"),
            patch_state: vec![
                BlockSignature {
                    offset: 0,
                    size: 512,
                    digest: hash_bytes(b"block0"),
                },
                BlockSignature {
                    offset: 512,
                    size: 688,
                    digest: hash_bytes(b"block1"),
                },
            ],
        }
    }

    #[test]
    fn json_shape_matches_wire_format() {
        let metadata = sample_metadata();
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&metadata).unwrap()).unwrap();
        assert_eq!(value["patch_type"], 1);
        assert_eq!(
            value["patch_state"][0],
            format!("0:512:{}", hash_bytes(b"block0"))
        );
        assert_eq!(value["prev_patch_hash"], hash_bytes(b"previous").to_hex());
    }

    #[test]
    fn baseline_serializes_empty_prev_hash() {
        let mut metadata = sample_metadata();
        metadata.patch_type = PatchKind::Baseline;
        metadata.prev_patch_hash = None;
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&metadata).unwrap()).unwrap();
        assert_eq!(value["patch_type"], 0);
        assert_eq!(value["prev_patch_hash"], "");
        let decoded: FileMetadata = serde_json::from_value(value).unwrap();
        assert!(decoded.prev_patch_hash.is_none());
    }

    #[test]
    fn store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        let tracked = Path::new("/data/reports/daily.log");

        assert!(!store.has_state(tracked));
        store.store(tracked, &sample_metadata()).unwrap();
        assert!(store.has_state(tracked));

        let loaded = store.load(tracked).unwrap();
        assert_eq!(loaded.file_size, 1200);
        assert_eq!(loaded.patch_state.len(), 2);
        assert_eq!(loaded.patch_hash, hash_bytes(b"current"));
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        assert!(matches!(
            store.load(Path::new("/nope/file.txt")),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn load_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        let tracked = Path::new("/data/broken.bin");
        let meta_path = store.meta_path(tracked);
        fs::create_dir_all(meta_path.parent().unwrap()).unwrap();
        fs::write(&meta_path, b"not json").unwrap();
        assert!(matches!(
            store.load(tracked),
            Err(VaultError::Corrupt(_))
        ));
    }

    #[test]
    fn sidecars_share_the_mirror_path() {
        let store = MetadataStore::new("/var/sidecars");
        let tracked = Path::new("/home/user/notes.txt");
        assert_eq!(
            store.meta_path(tracked),
            Path::new("/var/sidecars/home/user/notes.txt.meta")
        );
        assert_eq!(
            store.patch_path(tracked),
            Path::new("/var/sidecars/home/user/notes.txt.patch")
        );
        assert_eq!(
            store.range_path(tracked),
            Path::new("/var/sidecars/home/user/notes.txt.range")
        );
        assert_eq!(
            store.download_dir(tracked),
            Path::new("/var/sidecars/home/user/tmp_download")
        );
    }
}
