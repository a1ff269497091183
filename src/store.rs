use std::fs;
use std::path::{Component, Path, PathBuf};

use opendal::{BlockingOperator, Operator};

use crate::error::{Result, VaultError};
use crate::hash::Sha1Digest;

/// Derive the object key for an uploaded payload: the hex hash fanned out
/// over two prefix levels under the container.
pub fn object_key(container: &str, hash: &Sha1Digest) -> String {
    let hex = hash.to_hex();
    format!("{}/{}/{}/{}.dat", container, &hex[..2], &hex[2..4], hex)
}

/// Opaque blob storage keyed by `/`-separated string paths.
pub trait BlobStore: Send + Sync {
    /// Upload a local file under `key`. Overwrites an existing object.
    fn upload(&self, key: &str, source: &Path) -> Result<()>;

    /// Download the object at `key` into `dest`.
    fn download(&self, key: &str, dest: &Path) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;
}

/// Blob store over a local directory using `std::fs` directly.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Reject keys that could escape the store root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') {
            return Err(VaultError::Corrupt(format!("unsafe object key '{key}'")));
        }
        let path = Path::new(key);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(VaultError::Corrupt(format!("unsafe object key '{key}'")));
        }
        Ok(self.root.join(key))
    }
}

impl BlobStore for LocalBlobStore {
    fn upload(&self, key: &str, source: &Path) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &path)?;
        Ok(())
    }

    fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::copy(&path, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(PathBuf::from(key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve(key)?.is_file())
    }
}

/// Blob store backed by S3 (or an S3-compatible endpoint) via opendal.
pub struct S3BlobStore {
    op: BlockingOperator,
}

impl S3BlobStore {
    pub fn new(bucket: &str, region: &str, endpoint: Option<&str>) -> Result<Self> {
        let mut builder = opendal::services::S3::default()
            .bucket(bucket)
            .region(region)
            .root("/");
        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }
        let op = Operator::new(builder)?.finish().blocking();
        Ok(Self { op })
    }
}

impl BlobStore for S3BlobStore {
    fn upload(&self, key: &str, source: &Path) -> Result<()> {
        let data = fs::read(source)?;
        self.op.write(key, data)?;
        Ok(())
    }

    fn download(&self, key: &str, dest: &Path) -> Result<()> {
        match self.op.read(key) {
            Ok(buf) => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(dest, buf.to_vec())?;
                Ok(())
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                Err(VaultError::NotFound(PathBuf::from(key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        match self.op.stat(key) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
