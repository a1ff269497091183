use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

fn default_sidecar_root() -> PathBuf {
    PathBuf::from("/var/lib/patchvault/sidecar")
}

fn default_download_base() -> PathBuf {
    PathBuf::from("/var/lib/patchvault/restore")
}

fn default_container() -> String {
    "default".to_string()
}

fn default_local_backend() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for per-file sidecar artifacts (.meta/.patch/.range).
    #[serde(default = "default_sidecar_root")]
    pub sidecar_root: PathBuf,

    /// Where restored files are placed, mirroring their logical paths.
    #[serde(default = "default_download_base")]
    pub download_base: PathBuf,

    /// Namespace for object keys and index records, typically a machine id.
    #[serde(default = "default_container")]
    pub container: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub index: IndexConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sidecar_root: default_sidecar_root(),
            download_base: default_download_base(),
            container: default_container(),
            store: StoreConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "local" or "s3".
    #[serde(default = "default_local_backend")]
    pub backend: String,
    /// Root directory for the local backend.
    pub root: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_local_backend(),
            root: None,
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// "local" or "http".
    #[serde(default = "default_local_backend")]
    pub backend: String,
    /// Root directory for the local backend.
    pub root: Option<PathBuf>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_local_backend(),
            root: None,
            host: None,
            username: None,
            password: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| VaultError::Config(format!("{}: {e}", path.display())))
    }
}
