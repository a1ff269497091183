use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no backup state for '{}'", .0.display())]
    NotFound(PathBuf),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("payload size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("object store error: {0}")]
    Storage(#[source] Box<opendal::Error>),

    #[error("index service error: {0}")]
    Index(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<opendal::Error> for VaultError {
    fn from(value: opendal::Error) -> Self {
        VaultError::Storage(Box::new(value))
    }
}
