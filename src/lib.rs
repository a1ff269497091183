//! Incremental file backup engine.
//!
//! Each tracked file gets a full baseline upload once, then only the byte
//! ranges that changed between captures. Files are scanned in fixed-size
//! blocks whose SHA-1 signatures are compared against the previous
//! capture's; differing blocks become a patch file that is uploaded to an
//! object store and recorded, hash-linked to its predecessor, in a version
//! index. Restoring a version downloads its chain and replays the patches
//! over the baseline.

pub mod apply;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod hash;
pub mod index;
pub mod metadata;
pub mod patch_format;
pub mod signature;
pub mod store;

pub use config::Config;
pub use engine::{CaptureKind, CaptureReport, Engine};
pub use error::{Result, VaultError};
