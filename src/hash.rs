use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{Result, VaultError};

/// 20-byte SHA-1 digest. Serializes as a 40-character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Digest([u8; 20]);

impl Sha1Digest {
    pub const LEN: usize = 20;

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != Self::LEN * 2 {
            return Err(VaultError::InvalidHash(format!(
                "expected {} hex characters, got {}",
                Self::LEN * 2,
                s.len()
            )));
        }
        let raw = hex::decode(s).map_err(|e| VaultError::InvalidHash(e.to_string()))?;
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.to_hex())
    }
}

impl FromStr for Sha1Digest {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Sha1Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha1Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sha1Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional digests: `None` maps to the empty string on the
/// wire, which is how baseline records encode their missing predecessor.
pub mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Sha1Digest;

    pub fn serialize<S: Serializer>(
        value: &Option<Sha1Digest>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(digest) => serializer.serialize_str(&digest.to_hex()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Sha1Digest>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            Ok(None)
        } else {
            Sha1Digest::from_hex(&s)
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Compute the SHA-1 of a byte slice.
pub fn hash_bytes(data: &[u8]) -> Sha1Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Sha1Digest(hasher.finalize().into())
}

/// Stream-hash a file.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file(path: &Path) -> Result<Sha1Digest> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Sha1Digest(hasher.finalize().into()))
}
