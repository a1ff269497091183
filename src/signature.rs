use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VaultError};
use crate::hash::{self, Sha1Digest};

/// Fixed block size for file signatures. Changing it invalidates every
/// previously captured chain, so it is a constant rather than configuration.
pub const BLOCK_SIZE: usize = 512;

/// One fixed-size block of a file: its byte offset, length, and SHA-1.
/// Only the final block of a file may be shorter than `BLOCK_SIZE`.
///
/// Serializes as `"offset:size:hex_signature"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    pub offset: u64,
    pub size: u64,
    pub digest: Sha1Digest,
}

impl BlockSignature {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

impl fmt::Display for BlockSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.offset, self.size, self.digest)
    }
}

impl Serialize for BlockSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_block(&s).map_err(serde::de::Error::custom)
    }
}

fn parse_block(s: &str) -> Result<BlockSignature> {
    let mut fields = s.splitn(3, ':');
    let (offset, size, sig) = match (fields.next(), fields.next(), fields.next()) {
        (Some(o), Some(n), Some(h)) => (o, n, h),
        _ => {
            return Err(VaultError::Corrupt(format!(
                "malformed block descriptor '{s}'"
            )))
        }
    };
    let offset = offset
        .parse::<u64>()
        .map_err(|e| VaultError::Corrupt(format!("block offset '{offset}': {e}")))?;
    let size = size
        .parse::<u64>()
        .map_err(|e| VaultError::Corrupt(format!("block size '{size}': {e}")))?;
    let digest = Sha1Digest::from_hex(sig)?;
    Ok(BlockSignature {
        offset,
        size,
        digest,
    })
}

/// Read `buf.len()` bytes unless the source ends first. Returns the number
/// of bytes actually read; short only at EOF.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Scan a byte source in `BLOCK_SIZE` steps and emit one signature per
/// non-empty block. An empty source yields an empty list; any read error
/// fails the whole scan.
pub fn compute_signatures<R: Read>(reader: R) -> Result<Vec<BlockSignature>> {
    let mut reader = BufReader::with_capacity(64 * 1024, reader);
    let mut buf = [0u8; BLOCK_SIZE];
    let mut blocks = Vec::new();
    let mut offset: u64 = 0;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        blocks.push(BlockSignature {
            offset,
            size: n as u64,
            digest: hash::hash_bytes(&buf[..n]),
        });
        offset += n as u64;
        if n < BLOCK_SIZE {
            break;
        }
    }

    Ok(blocks)
}

pub fn signatures_for_file(path: &Path) -> Result<Vec<BlockSignature>> {
    let file = File::open(path)?;
    compute_signatures(file)
}

/// Logical file length described by an ordered block list.
pub fn logical_size(blocks: &[BlockSignature]) -> u64 {
    blocks.last().map(|b| b.end()).unwrap_or(0)
}
