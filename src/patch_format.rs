use std::io::{BufRead, Write};

use crate::error::{Result, VaultError};

/// Wire codes for patch entry kinds.
pub const KIND_CHANGE: u8 = 0;
pub const KIND_TRUNCATE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Overwrite `size` bytes at `offset` with payload from the patch file.
    Change,
    /// Truncate the file to `offset` bytes. Carries no payload, size is
    /// always zero, and the entry is only valid in last position.
    Truncate,
}

impl EntryKind {
    pub fn code(self) -> u8 {
        match self {
            EntryKind::Change => KIND_CHANGE,
            EntryKind::Truncate => KIND_TRUNCATE,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            KIND_CHANGE => Some(EntryKind::Change),
            KIND_TRUNCATE => Some(EntryKind::Truncate),
            _ => None,
        }
    }
}

/// One line of a patch header: a byte range edit against the prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchEntry {
    pub offset: u64,
    pub size: u64,
    pub kind: EntryKind,
}

impl PatchEntry {
    pub fn change(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            kind: EntryKind::Change,
        }
    }

    pub fn truncate(offset: u64) -> Self {
        Self {
            offset,
            size: 0,
            kind: EntryKind::Truncate,
        }
    }
}

/// Write the patch header: a decimal entry count line followed by one
/// `offset:size:kind` line per entry. Payload bytes follow separately.
pub fn write_header<W: Write>(writer: &mut W, entries: &[PatchEntry]) -> Result<()> {
    writeln!(writer, "{}", entries.len())?;
    for entry in entries {
        writeln!(writer, "{}:{}:{}", entry.offset, entry.size, entry.kind.code())?;
    }
    Ok(())
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 || !line.ends_with('\n') {
        return Err(VaultError::Corrupt(
            "patch header ended unexpectedly".to_string(),
        ));
    }
    line.pop();
    Ok(line)
}

/// Parse the patch header with strict bounds: every kind must be a known
/// code, a truncate entry must carry size zero, and a truncate anywhere but
/// the final position is a fatal format error.
pub fn read_header<R: BufRead>(reader: &mut R) -> Result<Vec<PatchEntry>> {
    let count_line = read_line(reader)?;
    let count = count_line
        .parse::<u64>()
        .map_err(|e| VaultError::Corrupt(format!("patch entry count '{count_line}': {e}")))?;

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count {
        let line = read_line(reader)?;
        let mut fields = line.splitn(3, ':');
        let (offset, size, kind) = match (fields.next(), fields.next(), fields.next()) {
            (Some(o), Some(s), Some(k)) => (o, s, k),
            _ => {
                return Err(VaultError::Corrupt(format!(
                    "malformed patch entry '{line}'"
                )))
            }
        };
        let offset = offset
            .parse::<u64>()
            .map_err(|e| VaultError::Corrupt(format!("patch offset '{offset}': {e}")))?;
        let size = size
            .parse::<u64>()
            .map_err(|e| VaultError::Corrupt(format!("patch size '{size}': {e}")))?;
        let kind = kind
            .parse::<u8>()
            .ok()
            .and_then(EntryKind::from_code)
            .ok_or_else(|| VaultError::Corrupt(format!("unknown patch kind '{kind}'")))?;

        if kind == EntryKind::Truncate {
            if size != 0 {
                return Err(VaultError::Corrupt(format!(
                    "truncate entry with nonzero size {size}"
                )));
            }
            if i != count - 1 {
                return Err(VaultError::Corrupt(
                    "truncate entry before end of patch".to_string(),
                ));
            }
        }

        entries.push(PatchEntry { offset, size, kind });
    }

    Ok(entries)
}

/// Render the Content-Range styled manifest for a patch.
///
/// A pure truncate collapses to `bytes */<new_size>`. Otherwise the first
/// range carries the full file size and later ranges use `*`; zero-size
/// entries are omitted past the first position.
pub fn range_manifest(entries: &[PatchEntry], file_size: u64) -> Result<String> {
    if entries.is_empty() {
        return Err(VaultError::Corrupt(
            "range manifest for an empty patch".to_string(),
        ));
    }
    if let Some(pos) = entries.iter().position(|e| e.kind == EntryKind::Truncate) {
        if pos != entries.len() - 1 {
            return Err(VaultError::Corrupt(
                "truncate entry before end of patch".to_string(),
            ));
        }
    }

    let mut manifest = String::from("bytes ");

    if entries.len() == 1 && entries[0].kind == EntryKind::Truncate {
        manifest.push_str(&format!("*/{file_size}"));
        return Ok(manifest);
    }

    for (i, entry) in entries.iter().enumerate() {
        if i == 0 {
            manifest.push_str(&format!(
                "{}-{}/{}",
                entry.offset,
                entry.offset + entry.size - 1,
                file_size
            ));
        } else if entry.size > 0 {
            manifest.push_str(&format!(
                ", {}-{}/*",
                entry.offset,
                entry.offset + entry.size - 1
            ));
        }
    }

    Ok(manifest)
}
