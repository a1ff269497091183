use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::Mmap;
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::hash;
use crate::metadata::{stat_times, FileMetadata, MetadataStore, PatchKind};
use crate::patch_format::{self, PatchEntry};
use crate::signature::{self, BlockSignature};

/// What a capture produced. The payload to upload is the tracked file
/// itself for a baseline and the `.patch` sidecar for a patch; an
/// unchanged capture has no payload at all.
pub enum CaptureOutcome {
    Baseline {
        metadata: FileMetadata,
    },
    Patch {
        metadata: FileMetadata,
        manifest: String,
    },
    Unchanged {
        metadata: FileMetadata,
    },
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Compare current signatures against the previous capture's, index-wise.
///
/// Differing or newly appended blocks become CHANGE entries. A single
/// trailing TRUNCATE is added iff the file got strictly shorter; that
/// covers both a shorter block list and a shrink confined to the final
/// block, where the block count stays the same.
pub fn patch_entries(current: &[BlockSignature], previous: &[BlockSignature]) -> Vec<PatchEntry> {
    let min_len = current.len().min(previous.len());
    let mut entries = Vec::new();

    for i in 0..min_len {
        if current[i].digest != previous[i].digest {
            entries.push(PatchEntry::change(current[i].offset, current[i].size));
        }
    }
    for block in &current[min_len..] {
        entries.push(PatchEntry::change(block.offset, block.size));
    }

    let new_size = signature::logical_size(current);
    let prev_size = signature::logical_size(previous);
    if new_size < prev_size {
        entries.push(PatchEntry::truncate(new_size));
    }

    entries
}

fn baseline_capture(path: &Path, current: Vec<BlockSignature>) -> Result<CaptureOutcome> {
    let (atime, mtime, ctime) = stat_times(path)?;
    let file_size = signature::logical_size(&current);
    let patch_hash = hash::hash_file(path)?;

    Ok(CaptureOutcome::Baseline {
        metadata: FileMetadata {
            backuptime: unix_now(),
            atime,
            mtime,
            ctime,
            file_size,
            patch_size: file_size,
            patch_type: PatchKind::Baseline,
            prev_patch_hash: None,
            patch_hash,
            patch_state: current,
        },
    })
}

/// Write the patch payload: header lines, then the changed byte ranges
/// copied from a read-only mapping of the live file, fsynced before the
/// caller may rewrite metadata.
fn write_patch_file(path: &Path, patch_path: &Path, entries: &[PatchEntry]) -> Result<u64> {
    if let Some(parent) = patch_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(patch_path)?);
    patch_format::write_header(&mut writer, entries)?;

    if entries.iter().any(|e| e.size > 0) {
        let source = File::open(path)?;
        // SAFETY: read-only mapping; captures of the same file are
        // serialized by the caller, so the file is not mutated underneath.
        let map = unsafe { Mmap::map(&source)? };
        for entry in entries {
            if entry.size == 0 {
                continue;
            }
            let start = entry.offset as usize;
            let end = start + entry.size as usize;
            if end > map.len() {
                return Err(VaultError::Corrupt(format!(
                    "'{}' shrank during capture",
                    path.display()
                )));
            }
            writer.write_all(&map[start..end])?;
        }
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Derive the next capture for `path`: a baseline when no prior state
/// exists, a patch when blocks changed, or a metadata-only refresh when
/// nothing did. Does not persist the metadata record; the orchestrator
/// does that after the payload is safely uploaded.
pub fn build_capture(store: &MetadataStore, path: &Path) -> Result<CaptureOutcome> {
    let current = signature::signatures_for_file(path)?;

    if !store.has_state(path) {
        return baseline_capture(path, current);
    }
    let previous = store.load(path)?;

    let entries = patch_entries(&current, &previous.patch_state);
    let (atime, mtime, ctime) = stat_times(path)?;

    if entries.is_empty() {
        // Nothing changed: refresh times but keep the chain fields of the
        // previous record. The transient .patch sidecar is deliberately
        // not consulted here.
        return Ok(CaptureOutcome::Unchanged {
            metadata: FileMetadata {
                backuptime: unix_now(),
                atime,
                mtime,
                ctime,
                file_size: previous.file_size,
                patch_size: previous.patch_size,
                patch_type: previous.patch_type,
                prev_patch_hash: previous.prev_patch_hash,
                patch_hash: previous.patch_hash,
                patch_state: current,
            },
        });
    }

    let new_size = signature::logical_size(&current);
    debug!(
        path = %path.display(),
        entries = entries.len(),
        new_size,
        "building patch"
    );

    let patch_path = store.patch_path(path);
    let patch_size = write_patch_file(path, &patch_path, &entries)?;
    let patch_hash = hash::hash_file(&patch_path)?;

    let manifest = patch_format::range_manifest(&entries, new_size)?;
    fs::write(store.range_path(path), &manifest)?;

    Ok(CaptureOutcome::Patch {
        metadata: FileMetadata {
            backuptime: unix_now(),
            atime,
            mtime,
            ctime,
            file_size: new_size,
            patch_size,
            patch_type: PatchKind::Patch,
            prev_patch_hash: Some(previous.patch_hash),
            patch_hash,
            patch_state: current,
        },
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::patch_format::EntryKind;
    use crate::signature::compute_signatures;

    fn sigs(data: &[u8]) -> Vec<BlockSignature> {
        compute_signatures(Cursor::new(data.to_vec())).unwrap()
    }

    #[test]
    fn identical_files_produce_no_entries() {
        let data = vec![3u8; 2000];
        assert!(patch_entries(&sigs(&data), &sigs(&data)).is_empty());
    }

    #[test]
    fn single_block_edit() {
        let old = vec![0x41u8; 1200];
        let mut new = old.clone();
        new[600] = 0x42;
        let entries = patch_entries(&sigs(&new), &sigs(&old));
        assert_eq!(entries, vec![PatchEntry::change(512, 512)]);
    }

    #[test]
    fn append_within_tail_block() {
        let old = vec![9u8; 100];
        let mut new = old.clone();
        new.extend_from_slice(&[8u8; 50]);
        // The 100-byte tail block grew to 150 bytes, so its signature
        // changes; no truncate since the file got longer.
        let entries = patch_entries(&sigs(&new), &sigs(&old));
        assert_eq!(entries, vec![PatchEntry::change(0, 150)]);
    }

    #[test]
    fn append_new_block() {
        let old = vec![1u8; 512];
        let mut new = old.clone();
        new.extend_from_slice(&[2u8; 50]);
        let entries = patch_entries(&sigs(&new), &sigs(&old));
        assert_eq!(entries, vec![PatchEntry::change(512, 50)]);
    }

    #[test]
    fn truncate_to_prefix() {
        let old = vec![5u8; 1000];
        let new = vec![5u8; 300];
        let entries = patch_entries(&sigs(&new), &sigs(&old));
        // Block 0 shrank from 512 to 300 bytes, then the file is cut.
        assert_eq!(
            entries,
            vec![PatchEntry::change(0, 300), PatchEntry::truncate(300)]
        );
    }

    #[test]
    fn shrink_with_equal_block_count_still_truncates() {
        let old = vec![6u8; 1000]; // blocks: 512, 488
        let new = vec![6u8; 600]; // blocks: 512, 88
        let entries = patch_entries(&sigs(&new), &sigs(&old));
        assert_eq!(
            entries,
            vec![PatchEntry::change(512, 88), PatchEntry::truncate(600)]
        );
    }

    #[test]
    fn edit_plus_truncate() {
        let old = vec![7u8; 1500];
        let mut new = old[..1000].to_vec();
        new[700] = 0;
        let entries = patch_entries(&sigs(&new), &sigs(&old));
        assert_eq!(
            entries,
            vec![PatchEntry::change(512, 488), PatchEntry::truncate(1000)]
        );
    }

    #[test]
    fn empty_new_file_is_pure_truncate() {
        let old = vec![1u8; 700];
        let entries = patch_entries(&sigs(&[]), &sigs(&old));
        assert_eq!(entries, vec![PatchEntry::truncate(0)]);
        assert_eq!(entries[0].kind, EntryKind::Truncate);
    }

    #[test]
    fn truncate_is_always_last() {
        let old: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let mut new = old[..2000].to_vec();
        new[5] = 0xFF;
        new[1500] = 0xFF;
        let entries = patch_entries(&sigs(&new), &sigs(&old));
        for entry in &entries[..entries.len() - 1] {
            assert_eq!(entry.kind, EntryKind::Change);
        }
        assert_eq!(entries.last().unwrap().kind, EntryKind::Truncate);
    }

    #[test]
    fn patch_file_bytes_are_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("sidecars"));
        let tracked = dir.path().join("tracked.bin");

        let mut content = vec![0x41u8; 1200];
        fs::write(&tracked, &content).unwrap();
        let baseline = match build_capture(&store, &tracked).unwrap() {
            CaptureOutcome::Baseline { metadata } => metadata,
            _ => panic!("expected baseline"),
        };
        store.store(&tracked, &baseline).unwrap();

        content[600] = 0x42;
        fs::write(&tracked, &content).unwrap();
        let (metadata, manifest) = match build_capture(&store, &tracked).unwrap() {
            CaptureOutcome::Patch { metadata, manifest } => (metadata, manifest),
            _ => panic!("expected patch"),
        };

        let patch = fs::read(store.patch_path(&tracked)).unwrap();
        assert_eq!(&patch[..12], b"1\n512:512:0\n");
        assert_eq!(patch.len(), 12 + 512);
        assert_eq!(&patch[12..], &content[512..1024]);

        assert_eq!(manifest, "bytes 512-1023/1200");
        assert_eq!(metadata.patch_size, patch.len() as u64);
        assert_eq!(metadata.patch_hash, hash::hash_bytes(&patch));
        assert_eq!(metadata.prev_patch_hash, Some(baseline.patch_hash));
    }

    #[test]
    fn unchanged_capture_keeps_chain_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("sidecars"));
        let tracked = dir.path().join("steady.bin");
        fs::write(&tracked, vec![1u8; 900]).unwrap();

        let first = match build_capture(&store, &tracked).unwrap() {
            CaptureOutcome::Baseline { metadata } => metadata,
            _ => panic!("expected baseline"),
        };
        store.store(&tracked, &first).unwrap();

        let second = match build_capture(&store, &tracked).unwrap() {
            CaptureOutcome::Unchanged { metadata } => metadata,
            _ => panic!("expected unchanged"),
        };
        assert_eq!(second.patch_hash, first.patch_hash);
        assert_eq!(second.prev_patch_hash, None);
        assert_eq!(second.patch_type, PatchKind::Baseline);
        assert_eq!(second.file_size, first.file_size);
        assert_eq!(second.patch_state, first.patch_state);
    }
}
