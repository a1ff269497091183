use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, VaultError};
use crate::patch_format::{self, EntryKind};
use crate::signature::{read_full, BLOCK_SIZE};

/// Apply one patch file onto `base` in place.
///
/// The baseline length is captured once at open and used for the
/// in-place-vs-append decision throughout; it is deliberately not
/// re-read after a write. Consecutive append entries therefore all route
/// through the seek-to-end branch, which keeps them correct when each
/// append lands past the previously captured tail.
pub fn apply_patch(base: &Path, patch: &Path) -> Result<()> {
    let base_len = std::fs::metadata(base)?.len();
    let mut basefile = OpenOptions::new().write(true).open(base)?;

    let mut reader = BufReader::with_capacity(64 * 1024, File::open(patch)?);
    let entries = patch_format::read_header(&mut reader)?;
    debug!(patch = %patch.display(), entries = entries.len(), "applying patch");

    let mut buf = vec![0u8; BLOCK_SIZE];

    for entry in &entries {
        if entry.kind == EntryKind::Truncate {
            basefile.set_len(entry.offset)?;
            break;
        }

        if entry.size as usize > buf.len() {
            buf.resize(entry.size as usize, 0);
        }
        let payload = &mut buf[..entry.size as usize];
        let got = read_full(&mut reader, payload)?;
        if got as u64 != entry.size {
            return Err(VaultError::SizeMismatch {
                expected: entry.size,
                actual: got as u64,
            });
        }

        if entry.offset < base_len {
            // In-place overwrite; may extend past the old tail.
            basefile.seek(SeekFrom::Start(entry.offset))?;
            basefile.write_all(payload)?;
        } else {
            // Growth past the captured tail: flush what is written so
            // far, then append at the real end of the file.
            basefile.sync_all()?;
            basefile.seek(SeekFrom::End(0))?;
            basefile.write_all(payload)?;
        }
    }

    // A well-formed patch is consumed exactly; leftovers mean the header
    // and payload disagree.
    let mut probe = [0u8; 1];
    if read_full(&mut reader, &mut probe)? != 0 {
        return Err(VaultError::Corrupt(format!(
            "trailing bytes after patch payload in '{}'",
            patch.display()
        )));
    }

    Ok(())
}

/// Rebuild a version by replaying patches over the baseline, oldest first.
/// The baseline file is mutated in place and ends up as the restored
/// content.
pub fn compose_chain(baseline: &Path, patches: &[PathBuf]) -> Result<()> {
    for patch in patches {
        apply_patch(baseline, patch)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_patch(dir: &Path, header: &str, payload: &[u8]) -> PathBuf {
        let path = dir.join("test.patch");
        let mut data = header.as_bytes().to_vec();
        data.extend_from_slice(payload);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn in_place_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, vec![0u8; 1024]).unwrap();

        let patch = write_patch(dir.path(), "1\n512:4:0\n", b"ABCD");
        apply_patch(&base, &patch).unwrap();

        let result = fs::read(&base).unwrap();
        assert_eq!(result.len(), 1024);
        assert_eq!(&result[512..516], b"ABCD");
        assert!(result[516..].iter().all(|&b| b == 0));
    }

    #[test]
    fn consecutive_appends_grow_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, vec![1u8; 100]).unwrap();

        // Two append entries beyond the captured length; both must land
        // at the live end of the file, in order.
        let patch = write_patch(dir.path(), "2\n100:3:0\n103:3:0\n", b"XXXYYY");
        apply_patch(&base, &patch).unwrap();

        let result = fs::read(&base).unwrap();
        assert_eq!(result.len(), 106);
        assert_eq!(&result[100..], b"XXXYYY");
    }

    #[test]
    fn truncate_cuts_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, vec![2u8; 1000]).unwrap();

        let patch = write_patch(dir.path(), "1\n300:0:2\n", b"");
        apply_patch(&base, &patch).unwrap();

        assert_eq!(fs::read(&base).unwrap(), vec![2u8; 300]);
    }

    #[test]
    fn change_then_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, vec![3u8; 1500]).unwrap();

        let payload = vec![4u8; 488];
        let patch = write_patch(dir.path(), "2\n512:488:0\n1000:0:2\n", &payload);
        apply_patch(&base, &patch).unwrap();

        let result = fs::read(&base).unwrap();
        assert_eq!(result.len(), 1000);
        assert!(result[..512].iter().all(|&b| b == 3));
        assert!(result[512..].iter().all(|&b| b == 4));
    }

    #[test]
    fn short_payload_is_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, vec![0u8; 100]).unwrap();

        let patch = write_patch(dir.path(), "1\n0:10:0\n", b"short");
        assert!(matches!(
            apply_patch(&base, &patch),
            Err(VaultError::SizeMismatch {
                expected: 10,
                actual: 5
            })
        ));
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, vec![0u8; 100]).unwrap();

        let patch = write_patch(dir.path(), "1\n0:4:0\n", b"ABCDextra");
        assert!(matches!(
            apply_patch(&base, &patch),
            Err(VaultError::Corrupt(_))
        ));
    }

    #[test]
    fn unknown_kind_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, vec![0u8; 100]).unwrap();

        let patch = write_patch(dir.path(), "1\n0:4:7\n", b"ABCD");
        assert!(matches!(
            apply_patch(&base, &patch),
            Err(VaultError::Corrupt(_))
        ));
    }

    #[test]
    fn compose_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        fs::write(&base, b"aaaa".to_vec()).unwrap();

        let p1 = dir.path().join("p1.patch");
        fs::write(&p1, b"1\n0:4:0\nbbbb").unwrap();
        let p2 = dir.path().join("p2.patch");
        fs::write(&p2, b"1\n4:4:0\ncccc").unwrap();

        compose_chain(&base, &[p1, p2]).unwrap();
        assert_eq!(fs::read(&base).unwrap(), b"bbbbcccc");
    }
}
