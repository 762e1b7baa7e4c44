//! Part reader: memory-mapped access to part files.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{MergeError, Result};
use crate::merge_tree::types::{Part, PartMeta, PartName, Row, DATA_FILE, META_FILE};

/// Read `meta.json` of the part directory `dir`.
pub fn read_meta(dir: &Path) -> Result<PartMeta> {
    let contents = std::fs::read_to_string(dir.join(META_FILE))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Decode all rows of `part`, verifying the data checksum.
pub fn read_rows(table_path: &Path, part: &Part) -> Result<Vec<Row>> {
    read_rows_from(&part.name().dir(table_path), part.name(), &part.meta().checksum)
}

fn read_rows_from(dir: &Path, name: &PartName, checksum: &str) -> Result<Vec<Row>> {
    let file = File::open(dir.join(DATA_FILE))?;
    let mmap = unsafe { Mmap::map(&file) }?;

    if !checksum.is_empty() {
        let actual = blake3::hash(&mmap);
        if actual.to_hex().as_str() != checksum {
            return Err(MergeError::CorruptedPart {
                part: name.to_string(),
                reason: format!("checksum mismatch: expected {checksum}, got {}", actual.to_hex()),
            });
        }
    }

    Ok(bincode::deserialize(&mmap)?)
}

/// Hint the OS to read `path` into the page cache ahead of a merge.
/// Best-effort; a no-op off Linux.
pub fn prefetch_file(path: &Path) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        let file = File::open(path)?;
        let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_WILLNEED) };
        if ret != 0 {
            return Err(std::io::Error::from_raw_os_error(ret));
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
