//! Free space tracking and reservations per filesystem.
//!
//! `DiskSpaceMonitor::reserve()` measures free space on the filesystem
//! backing a path, subtracts what this process has already promised to
//! any writer on that filesystem, and hands out a `Reservation` for the
//! rest. Tables sharing a disk share one budget. The accounting is
//! in-process only: space consumed by unrelated processes is noticed on
//! the next measurement, not before.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::Disks;

use crate::error::{MergeError, Result};

// ── Free space ─────────────────────────────────────────────────────

/// Free space of the filesystem a path lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpace {
    /// Identifies the filesystem (its mount point); reservations are
    /// accounted per volume.
    pub volume: PathBuf,
    /// Bytes currently available to this process.
    pub available: u64,
}

/// Source of free-space measurements.
pub trait FreeSpaceProbe: Send + Sync {
    fn volume_space(&self, path: &Path) -> Result<VolumeSpace>;
}

/// Asks the OS via `sysinfo`, picking the mount point that is the longest
/// prefix of the canonicalized path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpaceProbe for SystemFreeSpace {
    fn volume_space(&self, path: &Path) -> Result<VolumeSpace> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| VolumeSpace {
                volume: disk.mount_point().to_path_buf(),
                available: disk.available_space(),
            })
            .ok_or_else(|| MergeError::DiskProbe(format!("no mounted disk contains {path:?}")))
    }
}

/// One volume holding every path, with a settable amount of free space.
#[derive(Debug, Default)]
pub struct StaticFreeSpace {
    bytes: AtomicU64,
}

impl StaticFreeSpace {
    pub const VOLUME: &'static str = "/";

    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl FreeSpaceProbe for StaticFreeSpace {
    fn volume_space(&self, _path: &Path) -> Result<VolumeSpace> {
        Ok(VolumeSpace {
            volume: PathBuf::from(Self::VOLUME),
            available: self.bytes.load(Ordering::SeqCst),
        })
    }
}

impl<P: FreeSpaceProbe + ?Sized> FreeSpaceProbe for Arc<P> {
    fn volume_space(&self, path: &Path) -> Result<VolumeSpace> {
        (**self).volume_space(path)
    }
}

// ── DiskSpaceMonitor ───────────────────────────────────────────────

/// Hands out space reservations, one shared instance per process.
pub struct DiskSpaceMonitor {
    probe: Box<dyn FreeSpaceProbe>,
    /// Never reserved away, left for everything else on each volume.
    keep_free_bytes: u64,
    /// Outstanding reserved bytes per volume.
    reserved: Mutex<HashMap<PathBuf, u64>>,
}

impl DiskSpaceMonitor {
    pub fn new(probe: impl FreeSpaceProbe + 'static, keep_free_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            probe: Box::new(probe),
            keep_free_bytes,
            reserved: Mutex::new(HashMap::new()),
        })
    }

    /// Monitor backed by the real filesystem.
    pub fn system(keep_free_bytes: u64) -> Arc<Self> {
        Self::new(SystemFreeSpace, keep_free_bytes)
    }

    /// Reserve `bytes` on the filesystem backing `path`.
    ///
    /// The free-space check and the bookkeeping share one lock, so two concurrent
    /// callers can never both be granted space that exists only once, even
    /// when they write to different directories of the same volume.
    pub fn reserve(self: &Arc<Self>, path: &Path, bytes: u64) -> Result<Reservation> {
        let mut reserved = self.reserved.lock();
        let space = self.probe.volume_space(path)?;
        let already = reserved.get(&space.volume).copied().unwrap_or(0);
        let available = space
            .available
            .saturating_sub(self.keep_free_bytes)
            .saturating_sub(already);

        if available < bytes {
            tracing::debug!(
                ?path,
                volume = ?space.volume,
                requested = bytes,
                available,
                reserved = already,
                "reservation refused"
            );
            return Err(MergeError::InsufficientSpace {
                path: path.to_path_buf(),
                requested: bytes,
                available,
            });
        }

        *reserved.entry(space.volume.clone()).or_insert(0) += bytes;
        tracing::trace!(?path, volume = ?space.volume, bytes, total = already + bytes, "reserved disk space");

        Ok(Reservation {
            monitor: Arc::clone(self),
            path: path.to_path_buf(),
            volume: space.volume,
            bytes,
        })
    }

    /// Bytes currently held by live reservations on the volume of `path`.
    pub fn reserved_bytes(&self, path: &Path) -> Result<u64> {
        let reserved = self.reserved.lock();
        let space = self.probe.volume_space(path)?;
        Ok(reserved.get(&space.volume).copied().unwrap_or(0))
    }

    /// Space a new reservation on `path` could get right now.
    pub fn unreserved_space(&self, path: &Path) -> Result<u64> {
        let reserved = self.reserved.lock();
        let space = self.probe.volume_space(path)?;
        Ok(space
            .available
            .saturating_sub(self.keep_free_bytes)
            .saturating_sub(reserved.get(&space.volume).copied().unwrap_or(0)))
    }

    fn release(&self, volume: &Path, bytes: u64) {
        let mut reserved = self.reserved.lock();
        let held = reserved.get(volume).copied().unwrap_or(0);
        if held < bytes {
            tracing::error!(?volume, bytes, held, "releasing more disk space than reserved");
            reserved.remove(volume);
        } else if held == bytes {
            reserved.remove(volume);
        } else {
            reserved.insert(volume.to_path_buf(), held - bytes);
        }
    }
}

// ── Reservation ────────────────────────────────────────────────────

/// Bytes held against a path. Returned to the monitor exactly once, on drop.
#[must_use = "dropping a Reservation releases the space immediately"]
pub struct Reservation {
    monitor: Arc<DiskSpaceMonitor>,
    path: PathBuf,
    volume: PathBuf,
    bytes: u64,
}

impl Reservation {
    pub fn size(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filesystem the bytes are held against.
    pub fn volume(&self) -> &Path {
        &self.volume
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("path", &self.path)
            .field("volume", &self.volume)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.monitor.release(&self.volume, self.bytes);
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(free: u64) -> (Arc<StaticFreeSpace>, Arc<DiskSpaceMonitor>) {
        let probe = Arc::new(StaticFreeSpace::new(free));
        let monitor = DiskSpaceMonitor::new(Arc::clone(&probe), 0);
        (probe, monitor)
    }

    #[test]
    fn test_reserve_within_free_space() {
        let (_, monitor) = monitor(1000);
        let path = Path::new("/data/t1");
        let r = monitor.reserve(path, 600).unwrap();
        assert_eq!(r.size(), 600);
        assert_eq!(monitor.reserved_bytes(path).unwrap(), 600);
        assert_eq!(monitor.unreserved_space(path).unwrap(), 400);
    }

    #[test]
    fn test_second_reservation_sees_first() {
        let (_, monitor) = monitor(1000);
        let path = Path::new("/data/t1");
        let _first = monitor.reserve(path, 600).unwrap();
        let err = monitor.reserve(path, 600).unwrap_err();
        match err {
            MergeError::InsufficientSpace {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 600);
                assert_eq!(available, 400);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_drop_releases_space() {
        let (_, monitor) = monitor(1000);
        let path = Path::new("/data/t1");
        {
            let _r = monitor.reserve(path, 1000).unwrap();
            assert!(monitor.reserve(path, 1).is_err());
        }
        assert_eq!(monitor.reserved_bytes(path).unwrap(), 0);
        let _again = monitor.reserve(path, 1000).unwrap();
    }

    /// Two mount points with fixed free space each.
    struct TwoVolumes;

    impl FreeSpaceProbe for TwoVolumes {
        fn volume_space(&self, path: &Path) -> Result<VolumeSpace> {
            let volume = if path.starts_with("/mnt/b") { "/mnt/b" } else { "/" };
            Ok(VolumeSpace {
                volume: PathBuf::from(volume),
                available: 1000,
            })
        }
    }

    #[test]
    fn test_tables_on_one_volume_share_free_space() {
        let (_, monitor) = monitor(1000);
        let table_0 = Path::new("/data/table_0");
        let table_1 = Path::new("/data/table_1");
        let _a = monitor.reserve(table_0, 900).unwrap();
        let err = monitor.reserve(table_1, 900).unwrap_err();
        assert!(matches!(
            err,
            MergeError::InsufficientSpace { available: 100, .. }
        ));
        assert_eq!(monitor.reserved_bytes(table_1).unwrap(), 900);
        assert_eq!(monitor.unreserved_space(table_1).unwrap(), 100);
        let _b = monitor.reserve(table_1, 100).unwrap();
    }

    #[test]
    fn test_volumes_are_accounted_separately() {
        let monitor = DiskSpaceMonitor::new(TwoVolumes, 0);
        let a = monitor.reserve(Path::new("/data/t"), 900).unwrap();
        let b = monitor.reserve(Path::new("/mnt/b/t"), 900).unwrap();
        assert_eq!(a.volume(), Path::new("/"));
        assert_eq!(b.volume(), Path::new("/mnt/b"));
        assert!(monitor.reserve(Path::new("/mnt/b/u"), 200).is_err());

        drop(a);
        assert_eq!(monitor.reserved_bytes(Path::new("/data/t")).unwrap(), 0);
        assert_eq!(monitor.reserved_bytes(Path::new("/mnt/b")).unwrap(), 900);
    }

    #[test]
    fn test_keep_free_margin() {
        let probe = StaticFreeSpace::new(1000);
        let monitor = DiskSpaceMonitor::new(probe, 300);
        let path = Path::new("/data");
        assert!(monitor.reserve(path, 701).is_err());
        let _r = monitor.reserve(path, 700).unwrap();
    }

    #[test]
    fn test_free_space_changes_are_observed() {
        let (probe, monitor) = monitor(100);
        let path = Path::new("/data");
        assert!(monitor.reserve(path, 500).is_err());
        probe.set(1000);
        let _r = monitor.reserve(path, 500).unwrap();
    }

    #[test]
    fn test_system_free_space_on_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        // Containers may expose no disk list; only check that success is sane.
        if let Ok(space) = SystemFreeSpace.volume_space(dir.path()) {
            assert!(space.available < u64::MAX);
            assert!(dir.path().canonicalize().unwrap().starts_with(&space.volume));
        }
    }
}
