//! In-flight merge bookkeeping.
//!
//! `CurrentlyMerging` is the per-table set of part names claimed by running
//! merges. A `MergeTagger` claims a group's names together with a disk
//! reservation and gives both back when dropped, on every exit path.
//!
//! Lock order: the tagging lock is taken before the part set's lock, never
//! after it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::disk_space::{DiskSpaceMonitor, Reservation};
use crate::error::{MergeError, Result};
use crate::merge_tree::merge::types::MergeGroup;
use crate::merge_tree::types::PartName;

#[derive(Default)]
pub struct CurrentlyMerging {
    names: Mutex<HashSet<PartName>>,
}

impl CurrentlyMerging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the tagging lock. Select and tag while holding it.
    pub fn lock(&self) -> TaggingGuard<'_> {
        TaggingGuard {
            registry: self,
            names: self.names.lock(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &PartName) -> bool {
        self.names.lock().contains(name)
    }
}

/// Held tagging lock.
pub struct TaggingGuard<'a> {
    registry: &'a CurrentlyMerging,
    names: MutexGuard<'a, HashSet<PartName>>,
}

impl<'a> TaggingGuard<'a> {
    /// Names claimed by in-flight merges.
    pub fn tagged(&self) -> &HashSet<PartName> {
        &self.names
    }

    /// Reserve `reserve_bytes` on `path`, then claim every part of `group`.
    ///
    /// Fails with `InsufficientSpace` before anything is tagged, or with
    /// `Logical` if a member is already claimed (the reservation is then
    /// released again).
    pub fn tag(
        &mut self,
        group: MergeGroup,
        disk: &Arc<DiskSpaceMonitor>,
        path: &Path,
        reserve_bytes: u64,
    ) -> Result<MergeTagger<'a>> {
        let reservation = disk.reserve(path, reserve_bytes)?;

        if let Some(name) = group.names().find(|n| self.names.contains(*n)) {
            return Err(MergeError::Logical(format!(
                "part {name} is already being merged"
            )));
        }
        for name in group.names() {
            self.names.insert(name.clone());
        }

        tracing::debug!(group = %group, reserved = reserve_bytes, "tagged parts for merge");
        Ok(MergeTagger {
            registry: self.registry,
            group,
            reservation,
        })
    }
}

/// Claim on a merge group plus the disk space its output needs.
#[must_use = "dropping a MergeTagger untags the group immediately"]
pub struct MergeTagger<'a> {
    registry: &'a CurrentlyMerging,
    group: MergeGroup,
    reservation: Reservation,
}

impl std::fmt::Debug for MergeTagger<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeTagger")
            .field("group", &self.group)
            .field("reserved_bytes", &self.reservation.size())
            .finish_non_exhaustive()
    }
}

impl<'a> MergeTagger<'a> {
    pub fn group(&self) -> &MergeGroup {
        &self.group
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.size()
    }
}

impl Drop for MergeTagger<'_> {
    fn drop(&mut self) {
        let mut names = self.registry.names.lock();
        for name in self.group.names() {
            if !names.remove(name) {
                tracing::error!(
                    part = %name,
                    "Logical error: untagging part that was not tagged. This is a bug."
                );
            }
        }
        // `reservation` is released when the fields drop.
    }
}

// ── Tests ──────────────────────────────────────────────────────────
