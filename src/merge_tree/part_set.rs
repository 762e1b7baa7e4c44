//! Authoritative collection of a table's parts.
//!
//! Active parts are kept ordered by (partition, range start). Replacement of
//! N merged parts by their output happens under one write lock, so a reader
//! taking a snapshot sees either all inputs or the output, never both.
//!
//! Outdated parts stay in the set until nobody references them and
//! `old_parts_lifetime` has passed; `clear_old_parts()` then deletes them.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{MergeError, Result};
use crate::merge_tree::reader::read_meta;
use crate::merge_tree::types::{Part, PartName, PartState, PartsVector, TMP_PREFIX};

struct OutdatedPart {
    part: Arc<Part>,
    since: Instant,
}

#[derive(Default)]
struct Inner {
    active: BTreeMap<(u32, u64), Arc<Part>>,
    outdated: Vec<OutdatedPart>,
}

impl Inner {
    /// Active neighbours of `name` in its partition that overlap it.
    fn overlapping(&self, name: &PartName) -> Option<&Arc<Part>> {
        let lower = (name.partition, 0);
        let upper = (name.partition, name.range.end);
        self.active
            .range(lower..upper)
            .map(|(_, p)| p)
            .find(|p| p.range().overlaps(&name.range))
    }
}

pub struct PartSet {
    table_path: PathBuf,
    inner: RwLock<Inner>,
    /// Next free block number per partition.
    next_block: Mutex<HashMap<u32, u64>>,
}

impl PartSet {
    /// Empty set for a table stored at `table_path`.
    pub fn new(table_path: impl Into<PathBuf>) -> Self {
        Self {
            table_path: table_path.into(),
            inner: RwLock::new(Inner::default()),
            next_block: Mutex::new(HashMap::new()),
        }
    }

    /// Open the parts stored under `table_path`, creating the directory if
    /// needed.
    ///
    /// Leftover `tmp_*` directories are deleted. A part whose range is covered
    /// by a bigger part of the same partition is the input of a merge that
    /// committed before a crash; it is loaded as Outdated.
    pub fn load(table_path: impl Into<PathBuf>) -> Result<Self> {
        let set = Self::new(table_path);
        fs::create_dir_all(&set.table_path)?;

        let mut found: Vec<Part> = Vec::new();
        for entry in fs::read_dir(&set.table_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(dir_name) = file_name.to_str() else {
                tracing::warn!(path = ?entry.path(), "skipping non-UTF-8 directory");
                continue;
            };

            if dir_name.starts_with(TMP_PREFIX) {
                tracing::info!(dir = dir_name, "removing leftover temporary directory");
                fs::remove_dir_all(entry.path())?;
                continue;
            }

            let name: PartName = match dir_name.parse() {
                Ok(name) => name,
                Err(_) => {
                    tracing::warn!(dir = dir_name, "skipping directory that is not a part");
                    continue;
                }
            };
            let meta = read_meta(&entry.path()).map_err(|e| MergeError::CorruptedPart {
                part: dir_name.to_string(),
                reason: format!("unreadable meta: {e}"),
            })?;
            found.push(Part::new(name, meta));
        }

        // Widest part first for each start, so coverers precede the covered.
        found.sort_by(|a, b| {
            (a.partition(), a.range().start, std::cmp::Reverse(a.range().end))
                .cmp(&(b.partition(), b.range().start, std::cmp::Reverse(b.range().end)))
        });

        let mut next_block = set.next_block.lock();
        let mut inner = set.inner.write();
        let mut last: Option<PartName> = None;
        for part in found {
            let name = part.name().clone();
            if let Some(prev) = last.as_ref() {
                if prev.contains(&name) {
                    tracing::info!(part = %name, covered_by = %prev, "loading covered part as outdated");
                    part.set_state(PartState::Outdated);
                    inner.outdated.push(OutdatedPart {
                        part: Arc::new(part),
                        since: Instant::now(),
                    });
                    continue;
                }
                if prev.partition == name.partition && prev.range.overlaps(&name.range) {
                    return Err(MergeError::Logical(format!(
                        "parts {prev} and {name} intersect"
                    )));
                }
            }
            let block = next_block.entry(name.partition).or_insert(0);
            *block = (*block).max(name.range.end);
            inner
                .active
                .insert((name.partition, name.range.start), Arc::new(part));
            last = Some(name);
        }

        tracing::info!(
            path = ?set.table_path,
            active = inner.active.len(),
            outdated = inner.outdated.len(),
            "loaded parts"
        );
        drop(inner);
        drop(next_block);
        Ok(set)
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    /// Active parts ordered by (partition, start).
    pub fn snapshot(&self) -> PartsVector {
        self.inner.read().active.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn outdated_len(&self) -> usize {
        self.inner.read().outdated.len()
    }

    /// Active part with exactly this name.
    pub fn get(&self, name: &PartName) -> Option<Arc<Part>> {
        self.inner
            .read()
            .active
            .get(&(name.partition, name.range.start))
            .filter(|p| p.name() == name)
            .cloned()
    }

    /// Block number the next insert into `partition` will get.
    pub fn next_block(&self, partition: u32) -> u64 {
        self.next_block.lock().get(&partition).copied().unwrap_or(0)
    }

    /// Write and publish a new level-0 part of `partition`.
    ///
    /// `write` gets the name of the next free block and must put the part's
    /// files in place. The block number is only consumed when the part
    /// becomes Active, so a failed write leaves no hole in the partition's
    /// block range. Inserts into one table are serialized by this call.
    pub fn insert_with<F>(&self, partition: u32, write: F) -> Result<Arc<Part>>
    where
        F: FnOnce(&PartName) -> Result<Part>,
    {
        let mut next = self.next_block.lock();
        let number = next.get(&partition).copied().unwrap_or(0);
        let name = PartName::new(partition, number, number + 1, 0);

        let part = write(&name)?;
        if part.name() != &name {
            return Err(MergeError::Logical(format!(
                "insert wrote part {} instead of {name}",
                part.name()
            )));
        }
        let part = self.activate(part)?;
        next.insert(partition, number + 1);
        Ok(part)
    }

    /// Make a freshly written part Active.
    pub fn add(&self, part: Part) -> Result<Arc<Part>> {
        let mut next = self.next_block.lock();
        let part = self.activate(part)?;
        let block = next.entry(part.partition()).or_insert(0);
        *block = (*block).max(part.range().end);
        Ok(part)
    }

    /// Lock order: `next_block` (held by callers) before `inner`.
    fn activate(&self, part: Part) -> Result<Arc<Part>> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.overlapping(part.name()) {
            return Err(MergeError::Logical(format!(
                "part {} intersects active part {}",
                part.name(),
                existing.name()
            )));
        }

        part.set_state(PartState::Active);
        let part = Arc::new(part);
        inner
            .active
            .insert((part.partition(), part.range().start), Arc::clone(&part));
        Ok(part)
    }

    /// Atomically replace `old` (contiguous, all Active) by `new`.
    ///
    /// `before_swap` runs under the write lock after validation and before
    /// any state changes; it is where the caller moves the new part's files
    /// into place. If it fails nothing is changed.
    pub fn replace<F>(&self, old: &[Arc<Part>], new: Arc<Part>, before_swap: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut inner = self.inner.write();

        for part in old {
            let current = inner
                .active
                .get(&(part.partition(), part.range().start))
                .filter(|cur| Arc::ptr_eq(cur, part));
            if current.is_none() || part.state() != PartState::Active {
                return Err(MergeError::Logical(format!(
                    "merged part {} is no longer active",
                    part.name()
                )));
            }
            if !new.name().contains(part.name()) {
                return Err(MergeError::Logical(format!(
                    "new part {} does not cover {}",
                    new.name(),
                    part.name()
                )));
            }
        }
        let covered: u64 = old.iter().map(|p| p.range().len()).sum();
        if covered != new.range().len() {
            return Err(MergeError::Logical(format!(
                "new part {} does not match the union of its inputs",
                new.name()
            )));
        }

        before_swap()?;

        let now = Instant::now();
        for part in old {
            inner.active.remove(&(part.partition(), part.range().start));
            part.set_state(PartState::Outdated);
            inner.outdated.push(OutdatedPart {
                part: Arc::clone(part),
                since: now,
            });
        }
        new.set_state(PartState::Active);
        inner
            .active
            .insert((new.partition(), new.range().start), new);
        Ok(())
    }

    /// Detach outdated parts nobody references that are older than `lifetime`.
    pub fn grab_old_parts(&self, lifetime: Duration) -> PartsVector {
        let mut inner = self.inner.write();
        let mut grabbed = Vec::new();
        inner.outdated.retain(|old| {
            let expired = old.since.elapsed() >= lifetime && Arc::strong_count(&old.part) == 1;
            if expired {
                grabbed.push(Arc::clone(&old.part));
            }
            !expired
        });
        grabbed
    }

    /// Delete the directories of expired outdated parts. Returns how many
    /// were removed.
    pub fn clear_old_parts(&self, lifetime: Duration) -> Result<usize> {
        let grabbed = self.grab_old_parts(lifetime);
        for part in &grabbed {
            let dir = part.name().dir(&self.table_path);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            part.set_state(PartState::Removed);
            tracing::debug!(part = %part.name(), "removed old part");
        }
        Ok(grabbed.len())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
