//! TableMergeController - per-table merge orchestration
//!
//! Owns a table's part set, its currently-merging set and its registration
//! in the shared `BackgroundPool`.
//!
//! # Merge flow
//!
//! 1. Take the tagging lock, snapshot the active parts, ask the selector
//! 2. Reserve disk space and tag the group (still under the lock)
//! 3. Release the lock, run the executor
//! 4. Publish the output and swap it in under the part set's write lock
//! 5. Drop the tagger: untag, release the reservation
//!
//! Any failure before step 4 completes leaves the part set untouched.
//!
//! # Lifecycle
//!
//! `Running -> ShuttingDown -> Shutdown`. Shutdown deregisters the pool task,
//! which waits for an in-flight `merge_task()` to return. It runs at most
//! once and again on drop.
//!
//! # Usage
//!
//! ```no_run
//! use mergetree::background_pool::BackgroundPool;
//! use mergetree::disk_space::DiskSpaceMonitor;
//! use mergetree::merge_tree::{Row, TableMergeController};
//! use mergetree::settings::{MergeTreeSettings, PoolConfig};
//!
//! let pool = BackgroundPool::new(&PoolConfig::default()).unwrap();
//! let disk = DiskSpaceMonitor::system(0);
//! let table = TableMergeController::open("hits", "/data/hits", MergeTreeSettings::default(), disk).unwrap();
//! table.attach_to(&pool).unwrap();
//!
//! table.insert(vec![Row::new(1, 10), Row::new(2, 20)]).unwrap();
//! table.optimize().unwrap();
//! table.shutdown();
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::background_pool::{BackgroundPool, TaskHandle};
use crate::disk_space::DiskSpaceMonitor;
use crate::error::{MergeError, Result};
use crate::merge_tree::merge::{
    CurrentlyMerging, MergeExecutor, MergeOutcome, MergeSelector, MergeTagger, PartsMerger,
};
use crate::merge_tree::part_set::PartSet;
use crate::merge_tree::types::{duration_to_ms, PartName, PartsVector, Row};
use crate::merge_tree::writer::{split_by_partition, PartWriter};
use crate::metrics::{MergeMetrics, MergeMetricsSnapshot};
use crate::settings::MergeTreeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TableState {
    Running = 0,
    ShuttingDown = 1,
    Shutdown = 2,
}

impl TableState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TableState::Running,
            1 => TableState::ShuttingDown,
            _ => TableState::Shutdown,
        }
    }
}

// ── Shared table state ──────────────────────────────────────────────

struct TableInner {
    name: String,
    path: PathBuf,
    settings: MergeTreeSettings,
    parts: PartSet,
    currently_merging: CurrentlyMerging,
    selector: MergeSelector,
    executor: Box<dyn MergeExecutor>,
    disk: Arc<DiskSpaceMonitor>,
    writer: PartWriter,
    state: AtomicU8,
    metrics: MergeMetrics,
}

impl TableInner {
    fn state(&self) -> TableState {
        TableState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            TableState::Running => Ok(()),
            _ => Err(MergeError::TableShutdown(self.name.clone())),
        }
    }

    /// Select, tag and reserve under the tagging lock.
    fn tag_next(&self, aggressive: bool) -> Result<Option<MergeTagger<'_>>> {
        let mut guard = self.currently_merging.lock();
        let snapshot = self.parts.snapshot();
        let Some(group) = self.selector.select(&snapshot, guard.tagged(), aggressive) else {
            return Ok(None);
        };

        let reserve = self.settings.reservation_for(group.total_bytes());
        match guard.tag(group, &self.disk, &self.path, reserve) {
            Ok(tagger) => Ok(Some(tagger)),
            Err(e @ MergeError::InsufficientSpace { .. }) => {
                self.metrics.record_space_refusal();
                tracing::info!(table = %self.name, error = %e, "not enough space to merge");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn merge(&self, aggressive: bool) -> Result<MergeOutcome> {
        self.ensure_running()?;
        let started = Instant::now();

        let Some(tagger) = self.tag_next(aggressive)? else {
            return Ok(MergeOutcome::NoCandidate);
        };
        let group = tagger.group();
        let new_name = group.output_name()?;

        tracing::info!(
            table = %self.name,
            group = %group,
            new_part = %new_name,
            aggressive,
            reserved = tagger.reserved_bytes(),
            "merging parts"
        );

        let committed = self
            .executor
            .merge_parts(&self.path, group, &new_name)
            .and_then(|mut merged| {
                let new_part = Arc::clone(merged.part());
                self.parts
                    .replace(group.parts(), new_part, || merged.publish())
            });

        if let Err(e) = committed {
            self.metrics.record_failure();
            tracing::error!(
                table = %self.name,
                group = %group,
                error = %e,
                code = e.code(),
                "merge failed"
            );
            return Err(e);
        }

        let duration = started.elapsed();
        let duration_ms = duration_to_ms(duration);
        let outcome = MergeOutcome::Merged {
            new_part: new_name,
            inputs: group.len(),
            bytes: group.total_bytes(),
            rows: group.total_rows(),
            duration,
        };
        self.metrics.record_merge(
            group.len() as u64,
            group.total_bytes(),
            group.total_rows(),
            duration_ms,
        );
        tracing::info!(
            table = %self.name,
            group = %group,
            duration_ms,
            "merge committed"
        );
        drop(tagger);
        Ok(outcome)
    }

    fn merge_task(&self) -> bool {
        if self.state() != TableState::Running {
            return false;
        }
        let did_work = match self.merge(false) {
            Ok(outcome) => outcome.did_work(),
            Err(MergeError::InsufficientSpace { .. }) => false,
            Err(e) => {
                tracing::warn!(table = %self.name, error = %e, "background merge failed");
                false
            }
        };
        if let Err(e) = self.clear_old_parts() {
            tracing::warn!(table = %self.name, error = %e, "failed to remove old parts");
        }
        did_work
    }

    fn clear_old_parts(&self) -> Result<usize> {
        let removed = self.parts.clear_old_parts(self.settings.old_parts_lifetime)?;
        if removed > 0 {
            self.metrics.record_old_parts_removed(removed as u64);
            tracing::debug!(table = %self.name, removed, "removed old parts");
        }
        Ok(removed)
    }
}

// ── TableMergeController ────────────────────────────────────────────

pub struct TableMergeController {
    inner: Arc<TableInner>,
    task: Mutex<Option<TaskHandle>>,
}

impl TableMergeController {
    /// Open (or create) the table at `path` with the file-backed merger.
    pub fn open(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        settings: MergeTreeSettings,
        disk: Arc<DiskSpaceMonitor>,
    ) -> Result<Self> {
        let executor = Box::new(PartsMerger::new(&settings));
        let selector = MergeSelector::new(&settings);
        Self::open_with(name, path, settings, disk, executor, selector)
    }

    /// Open with a custom executor and selector.
    pub fn open_with(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        settings: MergeTreeSettings,
        disk: Arc<DiskSpaceMonitor>,
        executor: Box<dyn MergeExecutor>,
        selector: MergeSelector,
    ) -> Result<Self> {
        settings.validate()?;
        let name = name.into();
        let path = path.into();
        let parts = PartSet::load(&path)?;

        tracing::info!(table = %name, path = ?path, parts = parts.len(), "opened table");
        Ok(Self {
            inner: Arc::new(TableInner {
                name,
                path,
                writer: PartWriter::new(settings.index_granularity),
                settings,
                parts,
                currently_merging: CurrentlyMerging::new(),
                selector,
                executor,
                disk,
                state: AtomicU8::new(TableState::Running as u8),
                metrics: MergeMetrics::new(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Register this table's merge task with `pool`.
    pub fn attach_to(&self, pool: &BackgroundPool) -> Result<()> {
        self.inner.ensure_running()?;
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(MergeError::Logical(format!(
                "table {} is already attached to a pool",
                self.inner.name
            )));
        }
        let weak: Weak<TableInner> = Arc::downgrade(&self.inner);
        let handle = pool.register(format!("merge:{}", self.inner.name), move || {
            Ok(weak.upgrade().map_or(false, |inner| inner.merge_task()))
        });
        *task = Some(handle);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn settings(&self) -> &MergeTreeSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> TableState {
        self.inner.state()
    }

    /// Active parts, ordered by (partition, start).
    pub fn parts(&self) -> PartsVector {
        self.inner.parts.snapshot()
    }

    pub fn part_set(&self) -> &PartSet {
        &self.inner.parts
    }

    /// Number of parts claimed by in-flight merges.
    pub fn currently_merging(&self) -> usize {
        self.inner.currently_merging.len()
    }

    pub fn metrics(&self) -> MergeMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Write `rows` as new level-0 parts, one per partition, and wake the
    /// merge task.
    pub fn insert(&self, rows: Vec<Row>) -> Result<Vec<PartName>> {
        self.inner.ensure_running()?;
        let inner = &self.inner;
        let mut created = Vec::new();
        for (partition, block) in split_by_partition(rows, inner.settings.partitioned) {
            let part = inner.parts.insert_with(partition, |name| {
                inner.writer.write_part(&inner.path, name, block)
            })?;
            created.push(part.name().clone());
        }

        if !created.is_empty() {
            tracing::debug!(table = %inner.name, parts = created.len(), "inserted block");
            if let Some(task) = self.task.lock().as_ref() {
                task.wake();
            }
        }
        Ok(created)
    }

    /// One merge attempt on the caller's thread.
    pub fn merge(&self, aggressive: bool) -> Result<MergeOutcome> {
        self.inner.merge(aggressive)
    }

    /// Forced merge ignoring the size heuristics. One group per call.
    pub fn optimize(&self) -> Result<MergeOutcome> {
        self.inner.merge(true)
    }

    /// Background pool entry point. True if a merge was committed.
    pub fn merge_task(&self) -> bool {
        self.inner.merge_task()
    }

    /// Delete outdated parts nobody reads any more.
    pub fn clear_old_parts(&self) -> Result<usize> {
        self.inner.clear_old_parts()
    }

    /// Stop background merging. Blocks until a running `merge_task()`
    /// returns. Idempotent.
    pub fn shutdown(&self) {
        let transitioned = self
            .inner
            .state
            .compare_exchange(
                TableState::Running as u8,
                TableState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            return;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.deregister();
        }
        self.inner
            .state
            .store(TableState::Shutdown as u8, Ordering::Release);
        tracing::info!(table = %self.inner.name, "table shut down");
    }
}

impl Drop for TableMergeController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ──────────────────────────────────────────────────────────
