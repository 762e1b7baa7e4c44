//! Physical merge of a part group into one part.
//!
//! `MergeExecutor` is the seam between scheduling and data: the controller
//! only needs "N parts in, one uncommitted part out". `PartsMerger` is the
//! file-backed implementation:
//!
//! 1. Load every input part (in parallel via rayon, with a read-ahead hint)
//! 2. K-way merge by key; equal keys are grouped in input order
//! 3. Feed each equal-key run to the table's `RowMergeStrategy`
//! 4. Write the result to `tmp_merge_<name>/`
//!
//! The output stays in its temporary directory until the controller
//! publishes it under the part set's write lock.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use rayon::prelude::*;

use crate::error::Result;
use crate::merge_tree::merge::strategy::{strategy_for, RowMergeStrategy};
use crate::merge_tree::merge::types::MergeGroup;
use crate::merge_tree::reader::{prefetch_file, read_rows};
use crate::merge_tree::types::{Part, PartName, PartState, Row, DATA_FILE};
use crate::merge_tree::writer::{temp_dir_for, PartWriter};
use crate::settings::MergeTreeSettings;

pub trait MergeExecutor: Send + Sync {
    /// Merge `group` (parts of the table at `table_path`) into a new part
    /// named `new_name`. Must not touch the inputs.
    fn merge_parts(&self, table_path: &Path, group: &MergeGroup, new_name: &PartName)
        -> Result<MergedPart>;
}

// ── MergedPart ──────────────────────────────────────────────────────

/// Merge output that is not yet part of the table.
///
/// Its directory is deleted on drop unless `publish()` moved it into place.
#[derive(Debug)]
pub struct MergedPart {
    part: Arc<Part>,
    temp_dir: Option<PathBuf>,
    final_dir: PathBuf,
    published: bool,
}

impl MergedPart {
    /// Output written to `temp_dir`, to be renamed to `final_dir`.
    pub fn new(part: Part, temp_dir: PathBuf, final_dir: PathBuf) -> Self {
        part.set_state(PartState::MergingIn);
        Self {
            part: Arc::new(part),
            temp_dir: Some(temp_dir),
            final_dir,
            published: false,
        }
    }

    /// Output with no files of its own (in-memory executors).
    pub fn in_memory(part: Part) -> Self {
        part.set_state(PartState::MergingIn);
        Self {
            part: Arc::new(part),
            temp_dir: None,
            final_dir: PathBuf::new(),
            published: false,
        }
    }

    pub fn part(&self) -> &Arc<Part> {
        &self.part
    }

    /// Move the output directory to its final name.
    pub fn publish(&mut self) -> Result<()> {
        if let Some(temp) = self.temp_dir.as_ref() {
            fs::rename(temp, &self.final_dir)?;
        }
        self.published = true;
        Ok(())
    }
}

impl Drop for MergedPart {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        if let Some(temp) = self.temp_dir.take() {
            if let Err(e) = fs::remove_dir_all(&temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = ?temp, error = %e, "failed to remove unpublished merge output");
                }
            }
        }
    }
}

// ── PartsMerger ─────────────────────────────────────────────────────

pub struct PartsMerger {
    writer: PartWriter,
    strategy: Box<dyn RowMergeStrategy>,
}

impl PartsMerger {
    pub fn new(settings: &MergeTreeSettings) -> Self {
        Self::with_strategy(settings, strategy_for(settings.merge_mode))
    }

    pub fn with_strategy(settings: &MergeTreeSettings, strategy: Box<dyn RowMergeStrategy>) -> Self {
        Self {
            writer: PartWriter::new(settings.index_granularity),
            strategy,
        }
    }
}

impl MergeExecutor for PartsMerger {
    fn merge_parts(
        &self,
        table_path: &Path,
        group: &MergeGroup,
        new_name: &PartName,
    ) -> Result<MergedPart> {
        let inputs: Vec<Vec<Row>> = group
            .parts()
            .par_iter()
            .map(|part| {
                let data = part.name().dir(table_path).join(DATA_FILE);
                if let Err(e) = prefetch_file(&data) {
                    tracing::debug!(part = %part.name(), error = %e, "read-ahead hint failed");
                }
                read_rows(table_path, part)
            })
            .collect::<Result<_>>()?;

        let rows = merge_sorted(inputs, self.strategy.as_ref());

        let temp_dir = temp_dir_for(table_path, "merge", new_name);
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }
        let meta = match self.writer.write_dir(&temp_dir, &rows, SystemTime::now()) {
            Ok(meta) => meta,
            Err(e) => {
                let _ = fs::remove_dir_all(&temp_dir);
                return Err(e);
            }
        };
        let merged = MergedPart::new(
            Part::new(new_name.clone(), meta),
            temp_dir,
            new_name.dir(table_path),
        );

        tracing::debug!(
            part = %new_name,
            strategy = self.strategy.name(),
            rows_in = group.total_rows(),
            rows_out = rows.len(),
            "merged rows"
        );
        Ok(merged)
    }
}

/// K-way merge of key-sorted inputs. Rows with equal keys are handed to
/// `strategy` as one run, ordered by input index.
pub fn merge_sorted(inputs: Vec<Vec<Row>>, strategy: &dyn RowMergeStrategy) -> Vec<Row> {
    let total: usize = inputs.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut cursors: Vec<std::vec::IntoIter<Row>> = inputs.into_iter().map(Vec::into_iter).collect();

    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
    let mut heads: Vec<Option<Row>> = Vec::with_capacity(cursors.len());
    for (idx, cursor) in cursors.iter_mut().enumerate() {
        let head = cursor.next();
        if let Some(row) = head.as_ref() {
            heap.push(Reverse((row.key, idx)));
        }
        heads.push(head);
    }

    let mut run: Vec<Row> = Vec::new();
    while let Some(Reverse((key, idx))) = heap.pop() {
        if run.first().map_or(false, |r| r.key != key) {
            strategy.merge_run(&run, &mut out);
            run.clear();
        }
        // Drain every row of this input with the same key before moving on,
        // so equal keys stay in input order.
        while let Some(row) = heads[idx].take() {
            if row.key != key {
                heap.push(Reverse((row.key, idx)));
                heads[idx] = Some(row);
                break;
            }
            run.push(row);
            heads[idx] = cursors[idx].next();
        }
    }
    if !run.is_empty() {
        strategy.merge_run(&run, &mut out);
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────
