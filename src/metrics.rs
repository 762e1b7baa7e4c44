//! Merge and pool metrics
//!
//! Lightweight, thread-safe counters for the merge scheduler. One
//! `MergeMetrics` lives in every table controller, one `PoolStats` in every
//! background pool.
//!
//! # Design Decisions
//!
//! - **Lock-free counters**: every counter is an `AtomicU64`
//! - **Bounded memory**: merge durations live in a fixed-size rolling window
//! - **Serializable snapshots**: `snapshot()` returns plain structs that
//!   `mergetreectl` prints as JSON
//!
//! # Example
//!
//! ```
//! use mergetree::metrics::MergeMetrics;
//!
//! let metrics = MergeMetrics::new();
//! metrics.record_merge(3, 4096, 100, 12);
//! assert_eq!(metrics.snapshot().merges_completed, 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Number of recent merge durations kept for percentile calculation.
const DURATION_WINDOW_SIZE: usize = 256;

/// Merges slower than this are counted separately.
pub const SLOW_MERGE_THRESHOLD_MS: u64 = 10_000;

// ── MergeMetrics ───────────────────────────────────────────────────

/// Per-table merge counters.
pub struct MergeMetrics {
    merges_completed: AtomicU64,
    merges_failed: AtomicU64,
    slow_merges: AtomicU64,
    /// Attempts refused by the disk space monitor
    space_refusals: AtomicU64,
    parts_merged: AtomicU64,
    bytes_merged: AtomicU64,
    rows_merged: AtomicU64,
    old_parts_removed: AtomicU64,
    durations_ms: Mutex<VecDeque<u64>>,
}

/// Point-in-time copy of `MergeMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeMetricsSnapshot {
    pub merges_completed: u64,
    pub merges_failed: u64,
    pub slow_merges: u64,
    pub space_refusals: u64,
    pub parts_merged: u64,
    pub bytes_merged: u64,
    pub rows_merged: u64,
    pub old_parts_removed: u64,
    pub merge_p50_ms: u64,
    pub merge_p95_ms: u64,
}

impl MergeMetrics {
    pub fn new() -> Self {
        Self {
            merges_completed: AtomicU64::new(0),
            merges_failed: AtomicU64::new(0),
            slow_merges: AtomicU64::new(0),
            space_refusals: AtomicU64::new(0),
            parts_merged: AtomicU64::new(0),
            bytes_merged: AtomicU64::new(0),
            rows_merged: AtomicU64::new(0),
            old_parts_removed: AtomicU64::new(0),
            durations_ms: Mutex::new(VecDeque::with_capacity(DURATION_WINDOW_SIZE)),
        }
    }

    /// Record a committed merge of `parts` inputs totalling `bytes`/`rows`.
    pub fn record_merge(&self, parts: u64, bytes: u64, rows: u64, duration_ms: u64) {
        self.merges_completed.fetch_add(1, Ordering::Relaxed);
        self.parts_merged.fetch_add(parts, Ordering::Relaxed);
        self.bytes_merged.fetch_add(bytes, Ordering::Relaxed);
        self.rows_merged.fetch_add(rows, Ordering::Relaxed);
        if duration_ms >= SLOW_MERGE_THRESHOLD_MS {
            self.slow_merges.fetch_add(1, Ordering::Relaxed);
        }

        let mut durations = self.durations_ms.lock();
        if durations.len() >= DURATION_WINDOW_SIZE {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
    }

    pub fn record_failure(&self) {
        self.merges_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_space_refusal(&self) {
        self.space_refusals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_old_parts_removed(&self, count: u64) {
        self.old_parts_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MergeMetricsSnapshot {
        let (p50, p95) = {
            let durations = self.durations_ms.lock();
            if durations.is_empty() {
                (0, 0)
            } else {
                let mut sorted: Vec<u64> = durations.iter().copied().collect();
                sorted.sort_unstable();
                let len = sorted.len();
                (sorted[len * 50 / 100], sorted[len * 95 / 100])
            }
        };

        MergeMetricsSnapshot {
            merges_completed: self.merges_completed.load(Ordering::Relaxed),
            merges_failed: self.merges_failed.load(Ordering::Relaxed),
            slow_merges: self.slow_merges.load(Ordering::Relaxed),
            space_refusals: self.space_refusals.load(Ordering::Relaxed),
            parts_merged: self.parts_merged.load(Ordering::Relaxed),
            bytes_merged: self.bytes_merged.load(Ordering::Relaxed),
            rows_merged: self.rows_merged.load(Ordering::Relaxed),
            old_parts_removed: self.old_parts_removed.load(Ordering::Relaxed),
            merge_p50_ms: p50,
            merge_p95_ms: p95,
        }
    }
}

impl Default for MergeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ── PoolStats ──────────────────────────────────────────────────────

/// Background pool counters.
#[derive(Default)]
pub struct PoolStats {
    runs: AtomicU64,
    productive_runs: AtomicU64,
    idle_runs: AtomicU64,
    errors: AtomicU64,
    panics: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub runs: u64,
    pub productive_runs: u64,
    pub idle_runs: u64,
    pub errors: u64,
    pub panics: u64,
}

/// How a single task invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    DidWork,
    Idle,
    Failed,
    Panicked,
}

impl PoolStats {
    pub fn record(&self, result: RunResult) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            RunResult::DidWork => &self.productive_runs,
            RunResult::Idle => &self.idle_runs,
            RunResult::Failed => &self.errors,
            RunResult::Panicked => &self.panics,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            productive_runs: self.productive_runs.load(Ordering::Relaxed),
            idle_runs: self.idle_runs.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
