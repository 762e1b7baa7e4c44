//! Part model types and on-disk layout constants.
//!
//! A part is the atomic building block of a table: an immutable, key-sorted
//! run of rows covering a half-open range of block numbers in one partition.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};

// ── Constants ──────────────────────────────────────────────────────

/// Row data file inside a part directory
pub const DATA_FILE: &str = "data.bin";

/// Sparse primary index: first key of every granule
pub const INDEX_FILE: &str = "primary.idx";

/// Part metadata (JSON)
pub const META_FILE: &str = "meta.json";

/// Prefix of directories that are not (yet) committed parts
pub const TMP_PREFIX: &str = "tmp_";

/// Snapshot of parts, ordered by (partition, range start)
pub type PartsVector = Vec<Arc<Part>>;

// ── Block Range ────────────────────────────────────────────────────

/// Half-open range of block numbers `[start, end)` covered by a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end, "empty block range [{start}, {end})");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `next` starts exactly where `self` ends.
    pub fn is_followed_by(&self, next: &BlockRange) -> bool {
        self.end == next.start
    }

    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &BlockRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Part Name ──────────────────────────────────────────────────────

/// Unique part identifier, rendered as `<partition>_<start>_<end>_<level>`.
///
/// The derived ordering sorts by partition, then range, then level, which
/// is the order parts are kept in a `PartSet`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartName {
    pub partition: u32,
    pub range: BlockRange,
    pub level: u32,
}

impl PartName {
    pub fn new(partition: u32, start: u64, end: u64, level: u32) -> Self {
        Self {
            partition,
            range: BlockRange::new(start, end),
            level,
        }
    }

    /// Name of the part produced by merging `parts` (ordered, contiguous).
    pub fn for_merge(parts: &[Arc<Part>]) -> Result<Self> {
        let (first, last) = match (parts.first(), parts.last()) {
            (Some(first), Some(last)) if parts.len() >= 2 => (first, last),
            _ => {
                return Err(MergeError::Logical(format!(
                    "merge group must contain at least 2 parts, got {}",
                    parts.len()
                )))
            }
        };
        let level = parts.iter().map(|p| p.level()).max().unwrap_or(0) + 1;
        Ok(Self {
            partition: first.partition(),
            range: BlockRange::new(first.range().start, last.range().end),
            level,
        })
    }

    /// Whether this part's range fully covers `other` in the same partition.
    pub fn contains(&self, other: &PartName) -> bool {
        self.partition == other.partition && self.range.contains(&other.range)
    }

    /// Directory of this part under `table_path`.
    pub fn dir(&self, table_path: &Path) -> PathBuf {
        table_path.join(self.to_string())
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition, self.range.start, self.range.end, self.level
        )
    }
}

impl FromStr for PartName {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MergeError::InvalidPartName(s.to_string());
        let fields: Vec<&str> = s.split('_').collect();
        if fields.len() != 4 {
            return Err(invalid());
        }
        let partition: u32 = fields[0].parse().map_err(|_| invalid())?;
        let start: u64 = fields[1].parse().map_err(|_| invalid())?;
        let end: u64 = fields[2].parse().map_err(|_| invalid())?;
        let level: u32 = fields[3].parse().map_err(|_| invalid())?;
        if start >= end {
            return Err(invalid());
        }
        Ok(Self::new(partition, start, end, level))
    }
}

// ── Part State ─────────────────────────────────────────────────────

/// Lifecycle of a part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PartState {
    /// Visible to readers and merge selection
    Active = 0,
    /// Output of an in-flight merge, not yet committed
    MergingIn = 1,
    /// Superseded by a merged part; kept while readers still hold it
    Outdated = 2,
    /// Files deleted
    Removed = 3,
}

impl PartState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Active),
            1 => Some(Self::MergingIn),
            2 => Some(Self::Outdated),
            3 => Some(Self::Removed),
            _ => None,
        }
    }
}

// ── Part Meta ──────────────────────────────────────────────────────

/// Contents of `meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMeta {
    pub rows: u64,
    pub marks: u64,
    /// Total size of the part's files on disk
    pub bytes: u64,
    /// blake3 of `data.bin`, hex
    pub checksum: String,
    pub created_at_ms: u64,
}

impl PartMeta {
    /// Metadata for a part that exists only in memory (selection, tests).
    pub fn in_memory(rows: u64, bytes: u64, created_at: SystemTime) -> Self {
        Self {
            rows,
            marks: 0,
            bytes,
            checksum: String::new(),
            created_at_ms: system_time_to_ms(created_at),
        }
    }

    pub fn created_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_at_ms)
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub fn system_time_to_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(duration_to_ms).unwrap_or(0)
}

// ── Part ───────────────────────────────────────────────────────────

/// Immutable data part. Only its lifecycle state ever changes.
#[derive(Debug)]
pub struct Part {
    name: PartName,
    meta: PartMeta,
    state: AtomicU8,
}

impl Part {
    pub fn new(name: PartName, meta: PartMeta) -> Self {
        Self::with_state(name, meta, PartState::Active)
    }

    pub fn with_state(name: PartName, meta: PartMeta, state: PartState) -> Self {
        Self {
            name,
            meta,
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn name(&self) -> &PartName {
        &self.name
    }

    pub fn partition(&self) -> u32 {
        self.name.partition
    }

    pub fn range(&self) -> BlockRange {
        self.name.range
    }

    pub fn level(&self) -> u32 {
        self.name.level
    }

    pub fn meta(&self) -> &PartMeta {
        &self.meta
    }

    pub fn bytes(&self) -> u64 {
        self.meta.bytes
    }

    pub fn rows(&self) -> u64 {
        self.meta.rows
    }

    pub fn created_at(&self) -> SystemTime {
        self.meta.created_at()
    }

    /// Time since creation; zero for parts stamped in the future.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at()).unwrap_or(Duration::ZERO)
    }

    pub fn state(&self) -> PartState {
        PartState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(PartState::Removed)
    }

    pub(crate) fn set_state(&self, state: PartState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

// ── Row ────────────────────────────────────────────────────────────

/// One table row. Parts store rows sorted by `key`.
///
/// `sign` is only meaningful for collapsing tables, `value` is the column
/// summed by summing tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: u64,
    pub partition: u32,
    pub sign: i8,
    pub value: i64,
}

impl Row {
    pub fn new(key: u64, value: i64) -> Self {
        Self {
            key,
            partition: 0,
            sign: 1,
            value,
        }
    }

    pub fn in_partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_sign(mut self, sign: i8) -> Self {
        self.sign = sign;
        self
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn part(partition: u32, start: u64, end: u64, level: u32) -> Arc<Part> {
        Arc::new(Part::new(
            PartName::new(partition, start, end, level),
            PartMeta::in_memory(10, 100, SystemTime::now()),
        ))
    }

    #[test]
    fn test_part_name_roundtrip_through_display() {
        let name = PartName::new(201403, 10, 20, 2);
        assert_eq!(name.to_string(), "201403_10_20_2");
        assert_eq!("201403_10_20_2".parse::<PartName>().unwrap(), name);
    }

    #[test]
    fn test_part_name_rejects_garbage() {
        assert!("tmp_merge_0_1_2_1".parse::<PartName>().is_err());
        assert!("0_5_5_0".parse::<PartName>().is_err());
        assert!("0_a_5_0".parse::<PartName>().is_err());
        assert!("0_1_5".parse::<PartName>().is_err());
    }

    #[test]
    fn test_part_name_ordering_is_partition_then_range() {
        let mut names = vec![
            PartName::new(2, 0, 1, 0),
            PartName::new(1, 5, 6, 0),
            PartName::new(1, 0, 5, 1),
        ];
        names.sort();
        assert_eq!(names[0], PartName::new(1, 0, 5, 1));
        assert_eq!(names[1], PartName::new(1, 5, 6, 0));
        assert_eq!(names[2], PartName::new(2, 0, 1, 0));
    }

    #[test]
    fn test_for_merge_spans_group_and_bumps_level() {
        let parts = vec![part(0, 0, 10, 0), part(0, 10, 20, 3), part(0, 20, 25, 1)];
        let name = PartName::for_merge(&parts).unwrap();
        assert_eq!(name, PartName::new(0, 0, 25, 4));
    }

    #[test]
    fn test_for_merge_rejects_single_part() {
        let parts = vec![part(0, 0, 10, 0)];
        assert!(matches!(
            PartName::for_merge(&parts),
            Err(MergeError::Logical(_))
        ));
    }

    #[test]
    fn test_block_range_relations() {
        let a = BlockRange::new(0, 10);
        let b = BlockRange::new(10, 20);
        let c = BlockRange::new(5, 15);
        assert!(a.is_followed_by(&b));
        assert!(!b.is_followed_by(&a));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(BlockRange::new(0, 20).contains(&c));
    }

    #[test]
    fn test_part_state_transitions() {
        let p = part(0, 0, 1, 0);
        assert_eq!(p.state(), PartState::Active);
        p.set_state(PartState::Outdated);
        assert_eq!(p.state(), PartState::Outdated);
        assert_eq!(PartState::from_u8(9), None);
    }

    #[test]
    fn test_age_saturates_for_future_parts() {
        let now = SystemTime::now();
        let p = Part::new(
            PartName::new(0, 0, 1, 0),
            PartMeta::in_memory(1, 1, now + Duration::from_secs(60)),
        );
        assert_eq!(p.age(now), Duration::ZERO);
    }

    #[test]
    fn test_duration_to_ms_saturates() {
        assert_eq!(duration_to_ms(Duration::from_micros(2_500)), 2);
        assert_eq!(duration_to_ms(Duration::from_millis(u64::MAX)), u64::MAX);
        assert_eq!(duration_to_ms(Duration::MAX), u64::MAX);
    }
}
