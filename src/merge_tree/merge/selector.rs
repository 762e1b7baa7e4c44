//! Merge selection.
//!
//! Pure decision logic: given the active parts of a table and the names
//! already claimed by in-flight merges, pick the next group to merge.
//!
//! Two modes:
//! - **background**: among all contiguous runs of untagged parts that the
//!   `MergePolicy` admits, the cheapest one (earliest on ties)
//! - **aggressive** (`optimize()`): the longest contiguous run of untagged
//!   parts, ignoring every numeric limit
//!
//! Complexity: O(N * max_parts_to_merge_at_once) admission checks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::merge_tree::merge::types::MergeGroup;
use crate::merge_tree::types::{Part, PartName};
use crate::settings::MergeTreeSettings;

// ── Policy ──────────────────────────────────────────────────────────

/// Numeric rules of background merge selection.
pub trait MergePolicy: Send + Sync {
    /// Whether `run` (contiguous, untagged, >= 2 parts) may be merged at `now`.
    fn admits(&self, run: &[Arc<Part>], now: SystemTime) -> bool;

    /// Lower is better.
    fn cost(&self, run: &[Arc<Part>]) -> u64;

    /// Longest run worth considering.
    fn max_parts(&self) -> usize;
}

/// Default policy: neighbours within a size ratio, old enough, bounded
/// total size and part count. Cost is total bytes.
#[derive(Debug, Clone)]
pub struct SizeRatioPolicy {
    pub size_ratio_threshold: f64,
    pub max_total_size: u64,
    pub min_age: Duration,
    pub max_parts: usize,
}

impl SizeRatioPolicy {
    pub fn from_settings(settings: &MergeTreeSettings) -> Self {
        Self {
            size_ratio_threshold: settings.merge_size_ratio_threshold,
            max_total_size: settings.merge_max_total_size,
            min_age: settings.min_age_before_merge,
            max_parts: settings.max_parts_to_merge_at_once,
        }
    }

    fn ratio_ok(&self, a: &Part, b: &Part) -> bool {
        let (small, big) = if a.bytes() <= b.bytes() {
            (a.bytes(), b.bytes())
        } else {
            (b.bytes(), a.bytes())
        };
        big as f64 <= small.max(1) as f64 * self.size_ratio_threshold
    }
}

impl MergePolicy for SizeRatioPolicy {
    fn admits(&self, run: &[Arc<Part>], now: SystemTime) -> bool {
        if run.len() < 2 || run.len() > self.max_parts {
            return false;
        }
        if run.iter().any(|p| p.age(now) < self.min_age) {
            return false;
        }
        let total: u64 = run.iter().map(|p| p.bytes()).sum();
        if total > self.max_total_size {
            return false;
        }
        run.windows(2).all(|w| self.ratio_ok(&w[0], &w[1]))
    }

    fn cost(&self, run: &[Arc<Part>]) -> u64 {
        run.iter().map(|p| p.bytes()).sum()
    }

    fn max_parts(&self) -> usize {
        self.max_parts
    }
}

// ── Selector ────────────────────────────────────────────────────────

pub struct MergeSelector {
    policy: Box<dyn MergePolicy>,
    partitioned: bool,
}

impl MergeSelector {
    /// Selector with the default `SizeRatioPolicy`.
    pub fn new(settings: &MergeTreeSettings) -> Self {
        Self::with_policy(
            Box::new(SizeRatioPolicy::from_settings(settings)),
            settings.partitioned,
        )
    }

    pub fn with_policy(policy: Box<dyn MergePolicy>, partitioned: bool) -> Self {
        Self {
            policy,
            partitioned,
        }
    }

    /// `right` directly follows `left`, neither is tagged, and both live in
    /// the same partition when the table is partitioned.
    pub fn can_merge(&self, left: &Part, right: &Part, tagged: &HashSet<PartName>) -> bool {
        if !left.range().is_followed_by(&right.range()) {
            return false;
        }
        if tagged.contains(left.name()) || tagged.contains(right.name()) {
            return false;
        }
        !self.partitioned || left.partition() == right.partition()
    }

    pub fn select(
        &self,
        parts: &[Arc<Part>],
        tagged: &HashSet<PartName>,
        aggressive: bool,
    ) -> Option<MergeGroup> {
        self.select_at(parts, tagged, aggressive, SystemTime::now())
    }

    /// `select()` with an explicit clock, for deterministic ages.
    pub fn select_at(
        &self,
        parts: &[Arc<Part>],
        tagged: &HashSet<PartName>,
        aggressive: bool,
        now: SystemTime,
    ) -> Option<MergeGroup> {
        let runs = self.mergeable_runs(parts, tagged);
        let chosen = if aggressive {
            longest_run(&runs)
        } else {
            self.cheapest_admitted(&runs, now)
        }?;
        MergeGroup::new(chosen.to_vec()).ok()
    }

    /// Maximal runs of untagged parts where every neighbour pair can merge.
    fn mergeable_runs<'a>(
        &self,
        parts: &'a [Arc<Part>],
        tagged: &HashSet<PartName>,
    ) -> Vec<&'a [Arc<Part>]> {
        let mut runs = Vec::new();
        let mut start: Option<usize> = None;

        for i in 0..parts.len() {
            if tagged.contains(parts[i].name()) {
                if let Some(s) = start.take() {
                    runs.push(&parts[s..i]);
                }
                continue;
            }
            match start {
                None => start = Some(i),
                Some(s) => {
                    if !self.can_merge(&parts[i - 1], &parts[i], tagged) {
                        runs.push(&parts[s..i]);
                        start = Some(i);
                    }
                }
            }
        }
        if let Some(s) = start {
            runs.push(&parts[s..]);
        }

        runs.retain(|run| run.len() >= 2);
        runs
    }

    fn cheapest_admitted<'a>(
        &self,
        runs: &[&'a [Arc<Part>]],
        now: SystemTime,
    ) -> Option<&'a [Arc<Part>]> {
        let max_parts = self.policy.max_parts().max(2);
        let mut best: Option<(u64, &'a [Arc<Part>])> = None;

        for &run in runs {
            for i in 0..run.len() - 1 {
                let longest = (run.len() - i).min(max_parts);
                for len in 2..=longest {
                    let candidate = &run[i..i + len];
                    if !self.policy.admits(candidate, now) {
                        continue;
                    }
                    let cost = self.policy.cost(candidate);
                    // Strict `<` keeps the earliest candidate on ties.
                    if best.map_or(true, |(c, _)| cost < c) {
                        best = Some((cost, candidate));
                    }
                }
            }
        }
        best.map(|(_, run)| run)
    }
}

fn longest_run<'a>(runs: &[&'a [Arc<Part>]]) -> Option<&'a [Arc<Part>]> {
    let mut best: Option<&'a [Arc<Part>]> = None;
    for &run in runs {
        if best.map_or(true, |b| run.len() > b.len()) {
            best = Some(run);
        }
    }
    best
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_tree::types::PartMeta;

    const HOUR: Duration = Duration::from_secs(3600);

    fn part_at(partition: u32, start: u64, end: u64, bytes: u64, created: SystemTime) -> Arc<Part> {
        Arc::new(Part::new(
            PartName::new(partition, start, end, 0),
            PartMeta::in_memory(bytes, bytes, created),
        ))
    }

    fn old_part(start: u64, end: u64, bytes: u64) -> Arc<Part> {
        part_at(0, start, end, bytes, SystemTime::now() - HOUR)
    }

    fn selector() -> MergeSelector {
        MergeSelector::new(&MergeTreeSettings::default())
    }

    fn names(group: &MergeGroup) -> Vec<String> {
        group.names().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_can_merge_rules() {
        let s = selector();
        let none = HashSet::new();
        let a = old_part(0, 10, 100);
        let b = old_part(10, 20, 100);
        let gap = old_part(21, 30, 100);
        let overlap = old_part(5, 15, 100);
        let other_partition = part_at(1, 10, 20, 100, SystemTime::now());

        assert!(s.can_merge(&a, &b, &none));
        assert!(!s.can_merge(&b, &a, &none));
        assert!(!s.can_merge(&b, &gap, &none));
        assert!(!s.can_merge(&a, &overlap, &none));
        assert!(!s.can_merge(&a, &other_partition, &none));

        let tagged: HashSet<PartName> = [b.name().clone()].into_iter().collect();
        assert!(!s.can_merge(&a, &b, &tagged));

        let unpartitioned = MergeSelector::new(&MergeTreeSettings {
            partitioned: false,
            ..Default::default()
        });
        assert!(unpartitioned.can_merge(&a, &other_partition, &none));
    }

    #[test]
    fn test_picks_cheapest_adjacent_pair() {
        let parts = vec![old_part(0, 10, 100), old_part(10, 20, 60), old_part(20, 25, 30)];
        let group = selector().select(&parts, &HashSet::new(), false).unwrap();
        assert_eq!(names(&group), vec!["0_10_20_0", "0_20_25_0"]);
    }

    #[test]
    fn test_ratio_threshold_blocks_lopsided_pairs() {
        let parts = vec![old_part(0, 1, 1000), old_part(1, 2, 100)];
        assert!(selector().select(&parts, &HashSet::new(), false).is_none());
        // Exactly at the threshold is allowed
        let parts = vec![old_part(0, 1, 300), old_part(1, 2, 100)];
        assert!(selector().select(&parts, &HashSet::new(), false).is_some());
    }

    #[test]
    fn test_young_parts_are_skipped() {
        let now = SystemTime::now();
        let parts = vec![
            part_at(0, 0, 1, 100, now),
            part_at(0, 1, 2, 100, now),
            part_at(0, 2, 3, 500, now - HOUR),
            part_at(0, 3, 4, 500, now - HOUR),
        ];
        let group = selector().select_at(&parts, &HashSet::new(), false, now).unwrap();
        assert_eq!(names(&group), vec!["0_2_3_0", "0_3_4_0"]);
    }

    #[test]
    fn test_total_size_cap() {
        let s = MergeSelector::new(&MergeTreeSettings {
            merge_max_total_size: 150,
            ..Default::default()
        });
        let parts = vec![old_part(0, 1, 100), old_part(1, 2, 100)];
        assert!(s.select(&parts, &HashSet::new(), false).is_none());
    }

    #[test]
    fn test_single_part_or_all_tagged_yields_nothing() {
        let s = selector();
        let single = vec![old_part(0, 1, 100)];
        assert!(s.select(&single, &HashSet::new(), true).is_none());

        let parts = vec![old_part(0, 1, 100), old_part(1, 2, 100)];
        let tagged: HashSet<PartName> = parts.iter().map(|p| p.name().clone()).collect();
        assert!(s.select(&parts, &tagged, false).is_none());
        assert!(s.select(&parts, &tagged, true).is_none());
    }

    #[test]
    fn test_aggressive_takes_longest_run_and_ignores_limits() {
        let now = SystemTime::now();
        let parts = vec![
            part_at(0, 0, 1, 1, now),
            part_at(0, 1, 2, 1_000_000, now),
            part_at(0, 2, 3, 5, now),
            part_at(0, 3, 4, 5, now),
            part_at(0, 4, 5, 5, now),
        ];
        let tagged: HashSet<PartName> = [parts[2].name().clone()].into_iter().collect();
        let group = selector().select_at(&parts, &tagged, true, now).unwrap();
        // [0,2) and [3,5) are both length 2; the earlier one wins
        assert_eq!(names(&group), vec!["0_0_1_0", "0_1_2_0"]);

        let group = selector().select_at(&parts, &HashSet::new(), true, now).unwrap();
        assert_eq!(group.len(), 5);
    }

    #[test]
    fn test_aggressive_never_crosses_partitions() {
        let now = SystemTime::now();
        let parts = vec![
            part_at(1, 0, 1, 10, now),
            part_at(1, 1, 2, 10, now),
            part_at(2, 2, 3, 10, now),
            part_at(2, 3, 4, 10, now),
            part_at(2, 4, 5, 10, now),
        ];
        let group = selector().select_at(&parts, &HashSet::new(), true, now).unwrap();
        assert!(group.parts().iter().all(|p| p.partition() == 2));
        assert_eq!(group.len(), 3);
    }

    #[test]
    fn test_max_parts_limits_background_runs() {
        let s = MergeSelector::new(&MergeTreeSettings {
            max_parts_to_merge_at_once: 2,
            ..Default::default()
        });
        let parts: Vec<_> = (0..6).map(|i| old_part(i, i + 1, 100)).collect();
        let group = s.select(&parts, &HashSet::new(), false).unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.parts()[0].range().start, 0);
    }

    struct PreferLong;

    impl MergePolicy for PreferLong {
        fn admits(&self, run: &[Arc<Part>], _now: SystemTime) -> bool {
            run.len() >= 3
        }
        fn cost(&self, run: &[Arc<Part>]) -> u64 {
            u64::MAX - run.len() as u64
        }
        fn max_parts(&self) -> usize {
            4
        }
    }

    #[test]
    fn test_custom_policy() {
        let s = MergeSelector::with_policy(Box::new(PreferLong), true);
        let parts: Vec<_> = (0..6).map(|i| old_part(i, i + 1, 100)).collect();
        let group = s.select(&parts, &HashSet::new(), false).unwrap();
        assert_eq!(group.len(), 4);
    }
}
