//! Property tests for merge selection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use proptest::prelude::*;

use mergetree::merge_tree::merge::MergeSelector;
use mergetree::merge_tree::{Part, PartMeta, PartName};
use mergetree::settings::MergeTreeSettings;

/// Contiguous parts; `partition_breaks[i]` starts a new partition at part i.
fn build_parts(sizes: &[u64], partition_breaks: &[bool]) -> Vec<Arc<Part>> {
    let created = SystemTime::now() - Duration::from_secs(3600);
    let mut partition = 0u32;
    let mut block = 0u64;
    sizes
        .iter()
        .enumerate()
        .map(|(i, &bytes)| {
            if i > 0 && partition_breaks[i] {
                partition += 1;
            }
            let part = Arc::new(Part::new(
                PartName::new(partition, block, block + 1, 0),
                PartMeta::in_memory(bytes, bytes, created),
            ));
            block += 1;
            part
        })
        .collect()
}

fn scenario() -> impl Strategy<Value = (Vec<u64>, Vec<bool>, Vec<bool>)> {
    (1usize..40).prop_flat_map(|n| {
        (
            prop::collection::vec(1u64..10_000, n),
            prop::collection::vec(prop::bool::weighted(0.1), n),
            prop::collection::vec(prop::bool::weighted(0.2), n),
        )
    })
}

proptest! {
    #[test]
    fn selected_group_is_contiguous_untagged_and_in_one_partition(
        (sizes, breaks, tag_mask) in scenario(),
        aggressive in any::<bool>(),
    ) {
        let parts = build_parts(&sizes, &breaks);
        let tagged: HashSet<PartName> = parts
            .iter()
            .zip(&tag_mask)
            .filter(|(_, &t)| t)
            .map(|(p, _)| p.name().clone())
            .collect();
        let selector = MergeSelector::new(&MergeTreeSettings::default());

        if let Some(group) = selector.select(&parts, &tagged, aggressive) {
            prop_assert!(group.len() >= 2);
            for pair in group.parts().windows(2) {
                prop_assert_eq!(pair[0].range().end, pair[1].range().start);
                prop_assert_eq!(pair[0].partition(), pair[1].partition());
            }
            for name in group.names() {
                prop_assert!(!tagged.contains(name));
            }
        }
    }

    #[test]
    fn background_selection_respects_limits(
        (sizes, breaks, tag_mask) in scenario(),
    ) {
        let settings = MergeTreeSettings {
            max_parts_to_merge_at_once: 4,
            merge_max_total_size: 20_000,
            ..Default::default()
        };
        let parts = build_parts(&sizes, &breaks);
        let tagged: HashSet<PartName> = parts
            .iter()
            .zip(&tag_mask)
            .filter(|(_, &t)| t)
            .map(|(p, _)| p.name().clone())
            .collect();

        if let Some(group) = MergeSelector::new(&settings).select(&parts, &tagged, false) {
            prop_assert!(group.len() <= 4);
            prop_assert!(group.total_bytes() <= 20_000);
            for pair in group.parts().windows(2) {
                let (a, b) = (pair[0].bytes() as f64, pair[1].bytes() as f64);
                prop_assert!(a.max(b) <= a.min(b) * settings.merge_size_ratio_threshold);
            }
        }
    }

    #[test]
    fn aggressive_selection_takes_a_longest_run(
        (sizes, breaks, tag_mask) in scenario(),
    ) {
        let parts = build_parts(&sizes, &breaks);
        let tagged: HashSet<PartName> = parts
            .iter()
            .zip(&tag_mask)
            .filter(|(_, &t)| t)
            .map(|(p, _)| p.name().clone())
            .collect();

        // Longest run of untagged parts within one partition
        let mut longest = 0usize;
        let mut current = 0usize;
        for (i, part) in parts.iter().enumerate() {
            let same_run = i > 0
                && !tag_mask[i - 1]
                && parts[i - 1].partition() == part.partition();
            if tag_mask[i] {
                current = 0;
            } else if same_run {
                current += 1;
            } else {
                current = 1;
            }
            longest = longest.max(current);
        }

        let selected = MergeSelector::new(&MergeTreeSettings::default())
            .select(&parts, &tagged, true)
            .map_or(0, |g| g.len());
        if longest >= 2 {
            prop_assert_eq!(selected, longest);
        } else {
            prop_assert_eq!(selected, 0);
        }
    }
}
