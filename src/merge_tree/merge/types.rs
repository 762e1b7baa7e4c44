//! Merge group and outcome types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MergeError, Result};
use crate::merge_tree::types::{BlockRange, Part, PartName, PartsVector};

/// Ordered run of at least two adjacent parts chosen for one merge.
#[derive(Debug, Clone)]
pub struct MergeGroup {
    parts: PartsVector,
}

#[allow(clippy::len_without_is_empty)]
impl MergeGroup {
    /// Build a group, checking size and adjacency.
    pub fn new(parts: PartsVector) -> Result<Self> {
        if parts.len() < 2 {
            return Err(MergeError::Logical(format!(
                "merge group needs at least 2 parts, got {}",
                parts.len()
            )));
        }
        for pair in parts.windows(2) {
            if !pair[0].range().is_followed_by(&pair[1].range()) {
                return Err(MergeError::Logical(format!(
                    "parts {} and {} are not adjacent",
                    pair[0].name(),
                    pair[1].name()
                )));
            }
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[Arc<Part>] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &PartName> + '_ {
        self.parts.iter().map(|p| p.name())
    }

    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes()).sum()
    }

    pub fn total_rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows()).sum()
    }

    /// Blocks covered by the whole group.
    pub fn range(&self) -> BlockRange {
        BlockRange::new(
            self.parts[0].range().start,
            self.parts[self.parts.len() - 1].range().end,
        )
    }

    /// Name the merged part will get.
    pub fn output_name(&self) -> Result<PartName> {
        PartName::for_merge(&self.parts)
    }
}

impl fmt::Display for MergeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.names().map(|n| n.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Result of one `merge()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged {
        new_part: PartName,
        inputs: usize,
        bytes: u64,
        rows: u64,
        duration: Duration,
    },
    /// Nothing qualified; the part set is untouched.
    NoCandidate,
}

impl MergeOutcome {
    pub fn did_work(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_tree::types::PartMeta;
    use std::time::SystemTime;

    fn part(start: u64, end: u64, bytes: u64) -> Arc<Part> {
        Arc::new(Part::new(
            PartName::new(0, start, end, 0),
            PartMeta::in_memory(bytes / 10, bytes, SystemTime::now()),
        ))
    }

    #[test]
    fn test_group_requires_adjacency() {
        assert!(MergeGroup::new(vec![part(0, 1, 10)]).is_err());
        assert!(MergeGroup::new(vec![part(0, 1, 10), part(2, 3, 10)]).is_err());

        let group = MergeGroup::new(vec![part(0, 1, 10), part(1, 3, 30)]).unwrap();
        assert_eq!(group.total_bytes(), 40);
        assert_eq!(group.range(), BlockRange::new(0, 3));
        assert_eq!(group.output_name().unwrap(), PartName::new(0, 0, 3, 1));
        assert_eq!(group.to_string(), "[0_0_1_0, 0_1_3_0]");
    }

    #[test]
    fn test_outcome_did_work() {
        assert!(!MergeOutcome::NoCandidate.did_work());
    }
}
