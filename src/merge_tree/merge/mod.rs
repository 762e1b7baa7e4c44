//! Merge scheduling pieces: selection, tagging, execution.

pub mod executor;
pub mod selector;
pub mod strategy;
pub mod tagger;
pub mod types;

pub use executor::{merge_sorted, MergeExecutor, MergedPart, PartsMerger};
pub use selector::{MergePolicy, MergeSelector, SizeRatioPolicy};
pub use strategy::{strategy_for, CollapsingMerge, OrdinaryMerge, RowMergeStrategy, SummingMerge};
pub use tagger::{CurrentlyMerging, MergeTagger, TaggingGuard};
pub use types::{MergeGroup, MergeOutcome};
