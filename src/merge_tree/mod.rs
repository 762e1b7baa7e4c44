//! MergeTree table storage: parts on disk, the part set and the merge
//! scheduler that keeps part count down.

pub mod controller;
pub mod merge;
pub mod part_set;
pub mod reader;
pub mod types;
pub mod writer;

pub use controller::{TableMergeController, TableState};
pub use part_set::PartSet;
pub use types::{BlockRange, Part, PartMeta, PartName, PartState, PartsVector, Row};
pub use writer::PartWriter;
