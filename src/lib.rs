//! mergetree - background merge scheduler for an LSM-style table engine
//!
//! Tables are append-only sequences of immutable, key-sorted parts. Every
//! insert adds a part; a shared pool of background workers keeps the part
//! count down by merging adjacent parts, without ever letting two merges
//! claim the same part or promising disk space that isn't there.
//!
//! Main entry points:
//! - [`merge_tree::TableMergeController`] - one per table
//! - [`background_pool::BackgroundPool`] - shared by all tables
//! - [`disk_space::DiskSpaceMonitor`] - shared by all tables

pub mod background_pool;
pub mod disk_space;
pub mod error;
pub mod merge_tree;
pub mod metrics;
pub mod resource;
pub mod settings;

pub use background_pool::{BackgroundPool, TaskHandle};
pub use disk_space::{DiskSpaceMonitor, Reservation};
pub use error::{MergeError, Result};
pub use merge_tree::merge::{MergeGroup, MergeOutcome, MergeSelector};
pub use merge_tree::{Part, PartName, PartSet, PartState, Row, TableMergeController};
pub use settings::{EngineConfig, MergeMode, MergeTreeSettings, PoolConfig};
