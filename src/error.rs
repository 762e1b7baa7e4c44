//! Error types for the merge scheduler

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MergeError>;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(
        "Not enough free space on {path:?}: requested {requested} bytes, {available} available"
    )]
    InsufficientSpace {
        path: PathBuf,
        requested: u64,
        available: u64,
    },

    /// Broken internal invariant. Always a scheduling bug, never a user error.
    #[error("Logical error: {0}. This is a bug.")]
    Logical(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid part name: {0}")]
    InvalidPartName(String),

    #[error("Part {part} is corrupted: {reason}")]
    CorruptedPart { part: String, reason: String },

    #[error("Table '{0}' is shut down")]
    TableShutdown(String),

    #[error("Disk probe failed: {0}")]
    DiskProbe(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Merge error: {0}")]
    Merge(String),
}

impl MergeError {
    /// Stable error code for logs and the CLI
    pub fn code(&self) -> &'static str {
        match self {
            MergeError::InsufficientSpace { .. } => "INSUFFICIENT_SPACE",
            MergeError::Logical(_) => "LOGICAL_ERROR",
            MergeError::InvalidPartName(_) => "INVALID_PART_NAME",
            MergeError::CorruptedPart { .. } => "CORRUPTED_PART",
            MergeError::TableShutdown(_) => "TABLE_SHUTDOWN",
            MergeError::Config(_) => "BAD_CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether the next scheduling cycle may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MergeError::InsufficientSpace { .. } | MergeError::Io(_) | MergeError::DiskProbe(_)
        )
    }
}
