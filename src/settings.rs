//! Table, pool and engine configuration.
//!
//! All structs deserialize from JSON with every field optional
//! (`#[serde(default)]`). Durations are stored as milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::resource::HostProfile;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Largest worker pool the auto-tuner will pick.
const MAX_AUTO_POOL_SIZE: usize = 16;

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(crate::merge_tree::types::duration_to_ms(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ── Merge Mode ─────────────────────────────────────────────────────

/// How rows sharing a key are combined when parts are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    #[default]
    Ordinary,
    Collapsing,
    Summing,
}

// ── MergeTreeSettings ──────────────────────────────────────────────

/// Per-table merge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeTreeSettings {
    /// Rows per primary index mark. Affects output part layout only.
    pub index_granularity: usize,
    /// Max size ratio between neighbours in a non-aggressive merge.
    pub merge_size_ratio_threshold: f64,
    /// Cap on combined size of a non-aggressive merge.
    pub merge_max_total_size: u64,
    /// Parts younger than this are left alone by background merges.
    #[serde(rename = "min_age_before_merge_ms", with = "duration_ms")]
    pub min_age_before_merge: Duration,
    pub max_parts_to_merge_at_once: usize,
    /// Merges never cross partitions when set.
    pub partitioned: bool,
    /// Output size estimate = input size * coefficient.
    pub disk_usage_coefficient_to_reserve: f64,
    /// How long an unreferenced outdated part is kept before deletion.
    #[serde(rename = "old_parts_lifetime_ms", with = "duration_ms")]
    pub old_parts_lifetime: Duration,
    pub merge_mode: MergeMode,
}

impl Default for MergeTreeSettings {
    fn default() -> Self {
        Self {
            index_granularity: 8192,
            merge_size_ratio_threshold: 3.0,
            merge_max_total_size: 100 * GIB,
            min_age_before_merge: Duration::from_secs(300),
            max_parts_to_merge_at_once: 10,
            partitioned: true,
            disk_usage_coefficient_to_reserve: 1.6,
            old_parts_lifetime: Duration::from_secs(480),
            merge_mode: MergeMode::Ordinary,
        }
    }
}

impl MergeTreeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.index_granularity == 0 {
            return Err(MergeError::Config("index_granularity must be > 0".into()));
        }
        if !(self.merge_size_ratio_threshold >= 1.0) {
            return Err(MergeError::Config(format!(
                "merge_size_ratio_threshold must be >= 1.0, got {}",
                self.merge_size_ratio_threshold
            )));
        }
        if self.max_parts_to_merge_at_once < 2 {
            return Err(MergeError::Config(
                "max_parts_to_merge_at_once must be >= 2".into(),
            ));
        }
        if !(self.disk_usage_coefficient_to_reserve > 0.0) {
            return Err(MergeError::Config(
                "disk_usage_coefficient_to_reserve must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Bytes to reserve for merging parts totalling `input_bytes`.
    pub fn reservation_for(&self, input_bytes: u64) -> u64 {
        (input_bytes as f64 * self.disk_usage_coefficient_to_reserve).ceil() as u64
    }
}

// ── PoolConfig ─────────────────────────────────────────────────────

/// Background pool sizing and backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker thread count, shared by every registered table.
    pub background_pool_size: usize,
    /// Delay before re-running a task that just did work.
    #[serde(rename = "sleep_after_work_ms", with = "duration_ms")]
    pub sleep_after_work: Duration,
    /// First idle delay after a task stops finding work.
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Idle delay cap.
    #[serde(rename = "backoff_max_interval_ms", with = "duration_ms")]
    pub backoff_max_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            background_pool_size: 4,
            sleep_after_work: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            backoff_max_interval: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Default config with a worker count derived from the host.
    ///
    /// Half the logical CPUs (at least one, at most 16); a single worker
    /// on hosts under heavy memory pressure.
    pub fn auto_tune(host: &HostProfile) -> Self {
        let size = if host.under_memory_pressure() {
            1
        } else {
            (host.cpus / 2).clamp(1, MAX_AUTO_POOL_SIZE)
        };
        Self {
            background_pool_size: size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.background_pool_size == 0 {
            return Err(MergeError::Config("background_pool_size must be > 0".into()));
        }
        if !(self.backoff_multiplier > 1.0) {
            return Err(MergeError::Config(format!(
                "backoff_multiplier must be > 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_backoff.is_zero() {
            return Err(MergeError::Config("initial_backoff must be > 0".into()));
        }
        if self.backoff_max_interval < self.initial_backoff {
            return Err(MergeError::Config(
                "backoff_max_interval must be >= initial_backoff".into(),
            ));
        }
        Ok(())
    }
}

// ── EngineConfig ───────────────────────────────────────────────────

/// Everything `mergetreectl` needs, persisted as `engine.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub table: MergeTreeSettings,
    /// Free space the disk monitor never hands out.
    pub keep_free_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            table: MergeTreeSettings::default(),
            keep_free_bytes: 30 * MIB,
        }
    }
}

impl EngineConfig {
    pub const FILE_NAME: &'static str = "engine.json";

    /// Read config from a data directory. Returns None if the file doesn't exist.
    pub fn read_from(data_dir: &Path) -> Result<Option<Self>> {
        let path = data_dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write config to a data directory.
    pub fn write_to(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(Self::FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.table.validate()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
