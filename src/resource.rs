//! Host probing for pool sizing.
//!
//! `HostProfile::probe()` asks sysinfo for memory figures and std for the
//! CPU count. Nothing is cached; every probe hits the OS again.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::settings::PoolConfig;

/// Above this share of used memory the pool is cut to one worker.
pub const HIGH_MEMORY_PRESSURE: f64 = 0.9;

/// CPU and memory figures of the machine the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostProfile {
    pub cpus: usize,
    pub memory_total: u64,
    pub memory_available: u64,
}

impl HostProfile {
    pub fn probe() -> Self {
        let refresh = RefreshKind::new().with_memory(MemoryRefreshKind::everything());
        let mut sys = System::new_with_specifics(refresh);
        sys.refresh_memory();

        Self {
            cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
            memory_total: sys.total_memory(),
            memory_available: sys.available_memory(),
        }
    }

    /// Share of memory in use, 0.0..=1.0. Unknown totals count as full.
    pub fn memory_in_use(&self) -> f64 {
        match self.memory_total {
            0 => 1.0,
            total => (1.0 - self.memory_available as f64 / total as f64).clamp(0.0, 1.0),
        }
    }

    pub fn under_memory_pressure(&self) -> bool {
        self.memory_in_use() > HIGH_MEMORY_PRESSURE
    }

    /// Pool config sized for this host.
    pub fn pool_config(&self) -> PoolConfig {
        let config = PoolConfig::auto_tune(self);
        tracing::debug!(
            cpus = self.cpus,
            memory_in_use = self.memory_in_use(),
            workers = config.background_pool_size,
            "sized background pool for host"
        );
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(cpus: usize, total: u64, available: u64) -> HostProfile {
        HostProfile {
            cpus,
            memory_total: total,
            memory_available: available,
        }
    }

    #[test]
    fn test_host_has_at_least_one_cpu() {
        assert!(HostProfile::probe().cpus >= 1);
    }

    #[test]
    fn test_memory_in_use() {
        assert!((host(2, 1000, 250).memory_in_use() - 0.75).abs() < 1e-9);
        assert_eq!(host(1, 0, 0).memory_in_use(), 1.0);
        assert!(host(1, 100, 5).under_memory_pressure());
        assert!(!host(1, 100, 50).under_memory_pressure());
    }

    #[test]
    fn test_host_pool_config_is_valid() {
        HostProfile::probe().pool_config().validate().unwrap();
    }
}
