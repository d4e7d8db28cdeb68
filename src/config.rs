//! Buffer Pool Configuration
//!
//! All tunables of the pool in one serde-loadable tree. Defaults mirror the
//! constants a production page cache runs with; tests shrink them.
//!
//! ```yaml
//! page_size: 16384
//! capacity: 8192
//! fatal_policy: abort
//! lru:
//!   old_min_len: 80
//!   old_tolerance: 20
//! read_ahead:
//!   area: 64
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, FatalPolicy, Result};

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Default number of page slots
pub const DEFAULT_CAPACITY: usize = 8 * 1024;

// =============================================================================
// Pool Configuration
// =============================================================================

/// Top-level buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size of a page slot in bytes (power of two)
    pub page_size: usize,
    /// Number of page slots
    pub capacity: usize,
    /// Number of shards in the page directory
    pub directory_shards: usize,
    /// Number of background I/O worker threads
    pub io_threads: usize,
    /// What happens after a fatal condition is logged
    pub fatal_policy: FatalPolicy,
    /// LRU list tuning
    pub lru: LruConfig,
    /// Free slot search and flush tuning
    pub eviction: EvictionConfig,
    /// Buddy allocator tuning
    pub buddy: BuddyConfig,
    /// Read-ahead tuning
    pub read_ahead: ReadAheadConfig,
    /// Wait array tuning
    pub sync: SyncConfig,
    /// Logging output
    pub logging: LogConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            capacity: DEFAULT_CAPACITY,
            directory_shards: 64,
            io_threads: 4,
            fatal_policy: FatalPolicy::Abort,
            lru: LruConfig::default(),
            eviction: EvictionConfig::default(),
            buddy: BuddyConfig::default(),
            read_ahead: ReadAheadConfig::default(),
            sync: SyncConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Small pool for unit and integration tests: 4 KiB pages, errors are
    /// returned instead of aborting, no background I/O threads needed.
    pub fn for_testing(capacity: usize) -> Self {
        Self {
            page_size: 4096,
            capacity,
            directory_shards: 8,
            io_threads: 1,
            fatal_policy: FatalPolicy::Propagate,
            eviction: EvictionConfig {
                backoff_base_ms: 1,
                backoff_max_ms: 5,
                tablespace_retry_ms: 2,
                ..EvictionConfig::default()
            },
            buddy: BuddyConfig {
                min_size: 512,
                ..BuddyConfig::default()
            },
            sync: SyncConfig {
                wait_cells: 64,
                deadlock_detection: true,
                ..SyncConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse from a YAML document
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON document
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            other => Err(Error::Config(format!(
                "unsupported configuration file extension: {:?}",
                other
            ))),
        }
    }

    /// Number of buddy size classes below a whole slot
    pub fn buddy_classes(&self) -> usize {
        (self.page_size / self.buddy.min_size).trailing_zeros() as usize
    }

    /// Random read-ahead threshold, derived from the area when unset
    pub fn random_threshold(&self) -> usize {
        self.read_ahead
            .random_threshold
            .unwrap_or(5 + self.read_ahead.area as usize / 8)
    }

    /// Linear read-ahead threshold, derived from the area when unset
    pub fn linear_threshold(&self) -> usize {
        self.read_ahead
            .linear_threshold
            .unwrap_or(self.read_ahead.area as usize * 7 / 8)
    }

    /// Check that the values are mutually consistent
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 1024 {
            return Err(Error::Config(format!(
                "page_size must be a power of two >= 1024, got {}",
                self.page_size
            )));
        }
        if self.capacity == 0 {
            return Err(Error::Config("capacity must be positive".into()));
        }
        if !self.directory_shards.is_power_of_two() {
            return Err(Error::Config(format!(
                "directory_shards must be a power of two, got {}",
                self.directory_shards
            )));
        }
        if self.io_threads == 0 {
            return Err(Error::Config("io_threads must be positive".into()));
        }

        let lru = &self.lru;
        if lru.old_min_len < 8 {
            return Err(Error::Config(format!(
                "lru.old_min_len must be at least 8, got {}",
                lru.old_min_len
            )));
        }
        if lru.old_tolerance == 0 || lru.old_tolerance > 3 * (lru.old_min_len / 8) {
            return Err(Error::Config(format!(
                "lru.old_tolerance must be in 1..={}, got {}",
                3 * (lru.old_min_len / 8),
                lru.old_tolerance
            )));
        }

        let buddy = &self.buddy;
        if !buddy.min_size.is_power_of_two() || buddy.min_size >= self.page_size {
            return Err(Error::Config(format!(
                "buddy.min_size must be a power of two below page_size, got {}",
                buddy.min_size
            )));
        }
        if buddy.min_size < crate::page::header::LEN {
            return Err(Error::Config(format!(
                "buddy.min_size must hold a page header ({} bytes), got {}",
                crate::page::header::LEN,
                buddy.min_size
            )));
        }

        let ra = &self.read_ahead;
        if ra.area == 0 {
            return Err(Error::Config("read_ahead.area must be positive".into()));
        }
        if self.linear_threshold() > ra.area as usize {
            return Err(Error::Config(format!(
                "read_ahead.linear_threshold {} exceeds area {}",
                self.linear_threshold(),
                ra.area
            )));
        }
        if ra.pending_limit_divisor == 0 || ra.recent_divisor == 0 {
            return Err(Error::Config(
                "read_ahead divisors must be positive".into(),
            ));
        }

        let ev = &self.eviction;
        if ev.exhaustion_divisor == 0 || ev.warning_divisor == 0 || ev.scan_divisor == 0 {
            return Err(Error::Config("eviction divisors must be positive".into()));
        }

        if self.sync.wait_cells == 0 {
            return Err(Error::Config("sync.wait_cells must be positive".into()));
        }
        if self.sync.long_wait_fatal_secs < self.sync.long_wait_warning_secs {
            return Err(Error::Config(
                "sync.long_wait_fatal_secs must not be below long_wait_warning_secs".into(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// LRU
// =============================================================================

/// Young/old LRU split
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LruConfig {
    /// List length from which the old segment is maintained
    pub old_min_len: usize,
    /// Allowed deviation of the old segment length from 3/8 of the list
    pub old_tolerance: usize,
    /// A re-access this long after the first access promotes an old page
    pub old_block_time_ms: u64,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            old_min_len: 80,
            old_tolerance: 20,
            old_block_time_ms: 1000,
        }
    }
}

// =============================================================================
// Eviction
// =============================================================================

/// Free slot search, exhaustion guard and flush batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Fixed part of the tail scan distance
    pub scan_base: usize,
    /// The scan distance grows by `capacity / scan_divisor` per attempt
    pub scan_divisor: usize,
    /// Attempts after which the scan covers the whole list
    pub bounded_scan_attempts: u32,
    /// Attempts after which a diagnostic warning is logged once
    pub diagnostics_after: u32,
    /// Fatal when free + LRU slots drop below `capacity / exhaustion_divisor`
    pub exhaustion_divisor: usize,
    /// Warn when free + LRU slots drop below `capacity / warning_divisor`
    pub warning_divisor: usize,
    /// First backoff sleep between attempts
    pub backoff_base_ms: u64,
    /// Upper bound of the backoff sleep
    pub backoff_max_ms: u64,
    /// Pages requested from the flusher per failed attempt
    pub flush_batch: usize,
    /// Pause before rescanning while dropping a tablespace
    pub tablespace_retry_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            scan_base: 100,
            scan_divisor: 10,
            bounded_scan_attempts: 10,
            diagnostics_after: 30,
            exhaustion_divisor: 10,
            warning_divisor: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
            flush_batch: 100,
            tablespace_retry_ms: 20,
        }
    }
}

impl EvictionConfig {
    /// Sleep after the given failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .backoff_base_ms
            .saturating_mul(attempt as u64)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    pub fn tablespace_retry(&self) -> Duration {
        Duration::from_millis(self.tablespace_retry_ms)
    }
}

// =============================================================================
// Buddy
// =============================================================================

/// Buddy allocator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuddyConfig {
    /// Smallest block size (power of two)
    pub min_size: usize,
    /// Stop coalescing while a free list holds this many blocks
    pub coalesce_skip_threshold: usize,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        Self {
            min_size: 1024,
            coalesce_skip_threshold: 16,
        }
    }
}

// =============================================================================
// Read-Ahead
// =============================================================================

/// Random and linear read-ahead
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadAheadConfig {
    /// Enable the random trigger
    pub random_enabled: bool,
    /// Enable the linear trigger
    pub linear_enabled: bool,
    /// Pages per read-ahead area
    pub area: u32,
    /// Recently accessed pages needed for the random trigger (default `5 + area / 8`)
    pub random_threshold: Option<usize>,
    /// In-order accessed pages needed for the linear trigger (default `area * 7 / 8`)
    pub linear_threshold: Option<usize>,
    /// Refuse when pending reads exceed `capacity / pending_limit_divisor`
    pub pending_limit_divisor: usize,
    /// Recent cutoff is `len / recent_divisor` positions below the head
    pub recent_divisor: usize,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            random_enabled: true,
            linear_enabled: true,
            area: 64,
            random_threshold: None,
            linear_threshold: None,
            pending_limit_divisor: 2,
            recent_divisor: 8,
        }
    }
}

// =============================================================================
// Sync
// =============================================================================

/// Wait array tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of wait cells
    pub wait_cells: usize,
    /// Spin rounds before a mutex falls back to the wait array
    pub spin_rounds: u32,
    /// Walk the wait-for graph before blocking
    pub deadlock_detection: bool,
    /// Waits longer than this are logged by the sweep
    pub long_wait_warning_secs: u64,
    /// Waits longer than this are fatal
    pub long_wait_fatal_secs: u64,
    /// Interval of the watchdog sweep
    pub sweep_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_cells: 1024,
            spin_rounds: 30,
            deadlock_detection: cfg!(debug_assertions),
            long_wait_warning_secs: 240,
            long_wait_fatal_secs: 600,
            sweep_interval_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn long_wait_warning(&self) -> Duration {
        Duration::from_secs(self.long_wait_warning_secs)
    }

    pub fn long_wait_fatal(&self) -> Duration {
        Duration::from_secs(self.long_wait_fatal_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level: trace, debug, info, warn, error
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PoolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.random_threshold(), 13);
        assert_eq!(config.linear_threshold(), 56);
        assert_eq!(config.buddy_classes(), 4);
    }

    #[test]
    fn test_rejects_linear_threshold_above_area() {
        let mut config = PoolConfig::for_testing(32);
        config.read_ahead.area = 16;
        config.read_ahead.linear_threshold = Some(17);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.read_ahead.linear_threshold = Some(16);
        config.validate().unwrap();
    }

    #[test]
    fn test_testing_config_is_valid() {
        let config = PoolConfig::for_testing(32);
        config.validate().unwrap();
        assert_eq!(config.buddy_classes(), 3);
        assert_eq!(config.fatal_policy, FatalPolicy::Propagate);
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
page_size: 8192
capacity: 256
fatal_policy: propagate
lru:
  old_tolerance: 10
read_ahead:
  area: 32
"#;
        let config = PoolConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.lru.old_tolerance, 10);
        assert_eq!(config.lru.old_min_len, 80);
        assert_eq!(config.random_threshold(), 9);
        assert_eq!(config.linear_threshold(), 28);
        config.validate().unwrap();
        assert_eq!(config.fatal_policy, FatalPolicy::Propagate);
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"capacity": 100, "buddy": {"coalesce_skip_threshold": 4}}"#;
        let config = PoolConfig::from_json_str(json).unwrap();
        assert_eq!(config.capacity, 100);
        assert_eq!(config.buddy.coalesce_skip_threshold, 4);
        assert_eq!(config.buddy.min_size, 1024);
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let config = PoolConfig {
            page_size: 10_000,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_bad_tolerance() {
        let mut config = PoolConfig::default();
        config.lru.old_tolerance = 0;
        assert!(config.validate().is_err());
        config.lru.old_tolerance = 31;
        assert!(config.validate().is_err());
        config.lru.old_tolerance = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_long_wait_thresholds() {
        let mut config = PoolConfig::default();
        config.sync.long_wait_fatal_secs = 10;
        config.sync.long_wait_warning_secs = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let ev = EvictionConfig::default();
        assert_eq!(ev.backoff(1), Duration::from_millis(10));
        assert_eq!(ev.backoff(7), Duration::from_millis(70));
        assert_eq!(ev.backoff(1000), Duration::from_millis(500));
    }

    #[test]
    fn test_from_file_json() {
        let path = std::env::temp_dir().join(format!("bufpool-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"capacity": 64}"#).unwrap();
        let config = PoolConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.capacity, 64);
    }
}
