use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a store instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Parent directory of per-table subdirectories.
    pub data_dir: PathBuf,

    /// Maximum number of memtable entries before a flush (default: 1000).
    pub memtable_flush_size: usize,

    /// Maximum memtable size in bytes, summed over `len(key) + len(value)`, before a flush
    /// (default: 1024).
    pub memtable_flush_size_bytes: usize,

    /// Directory for in-progress segment writes (default: OS temp dir).
    pub temp_folder: PathBuf,

    /// Desired false positive rate for segment bloom filters, in (0.0, 1.0) (default: 0.01).
    pub bloom_filter_false_positive_rate: f64,

    /// Minimum number of keys in a segment to build a bloom filter for it (default: 5).
    pub bloom_filter_min_keys: usize,

    /// Block cache configuration.
    pub block_cache: BlockCacheConfig,
}

/// Configuration for the shared data block cache.
#[derive(Debug, Clone)]
pub struct BlockCacheConfig {
    /// Toggles between the no-op and the active cache (default: true).
    pub enabled: bool,

    /// Per-shard capacity in decoded blocks. Non-positive disables the cache (default: 1024).
    pub capacity: i64,

    /// Number of cache shards. Zero or negative disables the cache; one uses a single
    /// unsharded cache (default: 8).
    pub shard_count: i64,

    /// Lifetime of a cached block (default: 5 minutes).
    pub ttl: Duration,

    /// Cadence of the background reaper that drops expired blocks (default: 1 second).
    pub tick_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memtable_flush_size: 1000,
            memtable_flush_size_bytes: 1024,
            temp_folder: env::temp_dir(),
            bloom_filter_false_positive_rate: 0.01,
            bloom_filter_min_keys: 5,
            block_cache: BlockCacheConfig::default(),
        }
    }
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
            shard_count: 8,
            ttl: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl StoreConfig {
    /// Create a new config rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable entry count flush threshold.
    pub fn memtable_flush_size(mut self, size: usize) -> Self {
        self.memtable_flush_size = size;
        self
    }

    /// Set the memtable byte size flush threshold.
    pub fn memtable_flush_size_bytes(mut self, size: usize) -> Self {
        self.memtable_flush_size_bytes = size;
        self
    }

    /// Set the directory used for in-progress segment writes.
    pub fn temp_folder(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_folder = dir.into();
        self
    }

    /// Set the bloom filter false positive rate.
    pub fn bloom_filter_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_filter_false_positive_rate = rate;
        self
    }

    /// Set the minimum segment size for bloom filter inclusion.
    pub fn bloom_filter_min_keys(mut self, keys: usize) -> Self {
        self.bloom_filter_min_keys = keys;
        self
    }

    /// Configure the block cache.
    pub fn block_cache(mut self, config: BlockCacheConfig) -> Self {
        self.block_cache = config;
        self
    }
}

impl BlockCacheConfig {
    /// Returns a config with the cache disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Toggle the cache.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the per-shard capacity.
    pub fn capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the shard count.
    pub fn shard_count(mut self, count: i64) -> Self {
        self.shard_count = count;
        self
    }

    /// Set the cached block lifetime.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the reaper cadence.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.memtable_flush_size, 1000);
        assert_eq!(config.memtable_flush_size_bytes, 1024);
        assert_eq!(config.bloom_filter_false_positive_rate, 0.01);
        assert_eq!(config.bloom_filter_min_keys, 5);
        assert!(config.block_cache.enabled);
        assert_eq!(config.block_cache.capacity, 1024);
        assert_eq!(config.block_cache.shard_count, 8);
        assert_eq!(config.block_cache.ttl, Duration::from_secs(300));
        assert_eq!(config.block_cache.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/emberdb")
            .memtable_flush_size(10)
            .memtable_flush_size_bytes(1 << 20)
            .bloom_filter_min_keys(2)
            .block_cache(
                BlockCacheConfig::default()
                    .capacity(64)
                    .shard_count(2)
                    .ttl(Duration::from_secs(30)),
            );

        assert_eq!(config.data_dir, PathBuf::from("/tmp/emberdb"));
        assert_eq!(config.memtable_flush_size, 10);
        assert_eq!(config.memtable_flush_size_bytes, 1 << 20);
        assert_eq!(config.bloom_filter_min_keys, 2);
        assert_eq!(config.block_cache.capacity, 64);
        assert_eq!(config.block_cache.shard_count, 2);
        assert_eq!(config.block_cache.ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_disabled_block_cache() {
        let config = BlockCacheConfig::disabled();
        assert!(!config.enabled);
    }
}
