//! The shared data block cache. Decoded data blocks are cached under their
//! `(table, segment, offset)` coordinates so hot blocks are served from memory instead of
//! being re-read and re-decoded from disk. The cache is a handle injected into segments by
//! the store that opens them; callers choose whether stores share one instance.

use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;
use std::time::Duration;

use super::DataBlock;
use crate::cache::{HyperClock, Layer, NoOp, Sharded};
use crate::config::BlockCacheConfig;
use crate::hasher;

/// Identifies one data block: the table, the segment within it, and the block's absolute
/// byte offset within the segment file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub table: i64,
    pub segment: i64,
    pub offset: u64,
}

/// Routes a block key to a shard by hashing its fixed binary representation.
fn shard_hash(key: &BlockKey) -> u64 {
    let mut buf = [0u8; 24];
    LittleEndian::write_i64(&mut buf[0..8], key.table);
    LittleEndian::write_i64(&mut buf[8..16], key.segment);
    LittleEndian::write_u64(&mut buf[16..24], key.offset);
    hasher::hash(&buf)
}

/// A cloneable handle to the block cache. Depending on configuration this is a no-op, a
/// single CLOCK cache, or a sharded one. Active variants must be created inside a tokio
/// runtime, which hosts their expiry reapers.
#[derive(Clone)]
pub struct BlockCache {
    layer: Arc<dyn Layer<BlockKey, Arc<DataBlock>>>,
    ttl: Duration,
}

impl BlockCache {
    /// Builds a cache from configuration. Disabled caching, a non-positive capacity, or a
    /// non-positive shard count all resolve to the no-op cache.
    pub fn new(config: &BlockCacheConfig) -> Self {
        if !config.enabled || config.capacity <= 0 || config.shard_count <= 0 {
            return Self::disabled();
        }
        let layer: Arc<dyn Layer<BlockKey, Arc<DataBlock>>> = if config.shard_count == 1 {
            Arc::new(HyperClock::new(config.capacity, config.tick_interval, None))
        } else {
            let capacity = config.capacity;
            let tick_interval = config.tick_interval;
            Arc::new(Sharded::new(config.shard_count, shard_hash, move || {
                HyperClock::new(capacity, tick_interval, None)
            }))
        };
        Self { layer, ttl: config.ttl }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self { layer: Arc::new(NoOp), ttl: Duration::ZERO }
    }

    pub fn get(&self, key: &BlockKey) -> Option<Arc<DataBlock>> {
        self.layer.get(key)
    }

    /// Caches a decoded block. Returns true when an older block was evicted to make room.
    pub fn insert(&self, key: BlockKey, block: Arc<DataBlock>) -> bool {
        self.layer.add(key, block, self.ttl)
    }

    pub fn purge(&self) {
        self.layer.purge()
    }

    pub fn len(&self) -> usize {
        self.layer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the background reaper(s) and waits for them to exit.
    pub async fn shutdown(&self) {
        self.layer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(marker: u8) -> Arc<DataBlock> {
        Arc::new(DataBlock { keys: vec![vec![marker]], values: vec![vec![marker]] })
    }

    #[test]
    fn test_disabled_variants() {
        for config in [
            BlockCacheConfig::disabled(),
            BlockCacheConfig::default().capacity(0),
            BlockCacheConfig::default().shard_count(0),
            BlockCacheConfig::default().shard_count(-3),
        ] {
            let cache = BlockCache::new(&config);
            let key = BlockKey { table: 1, segment: 1, offset: 0 };
            cache.insert(key, block(1));
            assert_eq!(cache.get(&key), None);
            assert!(cache.is_empty());
        }
    }

    #[tokio::test]
    async fn test_single_shard_cache() {
        let cache = BlockCache::new(&BlockCacheConfig::default().shard_count(1).capacity(16));
        let key = BlockKey { table: 1, segment: 2, offset: 64 };
        cache.insert(key, block(7));
        assert_eq!(cache.get(&key), Some(block(7)));
        // Distinct offsets are distinct entries.
        assert_eq!(cache.get(&BlockKey { offset: 128, ..key }), None);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_sharded_cache() {
        let cache = BlockCache::new(&BlockCacheConfig::default().shard_count(4).capacity(16));
        for segment in 0..32 {
            let key = BlockKey { table: 1, segment, offset: 8 };
            cache.insert(key, block(segment as u8));
        }
        for segment in 0..32 {
            let key = BlockKey { table: 1, segment, offset: 8 };
            if let Some(cached) = cache.get(&key) {
                assert_eq!(cached, block(segment as u8));
            }
        }
        cache.purge();
        assert!(cache.is_empty());
        cache.shutdown().await;
    }
}
