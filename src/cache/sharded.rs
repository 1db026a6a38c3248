//! Cache sharding distributes keys uniformly across independent cache shards. Each shard has
//! its own lock, so concurrent readers and writers only contend when their keys land on the
//! same shard.

use std::marker::PhantomData;
use std::time::Duration;

use super::Layer;
use crate::invariant;

/// A cache that routes each key to one of N underlying shards by a 64-bit hash of the key.
pub struct Sharded<K, V, L> {
    shards: Vec<L>,
    hash: fn(&K) -> u64,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V, L> Sharded<K, V, L>
where
    L: Layer<K, V>,
{
    /// Creates `shard_count` shards with the given generator. A non-positive shard count is
    /// clamped to 1 with an invariant report.
    pub fn new(shard_count: i64, hash: fn(&K) -> u64, mut make_shard: impl FnMut() -> L) -> Self {
        let shard_count = if shard_count <= 0 {
            invariant::raise(
                "cache",
                "nonpositive_shard_count",
                &format!("invalid shard count {shard_count} given to sharded cache, using 1"),
            );
            1
        } else {
            shard_count as usize
        };
        Self {
            shards: (0..shard_count).map(|_| make_shard()).collect(),
            hash,
            _marker: PhantomData,
        }
    }

    fn shard(&self, key: &K) -> &L {
        &self.shards[((self.hash)(key) % self.shards.len() as u64) as usize]
    }

    #[cfg(test)]
    fn shards(&self) -> &[L] {
        &self.shards
    }
}

#[async_trait::async_trait]
impl<K, V, L> Layer<K, V> for Sharded<K, V, L>
where
    K: Send + Sync,
    V: Send + Sync,
    L: Layer<K, V>,
{
    fn get(&self, key: &K) -> Option<V> {
        self.shard(key).get(key)
    }

    fn add(&self, key: K, value: V, ttl: Duration) -> bool {
        self.shard(&key).add(key, value, ttl)
    }

    fn keys(&self) -> Vec<K> {
        self.shards.iter().flat_map(|shard| shard.keys()).collect()
    }

    fn purge(&self) {
        for shard in &self.shards {
            shard.purge();
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    async fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown().await;
        }
    }
}
