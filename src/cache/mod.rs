//! In-memory caching for lookup results, used to avoid repeated disk reads. The [`Layer`]
//! trait gives single-shard and multi-shard caches the same API, so callers can be handed a
//! no-op, a single CLOCK cache, or a sharded one behind the same object.

pub mod clock;
pub mod list;
pub mod sharded;

pub use clock::HyperClock;
pub use list::{LinkedList, NodeId};
pub use sharded::Sharded;

use std::time::Duration;

/// A generic key-value cache layer.
#[async_trait::async_trait]
pub trait Layer<K, V>: Send + Sync {
    /// Returns the cached value for the given key, if present and not expired.
    fn get(&self, key: &K) -> Option<V>;

    /// Inserts a key-value pair with the given TTL. Returns true if an entry was evicted to
    /// make room.
    fn add(&self, key: K, value: V, ttl: Duration) -> bool;

    /// All keys currently cached. Expensive on sharded caches.
    fn keys(&self) -> Vec<K>;

    /// Removes all entries.
    fn purge(&self);

    /// The number of entries currently cached.
    fn len(&self) -> usize;

    /// Stops any background work owned by the cache and waits for it to finish.
    async fn shutdown(&self);
}

/// A cache layer that stores nothing. Used when caching is disabled.
pub struct NoOp;

#[async_trait::async_trait]
impl<K, V> Layer<K, V> for NoOp
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn get(&self, _key: &K) -> Option<V> {
        None
    }

    fn add(&self, _key: K, _value: V, _ttl: Duration) -> bool {
        false
    }

    fn keys(&self) -> Vec<K> {
        Vec::new()
    }

    fn purge(&self) {}

    fn len(&self) -> usize {
        0
    }

    async fn shutdown(&self) {}
}
