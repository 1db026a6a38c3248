//! An expirable CLOCK cache.
//!
//! Eviction (CLOCK second chance): entries form a circular list swept by a "hand". When the
//! cache is full and a new item arrives, the hand inspects the entry it points at. A set
//! reference bit is cleared and the hand advances, giving the entry a second chance; an
//! unreferenced or expired entry is evicted and its node reused for the new item.
//!
//! Expiration (TTL with a reaper): entries are indexed into time buckets keyed by their
//! expiry floored to a multiple of the tick interval. A background task wakes up every tick
//! and clears all buckets whose timestamp has passed, removing their entries from the list
//! and the index without scanning the whole cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{Layer, LinkedList, NodeId};
use crate::invariant;

/// Runs on entry eviction, receiving the evicted key and value. Runs while the cache lock is
/// held, so it must not call back into the cache.
pub type EvictionCallback<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

struct Entry<K, V> {
    key: K,
    value: V,
    /// The CLOCK reference bit. Set on every read; atomic so the read path can update it
    /// under the shared read lock without serializing readers.
    referenced: AtomicBool,
    /// Expiry as elapsed time since the cache epoch.
    expires_at: Duration,
}

struct State<K, V> {
    /// The circular buffer the CLOCK hand sweeps over.
    list: LinkedList<Entry<K, V>>,
    /// Lookup of an entry's node by key.
    index: HashMap<K, NodeId>,
    /// Entries grouped by expiry bucket, so the reaper can drop a whole batch at once.
    buckets: HashMap<u64, HashMap<K, NodeId>>,
    /// The next eviction candidate.
    hand: Option<NodeId>,
    /// The next bucket to be cleared by the reaper.
    reaper_hand: u64,
}

struct Shared<K, V> {
    capacity: usize,
    tick: Duration,
    epoch: Instant,
    state: RwLock<State<K, V>>,
    on_evict: Option<EvictionCallback<K, V>>,
}

impl<K, V> Shared<K, V>
where
    K: Clone + Eq + Hash,
{
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Floors the timestamp to the bucket the reaper clears it in.
    fn bucket_of(&self, at: Duration) -> u64 {
        (at.as_nanos() / self.tick.as_nanos()) as u64
    }

    /// Clears every bucket whose timestamp has passed since the reaper last ran.
    fn reap(&self) {
        let now = self.now();
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        while (state.reaper_hand as u128) * self.tick.as_nanos() < now.as_nanos() {
            if let Some(bucket) = state.buckets.remove(&state.reaper_hand) {
                for (_, node) in bucket {
                    // Move the CLOCK hand off the node that is about to be removed.
                    if state.hand == Some(node) {
                        let next = state.list.next(node).or_else(|| state.list.front());
                        state.hand = if next == Some(node) { None } else { next };
                    }
                    if let Some(entry) = state.list.remove(node) {
                        state.index.remove(&entry.key);
                    }
                }
            }
            state.reaper_hand += 1;
        }
    }
}

/// A thread-safe, fixed-capacity, in-memory cache combining CLOCK (second chance) eviction
/// with time-based expiration. Must be constructed inside a tokio runtime, which hosts its
/// background reaper task.
pub struct HyperClock<K, V> {
    shared: Arc<Shared<K, V>>,
    shutdown_tx: broadcast::Sender<()>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> HyperClock<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates the cache and starts its background reaper. A non-positive capacity is clamped
    /// to 1 and a zero tick interval falls back to one second, both with an invariant report.
    pub fn new(
        capacity: i64,
        tick_interval: Duration,
        on_evict: Option<EvictionCallback<K, V>>,
    ) -> Self {
        let capacity = if capacity <= 0 {
            invariant::raise(
                "cache",
                "nonpositive_capacity",
                &format!("invalid capacity {capacity} given to clock cache, using 1"),
            );
            1
        } else {
            capacity as usize
        };
        let tick = if tick_interval.is_zero() {
            invariant::raise(
                "cache",
                "zero_tick_interval",
                "zero tick interval given to clock cache, using 1s",
            );
            Duration::from_secs(1)
        } else {
            tick_interval
        };

        let shared = Arc::new(Shared {
            capacity,
            tick,
            epoch: Instant::now(),
            state: RwLock::new(State {
                list: LinkedList::with_capacity(capacity),
                index: HashMap::with_capacity(capacity),
                buckets: HashMap::new(),
                hand: None,
                reaper_hand: 0,
            }),
            on_evict,
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let reaper = tokio::spawn(run_reaper(shared.clone(), tick, shutdown_rx));
        Self { shared, shutdown_tx, reaper: Mutex::new(Some(reaper)) }
    }
}

async fn run_reaper<K, V>(
    shared: Arc<Shared<K, V>>,
    tick: Duration,
    mut shutdown: broadcast::Receiver<()>,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.reap(),
            _ = shutdown.recv() => {
                tracing::debug!("cache reaper shutting down");
                break;
            }
        }
    }
}

#[async_trait::async_trait]
impl<K, V> Layer<K, V> for HyperClock<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Returns the value for a key if present and not expired, marking the entry as recently
    /// used.
    fn get(&self, key: &K) -> Option<V> {
        let state = self.shared.state.read().unwrap();
        let node = *state.index.get(key)?;
        let entry = state.list.get(node)?;
        if self.shared.now() > entry.expires_at {
            return None;
        }
        // Give the entry a second chance against the next eviction sweep.
        entry.referenced.store(true, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Inserts or updates a key-value pair. Returns true when a victim was evicted to make
    /// room.
    fn add(&self, key: K, value: V, ttl: Duration) -> bool {
        let now = self.shared.now();
        let expires_at = now + ttl;
        let mut guard = self.shared.state.write().unwrap();
        let state = &mut *guard;

        // Update an existing entry: re-bucket by the new expiry and clear the reference bit.
        if let Some(&node) = state.index.get(&key) {
            let entry = state.list.get_mut(node).expect("indexed entry missing from list");
            let old_bucket = self.shared.bucket_of(entry.expires_at);
            entry.value = value;
            entry.referenced.store(false, Ordering::Relaxed);
            entry.expires_at = expires_at;
            if let Some(bucket) = state.buckets.get_mut(&old_bucket) {
                bucket.remove(&key);
            }
            let bucket = self.shared.bucket_of(expires_at);
            state.buckets.entry(bucket).or_default().insert(key, node);
            return false;
        }

        // Append while below capacity.
        if state.list.len() < self.shared.capacity {
            let node = state.list.push_back(Entry {
                key: key.clone(),
                value,
                referenced: AtomicBool::new(false),
                expires_at,
            });
            let bucket = self.shared.bucket_of(expires_at);
            state.buckets.entry(bucket).or_default().insert(key.clone(), node);
            state.index.insert(key, node);
            if state.hand.is_none() {
                state.hand = Some(node);
            }
            return false;
        }

        // Eviction sweep. The first pass over a fully-referenced cache clears every bit, so
        // the sweep terminates within two revolutions.
        loop {
            let hand = state.hand.expect("clock hand unset on a full cache");
            let is_victim = {
                let entry = state.list.get(hand).expect("hand points at a removed node");
                !entry.referenced.load(Ordering::Relaxed) || now > entry.expires_at
            };
            if is_victim {
                // Replace the victim's data in place, reusing its node.
                let entry = state.list.get_mut(hand).expect("hand points at a removed node");
                let evicted_key = std::mem::replace(&mut entry.key, key);
                let evicted_value = std::mem::replace(&mut entry.value, value);
                let evicted_expiry = std::mem::replace(&mut entry.expires_at, expires_at);
                entry.referenced.store(false, Ordering::Relaxed);
                let new_key = entry.key.clone();

                state.index.remove(&evicted_key);
                if let Some(bucket) = state.buckets.get_mut(&self.shared.bucket_of(evicted_expiry)) {
                    bucket.remove(&evicted_key);
                }
                let bucket = self.shared.bucket_of(expires_at);
                state.buckets.entry(bucket).or_default().insert(new_key.clone(), hand);
                state.index.insert(new_key, hand);
                state.hand = state.list.next(hand).or_else(|| state.list.front());

                if let Some(on_evict) = &self.shared.on_evict {
                    on_evict(evicted_key, evicted_value);
                }
                return true;
            }
            // Referenced: clear the bit and advance the hand.
            let entry = state.list.get(hand).expect("hand points at a removed node");
            entry.referenced.store(false, Ordering::Relaxed);
            state.hand = state.list.next(hand).or_else(|| state.list.front());
        }
    }

    fn keys(&self) -> Vec<K> {
        self.shared.state.read().unwrap().index.keys().cloned().collect()
    }

    fn purge(&self) {
        let mut guard = self.shared.state.write().unwrap();
        let state = &mut *guard;
        let buckets = std::mem::take(&mut state.buckets);
        for (_, bucket) in buckets {
            for (_, node) in bucket {
                if let Some(entry) = state.list.remove(node) {
                    state.index.remove(&entry.key);
                    if let Some(on_evict) = &self.shared.on_evict {
                        on_evict(entry.key, entry.value);
                    }
                }
            }
        }
        state.hand = None;
    }

    fn len(&self) -> usize {
        self.shared.state.read().unwrap().list.len()
    }

    /// Signals the reaper to stop and waits for it to exit at its next tick boundary.
    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl<K, V> Drop for HyperClock<K, V> {
    fn drop(&mut self) {
        // Best-effort stop for callers that never awaited shutdown().
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }
    }
}
