//! 64-bit hashing helpers, used for cache shard routing and bloom filter probing.

use xxhash_rust::xxh64::xxh64;

/// Hashes the given bytes with the default seed.
pub fn hash(data: &[u8]) -> u64 {
    xxh64(data, 0)
}

/// Hashes the given bytes with an explicit seed. Distinct seeds yield independent hash
/// families, which is what the bloom filter's double hashing relies on.
pub fn hash_seeded(data: &[u8], seed: u64) -> u64 {
    xxh64(data, seed)
}
