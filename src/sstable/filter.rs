//! A bloom filter over a segment's full key set. The filter can prove a key is definitely
//! absent, letting reads skip the segment without touching its data blocks; false positives
//! only cost an extra block scan. The bit array is transported in the segment header as raw
//! 64-bit words so the filter reads back exactly as written.

use super::BloomFilterIndex;
use crate::hasher;
use crate::invariant;

pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u64,
}

impl BloomFilter {
    /// Sizes a filter for the expected number of keys at the desired false positive rate,
    /// using the standard estimates `m = -n*ln(p)/ln(2)^2` and `k = m/n*ln(2)`.
    pub fn with_estimates(num_keys: usize, false_positive_rate: f64) -> Self {
        let n = num_keys.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * false_positive_rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).ceil().max(1.0) as u64;
        Self {
            bits: vec![0; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
        }
    }

    /// Rebuilds a filter from header fields. Returns None (with an invariant report) when
    /// the word count does not match the claimed bit count.
    pub fn from_index(index: &BloomFilterIndex) -> Option<Self> {
        let expected_words = index.num_bits.div_ceil(64) as usize;
        if index.num_bits == 0
            || index.num_hash_funcs == 0
            || index.bit_array.len() != expected_words
        {
            invariant::raise(
                "segment",
                "bloom_filter_corruption",
                &format!(
                    "bloom filter index mismatch: {} bits, {} hash funcs, {} words",
                    index.num_bits,
                    index.num_hash_funcs,
                    index.bit_array.len()
                ),
            );
            return None;
        }
        Some(Self {
            bits: index.bit_array.clone(),
            num_bits: index.num_bits,
            num_hashes: index.num_hash_funcs,
        })
    }

    /// Exports the filter for transport in a segment header.
    pub fn to_index(&self) -> BloomFilterIndex {
        BloomFilterIndex {
            num_bits: self.num_bits,
            num_hash_funcs: self.num_hashes,
            bit_array: self.bits.clone(),
        }
    }

    /// The i-th probe position for a key, by double hashing: `h1 + i*h2 mod m`.
    fn probe(&self, h1: u64, h2: u64, i: u64) -> u64 {
        h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits
    }

    pub fn insert(&mut self, key: &[u8]) {
        let h1 = hasher::hash(key);
        let h2 = hasher::hash_seeded(key, h1);
        for i in 0..self.num_hashes {
            let bit = self.probe(h1, h2, i);
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Returns false when the key is definitely not present. True may be a false positive.
    pub fn contains(&self, key: &[u8]) -> bool {
        let h1 = hasher::hash(key);
        let h2 = hasher::hash_seeded(key, h1);
        (0..self.num_hashes).all(|i| {
            let bit = self.probe(h1, h2, i);
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u64 {
        self.num_hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::with_estimates(1000, 0.01);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key-{i}").into_bytes()).collect();
        for key in &keys {
            filter.insert(key);
        }
        for key in &keys {
            assert!(filter.contains(key), "inserted key must always test positive");
        }
    }

    #[test]
    fn test_false_positive_rate_is_sane() {
        let mut filter = BloomFilter::with_estimates(1000, 0.01);
        for i in 0..1000 {
            filter.insert(format!("present-{i}").as_bytes());
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.contains(format!("absent-{i}").as_bytes()))
            .count();
        // Allow generous slack over the target 1% rate.
        assert!(
            false_positives < 500,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn test_index_round_trip() {
        let mut filter = BloomFilter::with_estimates(100, 0.01);
        for i in 0..100 {
            filter.insert(format!("key-{i}").as_bytes());
        }

        let index = filter.to_index();
        let rebuilt = BloomFilter::from_index(&index).expect("rebuild failed");
        assert_eq!(rebuilt.num_bits(), filter.num_bits());
        assert_eq!(rebuilt.num_hashes(), filter.num_hashes());
        for i in 0..100 {
            assert!(rebuilt.contains(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn test_malformed_index_rejected() {
        let before = invariant::count("segment", "bloom_filter_corruption");
        let index = BloomFilterIndex { num_bits: 128, num_hash_funcs: 3, bit_array: vec![0; 1] };
        assert!(BloomFilter::from_index(&index).is_none());
        assert_eq!(invariant::count("segment", "bloom_filter_corruption"), before + 1);
    }

    #[test]
    fn test_tiny_key_count_still_works() {
        let mut filter = BloomFilter::with_estimates(1, 0.01);
        filter.insert(b"only");
        assert!(filter.contains(b"only"));
        assert!(filter.num_bits() >= 64);
        assert!(filter.num_hashes() >= 1);
    }
}
