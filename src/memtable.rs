//! The memtable buffers the latest key-value pairs in memory before they are flushed to an
//! on-disk segment. It is a thin wrapper over the skip list that tracks entry and byte counts
//! against the configured flush thresholds. Thread safety is the caller's concern; the LSM
//! tree mutates the memtable under its write lock.

use std::cmp::Ordering;

use crate::skiplist::{Iter, SkipList};

fn byte_compare(a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
    a.cmp(b)
}

pub struct Memtable {
    list: SkipList<Vec<u8>, Vec<u8>>,
    /// Number of distinct keys held.
    entries: usize,
    /// Sum of `len(key) + len(value)` over all live entries.
    held_bytes: usize,
    flush_size: usize,
    flush_size_bytes: usize,
}

impl Memtable {
    pub fn new(flush_size: usize, flush_size_bytes: usize) -> Self {
        Self {
            list: SkipList::new(byte_compare),
            entries: 0,
            held_bytes: 0,
            flush_size,
            flush_size_bytes,
        }
    }

    /// Returns the value for the given key, if present.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.list.get(&key.to_vec()).map(|value| value.as_slice())
    }

    /// Inserts or updates a key, returning whether the memtable should now be flushed and the
    /// previous value when the key was already present.
    pub fn swap(&mut self, key: &[u8], value: Vec<u8>) -> (bool, Option<Vec<u8>>) {
        let value_len = value.len();
        let previous = self.list.set(key.to_vec(), value);
        match &previous {
            Some(old) => {
                // Only the value changed, so adjust by the value length delta.
                self.held_bytes -= old.len();
                self.held_bytes += value_len;
            }
            None => {
                self.entries += 1;
                self.held_bytes += key.len() + value_len;
            }
        }
        (self.should_flush(), previous)
    }

    /// Inserts or updates a key, returning whether the memtable should now be flushed.
    pub fn set(&mut self, key: &[u8], value: Vec<u8>) -> bool {
        self.swap(key, value).0
    }

    /// Removes a key, returning its previous value. Only the flush path removes entries; the
    /// LSM tree itself deletes by writing tombstones.
    pub fn delete(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let previous = self.list.delete(&key.to_vec())?;
        self.entries -= 1;
        self.held_bytes -= key.len() + previous.len();
        Some(previous)
    }

    /// A lazy ascending iterator over all held pairs.
    pub fn pairs(&self) -> Iter<'_, Vec<u8>, Vec<u8>> {
        self.list.iter()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn held_bytes(&self) -> usize {
        self.held_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Whether either flush threshold has been reached.
    pub fn should_flush(&self) -> bool {
        self.entries >= self.flush_size || self.held_bytes >= self.flush_size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get() {
        let mut memtable = Memtable::new(1000, 1024);
        memtable.set(b"k", b"v".to_vec());

        assert_eq!(memtable.get(b"k"), Some(b"v".as_slice()));
        assert_eq!(memtable.get(b"non-existent"), None);
    }

    #[test]
    fn test_set_thresholds() {
        let mut memtable = Memtable::new(3, 9);

        // Entries: 1 < 3. Held bytes: len("a") + len("12") = 3 < 9.
        assert!(!memtable.set(b"a", b"12".to_vec()));
        assert_eq!(memtable.entries(), 1);
        assert_eq!(memtable.held_bytes(), 3);

        // Entries: 2 < 3. Held bytes: 3 + len("bb") + len("123") = 8 < 9.
        assert!(!memtable.set(b"bb", b"123".to_vec()));
        assert_eq!(memtable.entries(), 2);
        assert_eq!(memtable.held_bytes(), 8);

        // Entries: 3 == 3. Held bytes: 8 + len("ccc") + len("1234") = 15 > 9.
        assert!(memtable.set(b"ccc", b"1234".to_vec()));
        assert_eq!(memtable.entries(), 3);
        assert_eq!(memtable.held_bytes(), 15);

        // Updating an existing key adjusts bytes by the value length delta.
        assert!(memtable.set(b"bb", b"12345".to_vec()));
        assert_eq!(memtable.entries(), 3);
        assert_eq!(memtable.held_bytes(), 17);
    }

    #[test]
    fn test_byte_threshold_alone_triggers_flush() {
        let mut memtable = Memtable::new(1000, 4);
        assert!(!memtable.set(b"a", b"1".to_vec()));
        assert!(memtable.set(b"b", b"2".to_vec()));
    }

    #[test]
    fn test_swap_returns_previous() {
        let mut memtable = Memtable::new(1000, 1024);
        let (_, previous) = memtable.swap(b"k", b"v1".to_vec());
        assert_eq!(previous, None);
        let (_, previous) = memtable.swap(b"k", b"v2".to_vec());
        assert_eq!(previous, Some(b"v1".to_vec()));
        assert_eq!(memtable.get(b"k"), Some(b"v2".as_slice()));
    }

    #[test]
    fn test_delete() {
        let mut memtable = Memtable::new(1000, 1024);
        memtable.set(b"a", b"1".to_vec());
        memtable.set(b"b", b"2".to_vec());
        assert_eq!(memtable.entries(), 2);
        assert_eq!(memtable.held_bytes(), 4);

        // Deleting a non-existent key has no side effects on the tracked sizes.
        assert_eq!(memtable.delete(b"non_existent"), None);
        assert_eq!(memtable.entries(), 2);
        assert_eq!(memtable.held_bytes(), 4);

        // Deleting a key shrinks both counters.
        assert_eq!(memtable.delete(b"a"), Some(b"1".to_vec()));
        assert_eq!(memtable.get(b"a"), None);
        assert_eq!(memtable.entries(), 1);
        assert_eq!(memtable.held_bytes(), 2);

        // The other key remains.
        assert_eq!(memtable.get(b"b"), Some(b"2".as_slice()));
    }

    #[test]
    fn test_pairs_are_sorted() {
        let mut memtable = Memtable::new(1000, 1024);
        memtable.set(b"k3", b"v3".to_vec());
        memtable.set(b"k1", b"v1".to_vec());
        memtable.set(b"k2", b"v2".to_vec());

        let keys: Vec<_> = memtable.pairs().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]);
    }
}
