//! A generic skip list. A skip list maintains multiple forward-pointer layers over a sorted
//! linked list. Each key may be promoted to higher levels with probability `p`, forming
//! express lanes that let searches skip over large ranges. Operations start at the highest
//! populated level and descend when advancing would overshoot the target key.
//!
//! Nodes live in an arena indexed by `usize` and deleted slots are recycled, so the structure
//! is safe Rust with no reference cycles. Expected time for get/set/delete is O(log n).

use rand::Rng;
use std::cmp::Ordering;

const DEFAULT_MAX_LEVEL: usize = 16;
const DEFAULT_P: f64 = 0.25;

/// Index of the head sentinel in the node arena.
const HEAD: usize = 0;

/// A three-way comparison for keys of type K. Must return a total, consistent ordering.
pub type CompareFn<K> = fn(&K, &K) -> Ordering;

struct Node<K, V> {
    /// None only for the head sentinel and recycled slots.
    entry: Option<(K, V)>,
    /// Forward pointers per level (0..level-1).
    forwards: Vec<Option<usize>>,
}

/// A probabilistically balanced ordered map over keys compared by a caller-supplied
/// comparator. The structure maintains up to `max_level` layers; each node appears in level
/// `i` with probability `p^i`, enabling logarithmic expected search.
pub struct SkipList<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<usize>,
    level: usize,
    max_level: usize,
    p: f64,
    len: usize,
    cmp: CompareFn<K>,
}

impl<K, V> SkipList<K, V> {
    /// Creates a new empty skip list. Defaults: max_level=16, p=0.25.
    pub fn new(cmp: CompareFn<K>) -> Self {
        let head = Node { entry: None, forwards: vec![None; DEFAULT_MAX_LEVEL] };
        Self {
            nodes: vec![head],
            free: Vec::new(),
            level: 1,
            max_level: DEFAULT_MAX_LEVEL,
            p: DEFAULT_P,
            len: 0,
            cmp,
        }
    }

    /// The number of entries in the list.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node_key(&self, node: usize) -> &K {
        &self.nodes[node].entry.as_ref().expect("interior node without an entry").0
    }

    /// Generates a random level based on the promotion probability.
    fn random_level(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 1;
        while level < self.max_level && rng.gen::<f64>() < self.p {
            level += 1;
        }
        level
    }

    /// Walks down from the highest populated level, recording the last node before the key's
    /// position at each level. Returns the predecessors and the level-0 predecessor.
    fn predecessors(&self, key: &K) -> (Vec<usize>, usize) {
        let mut update = vec![HEAD; self.max_level];
        let mut node = HEAD;
        for level in (0..self.level).rev() {
            while let Some(next) = self.nodes[node].forwards[level] {
                if (self.cmp)(self.node_key(next), key) == Ordering::Less {
                    node = next;
                } else {
                    break;
                }
            }
            update[level] = node;
        }
        (update, node)
    }

    /// Returns the value for the given key, if present.
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = HEAD;
        for level in (0..self.level).rev() {
            while let Some(next) = self.nodes[node].forwards[level] {
                if (self.cmp)(self.node_key(next), key) == Ordering::Less {
                    node = next;
                } else {
                    break;
                }
            }
        }
        let candidate = self.nodes[node].forwards[0]?;
        if (self.cmp)(self.node_key(candidate), key) == Ordering::Equal {
            self.nodes[candidate].entry.as_ref().map(|(_, value)| value)
        } else {
            None
        }
    }

    /// Inserts a new key/value or updates an existing one, returning the previous value when
    /// the key was already present.
    pub fn set(&mut self, key: K, value: V) -> Option<V> {
        let (update, node) = self.predecessors(&key);

        // Update in place if the key already exists at level 0.
        if let Some(next) = self.nodes[node].forwards[0] {
            if (self.cmp)(self.node_key(next), &key) == Ordering::Equal {
                let entry = self.nodes[next].entry.as_mut().expect("interior node without an entry");
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }

        // Splice in a new node at a random level.
        let level = self.random_level();
        if level > self.level {
            self.level = level;
        }
        let new_node = self.allocate(key, value, level);
        for i in 0..level {
            self.nodes[new_node].forwards[i] = self.nodes[update[i]].forwards[i];
            self.nodes[update[i]].forwards[i] = Some(new_node);
        }
        self.len += 1;
        None
    }

    /// Removes the given key, returning its value when it was present. Rewires predecessors
    /// to skip the target node and trims empty top levels.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let (update, node) = self.predecessors(key);
        let target = self.nodes[node].forwards[0]?;
        if (self.cmp)(self.node_key(target), key) != Ordering::Equal {
            return None;
        }
        for i in 0..self.level {
            if self.nodes[update[i]].forwards[i] == Some(target) {
                self.nodes[update[i]].forwards[i] = self.nodes[target].forwards[i];
            }
        }
        while self.level > 1 && self.nodes[HEAD].forwards[self.level - 1].is_none() {
            self.level -= 1;
        }
        let (_, value) = self.nodes[target].entry.take().expect("deleted node without an entry");
        self.nodes[target].forwards.clear();
        self.free.push(target);
        self.len -= 1;
        Some(value)
    }

    fn allocate(&mut self, key: K, value: V, level: usize) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot].entry = Some((key, value));
                self.nodes[slot].forwards.resize(level, None);
                slot
            }
            None => {
                self.nodes.push(Node { entry: Some((key, value)), forwards: vec![None; level] });
                self.nodes.len() - 1
            }
        }
    }

    /// Returns a fresh iterator over all entries in ascending key order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter { list: self, node: self.nodes[HEAD].forwards[0], end: None }
    }

    /// Iterates over entries with keys greater than or equal to `start`.
    pub fn scan_from(&self, start: &K) -> Iter<'_, K, V> {
        let (_, node) = self.predecessors(start);
        Iter { list: self, node: self.nodes[node].forwards[0], end: None }
    }

    /// Iterates over entries in `[start, end)`.
    pub fn scan_range(&self, start: &K, end: K) -> Iter<'_, K, V> {
        let (_, node) = self.predecessors(start);
        Iter { list: self, node: self.nodes[node].forwards[0], end: Some(end) }
    }
}

/// A lazy ascending iterator over skip list entries.
pub struct Iter<'a, K, V> {
    list: &'a SkipList<K, V>,
    node: Option<usize>,
    end: Option<K>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        let (key, value) = self.list.nodes[node].entry.as_ref()?;
        if let Some(end) = &self.end {
            if (self.list.cmp)(key, end) != Ordering::Less {
                self.node = None;
                return None;
            }
        }
        self.node = self.list.nodes[node].forwards[0];
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn int_compare(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn byte_compare(a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn test_empty_get() {
        let list: SkipList<i64, String> = SkipList::new(int_compare);
        assert_eq!(list.get(&42), None);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_set_and_get_simple() {
        let mut list = SkipList::new(int_compare);
        assert_eq!(list.set(2, "two"), None);
        assert_eq!(list.set(1, "one"), None);
        assert_eq!(list.set(3, "three"), None);

        assert_eq!(list.get(&1), Some(&"one"));
        assert_eq!(list.get(&2), Some(&"two"));
        assert_eq!(list.get(&3), Some(&"three"));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_update_value() {
        let mut list = SkipList::new(int_compare);
        assert_eq!(list.set(10, "ten"), None);
        assert_eq!(list.set(10, "TEN"), Some("ten"));
        assert_eq!(list.get(&10), Some(&"TEN"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_delete() {
        let mut list = SkipList::new(int_compare);
        // Deleting a missing key returns None.
        assert_eq!(list.delete(&7), None);

        for (k, v) in [(1, "a"), (2, "b"), (3, "c")] {
            list.set(k, v);
        }
        assert_eq!(list.delete(&2), Some("b"));
        assert_eq!(list.get(&2), None);
        // Deleting again returns None.
        assert_eq!(list.delete(&2), None);
        // Other keys remain.
        assert_eq!(list.get(&1), Some(&"a"));
        assert_eq!(list.get(&3), Some(&"c"));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_bulk_insert_and_get() {
        let mut list = SkipList::new(int_compare);
        const SAMPLES: i64 = 200;
        for i in 0..SAMPLES {
            assert_eq!(list.set(i, format!("val-{i}")), None);
        }
        for i in 0..SAMPLES {
            assert_eq!(list.get(&i), Some(&format!("val-{i}")));
        }
    }

    #[test]
    fn test_iterate_ascending() {
        let mut list = SkipList::new(int_compare);
        // Insert in non-sorted order.
        list.set(3, "three");
        list.set(1, "one");
        list.set(2, "two");

        let pairs: Vec<_> = list.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(pairs, vec![(1, "one"), (2, "two"), (3, "three")]);

        // Updating a key should reflect in iteration, and iter() restarts from scratch.
        list.set(2, "TWO");
        let pairs: Vec<_> = list.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(pairs[1], (2, "TWO"));
    }

    #[test]
    fn test_scan_from_and_range() {
        let mut list = SkipList::new(int_compare);
        for i in 0..10 {
            list.set(i, i * 10);
        }

        let from: Vec<_> = list.scan_from(&7).map(|(k, _)| *k).collect();
        assert_eq!(from, vec![7, 8, 9]);

        // End bound is exclusive, start is inclusive.
        let range: Vec<_> = list.scan_range(&3, 6).map(|(k, _)| *k).collect();
        assert_eq!(range, vec![3, 4, 5]);

        // A start between keys lands on the next present key.
        list.delete(&4);
        let range: Vec<_> = list.scan_range(&4, 8).map(|(k, _)| *k).collect();
        assert_eq!(range, vec![5, 6, 7]);
    }

    #[test]
    fn test_byte_keys() {
        let mut list = SkipList::new(byte_compare);
        list.set(b"beta".to_vec(), 2);
        list.set(b"alpha".to_vec(), 1);
        list.set(b"gamma".to_vec(), 3);
        assert_eq!(list.get(&b"beta".to_vec()), Some(&2));
        let keys: Vec<_> = list.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    }

    #[test]
    fn test_randomized_against_btreemap() {
        use rand::Rng;

        let mut list = SkipList::new(int_compare);
        let mut model = BTreeMap::new();
        let mut rng = rand::thread_rng();

        for _ in 0..2000 {
            let key = rng.gen_range(0..200);
            match rng.gen_range(0..3) {
                0 => {
                    let value = rng.gen::<u32>();
                    assert_eq!(list.set(key, value), model.insert(key, value));
                }
                1 => {
                    assert_eq!(list.delete(&key), model.remove(&key));
                }
                _ => {
                    assert_eq!(list.get(&key), model.get(&key));
                }
            }
        }

        assert_eq!(list.len(), model.len());
        let got: Vec<_> = list.iter().map(|(k, v)| (*k, *v)).collect();
        let want: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_no_duplicate_keys_in_iteration() {
        let mut list = SkipList::new(int_compare);
        for _ in 0..5 {
            for i in 0..50 {
                list.set(i, i);
            }
        }
        let keys: Vec<_> = list.iter().map(|(k, _)| *k).collect();
        let mut deduped = keys.clone();
        deduped.dedup();
        assert_eq!(keys, deduped);
        assert_eq!(keys.len(), 50);
    }
}
