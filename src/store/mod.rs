//! Storage backends. The only implementation is the LSM tree: writes land in an in-memory
//! memtable and are flushed to an immutable chain of on-disk segments; reads check the
//! memtable first, then walk the chain from newest to oldest.

pub mod lsm;

pub use lsm::LsmTree;
