pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod hasher;
pub mod invariant;
pub mod memtable;
pub mod skiplist;
pub mod sstable;
pub mod store;
pub mod value;

pub use commands::{Database, Existence, SetCommand, SetResult};
pub use config::{BlockCacheConfig, StoreConfig};
pub use error::{Error, Result};
pub use store::LsmTree;
