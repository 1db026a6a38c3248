//! The LSM tree coordinator for a single logical table.
//!
//! New pairs are first written to the in-memory memtable. When the memtable crosses a flush
//! threshold its sorted contents are written out as a new segment appended to the chain of
//! immutable segment files on disk. Reads consult the memtable first and then walk the chain
//! from the newest segment backwards via `prev_id` links, so newer values shadow older ones.
//! Merging segments into larger ones is left to a future compactor; the chain only grows.

use itertools::Itertools as _;
use std::collections::{HashMap, HashSet};
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::errinput;
use crate::invariant;
use crate::memtable::Memtable;
use crate::sstable::table::SEGMENT_EXT;
use crate::sstable::{write_segment, BlockCache, Pair, Segment};

struct LsmState {
    memtable: Memtable,
    segments: HashMap<i64, Arc<Segment>>,
    /// The newest segment, where disk lookups start. None until the first flush.
    tail_id: Option<i64>,
    closed: bool,
}

/// A log-structured merge tree holding one table's key-value pairs.
pub struct LsmTree {
    table_id: i64,
    /// Directory holding this table's segment files: `{data_dir}/{table_id}`.
    dir: PathBuf,
    config: StoreConfig,
    cache: BlockCache,
    /// Whether close() should also stop the cache's background work.
    owns_cache: bool,
    state: RwLock<LsmState>,
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("table_id", &self.table_id)
            .field("dir", &self.dir)
            .finish()
    }
}

impl LsmTree {
    /// Opens the table directory under `config.data_dir`, creating it when absent, and
    /// builds a block cache of its own from the config.
    pub fn open(table_id: i64, config: StoreConfig) -> Result<Self> {
        let cache = BlockCache::new(&config.block_cache);
        let mut tree = Self::open_with_cache(table_id, config, cache)?;
        tree.owns_cache = true;
        Ok(tree)
    }

    /// Opens the table with a caller-provided block cache, e.g. one shared across stores.
    /// The caller remains responsible for shutting the cache down.
    pub fn open_with_cache(table_id: i64, config: StoreConfig, cache: BlockCache) -> Result<Self> {
        if table_id <= 0 {
            return errinput!("expected a positive table id, got {table_id}");
        }

        let dir = config.data_dir.join(table_id.to_string());
        match fs::metadata(&dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::IO(format!("table path {} is not a directory", dir.display())))
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                DirBuilder::new().recursive(true).mode(0o755).create(&dir)?;
            }
            Err(e) => return Err(e.into()),
        }

        // Scan the directory for segment files and open them all.
        let mut segments = HashMap::new();
        let mut prev_ids = HashSet::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let segment = Arc::new(Segment::open(&path, cache.clone())?);
            prev_ids.insert(segment.prev_id());
            let id = segment.id();
            if segments.insert(id, segment).is_some() {
                return Err(Error::ChainInconsistency(format!(
                    "duplicate segment id {id} in {}",
                    dir.display()
                )));
            }
        }

        // Every segment is some other segment's predecessor, except the tail.
        let mut tail_id = None;
        for id in segments.keys() {
            if prev_ids.contains(id) {
                continue;
            }
            if let Some(existing) = tail_id {
                invariant::raise(
                    "lsm",
                    "multiple_chain_tails",
                    &format!("multiple chain tails in {}: ({existing}, {id})", dir.display()),
                );
                return Err(Error::ChainInconsistency(format!(
                    "multiple tails found in {}: ({existing}, {id})",
                    dir.display()
                )));
            }
            tail_id = Some(*id);
        }
        if tail_id.is_none() && !segments.is_empty() {
            // Only possible when the segment files were tampered with or corrupted.
            invariant::raise(
                "lsm",
                "no_chain_tail",
                &format!("no chain tail found in {}", dir.display()),
            );
            return Err(Error::ChainInconsistency(format!(
                "no tail found in {}",
                dir.display()
            )));
        }

        let memtable = Memtable::new(config.memtable_flush_size, config.memtable_flush_size_bytes);
        Ok(Self {
            table_id,
            dir,
            config,
            cache,
            owns_cache: false,
            state: RwLock::new(LsmState { memtable, segments, tail_id, closed: false }),
        })
    }

    pub fn table_id(&self) -> i64 {
        self.table_id
    }

    /// The number of segments currently in the chain.
    pub fn segment_count(&self) -> usize {
        self.state.read().map(|state| state.segments.len()).unwrap_or(0)
    }

    /// Returns the value for the key, checking the memtable and then the segment chain.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return errinput!("expected a non-empty key");
        }
        let state = self.state.read()?;
        if state.closed {
            return Err(Error::Closed);
        }
        if let Some(value) = state.memtable.get(key) {
            return Ok(Some(value.to_vec()));
        }
        self.lookup_segments(&state, key)
    }

    /// Walks the chain from the tail backwards. Caller must hold the state lock.
    fn lookup_segments(&self, state: &LsmState, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(tail_id) = state.tail_id else {
            // Nothing has been flushed yet.
            return Ok(None);
        };
        let mut segment_id = tail_id;
        while segment_id > 0 {
            let Some(segment) = state.segments.get(&segment_id) else {
                invariant::raise(
                    "lsm",
                    "missing_chain_segment",
                    &format!("missing segment {segment_id} in chain for table {}", self.table_id),
                );
                return Err(Error::InvariantViolation(format!(
                    "missing segment {segment_id} in chain for table {}",
                    self.table_id
                )));
            };
            if let Some(value) = segment.get(key)? {
                return Ok(Some(value));
            }
            segment_id = segment.prev_id();
        }
        Ok(None)
    }

    /// Sets the given key-value pair, flushing the memtable when it crosses a threshold.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return errinput!("expected a non-empty key");
        }
        let mut state = self.state.write()?;
        if state.closed {
            return Err(Error::Closed);
        }
        if state.memtable.set(key, value) {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Stores the key-value pair and returns the previous value for the key, looked up
    /// across the memtable and the chain.
    pub fn swap(&self, key: &[u8], value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return errinput!("expected a non-empty key");
        }
        let mut state = self.state.write()?;
        if state.closed {
            return Err(Error::Closed);
        }
        let (should_flush, previous) = state.memtable.swap(key, value);
        // A memtable hit is authoritative; otherwise the chain may hold an older value.
        let previous = match previous {
            Some(value) => Some(value),
            None => self.lookup_segments(&state, key)?,
        };
        if should_flush {
            self.flush_locked(&mut state)?;
        }
        Ok(previous)
    }

    /// Writes the memtable out as the next segment in the chain and installs a fresh one.
    /// Caller must hold the write lock.
    fn flush_locked(&self, state: &mut LsmState) -> Result<()> {
        if state.memtable.is_empty() {
            return Ok(());
        }
        let prev_id = state.tail_id.unwrap_or(0);
        let next_id = prev_id + 1;
        let path = self.dir.join(format!("{next_id}.{SEGMENT_EXT}"));

        let pairs: Vec<Pair> =
            state.memtable.pairs().map(|(key, value)| (key.clone(), value.clone())).collect();
        write_segment(prev_id, next_id, &path, &pairs, &self.config)?;

        let segment = Arc::new(Segment::open(&path, self.cache.clone())?);
        if segment.id() != next_id || segment.prev_id() != prev_id {
            invariant::raise(
                "lsm",
                "invalid_segment_ids",
                &format!("segment {} has unexpected ids", path.display()),
            );
            return Err(Error::InvariantViolation(format!(
                "segment {} has ids ({}<-{}), want ({prev_id}<-{next_id})",
                path.display(),
                segment.prev_id(),
                segment.id()
            )));
        }

        state.segments.insert(next_id, segment);
        state.tail_id = Some(next_id);
        state.memtable =
            Memtable::new(self.config.memtable_flush_size, self.config.memtable_flush_size_bytes);
        tracing::info!(table_id = self.table_id, path = %path.display(), "flushed memtable to segment");
        Ok(())
    }

    /// Flushes any pending memtable contents and closes every segment. Segment close errors
    /// are joined and returned as one aggregate error. When the tree owns its block cache,
    /// the cache's background reaper is stopped and awaited as well. Subsequent operations
    /// fail with `Closed`.
    pub async fn close(&self) -> Result<()> {
        let result = {
            let mut state = self.state.write()?;
            if state.closed {
                return Err(Error::Closed);
            }
            tracing::info!(table_id = self.table_id, "closing lsm tree");

            let mut errors = Vec::new();
            if let Err(e) = self.flush_locked(&mut state) {
                errors.push(e.to_string());
            }
            for segment in state.segments.values() {
                if let Err(e) = segment.close() {
                    errors.push(e.to_string());
                }
            }
            state.closed = true;

            if errors.is_empty() {
                Ok(())
            } else {
                Err(Error::IO(errors.iter().join("; ")))
            }
        };
        if self.owns_cache {
            self.cache.shutdown().await;
        }
        result
    }
}
