//! Segment writing and reading. A segment file is a header block followed by its data
//! blocks, all framed by the block I/O layer:
//!
//! ```text
//! [ framed(header) ] [ framed(data_block_0) ] ... [ framed(data_block_k) ]
//! ```
//!
//! Segments are written once, through a temp file that is atomically renamed into place, and
//! never modified afterwards. The header is eagerly loaded on open; data blocks are fetched
//! lazily through the shared block cache.

use std::fs::{DirBuilder, File};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::block_cache::{BlockCache, BlockKey};
use super::blockio::{framed_len, BlockReader, BlockWriter};
use super::compress::compress_blocks;
use super::filter::BloomFilter;
use super::{DataBlock, Pair, SegmentHeader, SkipIndex};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::invariant;
use crate::{errdata, errinput};

/// File extension of segment files.
pub const SEGMENT_EXT: &str = "sst";

/// Returns a clipped false positive rate for the bloom filter to avoid degenerate sizing.
fn clamped_false_positive_rate(rate: f64) -> f64 {
    if rate > 0.0 && rate < 1.0 {
        return rate;
    }
    invariant::raise(
        "segment",
        "invalid_bloom_filter_rate",
        &format!("bloom filter false positive rate must be in (0.0, 1.0), got {rate}; using 0.01"),
    );
    0.01
}

/// Writes the given sorted pairs as a new segment file at `path`, linked to the previous
/// segment `prev_id` (0 for the chain start). The file is built in `temp_folder` and renamed
/// into place; the temp file is removed on every failure path.
pub fn write_segment(
    prev_id: i64,
    next_id: i64,
    path: &Path,
    pairs: &[Pair],
    config: &StoreConfig,
) -> Result<()> {
    if pairs.is_empty() {
        return errinput!("expected a non-empty batch of pairs");
    }

    let (prefixes, blocks) = compress_blocks(pairs);
    if prefixes.len() != blocks.len() {
        invariant::raise(
            "segment",
            "prefix_block_mismatch",
            &format!("expected matching counts, got {} prefixes and {} blocks", prefixes.len(), blocks.len()),
        );
        return errdata!("expected the same number of prefixes and data blocks");
    }

    // Lay out the blocks: offsets are cumulative framed sizes, first keys carry the prefix.
    let mut block_offsets = Vec::with_capacity(blocks.len());
    let mut first_keys = Vec::with_capacity(blocks.len());
    let mut next_offset = 0i64;
    for (prefix, block) in prefixes.iter().zip(&blocks) {
        block_offsets.push(next_offset);
        next_offset += framed_len(block)? as i64;
        first_keys.push([prefix.as_slice(), block.keys[0].as_slice()].concat());
    }
    let last_block = &blocks[blocks.len() - 1];
    let last_key = [
        prefixes[prefixes.len() - 1].as_slice(),
        last_block.keys[last_block.keys.len() - 1].as_slice(),
    ]
    .concat();

    // Optionally build a bloom filter over the full key set.
    let bloom = if pairs.len() >= config.bloom_filter_min_keys {
        let rate = clamped_false_positive_rate(config.bloom_filter_false_positive_rate);
        let mut filter = BloomFilter::with_estimates(pairs.len(), rate);
        for (key, _) in pairs {
            filter.insert(key);
        }
        tracing::info!(
            path = %path.display(),
            num_keys = pairs.len(),
            num_bits = filter.num_bits(),
            num_hash_funcs = filter.num_hashes(),
            "constructed bloom filter for segment"
        );
        Some(filter.to_index())
    } else {
        None
    };

    let header = SegmentHeader {
        id: next_id,
        prev_id,
        bloom,
        skip_index: SkipIndex { prefixes, first_keys, last_key, block_offsets },
    };

    // Write everything into a temp file first. Dropping the temp file without persisting it
    // removes it, which covers all error paths below.
    let tmp = tempfile::Builder::new()
        .prefix("segment-")
        .suffix(".tmp")
        .tempfile_in(&config.temp_folder)?;
    let writer = BlockWriter::new(tmp);
    writer.write_block(&header)?;
    for block in &blocks {
        writer.write_block(block)?;
    }
    let tmp = writer.into_inner()?;

    if let Some(parent) = path.parent() {
        DirBuilder::new().recursive(true).mode(0o755).create(parent)?;
    }
    tmp.persist(path).map_err(|e| Error::from(e.error))?;
    Ok(())
}

struct SegmentFile {
    closed: bool,
    reader: BlockReader<File>,
}

/// A single immutable sorted segment on disk.
pub struct Segment {
    /// The table this segment belongs to, parsed from the parent directory name
    /// (e.g. 123 in `/data/123/456.sst`).
    table_id: i64,
    path: PathBuf,
    id: i64,
    prev_id: i64,
    skip_index: SkipIndex,
    /// Rebuilt from the header on open; the raw header copy is dropped.
    bloom: Option<BloomFilter>,
    /// Byte offset where the data block region starts, i.e. the framed header size.
    data_block_offset: u64,
    cache: BlockCache,
    /// Serializes reads and close. Reads perform file I/O under this lock.
    file: Mutex<SegmentFile>,
}

impl Segment {
    /// Opens a segment file, eagerly loading its header. The parent directory name is the
    /// table id.
    pub fn open(path: impl Into<PathBuf>, cache: BlockCache) -> Result<Self> {
        let path = path.into();
        tracing::debug!(path = %path.display(), "opening segment file");

        let dir_name = path
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let table_id: i64 = dir_name
            .parse()
            .map_err(|_| Error::InvalidInput(format!("failed to parse table id from directory {dir_name:?}")))?;
        if table_id <= 0 {
            return errinput!("expected a positive table id, got {table_id}");
        }

        let file = File::open(&path)?;
        let reader = BlockReader::new(file);
        let (mut header, data_block_offset): (SegmentHeader, u64) = reader
            .read_block(0)?
            .ok_or_else(|| Error::InvalidData(format!("segment {} has no header block", path.display())))?;
        if header.skip_index.first_keys.is_empty()
            || header.skip_index.first_keys.len() != header.skip_index.block_offsets.len()
            || header.skip_index.first_keys.len() != header.skip_index.prefixes.len()
        {
            return errdata!("segment {} has a malformed skip index", path.display());
        }

        // Instantiate the optional bloom filter and drop the header's raw copy.
        let bloom = header.bloom.take().as_ref().and_then(BloomFilter::from_index);
        if let Some(bloom) = &bloom {
            tracing::debug!(
                table_id,
                segment_id = header.id,
                num_bits = bloom.num_bits(),
                num_hash_funcs = bloom.num_hashes(),
                "loaded bloom filter for segment"
            );
        }

        Ok(Self {
            table_id,
            path,
            id: header.id,
            prev_id: header.prev_id,
            skip_index: header.skip_index,
            bloom,
            data_block_offset,
            cache,
            file: Mutex::new(SegmentFile { closed: false, reader }),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn prev_id(&self) -> i64 {
        self.prev_id
    }

    pub fn table_id(&self) -> i64 {
        self.table_id
    }

    /// Returns the value stored for the key in this segment, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let file = self.file.lock()?;
        if file.closed {
            return Err(Error::Closed);
        }

        // The key must fall within this segment's range at all.
        let index = &self.skip_index;
        if key < index.first_keys[0].as_slice() || key > index.last_key.as_slice() {
            return Ok(None);
        }

        // The bloom filter can prove the key is definitely not here. On false positives we
        // still scan the candidate block below.
        if let Some(bloom) = &self.bloom {
            if !bloom.contains(key) {
                return Ok(None);
            }
        }

        // Binary search for the candidate block: the last block whose first key is <= key.
        let block_index = match index.first_keys.binary_search_by(|first| first.as_slice().cmp(key)) {
            Ok(i) => i,
            // Key sorts before the first block, so it cannot be in this segment.
            Err(0) => return Ok(None),
            Err(i) => i - 1,
        };

        let offset = self.data_block_offset + index.block_offsets[block_index] as u64;
        let cache_key = BlockKey { table: self.table_id, segment: self.id, offset };
        let block = match self.cache.get(&cache_key) {
            Some(block) => block,
            None => {
                // Read from disk and populate the cache.
                let (block, _): (DataBlock, u64) = file.reader.read_block(offset)?.ok_or_else(|| {
                    Error::InvalidData(format!(
                        "segment {} is missing a data block at offset {offset}",
                        self.path.display()
                    ))
                })?;
                let block = Arc::new(block);
                self.cache.insert(cache_key, block.clone());
                block
            }
        };

        // Keys in the block are stored with the block prefix stripped.
        let suffix = key.strip_prefix(index.prefixes[block_index].as_slice()).unwrap_or(key);
        match block.keys.binary_search_by(|k| k.as_slice().cmp(suffix)) {
            Ok(i) => Ok(Some(block.values[i].clone())),
            Err(_) => Ok(None),
        }
    }

    /// The path of the previous segment in the chain, if any. A dangling link is reported
    /// as an invariant violation.
    pub fn prev_path(&self) -> Option<PathBuf> {
        if self.prev_id <= 0 {
            return None;
        }
        let prev = self.path.with_file_name(format!("{}.{SEGMENT_EXT}", self.prev_id));
        if !prev.exists() {
            invariant::raise(
                "segment",
                "missing_prev_segment",
                &format!("previous segment file {} does not exist", prev.display()),
            );
            return None;
        }
        Some(prev)
    }

    /// Closes the underlying file. A segment may only be closed once.
    pub fn close(&self) -> Result<()> {
        let mut file = self.file.lock()?;
        if file.closed {
            return Err(Error::Closed);
        }
        file.reader.close()?;
        file.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockCacheConfig;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path())
            .temp_folder(dir.path())
            .block_cache(BlockCacheConfig::disabled())
    }

    fn sorted_pairs() -> Vec<Pair> {
        let mut pairs: Vec<Pair> = [
            ("zed", "editor"),
            ("apple", "fruit"),
            ("carrot", "vegetable"),
            ("banana", "fruit"),
            ("zebra", "mammal"),
            ("broccoli", "vegetable"),
            ("cherry", "fruit"),
            ("charlie", "chaplin"),
            ("charlotte", "female"),
            ("bruce", "banner"),
        ]
        .iter()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
        pairs.sort();
        pairs
    }

    fn write_test_segment(dir: &TempDir, table_id: i64, prev_id: i64, next_id: i64, pairs: &[Pair]) -> PathBuf {
        let path = dir.path().join(table_id.to_string()).join(format!("{next_id}.{SEGMENT_EXT}"));
        write_segment(prev_id, next_id, &path, pairs, &test_config(dir)).expect("write_segment failed");
        path
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let pairs = sorted_pairs();
        let path = write_test_segment(&dir, 1, 0, 1, &pairs);

        let segment = Segment::open(&path, BlockCache::disabled()).expect("open failed");
        assert_eq!(segment.table_id(), 1);
        assert_eq!(segment.id(), 1);
        assert_eq!(segment.prev_id(), 0);

        for (key, value) in &pairs {
            assert_eq!(segment.get(key).unwrap(), Some(value.clone()), "missing key {key:?}");
        }
        for key in [b"notfound".as_slice(), b"never", b"404"] {
            assert_eq!(segment.get(key).unwrap(), None);
        }

        // Keys outside the segment range short-circuit before any block read.
        assert_eq!(segment.get(b"aaa").unwrap(), None);
        assert_eq!(segment.get(b"zzz").unwrap(), None);

        segment.close().unwrap();
    }

    #[test]
    fn test_empty_batch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1").join("1.sst");
        let result = write_segment(0, 1, &path, &[], &test_config(&dir));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_single_pair_segment() {
        let dir = TempDir::new().unwrap();
        let pairs = vec![(b"solo".to_vec(), b"value".to_vec())];
        let path = write_test_segment(&dir, 7, 0, 1, &pairs);

        let segment = Segment::open(&path, BlockCache::disabled()).unwrap();
        assert_eq!(segment.get(b"solo").unwrap(), Some(b"value".to_vec()));
        assert_eq!(segment.get(b"other").unwrap(), None);
        // A single pair makes one block with an empty prefix.
        assert_eq!(segment.skip_index.prefixes, vec![Vec::<u8>::new()]);
        assert_eq!(segment.skip_index.first_keys, vec![b"solo".to_vec()]);
        assert_eq!(segment.skip_index.last_key, b"solo".to_vec());
    }

    #[test]
    fn test_bloom_filter_inclusion_threshold() {
        let dir = TempDir::new().unwrap();
        let pairs = sorted_pairs();

        // Ten pairs is over the default threshold of five.
        let path = write_test_segment(&dir, 1, 0, 1, &pairs);
        let segment = Segment::open(&path, BlockCache::disabled()).unwrap();
        let bloom = segment.bloom.as_ref().expect("expected a bloom filter");
        for (key, _) in &pairs {
            assert!(bloom.contains(key));
        }

        // Two pairs is under the threshold.
        let path = write_test_segment(&dir, 2, 0, 1, &pairs[..2].to_vec());
        let segment = Segment::open(&path, BlockCache::disabled()).unwrap();
        assert!(segment.bloom.is_none());
        assert_eq!(segment.get(&pairs[0].0).unwrap(), Some(pairs[0].1.clone()));
    }

    #[test]
    fn test_invalid_bloom_rate_clamped() {
        let dir = TempDir::new().unwrap();
        let pairs = sorted_pairs();
        for rate in [0.0, 1.0, -0.5, 2.0] {
            let before = invariant::count("segment", "invalid_bloom_filter_rate");
            let config = test_config(&dir).bloom_filter_false_positive_rate(rate);
            let path = dir.path().join("3").join(format!("{}.sst", (rate * 10.0) as i64 + 20));
            write_segment(0, 1, &path, &pairs, &config).expect("write_segment failed");
            assert_eq!(invariant::count("segment", "invalid_bloom_filter_rate"), before + 1);
        }
    }

    #[test]
    fn test_skip_index_layout() {
        let dir = TempDir::new().unwrap();
        let pairs = sorted_pairs();
        let path = write_test_segment(&dir, 1, 0, 1, &pairs);
        let segment = Segment::open(&path, BlockCache::disabled()).unwrap();

        let index = &segment.skip_index;
        assert_eq!(index.first_keys[0], b"apple".to_vec());
        assert_eq!(index.last_key, b"zed".to_vec());
        // First keys are strictly increasing and offsets start at zero.
        assert!(index.first_keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(index.block_offsets[0], 0);
        assert!(index.block_offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_prev_path() {
        let dir = TempDir::new().unwrap();
        let pairs = sorted_pairs();

        let first = write_test_segment(&dir, 1, 0, 1, &pairs);
        let second = write_test_segment(&dir, 1, 1, 2, &pairs);

        let head = Segment::open(&first, BlockCache::disabled()).unwrap();
        assert_eq!(head.prev_path(), None);

        let tail = Segment::open(&second, BlockCache::disabled()).unwrap();
        assert_eq!(tail.prev_path(), Some(first.clone()));

        // A dangling link is an invariant violation.
        std::fs::remove_file(&first).unwrap();
        let before = invariant::count("segment", "missing_prev_segment");
        assert_eq!(tail.prev_path(), None);
        assert_eq!(invariant::count("segment", "missing_prev_segment"), before + 1);
    }

    #[test]
    fn test_close_is_terminal() {
        let dir = TempDir::new().unwrap();
        let path = write_test_segment(&dir, 1, 0, 1, &sorted_pairs());
        let segment = Segment::open(&path, BlockCache::disabled()).unwrap();

        segment.close().unwrap();
        assert_eq!(segment.close(), Err(Error::Closed));
        assert_eq!(segment.get(b"apple"), Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_block_cache_population() {
        let dir = TempDir::new().unwrap();
        let pairs = sorted_pairs();
        let path = write_test_segment(&dir, 1, 0, 1, &pairs);

        let cache = BlockCache::new(&BlockCacheConfig::default().shard_count(1).capacity(16));
        let segment = Segment::open(&path, cache.clone()).unwrap();
        assert!(cache.is_empty());

        // The first read misses and populates the cache; the repeat is served from it.
        assert_eq!(segment.get(b"apple").unwrap(), Some(b"fruit".to_vec()));
        let populated = cache.len();
        assert!(populated > 0);
        assert_eq!(segment.get(b"apple").unwrap(), Some(b"fruit".to_vec()));
        assert_eq!(cache.len(), populated);

        cache.shutdown().await;
    }

    #[test]
    fn test_non_numeric_table_dir_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-a-number").join("1.sst");
        write_segment(0, 1, &path, &sorted_pairs(), &test_config(&dir)).unwrap();
        let result = Segment::open(&path, BlockCache::disabled());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
