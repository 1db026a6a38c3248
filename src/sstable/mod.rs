//! On-disk segment storage. A table is a chain of immutable segment files, each holding a
//! sorted subset of the table's pairs: a header block (ids, skip index, optional bloom
//! filter) followed by prefix-compressed data blocks. The header is eagerly loaded when a
//! segment is opened; data blocks are read on demand and cached in the shared block cache.

pub mod block_cache;
pub mod blockio;
pub mod compress;
pub mod filter;
pub mod table;

pub use block_cache::{BlockCache, BlockKey};
pub use table::{write_segment, Segment};

use serde::{Deserialize, Serialize};

/// A key-value pair of raw bytes.
pub type Pair = (Vec<u8>, Vec<u8>);

/// One prefix-compressed run of pairs. Keys are stored with the block's shared prefix
/// stripped, in ascending order, index-aligned with their values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlock {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
}

/// Bloom filter state for a segment's full key set, transported as raw 64-bit words so the
/// filter can be rebuilt exactly as written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilterIndex {
    pub num_bits: u64,
    pub num_hash_funcs: u64,
    pub bit_array: Vec<u64>,
}

/// The per-block lookup index stored in a segment header. `first_keys[i]` is the full first
/// key of block `i` (prefix included), strictly increasing; `block_offsets[i]` is the block's
/// byte offset relative to the start of the data block region.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipIndex {
    pub prefixes: Vec<Vec<u8>>,
    pub first_keys: Vec<Vec<u8>>,
    pub last_key: Vec<u8>,
    pub block_offsets: Vec<i64>,
}

/// The header block written at offset 0 of every segment file. `prev_id` of 0 marks the
/// start of the chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub id: i64,
    pub prev_id: i64,
    pub bloom: Option<BloomFilterIndex>,
    pub skip_index: SkipIndex,
}
