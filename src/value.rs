//! Values are packed into a single byte string before being handed to the storage layer:
//! a one-byte flags field followed by a payload.
//!
//! 1. Tombstone: a marker for a deleted key. Keys cannot be removed from immutable segments,
//!    so deletion writes a tombstone that shadows older values until compaction drops both.
//! 2. Plain: the value bytes with no expiration.
//! 3. Expirable: the value bytes followed by the expiry as a big-endian i64 of nanoseconds
//!    since the Unix epoch (UTC). Expired keys are filtered on read.

use byteorder::{BigEndian, ByteOrder};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errdata;
use crate::error::Result;

/// Option bits stored in the leading flags byte of a packed value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Opts(u8);

impl Opts {
    pub const NONE: Opts = Opts(0);
    pub const TOMBSTONE: Opts = Opts(1);
    pub const EXPIRABLE: Opts = Opts(1 << 1);

    /// Returns true if any of the given options are toggled in the current options.
    pub fn is(self, opts: Opts) -> bool {
        self.0 & opts.0 != 0
    }
}

/// A value unpacked from (or about to be packed into) the storage format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    opts: Opts,
    data: Vec<u8>,
    expires_at: i64,
}

impl Value {
    /// A plain value with no expiration.
    pub fn plain(data: Vec<u8>) -> Self {
        Self { opts: Opts::NONE, data, expires_at: 0 }
    }

    /// A deletion marker.
    pub fn tombstone() -> Self {
        Self { opts: Opts::TOMBSTONE, data: Vec::new(), expires_at: 0 }
    }

    /// A value that expires at the given nanosecond Unix timestamp.
    pub fn expirable(data: Vec<u8>, expires_at: i64) -> Self {
        Self { opts: Opts::EXPIRABLE, data, expires_at }
    }

    pub fn is_tombstone(&self) -> bool {
        self.opts.is(Opts::TOMBSTONE)
    }

    /// The expiry timestamp, when this value carries one.
    pub fn expiry(&self) -> Option<i64> {
        self.opts.is(Opts::EXPIRABLE).then_some(self.expires_at)
    }

    /// Whether this value has expired as of `now` (nanoseconds since the Unix epoch).
    pub fn is_expired(&self, now: i64) -> bool {
        self.opts.is(Opts::EXPIRABLE) && now > self.expires_at
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes the options and payload into a single byte string.
    pub fn pack(&self) -> Vec<u8> {
        if self.opts.is(Opts::TOMBSTONE) {
            return vec![self.opts.0];
        }
        let mut size = 1 + self.data.len();
        if self.opts.is(Opts::EXPIRABLE) {
            size += 8;
        }
        let mut buffer = Vec::with_capacity(size);
        buffer.push(self.opts.0);
        buffer.extend_from_slice(&self.data);
        if self.opts.is(Opts::EXPIRABLE) {
            let mut expiry = [0u8; 8];
            BigEndian::write_i64(&mut expiry, self.expires_at);
            buffer.extend_from_slice(&expiry);
        }
        buffer
    }

    /// Deserializes a packed byte string.
    pub fn unpack(packed: &[u8]) -> Result<Value> {
        if packed.is_empty() {
            return errdata!("packed value is empty");
        }
        let opts = Opts(packed[0]);
        if opts.is(Opts::TOMBSTONE) {
            return Ok(Value::tombstone());
        }
        if opts.is(Opts::EXPIRABLE) {
            if packed.len() < 1 + 8 {
                return errdata!("packed value is too short to contain an expiry");
            }
            let expires_at = BigEndian::read_i64(&packed[packed.len() - 8..]);
            return Ok(Value::expirable(packed[1..packed.len() - 8].to_vec(), expires_at));
        }
        Ok(Value::plain(packed[1..].to_vec()))
    }
}

/// The current wall clock as nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// The nanosecond Unix timestamp at the given duration from now.
pub fn nanos_from_now(duration: Duration) -> i64 {
    now_nanos() + duration.as_nanos() as i64
}
