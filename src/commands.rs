//! The store surface exposed to protocol adapters: GET/SET/DEL with Redis semantics layered
//! over the LSM tree. Values are packed with tombstone and expiry flags before they reach
//! the storage layer, and unpacked (with tombstones and expired records filtered) on the way
//! out.

use std::sync::RwLock;

use crate::config::StoreConfig;
use crate::errinput;
use crate::error::Result;
use crate::store::LsmTree;
use crate::value::{self, Value};

/// The single logical table a database instance manages.
const DEFAULT_TABLE_ID: i64 = 1;

/// The existence precondition of a SET command. The default is no check; NX and XX must be
/// requested explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Existence {
    /// Set unconditionally.
    #[default]
    None,
    /// NX: set only when the key has no live value.
    IfNotExists,
    /// XX: set only when the key has a live value.
    IfExists,
}

/// A SET command with its Redis options.
#[derive(Clone, Debug, Default)]
pub struct SetCommand {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Absolute expiry in nanoseconds since the Unix epoch (from EX/PX/EXAT/PXAT).
    pub expires_at: Option<i64>,
    pub existence: Existence,
    /// KEEPTTL: carry the previous record's expiry onto the new value. Mutually exclusive
    /// with an explicit expiry.
    pub keep_ttl: bool,
    /// GET: return the previous value.
    pub get: bool,
}

impl SetCommand {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into(), ..Default::default() }
    }

    pub fn expires_at(mut self, at: i64) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn existence(mut self, existence: Existence) -> Self {
        self.existence = existence;
        self
    }

    pub fn keep_ttl(mut self) -> Self {
        self.keep_ttl = true;
        self
    }

    pub fn get_previous(mut self) -> Self {
        self.get = true;
        self
    }
}

/// The outcome of a SET command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetResult {
    /// The previous live value, populated only when the command requested GET.
    pub previous: Option<Vec<u8>>,
    /// Whether the value was written. False when an NX/XX precondition refused the write.
    pub could_set: bool,
}

/// A database over one LSM table, applying Redis value semantics. Operations that read
/// before writing (SET with options, DEL) run under the exclusive lock so their
/// read-modify-write is atomic.
pub struct Database {
    inner: RwLock<LsmTree>,
}

impl Database {
    /// Opens the default table under the configured data directory.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_table(DEFAULT_TABLE_ID, config)
    }

    /// Opens a specific table. A database instance manages exactly one table.
    pub fn open_table(table_id: i64, config: StoreConfig) -> Result<Self> {
        Ok(Self { inner: RwLock::new(LsmTree::open(table_id, config)?) })
    }

    /// Returns the live value for a key. Tombstoned and expired records read as absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read()?;
        let Some(packed) = inner.get(key)? else {
            return Ok(None);
        };
        let unpacked = Value::unpack(&packed)?;
        if unpacked.is_tombstone() || unpacked.is_expired(value::now_nanos()) {
            return Ok(None);
        }
        Ok(Some(unpacked.into_data()))
    }

    /// Executes a SET command and returns the previous value when requested.
    pub fn set(&self, cmd: SetCommand) -> Result<SetResult> {
        if cmd.keep_ttl && cmd.expires_at.is_some() {
            return errinput!("KEEPTTL cannot be combined with an explicit expiry");
        }

        let inner = self.inner.write()?;
        let now = value::now_nanos();

        // Fetch the previous record only when an option needs it. Tombstones and expired
        // records count as non-existent for the NX/XX checks and for KEEPTTL.
        let mut previous: Option<Value> = None;
        if cmd.existence != Existence::None || cmd.keep_ttl || cmd.get {
            if let Some(packed) = inner.get(&cmd.key)? {
                let unpacked = Value::unpack(&packed)?;
                if !unpacked.is_tombstone() && !unpacked.is_expired(now) {
                    previous = Some(unpacked);
                }
            }
        }

        // Build the record to store: KEEPTTL carries a live previous expiry, otherwise an
        // explicit expiry applies, otherwise the value is plain.
        let carried_expiry = if cmd.keep_ttl {
            previous.as_ref().and_then(Value::expiry)
        } else {
            None
        };
        let record = match carried_expiry.or(cmd.expires_at) {
            Some(expires_at) => Value::expirable(cmd.value, expires_at),
            None => Value::plain(cmd.value),
        };

        let could_set = match cmd.existence {
            Existence::None => true,
            Existence::IfNotExists => previous.is_none(),
            Existence::IfExists => previous.is_some(),
        };
        if could_set {
            inner.set(&cmd.key, record.pack())?;
        }

        if cmd.get {
            return Ok(SetResult { previous: previous.map(Value::into_data), could_set });
        }
        Ok(SetResult { previous: None, could_set })
    }

    /// Deletes a key by swapping in a tombstone. Returns whether a live value was removed;
    /// a previous tombstone or expired record reads as false, matching DEL's count of 0 for
    /// already-deleted keys.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let inner = self.inner.write()?;
        let Some(packed) = inner.swap(key, Value::tombstone().pack())? else {
            return Ok(false);
        };
        let unpacked = Value::unpack(&packed)?;
        Ok(!unpacked.is_tombstone() && !unpacked.is_expired(value::now_nanos()))
    }

    /// Flushes and releases all resources, consuming the database.
    pub async fn close(self) -> Result<()> {
        self.inner.into_inner()?.close().await
    }
}
