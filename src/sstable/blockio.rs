//! Framed block I/O. Segment files are a sequence of serialized messages, each prefixed by
//! its size as a fixed 8-byte little-endian integer. The writer buffers output in a 4 KiB
//! buffer; the reader supports random access so data blocks can be fetched by offset.

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Mutex;

use crate::errdata;
use crate::error::{Error, Result};
use crate::invariant;

/// Matches the typical OS page size to reduce the number of write syscalls.
const BUFFER_SIZE: usize = 4096;

/// The on-disk size of a message once framed: the 8-byte length prefix plus the payload.
pub fn framed_len<M: Serialize>(msg: &M) -> Result<u64> {
    Ok(8 + bincode::serialized_size(msg)?)
}

/// Positioned reads into a byte source. Implementations must be usable from multiple threads
/// without an exclusive borrow.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

struct WriterState<W: Write> {
    /// None once the writer has been closed.
    sink: Option<W>,
    buffer: Vec<u8>,
}

/// Writes framed messages to an underlying sink. Safe to share across threads; all writes
/// are serialized through an internal mutex.
pub struct BlockWriter<W: Write> {
    state: Mutex<WriterState<W>>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            state: Mutex::new(WriterState {
                sink: Some(sink),
                buffer: Vec::with_capacity(BUFFER_SIZE),
            }),
        }
    }

    /// Serializes the message and writes its length followed by its bytes.
    pub fn write_block<M: Serialize>(&self, msg: &M) -> Result<()> {
        let payload = bincode::serialize(msg)?;
        let mut state = self.state.lock()?;
        if state.sink.is_none() {
            return Err(Error::Closed);
        }
        let mut size = [0u8; 8];
        LittleEndian::write_u64(&mut size, payload.len() as u64);
        Self::write_bytes(&mut state, &size)?;
        Self::write_bytes(&mut state, &payload)?;
        Ok(())
    }

    fn write_bytes(state: &mut WriterState<W>, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let available = BUFFER_SIZE - state.buffer.len();
            let take = available.min(bytes.len() - written);
            state.buffer.extend_from_slice(&bytes[written..written + take]);
            written += take;
            if state.buffer.len() == BUFFER_SIZE {
                Self::flush_buffer(state)?;
            }
        }
        Ok(())
    }

    fn flush_buffer(state: &mut WriterState<W>) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let sink = state.sink.as_mut().ok_or(Error::Closed)?;
        sink.write_all(&state.buffer)?;
        state.buffer.clear();
        Ok(())
    }

    /// Flushes the buffered tail and closes the underlying sink.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.sink.is_none() {
            return Err(Error::Closed);
        }
        Self::flush_buffer(&mut state)?;
        let mut sink = state.sink.take().ok_or(Error::Closed)?;
        sink.flush()?;
        Ok(())
    }

    /// Flushes all buffered data and hands the sink back, for callers that still need it
    /// (e.g. to persist a temp file).
    pub fn into_inner(self) -> Result<W> {
        let mut state = self.state.into_inner()?;
        if state.sink.is_none() {
            return Err(Error::Closed);
        }
        Self::flush_buffer(&mut state)?;
        let mut sink = state.sink.take().ok_or(Error::Closed)?;
        sink.flush()?;
        Ok(sink)
    }
}

/// Reads framed messages from a random-access source. Safe to share across threads; reads
/// are serialized through an internal mutex.
pub struct BlockReader<R: ReadAt> {
    source: R,
    closed: Mutex<bool>,
}

impl<R: ReadAt> BlockReader<R> {
    pub fn new(source: R) -> Self {
        Self { source, closed: Mutex::new(false) }
    }

    /// Reads and decodes the message at the given offset, returning it together with the
    /// offset of the next block. Returns None on a clean end-of-file at the size prefix,
    /// which is the normal termination for sequential scans. A payload shorter than its
    /// size prefix is corruption, not end-of-file.
    pub fn read_block<M: DeserializeOwned>(&self, offset: u64) -> Result<Option<(M, u64)>> {
        let closed = self.closed.lock()?;
        if *closed {
            return Err(Error::Closed);
        }

        let mut size_buf = [0u8; 8];
        let n = read_full(&self.source, &mut size_buf, offset)?;
        if n == 0 {
            return Ok(None);
        }
        if n < size_buf.len() {
            invariant::raise(
                "blockio",
                "truncated_size_prefix",
                &format!("read {n} of 8 size prefix bytes at offset {offset}"),
            );
            return errdata!("truncated block size prefix at offset {offset}");
        }

        let size = LittleEndian::read_u64(&size_buf);
        let mut payload = vec![0u8; size as usize];
        let read = read_full(&self.source, &mut payload, offset + 8)?;
        if (read as u64) < size {
            invariant::raise(
                "blockio",
                "incomplete_read",
                &format!("read an incomplete block: expected {size} bytes, got {read}"),
            );
            return errdata!("incomplete block read at offset {offset}: expected {size} bytes, got {read}");
        }

        let msg = bincode::deserialize(&payload)?;
        Ok(Some((msg, offset + 8 + size)))
    }

    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock()?;
        if *closed {
            return Err(Error::Closed);
        }
        *closed = true;
        Ok(())
    }
}

/// Reads until the buffer is full or the source is exhausted, returning the bytes read.
fn read_full<R: ReadAt>(source: &R, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match source.read_at(&mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}
