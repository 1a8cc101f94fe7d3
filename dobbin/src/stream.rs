//! Persistent file / stream handling.
//!
//! Before commit, a `PersistentSource` wraps an open byte source (anything
//! `Read`) that gets streamed straight into the log, bypassing the owning
//! object's serialized state entirely. After commit its identity is swapped
//! in place for a `PersistentStream`, a read-only handle into a fixed byte
//! range of the log file. Cloning a `PersistentStream` is a reference copy.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{DResult, Error};

/// Default chunk size for restartable iteration.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// A not-yet-persisted byte source assigned to a persistent attribute.
/// `name` is advisory (surfaced in the STREAM segment, useful for
/// debugging); it plays no role in lookup, which is purely offset/length.
pub struct PersistentSource {
    name: String,
    source: Box<dyn Read + Send>,
    length: u64,
}

impl PersistentSource {
    pub fn new(name: impl Into<String>, length: u64, source: impl Read + Send + 'static) -> Self {
        PersistentSource { name: name.into(), source: Box::new(source), length }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        PersistentSource { name: name.into(), source: Box::new(std::io::Cursor::new(bytes)), length }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn into_reader(self) -> (String, u64, Box<dyn Read + Send>) {
        (self.name, self.length, self.source)
    }
}

/// A persisted, immutable byte range within the transaction log. Supports
/// random access via a per-thread file handle and restartable chunked
/// iteration that always opens its own descriptor.
#[derive(Clone)]
pub struct PersistentStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    log_path: PathBuf,
    offset: u64,
    length: u64,
}

impl PersistentStream {
    pub(crate) fn new(log_path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        PersistentStream { inner: Arc::new(StreamInner { log_path: log_path.into(), offset, length }) }
    }

    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    pub fn length(&self) -> u64 {
        self.inner.length
    }

    fn log_path(&self) -> &Path {
        &self.inner.log_path
    }

    /// Opens a fresh random-access handle positioned at the start of this
    /// stream's range. Each handle is independent; there is no shared seek
    /// position across threads.
    pub fn open(&self) -> DResult<StreamHandle> {
        let mut file = File::open(self.log_path())?;
        file.seek(SeekFrom::Start(self.inner.offset))?;
        Ok(StreamHandle { stream: self.clone(), file, pos: 0, closed: false })
    }

    /// A restartable chunked iterator: every call to `chunks` opens a new
    /// file descriptor, so dropping one iterator mid-read never disturbs
    /// another; dropping the iterator simply drops the underlying handle.
    pub fn chunks(&self, chunk_size: usize) -> DResult<ChunkIter> {
        let handle = self.open()?;
        Ok(ChunkIter { handle, chunk_size: chunk_size.max(1) })
    }
}

/// Per-thread random-access handle into a `PersistentStream`.
pub struct StreamHandle {
    stream: PersistentStream,
    file: File,
    pos: u64,
    closed: bool,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.closed = true;
    }
}

impl StreamHandle {
    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, offset: u64) -> DResult<()> {
        if self.closed {
            return Err(Error::Runtime("seek on a closed stream handle".into()));
        }
        if offset > self.stream.length() {
            return Err(Error::Runtime("seek past end of stream".into()));
        }
        self.file.seek(SeekFrom::Start(self.stream.offset() + offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Reads up to `size` bytes, or the remainder of the stream if `size`
    /// is `None`.
    pub fn read(&mut self, size: Option<usize>) -> DResult<Vec<u8>> {
        if self.closed {
            return Err(Error::Runtime("read on a closed stream handle".into()));
        }
        let remaining = self.stream.length() - self.pos;
        let want = size.map(|s| s as u64).unwrap_or(remaining).min(remaining) as usize;
        let mut buf = vec![0u8; want];
        self.file.read_exact(&mut buf)?;
        self.pos += want as u64;
        Ok(buf)
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// Restartable chunked iterator over a `PersistentStream`'s bytes.
pub struct ChunkIter {
    handle: StreamHandle,
    chunk_size: usize,
}

impl Iterator for ChunkIter {
    type Item = DResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.handle.closed || self.handle.pos >= self.handle.stream.length() {
            return None;
        }
        let remaining = (self.handle.stream.length() - self.handle.pos) as usize;
        let want = remaining.min(self.chunk_size);
        match self.handle.read(Some(want)) {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => Some(Ok(chunk)),
            Err(err) => Some(Err(err)),
        }
    }
}
