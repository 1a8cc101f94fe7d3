//! Transaction log.
//!
//! A single append-only file shared by a read path and a write path that use
//! different handles, generalized from fixed key/value entries to three
//! segment kinds (VERSION, RECORD, STREAM). Segment framing is a
//! length-prefixed TLV, independent of however the in-memory values were
//! encoded, as long as segment ordering, the raw STREAM tail, and reference
//! tokens survive a round trip.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;
use memmap2::Mmap;
use serde_derive::{Deserialize, Serialize};

use crate::error::{DResult, Error};
use crate::oid::{Oid, Timestamp};
use crate::value::State;

const VERSION_TAG: u8 = 0;
const RECORD_TAG: u8 = 1;
const STREAM_TAG: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub oid: Oid,
    pub class_name: String,
    pub state: State,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEntry {
    pub timestamp: Timestamp,
    pub status: TxStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamHeader {
    name: String,
    length: u64,
}

/// One committed-or-aborted transaction's worth of versions, as yielded by
/// the read path: a lazy sequence of (record, versions-since-previous-record)
/// pairs.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub record: RecordEntry,
    pub versions: Vec<VersionEntry>,
}

/// Handle to the in-progress write side of a transaction: an in-memory
/// buffer that accumulates framed segments until `finish`/`abort` flushes
/// them in one write plus the trailing RECORD.
pub struct WriteHandle {
    file: File,
    buffer: Vec<u8>,
    /// File length observed at `begin()`, before this transaction's bytes.
    /// Lets `write_stream` compute an absolute file offset for its raw
    /// bytes without flushing early.
    base_len: u64,
}

pub struct TransactionLog {
    path: PathBuf,
    write: Mutex<Option<WriteHandle>>,
    /// Post-record file offset indexed by the record's commit timestamp,
    /// so a thread that already observed timestamp T can resume reading
    /// from exactly where it left off.
    offsets: RwLock<BTreeMap<Timestamp, u64>>,
}

fn write_frame(buf: &mut Vec<u8>, tag: u8, payload: &[u8]) -> DResult<()> {
    buf.write_u8(tag)?;
    buf.write_u32::<BigEndian>(payload.len() as u32)?;
    buf.extend_from_slice(payload);
    Ok(())
}

impl TransactionLog {
    pub fn open(path: impl Into<PathBuf>) -> DResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        // Touch the file into existence so the read path can always mmap
        // it, even before any transaction has committed.
        OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        Ok(TransactionLog { path, write: Mutex::new(None), offsets: RwLock::new(BTreeMap::new()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the write handle and takes the advisory commit lock
    /// non-blockingly. Lock contention is reported as a retryable error.
    pub fn begin(&self) -> DResult<()> {
        let mut slot = self.write.lock().unwrap();
        if slot.is_some() {
            return Err(Error::Runtime("transaction log already has an open write handle".into()));
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.try_lock_exclusive().map_err(Error::retryable_io)?;
        let base_len = file.metadata()?.len();
        *slot = Some(WriteHandle { file, buffer: Vec::new(), base_len });
        Ok(())
    }

    pub fn write_version(&self, oid: Oid, class_name: &str, state: &State) -> DResult<()> {
        let entry = VersionEntry { oid, class_name: class_name.to_string(), state: state.clone() };
        let mut slot = self.write.lock().unwrap();
        let handle = slot.as_mut().ok_or_else(|| Error::Runtime("write_version outside a transaction".into()))?;
        match bincode::serialize(&entry) {
            Ok(payload) => write_frame(&mut handle.buffer, VERSION_TAG, &payload),
            Err(err) => {
                // Flush whatever already serialized cleanly so the log
                // stays self-describing up to this point, then propagate:
                // the RECORD never gets written this round, so replay
                // treats the buffered versions as orphaned.
                Self::flush_locked(handle)?;
                Err(Error::Encoding(err))
            }
        }
    }

    /// Streams `length` bytes directly from `source` into the log, bypassing
    /// any object serializer. Returns the absolute file
    /// offset of the first raw byte, for the caller to mint a `file://`
    /// token pointing back at this exact range.
    pub fn write_stream(&self, name: &str, length: u64, source: &mut dyn Read) -> DResult<u64> {
        let header = StreamHeader { name: name.to_string(), length };
        let payload = bincode::serialize(&header)?;
        let mut slot = self.write.lock().unwrap();
        let handle = slot.as_mut().ok_or_else(|| Error::Runtime("write_stream outside a transaction".into()))?;
        write_frame(&mut handle.buffer, STREAM_TAG, &payload)?;
        let data_offset = handle.base_len + handle.buffer.len() as u64;
        let mut remaining = length;
        let mut chunk = [0u8; 32 * 1024];
        while remaining > 0 {
            let want = remaining.min(chunk.len() as u64) as usize;
            source.read_exact(&mut chunk[..want])?;
            handle.buffer.extend_from_slice(&chunk[..want]);
            remaining -= want as u64;
        }
        Ok(data_offset)
    }

    fn flush_locked(handle: &mut WriteHandle) -> DResult<()> {
        handle.file.seek(SeekFrom::End(0))?;
        handle.file.write_all(&handle.buffer)?;
        handle.file.flush()?;
        handle.file.sync_data()?;
        handle.buffer.clear();
        Ok(())
    }

    fn finish_inner(&self, timestamp: Timestamp, status: TxStatus) -> DResult<u64> {
        let mut slot = self.write.lock().unwrap();
        let mut handle = slot.take().ok_or_else(|| Error::Runtime("finish outside a transaction".into()))?;
        let record = RecordEntry { timestamp, status };
        let payload = bincode::serialize(&record)?;
        write_frame(&mut handle.buffer, RECORD_TAG, &payload)?;
        Self::flush_locked(&mut handle)?;
        let offset = handle.file.metadata()?.len();
        handle.file.unlock()?;
        self.offsets.write().unwrap().insert(timestamp, offset);
        Ok(offset)
    }

    pub fn finish(&self, timestamp: Timestamp) -> DResult<u64> {
        self.finish_inner(timestamp, TxStatus::Committed)
    }

    pub fn abort(&self, timestamp: Timestamp) -> DResult<u64> {
        self.finish_inner(timestamp, TxStatus::Aborted)
    }

    /// Looks up the byte offset just past the RECORD for `timestamp`.
    pub fn offset_for(&self, timestamp: Timestamp) -> DResult<u64> {
        self.offsets
            .read()
            .unwrap()
            .get(&timestamp)
            .copied()
            .ok_or_else(|| Error::Integrity(format!("unknown timestamp {timestamp}")))
    }

    pub fn remember_offset(&self, timestamp: Timestamp, offset: u64) {
        self.offsets.write().unwrap().insert(timestamp, offset);
    }

    /// Opens a fresh read-only view of the log starting at `from_timestamp`
    /// (or the start of the file if `None`).
    pub fn reader(&self, from_timestamp: Option<Timestamp>) -> DResult<LogReader> {
        let start = match from_timestamp {
            None => 0,
            Some(ts) => self.offset_for(ts)?,
        };
        let file = File::open(&self.path)?;
        // Safety: the log file is append-only and never truncated or
        // rewritten in place; readers bound themselves to the snapshot
        // length taken at map time.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(LogReader { mmap, pos: start as usize })
    }
}

/// Lazy iterator over `(record, versions)` pairs, advancing a cursor over a
/// memory-mapped snapshot of the log.
pub struct LogReader {
    mmap: Mmap,
    pos: usize,
}

impl LogReader {
    /// Number of VERSION segments seen past the last RECORD with no
    /// terminating RECORD yet — used to build the integrity error when the
    /// iterator runs off the end of the file mid-transaction.
    pub fn next_entry(&mut self) -> DResult<Option<LogEntry>> {
        let mut scratch = Vec::new();
        loop {
            if self.pos >= self.mmap.len() {
                if scratch.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Integrity(format!(
                    "{} version segment(s) with no trailing record at end of log",
                    scratch.len()
                )));
            }
            let mut cursor = &self.mmap[self.pos..];
            let tag = cursor.read_u8().map_err(|_| Error::Integrity("truncated segment tag".into()))?;
            let len = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| Error::Integrity("truncated segment length".into()))? as usize;
            let header_len = 1 + 4;
            if self.pos + header_len + len > self.mmap.len() {
                return Err(Error::Integrity("segment payload extends past end of file".into()));
            }
            let payload = &self.mmap[self.pos + header_len..self.pos + header_len + len];
            self.pos += header_len + len;

            match tag {
                VERSION_TAG => {
                    let entry: VersionEntry = bincode::deserialize(payload)?;
                    scratch.push(entry);
                }
                RECORD_TAG => {
                    let record: RecordEntry = bincode::deserialize(payload)?;
                    return Ok(Some(LogEntry { record, versions: std::mem::take(&mut scratch) }));
                }
                STREAM_TAG => {
                    let header: StreamHeader = bincode::deserialize(payload)?;
                    let skip = header.length as usize;
                    if self.pos + skip > self.mmap.len() {
                        return Err(Error::Integrity("stream segment extends past end of file".into()));
                    }
                    self.pos += skip;
                }
                other => return Err(Error::Integrity(format!("unknown segment tag {other}"))),
            }
        }
    }
}

impl Iterator for LogReader {
    type Item = DResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
