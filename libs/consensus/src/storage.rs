//! Durable storage for the log and the term/vote record
//!
//! Every write must be on stable storage before the call returns: a reply
//! sent on the basis of unflushed state could be forgotten by a crash.

use crate::state::PersistentState;
use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for durable storage backends
///
/// A store is owned by exactly one node. Implementations must ensure
/// durability (fsync or equivalent) before returning from a write.
pub trait PersistentStore: Send + 'static {
    /// Append entries to the log, first removing every entry with an index
    /// strictly greater than `truncate_after` when it is given.
    ///
    /// Appended entries must continue the log contiguously.
    fn append_entries(&mut self, entries: &[Entry], truncate_after: Option<LogIndex>)
        -> Result<()>;

    /// Durably record the current term and the vote cast in it
    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    /// Load everything that has been made durable
    fn read_all(&self) -> Result<PersistentState>;
}

/// Check that `entries` continue a log whose last index is `last`
fn check_contiguous(last: LogIndex, entries: &[Entry]) -> Result<()> {
    let mut expected = last.next();
    for entry in entries {
        if entry.index != expected {
            return Err(RaftError::Internal(format!(
                "non-contiguous append: expected {}, got {}",
                expected, entry.index
            )));
        }
        expected.increment();
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: PersistentState,
    fail_writes: bool,
}

/// In-memory store for tests and simulations
///
/// Clones share the same underlying state, so a test can keep a clone,
/// drop the node ("crash"), and start a new node on the surviving state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    fn check_writable(inner: &MemoryInner) -> Result<()> {
        if inner.fail_writes {
            return Err(RaftError::Storage(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn append_entries(
        &mut self,
        entries: &[Entry],
        truncate_after: Option<LogIndex>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;

        let log = &mut inner.state.log;
        let keep = truncate_after.map_or(log.len(), |after| (after.0 as usize).min(log.len()));
        let last = log[..keep].last().map(|e| e.index).unwrap_or(LogIndex::ZERO);
        check_contiguous(last, entries)?;
        log.truncate(keep);
        log.extend_from_slice(entries);
        Ok(())
    }

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.state.current_term = term;
        inner.state.voted_for = voted_for;
        Ok(())
    }

    fn read_all(&self) -> Result<PersistentState> {
        Ok(self.inner.lock().state.clone())
    }
}

/// Term and vote record, kept as a small JSON document
#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    current_term: Term,
    voted_for: Option<NodeId>,
}

/// Length prefix of every log frame
const FRAME_HEADER: usize = 4;

/// File-backed store
///
/// Layout inside the data directory:
/// - `meta.json`: term and vote, replaced atomically (write temp, fsync, rename)
/// - `log.bin`: append-only frames of `u32 length || bincode(Entry)`
///
/// Truncation only ever cuts the tail of `log.bin`.
pub struct FileStore {
    dir: PathBuf,
    log_file: File,
    /// Byte offset of each entry's frame; `offsets[i]` is entry `i + 1`
    offsets: Vec<u64>,
    /// End of the last complete frame
    end: u64,
}

impl FileStore {
    /// Open (or create) a store in `dir`
    ///
    /// A partially written final frame left by a crash is discarded.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("log.bin"))?;

        let (entries, offsets, end) = Self::scan(&mut log_file)?;
        let file_len = log_file.metadata()?.len();
        if file_len > end {
            warn!(
                dir = %dir.display(),
                discarded = file_len - end,
                "Discarding torn tail of log file"
            );
            log_file.set_len(end)?;
            log_file.sync_all()?;
        }

        debug!(dir = %dir.display(), entries = entries.len(), "Opened file store");

        Ok(Self {
            dir,
            log_file,
            offsets,
            end,
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    /// Decode every complete frame, returning the entries, their offsets and
    /// the end of the last complete frame.
    fn scan(file: &mut File) -> Result<(Vec<Entry>, Vec<u64>, u64)> {
        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;

        let mut buf = &raw[..];
        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos = 0u64;

        while buf.remaining() >= FRAME_HEADER {
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if buf.remaining() < FRAME_HEADER + len {
                break;
            }
            buf.advance(FRAME_HEADER);
            let entry: Entry = match bincode::deserialize(&buf[..len]) {
                Ok(entry) => entry,
                // A frame whose length was written but whose body was not
                Err(_) if buf.remaining() == len => break,
                Err(e) => return Err(RaftError::Codec(e.to_string())),
            };
            buf.advance(len);

            let expected = LogIndex(entries.len() as u64 + 1);
            if entry.index != expected {
                return Err(RaftError::Storage(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("log file out of order: expected {}, found {}", expected, entry.index),
                )));
            }

            offsets.push(pos);
            pos += (FRAME_HEADER + len) as u64;
            entries.push(entry);
        }

        Ok((entries, offsets, pos))
    }

    fn last_index(&self) -> LogIndex {
        LogIndex(self.offsets.len() as u64)
    }

    fn sync_dir(&self) -> io::Result<()> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl PersistentStore for FileStore {
    fn append_entries(
        &mut self,
        entries: &[Entry],
        truncate_after: Option<LogIndex>,
    ) -> Result<()> {
        let keep = truncate_after.map_or(self.last_index(), |after| after.min(self.last_index()));
        check_contiguous(keep, entries)?;

        if keep < self.last_index() {
            let cut = self.offsets[keep.0 as usize];
            self.log_file.set_len(cut)?;
            self.offsets.truncate(keep.0 as usize);
            self.end = cut;
            if entries.is_empty() {
                self.log_file.sync_data()?;
            }
        }

        if entries.is_empty() {
            return Ok(());
        }

        let mut frames = BytesMut::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            let body = bincode::serialize(entry).map_err(|e| RaftError::Codec(e.to_string()))?;
            offsets.push(self.end + frames.len() as u64);
            frames.put_u32(body.len() as u32);
            frames.put_slice(&body);
        }

        self.log_file.seek(SeekFrom::Start(self.end))?;
        self.log_file.write_all(&frames)?;
        self.log_file.sync_data()?;

        self.end += frames.len() as u64;
        self.offsets.extend(offsets);
        Ok(())
    }

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let meta = Metadata {
            current_term: term,
            voted_for,
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| RaftError::Codec(e.to_string()))?;

        let temp_path = self.dir.join("meta.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;
        self.sync_dir()?;
        Ok(())
    }

    fn read_all(&self) -> Result<PersistentState> {
        let meta = match fs::read(self.meta_path()) {
            Ok(raw) => serde_json::from_slice::<Metadata>(&raw)
                .map_err(|e| RaftError::Codec(e.to_string()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Metadata::default(),
            Err(e) => return Err(e.into()),
        };

        let mut file = File::open(self.dir.join("log.bin"))?;
        let (log, _, _) = Self::scan(&mut file)?;

        Ok(PersistentState {
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            log,
        })
    }
}
