//! Segment index: fixed-width entries parallel to the records of a log file.
//!
//! Entry `i` of an index file describes record `i` of the paired log file. The entry flavor
//! is chosen once per log from [`crate::LogOptions::index_kind`] and threaded through the
//! writer and reader as a type parameter, so the per-record path has no dynamic dispatch.

pub mod entry;
pub mod lookup;

pub use entry::{key_hash, KeyEntry, KeyTimeEntry, PlainEntry, TimeEntry};

use crate::error::{LogError, Result};
use crate::record::{Record, RecordScanner};
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// One index entry flavor.
pub trait IndexEntry: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;
    /// Whether entries carry a key hash.
    const KEYED: bool;
    /// Whether entries carry a clamped timestamp.
    const TIMED: bool;

    /// Running state threaded from one entry to the next.
    type State: Copy + Default + Debug + Send + Sync;

    /// Builds the entry for a record written at `position`, returning the state for the next one.
    fn derive(
        offset: i64,
        position: i64,
        time: i64,
        key: Option<&[u8]>,
        state: Self::State,
    ) -> (Self, Self::State);

    /// Builds the entry for `record` written at `position`.
    fn from_record(record: &Record, position: i64, state: Self::State) -> (Self, Self::State) {
        Self::derive(
            record.offset,
            position,
            record.time,
            record.key.as_deref(),
            state,
        )
    }

    /// Record offset.
    fn offset(&self) -> i64;

    /// Record byte position in the log file.
    fn position(&self) -> i64;

    /// Key hash, or zero for flavors without one.
    fn key_hash(&self) -> u64 {
        0
    }

    /// Effective time, or zero for flavors without one.
    fn time(&self) -> i64 {
        0
    }

    /// State to carry after this entry.
    fn carried(&self) -> Self::State;

    /// Writes the entry into `buf`, which is exactly `SIZE` bytes.
    fn encode(&self, buf: &mut [u8]);

    /// Reads an entry from `buf`, which is exactly `SIZE` bytes.
    fn decode(buf: &[u8]) -> Self;
}

/// In-memory index of one segment, with the derived key map.
#[derive(Debug, Clone)]
pub struct IndexRuntime<E: IndexEntry> {
    entries: Vec<E>,
    keys: HashMap<u64, Vec<usize>>,
    next_offset: i64,
    state: E::State,
}

impl<E: IndexEntry> IndexRuntime<E> {
    /// Builds a runtime for a segment starting at `base_offset`.
    pub fn new(base_offset: i64, entries: Vec<E>) -> Self {
        let mut runtime = Self {
            entries: Vec::with_capacity(entries.len()),
            keys: HashMap::new(),
            next_offset: base_offset,
            state: E::State::default(),
        };
        runtime.append(entries);
        runtime
    }

    /// Appends entries published after the current ones.
    pub fn append(&mut self, entries: impl IntoIterator<Item = E>) {
        for entry in entries {
            if E::KEYED {
                self.keys
                    .entry(entry.key_hash())
                    .or_default()
                    .push(self.entries.len());
            }
            self.next_offset = entry.offset() + 1;
            self.state = entry.carried();
            self.entries.push(entry);
        }
    }

    /// All entries in publish order.
    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the segment has no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset the next record in this segment would get.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// State to derive the next entry with.
    pub fn state(&self) -> E::State {
        self.state
    }

    /// First entry, if any.
    pub fn first(&self) -> Option<&E> {
        self.entries.first()
    }

    /// See [`lookup::consume`].
    pub fn consume(&self, offset: i64) -> Result<(i64, i64)> {
        lookup::consume(&self.entries, offset)
    }

    /// See [`lookup::get`].
    pub fn get(&self, offset: i64) -> Result<&E> {
        lookup::get(&self.entries, offset)
    }

    /// See [`lookup::by_time`].
    pub fn by_time(&self, time: i64) -> Result<&E> {
        lookup::by_time(&self.entries, time)
    }

    /// Entries whose key hash matches `hash`, newest first.
    pub fn by_hash(&self, hash: u64) -> impl Iterator<Item = &E> + '_ {
        self.keys
            .get(&hash)
            .into_iter()
            .flat_map(|at| at.iter().rev())
            .map(move |&i| &self.entries[i])
    }

    /// Entries whose key hash matches `hash` and whose offset is at least `offset`, oldest first.
    pub fn by_hash_from(&self, hash: u64, offset: i64) -> impl Iterator<Item = &E> + '_ {
        self.keys
            .get(&hash)
            .into_iter()
            .flat_map(|at| at.iter())
            .map(move |&i| &self.entries[i])
            .filter(move |e| e.offset() >= offset)
    }
}

/// Buffered appender for an index file.
pub(crate) struct IndexWriter<E> {
    file: BufWriter<File>,
    size: u64,
    scratch: Vec<u8>,
    _flavor: std::marker::PhantomData<E>,
}

impl<E: IndexEntry> IndexWriter<E> {
    /// Opens `path` for appending, creating it if missing.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: BufWriter::new(file),
            size,
            scratch: vec![0u8; E::SIZE],
            _flavor: std::marker::PhantomData,
        })
    }

    pub(crate) fn write(&mut self, entry: &E) -> Result<()> {
        entry.encode(&mut self.scratch);
        self.file.write_all(&self.scratch)?;
        self.size += E::SIZE as u64;
        Ok(())
    }

    /// Current size in bytes, including buffered entries.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Drops buffered entries without writing them and resets the size to `size`.
    pub(crate) fn discard(&mut self, size: u64) -> Result<()> {
        let file = self.file.get_ref().try_clone()?;
        let (_, _unwritten) = std::mem::replace(&mut self.file, BufWriter::new(file)).into_parts();
        self.size = size;
        Ok(())
    }
}

/// Encodes `entries` back to back.
pub(crate) fn encode_entries<E: IndexEntry>(entries: &[E]) -> Vec<u8> {
    let mut buf = vec![0u8; entries.len() * E::SIZE];
    for (entry, chunk) in entries.iter().zip(buf.chunks_exact_mut(E::SIZE)) {
        entry.encode(chunk);
    }
    buf
}

/// Decodes a whole index file image.
pub(crate) fn decode_entries<E: IndexEntry>(bytes: &[u8]) -> Result<Vec<E>> {
    if bytes.len() % E::SIZE != 0 {
        return Err(LogError::Corrupted(format!(
            "index size {} is not a multiple of entry size {}",
            bytes.len(),
            E::SIZE
        )));
    }
    Ok(bytes.chunks_exact(E::SIZE).map(E::decode).collect())
}

/// Loads the index file at `path` into memory.
pub(crate) fn read_index<E: IndexEntry>(path: &Path) -> Result<Vec<E>> {
    decode_entries(&fs::read(path)?)
}

/// Writes `entries` to a fresh index file at `path` and syncs it.
pub(crate) fn write_index<E: IndexEntry>(path: &Path, entries: &[E]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&encode_entries(entries))?;
    file.sync_all()?;
    Ok(())
}

/// Rebuilds the entries of the log file at `path` by replaying its records.
pub(crate) fn replay<E: IndexEntry>(path: &Path) -> Result<Vec<E>> {
    let mut scanner = RecordScanner::open(path)?;
    let mut entries = Vec::new();
    let mut state = E::State::default();
    while let Some((position, record)) = scanner.next_record()? {
        let (entry, next) = E::from_record(&record, position, state);
        entries.push(entry);
        state = next;
    }
    Ok(entries)
}
