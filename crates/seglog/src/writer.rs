//! Append path for the head segment.

use crate::error::{LogError, Result};
use crate::index::{IndexEntry, IndexRuntime, IndexWriter};
use crate::reader::Reader;
use crate::record::{now_micros, Record, RecordWriter};
use crate::segment::{Rewrite, Segment};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Index runtime and read handle of the head segment, shared by its writer and reader.
#[derive(Debug)]
pub(crate) struct LiveSegment<E: IndexEntry> {
    runtime: RwLock<IndexRuntime<E>>,
    file: File,
}

impl<E: IndexEntry> LiveSegment<E> {
    pub(crate) fn runtime(&self) -> RwLockReadGuard<'_, IndexRuntime<E>> {
        self.runtime.read().unwrap_or_else(|err| err.into_inner())
    }

    fn runtime_mut(&self) -> RwLockWriteGuard<'_, IndexRuntime<E>> {
        self.runtime.write().unwrap_or_else(|err| err.into_inner())
    }

    /// Read handle on the log file; records are flushed before they are indexed.
    pub(crate) fn file(&self) -> &File {
        &self.file
    }
}

/// Writer for the head segment of a log.
pub struct Writer<E: IndexEntry> {
    segment: Segment,
    log: RecordWriter,
    index: IndexWriter<E>,
    poisoned: bool,
    live: Arc<LiveSegment<E>>,
}

impl<E: IndexEntry> Writer<E> {
    /// Opens `segment` for appending, creating its files if missing and rebuilding a stale index.
    pub fn open(segment: Segment) -> Result<Self> {
        let log = RecordWriter::open(segment.log_path())?;
        let entries = segment.reindex_and_read_index::<E>()?;
        let index = IndexWriter::open(segment.index_path())?;
        let file = File::open(segment.log_path())?;

        let runtime = IndexRuntime::new(segment.base_offset(), entries);
        debug!(
            "Opened writer on {} (next offset {})",
            segment.log_path().display(),
            runtime.next_offset()
        );

        Ok(Self {
            segment,
            log,
            index,
            poisoned: false,
            live: Arc::new(LiveSegment {
                runtime: RwLock::new(runtime),
                file,
            }),
        })
    }

    /// Segment being written.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// A head reader sharing this writer's index.
    pub fn reader(&self) -> Reader<E> {
        Reader::live(self.segment.clone(), Arc::clone(&self.live))
    }

    /// Appends `records`, assigning offsets and filling zero timestamps with the current time.
    ///
    /// Returns the next offset. Records become visible to readers only once both files are
    /// flushed and the whole batch is indexed. A batch that fails part way is cut from both
    /// files again, so the next publish reuses its offsets; if that cut fails too, the writer
    /// refuses further publishes with `Closed`.
    pub fn publish(&mut self, records: &[Record]) -> Result<i64> {
        if self.poisoned {
            return Err(LogError::Closed);
        }
        for record in records {
            record.validate()?;
        }
        let (next, state) = {
            let runtime = self.live.runtime();
            (runtime.next_offset(), runtime.state())
        };
        if records.is_empty() {
            return Ok(next);
        }

        let (log_size, index_size) = (self.log.size(), self.index.size());
        match self.append(records, next, state) {
            Ok(entries) => {
                self.live.runtime_mut().append(entries);
                Ok(next + records.len() as i64)
            }
            Err(e) => {
                if let Err(cut) = self.rollback(log_size, index_size) {
                    warn!(
                        "Failed to roll back {} after a failed publish: {}",
                        self.segment.log_path().display(),
                        cut
                    );
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Writes and flushes one batch, returning its index entries.
    fn append(
        &mut self,
        records: &[Record],
        mut next: i64,
        mut state: E::State,
    ) -> Result<Vec<E>> {
        let now = now_micros();
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let time = if record.time == 0 { now } else { record.time };
            let key = record.key.as_deref();
            let position = self
                .log
                .write_parts(next, time, key, record.value.as_deref())?;
            let (entry, carried) = E::derive(next, position, time, key, state);
            self.index.write(&entry)?;

            entries.push(entry);
            state = carried;
            next += 1;
        }
        self.log.flush()?;
        self.index.flush()?;
        Ok(entries)
    }

    /// Cuts both files back to the given sizes and drops anything still buffered.
    fn rollback(&mut self, log_size: u64, index_size: u64) -> Result<()> {
        self.log.discard(log_size)?;
        self.index.discard(index_size)?;
        truncate(self.segment.log_path(), log_size)?;
        truncate(self.segment.index_path(), index_size)?;
        debug!(
            "Rolled back {} to {} bytes",
            self.segment.log_path().display(),
            log_size
        );
        Ok(())
    }

    /// Whether a failed publish could not be rolled back.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Log and index bytes written so far.
    pub fn file_sizes(&self) -> (u64, u64) {
        (self.log.size(), self.index.size())
    }

    /// Returns true once log plus index size exceeds `rollover_size` and the segment is non-empty.
    pub fn needs_rollover(&self, rollover_size: u64) -> bool {
        self.log.size() + self.index.size() > rollover_size && self.entry_count() > 0
    }

    /// Offset the next published record gets.
    pub fn next_offset(&self) -> i64 {
        self.live.runtime().next_offset()
    }

    /// Number of records in the segment.
    pub fn entry_count(&self) -> usize {
        self.live.runtime().len()
    }

    /// Flushes and fsyncs both files.
    pub fn sync(&mut self) -> Result<()> {
        self.log.sync()?;
        self.index.sync()
    }

    /// Syncs and turns the segment into a sealed reader seeded with the current index.
    pub fn seal(mut self) -> Result<Reader<E>> {
        self.sync()?;
        let runtime = self.live.runtime().clone();
        debug!("Sealed segment {}", self.segment.log_path().display());
        Ok(Reader::sealed_with(self.segment, runtime))
    }

    /// Syncs and releases the file handles.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Fails with `SegmentChanged` unless `rewrite` covers exactly this segment's records.
    pub fn validate(&self, rewrite: &Rewrite) -> Result<()> {
        if rewrite.source_base != self.segment.base_offset()
            || rewrite.scanned() != self.entry_count()
        {
            return Err(LogError::SegmentChanged);
        }
        Ok(())
    }

    /// Applies a validated rewrite of this segment.
    ///
    /// Returns the writer to continue with and, when the tail record was deleted, a sealed
    /// reader for the survivors. The continuing writer always starts at the old next offset
    /// so offsets are never reused.
    pub fn delete(self, rewrite: Rewrite) -> Result<(Writer<E>, Option<Reader<E>>)> {
        let next = self.next_offset();
        let tail_deleted = rewrite.deleted.contains(&(next - 1));
        let fresh = self.segment.sibling(next);
        self.close()?;

        match rewrite.promote()? {
            None => Ok((Writer::open(fresh)?, None)),
            Some(survivors) if tail_deleted => {
                let sealed = Reader::sealed(survivors, false);
                Ok((Writer::open(fresh)?, Some(sealed)))
            }
            Some(survivors) => Ok((Writer::open(survivors)?, None)),
        }
    }
}

fn truncate(path: &Path, size: u64) -> Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(size)?;
    Ok(())
}
