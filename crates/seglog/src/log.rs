//! Log coordinator: routes operations across the ordered segment list.
//!
//! Locks, always taken in this order:
//! - `deleting` serializes deletes and backups;
//! - `writer` guards the head writer (publish, rollover, sync);
//! - `readers` guards the segment list, shared for reads and exclusive for splices.

use crate::config::{IndexKind, LogOptions};
use crate::error::{LogError, Result};
use crate::index::{IndexEntry, KeyEntry, KeyTimeEntry, PlainEntry, TimeEntry};
use crate::lock::DirLock;
use crate::reader::Reader;
use crate::record::{Record, OFFSET_NEWEST, OFFSET_OLDEST};
use crate::segment::{Segment, Stats};
use crate::writer::Writer;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Segment list and head writer for one index flavor.
struct Engine<E: IndexEntry> {
    dir: PathBuf,
    opts: LogOptions,
    writer: Mutex<Option<Writer<E>>>,
    readers: RwLock<Vec<Reader<E>>>,
    deleting: Mutex<()>,
    closed: AtomicBool,
    lock: Mutex<Option<DirLock>>,
}

/// Rejects negative offsets other than the reserved ones.
fn check_offset(offset: i64) -> Result<()> {
    if offset < 0 && offset != OFFSET_OLDEST && offset != OFFSET_NEWEST {
        return Err(LogError::InvalidOffset(offset));
    }
    Ok(())
}

/// Index of the segment that holds `offset`: the last one whose base is at or below it.
fn segment_index<E: IndexEntry>(readers: &[Reader<E>], offset: i64) -> usize {
    match offset {
        OFFSET_OLDEST => 0,
        OFFSET_NEWEST => readers.len().saturating_sub(1),
        _ => match readers.binary_search_by_key(&offset, |r| r.segment().base_offset()) {
            Ok(at) => at,
            Err(0) => 0,
            Err(at) => at - 1,
        },
    }
}

impl<E: IndexEntry> Engine<E> {
    fn open(dir: &Path, opts: LogOptions) -> Result<Self> {
        if opts.create_dirs {
            fs::create_dir_all(dir)?;
        }
        let lock = DirLock::acquire(dir, opts.readonly)?;

        let (writer, readers) = if opts.readonly {
            let mut segments = Segment::list(dir)?;
            let head = segments.pop();
            let mut readers: Vec<Reader<E>> = segments
                .into_iter()
                .map(|segment| Reader::sealed(segment, false))
                .collect();
            readers.extend(head.map(|segment| Reader::sealed(segment, true)));
            (None, readers)
        } else {
            Segment::clean_rewrites(dir)?;
            let mut segments = Segment::list(dir)?;
            let head = segments.pop().unwrap_or_else(|| Segment::new(dir, 0));
            if opts.check_on_open {
                head.check::<E>()?;
            }
            let writer = Writer::<E>::open(head)?;
            let mut readers: Vec<Reader<E>> = segments
                .into_iter()
                .map(|segment| Reader::sealed(segment, false))
                .collect();
            readers.push(writer.reader());
            (Some(writer), readers)
        };

        let engine = Self {
            dir: dir.to_path_buf(),
            opts,
            writer: Mutex::new(writer),
            readers: RwLock::new(readers),
            deleting: Mutex::new(()),
            closed: AtomicBool::new(false),
            lock: Mutex::new(Some(lock)),
        };
        info!(
            "Opened log {} ({} segments, next offset {}, {})",
            engine.dir.display(),
            engine.readers().len(),
            engine.next_offset()?,
            if engine.opts.readonly {
                "read-only"
            } else {
                "read-write"
            }
        );
        Ok(engine)
    }

    fn writer(&self) -> MutexGuard<'_, Option<Writer<E>>> {
        self.writer.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn readers(&self) -> RwLockReadGuard<'_, Vec<Reader<E>>> {
        self.readers.read().unwrap_or_else(|err| err.into_inner())
    }

    fn readers_mut(&self) -> RwLockWriteGuard<'_, Vec<Reader<E>>> {
        self.readers.write().unwrap_or_else(|err| err.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.opts.readonly {
            return Err(LogError::Readonly);
        }
        Ok(())
    }

    fn publish(&self, records: &[Record]) -> Result<i64> {
        self.ensure_writable()?;
        let mut guard = self.writer();
        let needs_rollover = guard
            .as_ref()
            .ok_or(LogError::Closed)?
            .needs_rollover(self.opts.rollover_size);
        if needs_rollover {
            self.rollover(&mut guard)?;
        }

        let writer = guard.as_mut().ok_or(LogError::Closed)?;
        let next = match writer.publish(records) {
            Ok(next) => next,
            Err(e) => {
                if writer.is_poisoned() {
                    warn!(
                        "Writer for {} is unusable, reopen the log to recover",
                        self.dir.display()
                    );
                    guard.take();
                }
                return Err(e);
            }
        };
        if self.opts.auto_sync {
            writer.sync()?;
        }
        Ok(next)
    }

    /// Seals the head and starts a new segment at its next offset.
    fn rollover(&self, guard: &mut MutexGuard<'_, Option<Writer<E>>>) -> Result<()> {
        let current = guard.as_ref().ok_or(LogError::Closed)?;
        let next = current.next_offset();
        let fresh = Writer::open(current.segment().sibling(next))?;
        let fresh_reader = fresh.reader();
        let sealed = match guard.replace(fresh) {
            Some(old) => old.seal(),
            None => return Err(LogError::Closed),
        };

        let mut readers = self.readers_mut();
        let result = sealed.map(|sealed| {
            if let Some(last) = readers.last_mut() {
                *last = sealed;
            }
        });
        readers.push(fresh_reader);
        debug!("Rolled over to segment {} ({} segments)", next, readers.len());
        result
    }

    fn next_offset(&self) -> Result<i64> {
        match self.readers().last() {
            Some(head) => head.next_offset(),
            None => Ok(0),
        }
    }

    fn consume(&self, offset: i64, max: usize) -> Result<(i64, Vec<Record>)> {
        self.ensure_open()?;
        check_offset(offset)?;
        let readers = self.readers();
        if readers.is_empty() {
            return match offset {
                OFFSET_OLDEST | OFFSET_NEWEST | 0 => Ok((0, Vec::new())),
                _ => Err(LogError::InvalidOffset(offset)),
            };
        }

        let mut at = segment_index(&readers, offset);
        let mut offset = offset;
        loop {
            match readers[at].consume(offset, max) {
                Err(LogError::InvalidOffset(_)) if at + 1 < readers.len() => {
                    at += 1;
                    offset = OFFSET_OLDEST;
                }
                result => return result,
            }
        }
    }

    fn get(&self, offset: i64) -> Result<Record> {
        self.ensure_open()?;
        if offset < 0 {
            return Err(LogError::InvalidOffset(offset));
        }
        let readers = self.readers();
        if readers.is_empty() {
            return Err(LogError::InvalidOffset(offset));
        }

        let at = segment_index(&readers, offset);
        match readers[at].get(offset) {
            Err(LogError::InvalidOffset(o)) if at + 1 < readers.len() => {
                Err(LogError::OffsetNotFound(o))
            }
            result => result,
        }
    }

    fn require_key_index(&self) -> Result<()> {
        if !E::KEYED {
            return Err(LogError::NoIndex("key"));
        }
        Ok(())
    }

    fn require_time_index(&self) -> Result<()> {
        if !E::TIMED {
            return Err(LogError::NoIndex("time"));
        }
        Ok(())
    }

    fn consume_by_key(&self, key: &[u8], offset: i64, max: usize) -> Result<(i64, Vec<Record>)> {
        self.ensure_open()?;
        self.require_key_index()?;
        check_offset(offset)?;
        let readers = self.readers();
        let log_next = match readers.last() {
            Some(head) => head.next_offset()?,
            None => 0,
        };
        if offset > log_next {
            return Err(LogError::InvalidOffset(offset));
        }
        let mut next = offset.max(0);
        for reader in readers.iter().skip(segment_index(&readers, offset)) {
            let (segment_next, records) = reader.consume_by_key(key, offset, max)?;
            if !records.is_empty() {
                return Ok((segment_next, records));
            }
            next = next.max(segment_next);
        }
        Ok((next, Vec::new()))
    }

    fn get_by_key(&self, key: &[u8]) -> Result<Record> {
        self.ensure_open()?;
        self.require_key_index()?;
        for reader in self.readers().iter().rev() {
            match reader.get_by_key(key) {
                Err(LogError::KeyNotFound) => continue,
                result => return result,
            }
        }
        Err(LogError::KeyNotFound)
    }

    fn offset_by_time(&self, time: i64) -> Result<(i64, i64)> {
        self.ensure_open()?;
        self.require_time_index()?;
        let readers = self.readers();

        for at in (0..readers.len()).rev() {
            match readers[at].time_entry(time) {
                Ok(found) => return Ok(found),
                Err(LogError::TimeBeforeStart(_)) if at == 0 => {
                    if let Some(first) = readers[0].first_entry()? {
                        return Ok(first);
                    }
                }
                Err(LogError::TimeBeforeStart(_)) | Err(LogError::IndexEmpty) => continue,
                Err(LogError::TimeNotFound(_)) => {
                    for newer in &readers[at + 1..] {
                        if let Some(first) = newer.first_entry()? {
                            return Ok(first);
                        }
                    }
                    return Err(LogError::TimeNotFound(time));
                }
                Err(e) => return Err(e),
            }
        }
        Err(LogError::TimeNotFound(time))
    }

    fn delete(&self, offsets: &BTreeSet<i64>) -> Result<(BTreeSet<i64>, u64)> {
        self.ensure_writable()?;
        let lowest = match offsets.first() {
            Some(&lowest) => lowest,
            None => return Ok((BTreeSet::new(), 0)),
        };
        let _serial = self.deleting.lock().unwrap_or_else(|err| err.into_inner());

        let (segment, is_head) = {
            let readers = self.readers();
            let at = segment_index(&readers, lowest);
            match readers.get(at) {
                Some(reader) => (reader.segment().clone(), reader.is_head()),
                None => return Ok((BTreeSet::new(), 0)),
            }
        };

        if is_head {
            self.delete_head(&segment, offsets)
        } else {
            self.delete_sealed(&segment, offsets)
        }
    }

    fn delete_head(
        &self,
        segment: &Segment,
        offsets: &BTreeSet<i64>,
    ) -> Result<(BTreeSet<i64>, u64)> {
        let limit = {
            let mut guard = self.writer();
            let writer = guard.as_mut().ok_or(LogError::Closed)?;
            if writer.segment() != segment {
                return Err(LogError::SegmentChanged);
            }
            writer.sync()?;
            writer.entry_count()
        };

        let rewrite = segment.rewrite::<E>(offsets, Some(limit))?;
        if rewrite.deleted.is_empty() {
            rewrite.discard()?;
            return Ok((BTreeSet::new(), 0));
        }

        let mut guard = self.writer();
        let writer = guard.take().ok_or(LogError::Closed)?;
        if let Err(e) = writer.validate(&rewrite) {
            *guard = Some(writer);
            rewrite.discard()?;
            return Err(e);
        }

        let deleted = rewrite.deleted.clone();
        let freed = rewrite.deleted_size;
        let (fresh, sealed) = writer.delete(rewrite)?;
        let fresh_reader = fresh.reader();
        *guard = Some(fresh);

        let mut readers = self.readers_mut();
        readers.pop();
        readers.extend(sealed);
        readers.push(fresh_reader);
        debug!(
            "Deleted {} records ({} bytes) from head segment {}",
            deleted.len(),
            freed,
            segment.base_offset()
        );
        Ok((deleted, freed))
    }

    fn delete_sealed(
        &self,
        segment: &Segment,
        offsets: &BTreeSet<i64>,
    ) -> Result<(BTreeSet<i64>, u64)> {
        let rewrite = segment.rewrite::<E>(offsets, None)?;
        if rewrite.deleted.is_empty() {
            rewrite.discard()?;
            return Ok((BTreeSet::new(), 0));
        }

        // Pin the old files in the current reader so reads keep working across the renames.
        let pinned = match self.readers().iter().find(|r| r.segment() == segment) {
            Some(reader) => reader.load(),
            None => Err(LogError::SegmentChanged),
        };
        if let Err(e) = pinned {
            rewrite.discard()?;
            return Err(e);
        }

        let deleted = rewrite.deleted.clone();
        let freed = rewrite.deleted_size;
        let promoted = Reader::promote(rewrite)?;

        let mut readers = self.readers_mut();
        if let Some(at) = readers.iter().position(|r| r.segment() == segment) {
            readers[at].close();
            match promoted {
                Some(promoted) => readers[at] = promoted,
                None => {
                    readers.remove(at);
                }
            }
        }
        drop(readers);
        debug!(
            "Deleted {} records ({} bytes) from segment {}",
            deleted.len(),
            freed,
            segment.base_offset()
        );
        Ok((deleted, freed))
    }

    fn stat(&self) -> Result<Stats> {
        self.ensure_open()?;
        let mut stats = Stats::default();
        for reader in self.readers().iter() {
            stats += reader.stat()?;
        }
        Ok(stats)
    }

    fn backup(&self, dst: &Path) -> Result<()> {
        self.ensure_open()?;
        fs::create_dir_all(dst)?;
        // Holding `deleting` keeps sealed segments from being rewritten during the copy.
        let _serial = self.deleting.lock().unwrap_or_else(|err| err.into_inner());
        let (head, segments) = {
            let mut guard = self.writer();
            let head = match guard.as_mut() {
                Some(writer) => {
                    writer.sync()?;
                    Some((writer.segment().clone(), writer.file_sizes()))
                }
                None => None,
            };
            let segments: Vec<Segment> = self
                .readers()
                .iter()
                .map(|reader| reader.segment().clone())
                .collect();
            (head, segments)
        };

        for segment in &segments {
            match &head {
                Some((current, (log_len, index_len))) if current == segment => {
                    segment.backup_prefix(dst, *log_len, *index_len)?
                }
                _ => segment.backup(dst)?,
            }
        }
        debug!("Backed up {} segments to {}", segments.len(), dst.display());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.ensure_writable()?;
        match self.writer().as_mut() {
            Some(writer) => writer.sync(),
            None => Err(LogError::Closed),
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = match self.writer().take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        };
        let mut readers = self.readers_mut();
        for reader in readers.iter_mut() {
            reader.close();
        }
        readers.clear();

        if let Some(lock) = self.lock.lock().unwrap_or_else(|err| err.into_inner()).take() {
            debug!("Released {}", lock.path().display());
        }
        info!("Closed log {}", self.dir.display());
        result
    }
}

enum Flavor {
    Plain(Engine<PlainEntry>),
    Keyed(Engine<KeyEntry>),
    Timed(Engine<TimeEntry>),
    KeyedTimed(Engine<KeyTimeEntry>),
}

macro_rules! dispatch {
    ($log:expr, $engine:ident => $body:expr) => {
        match &$log.flavor {
            Flavor::Plain($engine) => $body,
            Flavor::Keyed($engine) => $body,
            Flavor::Timed($engine) => $body,
            Flavor::KeyedTimed($engine) => $body,
        }
    };
}

fn entry_size<E: IndexEntry>(_engine: &Engine<E>) -> u64 {
    E::SIZE as u64
}

/// An append-only, segmented log in one directory.
///
/// All methods take `&self`; a `Log` can be shared across threads behind an `Arc`.
///
/// # Examples
/// ```rust,ignore
/// use alopex_seglog::{Log, LogOptions, Record, OFFSET_OLDEST};
///
/// let log = Log::open("/tmp/log", LogOptions::default().with_create_dirs(true))?;
/// log.publish(&[Record::new("key", "value")])?;
/// let (next, records) = log.consume(OFFSET_OLDEST, 100)?;
/// ```
pub struct Log {
    flavor: Flavor,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log").finish_non_exhaustive()
    }
}

impl Log {
    /// Opens the log in `dir`, creating a first segment when a writable directory is empty.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another process holds the directory, `Corrupted` if
    /// `check_on_open` finds a drifted head index, or an I/O error.
    pub fn open(dir: impl AsRef<Path>, opts: LogOptions) -> Result<Self> {
        let dir = dir.as_ref();
        let flavor = match opts.index_kind() {
            IndexKind::Plain => Flavor::Plain(Engine::open(dir, opts)?),
            IndexKind::Keyed => Flavor::Keyed(Engine::open(dir, opts)?),
            IndexKind::Timed => Flavor::Timed(Engine::open(dir, opts)?),
            IndexKind::KeyedTimed => Flavor::KeyedTimed(Engine::open(dir, opts)?),
        };
        Ok(Self { flavor })
    }

    /// Appends `records` and returns the next offset.
    ///
    /// Offsets are assigned here; the `offset` field of the input is ignored. A zero `time`
    /// is replaced by the current time.
    pub fn publish(&self, records: &[Record]) -> Result<i64> {
        dispatch!(self, engine => engine.publish(records))
    }

    /// Offset the next published record will get.
    pub fn next_offset(&self) -> Result<i64> {
        dispatch!(self, engine => {
            engine.ensure_open()?;
            engine.next_offset()
        })
    }

    /// Reads up to `max` records starting at `offset` (or a reserved offset).
    ///
    /// Returns the offset to continue from. Deleted offsets are skipped; reading at the next
    /// offset returns no records.
    pub fn consume(&self, offset: i64, max: usize) -> Result<(i64, Vec<Record>)> {
        dispatch!(self, engine => engine.consume(offset, max))
    }

    /// Reads up to `max` records with `key`, at or after `offset`. Needs the key index.
    pub fn consume_by_key(
        &self,
        key: &[u8],
        offset: i64,
        max: usize,
    ) -> Result<(i64, Vec<Record>)> {
        dispatch!(self, engine => engine.consume_by_key(key, offset, max))
    }

    /// Reads the record at `offset`.
    pub fn get(&self, offset: i64) -> Result<Record> {
        dispatch!(self, engine => engine.get(offset))
    }

    /// Reads the newest record with `key`. Needs the key index.
    pub fn get_by_key(&self, key: &[u8]) -> Result<Record> {
        dispatch!(self, engine => engine.get_by_key(key))
    }

    /// Offset of the newest record with `key`. Needs the key index.
    pub fn offset_by_key(&self, key: &[u8]) -> Result<i64> {
        self.get_by_key(key).map(|record| record.offset)
    }

    /// Reads the first record whose indexed time is at or after `time`. Needs the time index.
    pub fn get_by_time(&self, time: i64) -> Result<Record> {
        let (offset, _) = self.offset_by_time(time)?;
        self.get(offset)
    }

    /// Offset and indexed time of the first record at or after `time`. Needs the time index.
    ///
    /// A time before the whole log resolves to the oldest record.
    pub fn offset_by_time(&self, time: i64) -> Result<(i64, i64)> {
        dispatch!(self, engine => engine.offset_by_time(time))
    }

    /// Deletes `offsets` from the segment holding the lowest of them.
    ///
    /// Returns the offsets actually deleted and the bytes freed. Offsets in other segments
    /// are left for later calls; see [`crate::delete_multi`].
    ///
    /// # Errors
    ///
    /// Returns `SegmentChanged` when a concurrent publish or rollover raced the rewrite;
    /// nothing was deleted and the call can be retried.
    pub fn delete(&self, offsets: &BTreeSet<i64>) -> Result<(BTreeSet<i64>, u64)> {
        dispatch!(self, engine => engine.delete(offsets))
    }

    /// Bytes `record` takes on disk, including its index entry.
    pub fn size(&self, record: &Record) -> u64 {
        record.size() + dispatch!(self, engine => entry_size(engine))
    }

    /// Segment, record and byte counts.
    pub fn stat(&self) -> Result<Stats> {
        dispatch!(self, engine => engine.stat())
    }

    /// Copies all segment files into `dst`, skipping sealed files that are already up to date.
    ///
    /// The head is copied up to its size when the backup started; publishes are not blocked
    /// while the files are copied.
    pub fn backup(&self, dst: impl AsRef<Path>) -> Result<()> {
        let dst = dst.as_ref();
        dispatch!(self, engine => engine.backup(dst))
    }

    /// Flushes and fsyncs the head segment.
    pub fn sync(&self) -> Result<()> {
        dispatch!(self, engine => engine.sync())
    }

    /// Syncs and closes all segments and releases the directory lock.
    ///
    /// Later calls fail with `Closed`; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        dispatch!(self, engine => engine.close())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close log on drop: {:?}", e);
        }
    }
}
