//! Segment file pairs: `{base:020}.log` and `{base:020}.index`.
//!
//! A [`Segment`] only knows paths. The operations here work on closed files or on files
//! that are append-only while they run (stat, rewrite, backup); promotion of rewritten
//! pairs always goes through rename so a reader never sees a half-written file.

use crate::error::{LogError, Result};
use crate::index::{self, IndexEntry, IndexWriter};
use crate::record::{read_at, RecordScanner, RecordWriter};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOG_EXTENSION: &str = "log";
const INDEX_EXTENSION: &str = "index";
const REWRITE_MARKER: &str = ".rewrite.";

/// Message and byte counts for one or more segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of segments.
    pub segments: usize,
    /// Number of records.
    pub messages: usize,
    /// Combined size of log and index files in bytes.
    pub size: u64,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.segments += other.segments;
        self.messages += other.messages;
        self.size += other.size;
    }
}

/// Outcome of recovering one or more segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverReport {
    /// Bytes cut from corrupted log tails.
    pub truncated_bytes: u64,
    /// Whether any index file disagreed with its log and was deleted.
    pub index_removed: bool,
}

impl std::ops::AddAssign for RecoverReport {
    fn add_assign(&mut self, other: Self) {
        self.truncated_bytes += other.truncated_bytes;
        self.index_removed |= other.index_removed;
    }
}

/// Paths of one segment's log and index files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    dir: PathBuf,
    base_offset: i64,
    log_path: PathBuf,
    index_path: PathBuf,
}

impl Segment {
    /// Segment starting at `base_offset` in `dir`.
    pub fn new(dir: impl AsRef<Path>, base_offset: i64) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            log_path: dir.join(format!("{:020}.{}", base_offset, LOG_EXTENSION)),
            index_path: dir.join(format!("{:020}.{}", base_offset, INDEX_EXTENSION)),
            dir,
            base_offset,
        }
    }

    /// Lists the segments in `dir`, ordered by base offset.
    pub fn list(dir: &Path) -> Result<Vec<Self>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != LOG_EXTENSION) {
                continue;
            }
            let base = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| s.len() == 20)
                .and_then(|s| s.parse::<i64>().ok());
            if let Some(base) = base {
                segments.push(Self::new(dir, base));
            }
        }
        segments.sort_by_key(|s| s.base_offset);
        Ok(segments)
    }

    /// Removes leftovers of rewrites that never completed. Returns how many files were removed.
    pub fn clean_rewrites(dir: &Path) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.contains(REWRITE_MARKER));
            if stale {
                warn!("Removing stale rewrite file {}", path.display());
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Offset of the first record this segment was created for.
    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Segment in the same directory starting at `base_offset`.
    pub fn sibling(&self, base_offset: i64) -> Self {
        Self::new(&self.dir, base_offset)
    }

    /// Path of the record file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Path of the index file.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// A scratch pair next to this one, used as rewrite output.
    fn rewrite_pair(&self) -> Self {
        let suffix = format!("{}{:016x}", REWRITE_MARKER, rand::random::<u64>());
        let with_suffix = |path: &Path| {
            let mut name = path.as_os_str().to_owned();
            name.push(&suffix);
            PathBuf::from(name)
        };
        Self {
            dir: self.dir.clone(),
            base_offset: self.base_offset,
            log_path: with_suffix(&self.log_path),
            index_path: with_suffix(&self.index_path),
        }
    }

    /// Counts records and bytes from file sizes. Fails if either file is missing.
    pub fn stat<E: IndexEntry>(&self) -> Result<Stats> {
        let log_size = fs::metadata(&self.log_path)?.len();
        let index_size = fs::metadata(&self.index_path)?.len();
        Ok(Stats {
            segments: 1,
            messages: (index_size / E::SIZE as u64) as usize,
            size: log_size + index_size,
        })
    }

    /// Verifies that the index file matches a replay of the log.
    ///
    /// A missing index passes, since it is rebuilt on first use.
    pub fn check<E: IndexEntry>(&self) -> Result<()> {
        let on_disk = match fs::read(&self.index_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let expected = index::encode_entries(&index::replay::<E>(&self.log_path)?);
        if on_disk != expected {
            return Err(LogError::Corrupted(format!(
                "index {} does not match its log ({} bytes on disk, {} expected)",
                self.index_path.display(),
                on_disk.len(),
                expected.len()
            )));
        }
        Ok(())
    }

    /// Truncates the log at its first corrupted record and drops an index that disagrees.
    pub fn recover<E: IndexEntry>(&self) -> Result<RecoverReport> {
        let scratch = self.rewrite_pair();
        let replayed = self.copy_valid_prefix::<E>(&scratch);
        let (entries, truncated_bytes) = match replayed {
            Ok(result) => result,
            Err(e) => {
                remove_if_exists(&scratch.log_path)?;
                return Err(e);
            }
        };

        if truncated_bytes > 0 {
            warn!(
                "Truncating {} corrupted bytes from {}",
                truncated_bytes,
                self.log_path.display()
            );
            fs::rename(&scratch.log_path, &self.log_path)?;
        } else {
            fs::remove_file(&scratch.log_path)?;
        }

        let index_removed = match fs::read(&self.index_path) {
            Ok(bytes) if bytes == index::encode_entries(&entries) => false,
            Ok(_) => {
                warn!(
                    "Removing index {} that disagrees with its log",
                    self.index_path.display()
                );
                fs::remove_file(&self.index_path)?;
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        Ok(RecoverReport {
            truncated_bytes,
            index_removed,
        })
    }

    /// Copies records into `scratch` up to the first corrupted one.
    fn copy_valid_prefix<E: IndexEntry>(&self, scratch: &Segment) -> Result<(Vec<E>, u64)> {
        let log_size = fs::metadata(&self.log_path)?.len();
        let mut scanner = RecordScanner::open(&self.log_path)?;
        let mut writer = RecordWriter::open(&scratch.log_path)?;
        let mut entries = Vec::new();
        let mut state = E::State::default();

        loop {
            match scanner.next_record() {
                Ok(Some((_, record))) => {
                    let position = writer.write(&record)?;
                    let (entry, next) = E::from_record(&record, position, state);
                    entries.push(entry);
                    state = next;
                }
                Ok(None) => break,
                Err(e) if e.is_corrupted() => {
                    debug!("Stopping recovery of {}: {}", self.log_path.display(), e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        writer.sync()?;

        Ok((entries, log_size - scanner.position() as u64))
    }

    /// Loads the index, rebuilding it from the log when missing, empty or out of step.
    pub fn reindex_and_read_index<E: IndexEntry>(&self) -> Result<Vec<E>> {
        match fs::metadata(&self.index_path) {
            Ok(meta) if meta.len() > 0 => {
                let entries = index::read_index::<E>(&self.index_path)?;
                if self.index_reaches_end(&entries)? {
                    return Ok(entries);
                }
                warn!(
                    "Index {} does not cover its log, rebuilding",
                    self.index_path.display()
                );
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let entries = index::replay::<E>(&self.log_path)?;
        let scratch = self.rewrite_pair();
        index::write_index(&scratch.index_path, &entries)?;
        fs::rename(&scratch.index_path, &self.index_path)?;
        debug!(
            "Reindexed {} ({} entries)",
            self.log_path.display(),
            entries.len()
        );
        Ok(entries)
    }

    /// Returns true when the last entry's record ends exactly at the end of the log.
    fn index_reaches_end<E: IndexEntry>(&self, entries: &[E]) -> Result<bool> {
        let file = fs::File::open(&self.log_path)?;
        let log_size = file.metadata()?.len();
        let last = match entries.last() {
            Some(last) => last,
            None => return Ok(log_size == 0),
        };
        match read_at(&file, last.position()) {
            Ok(Some((record, next))) => {
                Ok(record.offset == last.offset() && next as u64 == log_size)
            }
            Ok(None) => Ok(false),
            Err(e) if e.is_corrupted() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Writes the records not in `drop` to a scratch pair.
    ///
    /// At most `limit` records are scanned, so a rewrite of the head segment ignores records
    /// published after the caller sampled its length. The source files are not modified.
    pub fn rewrite<E: IndexEntry>(
        &self,
        drop: &BTreeSet<i64>,
        limit: Option<usize>,
    ) -> Result<Rewrite> {
        let scratch = self.rewrite_pair();
        match self.rewrite_into::<E>(&scratch, drop, limit) {
            Ok(rewrite) => {
                debug!(
                    "Rewrote {}: {} survived, {} deleted",
                    self.log_path.display(),
                    rewrite.survived.len(),
                    rewrite.deleted.len()
                );
                Ok(rewrite)
            }
            Err(e) => {
                scratch.remove()?;
                Err(e)
            }
        }
    }

    fn rewrite_into<E: IndexEntry>(
        &self,
        scratch: &Segment,
        drop: &BTreeSet<i64>,
        limit: Option<usize>,
    ) -> Result<Rewrite> {
        let mut scanner = RecordScanner::open(&self.log_path)?;
        let mut log = RecordWriter::open(&scratch.log_path)?;
        let mut index = IndexWriter::<E>::open(&scratch.index_path)?;
        let mut state = E::State::default();
        let mut rewrite = Rewrite {
            source_base: self.base_offset,
            segment: scratch.clone(),
            survived: BTreeSet::new(),
            deleted: BTreeSet::new(),
            deleted_size: 0,
        };

        let mut scanned = 0;
        while limit.map_or(true, |limit| scanned < limit) {
            let (_, record) = match scanner.next_record()? {
                Some(next) => next,
                None => break,
            };
            scanned += 1;

            if drop.contains(&record.offset) {
                rewrite.deleted_size += record.size() + E::SIZE as u64;
                rewrite.deleted.insert(record.offset);
                continue;
            }
            let position = log.write(&record)?;
            let (entry, next) = E::from_record(&record, position, state);
            index.write(&entry)?;
            state = next;
            rewrite.survived.insert(record.offset);
        }

        log.sync()?;
        index.sync()?;
        Ok(rewrite)
    }

    /// Copies both files into `dst`, skipping files whose size and mtime already match.
    pub fn backup(&self, dst: &Path) -> Result<()> {
        for src in [&self.log_path, &self.index_path] {
            let name = match src.file_name() {
                Some(name) => name,
                None => continue,
            };
            if !src.exists() {
                continue;
            }
            if copy_if_changed(src, &dst.join(name))? {
                debug!("Backed up {} to {}", src.display(), dst.display());
            }
        }
        Ok(())
    }

    /// Copies the first `log_len` and `index_len` bytes of the pair into `dst`.
    ///
    /// Used for the head segment, whose files may grow while the copy runs.
    pub fn backup_prefix(&self, dst: &Path, log_len: u64, index_len: u64) -> Result<()> {
        for (src, len) in [(&self.log_path, log_len), (&self.index_path, index_len)] {
            let name = match src.file_name() {
                Some(name) => name,
                None => continue,
            };
            copy_prefix(src, &dst.join(name), len)?;
        }
        debug!(
            "Backed up {} bytes of {} to {}",
            log_len,
            self.log_path.display(),
            dst.display()
        );
        Ok(())
    }

    /// Moves this pair onto `target`'s names, replacing any files already there.
    ///
    /// The target index is removed before either rename, so an interrupted move never pairs
    /// a new log with a stale index.
    pub fn move_to(&self, target: &Segment) -> Result<()> {
        remove_if_exists(&target.index_path)?;
        fs::rename(&self.log_path, &target.log_path)?;
        fs::rename(&self.index_path, &target.index_path)?;
        debug!(
            "Moved {} to {}",
            self.log_path.display(),
            target.log_path.display()
        );
        Ok(())
    }

    /// Deletes both files, index first.
    pub fn remove(&self) -> Result<()> {
        remove_if_exists(&self.index_path)?;
        remove_if_exists(&self.log_path)?;
        Ok(())
    }
}

/// Result of [`Segment::rewrite`]: a scratch pair holding the survivors.
#[derive(Debug)]
pub struct Rewrite {
    /// Base offset of the segment that was rewritten.
    pub source_base: i64,
    /// The scratch pair; its base is still the source base.
    pub segment: Segment,
    /// Offsets copied into the scratch pair.
    pub survived: BTreeSet<i64>,
    /// Offsets left out.
    pub deleted: BTreeSet<i64>,
    /// Record plus index bytes of the deleted records.
    pub deleted_size: u64,
}

impl Rewrite {
    /// Number of records the rewrite scanned.
    pub fn scanned(&self) -> usize {
        self.survived.len() + self.deleted.len()
    }

    /// Final segment for the survivors: named after the lowest surviving offset.
    pub fn target(&self) -> Option<Segment> {
        self.survived
            .first()
            .map(|&base| self.segment.sibling(base))
    }

    /// Moves the survivors into place and removes the source if it was renamed away.
    ///
    /// Returns the promoted segment, or `None` when nothing survived and the source is gone.
    pub(crate) fn promote(self) -> Result<Option<Segment>> {
        let source = self.segment.sibling(self.source_base);
        match self.target() {
            Some(target) => {
                self.segment.move_to(&target)?;
                if target.base_offset != source.base_offset {
                    source.remove()?;
                }
                Ok(Some(target))
            }
            None => {
                self.segment.remove()?;
                source.remove()?;
                debug!("Removed emptied segment {}", source.log_path.display());
                Ok(None)
            }
        }
    }

    /// Deletes the scratch pair.
    pub fn discard(self) -> Result<()> {
        self.segment.remove()
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn copy_if_changed(src: &Path, dst: &Path) -> Result<bool> {
    let src_meta = fs::metadata(src)?;
    if let Ok(dst_meta) = fs::metadata(dst) {
        let same_mtime = matches!(
            (src_meta.modified(), dst_meta.modified()),
            (Ok(a), Ok(b)) if a == b
        );
        if same_mtime && src_meta.len() == dst_meta.len() {
            return Ok(false);
        }
    }

    fs::copy(src, dst)?;
    if let Ok(modified) = src_meta.modified() {
        OpenOptions::new()
            .write(true)
            .open(dst)?
            .set_modified(modified)?;
    }
    Ok(true)
}

fn copy_prefix(src: &Path, dst: &Path, len: u64) -> Result<()> {
    let mut input = File::open(src)?.take(len);
    let mut output = File::create(dst)?;
    let copied = io::copy(&mut input, &mut output)?;
    if copied != len {
        return Err(LogError::Corrupted(format!(
            "{} is shorter than {} bytes",
            src.display(),
            len
        )));
    }
    output.sync_all()?;
    Ok(())
}
