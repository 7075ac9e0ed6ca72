//! Read path for one segment.
//!
//! A head reader shares the writer's live index and reads the log with positioned reads.
//! A sealed reader loads its index and maps its log on first use; both are built at most
//! once and can be dropped again with [`Reader::close`].

use crate::error::{LogError, Result};
use crate::index::{key_hash, IndexEntry, IndexRuntime};
use crate::record::{read_at, MappedLog, Record, OFFSET_NEWEST, OFFSET_OLDEST};
use crate::segment::{Rewrite, Segment, Stats};
use crate::writer::LiveSegment;
use once_cell::sync::OnceCell;
use std::sync::Arc;

enum Source<E: IndexEntry> {
    Live(Arc<LiveSegment<E>>),
    Sealed {
        index: OnceCell<IndexRuntime<E>>,
        log: OnceCell<MappedLog>,
    },
}

/// Reader over one segment.
pub struct Reader<E: IndexEntry> {
    segment: Segment,
    head: bool,
    source: Source<E>,
}

impl<E: IndexEntry> Reader<E> {
    pub(crate) fn live(segment: Segment, live: Arc<LiveSegment<E>>) -> Self {
        Self {
            segment,
            head: true,
            source: Source::Live(live),
        }
    }

    /// Sealed reader that loads its index lazily.
    ///
    /// `head` marks the newest segment of a read-only log, which reports an empty window
    /// instead of an error when reading at its next offset.
    pub fn sealed(segment: Segment, head: bool) -> Self {
        Self {
            segment,
            head,
            source: Source::Sealed {
                index: OnceCell::new(),
                log: OnceCell::new(),
            },
        }
    }

    pub(crate) fn sealed_with(segment: Segment, runtime: IndexRuntime<E>) -> Self {
        Self {
            segment,
            head: false,
            source: Source::Sealed {
                index: OnceCell::with_value(runtime),
                log: OnceCell::new(),
            },
        }
    }

    /// Segment this reader serves.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Whether this reader serves the newest segment.
    pub fn is_head(&self) -> bool {
        self.head
    }

    /// Runs `f` against the index, loading it first if needed.
    fn with_index<T>(&self, f: impl FnOnce(&IndexRuntime<E>) -> Result<T>) -> Result<T> {
        match &self.source {
            Source::Live(live) => f(&live.runtime()),
            Source::Sealed { index, .. } => {
                let runtime = index.get_or_try_init(|| {
                    let entries = self.segment.reindex_and_read_index::<E>()?;
                    Ok::<_, LogError>(IndexRuntime::new(self.segment.base_offset(), entries))
                })?;
                f(runtime)
            }
        }
    }

    /// Reads the record at `position` and the position after it.
    pub fn read(&self, position: i64) -> Result<Option<(Record, i64)>> {
        match &self.source {
            Source::Live(live) => read_at(live.file(), position),
            Source::Sealed { log, .. } => log
                .get_or_try_init(|| MappedLog::open(self.segment.log_path()))?
                .read(position),
        }
    }

    fn read_indexed(&self, position: i64) -> Result<(Record, i64)> {
        self.read(position)?.ok_or_else(|| {
            LogError::Corrupted(format!(
                "indexed position {} is past the end of {}",
                position,
                self.segment.log_path().display()
            ))
        })
    }

    /// Offset the next record in this segment would get.
    pub fn next_offset(&self) -> Result<i64> {
        self.with_index(|index| Ok(index.next_offset()))
    }

    /// Offset and effective time of the first record, if any.
    pub fn first_entry(&self) -> Result<Option<(i64, i64)>> {
        self.with_index(|index| Ok(index.first().map(|e| (e.offset(), e.time()))))
    }

    /// Reads up to `max` records (at least one) starting at `offset`.
    ///
    /// Returns the offset to continue from. Reading at the head's next offset, or from an
    /// empty head, yields no records rather than an error.
    pub fn consume(&self, offset: i64, max: usize) -> Result<(i64, Vec<Record>)> {
        let window = self.with_index(|index| {
            let next = index.next_offset();
            if offset == OFFSET_NEWEST {
                return Ok((next, None));
            }
            match index.consume(offset) {
                Ok(window) => Ok((next, Some(window))),
                Err(LogError::IndexEmpty)
                    if self.head && (offset == OFFSET_OLDEST || offset <= next) =>
                {
                    Ok((next, None))
                }
                Err(LogError::IndexEmpty) => Err(LogError::InvalidOffset(offset)),
                Err(LogError::InvalidOffset(o)) if self.head && o == next => Ok((next, None)),
                Err(e) => Err(e),
            }
        })?;

        let (next, (start, end)) = match window {
            (next, None) => return Ok((next, Vec::new())),
            (next, Some(window)) => (next, window),
        };

        let mut records = Vec::new();
        let mut position = start;
        while position <= end && records.len() < max.max(1) {
            let (record, following) = self.read_indexed(position)?;
            records.push(record);
            position = following;
        }

        let next = if position <= end {
            records.last().map_or(next, |r| r.offset + 1)
        } else {
            next
        };
        Ok((next, records))
    }

    /// Reads the record at exactly `offset`.
    pub fn get(&self, offset: i64) -> Result<Record> {
        let position = self.with_index(|index| match index.get(offset) {
            Ok(entry) => Ok(entry.position()),
            Err(LogError::IndexEmpty) if offset >= 0 && offset < index.next_offset() => {
                Err(LogError::OffsetNotFound(offset))
            }
            Err(LogError::IndexEmpty) => Err(LogError::InvalidOffset(offset)),
            Err(e) => Err(e),
        })?;
        Ok(self.read_indexed(position)?.0)
    }

    /// Reads `positions` in order and keeps up to `limit` records whose key is `key`.
    fn matching(&self, key: &[u8], positions: Vec<i64>, limit: usize) -> Result<Vec<Record>> {
        let mut found = Vec::new();
        for position in positions {
            if found.len() >= limit {
                break;
            }
            let (record, _) = self.read_indexed(position)?;
            if record.key.as_deref() == Some(key) {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Reads the newest record with `key`.
    pub fn get_by_key(&self, key: &[u8]) -> Result<Record> {
        let hash = key_hash(Some(key));
        let positions =
            self.with_index(|index| Ok(index.by_hash(hash).map(|e| e.position()).collect()))?;
        self.matching(key, positions, 1)?
            .pop()
            .ok_or(LogError::KeyNotFound)
    }

    /// Reads up to `max` records (at least one) with `key` at or after `offset`, oldest first.
    ///
    /// Returns the offset to continue from: one past the last record returned when `max` was
    /// reached, otherwise the segment's next offset.
    pub fn consume_by_key(
        &self,
        key: &[u8],
        offset: i64,
        max: usize,
    ) -> Result<(i64, Vec<Record>)> {
        let hash = key_hash(Some(key));
        let (next, positions) = self.with_index(|index| {
            let next = index.next_offset();
            let from = match offset {
                OFFSET_OLDEST => i64::MIN,
                OFFSET_NEWEST => next,
                o => o,
            };
            let positions = index
                .by_hash_from(hash, from)
                .map(|e| e.position())
                .collect::<Vec<_>>();
            Ok((next, positions))
        })?;

        let limit = max.max(1);
        let records = self.matching(key, positions, limit)?;
        let next = match records.last() {
            Some(last) if records.len() == limit => last.offset + 1,
            _ => next.max(offset),
        };
        Ok((next, records))
    }

    /// Offset and effective time of the first record at or after `time`.
    pub fn time_entry(&self, time: i64) -> Result<(i64, i64)> {
        self.with_index(|index| index.by_time(time).map(|e| (e.offset(), e.time())))
    }

    /// Counts records and bytes of the segment files.
    pub fn stat(&self) -> Result<Stats> {
        self.segment.stat::<E>()
    }

    /// Drops the cached index and log mapping of a sealed reader.
    pub fn close(&mut self) {
        if let Source::Sealed { index, log } = &mut self.source {
            index.take();
            log.take();
        }
    }

    /// Loads the index and maps the log of a sealed reader if not done yet.
    ///
    /// A loaded reader keeps reading the files it opened even after they are renamed or
    /// removed.
    pub fn load(&self) -> Result<()> {
        self.with_index(|_| Ok(()))?;
        if let Source::Sealed { log, .. } = &self.source {
            log.get_or_try_init(|| MappedLog::open(self.segment.log_path()))?;
        }
        Ok(())
    }

    /// Moves the survivors of a sealed-segment rewrite into place.
    ///
    /// Returns a reader for the promoted segment, or `None` when nothing survived.
    pub fn promote(rewrite: Rewrite) -> Result<Option<Reader<E>>> {
        Ok(rewrite
            .promote()?
            .map(|segment| Reader::sealed(segment, false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{KeyEntry, PlainEntry};
    use crate::writer::Writer;
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::TempDir;

    fn sealed_with_records<E: IndexEntry>(dir: &Path, records: &[Record]) -> Reader<E> {
        let mut writer = Writer::<E>::open(Segment::new(dir, 0)).unwrap();
        writer.publish(records).unwrap();
        let segment = writer.segment().clone();
        writer.close().unwrap();
        Reader::sealed(segment, false)
    }

    fn offsets(records: &[Record]) -> Vec<i64> {
        records.iter().map(|r| r.offset).collect()
    }

    #[test]
    fn test_consume_window_and_max() {
        let temp_dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..5).map(|i| Record::from_value(vec![i as u8])).collect();
        let reader = sealed_with_records::<PlainEntry>(temp_dir.path(), &records);

        let (next, all) = reader.consume(OFFSET_OLDEST, 100).unwrap();
        assert_eq!((next, offsets(&all)), (5, vec![0, 1, 2, 3, 4]));

        let (next, some) = reader.consume(1, 2).unwrap();
        assert_eq!((next, offsets(&some)), (3, vec![1, 2]));

        let (next, one) = reader.consume(4, 0).unwrap();
        assert_eq!((next, offsets(&one)), (5, vec![4]));

        assert!(reader.consume(OFFSET_NEWEST, 10).unwrap().1.is_empty());
        assert!(matches!(
            reader.consume(5, 10),
            Err(LogError::InvalidOffset(5))
        ));
    }

    #[test]
    fn test_head_reader_empty_and_tail() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = Writer::<PlainEntry>::open(Segment::new(temp_dir.path(), 0)).unwrap();
        let reader = writer.reader();

        assert_eq!(reader.consume(0, 10).unwrap(), (0, Vec::new()));
        assert_eq!(reader.consume(OFFSET_OLDEST, 10).unwrap(), (0, Vec::new()));
        assert!(matches!(reader.get(0), Err(LogError::InvalidOffset(0))));

        writer.publish(&[Record::from_value("a")]).unwrap();
        let (next, records) = reader.consume(0, 10).unwrap();
        assert_eq!((next, records.len()), (1, 1));
        assert_eq!(reader.consume(1, 10).unwrap(), (1, Vec::new()));
        assert!(reader.consume(2, 10).unwrap_err().is_invalid_offset());
    }

    #[test]
    fn test_key_lookups() {
        let temp_dir = TempDir::new().unwrap();
        let records = vec![
            Record::new("a", "1"),
            Record::new("b", "2"),
            Record::new("a", "3"),
            Record::from_value("no key"),
        ];
        let reader = sealed_with_records::<KeyEntry>(temp_dir.path(), &records);

        assert_eq!(reader.get_by_key(b"a").unwrap().value.unwrap(), b"3");
        assert!(matches!(
            reader.get_by_key(b"zz"),
            Err(LogError::KeyNotFound)
        ));

        let (next, found) = reader.consume_by_key(b"a", 0, 10).unwrap();
        assert_eq!((next, offsets(&found)), (4, vec![0, 2]));

        let (next, found) = reader.consume_by_key(b"a", 0, 1).unwrap();
        assert_eq!((next, offsets(&found)), (1, vec![0]));

        let (next, found) = reader.consume_by_key(b"a", 3, 10).unwrap();
        assert_eq!((next, found.len()), (4, 0));
    }

    #[test]
    fn test_close_reloads_lazily() {
        let temp_dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..3).map(|i| Record::from_value(vec![i as u8])).collect();
        let mut reader = sealed_with_records::<PlainEntry>(temp_dir.path(), &records);

        assert_eq!(reader.get(1).unwrap().value.unwrap(), vec![1]);
        reader.close();
        std::fs::remove_file(reader.segment().index_path()).unwrap();

        assert_eq!(reader.get(2).unwrap().value.unwrap(), vec![2]);
        assert!(reader.segment().index_path().exists());
        assert_eq!(reader.stat().unwrap().messages, 3);
    }

    #[test]
    fn test_delete_sealed() {
        let temp_dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..4).map(|i| Record::from_value(vec![i as u8])).collect();
        let reader = sealed_with_records::<PlainEntry>(temp_dir.path(), &records);
        reader.get(0).unwrap();

        let drop: BTreeSet<i64> = [0, 2].into_iter().collect();
        let rewrite = reader.segment().rewrite::<PlainEntry>(&drop, None).unwrap();
        let promoted = Reader::<PlainEntry>::promote(rewrite).unwrap().unwrap();

        assert_eq!(promoted.segment().base_offset(), 1);
        assert!(matches!(promoted.get(0), Err(LogError::OffsetNotFound(0))));
        assert!(matches!(promoted.get(2), Err(LogError::OffsetNotFound(2))));
        let (next, rest) = promoted.consume(0, 10).unwrap();
        assert_eq!((next, offsets(&rest)), (4, vec![1, 3]));

        let everything: BTreeSet<i64> = [1, 3].into_iter().collect();
        let rewrite = promoted
            .segment()
            .rewrite::<PlainEntry>(&everything, None)
            .unwrap();
        assert!(Reader::<PlainEntry>::promote(rewrite).unwrap().is_none());
        assert!(Segment::list(temp_dir.path()).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_loaded_reader_survives_promotion() {
        let temp_dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..4).map(|i| Record::from_value(vec![i as u8])).collect();
        let old = sealed_with_records::<PlainEntry>(temp_dir.path(), &records);
        old.load().unwrap();

        let drop: BTreeSet<i64> = [1].into_iter().collect();
        let rewrite = old.segment().rewrite::<PlainEntry>(&drop, None).unwrap();
        let promoted = Reader::<PlainEntry>::promote(rewrite).unwrap().unwrap();
        assert_eq!(promoted.segment(), old.segment());

        let (_, before) = old.consume(0, 10).unwrap();
        assert_eq!(offsets(&before), vec![0, 1, 2, 3]);
        assert_eq!(old.get(3).unwrap().value.unwrap(), vec![3]);

        let (_, after) = promoted.consume(0, 10).unwrap();
        assert_eq!(offsets(&after), vec![0, 2, 3]);
    }
}
