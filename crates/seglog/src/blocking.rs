//! Blocking consumption on top of [`Log`].

use crate::config::LogOptions;
use crate::error::Result;
use crate::log::Log;
use crate::notify::{CancelToken, OffsetNotify};
use crate::record::Record;
use crate::segment::Stats;
use std::collections::BTreeSet;
use std::path::Path;

/// A [`Log`] whose consumers can wait for new records.
///
/// Publishes must go through this wrapper so the watermark sees them.
pub struct BlockingLog {
    log: Log,
    notify: OffsetNotify,
}

impl BlockingLog {
    /// Opens the log in `dir`; see [`Log::open`].
    pub fn open(dir: impl AsRef<Path>, opts: LogOptions) -> Result<Self> {
        Self::new(Log::open(dir, opts)?)
    }

    /// Wraps an open log, starting the watermark at its next offset.
    pub fn new(log: Log) -> Result<Self> {
        let notify = OffsetNotify::new(log.next_offset()?);
        Ok(Self { log, notify })
    }

    /// Appends `records` and wakes blocked consumers.
    pub fn publish(&self, records: &[Record]) -> Result<i64> {
        let next = self.log.publish(records)?;
        self.notify.set(next)?;
        Ok(next)
    }

    /// Like [`Log::consume`], but waits for records when none are available yet.
    ///
    /// Fails with `Cancelled` when `cancel` fires first.
    pub fn consume_blocking(
        &self,
        cancel: &CancelToken,
        offset: i64,
        max: usize,
    ) -> Result<(i64, Vec<Record>)> {
        let mut offset = offset;
        loop {
            let (next, records) = self.log.consume(offset, max)?;
            if !records.is_empty() {
                return Ok((next, records));
            }
            offset = next;
            self.notify.wait(next, cancel)?;
        }
    }

    /// Like [`Log::consume_by_key`], but waits until a record with `key` arrives.
    pub fn consume_by_key_blocking(
        &self,
        cancel: &CancelToken,
        key: &[u8],
        offset: i64,
        max: usize,
    ) -> Result<(i64, Vec<Record>)> {
        let mut offset = offset;
        loop {
            let (next, records) = self.log.consume_by_key(key, offset, max)?;
            if !records.is_empty() {
                return Ok((next, records));
            }
            offset = next;
            self.notify.wait(next, cancel)?;
        }
    }

    /// The watermark shared with blocked consumers.
    pub fn notifier(&self) -> &OffsetNotify {
        &self.notify
    }

    /// See [`Log::consume`].
    pub fn consume(&self, offset: i64, max: usize) -> Result<(i64, Vec<Record>)> {
        self.log.consume(offset, max)
    }

    /// See [`Log::consume_by_key`].
    pub fn consume_by_key(
        &self,
        key: &[u8],
        offset: i64,
        max: usize,
    ) -> Result<(i64, Vec<Record>)> {
        self.log.consume_by_key(key, offset, max)
    }

    /// See [`Log::get`].
    pub fn get(&self, offset: i64) -> Result<Record> {
        self.log.get(offset)
    }

    /// See [`Log::get_by_key`].
    pub fn get_by_key(&self, key: &[u8]) -> Result<Record> {
        self.log.get_by_key(key)
    }

    /// See [`Log::offset_by_key`].
    pub fn offset_by_key(&self, key: &[u8]) -> Result<i64> {
        self.log.offset_by_key(key)
    }

    /// See [`Log::get_by_time`].
    pub fn get_by_time(&self, time: i64) -> Result<Record> {
        self.log.get_by_time(time)
    }

    /// See [`Log::offset_by_time`].
    pub fn offset_by_time(&self, time: i64) -> Result<(i64, i64)> {
        self.log.offset_by_time(time)
    }

    /// See [`Log::delete`].
    pub fn delete(&self, offsets: &BTreeSet<i64>) -> Result<(BTreeSet<i64>, u64)> {
        self.log.delete(offsets)
    }

    /// See [`Log::next_offset`].
    pub fn next_offset(&self) -> Result<i64> {
        self.log.next_offset()
    }

    /// See [`Log::size`].
    pub fn size(&self, record: &Record) -> u64 {
        self.log.size(record)
    }

    /// See [`Log::stat`].
    pub fn stat(&self) -> Result<Stats> {
        self.log.stat()
    }

    /// See [`Log::backup`].
    pub fn backup(&self, dst: impl AsRef<Path>) -> Result<()> {
        self.log.backup(dst)
    }

    /// See [`Log::sync`].
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Releases blocked consumers with `Closed`, then closes the log.
    pub fn close(&self) -> Result<()> {
        self.notify.close();
        self.log.close()
    }
}

impl AsRef<Log> for BlockingLog {
    fn as_ref(&self) -> &Log {
        &self.log
    }
}
