//! Error and Result types for log storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for log operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// The error type for log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Offset lies outside the range covered by the log or segment.
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),

    /// Time precedes the first time-indexed record of a segment.
    #[error("Time {0} is before the first indexed record")]
    TimeBeforeStart(i64),

    /// Offset is within range but has no record (never written here, or deleted).
    #[error("Offset not found: {0}")]
    OffsetNotFound(i64),

    /// No record carries the requested key.
    #[error("Key not found")]
    KeyNotFound,

    /// No record is at or after the requested time.
    #[error("No record at or after time {0}")]
    TimeNotFound(i64),

    /// The index has no entries yet.
    ///
    /// Readers translate this before it reaches callers of [`crate::Log`].
    #[error("Index is empty")]
    IndexEmpty,

    /// Stored record checksum does not match its payload.
    #[error("Checksum mismatch at position {position}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Byte position of the record in its log file.
        position: i64,
        /// CRC32C stored in the record header.
        expected: u32,
        /// CRC32C computed over the payload.
        actual: u32,
    },

    /// Truncated or malformed record or index data.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// A key or value is too long for the record header's 32-bit length field.
    #[error("Record {part} of {len} bytes exceeds the maximum length")]
    RecordTooLarge {
        /// `"key"` or `"value"`.
        part: &'static str,
        /// Length of the rejected part in bytes.
        len: usize,
    },

    /// A key or time lookup was requested without the matching index.
    #[error("No {0} index: enable it in LogOptions")]
    NoIndex(&'static str),

    /// A mutating call was made on a read-only log.
    #[error("Log is opened read-only")]
    Readonly,

    /// The segment was appended to while a delete was rewriting it.
    #[error("Segment changed during delete, retry")]
    SegmentChanged,

    /// The log or notifier has been closed.
    #[error("Log is closed")]
    Closed,

    /// A blocking wait was cancelled or reached its deadline.
    #[error("Wait cancelled")]
    Cancelled,

    /// Another process holds the directory lock.
    #[error("Log directory is locked: {0}")]
    Locked(PathBuf),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl LogError {
    /// Returns true for well-formed lookups that simply have no match.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::OffsetNotFound(_) | Self::KeyNotFound | Self::TimeNotFound(_)
        )
    }

    /// Returns true when the requested offset or time is outside the indexed range.
    pub fn is_invalid_offset(&self) -> bool {
        matches!(self, Self::InvalidOffset(_) | Self::TimeBeforeStart(_))
    }

    /// Returns true when stored data failed validation.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Corrupted(_))
    }

    /// Returns true if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SegmentChanged)
    }
}
