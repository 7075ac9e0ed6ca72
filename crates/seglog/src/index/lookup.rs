//! Binary-search lookups over an ordered slice of index entries.

use super::IndexEntry;
use crate::error::{LogError, Result};
use crate::record::{OFFSET_NEWEST, OFFSET_OLDEST};

fn bounds<E: IndexEntry>(entries: &[E]) -> Result<(&E, &E)> {
    match (entries.first(), entries.last()) {
        (Some(first), Some(last)) => Ok((first, last)),
        _ => Err(LogError::IndexEmpty),
    }
}

/// Finds the inclusive position window `(start, max)` for a range read starting at `offset`.
///
/// Offsets before the first entry start at the first entry; offsets in a gap skip forward
/// to the next surviving entry.
pub fn consume<E: IndexEntry>(entries: &[E], offset: i64) -> Result<(i64, i64)> {
    let (first, last) = bounds(entries)?;
    match offset {
        OFFSET_OLDEST => return Ok((first.position(), last.position())),
        OFFSET_NEWEST => return Ok((last.position(), last.position())),
        o if o < 0 => return Err(LogError::InvalidOffset(o)),
        _ => {}
    }

    if offset <= first.offset() {
        return Ok((first.position(), last.position()));
    }
    if offset > last.offset() {
        return Err(LogError::InvalidOffset(offset));
    }

    let at = entries.partition_point(|e| e.offset() < offset);
    Ok((entries[at].position(), last.position()))
}

/// Finds the entry for exactly `offset`.
pub fn get<E: IndexEntry>(entries: &[E], offset: i64) -> Result<&E> {
    let (first, last) = bounds(entries)?;
    if offset < 0 {
        return Err(LogError::InvalidOffset(offset));
    }
    if offset < first.offset() {
        return Err(LogError::OffsetNotFound(offset));
    }
    if offset > last.offset() {
        return Err(LogError::InvalidOffset(offset));
    }

    entries
        .binary_search_by_key(&offset, |e| e.offset())
        .map(|at| &entries[at])
        .map_err(|_| LogError::OffsetNotFound(offset))
}

/// Finds the first entry whose time is at or after `time`.
pub fn by_time<E: IndexEntry>(entries: &[E], time: i64) -> Result<&E> {
    let (first, last) = bounds(entries)?;
    if time < first.time() {
        return Err(LogError::TimeBeforeStart(time));
    }
    if time > last.time() {
        return Err(LogError::TimeNotFound(time));
    }

    let at = entries.partition_point(|e| e.time() < time);
    Ok(&entries[at])
}
