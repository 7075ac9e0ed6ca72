//! Maintenance on closed log directories, and the multi-segment delete loop.

use crate::config::{IndexKind, LogOptions};
use crate::error::Result;
use crate::index::{IndexEntry, KeyEntry, KeyTimeEntry, PlainEntry, TimeEntry};
use crate::lock::DirLock;
use crate::log::Log;
use crate::segment::{RecoverReport, Segment, Stats};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

macro_rules! with_flavor {
    ($opts:expr, $f:ident($($arg:expr),*)) => {
        match $opts.index_kind() {
            IndexKind::Plain => $f::<PlainEntry>($($arg),*),
            IndexKind::Keyed => $f::<KeyEntry>($($arg),*),
            IndexKind::Timed => $f::<TimeEntry>($($arg),*),
            IndexKind::KeyedTimed => $f::<KeyTimeEntry>($($arg),*),
        }
    };
}

/// Segment, record and byte counts of the log in `dir`.
pub fn stat(dir: impl AsRef<Path>, opts: &LogOptions) -> Result<Stats> {
    let dir = dir.as_ref();
    let _lock = DirLock::acquire(dir, true)?;
    with_flavor!(opts, stat_segments(dir))
}

fn stat_segments<E: IndexEntry>(dir: &Path) -> Result<Stats> {
    let mut stats = Stats::default();
    for segment in Segment::list(dir)? {
        stats += segment.stat::<E>()?;
    }
    Ok(stats)
}

/// Verifies that the head segment's index matches its log.
///
/// Only the head segment is checked. Sealed indexes are not compared against their logs
/// here; run [`recover`] to rebuild any that disagree.
pub fn check(dir: impl AsRef<Path>, opts: &LogOptions) -> Result<()> {
    let dir = dir.as_ref();
    let _lock = DirLock::acquire(dir, true)?;
    with_flavor!(opts, check_head(dir))
}

fn check_head<E: IndexEntry>(dir: &Path) -> Result<()> {
    match Segment::list(dir)?.pop() {
        Some(head) => head.check::<E>(),
        None => Ok(()),
    }
}

/// Truncates corrupted log tails and removes indexes that disagree with their logs.
///
/// Removed indexes are rebuilt on the next open.
pub fn recover(dir: impl AsRef<Path>, opts: &LogOptions) -> Result<RecoverReport> {
    let dir = dir.as_ref();
    let _lock = DirLock::acquire(dir, false)?;
    Segment::clean_rewrites(dir)?;
    let report = with_flavor!(opts, recover_segments(dir))?;
    info!(
        "Recovered {}: {} bytes truncated, index removed: {}",
        dir.display(),
        report.truncated_bytes,
        report.index_removed
    );
    Ok(report)
}

fn recover_segments<E: IndexEntry>(dir: &Path) -> Result<RecoverReport> {
    let mut report = RecoverReport::default();
    for segment in Segment::list(dir)? {
        report += segment.recover::<E>()?;
    }
    Ok(report)
}

/// Copies every segment of the log in `src` into `dst`, skipping unchanged files.
pub fn backup(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let _lock = DirLock::acquire(src, true)?;
    fs::create_dir_all(dst)?;
    for segment in Segment::list(src)? {
        segment.backup(dst)?;
    }
    Ok(())
}

/// Deletes `offsets` across segments by calling [`Log::delete`] until nothing more goes.
///
/// `SegmentChanged` is retried. `backoff` runs before every call after the first; an error
/// from it stops the loop. Returns the offsets deleted and the bytes freed.
pub fn delete_multi<F>(
    log: &Log,
    offsets: &BTreeSet<i64>,
    mut backoff: F,
) -> Result<(BTreeSet<i64>, u64)>
where
    F: FnMut() -> Result<()>,
{
    let mut remaining = offsets.clone();
    let mut deleted = BTreeSet::new();
    let mut freed = 0;
    let mut first = true;

    while !remaining.is_empty() {
        if !first {
            backoff()?;
        }
        first = false;

        let (batch, size) = match log.delete(&remaining) {
            Ok(result) => result,
            Err(e) if e.is_retryable() => {
                debug!("Delete raced a concurrent change, retrying");
                continue;
            }
            Err(e) => return Err(e),
        };
        let highest = match batch.last() {
            Some(&highest) => highest,
            None => break,
        };

        // Offsets up to the highest deleted one lived in that segment and are now gone.
        remaining.retain(|&offset| offset > highest);
        deleted.extend(batch);
        freed += size;
    }

    Ok((deleted, freed))
}
