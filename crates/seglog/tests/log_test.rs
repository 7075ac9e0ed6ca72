//! Integration tests for the log coordinator: publish, consume, lookups, deletes and rollover.

use alopex_seglog::index::{IndexEntry, PlainEntry};
use alopex_seglog::{delete_multi, Log, LogError, LogOptions, Record, OFFSET_NEWEST, OFFSET_OLDEST};
use std::collections::BTreeSet;
use tempfile::TempDir;

fn value(i: usize) -> Record {
    Record::from_value(format!("value-{i:04}"))
}

/// On-disk size of one `value(_)` record with a plain index.
fn value_size() -> u64 {
    value(0).size() + PlainEntry::SIZE as u64
}

/// Options that roll over after exactly `per_segment` single-record publishes.
fn rolling(per_segment: u64) -> LogOptions {
    LogOptions::default()
        .with_create_dirs(true)
        .with_rollover_size(per_segment * value_size() - 1)
}

fn publish_one_by_one(log: &Log, count: usize) {
    for i in 0..count {
        log.publish(&[value(i)]).unwrap();
    }
}

/// Consumes from the oldest record to the end, following segment boundaries.
fn consume_all(log: &Log) -> Vec<i64> {
    let mut offsets = Vec::new();
    let mut offset = OFFSET_OLDEST;
    loop {
        let (next, records) = log.consume(offset, 1000).unwrap();
        if records.is_empty() {
            return offsets;
        }
        offsets.extend(records.iter().map(|r| r.offset));
        offset = next;
    }
}

fn set(offsets: &[i64]) -> BTreeSet<i64> {
    offsets.iter().copied().collect()
}

#[test]
fn test_offsets_follow_publish_count() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(4)).unwrap();

    let mut published = 0;
    for batch in [1, 3, 0, 5, 2] {
        let records: Vec<Record> = (0..batch).map(value).collect();
        published += batch as i64;
        assert_eq!(log.publish(&records).unwrap(), published);
    }
    assert_eq!(log.next_offset().unwrap(), published);

    log.delete(&set(&[published - 1])).unwrap();
    assert_eq!(log.next_offset().unwrap(), published);
    assert_eq!(log.publish(&[value(0)]).unwrap(), published + 1);
}

#[test]
fn test_consume_skips_deleted_offsets() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), LogOptions::default()).unwrap();
    log.publish(&(0..4).map(value).collect::<Vec<_>>()).unwrap();

    let (deleted, freed) = log.delete(&set(&[0, 2])).unwrap();
    assert_eq!(deleted, set(&[0, 2]));
    assert_eq!(freed, 2 * value_size());

    let (next, records) = log.consume(0, 100).unwrap();
    assert_eq!(next, 4);
    assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 3]);

    assert!(matches!(log.get(0), Err(LogError::OffsetNotFound(0))));
    assert!(matches!(log.get(2), Err(LogError::OffsetNotFound(2))));
    assert_eq!(log.get(1).unwrap().value, value(1).value);
    assert_eq!(log.get(3).unwrap().value, value(3).value);
}

#[test]
fn test_rollover_segmentation() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(3)).unwrap();
    publish_one_by_one(&log, 10);

    let stats = log.stat().unwrap();
    assert_eq!(stats.segments, 4);
    assert_eq!(stats.messages, 10);
    assert_eq!(stats.size, 10 * value_size());

    assert_eq!(consume_all(&log), (0..10).collect::<Vec<_>>());
    for offset in [0, 2, 3, 8, 9] {
        assert_eq!(log.get(offset).unwrap().offset, offset);
    }
    assert!(log.get(10).unwrap_err().is_invalid_offset());
}

#[test]
fn test_consume_crosses_deleted_segment_tail() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(3)).unwrap();
    publish_one_by_one(&log, 6);

    log.delete(&set(&[2])).unwrap();

    let (next, records) = log.consume(0, 100).unwrap();
    assert_eq!(next, 2);
    assert_eq!(records.len(), 2);

    let (next, records) = log.consume(2, 100).unwrap();
    assert_eq!(next, 6);
    assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4, 5]);
    assert!(matches!(log.get(2), Err(LogError::OffsetNotFound(2))));
}

#[test]
fn test_consume_at_tail_and_beyond() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(2)).unwrap();
    publish_one_by_one(&log, 3);

    assert_eq!(log.consume(3, 10).unwrap(), (3, Vec::new()));
    assert_eq!(log.consume(OFFSET_NEWEST, 10).unwrap(), (3, Vec::new()));
    assert!(log.consume(4, 10).unwrap_err().is_invalid_offset());
    assert!(log.consume(-9, 10).unwrap_err().is_invalid_offset());
}

#[test]
fn test_key_lookup_returns_latest() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_key_index(true);
    let log = Log::open(temp_dir.path(), opts).unwrap();

    log.publish(&[
        Record::new("k", "first"),
        Record::new("other", "x"),
        Record::new("k", "second"),
    ])
    .unwrap();

    assert_eq!(log.get_by_key(b"k").unwrap().value.unwrap(), b"second");
    assert_eq!(log.offset_by_key(b"k").unwrap(), 2);
    assert!(matches!(log.get_by_key(b"missing"), Err(LogError::KeyNotFound)));

    let (next, records) = log.consume_by_key(b"k", 0, 10).unwrap();
    assert_eq!(next, 3);
    let values: Vec<Vec<u8>> = records.into_iter().filter_map(|r| r.value).collect();
    assert_eq!(values, vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn test_key_consume_rejects_out_of_range_offsets() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_key_index(true);
    let log = Log::open(temp_dir.path(), opts).unwrap();
    log.publish(&[Record::new("k", "a"), Record::new("k", "b")]).unwrap();

    assert_eq!(log.consume_by_key(b"k", 2, 10).unwrap(), (2, Vec::new()));
    assert_eq!(log.consume_by_key(b"k", OFFSET_OLDEST, 10).unwrap().1.len(), 2);
    assert!(matches!(
        log.consume_by_key(b"k", -7, 10),
        Err(LogError::InvalidOffset(-7))
    ));
    assert!(matches!(
        log.consume_by_key(b"k", 3, 10),
        Err(LogError::InvalidOffset(3))
    ));
}

#[test]
fn test_key_lookup_across_segments() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default()
        .with_key_index(true)
        .with_rollover_size(1);
    let log = Log::open(temp_dir.path(), opts).unwrap();

    for (key, val) in [("a", "1"), ("b", "2"), ("a", "3"), ("c", "4")] {
        log.publish(&[Record::new(key, val)]).unwrap();
    }
    assert_eq!(log.stat().unwrap().segments, 4);
    assert_eq!(log.get_by_key(b"a").unwrap().offset, 2);

    let mut found = Vec::new();
    let mut offset = 0;
    while offset < log.next_offset().unwrap() {
        let (next, records) = log.consume_by_key(b"a", offset, 10).unwrap();
        found.extend(records.iter().map(|r| r.offset));
        if records.is_empty() {
            break;
        }
        offset = next;
    }
    assert_eq!(found, vec![0, 2]);
}

#[test]
fn test_time_lookup_uses_clamped_times() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_time_index(true);
    let log = Log::open(temp_dir.path(), opts).unwrap();

    let records: Vec<Record> = [100, 300, 200, 400]
        .iter()
        .map(|&time| Record::from_value("t").with_time(time))
        .collect();
    log.publish(&records).unwrap();

    assert_eq!(log.offset_by_time(250).unwrap(), (1, 300));
    assert_eq!(log.offset_by_time(300).unwrap(), (1, 300));
    assert_eq!(log.offset_by_time(301).unwrap(), (3, 400));
    assert_eq!(log.offset_by_time(50).unwrap(), (0, 100));
    assert_eq!(log.get_by_time(200).unwrap().time, 300);
    assert!(matches!(
        log.offset_by_time(401),
        Err(LogError::TimeNotFound(401))
    ));
}

#[test]
fn test_time_lookup_across_segments() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default()
        .with_time_index(true)
        .with_rollover_size(1);
    let log = Log::open(temp_dir.path(), opts).unwrap();

    for time in [100, 200, 300, 400] {
        log.publish(&[Record::from_value("t").with_time(time)]).unwrap();
    }

    assert_eq!(log.offset_by_time(250).unwrap(), (2, 300));
    assert_eq!(log.offset_by_time(200).unwrap(), (1, 200));
    assert_eq!(log.offset_by_time(10).unwrap(), (0, 100));
    assert!(log.offset_by_time(500).unwrap_err().is_not_found());
}

#[test]
fn test_readonly_log() {
    let temp_dir = TempDir::new().unwrap();
    {
        let log = Log::open(temp_dir.path(), rolling(2)).unwrap();
        publish_one_by_one(&log, 5);
        log.close().unwrap();
    }

    let opts = LogOptions::default().with_readonly(true);
    let log = Log::open(temp_dir.path(), opts).unwrap();
    assert_eq!(log.next_offset().unwrap(), 5);
    assert_eq!(consume_all(&log), (0..5).collect::<Vec<_>>());
    assert_eq!(log.consume(5, 10).unwrap(), (5, Vec::new()));
    assert!(log.get(5).unwrap_err().is_invalid_offset());

    assert!(matches!(log.publish(&[value(0)]), Err(LogError::Readonly)));
    assert!(matches!(log.delete(&set(&[0])), Err(LogError::Readonly)));
    assert!(matches!(log.sync(), Err(LogError::Readonly)));
}

#[test]
fn test_readonly_empty_directory() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), LogOptions::default().with_readonly(true)).unwrap();

    assert_eq!(log.next_offset().unwrap(), 0);
    assert_eq!(log.consume(OFFSET_OLDEST, 10).unwrap(), (0, Vec::new()));
    assert!(log.get(0).unwrap_err().is_invalid_offset());
    assert_eq!(log.stat().unwrap().segments, 0);
}

#[cfg(unix)]
#[test]
fn test_directory_lock() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), LogOptions::default()).unwrap();

    assert!(matches!(
        Log::open(temp_dir.path(), LogOptions::default()),
        Err(LogError::Locked(_))
    ));
    assert!(matches!(
        Log::open(temp_dir.path(), LogOptions::default().with_readonly(true)),
        Err(LogError::Locked(_))
    ));

    log.close().unwrap();
    Log::open(temp_dir.path(), LogOptions::default()).unwrap();
}

#[test]
fn test_reopen_after_tail_delete() {
    let temp_dir = TempDir::new().unwrap();
    {
        let log = Log::open(temp_dir.path(), LogOptions::default()).unwrap();
        log.publish(&(0..3).map(value).collect::<Vec<_>>()).unwrap();
        log.delete(&set(&[2])).unwrap();
        assert_eq!(log.stat().unwrap().segments, 2);
    }

    let log = Log::open(temp_dir.path(), LogOptions::default()).unwrap();
    assert_eq!(log.next_offset().unwrap(), 3);
    assert_eq!(consume_all(&log), vec![0, 1]);
    assert_eq!(log.publish(&[value(3)]).unwrap(), 4);
    assert_eq!(log.get(3).unwrap().value, value(3).value);
}

#[test]
fn test_delete_everything_in_segment() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(2)).unwrap();
    publish_one_by_one(&log, 5);
    assert_eq!(log.stat().unwrap().segments, 3);

    let (deleted, _) = log.delete(&set(&[0, 1])).unwrap();
    assert_eq!(deleted, set(&[0, 1]));
    assert_eq!(log.stat().unwrap().segments, 2);
    assert_eq!(consume_all(&log), vec![2, 3, 4]);
    assert!(matches!(log.get(0), Err(LogError::OffsetNotFound(0))));

    let (deleted, freed) = log.delete(&set(&[0])).unwrap();
    assert!(deleted.is_empty());
    assert_eq!(freed, 0);
    assert!(log.delete(&BTreeSet::new()).unwrap().0.is_empty());
}

#[test]
fn test_delete_multi_spans_segments() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(3)).unwrap();
    publish_one_by_one(&log, 9);

    let mut backoffs = 0;
    let (deleted, freed) = delete_multi(&log, &set(&[1, 4, 7, 8]), || {
        backoffs += 1;
        Ok(())
    })
    .unwrap();

    assert_eq!(deleted, set(&[1, 4, 7, 8]));
    assert_eq!(freed, 4 * value_size());
    assert_eq!(backoffs, 2);
    assert_eq!(consume_all(&log), vec![0, 2, 3, 5, 6]);
    assert_eq!(log.next_offset().unwrap(), 9);
    assert_eq!(log.publish(&[value(9)]).unwrap(), 10);
}

#[test]
fn test_delete_multi_backoff_error_stops() {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(2)).unwrap();
    publish_one_by_one(&log, 4);

    let result = delete_multi(&log, &set(&[0, 2]), || Err(LogError::Cancelled));
    assert!(matches!(result, Err(LogError::Cancelled)));
    assert!(matches!(log.get(0), Err(LogError::OffsetNotFound(0))));
    assert_eq!(log.get(2).unwrap().offset, 2);
}

#[test]
fn test_backup_restores_records() {
    let temp_dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), rolling(2)).unwrap();
    publish_one_by_one(&log, 5);

    log.backup(backup_dir.path()).unwrap();
    log.backup(backup_dir.path()).unwrap();

    let restored = Log::open(backup_dir.path(), LogOptions::default().with_readonly(true)).unwrap();
    assert_eq!(consume_all(&restored), (0..5).collect::<Vec<_>>());
    assert_eq!(restored.stat().unwrap(), log.stat().unwrap());
}

#[test]
fn test_auto_sync_and_check_on_open() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default()
        .with_auto_sync(true)
        .with_check_on_open(true)
        .with_key_index(true);
    {
        let log = Log::open(temp_dir.path(), opts.clone()).unwrap();
        log.publish(&[Record::new("k", "v")]).unwrap();
    }

    let log = Log::open(temp_dir.path(), opts).unwrap();
    assert_eq!(log.get_by_key(b"k").unwrap().offset, 0);
}
