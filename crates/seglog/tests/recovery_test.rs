//! Recovery and maintenance tests on closed log directories.

use alopex_seglog::maintenance;
use alopex_seglog::segment::Segment;
use alopex_seglog::{Log, LogOptions, Record, RecoverReport};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

fn value(i: usize) -> Record {
    Record::from_value(format!("payload-{i:03}"))
}

fn write_log(dir: &Path, opts: LogOptions, count: usize) {
    let log = Log::open(dir, opts).unwrap();
    for i in 0..count {
        log.publish(&[value(i)]).unwrap();
    }
    log.close().unwrap();
}

fn head_segment(dir: &Path) -> Segment {
    Segment::list(dir).unwrap().pop().unwrap()
}

fn flip_byte(path: &Path, from_end: u64) {
    let bytes = fs::read(path).unwrap();
    let at = bytes.len() as u64 - from_end;
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(at)).unwrap();
    file.write_all(&[bytes[at as usize] ^ 0xff]).unwrap();
}

#[test]
fn test_recover_truncated_tail() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_key_index(true);
    write_log(temp_dir.path(), opts.clone(), 4);

    let head = head_segment(temp_dir.path());
    let log_len = fs::metadata(head.log_path()).unwrap().len();
    let file = OpenOptions::new().write(true).open(head.log_path()).unwrap();
    file.set_len(log_len - 3).unwrap();
    drop(file);

    let err = maintenance::check(temp_dir.path(), &opts).unwrap_err();
    assert!(err.is_corrupted());

    let report = maintenance::recover(temp_dir.path(), &opts).unwrap();
    assert_eq!(report.truncated_bytes, value(3).size() - 3);
    assert!(report.index_removed);
    maintenance::check(temp_dir.path(), &opts).unwrap();

    assert_eq!(
        maintenance::recover(temp_dir.path(), &opts).unwrap(),
        RecoverReport::default()
    );

    let log = Log::open(temp_dir.path(), opts).unwrap();
    assert_eq!(log.next_offset().unwrap(), 3);
    assert_eq!(log.get(2).unwrap().value, value(2).value);
    assert_eq!(log.publish(&[value(3)]).unwrap(), 4);
}

#[test]
fn test_recover_checksum_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default();
    write_log(temp_dir.path(), opts.clone(), 3);

    let head = head_segment(temp_dir.path());
    flip_byte(head.log_path(), 1);

    let report = maintenance::recover(temp_dir.path(), &opts).unwrap();
    assert_eq!(report.truncated_bytes, value(2).size());
    assert!(report.index_removed);

    let log = Log::open(temp_dir.path(), opts).unwrap();
    let (next, records) = log.consume(0, 10).unwrap();
    assert_eq!(next, 2);
    assert_eq!(records.len(), 2);
}

#[test]
fn test_check_on_open_rejects_drifted_index() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_check_on_open(true);
    write_log(temp_dir.path(), opts.clone(), 2);

    let head = head_segment(temp_dir.path());
    flip_byte(head.index_path(), 1);

    let err = Log::open(temp_dir.path(), opts.clone()).unwrap_err();
    assert!(err.is_corrupted());

    let report = maintenance::recover(temp_dir.path(), &opts).unwrap();
    assert_eq!(report.truncated_bytes, 0);
    assert!(report.index_removed);

    let log = Log::open(temp_dir.path(), opts).unwrap();
    assert_eq!(log.next_offset().unwrap(), 2);
    assert_eq!(log.get(1).unwrap().value, value(1).value);
}

#[test]
fn test_check_covers_head_only() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_rollover_size(1);
    write_log(temp_dir.path(), opts.clone(), 3);

    let segments = Segment::list(temp_dir.path()).unwrap();
    flip_byte(segments[0].index_path(), 1);
    maintenance::check(temp_dir.path(), &opts).unwrap();
    assert!(maintenance::recover(temp_dir.path(), &opts).unwrap().index_removed);

    flip_byte(head_segment(temp_dir.path()).index_path(), 1);
    assert!(maintenance::check(temp_dir.path(), &opts).unwrap_err().is_corrupted());
}

#[test]
fn test_missing_index_rebuilt_on_open() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_time_index(true);
    write_log(temp_dir.path(), opts.clone(), 3);

    let head = head_segment(temp_dir.path());
    fs::remove_file(head.index_path()).unwrap();
    maintenance::check(temp_dir.path(), &opts).unwrap();

    let log = Log::open(temp_dir.path(), opts).unwrap();
    assert_eq!(log.next_offset().unwrap(), 3);
    assert!(head.index_path().exists());
    assert_eq!(log.offset_by_time(0).unwrap().0, 0);
}

#[test]
fn test_maintenance_stat_and_backup() {
    let temp_dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let opts = LogOptions::default().with_rollover_size(1);
    write_log(temp_dir.path(), opts.clone(), 3);

    let stats = maintenance::stat(temp_dir.path(), &opts).unwrap();
    assert_eq!(stats.segments, 3);
    assert_eq!(stats.messages, 3);

    maintenance::backup(temp_dir.path(), backup_dir.path()).unwrap();
    assert_eq!(maintenance::stat(backup_dir.path(), &opts).unwrap(), stats);
}

#[cfg(unix)]
#[test]
fn test_maintenance_respects_lock() {
    let temp_dir = TempDir::new().unwrap();
    let opts = LogOptions::default();
    let _log = Log::open(temp_dir.path(), opts.clone()).unwrap();

    assert!(maintenance::recover(temp_dir.path(), &opts).is_err());
    assert!(maintenance::stat(temp_dir.path(), &opts).is_err());
}
