//! Record codec for segment log files.
//!
//! Each record is stored as a fixed 28-byte header followed by the key and value bytes:
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬───────────┬──────────┬─────┬───────┐
//! │ offset   │ time µs  │ key len │ value len │ crc32c   │ key │ value │
//! │ i64 BE   │ i64 BE   │ u32 BE  │ u32 BE    │ u32 BE   │     │       │
//! └──────────┴──────────┴─────────┴───────────┴──────────┴─────┴───────┘
//! ```
//!
//! The checksum covers only `key | value`. A length of `0xFFFF_FFFF` marks a null key or value.

use crate::error::{LogError, Result};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved offset addressing the tail of the log (the next offset to be written).
pub const OFFSET_NEWEST: i64 = -1;

/// Reserved offset addressing the first record in the log.
pub const OFFSET_OLDEST: i64 = -2;

/// Offset returned alongside errors when no meaningful offset exists.
pub const OFFSET_INVALID: i64 = -3;

/// Record header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Length marker for a null key or value.
const NULL_LEN: u32 = u32::MAX;

/// Longest key or value a record can carry.
pub const MAX_PART_LEN: usize = NULL_LEN as usize - 1;

/// One logical message in the log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    /// Position in the log, assigned on publish.
    pub offset: i64,
    /// Microseconds since the Unix epoch; zero at publish means "now".
    pub time: i64,
    /// Optional key, used by the key index.
    pub key: Option<Vec<u8>>,
    /// Optional value; `None` is conventionally a tombstone.
    pub value: Option<Vec<u8>>,
}

impl Record {
    /// Creates a record with both key and value set.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Creates a record without a key.
    pub fn from_value(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Creates a tombstone (null value) for `key`.
    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Sets an explicit timestamp in microseconds.
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    /// Returns the encoded size of this record in bytes.
    pub fn size(&self) -> u64 {
        (HEADER_SIZE + part_len_of(self.key.as_deref()) + part_len_of(self.value.as_deref()))
            as u64
    }

    /// Fails with `RecordTooLarge` if the key or value cannot be encoded.
    pub fn validate(&self) -> Result<()> {
        check_part_len("key", part_len_of(self.key.as_deref()))?;
        check_part_len("value", part_len_of(self.value.as_deref()))
    }

    /// Encodes the record into a new buffer.
    ///
    /// The key and value must fit [`MAX_PART_LEN`]; see [`Record::validate`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        encode_into(
            &mut buf,
            self.offset,
            self.time,
            self.key.as_deref(),
            self.value.as_deref(),
        );
        buf
    }

    /// Decodes one record from the start of `bytes`, returning it with its encoded length.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        match decode_at(bytes, 0)? {
            Some((record, next)) => Ok((record, next as usize)),
            None => Err(LogError::Corrupted("empty record buffer".to_string())),
        }
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Computes the record checksum over `key | value`.
pub fn checksum(key: Option<&[u8]>, value: Option<&[u8]>) -> u32 {
    let crc = crc32c::crc32c(key.unwrap_or(&[]));
    crc32c::crc32c_append(crc, value.unwrap_or(&[]))
}

fn part_len_of(part: Option<&[u8]>) -> usize {
    part.map_or(0, <[u8]>::len)
}

fn check_part_len(part: &'static str, len: usize) -> Result<()> {
    if len > MAX_PART_LEN {
        return Err(LogError::RecordTooLarge { part, len });
    }
    Ok(())
}

fn len_field(part: Option<&[u8]>) -> u32 {
    part.map_or(NULL_LEN, |bytes| bytes.len() as u32)
}

fn part_len(len: u32) -> usize {
    if len == NULL_LEN {
        0
    } else {
        len as usize
    }
}

pub(crate) fn be_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_be_bytes(bytes)
}

pub(crate) fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

fn encode_into(
    buf: &mut Vec<u8>,
    offset: i64,
    time: i64,
    key: Option<&[u8]>,
    value: Option<&[u8]>,
) {
    debug_assert!(part_len_of(key) < NULL_LEN as usize);
    debug_assert!(part_len_of(value) < NULL_LEN as usize);

    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(&time.to_be_bytes());
    buf.extend_from_slice(&len_field(key).to_be_bytes());
    buf.extend_from_slice(&len_field(value).to_be_bytes());
    buf.extend_from_slice(&checksum(key, value).to_be_bytes());
    buf.extend_from_slice(key.unwrap_or(&[]));
    buf.extend_from_slice(value.unwrap_or(&[]));
}

/// Parsed fixed-size record header.
struct Header {
    offset: i64,
    time: i64,
    key_len: u32,
    value_len: u32,
    crc: u32,
}

impl Header {
    fn parse(buf: &[u8]) -> Self {
        Self {
            offset: be_i64(buf, 0),
            time: be_i64(buf, 8),
            key_len: be_u32(buf, 16),
            value_len: be_u32(buf, 20),
            crc: be_u32(buf, 24),
        }
    }

    fn payload_len(&self) -> usize {
        part_len(self.key_len) + part_len(self.value_len)
    }

    fn into_record(self, payload: &[u8], position: i64) -> Result<Record> {
        let key_len = part_len(self.key_len);
        let key = (self.key_len != NULL_LEN).then(|| payload[..key_len].to_vec());
        let value = (self.value_len != NULL_LEN).then(|| payload[key_len..].to_vec());

        let actual = checksum(key.as_deref(), value.as_deref());
        if actual != self.crc {
            return Err(LogError::ChecksumMismatch {
                position,
                expected: self.crc,
                actual,
            });
        }

        Ok(Record {
            offset: self.offset,
            time: self.time,
            key,
            value,
        })
    }
}

/// Decodes the record starting at `position` within `data`.
///
/// Returns `Ok(None)` when `position` is at or past the end of the data.
pub(crate) fn decode_at(data: &[u8], position: i64) -> Result<Option<(Record, i64)>> {
    let start = position as usize;
    if position < 0 || start >= data.len() {
        return Ok(None);
    }

    let remaining = &data[start..];
    if remaining.len() < HEADER_SIZE {
        return Err(LogError::Corrupted(format!(
            "short record header at position {position}"
        )));
    }
    let header = Header::parse(&remaining[..HEADER_SIZE]);
    let payload_len = header.payload_len();
    if remaining.len() - HEADER_SIZE < payload_len {
        return Err(LogError::Corrupted(format!(
            "short record payload at position {position}"
        )));
    }

    let payload = &remaining[HEADER_SIZE..HEADER_SIZE + payload_len];
    let record = header.into_record(payload, position)?;
    Ok(Some((record, position + (HEADER_SIZE + payload_len) as i64)))
}

fn read_exact_at(file: &File, buf: &mut [u8], position: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, position)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], position + read as u64)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            read += n;
        }
        Ok(())
    }
}

/// Reads the record at `position` with positioned reads on `file`.
///
/// Returns `Ok(None)` when `position` is at or past the current end of file.
pub(crate) fn read_at(file: &File, position: i64) -> Result<Option<(Record, i64)>> {
    let len = file.metadata()?.len();
    if position < 0 || position as u64 >= len {
        return Ok(None);
    }

    let start = position as u64;
    if len - start < HEADER_SIZE as u64 {
        return Err(LogError::Corrupted(format!(
            "short record header at position {position}"
        )));
    }
    let mut header_buf = [0u8; HEADER_SIZE];
    read_exact_at(file, &mut header_buf, start)?;
    let header = Header::parse(&header_buf);

    let payload_len = header.payload_len();
    if len - start - (HEADER_SIZE as u64) < payload_len as u64 {
        return Err(LogError::Corrupted(format!(
            "short record payload at position {position}"
        )));
    }
    let mut payload = vec![0u8; payload_len];
    read_exact_at(file, &mut payload, start + HEADER_SIZE as u64)?;

    let record = header.into_record(&payload, position)?;
    Ok(Some((record, position + (HEADER_SIZE + payload_len) as i64)))
}

/// Reads until `buf` is full or EOF, returning the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Sequential reader over a record stream, used to replay log files.
pub(crate) struct RecordScanner<R> {
    reader: R,
    position: i64,
    len: u64,
}

impl RecordScanner<BufReader<File>> {
    /// Opens a scanner at the start of the log file at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::new(BufReader::new(file), len))
    }
}

impl<R: Read> RecordScanner<R> {
    /// Creates a scanner over `reader`, which holds `len` bytes of records.
    pub(crate) fn new(reader: R, len: u64) -> Self {
        Self {
            reader,
            position: 0,
            len,
        }
    }

    /// Byte position of the next record.
    pub(crate) fn position(&self) -> i64 {
        self.position
    }

    /// Reads the next record and the position it started at.
    ///
    /// Clean EOF yields `Ok(None)`; a partial header or payload yields `Corrupted`.
    pub(crate) fn next_record(&mut self) -> Result<Option<(i64, Record)>> {
        let mut header_buf = [0u8; HEADER_SIZE];
        let n = read_full(&mut self.reader, &mut header_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_SIZE {
            return Err(LogError::Corrupted(format!(
                "short record header at position {}",
                self.position
            )));
        }

        let header = Header::parse(&header_buf);
        let payload_len = header.payload_len();
        let available = self
            .len
            .saturating_sub(self.position as u64 + HEADER_SIZE as u64);
        if (payload_len as u64) > available {
            return Err(LogError::Corrupted(format!(
                "short record payload at position {}",
                self.position
            )));
        }
        let mut payload = vec![0u8; payload_len];
        if read_full(&mut self.reader, &mut payload)? < payload.len() {
            return Err(LogError::Corrupted(format!(
                "short record payload at position {}",
                self.position
            )));
        }

        let position = self.position;
        let record = header.into_record(&payload, position)?;
        self.position += (HEADER_SIZE + payload.len()) as i64;
        Ok(Some((position, record)))
    }
}

/// Append-only writer for a segment log file.
pub(crate) struct RecordWriter {
    file: BufWriter<File>,
    position: i64,
    scratch: Vec<u8>,
}

impl RecordWriter {
    /// Opens `path` for appending, creating it if missing.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let position = file.metadata()?.len() as i64;
        Ok(Self {
            file: BufWriter::new(file),
            position,
            scratch: Vec::new(),
        })
    }

    /// Appends a record, returning the position it was written at.
    pub(crate) fn write(&mut self, record: &Record) -> Result<i64> {
        self.write_parts(
            record.offset,
            record.time,
            record.key.as_deref(),
            record.value.as_deref(),
        )
    }

    /// Appends a record with an explicit offset and time.
    pub(crate) fn write_parts(
        &mut self,
        offset: i64,
        time: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<i64> {
        check_part_len("key", part_len_of(key))?;
        check_part_len("value", part_len_of(value))?;
        self.scratch.clear();
        encode_into(&mut self.scratch, offset, time, key, value);
        self.file.write_all(&self.scratch)?;

        let position = self.position;
        self.position += self.scratch.len() as i64;
        Ok(position)
    }

    /// Current size of the file in bytes, including buffered data.
    pub(crate) fn size(&self) -> u64 {
        self.position as u64
    }

    /// Flushes buffered data to the OS.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the file.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Drops buffered bytes without writing them and resets the position to `size`.
    ///
    /// The caller truncates the file itself; appends continue at its end.
    pub(crate) fn discard(&mut self, size: u64) -> Result<()> {
        let file = self.file.get_ref().try_clone()?;
        let (_, _unwritten) = std::mem::replace(&mut self.file, BufWriter::new(file)).into_parts();
        self.position = size as i64;
        Ok(())
    }
}

/// Memory-mapped, read-only view of a sealed log file.
pub(crate) struct MappedLog {
    map: Option<Mmap>,
}

impl MappedLog {
    /// Maps the log file at `path`. Empty files are represented without a mapping.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self { map: None });
        }
        // SAFETY: sealed log files are never modified in place; rewrites produce new files
        // and replace them by rename, so the mapped bytes stay valid for the map's lifetime.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map: Some(map) })
    }

    /// Reads the record at `position`.
    pub(crate) fn read(&self, position: i64) -> Result<Option<(Record, i64)>> {
        decode_at(self.map.as_deref().unwrap_or(&[]), position)
    }
}
