//! The four index entry flavors.
//!
//! | Flavor         | Layout (big-endian)                  | Size |
//! |----------------|--------------------------------------|------|
//! | [`PlainEntry`] | offset, position                     | 16   |
//! | [`KeyEntry`]   | offset, position, key hash           | 24   |
//! | [`TimeEntry`]  | offset, position, time               | 24   |
//! | [`KeyTimeEntry`] | offset, position, time, key hash   | 32   |

use super::IndexEntry;
use crate::record::{be_i64, be_u64};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a hash of a record key. A null key hashes like an empty one.
pub fn key_hash(key: Option<&[u8]>) -> u64 {
    key.unwrap_or(&[]).iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Clamps `time` so that index times never decrease within a segment.
fn clamp_time(time: i64, previous: i64) -> i64 {
    time.max(previous)
}

/// Offset-to-position entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainEntry {
    /// Record offset.
    pub offset: i64,
    /// Record byte position in the log file.
    pub position: i64,
}

impl IndexEntry for PlainEntry {
    const SIZE: usize = 16;
    const KEYED: bool = false;
    const TIMED: bool = false;
    type State = ();

    fn derive(
        offset: i64,
        position: i64,
        _time: i64,
        _key: Option<&[u8]>,
        _state: (),
    ) -> (Self, ()) {
        (Self { offset, position }, ())
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn carried(&self) {}

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.position.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: be_i64(buf, 0),
            position: be_i64(buf, 8),
        }
    }
}

/// Entry carrying the key hash for key lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    /// Record offset.
    pub offset: i64,
    /// Record byte position in the log file.
    pub position: i64,
    /// FNV-1a hash of the record key.
    pub key_hash: u64,
}

impl IndexEntry for KeyEntry {
    const SIZE: usize = 24;
    const KEYED: bool = true;
    const TIMED: bool = false;
    type State = ();

    fn derive(offset: i64, position: i64, _time: i64, key: Option<&[u8]>, _state: ()) -> (Self, ()) {
        (
            Self {
                offset,
                position,
                key_hash: key_hash(key),
            },
            (),
        )
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn key_hash(&self) -> u64 {
        self.key_hash
    }

    fn carried(&self) {}

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.position.to_be_bytes());
        buf[16..24].copy_from_slice(&self.key_hash.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: be_i64(buf, 0),
            position: be_i64(buf, 8),
            key_hash: be_u64(buf, 16),
        }
    }
}

/// Entry carrying a clamped, non-decreasing timestamp for time lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeEntry {
    /// Record offset.
    pub offset: i64,
    /// Record byte position in the log file.
    pub position: i64,
    /// Effective time: the record time, or the previous entry's time if that is larger.
    pub time: i64,
}

impl IndexEntry for TimeEntry {
    const SIZE: usize = 24;
    const KEYED: bool = false;
    const TIMED: bool = true;
    type State = i64;

    fn derive(
        offset: i64,
        position: i64,
        time: i64,
        _key: Option<&[u8]>,
        state: i64,
    ) -> (Self, i64) {
        let time = clamp_time(time, state);
        (
            Self {
                offset,
                position,
                time,
            },
            time,
        )
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn time(&self) -> i64 {
        self.time
    }

    fn carried(&self) -> i64 {
        self.time
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.position.to_be_bytes());
        buf[16..24].copy_from_slice(&self.time.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: be_i64(buf, 0),
            position: be_i64(buf, 8),
            time: be_i64(buf, 16),
        }
    }
}

/// Entry carrying both a clamped timestamp and the key hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTimeEntry {
    /// Record offset.
    pub offset: i64,
    /// Record byte position in the log file.
    pub position: i64,
    /// Effective (clamped) time.
    pub time: i64,
    /// FNV-1a hash of the record key.
    pub key_hash: u64,
}

impl IndexEntry for KeyTimeEntry {
    const SIZE: usize = 32;
    const KEYED: bool = true;
    const TIMED: bool = true;
    type State = i64;

    fn derive(
        offset: i64,
        position: i64,
        time: i64,
        key: Option<&[u8]>,
        state: i64,
    ) -> (Self, i64) {
        let time = clamp_time(time, state);
        (
            Self {
                offset,
                position,
                time,
                key_hash: key_hash(key),
            },
            time,
        )
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn key_hash(&self) -> u64 {
        self.key_hash
    }

    fn time(&self) -> i64 {
        self.time
    }

    fn carried(&self) -> i64 {
        self.time
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.position.to_be_bytes());
        buf[16..24].copy_from_slice(&self.time.to_be_bytes());
        buf[24..32].copy_from_slice(&self.key_hash.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: be_i64(buf, 0),
            position: be_i64(buf, 8),
            time: be_i64(buf, 16),
            key_hash: be_u64(buf, 24),
        }
    }
}
