//! Seglog - Alopex segmented append-only log
//!
//! This crate provides an embedded, single-process log store: offset-addressed records kept
//! in rotating on-disk segments, with optional key and time indexes and record deletion by
//! segment rewrite.
//!
//! # Components
//!
//! - [`Log`]: opens a directory and routes publish, consume, get and delete across segments
//! - [`BlockingLog`]: adds consumers that wait for new records
//! - [`segment::Segment`]: one `{base}.log` / `{base}.index` file pair and its maintenance
//! - [`index`]: the four index entry flavors and their lookups
//! - [`maintenance`]: stat, check, recover and backup for closed directories
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_seglog::{Log, LogOptions, Record, OFFSET_OLDEST};
//!
//! let opts = LogOptions::default()
//!     .with_create_dirs(true)
//!     .with_key_index(true);
//! let log = Log::open("/var/lib/app/log", opts)?;
//!
//! // Publish assigns offsets and returns the next one
//! let next = log.publish(&[Record::new("user-1", "created"), Record::new("user-1", "renamed")])?;
//!
//! // Read everything from the start
//! let (next, records) = log.consume(OFFSET_OLDEST, 100)?;
//!
//! // Latest value for a key
//! let latest = log.get_by_key(b"user-1")?;
//! ```

#![deny(missing_docs)]

pub mod blocking;
pub mod config;
pub mod error;
pub mod index;
mod lock;
pub mod log;
pub mod maintenance;
pub mod notify;
pub mod reader;
pub mod record;
pub mod segment;
pub mod writer;

pub use blocking::BlockingLog;
pub use config::{IndexKind, LogOptions, DEFAULT_ROLLOVER_SIZE};
pub use error::{LogError, Result};
pub use lock::LOCK_FILE;
pub use log::Log;
pub use maintenance::delete_multi;
pub use notify::{CancelToken, OffsetNotify};
pub use record::{Record, OFFSET_INVALID, OFFSET_NEWEST, OFFSET_OLDEST};
pub use segment::{RecoverReport, Stats};
