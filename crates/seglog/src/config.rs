//! Options controlling how a log directory is opened.

/// Default size (log + index bytes) after which the head segment rolls over (1 MiB).
pub const DEFAULT_ROLLOVER_SIZE: u64 = 1024 * 1024;

/// Index flavor selected from the key/time options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Offset to position only.
    Plain,
    /// Adds a key hash per entry.
    Keyed,
    /// Adds a clamped timestamp per entry.
    Timed,
    /// Adds both key hash and timestamp.
    KeyedTimed,
}

/// Configuration for opening a [`crate::Log`].
///
/// # Examples
/// ```rust,ignore
/// use alopex_seglog::LogOptions;
///
/// let opts = LogOptions::default()
///     .with_create_dirs(true)
///     .with_key_index(true)
///     .with_rollover_size(64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Create the log directory (and parents) if missing.
    pub create_dirs: bool,
    /// Open without a writer; mutating calls fail with `Readonly`.
    pub readonly: bool,
    /// Maintain key hashes in the index for key lookups.
    pub key_index: bool,
    /// Maintain timestamps in the index for time lookups.
    pub time_index: bool,
    /// Sync the head segment to disk after every publish.
    pub auto_sync: bool,
    /// Combined log + index size that triggers rollover of the head segment.
    pub rollover_size: u64,
    /// Verify the head segment index against its log before allowing writes.
    pub check_on_open: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            create_dirs: false,
            readonly: false,
            key_index: false,
            time_index: false,
            auto_sync: false,
            rollover_size: DEFAULT_ROLLOVER_SIZE,
            check_on_open: false,
        }
    }
}

impl LogOptions {
    /// Sets whether missing directories are created.
    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    /// Sets read-only mode.
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Enables or disables the key index.
    pub fn with_key_index(mut self, key_index: bool) -> Self {
        self.key_index = key_index;
        self
    }

    /// Enables or disables the time index.
    pub fn with_time_index(mut self, time_index: bool) -> Self {
        self.time_index = time_index;
        self
    }

    /// Enables or disables sync after every publish.
    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    /// Sets the rollover threshold in bytes.
    pub fn with_rollover_size(mut self, rollover_size: u64) -> Self {
        self.rollover_size = rollover_size;
        self
    }

    /// Enables or disables the head segment check at open.
    pub fn with_check_on_open(mut self, check_on_open: bool) -> Self {
        self.check_on_open = check_on_open;
        self
    }

    /// Returns the index flavor these options select.
    pub fn index_kind(&self) -> IndexKind {
        match (self.key_index, self.time_index) {
            (false, false) => IndexKind::Plain,
            (true, false) => IndexKind::Keyed,
            (false, true) => IndexKind::Timed,
            (true, true) => IndexKind::KeyedTimed,
        }
    }
}
