//! Configuration options for rustwal.

use std::time::Duration;

/// Preallocated size of each segment file, and the rotation threshold (64 MiB).
pub const SEGMENT_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Smallest accepted segment size; a segment must at least hold its seed
/// records before the rotation threshold can trip.
pub const MIN_SEGMENT_SIZE: u64 = 4 * 1024;

/// Permission bits for WAL files and directories.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Permission bits for the WAL directory.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// An fsync slower than this is logged at warn level.
pub const WARN_SYNC_DURATION: Duration = Duration::from_secs(1);

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size each segment is preallocated to; also the cut threshold.
    ///
    /// The tail may grow past this before a cut if a single batch overshoots.
    pub segment_size: u64,

    /// Skip every fsync. Test-only: breaks the durability guarantees.
    pub unsafe_no_sync: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            segment_size: SEGMENT_SIZE_BYTES,
            unsafe_no_sync: false,
        }
    }
}

impl Options {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the segment size.
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Disable all fsyncs.
    pub fn unsafe_no_sync(mut self, skip: bool) -> Self {
        self.unsafe_no_sync = skip;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(crate::Error::InvalidConfiguration(format!(
                "segment_size must be at least {} bytes",
                MIN_SEGMENT_SIZE
            )));
        }
        Ok(())
    }
}
