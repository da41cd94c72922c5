//! Error types for rustwal.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for WAL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by the WAL.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// No segment satisfies the open anchor, or a sequence gap was found.
    #[error("wal: file not found")]
    FileNotFound,

    /// `create` was called on a non-empty directory.
    #[error("wal: directory already exists and is not empty")]
    Exist,

    /// Another process holds the lock on the file.
    #[error("wal: file already locked")]
    Locked,

    /// CRC validation failed in the interior of the log.
    #[error("wal: crc mismatch")]
    CrcMismatch,

    /// Frame length implausible or entry indexes not contiguous.
    #[error("wal: slice bounds out of range")]
    SliceOutOfRange,

    /// A snapshot record contradicts the open anchor.
    #[error("wal: snapshot mismatch")]
    SnapshotMismatch,

    /// The anchor snapshot never appeared in the replay range.
    #[error("wal: snapshot not found")]
    SnapshotNotFound,

    /// A metadata record disagrees with a previously read one.
    #[error("wal: conflicting metadata found")]
    MetadataConflict,

    /// `read_all` called without a decoder (already drained, or append mode).
    #[error("wal: decoder not found")]
    DecoderNotFound,

    /// An append operation was attempted in read mode.
    #[error("wal: not in append mode")]
    ReadOnly,

    /// A frame ended short of its declared length.
    #[error("wal: unexpected end of file")]
    UnexpectedEof,

    /// A file name does not match the segment name grammar.
    #[error("wal: bad wal name {0:?}")]
    BadWalName(String),

    /// A record payload failed to deserialize despite an intact checksum.
    #[error("wal: undecodable record payload: {0}")]
    BadRecord(String),

    /// Rejected WAL options.
    #[error("wal: invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Passthrough I/O error (`ENOSPC`, `EIO`, ...).
    #[error("wal: I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Check if this error indicates on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CrcMismatch
                | Error::SliceOutOfRange
                | Error::UnexpectedEof
                | Error::BadRecord(_)
        )
    }

    /// The `io::ErrorKind` of a passthrough I/O error, if that is what this is.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io(err) => Some(err.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::CrcMismatch), "wal: crc mismatch");
        assert_eq!(
            format!("{}", Error::BadWalName("foo.wal".into())),
            "wal: bad wal name \"foo.wal\""
        );
    }

    #[test]
    fn test_error_is_corruption() {
        assert!(Error::CrcMismatch.is_corruption());
        assert!(Error::UnexpectedEof.is_corruption());
        assert!(!Error::Locked.is_corruption());
        assert!(!Error::FileNotFound.is_corruption());
    }

    #[test]
    fn test_io_passthrough_keeps_kind() {
        let err = Error::from(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::Other));
        let clone = err.clone();
        assert_eq!(clone.io_kind(), Some(io::ErrorKind::Other));
    }
}
