//! # rustwal
//!
//! A durable, append-only write-ahead log for a Raft-style replication
//! engine.
//!
//! ## Features
//!
//! - **Segmented storage**: preallocated 64 MiB segments, rotated by an
//!   atomic rename
//! - **Crash safety**: length-prefixed, CRC-chained frames; a torn tail is
//!   truncated back to its last good record on recovery
//! - **Ordered durability**: every append hits stable storage (fsync) before
//!   it is acknowledged
//! - **Single writer**: the live tail is held under an exclusive advisory
//!   lock; read-only openers may run alongside the writer
//! - **Bounded append latency**: the next segment is preallocated by a
//!   background pipeline so a rotation costs one rename
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rustwal::{Entry, Snapshot, Wal};
//!
//! // Create a log and append to it
//! let wal = Wal::create("./wal", &b"node-1"[..])?;
//! wal.save(&[Entry::new(1, 1, &b"put k v"[..])])?;
//! wal.save_snapshot(Snapshot::new(1, 1))?;
//! wal.close()?;
//!
//! // Recover everything past the snapshot
//! let wal = Wal::open("./wal", Snapshot::new(1, 1))?;
//! let (metadata, last_index, entries) = wal.read_all()?;
//! ```

// Public modules
pub mod error;
pub mod options;
pub mod record;

// Internal modules
mod codec;
mod pipeline;
mod util;
mod wal;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{Options, MIN_SEGMENT_SIZE, PRIVATE_FILE_MODE, SEGMENT_SIZE_BYTES};
pub use record::{Entry, EntryType, HardState, Record, RecordType, Snapshot};

// The WAL engine
pub use wal::{verify, Wal};
