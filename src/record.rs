//! Record types carried by the log.
//!
//! A segment is a sequence of framed [`Record`]s. The frame layer (`codec`)
//! treats the record as opaque payload bytes; this module owns the payload
//! codec. Records are tagged with a [`RecordType`] and carry the running CRC
//! of the segment chain at the point they were appended.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Record kinds on disk.
///
/// `Zero` never appears in a valid record; a zero length word marks the
/// preallocated remainder of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordType {
    /// Reserved for preallocated space.
    Zero = 0,
    /// Running-CRC chain record; first record of every segment.
    Crc = 1,
    /// A raft log entry.
    Entry = 2,
    /// Replicated-protocol hard state.
    State = 3,
    /// Opaque WAL metadata; second record of segment 0 only.
    Metadata = 4,
    /// Snapshot pointer into the log.
    Snapshot = 5,
}

impl RecordType {
    /// Create from the on-disk tag value.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Crc),
            2 => Some(RecordType::Entry),
            3 => Some(RecordType::State),
            4 => Some(RecordType::Metadata),
            5 => Some(RecordType::Snapshot),
            _ => None,
        }
    }

    /// Convert to the on-disk tag value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A framed record: type tag, running CRC at append time, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// On-disk tag; see [`RecordType`].
    pub rtype: u32,
    /// Running CRC of the segment chain, including this record's data.
    pub crc: u32,
    /// Kind-specific serialized payload.
    pub data: Bytes,
}

impl Record {
    /// Build a record of the given kind around already-serialized data.
    pub fn new(rtype: RecordType, data: Bytes) -> Self {
        Self {
            rtype: rtype.as_u32(),
            crc: 0,
            data,
        }
    }

    /// The record kind, if the tag is known.
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u32(self.rtype)
    }

    /// Check the embedded CRC against the decoder's running value.
    pub fn validate_crc(&self, running: u32) -> Result<()> {
        if self.crc == running {
            Ok(())
        } else {
            Err(Error::CrcMismatch)
        }
    }
}

/// Type of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntryType {
    /// A normal state-machine command.
    #[default]
    Normal,
    /// A cluster configuration change.
    ConfChange,
}

/// A raft log entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// Entry type.
    pub entry_type: EntryType,
    /// Term the entry was proposed in.
    pub term: u64,
    /// Log index; strictly increasing across the whole WAL.
    pub index: u64,
    /// Opaque command bytes.
    pub data: Bytes,
}

impl Entry {
    /// Build a normal entry.
    pub fn new(term: u64, index: u64, data: impl Into<Bytes>) -> Self {
        Self {
            entry_type: EntryType::Normal,
            term,
            index,
            data: data.into(),
        }
    }
}

/// A snapshot pointer: state at and before `index` is captured elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last log index covered by the snapshot.
    pub index: u64,
    /// Term of the entry at `index`.
    pub term: u64,
}

impl Snapshot {
    /// Build a snapshot pointer.
    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

/// Replicated-protocol hard state. The last STATE record in the replay range
/// is the authoritative one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    /// Current term.
    pub term: u64,
    /// Peer voted for in the current term.
    pub vote: u64,
    /// Highest committed index.
    pub commit: u64,
}

impl HardState {
    /// An all-zero hard state is never persisted.
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

/// Whether an append of `ents_len` entries moving the hard state from `prev`
/// to `st` must reach stable storage before being acknowledged.
pub fn must_sync(st: &HardState, prev: &HardState, ents_len: usize) -> bool {
    ents_len != 0 || st.vote != prev.vote || st.term != prev.term
}

/// Serialize a payload with the record codec.
pub fn marshal<T: Serialize>(value: &T) -> Result<Bytes> {
    let buf = bincode::serialize(value).map_err(|e| Error::BadRecord(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Deserialize a payload with the record codec.
pub fn unmarshal<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| Error::BadRecord(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_roundtrip() {
        for rt in [
            RecordType::Zero,
            RecordType::Crc,
            RecordType::Entry,
            RecordType::State,
            RecordType::Metadata,
            RecordType::Snapshot,
        ] {
            assert_eq!(RecordType::from_u32(rt.as_u32()), Some(rt));
        }
        assert_eq!(RecordType::from_u32(6), None);
        assert_eq!(RecordType::from_u32(u32::MAX), None);
    }

    #[test]
    fn test_record_payload_roundtrip() {
        let entry = Entry::new(3, 17, &b"hello"[..]);
        let data = marshal(&entry).unwrap();
        let rec = Record::new(RecordType::Entry, data);
        let back: Entry = unmarshal(&rec.data).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_validate_crc() {
        let mut rec = Record::new(RecordType::Entry, Bytes::new());
        rec.crc = 42;
        assert!(rec.validate_crc(42).is_ok());
        assert!(matches!(rec.validate_crc(43), Err(Error::CrcMismatch)));
    }

    #[test]
    fn test_hard_state_empty() {
        assert!(HardState::default().is_empty());
        let st = HardState {
            term: 1,
            vote: 0,
            commit: 0,
        };
        assert!(!st.is_empty());
    }

    #[test]
    fn test_must_sync() {
        let prev = HardState::default();
        let same = HardState::default();
        assert!(!must_sync(&same, &prev, 0));
        assert!(must_sync(&same, &prev, 1));
        let voted = HardState {
            term: 1,
            vote: 2,
            commit: 0,
        };
        assert!(must_sync(&voted, &prev, 0));
        // commit-only movement does not force a sync
        let committed = HardState {
            term: 0,
            vote: 0,
            commit: 5,
        };
        assert!(!must_sync(&committed, &prev, 0));
    }

    #[test]
    fn test_unmarshal_garbage() {
        let err = unmarshal::<Snapshot>(&[0xff]).unwrap_err();
        assert!(matches!(err, Error::BadRecord(_)));
    }
}
