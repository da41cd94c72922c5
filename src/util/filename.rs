//! Segment file naming conventions.
//!
//! Segments are named `<seq:016x>-<first-index:016x>.wal`; the zero-padded
//! hex fields make lexicographic name order equal sequence order.

use std::path::Path;

use crate::util::fileutil;
use crate::{Error, Result};

/// Build a segment file name from its sequence and first entry index.
pub fn wal_name(seq: u64, index: u64) -> String {
    format!("{:016x}-{:016x}.wal", seq, index)
}

/// Parse a segment file name into `(seq, first_index)`.
///
/// Rejects anything that does not match `^[0-9a-f]{16}-[0-9a-f]{16}\.wal$`.
pub fn parse_wal_name(name: &str) -> Result<(u64, u64)> {
    let bad = || Error::BadWalName(name.to_string());

    let stem = name.strip_suffix(".wal").ok_or_else(bad)?;
    if stem.len() != 33 || stem.as_bytes()[16] != b'-' {
        return Err(bad());
    }
    let (seq_str, index_str) = (&stem[..16], &stem[17..]);
    if !is_lower_hex(seq_str) || !is_lower_hex(index_str) {
        return Err(bad());
    }

    let seq = u64::from_str_radix(seq_str, 16).map_err(|_| bad())?;
    let index = u64::from_str_radix(index_str, 16).map_err(|_| bad())?;
    Ok((seq, index))
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// List the segment file names in `dir`, sorted by name (= sequence order).
///
/// Non-segment names are skipped. Returns `FileNotFound` if no segment exists.
pub fn wal_names(dir: &Path) -> Result<Vec<String>> {
    let names = fileutil::read_dir(dir)?;
    let walnames: Vec<String> = names
        .into_iter()
        .filter(|name| parse_wal_name(name).is_ok())
        .collect();
    if walnames.is_empty() {
        return Err(Error::FileNotFound);
    }
    Ok(walnames)
}

/// Find the last name whose first index is at or below `index`.
///
/// `names` must be sorted. Returns `None` when every segment starts past
/// `index`.
pub fn search_index(names: &[String], index: u64) -> Result<Option<usize>> {
    for (i, name) in names.iter().enumerate().rev() {
        let (_, cur_index) = parse_wal_name(name)?;
        if index >= cur_index {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Check that segment sequence numbers increase by exactly one.
///
/// A gap means a segment was lost; the range cannot be replayed.
pub fn is_valid_seq(names: &[String]) -> Result<bool> {
    let mut last_seq = None;
    for name in names {
        let (cur_seq, _) = parse_wal_name(name)?;
        if let Some(last) = last_seq {
            if cur_seq != last + 1 {
                return Ok(false);
            }
        }
        last_seq = Some(cur_seq);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_name_format() {
        assert_eq!(
            wal_name(0, 0),
            "0000000000000000-0000000000000000.wal"
        );
        assert_eq!(
            wal_name(5, 0x10),
            "0000000000000005-0000000000000010.wal"
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        for (seq, index) in [(0, 0), (1, 1), (0xabcd, 0x1234_5678), (u64::MAX, u64::MAX)] {
            assert_eq!(parse_wal_name(&wal_name(seq, index)).unwrap(), (seq, index));
        }
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for name in [
            "",
            "0.wal",
            "0000000000000000.wal",
            "0000000000000000-0000000000000000",
            "0000000000000000-0000000000000000.snap",
            "0000000000000000_0000000000000000.wal",
            "000000000000000G-0000000000000000.wal",
            "0000000000000000-0000000000000000.wal.tmp",
            "00000000000000000-000000000000000.wal",
            "0000000000000000-00000000000000AB.wal", // uppercase hex
        ] {
            assert!(
                matches!(parse_wal_name(name), Err(Error::BadWalName(_))),
                "accepted {:?}",
                name
            );
        }
    }

    #[test]
    fn test_search_index() {
        let names: Vec<String> = [(0u64, 0u64), (1, 10), (2, 20)]
            .iter()
            .map(|&(s, i)| wal_name(s, i))
            .collect();

        assert_eq!(search_index(&names, 0).unwrap(), Some(0));
        assert_eq!(search_index(&names, 5).unwrap(), Some(0));
        assert_eq!(search_index(&names, 10).unwrap(), Some(1));
        assert_eq!(search_index(&names, 19).unwrap(), Some(1));
        assert_eq!(search_index(&names, 20).unwrap(), Some(2));
        assert_eq!(search_index(&names, u64::MAX).unwrap(), Some(2));
    }

    #[test]
    fn test_search_index_below_all() {
        let names = vec![wal_name(2, 10)];
        assert_eq!(search_index(&names, 5).unwrap(), None);
    }

    #[test]
    fn test_search_index_monotonic() {
        let names: Vec<String> = [(0u64, 0u64), (1, 3), (2, 3), (3, 9)]
            .iter()
            .map(|&(s, i)| wal_name(s, i))
            .collect();
        let mut last = None;
        for i in 0..12 {
            let got = search_index(&names, i).unwrap();
            assert!(got >= last, "search_index not monotonic at {}", i);
            last = got;
        }
    }

    #[test]
    fn test_is_valid_seq() {
        let contiguous: Vec<String> = (3u64..7).map(|s| wal_name(s, s)).collect();
        assert!(is_valid_seq(&contiguous).unwrap());

        let gap: Vec<String> = [3u64, 4, 6].iter().map(|&s| wal_name(s, s)).collect();
        assert!(!is_valid_seq(&gap).unwrap());

        assert!(is_valid_seq(&[]).unwrap());
        assert!(is_valid_seq(&[wal_name(9, 1)]).unwrap());
    }
}
