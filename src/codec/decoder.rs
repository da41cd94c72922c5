//! Read-side streaming decoder.

use std::fs::File;
use std::io::{BufReader, Read};

use crate::record::{self, Record, RecordType};
use crate::util::crc::RunningCrc;
use crate::{Error, Result};

use super::{decode_frame_size, FRAME_HEADER_SIZE, MIN_SECTOR_SIZE};

const READ_BUF_SIZE: usize = 128 * 1024;

struct SegmentReader {
    br: BufReader<File>,
    size: u64,
}

/// Streaming decoder over a run of segments in sequence order.
///
/// Tracks the running CRC of the chain, reseeding it from the CRC record at
/// the head of each segment, and remembers the offset of the last frame that
/// decoded cleanly so a torn tail can be truncated back to it.
pub struct Decoder {
    readers: Vec<SegmentReader>,
    cur: usize,
    crc: RunningCrc,
    last_valid_off: u64,
}

impl Decoder {
    /// Build a decoder over the given segment files, oldest first.
    pub fn new(files: Vec<File>) -> Result<Self> {
        let mut readers = Vec::with_capacity(files.len());
        for file in files {
            let size = file.metadata()?.len();
            readers.push(SegmentReader {
                br: BufReader::with_capacity(READ_BUF_SIZE, file),
                size,
            });
        }
        Ok(Self {
            readers,
            cur: 0,
            crc: RunningCrc::new(),
            last_valid_off: 0,
        })
    }

    /// Decode the next record, or `None` at the clean end of the log.
    ///
    /// `Err(UnexpectedEof)` means a frame ended short of its declared length;
    /// whether that is a repairable torn tail is decided by the caller from
    /// [`Decoder::in_last_segment`].
    pub fn decode(&mut self) -> Result<Option<Record>> {
        loop {
            let reader = match self.readers.get_mut(self.cur) {
                Some(r) => r,
                None => return Ok(None),
            };

            // Read the length word by hand: zero bytes here is a clean
            // segment end, a partial word is a torn write.
            let mut word_buf = [0u8; 8];
            let mut filled = 0;
            while filled < word_buf.len() {
                let n = reader.br.read(&mut word_buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                self.advance_segment();
                continue;
            }
            if filled < word_buf.len() {
                return Err(Error::UnexpectedEof);
            }

            let word = u64::from_le_bytes(word_buf);
            if word == 0 {
                // preallocated space; logical end of this segment
                self.advance_segment();
                continue;
            }

            let (payload_len, pad) = decode_frame_size(word);
            let frame_len = payload_len + pad;
            let remaining = reader
                .size
                .saturating_sub(self.last_valid_off + FRAME_HEADER_SIZE);
            if frame_len > remaining {
                return Err(Error::UnexpectedEof);
            }
            if pad > 7 {
                return Err(Error::SliceOutOfRange);
            }

            let mut frame = vec![0u8; frame_len as usize];
            reader
                .br
                .read_exact(&mut frame)
                .map_err(|_| Error::UnexpectedEof)?;

            let rec: Record = match record::unmarshal(&frame[..payload_len as usize]) {
                Ok(rec) => rec,
                Err(_) => {
                    if self.is_torn_frame(&frame) {
                        return Err(Error::UnexpectedEof);
                    }
                    // the frame is whole on disk but its payload length
                    // bookkeeping does not add up
                    return Err(Error::SliceOutOfRange);
                }
            };

            if rec.record_type() == Some(RecordType::Crc) {
                // Chain handoff: the record publishes the value carried over
                // from the previous segment. A fresh decoder has nothing to
                // compare against yet.
                let running = self.crc.sum();
                if running != 0 {
                    rec.validate_crc(running)?;
                }
                self.crc.reset_to(rec.crc);
            } else {
                self.crc.update(&rec.data);
                if let Err(err) = rec.validate_crc(self.crc.sum()) {
                    if self.is_torn_frame(&frame) {
                        return Err(Error::UnexpectedEof);
                    }
                    return Err(err);
                }
            }

            self.last_valid_off += FRAME_HEADER_SIZE + frame_len;
            return Ok(Some(rec));
        }
    }

    fn advance_segment(&mut self) {
        self.cur += 1;
        // at the end of the final segment, keep the offset: the tail is
        // repositioned to it when the WAL flips to append mode
        if self.cur < self.readers.len() {
            self.last_valid_off = 0;
        }
    }

    /// Whether a frame that failed to decode sits in space a crashed write
    /// never finished: any sector-aligned chunk of it still all zero.
    ///
    /// Only meaningful in the last segment; completed segments were cut at a
    /// record boundary and fsynced.
    fn is_torn_frame(&self, frame: &[u8]) -> bool {
        if self.cur + 1 != self.readers.len() {
            return false;
        }
        let mut file_off = (self.last_valid_off + FRAME_HEADER_SIZE) as usize;
        let mut cur_off = 0;
        while cur_off < frame.len() {
            let chunk_len =
                (MIN_SECTOR_SIZE - file_off % MIN_SECTOR_SIZE).min(frame.len() - cur_off);
            let chunk = &frame[cur_off..cur_off + chunk_len];
            if chunk.iter().all(|&b| b == 0) {
                return true;
            }
            file_off += chunk_len;
            cur_off += chunk_len;
        }
        false
    }

    /// Offset of the byte after the last cleanly decoded frame in the
    /// segment currently being read.
    pub fn last_valid_off(&self) -> u64 {
        self.last_valid_off
    }

    /// The running CRC after the last cleanly decoded record.
    pub fn last_crc(&self) -> u32 {
        self.crc.sum()
    }

    /// Whether the decoder is positioned in the final segment.
    pub fn in_last_segment(&self) -> bool {
        self.cur + 1 >= self.readers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Encoder;
    use super::*;
    use crate::record::{Entry, RecordType};
    use bytes::Bytes;
    use std::io::Write;
    use tempfile::tempdir;

    fn encode_records(path: &std::path::Path, prev_crc: u32, recs: &mut [Record]) -> u32 {
        let file = File::create(path).unwrap();
        let mut enc = Encoder::new(file, prev_crc);
        for rec in recs.iter_mut() {
            enc.encode(rec).unwrap();
        }
        enc.flush().unwrap();
        enc.crc()
    }

    fn entry_record(index: u64) -> Record {
        let data = record::marshal(&Entry::new(1, index, Bytes::new())).unwrap();
        Record::new(RecordType::Entry, data)
    }

    #[test]
    fn test_decode_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        let mut recs = vec![
            Record::new(RecordType::Crc, Bytes::new()),
            entry_record(1),
            entry_record(2),
        ];
        encode_records(&path, 0, &mut recs);

        let mut dec = Decoder::new(vec![File::open(&path).unwrap()]).unwrap();
        for want in &recs {
            let got = dec.decode().unwrap().unwrap();
            assert_eq!(&got, want);
        }
        assert!(dec.decode().unwrap().is_none());
    }

    #[test]
    fn test_decode_stops_at_zero_word() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        let mut recs = vec![entry_record(1)];
        encode_records(&path, 0, &mut recs);
        // preallocated remainder
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0u8; 256]).unwrap();

        let mut dec = Decoder::new(vec![File::open(&path).unwrap()]).unwrap();
        assert!(dec.decode().unwrap().is_some());
        assert!(dec.decode().unwrap().is_none());
    }

    #[test]
    fn test_decode_chains_across_segments() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("seg0");
        let second = dir.path().join("seg1");

        let mut recs0 = vec![
            Record::new(RecordType::Crc, Bytes::new()),
            entry_record(1),
        ];
        let carried = encode_records(&first, 0, &mut recs0);

        let mut seed = Record::new(RecordType::Crc, Bytes::new());
        seed.crc = carried;
        let mut recs1 = vec![seed, entry_record(2)];
        encode_records(&second, carried, &mut recs1);

        let files = vec![File::open(&first).unwrap(), File::open(&second).unwrap()];
        let mut dec = Decoder::new(files).unwrap();
        let mut seen = Vec::new();
        while let Some(rec) = dec.decode().unwrap() {
            seen.push(rec.record_type().unwrap());
        }
        assert_eq!(
            seen,
            vec![
                RecordType::Crc,
                RecordType::Entry,
                RecordType::Crc,
                RecordType::Entry
            ]
        );
    }

    #[test]
    fn test_broken_chain_is_crc_mismatch() {
        let dir = tempdir().unwrap();
        let segs = [
            dir.path().join("seg0"),
            dir.path().join("seg1"),
            dir.path().join("seg2"),
        ];

        let mut recs0 = vec![
            Record::new(RecordType::Crc, Bytes::new()),
            entry_record(1),
        ];
        let carried1 = encode_records(&segs[0], 0, &mut recs0);

        let mut seed1 = Record::new(RecordType::Crc, Bytes::new());
        seed1.crc = carried1;
        let mut recs1 = vec![seed1.clone(), entry_record(2)];
        let carried2 = encode_records(&segs[1], carried1, &mut recs1);

        let mut seed2 = Record::new(RecordType::Crc, Bytes::new());
        seed2.crc = carried2;
        let mut recs2 = vec![seed2, entry_record(3)];
        encode_records(&segs[2], carried2, &mut recs2);

        // rewrite the middle segment without its entry; the value the last
        // segment carries no longer adds up
        let mut gutted = vec![seed1];
        encode_records(&segs[1], carried1, &mut gutted);

        let files: Vec<File> = segs.iter().map(|p| File::open(p).unwrap()).collect();
        let mut dec = Decoder::new(files).unwrap();
        let err = loop {
            match dec.decode() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("chain break not detected"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Error::CrcMismatch));
    }

    #[test]
    fn test_truncated_tail_is_unexpected_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        let mut recs = vec![entry_record(1), entry_record(2)];
        encode_records(&path, 0, &mut recs);
        let len = std::fs::metadata(&path).unwrap().len();

        for cut in [len - 1, len - 7, len - 8, len - 9] {
            let copy = dir.path().join("cut");
            std::fs::copy(&path, &copy).unwrap();
            let f = std::fs::OpenOptions::new().write(true).open(&copy).unwrap();
            f.set_len(cut).unwrap();

            let mut dec = Decoder::new(vec![File::open(&copy).unwrap()]).unwrap();
            let first = dec.decode().unwrap();
            assert!(first.is_some());
            assert!(dec.in_last_segment());
            match dec.decode() {
                Err(Error::UnexpectedEof) => {}
                other => panic!("cut at {}: got {:?}", cut, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_last_valid_off_marks_good_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        let mut recs = vec![entry_record(1)];
        encode_records(&path, 0, &mut recs);
        let one_frame = std::fs::metadata(&path).unwrap().len();

        let mut recs = vec![entry_record(1), entry_record(2)];
        encode_records(&path, 0, &mut recs);
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        f.set_len(len - 3).unwrap();

        let mut dec = Decoder::new(vec![File::open(&path).unwrap()]).unwrap();
        assert!(dec.decode().unwrap().is_some());
        assert!(matches!(dec.decode(), Err(Error::UnexpectedEof)));
        assert_eq!(dec.last_valid_off(), one_frame);
    }
}
