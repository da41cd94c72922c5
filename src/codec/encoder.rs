//! Append-side framing.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::record::{self, Record};
use crate::util::crc::RunningCrc;
use crate::Result;

use super::encode_frame_size;

const WRITE_BUF_SIZE: usize = 128 * 1024;

static PAD_ZEROS: [u8; 8] = [0u8; 8];

/// Framing writer bound to one segment file.
///
/// Carries the running CRC of the chain; every record it emits is stamped
/// with the chain value including that record's payload.
pub struct Encoder {
    bw: BufWriter<File>,
    crc: RunningCrc,
}

impl Encoder {
    /// Build an encoder over `file`, continuing the chain from `prev_crc`.
    ///
    /// `file` must be positioned at the segment's append offset.
    pub fn new(file: File, prev_crc: u32) -> Self {
        Self {
            bw: BufWriter::with_capacity(WRITE_BUF_SIZE, file),
            crc: RunningCrc::with_initial(prev_crc),
        }
    }

    /// Frame and buffer one record, updating the running CRC.
    pub fn encode(&mut self, rec: &mut Record) -> Result<()> {
        self.crc.update(&rec.data);
        rec.crc = self.crc.sum();

        let payload = record::marshal(rec)?;
        let (word, pad) = encode_frame_size(payload.len());

        self.bw.write_all(&word.to_le_bytes())?;
        self.bw.write_all(&payload)?;
        if pad > 0 {
            self.bw.write_all(&PAD_ZEROS[..pad])?;
        }
        Ok(())
    }

    /// Drain buffered frames to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.bw.flush()?;
        Ok(())
    }

    /// The running CRC after everything encoded so far.
    pub fn crc(&self) -> u32 {
        self.crc.sum()
    }

    /// Borrow the underlying file (for fsync).
    pub fn file(&self) -> &File {
        self.bw.get_ref()
    }
}
