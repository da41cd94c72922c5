//! CRC32 checksum utilities.

use crc32fast::Hasher;

/// Incremental CRC32 seeded from a prior running value.
///
/// The WAL chains one of these across segments: the encoder for a new segment
/// is seeded with the previous segment's final value, and the decoder reseeds
/// itself from each segment's leading CRC record.
#[derive(Clone)]
pub struct RunningCrc {
    hasher: Hasher,
}

impl RunningCrc {
    /// Start a fresh chain.
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Continue a chain from a prior value.
    pub fn with_initial(crc: u32) -> Self {
        Self {
            hasher: Hasher::new_with_initial(crc),
        }
    }

    /// Fold more payload bytes into the chain.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// The current chain value, without consuming the accumulator.
    pub fn sum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Reseed the chain, discarding accumulated state.
    pub fn reset_to(&mut self, crc: u32) {
        self.hasher = Hasher::new_with_initial(crc);
    }
}

impl Default for RunningCrc {
    fn default() -> Self {
        Self::new()
    }
}
