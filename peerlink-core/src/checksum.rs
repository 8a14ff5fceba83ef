//! Block checksum: CRC-32 over the plaintext payload.
//!
//! Reflected polynomial 0xEDB88320, register seeded with 0xFFFFFFFF and no final
//! xor (the JAMCRC parameter set). Both peers must agree on this exactly.

use crc::{Crc, CRC_32_JAMCRC};

/// Precomputed 256-entry lookup table. Built once per link, read-only afterwards.
pub struct ChecksumTable {
    crc: Crc<u32>,
}

impl ChecksumTable {
    pub fn new() -> Self {
        Self {
            crc: Crc::<u32>::new(&CRC_32_JAMCRC),
        }
    }

    /// Checksum of `payload`.
    pub fn checksum(&self, payload: &[u8]) -> u32 {
        self.crc.checksum(payload)
    }

    /// Verify payload against the checksum carried in a block header.
    pub fn verify(&self, payload: &[u8], expected: u32) -> bool {
        self.checksum(payload) == expected
    }
}

impl Default for ChecksumTable {
    fn default() -> Self {
        Self::new()
    }
}
