//! Checksum: POSIX `cksum` CRC-32 over file contents, computed in fixed windows.
//!
//! Detects transmission errors only. It is not a MAC and offers no protection
//! against deliberate tampering.

use crc::{Crc, Digest, CRC_32_CKSUM};

static CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

/// Window used when hashing large buffers.
pub const CHECKSUM_WINDOW: usize = 64 * 1024;

/// Incremental checksum. Feed data with `update`, then `finalize`.
pub struct Checksum {
    digest: Digest<'static, u32>,
    length: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self {
            digest: CKSUM.digest(),
            length: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        self.length += bytes.len() as u64;
    }

    /// Appends the length octets (least significant first) and complements, as `cksum` does.
    pub fn finalize(mut self) -> u32 {
        let mut n = self.length;
        while n > 0 {
            self.digest.update(&[(n & 0xff) as u8]);
            n >>= 8;
        }
        self.digest.finalize()
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a whole buffer.
pub fn compute(buf: &[u8]) -> u32 {
    let mut sum = Checksum::new();
    for window in buf.chunks(CHECKSUM_WINDOW) {
        sum.update(window);
    }
    sum.finalize()
}

/// Verify a buffer against an expected checksum.
pub fn verify(buf: &[u8], expected: u32) -> bool {
    compute(buf) == expected
}
