//! Frame checksum.
//!
//! `sha256(le64(counter) ‖ compressed ‖ key)` truncated to its first 8 bytes. The
//! counter is never sent; both peers derive it from frame order.

use crate::config::CHECKSUM_LEN;
use sha2::{Digest, Sha256};

/// Compute the 8-byte checksum of one frame.
pub fn compute(counter: u64, compressed: &[u8], key: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(counter.to_le_bytes());
    hasher.update(compressed);
    hasher.update(key);
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Compare two checksums without an early exit.
pub fn verify(expected: &[u8; CHECKSUM_LEN], claimed: &[u8]) -> bool {
    if claimed.len() != CHECKSUM_LEN {
        return false;
    }
    expected
        .iter()
        .zip(claimed)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
