//! Token entropy abstraction.
//!
//! Approval token ids come from a cryptographically strong source in
//! production; tests substitute a deterministic counter.

use parking_lot::Mutex;
use rand::RngCore;

/// Source of token randomness.
pub trait TokenEntropy: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]);
}

/// Operating-system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl TokenEntropy for OsEntropy {
    fn fill(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

/// Deterministic source for tests: stamps a counter into each buffer.
#[derive(Debug, Default)]
pub struct CountingEntropy {
    next: Mutex<u64>,
}

impl TokenEntropy for CountingEntropy {
    fn fill(&self, buf: &mut [u8]) {
        let mut next = self.next.lock();
        *next += 1;
        let stamp = next.to_be_bytes();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = stamp[i % stamp.len()];
        }
    }
}
