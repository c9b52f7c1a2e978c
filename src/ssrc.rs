use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;

/// Process-wide allocator of unique, non-zero SSRC identifiers.
///
/// Every sender in the process must draw from the same registry so that
/// primary and RTX streams can never collide. The registry is an injected
/// collaborator with its own internal lock.
#[derive(Default)]
pub struct SsrcRegistry {
    in_use: Mutex<HashSet<u32>>,
}

impl SsrcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new unique SSRC. Never returns 0.
    pub fn create_ssrc(&self) -> u32 {
        let mut in_use = crate::lock(&self.in_use);
        let mut rng = rand::rng();
        loop {
            let ssrc: u32 = rng.random();
            if ssrc != 0 && in_use.insert(ssrc) {
                return ssrc;
            }
        }
    }

    /// Marks an externally chosen SSRC as in use. Returns false if it was
    /// already taken.
    pub fn register_ssrc(&self, ssrc: u32) -> bool {
        crate::lock(&self.in_use).insert(ssrc)
    }

    /// Returns an SSRC to the pool.
    pub fn return_ssrc(&self, ssrc: u32) {
        crate::lock(&self.in_use).remove(&ssrc);
    }
}
