//! Magic-number generation for loopback detection.
//!
//! One generator exists per process and is shared by every session, so a
//! host running several links never hands two of them the same stream. The
//! state is perturbed with the clock on every inbound packet, which keeps
//! the sequence from being predictable from a single observed value.

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::time::Instant;

pub struct Magic {
    rng: SmallRng,
}

impl Magic {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// A fresh 32-bit magic number. Never fails.
    pub fn magic(&mut self) -> u32 {
        self.rng.next_u32()
    }

    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf)
    }

    /// Fold the clock into the generator state. Called for every inbound
    /// packet, so the stream depends on traffic timing.
    pub fn randomize(&mut self, now: Instant) {
        let mixed = self.rng.next_u64() ^ now.as_millis().wrapping_mul(0x9e37_79b9_7f4a_7c15);
        self.rng = SmallRng::seed_from_u64(mixed);
    }
}

/// Process-wide state handed into every session call: today only the
/// magic-number generator. Construct one at startup and keep it for the
/// lifetime of the event loop.
pub struct ProcessContext {
    pub magic: Magic,
}

impl ProcessContext {
    pub fn new(seed: u64) -> Self {
        Self {
            magic: Magic::new(seed),
        }
    }
}
