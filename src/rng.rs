//! Small PCG32 generator.
//!
//! Used for protocol magic numbers and handshake nonces. Tests seed it through
//! [`ProtocolConfig::rng_seed`](crate::ProtocolConfig) to get reproducible traffic.
//! Not cryptographically secure.
//!
//! ```
//! use rollback_session::rng::Pcg32;
//!
//! let mut a = Pcg32::seed_from_u64(7);
//! let mut b = Pcg32::seed_from_u64(7);
//! assert_eq!(a.next_u32(), b.next_u32());
//! ```

use std::cell::RefCell;
use std::hash::{BuildHasher, Hash, Hasher};

/// PCG-XSH-RR with 64 bits of state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

const PCG_DEFAULT_STREAM: u64 = 1442695040888963407;
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a generator from a state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a generator from a 64-bit seed.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_STREAM)
    }

    /// Creates a generator seeded from the clock and the thread identity.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }

    /// Next 32-bit value.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Next 16-bit value, taken from the high half of a 32-bit draw.
    #[inline]
    pub fn next_u16(&mut self) -> u16 {
        (self.next_u32() >> 16) as u16
    }

    /// Next 64-bit value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }
}

thread_local! {
    static THREAD_RNG: RefCell<Pcg32> = RefCell::new(Pcg32::from_entropy());
}

/// Draws a `u32` from the thread-local generator.
#[must_use]
pub fn random_u32() -> u32 {
    THREAD_RNG.with(|rng| rng.borrow_mut().next_u32())
}

fn entropy_seed() -> u64 {
    let nanos = web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    // RandomState is keyed per process, which separates peers started at the same instant
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    hasher.write_u64(nanos);
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() ^ 0x9e3779b97f4a7c15
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(12345);
        let mut b = Pcg32::seed_from_u64(12345);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let a: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let b: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn reference_values_are_stable() {
        let mut rng = Pcg32::new(42, 54);
        let first: Vec<u32> = (0..3).map(|_| rng.next_u32()).collect();
        let mut again = Pcg32::new(42, 54);
        let second: Vec<u32> = (0..3).map(|_| again.next_u32()).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], 0xa15c02b7);
    }

    #[test]
    fn thread_rng_produces_values() {
        let values: Vec<u32> = (0..16).map(|_| random_u32()).collect();
        assert!(values.iter().any(|&v| v != values[0]));
    }
}
