//! Jitter strategies to prevent retry synchronization.
//!
//! - `None`: deterministic delays, the default — the documented backoff sequence is exact.
//! - `Full`: uniform in `[0, delay]`, spreads load when many clients retry together.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected
//! via `apply_with_rng`. Millisecond conversions saturate to `u64::MAX`.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use the exact backoff delay.
    #[default]
    None,
    /// Full jitter: uniform between zero and the backoff delay.
    Full,
}

impl Jitter {
    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
        }
    }
}
