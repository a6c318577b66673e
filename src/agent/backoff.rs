//! Retry pacing for the listen loop.

use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Jitter is bounded at this fraction of the base delay.
pub const JITTER_FRACTION: f64 = 0.1;

/// Exponential backoff: 1 s, 2 s, 4 s, ... capped at [`MAX_DELAY`].
pub fn backoff_delay(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(31);
    let delay = BASE_DELAY.saturating_mul(1u32 << exponent);
    delay.min(MAX_DELAY)
}

/// Add up to 10% random jitter so restarting fleets do not poll in lockstep.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.0..=delay.as_secs_f64() * JITTER_FRACTION);
    delay + Duration::from_secs_f64(jitter)
}
