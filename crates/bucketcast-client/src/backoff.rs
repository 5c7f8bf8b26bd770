use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Exponential reconnect delay with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    jitter_fraction: f64,
}

impl Backoff {
    /// `max_ms` is raised to `initial_ms` if lower; jitter is clamped to `[0, 1]`.
    pub fn new(initial_ms: u64, max_ms: u64, jitter_fraction: f64) -> Self {
        let initial_ms = initial_ms.max(1);
        let jitter_fraction = if jitter_fraction.is_finite() {
            jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            jitter_fraction,
        }
    }

    /// Delay `next_delay_ms` resets to after a successful open.
    pub fn floor_ms(&self) -> u64 {
        self.initial_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Delay following `current_ms` after another failure.
    pub fn advance(&self, current_ms: u64) -> u64 {
        current_ms.saturating_mul(2).min(self.max_ms)
    }

    pub fn clamp(&self, delay_ms: u64) -> u64 {
        delay_ms.min(self.max_ms)
    }

    /// `base_ms` scaled by a random factor in `1 ± jitter_fraction`.
    pub fn jittered<R: Rng + ?Sized>(&self, base_ms: u64, rng: &mut R) -> Duration {
        if self.jitter_fraction == 0.0 || base_ms == 0 {
            return Duration::from_millis(base_ms);
        }
        let factor = 1.0 + rng.random_range(-self.jitter_fraction..=self.jitter_fraction);
        let millis = (base_ms as f64 * factor).round().max(0.0);
        Duration::from_millis(millis as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_INITIAL_BACKOFF_MS,
            DEFAULT_MAX_BACKOFF_MS,
            DEFAULT_JITTER_FRACTION,
        )
    }
}
