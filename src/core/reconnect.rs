use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::types::ReconnectStrategy;

/// Bounded exponential backoff with multiplicative jitter.
///
/// Used by the session for reconnect delays and by the dispatcher for 5xx retries.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            2.0
        };
        Self {
            base,
            max: max.max(base),
            factor,
            jitter: 0.0,
            current: base,
        }
    }

    /// Fraction of each delay that may be randomly shaved off, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Un-jittered delay the next call to `next_delay` is based on.
    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0).with_jitter(0.5)
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = (self.current.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
        self.current = Duration::from_secs_f64(next);
        jitter_delay(delay, self.jitter)
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Scale `base` by a random factor in `(1 - fraction)..=1`.
pub fn jitter_delay(base: Duration, fraction: f64) -> Duration {
    if base.is_zero() || fraction <= 0.0 {
        return base;
    }

    let floor = (1.0 - fraction.min(1.0)).max(0.0);
    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range(floor..=1.0);
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}
