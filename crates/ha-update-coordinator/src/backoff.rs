//! Retry delay policy for coordinators whose source keeps failing
//!
//! Follows the config entry retry pattern: the delay doubles with every
//! consecutive failure up to a cap, with random jitter so coordinators that
//! failed together do not retry together.
//!
//! ```text
//! failures:  0     1      2      3      4      5 ...
//! delay:     base  2base  4base  8base  16base 16base (± jitter)
//! ```

use std::time::Duration;

use rand::Rng;

/// Default number of doublings before the delay stops growing
pub const DEFAULT_MAX_EXPONENT: u32 = 4;

/// Default jitter fraction (±20%)
pub const DEFAULT_JITTER: f64 = 0.2;

/// Largest jitter fraction that still keeps delays ordered by failure count
const MAX_JITTER: f64 = 0.33;

/// Hard limit on doublings so the multiplier fits in a u32
const EXPONENT_LIMIT: u32 = 31;

/// Exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Failures beyond this count stop doubling the delay
    pub max_exponent: u32,
    /// Absolute ceiling on the delay; never applied below the base interval
    pub max_delay: Option<Duration>,
    /// Random spread applied to backed-off delays, as a fraction (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_exponent: DEFAULT_MAX_EXPONENT,
            max_delay: None,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Policy that always waits the base interval
    pub fn fixed() -> Self {
        Self {
            max_exponent: 0,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_exponent(mut self, max_exponent: u32) -> Self {
        self.max_exponent = max_exponent;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt after `consecutive_failures` failures
    ///
    /// Returns `base_interval` unchanged when nothing has failed. Otherwise
    /// returns `base_interval * 2^min(failures, max_exponent)` with jitter,
    /// clamped to `max_delay` and never below `base_interval`. Draws at most
    /// one number from `rng`, so a seeded rng gives reproducible delays.
    pub fn next_delay<R: Rng>(
        &self,
        consecutive_failures: u32,
        base_interval: Duration,
        rng: &mut R,
    ) -> Duration {
        if consecutive_failures == 0 {
            return base_interval;
        }

        let exponent = consecutive_failures
            .min(self.max_exponent)
            .min(EXPONENT_LIMIT);
        let backoff = base_interval.saturating_mul(1_u32 << exponent);

        let jitter = self.effective_jitter();
        let jittered = if jitter > 0.0 && !backoff.is_zero() {
            let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
            Duration::try_from_secs_f64(backoff.as_secs_f64() * factor).unwrap_or(Duration::MAX)
        } else {
            backoff
        };

        let capped = match self.max_delay {
            Some(max_delay) => jittered.min(max_delay),
            None => jittered,
        };

        capped.max(base_interval)
    }

    /// Jitter clamped to a range where delays stay ordered by failure count
    fn effective_jitter(&self) -> f64 {
        if self.jitter.is_nan() {
            return 0.0;
        }
        self.jitter.clamp(0.0, MAX_JITTER)
    }
}
