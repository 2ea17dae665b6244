//! Backoff schedule for the verification sweep.

use crate::config::SweepConfig;
use std::time::Duration;

/// Exponential backoff with a fixed ceiling.
///
/// The sweep never abandons a pending receipt, so there is no attempt cap;
/// the delay grows per round until it reaches `max_delay` and stays there.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the delay.
    pub max_delay: Duration,

    /// Multiplier applied per round.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SweepConfig::default())
    }
}

impl From<&SweepConfig> for RetryPolicy {
    fn from(config: &SweepConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry round `attempt`, counted from zero.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        // powi saturates to infinity for large exponents, which the ceiling
        // then clamps; the i32 cap only guards the cast.
        let exponent = attempt.min(1024) as i32;
        let delay_ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }
}
