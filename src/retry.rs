//! Retry policy shared by the REST client and the broker reconnect path.

use std::time::Duration;

use educe::Educe;
use serde::{Deserialize, Serialize};

/// Exponential backoff with optional jitter.
///
/// `max_attempts` counts every try including the first one, so a policy with
/// `max_attempts = 1` never retries.
#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct RetryPolicy {
    #[educe(Default = 4)]
    pub max_attempts: u32,
    #[educe(Default = 200)]
    pub base_delay_ms: u64,
    #[educe(Default = 2.0)]
    pub multiplier: f64,
    #[educe(Default = 10_000)]
    pub max_delay_ms: u64,
    /// Fraction of the computed delay that may be added at random, `0.0..=1.0`.
    #[educe(Default = 0.2)]
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Same delays every attempt, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            base_delay_ms: ms,
            multiplier: 1.0,
            max_delay_ms: ms,
            jitter: 0.0,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    /// Whether another try is allowed after `attempt` tries have been made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Delay to sleep after the given (1-indexed) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let mut delay_ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        if self.jitter > 0.0 && delay_ms > 0.0 {
            let spread = self.jitter.clamp(0.0, 1.0);
            delay_ms += delay_ms * rand::random_range(0.0..=spread);
            delay_ms = delay_ms.min(self.max_delay_ms as f64);
        }
        Duration::from_millis(delay_ms as u64)
    }
}
