//! Retry policy for compare-and-swap backends.

use std::time::Duration;

/// How often and how patiently a backend retries a lost compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single pause.
    pub max_delay: Duration,
    /// Growth factor applied to the pause after every lost attempt.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a policy with `max_attempts` and short default pauses.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
        }
    }

    /// A single attempt, no pauses.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the first pause.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the pause ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Effective attempt budget.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Pause before `attempt` (0-indexed). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Iterates the pauses for every attempt in the budget.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts()).map(move |attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        assert_eq!(RetryConfig::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn pauses_grow_until_capped() {
        let config = RetryConfig::new(6)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_backoff_multiplier(2.0);

        let pauses: Vec<u128> = config.schedule().map(|d| d.as_millis()).collect();
        assert_eq!(pauses, vec![0, 10, 20, 40, 50, 50]);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut config = RetryConfig::no_retry();
        config.max_attempts = 0;
        assert_eq!(config.attempts(), 1);
        assert_eq!(config.schedule().count(), 1);
    }
}
