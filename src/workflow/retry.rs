//! When to retry a failed workflow step

use crate::config::StepConfig;
use std::time::Duration;

/// Exponential backoff between attempts of a failing step
///
/// Delays double from `initial_delay` up to `max_delay`. With `jitter` on,
/// each delay is stretched by a random 0-25%.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for a workflow step
    pub fn for_step(step: &StepConfig) -> Self {
        Self {
            max_retries: step.retries,
            initial_delay: Duration::from_millis(step.retry_delay_ms),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        let delay = Duration::from_secs_f64(secs);

        if self.jitter {
            delay.mul_f64(1.0 + rand::random::<f64>() * 0.25)
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_without_jitter() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        // Capped
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_for_step() {
        let step = StepConfig {
            retries: 2,
            retry_delay_ms: 250,
            ..Default::default()
        };
        let policy = RetryPolicy::for_step(&step);
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
    }
}
