//! Backoff policy shared by command retries and reconnection.
//!
//! A [`BackoffPolicy`] is plain configuration. Calling
//! [`BackoffPolicy::backoff`] yields a stateful [`Backoff`] whose delays
//! never decrease until it is [`reset`](Backoff::reset), even with jitter
//! enabled.
//!
//! ```
//! use std::time::Duration;
//! use railhub_core::BackoffPolicy;
//!
//! let policy = BackoffPolicy::default()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_millis(400))
//!     .jitter(0.0);
//! let mut backoff = policy.backoff();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(400));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(400));
//! ```

use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt (1.0 = constant).
    pub multiplier: f64,
    /// Fraction of each delay that may be shaved off at random (0.0..=1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::for_reconnect()
    }
}

impl BackoffPolicy {
    /// Reconnection to a hub that dropped off: 1s doubling up to 30s.
    pub fn for_reconnect() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }

    /// Delays between attempts of a single command: 500ms doubling up to 2s.
    pub fn for_commands() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Fixed delay without growth or jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(Error::invalid_config("initial_delay must be greater than zero"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config(
                "max_delay must be at least initial_delay",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::invalid_config("multiplier must be finite and >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::invalid_config("jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Un-jittered delay for the given zero-based attempt.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // also guards against inf from large exponents
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Start a fresh delay sequence.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            last: Duration::ZERO,
        }
    }
}

/// A running delay sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.base_delay(self.attempt);
        let jittered = if self.policy.jitter > 0.0 {
            let shave = rand::rng().random::<f64>() * self.policy.jitter;
            base.mul_f64(1.0 - shave)
        } else {
            base
        };
        let delay = jittered.max(self.last).min(self.policy.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Return to the initial delay, after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = BackoffPolicy::for_reconnect();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(4), Duration::from_secs(16));
        assert_eq!(policy.base_delay(5), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = BackoffPolicy::for_reconnect().jitter(0.0).backoff();
        for _ in 0..6 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempts(), 6);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_policy() {
        let mut backoff = BackoffPolicy::fixed(Duration::from_millis(250)).backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::default().validate().is_ok());
        assert!(BackoffPolicy::for_commands().validate().is_ok());
        assert!(
            BackoffPolicy::default()
                .initial_delay(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            BackoffPolicy::default()
                .max_delay(Duration::from_millis(10))
                .validate()
                .is_err()
        );
        assert!(BackoffPolicy::default().multiplier(0.5).validate().is_err());
        assert!(BackoffPolicy::default().jitter(1.5).validate().is_err());
    }

    proptest! {
        #[test]
        fn delays_never_decrease_and_respect_cap(
            initial_ms in 1u64..2_000,
            extra_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..=1.0,
            steps in 1usize..40,
        ) {
            let policy = BackoffPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(initial_ms + extra_ms),
                multiplier,
                jitter,
            };
            let mut backoff = policy.backoff();
            let mut previous = Duration::ZERO;
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }
}
