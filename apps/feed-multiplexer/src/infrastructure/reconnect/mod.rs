//! Reconnection Policy
//!
//! Exponential backoff with jitter for re-establishing the upstream
//! connection after the receive loop ends.
//!
//! The delay before attempt `n` (1-based) is
//! `min(initial * multiplier^(n-1), max)`, then randomised by
//! `±jitter_factor`.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for any delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Error type for reconnection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// Every allowed attempt has been used.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use feed_multiplexer::infrastructure::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// let delay = policy.next_delay();
/// assert!(delay.is_ok());
/// assert_eq!(policy.attempt_count(), 1);
///
/// // Connection came back
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Consume one attempt and return how long to wait before it.
    ///
    /// # Errors
    ///
    /// Returns [`ReconnectError::MaxAttemptsExceeded`] once the configured
    /// number of attempts has been used.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        let max_attempts = self.config.max_attempts;
        if max_attempts > 0 && self.attempts >= max_attempts {
            return Err(ReconnectError::MaxAttemptsExceeded(max_attempts));
        }

        self.attempts += 1;
        Ok(self.jittered(self.base_delay(self.attempts)))
    }

    /// Forget previous attempts after a successful connection.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Delay before `attempt`, without jitter.
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        let max_secs = self.config.max_delay.as_secs_f64();
        let secs = (self.config.initial_delay.as_secs_f64() * factor).min(max_secs);

        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            self.config.max_delay
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = rand::rng().random_range(-factor..=factor);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

// =============================================================================
// Tests
// =============================================================================
