//! Exponential backoff for failed deliveries.
//!
//! The delay before attempt `n + 1` is `base * 2^(n - 1)` capped at
//! `max_delay`, where `n` is the number of attempts that have failed so far.
//! Optional jitter randomizes the delay without ever exceeding the cap.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Retry policy for webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the immediate one included.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Upper bound for any delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0). Zero keeps delays deterministic.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        }
    }
}

/// Outcome of applying the policy to a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the record to pending.
    Retry {
        /// Failed attempts including this one.
        attempt_count: u32,
        /// Earliest time of the next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Mark the record permanently failed.
    GiveUp {
        /// Failed attempts including this one.
        attempt_count: u32,
        /// Why no further attempt is made.
        reason: String,
    },
}

impl RetryDecision {
    /// Failed attempts including the one just decided on.
    pub fn attempt_count(&self) -> u32 {
        match self {
            Self::Retry { attempt_count, .. } | Self::GiveUp { attempt_count, .. } => {
                *attempt_count
            },
        }
    }
}

impl RetryPolicy {
    /// Checks the policy for values that would make backoff meaningless.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` describing the first
    /// invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(DeliveryError::configuration("base_delay must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(DeliveryError::configuration("max_delay must not be below base_delay"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DeliveryError::configuration("jitter_factor must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Delay to wait after `attempt_count` failed attempts.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let multiplier = 2_u32.saturating_pow(exponent);
        let exponential = self.base_delay.saturating_mul(multiplier);
        let capped = exponential.min(self.max_delay);

        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }

    /// Decides what happens after a failed attempt.
    ///
    /// `previous_attempts` is the record's attempt count before this attempt,
    /// zero for the immediate attempt of a fresh dispatch.
    pub fn decide(
        &self,
        previous_attempts: u32,
        error: &DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        let attempt_count = previous_attempts.saturating_add(1);

        if !error.is_retryable() {
            return RetryDecision::GiveUp {
                attempt_count,
                reason: format!("non-retryable error: {error}"),
            };
        }

        if attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp {
                attempt_count,
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        let Ok(delay) = chrono::Duration::from_std(self.delay_for(attempt_count)) else {
            return RetryDecision::GiveUp {
                attempt_count,
                reason: "retry delay out of range".to_string(),
            };
        };

        RetryDecision::Retry { attempt_count, next_attempt_at: failed_at + delay }
    }
}

/// Randomizes `duration` by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
