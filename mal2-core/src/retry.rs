//! Retry policy for calls to external collaborators.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum BackoffStrategy {
    /// No backoff
    #[default]
    None,
    /// Fixed delay
    Fixed { delay_ms: u64 },
    /// Linear backoff
    Linear { base_ms: u64, increment_ms: u64 },
    /// Exponential backoff
    Exponential {
        base_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0 = first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            BackoffStrategy::None => 0,
            BackoffStrategy::Fixed { delay_ms } => *delay_ms,
            BackoffStrategy::Linear {
                base_ms,
                increment_ms,
            } => base_ms.saturating_add(u64::from(attempt).saturating_mul(*increment_ms)),
            BackoffStrategy::Exponential {
                base_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let delay = (*base_ms as f64) * multiplier.powi(exponent);
                if delay.is_finite() {
                    (delay as u64).min(*max_ms)
                } else {
                    *max_ms
                }
            }
        };
        Duration::from_millis(ms)
    }
}

/// Policy for retrying failed classifier calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Timeout per attempt in milliseconds
    pub timeout_per_attempt_ms: u64,
}

impl RetryPolicy {
    pub fn timeout_per_attempt(&self) -> Duration {
        Duration::from_millis(self.timeout_per_attempt_ms)
    }

    /// A policy that tries once with no delay.
    pub fn single_attempt(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::None,
            timeout_per_attempt_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base_ms: 100,
                multiplier: 2.0,
                max_ms: 10_000,
            },
            timeout_per_attempt_ms: 30_000,
        }
    }
}
