//! Backoff between retriable signer failures

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the send loop backs off after consecutive retriable failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Signer attempts per amount before the cycle gives up
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    /// Upper bound for a single backoff, jitter excluded
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to a quarter of the delay at random
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Same delay after every failure, no jitter
    pub fn fixed_delay(max_attempts: usize, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Backoff to wait after `failures` consecutive failures, or `None` once
    /// the attempts are used up
    pub fn next_backoff(&self, failures: usize) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        let exponent = failures.saturating_sub(1).min(i32::MAX as usize) as i32;
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = scaled.min(self.max_delay_ms as f64) as u64;
        let jitter_ms = if self.jitter {
            (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            0
        };
        Some(Duration::from_millis(delay_ms.saturating_add(jitter_ms)))
    }
}
