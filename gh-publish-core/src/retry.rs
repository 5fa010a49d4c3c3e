//! Retry decisions for failed stage attempts.
//!
//! [`RetryPolicy::decide`] is a pure function of the error class and the
//! attempt number (plus a jitter sample). It holds no state beyond its
//! configuration, so it can be exercised without any I/O.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, PublishError};

/// Backoff configuration. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts allowed per stage, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay used as symmetric jitter (0.0..=1.0).
    pub jitter_ratio: f64,
    /// Minimum delay for lock and rate-limit failures.
    pub lock_floor_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
            lock_floor_ms: 5_000,
        }
    }
}

/// Why a decision was made; recorded in progress events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    NotRetryable,
    AttemptsExhausted,
    TransientFailure,
    LockedOrRateLimited,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    pub reason: ReasonCode,
}

impl RetryDecision {
    fn stop(reason: ReasonCode) -> Self {
        RetryDecision {
            should_retry: false,
            delay: Duration::ZERO,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Jitter {
    Random,
    /// Fixed sample in `-1.0..=1.0`.
    Fixed(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
    jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        RetryPolicy {
            config,
            jitter: Jitter::Random,
        }
    }

    /// Deterministic policy: jitter sample pinned to `sample` (clamped to -1..=1).
    pub fn with_fixed_jitter(config: RetryConfig, sample: f64) -> Self {
        RetryPolicy {
            config,
            jitter: Jitter::Fixed(sample.clamp(-1.0, 1.0)),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed with
    /// an error of class `class`.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        let reason = match class {
            ErrorClass::TransientNetwork => ReasonCode::TransientFailure,
            ErrorClass::RemoteLock => ReasonCode::LockedOrRateLimited,
            ErrorClass::ProcessTimeout => ReasonCode::TimedOut,
            _ => return RetryDecision::stop(ReasonCode::NotRetryable),
        };
        if attempt >= self.config.max_attempts {
            return RetryDecision::stop(ReasonCode::AttemptsExhausted);
        }

        let mut delay_ms = self.backoff_ms(attempt);
        if class == ErrorClass::RemoteLock {
            delay_ms = delay_ms.max(self.config.lock_floor_ms as f64);
        }
        delay_ms = self.apply_jitter(delay_ms);

        RetryDecision {
            should_retry: true,
            delay: Duration::from_millis(delay_ms.round().max(0.0) as u64),
            reason,
        }
    }

    /// Like [`decide`](Self::decide), but honours a server `Retry-After` hint
    /// (capped at the configured maximum delay).
    pub fn decide_for(&self, error: &PublishError, attempt: u32) -> RetryDecision {
        let mut decision = self.decide(error.class(), attempt);
        if decision.should_retry {
            if let Some(secs) = error.retry_after_secs() {
                let hinted = Duration::from_secs(secs)
                    .min(Duration::from_millis(self.config.max_delay_ms));
                decision.delay = decision.delay.max(hinted);
            }
        }
        decision
    }

    fn backoff_ms(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.max(1.0).powi(exponent);
        raw.min(self.config.max_delay_ms as f64)
    }

    fn apply_jitter(&self, delay_ms: f64) -> f64 {
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return delay_ms;
        }
        let sample = match self.jitter {
            Jitter::Random => rand::thread_rng().gen_range(-1.0..=1.0),
            Jitter::Fixed(sample) => sample,
        };
        delay_ms * (1.0 + ratio * sample)
    }
}
