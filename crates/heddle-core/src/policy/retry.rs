//! Retry policy: decides whether a failed attempt is retried and after how long.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::TaskError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Randomization applied on top of an exponential delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    #[default]
    None,
    /// delay/2 + random[0, delay/2]
    Equal,
}

impl Jitter {
    pub fn apply(self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Equal => {
                let half = delay / 2;
                let extra = rand::thread_rng().gen_range(0..=half.as_nanos() as u64);
                half + Duration::from_nanos(extra)
            }
        }
    }
}

/// Delay function from the number of the failed attempt to the wait before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    Exponential {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        multiplier: f64,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
        #[serde(default)]
        jitter: Jitter,
    },
}

impl Default for Backoff {
    /// 1s, doubling, capped at 100s.
    fn default() -> Self {
        Backoff::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(100))
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff::Exponential {
            initial,
            multiplier,
            max,
            jitter: Jitter::None,
        }
    }

    pub fn with_jitter(self, jitter: Jitter) -> Self {
        match self {
            Backoff::Exponential {
                initial,
                multiplier,
                max,
                ..
            } => Backoff::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            },
            fixed => fixed,
        }
    }

    /// Delay after attempt `attempt` (1-indexed) failed.
    ///
    /// Exponential: `initial * multiplier^(attempt - 1)`, clamped to `max`.
    /// With initial=1s, multiplier=2.0: attempt 1 → 1s, 2 → 2s, 3 → 4s.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let nanos = initial.as_nanos() as f64 * multiplier.powi(exp);
                let base = if !nanos.is_finite() || nanos < 0.0 || nanos > max.as_nanos() as f64 {
                    max
                } else {
                    Duration::from_nanos(nanos as u64)
                };
                jitter.apply(base)
            }
        }
    }
}

/// Per-task retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt `max_attempts` is the last one allowed. Must be >= 1.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

/// The next action after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Retry { next_attempt: u32, delay: Duration },
    Fail { reason: String },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::fixed(Duration::ZERO))
    }

    /// Pure: same inputs, same decision (modulo jitter).
    pub fn decide(&self, attempt: u32, error: &TaskError) -> Decision {
        if !error.is_retryable() {
            return Decision::Fail {
                reason: format!("{} error is not retryable", error.kind()),
            };
        }
        if attempt >= self.max_attempts {
            return Decision::Fail {
                reason: format!("max attempts reached: {}/{}", attempt, self.max_attempts),
            };
        }
        Decision::Retry {
            next_attempt: attempt + 1,
            delay: self.backoff.delay(attempt),
        }
    }
}
