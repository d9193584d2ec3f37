//! Retry bounds and backoff schedules for staged uploads.
//!
//! A staged upload is retried a bounded number of times. Each attempt carries a
//! `sent_count` (the number of submissions made before it) and this crate maps
//! that count to the delay before the next attempt and to the decision whether
//! another attempt is allowed at all.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Highest `sent_count` that is still allowed to be submitted (six attempts in total).
pub const DEFAULT_MAX_SENT_COUNT: u32 = 5;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Errors produced when validating a retry configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("retry schedule must contain at least one step")]
    EmptySchedule,
    #[error("retry schedule must not decrease: step {index} ({current:?}) is shorter than {previous:?}")]
    Decreasing {
        index: usize,
        previous: Duration,
        current: Duration,
    },
    #[error("invalid exponential schedule: {0}")]
    InvalidExponential(String),
}

/// Delay applied before an upload attempt, keyed by the attempt's `sent_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrySchedule {
    /// One delay per attempt; the last step repeats for every later attempt.
    Stepped(Vec<Duration>),
    /// Doubling-style schedule; the first attempt is never delayed.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl RetrySchedule {
    /// The default stepped schedule: immediately, 1 minute, 10 minutes,
    /// 30 minutes, 1 hour, then once a day.
    pub fn stepped_default() -> Self {
        RetrySchedule::Stepped(vec![
            Duration::ZERO,
            Duration::from_secs(MINUTE),
            Duration::from_secs(10 * MINUTE),
            Duration::from_secs(30 * MINUTE),
            Duration::from_secs(HOUR),
            Duration::from_secs(DAY),
        ])
    }

    /// Delay before the attempt that has `sent_count` earlier submissions.
    pub fn delay_for(&self, sent_count: u32) -> Duration {
        match self {
            RetrySchedule::Stepped(steps) => {
                let index = (sent_count as usize).min(steps.len().saturating_sub(1));
                steps.get(index).copied().unwrap_or(Duration::ZERO)
            }
            RetrySchedule::Exponential {
                initial,
                multiplier,
                max,
            } => {
                if sent_count == 0 {
                    return Duration::ZERO;
                }

                let mut policy = exponential_policy(*initial, *multiplier, *max);
                let mut delay = *initial;
                for _ in 0..sent_count {
                    match policy.next_backoff() {
                        // backoff adds up to a nanosecond even without jitter
                        Some(next) => delay = Duration::from_millis(next.as_millis() as u64),
                        None => break,
                    }
                    if delay >= *max {
                        return *max;
                    }
                }
                delay.min(*max)
            }
        }
    }

    /// Check that the schedule is well formed and never shrinks.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            RetrySchedule::Stepped(steps) => {
                if steps.is_empty() {
                    return Err(ScheduleError::EmptySchedule);
                }
                for (index, pair) in steps.windows(2).enumerate() {
                    if pair[1] < pair[0] {
                        return Err(ScheduleError::Decreasing {
                            index: index + 1,
                            previous: pair[0],
                            current: pair[1],
                        });
                    }
                }
                Ok(())
            }
            RetrySchedule::Exponential {
                initial,
                multiplier,
                max,
            } => {
                if initial.is_zero() {
                    return Err(ScheduleError::InvalidExponential(
                        "initial interval must be greater than zero".to_string(),
                    ));
                }
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(ScheduleError::InvalidExponential(format!(
                        "multiplier must be a finite value >= 1.0, got {multiplier}"
                    )));
                }
                if max < initial {
                    return Err(ScheduleError::InvalidExponential(format!(
                        "max interval {max:?} is shorter than initial interval {initial:?}"
                    )));
                }
                Ok(())
            }
        }
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::stepped_default()
    }
}

/// Deterministic exponential policy: no jitter and no elapsed-time cutoff, so
/// the n-th call to `next_backoff` always yields the same interval.
fn exponential_policy(initial: Duration, multiplier: f64, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_randomization_factor(0.0)
        .with_multiplier(multiplier)
        .with_max_interval(max)
        .with_max_elapsed_time(None)
        .build()
}

/// Attempt bound plus backoff schedule for one exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Largest `sent_count` that may still be submitted
    pub max_sent_count: u32,
    /// Delay schedule applied between attempts
    pub schedule: RetrySchedule,
}

impl RetryPolicy {
    pub fn new(max_sent_count: u32, schedule: RetrySchedule) -> Self {
        Self {
            max_sent_count,
            schedule,
        }
    }

    /// Whether an attempt with `sent_count` earlier submissions may go out.
    pub fn should_send(&self, sent_count: u32) -> bool {
        let allowed = sent_count <= self.max_sent_count;
        if !allowed {
            debug!(
                sent_count,
                max_sent_count = self.max_sent_count,
                "Retry budget exhausted"
            );
        }
        allowed
    }

    /// Delay before an attempt with `sent_count` earlier submissions.
    pub fn delay_for(&self, sent_count: u32) -> Duration {
        self.schedule.delay_for(sent_count)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.schedule.validate()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SENT_COUNT, RetrySchedule::default())
    }
}
