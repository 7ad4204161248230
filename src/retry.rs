//! Retry classification and exponential backoff for executor failures.

use std::time::Duration;

use crate::error::{ErrorKind, ExecutionError};

/// Whether a failed attempt may be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    Permanent,
}

/// Maps an executor failure to a [`RetryDecision`] by its kind tag.
pub struct RetryClassifier;

impl RetryClassifier {
    /// Transport, timeout and rate-limit rejections are retryable. Invalid
    /// requests and authentication failures are permanent. Unrecognized
    /// failures are retried.
    pub fn classify(error: &ExecutionError) -> RetryDecision {
        match error.kind {
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::RateLimited => {
                RetryDecision::Retryable
            }
            ErrorKind::Authentication | ErrorKind::InvalidRequest => RetryDecision::Permanent,
            ErrorKind::Other => RetryDecision::Retryable,
        }
    }
}

/// How many times a job is retried and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts allowed after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each later retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Total attempts a job may get, first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (1-based):
    /// `base_delay * 2^(retry - 1)`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retrying after `error`, honouring a server `retry_after`
    /// hint when it asks for longer than the backoff.
    pub fn delay_after(&self, retry: u32, error: &ExecutionError) -> Duration {
        let backoff = self.delay_for_retry(retry);
        match error.retry_after {
            Some(hint) => backoff.max(hint.min(self.max_delay)),
            None => backoff,
        }
    }
}
