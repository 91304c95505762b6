//! Backoff for the two retry loops of the client
//!
//! - [`RetryConfig::transactions`]: [`crate::Session::run_with_retry`] runs
//!   the whole transaction again after `Conflict` or `Expired`.
//! - [`RetryConfig::resends`]: commit and abort requests are sent again after
//!   transport errors until the caller's deadline passes.

use std::time::Duration;
use strata_core::StrataError;

/// Which failures a retry loop recovers from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// The transaction was aborted and can run again under a new id
    Abort,
    /// The request may not have arrived and can be sent again as is
    Transport,
}

/// When and how often to retry
///
/// # Example
/// ```ignore
/// let config = RetryConfig::transactions(50)
///     .with_backoff(Duration::from_millis(1), Duration::from_millis(20));
/// Session::run_with_retry(&manager, &config, |session| session.write("k", 1))?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub retry_on: RetryOn,
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry; doubles for each one after
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::transactions(10)
    }
}

impl RetryConfig {
    /// Re-run aborted transactions up to `max_retries` times
    pub fn transactions(max_retries: usize) -> Self {
        Self {
            retry_on: RetryOn::Abort,
            max_retries,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(100),
        }
    }

    /// Resend requests after transport errors; a deadline bounds the loop
    pub fn resends() -> Self {
        Self {
            retry_on: RetryOn::Transport,
            max_retries: usize::MAX,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Whether this loop recovers from `error`
    pub fn retries(&self, error: &StrataError) -> bool {
        match self.retry_on {
            RetryOn::Abort => error.is_retryable(),
            RetryOn::Transport => error.is_transient(),
        }
    }

    /// Delay before retry number `attempt` after `error`, or `None` to give up
    pub fn next_delay(&self, attempt: usize, error: &StrataError) -> Option<Duration> {
        if attempt >= self.max_retries || !self.retries(error) {
            return None;
        }
        let factor = 1u32 << attempt.min(31);
        Some(
            self.initial_backoff
                .saturating_mul(factor)
                .min(self.max_backoff),
        )
    }
}
