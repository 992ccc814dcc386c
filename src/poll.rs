//! Bounded fixed-interval polling for eventually-consistent resources.
//!
//! Infrastructure converges in seconds to minutes, so polling uses a fixed
//! interval and a hard attempt budget instead of open-ended backoff. The
//! predicate tags each failure as retryable or fatal; a fatal failure stops
//! polling immediately.
//!
//! # Example
//!
//! ```ignore
//! use stackverify::poll::{poll_until_ready, PollFailure, PollPolicy};
//!
//! let pods = poll_until_ready(&PollPolicy::new(30, Duration::from_secs(10)), "pod count", || async {
//!     let pods = reader.list_pods(ns, &labels).await?;
//!     if pods.len() == 1 { Ok(pods) } else { Err(PollFailure::retry("not scheduled yet")) }
//! }).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// How often and how long to poll a single check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollPolicy {
    /// Maximum number of predicate invocations
    pub max_attempts: u32,
    /// Fixed delay between invocations
    #[serde(with = "crate::config::duration")]
    pub interval: Duration,
    /// Optional wall-clock budget; polling stops early if the next attempt
    /// would start past it
    #[serde(default, with = "crate::config::duration::option")]
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    /// Create a policy with an attempt budget and a fixed interval
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            timeout: None,
        }
    }

    /// Add a wall-clock budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Upper bound on how long polling can block; saturates at `Duration::MAX`
    pub fn max_wait(&self) -> Duration {
        let budget = self
            .interval
            .checked_mul(self.max_attempts.saturating_sub(1))
            .unwrap_or(Duration::MAX);
        match self.timeout {
            Some(timeout) => budget.min(timeout),
            None => budget,
        }
    }
}

/// Outcome of a single failed predicate invocation.
#[derive(Debug)]
pub enum PollFailure {
    /// Not ready yet; try again after the interval
    Retry(String),
    /// The request itself is wrong or the resource reached a terminal state
    Fatal(Error),
}

impl PollFailure {
    /// A retryable failure with the given reason
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }
}

/// Absence is retryable while polling; every other error is fatal.
impl From<Error> for PollFailure {
    fn from(err: Error) -> Self {
        if err.is_retryable() {
            Self::Retry(err.to_string())
        } else {
            Self::Fatal(err)
        }
    }
}

/// Invoke `predicate` until it succeeds, fails fatally, or the policy is
/// exhausted.
///
/// Returns the predicate's value on success. On exhaustion returns
/// [`Error::Timeout`] carrying the reason from the final attempt. A fatal
/// failure is returned unchanged after exactly the attempts made so far.
pub async fn poll_until_ready<F, Fut, T>(
    policy: &PollPolicy,
    check: &str,
    mut predicate: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, PollFailure>>,
{
    // A budget past the end of the clock is no budget at all
    let deadline = policy.timeout.and_then(|t| Instant::now().checked_add(t));
    let mut last_reason = String::from("no attempts made");
    let mut attempt = 0u32;

    while attempt < policy.max_attempts {
        attempt += 1;

        match predicate().await {
            Ok(value) => {
                debug!(check = %check, attempt, "Check satisfied");
                return Ok(value);
            }
            Err(PollFailure::Fatal(e)) => {
                warn!(check = %check, attempt, error = %e, "Check failed fatally");
                return Err(e);
            }
            Err(PollFailure::Retry(reason)) => {
                last_reason = reason;
            }
        }

        if attempt == policy.max_attempts {
            break;
        }
        if let Some(deadline) = deadline {
            match Instant::now().checked_add(policy.interval) {
                Some(next) if next <= deadline => {}
                _ => break,
            }
        }

        debug!(
            check = %check,
            attempt,
            max_attempts = policy.max_attempts,
            reason = %last_reason,
            delay_ms = policy.interval.as_millis(),
            "Check not yet satisfied, retrying"
        );
        tokio::time::sleep(policy.interval).await;
    }

    error!(
        check = %check,
        attempts = attempt,
        reason = %last_reason,
        "Check did not succeed within its polling budget"
    );
    Err(Error::timeout(check, attempt, last_reason))
}
