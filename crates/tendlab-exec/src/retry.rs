//! Bounded polling for external conditions

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ExecError;

/// How often and how long to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy
    #[must_use]
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Poll `operation` until it yields a value
///
/// `operation` receives the 1-based attempt number and returns
/// `Ok(Some(v))` when done, `Ok(None)` to try again, or `Err` to abort.
///
/// # Errors
///
/// Returns the operation's error, or `ExecError::RetryExhausted` naming
/// `what` and the attempt count once the budget is used up.
pub async fn retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: impl AsyncFnMut(u32) -> Result<Option<T>, ExecError>,
) -> Result<T, ExecError> {
    for attempt in 1..=policy.attempts {
        if let Some(value) = operation(attempt).await? {
            debug!(what, attempt, "condition met");
            return Ok(value);
        }

        if attempt < policy.attempts {
            debug!(what, attempt, of = policy.attempts, "not yet, retrying");
            tokio::time::sleep(policy.interval).await;
        }
    }

    warn!(what, attempts = policy.attempts, "retries exhausted");
    Err(ExecError::RetryExhausted {
        what: what.to_string(),
        attempts: policy.attempts,
    })
}
