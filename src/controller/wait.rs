//! Bounded, cancellable polling and write retries

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::controller::error::{BackoffConfig, Error, Result};

/// Write attempts before an optimistic-concurrency failure is surfaced
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Polling budget of one wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between attempts
    pub interval: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl PollConfig {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Poll `check` until it reports `true`.
///
/// Retryable errors from `check` count as "not yet"; any other error aborts
/// the wait. Exhausting the budget returns [`Error::Timeout`], and
/// cancellation between attempts returns [`Error::Cancelled`].
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    config: PollConfig,
    what: &str,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(what, attempt, "Condition not yet met"),
            Err(e) if e.is_retryable() => {
                trace!(what, attempt, error = %e, "Check failed, retrying")
            }
            Err(e) => return Err(e),
        }

        if attempt < config.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(config.interval) => {}
            }
        }
    }

    Err(Error::Timeout {
        operation: what.to_string(),
        attempts: config.max_attempts,
    })
}

/// Run `write` again while it loses races with other writers.
///
/// Conflicts, create races and delete races are retried with the short
/// write backoff, up to [`MAX_WRITE_ATTEMPTS`] attempts. `write` must read
/// fresh state on every call. Cancellation during a backoff returns
/// [`Error::Cancelled`].
pub async fn retry_write<T, F, Fut>(
    cancel: &CancellationToken,
    what: &str,
    mut write: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = BackoffConfig::write_retry();
    let mut attempt = 0;
    loop {
        match write().await {
            Err(e)
                if (e.is_conflict() || e.is_already_exists() || e.is_not_found())
                    && attempt + 1 < MAX_WRITE_ATTEMPTS =>
            {
                let delay = backoff.delay_for_attempt(attempt);
                debug!(what, error = %e, ?delay, "Write raced with another writer, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            result => return result,
        }
    }
}
