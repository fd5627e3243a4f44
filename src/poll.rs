// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for polling for a condition to become true before a deadline
//!
//! Every bounded wait during a bring-up (a singleton instance reaching the
//! running state, the status endpoint answering at all, the worker count
//! reaching its target) goes through [`wait_for_condition`] or
//! [`wait_for_condition_until`].

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Result of [`wait_for_condition`] when the condition never became ready
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    PermanentError(E),
}

/// Result of one evaluation of the condition that is not "ready"
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition is not yet satisfied; try again after the interval
    #[error("poll condition not yet ready")]
    NotYet,
    /// the probed thing could not be reached this time (e.g., connection
    /// refused); treated exactly like `NotYet`
    #[error("transient error while polling on condition: {0}")]
    Transient(E),
    /// stop polling and report this error to the caller
    #[error("non-retryable error while polling on condition: {0}")]
    Failed(E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// `poll_max` has elapsed.
///
/// `cond` is invoked once immediately and then again after every
/// `poll_interval` for as long as it reports [`CondCheckError::NotYet`] or
/// [`CondCheckError::Transient`].  `cond` should do its own bounded I/O: the
/// deadline is only checked between invocations.
pub async fn wait_for_condition<O, E, Func, Fut>(
    cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    wait_for_condition_until(cond, poll_start, poll_interval, poll_max).await
}

/// Like [`wait_for_condition`], but measures `poll_max` from `poll_start`
/// rather than from now.
///
/// This lets several consecutive waits share one overall deadline.
pub async fn wait_for_condition_until<O, E, Func, Fut>(
    mut cond: Func,
    poll_start: Instant,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration >= *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet | CondCheckError::Transient(_)) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
