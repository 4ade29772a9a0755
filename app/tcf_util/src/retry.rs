/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::cmp;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Capped exponential backoff inside a total retry window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            window: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Timed out after {0:.2}s")]
    Timeout(f64),
    #[error("Failed after {tries} tries in {timeout_secs:.2}s, last error: {last_error}")]
    Failed {
        timeout_secs: f64,
        tries: u32,
        last_error: E,
    },
    /// The operation failed with an error the caller classified as final.
    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Timeout(_) => None,
            RetryError::Failed { last_error, .. } => Some(last_error),
            RetryError::Fatal(e) => Some(e),
        }
    }
}

/// Runs `func` until it succeeds, returns an error `is_retryable` rejects,
/// or the policy window closes.
pub async fn retrying<L, E, Fut, F, R>(
    policy: RetryPolicy,
    is_retryable: R,
    mut func: F,
) -> Result<L, RetryError<E>>
where
    Fut: Future<Output = Result<L, E>>,
    F: FnMut() -> Fut,
    R: Fn(&E) -> bool,
{
    let deadline = Instant::now() + policy.window;
    let mut wait = policy.initial_delay;
    let mut tries = 0;
    let mut last_error = None;

    loop {
        tries += 1;
        match tokio::time::timeout_at(deadline, func()).await {
            Ok(Ok(val)) => return Ok(val),
            Ok(Err(e)) => {
                if !is_retryable(&e) {
                    return Err(RetryError::Fatal(e));
                }
                tracing::debug!(tries, ?wait, "Retryable failure, backing off");
                last_error = Some(e);
                let now = Instant::now();
                if now >= deadline {
                    return Err(make_error(tries, last_error, policy.window));
                }
                tokio::time::sleep_until(cmp::min(deadline, now + wait)).await;
                wait = cmp::min(policy.max_delay, wait * 2);
            }
            Err(_) => return Err(make_error(tries, last_error, policy.window)),
        }
    }

    fn make_error<E>(tries: u32, last_error: Option<E>, window: Duration) -> RetryError<E> {
        let timeout_secs = window.as_secs_f64();
        match last_error {
            Some(e) => RetryError::Failed {
                timeout_secs,
                tries,
                last_error: e,
            },
            None => RetryError::Timeout(timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            window: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_succeeds_after_failures() {
        let calls = &AtomicU32::new(0);
        let res: Result<u32, RetryError<&str>> = retrying(
            policy(),
            |_| true,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 { Err("refused") } else { Ok(n) }
            },
        )
        .await;
        assert_matches!(res, Ok(3));
        assert_eq!(4, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_error_forever() {
        let res: Result<(), RetryError<&str>> =
            retrying(policy(), |_| true, || async { Err("refused") }).await;
        assert_matches!(res, Err(RetryError::Failed { last_error: "refused", tries, .. }) => {
            assert!(tries > 1);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_fatal_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), RetryError<&str>> = retrying(
            policy(),
            |e| *e != "bad request",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad request")
            },
        )
        .await;
        assert_matches!(res, Err(RetryError::Fatal("bad request")));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }
}
