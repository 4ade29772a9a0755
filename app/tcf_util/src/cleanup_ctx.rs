/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use dupe::Dupe;
use futures::future;
use futures::future::BoxFuture;
use parking_lot::Mutex;

/// For cleanup we want to perform, but cant do in `drop` because it's async.
///
/// Every registered job runs concurrently on [`cleanup`](Self::cleanup) and
/// the whole batch is abandoned once `timeout` elapses.
#[derive(Clone, Dupe)]
pub struct AsyncCleanupContext {
    jobs: Arc<Mutex<Vec<BoxFuture<'static, ()>>>>,
    timeout: Duration,
}

impl AsyncCleanupContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            timeout,
        }
    }

    pub fn register(&self, name: String, fut: BoxFuture<'static, ()>) {
        const WARNING_TIMEOUT: Duration = Duration::from_millis(1000);
        self.jobs.lock().push(Box::pin(async move {
            let start = Instant::now();
            fut.await;
            let elapsed = start.elapsed();
            if elapsed > WARNING_TIMEOUT {
                tracing::warn!("Async cleanup step '{}' took {:?}", name, elapsed);
            } else {
                tracing::debug!("Async cleanup step '{}' took {:?}", name, elapsed);
            };
        }));
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    pub async fn cleanup(&self) {
        let futs = std::mem::take(&mut *self.jobs.lock());
        if futs.is_empty() {
            return;
        }
        if tokio::time::timeout(self.timeout, future::join_all(futs))
            .await
            .is_err()
        {
            tracing::warn!("Timeout waiting for async cleanup after {:?}", self.timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    use futures::FutureExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_jobs() {
        let ctx = AsyncCleanupContext::new(Duration::from_secs(1));
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.dupe();
        ctx.register(
            "flag".to_owned(),
            async move { done2.store(true, Ordering::SeqCst) }.boxed(),
        );
        assert_eq!(1, ctx.pending());
        ctx.cleanup().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(0, ctx.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_is_bounded() {
        let ctx = AsyncCleanupContext::new(Duration::from_secs(1));
        ctx.register("hang".to_owned(), future::pending().boxed());
        let start = tokio::time::Instant::now();
        ctx.cleanup().await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
