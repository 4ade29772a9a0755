/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Probing files for test cases away from the async workers.
//!
//! Drivers run arbitrary code (parsers, interpreters), so each probe runs on
//! tokio's blocking pool with a bounded number in flight. A panicking driver
//! becomes a failure for that file only.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use dupe::Dupe;
use futures::StreamExt;
use futures::stream;

use crate::driver::DriverSet;
use crate::driver::Probed;
use crate::error::ProbeFailure;

#[derive(Debug)]
pub struct ProbeResult {
    pub path: PathBuf,
    /// `None` when no driver claimed the file.
    pub result: Result<Option<Probed>, ProbeFailure>,
}

/// Probes every path, at most `workers` at a time. Results come back in the
/// order of `paths`.
pub async fn probe_all(
    drivers: Arc<DriverSet>,
    paths: Vec<PathBuf>,
    workers: usize,
) -> Vec<ProbeResult> {
    stream::iter(paths)
        .map(|path| {
            let drivers = drivers.dupe();
            async move {
                let probe_path = path.clone();
                let result =
                    match tokio::task::spawn_blocking(move || drivers.probe(&probe_path)).await {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => Err(ProbeFailure::Panicked {
                            path: path.clone(),
                            message: panic_message(e.into_panic()),
                        }),
                        Err(_) => Err(ProbeFailure::Cancelled { path: path.clone() }),
                    };
                if let Err(e) = &result {
                    tracing::warn!("{}", e);
                }
                ProbeResult { path, result }
            }
        })
        .buffered(workers.max(1))
        .collect()
        .await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(message) => (*message).to_owned(),
            None => "panic with a non-string payload".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;

    use super::*;
    use crate::driver::TestDriver;
    use crate::driver::tests::ExtensionDriver;
    use crate::driver::tests::FailingDriver;
    use crate::testcase::TestCase;

    struct PanickingDriver;

    impl TestDriver for PanickingDriver {
        fn name(&self) -> &str {
            "panicking"
        }

        fn probe(&self, path: &Path) -> anyhow::Result<Vec<TestCase>> {
            if path.ends_with("boom.py") {
                panic!("driver blew up");
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_probe_all() {
        let drivers = Arc::new(DriverSet::new(vec![
            Arc::new(PanickingDriver),
            Arc::new(FailingDriver),
            Arc::new(ExtensionDriver("py")),
        ]));
        let paths: Vec<PathBuf> = ["a.py", "boom.py", "bad.py", "notes.txt", "b.py"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let results = probe_all(drivers, paths.clone(), 2).await;
        assert_eq!(
            paths,
            results.iter().map(|r| r.path.clone()).collect::<Vec<_>>()
        );
        assert_matches!(&results[0].result, Ok(Some(p)) if p.driver == "py");
        assert_matches!(
            &results[1].result,
            Err(ProbeFailure::Panicked { message, .. }) if message == "driver blew up"
        );
        assert_matches!(&results[2].result, Err(ProbeFailure::Driver { .. }));
        assert_matches!(&results[3].result, Ok(None));
        assert_matches!(&results[4].result, Ok(Some(_)));
    }
}
