/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::path::Path;
use std::sync::Arc;

use crate::error::ProbeFailure;
use crate::testcase::TestCase;

/// Knows how to find test cases of one kind in a file.
pub trait TestDriver: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Test cases found in `path`. An empty list means the file is not
    /// this driver's.
    fn probe(&self, path: &Path) -> anyhow::Result<Vec<TestCase>>;
}

/// What a driver found in a file.
#[derive(Debug)]
pub struct Probed {
    pub driver: String,
    pub testcases: Vec<TestCase>,
}

/// Drivers in the order they get to claim a file.
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: Vec<Arc<dyn TestDriver>>,
}

impl DriverSet {
    pub fn new(drivers: Vec<Arc<dyn TestDriver>>) -> Self {
        Self { drivers }
    }

    pub fn push(&mut self, driver: Arc<dyn TestDriver>) -> &mut Self {
        self.drivers.push(driver);
        self
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// The first driver finding test cases in `path` wins; later drivers are
    /// not asked. A driver error stops probing the file.
    pub fn probe(&self, path: &Path) -> Result<Option<Probed>, ProbeFailure> {
        for driver in &self.drivers {
            let testcases = driver.probe(path).map_err(|source| ProbeFailure::Driver {
                path: path.to_owned(),
                driver: driver.name().to_owned(),
                source,
            })?;
            if !testcases.is_empty() {
                tracing::debug!(
                    path = %path.display(),
                    driver = driver.name(),
                    testcases = testcases.len(),
                    "Driver claimed file"
                );
                return Ok(Some(Probed {
                    driver: driver.name().to_owned(),
                    testcases,
                }));
            }
        }
        tracing::trace!(path = %path.display(), "No driver claimed file");
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Claims files with the given extension, one test case per file.
    pub(crate) struct ExtensionDriver(pub &'static str);

    impl TestDriver for ExtensionDriver {
        fn name(&self) -> &str {
            self.0
        }

        fn probe(&self, path: &Path) -> anyhow::Result<Vec<TestCase>> {
            if path.extension().is_some_and(|e| e == self.0) {
                let name = format!("{}#{}", path.display(), self.0);
                Ok(vec![TestCase::new(&name).with_origin(path)])
            } else {
                Ok(Vec::new())
            }
        }
    }

    pub(crate) struct FailingDriver;

    impl TestDriver for FailingDriver {
        fn name(&self) -> &str {
            "failing"
        }

        fn probe(&self, path: &Path) -> anyhow::Result<Vec<TestCase>> {
            if path.ends_with("bad.py") {
                anyhow::bail!("syntax error");
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_first_driver_wins() {
        let drivers = DriverSet::new(vec![
            Arc::new(ExtensionDriver("py")),
            Arc::new(ExtensionDriver("ini")),
            Arc::new(ExtensionDriver("py")),
        ]);
        let probed = drivers.probe(Path::new("a/test.py")).unwrap().unwrap();
        assert_eq!("py", probed.driver);
        assert_eq!(1, probed.testcases.len());
        assert_eq!(Some(Path::new("a/test.py")), probed.testcases[0].origin());

        assert_eq!(
            "ini",
            drivers.probe(Path::new("b/testcase.ini")).unwrap().unwrap().driver
        );
        assert!(drivers.probe(Path::new("README")).unwrap().is_none());
    }

    #[test]
    fn test_driver_error() {
        let drivers = DriverSet::new(vec![Arc::new(FailingDriver), Arc::new(ExtensionDriver("py"))]);
        assert_matches!(
            drivers.probe(Path::new("bad.py")),
            Err(ProbeFailure::Driver { driver, .. }) if driver == "failing"
        );
        assert!(drivers.probe(Path::new("good.py")).unwrap().is_some());
    }
}
