/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::path::PathBuf;

use tcf_alloc::AllocationError;
use tcf_matrix::axes::AxesError;
use tcf_targets::resolver::ResolveError;

/// A test case that cannot be planned or run. These are configuration
/// errors; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Test case `{testcase}`: cannot build its axes")]
    Axes {
        testcase: String,
        #[source]
        source: AxesError,
    },
    #[error("Test case `{testcase}`: no axis permutation filter named `{filter}`")]
    UnknownFilter { testcase: String, filter: String },
    #[error("Test case `{testcase}`: cannot resolve its targets")]
    Resolve {
        testcase: String,
        #[source]
        source: ResolveError,
    },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// A file that could not be probed for test cases.
#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("Driver `{driver}` failed probing `{}`", path.display())]
    Driver {
        path: PathBuf,
        driver: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Probing `{}` panicked: {message}", path.display())]
    Panicked { path: PathBuf, message: String },
    #[error("Probing `{}` was cancelled", path.display())]
    Cancelled { path: PathBuf },
}
