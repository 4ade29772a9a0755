/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Run sessions: finding test cases in files, planning the axis and target
//! group permutations each one runs on, and allocating targets for them.

pub mod config;
pub mod driver;
pub mod error;
pub mod filters;
pub mod probe;
pub mod session;
pub mod testcase;

pub use config::OrchestrateConfig;
pub use driver::DriverSet;
pub use driver::TestDriver;
pub use error::ProbeFailure;
pub use error::SessionError;
pub use filters::FilterRegistry;
pub use session::RunSession;
pub use session::SessionReport;
pub use testcase::TestCase;
