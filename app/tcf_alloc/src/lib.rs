/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Leases over target groups: requesting them from the servers that own the
//! targets, keeping them alive, launching execution once a group is granted
//! and releasing them afterwards.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod manager;
pub mod map;
pub mod protocol;
pub mod state;
pub mod transport;

pub use error::AllocationError;
pub use manager::AllocationManager;
pub use manager::AllocationManagerHandle;
pub use manager::RunRequest;
pub use map::RunOutcome;
pub use state::AllocId;
pub use state::AllocationState;
pub use state::RunId;
