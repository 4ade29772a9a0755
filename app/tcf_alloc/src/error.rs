/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use tcf_targets::ServerId;
use tcf_util::retry::RetryError;

use crate::state::AllocId;
use crate::state::AllocationState;
use crate::state::RunId;
use crate::transport::TransportError;

/// Why allocations, or a whole run, could not proceed. Each one is scoped
/// to the allocations or run it names.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("Creating allocation on `{server}` failed")]
    Create {
        server: ServerId,
        #[source]
        source: TransportError,
    },
    #[error("Allocation on `{server}` refused with state `{state}`: {message}")]
    Refused {
        server: ServerId,
        state: String,
        message: String,
    },
    #[error("Keepalive to `{server}` failed")]
    Keepalive {
        server: ServerId,
        #[source]
        source: RetryError<TransportError>,
    },
    #[error("Unexpected answer from `{server}`: {message}")]
    Protocol { server: ServerId, message: String },
    #[error("`{server}/{allocid}` ended with state `{state}`")]
    Terminated {
        server: ServerId,
        allocid: AllocId,
        state: AllocationState,
    },
    #[error("Run `{run}` waited {waited_secs:.1}s in the queue")]
    QueueTimeout { run: RunId, waited_secs: f64 },
    #[error("No server with allocations answered the keepalive")]
    AllServersUnreachable,
    #[error("Run `{run}` has no target group that can still be allocated")]
    Exhausted { run: RunId },
    #[error("Execution of `{run}` on group `{group}` failed")]
    Execution {
        run: RunId,
        group: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Run `{0}` is already allocating")]
    DuplicateRun(RunId),
    #[error("The allocation manager is shut down")]
    ShutDown,
}
