/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;

use tcf_targets::ServerId;

use crate::error::AllocationError;
use crate::state::AllocId;
use crate::state::AllocationState;
use crate::state::RunId;

/// What the manager did, in the order it did it.
#[derive(Debug, Clone)]
pub enum AllocationEvent {
    Created {
        run: RunId,
        server: ServerId,
        allocid: AllocId,
        state: AllocationState,
        groups: Vec<String>,
    },
    Activated {
        run: RunId,
        server: ServerId,
        allocid: AllocId,
        group: String,
    },
    Launched {
        run: RunId,
        group: String,
    },
    /// The removal request was sent (or given up on).
    Released {
        run: RunId,
        server: ServerId,
        allocid: AllocId,
    },
    /// An allocation, or the whole run when nothing is left for it, cannot
    /// proceed.
    Blocked {
        run: RunId,
        error: Arc<AllocationError>,
    },
    RunFinished {
        run: RunId,
        launched: u64,
    },
}

impl AllocationEvent {
    pub fn run(&self) -> &RunId {
        match self {
            AllocationEvent::Created { run, .. }
            | AllocationEvent::Activated { run, .. }
            | AllocationEvent::Launched { run, .. }
            | AllocationEvent::Released { run, .. }
            | AllocationEvent::Blocked { run, .. }
            | AllocationEvent::RunFinished { run, .. } => run,
        }
    }
}
