/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tcf_targets::Fullid;
use tcf_targets::ServerId;
use tcf_targets::TargetGroup;

use crate::state::AllocId;
use crate::state::RunId;

/// A target bound to a role, with the lease that grants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTarget {
    pub fullid: Fullid,
    pub allocid: AllocId,
}

impl BoundTarget {
    pub fn server(&self) -> ServerId {
        self.fullid.server()
    }

    pub fn target_id(&self) -> &str {
        self.fullid.target_id()
    }
}

/// A run whose target group is fully active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundRun {
    pub run: RunId,
    pub group_name: String,
    pub group: TargetGroup,
    /// Role name to target.
    pub targets: BTreeMap<String, BoundTarget>,
}

/// Resolves when the execution is over.
pub type ExecutionHandle = BoxFuture<'static, anyhow::Result<()>>;

/// Runs test cases on allocated targets.
pub trait ExecutionDispatcher: Send + Sync + 'static {
    fn launch(&self, run: BoundRun) -> ExecutionHandle;
}
