/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::time::Duration;

use allocative::Allocative;
use serde::Deserialize;
use serde::Serialize;
use tcf_alloc::config::AllocatorConfig;
use tcf_targets::config::PairingConfig;
use tcf_util::config::TcfConfig;

/// Defaults for the `[run]` knobs; test cases may override each of them.
#[derive(Allocative, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Target groups requested per group actually needed.
    pub overallocation_factor: f64,
    /// Axis permutations to run per test case; zero runs them all.
    pub axes_permutations: u64,
    /// Target groups to run each axis permutation on; zero runs on every
    /// group that can be found.
    pub target_group_permutations: u64,
    /// Files probed at once.
    pub probe_workers: usize,
    /// How long a run may wait for its allocations; unset waits forever.
    pub queue_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            overallocation_factor: 2.0,
            axes_permutations: 0,
            target_group_permutations: 1,
            probe_workers: 2,
            queue_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &TcfConfig) -> anyhow::Result<Self> {
        let default = Self::default();
        let section = "run";
        let overallocation_factor: f64 = config
            .parse(section, "overallocation_factor")?
            .unwrap_or(default.overallocation_factor);
        if !overallocation_factor.is_finite() || overallocation_factor < 1.0 {
            anyhow::bail!(
                "run.overallocation_factor must be at least 1, got {}",
                overallocation_factor
            );
        }
        Ok(Self {
            overallocation_factor,
            axes_permutations: config
                .parse(section, "axes_permutations")?
                .unwrap_or(default.axes_permutations),
            target_group_permutations: config
                .parse(section, "target_group_permutations")?
                .unwrap_or(default.target_group_permutations),
            probe_workers: config
                .parse::<usize>(section, "probe_workers")?
                .unwrap_or(default.probe_workers)
                .max(1),
            queue_timeout_ms: config.parse(section, "queue_timeout_ms")?,
        })
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }
}

/// Everything a run session is configured with.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestrateConfig {
    pub session: SessionConfig,
    pub pairing: PairingConfig,
    pub allocation: AllocatorConfig,
}

impl OrchestrateConfig {
    pub fn from_config(config: &TcfConfig) -> anyhow::Result<Self> {
        Ok(Self {
            session: SessionConfig::from_config(config)?,
            pairing: PairingConfig::from_config(config)?,
            allocation: AllocatorConfig::from_config(config)?,
        })
    }
}
