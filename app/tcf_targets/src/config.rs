/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use allocative::Allocative;
use serde::Deserialize;
use serde::Serialize;
use tcf_util::config::TcfConfig;

/// Limits of candidate resolution and target group generation.
#[derive(Allocative, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingConfig {
    /// Consecutive fruitless attempts after which group generation gives
    /// up.
    pub spin_max: u64,
    /// Hex digits in a group id.
    pub hash_length: usize,
    /// Entries kept by the resolver cache.
    pub cache_capacity: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            spin_max: 3000,
            hash_length: 10,
            cache_capacity: 5000,
        }
    }
}

impl PairingConfig {
    pub fn from_config(config: &TcfConfig) -> anyhow::Result<Self> {
        let default = Self::default();
        let spin_max = config
            .parse("pairing", "spin_max")?
            .unwrap_or(default.spin_max);
        let hash_length = config
            .parse("pairing", "hash_length")?
            .unwrap_or(default.hash_length);
        let cache_capacity = config
            .parse("pairing", "cache_capacity")?
            .unwrap_or(default.cache_capacity);
        if !(1..=64).contains(&hash_length) {
            anyhow::bail!("pairing.hash_length must be between 1 and 64, got {}", hash_length);
        }
        Ok(Self {
            spin_max,
            hash_length,
            cache_capacity,
        })
    }
}
