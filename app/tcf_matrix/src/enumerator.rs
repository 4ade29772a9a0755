/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use derive_more::Display;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use sha2::Digest;
use sha2::Sha256;

use crate::axes::AxisPermutation;
use crate::axes::AxisSet;
use crate::value::AxisValue;

/// Order in which permutation ids are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Randomizer {
    #[display(fmt = "sequential")]
    Sequential,
    #[display(fmt = "seed:{}", _0)]
    Seeded(u64),
    /// Seeded from OS entropy; the drawn seed is logged so the run can be
    /// reproduced with [`Randomizer::Seeded`].
    #[display(fmt = "random")]
    Random,
}

impl FromStr for Randomizer {
    type Err = Infallible;

    /// `sequential`, `random`, or anything else as a seed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sequential" | "" => Randomizer::Sequential,
            "random" => Randomizer::Random,
            seed => Randomizer::Seeded(
                seed.parse()
                    .unwrap_or_else(|_| seed_from_str(seed)),
            ),
        })
    }
}

fn seed_from_str(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

pub type PermutationFilter = Arc<dyn Fn(u64, &[AxisValue]) -> bool + Send + Sync>;

/// Lazily yields the axis permutations of one test case.
///
/// Sequential mode yields `0..max`. Random modes draw `max` ids uniformly
/// (repeats are possible and tolerated). The filter runs before an id is
/// yielded and the cap, when set, bounds how many are yielded.
pub struct AxesEnumerator {
    axes: Arc<AxisSet>,
    seed: Option<u64>,
    rng: Option<StdRng>,
    filter: Option<PermutationFilter>,
    cap: Option<u64>,
    /// Ids visited (sequential) or drawn (random) so far.
    position: u64,
    emitted: u64,
}

impl AxesEnumerator {
    pub fn new(axes: Arc<AxisSet>, randomizer: Randomizer) -> Self {
        let seed = match randomizer {
            Randomizer::Sequential => None,
            Randomizer::Seeded(seed) => Some(seed),
            Randomizer::Random => {
                let seed: u64 = rand::random();
                tracing::info!(seed, "Randomizing axis permutations");
                Some(seed)
            }
        };
        Self {
            axes,
            seed,
            rng: seed.map(StdRng::seed_from_u64),
            filter: None,
            cap: None,
            position: 0,
            emitted: 0,
        }
    }

    pub fn with_filter(mut self, filter: PermutationFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Zero means no cap.
    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = if cap == 0 { None } else { Some(cap) };
        self
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn axes(&self) -> &Arc<AxisSet> {
        &self.axes
    }

    /// Starts over; a random enumerator replays the same sequence.
    pub fn restart(&mut self) {
        self.rng = self.seed.map(StdRng::seed_from_u64);
        self.position = 0;
        self.emitted = 0;
    }

    fn next_id(&mut self) -> Option<u64> {
        let max = self.axes.max();
        if self.position >= max {
            return None;
        }
        self.position += 1;
        match &mut self.rng {
            None => Some(self.position - 1),
            Some(rng) => Some(rng.gen_range(0..max)),
        }
    }
}

impl Iterator for AxesEnumerator {
    type Item = AxisPermutation;

    fn next(&mut self) -> Option<AxisPermutation> {
        if let Some(cap) = self.cap {
            if self.emitted >= cap {
                return None;
            }
        }
        while let Some(id) = self.next_id() {
            let permutation = match self.axes.permutation(id) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Cannot decode permutation {}: {}", id, e);
                    return None;
                }
            };
            if let Some(filter) = &self.filter {
                if !filter(id, permutation.values()) {
                    tracing::debug!(id, "Axis permutation filtered out");
                    continue;
                }
            }
            self.emitted += 1;
            return Some(permutation);
        }
        None
    }
}
