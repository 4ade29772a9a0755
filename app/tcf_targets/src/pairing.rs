/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Pairing of one axis permutation with concrete target groups.
//!
//! Interconnect roles are assigned first. Each interconnect group seeds the
//! resolution of the endpoint roles, so endpoints are only drawn from
//! targets attached to those interconnects. Endpoint groups are then drawn
//! from the per-interconnect iterators in turn, which spreads the yielded
//! groups across interconnects instead of exhausting the first one.

use std::collections::BTreeMap;
use std::sync::Arc;

use tcf_matrix::AxisValue;
use tcf_matrix::axes::AxisPermutation;
use tcf_matrix::enumerator::Randomizer;

use crate::config::PairingConfig;
use crate::group::GroupId;
use crate::group::TargetGroup;
use crate::group_iter::GroupIter;
use crate::resolver::EligibleSet;
use crate::resolver::ResolveError;
use crate::resolver::TargetResolver;
use crate::role::TargetRole;

/// Called as `(group_id, ic_group_id, group)`; groups it rejects are
/// skipped.
pub type TargetGroupFilter = Arc<dyn Fn(&GroupId, &GroupId, &TargetGroup) -> bool + Send + Sync>;

/// An endpoint group merged with the interconnect group it was resolved
/// against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedGroup {
    /// Id of the endpoint part.
    pub group_id: GroupId,
    pub ic_group_id: GroupId,
    pub group: TargetGroup,
}

enum Phase {
    NotStarted,
    /// Opening one endpoint source per interconnect group.
    Interconnects(GroupIter),
    /// Every interconnect group has a source; draw from them in turn.
    RoundRobin,
}

struct EndpointSource {
    ic_group_id: GroupId,
    ic_group: TargetGroup,
    groups: GroupIter,
}

pub struct Pairer {
    resolver: Arc<TargetResolver>,
    interconnects: Vec<(TargetRole, BTreeMap<String, AxisValue>)>,
    endpoints: Vec<(TargetRole, BTreeMap<String, AxisValue>)>,
    randomizer: Randomizer,
    config: PairingConfig,
    filter: Option<TargetGroupFilter>,
    phase: Phase,
    sources: Vec<EndpointSource>,
    cursor: usize,
    spins: u64,
    done: bool,
}

impl Pairer {
    pub fn new(
        resolver: Arc<TargetResolver>,
        roles: &BTreeMap<String, TargetRole>,
        permutation: &AxisPermutation,
        randomizer: Randomizer,
        config: PairingConfig,
    ) -> Self {
        let (interconnects, endpoints): (Vec<_>, Vec<_>) = roles
            .values()
            .map(|role| {
                let filter = resolver.axes_filter(permutation.role_values(role.name()));
                (role.clone(), filter)
            })
            .partition(|(role, _)| role.is_interconnect());
        Self {
            resolver,
            interconnects,
            endpoints,
            randomizer,
            config,
            filter: None,
            phase: Phase::NotStarted,
            sources: Vec::new(),
            cursor: 0,
            spins: 0,
            done: false,
        }
    }

    pub fn with_filter(mut self, filter: TargetGroupFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    fn groups(
        &self,
        roles: &[(TargetRole, BTreeMap<String, AxisValue>)],
        seed: Option<&TargetGroup>,
    ) -> Result<GroupIter, ResolveError> {
        let mut eligible: BTreeMap<String, EligibleSet> = BTreeMap::new();
        for (role, filter) in roles {
            let targets = self.resolver.resolve(role, filter, seed)?;
            if targets.is_empty() {
                tracing::debug!(
                    role = role.name(),
                    seed = %seed.map(|s| s.to_string()).unwrap_or_default(),
                    "No suitable target for role"
                );
                return Ok(GroupIter::exhausted());
            }
            eligible.insert(role.name().to_owned(), targets);
        }
        Ok(GroupIter::new(&eligible, self.randomizer, &self.config))
    }

    /// Index of the endpoint source to draw from next, opening a source for
    /// a new interconnect group while there are any left.
    fn next_source(&mut self) -> Result<Option<usize>, ResolveError> {
        if let Phase::NotStarted = self.phase {
            self.phase = Phase::Interconnects(self.groups(&self.interconnects, None)?);
        }
        if let Phase::Interconnects(ic_groups) = &mut self.phase {
            match ic_groups.next() {
                Some((ic_group_id, ic_group)) => {
                    tracing::debug!(%ic_group_id, interconnects = %ic_group, "Interconnect group");
                    let seed = if ic_group.is_empty() {
                        None
                    } else {
                        Some(&ic_group)
                    };
                    let groups = self.groups(&self.endpoints, seed)?;
                    self.sources.push(EndpointSource {
                        ic_group_id,
                        ic_group,
                        groups,
                    });
                    return Ok(Some(self.sources.len() - 1));
                }
                None => {
                    self.phase = Phase::RoundRobin;
                    self.cursor = 0;
                }
            }
        }
        if self.sources.is_empty() {
            return Ok(None);
        }
        if self.cursor >= self.sources.len() {
            self.cursor = 0;
        }
        Ok(Some(self.cursor))
    }
}

impl Iterator for Pairer {
    type Item = Result<PairedGroup, ResolveError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.spins > self.config.spin_max {
                tracing::warn!(spins = self.spins, "Giving up pairing after too many spins");
                self.done = true;
                return None;
            }
            let index = match self.next_source() {
                Ok(Some(index)) => index,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let source = &mut self.sources[index];
            match source.groups.next() {
                Some((group_id, group)) => {
                    if let Phase::RoundRobin = self.phase {
                        self.cursor = index + 1;
                    }
                    let ic_group_id = source.ic_group_id.clone();
                    let group = group.merge(&source.ic_group);
                    if let Some(filter) = &self.filter {
                        if !filter(&group_id, &ic_group_id, &group) {
                            tracing::trace!(%group_id, %ic_group_id, "Target group filtered out");
                            continue;
                        }
                    }
                    self.spins = self.spins * 4 / 5;
                    return Some(Ok(PairedGroup {
                        group_id,
                        ic_group_id,
                        group,
                    }));
                }
                None => {
                    tracing::debug!(
                        ic_group_id = %source.ic_group_id,
                        spins = self.spins,
                        "No more targets for interconnect group"
                    );
                    self.sources.remove(index);
                    self.spins += 1;
                }
            }
        }
    }
}
