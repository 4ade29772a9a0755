/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Enumeration of target groups from per-role candidate sets.
//!
//! Both iterators assign each role one of its candidates with no target
//! used twice, and never yield the same group id twice. They give up after
//! `spin_max` consecutive attempts that produce nothing new.

use std::collections::BTreeMap;
use std::collections::HashSet;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tcf_matrix::enumerator::Randomizer;

use crate::config::PairingConfig;
use crate::fullid::Fullid;
use crate::group::GroupId;
use crate::group::TargetGroup;
use crate::resolver::EligibleSet;

struct Limits {
    spin_max: u64,
    hash_length: usize,
}

impl Limits {
    fn new(config: &PairingConfig) -> Self {
        Self {
            spin_max: config.spin_max,
            hash_length: config.hash_length,
        }
    }
}

fn sorted_pools(eligible: &BTreeMap<String, EligibleSet>) -> Vec<(String, Vec<Fullid>)> {
    eligible
        .iter()
        .map(|(role, set)| (role.clone(), set.iter().cloned().collect()))
        .collect()
}

/// Depth-first over roles in name order, candidates in fullid order.
pub struct SortedGroupIter {
    pools: Vec<(String, Vec<Fullid>)>,
    /// Next candidate index to try at each depth.
    cursors: Vec<usize>,
    /// Target chosen at each depth above the deepest cursor.
    chosen: Vec<Fullid>,
    seen: HashSet<GroupId>,
    spins: u64,
    limits: Limits,
    done: bool,
}

impl SortedGroupIter {
    pub fn new(eligible: &BTreeMap<String, EligibleSet>, config: &PairingConfig) -> Self {
        let pools = sorted_pools(eligible);
        let done = pools.iter().any(|(_, pool)| pool.is_empty());
        Self {
            pools,
            cursors: vec![0],
            chosen: Vec::new(),
            seen: HashSet::new(),
            spins: 0,
            limits: Limits::new(config),
            done,
        }
    }

    fn group(&self) -> TargetGroup {
        TargetGroup::new(
            self.pools
                .iter()
                .zip(&self.chosen)
                .map(|((role, _), fullid)| (role.clone(), fullid.clone()))
                .collect(),
        )
    }
}

impl Iterator for SortedGroupIter {
    type Item = (GroupId, TargetGroup);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.pools.is_empty() {
            self.done = true;
            let group = TargetGroup::empty();
            return Some((group.id(self.limits.hash_length), group));
        }
        loop {
            let depth = self.cursors.len().checked_sub(1)?;
            let pool = &self.pools[depth].1;
            let cursor = &mut self.cursors[depth];
            let mut pick = None;
            while *cursor < pool.len() {
                let candidate = &pool[*cursor];
                *cursor += 1;
                if !self.chosen.contains(candidate) {
                    pick = Some(candidate.clone());
                    break;
                }
            }
            let Some(pick) = pick else {
                // Exhausted this depth; the parent moves to its next candidate.
                self.cursors.pop();
                self.chosen.pop();
                if self.cursors.is_empty() {
                    self.done = true;
                    return None;
                }
                continue;
            };
            self.chosen.push(pick);
            if self.chosen.len() < self.pools.len() {
                self.cursors.push(0);
                continue;
            }
            let group = self.group();
            self.chosen.pop();
            let id = group.id(self.limits.hash_length);
            if self.seen.insert(id.clone()) {
                self.spins = 0;
                return Some((id, group));
            }
            self.spins += 1;
            if self.spins > self.limits.spin_max {
                tracing::warn!(spins = self.spins, "Giving up on target groups after too many spins");
                self.done = true;
                return None;
            }
        }
    }
}

/// Random assignments, at most as many attempts as there are
/// combinations.
pub struct RandomGroupIter {
    pools: Vec<(String, Vec<Fullid>)>,
    rng: StdRng,
    attempts_left: u64,
    seen: HashSet<GroupId>,
    spins: u64,
    limits: Limits,
    empty_pending: bool,
}

impl RandomGroupIter {
    pub fn new(eligible: &BTreeMap<String, EligibleSet>, seed: u64, config: &PairingConfig) -> Self {
        let pools = sorted_pools(eligible);
        let attempts_left = pools
            .iter()
            .fold(1u64, |acc, (_, pool)| acc.saturating_mul(pool.len() as u64));
        Self {
            empty_pending: pools.is_empty(),
            pools,
            rng: StdRng::seed_from_u64(seed),
            attempts_left,
            seen: HashSet::new(),
            spins: 0,
            limits: Limits::new(config),
        }
    }

    fn attempt(&mut self) -> Option<TargetGroup> {
        let mut group = TargetGroup::empty();
        for (role, pool) in &self.pools {
            let remaining: Vec<&Fullid> = pool.iter().filter(|f| !group.contains_target(f)).collect();
            if remaining.is_empty() {
                return None;
            }
            let pick = remaining[self.rng.gen_range(0..remaining.len())];
            group.insert(role, pick.clone());
        }
        Some(group)
    }
}

impl Iterator for RandomGroupIter {
    type Item = (GroupId, TargetGroup);

    fn next(&mut self) -> Option<Self::Item> {
        if self.empty_pending {
            self.empty_pending = false;
            self.attempts_left = 0;
            let group = TargetGroup::empty();
            return Some((group.id(self.limits.hash_length), group));
        }
        while self.attempts_left > 0 {
            self.attempts_left -= 1;
            if let Some(group) = self.attempt() {
                let id = group.id(self.limits.hash_length);
                if self.seen.insert(id.clone()) {
                    self.spins = 0;
                    return Some((id, group));
                }
            }
            self.spins += 1;
            if self.spins > self.limits.spin_max {
                tracing::warn!(spins = self.spins, "Giving up on target groups after too many spins");
                self.attempts_left = 0;
            }
        }
        None
    }
}

/// Sorted or random group enumeration, picked by a [`Randomizer`].
pub enum GroupIter {
    Sorted(SortedGroupIter),
    Random(RandomGroupIter),
}

impl GroupIter {
    pub fn new(
        eligible: &BTreeMap<String, EligibleSet>,
        randomizer: Randomizer,
        config: &PairingConfig,
    ) -> Self {
        match randomizer {
            Randomizer::Sequential => GroupIter::Sorted(SortedGroupIter::new(eligible, config)),
            Randomizer::Seeded(seed) => {
                GroupIter::Random(RandomGroupIter::new(eligible, seed, config))
            }
            Randomizer::Random => {
                let seed = rand::random::<u64>();
                tracing::debug!(seed, "Randomizing target groups");
                GroupIter::Random(RandomGroupIter::new(eligible, seed, config))
            }
        }
    }

    /// Yields nothing.
    pub fn exhausted() -> Self {
        let mut iter = SortedGroupIter::new(&BTreeMap::new(), &PairingConfig::default());
        iter.done = true;
        GroupIter::Sorted(iter)
    }
}

impl Iterator for GroupIter {
    type Item = (GroupId, TargetGroup);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            GroupIter::Sorted(iter) => iter.next(),
            GroupIter::Random(iter) => iter.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use maplit::btreemap;

    use super::*;

    fn pool(ids: &[&str]) -> EligibleSet {
        Arc::new(
            ids.iter()
                .map(|id| Fullid::parse(id).unwrap())
                .collect::<BTreeSet<_>>(),
        )
    }

    fn client_server() -> BTreeMap<String, EligibleSet> {
        btreemap! {
            "client".to_owned() => pool(&["s/t1", "s/t2", "s/t3"]),
            "server".to_owned() => pool(&["s/t1", "s/t2", "s/t3"]),
        }
    }

    fn render(group: &TargetGroup) -> String {
        group.to_string()
    }

    #[test]
    fn test_sorted_client_server() {
        let groups: Vec<String> = SortedGroupIter::new(&client_server(), &PairingConfig::default())
            .map(|(_, g)| render(&g))
            .collect();
        assert_eq!(
            vec![
                "client=s/t1,server=s/t2",
                "client=s/t1,server=s/t3",
                "client=s/t2,server=s/t1",
                "client=s/t2,server=s/t3",
                "client=s/t3,server=s/t1",
                "client=s/t3,server=s/t2",
            ],
            groups
        );
    }

    #[test]
    fn test_random_client_server() {
        let config = PairingConfig::default();
        let groups: Vec<(GroupId, TargetGroup)> =
            RandomGroupIter::new(&client_server(), 42, &config).collect();
        assert!(groups.len() <= 9);
        assert!(!groups.is_empty());
        let ids: HashSet<&GroupId> = groups.iter().map(|(id, _)| id).collect();
        assert_eq!(groups.len(), ids.len());
        for (_, group) in &groups {
            assert_ne!(group.get("client"), group.get("server"));
        }

        // Same seed, same sequence.
        let again: Vec<(GroupId, TargetGroup)> =
            RandomGroupIter::new(&client_server(), 42, &config).collect();
        assert_eq!(groups, again);
    }

    #[test]
    fn test_no_roles_yields_one_empty_group() {
        let config = PairingConfig::default();
        let sorted: Vec<_> = SortedGroupIter::new(&BTreeMap::new(), &config).collect();
        assert_eq!(1, sorted.len());
        assert!(sorted[0].1.is_empty());
        let random: Vec<_> = RandomGroupIter::new(&BTreeMap::new(), 1, &config).collect();
        assert_eq!(1, random.len());
        assert_eq!(sorted[0].0, random[0].0);
    }

    #[test]
    fn test_empty_pool_yields_nothing() {
        let eligible = btreemap! {
            "a".to_owned() => pool(&["s/t1"]),
            "b".to_owned() => pool(&[]),
        };
        let config = PairingConfig::default();
        assert_eq!(0, SortedGroupIter::new(&eligible, &config).count());
        assert_eq!(0, RandomGroupIter::new(&eligible, 7, &config).count());
    }

    #[test]
    fn test_too_few_targets() {
        // Two roles competing for a single target can never both be filled.
        let eligible = btreemap! {
            "a".to_owned() => pool(&["s/t1"]),
            "b".to_owned() => pool(&["s/t1"]),
        };
        let config = PairingConfig {
            spin_max: 0,
            ..PairingConfig::default()
        };
        assert_eq!(0, SortedGroupIter::new(&eligible, &config).count());
        assert_eq!(0, RandomGroupIter::new(&eligible, 7, &config).count());
    }

    #[test]
    fn test_exhausted() {
        assert_eq!(0, GroupIter::exhausted().count());
    }
}
