/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Book-keeping owned by the manager's coordinating task.
//!
//! [`AllocationMap`] tracks every live allocation per server. [`RunLedger`]
//! tracks, for one run, which allocations each candidate group still waits
//! for and which groups were launched. Neither does I/O.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use dupe::Dupe;
use serde::Serialize;
use tcf_targets::ServerId;
use tcf_targets::TargetGroup;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::AllocationError;
use crate::protocol::KeepaliveRequest;
use crate::state::AllocId;
use crate::state::AllocationState;
use crate::state::RunId;

pub type AllocKey = (ServerId, AllocId);

#[derive(Debug, Clone)]
pub struct AllocationEntry {
    pub run: RunId,
    /// Group names this allocation was requested for.
    pub groups: Vec<String>,
    pub state: AllocationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationSummary {
    pub server: ServerId,
    pub allocid: AllocId,
    pub run: RunId,
    pub state: AllocationState,
    pub groups: Vec<String>,
}

#[derive(Debug, Default)]
pub struct AllocationMap {
    servers: BTreeMap<ServerId, BTreeMap<AllocId, AllocationEntry>>,
}

impl AllocationMap {
    pub fn insert(&mut self, server: ServerId, allocid: AllocId, entry: AllocationEntry) {
        self.servers.entry(server).or_default().insert(allocid, entry);
    }

    pub fn get(&self, server: &ServerId, allocid: &AllocId) -> Option<&AllocationEntry> {
        self.servers.get(server).and_then(|s| s.get(allocid))
    }

    pub fn get_mut(
        &mut self,
        server: &ServerId,
        allocid: &AllocId,
    ) -> Option<&mut AllocationEntry> {
        self.servers.get_mut(server).and_then(|s| s.get_mut(allocid))
    }

    /// Forgets an allocation; servers left with none are dropped so they
    /// get no keepalives.
    pub fn remove(&mut self, server: &ServerId, allocid: &AllocId) -> Option<AllocationEntry> {
        let allocations = self.servers.get_mut(server)?;
        let entry = allocations.remove(allocid);
        if allocations.is_empty() {
            self.servers.remove(server);
        }
        entry
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.values().map(|s| s.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerId, &AllocId, &AllocationEntry)> {
        self.servers.iter().flat_map(|(server, allocations)| {
            allocations
                .iter()
                .map(move |(allocid, entry)| (server, allocid, entry))
        })
    }

    pub fn of_run(&self, run: &RunId) -> Vec<AllocKey> {
        self.iter()
            .filter(|(_, _, entry)| &entry.run == run)
            .map(|(server, allocid, _)| (server.dupe(), allocid.dupe()))
            .collect()
    }

    /// One keepalive body per server: every allocation with its last known
    /// state.
    pub fn keepalive_requests(&self) -> Vec<(ServerId, KeepaliveRequest)> {
        self.servers
            .iter()
            .map(|(server, allocations)| {
                (
                    server.dupe(),
                    allocations
                        .iter()
                        .map(|(allocid, entry)| (allocid.dupe(), entry.state))
                        .collect(),
                )
            })
            .collect()
    }

    pub fn summaries(&self) -> Vec<AllocationSummary> {
        self.iter()
            .map(|(server, allocid, entry)| AllocationSummary {
                server: server.dupe(),
                allocid: allocid.dupe(),
                run: entry.run.dupe(),
                state: entry.state,
                groups: entry.groups.clone(),
            })
            .collect()
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub launched: u64,
    /// Errors that cost the run an allocation but not necessarily the run.
    pub failures: Vec<Arc<AllocationError>>,
    /// Set when the run launched nothing, or was stopped, because of an
    /// error.
    pub blocked: Option<Arc<AllocationError>>,
}

/// What an activation means for the run.
#[derive(Debug, PartialEq, Eq)]
pub enum Activation {
    /// The group is not (or no longer) a candidate.
    Unknown,
    /// Other servers still have to grant their part of the group.
    Waiting,
    /// Enough groups already launched; these allocations are not needed.
    Surplus(Vec<AllocKey>),
    Launch {
        allocations: Vec<AllocKey>,
        /// The run needs no more groups after this one.
        enough: bool,
    },
}

pub struct RunLedger {
    /// Groups to launch; zero means every group that activates.
    needed: u64,
    launched: u64,
    groups: BTreeMap<String, TargetGroup>,
    /// Candidate groups still waiting, with the allocations they wait for.
    pending: BTreeMap<String, BTreeSet<AllocKey>>,
    /// Allocations already granted for a pending group.
    granted: BTreeMap<String, BTreeSet<AllocKey>>,
    /// Launched groups whose execution is still going, and their
    /// allocations.
    running: BTreeMap<String, Vec<AllocKey>>,
    /// Creation requests not answered yet.
    creating: usize,
    /// Allocations created so far, with the groups each was asked for.
    created: Vec<(AllocKey, Vec<String>)>,
    /// Activations seen while creation requests were still out.
    deferred: Vec<(AllocKey, String)>,
    abandoned: bool,
    pub deadline: Option<Instant>,
    pub started: Instant,
    pub failures: Vec<Arc<AllocationError>>,
    pub blocked: Option<Arc<AllocationError>>,
    outcome: Option<oneshot::Sender<RunOutcome>>,
}

impl RunLedger {
    pub fn new(
        needed: u64,
        groups: BTreeMap<String, TargetGroup>,
        deadline: Option<Instant>,
        outcome: oneshot::Sender<RunOutcome>,
    ) -> Self {
        Self {
            needed,
            launched: 0,
            groups,
            pending: BTreeMap::new(),
            granted: BTreeMap::new(),
            running: BTreeMap::new(),
            creating: 0,
            created: Vec::new(),
            deferred: Vec::new(),
            abandoned: false,
            deadline,
            started: Instant::now(),
            failures: Vec::new(),
            blocked: None,
            outcome: Some(outcome),
        }
    }

    pub fn group(&self, name: &str) -> Option<&TargetGroup> {
        self.groups.get(name)
    }

    pub fn launched(&self) -> u64 {
        self.launched
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    fn enough(&self) -> bool {
        self.needed > 0 && self.launched >= self.needed
    }

    pub fn expect_creates(&mut self, requests: usize) {
        self.creating += requests;
    }

    pub fn is_creating(&self) -> bool {
        self.creating > 0
    }

    /// `key` was created for `requested`; tracked once every creation
    /// request is answered.
    pub fn created(&mut self, key: AllocKey, requested: Vec<String>) {
        self.created.push((key, requested));
    }

    /// Counts one answered creation request. Returns whether that was the
    /// last one.
    pub fn create_answered(&mut self) -> bool {
        self.creating = self.creating.saturating_sub(1);
        self.creating == 0
    }

    pub fn defer_activation(&mut self, key: AllocKey, group: String) {
        self.deferred.push((key, group));
    }

    /// Tracks everything created and hands back the activations that
    /// arrived meanwhile.
    pub fn finish_creating(&mut self) -> Vec<(AllocKey, String)> {
        let created = std::mem::take(&mut self.created);
        if !self.abandoned {
            self.track(&created);
        }
        std::mem::take(&mut self.deferred)
    }

    /// Records the allocations created for the run. A group becomes a
    /// candidate only if every server it spans has an allocation naming
    /// it.
    pub fn track(&mut self, created: &[(AllocKey, Vec<String>)]) {
        for (name, group) in &self.groups {
            let servers: BTreeSet<ServerId> = group.by_server().into_keys().collect();
            let waiting: BTreeSet<AllocKey> = created
                .iter()
                .filter(|(_, requested)| requested.contains(name))
                .map(|(key, _)| key.clone())
                .collect();
            let covered: BTreeSet<&ServerId> = waiting.iter().map(|(s, _)| s).collect();
            if !servers.is_empty() && covered.len() == servers.len() {
                self.pending.insert(name.clone(), waiting);
            } else {
                tracing::debug!(group = %name, "Group has no allocation on some of its servers");
            }
        }
    }

    pub fn is_candidate(&self, group: &str) -> bool {
        self.pending.contains_key(group)
    }

    pub fn has_candidates(&self) -> bool {
        !self.pending.is_empty()
    }

    /// `key`, requested for `requested`, was granted for `group`.
    pub fn activate(&mut self, key: &AllocKey, group: &str, requested: &[String]) -> Activation {
        let Some(waiting) = self.pending.get_mut(group) else {
            return Activation::Unknown;
        };
        if !waiting.remove(key) {
            return Activation::Unknown;
        }
        self.granted
            .entry(group.to_owned())
            .or_default()
            .insert(key.clone());
        // The allocation is now bound to `group`; groups that also needed
        // it can no longer complete.
        for other in requested.iter().filter(|g| g.as_str() != group) {
            self.drop_candidate(other);
        }
        if self.pending.get(group).is_some_and(|w| !w.is_empty()) {
            return Activation::Waiting;
        }
        self.pending.remove(group);
        let allocations: Vec<AllocKey> = self
            .granted
            .remove(group)
            .unwrap_or_default()
            .into_iter()
            .collect();
        if self.enough() {
            return Activation::Surplus(allocations);
        }
        self.launched += 1;
        self.running.insert(group.to_owned(), allocations.clone());
        let enough = self.enough();
        if enough {
            self.pending.clear();
        }
        Activation::Launch {
            allocations,
            enough,
        }
    }

    /// Launches `group` right away if it spans no server and the run still
    /// needs groups. Returns whether the run then has enough.
    pub fn launch_unallocated(&mut self, group: &str) -> Option<bool> {
        if self.enough() || !self.groups.get(group).is_some_and(|g| g.is_empty()) {
            return None;
        }
        self.launched += 1;
        self.running.insert(group.to_owned(), Vec::new());
        let enough = self.enough();
        if enough {
            self.abandon();
        }
        Some(enough)
    }

    fn drop_candidate(&mut self, group: &str) {
        if self.pending.remove(group).is_some() {
            tracing::debug!(group, "Group can no longer be allocated");
        }
        self.granted.remove(group);
    }

    /// `key` is gone; groups depending on it stop being candidates.
    pub fn lose(&mut self, key: &AllocKey) {
        self.created.retain(|(k, _)| k != key);
        self.deferred.retain(|(k, _)| k != key);
        let lost: Vec<String> = self
            .pending
            .iter()
            .filter(|(name, waiting)| {
                waiting.contains(key) || self.granted.get(*name).is_some_and(|g| g.contains(key))
            })
            .map(|(name, _)| name.clone())
            .collect();
        for group in lost {
            self.drop_candidate(&group);
        }
    }

    /// Allocations backing a running group, when it finished.
    pub fn finish_group(&mut self, group: &str) -> Vec<AllocKey> {
        self.running.remove(group).unwrap_or_default()
    }

    /// Whether `key` backs a launched group.
    pub fn is_running(&self, key: &AllocKey) -> bool {
        self.running.values().any(|keys| keys.contains(key))
    }

    /// Stops considering any candidate.
    pub fn abandon(&mut self) {
        self.abandoned = true;
        self.pending.clear();
        self.granted.clear();
    }

    pub fn complete(&mut self) -> Option<oneshot::Sender<RunOutcome>> {
        self.outcome.take()
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use tcf_targets::Fullid;

    use super::*;

    fn group(targets: &[(&str, &str)]) -> TargetGroup {
        TargetGroup::new(
            targets
                .iter()
                .map(|(role, f)| ((*role).to_owned(), Fullid::parse(f).unwrap()))
                .collect(),
        )
    }

    fn key(server: &str, allocid: &str) -> AllocKey {
        (ServerId::new(server), AllocId::new(allocid))
    }

    fn ledger(needed: u64, groups: BTreeMap<String, TargetGroup>) -> RunLedger {
        let (tx, _rx) = oneshot::channel();
        RunLedger::new(needed, groups, None, tx)
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[tokio::test]
    async fn test_group_across_servers() {
        let mut ledger = ledger(
            1,
            btreemap! {
                "g1".to_owned() => group(&[("client", "s1/a"), ("server", "s2/b")]),
            },
        );
        ledger.track(&[
            (key("s1", "x"), names(&["g1"])),
            (key("s2", "y"), names(&["g1"])),
        ]);
        assert_eq!(
            Activation::Waiting,
            ledger.activate(&key("s1", "x"), "g1", &names(&["g1"]))
        );
        assert_eq!(
            Activation::Launch {
                allocations: vec![key("s1", "x"), key("s2", "y")],
                enough: true,
            },
            ledger.activate(&key("s2", "y"), "g1", &names(&["g1"]))
        );
        assert_eq!(1, ledger.launched());
        assert!(ledger.is_running(&key("s1", "x")));
        assert_eq!(2, ledger.finish_group("g1").len());
    }

    #[tokio::test]
    async fn test_uncovered_group_is_not_a_candidate() {
        let mut ledger = ledger(
            1,
            btreemap! {
                "g1".to_owned() => group(&[("client", "s1/a"), ("server", "s2/b")]),
                "g2".to_owned() => group(&[("client", "s1/c")]),
            },
        );
        // Creation on s2 failed.
        ledger.track(&[(key("s1", "x"), names(&["g1", "g2"]))]);
        assert!(!ledger.is_candidate("g1"));
        assert!(ledger.is_candidate("g2"));
    }

    #[tokio::test]
    async fn test_surplus_and_bound_allocations() {
        let mut ledger = ledger(
            1,
            btreemap! {
                "g1".to_owned() => group(&[("target", "s1/a")]),
                "g2".to_owned() => group(&[("target", "s1/b")]),
                "g3".to_owned() => group(&[("target", "s2/c")]),
            },
        );
        ledger.track(&[
            (key("s1", "x"), names(&["g1", "g2"])),
            (key("s2", "y"), names(&["g3"])),
        ]);
        assert_eq!(
            Activation::Launch {
                allocations: vec![key("s1", "x")],
                enough: true,
            },
            ledger.activate(&key("s1", "x"), "g1", &names(&["g1", "g2"]))
        );
        assert!(!ledger.has_candidates());
        assert_eq!(
            Activation::Unknown,
            ledger.activate(&key("s2", "y"), "g3", &names(&["g3"]))
        );
    }

    #[tokio::test]
    async fn test_lose() {
        let mut ledger = ledger(
            0,
            btreemap! {
                "g1".to_owned() => group(&[("target", "s1/a")]),
                "g2".to_owned() => group(&[("target", "s2/b")]),
            },
        );
        ledger.track(&[
            (key("s1", "x"), names(&["g1"])),
            (key("s2", "y"), names(&["g2"])),
        ]);
        ledger.lose(&key("s1", "x"));
        assert!(!ledger.is_candidate("g1"));
        assert!(ledger.is_candidate("g2"));
    }

    #[tokio::test]
    async fn test_activation_waits_for_every_creation() {
        let mut ledger = ledger(
            1,
            btreemap! {
                "g1".to_owned() => group(&[("client", "s1/a"), ("server", "s2/b")]),
            },
        );
        ledger.expect_creates(2);
        ledger.created(key("s1", "x"), names(&["g1"]));
        assert!(!ledger.create_answered());
        ledger.defer_activation(key("s1", "x"), "g1".to_owned());
        assert!(ledger.is_creating());
        assert!(!ledger.is_candidate("g1"));

        ledger.created(key("s2", "y"), names(&["g1"]));
        assert!(ledger.create_answered());
        assert_eq!(
            vec![(key("s1", "x"), "g1".to_owned())],
            ledger.finish_creating()
        );
        assert!(ledger.is_candidate("g1"));
    }

    #[tokio::test]
    async fn test_abandoned_while_creating() {
        let mut ledger = ledger(
            1,
            btreemap! { "g1".to_owned() => group(&[("target", "s1/a")]) },
        );
        ledger.expect_creates(1);
        ledger.abandon();
        ledger.created(key("s1", "x"), names(&["g1"]));
        assert!(ledger.create_answered());
        assert!(ledger.finish_creating().is_empty());
        assert!(!ledger.has_candidates());
    }

    #[tokio::test]
    async fn test_unallocated_group() {
        let mut ledger = ledger(
            1,
            btreemap! {
                "empty".to_owned() => TargetGroup::empty(),
                "g1".to_owned() => group(&[("target", "s1/a")]),
            },
        );
        assert_eq!(None, ledger.launch_unallocated("g1"));
        assert_eq!(Some(true), ledger.launch_unallocated("empty"));
        assert_eq!(1, ledger.running());
        assert!(ledger.finish_group("empty").is_empty());
        assert_eq!(None, ledger.launch_unallocated("empty"));
    }

    #[test]
    fn test_map_keepalive_bodies() {
        let mut map = AllocationMap::default();
        let entry = |state| AllocationEntry {
            run: RunId::new("r"),
            groups: names(&["g1"]),
            state,
        };
        map.insert(ServerId::new("s1"), AllocId::new("a"), entry(AllocationState::Queued));
        map.insert(ServerId::new("s1"), AllocId::new("b"), entry(AllocationState::Active));
        map.insert(ServerId::new("s2"), AllocId::new("c"), entry(AllocationState::Queued));
        let bodies = map.keepalive_requests();
        assert_eq!(2, bodies.len());
        assert_eq!(
            btreemap! {
                AllocId::new("a") => AllocationState::Queued,
                AllocId::new("b") => AllocationState::Active,
            },
            bodies[0].1
        );
        assert_eq!(3, map.of_run(&RunId::new("r")).len());

        map.remove(&ServerId::new("s2"), &AllocId::new("c"));
        assert_eq!(1, map.keepalive_requests().len());
        assert!(map.remove(&ServerId::new("s2"), &AllocId::new("c")).is_none());
    }
}
