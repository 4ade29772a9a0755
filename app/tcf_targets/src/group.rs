/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use derive_more::Display;
use dupe::Dupe;
use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::fullid::Fullid;
use crate::fullid::ServerId;

/// Short hash naming a target group; equal assignments get equal ids.
#[derive(
    Clone, Dupe, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize
)]
#[display(fmt = "{}", _0)]
pub struct GroupId(Arc<str>);

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Role name to target assignment with no target used twice.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetGroup {
    assignment: BTreeMap<String, Fullid>,
}

impl TargetGroup {
    pub fn new(assignment: BTreeMap<String, Fullid>) -> Self {
        Self { assignment }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.assignment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignment.is_empty()
    }

    pub fn get(&self, role: &str) -> Option<&Fullid> {
        self.assignment.get(role)
    }

    /// Roles in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Fullid)> {
        self.assignment.iter().map(|(r, f)| (r.as_str(), f))
    }

    pub fn targets(&self) -> BTreeSet<&Fullid> {
        self.assignment.values().collect()
    }

    pub fn contains_target(&self, fullid: &Fullid) -> bool {
        self.assignment.values().any(|f| f == fullid)
    }

    pub(crate) fn insert(&mut self, role: &str, fullid: Fullid) {
        self.assignment.insert(role.to_owned(), fullid);
    }

    pub(crate) fn remove(&mut self, role: &str) {
        self.assignment.remove(role);
    }

    /// Roles of both groups; `other` wins on a role clash.
    pub fn merge(&self, other: &TargetGroup) -> TargetGroup {
        let mut assignment = self.assignment.clone();
        assignment.extend(other.assignment.iter().map(|(r, f)| (r.clone(), f.dupe())));
        TargetGroup { assignment }
    }

    /// Hash over the sorted `(role, target)` pairs, `length` hex digits long.
    pub fn id(&self, length: usize) -> GroupId {
        let mut hasher = Sha256::new();
        for (role, fullid) in &self.assignment {
            hasher.update(role.as_bytes());
            hasher.update([0u8]);
            hasher.update(fullid.as_str().as_bytes());
            hasher.update([0u8]);
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(length.clamp(1, 64));
        GroupId(Arc::from(digest))
    }

    /// Target ids of the group, per owning server.
    pub fn by_server(&self) -> BTreeMap<ServerId, Vec<String>> {
        let mut out: BTreeMap<ServerId, Vec<String>> = BTreeMap::new();
        for fullid in self.assignment.values() {
            out.entry(fullid.server())
                .or_default()
                .push(fullid.target_id().to_owned());
        }
        for ids in out.values_mut() {
            ids.sort();
        }
        out
    }
}

impl fmt::Display for TargetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.assignment
                .iter()
                .map(|(r, t)| format!("{}={}", r, t))
                .join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    fn f(s: &str) -> Fullid {
        Fullid::parse(s).unwrap()
    }

    #[test]
    fn test_id_is_stable_and_sized() {
        let a = TargetGroup::new(btreemap! {
            "client".to_owned() => f("s1/t1"),
            "server".to_owned() => f("s1/t2"),
        });
        let mut b = TargetGroup::empty();
        b.insert("server", f("s1/t2"));
        b.insert("client", f("s1/t1"));
        assert_eq!(a.id(10), b.id(10));
        assert_eq!(10, a.id(10).as_str().len());

        let swapped = TargetGroup::new(btreemap! {
            "client".to_owned() => f("s1/t2"),
            "server".to_owned() => f("s1/t1"),
        });
        assert_ne!(a.id(10), swapped.id(10));
    }

    #[test]
    fn test_by_server_and_display() {
        let g = TargetGroup::new(btreemap! {
            "a".to_owned() => f("s2/x"),
            "b".to_owned() => f("s1/z"),
            "c".to_owned() => f("s1/y"),
        });
        assert_eq!(
            btreemap! {
                ServerId::new("s1") => vec!["y".to_owned(), "z".to_owned()],
                ServerId::new("s2") => vec!["x".to_owned()],
            },
            g.by_server()
        );
        assert_eq!("a=s2/x,b=s1/z,c=s1/y", g.to_string());
    }

    #[test]
    fn test_merge() {
        let ic = TargetGroup::new(btreemap! { "ic".to_owned() => f("s1/nwa") });
        let ep = TargetGroup::new(btreemap! { "target".to_owned() => f("s1/t1") });
        let merged = ic.merge(&ep);
        assert_eq!(2, merged.len());
        assert!(merged.contains_target(&f("s1/nwa")));
        assert_eq!(Some(&f("s1/t1")), merged.get("target"));
    }
}
