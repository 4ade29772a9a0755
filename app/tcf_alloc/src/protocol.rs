/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! JSON bodies of the allocation endpoints.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;

use crate::state::AllocId;
use crate::state::AllocationState;

pub const CREATE_PATH: &str = "allocation";
pub const KEEPALIVE_PATH: &str = "keepalive-v2";

pub fn remove_path(allocid: &AllocId) -> String {
    format!("allocation/{}", allocid)
}

/// When the server may reclaim an allocation regardless of keepalives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endtime {
    /// Kept for as long as keepalives arrive.
    Static,
    At(NaiveDateTime),
}

impl Serialize for Endtime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Endtime::Static => serializer.serialize_str("static"),
            Endtime::At(at) => serializer.collect_str(&at.format("%Y%m%d%H%M%S")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateRequest {
    pub queue: bool,
    /// Group name to the target ids, on this server, it needs.
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preempt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obo_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endtime: Option<Endtime>,
}

impl CreateRequest {
    /// A queued request for `groups`; a group naming the same set of
    /// targets as an earlier one (by name order) is left out, as servers
    /// refuse such requests.
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        let mut seen = BTreeSet::new();
        let groups = groups
            .into_iter()
            .filter(|(name, targets)| {
                let set: BTreeSet<String> = targets.iter().cloned().collect();
                let fresh = seen.insert(set);
                if !fresh {
                    tracing::debug!(group = %name, "Dropping group with duplicate target set");
                }
                fresh
            })
            .collect();
        Self {
            queue: true,
            groups,
            priority: None,
            preempt: None,
            reason: None,
            obo_user: None,
            extra_data: None,
            endtime: None,
        }
    }
}

/// States come in as strings so one unknown value does not fail the whole
/// body.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct CreateResponse {
    pub allocid: Option<String>,
    pub state: Option<String>,
    pub group_allocated_name: Option<String>,
    #[serde(rename = "_message")]
    pub message: Option<String>,
}

pub type KeepaliveRequest = BTreeMap<AllocId, AllocationState>;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KeepaliveChange {
    pub state: Option<String>,
    pub group_allocated_name: Option<String>,
}

/// Only the allocations whose state changed are listed.
pub type KeepaliveResponse = BTreeMap<String, KeepaliveChange>;

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use maplit::btreemap;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_create_request_body() -> anyhow::Result<()> {
        let mut request = CreateRequest::new(btreemap! {
            "g1".to_owned() => vec!["t1".to_owned(), "t2".to_owned()],
            "g2".to_owned() => vec!["t2".to_owned(), "t1".to_owned()],
            "g3".to_owned() => vec!["t3".to_owned()],
        });
        request.priority = Some(500);
        request.reason = Some("run-1".to_owned());
        request.endtime = Some(Endtime::At(
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .and_then(|d| d.and_hms_opt(13, 5, 9))
                .unwrap(),
        ));
        assert_eq!(
            json!({
                "queue": true,
                "groups": {"g1": ["t1", "t2"], "g3": ["t3"]},
                "priority": 500,
                "reason": "run-1",
                "endtime": "20240301130509",
            }),
            serde_json::to_value(&request)?
        );

        request.endtime = Some(Endtime::Static);
        assert_eq!(json!("static"), serde_json::to_value(&request)?["endtime"]);
        Ok(())
    }

    #[test]
    fn test_responses() -> anyhow::Result<()> {
        let created: CreateResponse = serde_json::from_value(json!({
            "allocid": "a1", "state": "rejected", "_message": "no such target"
        }))?;
        assert_eq!(Some("no such target"), created.message.as_deref());

        let changes: KeepaliveResponse = serde_json::from_value(json!({
            "a1": {"state": "active", "group_allocated_name": "g1"},
            "a2": {"state": "timedout"},
        }))?;
        assert_eq!(Some("g1"), changes["a1"].group_allocated_name.as_deref());
        assert_eq!(None, changes["a2"].group_allocated_name);

        let request: KeepaliveRequest = btreemap! { AllocId::new("a1") => AllocationState::Queued };
        assert_eq!(json!({"a1": "queued"}), serde_json::to_value(&request)?);
        Ok(())
    }
}
